//! Error types for picfetch
//!
//! Pipeline stages return a result type rather than relying on panics for
//! control flow. The executor converts the first failure into the request's
//! terminal error outcome.
//!
//! All errors use the `thiserror` crate for minimal boilerplate and proper
//! error trait implementations. The top-level [`Error`] is `Clone` because a
//! single-flight execution shares its outcome, success or failure, with every
//! waiter attached to the same cache key.

use crate::control::Stage;
use crate::request::Depth;
use thiserror::Error;

/// Result type alias for picfetch operations
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for picfetch
#[derive(Error, Debug, Clone)]
pub enum Error {
  /// Invalid configuration, rejected at builder time before any I/O
  #[error("Config error: {0}")]
  Config(#[from] ConfigError),

  /// Fetch failure (source not found, unreadable bytes)
  #[error("Fetch error: {0}")]
  Fetch(#[from] FetchError),

  /// Decode failure (malformed bytes, invalid intrinsic size)
  #[error("Decode error: {0}")]
  Decode(#[from] DecodeError),

  /// Disk cache I/O failure
  #[error("Cache error: {0}")]
  Cache(#[from] CacheError),

  /// The request's uri is empty
  #[error("Image uri is empty")]
  UriEmpty,

  /// The request's configured depth forbids the stage that would have been
  /// required to produce a result.
  ///
  /// A distinct kind so callers can branch on "failed because policy forbade
  /// network" versus a genuine fetch failure.
  #[error("Depth {depth:?} forbids {stage}")]
  DepthForbidden { depth: Depth, stage: Stage },

  /// The owning job was cancelled before the pipeline completed
  #[error("Cancelled at {stage}")]
  Cancelled { stage: Stage },

  /// Generic error for miscellaneous issues
  #[error("{0}")]
  Other(String),
}

impl Error {
  /// Returns `true` if this failure was caused by a depth policy rather than
  /// a genuine fetch/decode problem.
  pub fn is_depth_forbidden(&self) -> bool {
    matches!(self, Error::DepthForbidden { .. })
  }

  /// Returns `true` if this failure was caused by cancellation.
  pub fn is_cancelled(&self) -> bool {
    matches!(self, Error::Cancelled { .. })
  }
}

/// Invalid builder configuration
///
/// These fail fast before the cache or engine performs any I/O.
#[derive(Error, Debug, Clone)]
pub enum ConfigError {
  /// Cache byte budget must be positive
  #[error("maxSize must be greater than 0, got {size}")]
  InvalidMaxSize { size: u64 },

  /// App version outside the persistable range
  #[error("appVersion must be in 1..={max}, got {version}", max = i16::MAX)]
  InvalidAppVersion { version: u32 },

  /// Size multiplier must be positive and finite
  #[error("sizeMultiplier must be positive and finite, got {multiplier}")]
  InvalidSizeMultiplier { multiplier: f32 },
}

/// Errors from the disk cache.
///
/// `std::io::Error` is not `Clone`, so the underlying reason is captured as
/// text at the failure site.
#[derive(Error, Debug, Clone)]
pub enum CacheError {
  /// An I/O operation against the cache directory failed
  #[error("{context}: {reason}")]
  Io { context: String, reason: String },
}

impl CacheError {
  pub fn io(context: impl Into<String>, err: &std::io::Error) -> Self {
    CacheError::Io {
      context: context.into(),
      reason: err.to_string(),
    }
  }
}

/// Errors that occur while fetching source bytes
#[derive(Error, Debug, Clone)]
pub enum FetchError {
  /// No registered fetcher factory applies to the request uri
  #[error("No fetcher supports uri: {uri}")]
  NoFetcher { uri: String },

  /// The source could not be read
  #[error("Failed to read '{uri}': {reason}")]
  ReadFailed { uri: String, reason: String },

  /// Malformed data: uri
  #[error("Invalid data url: {reason}")]
  InvalidDataUrl { reason: String },
}

/// Errors that occur while decoding fetched bytes into an image
#[derive(Error, Debug, Clone)]
pub enum DecodeError {
  /// No registered decoder factory recognized the sniffed header bytes
  #[error("No decoder supports content of '{uri}'")]
  NoDecoder { uri: String },

  /// Bytes are recognized but malformed
  #[error("Failed to decode '{uri}': {reason}")]
  DecodeFailed { uri: String, reason: String },

  /// The decoded image is unusable (zero or negative intrinsic size)
  #[error("Invalid image from '{uri}': {reason}")]
  ImageInvalid { uri: String, reason: String },

  /// A transformation failed
  #[error("Transformation '{key}' failed: {reason}")]
  TransformFailed { key: String, reason: String },
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn depth_forbidden_is_recognizable() {
    let err = Error::DepthForbidden {
      depth: Depth::Local,
      stage: Stage::Fetch,
    };
    assert!(err.is_depth_forbidden());
    assert!(!err.is_cancelled());

    let err = Error::Fetch(FetchError::NoFetcher {
      uri: "test://a".to_string(),
    });
    assert!(!err.is_depth_forbidden());
  }

  #[test]
  fn errors_format_with_context() {
    let err = Error::Decode(DecodeError::ImageInvalid {
      uri: "file:///a.png".to_string(),
      reason: "width or height is 0".to_string(),
    });
    let text = err.to_string();
    assert!(text.contains("file:///a.png"), "unexpected: {text}");
    assert!(text.contains("width or height is 0"), "unexpected: {text}");
  }
}
