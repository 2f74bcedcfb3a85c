//! Fetching raw image bytes from a uri.
//!
//! A [`Fetcher`] turns one uri into a [`FetchResult`]. Fetchers are created
//! per request by [`FetcherFactory`] instances registered in the component
//! registry; the first factory that recognizes the uri wins.

use crate::error::{FetchError, Result};
use crate::request_context::RequestContext;
use crate::util::{index_of_byte, range_equals};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use percent_encoding::percent_decode_str;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use url::Url;

/// Number of leading bytes kept around for format sniffing.
pub const HEADER_BYTES_LEN: usize = 64;

/// Where the bytes (or the decoded image) actually came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataFrom {
  /// A local source such as a file or an inline data uri.
  Local,
  /// Fetched over the network on this request.
  Network,
  /// Raw bytes served from the download cache.
  DownloadCache,
  /// Decoded result served from the result cache.
  ResultCache,
  /// Decoded image served from the memory cache.
  MemoryCache,
}

/// Raw bytes either held in memory or sitting in a file on disk.
#[derive(Debug, Clone)]
pub enum DataSource {
  Bytes(Arc<Vec<u8>>),
  File(PathBuf),
}

impl DataSource {
  pub fn from_vec(bytes: Vec<u8>) -> Self {
    DataSource::Bytes(Arc::new(bytes))
  }

  /// All bytes of the source. File sources are read in full.
  pub fn read_all(&self) -> io::Result<Arc<Vec<u8>>> {
    match self {
      DataSource::Bytes(bytes) => Ok(Arc::clone(bytes)),
      DataSource::File(path) => {
        let mut buf = Vec::new();
        File::open(path)?.read_to_end(&mut buf)?;
        Ok(Arc::new(buf))
      }
    }
  }

  /// Backing file path, when the source lives on disk.
  pub fn file(&self) -> Option<&Path> {
    match self {
      DataSource::Bytes(_) => None,
      DataSource::File(path) => Some(path.as_path()),
    }
  }

  fn header_bytes(&self) -> io::Result<Vec<u8>> {
    match self {
      DataSource::Bytes(bytes) => {
        Ok(bytes[..bytes.len().min(HEADER_BYTES_LEN)].to_vec())
      }
      DataSource::File(path) => {
        let mut buf = vec![0u8; HEADER_BYTES_LEN];
        let mut file = File::open(path)?;
        let mut filled = 0;
        loop {
          let n = file.read(&mut buf[filled..])?;
          if n == 0 {
            break;
          }
          filled += n;
          if filled == buf.len() {
            break;
          }
        }
        buf.truncate(filled);
        Ok(buf)
      }
    }
  }
}

/// The outcome of one fetch: a byte source plus provenance.
#[derive(Debug, Clone)]
pub struct FetchResult {
  source: DataSource,
  mime_type: Option<String>,
  data_from: DataFrom,
}

impl FetchResult {
  pub fn new(source: DataSource, mime_type: Option<String>, data_from: DataFrom) -> Self {
    Self {
      source,
      mime_type,
      data_from,
    }
  }

  pub fn source(&self) -> &DataSource {
    &self.source
  }

  pub fn mime_type(&self) -> Option<&str> {
    self.mime_type.as_deref()
  }

  pub fn data_from(&self) -> DataFrom {
    self.data_from
  }

  /// Same bytes, different provenance. Used when a network result is
  /// re-served from the download cache.
  pub fn with_data_from(self, data_from: DataFrom) -> Self {
    Self { data_from, ..self }
  }

  /// Up to [`HEADER_BYTES_LEN`] leading bytes, for format sniffing.
  pub fn header_bytes(&self, uri: &str) -> Result<Vec<u8>> {
    self.source.header_bytes().map_err(|e| {
      FetchError::ReadFailed {
        uri: uri.to_string(),
        reason: e.to_string(),
      }
      .into()
    })
  }
}

/// Resolves one uri to raw bytes.
pub trait Fetcher: Send + Sync {
  fn fetch(&self, context: &RequestContext) -> Result<FetchResult>;

  /// Whether fetching hits the network. Remote fetchers are refused under
  /// [`Depth::Local`](crate::request::Depth::Local).
  fn is_remote(&self) -> bool {
    false
  }
}

impl std::fmt::Debug for dyn Fetcher {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str("dyn Fetcher")
  }
}

/// Creates a [`Fetcher`] for uris it recognizes, `None` otherwise.
pub trait FetcherFactory: Send + Sync {
  fn create(&self, context: &RequestContext) -> Option<Box<dyn Fetcher>>;
}

/// Reads `file://` uris and bare absolute paths from the local filesystem.
#[derive(Debug, Default)]
pub struct FileFetcherFactory;

impl FetcherFactory for FileFetcherFactory {
  fn create(&self, context: &RequestContext) -> Option<Box<dyn Fetcher>> {
    let uri = context.request().uri();
    let path = if uri.starts_with("file:") {
      Url::parse(uri).ok()?.to_file_path().ok()?
    } else if uri.starts_with('/') {
      PathBuf::from(uri)
    } else {
      return None;
    };
    Some(Box::new(FileFetcher {
      uri: uri.to_string(),
      path,
    }))
  }
}

struct FileFetcher {
  uri: String,
  path: PathBuf,
}

impl Fetcher for FileFetcher {
  fn fetch(&self, _context: &RequestContext) -> Result<FetchResult> {
    if !self.path.is_file() {
      return Err(
        FetchError::ReadFailed {
          uri: self.uri.clone(),
          reason: "no such file".to_string(),
        }
        .into(),
      );
    }
    let source = DataSource::File(self.path.clone());
    // Sniffed from content; the file extension is not trusted.
    let mime_type = source
      .header_bytes()
      .ok()
      .and_then(|header| sniff_mime_type(&header))
      .map(str::to_string);
    Ok(FetchResult::new(source, mime_type, DataFrom::Local))
  }
}

/// Mime type from leading signature bytes, for the formats the pipeline
/// commonly meets.
pub fn sniff_mime_type(header: &[u8]) -> Option<&'static str> {
  if range_equals(header, 0, b"\x89PNG\r\n\x1a\n") {
    Some("image/png")
  } else if range_equals(header, 0, &[0xFF, 0xD8, 0xFF]) {
    Some("image/jpeg")
  } else if range_equals(header, 0, b"GIF87a") || range_equals(header, 0, b"GIF89a") {
    Some("image/gif")
  } else if range_equals(header, 0, b"RIFF") && range_equals(header, 8, b"WEBP") {
    Some("image/webp")
  } else if range_equals(header, 0, b"BM") {
    Some("image/bmp")
  } else {
    None
  }
}

/// Decodes inline `data:` uris, both base64 and percent-encoded.
#[derive(Debug, Default)]
pub struct DataUrlFetcherFactory;

impl FetcherFactory for DataUrlFetcherFactory {
  fn create(&self, context: &RequestContext) -> Option<Box<dyn Fetcher>> {
    let uri = context.request().uri();
    if !uri.starts_with("data:") {
      return None;
    }
    Some(Box::new(DataUrlFetcher {
      uri: uri.to_string(),
    }))
  }
}

struct DataUrlFetcher {
  uri: String,
}

impl Fetcher for DataUrlFetcher {
  fn fetch(&self, _context: &RequestContext) -> Result<FetchResult> {
    let body = &self.uri["data:".len()..];
    let comma = index_of_byte(body.as_bytes(), b',', 0, body.len()).ok_or_else(|| {
      FetchError::InvalidDataUrl {
        reason: "missing comma separator".to_string(),
      }
    })?;
    let (head, payload) = (&body[..comma], &body[comma + 1..]);

    let mut mime_type = None;
    let mut is_base64 = false;
    for (i, part) in head.split(';').enumerate() {
      if part.eq_ignore_ascii_case("base64") {
        is_base64 = true;
      } else if i == 0 && !part.is_empty() {
        mime_type = Some(part.to_string());
      }
    }

    let bytes = if is_base64 {
      BASE64
        .decode(payload)
        .map_err(|e| FetchError::InvalidDataUrl {
          reason: format!("bad base64 payload: {e}"),
        })?
    } else {
      percent_decode_str(payload).collect()
    };

    Ok(FetchResult::new(
      DataSource::from_vec(bytes),
      mime_type,
      DataFrom::Local,
    ))
  }
}
