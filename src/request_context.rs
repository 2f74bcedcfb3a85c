//! Per-execution state shared across pipeline stages.
//!
//! A [`RequestContext`] tracks every rewrite of the request made by
//! interceptors (the last entry is the one the pipeline acts on) and derives
//! the cache keys. Keys are recomputed on each rewrite so downstream stages
//! always see keys consistent with the request they receive.

use crate::control::CancelToken;
use crate::request::{ImageRequest, Size};

/// Shared state for one request execution.
#[derive(Debug)]
pub struct RequestContext {
  /// Rewrite history; the last entry is the current request.
  requests: Vec<ImageRequest>,
  cache_key: String,
  token: CancelToken,
}

impl RequestContext {
  pub fn new(request: ImageRequest, token: CancelToken) -> Self {
    let cache_key = derive_cache_key(&request);
    Self {
      requests: vec![request],
      cache_key,
      token,
    }
  }

  /// The request the pipeline is currently acting on.
  pub fn request(&self) -> &ImageRequest {
    self.requests.last().unwrap()
  }

  /// The request as originally submitted, before any interceptor rewrites.
  pub fn initial_request(&self) -> &ImageRequest {
    self.requests.first().unwrap()
  }

  pub fn rewrite_history(&self) -> &[ImageRequest] {
    &self.requests
  }

  /// Record an interceptor rewrite and recompute derived keys.
  pub fn set_request(&mut self, request: ImageRequest) {
    self.cache_key = derive_cache_key(&request);
    self.requests.push(request);
  }

  /// Full cache key: uri plus every option that affects the decoded output.
  /// Keys the result cache and the memory cache, and scopes single-flight
  /// deduplication.
  pub fn cache_key(&self) -> &str {
    &self.cache_key
  }

  /// Download-cache key: the uri alone. Raw bytes do not depend on decode
  /// options, so requests with different sizes share one download entry.
  pub fn download_cache_key(&self) -> &str {
    self.request().uri()
  }

  /// Requested size with the multiplier applied.
  pub fn resolved_size(&self) -> Option<Size> {
    let options = self.request().options();
    let size = options.size?;
    let multiplier = options.size_multiplier.unwrap_or(1.0);
    if (multiplier - 1.0).abs() < f32::EPSILON {
      return Some(size);
    }
    Some(Size::new(
      ((size.width as f32 * multiplier).round() as u32).max(1),
      ((size.height as f32 * multiplier).round() as u32).max(1),
    ))
  }

  pub fn token(&self) -> &CancelToken {
    &self.token
  }
}

fn derive_cache_key(request: &ImageRequest) -> String {
  let options = request.options();
  // Only options that change the decoded output participate. Depth and the
  // cache policies gate progression, not pixels, and stay out so a
  // depth-restricted request can hit entries warmed by an unrestricted one.
  let mut params: Vec<String> = Vec::new();
  if let Some(size) = options.size {
    params.push(format!("_size={size}"));
  }
  if let Some(multiplier) = options.size_multiplier {
    params.push(format!("_sizeMultiplier={multiplier}"));
  }
  if let Some(precision) = options.precision {
    params.push(format!("_precision={}", precision.name()));
  }
  if let Some(scale) = options.scale {
    params.push(format!("_scale={}", scale.name()));
  }
  if let Some(transformations) = &options.transformations {
    if !transformations.is_empty() {
      let keys: Vec<String> = transformations.iter().map(|t| t.key()).collect();
      params.push(format!("_transformations=[{}]", keys.join(",")));
    }
  }
  if let Some(disallow) = options.disallow_animated_image {
    params.push(format!("_disallowAnimatedImage={disallow}"));
  }
  if let Some(resize_on_draw) = options.resize_on_draw {
    params.push(format!("_resizeOnDraw={resize_on_draw}"));
  }
  if params.is_empty() {
    request.uri().to_string()
  } else {
    format!("{}?{}", request.uri(), params.join("&"))
  }
}
