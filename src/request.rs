//! Image request configuration.
//!
//! [`ImageRequest`] pairs a uri with [`ImageOptions`]. Options are plain
//! optional fields; [`ImageOptions::merged`] applies "self wins, else other"
//! per field so request-level options can fall back to engine-level defaults
//! without inheritance.

use crate::components::ComponentRegistry;
use crate::error::{ConfigError, Result};
use crate::images::Image;
use crate::transform::{Precision, Scale, Transformation};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Target dimensions in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Size {
  pub width: u32,
  pub height: u32,
}

impl Size {
  pub fn new(width: u32, height: u32) -> Self {
    Self { width, height }
  }
}

impl fmt::Display for Size {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}x{}", self.width, self.height)
  }
}

/// How far a request is permitted to progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Depth {
  /// Only the memory cache may be consulted.
  Memory,
  /// Local sources and the disk caches are allowed; network is forbidden.
  Local,
  /// No restriction.
  #[default]
  Network,
}

impl Depth {
  /// Parse the value produced by [`Depth::name`].
  pub fn from_name(name: &str) -> Option<Depth> {
    match name {
      "MEMORY" => Some(Depth::Memory),
      "LOCAL" => Some(Depth::Local),
      "NETWORK" => Some(Depth::Network),
      _ => None,
    }
  }

  pub fn name(&self) -> &'static str {
    match self {
      Depth::Memory => "MEMORY",
      Depth::Local => "LOCAL",
      Depth::Network => "NETWORK",
    }
  }
}

/// Read/write gates for one cache layer.
///
/// The download cache, result cache and memory cache are gated independently
/// per request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CachePolicy {
  #[default]
  Enabled,
  Disabled,
  ReadOnly,
  WriteOnly,
}

impl CachePolicy {
  pub fn read_enabled(&self) -> bool {
    matches!(self, CachePolicy::Enabled | CachePolicy::ReadOnly)
  }

  pub fn write_enabled(&self) -> bool {
    matches!(self, CachePolicy::Enabled | CachePolicy::WriteOnly)
  }
}

/// Options that affect how a request is fetched, decoded and cached.
///
/// Every field is optional; unset fields fall back through [`merged`] chains
/// and finally to crate defaults at use sites.
///
/// [`merged`]: ImageOptions::merged
#[derive(Clone, Default)]
pub struct ImageOptions {
  pub depth: Option<Depth>,
  /// Headers attached to http fetches, handed through to the fetcher.
  pub http_headers: Option<BTreeMap<String, String>>,
  /// Policy for the raw-bytes download cache (keyed by uri only).
  pub download_cache_policy: Option<CachePolicy>,
  /// Policy for the decoded/transformed result cache (keyed by full cache key).
  pub result_cache_policy: Option<CachePolicy>,
  /// Policy for the decoded-image memory cache.
  pub memory_cache_policy: Option<CachePolicy>,
  /// Target size; when unset the image keeps its intrinsic size.
  pub size: Option<Size>,
  /// Final size = size * multiplier.
  pub size_multiplier: Option<f32>,
  pub precision: Option<Precision>,
  pub scale: Option<Scale>,
  pub transformations: Option<Vec<Arc<dyn Transformation>>>,
  /// Decode only the first frame of animated sources.
  pub disallow_animated_image: Option<bool>,
  /// Defer resizing to draw time instead of resizing the decoded pixels.
  pub resize_on_draw: Option<bool>,
  /// Image shown while loading.
  pub placeholder: Option<Arc<dyn Image>>,
  /// Image shown when loading fails.
  pub error_image: Option<Arc<dyn Image>>,
  /// Image shown when the uri is empty.
  pub uri_empty_image: Option<Arc<dyn Image>>,
  /// Extra components consulted before the engine-level registry.
  pub components: Option<ComponentRegistry>,
}

impl ImageOptions {
  pub fn new() -> Self {
    Self::default()
  }

  /// Merge `self` over `other`: for every field, `self` wins when set,
  /// otherwise `other`'s value is used.
  pub fn merged(&self, other: &ImageOptions) -> ImageOptions {
    ImageOptions {
      depth: self.depth.or(other.depth),
      http_headers: self.http_headers.clone().or_else(|| other.http_headers.clone()),
      download_cache_policy: self.download_cache_policy.or(other.download_cache_policy),
      result_cache_policy: self.result_cache_policy.or(other.result_cache_policy),
      memory_cache_policy: self.memory_cache_policy.or(other.memory_cache_policy),
      size: self.size.or(other.size),
      size_multiplier: self.size_multiplier.or(other.size_multiplier),
      precision: self.precision.or(other.precision),
      scale: self.scale.or(other.scale),
      transformations: self
        .transformations
        .clone()
        .or_else(|| other.transformations.clone()),
      disallow_animated_image: self.disallow_animated_image.or(other.disallow_animated_image),
      resize_on_draw: self.resize_on_draw.or(other.resize_on_draw),
      placeholder: self.placeholder.clone().or_else(|| other.placeholder.clone()),
      error_image: self.error_image.clone().or_else(|| other.error_image.clone()),
      uri_empty_image: self
        .uri_empty_image
        .clone()
        .or_else(|| other.uri_empty_image.clone()),
      components: self.components.clone().or_else(|| other.components.clone()),
    }
  }
}

impl PartialEq for ImageOptions {
  fn eq(&self, other: &Self) -> bool {
    fn arc_eq<T: ?Sized>(a: &Option<Arc<T>>, b: &Option<Arc<T>>) -> bool {
      match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        _ => false,
      }
    }
    let transformation_keys =
      |list: &Option<Vec<Arc<dyn Transformation>>>| -> Option<Vec<String>> {
        list.as_ref().map(|l| l.iter().map(|t| t.key()).collect())
      };
    self.depth == other.depth
      && self.http_headers == other.http_headers
      && self.download_cache_policy == other.download_cache_policy
      && self.result_cache_policy == other.result_cache_policy
      && self.memory_cache_policy == other.memory_cache_policy
      && self.size == other.size
      && self.size_multiplier == other.size_multiplier
      && self.precision == other.precision
      && self.scale == other.scale
      && transformation_keys(&self.transformations) == transformation_keys(&other.transformations)
      && self.disallow_animated_image == other.disallow_animated_image
      && self.resize_on_draw == other.resize_on_draw
      && arc_eq(&self.placeholder, &other.placeholder)
      && arc_eq(&self.error_image, &other.error_image)
      && arc_eq(&self.uri_empty_image, &other.uri_empty_image)
      && match (&self.components, &other.components) {
        (None, None) => true,
        (Some(a), Some(b)) => a.same_instance(b),
        _ => false,
      }
  }
}

impl fmt::Debug for ImageOptions {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let transformation_keys: Option<Vec<String>> = self
      .transformations
      .as_ref()
      .map(|list| list.iter().map(|t| t.key()).collect());
    f.debug_struct("ImageOptions")
      .field("depth", &self.depth)
      .field("download_cache_policy", &self.download_cache_policy)
      .field("result_cache_policy", &self.result_cache_policy)
      .field("memory_cache_policy", &self.memory_cache_policy)
      .field("size", &self.size)
      .field("size_multiplier", &self.size_multiplier)
      .field("precision", &self.precision)
      .field("scale", &self.scale)
      .field("transformations", &transformation_keys)
      .finish_non_exhaustive()
  }
}

/// A request to load one logical image.
#[derive(Clone, Debug, PartialEq)]
pub struct ImageRequest {
  uri: String,
  options: ImageOptions,
  /// Generic key/value side channel for interceptors and fetchers. Extras do
  /// not participate in cache-key derivation.
  extras: BTreeMap<String, String>,
}

impl ImageRequest {
  pub fn builder(uri: impl Into<String>) -> ImageRequestBuilder {
    ImageRequestBuilder::new(uri)
  }

  /// Shorthand for a request with default options.
  pub fn new(uri: impl Into<String>) -> Self {
    Self {
      uri: uri.into(),
      options: ImageOptions::default(),
      extras: BTreeMap::new(),
    }
  }

  pub fn uri(&self) -> &str {
    &self.uri
  }

  pub fn options(&self) -> &ImageOptions {
    &self.options
  }

  pub fn depth(&self) -> Depth {
    self.options.depth.unwrap_or_default()
  }

  pub fn download_cache_policy(&self) -> CachePolicy {
    self.options.download_cache_policy.unwrap_or_default()
  }

  pub fn result_cache_policy(&self) -> CachePolicy {
    self.options.result_cache_policy.unwrap_or_default()
  }

  pub fn memory_cache_policy(&self) -> CachePolicy {
    self.options.memory_cache_policy.unwrap_or_default()
  }

  pub fn extra(&self, key: &str) -> Option<&str> {
    self.extras.get(key).map(String::as_str)
  }

  pub fn extras(&self) -> &BTreeMap<String, String> {
    &self.extras
  }

  /// Rebuild this request with modifications. Used by interceptors to
  /// rewrite a request before proceeding.
  pub fn new_request(
    &self,
    configure: impl FnOnce(&mut ImageRequestBuilder),
  ) -> Result<ImageRequest> {
    let mut builder = self.to_builder();
    configure(&mut builder);
    builder.build()
  }

  pub fn to_builder(&self) -> ImageRequestBuilder {
    ImageRequestBuilder {
      uri: self.uri.clone(),
      options: self.options.clone(),
      extras: self.extras.clone(),
    }
  }
}

/// Builder for [`ImageRequest`] with fail-fast option validation.
#[derive(Clone, Debug)]
pub struct ImageRequestBuilder {
  uri: String,
  options: ImageOptions,
  extras: BTreeMap<String, String>,
}

impl ImageRequestBuilder {
  pub fn new(uri: impl Into<String>) -> Self {
    Self {
      uri: uri.into(),
      options: ImageOptions::default(),
      extras: BTreeMap::new(),
    }
  }

  pub fn depth(&mut self, depth: Depth) -> &mut Self {
    self.options.depth = Some(depth);
    self
  }

  pub fn http_header(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
    self
      .options
      .http_headers
      .get_or_insert_with(BTreeMap::new)
      .insert(name.into(), value.into());
    self
  }

  pub fn download_cache_policy(&mut self, policy: CachePolicy) -> &mut Self {
    self.options.download_cache_policy = Some(policy);
    self
  }

  pub fn result_cache_policy(&mut self, policy: CachePolicy) -> &mut Self {
    self.options.result_cache_policy = Some(policy);
    self
  }

  pub fn memory_cache_policy(&mut self, policy: CachePolicy) -> &mut Self {
    self.options.memory_cache_policy = Some(policy);
    self
  }

  pub fn size(&mut self, size: Size) -> &mut Self {
    self.options.size = Some(size);
    self
  }

  pub fn size_multiplier(&mut self, multiplier: f32) -> &mut Self {
    self.options.size_multiplier = Some(multiplier);
    self
  }

  pub fn precision(&mut self, precision: Precision) -> &mut Self {
    self.options.precision = Some(precision);
    self
  }

  pub fn scale(&mut self, scale: Scale) -> &mut Self {
    self.options.scale = Some(scale);
    self
  }

  pub fn transformation(&mut self, transformation: Arc<dyn Transformation>) -> &mut Self {
    self
      .options
      .transformations
      .get_or_insert_with(Vec::new)
      .push(transformation);
    self
  }

  pub fn disallow_animated_image(&mut self, disallow: bool) -> &mut Self {
    self.options.disallow_animated_image = Some(disallow);
    self
  }

  pub fn resize_on_draw(&mut self, resize_on_draw: bool) -> &mut Self {
    self.options.resize_on_draw = Some(resize_on_draw);
    self
  }

  pub fn placeholder(&mut self, image: Arc<dyn Image>) -> &mut Self {
    self.options.placeholder = Some(image);
    self
  }

  pub fn error_image(&mut self, image: Arc<dyn Image>) -> &mut Self {
    self.options.error_image = Some(image);
    self
  }

  pub fn uri_empty_image(&mut self, image: Arc<dyn Image>) -> &mut Self {
    self.options.uri_empty_image = Some(image);
    self
  }

  pub fn components(&mut self, components: ComponentRegistry) -> &mut Self {
    self.options.components = Some(components);
    self
  }

  /// Apply `options` underneath any options already set on this builder.
  pub fn default_options(&mut self, options: &ImageOptions) -> &mut Self {
    self.options = self.options.merged(options);
    self
  }

  pub fn set_extra(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
    self.extras.insert(key.into(), value.into());
    self
  }

  pub fn remove_extra(&mut self, key: &str) -> &mut Self {
    self.extras.remove(key);
    self
  }

  pub fn build(&self) -> Result<ImageRequest> {
    if let Some(multiplier) = self.options.size_multiplier {
      if !(multiplier.is_finite() && multiplier > 0.0) {
        return Err(ConfigError::InvalidSizeMultiplier { multiplier }.into());
      }
    }
    Ok(ImageRequest {
      uri: self.uri.clone(),
      options: self.options.clone(),
      extras: self.extras.clone(),
    })
  }
}
