//! Interceptor chains around the request and decode stages.
//!
//! Request interceptors run outside everything (memory cache included) and
//! may rewrite the request before proceeding. Decode interceptors run inside
//! the single-flight execution, between fetch scheduling and the actual
//! decode; the result cache lives here so a hit skips fetch and decode both.

use crate::cache::DiskCache;
use crate::decode::{DecodeResult, ImageInfo};
use crate::engine::ImageData;
use crate::error::Result;
use crate::fetch::DataFrom;
use crate::images::BitmapImage;
use crate::request::{Depth, ImageRequest};
use crate::request_context::RequestContext;
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::sync::Arc;

/// Wraps request execution; may rewrite the request, short-circuit with a
/// result, or decorate the outcome.
pub trait RequestInterceptor: Send + Sync {
  fn intercept(&self, chain: &mut RequestChain<'_>) -> Result<ImageData>;
}

/// Wraps the fetch+decode core; may serve a decoded result from elsewhere or
/// post-process one.
pub trait DecodeInterceptor: Send + Sync {
  fn intercept(&self, chain: &mut DecodeChain<'_>) -> Result<DecodeResult>;
}

pub struct RequestChain<'a> {
  interceptors: &'a [Arc<dyn RequestInterceptor>],
  index: usize,
  context: &'a mut RequestContext,
  terminal: &'a mut dyn FnMut(&mut RequestContext) -> Result<ImageData>,
}

impl<'a> RequestChain<'a> {
  pub fn new(
    interceptors: &'a [Arc<dyn RequestInterceptor>],
    context: &'a mut RequestContext,
    terminal: &'a mut dyn FnMut(&mut RequestContext) -> Result<ImageData>,
  ) -> Self {
    Self {
      interceptors,
      index: 0,
      context,
      terminal,
    }
  }

  pub fn request(&self) -> &ImageRequest {
    self.context.request()
  }

  pub fn context(&self) -> &RequestContext {
    self.context
  }

  /// Continue with `request`; a rewrite is recorded in the context's history
  /// before the next interceptor runs.
  pub fn proceed(&mut self, request: ImageRequest) -> Result<ImageData> {
    if *self.context.request() != request {
      self.context.set_request(request);
    }
    match self.interceptors.get(self.index) {
      Some(interceptor) => {
        let interceptor = Arc::clone(interceptor);
        self.index += 1;
        let out = interceptor.intercept(self);
        self.index -= 1;
        out
      }
      None => (self.terminal)(self.context),
    }
  }
}

pub struct DecodeChain<'a> {
  interceptors: &'a [Arc<dyn DecodeInterceptor>],
  index: usize,
  context: &'a RequestContext,
  terminal: &'a mut dyn FnMut(&RequestContext) -> Result<DecodeResult>,
}

impl<'a> DecodeChain<'a> {
  pub fn new(
    interceptors: &'a [Arc<dyn DecodeInterceptor>],
    context: &'a RequestContext,
    terminal: &'a mut dyn FnMut(&RequestContext) -> Result<DecodeResult>,
  ) -> Self {
    Self {
      interceptors,
      index: 0,
      context,
      terminal,
    }
  }

  pub fn context(&self) -> &RequestContext {
    self.context
  }

  pub fn request(&self) -> &ImageRequest {
    self.context.request()
  }

  pub fn proceed(&mut self) -> Result<DecodeResult> {
    match self.interceptors.get(self.index) {
      Some(interceptor) => {
        let interceptor = Arc::clone(interceptor);
        self.index += 1;
        let out = interceptor.intercept(self);
        self.index -= 1;
        out
      }
      None => (self.terminal)(self.context),
    }
  }
}

/// Entry that a decoded-and-transformed image leaves in the result cache:
/// png-encoded pixels in the data file, this record in the meta sidecar.
#[derive(Debug, Serialize, Deserialize)]
struct ResultMetadata {
  width: u32,
  height: u32,
  mime_type: Option<String>,
  transformeds: Vec<String>,
}

/// Serves transformed images from the result disk cache and writes fresh
/// ones back, honoring the request's result cache policy.
///
/// Only results that actually went through a transformation or resize are
/// persisted: an untransformed decode is cheaper to redo from source bytes
/// than to store twice.
pub struct ResultCacheDecodeInterceptor {
  cache: DiskCache,
}

impl ResultCacheDecodeInterceptor {
  pub fn new(cache: DiskCache) -> Self {
    Self { cache }
  }

  fn read(&self, context: &RequestContext) -> Option<DecodeResult> {
    let key = context.cache_key();
    let snapshot = self.cache.open_snapshot(key)?;
    let meta: ResultMetadata = match snapshot
      .read_meta()
      .ok()
      .and_then(|bytes| serde_json::from_slice(&bytes).ok())
    {
      Some(meta) => meta,
      None => {
        drop(snapshot);
        self.cache.remove(key);
        return None;
      }
    };
    let pixels = match snapshot
      .read_data()
      .ok()
      .and_then(|bytes| image::load_from_memory(&bytes).ok())
    {
      Some(decoded) => decoded.to_rgba8(),
      None => {
        drop(snapshot);
        self.cache.remove(key);
        return None;
      }
    };
    Some(DecodeResult {
      image: Arc::new(BitmapImage::new(pixels)),
      info: ImageInfo {
        width: meta.width,
        height: meta.height,
        mime_type: meta.mime_type,
      },
      data_from: DataFrom::ResultCache,
      transformeds: meta
        .transformeds
        .into_iter()
        .map(crate::transform::Transformed::new)
        .collect(),
    })
  }

  fn write(&self, context: &RequestContext, result: &DecodeResult) {
    let Some(bitmap) = result.image.as_bitmap() else {
      return;
    };
    let mut encoded = Cursor::new(Vec::new());
    if bitmap
      .pixels()
      .write_to(&mut encoded, image::ImageFormat::Png)
      .is_err()
    {
      return;
    }
    let meta = ResultMetadata {
      width: result.info.width,
      height: result.info.height,
      mime_type: result.info.mime_type.clone(),
      transformeds: result.transformeds.iter().map(|t| t.key().to_string()).collect(),
    };
    let Ok(meta_bytes) = serde_json::to_vec(&meta) else {
      return;
    };
    let Some(editor) = self.cache.open_editor(context.cache_key()) else {
      return;
    };
    if editor.write_data(&encoded.into_inner()).is_err()
      || editor.write_meta(&meta_bytes).is_err()
    {
      editor.abort();
      return;
    }
    let _ = editor.commit();
  }
}

impl DecodeInterceptor for ResultCacheDecodeInterceptor {
  fn intercept(&self, chain: &mut DecodeChain<'_>) -> Result<DecodeResult> {
    let policy = chain.request().result_cache_policy();
    if !policy.read_enabled() && !policy.write_enabled() {
      return chain.proceed();
    }
    let key = chain.context().cache_key().to_string();
    self.cache.with_key_lock(&key, || {
      if policy.read_enabled() {
        if let Some(hit) = self.read(chain.context()) {
          return Ok(hit);
        }
      }
      let result = chain.proceed()?;
      if policy.write_enabled() && !result.transformeds.is_empty() {
        self.write(chain.context(), &result);
      }
      Ok(result)
    })
  }
}

/// Extra flag: the submitter opted this request into cellular-traffic saving.
pub const SAVE_CELLULAR_TRAFFIC_EXTRA: &str = "picfetch#save_cellular_traffic";
/// Extra flag: skip cellular-traffic saving for this request.
pub const IGNORE_SAVE_CELLULAR_TRAFFIC_EXTRA: &str = "picfetch#ignore_save_cellular_traffic";
/// Extra holding the depth the request had before it was forced to local.
const OLD_DEPTH_EXTRA: &str = "picfetch#save_cellular_traffic_old_depth";

/// Forces opted-in requests down to [`Depth::Local`] while on a metered
/// connection, and restores their original depth once the connection is no
/// longer metered. The previous depth rides along in a request extra, so the
/// rewrite is reversible on a later restart of the same request.
pub struct SaveCellularTrafficInterceptor {
  is_cellular: Box<dyn Fn() -> bool + Send + Sync>,
}

impl SaveCellularTrafficInterceptor {
  pub fn new(is_cellular: impl Fn() -> bool + Send + Sync + 'static) -> Self {
    Self {
      is_cellular: Box::new(is_cellular),
    }
  }
}

impl RequestInterceptor for SaveCellularTrafficInterceptor {
  fn intercept(&self, chain: &mut RequestChain<'_>) -> Result<ImageData> {
    let request = chain.request().clone();
    let opted_in = request.extra(SAVE_CELLULAR_TRAFFIC_EXTRA).is_some()
      && request.extra(IGNORE_SAVE_CELLULAR_TRAFFIC_EXTRA).is_none();

    let rewritten = if opted_in && (self.is_cellular)() {
      if request.depth() == Depth::Local {
        request
      } else {
        let old_depth = request.depth();
        request.new_request(|b| {
          b.depth(Depth::Local)
            .set_extra(OLD_DEPTH_EXTRA, old_depth.name());
        })?
      }
    } else if let Some(old_depth) = request.extra(OLD_DEPTH_EXTRA).and_then(Depth::from_name) {
      request.new_request(|b| {
        b.depth(old_depth).remove_extra(OLD_DEPTH_EXTRA);
      })?
    } else {
      request
    };
    chain.proceed(rewritten)
  }
}

/// Whether `request`'s current depth was imposed by
/// [`SaveCellularTrafficInterceptor`] rather than chosen by the submitter.
pub fn is_depth_from_save_cellular_traffic(request: &ImageRequest) -> bool {
  request.depth() == Depth::Local && request.extra(OLD_DEPTH_EXTRA).is_some()
}
