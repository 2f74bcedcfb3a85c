//! Request execution: the pipeline that turns an [`ImageRequest`] into a
//! loaded image.
//!
//! Stage order per request: request interceptors, memory cache lookup,
//! single-flight admission on the cache key, decode interceptors (result
//! cache included), fetch (download cache included), decode, transform,
//! resize, memory cache write. Concurrent requests sharing a cache key attach
//! to the first execution and all receive its outcome.

use crate::cache::{DiskCache, ImagePin, MemoryCache};
use crate::components::ComponentRegistry;
use crate::control::{CancelToken, Stage};
use crate::decode::{BitmapDecoderFactory, DecodeResult, ImageInfo};
use crate::error::{Error, Result};
use crate::fetch::{
  DataFrom, DataSource, DataUrlFetcherFactory, FetchResult, FileFetcherFactory,
};
use crate::images::Image;
use crate::interceptors::{
  DecodeChain, DecodeInterceptor, RequestChain, ResultCacheDecodeInterceptor,
};
use crate::request::{Depth, ImageOptions, ImageRequest};
use crate::request_context::RequestContext;
use crate::transform::{self, Transformed};
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

// Memory cache extras carrying what an image alone cannot: intrinsic size,
// source mime type and the applied transformation keys.
const EXTRA_WIDTH: &str = "width";
const EXTRA_HEIGHT: &str = "height";
const EXTRA_MIME_TYPE: &str = "mime_type";
const EXTRA_TRANSFORMEDS: &str = "transformeds";
const TRANSFORMEDS_SEPARATOR: char = '\n';

/// An image as delivered to the requester: pinned while it came from (or
/// went into) the memory cache, plain otherwise.
#[derive(Debug, Clone)]
pub enum LoadedImage {
  Pinned(ImagePin),
  Unpinned(Arc<dyn Image>),
}

impl LoadedImage {
  pub fn image(&self) -> &Arc<dyn Image> {
    match self {
      LoadedImage::Pinned(pin) => pin.image(),
      LoadedImage::Unpinned(image) => image,
    }
  }
}

/// Terminal success outcome of one request.
#[derive(Debug, Clone)]
pub struct ImageData {
  pub image: LoadedImage,
  pub info: ImageInfo,
  pub data_from: DataFrom,
  pub transformeds: Vec<Transformed>,
}

impl ImageData {
  pub fn image(&self) -> &Arc<dyn Image> {
    self.image.image()
  }
}

struct Flight {
  outcome: Mutex<Option<Result<ImageData>>>,
  done: Condvar,
}

/// Executor counters, collected while requests run.
#[derive(Debug, Default)]
struct Diagnostics {
  requests: AtomicUsize,
  memory_hits: AtomicUsize,
  download_cache_hits: AtomicUsize,
  result_cache_hits: AtomicUsize,
  fetches: AtomicUsize,
  flight_joins: AtomicUsize,
}

/// Point-in-time copy of the executor's counters.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DiagnosticsSnapshot {
  pub requests: usize,
  pub memory_hits: usize,
  pub download_cache_hits: usize,
  pub result_cache_hits: usize,
  pub fetches: usize,
  /// Requests that attached to another request's in-flight execution.
  pub flight_joins: usize,
}

impl Diagnostics {
  fn bump(counter: &AtomicUsize) {
    counter.fetch_add(1, Ordering::Relaxed);
  }

  fn snapshot(&self) -> DiagnosticsSnapshot {
    DiagnosticsSnapshot {
      requests: self.requests.load(Ordering::Relaxed),
      memory_hits: self.memory_hits.load(Ordering::Relaxed),
      download_cache_hits: self.download_cache_hits.load(Ordering::Relaxed),
      result_cache_hits: self.result_cache_hits.load(Ordering::Relaxed),
      fetches: self.fetches.load(Ordering::Relaxed),
      flight_joins: self.flight_joins.load(Ordering::Relaxed),
    }
  }
}

/// The engine. Cheap to clone via inner sharing is not provided; wrap in an
/// `Arc` to share across threads.
pub struct RequestExecutor {
  components: ComponentRegistry,
  default_options: Option<ImageOptions>,
  memory_cache: MemoryCache,
  download_cache: Option<DiskCache>,
  result_cache_interceptor: Option<Arc<dyn DecodeInterceptor>>,
  result_cache: Option<DiskCache>,
  in_flight: Mutex<FxHashMap<String, Arc<Flight>>>,
  diagnostics: Diagnostics,
}

pub struct RequestExecutorBuilder {
  components: Option<ComponentRegistry>,
  default_options: Option<ImageOptions>,
  memory_cache: Option<MemoryCache>,
  download_cache: Option<DiskCache>,
  result_cache: Option<DiskCache>,
}

impl RequestExecutorBuilder {
  /// Components consulted before the built-in fetchers and decoders.
  pub fn components(mut self, components: ComponentRegistry) -> Self {
    self.components = Some(components);
    self
  }

  /// Options applied underneath every request's own options.
  pub fn default_options(mut self, options: ImageOptions) -> Self {
    self.default_options = Some(options);
    self
  }

  pub fn memory_cache(mut self, cache: MemoryCache) -> Self {
    self.memory_cache = Some(cache);
    self
  }

  /// Disk cache for raw fetched bytes, keyed by uri. Without one, download
  /// cache policies are inert.
  pub fn download_cache(mut self, cache: DiskCache) -> Self {
    self.download_cache = Some(cache);
    self
  }

  /// Disk cache for transformed decode results, keyed by the full cache key.
  pub fn result_cache(mut self, cache: DiskCache) -> Self {
    self.result_cache = Some(cache);
    self
  }

  pub fn build(self) -> Result<RequestExecutor> {
    let built_ins = ComponentRegistry::builder()
      .add_fetcher_factory(Arc::new(FileFetcherFactory))
      .add_fetcher_factory(Arc::new(DataUrlFetcherFactory))
      .add_decoder_factory(Arc::new(BitmapDecoderFactory))
      .build();
    let components = match self.components {
      Some(user) => user.merged(&built_ins),
      None => built_ins,
    };
    let memory_cache = match self.memory_cache {
      Some(cache) => cache,
      None => MemoryCache::new(crate::cache::memory::DEFAULT_MAX_SIZE)?,
    };
    let result_cache_interceptor = self
      .result_cache
      .clone()
      .map(|cache| Arc::new(ResultCacheDecodeInterceptor::new(cache)) as Arc<dyn DecodeInterceptor>);
    Ok(RequestExecutor {
      components,
      default_options: self.default_options,
      memory_cache,
      download_cache: self.download_cache,
      result_cache_interceptor,
      result_cache: self.result_cache,
      in_flight: Mutex::new(FxHashMap::default()),
      diagnostics: Diagnostics::default(),
    })
  }
}

impl RequestExecutor {
  pub fn builder() -> RequestExecutorBuilder {
    RequestExecutorBuilder {
      components: None,
      default_options: None,
      memory_cache: None,
      download_cache: None,
      result_cache: None,
    }
  }

  pub fn memory_cache(&self) -> &MemoryCache {
    &self.memory_cache
  }

  pub fn download_cache(&self) -> Option<&DiskCache> {
    self.download_cache.as_ref()
  }

  pub fn result_cache(&self) -> Option<&DiskCache> {
    self.result_cache.as_ref()
  }

  pub fn diagnostics(&self) -> DiagnosticsSnapshot {
    self.diagnostics.snapshot()
  }

  pub fn execute(&self, request: ImageRequest) -> Result<ImageData> {
    self.execute_with_token(request, CancelToken::new())
  }

  pub fn execute_with_token(&self, request: ImageRequest, token: CancelToken) -> Result<ImageData> {
    if request.uri().is_empty() {
      return Err(Error::UriEmpty);
    }
    Diagnostics::bump(&self.diagnostics.requests);
    let request = match &self.default_options {
      Some(defaults) => request.new_request(|b| {
        b.default_options(defaults);
      })?,
      None => request,
    };
    let registry = match &request.options().components {
      Some(overlay) => overlay.merged(&self.components),
      None => self.components.clone(),
    };
    let mut context = RequestContext::new(request, token);
    let interceptors = registry.request_interceptors().to_vec();
    let mut terminal =
      |context: &mut RequestContext| self.execute_terminal(&registry, context);
    let mut chain = RequestChain::new(&interceptors, &mut context, &mut terminal);
    let request = chain.request().clone();
    chain.proceed(request)
  }

  fn execute_terminal(
    &self,
    registry: &ComponentRegistry,
    context: &mut RequestContext,
  ) -> Result<ImageData> {
    context.token().check(Stage::MemoryLookup)?;
    let request = context.request().clone();
    let memory_policy = request.memory_cache_policy();
    if memory_policy.read_enabled() {
      if let Some(pin) = self.memory_cache.get(context.cache_key()) {
        Diagnostics::bump(&self.diagnostics.memory_hits);
        return Ok(image_data_from_pin(pin));
      }
    }
    if request.depth() == Depth::Memory {
      return Err(Error::DepthForbidden {
        depth: Depth::Memory,
        stage: Stage::Fetch,
      });
    }
    let key = context.cache_key().to_string();
    let (flight, is_owner) = self.join_flight(&key);
    if !is_owner {
      Diagnostics::bump(&self.diagnostics.flight_joins);
      return self.await_flight(&flight, context.token());
    }
    let outcome = self.produce(registry, context);
    self.finish_flight(&key, &flight, outcome.clone());
    outcome
  }

  // Owner path: decode chain, then memory cache write.
  fn produce(
    &self,
    registry: &ComponentRegistry,
    context: &mut RequestContext,
  ) -> Result<ImageData> {
    let mut interceptors: Vec<Arc<dyn DecodeInterceptor>> =
      registry.decode_interceptors().to_vec();
    if let Some(result_interceptor) = &self.result_cache_interceptor {
      interceptors.push(Arc::clone(result_interceptor));
    }
    let mut terminal = |context: &RequestContext| self.fetch_and_decode(registry, context);
    let mut chain = DecodeChain::new(&interceptors, context, &mut terminal);
    let decoded = chain.proceed()?;
    match decoded.data_from {
      DataFrom::DownloadCache => Diagnostics::bump(&self.diagnostics.download_cache_hits),
      DataFrom::ResultCache => Diagnostics::bump(&self.diagnostics.result_cache_hits),
      DataFrom::Local | DataFrom::Network => Diagnostics::bump(&self.diagnostics.fetches),
      DataFrom::MemoryCache => {}
    }

    context.token().check(Stage::CacheWrite)?;
    let request = context.request();
    if request.memory_cache_policy().write_enabled() && decoded.image.shareable() {
      let extras = memory_extras(&decoded);
      if let Some(pin) = self
        .memory_cache
        .put(context.cache_key(), Arc::clone(&decoded.image), extras)
      {
        return Ok(ImageData {
          image: LoadedImage::Pinned(pin),
          info: decoded.info,
          data_from: decoded.data_from,
          transformeds: decoded.transformeds,
        });
      }
    }
    Ok(ImageData {
      image: LoadedImage::Unpinned(decoded.image),
      info: decoded.info,
      data_from: decoded.data_from,
      transformeds: decoded.transformeds,
    })
  }

  // Terminal of the decode chain: download cache, fetch, decode, transform,
  // resize.
  fn fetch_and_decode(
    &self,
    registry: &ComponentRegistry,
    context: &RequestContext,
  ) -> Result<DecodeResult> {
    context.token().check(Stage::Fetch)?;
    let request = context.request().clone();
    let fetcher = registry.new_fetcher(context)?;

    let fetched = if fetcher.is_remote() {
      let policy = request.download_cache_policy();
      let cached = if policy.read_enabled() {
        self.read_download_cache(context)
      } else {
        None
      };
      match cached {
        Some(hit) => hit,
        None => {
          if request.depth() == Depth::Local {
            return Err(Error::DepthForbidden {
              depth: Depth::Local,
              stage: Stage::Fetch,
            });
          }
          let fetched = fetcher.fetch(context)?;
          if policy.write_enabled() {
            self.write_download_cache(context, &fetched);
          }
          fetched
        }
      }
    } else {
      fetcher.fetch(context)?
    };

    context.token().check(Stage::Decode)?;
    let decoder = registry.new_decoder(context, &fetched)?;
    let mut result = decoder.decode(context, &fetched)?;

    if let Some(transformations) = &request.options().transformations {
      for transformation in transformations {
        context.token().check(Stage::Transform)?;
        let Some(bitmap) = result.image.as_bitmap() else {
          break;
        };
        let transformed = transformation.transform(bitmap)?;
        result.image = Arc::new(transformed);
        result.transformeds.push(Transformed::new(transformation.key()));
      }
    }

    if let Some(size) = context.resolved_size() {
      if !request.options().resize_on_draw.unwrap_or(false) {
        context.token().check(Stage::Resize)?;
        let precision = request.options().precision.unwrap_or_default();
        let scale = request.options().scale.unwrap_or_default();
        if let Some(bitmap) = result.image.as_bitmap() {
          if let Some(resized) = transform::resize(bitmap, size, precision, scale) {
            result.image = Arc::new(resized);
            result
              .transformeds
              .push(Transformed::resize(size, precision, scale));
          }
        }
      }
    }
    Ok(result)
  }

  fn read_download_cache(&self, context: &RequestContext) -> Option<FetchResult> {
    let cache = self.download_cache.as_ref()?;
    let snapshot = cache.open_snapshot(context.download_cache_key())?;
    let bytes = snapshot.read_data().ok()?;
    let mime_type = match snapshot.read_meta() {
      Ok(meta) if !meta.is_empty() => String::from_utf8(meta).ok(),
      _ => None,
    };
    Some(FetchResult::new(
      DataSource::from_vec(bytes),
      mime_type,
      DataFrom::DownloadCache,
    ))
  }

  fn write_download_cache(&self, context: &RequestContext, fetched: &FetchResult) {
    let Some(cache) = self.download_cache.as_ref() else {
      return;
    };
    let Ok(bytes) = fetched.source().read_all() else {
      return;
    };
    let Some(editor) = cache.open_editor(context.download_cache_key()) else {
      return;
    };
    if editor.write_data(&bytes).is_err() {
      editor.abort();
      return;
    }
    if let Some(mime) = fetched.mime_type() {
      if editor.write_meta(mime.as_bytes()).is_err() {
        editor.abort();
        return;
      }
    }
    let _ = editor.commit();
  }

  fn join_flight(&self, key: &str) -> (Arc<Flight>, bool) {
    let mut in_flight = self.in_flight.lock().unwrap();
    if let Some(flight) = in_flight.get(key) {
      return (Arc::clone(flight), false);
    }
    let flight = Arc::new(Flight {
      outcome: Mutex::new(None),
      done: Condvar::new(),
    });
    in_flight.insert(key.to_string(), Arc::clone(&flight));
    (flight, true)
  }

  fn finish_flight(&self, key: &str, flight: &Arc<Flight>, outcome: Result<ImageData>) {
    {
      let mut slot = flight.outcome.lock().unwrap();
      *slot = Some(outcome);
    }
    flight.done.notify_all();
    self.in_flight.lock().unwrap().remove(key);
  }

  // Waiters poll their own token while parked, so cancelling one waiter
  // never aborts the shared execution.
  fn await_flight(&self, flight: &Arc<Flight>, token: &CancelToken) -> Result<ImageData> {
    let mut slot = flight.outcome.lock().unwrap();
    loop {
      if let Some(outcome) = slot.as_ref() {
        return outcome.clone();
      }
      token.check(Stage::MemoryLookup)?;
      let (next, _) = flight
        .done
        .wait_timeout(slot, Duration::from_millis(20))
        .unwrap();
      slot = next;
    }
  }
}

fn memory_extras(decoded: &DecodeResult) -> BTreeMap<String, String> {
  let mut extras = BTreeMap::new();
  extras.insert(EXTRA_WIDTH.to_string(), decoded.info.width.to_string());
  extras.insert(EXTRA_HEIGHT.to_string(), decoded.info.height.to_string());
  if let Some(mime) = &decoded.info.mime_type {
    extras.insert(EXTRA_MIME_TYPE.to_string(), mime.clone());
  }
  if !decoded.transformeds.is_empty() {
    let joined: Vec<&str> = decoded.transformeds.iter().map(|t| t.key()).collect();
    extras.insert(
      EXTRA_TRANSFORMEDS.to_string(),
      joined.join(&TRANSFORMEDS_SEPARATOR.to_string()),
    );
  }
  extras
}

fn image_data_from_pin(pin: ImagePin) -> ImageData {
  let extras = pin.extras();
  let parse = |key: &str, fallback: u32| {
    extras
      .get(key)
      .and_then(|v| v.parse().ok())
      .unwrap_or(fallback)
  };
  let info = ImageInfo {
    width: parse(EXTRA_WIDTH, pin.image().width()),
    height: parse(EXTRA_HEIGHT, pin.image().height()),
    mime_type: extras.get(EXTRA_MIME_TYPE).cloned(),
  };
  let transformeds = extras
    .get(EXTRA_TRANSFORMEDS)
    .map(|joined| {
      joined
        .split(TRANSFORMEDS_SEPARATOR)
        .map(Transformed::new)
        .collect()
    })
    .unwrap_or_default();
  ImageData {
    image: LoadedImage::Pinned(pin),
    info,
    data_from: DataFrom::MemoryCache,
    transformeds,
  }
}
