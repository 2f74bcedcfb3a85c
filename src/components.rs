//! Registry of pluggable pipeline components.
//!
//! Fetcher factories, decoder factories and interceptors are registered in
//! order; resolution walks the list and the first factory that accepts the
//! request wins. A request can carry its own registry, which is merged in
//! front of the engine-level one.

use crate::decode::{Decoder, DecoderFactory};
use crate::error::{DecodeError, FetchError, Result};
use crate::fetch::{FetchResult, Fetcher, FetcherFactory};
use crate::interceptors::{DecodeInterceptor, RequestInterceptor};
use crate::request_context::RequestContext;
use std::fmt;
use std::sync::Arc;

#[derive(Default)]
struct Components {
  fetcher_factories: Vec<Arc<dyn FetcherFactory>>,
  decoder_factories: Vec<Arc<dyn DecoderFactory>>,
  request_interceptors: Vec<Arc<dyn RequestInterceptor>>,
  decode_interceptors: Vec<Arc<dyn DecodeInterceptor>>,
}

/// Immutable, cheaply cloneable component set.
#[derive(Clone, Default)]
pub struct ComponentRegistry {
  inner: Arc<Components>,
}

impl ComponentRegistry {
  pub fn builder() -> ComponentRegistryBuilder {
    ComponentRegistryBuilder::default()
  }

  /// Identity comparison; two registries are "equal" only when they are the
  /// same instance.
  pub fn same_instance(&self, other: &ComponentRegistry) -> bool {
    Arc::ptr_eq(&self.inner, &other.inner)
  }

  pub fn is_empty(&self) -> bool {
    let c = &self.inner;
    c.fetcher_factories.is_empty()
      && c.decoder_factories.is_empty()
      && c.request_interceptors.is_empty()
      && c.decode_interceptors.is_empty()
  }

  /// First-match fetcher resolution.
  pub fn new_fetcher(&self, context: &RequestContext) -> Result<Box<dyn Fetcher>> {
    self
      .inner
      .fetcher_factories
      .iter()
      .find_map(|factory| factory.create(context))
      .ok_or_else(|| {
        FetchError::NoFetcher {
          uri: context.request().uri().to_string(),
        }
        .into()
      })
  }

  /// First-match decoder resolution.
  pub fn new_decoder(
    &self,
    context: &RequestContext,
    fetched: &FetchResult,
  ) -> Result<Box<dyn Decoder>> {
    self
      .inner
      .decoder_factories
      .iter()
      .find_map(|factory| factory.create(context, fetched))
      .ok_or_else(|| {
        DecodeError::NoDecoder {
          uri: context.request().uri().to_string(),
        }
        .into()
      })
  }

  pub fn request_interceptors(&self) -> &[Arc<dyn RequestInterceptor>] {
    &self.inner.request_interceptors
  }

  pub fn decode_interceptors(&self) -> &[Arc<dyn DecodeInterceptor>] {
    &self.inner.decode_interceptors
  }

  /// A registry with `self`'s components consulted before `base`'s. Used to
  /// overlay request-level components on the engine-level registry.
  pub fn merged(&self, base: &ComponentRegistry) -> ComponentRegistry {
    let inner = Components {
      fetcher_factories: self
        .inner
        .fetcher_factories
        .iter()
        .chain(&base.inner.fetcher_factories)
        .cloned()
        .collect(),
      decoder_factories: self
        .inner
        .decoder_factories
        .iter()
        .chain(&base.inner.decoder_factories)
        .cloned()
        .collect(),
      request_interceptors: self
        .inner
        .request_interceptors
        .iter()
        .chain(&base.inner.request_interceptors)
        .cloned()
        .collect(),
      decode_interceptors: self
        .inner
        .decode_interceptors
        .iter()
        .chain(&base.inner.decode_interceptors)
        .cloned()
        .collect(),
    };
    ComponentRegistry {
      inner: Arc::new(inner),
    }
  }
}

impl fmt::Debug for ComponentRegistry {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ComponentRegistry")
      .field("fetcher_factories", &self.inner.fetcher_factories.len())
      .field("decoder_factories", &self.inner.decoder_factories.len())
      .field("request_interceptors", &self.inner.request_interceptors.len())
      .field("decode_interceptors", &self.inner.decode_interceptors.len())
      .finish()
  }
}

#[derive(Default)]
pub struct ComponentRegistryBuilder {
  components: Components,
}

impl ComponentRegistryBuilder {
  pub fn add_fetcher_factory(mut self, factory: Arc<dyn FetcherFactory>) -> Self {
    self.components.fetcher_factories.push(factory);
    self
  }

  pub fn add_decoder_factory(mut self, factory: Arc<dyn DecoderFactory>) -> Self {
    self.components.decoder_factories.push(factory);
    self
  }

  pub fn add_request_interceptor(mut self, interceptor: Arc<dyn RequestInterceptor>) -> Self {
    self.components.request_interceptors.push(interceptor);
    self
  }

  pub fn add_decode_interceptor(mut self, interceptor: Arc<dyn DecodeInterceptor>) -> Self {
    self.components.decode_interceptors.push(interceptor);
    self
  }

  pub fn build(self) -> ComponentRegistry {
    ComponentRegistry {
      inner: Arc::new(self.components),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::control::CancelToken;
  use crate::decode::BitmapDecoderFactory;
  use crate::fetch::{DataSource, DataUrlFetcherFactory, FileFetcherFactory};
  use crate::request::ImageRequest;

  fn context(uri: &str) -> RequestContext {
    RequestContext::new(ImageRequest::new(uri), CancelToken::new())
  }

  #[test]
  fn first_matching_factory_wins() {
    let registry = ComponentRegistry::builder()
      .add_fetcher_factory(Arc::new(FileFetcherFactory))
      .add_fetcher_factory(Arc::new(DataUrlFetcherFactory))
      .build();

    assert!(registry.new_fetcher(&context("file:///a.png")).is_ok());
    assert!(registry.new_fetcher(&context("data:,abc")).is_ok());
    let err = registry
      .new_fetcher(&context("gopher://example"))
      .unwrap_err();
    assert!(matches!(err, crate::Error::Fetch(FetchError::NoFetcher { .. })));
  }

  #[test]
  fn no_decoder_for_unrecognized_bytes() {
    let registry = ComponentRegistry::builder()
      .add_decoder_factory(Arc::new(BitmapDecoderFactory))
      .build();
    let fetched = FetchResult::new(
      DataSource::from_vec(b"nope".to_vec()),
      None,
      crate::fetch::DataFrom::Local,
    );
    let err = registry
      .new_decoder(&context("mem://a"), &fetched)
      .unwrap_err();
    assert!(matches!(err, crate::Error::Decode(DecodeError::NoDecoder { .. })));
  }

  #[test]
  fn merged_consults_overlay_first() {
    let base = ComponentRegistry::builder()
      .add_fetcher_factory(Arc::new(FileFetcherFactory))
      .build();
    let overlay = ComponentRegistry::builder()
      .add_fetcher_factory(Arc::new(DataUrlFetcherFactory))
      .build();

    let merged = overlay.merged(&base);
    assert!(merged.new_fetcher(&context("data:,abc")).is_ok());
    assert!(merged.new_fetcher(&context("file:///a.png")).is_ok());
    assert!(!merged.same_instance(&base));
  }
}
