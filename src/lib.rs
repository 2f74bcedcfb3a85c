//! picfetch: an image-loading engine.
//!
//! Given an [`ImageRequest`] (URI + decode/transform options), the engine
//! fetches source bytes, decodes them into a bitmap, applies transformations
//! and resizing, and caches results at two layers so repeat requests for the
//! same logical image skip the expensive I/O and decode work:
//!
//! - [`cache::DiskCache`]: persistent, journal-backed, content-addressed LRU
//!   store with snapshot/editor transactions.
//! - [`cache::MemoryCache`]: in-process byte-budgeted LRU of decoded images;
//!   entries pinned by active readers are never evicted.
//!
//! Concurrent requests that share a cache key attach to a single in-flight
//! execution instead of racing ([`RequestExecutor`]).

pub mod cache;
pub mod components;
pub mod control;
pub mod decode;
pub mod engine;
pub mod error;
pub mod fetch;
pub mod images;
pub mod interceptors;
pub mod manager;
pub mod request;
pub mod request_context;
pub mod transform;
pub mod util;

pub use cache::{DiskCache, ImagePin, MemoryCache};
pub use components::ComponentRegistry;
pub use control::{CancelToken, Stage};
pub use engine::{DiagnosticsSnapshot, ImageData, LoadedImage, RequestExecutor};
pub use error::{Error, Result};
pub use fetch::DataFrom;
pub use images::{BitmapImage, Image};
pub use interceptors::{DecodeInterceptor, RequestInterceptor};
pub use manager::{Disposable, JobHandle, RequestManager};
pub use request::{CachePolicy, Depth, ImageOptions, ImageRequest, Size};
pub use request_context::RequestContext;
