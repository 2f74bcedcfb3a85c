//! In-process LRU cache of decoded images with a byte budget.
//!
//! Values are pinned while in use: a [`ImagePin`] keeps its entry exempt from
//! eviction, so the budget can be transiently exceeded while consumers hold
//! more live images than it allows. Once the last pin on an entry drops, the
//! cache retries eviction back down to the budget.

use crate::error::{ConfigError, Result};
use crate::images::Image;
use lru::LruCache;
use rustc_hash::FxBuildHasher;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

pub const DEFAULT_MAX_SIZE: u64 = 256 * 1024 * 1024;

#[derive(Debug)]
struct Entry {
  key: String,
  image: Arc<dyn Image>,
  extras: BTreeMap<String, String>,
  byte_size: u64,
  pins: AtomicUsize,
}

impl Entry {
  fn pinned(&self) -> bool {
    self.pins.load(Ordering::SeqCst) > 0
  }
}

struct CacheState {
  entries: LruCache<String, Arc<Entry>, FxBuildHasher>,
  total: u64,
}

struct Shared {
  max_size: u64,
  state: Mutex<CacheState>,
}

impl Shared {
  // Evict LRU-first down to the budget, skipping pinned entries.
  fn evict_to_budget(&self) {
    let mut state = self.state.lock().unwrap();
    if state.total <= self.max_size {
      return;
    }
    let victims: Vec<String> = state
      .entries
      .iter()
      .rev()
      .filter(|(_, entry)| !entry.pinned())
      .map(|(key, _)| key.clone())
      .collect();
    for key in victims {
      if state.total <= self.max_size {
        break;
      }
      if let Some(entry) = state.entries.pop(&key) {
        state.total = state.total.saturating_sub(entry.byte_size);
      }
    }
  }
}

/// Byte-budgeted LRU of decoded images. Cloning shares the same cache.
#[derive(Clone)]
pub struct MemoryCache {
  shared: Arc<Shared>,
}

impl MemoryCache {
  pub fn new(max_size: u64) -> Result<Self> {
    if max_size == 0 {
      return Err(ConfigError::InvalidMaxSize { size: 0 }.into());
    }
    Ok(Self {
      shared: Arc::new(Shared {
        max_size,
        state: Mutex::new(CacheState {
          entries: LruCache::unbounded_with_hasher(FxBuildHasher),
          total: 0,
        }),
      }),
    })
  }

  pub fn max_size(&self) -> u64 {
    self.shared.max_size
  }

  /// Current total bytes, including pinned entries.
  pub fn size(&self) -> u64 {
    self.shared.state.lock().unwrap().total
  }

  pub fn entry_count(&self) -> usize {
    self.shared.state.lock().unwrap().entries.len()
  }

  /// Look up and pin. A hit whose image fails its validity check is purged
  /// and reported as a miss.
  pub fn get(&self, key: &str) -> Option<ImagePin> {
    let mut state = self.shared.state.lock().unwrap();
    let entry = state.entries.get(key)?;
    if !entry.image.check_valid() {
      let entry = state.entries.pop(key).unwrap();
      state.total = state.total.saturating_sub(entry.byte_size);
      return None;
    }
    Some(pin(entry, &self.shared))
  }

  /// Insert and pin. Returns `None` when the image alone exceeds the whole
  /// budget; such values are handed to the caller unpinned and uncached.
  pub fn put(
    &self,
    key: &str,
    image: Arc<dyn Image>,
    extras: BTreeMap<String, String>,
  ) -> Option<ImagePin> {
    let byte_size = image.byte_count();
    if byte_size > self.shared.max_size {
      return None;
    }
    let entry = Arc::new(Entry {
      key: key.to_string(),
      image,
      extras,
      byte_size,
      pins: AtomicUsize::new(0),
    });
    let out = {
      let mut state = self.shared.state.lock().unwrap();
      if let Some(prev) = state.entries.pop(key) {
        state.total = state.total.saturating_sub(prev.byte_size);
      }
      state.total = state.total.saturating_add(byte_size);
      state.entries.put(key.to_string(), Arc::clone(&entry));
      pin(&entry, &self.shared)
    };
    self.shared.evict_to_budget();
    Some(out)
  }

  /// Remove one entry. Outstanding pins keep the image itself alive; only
  /// its cache residency ends.
  pub fn remove(&self, key: &str) -> bool {
    let mut state = self.shared.state.lock().unwrap();
    match state.entries.pop(key) {
      Some(entry) => {
        state.total = state.total.saturating_sub(entry.byte_size);
        true
      }
      None => false,
    }
  }

  /// Evict unpinned entries, LRU first, until the total is at most
  /// `target_bytes`.
  pub fn trim(&self, target_bytes: u64) {
    let mut state = self.shared.state.lock().unwrap();
    let victims: Vec<String> = state
      .entries
      .iter()
      .rev()
      .filter(|(_, entry)| !entry.pinned())
      .map(|(key, _)| key.clone())
      .collect();
    for key in victims {
      if state.total <= target_bytes {
        break;
      }
      if let Some(entry) = state.entries.pop(&key) {
        state.total = state.total.saturating_sub(entry.byte_size);
      }
    }
  }

  /// Drop every unpinned entry. Pinned entries stay resident.
  pub fn clear(&self) {
    self.trim(0);
  }

  /// Keys in most-recently-used-first order.
  pub fn keys(&self) -> Vec<String> {
    let state = self.shared.state.lock().unwrap();
    state.entries.iter().map(|(key, _)| key.clone()).collect()
  }
}

impl fmt::Debug for MemoryCache {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let state = self.shared.state.lock().unwrap();
    f.debug_struct("MemoryCache")
      .field("max_size", &self.shared.max_size)
      .field("total", &state.total)
      .field("entries", &state.entries.len())
      .finish()
  }
}

fn pin(entry: &Arc<Entry>, shared: &Arc<Shared>) -> ImagePin {
  entry.pins.fetch_add(1, Ordering::SeqCst);
  ImagePin {
    entry: Arc::clone(entry),
    shared: Arc::downgrade(shared),
  }
}

/// Pinned view of a cached image. The entry cannot be evicted while any pin
/// on it is alive.
pub struct ImagePin {
  entry: Arc<Entry>,
  shared: Weak<Shared>,
}

impl ImagePin {
  pub fn key(&self) -> &str {
    &self.entry.key
  }

  pub fn image(&self) -> &Arc<dyn Image> {
    &self.entry.image
  }

  pub fn extras(&self) -> &BTreeMap<String, String> {
    &self.entry.extras
  }
}

impl Clone for ImagePin {
  fn clone(&self) -> Self {
    self.entry.pins.fetch_add(1, Ordering::SeqCst);
    Self {
      entry: Arc::clone(&self.entry),
      shared: Weak::clone(&self.shared),
    }
  }
}

impl Drop for ImagePin {
  fn drop(&mut self) {
    let was = self.entry.pins.fetch_sub(1, Ordering::SeqCst);
    if was == 1 {
      // Last pin released; deferred eviction may now proceed.
      if let Some(shared) = self.shared.upgrade() {
        shared.evict_to_budget();
      }
    }
  }
}

impl fmt::Debug for ImagePin {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ImagePin")
      .field("key", &self.entry.key)
      .field("pins", &self.entry.pins.load(Ordering::SeqCst))
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::images::FakeImage;

  fn image(width: u32, height: u32) -> Arc<dyn Image> {
    Arc::new(FakeImage::new(width, height))
  }

  // FakeImage accounts width * height * 4 bytes.
  fn cache(budget: u64) -> MemoryCache {
    MemoryCache::new(budget).unwrap()
  }

  #[test]
  fn zero_budget_is_rejected() {
    assert!(MemoryCache::new(0).is_err());
  }

  #[test]
  fn lru_eviction_under_pressure() {
    let cache = cache(800);
    drop(cache.put("a", image(10, 10), BTreeMap::new()));
    drop(cache.put("b", image(10, 10), BTreeMap::new()));
    // 400 + 400 fits exactly; c forces the least recently used out.
    drop(cache.put("c", image(10, 10), BTreeMap::new()));
    assert!(cache.get("a").is_none());
    assert!(cache.get("b").is_some());
    assert!(cache.get("c").is_some());
    assert_eq!(cache.size(), 800);
  }

  #[test]
  fn pinned_entries_survive_eviction() {
    let cache = cache(800);
    let pinned_a = cache.put("a", image(10, 10), BTreeMap::new()).unwrap();
    drop(cache.put("b", image(10, 10), BTreeMap::new()));
    drop(cache.put("c", image(10, 10), BTreeMap::new()));

    // b was evictable, a was not.
    assert!(cache.get("b").is_none());
    assert!(cache.get("a").is_some());
    assert_eq!(pinned_a.key(), "a");

    // Once the pins drop, the budget is enforced again.
    drop(cache.get("a"));
    drop(pinned_a);
    assert!(cache.size() <= 800);
  }

  #[test]
  fn oversized_value_is_refused() {
    let cache = cache(100);
    assert!(cache.put("big", image(100, 100), BTreeMap::new()).is_none());
    assert_eq!(cache.entry_count(), 0);
  }

  #[test]
  fn invalid_image_reads_as_miss_and_purges() {
    let cache = cache(10_000);
    let fake = Arc::new(FakeImage::new(4, 4));
    drop(cache.put("k", fake.clone(), BTreeMap::new()));
    assert!(cache.get("k").is_some());

    fake.set_valid(false);
    assert!(cache.get("k").is_none());
    assert_eq!(cache.entry_count(), 0);
    assert_eq!(cache.size(), 0);
  }

  #[test]
  fn remove_ends_residency_but_pins_keep_the_image() {
    let cache = cache(10_000);
    let pin = cache.put("k", image(4, 4), BTreeMap::new()).unwrap();
    assert!(cache.remove("k"));
    assert!(!cache.remove("k"));
    assert_eq!(cache.size(), 0);
    assert!(cache.get("k").is_none());
    assert_eq!(pin.image().width(), 4);
  }

  #[test]
  fn get_refreshes_recency() {
    let cache = cache(800);
    drop(cache.put("a", image(10, 10), BTreeMap::new()));
    drop(cache.put("b", image(10, 10), BTreeMap::new()));
    drop(cache.get("a"));
    drop(cache.put("c", image(10, 10), BTreeMap::new()));
    // b is now the least recently used.
    assert!(cache.get("b").is_none());
    assert!(cache.get("a").is_some());
  }

  #[test]
  fn clear_skips_pinned() {
    let cache = cache(10_000);
    let pin = cache.put("keep", image(5, 5), BTreeMap::new()).unwrap();
    drop(cache.put("drop", image(5, 5), BTreeMap::new()));
    cache.clear();
    assert_eq!(cache.keys(), vec!["keep".to_string()]);
    drop(pin);
  }
}
