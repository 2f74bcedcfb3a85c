//! Persistent LRU cache with snapshot/editor transactions.
//!
//! Entries are addressed by an arbitrary string key; on disk each entry is a
//! data file plus a metadata sidecar, both named by the sha-256 of the key. A
//! JSONL journal ([`disk_journal`](super::disk_journal)) tracks sizes and
//! recency so eviction never rescans the directory.
//!
//! Concurrency follows single-writer / multi-reader per key: any number of
//! [`Snapshot`]s may be open while no [`Editor`] is, and an editor excludes
//! everything else. Conflicting opens return `None` instead of blocking.
//! Writers stage into `.tmp` files and publish with `rename`, so readers
//! never observe partial entries.

use super::disk_journal::Journal;
use crate::error::{CacheError, ConfigError, Result};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

/// Bump when the on-disk layout changes; a mismatch wipes the cache.
const INTERNAL_VERSION: u32 = 1;

const VERSION_FILE: &str = "version.json";
const DATA_EXT: &str = "dat";
const META_EXT: &str = "meta";

pub const DEFAULT_MAX_SIZE: u64 = 300 * 1024 * 1024;

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
struct VersionStamp {
  app_version: u32,
  internal_version: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
  Idle,
  Reading(u32),
  Editing,
}

#[derive(Debug)]
struct KeyState {
  phase: Mutex<Phase>,
  /// Wakes `with_key_lock` waiters; open/edit conflicts never block.
  op_done: Condvar,
  op_busy: Mutex<bool>,
}

impl KeyState {
  fn new() -> Self {
    Self {
      phase: Mutex::new(Phase::Idle),
      op_done: Condvar::new(),
      op_busy: Mutex::new(false),
    }
  }
}

#[derive(Debug)]
struct DiskCacheInner {
  directory: PathBuf,
  max_size: u64,
  app_version: u32,
  journal: Journal,
  keys: Mutex<FxHashMap<String, Arc<KeyState>>>,
}

/// Handle to one cache directory. Cloning shares the same cache.
#[derive(Debug, Clone)]
pub struct DiskCache {
  inner: Arc<DiskCacheInner>,
}

/// Configures and opens a [`DiskCache`].
#[derive(Debug)]
pub struct DiskCacheBuilder {
  directory: PathBuf,
  max_size: u64,
  app_version: u32,
}

impl DiskCacheBuilder {
  pub fn new(directory: impl Into<PathBuf>) -> Self {
    Self {
      directory: directory.into(),
      max_size: DEFAULT_MAX_SIZE,
      app_version: 1,
    }
  }

  /// Byte budget; least-recently-used entries are dropped beyond it.
  pub fn max_size(mut self, max_size: u64) -> Self {
    self.max_size = max_size;
    self
  }

  /// Application data version. Changing it wipes the cache on next open.
  pub fn app_version(mut self, app_version: u32) -> Self {
    self.app_version = app_version;
    self
  }

  pub fn build(self) -> Result<DiskCache> {
    if self.max_size == 0 {
      return Err(ConfigError::InvalidMaxSize { size: 0 }.into());
    }
    if self.app_version < 1 || self.app_version > i16::MAX as u32 {
      return Err(
        ConfigError::InvalidAppVersion {
          version: self.app_version,
        }
        .into(),
      );
    }
    fs::create_dir_all(&self.directory)
      .map_err(|e| CacheError::io("creating cache directory", &e))?;

    let inner = DiskCacheInner {
      journal: Journal::new(&self.directory),
      directory: self.directory,
      max_size: self.max_size,
      app_version: self.app_version,
      keys: Mutex::new(FxHashMap::default()),
    };
    let cache = DiskCache {
      inner: Arc::new(inner),
    };

    if !cache.version_matches() {
      cache.wipe()?;
    } else if cache.inner.journal.refresh().is_err() {
      cache.wipe()?;
    }
    Ok(cache)
  }
}

impl DiskCache {
  pub fn builder(directory: impl Into<PathBuf>) -> DiskCacheBuilder {
    DiskCacheBuilder::new(directory)
  }

  pub fn directory(&self) -> &Path {
    &self.inner.directory
  }

  pub fn max_size(&self) -> u64 {
    self.inner.max_size
  }

  pub fn app_version(&self) -> u32 {
    self.inner.app_version
  }

  /// Current total bytes of committed entries.
  pub fn size(&self) -> u64 {
    self.inner.journal.total_bytes()
  }

  pub fn entry_count(&self) -> usize {
    self.inner.journal.entry_count()
  }

  /// Open a read handle on a committed entry. Returns `None` on a miss or
  /// while an editor holds the key.
  pub fn open_snapshot(&self, key: &str) -> Option<Snapshot> {
    if !self.inner.journal.contains(key) {
      return None;
    }
    let state = self.key_state(key);
    let mut phase = state.phase.lock().unwrap();
    if *phase == Phase::Editing {
      return None;
    }
    let (data_path, meta_path) = self.entry_paths(key);
    if !data_path.is_file() {
      // Journal and directory disagree; drop the stale record.
      drop(phase);
      let _ = self.inner.journal.record_removal(key);
      self.release_state(key, &state);
      return None;
    }
    *phase = match *phase {
      Phase::Idle => Phase::Reading(1),
      Phase::Reading(n) => Phase::Reading(n + 1),
      Phase::Editing => unreachable!(),
    };
    drop(phase);
    let _ = self.inner.journal.record_read(key, now_seconds());
    Some(Snapshot {
      cache: self.clone(),
      state,
      key: key.to_string(),
      data_path,
      meta_path,
      released: false,
    })
  }

  /// Open a write handle on a key. Returns `None` while any snapshot or
  /// another editor holds the key.
  pub fn open_editor(&self, key: &str) -> Option<Editor> {
    let state = self.key_state(key);
    let mut phase = state.phase.lock().unwrap();
    if *phase != Phase::Idle {
      drop(phase);
      self.release_state(key, &state);
      return None;
    }
    *phase = Phase::Editing;
    drop(phase);
    Some(self.new_editor(key, state))
  }

  fn new_editor(&self, key: &str, state: Arc<KeyState>) -> Editor {
    let (data_path, meta_path) = self.entry_paths(key);
    Editor {
      cache: self.clone(),
      state,
      key: key.to_string(),
      tmp_data: data_path.with_extension("dat.tmp"),
      tmp_meta: meta_path.with_extension("meta.tmp"),
      data_path,
      meta_path,
      finished: false,
    }
  }

  /// Remove one entry. Returns `false` when the entry does not exist or is
  /// held open by a snapshot or editor.
  pub fn remove(&self, key: &str) -> bool {
    let state = self.key_state(key);
    let phase = state.phase.lock().unwrap();
    if *phase != Phase::Idle {
      return false;
    }
    let existed = self.inner.journal.contains(key);
    let (data_path, meta_path) = self.entry_paths(key);
    let _ = fs::remove_file(&data_path);
    let _ = fs::remove_file(&meta_path);
    let _ = self.inner.journal.record_removal(key);
    drop(phase);
    self.release_state(key, &state);
    existed
  }

  /// Remove every entry not currently held open.
  pub fn clear(&self) {
    for (key, _) in self.inner.journal.keys_lru_first() {
      self.remove(&key);
    }
  }

  /// Run `f` while holding an exclusive per-key operation lock. Callers
  /// composing a read-check-write sequence (say, "snapshot, miss, edit,
  /// commit") use this to keep concurrent writers of the same key from
  /// interleaving. Snapshots and editors themselves do not take this lock.
  pub fn with_key_lock<T>(&self, key: &str, f: impl FnOnce() -> T) -> T {
    let state = self.key_state(key);
    let mut busy = state.op_busy.lock().unwrap();
    while *busy {
      busy = state.op_done.wait(busy).unwrap();
    }
    *busy = true;
    drop(busy);

    let out = f();

    *state.op_busy.lock().unwrap() = false;
    state.op_done.notify_one();
    self.release_state(key, &state);
    out
  }

  fn key_state(&self, key: &str) -> Arc<KeyState> {
    let mut keys = self.inner.keys.lock().unwrap();
    Arc::clone(
      keys
        .entry(key.to_string())
        .or_insert_with(|| Arc::new(KeyState::new())),
    )
  }

  // Drop the map entry once nothing else references it and the key is idle.
  fn release_state(&self, key: &str, state: &Arc<KeyState>) {
    let mut keys = self.inner.keys.lock().unwrap();
    if Arc::strong_count(state) == 2 && *state.phase.lock().unwrap() == Phase::Idle {
      keys.remove(key);
    }
  }

  fn entry_paths(&self, key: &str) -> (PathBuf, PathBuf) {
    let hash = hash_key(key);
    (
      self.inner.directory.join(format!("{hash}.{DATA_EXT}")),
      self.inner.directory.join(format!("{hash}.{META_EXT}")),
    )
  }

  fn version_matches(&self) -> bool {
    let expected = VersionStamp {
      app_version: self.inner.app_version,
      internal_version: INTERNAL_VERSION,
    };
    let path = self.inner.directory.join(VERSION_FILE);
    let Ok(contents) = fs::read_to_string(&path) else {
      return false;
    };
    match serde_json::from_str::<VersionStamp>(&contents) {
      Ok(stamp) => stamp == expected,
      Err(_) => false,
    }
  }

  // Delete every entry file, reset the journal and restamp the version.
  fn wipe(&self) -> Result<()> {
    if let Ok(read_dir) = fs::read_dir(&self.inner.directory) {
      for entry in read_dir.flatten() {
        let path = entry.path();
        let ext = path.extension().and_then(|e| e.to_str());
        if matches!(ext, Some("dat" | "meta" | "tmp" | "jsonl")) {
          let _ = fs::remove_file(&path);
        }
      }
    }
    self
      .inner
      .journal
      .reset()
      .map_err(|e| CacheError::io("resetting journal", &e))?;
    let stamp = VersionStamp {
      app_version: self.inner.app_version,
      internal_version: INTERNAL_VERSION,
    };
    let body = serde_json::to_string(&stamp)
      .map_err(|e| CacheError::Io {
        context: "encoding version stamp".to_string(),
        reason: e.to_string(),
      })?;
    fs::write(self.inner.directory.join(VERSION_FILE), body)
      .map_err(|e| CacheError::io("writing version stamp", &e))?;
    Ok(())
  }

  // Walk LRU-first, dropping idle entries until the budget holds. Entries
  // held open are skipped; they get another chance on the next commit.
  fn evict_if_needed(&self) {
    if self.inner.journal.total_bytes() <= self.inner.max_size {
      return;
    }
    let mut freed = 0u64;
    let total = self.inner.journal.total_bytes();
    for (key, len) in self.inner.journal.keys_lru_first() {
      if total - freed <= self.inner.max_size {
        break;
      }
      if self.remove(&key) {
        freed = freed.saturating_add(len);
      }
    }
  }

  fn finish_read(&self, key: &str, state: &Arc<KeyState>) {
    let mut phase = state.phase.lock().unwrap();
    *phase = match *phase {
      Phase::Reading(1) => Phase::Idle,
      Phase::Reading(n) if n > 1 => Phase::Reading(n - 1),
      other => other,
    };
    drop(phase);
    self.release_state(key, state);
  }

  fn finish_edit(&self, key: &str, state: &Arc<KeyState>, next: Phase) {
    let mut phase = state.phase.lock().unwrap();
    if *phase == Phase::Editing {
      *phase = next;
    }
    drop(phase);
    self.release_state(key, state);
  }
}

fn hash_key(key: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(key.as_bytes());
  let digest = hasher.finalize();
  let mut out = String::with_capacity(digest.len() * 2);
  for byte in digest {
    out.push_str(&format!("{byte:02x}"));
  }
  out
}

fn now_seconds() -> u64 {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .map(|d| d.as_secs())
    .unwrap_or(0)
}

/// Read handle on one committed entry. Holds off editors for its key until
/// dropped.
#[derive(Debug)]
pub struct Snapshot {
  cache: DiskCache,
  state: Arc<KeyState>,
  key: String,
  data_path: PathBuf,
  meta_path: PathBuf,
  released: bool,
}

impl Snapshot {
  pub fn key(&self) -> &str {
    &self.key
  }

  pub fn read_data(&self) -> Result<Vec<u8>> {
    read_file(&self.data_path)
  }

  pub fn read_meta(&self) -> Result<Vec<u8>> {
    read_file(&self.meta_path)
  }

  /// Atomically trade this snapshot for an editor. Succeeds only when this
  /// is the sole open handle on the key, so no other reader can observe the
  /// entry mid-rewrite.
  pub fn close_and_open_editor(mut self) -> Option<Editor> {
    let cache = self.cache.clone();
    let state = Arc::clone(&self.state);
    {
      let mut phase = state.phase.lock().unwrap();
      if *phase != Phase::Reading(1) {
        return None;
      }
      *phase = Phase::Editing;
    }
    self.released = true;
    let key = self.key.clone();
    drop(self);
    Some(cache.new_editor(&key, state))
  }
}

impl Drop for Snapshot {
  fn drop(&mut self) {
    if !self.released {
      self.cache.finish_read(&self.key, &self.state);
    }
  }
}

/// Write handle: stages a new entry in temp files, published on [`commit`].
/// Dropping without committing aborts and leaves any previous entry intact.
///
/// [`commit`]: Editor::commit
#[derive(Debug)]
pub struct Editor {
  cache: DiskCache,
  state: Arc<KeyState>,
  key: String,
  tmp_data: PathBuf,
  tmp_meta: PathBuf,
  data_path: PathBuf,
  meta_path: PathBuf,
  finished: bool,
}

impl Editor {
  pub fn key(&self) -> &str {
    &self.key
  }

  pub fn write_data(&self, bytes: &[u8]) -> Result<()> {
    write_file(&self.tmp_data, bytes)
  }

  pub fn write_meta(&self, bytes: &[u8]) -> Result<()> {
    write_file(&self.tmp_meta, bytes)
  }

  pub fn commit(mut self) -> Result<()> {
    self.commit_inner(Phase::Idle)?;
    Ok(())
  }

  /// Commit and immediately reopen the entry for reading, without letting a
  /// competing editor in between.
  pub fn commit_and_open_snapshot(mut self) -> Result<Snapshot> {
    self.commit_inner(Phase::Reading(1))?;
    let cache = self.cache.clone();
    let state = Arc::clone(&self.state);
    let key = self.key.clone();
    let (data_path, meta_path) = cache.entry_paths(&key);
    let _ = cache.inner.journal.record_read(&key, now_seconds());
    Ok(Snapshot {
      cache,
      state,
      key,
      data_path,
      meta_path,
      released: false,
    })
  }

  pub fn abort(mut self) {
    self.abort_inner();
  }

  fn commit_inner(&mut self, next: Phase) -> Result<()> {
    if self.finished {
      return Err(
        CacheError::Io {
          context: "committing entry".to_string(),
          reason: "editor already finished".to_string(),
        }
        .into(),
      );
    }
    if !self.tmp_data.is_file() {
      self.abort_inner();
      return Err(
        CacheError::Io {
          context: "committing entry".to_string(),
          reason: "no data written".to_string(),
        }
        .into(),
      );
    }
    if !self.tmp_meta.is_file() {
      // Entries always carry a sidecar, even an empty one.
      if let Err(e) = write_file(&self.tmp_meta, &[]) {
        self.abort_inner();
        return Err(e);
      }
    }
    let data_len = file_len(&self.tmp_data);
    let meta_len = file_len(&self.tmp_meta);
    if let Err(e) = fs::rename(&self.tmp_data, &self.data_path) {
      self.abort_inner();
      return Err(CacheError::io("publishing data file", &e).into());
    }
    if let Err(e) = fs::rename(&self.tmp_meta, &self.meta_path) {
      // Half-published entry: roll the data file back out.
      let _ = fs::remove_file(&self.data_path);
      self.abort_inner();
      return Err(CacheError::io("publishing meta file", &e).into());
    }
    let _ = self
      .cache
      .inner
      .journal
      .record_insert(&self.key, now_seconds(), data_len + meta_len);
    self.finished = true;
    self.cache.finish_edit(&self.key, &self.state, next);
    self.cache.evict_if_needed();
    Ok(())
  }

  fn abort_inner(&mut self) {
    if self.finished {
      return;
    }
    let _ = fs::remove_file(&self.tmp_data);
    let _ = fs::remove_file(&self.tmp_meta);
    self.finished = true;
    self.cache.finish_edit(&self.key, &self.state, Phase::Idle);
  }
}

impl Drop for Editor {
  fn drop(&mut self) {
    self.abort_inner();
  }
}

fn read_file(path: &Path) -> Result<Vec<u8>> {
  let mut buf = Vec::new();
  File::open(path)
    .and_then(|mut f| f.read_to_end(&mut buf))
    .map_err(|e| CacheError::io(format!("reading {}", path.display()), &e))?;
  Ok(buf)
}

fn write_file(path: &Path, bytes: &[u8]) -> Result<()> {
  File::create(path)
    .and_then(|mut f| {
      f.write_all(bytes)?;
      f.flush()
    })
    .map_err(|e| CacheError::io(format!("writing {}", path.display()), &e).into())
}

fn file_len(path: &Path) -> u64 {
  fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
  use super::*;

  fn cache_in(dir: &Path, max_size: u64) -> DiskCache {
    DiskCache::builder(dir).max_size(max_size).build().unwrap()
  }

  #[test]
  fn builder_rejects_bad_config() {
    let dir = tempfile::tempdir().unwrap();
    assert!(DiskCache::builder(dir.path()).max_size(0).build().is_err());
    assert!(DiskCache::builder(dir.path())
      .app_version(0)
      .build()
      .is_err());
    assert!(DiskCache::builder(dir.path())
      .app_version(i16::MAX as u32 + 1)
      .build()
      .is_err());
    assert!(DiskCache::builder(dir.path())
      .app_version(i16::MAX as u32)
      .build()
      .is_ok());
  }

  #[test]
  fn uncommitted_entries_are_invisible() {
    let dir = tempfile::tempdir().unwrap();
    let cache = cache_in(dir.path(), 10_000);
    let editor = cache.open_editor("k").unwrap();
    editor.write_data(b"half done").unwrap();
    assert!(cache.open_snapshot("k").is_none());
    drop(editor); // abort
    assert!(cache.open_snapshot("k").is_none());
    assert_eq!(cache.size(), 0);
  }

  #[test]
  fn commit_publishes_atomically() {
    let dir = tempfile::tempdir().unwrap();
    let cache = cache_in(dir.path(), 10_000);
    let editor = cache.open_editor("k").unwrap();
    editor.write_data(b"payload").unwrap();
    editor.write_meta(b"{\"v\":1}").unwrap();
    editor.commit().unwrap();

    let snapshot = cache.open_snapshot("k").unwrap();
    assert_eq!(snapshot.read_data().unwrap(), b"payload");
    assert_eq!(snapshot.read_meta().unwrap(), b"{\"v\":1}");
    assert_eq!(cache.size(), 7 + 7);
  }

  #[test]
  fn sole_reader_can_trade_for_editor() {
    let dir = tempfile::tempdir().unwrap();
    let cache = cache_in(dir.path(), 10_000);
    let editor = cache.open_editor("k").unwrap();
    editor.write_data(b"v1").unwrap();
    editor.commit().unwrap();

    let snapshot = cache.open_snapshot("k").unwrap();
    let editor = snapshot.close_and_open_editor().unwrap();
    editor.write_data(b"v2").unwrap();
    editor.commit().unwrap();
    assert_eq!(cache.open_snapshot("k").unwrap().read_data().unwrap(), b"v2");
  }

  #[test]
  fn second_reader_blocks_the_trade() {
    let dir = tempfile::tempdir().unwrap();
    let cache = cache_in(dir.path(), 10_000);
    let editor = cache.open_editor("k").unwrap();
    editor.write_data(b"v1").unwrap();
    editor.commit().unwrap();

    let first = cache.open_snapshot("k").unwrap();
    let _second = cache.open_snapshot("k").unwrap();
    assert!(first.close_and_open_editor().is_none());
    // The failed trade must not have leaked the first snapshot's hold.
    assert!(cache.open_snapshot("k").is_some());
  }
}
