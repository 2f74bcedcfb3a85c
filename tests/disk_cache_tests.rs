use picfetch::DiskCache;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

fn cache_in(dir: &std::path::Path, max_size: u64) -> DiskCache {
  DiskCache::builder(dir).max_size(max_size).build().unwrap()
}

fn put(cache: &DiskCache, key: &str, data: &[u8]) {
  let editor = cache.open_editor(key).expect("editor should be available");
  editor.write_data(data).unwrap();
  editor.commit().unwrap();
}

#[test]
fn round_trip_with_metadata() {
  let dir = tempfile::tempdir().unwrap();
  let cache = cache_in(dir.path(), 10_000);

  let editor = cache.open_editor("http://example.com/a.png").unwrap();
  editor.write_data(b"raw image bytes").unwrap();
  editor.write_meta(b"image/png").unwrap();
  editor.commit().unwrap();

  let snapshot = cache.open_snapshot("http://example.com/a.png").unwrap();
  assert_eq!(snapshot.read_data().unwrap(), b"raw image bytes");
  assert_eq!(snapshot.read_meta().unwrap(), b"image/png");
  assert_eq!(cache.entry_count(), 1);
}

#[test]
fn miss_returns_none() {
  let dir = tempfile::tempdir().unwrap();
  let cache = cache_in(dir.path(), 10_000);
  assert!(cache.open_snapshot("never written").is_none());
}

#[test]
fn abort_preserves_previous_entry() {
  let dir = tempfile::tempdir().unwrap();
  let cache = cache_in(dir.path(), 10_000);
  put(&cache, "k", b"version one");

  let editor = cache.open_editor("k").unwrap();
  editor.write_data(b"version two, never committed").unwrap();
  editor.abort();

  let snapshot = cache.open_snapshot("k").unwrap();
  assert_eq!(snapshot.read_data().unwrap(), b"version one");
}

#[test]
fn only_one_editor_per_key() {
  let dir = tempfile::tempdir().unwrap();
  let cache = cache_in(dir.path(), 10_000);

  let first = cache.open_editor("k").unwrap();
  assert!(cache.open_editor("k").is_none());
  // A different key is unaffected.
  assert!(cache.open_editor("other").is_some());
  drop(first);
  assert!(cache.open_editor("k").is_some());
}

#[test]
fn open_snapshot_blocks_editor_and_vice_versa() {
  let dir = tempfile::tempdir().unwrap();
  let cache = cache_in(dir.path(), 10_000);
  put(&cache, "k", b"data");

  let snapshot = cache.open_snapshot("k").unwrap();
  assert!(cache.open_editor("k").is_none());
  drop(snapshot);

  let editor = cache.open_editor("k").unwrap();
  assert!(cache.open_snapshot("k").is_none());
  drop(editor);
  assert!(cache.open_snapshot("k").is_some());
}

#[test]
fn concurrent_readers_share_an_entry() {
  let dir = tempfile::tempdir().unwrap();
  let cache = cache_in(dir.path(), 10_000);
  put(&cache, "k", b"shared bytes");

  let barrier = Arc::new(Barrier::new(4));
  let reads = Arc::new(AtomicUsize::new(0));
  let mut handles = Vec::new();
  for _ in 0..4 {
    let cache = cache.clone();
    let barrier = Arc::clone(&barrier);
    let reads = Arc::clone(&reads);
    handles.push(thread::spawn(move || {
      barrier.wait();
      let snapshot = cache.open_snapshot("k").expect("readers never exclude each other");
      assert_eq!(snapshot.read_data().unwrap(), b"shared bytes");
      reads.fetch_add(1, Ordering::SeqCst);
    }));
  }
  for handle in handles {
    handle.join().unwrap();
  }
  assert_eq!(reads.load(Ordering::SeqCst), 4);
  // All snapshots closed; the key is editable again.
  assert!(cache.open_editor("k").is_some());
}

#[test]
fn lru_eviction_drops_oldest_beyond_budget() {
  let dir = tempfile::tempdir().unwrap();
  let cache = cache_in(dir.path(), 1000);

  put(&cache, "a", &[1u8; 400]);
  put(&cache, "b", &[2u8; 400]);
  assert_eq!(cache.size(), 800);

  put(&cache, "c", &[3u8; 400]);
  assert!(cache.open_snapshot("a").is_none());
  assert!(cache.open_snapshot("b").is_some());
  assert!(cache.open_snapshot("c").is_some());
  assert_eq!(cache.size(), 800);
}

#[test]
fn reading_refreshes_disk_lru_order() {
  let dir = tempfile::tempdir().unwrap();
  let cache = cache_in(dir.path(), 800);

  put(&cache, "a", &[1u8; 400]);
  put(&cache, "b", &[2u8; 400]);
  drop(cache.open_snapshot("a"));

  put(&cache, "c", &[3u8; 400]);
  assert!(cache.open_snapshot("b").is_none());
  assert!(cache.open_snapshot("a").is_some());
}

#[test]
fn entries_held_open_are_not_evicted() {
  let dir = tempfile::tempdir().unwrap();
  let cache = cache_in(dir.path(), 800);

  put(&cache, "a", &[1u8; 400]);
  let held = cache.open_snapshot("a").unwrap();
  put(&cache, "b", &[2u8; 400]);

  put(&cache, "c", &[3u8; 400]);
  // a is least recently used but held open, so b went instead.
  assert_eq!(held.read_data().unwrap(), vec![1u8; 400]);
  assert!(cache.open_snapshot("b").is_none());
  drop(held);
  assert!(cache.open_snapshot("a").is_some());
  assert_eq!(cache.size(), 800);
}

#[test]
fn entries_survive_reopen() {
  let dir = tempfile::tempdir().unwrap();
  {
    let cache = cache_in(dir.path(), 10_000);
    put(&cache, "k", b"persistent");
  }
  let cache = cache_in(dir.path(), 10_000);
  let snapshot = cache.open_snapshot("k").unwrap();
  assert_eq!(snapshot.read_data().unwrap(), b"persistent");
}

#[test]
fn app_version_change_wipes_everything() {
  let dir = tempfile::tempdir().unwrap();
  {
    let cache = DiskCache::builder(dir.path())
      .max_size(10_000)
      .app_version(1)
      .build()
      .unwrap();
    put(&cache, "k", b"old generation");
  }
  let cache = DiskCache::builder(dir.path())
    .max_size(10_000)
    .app_version(2)
    .build()
    .unwrap();
  assert!(cache.open_snapshot("k").is_none());
  assert_eq!(cache.size(), 0);
}

#[test]
fn corrupt_journal_wipes_on_open() {
  let dir = tempfile::tempdir().unwrap();
  {
    let cache = cache_in(dir.path(), 10_000);
    put(&cache, "k", b"data");
  }
  let journal = dir.path().join("journal.jsonl");
  std::fs::write(&journal, b"garbage, not json lines\n").unwrap();

  let cache = cache_in(dir.path(), 10_000);
  assert!(cache.open_snapshot("k").is_none());
  assert_eq!(cache.size(), 0);
  // The wiped cache is fully usable.
  put(&cache, "k", b"fresh");
  assert_eq!(cache.open_snapshot("k").unwrap().read_data().unwrap(), b"fresh");
}

#[test]
fn remove_refuses_held_entries() {
  let dir = tempfile::tempdir().unwrap();
  let cache = cache_in(dir.path(), 10_000);
  put(&cache, "k", b"data");

  let snapshot = cache.open_snapshot("k").unwrap();
  assert!(!cache.remove("k"));
  drop(snapshot);
  assert!(cache.remove("k"));
  assert!(!cache.remove("k"));
  assert!(cache.open_snapshot("k").is_none());
}

#[test]
fn clear_empties_the_cache() {
  let dir = tempfile::tempdir().unwrap();
  let cache = cache_in(dir.path(), 10_000);
  put(&cache, "a", b"one");
  put(&cache, "b", b"two");

  cache.clear();
  assert_eq!(cache.size(), 0);
  assert!(cache.open_snapshot("a").is_none());
  assert!(cache.open_snapshot("b").is_none());
}

#[test]
fn with_key_lock_serializes_same_key_sections() {
  let dir = tempfile::tempdir().unwrap();
  let cache = cache_in(dir.path(), 10_000);

  let in_section = Arc::new(AtomicUsize::new(0));
  let max_seen = Arc::new(AtomicUsize::new(0));
  let barrier = Arc::new(Barrier::new(4));
  let mut handles = Vec::new();
  for _ in 0..4 {
    let cache = cache.clone();
    let in_section = Arc::clone(&in_section);
    let max_seen = Arc::clone(&max_seen);
    let barrier = Arc::clone(&barrier);
    handles.push(thread::spawn(move || {
      barrier.wait();
      cache.with_key_lock("k", || {
        let now = in_section.fetch_add(1, Ordering::SeqCst) + 1;
        max_seen.fetch_max(now, Ordering::SeqCst);
        thread::sleep(std::time::Duration::from_millis(5));
        in_section.fetch_sub(1, Ordering::SeqCst);
      });
    }));
  }
  for handle in handles {
    handle.join().unwrap();
  }
  assert_eq!(max_seen.load(Ordering::SeqCst), 1);
}

#[test]
fn sole_snapshot_trades_for_editor_atomically() {
  let dir = tempfile::tempdir().unwrap();
  let cache = cache_in(dir.path(), 10_000);
  put(&cache, "k", b"v1");

  let snapshot = cache.open_snapshot("k").unwrap();
  let editor = snapshot.close_and_open_editor().unwrap();
  // The trade leaves no window for another editor.
  assert!(cache.open_editor("k").is_none());
  editor.write_data(b"v2").unwrap();
  let snapshot = editor.commit_and_open_snapshot().unwrap();
  assert_eq!(snapshot.read_data().unwrap(), b"v2");
  // And the committed snapshot still excludes editors until dropped.
  assert!(cache.open_editor("k").is_none());
  drop(snapshot);
  assert!(cache.open_editor("k").is_some());
}
