// Append-only on-disk journal for disk cache entries. Tracks per-entry sizes and last-use
// timestamps so eviction can pick least-recently-used entries without rescanning the cache
// directory. Entry files are named by key hash, so a corrupt or missing journal cannot be
// rebuilt from the directory; it surfaces as an error and the cache clears itself.
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Mutex;

const JOURNAL_FILE: &str = "journal.jsonl";

// Rewrite the journal once it carries this many records beyond the live entry set.
const COMPACT_SLACK: usize = 2048;

#[derive(Debug)]
pub(super) struct Journal {
  journal_path: PathBuf,
  state: Mutex<JournalState>,
}

#[derive(Debug, Default)]
struct JournalState {
  loaded: bool,
  entries: std::collections::HashMap<String, JournalEntry>,
  order: BTreeMap<OrderKey, String>,
  total_bytes: u64,
  journal_len: u64,
  record_count: usize,
  next_order: u64,
}

#[derive(Debug, Clone)]
struct JournalEntry {
  stored_at: u64,
  last_used: u64,
  len: u64,
  order_key: OrderKey,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct OrderKey {
  last_used: u64,
  order: u64,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum JournalRecord {
  Insert { key: String, stored_at: u64, len: u64 },
  Read { key: String, at: u64 },
  Remove { key: String },
}

impl Journal {
  pub(super) fn new(cache_dir: &std::path::Path) -> Self {
    Self {
      journal_path: cache_dir.join(JOURNAL_FILE),
      state: Mutex::new(JournalState::default()),
    }
  }

  /// Replay any journal bytes appended since the last call. Errors mean the
  /// journal is missing, truncated or corrupt and the cache must be cleared.
  pub(super) fn refresh(&self) -> std::io::Result<()> {
    let mut state = self.state.lock().unwrap();
    self.refresh_locked(&mut state)
  }

  pub(super) fn record_insert(&self, key: &str, stored_at: u64, len: u64) -> std::io::Result<()> {
    let mut state = self.state.lock().unwrap();
    self.refresh_locked(&mut state)?;
    self.append_record_locked(
      &mut state,
      &JournalRecord::Insert {
        key: key.to_string(),
        stored_at,
        len,
      },
    )
  }

  /// Bump an entry to most-recently-used.
  pub(super) fn record_read(&self, key: &str, at: u64) -> std::io::Result<()> {
    let mut state = self.state.lock().unwrap();
    self.refresh_locked(&mut state)?;
    if !state.entries.contains_key(key) {
      return Ok(());
    }
    self.append_record_locked(
      &mut state,
      &JournalRecord::Read {
        key: key.to_string(),
        at,
      },
    )
  }

  pub(super) fn record_removal(&self, key: &str) -> std::io::Result<()> {
    let mut state = self.state.lock().unwrap();
    self.refresh_locked(&mut state)?;
    if !state.entries.contains_key(key) {
      return Ok(());
    }
    self.append_record_locked(
      &mut state,
      &JournalRecord::Remove {
        key: key.to_string(),
      },
    )
  }

  pub(super) fn contains(&self, key: &str) -> bool {
    let mut state = self.state.lock().unwrap();
    if self.refresh_locked(&mut state).is_err() {
      return false;
    }
    state.entries.contains_key(key)
  }

  pub(super) fn total_bytes(&self) -> u64 {
    let mut state = self.state.lock().unwrap();
    let _ = self.refresh_locked(&mut state);
    state.total_bytes
  }

  pub(super) fn entry_count(&self) -> usize {
    let mut state = self.state.lock().unwrap();
    let _ = self.refresh_locked(&mut state);
    state.entries.len()
  }

  /// All live keys ordered least-recently-used first, with their sizes.
  pub(super) fn keys_lru_first(&self) -> Vec<(String, u64)> {
    let mut state = self.state.lock().unwrap();
    let _ = self.refresh_locked(&mut state);
    state
      .order
      .iter()
      .filter_map(|(_, key)| state.entries.get(key).map(|e| (key.clone(), e.len)))
      .collect()
  }

  /// Drop all in-memory state and start an empty journal file.
  pub(super) fn reset(&self) -> std::io::Result<()> {
    let mut state = self.state.lock().unwrap();
    *state = JournalState::default();
    let _ = fs::remove_file(&self.journal_path);
    File::create(&self.journal_path)?;
    state.loaded = true;
    Ok(())
  }

  fn refresh_locked(&self, state: &mut JournalState) -> std::io::Result<()> {
    if !state.loaded {
      self.replay_from_offset(state, 0)?;
      state.loaded = true;
      return Ok(());
    }
    let meta = fs::metadata(&self.journal_path)?;
    let len = meta.len();
    if len < state.journal_len {
      return Err(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        "journal truncated",
      ));
    }
    if len > state.journal_len {
      self.replay_from_offset(state, state.journal_len)?;
    }
    Ok(())
  }

  fn replay_from_offset(&self, state: &mut JournalState, offset: u64) -> std::io::Result<()> {
    let file = File::open(&self.journal_path)?;
    let mut reader = BufReader::new(file);
    reader.seek(SeekFrom::Start(offset))?;
    let mut line = String::new();
    while reader.read_line(&mut line)? != 0 {
      if !line.trim().is_empty() {
        let record: JournalRecord = serde_json::from_str(&line).map_err(|err| {
          std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("invalid journal line: {err}"),
          )
        })?;
        apply_record(state, record);
        state.record_count += 1;
      }
      line.clear();
    }
    state.journal_len = reader.get_ref().metadata()?.len();
    Ok(())
  }

  fn append_record_locked(
    &self,
    state: &mut JournalState,
    record: &JournalRecord,
  ) -> std::io::Result<()> {
    let mut line = serde_json::to_string(record)
      .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;
    line.push('\n');
    let mut file = OpenOptions::new()
      .create(true)
      .append(true)
      .open(&self.journal_path)?;
    file.write_all(line.as_bytes())?;
    file.flush()?;
    state.journal_len += line.len() as u64;
    state.record_count += 1;

    // Re-parse through apply to keep replay and live paths identical.
    let record: JournalRecord = serde_json::from_str(&line)
      .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;
    apply_record(state, record);

    if state.record_count > state.entries.len() + COMPACT_SLACK {
      self.compact_locked(state)?;
    }
    Ok(())
  }

  // Rewrite the journal as one Insert per live entry, LRU first, via a temp
  // file and rename so a crash never leaves a half-written journal.
  fn compact_locked(&self, state: &mut JournalState) -> std::io::Result<()> {
    let tmp_path = self.journal_path.with_extension("jsonl.tmp");
    {
      let mut tmp = File::create(&tmp_path)?;
      for (order_key, key) in &state.order {
        let Some(entry) = state.entries.get(key) else {
          continue;
        };
        // last_used survives compaction by standing in for stored_at.
        let record = JournalRecord::Insert {
          key: key.clone(),
          stored_at: order_key.last_used.max(entry.stored_at),
          len: entry.len,
        };
        let mut line = serde_json::to_string(&record)
          .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;
        line.push('\n');
        tmp.write_all(line.as_bytes())?;
      }
      tmp.flush()?;
    }
    fs::rename(&tmp_path, &self.journal_path)?;
    state.journal_len = fs::metadata(&self.journal_path)?.len();
    state.record_count = state.entries.len();
    Ok(())
  }
}

fn apply_record(state: &mut JournalState, record: JournalRecord) {
  match record {
    JournalRecord::Insert {
      key,
      stored_at,
      len,
    } => {
      if let Some(prev) = state.entries.remove(&key) {
        state.order.remove(&prev.order_key);
        state.total_bytes = state.total_bytes.saturating_sub(prev.len);
      }
      let order_key = OrderKey {
        last_used: stored_at,
        order: state.next_order,
      };
      state.next_order = state.next_order.wrapping_add(1);
      state.order.insert(order_key, key.clone());
      state.total_bytes = state.total_bytes.saturating_add(len);
      state.entries.insert(
        key,
        JournalEntry {
          stored_at,
          last_used: stored_at,
          len,
          order_key,
        },
      );
    }
    JournalRecord::Read { key, at } => {
      if let Some(entry) = state.entries.get_mut(&key) {
        state.order.remove(&entry.order_key);
        let order_key = OrderKey {
          last_used: at.max(entry.last_used),
          order: state.next_order,
        };
        state.next_order = state.next_order.wrapping_add(1);
        entry.last_used = order_key.last_used;
        entry.order_key = order_key;
        state.order.insert(order_key, key);
      }
    }
    JournalRecord::Remove { key } => {
      if let Some(entry) = state.entries.remove(&key) {
        state.order.remove(&entry.order_key);
        state.total_bytes = state.total_bytes.saturating_sub(entry.len);
      }
    }
  }
}
