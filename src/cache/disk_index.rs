// Append-only journal for result-cache entries. Tracks per-entry sizes and
// access order so eviction runs without rescanning the cache directory.
// Rebuilds from the actual files when the journal is missing or corrupt.
use super::StoredMetadata;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone)]
pub(super) struct CacheIndex {
  cache_dir: PathBuf,
  journal_path: PathBuf,
  state: Arc<Mutex<IndexState>>,
}

#[derive(Debug, Default)]
struct IndexState {
  loaded: bool,
  entries: HashMap<String, IndexEntry>,
  /// Access order: lowest key = least recently touched.
  order: BTreeMap<u64, String>,
  total_bytes: u64,
  next_order: u64,
  #[cfg(test)]
  rebuilds: usize,
}

#[derive(Debug, Clone)]
struct IndexEntry {
  len: u64,
  data_path: PathBuf,
  meta_path: PathBuf,
  order_key: u64,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum JournalRecord {
  Insert {
    key: String,
    len: u64,
    data_file: String,
    meta_file: String,
  },
  Touch {
    key: String,
  },
  Remove {
    key: String,
  },
}

impl CacheIndex {
  pub(super) fn open(cache_dir: PathBuf) -> Self {
    let journal_path = cache_dir.join("index.jsonl");
    let index = Self {
      cache_dir,
      journal_path,
      state: Arc::new(Mutex::new(IndexState::default())),
    };
    index.ensure_loaded();
    index
  }

  pub(super) fn total_bytes(&self) -> u64 {
    self.state.lock().map(|s| s.total_bytes).unwrap_or(0)
  }

  pub(super) fn contains(&self, key: &str) -> bool {
    self
      .state
      .lock()
      .map(|s| s.entries.contains_key(key))
      .unwrap_or(false)
  }

  fn ensure_loaded(&self) {
    let mut state = self.state.lock().unwrap();
    if state.loaded {
      return;
    }
    if self.replay_journal(&mut state).is_err() {
      let _ = self.rebuild_from_disk(&mut state);
    }
    state.loaded = true;
  }

  pub(super) fn record_insert(&self, key: &str, len: u64, data_path: &Path, meta_path: &Path) {
    let mut state = self.state.lock().unwrap();
    let record = JournalRecord::Insert {
      key: key.to_string(),
      len,
      data_file: self.relative_path(data_path),
      meta_file: self.relative_path(meta_path),
    };
    self.apply_record(&mut state, &record);
    if self.append_record(&record).is_err() {
      tracing::warn!(key, "failed to append insert to cache journal");
      let _ = self.rebuild_from_disk(&mut state);
    }
  }

  /// Refresh a key's access recency.
  pub(super) fn record_touch(&self, key: &str) {
    let mut state = self.state.lock().unwrap();
    if !state.entries.contains_key(key) {
      return;
    }
    let record = JournalRecord::Touch { key: key.to_string() };
    self.apply_record(&mut state, &record);
    if self.append_record(&record).is_err() {
      // Recency is advisory; a lost touch only skews eviction order.
      tracing::debug!(key, "failed to append touch to cache journal");
    }
  }

  pub(super) fn record_removal(&self, key: &str) {
    let mut state = self.state.lock().unwrap();
    let Some(entry) = state.entries.get(key).cloned() else {
      return;
    };
    let _ = fs::remove_file(&entry.data_path);
    let _ = fs::remove_file(&entry.meta_path);
    let record = JournalRecord::Remove { key: key.to_string() };
    self.apply_record(&mut state, &record);
    if self.append_record(&record).is_err() {
      tracing::warn!(key, "failed to append removal to cache journal");
      let _ = self.rebuild_from_disk(&mut state);
    }
  }

  /// Delete least-recently-touched entries until the total is within
  /// `max_bytes`. `can_remove` lets the caller veto entries that are
  /// currently leased by a reader.
  pub(super) fn evict_if_needed<F>(&self, max_bytes: u64, mut can_remove: F)
  where
    F: FnMut(&str) -> bool,
  {
    if max_bytes == 0 {
      return;
    }
    let mut state = self.state.lock().unwrap();
    let keys: Vec<String> = state.order.values().cloned().collect();
    for key in keys {
      if state.total_bytes <= max_bytes {
        break;
      }
      if !can_remove(&key) {
        continue;
      }
      let Some(entry) = state.entries.get(&key).cloned() else {
        continue;
      };
      let _ = fs::remove_file(&entry.data_path);
      let _ = fs::remove_file(&entry.meta_path);
      let record = JournalRecord::Remove { key: key.clone() };
      self.apply_record(&mut state, &record);
      if self.append_record(&record).is_err() {
        tracing::warn!(%key, "failed to journal eviction");
        let _ = self.rebuild_from_disk(&mut state);
        break;
      }
    }
  }

  pub(super) fn clear(&self) {
    let mut state = self.state.lock().unwrap();
    let entries: Vec<IndexEntry> = state.entries.values().cloned().collect();
    for entry in entries {
      let _ = fs::remove_file(&entry.data_path);
      let _ = fs::remove_file(&entry.meta_path);
    }
    state.entries.clear();
    state.order.clear();
    state.total_bytes = 0;
    let _ = self.write_full_journal(&mut state);
  }

  fn apply_record(&self, state: &mut IndexState, record: &JournalRecord) {
    match record {
      JournalRecord::Insert {
        key,
        len,
        data_file,
        meta_file,
      } => {
        self.apply_insert(
          state,
          key.clone(),
          *len,
          self.resolve_path(data_file),
          self.resolve_path(meta_file),
        );
      }
      JournalRecord::Touch { key } => {
        if let Some(entry) = state.entries.get_mut(key) {
          state.order.remove(&entry.order_key);
          entry.order_key = state.next_order;
          state.next_order += 1;
          state.order.insert(entry.order_key, key.clone());
        }
      }
      JournalRecord::Remove { key } => {
        if let Some(entry) = state.entries.remove(key) {
          state.order.remove(&entry.order_key);
          state.total_bytes = state.total_bytes.saturating_sub(entry.len);
        }
      }
    }
  }

  fn apply_insert(
    &self,
    state: &mut IndexState,
    key: String,
    len: u64,
    data_path: PathBuf,
    meta_path: PathBuf,
  ) {
    if let Some(prev) = state.entries.remove(&key) {
      state.order.remove(&prev.order_key);
      state.total_bytes = state.total_bytes.saturating_sub(prev.len);
    }
    let order_key = state.next_order;
    state.next_order += 1;
    state.order.insert(order_key, key.clone());
    state.total_bytes = state.total_bytes.saturating_add(len);
    state.entries.insert(
      key,
      IndexEntry {
        len,
        data_path,
        meta_path,
        order_key,
      },
    );
  }

  fn replay_journal(&self, state: &mut IndexState) -> std::io::Result<()> {
    let file = File::open(&self.journal_path)?;
    let reader = BufReader::new(file);
    for line in reader.lines() {
      let line = line?;
      if line.trim().is_empty() {
        continue;
      }
      let record: JournalRecord = serde_json::from_str(&line).map_err(|err| {
        std::io::Error::new(
          std::io::ErrorKind::InvalidData,
          format!("invalid journal line: {err}"),
        )
      })?;
      self.apply_record(state, &record);
    }
    Ok(())
  }

  fn rebuild_from_disk(&self, state: &mut IndexState) -> std::io::Result<()> {
    state.entries.clear();
    state.order.clear();
    state.total_bytes = 0;

    let mut found: Vec<(u64, String, PathBuf, PathBuf, u64)> = Vec::new();
    if let Ok(read_dir) = fs::read_dir(&self.cache_dir) {
      for dir_entry in read_dir.flatten() {
        let data_path = dir_entry.path();
        if data_path.extension().and_then(|e| e.to_str()) != Some("bin") {
          continue;
        }
        let meta_path = meta_path_for_data(&data_path);
        let Some((meta, len)) = read_valid_metadata(&data_path, &meta_path) else {
          // Orphaned or inconsistent pair: drop both halves.
          let _ = fs::remove_file(&data_path);
          let _ = fs::remove_file(&meta_path);
          continue;
        };
        let Some(key) = data_path
          .file_stem()
          .and_then(|s| s.to_str())
          .map(|s| s.to_string())
        else {
          continue;
        };
        found.push((meta.stored_at, key, data_path, meta_path, len));
      }
    }

    // `stored_at` has second resolution, so ties are common; order by key
    // as the deterministic tie-break.
    found.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
    for (_, key, data_path, meta_path, len) in found {
      self.apply_insert(state, key, len, data_path, meta_path);
    }

    self.write_full_journal(state)?;
    #[cfg(test)]
    {
      state.rebuilds += 1;
    }
    Ok(())
  }

  fn write_full_journal(&self, state: &mut IndexState) -> std::io::Result<()> {
    let mut file = OpenOptions::new()
      .create(true)
      .write(true)
      .truncate(true)
      .open(&self.journal_path)?;
    for key in state.order.values() {
      if let Some(entry) = state.entries.get(key) {
        let record = JournalRecord::Insert {
          key: key.clone(),
          len: entry.len,
          data_file: self.relative_path(&entry.data_path),
          meta_file: self.relative_path(&entry.meta_path),
        };
        let line = serde_json::to_string(&record)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
      }
    }
    file.flush()
  }

  fn append_record(&self, record: &JournalRecord) -> std::io::Result<()> {
    let mut file = OpenOptions::new()
      .create(true)
      .append(true)
      .open(&self.journal_path)?;
    let line = serde_json::to_string(record)?;
    file.write_all(line.as_bytes())?;
    file.write_all(b"\n")?;
    file.flush()
  }

  fn resolve_path(&self, path: &str) -> PathBuf {
    let candidate = PathBuf::from(path);
    if candidate.is_absolute() {
      candidate
    } else {
      self.cache_dir.join(candidate)
    }
  }

  fn relative_path(&self, path: &Path) -> String {
    path
      .strip_prefix(&self.cache_dir)
      .unwrap_or(path)
      .to_string_lossy()
      .to_string()
  }

  #[cfg(test)]
  pub(super) fn rebuilds(&self) -> usize {
    self.state.lock().unwrap().rebuilds
  }
}

pub(super) fn meta_path_for_data(data_path: &Path) -> PathBuf {
  let mut meta_path = data_path.to_path_buf();
  meta_path.set_extension("bin.meta");
  meta_path
}

fn read_valid_metadata(data_path: &Path, meta_path: &Path) -> Option<(StoredMetadata, u64)> {
  let meta_bytes = fs::read(meta_path).ok()?;
  let meta: StoredMetadata = serde_json::from_slice(&meta_bytes).ok()?;
  let len = meta.len as u64;
  if len == 0 {
    return None;
  }
  let data_meta = fs::metadata(data_path).ok()?;
  if data_meta.len() != len {
    return None;
  }
  Some((meta, len))
}
