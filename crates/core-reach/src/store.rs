//! Persistent direct-address store (§4.4): a debounced, atomic on-disk
//! mirror of the candidate and verified tables.
//!
//! Atomic write discipline (serialize → write `.tmp` → rename) follows the
//! same pattern used for peer persistence elsewhere in this codebase: write
//! the full contents to a temp file, then rename it over the real path so a
//! reader never observes a torn write (I8, P8).

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::address::{Address, AddressPriority};
use crate::error::StoreError;

const STORE_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredEntry {
    pub addr: String,
    pub priority: AddressPriority,
    pub source: String,
    pub sources: Vec<String>,
    pub verified: bool,
    pub verified_at: Option<u64>,
    pub last_seen: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FileContents {
    version: u32,
    updated_at: u64,
    candidates: HashMap<String, StoredEntry>,
    verified: HashMap<String, StoredEntry>,
}

impl Default for FileContents {
    fn default() -> Self {
        Self {
            version: STORE_VERSION,
            updated_at: 0,
            candidates: HashMap::new(),
            verified: HashMap::new(),
        }
    }
}

/// What `load()` hands back to the Coordinator to seed its in-memory tables.
pub struct LoadedState {
    pub candidates: HashMap<String, StoredEntry>,
    pub verified: HashMap<String, StoredEntry>,
}

pub struct PersistentStore {
    path: PathBuf,
    candidates: RwLock<HashMap<String, StoredEntry>>,
    verified: RwLock<HashMap<String, StoredEntry>>,
    dirty: Mutex<bool>,
    max_entries: usize,
    candidate_ttl: Duration,
    verified_ttl: Duration,
    /// Bumped on every mutation; `run_debounced_flush` uses it to detect
    /// whether a new write landed during the last debounce window (§4.4.3).
    generation: AtomicU64,
}

impl PersistentStore {
    /// Loads an existing file, or starts empty if it is missing or carries
    /// an unrecognized version (§4.4.5). A parse failure on an existing,
    /// version-matching file propagates as a `StoreError`.
    pub fn open(
        path: impl Into<PathBuf>,
        max_entries: usize,
        candidate_ttl: Duration,
        verified_ttl: Duration,
    ) -> Result<(Self, LoadedState), StoreError> {
        let path = path.into();
        let contents = if path.exists() {
            match Self::read_file(&path) {
                Ok(c) if c.version == STORE_VERSION => c,
                Ok(_) => {
                    log::warn!("direct address store at {:?} has unrecognized version, ignoring", path);
                    FileContents::default()
                }
                Err(e) => return Err(e),
            }
        } else {
            FileContents::default()
        };

        let loaded = LoadedState {
            candidates: contents.candidates.clone(),
            verified: contents.verified.clone(),
        };

        let store = Self {
            path,
            candidates: RwLock::new(contents.candidates),
            verified: RwLock::new(contents.verified),
            dirty: Mutex::new(false),
            max_entries,
            candidate_ttl,
            verified_ttl,
            generation: AtomicU64::new(0),
        };
        Ok((store, loaded))
    }

    fn read_file(path: &Path) -> Result<FileContents, StoreError> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        Ok(serde_json::from_reader(reader)?)
    }

    fn mark_dirty(&self) {
        *self.dirty.lock().unwrap() = true;
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    pub fn is_dirty(&self) -> bool {
        *self.dirty.lock().unwrap()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Inserts or updates a candidate entry, evicting the oldest (by
    /// `last_seen`) entry first if the table is at capacity and the key is
    /// new (§4.4.4).
    pub fn put_candidate(&self, key: &str, entry: StoredEntry) {
        let mut table = self.candidates.write().unwrap();
        if !table.contains_key(key) && table.len() >= self.max_entries {
            evict_oldest(&mut table);
        }
        table.insert(key.to_string(), entry);
        drop(table);
        self.mark_dirty();
    }

    pub fn put_verified(&self, key: &str, entry: StoredEntry) {
        let mut table = self.verified.write().unwrap();
        if !table.contains_key(key) && table.len() >= self.max_entries {
            evict_oldest(&mut table);
        }
        table.insert(key.to_string(), entry);
        drop(table);
        self.mark_dirty();
    }

    pub fn remove_candidate(&self, key: &str) {
        if self.candidates.write().unwrap().remove(key).is_some() {
            self.mark_dirty();
        }
    }

    pub fn remove_verified(&self, key: &str) {
        if self.verified.write().unwrap().remove(key).is_some() {
            self.mark_dirty();
        }
    }

    /// Periodic cleanup (§4.4.4): removes entries whose `last_seen` age
    /// exceeds the relevant TTL. Returns the removed keys so the caller can
    /// mirror the deletion into the Coordinator's in-memory tables.
    pub fn expire_stale(&self, now_unix: u64) -> (Vec<String>, Vec<String>) {
        let expired_candidates = expire_from(&self.candidates, now_unix, self.candidate_ttl);
        let expired_verified = expire_from(&self.verified, now_unix, self.verified_ttl);
        if !expired_candidates.is_empty() || !expired_verified.is_empty() {
            self.mark_dirty();
        }
        (expired_candidates, expired_verified)
    }

    /// Writes the full contents to `<path>.tmp`, then renames over `path`
    /// (§4.4.2). On any failure the temp file is removed rather than left
    /// behind half-written.
    pub fn flush(&self, now_unix: u64) -> Result<(), StoreError> {
        if !self.is_dirty() {
            return Ok(());
        }
        let result = self.save_to_file(now_unix);
        if result.is_ok() {
            *self.dirty.lock().unwrap() = false;
        }
        result
    }

    /// Drives the debounced flush (§4.4.3): each call to `mark_dirty` bumps
    /// `generation`, so waking up to find the generation unchanged means no
    /// mutation landed during the wait and it's safe to flush. A mutation
    /// arriving mid-wait resets the debounce window rather than triggering
    /// an immediate write.
    pub async fn run_debounced_flush(self: Arc<Self>, debounce: Duration, running: Arc<AtomicBool>) {
        let mut last_seen = self.generation.load(Ordering::SeqCst);
        loop {
            if !crate::cancel::sleep_cancellable(debounce, &running).await {
                break;
            }
            let current = self.generation.load(Ordering::SeqCst);
            if current != last_seen {
                last_seen = current;
                continue;
            }
            if self.is_dirty() {
                if let Err(e) = self.flush(unix_now()) {
                    log::warn!("debounced flush of {:?} failed: {}", self.path, e);
                }
            }
        }
    }

    fn save_to_file(&self, now_unix: u64) -> Result<(), StoreError> {
        let contents = FileContents {
            version: STORE_VERSION,
            updated_at: now_unix,
            candidates: self.candidates.read().unwrap().clone(),
            verified: self.verified.read().unwrap().clone(),
        };

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let tmp_path = tmp_path_for(&self.path);
        let write_result = (|| -> Result<(), StoreError> {
            let file = File::create(&tmp_path)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                file.set_permissions(fs::Permissions::from_mode(0o600))?;
            }
            let writer = BufWriter::new(file);
            serde_json::to_writer_pretty(writer, &contents)?;
            Ok(())
        })();

        match write_result {
            Ok(()) => {
                fs::rename(&tmp_path, &self.path)?;
                Ok(())
            }
            Err(e) => {
                let _ = fs::remove_file(&tmp_path);
                Err(e)
            }
        }
    }
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

fn evict_oldest(table: &mut HashMap<String, StoredEntry>) {
    if let Some(key) = table
        .iter()
        .min_by_key(|(_, v)| v.last_seen)
        .map(|(k, _)| k.clone())
    {
        table.remove(&key);
    }
}

fn expire_from(
    table: &RwLock<HashMap<String, StoredEntry>>,
    now_unix: u64,
    ttl: Duration,
) -> Vec<String> {
    let mut table = table.write().unwrap();
    let ttl_secs = ttl.as_secs();
    let expired: Vec<String> = table
        .iter()
        .filter(|(_, v)| now_unix.saturating_sub(v.last_seen) > ttl_secs)
        .map(|(k, _)| k.clone())
        .collect();
    for key in &expired {
        table.remove(key);
    }
    expired
}

/// Convenience for non-Coordinator-owned addresses (e.g. tests) that need a
/// `u64` unix-seconds last-seen value.
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
