//! dedup.rs — "Have I seen this message id" ledger
//!
//! Entries expire after a fixed age window. Expired entries are purged on
//! every access rather than by a sweeper task. When a path is configured the
//! ledger is rewritten to disk after each change so a restarted device does
//! not re-relay envelopes it already flooded. Inside a tokio runtime the write
//! happens on the blocking pool; snapshots carry a generation number so a
//! slow older write never overwrites a newer one.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::warn;

/// Default entry lifetime: 10 minutes.
pub const DEFAULT_DEDUP_TTL_MS: i64 = 10 * 60 * 1000;

pub struct DedupStore {
    ttl_ms: i64,
    seen: HashMap<String, i64>,
    path: Option<PathBuf>,
    generation: u64,
    /// Generation of the snapshot last written to disk.
    written: Arc<Mutex<u64>>,
}

impl DedupStore {
    pub fn new(ttl_ms: i64) -> Self {
        Self { ttl_ms, seen: HashMap::new(), path: None, generation: 0, written: Arc::new(Mutex::new(0)) }
    }

    /// Ledger backed by a JSON file. A missing or unreadable file starts empty.
    pub fn persistent(ttl_ms: i64, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let seen = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                warn!("Dedup ledger {} unreadable, starting empty: {e}", path.display());
                HashMap::new()
            }),
            Err(_) => HashMap::new(),
        };
        Self { ttl_ms, seen, path: Some(path), generation: 0, written: Arc::new(Mutex::new(0)) }
    }

    fn purge(&mut self, now_ms: i64) -> bool {
        let before = self.seen.len();
        let ttl = self.ttl_ms;
        self.seen.retain(|_, first_seen| now_ms.saturating_sub(*first_seen) < ttl);
        self.seen.len() != before
    }

    fn persist(&mut self) {
        let Some(path) = self.path.clone() else { return };
        let bytes = match serde_json::to_vec(&self.seen) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Dedup ledger encode failed: {e}");
                return;
            }
        };
        self.generation += 1;
        let generation = self.generation;
        let written = Arc::clone(&self.written);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || write_snapshot(&path, &bytes, generation, &written));
            }
            Err(_) => write_snapshot(&path, &bytes, generation, &written),
        }
    }

    /// Writes the current ledger synchronously, e.g. on shutdown.
    pub fn flush(&mut self) {
        let Some(path) = self.path.clone() else { return };
        match serde_json::to_vec(&self.seen) {
            Ok(bytes) => {
                self.generation += 1;
                write_snapshot(&path, &bytes, self.generation, &self.written);
            }
            Err(e) => warn!("Dedup ledger encode failed: {e}"),
        }
    }

    pub fn contains(&mut self, message_id: &str, now_ms: i64) -> bool {
        if self.purge(now_ms) {
            self.persist();
        }
        self.seen.contains_key(message_id)
    }

    /// Records a first sighting. Returns `false` if the id was already known.
    pub fn check_and_record(&mut self, message_id: &str, now_ms: i64) -> bool {
        let purged = self.purge(now_ms);
        if self.seen.contains_key(message_id) {
            if purged {
                self.persist();
            }
            return false;
        }
        self.seen.insert(message_id.to_string(), now_ms);
        self.persist();
        true
    }

    pub fn len(&mut self, now_ms: i64) -> usize {
        self.purge(now_ms);
        self.seen.len()
    }

    pub fn is_empty(&mut self, now_ms: i64) -> bool {
        self.len(now_ms) == 0
    }
}

fn write_snapshot(path: &Path, bytes: &[u8], generation: u64, written: &Mutex<u64>) {
    let mut last = match written.lock() {
        Ok(last) => last,
        Err(poisoned) => poisoned.into_inner(),
    };
    if generation <= *last {
        return;
    }
    match fs::write(path, bytes) {
        Ok(()) => *last = generation,
        Err(e) => warn!("Dedup ledger write to {} failed: {e}", path.display()),
    }
}
