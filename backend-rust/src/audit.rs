//! # audit
//!
//! SHA-256 chained audit log of alert lifecycle events.
//!
//! Every alert creation, dispatch, responder assignment and status change is
//! appended as a block whose hash covers the previous block's hash. Editing or
//! dropping any line breaks the chain, which `verify_chain` detects.
//!
//! Writes are best-effort: a failed append is logged and never fails the request
//! that caused it.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::now_ms;

// ── Audit Event Types ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditEventType {
    AlertCreated,
    /// Nearby riders matched and notified
    AlertDispatched,
    ResponderAssigned,
    /// Cancel or escalate
    StatusChanged,
}

impl AuditEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEventType::AlertCreated => "ALERT_CREATED",
            AuditEventType::AlertDispatched => "ALERT_DISPATCHED",
            AuditEventType::ResponderAssigned => "RESPONDER_ASSIGNED",
            AuditEventType::StatusChanged => "STATUS_CHANGED",
        }
    }
}

impl std::fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Audit Block ───────────────────────────────────────────────────────────────

pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditBlock {
    /// Position in the chain, starting at 0
    pub block_seq: u64,
    pub alert_id: String,
    pub timestamp_ms: i64,
    /// Hash of the previous block, [`GENESIS_HASH`] for the first
    pub prev_hash: String,
    pub event_type: AuditEventType,
    pub payload_json: String,
    /// SHA-256 of (prev_hash || timestamp_ms || event_type || alert_id || payload_json)
    pub block_hash: String,
}

impl AuditBlock {
    fn compute_hash(
        prev_hash: &str,
        timestamp_ms: i64,
        event_type: AuditEventType,
        alert_id: &str,
        payload_json: &str,
    ) -> String {
        let mut hasher = Sha256::new();
        hasher.update(prev_hash.as_bytes());
        hasher.update(timestamp_ms.to_le_bytes());
        hasher.update(event_type.as_str().as_bytes());
        hasher.update(alert_id.as_bytes());
        hasher.update(payload_json.as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn new(
        block_seq: u64,
        alert_id: String,
        timestamp_ms: i64,
        prev_hash: String,
        event_type: AuditEventType,
        payload_json: String,
    ) -> Self {
        let block_hash = Self::compute_hash(&prev_hash, timestamp_ms, event_type, &alert_id, &payload_json);
        Self { block_seq, alert_id, timestamp_ms, prev_hash, event_type, payload_json, block_hash }
    }

    /// Whether this block's hash matches its contents.
    pub fn verify(&self) -> bool {
        let expected =
            Self::compute_hash(&self.prev_hash, self.timestamp_ms, self.event_type, &self.alert_id, &self.payload_json);
        expected == self.block_hash
    }
}

/// Checks every block's hash and its link to the one before it.
pub fn verify_chain(blocks: &[AuditBlock]) -> bool {
    let mut prev = GENESIS_HASH;
    for (i, block) in blocks.iter().enumerate() {
        if block.block_seq != i as u64 || block.prev_hash != prev || !block.verify() {
            return false;
        }
        prev = &block.block_hash;
    }
    true
}

// ── Audit Logger ──────────────────────────────────────────────────────────────

struct ChainState {
    block_seq: u64,
    last_hash: String,
}

/// Append-only chained logger, writing JSON lines to `path` when one is set.
#[derive(Clone)]
pub struct AuditLogger {
    state: Arc<Mutex<ChainState>>,
    path: Option<PathBuf>,
}

impl AuditLogger {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self {
            state: Arc::new(Mutex::new(ChainState { block_seq: 0, last_hash: GENESIS_HASH.to_string() })),
            path,
        }
    }

    /// Chain kept in memory and the debug log only.
    pub fn disabled() -> Self {
        Self::new(None)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Append one block. The chain lock is held through the file write so
    /// lines land in sequence order.
    pub async fn append(&self, event_type: AuditEventType, alert_id: &str, payload: serde_json::Value) -> AuditBlock {
        let mut state = self.state.lock().await;
        let block = AuditBlock::new(
            state.block_seq,
            alert_id.to_string(),
            now_ms(),
            state.last_hash.clone(),
            event_type,
            payload.to_string(),
        );
        state.last_hash = block.block_hash.clone();
        state.block_seq += 1;

        debug!("Audit[{}]: {} {} {}", block.block_seq, block.event_type, block.alert_id, block.block_hash);
        if let Some(path) = &self.path {
            if let Err(e) = write_line(path, &block).await {
                warn!("Audit: could not append to {}: {e}", path.display());
            }
        }
        block
    }
}

async fn write_line(path: &Path, block: &AuditBlock) -> std::io::Result<()> {
    let mut line = serde_json::to_string(block)?;
    line.push('\n');
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(dir).await?;
    }
    let mut f = OpenOptions::new().create(true).append(true).open(path).await?;
    f.write_all(line.as_bytes()).await
}
