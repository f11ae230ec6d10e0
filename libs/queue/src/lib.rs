//! Durable FIFO of undelivered webhook payloads.
//!
//! The queue lives in memory and is mirrored to a single JSON file.
//! Mutations mark the state dirty through a capacity-one channel drained by
//! a dedicated writer task, so bursts collapse into one write while the
//! final state is always flushed. `persist_sync` exists for the shutdown
//! path, where spawning is no longer an option.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};

use courier_core::{now_epoch_ms, NormalizedInbound};

/// Entries older than this are abandoned on cleanup.
const TTL_MS: i64 = 24 * 60 * 60 * 1000;
/// Entries that failed this many deliveries are abandoned on cleanup.
const MAX_ATTEMPTS: u32 = 5;

/// One undelivered webhook payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueuedDelivery {
    #[serde(rename = "messageId")]
    pub message_id: String,
    #[serde(rename = "tenantId")]
    pub tenant: String,
    pub payload: NormalizedInbound,
    #[serde(rename = "queuedAt")]
    pub queued_at: i64,
    pub attempts: u32,
}

struct QueueInner {
    entries: Mutex<Vec<QueuedDelivery>>,
    path: PathBuf,
    dirty: mpsc::Sender<()>,
}

/// Handle to the delivery queue; cheap to clone.
#[derive(Clone)]
pub struct DeliveryQueue {
    inner: Arc<QueueInner>,
}

impl DeliveryQueue {
    /// Loads the queue file (a missing or unparsable file yields an empty
    /// queue), applies cleanup, and starts the debounced writer task.
    pub async fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut entries = match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<Vec<QueuedDelivery>>(&bytes) {
                Ok(entries) => entries,
                Err(err) => {
                    warn!(error = %err, path = %path.display(), "queue file unparsable; starting empty");
                    Vec::new()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(err) => {
                warn!(error = %err, path = %path.display(), "queue file unreadable; starting empty");
                Vec::new()
            }
        };

        let loaded = entries.len();
        let now = now_epoch_ms();
        entries.retain(|entry| keep(entry, now));
        info!(
            path = %path.display(),
            loaded,
            kept = entries.len(),
            "delivery queue loaded"
        );

        let (dirty_tx, dirty_rx) = mpsc::channel(1);
        let inner = Arc::new(QueueInner {
            entries: Mutex::new(entries),
            path,
            dirty: dirty_tx,
        });
        tokio::spawn(writer_loop(Arc::clone(&inner), dirty_rx));
        Self { inner }
    }

    /// Appends a payload with a fresh `queued_at` and zero attempts.
    pub fn enqueue(&self, payload: NormalizedInbound) {
        let entry = QueuedDelivery {
            message_id: payload.message_id.clone(),
            tenant: payload.tenant.clone(),
            payload,
            queued_at: now_epoch_ms(),
            attempts: 0,
        };
        self.inner.entries.lock().unwrap().push(entry);
        counter!("courier_queue_enqueued_total").increment(1);
        self.mark_dirty();
    }

    /// Removes the entry with the given message id. Returns whether
    /// anything was removed.
    pub fn dequeue(&self, message_id: &str) -> bool {
        let mut entries = self.inner.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|entry| entry.message_id != message_id);
        let removed = entries.len() != before;
        drop(entries);
        if removed {
            self.mark_dirty();
        }
        removed
    }

    pub fn increment_attempts(&self, message_id: &str) {
        let mut entries = self.inner.entries.lock().unwrap();
        for entry in entries.iter_mut() {
            if entry.message_id == message_id {
                entry.attempts += 1;
            }
        }
        drop(entries);
        self.mark_dirty();
    }

    /// Snapshot copy of all entries, oldest first.
    pub fn list(&self) -> Vec<QueuedDelivery> {
        self.inner.entries.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.inner.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Evicts entries past the attempt cap or the TTL. Returns how many
    /// were abandoned.
    pub fn cleanup(&self) -> usize {
        let now = now_epoch_ms();
        let mut entries = self.inner.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|entry| keep(entry, now));
        let evicted = before - entries.len();
        drop(entries);
        if evicted > 0 {
            counter!("courier_queue_abandoned_total").increment(evicted as u64);
            warn!(evicted, "abandoned undeliverable queue entries");
            self.mark_dirty();
        }
        evicted
    }

    /// Blocking write of the current state; for the shutdown path only.
    pub fn persist_sync(&self) -> Result<()> {
        let snapshot = self.list();
        let bytes = serde_json::to_vec_pretty(&snapshot).context("encode queue")?;
        std::fs::write(&self.inner.path, bytes)
            .with_context(|| format!("write queue file {}", self.inner.path.display()))
    }

    fn mark_dirty(&self) {
        // A full channel means a write is already pending; that write will
        // pick up this change too.
        let _ = self.inner.dirty.try_send(());
    }
}

fn keep(entry: &QueuedDelivery, now: i64) -> bool {
    entry.attempts < MAX_ATTEMPTS && now - entry.queued_at < TTL_MS
}

async fn writer_loop(inner: Arc<QueueInner>, mut dirty: mpsc::Receiver<()>) {
    while dirty.recv().await.is_some() {
        let snapshot: Vec<QueuedDelivery> = inner.entries.lock().unwrap().clone();
        let bytes = match serde_json::to_vec_pretty(&snapshot) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(error = %err, "failed to encode queue snapshot");
                continue;
            }
        };
        let tmp = inner.path.with_extension("tmp");
        let write = async {
            tokio::fs::write(&tmp, &bytes).await?;
            tokio::fs::rename(&tmp, &inner.path).await
        };
        if let Err(err) = write.await {
            warn!(error = %err, path = %inner.path.display(), "failed to persist queue");
        }
    }
}
