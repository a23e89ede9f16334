//! Durable FIFO of backend mutations captured while offline.
//!
//! The whole queue is persisted as one blob under [`QUEUE_KEY`]. Entries are
//! never edited after enqueue apart from the `synced` flag, and synced entries
//! stay until [`OfflineActionQueue::clear_synced`] runs, so a crash between a
//! successful replay and the cleanup only costs a skipped entry, never a lost
//! one.
//!
//! The persisted blob is capped at [`DEFAULT_MAX_QUEUE_BYTES`]. When an
//! enqueue finds the queue over the cap, synced entries go first and then the
//! oldest quarter of what is left.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use cylinder_core::{OperationId, TenantId, UserId};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::storage::{read_versioned, write_versioned, LocalStore, StoreError};
use crate::types::{OfflineOperation, OperationKind, OperationPayload, QueueStats};

pub const QUEUE_KEY: &str = "offline_queue";
pub const DEFAULT_MAX_QUEUE_BYTES: usize = 50 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("failed to persist offline queue: {0}")]
    Persist(#[from] StoreError),
}

/// One entry that failed during a drain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DrainFailure {
    pub id: OperationId,
    pub kind: OperationKind,
    pub error: String,
}

/// One entry applied during a drain, with the server row id when the
/// backend returned one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DrainSuccess {
    pub id: OperationId,
    pub scan_id: Option<String>,
    pub server_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub attempted: usize,
    pub synced: usize,
    pub applied: Vec<DrainSuccess>,
    pub failed: Vec<DrainFailure>,
}

impl DrainReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct OfflineActionQueue {
    store: Arc<dyn LocalStore>,
    operations: Mutex<Vec<OfflineOperation>>,
    max_bytes: usize,
}

impl OfflineActionQueue {
    pub fn new(store: Arc<dyn LocalStore>) -> Self {
        Self {
            store,
            operations: Mutex::new(Vec::new()),
            max_bytes: DEFAULT_MAX_QUEUE_BYTES,
        }
    }

    pub fn with_max_bytes(mut self, max_bytes: usize) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    /// Replace the in-memory queue with the persisted one.
    pub async fn load(&self) -> Result<usize, QueueError> {
        let persisted: Vec<OfflineOperation> = read_versioned(self.store.as_ref(), QUEUE_KEY)
            .await?
            .unwrap_or_default();
        let count = persisted.len();
        *self.operations.lock().await = persisted;
        tracing::info!(count, "offline queue loaded");
        Ok(count)
    }

    async fn persist(&self, operations: &[OfflineOperation]) -> Result<(), QueueError> {
        write_versioned(self.store.as_ref(), QUEUE_KEY, &operations).await?;
        Ok(())
    }

    /// Append and persist. Returns only after the durable write; on failure
    /// the append is rolled back.
    pub async fn enqueue(
        &self,
        payload: OperationPayload,
        organization_id: TenantId,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<OfflineOperation, QueueError> {
        let operation = OfflineOperation {
            id: OperationId::new(),
            payload,
            organization_id,
            user_id,
            timestamp: now,
            synced: false,
        };

        let mut operations = self.operations.lock().await;
        let before_cleanup = self.make_room(&mut operations);
        operations.push(operation.clone());
        if let Err(err) = self.persist(&operations).await {
            match before_cleanup {
                Some(previous) => *operations = previous,
                None => {
                    operations.pop();
                }
            }
            tracing::error!(id = %operation.id, kind = operation.kind().as_str(), error = %err, "failed to enqueue offline operation");
            return Err(err);
        }

        tracing::info!(id = %operation.id, kind = operation.kind().as_str(), "offline operation queued");
        Ok(operation)
    }

    /// Shrink `operations` when its encoded size is over the cap. Returns the
    /// untouched list when anything was dropped so the caller can restore it.
    fn make_room(&self, operations: &mut Vec<OfflineOperation>) -> Option<Vec<OfflineOperation>> {
        if operations.is_empty() || encoded_len(operations.as_slice()) <= self.max_bytes {
            return None;
        }
        let previous = operations.clone();
        operations.retain(|op| !op.synced);
        let dropped_synced = previous.len() - operations.len();

        let mut evicted = 0;
        if encoded_len(operations.as_slice()) > self.max_bytes {
            evicted = operations.len().div_ceil(4);
            operations.drain(..evicted);
        }
        tracing::warn!(
            max_bytes = self.max_bytes,
            dropped_synced,
            evicted,
            "offline queue over its storage cap; oldest entries dropped"
        );
        Some(previous)
    }

    /// Encoded size of the queue as it is persisted.
    pub async fn storage_size(&self) -> usize {
        encoded_len(&self.operations.lock().await)
    }

    /// Replay every unsynced entry in insertion order.
    ///
    /// `sync_fn` returns the server row id when the backend hands one back.
    /// A failing entry stays unsynced and the drain moves on to the next one.
    /// The queue lock is not held while `sync_fn` runs.
    pub async fn drain<F, Fut, E>(&self, mut sync_fn: F) -> DrainReport
    where
        F: FnMut(OfflineOperation) -> Fut,
        Fut: Future<Output = Result<Option<String>, E>>,
        E: std::fmt::Display,
    {
        let pending = self.pending().await;
        let mut report = DrainReport {
            attempted: pending.len(),
            ..DrainReport::default()
        };

        for operation in pending {
            let id = operation.id;
            let kind = operation.kind();
            let scan_id = operation.scan_id().map(str::to_string);
            match sync_fn(operation).await {
                Ok(server_id) => {
                    report.synced += 1;
                    report.applied.push(DrainSuccess { id, scan_id, server_id });
                    if let Err(err) = self.set_synced(id).await {
                        tracing::warn!(%id, error = %err, "synced flag not persisted; entry may replay");
                    }
                }
                Err(err) => {
                    tracing::warn!(%id, kind = kind.as_str(), error = %err, "offline operation failed to sync");
                    report.failed.push(DrainFailure {
                        id,
                        kind,
                        error: err.to_string(),
                    });
                }
            }
        }

        tracing::info!(
            attempted = report.attempted,
            synced = report.synced,
            failed = report.failed.len(),
            "offline queue drained"
        );
        report
    }

    async fn set_synced(&self, id: OperationId) -> Result<(), QueueError> {
        let mut operations = self.operations.lock().await;
        let Some(index) = operations.iter().position(|op| op.id == id && !op.synced) else {
            return Ok(());
        };
        operations[index].synced = true;
        if let Err(err) = self.persist(&operations).await {
            operations[index].synced = false;
            return Err(err);
        }
        Ok(())
    }

    /// Flag queued copies of a session scan as synced so they are not
    /// replayed after the scan was written directly. Returns entries changed.
    pub async fn mark_scan_synced(&self, scan_id: &str) -> Result<usize, QueueError> {
        let mut operations = self.operations.lock().await;
        let mut changed = Vec::new();
        for (index, operation) in operations.iter_mut().enumerate() {
            if !operation.synced && operation.scan_id() == Some(scan_id) {
                operation.synced = true;
                changed.push(index);
            }
        }
        if changed.is_empty() {
            return Ok(0);
        }
        if let Err(err) = self.persist(&operations).await {
            for index in changed {
                operations[index].synced = false;
            }
            return Err(err);
        }
        Ok(changed.len())
    }

    /// Session scan ids that still have an unsynced queued copy.
    pub async fn pending_scan_ids(&self) -> HashSet<String> {
        self.operations
            .lock()
            .await
            .iter()
            .filter(|op| !op.synced)
            .filter_map(|op| op.scan_id().map(str::to_string))
            .collect()
    }

    /// Drop every synced entry. Returns how many were removed.
    pub async fn clear_synced(&self) -> Result<usize, QueueError> {
        let mut operations = self.operations.lock().await;
        let before = operations.len();
        let remaining: Vec<OfflineOperation> = operations.iter().filter(|op| !op.synced).cloned().collect();
        let removed = before - remaining.len();
        if removed > 0 {
            self.persist(&remaining).await?;
            *operations = remaining;
        }
        tracing::info!(removed, "cleared synced operations");
        Ok(removed)
    }

    /// Unsynced entries in insertion order.
    pub async fn pending(&self) -> Vec<OfflineOperation> {
        self.operations
            .lock()
            .await
            .iter()
            .filter(|op| !op.synced)
            .cloned()
            .collect()
    }

    pub async fn all(&self) -> Vec<OfflineOperation> {
        self.operations.lock().await.clone()
    }

    pub async fn stats(&self) -> QueueStats {
        let operations = self.operations.lock().await;
        let synced = operations.iter().filter(|op| op.synced).count();
        QueueStats {
            total: operations.len(),
            pending: operations.len() - synced,
            synced,
        }
    }

    pub async fn has_pending(&self) -> bool {
        self.operations.lock().await.iter().any(|op| !op.synced)
    }
}

fn encoded_len(operations: &[OfflineOperation]) -> usize {
    serde_json::to_vec(operations).map(|bytes| bytes.len()).unwrap_or(0)
}
