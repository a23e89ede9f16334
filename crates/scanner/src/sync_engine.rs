//! Replays queued mutations against the backend.
//!
//! Each payload variant maps to one table. A scan additionally writes the
//! legacy `scans` table and updates the bottle's state; both of those are
//! advisory and can only log, never fail the scan.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use cylinder_core::{TenantId, UserId};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::backend::{Backend, BackendError, BottleStateUpdate, LegacyScanInsert, ScanInsert, UpsertTable};
use crate::offline_queue::{DrainReport, OfflineActionQueue};
use crate::types::{OfflineOperation, OperationPayload, ScanAction, ScanContext, ScanPayload, ScanResult};

/// Location written for a returned bottle when the scan carries none.
pub const DEFAULT_RETURN_LOCATION: &str = "Warehouse";
/// `status` written on legacy scan rows.
pub const LEGACY_SCAN_STATUS: &str = "pending";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("scan insert failed: {0}")]
    ScanInsert(#[source] BackendError),
    #[error("{table} upsert failed: {source}")]
    Upsert {
        table: &'static str,
        #[source]
        source: BackendError,
    },
    #[error("failed to encode row: {0}")]
    Encode(#[from] serde_json::Error),
}

impl SyncError {
    pub fn backend_error(&self) -> Option<&BackendError> {
        match self {
            SyncError::ScanInsert(err) | SyncError::Upsert { source: err, .. } => Some(err),
            SyncError::Encode(_) => None,
        }
    }
}

/// A session scan that reached the backend during a sync pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncedScan {
    pub scan_id: String,
    pub server_id: Option<String>,
}

/// Result of one `sync_pending` pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub synced: usize,
    pub failed: usize,
    pub errors: Vec<String>,
    pub scans: Vec<SyncedScan>,
}

impl From<DrainReport> for SyncReport {
    fn from(report: DrainReport) -> Self {
        Self {
            synced: report.synced,
            scans: report
                .applied
                .into_iter()
                .filter_map(|applied| {
                    applied.scan_id.map(|scan_id| SyncedScan {
                        scan_id,
                        server_id: applied.server_id,
                    })
                })
                .collect(),
            failed: report.failed.len(),
            errors: report
                .failed
                .into_iter()
                .map(|f| format!("{} {}: {}", f.kind.as_str(), f.id, f.error))
                .collect(),
        }
    }
}

#[derive(Clone)]
pub struct SyncEngine {
    backend: Arc<dyn Backend>,
}

impl SyncEngine {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// Apply one queued operation. Returns the primary scan row id, if any.
    pub async fn sync_operation(&self, operation: &OfflineOperation) -> Result<Option<String>, SyncError> {
        let org = operation.organization_id;
        match &operation.payload {
            OperationPayload::Scan(scan) => {
                self.sync_scan_payload(scan, org, operation.user_id, Utc::now())
                    .await
            }
            OperationPayload::CylinderUpdate(update) => {
                self.upsert(UpsertTable::Bottles, update, org, operation.timestamp)
                    .await
                    .map(|_| None)
            }
            OperationPayload::CustomerUpdate(update) => {
                self.upsert(UpsertTable::Customers, update, org, operation.timestamp)
                    .await
                    .map(|_| None)
            }
            OperationPayload::RentalUpdate(update) => {
                self.upsert(UpsertTable::Rentals, update, org, operation.timestamp)
                    .await
                    .map(|_| None)
            }
        }
    }

    /// Write a session scan directly, outside the queue.
    pub async fn sync_scan(&self, scan: &ScanResult, context: &ScanContext) -> Result<Option<String>, SyncError> {
        let payload = ScanPayload::from_scan(scan, context);
        self.sync_scan_payload(&payload, context.organization_id, context.user_id, Utc::now())
            .await
    }

    async fn sync_scan_payload(
        &self,
        scan: &ScanPayload,
        organization_id: TenantId,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<Option<String>, SyncError> {
        let mode = scan.action.mode();
        let row = ScanInsert {
            organization_id,
            bottle_barcode: scan.barcode.clone(),
            mode: mode.clone(),
            location: scan.location.clone(),
            user_id,
            order_number: scan.order_number.clone(),
            customer_name: scan.customer_name.clone(),
            customer_id: scan.customer_id.clone(),
            product_code: scan.product_code.clone(),
            timestamp: scan.captured_at,
            created_at: now,
        };
        let server_id = match self.backend.insert_scan(&row).await {
            Ok(id) => id,
            Err(err) => {
                tracing::error!(barcode = %scan.barcode, error = %err, "scan insert failed");
                return Err(SyncError::ScanInsert(err));
            }
        };

        let legacy = LegacyScanInsert {
            organization_id,
            barcode_number: scan.barcode.clone(),
            product_code: scan.product_code.clone(),
            action: scan.action.as_str().to_string(),
            mode,
            location: scan.location.clone(),
            notes: scan.notes.clone(),
            scanned_by: user_id,
            order_number: scan.order_number.clone(),
            customer_name: scan.customer_name.clone(),
            customer_id: scan.customer_id.clone(),
            status: LEGACY_SCAN_STATUS.to_string(),
            created_at: now,
        };
        if let Err(err) = self.backend.insert_legacy_scan(&legacy).await {
            tracing::warn!(barcode = %scan.barcode, error = %err, "legacy scan insert failed");
        }

        let update = bottle_state_update(scan, now);
        if let Err(err) = self
            .backend
            .update_bottle_state(&scan.barcode, organization_id, &update)
            .await
        {
            tracing::warn!(barcode = %scan.barcode, error = %err, "bottle state update failed");
        }

        tracing::debug!(barcode = %scan.barcode, action = %scan.action, "scan synced");
        Ok(server_id)
    }

    async fn upsert<T: Serialize>(
        &self,
        table: UpsertTable,
        update: &T,
        organization_id: TenantId,
        updated_at: DateTime<Utc>,
    ) -> Result<(), SyncError> {
        let row = upsert_row(update, organization_id, updated_at)?;
        self.backend
            .upsert(table, row)
            .await
            .map_err(|source| SyncError::Upsert {
                table: table.name(),
                source,
            })
    }

    /// One full replay of the queue.
    pub async fn sync_pending(&self, queue: &OfflineActionQueue) -> SyncReport {
        let report = queue
            .drain(|operation| async move { self.sync_operation(&operation).await })
            .await;
        SyncReport::from(report)
    }
}

/// Bottle columns touched by a scan of `scan.action`.
pub fn bottle_state_update(scan: &ScanPayload, now: DateTime<Utc>) -> BottleStateUpdate {
    let mut update = BottleStateUpdate {
        status: None,
        location: None,
        assigned_customer: None,
        customer_name: None,
        last_scanned: now,
    };
    match scan.action {
        ScanAction::Out => {
            update.location = scan.location.clone();
            if scan.customer_id.is_some() || scan.customer_name.is_some() {
                update.assigned_customer = scan.customer_id.clone();
                update.customer_name = scan.customer_name.clone();
            }
        }
        ScanAction::In => {
            update.status = Some("empty".to_string());
            update.location = Some(
                scan.location
                    .clone()
                    .unwrap_or_else(|| DEFAULT_RETURN_LOCATION.to_string()),
            );
        }
        ScanAction::Fill => {
            update.status = Some("filled".to_string());
        }
        ScanAction::Locate => {
            update.location = scan.location.clone();
        }
    }
    update
}

/// Serialize an update, drop null columns, stamp tenant and `updated_at`.
fn upsert_row<T: Serialize>(
    update: &T,
    organization_id: TenantId,
    updated_at: DateTime<Utc>,
) -> Result<Value, serde_json::Error> {
    let mut row = serde_json::to_value(update)?;
    if let Value::Object(columns) = &mut row {
        columns.retain(|_, value| !value.is_null());
        columns.insert("organization_id".into(), Value::String(organization_id.to_string()));
        columns.insert("updated_at".into(), Value::String(updated_at.to_rfc3339()));
    }
    Ok(row)
}
