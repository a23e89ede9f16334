//! Order submission: sync the session, stamp the order number on every scan
//! row, then create or update the sales order.
//!
//! Every step after the precondition check runs even when an earlier one
//! failed. The outcome is classified from what actually succeeded and there is
//! no automatic retry.

use std::sync::Arc;

use serde::Serialize;

use crate::backend::{Backend, OrderRecord, ScanTable};
use crate::offline_queue::OfflineActionQueue;
use crate::session::{lock_session, SharedSession};
use crate::sync_engine::SyncEngine;
use crate::types::ScanContext;

/// Customer name used when the scan context has none.
pub const DEFAULT_ORDER_CUSTOMER: &str = "Mobile Scan Order";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SubmissionPhase {
    Idle,
    Syncing,
    BackfillingOrderNumber,
    UpsertingOrder,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SubmissionOutcome {
    FullSuccess,
    PartialSuccess,
    Failure,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubmissionReport {
    pub outcome: SubmissionOutcome,
    /// Operator-facing, shown verbatim.
    pub message: String,
    pub errors: Vec<String>,
    pub synced: usize,
    pub rows_backfilled: u64,
    pub order: Option<OrderRecord>,
    /// Phases entered, in order.
    pub phases: Vec<SubmissionPhase>,
}

impl SubmissionReport {
    fn precondition_failed(message: &str) -> Self {
        Self {
            outcome: SubmissionOutcome::Failure,
            message: message.to_string(),
            errors: vec![message.to_string()],
            synced: 0,
            rows_backfilled: 0,
            order: None,
            phases: vec![SubmissionPhase::Idle],
        }
    }
}

pub struct OrderSubmissionCoordinator {
    engine: SyncEngine,
    backend: Arc<dyn Backend>,
}

impl OrderSubmissionCoordinator {
    pub fn new(engine: SyncEngine) -> Self {
        let backend = engine.backend().clone();
        Self { engine, backend }
    }

    pub async fn submit(
        &self,
        session: &SharedSession,
        queue: &OfflineActionQueue,
        context: Option<&ScanContext>,
    ) -> SubmissionReport {
        let mut phases = vec![SubmissionPhase::Idle];

        let Some(context) = context else {
            return SubmissionReport::precondition_failed("No organization found. Please try again.");
        };
        let Some(order_number) = context.order_number.clone() else {
            return SubmissionReport::precondition_failed(
                "No order number found. Please start scanning from the order selection screen.",
            );
        };
        let (pending, item_count) = {
            let session = lock_session(session);
            (session.unsynced(), session.len())
        };
        if item_count == 0 {
            return SubmissionReport::precondition_failed("No scanned items to submit.");
        }

        let org = context.organization_id;
        let mut errors = Vec::new();
        tracing::info!(%org, %order_number, items = item_count, "submitting order");

        phases.push(SubmissionPhase::Syncing);
        let mut synced = 0;
        for scan in &pending {
            match self.engine.sync_scan(scan, context).await {
                Ok(server_id) => {
                    synced += 1;
                    lock_session(session).mark_synced(&scan.id, server_id);
                    if let Err(err) = queue.mark_scan_synced(&scan.id).await {
                        tracing::warn!(scan_id = %scan.id, error = %err, "queued copy not marked synced");
                    }
                }
                Err(err) => errors.push(format!("Failed to sync item {}: {err}", scan.barcode)),
            }
        }

        phases.push(SubmissionPhase::BackfillingOrderNumber);
        let barcodes = lock_session(session).barcodes();
        let mut rows_backfilled = 0;
        let errors_before_backfill = errors.len();
        for table in [ScanTable::Primary, ScanTable::Legacy] {
            match self
                .backend
                .backfill_order_number(table, &barcodes, org, &order_number)
                .await
            {
                Ok(rows) => rows_backfilled += rows,
                Err(err) if table == ScanTable::Legacy && err.is_undefined_column() => {
                    tracing::debug!(table = table.name(), "order_number column missing; skipped");
                }
                Err(err) => {
                    errors.push(format!("Failed to update order number on {}: {err}", table.name()))
                }
            }
        }
        let backfill_ok = rows_backfilled >= 1;
        if !backfill_ok && errors.len() == errors_before_backfill {
            errors.push("Order number backfill updated no rows".to_string());
        }

        phases.push(SubmissionPhase::UpsertingOrder);
        let notes = format!("Mobile scan order submitted with {item_count} scanned items");
        let order = match self.upsert_order(context, &order_number, &notes).await {
            Ok(order) => Some(order),
            Err(message) => {
                errors.push(message);
                None
            }
        };
        let order_ok = order.is_some();

        phases.push(SubmissionPhase::Done);
        lock_session(session).mark_all_submitted();

        let outcome = if backfill_ok && order_ok && errors.is_empty() {
            SubmissionOutcome::FullSuccess
        } else if backfill_ok || order_ok {
            SubmissionOutcome::PartialSuccess
        } else {
            SubmissionOutcome::Failure
        };
        let message = match outcome {
            SubmissionOutcome::FullSuccess => format!(
                "Order {order_number} has been submitted for processing with {item_count} items."
            ),
            SubmissionOutcome::PartialSuccess => format!(
                "Order {order_number} was submitted with {} issue(s):\n{}",
                errors.len(),
                errors.join("\n")
            ),
            SubmissionOutcome::Failure => {
                format!("Failed to submit order {order_number}:\n{}", errors.join("\n"))
            }
        };

        match outcome {
            SubmissionOutcome::FullSuccess => {
                tracing::info!(%order_number, rows_backfilled, "order submitted")
            }
            _ => tracing::warn!(%order_number, ?outcome, errors = errors.len(), "order submitted with errors"),
        }

        SubmissionReport {
            outcome,
            message,
            errors,
            synced,
            rows_backfilled,
            order,
            phases,
        }
    }

    /// Fetch-or-create on `(sales_order_number, organization_id)`.
    async fn upsert_order(
        &self,
        context: &ScanContext,
        order_number: &str,
        notes: &str,
    ) -> Result<OrderRecord, String> {
        let org = context.organization_id;
        let existing = self
            .backend
            .find_order(order_number, org)
            .await
            .map_err(|err| format!("Failed to look up order: {err}"))?;

        match existing.and_then(|order| order.id) {
            Some(id) => self
                .backend
                .update_order_notes(&id, notes)
                .await
                .map_err(|err| format!("Failed to update order: {err}")),
            None => {
                let order = OrderRecord {
                    id: None,
                    organization_id: org.to_string(),
                    sales_order_number: order_number.to_string(),
                    customer_name: Some(
                        context
                            .customer_name
                            .clone()
                            .unwrap_or_else(|| DEFAULT_ORDER_CUSTOMER.to_string()),
                    ),
                    notes: Some(notes.to_string()),
                };
                self.backend
                    .insert_order(&order)
                    .await
                    .map_err(|err| format!("Failed to create order: {err}"))
            }
        }
    }
}
