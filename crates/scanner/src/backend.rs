//! Backend collaborator.
//!
//! The pipeline only talks to the hosted database through [`Backend`]. The
//! production implementation is [`crate::rest::PostgrestBackend`]; tests use
//! in-memory fakes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cylinder_core::{TenantId, UserId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::types::ItemDetails;

/// PostgreSQL `undefined_column`.
pub const UNDEFINED_COLUMN_CODE: &str = "42703";

#[derive(Debug, Clone, Error)]
pub enum BackendError {
    #[error("network error: {0}")]
    Network(String),
    #[error("request timed out")]
    Timeout,
    #[error("API error ({status}): {message}")]
    Api {
        status: u16,
        code: Option<String>,
        message: String,
    },
    #[error("column does not exist: {0}")]
    UndefinedColumn(String),
    #[error("parse error: {0}")]
    Parse(String),
}

impl BackendError {
    /// Worth retrying later without any change on our side.
    pub fn is_transient(&self) -> bool {
        match self {
            BackendError::Network(_) | BackendError::Timeout => true,
            BackendError::Api { status, .. } => *status == 429 || *status >= 500,
            BackendError::UndefinedColumn(_) | BackendError::Parse(_) => false,
        }
    }

    pub fn is_undefined_column(&self) -> bool {
        match self {
            BackendError::UndefinedColumn(_) => true,
            BackendError::Api { code, .. } => code.as_deref() == Some(UNDEFINED_COLUMN_CODE),
            _ => false,
        }
    }
}

/// Inventory row from `bottles`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BottleRecord {
    pub id: Option<String>,
    pub barcode_number: String,
    pub product_code: Option<String>,
    pub description: Option<String>,
    pub status: Option<String>,
    pub location: Option<String>,
    pub assigned_customer: Option<String>,
    pub customer_name: Option<String>,
}

impl From<&BottleRecord> for ItemDetails {
    fn from(record: &BottleRecord) -> Self {
        Self {
            barcode: record.barcode_number.clone(),
            product_code: record.product_code.clone(),
            description: record.description.clone(),
            status: record.status.clone(),
            location: record.location.clone(),
            customer_name: record.customer_name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CustomerRecord {
    pub id: String,
    pub name: String,
    pub customer_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RentalRecord {
    pub id: String,
    pub customer_id: Option<String>,
    pub bottle_barcode: Option<String>,
    pub status: Option<String>,
}

/// Row for the primary scan table, `bottle_scans`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanInsert {
    pub organization_id: TenantId,
    pub bottle_barcode: String,
    pub mode: String,
    pub location: Option<String>,
    pub user_id: UserId,
    pub order_number: Option<String>,
    pub customer_name: Option<String>,
    pub customer_id: Option<String>,
    pub product_code: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Row for the legacy scan table, `scans`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LegacyScanInsert {
    pub organization_id: TenantId,
    pub barcode_number: String,
    pub product_code: Option<String>,
    pub action: String,
    pub mode: String,
    pub location: Option<String>,
    pub notes: Option<String>,
    pub scanned_by: UserId,
    pub order_number: Option<String>,
    pub customer_name: Option<String>,
    pub customer_id: Option<String>,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

/// Partial update of a bottle after a scan. `None` fields are left alone.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BottleStateUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_customer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customer_name: Option<String>,
    pub last_scanned: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpsertTable {
    Bottles,
    Customers,
    Rentals,
}

impl UpsertTable {
    pub fn name(&self) -> &'static str {
        match self {
            UpsertTable::Bottles => "bottles",
            UpsertTable::Customers => "customers",
            UpsertTable::Rentals => "rentals",
        }
    }
}

/// The two tables scan rows live in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScanTable {
    /// `bottle_scans`
    Primary,
    /// `scans`
    Legacy,
}

impl ScanTable {
    pub fn name(&self) -> &'static str {
        match self {
            ScanTable::Primary => "bottle_scans",
            ScanTable::Legacy => "scans",
        }
    }

    pub fn barcode_column(&self) -> &'static str {
        match self {
            ScanTable::Primary => "bottle_barcode",
            ScanTable::Legacy => "barcode_number",
        }
    }
}

/// Row in `sales_orders`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OrderRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub organization_id: String,
    pub sales_order_number: String,
    #[serde(default)]
    pub customer_name: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

/// Which scan rows to delete from the primary table.
#[derive(Debug, Clone, PartialEq)]
pub enum ScanDeletion {
    ById(String),
    /// Rows for `barcode` in the tenant whose scan `timestamp` is within
    /// `[from, to]`.
    ByWindow {
        barcode: String,
        organization_id: TenantId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    },
}

#[async_trait]
pub trait Backend: Send + Sync {
    /// Zero-or-one bottle by barcode within the tenant.
    async fn find_bottle(
        &self,
        barcode: &str,
        organization_id: TenantId,
    ) -> Result<Option<BottleRecord>, BackendError>;

    /// Insert into the primary scan table; returns the new row id if echoed.
    async fn insert_scan(&self, row: &ScanInsert) -> Result<Option<String>, BackendError>;

    async fn insert_legacy_scan(&self, row: &LegacyScanInsert) -> Result<(), BackendError>;

    async fn update_bottle_state(
        &self,
        barcode: &str,
        organization_id: TenantId,
        update: &BottleStateUpdate,
    ) -> Result<(), BackendError>;

    /// Upsert one row keyed by its `id` column.
    async fn upsert(&self, table: UpsertTable, row: Value) -> Result<(), BackendError>;

    /// Set `order_number` on every row for `barcodes`; returns rows updated.
    async fn backfill_order_number(
        &self,
        table: ScanTable,
        barcodes: &[String],
        organization_id: TenantId,
        order_number: &str,
    ) -> Result<u64, BackendError>;

    async fn find_order(
        &self,
        order_number: &str,
        organization_id: TenantId,
    ) -> Result<Option<OrderRecord>, BackendError>;

    async fn insert_order(&self, order: &OrderRecord) -> Result<OrderRecord, BackendError>;

    async fn update_order_notes(&self, order_id: &str, notes: &str) -> Result<OrderRecord, BackendError>;

    /// Delete scan rows; returns rows deleted.
    async fn delete_scans(&self, target: &ScanDeletion) -> Result<u64, BackendError>;

    /// Cheap reachability probe.
    async fn ping(&self) -> Result<(), BackendError>;

    async fn fetch_bottles(
        &self,
        organization_id: TenantId,
        limit: usize,
    ) -> Result<Vec<BottleRecord>, BackendError>;

    async fn fetch_customers(
        &self,
        organization_id: TenantId,
        limit: usize,
    ) -> Result<Vec<CustomerRecord>, BackendError>;

    async fn fetch_active_rentals(
        &self,
        organization_id: TenantId,
        limit: usize,
    ) -> Result<Vec<RentalRecord>, BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_are_network_timeouts_and_5xx() {
        assert!(BackendError::Network("reset".into()).is_transient());
        assert!(BackendError::Timeout.is_transient());
        assert!(BackendError::Api {
            status: 503,
            code: None,
            message: "unavailable".into()
        }
        .is_transient());
        assert!(!BackendError::Api {
            status: 400,
            code: Some("23505".into()),
            message: "duplicate key".into()
        }
        .is_transient());
    }

    #[test]
    fn undefined_column_is_recognised_by_code() {
        let err = BackendError::Api {
            status: 400,
            code: Some(UNDEFINED_COLUMN_CODE.into()),
            message: "column scans.order_number does not exist".into(),
        };
        assert!(err.is_undefined_column());
        assert!(BackendError::UndefinedColumn("order_number".into()).is_undefined_column());
        assert!(!BackendError::Timeout.is_undefined_column());
    }

    #[test]
    fn bottle_state_update_omits_untouched_fields() {
        let update = BottleStateUpdate {
            status: Some("filled".into()),
            location: None,
            assigned_customer: None,
            customer_name: None,
            last_scanned: DateTime::parse_from_rfc3339("2026-03-02T08:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
        };
        let json = serde_json::to_value(&update).unwrap();
        let object = json.as_object().unwrap();
        assert_eq!(object.len(), 2);
        assert_eq!(json["status"], "filled");
    }

    #[test]
    fn bottle_record_tolerates_missing_columns() {
        let record: BottleRecord =
            serde_json::from_value(serde_json::json!({ "barcode_number": "123456789", "location": "Dock" }))
                .unwrap();
        let details = ItemDetails::from(&record);
        assert_eq!(details.barcode, "123456789");
        assert_eq!(details.location.as_deref(), Some("Dock"));
    }
}
