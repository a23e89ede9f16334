//! Shared record types for the scan pipeline.
//!
//! These are plain data: no I/O, no backend handles. Everything that is
//! persisted locally or sent to the backend is defined here.

use chrono::{DateTime, Utc};
use cylinder_core::{OperationId, TenantId, UserId};
use serde::{Deserialize, Serialize};

/// The semantic intent of a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanAction {
    /// Return to the warehouse.
    In,
    /// Ship to a customer.
    Out,
    Locate,
    Fill,
}

impl ScanAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanAction::In => "in",
            ScanAction::Out => "out",
            ScanAction::Locate => "locate",
            ScanAction::Fill => "fill",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "in" => Some(ScanAction::In),
            "out" => Some(ScanAction::Out),
            "locate" => Some(ScanAction::Locate),
            "fill" => Some(ScanAction::Fill),
            _ => None,
        }
    }

    /// Value written to the primary scan table's `mode` column.
    pub fn mode(&self) -> String {
        mode_for_action(self.as_str())
    }
}

impl core::fmt::Display for ScanAction {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Map an action name to the backend's `mode` vocabulary.
///
/// Unknown actions pass through upper-cased.
pub fn mode_for_action(action: &str) -> String {
    match action.trim().to_ascii_lowercase().as_str() {
        "out" => "SHIP".to_string(),
        "in" => "RETURN".to_string(),
        other => other.to_ascii_uppercase(),
    }
}

/// Snapshot of the matched inventory record at scan time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ItemDetails {
    pub barcode: String,
    pub product_code: Option<String>,
    pub description: Option<String>,
    pub status: Option<String>,
    pub location: Option<String>,
    pub customer_name: Option<String>,
}

/// Optional free-text fields entered alongside a scan.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ScanFields {
    pub customer_name: Option<String>,
    pub location: Option<String>,
    pub notes: Option<String>,
}

impl ScanFields {
    /// Trim every field; whitespace-only values become `None`.
    pub fn normalized(&self) -> Self {
        Self {
            customer_name: trimmed(self.customer_name.as_deref()),
            location: trimmed(self.location.as_deref()),
            notes: trimmed(self.notes.as_deref()),
        }
    }
}

pub(crate) fn trimmed(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// One scanned item within a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanResult {
    pub id: String,
    pub barcode: String,
    pub timestamp: DateTime<Utc>,
    pub action: ScanAction,
    pub customer_name: Option<String>,
    pub location: Option<String>,
    pub notes: Option<String>,
    pub synced: bool,
    pub offline: bool,
    pub item_details: Option<ItemDetails>,
    #[serde(default)]
    pub submitted: bool,
    /// Row id assigned by the backend's primary scan insert, when returned.
    #[serde(default)]
    pub server_id: Option<String>,
}

/// Order/route context the scanner was opened with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanContext {
    pub organization_id: TenantId,
    pub user_id: UserId,
    pub order_number: Option<String>,
    pub customer_name: Option<String>,
    pub customer_id: Option<String>,
}

impl ScanContext {
    pub fn new(organization_id: TenantId, user_id: UserId) -> Self {
        Self {
            organization_id,
            user_id,
            order_number: None,
            customer_name: None,
            customer_id: None,
        }
    }

    pub fn with_order(mut self, order_number: impl Into<String>) -> Self {
        self.order_number = trimmed(Some(&order_number.into()));
        self
    }

    pub fn with_customer(mut self, customer_id: Option<String>, customer_name: Option<String>) -> Self {
        self.customer_id = trimmed(customer_id.as_deref());
        self.customer_name = trimmed(customer_name.as_deref());
        self
    }
}

/// Payload of a queued scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanPayload {
    /// Session-local id of the `ScanResult` this was captured from.
    pub scan_id: Option<String>,
    pub barcode: String,
    pub action: ScanAction,
    pub location: Option<String>,
    pub notes: Option<String>,
    pub order_number: Option<String>,
    pub customer_name: Option<String>,
    pub customer_id: Option<String>,
    pub product_code: Option<String>,
    pub captured_at: DateTime<Utc>,
}

impl ScanPayload {
    /// Build the queued form of a session scan.
    pub fn from_scan(scan: &ScanResult, context: &ScanContext) -> Self {
        Self {
            scan_id: Some(scan.id.clone()),
            barcode: scan.barcode.clone(),
            action: scan.action,
            location: scan.location.clone(),
            notes: scan.notes.clone(),
            order_number: context.order_number.clone(),
            customer_name: context
                .customer_name
                .clone()
                .or_else(|| scan.customer_name.clone()),
            customer_id: context.customer_id.clone(),
            product_code: scan
                .item_details
                .as_ref()
                .and_then(|d| d.product_code.clone()),
            captured_at: scan.timestamp,
        }
    }
}

/// Upsert into `bottles`, keyed by `id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CylinderUpdate {
    pub id: String,
    pub barcode_number: Option<String>,
    pub product_code: Option<String>,
    pub status: Option<String>,
    pub location: Option<String>,
    pub assigned_customer: Option<String>,
    pub customer_name: Option<String>,
}

/// Upsert into `customers`, keyed by `id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerUpdate {
    pub id: String,
    pub name: Option<String>,
    pub customer_type: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub address: Option<String>,
}

/// Upsert into `rentals`, keyed by `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RentalUpdate {
    pub id: String,
    pub customer_id: Option<String>,
    pub bottle_barcode: Option<String>,
    pub status: Option<String>,
    pub rental_start_date: Option<String>,
    pub rental_end_date: Option<String>,
    pub rental_amount: Option<f64>,
}

/// A queued backend mutation, one variant per target table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum OperationPayload {
    Scan(ScanPayload),
    CylinderUpdate(CylinderUpdate),
    CustomerUpdate(CustomerUpdate),
    RentalUpdate(RentalUpdate),
}

impl OperationPayload {
    pub fn kind(&self) -> OperationKind {
        match self {
            OperationPayload::Scan(_) => OperationKind::Scan,
            OperationPayload::CylinderUpdate(_) => OperationKind::CylinderUpdate,
            OperationPayload::CustomerUpdate(_) => OperationKind::CustomerUpdate,
            OperationPayload::RentalUpdate(_) => OperationKind::RentalUpdate,
        }
    }
}

/// Discriminant of [`OperationPayload`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Scan,
    CylinderUpdate,
    CustomerUpdate,
    RentalUpdate,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Scan => "scan",
            OperationKind::CylinderUpdate => "cylinder_update",
            OperationKind::CustomerUpdate => "customer_update",
            OperationKind::RentalUpdate => "rental_update",
        }
    }
}

/// A mutation waiting in the offline queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfflineOperation {
    pub id: OperationId,
    pub payload: OperationPayload,
    pub organization_id: TenantId,
    pub user_id: UserId,
    pub timestamp: DateTime<Utc>,
    pub synced: bool,
}

impl OfflineOperation {
    pub fn kind(&self) -> OperationKind {
        self.payload.kind()
    }

    /// Session scan id carried by a scan payload, if any.
    pub fn scan_id(&self) -> Option<&str> {
        match &self.payload {
            OperationPayload::Scan(scan) => scan.scan_id.as_deref(),
            _ => None,
        }
    }
}

/// Queue counters for display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct QueueStats {
    pub total: usize,
    pub pending: usize,
    pub synced: usize,
}

/// Connectivity state of the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectivityState {
    /// Online and able to reach the backend.
    Online,
    /// Offline (network unreachable or backend unavailable).
    Offline,
}
