//! In-memory backend with scripted failures, shared by the integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cylinder_core::{TenantId, UserId};
use cylinder_scanner::backend::{
    Backend, BackendError, BottleRecord, BottleStateUpdate, CustomerRecord, LegacyScanInsert, OrderRecord,
    RentalRecord, ScanDeletion, ScanInsert, ScanTable, UpsertTable,
};
use cylinder_scanner::controller::ManualClock;
use cylinder_scanner::debounce::{Detection, Rect, ScreenSize};
use cylinder_scanner::storage::MemoryStore;
use cylinder_scanner::{ScanContext, ScannerConfig, ScannerController};
use serde_json::Value;

pub fn t0() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2026-03-02T08:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

pub fn bottle(barcode: &str) -> BottleRecord {
    BottleRecord {
        id: Some(format!("bottle-{barcode}")),
        barcode_number: barcode.to_string(),
        product_code: Some("OX-40".into()),
        description: Some("Oxygen 40L".into()),
        status: Some("filled".into()),
        location: Some("Warehouse".into()),
        ..BottleRecord::default()
    }
}

pub fn network_error() -> BackendError {
    BackendError::Network("connection reset".into())
}

#[derive(Debug, Clone)]
pub struct StoredScan {
    pub id: String,
    pub row: ScanInsert,
    pub order_number: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StoredLegacyScan {
    pub row: LegacyScanInsert,
    pub order_number: Option<String>,
}

#[derive(Debug, Default)]
pub struct BackendState {
    pub bottles: Vec<BottleRecord>,
    pub customers: Vec<CustomerRecord>,
    pub rentals: Vec<RentalRecord>,
    pub scans: Vec<StoredScan>,
    pub legacy_scans: Vec<StoredLegacyScan>,
    pub bottle_updates: Vec<(String, BottleStateUpdate)>,
    pub upserts: Vec<(UpsertTable, Value)>,
    pub orders: Vec<OrderRecord>,
    pub deletions: Vec<ScanDeletion>,
    pub calls: Vec<&'static str>,
    next_id: u64,
    fail_next: HashMap<&'static str, VecDeque<BackendError>>,
    fail_always: HashMap<&'static str, BackendError>,
}

/// Fake PostgREST backend. Every method name can be scripted to fail, either
/// once per queued error (`fail_next`) or on every call (`fail_always`).
#[derive(Debug, Default)]
pub struct FakeBackend {
    state: Mutex<BackendState>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bottles(barcodes: &[&str]) -> Self {
        let backend = Self::new();
        backend.state().bottles = barcodes.iter().map(|b| bottle(b)).collect();
        backend
    }

    pub fn state(&self) -> MutexGuard<'_, BackendState> {
        self.state.lock().unwrap()
    }

    pub fn fail_next(&self, method: &'static str, err: BackendError) {
        self.state().fail_next.entry(method).or_default().push_back(err);
    }

    pub fn fail_always(&self, method: &'static str, err: BackendError) {
        self.state().fail_always.insert(method, err);
    }

    pub fn heal(&self, method: &'static str) {
        let mut state = self.state();
        state.fail_always.remove(method);
        state.fail_next.remove(method);
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.state().calls.clone()
    }

    fn enter(&self, method: &'static str) -> Result<MutexGuard<'_, BackendState>, BackendError> {
        let mut state = self.state();
        state.calls.push(method);
        if let Some(err) = state.fail_next.get_mut(method).and_then(VecDeque::pop_front) {
            return Err(err);
        }
        if let Some(err) = state.fail_always.get(method) {
            return Err(err.clone());
        }
        Ok(state)
    }
}

#[async_trait]
impl Backend for FakeBackend {
    async fn find_bottle(
        &self,
        barcode: &str,
        organization_id: TenantId,
    ) -> Result<Option<BottleRecord>, BackendError> {
        let _ = organization_id;
        let state = self.enter("find_bottle")?;
        Ok(state.bottles.iter().find(|b| b.barcode_number == barcode).cloned())
    }

    async fn insert_scan(&self, row: &ScanInsert) -> Result<Option<String>, BackendError> {
        let mut state = self.enter("insert_scan")?;
        state.next_id += 1;
        let id = format!("scan-{}", state.next_id);
        state.scans.push(StoredScan {
            id: id.clone(),
            row: row.clone(),
            order_number: row.order_number.clone(),
        });
        Ok(Some(id))
    }

    async fn insert_legacy_scan(&self, row: &LegacyScanInsert) -> Result<(), BackendError> {
        let mut state = self.enter("insert_legacy_scan")?;
        state.legacy_scans.push(StoredLegacyScan {
            row: row.clone(),
            order_number: row.order_number.clone(),
        });
        Ok(())
    }

    async fn update_bottle_state(
        &self,
        barcode: &str,
        _organization_id: TenantId,
        update: &BottleStateUpdate,
    ) -> Result<(), BackendError> {
        let mut state = self.enter("update_bottle_state")?;
        state.bottle_updates.push((barcode.to_string(), update.clone()));
        Ok(())
    }

    async fn upsert(&self, table: UpsertTable, row: Value) -> Result<(), BackendError> {
        let mut state = self.enter("upsert")?;
        state.upserts.push((table, row));
        Ok(())
    }

    async fn backfill_order_number(
        &self,
        table: ScanTable,
        barcodes: &[String],
        organization_id: TenantId,
        order_number: &str,
    ) -> Result<u64, BackendError> {
        let method = match table {
            ScanTable::Primary => "backfill_primary",
            ScanTable::Legacy => "backfill_legacy",
        };
        let mut state = self.enter(method)?;
        let mut rows = 0;
        match table {
            ScanTable::Primary => {
                for scan in state.scans.iter_mut().filter(|s| {
                    s.row.organization_id == organization_id && barcodes.contains(&s.row.bottle_barcode)
                }) {
                    scan.order_number = Some(order_number.to_string());
                    rows += 1;
                }
            }
            ScanTable::Legacy => {
                for scan in state.legacy_scans.iter_mut().filter(|s| {
                    s.row.organization_id == organization_id && barcodes.contains(&s.row.barcode_number)
                }) {
                    scan.order_number = Some(order_number.to_string());
                    rows += 1;
                }
            }
        }
        Ok(rows)
    }

    async fn find_order(
        &self,
        order_number: &str,
        organization_id: TenantId,
    ) -> Result<Option<OrderRecord>, BackendError> {
        let state = self.enter("find_order")?;
        let org = organization_id.to_string();
        Ok(state
            .orders
            .iter()
            .find(|o| o.sales_order_number == order_number && o.organization_id == org)
            .cloned())
    }

    async fn insert_order(&self, order: &OrderRecord) -> Result<OrderRecord, BackendError> {
        let mut state = self.enter("insert_order")?;
        state.next_id += 1;
        let stored = OrderRecord {
            id: Some(format!("order-{}", state.next_id)),
            ..order.clone()
        };
        state.orders.push(stored.clone());
        Ok(stored)
    }

    async fn update_order_notes(&self, order_id: &str, notes: &str) -> Result<OrderRecord, BackendError> {
        let mut state = self.enter("update_order_notes")?;
        let order = state
            .orders
            .iter_mut()
            .find(|o| o.id.as_deref() == Some(order_id))
            .ok_or_else(|| BackendError::Api {
                status: 404,
                code: None,
                message: format!("order {order_id} not found"),
            })?;
        order.notes = Some(notes.to_string());
        Ok(order.clone())
    }

    async fn delete_scans(&self, target: &ScanDeletion) -> Result<u64, BackendError> {
        let mut state = self.enter("delete_scans")?;
        state.deletions.push(target.clone());
        let before = state.scans.len();
        match target {
            ScanDeletion::ById(id) => state.scans.retain(|s| &s.id != id),
            ScanDeletion::ByWindow {
                barcode,
                organization_id,
                from,
                to,
            } => state.scans.retain(|s| {
                !(s.row.bottle_barcode == *barcode
                    && s.row.organization_id == *organization_id
                    && s.row.timestamp >= *from
                    && s.row.timestamp <= *to)
            }),
        }
        Ok((before - state.scans.len()) as u64)
    }

    async fn ping(&self) -> Result<(), BackendError> {
        self.enter("ping").map(|_| ())
    }

    async fn fetch_bottles(
        &self,
        _organization_id: TenantId,
        limit: usize,
    ) -> Result<Vec<BottleRecord>, BackendError> {
        let state = self.enter("fetch_bottles")?;
        Ok(state.bottles.iter().take(limit).cloned().collect())
    }

    async fn fetch_customers(
        &self,
        _organization_id: TenantId,
        limit: usize,
    ) -> Result<Vec<CustomerRecord>, BackendError> {
        let state = self.enter("fetch_customers")?;
        Ok(state.customers.iter().take(limit).cloned().collect())
    }

    async fn fetch_active_rentals(
        &self,
        _organization_id: TenantId,
        limit: usize,
    ) -> Result<Vec<RentalRecord>, BackendError> {
        let state = self.enter("fetch_active_rentals")?;
        Ok(state.rentals.iter().take(limit).cloned().collect())
    }
}

pub fn context() -> ScanContext {
    ScanContext::new(TenantId::new(), UserId::new()).with_order("SO-1001")
}

/// A controller wired to in-memory collaborators, opened and past its countdown.
pub struct Harness {
    pub controller: Arc<ScannerController>,
    pub backend: Arc<FakeBackend>,
    pub store: Arc<MemoryStore>,
    pub clock: Arc<ManualClock>,
    pub context: ScanContext,
}

impl Harness {
    pub async fn open(backend: FakeBackend) -> Self {
        let backend = Arc::new(backend);
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(t0()));
        let context = context();
        let controller = Arc::new(ScannerController::new(
            ScannerConfig::default(),
            store.clone(),
            backend.clone(),
            clock.clone(),
            ScreenSize::new(1000.0, 2000.0),
        ));
        controller.set_context(context.clone());
        controller.init().await.unwrap();
        controller.open_scanner(context.clone());
        clock.advance(chrono::Duration::seconds(3));
        Self {
            controller,
            backend,
            store,
            clock,
            context,
        }
    }

    /// A detection centred in the default scan frame, stamped with the clock.
    pub fn detection(&self, barcode: &str) -> Detection {
        Detection::new(barcode, self.now()).with_bounds(Rect::new(450.0, 950.0, 100.0, 100.0))
    }

    pub fn now(&self) -> DateTime<Utc> {
        use cylinder_scanner::controller::Clock;
        self.clock.now()
    }
}
