//! Top-level scan session controller.
//!
//! Owns every service instance (guard, session, queue, caches, engine,
//! coordinator) and drives one detection from the camera through validation,
//! the existence check, the session store and finally the backend or the
//! offline queue.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Duration, Utc};
use cylinder_core::OperationId;
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::autocomplete::{AutoCompleteCache, Suggestion, SuggestionKind};
use crate::backend::{Backend, ScanDeletion};
use crate::config::ScannerConfig;
use crate::connectivity::{Connectivity, ConnectivityError, ConnectivityState};
use crate::debounce::{Detection, ProcessingTicket, Rect, Rejection, ScanDebounceGuard, ScannerPhase, ScreenSize};
use crate::offline_queue::{OfflineActionQueue, QueueError};
use crate::reference_cache::{PreloadSummary, ReferenceCache, ReferenceSnapshot};
use crate::session::{lock_session, NewScan, ScanSessionStore, SessionStats, SessionUpdate, SharedSession};
use crate::storage::{LocalStore, StoreError};
use crate::submission::{OrderSubmissionCoordinator, SubmissionReport};
use crate::sync_engine::{SyncEngine, SyncReport, SyncedScan};
use crate::types::{
    ItemDetails, OperationPayload, QueueStats, ScanAction, ScanContext, ScanFields, ScanPayload, ScanResult,
};
use crate::validator::{validate_barcode, BarcodeValidation};

/// Half-width of the window used to find a synced scan's backend row when
/// its id is unknown.
pub const DELETE_WINDOW_SECS: i64 = 60;

/// Time source, injectable for tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("scanner has no scan context; open it for an organization first")]
    NoContext,
    #[error("no scan at index {0}")]
    NoSuchScan(usize),
    #[error("a sync pass is already running")]
    SyncInProgress,
    #[error(transparent)]
    Offline(#[from] ConnectivityError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Where a recorded scan went.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Synced { server_id: Option<String> },
    Queued(OperationId),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScanOutcome {
    /// Dropped by the debounce guard. Not shown to the operator.
    Ignored(Rejection),
    Invalid(BarcodeValidation),
    NotFound { barcode: String },
    Duplicate { entry: ScanResult, count: u32 },
    Recorded { entry: ScanResult, delivery: Delivery },
    Switched {
        previous_action: ScanAction,
        entry: ScanResult,
        delivery: Delivery,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemovalReport {
    pub removed: ScanResult,
    /// Backend rows deleted, when a delete was attempted and succeeded.
    pub backend_deleted: Option<u64>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncStatus {
    pub connectivity: ConnectivityState,
    pub queue: QueueStats,
    pub last_sync: Option<DateTime<Utc>>,
    pub syncing: bool,
}

pub struct ScannerController {
    config: ScannerConfig,
    clock: Arc<dyn Clock>,
    backend: Arc<dyn Backend>,
    guard: ScanDebounceGuard,
    session: SharedSession,
    queue: OfflineActionQueue,
    autocomplete: AutoCompleteCache,
    reference: ReferenceCache,
    engine: SyncEngine,
    coordinator: OrderSubmissionCoordinator,
    connectivity: Connectivity,
    context: RwLock<Option<ScanContext>>,
    /// Held for a whole sync pass or submission; never both at once.
    sync_lock: Arc<tokio::sync::Mutex<()>>,
    /// Session scans that were neither written nor queued, keyed by scan id.
    stranded: Mutex<HashMap<String, ScanContext>>,
}

impl ScannerController {
    pub fn new(
        config: ScannerConfig,
        store: Arc<dyn LocalStore>,
        backend: Arc<dyn Backend>,
        clock: Arc<dyn Clock>,
        screen: ScreenSize,
    ) -> Self {
        let engine = SyncEngine::new(Arc::clone(&backend));
        Self {
            guard: ScanDebounceGuard::new(config.debounce, screen),
            session: Arc::new(Mutex::new(ScanSessionStore::new())),
            queue: OfflineActionQueue::new(Arc::clone(&store)).with_max_bytes(config.queue_max_bytes),
            autocomplete: AutoCompleteCache::new(Arc::clone(&store)),
            reference: ReferenceCache::new(store),
            coordinator: OrderSubmissionCoordinator::new(engine.clone()),
            engine,
            connectivity: Connectivity::default(),
            context: RwLock::new(None),
            sync_lock: Arc::new(tokio::sync::Mutex::new(())),
            stranded: Mutex::new(HashMap::new()),
            config,
            clock,
            backend,
        }
    }

    /// Restore persisted state and refresh stale reference data.
    pub async fn init(&self) -> Result<(), ControllerError> {
        let restored = self.queue.load().await?;
        self.autocomplete.init().await;
        let state = self.connectivity.probe(self.backend.as_ref()).await;
        tracing::info!(restored, ?state, "scanner controller initialized");

        if state == ConnectivityState::Online {
            if let Some(context) = self.context() {
                let org = context.organization_id;
                let now = self.clock.now();
                if self.reference.is_stale(org, self.config.reference_max_age, now).await {
                    if let Err(err) = self.reference.preload(self.backend.as_ref(), org, now).await {
                        tracing::warn!(error = %err, "reference preload failed");
                    }
                }
            }
        }
        Ok(())
    }

    pub async fn dispose(&self) {
        self.guard.close();
        self.autocomplete.dispose().await;
        tracing::info!("scanner controller disposed");
    }

    pub fn context(&self) -> Option<ScanContext> {
        self.context.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set_context(&self, context: ScanContext) {
        *self.context.write().unwrap_or_else(|e| e.into_inner()) = Some(context);
    }

    /// Open the camera for `context` and start the readiness countdown.
    pub fn open_scanner(&self, context: ScanContext) {
        self.set_context(context);
        self.guard.open(self.clock.now());
    }

    pub fn close_scanner(&self) {
        self.guard.close();
    }

    pub fn scanner_phase(&self) -> ScannerPhase {
        self.guard.phase(self.clock.now())
    }

    pub fn set_scan_frame(&self, frame: Rect) {
        self.guard.set_frame(frame);
    }

    pub fn set_screen(&self, screen: ScreenSize) {
        self.guard.set_screen(screen);
    }

    pub fn session(&self) -> SharedSession {
        Arc::clone(&self.session)
    }

    pub fn scans(&self) -> Vec<ScanResult> {
        lock_session(&self.session).entries().to_vec()
    }

    pub fn session_stats(&self) -> SessionStats {
        lock_session(&self.session).stats()
    }

    pub fn queue(&self) -> &OfflineActionQueue {
        &self.queue
    }

    pub fn connectivity(&self) -> &Connectivity {
        &self.connectivity
    }

    /// Camera path: debounce, validate, look up, record.
    pub async fn handle_detection(
        &self,
        detection: Detection,
        action: ScanAction,
        fields: ScanFields,
    ) -> Result<ScanOutcome, ControllerError> {
        let ticket = match self.guard.admit(&detection) {
            Ok(ticket) => ticket,
            Err(rejection) => return Ok(ScanOutcome::Ignored(rejection)),
        };
        self.process(ticket, action, fields).await
    }

    /// Typed-in barcode. Skips the readiness, geometry and cooldown gates.
    pub async fn handle_manual_entry(
        &self,
        raw: &str,
        action: ScanAction,
        fields: ScanFields,
    ) -> Result<ScanOutcome, ControllerError> {
        if raw.trim().is_empty() {
            return Ok(ScanOutcome::Invalid(validate_barcode(raw)));
        }
        let ticket = match self.guard.admit_manual(raw) {
            Ok(ticket) => ticket,
            Err(rejection) => return Ok(ScanOutcome::Ignored(rejection)),
        };
        self.process(ticket, action, fields).await
    }

    async fn process(
        &self,
        ticket: ProcessingTicket<'_>,
        action: ScanAction,
        fields: ScanFields,
    ) -> Result<ScanOutcome, ControllerError> {
        let validation = validate_barcode(ticket.barcode());
        if !validation.is_valid {
            tracing::debug!(scanned = %validation.scanned_value, "invalid barcode");
            return Ok(ScanOutcome::Invalid(validation));
        }
        let barcode = validation.scanned_value;
        let context = self.context().ok_or(ControllerError::NoContext)?;

        let item_details = match self.lookup(&barcode, &context).await {
            Lookup::Found(details) => Some(details),
            Lookup::Unverified => None,
            Lookup::NotFound => {
                tracing::info!(%barcode, "barcode not found in inventory");
                return Ok(ScanOutcome::NotFound { barcode });
            }
        };

        let fields = fields.normalized();
        let update = lock_session(&self.session).add_or_update(NewScan {
            barcode: barcode.clone(),
            action,
            fields: fields.clone(),
            offline: self.connectivity.is_offline(),
            item_details,
            captured_at: self.clock.now(),
        });

        let outcome = match update {
            SessionUpdate::Duplicate { existing, count } => {
                return Ok(ScanOutcome::Duplicate { entry: existing, count });
            }
            SessionUpdate::Added(entry) => {
                let delivery = self.deliver(&entry, &context).await?;
                ScanOutcome::Recorded {
                    entry: self.current(&entry.id).unwrap_or(entry),
                    delivery,
                }
            }
            SessionUpdate::Switched {
                previous_action,
                entry,
            } => {
                let delivery = self.deliver(&entry, &context).await?;
                ScanOutcome::Switched {
                    previous_action,
                    entry: self.current(&entry.id).unwrap_or(entry),
                    delivery,
                }
            }
        };

        self.learn(&barcode, &fields).await;
        drop(ticket);
        Ok(outcome)
    }

    fn current(&self, id: &str) -> Option<ScanResult> {
        lock_session(&self.session)
            .entries()
            .iter()
            .find(|e| e.id == id)
            .cloned()
    }

    async fn lookup(&self, barcode: &str, context: &ScanContext) -> Lookup {
        let org = context.organization_id;
        if !self.connectivity.is_offline() {
            match self.backend.find_bottle(barcode, org).await {
                Ok(Some(record)) => return Lookup::Found(ItemDetails::from(&record)),
                Ok(None) => return Lookup::NotFound,
                Err(err) => {
                    tracing::warn!(%barcode, error = %err, "bottle lookup failed; using cached data");
                    if err.is_transient() {
                        self.connectivity.set_offline();
                    }
                }
            }
        }

        match self.reference.snapshot(org).await {
            Ok(Some(snapshot)) => match snapshot.find_bottle(barcode) {
                Some(record) => Lookup::Found(ItemDetails::from(record)),
                None => Lookup::NotFound,
            },
            Ok(None) => Lookup::Unverified,
            Err(err) => {
                tracing::warn!(error = %err, "reference snapshot unreadable");
                Lookup::Unverified
            }
        }
    }

    /// Write a fresh session entry straight to the backend, or queue it.
    async fn deliver(&self, entry: &ScanResult, context: &ScanContext) -> Result<Delivery, ControllerError> {
        if !self.connectivity.is_offline() {
            match self.engine.sync_scan(entry, context).await {
                Ok(server_id) => {
                    lock_session(&self.session).mark_synced(&entry.id, server_id.clone());
                    return Ok(Delivery::Synced { server_id });
                }
                Err(err) => {
                    tracing::warn!(barcode = %entry.barcode, error = %err, "direct sync failed; queueing scan");
                    if err.backend_error().is_some_and(|e| e.is_transient()) {
                        self.connectivity.set_offline();
                    }
                }
            }
        }

        let payload = OperationPayload::Scan(ScanPayload::from_scan(entry, context));
        match self
            .queue
            .enqueue(payload, context.organization_id, context.user_id, self.clock.now())
            .await
        {
            Ok(operation) => Ok(Delivery::Queued(operation.id)),
            Err(err) => {
                self.stranded
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(entry.id.clone(), context.clone());
                Err(err.into())
            }
        }
    }

    async fn learn(&self, barcode: &str, fields: &ScanFields) {
        let learned = [
            (SuggestionKind::Barcode, Some(barcode)),
            (SuggestionKind::Customer, fields.customer_name.as_deref()),
            (SuggestionKind::Location, fields.location.as_deref()),
            (SuggestionKind::Note, fields.notes.as_deref()),
        ];
        for (kind, value) in learned {
            let Some(value) = value else { continue };
            if let Err(err) = self.autocomplete.add_item(kind, value, None).await {
                tracing::warn!(kind = kind.as_str(), error = %err, "failed to record suggestion");
            }
        }
    }

    /// Queue a non-scan mutation for the next sync pass.
    pub async fn record_update(&self, payload: OperationPayload) -> Result<OperationId, ControllerError> {
        let context = self.context().ok_or(ControllerError::NoContext)?;
        let operation = self
            .queue
            .enqueue(payload, context.organization_id, context.user_id, self.clock.now())
            .await?;
        Ok(operation.id)
    }

    /// Remove a session entry. A synced entry also gets a best-effort
    /// backend delete; its failure is reported, not undone.
    pub async fn remove_scan(&self, index: usize) -> Result<RemovalReport, ControllerError> {
        let removed = lock_session(&self.session)
            .remove(index)
            .ok_or(ControllerError::NoSuchScan(index))?;

        if !removed.synced {
            return Ok(RemovalReport {
                removed,
                backend_deleted: None,
                error: None,
            });
        }

        let target = match removed.server_id.clone() {
            Some(id) => ScanDeletion::ById(id),
            None => {
                let Some(context) = self.context() else {
                    return Ok(RemovalReport {
                        removed,
                        backend_deleted: None,
                        error: Some(ControllerError::NoContext.to_string()),
                    });
                };
                let window = Duration::seconds(DELETE_WINDOW_SECS);
                ScanDeletion::ByWindow {
                    barcode: removed.barcode.clone(),
                    organization_id: context.organization_id,
                    from: removed.timestamp - window,
                    to: removed.timestamp + window,
                }
            }
        };

        match self.backend.delete_scans(&target).await {
            Ok(rows) => {
                tracing::info!(barcode = %removed.barcode, rows, "scan deleted from backend");
                Ok(RemovalReport {
                    removed,
                    backend_deleted: Some(rows),
                    error: None,
                })
            }
            Err(err) => {
                tracing::warn!(barcode = %removed.barcode, error = %err, "backend scan delete failed");
                Ok(RemovalReport {
                    removed,
                    backend_deleted: None,
                    error: Some(format!("Failed to delete scan from server: {err}")),
                })
            }
        }
    }

    /// Replay the offline queue now.
    pub async fn sync_offline_data(&self) -> Result<SyncReport, ControllerError> {
        self.connectivity.require_online()?;
        let _pass = self
            .sync_lock
            .try_lock()
            .map_err(|_| ControllerError::SyncInProgress)?;
        self.run_sync().await
    }

    async fn run_sync(&self) -> Result<SyncReport, ControllerError> {
        let mut report = self.engine.sync_pending(&self.queue).await;
        {
            let mut session = lock_session(&self.session);
            for scan in &report.scans {
                session.mark_synced(&scan.scan_id, scan.server_id.clone());
            }
        }
        self.sync_stranded(&mut report).await;

        self.queue.clear_synced().await?;
        self.reference.set_last_sync(self.clock.now()).await?;
        tracing::info!(synced = report.synced, failed = report.failed, "sync pass finished");
        Ok(report)
    }

    /// Write session scans whose enqueue failed. Ones that fail again stay
    /// stranded for the next pass.
    async fn sync_stranded(&self, report: &mut SyncReport) {
        let stranded = std::mem::take(&mut *self.stranded.lock().unwrap_or_else(|e| e.into_inner()));
        if stranded.is_empty() {
            return;
        }
        let queued = self.queue.pending_scan_ids().await;
        let entries: Vec<(ScanResult, ScanContext)> = {
            let session = lock_session(&self.session);
            session
                .entries()
                .iter()
                .filter(|e| !e.synced && !queued.contains(&e.id))
                .filter_map(|e| stranded.get(&e.id).map(|context| (e.clone(), context.clone())))
                .collect()
        };

        for (entry, context) in entries {
            match self.engine.sync_scan(&entry, &context).await {
                Ok(server_id) => {
                    lock_session(&self.session).mark_synced(&entry.id, server_id.clone());
                    report.synced += 1;
                    report.scans.push(SyncedScan {
                        scan_id: entry.id,
                        server_id,
                    });
                }
                Err(err) => {
                    tracing::warn!(barcode = %entry.barcode, error = %err, "stranded scan failed to sync");
                    report.failed += 1;
                    report.errors.push(format!("scan {}: {err}", entry.barcode));
                    self.stranded
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .insert(entry.id, context);
                }
            }
        }
    }

    fn has_stranded(&self) -> bool {
        !self.stranded.lock().unwrap_or_else(|e| e.into_inner()).is_empty()
    }

    /// Record a connectivity change. Going online with pending work starts
    /// one background sync pass unless one is already running.
    pub fn on_connectivity_change(
        self: &Arc<Self>,
        state: ConnectivityState,
    ) -> Option<JoinHandle<Result<SyncReport, ControllerError>>> {
        self.connectivity.set(state);
        if state != ConnectivityState::Online {
            return None;
        }
        let pass = Arc::clone(&self.sync_lock).try_lock_owned().ok()?;
        let this = Arc::clone(self);
        Some(tokio::spawn(async move {
            let _pass = pass;
            if !this.queue.has_pending().await && !this.has_stranded() {
                return Ok(SyncReport::default());
            }
            this.run_sync().await
        }))
    }

    /// Submit the session as an order. Waits for a running sync pass so no
    /// scan is written by both.
    pub async fn submit_order(&self) -> SubmissionReport {
        let _pass = self.sync_lock.lock().await;
        let context = self.context();
        self.coordinator
            .submit(&self.session, &self.queue, context.as_ref())
            .await
    }

    pub async fn preload_reference_data(&self) -> Result<PreloadSummary, ControllerError> {
        self.connectivity.require_online()?;
        let context = self.context().ok_or(ControllerError::NoContext)?;
        Ok(self
            .reference
            .preload(self.backend.as_ref(), context.organization_id, self.clock.now())
            .await?)
    }

    pub async fn reference_snapshot(&self) -> Option<ReferenceSnapshot> {
        let context = self.context()?;
        self.reference
            .snapshot(context.organization_id)
            .await
            .ok()
            .flatten()
    }

    pub async fn suggestions(&self, kind: SuggestionKind, query: &str) -> Vec<Suggestion> {
        let snapshot = self.reference_snapshot().await;
        self.autocomplete
            .get_suggestions(kind, query, self.config.suggestion_limit, snapshot.as_ref())
            .await
    }

    pub fn autocomplete(&self) -> &AutoCompleteCache {
        &self.autocomplete
    }

    pub async fn sync_status(&self) -> SyncStatus {
        SyncStatus {
            connectivity: self.connectivity.state(),
            queue: self.queue.stats().await,
            last_sync: self.reference.last_sync().await,
            syncing: self.sync_lock.try_lock().is_err(),
        }
    }

    /// Drop the session's scans, e.g. after a confirmed submission.
    pub fn clear_session(&self) {
        lock_session(&self.session).clear();
    }
}

enum Lookup {
    Found(ItemDetails),
    /// Offline with no cached data to check against.
    Unverified,
    NotFound,
}
