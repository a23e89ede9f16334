//! `cylinder-scanner`
//!
//! **Responsibility:** Offline-capable barcode capture and sync for gas
//! cylinder field operations.
//!
//! This crate provides:
//! - Scan debouncing and barcode validation
//! - A per-order scan session with duplicate and action-switch handling
//! - A durable offline action queue replayed by the sync engine
//! - Order submission against a PostgREST-style backend
//! - Auto-complete suggestions and cached reference data for offline lookups
//!
//! The backend remains the authority. Local state is a write-ahead buffer.

pub mod autocomplete;
pub mod backend;
pub mod config;
pub mod connectivity;
pub mod controller;
pub mod debounce;
pub mod offline_queue;
pub mod reference_cache;
pub mod rest;
pub mod session;
pub mod storage;
pub mod submission;
pub mod sync_engine;
pub mod types;
pub mod validator;

pub use autocomplete::{AutoCompleteCache, Suggestion, SuggestionKind};
pub use backend::{Backend, BackendError};
pub use config::ScannerConfig;
pub use connectivity::{Connectivity, ConnectivityState};
pub use controller::{ScanOutcome, ScannerController};
pub use debounce::{Detection, ScanDebounceGuard, ScannerPhase};
pub use offline_queue::OfflineActionQueue;
pub use reference_cache::ReferenceCache;
pub use rest::PostgrestBackend;
pub use session::{ScanSessionStore, SharedSession};
pub use storage::{LocalStore, MemoryStore, SqliteStore};
pub use submission::{OrderSubmissionCoordinator, SubmissionOutcome, SubmissionReport};
pub use sync_engine::{SyncEngine, SyncReport, SyncedScan};
pub use types::{OfflineOperation, OperationPayload, ScanAction, ScanContext, ScanResult};
pub use validator::validate_barcode;
