//! In-memory scan session: one entry per barcode, newest first.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::types::{ItemDetails, ScanAction, ScanFields, ScanResult};

/// What `add_or_update` did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionUpdate {
    /// A new entry was prepended.
    Added(ScanResult),
    /// Existing entry moved to the head with a different action.
    Switched {
        previous_action: ScanAction,
        entry: ScanResult,
    },
    /// Same barcode and action already present. Nothing changed.
    Duplicate { existing: ScanResult, count: u32 },
}

impl SessionUpdate {
    pub fn entry(&self) -> &ScanResult {
        match self {
            SessionUpdate::Added(entry) => entry,
            SessionUpdate::Switched { entry, .. } => entry,
            SessionUpdate::Duplicate { existing, .. } => existing,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub scans: usize,
    pub duplicates: u32,
    pub per_action: BTreeMap<ScanAction, usize>,
}

/// A new scan to record.
#[derive(Debug, Clone)]
pub struct NewScan {
    pub barcode: String,
    pub action: ScanAction,
    pub fields: ScanFields,
    pub offline: bool,
    pub item_details: Option<ItemDetails>,
    pub captured_at: DateTime<Utc>,
}

/// Session shared between the controller and the submission coordinator.
///
/// Never hold the guard across an `.await`.
pub type SharedSession = Arc<Mutex<ScanSessionStore>>;

pub fn lock_session(session: &SharedSession) -> MutexGuard<'_, ScanSessionStore> {
    session.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Debug, Default)]
pub struct ScanSessionStore {
    entries: Vec<ScanResult>,
    duplicates: BTreeMap<String, u32>,
}

impl ScanSessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Entries, newest first.
    pub fn entries(&self) -> &[ScanResult] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn find(&self, barcode: &str) -> Option<&ScanResult> {
        let barcode = barcode.trim();
        self.entries.iter().find(|e| e.barcode == barcode)
    }

    /// Barcodes in session order.
    pub fn barcodes(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.barcode.clone()).collect()
    }

    pub fn add_or_update(&mut self, scan: NewScan) -> SessionUpdate {
        let barcode = scan.barcode.trim().to_string();
        let fields = scan.fields.normalized();

        let Some(position) = self.entries.iter().position(|e| e.barcode == barcode) else {
            let entry = ScanResult {
                id: new_scan_id(),
                barcode,
                timestamp: scan.captured_at,
                action: scan.action,
                customer_name: fields.customer_name,
                location: fields.location,
                notes: fields.notes,
                synced: false,
                offline: scan.offline,
                item_details: scan.item_details,
                submitted: false,
                server_id: None,
            };
            self.entries.insert(0, entry.clone());
            return SessionUpdate::Added(entry);
        };

        if self.entries[position].action == scan.action {
            let count = self.duplicates.entry(barcode).or_insert(0);
            *count += 1;
            tracing::debug!(barcode = %self.entries[position].barcode, count = *count, "duplicate scan in session");
            return SessionUpdate::Duplicate {
                existing: self.entries[position].clone(),
                count: *count,
            };
        }

        let mut entry = self.entries.remove(position);
        let previous_action = entry.action;
        entry.id = new_scan_id();
        entry.timestamp = scan.captured_at;
        entry.action = scan.action;
        entry.synced = false;
        entry.submitted = false;
        entry.server_id = None;
        entry.offline = scan.offline;
        if fields.customer_name.is_some() {
            entry.customer_name = fields.customer_name;
        }
        if fields.location.is_some() {
            entry.location = fields.location;
        }
        if fields.notes.is_some() {
            entry.notes = fields.notes;
        }
        if scan.item_details.is_some() {
            entry.item_details = scan.item_details;
        }
        self.entries.insert(0, entry.clone());
        tracing::debug!(barcode = %entry.barcode, from = %previous_action, to = %entry.action, "scan action switched");
        SessionUpdate::Switched {
            previous_action,
            entry,
        }
    }

    /// Remove the entry at `index` (0 = newest).
    pub fn remove(&mut self, index: usize) -> Option<ScanResult> {
        if index >= self.entries.len() {
            return None;
        }
        let removed = self.entries.remove(index);
        if let Some(count) = self.duplicates.get_mut(&removed.barcode) {
            *count -= 1;
            if *count == 0 {
                self.duplicates.remove(&removed.barcode);
            }
        }
        Some(removed)
    }

    /// Bulk form of [`Self::mark_synced`] for a pass that wrote every entry.
    pub fn mark_all_synced(&mut self) {
        for entry in &mut self.entries {
            entry.synced = true;
            entry.offline = false;
        }
    }

    /// Mark one entry synced. Returns false if `id` is no longer in the session.
    pub fn mark_synced(&mut self, id: &str, server_id: Option<String>) -> bool {
        match self.entries.iter_mut().find(|e| e.id == id) {
            Some(entry) => {
                entry.synced = true;
                entry.offline = false;
                if server_id.is_some() {
                    entry.server_id = server_id;
                }
                true
            }
            None => false,
        }
    }

    pub fn mark_all_submitted(&mut self) {
        for entry in &mut self.entries {
            entry.submitted = true;
        }
    }

    /// Entries not yet written to the backend, oldest first.
    pub fn unsynced(&self) -> Vec<ScanResult> {
        self.entries.iter().rev().filter(|e| !e.synced).cloned().collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.duplicates.clear();
    }

    pub fn stats(&self) -> SessionStats {
        let mut per_action = BTreeMap::new();
        for entry in &self.entries {
            *per_action.entry(entry.action).or_insert(0) += 1;
        }
        SessionStats {
            scans: self.entries.len(),
            duplicates: self.duplicates.values().sum(),
            per_action,
        }
    }
}

fn new_scan_id() -> String {
    Uuid::now_v7().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-02T08:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn scan(barcode: &str, action: ScanAction, at: DateTime<Utc>) -> NewScan {
        NewScan {
            barcode: barcode.to_string(),
            action,
            fields: ScanFields::default(),
            offline: false,
            item_details: None,
            captured_at: at,
        }
    }

    #[test]
    fn new_barcodes_are_prepended() {
        let mut store = ScanSessionStore::new();
        store.add_or_update(scan("111111111", ScanAction::Out, t0()));
        store.add_or_update(scan("222222222", ScanAction::Out, t0()));
        assert_eq!(store.barcodes(), vec!["222222222", "111111111"]);
    }

    #[test]
    fn same_action_twice_is_a_duplicate() {
        let mut store = ScanSessionStore::new();
        store.add_or_update(scan("123456789", ScanAction::Out, t0()));
        let update = store.add_or_update(scan("123456789", ScanAction::Out, t0() + Duration::seconds(5)));

        assert!(matches!(update, SessionUpdate::Duplicate { count: 1, .. }));
        assert_eq!(store.len(), 1);
        assert_eq!(store.entries()[0].timestamp, t0());
        assert_eq!(store.stats().duplicates, 1);
    }

    #[test]
    fn action_switch_replaces_in_place() {
        let mut store = ScanSessionStore::new();
        let first = store.add_or_update(scan("123456789", ScanAction::Out, t0()));
        store.add_or_update(scan("222222222", ScanAction::Fill, t0()));
        store.mark_all_synced();

        let later = t0() + Duration::seconds(30);
        let update = store.add_or_update(scan("123456789", ScanAction::In, later));
        let SessionUpdate::Switched {
            previous_action,
            entry,
        } = update
        else {
            panic!("expected switch, got {update:?}");
        };

        assert_eq!(previous_action, ScanAction::Out);
        assert_eq!(entry.action, ScanAction::In);
        assert_ne!(entry.id, first.entry().id);
        assert_eq!(entry.timestamp, later);
        assert!(!entry.synced);
        assert_eq!(store.len(), 2);
        assert_eq!(store.entries()[0].barcode, "123456789");
    }

    #[test]
    fn fields_are_trimmed_on_insert() {
        let mut store = ScanSessionStore::new();
        let mut new = scan(" 123456789 ", ScanAction::Locate, t0());
        new.fields.location = Some("  Dock 4 ".into());
        new.fields.notes = Some("   ".into());
        let update = store.add_or_update(new);
        assert_eq!(update.entry().barcode, "123456789");
        assert_eq!(update.entry().location.as_deref(), Some("Dock 4"));
        assert_eq!(update.entry().notes, None);
    }

    #[test]
    fn remove_by_index_and_out_of_range() {
        let mut store = ScanSessionStore::new();
        store.add_or_update(scan("111111111", ScanAction::Out, t0()));
        store.add_or_update(scan("222222222", ScanAction::Out, t0()));
        let removed = store.remove(0).unwrap();
        assert_eq!(removed.barcode, "222222222");
        assert!(store.remove(5).is_none());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn removing_a_rescanned_entry_takes_back_one_duplicate() {
        let mut store = ScanSessionStore::new();
        store.add_or_update(scan("111111111", ScanAction::Out, t0()));
        store.add_or_update(scan("111111111", ScanAction::Out, t0()));
        store.add_or_update(scan("111111111", ScanAction::Out, t0()));
        store.add_or_update(scan("222222222", ScanAction::Out, t0()));
        store.add_or_update(scan("222222222", ScanAction::Out, t0()));
        assert_eq!(store.stats().duplicates, 3);

        let index = store.entries().iter().position(|e| e.barcode == "111111111").unwrap();
        store.remove(index);
        assert_eq!(store.stats().duplicates, 2);

        store.remove(0);
        assert_eq!(store.stats().duplicates, 1);
        assert!(store.is_empty());
    }

    #[test]
    fn mark_synced_records_server_id() {
        let mut store = ScanSessionStore::new();
        let id = store
            .add_or_update(scan("123456789", ScanAction::Out, t0()))
            .entry()
            .id
            .clone();
        assert!(store.mark_synced(&id, Some("row-9".into())));
        assert!(!store.mark_synced("missing", None));
        let entry = store.find("123456789").unwrap();
        assert!(entry.synced);
        assert_eq!(entry.server_id.as_deref(), Some("row-9"));
        assert!(store.unsynced().is_empty());
    }

    #[test]
    fn unsynced_is_oldest_first() {
        let mut store = ScanSessionStore::new();
        store.add_or_update(scan("111111111", ScanAction::Out, t0()));
        store.add_or_update(scan("222222222", ScanAction::In, t0()));
        let pending: Vec<_> = store.unsynced().into_iter().map(|e| e.barcode).collect();
        assert_eq!(pending, vec!["111111111", "222222222"]);
    }

    #[test]
    fn stats_count_per_action() {
        let mut store = ScanSessionStore::new();
        store.add_or_update(scan("111111111", ScanAction::Out, t0()));
        store.add_or_update(scan("222222222", ScanAction::Out, t0()));
        store.add_or_update(scan("333333333", ScanAction::Fill, t0()));
        let stats = store.stats();
        assert_eq!(stats.scans, 3);
        assert_eq!(stats.per_action.get(&ScanAction::Out), Some(&2));
        assert_eq!(stats.per_action.get(&ScanAction::Fill), Some(&1));

        store.mark_all_submitted();
        assert!(store.entries().iter().all(|e| e.submitted));
        store.clear();
        assert!(store.is_empty());
    }
}
