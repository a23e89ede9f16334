//! Learned suggestions for free-text scan fields.
//!
//! Each field kind keeps its own list, capped at [`MAX_ITEMS_PER_KIND`] and
//! ordered by a frequency/recency score. Lists persist through [`LocalStore`].

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::reference_cache::ReferenceSnapshot;
use crate::storage::{read_versioned, write_versioned, LocalStore, StoreError};

pub const MAX_ITEMS_PER_KIND: usize = 100;

const LOCATION_PATTERNS: &[&str] = &[
    "WAREHOUSE",
    "OFFICE",
    "LOADING DOCK",
    "STORAGE",
    "TRUCK",
    "SASKATOON",
    "REGINA",
    "CALGARY",
    "EDMONTON",
    "VANCOUVER",
    "SHOP FLOOR",
    "CUSTOMER SITE",
    "DELIVERY ROUTE",
];

const NOTE_PATTERNS: &[&str] = &[
    "Delivered",
    "Returned",
    "Damaged",
    "Empty",
    "Full",
    "Needs inspection",
    "Ready for pickup",
    "In transit",
    "Customer requested",
    "Emergency delivery",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SuggestionKind {
    Customer,
    Location,
    Note,
    Barcode,
}

impl SuggestionKind {
    pub const ALL: [SuggestionKind; 4] = [
        SuggestionKind::Customer,
        SuggestionKind::Location,
        SuggestionKind::Note,
        SuggestionKind::Barcode,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SuggestionKind::Customer => "customer",
            SuggestionKind::Location => "location",
            SuggestionKind::Note => "note",
            SuggestionKind::Barcode => "barcode",
        }
    }

    pub fn storage_key(&self) -> &'static str {
        match self {
            SuggestionKind::Customer => "autocomplete_customers",
            SuggestionKind::Location => "autocomplete_locations",
            SuggestionKind::Note => "autocomplete_notes",
            SuggestionKind::Barcode => "autocomplete_barcodes",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoCompleteItem {
    pub id: String,
    pub value: String,
    #[serde(rename = "type")]
    pub kind: SuggestionKind,
    pub frequency: u32,
    pub last_used: DateTime<Utc>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

impl AutoCompleteItem {
    /// Ranking used for the per-kind cap.
    pub fn score(&self) -> f64 {
        f64::from(self.frequency) * 0.7 + (self.last_used.timestamp_millis() as f64 / 1_000_000.0) * 0.3
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SuggestionSource {
    Recent,
    Frequent,
    Database,
    Pattern,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Suggestion {
    pub value: String,
    pub score: u32,
    pub source: SuggestionSource,
    pub metadata: BTreeMap<String, Value>,
}

impl Suggestion {
    fn new(value: impl Into<String>, score: u32, source: SuggestionSource) -> Self {
        Self {
            value: value.into(),
            score,
            source,
            metadata: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AutoCompleteStats {
    pub customers: usize,
    pub locations: usize,
    pub notes: usize,
    pub barcodes: usize,
    pub total: usize,
}

#[derive(Debug, Default)]
struct Lists {
    initialized: bool,
    by_kind: HashMap<SuggestionKind, Vec<AutoCompleteItem>>,
}

pub struct AutoCompleteCache {
    store: Arc<dyn LocalStore>,
    lists: Mutex<Lists>,
}

impl AutoCompleteCache {
    pub fn new(store: Arc<dyn LocalStore>) -> Self {
        Self {
            store,
            lists: Mutex::new(Lists::default()),
        }
    }

    /// Load every list from the store. A list that fails to load starts empty.
    pub async fn init(&self) {
        let mut lists = self.lists.lock().await;
        self.load(&mut lists).await;
    }

    async fn load(&self, lists: &mut Lists) {
        if lists.initialized {
            return;
        }
        for kind in SuggestionKind::ALL {
            let items = match read_versioned::<Vec<AutoCompleteItem>>(self.store.as_ref(), kind.storage_key()).await {
                Ok(items) => items.unwrap_or_default(),
                Err(err) => {
                    tracing::warn!(kind = kind.as_str(), error = %err, "failed to load autocomplete list");
                    Vec::new()
                }
            };
            lists.by_kind.insert(kind, items);
        }
        lists.initialized = true;
        tracing::info!("autocomplete cache initialized");
    }

    /// Drop in-memory lists. Persisted data is untouched.
    pub async fn dispose(&self) {
        let mut lists = self.lists.lock().await;
        lists.by_kind.clear();
        lists.initialized = false;
    }

    /// Record one use of `value`. Matching is case-insensitive.
    pub async fn add_item(
        &self,
        kind: SuggestionKind,
        value: &str,
        metadata: Option<BTreeMap<String, Value>>,
    ) -> Result<(), StoreError> {
        let value = value.trim();
        if value.is_empty() {
            return Ok(());
        }

        let mut lists = self.lists.lock().await;
        self.load(&mut lists).await;
        let items = lists.by_kind.entry(kind).or_default();
        let now = Utc::now();
        let needle = value.to_lowercase();

        match items.iter_mut().find(|item| item.value.to_lowercase() == needle) {
            Some(item) => {
                item.frequency += 1;
                item.last_used = now;
                if let Some(metadata) = metadata {
                    item.metadata.extend(metadata);
                }
            }
            None => items.push(AutoCompleteItem {
                id: format!("{}_{}", kind.as_str(), Uuid::now_v7()),
                value: value.to_string(),
                kind,
                frequency: 1,
                last_used: now,
                metadata: metadata.unwrap_or_default(),
            }),
        }

        items.sort_by(|a, b| b.score().total_cmp(&a.score()));
        items.truncate(MAX_ITEMS_PER_KIND);

        write_versioned(self.store.as_ref(), kind.storage_key(), &*items).await
    }

    /// Ranked suggestions for `query`.
    ///
    /// An empty query returns every learned item of the kind, ranked. A
    /// non-empty query also draws on cached reference data and built-in
    /// patterns.
    pub async fn get_suggestions(
        &self,
        kind: SuggestionKind,
        query: &str,
        limit: usize,
        reference: Option<&ReferenceSnapshot>,
    ) -> Vec<Suggestion> {
        let query = query.trim().to_lowercase();
        let mut lists = self.lists.lock().await;
        self.load(&mut lists).await;
        let items = lists.by_kind.get(&kind).map(Vec::as_slice).unwrap_or(&[]);

        let mut candidates = local_suggestions(items, &query, Utc::now());
        if !query.is_empty() {
            candidates.truncate(limit);
            if let Some(snapshot) = reference {
                candidates.extend(reference_suggestions(kind, &query, limit, snapshot));
            }
            candidates.extend(pattern_suggestions(kind, &query, limit));
        }

        let mut ranked = dedupe_and_boost(candidates, &query);
        ranked.truncate(limit);
        ranked
    }

    /// Most recently used values first.
    pub async fn recent_items(&self, kind: SuggestionKind, limit: usize) -> Vec<String> {
        let mut items = self.items(kind).await;
        items.sort_by(|a, b| b.last_used.cmp(&a.last_used));
        items.into_iter().take(limit).map(|item| item.value).collect()
    }

    /// Most frequently used values first.
    pub async fn frequent_items(&self, kind: SuggestionKind, limit: usize) -> Vec<String> {
        let mut items = self.items(kind).await;
        items.sort_by(|a, b| b.frequency.cmp(&a.frequency));
        items.into_iter().take(limit).map(|item| item.value).collect()
    }

    async fn items(&self, kind: SuggestionKind) -> Vec<AutoCompleteItem> {
        let mut lists = self.lists.lock().await;
        self.load(&mut lists).await;
        lists.by_kind.get(&kind).cloned().unwrap_or_default()
    }

    pub async fn clear_all(&self) -> Result<(), StoreError> {
        let mut lists = self.lists.lock().await;
        for kind in SuggestionKind::ALL {
            self.store.remove(kind.storage_key()).await?;
            lists.by_kind.insert(kind, Vec::new());
        }
        tracing::info!("autocomplete data cleared");
        Ok(())
    }

    pub async fn stats(&self) -> AutoCompleteStats {
        let lists = self.lists.lock().await;
        let count = |kind: SuggestionKind| lists.by_kind.get(&kind).map_or(0, Vec::len);
        let customers = count(SuggestionKind::Customer);
        let locations = count(SuggestionKind::Location);
        let notes = count(SuggestionKind::Note);
        let barcodes = count(SuggestionKind::Barcode);
        AutoCompleteStats {
            customers,
            locations,
            notes,
            barcodes,
            total: customers + locations + notes + barcodes,
        }
    }
}

fn local_suggestions(items: &[AutoCompleteItem], query: &str, now: DateTime<Utc>) -> Vec<Suggestion> {
    let day_ago = now - Duration::days(1);
    items
        .iter()
        .filter_map(|item| {
            let value = item.value.to_lowercase();
            let recent = item.last_used > day_ago;
            let score = if !query.is_empty() && value == query {
                100
            } else if value.starts_with(query) {
                80 + item.frequency * 2 + if recent { 10 } else { 0 }
            } else if value.contains(query) {
                60 + item.frequency + if recent { 5 } else { 0 }
            } else {
                return None;
            };
            let source = if item.frequency > 5 {
                SuggestionSource::Frequent
            } else {
                SuggestionSource::Recent
            };
            Some(Suggestion {
                value: item.value.clone(),
                score,
                source,
                metadata: item.metadata.clone(),
            })
        })
        .collect()
}

fn reference_suggestions(
    kind: SuggestionKind,
    query: &str,
    limit: usize,
    snapshot: &ReferenceSnapshot,
) -> Vec<Suggestion> {
    let matches = |value: &str| value.to_lowercase().contains(query);
    match kind {
        SuggestionKind::Customer => snapshot
            .customers
            .iter()
            .filter(|c| matches(&c.name))
            .take(limit)
            .map(|c| {
                let mut suggestion = Suggestion::new(c.name.clone(), 70, SuggestionSource::Database);
                if let Some(customer_type) = &c.customer_type {
                    suggestion
                        .metadata
                        .insert("customer_type".into(), Value::String(customer_type.clone()));
                }
                suggestion
            })
            .collect(),
        SuggestionKind::Location => {
            let mut seen = HashSet::new();
            snapshot
                .bottles
                .iter()
                .filter_map(|b| b.location.as_deref())
                .filter(|location| matches(location) && seen.insert(location.to_string()))
                .take(limit)
                .map(|location| Suggestion::new(location, 65, SuggestionSource::Database))
                .collect()
        }
        SuggestionKind::Barcode => snapshot
            .bottles
            .iter()
            .filter(|b| matches(&b.barcode_number))
            .take(limit)
            .map(|b| Suggestion::new(b.barcode_number.clone(), 75, SuggestionSource::Database))
            .collect(),
        SuggestionKind::Note => Vec::new(),
    }
}

fn pattern_suggestions(kind: SuggestionKind, query: &str, limit: usize) -> Vec<Suggestion> {
    let from = |patterns: &[&str], score| -> Vec<Suggestion> {
        patterns
            .iter()
            .filter(|p| {
                let lower = p.to_lowercase();
                lower.contains(query) && lower != query
            })
            .take(limit)
            .map(|p| Suggestion::new(*p, score, SuggestionSource::Pattern))
            .collect()
    };
    match kind {
        SuggestionKind::Location => from(LOCATION_PATTERNS, 40),
        SuggestionKind::Note => from(NOTE_PATTERNS, 35),
        SuggestionKind::Customer | SuggestionKind::Barcode => Vec::new(),
    }
}

/// First occurrence of each value wins; exact and prefix matches get a boost.
fn dedupe_and_boost(candidates: Vec<Suggestion>, query: &str) -> Vec<Suggestion> {
    let mut seen = HashSet::new();
    let mut unique: Vec<Suggestion> = candidates
        .into_iter()
        .filter(|s| seen.insert(s.value.to_lowercase()))
        .map(|mut s| {
            let key = s.value.to_lowercase();
            if !query.is_empty() && key == query {
                s.score += 20;
            } else if key.starts_with(query) {
                s.score += 10;
            }
            s
        })
        .collect();
    unique.sort_by(|a, b| b.score.cmp(&a.score));
    unique
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    fn cache() -> (Arc<MemoryStore>, AutoCompleteCache) {
        let store = Arc::new(MemoryStore::new());
        let cache = AutoCompleteCache::new(store.clone());
        (store, cache)
    }

    #[tokio::test]
    async fn frequent_value_ranks_first_for_empty_query() {
        let (_, cache) = cache();
        cache.init().await;
        for _ in 0..5 {
            cache.add_item(SuggestionKind::Location, "WAREHOUSE", None).await.unwrap();
        }
        cache.add_item(SuggestionKind::Location, "DOCK", None).await.unwrap();

        let suggestions = cache.get_suggestions(SuggestionKind::Location, "", 10, None).await;
        let values: Vec<_> = suggestions.iter().map(|s| s.value.as_str()).collect();
        assert_eq!(values, vec!["WAREHOUSE", "DOCK"]);
    }

    #[tokio::test]
    async fn matching_is_case_insensitive_and_merges_metadata() {
        let (_, cache) = cache();
        let mut first = BTreeMap::new();
        first.insert("customer_type".to_string(), Value::from("industrial"));
        cache
            .add_item(SuggestionKind::Customer, "Acme Welding", Some(first))
            .await
            .unwrap();
        let mut second = BTreeMap::new();
        second.insert("category".to_string(), Value::from("key account"));
        cache
            .add_item(SuggestionKind::Customer, "acme welding", Some(second))
            .await
            .unwrap();

        let stats = cache.stats().await;
        assert_eq!(stats.customers, 1);

        let suggestions = cache.get_suggestions(SuggestionKind::Customer, "acme", 5, None).await;
        assert_eq!(suggestions[0].value, "Acme Welding");
        assert_eq!(suggestions[0].metadata.len(), 2);
    }

    #[tokio::test]
    async fn exact_match_beats_prefix_and_contains() {
        let (_, cache) = cache();
        for value in ["dock", "dock 4", "east dock"] {
            cache.add_item(SuggestionKind::Location, value, None).await.unwrap();
        }
        let suggestions = cache.get_suggestions(SuggestionKind::Location, "dock", 10, None).await;
        assert_eq!(suggestions[0].value, "dock");
        assert_eq!(suggestions[0].score, 120);
        assert_eq!(suggestions[1].value, "dock 4");
        // "LOADING DOCK" comes from built-in patterns.
        assert!(suggestions.iter().any(|s| s.value == "LOADING DOCK" && s.source == SuggestionSource::Pattern));
    }

    #[tokio::test]
    async fn reference_data_contributes_customer_names() {
        let (_, cache) = cache();
        let snapshot: ReferenceSnapshot = serde_json::from_value(serde_json::json!({
            "bottles": [],
            "customers": [{ "id": "c1", "name": "Prairie Gas Co", "customer_type": "retail" }],
            "rentals": [],
            "last_sync": "2026-03-02T08:00:00Z",
            "organization_id": "0190f1a2-0000-7000-8000-000000000001"
        }))
        .unwrap();

        let suggestions = cache
            .get_suggestions(SuggestionKind::Customer, "prairie", 5, Some(&snapshot))
            .await;
        assert_eq!(suggestions.len(), 1);
        assert_eq!(suggestions[0].source, SuggestionSource::Database);
        assert_eq!(suggestions[0].score, 80);
    }

    #[tokio::test]
    async fn lists_survive_reinit_and_clear_all_wipes_them() {
        let (store, cache) = cache();
        cache.add_item(SuggestionKind::Note, "Damaged valve", None).await.unwrap();
        cache.dispose().await;

        let reopened = AutoCompleteCache::new(store.clone());
        reopened.init().await;
        assert_eq!(reopened.recent_items(SuggestionKind::Note, 5).await, vec!["Damaged valve"]);

        reopened.clear_all().await.unwrap();
        assert_eq!(reopened.stats().await.total, 0);
        assert!(store.get("autocomplete_notes").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_is_capped_per_kind() {
        let (_, cache) = cache();
        for i in 0..(MAX_ITEMS_PER_KIND + 5) {
            cache
                .add_item(SuggestionKind::Barcode, &format!("{i:09}"), None)
                .await
                .unwrap();
        }
        assert_eq!(cache.stats().await.barcodes, MAX_ITEMS_PER_KIND);
    }

    #[tokio::test]
    async fn blank_values_are_ignored() {
        let (_, cache) = cache();
        cache.add_item(SuggestionKind::Location, "   ", None).await.unwrap();
        assert_eq!(cache.stats().await.total, 0);
        assert_eq!(cache.frequent_items(SuggestionKind::Location, 5).await, Vec::<String>::new());
    }
}
