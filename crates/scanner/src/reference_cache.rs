//! Per-tenant snapshot of reference data for offline lookups.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use cylinder_core::TenantId;
use serde::{Deserialize, Serialize};

use crate::backend::{Backend, BackendError, BottleRecord, CustomerRecord, RentalRecord};
use crate::storage::{read_versioned, write_versioned, LocalStore, StoreError};

pub const LAST_SYNC_KEY: &str = "last_sync";
const SNAPSHOT_KEY_PREFIX: &str = "cached_data_";

pub const BOTTLE_PRELOAD_LIMIT: usize = 1000;
pub const CUSTOMER_PRELOAD_LIMIT: usize = 500;
pub const RENTAL_PRELOAD_LIMIT: usize = 500;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceSnapshot {
    #[serde(default)]
    pub bottles: Vec<BottleRecord>,
    #[serde(default)]
    pub customers: Vec<CustomerRecord>,
    #[serde(default)]
    pub rentals: Vec<RentalRecord>,
    pub last_sync: DateTime<Utc>,
    pub organization_id: TenantId,
}

impl ReferenceSnapshot {
    pub fn find_bottle(&self, barcode: &str) -> Option<&BottleRecord> {
        let barcode = barcode.trim();
        self.bottles.iter().find(|b| b.barcode_number == barcode)
    }
}

/// Which parts of a preload came back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PreloadSummary {
    pub bottles: usize,
    pub customers: usize,
    pub rentals: usize,
    pub failed_sources: usize,
}

pub struct ReferenceCache {
    store: Arc<dyn LocalStore>,
}

impl ReferenceCache {
    pub fn new(store: Arc<dyn LocalStore>) -> Self {
        Self { store }
    }

    fn key(organization_id: TenantId) -> String {
        format!("{SNAPSHOT_KEY_PREFIX}{organization_id}")
    }

    pub async fn snapshot(&self, organization_id: TenantId) -> Result<Option<ReferenceSnapshot>, StoreError> {
        read_versioned(self.store.as_ref(), &Self::key(organization_id)).await
    }

    /// Merge partial data into the tenant's snapshot and stamp `last_sync`.
    ///
    /// A `None` section keeps whatever was cached before.
    pub async fn store_snapshot(
        &self,
        organization_id: TenantId,
        bottles: Option<Vec<BottleRecord>>,
        customers: Option<Vec<CustomerRecord>>,
        rentals: Option<Vec<RentalRecord>>,
        now: DateTime<Utc>,
    ) -> Result<ReferenceSnapshot, StoreError> {
        let existing = self.snapshot(organization_id).await?;
        let (old_bottles, old_customers, old_rentals) = match existing {
            Some(s) => (s.bottles, s.customers, s.rentals),
            None => Default::default(),
        };
        let snapshot = ReferenceSnapshot {
            bottles: bottles.unwrap_or(old_bottles),
            customers: customers.unwrap_or(old_customers),
            rentals: rentals.unwrap_or(old_rentals),
            last_sync: now,
            organization_id,
        };
        write_versioned(self.store.as_ref(), &Self::key(organization_id), &snapshot).await?;
        tracing::info!(
            %organization_id,
            bottles = snapshot.bottles.len(),
            customers = snapshot.customers.len(),
            rentals = snapshot.rentals.len(),
            "reference data cached"
        );
        Ok(snapshot)
    }

    /// True when there is no snapshot or it is older than `max_age`.
    pub async fn is_stale(&self, organization_id: TenantId, max_age: Duration, now: DateTime<Utc>) -> bool {
        match self.snapshot(organization_id).await {
            Ok(Some(snapshot)) => now - snapshot.last_sync > max_age,
            Ok(None) => true,
            Err(err) => {
                tracing::warn!(%organization_id, error = %err, "failed to read reference snapshot");
                true
            }
        }
    }

    /// Fetch bottles, customers and active rentals concurrently and cache
    /// whatever succeeded.
    pub async fn preload(
        &self,
        backend: &dyn Backend,
        organization_id: TenantId,
        now: DateTime<Utc>,
    ) -> Result<PreloadSummary, StoreError> {
        let (bottles, customers, rentals) = tokio::join!(
            backend.fetch_bottles(organization_id, BOTTLE_PRELOAD_LIMIT),
            backend.fetch_customers(organization_id, CUSTOMER_PRELOAD_LIMIT),
            backend.fetch_active_rentals(organization_id, RENTAL_PRELOAD_LIMIT),
        );

        let mut failed_sources = 0;
        let bottles = keep_rows(&mut failed_sources, "bottles", bottles);
        let customers = keep_rows(&mut failed_sources, "customers", customers);
        let rentals = keep_rows(&mut failed_sources, "rentals", rentals);

        let snapshot = self
            .store_snapshot(organization_id, bottles, customers, rentals, now)
            .await?;
        Ok(PreloadSummary {
            bottles: snapshot.bottles.len(),
            customers: snapshot.customers.len(),
            rentals: snapshot.rentals.len(),
            failed_sources,
        })
    }

    pub async fn last_sync(&self) -> Option<DateTime<Utc>> {
        match read_versioned(self.store.as_ref(), LAST_SYNC_KEY).await {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(error = %err, "failed to read last sync time");
                None
            }
        }
    }

    pub async fn set_last_sync(&self, at: DateTime<Utc>) -> Result<(), StoreError> {
        write_versioned(self.store.as_ref(), LAST_SYNC_KEY, &at).await
    }

    /// Remove every cached snapshot and the last-sync stamp.
    pub async fn clear_all(&self) -> Result<(), StoreError> {
        for key in self.store.keys().await? {
            if key.starts_with(SNAPSHOT_KEY_PREFIX) || key == LAST_SYNC_KEY {
                self.store.remove(&key).await?;
            }
        }
        Ok(())
    }
}

fn keep_rows<T>(failed: &mut usize, source: &str, result: Result<Vec<T>, BackendError>) -> Option<Vec<T>> {
    match result {
        Ok(rows) => Some(rows),
        Err(err) => {
            *failed += 1;
            tracing::warn!(source, error = %err, "reference preload source failed");
            None
        }
    }
}
