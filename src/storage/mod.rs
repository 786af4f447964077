// src/storage/mod.rs

//! Storage abstractions for sites, run state and listings.
//!
//! Two stores sit behind async traits:
//!
//! - [`SiteStore`]: one `SiteConfig` and one `SiteRunState` per `site_id`
//! - [`PropertyStore`]: `PropertyRecord`s with a unique `dedup_key`
//!
//! The unique key is enforced by the store, not by callers: `insert` of a key
//! that already exists fails with [`AppError::DuplicateKey`], which is what
//! keeps concurrent upserts of the same listing from producing duplicates.
//! Rows carry a `revision`; `update` is a compare-and-swap on it, so harvest,
//! enrichment and link checks can write the same row without losing fields.
//!
//! ## Local Layout
//!
//! ```text
//! {root}/
//! ├── sites.json            # Site configurations (write-through)
//! ├── run_state.json        # Per-site run bookkeeping (write-through)
//! └── properties.json       # Listings (persisted on flush)
//! ```

pub mod local;
pub mod memory;

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{AppError, Result};
use crate::models::{PropertyRecord, SiteConfig, SiteRegistry, SiteRunState};

// Re-export for convenience
pub use local::LocalStorage;
pub use memory::MemoryStore;

/// Geocoding outcome written back to a record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GeocodeUpdate {
    Located { latitude: f64, longitude: f64 },
    Failed,
    Skipped,
}

/// Site configuration and run-state persistence.
#[async_trait]
pub trait SiteStore: Send + Sync {
    async fn list_sites(&self) -> Result<Vec<SiteConfig>>;

    async fn get_site(&self, site_id: &str) -> Result<Option<SiteConfig>>;

    /// Insert or replace a site configuration.
    async fn save_site(&self, site: &SiteConfig) -> Result<()>;

    async fn get_run_state(&self, site_id: &str) -> Result<Option<SiteRunState>>;

    /// Insert or replace a run state.
    async fn save_run_state(&self, state: &SiteRunState) -> Result<()>;

    async fn list_run_states(&self) -> Result<Vec<SiteRunState>>;
}

/// Listing persistence with a unique `dedup_key`.
#[async_trait]
pub trait PropertyStore: Send + Sync {
    async fn get(&self, dedup_key: &str) -> Result<Option<PropertyRecord>>;

    /// Insert a new record; fails with `DuplicateKey` if the key exists.
    async fn insert(&self, record: PropertyRecord) -> Result<()>;

    /// Replace an existing record if its `revision` still matches the stored
    /// one; fails with `Conflict` otherwise and `NotFound` if the key is
    /// absent. Every successful write bumps the stored revision.
    async fn update(&self, record: PropertyRecord) -> Result<()>;

    /// Deactivate a record. Returns `false` if it was already inactive.
    async fn deactivate(&self, dedup_key: &str, at: DateTime<Utc>) -> Result<bool>;

    async fn active_for_site(&self, auctioneer_id: &str) -> Result<Vec<PropertyRecord>>;

    async fn count_active(&self, auctioneer_id: Option<&str>) -> Result<usize>;

    /// Geocoding backlog ordered by attempts then `updated_at`.
    async fn geocode_candidates(
        &self,
        limit: usize,
        max_attempts: u32,
        exclude: &HashSet<String>,
    ) -> Result<Vec<PropertyRecord>>;

    async fn record_geocode(
        &self,
        dedup_key: &str,
        update: GeocodeUpdate,
        at: DateTime<Utc>,
    ) -> Result<()>;

    /// Active records whose link was checked least recently.
    async fn link_check_candidates(&self, limit: usize) -> Result<Vec<PropertyRecord>>;

    async fn mark_checked(&self, dedup_key: &str, at: DateTime<Utc>) -> Result<()>;

    async fn all(&self) -> Result<Vec<PropertyRecord>>;
}

/// Import registry sites that the store does not know yet.
///
/// Stored copies win: they carry discovery results and auto-fix changes.
pub async fn seed_sites(store: &dyn SiteStore, registry: &SiteRegistry) -> Result<usize> {
    let mut added = 0;
    for site in &registry.sites {
        if store.get_site(&site.site_id).await?.is_none() {
            store.save_site(site).await?;
            added += 1;
        }
    }
    if added > 0 {
        log::info!("Seeded {} new site(s) from registry", added);
    }
    Ok(added)
}

/// Map a missing record onto the store's error type.
pub(crate) fn not_found(dedup_key: &str) -> AppError {
    AppError::NotFound(format!("property {dedup_key}"))
}
