// src/pipeline/dedup.rs

//! Deduplication keys and the upsert step.
//!
//! A listing's identity is `sha256(salt:auctioneer_id:source_url)`, so the
//! same listing maps to the same key regardless of page order or overlap.
//! The store's unique key index is the final authority under concurrency: a
//! lost insert race turns into an update, and an update that lost to another
//! writer is merged again onto the newer row.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::{AppError, Result};
use crate::models::{GeocodeStatus, PropertyRecord, RawRecord, SiteConfig};
use crate::storage::PropertyStore;
use crate::utils::text::{clean_text, non_empty, normalize_state};

/// Merge retries before a contended key is reported as a conflict.
const MAX_WRITE_ATTEMPTS: usize = 10;

/// Deterministic identity of a listing.
pub fn dedup_key(salt: &str, auctioneer_id: &str, source_url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(b":");
    hasher.update(auctioneer_id.as_bytes());
    hasher.update(b":");
    hasher.update(source_url.trim().as_bytes());
    hex::encode(hasher.finalize())
}

/// Counts of one upsert batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UpsertStats {
    pub new: usize,
    pub updated: usize,
    /// Repeated keys within the batch
    pub skipped: usize,
}

impl UpsertStats {
    pub fn merge(&mut self, other: &UpsertStats) {
        self.new += other.new;
        self.updated += other.updated;
        self.skipped += other.skipped;
    }
}

/// Outcome of upserting one site's harvest.
#[derive(Debug, Default)]
pub struct UpsertReport {
    pub stats: UpsertStats,
    /// Keys seen in this harvest
    pub seen_keys: HashSet<String>,
}

/// Writes normalized records into the property store.
pub struct Upserter {
    store: Arc<dyn PropertyStore>,
    salt: String,
}

impl Upserter {
    pub fn new(store: Arc<dyn PropertyStore>, salt: impl Into<String>) -> Self {
        Self {
            store,
            salt: salt.into(),
        }
    }

    pub fn key_for(&self, site_id: &str, source_url: &str) -> String {
        dedup_key(&self.salt, site_id, source_url)
    }

    /// Canonical record for a raw listing seen at `at`.
    pub fn normalize(&self, site: &SiteConfig, raw: &RawRecord, at: DateTime<Utc>) -> PropertyRecord {
        let source_url = raw.source_url.trim().to_string();
        let clean = |v: &Option<String>| v.as_deref().and_then(non_empty);

        PropertyRecord {
            id: uuid::Uuid::new_v4().to_string(),
            dedup_key: self.key_for(&site.site_id, &source_url),
            source_url,
            auctioneer_id: site.site_id.clone(),
            auctioneer_name: site.name.clone(),
            title: clean(&raw.title),
            category: raw.category.as_deref().map(clean_text).and_then(|c| non_empty(&c.to_lowercase())),
            address: clean(&raw.address),
            neighborhood: clean(&raw.neighborhood),
            city: clean(&raw.city),
            state: raw.state.as_deref().and_then(normalize_state),
            first_auction_value: raw.first_auction_value,
            second_auction_value: raw.second_auction_value,
            evaluation_value: raw.evaluation_value,
            image_url: raw.image_urls.first().cloned(),
            latitude: None,
            longitude: None,
            geocode_status: GeocodeStatus::Pending,
            geocode_attempts: 0,
            is_active: true,
            created_at: at,
            updated_at: at,
            deactivated_at: None,
            last_seen_at: at,
            last_checked_at: None,
            revision: 0,
        }
    }

    /// Insert new listings, update known ones, skip repeats within the batch.
    pub async fn upsert_batch(
        &self,
        site: &SiteConfig,
        records: &[RawRecord],
        at: DateTime<Utc>,
    ) -> Result<UpsertReport> {
        let mut report = UpsertReport::default();

        for raw in records {
            let fresh = self.normalize(site, raw, at);
            if !report.seen_keys.insert(fresh.dedup_key.clone()) {
                report.stats.skipped += 1;
                continue;
            }

            if self.write(fresh, at).await? {
                report.stats.new += 1;
            } else {
                report.stats.updated += 1;
            }
        }

        log::debug!(
            "{}: upserted {} new, {} updated, {} skipped",
            site.site_id,
            report.stats.new,
            report.stats.updated,
            report.stats.skipped
        );
        Ok(report)
    }

    /// Insert or merge one record; returns `true` when it was new.
    ///
    /// Updates are conditional on the revision read, so a geocode write-back
    /// or deactivation landing between read and write is merged, not lost.
    async fn write(&self, fresh: PropertyRecord, at: DateTime<Utc>) -> Result<bool> {
        for _ in 0..MAX_WRITE_ATTEMPTS {
            match self.store.get(&fresh.dedup_key).await? {
                Some(existing) => match self.store.update(merge(existing, fresh.clone(), at)).await {
                    Ok(()) => return Ok(false),
                    Err(AppError::Conflict(key)) => {
                        log::debug!("Concurrent write to {}, merging again", key);
                    }
                    Err(e) => return Err(e),
                },
                None => match self.store.insert(fresh.clone()).await {
                    Ok(()) => return Ok(true),
                    // Another worker inserted it first.
                    Err(AppError::DuplicateKey(_)) => {}
                    Err(e) => return Err(e),
                },
            }
        }
        Err(AppError::Conflict(fresh.dedup_key))
    }
}

/// Apply a fresh scrape onto the stored record.
///
/// Identity and creation time are kept; scraped fields are refreshed when
/// present. An inactive record is reactivated. A location change drops the
/// coordinates so enrichment picks the record up again.
fn merge(mut existing: PropertyRecord, fresh: PropertyRecord, at: DateTime<Utc>) -> PropertyRecord {
    fn refresh<T>(slot: &mut Option<T>, value: Option<T>) {
        if value.is_some() {
            *slot = value;
        }
    }

    let old_location = (
        existing.address.clone(),
        existing.city.clone(),
        existing.state.clone(),
    );

    existing.auctioneer_name = fresh.auctioneer_name;
    refresh(&mut existing.title, fresh.title);
    refresh(&mut existing.category, fresh.category);
    refresh(&mut existing.address, fresh.address);
    refresh(&mut existing.neighborhood, fresh.neighborhood);
    refresh(&mut existing.city, fresh.city);
    refresh(&mut existing.state, fresh.state);
    refresh(&mut existing.first_auction_value, fresh.first_auction_value);
    refresh(&mut existing.second_auction_value, fresh.second_auction_value);
    refresh(&mut existing.evaluation_value, fresh.evaluation_value);
    refresh(&mut existing.image_url, fresh.image_url);

    let location_changed = {
        let (address, city, state) = existing.location_key();
        (address, city, state)
            != (
                old_location.0.as_deref(),
                old_location.1.as_deref(),
                old_location.2.as_deref(),
            )
    };
    if location_changed {
        existing.latitude = None;
        existing.longitude = None;
        existing.geocode_status = GeocodeStatus::Pending;
        existing.geocode_attempts = 0;
    }

    if !existing.is_active {
        log::debug!("Reactivating {}", existing.source_url);
        existing.is_active = true;
        existing.deactivated_at = None;
    }

    existing.updated_at = at;
    existing.last_seen_at = at;
    existing
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use chrono::Duration;

    use super::*;
    use crate::storage::{GeocodeUpdate, MemoryStore};

    /// Store that lets the geocoder write a record right after the first read.
    struct GeocodeAfterRead {
        inner: MemoryStore,
        fired: AtomicBool,
    }

    #[async_trait]
    impl PropertyStore for GeocodeAfterRead {
        async fn get(&self, dedup_key: &str) -> Result<Option<PropertyRecord>> {
            let record = self.inner.get(dedup_key).await?;
            if record.is_some() && !self.fired.swap(true, Ordering::SeqCst) {
                let located = GeocodeUpdate::Located {
                    latitude: -23.96,
                    longitude: -46.33,
                };
                self.inner.record_geocode(dedup_key, located, Utc::now()).await?;
            }
            Ok(record)
        }

        async fn insert(&self, record: PropertyRecord) -> Result<()> {
            self.inner.insert(record).await
        }

        async fn update(&self, record: PropertyRecord) -> Result<()> {
            self.inner.update(record).await
        }

        async fn deactivate(&self, dedup_key: &str, at: DateTime<Utc>) -> Result<bool> {
            self.inner.deactivate(dedup_key, at).await
        }

        async fn active_for_site(&self, auctioneer_id: &str) -> Result<Vec<PropertyRecord>> {
            self.inner.active_for_site(auctioneer_id).await
        }

        async fn count_active(&self, auctioneer_id: Option<&str>) -> Result<usize> {
            self.inner.count_active(auctioneer_id).await
        }

        async fn geocode_candidates(
            &self,
            limit: usize,
            max_attempts: u32,
            exclude: &HashSet<String>,
        ) -> Result<Vec<PropertyRecord>> {
            self.inner.geocode_candidates(limit, max_attempts, exclude).await
        }

        async fn record_geocode(
            &self,
            dedup_key: &str,
            update: GeocodeUpdate,
            at: DateTime<Utc>,
        ) -> Result<()> {
            self.inner.record_geocode(dedup_key, update, at).await
        }

        async fn link_check_candidates(&self, limit: usize) -> Result<Vec<PropertyRecord>> {
            self.inner.link_check_candidates(limit).await
        }

        async fn mark_checked(&self, dedup_key: &str, at: DateTime<Utc>) -> Result<()> {
            self.inner.mark_checked(dedup_key, at).await
        }

        async fn all(&self) -> Result<Vec<PropertyRecord>> {
            self.inner.all().await
        }
    }

    fn site() -> SiteConfig {
        SiteConfig::new("casa", "Casa de Leilões", "https://casa.example")
    }

    fn raw(n: u32) -> RawRecord {
        let mut r = RawRecord::new(format!("https://casa.example/lote/{n}"));
        r.title = Some(format!("  Casa   {n} "));
        r.address = Some("Rua A, 1".into());
        r.city = Some("Santos".into());
        r.state = Some("sp".into());
        r.first_auction_value = Some(100_000.0);
        r
    }

    fn upserter(store: Arc<MemoryStore>) -> Upserter {
        Upserter::new(store, "test-salt")
    }

    #[test]
    fn test_dedup_key_is_pure() {
        let a = dedup_key("s", "site", "https://x.example/lote/1");
        assert_eq!(a, dedup_key("s", "site", "https://x.example/lote/1 "));
        assert_eq!(a.len(), 64);
        assert_ne!(a, dedup_key("s", "other", "https://x.example/lote/1"));
        assert_ne!(a, dedup_key("t", "site", "https://x.example/lote/1"));
    }

    #[test]
    fn test_normalize_cleans_fields() {
        let store = Arc::new(MemoryStore::new());
        let record = upserter(store).normalize(&site(), &raw(1), Utc::now());
        assert_eq!(record.title.as_deref(), Some("Casa 1"));
        assert_eq!(record.state.as_deref(), Some("SP"));
        assert!(record.is_active);
        assert_eq!(record.auctioneer_name, "Casa de Leilões");
    }

    #[tokio::test]
    async fn test_batch_repeats_are_skipped() {
        let store = Arc::new(MemoryStore::new());
        let upserter = upserter(store.clone());

        let report = upserter
            .upsert_batch(&site(), &[raw(1), raw(2), raw(1)], Utc::now())
            .await
            .unwrap();

        assert_eq!(report.stats, UpsertStats { new: 2, updated: 0, skipped: 1 });
        assert_eq!(store.count_active(None).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_second_run_updates_not_duplicates() {
        let store = Arc::new(MemoryStore::new());
        let upserter = upserter(store.clone());
        let first = Utc::now();

        upserter.upsert_batch(&site(), &[raw(1)], first).await.unwrap();
        let mut changed = raw(1);
        changed.first_auction_value = Some(90_000.0);
        let report = upserter
            .upsert_batch(&site(), &[changed], first + Duration::hours(1))
            .await
            .unwrap();

        assert_eq!(report.stats.updated, 1);
        assert_eq!(report.stats.new, 0);
        let all = store.all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].first_auction_value, Some(90_000.0));
        assert_eq!(all[0].created_at, first);
        assert_eq!(all[0].last_seen_at, first + Duration::hours(1));
    }

    #[tokio::test]
    async fn test_reappearing_listing_is_reactivated() {
        let store = Arc::new(MemoryStore::new());
        let upserter = upserter(store.clone());
        let now = Utc::now();

        upserter.upsert_batch(&site(), &[raw(1)], now).await.unwrap();
        let key = upserter.key_for("casa", "https://casa.example/lote/1");
        store.deactivate(&key, now).await.unwrap();

        upserter.upsert_batch(&site(), &[raw(1)], now).await.unwrap();
        let record = store.get(&key).await.unwrap().unwrap();
        assert!(record.is_active);
        assert!(record.deactivated_at.is_none());
    }

    #[tokio::test]
    async fn test_location_change_resets_geocode() {
        let store = Arc::new(MemoryStore::new());
        let upserter = upserter(store.clone());
        let now = Utc::now();

        upserter.upsert_batch(&site(), &[raw(1)], now).await.unwrap();
        let key = upserter.key_for("casa", "https://casa.example/lote/1");
        let mut located = store.get(&key).await.unwrap().unwrap();
        located.latitude = Some(-23.9);
        located.longitude = Some(-46.3);
        located.geocode_status = GeocodeStatus::Success;
        store.update(located).await.unwrap();

        // Same location keeps coordinates.
        upserter.upsert_batch(&site(), &[raw(1)], now).await.unwrap();
        assert!(store.get(&key).await.unwrap().unwrap().has_coordinates());

        let mut moved = raw(1);
        moved.city = Some("Guarujá".into());
        upserter.upsert_batch(&site(), &[moved], now).await.unwrap();
        let record = store.get(&key).await.unwrap().unwrap();
        assert!(!record.has_coordinates());
        assert_eq!(record.geocode_status, GeocodeStatus::Pending);
    }

    #[tokio::test]
    async fn test_geocode_written_between_read_and_update_survives() {
        let store = Arc::new(GeocodeAfterRead {
            inner: MemoryStore::new(),
            fired: AtomicBool::new(false),
        });
        let upserter = Upserter::new(store.clone(), "test-salt");
        let now = Utc::now();

        upserter.upsert_batch(&site(), &[raw(1)], now).await.unwrap();
        let mut repriced = raw(1);
        repriced.first_auction_value = Some(95_000.0);
        let report = upserter
            .upsert_batch(&site(), &[repriced], now + Duration::hours(1))
            .await
            .unwrap();

        assert_eq!(report.stats.updated, 1);
        let key = upserter.key_for("casa", "https://casa.example/lote/1");
        let record = store.inner.get(&key).await.unwrap().unwrap();
        assert_eq!(record.latitude, Some(-23.96));
        assert_eq!(record.geocode_status, GeocodeStatus::Success);
        assert_eq!(record.first_auction_value, Some(95_000.0));
    }

    #[tokio::test]
    async fn test_concurrent_upserts_of_same_listing() {
        let store = Arc::new(MemoryStore::new());
        let upserter = Arc::new(upserter(store.clone()));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let upserter = upserter.clone();
                tokio::spawn(async move {
                    upserter
                        .upsert_batch(&site(), &[raw(7)], Utc::now())
                        .await
                        .unwrap()
                        .stats
                })
            })
            .collect();

        let mut total = UpsertStats::default();
        for handle in handles {
            total.merge(&handle.await.unwrap());
        }
        assert_eq!(total.new, 1);
        assert_eq!(total.updated, 7);
        assert_eq!(store.all().await.unwrap().len(), 1);
    }
}
