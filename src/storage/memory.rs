// src/storage/memory.rs

//! In-memory store implementing both storage traits.

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::{GeocodeUpdate, PropertyStore, SiteStore, not_found};
use crate::error::{AppError, Result};
use crate::models::{GeocodeStatus, PropertyRecord, SiteConfig, SiteRunState};

/// Process-local store; also the cache behind [`super::LocalStorage`].
#[derive(Default)]
pub struct MemoryStore {
    sites: RwLock<BTreeMap<String, SiteConfig>>,
    run_states: RwLock<BTreeMap<String, SiteRunState>>,
    properties: RwLock<HashMap<String, PropertyRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from previously persisted tables.
    pub fn from_parts(
        sites: Vec<SiteConfig>,
        run_states: Vec<SiteRunState>,
        properties: Vec<PropertyRecord>,
    ) -> Self {
        Self {
            sites: RwLock::new(sites.into_iter().map(|s| (s.site_id.clone(), s)).collect()),
            run_states: RwLock::new(
                run_states
                    .into_iter()
                    .map(|s| (s.site_id.clone(), s))
                    .collect(),
            ),
            properties: RwLock::new(
                properties
                    .into_iter()
                    .map(|p| (p.dedup_key.clone(), p))
                    .collect(),
            ),
        }
    }

    async fn modify<F>(&self, dedup_key: &str, f: F) -> Result<()>
    where
        F: FnOnce(&mut PropertyRecord) + Send,
    {
        let mut properties = self.properties.write().await;
        let record = properties
            .get_mut(dedup_key)
            .ok_or_else(|| not_found(dedup_key))?;
        f(record);
        record.revision += 1;
        Ok(())
    }
}

#[async_trait]
impl SiteStore for MemoryStore {
    async fn list_sites(&self) -> Result<Vec<SiteConfig>> {
        Ok(self.sites.read().await.values().cloned().collect())
    }

    async fn get_site(&self, site_id: &str) -> Result<Option<SiteConfig>> {
        Ok(self.sites.read().await.get(site_id).cloned())
    }

    async fn save_site(&self, site: &SiteConfig) -> Result<()> {
        self.sites
            .write()
            .await
            .insert(site.site_id.clone(), site.clone());
        Ok(())
    }

    async fn get_run_state(&self, site_id: &str) -> Result<Option<SiteRunState>> {
        Ok(self.run_states.read().await.get(site_id).cloned())
    }

    async fn save_run_state(&self, state: &SiteRunState) -> Result<()> {
        self.run_states
            .write()
            .await
            .insert(state.site_id.clone(), state.clone());
        Ok(())
    }

    async fn list_run_states(&self) -> Result<Vec<SiteRunState>> {
        Ok(self.run_states.read().await.values().cloned().collect())
    }
}

#[async_trait]
impl PropertyStore for MemoryStore {
    async fn get(&self, dedup_key: &str) -> Result<Option<PropertyRecord>> {
        Ok(self.properties.read().await.get(dedup_key).cloned())
    }

    async fn insert(&self, record: PropertyRecord) -> Result<()> {
        let mut properties = self.properties.write().await;
        if properties.contains_key(&record.dedup_key) {
            return Err(AppError::DuplicateKey(record.dedup_key));
        }
        properties.insert(record.dedup_key.clone(), record);
        Ok(())
    }

    async fn update(&self, record: PropertyRecord) -> Result<()> {
        let mut properties = self.properties.write().await;
        match properties.get_mut(&record.dedup_key) {
            Some(existing) if existing.revision != record.revision => {
                Err(AppError::Conflict(record.dedup_key))
            }
            Some(existing) => {
                *existing = PropertyRecord {
                    revision: record.revision + 1,
                    ..record
                };
                Ok(())
            }
            None => Err(not_found(&record.dedup_key)),
        }
    }

    async fn deactivate(&self, dedup_key: &str, at: DateTime<Utc>) -> Result<bool> {
        let mut properties = self.properties.write().await;
        let record = properties
            .get_mut(dedup_key)
            .ok_or_else(|| not_found(dedup_key))?;
        let changed = record.deactivate(at);
        if changed {
            record.revision += 1;
        }
        Ok(changed)
    }

    async fn active_for_site(&self, auctioneer_id: &str) -> Result<Vec<PropertyRecord>> {
        Ok(self
            .properties
            .read()
            .await
            .values()
            .filter(|p| p.is_active && p.auctioneer_id == auctioneer_id)
            .cloned()
            .collect())
    }

    async fn count_active(&self, auctioneer_id: Option<&str>) -> Result<usize> {
        Ok(self
            .properties
            .read()
            .await
            .values()
            .filter(|p| p.is_active && auctioneer_id.is_none_or(|id| p.auctioneer_id == id))
            .count())
    }

    async fn geocode_candidates(
        &self,
        limit: usize,
        max_attempts: u32,
        exclude: &HashSet<String>,
    ) -> Result<Vec<PropertyRecord>> {
        let properties = self.properties.read().await;
        let mut candidates: Vec<&PropertyRecord> = properties
            .values()
            .filter(|p| p.is_geocode_eligible(max_attempts) && !exclude.contains(&p.dedup_key))
            .collect();
        candidates.sort_by(|a, b| {
            a.geocode_attempts
                .cmp(&b.geocode_attempts)
                .then(a.updated_at.cmp(&b.updated_at))
                .then(a.dedup_key.cmp(&b.dedup_key))
        });
        Ok(candidates.into_iter().take(limit).cloned().collect())
    }

    async fn record_geocode(
        &self,
        dedup_key: &str,
        update: GeocodeUpdate,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.modify(dedup_key, |record| match update {
            GeocodeUpdate::Located {
                latitude,
                longitude,
            } => {
                record.latitude = Some(latitude);
                record.longitude = Some(longitude);
                record.geocode_status = GeocodeStatus::Success;
                record.updated_at = at;
            }
            GeocodeUpdate::Failed => {
                record.geocode_attempts += 1;
                record.geocode_status = GeocodeStatus::Failed;
            }
            GeocodeUpdate::Skipped => {
                record.geocode_status = GeocodeStatus::Skipped;
            }
        })
        .await
    }

    async fn link_check_candidates(&self, limit: usize) -> Result<Vec<PropertyRecord>> {
        let properties = self.properties.read().await;
        let mut active: Vec<&PropertyRecord> = properties.values().filter(|p| p.is_active).collect();
        // Never-checked records first, then the oldest checks.
        active.sort_by(|a, b| {
            a.last_checked_at
                .cmp(&b.last_checked_at)
                .then(a.dedup_key.cmp(&b.dedup_key))
        });
        Ok(active.into_iter().take(limit).cloned().collect())
    }

    async fn mark_checked(&self, dedup_key: &str, at: DateTime<Utc>) -> Result<()> {
        self.modify(dedup_key, |record| record.last_checked_at = Some(at))
            .await
    }

    async fn all(&self) -> Result<Vec<PropertyRecord>> {
        let mut all: Vec<PropertyRecord> = self.properties.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.dedup_key.cmp(&b.dedup_key));
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Duration;

    use super::*;
    use crate::models::fixtures::property;

    #[tokio::test]
    async fn test_insert_rejects_duplicate_key() {
        let store = MemoryStore::new();
        store.insert(property("k1", "s")).await.unwrap();

        let err = store.insert(property("k1", "s")).await.unwrap_err();
        assert!(matches!(err, AppError::DuplicateKey(key) if key == "k1"));
    }

    #[tokio::test]
    async fn test_concurrent_inserts_keep_one_record() {
        let store = Arc::new(MemoryStore::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                tokio::spawn(async move { store.insert(property("same", "s")).await })
            })
            .collect();

        let mut ok = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                ok += 1;
            }
        }
        assert_eq!(ok, 1);
        assert_eq!(store.all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_deactivate_twice_keeps_first_timestamp() {
        let store = MemoryStore::new();
        store.insert(property("k1", "s")).await.unwrap();
        let first = Utc::now();

        assert!(store.deactivate("k1", first).await.unwrap());
        assert!(!store.deactivate("k1", first + Duration::days(1)).await.unwrap());

        let record = store.get("k1").await.unwrap().unwrap();
        assert!(!record.is_active);
        assert_eq!(record.deactivated_at, Some(first));
    }

    #[tokio::test]
    async fn test_geocode_candidates_order_and_exclusion() {
        let store = MemoryStore::new();
        let mut retried = property("a", "s");
        retried.geocode_attempts = 2;
        store.insert(retried).await.unwrap();
        store.insert(property("b", "s")).await.unwrap();
        store.insert(property("c", "s")).await.unwrap();
        let mut no_address = property("d", "s");
        no_address.address = None;
        store.insert(no_address).await.unwrap();

        let exclude: HashSet<String> = ["c".to_string()].into_iter().collect();
        let batch = store.geocode_candidates(10, 3, &exclude).await.unwrap();
        let keys: Vec<&str> = batch.iter().map(|p| p.dedup_key.as_str()).collect();

        assert_eq!(keys, vec!["b", "a"]);
    }

    #[tokio::test]
    async fn test_record_geocode_failure_counts_attempt() {
        let store = MemoryStore::new();
        store.insert(property("k1", "s")).await.unwrap();

        store
            .record_geocode("k1", GeocodeUpdate::Failed, Utc::now())
            .await
            .unwrap();

        let record = store.get("k1").await.unwrap().unwrap();
        assert_eq!(record.geocode_attempts, 1);
        assert_eq!(record.geocode_status, GeocodeStatus::Failed);
    }

    #[tokio::test]
    async fn test_update_with_stale_revision_conflicts() {
        let store = MemoryStore::new();
        store.insert(property("k1", "s")).await.unwrap();
        let stale = store.get("k1").await.unwrap().unwrap();

        store.mark_checked("k1", Utc::now()).await.unwrap();

        let err = store.update(stale).await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(key) if key == "k1"));

        let current = store.get("k1").await.unwrap().unwrap();
        assert_eq!(current.revision, 1);
        store.update(current).await.unwrap();
        assert_eq!(store.get("k1").await.unwrap().unwrap().revision, 2);
    }

    #[tokio::test]
    async fn test_count_active_per_site() {
        let store = MemoryStore::new();
        store.insert(property("a", "s1")).await.unwrap();
        store.insert(property("b", "s1")).await.unwrap();
        store.insert(property("c", "s2")).await.unwrap();
        store.deactivate("b", Utc::now()).await.unwrap();

        assert_eq!(store.count_active(Some("s1")).await.unwrap(), 1);
        assert_eq!(store.count_active(None).await.unwrap(), 2);
    }
}
