// src/storage/local.rs

//! Local filesystem storage implementation.
//!
//! Keeps every table in a [`MemoryStore`] and mirrors it to JSON files for
//! development and single-host deployments. Site configurations and run state
//! are written through on every change; listings are written by [`flush`].
//!
//! [`flush`]: LocalStorage::flush

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Serialize, de::DeserializeOwned};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::{GeocodeUpdate, MemoryStore, PropertyStore, SiteStore};
use crate::error::{AppError, Result};
use crate::models::{PropertyRecord, SiteConfig, SiteRunState};

const SITES_FILE: &str = "sites.json";
const RUN_STATE_FILE: &str = "run_state.json";
const PROPERTIES_FILE: &str = "properties.json";

/// Local filesystem storage backend.
pub struct LocalStorage {
    root_dir: PathBuf,
    inner: MemoryStore,
    /// Held from snapshot to rename so an older snapshot never overwrites a newer one
    write_lock: Mutex<()>,
}

impl LocalStorage {
    /// Open storage rooted at the given directory, loading existing tables.
    pub async fn open(root_dir: impl Into<PathBuf>) -> Result<Self> {
        let root_dir = root_dir.into();
        tokio::fs::create_dir_all(&root_dir).await?;

        let sites: Vec<SiteConfig> = read_json(&root_dir.join(SITES_FILE))
            .await?
            .unwrap_or_default();
        let run_states: Vec<SiteRunState> = read_json(&root_dir.join(RUN_STATE_FILE))
            .await?
            .unwrap_or_default();
        let properties: Vec<PropertyRecord> = read_json(&root_dir.join(PROPERTIES_FILE))
            .await?
            .unwrap_or_default();

        log::info!(
            "Opened storage at {} ({} sites, {} properties)",
            root_dir.display(),
            sites.len(),
            properties.len()
        );

        Ok(Self {
            root_dir,
            inner: MemoryStore::from_parts(sites, run_states, properties),
            write_lock: Mutex::new(()),
        })
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    /// Persist the listing table.
    pub async fn flush(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let properties = self.inner.all().await?;
        self.write_json(PROPERTIES_FILE, &properties).await?;
        log::debug!("Flushed {} properties", properties.len());
        Ok(())
    }

    async fn persist_sites(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let sites = self.inner.list_sites().await?;
        self.write_json(SITES_FILE, &sites).await
    }

    async fn persist_run_states(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let states = self.inner.list_run_states().await?;
        self.write_json(RUN_STATE_FILE, &states).await
    }

    /// Write JSON atomically (write to temp, then rename). Callers hold `write_lock`.
    async fn write_json<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(value)?;
        let path = self.root_dir.join(key);

        let tmp = path.with_extension("tmp");
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&bytes).await?;
        file.flush().await?;
        drop(file);

        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

/// Read JSON, returning None if the file doesn't exist.
async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(AppError::Io(e)),
    }
}

#[async_trait]
impl SiteStore for LocalStorage {
    async fn list_sites(&self) -> Result<Vec<SiteConfig>> {
        self.inner.list_sites().await
    }

    async fn get_site(&self, site_id: &str) -> Result<Option<SiteConfig>> {
        self.inner.get_site(site_id).await
    }

    async fn save_site(&self, site: &SiteConfig) -> Result<()> {
        self.inner.save_site(site).await?;
        self.persist_sites().await
    }

    async fn get_run_state(&self, site_id: &str) -> Result<Option<SiteRunState>> {
        self.inner.get_run_state(site_id).await
    }

    async fn save_run_state(&self, state: &SiteRunState) -> Result<()> {
        self.inner.save_run_state(state).await?;
        self.persist_run_states().await
    }

    async fn list_run_states(&self) -> Result<Vec<SiteRunState>> {
        self.inner.list_run_states().await
    }
}

#[async_trait]
impl PropertyStore for LocalStorage {
    async fn get(&self, dedup_key: &str) -> Result<Option<PropertyRecord>> {
        self.inner.get(dedup_key).await
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
        self.inner
            .geocode_candidates(limit, max_attempts, exclude)
            .await
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
