// src/pipeline/enrichment.rs

//! Geocoding backlog processing.
//!
//! Runs apart from harvests: each batch claims eligible records, resolves
//! them one at a time with a pause between provider calls, and writes the
//! outcome back onto the record.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;

use crate::error::Result;
use crate::models::{EnrichmentConfig, PropertyRecord};
use crate::pipeline::guard::RunGuard;
use crate::services::{GeocodeOutcome, GeocodeQuery, Geocoder};
use crate::storage::{GeocodeUpdate, PropertyStore};

/// Counts for one or more geocoding batches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchStats {
    pub processed: usize,
    pub success: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl BatchStats {
    pub fn merge(&mut self, other: &BatchStats) {
        self.processed += other.processed;
        self.success += other.success;
        self.failed += other.failed;
        self.skipped += other.skipped;
    }
}

/// Single-flight geocoding queue over the property store.
pub struct EnrichmentQueue {
    store: Arc<dyn PropertyStore>,
    geocoder: Arc<dyn Geocoder>,
    config: EnrichmentConfig,
    /// Records claimed by the batch in flight
    claims: Mutex<HashSet<String>>,
    guard: RunGuard,
}

impl EnrichmentQueue {
    pub fn new(
        store: Arc<dyn PropertyStore>,
        geocoder: Arc<dyn Geocoder>,
        config: EnrichmentConfig,
    ) -> Self {
        Self {
            store,
            geocoder,
            config,
            claims: Mutex::new(HashSet::new()),
            guard: RunGuard::new("enrichment"),
        }
    }

    /// Geocode up to `batch_size` pending records.
    ///
    /// Fails with `AlreadyRunning` if another batch is in flight.
    pub async fn process_pending_batch(&self, batch_size: usize) -> Result<BatchStats> {
        let _lease = self.guard.try_acquire()?;
        self.run_batch(batch_size).await
    }

    /// Loop batches until the backlog is empty or `max_batches` ran.
    pub async fn process_all(&self, batch_size: usize, max_batches: usize) -> Result<BatchStats> {
        let _lease = self.guard.try_acquire()?;
        let mut total = BatchStats::default();

        for batch in 1..=max_batches {
            let stats = self.run_batch(batch_size).await?;
            total.merge(&stats);
            if stats.processed == 0 {
                break;
            }
            log::debug!("Enrichment batch {}/{} done", batch, max_batches);
        }
        Ok(total)
    }

    async fn run_batch(&self, batch_size: usize) -> Result<BatchStats> {
        let claimed = self.claim(batch_size).await?;
        let result = self.geocode_all(&claimed).await;
        self.release(&claimed);
        let stats = result?;

        if stats.processed > 0 {
            log::info!(
                "Geocoded {} record(s): {} located, {} failed, {} skipped",
                stats.processed,
                stats.success,
                stats.failed,
                stats.skipped
            );
        }
        Ok(stats)
    }

    async fn claim(&self, batch_size: usize) -> Result<Vec<PropertyRecord>> {
        let exclude = self.lock_claims().clone();
        let candidates = self
            .store
            .geocode_candidates(batch_size, self.config.max_attempts, &exclude)
            .await?;

        let mut claims = self.lock_claims();
        Ok(candidates
            .into_iter()
            .filter(|record| claims.insert(record.dedup_key.clone()))
            .collect())
    }

    fn release(&self, records: &[PropertyRecord]) {
        let mut claims = self.lock_claims();
        for record in records {
            claims.remove(&record.dedup_key);
        }
    }

    fn lock_claims(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.claims.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn geocode_all(&self, records: &[PropertyRecord]) -> Result<BatchStats> {
        let interval = Duration::from_millis(self.config.request_interval_ms);
        let mut stats = BatchStats::default();
        let mut called = false;

        for record in records {
            stats.processed += 1;
            let Some(query) = query_for(record) else {
                self.store
                    .record_geocode(&record.dedup_key, GeocodeUpdate::Skipped, Utc::now())
                    .await?;
                stats.skipped += 1;
                continue;
            };

            if called && !interval.is_zero() {
                tokio::time::sleep(interval).await;
            }
            called = true;

            let update = match self.geocoder.geocode(&query).await {
                Ok(GeocodeOutcome::Found {
                    latitude,
                    longitude,
                }) => {
                    stats.success += 1;
                    GeocodeUpdate::Located {
                        latitude,
                        longitude,
                    }
                }
                Ok(GeocodeOutcome::NotFound) => {
                    log::debug!("No geocode match for {}", record.dedup_key);
                    stats.failed += 1;
                    GeocodeUpdate::Failed
                }
                Err(e) => {
                    log::warn!("Geocoding {} failed: {}", record.dedup_key, e);
                    stats.failed += 1;
                    GeocodeUpdate::Failed
                }
            };
            self.store
                .record_geocode(&record.dedup_key, update, Utc::now())
                .await?;
        }
        Ok(stats)
    }
}

/// Query for a record, or `None` when the address is too sparse.
fn query_for(record: &PropertyRecord) -> Option<GeocodeQuery> {
    let address = record.address.as_deref().map(str::trim).filter(|a| !a.is_empty())?;
    let city = record.city.as_deref().map(str::trim).filter(|c| !c.is_empty())?;
    Some(GeocodeQuery {
        address: address.to_string(),
        neighborhood: record.neighborhood.clone(),
        city: city.to_string(),
        state: record.state.clone(),
    })
}
