// src/pipeline/link_health.rs

//! Periodic probe of stored listings' source URLs.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;

use crate::error::Result;
use crate::fetch::{FailureKind, FetchOptions, Fetcher};
use crate::models::LinkHealthConfig;
use crate::storage::PropertyStore;

/// Counts for one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepStats {
    pub checked: usize,
    pub deactivated: usize,
    pub healthy: usize,
    /// Transient failures; the record is left active
    pub inconclusive: usize,
}

enum LinkVerdict {
    Gone,
    Healthy,
    Inconclusive,
}

/// Deactivates listings whose page is gone.
pub struct LinkHealthChecker {
    store: Arc<dyn PropertyStore>,
    fetcher: Arc<dyn Fetcher>,
    config: LinkHealthConfig,
    markers: Vec<String>,
}

impl LinkHealthChecker {
    pub fn new(
        store: Arc<dyn PropertyStore>,
        fetcher: Arc<dyn Fetcher>,
        config: LinkHealthConfig,
    ) -> Self {
        let markers = config
            .not_found_markers
            .iter()
            .map(|m| m.to_lowercase())
            .filter(|m| !m.is_empty())
            .collect();
        Self {
            store,
            fetcher,
            config,
            markers,
        }
    }

    /// Probe up to `limit` active listings, least recently checked first.
    pub async fn sweep(&self, limit: usize) -> Result<SweepStats> {
        let interval = Duration::from_millis(self.config.request_interval_ms);
        let candidates = self.store.link_check_candidates(limit).await?;
        let mut stats = SweepStats::default();

        for (i, record) in candidates.iter().enumerate() {
            if i > 0 && !interval.is_zero() {
                tokio::time::sleep(interval).await;
            }

            let now = Utc::now();
            stats.checked += 1;
            match self.probe(&record.source_url).await {
                LinkVerdict::Gone => {
                    if self.store.deactivate(&record.dedup_key, now).await? {
                        log::info!("Deactivated {} (listing gone)", record.source_url);
                        stats.deactivated += 1;
                    }
                }
                LinkVerdict::Healthy => stats.healthy += 1,
                LinkVerdict::Inconclusive => stats.inconclusive += 1,
            }
            self.store.mark_checked(&record.dedup_key, now).await?;
        }

        log::info!(
            "Link sweep: {} checked, {} deactivated, {} healthy, {} inconclusive",
            stats.checked,
            stats.deactivated,
            stats.healthy,
            stats.inconclusive
        );
        Ok(stats)
    }

    async fn probe(&self, url: &str) -> LinkVerdict {
        let options = FetchOptions::default().http_only();
        match self.fetcher.fetch(url, &options).await {
            Ok(page) => {
                let body = page.body.to_lowercase();
                if self.markers.iter().any(|m| body.contains(m.as_str())) {
                    LinkVerdict::Gone
                } else {
                    LinkVerdict::Healthy
                }
            }
            Err(e) if e.kind == FailureKind::HttpStatus && matches!(e.status, Some(404) | Some(410)) => {
                LinkVerdict::Gone
            }
            Err(e) => {
                log::debug!("Link check of {} inconclusive: {}", url, e);
                LinkVerdict::Inconclusive
            }
        }
    }
}
