// src/pipeline/harvest.rs

//! Harvest orchestration.
//!
//! Runs every enabled site through discovery (when it has no method yet),
//! the site scraper and the upsert step, with bounded concurrency. Each site
//! runs in its own task; a failure is classified, mapped to a new status by
//! the auto-fix policy and recorded in that site's run state only.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::error::{AppError, Result};
use crate::fetch::{FetchLayer, Fetcher};
use crate::models::{Config, Diagnosis, ScrapeStatus, SiteConfig, SiteRunState};
use crate::pipeline::dedup::{UpsertStats, Upserter};
use crate::pipeline::diagnosis::{auto_fix, classify, classify_empty};
use crate::pipeline::drop_breaker::{DropBreaker, DropBreakerConfig};
use crate::pipeline::guard::RunGuard;
use crate::pipeline::retire::retire_missing;
use crate::services::discovery::{SiteType, no_structure};
use crate::services::{
    LinkMatcher, ScrapeBudget, SiteScraper, StructureDiscovery, TextExtractor,
};
use crate::storage::{PropertyStore, SiteStore};

/// Parameters of one harvest invocation.
#[derive(Debug, Clone, Default)]
pub struct HarvestRequest {
    /// Harvest only this site
    pub site_id: Option<String>,
    /// Sites harvested at once (defaults to `harvest.max_concurrent`)
    pub concurrency: Option<usize>,
    /// Per-site item budget (defaults to the site's, then the global one)
    pub max_items: Option<usize>,
}

/// A failed site run.
#[derive(Debug, Clone, Serialize)]
pub struct SiteError {
    pub site_id: String,
    pub diagnosis: Diagnosis,
    pub message: String,
}

/// Outcome of one site within a harvest.
#[derive(Debug, Clone, Serialize)]
pub struct SiteReport {
    pub site_id: String,
    pub status: ScrapeStatus,
    /// Raw records extracted
    pub extracted: usize,
    pub stats: UpsertStats,
    pub retired: usize,
    pub layer: Option<FetchLayer>,
    /// The walk covered the whole listing
    pub complete: bool,
    pub cancelled: bool,
    pub error: Option<SiteError>,
}

impl SiteReport {
    fn new(site_id: &str, status: ScrapeStatus) -> Self {
        Self {
            site_id: site_id.to_string(),
            status,
            extracted: 0,
            stats: UpsertStats::default(),
            retired: 0,
            layer: None,
            complete: false,
            cancelled: false,
            error: None,
        }
    }

    fn failed(site_id: &str, status: ScrapeStatus, diagnosis: Diagnosis, message: String) -> Self {
        Self {
            error: Some(SiteError {
                site_id: site_id.to_string(),
                diagnosis,
                message,
            }),
            ..Self::new(site_id, status)
        }
    }
}

/// Structured result of a harvest invocation.
#[derive(Debug, Clone, Serialize)]
pub struct HarvestReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: bool,
    /// Aggregate new/updated/skipped counts
    pub totals: UpsertStats,
    pub retired: usize,
    pub sites: Vec<SiteReport>,
    pub errors: Vec<SiteError>,
}

impl HarvestReport {
    fn from_sites(
        started_at: DateTime<Utc>,
        mut sites: Vec<SiteReport>,
        cancelled: bool,
    ) -> Self {
        sites.sort_by(|a, b| a.site_id.cmp(&b.site_id));

        let mut totals = UpsertStats::default();
        for site in &sites {
            totals.merge(&site.stats);
        }
        let errors: Vec<SiteError> = sites.iter().filter_map(|s| s.error.clone()).collect();

        Self {
            started_at,
            finished_at: Utc::now(),
            attempted: sites.iter().filter(|s| !(s.cancelled && s.extracted == 0)).count(),
            succeeded: sites
                .iter()
                .filter(|s| s.error.is_none() && s.status == ScrapeStatus::Success && !s.cancelled)
                .count(),
            failed: errors.len(),
            cancelled,
            totals,
            retired: sites.iter().map(|s| s.retired).sum(),
            sites,
            errors,
        }
    }

    /// Raw records extracted across all sites.
    pub fn extracted(&self) -> usize {
        self.sites.iter().map(|s| s.extracted).sum()
    }
}

/// Classified failure of one site run.
#[derive(Debug)]
pub(crate) struct SiteFailure {
    pub diagnosis: Diagnosis,
    pub message: String,
}

impl From<AppError> for SiteFailure {
    fn from(error: AppError) -> Self {
        Self {
            diagnosis: classify(&error),
            message: error.to_string(),
        }
    }
}

struct SiteRun {
    extracted: usize,
    stats: UpsertStats,
    retired: usize,
    layer: Option<FetchLayer>,
    complete: bool,
    cancelled: bool,
}

/// Drives harvests and rediscovery over the configured sites.
#[derive(Clone)]
pub struct HarvestOrchestrator {
    pub(crate) config: Arc<Config>,
    pub(crate) sites: Arc<dyn SiteStore>,
    pub(crate) properties: Arc<dyn PropertyStore>,
    fetcher: Arc<dyn Fetcher>,
    links: LinkMatcher,
    scraper: Arc<SiteScraper>,
    pub(crate) discovery: Arc<StructureDiscovery>,
    upserter: Arc<Upserter>,
    breaker: DropBreaker,
    harvest_guard: RunGuard,
    pub(crate) rediscovery_guard: RunGuard,
}

impl HarvestOrchestrator {
    pub fn new(
        config: Arc<Config>,
        sites: Arc<dyn SiteStore>,
        properties: Arc<dyn PropertyStore>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Result<Self> {
        let links = LinkMatcher::new(&config.discovery.link_patterns)?;
        let scraper = SiteScraper::new(
            Arc::clone(&fetcher),
            links.clone(),
            Duration::from_millis(config.harvest.page_delay_ms),
        );
        let discovery = StructureDiscovery::new(
            Arc::clone(&fetcher),
            links.clone(),
            config.discovery.clone(),
        );
        let upserter = Upserter::new(Arc::clone(&properties), config.dedup.salt.clone());
        let breaker = DropBreaker::new(DropBreakerConfig::from(&config.harvest));

        Ok(Self {
            config,
            sites,
            properties,
            fetcher,
            links,
            scraper: Arc::new(scraper),
            discovery: Arc::new(discovery),
            upserter: Arc::new(upserter),
            breaker,
            harvest_guard: RunGuard::new("harvest"),
            rediscovery_guard: RunGuard::new("rediscovery"),
        })
    }

    /// Let the scraper consult a text-extraction oracle for bare cards.
    pub fn with_extractor(mut self, extractor: Arc<dyn TextExtractor>) -> Self {
        let scraper = SiteScraper::new(
            Arc::clone(&self.fetcher),
            self.links.clone(),
            Duration::from_millis(self.config.harvest.page_delay_ms),
        )
        .with_extractor(extractor);
        self.scraper = Arc::new(scraper);
        self
    }

    /// Harvest all enabled sites (or the requested one).
    ///
    /// Fails only at invocation level: a concurrent harvest, an unknown
    /// site or an unreachable store. Per-site failures land in the report.
    pub async fn run_batch(
        &self,
        request: HarvestRequest,
        cancel: CancellationToken,
    ) -> Result<HarvestReport> {
        let _lease = self.harvest_guard.try_acquire()?;
        let started_at = Utc::now();

        let sites = self.select_sites(request.site_id.as_deref()).await?;
        let concurrency = request
            .concurrency
            .unwrap_or(self.config.harvest.max_concurrent)
            .max(1);
        log::info!(
            "Harvesting {} site(s) with concurrency {}",
            sites.len(),
            concurrency
        );

        let max_items = request.max_items;
        let reports: Vec<SiteReport> = stream::iter(sites)
            .map(|site| {
                let this = self.clone();
                let cancel = cancel.clone();
                let site_id = site.site_id.clone();
                async move {
                    let task =
                        tokio::spawn(async move { this.harvest_site(site, max_items, &cancel).await });
                    match task.await {
                        Ok(report) => report,
                        Err(e) => {
                            log::error!("{}: site task failed: {}", site_id, e);
                            SiteReport::failed(
                                &site_id,
                                ScrapeStatus::Error,
                                Diagnosis::Unknown,
                                format!("site task failed: {e}"),
                            )
                        }
                    }
                }
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;

        let report = HarvestReport::from_sites(started_at, reports, cancel.is_cancelled());
        log::info!(
            "Harvest finished: {} attempted, {} succeeded, {} failed, {} new, {} updated, {} skipped",
            report.attempted,
            report.succeeded,
            report.failed,
            report.totals.new,
            report.totals.updated,
            report.totals.skipped
        );
        Ok(report)
    }

    async fn select_sites(&self, site_id: Option<&str>) -> Result<Vec<SiteConfig>> {
        match site_id {
            Some(id) => {
                let site = self
                    .sites
                    .get_site(id)
                    .await?
                    .ok_or_else(|| AppError::NotFound(format!("site {id}")))?;
                if !site.enabled {
                    return Err(AppError::validation(format!("site {id} is disabled")));
                }
                Ok(vec![site])
            }
            None => Ok(self
                .sites
                .list_sites()
                .await?
                .into_iter()
                .filter(|s| s.enabled)
                .collect()),
        }
    }

    /// Harvest one site and record its run state.
    pub async fn harvest_site(
        &self,
        mut site: SiteConfig,
        max_items: Option<usize>,
        cancel: &CancellationToken,
    ) -> SiteReport {
        let site_id = site.site_id.clone();
        if cancel.is_cancelled() {
            let mut report = SiteReport::new(&site_id, ScrapeStatus::Pending);
            report.cancelled = true;
            return report;
        }

        let mut state = match self.sites.get_run_state(&site_id).await {
            Ok(state) => state.unwrap_or_else(|| SiteRunState::new(&site_id)),
            Err(e) => {
                return SiteReport::failed(&site_id, ScrapeStatus::Error, Diagnosis::Unknown, e.to_string());
            }
        };

        let result = self.run_site(&mut site, &state, max_items, cancel).await;
        let now = Utc::now();

        let mut report = match result {
            Ok(run) if run.cancelled => {
                // Partial runs leave the run state untouched.
                let mut report = SiteReport::new(&site_id, state.status);
                report.cancelled = true;
                report.extracted = run.extracted;
                report.stats = run.stats;
                report.layer = run.layer;
                return report;
            }
            Ok(run) => {
                state.record_success(run.extracted, run.layer.unwrap_or(FetchLayer::Http), now);
                log::info!(
                    "{}: {} extracted ({} new, {} updated, {} skipped), {} retired",
                    site_id,
                    run.extracted,
                    run.stats.new,
                    run.stats.updated,
                    run.stats.skipped,
                    run.retired
                );
                SiteReport {
                    extracted: run.extracted,
                    stats: run.stats,
                    retired: run.retired,
                    layer: run.layer,
                    complete: run.complete,
                    ..SiteReport::new(&site_id, ScrapeStatus::Success)
                }
            }
            Err(_) if cancel.is_cancelled() => {
                let mut report = SiteReport::new(&site_id, state.status);
                report.cancelled = true;
                return report;
            }
            Err(failure) => {
                log::warn!("{}: {} ({})", site_id, failure.message, failure.diagnosis);
                match self
                    .apply_failure(&mut site, &mut state, &failure, now)
                    .await
                {
                    Ok(status) => {
                        SiteReport::failed(&site_id, status, failure.diagnosis, failure.message)
                    }
                    Err(e) => {
                        return SiteReport::failed(
                            &site_id,
                            ScrapeStatus::Error,
                            failure.diagnosis,
                            format!("{} (auto-fix failed: {e})", failure.message),
                        );
                    }
                }
            }
        };

        if let Err(e) = self.sites.save_run_state(&state).await {
            log::error!("{}: failed to save run state: {}", site_id, e);
            report.error.get_or_insert(SiteError {
                site_id: site_id.clone(),
                diagnosis: Diagnosis::Unknown,
                message: e.to_string(),
            });
        }
        report
    }

    async fn run_site(
        &self,
        site: &mut SiteConfig,
        state: &SiteRunState,
        max_items: Option<usize>,
        cancel: &CancellationToken,
    ) -> std::result::Result<SiteRun, SiteFailure> {
        let start_layer = match state.status {
            ScrapeStatus::NeedsPlaywright => Some(
                state
                    .last_layer
                    .map_or(FetchLayer::Browser, |l| l.max(FetchLayer::Browser)),
            ),
            _ => state.last_layer,
        };

        if site.method.is_none() {
            self.adopt_discovered(site).await?;
        }

        let budget = ScrapeBudget {
            max_items: max_items
                .or(site.max_items)
                .unwrap_or(self.config.harvest.max_items_per_site)
                .max(1),
            max_pages: self.config.harvest.max_pages,
        };
        let outcome = self
            .scraper
            .scrape(site, budget, start_layer, cancel)
            .await?;

        if outcome.records.is_empty() && !outcome.cancelled {
            return Err(SiteFailure {
                diagnosis: classify_empty(outcome.sparse_first_page, outcome.layer),
                message: format!(
                    "no listings found on {} page(s)",
                    outcome.pages_fetched
                ),
            });
        }

        let now = Utc::now();
        let baseline = self.properties.count_active(Some(&site.site_id)).await?;
        let upsert = self
            .upserter
            .upsert_batch(site, &outcome.records, now)
            .await?;

        let full = outcome.complete && !outcome.cancelled;
        let retired = if !full {
            log::debug!("{}: partial harvest, retirement skipped", site.site_id);
            0
        } else if self
            .breaker
            .permits(&site.site_id, upsert.seen_keys.len(), baseline)
        {
            let grace = chrono::Duration::hours(self.config.harvest.retire_grace_hours);
            retire_missing(
                self.properties.as_ref(),
                &site.site_id,
                &upsert.seen_keys,
                grace,
                now,
            )
            .await?
        } else {
            0
        };

        Ok(SiteRun {
            extracted: outcome.records.len(),
            stats: upsert.stats,
            retired,
            layer: outcome.layer,
            complete: full,
            cancelled: outcome.cancelled,
        })
    }

    /// Discover a method for a site that has none and store it.
    async fn adopt_discovered(&self, site: &mut SiteConfig) -> std::result::Result<(), SiteFailure> {
        let result = self.discovery.discover(site).await?;
        let min_confidence = self.config.discovery.min_confidence;

        match result.to_method() {
            Some(method) if result.is_usable(min_confidence) => {
                log::info!(
                    "{}: adopted discovered {} method (confidence {:.2})",
                    site.site_id,
                    method.name(),
                    result.confidence
                );
                site.method = Some(method);
                self.sites.save_site(site).await?;
                Ok(())
            }
            _ => {
                let diagnosis = match result.site_type {
                    SiteType::Dynamic if result.layer_used == FetchLayer::Http => {
                        Diagnosis::DynamicContent
                    }
                    _ => Diagnosis::NoPropertiesFound,
                };
                Err(SiteFailure {
                    diagnosis,
                    message: no_structure(site, &result).to_string(),
                })
            }
        }
    }

    /// Record a failure and apply the auto-fix policy to the site.
    pub(crate) async fn apply_failure(
        &self,
        site: &mut SiteConfig,
        state: &mut SiteRunState,
        failure: &SiteFailure,
        at: DateTime<Utc>,
    ) -> Result<ScrapeStatus> {
        let status = auto_fix(failure.diagnosis);
        state.record_failure(status, failure.diagnosis, failure.message.clone(), at);

        match status {
            ScrapeStatus::Disabled => {
                log::warn!("{}: disabled after {}", site.site_id, failure.diagnosis);
                site.enabled = false;
                self.sites.save_site(site).await?;
            }
            ScrapeStatus::NeedsPlaywright => {
                if site.mark_for_browser() {
                    log::info!("{}: switched to the browser method", site.site_id);
                    self.sites.save_site(site).await?;
                }
            }
            _ => {}
        }
        Ok(status)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use chrono::Duration as ChronoDuration;

    use super::*;
    use crate::fetch::testing::MapFetcher;
    use crate::fetch::{FailureKind, FetchError};
    use crate::models::fixtures::property;
    use crate::models::{Pagination, SiteMethod, SiteSelectors};
    use crate::storage::MemoryStore;

    pub(crate) const LISTING: &str = "https://casa.example/imoveis";

    pub(crate) fn test_config() -> Config {
        let mut config = Config::default();
        config.harvest.page_delay_ms = 0;
        config
    }

    pub(crate) fn cards(ids: &[u32]) -> String {
        let cards: String = ids
            .iter()
            .map(|id| {
                format!(
                    r#"<div class="card-lote"><a href="/lote/{id}">Casa {id}</a><p>R$ 150.000,00</p><p>Santos/SP</p></div>"#
                )
            })
            .collect();
        format!("<html><body>{cards}</body></html>")
    }

    pub(crate) fn html_site(id: &str) -> SiteConfig {
        let mut site = SiteConfig::new(id, "Casa", "https://casa.example");
        site.listing_url = Some(LISTING.into());
        site.method = Some(SiteMethod::HtmlStatic {
            selectors: SiteSelectors::card_only("div.card-lote"),
            pagination: Pagination::QueryParam {
                param: "p".into(),
                start: 1,
            },
            max_pages: None,
        });
        site
    }

    pub(crate) fn orchestrator(
        store: Arc<MemoryStore>,
        fetcher: MapFetcher,
    ) -> HarvestOrchestrator {
        HarvestOrchestrator::new(
            Arc::new(test_config()),
            store.clone(),
            store,
            Arc::new(fetcher),
        )
        .unwrap()
    }

    fn paged_fetcher() -> MapFetcher {
        MapFetcher::new()
            .with_page(&format!("{LISTING}?p=1"), cards(&[1, 2, 3]))
            .with_page(&format!("{LISTING}?p=2"), cards(&[3, 4]))
            .with_page(&format!("{LISTING}?p=3"), cards(&[]))
    }

    #[tokio::test]
    async fn test_harvest_upserts_and_reports() {
        let store = Arc::new(MemoryStore::new());
        store.save_site(&html_site("casa")).await.unwrap();
        let orch = orchestrator(store.clone(), paged_fetcher());

        let report = orch
            .run_batch(HarvestRequest::default(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.attempted, 1);
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.extracted(), 5);
        assert_eq!(report.totals, UpsertStats { new: 4, updated: 0, skipped: 1 });
        assert_eq!(store.count_active(Some("casa")).await.unwrap(), 4);

        let state = store.get_run_state("casa").await.unwrap().unwrap();
        assert_eq!(state.status, ScrapeStatus::Success);
        assert_eq!(state.last_count, Some(5));

        // A second run updates instead of inserting.
        let report = orch
            .run_batch(HarvestRequest::default(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.totals.new, 0);
        assert_eq!(report.totals.updated, 4);
        assert_eq!(store.all().await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_dns_failure_disables_site() {
        let store = Arc::new(MemoryStore::new());
        store.save_site(&html_site("gone")).await.unwrap();
        let fetcher = MapFetcher::new().with_error(
            &format!("{LISTING}?p=1"),
            FetchError::new(FailureKind::Dns, FetchLayer::Http, "no such host"),
        );
        let orch = orchestrator(store.clone(), fetcher);

        let report = orch
            .run_batch(HarvestRequest::default(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(report.errors[0].diagnosis, Diagnosis::DnsFailure);
        let state = store.get_run_state("gone").await.unwrap().unwrap();
        assert_eq!(state.status, ScrapeStatus::Disabled);
        assert!(!store.get_site("gone").await.unwrap().unwrap().enabled);

        // Disabled sites are left out of the next batch.
        let report = orch
            .run_batch(HarvestRequest::default(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.attempted, 0);
    }

    #[tokio::test]
    async fn test_challenge_marks_site_for_browser() {
        let store = Arc::new(MemoryStore::new());
        store.save_site(&html_site("blocked")).await.unwrap();
        let fetcher = MapFetcher::new().with_error(
            &format!("{LISTING}?p=1"),
            FetchError::new(FailureKind::ChallengeDetected, FetchLayer::StealthBrowser, "just a moment"),
        );
        let orch = orchestrator(store.clone(), fetcher);

        orch.run_batch(HarvestRequest::default(), CancellationToken::new())
            .await
            .unwrap();

        let state = store.get_run_state("blocked").await.unwrap().unwrap();
        assert_eq!(state.status, ScrapeStatus::NeedsPlaywright);
        let site = store.get_site("blocked").await.unwrap().unwrap();
        assert_eq!(site.method.unwrap().name(), "browser");
    }

    #[tokio::test]
    async fn test_one_failing_site_does_not_abort_batch() {
        let store = Arc::new(MemoryStore::new());
        store.save_site(&html_site("casa")).await.unwrap();
        let mut broken = html_site("broken");
        broken.listing_url = Some("https://broken.example/".into());
        store.save_site(&broken).await.unwrap();
        let orch = orchestrator(store.clone(), paged_fetcher());

        let report = orch
            .run_batch(HarvestRequest::default(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.attempted, 2);
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.errors[0].site_id, "broken");
    }

    #[tokio::test]
    async fn test_site_without_method_is_discovered() {
        let store = Arc::new(MemoryStore::new());
        let mut site = SiteConfig::new("novo", "Novo", "https://casa.example");
        site.listing_url = Some(LISTING.into());
        store.save_site(&site).await.unwrap();
        let fetcher = MapFetcher::new().with_page(LISTING, cards(&[1, 2, 3, 4, 5, 6]));
        let orch = orchestrator(store.clone(), fetcher);

        let report = orch
            .run_batch(HarvestRequest::default(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.succeeded, 1);
        assert_eq!(report.totals.new, 6);
        let stored = store.get_site("novo").await.unwrap().unwrap();
        assert_eq!(
            stored.method.unwrap().selectors().unwrap().card,
            "div.card-lote"
        );
    }

    #[tokio::test]
    async fn test_cancelled_batch_leaves_run_state_untouched() {
        let store = Arc::new(MemoryStore::new());
        store.save_site(&html_site("casa")).await.unwrap();
        let orch = orchestrator(store.clone(), paged_fetcher());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = orch.run_batch(HarvestRequest::default(), cancel).await.unwrap();

        assert!(report.cancelled);
        assert!(report.sites[0].cancelled);
        assert!(store.get_run_state("casa").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_invocation_rejected() {
        let store = Arc::new(MemoryStore::new());
        let orch = orchestrator(store, MapFetcher::new());
        let _lease = orch.harvest_guard.try_acquire().unwrap();

        let result = orch
            .run_batch(HarvestRequest::default(), CancellationToken::new())
            .await;
        assert!(matches!(result, Err(AppError::AlreadyRunning("harvest"))));
    }

    #[tokio::test]
    async fn test_full_harvest_retires_stale_listings() {
        let store = Arc::new(MemoryStore::new());
        store.save_site(&html_site("casa")).await.unwrap();
        let mut stale = property("old-listing", "casa");
        stale.last_seen_at = Utc::now() - ChronoDuration::hours(200);
        store.insert(stale).await.unwrap();
        let orch = orchestrator(store.clone(), paged_fetcher());

        let report = orch
            .run_batch(HarvestRequest::default(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.retired, 1);
        assert!(!store.get("old-listing").await.unwrap().unwrap().is_active);
    }

    #[tokio::test]
    async fn test_truncated_harvest_never_retires() {
        let store = Arc::new(MemoryStore::new());
        store.save_site(&html_site("casa")).await.unwrap();
        let mut stale = property("old-listing", "casa");
        stale.last_seen_at = Utc::now() - ChronoDuration::hours(200);
        store.insert(stale).await.unwrap();
        let orch = orchestrator(store.clone(), paged_fetcher());

        let request = HarvestRequest {
            max_items: Some(2),
            ..HarvestRequest::default()
        };
        let report = orch.run_batch(request, CancellationToken::new()).await.unwrap();

        assert_eq!(report.extracted(), 2);
        assert_eq!(report.retired, 0);
        assert!(store.get("old-listing").await.unwrap().unwrap().is_active);
    }

    #[tokio::test]
    async fn test_next_run_starts_at_last_working_layer() {
        let store = Arc::new(MemoryStore::new());
        store.save_site(&html_site("casa")).await.unwrap();
        let orch = orchestrator(store.clone(), paged_fetcher().via_layer(FetchLayer::Browser));

        orch.run_batch(HarvestRequest::default(), CancellationToken::new())
            .await
            .unwrap();
        let state = store.get_run_state("casa").await.unwrap().unwrap();
        assert_eq!(state.last_layer, Some(FetchLayer::Browser));

        let fetcher = Arc::new(paged_fetcher());
        let orch = HarvestOrchestrator::new(
            Arc::new(test_config()),
            store.clone(),
            store.clone(),
            fetcher.clone(),
        )
        .unwrap();
        orch.run_batch(HarvestRequest::default(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            fetcher.requested_urls(),
            vec![
                format!("{LISTING}?p=1"),
                format!("{LISTING}?p=2"),
                format!("{LISTING}?p=3"),
            ]
        );
        let requests = fetcher.requests.lock().unwrap();
        assert!(requests
            .iter()
            .all(|(_, o)| o.start_layer == Some(FetchLayer::Browser)));
    }

    #[tokio::test]
    async fn test_unknown_site_is_invocation_error() {
        let store = Arc::new(MemoryStore::new());
        let orch = orchestrator(store, MapFetcher::new());
        let request = HarvestRequest {
            site_id: Some("nope".into()),
            ..HarvestRequest::default()
        };
        let result = orch.run_batch(request, CancellationToken::new()).await;
        assert!(matches!(result, Err(AppError::NotFound(_))));
    }
}
