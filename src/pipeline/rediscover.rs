// src/pipeline/rediscover.rs

//! Periodic rediscovery of sites that keep failing or stopped changing.

use chrono::Utc;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::models::{Diagnosis, ScrapeStatus, SiteConfig, SiteMethod, SiteRunState};
use crate::pipeline::harvest::{HarvestOrchestrator, SiteFailure};
use crate::services::SelectorDecision;
use crate::services::discovery::no_structure;

/// What rediscovery did with a site.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RediscoveryAction {
    /// Stored selectors still match
    Retained,
    /// Stored structure overwritten by a confident candidate
    Replaced,
    /// Stored selectors broke; candidate not confident enough
    Drift,
    /// Discovery failed; the auto-fix policy was applied
    Failed,
    /// Not applicable (API sites)
    Skipped,
}

/// Per-site result of a rediscovery pass.
#[derive(Debug, Clone, Serialize)]
pub struct RediscoveryOutcome {
    pub site_id: String,
    pub action: RediscoveryAction,
    pub confidence: Option<f64>,
    pub stored_matched: Option<usize>,
    pub diagnosis: Option<Diagnosis>,
    pub status: Option<ScrapeStatus>,
}

impl RediscoveryOutcome {
    fn new(site_id: &str, action: RediscoveryAction) -> Self {
        Self {
            site_id: site_id.to_string(),
            action,
            confidence: None,
            stored_matched: None,
            diagnosis: None,
            status: None,
        }
    }
}

impl HarvestOrchestrator {
    /// Enabled sites whose run state calls for rediscovery.
    pub async fn rediscovery_candidates(&self) -> Result<Vec<SiteConfig>> {
        let failure_threshold = self.config.discovery.failure_threshold;
        let stagnant_runs = self.config.discovery.stagnant_runs;
        let mut candidates = Vec::new();

        for site in self.sites.list_sites().await? {
            if !site.enabled {
                continue;
            }
            let Some(state) = self.sites.get_run_state(&site.site_id).await? else {
                continue;
            };
            if state.consecutive_failures >= failure_threshold || state.unchanged_runs >= stagnant_runs {
                candidates.push(site);
            }
        }
        Ok(candidates)
    }

    /// Re-run discovery for every candidate site.
    pub async fn run_rediscovery(&self, cancel: CancellationToken) -> Result<Vec<RediscoveryOutcome>> {
        let _lease = self.rediscovery_guard.try_acquire()?;
        let candidates = self.rediscovery_candidates().await?;
        log::info!("Rediscovering {} site(s)", candidates.len());

        let mut outcomes = Vec::with_capacity(candidates.len());
        for site in candidates {
            if cancel.is_cancelled() {
                log::warn!("Rediscovery cancelled");
                break;
            }
            outcomes.push(self.rediscover_site(site).await?);
        }
        Ok(outcomes)
    }

    /// Revalidate one site's structure.
    ///
    /// Store errors propagate; discovery errors are classified and recorded.
    pub async fn rediscover_site(&self, mut site: SiteConfig) -> Result<RediscoveryOutcome> {
        if matches!(site.method, Some(SiteMethod::Api { .. })) {
            return Ok(RediscoveryOutcome::new(&site.site_id, RediscoveryAction::Skipped));
        }

        let mut state = self
            .sites
            .get_run_state(&site.site_id)
            .await?
            .unwrap_or_else(|| SiteRunState::new(&site.site_id));
        let now = Utc::now();

        let check = match self.discovery.revalidate(&site).await {
            Ok(check) => check,
            Err(e) => {
                let failure = SiteFailure::from(e);
                let status = self.apply_failure(&mut site, &mut state, &failure, now).await?;
                self.sites.save_run_state(&state).await?;
                return Ok(RediscoveryOutcome {
                    diagnosis: Some(failure.diagnosis),
                    status: Some(status),
                    ..RediscoveryOutcome::new(&site.site_id, RediscoveryAction::Failed)
                });
            }
        };

        let mut outcome = RediscoveryOutcome {
            confidence: Some(check.result.confidence),
            stored_matched: check.stored_matched,
            ..RediscoveryOutcome::new(&site.site_id, RediscoveryAction::Retained)
        };

        match check.decision {
            SelectorDecision::Retain { matched } => {
                log::info!("{}: stored selectors still match {} card(s)", site.site_id, matched);
                // Confirmed selectors restart the stagnation count; failures
                // keep counting toward auto-fix.
                if state.unchanged_runs > 0 {
                    state.unchanged_runs = 0;
                    self.sites.save_run_state(&state).await?;
                }
            }
            SelectorDecision::Replace { confidence } => {
                let max_pages = site.method.as_ref().and_then(|m| match m {
                    SiteMethod::HtmlStatic { max_pages, .. } | SiteMethod::Browser { max_pages, .. } => *max_pages,
                    SiteMethod::Api { .. } => None,
                });
                let mut method = check.result.to_method();
                if let Some(
                    SiteMethod::HtmlStatic { max_pages: slot, .. } | SiteMethod::Browser { max_pages: slot, .. },
                ) = method.as_mut()
                {
                    *slot = max_pages;
                }
                site.method = method;
                self.sites.save_site(&site).await?;

                state.status = ScrapeStatus::Pending;
                state.consecutive_failures = 0;
                state.unchanged_runs = 0;
                self.sites.save_run_state(&state).await?;

                log::info!(
                    "{}: replaced selectors (confidence {:.2})",
                    site.site_id,
                    confidence
                );
                outcome.action = RediscoveryAction::Replaced;
                outcome.status = Some(ScrapeStatus::Pending);
            }
            SelectorDecision::Drift {
                stored_matched,
                candidate_confidence,
            } => {
                log::warn!(
                    "{}: selector drift, stored selector matches {} card(s), best candidate confidence {:.2} below {:.2}",
                    site.site_id,
                    stored_matched,
                    candidate_confidence,
                    self.discovery.config().replace_threshold
                );
                outcome.action = RediscoveryAction::Drift;
            }
            SelectorDecision::NoStructure => {
                let diagnosis = if check.result.sparse {
                    Diagnosis::DynamicContent
                } else {
                    Diagnosis::NoPropertiesFound
                };
                let failure = SiteFailure {
                    diagnosis,
                    message: no_structure(&site, &check.result).to_string(),
                };
                let status = self.apply_failure(&mut site, &mut state, &failure, now).await?;
                self.sites.save_run_state(&state).await?;
                outcome.action = RediscoveryAction::Failed;
                outcome.diagnosis = Some(diagnosis);
                outcome.status = Some(status);
            }
        }

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::fetch::testing::MapFetcher;
    use crate::fetch::{FailureKind, FetchError, FetchLayer};
    use crate::models::{Pagination, SiteSelectors};
    use crate::pipeline::harvest::tests::{LISTING, orchestrator};
    use crate::storage::{MemoryStore, SiteStore};

    fn cards(class: &str, n: u32) -> String {
        (0..n)
            .map(|i| format!(r#"<div class="{class}"><a href="/lote/{i}">Lote {i}</a></div>"#))
            .collect()
    }

    fn page(body: &str) -> String {
        format!("<html><body>{body}</body></html>")
    }

    fn site(id: &str, card: &str) -> SiteConfig {
        let mut site = SiteConfig::new(id, id, "https://casa.example");
        site.listing_url = Some(LISTING.into());
        site.method = Some(SiteMethod::HtmlStatic {
            selectors: SiteSelectors::card_only(card),
            pagination: Pagination::None,
            max_pages: Some(4),
        });
        site
    }

    async fn failing_state(store: &MemoryStore, id: &str) {
        let mut state = SiteRunState::new(id);
        state.consecutive_failures = 3;
        state.status = ScrapeStatus::Error;
        store.save_run_state(&state).await.unwrap();
    }

    #[tokio::test]
    async fn test_stored_selector_matching_many_is_kept() {
        let store = Arc::new(MemoryStore::new());
        store.save_site(&site("s", "div.card-lote")).await.unwrap();
        failing_state(&store, "s").await;
        // Stored selector matches 50 cards; the only other structure has 2.
        let html = page(&format!("{}{}", cards("card-lote", 50), cards("destaque", 2)));
        let orch = orchestrator(store.clone(), MapFetcher::new().with_page(LISTING, html));

        let outcomes = orch.run_rediscovery(CancellationToken::new()).await.unwrap();

        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].action, RediscoveryAction::Retained);
        assert_eq!(outcomes[0].stored_matched, Some(50));
        let stored = store.get_site("s").await.unwrap().unwrap();
        assert_eq!(stored.method.unwrap().selectors().unwrap().card, "div.card-lote");
    }

    #[tokio::test]
    async fn test_confirmed_selectors_clear_stagnation() {
        let store = Arc::new(MemoryStore::new());
        store.save_site(&site("s", "div.card-lote")).await.unwrap();
        let mut state = SiteRunState::new("s");
        for _ in 0..6 {
            state.record_success(20, FetchLayer::Http, Utc::now());
        }
        assert!(state.unchanged_runs >= 5);
        store.save_run_state(&state).await.unwrap();
        let orch = orchestrator(
            store.clone(),
            MapFetcher::new().with_page(LISTING, page(&cards("card-lote", 20))),
        );

        let outcomes = orch.run_rediscovery(CancellationToken::new()).await.unwrap();

        assert_eq!(outcomes[0].action, RediscoveryAction::Retained);
        let state = store.get_run_state("s").await.unwrap().unwrap();
        assert_eq!(state.unchanged_runs, 0);
        assert_eq!(state.status, ScrapeStatus::Success);
        assert!(orch.rediscovery_candidates().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_broken_selector_replaced_by_confident_candidate() {
        let store = Arc::new(MemoryStore::new());
        store.save_site(&site("s", "div.old-card")).await.unwrap();
        failing_state(&store, "s").await;
        let orch = orchestrator(
            store.clone(),
            MapFetcher::new().with_page(LISTING, page(&cards("card-lote", 15))),
        );

        let outcomes = orch.run_rediscovery(CancellationToken::new()).await.unwrap();

        assert_eq!(outcomes[0].action, RediscoveryAction::Replaced);
        let stored = store.get_site("s").await.unwrap().unwrap();
        match stored.method.unwrap() {
            SiteMethod::HtmlStatic { selectors, max_pages, .. } => {
                assert_eq!(selectors.card, "div.card-lote");
                assert_eq!(max_pages, Some(4));
            }
            other => panic!("unexpected method {:?}", other),
        }
        let state = store.get_run_state("s").await.unwrap().unwrap();
        assert_eq!(state.status, ScrapeStatus::Pending);
        assert_eq!(state.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_weak_candidate_is_drift() {
        let store = Arc::new(MemoryStore::new());
        store.save_site(&site("s", "div.old-card")).await.unwrap();
        failing_state(&store, "s").await;
        let orch = orchestrator(
            store.clone(),
            MapFetcher::new().with_page(LISTING, page(&cards("x-leilao", 2))),
        );

        let outcomes = orch.run_rediscovery(CancellationToken::new()).await.unwrap();

        assert_eq!(outcomes[0].action, RediscoveryAction::Drift);
        let stored = store.get_site("s").await.unwrap().unwrap();
        assert_eq!(stored.method.unwrap().selectors().unwrap().card, "div.old-card");
    }

    #[tokio::test]
    async fn test_unreachable_site_goes_through_auto_fix() {
        let store = Arc::new(MemoryStore::new());
        store.save_site(&site("s", "div.card-lote")).await.unwrap();
        failing_state(&store, "s").await;
        let fetcher = MapFetcher::new().with_error(
            LISTING,
            FetchError::new(FailureKind::Dns, FetchLayer::Http, "no such host"),
        );
        let orch = orchestrator(store.clone(), fetcher);

        let outcomes = orch.run_rediscovery(CancellationToken::new()).await.unwrap();

        assert_eq!(outcomes[0].action, RediscoveryAction::Failed);
        assert_eq!(outcomes[0].status, Some(ScrapeStatus::Disabled));
        assert!(!store.get_site("s").await.unwrap().unwrap().enabled);
    }

    #[tokio::test]
    async fn test_healthy_sites_are_not_candidates() {
        let store = Arc::new(MemoryStore::new());
        store.save_site(&site("s", "div.card-lote")).await.unwrap();
        let mut state = SiteRunState::new("s");
        state.record_success(10, FetchLayer::Http, Utc::now());
        store.save_run_state(&state).await.unwrap();
        let orch = orchestrator(store, MapFetcher::new());

        assert!(orch.rediscovery_candidates().await.unwrap().is_empty());
    }
}
