// src/fetch/mod.rs

//! Page retrieval with escalating fetch layers.
//!
//! A fetch walks an ordered list of [`FetchStrategy`] implementations
//! (plain HTTP, headless browser, stealth browser). Each layer runs under its
//! own timeout and the next layer is only tried when the current one errors,
//! times out, returns an empty body or returns a bot-challenge page.
//!
//! The fetcher remembers, per site, the layer that last worked so the next
//! fetch for that site starts there instead of paying for the cheaper layers
//! again.

pub mod browser;
pub mod challenge;
pub mod http;
pub mod stealth;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::models::FetchConfig;

pub use browser::BrowserStrategy;
pub use challenge::ChallengeDetector;
pub use http::HttpStrategy;

/// One retrieval strategy, ordered by cost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchLayer {
    Http = 1,
    Browser = 2,
    StealthBrowser = 3,
}

impl FetchLayer {
    /// Numeric layer index (1-based).
    pub fn index(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for FetchLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FetchLayer::Http => "http",
            FetchLayer::Browser => "browser",
            FetchLayer::StealthBrowser => "stealth_browser",
        };
        write!(f, "{name}")
    }
}

/// Category of a fetch failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    Dns,
    Connection,
    HttpStatus,
    ChallengeDetected,
    EmptyBody,
    Browser,
    Unavailable,
}

/// Typed failure of a fetch layer or of the whole escalation chain.
#[derive(Debug, Clone, Error)]
#[error("{kind:?} on {layer}: {message}")]
pub struct FetchError {
    pub kind: FailureKind,
    pub layer: FetchLayer,
    pub status: Option<u16>,
    pub message: String,
}

impl FetchError {
    pub fn new(kind: FailureKind, layer: FetchLayer, message: impl Into<String>) -> Self {
        Self {
            kind,
            layer,
            status: None,
            message: message.into(),
        }
    }

    pub fn timeout(layer: FetchLayer, after: Duration) -> Self {
        Self::new(
            FailureKind::Timeout,
            layer,
            format!("timed out after {}s", after.as_secs()),
        )
    }

    pub fn http_status(layer: FetchLayer, status: u16, message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::HttpStatus,
            layer,
            status: Some(status),
            message: message.into(),
        }
    }

    pub fn unavailable(layer: FetchLayer) -> Self {
        Self::new(
            FailureKind::Unavailable,
            layer,
            "layer not available in this build",
        )
    }

    /// Whether trying a stronger layer can change the outcome.
    ///
    /// Name resolution failures and definitive "gone" statuses look the same
    /// to every layer.
    pub fn is_escalatable(&self) -> bool {
        match self.kind {
            FailureKind::Dns => false,
            FailureKind::HttpStatus => !matches!(self.status, Some(404) | Some(410)),
            _ => true,
        }
    }
}

/// Raw page returned by a single strategy.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub status: u16,
    pub body: String,
    pub final_url: String,
}

/// Outcome of an escalating fetch.
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub status: u16,
    pub body: String,
    pub final_url: String,
    /// Layer that produced the body
    pub layer_used: FetchLayer,
    /// Number of layers attempted, including the successful one
    pub attempts: usize,
    /// Last failure seen on a cheaper layer before success
    pub error: Option<FetchError>,
}

/// Per-call fetch options.
#[derive(Debug, Clone)]
pub struct FetchOptions {
    /// Key under which the last good layer is remembered (usually the site id)
    pub site_key: Option<String>,
    /// Explicit first layer; overrides the remembered hint
    pub start_layer: Option<FetchLayer>,
    /// Strongest layer that may be used
    pub max_layer: FetchLayer,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            site_key: None,
            start_layer: None,
            max_layer: FetchLayer::StealthBrowser,
        }
    }
}

impl FetchOptions {
    /// Options for a site, remembering its last good layer.
    pub fn for_site(site_id: impl Into<String>) -> Self {
        Self {
            site_key: Some(site_id.into()),
            ..Self::default()
        }
    }

    /// Restrict the chain to the plain HTTP layer.
    pub fn http_only(mut self) -> Self {
        self.max_layer = FetchLayer::Http;
        self
    }

    /// Begin at the given layer.
    pub fn starting_at(mut self, layer: Option<FetchLayer>) -> Self {
        self.start_layer = layer;
        self
    }
}

/// A single retrieval strategy.
#[async_trait]
pub trait FetchStrategy: Send + Sync {
    /// The layer this strategy implements.
    fn layer(&self) -> FetchLayer;

    /// Retrieve one page within `limit`.
    ///
    /// Implementations bound their own work with [`within`] so that anything
    /// they opened (pages, browser contexts) is released on every path,
    /// timeouts included.
    async fn fetch_page(&self, url: &str, limit: Duration) -> Result<FetchedPage, FetchError>;

    /// Release long-lived resources such as a browser process.
    async fn shutdown(&self) {}
}

/// Capability to retrieve a page, whatever the strategy.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str, options: &FetchOptions) -> Result<FetchResult, FetchError>;

    /// Release long-lived resources. Fetching after shutdown may relaunch them.
    async fn shutdown(&self) {}
}

/// Time allowed past a layer's own limit for it to release its resources.
const RELEASE_GRACE: Duration = Duration::from_secs(5);

/// Run `work` under `limit`, mapping expiry to a timeout error of `layer`.
pub async fn within<T, F>(layer: FetchLayer, limit: Duration, work: F) -> Result<T, FetchError>
where
    F: std::future::Future<Output = Result<T, FetchError>>,
{
    tokio::time::timeout(limit, work)
        .await
        .map_err(|_| FetchError::timeout(layer, limit))?
}

/// Fetcher escalating through ordered strategies.
pub struct EscalatingFetcher {
    strategies: Vec<Arc<dyn FetchStrategy>>,
    timeouts: HashMap<FetchLayer, Duration>,
    detector: ChallengeDetector,
    hints: RwLock<HashMap<String, FetchLayer>>,
}

impl EscalatingFetcher {
    /// Create a fetcher from explicit strategies; they are sorted by layer.
    pub fn new(
        mut strategies: Vec<Arc<dyn FetchStrategy>>,
        detector: ChallengeDetector,
        default_timeout: Duration,
    ) -> Self {
        strategies.sort_by_key(|s| s.layer());
        let timeouts = strategies
            .iter()
            .map(|s| (s.layer(), default_timeout))
            .collect();

        Self {
            strategies,
            timeouts,
            detector,
            hints: RwLock::new(HashMap::new()),
        }
    }

    /// Build the standard three-layer chain from configuration.
    pub fn from_config(config: &FetchConfig) -> crate::error::Result<Self> {
        let strategies: Vec<Arc<dyn FetchStrategy>> = vec![
            Arc::new(HttpStrategy::new(config)?),
            Arc::new(BrowserStrategy::new(config, false)),
            Arc::new(BrowserStrategy::new(config, true)),
        ];

        let mut fetcher = Self::new(
            strategies,
            ChallengeDetector::new(&config.challenge_markers),
            Duration::from_secs(config.browser_timeout_secs),
        );
        fetcher.set_timeout(
            FetchLayer::Http,
            Duration::from_secs(config.http_timeout_secs),
        );
        Ok(fetcher)
    }

    /// Override the timeout of one layer.
    pub fn set_timeout(&mut self, layer: FetchLayer, timeout: Duration) {
        self.timeouts.insert(layer, timeout);
    }

    /// The remembered last good layer for a site key.
    pub async fn hint(&self, site_key: &str) -> Option<FetchLayer> {
        self.hints.read().await.get(site_key).copied()
    }

    fn timeout_for(&self, layer: FetchLayer) -> Duration {
        self.timeouts
            .get(&layer)
            .copied()
            .unwrap_or(Duration::from_secs(30))
    }

    /// Run one strategy under its timeout and apply the content checks.
    async fn attempt(
        &self,
        strategy: &dyn FetchStrategy,
        url: &str,
    ) -> Result<FetchedPage, FetchError> {
        let layer = strategy.layer();
        let limit = self.timeout_for(layer);

        // The strategy enforces `limit` itself and releases within the grace;
        // the outer bound only catches one that never returns.
        let page = tokio::time::timeout(limit + RELEASE_GRACE, strategy.fetch_page(url, limit))
            .await
            .map_err(|_| FetchError::timeout(layer, limit))??;

        if page.body.trim().is_empty() {
            return Err(FetchError::new(
                FailureKind::EmptyBody,
                layer,
                "empty response body",
            ));
        }

        if let Some(marker) = self.detector.detect(&page.body) {
            return Err(FetchError {
                kind: FailureKind::ChallengeDetected,
                layer,
                status: Some(page.status),
                message: format!("challenge page detected ('{marker}')"),
            });
        }

        Ok(page)
    }
}

#[async_trait]
impl Fetcher for EscalatingFetcher {
    async fn fetch(&self, url: &str, options: &FetchOptions) -> Result<FetchResult, FetchError> {
        let hinted = match (&options.start_layer, &options.site_key) {
            (Some(layer), _) => Some(*layer),
            (None, Some(key)) => self.hint(key).await,
            (None, None) => None,
        };
        let start = hinted
            .unwrap_or(FetchLayer::Http)
            .min(options.max_layer);

        let mut attempts = 0;
        let mut last_error: Option<FetchError> = None;

        for strategy in self
            .strategies
            .iter()
            .filter(|s| s.layer() >= start && s.layer() <= options.max_layer)
        {
            let layer = strategy.layer();
            attempts += 1;

            match self.attempt(strategy.as_ref(), url).await {
                Ok(page) => {
                    if let Some(key) = &options.site_key {
                        self.hints.write().await.insert(key.clone(), layer);
                    }
                    log::debug!("Fetched {} via {} ({} attempt(s))", url, layer, attempts);

                    return Ok(FetchResult {
                        status: page.status,
                        body: page.body,
                        final_url: page.final_url,
                        layer_used: layer,
                        attempts,
                        error: last_error,
                    });
                }
                Err(e) if e.kind == FailureKind::Unavailable => {
                    log::debug!("Layer {} unavailable for {}", layer, url);
                    if last_error.is_none() {
                        last_error = Some(e);
                    }
                    break;
                }
                Err(e) => {
                    log::debug!("Layer {} failed for {}: {}", layer, url, e);
                    let escalate = e.is_escalatable();
                    last_error = Some(e);
                    if !escalate {
                        break;
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            FetchError::new(
                FailureKind::Unavailable,
                start,
                "no fetch layer configured for this range",
            )
        }))
    }

    async fn shutdown(&self) {
        for strategy in &self.strategies {
            strategy.shutdown().await;
        }
    }
}
