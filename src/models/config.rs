//! Application configuration structures.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

/// Root application configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Page retrieval behavior for every fetch layer
    #[serde(default)]
    pub fetch: FetchConfig,

    /// Structure discovery and rediscovery rules
    #[serde(default)]
    pub discovery: DiscoveryConfig,

    /// Harvest scheduling, politeness and retirement settings
    #[serde(default)]
    pub harvest: HarvestConfig,

    /// Identity key derivation
    #[serde(default)]
    pub dedup: DedupConfig,

    /// Geocoding queue settings
    #[serde(default)]
    pub enrichment: EnrichmentConfig,

    /// Periodic source-URL health checks
    #[serde(default)]
    pub link_health: LinkHealthConfig,

    /// Log output settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Load configuration or return default if loading fails.
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        Self::load(&path).unwrap_or_else(|e| {
            log::warn!(
                "Config load failed from {:?}: {}. Using defaults.",
                path.as_ref(),
                e
            );
            Self::default()
        })
    }

    /// Validate configuration values for basic sanity.
    pub fn validate(&self) -> Result<()> {
        if self.fetch.user_agent.trim().is_empty() {
            return Err(AppError::validation("fetch.user_agent is empty"));
        }
        if self.fetch.http_timeout_secs == 0 || self.fetch.browser_timeout_secs == 0 {
            return Err(AppError::validation("fetch timeouts must be > 0"));
        }
        if self.harvest.max_concurrent == 0 {
            return Err(AppError::validation("harvest.max_concurrent must be > 0"));
        }
        if self.harvest.max_pages == 0 {
            return Err(AppError::validation("harvest.max_pages must be > 0"));
        }
        if self.harvest.max_drop_percent > 100 {
            return Err(AppError::validation(
                "harvest.max_drop_percent must be within 0..=100",
            ));
        }
        for (name, value) in [
            ("discovery.min_confidence", self.discovery.min_confidence),
            ("discovery.replace_threshold", self.discovery.replace_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(AppError::validation(format!(
                    "{name} must be within [0, 1], got {value}"
                )));
            }
        }
        if self.discovery.link_patterns.is_empty() {
            return Err(AppError::validation("discovery.link_patterns is empty"));
        }
        if self.dedup.salt.is_empty() {
            return Err(AppError::validation("dedup.salt is empty"));
        }
        if self.enrichment.batch_size == 0 || self.enrichment.max_batches == 0 {
            return Err(AppError::validation(
                "enrichment.batch_size and enrichment.max_batches must be > 0",
            ));
        }
        if self.enrichment.max_attempts == 0 {
            return Err(AppError::validation("enrichment.max_attempts must be > 0"));
        }
        Ok(())
    }
}

/// HTTP client and browser fetch settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    /// User-Agent header sent by the HTTP layer
    #[serde(default = "defaults::user_agent")]
    pub user_agent: String,

    /// Accept-Language header sent by the HTTP layer
    #[serde(default = "defaults::accept_language")]
    pub accept_language: String,

    /// Timeout of the plain HTTP layer, in seconds
    #[serde(default = "defaults::http_timeout")]
    pub http_timeout_secs: u64,

    /// Timeout of each browser layer, in seconds
    #[serde(default = "defaults::browser_timeout")]
    pub browser_timeout_secs: u64,

    /// Fixed delay after DOM-content-loaded before the page is read
    #[serde(default = "defaults::browser_settle")]
    pub browser_settle_ms: u64,

    /// Run the browser without a visible window
    #[serde(default = "defaults::enabled")]
    pub headless: bool,

    /// Extra Chrome command line switches
    #[serde(default)]
    pub chrome_args: Vec<String>,

    /// Phrases identifying bot-challenge or incompatible-browser pages
    #[serde(default = "defaults::challenge_markers")]
    pub challenge_markers: Vec<String>,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            user_agent: defaults::user_agent(),
            accept_language: defaults::accept_language(),
            http_timeout_secs: defaults::http_timeout(),
            browser_timeout_secs: defaults::browser_timeout(),
            browser_settle_ms: defaults::browser_settle(),
            headless: true,
            chrome_args: Vec::new(),
            challenge_markers: defaults::challenge_markers(),
        }
    }
}

/// Structure discovery settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Minimum confidence for the generic discover-then-scrape path
    #[serde(default = "defaults::min_confidence")]
    pub min_confidence: f64,

    /// Minimum confidence before a stored selector set is overwritten
    #[serde(default = "defaults::replace_threshold")]
    pub replace_threshold: f64,

    /// Number of qualifying cards at which the count score saturates
    #[serde(default = "defaults::count_saturation")]
    pub count_saturation: usize,

    /// Minimum qualifying cards for a candidate selector to count at all
    #[serde(default = "defaults::min_elements")]
    pub min_elements: usize,

    /// Path fragments that identify a listing detail link
    #[serde(default = "defaults::link_patterns")]
    pub link_patterns: Vec<String>,

    /// Consecutive failed runs before a site is rediscovered
    #[serde(default = "defaults::failure_threshold")]
    pub failure_threshold: u32,

    /// Successful runs with an unchanged count before a site is rediscovered
    #[serde(default = "defaults::stagnant_runs")]
    pub stagnant_runs: u32,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            min_confidence: defaults::min_confidence(),
            replace_threshold: defaults::replace_threshold(),
            count_saturation: defaults::count_saturation(),
            min_elements: defaults::min_elements(),
            link_patterns: defaults::link_patterns(),
            failure_threshold: defaults::failure_threshold(),
            stagnant_runs: defaults::stagnant_runs(),
        }
    }
}

/// Harvest scheduling settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarvestConfig {
    /// Maximum sites harvested concurrently
    #[serde(default = "defaults::max_concurrent")]
    pub max_concurrent: usize,

    /// Default politeness delay between page fetches of one site
    #[serde(default = "defaults::page_delay")]
    pub page_delay_ms: u64,

    /// Default per-site item budget
    #[serde(default = "defaults::max_items")]
    pub max_items_per_site: usize,

    /// Default per-site page budget
    #[serde(default = "defaults::max_pages")]
    pub max_pages: u32,

    /// Hours a listing may be absent from full harvests before retirement
    #[serde(default = "defaults::retire_grace_hours")]
    pub retire_grace_hours: i64,

    /// Maximum drop (percent of active listings) tolerated before retirement is skipped
    #[serde(default = "defaults::max_drop_percent")]
    pub max_drop_percent: u8,

    /// Active listing count below which the drop breaker does not apply
    #[serde(default = "defaults::min_baseline")]
    pub min_baseline: usize,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            max_concurrent: defaults::max_concurrent(),
            page_delay_ms: defaults::page_delay(),
            max_items_per_site: defaults::max_items(),
            max_pages: defaults::max_pages(),
            retire_grace_hours: defaults::retire_grace_hours(),
            max_drop_percent: defaults::max_drop_percent(),
            min_baseline: defaults::min_baseline(),
        }
    }
}

/// Dedup key settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    /// Salt mixed into every identity hash
    #[serde(default = "defaults::salt")]
    pub salt: String,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            salt: defaults::salt(),
        }
    }
}

/// Geocoding queue settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichmentConfig {
    /// Records per batch
    #[serde(default = "defaults::enrichment_batch_size")]
    pub batch_size: usize,

    /// Upper bound of batches for a "process all" invocation
    #[serde(default = "defaults::enrichment_max_batches")]
    pub max_batches: usize,

    /// Pause between two provider calls
    #[serde(default = "defaults::geocode_interval")]
    pub request_interval_ms: u64,

    /// Failed attempts after which a record is no longer selected
    #[serde(default = "defaults::geocode_max_attempts")]
    pub max_attempts: u32,

    /// Geocoding provider search endpoint
    #[serde(default = "defaults::geocoder_endpoint")]
    pub endpoint: String,

    /// Country appended to every geocoding query
    #[serde(default = "defaults::country")]
    pub country: String,

    /// User-Agent identifying this application to the provider
    #[serde(default = "defaults::geocoder_user_agent")]
    pub user_agent: String,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            batch_size: defaults::enrichment_batch_size(),
            max_batches: defaults::enrichment_max_batches(),
            request_interval_ms: defaults::geocode_interval(),
            max_attempts: defaults::geocode_max_attempts(),
            endpoint: defaults::geocoder_endpoint(),
            country: defaults::country(),
            user_agent: defaults::geocoder_user_agent(),
        }
    }
}

/// Link-health sweep settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkHealthConfig {
    /// Records probed per sweep
    #[serde(default = "defaults::link_batch")]
    pub batch_size: usize,

    /// Pause between two probes
    #[serde(default = "defaults::link_interval")]
    pub request_interval_ms: u64,

    /// Body phrases meaning the listing is gone even with HTTP 200
    #[serde(default = "defaults::not_found_markers")]
    pub not_found_markers: Vec<String>,
}

impl Default for LinkHealthConfig {
    fn default() -> Self {
        Self {
            batch_size: defaults::link_batch(),
            request_interval_ms: defaults::link_interval(),
            not_found_markers: defaults::not_found_markers(),
        }
    }
}

/// Log output settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default log level when RUST_LOG is unset
    #[serde(default = "defaults::log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: defaults::log_level(),
        }
    }
}

mod defaults {
    // Fetch defaults
    pub fn user_agent() -> String {
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) \
         Chrome/124.0.0.0 Safari/537.36"
            .into()
    }
    pub fn accept_language() -> String {
        "pt-BR,pt;q=0.9,en-US;q=0.8,en;q=0.7".into()
    }
    pub fn http_timeout() -> u64 {
        20
    }
    pub fn browser_timeout() -> u64 {
        45
    }
    pub fn browser_settle() -> u64 {
        2_000
    }
    pub fn enabled() -> bool {
        true
    }
    pub fn challenge_markers() -> Vec<String> {
        vec![
            "just a moment".into(),
            "checking your browser".into(),
            "cf-browser-verification".into(),
            "challenge-platform".into(),
            "attention required".into(),
            "enable javascript and cookies".into(),
            "ddos protection by".into(),
            "navegador incompatível".into(),
            "navegador não suportado".into(),
            "unsupported browser".into(),
            "please enable javascript".into(),
            "access denied".into(),
        ]
    }

    // Discovery defaults
    pub fn min_confidence() -> f64 {
        0.4
    }
    pub fn replace_threshold() -> f64 {
        0.7
    }
    pub fn count_saturation() -> usize {
        12
    }
    pub fn min_elements() -> usize {
        2
    }
    pub fn link_patterns() -> Vec<String> {
        vec![
            "/leilao/".into(),
            "/leiloes/".into(),
            "/lote/".into(),
            "/lotes/".into(),
            "/imovel/".into(),
            "/imoveis/".into(),
            "/item/".into(),
        ]
    }
    pub fn failure_threshold() -> u32 {
        3
    }
    pub fn stagnant_runs() -> u32 {
        5
    }

    // Harvest defaults
    pub fn max_concurrent() -> usize {
        4
    }
    pub fn page_delay() -> u64 {
        3_000
    }
    pub fn max_items() -> usize {
        500
    }
    pub fn max_pages() -> u32 {
        50
    }
    pub fn retire_grace_hours() -> i64 {
        72
    }
    pub fn max_drop_percent() -> u8 {
        50
    }
    pub fn min_baseline() -> usize {
        10
    }

    // Dedup defaults
    pub fn salt() -> String {
        "auction-harvester:v1".into()
    }

    // Enrichment defaults
    pub fn enrichment_batch_size() -> usize {
        50
    }
    pub fn enrichment_max_batches() -> usize {
        20
    }
    pub fn geocode_interval() -> u64 {
        1_100
    }
    pub fn geocode_max_attempts() -> u32 {
        3
    }
    pub fn geocoder_endpoint() -> String {
        "https://nominatim.openstreetmap.org/search".into()
    }
    pub fn country() -> String {
        "Brasil".into()
    }
    pub fn geocoder_user_agent() -> String {
        "auction-harvester/0.1 (listing enrichment)".into()
    }

    // Link health defaults
    pub fn link_batch() -> usize {
        100
    }
    pub fn link_interval() -> u64 {
        500
    }
    pub fn not_found_markers() -> Vec<String> {
        vec![
            "página não encontrada".into(),
            "pagina nao encontrada".into(),
            "lote não encontrado".into(),
            "imóvel não encontrado".into(),
            "leilão encerrado".into(),
            "page not found".into(),
        ]
    }

    // Logging defaults
    pub fn log_level() -> String {
        "info".into()
    }
}
