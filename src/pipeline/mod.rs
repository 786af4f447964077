//! Pipeline entry points.
//!
//! - `HarvestOrchestrator::run_batch`: harvest enabled sites into the store
//! - `HarvestOrchestrator::run_rediscovery`: revalidate failing or stagnant sites
//! - `EnrichmentQueue`: geocode the store's backlog
//! - `LinkHealthChecker`: retire listings whose page is gone

pub mod dedup;
pub mod diagnosis;
pub mod drop_breaker;
pub mod enrichment;
pub mod guard;
pub mod harvest;
pub mod link_health;
pub mod rediscover;
pub mod retire;

pub use dedup::{UpsertReport, UpsertStats, Upserter, dedup_key};
pub use drop_breaker::{DropBreaker, DropBreakerConfig, DropCheck};
pub use enrichment::{BatchStats, EnrichmentQueue};
pub use guard::{RunGuard, RunLease};
pub use harvest::{HarvestOrchestrator, HarvestReport, HarvestRequest, SiteError, SiteReport};
pub use link_health::{LinkHealthChecker, SweepStats};
pub use rediscover::{RediscoveryAction, RediscoveryOutcome};
