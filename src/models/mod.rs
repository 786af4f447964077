// src/models/mod.rs

//! Domain models for the harvester.
//!
//! This module contains all data structures used throughout the application,
//! organized by their primary purpose.

mod config;
mod property;
mod run_state;
mod selectors;
mod site;

// Re-export all public types
pub use config::{
    Config, DedupConfig, DiscoveryConfig, EnrichmentConfig, FetchConfig, HarvestConfig,
    LinkHealthConfig, LoggingConfig,
};
pub use property::{GeocodeStatus, PropertyRecord, RawRecord};
pub use run_state::{Diagnosis, ScrapeStatus, SiteRunState};
pub use selectors::{Pagination, SiteSelectors};
pub use site::{ApiDescriptor, ApiFields, SiteConfig, SiteMethod, SiteRegistry};

#[cfg(test)]
pub(crate) use property::fixtures;
