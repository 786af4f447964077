//! Service layer for the harvester.
//!
//! This module contains the site-facing logic for:
//! - Structure discovery (`StructureDiscovery`)
//! - Config-driven scraping of HTML and API sites (`SiteScraper`)
//! - Selector compilation and listing-link matching (`CompiledSelectors`, `LinkMatcher`)
//! - External providers: geocoding (`Geocoder`) and text extraction (`TextExtractor`)

pub mod api;
pub mod discovery;
pub mod extract;
pub mod geocoding;
pub mod scraper;
pub mod selectors;

pub use discovery::{
    DiscoveryResult, Revalidation, SelectorDecision, SiteType, StructureDiscovery,
};
pub use extract::{Extraction, TextExtractor};
pub use geocoding::{GeocodeOutcome, GeocodeQuery, Geocoder, NominatimGeocoder};
pub use scraper::{ScrapeBudget, ScrapeOutcome, SiteScraper};
pub use selectors::{CompiledSelectors, LinkMatcher};
