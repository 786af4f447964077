// src/services/extract.rs

//! Optional text-extraction oracle.
//!
//! An external service may turn raw card or page HTML into structured
//! fields. The scraper only consults it to fill gaps; a failure never drops
//! a record that already has a detail link.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::models::RawRecord;

/// Best-effort structured extraction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Extraction {
    pub first_auction_value: Option<f64>,
    pub second_auction_value: Option<f64>,
    pub evaluation_value: Option<f64>,
    pub address: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub description: Option<String>,
    /// Auction dates as written on the page
    #[serde(default)]
    pub auction_dates: Vec<String>,
}

impl Extraction {
    /// Fill the record's missing fields; present fields are never overwritten.
    pub fn fill_gaps(&self, record: &mut RawRecord) {
        fn fill<T: Clone>(slot: &mut Option<T>, value: &Option<T>) {
            if slot.is_none() {
                slot.clone_from(value);
            }
        }

        fill(&mut record.first_auction_value, &self.first_auction_value);
        fill(&mut record.second_auction_value, &self.second_auction_value);
        fill(&mut record.evaluation_value, &self.evaluation_value);
        fill(&mut record.address, &self.address);
        fill(&mut record.city, &self.city);
        fill(&mut record.state, &self.state);
        if record.title.is_none() {
            record.title = self.description.clone();
        }
    }
}

/// External extraction service.
#[async_trait]
pub trait TextExtractor: Send + Sync {
    /// Extract fields from HTML; an `Err` is the explicit failure signal.
    async fn extract(&self, html: &str, url: &str) -> Result<Extraction>;
}
