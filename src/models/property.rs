// src/models/property.rs

//! Listing records: the ephemeral scrape output and the stored entity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One listing as extracted from a page, before normalization.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub source_url: String,
    pub title: Option<String>,
    pub first_auction_value: Option<f64>,
    pub second_auction_value: Option<f64>,
    pub evaluation_value: Option<f64>,
    pub address: Option<String>,
    pub neighborhood: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub category: Option<String>,
    pub image_urls: Vec<String>,
    /// Provider identifier (API offers)
    pub external_id: Option<String>,
}

impl RawRecord {
    pub fn new(source_url: impl Into<String>) -> Self {
        Self {
            source_url: source_url.into(),
            ..Self::default()
        }
    }

    pub fn has_price(&self) -> bool {
        self.first_auction_value.is_some()
            || self.second_auction_value.is_some()
            || self.evaluation_value.is_some()
    }

    pub fn has_location(&self) -> bool {
        self.city.is_some() || self.address.is_some()
    }
}

/// Geocoding progress stored on the record itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GeocodeStatus {
    #[default]
    Pending,
    Success,
    Failed,
    /// Address too sparse to geocode
    Skipped,
}

/// Canonical stored listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyRecord {
    pub id: String,
    pub dedup_key: String,
    pub source_url: String,
    pub auctioneer_id: String,
    pub auctioneer_name: String,
    pub title: Option<String>,
    pub category: Option<String>,
    pub address: Option<String>,
    pub neighborhood: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub first_auction_value: Option<f64>,
    pub second_auction_value: Option<f64>,
    pub evaluation_value: Option<f64>,
    pub image_url: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    #[serde(default)]
    pub geocode_status: GeocodeStatus,
    #[serde(default)]
    pub geocode_attempts: u32,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deactivated_at: Option<DateTime<Utc>>,
    /// Last harvest that saw this listing
    pub last_seen_at: DateTime<Utc>,
    /// Last link-health probe
    #[serde(default)]
    pub last_checked_at: Option<DateTime<Utc>>,
    /// Bumped by the store on every write
    #[serde(default)]
    pub revision: u64,
}

impl PropertyRecord {
    pub fn has_coordinates(&self) -> bool {
        self.latitude.is_some() && self.longitude.is_some()
    }

    /// Whether the geocoding queue should pick this record up.
    pub fn is_geocode_eligible(&self, max_attempts: u32) -> bool {
        self.is_active
            && self
                .address
                .as_deref()
                .is_some_and(|a| !a.trim().is_empty())
            && !self.has_coordinates()
            && self.geocode_status != GeocodeStatus::Skipped
            && self.geocode_attempts < max_attempts
    }

    /// Mark inactive. Returns `false` (and changes nothing) if already inactive.
    pub fn deactivate(&mut self, at: DateTime<Utc>) -> bool {
        if !self.is_active {
            return false;
        }
        self.is_active = false;
        self.deactivated_at = Some(at);
        self.updated_at = at;
        true
    }

    /// Location fields as compared for geocode invalidation.
    pub fn location_key(&self) -> (Option<&str>, Option<&str>, Option<&str>) {
        (
            self.address.as_deref(),
            self.city.as_deref(),
            self.state.as_deref(),
        )
    }
}


#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::fixtures::property;
    use super::*;

    #[test]
    fn test_deactivate_is_idempotent() {
        let mut record = property("k1", "site");
        let first = Utc::now();
        assert!(record.deactivate(first));
        assert!(!record.deactivate(first + Duration::hours(1)));
        assert_eq!(record.deactivated_at, Some(first));
    }

    #[test]
    fn test_geocode_eligibility() {
        let mut record = property("k1", "site");
        assert!(record.is_geocode_eligible(3));

        record.geocode_attempts = 3;
        assert!(!record.is_geocode_eligible(3));

        record.geocode_attempts = 0;
        record.geocode_status = GeocodeStatus::Skipped;
        assert!(!record.is_geocode_eligible(3));

        record.geocode_status = GeocodeStatus::Pending;
        record.latitude = Some(-25.4);
        record.longitude = Some(-49.2);
        assert!(!record.is_geocode_eligible(3));
    }
}
