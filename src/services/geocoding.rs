// src/services/geocoding.rs

//! Address geocoding provider.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::{AppError, Result};
use crate::models::EnrichmentConfig;

/// Address to resolve.
#[derive(Debug, Clone, PartialEq)]
pub struct GeocodeQuery {
    pub address: String,
    pub neighborhood: Option<String>,
    pub city: String,
    pub state: Option<String>,
}

impl GeocodeQuery {
    /// Single-line query string, most specific part first.
    pub fn to_query_string(&self, country: &str) -> String {
        let mut parts = vec![self.address.trim()];
        if let Some(n) = self.neighborhood.as_deref() {
            parts.push(n.trim());
        }
        parts.push(self.city.trim());
        if let Some(s) = self.state.as_deref() {
            parts.push(s.trim());
        }
        if !country.is_empty() {
            parts.push(country);
        }
        parts.retain(|p| !p.is_empty());
        parts.join(", ")
    }
}

/// Provider answer for one query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GeocodeOutcome {
    Found { latitude: f64, longitude: f64 },
    NotFound,
}

/// External address-resolution provider.
#[async_trait]
pub trait Geocoder: Send + Sync {
    /// Resolve an address. `Err` means the provider failed, not "no match".
    async fn geocode(&self, query: &GeocodeQuery) -> Result<GeocodeOutcome>;
}

/// Nominatim API response for geocoding
#[derive(Debug, Deserialize)]
struct NominatimResponse {
    lat: String,
    lon: String,
}

/// OpenStreetMap Nominatim search client.
pub struct NominatimGeocoder {
    client: reqwest::Client,
    endpoint: String,
    country: String,
}

impl NominatimGeocoder {
    pub fn new(config: &EnrichmentConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .timeout(Duration::from_secs(15))
            .build()?;

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            country: config.country.clone(),
        })
    }

    fn search_url(&self, query: &GeocodeQuery) -> String {
        format!(
            "{}?q={}&format=json&limit=1",
            self.endpoint,
            urlencoding::encode(&query.to_query_string(&self.country))
        )
    }
}

#[async_trait]
impl Geocoder for NominatimGeocoder {
    async fn geocode(&self, query: &GeocodeQuery) -> Result<GeocodeOutcome> {
        let url = self.search_url(query);
        log::debug!("Geocoding: {}", query.to_query_string(&self.country));

        let body = self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;

        parse_response(&body)
    }
}

/// First hit of a Nominatim search response, if any.
fn parse_response(body: &str) -> Result<GeocodeOutcome> {
    let hits: Vec<NominatimResponse> = serde_json::from_str(body)?;
    let Some(first) = hits.first() else {
        return Ok(GeocodeOutcome::NotFound);
    };

    let latitude: f64 = first
        .lat
        .parse()
        .map_err(|e| AppError::validation(format!("invalid latitude in response: {e}")))?;
    let longitude: f64 = first
        .lon
        .parse()
        .map_err(|e| AppError::validation(format!("invalid longitude in response: {e}")))?;

    Ok(GeocodeOutcome::Found {
        latitude,
        longitude,
    })
}
