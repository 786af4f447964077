// src/models/run_state.rs

//! Per-site harvest status owned by the orchestrator.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::fetch::FetchLayer;

/// Harvest status of a site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScrapeStatus {
    #[default]
    Pending,
    Success,
    Error,
    NeedsPlaywright,
    Disabled,
}

impl fmt::Display for ScrapeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ScrapeStatus::Pending => "pending",
            ScrapeStatus::Success => "success",
            ScrapeStatus::Error => "error",
            ScrapeStatus::NeedsPlaywright => "needs_playwright",
            ScrapeStatus::Disabled => "disabled",
        };
        write!(f, "{s}")
    }
}

/// Classified cause of a failed site run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Diagnosis {
    DnsFailure,
    SiteOffline,
    Cloudflare,
    DynamicContent,
    Timeout,
    ServerError,
    Maintenance,
    RateLimited,
    NoPropertiesFound,
    Unknown,
}

impl fmt::Display for Diagnosis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Diagnosis::DnsFailure => "DNS_FAILURE",
            Diagnosis::SiteOffline => "SITE_OFFLINE",
            Diagnosis::Cloudflare => "CLOUDFLARE",
            Diagnosis::DynamicContent => "DYNAMIC_CONTENT",
            Diagnosis::Timeout => "TIMEOUT",
            Diagnosis::ServerError => "SERVER_ERROR",
            Diagnosis::Maintenance => "MAINTENANCE",
            Diagnosis::RateLimited => "RATE_LIMITED",
            Diagnosis::NoPropertiesFound => "NO_PROPERTIES_FOUND",
            Diagnosis::Unknown => "UNKNOWN",
        };
        write!(f, "{s}")
    }
}

/// Run bookkeeping for one site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteRunState {
    pub site_id: String,
    #[serde(default)]
    pub status: ScrapeStatus,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub last_run_at: Option<DateTime<Utc>>,
    /// Property count of the last successful run
    #[serde(default)]
    pub last_count: Option<usize>,
    #[serde(default)]
    pub consecutive_failures: u32,
    /// Successful runs in a row whose count equalled the previous one
    #[serde(default)]
    pub unchanged_runs: u32,
    #[serde(default)]
    pub last_diagnosis: Option<Diagnosis>,
    /// Fetch layer that last produced content for this site
    #[serde(default)]
    pub last_layer: Option<FetchLayer>,
}

impl SiteRunState {
    pub fn new(site_id: impl Into<String>) -> Self {
        Self {
            site_id: site_id.into(),
            status: ScrapeStatus::Pending,
            last_error: None,
            last_run_at: None,
            last_count: None,
            consecutive_failures: 0,
            unchanged_runs: 0,
            last_diagnosis: None,
            last_layer: None,
        }
    }

    /// Record a successful run.
    pub fn record_success(&mut self, count: usize, layer: FetchLayer, at: DateTime<Utc>) {
        if self.status == ScrapeStatus::Success && self.last_count == Some(count) {
            self.unchanged_runs += 1;
        } else {
            self.unchanged_runs = 0;
        }
        self.status = ScrapeStatus::Success;
        self.last_error = None;
        self.last_diagnosis = None;
        self.last_run_at = Some(at);
        self.last_count = Some(count);
        self.consecutive_failures = 0;
        self.last_layer = Some(layer);
    }

    /// Record a failed run with the status chosen by the auto-fix policy.
    pub fn record_failure(
        &mut self,
        status: ScrapeStatus,
        diagnosis: Diagnosis,
        message: impl Into<String>,
        at: DateTime<Utc>,
    ) {
        self.status = status;
        self.last_diagnosis = Some(diagnosis);
        self.last_error = Some(message.into());
        self.last_run_at = Some(at);
        self.consecutive_failures += 1;
        self.unchanged_runs = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unchanged_runs_counts_equal_successes() {
        let now = Utc::now();
        let mut state = SiteRunState::new("s");
        state.record_success(10, FetchLayer::Http, now);
        state.record_success(10, FetchLayer::Http, now);
        state.record_success(10, FetchLayer::Http, now);
        assert_eq!(state.unchanged_runs, 2);

        state.record_success(11, FetchLayer::Http, now);
        assert_eq!(state.unchanged_runs, 0);
    }

    #[test]
    fn test_failure_resets_streaks() {
        let now = Utc::now();
        let mut state = SiteRunState::new("s");
        state.record_success(10, FetchLayer::Browser, now);
        state.record_failure(ScrapeStatus::Pending, Diagnosis::Timeout, "slow", now);
        state.record_failure(ScrapeStatus::Pending, Diagnosis::Timeout, "slow", now);

        assert_eq!(state.consecutive_failures, 2);
        assert_eq!(state.unchanged_runs, 0);
        assert_eq!(state.last_layer, Some(FetchLayer::Browser));
        assert_eq!(state.last_count, Some(10));
    }

    #[test]
    fn test_diagnosis_serializes_as_code() {
        let json = serde_json::to_string(&Diagnosis::DnsFailure).unwrap();
        assert_eq!(json, "\"DNS_FAILURE\"");
        assert_eq!(Diagnosis::NoPropertiesFound.to_string(), "NO_PROPERTIES_FOUND");
    }
}
