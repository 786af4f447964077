// src/pipeline/diagnosis.rs

//! Failure classification and the auto-fix policy.
//!
//! Classification (error → [`Diagnosis`]) and policy ([`Diagnosis`] →
//! [`ScrapeStatus`]) are separate functions so each can change on its own.

use crate::error::AppError;
use crate::fetch::{FailureKind, FetchError, FetchLayer};
use crate::models::{Diagnosis, ScrapeStatus};

/// Classify a failure of the fetch layer.
pub fn classify_fetch(error: &FetchError) -> Diagnosis {
    match error.kind {
        FailureKind::Dns => Diagnosis::DnsFailure,
        FailureKind::Connection => Diagnosis::SiteOffline,
        FailureKind::Timeout => Diagnosis::Timeout,
        FailureKind::ChallengeDetected => Diagnosis::Cloudflare,
        FailureKind::EmptyBody => Diagnosis::DynamicContent,
        FailureKind::HttpStatus => match error.status {
            Some(404) | Some(410) => Diagnosis::SiteOffline,
            Some(403) => Diagnosis::Cloudflare,
            Some(429) => Diagnosis::RateLimited,
            Some(503) => Diagnosis::Maintenance,
            Some(status) if status >= 500 => Diagnosis::ServerError,
            _ => Diagnosis::Unknown,
        },
        FailureKind::Browser => classify_message(&error.message),
        FailureKind::Unavailable => Diagnosis::Unknown,
    }
}

/// Classify any site-run error.
pub fn classify(error: &AppError) -> Diagnosis {
    match error {
        AppError::Fetch(e) => classify_fetch(e),
        AppError::Discovery(_) | AppError::Scrape { .. } => Diagnosis::NoPropertiesFound,
        AppError::Http(e) if e.is_timeout() => Diagnosis::Timeout,
        AppError::Http(e) if e.is_connect() => Diagnosis::SiteOffline,
        other => classify_message(&other.to_string()),
    }
}

/// Classify a run that fetched pages but produced no records.
///
/// A sparse script shell served over plain HTTP needs a browser; anything
/// else simply had no listings.
pub fn classify_empty(sparse_first_page: bool, layer: Option<FetchLayer>) -> Diagnosis {
    if sparse_first_page && layer.is_none_or(|l| l == FetchLayer::Http) {
        Diagnosis::DynamicContent
    } else {
        Diagnosis::NoPropertiesFound
    }
}

/// Fallback classification of free-text error messages.
fn classify_message(message: &str) -> Diagnosis {
    let lower = message.to_lowercase().replace('_', " ");
    if lower.contains("name not resolved") || lower.contains("dns") {
        Diagnosis::DnsFailure
    } else if lower.contains("timed out") || lower.contains("timeout") {
        Diagnosis::Timeout
    } else if lower.contains("connection refused")
        || lower.contains("connection reset")
        || lower.contains("unreachable")
    {
        Diagnosis::SiteOffline
    } else if lower.contains("manutenção") || lower.contains("maintenance") {
        Diagnosis::Maintenance
    } else {
        Diagnosis::Unknown
    }
}

/// Status a site moves to after a failed run.
pub fn auto_fix(diagnosis: Diagnosis) -> ScrapeStatus {
    match diagnosis {
        Diagnosis::DnsFailure | Diagnosis::SiteOffline => ScrapeStatus::Disabled,
        Diagnosis::Cloudflare | Diagnosis::DynamicContent => ScrapeStatus::NeedsPlaywright,
        Diagnosis::Timeout
        | Diagnosis::ServerError
        | Diagnosis::Maintenance
        | Diagnosis::RateLimited => ScrapeStatus::Pending,
        Diagnosis::NoPropertiesFound | Diagnosis::Unknown => ScrapeStatus::Error,
    }
}
