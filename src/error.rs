// src/error.rs

//! Unified error handling for the harvester.

use std::fmt;

use thiserror::Error;

use crate::fetch::FetchError;

/// Result type alias for harvester operations.
pub type Result<T> = std::result::Result<T, AppError>;

/// Unified application error type.
#[derive(Error, Debug)]
pub enum AppError {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP request failed outside the fetch layer
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parsing failed
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// URL parsing failed
    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),

    /// Page retrieval failed on every layer
    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    /// CSS selector parsing failed
    #[error("Invalid selector '{selector}': {message}")]
    Selector { selector: String, message: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Data validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Structure discovery error
    #[error("Discovery error: {0}")]
    Discovery(String),

    /// Scraping error
    #[error("Scrape error for {context}: {message}")]
    Scrape { context: String, message: String },

    /// Unique dedup key already present in the store
    #[error("Duplicate dedup key: {0}")]
    DuplicateKey(String),

    /// Conditional write lost to a newer revision of the same record
    #[error("Concurrent write to {0}")]
    Conflict(String),

    /// Persistent store failure
    #[error("Store error: {0}")]
    Store(String),

    /// A single-flight operation is already in progress
    #[error("{0} is already running")]
    AlreadyRunning(&'static str),

    /// Referenced entity does not exist
    #[error("Not found: {0}")]
    NotFound(String),
}

impl AppError {
    /// Create a selector parsing error.
    pub fn selector(selector: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::Selector {
            selector: selector.into(),
            message: message.to_string(),
        }
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create a discovery error.
    pub fn discovery(message: impl Into<String>) -> Self {
        Self::Discovery(message.into())
    }

    /// Create a scrape error with context.
    pub fn scrape(context: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::Scrape {
            context: context.into(),
            message: message.to_string(),
        }
    }

    /// Create a store error.
    pub fn store(message: impl fmt::Display) -> Self {
        Self::Store(message.to_string())
    }
}
