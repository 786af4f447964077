// src/fetch/http.rs

//! Layer 1: direct HTTP GET with a browser-like header set.

use std::error::Error as StdError;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE, HeaderMap, HeaderValue};

use super::{FailureKind, FetchError, FetchLayer, FetchStrategy, FetchedPage, within};
use crate::error::{AppError, Result};
use crate::models::FetchConfig;

const ACCEPT_HTML: &str =
    "text/html,application/xhtml+xml,application/xml;q=0.9,application/json;q=0.8,*/*;q=0.7";

/// Plain HTTP strategy backed by a shared `reqwest` client.
#[derive(Clone)]
pub struct HttpStrategy {
    client: Client,
}

impl HttpStrategy {
    /// Create a configured HTTP strategy.
    pub fn new(config: &FetchConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static(ACCEPT_HTML));
        headers.insert(
            ACCEPT_LANGUAGE,
            HeaderValue::from_str(&config.accept_language)
                .map_err(|e| AppError::config(format!("invalid accept_language: {e}")))?,
        );

        // gzip/brotli/deflate are negotiated by the enabled reqwest features.
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .default_headers(headers)
            .redirect(reqwest::redirect::Policy::limited(10))
            .timeout(Duration::from_secs(config.http_timeout_secs))
            .build()?;

        Ok(Self { client })
    }

    /// Access the underlying client (used by collaborators sharing headers).
    pub fn client(&self) -> &Client {
        &self.client
    }
}

#[async_trait]
impl FetchStrategy for HttpStrategy {
    fn layer(&self) -> FetchLayer {
        FetchLayer::Http
    }

    async fn fetch_page(
        &self,
        url: &str,
        limit: Duration,
    ) -> std::result::Result<FetchedPage, FetchError> {
        within(FetchLayer::Http, limit, async {
            let response = self.client.get(url).send().await.map_err(classify)?;
            let status = response.status();
            let final_url = response.url().to_string();
            let body = response.text().await.map_err(classify)?;

            if !status.is_success() {
                return Err(FetchError::http_status(
                    FetchLayer::Http,
                    status.as_u16(),
                    format!("HTTP {} for {}", status, final_url),
                ));
            }

            Ok(FetchedPage {
                status: status.as_u16(),
                body,
                final_url,
            })
        })
        .await
    }
}

/// Map a transport error onto a failure kind.
fn classify(error: reqwest::Error) -> FetchError {
    let chain = error_chain(&error);

    let kind = if error.is_timeout() {
        FailureKind::Timeout
    } else if is_dns_message(&chain) {
        FailureKind::Dns
    } else if error.is_connect() {
        FailureKind::Connection
    } else if error.is_status() {
        FailureKind::HttpStatus
    } else {
        FailureKind::Connection
    };

    FetchError {
        kind,
        layer: FetchLayer::Http,
        status: error.status().map(|s| s.as_u16()),
        message: chain,
    }
}

fn error_chain(error: &reqwest::Error) -> String {
    let mut parts = vec![error.to_string()];
    let mut source = error.source();
    while let Some(inner) = source {
        parts.push(inner.to_string());
        source = inner.source();
    }
    parts.join(": ")
}

pub(crate) fn is_dns_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    [
        "dns error",
        "failed to lookup address",
        "name or service not known",
        "no such host",
        "nodename nor servname",
        "getaddrinfo",
        "enotfound",
    ]
    .iter()
    .any(|needle| lower.contains(needle))
}
