// src/fetch/browser.rs

//! Layers 2 and 3: headless Chrome render, optionally with stealth patches.
//!
//! The browser process is launched lazily on first use and closed by
//! [`FetchStrategy::shutdown`]. Every fetch runs in its own incognito browser
//! context holding a single page; the render is bounded by the layer timeout
//! and the page and context are disposed afterwards on every path, so
//! concurrent site runs never share cookies or storage.

use async_trait::async_trait;

use super::{FetchError, FetchLayer, FetchStrategy, FetchedPage};
use crate::models::FetchConfig;

#[cfg(feature = "browser")]
pub use enabled::BrowserStrategy;

#[cfg(not(feature = "browser"))]
pub use disabled::BrowserStrategy;

#[cfg(feature = "browser")]
mod enabled {
    use std::time::Duration;

    use chromiumoxide::Page;
    use chromiumoxide::browser::{Browser, BrowserConfig};
    use chromiumoxide::cdp::browser_protocol::network::SetUserAgentOverrideParams;
    use chromiumoxide::cdp::browser_protocol::page::{
        AddScriptToEvaluateOnNewDocumentParams, NavigateParams,
    };
    use chromiumoxide::cdp::browser_protocol::browser::BrowserContextId;
    use chromiumoxide::cdp::browser_protocol::target::{
        CreateBrowserContextParams, CreateTargetParams,
        DisposeBrowserContextParams,
    };
    use futures::StreamExt;
    use tokio::sync::{RwLock, RwLockReadGuard};
    use tokio::time::Instant;

    use super::super::{FailureKind, within};
    use super::super::stealth::{STEALTH_ARGS, STEALTH_SCRIPTS};
    use super::*;

    /// Bound on closing a page or disposing a context.
    const RELEASE_TIMEOUT: Duration = Duration::from_secs(2);

    /// Resolves once the document is interactive, or after ten seconds.
    const WAIT_FOR_READY_SCRIPT: &str = r#"
        new Promise((resolve) => {
            if (document.readyState === 'complete' || document.readyState === 'interactive') {
                resolve(document.readyState);
            } else {
                document.addEventListener('DOMContentLoaded', () => resolve(document.readyState));
                setTimeout(() => resolve('timeout'), 10000);
            }
        })
    "#;

    /// Headless Chrome strategy.
    pub struct BrowserStrategy {
        stealth: bool,
        headless: bool,
        user_agent: String,
        settle: Duration,
        chrome_args: Vec<String>,
        browser: RwLock<Option<Browser>>,
    }

    impl BrowserStrategy {
        pub fn new(config: &FetchConfig, stealth: bool) -> Self {
            Self {
                stealth,
                headless: config.headless,
                user_agent: config.user_agent.clone(),
                settle: Duration::from_millis(config.browser_settle_ms),
                chrome_args: config.chrome_args.clone(),
                browser: RwLock::new(None),
            }
        }

        /// Shared access to the running browser, launching it if needed.
        async fn browser(&self) -> Result<RwLockReadGuard<'_, Option<Browser>>, FetchError> {
            {
                let running = self.browser.read().await;
                if running.is_some() {
                    return Ok(running);
                }
            }
            let mut slot = self.browser.write().await;
            if slot.is_none() {
                *slot = Some(self.launch().await?);
            }
            Ok(slot.downgrade())
        }

        async fn launch(&self) -> Result<Browser, FetchError> {
            log::info!(
                "Launching browser (headless={}, stealth={})",
                self.headless,
                self.stealth
            );

            let mut builder = BrowserConfig::builder()
                .arg("--disable-dev-shm-usage")
                .arg("--no-sandbox")
                .arg("--disable-gpu");
            if !self.headless {
                builder = builder.with_head();
            }
            if self.stealth {
                for arg in STEALTH_ARGS {
                    builder = builder.arg(*arg);
                }
            }
            for arg in &self.chrome_args {
                builder = builder.arg(arg.as_str());
            }

            let config = builder
                .build()
                .map_err(|e| self.error(format!("invalid browser config: {e}")))?;

            let (browser, mut handler) = Browser::launch(config)
                .await
                .map_err(|e| self.error(format!("failed to launch browser: {e}")))?;

            tokio::spawn(async move {
                while let Some(event) = handler.next().await {
                    if event.is_err() {
                        break;
                    }
                }
            });

            Ok(browser)
        }

        fn error(&self, message: String) -> FetchError {
            FetchError::new(FailureKind::Browser, self.layer(), message)
        }

        async fn open_page(
            &self,
            browser: &Browser,
            context: &BrowserContextId,
        ) -> Result<Page, FetchError> {
            let target = CreateTargetParams::builder()
                .url("about:blank")
                .browser_context_id(context.clone())
                .build()
                .map_err(|e| self.error(format!("invalid target: {e}")))?;
            browser
                .new_page(target)
                .await
                .map_err(|e| self.error(format!("failed to open page: {e}")))
        }

        async fn render(&self, page: &Page, url: &str) -> Result<FetchedPage, FetchError> {
            page.execute(SetUserAgentOverrideParams::new(self.user_agent.clone()))
                .await
                .map_err(|e| self.error(format!("user agent override failed: {e}")))?;

            if self.stealth {
                for script in STEALTH_SCRIPTS {
                    if let Err(e) = page
                        .execute(AddScriptToEvaluateOnNewDocumentParams::new(*script))
                        .await
                    {
                        log::debug!("Stealth script injection skipped: {}", e);
                    }
                }
            }

            let navigate = NavigateParams::builder()
                .url(url)
                .build()
                .map_err(|e| self.error(format!("invalid URL: {e}")))?;
            page.execute(navigate)
                .await
                .map_err(|e| classify_navigation(self.layer(), &e.to_string()))?;

            if let Err(e) = page.evaluate(WAIT_FOR_READY_SCRIPT).await {
                log::debug!("Could not check ready state for {}: {}", url, e);
            }
            tokio::time::sleep(self.settle).await;

            let final_url = page
                .url()
                .await
                .ok()
                .flatten()
                .unwrap_or_else(|| url.to_string());
            let body = page
                .content()
                .await
                .map_err(|e| self.error(format!("failed to read content: {e}")))?;

            Ok(FetchedPage {
                status: 200,
                body,
                final_url,
            })
        }
    }

    #[async_trait]
    impl FetchStrategy for BrowserStrategy {
        fn layer(&self) -> FetchLayer {
            if self.stealth {
                FetchLayer::StealthBrowser
            } else {
                FetchLayer::Browser
            }
        }

        async fn fetch_page(&self, url: &str, limit: Duration) -> Result<FetchedPage, FetchError> {
            let deadline = Instant::now() + limit;
            let remaining = || deadline.saturating_duration_since(Instant::now());

            let running = within(self.layer(), limit, self.browser()).await?;
            let browser = running
                .as_ref()
                .ok_or_else(|| self.error("browser is not running".to_string()))?;

            let context = within(self.layer(), remaining(), async {
                browser
                    .execute(CreateBrowserContextParams::default())
                    .await
                    .map_err(|e| self.error(format!("failed to create browser context: {e}")))
            })
            .await?
            .result
            .browser_context_id;

            // Disposing the context also closes a page left half-open here.
            let opened = within(self.layer(), remaining(), self.open_page(browser, &context)).await;
            let result = match opened {
                Ok(page) => {
                    let result = within(self.layer(), remaining(), self.render(&page, url)).await;
                    match tokio::time::timeout(RELEASE_TIMEOUT, page.close()).await {
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) => log::debug!("Failed to close page for {}: {}", url, e),
                        Err(_) => log::debug!("Timed out closing page for {}", url),
                    }
                    result
                }
                Err(e) => Err(e),
            };

            let dispose = browser.execute(DisposeBrowserContextParams::new(context));
            match tokio::time::timeout(RELEASE_TIMEOUT, dispose).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => log::warn!("Failed to dispose browser context: {}", e),
                Err(_) => log::warn!("Timed out disposing browser context"),
            }
            result
        }

        async fn shutdown(&self) {
            let Some(mut browser) = self.browser.write().await.take() else {
                return;
            };
            log::info!("Closing {} browser", self.layer());
            if let Err(e) = browser.close().await {
                log::warn!("Failed to close browser: {}", e);
            }
            if let Err(e) = browser.wait().await {
                log::debug!("Browser process did not exit cleanly: {}", e);
            }
        }
    }

    /// Chrome reports navigation failures as `net::ERR_*` strings.
    fn classify_navigation(layer: FetchLayer, message: &str) -> FetchError {
        let kind = if message.contains("ERR_NAME_NOT_RESOLVED") {
            FailureKind::Dns
        } else if message.contains("ERR_TIMED_OUT") {
            FailureKind::Timeout
        } else if message.contains("ERR_CONNECTION") {
            FailureKind::Connection
        } else {
            FailureKind::Browser
        };
        FetchError::new(kind, layer, message.to_string())
    }
}

#[cfg(not(feature = "browser"))]
mod disabled {
    use std::time::Duration;

    use super::*;

    /// Placeholder used when the crate is built without browser support.
    pub struct BrowserStrategy {
        stealth: bool,
    }

    impl BrowserStrategy {
        pub fn new(_config: &FetchConfig, stealth: bool) -> Self {
            Self { stealth }
        }
    }

    #[async_trait]
    impl FetchStrategy for BrowserStrategy {
        fn layer(&self) -> FetchLayer {
            if self.stealth {
                FetchLayer::StealthBrowser
            } else {
                FetchLayer::Browser
            }
        }

        async fn fetch_page(
            &self,
            _url: &str,
            _limit: Duration,
        ) -> Result<FetchedPage, FetchError> {
            Err(FetchError::unavailable(self.layer()))
        }
    }
}
