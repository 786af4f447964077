// src/services/scraper.rs

//! Config-driven site scraper.
//!
//! Walks a site's listing pages according to its pagination scheme and turns
//! every card into a [`RawRecord`]. The walk stops when a page has no cards,
//! when the item or page budget is spent, when two consecutive pages bring no
//! new links, or when the batch is cancelled. Parsing is a pure function of
//! the page HTML, so re-running a page yields the same records.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use scraper::{ElementRef, Html};
use tokio_util::sync::CancellationToken;

use crate::error::{AppError, Result};
use crate::fetch::{FetchLayer, FetchOptions, Fetcher, challenge};
use crate::models::{Pagination, RawRecord, SiteConfig, SiteMethod, SiteSelectors};
use crate::services::api;
use crate::services::extract::TextExtractor;
use crate::services::selectors::{CompiledSelectors, LinkMatcher};
use crate::utils::resolve;
use crate::utils::text::{clean_text, evaluation_value, money_values, non_empty, parse_brl, parse_location};

/// Per-site run budget.
#[derive(Debug, Clone, Copy)]
pub struct ScrapeBudget {
    pub max_items: usize,
    pub max_pages: u32,
}

/// Result of walking one site.
#[derive(Debug, Default)]
pub struct ScrapeOutcome {
    /// Raw records in page order; pagination overlap is kept
    pub records: Vec<RawRecord>,
    pub pages_fetched: u32,
    /// The walk ended on its own (no budget cut, no page failure, no cancel)
    pub complete: bool,
    pub cancelled: bool,
    /// Layer that served the last page
    pub layer: Option<FetchLayer>,
    /// First page carried almost no static text
    pub sparse_first_page: bool,
    /// Total reported by an API provider
    pub provider_total: Option<usize>,
}

/// A parsed card and, when fields are missing, its HTML for the oracle.
#[derive(Debug, Clone)]
pub struct ParsedCard {
    pub record: RawRecord,
    pub html: Option<String>,
}

/// Scraper for configured sites.
pub struct SiteScraper {
    fetcher: Arc<dyn Fetcher>,
    links: LinkMatcher,
    extractor: Option<Arc<dyn TextExtractor>>,
    default_delay: Duration,
}

impl SiteScraper {
    pub fn new(fetcher: Arc<dyn Fetcher>, links: LinkMatcher, default_delay: Duration) -> Self {
        Self {
            fetcher,
            links,
            extractor: None,
            default_delay,
        }
    }

    /// Attach a text-extraction oracle for cards with missing fields.
    pub fn with_extractor(mut self, extractor: Arc<dyn TextExtractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    /// Walk a site according to its configured method.
    pub async fn scrape(
        &self,
        site: &SiteConfig,
        budget: ScrapeBudget,
        start_layer: Option<FetchLayer>,
        cancel: &CancellationToken,
    ) -> Result<ScrapeOutcome> {
        let delay = site
            .page_delay_ms
            .map(Duration::from_millis)
            .unwrap_or(self.default_delay);

        match &site.method {
            None => Err(AppError::scrape(&site.site_id, "no extraction method configured")),
            Some(SiteMethod::Api { api }) => {
                api::scrape_api(self.fetcher.as_ref(), site, api, budget, delay, cancel).await
            }
            Some(SiteMethod::HtmlStatic {
                selectors,
                pagination,
                max_pages,
            }) => {
                let budget = cap_pages(budget, *max_pages);
                self.scrape_html(site, selectors, pagination, budget, start_layer, delay, cancel)
                    .await
            }
            Some(SiteMethod::Browser {
                selectors,
                pagination,
                max_pages,
            }) => {
                let budget = cap_pages(budget, *max_pages);
                let start = start_layer
                    .unwrap_or(FetchLayer::Browser)
                    .max(FetchLayer::Browser);
                self.scrape_html(site, selectors, pagination, budget, Some(start), delay, cancel)
                    .await
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn scrape_html(
        &self,
        site: &SiteConfig,
        selectors: &SiteSelectors,
        pagination: &Pagination,
        budget: ScrapeBudget,
        start_layer: Option<FetchLayer>,
        delay: Duration,
        cancel: &CancellationToken,
    ) -> Result<ScrapeOutcome> {
        let compiled = CompiledSelectors::compile(selectors)?;
        let options = FetchOptions::for_site(&site.site_id).starting_at(start_layer);
        let listing_url = site.listing_url();

        let mut outcome = ScrapeOutcome::default();
        let mut seen: HashSet<String> = HashSet::new();
        let mut empty_streak = 0;
        let mut page_no = pagination.start().unwrap_or(1);

        'pages: loop {
            if outcome.pages_fetched >= budget.max_pages {
                log::debug!("{}: page budget of {} reached", site.site_id, budget.max_pages);
                break;
            }
            if outcome.pages_fetched > 0 && !polite_pause(delay, cancel).await {
                outcome.cancelled = true;
                break;
            }
            if cancel.is_cancelled() {
                outcome.cancelled = true;
                break;
            }

            let url = pagination.page_url(listing_url, page_no);
            let page = match self.fetcher.fetch(&url, &options).await {
                Ok(page) => page,
                Err(e) if outcome.pages_fetched == 0 => return Err(e.into()),
                Err(e) => {
                    log::warn!("{}: stopping at page {} ({}): {}", site.site_id, page_no, url, e);
                    break;
                }
            };

            outcome.pages_fetched += 1;
            outcome.layer = Some(page.layer_used);
            if outcome.pages_fetched == 1 {
                outcome.sparse_first_page = challenge::is_sparse(&page.body);
            }

            let cards = self.parse_page(&page.body, &page.final_url, &compiled);
            log::debug!(
                "{}: page {} yielded {} card(s) via {}",
                site.site_id,
                page_no,
                cards.len(),
                page.layer_used
            );
            if cards.is_empty() {
                outcome.complete = true;
                break;
            }

            let mut new_links = 0;
            for card in cards {
                if seen.insert(card.record.source_url.clone()) {
                    new_links += 1;
                }
                let record = self.complete_card(card).await;
                outcome.records.push(record);
                if outcome.records.len() >= budget.max_items {
                    log::debug!("{}: item budget of {} reached", site.site_id, budget.max_items);
                    break 'pages;
                }
            }

            if new_links == 0 {
                empty_streak += 1;
                if empty_streak >= 2 {
                    log::debug!("{}: two pages without new links, stopping", site.site_id);
                    outcome.complete = true;
                    break;
                }
            } else {
                empty_streak = 0;
            }

            if matches!(pagination, Pagination::None) {
                outcome.complete = true;
                break;
            }
            page_no += 1;
        }

        Ok(outcome)
    }

    /// Extract every card with a resolvable detail link from one page.
    pub fn parse_page(
        &self,
        html: &str,
        page_url: &str,
        selectors: &CompiledSelectors,
    ) -> Vec<ParsedCard> {
        let document = Html::parse_document(html);
        document
            .select(&selectors.card)
            .filter_map(|card| self.parse_card(&card, page_url, selectors))
            .collect()
    }

    fn parse_card(
        &self,
        card: &ElementRef<'_>,
        page_url: &str,
        selectors: &CompiledSelectors,
    ) -> Option<ParsedCard> {
        let anchors: Vec<ElementRef<'_>> = card.select(&selectors.link).collect();
        let href = anchors
            .iter()
            .filter_map(|a| a.value().attr("href"))
            .find(|href| self.links.is_listing_link(href))
            .or_else(|| {
                anchors
                    .iter()
                    .filter_map(|a| a.value().attr("href"))
                    .find(|href| resolve(page_url, href).is_some())
            })
            // A card may itself be the link.
            .or_else(|| card.value().attr("href"))?;
        let source_url = resolve(page_url, href)?;

        let mut record = RawRecord::new(source_url);
        let text = element_text(card);

        record.title = selectors
            .title
            .as_ref()
            .and_then(|sel| card.select(sel).next())
            .and_then(|el| non_empty(&element_text(&el)))
            .or_else(|| {
                card.select(&selectors.heading)
                    .next()
                    .and_then(|el| non_empty(&element_text(&el)))
            })
            .or_else(|| {
                anchors
                    .iter()
                    .find_map(|a| non_empty(&element_text(a)).or_else(|| a.value().attr("title").and_then(non_empty)))
            });

        let evaluation = evaluation_value(&text);
        let mut values: Vec<f64> = match &selectors.price {
            Some(sel) => card
                .select(sel)
                .filter_map(|el| parse_brl(&element_text(&el)))
                .collect(),
            None => money_values(&text),
        };
        if let Some(eval) = evaluation
            && let Some(pos) = values.iter().position(|v| *v == eval)
        {
            values.remove(pos);
        }
        record.first_auction_value = values.first().copied();
        record.second_auction_value = values.get(1).copied();
        record.evaluation_value = evaluation;

        let location_text = selectors
            .location
            .as_ref()
            .and_then(|sel| card.select(sel).next())
            .map(|el| element_text(&el));
        match location_text {
            Some(loc) => apply_location(&mut record, &loc, true),
            None => apply_location(&mut record, &text, false),
        }

        record.category = selectors
            .category
            .as_ref()
            .and_then(|sel| card.select(sel).next())
            .and_then(|el| non_empty(&element_text(&el)));

        for img in card.select(&selectors.image) {
            let src = ["data-src", "data-lazy-src", "src"]
                .iter()
                .find_map(|attr| img.value().attr(attr));
            if let Some(url) = src.and_then(|s| resolve(page_url, s))
                && !record.image_urls.contains(&url)
            {
                record.image_urls.push(url);
            }
        }

        let html = (self.extractor.is_some() && !record.has_price() && !record.has_location())
            .then(|| card.html());

        Some(ParsedCard { record, html })
    }

    /// Consult the oracle for cards lacking price and location.
    async fn complete_card(&self, card: ParsedCard) -> RawRecord {
        let mut record = card.record;
        if let (Some(extractor), Some(html)) = (&self.extractor, card.html) {
            match extractor.extract(&html, &record.source_url).await {
                Ok(extraction) => extraction.fill_gaps(&mut record),
                Err(e) => log::debug!("Extraction failed for {}: {}", record.source_url, e),
            }
        }
        record
    }
}

fn cap_pages(budget: ScrapeBudget, site_max: Option<u32>) -> ScrapeBudget {
    ScrapeBudget {
        max_pages: site_max.map_or(budget.max_pages, |m| m.min(budget.max_pages)),
        ..budget
    }
}

/// Sleep between page fetches. Returns `false` if cancelled meanwhile.
pub(crate) async fn polite_pause(delay: Duration, cancel: &CancellationToken) -> bool {
    if delay.is_zero() {
        return !cancel.is_cancelled();
    }
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

fn element_text(element: &ElementRef<'_>) -> String {
    clean_text(&element.text().collect::<Vec<_>>().join(" "))
}

/// Fill city/state (and address, when the text is a dedicated location field).
fn apply_location(record: &mut RawRecord, text: &str, dedicated: bool) {
    match parse_location(text) {
        Some((city, state)) => {
            if dedicated
                && let Some(idx) = text.find(&city)
            {
                let prefix = text[..idx].trim().trim_end_matches([',', '-', '/']).trim();
                record.address = non_empty(prefix);
            }
            record.city = Some(city);
            record.state = Some(state);
        }
        None if dedicated => record.address = non_empty(text),
        None => {}
    }
}
