// src/services/discovery.rs

//! Listing-structure discovery.
//!
//! Fetches a site's listing page and tests a ranked list of card selectors
//! (explicit class names, then `class*=` wildcards, then generic tags). An
//! element only counts as a card when it holds one or two distinct listing
//! links; wrappers around a whole result grid hold many and are ignored.

use std::sync::Arc;

use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::fetch::{FetchLayer, FetchOptions, Fetcher, challenge};
use crate::models::{DiscoveryConfig, Pagination, SiteConfig, SiteMethod, SiteSelectors};
use crate::services::selectors::LinkMatcher;

/// Card selector candidates with their specificity (3 = explicit class,
/// 2 = wildcard, 1 = generic tag), in ranking order.
const CARD_CANDIDATES: &[(&str, u8)] = &[
    ("div.card-lote", 3),
    ("div.card-imovel", 3),
    ("div.card-leilao", 3),
    ("div.lote", 3),
    ("div.imovel", 3),
    ("div.leilao", 3),
    ("div.item-lote", 3),
    ("div.box-lote", 3),
    ("div.property-card", 3),
    ("li.lote", 3),
    ("article.lote", 3),
    ("div[class*='lote']", 2),
    ("div[class*='imovel']", 2),
    ("div[class*='leilao']", 2),
    ("div[class*='property']", 2),
    ("div[class*='card']", 2),
    ("li[class*='item']", 2),
    ("div[class*='item']", 2),
    ("article", 1),
    ("li", 1),
    ("tr", 1),
];

const TITLE_HINTS: &[&str] = &["[class*='titulo']", "[class*='title']"];
const PRICE_HINTS: &[&str] = &["[class*='valor']", "[class*='preco']", "[class*='price']", "[class*='lance']"];
const LOCATION_HINTS: &[&str] = &["[class*='local']", "[class*='cidade']", "[class*='endereco']", "[class*='address']"];

/// How a site renders its listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SiteType {
    /// Cards present in the HTML served over plain HTTP
    Static,
    /// Cards only present after rendering, or a sparse script shell
    Dynamic,
    /// No cards, but the page references a JSON API
    ApiBacked,
}

/// One tested card selector.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub selector: String,
    pub specificity: u8,
    /// Matched elements that hold a qualifying link
    pub count: usize,
    pub confidence: f64,
}

/// Inferred listing structure of one page.
#[derive(Debug, Clone)]
pub struct DiscoveryResult {
    pub site_type: SiteType,
    /// Best selector set, if any candidate reached `min_elements`
    pub selectors: Option<SiteSelectors>,
    pub pagination: Pagination,
    /// Confidence of the best candidate, in `[0, 1]`
    pub confidence: f64,
    pub element_count: usize,
    pub layer_used: FetchLayer,
    /// Page carried scripts and almost no visible text
    pub sparse: bool,
    /// API-looking URLs referenced by the page
    pub api_hints: Vec<String>,
    /// Candidates with at least one card, best first
    pub candidates: Vec<Candidate>,
}

impl DiscoveryResult {
    /// Whether the result is good enough to scrape with.
    pub fn is_usable(&self, min_confidence: f64) -> bool {
        self.selectors.is_some() && self.confidence >= min_confidence
    }

    /// Extraction method for the discovered structure.
    pub fn to_method(&self) -> Option<SiteMethod> {
        let selectors = self.selectors.clone()?;
        let pagination = self.pagination.clone();
        Some(if self.site_type == SiteType::Dynamic {
            SiteMethod::Browser {
                selectors,
                pagination,
                max_pages: None,
            }
        } else {
            SiteMethod::HtmlStatic {
                selectors,
                pagination,
                max_pages: None,
            }
        })
    }
}

/// Outcome of comparing a stored selector set with a fresh discovery.
#[derive(Debug, Clone, PartialEq)]
pub enum SelectorDecision {
    /// Stored selector still matches; nothing changes
    Retain { matched: usize },
    /// Candidate is confident enough to overwrite the stored structure
    Replace { confidence: f64 },
    /// Stored selector broke and no candidate is confident enough
    Drift {
        stored_matched: usize,
        candidate_confidence: f64,
    },
    /// Nothing stored and nothing usable found
    NoStructure,
}

/// A discovery run together with the stored-selector comparison.
#[derive(Debug, Clone)]
pub struct Revalidation {
    pub result: DiscoveryResult,
    pub stored_matched: Option<usize>,
    pub decision: SelectorDecision,
}

/// Structure discovery over the fetch layer.
pub struct StructureDiscovery {
    fetcher: Arc<dyn Fetcher>,
    links: LinkMatcher,
    config: DiscoveryConfig,
}

impl StructureDiscovery {
    pub fn new(fetcher: Arc<dyn Fetcher>, links: LinkMatcher, config: DiscoveryConfig) -> Self {
        Self {
            fetcher,
            links,
            config,
        }
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    /// Fetch the listing page and infer its structure.
    pub async fn discover(&self, site: &SiteConfig) -> Result<DiscoveryResult> {
        let (result, _) = self.fetch_and_analyze(site).await?;
        Ok(result)
    }

    /// Discover again and decide whether the stored selectors survive.
    pub async fn revalidate(&self, site: &SiteConfig) -> Result<Revalidation> {
        let (result, html) = self.fetch_and_analyze(site).await?;
        let stored_matched = site
            .method
            .as_ref()
            .and_then(SiteMethod::selectors)
            .map(|s| self.count_matches(&html, &s.card));
        let decision = self.decide(stored_matched, &result);
        Ok(Revalidation {
            result,
            stored_matched,
            decision,
        })
    }

    async fn fetch_and_analyze(&self, site: &SiteConfig) -> Result<(DiscoveryResult, String)> {
        let url = site.listing_url();
        log::debug!("Discovering structure of {} at {}", site.site_id, url);

        let options = FetchOptions::for_site(&site.site_id);
        let page = self.fetcher.fetch(url, &options).await?;
        let result = self.analyze(&page.body, page.layer_used);

        log::info!(
            "{}: discovery found {} card(s), confidence {:.2}, type {:?}",
            site.site_id,
            result.element_count,
            result.confidence,
            result.site_type
        );
        Ok((result, page.body))
    }

    /// Infer the structure of a page. Pure; does no I/O.
    pub fn analyze(&self, html: &str, layer_used: FetchLayer) -> DiscoveryResult {
        let document = Html::parse_document(html);
        let anchors = match Selector::parse("a[href]") {
            Ok(sel) => sel,
            Err(_) => return self.empty_result(html, layer_used),
        };

        let mut candidates: Vec<(usize, Candidate)> = CARD_CANDIDATES
            .iter()
            .enumerate()
            .filter_map(|(rank, (selector, specificity))| {
                let sel = Selector::parse(selector).ok()?;
                let count = self.count_cards(&document, &sel, &anchors);
                (count > 0).then(|| {
                    let confidence = self.confidence(count, *specificity);
                    (
                        rank,
                        Candidate {
                            selector: selector.to_string(),
                            specificity: *specificity,
                            count,
                            confidence,
                        },
                    )
                })
            })
            .collect();

        // Most cards first; specificity and rank break ties.
        candidates.sort_by(|(ra, a), (rb, b)| {
            b.count
                .cmp(&a.count)
                .then(b.specificity.cmp(&a.specificity))
                .then(ra.cmp(rb))
        });
        let candidates: Vec<Candidate> = candidates.into_iter().map(|(_, c)| c).collect();

        let sparse = challenge::is_sparse(html);
        let api_hints = api_hints(html);
        let pagination = infer_pagination(&document, &anchors);

        let best = candidates
            .iter()
            .find(|c| c.count >= self.config.min_elements);
        let selectors = best.map(|c| self.field_selectors(&document, &c.selector));
        let (confidence, element_count) = best.map_or((0.0, 0), |c| (c.confidence, c.count));

        let site_type = if selectors.is_some() {
            if layer_used > FetchLayer::Http {
                SiteType::Dynamic
            } else {
                SiteType::Static
            }
        } else if !api_hints.is_empty() {
            SiteType::ApiBacked
        } else if sparse || layer_used > FetchLayer::Http {
            SiteType::Dynamic
        } else {
            SiteType::Static
        };

        DiscoveryResult {
            site_type,
            selectors,
            pagination,
            confidence,
            element_count,
            layer_used,
            sparse,
            api_hints,
            candidates,
        }
    }

    fn empty_result(&self, html: &str, layer_used: FetchLayer) -> DiscoveryResult {
        DiscoveryResult {
            site_type: SiteType::Static,
            selectors: None,
            pagination: Pagination::None,
            confidence: 0.0,
            element_count: 0,
            layer_used,
            sparse: challenge::is_sparse(html),
            api_hints: Vec::new(),
            candidates: Vec::new(),
        }
    }

    /// Number of elements matching `selector` that qualify as cards.
    /// Invalid selectors match nothing.
    pub fn count_matches(&self, html: &str, selector: &str) -> usize {
        let (Ok(sel), Ok(anchors)) = (Selector::parse(selector), Selector::parse("a[href]")) else {
            return 0;
        };
        let document = Html::parse_document(html);
        self.count_cards(&document, &sel, &anchors)
    }

    fn count_cards(&self, document: &Html, selector: &Selector, anchors: &Selector) -> usize {
        document
            .select(selector)
            .filter(|el| {
                let links = self.links.listing_links(el, anchors).len();
                (1..=2).contains(&links)
            })
            .count()
    }

    /// Confidence from card count (saturating) and selector specificity.
    pub fn confidence(&self, count: usize, specificity: u8) -> f64 {
        let saturation = self.config.count_saturation.max(1) as f64;
        let count_score = (count as f64 / saturation).min(1.0);
        let specificity_score = f64::from(specificity.min(3)) / 3.0;
        0.6 * count_score + 0.4 * specificity_score
    }

    /// Retain, replace or flag drift.
    ///
    /// A stored selector that still matches at least `min_elements` cards is
    /// always kept. A broken one is only replaced by a candidate at or above
    /// `replace_threshold`.
    pub fn decide(&self, stored_matched: Option<usize>, result: &DiscoveryResult) -> SelectorDecision {
        match stored_matched {
            Some(matched) if matched >= self.config.min_elements => {
                SelectorDecision::Retain { matched }
            }
            Some(_) if result.is_usable(self.config.replace_threshold) => SelectorDecision::Replace {
                confidence: result.confidence,
            },
            Some(stored_matched) => SelectorDecision::Drift {
                stored_matched,
                candidate_confidence: result.confidence,
            },
            None if result.is_usable(self.config.min_confidence) => SelectorDecision::Replace {
                confidence: result.confidence,
            },
            None => SelectorDecision::NoStructure,
        }
    }

    /// Card selector plus whatever field selectors the first card reveals.
    fn field_selectors(&self, document: &Html, card: &str) -> SiteSelectors {
        let mut selectors = SiteSelectors::card_only(card);
        let first = Selector::parse(card)
            .ok()
            .and_then(|sel| document.select(&sel).next());
        if let Some(first) = first {
            selectors.title = first_hint(&first, TITLE_HINTS);
            selectors.price = first_hint(&first, PRICE_HINTS);
            selectors.location = first_hint(&first, LOCATION_HINTS);
        }
        selectors
    }
}

fn first_hint(card: &ElementRef<'_>, hints: &[&str]) -> Option<String> {
    hints.iter().find_map(|hint| {
        let sel = Selector::parse(hint).ok()?;
        card.select(&sel).next().map(|_| hint.to_string())
    })
}

fn page_param_re() -> Option<&'static Regex> {
    static RE: std::sync::OnceLock<Option<Regex>> = std::sync::OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)[?&](page|pagina|pg|p)=\d+").ok())
        .as_ref()
}

fn page_segment_re() -> Option<&'static Regex> {
    static RE: std::sync::OnceLock<Option<Regex>> = std::sync::OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)/(page|pagina)/\d+").ok())
        .as_ref()
}

fn api_url_re() -> Option<&'static Regex> {
    static RE: std::sync::OnceLock<Option<Regex>> = std::sync::OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"["']((?:https?://[^"'\s]+)?/api/[^"'\s]*)["']"#).ok())
        .as_ref()
}

/// Pagination scheme from the page's own links.
fn infer_pagination(document: &Html, anchors: &Selector) -> Pagination {
    let hrefs: Vec<&str> = document
        .select(anchors)
        .filter_map(|a| a.value().attr("href"))
        .collect();

    if let Some(re) = page_param_re()
        && let Some(param) = hrefs
            .iter()
            .find_map(|h| re.captures(h).and_then(|c| c.get(1)).map(|m| m.as_str().to_string()))
    {
        return Pagination::QueryParam { param, start: 1 };
    }
    if let Some(re) = page_segment_re()
        && let Some(segment) = hrefs
            .iter()
            .find_map(|h| re.captures(h).and_then(|c| c.get(1)).map(|m| m.as_str().to_string()))
    {
        return Pagination::PathSegment { segment, start: 1 };
    }
    Pagination::None
}

/// Distinct `/api/` URLs referenced anywhere in the page.
fn api_hints(html: &str) -> Vec<String> {
    let Some(re) = api_url_re() else {
        return Vec::new();
    };
    let mut hints: Vec<String> = Vec::new();
    for caps in re.captures_iter(html) {
        if let Some(m) = caps.get(1)
            && !hints.iter().any(|h| h == m.as_str())
        {
            hints.push(m.as_str().to_string());
        }
    }
    hints
}

/// Map a discovery failure into an error carrying the site id.
pub fn no_structure(site: &SiteConfig, result: &DiscoveryResult) -> AppError {
    AppError::discovery(format!(
        "{}: no usable listing structure (best confidence {:.2}, {} card(s))",
        site.site_id, result.confidence, result.element_count
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::testing::MapFetcher;

    fn discovery(fetcher: MapFetcher) -> StructureDiscovery {
        let config = DiscoveryConfig::default();
        let links = LinkMatcher::new(&config.link_patterns).unwrap();
        StructureDiscovery::new(Arc::new(fetcher), links, config)
    }

    fn cards(class: &str, n: usize) -> String {
        (0..n)
            .map(|i| {
                format!(
                    r#"<div class="{class}"><a href="/lote/{i}">Lote {i}</a><span class="valor">R$ 1.000,00</span><span class="cidade">Santos/SP</span></div>"#
                )
            })
            .collect()
    }

    fn listing(body: &str) -> String {
        format!(
            r#"<html><body><nav><a href="/">Início</a><a href="/contato">Contato</a></nav>
               <div class="lotes-grid">{body}</div>
               <a href="/imoveis?pagina=2">Próxima</a></body></html>"#
        )
    }

    #[test]
    fn test_prefers_most_cards_and_ignores_wrappers() {
        let d = discovery(MapFetcher::new());
        let result = d.analyze(&listing(&cards("card-lote", 12)), FetchLayer::Http);

        let selectors = result.selectors.clone().unwrap();
        assert_eq!(selectors.card, "div.card-lote");
        assert_eq!(result.element_count, 12);
        assert!((result.confidence - 1.0).abs() < 1e-9);
        assert_eq!(selectors.price.as_deref(), Some("[class*='valor']"));
        assert_eq!(selectors.location.as_deref(), Some("[class*='cidade']"));
        assert_eq!(result.site_type, SiteType::Static);
        // The grid wrapper holds twelve links and is never a card.
        assert!(result.candidates.iter().all(|c| c.count <= 12));
    }

    #[test]
    fn test_wildcard_match_has_lower_confidence() {
        let d = discovery(MapFetcher::new());
        let result = d.analyze(&listing(&cards("resultado-imovel-box", 4)), FetchLayer::Http);

        assert_eq!(result.selectors.unwrap().card, "div[class*='imovel']");
        let expected = 0.6 * (4.0 / 12.0) + 0.4 * (2.0 / 3.0);
        assert!((result.confidence - expected).abs() < 1e-9);
    }

    #[test]
    fn test_infers_query_pagination() {
        let d = discovery(MapFetcher::new());
        let result = d.analyze(&listing(&cards("lote", 3)), FetchLayer::Http);
        assert_eq!(
            result.pagination,
            Pagination::QueryParam {
                param: "pagina".into(),
                start: 1
            }
        );
    }

    #[test]
    fn test_sparse_shell_is_dynamic() {
        let d = discovery(MapFetcher::new());
        let html = r#"<html><head><script src="/app.js"></script></head><body><div id="root"></div></body></html>"#;
        let result = d.analyze(html, FetchLayer::Http);
        assert!(result.selectors.is_none());
        assert!(result.sparse);
        assert_eq!(result.site_type, SiteType::Dynamic);
    }

    #[test]
    fn test_api_hints_detected() {
        let d = discovery(MapFetcher::new());
        let html = r#"<html><body><script>fetch("/api/v1/offers?page=1")</script><p>Carregando</p></body></html>"#;
        let result = d.analyze(html, FetchLayer::Http);
        assert_eq!(result.api_hints, vec!["/api/v1/offers?page=1"]);
        assert_eq!(result.site_type, SiteType::ApiBacked);
    }

    #[test]
    fn test_stored_selector_matching_many_is_retained() {
        let d = discovery(MapFetcher::new());
        // Stored selector matches 50 cards; a fresh pass only finds 2.
        let html = listing(&format!("{}{}", cards("card-lote", 50), cards("destaque-leilao", 0)));
        let stored = d.count_matches(&html, "div.card-lote");
        assert_eq!(stored, 50);

        let weak = d.analyze(&listing(&cards("box-leilao", 2)), FetchLayer::Http);
        assert_eq!(weak.element_count, 2);
        assert_eq!(d.decide(Some(stored), &weak), SelectorDecision::Retain { matched: 50 });
    }

    #[test]
    fn test_broken_selector_replaced_only_above_threshold() {
        let d = discovery(MapFetcher::new());
        let strong = d.analyze(&listing(&cards("card-lote", 20)), FetchLayer::Http);
        assert_eq!(
            d.decide(Some(0), &strong),
            SelectorDecision::Replace { confidence: 1.0 }
        );

        let weak = d.analyze(&listing(&cards("x-leilao-x", 2)), FetchLayer::Http);
        assert!(matches!(d.decide(Some(0), &weak), SelectorDecision::Drift { stored_matched: 0, .. }));
    }

    #[tokio::test]
    async fn test_discover_fetches_listing_url() {
        let mut site = SiteConfig::new("s", "S", "https://s.example");
        site.listing_url = Some("https://s.example/imoveis".into());
        let fetcher = MapFetcher::new().with_page("https://s.example/imoveis", listing(&cards("lote", 5)));
        let d = discovery(fetcher);

        let result = d.discover(&site).await.unwrap();
        assert_eq!(result.element_count, 5);
        assert!(matches!(result.to_method(), Some(SiteMethod::HtmlStatic { .. })));
    }

    #[tokio::test]
    async fn test_revalidate_counts_stored_selector() {
        let mut site = SiteConfig::new("s", "S", "https://s.example");
        site.method = Some(SiteMethod::HtmlStatic {
            selectors: SiteSelectors::card_only("div.card-lote"),
            pagination: Pagination::None,
            max_pages: None,
        });
        let fetcher = MapFetcher::new().with_page("https://s.example", listing(&cards("card-lote", 6)));
        let d = discovery(fetcher);

        let check = d.revalidate(&site).await.unwrap();
        assert_eq!(check.stored_matched, Some(6));
        assert_eq!(check.decision, SelectorDecision::Retain { matched: 6 });
    }
}
