// src/models/site.rs

//! Site configuration and the site registry file.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use scraper::Selector;
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::models::{Pagination, SiteSelectors};

/// One auction-house site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteConfig {
    /// Stable site identifier, also the `auctioneer_id` of its records
    pub site_id: String,

    /// Display name
    pub name: String,

    /// Site home page
    pub base_url: String,

    /// Page listing the auctions (defaults to `base_url`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listing_url: Option<String>,

    /// Disabled sites are never harvested
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Extraction method; `None` means "discover first"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<SiteMethod>,

    /// Politeness delay between page fetches, overriding the global default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_delay_ms: Option<u64>,

    /// Item budget overriding the global default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_items: Option<usize>,

    /// Free-text notes for operators
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

fn default_enabled() -> bool {
    true
}

/// Extraction method with only the fields each method needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SiteMethod {
    /// Paginated JSON endpoint
    Api { api: ApiDescriptor },
    /// Server-rendered HTML, fetched over plain HTTP first
    HtmlStatic {
        selectors: SiteSelectors,
        #[serde(default)]
        pagination: Pagination,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_pages: Option<u32>,
    },
    /// HTML rendered client-side; fetching starts at the browser layer
    Browser {
        selectors: SiteSelectors,
        #[serde(default)]
        pagination: Pagination,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_pages: Option<u32>,
    },
}

impl SiteMethod {
    pub fn name(&self) -> &'static str {
        match self {
            SiteMethod::Api { .. } => "api",
            SiteMethod::HtmlStatic { .. } => "html_static",
            SiteMethod::Browser { .. } => "browser",
        }
    }

    /// Card selectors of HTML methods.
    pub fn selectors(&self) -> Option<&SiteSelectors> {
        match self {
            SiteMethod::HtmlStatic { selectors, .. } | SiteMethod::Browser { selectors, .. } => {
                Some(selectors)
            }
            SiteMethod::Api { .. } => None,
        }
    }
}

/// REST endpoint description for API-mode sites.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiDescriptor {
    /// API root, e.g. `https://api.example.com/v1`
    pub base_url: String,

    /// Named endpoint paths; `offers` is required
    pub endpoints: BTreeMap<String, String>,

    /// Static query parameters sent with every request
    #[serde(default)]
    pub params: BTreeMap<String, String>,

    /// Query parameter carrying the page number
    #[serde(default = "default_page_param")]
    pub page_param: String,

    /// Query parameter carrying the page size
    #[serde(default = "default_size_param")]
    pub size_param: String,

    #[serde(default = "default_page_size")]
    pub page_size: u32,

    #[serde(default = "default_first_page")]
    pub first_page: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_pages: Option<u32>,

    /// JSON field names of the offer schema
    #[serde(default)]
    pub fields: ApiFields,
}

impl ApiDescriptor {
    /// Absolute URL of the offers endpoint.
    pub fn offers_url(&self) -> Option<String> {
        self.endpoints.get("offers").map(|path| {
            if path.starts_with("http://") || path.starts_with("https://") {
                path.clone()
            } else {
                format!(
                    "{}/{}",
                    self.base_url.trim_end_matches('/'),
                    path.trim_start_matches('/')
                )
            }
        })
    }
}

fn default_page_param() -> String {
    "pageNumber".into()
}
fn default_size_param() -> String {
    "pageSize".into()
}
fn default_page_size() -> u32 {
    20
}
fn default_first_page() -> u32 {
    1
}

/// Dotted JSON paths of the offer schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiFields {
    pub items: String,
    pub total: String,
    pub id: String,
    pub url: String,
    /// Used when the offer has no URL; `{id}` is replaced by the offer id
    pub url_template: Option<String>,
    pub title: String,
    pub first_value: String,
    pub second_value: String,
    pub evaluation_value: String,
    pub address: String,
    pub neighborhood: String,
    pub city: String,
    pub state: String,
    pub category: String,
    pub image: String,
}

impl Default for ApiFields {
    fn default() -> Self {
        Self {
            items: "offers".into(),
            total: "total".into(),
            id: "id".into(),
            url: "url".into(),
            url_template: None,
            title: "title".into(),
            first_value: "firstAuctionValue".into(),
            second_value: "secondAuctionValue".into(),
            evaluation_value: "evaluationValue".into(),
            address: "address.street".into(),
            neighborhood: "address.neighborhood".into(),
            city: "address.city".into(),
            state: "address.state".into(),
            category: "category".into(),
            image: "imageUrl".into(),
        }
    }
}

impl SiteConfig {
    /// Minimal HTML site without a method (to be discovered).
    pub fn new(
        site_id: impl Into<String>,
        name: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            site_id: site_id.into(),
            name: name.into(),
            base_url: base_url.into(),
            listing_url: None,
            enabled: true,
            method: None,
            page_delay_ms: None,
            max_items: None,
            notes: None,
        }
    }

    /// The page where listings are found.
    pub fn listing_url(&self) -> &str {
        self.listing_url.as_deref().unwrap_or(&self.base_url)
    }

    /// Switch a static HTML method to the browser method, keeping its
    /// selectors. Returns `false` if there was nothing to switch.
    pub fn mark_for_browser(&mut self) -> bool {
        match self.method.take() {
            Some(SiteMethod::HtmlStatic {
                selectors,
                pagination,
                max_pages,
            }) => {
                self.method = Some(SiteMethod::Browser {
                    selectors,
                    pagination,
                    max_pages,
                });
                true
            }
            other => {
                self.method = other;
                false
            }
        }
    }

    /// Validate method-specific fields.
    pub fn validate(&self) -> Result<()> {
        let ctx = |msg: String| AppError::validation(format!("site '{}': {}", self.site_id, msg));

        if self.site_id.trim().is_empty() {
            return Err(AppError::validation("site with empty site_id"));
        }
        url::Url::parse(self.listing_url())
            .map_err(|e| ctx(format!("invalid listing URL: {e}")))?;

        match &self.method {
            None => Ok(()),
            Some(SiteMethod::Api { api }) => {
                if api.offers_url().is_none() {
                    return Err(ctx("api descriptor needs an 'offers' endpoint".into()));
                }
                if api.page_size == 0 {
                    return Err(ctx("api page_size must be > 0".into()));
                }
                if api.max_pages == Some(0) {
                    return Err(ctx("api max_pages must be > 0".into()));
                }
                Ok(())
            }
            Some(SiteMethod::HtmlStatic {
                selectors,
                pagination,
                max_pages,
            })
            | Some(SiteMethod::Browser {
                selectors,
                pagination,
                max_pages,
            }) => {
                for (field, selector) in selectors.defined() {
                    Selector::parse(selector)
                        .map_err(|e| ctx(format!("invalid {field} selector '{selector}': {e}")))?;
                }
                if pagination.start() == Some(0) {
                    return Err(ctx("pagination start must be > 0".into()));
                }
                if *max_pages == Some(0) {
                    return Err(ctx("max_pages must be > 0".into()));
                }
                Ok(())
            }
        }
    }
}

/// The `sites.toml` registry file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SiteRegistry {
    #[serde(default)]
    pub sites: Vec<SiteConfig>,
}

impl SiteRegistry {
    /// Load and validate the registry.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let registry: SiteRegistry = toml::from_str(&content)?;
        registry.validate()?;
        Ok(registry)
    }

    /// Validate every site and reject duplicate ids.
    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for site in &self.sites {
            if !seen.insert(site.site_id.as_str()) {
                return Err(AppError::validation(format!(
                    "duplicate site_id '{}'",
                    site.site_id
                )));
            }
            site.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REGISTRY: &str = r#"
        [[sites]]
        site_id = "leiloes-sul"
        name = "Leilões Sul"
        base_url = "https://leiloessul.example"
        listing_url = "https://leiloessul.example/imoveis"
        page_delay_ms = 1500

        [sites.method]
        kind = "html_static"
        max_pages = 10

        [sites.method.selectors]
        card = "div.card-lote"
        price = ".valor"

        [sites.method.pagination]
        type = "query_param"
        param = "pagina"

        [[sites]]
        site_id = "api-house"
        name = "API House"
        base_url = "https://apihouse.example"

        [sites.method]
        kind = "api"

        [sites.method.api]
        base_url = "https://api.apihouse.example/v1"
        endpoints = { offers = "/offers" }
        page_size = 5

        [[sites]]
        site_id = "unknown"
        name = "Unknown Structure"
        base_url = "https://unknown.example"
    "#;

    #[test]
    fn test_registry_parses_tagged_methods() {
        let registry: SiteRegistry = toml::from_str(REGISTRY).unwrap();
        registry.validate().unwrap();

        assert_eq!(registry.sites.len(), 3);
        assert_eq!(registry.sites[0].method.as_ref().unwrap().name(), "html_static");
        assert_eq!(registry.sites[0].page_delay_ms, Some(1500));

        match &registry.sites[1].method {
            Some(SiteMethod::Api { api }) => {
                assert_eq!(
                    api.offers_url().as_deref(),
                    Some("https://api.apihouse.example/v1/offers")
                );
                assert_eq!(api.page_param, "pageNumber");
                assert_eq!(api.fields.items, "offers");
            }
            other => panic!("expected api method, got {:?}", other),
        }

        assert!(registry.sites[2].method.is_none());
        assert_eq!(registry.sites[2].listing_url(), "https://unknown.example");
    }

    #[test]
    fn test_invalid_selector_rejected_at_load() {
        let mut site = SiteConfig::new("bad", "Bad", "https://bad.example");
        site.method = Some(SiteMethod::HtmlStatic {
            selectors: SiteSelectors::card_only("div[[["),
            pagination: Pagination::None,
            max_pages: None,
        });
        assert!(site.validate().is_err());
    }

    #[test]
    fn test_mark_for_browser_keeps_selectors() {
        let mut site = SiteConfig::new("s", "S", "https://s.example");
        assert!(!site.mark_for_browser());

        site.method = Some(SiteMethod::HtmlStatic {
            selectors: SiteSelectors::card_only(".lote"),
            pagination: Pagination::None,
            max_pages: Some(3),
        });
        assert!(site.mark_for_browser());
        assert_eq!(site.method.as_ref().unwrap().name(), "browser");
        assert_eq!(site.method.as_ref().unwrap().selectors().unwrap().card, ".lote");
        assert!(!site.mark_for_browser());
    }

    #[test]
    fn test_api_without_offers_rejected() {
        let mut site = SiteConfig::new("api", "Api", "https://api.example");
        site.method = Some(SiteMethod::Api {
            api: ApiDescriptor {
                base_url: "https://api.example".into(),
                endpoints: BTreeMap::new(),
                params: BTreeMap::new(),
                page_param: default_page_param(),
                size_param: default_size_param(),
                page_size: 10,
                first_page: 1,
                max_pages: None,
                fields: ApiFields::default(),
            },
        });
        assert!(site.validate().is_err());
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let registry = SiteRegistry {
            sites: vec![
                SiteConfig::new("a", "A", "https://a.example"),
                SiteConfig::new("a", "A2", "https://a2.example"),
            ],
        };
        assert!(registry.validate().is_err());
    }
}
