// src/models/selectors.rs

//! CSS selectors and pagination scheme for a listing page.

use serde::{Deserialize, Serialize};

/// CSS selectors for scraping listing cards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteSelectors {
    /// Selector for each listing card on the page
    pub card: String,

    /// Selector for the detail link inside a card
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,

    /// Selector for the title element inside a card
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    /// Selector for price elements (first match is the first auction value)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<String>,

    /// Selector for the location element
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,

    /// Selector for the category label
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,

    /// Selector for image elements
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

impl SiteSelectors {
    /// Selectors with only a card selector; every field falls back to heuristics.
    pub fn card_only(card: impl Into<String>) -> Self {
        Self {
            card: card.into(),
            link: None,
            title: None,
            price: None,
            location: None,
            category: None,
            image: None,
        }
    }

    /// All selector strings that are set, with their field names.
    pub fn defined(&self) -> Vec<(&'static str, &str)> {
        let mut out = vec![("card", self.card.as_str())];
        let optional = [
            ("link", &self.link),
            ("title", &self.title),
            ("price", &self.price),
            ("location", &self.location),
            ("category", &self.category),
            ("image", &self.image),
        ];
        out.extend(
            optional
                .into_iter()
                .filter_map(|(name, value)| value.as_deref().map(|v| (name, v))),
        );
        out
    }
}

/// How successive listing pages are addressed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Pagination {
    /// `?{param}=N`
    QueryParam {
        param: String,
        #[serde(default = "default_start")]
        start: u32,
    },
    /// `{listing_url}/{segment}/N`
    PathSegment {
        segment: String,
        #[serde(default = "default_start")]
        start: u32,
    },
    /// Single listing page
    #[default]
    None,
}

fn default_start() -> u32 {
    1
}

impl Pagination {
    /// First page number, if the scheme is paginated.
    pub fn start(&self) -> Option<u32> {
        match self {
            Pagination::QueryParam { start, .. } | Pagination::PathSegment { start, .. } => {
                Some(*start)
            }
            Pagination::None => None,
        }
    }

    /// URL of page `page` for the given listing URL.
    ///
    /// The first page of a path-segment scheme is the listing URL itself.
    pub fn page_url(&self, listing_url: &str, page: u32) -> String {
        match self {
            Pagination::QueryParam { param, .. } => match url::Url::parse(listing_url) {
                Ok(mut url) => {
                    let kept: Vec<(String, String)> = url
                        .query_pairs()
                        .filter(|(k, _)| k != param)
                        .map(|(k, v)| (k.into_owned(), v.into_owned()))
                        .collect();
                    url.query_pairs_mut()
                        .clear()
                        .extend_pairs(kept)
                        .append_pair(param, &page.to_string());
                    url.to_string()
                }
                Err(_) => {
                    let sep = if listing_url.contains('?') { '&' } else { '?' };
                    format!("{listing_url}{sep}{param}={page}")
                }
            },
            Pagination::PathSegment { segment, start } => {
                if page <= *start {
                    listing_url.to_string()
                } else {
                    format!("{}/{}/{}", listing_url.trim_end_matches('/'), segment, page)
                }
            }
            Pagination::None => listing_url.to_string(),
        }
    }
}
