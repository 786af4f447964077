// src/services/selectors.rs

//! Compiled card selectors and the listing-link matcher.

use regex::Regex;
use scraper::{ElementRef, Selector};

use crate::error::{AppError, Result};
use crate::models::SiteSelectors;

/// Parsed form of [`SiteSelectors`].
#[derive(Debug, Clone)]
pub struct CompiledSelectors {
    pub card: Selector,
    pub link: Selector,
    pub title: Option<Selector>,
    pub price: Option<Selector>,
    pub location: Option<Selector>,
    pub category: Option<Selector>,
    pub image: Selector,
    pub heading: Selector,
}

impl CompiledSelectors {
    /// Compile every selector, failing on the first invalid one.
    pub fn compile(selectors: &SiteSelectors) -> Result<Self> {
        Ok(Self {
            card: Self::parse_selector(&selectors.card)?,
            link: Self::parse_selector(selectors.link.as_deref().unwrap_or("a[href]"))?,
            title: Self::parse_optional(selectors.title.as_deref())?,
            price: Self::parse_optional(selectors.price.as_deref())?,
            location: Self::parse_optional(selectors.location.as_deref())?,
            category: Self::parse_optional(selectors.category.as_deref())?,
            image: Self::parse_selector(selectors.image.as_deref().unwrap_or("img"))?,
            heading: Self::parse_selector("h1, h2, h3, h4, h5")?,
        })
    }

    pub fn parse_selector(selector: &str) -> Result<Selector> {
        Selector::parse(selector).map_err(|e| AppError::selector(selector, format!("{e:?}")))
    }

    fn parse_optional(selector: Option<&str>) -> Result<Option<Selector>> {
        selector.map(Self::parse_selector).transpose()
    }
}

/// Recognizes links to listing detail pages (`/leilao/`, `/lote/`, `/imovel/` ...).
#[derive(Debug, Clone)]
pub struct LinkMatcher {
    pattern: Regex,
}

impl LinkMatcher {
    pub fn new(fragments: &[String]) -> Result<Self> {
        if fragments.is_empty() {
            return Err(AppError::config("no listing link patterns configured"));
        }
        let alternation = fragments
            .iter()
            .map(|f| regex::escape(f.trim()))
            .collect::<Vec<_>>()
            .join("|");
        let pattern = Regex::new(&format!("(?i)(?:{alternation})"))
            .map_err(|e| AppError::config(format!("invalid link pattern: {e}")))?;
        Ok(Self { pattern })
    }

    pub fn is_listing_link(&self, href: &str) -> bool {
        self.pattern.is_match(href)
    }

    /// Distinct qualifying hrefs inside an element, in document order.
    pub fn listing_links(&self, element: &ElementRef<'_>, anchors: &Selector) -> Vec<String> {
        let mut links: Vec<String> = Vec::new();
        for href in element
            .select(anchors)
            .filter_map(|a| a.value().attr("href"))
            .filter(|href| self.is_listing_link(href))
        {
            if !links.iter().any(|l| l == href) {
                links.push(href.to_string());
            }
        }
        links
    }
}

#[cfg(test)]
mod tests {
    use scraper::Html;

    use super::*;

    fn matcher() -> LinkMatcher {
        LinkMatcher::new(&["/leilao/".to_string(), "/lote/".to_string()]).unwrap()
    }

    #[test]
    fn test_compile_reports_bad_selector() {
        let err = CompiledSelectors::compile(&SiteSelectors::card_only("div[[")).unwrap_err();
        assert!(matches!(err, AppError::Selector { .. }));
    }

    #[test]
    fn test_link_matcher() {
        let m = matcher();
        assert!(m.is_listing_link("https://x.example/lote/123"));
        assert!(m.is_listing_link("/LEILAO/abc"));
        assert!(!m.is_listing_link("/contato"));
    }

    #[test]
    fn test_listing_links_dedupes() {
        let html = Html::parse_fragment(
            r#"<div><a href="/lote/1"><img></a><a href="/lote/1">Casa</a><a href="/sobre">x</a></div>"#,
        );
        let anchors = Selector::parse("a[href]").unwrap();
        let root = html.root_element();
        assert_eq!(matcher().listing_links(&root, &anchors), vec!["/lote/1"]);
    }
}
