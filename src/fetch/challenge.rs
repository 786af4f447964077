// src/fetch/challenge.rs

//! Heuristics for pages that are not real content.

use scraper::{Html, Selector};

/// Bodies larger than this are real pages even if they mention a marker.
const CHALLENGE_MAX_BYTES: usize = 24_000;

/// Visible text below this many characters counts as a script-only shell.
const SPARSE_TEXT_CHARS: usize = 400;

/// Detects bot-challenge and incompatible-browser interstitials.
#[derive(Debug, Clone, Default)]
pub struct ChallengeDetector {
    markers: Vec<String>,
}

impl ChallengeDetector {
    pub fn new(markers: &[String]) -> Self {
        Self {
            markers: markers
                .iter()
                .map(|m| m.trim().to_lowercase())
                .filter(|m| !m.is_empty())
                .collect(),
        }
    }

    /// Return the first matching marker when the body is a challenge page.
    ///
    /// A marker in the `<title>` always counts; elsewhere it only counts on
    /// small documents, since full listing pages often carry `<noscript>`
    /// notices with the same wording.
    pub fn detect(&self, body: &str) -> Option<&str> {
        let lower = body.to_lowercase();
        let title = extract_title(&lower);

        self.markers
            .iter()
            .find(|marker| {
                title.is_some_and(|t| t.contains(marker.as_str()))
                    || (lower.len() <= CHALLENGE_MAX_BYTES && lower.contains(marker.as_str()))
            })
            .map(String::as_str)
    }
}

fn extract_title(lower: &str) -> Option<&str> {
    let start = lower.find("<title")?;
    let open_end = start + lower[start..].find('>')? + 1;
    let close = open_end + lower[open_end..].find("</title>")?;
    Some(&lower[open_end..close])
}

/// Whether a page carries too little static text to hold listings.
///
/// Typical of single-page apps that render cards client-side.
pub fn is_sparse(body: &str) -> bool {
    let document = Html::parse_document(body);
    let Ok(body_sel) = Selector::parse("body") else {
        return false;
    };
    let Ok(script_sel) = Selector::parse("script") else {
        return false;
    };

    let scripts = document.select(&script_sel).count();
    let text_len: usize = document
        .select(&body_sel)
        .flat_map(|b| b.text())
        .map(|t| t.trim().chars().count())
        .sum();

    scripts > 0 && text_len < SPARSE_TEXT_CHARS
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector() -> ChallengeDetector {
        ChallengeDetector::new(&[
            "Just a moment".to_string(),
            "navegador incompatível".to_string(),
            "please enable javascript".to_string(),
        ])
    }

    #[test]
    fn test_detects_cloudflare_interstitial() {
        let body = "<html><head><title>Just a moment...</title></head><body></body></html>";
        assert_eq!(detector().detect(body), Some("just a moment"));
    }

    #[test]
    fn test_detects_incompatible_browser_page() {
        let body = "<html><body><h1>Navegador incompatível</h1></body></html>";
        assert!(detector().detect(body).is_some());
    }

    #[test]
    fn test_large_page_with_noscript_is_not_challenge() {
        let cards = "<div class='card'><a href='/lote/1'>Apartamento</a></div>".repeat(600);
        let body = format!(
            "<html><head><title>Leilões</title></head><body>\
             <noscript>Please enable JavaScript</noscript>{cards}</body></html>"
        );
        assert_eq!(detector().detect(&body), None);
    }

    #[test]
    fn test_sparse_spa_shell() {
        let shell = "<html><body><div id='root'></div><script src='app.js'></script></body></html>";
        assert!(is_sparse(shell));

        let text = "Apartamento em leilão com 3 quartos. ".repeat(30);
        let full = format!("<html><body><p>{text}</p><script></script></body></html>");
        assert!(!is_sparse(&full));
    }
}
