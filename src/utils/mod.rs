//! Utility functions and helpers.

pub mod log;
pub mod text;

use url::Url;

/// Resolve an href against a page URL into an absolute http(s) URL.
///
/// Returns `None` for fragments, `javascript:`/`mailto:` links and anything
/// that does not resolve to http(s).
pub fn resolve(base_url: &str, href: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty() || href.starts_with('#') {
        return None;
    }
    let base = Url::parse(base_url).ok()?;
    let mut joined = base.join(href).ok()?;
    if !matches!(joined.scheme(), "http" | "https") {
        return None;
    }
    joined.set_fragment(None);
    Some(joined.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_relative_and_absolute() {
        let base = "https://leiloes.example/imoveis/";
        assert_eq!(
            resolve(base, "lote/7"),
            Some("https://leiloes.example/imoveis/lote/7".to_string())
        );
        assert_eq!(
            resolve(base, "/lote/7"),
            Some("https://leiloes.example/lote/7".to_string())
        );
        assert_eq!(
            resolve(base, "https://outro.example/x"),
            Some("https://outro.example/x".to_string())
        );
    }

    #[test]
    fn test_resolve_rejects_non_navigable_links() {
        let base = "https://leiloes.example/imoveis";
        assert_eq!(
            resolve(base, "/lote/42#fotos"),
            Some("https://leiloes.example/lote/42".to_string())
        );
        assert_eq!(resolve(base, "#topo"), None);
        assert_eq!(resolve(base, "javascript:void(0)"), None);
        assert_eq!(resolve(base, "mailto:contato@leiloes.example"), None);
    }
}
