// src/utils/text.rs

//! Parsing of Brazilian currency amounts and `City/UF` locations.

use std::sync::OnceLock;

use regex::Regex;

/// Brazilian state codes.
const UF_CODES: &[&str] = &[
    "AC", "AL", "AP", "AM", "BA", "CE", "DF", "ES", "GO", "MA", "MT", "MS", "MG", "PA", "PB",
    "PR", "PE", "PI", "RJ", "RN", "RS", "RO", "RR", "SC", "SP", "SE", "TO",
];

fn money_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"R\$\s*([0-9]{1,3}(?:\.[0-9]{3})*(?:,[0-9]{1,2})?|[0-9]+(?:,[0-9]{1,2})?)")
            .ok()
    })
    .as_ref()
}

fn evaluation_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)avalia[çc][ãa]o[^R]{0,40}R\$\s*([0-9][0-9.,]*)")
            .ok()
    })
    .as_ref()
}

fn location_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"([\p{L}][\p{L} .'\-]*?)\s*(?:/|\s-\s|,)\s*([A-Za-z]{2})\b")
            .ok()
    })
    .as_ref()
}

/// Collapse runs of whitespace and trim.
pub fn clean_text(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Non-empty cleaned text, or `None`.
pub fn non_empty(s: &str) -> Option<String> {
    let cleaned = clean_text(s);
    (!cleaned.is_empty()).then_some(cleaned)
}

/// Parse `1.234.567,89` (with or without `R$`) into `1234567.89`.
pub fn parse_brl(s: &str) -> Option<f64> {
    let digits: String = s
        .trim()
        .trim_start_matches("R$")
        .trim()
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == ',')
        .collect();
    if digits.is_empty() {
        return None;
    }
    let normalized = digits.replace('.', "").replace(',', ".");
    normalized.parse::<f64>().ok().filter(|v| *v > 0.0)
}

/// Every `R$` amount in the text, in order of appearance.
pub fn money_values(text: &str) -> Vec<f64> {
    let Some(re) = money_re() else {
        return Vec::new();
    };
    re.captures_iter(text)
        .filter_map(|c| c.get(1).and_then(|m| parse_brl(m.as_str())))
        .collect()
}

/// The amount labelled as evaluation ("Avaliação: R$ ...").
pub fn evaluation_value(text: &str) -> Option<f64> {
    evaluation_re()?
        .captures(text)
        .and_then(|c| c.get(1))
        .and_then(|m| parse_brl(m.as_str()))
}

/// Split `City/UF`, `City - UF` or `City, UF` into city and upper-cased state.
pub fn parse_location(text: &str) -> Option<(String, String)> {
    location_re()?.captures_iter(text).find_map(|caps| {
        let city = clean_text(caps.get(1)?.as_str());
        let state = caps.get(2)?.as_str().to_uppercase();
        (!city.is_empty() && UF_CODES.contains(&state.as_str())).then_some((city, state))
    })
}

/// Cleaned, upper-cased state value.
pub fn normalize_state(s: &str) -> Option<String> {
    let upper = clean_text(s).to_uppercase();
    if upper.is_empty() {
        None
    } else {
        Some(upper)
    }
}
