// src/services/api.rs

//! Paginated JSON API harvesting.
//!
//! The descriptor names the offers endpoint, its paging parameters and the
//! dotted JSON paths of the offer schema. Every request goes through the
//! plain HTTP layer.

use std::collections::HashSet;
use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::{AppError, Result};
use crate::fetch::{FetchOptions, Fetcher};
use crate::models::{ApiDescriptor, ApiFields, RawRecord, SiteConfig};
use crate::services::scraper::{ScrapeBudget, ScrapeOutcome, polite_pause};
use crate::utils::resolve;
use crate::utils::text::{non_empty, parse_brl};

/// URL of one page of the offers endpoint.
pub fn page_url(api: &ApiDescriptor, page: u32) -> Result<String> {
    let endpoint = api
        .offers_url()
        .ok_or_else(|| AppError::config("api descriptor has no 'offers' endpoint"))?;
    let mut url = Url::parse(&endpoint)?;
    {
        let mut query = url.query_pairs_mut();
        for (key, value) in &api.params {
            query.append_pair(key, value);
        }
        query.append_pair(&api.page_param, &page.to_string());
        query.append_pair(&api.size_param, &api.page_size.to_string());
    }
    Ok(url.to_string())
}

/// Walk the offers endpoint until it runs dry or the budget is spent.
///
/// Never returns more raw records than the provider's reported total.
pub(crate) async fn scrape_api(
    fetcher: &dyn Fetcher,
    site: &SiteConfig,
    api: &ApiDescriptor,
    budget: ScrapeBudget,
    delay: Duration,
    cancel: &CancellationToken,
) -> Result<ScrapeOutcome> {
    let options = FetchOptions::for_site(&site.site_id).http_only();
    let max_pages = api
        .max_pages
        .map_or(budget.max_pages, |m| m.min(budget.max_pages));

    let mut outcome = ScrapeOutcome::default();
    let mut seen: HashSet<String> = HashSet::new();
    let mut stale_pages = 0;
    let mut page = api.first_page;

    loop {
        if outcome.pages_fetched >= max_pages {
            log::debug!("{}: api page budget of {} reached", site.site_id, max_pages);
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

        let url = page_url(api, page)?;
        let response = match fetcher.fetch(&url, &options).await {
            Ok(response) => response,
            Err(e) if outcome.pages_fetched == 0 => return Err(e.into()),
            Err(e) => {
                log::warn!("{}: api page {} failed: {}", site.site_id, page, e);
                break;
            }
        };
        outcome.pages_fetched += 1;
        outcome.layer = Some(response.layer_used);

        let body: Value = serde_json::from_str(&response.body)
            .map_err(|e| AppError::scrape(&site.site_id, format!("invalid JSON on page {page}: {e}")))?;

        if outcome.provider_total.is_none() {
            outcome.provider_total = json_path(&body, &api.fields.total)
                .and_then(as_count)
                .filter(|total| *total > 0);
        }

        let offers = json_path(&body, &api.fields.items)
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();
        if offers.is_empty() {
            outcome.complete = true;
            break;
        }

        let mut new_offers = 0;
        let limit = outcome
            .provider_total
            .map_or(budget.max_items, |t| t.min(budget.max_items));
        for offer in offers {
            let Some(record) = map_offer(offer, &api.fields, &site.base_url) else {
                log::debug!("{}: offer without a resolvable link skipped", site.site_id);
                continue;
            };
            if seen.insert(record.source_url.clone()) {
                new_offers += 1;
            }
            outcome.records.push(record);
            if outcome.records.len() >= limit {
                break;
            }
        }

        if let Some(total) = outcome.provider_total
            && outcome.records.len() >= total
        {
            // Overlapping pages reach the raw total with offers still unseen.
            outcome.complete = seen.len() >= total;
            if !outcome.complete {
                log::warn!(
                    "{}: provider total {} reached with {} distinct offer(s); treating the walk as partial",
                    site.site_id,
                    total,
                    seen.len()
                );
            }
            break;
        }
        if outcome.records.len() >= budget.max_items {
            break;
        }

        if new_offers == 0 {
            stale_pages += 1;
            if stale_pages >= 2 {
                outcome.complete = true;
                break;
            }
        } else {
            stale_pages = 0;
        }
        page += 1;
    }

    log::debug!(
        "{}: api yielded {} record(s) over {} page(s), provider total {:?}",
        site.site_id,
        outcome.records.len(),
        outcome.pages_fetched,
        outcome.provider_total
    );
    Ok(outcome)
}

/// Map one offer object to a raw record.
///
/// Offers without a URL and without an id usable in `url_template` are dropped.
pub fn map_offer(offer: &Value, fields: &ApiFields, base_url: &str) -> Option<RawRecord> {
    let id = json_path(offer, &fields.id).and_then(as_text);
    let href = json_path(offer, &fields.url).and_then(as_text).or_else(|| {
        let template = fields.url_template.as_ref()?;
        Some(template.replace("{id}", id.as_deref()?))
    })?;
    let source_url = resolve(base_url, &href)?;

    let text = |path: &str| json_path(offer, path).and_then(as_text);
    let money = |path: &str| json_path(offer, path).and_then(as_money);

    let mut record = RawRecord::new(source_url);
    record.external_id = id;
    record.title = text(&fields.title);
    record.first_auction_value = money(&fields.first_value);
    record.second_auction_value = money(&fields.second_value);
    record.evaluation_value = money(&fields.evaluation_value);
    record.address = text(&fields.address);
    record.neighborhood = text(&fields.neighborhood);
    record.city = text(&fields.city);
    record.state = text(&fields.state);
    record.category = text(&fields.category);

    match json_path(offer, &fields.image) {
        Some(Value::Array(items)) => {
            record.image_urls = items
                .iter()
                .filter_map(as_text)
                .filter_map(|src| resolve(base_url, &src))
                .collect();
        }
        Some(value) => {
            record.image_urls = as_text(value)
                .and_then(|src| resolve(base_url, &src))
                .into_iter()
                .collect();
        }
        None => {}
    }

    Some(record)
}

/// Follow a dotted path (`address.city`, `data.items`) through objects.
/// Numeric segments index into arrays.
pub fn json_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(value);
    }
    path.split('.').try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => non_empty(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn as_money(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64().filter(|v| *v > 0.0),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|v| *v > 0.0)
            .or_else(|| parse_brl(s)),
        _ => None,
    }
}

fn as_count(value: &Value) -> Option<usize> {
    match value {
        Value::Number(n) => n.as_u64().map(|n| n as usize),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde_json::json;

    use super::*;
    use crate::fetch::FetchLayer;
    use crate::fetch::testing::MapFetcher;
    use crate::models::SiteMethod;

    fn descriptor() -> ApiDescriptor {
        ApiDescriptor {
            base_url: "https://api.casa.example/v1".into(),
            endpoints: BTreeMap::from([("offers".to_string(), "/offers".to_string())]),
            params: BTreeMap::from([("status".to_string(), "open".to_string())]),
            page_param: "pageNumber".into(),
            size_param: "pageSize".into(),
            page_size: 5,
            first_page: 1,
            max_pages: None,
            fields: ApiFields {
                url_template: Some("/imovel/{id}".into()),
                ..ApiFields::default()
            },
        }
    }

    fn site() -> SiteConfig {
        let mut site = SiteConfig::new("casa-api", "Casa API", "https://casa.example");
        site.method = Some(SiteMethod::Api { api: descriptor() });
        site
    }

    fn offers(ids: &[u32], total: u32) -> String {
        let items: Vec<Value> = ids
            .iter()
            .map(|id| {
                json!({
                    "id": id,
                    "title": format!("Casa {id}"),
                    "firstAuctionValue": 100000.0 + *id as f64,
                    "address": { "street": "Rua B", "city": "Natal", "state": "RN" },
                })
            })
            .collect();
        json!({ "offers": items, "total": total }).to_string()
    }

    fn budget() -> ScrapeBudget {
        ScrapeBudget {
            max_items: 500,
            max_pages: 50,
        }
    }

    #[test]
    fn test_page_url_carries_params() {
        assert_eq!(
            page_url(&descriptor(), 2).unwrap(),
            "https://api.casa.example/v1/offers?status=open&pageNumber=2&pageSize=5"
        );
    }

    #[test]
    fn test_json_path() {
        let v = json!({ "data": { "items": [ { "id": 7 } ] } });
        assert_eq!(json_path(&v, "data.items.0.id"), Some(&json!(7)));
        assert_eq!(json_path(&v, "data.missing"), None);
    }

    #[test]
    fn test_map_offer_uses_template_and_nested_fields() {
        let offer = json!({
            "id": 42,
            "title": "Sobrado",
            "firstAuctionValue": "350000.50",
            "secondAuctionValue": 0,
            "address": { "street": "Rua C, 10", "neighborhood": "Tirol", "city": "Natal", "state": "RN" },
            "imageUrl": ["/fotos/42.jpg"]
        });
        let record = map_offer(&offer, &descriptor().fields, "https://casa.example").unwrap();

        assert_eq!(record.source_url, "https://casa.example/imovel/42");
        assert_eq!(record.external_id.as_deref(), Some("42"));
        assert_eq!(record.first_auction_value, Some(350_000.5));
        assert_eq!(record.second_auction_value, None);
        assert_eq!(record.neighborhood.as_deref(), Some("Tirol"));
        assert_eq!(record.image_urls, vec!["https://casa.example/fotos/42.jpg"]);
    }

    #[test]
    fn test_offer_without_link_is_dropped() {
        let fields = ApiFields::default();
        assert!(map_offer(&json!({ "id": 1, "title": "x" }), &fields, "https://casa.example").is_none());
    }

    #[tokio::test]
    async fn test_stops_at_provider_total() {
        let api = descriptor();
        let fetcher = MapFetcher::new()
            .with_page(&page_url(&api, 1).unwrap(), offers(&[1, 2, 3, 4, 5], 8))
            .with_page(&page_url(&api, 2).unwrap(), offers(&[6, 7, 8, 9, 10], 8))
            .with_page(&page_url(&api, 3).unwrap(), offers(&[11], 8));

        let outcome = scrape_api(&fetcher, &site(), &api, budget(), Duration::ZERO, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.records.len(), 8);
        assert_eq!(outcome.provider_total, Some(8));
        assert_eq!(outcome.pages_fetched, 2);
        assert!(outcome.complete);
    }

    #[tokio::test]
    async fn test_overlap_at_provider_total_is_partial() {
        let api = descriptor();
        let fetcher = MapFetcher::new()
            .with_page(&page_url(&api, 1).unwrap(), offers(&[1, 2, 3, 4, 5], 10))
            .with_page(&page_url(&api, 2).unwrap(), offers(&[5, 6, 7, 8, 9], 10))
            .with_page(&page_url(&api, 3).unwrap(), offers(&[10], 10));

        let outcome = scrape_api(&fetcher, &site(), &api, budget(), Duration::ZERO, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.records.len(), 10);
        assert_eq!(outcome.pages_fetched, 2);
        assert!(!outcome.complete);
    }

    #[tokio::test]
    async fn test_stops_on_empty_page_and_uses_http_only() {
        let api = descriptor();
        let fetcher = MapFetcher::new()
            .with_page(&page_url(&api, 1).unwrap(), offers(&[1, 2], 0))
            .with_page(&page_url(&api, 2).unwrap(), offers(&[], 0));

        let outcome = scrape_api(&fetcher, &site(), &api, budget(), Duration::ZERO, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.records.len(), 2);
        assert!(outcome.complete);
        assert_eq!(outcome.layer, Some(FetchLayer::Http));
        let requests = fetcher.requests.lock().unwrap();
        assert!(requests.iter().all(|(_, o)| o.max_layer == FetchLayer::Http));
    }

    #[tokio::test]
    async fn test_repeating_pages_terminate() {
        let api = descriptor();
        let mut fetcher = MapFetcher::new();
        for n in 1..=20 {
            fetcher = fetcher.with_page(&page_url(&api, n).unwrap(), offers(&[1, 2, 3], 0));
        }

        let outcome = scrape_api(&fetcher, &site(), &api, budget(), Duration::ZERO, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.pages_fetched, 3);
        assert!(outcome.complete);
    }

    #[tokio::test]
    async fn test_invalid_json_is_scrape_error() {
        let api = descriptor();
        let fetcher = MapFetcher::new().with_page(&page_url(&api, 1).unwrap(), "<html>oops</html>");

        let result = scrape_api(&fetcher, &site(), &api, budget(), Duration::ZERO, &CancellationToken::new()).await;
        assert!(matches!(result, Err(AppError::Scrape { .. })));
    }
}
