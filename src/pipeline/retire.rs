// src/pipeline/retire.rs

//! Retirement of listings that disappeared from a site.

use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};

use crate::error::Result;
use crate::storage::PropertyStore;

/// Deactivate active listings of `site_id` absent from `seen_keys` and not
/// seen for longer than `grace`. Returns how many were deactivated.
///
/// Only call this after a full harvest; a truncated one would retire
/// listings that were simply never reached.
pub async fn retire_missing(
    store: &dyn PropertyStore,
    site_id: &str,
    seen_keys: &HashSet<String>,
    grace: Duration,
    at: DateTime<Utc>,
) -> Result<usize> {
    let cutoff = at - grace;
    let mut retired = 0;

    for record in store.active_for_site(site_id).await? {
        if seen_keys.contains(&record.dedup_key) || record.last_seen_at > cutoff {
            continue;
        }
        if store.deactivate(&record.dedup_key, at).await? {
            log::debug!("{}: retired {}", site_id, record.source_url);
            retired += 1;
        }
    }

    if retired > 0 {
        log::info!("{}: retired {} listing(s) no longer published", site_id, retired);
    }
    Ok(retired)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::fixtures::property;
    use crate::storage::MemoryStore;

    #[tokio::test]
    async fn test_retires_only_stale_missing_listings() {
        let store = MemoryStore::new();
        let now = Utc::now();

        let mut stale = property("stale", "s");
        stale.last_seen_at = now - Duration::hours(100);
        let mut recent = property("recent", "s");
        recent.last_seen_at = now - Duration::hours(2);
        let mut seen = property("seen", "s");
        seen.last_seen_at = now - Duration::hours(100);
        let mut other = property("other", "t");
        other.last_seen_at = now - Duration::hours(100);
        for record in [stale, recent, seen, other] {
            store.insert(record).await.unwrap();
        }

        let seen_keys: HashSet<String> = ["seen".to_string()].into();
        let retired = retire_missing(&store, "s", &seen_keys, Duration::hours(72), now)
            .await
            .unwrap();

        assert_eq!(retired, 1);
        assert!(!store.get("stale").await.unwrap().unwrap().is_active);
        assert!(store.get("recent").await.unwrap().unwrap().is_active);
        assert!(store.get("seen").await.unwrap().unwrap().is_active);
        assert!(store.get("other").await.unwrap().unwrap().is_active);

        // Second pass is a no-op.
        let again = retire_missing(&store, "s", &seen_keys, Duration::hours(72), now)
            .await
            .unwrap();
        assert_eq!(again, 0);
    }
}
