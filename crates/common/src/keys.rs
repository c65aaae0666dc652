//! Cache key derivation.
//!
//! Keys are pure functions of the normalized request parameters. Anything
//! that does not change the upstream result (pagination, casing, stray
//! whitespace, keyword order) is normalized away so equivalent requests
//! share one entry.

use sha2::{Digest, Sha256};

use crate::types::SearchQuery;
use crate::utils::{normalize_country, normalize_page_id};

pub const STATS_PREFIX: &str = "stats";
pub const SEARCH_PREFIX: &str = "search";
pub const SUGGESTIONS_PREFIX: &str = "ai";

pub fn stats_key(page_id: &str, country: &str) -> String {
    format!(
        "{}:{}:{}",
        STATS_PREFIX,
        normalize_page_id(page_id),
        normalize_country(country)
    )
}

pub fn search_key(query: &SearchQuery) -> String {
    let canonical = serde_json::json!({
        "q": query.query.trim().to_lowercase(),
        "country": normalize_country(&query.country),
        "adType": query
            .ad_type
            .as_deref()
            .map(|t| t.trim().to_lowercase())
            .unwrap_or_else(|| "all".to_string()),
        "mediaType": query
            .media_type
            .as_deref()
            .map(|t| t.trim().to_lowercase())
            .unwrap_or_else(|| "all".to_string()),
        "activeOnly": query.active_only,
    });
    format!("{}:{}", SEARCH_PREFIX, sha256_hex(canonical.to_string().as_bytes()))
}

pub fn suggestions_key(keywords: &[String]) -> String {
    let mut normalized: Vec<String> = keywords
        .iter()
        .map(|k| k.trim().to_lowercase())
        .filter(|k| !k.is_empty())
        .collect();
    normalized.sort();
    normalized.dedup();
    format!(
        "{}:{}",
        SUGGESTIONS_PREFIX,
        sha256_hex(normalized.join("\n").as_bytes())
    )
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(q: &str, offset: usize, limit: Option<usize>) -> SearchQuery {
        SearchQuery {
            query: q.to_string(),
            country: "us".to_string(),
            offset,
            limit,
            ..Default::default()
        }
    }

    #[test]
    fn test_stats_key_is_normalized() {
        assert_eq!(stats_key(" 12345 ", "us"), "stats:12345:US");
        assert_eq!(stats_key("12345", ""), "stats:12345:ALL");
        assert_eq!(stats_key("12345", "all"), stats_key("12345", "ALL"));
    }

    #[test]
    fn test_search_key_ignores_pagination() {
        let first_page = search_key(&query("Running Shoes", 0, Some(20)));
        let second_page = search_key(&query("running shoes ", 20, Some(20)));
        assert_eq!(first_page, second_page);
        assert!(first_page.starts_with("search:"));
    }

    #[test]
    fn test_search_key_distinguishes_queries() {
        assert_ne!(
            search_key(&query("shoes", 0, None)),
            search_key(&query("boots", 0, None))
        );

        let mut active = query("shoes", 0, None);
        active.active_only = true;
        assert_ne!(search_key(&active), search_key(&query("shoes", 0, None)));
    }

    #[test]
    fn test_suggestions_key_ignores_order_and_case() {
        let a = suggestions_key(&["Shoes".to_string(), "boots".to_string()]);
        let b = suggestions_key(&["boots".to_string(), " shoes".to_string(), "BOOTS".to_string()]);
        assert_eq!(a, b);
    }
}
