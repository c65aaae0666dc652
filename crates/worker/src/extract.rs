//! Pull advertiser stats and ad cards out of Ad Library pages.
//!
//! The library renders from JSON blobs embedded in the HTML; when those are
//! present they are authoritative. The visible "~1,200 results" label is the
//! fallback for the active ad count.

use regex::Regex;
use std::collections::HashSet;
use std::sync::LazyLock;

use ad_radar_common::{AdSummary, ScrapeError, ScrapeResult, SearchResults};

static JSON_COUNT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""(?:search_results_count|total_count|totalCount)"\s*:\s*(\d+)"#)
        .expect("valid regex")
});

static VISIBLE_COUNT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)~?\s*(\d[\d,.]*)\s*([KM])?\s+results?\b").expect("valid regex")
});

static NO_RESULTS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)no ads match|\b0 results\b").expect("valid regex")
});

static PAGE_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""(?:page_name|pageName)"\s*:\s*("(?:[^"\\]|\\.)*")"#).expect("valid regex")
});

static AD_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""ad_archive_id"\s*:\s*"?(\d+)"?"#).expect("valid regex")
});

static PAGE_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""page_id"\s*:\s*"?(\d+)"?"#).expect("valid regex")
});

static BODY_TEXT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""body"\s*:\s*\{\s*"text"\s*:\s*("(?:[^"\\]|\\.)*")"#).expect("valid regex")
});

static START_DATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""start_date"\s*:\s*(\d+)"#).expect("valid regex")
});

/// Stats found on an advertiser's library page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageStats {
    pub advertiser_name: Option<String>,
    pub total_active_ads: u64,
}

/// Extract the advertiser name and active ad count.
///
/// Fails with `ScrapeError::Parse` when no count can be found, which usually
/// means the page is rendered client-side and needs a browser.
pub fn extract_page_stats(html: &str) -> ScrapeResult<PageStats> {
    let total_active_ads = extract_result_count(html)
        .ok_or_else(|| ScrapeError::Parse("no active ad count on page".to_string()))?;

    Ok(PageStats {
        advertiser_name: first_json_string(&PAGE_NAME, html),
        total_active_ads,
    })
}

pub fn extract_result_count(html: &str) -> Option<u64> {
    if let Some(count) = JSON_COUNT
        .captures(html)
        .and_then(|caps| caps[1].parse::<u64>().ok())
    {
        return Some(count);
    }

    if let Some(caps) = VISIBLE_COUNT.captures(html) {
        return parse_abbreviated(&caps[1], caps.get(2).map(|m| m.as_str()));
    }

    NO_RESULTS.is_match(html).then_some(0)
}

/// "1,200" -> 1200, "1.2" + "K" -> 1200, "3" + "M" -> 3000000
fn parse_abbreviated(number: &str, suffix: Option<&str>) -> Option<u64> {
    let multiplier = match suffix.map(|s| s.to_ascii_uppercase()) {
        Some(s) if s == "K" => 1_000.0,
        Some(s) if s == "M" => 1_000_000.0,
        _ => 1.0,
    };

    if multiplier == 1.0 {
        // Without a suffix both separators are thousands separators
        let digits: String = number.chars().filter(|c| c.is_ascii_digit()).collect();
        return digits.parse().ok();
    }

    let normalized = number.replace(',', ".");
    let value: f64 = normalized.parse().ok()?;
    Some((value * multiplier).round() as u64)
}

/// Extract ad cards from a search results page, in page order, without
/// duplicates.
pub fn extract_ads(html: &str) -> SearchResults {
    let starts: Vec<(usize, String)> = AD_ID
        .captures_iter(html)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            Some((whole.start(), caps[1].to_string()))
        })
        .collect();

    let mut seen = HashSet::new();
    let mut ads = Vec::new();
    for (i, (start, ad_id)) in starts.iter().enumerate() {
        if !seen.insert(ad_id.clone()) {
            continue;
        }
        let end = starts.get(i + 1).map(|(next, _)| *next).unwrap_or(html.len());
        let window = &html[*start..end];

        ads.push(AdSummary {
            ad_id: ad_id.clone(),
            page_id: PAGE_ID.captures(window).map(|caps| caps[1].to_string()),
            page_name: first_json_string(&PAGE_NAME, window),
            body: first_json_string(&BODY_TEXT, window),
            started_running: START_DATE.captures(window).map(|caps| caps[1].to_string()),
        });
    }

    SearchResults {
        total_reported: extract_result_count(html),
        ads,
    }
}

/// First capture of `pattern`, decoded as a JSON string literal.
fn first_json_string(pattern: &Regex, haystack: &str) -> Option<String> {
    let literal = pattern.captures(haystack)?.get(1)?.as_str();
    serde_json::from_str::<String>(literal)
        .ok()
        .filter(|s| !s.trim().is_empty())
}
