use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;

use ad_radar_common::utils::now_millis;
use ad_radar_common::{
    AdvertiserStats, FetchStrategy, ScrapeError, ScrapeResult, ScraperConfig, SearchQuery,
    SearchResults,
};
use ad_radar_queue::{CancellationExt, JobContext, JobHandler, JobKind, JobOutput};

use crate::browser_pool::BrowserPool;
use crate::connection_pool::{ConnectionPool, FetchRequest};
use crate::extract::{self, PageStats};

const SCROLL_SCRIPT: &str = "window.scrollTo(0, document.body.scrollHeight); true";

/// Library URL listing the active ads of one page
pub fn page_url(base: &str, page_id: &str, country: &str) -> ScrapeResult<String> {
    let mut url = parse_base(base)?;
    url.query_pairs_mut()
        .append_pair("active_status", "active")
        .append_pair("ad_type", "all")
        .append_pair("country", country)
        .append_pair("view_all_page_id", page_id)
        .append_pair("search_type", "page")
        .append_pair("media_type", "all");
    Ok(url.into())
}

/// Library URL for a keyword search
pub fn search_url(base: &str, query: &SearchQuery) -> ScrapeResult<String> {
    let mut url = parse_base(base)?;
    url.query_pairs_mut()
        .append_pair(
            "active_status",
            if query.active_only { "active" } else { "all" },
        )
        .append_pair("ad_type", query.ad_type.as_deref().unwrap_or("all"))
        .append_pair("country", &query.country)
        .append_pair("q", &query.query)
        .append_pair("search_type", "keyword_unordered")
        .append_pair("media_type", query.media_type.as_deref().unwrap_or("all"));
    Ok(url.into())
}

fn parse_base(base: &str) -> ScrapeResult<Url> {
    Url::parse(base).map_err(|e| ScrapeError::Config(format!("invalid ad library url: {}", e)))
}

/// Load `url` in a pooled browser and return the rendered HTML.
async fn render(
    browsers: &BrowserPool,
    url: &str,
    scroll_passes: u32,
    token: &CancellationToken,
    job: &JobContext,
) -> ScrapeResult<String> {
    let lease = browsers
        .acquire()
        .with_cancellation(token, "browser acquire")
        .await?;
    debug!(job_id = %job.id, instance_id = %lease.id(), "Rendering {}", url);

    let session = Arc::clone(lease.session());
    let rendered = async {
        session
            .navigate(url)
            .with_cancellation(token, "navigation")
            .await?;

        // Results load in as the page scrolls
        for _ in 0..scroll_passes {
            session
                .evaluate(SCROLL_SCRIPT)
                .with_cancellation(token, "scroll")
                .await?;
            tokio::time::sleep(Duration::from_millis(750)).await;
        }

        session
            .content()
            .with_cancellation(token, "get_content")
            .await
    }
    .await;

    match rendered {
        Ok(html) => {
            browsers.release(lease);
            Ok(html)
        }
        Err(e) => {
            // An abandoned CDP call may still be driving the page
            browsers.retire(lease, &e.to_string()).await;
            Err(e)
        }
    }
}

/// Resolves `stats-fetch` jobs into `AdvertiserStats`.
pub struct StatsFetchHandler {
    connections: Arc<ConnectionPool>,
    browsers: Arc<BrowserPool>,
    config: ScraperConfig,
}

impl StatsFetchHandler {
    pub fn new(
        connections: Arc<ConnectionPool>,
        browsers: Arc<BrowserPool>,
        config: ScraperConfig,
    ) -> Self {
        Self {
            connections,
            browsers,
            config,
        }
    }

    async fn via_http(
        &self,
        url: &str,
        retries: Option<u32>,
        token: &CancellationToken,
    ) -> ScrapeResult<PageStats> {
        let mut request = FetchRequest::get(url).cancel_on(token.clone());
        request.retries = retries;
        let html = self.connections.fetch(request).await?;
        extract::extract_page_stats(&html)
    }

    async fn via_browser(
        &self,
        url: &str,
        token: &CancellationToken,
        job: &JobContext,
    ) -> ScrapeResult<PageStats> {
        let html = render(&self.browsers, url, 0, token, job).await?;
        extract::extract_page_stats(&html)
    }
}

#[async_trait]
impl JobHandler for StatsFetchHandler {
    async fn handle(&self, job: &JobContext, token: CancellationToken) -> ScrapeResult<JobOutput> {
        let JobKind::StatsFetch(payload) = &job.kind else {
            return Err(ScrapeError::Internal(format!(
                "stats handler received {} job",
                job.kind.job_type()
            )));
        };
        let url = page_url(&self.config.ad_library_url, &payload.page_id, &payload.country)?;

        let page = match self.config.fetch_strategy {
            FetchStrategy::HttpOnly => self.via_http(&url, None, &token).await?,
            FetchStrategy::BrowserOnly => self.via_browser(&url, &token, job).await?,
            FetchStrategy::HttpThenBrowser => match self.via_http(&url, Some(0), &token).await {
                Ok(page) => page,
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    debug!(
                        job_id = %job.id,
                        page_id = %payload.page_id,
                        "Static fetch gave no stats ({}), falling back to browser",
                        e
                    );
                    self.via_browser(&url, &token, job).await?
                }
            },
        };

        info!(
            job_id = %job.id,
            page_id = %payload.page_id,
            country = %payload.country,
            "Advertiser has {} active ads",
            page.total_active_ads
        );

        Ok(JobOutput::Stats(AdvertiserStats {
            page_id: payload.page_id.clone(),
            advertiser_name: page
                .advertiser_name
                .unwrap_or_else(|| payload.page_id.clone()),
            total_active_ads: page.total_active_ads,
            last_updated: now_millis(),
        }))
    }

    fn name(&self) -> &str {
        "stats-fetch"
    }
}

/// Resolves `scrape` jobs (keyword searches) in a browser.
pub struct ScrapeHandler {
    browsers: Arc<BrowserPool>,
    config: ScraperConfig,
    scroll_passes: u32,
}

impl ScrapeHandler {
    pub fn new(browsers: Arc<BrowserPool>, config: ScraperConfig) -> Self {
        Self {
            browsers,
            config,
            scroll_passes: 2,
        }
    }

    pub fn with_scroll_passes(mut self, scroll_passes: u32) -> Self {
        self.scroll_passes = scroll_passes;
        self
    }
}

#[async_trait]
impl JobHandler for ScrapeHandler {
    async fn handle(&self, job: &JobContext, token: CancellationToken) -> ScrapeResult<JobOutput> {
        let JobKind::Scrape(payload) = &job.kind else {
            return Err(ScrapeError::Internal(format!(
                "scrape handler received {} job",
                job.kind.job_type()
            )));
        };
        let url = search_url(&self.config.ad_library_url, &payload.query)?;
        let html = render(&self.browsers, &url, self.scroll_passes, &token, job).await?;

        let results: SearchResults = extract::extract_ads(&html);
        info!(
            job_id = %job.id,
            query = %payload.query.query,
            "Search returned {} ads (site reports {:?})",
            results.ads.len(),
            results.total_reported
        );
        Ok(JobOutput::Search(results))
    }

    fn name(&self) -> &str {
        "scrape"
    }
}
