use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use ad_radar_common::{AdvertiserStats, ScrapeError, ScrapeResult, SearchQuery, SearchResults};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobType {
    StatsFetch,
    Scrape,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StatsFetch => "stats-fetch",
            Self::Scrape => "scrape",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsFetchPayload {
    pub page_id: String,
    pub country: String,
}

#[derive(Debug, Clone)]
pub struct ScrapePayload {
    pub query: SearchQuery,
}

/// Work item carried by a job, one variant per job type
#[derive(Debug, Clone)]
pub enum JobKind {
    StatsFetch(StatsFetchPayload),
    Scrape(ScrapePayload),
}

impl JobKind {
    pub fn job_type(&self) -> JobType {
        match self {
            Self::StatsFetch(_) => JobType::StatsFetch,
            Self::Scrape(_) => JobType::Scrape,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobOutput {
    Stats(AdvertiserStats),
    Search(SearchResults),
}

/// `{type}-{unix_millis}-{random suffix}`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobId(String);

impl JobId {
    pub fn generate(job_type: JobType) -> Self {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        Self(format!(
            "{}-{}-{}",
            job_type.as_str(),
            ad_radar_common::utils::now_millis(),
            &suffix[..9]
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Submission parameters
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub kind: JobKind,
    /// Higher is served first
    pub priority: i32,
    /// None uses the queue default
    pub max_retries: Option<u32>,
    pub user_id: Option<String>,
}

impl JobRequest {
    pub fn new(kind: JobKind) -> Self {
        Self {
            kind,
            priority: 0,
            max_retries: None,
            user_id: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn for_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }
}

/// What a handler sees of the job it runs
#[derive(Debug, Clone)]
pub struct JobContext {
    pub id: JobId,
    pub kind: JobKind,
    /// 0 on the first run, incremented per retry
    pub attempt: u32,
    pub user_id: Option<String>,
}

/// Executes jobs of one type.
///
/// The token fires when the owning user cancels the job or the queue shuts
/// down; long operations should race against it (see `CancellationExt`).
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &JobContext, token: CancellationToken) -> ScrapeResult<JobOutput>;

    fn name(&self) -> &str;
}

/// Future returned by `JobQueue::submit`. Resolves exactly once with the
/// job's result, a final error, or `ScrapeError::Cancelled`.
#[must_use = "a job ticket does nothing unless awaited"]
pub struct JobTicket {
    id: JobId,
    rx: oneshot::Receiver<ScrapeResult<JobOutput>>,
}

impl JobTicket {
    pub(crate) fn new(id: JobId, rx: oneshot::Receiver<ScrapeResult<JobOutput>>) -> Self {
        Self { id, rx }
    }

    pub fn id(&self) -> &JobId {
        &self.id
    }
}

impl Future for JobTicket {
    type Output = ScrapeResult<JobOutput>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(ScrapeError::Internal(format!(
                "job {} was dropped without settling",
                self.id
            )))),
            Poll::Pending => Poll::Pending,
        }
    }
}
