//! Priority job queue with per-user cancellation.

pub mod cancellation;
mod job;
mod queue;

pub use cancellation::{check_cancellation, CancellationExt};
pub use job::{
    JobContext, JobHandler, JobId, JobKind, JobOutput, JobRequest, JobTicket, JobType,
    ScrapePayload, StatsFetchPayload,
};
pub use queue::{JobQueue, QueueCounters};
