//! Durable job orchestration: job kinds, the SQLite queue and workers.

pub(crate) mod job;
pub(crate) mod queue;
pub(crate) mod worker;

pub(crate) use job::{
    Enqueued, Job, JobData, JobError, JobHandler, JobKind, JobOutcome, JobPayload, JobRegistry,
    JobStarter, RetryPolicy,
};
pub(crate) use queue::{JobQueue, JobRecord, JobStatus, QueueError, SqliteJobQueue};
pub(crate) use worker::Worker;
