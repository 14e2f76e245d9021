//! Job kinds, the handler contract and the registry that dispatches to it.
//!
//! Every unit of work is one variant of [`JobPayload`]. The payload carries
//! everything a step needs to resume, so any worker can pick it up after a
//! restart. Handlers never reference each other: a step that needs to chain
//! into another kind builds that kind's data and hands it to the
//! [`JobStarter`] it was given.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::{B256, TxHash, keccak256};
use async_trait::async_trait;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tracing::warn;
use uuid::Uuid;

use st0x_bridge::Attestation;

use super::queue::{JobQueue, QueueError};
use crate::attestation::CheckAttestation;
use crate::attestation::mint::ExecuteMint;
use crate::destination_swap::DestinationSwap;
use crate::ledger::LedgerError;
use crate::orchestrator::{CheckBalances, ExecuteRebalance};
use crate::rebalancing::RebalanceRequest;
use crate::strategy::{ExecutionError, Settlement};
use crate::wallet::{TxReceipt, WalletError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub(crate) enum JobKind {
    CheckBalances,
    ExecuteRebalance,
    CheckAttestation,
    ExecuteMint,
    DestinationSwap,
}

impl JobKind {
    pub(crate) const fn as_str(self) -> &'static str {
        match self {
            Self::CheckBalances => "CheckBalances",
            Self::ExecuteRebalance => "ExecuteRebalance",
            Self::CheckAttestation => "CheckAttestation",
            Self::ExecuteMint => "ExecuteMint",
            Self::DestinationSwap => "DestinationSwap",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Exponential backoff applied by the queue when a job fails retryably.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RetryPolicy {
    pub(crate) max_attempts: u32,
    pub(crate) base_delay: Duration,
    pub(crate) multiplier: u32,
}

impl RetryPolicy {
    pub(crate) const DEFAULT: Self = Self {
        max_attempts: 3,
        base_delay: Duration::from_secs(10),
        multiplier: 2,
    };

    /// Delay before the retry that follows `attempts_made` failed attempts.
    pub(crate) fn delay_after(&self, attempts_made: u32) -> Duration {
        let exponent = attempts_made.saturating_sub(1);
        let factor = self.multiplier.saturating_pow(exponent);
        self.base_delay.saturating_mul(factor)
    }
}

/// Data for one job kind.
pub(crate) trait JobData: Serialize + DeserializeOwned + Into<JobPayload> {
    const KIND: JobKind;

    fn correlation_id(&self) -> Uuid;

    /// Deterministic position of this unit of work within its workflow.
    fn step(&self) -> String;

    fn retry_policy() -> RetryPolicy {
        RetryPolicy::DEFAULT
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data")]
pub(crate) enum JobPayload {
    CheckBalances(CheckBalances),
    ExecuteRebalance(ExecuteRebalance),
    CheckAttestation(CheckAttestation),
    ExecuteMint(ExecuteMint),
    DestinationSwap(DestinationSwap),
}

macro_rules! dispatch {
    ($payload:expr, $data:ident => $body:expr) => {
        match $payload {
            JobPayload::CheckBalances($data) => $body,
            JobPayload::ExecuteRebalance($data) => $body,
            JobPayload::CheckAttestation($data) => $body,
            JobPayload::ExecuteMint($data) => $body,
            JobPayload::DestinationSwap($data) => $body,
        }
    };
}

fn kind_of<D: JobData>(_: &D) -> JobKind {
    D::KIND
}

fn retry_policy_of<D: JobData>(_: &D) -> RetryPolicy {
    D::retry_policy()
}

impl JobPayload {
    pub(crate) fn kind(&self) -> JobKind {
        dispatch!(self, data => kind_of(data))
    }

    pub(crate) fn correlation_id(&self) -> Uuid {
        dispatch!(self, data => data.correlation_id())
    }

    pub(crate) fn step(&self) -> String {
        dispatch!(self, data => data.step())
    }

    pub(crate) fn retry_policy(&self) -> RetryPolicy {
        dispatch!(self, data => retry_policy_of(data))
    }

    pub(crate) fn idempotency_key(&self) -> IdempotencyKey {
        IdempotencyKey::new(self.kind(), self.correlation_id(), &self.step())
    }
}

/// `keccak256(kind:correlation_id:step)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct IdempotencyKey(B256);

impl IdempotencyKey {
    pub(crate) fn new(kind: JobKind, correlation_id: Uuid, step: &str) -> Self {
        Self(keccak256(format!("{kind}:{correlation_id}:{step}")))
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{:#x}", self.0)
    }
}

/// A dequeued unit of work.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Job {
    pub(crate) id: i64,
    pub(crate) payload: JobPayload,
    pub(crate) correlation_id: Uuid,
    pub(crate) attempts_made: u32,
    pub(crate) max_attempts: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Enqueued {
    Queued(i64),
    /// A job with the same idempotency key already exists.
    Duplicate,
}

#[async_trait]
pub(crate) trait JobStarter: Send + Sync + 'static {
    /// Enqueues `payload` to run no earlier than `delay` from now.
    async fn start(&self, payload: JobPayload, delay: Duration) -> Result<Enqueued, QueueError>;
}

/// Successful result of [`JobHandler::process`], consumed by
/// [`JobHandler::on_complete`].
#[derive(Debug)]
pub(crate) enum JobOutcome {
    Done,
    /// External state is not ready yet. The handler re-enqueues itself.
    Pending,
    Planned(Vec<RebalanceRequest>),
    Settled(Settlement),
    Attested(Attestation),
    Confirmed(TxReceipt),
    /// The CCTP message is on the destination chain. `None` when it was
    /// delivered without a mint tx of ours.
    Minted(Option<TxHash>),
}

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub(crate) enum JobError {
    #[error("{0}")]
    Retryable(#[source] BoxError),
    #[error("unrecoverable: {0}")]
    Unrecoverable(#[source] BoxError),
    #[error("{handler} handler received a {received} job")]
    WrongPayload { handler: JobKind, received: JobKind },
    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl JobError {
    pub(crate) fn retryable(error: impl Into<BoxError>) -> Self {
        Self::Retryable(error.into())
    }

    pub(crate) fn unrecoverable(error: impl Into<BoxError>) -> Self {
        Self::Unrecoverable(error.into())
    }

    pub(crate) const fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_) | Self::Queue(_))
    }

    pub(crate) fn wrong_payload(handler: JobKind, payload: &JobPayload) -> Self {
        let received = payload.kind();

        Self::WrongPayload { handler, received }
    }

    pub(crate) fn unexpected_outcome(handler: JobKind, outcome: &JobOutcome) -> Self {
        Self::unrecoverable(format!("{handler} handler cannot complete with {outcome:?}"))
    }
}

impl From<WalletError> for JobError {
    fn from(error: WalletError) -> Self {
        if error.is_transient() {
            Self::retryable(error)
        } else {
            Self::unrecoverable(error)
        }
    }
}

impl From<ExecutionError> for JobError {
    fn from(error: ExecutionError) -> Self {
        if error.is_retryable() {
            Self::retryable(error)
        } else {
            Self::unrecoverable(error)
        }
    }
}

/// The ledger is local SQLite; failures there are transient.
impl From<LedgerError> for JobError {
    fn from(error: LedgerError) -> Self {
        Self::retryable(error)
    }
}

/// Lifecycle of one job kind.
///
/// `process` runs at least once per job and must tolerate being re-run with
/// the same payload after a crash. `on_complete` chains the next step from
/// the job's own data. `on_failed` runs once the queue has given up.
#[async_trait]
pub(crate) trait JobHandler: Send + Sync + 'static {
    fn kind(&self) -> JobKind;

    fn matches(&self, job: &Job) -> bool {
        job.payload.kind() == self.kind()
    }

    async fn process(&self, job: &Job, queue: &dyn JobQueue) -> Result<JobOutcome, JobError>;

    async fn on_complete(
        &self,
        job: &Job,
        outcome: JobOutcome,
        queue: &dyn JobQueue,
    ) -> Result<(), JobError>;

    async fn on_failed(&self, job: &Job, error: &JobError) {
        warn!(
            job_id = job.id,
            kind = %job.payload.kind(),
            correlation_id = %job.correlation_id,
            attempts_made = job.attempts_made,
            %error,
            "Job failed permanently"
        );
    }
}

#[derive(Default)]
pub(crate) struct JobRegistry {
    handlers: Vec<Arc<dyn JobHandler>>,
}

impl JobRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub(crate) fn with(mut self, handler: Arc<dyn JobHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    pub(crate) fn handler_for(&self, job: &Job) -> Option<&Arc<dyn JobHandler>> {
        self.handlers.iter().find(|handler| handler.matches(job))
    }
}
