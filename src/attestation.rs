//! Attestation polling for CCTP burns.
//!
//! A confirmed burn starts a [`CheckAttestation`] job. Each poll asks Circle
//! once: a pending answer re-enqueues the next poll after the speed's
//! interval, a complete answer starts the mint, and a failed answer is
//! terminal. Transport errors never reach this module as errors because the
//! burn is already final on the source chain.

pub(crate) mod mint;

use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::{Address, TxHash};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};
use uuid::Uuid;

use st0x_bridge::cctp::CircleApi;
use st0x_bridge::{AttestationStatus, Domain, TransferSpeed};

use crate::conductor::{
    Enqueued, Job, JobData, JobError, JobHandler, JobKind, JobOutcome, JobPayload, JobQueue,
};
use crate::ledger::RebalanceLedger;
use crate::strategy::StrategyContext;
use crate::token::ChainId;

use mint::ExecuteMint;

/// Delay between attestation polls per transfer speed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PollIntervals {
    pub(crate) fast: Duration,
    pub(crate) standard: Duration,
}

impl PollIntervals {
    pub(crate) const fn for_speed(&self, speed: TransferSpeed) -> Duration {
        match speed {
            TransferSpeed::Fast => self.fast,
            TransferSpeed::Standard => self.standard,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CheckAttestation {
    pub(crate) correlation_id: Uuid,
    pub(crate) wallet: Address,
    pub(crate) burn_tx: TxHash,
    pub(crate) source_domain: Domain,
    pub(crate) destination_chain_id: ChainId,
    pub(crate) context: StrategyContext,
    /// Number of polls before this one. Part of the step so every re-enqueue
    /// gets its own idempotency key.
    pub(crate) poll_sequence: u64,
}

impl CheckAttestation {
    #[must_use]
    fn next_poll(&self) -> Self {
        Self {
            poll_sequence: self.poll_sequence + 1,
            ..self.clone()
        }
    }
}

impl JobData for CheckAttestation {
    const KIND: JobKind = JobKind::CheckAttestation;

    fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }

    fn step(&self) -> String {
        format!("poll:{}", self.poll_sequence)
    }
}

impl From<CheckAttestation> for JobPayload {
    fn from(data: CheckAttestation) -> Self {
        Self::CheckAttestation(data)
    }
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum AttestationError {
    #[error("attestation for burn {burn_tx} will never complete: {reason}")]
    Rejected { burn_tx: TxHash, reason: String },
}

pub(crate) struct CheckAttestationHandler {
    circle: Arc<dyn CircleApi>,
    intervals: PollIntervals,
    ledger: RebalanceLedger,
}

impl CheckAttestationHandler {
    pub(crate) fn new(
        circle: Arc<dyn CircleApi>,
        intervals: PollIntervals,
        ledger: RebalanceLedger,
    ) -> Self {
        Self {
            circle,
            intervals,
            ledger,
        }
    }

    fn data<'a>(&self, job: &'a Job) -> Result<&'a CheckAttestation, JobError> {
        match &job.payload {
            JobPayload::CheckAttestation(check) => Ok(check),
            other => Err(JobError::wrong_payload(self.kind(), other)),
        }
    }

    /// Standard interval when the context carries no speed.
    fn poll_delay(&self, check: &CheckAttestation) -> Duration {
        let speed = check
            .context
            .transfer_speed()
            .unwrap_or(TransferSpeed::Standard);

        self.intervals.for_speed(speed)
    }
}

#[async_trait]
impl JobHandler for CheckAttestationHandler {
    fn kind(&self) -> JobKind {
        JobKind::CheckAttestation
    }

    async fn process(&self, job: &Job, _queue: &dyn JobQueue) -> Result<JobOutcome, JobError> {
        let check = self.data(job)?;

        match self.circle.attestation(check.source_domain, check.burn_tx).await {
            AttestationStatus::Pending { reason } => {
                debug!(
                    correlation_id = %check.correlation_id,
                    burn_tx = %check.burn_tx,
                    poll = check.poll_sequence,
                    %reason,
                    "Attestation pending"
                );
                Ok(JobOutcome::Pending)
            }
            AttestationStatus::Complete(attestation) => {
                info!(
                    correlation_id = %check.correlation_id,
                    burn_tx = %check.burn_tx,
                    nonce = %attestation.nonce,
                    polls = check.poll_sequence + 1,
                    "Attestation received"
                );
                Ok(JobOutcome::Attested(attestation))
            }
            AttestationStatus::Failed { reason } => {
                Err(JobError::unrecoverable(AttestationError::Rejected {
                    burn_tx: check.burn_tx,
                    reason,
                }))
            }
        }
    }

    async fn on_complete(
        &self,
        job: &Job,
        outcome: JobOutcome,
        queue: &dyn JobQueue,
    ) -> Result<(), JobError> {
        let check = self.data(job)?;

        match outcome {
            JobOutcome::Pending => {
                let delay = self.poll_delay(check);
                let next = check.next_poll();
                let poll = next.poll_sequence;

                if let Enqueued::Duplicate = queue.start(next.into(), delay).await? {
                    debug!(correlation_id = %check.correlation_id, poll, "Next poll already queued");
                }
                Ok(())
            }
            JobOutcome::Attested(attestation) => {
                let mint = ExecuteMint {
                    correlation_id: check.correlation_id,
                    wallet: check.wallet,
                    destination_chain_id: check.destination_chain_id,
                    burn_tx: check.burn_tx,
                    message: attestation.message,
                    attestation: attestation.attestation,
                    nonce: attestation.nonce,
                    context: check.context.clone(),
                    mint_tx: None,
                };

                queue.start(mint.into(), Duration::ZERO).await?;
                Ok(())
            }
            other => Err(JobError::unexpected_outcome(self.kind(), &other)),
        }
    }

    async fn on_failed(&self, job: &Job, failure: &JobError) {
        let Ok(check) = self.data(job) else {
            return;
        };

        error!(
            correlation_id = %check.correlation_id,
            burn_tx = %check.burn_tx,
            source_domain = %check.source_domain,
            error = %failure,
            "Attestation failed, burned USDC needs manual recovery"
        );

        if let Err(ledger_error) = self
            .ledger
            .mark_failed(check.correlation_id, &failure.to_string())
            .await
        {
            error!(correlation_id = %check.correlation_id, %ledger_error, "Failed to record attestation failure");
        }
    }
}
