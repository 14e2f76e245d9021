//! Relays an attested CCTP message to the destination chain.

use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::{Address, Bytes, FixedBytes, TxHash};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use st0x_bridge::cctp::{decode_used_nonce, receive_message_calldata, used_nonces_calldata};

use crate::cctp::{CctpChain, CctpConfig};
use crate::conductor::{
    Job, JobData, JobError, JobHandler, JobKind, JobOutcome, JobPayload, JobQueue,
};
use crate::destination_swap::DestinationSwap;
use crate::ledger::RebalanceLedger;
use crate::strategy::StrategyContext;
use crate::token::ChainId;
use crate::wallet::{Call, Wallet, WalletError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ExecuteMint {
    pub(crate) correlation_id: Uuid,
    pub(crate) wallet: Address,
    pub(crate) destination_chain_id: ChainId,
    pub(crate) burn_tx: TxHash,
    pub(crate) message: Bytes,
    pub(crate) attestation: Bytes,
    pub(crate) nonce: FixedBytes<32>,
    pub(crate) context: StrategyContext,
    /// Set once `receiveMessage` has been sent, so a retry waits for that
    /// transaction instead of relaying twice.
    pub(crate) mint_tx: Option<TxHash>,
}

impl JobData for ExecuteMint {
    const KIND: JobKind = JobKind::ExecuteMint;

    fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }

    fn step(&self) -> String {
        "mint".to_string()
    }
}

impl From<ExecuteMint> for JobPayload {
    fn from(data: ExecuteMint) -> Self {
        Self::ExecuteMint(data)
    }
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum MintError {
    #[error("no CCTP message transmitter configured for chain {0}")]
    UnknownChain(ChainId),
    #[error("malformed usedNonces response: {0}")]
    NonceLookup(#[from] alloy::sol_types::Error),
}

pub(crate) struct ExecuteMintHandler {
    wallet: Arc<dyn Wallet>,
    config: CctpConfig,
    ledger: RebalanceLedger,
}

impl ExecuteMintHandler {
    pub(crate) fn new(wallet: Arc<dyn Wallet>, config: CctpConfig, ledger: RebalanceLedger) -> Self {
        Self {
            wallet,
            config,
            ledger,
        }
    }

    fn data<'a>(&self, job: &'a Job) -> Result<&'a ExecuteMint, JobError> {
        match &job.payload {
            JobPayload::ExecuteMint(mint) => Ok(mint),
            other => Err(JobError::wrong_payload(self.kind(), other)),
        }
    }

    fn chain(&self, mint: &ExecuteMint) -> Result<&CctpChain, JobError> {
        self.config
            .chain(mint.destination_chain_id)
            .ok_or_else(|| JobError::unrecoverable(MintError::UnknownChain(mint.destination_chain_id)))
    }

    /// Whether the destination transmitter has already received this
    /// message, by us on an earlier attempt or by any other relayer.
    async fn already_received(&self, chain: &CctpChain, mint: &ExecuteMint) -> Result<bool, JobError> {
        let lookup = Call::new(chain.message_transmitter, used_nonces_calldata(mint.nonce));
        let output = self.wallet.read(chain.chain_id, &lookup).await?;

        decode_used_nonce(&output).map_err(|error| JobError::retryable(MintError::from(error)))
    }

    async fn send_mint(
        &self,
        job: &Job,
        mint: &ExecuteMint,
        chain: &CctpChain,
        queue: &dyn JobQueue,
    ) -> Result<TxHash, JobError> {
        let call = Call::new(
            chain.message_transmitter,
            receive_message_calldata(mint.message.clone(), mint.attestation.clone()),
        );

        let mint_tx = self
            .wallet
            .execute(mint.wallet, chain.chain_id, &[call])
            .await?;

        info!(
            correlation_id = %mint.correlation_id,
            %mint_tx,
            nonce = %mint.nonce,
            chain_id = chain.chain_id,
            "Submitted CCTP mint"
        );

        // The nonce lookup covers a retry that lost this hash.
        let resumed = ExecuteMint {
            mint_tx: Some(mint_tx),
            ..mint.clone()
        };
        if let Err(error) = queue.update_payload(job.id, &resumed.into()).await {
            warn!(correlation_id = %mint.correlation_id, %mint_tx, %error, "Failed to persist mint tx hash");
        }

        Ok(mint_tx)
    }
}

#[async_trait]
impl JobHandler for ExecuteMintHandler {
    fn kind(&self) -> JobKind {
        JobKind::ExecuteMint
    }

    async fn process(&self, job: &Job, queue: &dyn JobQueue) -> Result<JobOutcome, JobError> {
        let mint = self.data(job)?;
        let chain = self.chain(mint)?;

        let mint_tx = match mint.mint_tx {
            Some(mint_tx) => {
                info!(correlation_id = %mint.correlation_id, %mint_tx, "Resuming submitted mint");
                mint_tx
            }
            None => {
                if self.already_received(chain, mint).await? {
                    info!(
                        correlation_id = %mint.correlation_id,
                        nonce = %mint.nonce,
                        "CCTP message already received, skipping mint"
                    );
                    return Ok(JobOutcome::Minted(None));
                }

                self.send_mint(job, mint, chain, queue).await?
            }
        };

        let receipt = self.wallet.wait_for_receipt(chain.chain_id, mint_tx).await?;

        if !receipt.success {
            if self.already_received(chain, mint).await? {
                warn!(
                    correlation_id = %mint.correlation_id,
                    %mint_tx,
                    nonce = %mint.nonce,
                    "Mint reverted but the message was already received"
                );
                return Ok(JobOutcome::Minted(None));
            }

            return Err(WalletError::Reverted(mint_tx).into());
        }

        Ok(JobOutcome::Minted(Some(mint_tx)))
    }

    async fn on_complete(
        &self,
        job: &Job,
        outcome: JobOutcome,
        queue: &dyn JobQueue,
    ) -> Result<(), JobError> {
        let mint = self.data(job)?;

        let JobOutcome::Minted(mint_tx) = outcome else {
            return Err(JobError::unexpected_outcome(self.kind(), &outcome));
        };

        let Some(swap) = mint.context.destination_swap() else {
            self.ledger.mark_completed(mint.correlation_id).await?;
            info!(
                correlation_id = %mint.correlation_id,
                mint_tx = ?mint_tx,
                "CCTP transfer completed"
            );
            return Ok(());
        };

        let swap = DestinationSwap {
            correlation_id: mint.correlation_id,
            wallet: mint.wallet,
            chain_id: mint.destination_chain_id,
            swap: swap.clone(),
            mint_tx,
            swap_tx: None,
        };
        queue.start(swap.into(), Duration::ZERO).await?;

        Ok(())
    }

    async fn on_failed(&self, job: &Job, failure: &JobError) {
        let Ok(mint) = self.data(job) else {
            return;
        };

        error!(
            correlation_id = %mint.correlation_id,
            burn_tx = %mint.burn_tx,
            nonce = %mint.nonce,
            mint_tx = ?mint.mint_tx,
            error = %failure,
            "CCTP mint failed, attested message must be relayed manually"
        );

        if let Err(ledger_error) = self
            .ledger
            .mark_failed(mint.correlation_id, &failure.to_string())
            .await
        {
            warn!(correlation_id = %mint.correlation_id, %ledger_error, "Failed to record mint failure");
        }
    }
}
