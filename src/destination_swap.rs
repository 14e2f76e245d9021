//! LiFi swap on the destination chain after a CCTP mint.
//!
//! The route was quoted before the burn, so by the time USDC lands it may no
//! longer execute. When the recorded swap transaction reverted, the next
//! attempt quotes a fresh route for the same amount and sends that instead.
//! A swap that never succeeds leaves the bridged USDC on the destination
//! chain for the operator to recover.

use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::{Address, TxHash};
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::conductor::{
    Job, JobData, JobError, JobHandler, JobKind, JobOutcome, JobPayload, JobQueue, RetryPolicy,
};
use crate::ledger::RebalanceLedger;
use crate::lifi::{LiFiApi, LiFiContext, LiFiQuoteRequest, execute_swap};
use crate::token::ChainId;
use crate::wallet::{Wallet, WalletError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct DestinationSwap {
    pub(crate) correlation_id: Uuid,
    pub(crate) wallet: Address,
    pub(crate) chain_id: ChainId,
    pub(crate) swap: LiFiContext,
    /// `None` when the message was relayed by someone else.
    pub(crate) mint_tx: Option<TxHash>,
    pub(crate) swap_tx: Option<TxHash>,
}

impl JobData for DestinationSwap {
    const KIND: JobKind = JobKind::DestinationSwap;

    fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }

    fn step(&self) -> String {
        "swap".to_string()
    }

    fn retry_policy() -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_secs(15),
            ..RetryPolicy::DEFAULT
        }
    }
}

impl From<DestinationSwap> for JobPayload {
    fn from(data: DestinationSwap) -> Self {
        Self::DestinationSwap(data)
    }
}

pub(crate) struct DestinationSwapHandler {
    wallet: Arc<dyn Wallet>,
    lifi: Arc<dyn LiFiApi>,
    ledger: RebalanceLedger,
    max_slippage: Decimal,
}

impl DestinationSwapHandler {
    pub(crate) fn new(
        wallet: Arc<dyn Wallet>,
        lifi: Arc<dyn LiFiApi>,
        ledger: RebalanceLedger,
        max_slippage: Decimal,
    ) -> Self {
        Self {
            wallet,
            lifi,
            ledger,
            max_slippage,
        }
    }

    fn data<'a>(&self, job: &'a Job) -> Result<&'a DestinationSwap, JobError> {
        match &job.payload {
            JobPayload::DestinationSwap(swap) => Ok(swap),
            other => Err(JobError::wrong_payload(self.kind(), other)),
        }
    }

    async fn requote(&self, data: &DestinationSwap) -> Result<LiFiContext, JobError> {
        let request = LiFiQuoteRequest {
            token_in: data.swap.token_in,
            token_out: data.swap.token_out,
            from_amount: data.swap.from_amount,
            wallet: data.wallet,
            slippage: self.max_slippage,
        };

        self.lifi.quote(&request).await.map_err(|error| {
            if error.is_transient() {
                JobError::retryable(error)
            } else {
                JobError::unrecoverable(error)
            }
        })
    }
}

#[async_trait]
impl JobHandler for DestinationSwapHandler {
    fn kind(&self) -> JobKind {
        JobKind::DestinationSwap
    }

    async fn process(&self, job: &Job, queue: &dyn JobQueue) -> Result<JobOutcome, JobError> {
        let mut data = self.data(job)?.clone();

        if let Some(swap_tx) = data.swap_tx {
            let receipt = self.wallet.wait_for_receipt(data.chain_id, swap_tx).await?;
            if receipt.success {
                return Ok(JobOutcome::Confirmed(receipt));
            }

            warn!(
                correlation_id = %data.correlation_id,
                %swap_tx,
                tool = %data.swap.tool,
                "Destination swap reverted, requoting"
            );

            data.swap = self.requote(&data).await?;
            data.swap_tx = None;
            queue.update_payload(job.id, &data.clone().into()).await?;
        }

        let swap_tx = execute_swap(self.wallet.as_ref(), data.wallet, &data.swap).await?;
        data.swap_tx = Some(swap_tx);
        queue.update_payload(job.id, &data.clone().into()).await?;

        info!(
            correlation_id = %data.correlation_id,
            %swap_tx,
            tool = %data.swap.tool,
            from_amount = %data.swap.from_amount,
            to_amount_min = %data.swap.to_amount_min,
            "Submitted destination swap"
        );

        let receipt = self.wallet.wait_for_receipt(data.chain_id, swap_tx).await?;
        if !receipt.success {
            return Err(JobError::retryable(WalletError::Reverted(swap_tx)));
        }

        Ok(JobOutcome::Confirmed(receipt))
    }

    async fn on_complete(
        &self,
        job: &Job,
        outcome: JobOutcome,
        _queue: &dyn JobQueue,
    ) -> Result<(), JobError> {
        let data = self.data(job)?;

        let JobOutcome::Confirmed(receipt) = outcome else {
            return Err(JobError::unexpected_outcome(self.kind(), &outcome));
        };

        self.ledger.mark_completed(data.correlation_id).await?;

        info!(
            correlation_id = %data.correlation_id,
            swap_tx = %receipt.tx_hash,
            "CCTP -> LiFi rebalance completed"
        );

        Ok(())
    }

    async fn on_failed(&self, job: &Job, failure: &JobError) {
        let Ok(data) = self.data(job) else {
            return;
        };

        error!(
            correlation_id = %data.correlation_id,
            chain_id = data.chain_id,
            mint_tx = ?data.mint_tx,
            amount = %data.swap.from_amount,
            token = %data.swap.token_in,
            error = %failure,
            "Destination swap failed, bridged USDC is stranded on the destination chain"
        );

        if let Err(ledger_error) = self
            .ledger
            .mark_failed(data.correlation_id, &failure.to_string())
            .await
        {
            warn!(correlation_id = %data.correlation_id, %ledger_error, "Failed to record swap failure");
        }
    }
}
