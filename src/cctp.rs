//! CCTP burn-and-mint strategy for moving USDC between chains.
//!
//! Quoting asks Circle for fee tiers and prefers the fast tier when enabled.
//! The policy on fee API failure is permissive: the strategy falls back to a
//! zero-fee standard quote, since a standard transfer with `maxFee = 0` is
//! always accepted by the token messenger.
//!
//! Execution approves the token messenger, burns, and starts attestation
//! polling. The mint happens in [`crate::attestation::mint`].

use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::{Address, TxHash, U256};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use st0x_bridge::cctp::{
    CIRCLE_API_BASE, CircleApi, DepositForBurn, approve_calldata, deposit_for_burn_calldata,
};
use st0x_bridge::{Domain, FeeOption, TransferSpeed};

use crate::attestation::{CheckAttestation, PollIntervals};
use crate::conductor::{Enqueued, JobStarter};
use crate::strategy::{
    ExecutionError, QuoteError, QuoteRequest, RebalanceQuote, RebalanceStrategy, Settlement,
    StrategyContext, StrategyName,
};
use crate::token::{ChainId, Token};
use crate::wallet::{Call, Wallet};

const BPS_DENOMINATOR: u64 = 10_000;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CctpConfig {
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default = "default_true")]
    pub fast_transfer_enabled: bool,
    #[serde(default = "default_fast_poll_interval_secs")]
    pub fast_poll_interval_secs: u64,
    #[serde(default = "default_standard_poll_interval_secs")]
    pub standard_poll_interval_secs: u64,
    pub chains: Vec<CctpChain>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CctpChain {
    pub chain_id: ChainId,
    pub domain: Domain,
    pub usdc: Address,
    pub token_messenger: Address,
    pub message_transmitter: Address,
}

fn default_api_url() -> String {
    CIRCLE_API_BASE.to_string()
}

const fn default_true() -> bool {
    true
}

const fn default_fast_poll_interval_secs() -> u64 {
    3
}

const fn default_standard_poll_interval_secs() -> u64 {
    30
}

impl CctpConfig {
    pub(crate) fn chain(&self, chain_id: ChainId) -> Option<&CctpChain> {
        self.chains.iter().find(|chain| chain.chain_id == chain_id)
    }

    /// The CCTP chain on which `token` is the native USDC.
    pub(crate) fn usdc_chain(&self, token: &Token) -> Option<&CctpChain> {
        self.chain(token.chain_id)
            .filter(|chain| chain.usdc == token.address)
    }

    pub(crate) const fn poll_intervals(&self) -> PollIntervals {
        PollIntervals {
            fast: Duration::from_secs(self.fast_poll_interval_secs),
            standard: Duration::from_secs(self.standard_poll_interval_secs),
        }
    }
}

/// Fee tier and domains chosen at quote time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CctpContext {
    pub(crate) speed: TransferSpeed,
    pub(crate) fee_bps: u64,
    #[serde(with = "crate::wire::big_int")]
    pub(crate) max_fee: U256,
    pub(crate) source_domain: Domain,
    pub(crate) destination_domain: Domain,
}

impl CctpContext {
    pub(crate) const fn min_finality_threshold(&self) -> u32 {
        self.speed.finality_threshold()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FeeChoice {
    speed: TransferSpeed,
    fee_bps: u64,
    fee: U256,
    amount_out: U256,
}

impl FeeChoice {
    const fn zero_fee_standard(amount: U256) -> Self {
        Self {
            speed: TransferSpeed::Standard,
            fee_bps: 0,
            fee: U256::ZERO,
            amount_out: amount,
        }
    }
}

/// First viable tier in preference order. Tiers whose fee would consume the
/// whole amount are skipped.
fn choose_fee(options: &[FeeOption], amount: U256, fast_enabled: bool) -> Option<FeeChoice> {
    let preference: &[TransferSpeed] = if fast_enabled {
        &[TransferSpeed::Fast, TransferSpeed::Standard]
    } else {
        &[TransferSpeed::Standard]
    };

    preference.iter().find_map(|&speed| {
        let option = options
            .iter()
            .find(|option| TransferSpeed::from_finality_threshold(option.finality_threshold) == Some(speed))?;

        let fee = amount * U256::from(option.fee_bps) / U256::from(BPS_DENOMINATOR);
        let amount_out = amount.checked_sub(fee).filter(|out| !out.is_zero())?;

        Some(FeeChoice {
            speed,
            fee_bps: option.fee_bps,
            fee,
            amount_out,
        })
    })
}

pub(crate) struct CctpStrategy {
    circle: Arc<dyn CircleApi>,
    config: CctpConfig,
    wallet: Arc<dyn Wallet>,
    jobs: Arc<dyn JobStarter>,
}

impl CctpStrategy {
    pub(crate) fn new(
        circle: Arc<dyn CircleApi>,
        config: CctpConfig,
        wallet: Arc<dyn Wallet>,
        jobs: Arc<dyn JobStarter>,
    ) -> Self {
        Self {
            circle,
            config,
            wallet,
            jobs,
        }
    }

    pub(crate) const fn config(&self) -> &CctpConfig {
        &self.config
    }

    fn route(
        &self,
        token_in: &Token,
        token_out: &Token,
    ) -> Result<(&CctpChain, &CctpChain), QuoteError> {
        let unsupported = || QuoteError::UnsupportedRoute {
            strategy: StrategyName::Cctp,
            token_in: *token_in,
            token_out: *token_out,
        };

        if token_in.chain_id == token_out.chain_id {
            return Err(unsupported());
        }

        let source = self.config.usdc_chain(token_in).ok_or_else(unsupported)?;
        let destination = self.config.usdc_chain(token_out).ok_or_else(unsupported)?;

        Ok((source, destination))
    }

    /// Quotes a USDC -> USDC transfer. Shared with the CCTP -> LiFi
    /// composite, which labels and wraps the result itself.
    pub(crate) async fn quote_transfer(
        &self,
        token_in: Token,
        token_out: Token,
        amount_in: U256,
        correlation_id: Uuid,
    ) -> Result<(CctpContext, U256), QuoteError> {
        let (source, destination) = self.route(&token_in, &token_out)?;

        let choice = match self.circle.fee_options(source.domain, destination.domain).await {
            Ok(options) => choose_fee(&options, amount_in, self.config.fast_transfer_enabled)
                .unwrap_or_else(|| {
                    warn!(
                        %correlation_id,
                        source_domain = %source.domain,
                        destination_domain = %destination.domain,
                        ?options,
                        "No viable CCTP fee tier, quoting zero-fee standard transfer"
                    );
                    FeeChoice::zero_fee_standard(amount_in)
                }),
            Err(error) => {
                warn!(
                    %correlation_id,
                    source_domain = %source.domain,
                    destination_domain = %destination.domain,
                    %error,
                    "CCTP fee lookup failed, quoting zero-fee standard transfer"
                );
                FeeChoice::zero_fee_standard(amount_in)
            }
        };

        debug!(
            %correlation_id,
            speed = %choice.speed,
            fee_bps = choice.fee_bps,
            fee = %choice.fee,
            amount_out = %choice.amount_out,
            "Quoted CCTP transfer"
        );

        let context = CctpContext {
            speed: choice.speed,
            fee_bps: choice.fee_bps,
            max_fee: choice.fee,
            source_domain: source.domain,
            destination_domain: destination.domain,
        };

        Ok((context, choice.amount_out))
    }

    /// Approves the token messenger and burns `quote.amount_in` toward
    /// `wallet` on the destination domain.
    pub(crate) async fn burn(
        &self,
        wallet: Address,
        quote: &RebalanceQuote,
        cctp: &CctpContext,
    ) -> Result<TxHash, ExecutionError> {
        let source = self
            .config
            .chain(quote.token_in.chain_id)
            .ok_or(ExecutionError::UnknownChain {
                strategy: StrategyName::Cctp,
                chain_id: quote.token_in.chain_id,
            })?;

        let deposit = DepositForBurn {
            amount: quote.amount_in,
            destination_domain: cctp.destination_domain,
            recipient: wallet,
            burn_token: source.usdc,
            max_fee: cctp.max_fee,
            min_finality_threshold: cctp.min_finality_threshold(),
        };

        let calls = [
            Call::new(
                source.usdc,
                approve_calldata(source.token_messenger, quote.amount_in),
            ),
            Call::new(source.token_messenger, deposit_for_burn_calldata(&deposit)),
        ];

        let tx_hash = self
            .wallet
            .execute(wallet, source.chain_id, &calls)
            .await?;

        info!(
            correlation_id = %quote.correlation_id,
            %tx_hash,
            amount = %quote.amount_in,
            source_domain = %cctp.source_domain,
            destination_domain = %cctp.destination_domain,
            speed = %cctp.speed,
            "Submitted CCTP burn"
        );

        Ok(tx_hash)
    }

    /// Starts attestation polling for a confirmed burn. The first poll runs
    /// right away; later ones wait the speed's interval.
    pub(crate) async fn start_attestation(
        &self,
        wallet: Address,
        quote: &RebalanceQuote,
        cctp: &CctpContext,
        burn_tx: TxHash,
    ) -> Result<Settlement, ExecutionError> {
        let check = CheckAttestation {
            correlation_id: quote.correlation_id,
            wallet,
            burn_tx,
            source_domain: cctp.source_domain,
            destination_chain_id: quote.token_out.chain_id,
            context: quote.context.clone(),
            poll_sequence: 0,
        };

        match self.jobs.start(check.into(), Duration::ZERO).await? {
            Enqueued::Queued(job_id) => {
                debug!(correlation_id = %quote.correlation_id, job_id, "Started attestation polling");
            }
            Enqueued::Duplicate => {
                debug!(correlation_id = %quote.correlation_id, "Attestation polling already started");
            }
        }

        Ok(Settlement::Pending)
    }

    fn context<'a>(&self, quote: &'a RebalanceQuote) -> Result<&'a CctpContext, ExecutionError> {
        match &quote.context {
            StrategyContext::Cctp(cctp) => Ok(cctp),
            other => Err(ExecutionError::ContextMismatch {
                strategy: StrategyName::Cctp,
                context: Box::new(other.clone()),
            }),
        }
    }
}

#[async_trait]
impl RebalanceStrategy for CctpStrategy {
    fn name(&self) -> StrategyName {
        StrategyName::Cctp
    }

    async fn quote(&self, request: &QuoteRequest) -> Result<Vec<RebalanceQuote>, QuoteError> {
        let (context, amount_out) = self
            .quote_transfer(
                request.token_in,
                request.token_out,
                request.amount_in,
                request.correlation_id,
            )
            .await?;

        Ok(vec![RebalanceQuote {
            strategy: StrategyName::Cctp,
            token_in: request.token_in,
            token_out: request.token_out,
            amount_in: request.amount_in,
            amount_out,
            // the bridge fee is the only deviation from 1:1
            slippage_bps: context.fee_bps,
            context: StrategyContext::Cctp(context),
            correlation_id: request.correlation_id,
        }])
    }

    async fn submit(
        &self,
        wallet: Address,
        quote: &RebalanceQuote,
    ) -> Result<TxHash, ExecutionError> {
        let cctp = self.context(quote)?;
        self.burn(wallet, quote, cctp).await
    }

    async fn settle(
        &self,
        wallet: Address,
        quote: &RebalanceQuote,
        tx_hash: TxHash,
    ) -> Result<Settlement, ExecutionError> {
        let cctp = self.context(quote)?;
        self.start_attestation(wallet, quote, cctp, tx_hash).await
    }
}
