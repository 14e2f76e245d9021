//! Provider strategies: quoting a token move and executing the chosen quote.
//!
//! Each provider has its own policy for total API failure. See the strategy
//! modules for which one applies:
//!
//! | Strategy | On provider API failure |
//! |---|---|
//! | [`crate::cctp::CctpStrategy`] | zero-fee standard default quote |
//! | [`crate::lifi::LiFiStrategy`] | typed [`LiFiError`] |
//! | [`crate::cctp_lifi::CctpLiFiStrategy`] | typed [`LiFiError`] from the swap leg |

pub(crate) mod registry;

#[cfg(test)]
pub(crate) mod mock;

use std::fmt;

use alloy::primitives::{Address, TxHash, U256};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use st0x_bridge::TransferSpeed;
use st0x_fixed_point::FixedPointError;

use crate::cctp::CctpContext;
use crate::cctp_lifi::CctpLiFiContext;
use crate::conductor::QueueError;
use crate::lifi::{LiFiContext, LiFiError};
use crate::token::{ChainId, Token};
use crate::wallet::WalletError;

pub(crate) use registry::StrategyRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StrategyName {
    #[serde(rename = "CCTP")]
    Cctp,
    #[serde(rename = "LiFi")]
    LiFi,
    #[serde(rename = "CCTPLiFi")]
    CctpLiFi,
    #[cfg(test)]
    Mock,
}

impl StrategyName {
    pub(crate) const fn as_str(self) -> &'static str {
        match self {
            Self::Cctp => "CCTP",
            Self::LiFi => "LiFi",
            Self::CctpLiFi => "CCTPLiFi",
            #[cfg(test)]
            Self::Mock => "Mock",
        }
    }
}

impl fmt::Display for StrategyName {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Provider-specific data a quote carries into execution and the job chain
/// behind it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", content = "context")]
pub(crate) enum StrategyContext {
    #[serde(rename = "CCTP")]
    Cctp(CctpContext),
    #[serde(rename = "LiFi")]
    LiFi(LiFiContext),
    #[serde(rename = "CCTPLiFi")]
    CctpLiFi(CctpLiFiContext),
    #[cfg(test)]
    Mock,
}

impl StrategyContext {
    /// Route class of the bridge leg, if there is one.
    pub(crate) const fn transfer_speed(&self) -> Option<TransferSpeed> {
        match self {
            Self::Cctp(cctp) => Some(cctp.speed),
            Self::CctpLiFi(composite) => Some(composite.cctp.speed),
            Self::LiFi(_) => None,
            #[cfg(test)]
            Self::Mock => None,
        }
    }

    /// Swap to run on the destination chain once the bridge has minted.
    pub(crate) const fn destination_swap(&self) -> Option<&LiFiContext> {
        match self {
            Self::CctpLiFi(composite) => Some(&composite.destination_swap),
            Self::Cctp(_) | Self::LiFi(_) => None,
            #[cfg(test)]
            Self::Mock => None,
        }
    }
}

/// One executable leg. `amount_out` is in `token_out` raw units so quotes
/// from different providers compare directly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RebalanceQuote {
    pub(crate) strategy: StrategyName,
    pub(crate) token_in: Token,
    pub(crate) token_out: Token,
    #[serde(with = "crate::wire::big_int")]
    pub(crate) amount_in: U256,
    #[serde(with = "crate::wire::big_int")]
    pub(crate) amount_out: U256,
    pub(crate) slippage_bps: u64,
    pub(crate) context: StrategyContext,
    pub(crate) correlation_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct QuoteRequest {
    pub(crate) token_in: Token,
    pub(crate) token_out: Token,
    pub(crate) amount_in: U256,
    pub(crate) correlation_id: Uuid,
    pub(crate) wallet: Address,
}

/// Whether a confirmed submission finished the move or handed it to a job
/// chain that settles it later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Settlement {
    Complete,
    Pending,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum QuoteError {
    #[error("{strategy} does not support {token_in} -> {token_out}")]
    UnsupportedRoute {
        strategy: StrategyName,
        token_in: Token,
        token_out: Token,
    },
    #[error("no {strategy} configuration for chain {chain_id}")]
    UnknownChain {
        strategy: StrategyName,
        chain_id: ChainId,
    },
    #[error(transparent)]
    LiFi(#[from] LiFiError),
    #[error(transparent)]
    FixedPoint(#[from] FixedPointError),
    #[error("no strategy produced a usable quote")]
    NoQuotes,
    #[cfg(test)]
    #[error("scripted quote failure")]
    Scripted,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum ExecutionError {
    #[error(transparent)]
    Wallet(#[from] WalletError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Quote(#[from] QuoteError),
    #[error("{strategy} cannot execute a quote carrying {context:?}")]
    ContextMismatch {
        strategy: StrategyName,
        context: Box<StrategyContext>,
    },
    #[error("no strategy registered for {0}")]
    UnknownStrategy(StrategyName),
    #[error("no {strategy} configuration for chain {chain_id}")]
    UnknownChain {
        strategy: StrategyName,
        chain_id: ChainId,
    },
}

impl ExecutionError {
    /// Whether the same submission could succeed if tried again.
    pub(crate) const fn is_retryable(&self) -> bool {
        match self {
            Self::Wallet(error) => error.is_transient(),
            Self::Queue(_) => true,
            Self::Quote(QuoteError::LiFi(error)) => error.is_transient(),
            Self::Quote(_)
            | Self::ContextMismatch { .. }
            | Self::UnknownStrategy(_)
            | Self::UnknownChain { .. } => false,
        }
    }
}

#[async_trait]
pub(crate) trait RebalanceStrategy: Send + Sync + 'static {
    fn name(&self) -> StrategyName;

    /// Quotes moving `request.amount_in` of `token_in` into `token_out`.
    ///
    /// Unsupported routes are rejected before any network call. The returned
    /// batch executes in order; its last quote ends in `token_out`.
    async fn quote(&self, request: &QuoteRequest) -> Result<Vec<RebalanceQuote>, QuoteError>;

    /// Sends the on-chain actions for `quote` and returns the hash of the
    /// transaction whose receipt decides the outcome.
    async fn submit(&self, wallet: Address, quote: &RebalanceQuote)
    -> Result<TxHash, ExecutionError>;

    /// Runs after the submitted transaction confirmed. Strategies that
    /// settle asynchronously start their job chain here.
    async fn settle(
        &self,
        _wallet: Address,
        _quote: &RebalanceQuote,
        _tx_hash: TxHash,
    ) -> Result<Settlement, ExecutionError> {
        Ok(Settlement::Complete)
    }

    async fn execute(
        &self,
        wallet: Address,
        quote: &RebalanceQuote,
    ) -> Result<TxHash, ExecutionError> {
        let tx_hash = self.submit(wallet, quote).await?;
        self.settle(wallet, quote, tx_hash).await?;
        Ok(tx_hash)
    }
}

/// Basis points of `amount` lost going from `expected` down to `minimum`.
pub(crate) fn slippage_bps(expected: U256, minimum: U256) -> u64 {
    if expected.is_zero() || minimum >= expected {
        return 0;
    }

    let lost = (expected - minimum) * U256::from(10_000u64) / expected;
    u64::try_from(lost).unwrap_or(u64::MAX)
}
