//! CCTP bridge followed by a LiFi swap on the destination chain.
//!
//! Moves USDC on one chain into any LiFi-listed token on another: the CCTP
//! leg bridges USDC, and once the mint lands a
//! [`DestinationSwap`](crate::destination_swap::DestinationSwap) job swaps
//! the minted USDC into `token_out`. Quoting follows the strict LiFi policy
//! for the swap leg and the permissive CCTP policy for the bridge leg.

use std::sync::Arc;

use alloy::primitives::{Address, TxHash};
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::asset_cache::AssetSupportCache;
use crate::cctp::{CctpContext, CctpStrategy};
use crate::lifi::{self, LiFiApi, LiFiContext, LiFiQuoteRequest};
use crate::strategy::{
    ExecutionError, QuoteError, QuoteRequest, RebalanceQuote, RebalanceStrategy, Settlement,
    StrategyContext, StrategyName,
};
use crate::token::Token;

const USDC_DECIMALS: u8 = 6;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CctpLiFiContext {
    pub(crate) cctp: CctpContext,
    pub(crate) destination_swap: LiFiContext,
}

pub(crate) struct CctpLiFiStrategy {
    cctp: Arc<CctpStrategy>,
    lifi: Arc<dyn LiFiApi>,
    cache: Arc<AssetSupportCache>,
    max_slippage: Decimal,
}

impl CctpLiFiStrategy {
    pub(crate) fn new(
        cctp: Arc<CctpStrategy>,
        lifi: Arc<dyn LiFiApi>,
        cache: Arc<AssetSupportCache>,
        max_slippage: Decimal,
    ) -> Self {
        Self {
            cctp,
            lifi,
            cache,
            max_slippage,
        }
    }

    /// USDC on `token_out`'s chain, the token the bridge leg delivers.
    fn bridged_usdc(&self, request: &QuoteRequest) -> Result<Token, QuoteError> {
        let unsupported = || QuoteError::UnsupportedRoute {
            strategy: StrategyName::CctpLiFi,
            token_in: request.token_in,
            token_out: request.token_out,
        };

        let config = self.cctp.config();

        if request.token_in.chain_id == request.token_out.chain_id
            || config.usdc_chain(&request.token_in).is_none()
            || config.usdc_chain(&request.token_out).is_some()
        {
            return Err(unsupported());
        }

        let destination = config
            .chain(request.token_out.chain_id)
            .ok_or_else(unsupported)?;

        Ok(Token {
            chain_id: destination.chain_id,
            address: destination.usdc,
            decimals: USDC_DECIMALS,
        })
    }

    fn context<'a>(
        &self,
        quote: &'a RebalanceQuote,
    ) -> Result<&'a CctpLiFiContext, ExecutionError> {
        match &quote.context {
            StrategyContext::CctpLiFi(composite) => Ok(composite),
            other => Err(ExecutionError::ContextMismatch {
                strategy: StrategyName::CctpLiFi,
                context: Box::new(other.clone()),
            }),
        }
    }
}

#[async_trait]
impl RebalanceStrategy for CctpLiFiStrategy {
    fn name(&self) -> StrategyName {
        StrategyName::CctpLiFi
    }

    async fn quote(&self, request: &QuoteRequest) -> Result<Vec<RebalanceQuote>, QuoteError> {
        let bridged = self.bridged_usdc(request)?;

        if !lifi::supports(&self.cache, &bridged, &request.token_out).await {
            return Err(QuoteError::UnsupportedRoute {
                strategy: StrategyName::CctpLiFi,
                token_in: request.token_in,
                token_out: request.token_out,
            });
        }

        let (cctp, bridged_amount) = self
            .cctp
            .quote_transfer(
                request.token_in,
                bridged,
                request.amount_in,
                request.correlation_id,
            )
            .await?;

        let destination_swap = self
            .lifi
            .quote(&LiFiQuoteRequest {
                token_in: bridged,
                token_out: request.token_out,
                from_amount: bridged_amount,
                wallet: request.wallet,
                slippage: self.max_slippage,
            })
            .await?;

        debug!(
            correlation_id = %request.correlation_id,
            %bridged_amount,
            to_amount = %destination_swap.to_amount,
            tool = %destination_swap.tool,
            "Quoted CCTP transfer with destination swap"
        );

        Ok(vec![RebalanceQuote {
            strategy: StrategyName::CctpLiFi,
            token_in: request.token_in,
            token_out: request.token_out,
            amount_in: request.amount_in,
            amount_out: destination_swap.to_amount,
            slippage_bps: destination_swap.slippage_bps(),
            context: StrategyContext::CctpLiFi(CctpLiFiContext {
                cctp,
                destination_swap,
            }),
            correlation_id: request.correlation_id,
        }])
    }

    async fn submit(
        &self,
        wallet: Address,
        quote: &RebalanceQuote,
    ) -> Result<TxHash, ExecutionError> {
        let composite = self.context(quote)?;
        self.cctp.burn(wallet, quote, &composite.cctp).await
    }

    async fn settle(
        &self,
        wallet: Address,
        quote: &RebalanceQuote,
        tx_hash: TxHash,
    ) -> Result<Settlement, ExecutionError> {
        let composite = self.context(quote)?;
        self.cctp
            .start_attestation(wallet, quote, &composite.cctp, tx_hash)
            .await
    }
}
