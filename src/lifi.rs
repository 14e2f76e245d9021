//! LiFi aggregator strategy for same-chain swaps.
//!
//! The policy on API failure is strict: quoting errors surface as
//! [`LiFiError`] and the registry moves on to other providers. Routes are
//! screened against the LiFi asset cache first, so unsupported chains and
//! tokens never reach the network.
//!
//! Cross-chain LiFi routes are not quoted here. They settle through LiFi's
//! own bridges with no attestation this service can observe; cross-chain
//! moves go through [`crate::cctp`] or [`crate::cctp_lifi`] instead.

pub(crate) mod client;

use std::sync::Arc;

use alloy::primitives::{Address, TxHash, U256};
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use st0x_bridge::cctp::approve_calldata;

use crate::asset_cache::{AssetCacheConfig, AssetSupportCache};
use crate::strategy::{
    ExecutionError, QuoteError, QuoteRequest, RebalanceQuote, RebalanceStrategy, StrategyContext,
    StrategyName, slippage_bps,
};
use crate::token::Token;
use crate::wallet::{Call, Wallet, WalletError};

pub(crate) use client::{LiFiApi, LiFiClient, LiFiError};

pub(crate) const LIFI_API_BASE: &str = "https://li.quest";

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LiFiConfig {
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default = "default_integrator")]
    pub integrator: String,
    /// Fraction, e.g. `0.005` for 0.5%.
    #[serde(default = "default_max_slippage")]
    pub max_slippage: Decimal,
    #[serde(default)]
    pub cache: AssetCacheConfig,
}

fn default_api_url() -> String {
    LIFI_API_BASE.to_string()
}

fn default_integrator() -> String {
    "st0x".to_string()
}

fn default_max_slippage() -> Decimal {
    Decimal::new(5, 3)
}

/// Executable LiFi route as returned by `/v1/quote`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct LiFiContext {
    pub(crate) tool: String,
    pub(crate) token_in: Token,
    pub(crate) token_out: Token,
    #[serde(with = "crate::wire::big_int")]
    pub(crate) from_amount: U256,
    #[serde(with = "crate::wire::big_int")]
    pub(crate) to_amount: U256,
    #[serde(with = "crate::wire::big_int")]
    pub(crate) to_amount_min: U256,
    pub(crate) approval_address: Address,
    pub(crate) transaction: Call,
}

impl LiFiContext {
    pub(crate) fn slippage_bps(&self) -> u64 {
        slippage_bps(self.to_amount, self.to_amount_min)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct LiFiQuoteRequest {
    pub(crate) token_in: Token,
    pub(crate) token_out: Token,
    pub(crate) from_amount: U256,
    pub(crate) wallet: Address,
    pub(crate) slippage: Decimal,
}

/// Approves the LiFi spender if the route needs one, then sends the route's
/// transaction. Both calls go out on `swap.token_in`'s chain.
pub(crate) async fn execute_swap(
    wallet: &dyn Wallet,
    owner: Address,
    swap: &LiFiContext,
) -> Result<TxHash, WalletError> {
    let mut calls = Vec::with_capacity(2);

    if swap.approval_address != Address::ZERO {
        calls.push(Call::new(
            swap.token_in.address,
            approve_calldata(swap.approval_address, swap.from_amount),
        ));
    }
    calls.push(swap.transaction.clone());

    wallet
        .execute(owner, swap.token_in.chain_id, &calls)
        .await
}

pub(crate) struct LiFiStrategy {
    api: Arc<dyn LiFiApi>,
    cache: Arc<AssetSupportCache>,
    wallet: Arc<dyn Wallet>,
    max_slippage: Decimal,
}

impl LiFiStrategy {
    pub(crate) fn new(
        api: Arc<dyn LiFiApi>,
        cache: Arc<AssetSupportCache>,
        wallet: Arc<dyn Wallet>,
        max_slippage: Decimal,
    ) -> Self {
        Self {
            api,
            cache,
            wallet,
            max_slippage,
        }
    }

    /// Whether the LiFi listing covers both tokens.
    pub(crate) async fn supports(&self, token_in: &Token, token_out: &Token) -> bool {
        supports(&self.cache, token_in, token_out).await
    }
}

pub(crate) async fn supports(cache: &AssetSupportCache, token_in: &Token, token_out: &Token) -> bool {
    for token in [token_in, token_out] {
        if !cache.is_chain_supported(token.chain_id).await {
            debug!(chain_id = token.chain_id, "LiFi: chain not supported");
            return false;
        }

        if !cache.is_token_supported(token.chain_id, token.address).await {
            debug!(%token, "LiFi: token not supported");
            return false;
        }
    }

    true
}

#[async_trait]
impl RebalanceStrategy for LiFiStrategy {
    fn name(&self) -> StrategyName {
        StrategyName::LiFi
    }

    async fn quote(&self, request: &QuoteRequest) -> Result<Vec<RebalanceQuote>, QuoteError> {
        let unsupported = || QuoteError::UnsupportedRoute {
            strategy: StrategyName::LiFi,
            token_in: request.token_in,
            token_out: request.token_out,
        };

        if request.token_in.chain_id != request.token_out.chain_id
            || request.token_in.same_token(&request.token_out)
        {
            return Err(unsupported());
        }

        if !self.supports(&request.token_in, &request.token_out).await {
            return Err(unsupported());
        }

        let route = self
            .api
            .quote(&LiFiQuoteRequest {
                token_in: request.token_in,
                token_out: request.token_out,
                from_amount: request.amount_in,
                wallet: request.wallet,
                slippage: self.max_slippage,
            })
            .await?;

        debug!(
            correlation_id = %request.correlation_id,
            tool = %route.tool,
            to_amount = %route.to_amount,
            to_amount_min = %route.to_amount_min,
            "Quoted LiFi swap"
        );

        Ok(vec![RebalanceQuote {
            strategy: StrategyName::LiFi,
            token_in: request.token_in,
            token_out: request.token_out,
            amount_in: route.from_amount,
            amount_out: route.to_amount,
            slippage_bps: route.slippage_bps(),
            context: StrategyContext::LiFi(route),
            correlation_id: request.correlation_id,
        }])
    }

    async fn submit(
        &self,
        wallet: Address,
        quote: &RebalanceQuote,
    ) -> Result<TxHash, ExecutionError> {
        let StrategyContext::LiFi(route) = &quote.context else {
            return Err(ExecutionError::ContextMismatch {
                strategy: StrategyName::LiFi,
                context: Box::new(quote.context.clone()),
            });
        };

        let tx_hash = execute_swap(self.wallet.as_ref(), wallet, route).await?;

        info!(
            correlation_id = %quote.correlation_id,
            %tx_hash,
            tool = %route.tool,
            "Submitted LiFi swap"
        );

        Ok(tx_hash)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use alloy::primitives::{Bytes, address};
    use uuid::Uuid;

    use super::*;
    use crate::asset_cache::tests::ScriptedListing;
    use crate::asset_cache::{AssetDirectory, ChainInfo, FallbackBehavior};
    use crate::test_utils::{DAI_BASE, USDC_ARBITRUM, USDC_BASE, USDT_ARBITRUM, USDT_BASE, WALLET};
    use crate::wallet::mock::MockWallet;

    pub(crate) const LIFI_DIAMOND: Address = address!("0x1231DEB6f5749EF6cE6943a275A1D3E7486F4EaE");

    /// Returns `from_amount` minus a fixed fee, or a scripted error.
    pub(crate) struct MockLiFi {
        pub(crate) calls: AtomicUsize,
        fee_bps: u64,
        fail: bool,
    }

    impl MockLiFi {
        pub(crate) fn new(fee_bps: u64) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fee_bps,
                fail: false,
            }
        }

        pub(crate) fn failing() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fee_bps: 0,
                fail: true,
            }
        }
    }

    pub(crate) fn route(request: &LiFiQuoteRequest, to_amount: U256) -> LiFiContext {
        LiFiContext {
            tool: "mock-dex".to_string(),
            token_in: request.token_in,
            token_out: request.token_out,
            from_amount: request.from_amount,
            to_amount,
            to_amount_min: to_amount * U256::from(995u64) / U256::from(1000u64),
            approval_address: LIFI_DIAMOND,
            transaction: Call::new(LIFI_DIAMOND, Bytes::from(vec![0xab, 0xcd])),
        }
    }

    #[async_trait]
    impl LiFiApi for MockLiFi {
        async fn quote(&self, request: &LiFiQuoteRequest) -> Result<LiFiContext, LiFiError> {
            self.calls.fetch_add(1, Ordering::SeqCst);

            if self.fail {
                return Err(LiFiError::Status {
                    status: 500,
                    body: "internal error".to_string(),
                });
            }

            let gross = st0x_fixed_point::rescale(
                request.from_amount,
                request.token_in.decimals,
                request.token_out.decimals,
            );
            let fee = gross * U256::from(self.fee_bps) / U256::from(10_000u64);

            Ok(route(request, gross - fee))
        }
    }

    pub(crate) fn lifi_directory() -> AssetDirectory {
        let mut directory = AssetDirectory::default();

        for (chain_id, name, tokens) in [
            (8453, "Base", vec![USDC_BASE.address, USDT_BASE.address]),
            (
                42161,
                "Arbitrum",
                vec![USDC_ARBITRUM.address, USDT_ARBITRUM.address],
            ),
        ] {
            directory.chains.insert(
                chain_id,
                ChainInfo {
                    chain_id,
                    name: name.to_string(),
                },
            );
            directory
                .tokens_by_chain
                .insert(chain_id, tokens.into_iter().collect());
        }

        directory
    }

    pub(crate) async fn lifi_cache() -> Arc<AssetSupportCache> {
        let cache = Arc::new(AssetSupportCache::new(
            Arc::new(ScriptedListing::new(lifi_directory())),
            AssetCacheConfig {
                fallback: FallbackBehavior::DenyUnknown,
                ..AssetCacheConfig::default()
            },
        ));
        cache.initialize().await;
        cache
    }

    fn request(token_in: Token, token_out: Token) -> QuoteRequest {
        QuoteRequest {
            token_in,
            token_out,
            amount_in: U256::from(1_000_000u64),
            correlation_id: Uuid::new_v4(),
            wallet: WALLET,
        }
    }

    async fn strategy(api: Arc<MockLiFi>, wallet: Arc<MockWallet>) -> LiFiStrategy {
        LiFiStrategy::new(api, lifi_cache().await, wallet, Decimal::new(5, 3))
    }

    #[tokio::test]
    async fn quotes_supported_same_chain_swaps() {
        let api = Arc::new(MockLiFi::new(10));
        let strategy = strategy(api.clone(), Arc::new(MockWallet::new())).await;

        let quotes = strategy.quote(&request(USDC_BASE, USDT_BASE)).await.unwrap();

        assert_eq!(quotes.len(), 1);
        assert_eq!(quotes[0].strategy, StrategyName::LiFi);
        assert_eq!(quotes[0].amount_out, U256::from(999_000u64));
        assert_eq!(quotes[0].slippage_bps, 50);
        assert_eq!(api.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unlisted_tokens_and_cross_chain_routes_never_reach_the_api() {
        let api = Arc::new(MockLiFi::new(0));
        let strategy = strategy(api.clone(), Arc::new(MockWallet::new())).await;

        for request in [
            request(USDC_BASE, DAI_BASE),
            request(USDC_BASE, USDC_ARBITRUM),
            request(USDC_BASE, USDC_BASE),
        ] {
            let error = strategy.quote(&request).await.unwrap_err();
            assert!(
                matches!(error, QuoteError::UnsupportedRoute { strategy: StrategyName::LiFi, .. }),
                "{error:?}"
            );
        }

        assert_eq!(api.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn api_failure_is_a_typed_error() {
        let api = Arc::new(MockLiFi::failing());
        let strategy = strategy(api, Arc::new(MockWallet::new())).await;

        let error = strategy
            .quote(&request(USDC_BASE, USDT_BASE))
            .await
            .unwrap_err();

        assert!(
            matches!(error, QuoteError::LiFi(LiFiError::Status { status: 500, .. })),
            "{error:?}"
        );
    }

    #[tokio::test]
    async fn submit_approves_the_spender_then_sends_the_route() {
        let wallet = Arc::new(MockWallet::new());
        let strategy = strategy(Arc::new(MockLiFi::new(0)), wallet.clone()).await;
        let quote = strategy
            .quote(&request(USDC_BASE, USDT_BASE))
            .await
            .unwrap()
            .remove(0);

        strategy.submit(WALLET, &quote).await.unwrap();

        let execution = wallet.last_execution().unwrap();
        assert_eq!(execution.chain_id, 8453);
        assert_eq!(execution.calls.len(), 2);
        assert_eq!(execution.calls[0].to, USDC_BASE.address);
        assert_eq!(execution.calls[1].to, LIFI_DIAMOND);
        assert_eq!(execution.calls[1].data, Bytes::from(vec![0xab, 0xcd]));
    }

    #[tokio::test]
    async fn native_routes_skip_the_approval() {
        let wallet = MockWallet::new();
        let mut swap = route(
            &LiFiQuoteRequest {
                token_in: USDC_BASE,
                token_out: USDT_BASE,
                from_amount: U256::from(5u64),
                wallet: WALLET,
                slippage: Decimal::ZERO,
            },
            U256::from(5u64),
        );
        swap.approval_address = Address::ZERO;

        execute_swap(&wallet, WALLET, &swap).await.unwrap();

        assert_eq!(wallet.last_execution().unwrap().calls.len(), 1);
    }
}
