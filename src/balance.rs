//! Balance reader boundary feeding the analyzer.

use std::collections::HashMap;

use alloy::primitives::Address;
use alloy::providers::{DynProvider, Provider, ProviderBuilder};
use alloy::transports::{RpcError, TransportErrorKind};
use async_trait::async_trait;
use futures::future::try_join_all;
use tracing::debug;
use url::Url;

use crate::bindings::IERC20;
use crate::token::{ChainId, Token, TokenBalance};

#[derive(Debug, thiserror::Error)]
pub(crate) enum BalanceError {
    #[error("no RPC endpoint configured for chain {0}")]
    UnknownChain(ChainId),
    #[error("balanceOf failed for {token}: {source}")]
    Contract {
        token: Token,
        #[source]
        source: alloy::contract::Error,
    },
    #[error("transport error: {0}")]
    Transport(#[from] RpcError<TransportErrorKind>),
    #[cfg(test)]
    #[error("scripted balance failure")]
    Scripted,
}

#[async_trait]
pub(crate) trait BalanceReader: Send + Sync + 'static {
    /// Current balance of every tracked token held by `wallet`, in
    /// declaration order.
    async fn balances(&self, wallet: Address) -> Result<Vec<TokenBalance>, BalanceError>;
}

/// Reads `balanceOf` for each tracked token over per-chain read-only
/// providers.
pub(crate) struct RpcBalanceReader {
    tokens: Vec<Token>,
    providers: HashMap<ChainId, DynProvider>,
}

impl RpcBalanceReader {
    pub(crate) fn new<'a>(
        tokens: Vec<Token>,
        chains: impl IntoIterator<Item = (ChainId, &'a Url)>,
    ) -> Self {
        let providers = chains
            .into_iter()
            .map(|(chain_id, rpc_url)| {
                let provider = ProviderBuilder::new().connect_http(rpc_url.clone()).erased();
                (chain_id, provider)
            })
            .collect();

        Self { tokens, providers }
    }

    async fn balance_of(&self, token: Token, wallet: Address) -> Result<TokenBalance, BalanceError> {
        let provider = self
            .providers
            .get(&token.chain_id)
            .ok_or(BalanceError::UnknownChain(token.chain_id))?;

        let raw_amount = IERC20::new(token.address, provider)
            .balanceOf(wallet)
            .call()
            .await
            .map_err(|source| BalanceError::Contract { token, source })?;

        debug!(%token, %raw_amount, "Read balance");

        Ok(TokenBalance { token, raw_amount })
    }
}

#[async_trait]
impl BalanceReader for RpcBalanceReader {
    async fn balances(&self, wallet: Address) -> Result<Vec<TokenBalance>, BalanceError> {
        try_join_all(
            self.tokens
                .iter()
                .map(|token| self.balance_of(*token, wallet)),
        )
        .await
    }
}
