//! Wallet boundary: submitting call batches and reading receipts.
//!
//! Key management and signing live behind [`Wallet`]. The orchestrator only
//! hands over `{to, data, value}` batches and later asks whether the
//! resulting transaction landed.

pub(crate) mod rpc;

#[cfg(test)]
pub(crate) mod mock;

use alloy::primitives::{Address, Bytes, TxHash, U256};
use alloy::transports::{RpcError, TransportErrorKind};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::token::ChainId;

/// One contract call in a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Call {
    pub(crate) to: Address,
    pub(crate) data: Bytes,
    #[serde(with = "crate::wire::big_int")]
    pub(crate) value: U256,
}

impl Call {
    pub(crate) fn new(to: Address, data: Bytes) -> Self {
        Self {
            to,
            data,
            value: U256::ZERO,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TxReceipt {
    pub(crate) tx_hash: TxHash,
    pub(crate) success: bool,
    pub(crate) block_number: Option<u64>,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum WalletError {
    #[error("no RPC endpoint configured for chain {0}")]
    UnknownChain(ChainId),
    #[error("wallet {requested} is not managed by this signer ({managed})")]
    UnknownWallet { requested: Address, managed: Address },
    #[error("call batch is empty")]
    EmptyBatch,
    #[error("transaction {0} reverted")]
    Reverted(TxHash),
    #[error("wallet {0} has no signing key configured")]
    ReadOnly(Address),
    #[error("receipt for {0} not available yet")]
    ReceiptUnavailable(TxHash),
    #[error("transport error: {0}")]
    Transport(#[from] RpcError<TransportErrorKind>),
    #[error("pending transaction error: {0}")]
    PendingTransaction(#[from] alloy::providers::PendingTransactionError),
    #[cfg(test)]
    #[error("scripted wallet failure")]
    Scripted,
}

impl WalletError {
    /// Whether retrying the same operation later could succeed.
    pub(crate) const fn is_transient(&self) -> bool {
        match self {
            Self::ReceiptUnavailable(_) | Self::Transport(_) | Self::PendingTransaction(_) => true,
            #[cfg(test)]
            Self::Scripted => true,
            Self::UnknownChain(_)
            | Self::UnknownWallet { .. }
            | Self::EmptyBatch
            | Self::ReadOnly(_)
            | Self::Reverted(_) => false,
        }
    }
}

#[async_trait]
pub(crate) trait Wallet: Send + Sync + 'static {
    /// Submits `calls` in order from `wallet` on `chain_id`.
    ///
    /// Every call but the last is awaited to inclusion so later calls can
    /// depend on earlier ones (approve then spend). Returns the hash of the
    /// last call without waiting for it.
    async fn execute(
        &self,
        wallet: Address,
        chain_id: ChainId,
        calls: &[Call],
    ) -> Result<TxHash, WalletError>;

    async fn wait_for_receipt(
        &self,
        chain_id: ChainId,
        tx_hash: TxHash,
    ) -> Result<TxReceipt, WalletError>;

    /// Runs `call` as an `eth_call` against the latest block.
    async fn read(&self, chain_id: ChainId, call: &Call) -> Result<Bytes, WalletError>;
}

/// Stands in for a signer in quote-only mode. Every submission is refused.
pub(crate) struct ReadOnlyWallet {
    address: Address,
}

impl ReadOnlyWallet {
    pub(crate) const fn new(address: Address) -> Self {
        Self { address }
    }
}

#[async_trait]
impl Wallet for ReadOnlyWallet {
    async fn execute(
        &self,
        _wallet: Address,
        _chain_id: ChainId,
        _calls: &[Call],
    ) -> Result<TxHash, WalletError> {
        Err(WalletError::ReadOnly(self.address))
    }

    async fn wait_for_receipt(
        &self,
        _chain_id: ChainId,
        tx_hash: TxHash,
    ) -> Result<TxReceipt, WalletError> {
        Err(WalletError::ReceiptUnavailable(tx_hash))
    }

    async fn read(&self, _chain_id: ChainId, _call: &Call) -> Result<Bytes, WalletError> {
        Err(WalletError::ReadOnly(self.address))
    }
}
