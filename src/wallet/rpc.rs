//! Local-signer [`Wallet`] over JSON-RPC.
//!
//! Each configured chain gets its own provider with an embedded
//! `EthereumWallet` filler. This is the simplest production signer: anything
//! more involved (MPC, HSM) implements [`Wallet`] elsewhere.

use std::collections::HashMap;
use std::time::Duration;

use alloy::network::{EthereumWallet, ReceiptResponse};
use alloy::primitives::{Address, Bytes, TxHash};
use alloy::providers::{DynProvider, Provider, ProviderBuilder};
use alloy::rpc::types::TransactionRequest;
use alloy::signers::local::PrivateKeySigner;
use async_trait::async_trait;
use backon::{ConstantBuilder, Retryable};
use tracing::{debug, info};
use url::Url;

use super::{Call, TxReceipt, Wallet, WalletError};
use crate::token::ChainId;

const RECEIPT_POLL_INTERVAL: Duration = Duration::from_secs(2);
const RECEIPT_POLL_ATTEMPTS: usize = 90;

pub(crate) struct RpcWallet {
    address: Address,
    providers: HashMap<ChainId, DynProvider>,
}

impl RpcWallet {
    pub(crate) fn new<'a>(
        signer: PrivateKeySigner,
        chains: impl IntoIterator<Item = (ChainId, &'a Url)>,
    ) -> Self {
        let address = signer.address();
        let wallet = EthereumWallet::from(signer);

        let providers = chains
            .into_iter()
            .map(|(chain_id, rpc_url)| {
                let provider = ProviderBuilder::new()
                    .wallet(wallet.clone())
                    .connect_http(rpc_url.clone())
                    .erased();
                (chain_id, provider)
            })
            .collect();

        Self { address, providers }
    }

    pub(crate) const fn address(&self) -> Address {
        self.address
    }

    fn provider(&self, chain_id: ChainId) -> Result<&DynProvider, WalletError> {
        self.providers
            .get(&chain_id)
            .ok_or(WalletError::UnknownChain(chain_id))
    }
}

#[async_trait]
impl Wallet for RpcWallet {
    async fn execute(
        &self,
        wallet: Address,
        chain_id: ChainId,
        calls: &[Call],
    ) -> Result<TxHash, WalletError> {
        if wallet != self.address {
            return Err(WalletError::UnknownWallet {
                requested: wallet,
                managed: self.address,
            });
        }

        let provider = self.provider(chain_id)?;
        let Some((last, leading)) = calls.split_last() else {
            return Err(WalletError::EmptyBatch);
        };

        for call in leading {
            let pending = provider.send_transaction(transaction(call)).await?;
            let receipt = pending.get_receipt().await?;

            if !receipt.status() {
                return Err(WalletError::Reverted(receipt.transaction_hash));
            }

            debug!(chain_id, tx_hash = %receipt.transaction_hash, to = %call.to, "Leading call confirmed");
        }

        let pending = provider.send_transaction(transaction(last)).await?;
        let tx_hash = *pending.tx_hash();

        info!(chain_id, %tx_hash, to = %last.to, "Transaction submitted");

        Ok(tx_hash)
    }

    async fn wait_for_receipt(
        &self,
        chain_id: ChainId,
        tx_hash: TxHash,
    ) -> Result<TxReceipt, WalletError> {
        let provider = self.provider(chain_id)?;

        let fetch = || async {
            provider
                .get_transaction_receipt(tx_hash)
                .await?
                .ok_or(WalletError::ReceiptUnavailable(tx_hash))
        };

        let receipt = fetch
            .retry(
                ConstantBuilder::default()
                    .with_delay(RECEIPT_POLL_INTERVAL)
                    .with_max_times(RECEIPT_POLL_ATTEMPTS),
            )
            .when(WalletError::is_transient)
            .await?;

        Ok(TxReceipt {
            tx_hash,
            success: receipt.status(),
            block_number: receipt.block_number,
        })
    }

    async fn read(&self, chain_id: ChainId, call: &Call) -> Result<Bytes, WalletError> {
        let provider = self.provider(chain_id)?;
        Ok(provider.call(transaction(call)).await?)
    }
}

fn transaction(call: &Call) -> TransactionRequest {
    TransactionRequest::default()
        .to(call.to)
        .input(call.data.clone().into())
        .value(call.value)
}
