//! Mock implementation of the Wallet trait for testing.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use alloy::primitives::{Address, B256, Bytes, TxHash, U256};
use async_trait::async_trait;

use super::{Call, TxReceipt, Wallet, WalletError};
use crate::token::ChainId;

/// Parameters captured from one `execute` call.
#[derive(Debug, Clone)]
pub(crate) struct ExecuteCall {
    pub(crate) wallet: Address,
    pub(crate) chain_id: ChainId,
    pub(crate) calls: Vec<Call>,
    pub(crate) tx_hash: TxHash,
}

/// Hands out deterministic transaction hashes and records every batch.
pub(crate) struct MockWallet {
    execute_count: AtomicUsize,
    receipt_count: AtomicUsize,
    should_fail: AtomicBool,
    should_revert: AtomicBool,
    revert_first: AtomicUsize,
    executed: Mutex<Vec<ExecuteCall>>,
    read_count: AtomicUsize,
    read_output: Mutex<U256>,
}

impl MockWallet {
    pub(crate) fn new() -> Self {
        Self {
            execute_count: AtomicUsize::new(0),
            receipt_count: AtomicUsize::new(0),
            should_fail: AtomicBool::new(false),
            should_revert: AtomicBool::new(false),
            revert_first: AtomicUsize::new(0),
            executed: Mutex::new(Vec::new()),
            read_count: AtomicUsize::new(0),
            read_output: Mutex::new(U256::ZERO),
        }
    }

    /// Every later `read` returns `output` as a single ABI word.
    pub(crate) fn set_read_output(&self, output: U256) {
        *self.read_output.lock().unwrap() = output;
    }

    pub(crate) fn reads(&self) -> usize {
        self.read_count.load(Ordering::SeqCst)
    }

    /// Every `execute` returns `WalletError::Scripted`.
    pub(crate) fn failing() -> Self {
        let wallet = Self::new();
        wallet.should_fail.store(true, Ordering::SeqCst);
        wallet
    }

    /// Submissions succeed but every receipt reports a revert.
    pub(crate) fn reverting() -> Self {
        let wallet = Self::new();
        wallet.should_revert.store(true, Ordering::SeqCst);
        wallet
    }

    /// The first `count` submitted transactions revert, later ones land.
    pub(crate) fn reverting_first(count: usize) -> Self {
        let wallet = Self::new();
        wallet.revert_first.store(count, Ordering::SeqCst);
        wallet
    }

    pub(crate) fn executions(&self) -> usize {
        self.execute_count.load(Ordering::SeqCst)
    }

    pub(crate) fn receipt_lookups(&self) -> usize {
        self.receipt_count.load(Ordering::SeqCst)
    }

    pub(crate) fn executed(&self) -> Vec<ExecuteCall> {
        self.executed.lock().unwrap().clone()
    }

    pub(crate) fn last_execution(&self) -> Option<ExecuteCall> {
        self.executed.lock().unwrap().last().cloned()
    }

    /// The hash the n-th (1-based) successful `execute` returns.
    pub(crate) fn tx_hash(n: usize) -> TxHash {
        B256::left_padding_from(&(n as u64).to_be_bytes())
    }
}

#[async_trait]
impl Wallet for MockWallet {
    async fn execute(
        &self,
        wallet: Address,
        chain_id: ChainId,
        calls: &[Call],
    ) -> Result<TxHash, WalletError> {
        if self.should_fail.load(Ordering::SeqCst) {
            self.execute_count.fetch_add(1, Ordering::SeqCst);
            return Err(WalletError::Scripted);
        }

        if calls.is_empty() {
            return Err(WalletError::EmptyBatch);
        }

        let n = self.execute_count.fetch_add(1, Ordering::SeqCst) + 1;
        let tx_hash = Self::tx_hash(n);

        self.executed.lock().unwrap().push(ExecuteCall {
            wallet,
            chain_id,
            calls: calls.to_vec(),
            tx_hash,
        });

        Ok(tx_hash)
    }

    async fn wait_for_receipt(
        &self,
        _chain_id: ChainId,
        tx_hash: TxHash,
    ) -> Result<TxReceipt, WalletError> {
        self.receipt_count.fetch_add(1, Ordering::SeqCst);

        let revert_first = self.revert_first.load(Ordering::SeqCst);
        let early = self
            .executed
            .lock()
            .unwrap()
            .iter()
            .position(|execution| execution.tx_hash == tx_hash)
            .is_some_and(|index| index < revert_first);

        Ok(TxReceipt {
            tx_hash,
            success: !self.should_revert.load(Ordering::SeqCst) && !early,
            block_number: Some(1),
        })
    }

    async fn read(&self, _chain_id: ChainId, _call: &Call) -> Result<Bytes, WalletError> {
        self.read_count.fetch_add(1, Ordering::SeqCst);
        let output = *self.read_output.lock().unwrap();
        Ok(Bytes::from(output.to_be_bytes::<32>()))
    }
}
