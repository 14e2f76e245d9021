//! Mock implementation of the RebalanceStrategy trait for testing.

use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use alloy::primitives::{Address, B256, TxHash, U256};
use async_trait::async_trait;
use uuid::Uuid;

use st0x_fixed_point::rescale;

use super::{
    ExecutionError, QuoteError, QuoteRequest, RebalanceQuote, RebalanceStrategy, Settlement,
    StrategyContext, StrategyName,
};
use crate::token::{Token, TokenId};
use crate::wallet::WalletError;

pub(crate) fn quote_for(
    token_in: Token,
    token_out: Token,
    amount_in: U256,
    amount_out: U256,
) -> RebalanceQuote {
    RebalanceQuote {
        strategy: StrategyName::Mock,
        token_in,
        token_out,
        amount_in,
        amount_out,
        slippage_bps: 0,
        context: StrategyContext::Mock,
        correlation_id: Uuid::new_v4(),
    }
}

/// Quotes one-to-one (after decimal rescaling) minus a fixed fee in basis
/// points, except for source tokens scripted to fail.
pub(crate) struct MockStrategy {
    name: StrategyName,
    fee_bps: u64,
    slippage_bps: u64,
    failing_sources: Mutex<HashSet<TokenId>>,
    quote_count: AtomicUsize,
    submit_count: AtomicUsize,
    failing_submissions: AtomicUsize,
    requests: Mutex<Vec<QuoteRequest>>,
    settlement: Settlement,
}

impl MockStrategy {
    pub(crate) fn new(name: StrategyName) -> Self {
        Self {
            name,
            fee_bps: 0,
            slippage_bps: 0,
            failing_sources: Mutex::new(HashSet::new()),
            quote_count: AtomicUsize::new(0),
            submit_count: AtomicUsize::new(0),
            failing_submissions: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
            settlement: Settlement::Complete,
        }
    }

    #[must_use]
    pub(crate) const fn with_fee_bps(mut self, fee_bps: u64) -> Self {
        self.fee_bps = fee_bps;
        self
    }

    #[must_use]
    pub(crate) const fn with_slippage_bps(mut self, slippage_bps: u64) -> Self {
        self.slippage_bps = slippage_bps;
        self
    }

    #[must_use]
    pub(crate) const fn settling_later(mut self) -> Self {
        self.settlement = Settlement::Pending;
        self
    }

    /// Quotes sourced from `token` return `QuoteError::Scripted`.
    #[must_use]
    pub(crate) fn failing_for(self, token: Token) -> Self {
        self.failing_sources.lock().unwrap().insert(token.id());
        self
    }

    /// The next `count` submissions fail with a transient wallet error
    /// before anything is sent.
    #[must_use]
    pub(crate) fn failing_submissions(self, count: usize) -> Self {
        self.failing_submissions.store(count, Ordering::SeqCst);
        self
    }

    pub(crate) fn quotes(&self) -> usize {
        self.quote_count.load(Ordering::SeqCst)
    }

    pub(crate) fn submissions(&self) -> usize {
        self.submit_count.load(Ordering::SeqCst)
    }

    pub(crate) fn requests(&self) -> Vec<QuoteRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl RebalanceStrategy for MockStrategy {
    fn name(&self) -> StrategyName {
        self.name
    }

    async fn quote(&self, request: &QuoteRequest) -> Result<Vec<RebalanceQuote>, QuoteError> {
        self.quote_count.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());

        if self
            .failing_sources
            .lock()
            .unwrap()
            .contains(&request.token_in.id())
        {
            return Err(QuoteError::Scripted);
        }

        let gross = rescale(
            request.amount_in,
            request.token_in.decimals,
            request.token_out.decimals,
        );
        let fee = gross * U256::from(self.fee_bps) / U256::from(10_000u64);

        let mut quote = quote_for(request.token_in, request.token_out, request.amount_in, gross - fee);
        quote.strategy = self.name;
        quote.slippage_bps = self.slippage_bps;
        quote.correlation_id = request.correlation_id;

        Ok(vec![quote])
    }

    async fn submit(
        &self,
        _wallet: Address,
        _quote: &RebalanceQuote,
    ) -> Result<TxHash, ExecutionError> {
        let failing = self
            .failing_submissions
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(WalletError::Scripted.into());
        }

        let n = self.submit_count.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(B256::left_padding_from(&(n as u64).to_be_bytes()))
    }

    async fn settle(
        &self,
        _wallet: Address,
        _quote: &RebalanceQuote,
        _tx_hash: TxHash,
    ) -> Result<Settlement, ExecutionError> {
        Ok(self.settlement)
    }
}
