//! Strategy lookup and best-quote selection across providers.

use std::sync::Arc;

use futures::future::join_all;
use tracing::debug;

use super::{QuoteError, QuoteRequest, RebalanceQuote, RebalanceStrategy, StrategyName};

pub(crate) struct StrategyRegistry {
    strategies: Vec<Arc<dyn RebalanceStrategy>>,
    max_quote_slippage_bps: u64,
}

impl StrategyRegistry {
    pub(crate) fn new(
        strategies: Vec<Arc<dyn RebalanceStrategy>>,
        max_quote_slippage_bps: u64,
    ) -> Self {
        Self {
            strategies,
            max_quote_slippage_bps,
        }
    }

    pub(crate) fn get(&self, name: StrategyName) -> Option<&Arc<dyn RebalanceStrategy>> {
        self.strategies
            .iter()
            .find(|strategy| strategy.name() == name)
    }

    pub(crate) fn names(&self) -> Vec<StrategyName> {
        self.strategies.iter().map(|strategy| strategy.name()).collect()
    }

    /// Quotes every strategy concurrently and keeps the batch whose final
    /// leg delivers the most `token_out`.
    ///
    /// Failing strategies, empty batches and batches whose summed slippage
    /// exceeds the configured ceiling are dropped. Ties keep registration
    /// order.
    #[tracing::instrument(
        skip_all,
        fields(
            token_in = %request.token_in,
            token_out = %request.token_out,
            amount_in = %request.amount_in,
            correlation_id = %request.correlation_id,
        ),
        level = tracing::Level::DEBUG
    )]
    pub(crate) async fn best_quote(
        &self,
        request: &QuoteRequest,
    ) -> Result<Vec<RebalanceQuote>, QuoteError> {
        let results = join_all(
            self.strategies
                .iter()
                .map(|strategy| async move { (strategy.name(), strategy.quote(request).await) }),
        )
        .await;

        let mut best: Option<Vec<RebalanceQuote>> = None;

        for (strategy, result) in results {
            let batch = match result {
                Ok(batch) => batch,
                Err(error) => {
                    debug!(%strategy, %error, "Strategy could not quote");
                    continue;
                }
            };

            let Some(last) = batch.last() else {
                debug!(%strategy, "Strategy returned no quotes");
                continue;
            };

            let total_slippage: u64 = batch.iter().map(|quote| quote.slippage_bps).sum();
            if total_slippage > self.max_quote_slippage_bps {
                debug!(
                    %strategy,
                    total_slippage,
                    max = self.max_quote_slippage_bps,
                    "Quote exceeds slippage ceiling"
                );
                continue;
            }

            let improves = best
                .as_ref()
                .and_then(|current| current.last())
                .is_none_or(|current| last.amount_out > current.amount_out);

            if improves {
                best = Some(batch);
            }
        }

        best.ok_or(QuoteError::NoQuotes)
    }
}
