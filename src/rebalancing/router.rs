//! Greedy route planning from surplus tokens into deficits.
//!
//! For each deficit, surplus tokens on the same chain are tried first, then
//! surplus tokens on other chains starting from the balance the same-chain
//! phase projects. Within a phase, larger surpluses go first. Each deficit is
//! planned independently; once its request is built, the surplus it consumes
//! is deducted from the shared snapshot so later deficits cannot spend it
//! again.

use std::sync::Arc;

use alloy::primitives::{Address, U256};
use rust_decimal::Decimal;
use tracing::{debug, info, warn};
use uuid::Uuid;

use st0x_fixed_point::{parse_units, rescale};

use super::RebalanceRequest;
use super::analyzer::{TokenAnalysis, TokenState};
use crate::strategy::{QuoteRequest, RebalanceQuote, StrategyRegistry};

const COMPARISON_DECIMALS: u8 = 18;

pub(crate) struct Router {
    strategies: Arc<StrategyRegistry>,
    /// Whole-token size below which a candidate swap is not quoted.
    min_trade: Option<Decimal>,
}

impl Router {
    pub(crate) const fn new(strategies: Arc<StrategyRegistry>, min_trade: Option<Decimal>) -> Self {
        Self {
            strategies,
            min_trade,
        }
    }

    /// Builds one request per deficit token that could be funded at all.
    #[tracing::instrument(skip_all, fields(%wallet), level = tracing::Level::DEBUG)]
    pub(crate) async fn plan(
        &self,
        wallet: Address,
        mut snapshot: Vec<TokenAnalysis>,
    ) -> Vec<RebalanceRequest> {
        let deficits: Vec<TokenAnalysis> = snapshot
            .iter()
            .filter(|analysis| analysis.state == TokenState::Deficit)
            .cloned()
            .collect();

        let mut requests = Vec::new();

        for deficit in deficits {
            let quotes = self.fund(wallet, &deficit, &snapshot).await;

            if quotes.is_empty() {
                debug!(token = %deficit.token, "No rebalancing quotes found for deficit");
                continue;
            }

            deduct_spent(&mut snapshot, &quotes);

            info!(
                token = %deficit.token,
                quotes = quotes.len(),
                "Planned rebalance for deficit token"
            );

            requests.push(RebalanceRequest {
                token: deficit.token,
                quotes,
            });
        }

        requests
    }

    async fn fund(
        &self,
        wallet: Address,
        deficit: &TokenAnalysis,
        snapshot: &[TokenAnalysis],
    ) -> Vec<RebalanceQuote> {
        let (same_chain, cross_chain): (Vec<_>, Vec<_>) = snapshot
            .iter()
            .filter(|analysis| analysis.state == TokenState::Surplus)
            .partition(|analysis| analysis.token.chain_id == deficit.token.chain_id);

        let (mut quotes, projected) = self
            .quote_candidates(wallet, deficit, same_chain, deficit.balance)
            .await;

        if projected >= deficit.range.min {
            return quotes;
        }

        let (cross_quotes, _) = self
            .quote_candidates(wallet, deficit, cross_chain, projected)
            .await;
        quotes.extend(cross_quotes);

        quotes
    }

    /// Quotes candidates largest-surplus-first until the deficit's projected
    /// balance reaches its band minimum. Returns the quotes and the final
    /// projection.
    async fn quote_candidates(
        &self,
        wallet: Address,
        deficit: &TokenAnalysis,
        mut candidates: Vec<&TokenAnalysis>,
        starting_balance: U256,
    ) -> (Vec<RebalanceQuote>, U256) {
        // Stable: equal surpluses keep declaration order.
        candidates.sort_by_key(|analysis| std::cmp::Reverse(normalized_diff(analysis)));

        let mut quotes = Vec::new();
        let mut projected = starting_balance;

        for surplus in candidates {
            if projected >= deficit.range.min {
                break;
            }

            let remaining = rescale(
                deficit.range.min - projected,
                deficit.token.decimals,
                surplus.token.decimals,
            );
            let amount_in = surplus.diff.min(remaining);

            if amount_in.is_zero() {
                warn!(
                    surplus = %surplus.token,
                    deficit = %deficit.token,
                    "Skipping quote for zero swap amount"
                );
                continue;
            }

            if self.below_min_trade(surplus, amount_in) {
                debug!(
                    surplus = %surplus.token,
                    deficit = %deficit.token,
                    %amount_in,
                    min_trade = ?self.min_trade,
                    "Skipping quote below minimum trade size"
                );
                continue;
            }

            let request = QuoteRequest {
                token_in: surplus.token,
                token_out: deficit.token,
                amount_in,
                correlation_id: Uuid::new_v4(),
                wallet,
            };

            let batch = match self.strategies.best_quote(&request).await {
                Ok(batch) => batch,
                Err(error) => {
                    debug!(
                        surplus = %surplus.token,
                        deficit = %deficit.token,
                        %error,
                        "Direct route failed, trying next surplus token"
                    );
                    continue;
                }
            };

            for (index, mut quote) in batch.into_iter().enumerate() {
                // Every executed quote is tracked under its own correlation id.
                if index > 0 {
                    quote.correlation_id = Uuid::new_v4();
                }

                if quote.token_out.same_token(&deficit.token) {
                    projected = projected.saturating_add(quote.amount_out);
                }

                quotes.push(quote);
            }
        }

        (quotes, projected)
    }

    fn below_min_trade(&self, surplus: &TokenAnalysis, amount_in: U256) -> bool {
        let Some(min_trade) = self.min_trade else {
            return false;
        };

        match parse_units(min_trade, surplus.token.decimals) {
            Ok(threshold) => amount_in < threshold,
            Err(error) => {
                warn!(%error, %min_trade, "Invalid minimum trade size, not applying it");
                false
            }
        }
    }
}

/// Surplus expressed at a common precision, so tokens with different
/// decimals compare by value.
fn normalized_diff(analysis: &TokenAnalysis) -> U256 {
    rescale(analysis.diff, analysis.token.decimals, COMPARISON_DECIMALS)
}

fn deduct_spent(snapshot: &mut [TokenAnalysis], quotes: &[RebalanceQuote]) {
    for quote in quotes {
        let Some(source) = snapshot
            .iter_mut()
            .find(|analysis| analysis.token.same_token(&quote.token_in))
        else {
            continue;
        };

        let balance = source.balance.saturating_sub(quote.amount_in);
        *source = source.with_balance(balance);
    }
}
