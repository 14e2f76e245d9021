//! Surplus / in-range / deficit classification.

use std::collections::HashMap;
use std::fmt;

use alloy::primitives::U256;
use tracing::{debug, warn};

use st0x_fixed_point::{Band, FixedPointError, Range, range_from_percentage};

use crate::token::{Token, TokenBalance, TokenConfig, TokenId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum TokenState {
    Surplus,
    InRange,
    Deficit,
}

impl fmt::Display for TokenState {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Surplus => write!(formatter, "surplus"),
            Self::InRange => write!(formatter, "in-range"),
            Self::Deficit => write!(formatter, "deficit"),
        }
    }
}

/// One token's position relative to its target. All amounts are raw units.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TokenAnalysis {
    pub(crate) token: Token,
    pub(crate) state: TokenState,
    pub(crate) balance: U256,
    pub(crate) target: U256,
    /// `|balance - target|`; `state` carries the sign.
    pub(crate) diff: U256,
    pub(crate) range: Range,
}

impl TokenAnalysis {
    /// Classifies `balance` against `config`. The band is inclusive at both
    /// edges, and `min_balance` raises the lower edge when it is higher.
    pub(crate) fn new(
        config: &TokenConfig,
        balance: U256,
        default_band: Band,
    ) -> Result<Self, FixedPointError> {
        let target = config.target_raw()?;
        let mut range = range_from_percentage(target, config.band.unwrap_or(default_band))?;

        if let Some(floor) = config.min_balance_raw()? {
            range.min = range.min.max(floor);
        }

        Ok(Self::classify(config.token, balance, target, range))
    }

    fn classify(token: Token, balance: U256, target: U256, range: Range) -> Self {
        let state = if balance > range.max {
            TokenState::Surplus
        } else if balance < range.min {
            TokenState::Deficit
        } else {
            TokenState::InRange
        };

        let diff = if balance >= target {
            balance - target
        } else {
            target - balance
        };

        Self {
            token,
            state,
            balance,
            target,
            diff,
            range,
        }
    }

    /// Same target and band, re-classified for a new balance.
    #[must_use]
    pub(crate) fn with_balance(&self, balance: U256) -> Self {
        Self::classify(self.token, balance, self.target, self.range)
    }
}

/// Amounts already committed to unfinished rebalances.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct Reservations {
    /// `amount_in` of rebalances not yet submitted, by source token.
    pub(crate) reserved: HashMap<TokenId, U256>,
    /// `amount_out` of rebalances not yet settled, by destination token.
    pub(crate) incoming: HashMap<TokenId, U256>,
}

impl Reservations {
    pub(crate) fn is_empty(&self) -> bool {
        self.reserved.is_empty() && self.incoming.is_empty()
    }

    /// `balance - reserved + incoming`, floored at zero.
    pub(crate) fn adjust(&self, token: &Token, balance: U256) -> U256 {
        let id = token.id();
        let reserved = self.reserved.get(&id).copied().unwrap_or_default();
        let incoming = self.incoming.get(&id).copied().unwrap_or_default();

        balance.saturating_sub(reserved).saturating_add(incoming)
    }
}

/// Analyzes every configured token, in declaration order.
///
/// Tokens without a balance snapshot, or whose configuration cannot be
/// scaled, are logged and left out rather than failing the whole cycle.
pub(crate) fn analyze_tokens(
    configs: &[TokenConfig],
    balances: &[TokenBalance],
    reservations: &Reservations,
    default_band: Band,
) -> Vec<TokenAnalysis> {
    let by_token: HashMap<TokenId, U256> = balances
        .iter()
        .map(|balance| (balance.token.id(), balance.raw_amount))
        .collect();

    configs
        .iter()
        .filter_map(|config| {
            let Some(&raw) = by_token.get(&config.token.id()) else {
                warn!(token = %config.token, "No balance snapshot for tracked token, skipping");
                return None;
            };

            let adjusted = reservations.adjust(&config.token, raw);
            if adjusted != raw {
                debug!(
                    token = %config.token,
                    on_chain = %raw,
                    adjusted = %adjusted,
                    "Applied in-flight rebalance reservations"
                );
            }

            match TokenAnalysis::new(config, adjusted, default_band) {
                Ok(analysis) => Some(analysis),
                Err(error) => {
                    warn!(token = %config.token, %error, "Token skipped due to invalid config");
                    None
                }
            }
        })
        .collect()
}
