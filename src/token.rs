//! Tracked tokens, balance snapshots and per-token rebalancing policy.

use std::fmt;

use alloy::primitives::{Address, U256};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use st0x_fixed_point::{Band, FixedPointError, parse_units};

pub(crate) type ChainId = u64;

/// Identity of a token: its chain plus contract address.
///
/// `Address` holds raw bytes, so two textual spellings that differ only in
/// case (checksummed vs lowercase) parse to the same identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TokenId {
    pub chain_id: ChainId,
    pub address: Address,
}

impl fmt::Display for TokenId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}:{:#x}", self.chain_id, self.address)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Token {
    pub chain_id: ChainId,
    pub address: Address,
    pub decimals: u8,
}

impl Token {
    pub const fn id(&self) -> TokenId {
        TokenId {
            chain_id: self.chain_id,
            address: self.address,
        }
    }

    pub fn same_token(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl fmt::Display for Token {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.id().fmt(formatter)
    }
}

/// Balance snapshot in the token's smallest unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenBalance {
    pub token: Token,
    pub raw_amount: U256,
}

/// Operator policy for one tracked token. Amounts are whole tokens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenConfig {
    pub token: Token,
    pub target_balance: Decimal,
    /// Floor applied to the lower edge of the allowed band.
    pub min_balance: Option<Decimal>,
    /// Overrides the global surplus/deficit thresholds for this token.
    pub band: Option<Band>,
}

impl TokenConfig {
    pub(crate) fn target_raw(&self) -> Result<U256, FixedPointError> {
        parse_units(self.target_balance, self.token.decimals)
    }

    pub(crate) fn min_balance_raw(&self) -> Result<Option<U256>, FixedPointError> {
        self.min_balance
            .map(|min| parse_units(min, self.token.decimals))
            .transpose()
    }
}
