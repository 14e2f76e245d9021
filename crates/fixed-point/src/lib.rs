//! Exact fixed-point arithmetic over raw token amounts.
//!
//! Token balances are integers in the token's smallest unit (`U256`), while
//! operator policy (thresholds, slippage, targets) is expressed as decimal
//! fractions. Every function here converts the fraction into an integer
//! numerator over `10^precision` and then works purely in `U256`, so results
//! are reproducible bit-for-bit across runs and never touch floats.
//!
//! Rounding is always truncation toward zero, applied at two points:
//!
//! 1. `fraction × 10^precision` is truncated to an integer numerator.
//! 2. `value × numerator / 10^precision` uses integer division.
//!
//! Overflow is detected before the multiplication happens, so a caller either
//! gets the exact truncated result or a [`FixedPointError::Overflow`].

use alloy::primitives::U256;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};

/// Smallest accepted precision (decimal digits kept from the fraction).
pub const MIN_PRECISION: u8 = 1;

/// Largest accepted precision. `10^18` still fits in a `u64`.
pub const MAX_PRECISION: u8 = 18;

/// Precision used by [`range_from_percentage`].
pub const DEFAULT_PRECISION: u8 = MAX_PRECISION;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FixedPointError {
    #[error("fraction must be non-negative, got {0}")]
    NegativeFraction(Decimal),
    #[error("precision must be within [{MIN_PRECISION}, {MAX_PRECISION}], got {0}")]
    InvalidPrecision(u8),
    #[error("fraction {fraction} cannot be scaled to {precision} decimal places")]
    FractionTooLarge { fraction: Decimal, precision: u8 },
    #[error("{value} x {numerator} overflows 256 bits")]
    Overflow { value: U256, numerator: U256 },
    #[error("percentage must be within [0, 1], got {0}")]
    PercentageOutOfRange(Decimal),
    #[error("amount must be non-negative, got {0}")]
    NegativeAmount(Decimal),
}

/// Multiplies `value` by `fraction`, keeping `precision` decimal digits of
/// the fraction and truncating toward zero.
///
/// Computes `value × trunc(fraction × 10^precision) / 10^precision`.
///
/// ```
/// use alloy::primitives::U256;
/// use rust_decimal::Decimal;
/// use st0x_fixed_point::multiply_by_fraction;
///
/// let value = U256::from(1_000u64);
/// let result = multiply_by_fraction(value, Decimal::new(9, 1), 18).unwrap();
/// assert_eq!(result, U256::from(900u64));
/// ```
pub fn multiply_by_fraction(
    value: U256,
    fraction: Decimal,
    precision: u8,
) -> Result<U256, FixedPointError> {
    if !(MIN_PRECISION..=MAX_PRECISION).contains(&precision) {
        return Err(FixedPointError::InvalidPrecision(precision));
    }

    if fraction < Decimal::ZERO {
        return Err(FixedPointError::NegativeFraction(fraction));
    }

    let scale = 10u64.pow(u32::from(precision));
    let numerator = scaled_numerator(fraction, scale, precision)?;

    if !numerator.is_zero() && value > U256::MAX / numerator {
        return Err(FixedPointError::Overflow { value, numerator });
    }

    Ok(value * numerator / U256::from(scale))
}

fn scaled_numerator(fraction: Decimal, scale: u64, precision: u8) -> Result<U256, FixedPointError> {
    let too_large = || FixedPointError::FractionTooLarge {
        fraction,
        precision,
    };

    let scaled = fraction
        .checked_mul(Decimal::from(scale))
        .ok_or_else(too_large)?
        .trunc();

    scaled.to_u128().map(U256::from).ok_or_else(too_large)
}

/// Asymmetric tolerance band around a target, as fractions of the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Band {
    /// Allowed excess above the target (`0.1` = 10%).
    pub up: Decimal,
    /// Allowed shortfall below the target, within `[0, 1]`.
    pub down: Decimal,
}

/// Inclusive `[min, max]` range in raw token units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    pub min: U256,
    pub max: U256,
}

impl Range {
    pub fn contains(&self, amount: U256) -> bool {
        self.min <= amount && amount <= self.max
    }
}

/// Derives `{min = balance × (1 − down), max = balance × (1 + up)}`.
///
/// Each bound is computed independently with [`multiply_by_fraction`] at
/// [`DEFAULT_PRECISION`], so `min ≤ balance ≤ max` always holds.
pub fn range_from_percentage(balance: U256, band: Band) -> Result<Range, FixedPointError> {
    if band.down < Decimal::ZERO || band.down > Decimal::ONE {
        return Err(FixedPointError::PercentageOutOfRange(band.down));
    }

    if band.up < Decimal::ZERO {
        return Err(FixedPointError::PercentageOutOfRange(band.up));
    }

    let min = multiply_by_fraction(balance, Decimal::ONE - band.down, DEFAULT_PRECISION)?;
    let max = multiply_by_fraction(balance, Decimal::ONE + band.up, DEFAULT_PRECISION)?;

    Ok(Range { min, max })
}

/// Converts a whole-token decimal amount (`"1000.5"`) into raw units for a
/// token with `decimals` places, truncating digits beyond `decimals`.
pub fn parse_units(amount: Decimal, decimals: u8) -> Result<U256, FixedPointError> {
    if amount < Decimal::ZERO {
        return Err(FixedPointError::NegativeAmount(amount));
    }

    let mantissa = U256::from(amount.mantissa().unsigned_abs());
    let amount_scale = U256::from(10u64).pow(U256::from(amount.scale()));
    let token_scale = U256::from(10u64).pow(U256::from(decimals));

    if !token_scale.is_zero() && mantissa > U256::MAX / token_scale {
        return Err(FixedPointError::Overflow {
            value: mantissa,
            numerator: token_scale,
        });
    }

    Ok(mantissa * token_scale / amount_scale)
}

/// Re-expresses a raw amount from `from` decimals to `to` decimals,
/// truncating when precision is dropped and saturating when scaling up
/// would exceed 256 bits.
pub fn rescale(amount: U256, from: u8, to: u8) -> U256 {
    match from.cmp(&to) {
        std::cmp::Ordering::Equal => amount,
        std::cmp::Ordering::Greater => {
            amount / U256::from(10u64).pow(U256::from(from - to))
        }
        std::cmp::Ordering::Less => {
            amount.saturating_mul(U256::from(10u64).pow(U256::from(to - from)))
        }
    }
}
