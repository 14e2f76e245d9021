//! Attestation bridge boundary for burn-and-mint USDC transfers.
//!
//! This crate holds the provider-agnostic vocabulary for two-phase bridges:
//! fee tiers keyed by finality threshold, and the three-way outcome of asking
//! an attestation service about a burn. The default (no features) build ships
//! only these shared types. Enable the `cctp` feature for the Circle CCTP V2
//! HTTP client and calldata builders.

use std::fmt;

use alloy::primitives::{Bytes, FixedBytes};
use serde::{Deserialize, Serialize};

#[cfg(feature = "cctp")]
pub mod cctp;

/// Finality threshold Circle uses for fast (soft-finality) transfers.
pub const FAST_FINALITY_THRESHOLD: u32 = 1000;

/// Finality threshold Circle uses for standard (hard-finality) transfers.
pub const STANDARD_FINALITY_THRESHOLD: u32 = 2000;

/// Bridge-specific identifier for a chain (CCTP calls these "domains").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Domain(pub u32);

impl fmt::Display for Domain {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}", self.0)
    }
}

/// Route class of a transfer. Fast routes pay a fee premium for a lower
/// finality threshold and are attested in seconds; standard routes wait for
/// hard finality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferSpeed {
    Fast,
    Standard,
}

impl TransferSpeed {
    pub const fn finality_threshold(self) -> u32 {
        match self {
            Self::Fast => FAST_FINALITY_THRESHOLD,
            Self::Standard => STANDARD_FINALITY_THRESHOLD,
        }
    }

    pub const fn from_finality_threshold(threshold: u32) -> Option<Self> {
        match threshold {
            FAST_FINALITY_THRESHOLD => Some(Self::Fast),
            STANDARD_FINALITY_THRESHOLD => Some(Self::Standard),
            _ => None,
        }
    }
}

impl fmt::Display for TransferSpeed {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fast => write!(formatter, "fast"),
            Self::Standard => write!(formatter, "standard"),
        }
    }
}

/// One fee tier offered by the bridge for a source/destination pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeOption {
    pub finality_threshold: u32,
    /// Minimum fee in basis points of the burned amount.
    pub fee_bps: u64,
}

/// Attested message ready to be relayed to the destination chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attestation {
    /// Message bytes as attested. In CCTP V2 this carries the real nonce,
    /// unlike the `MessageSent` event which holds a zero placeholder.
    pub message: Bytes,
    /// Attestation signature(s) authorizing the mint.
    pub attestation: Bytes,
    pub nonce: FixedBytes<32>,
}

/// Result of a single attestation lookup.
///
/// Transport failures never appear here: the bridge transaction is already
/// final on the source chain, so an unreachable attestation service only
/// means "ask again later".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttestationStatus {
    /// Not attested yet, or the service could not answer.
    Pending { reason: String },
    Complete(Attestation),
    /// The service reported that this message will never be attested.
    Failed { reason: String },
}

impl AttestationStatus {
    pub fn pending(reason: impl Into<String>) -> Self {
        Self::Pending {
            reason: reason.into(),
        }
    }
}
