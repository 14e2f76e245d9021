//! Balance analysis and route planning.
//!
//! [`analyzer`] classifies each tracked token against its target band.
//! [`router`] turns every deficit into a [`RebalanceRequest`] funded by
//! surplus tokens, preferring same-chain sources.

pub(crate) mod analyzer;
pub(crate) mod router;

use serde::{Deserialize, Serialize};

use crate::strategy::RebalanceQuote;
use crate::token::Token;

pub(crate) use analyzer::{Reservations, TokenAnalysis, TokenState, analyze_tokens};
pub(crate) use router::Router;

/// Execution plan for one deficit token. Each quote runs as its own
/// `ExecuteRebalance` job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct RebalanceRequest {
    pub(crate) token: Token,
    pub(crate) quotes: Vec<RebalanceQuote>,
}
