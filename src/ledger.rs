//! Rebalance ledger: one row per executed quote, keyed by correlation id.
//!
//! Rows move `pending -> submitted -> completed | failed`. The ledger is the
//! operator-facing record of what the orchestrator did, and the source of
//! the reservations that keep in-flight amounts from being planned twice.

use std::fmt;
use std::str::FromStr;

use alloy::primitives::{Address, TxHash, U256};
use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::SqlitePool;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::rebalancing::Reservations;
use crate::strategy::RebalanceQuote;
use crate::token::TokenId;

#[derive(Debug, thiserror::Error)]
pub(crate) enum LedgerError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("invalid {column} stored in rebalance ledger: {value}")]
    Corrupt { column: &'static str, value: String },
    #[error("unknown rebalance status {0:?}")]
    UnknownStatus(String),
    #[error("quote serialization error: {0}")]
    Quote(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RebalanceStatus {
    Pending,
    Submitted,
    Completed,
    Failed,
}

impl RebalanceStatus {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Submitted => "submitted",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for RebalanceStatus {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

impl FromStr for RebalanceStatus {
    type Err = LedgerError;

    fn from_str(status: &str) -> Result<Self, Self::Err> {
        match status {
            "pending" => Ok(Self::Pending),
            "submitted" => Ok(Self::Submitted),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(LedgerError::UnknownStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RebalanceRecord {
    pub(crate) correlation_id: Uuid,
    pub(crate) wallet: Address,
    pub(crate) strategy: String,
    pub(crate) token_in: TokenId,
    pub(crate) token_out: TokenId,
    pub(crate) amount_in: U256,
    pub(crate) amount_out: U256,
    pub(crate) slippage_bps: u64,
    pub(crate) status: RebalanceStatus,
    pub(crate) tx_hash: Option<TxHash>,
    pub(crate) error: Option<String>,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) updated_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct RebalanceRow {
    correlation_id: String,
    wallet: String,
    strategy: String,
    token_in_chain_id: i64,
    token_in_address: String,
    token_out_chain_id: i64,
    token_out_address: String,
    amount_in: String,
    amount_out: String,
    slippage_bps: i64,
    status: String,
    tx_hash: Option<String>,
    error: Option<String>,
    created_at: NaiveDateTime,
    updated_at: NaiveDateTime,
}

fn parse<T: FromStr>(column: &'static str, value: &str) -> Result<T, LedgerError> {
    value.parse().map_err(|_| LedgerError::Corrupt {
        column,
        value: value.to_string(),
    })
}

fn chain_id(column: &'static str, value: i64) -> Result<u64, LedgerError> {
    u64::try_from(value).map_err(|_| LedgerError::Corrupt {
        column,
        value: value.to_string(),
    })
}

impl TryFrom<RebalanceRow> for RebalanceRecord {
    type Error = LedgerError;

    fn try_from(row: RebalanceRow) -> Result<Self, Self::Error> {
        Ok(Self {
            correlation_id: parse("correlation_id", &row.correlation_id)?,
            wallet: parse("wallet", &row.wallet)?,
            strategy: row.strategy,
            token_in: TokenId {
                chain_id: chain_id("token_in_chain_id", row.token_in_chain_id)?,
                address: parse("token_in_address", &row.token_in_address)?,
            },
            token_out: TokenId {
                chain_id: chain_id("token_out_chain_id", row.token_out_chain_id)?,
                address: parse("token_out_address", &row.token_out_address)?,
            },
            amount_in: parse("amount_in", &row.amount_in)?,
            amount_out: parse("amount_out", &row.amount_out)?,
            slippage_bps: u64::try_from(row.slippage_bps).unwrap_or_default(),
            status: row.status.parse()?,
            tx_hash: row
                .tx_hash
                .as_deref()
                .map(|hash| parse("tx_hash", hash))
                .transpose()?,
            error: row.error,
            created_at: row.created_at.and_utc(),
            updated_at: row.updated_at.and_utc(),
        })
    }
}

#[derive(sqlx::FromRow)]
struct InFlightRow {
    token_in_chain_id: i64,
    token_in_address: String,
    token_out_chain_id: i64,
    token_out_address: String,
    amount_in: String,
    amount_out: String,
    status: String,
}

const SELECT_REBALANCE: &str = "SELECT correlation_id, wallet, strategy, token_in_chain_id, \
     token_in_address, token_out_chain_id, token_out_address, amount_in, amount_out, \
     slippage_bps, status, tx_hash, error, created_at, updated_at FROM rebalances";

#[derive(Clone)]
pub(crate) struct RebalanceLedger {
    pool: SqlitePool,
}

impl RebalanceLedger {
    pub(crate) const fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Records `quotes` as pending. Quotes moving nothing are skipped, and a
    /// correlation id that is already recorded is left untouched. Returns the
    /// quotes that were recorded.
    pub(crate) async fn record(
        &self,
        wallet: Address,
        quotes: &[RebalanceQuote],
    ) -> Result<Vec<RebalanceQuote>, LedgerError> {
        let mut recorded = Vec::with_capacity(quotes.len());

        for quote in quotes {
            if quote.amount_in.is_zero() || quote.amount_out.is_zero() {
                warn!(
                    correlation_id = %quote.correlation_id,
                    strategy = %quote.strategy,
                    amount_in = %quote.amount_in,
                    amount_out = %quote.amount_out,
                    "Skipping invalid rebalance quote"
                );
                continue;
            }

            let result = sqlx::query(
                "INSERT OR IGNORE INTO rebalances \
                 (correlation_id, wallet, strategy, token_in_chain_id, token_in_address, \
                  token_out_chain_id, token_out_address, amount_in, amount_out, slippage_bps, \
                  quote) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(quote.correlation_id.to_string())
            .bind(wallet.to_string())
            .bind(quote.strategy.as_str())
            .bind(i64::try_from(quote.token_in.chain_id).unwrap_or(i64::MAX))
            .bind(quote.token_in.address.to_string())
            .bind(i64::try_from(quote.token_out.chain_id).unwrap_or(i64::MAX))
            .bind(quote.token_out.address.to_string())
            .bind(quote.amount_in.to_string())
            .bind(quote.amount_out.to_string())
            .bind(i64::try_from(quote.slippage_bps).unwrap_or(i64::MAX))
            .bind(serde_json::to_string(quote)?)
            .execute(&self.pool)
            .await?;

            if result.rows_affected() == 0 {
                debug!(correlation_id = %quote.correlation_id, "Rebalance already recorded");
                continue;
            }

            recorded.push(quote.clone());
        }

        Ok(recorded)
    }

    pub(crate) async fn mark_submitted(
        &self,
        correlation_id: Uuid,
        tx_hash: TxHash,
    ) -> Result<(), LedgerError> {
        self.transition(
            correlation_id,
            RebalanceStatus::Submitted,
            &[RebalanceStatus::Pending],
            Some(tx_hash),
            None,
        )
        .await
    }

    pub(crate) async fn mark_completed(&self, correlation_id: Uuid) -> Result<(), LedgerError> {
        self.transition(
            correlation_id,
            RebalanceStatus::Completed,
            &[RebalanceStatus::Pending, RebalanceStatus::Submitted],
            None,
            None,
        )
        .await
    }

    pub(crate) async fn mark_failed(
        &self,
        correlation_id: Uuid,
        reason: &str,
    ) -> Result<(), LedgerError> {
        self.transition(
            correlation_id,
            RebalanceStatus::Failed,
            &[RebalanceStatus::Pending, RebalanceStatus::Submitted],
            None,
            Some(reason),
        )
        .await
    }

    /// Moves the row to `to` if it is currently in one of `from`. Anything
    /// else is a replay of a transition that already happened and is ignored.
    async fn transition(
        &self,
        correlation_id: Uuid,
        to: RebalanceStatus,
        from: &[RebalanceStatus],
        tx_hash: Option<TxHash>,
        error: Option<&str>,
    ) -> Result<(), LedgerError> {
        let placeholders = vec!["?"; from.len()].join(", ");
        let sql = format!(
            "UPDATE rebalances SET status = ?, tx_hash = COALESCE(?, tx_hash), \
             error = COALESCE(?, error), updated_at = CURRENT_TIMESTAMP \
             WHERE correlation_id = ? AND status IN ({placeholders})"
        );

        let mut query = sqlx::query(&sql)
            .bind(to.as_str())
            .bind(tx_hash.map(|hash| hash.to_string()))
            .bind(error)
            .bind(correlation_id.to_string());

        for status in from {
            query = query.bind(status.as_str());
        }

        let result = query.execute(&self.pool).await?;

        if result.rows_affected() == 0 {
            debug!(%correlation_id, status = %to, "Rebalance transition skipped");
        }

        Ok(())
    }

    pub(crate) async fn find(
        &self,
        correlation_id: Uuid,
    ) -> Result<Option<RebalanceRecord>, LedgerError> {
        let row: Option<RebalanceRow> =
            sqlx::query_as(&format!("{SELECT_REBALANCE} WHERE correlation_id = ?"))
                .bind(correlation_id.to_string())
                .fetch_optional(&self.pool)
                .await?;

        row.map(RebalanceRecord::try_from).transpose()
    }

    pub(crate) async fn for_wallet(
        &self,
        wallet: Address,
    ) -> Result<Vec<RebalanceRecord>, LedgerError> {
        let rows: Vec<RebalanceRow> =
            sqlx::query_as(&format!("{SELECT_REBALANCE} WHERE wallet = ? ORDER BY id"))
                .bind(wallet.to_string())
                .fetch_all(&self.pool)
                .await?;

        rows.into_iter().map(RebalanceRecord::try_from).collect()
    }

    /// Quotes of `wallet`'s rows still waiting to be submitted, oldest first.
    pub(crate) async fn pending_quotes(
        &self,
        wallet: Address,
    ) -> Result<Vec<RebalanceQuote>, LedgerError> {
        let quotes: Vec<String> = sqlx::query_scalar(
            "SELECT quote FROM rebalances WHERE wallet = ? AND status = 'pending' ORDER BY id",
        )
        .bind(wallet.to_string())
        .fetch_all(&self.pool)
        .await?;

        quotes
            .iter()
            .map(|quote| serde_json::from_str(quote).map_err(LedgerError::from))
            .collect()
    }

    /// Amounts committed to unfinished rebalances for `wallet`.
    ///
    /// Only `pending` rows reserve their source amount: once submitted, the
    /// on-chain balance already reflects the debit. Both `pending` and
    /// `submitted` rows count as incoming until they settle.
    pub(crate) async fn reservations(&self, wallet: Address) -> Result<Reservations, LedgerError> {
        let rows: Vec<InFlightRow> = sqlx::query_as(
            "SELECT token_in_chain_id, token_in_address, token_out_chain_id, token_out_address, \
             amount_in, amount_out, status FROM rebalances \
             WHERE wallet = ? AND status IN ('pending', 'submitted')",
        )
        .bind(wallet.to_string())
        .fetch_all(&self.pool)
        .await?;

        let mut reservations = Reservations::default();

        for row in rows {
            let status: RebalanceStatus = row.status.parse()?;

            if status == RebalanceStatus::Pending {
                let token_in = TokenId {
                    chain_id: chain_id("token_in_chain_id", row.token_in_chain_id)?,
                    address: parse("token_in_address", &row.token_in_address)?,
                };
                let amount_in: U256 = parse("amount_in", &row.amount_in)?;
                let reserved = reservations.reserved.entry(token_in).or_default();
                *reserved = reserved.saturating_add(amount_in);
            }

            let token_out = TokenId {
                chain_id: chain_id("token_out_chain_id", row.token_out_chain_id)?,
                address: parse("token_out_address", &row.token_out_address)?,
            };
            let amount_out: U256 = parse("amount_out", &row.amount_out)?;
            let incoming = reservations.incoming.entry(token_out).or_default();
            *incoming = incoming.saturating_add(amount_out);
        }

        Ok(reservations)
    }
}
