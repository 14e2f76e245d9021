//! Shared test fixtures: database setup, tracked tokens, CCTP chain
//! configuration and a queue whose payload writes can be made to fail.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use alloy::primitives::{Address, address};
use async_trait::async_trait;
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;
use uuid::Uuid;

use st0x_bridge::Domain;

use crate::cctp::{CctpChain, CctpConfig};
use crate::conductor::queue::FailureDisposition;
use crate::conductor::{
    Enqueued, Job, JobError, JobPayload, JobQueue, JobRecord, JobStarter, QueueError,
    SqliteJobQueue,
};
use crate::token::Token;

pub(crate) const WALLET: Address = address!("0xdddddddddddddddddddddddddddddddddddddddd");

pub(crate) const TOKEN_MESSENGER: Address = address!("0x28b5a0e9C621a5BadaA536219b3a228C8168cf5d");

pub(crate) const MESSAGE_TRANSMITTER: Address =
    address!("0x81D40F21F12A8F0E3252Bccb954D722d4c464B64");

pub(crate) const USDC_BASE: Token = Token {
    chain_id: 8453,
    address: address!("0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913"),
    decimals: 6,
};

pub(crate) const USDT_BASE: Token = Token {
    chain_id: 8453,
    address: address!("0xfde4C96c8593536E31F229EA8f37b2ADa2699bb2"),
    decimals: 6,
};

pub(crate) const DAI_BASE: Token = Token {
    chain_id: 8453,
    address: address!("0x50c5725949A6F0c72E6C4a641F24049A917DB0Cb"),
    decimals: 18,
};

pub(crate) const USDC_ARBITRUM: Token = Token {
    chain_id: 42161,
    address: address!("0xaf88d065e77c8cC2239327C5EDb3A432268e5831"),
    decimals: 6,
};

pub(crate) const USDT_ARBITRUM: Token = Token {
    chain_id: 42161,
    address: address!("0xFd086bC7CD5C481DCC9C85ebE478A1C0b69FCbb9"),
    decimals: 6,
};

/// In-memory SQLite database with all migrations applied.
///
/// Pinned to one connection: every new connection to `:memory:` would open
/// a separate, empty database.
pub(crate) async fn setup_test_db() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    sqlx::migrate!().run(&pool).await.unwrap();
    pool
}

/// CCTP settings for Base (domain 6) and Arbitrum (domain 3) against
/// `api_url`.
pub(crate) fn cctp_config(api_url: &str) -> CctpConfig {
    CctpConfig {
        api_url: api_url.to_string(),
        fast_transfer_enabled: true,
        fast_poll_interval_secs: 3,
        standard_poll_interval_secs: 30,
        chains: vec![
            CctpChain {
                chain_id: USDC_BASE.chain_id,
                domain: Domain(6),
                usdc: USDC_BASE.address,
                token_messenger: TOKEN_MESSENGER,
                message_transmitter: MESSAGE_TRANSMITTER,
            },
            CctpChain {
                chain_id: USDC_ARBITRUM.chain_id,
                domain: Domain(3),
                usdc: USDC_ARBITRUM.address,
                token_messenger: TOKEN_MESSENGER,
                message_transmitter: MESSAGE_TRANSMITTER,
            },
        ],
    }
}

/// SQLite queue that lets the first `allowed` calls to `update_payload`
/// through and fails every later one without writing.
pub(crate) struct FailingPayloadWrites {
    inner: Arc<SqliteJobQueue>,
    allowed: AtomicUsize,
}

impl FailingPayloadWrites {
    pub(crate) fn new(inner: Arc<SqliteJobQueue>, allowed: usize) -> Self {
        Self {
            inner,
            allowed: AtomicUsize::new(allowed),
        }
    }
}

#[async_trait]
impl JobStarter for FailingPayloadWrites {
    async fn start(&self, payload: JobPayload, delay: Duration) -> Result<Enqueued, QueueError> {
        self.inner.start(payload, delay).await
    }
}

#[async_trait]
impl JobQueue for FailingPayloadWrites {
    async fn dequeue(&self) -> Result<Option<Job>, QueueError> {
        self.inner.dequeue().await
    }

    async fn complete(&self, job_id: i64) -> Result<(), QueueError> {
        self.inner.complete(job_id).await
    }

    async fn fail(&self, job: &Job, error: &JobError) -> Result<FailureDisposition, QueueError> {
        self.inner.fail(job, error).await
    }

    async fn update_payload(&self, job_id: i64, payload: &JobPayload) -> Result<(), QueueError> {
        let allowed = self
            .allowed
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();

        if !allowed {
            return Err(QueueError::Database(sqlx::Error::PoolTimedOut));
        }

        self.inner.update_payload(job_id, payload).await
    }

    async fn jobs_for_correlation(
        &self,
        correlation_id: Uuid,
    ) -> Result<Vec<JobRecord>, QueueError> {
        self.inner.jobs_for_correlation(correlation_id).await
    }
}
