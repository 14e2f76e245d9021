//! Composition root for the rebalancing workflow.
//!
//! A [`CheckBalances`] job reads balances, analyzes them against the ledger's
//! reservations, plans quotes and records them. Each recorded quote becomes
//! one [`ExecuteRebalance`] job. Strategies that settle asynchronously chain
//! further jobs from there (attestation, mint, destination swap).

use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::{Address, TxHash};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use st0x_fixed_point::Band;

use crate::balance::BalanceReader;
use crate::conductor::{
    Enqueued, Job, JobData, JobError, JobHandler, JobKind, JobOutcome, JobPayload, JobQueue,
    JobRecord, JobRegistry, JobStarter, QueueError, SqliteJobQueue, Worker,
};
use crate::ledger::{LedgerError, RebalanceLedger, RebalanceRecord};
use crate::rebalancing::{Router, TokenState, analyze_tokens};
use crate::strategy::{
    ExecutionError, RebalanceQuote, RebalanceStrategy, Settlement, StrategyRegistry,
};
use crate::token::TokenConfig;
use crate::wallet::{Wallet, WalletError};

#[derive(Debug, thiserror::Error)]
pub(crate) enum OrchestratorError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error("no rebalance or job found for correlation id {0}")]
    NotFound(Uuid),
    #[error("rebalance {0} may have been submitted by an earlier attempt that recorded no tx hash")]
    UnconfirmedSubmission(Uuid),
}

/// Periodic balance check for one wallet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CheckBalances {
    pub(crate) wallet: Address,
    /// `floor(now / interval)` at scheduling time.
    pub(crate) bucket: u64,
}

impl JobData for CheckBalances {
    const KIND: JobKind = JobKind::CheckBalances;

    fn correlation_id(&self) -> Uuid {
        Uuid::nil()
    }

    fn step(&self) -> String {
        self.bucket.to_string()
    }
}

impl From<CheckBalances> for JobPayload {
    fn from(data: CheckBalances) -> Self {
        Self::CheckBalances(data)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ExecuteRebalance {
    pub(crate) wallet: Address,
    pub(crate) quote: RebalanceQuote,
    /// Set once the strategy has submitted, so a retry waits on it instead
    /// of submitting again.
    pub(crate) tx_hash: Option<TxHash>,
    /// Persisted before calling the strategy. A retry that finds this set
    /// but no tx hash here or in the ledger cannot tell whether funds moved.
    #[serde(default)]
    pub(crate) submitting: bool,
}

impl ExecuteRebalance {
    pub(crate) const fn new(wallet: Address, quote: RebalanceQuote) -> Self {
        Self {
            wallet,
            quote,
            tx_hash: None,
            submitting: false,
        }
    }
}

impl JobData for ExecuteRebalance {
    const KIND: JobKind = JobKind::ExecuteRebalance;

    fn correlation_id(&self) -> Uuid {
        self.quote.correlation_id
    }

    fn step(&self) -> String {
        "execute".to_string()
    }
}

impl From<ExecuteRebalance> for JobPayload {
    fn from(data: ExecuteRebalance) -> Self {
        Self::ExecuteRebalance(data)
    }
}

/// Interval bucket a check scheduled at `now` belongs to.
pub(crate) fn interval_bucket(now: DateTime<Utc>, interval: Duration) -> u64 {
    let seconds = u64::try_from(now.timestamp()).unwrap_or(0);
    seconds / interval.as_secs().max(1)
}

/// Enqueues the balance check for the bucket containing `now`. Schedulers
/// racing on the same bucket produce one job.
pub(crate) async fn schedule_check(
    jobs: &dyn JobStarter,
    wallet: Address,
    interval: Duration,
    now: DateTime<Utc>,
) -> Result<Enqueued, QueueError> {
    let bucket = interval_bucket(now, interval);
    let enqueued = jobs
        .start(CheckBalances { wallet, bucket }.into(), Duration::ZERO)
        .await?;

    match enqueued {
        Enqueued::Queued(job_id) => debug!(%wallet, bucket, job_id, "Scheduled balance check"),
        Enqueued::Duplicate => debug!(%wallet, bucket, "Balance check already scheduled"),
    }

    Ok(enqueued)
}

pub(crate) struct CheckBalancesHandler {
    balances: Arc<dyn BalanceReader>,
    ledger: RebalanceLedger,
    router: Router,
    tokens: Vec<TokenConfig>,
    band: Band,
    quote_only: bool,
}

impl CheckBalancesHandler {
    pub(crate) fn new(
        balances: Arc<dyn BalanceReader>,
        ledger: RebalanceLedger,
        router: Router,
        tokens: Vec<TokenConfig>,
        band: Band,
    ) -> Self {
        Self {
            balances,
            ledger,
            router,
            tokens,
            band,
            quote_only: false,
        }
    }

    /// Logs each plan instead of recording and executing it.
    pub(crate) fn quote_only(mut self) -> Self {
        self.quote_only = true;
        self
    }

    fn data<'a>(&self, job: &'a Job) -> Result<&'a CheckBalances, JobError> {
        match &job.payload {
            JobPayload::CheckBalances(check) => Ok(check),
            other => Err(JobError::wrong_payload(self.kind(), other)),
        }
    }

    /// Starts execution of every pending row. A row recorded by a check
    /// that died before starting its job gets one now; the rest are
    /// duplicates of jobs that already exist.
    async fn restart_pending(&self, wallet: Address, queue: &dyn JobQueue) -> Result<(), JobError> {
        for quote in self.ledger.pending_quotes(wallet).await? {
            let correlation_id = quote.correlation_id;
            let execute = ExecuteRebalance::new(wallet, quote);

            if let Enqueued::Queued(job_id) = queue.start(execute.into(), Duration::ZERO).await? {
                warn!(%correlation_id, job_id, "Started execution of a pending rebalance that had no job");
            }
        }

        Ok(())
    }
}

#[async_trait]
impl JobHandler for CheckBalancesHandler {
    fn kind(&self) -> JobKind {
        JobKind::CheckBalances
    }

    #[tracing::instrument(skip_all, fields(job_id = job.id), level = tracing::Level::DEBUG)]
    async fn process(&self, job: &Job, _queue: &dyn JobQueue) -> Result<JobOutcome, JobError> {
        let check = self.data(job)?;

        let reservations = self.ledger.reservations(check.wallet).await?;
        let balances = self
            .balances
            .balances(check.wallet)
            .await
            .map_err(JobError::retryable)?;

        let analyses = analyze_tokens(&self.tokens, &balances, &reservations, self.band);

        let count = |state| analyses.iter().filter(|analysis| analysis.state == state).count();
        info!(
            wallet = %check.wallet,
            bucket = check.bucket,
            surplus = count(TokenState::Surplus),
            in_range = count(TokenState::InRange),
            deficit = count(TokenState::Deficit),
            reserved = !reservations.is_empty(),
            "Analyzed balances"
        );

        let requests = self.router.plan(check.wallet, analyses).await;

        Ok(JobOutcome::Planned(requests))
    }

    async fn on_complete(
        &self,
        job: &Job,
        outcome: JobOutcome,
        queue: &dyn JobQueue,
    ) -> Result<(), JobError> {
        let check = self.data(job)?;

        let JobOutcome::Planned(requests) = outcome else {
            return Err(JobError::unexpected_outcome(self.kind(), &outcome));
        };

        if self.quote_only {
            for quote in requests.iter().flat_map(|request| &request.quotes) {
                info!(
                    strategy = %quote.strategy,
                    token_in = %quote.token_in,
                    token_out = %quote.token_out,
                    amount_in = %quote.amount_in,
                    amount_out = %quote.amount_out,
                    slippage_bps = quote.slippage_bps,
                    "Quote-only mode, not executing"
                );
            }
            return Ok(());
        }

        self.restart_pending(check.wallet, queue).await?;

        for request in requests {
            let recorded = self.ledger.record(check.wallet, &request.quotes).await?;

            for quote in recorded {
                let correlation_id = quote.correlation_id;
                let execute = ExecuteRebalance::new(check.wallet, quote);

                if let Enqueued::Queued(job_id) = queue.start(execute.into(), Duration::ZERO).await? {
                    debug!(%correlation_id, job_id, token = %request.token, "Started rebalance execution");
                }
            }
        }

        Ok(())
    }
}

pub(crate) struct ExecuteRebalanceHandler {
    strategies: Arc<StrategyRegistry>,
    wallet: Arc<dyn Wallet>,
    ledger: RebalanceLedger,
}

impl ExecuteRebalanceHandler {
    pub(crate) fn new(
        strategies: Arc<StrategyRegistry>,
        wallet: Arc<dyn Wallet>,
        ledger: RebalanceLedger,
    ) -> Self {
        Self {
            strategies,
            wallet,
            ledger,
        }
    }

    fn data<'a>(&self, job: &'a Job) -> Result<&'a ExecuteRebalance, JobError> {
        match &job.payload {
            JobPayload::ExecuteRebalance(execute) => Ok(execute),
            other => Err(JobError::wrong_payload(self.kind(), other)),
        }
    }

    /// Hash of a submission an earlier attempt already made, from the job
    /// payload or, failing that, the ledger.
    async fn earlier_submission(&self, execute: &ExecuteRebalance) -> Result<Option<TxHash>, JobError> {
        if let Some(tx_hash) = execute.tx_hash {
            return Ok(Some(tx_hash));
        }

        if !execute.submitting {
            return Ok(None);
        }

        let correlation_id = execute.quote.correlation_id;
        let recorded = self
            .ledger
            .find(correlation_id)
            .await?
            .and_then(|record| record.tx_hash);

        match recorded {
            Some(tx_hash) => Ok(Some(tx_hash)),
            None => {
                error!(
                    %correlation_id,
                    wallet = %execute.wallet,
                    token_in = %execute.quote.token_in,
                    amount_in = %execute.quote.amount_in,
                    "Earlier submission attempt left no tx hash, reconcile the wallet manually"
                );
                Err(JobError::unrecoverable(OrchestratorError::UnconfirmedSubmission(
                    correlation_id,
                )))
            }
        }
    }

    async fn submit(
        &self,
        job: &Job,
        execute: &ExecuteRebalance,
        strategy: &dyn RebalanceStrategy,
        queue: &dyn JobQueue,
    ) -> Result<TxHash, JobError> {
        let quote = &execute.quote;
        let correlation_id = quote.correlation_id;

        let submitting = ExecuteRebalance {
            submitting: true,
            ..execute.clone()
        };
        queue.update_payload(job.id, &submitting.clone().into()).await?;

        let tx_hash = match strategy.submit(execute.wallet, quote).await {
            Ok(tx_hash) => tx_hash,
            Err(submit_error) => {
                // No hash came back, so the next attempt may submit again.
                if let Err(error) = queue.update_payload(job.id, &execute.clone().into()).await {
                    warn!(%correlation_id, %error, "Failed to clear submission marker");
                }
                return Err(submit_error.into());
            }
        };

        info!(
            %tx_hash,
            strategy = %quote.strategy,
            token_in = %quote.token_in,
            token_out = %quote.token_out,
            amount_in = %quote.amount_in,
            amount_out = %quote.amount_out,
            "Submitted rebalance"
        );

        // Funds have moved: bookkeeping failures from here on must not turn
        // into a retry that submits again.
        if let Err(error) = self.ledger.mark_submitted(correlation_id, tx_hash).await {
            warn!(%correlation_id, %tx_hash, %error, "Failed to record submitted rebalance");
        }

        let submitted = ExecuteRebalance {
            tx_hash: Some(tx_hash),
            ..submitting
        };
        if let Err(error) = queue.update_payload(job.id, &submitted.into()).await {
            warn!(%correlation_id, %tx_hash, %error, "Failed to persist rebalance tx hash");
        }

        Ok(tx_hash)
    }
}

#[async_trait]
impl JobHandler for ExecuteRebalanceHandler {
    fn kind(&self) -> JobKind {
        JobKind::ExecuteRebalance
    }

    #[tracing::instrument(
        skip_all,
        fields(job_id = job.id, correlation_id = %job.correlation_id),
        level = tracing::Level::DEBUG
    )]
    async fn process(&self, job: &Job, queue: &dyn JobQueue) -> Result<JobOutcome, JobError> {
        let execute = self.data(job)?;
        let quote = &execute.quote;

        let strategy = self
            .strategies
            .get(quote.strategy)
            .ok_or(ExecutionError::UnknownStrategy(quote.strategy))?;

        let tx_hash = match self.earlier_submission(execute).await? {
            Some(tx_hash) => {
                info!(%tx_hash, "Resuming submitted rebalance");
                tx_hash
            }
            None => self.submit(job, execute, &**strategy, queue).await?,
        };

        let receipt = self
            .wallet
            .wait_for_receipt(quote.token_in.chain_id, tx_hash)
            .await?;

        if !receipt.success {
            return Err(WalletError::Reverted(tx_hash).into());
        }

        let settlement = strategy.settle(execute.wallet, quote, tx_hash).await?;

        Ok(JobOutcome::Settled(settlement))
    }

    async fn on_complete(
        &self,
        job: &Job,
        outcome: JobOutcome,
        _queue: &dyn JobQueue,
    ) -> Result<(), JobError> {
        let execute = self.data(job)?;
        let correlation_id = execute.quote.correlation_id;

        match outcome {
            JobOutcome::Settled(Settlement::Complete) => {
                self.ledger.mark_completed(correlation_id).await?;
                info!(%correlation_id, strategy = %execute.quote.strategy, "Rebalance completed");
                Ok(())
            }
            JobOutcome::Settled(Settlement::Pending) => {
                debug!(%correlation_id, strategy = %execute.quote.strategy, "Rebalance awaiting settlement");
                Ok(())
            }
            other => Err(JobError::unexpected_outcome(self.kind(), &other)),
        }
    }

    async fn on_failed(&self, job: &Job, failure: &JobError) {
        let Ok(execute) = self.data(job) else {
            return;
        };
        let correlation_id = execute.quote.correlation_id;

        error!(
            %correlation_id,
            strategy = %execute.quote.strategy,
            tx_hash = ?execute.tx_hash,
            error = %failure,
            "Rebalance execution failed"
        );

        if let Err(ledger_error) = self.ledger.mark_failed(correlation_id, &failure.to_string()).await {
            warn!(%correlation_id, %ledger_error, "Failed to record rebalance failure");
        }
    }
}

/// Ledger row plus every job that ran under one correlation id.
#[derive(Debug, Clone)]
pub(crate) struct ExecutionStatus {
    pub(crate) rebalance: Option<RebalanceRecord>,
    pub(crate) jobs: Vec<JobRecord>,
}

pub(crate) struct Orchestrator {
    queue: Arc<SqliteJobQueue>,
    ledger: RebalanceLedger,
    registry: Arc<JobRegistry>,
    wallet: Address,
}

impl Orchestrator {
    pub(crate) fn new(
        queue: Arc<SqliteJobQueue>,
        ledger: RebalanceLedger,
        registry: JobRegistry,
        wallet: Address,
    ) -> Self {
        Self {
            queue,
            ledger,
            registry: Arc::new(registry),
            wallet,
        }
    }

    pub(crate) fn worker(&self, idle_poll: Duration) -> Worker {
        Worker::new(self.queue.clone(), self.registry.clone(), idle_poll)
    }

    pub(crate) fn spawn_workers(&self, count: usize, idle_poll: Duration) -> Vec<JoinHandle<()>> {
        info!(count, "Starting job workers");
        self.worker(idle_poll).spawn_pool(count)
    }

    /// Enqueues a balance check at every `interval` tick, starting now.
    pub(crate) fn spawn_scheduler(&self, interval: Duration) -> JoinHandle<()> {
        let queue = self.queue.clone();
        let wallet = self.wallet;

        tokio::spawn(async move {
            info!(%wallet, interval_secs = interval.as_secs(), "Starting balance check scheduler");

            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;

                if let Err(error) = schedule_check(queue.as_ref(), wallet, interval, Utc::now()).await {
                    error!(%wallet, %error, "Failed to schedule balance check");
                }
            }
        })
    }

    pub(crate) async fn execution_status(
        &self,
        correlation_id: Uuid,
    ) -> Result<ExecutionStatus, OrchestratorError> {
        let rebalance = self.ledger.find(correlation_id).await?;
        let jobs = self.queue.jobs_for_correlation(correlation_id).await?;

        if rebalance.is_none() && jobs.is_empty() {
            return Err(OrchestratorError::NotFound(correlation_id));
        }

        Ok(ExecutionStatus { rebalance, jobs })
    }

    pub(crate) async fn rebalances_for_wallet(
        &self,
        wallet: Address,
    ) -> Result<Vec<RebalanceRecord>, OrchestratorError> {
        Ok(self.ledger.for_wallet(wallet).await?)
    }
}

#[cfg(test)]
mod tests {
    use alloy::primitives::U256;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;
    use tracing_test::traced_test;

    use st0x_fixed_point::parse_units;

    use super::*;
    use crate::balance::mock::MockBalanceReader;
    use crate::conductor::JobStatus;
    use crate::conductor::worker::Tick;
    use crate::ledger::RebalanceStatus;
    use crate::strategy::StrategyName;
    use crate::strategy::mock::MockStrategy;
    use crate::test_utils::{FailingPayloadWrites, USDC_BASE, USDT_BASE, WALLET, setup_test_db};
    use crate::token::{Token, TokenBalance};
    use crate::wallet::mock::MockWallet;

    const BAND: Band = Band {
        up: dec!(0.1),
        down: dec!(0.1),
    };

    fn balance(token: Token, whole: u64) -> TokenBalance {
        TokenBalance {
            token,
            raw_amount: parse_units(rust_decimal::Decimal::from(whole), token.decimals).unwrap(),
        }
    }

    fn config(token: Token) -> TokenConfig {
        TokenConfig {
            token,
            target_balance: dec!(1000),
            min_balance: None,
            band: None,
        }
    }

    struct Harness {
        orchestrator: Orchestrator,
        worker: Worker,
        queue: Arc<SqliteJobQueue>,
        balances: Arc<MockBalanceReader>,
        strategy: Arc<MockStrategy>,
        wallet: Arc<MockWallet>,
    }

    async fn harness(strategy: MockStrategy, wallet: MockWallet) -> Harness {
        build_harness(strategy, wallet, false).await
    }

    async fn build_harness(strategy: MockStrategy, wallet: MockWallet, quote_only: bool) -> Harness {
        let pool = setup_test_db().await;
        let queue = Arc::new(SqliteJobQueue::new(pool.clone()));
        let ledger = RebalanceLedger::new(pool);
        let strategy = Arc::new(strategy);
        let wallet = Arc::new(wallet);
        let balances = Arc::new(MockBalanceReader::new(vec![
            balance(USDC_BASE, 1500),
            balance(USDT_BASE, 500),
        ]));

        let strategies = Arc::new(StrategyRegistry::new(vec![strategy.clone()], 100));
        let check = CheckBalancesHandler::new(
            balances.clone(),
            ledger.clone(),
            Router::new(strategies.clone(), None),
            vec![config(USDC_BASE), config(USDT_BASE)],
            BAND,
        );
        let check = if quote_only { check.quote_only() } else { check };

        let registry = JobRegistry::new()
            .with(Arc::new(check))
            .with(Arc::new(ExecuteRebalanceHandler::new(
                strategies,
                wallet.clone(),
                ledger.clone(),
            )));

        let orchestrator = Orchestrator::new(queue.clone(), ledger, registry, WALLET);
        let worker = orchestrator.worker(Duration::from_millis(10));

        Harness {
            orchestrator,
            worker,
            queue,
            balances,
            strategy,
            wallet,
        }
    }

    async fn enqueue_check(harness: &Harness, bucket: u64) {
        harness
            .queue
            .start(
                CheckBalances {
                    wallet: WALLET,
                    bucket,
                }
                .into(),
                Duration::ZERO,
            )
            .await
            .unwrap();
    }

    async fn check_now(harness: &Harness, bucket: u64) {
        enqueue_check(harness, bucket).await;
        harness.worker.process_next().await.unwrap();
    }

    #[test]
    fn buckets_floor_by_interval() {
        let interval = Duration::from_secs(300);
        let start = Utc.timestamp_opt(1_800_000_000, 0).unwrap();

        assert_eq!(interval_bucket(start, interval), 6_000_000);
        assert_eq!(
            interval_bucket(start + chrono::Duration::seconds(299), interval),
            6_000_000
        );
        assert_eq!(
            interval_bucket(start + chrono::Duration::seconds(300), interval),
            6_000_001
        );
    }

    #[tokio::test]
    async fn concurrent_schedulers_enqueue_one_check_per_bucket() {
        let harness = harness(MockStrategy::new(StrategyName::Mock), MockWallet::new()).await;
        let now = Utc::now();
        let interval = Duration::from_secs(300);

        let first = schedule_check(harness.queue.as_ref(), WALLET, interval, now)
            .await
            .unwrap();
        let second = schedule_check(harness.queue.as_ref(), WALLET, interval, now)
            .await
            .unwrap();

        assert!(matches!(first, Enqueued::Queued(_)));
        assert_eq!(second, Enqueued::Duplicate);
    }

    #[tokio::test]
    async fn balance_check_records_and_starts_one_execution_per_quote() {
        let harness = harness(MockStrategy::new(StrategyName::Mock), MockWallet::new()).await;

        check_now(&harness, 1).await;

        let rebalances = harness
            .orchestrator
            .rebalances_for_wallet(WALLET)
            .await
            .unwrap();
        assert_eq!(rebalances.len(), 1);

        let record = &rebalances[0];
        assert_eq!(record.status, RebalanceStatus::Pending);
        assert_eq!(record.token_in, USDC_BASE.id());
        assert_eq!(record.token_out, USDT_BASE.id());
        assert_eq!(record.amount_in, U256::from(400_000_000u64));

        let status = harness
            .orchestrator
            .execution_status(record.correlation_id)
            .await
            .unwrap();
        assert_eq!(status.jobs.len(), 1);
        assert!(matches!(
            &status.jobs[0].payload,
            JobPayload::ExecuteRebalance(execute) if execute.tx_hash.is_none()
        ));
    }

    #[tokio::test]
    async fn pending_rebalance_reserves_its_amounts_for_the_next_check() {
        let harness = harness(MockStrategy::new(StrategyName::Mock), MockWallet::new()).await;

        // both checks are queued ahead of the execution the first one starts
        enqueue_check(&harness, 1).await;
        enqueue_check(&harness, 2).await;
        harness.worker.process_next().await.unwrap();
        harness.worker.process_next().await.unwrap();

        assert_eq!(harness.balances.calls(), 2);
        assert_eq!(harness.strategy.quotes(), 1);
        assert_eq!(harness.strategy.submissions(), 0);
        assert_eq!(
            harness
                .orchestrator
                .rebalances_for_wallet(WALLET)
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn submitted_rebalance_counts_as_incoming_for_the_next_check() {
        let harness = harness(
            MockStrategy::new(StrategyName::Mock).settling_later(),
            MockWallet::new(),
        )
        .await;

        check_now(&harness, 1).await;
        harness
            .balances
            .set(vec![balance(USDC_BASE, 1100), balance(USDT_BASE, 500)]);
        enqueue_check(&harness, 2).await;

        // execution first, then the second check
        harness.worker.process_next().await.unwrap();
        harness.worker.process_next().await.unwrap();

        assert_eq!(harness.strategy.submissions(), 1);
        assert_eq!(harness.strategy.quotes(), 1);

        let rebalances = harness
            .orchestrator
            .rebalances_for_wallet(WALLET)
            .await
            .unwrap();
        assert_eq!(rebalances.len(), 1);
        assert_eq!(rebalances[0].status, RebalanceStatus::Submitted);
    }

    #[tokio::test]
    async fn execution_submits_once_and_completes_the_ledger_row() {
        let harness = harness(MockStrategy::new(StrategyName::Mock), MockWallet::new()).await;

        check_now(&harness, 1).await;
        harness.worker.process_next().await.unwrap();

        let record = harness
            .orchestrator
            .rebalances_for_wallet(WALLET)
            .await
            .unwrap()
            .remove(0);
        assert_eq!(record.status, RebalanceStatus::Completed);
        assert!(record.tx_hash.is_some());
        assert_eq!(harness.strategy.submissions(), 1);
        assert_eq!(harness.wallet.receipt_lookups(), 1);

        let status = harness
            .orchestrator
            .execution_status(record.correlation_id)
            .await
            .unwrap();
        assert_eq!(status.jobs[0].status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn asynchronous_settlement_leaves_the_row_submitted() {
        let harness = harness(
            MockStrategy::new(StrategyName::Mock).settling_later(),
            MockWallet::new(),
        )
        .await;

        check_now(&harness, 1).await;
        harness.worker.process_next().await.unwrap();

        let record = harness
            .orchestrator
            .rebalances_for_wallet(WALLET)
            .await
            .unwrap()
            .remove(0);
        assert_eq!(record.status, RebalanceStatus::Submitted);
    }

    #[traced_test]
    #[tokio::test]
    async fn reverted_submission_fails_without_resubmitting() {
        let harness = harness(MockStrategy::new(StrategyName::Mock), MockWallet::reverting()).await;

        check_now(&harness, 1).await;
        harness.worker.process_next().await.unwrap();
        harness.queue.release_delayed().await;
        harness.worker.process_next().await.unwrap();

        let record = harness
            .orchestrator
            .rebalances_for_wallet(WALLET)
            .await
            .unwrap()
            .remove(0);
        assert_eq!(record.status, RebalanceStatus::Failed);
        assert_eq!(harness.strategy.submissions(), 1);
        assert!(logs_contain("Rebalance execution failed"));
    }

    #[tokio::test]
    async fn unknown_correlation_id_is_not_found() {
        let harness = harness(MockStrategy::new(StrategyName::Mock), MockWallet::new()).await;

        let error = harness
            .orchestrator
            .execution_status(Uuid::new_v4())
            .await
            .unwrap_err();

        assert!(matches!(error, OrchestratorError::NotFound(_)), "{error:?}");
    }

    #[traced_test]
    #[tokio::test]
    async fn quote_only_mode_logs_the_plan_without_recording_it() {
        let harness = build_harness(MockStrategy::new(StrategyName::Mock), MockWallet::new(), true).await;

        check_now(&harness, 1).await;

        assert_eq!(harness.strategy.quotes(), 1);
        assert!(
            harness
                .orchestrator
                .rebalances_for_wallet(WALLET)
                .await
                .unwrap()
                .is_empty()
        );
        assert_eq!(
            harness.worker.process_next().await.unwrap(),
            crate::conductor::worker::Tick::Idle
        );
        assert!(logs_contain("Quote-only mode, not executing"));
    }

    async fn only_record(harness: &Harness) -> RebalanceRecord {
        harness
            .orchestrator
            .rebalances_for_wallet(WALLET)
            .await
            .unwrap()
            .remove(0)
    }

    /// Claims the execution job and stores it with the submission marker
    /// set, as an attempt that died inside `submit` would have left it.
    async fn interrupt_submission(harness: &Harness) -> Uuid {
        let job = harness.queue.dequeue().await.unwrap().unwrap();
        let JobPayload::ExecuteRebalance(execute) = &job.payload else {
            panic!("expected execution, got {:?}", job.payload);
        };

        let marked = ExecuteRebalance {
            submitting: true,
            ..execute.clone()
        };
        harness
            .queue
            .update_payload(job.id, &marked.into())
            .await
            .unwrap();
        harness.queue.recover_stalled().await.unwrap();

        job.correlation_id
    }

    #[tokio::test]
    async fn lost_tx_hash_write_does_not_resubmit() {
        let harness = harness(MockStrategy::new(StrategyName::Mock), MockWallet::new()).await;
        check_now(&harness, 1).await;

        // the marker write goes through, the tx hash write fails
        let queue = Arc::new(FailingPayloadWrites::new(harness.queue.clone(), 1));
        let worker = Worker::new(queue, harness.orchestrator.registry.clone(), Duration::from_millis(10));

        assert!(matches!(worker.process_next().await.unwrap(), Tick::Completed(_)));
        assert_eq!(worker.process_next().await.unwrap(), Tick::Idle);
        assert_eq!(harness.strategy.submissions(), 1);

        let record = only_record(&harness).await;
        assert_eq!(record.status, RebalanceStatus::Completed);
        assert_eq!(record.tx_hash, Some(MockWallet::tx_hash(1)));
    }

    #[tokio::test]
    async fn interrupted_submission_resumes_from_the_ledger_hash() {
        let harness = harness(MockStrategy::new(StrategyName::Mock), MockWallet::new()).await;
        check_now(&harness, 1).await;

        let correlation_id = interrupt_submission(&harness).await;
        let tx_hash = MockWallet::tx_hash(9);
        harness
            .orchestrator
            .ledger
            .mark_submitted(correlation_id, tx_hash)
            .await
            .unwrap();

        assert!(matches!(harness.worker.process_next().await.unwrap(), Tick::Completed(_)));

        assert_eq!(harness.strategy.submissions(), 0);
        assert_eq!(harness.wallet.receipt_lookups(), 1);
        let record = only_record(&harness).await;
        assert_eq!(record.status, RebalanceStatus::Completed);
        assert_eq!(record.tx_hash, Some(tx_hash));
    }

    #[traced_test]
    #[tokio::test]
    async fn interrupted_submission_without_a_hash_fails_instead_of_resubmitting() {
        let harness = harness(MockStrategy::new(StrategyName::Mock), MockWallet::new()).await;
        check_now(&harness, 1).await;

        let correlation_id = interrupt_submission(&harness).await;

        assert!(matches!(harness.worker.process_next().await.unwrap(), Tick::Failed(_)));

        assert_eq!(harness.strategy.submissions(), 0);
        assert_eq!(harness.wallet.receipt_lookups(), 0);
        let record = only_record(&harness).await;
        assert_eq!(record.correlation_id, correlation_id);
        assert_eq!(record.status, RebalanceStatus::Failed);
        assert!(logs_contain("reconcile the wallet manually"));
    }

    #[tokio::test]
    async fn failed_submission_clears_the_marker_and_is_retried() {
        let harness = harness(
            MockStrategy::new(StrategyName::Mock).failing_submissions(1),
            MockWallet::new(),
        )
        .await;
        check_now(&harness, 1).await;

        assert!(matches!(harness.worker.process_next().await.unwrap(), Tick::Retrying(_)));

        let record = only_record(&harness).await;
        let jobs = harness
            .orchestrator
            .execution_status(record.correlation_id)
            .await
            .unwrap()
            .jobs;
        assert!(matches!(
            &jobs[0].payload,
            JobPayload::ExecuteRebalance(execute) if !execute.submitting && execute.tx_hash.is_none()
        ));

        harness.queue.release_delayed().await;
        assert!(matches!(harness.worker.process_next().await.unwrap(), Tick::Completed(_)));
        assert_eq!(harness.strategy.submissions(), 1);
        assert_eq!(only_record(&harness).await.status, RebalanceStatus::Completed);
    }

    #[tokio::test]
    async fn pending_row_without_a_job_is_started_by_the_next_check() {
        let harness = harness(MockStrategy::new(StrategyName::Mock), MockWallet::new()).await;

        // a check that died between recording and starting its execution
        let orphan = crate::strategy::mock::quote_for(
            USDC_BASE,
            USDT_BASE,
            U256::from(400_000_000u64),
            U256::from(400_000_000u64),
        );
        harness
            .orchestrator
            .ledger
            .record(WALLET, &[orphan.clone()])
            .await
            .unwrap();

        check_now(&harness, 1).await;

        // the orphan's reservation covers the deficit, so nothing new is planned
        assert_eq!(harness.strategy.quotes(), 0);
        let status = harness
            .orchestrator
            .execution_status(orphan.correlation_id)
            .await
            .unwrap();
        assert_eq!(status.jobs.len(), 1);

        assert!(matches!(harness.worker.process_next().await.unwrap(), Tick::Completed(_)));
        assert_eq!(harness.strategy.submissions(), 1);

        let record = only_record(&harness).await;
        assert_eq!(record.correlation_id, orphan.correlation_id);
        assert_eq!(record.status, RebalanceStatus::Completed);

        check_now(&harness, 2).await;
        assert_eq!(
            harness
                .orchestrator
                .execution_status(orphan.correlation_id)
                .await
                .unwrap()
                .jobs
                .len(),
            1
        );
    }
}
