//! Full workflows through the job queue: balance check, execution, bridge
//! attestation, mint and destination swap, with Circle behind httpmock and
//! the chain behind mock wallets and balance readers.

use std::sync::Arc;
use std::time::Duration;

use httpmock::prelude::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::json;
use uuid::Uuid;

use st0x_bridge::cctp::CircleClient;
use st0x_fixed_point::{Band, parse_units};

use crate::attestation::CheckAttestationHandler;
use crate::attestation::mint::ExecuteMintHandler;
use crate::balance::mock::MockBalanceReader;
use crate::cctp::CctpStrategy;
use crate::cctp_lifi::CctpLiFiStrategy;
use crate::conductor::worker::Tick;
use crate::conductor::{JobRecord, JobRegistry, JobStarter, SqliteJobQueue, Worker};
use crate::destination_swap::DestinationSwapHandler;
use crate::ledger::{RebalanceLedger, RebalanceRecord};
use crate::lifi::LiFiStrategy;
use crate::lifi::tests::{MockLiFi, lifi_cache};
use crate::orchestrator::{CheckBalances, CheckBalancesHandler, ExecuteRebalanceHandler, Orchestrator};
use crate::rebalancing::Router;
use crate::strategy::{RebalanceStrategy, StrategyRegistry};
use crate::test_utils::{WALLET, cctp_config, setup_test_db};
use crate::token::{Token, TokenBalance, TokenConfig};
use crate::wallet::mock::MockWallet;

mod cctp;

const BAND: Band = Band {
    up: dec!(0.1),
    down: dec!(0.1),
};

struct System {
    orchestrator: Orchestrator,
    worker: Worker,
    queue: Arc<SqliteJobQueue>,
    wallet: Arc<MockWallet>,
    lifi: Arc<MockLiFi>,
}

fn holding(token: Token, whole: u64) -> TokenBalance {
    TokenBalance {
        token,
        raw_amount: parse_units(Decimal::from(whole), token.decimals).unwrap(),
    }
}

fn target(token: Token, whole: u64) -> TokenConfig {
    TokenConfig {
        token,
        target_balance: Decimal::from(whole),
        min_balance: None,
        band: None,
    }
}

/// Every strategy and handler `launch` registers, wired to mocks and the
/// given Circle server.
async fn system(server: &MockServer, holdings: Vec<TokenBalance>, targets: Vec<TokenConfig>) -> System {
    let pool = setup_test_db().await;
    let queue = Arc::new(SqliteJobQueue::new(pool.clone()));
    let ledger = RebalanceLedger::new(pool);
    let wallet = Arc::new(MockWallet::new());
    let lifi = Arc::new(MockLiFi::new(10));
    let cache = lifi_cache().await;
    let config = cctp_config(&server.base_url());
    let circle = Arc::new(CircleClient::new(&server.base_url()).unwrap());

    let cctp = Arc::new(CctpStrategy::new(
        circle.clone(),
        config.clone(),
        wallet.clone(),
        queue.clone(),
    ));
    let strategies: Vec<Arc<dyn RebalanceStrategy>> = vec![
        cctp.clone(),
        Arc::new(LiFiStrategy::new(
            lifi.clone(),
            cache.clone(),
            wallet.clone(),
            dec!(0.005),
        )),
        Arc::new(CctpLiFiStrategy::new(cctp, lifi.clone(), cache, dec!(0.005))),
    ];
    let strategies = Arc::new(StrategyRegistry::new(strategies, 100));

    let registry = JobRegistry::new()
        .with(Arc::new(CheckBalancesHandler::new(
            Arc::new(MockBalanceReader::new(holdings)),
            ledger.clone(),
            Router::new(strategies.clone(), None),
            targets,
            BAND,
        )))
        .with(Arc::new(ExecuteRebalanceHandler::new(
            strategies,
            wallet.clone(),
            ledger.clone(),
        )))
        .with(Arc::new(CheckAttestationHandler::new(
            circle,
            config.poll_intervals(),
            ledger.clone(),
        )))
        .with(Arc::new(ExecuteMintHandler::new(
            wallet.clone(),
            config,
            ledger.clone(),
        )))
        .with(Arc::new(DestinationSwapHandler::new(
            wallet.clone(),
            lifi.clone(),
            ledger.clone(),
            dec!(0.005),
        )));

    let orchestrator = Orchestrator::new(queue.clone(), ledger, registry, WALLET);
    let worker = orchestrator.worker(Duration::from_millis(10));

    System {
        orchestrator,
        worker,
        queue,
        wallet,
        lifi,
    }
}

impl System {
    async fn check_balances(&self, bucket: u64) {
        self.queue
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

    /// Runs one due job, releasing delayed ones first.
    async fn step(&self) -> Tick {
        self.queue.release_delayed().await;
        self.worker.process_next().await.unwrap()
    }

    /// Runs jobs until the queue is empty.
    async fn drain(&self) -> usize {
        let mut processed = 0;

        while self.step().await != Tick::Idle {
            processed += 1;
            assert!(processed < 50, "queue never drained");
        }

        processed
    }

    async fn only_rebalance(&self) -> RebalanceRecord {
        let mut rebalances = self.orchestrator.rebalances_for_wallet(WALLET).await.unwrap();
        assert_eq!(rebalances.len(), 1, "{rebalances:?}");
        rebalances.remove(0)
    }

    async fn jobs(&self, correlation_id: Uuid) -> Vec<JobRecord> {
        self.orchestrator
            .execution_status(correlation_id)
            .await
            .unwrap()
            .jobs
    }
}

fn fast_fee_mock(server: &MockServer) -> httpmock::Mock<'_> {
    server.mock(|when, then| {
        when.method(GET).path("/v2/burn/USDC/fees/6/3");
        then.status(200)
            .json_body(json!([{"finalityThreshold": 1000, "minimumFee": 1}]));
    })
}

fn attested_message() -> Vec<u8> {
    [0u8; 12].into_iter().chain([7u8; 32]).chain([0xEE; 16]).collect()
}

fn complete_attestation_mock(server: &MockServer) -> httpmock::Mock<'_> {
    server.mock(|when, then| {
        when.method(GET).path("/v2/messages/6");
        then.status(200).json_body(json!({
            "messages": [{
                "status": "complete",
                "message": alloy::hex::encode_prefixed(attested_message()),
                "attestation": "0xabcdef"
            }]
        }));
    })
}

fn kinds(jobs: &[JobRecord]) -> Vec<&'static str> {
    jobs.iter().map(|job| job.payload.kind().as_str()).collect()
}
