use std::sync::atomic::Ordering;
use std::time::Duration;

use alloy::primitives::U256;
use chrono::Utc;
use httpmock::prelude::*;
use serde_json::json;
use tracing_test::traced_test;

use super::*;
use crate::conductor::{Enqueued, JobPayload, JobStarter, JobStatus};
use crate::ledger::RebalanceStatus;
use crate::lifi::tests::LIFI_DIAMOND;
use crate::orchestrator::{ExecuteRebalance, schedule_check};
use crate::test_utils::{MESSAGE_TRANSMITTER, USDC_ARBITRUM, USDC_BASE, USDT_ARBITRUM};

#[tokio::test]
async fn usdc_is_burned_attested_and_minted_on_the_deficit_chain() {
    let server = MockServer::start();
    let fees = fast_fee_mock(&server);
    let mut pending = server.mock(|when, then| {
        when.method(GET).path("/v2/messages/6");
        then.status(200).json_body(json!({
            "messages": [{"status": "pending_confirmations"}]
        }));
    });
    let system = system(
        &server,
        vec![holding(USDC_BASE, 1500), holding(USDC_ARBITRUM, 500)],
        vec![target(USDC_BASE, 1000), target(USDC_ARBITRUM, 1000)],
    )
    .await;

    system.check_balances(1).await;
    system.step().await;
    let record = system.only_rebalance().await;
    assert_eq!(record.status, RebalanceStatus::Pending);
    assert_eq!(record.strategy, "CCTP");
    fees.assert_hits(1);

    // burn on Base
    system.step().await;
    assert_eq!(system.only_rebalance().await.status, RebalanceStatus::Submitted);

    // first poll: still pending
    system.step().await;
    pending.assert_hits(1);
    pending.delete();

    let complete = complete_attestation_mock(&server);
    system.step().await;
    complete.assert_hits(1);

    // mint on Arbitrum
    system.step().await;
    assert_eq!(system.step().await, Tick::Idle);

    let record = system.only_rebalance().await;
    assert_eq!(record.status, RebalanceStatus::Completed);
    assert_eq!(record.amount_in, U256::from(400_000_000u64));
    assert_eq!(record.amount_out, U256::from(399_960_000u64));
    assert_eq!(record.tx_hash, Some(MockWallet::tx_hash(1)));

    let executed = system.wallet.executed();
    assert_eq!(executed.len(), 2);
    assert_eq!(executed[0].chain_id, USDC_BASE.chain_id);
    assert_eq!(executed[0].calls.len(), 2);
    assert_eq!(executed[1].chain_id, USDC_ARBITRUM.chain_id);
    assert_eq!(executed[1].calls[0].to, MESSAGE_TRANSMITTER);

    let jobs = system.jobs(record.correlation_id).await;
    assert_eq!(
        kinds(&jobs),
        vec!["ExecuteRebalance", "CheckAttestation", "CheckAttestation", "ExecuteMint"]
    );
    assert!(jobs.iter().all(|job| job.status == JobStatus::Completed), "{jobs:?}");
}

#[tokio::test]
async fn bridged_usdc_is_swapped_into_the_deficit_token() {
    let server = MockServer::start();
    fast_fee_mock(&server);
    complete_attestation_mock(&server);
    let system = system(
        &server,
        vec![holding(USDC_BASE, 1500), holding(USDT_ARBITRUM, 500)],
        vec![target(USDC_BASE, 1000), target(USDT_ARBITRUM, 1000)],
    )
    .await;

    system.check_balances(1).await;
    system.drain().await;

    let record = system.only_rebalance().await;
    assert_eq!(record.strategy, "CCTPLiFi");
    assert_eq!(record.status, RebalanceStatus::Completed);
    // 1 bps bridge fee, then 10 bps swap fee on what was minted
    assert_eq!(record.amount_out, U256::from(399_560_040u64));

    let executed = system.wallet.executed();
    assert_eq!(executed.len(), 3);
    assert_eq!(executed[0].chain_id, USDC_BASE.chain_id);
    assert_eq!(executed[1].calls[0].to, MESSAGE_TRANSMITTER);
    assert_eq!(executed[2].chain_id, USDT_ARBITRUM.chain_id);
    assert_eq!(executed[2].calls[1].to, LIFI_DIAMOND);

    // quoted once while planning, never requoted
    assert_eq!(system.lifi.calls.load(Ordering::SeqCst), 1);

    let jobs = system.jobs(record.correlation_id).await;
    assert_eq!(
        kinds(&jobs),
        vec!["ExecuteRebalance", "CheckAttestation", "ExecuteMint", "DestinationSwap"]
    );

    let JobPayload::DestinationSwap(swap) = &jobs[3].payload else {
        panic!("expected destination swap, got {:?}", jobs[3].payload);
    };
    assert_eq!(swap.mint_tx, Some(MockWallet::tx_hash(2)));
    assert_eq!(swap.swap_tx, Some(MockWallet::tx_hash(3)));
}

#[tokio::test]
async fn duplicate_starts_run_the_workflow_once() {
    let server = MockServer::start();
    fast_fee_mock(&server);
    complete_attestation_mock(&server);
    let system = system(
        &server,
        vec![holding(USDC_BASE, 1500), holding(USDC_ARBITRUM, 500)],
        vec![target(USDC_BASE, 1000), target(USDC_ARBITRUM, 1000)],
    )
    .await;

    let interval = Duration::from_secs(300);
    let now = Utc::now();
    schedule_check(system.queue.as_ref(), WALLET, interval, now)
        .await
        .unwrap();
    let second = schedule_check(system.queue.as_ref(), WALLET, interval, now)
        .await
        .unwrap();
    assert_eq!(second, Enqueued::Duplicate);

    // balance check, then the execution it started
    system.step().await;
    let record = system.only_rebalance().await;
    let jobs = system.jobs(record.correlation_id).await;
    let JobPayload::ExecuteRebalance(execute) = &jobs[0].payload else {
        panic!("expected execution, got {:?}", jobs[0].payload);
    };

    let restarted = system
        .queue
        .start(
            ExecuteRebalance {
                tx_hash: None,
                ..execute.clone()
            }
            .into(),
            Duration::ZERO,
        )
        .await
        .unwrap();
    assert_eq!(restarted, Enqueued::Duplicate);

    system.drain().await;

    assert_eq!(system.only_rebalance().await.status, RebalanceStatus::Completed);
    assert_eq!(system.wallet.executions(), 2);
    assert_eq!(system.jobs(record.correlation_id).await.len(), 3);
}

#[traced_test]
#[tokio::test]
async fn failed_attestation_fails_the_rebalance_without_minting() {
    let server = MockServer::start();
    fast_fee_mock(&server);
    server.mock(|when, then| {
        when.method(GET).path("/v2/messages/6");
        then.status(200).json_body(json!({
            "messages": [{"status": "failed"}]
        }));
    });
    let system = system(
        &server,
        vec![holding(USDC_BASE, 1500), holding(USDC_ARBITRUM, 500)],
        vec![target(USDC_BASE, 1000), target(USDC_ARBITRUM, 1000)],
    )
    .await;

    system.check_balances(1).await;
    system.drain().await;

    let record = system.only_rebalance().await;
    assert_eq!(record.status, RebalanceStatus::Failed);
    assert!(record.error.is_some());
    assert_eq!(system.wallet.executions(), 1);
    assert!(logs_contain("burned USDC needs manual recovery"));

    let jobs = system.jobs(record.correlation_id).await;
    assert_eq!(kinds(&jobs), vec!["ExecuteRebalance", "CheckAttestation"]);
    assert_eq!(jobs[1].status, JobStatus::Failed);
}
