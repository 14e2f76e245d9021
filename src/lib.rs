use std::sync::Arc;

use tokio::task::{AbortHandle, JoinHandle};
use tracing::{error, info, info_span, warn};

use st0x_bridge::cctp::CircleClient;

use crate::asset_cache::AssetSupportCache;
use crate::attestation::CheckAttestationHandler;
use crate::attestation::mint::ExecuteMintHandler;
use crate::balance::RpcBalanceReader;
use crate::cctp::CctpStrategy;
use crate::cctp_lifi::CctpLiFiStrategy;
use crate::conductor::{JobRegistry, SqliteJobQueue};
use crate::config::Ctx;
use crate::destination_swap::DestinationSwapHandler;
use crate::ledger::{RebalanceLedger, RebalanceStatus};
use crate::lifi::{LiFiClient, LiFiStrategy};
use crate::orchestrator::{CheckBalancesHandler, ExecuteRebalanceHandler, Orchestrator};
use crate::rebalancing::Router;
use crate::strategy::{RebalanceStrategy, StrategyRegistry};
use crate::wallet::rpc::RpcWallet;
use crate::wallet::{ReadOnlyWallet, Wallet};

mod asset_cache;
mod attestation;
mod balance;
mod bindings;
mod cctp;
mod cctp_lifi;
mod conductor;
pub mod config;
mod destination_swap;
mod ledger;
mod lifi;
mod orchestrator;
mod rebalancing;
mod strategy;
mod token;
mod wallet;
mod wire;

#[cfg(test)]
mod integration_tests;
#[cfg(test)]
pub(crate) mod test_utils;

pub async fn launch(ctx: Ctx) -> anyhow::Result<()> {
    let launch_span = info_span!("launch", wallet = %ctx.wallet);
    let _enter = launch_span.enter();

    let pool = ctx.get_sqlite_pool().await?;
    sqlx::migrate!().run(&pool).await?;

    let queue = Arc::new(SqliteJobQueue::new(pool.clone()));
    let recovered = queue.recover_stalled().await?;
    if recovered > 0 {
        warn!(recovered, "Requeued jobs left running by a previous process");
    }

    let ledger = RebalanceLedger::new(pool);

    let quote_only = ctx.signer.is_none();
    let wallet: Arc<dyn Wallet> = match ctx.signer.clone() {
        Some(signer) => Arc::new(RpcWallet::new(signer, ctx.rpc_urls())),
        None => {
            warn!("No evm_private_key configured, running in quote-only mode");
            Arc::new(ReadOnlyWallet::new(ctx.wallet))
        }
    };

    let balances = Arc::new(RpcBalanceReader::new(
        ctx.tokens.iter().map(|config| config.token).collect(),
        ctx.rpc_urls(),
    ));

    let mut strategies: Vec<Arc<dyn RebalanceStrategy>> = Vec::new();
    let mut registry = JobRegistry::new();
    let mut caches = Vec::new();

    let cctp = match &ctx.cctp {
        Some(config) => {
            let circle = Arc::new(CircleClient::new(&config.api_url)?);
            let cctp = Arc::new(CctpStrategy::new(
                circle.clone(),
                config.clone(),
                wallet.clone(),
                queue.clone(),
            ));

            registry = registry
                .with(Arc::new(CheckAttestationHandler::new(
                    circle,
                    config.poll_intervals(),
                    ledger.clone(),
                )))
                .with(Arc::new(ExecuteMintHandler::new(
                    wallet.clone(),
                    config.clone(),
                    ledger.clone(),
                )));

            strategies.push(cctp.clone());
            info!(chains = config.chains.len(), "CCTP strategy enabled");
            Some(cctp)
        }
        None => None,
    };

    if let Some(config) = &ctx.lifi {
        let client = Arc::new(LiFiClient::new(
            &config.api_url,
            &config.integrator,
            ctx.lifi_api_key.as_deref(),
        )?);

        let cache = Arc::new(AssetSupportCache::new(client.clone(), config.cache.clone()));
        cache.initialize().await;
        cache.spawn_refresh();

        let status = cache.status().await;
        info!(
            initialized = status.initialized,
            valid = status.valid,
            chains = status.total_chains,
            tokens = status.total_tokens,
            last_updated = ?status.last_updated,
            next_refresh = ?status.next_refresh,
            age = ?status.age,
            "LiFi asset cache ready"
        );
        caches.push(cache.clone());

        strategies.push(Arc::new(LiFiStrategy::new(
            client.clone(),
            cache.clone(),
            wallet.clone(),
            config.max_slippage,
        )));

        if let Some(cctp) = &cctp {
            strategies.push(Arc::new(CctpLiFiStrategy::new(
                cctp.clone(),
                client.clone(),
                cache,
                config.max_slippage,
            )));
        }

        registry = registry.with(Arc::new(DestinationSwapHandler::new(
            wallet.clone(),
            client,
            ledger.clone(),
            config.max_slippage,
        )));

        info!(integrator = %config.integrator, "LiFi strategy enabled");
    }

    if strategies.is_empty() {
        warn!("No rebalancing strategies configured, balance checks will only log analysis");
    }

    let strategies = Arc::new(StrategyRegistry::new(strategies, ctx.max_quote_slippage_bps));
    info!(strategies = ?strategies.names(), "Registered strategies");

    let check_balances = CheckBalancesHandler::new(
        balances,
        ledger.clone(),
        Router::new(strategies.clone(), ctx.min_trade),
        ctx.tokens.clone(),
        ctx.band,
    );
    let check_balances = if quote_only {
        check_balances.quote_only()
    } else {
        check_balances
    };

    let registry = registry
        .with(Arc::new(check_balances))
        .with(Arc::new(ExecuteRebalanceHandler::new(
            strategies,
            wallet,
            ledger.clone(),
        )));

    let orchestrator = Orchestrator::new(queue, ledger, registry, ctx.wallet);
    log_unfinished_rebalances(&orchestrator, &ctx).await;

    let workers = orchestrator.spawn_workers(ctx.workers, ctx.worker_idle_poll);
    let scheduler = orchestrator.spawn_scheduler(ctx.check_balances_interval);

    await_shutdown(scheduler, workers).await;

    for cache in caches {
        cache.stop();
    }

    info!("Shutdown complete");
    Ok(())
}

async fn log_unfinished_rebalances(orchestrator: &Orchestrator, ctx: &Ctx) {
    let rebalances = match orchestrator.rebalances_for_wallet(ctx.wallet).await {
        Ok(rebalances) => rebalances,
        Err(error) => {
            error!(%error, "Failed to load rebalance history");
            return;
        }
    };

    let unfinished = rebalances.iter().filter(|record| {
        matches!(
            record.status,
            RebalanceStatus::Pending | RebalanceStatus::Submitted
        )
    });

    for record in unfinished {
        match orchestrator.execution_status(record.correlation_id).await {
            Ok(status) => info!(
                correlation_id = %record.correlation_id,
                status = %record.status,
                strategy = %record.strategy,
                jobs = status.jobs.len(),
                live_jobs = status.jobs.iter().filter(|job| !job.status.is_terminal()).count(),
                "Resuming unfinished rebalance"
            ),
            Err(error) => warn!(
                correlation_id = %record.correlation_id,
                %error,
                "Failed to load execution status"
            ),
        }
    }
}

async fn await_shutdown(scheduler: JoinHandle<()>, workers: Vec<JoinHandle<()>>) {
    let scheduler_abort = scheduler.abort_handle();
    let worker_aborts: Vec<AbortHandle> = workers.iter().map(JoinHandle::abort_handle).collect();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal, shutting down gracefully...");
        }
        result = scheduler => {
            if let Err(error) = result {
                error!("Scheduler task panicked: {error}");
            }
        }
    }

    abort_task("scheduler", &scheduler_abort);
    for handle in &worker_aborts {
        abort_task("worker", handle);
    }
}

fn abort_task(name: &str, handle: &AbortHandle) {
    info!("Aborting {name} task");
    handle.abort();
}
