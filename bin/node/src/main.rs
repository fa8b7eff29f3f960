//! Sybil rollup node
//!
//! Follows the rollup contract with the synchronizer and forges batches
//! with the coordinator. Without `SYBIL_RPC_URL` it runs against an
//! in-memory chain that mines a block every few seconds.
//!
//! HTTP endpoints:
//! - `GET /health`
//! - `GET /stats`: synchronization progress and pool size

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use sybil_coordinator::{
    Coordinator, CoordinatorConfig, CoordinatorHandle, CoordinatorMsg, L2Db, MockProver,
    ProofServerClient, ProverClient,
};
use sybil_core::{RollupConstants, RollupEventInitialize, RollupVerifierStruct};
use sybil_db::{StateDb, StateDbConfig};
use sybil_synchronizer::{
    EthClient, MemoryHistoryDb, RpcConfig, RpcEthClient, Stats, StatsHolder, SyncOutcome,
    Synchronizer, SynchronizerConfig, TestEthClient,
};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Node configuration
#[derive(Clone, Debug)]
struct NodeConfig {
    /// JSON-RPC endpoint of L1, in-memory chain when unset
    rpc_url: Option<String>,
    http_addr: SocketAddr,
    /// Where the coordinator keeps its copies of the state
    coordinator_db_path: PathBuf,
    sync_interval: Duration,
    /// Block time of the in-memory chain
    dev_block_time: Duration,
    /// Proof servers, a mock prover when empty
    prover_urls: Vec<String>,
    prover_poll_interval: Duration,
    state: StateDbConfig,
    sync: SynchronizerConfig,
    coordinator: CoordinatorConfig,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

impl NodeConfig {
    fn from_env() -> Self {
        Self {
            rpc_url: env::var("SYBIL_RPC_URL").ok().filter(|s| !s.is_empty()),
            http_addr: env_or("SYBIL_HTTP_ADDR", SocketAddr::from(([0, 0, 0, 0], 8546))),
            coordinator_db_path: env_or(
                "SYBIL_COORDINATOR_DB_PATH",
                PathBuf::from("./data/coordinator"),
            ),
            sync_interval: Duration::from_millis(env_or("SYBIL_SYNC_INTERVAL_MS", 1_000)),
            dev_block_time: Duration::from_millis(env_or("SYBIL_DEV_BLOCK_TIME_MS", 2_000)),
            prover_urls: env::var("SYBIL_PROVER_URLS")
                .map(|s| {
                    s.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default(),
            prover_poll_interval: Duration::from_millis(env_or(
                "SYBIL_PROVER_POLL_INTERVAL_MS",
                500,
            )),
            state: StateDbConfig::from_env(),
            sync: SynchronizerConfig::from_env(),
            coordinator: CoordinatorConfig::from_env(),
        }
    }
}

/// In-memory chain whose only verifier matches the processor config
fn dev_client(cfg: &NodeConfig) -> Arc<TestEthClient> {
    let tp = &cfg.coordinator.tx_processor;
    let constants = RollupConstants {
        absolute_max_l1_l2_batch_timeout: 240,
        verifiers: vec![RollupVerifierStruct {
            max_tx: tp.max_tx as u64,
            n_levels: tp.n_levels as u64,
        }],
        ..Default::default()
    };
    Arc::new(TestEthClient::new(
        constants,
        RollupEventInitialize { forge_l1_l2_batch_timeout: 10 },
        u64::from(cfg.sync.chain_id),
        cfg.coordinator.forger_address,
    ))
}

#[derive(Clone)]
struct ApiState {
    stats: Arc<StatsHolder>,
    l2db: Arc<L2Db>,
}

#[derive(Serialize)]
struct StatsResponse {
    stats: Stats,
    blocks_perc: f64,
    batches_perc: f64,
    pool_txs: usize,
}

async fn health() -> &'static str {
    "ok"
}

async fn stats(State(state): State<ApiState>) -> Json<StatsResponse> {
    Json(StatsResponse {
        stats: state.stats.copy_stats(),
        blocks_perc: state.stats.blocks_perc(),
        batches_perc: state.stats.batches_perc(),
        pool_txs: state.l2db.len(),
    })
}

/// Synchronize blocks and report each one to the coordinator
async fn sync_loop(
    mut sync: Synchronizer,
    coord: CoordinatorHandle,
    interval: Duration,
    mut cancel: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    loop {
        if *cancel.borrow() {
            break;
        }
        let wait = match sync.sync(None).await {
            Ok(SyncOutcome::Block(data)) => {
                let msg = CoordinatorMsg::SyncBlock {
                    stats: sync.copy_stats(),
                    batches: data.rollup.batches,
                    vars: data.rollup.vars,
                };
                coord.send(msg).await.context("coordinator gone")?;
                false
            }
            Ok(SyncOutcome::Reorg(discarded)) => {
                warn!("sync: reorg discarded {discarded} blocks");
                let msg = CoordinatorMsg::SyncReorg {
                    stats: sync.copy_stats(),
                    vars: Some(sync.sc_vars().clone()),
                };
                coord.send(msg).await.context("coordinator gone")?;
                false
            }
            Ok(SyncOutcome::Idle) => true,
            Err(e) => {
                error!("sync: {e}");
                true
            }
        };
        if wait {
            tokio::select! {
                _ = cancel.changed() => break,
                () = tokio::time::sleep(interval) => {}
            }
        }
    }
    info!("sync loop done");
    Ok(())
}

/// Mine a block every `block_time` on the in-memory chain
async fn dev_miner(
    client: Arc<TestEthClient>,
    block_time: Duration,
    mut cancel: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(block_time);
    loop {
        tokio::select! {
            _ = cancel.changed() => return,
            _ = ticker.tick() => {
                let block = client.mine_block();
                info!("dev chain: mined block {}", block.num);
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("setting default subscriber failed")?;

    let cfg = NodeConfig::from_env();
    info!("Starting Sybil rollup node...");
    info!("  State: {}", cfg.state.kvdb.path.display());
    info!("  Forger: {}", cfg.coordinator.forger_address);

    let (cancel_tx, cancel) = watch::channel(false);
    let mut tasks = Vec::new();

    let client: Arc<dyn EthClient> = match &cfg.rpc_url {
        Some(url) => {
            info!("  L1: {url}");
            Arc::new(RpcEthClient::new(RpcConfig { url: url.clone(), ..RpcConfig::from_env() }))
        }
        None => {
            info!("  L1: in-memory dev chain");
            let dev = dev_client(&cfg);
            tasks.push(tokio::spawn({
                let (dev, block_time, cancel) =
                    (Arc::clone(&dev), cfg.dev_block_time, cancel.clone());
                async move {
                    dev_miner(dev, block_time, cancel).await;
                    anyhow::Ok(())
                }
            }));
            dev
        }
    };

    let state = StateDb::new(cfg.state.clone()).context("opening the synchronizer state")?;
    let history = Arc::new(MemoryHistoryDb::new());
    let sync = Synchronizer::new(Arc::clone(&client), history, state, cfg.sync.clone())
        .await
        .context("starting the synchronizer")?;

    let provers: Vec<Arc<dyn ProverClient>> = if cfg.prover_urls.is_empty() {
        warn!("no proof server configured, using a mock prover");
        vec![Arc::new(MockProver::default())]
    } else {
        cfg.prover_urls
            .iter()
            .map(|url| {
                Arc::new(ProofServerClient::new(url.clone(), cfg.prover_poll_interval))
                    as Arc<dyn ProverClient>
            })
            .collect()
    };

    let l2db = Arc::new(L2Db::new());
    let mut coord_state = cfg.state.clone();
    coord_state.kvdb.path.clone_from(&cfg.coordinator_db_path);
    let (coordinator, handle) = Coordinator::new(
        cfg.coordinator.clone(),
        client,
        &sync,
        &coord_state,
        Arc::clone(&l2db),
        provers,
    )
    .await
    .context("starting the coordinator")?;

    let api = ApiState { stats: sync.stats(), l2db };
    tasks.push(tokio::spawn(coordinator.run(cancel.clone())));
    tasks.push(tokio::spawn(sync_loop(sync, handle, cfg.sync_interval, cancel.clone())));

    let app = Router::new()
        .route("/health", get(health))
        .route("/stats", get(stats))
        .with_state(api);
    let listener = tokio::net::TcpListener::bind(cfg.http_addr)
        .await
        .context("binding the HTTP listener")?;
    info!("HTTP server listening on {}", cfg.http_addr);
    let server = {
        let mut cancel = cancel.clone();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = cancel.changed().await;
                })
                .await
                .context("HTTP server")
        })
    };
    tasks.push(server);

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutting down");
    cancel_tx.send(true).context("broadcasting shutdown")?;
    for task in tasks {
        if let Err(e) = task.await? {
            error!("task failed: {e:#}");
        }
    }
    Ok(())
}
