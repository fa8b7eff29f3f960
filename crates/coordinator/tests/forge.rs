use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::U256;
use async_trait::async_trait;
use sybil_core::{
    AccountIdx, BatchNum, EthAddr, L1Tx, Nonce, PoolL2Tx, PoolL2TxState, RollupConstants,
    RollupEventInitialize, RollupVerifierStruct, VouchIdx, ZKInputs,
};
use sybil_coordinator::{
    CoordError, Coordinator, CoordinatorConfig, CoordinatorHandle, CoordinatorMsg, L2Db, MockProver,
    Proof, ProverClient,
};
use sybil_db::{KvdbConfig, StateDb, StateDbConfig, StateDbMode};
use sybil_synchronizer::{
    HistoryStore, MemoryHistoryDb, SyncOutcome, Synchronizer, SynchronizerConfig, TestEthClient,
};
use sybil_txprocessor::TxProcessorConfig;
use tempfile::TempDir;
use tokio::sync::watch;

fn forger() -> EthAddr {
    EthAddr::repeat_byte(0xf0)
}

fn client() -> Arc<TestEthClient> {
    let constants = RollupConstants {
        absolute_max_l1_l2_batch_timeout: 240,
        verifiers: vec![RollupVerifierStruct { max_tx: 16, n_levels: 24 }],
        ..Default::default()
    };
    Arc::new(TestEthClient::new(
        constants,
        RollupEventInitialize { forge_l1_l2_batch_timeout: 10 },
        5,
        forger(),
    ))
}

fn state_cfg(dir: &TempDir) -> StateDbConfig {
    StateDbConfig {
        kvdb: KvdbConfig { path: dir.path().to_path_buf(), keep: 0, ..KvdbConfig::default() },
        mode: StateDbMode::Synchronizer,
        n_levels: 24,
    }
}

fn coordinator_cfg() -> CoordinatorConfig {
    CoordinatorConfig {
        forger_address: forger(),
        confirm_blocks: 1,
        forge_retry_interval_ms: 10,
        forge_delay_ms: 0,
        forge_no_txs_delay_ms: 60_000,
        tx_manager_check_interval_ms: 10,
        tx_processor: TxProcessorConfig { chain_id: 5, ..Default::default() },
        ..Default::default()
    }
}

fn deposit(addr: u8) -> L1Tx {
    L1Tx {
        from_eth_addr: EthAddr::repeat_byte(addr),
        from_bjj: [addr; 32],
        deposit_amount: U256::from(1000u64),
        ..Default::default()
    }
}

/// Fails its first proof
#[derive(Debug, Default)]
struct FlakyProver {
    failed: AtomicBool,
    inner: MockProver,
}

#[async_trait]
impl ProverClient for FlakyProver {
    async fn calculate_proof(&self, zk_inputs: &ZKInputs) -> sybil_coordinator::Result<()> {
        self.inner.calculate_proof(zk_inputs).await
    }

    async fn get_proof(&self) -> sybil_coordinator::Result<(Proof, Vec<U256>)> {
        if !self.failed.swap(true, Ordering::SeqCst) {
            self.inner.cancel().await?;
            return Err(CoordError::Prover("out of memory".to_string()));
        }
        self.inner.get_proof().await
    }

    async fn cancel(&self) -> sybil_coordinator::Result<()> {
        self.inner.cancel().await
    }

    async fn wait_ready(&self) -> sybil_coordinator::Result<()> {
        Ok(())
    }
}

struct Node {
    client: Arc<TestEthClient>,
    history: Arc<MemoryHistoryDb>,
    sync: Synchronizer,
    l2db: Arc<L2Db>,
    handle: CoordinatorHandle,
    cancel: watch::Sender<bool>,
    task: tokio::task::JoinHandle<anyhow::Result<()>>,
    _dirs: (TempDir, TempDir),
}

impl Node {
    async fn start(client: Arc<TestEthClient>, prover: Arc<dyn ProverClient>) -> Self {
        let sync_dir = tempfile::tempdir().unwrap();
        let coord_dir = tempfile::tempdir().unwrap();
        let history = Arc::new(MemoryHistoryDb::new());
        let state = StateDb::new(state_cfg(&sync_dir)).unwrap();
        let config = SynchronizerConfig { chain_id: 5, ..SynchronizerConfig::default() };
        let sync = Synchronizer::new(client.clone(), history.clone(), state, config).await.unwrap();

        let l2db = Arc::new(L2Db::new());
        let (coord, handle) = Coordinator::new(
            coordinator_cfg(),
            client.clone(),
            &sync,
            &state_cfg(&coord_dir),
            l2db.clone(),
            vec![prover],
        )
        .await
        .unwrap();
        let (cancel, cancel_rx) = watch::channel(false);
        let task = tokio::spawn(coord.run(cancel_rx));
        Self { client, history, sync, l2db, handle, cancel, task, _dirs: (sync_dir, coord_dir) }
    }

    /// Sync every mined block and report each one to the coordinator
    async fn sync_all(&mut self) {
        loop {
            match self.sync.sync(None).await.unwrap() {
                SyncOutcome::Block(data) => {
                    let msg = CoordinatorMsg::SyncBlock {
                        stats: self.sync.copy_stats(),
                        batches: data.rollup.batches,
                        vars: data.rollup.vars,
                    };
                    self.handle.send(msg).await.unwrap();
                }
                SyncOutcome::Reorg(_) => {
                    let msg =
                        CoordinatorMsg::SyncReorg { stats: self.sync.copy_stats(), vars: None };
                    self.handle.send(msg).await.unwrap();
                }
                SyncOutcome::Idle => return,
            }
        }
    }

    /// Mine and sync blocks until `done` holds
    async fn run_until(&mut self, what: &str, mut done: impl FnMut(&Self) -> bool) {
        for _ in 0..500 {
            self.sync_all().await;
            if done(self) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.client.mine_block();
        }
        panic!("timed out waiting for {what}");
    }

    fn last_batch(&self) -> BatchNum {
        self.history.last_batch().unwrap().map(|b| b.batch_num).unwrap_or_default()
    }

    async fn stop(self) {
        self.cancel.send(true).unwrap();
        self.task.await.unwrap().unwrap();
    }
}

#[tokio::test]
async fn test_forge_sync_and_confirm() {
    let client = client();
    client.add_l1_user_tx(deposit(0xaa)).unwrap();
    client.add_l1_user_tx(deposit(0xbb)).unwrap();
    client.mine_block();

    let prover = Arc::new(MockProver::new(Duration::from_millis(5)));
    let mut node = Node::start(client, prover.clone()).await;

    // the first batch of the run forges the queued deposits
    node.run_until("first batch", |n| n.last_batch() >= BatchNum(1)).await;
    let batch = node.history.last_batch().unwrap().unwrap();
    assert_eq!(batch.forger_addr, forger());
    assert_eq!(batch.forge_l1_txs_num, Some(0));
    assert_eq!(batch.state_root, batch.account_root);
    let account = node.sync.state_db().get_account(AccountIdx(257)).unwrap();
    assert_eq!(account.balance, U256::from(1000u64));

    let id = node
        .l2db
        .add_tx(PoolL2Tx {
            from_idx: AccountIdx(256),
            to_idx: AccountIdx(257),
            amount: U256::from(1u64),
            nonce: Nonce(0),
            ..Default::default()
        })
        .unwrap();
    node.run_until("vouch forged", |n| {
        n.l2db.get_tx(&id).is_some_and(|tx| tx.state == PoolL2TxState::Forged)
            && n.sync
                .state_db()
                .get_vouch(VouchIdx::new(AccountIdx(256), AccountIdx(257)))
                .is_ok_and(|v| v.value)
    })
    .await;

    let batch = node.history.last_batch().unwrap().unwrap();
    assert_eq!(batch.forger_addr, forger());
    assert_eq!(batch.state_root, batch.account_root);
    assert_eq!(node.sync.state_db().get_account(AccountIdx(256)).unwrap().nonce, Nonce(1));
    assert!(prover.proofs() >= 2);
    node.stop().await;
}

#[tokio::test]
async fn test_failed_proof_restarts_pipeline() {
    let client = client();
    client.add_l1_user_tx(deposit(0xaa)).unwrap();
    client.mine_block();

    let mut node = Node::start(client, Arc::new(FlakyProver::default())).await;
    node.run_until("first batch", |n| n.last_batch() >= BatchNum(1)).await;

    let batch = node.history.last_batch().unwrap().unwrap();
    assert_eq!(batch.batch_num, BatchNum(1));
    assert_eq!(batch.forge_l1_txs_num, Some(0));
    assert_eq!(batch.state_root, batch.account_root);
    let account = node.sync.state_db().get_account(AccountIdx(256)).unwrap();
    assert_eq!(account.balance, U256::from(1000u64));
    node.stop().await;
}
