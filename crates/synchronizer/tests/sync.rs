use std::sync::Arc;

use alloy_primitives::{B256, U256};
use sybil_core::{
    AccountIdx, BatchNum, BlockData, EthAddr, L1Tx, L2Tx, Nonce, RollupConstants,
    RollupEventInitialize, RollupEventWithdraw, RollupForgeBatchArgs, RollupVerifierStruct, TxId,
    TxType, VouchIdx,
};
use sybil_db::{KvdbConfig, StateDb, StateDbConfig, StateDbMode};
use sybil_synchronizer::{
    HistoryStore, MemoryHistoryDb, SyncError, SyncOutcome, Synchronizer, SynchronizerConfig,
    TestEthClient,
};
use tempfile::TempDir;

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

fn open_state() -> (TempDir, StateDb) {
    let dir = tempfile::tempdir().unwrap();
    let state = StateDb::new(StateDbConfig {
        kvdb: KvdbConfig { path: dir.path().to_path_buf(), keep: 0, ..KvdbConfig::default() },
        mode: StateDbMode::Synchronizer,
        n_levels: 24,
    })
    .unwrap();
    (dir, state)
}

async fn synchronizer(
    client: &Arc<TestEthClient>,
) -> (TempDir, Arc<MemoryHistoryDb>, Synchronizer) {
    let (dir, state) = open_state();
    let history = Arc::new(MemoryHistoryDb::new());
    let config = SynchronizerConfig { chain_id: 5, ..SynchronizerConfig::default() };
    let sync = Synchronizer::new(client.clone(), history.clone(), state, config).await.unwrap();
    (dir, history, sync)
}

async fn sync_all(sync: &mut Synchronizer) -> Vec<BlockData> {
    let mut blocks = Vec::new();
    loop {
        match sync.sync(None).await.unwrap() {
            SyncOutcome::Block(data) => blocks.push(*data),
            SyncOutcome::Reorg(n) => panic!("unexpected reorg of {n} blocks"),
            SyncOutcome::Idle => return blocks,
        }
    }
}

fn create_deposit(addr: u8, amount: u64) -> L1Tx {
    L1Tx {
        from_eth_addr: EthAddr::repeat_byte(addr),
        from_bjj: [addr; 32],
        deposit_amount: U256::from(amount),
        ..Default::default()
    }
}

fn l1_batch() -> RollupForgeBatchArgs {
    RollupForgeBatchArgs { l1_batch: true, ..Default::default() }
}

fn l2_batch(l2_txs_data: Vec<L2Tx>) -> RollupForgeBatchArgs {
    RollupForgeBatchArgs { l2_txs_data, ..Default::default() }
}

fn vouch(from: u64, to: u64) -> L2Tx {
    L2Tx {
        from_idx: AccountIdx(from),
        to_idx: AccountIdx(to),
        amount: U256::from(1u64),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_sync_forged_batches() {
    let client = client();
    client.add_l1_user_tx(create_deposit(0xaa, 1000)).unwrap();
    client.add_l1_user_tx(create_deposit(0xbb, 1000)).unwrap();
    client.mine_block();

    let args = RollupForgeBatchArgs { l2_txs_data: vec![vouch(256, 257)], ..l1_batch() };
    client.forge(args, forger()).unwrap();
    client.mine_block();

    client
        .add_l1_user_tx(L1Tx {
            from_idx: AccountIdx(256),
            to_idx: AccountIdx::EXIT,
            from_eth_addr: EthAddr::repeat_byte(0xaa),
            amount: U256::from(400u64),
            ..Default::default()
        })
        .unwrap();
    client.update_forge_l1_l2_batch_timeout(20);
    client.mine_block();

    client.forge(l1_batch(), forger()).unwrap();
    client.withdraw(RollupEventWithdraw {
        idx: AccountIdx(256),
        num_exit_root: BatchNum(2),
        instant_withdraw: true,
        tx_hash: B256::repeat_byte(1),
    });
    client.mine_block();

    let (_dir, history, mut sync) = synchronizer(&client).await;
    let blocks = sync_all(&mut sync).await;
    assert_eq!(blocks.len(), 5);
    assert_eq!(blocks[0].block.num, 0);

    let queued = &blocks[1].rollup;
    assert_eq!(queued.l1_user_txs.len(), 2);
    assert!(queued.batches.is_empty());
    assert_eq!(queued.l1_user_txs[1].eth_block_num, 1);

    let b1 = &blocks[2].rollup.batches[0];
    assert!(b1.l1_batch);
    assert_eq!(b1.batch.batch_num, BatchNum(1));
    assert_eq!(b1.batch.forge_l1_txs_num, Some(0));
    assert_eq!(b1.batch.forger_addr, forger());
    assert_eq!(b1.batch.eth_block_num, 2);
    assert_eq!(b1.batch.num_accounts, 2);
    let created: Vec<_> = b1.created_accounts.iter().map(|a| a.idx).collect();
    assert_eq!(created, vec![AccountIdx(256), AccountIdx(257)]);
    assert!(b1.l1_user_txs.iter().all(|tx| tx.batch_num == Some(BatchNum(1))));
    let l2 = &b1.l2_txs[0];
    assert_eq!(l2.tx_type, Some(TxType::CreateVouch));
    assert_eq!(l2.position, 2);
    assert_eq!(l2.nonce, Nonce(0));
    assert_eq!(l2.batch_num, BatchNum(1));
    assert_eq!(l2.tx_id, TxId::l2(AccountIdx(256), Nonce(0)).unwrap());

    let vars = blocks[3].rollup.vars.as_ref().unwrap();
    assert_eq!(vars.forge_l1_l2_batch_timeout, 20);
    assert_eq!(vars.eth_block_num, 3);

    let b2 = &blocks[4].rollup.batches[0];
    assert_eq!(b2.batch.forge_l1_txs_num, Some(1));
    assert_eq!(b2.l1_user_txs.len(), 1);
    assert_eq!(b2.exit_tree.len(), 1);
    assert_eq!(b2.exit_tree[0].account_idx, AccountIdx(256));
    assert_eq!(b2.exit_tree[0].balance, U256::from(400u64));
    assert_eq!(b2.exit_tree[0].batch_num, BatchNum(2));
    let update = b2.updated_accounts.iter().find(|u| u.idx == AccountIdx(256)).unwrap();
    assert_eq!(update.balance, U256::from(600u64));
    assert_eq!(update.batch_num, BatchNum(2));
    assert_eq!(blocks[4].rollup.withdrawals.len(), 1);

    let state = sync.state_db();
    assert_eq!(state.current_batch(), BatchNum(2));
    assert!(state.get_vouch(VouchIdx::new(AccountIdx(256), AccountIdx(257))).unwrap().value);
    assert_eq!(state.get_account(AccountIdx(256)).unwrap().nonce, Nonce(1));
    assert_eq!(sync.sc_vars().forge_l1_l2_batch_timeout, 20);
    assert_eq!(history.last_l1_txs_num().unwrap(), Some(1));
    assert!(history.unforged_l1_user_txs(1).unwrap().is_empty());

    let stats = sync.stats();
    assert!(stats.synced());
    assert_eq!(stats.copy_stats().sync.last_batch.batch_num, BatchNum(2));
    assert_eq!(stats.copy_stats().sync.last_l1_batch_block, 4);
    assert_eq!(stats.batches_perc(), 100.0);

    // an independent replay of the same chain ends on the same roots
    let (_dir2, _history2, mut replay) = synchronizer(&client).await;
    sync_all(&mut replay).await;
    assert_eq!(replay.state_db().account_root(), sync.state_db().account_root());
    assert_eq!(replay.state_db().vouch_root(), sync.state_db().vouch_root());
    assert_eq!(replay.state_db().score_root(), sync.state_db().score_root());
}

#[tokio::test]
async fn test_reorg_rewinds_to_previous_batch() {
    let client = client();
    client.mine_blocks(99);

    // block 100: queue and forge the genesis accounts (batch 1)
    client.add_l1_user_tx(create_deposit(0xaa, 1000)).unwrap();
    client.add_l1_user_tx(create_deposit(0xbb, 1000)).unwrap();
    client.forge(l1_batch(), forger()).unwrap();
    client.mine_block();
    // blocks 101..103: batches 2..5
    client.forge(l2_batch(vec![]), forger()).unwrap();
    client.forge(l2_batch(vec![]), forger()).unwrap();
    client.mine_block();
    client.forge(l2_batch(vec![]), forger()).unwrap();
    client.mine_block();
    client.forge(l2_batch(vec![]), forger()).unwrap();
    client.mine_block();
    // block 104: batch 6, block 105: batch 7
    client.forge(l2_batch(vec![vouch(256, 257)]), forger()).unwrap();
    client.mine_block();
    client.forge(l2_batch(vec![vouch(257, 256)]), forger()).unwrap();
    assert_eq!(client.mine_block().num, 105);

    let (_dir, history, mut sync) = synchronizer(&client).await;
    sync_all(&mut sync).await;
    assert_eq!(sync.state_db().current_batch(), BatchNum(7));
    assert_eq!(history.last_block().unwrap().unwrap().num, 105);

    let batch6 = history.block_data(104).unwrap().rollup.batches[0].batch.clone();
    assert_eq!(batch6.batch_num, BatchNum(6));
    let root7 = sync.state_db().account_root();
    assert_ne!(root7, batch6.account_root);

    // 105 is replaced by an empty 105'
    client.reorg(104);
    client.mine_block();
    client.mine_block();

    let outcome = sync.sync(None).await.unwrap();
    assert_eq!(outcome, SyncOutcome::Reorg(1));
    assert_eq!(sync.state_db().current_batch(), BatchNum(6));
    assert_eq!(sync.state_db().account_root(), batch6.account_root);
    assert_eq!(sync.state_db().vouch_root(), batch6.vouch_root);
    assert_eq!(history.last_block().unwrap().unwrap().num, 104);
    let vouches = sync.state_db();
    assert!(vouches.get_vouch(VouchIdx::new(AccountIdx(256), AccountIdx(257))).unwrap().value);
    assert!(vouches.get_vouch(VouchIdx::new(AccountIdx(257), AccountIdx(256))).is_err());

    let blocks = sync_all(&mut sync).await;
    assert_eq!(blocks.iter().map(|b| b.block.num).collect::<Vec<_>>(), vec![105, 106]);
    assert_eq!(sync.state_db().current_batch(), BatchNum(6));
    assert_eq!(sync.copy_stats().sync.last_batch.batch_num, BatchNum(6));
}

#[tokio::test]
async fn test_failed_block_rolls_back() {
    let client = client();
    client.add_l1_user_tx(create_deposit(0xaa, 1000)).unwrap();
    client.forge(l1_batch(), forger()).unwrap();
    client.mine_block();
    // unknown verifier
    client.forge(RollupForgeBatchArgs { verifier_idx: 3, ..Default::default() }, forger()).unwrap();
    client.mine_block();

    let (_dir, history, mut sync) = synchronizer(&client).await;
    assert!(matches!(sync.sync(None).await.unwrap(), SyncOutcome::Block(_)));
    assert!(matches!(sync.sync(None).await.unwrap(), SyncOutcome::Block(_)));
    assert_eq!(sync.state_db().current_batch(), BatchNum(1));
    let root = sync.state_db().account_root();

    let err = sync.sync(None).await.unwrap_err();
    assert!(matches!(err, SyncError::Inconsistent(_)));
    assert_eq!(history.last_block().unwrap().unwrap().num, 1);
    assert_eq!(sync.state_db().current_batch(), BatchNum(1));
    assert_eq!(sync.state_db().account_root(), root);
}

#[tokio::test]
async fn test_reorg_drops_queued_txs() {
    let client = client();
    client.add_l1_user_tx(create_deposit(0xaa, 1000)).unwrap();
    client.mine_block();
    let (_dir, _history, mut sync) = synchronizer(&client).await;
    sync_all(&mut sync).await;

    client.reorg(0);
    client.forge(l1_batch(), forger()).unwrap();
    client.add_l1_user_tx(create_deposit(0xbb, 10)).unwrap();
    client.mine_block();
    client.mine_block();
    assert_eq!(sync.sync(None).await.unwrap(), SyncOutcome::Reorg(1));
    let blocks = sync_all(&mut sync).await;
    // queue 0 is forged empty on the new branch and the deposit waits in queue 1
    assert_eq!(blocks[0].rollup.batches[0].l1_user_txs.len(), 0);
    assert_eq!(blocks[0].rollup.l1_user_txs[0].to_forge_l1_txs_num, Some(1));
    assert_eq!(sync.state_db().current_batch(), BatchNum(1));
}
