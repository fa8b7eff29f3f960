use alloy_primitives::U256;
use sybil_core::{
    AccountIdx, BatchNum, BjjComp, EthAddr, L1Tx, Nonce, PoolL2Tx, TxType, VouchIdx, EMPTY_BJJ,
};
use sybil_db::{KvdbConfig, StateDb, StateDbConfig, StateDbMode};
use sybil_txprocessor::{ProcessTxOutput, TxProcessor, TxProcessorConfig};
use tempfile::TempDir;

fn open(mode: StateDbMode) -> (TempDir, StateDb) {
    let dir = tempfile::tempdir().unwrap();
    let state = StateDb::new(StateDbConfig {
        kvdb: KvdbConfig { path: dir.path().to_path_buf(), keep: 0, ..KvdbConfig::default() },
        mode,
        n_levels: 24,
    })
    .unwrap();
    (dir, state)
}

fn config() -> TxProcessorConfig {
    TxProcessorConfig { n_levels: 24, max_tx: 16, max_l1_tx: 8, chain_id: 5 }
}

fn test_bjj(seed: u8) -> BjjComp {
    let mut bjj = [seed; 32];
    bjj[31] = 0x80 | (seed & 0x0f);
    bjj
}

fn l1(from: u64, to: u64, addr: u8, amount: u64, deposit: u64, position: u16) -> L1Tx {
    L1Tx::new(L1Tx {
        user_origin: true,
        to_forge_l1_txs_num: Some(1),
        position,
        from_idx: AccountIdx(from),
        to_idx: AccountIdx(to),
        from_eth_addr: EthAddr::repeat_byte(addr),
        from_bjj: if from == 0 { test_bjj(addr) } else { EMPTY_BJJ },
        amount: U256::from(amount),
        deposit_amount: U256::from(deposit),
        ..Default::default()
    })
    .unwrap()
}

fn process(state: &mut StateDb, l1_txs: &mut [L1Tx], l2_txs: &mut [PoolL2Tx]) -> ProcessTxOutput {
    TxProcessor::new(state, config()).process_txs(&[], l1_txs, &mut [], l2_txs).unwrap()
}

/// Two accounts at 256 (0xaa, 1000) and 257 (0xbb, 1000) in batch 1
fn two_accounts(state: &mut StateDb) {
    let mut txs = vec![l1(0, 0, 0xaa, 0, 1000, 0), l1(0, 0, 0xbb, 0, 1000, 1)];
    process(state, &mut txs, &mut []);
}

#[test]
fn test_genesis_create_deposit() {
    let (_dir, mut state) = open(StateDbMode::Synchronizer);
    let mut txs = vec![l1(0, 0, 0xaa, 0, 1000, 0)];
    let out = process(&mut state, &mut txs, &mut []);

    let created = out.created_accounts.unwrap();
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].idx, AccountIdx(256));
    assert_eq!(created[0].nonce, Nonce(0));
    assert_eq!(created[0].balance, U256::from(1000u64));
    assert_eq!(created[0].eth_addr, EthAddr::repeat_byte(0xaa));
    assert_eq!(created[0].bjj, test_bjj(0xaa));
    assert_eq!(state.current_account_idx(), AccountIdx(256));
    assert_ne!(state.account_root(), U256::ZERO);
    assert_eq!(state.current_batch(), BatchNum(1));
    assert_eq!(txs[0].effective_from_idx, AccountIdx(256));
    assert_eq!(state.get_idx_by_eth_addr(&EthAddr::repeat_byte(0xaa)).unwrap(), AccountIdx(256));
    assert_eq!(
        state.get_idx_by_eth_addr_bjj(&EthAddr::repeat_byte(0xaa), &test_bjj(0xaa)).unwrap(),
        AccountIdx(256)
    );
}

#[test]
fn test_deposit_into_existing_account() {
    let (_dir, mut state) = open(StateDbMode::Synchronizer);
    process(&mut state, &mut [l1(0, 0, 0xaa, 0, 1000, 0)], &mut []);
    let root = state.account_root();

    let mut txs = vec![l1(256, 0, 0xaa, 0, 500, 0)];
    assert_eq!(txs[0].tx_type, Some(TxType::Deposit));
    let out = process(&mut state, &mut txs, &mut []);

    assert_eq!(state.get_account(AccountIdx(256)).unwrap().balance, U256::from(1500u64));
    assert_ne!(state.account_root(), root);
    let updated = out.updated_accounts.unwrap();
    assert_eq!(updated.len(), 1);
    assert_eq!(updated[&AccountIdx(256)].balance, U256::from(1500u64));
    assert!(out.created_accounts.unwrap().is_empty());
}

#[test]
fn test_deposit_by_non_owner_only_credits() {
    let (_dir, mut state) = open(StateDbMode::Synchronizer);
    process(&mut state, &mut [l1(0, 0, 0xaa, 0, 1000, 0)], &mut []);

    // 0xcc is not the owner: the deposit lands, the withdrawal leg does not
    let mut txs = vec![l1(256, 0, 0xcc, 300, 50, 0)];
    process(&mut state, &mut txs, &mut []);
    assert_eq!(txs[0].effective_amount, U256::ZERO);
    assert_eq!(txs[0].effective_deposit_amount, U256::from(50u64));
    assert_eq!(state.get_account(AccountIdx(256)).unwrap().balance, U256::from(1050u64));
}

#[test]
fn test_vouch_pair() {
    let (_dir, mut state) = open(StateDbMode::Synchronizer);
    two_accounts(&mut state);
    let vouch_root = state.vouch_root();

    let mut txs = vec![l1(256, 257, 0xaa, 1, 0, 0), l1(257, 256, 0xbb, 1, 0, 1)];
    assert_eq!(txs[0].tx_type, Some(TxType::CreateVouch));
    let out = process(&mut state, &mut txs, &mut []);

    assert_ne!(state.vouch_root(), vouch_root);
    let v1 = state.get_vouch(VouchIdx::new(AccountIdx(256), AccountIdx(257))).unwrap();
    let v2 = state.get_vouch(VouchIdx::new(AccountIdx(257), AccountIdx(256))).unwrap();
    assert!(v1.value && v2.value);
    assert_eq!(v1.batch_num, BatchNum(2));
    assert_eq!(state.get_account(AccountIdx(256)).unwrap().nonce, Nonce(1));
    assert_eq!(state.get_account(AccountIdx(257)).unwrap().nonce, Nonce(1));
    assert_eq!(state.get_score(AccountIdx(256)).unwrap().value, 1);
    assert_eq!(state.get_score(AccountIdx(257)).unwrap().value, 1);
    assert_ne!(state.score_root(), U256::ZERO);
    assert_eq!(out.updated_accounts.unwrap().len(), 2);
    assert_eq!(state.current_vouch_idx(), VouchIdx::new(AccountIdx(257), AccountIdx(256)));
}

#[test]
fn test_vouch_score_moves_only_on_flip() {
    let (_dir, mut state) = open(StateDbMode::Synchronizer);
    two_accounts(&mut state);

    let mut txs = vec![l1(256, 257, 0xaa, 1, 0, 0), l1(256, 257, 0xaa, 1, 0, 1)];
    process(&mut state, &mut txs, &mut []);
    assert_eq!(state.get_score(AccountIdx(257)).unwrap().value, 1);
    assert_eq!(state.get_score(AccountIdx(256)).unwrap().value, 0);
    assert_eq!(state.get_account(AccountIdx(256)).unwrap().nonce, Nonce(2));

    let mut txs = vec![l1(256, 257, 0xaa, 0, 0, 0), l1(256, 257, 0xaa, 0, 0, 1)];
    assert_eq!(txs[0].tx_type, Some(TxType::DeleteVouch));
    process(&mut state, &mut txs, &mut []);
    assert_eq!(state.get_score(AccountIdx(257)).unwrap().value, 0);
    assert!(!state.get_vouch(VouchIdx::new(AccountIdx(256), AccountIdx(257))).unwrap().value);
}

#[test]
fn test_vouch_to_missing_account_fails() {
    let (_dir, mut state) = open(StateDbMode::Synchronizer);
    process(&mut state, &mut [l1(0, 0, 0xaa, 0, 1000, 0)], &mut []);

    let mut txs = vec![l1(256, 300, 0xaa, 1, 0, 0)];
    let err = TxProcessor::new(&mut state, config())
        .process_txs(&[], &mut txs, &mut [], &mut [])
        .unwrap_err();
    assert!(matches!(err.core(), Some(sybil_core::Error::AccountNotFound(300))));
    assert_eq!(state.current_batch(), BatchNum(1));
}

#[test]
fn test_force_exit_partial() {
    let (_dir, mut state) = open(StateDbMode::Synchronizer);
    process(&mut state, &mut [l1(0, 0, 0xaa, 0, 1000, 0)], &mut []);

    let mut txs = vec![l1(256, 1, 0xaa, 400, 0, 0)];
    assert_eq!(txs[0].tx_type, Some(TxType::ForceExit));
    let out = process(&mut state, &mut txs, &mut []);

    assert_eq!(state.get_account(AccountIdx(256)).unwrap().balance, U256::from(600u64));
    assert_ne!(out.exit_root, U256::ZERO);
    let exits = out.exit_infos.unwrap();
    assert_eq!(exits.len(), 1);
    assert_eq!(exits[0].account_idx, AccountIdx(256));
    assert_eq!(exits[0].balance, U256::from(400u64));
    assert_eq!(exits[0].batch_num, BatchNum(2));
    assert_eq!(exits[0].merkle_proof.fnc, 0);
    assert_eq!(exits[0].merkle_proof.root, out.exit_root);
    assert!(exits[0].merkle_proof.verify());
}

#[test]
fn test_exits_accumulate_per_idx() {
    let (_dir, mut state) = open(StateDbMode::Synchronizer);
    process(&mut state, &mut [l1(0, 0, 0xaa, 0, 1000, 0)], &mut []);

    let mut txs = vec![l1(256, 1, 0xaa, 100, 0, 0), l1(256, 1, 0xaa, 50, 0, 1)];
    let mut l2 = vec![PoolL2Tx::new(PoolL2Tx {
        from_idx: AccountIdx(256),
        to_idx: AccountIdx::EXIT,
        amount: U256::from(25u64),
        ..Default::default()
    })
    .unwrap()];
    let out = process(&mut state, &mut txs, &mut l2);

    let exits = out.exit_infos.unwrap();
    assert_eq!(exits.len(), 1);
    assert_eq!(exits[0].balance, U256::from(175u64));
    let account = state.get_account(AccountIdx(256)).unwrap();
    assert_eq!(account.balance, U256::from(825u64));
    // only the L2 exit bumps the nonce
    assert_eq!(account.nonce, Nonce(1));
    assert_eq!(l2[0].nonce, Nonce(0));
}

#[test]
fn test_zero_exit_leaves_exit_tree_empty() {
    let (_dir, mut state) = open(StateDbMode::Synchronizer);
    process(&mut state, &mut [l1(0, 0, 0xaa, 0, 1000, 0)], &mut []);

    let mut txs = vec![l1(256, 1, 0xaa, 0, 0, 0)];
    let out = process(&mut state, &mut txs, &mut []);
    assert_eq!(out.exit_root, U256::ZERO);
    assert!(out.exit_infos.unwrap().is_empty());
    assert_eq!(out.updated_accounts.unwrap().len(), 1);
}

#[test]
fn test_force_exit_over_balance_is_zeroed() {
    let (_dir, mut state) = open(StateDbMode::Synchronizer);
    process(&mut state, &mut [l1(0, 0, 0xaa, 0, 1000, 0)], &mut []);

    let mut txs = vec![l1(256, 1, 0xaa, 5000, 0, 0)];
    let out = process(&mut state, &mut txs, &mut []);
    assert_eq!(txs[0].effective_amount, U256::ZERO);
    assert_eq!(state.get_account(AccountIdx(256)).unwrap().balance, U256::from(1000u64));
    // the exit leaf is still written, crediting nothing
    assert_ne!(out.exit_root, U256::ZERO);
    let exits = out.exit_infos.unwrap();
    assert_eq!(exits.len(), 1);
    assert_eq!(exits[0].account_idx, AccountIdx(256));
    assert_eq!(exits[0].balance, U256::ZERO);
    assert!(exits[0].merkle_proof.verify());
}

#[test]
fn test_batchbuilder_zero_credit_exit_and_l1_vouch() {
    let (_dir, mut state) = open(StateDbMode::BatchBuilder);
    two_accounts(&mut state);

    let mut l1_txs = vec![l1(256, 1, 0xaa, 5000, 0, 0), l1(256, 257, 0xaa, 1, 0, 1)];
    assert_eq!(l1_txs[1].tx_type, Some(TxType::CreateVouch));
    let out = process(&mut state, &mut l1_txs, &mut []);
    assert_eq!(l1_txs[0].effective_amount, U256::ZERO);
    assert_ne!(out.exit_root, U256::ZERO);
    let zki = out.zk_inputs.unwrap();

    // slot 0: new exit leaf with nothing credited
    assert!(zki.on_chain[0]);
    assert_eq!(zki.balance1[0], U256::from(1000u64));
    assert_eq!(zki.balance2[0], U256::ZERO);
    assert!(zki.is_old0_2[0]);
    assert_ne!(zki.is_exit_root[0], U256::ZERO);

    // slot 1: L1 vouch is not an on-chain slot for the circuit
    assert!(!zki.on_chain[1]);
    assert!(zki.is_on_chain[1]);
    assert_eq!(zki.is_exit_root[1], zki.is_exit_root[0]);
    assert_eq!(zki.metadata.new_exit_root_raw, out.exit_root);
}

#[test]
fn test_create_over_existing_idx_fails() {
    let (_dir, mut state) = open(StateDbMode::Synchronizer);
    let account =
        sybil_core::Account { eth_addr: EthAddr::repeat_byte(0x01), ..Default::default() };
    // leaf at 256 without advancing the counter
    state.create_account(AccountIdx(256), &account).unwrap();

    let mut txs = vec![l1(0, 0, 0xaa, 0, 1000, 0)];
    let err = TxProcessor::new(&mut state, config())
        .process_txs(&[], &mut txs, &mut [], &mut [])
        .unwrap_err();
    assert!(matches!(err.core(), Some(sybil_core::Error::AccountAlreadyExists(256))));
    assert_eq!(state.current_batch(), BatchNum(0));
}

#[test]
fn test_replays_produce_identical_roots() {
    let run = || {
        let (dir, mut state) = open(StateDbMode::Synchronizer);
        let mut roots = Vec::new();
        let batches: Vec<Vec<L1Tx>> = vec![
            vec![l1(0, 0, 0xaa, 0, 1000, 0), l1(0, 0, 0xbb, 0, 700, 1), l1(0, 0, 0xcc, 0, 10, 2)],
            vec![
                l1(256, 257, 0xaa, 1, 0, 0),
                l1(258, 257, 0xcc, 1, 0, 1),
                l1(257, 1, 0xbb, 200, 0, 2),
            ],
            vec![l1(256, 0, 0xaa, 0, 5, 0), l1(258, 257, 0xcc, 0, 0, 1)],
        ];
        for mut txs in batches {
            process(&mut state, &mut txs, &mut []);
            roots.push((state.account_root(), state.vouch_root(), state.score_root()));
        }
        drop(state);
        drop(dir);
        roots
    };
    let a = run();
    let b = run();
    assert_eq!(a, b);
    assert_eq!(a.len(), 3);
    assert_ne!(a[1].1, a[0].1);
}

#[test]
fn test_batchbuilder_witness() {
    let (_dir, mut state) = open(StateDbMode::BatchBuilder);
    two_accounts(&mut state);
    let old_root = state.account_root();

    let mut l1_txs = vec![l1(256, 1, 0xaa, 100, 0, 0)];
    let mut l2 = vec![PoolL2Tx::new(PoolL2Tx {
        from_idx: AccountIdx(257),
        to_idx: AccountIdx(256),
        amount: U256::from(1u64),
        tx_type: Some(TxType::CreateVouch),
        ..Default::default()
    })
    .unwrap()];
    let out = process(&mut state, &mut l1_txs, &mut l2);
    assert!(out.exit_infos.is_none());
    assert!(out.created_accounts.is_none());
    let zki = out.zk_inputs.unwrap();

    assert_eq!(zki.current_num_batch, 2);
    assert_eq!(zki.global_chain_id, 5);
    assert_eq!(zki.old_last_idx, 257);
    assert_eq!(zki.old_account_root, old_root);

    // slot 0: force exit
    assert!(zki.on_chain[0]);
    assert_eq!(zki.from_idx[0], 256);
    assert_eq!(zki.to_idx[0], 1);
    assert_eq!(zki.balance1[0], U256::from(1000u64));
    assert_eq!(zki.balance2[0], U256::ZERO);
    assert_eq!(zki.amount_f[0], U256::from(100u64));
    assert_ne!(zki.tx_compressed_data[0], U256::ZERO);
    assert!(zki.siblings1[0].iter().any(|s| !s.is_zero()));
    assert_eq!(zki.siblings1[0].len(), 25);

    // slot 1: L2 vouch
    assert!(!zki.on_chain[1]);
    assert_eq!(zki.nonce1[1], 0);
    assert!(!zki.vouch_exists[1]);
    assert_eq!(zki.vouch_siblings[1].len(), 49);
    assert_eq!(zki.score2[1], 0);

    // intermediate states, then untouched slots stay zero
    assert!(zki.is_on_chain[0]);
    assert!(!zki.is_on_chain[1]);
    assert_ne!(zki.is_exit_root[0], U256::ZERO);
    assert_eq!(zki.is_state_root_account[1], state.account_root());
    assert_eq!(zki.is_state_root_vouch[1], state.vouch_root());
    assert_eq!(zki.is_out_idx[1], 257);
    assert_eq!(zki.is_state_root_account[2], U256::ZERO);
    assert_eq!(zki.from_idx[2], 0);

    assert_eq!(zki.metadata.new_last_idx_raw, 257);
    assert_eq!(zki.metadata.new_state_root_raw, state.account_root());
    assert_eq!(zki.metadata.new_exit_root_raw, out.exit_root);
    assert_eq!(zki.metadata.l1_txs_data_availability.len(), 1);
    assert_eq!(zki.metadata.l2_txs_data.len(), 1);
}

#[test]
fn test_l2_transfer_is_rejected() {
    let (_dir, mut state) = open(StateDbMode::BatchBuilder);
    two_accounts(&mut state);
    let mut l2 = vec![PoolL2Tx::new(PoolL2Tx {
        from_idx: AccountIdx(256),
        to_idx: AccountIdx(257),
        amount: U256::from(1u64),
        tx_type: Some(TxType::Transfer),
        ..Default::default()
    })
    .unwrap()];
    let err = TxProcessor::new(&mut state, config())
        .process_txs(&[], &mut [], &mut [], &mut l2)
        .unwrap_err();
    assert!(matches!(err.core(), Some(sybil_core::Error::InvalidTxType(_))));
}
