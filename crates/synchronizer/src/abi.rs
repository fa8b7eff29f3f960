//! Minimal ABI codec for the rollup contract
//!
//! Only what the synchronizer and the tx manager need: function selectors,
//! event topics, the `forgeBatch` calldata and the rollup event logs.

use alloy_primitives::{B256, U256};
use sybil_core::constants::{
    IDX_BYTES_DA, L1L2_TX_DA_BYTES, L1_COORDINATOR_TOTAL_BYTES, L1_USER_TOTAL_BYTES,
};
use sybil_core::l1tx::L1_COORDINATOR_SIG_BYTES;
use sybil_core::{
    keccak256, AccountIdx, BatchNum, BucketParams, L1Tx, L2Tx, RollupEventForgeBatch,
    RollupEventL1UserTx, RollupEventSafeMode, RollupEventUpdateBucketWithdraw,
    RollupEventUpdateBucketsParameters, RollupEventUpdateForgeL1L2BatchTimeout,
    RollupEventWithdraw, RollupEvents, RollupForgeBatchArgs,
};

use crate::error::{Result, SyncError};

/// `forgeBatch` signature
pub const SIG_FORGE_BATCH: &str = concat!(
    "forgeBatch(uint48,uint256,uint256,bytes,bytes,bytes,uint8,bool,",
    "uint256[2],uint256[2][2],uint256[2])"
);
/// `lastForgedBatch` signature
pub const SIG_LAST_FORGED_BATCH: &str = "lastForgedBatch()";
/// `ABSOLUTE_MAX_L1BATCHTIMEOUT` signature
pub const SIG_ABSOLUTE_MAX_L1_BATCH_TIMEOUT: &str = "ABSOLUTE_MAX_L1BATCHTIMEOUT()";
/// `rollupVerifiers` signature
pub const SIG_ROLLUP_VERIFIERS: &str = "rollupVerifiers(uint256)";

/// L1 user tx queued
pub const EVT_L1_USER_TX: &str = "L1UserTxEvent(uint32,uint8,bytes)";
/// Batch forged
pub const EVT_FORGE_BATCH: &str = "ForgeBatch(uint32,uint16)";
/// L1 batch timeout changed
pub const EVT_UPDATE_FORGE_L1_L2_BATCH_TIMEOUT: &str = "UpdateForgeL1L2BatchTimeout(uint8)";
/// Withdrawal
pub const EVT_WITHDRAW: &str = "WithdrawEvent(uint48,uint32,bool)";
/// Bucket withdrawals changed
pub const EVT_UPDATE_BUCKET_WITHDRAW: &str = "UpdateBucketWithdraw(uint8,uint256,uint256)";
/// Bucket parameters changed
pub const EVT_UPDATE_BUCKETS_PARAMETERS: &str = "UpdateBucketsParameters(uint256[])";
/// Safe mode entered
pub const EVT_SAFE_MODE: &str = "SafeMode()";
/// Contract initialized
pub const EVT_INITIALIZE: &str = "Initialize(uint8)";

const WORD: usize = 32;
/// Static head of `forgeBatch`: 8 plain words plus the 8 proof words
const FORGE_HEAD_WORDS: usize = 16;

/// First four bytes of the keccak of a function signature
pub fn selector(sig: &str) -> [u8; 4] {
    let h = keccak256(sig.as_bytes());
    [h[0], h[1], h[2], h[3]]
}

/// Topic 0 of an event
pub fn event_topic(sig: &str) -> B256 {
    B256::from(keccak256(sig.as_bytes()))
}

/// Left-padded 32-byte word
pub fn word_u64(v: u64) -> [u8; WORD] {
    let mut w = [0u8; WORD];
    w[24..].copy_from_slice(&v.to_be_bytes());
    w
}

/// Big-endian 32-byte word
pub fn word_u256(v: U256) -> [u8; WORD] {
    v.to_be_bytes::<WORD>()
}

/// Word `i` of `data`
pub fn read_word(data: &[u8], i: usize) -> Result<&[u8]> {
    data.get(i * WORD..(i + 1) * WORD)
        .ok_or_else(|| SyncError::Decode(format!("word {i} out of range (len {})", data.len())))
}

/// Word `i` as an integer
pub fn read_u256(data: &[u8], i: usize) -> Result<U256> {
    Ok(U256::from_be_slice(read_word(data, i)?))
}

/// Word `i` as an integer that must fit in 64 bits
pub fn read_u64(data: &[u8], i: usize) -> Result<u64> {
    let v = read_u256(data, i)?;
    u64::try_from(v).map_err(|_| SyncError::Decode(format!("word {i} does not fit in u64: {v}")))
}

fn topic_u64(topic: &B256) -> Result<u64> {
    let v = U256::from_be_bytes(topic.0);
    u64::try_from(v).map_err(|_| SyncError::Decode(format!("topic does not fit in u64: {v}")))
}

/// Dynamic `bytes` whose offset is stored at word `i` of the head
pub fn read_bytes(data: &[u8], i: usize) -> Result<&[u8]> {
    let offset = usize::try_from(read_u64(data, i)?)
        .map_err(|_| SyncError::Decode("bytes offset overflow".to_string()))?;
    let len = usize::try_from(read_u64(&data[offset.min(data.len())..], 0)?)
        .map_err(|_| SyncError::Decode("bytes length overflow".to_string()))?;
    let start = offset + WORD;
    data.get(start..start + len)
        .ok_or_else(|| {
            SyncError::Decode(format!("bytes at {offset} with length {len} out of range"))
        })
}

/// Append `bytes` as length word plus zero-padded data
fn push_bytes(out: &mut Vec<u8>, b: &[u8]) {
    out.extend_from_slice(&word_u64(b.len() as u64));
    out.extend_from_slice(b);
    let pad = (WORD - b.len() % WORD) % WORD;
    out.extend(std::iter::repeat(0u8).take(pad));
}

fn padded_len(len: usize) -> usize {
    WORD + len.div_ceil(WORD) * WORD
}

/// Encode the `forgeBatch` calldata, selector included
pub fn encode_forge_batch(args: &RollupForgeBatchArgs) -> Result<Vec<u8>> {
    let mut coordinator =
        Vec::with_capacity(args.l1_coordinator_txs.len() * L1_COORDINATOR_TOTAL_BYTES);
    for (i, tx) in args.l1_coordinator_txs.iter().enumerate() {
        let mut sig = [0u8; L1_COORDINATOR_SIG_BYTES];
        if let Some(auth) = args.l1_coordinator_txs_auths.get(i) {
            if auth.len() == L1_COORDINATOR_SIG_BYTES {
                sig.copy_from_slice(auth);
            }
        }
        coordinator.extend_from_slice(&tx.bytes_coordinator(&sig));
    }

    let mut l1l2 = Vec::new();
    for tx in args.l1_user_txs.iter().chain(&args.l1_coordinator_txs) {
        l1l2.extend_from_slice(&tx.bytes_data_availability()?);
    }
    for tx in &args.l2_txs_data {
        l1l2.extend_from_slice(&tx.bytes_data_availability()?);
    }

    let mut fee_idxs = Vec::with_capacity(args.fee_idx_coordinator.len() * IDX_BYTES_DA);
    for idx in &args.fee_idx_coordinator {
        fee_idxs.extend_from_slice(&idx.to_bytes3()?);
    }

    let head_len = FORGE_HEAD_WORDS * WORD;
    let off_coordinator = head_len;
    let off_l1l2 = off_coordinator + padded_len(coordinator.len());
    let off_fee = off_l1l2 + padded_len(l1l2.len());

    let mut out = Vec::with_capacity(4 + off_fee + padded_len(fee_idxs.len()));
    out.extend_from_slice(&selector(SIG_FORGE_BATCH));
    out.extend_from_slice(&word_u64(args.new_last_idx));
    out.extend_from_slice(&word_u256(args.new_st_root));
    out.extend_from_slice(&word_u256(args.new_exit_root));
    out.extend_from_slice(&word_u64(off_coordinator as u64));
    out.extend_from_slice(&word_u64(off_l1l2 as u64));
    out.extend_from_slice(&word_u64(off_fee as u64));
    out.extend_from_slice(&word_u64(u64::from(args.verifier_idx)));
    out.extend_from_slice(&word_u64(u64::from(args.l1_batch)));
    for v in args.proof_a.iter().chain(args.proof_b.iter().flatten()).chain(&args.proof_c) {
        out.extend_from_slice(&word_u256(*v));
    }
    push_bytes(&mut out, &coordinator);
    push_bytes(&mut out, &l1l2);
    push_bytes(&mut out, &fee_idxs);
    Ok(out)
}

/// Decode `forgeBatch` calldata. `l1_user_txs_len` comes from the matching
/// `ForgeBatch` event and splits the data-availability section.
pub fn decode_forge_batch(input: &[u8], l1_user_txs_len: u16) -> Result<RollupForgeBatchArgs> {
    if input.len() < 4 {
        return Err(SyncError::Decode("calldata shorter than a selector".to_string()));
    }
    let (sel, data) = input.split_at(4);
    if sel != selector(SIG_FORGE_BATCH) {
        return Err(SyncError::Decode(format!("not a forgeBatch call: 0x{}", hex::encode(sel))));
    }

    let verifier_idx = u8::try_from(read_u64(data, 6)?)
        .map_err(|_| SyncError::Decode("verifier_idx does not fit in u8".to_string()))?;
    let mut args = RollupForgeBatchArgs {
        new_last_idx: read_u64(data, 0)?,
        new_st_root: read_u256(data, 1)?,
        new_exit_root: read_u256(data, 2)?,
        verifier_idx,
        l1_batch: read_u64(data, 7)? != 0,
        proof_a: [read_u256(data, 8)?, read_u256(data, 9)?],
        proof_b: [
            [read_u256(data, 10)?, read_u256(data, 11)?],
            [read_u256(data, 12)?, read_u256(data, 13)?],
        ],
        proof_c: [read_u256(data, 14)?, read_u256(data, 15)?],
        ..Default::default()
    };

    let coordinator = read_bytes(data, 3)?;
    if coordinator.len() % L1_COORDINATOR_TOTAL_BYTES != 0 {
        return Err(SyncError::Decode(format!(
            "encodedL1CoordinatorTx length {} is not a multiple of {L1_COORDINATOR_TOTAL_BYTES}",
            coordinator.len()
        )));
    }
    for (i, chunk) in coordinator.chunks(L1_COORDINATOR_TOTAL_BYTES).enumerate() {
        let position = u16::try_from(i)
            .map_err(|_| SyncError::Decode("too many coordinator txs".to_string()))?;
        let tx = L1Tx::from_bytes_coordinator(chunk, BatchNum::default(), position)?;
        args.l1_coordinator_txs.push(tx);
        let sig = &chunk[L1_COORDINATOR_TOTAL_BYTES - L1_COORDINATOR_SIG_BYTES..];
        args.l1_coordinator_txs_auths.push(sig.to_vec());
    }

    let l1l2 = read_bytes(data, 4)?;
    if l1l2.len() % L1L2_TX_DA_BYTES != 0 {
        return Err(SyncError::Decode(format!(
            "l1L2TxsData length {} is not a multiple of {L1L2_TX_DA_BYTES}",
            l1l2.len()
        )));
    }
    let n_user = usize::from(l1_user_txs_len);
    let n_l1 = n_user + args.l1_coordinator_txs.len();
    let chunks: Vec<&[u8]> = l1l2.chunks(L1L2_TX_DA_BYTES).collect();
    if chunks.len() < n_l1 {
        return Err(SyncError::Decode(format!(
            "l1L2TxsData carries {} txs, fewer than the {n_l1} L1 txs",
            chunks.len()
        )));
    }
    for chunk in &chunks[..n_user] {
        args.l1_user_txs.push(L1Tx::from_data_availability(chunk)?);
    }
    for chunk in &chunks[n_l1..] {
        args.l2_txs_data.push(L2Tx::from_bytes_data_availability(chunk)?);
    }

    for chunk in read_bytes(data, 5)?.chunks(IDX_BYTES_DA) {
        let idx = AccountIdx::from_bytes(chunk)?;
        if idx.0 != 0 {
            args.fee_idx_coordinator.push(idx);
        }
    }
    Ok(args)
}

/// Unpack a bucket: `ceilUSD(96) ‖ blockStamp(32) ‖ withdrawals(32) ‖
/// rateBlocks(32) ‖ rateWithdrawals(32) ‖ maxWithdrawals(32)`, low bits first
pub fn unpack_bucket(v: U256) -> BucketParams {
    let one = U256::from(1u64);
    let field = |shift: usize, bits: usize| (v >> shift) & ((one << bits) - one);
    BucketParams {
        ceil_usd: field(0, 96),
        block_stamp: field(96, 32),
        withdrawals: field(128, 32),
        rate_blocks: field(160, 32),
        rate_withdrawals: field(192, 32),
        max_withdrawals: field(224, 32),
    }
}

/// Decode one rollup log into `events`. Logs of other events are ignored.
pub fn push_rollup_log(
    events: &mut RollupEvents,
    topics: &[B256],
    data: &[u8],
    tx_hash: B256,
) -> Result<()> {
    let Some(topic0) = topics.first() else {
        return Ok(());
    };
    let topic = |i: usize| {
        topics
            .get(i)
            .ok_or_else(|| SyncError::Decode(format!("log without topic {i}")))
    };

    if *topic0 == event_topic(EVT_L1_USER_TX) {
        let tx_data = read_bytes(data, 0)?;
        if tx_data.len() != L1_USER_TOTAL_BYTES {
            return Err(SyncError::Decode(format!("L1UserTxEvent with {} bytes", tx_data.len())));
        }
        let mut tx = L1Tx::from_bytes_user(tx_data)?;
        tx.to_forge_l1_txs_num = Some(topic_u64(topic(1)?)?);
        tx.position = u16::try_from(topic_u64(topic(2)?)?)
            .map_err(|_| SyncError::Decode("L1UserTxEvent position overflow".to_string()))?;
        tx.user_origin = true;
        tx.eth_tx_hash = tx_hash;
        events.l1_user_tx.push(RollupEventL1UserTx { l1_user_tx: tx });
    } else if *topic0 == event_topic(EVT_FORGE_BATCH) {
        let batch_num = u32::try_from(topic_u64(topic(1)?)?)
            .map_err(|_| SyncError::Decode("ForgeBatch batchNum overflow".to_string()))?;
        let l1_user_txs_len = u16::try_from(read_u64(data, 0)?)
            .map_err(|_| SyncError::Decode("ForgeBatch l1UserTxsLen overflow".to_string()))?;
        events.forge_batch.push(RollupEventForgeBatch {
            batch_num: BatchNum(batch_num),
            eth_tx_hash: tx_hash,
            l1_user_txs_len,
            ..Default::default()
        });
    } else if *topic0 == event_topic(EVT_UPDATE_FORGE_L1_L2_BATCH_TIMEOUT) {
        events.update_forge_l1_l2_batch_timeout.push(RollupEventUpdateForgeL1L2BatchTimeout {
            new_forge_l1_l2_batch_timeout: read_u64(data, 0)?,
        });
    } else if *topic0 == event_topic(EVT_WITHDRAW) {
        let num_exit_root = u32::try_from(topic_u64(topic(2)?)?)
            .map_err(|_| SyncError::Decode("WithdrawEvent numExitRoot overflow".to_string()))?;
        events.withdraw.push(RollupEventWithdraw {
            idx: AccountIdx(topic_u64(topic(1)?)?),
            num_exit_root: BatchNum(num_exit_root),
            instant_withdraw: topic_u64(topic(3)?)? != 0,
            tx_hash,
        });
    } else if *topic0 == event_topic(EVT_UPDATE_BUCKET_WITHDRAW) {
        let num_bucket = u32::try_from(topic_u64(topic(1)?)?)
            .map_err(|_| SyncError::Decode("UpdateBucketWithdraw numBucket overflow".to_string()))?;
        events.update_bucket_withdraw.push(RollupEventUpdateBucketWithdraw {
            num_bucket,
            block_stamp: topic_u64(topic(2)?)?,
            withdrawals: read_u256(data, 0)?,
        });
    } else if *topic0 == event_topic(EVT_UPDATE_BUCKETS_PARAMETERS) {
        let offset = usize::try_from(read_u64(data, 0)?)
            .map_err(|_| SyncError::Decode("array offset overflow".to_string()))?;
        let array = data
            .get(offset..)
            .ok_or_else(|| SyncError::Decode("array offset out of range".to_string()))?;
        let len = usize::try_from(read_u64(array, 0)?)
            .map_err(|_| SyncError::Decode("array length overflow".to_string()))?;
        let array_buckets = (1..=len)
            .map(|i| read_u256(array, i).map(unpack_bucket))
            .collect::<Result<_>>()?;
        events
            .update_buckets_parameters
            .push(RollupEventUpdateBucketsParameters { array_buckets });
    } else if *topic0 == event_topic(EVT_SAFE_MODE) {
        events.safe_mode.push(RollupEventSafeMode);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sybil_core::{EthAddr, TxType};

    fn sample_args() -> RollupForgeBatchArgs {
        let user = L1Tx {
            from_idx: AccountIdx(256),
            to_idx: AccountIdx::EXIT,
            effective_amount: U256::from(300u64),
            ..Default::default()
        };
        let mut bjj = [0u8; 32];
        bjj[0] = 7;
        let coordinator = L1Tx { from_bjj: bjj, ..Default::default() };
        let l2 = L2Tx {
            from_idx: AccountIdx(257),
            to_idx: AccountIdx(256),
            amount: U256::from(1u64),
            ..Default::default()
        };
        RollupForgeBatchArgs {
            new_last_idx: 300,
            new_st_root: U256::from(0xabcdu64),
            new_exit_root: U256::from(0x1234u64),
            l1_user_txs: vec![user],
            l1_coordinator_txs: vec![coordinator],
            l1_coordinator_txs_auths: vec![Vec::new()],
            l2_txs_data: vec![l2],
            fee_idx_coordinator: vec![AccountIdx(256)],
            verifier_idx: 1,
            l1_batch: true,
            proof_a: [U256::from(1u64), U256::from(2u64)],
            proof_b: [[U256::from(3u64), U256::from(4u64)], [U256::from(5u64), U256::from(6u64)]],
            proof_c: [U256::from(7u64), U256::from(8u64)],
        }
    }

    #[test]
    fn test_selector() {
        // well-known ERC-20 selector
        assert_eq!(selector("transfer(address,uint256)"), [0xa9, 0x05, 0x9c, 0xbb]);
    }

    #[test]
    fn test_forge_batch_calldata() {
        let args = sample_args();
        let input = encode_forge_batch(&args).unwrap();
        assert_eq!(input.len() % 32, 4);

        let decoded = decode_forge_batch(&input, 1).unwrap();
        assert_eq!(decoded.new_last_idx, 300);
        assert_eq!(decoded.new_st_root, args.new_st_root);
        assert_eq!(decoded.new_exit_root, args.new_exit_root);
        assert_eq!(decoded.verifier_idx, 1);
        assert!(decoded.l1_batch);
        assert_eq!(decoded.proof_b, args.proof_b);
        assert_eq!(decoded.fee_idx_coordinator, vec![AccountIdx(256)]);

        assert_eq!(decoded.l1_user_txs.len(), 1);
        assert_eq!(decoded.l1_user_txs[0].effective_amount, U256::from(300u64));
        assert_eq!(decoded.l1_coordinator_txs.len(), 1);
        assert_eq!(decoded.l1_coordinator_txs[0].from_bjj[0], 7);
        assert_eq!(decoded.l1_coordinator_txs[0].tx_type, Some(TxType::CreateAccountDeposit));
        assert_eq!(decoded.l2_txs_data.len(), 1);
        assert_eq!(decoded.l2_txs_data[0].from_idx, AccountIdx(257));
        assert_eq!(decoded.l2_txs_data[0].amount, U256::from(1u64));

        // wrong split of the L1 section
        assert!(decode_forge_batch(&input, 3).is_err());
        assert!(decode_forge_batch(&input[4..], 1).is_err());
    }

    #[test]
    fn test_decode_logs() {
        let mut events = RollupEvents::default();
        let hash = B256::repeat_byte(0x11);

        let tx = L1Tx {
            from_eth_addr: EthAddr::repeat_byte(0xaa),
            to_idx: AccountIdx(0),
            deposit_amount: U256::from(50u64),
            ..Default::default()
        };
        let raw = tx.bytes_user().unwrap();
        let mut data = word_u64(32).to_vec();
        push_bytes(&mut data, &raw);
        let topics =
            [event_topic(EVT_L1_USER_TX), B256::from(word_u64(4)), B256::from(word_u64(2))];
        push_rollup_log(&mut events, &topics, &data, hash).unwrap();

        let topics = [event_topic(EVT_FORGE_BATCH), B256::from(word_u64(9))];
        push_rollup_log(&mut events, &topics, &word_u64(3), hash).unwrap();

        let topics = [
            event_topic(EVT_WITHDRAW),
            B256::from(word_u64(256)),
            B256::from(word_u64(5)),
            B256::from(word_u64(1)),
        ];
        push_rollup_log(&mut events, &topics, &[], hash).unwrap();

        let bucket = U256::from(10u64) | (U256::from(20u64) << 96) | (U256::from(30u64) << 224);
        let mut data = word_u64(32).to_vec();
        data.extend_from_slice(&word_u64(1));
        data.extend_from_slice(&word_u256(bucket));
        let topics = [event_topic(EVT_UPDATE_BUCKETS_PARAMETERS)];
        push_rollup_log(&mut events, &topics, &data, hash).unwrap();

        let topics = [event_topic("Transfer(address,address,uint256)")];
        push_rollup_log(&mut events, &topics, &[], hash).unwrap();

        let l1 = &events.l1_user_tx[0].l1_user_tx;
        assert_eq!(l1.to_forge_l1_txs_num, Some(4));
        assert_eq!(l1.position, 2);
        assert_eq!(l1.deposit_amount, U256::from(50u64));
        assert_eq!(l1.eth_tx_hash, hash);
        assert_eq!(events.forge_batch[0].batch_num, BatchNum(9));
        assert_eq!(events.forge_batch[0].l1_user_txs_len, 3);
        assert_eq!(events.withdraw[0].idx, AccountIdx(256));
        assert!(events.withdraw[0].instant_withdraw);
        let b = &events.update_buckets_parameters[0].array_buckets[0];
        assert_eq!(b.ceil_usd, U256::from(10u64));
        assert_eq!(b.block_stamp, U256::from(20u64));
        assert_eq!(b.max_withdrawals, U256::from(30u64));
        assert!(events.safe_mode.is_empty());
    }
}
