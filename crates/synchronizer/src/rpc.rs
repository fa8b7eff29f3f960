//! JSON-RPC [`EthClient`] over HTTP

use std::env;

use alloy_primitives::{B256, U256};
use async_trait::async_trait;
use serde_json::{json, Value};
use sybil_core::{
    BatchNum, Block, EthAddr, RollupConstants, RollupEventInitialize, RollupEvents,
    RollupForgeBatchArgs, RollupVerifierStruct,
};
use tracing::{debug, warn};

use crate::abi::{self, event_topic, read_u64, selector, word_u64};
use crate::error::{Result, SyncError};
use crate::eth::{EthClient, TxReceipt};

/// Window searched backwards from the genesis block for `Initialize`
const INIT_SEARCH_BLOCKS: u64 = 7200;
/// Upper bound of verifiers read from the contract
const MAX_VERIFIERS: u64 = 16;

/// Endpoint and contract addresses
#[derive(Clone, Debug)]
pub struct RpcConfig {
    /// JSON-RPC endpoint
    pub url: String,
    /// Rollup contract
    pub rollup_address: EthAddr,
    /// Unlocked account that sends the forge txs
    pub from_address: EthAddr,
    /// Gas limit of forge txs
    pub forge_gas_limit: u64,
    /// Deployment block of the rollup
    pub genesis_block_num: u64,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8545".to_string(),
            rollup_address: EthAddr::ZERO,
            from_address: EthAddr::ZERO,
            forge_gas_limit: 5_000_000,
            genesis_block_num: 0,
        }
    }
}

impl RpcConfig {
    /// Load from environment variables
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            url: env::var("SYBIL_RPC_URL").unwrap_or(d.url),
            rollup_address: env::var("SYBIL_ROLLUP_ADDRESS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(d.rollup_address),
            from_address: env::var("SYBIL_COORDINATOR_ADDRESS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(d.from_address),
            forge_gas_limit: env::var("SYBIL_FORGE_GAS_LIMIT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(d.forge_gas_limit),
            genesis_block_num: env::var("SYBIL_GENESIS_BLOCK")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(d.genesis_block_num),
        }
    }
}

fn hex_of(b: &[u8]) -> String {
    format!("0x{}", hex::encode(b))
}

fn quantity(n: u64) -> String {
    format!("0x{n:x}")
}

fn field<'a>(v: &'a Value, name: &str) -> Result<&'a str> {
    v.get(name)
        .and_then(Value::as_str)
        .ok_or_else(|| SyncError::Rpc(format!("missing {name} in {v}")))
}

/// Hex quantity such as `"0x1a"`
fn parse_u64(s: &str) -> Result<u64> {
    u64::from_str_radix(s.trim_start_matches("0x"), 16)
        .map_err(|e| SyncError::Rpc(format!("bad quantity {s}: {e}")))
}

fn parse_u256(s: &str) -> Result<U256> {
    U256::from_str_radix(s.trim_start_matches("0x"), 16)
        .map_err(|e| SyncError::Rpc(format!("bad quantity {s}: {e}")))
}

fn parse_bytes(s: &str) -> Result<Vec<u8>> {
    hex::decode(s.trim_start_matches("0x"))
        .map_err(|e| SyncError::Rpc(format!("bad hex data: {e}")))
}

fn parse_b256(s: &str) -> Result<B256> {
    let b = parse_bytes(s)?;
    if b.len() != 32 {
        return Err(SyncError::Rpc(format!("invalid hash length {}", b.len())));
    }
    Ok(B256::from_slice(&b))
}

fn parse_block(v: &Value) -> Result<Block> {
    Ok(Block {
        num: parse_u64(field(v, "number")?)?,
        hash: parse_b256(field(v, "hash")?)?,
        parent_hash: parse_b256(field(v, "parentHash")?)?,
        timestamp: parse_u64(field(v, "timestamp")?)?,
    })
}

fn parse_receipt(v: &Value) -> Result<TxReceipt> {
    Ok(TxReceipt {
        tx_hash: parse_b256(field(v, "transactionHash")?)?,
        block_num: parse_u64(field(v, "blockNumber")?)?,
        status: field(v, "status")? == "0x1",
        gas_used: parse_u64(field(v, "gasUsed")?)?,
    })
}

/// [`EthClient`] backed by a JSON-RPC node
#[derive(Debug)]
pub struct RpcEthClient {
    config: RpcConfig,
    http_client: reqwest::Client,
}

impl RpcEthClient {
    /// Client for `config`
    pub fn new(config: RpcConfig) -> Self {
        Self { config, http_client: reqwest::Client::new() }
    }

    /// Call the node. `Ok(Value::Null)` for a null result.
    async fn rpc_call(&self, method: &str, params: Value) -> Result<Value> {
        let request = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": 1
        });

        let response = self
            .http_client
            .post(&self.config.url)
            .json(&request)
            .send()
            .await?
            .json::<Value>()
            .await?;

        if let Some(error) = response.get("error") {
            return Err(SyncError::Rpc(format!("{method}: {error}")));
        }
        response
            .get("result")
            .cloned()
            .ok_or_else(|| SyncError::Rpc(format!("{method}: no result in response")))
    }

    /// `eth_call` against the rollup contract at the latest block
    async fn call(&self, data: &[u8]) -> Result<Vec<u8>> {
        let call = json!({
            "to": hex_of(self.config.rollup_address.as_slice()),
            "data": hex_of(data),
        });
        let result = self.rpc_call("eth_call", json!([call, "latest"])).await?;
        let result = result
            .as_str()
            .ok_or_else(|| SyncError::Rpc("invalid eth_call result".to_string()))?;
        parse_bytes(result)
    }

    async fn get_logs(&self, filter: Value) -> Result<Vec<Value>> {
        let logs = self.rpc_call("eth_getLogs", json!([filter])).await?;
        logs.as_array()
            .cloned()
            .ok_or_else(|| SyncError::Rpc("eth_getLogs result is not an array".to_string()))
    }
}

#[async_trait]
impl EthClient for RpcEthClient {
    async fn eth_last_block(&self) -> Result<u64> {
        let result = self.rpc_call("eth_blockNumber", json!([])).await?;
        let result =
            result.as_str().ok_or_else(|| SyncError::Rpc("invalid block number".to_string()))?;
        parse_u64(result)
    }

    async fn eth_block_by_number(&self, num: Option<u64>) -> Result<Option<Block>> {
        let tag = num.map_or_else(|| "latest".to_string(), quantity);
        let result = self.rpc_call("eth_getBlockByNumber", json!([tag, false])).await?;
        if result.is_null() {
            return Ok(None);
        }
        parse_block(&result).map(Some)
    }

    async fn eth_chain_id(&self) -> Result<u64> {
        let result = self.rpc_call("eth_chainId", json!([])).await?;
        parse_u64(result.as_str().ok_or_else(|| SyncError::Rpc("invalid chain id".to_string()))?)
    }

    async fn rollup_constants(&self) -> Result<RollupConstants> {
        let out = self.call(&selector(abi::SIG_ABSOLUTE_MAX_L1_BATCH_TIMEOUT)).await?;
        let absolute_max_l1_l2_batch_timeout = read_u64(&out, 0)?;

        let mut verifiers = Vec::new();
        for i in 0..MAX_VERIFIERS {
            let mut data = selector(abi::SIG_ROLLUP_VERIFIERS).to_vec();
            data.extend_from_slice(&word_u64(i));
            // reverts past the last verifier
            let Ok(out) = self.call(&data).await else { break };
            if out.len() < 64 {
                break;
            }
            let verifier =
                RollupVerifierStruct { max_tx: read_u64(&out, 0)?, n_levels: read_u64(&out, 1)? };
            if verifier.max_tx == 0 {
                break;
            }
            verifiers.push(verifier);
        }
        debug!("rollup constants: {} verifiers", verifiers.len());

        Ok(RollupConstants {
            absolute_max_l1_l2_batch_timeout,
            verifiers,
            governance_address: EthAddr::ZERO,
            genesis_block_num: self.config.genesis_block_num,
        })
    }

    async fn rollup_events_by_block(&self, num: u64, hash: B256) -> Result<Option<RollupEvents>> {
        let logs = self
            .get_logs(json!({
                "address": hex_of(self.config.rollup_address.as_slice()),
                "blockHash": hex_of(hash.as_slice()),
            }))
            .await?;
        if logs.is_empty() {
            return Ok(None);
        }

        let mut events = RollupEvents::default();
        for log in &logs {
            if parse_b256(field(log, "blockHash")?)? != hash {
                return Err(SyncError::BlockHashMismatch { num });
            }
            let topics = log
                .get("topics")
                .and_then(Value::as_array)
                .ok_or_else(|| SyncError::Rpc("log without topics".to_string()))?
                .iter()
                .map(|t| parse_b256(t.as_str().unwrap_or_default()))
                .collect::<Result<Vec<_>>>()?;
            let data = parse_bytes(field(log, "data")?)?;
            let tx_hash = parse_b256(field(log, "transactionHash")?)?;
            abi::push_rollup_log(&mut events, &topics, &data, tx_hash)?;
        }

        for forge in &mut events.forge_batch {
            let receipt = self
                .rpc_call(
                    "eth_getTransactionReceipt",
                    json!([hex_of(forge.eth_tx_hash.as_slice())]),
                )
                .await?;
            if receipt.is_null() {
                warn!("no receipt for forge tx {}", forge.eth_tx_hash);
                continue;
            }
            forge.gas_used = parse_u64(field(&receipt, "gasUsed")?)?;
            if let Ok(price) = field(&receipt, "effectiveGasPrice") {
                forge.gas_price = parse_u256(price)?;
            }
        }
        Ok(Some(events))
    }

    async fn rollup_forge_batch_args(
        &self,
        tx_hash: B256,
        l1_user_txs_len: u16,
    ) -> Result<(RollupForgeBatchArgs, EthAddr)> {
        let tx = self
            .rpc_call("eth_getTransactionByHash", json!([hex_of(tx_hash.as_slice())]))
            .await?;
        if tx.is_null() {
            return Err(SyncError::Rpc(format!("tx {tx_hash} not found")));
        }
        let input = parse_bytes(field(&tx, "input")?)?;
        let from = parse_bytes(field(&tx, "from")?)?;
        if from.len() != 20 {
            return Err(SyncError::Rpc(format!("invalid sender length {}", from.len())));
        }
        let args = abi::decode_forge_batch(&input, l1_user_txs_len)?;
        Ok((args, EthAddr::from_slice(&from)))
    }

    async fn rollup_event_init(&self, genesis: u64) -> Result<(RollupEventInitialize, u64)> {
        let logs = self
            .get_logs(json!({
                "address": hex_of(self.config.rollup_address.as_slice()),
                "fromBlock": quantity(genesis.saturating_sub(INIT_SEARCH_BLOCKS)),
                "toBlock": quantity(genesis),
                "topics": [hex_of(event_topic(abi::EVT_INITIALIZE).as_slice())],
            }))
            .await?;
        let log = logs
            .first()
            .ok_or_else(|| SyncError::Rpc("Initialize event not found".to_string()))?;
        let data = parse_bytes(field(log, "data")?)?;
        let block_num = parse_u64(field(log, "blockNumber")?)?;
        Ok((RollupEventInitialize { forge_l1_l2_batch_timeout: read_u64(&data, 0)? }, block_num))
    }

    async fn rollup_last_forged_batch(&self) -> Result<BatchNum> {
        let out = self.call(&selector(abi::SIG_LAST_FORGED_BATCH)).await?;
        let n = u32::try_from(read_u64(&out, 0)?)
            .map_err(|_| SyncError::Decode("lastForgedBatch does not fit in u32".to_string()))?;
        Ok(BatchNum(n))
    }

    async fn rollup_forge_batch(
        &self,
        args: &RollupForgeBatchArgs,
        nonce: u64,
        gas_price: U256,
    ) -> Result<B256> {
        let calldata = abi::encode_forge_batch(args)?;
        let tx_request = json!({
            "from": hex_of(self.config.from_address.as_slice()),
            "to": hex_of(self.config.rollup_address.as_slice()),
            "data": hex_of(&calldata),
            "nonce": quantity(nonce),
            "gasPrice": format!("0x{gas_price:x}"),
            "gas": quantity(self.config.forge_gas_limit),
        });
        let result = self.rpc_call("eth_sendTransaction", json!([tx_request])).await?;
        let result =
            result.as_str().ok_or_else(|| SyncError::Rpc("no tx hash in response".to_string()))?;
        parse_b256(result)
    }

    async fn eth_transaction_receipt(&self, tx_hash: B256) -> Result<Option<TxReceipt>> {
        let result = self
            .rpc_call("eth_getTransactionReceipt", json!([hex_of(tx_hash.as_slice())]))
            .await?;
        if result.is_null() {
            return Ok(None);
        }
        parse_receipt(&result).map(Some)
    }

    async fn eth_pending_nonce(&self) -> Result<u64> {
        let result = self
            .rpc_call(
                "eth_getTransactionCount",
                json!([hex_of(self.config.from_address.as_slice()), "pending"]),
            )
            .await?;
        parse_u64(result.as_str().ok_or_else(|| SyncError::Rpc("invalid nonce".to_string()))?)
    }

    async fn eth_suggest_gas_price(&self) -> Result<U256> {
        let result = self.rpc_call("eth_gasPrice", json!([])).await?;
        parse_u256(result.as_str().ok_or_else(|| SyncError::Rpc("invalid gas price".to_string()))?)
    }

    fn address(&self) -> EthAddr {
        self.config.from_address
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_block() {
        let v = json!({
            "number": "0x1b4",
            "hash": format!("0x{}", "11".repeat(32)),
            "parentHash": format!("0x{}", "22".repeat(32)),
            "timestamp": "0x5f5e100",
        });
        let block = parse_block(&v).unwrap();
        assert_eq!(block.num, 436);
        assert_eq!(block.hash, B256::repeat_byte(0x11));
        assert_eq!(block.parent_hash, B256::repeat_byte(0x22));
        assert_eq!(block.timestamp, 100_000_000);

        let missing = json!({ "number": "0x1" });
        assert!(parse_block(&missing).is_err());
    }

    #[test]
    fn test_parse_receipt() {
        let v = json!({
            "transactionHash": format!("0x{}", "aa".repeat(32)),
            "blockNumber": "0x10",
            "status": "0x0",
            "gasUsed": "0x5208",
        });
        let r = parse_receipt(&v).unwrap();
        assert_eq!(r.block_num, 16);
        assert!(!r.status);
        assert_eq!(r.gas_used, 21000);
    }

    #[test]
    fn test_quantities() {
        assert_eq!(quantity(255), "0xff");
        assert_eq!(parse_u64("0xff").unwrap(), 255);
        assert!(parse_u64("0xzz").is_err());
        assert_eq!(parse_u256("0x3b9aca00").unwrap(), U256::from(1_000_000_000u64));
        assert!(parse_b256("0x1234").is_err());
    }
}
