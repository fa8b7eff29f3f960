//! Configuration

use std::env;
use std::time::Duration;

use alloy_primitives::U256;
use serde::{Deserialize, Serialize};
use sybil_core::EthAddr;
use sybil_txprocessor::TxProcessorConfig;

/// Purger configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurgerConfig {
    /// Batches between purges of forged and invalid txs
    pub purge_batch_delay: u64,
    /// Blocks between purges
    pub purge_block_delay: u64,
    /// Batches between invalidations of txs with an old nonce
    pub invalidate_batch_delay: u64,
    /// Blocks between invalidations
    pub invalidate_block_delay: u64,
    /// Batches a forged or invalid tx is kept before it can be purged
    pub safety_period: u32,
}

impl Default for PurgerConfig {
    fn default() -> Self {
        Self {
            purge_batch_delay: 10,
            purge_block_delay: 10,
            invalidate_batch_delay: 4,
            invalidate_block_delay: 4,
            safety_period: 10,
        }
    }
}

/// Coordinator configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Address this coordinator forges from
    pub forger_address: EthAddr,
    /// Blocks a mined forge tx is watched before it is forgotten
    pub confirm_blocks: u64,
    /// Fraction of the L1 batch timeout after which an L1 batch is scheduled
    pub l1_batch_timeout_perc: f64,
    /// Forge even when the last batch is not ours
    pub must_forge_at_slot_deadline: bool,
    /// Milliseconds between attempts to forge a batch
    pub forge_retry_interval_ms: u64,
    /// Minimum milliseconds between two batches, 0 to forge at full rate
    pub forge_delay_ms: u64,
    /// Minimum milliseconds before forging a batch without txs, 0 to forge
    /// empty batches at full rate
    pub forge_no_txs_delay_ms: u64,
    /// Milliseconds before retrying a failed message
    pub sync_retry_interval_ms: u64,
    /// Milliseconds between receipt checks
    pub tx_manager_check_interval_ms: u64,
    /// Milliseconds after which an unmined forge tx is resent
    pub eth_tx_resend_timeout_ms: u64,
    /// Never reuse the nonce of a pending forge tx
    pub eth_no_reuse_nonce: bool,
    /// Gas price bounds, in gwei
    pub min_gas_price_gwei: u64,
    /// Upper bound
    pub max_gas_price_gwei: u64,
    /// Increase over the suggested gas price, and per resend, in percent
    pub gas_price_inc_perc: u64,
    /// Verifier the batches are proved for
    pub verifier_idx: u8,
    /// Pool cleanup
    pub purger: PurgerConfig,
    /// Batch shape, `n_levels` and `max_tx` come from the verifier
    pub tx_processor: TxProcessorConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            forger_address: EthAddr::ZERO,
            confirm_blocks: 10,
            l1_batch_timeout_perc: 0.6,
            must_forge_at_slot_deadline: false,
            forge_retry_interval_ms: 500,
            forge_delay_ms: 10_000,
            forge_no_txs_delay_ms: 0,
            sync_retry_interval_ms: 1_000,
            tx_manager_check_interval_ms: 1_000,
            eth_tx_resend_timeout_ms: 60_000,
            eth_no_reuse_nonce: false,
            min_gas_price_gwei: 1,
            max_gas_price_gwei: 500,
            gas_price_inc_perc: 10,
            verifier_idx: 0,
            purger: PurgerConfig::default(),
            tx_processor: TxProcessorConfig::default(),
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    env::var(key).map(|s| s == "true" || s == "1").unwrap_or(default)
}

const GWEI: u64 = 1_000_000_000;

impl CoordinatorConfig {
    /// Load from environment variables
    pub fn from_env() -> Self {
        let d = Self::default();
        let p = d.purger.clone();
        Self {
            forger_address: env_or("SYBIL_FORGER_ADDRESS", d.forger_address),
            confirm_blocks: env_or("SYBIL_CONFIRM_BLOCKS", d.confirm_blocks),
            l1_batch_timeout_perc: env_or("SYBIL_L1_BATCH_TIMEOUT_PERC", d.l1_batch_timeout_perc),
            must_forge_at_slot_deadline: env_flag(
                "SYBIL_MUST_FORGE",
                d.must_forge_at_slot_deadline,
            ),
            forge_retry_interval_ms: env_or(
                "SYBIL_FORGE_RETRY_INTERVAL_MS",
                d.forge_retry_interval_ms,
            ),
            forge_delay_ms: env_or("SYBIL_FORGE_DELAY_MS", d.forge_delay_ms),
            forge_no_txs_delay_ms: env_or("SYBIL_FORGE_NO_TXS_DELAY_MS", d.forge_no_txs_delay_ms),
            sync_retry_interval_ms: env_or(
                "SYBIL_SYNC_RETRY_INTERVAL_MS",
                d.sync_retry_interval_ms,
            ),
            tx_manager_check_interval_ms: env_or(
                "SYBIL_TXMANAGER_CHECK_INTERVAL_MS",
                d.tx_manager_check_interval_ms,
            ),
            eth_tx_resend_timeout_ms: env_or(
                "SYBIL_ETH_TX_RESEND_TIMEOUT_MS",
                d.eth_tx_resend_timeout_ms,
            ),
            eth_no_reuse_nonce: env_flag("SYBIL_ETH_NO_REUSE_NONCE", d.eth_no_reuse_nonce),
            min_gas_price_gwei: env_or("SYBIL_MIN_GAS_PRICE_GWEI", d.min_gas_price_gwei),
            max_gas_price_gwei: env_or("SYBIL_MAX_GAS_PRICE_GWEI", d.max_gas_price_gwei),
            gas_price_inc_perc: env_or("SYBIL_GAS_PRICE_INC_PERC", d.gas_price_inc_perc),
            verifier_idx: env_or("SYBIL_VERIFIER_IDX", d.verifier_idx),
            purger: PurgerConfig {
                purge_batch_delay: env_or("SYBIL_PURGE_BATCH_DELAY", p.purge_batch_delay),
                purge_block_delay: env_or("SYBIL_PURGE_BLOCK_DELAY", p.purge_block_delay),
                invalidate_batch_delay: env_or(
                    "SYBIL_INVALIDATE_BATCH_DELAY",
                    p.invalidate_batch_delay,
                ),
                invalidate_block_delay: env_or(
                    "SYBIL_INVALIDATE_BLOCK_DELAY",
                    p.invalidate_block_delay,
                ),
                safety_period: env_or("SYBIL_PURGE_SAFETY_PERIOD", p.safety_period),
            },
            tx_processor: TxProcessorConfig::from_env(),
        }
    }

    /// See `forge_retry_interval_ms`
    pub const fn forge_retry_interval(&self) -> Duration {
        Duration::from_millis(self.forge_retry_interval_ms)
    }

    /// See `forge_delay_ms`
    pub const fn forge_delay(&self) -> Duration {
        Duration::from_millis(self.forge_delay_ms)
    }

    /// See `forge_no_txs_delay_ms`
    pub const fn forge_no_txs_delay(&self) -> Duration {
        Duration::from_millis(self.forge_no_txs_delay_ms)
    }

    /// See `sync_retry_interval_ms`
    pub const fn sync_retry_interval(&self) -> Duration {
        Duration::from_millis(self.sync_retry_interval_ms)
    }

    /// See `tx_manager_check_interval_ms`
    pub const fn tx_manager_check_interval(&self) -> Duration {
        Duration::from_millis(self.tx_manager_check_interval_ms)
    }

    /// See `eth_tx_resend_timeout_ms`
    pub const fn eth_tx_resend_timeout(&self) -> Duration {
        Duration::from_millis(self.eth_tx_resend_timeout_ms)
    }

    /// Minimum gas price in wei
    pub fn min_gas_price(&self) -> U256 {
        U256::from(self.min_gas_price_gwei) * U256::from(GWEI)
    }

    /// Maximum gas price in wei
    pub fn max_gas_price(&self) -> U256 {
        U256::from(self.max_gas_price_gwei) * U256::from(GWEI)
    }

    /// `price` increased by `gas_price_inc_perc` and clamped to the bounds
    pub fn bump_gas_price(&self, price: U256) -> U256 {
        let bumped = price * U256::from(100 + self.gas_price_inc_perc) / U256::from(100u64);
        bumped.clamp(self.min_gas_price(), self.max_gas_price().max(self.min_gas_price()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bump_gas_price() {
        let cfg = CoordinatorConfig { gas_price_inc_perc: 10, ..Default::default() };
        let gwei = U256::from(GWEI);
        assert_eq!(cfg.bump_gas_price(U256::from(10u64) * gwei), U256::from(11u64) * gwei);
        // clamped on both sides
        assert_eq!(cfg.bump_gas_price(U256::from(1u64)), gwei);
        assert_eq!(cfg.bump_gas_price(U256::from(1000u64) * gwei), U256::from(500u64) * gwei);
    }
}
