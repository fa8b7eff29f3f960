//! Proof servers

use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use alloy_primitives::U256;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sybil_core::ZKInputs;
use tracing::{debug, info};

use crate::error::{CoordError, Result};

/// Groth16 proof, in projective coordinates
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proof {
    /// `A` point
    pub pi_a: [U256; 3],
    /// `B` point
    pub pi_b: [[U256; 2]; 3],
    /// `C` point
    pub pi_c: [U256; 3],
    /// Proving system, `groth16`
    pub protocol: String,
}

/// Client of a server that computes batch proofs
#[async_trait]
pub trait ProverClient: Send + Sync + Debug {
    /// Start computing the proof of `zk_inputs`, without waiting for it
    async fn calculate_proof(&self, zk_inputs: &ZKInputs) -> Result<()>;

    /// Wait for the proof started last, with its public inputs
    async fn get_proof(&self) -> Result<(Proof, Vec<U256>)>;

    /// Abort the proof in progress
    async fn cancel(&self) -> Result<()>;

    /// Wait until the server can take a new proof
    async fn wait_ready(&self) -> Result<()>;
}

/// Prover that computes nothing
#[derive(Debug, Default)]
pub struct MockProver {
    /// Time [`ProverClient::get_proof`] takes
    pub delay: Duration,
    counter: AtomicU64,
    inputs: Mutex<Option<ZKInputs>>,
}

impl MockProver {
    /// Mock answering after `delay`
    pub fn new(delay: Duration) -> Self {
        Self { delay, ..Default::default() }
    }

    /// Proofs returned so far
    pub fn proofs(&self) -> u64 {
        self.counter.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ProverClient for MockProver {
    async fn calculate_proof(&self, zk_inputs: &ZKInputs) -> Result<()> {
        let mut inputs = self.inputs.lock();
        if inputs.is_some() {
            return Err(CoordError::Prover("busy".to_string()));
        }
        *inputs = Some(zk_inputs.clone());
        Ok(())
    }

    async fn get_proof(&self) -> Result<(Proof, Vec<U256>)> {
        tokio::time::sleep(self.delay).await;
        let inputs = self
            .inputs
            .lock()
            .take()
            .ok_or_else(|| CoordError::Prover("no proof in progress".to_string()))?;
        let n = U256::from(self.counter.fetch_add(1, Ordering::Relaxed) + 1);
        let one = U256::from(1u64);
        let proof = Proof {
            pi_a: [n, n, one],
            pi_b: [[n, n], [n, n], [one, U256::ZERO]],
            pi_c: [n, n, one],
            protocol: "groth16".to_string(),
        };
        Ok((proof, vec![inputs.metadata.new_state_root_raw]))
    }

    async fn cancel(&self) -> Result<()> {
        self.inputs.lock().take();
        Ok(())
    }

    async fn wait_ready(&self) -> Result<()> {
        Ok(())
    }
}

/// Status reported by a proof server
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProverStatus {
    /// Ready, the previous proof was aborted
    Aborted,
    /// Computing a proof
    Busy,
    /// Ready, the previous proof failed
    Failed,
    /// Ready, the previous proof succeeded
    Success,
    /// Ready, the previous proof is unverified
    Unverified,
    /// Not set up yet
    Uninitialized,
    /// Booting
    Undefined,
    /// Loading its keys
    Initializing,
    /// Ready for its first proof
    Ready,
}

impl ProverStatus {
    /// Whether a new proof can be requested
    pub const fn is_ready(self) -> bool {
        matches!(
            self,
            Self::Aborted | Self::Failed | Self::Success | Self::Unverified | Self::Ready
        )
    }

    /// Whether the server holds a proof or failed one
    pub const fn is_initialized(self) -> bool {
        !matches!(self, Self::Uninitialized | Self::Undefined | Self::Initializing)
    }
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    status: ProverStatus,
    #[serde(default)]
    proof: String,
    #[serde(default, rename = "pubData")]
    pub_data: String,
}

fn parse_decimals(v: &Value) -> Result<Vec<U256>> {
    let items = v.as_array().ok_or_else(|| CoordError::Prover(format!("expected array, got {v}")))?;
    items
        .iter()
        .map(|item| {
            item.as_str()
                .and_then(|s| U256::from_str_radix(s, 10).ok())
                .ok_or_else(|| CoordError::Prover(format!("bad field element {item}")))
        })
        .collect()
}

fn parse_point<const N: usize>(v: &Value) -> Result<[U256; N]> {
    let items = parse_decimals(v)?;
    items.try_into().map_err(|items: Vec<U256>| {
        CoordError::Prover(format!("expected {N} elements, got {}", items.len()))
    })
}

/// Parse the proof and public inputs reported by a proof server, whose
/// field elements are decimal strings
pub fn parse_proof(proof: &str, pub_data: &str) -> Result<(Proof, Vec<U256>)> {
    let p: Value =
        serde_json::from_str(proof).map_err(|e| CoordError::Prover(format!("proof: {e}")))?;
    let pi_b =
        p["pi_b"].as_array().ok_or_else(|| CoordError::Prover("missing pi_b".to_string()))?;
    if pi_b.len() != 3 {
        return Err(CoordError::Prover(format!("pi_b has {} rows", pi_b.len())));
    }
    let proof = Proof {
        pi_a: parse_point(&p["pi_a"])?,
        pi_b: [parse_point(&pi_b[0])?, parse_point(&pi_b[1])?, parse_point(&pi_b[2])?],
        pi_c: parse_point(&p["pi_c"])?,
        protocol: p["protocol"].as_str().unwrap_or_default().to_string(),
    };
    let public: Value = serde_json::from_str(pub_data)
        .map_err(|e| CoordError::Prover(format!("pubData: {e}")))?;
    Ok((proof, parse_decimals(&public)?))
}

/// HTTP client of a proof server exposing `/input`, `/status` and
/// `/cancel`
#[derive(Debug)]
pub struct ProofServerClient {
    url: String,
    poll_interval: Duration,
    http_client: reqwest::Client,
}

impl ProofServerClient {
    /// Client of the server at `url`
    pub fn new(url: impl Into<String>, poll_interval: Duration) -> Self {
        Self { url: url.into(), poll_interval, http_client: reqwest::Client::new() }
    }

    async fn status(&self) -> Result<StatusResponse> {
        let status = self
            .http_client
            .get(format!("{}/status", self.url))
            .send()
            .await?
            .error_for_status()?
            .json::<StatusResponse>()
            .await?;
        Ok(status)
    }

    async fn poll_until(&self, done: impl Fn(ProverStatus) -> bool) -> Result<StatusResponse> {
        loop {
            let status = self.status().await?;
            if done(status.status) {
                return Ok(status);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

#[async_trait]
impl ProverClient for ProofServerClient {
    async fn calculate_proof(&self, zk_inputs: &ZKInputs) -> Result<()> {
        info!("prover {}: sending inputs of batch {}", self.url, zk_inputs.current_num_batch);
        self.http_client
            .post(format!("{}/input", self.url))
            .json(zk_inputs)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn get_proof(&self) -> Result<(Proof, Vec<U256>)> {
        let status = self.poll_until(|s| s != ProverStatus::Busy).await?;
        if status.status != ProverStatus::Success {
            return Err(CoordError::Prover(format!(
                "proof finished with status {:?}",
                status.status
            )));
        }
        parse_proof(&status.proof, &status.pub_data)
    }

    async fn cancel(&self) -> Result<()> {
        debug!("prover {}: cancel", self.url);
        self.http_client.post(format!("{}/cancel", self.url)).send().await?.error_for_status()?;
        Ok(())
    }

    async fn wait_ready(&self) -> Result<()> {
        self.poll_until(ProverStatus::is_ready).await?;
        Ok(())
    }
}
