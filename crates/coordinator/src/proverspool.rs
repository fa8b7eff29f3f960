//! Pool of idle proof servers

use std::sync::Arc;

use tokio::sync::{mpsc, watch, Mutex};
use tracing::{info, warn};

use crate::error::{CoordError, Result};
use crate::prover::ProverClient;

/// Bounded queue of idle provers. A prover is taken out while it computes
/// a proof and put back once the proof is retrieved.
#[derive(Debug)]
pub struct ProversPool {
    tx: mpsc::Sender<Arc<dyn ProverClient>>,
    rx: Mutex<mpsc::Receiver<Arc<dyn ProverClient>>>,
}

impl ProversPool {
    /// Pool holding at most `max_provers`
    pub fn new(max_provers: usize) -> Self {
        let (tx, rx) = mpsc::channel(max_provers.max(1));
        Self { tx, rx: Mutex::new(rx) }
    }

    /// Return a prover to the pool
    pub fn add(&self, prover: Arc<dyn ProverClient>) {
        if self.tx.try_send(prover).is_err() {
            warn!("provers pool full, dropping prover");
        }
    }

    /// Wait for an idle prover. Returns [`CoordError::Done`] on cancel.
    pub async fn get(&self, cancel: &mut watch::Receiver<bool>) -> Result<Arc<dyn ProverClient>> {
        if *cancel.borrow() {
            return Err(CoordError::Done);
        }
        let mut rx = self.rx.lock().await;
        tokio::select! {
            prover = rx.recv() => prover.ok_or(CoordError::ChannelClosed("provers pool")),
            _ = cancel.changed() => {
                info!("provers pool get: done");
                Err(CoordError::Done)
            }
        }
    }
}
