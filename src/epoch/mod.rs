use std::future::Future;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::SolanaConfig;
use crate::http::{JsonClient, MetricsCallback};

/// Current position of the ledger clock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EpochInfo {
    pub epoch: u64,
    #[serde(default)]
    pub slot_index: u64,
    #[serde(default)]
    pub slots_in_epoch: u64,
    #[serde(default)]
    pub absolute_slot: u64,
}

impl EpochInfo {
    /// The epochs a refresh cycle covers: the current one and the one
    /// before it, newest first.
    pub fn refresh_window(&self) -> Vec<u64> {
        match self.epoch.checked_sub(1) {
            Some(previous) => vec![self.epoch, previous],
            None => vec![self.epoch],
        }
    }
}

/// Epoch oracle trait.
pub trait EpochOracle: Send + Sync + 'static {
    fn get_epoch_info(&self) -> impl Future<Output = Result<EpochInfo>> + Send;
}

/// Solana JSON-RPC client answering `getEpochInfo`.
pub struct RpcClient {
    json: JsonClient,
}

impl RpcClient {
    /// Create a new RPC client.
    pub fn new(cfg: &SolanaConfig) -> Result<Self> {
        Ok(Self {
            json: JsonClient::new(&cfg.rpc_url, cfg.timeout)?,
        })
    }

    /// Set a metrics callback for recording request stats.
    pub fn with_metrics(mut self, cb: MetricsCallback) -> Self {
        self.json = self.json.with_metrics(cb);
        self
    }
}

// --- JSON-RPC envelope ---

#[derive(Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: [CommitmentParam; 1],
}

#[derive(Serialize)]
struct CommitmentParam {
    commitment: &'static str,
}

#[derive(Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcErrorObject>,
}

#[derive(Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

fn epoch_info_request() -> RpcRequest<'static> {
    RpcRequest {
        jsonrpc: "2.0",
        id: 1,
        method: "getEpochInfo",
        params: [CommitmentParam {
            commitment: "finalized",
        }],
    }
}

fn unwrap_rpc<T>(resp: RpcResponse<T>, method: &str) -> Result<T> {
    if let Some(err) = resp.error {
        bail!("{method} failed: {} (code {})", err.message, err.code);
    }

    match resp.result {
        Some(result) => Ok(result),
        None => bail!("{method} returned neither result nor error"),
    }
}

impl EpochOracle for RpcClient {
    async fn get_epoch_info(&self) -> Result<EpochInfo> {
        let resp: RpcResponse<EpochInfo> = self
            .json
            .post_json("get_epoch_info", &epoch_info_request())
            .await
            .context("requesting epoch info")?;

        let info = unwrap_rpc(resp, "getEpochInfo")?;
        debug!(epoch = info.epoch, slot = info.absolute_slot, "fetched epoch info");

        Ok(info)
    }
}
