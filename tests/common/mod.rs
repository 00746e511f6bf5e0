#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use latency_indexer::config::RefreshConfig;
use latency_indexer::epoch::{EpochInfo, EpochOracle};
use latency_indexer::latency::{DeviceLinkCircuit, LatencyKind, Metro};
use latency_indexer::refresh::Refresher;
use latency_indexer::serviceability::{Device, Link, Topology, TopologySource};
use latency_indexer::store::memory::{MemoryBackend, StoredRow};
use latency_indexer::store::Store;
use latency_indexer::telemetry::{
    DeviceLatencyTail, InternetLatencySamples, SamplesHeader, TelemetryError, TelemetrySource,
};

pub const START_US: u64 = 1_600_000_000_000_000;
pub const INTERVAL_US: u64 = 100_000;

pub const PROVIDER: &str = "ripeatlas";
pub const AGENT: &str = "agent-pk";

/// Scripted telemetry source holding one growing stream per circuit and
/// epoch. Streams that were never pushed answer not-found.
#[derive(Default)]
pub struct FakeTelemetry {
    device: Mutex<HashMap<(DeviceLinkCircuit, u64), Vec<u32>>>,
    internet: Mutex<HashMap<(String, String, String, u64), Vec<u32>>>,
    failing_links: Mutex<HashSet<String>>,
    calls: AtomicUsize,
    delay: Mutex<Option<Duration>>,
    cancel_on_call: Mutex<Option<(usize, CancellationToken)>>,
}

impl FakeTelemetry {
    pub fn push_device(&self, circuit: &DeviceLinkCircuit, epoch: u64, rtts: &[u32]) {
        self.device
            .lock()
            .entry((circuit.clone(), epoch))
            .or_default()
            .extend_from_slice(rtts);
    }

    pub fn push_internet(&self, origin: &str, target: &str, epoch: u64, rtts: &[u32]) {
        self.internet
            .lock()
            .entry((PROVIDER.to_string(), origin.to_string(), target.to_string(), epoch))
            .or_default()
            .extend_from_slice(rtts);
    }

    /// Every fetch on the link fails with a transport error.
    pub fn fail_link(&self, link_pk: &str) {
        self.failing_links.lock().insert(link_pk.to_string());
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    /// Cancels `token` while serving the `nth` call (1-based).
    pub fn cancel_on_call(&self, nth: usize, token: CancellationToken) {
        *self.cancel_on_call.lock() = Some((nth, token));
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    async fn begin_call(&self) {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;

        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let token = match &*self.cancel_on_call.lock() {
            Some((nth, token)) if *nth == call => Some(token.clone()),
            _ => None,
        };
        if let Some(token) = token {
            token.cancel();
        }
    }
}

fn header(len: usize) -> SamplesHeader {
    SamplesHeader {
        start_timestamp_us: START_US,
        sampling_interval_us: INTERVAL_US,
        next_sample_index: len as u32,
    }
}

impl TelemetrySource for FakeTelemetry {
    async fn get_device_latency_samples_tail(
        &self,
        circuit: &DeviceLinkCircuit,
        epoch: u64,
        existing_max_index: i64,
    ) -> Result<DeviceLatencyTail, TelemetryError> {
        self.begin_call().await;

        if self.failing_links.lock().contains(&circuit.link_pk) {
            return Err(TelemetryError::Request(anyhow::anyhow!("connection reset")));
        }

        let device = self.device.lock();
        let Some(stream) = device.get(&(circuit.clone(), epoch)) else {
            return Err(TelemetryError::AccountNotFound);
        };

        let start = usize::try_from(existing_max_index + 1)
            .unwrap_or(0)
            .min(stream.len());
        Ok(DeviceLatencyTail {
            header: header(stream.len()),
            start_index: start as u32,
            rtts_us: stream[start..].to_vec(),
        })
    }

    async fn get_internet_latency_samples(
        &self,
        data_provider: &str,
        origin_location_pk: &str,
        target_location_pk: &str,
        agent_pk: &str,
        epoch: u64,
    ) -> Result<InternetLatencySamples, TelemetryError> {
        self.begin_call().await;

        if agent_pk != AGENT {
            return Err(TelemetryError::Request(anyhow::anyhow!("unknown agent {agent_pk}")));
        }

        let key = (
            data_provider.to_string(),
            origin_location_pk.to_string(),
            target_location_pk.to_string(),
            epoch,
        );
        let internet = self.internet.lock();
        let Some(stream) = internet.get(&key) else {
            return Err(TelemetryError::AccountNotFound);
        };

        Ok(InternetLatencySamples {
            header: header(stream.len()),
            rtts_us: stream.clone(),
        })
    }
}

pub struct FakeEpochs {
    epoch: AtomicUsize,
    failing: AtomicBool,
}

impl FakeEpochs {
    pub fn new(epoch: u64) -> Self {
        Self {
            epoch: AtomicUsize::new(epoch as usize),
            failing: AtomicBool::new(false),
        }
    }

    pub fn set_epoch(&self, epoch: u64) {
        self.epoch.store(epoch as usize, Ordering::SeqCst);
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl EpochOracle for FakeEpochs {
    async fn get_epoch_info(&self) -> Result<EpochInfo> {
        if self.failing.load(Ordering::SeqCst) {
            bail!("rpc unavailable");
        }

        Ok(EpochInfo {
            epoch: self.epoch.load(Ordering::SeqCst) as u64,
            ..Default::default()
        })
    }
}

#[derive(Default)]
pub struct FakeTopology {
    topology: Mutex<Topology>,
    failing: AtomicBool,
}

impl FakeTopology {
    pub fn new(topology: Topology) -> Self {
        Self {
            topology: Mutex::new(topology),
            failing: AtomicBool::new(false),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl TopologySource for FakeTopology {
    async fn get_topology(&self) -> Result<Topology> {
        if self.failing.load(Ordering::SeqCst) {
            bail!("directory unavailable");
        }

        Ok(self.topology.lock().clone())
    }
}

/// Devices `a`..`z` joined by the given link pks, one link per pair
/// `(a-<pk>, z-<pk>)`.
pub fn links_topology(link_pks: &[&str]) -> Topology {
    let mut topology = Topology::default();
    for pk in link_pks {
        let a = format!("a-{pk}");
        let z = format!("z-{pk}");
        topology.devices.push(Device {
            pk: a.clone(),
            code: a.clone(),
        });
        topology.devices.push(Device {
            pk: z.clone(),
            code: z.clone(),
        });
        topology.links.push(Link {
            pk: pk.to_string(),
            code: format!("{pk}-code"),
            side_a_pk: a,
            side_z_pk: z,
        });
    }
    topology
}

/// The forward circuit of a link built by [`links_topology`].
pub fn forward(link_pk: &str) -> DeviceLinkCircuit {
    DeviceLinkCircuit::new(format!("a-{link_pk}"), format!("z-{link_pk}"), link_pk)
}

pub fn metro(pk: &str, code: &str) -> Metro {
    Metro {
        pk: pk.to_string(),
        code: code.to_string(),
    }
}

pub fn refresh_config() -> RefreshConfig {
    RefreshConfig {
        max_concurrency: 4,
        data_providers: vec![PROVIDER.to_string()],
        internet_agent_pk: AGENT.to_string(),
        ..Default::default()
    }
}

pub type TestRefresher = Refresher<MemoryBackend, FakeTelemetry, FakeEpochs, FakeTopology>;

/// A refresher over an in-memory store with handles to every fake.
pub struct Harness {
    pub refresher: Arc<TestRefresher>,
    pub telemetry: Arc<FakeTelemetry>,
    pub epochs: Arc<FakeEpochs>,
    pub topology: Arc<FakeTopology>,
}

impl Harness {
    pub fn new(epoch: u64, topology: Topology) -> Self {
        Self::with_config(epoch, topology, refresh_config())
    }

    pub fn with_config(epoch: u64, topology: Topology, cfg: RefreshConfig) -> Self {
        let telemetry = Arc::new(FakeTelemetry::default());
        let epochs = Arc::new(FakeEpochs::new(epoch));
        let topology = Arc::new(FakeTopology::new(topology));
        let store = Arc::new(Store::new(MemoryBackend::new()));

        let refresher = Arc::new(Refresher::new(
            store,
            Arc::clone(&telemetry),
            Arc::clone(&epochs),
            Arc::clone(&topology),
            cfg,
        ));

        Self {
            refresher,
            telemetry,
            epochs,
            topology,
        }
    }

    pub fn backend(&self) -> &MemoryBackend {
        self.refresher.store().backend()
    }
}

/// Row content without `ingested_at`, for comparing logical state across
/// writes.
pub type RowValues = ([String; 3], u64, u32, i64, u32, bool, Option<u32>);

pub fn values(rows: &[StoredRow]) -> Vec<RowValues> {
    rows.iter()
        .map(|r| {
            (
                r.key.clone(),
                r.epoch,
                r.sample_index,
                r.event_ts.timestamp_micros(),
                r.rtt_us,
                r.is_loss,
                r.ipdv_us,
            )
        })
        .collect()
}

pub fn final_values(backend: &MemoryBackend, kind: LatencyKind) -> Vec<RowValues> {
    values(&backend.rows_final(kind))
}
