//! Topology directory.
//!
//! The serviceability program registers devices, the links between them
//! and the metros they sit in. A refresh cycle reads one snapshot and
//! derives its circuits from it.

use std::future::Future;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::debug;

use crate::config::ServiceabilityConfig;
use crate::http::{join_segments, JsonClient, MetricsCallback};
use crate::latency::{metro_pairs, DeviceLinkCircuit, InternetMetroCircuit, Metro};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Device {
    pub pk: String,
    pub code: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Link {
    pub pk: String,
    pub code: String,
    pub side_a_pk: String,
    pub side_z_pk: String,
}

/// A point-in-time view of the network.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Topology {
    #[serde(default)]
    pub devices: Vec<Device>,
    #[serde(default)]
    pub links: Vec<Link>,
    #[serde(default)]
    pub metros: Vec<Metro>,
}

impl Topology {
    /// Both directions of every link.
    pub fn device_link_circuits(&self) -> Vec<DeviceLinkCircuit> {
        let mut circuits = Vec::with_capacity(self.links.len() * 2);
        for link in &self.links {
            let forward = DeviceLinkCircuit::new(
                link.side_a_pk.as_str(),
                link.side_z_pk.as_str(),
                link.pk.as_str(),
            );
            circuits.push(forward.reversed());
            circuits.push(forward);
        }
        circuits.sort();
        circuits.dedup();
        circuits
    }

    /// One canonical circuit per unordered metro pair per data provider.
    pub fn internet_metro_circuits(&self, data_providers: &[String]) -> Vec<InternetMetroCircuit> {
        let pairs = metro_pairs(&self.metros);
        let mut circuits = Vec::with_capacity(pairs.len() * data_providers.len());
        for (origin, target) in &pairs {
            for provider in data_providers {
                if let Some(circuit) = InternetMetroCircuit::canonical(origin, target, provider.as_str()) {
                    circuits.push(circuit);
                }
            }
        }
        circuits
    }
}

/// Topology source trait.
pub trait TopologySource: Send + Sync + 'static {
    fn get_topology(&self) -> impl Future<Output = Result<Topology>> + Send;
}

/// HTTP client for the topology directory.
pub struct Client {
    json: JsonClient,
}

impl Client {
    /// Create a new directory client.
    pub fn new(cfg: &ServiceabilityConfig) -> Result<Self> {
        Ok(Self {
            json: JsonClient::new(&cfg.endpoint, cfg.timeout)?,
        })
    }

    /// Set a metrics callback for recording request stats.
    pub fn with_metrics(mut self, cb: MetricsCallback) -> Self {
        self.json = self.json.with_metrics(cb);
        self
    }
}

impl TopologySource for Client {
    async fn get_topology(&self) -> Result<Topology> {
        let url = join_segments(self.json.base(), &["v1", "topology"])?;
        let topology: Topology = self
            .json
            .get_json("topology", url)
            .await
            .context("fetching topology")?;

        debug!(
            devices = topology.devices.len(),
            links = topology.links.len(),
            metros = topology.metros.len(),
            "fetched topology",
        );

        Ok(topology)
    }
}
