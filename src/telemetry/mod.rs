//! Remote telemetry source.
//!
//! Each circuit's samples for an epoch live in one append-only,
//! fixed-interval stream owned by the telemetry program. The source is read
//! through a gateway that exposes those streams as JSON.

use std::future::Future;

use reqwest::Url;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::config::TelemetryConfig;
use crate::http::{join_segments, JsonClient, MetricsCallback, RequestError};
use crate::latency::{DeviceLinkCircuit, NO_SAMPLES};

/// Stream header shared by both circuit kinds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct SamplesHeader {
    pub start_timestamp_us: u64,
    pub sampling_interval_us: u64,
    pub next_sample_index: u32,
}

/// Samples after a known index on a device-link circuit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceLatencyTail {
    pub header: SamplesHeader,
    /// Remote index of `rtts_us[0]`.
    pub start_index: u32,
    pub rtts_us: Vec<u32>,
}

/// The full sample range of an internet-metro circuit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InternetLatencySamples {
    pub header: SamplesHeader,
    pub rtts_us: Vec<u32>,
}

/// Errors from the telemetry source.
#[derive(Error, Debug)]
pub enum TelemetryError {
    /// No samples account exists for the circuit and epoch yet.
    #[error("telemetry account not found")]
    AccountNotFound,

    #[error(transparent)]
    Request(#[from] anyhow::Error),
}

impl From<RequestError> for TelemetryError {
    fn from(e: RequestError) -> Self {
        if e.is_not_found() {
            Self::AccountNotFound
        } else {
            Self::Request(anyhow::Error::new(e))
        }
    }
}

/// Telemetry source trait.
pub trait TelemetrySource: Send + Sync + 'static {
    /// Samples with index greater than `existing_max_index`;
    /// [`NO_SAMPLES`] returns the whole stream.
    fn get_device_latency_samples_tail(
        &self,
        circuit: &DeviceLinkCircuit,
        epoch: u64,
        existing_max_index: i64,
    ) -> impl Future<Output = Result<DeviceLatencyTail, TelemetryError>> + Send;

    /// The whole stream for an internet-metro circuit as reported by one
    /// data provider's collector agent.
    fn get_internet_latency_samples(
        &self,
        data_provider: &str,
        origin_location_pk: &str,
        target_location_pk: &str,
        agent_pk: &str,
        epoch: u64,
    ) -> impl Future<Output = Result<InternetLatencySamples, TelemetryError>> + Send;
}

/// HTTP client for the telemetry gateway.
pub struct Client {
    json: JsonClient,
}

impl Client {
    /// Create a new telemetry client.
    pub fn new(cfg: &TelemetryConfig) -> anyhow::Result<Self> {
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

// --- JSON response structures ---

#[derive(Deserialize)]
struct DeviceSamplesResponse {
    #[serde(flatten)]
    header: SamplesHeader,
    #[serde(default)]
    start_index: u32,
    #[serde(default)]
    samples: Vec<u32>,
}

#[derive(Deserialize)]
struct InternetSamplesResponse {
    #[serde(flatten)]
    header: SamplesHeader,
    #[serde(default)]
    samples: Vec<u32>,
}

fn device_samples_url(
    base: &Url,
    circuit: &DeviceLinkCircuit,
    epoch: u64,
    existing_max_index: i64,
) -> anyhow::Result<Url> {
    let epoch = epoch.to_string();
    let mut url = join_segments(
        base,
        &[
            "v1",
            "device-latency-samples",
            circuit.origin_device_pk.as_str(),
            circuit.target_device_pk.as_str(),
            circuit.link_pk.as_str(),
            epoch.as_str(),
        ],
    )?;
    if existing_max_index > NO_SAMPLES {
        url.query_pairs_mut()
            .append_pair("after", &existing_max_index.to_string());
    }
    Ok(url)
}

fn internet_samples_url(
    base: &Url,
    data_provider: &str,
    origin_location_pk: &str,
    target_location_pk: &str,
    agent_pk: &str,
    epoch: u64,
) -> anyhow::Result<Url> {
    join_segments(
        base,
        &[
            "v1",
            "internet-latency-samples",
            data_provider,
            origin_location_pk,
            target_location_pk,
            agent_pk,
            epoch.to_string().as_str(),
        ],
    )
}

impl TelemetrySource for Client {
    async fn get_device_latency_samples_tail(
        &self,
        circuit: &DeviceLinkCircuit,
        epoch: u64,
        existing_max_index: i64,
    ) -> Result<DeviceLatencyTail, TelemetryError> {
        debug!(circuit = %circuit.link_pk, epoch, existing_max_index, "fetching device latency tail");

        let url = device_samples_url(self.json.base(), circuit, epoch, existing_max_index)?;
        let resp: DeviceSamplesResponse = self.json.get_json("device_latency_samples", url).await?;

        Ok(DeviceLatencyTail {
            header: resp.header,
            start_index: resp.start_index,
            rtts_us: resp.samples,
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
        debug!(data_provider, epoch, "fetching internet latency samples");

        let url = internet_samples_url(
            self.json.base(),
            data_provider,
            origin_location_pk,
            target_location_pk,
            agent_pk,
            epoch,
        )?;
        let resp: InternetSamplesResponse =
            self.json.get_json("internet_latency_samples", url).await?;

        Ok(InternetLatencySamples {
            header: resp.header,
            rtts_us: resp.samples,
        })
    }
}
