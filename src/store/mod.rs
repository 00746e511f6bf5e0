pub mod backend;
pub mod clickhouse;
pub mod ipdv;
pub mod memory;

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::export::health::HealthMetrics;
use crate::latency::{
    Circuit, DeviceLinkCircuit, DeviceLinkLatencySample, HighWaterMarks, InternetMetroCircuit,
    InternetMetroLatencySample, LatencyKind, LatencySample,
};

pub use backend::{LatencyBackend, LatencyRow, PreviousRtt, RawBoundaries};

/// Default number of most recent epochs scanned for high-water marks.
pub const DEFAULT_HWM_WINDOW_EPOCHS: u64 = 2;

/// Data extent of one fact table. All bounds are `None` when the table is
/// empty.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DataBoundaries {
    pub min_time: Option<DateTime<Utc>>,
    pub max_time: Option<DateTime<Utc>>,
    pub min_epoch: Option<u64>,
    pub max_epoch: Option<u64>,
    pub row_count: u64,
}

impl From<RawBoundaries> for DataBoundaries {
    fn from(raw: RawBoundaries) -> Self {
        if raw.row_count == 0 {
            return Self::default();
        }

        Self {
            min_time: DateTime::from_timestamp_micros(raw.min_time_us),
            max_time: DateTime::from_timestamp_micros(raw.max_time_us),
            min_epoch: Some(raw.min_epoch),
            max_epoch: Some(raw.max_epoch),
            row_count: raw.row_count,
        }
    }
}

/// Latency telemetry store.
///
/// Owns every write to the latency fact tables. Holds no state between
/// calls beyond what lives in the backend, so any number of refresh and
/// backfill cycles may share one store or use separate ones.
pub struct Store<B> {
    backend: B,
    hwm_window_epochs: u64,
    health: Option<Arc<HealthMetrics>>,
}

impl<B: LatencyBackend> Store<B> {
    /// Creates a store over the given backend.
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            hwm_window_epochs: DEFAULT_HWM_WINDOW_EPOCHS,
            health: None,
        }
    }

    /// Sets how many recent epochs high-water-mark queries scan.
    pub fn with_hwm_window_epochs(mut self, epochs: u64) -> Self {
        self.hwm_window_epochs = epochs.max(1);
        self
    }

    /// Attaches health metrics for append counters.
    pub fn with_health(mut self, health: Arc<HealthMetrics>) -> Self {
        self.health = Some(health);
        self
    }

    /// Returns the underlying backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub async fn get_existing_device_link_max_sample_indices(
        &self,
    ) -> Result<HighWaterMarks<DeviceLinkCircuit>> {
        self.existing_max_sample_indices().await
    }

    pub async fn get_existing_internet_metro_max_sample_indices(
        &self,
    ) -> Result<HighWaterMarks<InternetMetroCircuit>> {
        self.existing_max_sample_indices().await
    }

    pub async fn append_device_link_latency_samples(
        &self,
        samples: &[DeviceLinkLatencySample],
    ) -> Result<()> {
        self.append_samples(samples).await
    }

    pub async fn append_internet_metro_latency_samples(
        &self,
        samples: &[InternetMetroLatencySample],
    ) -> Result<()> {
        self.append_samples(samples).await
    }

    pub async fn get_device_link_latency_boundaries(&self) -> Result<DataBoundaries> {
        self.boundaries(LatencyKind::DeviceLink).await
    }

    pub async fn get_internet_metro_latency_boundaries(&self) -> Result<DataBoundaries> {
        self.boundaries(LatencyKind::InternetMetro).await
    }

    /// Max stored sample index per circuit + epoch over the recent window.
    pub async fn existing_max_sample_indices<C: Circuit>(&self) -> Result<HighWaterMarks<C>> {
        let start = Instant::now();
        let marks = self
            .backend
            .max_sample_indices::<C>(self.hwm_window_epochs)
            .await
            .with_context(|| format!("querying {} high-water marks", C::KIND))?;

        self.observe("max_sample_indices", start);
        debug!(kind = %C::KIND, entries = marks.len(), "loaded high-water marks");

        Ok(marks)
    }

    /// Appends an unordered batch, deriving IPDV against the latest RTT
    /// stored before each circuit + epoch run of the batch.
    ///
    /// Nothing is written if the previous-RTT lookup fails. The whole batch
    /// can be resubmitted after an insert failure; a resubmission derives
    /// the same IPDV values as the first attempt.
    pub async fn append_samples<S: LatencySample>(&self, samples: &[S]) -> Result<()> {
        if samples.is_empty() {
            return Ok(());
        }

        let kind = <S::Circuit as Circuit>::KIND;

        let mut sorted = samples.to_vec();
        ipdv::sort_samples(&mut sorted);
        let starts = ipdv::run_starts(&sorted);

        let start = Instant::now();
        let previous = self
            .backend
            .latest_rtts_before(&starts)
            .await
            .with_context(|| format!("querying previous {kind} RTTs"))?;
        self.observe("latest_rtts_before", start);

        let rows = ipdv::compute_ipdv(sorted, previous);
        let ingested_at = Utc::now();

        let start = Instant::now();
        if let Err(e) = self.backend.insert_rows(&rows, ingested_at).await {
            if let Some(health) = &self.health {
                health
                    .clickhouse_batch_errors
                    .with_label_values(&[kind.table()])
                    .inc();
            }
            return Err(e).with_context(|| format!("inserting {} {kind} rows", rows.len()));
        }
        self.observe("insert", start);

        if let Some(health) = &self.health {
            health
                .samples_appended
                .with_label_values(&[kind.as_str()])
                .inc_by(rows.len() as f64);
        }

        debug!(
            kind = %kind,
            rows = rows.len(),
            runs = starts.len(),
            "appended latency samples",
        );

        Ok(())
    }

    /// Data extent of a fact table.
    pub async fn boundaries(&self, kind: LatencyKind) -> Result<DataBoundaries> {
        let raw = self
            .backend
            .boundaries(kind)
            .await
            .with_context(|| format!("querying {kind} boundaries"))?;

        Ok(raw.into())
    }

    /// Collapses duplicate rows of a fact table.
    pub async fn optimize_final(&self, kind: LatencyKind) -> Result<()> {
        let start = Instant::now();
        self.backend
            .optimize_final(kind)
            .await
            .with_context(|| format!("optimizing {kind} table"))?;
        self.observe("optimize_final", start);
        Ok(())
    }

    fn observe(&self, operation: &str, start: Instant) {
        if let Some(health) = &self.health {
            health
                .clickhouse_batch_duration
                .with_label_values(&[operation])
                .observe(start.elapsed().as_secs_f64());
        }
    }
}
