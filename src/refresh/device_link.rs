use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::epoch::EpochOracle;
use crate::latency::{
    sample_time, Circuit, DeviceLinkCircuit, DeviceLinkLatencySample, EpochKey, HighWaterMarks,
    NO_SAMPLES,
};
use crate::serviceability::TopologySource;
use crate::store::LatencyBackend;
use crate::telemetry::{DeviceLatencyTail, TelemetryError, TelemetrySource};

use super::{fan_out, Job, RefreshError, RefreshOutcome, Refresher};

/// Turns a fetched tail into samples, keeping only indices above
/// `existing_max_index`.
///
/// Sample indices are the remote ones, `start_index + offset`.
pub fn device_tail_samples(
    circuit: &DeviceLinkCircuit,
    epoch: u64,
    existing_max_index: i64,
    tail: &DeviceLatencyTail,
) -> Vec<DeviceLinkLatencySample> {
    let header = &tail.header;
    let mut samples = Vec::with_capacity(tail.rtts_us.len());

    for (offset, &rtt_us) in tail.rtts_us.iter().enumerate() {
        let Some(sample_index) = u32::try_from(offset)
            .ok()
            .and_then(|offset| tail.start_index.checked_add(offset))
        else {
            break;
        };

        if i64::from(sample_index) <= existing_max_index {
            continue;
        }

        let time = sample_time(
            header.start_timestamp_us,
            header.sampling_interval_us,
            sample_index,
        );
        samples.push(DeviceLinkLatencySample::new(
            circuit,
            epoch,
            sample_index,
            time,
            rtt_us,
        ));
    }

    samples
}

impl<B, T, E, P> Refresher<B, T, E, P>
where
    B: LatencyBackend,
    T: TelemetrySource,
    E: EpochOracle,
    P: TopologySource,
{
    /// Fetches and appends every device-link sample newer than what the
    /// store holds, for the current and previous epoch.
    pub async fn refresh_device_link(
        &self,
        cancel: &CancellationToken,
    ) -> Result<RefreshOutcome, RefreshError> {
        let start = Instant::now();
        let result = self.run_device_link_refresh(cancel).await;
        self.record_cycle(DeviceLinkCircuit::KIND, &result, start);
        result
    }

    /// Re-fetches the full range of every device-link circuit for one
    /// epoch. Safe to repeat and to run alongside refreshes.
    pub async fn backfill_device_link(
        &self,
        epoch: u64,
        cancel: &CancellationToken,
    ) -> Result<RefreshOutcome, RefreshError> {
        let start = Instant::now();
        let result = self.run_device_link(vec![epoch], None, cancel).await;
        self.record_cycle(DeviceLinkCircuit::KIND, &result, start);

        if let Ok(outcome) = &result {
            info!(
                kind = %DeviceLinkCircuit::KIND,
                epoch,
                circuits = outcome.circuits,
                samples = outcome.samples,
                failed = outcome.failed_fetches,
                "device-link backfill complete",
            );
        }

        result
    }

    async fn run_device_link_refresh(
        &self,
        cancel: &CancellationToken,
    ) -> Result<RefreshOutcome, RefreshError> {
        let epochs = self.current_epochs().await?;
        let marks = self
            .store
            .get_existing_device_link_max_sample_indices()
            .await
            .map_err(RefreshError::HighWaterMarks)?;

        let outcome = self.run_device_link(epochs.clone(), Some(marks), cancel).await?;

        info!(
            kind = %DeviceLinkCircuit::KIND,
            epochs = ?epochs,
            circuits = outcome.circuits,
            fetches = outcome.fetches,
            samples = outcome.samples,
            failed = outcome.failed_fetches,
            cancelled = outcome.cancelled,
            "device-link refresh complete",
        );

        Ok(outcome)
    }

    /// Shared body of refresh and backfill. `marks` of `None` fetches
    /// every circuit from the start.
    async fn run_device_link(
        &self,
        epochs: Vec<u64>,
        marks: Option<HighWaterMarks<DeviceLinkCircuit>>,
        cancel: &CancellationToken,
    ) -> Result<RefreshOutcome, RefreshError> {
        let topology = self
            .topology
            .get_topology()
            .await
            .map_err(RefreshError::Topology)?;
        let circuits = topology.device_link_circuits();

        let mut jobs = Vec::with_capacity(circuits.len() * epochs.len());
        for circuit in &circuits {
            for &epoch in &epochs {
                let existing_max_index = marks
                    .as_ref()
                    .and_then(|m| m.get(&EpochKey::new(circuit.clone(), epoch)))
                    .copied()
                    .unwrap_or(NO_SAMPLES);
                jobs.push(Job {
                    circuit: circuit.clone(),
                    epoch,
                    existing_max_index,
                });
            }
        }

        let telemetry = Arc::clone(&self.telemetry);
        let fetched = fan_out(
            DeviceLinkCircuit::KIND,
            jobs,
            self.cfg.max_concurrency,
            cancel,
            self.health.clone(),
            move |job: Job<DeviceLinkCircuit>| {
                let telemetry = Arc::clone(&telemetry);
                async move {
                    let tail = telemetry
                        .get_device_latency_samples_tail(
                            &job.circuit,
                            job.epoch,
                            job.existing_max_index,
                        )
                        .await?;
                    Ok::<_, TelemetryError>(device_tail_samples(
                        &job.circuit,
                        job.epoch,
                        job.existing_max_index,
                        &tail,
                    ))
                }
            },
        )
        .await;

        if !fetched.samples.is_empty() {
            self.store
                .append_device_link_latency_samples(&fetched.samples)
                .await
                .map_err(RefreshError::Append)?;
        }

        Ok(RefreshOutcome {
            circuits: circuits.len(),
            fetches: fetched.fetches,
            samples: fetched.samples.len(),
            failed_fetches: fetched.failed,
            cancelled: fetched.cancelled,
        })
    }
}
