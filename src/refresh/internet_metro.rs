use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::epoch::EpochOracle;
use crate::latency::{
    sample_time, Circuit, EpochKey, HighWaterMarks, InternetMetroCircuit,
    InternetMetroLatencySample, NO_SAMPLES,
};
use crate::serviceability::TopologySource;
use crate::store::LatencyBackend;
use crate::telemetry::{InternetLatencySamples, TelemetryError, TelemetrySource};

use super::{fan_out, Job, RefreshError, RefreshOutcome, Refresher};

/// Turns a full internet sample range into samples above
/// `existing_max_index`. The source has no tail query, so the filter
/// happens here.
pub fn internet_samples_after(
    circuit: &InternetMetroCircuit,
    epoch: u64,
    existing_max_index: i64,
    fetched: &InternetLatencySamples,
) -> Vec<InternetMetroLatencySample> {
    let header = &fetched.header;
    let skip = usize::try_from(existing_max_index.saturating_add(1)).unwrap_or(0);

    fetched
        .rtts_us
        .iter()
        .enumerate()
        .skip(skip)
        .map_while(|(index, &rtt_us)| {
            let sample_index = u32::try_from(index).ok()?;
            let time = sample_time(
                header.start_timestamp_us,
                header.sampling_interval_us,
                sample_index,
            );
            Some(InternetMetroLatencySample::new(
                circuit,
                epoch,
                sample_index,
                time,
                rtt_us,
            ))
        })
        .collect()
}

impl<B, T, E, P> Refresher<B, T, E, P>
where
    B: LatencyBackend,
    T: TelemetrySource,
    E: EpochOracle,
    P: TopologySource,
{
    /// Fetches and appends every internet-metro sample newer than what
    /// the store holds, for the current and previous epoch.
    pub async fn refresh_internet_metro(
        &self,
        cancel: &CancellationToken,
    ) -> Result<RefreshOutcome, RefreshError> {
        let start = Instant::now();
        let result = self.run_internet_metro_refresh(cancel).await;
        self.record_cycle(InternetMetroCircuit::KIND, &result, start);
        result
    }

    /// Re-fetches the full range of every internet-metro circuit for one
    /// epoch.
    pub async fn backfill_internet_metro(
        &self,
        epoch: u64,
        cancel: &CancellationToken,
    ) -> Result<RefreshOutcome, RefreshError> {
        let start = Instant::now();
        let result = self.run_internet_metro(vec![epoch], None, cancel).await;
        self.record_cycle(InternetMetroCircuit::KIND, &result, start);

        if let Ok(outcome) = &result {
            info!(
                kind = %InternetMetroCircuit::KIND,
                epoch,
                circuits = outcome.circuits,
                samples = outcome.samples,
                failed = outcome.failed_fetches,
                "internet-metro backfill complete",
            );
        }

        result
    }

    async fn run_internet_metro_refresh(
        &self,
        cancel: &CancellationToken,
    ) -> Result<RefreshOutcome, RefreshError> {
        let epochs = self.current_epochs().await?;
        let marks = self
            .store
            .get_existing_internet_metro_max_sample_indices()
            .await
            .map_err(RefreshError::HighWaterMarks)?;

        let outcome = self
            .run_internet_metro(epochs.clone(), Some(marks), cancel)
            .await?;

        info!(
            kind = %InternetMetroCircuit::KIND,
            epochs = ?epochs,
            circuits = outcome.circuits,
            fetches = outcome.fetches,
            samples = outcome.samples,
            failed = outcome.failed_fetches,
            cancelled = outcome.cancelled,
            "internet-metro refresh complete",
        );

        Ok(outcome)
    }

    async fn run_internet_metro(
        &self,
        epochs: Vec<u64>,
        marks: Option<HighWaterMarks<InternetMetroCircuit>>,
        cancel: &CancellationToken,
    ) -> Result<RefreshOutcome, RefreshError> {
        let topology = self
            .topology
            .get_topology()
            .await
            .map_err(RefreshError::Topology)?;
        let circuits = topology.internet_metro_circuits(&self.cfg.data_providers);

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
        let agent_pk: Arc<str> = Arc::from(self.cfg.internet_agent_pk.as_str());
        let fetched = fan_out(
            InternetMetroCircuit::KIND,
            jobs,
            self.cfg.max_concurrency,
            cancel,
            self.health.clone(),
            move |job: Job<InternetMetroCircuit>| {
                let telemetry = Arc::clone(&telemetry);
                let agent_pk = Arc::clone(&agent_pk);
                async move {
                    let c = &job.circuit;
                    let fetched = telemetry
                        .get_internet_latency_samples(
                            &c.data_provider,
                            &c.origin_metro_pk,
                            &c.target_metro_pk,
                            &agent_pk,
                            job.epoch,
                        )
                        .await?;
                    Ok::<_, TelemetryError>(internet_samples_after(
                        c,
                        job.epoch,
                        job.existing_max_index,
                        &fetched,
                    ))
                }
            },
        )
        .await;

        if !fetched.samples.is_empty() {
            self.store
                .append_internet_metro_latency_samples(&fetched.samples)
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
