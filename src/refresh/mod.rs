//! Incremental refresh and backfill engines.
//!
//! A cycle reads the current epoch and topology, loads high-water marks
//! from the store, fans out one remote fetch per circuit + epoch and
//! appends the union of new samples in a single store call. Nothing
//! survives between cycles: the marks are always re-derived from the
//! fact tables, so a failed cycle is simply retried by the next one.

mod device_link;
mod internet_metro;

pub use device_link::device_tail_samples;
pub use internet_metro::internet_samples_after;

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::RefreshConfig;
use crate::epoch::EpochOracle;
use crate::export::health::HealthMetrics;
use crate::latency::{Circuit, LatencyKind};
use crate::serviceability::TopologySource;
use crate::store::{LatencyBackend, Store};
use crate::telemetry::{TelemetryError, TelemetrySource};

/// Summary of one refresh or backfill cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshOutcome {
    /// Circuits derived from the topology snapshot.
    pub circuits: usize,
    /// Remote fetches launched.
    pub fetches: usize,
    /// New samples handed to the store.
    pub samples: usize,
    /// Fetches that failed with something other than not-found.
    pub failed_fetches: usize,
    /// Whether the cycle stopped early on cancellation. Samples collected
    /// before that are still appended.
    pub cancelled: bool,
}

/// Cycle-fatal errors. Per-circuit fetch failures are not among them.
#[derive(Error, Debug)]
pub enum RefreshError {
    #[error("determining current epoch: {0:#}")]
    Epoch(anyhow::Error),

    #[error("loading topology: {0:#}")]
    Topology(anyhow::Error),

    #[error("loading high-water marks: {0:#}")]
    HighWaterMarks(anyhow::Error),

    #[error("appending samples: {0:#}")]
    Append(anyhow::Error),
}

/// Refresh and backfill engine for both circuit kinds.
pub struct Refresher<B, T, E, P> {
    store: Arc<Store<B>>,
    telemetry: Arc<T>,
    epochs: Arc<E>,
    topology: Arc<P>,
    cfg: RefreshConfig,
    health: Option<Arc<HealthMetrics>>,
}

impl<B, T, E, P> Refresher<B, T, E, P>
where
    B: LatencyBackend,
    T: TelemetrySource,
    E: EpochOracle,
    P: TopologySource,
{
    pub fn new(
        store: Arc<Store<B>>,
        telemetry: Arc<T>,
        epochs: Arc<E>,
        topology: Arc<P>,
        cfg: RefreshConfig,
    ) -> Self {
        Self {
            store,
            telemetry,
            epochs,
            topology,
            cfg,
            health: None,
        }
    }

    /// Attaches health metrics for cycle and fetch counters.
    pub fn with_health(mut self, health: Arc<HealthMetrics>) -> Self {
        self.health = Some(health);
        self
    }

    pub fn store(&self) -> &Arc<Store<B>> {
        &self.store
    }

    async fn current_epochs(&self) -> Result<Vec<u64>, RefreshError> {
        let info = self
            .epochs
            .get_epoch_info()
            .await
            .map_err(RefreshError::Epoch)?;

        if let Some(health) = &self.health {
            health.current_epoch.set(info.epoch as f64);
        }

        Ok(info.refresh_window())
    }

    fn record_cycle(
        &self,
        kind: LatencyKind,
        result: &Result<RefreshOutcome, RefreshError>,
        start: Instant,
    ) {
        let Some(health) = &self.health else {
            return;
        };

        let status = match result {
            Ok(outcome) if outcome.cancelled => "cancelled",
            Ok(_) => "success",
            Err(_) => "error",
        };

        health
            .refresh_cycles
            .with_label_values(&[kind.as_str(), status])
            .inc();
        health
            .refresh_cycle_duration
            .with_label_values(&[kind.as_str()])
            .observe(start.elapsed().as_secs_f64());

        if let Ok(outcome) = result {
            health
                .circuits_tracked
                .with_label_values(&[kind.as_str()])
                .set(outcome.circuits as f64);
        }
    }
}

/// One remote fetch: a circuit, an epoch and the index already stored.
#[derive(Debug, Clone)]
pub(crate) struct Job<C> {
    pub circuit: C,
    pub epoch: u64,
    pub existing_max_index: i64,
}

/// What a fan-out collected.
#[derive(Debug)]
pub(crate) struct FanOut<S> {
    pub samples: Vec<S>,
    pub fetches: usize,
    pub failed: usize,
    pub cancelled: bool,
}

/// Runs one fetch per job with at most `max_concurrency` in flight.
///
/// Not-found yields nothing. Other errors are logged and counted; they
/// never fail the fan-out. On cancellation no further job is launched,
/// in-flight fetches are dropped, and whatever already arrived is
/// returned.
pub(crate) async fn fan_out<C, S, F, Fut>(
    kind: LatencyKind,
    jobs: Vec<Job<C>>,
    max_concurrency: usize,
    cancel: &CancellationToken,
    health: Option<Arc<HealthMetrics>>,
    fetch: F,
) -> FanOut<S>
where
    C: Circuit,
    S: Send + 'static,
    F: Fn(Job<C>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<S>, TelemetryError>> + Send + 'static,
{
    let fetch = Arc::new(fetch);
    let semaphore = Arc::new(Semaphore::new(max_concurrency.max(1)));
    let collected: Arc<Mutex<Vec<S>>> = Arc::new(Mutex::new(Vec::new()));
    let failed = Arc::new(AtomicUsize::new(0));

    let mut in_flight = JoinSet::new();
    let mut fetches = 0;

    for job in jobs {
        if cancel.is_cancelled() {
            break;
        }

        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            permit = semaphore.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(e) => {
                    warn!(kind = %kind, error = %e, "fetch semaphore closed");
                    break;
                }
            },
        };

        fetches += 1;

        let fetch = fetch.clone();
        let collected = collected.clone();
        let failed = failed.clone();
        let cancel = cancel.clone();
        let health = health.clone();

        in_flight.spawn(async move {
            let _permit = permit;
            let circuit = job.circuit.key();
            let epoch = job.epoch;

            if let Some(h) = &health {
                h.fetches_in_flight.with_label_values(&[kind.as_str()]).inc();
            }
            let start = Instant::now();

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                result = fetch(job) => Some(result),
            };

            if let Some(h) = &health {
                h.fetches_in_flight.with_label_values(&[kind.as_str()]).dec();
            }

            let outcome = match result {
                None => {
                    debug!(kind = %kind, circuit = %circuit, epoch, "fetch aborted by cancellation");
                    "cancelled"
                }
                Some(Ok(samples)) => {
                    if !samples.is_empty() {
                        collected.lock().extend(samples);
                    }
                    "success"
                }
                Some(Err(TelemetryError::AccountNotFound)) => {
                    debug!(kind = %kind, circuit = %circuit, epoch, "no samples account yet");
                    "not_found"
                }
                Some(Err(TelemetryError::Request(e))) => {
                    warn!(kind = %kind, circuit = %circuit, epoch, error = %e, "fetching latency samples");
                    failed.fetch_add(1, Ordering::Relaxed);
                    "error"
                }
            };

            if let Some(h) = &health {
                h.remote_fetches
                    .with_label_values(&[kind.as_str(), outcome])
                    .inc();
                h.remote_fetch_duration
                    .with_label_values(&[kind.as_str()])
                    .observe(start.elapsed().as_secs_f64());
            }
        });
    }

    while let Some(joined) = in_flight.join_next().await {
        if let Err(e) = joined {
            warn!(kind = %kind, error = %e, "fetch task failed");
            failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    let samples = std::mem::take(&mut *collected.lock());

    FanOut {
        samples,
        fetches,
        failed: failed.load(Ordering::Relaxed),
        cancelled: cancel.is_cancelled(),
    }
}
