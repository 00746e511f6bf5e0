use std::collections::HashMap;
use std::future::Future;

use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::latency::{Circuit, EpochKey, HighWaterMarks, LatencyKind, LatencySample};

/// A sample ready for insertion, with its derived IPDV.
#[derive(Debug, Clone, PartialEq)]
pub struct LatencyRow<S> {
    pub sample: S,
    pub ipdv_us: Option<u32>,
}

/// The last non-zero RTT stored before a bound, with its position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreviousRtt {
    pub epoch: u64,
    pub sample_index: u32,
    pub rtt_us: u32,
}

impl PreviousRtt {
    pub fn position(&self) -> (u64, u32) {
        (self.epoch, self.sample_index)
    }
}

/// Aggregates over one fact table as returned by the backend.
///
/// An empty ClickHouse table reports the epoch-zero timestamp for min/max,
/// so only `row_count` tells whether the table holds data.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RawBoundaries {
    pub min_time_us: i64,
    pub max_time_us: i64,
    pub min_epoch: u64,
    pub max_epoch: u64,
    pub row_count: u64,
}

/// Storage operations the [`Store`](super::Store) is built on.
///
/// Implementations own the physical table format. Inserts must be
/// replace-on-duplicate-key over `(circuit, epoch, sample_index)`.
pub trait LatencyBackend: Send + Sync + 'static {
    /// Max sample index per circuit + epoch, limited to the newest
    /// `window_epochs` epochs present in the table.
    fn max_sample_indices<C: Circuit>(
        &self,
        window_epochs: u64,
    ) -> impl Future<Output = Result<HighWaterMarks<C>>> + Send;

    /// For each `(circuit, epoch, sample_index)` bound, the latest RTT > 0
    /// of that circuit ordered strictly before `(epoch, sample_index)`, in
    /// one round trip. Results are keyed by the bound's circuit and epoch;
    /// bounds without such a sample are absent.
    fn latest_rtts_before<C: Circuit>(
        &self,
        bounds: &[(C, u64, u32)],
    ) -> impl Future<Output = Result<HashMap<EpochKey<C>, PreviousRtt>>> + Send;

    /// Writes all rows in one batch.
    fn insert_rows<S: LatencySample>(
        &self,
        rows: &[LatencyRow<S>],
        ingested_at: DateTime<Utc>,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Min/max time, min/max epoch and row count over a table.
    fn boundaries(&self, kind: LatencyKind) -> impl Future<Output = Result<RawBoundaries>> + Send;

    /// Forces duplicate rows to collapse to one per key.
    fn optimize_final(&self, kind: LatencyKind) -> impl Future<Output = Result<()>> + Send;
}
