//! In-process replacing table.
//!
//! Mirrors the physical behavior of `ReplacingMergeTree(ingested_at)`:
//! inserts always append, duplicates stay visible until
//! [`optimize_final`](LatencyBackend::optimize_final) keeps the row with the
//! latest `ingested_at` per key. Used by the integration tests and the
//! benchmarks, and as a dry-run target.

use std::collections::HashMap;

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::latency::{Circuit, EpochKey, HighWaterMarks, LatencyKind, LatencySample};

use super::backend::{LatencyBackend, LatencyRow, PreviousRtt, RawBoundaries};

/// One physical row of a latency table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRow {
    pub event_ts: DateTime<Utc>,
    pub ingested_at: DateTime<Utc>,
    pub epoch: u64,
    pub sample_index: u32,
    pub key: [String; 3],
    pub rtt_us: u32,
    pub is_loss: bool,
    pub ipdv_us: Option<u32>,
}

impl StoredRow {
    fn dedup_key(&self) -> ([String; 3], u64, u32) {
        (self.key.clone(), self.epoch, self.sample_index)
    }
}

#[derive(Debug, Default)]
struct Table {
    unavailable: bool,
    rows: Vec<StoredRow>,
}

/// Thread-safe in-memory latency tables.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    device_link: Mutex<Table>,
    internet_metro: Mutex<Table>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self, kind: LatencyKind) -> &Mutex<Table> {
        match kind {
            LatencyKind::DeviceLink => &self.device_link,
            LatencyKind::InternetMetro => &self.internet_metro,
        }
    }

    /// Makes every operation on a table fail, as if the server lost it,
    /// until [`restore_table`](Self::restore_table). Rows are kept.
    pub fn fail_table(&self, kind: LatencyKind) {
        self.table(kind).lock().unavailable = true;
    }

    /// Brings a failed table back with its rows.
    pub fn restore_table(&self, kind: LatencyKind) {
        self.table(kind).lock().unavailable = false;
    }

    /// Number of physical rows, duplicates included.
    pub fn physical_row_count(&self, kind: LatencyKind) -> usize {
        self.table(kind).lock().rows.len()
    }

    /// Logical rows as a `FINAL` read would return them: one per key, the
    /// latest `ingested_at` winning, sorted by key.
    pub fn rows_final(&self, kind: LatencyKind) -> Vec<StoredRow> {
        let table = self.table(kind).lock();
        collapse(&table.rows)
    }
}

/// Keeps the latest-ingested row per key, sorted by key.
fn collapse(rows: &[StoredRow]) -> Vec<StoredRow> {
    let mut latest: HashMap<([String; 3], u64, u32), &StoredRow> = HashMap::new();
    for row in rows {
        latest
            .entry(row.dedup_key())
            .and_modify(|existing| {
                if row.ingested_at >= existing.ingested_at {
                    *existing = row;
                }
            })
            .or_insert(row);
    }

    let mut out: Vec<StoredRow> = latest.into_values().cloned().collect();
    out.sort_by(|a, b| a.dedup_key().cmp(&b.dedup_key()));
    out
}

fn missing_table(kind: LatencyKind) -> anyhow::Error {
    anyhow::anyhow!("table {} doesn't exist", kind.table())
}

impl LatencyBackend for MemoryBackend {
    async fn max_sample_indices<C: Circuit>(&self, window_epochs: u64) -> Result<HighWaterMarks<C>> {
        let table = self.table(C::KIND).lock();
        if table.unavailable {
            return Err(missing_table(C::KIND));
        }

        let max_epoch = table.rows.iter().map(|r| r.epoch).max().unwrap_or(0);
        let min_epoch = (max_epoch + 1).saturating_sub(window_epochs);

        let mut marks = HighWaterMarks::new();
        for row in table.rows.iter().filter(|r| r.epoch >= min_epoch) {
            let key = EpochKey::new(C::from_parts(row.key.clone()), row.epoch);
            let index = i64::from(row.sample_index);
            marks
                .entry(key)
                .and_modify(|max| *max = (*max).max(index))
                .or_insert(index);
        }

        Ok(marks)
    }

    async fn latest_rtts_before<C: Circuit>(
        &self,
        bounds: &[(C, u64, u32)],
    ) -> Result<HashMap<EpochKey<C>, PreviousRtt>> {
        let table = self.table(C::KIND).lock();
        if table.unavailable {
            return Err(missing_table(C::KIND));
        }

        let mut latest = HashMap::with_capacity(bounds.len());
        for (circuit, epoch, sample_index) in bounds {
            let parts = circuit.parts();
            let previous = table
                .rows
                .iter()
                .filter(|r| {
                    r.rtt_us > 0
                        && (r.epoch, r.sample_index) < (*epoch, *sample_index)
                        && r.key.iter().map(String::as_str).eq(parts.iter().copied())
                })
                .max_by_key(|r| (r.epoch, r.sample_index));

            if let Some(row) = previous {
                latest.insert(
                    EpochKey::new(circuit.clone(), *epoch),
                    PreviousRtt {
                        epoch: row.epoch,
                        sample_index: row.sample_index,
                        rtt_us: row.rtt_us,
                    },
                );
            }
        }

        Ok(latest)
    }

    async fn insert_rows<S: LatencySample>(
        &self,
        rows: &[LatencyRow<S>],
        ingested_at: DateTime<Utc>,
    ) -> Result<()> {
        let kind = <S::Circuit as Circuit>::KIND;
        let mut table = self.table(kind).lock();
        if table.unavailable {
            bail!("table {} doesn't exist", kind.table());
        }

        table.rows.extend(rows.iter().map(|row| {
            let s = &row.sample;
            StoredRow {
                event_ts: s.time(),
                ingested_at,
                epoch: s.epoch(),
                sample_index: s.sample_index(),
                key: s.circuit().parts().map(str::to_string),
                rtt_us: s.rtt_us(),
                is_loss: kind.has_loss_column() && s.is_loss(),
                ipdv_us: row.ipdv_us,
            }
        }));

        Ok(())
    }

    async fn boundaries(&self, kind: LatencyKind) -> Result<RawBoundaries> {
        let table = self.table(kind).lock();
        if table.unavailable {
            return Err(missing_table(kind));
        }

        let rows = &table.rows;
        if rows.is_empty() {
            return Ok(RawBoundaries::default());
        }

        Ok(RawBoundaries {
            min_time_us: rows.iter().map(|r| r.event_ts.timestamp_micros()).min().unwrap_or(0),
            max_time_us: rows.iter().map(|r| r.event_ts.timestamp_micros()).max().unwrap_or(0),
            min_epoch: rows.iter().map(|r| r.epoch).min().unwrap_or(0),
            max_epoch: rows.iter().map(|r| r.epoch).max().unwrap_or(0),
            row_count: rows.len() as u64,
        })
    }

    async fn optimize_final(&self, kind: LatencyKind) -> Result<()> {
        let mut table = self.table(kind).lock();
        if table.unavailable {
            return Err(missing_table(kind));
        }

        table.rows = collapse(&table.rows);
        Ok(())
    }
}
