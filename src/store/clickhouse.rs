use std::collections::HashMap;
use std::fmt::Write;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clickhouse_rs::Pool;

use crate::latency::{Circuit, EpochKey, HighWaterMarks, LatencyKind, LatencySample};

use super::backend::{LatencyBackend, LatencyRow, PreviousRtt, RawBoundaries};

/// ClickHouse implementation of the latency tables.
///
/// Both tables are `ReplacingMergeTree(ingested_at)` keyed by circuit,
/// epoch and sample index (see `migrate/sql`), so every insert is safe to
/// repeat.
pub struct ClickHouseBackend {
    pool: Pool,
    database: String,
}

impl ClickHouseBackend {
    /// Creates a backend over an open pool.
    pub fn new(pool: Pool, database: String) -> Self {
        Self { pool, database }
    }

    fn table(&self, kind: LatencyKind) -> String {
        format!("{}.{}", self.database, kind.table())
    }
}

impl LatencyBackend for ClickHouseBackend {
    async fn max_sample_indices<C: Circuit>(&self, window_epochs: u64) -> Result<HighWaterMarks<C>> {
        let sql = max_sample_indices_sql(&self.table(C::KIND), C::KIND, window_epochs);
        let [a, b, c] = C::KIND.key_columns();

        let mut handle = self
            .pool
            .get_handle()
            .await
            .context("getting handle for high-water-mark query")?;

        let block = handle
            .query(sql.as_str())
            .fetch_all()
            .await
            .context("querying max sample indices")?;

        let mut marks = HighWaterMarks::with_capacity(block.row_count());
        for row in block.rows() {
            let parts: [String; 3] = [
                row.get(a).with_context(|| format!("reading {a}"))?,
                row.get(b).with_context(|| format!("reading {b}"))?,
                row.get(c).with_context(|| format!("reading {c}"))?,
            ];
            let epoch: u64 = row.get("epoch").context("reading epoch")?;
            let max_index: u32 = row
                .get("max_sample_index")
                .context("reading max_sample_index")?;

            marks.insert(
                EpochKey::new(C::from_parts(parts), epoch),
                i64::from(max_index),
            );
        }

        Ok(marks)
    }

    async fn latest_rtts_before<C: Circuit>(
        &self,
        bounds: &[(C, u64, u32)],
    ) -> Result<HashMap<EpochKey<C>, PreviousRtt>> {
        if bounds.is_empty() {
            return Ok(HashMap::new());
        }

        let sql = latest_rtts_sql(&self.table(C::KIND), bounds);
        let [a, b, c] = C::KIND.key_columns();

        let mut handle = self
            .pool
            .get_handle()
            .await
            .context("getting handle for previous RTT query")?;

        let block = handle
            .query(sql.as_str())
            .fetch_all()
            .await
            .context("querying latest RTTs")?;

        let mut latest = HashMap::with_capacity(block.row_count());
        for row in block.rows() {
            let parts: [String; 3] = [
                row.get(a).with_context(|| format!("reading {a}"))?,
                row.get(b).with_context(|| format!("reading {b}"))?,
                row.get(c).with_context(|| format!("reading {c}"))?,
            ];
            let bound_epoch: u64 = row.get("bound_epoch").context("reading bound_epoch")?;
            let previous = PreviousRtt {
                epoch: row.get("prev_epoch").context("reading prev_epoch")?,
                sample_index: row
                    .get("prev_sample_index")
                    .context("reading prev_sample_index")?,
                rtt_us: row.get("prev_rtt_us").context("reading prev_rtt_us")?,
            };
            latest.insert(EpochKey::new(C::from_parts(parts), bound_epoch), previous);
        }

        Ok(latest)
    }

    async fn insert_rows<S: LatencySample>(
        &self,
        rows: &[LatencyRow<S>],
        ingested_at: DateTime<Utc>,
    ) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }

        let kind = <S::Circuit as Circuit>::KIND;
        let sql = insert_sql(&self.table(kind), rows, ingested_at);

        let mut handle = self
            .pool
            .get_handle()
            .await
            .with_context(|| format!("getting handle for {} insert", kind.table()))?;

        handle
            .execute(sql.as_str())
            .await
            .with_context(|| format!("sending {} batch", kind.table()))?;

        Ok(())
    }

    async fn boundaries(&self, kind: LatencyKind) -> Result<RawBoundaries> {
        let sql = format!(
            "SELECT \
             toUnixTimestamp64Micro(min(event_ts)) AS min_time_us, \
             toUnixTimestamp64Micro(max(event_ts)) AS max_time_us, \
             min(epoch) AS min_epoch, max(epoch) AS max_epoch, count() AS row_count \
             FROM {}",
            self.table(kind)
        );

        let mut handle = self
            .pool
            .get_handle()
            .await
            .context("getting handle for boundaries query")?;

        let block = handle
            .query(sql.as_str())
            .fetch_all()
            .await
            .context("querying boundaries")?;

        let Some(row) = block.rows().next() else {
            return Ok(RawBoundaries::default());
        };

        Ok(RawBoundaries {
            min_time_us: row.get("min_time_us").context("reading min_time_us")?,
            max_time_us: row.get("max_time_us").context("reading max_time_us")?,
            min_epoch: row.get("min_epoch").context("reading min_epoch")?,
            max_epoch: row.get("max_epoch").context("reading max_epoch")?,
            row_count: row.get("row_count").context("reading row_count")?,
        })
    }

    async fn optimize_final(&self, kind: LatencyKind) -> Result<()> {
        let sql = format!("OPTIMIZE TABLE {} FINAL", self.table(kind));

        let mut handle = self
            .pool
            .get_handle()
            .await
            .context("getting handle for optimize")?;

        handle
            .execute(sql.as_str())
            .await
            .with_context(|| format!("optimizing {}", kind.table()))?;

        Ok(())
    }
}

// --- SQL builders ---

/// High-water marks over the newest `window_epochs` epochs in the table.
///
/// The epoch filter is evaluated server-side against the table's own max
/// epoch so partitions outside the window are pruned.
fn max_sample_indices_sql(table: &str, kind: LatencyKind, window_epochs: u64) -> String {
    let [a, b, c] = kind.key_columns();
    format!(
        "SELECT {a}, {b}, {c}, epoch, max(sample_index) AS max_sample_index \
         FROM {table} \
         WHERE toInt64(epoch) > (SELECT toInt64(max(epoch)) FROM {table}) - {window_epochs} \
         GROUP BY {a}, {b}, {c}, epoch"
    )
}

/// Latest non-zero RTT before each circuit + epoch bound, with its
/// position. One `UNION ALL` branch per bound, sent as a single statement.
fn latest_rtts_sql<C: Circuit>(table: &str, bounds: &[(C, u64, u32)]) -> String {
    let [a, b, c] = C::KIND.key_columns();
    let mut sql = String::with_capacity(bounds.len() * (420 + table.len()));

    for (idx, (circuit, epoch, sample_index)) in bounds.iter().enumerate() {
        if idx > 0 {
            sql.push_str(" UNION ALL ");
        }
        let [va, vb, vc] = circuit.parts();
        let _ = write!(
            sql,
            "SELECT toUInt64({epoch}) AS bound_epoch, {a}, {b}, {c}, \
             argMax(epoch, (epoch, sample_index)) AS prev_epoch, \
             argMax(sample_index, (epoch, sample_index)) AS prev_sample_index, \
             argMax(rtt_us, (epoch, sample_index)) AS prev_rtt_us \
             FROM {table} \
             WHERE rtt_us > 0 AND {a} = '{}' AND {b} = '{}' AND {c} = '{}' \
             AND (epoch, sample_index) < ({epoch}, {sample_index}) \
             GROUP BY {a}, {b}, {c}",
            escape_sql(va),
            escape_sql(vb),
            escape_sql(vc),
        );
    }

    sql
}

fn insert_sql<S: LatencySample>(
    table: &str,
    rows: &[LatencyRow<S>],
    ingested_at: DateTime<Utc>,
) -> String {
    let kind = <S::Circuit as Circuit>::KIND;
    let [a, b, c] = kind.key_columns();
    let loss_column = if kind.has_loss_column() { ", is_loss" } else { "" };

    let ingested = format_datetime(ingested_at);
    let mut sql = String::with_capacity(200 + table.len() + rows.len() * 220);
    let _ = write!(
        sql,
        "INSERT INTO {table} (event_ts, ingested_at, epoch, sample_index, {a}, {b}, {c}, \
         rtt_us{loss_column}, ipdv_us) VALUES "
    );

    for (idx, row) in rows.iter().enumerate() {
        if idx > 0 {
            sql.push_str(", ");
        }

        let s = &row.sample;
        let circuit = s.circuit();
        let [va, vb, vc] = circuit.parts();
        let _ = write!(
            sql,
            "({}, {ingested}, {}, {}, '{}', '{}', '{}', {}",
            format_datetime(s.time()),
            s.epoch(),
            s.sample_index(),
            escape_sql(va),
            escape_sql(vb),
            escape_sql(vc),
            s.rtt_us(),
        );

        if kind.has_loss_column() {
            sql.push_str(if s.is_loss() { ", true" } else { ", false" });
        }

        match row.ipdv_us {
            Some(ipdv) => {
                let _ = write!(sql, ", {ipdv})");
            }
            None => sql.push_str(", NULL)"),
        }
    }

    sql
}

// --- SQL formatting helpers ---

/// Formats a timestamp as a ClickHouse DateTime64(6) literal.
fn format_datetime(t: DateTime<Utc>) -> String {
    format!("'{}'", t.format("%Y-%m-%d %H:%M:%S%.6f"))
}

/// Escapes a string value for SQL insertion (single-quote escaping).
fn escape_sql(s: &str) -> String {
    s.replace('\\', "\\\\").replace('\'', "\\'")
}
