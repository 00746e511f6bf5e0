//! Latency sample and circuit types.
//!
//! A circuit is the identity of a measured path. Every circuit reduces to
//! three string parts, which map one-to-one onto the key columns of its
//! fact table, so the store can build queries for both kinds generically.

use std::fmt::Debug;
use std::hash::Hash;

use chrono::{DateTime, Utc};

/// The two kinds of measured paths, one fact table each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LatencyKind {
    DeviceLink,
    InternetMetro,
}

impl LatencyKind {
    /// Returns the label used in logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DeviceLink => "device_link",
            Self::InternetMetro => "internet_metro",
        }
    }

    /// Returns the fact table name (without database prefix).
    pub fn table(self) -> &'static str {
        match self {
            Self::DeviceLink => "device_link_latency",
            Self::InternetMetro => "internet_metro_latency",
        }
    }

    /// Returns the circuit key columns, in circuit part order.
    pub fn key_columns(self) -> [&'static str; 3] {
        match self {
            Self::DeviceLink => ["origin_device_pk", "target_device_pk", "link_pk"],
            Self::InternetMetro => ["origin_metro_pk", "target_metro_pk", "data_provider"],
        }
    }

    /// Whether the table carries an `is_loss` column.
    pub fn has_loss_column(self) -> bool {
        matches!(self, Self::DeviceLink)
    }

    pub fn all() -> &'static [LatencyKind] {
        &[Self::DeviceLink, Self::InternetMetro]
    }
}

impl std::fmt::Display for LatencyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a measured path.
///
/// Ordering follows the key parts, which is the order the store sorts
/// batches in before deriving IPDV.
pub trait Circuit: Clone + Debug + Eq + Hash + Ord + Send + Sync + 'static {
    const KIND: LatencyKind;

    /// Key parts in the order of [`LatencyKind::key_columns`].
    fn parts(&self) -> [&str; 3];

    /// Rebuilds a circuit from key parts read back from the store.
    fn from_parts(parts: [String; 3]) -> Self;

    /// Deterministic string key, used for logging and grouping.
    fn key(&self) -> String {
        let [a, b, c] = self.parts();
        format!("{a}:{b}:{c}")
    }
}

/// A single RTT observation for some circuit kind.
pub trait LatencySample: Clone + Debug + Send + Sync + 'static {
    type Circuit: Circuit;

    fn circuit(&self) -> Self::Circuit;

    /// Borrowed circuit key parts, ordered like [`Circuit::parts`].
    fn circuit_parts(&self) -> [&str; 3];

    fn epoch(&self) -> u64;
    fn sample_index(&self) -> u32;
    fn time(&self) -> DateTime<Utc>;
    fn rtt_us(&self) -> u32;

    /// Whether the sample records a lost probe. Only device-link samples
    /// carry a loss flag.
    fn is_loss(&self) -> bool {
        false
    }
}

/// Directional device-to-device circuit over one link.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceLinkCircuit {
    pub origin_device_pk: String,
    pub target_device_pk: String,
    pub link_pk: String,
}

impl DeviceLinkCircuit {
    pub fn new(
        origin_device_pk: impl Into<String>,
        target_device_pk: impl Into<String>,
        link_pk: impl Into<String>,
    ) -> Self {
        Self {
            origin_device_pk: origin_device_pk.into(),
            target_device_pk: target_device_pk.into(),
            link_pk: link_pk.into(),
        }
    }

    /// The same link measured in the opposite direction.
    pub fn reversed(&self) -> Self {
        Self {
            origin_device_pk: self.target_device_pk.clone(),
            target_device_pk: self.origin_device_pk.clone(),
            link_pk: self.link_pk.clone(),
        }
    }
}

impl Circuit for DeviceLinkCircuit {
    const KIND: LatencyKind = LatencyKind::DeviceLink;

    fn parts(&self) -> [&str; 3] {
        [&self.origin_device_pk, &self.target_device_pk, &self.link_pk]
    }

    fn from_parts([origin, target, link]: [String; 3]) -> Self {
        Self {
            origin_device_pk: origin,
            target_device_pk: target,
            link_pk: link,
        }
    }
}

/// Metro-to-metro internet circuit measured by one data provider.
///
/// Built through [`InternetMetroCircuit::canonical`] so that an unordered
/// metro pair has exactly one identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InternetMetroCircuit {
    pub origin_metro_pk: String,
    pub target_metro_pk: String,
    pub data_provider: String,
}

impl InternetMetroCircuit {
    /// Builds a circuit ordering the metros by code, lowest code first.
    ///
    /// Returns `None` for identical codes.
    pub fn canonical(a: &Metro, b: &Metro, data_provider: impl Into<String>) -> Option<Self> {
        let (origin, target) = match a.code.cmp(&b.code) {
            std::cmp::Ordering::Less => (a, b),
            std::cmp::Ordering::Greater => (b, a),
            std::cmp::Ordering::Equal => return None,
        };

        Some(Self {
            origin_metro_pk: origin.pk.clone(),
            target_metro_pk: target.pk.clone(),
            data_provider: data_provider.into(),
        })
    }
}

impl Circuit for InternetMetroCircuit {
    const KIND: LatencyKind = LatencyKind::InternetMetro;

    fn parts(&self) -> [&str; 3] {
        [&self.origin_metro_pk, &self.target_metro_pk, &self.data_provider]
    }

    fn from_parts([origin, target, provider]: [String; 3]) -> Self {
        Self {
            origin_metro_pk: origin,
            target_metro_pk: target,
            data_provider: provider,
        }
    }
}

/// A metro as listed by the topology directory.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
pub struct Metro {
    pub pk: String,
    pub code: String,
}

/// Returns one canonical pair for every unordered pair of distinct metros.
///
/// The result is independent of input order: pairs are sorted by
/// `(origin code, target code)`.
pub fn metro_pairs(metros: &[Metro]) -> Vec<(Metro, Metro)> {
    let mut sorted: Vec<&Metro> = metros.iter().collect();
    sorted.sort_by(|a, b| a.code.cmp(&b.code).then_with(|| a.pk.cmp(&b.pk)));
    sorted.dedup_by(|a, b| a.code == b.code);

    let mut pairs = Vec::with_capacity(sorted.len() * sorted.len().saturating_sub(1) / 2);
    for (i, origin) in sorted.iter().enumerate() {
        for target in sorted.iter().skip(i + 1) {
            pairs.push(((*origin).clone(), (*target).clone()));
        }
    }
    pairs
}

/// Circuit plus epoch, the granularity of a high-water mark.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EpochKey<C> {
    pub circuit: C,
    pub epoch: u64,
}

impl<C> EpochKey<C> {
    pub fn new(circuit: C, epoch: u64) -> Self {
        Self { circuit, epoch }
    }
}

/// Max stored sample index per circuit + epoch.
pub type HighWaterMarks<C> = std::collections::HashMap<EpochKey<C>, i64>;

/// Sentinel high-water mark meaning "nothing stored, fetch everything".
pub const NO_SAMPLES: i64 = -1;

/// Computes a sample's wall-clock time from the source header.
///
/// Saturates instead of overflowing on corrupt headers.
pub fn sample_time(
    start_timestamp_us: u64,
    sampling_interval_us: u64,
    sample_index: u32,
) -> DateTime<Utc> {
    let offset = sampling_interval_us.saturating_mul(u64::from(sample_index));
    let micros = start_timestamp_us.saturating_add(offset);
    let micros = i64::try_from(micros).unwrap_or(i64::MAX);
    DateTime::from_timestamp_micros(micros).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// One RTT observation on a device-link circuit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceLinkLatencySample {
    pub origin_device_pk: String,
    pub target_device_pk: String,
    pub link_pk: String,
    pub epoch: u64,
    pub sample_index: u32,
    pub time: DateTime<Utc>,
    /// Round-trip time; 0 records a lost probe.
    pub rtt_us: u32,
}

impl DeviceLinkLatencySample {
    pub fn new(
        circuit: &DeviceLinkCircuit,
        epoch: u64,
        sample_index: u32,
        time: DateTime<Utc>,
        rtt_us: u32,
    ) -> Self {
        Self {
            origin_device_pk: circuit.origin_device_pk.clone(),
            target_device_pk: circuit.target_device_pk.clone(),
            link_pk: circuit.link_pk.clone(),
            epoch,
            sample_index,
            time,
            rtt_us,
        }
    }
}

impl LatencySample for DeviceLinkLatencySample {
    type Circuit = DeviceLinkCircuit;

    fn circuit(&self) -> DeviceLinkCircuit {
        DeviceLinkCircuit::new(
            self.origin_device_pk.as_str(),
            self.target_device_pk.as_str(),
            self.link_pk.as_str(),
        )
    }

    fn circuit_parts(&self) -> [&str; 3] {
        [&self.origin_device_pk, &self.target_device_pk, &self.link_pk]
    }

    fn epoch(&self) -> u64 {
        self.epoch
    }

    fn sample_index(&self) -> u32 {
        self.sample_index
    }

    fn time(&self) -> DateTime<Utc> {
        self.time
    }

    fn rtt_us(&self) -> u32 {
        self.rtt_us
    }

    fn is_loss(&self) -> bool {
        self.rtt_us == 0
    }
}

/// One RTT observation on an internet-metro circuit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternetMetroLatencySample {
    pub origin_metro_pk: String,
    pub target_metro_pk: String,
    pub data_provider: String,
    pub epoch: u64,
    pub sample_index: u32,
    pub time: DateTime<Utc>,
    pub rtt_us: u32,
}

impl InternetMetroLatencySample {
    pub fn new(
        circuit: &InternetMetroCircuit,
        epoch: u64,
        sample_index: u32,
        time: DateTime<Utc>,
        rtt_us: u32,
    ) -> Self {
        Self {
            origin_metro_pk: circuit.origin_metro_pk.clone(),
            target_metro_pk: circuit.target_metro_pk.clone(),
            data_provider: circuit.data_provider.clone(),
            epoch,
            sample_index,
            time,
            rtt_us,
        }
    }
}

impl LatencySample for InternetMetroLatencySample {
    type Circuit = InternetMetroCircuit;

    fn circuit(&self) -> InternetMetroCircuit {
        InternetMetroCircuit {
            origin_metro_pk: self.origin_metro_pk.clone(),
            target_metro_pk: self.target_metro_pk.clone(),
            data_provider: self.data_provider.clone(),
        }
    }

    fn circuit_parts(&self) -> [&str; 3] {
        [&self.origin_metro_pk, &self.target_metro_pk, &self.data_provider]
    }

    fn epoch(&self) -> u64 {
        self.epoch
    }

    fn sample_index(&self) -> u32 {
        self.sample_index
    }

    fn time(&self) -> DateTime<Utc> {
        self.time
    }

    fn rtt_us(&self) -> u32 {
        self.rtt_us
    }
}
