//! Incremental ingestion of on-chain latency telemetry into ClickHouse.
//!
//! Two circuit kinds are indexed: device-to-device measurements over a
//! link, and metro-to-metro internet measurements per data provider.
//! [`refresh::Refresher`] pulls new samples from the telemetry source and
//! hands them to [`store::Store`], which derives IPDV and writes them into
//! replacing tables keyed by circuit, epoch and sample index.

pub mod agent;
pub mod config;
pub mod epoch;
pub mod export;
pub mod http;
pub mod latency;
pub mod migrate;
pub mod refresh;
pub mod serviceability;
pub mod store;
pub mod telemetry;
