pub mod health;

use std::sync::Arc;

use anyhow::{Context, Result};
use clickhouse_rs::Pool;

use crate::config::ClickHouseConfig;
use crate::store::clickhouse::ClickHouseBackend;

use self::health::HealthMetrics;

/// Manages a ClickHouse native TCP connection pool.
///
/// Wraps `clickhouse-rs` Pool with LZ4 compression and a small pool
/// (min=2, max=5); one refresh cycle needs at most a handful of handles.
pub struct ClickHouseWriter {
    cfg: ClickHouseConfig,
    pool: Option<Pool>,
    health: Option<Arc<HealthMetrics>>,
}

impl ClickHouseWriter {
    /// Creates a new writer with the given configuration.
    pub fn new(cfg: ClickHouseConfig) -> Self {
        Self {
            cfg,
            pool: None,
            health: None,
        }
    }

    /// Reports connection state on the given metrics.
    pub fn with_health(mut self, health: Arc<HealthMetrics>) -> Self {
        self.health = Some(health);
        self
    }

    /// Opens the connection pool and verifies connectivity with a ping.
    pub async fn start(&mut self) -> Result<()> {
        let dsn = self.build_dsn();
        let pool = Pool::new(dsn);

        let mut handle = pool
            .get_handle()
            .await
            .context("opening ClickHouse connection")?;

        handle.ping().await.context("pinging ClickHouse")?;

        tracing::info!(
            endpoint = %self.cfg.endpoint,
            database = %self.cfg.database,
            "ClickHouse connected",
        );

        if let Some(health) = &self.health {
            health.clickhouse_connected.set(1.0);
        }

        self.pool = Some(pool);

        Ok(())
    }

    /// Returns the connection pool, if started.
    pub fn pool(&self) -> Option<&Pool> {
        self.pool.as_ref()
    }

    /// Returns the writer configuration.
    pub fn config(&self) -> &ClickHouseConfig {
        &self.cfg
    }

    /// Builds a latency store backend over the open pool.
    pub fn backend(&self) -> Result<ClickHouseBackend> {
        let pool = self
            .pool
            .clone()
            .context("ClickHouse writer not started")?;

        Ok(ClickHouseBackend::new(pool, self.cfg.database.clone()))
    }

    /// Closes the connection pool.
    pub async fn stop(&mut self) -> Result<()> {
        self.pool.take();

        if let Some(health) = &self.health {
            health.clickhouse_connected.set(0.0);
        }

        Ok(())
    }

    /// Builds a clickhouse-rs compatible TCP DSN from configuration.
    ///
    /// Format: `tcp://[user[:pass]@]host:port/database?options`
    fn build_dsn(&self) -> String {
        let mut dsn = "tcp://".to_string();

        if !self.cfg.username.is_empty() {
            dsn.push_str(&self.cfg.username);
            if !self.cfg.password.is_empty() {
                dsn.push(':');
                dsn.push_str(&self.cfg.password);
            }
            dsn.push('@');
        }

        dsn.push_str(&self.cfg.endpoint);
        dsn.push('/');
        dsn.push_str(&self.cfg.database);
        dsn.push_str("?compression=lz4&pool_min=2&pool_max=5");

        dsn
    }
}
