use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::epoch::{self, EpochOracle};
use crate::export::health::HealthMetrics;
use crate::export::ClickHouseWriter;
use crate::migrate::{ClickHouseMigrator, Migrator};
use crate::refresh::{RefreshError, RefreshOutcome, Refresher};
use crate::serviceability::{self, TopologySource};
use crate::store::clickhouse::ClickHouseBackend;
use crate::store::{LatencyBackend, Store};
use crate::telemetry::{self, TelemetrySource};

/// Refresher wired to the production collaborators.
pub type ProductionRefresher =
    Refresher<ClickHouseBackend, telemetry::Client, epoch::RpcClient, serviceability::Client>;

/// Which circuit kinds a refresh tick covers.
#[derive(Debug, Clone, Copy)]
pub struct RefreshKinds {
    pub device_link: bool,
    pub internet_metro: bool,
}

/// Agent owns the ClickHouse pool, the health server and the refresh loop.
pub struct Agent {
    cfg: Config,
    health: Arc<HealthMetrics>,
    ch_writer: Option<ClickHouseWriter>,
    refresh_task: Option<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl Agent {
    /// Creates a new Agent, initializing health metrics.
    pub fn new(cfg: Config) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);

        Ok(Self {
            cfg,
            health,
            ch_writer: None,
            refresh_task: None,
            cancel: CancellationToken::new(),
        })
    }

    /// Start all components and schedule refresh cycles.
    pub async fn start(&mut self) -> Result<()> {
        // Health server first so probes respond during migrations.
        self.health
            .start()
            .await
            .context("starting health metrics server")?;

        let mut writer =
            ClickHouseWriter::new(self.cfg.clickhouse.clone()).with_health(Arc::clone(&self.health));
        writer.start().await.context("starting ClickHouse writer")?;

        if self.cfg.clickhouse.migrations.enabled {
            run_migrations(&writer).await?;
        }

        let refresher = build_refresher(&self.cfg, &writer, &self.health)?;
        self.ch_writer = Some(writer);

        let kinds = RefreshKinds {
            device_link: self.cfg.refresh.device_link.enabled,
            internet_metro: self.cfg.refresh.internet_metro.enabled,
        };
        let interval = self.cfg.refresh.interval;
        let cancel = self.cancel.child_token();

        info!(
            interval = ?interval,
            device_link = kinds.device_link,
            internet_metro = kinds.internet_metro,
            max_concurrency = self.cfg.refresh.max_concurrency,
            "starting refresh loop",
        );

        self.refresh_task = Some(tokio::spawn(async move {
            run_refresh_loop(Arc::new(refresher), interval, kinds, cancel).await;
        }));

        info!("agent fully started");

        Ok(())
    }

    /// Gracefully stop all components. An in-flight cycle stops launching
    /// fetches and appends what it already collected before returning.
    pub async fn stop(&mut self) -> Result<()> {
        self.cancel.cancel();

        if let Some(task) = self.refresh_task.take() {
            if let Err(e) = task.await {
                error!(error = %e, "refresh loop task failed");
            }
        }

        if let Some(writer) = &mut self.ch_writer {
            if let Err(e) = writer.stop().await {
                error!(error = %e, "error stopping ClickHouse writer");
            }
        }

        self.health.stop().await?;

        Ok(())
    }
}

/// Builds the production refresher over a started writer.
pub fn build_refresher(
    cfg: &Config,
    writer: &ClickHouseWriter,
    health: &Arc<HealthMetrics>,
) -> Result<ProductionRefresher> {
    let store = Store::new(writer.backend()?)
        .with_hwm_window_epochs(cfg.refresh.hwm_window_epochs)
        .with_health(Arc::clone(health));

    let telemetry = telemetry::Client::new(&cfg.telemetry)
        .context("creating telemetry client")?
        .with_metrics(health.request_callback());
    let epochs = epoch::RpcClient::new(&cfg.solana)
        .context("creating Solana RPC client")?
        .with_metrics(health.request_callback());
    let topology = serviceability::Client::new(&cfg.serviceability)
        .context("creating serviceability client")?
        .with_metrics(health.request_callback());

    Ok(Refresher::new(
        Arc::new(store),
        Arc::new(telemetry),
        Arc::new(epochs),
        Arc::new(topology),
        cfg.refresh.clone(),
    )
    .with_health(Arc::clone(health)))
}

/// Applies pending schema migrations over the writer's pool.
pub async fn run_migrations(writer: &ClickHouseWriter) -> Result<()> {
    info!("running ClickHouse migrations...");

    let pool = writer
        .pool()
        .context("ClickHouse writer not started")?
        .clone();

    ClickHouseMigrator::new(pool)
        .up()
        .await
        .context("applying ClickHouse migrations")?;

    info!("ClickHouse migrations applied");

    Ok(())
}

/// Runs the enabled kinds once per tick until cancelled. The first tick
/// fires immediately; ticks missed during a slow cycle are skipped.
pub async fn run_refresh_loop<B, T, E, P>(
    refresher: Arc<Refresher<B, T, E, P>>,
    interval: Duration,
    kinds: RefreshKinds,
    cancel: CancellationToken,
) where
    B: LatencyBackend,
    T: TelemetrySource,
    E: EpochOracle,
    P: TopologySource,
{
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {
                refresh_once(&refresher, kinds, &cancel).await;
            }
        }
    }
}

/// One tick: both kinds concurrently, errors logged and left for the
/// next tick.
pub async fn refresh_once<B, T, E, P>(
    refresher: &Refresher<B, T, E, P>,
    kinds: RefreshKinds,
    cancel: &CancellationToken,
) where
    B: LatencyBackend,
    T: TelemetrySource,
    E: EpochOracle,
    P: TopologySource,
{
    let device_link = async {
        if kinds.device_link {
            Some(refresher.refresh_device_link(cancel).await)
        } else {
            None
        }
    };
    let internet_metro = async {
        if kinds.internet_metro {
            Some(refresher.refresh_internet_metro(cancel).await)
        } else {
            None
        }
    };

    let (device_link, internet_metro) = tokio::join!(device_link, internet_metro);

    log_cycle("device_link", device_link);
    log_cycle("internet_metro", internet_metro);
}

fn log_cycle(kind: &str, result: Option<Result<RefreshOutcome, RefreshError>>) {
    match result {
        Some(Err(e)) => warn!(kind, error = %e, "refresh cycle failed, retrying next tick"),
        Some(Ok(outcome)) if outcome.cancelled => {
            info!(kind, samples = outcome.samples, "refresh cycle cancelled");
        }
        _ => {}
    }
}
