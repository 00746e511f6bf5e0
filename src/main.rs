use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

use latency_indexer::agent;
use latency_indexer::config::Config;
use latency_indexer::export::health::HealthMetrics;
use latency_indexer::export::ClickHouseWriter;
use latency_indexer::latency::LatencyKind;
use latency_indexer::migrate::{ClickHouseMigrator, Migrator};

/// Indexes device-link and internet-metro latency telemetry into ClickHouse.
#[derive(Parser)]
#[command(name = "latency-indexer", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduled refresh loop (default).
    Run,

    /// Re-ingest full epochs for one circuit kind.
    Backfill {
        /// Circuit kind to backfill.
        #[arg(long, value_enum)]
        kind: KindArg,

        /// First epoch to backfill.
        #[arg(long)]
        epoch: u64,

        /// Last epoch to backfill, inclusive. Defaults to --epoch.
        #[arg(long)]
        to_epoch: Option<u64>,

        /// Collapse duplicate rows once the backfill finishes.
        #[arg(long)]
        optimize: bool,
    },

    /// Manage the ClickHouse schema.
    Migrate {
        #[command(subcommand)]
        action: MigrateAction,
    },

    /// Print version information and exit.
    Version,
}

#[derive(Subcommand, Clone, Copy)]
enum MigrateAction {
    /// Apply all pending migrations.
    Up,
    /// Roll back the last applied migration.
    Down,
    /// Print the current schema version.
    Status,
}

#[derive(ValueEnum, Clone, Copy)]
enum KindArg {
    DeviceLink,
    InternetMetro,
}

impl From<KindArg> for LatencyKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::DeviceLink => LatencyKind::DeviceLink,
            KindArg::InternetMetro => LatencyKind::InternetMetro,
        }
    }
}

/// Build-time version info.
mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Handle version subcommand before anything else.
    if let Some(Command::Version) = &cli.command {
        println!("latency-indexer {}", version::full());
        return Ok(());
    }

    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;

    fmt().with_env_filter(filter).with_target(true).init();

    let config_path = cli
        .config
        .context("--config is required (use --help for usage)")?;

    let cfg = Config::load(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async move {
        match cli.command.unwrap_or(Command::Run) {
            Command::Run => run(cfg).await,
            Command::Backfill {
                kind,
                epoch,
                to_epoch,
                optimize,
            } => backfill(cfg, kind.into(), epoch, to_epoch.unwrap_or(epoch), optimize).await,
            Command::Migrate { action } => run_migrate(cfg, action).await,
            Command::Version => Ok(()),
        }
    })
}

/// Cancels the returned token on SIGINT or SIGTERM.
fn shutdown_signal() -> Result<CancellationToken> {
    let cancel = CancellationToken::new();
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("registering SIGTERM handler")?;

    let token = cancel.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
            }
        }

        token.cancel();
    });

    Ok(cancel)
}

async fn run(cfg: Config) -> Result<()> {
    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting latency-indexer",
    );

    let shutdown = shutdown_signal()?;

    let mut agent = agent::Agent::new(cfg)?;
    agent.start().await?;

    shutdown.cancelled().await;

    agent.stop().await?;

    tracing::info!("latency-indexer stopped");

    Ok(())
}

async fn backfill(
    cfg: Config,
    kind: LatencyKind,
    from_epoch: u64,
    to_epoch: u64,
    optimize: bool,
) -> Result<()> {
    if to_epoch < from_epoch {
        bail!("--to-epoch {to_epoch} is before --epoch {from_epoch}");
    }

    let cancel = shutdown_signal()?;
    let health =
        Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);

    let mut writer = ClickHouseWriter::new(cfg.clickhouse.clone()).with_health(Arc::clone(&health));
    writer.start().await.context("starting ClickHouse writer")?;

    if cfg.clickhouse.migrations.enabled {
        agent::run_migrations(&writer).await?;
    }

    let refresher = agent::build_refresher(&cfg, &writer, &health)?;

    tracing::info!(kind = %kind, from_epoch, to_epoch, "starting backfill");

    let mut samples = 0;
    for epoch in from_epoch..=to_epoch {
        let outcome = match kind {
            LatencyKind::DeviceLink => refresher.backfill_device_link(epoch, &cancel).await,
            LatencyKind::InternetMetro => refresher.backfill_internet_metro(epoch, &cancel).await,
        }
        .with_context(|| format!("backfilling {kind} epoch {epoch}"))?;

        samples += outcome.samples;

        if outcome.cancelled {
            tracing::warn!(kind = %kind, epoch, "backfill interrupted");
            writer.stop().await?;
            return Ok(());
        }
    }

    if optimize {
        tracing::info!(kind = %kind, table = kind.table(), "optimizing table");
        refresher.store().optimize_final(kind).await?;
    }

    tracing::info!(kind = %kind, from_epoch, to_epoch, samples, "backfill finished");

    writer.stop().await
}

async fn run_migrate(cfg: Config, action: MigrateAction) -> Result<()> {
    let mut writer = ClickHouseWriter::new(cfg.clickhouse.clone());
    writer.start().await.context("starting ClickHouse writer")?;

    let pool = writer
        .pool()
        .context("ClickHouse writer not started")?
        .clone();
    let migrator = ClickHouseMigrator::new(pool);

    match action {
        MigrateAction::Up => migrator.up().await?,
        MigrateAction::Down => migrator.down().await?,
        MigrateAction::Status => {
            let status = migrator.status().await?;
            println!("{status}");
            if !status.is_ready() {
                tracing::warn!("latency schema is not ready, run `migrate up`");
            }
        }
    }

    writer.stop().await
}
