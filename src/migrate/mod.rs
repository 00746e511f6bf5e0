use std::fmt;

use anyhow::{bail, Context, Result};
use clickhouse_rs::Pool;

use crate::latency::LatencyKind;

/// Embedded SQL migration with version, direction, and content.
struct Migration {
    version: u32,
    up_sql: &'static str,
    down_sql: &'static str,
}

/// All embedded migrations, ordered by version.
static MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    up_sql: include_str!("sql/001_init.up.sql"),
    down_sql: include_str!("sql/001_init.down.sql"),
}];

/// Latest embedded schema version.
pub fn latest_version() -> u32 {
    MIGRATIONS.iter().map(|m| m.version).max().unwrap_or(0)
}

/// Schema state of the latency database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaStatus {
    pub version: u32,
    pub dirty: bool,
    /// Embedded migration versions not applied yet.
    pub pending: Vec<u32>,
    /// Fact tables absent from the database.
    pub missing_tables: Vec<LatencyKind>,
}

impl SchemaStatus {
    fn new(version: u32, dirty: bool, present_tables: &[String]) -> Self {
        Self {
            version,
            dirty,
            pending: pending(version).map(|m| m.version).collect(),
            missing_tables: missing_tables(present_tables),
        }
    }

    /// Whether both fact tables exist at the latest clean version.
    pub fn is_ready(&self) -> bool {
        !self.dirty && self.pending.is_empty() && self.missing_tables.is_empty()
    }
}

impl fmt::Display for SchemaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "version: {} (latest: {}), dirty: {}",
            self.version,
            latest_version(),
            self.dirty
        )?;

        if self.pending.is_empty() {
            f.write_str(", pending: none")?;
        } else {
            let pending: Vec<String> = self.pending.iter().map(u32::to_string).collect();
            write!(f, ", pending: {}", pending.join(","))?;
        }

        if self.missing_tables.is_empty() {
            f.write_str(", missing tables: none")
        } else {
            let missing: Vec<&str> = self.missing_tables.iter().map(|k| k.table()).collect();
            write!(f, ", missing tables: {}", missing.join(","))
        }
    }
}

/// Manages ClickHouse schema migrations.
///
/// Compatible with golang-migrate's `schema_migrations` table format, so
/// the latency tables can share a database with other migrate-managed
/// schemas.
pub trait Migrator: Send {
    /// Applies all pending forward migrations.
    fn up(&self) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Rolls back the last applied migration.
    fn down(&self) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Returns the migration version, pending versions and which latency
    /// tables are missing.
    fn status(&self) -> impl std::future::Future<Output = Result<SchemaStatus>> + Send;
}

/// ClickHouse migration runner.
pub struct ClickHouseMigrator {
    pool: Pool,
}

impl ClickHouseMigrator {
    /// Creates a new migrator using the given connection pool.
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    async fn ensure_migrations_table(&self) -> Result<()> {
        let mut handle = self
            .pool
            .get_handle()
            .await
            .context("getting ClickHouse handle for migrations table")?;

        handle
            .execute(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version Int64,
                    dirty UInt8,
                    sequence UInt64
                ) ENGINE = TinyLog",
            )
            .await
            .context("creating schema_migrations table")?;

        Ok(())
    }

    async fn current_version(&self) -> Result<(u32, bool)> {
        let mut handle = self
            .pool
            .get_handle()
            .await
            .context("getting ClickHouse handle for version check")?;

        let block = handle
            .query("SELECT version, dirty FROM schema_migrations ORDER BY sequence DESC LIMIT 1")
            .fetch_all()
            .await
            .context("querying migration version")?;

        match block.rows().next() {
            Some(row) => {
                let version: i64 = row.get("version").context("reading version")?;
                let dirty: u8 = row.get("dirty").context("reading dirty flag")?;
                let version = u32::try_from(version)
                    .with_context(|| format!("migration version {version} out of range"))?;
                Ok((version, dirty != 0))
            }
            None => Ok((0, false)),
        }
    }

    /// Replaces the tracked version (golang-migrate keeps a single row).
    async fn set_version(&self, version: u32, dirty: bool) -> Result<()> {
        let mut handle = self
            .pool
            .get_handle()
            .await
            .context("getting ClickHouse handle for version update")?;

        handle
            .execute("TRUNCATE TABLE schema_migrations")
            .await
            .context("truncating schema_migrations")?;

        if version == 0 {
            return Ok(());
        }

        let dirty_val = u8::from(dirty);
        let sql = format!(
            "INSERT INTO schema_migrations (version, dirty, sequence) VALUES ({version}, {dirty_val}, 1)"
        );

        handle
            .execute(sql.as_str())
            .await
            .context("inserting migration version")?;

        Ok(())
    }

    /// Names of the latency fact tables present in the pool's database.
    async fn present_tables(&self) -> Result<Vec<String>> {
        let mut handle = self
            .pool
            .get_handle()
            .await
            .context("getting ClickHouse handle for table check")?;

        let block = handle
            .query(latency_tables_sql().as_str())
            .fetch_all()
            .await
            .context("listing latency tables")?;

        let mut names = Vec::with_capacity(block.row_count());
        for row in block.rows() {
            let name: String = row.get("name").context("reading table name")?;
            names.push(name);
        }

        Ok(names)
    }

    async fn execute_sql(&self, sql: &str) -> Result<()> {
        let mut handle = self
            .pool
            .get_handle()
            .await
            .context("getting ClickHouse handle for SQL execution")?;

        for statement in split_statements(sql) {
            handle.execute(statement.as_str()).await.with_context(|| {
                let preview: String = statement.chars().take(80).collect();
                format!("executing migration statement: {preview}...")
            })?;
        }

        Ok(())
    }
}

impl Migrator for ClickHouseMigrator {
    async fn up(&self) -> Result<()> {
        self.ensure_migrations_table().await?;

        let (current_version, dirty) = self.current_version().await?;

        if dirty {
            bail!("migration version {current_version} is dirty, manual intervention required");
        }

        tracing::info!(current_version, latest = latest_version(), "running migrations");

        let mut applied = 0u32;

        for migration in pending(current_version) {
            tracing::info!(version = migration.version, "applying migration");

            self.set_version(migration.version, true).await?;

            self.execute_sql(migration.up_sql)
                .await
                .with_context(|| format!("applying migration version {}", migration.version))?;

            self.set_version(migration.version, false).await?;

            applied += 1;
        }

        if applied == 0 {
            tracing::info!("no pending migrations");
        } else {
            tracing::info!(version = latest_version(), applied, "migrations completed");
        }

        let missing = missing_tables(&self.present_tables().await?);
        if !missing.is_empty() {
            let names: Vec<&str> = missing.iter().map(|k| k.table()).collect();
            bail!(
                "schema is at version {} but latency tables are missing: {}",
                latest_version(),
                names.join(", ")
            );
        }

        Ok(())
    }

    async fn down(&self) -> Result<()> {
        self.ensure_migrations_table().await?;

        let (current_version, _) = self.current_version().await?;

        if current_version == 0 {
            tracing::info!("no migrations to roll back");
            return Ok(());
        }

        let migration = MIGRATIONS
            .iter()
            .find(|m| m.version == current_version)
            .with_context(|| format!("migration version {current_version} not found"))?;

        tracing::info!(version = current_version, "rolling back migration");

        self.set_version(current_version, true).await?;

        self.execute_sql(migration.down_sql)
            .await
            .with_context(|| format!("rolling back migration version {current_version}"))?;

        let prev_version = previous_version(current_version);
        self.set_version(prev_version, false).await?;

        tracing::info!(version = prev_version, "rollback completed");

        Ok(())
    }

    async fn status(&self) -> Result<SchemaStatus> {
        self.ensure_migrations_table().await?;
        let (version, dirty) = self.current_version().await?;
        let present = self.present_tables().await?;
        Ok(SchemaStatus::new(version, dirty, &present))
    }
}

/// Migrations newer than `current`, in order.
fn pending(current: u32) -> impl Iterator<Item = &'static Migration> {
    MIGRATIONS.iter().filter(move |m| m.version > current)
}

fn previous_version(current: u32) -> u32 {
    MIGRATIONS
        .iter()
        .filter(|m| m.version < current)
        .map(|m| m.version)
        .max()
        .unwrap_or(0)
}

fn latency_tables_sql() -> String {
    let names: Vec<String> = LatencyKind::all()
        .iter()
        .map(|k| format!("'{}'", k.table()))
        .collect();
    format!(
        "SELECT name FROM system.tables \
         WHERE database = currentDatabase() AND name IN ({})",
        names.join(", ")
    )
}

fn missing_tables(present: &[String]) -> Vec<LatencyKind> {
    LatencyKind::all()
        .iter()
        .copied()
        .filter(|k| !present.iter().any(|name| name == k.table()))
        .collect()
}

/// Splits SQL text into individual statements by semicolons.
///
/// `--` comment lines are dropped; comment-only and blank segments are
/// skipped.
fn split_statements(sql: &str) -> Vec<String> {
    let stripped: String = sql
        .lines()
        .filter(|line| !line.trim_start().starts_with("--"))
        .collect::<Vec<_>>()
        .join("\n");

    stripped
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
