//! Migration orchestrator - main workflow coordinator.
//!
//! Phases, in order:
//! 1. Resolve the table set (discovery or the configured table map).
//! 2. Resolve primary keys and the page size (discovery mode, data runs).
//! 3. Mirror schemas concurrently (discovery mode only).
//! 4. Plan every table: row count, chunk queries, projection.
//! 5. Check and truncate each destination table, serially.
//! 6. Launch one task per chunk and wait for every completion.
//!
//! Nothing on the destination changes before step 3, so configuration
//! errors found in step 2 leave it untouched. Steps 1-5 finish before any
//! chunk task starts, so chunks of a table may complete in any order.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::core::schema::{ColumnProjection, FetchDescriptor, TableDescriptor};
use crate::core::traits::{SourceReader, TargetWriter};
use crate::drivers::{MysqlReader, PostgresWriter};
use crate::error::{MigrateError, Result};
use crate::failure::{FailureCategory, FailureRecord, FailureSink, FileFailureSink};
use crate::planner;
use crate::transfer::{ChunkExecutor, CompletionSignal, MigrationTask};

/// Options for a single run.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Stop after schema mirroring.
    pub schema_only: bool,

    /// Use `migration.tables` instead of discovering tables.
    pub from_config_tables: bool,

    /// Overrides `migration.max_concurrent_chunks`.
    pub max_concurrent_chunks: Option<usize>,
}

/// A chunk that ended in failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedChunk {
    pub table: String,
    pub index: usize,
    pub error: String,
}

/// A table excluded from the run by a per-table error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedTable {
    pub table: String,
    pub reason: String,
}

/// Result of a migration run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationReport {
    /// Per-run directory holding `run.log` and `failures.jsonl`.
    pub run_dir: PathBuf,

    /// When the migration started.
    pub started_at: DateTime<Utc>,

    /// Total duration in seconds.
    pub duration_seconds: f64,

    /// Whether the run stopped after schema mirroring.
    pub schema_only: bool,

    /// Tables in the run, before per-table errors.
    pub tables_total: usize,

    pub chunks_total: usize,
    pub chunks_succeeded: usize,
    pub chunks_failed: usize,

    /// Rows committed by successful chunks.
    pub rows_copied: u64,

    pub failed_chunks: Vec<FailedChunk>,
    pub skipped_tables: Vec<SkippedTable>,
}

impl MigrationReport {
    fn new(run_dir: &Path, started_at: DateTime<Utc>, schema_only: bool) -> Self {
        Self {
            run_dir: run_dir.to_path_buf(),
            started_at,
            duration_seconds: 0.0,
            schema_only,
            tables_total: 0,
            chunks_total: 0,
            chunks_succeeded: 0,
            chunks_failed: 0,
            rows_copied: 0,
            failed_chunks: Vec::new(),
            skipped_tables: Vec::new(),
        }
    }

    /// True when every table and chunk made it through.
    pub fn is_clean(&self) -> bool {
        self.chunks_failed == 0 && self.skipped_tables.is_empty()
    }

    /// Convert to JSON string.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Result of a connection health check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub source_connected: bool,
    pub source_latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_error: Option<String>,
    pub target_connected: bool,
    pub target_latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_error: Option<String>,
    pub healthy: bool,
}

/// A table ready for chunk launch.
struct PlannedTable {
    name: String,
    chunks: Vec<(FetchDescriptor, Arc<ColumnProjection>)>,
}

/// Migration orchestrator.
pub struct Orchestrator {
    config: Config,
    source: Arc<dyn SourceReader>,
    target: Arc<dyn TargetWriter>,
    failures: Arc<dyn FailureSink>,
    run_dir: PathBuf,
}

impl Orchestrator {
    /// Connect to both databases and record failures under `run_dir`.
    pub async fn connect(config: Config, run_dir: PathBuf) -> Result<Self> {
        let source = MysqlReader::new(&config.source).await?;
        let target = PostgresWriter::new(&config.target, config.migration.copy_flush_bytes).await?;
        let failures = FileFailureSink::new(&run_dir);

        Ok(Self::new(
            config,
            Arc::new(source),
            Arc::new(target),
            Arc::new(failures),
            run_dir,
        ))
    }

    /// Build an orchestrator from already-connected capabilities.
    pub fn new(
        config: Config,
        source: Arc<dyn SourceReader>,
        target: Arc<dyn TargetWriter>,
        failures: Arc<dyn FailureSink>,
        run_dir: PathBuf,
    ) -> Self {
        Self {
            config,
            source,
            target,
            failures,
            run_dir,
        }
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Test both connections.
    pub async fn health_check(&self) -> HealthCheckResult {
        let start = Instant::now();
        let source = self.source.test_connection().await;
        let source_latency_ms = start.elapsed().as_millis() as u64;

        let start = Instant::now();
        let target = self.target.test_connection().await;
        let target_latency_ms = start.elapsed().as_millis() as u64;

        HealthCheckResult {
            source_connected: source.is_ok(),
            source_latency_ms,
            target_connected: target.is_ok(),
            target_latency_ms,
            healthy: source.is_ok() && target.is_ok(),
            source_error: source.err().map(|e| e.to_string()),
            target_error: target.err().map(|e| e.to_string()),
        }
    }

    /// Close both connection pools.
    pub async fn close(&self) {
        self.source.close().await;
        self.target.close().await;
    }

    /// Run the migration.
    ///
    /// Returns once every launched chunk has reported, whatever the outcome
    /// of the individual chunks. Fatal errors (connectivity, catalog
    /// queries, missing page size) abort the run before any chunk starts.
    pub async fn run(&self, opts: RunOptions, cancel: CancellationToken) -> Result<MigrationReport> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                warn!("Migration cancelled; in-flight chunks are abandoned");
                Err(MigrateError::Cancelled)
            }
            result = self.run_phases(&opts) => result,
        }
    }

    async fn run_phases(&self, opts: &RunOptions) -> Result<MigrationReport> {
        let started_at = Utc::now();
        let start = Instant::now();
        let mut report = MigrationReport::new(&self.run_dir, started_at, opts.schema_only);

        // Phase 1: table set
        let tables = self.resolve_table_set(opts).await?;
        report.tables_total = tables.len();
        info!(
            "Migrating {} table(s) from {} to {}",
            tables.len(),
            self.source.db_type(),
            self.target.db_type()
        );

        // Phase 2: keys and page size
        let mut resolved: HashMap<String, TableDescriptor> = HashMap::new();
        if !opts.from_config_tables && !opts.schema_only {
            for table in &tables {
                let descriptor = planner::resolve_table(
                    self.source.as_ref(),
                    table,
                    self.config.migration.page_size,
                )
                .await?;
                resolved.insert(table.clone(), descriptor);
            }
        }

        // Phase 3: schema mirroring
        let tables = if opts.from_config_tables {
            debug!("Using configured table queries; skipping schema mirroring");
            tables
        } else {
            self.mirror_schemas(tables, &mut report).await
        };

        if opts.schema_only {
            report.duration_seconds = start.elapsed().as_secs_f64();
            info!(
                "Schema-only run finished in {:.2}s. Logs: {}",
                report.duration_seconds,
                self.run_dir.display()
            );
            return Ok(report);
        }

        // Phase 4: planning
        let mut planned = Vec::with_capacity(tables.len());
        for table in &tables {
            if let Some(p) = self.plan(table, resolved.get(table), &mut report).await? {
                planned.push(p);
            }
        }

        // Phase 5: destination check and truncate
        let mut ready = Vec::with_capacity(planned.len());
        for table in planned {
            if self.prepare_target(&table.name, &mut report).await {
                ready.push(table);
            }
        }

        // Phase 6: chunk tasks
        let tasks: Vec<MigrationTask> = ready
            .into_iter()
            .flat_map(|t| t.chunks)
            .map(|(chunk, projection)| MigrationTask { chunk, projection })
            .collect();

        let limit = opts
            .max_concurrent_chunks
            .or(self.config.migration.max_concurrent_chunks);
        self.launch(tasks, limit, &mut report).await;

        report.duration_seconds = start.elapsed().as_secs_f64();
        info!(
            "Migration finished in {:.2}s: {}/{} chunks succeeded, {} rows. Logs: {}",
            report.duration_seconds,
            report.chunks_succeeded,
            report.chunks_total,
            report.rows_copied,
            self.run_dir.display()
        );
        if !report.is_clean() {
            warn!(
                "{} chunk(s) failed and {} table(s) were skipped; see {}",
                report.chunks_failed,
                report.skipped_tables.len(),
                self.run_dir.display()
            );
        }

        Ok(report)
    }

    async fn resolve_table_set(&self, opts: &RunOptions) -> Result<Vec<String>> {
        let migration = &self.config.migration;

        if opts.from_config_tables {
            if migration.tables.is_empty() {
                return Err(MigrateError::Config(
                    "--from-config-tables requires a non-empty migration.tables map".into(),
                ));
            }
            return Ok(migration
                .tables
                .keys()
                .filter(|t| !migration.is_excluded(t))
                .cloned()
                .collect());
        }

        self.source.list_tables(&migration.exclude_tables).await
    }

    /// Recreate every destination table concurrently. Returns the tables
    /// whose schema was mirrored.
    async fn mirror_schemas(&self, tables: Vec<String>, report: &mut MigrationReport) -> Vec<String> {
        let results = join_all(tables.iter().map(|table| self.mirror_schema(table))).await;

        let mut mirrored = Vec::with_capacity(tables.len());
        for (table, result) in tables.into_iter().zip(results) {
            match result {
                Ok(()) => mirrored.push(table),
                Err((ddl, e)) => {
                    error!("Table {} create failed: {}", table, e);
                    self.failures
                        .record(FailureRecord::new(
                            FailureCategory::TableCreateFailed,
                            &table,
                            None,
                            ddl,
                            &e,
                        ))
                        .await;
                    report.skipped_tables.push(SkippedTable {
                        table,
                        reason: e.to_string(),
                    });
                }
            }
        }

        info!("Mirrored {}/{} table schemas", mirrored.len(), report.tables_total);
        mirrored
    }

    async fn mirror_schema(&self, table: &str) -> std::result::Result<(), (String, MigrateError)> {
        let columns = self
            .source
            .columns(table)
            .await
            .map_err(|e| (String::new(), e))?;
        if columns.is_empty() {
            return Err((
                String::new(),
                MigrateError::schema(table, "source table has no columns"),
            ));
        }

        let ddl = self.target.create_table_sql(table, &columns);
        info!("Creating table {}", table);
        self.target
            .recreate_table(table, &ddl)
            .await
            .map_err(|e| (ddl, e))
    }

    /// Plan one table. Discovered tables come with their resolved
    /// descriptor; configured tables have none. `Ok(None)` means the table
    /// was skipped.
    async fn plan(
        &self,
        table: &str,
        descriptor: Option<&TableDescriptor>,
        report: &mut MigrationReport,
    ) -> Result<Option<PlannedTable>> {
        let chunks_with_probes: Vec<(FetchDescriptor, String)> = match descriptor {
            Some(descriptor) => {
                // Catalog failures are fatal.
                let probe = planner::table_probe_sql(table);
                planner::plan_table(self.source.as_ref(), descriptor)
                    .await?
                    .into_iter()
                    .map(|chunk| (chunk, probe.clone()))
                    .collect()
            }
            None => {
                let queries = self
                .config
                .migration
                .tables
                .get(table)
                .map(Vec::as_slice)
                    .unwrap_or_default();
                planner::plan_custom(table, queries)
                    .into_iter()
                    .map(|chunk| {
                        let probe = planner::query_probe_sql(&chunk.query);
                        (chunk, probe)
                    })
                    .collect()
            }
        };

        // Probe each distinct statement shape once.
        let mut projections: HashMap<String, Arc<ColumnProjection>> = HashMap::new();
        let mut chunks = Vec::with_capacity(chunks_with_probes.len());
        for (chunk, probe) in chunks_with_probes {
            if let Some(p) = projections.get(&probe) {
                chunks.push((chunk, p.clone()));
                continue;
            }

            let probed = self.source.probe_columns(&probe).await;
            let projection = match probed {
                Ok(p) if !p.is_empty() => Arc::new(p),
                Ok(_) => {
                    self.skip(
                        report,
                        table,
                        FailureCategory::FetchFailed,
                        &probe,
                        "probe returned no columns",
                    )
                    .await;
                    return Ok(None);
                }
                Err(e) => {
                    self.skip(report, table, FailureCategory::FetchFailed, &probe, &e).await;
                    return Ok(None);
                }
            };
            projections.insert(probe, projection.clone());
            chunks.push((chunk, projection));
        }

        info!("{}: {} chunk(s) planned", table, chunks.len());
        Ok(Some(PlannedTable {
            name: table.to_string(),
            chunks,
        }))
    }

    /// Make sure the destination table exists and is empty.
    async fn prepare_target(&self, table: &str, report: &mut MigrationReport) -> bool {
        match self.target.table_exists(table).await {
            Ok(true) => {}
            Ok(false) => {
                self.skip(
                    report,
                    table,
                    FailureCategory::TargetTableMissing,
                    "",
                    "destination table does not exist",
                )
                .await;
                return false;
            }
            Err(e) => {
                self.skip(report, table, FailureCategory::TargetTableMissing, "", &e).await;
                return false;
            }
        }

        match self.target.truncate_table(table).await {
            Ok(()) => true,
            Err(e) => {
                self.skip(report, table, FailureCategory::TruncateFailed, "", &e).await;
                false
            }
        }
    }

    async fn skip(
        &self,
        report: &mut MigrationReport,
        table: &str,
        category: FailureCategory,
        payload: &str,
        error: impl std::fmt::Display,
    ) {
        let reason = error.to_string();
        error!("Skipping table {}: {}", table, reason);
        self.failures
            .record(FailureRecord::new(category, table, None, payload, &reason))
            .await;
        report.skipped_tables.push(SkippedTable {
            table: table.to_string(),
            reason,
        });
    }

    /// Launch every task and wait for all of them.
    async fn launch(&self, tasks: Vec<MigrationTask>, limit: Option<usize>, report: &mut MigrationReport) {
        let total = tasks.len();
        report.chunks_total = total;
        if total == 0 {
            return;
        }

        let semaphore = limit.map(|n| Arc::new(Semaphore::new(n.max(1))));
        match limit {
            Some(n) => info!("Launching {} chunk task(s), at most {} at a time", total, n),
            None => info!("Launching {} chunk task(s)", total),
        }

        let executor = ChunkExecutor::new(
            self.source.clone(),
            self.target.clone(),
            self.failures.clone(),
        );

        let mut set = JoinSet::new();
        let mut owners = HashMap::with_capacity(total);
        for task in tasks {
            let owner = (task.chunk.table.clone(), task.chunk.index);
            let executor = executor.clone();
            let semaphore = semaphore.clone();
            let handle = set.spawn(async move {
                let _permit = match semaphore {
                    Some(s) => s.acquire_owned().await.ok(),
                    None => None,
                };
                executor.execute(task).await
            });
            owners.insert(handle.id(), owner);
        }

        let mut done = 0usize;
        while let Some(joined) = set.join_next_with_id().await {
            done += 1;
            match joined {
                Ok((_, outcome)) => match outcome.signal {
                    CompletionSignal::Success { rows, elapsed } => {
                        info!(
                            "[{}/{}] {}[{}] done: {} rows in {:.2?}",
                            done, total, outcome.table, outcome.index, rows, elapsed
                        );
                        report.chunks_succeeded += 1;
                        report.rows_copied += rows;
                    }
                    CompletionSignal::Failure(e) => {
                        warn!(
                            "[{}/{}] {}[{}] failed: {}",
                            done, total, outcome.table, outcome.index, e
                        );
                        report.chunks_failed += 1;
                        report.failed_chunks.push(FailedChunk {
                            table: outcome.table,
                            index: outcome.index,
                            error: e.to_string(),
                        });
                    }
                },
                Err(e) => {
                    let (table, index) = owners
                        .get(&e.id())
                        .cloned()
                        .unwrap_or_else(|| ("<unknown>".to_string(), 0));
                    error!("[{}/{}] {}[{}] task panicked: {}", done, total, table, index, e);
                    report.chunks_failed += 1;
                    report.failed_chunks.push(FailedChunk {
                        table,
                        index,
                        error: format!("task panicked: {}", e),
                    });
                }
            }
        }
    }
}
