//! # mysql-pg-migrate
//!
//! Chunked bulk migration of MySQL tables into PostgreSQL.
//!
//! Each table is split into independent chunks. A keyed table is paged by
//! its primary key and an unkeyed table is read with a single scan. Every
//! chunk is streamed from MySQL and bulk-loaded into PostgreSQL with `COPY`
//! inside its own transaction, so a failed chunk leaves no partial rows
//! behind. Failures go to a per-run `failures.jsonl`.
//!
//! ## Example
//!
//! ```rust,no_run
//! use mysql_pg_migrate::{create_run_dir, Config, Orchestrator, RunOptions};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> mysql_pg_migrate::Result<()> {
//! let config = Config::load("config.yaml")?;
//! let run_dir = create_run_dir(&config.migration.log_dir)?;
//! let orchestrator = Orchestrator::connect(config, run_dir).await?;
//! let report = orchestrator
//!     .run(RunOptions::default(), CancellationToken::new())
//!     .await?;
//! println!("Copied {} rows", report.rows_copied);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod drivers;
pub mod error;
pub mod failure;
pub mod orchestrator;
pub mod planner;
pub mod transfer;
pub mod typemap;

// Re-exports for convenient access
pub use config::{Config, MigrationConfig, SourceConfig, TargetConfig};
pub use crate::core::{
    BulkLoad, Column, ColumnProjection, CopyValue, FetchDescriptor, Row, SourceReader, SqlValue,
    TableDescriptor, TargetWriter,
};
pub use drivers::{MysqlReader, PostgresWriter, SslMode};
pub use error::{MigrateError, Result};
pub use failure::{
    create_run_dir, FailureCategory, FailureRecord, FailureSink, FileFailureSink,
};
pub use orchestrator::{HealthCheckResult, MigrationReport, Orchestrator, RunOptions};
pub use transfer::{ChunkError, ChunkExecutor, ChunkOutcome, CompletionSignal, MigrationTask};
