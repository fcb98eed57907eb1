//! Capabilities the migration engine consumes.
//!
//! - [`SourceReader`]: catalog metadata and forward-only row streams
//! - [`TargetWriter`]: schema mirroring, truncation and bulk loads
//! - [`BulkLoad`]: one destination transaction with a COPY in progress
//!
//! The coordinator owns one reader and one writer and hands them to every
//! chunk task, so tests can substitute in-memory fakes.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;

use super::schema::{Column, ColumnProjection};
use super::value::{CopyValue, SqlValue};

/// One decoded source row, in projection order.
pub type Row = Vec<SqlValue<'static>>;

/// Read metadata and rows from the source database.
#[async_trait]
pub trait SourceReader: Send + Sync {
    /// Base tables of the source database, ordered by name, minus `exclude`
    /// (case-insensitive).
    async fn list_tables(&self, exclude: &[String]) -> Result<Vec<String>>;

    /// Lowercased primary key columns in ordinal order. Empty when the table
    /// has no primary key.
    async fn primary_key(&self, table: &str) -> Result<Vec<String>>;

    /// Exact row count.
    async fn row_count(&self, table: &str) -> Result<u64>;

    /// Column metadata used by the DDL translator.
    async fn columns(&self, table: &str) -> Result<Vec<Column>>;

    /// Describe the result shape of a zero-row probe statement.
    async fn probe_columns(&self, probe_sql: &str) -> Result<ColumnProjection>;

    /// Start streaming the rows of a fetch query.
    ///
    /// The reader spawns a background task that walks a forward-only cursor
    /// and sends one decoded row per message. `col_types` are the normalized
    /// projection types, in result order. The stream ends after the first
    /// error.
    fn read_rows(&self, sql: String, col_types: Vec<String>) -> mpsc::Receiver<Result<Row>>;

    /// Round-trip a trivial query.
    async fn test_connection(&self) -> Result<()>;

    /// Get the database type identifier.
    fn db_type(&self) -> &str;

    /// Close all connections.
    async fn close(&self);
}

/// Write schema and data to the destination database.
#[async_trait]
pub trait TargetWriter: Send + Sync {
    /// Probe the destination table with a zero-row query.
    async fn table_exists(&self, table: &str) -> Result<bool>;

    /// Build the CREATE TABLE statement for a source table.
    fn create_table_sql(&self, table: &str, columns: &[Column]) -> String;

    /// Drop the table if it exists (cascading) and run `create_sql`.
    async fn recreate_table(&self, table: &str, create_sql: &str) -> Result<()>;

    /// Remove every row of the destination table.
    async fn truncate_table(&self, table: &str) -> Result<()>;

    /// Open a transaction and prepare a bulk load bound to `columns`.
    async fn begin_load(&self, table: &str, columns: &[String]) -> Result<Box<dyn BulkLoad>>;

    /// Round-trip a trivial query.
    async fn test_connection(&self) -> Result<()>;

    /// Get the database type identifier.
    fn db_type(&self) -> &str;

    /// Close all connections.
    async fn close(&self);
}

/// An open destination transaction with a bulk load in progress.
///
/// Rows become visible only after [`BulkLoad::commit`]. Dropping a load
/// without committing abandons the transaction.
#[async_trait]
pub trait BulkLoad: Send {
    /// Append one row to the load buffer. May send buffered data.
    async fn feed(&mut self, row: &[CopyValue]) -> Result<()>;

    /// Send everything still buffered and close the load statement.
    /// Returns the number of rows accepted by the destination.
    async fn flush(&mut self) -> Result<u64>;

    /// Commit the transaction.
    async fn commit(&mut self) -> Result<()>;

    /// Abandon the transaction.
    async fn rollback(&mut self) -> Result<()>;
}
