//! Chunk execution.
//!
//! A chunk is copied as one independent unit: probe the destination table,
//! open one destination transaction with a bulk load, open a forward-only
//! source cursor, feed every mapped row, flush and commit. Any failure leaves
//! the destination untouched by this chunk and is reported as a
//! [`CompletionSignal::Failure`] plus one failure record. Nothing is retried.

mod mapping;

pub use mapping::{map_row, render_row, render_source_row};

use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, error, warn};

use crate::core::schema::{ColumnProjection, FetchDescriptor};
use crate::core::traits::{BulkLoad, SourceReader, TargetWriter};
use crate::core::value::CopyValue;
use crate::failure::{FailureCategory, FailureRecord, FailureSink};
use crate::typemap::{transfer_mode, TransferMode};

/// The unit of concurrent execution: one fetch descriptor plus the table's
/// column projection.
#[derive(Debug, Clone)]
pub struct MigrationTask {
    pub chunk: FetchDescriptor,
    pub projection: Arc<ColumnProjection>,
}

/// Why a chunk failed. Never propagated past the executor.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChunkError {
    #[error("destination table {0} does not exist")]
    TargetMissing(String),

    #[error("source fetch failed: {0}")]
    Fetch(String),

    #[error("row mapping failed: {0}")]
    Mapping(String),

    #[error("row feed failed: {0}")]
    Feed(String),

    #[error("bulk-load flush failed: {0}")]
    Flush(String),

    #[error("commit failed: {0}")]
    Commit(String),
}

impl ChunkError {
    /// Failure-log category for this error.
    pub fn category(&self) -> FailureCategory {
        match self {
            ChunkError::TargetMissing(_) => FailureCategory::TargetTableMissing,
            ChunkError::Fetch(_) => FailureCategory::FetchFailed,
            ChunkError::Mapping(_) => FailureCategory::RowMappingFailed,
            ChunkError::Feed(_) => FailureCategory::RowFeedFailed,
            ChunkError::Flush(_) => FailureCategory::ErrorTableData,
            ChunkError::Commit(_) => FailureCategory::CommitFailed,
        }
    }
}

/// Emitted exactly once per task.
#[derive(Debug, Clone, PartialEq)]
pub enum CompletionSignal {
    Success { rows: u64, elapsed: Duration },
    Failure(ChunkError),
}

impl CompletionSignal {
    pub fn is_success(&self) -> bool {
        matches!(self, CompletionSignal::Success { .. })
    }
}

/// A completion signal tagged with the chunk it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkOutcome {
    pub table: String,
    pub index: usize,
    pub signal: CompletionSignal,
}

/// What a failure record should carry besides the error.
struct Failed {
    error: ChunkError,
    payload: String,
}

impl Failed {
    fn new(error: ChunkError, payload: impl Into<String>) -> Self {
        Self {
            error,
            payload: payload.into(),
        }
    }
}

/// Copies chunks from the source to the destination.
///
/// Holds the shared source/destination capabilities; each call to
/// [`ChunkExecutor::execute`] owns its own cursor and transaction.
#[derive(Clone)]
pub struct ChunkExecutor {
    source: Arc<dyn SourceReader>,
    target: Arc<dyn TargetWriter>,
    failures: Arc<dyn FailureSink>,
}

impl ChunkExecutor {
    pub fn new(
        source: Arc<dyn SourceReader>,
        target: Arc<dyn TargetWriter>,
        failures: Arc<dyn FailureSink>,
    ) -> Self {
        Self {
            source,
            target,
            failures,
        }
    }

    /// Copy one chunk. Never fails: the outcome carries the completion signal.
    pub async fn execute(&self, task: MigrationTask) -> ChunkOutcome {
        let start = Instant::now();
        let MigrationTask { chunk, projection } = task;

        let signal = match self.copy_chunk(&chunk, &projection).await {
            Ok(rows) => {
                let elapsed = start.elapsed();
                debug!(
                    "{}[{}]: copied {} rows in {:?}",
                    chunk.table, chunk.index, rows, elapsed
                );
                CompletionSignal::Success { rows, elapsed }
            }
            Err(failed) => {
                error!("{}[{}]: {}", chunk.table, chunk.index, failed.error);
                self.failures
                    .record(FailureRecord::new(
                        failed.error.category(),
                        &chunk.table,
                        Some(chunk.index),
                        failed.payload,
                        &failed.error,
                    ))
                    .await;
                CompletionSignal::Failure(failed.error)
            }
        };

        ChunkOutcome {
            table: chunk.table,
            index: chunk.index,
            signal,
        }
    }

    async fn copy_chunk(
        &self,
        chunk: &FetchDescriptor,
        projection: &ColumnProjection,
    ) -> Result<u64, Failed> {
        // The source is not touched unless the destination can take the rows.
        match self.target.table_exists(&chunk.table).await {
            Ok(true) => {}
            Ok(false) => {
                return Err(Failed::new(
                    ChunkError::TargetMissing(chunk.table.clone()),
                    chunk.query.as_str(),
                ))
            }
            Err(e) => {
                return Err(Failed::new(
                    ChunkError::TargetMissing(format!("{} (probe failed: {})", chunk.table, e)),
                    chunk.query.as_str(),
                ))
            }
        }

        let names = projection.names();
        let modes: Vec<TransferMode> = projection
            .columns
            .iter()
            .map(|c| transfer_mode(&c.source_type))
            .collect();

        // Destination first, then source: a reader holding a source
        // connection must always have a consumer that can drain it.
        let mut load = self
            .target
            .begin_load(&chunk.table, &names)
            .await
            .map_err(|e| Failed::new(ChunkError::Feed(e.to_string()), chunk.query.as_str()))?;

        let mut rows = self
            .source
            .read_rows(chunk.query.clone(), projection.types());

        let mut last_row: Vec<CopyValue> = Vec::new();
        let mut fed: u64 = 0;

        while let Some(next) = rows.recv().await {
            let row = match next {
                Ok(row) => row,
                Err(e) => {
                    let error = if e.is_decode() {
                        ChunkError::Mapping(e.to_string())
                    } else {
                        ChunkError::Fetch(e.to_string())
                    };
                    let payload = if fed == 0 {
                        chunk.query.clone()
                    } else {
                        render_row(&last_row)
                    };
                    return Err(abandon(load.as_mut(), Failed::new(error, payload)).await);
                }
            };

            let mapped = match map_row(&row, &names, &modes) {
                Ok(mapped) => mapped,
                Err(e) => {
                    let failed = Failed::new(ChunkError::Mapping(e), render_source_row(&row));
                    return Err(abandon(load.as_mut(), failed).await);
                }
            };

            if let Err(e) = load.feed(&mapped).await {
                let failed = Failed::new(ChunkError::Feed(e.to_string()), render_row(&mapped));
                return Err(abandon(load.as_mut(), failed).await);
            }

            last_row = mapped;
            fed += 1;
        }

        let copied = match load.flush().await {
            Ok(copied) => copied,
            Err(e) => {
                let failed = Failed::new(ChunkError::Flush(e.to_string()), render_row(&last_row));
                return Err(abandon(load.as_mut(), failed).await);
            }
        };

        if copied != fed {
            warn!(
                "{}[{}]: fed {} rows but the destination accepted {}",
                chunk.table, chunk.index, fed, copied
            );
        }

        if let Err(e) = load.commit().await {
            let failed = Failed::new(ChunkError::Commit(e.to_string()), render_row(&last_row));
            return Err(abandon(load.as_mut(), failed).await);
        }

        Ok(copied)
    }
}

/// Roll back an abandoned load. Rollback errors are logged and dropped; the
/// loader discards a connection whose transaction state is unknown.
async fn abandon(load: &mut dyn BulkLoad, failed: Failed) -> Failed {
    if let Err(e) = load.rollback().await {
        warn!("Rollback failed (connection discarded): {}", e);
    }
    failed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_error_categories() {
        assert_eq!(
            ChunkError::Flush("x".into()).category(),
            FailureCategory::ErrorTableData
        );
        assert_eq!(
            ChunkError::Mapping("x".into()).category(),
            FailureCategory::RowMappingFailed
        );
        assert_eq!(
            ChunkError::Commit("x".into()).category(),
            FailureCategory::CommitFailed
        );
        assert_eq!(
            ChunkError::TargetMissing("t".into()).category(),
            FailureCategory::TargetTableMissing
        );
    }

    #[test]
    fn test_signal_is_success() {
        let ok = CompletionSignal::Success {
            rows: 1,
            elapsed: Duration::from_millis(3),
        };
        assert!(ok.is_success());
        assert!(!CompletionSignal::Failure(ChunkError::Fetch("x".into())).is_success());
    }
}
