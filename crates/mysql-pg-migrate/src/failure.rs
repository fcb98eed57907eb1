//! Failure records for offline diagnosis.
//!
//! Every failed chunk or table produces one [`FailureRecord`]. Records are
//! appended as JSON lines to `failures.jsonl` inside the run directory.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::error::Result;

/// Name of the failure log inside a run directory.
pub const FAILURE_LOG: &str = "failures.jsonl";

/// What kind of problem a record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FailureCategory {
    /// Bulk-load flush failed.
    ErrorTableData,
    /// A source value could not be mapped to its destination form.
    RowMappingFailed,
    /// A mapped row could not be fed to the bulk loader.
    RowFeedFailed,
    /// The destination transaction failed to commit.
    CommitFailed,
    /// The source fetch failed.
    FetchFailed,
    /// The destination table does not exist.
    TargetTableMissing,
    /// Schema mirroring failed for a table.
    TableCreateFailed,
    /// The destination table could not be truncated.
    TruncateFailed,
}

/// One append-only failure record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub time: DateTime<Local>,
    pub category: FailureCategory,
    pub table: String,
    /// Chunk index, absent for table-level failures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk: Option<usize>,
    /// Offending row values rendered as text, or the failing statement.
    pub payload: String,
    pub error: String,
}

impl FailureRecord {
    pub fn new(
        category: FailureCategory,
        table: impl Into<String>,
        chunk: Option<usize>,
        payload: impl Into<String>,
        error: impl ToString,
    ) -> Self {
        Self {
            time: Local::now(),
            category,
            table: table.into(),
            chunk,
            payload: payload.into(),
            error: error.to_string(),
        }
    }
}

/// Destination for failure records. Recording never fails the caller.
#[async_trait]
pub trait FailureSink: Send + Sync {
    async fn record(&self, record: FailureRecord);
}

/// Appends records as JSON lines to `<run_dir>/failures.jsonl`.
///
/// File writes run on the blocking pool, one line per lock hold.
pub struct FileFailureSink {
    path: PathBuf,
    file: Arc<Mutex<Option<File>>>,
}

impl FileFailureSink {
    /// Create a sink writing into `run_dir`. The file is created on the
    /// first record so successful runs leave no empty log behind.
    pub fn new(run_dir: &Path) -> Self {
        Self {
            path: run_dir.join(FAILURE_LOG),
            file: Arc::new(Mutex::new(None)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn append(path: &Path, file: &Mutex<Option<File>>, line: &str) -> std::io::Result<()> {
    let mut guard = file
        .lock()
        .map_err(|_| std::io::Error::other("failure log lock poisoned"))?;

    if guard.is_none() {
        *guard = Some(OpenOptions::new().create(true).append(true).open(path)?);
    }

    if let Some(file) = guard.as_mut() {
        writeln!(file, "{}", line)?;
        file.flush()?;
    }
    Ok(())
}

#[async_trait]
impl FailureSink for FileFailureSink {
    async fn record(&self, record: FailureRecord) {
        let line = match serde_json::to_string(&record) {
            Ok(line) => line,
            Err(e) => {
                error!("Failed to serialize failure record for {}: {}", record.table, e);
                return;
            }
        };

        let path = self.path.clone();
        let file = self.file.clone();
        let written = tokio::task::spawn_blocking(move || append(&path, &file, &line)).await;
        match written {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(
                "Failed to write failure record to {}: {}",
                self.path.display(),
                e
            ),
            Err(e) => error!("Failure log writer task failed: {}", e),
        }
    }
}

/// Create `<log_dir>/<YYYY_MM_DD_HH_MM_SS>` for this run.
pub fn create_run_dir(log_dir: &Path) -> Result<PathBuf> {
    let stamp = Local::now().format("%Y_%m_%d_%H_%M_%S").to_string();
    let dir = log_dir.join(stamp);
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_names() {
        let json = serde_json::to_string(&FailureCategory::ErrorTableData).unwrap();
        assert_eq!(json, "\"errorTableData\"");
        let json = serde_json::to_string(&FailureCategory::TableCreateFailed).unwrap();
        assert_eq!(json, "\"tableCreateFailed\"");
    }

    #[tokio::test]
    async fn test_file_sink_appends_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileFailureSink::new(dir.path());
        assert!(!sink.path().exists());

        sink.record(FailureRecord::new(
            FailureCategory::ErrorTableData,
            "orders",
            Some(2),
            "[1, \"x\"]",
            "COPY failed",
        ))
        .await;
        sink.record(FailureRecord::new(
            FailureCategory::TableCreateFailed,
            "logs",
            None,
            "CREATE TABLE ...",
            "syntax error",
        ))
        .await;

        let content = std::fs::read_to_string(sink.path()).unwrap();
        let records: Vec<FailureRecord> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].table, "orders");
        assert_eq!(records[0].chunk, Some(2));
        assert_eq!(records[1].category, FailureCategory::TableCreateFailed);
        assert_eq!(records[1].chunk, None);
    }

    #[tokio::test]
    async fn test_write_error_is_swallowed() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileFailureSink::new(&dir.path().join("missing").join("deeper"));
        sink.record(FailureRecord::new(
            FailureCategory::CommitFailed,
            "orders",
            Some(0),
            "",
            "boom",
        ))
        .await;
        assert!(!sink.path().exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_records_stay_whole_lines() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(FileFailureSink::new(dir.path()));

        let mut handles = Vec::new();
        for i in 0..64 {
            let sink = sink.clone();
            handles.push(tokio::spawn(async move {
                sink.record(FailureRecord::new(
                    FailureCategory::RowFeedFailed,
                    format!("t{}", i),
                    Some(i),
                    "x".repeat(4096),
                    "broken pipe",
                ))
                .await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let content = std::fs::read_to_string(sink.path()).unwrap();
        let mut chunks: Vec<usize> = content
            .lines()
            .map(|l| serde_json::from_str::<FailureRecord>(l).unwrap().chunk.unwrap())
            .collect();
        chunks.sort_unstable();
        assert_eq!(chunks, (0..64).collect::<Vec<_>>());
    }

    #[test]
    fn test_create_run_dir() {
        let dir = tempfile::tempdir().unwrap();
        let run_dir = create_run_dir(dir.path()).unwrap();
        assert!(run_dir.is_dir());
        let name = run_dir.file_name().unwrap().to_str().unwrap();
        assert_eq!(name.len(), "2024_01_01_00_00_00".len());
        assert_eq!(name.matches('_').count(), 5);
    }
}
