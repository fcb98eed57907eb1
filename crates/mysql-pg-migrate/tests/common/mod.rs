//! In-memory source and destination used by the integration tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use mysql_pg_migrate::{
    BulkLoad, Column, ColumnProjection, Config, CopyValue, FailureRecord, FailureSink,
    MigrateError, Orchestrator, Result, Row, SourceReader, SqlValue, TargetWriter,
};

/// A source table: key columns, rows sorted by key and the probed shape.
#[derive(Clone)]
pub struct FakeTable {
    pub primary_key: Vec<String>,
    pub rows: Vec<Row>,
    pub projection: ColumnProjection,
}

impl FakeTable {
    /// `id INT, note VARCHAR` rows with ids `1..=count`.
    pub fn notes(count: i64, keyed: bool) -> Self {
        Self {
            primary_key: if keyed { vec!["id".to_string()] } else { Vec::new() },
            rows: (1..=count)
                .map(|id| vec![SqlValue::I64(id), SqlValue::text_owned(format!("note {}", id))])
                .collect(),
            projection: ColumnProjection::new([("id", "INT"), ("note", "VARCHAR")]),
        }
    }
}

/// Shared ordered log of source and destination calls.
pub type Journal = Arc<Mutex<Vec<String>>>;

fn note(journal: &Option<Journal>, entry: String) {
    if let Some(journal) = journal {
        journal.lock().unwrap().push(entry);
    }
}

#[derive(Default)]
pub struct FakeSource {
    pub tables: BTreeMap<String, FakeTable>,
    pub reads: AtomicUsize,
    pub journal: Option<Journal>,
}

impl FakeSource {
    pub fn with(mut self, name: &str, table: FakeTable) -> Self {
        self.tables.insert(name.to_string(), table);
        self
    }

    pub fn journaled(mut self, journal: &Journal) -> Self {
        self.journal = Some(journal.clone());
        self
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// The table a statement refers to. Longest name wins.
    fn table_for(&self, sql: &str) -> Option<&FakeTable> {
        self.tables
            .iter()
            .filter(|(name, _)| sql.contains(name.as_str()))
            .max_by_key(|(name, _)| name.len())
            .map(|(_, t)| t)
    }

    fn table(&self, name: &str) -> Result<&FakeTable> {
        self.tables
            .get(name)
            .ok_or_else(|| MigrateError::Config(format!("no such fake table {}", name)))
    }
}

fn number_after(sql: &str, keyword: &str) -> Option<usize> {
    let rest = &sql[sql.find(keyword)? + keyword.len()..];
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

#[async_trait]
impl SourceReader for FakeSource {
    async fn list_tables(&self, exclude: &[String]) -> Result<Vec<String>> {
        Ok(self
            .tables
            .keys()
            .filter(|t| !exclude.iter().any(|e| e.eq_ignore_ascii_case(t)))
            .cloned()
            .collect())
    }

    async fn primary_key(&self, table: &str) -> Result<Vec<String>> {
        Ok(self.table(table)?.primary_key.clone())
    }

    async fn row_count(&self, table: &str) -> Result<u64> {
        Ok(self.table(table)?.rows.len() as u64)
    }

    async fn columns(&self, table: &str) -> Result<Vec<Column>> {
        let t = self.table(table)?;
        Ok(t.projection
            .columns
            .iter()
            .enumerate()
            .map(|(i, c)| Column {
                name: c.name.clone(),
                data_type: c.source_type.to_lowercase(),
                max_length: 0,
                precision: 0,
                scale: 0,
                is_nullable: !t.primary_key.contains(&c.name),
                is_unsigned: false,
                default: None,
                ordinal_pos: i as i32 + 1,
            })
            .collect())
    }

    async fn probe_columns(&self, probe_sql: &str) -> Result<ColumnProjection> {
        self.table_for(probe_sql)
            .map(|t| t.projection.clone())
            .ok_or_else(|| MigrateError::Config(format!("probe of unknown table: {}", probe_sql)))
    }

    fn read_rows(&self, sql: String, _col_types: Vec<String>) -> mpsc::Receiver<Result<Row>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        note(&self.journal, format!("read {}", sql));
        let rows: Vec<Row> = match self.table_for(&sql) {
            Some(t) => {
                let offset = number_after(&sql, "OFFSET ").unwrap_or(0);
                let limit = number_after(&sql, "LIMIT ").unwrap_or(usize::MAX);
                t.rows.iter().skip(offset).take(limit).cloned().collect()
            }
            None => Vec::new(),
        };

        let (tx, rx) = mpsc::channel(1024);
        tokio::spawn(async move {
            for row in rows {
                if tx.send(Ok(row)).await.is_err() {
                    break;
                }
            }
        });
        rx
    }

    async fn test_connection(&self) -> Result<()> {
        Ok(())
    }

    fn db_type(&self) -> &str {
        "mysql"
    }

    async fn close(&self) {}
}

#[derive(Default)]
pub struct TargetState {
    pub tables: Mutex<HashMap<String, Vec<Vec<CopyValue>>>>,
    pub truncates: Mutex<HashMap<String, usize>>,
    pub created: Mutex<Vec<String>>,
    pub active: AtomicUsize,
    pub max_active: AtomicUsize,
}

#[derive(Default)]
pub struct FakeTarget {
    pub state: Arc<TargetState>,
    pub fail_commit: HashSet<String>,
    pub fail_create: HashSet<String>,
    pub fail_flush: HashSet<String>,
    pub flush_delay: Option<Duration>,
    pub journal: Option<Journal>,
}

impl FakeTarget {
    /// A destination that already has `tables`, all empty.
    pub fn with_tables(tables: &[&str]) -> Self {
        let target = Self::default();
        {
            let mut map = target.state.tables.lock().unwrap();
            for t in tables {
                map.insert(t.to_string(), Vec::new());
            }
        }
        target
    }

    pub fn journaled(mut self, journal: &Journal) -> Self {
        self.journal = Some(journal.clone());
        self
    }

    pub fn rows(&self, table: &str) -> Vec<Vec<CopyValue>> {
        self.state
            .tables
            .lock()
            .unwrap()
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    pub fn truncates(&self, table: &str) -> usize {
        self.state
            .truncates
            .lock()
            .unwrap()
            .get(table)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_truncates(&self) -> usize {
        self.state.truncates.lock().unwrap().values().sum()
    }

    pub fn max_active(&self) -> usize {
        self.state.max_active.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TargetWriter for FakeTarget {
    async fn table_exists(&self, table: &str) -> Result<bool> {
        Ok(self.state.tables.lock().unwrap().contains_key(table))
    }

    fn create_table_sql(&self, table: &str, columns: &[Column]) -> String {
        let cols: Vec<&str> = columns.iter().map(|c| c.name.as_str()).collect();
        format!("CREATE TABLE {} ({})", table, cols.join(", "))
    }

    async fn recreate_table(&self, table: &str, create_sql: &str) -> Result<()> {
        if self.fail_create.contains(table) {
            return Err(MigrateError::schema(table, "permission denied"));
        }
        self.state.created.lock().unwrap().push(create_sql.to_string());
        self.state
            .tables
            .lock()
            .unwrap()
            .insert(table.to_string(), Vec::new());
        Ok(())
    }

    async fn truncate_table(&self, table: &str) -> Result<()> {
        *self
            .state
            .truncates
            .lock()
            .unwrap()
            .entry(table.to_string())
            .or_insert(0) += 1;
        if let Some(rows) = self.state.tables.lock().unwrap().get_mut(table) {
            rows.clear();
        }
        Ok(())
    }

    async fn begin_load(&self, table: &str, _columns: &[String]) -> Result<Box<dyn BulkLoad>> {
        note(&self.journal, format!("begin_load {}", table));
        let now = self.state.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.max_active.fetch_max(now, Ordering::SeqCst);
        Ok(Box::new(FakeLoad {
            table: table.to_string(),
            state: self.state.clone(),
            staged: Vec::new(),
            fail_commit: self.fail_commit.contains(table),
            fail_flush: self.fail_flush.contains(table),
            flush_delay: self.flush_delay,
            journal: self.journal.clone(),
            open: true,
        }))
    }

    async fn test_connection(&self) -> Result<()> {
        Ok(())
    }

    fn db_type(&self) -> &str {
        "postgres"
    }

    async fn close(&self) {}
}

pub struct FakeLoad {
    table: String,
    state: Arc<TargetState>,
    staged: Vec<Vec<CopyValue>>,
    fail_commit: bool,
    fail_flush: bool,
    flush_delay: Option<Duration>,
    journal: Option<Journal>,
    open: bool,
}

impl FakeLoad {
    fn finish(&mut self) {
        if self.open {
            self.open = false;
            self.state.active.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl BulkLoad for FakeLoad {
    async fn feed(&mut self, row: &[CopyValue]) -> Result<()> {
        self.staged.push(row.to_vec());
        Ok(())
    }

    async fn flush(&mut self) -> Result<u64> {
        if let Some(delay) = self.flush_delay {
            tokio::time::sleep(delay).await;
        }
        note(&self.journal, format!("flush {}", self.table));
        if self.fail_flush {
            return Err(MigrateError::transfer(&self.table, "invalid input syntax for type integer"));
        }
        Ok(self.staged.len() as u64)
    }

    async fn commit(&mut self) -> Result<()> {
        note(&self.journal, format!("commit {}", self.table));
        if self.fail_commit {
            return Err(MigrateError::transfer(&self.table, "could not serialize access"));
        }
        let staged = std::mem::take(&mut self.staged);
        self.state
            .tables
            .lock()
            .unwrap()
            .entry(self.table.clone())
            .or_default()
            .extend(staged);
        self.finish();
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        note(&self.journal, format!("rollback {}", self.table));
        self.staged.clear();
        self.finish();
        Ok(())
    }
}

impl Drop for FakeLoad {
    fn drop(&mut self) {
        self.finish();
    }
}

#[derive(Default)]
pub struct MemoryFailureSink {
    pub records: Mutex<Vec<FailureRecord>>,
}

impl MemoryFailureSink {
    pub fn records(&self) -> Vec<FailureRecord> {
        self.records.lock().unwrap().clone()
    }

    pub fn for_table(&self, table: &str) -> Vec<FailureRecord> {
        self.records()
            .into_iter()
            .filter(|r| r.table == table)
            .collect()
    }
}

#[async_trait]
impl FailureSink for MemoryFailureSink {
    async fn record(&self, record: FailureRecord) {
        self.records.lock().unwrap().push(record);
    }
}

/// Parse a test configuration. `migration` is the YAML body of the
/// `migration:` section, already indented by two spaces.
pub fn config(migration: &str) -> Config {
    let yaml = format!(
        "source:\n  host: mysql.test\n  database: shop\n  user: reader\n  password: secret\n\
         target:\n  host: pg.test\n  database: shop\n  user: writer\n  password: secret\n\
         migration:\n{}\n",
        migration
    );
    Config::from_yaml(&yaml).unwrap()
}

pub struct Harness {
    pub source: Arc<FakeSource>,
    pub target: Arc<FakeTarget>,
    pub failures: Arc<MemoryFailureSink>,
    pub orchestrator: Orchestrator,
}

pub fn harness(config: Config, source: FakeSource, target: FakeTarget) -> Harness {
    let source = Arc::new(source);
    let target = Arc::new(target);
    let failures = Arc::new(MemoryFailureSink::default());
    let orchestrator = Orchestrator::new(
        config,
        source.clone(),
        target.clone(),
        failures.clone(),
        PathBuf::from("logs/test-run"),
    );
    Harness {
        source,
        target,
        failures,
        orchestrator,
    }
}
