//! PostgreSQL target writer implementation.
//!
//! Implements the `TargetWriter` trait on top of deadpool-postgres. Each
//! bulk load owns one pooled connection, one transaction and one text-format
//! COPY stream.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use deadpool_postgres::{Manager, ManagerConfig, Object, Pool, RecyclingMethod};
use futures::SinkExt;
use tokio_postgres::error::SqlState;
use tokio_postgres::{Config as PgConfig, CopyInSink};
use tracing::{debug, info, warn};

use crate::config::TargetConfig;
use crate::core::schema::Column;
use crate::core::traits::{BulkLoad, TargetWriter};
use crate::core::value::CopyValue;
use crate::error::{MigrateError, Result};

use super::ddl::{create_table_sql, drop_table_sql, qualify, quote_ident};

/// Connection timeout for new physical connections.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// PostgreSQL target writer implementation.
pub struct PostgresWriter {
    pool: Pool,
    schema: String,
    copy_flush_bytes: usize,
}

impl PostgresWriter {
    /// Create a new PostgreSQL writer from configuration.
    pub async fn new(config: &TargetConfig, copy_flush_bytes: usize) -> Result<Self> {
        let mut pg_config = PgConfig::new();
        pg_config.host(&config.host);
        pg_config.port(config.port);
        pg_config.dbname(&config.database);
        pg_config.user(&config.user);
        pg_config.password(&config.password);
        pg_config.application_name("mysql-pg-migrate");

        // Connection options for reliability
        pg_config.keepalives(true);
        pg_config.keepalives_idle(Duration::from_secs(30));
        pg_config.connect_timeout(CONNECT_TIMEOUT);

        // Verified recycling discards connections whose last transaction ended
        // in a broken state.
        let mgr_config = ManagerConfig {
            recycling_method: RecyclingMethod::Verified,
        };

        let pool = match config.ssl_mode.connector() {
            None => {
                warn!("PostgreSQL TLS is disabled. Credentials will be transmitted in plaintext.");
                let mgr = Manager::from_config(pg_config, tokio_postgres::NoTls, mgr_config);
                Pool::builder(mgr)
                    .max_size(config.max_connections)
                    .build()
                    .map_err(|e| MigrateError::pool(e, "creating PostgreSQL target pool"))?
            }
            Some(tls_connector) => {
                let mgr = Manager::from_config(pg_config, tls_connector, mgr_config);
                Pool::builder(mgr)
                    .max_size(config.max_connections)
                    .build()
                    .map_err(|e| MigrateError::pool(e, "creating PostgreSQL target pool"))?
            }
        };

        let client = pool
            .get()
            .await
            .map_err(|e| MigrateError::pool(e, "testing PostgreSQL target connection"))?;
        client.simple_query("SELECT 1").await?;

        info!(
            "Connected to PostgreSQL target: {}:{}/{}",
            config.host, config.port, config.database
        );

        Ok(Self {
            pool,
            schema: config.schema.clone(),
            copy_flush_bytes,
        })
    }

    async fn client(&self, context: &str) -> Result<Object> {
        self.pool
            .get()
            .await
            .map_err(|e| MigrateError::pool(e, context.to_string()))
    }
}

#[async_trait]
impl TargetWriter for PostgresWriter {
    async fn table_exists(&self, table: &str) -> Result<bool> {
        let client = self.client("probing target table").await?;
        let sql = format!("SELECT * FROM {} WHERE 1=0", qualify(&self.schema, table));

        match client.simple_query(&sql).await {
            Ok(_) => Ok(true),
            Err(e)
                if e.code() == Some(&SqlState::UNDEFINED_TABLE)
                    || e.code() == Some(&SqlState::INVALID_SCHEMA_NAME) =>
            {
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn create_table_sql(&self, table: &str, columns: &[Column]) -> String {
        create_table_sql(&self.schema, table, columns)
    }

    async fn recreate_table(&self, table: &str, create_sql: &str) -> Result<()> {
        let client = self.client("recreating target table").await?;

        client
            .batch_execute(&drop_table_sql(&self.schema, table))
            .await
            .map_err(|e| MigrateError::schema(table, format!("dropping table: {}", e)))?;
        client
            .batch_execute(create_sql)
            .await
            .map_err(|e| MigrateError::schema(table, format!("creating table: {}", e)))?;

        debug!("Created table {}", qualify(&self.schema, table));
        Ok(())
    }

    async fn truncate_table(&self, table: &str) -> Result<()> {
        let client = self.client("truncating target table").await?;
        let sql = format!("TRUNCATE TABLE {}", qualify(&self.schema, table));
        client.batch_execute(&sql).await?;
        debug!("Truncated {}", qualify(&self.schema, table));
        Ok(())
    }

    async fn begin_load(&self, table: &str, columns: &[String]) -> Result<Box<dyn BulkLoad>> {
        let client = self.client("starting bulk load").await?;

        client.batch_execute("BEGIN").await?;

        let col_list: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
        let copy_sql = format!(
            "COPY {} ({}) FROM STDIN",
            qualify(&self.schema, table),
            col_list.join(", ")
        );

        // The load owns the connection from here on so that a failed COPY
        // still rolls back or discards it.
        let mut load = PgBulkLoad {
            table: table.to_string(),
            client: Some(client),
            sink: None,
            buf: BytesMut::with_capacity(self.copy_flush_bytes.min(1024 * 1024)),
            flush_bytes: self.copy_flush_bytes,
            in_transaction: true,
        };

        let started = load.client()?.copy_in::<_, Bytes>(copy_sql.as_str()).await;
        match started {
            Ok(sink) => {
                load.sink = Some(Box::pin(sink));
                Ok(Box::new(load))
            }
            Err(e) => {
                load.rollback().await.ok();
                Err(MigrateError::transfer(table, format!("initiating COPY: {}", e)))
            }
        }
    }

    async fn test_connection(&self) -> Result<()> {
        let client = self.client("testing PostgreSQL target connection").await?;
        client.simple_query("SELECT 1").await?;
        Ok(())
    }

    fn db_type(&self) -> &str {
        "postgres"
    }

    async fn close(&self) {
        self.pool.close();
    }
}

/// One destination transaction with a text-format COPY in progress.
pub struct PgBulkLoad {
    table: String,
    client: Option<Object>,
    sink: Option<Pin<Box<CopyInSink<Bytes>>>>,
    buf: BytesMut,
    flush_bytes: usize,
    in_transaction: bool,
}

impl PgBulkLoad {
    fn client(&self) -> Result<&Object> {
        self.client
            .as_ref()
            .ok_or_else(|| MigrateError::transfer(&self.table, "connection already released"))
    }

    fn sink(&mut self) -> Result<&mut Pin<Box<CopyInSink<Bytes>>>> {
        let table = &self.table;
        self.sink
            .as_mut()
            .ok_or_else(|| MigrateError::transfer(table, "COPY is not in progress"))
    }

    async fn send_buffered(&mut self) -> Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let data = self.buf.split().freeze();
        let table = self.table.clone();
        self.sink()?
            .send(data)
            .await
            .map_err(|e| MigrateError::transfer(table, format!("sending COPY data: {}", e)))
    }

    /// Detach the connection from the pool so a transaction in an unknown
    /// state is closed by the server rather than reused.
    fn discard_connection(&mut self) {
        if let Some(client) = self.client.take() {
            drop(Object::take(client));
        }
    }
}

#[async_trait]
impl BulkLoad for PgBulkLoad {
    async fn feed(&mut self, row: &[CopyValue]) -> Result<()> {
        encode_copy_row(&mut self.buf, row);
        if self.buf.len() >= self.flush_bytes {
            self.send_buffered().await?;
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<u64> {
        self.send_buffered().await?;
        let mut sink = self
            .sink
            .take()
            .ok_or_else(|| MigrateError::transfer(&self.table, "COPY is not in progress"))?;
        let rows = sink
            .as_mut()
            .finish()
            .await
            .map_err(|e| MigrateError::transfer(&self.table, format!("finishing COPY: {}", e)))?;
        Ok(rows)
    }

    async fn commit(&mut self) -> Result<()> {
        let result = self.client()?.batch_execute("COMMIT").await;
        self.in_transaction = false;
        result.map_err(|e| {
            self.discard_connection();
            e.into()
        })
    }

    async fn rollback(&mut self) -> Result<()> {
        // Dropping an unfinished sink aborts the COPY.
        self.sink = None;
        self.buf.clear();

        let result = self.client()?.batch_execute("ROLLBACK").await;
        self.in_transaction = false;
        result.map_err(|e| {
            self.discard_connection();
            e.into()
        })
    }
}

impl Drop for PgBulkLoad {
    fn drop(&mut self) {
        if self.in_transaction {
            self.discard_connection();
        }
    }
}

/// Append one row in COPY text format.
pub fn encode_copy_row(buf: &mut BytesMut, row: &[CopyValue]) {
    for (i, value) in row.iter().enumerate() {
        if i > 0 {
            buf.put_u8(b'\t');
        }
        match value {
            CopyValue::Null => buf.put_slice(b"\\N"),
            CopyValue::Text(s) => escape_copy_text(buf, s),
            CopyValue::Binary(b) => {
                buf.put_slice(b"\\\\x");
                buf.put_slice(hex::encode(b).as_bytes());
            }
        }
    }
    buf.put_u8(b'\n');
}

/// Escape text for PostgreSQL COPY.
fn escape_copy_text(buf: &mut BytesMut, s: &str) {
    for c in s.chars() {
        match c {
            '\\' => buf.put_slice(b"\\\\"),
            '\t' => buf.put_slice(b"\\t"),
            '\n' => buf.put_slice(b"\\n"),
            '\r' => buf.put_slice(b"\\r"),
            _ => {
                let mut tmp = [0u8; 4];
                buf.put_slice(c.encode_utf8(&mut tmp).as_bytes());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(row: &[CopyValue]) -> String {
        let mut buf = BytesMut::new();
        encode_copy_row(&mut buf, row);
        String::from_utf8(buf.to_vec()).unwrap()
    }

    #[test]
    fn test_encode_copy_row() {
        let row = vec![
            CopyValue::Text("1".into()),
            CopyValue::Null,
            CopyValue::Text("hello".into()),
        ];
        assert_eq!(encode(&row), "1\t\\N\thello\n");
    }

    #[test]
    fn test_escape_special_characters() {
        let row = vec![CopyValue::Text("a\tb\nc\\d\re".into())];
        assert_eq!(encode(&row), "a\\tb\\nc\\\\d\\re\n");
    }

    #[test]
    fn test_binary_is_hex_bytea() {
        let row = vec![CopyValue::Binary(vec![0x00, 0xff, 0x10])];
        assert_eq!(encode(&row), "\\\\x00ff10\n");
    }

    #[test]
    fn test_unicode_passes_through() {
        let row = vec![CopyValue::Text("héllo wörld".into())];
        assert_eq!(encode(&row), "héllo wörld\n");
    }
}
