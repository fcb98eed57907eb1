//! MySQL source reader implementation.
//!
//! Implements the `SourceReader` trait on top of a SQLx connection pool.
//! Fetch queries are streamed through a forward-only cursor and decoded
//! according to the column projection's normalized types.

use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, TryStreamExt};
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions, MySqlRow, MySqlSslMode};
use sqlx::{Column as _, Executor, Row as _, Statement as _, TypeInfo as _, ValueRef as _};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::config::SourceConfig;
use crate::core::schema::{Column, ColumnProjection};
use crate::core::traits::{Row, SourceReader};
use crate::core::value::SqlValue;
use crate::error::{MigrateError, Result};
use crate::typemap::base_type;

/// How long a chunk task may wait for a pooled connection.
///
/// Fan-out is unbounded by default, so tasks routinely queue behind
/// `max_connections`; the wait must outlast the slowest chunk.
const POOL_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(3600);

/// Rows buffered between the cursor task and the chunk executor.
const ROW_CHANNEL_CAPACITY: usize = 1024;

/// MySQL source reader implementation.
pub struct MysqlReader {
    pool: MySqlPool,
    database: String,
}

impl MysqlReader {
    /// Create a new MySQL reader from configuration.
    pub async fn new(config: &SourceConfig) -> Result<Self> {
        let options = MySqlConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .database(&config.database)
            .username(&config.user)
            .password(&config.password)
            .ssl_mode(MySqlSslMode::Preferred);

        let pool = MySqlPoolOptions::new()
            .max_connections(config.max_connections as u32)
            .acquire_timeout(POOL_ACQUIRE_TIMEOUT)
            .connect_with(options)
            .await
            .map_err(|e| MigrateError::pool(e, "creating MySQL source pool"))?;

        sqlx::query("SELECT 1")
            .fetch_one(&pool)
            .await
            .map_err(|e| MigrateError::pool(e, "testing MySQL source connection"))?;

        info!("Connected to MySQL source: {}", config.display_url());

        Ok(Self {
            pool,
            database: config.database.clone(),
        })
    }

    /// Quote a MySQL identifier with backticks.
    pub fn quote_ident(name: &str) -> String {
        format!("`{}`", name.replace('`', "``"))
    }

    async fn read_rows_impl(
        pool: MySqlPool,
        sql: String,
        decoders: Vec<Decoder>,
        tx: mpsc::Sender<Result<Row>>,
    ) -> Result<()> {
        let rows = sqlx::query(&sql).fetch(&pool);
        forward_rows(rows, |row| decode_row(row, &decoders), &tx).await
    }
}

/// Pump decoded rows into `tx` until the cursor ends or the consumer goes
/// away. A consumer that drops its receiver (aborted chunk, cancelled run)
/// stops the pump even while the cursor is waiting on the server, which
/// releases the pooled connection.
async fn forward_rows<S, T, F>(mut rows: S, decode: F, tx: &mpsc::Sender<Result<Row>>) -> Result<()>
where
    S: Stream<Item = std::result::Result<T, sqlx::Error>> + Unpin,
    F: Fn(&T) -> Result<Row>,
{
    loop {
        let next = tokio::select! {
            biased;
            _ = tx.closed() => {
                debug!("row stream closed by consumer");
                return Ok(());
            }
            next = rows.try_next() => next?,
        };
        let Some(row) = next else {
            return Ok(());
        };

        let values = decode(&row)?;
        if tx.send(Ok(values)).await.is_err() {
            debug!("row stream closed by consumer");
            return Ok(());
        }
    }
}

fn get_i64(row: &MySqlRow, col: &str) -> Result<i64> {
    row.try_get::<i64, _>(col).map_err(MigrateError::from)
}

#[async_trait]
impl SourceReader for MysqlReader {
    async fn list_tables(&self, exclude: &[String]) -> Result<Vec<String>> {
        let query = r#"
            SELECT CAST(TABLE_NAME AS CHAR(255)) AS TABLE_NAME
            FROM INFORMATION_SCHEMA.TABLES
            WHERE TABLE_SCHEMA = ? AND TABLE_TYPE = 'BASE TABLE'
            ORDER BY TABLE_NAME
        "#;

        let rows: Vec<MySqlRow> = sqlx::query(query)
            .bind(&self.database)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| MigrateError::pool(e, "listing MySQL tables"))?;

        let mut tables = Vec::with_capacity(rows.len());
        for row in rows {
            let name: String = row.try_get("TABLE_NAME")?;
            if exclude.iter().any(|e| e.eq_ignore_ascii_case(&name)) {
                debug!("Excluding table {}", name);
                continue;
            }
            tables.push(name);
        }

        Ok(tables)
    }

    async fn primary_key(&self, table: &str) -> Result<Vec<String>> {
        let query = r#"
            SELECT CAST(COLUMN_NAME AS CHAR(255)) AS COLUMN_NAME
            FROM INFORMATION_SCHEMA.KEY_COLUMN_USAGE
            WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ? AND CONSTRAINT_NAME = 'PRIMARY'
            ORDER BY ORDINAL_POSITION
        "#;

        let rows: Vec<MySqlRow> = sqlx::query(query)
            .bind(&self.database)
            .bind(table)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| MigrateError::pool(e, "loading MySQL primary key"))?;

        rows.iter()
            .map(|row| {
                row.try_get::<String, _>("COLUMN_NAME")
                    .map(|c| c.to_lowercase())
                    .map_err(MigrateError::from)
            })
            .collect()
    }

    async fn row_count(&self, table: &str) -> Result<u64> {
        let query = format!("SELECT COUNT(*) AS cnt FROM {}", Self::quote_ident(table));
        let row: MySqlRow = sqlx::query(&query)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| MigrateError::pool(e, "counting MySQL rows"))?;

        Ok(get_i64(&row, "cnt")?.max(0) as u64)
    }

    async fn columns(&self, table: &str) -> Result<Vec<Column>> {
        // max_length is capped at i32 range, -1 for LONGTEXT-sized columns
        let query = r#"
            SELECT
                CAST(COLUMN_NAME AS CHAR(255)) AS COLUMN_NAME,
                CAST(DATA_TYPE AS CHAR(255)) AS DATA_TYPE,
                CAST(COLUMN_TYPE AS CHAR(255)) AS COLUMN_TYPE,
                CAST(CASE
                    WHEN DATA_TYPE = 'bit' THEN NUMERIC_PRECISION
                    WHEN CHARACTER_MAXIMUM_LENGTH IS NULL THEN 0
                    WHEN CHARACTER_MAXIMUM_LENGTH > 2147483647 THEN -1
                    ELSE CHARACTER_MAXIMUM_LENGTH
                END AS SIGNED) AS max_length,
                CAST(COALESCE(NUMERIC_PRECISION, 0) AS SIGNED) AS num_precision,
                CAST(COALESCE(NUMERIC_SCALE, 0) AS SIGNED) AS num_scale,
                CAST(IF(IS_NULLABLE = 'YES', 1, 0) AS SIGNED) AS is_nullable,
                CAST(COLUMN_DEFAULT AS CHAR(4000)) AS COLUMN_DEFAULT,
                CAST(ORDINAL_POSITION AS SIGNED) AS ORDINAL_POSITION
            FROM INFORMATION_SCHEMA.COLUMNS
            WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ?
            ORDER BY ORDINAL_POSITION
        "#;

        let rows: Vec<MySqlRow> = sqlx::query(query)
            .bind(&self.database)
            .bind(table)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| MigrateError::pool(e, "loading MySQL columns"))?;

        let mut columns = Vec::with_capacity(rows.len());
        for row in rows {
            let column_type: String = row.try_get("COLUMN_TYPE")?;
            let column_type = column_type.to_lowercase();
            let mut max_length = get_i64(&row, "max_length")?;
            // BOOL is an alias for tinyint(1)
            if column_type.starts_with("tinyint(1)") {
                max_length = 1;
            }

            columns.push(Column {
                name: row.try_get::<String, _>("COLUMN_NAME")?.to_lowercase(),
                data_type: row.try_get::<String, _>("DATA_TYPE")?.to_lowercase(),
                max_length,
                precision: get_i64(&row, "num_precision")? as i32,
                scale: get_i64(&row, "num_scale")? as i32,
                is_nullable: get_i64(&row, "is_nullable")? == 1,
                is_unsigned: column_type.contains("unsigned"),
                default: row.try_get::<Option<String>, _>("COLUMN_DEFAULT")?,
                ordinal_pos: get_i64(&row, "ORDINAL_POSITION")? as i32,
            });
        }

        debug!("Loaded {} columns for {}", columns.len(), table);
        Ok(columns)
    }

    async fn probe_columns(&self, probe_sql: &str) -> Result<ColumnProjection> {
        let statement = (&self.pool)
            .prepare(probe_sql)
            .await
            .map_err(|e| MigrateError::pool(e, "probing MySQL column projection"))?;

        Ok(ColumnProjection::new(
            statement
                .columns()
                .iter()
                .map(|c| (c.name().to_string(), c.type_info().name().to_string())),
        ))
    }

    fn read_rows(&self, sql: String, col_types: Vec<String>) -> mpsc::Receiver<Result<Row>> {
        let (tx, rx) = mpsc::channel(ROW_CHANNEL_CAPACITY);
        let pool = self.pool.clone();
        let decoders = col_types.iter().map(|t| Decoder::for_type(t)).collect();

        tokio::spawn(async move {
            let result = Self::read_rows_impl(pool, sql, decoders, tx.clone()).await;
            if let Err(e) = result {
                let _ = tx.send(Err(e)).await;
            }
        });

        rx
    }

    async fn test_connection(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| MigrateError::pool(e, "testing MySQL source connection"))?;
        Ok(())
    }

    fn db_type(&self) -> &str {
        "mysql"
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

/// Per-column decode strategy, chosen once per stream from the projection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decoder {
    Bool,
    Signed,
    Unsigned,
    Float,
    Double,
    Date,
    Time,
    DateTime,
    Year,
    Bit,
    /// Character, binary, JSON, ENUM/SET and spatial data: raw bytes.
    /// DECIMAL lands here too; its text form can exceed any fixed-point type.
    Bytes,
}

impl Decoder {
    fn for_type(source_type: &str) -> Self {
        let unsigned = source_type.to_lowercase().contains("unsigned");
        match base_type(source_type).as_str() {
            "bool" | "boolean" => Decoder::Bool,
            "tinyint" | "smallint" | "mediumint" | "int" | "integer" | "bigint" if unsigned => {
                Decoder::Unsigned
            }
            "tinyint" | "smallint" | "mediumint" | "int" | "integer" | "bigint" => Decoder::Signed,
            "float" => Decoder::Float,
            "double" | "double precision" | "real" => Decoder::Double,
            "date" => Decoder::Date,
            "time" => Decoder::Time,
            "datetime" | "timestamp" => Decoder::DateTime,
            "year" => Decoder::Year,
            "bit" => Decoder::Bit,
            _ => Decoder::Bytes,
        }
    }
}

fn decode_row(row: &MySqlRow, decoders: &[Decoder]) -> Result<Row> {
    decoders
        .iter()
        .enumerate()
        .map(|(i, decoder)| decode_value(row, i, *decoder))
        .collect()
}

fn decode_value(row: &MySqlRow, i: usize, decoder: Decoder) -> Result<SqlValue<'static>> {
    let decode_err = |e: sqlx::Error| {
        let (column, source_type) = match row.try_column(i) {
            Ok(c) => (c.name().to_string(), c.type_info().name().to_string()),
            Err(_) => (format!("#{}", i), "UNKNOWN".to_string()),
        };
        MigrateError::Decode {
            column,
            source_type,
            message: e.to_string(),
        }
    };

    if row.try_get_raw(i).map_err(decode_err)?.is_null() {
        return Ok(SqlValue::Null);
    }

    let value = match decoder {
        Decoder::Bool => SqlValue::Bool(row.try_get_unchecked::<bool, _>(i).map_err(decode_err)?),
        Decoder::Signed => SqlValue::I64(row.try_get_unchecked::<i64, _>(i).map_err(decode_err)?),
        Decoder::Unsigned => {
            SqlValue::U64(row.try_get_unchecked::<u64, _>(i).map_err(decode_err)?)
        }
        Decoder::Float => SqlValue::F32(row.try_get_unchecked::<f32, _>(i).map_err(decode_err)?),
        Decoder::Double => SqlValue::F64(row.try_get_unchecked::<f64, _>(i).map_err(decode_err)?),
        Decoder::Date => SqlValue::Date(
            row.try_get_unchecked::<chrono::NaiveDate, _>(i)
                .map_err(decode_err)?,
        ),
        Decoder::Time => SqlValue::Time(
            row.try_get_unchecked::<chrono::NaiveTime, _>(i)
                .map_err(decode_err)?,
        ),
        Decoder::DateTime => SqlValue::DateTime(
            row.try_get_unchecked::<chrono::NaiveDateTime, _>(i)
                .map_err(decode_err)?,
        ),
        Decoder::Year => SqlValue::I64(row.try_get_unchecked::<u16, _>(i).map_err(decode_err)? as i64),
        Decoder::Bit => {
            let bytes = row.try_get_unchecked::<Vec<u8>, _>(i).map_err(decode_err)?;
            SqlValue::text_owned(bits_to_string(&bytes))
        }
        Decoder::Bytes => {
            SqlValue::bytes_owned(row.try_get_unchecked::<Vec<u8>, _>(i).map_err(decode_err)?)
        }
    };

    Ok(value)
}

/// Render a BIT value as binary digits without leading zeros (`"0"` for zero).
fn bits_to_string(bytes: &[u8]) -> String {
    let digits: String = bytes.iter().map(|b| format!("{:08b}", b)).collect();
    match digits.trim_start_matches('0') {
        "" => "0".to_string(),
        rest => rest.to_string(),
    }
}
