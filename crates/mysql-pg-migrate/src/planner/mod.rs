//! Chunk planning.
//!
//! Turns a table's primary key shape into a deterministic sequence of
//! self-contained fetch queries. Keyed tables are paged with a
//! keyset-via-join query: only the key columns are offset-scanned and the
//! page of keys is joined back to the table to fetch full rows. Unkeyed
//! tables get a single full scan.

use tracing::debug;

use crate::core::schema::{FetchDescriptor, TableDescriptor};
use crate::core::traits::SourceReader;
use crate::drivers::mysql::MysqlReader;
use crate::error::{MigrateError, Result};

/// Comment prefixed to every source fetch query.
pub const QUERY_TAG: &str = "/* mysql-pg-migrate */";

/// Prefix `sql` with [`QUERY_TAG`] unless it already carries it.
pub fn ensure_tagged(sql: &str) -> String {
    let trimmed = sql.trim();
    if trimmed.starts_with(QUERY_TAG) {
        trimmed.to_string()
    } else {
        format!("{} {}", QUERY_TAG, trimmed)
    }
}

/// Zero-row probe for a bare table scan.
pub fn table_probe_sql(table: &str) -> String {
    format!("select * from {} where 1=0", MysqlReader::quote_ident(table))
}

/// Zero-row probe wrapping a custom fetch query.
pub fn query_probe_sql(query: &str) -> String {
    let inner = query.trim().trim_end_matches(';').trim_end();
    format!("select * from ({}) aa where 1=0", inner)
}

/// Unfiltered full-table scan.
pub fn full_scan_query(table: &str) -> String {
    format!("{} SELECT * FROM {}", QUERY_TAG, MysqlReader::quote_ident(table))
}

/// Build the fetch queries for a table with `row_count` rows.
///
/// Keyed tables yield `floor(row_count / page_size) + 1` queries, so an
/// empty table still gets one (empty) chunk. Unkeyed tables yield exactly
/// one full scan.
pub fn build_chunk_queries(table: &TableDescriptor, row_count: u64) -> Vec<String> {
    if !table.has_pk() {
        return vec![full_scan_query(&table.name)];
    }

    let page_size = table.page_size.max(1) as u64;
    let total_pages = row_count / page_size;

    let quoted_table = MysqlReader::quote_ident(&table.name);
    let key_list = table
        .primary_key
        .iter()
        .map(|c| MysqlReader::quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    let join_on = table
        .primary_key
        .iter()
        .map(|c| {
            let col = MysqlReader::quote_ident(c);
            format!("temp.{} = t.{}", col, col)
        })
        .collect::<Vec<_>>()
        .join(" AND ");

    (0..=total_pages)
        .map(|page| {
            format!(
                "{} SELECT t.* FROM (SELECT {} FROM {} ORDER BY {} LIMIT {} OFFSET {}) temp \
                 LEFT JOIN {} t ON {}",
                QUERY_TAG,
                key_list,
                quoted_table,
                key_list,
                page_size,
                page * page_size,
                quoted_table,
                join_on
            )
        })
        .collect()
}

/// Wrap queries into indexed fetch descriptors.
pub fn descriptors(table: &str, queries: Vec<String>) -> Vec<FetchDescriptor> {
    queries
        .into_iter()
        .enumerate()
        .map(|(index, query)| FetchDescriptor {
            table: table.to_string(),
            index,
            query,
        })
        .collect()
}

/// Resolve a table's primary key and attach the configured page size.
///
/// A missing page size is fatal only for keyed tables.
pub async fn resolve_table(
    source: &dyn SourceReader,
    table: &str,
    page_size: Option<usize>,
) -> Result<TableDescriptor> {
    let primary_key = source.primary_key(table).await?;

    let page_size = match (primary_key.is_empty(), page_size) {
        (true, p) => p.unwrap_or(0),
        (false, Some(p)) if p > 0 => p,
        (false, _) => {
            return Err(MigrateError::Config(format!(
                "migration.page_size is required: table {} has a primary key",
                table
            )))
        }
    };

    Ok(TableDescriptor {
        name: table.to_string(),
        primary_key,
        page_size,
    })
}

/// Plan a discovered table. Keyed tables are counted first.
pub async fn plan_table(
    source: &dyn SourceReader,
    table: &TableDescriptor,
) -> Result<Vec<FetchDescriptor>> {
    let row_count = if table.has_pk() {
        source.row_count(&table.name).await?
    } else {
        0
    };

    let chunks = descriptors(&table.name, build_chunk_queries(table, row_count));
    debug!(
        "Planned {} chunk(s) for {} ({} rows, key: [{}])",
        chunks.len(),
        table.name,
        row_count,
        table.primary_key.join(", ")
    );
    Ok(chunks)
}

/// Plan a table from explicitly configured queries, one chunk per query.
pub fn plan_custom(table: &str, queries: &[String]) -> Vec<FetchDescriptor> {
    descriptors(
        table,
        queries
            .iter()
            .filter(|q| !q.trim().is_empty())
            .map(|q| ensure_tagged(q))
            .collect(),
    )
}
