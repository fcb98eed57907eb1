//! Configuration type definitions.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::drivers::common::SslMode;

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Source database configuration (MySQL).
    pub source: SourceConfig,

    /// Target database configuration (PostgreSQL).
    pub target: TargetConfig,

    /// Migration behavior configuration.
    #[serde(default)]
    pub migration: MigrationConfig,
}

/// Source database (MySQL) configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Database host.
    pub host: String,

    /// Database port (default: 3306).
    #[serde(default = "default_mysql_port")]
    pub port: u16,

    /// Database name. Tables are discovered in this database.
    pub database: String,

    /// Username.
    pub user: String,

    /// Password.
    #[serde(default)]
    pub password: String,

    /// Maximum pooled connections (default: 32).
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// Target database (PostgreSQL) configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Database host.
    pub host: String,

    /// Database port (default: 5432).
    #[serde(default = "default_pg_port")]
    pub port: u16,

    /// Database name.
    pub database: String,

    /// Username.
    pub user: String,

    /// Password.
    #[serde(default)]
    pub password: String,

    /// Target schema (default: "public").
    #[serde(default = "default_public_schema")]
    pub schema: String,

    /// SSL mode (default: disable).
    #[serde(default)]
    pub ssl_mode: SslMode,

    /// Maximum pooled connections (default: 32).
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// Migration behavior configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationConfig {
    /// Rows per chunk for tables with a primary key.
    ///
    /// Required as soon as any migrated table has a primary key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_size: Option<usize>,

    /// Tables that are never migrated.
    #[serde(default)]
    pub exclude_tables: Vec<String>,

    /// Explicit table → fetch queries map, used instead of discovery when
    /// the run is started with `--from-config-tables`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tables: BTreeMap<String, Vec<String>>,

    /// Upper bound on chunk tasks in flight. Unbounded when not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent_chunks: Option<usize>,

    /// Base directory for per-run log directories (default: "logs").
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    /// Bytes buffered by the bulk loader before they are sent to the target.
    #[serde(default = "default_copy_flush_bytes")]
    pub copy_flush_bytes: usize,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            page_size: None,
            exclude_tables: Vec::new(),
            tables: BTreeMap::new(),
            max_concurrent_chunks: None,
            log_dir: default_log_dir(),
            copy_flush_bytes: default_copy_flush_bytes(),
        }
    }
}

impl MigrationConfig {
    /// Whether a table is on the exclusion list (case-insensitive).
    pub fn is_excluded(&self, table: &str) -> bool {
        self.exclude_tables
            .iter()
            .any(|t| t.eq_ignore_ascii_case(table))
    }
}

impl fmt::Debug for SourceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("max_connections", &self.max_connections)
            .finish()
    }
}

impl fmt::Debug for TargetConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TargetConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("schema", &self.schema)
            .field("ssl_mode", &self.ssl_mode)
            .field("max_connections", &self.max_connections)
            .finish()
    }
}

// Default value functions for serde
fn default_mysql_port() -> u16 {
    3306
}

fn default_pg_port() -> u16 {
    5432
}

fn default_public_schema() -> String {
    "public".to_string()
}

fn default_max_connections() -> usize {
    32
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_copy_flush_bytes() -> usize {
    4 * 1024 * 1024
}
