//! Database driver implementations.
//!
//! - [`mysql`]: source reader
//! - [`postgres`]: destination writer
//! - [`common`]: shared utilities (TLS)

pub mod common;
pub mod mysql;
pub mod postgres;

pub use common::SslMode;
pub use mysql::MysqlReader;
pub use postgres::PostgresWriter;
