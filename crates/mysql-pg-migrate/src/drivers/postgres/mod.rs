//! PostgreSQL driver.
//!
//! - [`PostgresWriter`]: destination writer (schema mirroring, truncation,
//!   COPY bulk loads)
//! - [`ddl`]: CREATE TABLE generation from MySQL column metadata

pub mod ddl;
mod writer;

pub use writer::{encode_copy_row, PgBulkLoad, PostgresWriter};
