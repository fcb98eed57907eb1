//! Core types and traits shared by the drivers and the migration engine.
//!
//! - [`schema`]: column metadata, table and chunk descriptors
//! - [`value`]: source values and their bulk-load representation
//! - [`traits`]: source, destination and bulk-load capabilities

pub mod schema;
pub mod traits;
pub mod value;

pub use schema::{Column, ColumnProjection, FetchDescriptor, ProjectedColumn, TableDescriptor};
pub use traits::{BulkLoad, Row, SourceReader, TargetWriter};
pub use value::{CopyValue, SqlValue};
