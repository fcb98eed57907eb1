//! Table, column and chunk descriptors shared by the planner, executor and
//! coordinator.

use serde::{Deserialize, Serialize};

/// Source column metadata, as read from `information_schema.columns`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    /// Column name, lowercased.
    pub name: String,

    /// Data type (e.g. "int", "varchar", "datetime").
    pub data_type: String,

    /// Character length for string types (0 when not applicable).
    pub max_length: i64,

    /// Numeric precision.
    pub precision: i32,

    /// Numeric scale.
    pub scale: i32,

    /// Whether the column allows NULL.
    pub is_nullable: bool,

    /// Whether the integer type is declared UNSIGNED.
    pub is_unsigned: bool,

    /// Column default expression, if any.
    pub default: Option<String>,

    /// Ordinal position (1-based).
    pub ordinal_pos: i32,
}

/// A table resolved for planning. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDescriptor {
    /// Table name as it appears in the source catalog.
    pub name: String,

    /// Primary key columns in ordinal order; empty for unkeyed tables.
    pub primary_key: Vec<String>,

    /// Rows per chunk. Only meaningful when the table has a primary key.
    pub page_size: usize,
}

impl TableDescriptor {
    /// Check if the table has a primary key.
    pub fn has_pk(&self) -> bool {
        !self.primary_key.is_empty()
    }
}

/// One column of a fetch statement's result shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectedColumn {
    /// Lowercased column name.
    pub name: String,

    /// Normalized (uppercased) source type, e.g. `INT UNSIGNED`, `BLOB`.
    pub source_type: String,
}

/// Ordered result shape of a table's fetch statement, derived from a
/// zero-row probe of that same statement.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnProjection {
    pub columns: Vec<ProjectedColumn>,
}

impl ColumnProjection {
    /// Build a projection, normalizing names and types.
    pub fn new<I, N, T>(columns: I) -> Self
    where
        I: IntoIterator<Item = (N, T)>,
        N: AsRef<str>,
        T: AsRef<str>,
    {
        Self {
            columns: columns
                .into_iter()
                .map(|(name, ty)| ProjectedColumn {
                    name: name.as_ref().to_lowercase(),
                    source_type: ty.as_ref().trim().to_uppercase(),
                })
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Destination column list, in fetch order.
    pub fn names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    /// Normalized source types, in fetch order.
    pub fn types(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.source_type.clone()).collect()
    }
}

/// One independently fetchable chunk of a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchDescriptor {
    /// Table name.
    pub table: String,

    /// Sequence index, 0-based and unique within the table.
    pub index: usize,

    /// Self-contained, read-only fetch query.
    pub query: String,
}
