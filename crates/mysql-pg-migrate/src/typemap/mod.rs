//! Type mapping between MySQL and PostgreSQL.
//!
//! A single rule table drives both the DDL translator (destination column
//! type) and the chunk executor (how a value crosses the bulk-load path), so
//! the two cannot drift apart.

use crate::core::Column;

/// How a column's values are handed to the bulk loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    /// Rendered as text and escaped for COPY.
    Text,
    /// Passed through as raw bytes (bytea).
    Binary,
}

/// Destination type template.
#[derive(Debug, Clone, Copy)]
enum Template {
    /// Fixed type name.
    Fixed(&'static str),
    /// `numeric(p,s)` when precision is known.
    Numeric,
    /// `<name>(n)` when the length is known and within PostgreSQL limits,
    /// otherwise `text`.
    Sized(&'static str),
    /// `boolean` for a single bit, `bit varying(n)` otherwise.
    Bit,
}

#[derive(Debug)]
struct TypeRule {
    source: &'static [&'static str],
    target: Template,
    /// Destination type for UNSIGNED integers.
    widened: Option<&'static str>,
    mode: TransferMode,
    warning: Option<&'static str>,
}

const fn rule(source: &'static [&'static str], target: Template, mode: TransferMode) -> TypeRule {
    TypeRule {
        source,
        target,
        widened: None,
        mode,
        warning: None,
    }
}

const fn int(source: &'static [&'static str], target: &'static str, widened: &'static str) -> TypeRule {
    TypeRule {
        source,
        target: Template::Fixed(target),
        widened: Some(widened),
        mode: TransferMode::Text,
        warning: None,
    }
}

const fn lossy(source: &'static [&'static str], target: &'static str, warning: &'static str) -> TypeRule {
    TypeRule {
        source,
        target: Template::Fixed(target),
        widened: None,
        mode: TransferMode::Text,
        warning: Some(warning),
    }
}

/// Largest length PostgreSQL accepts for char/varchar.
const PG_MAX_CHAR_LENGTH: i64 = 10_485_760;

use TransferMode::{Binary, Text};

static RULES: &[TypeRule] = &[
    rule(&["bool", "boolean"], Template::Fixed("boolean"), Text),
    int(&["tinyint"], "smallint", "smallint"),
    int(&["smallint"], "smallint", "integer"),
    int(&["mediumint"], "integer", "integer"),
    int(&["int", "integer"], "integer", "bigint"),
    int(&["bigint"], "bigint", "numeric(20,0)"),
    rule(&["decimal", "numeric", "dec", "fixed"], Template::Numeric, Text),
    rule(&["float"], Template::Fixed("real"), Text),
    rule(
        &["double", "double precision", "real"],
        Template::Fixed("double precision"),
        Text,
    ),
    rule(&["char"], Template::Sized("char"), Text),
    rule(&["varchar"], Template::Sized("varchar"), Text),
    rule(
        &["tinytext", "text", "mediumtext", "longtext"],
        Template::Fixed("text"),
        Text,
    ),
    rule(
        &["binary", "varbinary", "tinyblob", "blob", "mediumblob", "longblob"],
        Template::Fixed("bytea"),
        Binary,
    ),
    rule(&["date"], Template::Fixed("date"), Text),
    rule(&["time"], Template::Fixed("time"), Text),
    rule(&["datetime", "timestamp"], Template::Fixed("timestamp"), Text),
    rule(&["year"], Template::Fixed("smallint"), Text),
    rule(&["json"], Template::Fixed("jsonb"), Text),
    lossy(&["enum"], "text", "MySQL ENUM stored as text"),
    lossy(&["set"], "text", "MySQL SET stored as text"),
    rule(&["bit"], Template::Bit, Text),
    TypeRule {
        source: &[
            "geometry",
            "point",
            "linestring",
            "polygon",
            "multipoint",
            "multilinestring",
            "multipolygon",
            "geometrycollection",
        ],
        target: Template::Fixed("bytea"),
        widened: None,
        mode: Binary,
        warning: Some("MySQL spatial value stored as internal WKB bytes"),
    },
];

/// Result of mapping one source column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeMapping {
    /// Destination column type.
    pub target_type: String,
    /// How values of this column travel through the bulk loader.
    pub mode: TransferMode,
    /// Set when the mapping loses information.
    pub warning: Option<String>,
}

/// Reduce a source type name to its base form.
///
/// `"INT UNSIGNED"` → `"int"`, `"decimal(10,2)"` → `"decimal"`,
/// `"Double Precision"` → `"double precision"`.
pub fn base_type(source_type: &str) -> String {
    let lower = source_type.trim().to_lowercase();
    let without_args = match lower.find('(') {
        Some(pos) => &lower[..pos],
        None => lower.as_str(),
    };
    without_args
        .split_whitespace()
        .filter(|w| !matches!(*w, "unsigned" | "signed" | "zerofill"))
        .collect::<Vec<_>>()
        .join(" ")
}

fn is_unsigned(source_type: &str) -> bool {
    source_type.to_lowercase().contains("unsigned")
}

fn lookup(base: &str) -> Option<&'static TypeRule> {
    RULES.iter().find(|r| r.source.iter().any(|s| *s == base))
}

/// Transfer mode for a normalized source type (as found in a column projection).
///
/// Unknown types use [`TransferMode::Text`].
pub fn transfer_mode(source_type: &str) -> TransferMode {
    lookup(&base_type(source_type))
        .map(|r| r.mode)
        .unwrap_or(TransferMode::Text)
}

/// Map a source column to its destination type.
pub fn map_column(col: &Column) -> TypeMapping {
    let base = base_type(&col.data_type);

    // MySQL reports BOOL columns as tinyint(1). The result-set metadata
    // calls any tinyint(1) BOOLEAN, signed or not, and rows decode as bools.
    if base == "tinyint" && col.max_length == 1 {
        return TypeMapping {
            target_type: "boolean".to_string(),
            mode: TransferMode::Text,
            warning: None,
        };
    }

    let Some(rule) = lookup(&base) else {
        return TypeMapping {
            target_type: col.data_type.clone(),
            mode: TransferMode::Text,
            warning: None,
        };
    };

    let unsigned = col.is_unsigned || is_unsigned(&col.data_type);
    let target_type = match (rule.widened, unsigned) {
        (Some(widened), true) => widened.to_string(),
        _ => render(rule.target, col),
    };

    TypeMapping {
        target_type,
        mode: rule.mode,
        warning: rule.warning.map(str::to_string),
    }
}

fn render(template: Template, col: &Column) -> String {
    match template {
        Template::Fixed(name) => name.to_string(),
        Template::Numeric => {
            if col.precision > 0 {
                format!("numeric({},{})", col.precision, col.scale)
            } else {
                "numeric".to_string()
            }
        }
        Template::Sized(name) => {
            if col.max_length > 0 && col.max_length <= PG_MAX_CHAR_LENGTH {
                format!("{}({})", name, col.max_length)
            } else {
                "text".to_string()
            }
        }
        Template::Bit => {
            if col.max_length <= 1 {
                "boolean".to_string()
            } else {
                format!("bit varying({})", col.max_length)
            }
        }
    }
}
