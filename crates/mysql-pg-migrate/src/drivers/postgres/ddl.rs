//! CREATE TABLE generation from MySQL column metadata.

use tracing::warn;

use crate::core::schema::Column;
use crate::typemap::{base_type, map_column};

/// Quote a PostgreSQL identifier.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Schema-qualified, quoted destination table name. Destination tables are
/// lowercased.
pub fn qualify(schema: &str, table: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(&table.to_lowercase()))
}

/// `CREATE TABLE` statement for a source table.
pub fn create_table_sql(schema: &str, table: &str, columns: &[Column]) -> String {
    let defs: Vec<String> = columns
        .iter()
        .map(|col| {
            let mapping = map_column(col);
            if let Some(w) = &mapping.warning {
                warn!("{}.{}: {}", table, col.name, w);
            }

            let mut def = format!("{} {}", quote_ident(&col.name), mapping.target_type);
            if !col.is_nullable {
                def.push_str(" NOT NULL");
            }
            if let Some(default) = render_default(col, &mapping.target_type) {
                def.push_str(" DEFAULT ");
                def.push_str(&default);
            }
            def
        })
        .collect();

    format!(
        "CREATE TABLE {} (\n    {}\n)",
        qualify(schema, table),
        defs.join(",\n    ")
    )
}

/// `DROP TABLE IF EXISTS ... CASCADE` statement.
pub fn drop_table_sql(schema: &str, table: &str) -> String {
    format!("DROP TABLE IF EXISTS {} CASCADE", qualify(schema, table))
}

fn is_string_type(base: &str) -> bool {
    matches!(
        base,
        "char" | "varchar" | "tinytext" | "text" | "mediumtext" | "longtext" | "enum" | "set"
    )
}

/// Translate a MySQL column default into a PostgreSQL default expression.
fn render_default(col: &Column, target_type: &str) -> Option<String> {
    let raw = col.default.as_deref()?.trim();
    if raw.eq_ignore_ascii_case("null") {
        return None;
    }

    let upper = raw.to_uppercase();
    if upper.starts_with("CURRENT_TIMESTAMP") || upper == "NOW()" {
        return Some("CURRENT_TIMESTAMP".to_string());
    }

    let base = base_type(&col.data_type);
    if is_string_type(&base) {
        return Some(format!("'{}'", raw.replace('\'', "''")));
    }

    if target_type == "boolean" {
        return match raw {
            "0" | "b'0'" => Some("FALSE".to_string()),
            "1" | "b'1'" => Some("TRUE".to_string()),
            _ => None,
        };
    }

    if base == "bit" {
        if let Some(bits) = raw.strip_prefix("b'") {
            return Some(format!("B'{}", bits));
        }
    }

    // MySQL 8 expression defaults have no portable translation.
    if raw.starts_with('(') {
        warn!(
            "Dropping expression default {} on column {}",
            raw, col.name
        );
        return None;
    }

    Some(raw.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn col(name: &str, data_type: &str, nullable: bool, default: Option<&str>) -> Column {
        Column {
            name: name.to_string(),
            data_type: data_type.to_string(),
            max_length: if data_type == "varchar" { 64 } else { 0 },
            precision: 0,
            scale: 0,
            is_nullable: nullable,
            is_unsigned: false,
            default: default.map(str::to_string),
            ordinal_pos: 1,
        }
    }

    #[test]
    fn test_qualify_lowercases_table() {
        assert_eq!(qualify("public", "Orders"), "\"public\".\"orders\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_create_table_sql() {
        let columns = vec![
            col("id", "int", false, None),
            col("note", "varchar", true, Some("n/a")),
            col("created", "datetime", false, Some("CURRENT_TIMESTAMP")),
            col("qty", "int", true, Some("0")),
        ];
        let sql = create_table_sql("public", "orders", &columns);
        assert!(sql.starts_with("CREATE TABLE \"public\".\"orders\" ("));
        assert!(sql.contains("\"id\" integer NOT NULL"));
        assert!(sql.contains("\"note\" varchar(64) DEFAULT 'n/a'"));
        assert!(sql.contains("\"created\" timestamp NOT NULL DEFAULT CURRENT_TIMESTAMP"));
        assert!(sql.contains("\"qty\" integer DEFAULT 0"));
    }

    #[test]
    fn test_string_default_escapes_quotes() {
        let c = col("note", "varchar", true, Some("it's"));
        assert_eq!(render_default(&c, "varchar(64)").as_deref(), Some("'it''s'"));
    }

    #[test]
    fn test_boolean_and_expression_defaults() {
        let mut flag = col("flag", "tinyint", false, Some("1"));
        flag.max_length = 1;
        assert_eq!(render_default(&flag, "boolean").as_deref(), Some("TRUE"));

        let expr = col("uid", "binary", true, Some("(uuid_to_bin(uuid()))"));
        assert_eq!(render_default(&expr, "bytea"), None);

        let none = col("x", "int", true, Some("NULL"));
        assert_eq!(render_default(&none, "integer"), None);
    }

    #[test]
    fn test_drop_table_sql() {
        assert_eq!(
            drop_table_sql("public", "logs"),
            "DROP TABLE IF EXISTS \"public\".\"logs\" CASCADE"
        );
    }
}
