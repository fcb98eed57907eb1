//! Source value → bulk-load value mapping.

use crate::core::value::{CopyValue, SqlValue};
use crate::typemap::TransferMode;

/// Map one decoded source row into its bulk-load form.
///
/// `names` and `modes` follow the column projection. A NULL maps to a
/// destination NULL regardless of mode.
pub fn map_row(
    row: &[SqlValue<'_>],
    names: &[String],
    modes: &[TransferMode],
) -> Result<Vec<CopyValue>, String> {
    if row.len() != modes.len() {
        return Err(format!(
            "row has {} values but the projection has {} columns",
            row.len(),
            modes.len()
        ));
    }

    row.iter()
        .zip(modes)
        .enumerate()
        .map(|(i, (value, mode))| {
            map_value(value, *mode).map_err(|e| {
                let name = names.get(i).map(String::as_str).unwrap_or("?");
                format!("column {}: {}", name, e)
            })
        })
        .collect()
}

fn map_value(value: &SqlValue<'_>, mode: TransferMode) -> Result<CopyValue, String> {
    if value.is_null() {
        return Ok(CopyValue::Null);
    }

    match mode {
        TransferMode::Binary => Ok(CopyValue::Binary(match value {
            SqlValue::Bytes(b) => b.to_vec(),
            SqlValue::Text(s) => s.as_bytes().to_vec(),
            other => render_text(other)?.into_bytes(),
        })),
        TransferMode::Text => render_text(value).map(CopyValue::Text),
    }
}

fn render_text(value: &SqlValue<'_>) -> Result<String, String> {
    let text = match value {
        SqlValue::Null => return Err("unexpected NULL".to_string()),
        SqlValue::Bool(b) => if *b { "t" } else { "f" }.to_string(),
        SqlValue::I64(v) => v.to_string(),
        SqlValue::U64(v) => v.to_string(),
        SqlValue::F32(v) => render_float(*v as f64, v.to_string()),
        SqlValue::F64(v) => render_float(*v, v.to_string()),
        SqlValue::Text(s) => s.to_string(),
        SqlValue::Bytes(b) => String::from_utf8(b.to_vec())
            .map_err(|e| format!("invalid UTF-8 at byte {}", e.utf8_error().valid_up_to()))?,
        SqlValue::Date(d) => d.format("%Y-%m-%d").to_string(),
        SqlValue::Time(t) => t.format("%H:%M:%S%.f").to_string(),
        SqlValue::DateTime(dt) => dt.format("%Y-%m-%d %H:%M:%S%.f").to_string(),
    };

    if text.contains('\0') {
        return Err("text contains a NUL character".to_string());
    }
    Ok(text)
}

fn render_float(v: f64, display: String) -> String {
    if v.is_nan() {
        "NaN".to_string()
    } else if v.is_infinite() {
        if v > 0.0 { "Infinity" } else { "-Infinity" }.to_string()
    } else {
        display
    }
}

/// Render mapped values for a failure record.
pub fn render_row(row: &[CopyValue]) -> String {
    let values: Vec<String> = row.iter().map(|v| v.to_string()).collect();
    format!("[{}]", values.join(", "))
}

/// Render raw source values for a failure record.
pub fn render_source_row(row: &[SqlValue<'_>]) -> String {
    let values: Vec<String> = row
        .iter()
        .map(|v| match v {
            SqlValue::Null => "NULL".to_string(),
            SqlValue::Text(s) => format!("{:?}", s),
            SqlValue::Bytes(b) => match std::str::from_utf8(b) {
                Ok(s) => format!("{:?}", s),
                Err(_) => format!("\\x{}", hex::encode(b)),
            },
            other => render_text(other).unwrap_or_else(|_| format!("{:?}", other)),
        })
        .collect();
    format!("[{}]", values.join(", "))
}
