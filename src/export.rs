use anyhow::Result;
use serde_json::{json, Value};
use unicode_width::{UnicodeWidthChar, UnicodeWidthStr};

use crate::db::{CellValue, QueryResult};

/// Cells wider than this are cut in the text table.
const MAX_CELL_WIDTH: usize = 40;

/// Aligned plain-text table followed by a row-count footer.
pub fn to_table(result: &QueryResult) -> String {
    if result.columns.is_empty() {
        return "(no columns)\n".to_string();
    }

    let widths: Vec<usize> = result
        .columns
        .iter()
        .map(|c| c.max_width.clamp(1, MAX_CELL_WIDTH))
        .collect();

    let mut output = String::new();
    let header: Vec<String> = result
        .columns
        .iter()
        .zip(&widths)
        .map(|(c, &w)| pad(&fit(&c.name, w), w, false))
        .collect();
    output.push_str(header.join(" | ").trim_end());
    output.push('\n');

    let rule: Vec<String> = widths.iter().map(|&w| "-".repeat(w)).collect();
    output.push_str(&rule.join("-+-"));
    output.push('\n');

    for row in &result.rows {
        let cells: Vec<String> = row
            .iter()
            .zip(&widths)
            .map(|(cell, &w)| pad(&fit(&cell.display(), w), w, is_numeric(cell)))
            .collect();
        output.push_str(cells.join(" | ").trim_end());
        output.push('\n');
    }

    let noun = if result.row_count == 1 { "row" } else { "rows" };
    output.push_str(&format!("({} {}", result.row_count, noun));
    if result.truncated {
        output.push_str(", truncated at the row cap");
    }
    output.push_str(")\n");
    output
}

pub fn to_csv(result: &QueryResult) -> Result<String> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(result.columns.iter().map(|c| c.name.as_str()))?;
    for row in &result.rows {
        writer.write_record(row.iter().map(cell_to_csv))?;
    }
    let bytes = writer.into_inner().map_err(|e| anyhow::anyhow!(e.to_string()))?;
    Ok(String::from_utf8(bytes)?)
}

/// `{sql, columns, rows, truncated}`; rows are arrays aligned with `columns`.
pub fn to_json(result: &QueryResult, sql: &str) -> Result<String> {
    let columns: Vec<&str> = result.columns.iter().map(|c| c.name.as_str()).collect();
    let rows: Vec<Value> = result
        .rows
        .iter()
        .map(|row| Value::Array(row.iter().map(cell_to_json).collect()))
        .collect();
    let document = json!({
        "sql": sql,
        "columns": columns,
        "rows": rows,
        "truncated": result.truncated,
    });
    Ok(serde_json::to_string_pretty(&document)?)
}

fn cell_to_csv(cell: &CellValue) -> String {
    match cell {
        CellValue::Null => String::new(),
        other => other.display(),
    }
}

fn cell_to_json(cell: &CellValue) -> Value {
    match cell {
        CellValue::Null => Value::Null,
        CellValue::Bool(b) => Value::Bool(*b),
        CellValue::Int16(i) => json!(*i),
        CellValue::Int32(i) => json!(*i),
        CellValue::Int64(i) => json!(*i),
        CellValue::Float32(f) => json!(*f),
        CellValue::Float64(f) => json!(*f),
        CellValue::Json(j) => j.clone(),
        other => Value::String(other.display()),
    }
}

fn is_numeric(cell: &CellValue) -> bool {
    matches!(
        cell,
        CellValue::Int16(_)
            | CellValue::Int32(_)
            | CellValue::Int64(_)
            | CellValue::Float32(_)
            | CellValue::Float64(_)
    )
}

/// Cut `text` to at most `width` display columns, marking the cut with `…`.
fn fit(text: &str, width: usize) -> String {
    let flat = text.replace(['\n', '\r', '\t'], " ");
    if flat.width() <= width {
        return flat;
    }
    let mut out = String::new();
    let mut used = 0;
    for ch in flat.chars() {
        let w = ch.width().unwrap_or(0);
        if used + w + 1 > width {
            break;
        }
        out.push(ch);
        used += w;
    }
    out.push('…');
    out
}

fn pad(text: &str, width: usize, right_align: bool) -> String {
    let fill = " ".repeat(width.saturating_sub(text.width()));
    if right_align {
        format!("{}{}", fill, text)
    } else {
        format!("{}{}", text, fill)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::ColumnInfo;
    use std::time::Duration;

    fn make_result() -> QueryResult {
        QueryResult::new(
            vec![
                ColumnInfo::new("id", "INTEGER"),
                ColumnInfo::new("city", "TEXT"),
                ColumnInfo::new("total", "REAL"),
            ],
            vec![
                vec![
                    CellValue::Int64(1),
                    CellValue::Text("São Paulo".to_string()),
                    CellValue::Float64(10.5),
                ],
                vec![
                    CellValue::Int64(22),
                    CellValue::Text("Rio, RJ".to_string()),
                    CellValue::Null,
                ],
            ],
            Duration::from_millis(10),
        )
    }

    #[test]
    fn test_table_layout() {
        let table = to_table(&make_result());
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines[0], "id | city      | total");
        assert_eq!(lines[1], "---+-----------+------");
        assert_eq!(lines[2], " 1 | São Paulo |  10.5");
        assert_eq!(lines[3], "22 | Rio, RJ   | NULL");
        assert_eq!(lines[4], "(2 rows)");
    }

    #[test]
    fn test_table_marks_truncation() {
        let mut result = make_result();
        result.truncated = true;
        assert!(to_table(&result).ends_with("(2 rows, truncated at the row cap)\n"));
    }

    #[test]
    fn test_fit_long_text() {
        let long = "x".repeat(100);
        let cut = fit(&long, 10);
        assert_eq!(cut.width(), 10);
        assert!(cut.ends_with('…'));
        assert_eq!(fit("a\nb", 10), "a b");
    }

    #[test]
    fn test_csv_export() {
        let csv = to_csv(&make_result()).unwrap();
        assert!(csv.starts_with("id,city,total\n"));
        assert!(csv.contains("1,São Paulo,10.5\n"));
        assert!(csv.contains("22,\"Rio, RJ\",\n"));
    }

    #[test]
    fn test_json_export() {
        let json = to_json(&make_result(), "SELECT id, city, total FROM t LIMIT 500").unwrap();
        let parsed: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["sql"], "SELECT id, city, total FROM t LIMIT 500");
        assert_eq!(parsed["columns"], json!(["id", "city", "total"]));
        assert_eq!(parsed["rows"][0], json!([1, "São Paulo", 10.5]));
        assert!(parsed["rows"][1][2].is_null());
        assert_eq!(parsed["truncated"], false);
    }

    #[test]
    fn test_json_number_types() {
        assert_eq!(cell_to_json(&CellValue::Int32(42)), json!(42));
        assert_eq!(cell_to_json(&CellValue::Bool(true)), json!(true));
        assert!(cell_to_json(&CellValue::Null).is_null());
    }
}
