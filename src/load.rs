//! Builds the SQLite dataset from the Olist CSV export.

use anyhow::{bail, Context, Result};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection};
use std::path::Path;
use tracing::{info, warn};

/// CSV file name → table name.
pub const TABLES: &[(&str, &str)] = &[
    ("olist_customers_dataset.csv", "olist_customers_dataset"),
    ("olist_geolocation_dataset.csv", "olist_geolocation_dataset"),
    ("olist_order_items_dataset.csv", "olist_order_items_dataset"),
    ("olist_order_payments_dataset.csv", "olist_order_payments_dataset"),
    ("olist_order_reviews_dataset.csv", "olist_order_reviews_dataset"),
    ("olist_orders_dataset.csv", "olist_orders_dataset"),
    ("olist_products_dataset.csv", "olist_products_dataset"),
    ("olist_sellers_dataset.csv", "olist_sellers_dataset"),
    (
        "product_category_name_translation.csv",
        "product_category_name_translation",
    ),
];

/// Created after loading, each only when its table was loaded.
const POST_LOAD: &[(&str, &str)] = &[
    (
        "olist_orders_dataset",
        "CREATE INDEX IF NOT EXISTS idx_orders_customer ON olist_orders_dataset(customer_id)",
    ),
    (
        "olist_order_items_dataset",
        "CREATE INDEX IF NOT EXISTS idx_items_order ON olist_order_items_dataset(order_id)",
    ),
    (
        "olist_order_items_dataset",
        "CREATE INDEX IF NOT EXISTS idx_items_product ON olist_order_items_dataset(product_id)",
    ),
    (
        "olist_products_dataset",
        "CREATE INDEX IF NOT EXISTS idx_products_category ON olist_products_dataset(product_category_name)",
    ),
    (
        "olist_order_items_dataset",
        "CREATE VIEW IF NOT EXISTS v_order_item_revenue AS
         SELECT i.order_id, i.product_id, (i.price + COALESCE(i.freight_value, 0)) AS revenue
         FROM olist_order_items_dataset i",
    ),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Integer,
    Real,
    Text,
}

impl ColumnType {
    /// Narrowest type that holds both `current` and `value`. Empty fields
    /// say nothing about the type.
    fn widen(current: Option<ColumnType>, value: &str) -> Option<ColumnType> {
        let value = value.trim();
        if value.is_empty() {
            return current;
        }
        let seen = if value.parse::<i64>().is_ok() {
            ColumnType::Integer
        } else if value.parse::<f64>().is_ok() {
            ColumnType::Real
        } else {
            ColumnType::Text
        };
        Some(match (current, seen) {
            (None, t) => t,
            (Some(ColumnType::Text), _) | (_, ColumnType::Text) => ColumnType::Text,
            (Some(ColumnType::Real), _) | (_, ColumnType::Real) => ColumnType::Real,
            (Some(ColumnType::Integer), ColumnType::Integer) => ColumnType::Integer,
        })
    }

    fn sql(&self) -> &'static str {
        match self {
            ColumnType::Integer => "INTEGER",
            ColumnType::Real => "REAL",
            ColumnType::Text => "TEXT",
        }
    }

    fn value(&self, field: &str) -> Value {
        let trimmed = field.trim();
        if trimmed.is_empty() {
            return Value::Null;
        }
        match self {
            ColumnType::Integer => trimmed
                .parse()
                .map(Value::Integer)
                .unwrap_or_else(|_| Value::Text(field.to_string())),
            ColumnType::Real => trimmed
                .parse()
                .map(Value::Real)
                .unwrap_or_else(|_| Value::Text(field.to_string())),
            ColumnType::Text => Value::Text(field.to_string()),
        }
    }
}

#[derive(Debug, Default)]
pub struct LoadReport {
    /// Loaded tables with their row counts.
    pub tables: Vec<(String, usize)>,
    pub skipped: Vec<String>,
}

/// Build `out_db` from the CSV files in `csv_dir`, replacing any existing file.
pub fn build_database(csv_dir: &Path, out_db: &Path) -> Result<LoadReport> {
    if !csv_dir.is_dir() {
        bail!("CSV directory not found: {}", csv_dir.display());
    }
    if out_db.exists() {
        std::fs::remove_file(out_db)
            .with_context(|| format!("Failed to replace {}", out_db.display()))?;
    }

    let mut conn = Connection::open(out_db)
        .with_context(|| format!("Failed to create {}", out_db.display()))?;
    let mut report = LoadReport::default();

    for (file, table) in TABLES {
        let path = csv_dir.join(file);
        if !path.exists() {
            warn!(file, "missing CSV file, skipping");
            report.skipped.push(file.to_string());
            continue;
        }
        info!(file, table, "loading");
        let rows = load_table(&mut conn, &path, table)
            .with_context(|| format!("Failed to load {}", path.display()))?;
        report.tables.push((table.to_string(), rows));
    }

    for (table, sql) in POST_LOAD {
        if report.tables.iter().any(|(loaded, _)| loaded == table) {
            conn.execute_batch(sql)?;
        }
    }

    info!(db = %out_db.display(), tables = report.tables.len(), "dataset built");
    Ok(report)
}

fn load_table(conn: &mut Connection, path: &Path, table: &str) -> Result<usize> {
    let (headers, types) = infer_columns(path)?;

    let columns: Vec<String> = headers
        .iter()
        .zip(&types)
        .map(|(name, ty)| format!("{} {}", quote_ident(name), ty.sql()))
        .collect();
    conn.execute_batch(&format!(
        "CREATE TABLE {} ({})",
        quote_ident(table),
        columns.join(", ")
    ))?;

    let placeholders = vec!["?"; headers.len()].join(", ");
    let insert = format!("INSERT INTO {} VALUES ({})", quote_ident(table), placeholders);

    let tx = conn.transaction()?;
    let mut count = 0;
    {
        let mut stmt = tx.prepare(&insert)?;
        let mut reader = csv::Reader::from_path(path)?;
        for record in reader.records() {
            let record = record?;
            let values = types
                .iter()
                .enumerate()
                .map(|(i, ty)| ty.value(record.get(i).unwrap_or("")));
            stmt.execute(params_from_iter(values))?;
            count += 1;
        }
    }
    tx.commit()?;
    Ok(count)
}

/// Header names and column types from a full pass over the file. Columns
/// with no values at all are TEXT.
fn infer_columns(path: &Path) -> Result<(Vec<String>, Vec<ColumnType>)> {
    let mut reader = csv::Reader::from_path(path)?;
    let headers: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
    if headers.is_empty() {
        bail!("no header row");
    }

    let mut types: Vec<Option<ColumnType>> = vec![None; headers.len()];
    for record in reader.records() {
        let record = record?;
        for (i, field) in record.iter().enumerate().take(headers.len()) {
            types[i] = ColumnType::widen(types[i], field);
        }
    }

    let types = types
        .into_iter()
        .map(|t| t.unwrap_or(ColumnType::Text))
        .collect();
    Ok((headers, types))
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
