//! Built-in aggregate tables over the `sales_lines` source table
//!
//! `sales_lines` holds one row per receipt line. `receipt_discount` is a
//! receipt-level amount copied onto every line of the receipt, which is why
//! `daily_store_sales` aggregates in two stages.

use super::types::{ColumnSpec, ExpectedSchema, FieldSpec, SourceTable, TableConfig};

pub const SOURCE_TABLE: &str = "sales_lines";
pub const ENTITY_COLUMN: &str = "store_code";
pub const NATURAL_KEY: &str = "receipt_no";

const SALES_ONLY: &str = "NOT is_return";
const RETURNS_ONLY: &str = "is_return";

pub fn sales_source() -> SourceTable {
    SourceTable::new(SOURCE_TABLE, ENTITY_COLUMN, NATURAL_KEY)
}

/// Every built-in table with its expected schema, in sync order
pub fn builtin_tables() -> Vec<(TableConfig, ExpectedSchema)> {
    vec![
        daily_store_sales(),
        hourly_store_sales(),
        category_daily_sales(),
        daily_store_returns(),
    ]
}

fn base_columns(extra: Vec<ColumnSpec>) -> Vec<ColumnSpec> {
    let mut columns = vec![
        ColumnSpec::auto_increment_key("id"),
        ColumnSpec::new(ENTITY_COLUMN, "TEXT NOT NULL"),
        ColumnSpec::new("sale_date", "DATE NOT NULL"),
    ];
    columns.extend(extra);
    columns
}

fn counter(name: &str) -> ColumnSpec {
    ColumnSpec::new(name, "BIGINT NOT NULL").with_default("0")
}

fn amount(name: &str) -> ColumnSpec {
    ColumnSpec::new(name, "NUMERIC(16,2) NOT NULL").with_default("0")
}

fn units(name: &str) -> ColumnSpec {
    ColumnSpec::new(name, "NUMERIC(14,3) NOT NULL").with_default("0")
}

fn daily_store_sales() -> (TableConfig, ExpectedSchema) {
    let config = TableConfig::new("daily_store_sales")
        .group_by("DATE(sold_at) AS sale_date")
        .field(FieldSpec::count_distinct("receipt_count", NATURAL_KEY))
        .field(FieldSpec::sum("units", "quantity"))
        .field(FieldSpec::sum("net_sales", "net_amount"))
        .field(FieldSpec::sum("receipt_discount", "receipt_discount").partition_scoped())
        .field(FieldSpec::count_distinct("customer_count", "customer_id"))
        .field(FieldSpec::first("first_sale_at", "sold_at"))
        .field(FieldSpec::max("last_sale_at", "sold_at"))
        .derived(
            "avg_ticket",
            "CASE WHEN receipt_count > 0 THEN ROUND(net_sales / receipt_count, 2) ELSE 0 END",
        )
        .filter(SALES_ONLY)
        .two_stage();

    let schema = ExpectedSchema::new(
        "daily_store_sales",
        base_columns(vec![
            counter("receipt_count"),
            units("units"),
            amount("net_sales"),
            amount("receipt_discount"),
            counter("customer_count"),
            ColumnSpec::new("first_sale_at", "TIMESTAMP"),
            ColumnSpec::new("last_sale_at", "TIMESTAMP"),
            amount("avg_ticket"),
        ]),
    );

    (config, schema)
}

fn hourly_store_sales() -> (TableConfig, ExpectedSchema) {
    let config = TableConfig::new("hourly_store_sales")
        .group_by("DATE(sold_at) AS sale_date")
        .group_by("CAST(EXTRACT(HOUR FROM sold_at) AS INTEGER) AS sale_hour")
        .field(FieldSpec::count("line_count", "*"))
        .field(FieldSpec::sum("units", "quantity"))
        .field(FieldSpec::sum("net_sales", "net_amount"))
        .filter(SALES_ONLY);

    let schema = ExpectedSchema::new(
        "hourly_store_sales",
        base_columns(vec![
            ColumnSpec::new("sale_hour", "INTEGER NOT NULL"),
            counter("line_count"),
            units("units"),
            amount("net_sales"),
        ]),
    );

    (config, schema)
}

fn category_daily_sales() -> (TableConfig, ExpectedSchema) {
    let config = TableConfig::new("category_daily_sales")
        .group_by("DATE(sold_at) AS sale_date")
        .group_by("category")
        .field(FieldSpec::sum("units", "quantity"))
        .field(FieldSpec::sum("net_sales", "net_amount"))
        .field(FieldSpec::count_distinct("sku_count", "sku"))
        .field(FieldSpec::min("lowest_unit_price", "net_amount / NULLIF(quantity, 0)"))
        .derived(
            "avg_unit_price",
            "CASE WHEN units <> 0 THEN ROUND(net_sales / units, 2) END",
        )
        .filter(SALES_ONLY);

    let schema = ExpectedSchema::new(
        "category_daily_sales",
        base_columns(vec![
            ColumnSpec::new("category", "TEXT NOT NULL"),
            units("units"),
            amount("net_sales"),
            counter("sku_count"),
            ColumnSpec::new("lowest_unit_price", "NUMERIC(16,4)"),
            ColumnSpec::new("avg_unit_price", "NUMERIC(16,2)"),
        ]),
    );

    (config, schema)
}

fn daily_store_returns() -> (TableConfig, ExpectedSchema) {
    let config = TableConfig::new("daily_store_returns")
        .group_by("DATE(sold_at) AS sale_date")
        .field(FieldSpec::sum("returned_units", "ABS(quantity)"))
        .field(FieldSpec::sum("refund_amount", "ABS(net_amount)"))
        .field(FieldSpec::count_distinct("return_receipts", NATURAL_KEY))
        .filter(RETURNS_ONLY);

    let schema = ExpectedSchema::new(
        "daily_store_returns",
        base_columns(vec![
            units("returned_units"),
            amount("refund_amount"),
            counter("return_receipts"),
        ]),
    );

    (config, schema)
}
