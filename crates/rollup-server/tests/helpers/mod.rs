//! Test helpers for rollup integration tests
//!
//! - `SaleLine` builder for source rows
//! - engine/service constructors over the built-in registry
//! - text snapshots of aggregate tables for exact comparisons

#![allow(dead_code)]

use rollup_server::config::AggregateSettings;
use rollup_server::materialize::MaterializationEngine;
use rollup_server::registry::Registry;
use rollup_server::service::AggregateService;
use sqlx::PgPool;
use std::sync::Arc;

/// One `sales_lines` row. Numeric and timestamp values are kept as text and
/// cast by Postgres on insert.
#[derive(Debug, Clone)]
pub struct SaleLine {
    pub store: String,
    pub receipt: String,
    pub line_no: i32,
    pub sold_at: String,
    pub category: String,
    pub sku: String,
    pub quantity: String,
    pub net_amount: String,
    pub receipt_discount: String,
    pub customer: Option<String>,
    pub is_return: bool,
}

/// A one-unit, 10.00 sale line at `sold_at` (`YYYY-MM-DD HH:MM:SS`)
pub fn line(store: &str, receipt: &str, sold_at: &str) -> SaleLine {
    SaleLine {
        store: store.to_string(),
        receipt: receipt.to_string(),
        line_no: 1,
        sold_at: sold_at.to_string(),
        category: "grocery".to_string(),
        sku: "SKU-1".to_string(),
        quantity: "1".to_string(),
        net_amount: "10.00".to_string(),
        receipt_discount: "0".to_string(),
        customer: None,
        is_return: false,
    }
}

impl SaleLine {
    pub fn line_no(mut self, line_no: i32) -> Self {
        self.line_no = line_no;
        self
    }

    pub fn sku(mut self, sku: &str) -> Self {
        self.sku = sku.to_string();
        self
    }

    pub fn category(mut self, category: &str) -> Self {
        self.category = category.to_string();
        self
    }

    pub fn quantity(mut self, quantity: &str) -> Self {
        self.quantity = quantity.to_string();
        self
    }

    pub fn amount(mut self, net_amount: &str) -> Self {
        self.net_amount = net_amount.to_string();
        self
    }

    pub fn discount(mut self, receipt_discount: &str) -> Self {
        self.receipt_discount = receipt_discount.to_string();
        self
    }

    pub fn customer(mut self, customer: &str) -> Self {
        self.customer = Some(customer.to_string());
        self
    }

    pub fn returned(mut self) -> Self {
        self.is_return = true;
        self
    }
}

pub async fn insert_lines(pool: &PgPool, lines: &[SaleLine]) -> sqlx::Result<()> {
    for l in lines {
        sqlx::query(
            r#"
            INSERT INTO sales_lines (
                store_code, receipt_no, line_no, sold_at, category, sku,
                quantity, net_amount, receipt_discount, customer_id, is_return
            )
            VALUES (
                $1, $2, $3, CAST($4 AS TIMESTAMP), $5, $6,
                CAST($7 AS NUMERIC), CAST($8 AS NUMERIC), CAST($9 AS NUMERIC), $10, $11
            )
            "#,
        )
        .bind(&l.store)
        .bind(&l.receipt)
        .bind(l.line_no)
        .bind(&l.sold_at)
        .bind(&l.category)
        .bind(&l.sku)
        .bind(&l.quantity)
        .bind(&l.net_amount)
        .bind(&l.receipt_discount)
        .bind(&l.customer)
        .bind(l.is_return)
        .execute(pool)
        .await?;
    }
    Ok(())
}

pub fn builtin_registry() -> Arc<Registry> {
    Arc::new(Registry::builtin().expect("built-in registry is valid"))
}

pub fn engine(pool: &PgPool) -> MaterializationEngine {
    MaterializationEngine::new(pool.clone(), builtin_registry())
}

pub fn service(pool: &PgPool) -> AggregateService {
    AggregateService::new(pool.clone(), builtin_registry(), AggregateSettings::default())
}

pub async fn table_exists(pool: &PgPool, table: &str) -> sqlx::Result<bool> {
    rollup_server::db::table_exists(pool, table).await
}

/// Every row of `table` rendered as `col=value|col=value` over all columns
/// except `id`, sorted. NULL renders as `NULL`.
pub async fn snapshot(pool: &PgPool, table: &str) -> sqlx::Result<Vec<String>> {
    let columns: Vec<String> = sqlx::query_scalar(
        r#"
        SELECT CAST(column_name AS TEXT)
        FROM information_schema.columns
        WHERE table_schema = current_schema()
          AND table_name = $1
          AND column_name <> 'id'
        ORDER BY ordinal_position
        "#,
    )
    .bind(table)
    .fetch_all(pool)
    .await?;

    let rendered = columns
        .iter()
        .map(|c| format!("'{c}=' || COALESCE(CAST({c} AS TEXT), 'NULL')", c = c))
        .collect::<Vec<_>>()
        .join(" || '|' || ");

    sqlx::query_scalar(&format!("SELECT {} FROM {} ORDER BY 1", rendered, table))
        .fetch_all(pool)
        .await
}

/// Snapshot rows belonging to one entity
pub async fn entity_snapshot(pool: &PgPool, table: &str, entity: &str) -> sqlx::Result<Vec<String>> {
    let prefix = format!("store_code={}|", entity);
    Ok(snapshot(pool, table)
        .await?
        .into_iter()
        .filter(|row| row.starts_with(&prefix))
        .collect())
}

pub async fn row_count(pool: &PgPool, table: &str, entity: &str) -> sqlx::Result<i64> {
    sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {} WHERE store_code = $1", table))
        .bind(entity)
        .fetch_one(pool)
        .await
}
