//! Structural drift detection and repair for aggregate tables

use serde::Serialize;
use sqlx::postgres::PgPool;
use std::collections::HashSet;
use std::sync::Arc;

use crate::db;
use crate::error::{is_connectivity_error, AggregateResult};
use crate::query::QueryGenerator;
use crate::registry::{ColumnSpec, ExpectedSchema, Registry};

/// A column added by the validator
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AddedColumn {
    pub table: String,
    pub column: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchemaReport {
    /// False when any corrective statement failed
    pub success: bool,
    pub log: Vec<String>,
    pub added: Vec<AddedColumn>,
    /// Drift that needs a human, e.g. a missing auto-increment key
    pub warnings: Vec<String>,
}

impl Default for SchemaReport {
    fn default() -> Self {
        Self {
            success: true,
            log: Vec::new(),
            added: Vec::new(),
            warnings: Vec::new(),
        }
    }
}

/// Corrective work for one table
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaPlan<'a> {
    pub add: Vec<&'a ColumnSpec>,
    pub warnings: Vec<String>,
}

impl SchemaPlan<'_> {
    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.warnings.is_empty()
    }
}

/// Diff expected columns against the lowercased live column names
pub fn plan_fixes<'a>(
    schema: &'a ExpectedSchema,
    live_columns: &HashSet<String>,
    skip_auto_increment: bool,
) -> SchemaPlan<'a> {
    let mut plan = SchemaPlan::default();

    for column in &schema.columns {
        if live_columns.contains(&column.name.to_ascii_lowercase()) {
            continue;
        }
        if column.auto_increment_key && skip_auto_increment {
            plan.warnings.push(format!(
                "{}.{} is missing and is an auto-increment key; add it manually",
                schema.table_name, column.name
            ));
        } else {
            plan.add.push(column);
        }
    }

    plan
}

pub struct SchemaValidator {
    pool: PgPool,
    registry: Arc<Registry>,
    skip_auto_increment_columns: bool,
}

impl SchemaValidator {
    pub fn new(pool: PgPool, registry: Arc<Registry>, skip_auto_increment_columns: bool) -> Self {
        Self {
            pool,
            registry,
            skip_auto_increment_columns,
        }
    }

    /// Add every missing column to every existing aggregate table.
    ///
    /// Each ALTER runs on its own; a failing one is logged and the rest still
    /// run. Tables that do not exist yet are left for the engine to create.
    #[tracing::instrument(skip(self))]
    pub async fn validate_and_fix(&self) -> AggregateResult<SchemaReport> {
        let generator = QueryGenerator::new(&self.registry);
        let mut report = SchemaReport::default();

        for table in self.registry.table_names() {
            let Some(schema) = self.registry.schema(table) else {
                report.log.push(format!("{}: no expected schema, skipped", table));
                continue;
            };

            if !db::table_exists(&self.pool, table).await? {
                report
                    .log
                    .push(format!("{}: table does not exist yet, will be created on first sync", table));
                continue;
            }

            let live = db::live_columns(&self.pool, table).await?;
            let plan = plan_fixes(schema, &live, self.skip_auto_increment_columns);
            if plan.is_empty() {
                report.log.push(format!("{}: schema up to date", table));
                continue;
            }

            for warning in plan.warnings {
                tracing::warn!(table = %table, "{}", warning);
                report.warnings.push(warning);
            }

            for column in plan.add {
                let statement = generator.add_column(table, column);
                match db::execute(&self.pool, &statement).await {
                    Ok(_) => {
                        tracing::info!(table = %table, column = %column.name, "Added missing column");
                        report.log.push(format!("{}: added column {}", table, column.definition()));
                        report.added.push(AddedColumn {
                            table: table.to_string(),
                            column: column.name.clone(),
                        });
                    },
                    Err(e) if is_connectivity_error(&e) => return Err(e.into()),
                    Err(e) => {
                        tracing::error!(table = %table, column = %column.name, error = %e, "Failed to add column");
                        report.success = false;
                        report.log.push(format!("{}: failed to add column {}: {}", table, column.name, e));
                    },
                }
            }
        }

        tracing::info!(
            success = report.success,
            added = report.added.len(),
            warnings = report.warnings.len(),
            "Schema validation finished"
        );

        Ok(report)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn schema() -> ExpectedSchema {
        ExpectedSchema::new(
            "daily_store_sales",
            vec![
                ColumnSpec::auto_increment_key("id"),
                ColumnSpec::new("store_code", "TEXT NOT NULL"),
                ColumnSpec::new("sale_date", "DATE NOT NULL"),
                ColumnSpec::new("net_sales", "NUMERIC(16,2) NOT NULL").with_default("0"),
            ],
        )
    }

    fn live(columns: &[&str]) -> HashSet<String> {
        columns.iter().map(|c| c.to_string()).collect()
    }

    #[test]
    fn test_one_missing_column() {
        let schema = schema();
        let plan = plan_fixes(&schema, &live(&["id", "store_code", "sale_date"]), true);
        assert_eq!(plan.add.len(), 1);
        assert_eq!(plan.add[0].name, "net_sales");
        assert!(plan.warnings.is_empty());
    }

    #[test]
    fn test_complete_table_needs_nothing() {
        let schema = schema();
        let plan = plan_fixes(&schema, &live(&["id", "store_code", "sale_date", "net_sales"]), true);
        assert!(plan.is_empty());
    }

    #[test]
    fn test_auto_increment_key_is_only_reported() {
        let schema = schema();
        let plan = plan_fixes(&schema, &live(&["store_code", "sale_date", "net_sales"]), true);
        assert!(plan.add.is_empty());
        assert_eq!(plan.warnings.len(), 1);
        assert!(plan.warnings[0].contains("daily_store_sales.id"));
    }

    #[test]
    fn test_auto_increment_key_added_when_allowed() {
        let schema = schema();
        let plan = plan_fixes(&schema, &live(&["store_code", "sale_date", "net_sales"]), false);
        assert_eq!(plan.add.len(), 1);
        assert!(plan.add[0].auto_increment_key);
        assert!(plan.warnings.is_empty());
    }

    #[test]
    fn test_expected_names_match_case_insensitively() {
        let schema = ExpectedSchema::new("t", vec![ColumnSpec::new("NetSales", "NUMERIC")]);
        let plan = plan_fixes(&schema, &live(&["netsales"]), true);
        assert!(plan.is_empty());
    }

    #[tokio::test]
    async fn test_store_down_aborts_validation() {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .acquire_timeout(std::time::Duration::from_millis(300))
            .connect_lazy("postgresql://rollup@127.0.0.1:1/rollup")
            .unwrap();
        let validator = SchemaValidator::new(pool, Arc::new(Registry::builtin().unwrap()), true);

        let err = validator.validate_and_fix().await.unwrap_err();
        assert!(err.is_connectivity(), "{:?}", err);
    }
}
