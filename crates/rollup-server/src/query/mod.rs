//! Statement generation from table configuration
//!
//! Turns a [`TableConfig`] plus a set of entity identifiers into the SQL the
//! materialization engine runs: a scoped DELETE, an INSERT ... SELECT in one
//! of two shapes, and an optional UPDATE for derived fields.
//!
//! Entity identifiers are never spliced into SQL text. Each one becomes a
//! `$n` placeholder and travels in [`Statement::binds`].
//!
//! # Shapes
//!
//! Simple (`two_stage == false`): a single GROUP BY over the entity column
//! and the group-by expressions, straight off the source table.
//!
//! Two-stage: an inner query also groups by the natural key, collapsing
//! values repeated across the rows of one unit with `MAX`, and an outer query
//! re-aggregates per partition. Additive outputs are summed; `MIN`/`MAX`
//! outputs keep their own kind; `COUNT_DISTINCT` carries the value per unit
//! and counts distinct values outside, which is exact when the counted
//! expression is constant within a unit.

use serde::Serialize;
use std::collections::BTreeSet;

use crate::error::ConfigError;
use crate::registry::{Aggregation, ColumnSpec, ExpectedSchema, FieldSpec, Registry, TableConfig};

/// What a statement does, used for reporting and row accounting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatementKind {
    CreateTable,
    AddColumn,
    Delete,
    Insert,
    Update,
    Select,
}

/// SQL text plus its positional text parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Statement {
    pub kind: StatementKind,
    pub sql: String,
    pub binds: Vec<String>,
}

impl Statement {
    fn new(kind: StatementKind, sql: String) -> Self {
        Self {
            kind,
            sql,
            binds: Vec::new(),
        }
    }

    fn with_binds(mut self, binds: &[String]) -> Self {
        self.binds = binds.to_vec();
        self
    }
}

/// Deduplicate and sort entity identifiers so equal sets yield equal SQL
pub fn normalize_entities<S: AsRef<str>>(entities: &[S]) -> Vec<String> {
    entities
        .iter()
        .map(|e| e.as_ref().to_string())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// `$1, $2, ..., $count`
pub fn placeholders(count: usize) -> String {
    (1..=count)
        .map(|i| format!("${}", i))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Builds statements for the tables of one registry
#[derive(Debug, Clone, Copy)]
pub struct QueryGenerator<'a> {
    registry: &'a Registry,
}

impl<'a> QueryGenerator<'a> {
    pub fn new(registry: &'a Registry) -> Self {
        Self { registry }
    }

    /// DELETE, INSERT and (if the table has derived fields) UPDATE for the
    /// given entities, in execution order. An empty entity set is a no-op.
    pub fn sync_statements<S: AsRef<str>>(
        &self,
        table_name: &str,
        entities: &[S],
    ) -> Result<Vec<Statement>, ConfigError> {
        let config = self.registry.get(table_name)?;
        let entities = normalize_entities(entities);
        if entities.is_empty() {
            return Ok(Vec::new());
        }

        let mut statements = vec![self.delete(config, &entities), self.insert(config, &entities)];
        statements.extend(self.update(config, &entities));
        Ok(statements)
    }

    pub fn delete(&self, config: &TableConfig, entities: &[String]) -> Statement {
        let sql = format!(
            "DELETE FROM {} WHERE {} IN ({})",
            config.table_name,
            self.entity_column(),
            placeholders(entities.len())
        );
        Statement::new(StatementKind::Delete, sql).with_binds(entities)
    }

    pub fn insert(&self, config: &TableConfig, entities: &[String]) -> Statement {
        let sql = if config.two_stage {
            self.two_stage_insert(config, entities.len())
        } else {
            self.simple_insert(config, entities.len())
        };
        Statement::new(StatementKind::Insert, sql).with_binds(entities)
    }

    /// One UPDATE assigning every derived field, or `None` without any
    pub fn update(&self, config: &TableConfig, entities: &[String]) -> Option<Statement> {
        if config.derived_fields.is_empty() {
            return None;
        }

        let assignments = config
            .derived_fields
            .iter()
            .map(|d| format!("{} = {}", d.name, d.formula))
            .collect::<Vec<_>>()
            .join(", ");

        let sql = format!(
            "UPDATE {} SET {} WHERE {} IN ({})",
            config.table_name,
            assignments,
            self.entity_column(),
            placeholders(entities.len())
        );
        Some(Statement::new(StatementKind::Update, sql).with_binds(entities))
    }

    pub fn create_table(&self, schema: &ExpectedSchema) -> Statement {
        let columns = schema
            .columns
            .iter()
            .map(|c| format!("    {}", c.definition()))
            .collect::<Vec<_>>()
            .join(",\n");
        let sql = format!("CREATE TABLE IF NOT EXISTS {} (\n{}\n)", schema.table_name, columns);
        Statement::new(StatementKind::CreateTable, sql)
    }

    pub fn add_column(&self, table_name: &str, column: &ColumnSpec) -> Statement {
        let sql = format!(
            "ALTER TABLE {} ADD COLUMN IF NOT EXISTS {}",
            table_name,
            column.definition()
        );
        Statement::new(StatementKind::AddColumn, sql)
    }

    /// Per entity: how many partitions the source would produce for `config`.
    /// Rows: `(entity TEXT, partitions BIGINT)`. Source rows without an
    /// entity belong to no partition and are not counted.
    pub fn source_partition_counts(&self, config: &TableConfig) -> Statement {
        let source = self.registry.source();
        let entity = self.entity_column();
        let group_by = std::iter::once(entity)
            .chain(config.group_by.iter().map(|g| g.expression.as_str()))
            .collect::<Vec<_>>()
            .join(", ");
        let mut filter = format!("\n    WHERE {} IS NOT NULL", entity);
        if let Some(condition) = &config.filter_condition {
            filter.push_str(&format!(" AND ({})", condition));
        }

        let sql = format!(
            "SELECT CAST({entity} AS TEXT) AS entity, COUNT(*) AS partitions\n\
             FROM (\n    \
                 SELECT {entity}\n    \
                 FROM {source}{filter}\n    \
                 GROUP BY {group_by}\n\
             ) AS p\n\
             GROUP BY {entity}",
            entity = entity,
            source = source.table_name,
            filter = filter,
            group_by = group_by,
        );
        Statement::new(StatementKind::Select, sql)
    }

    /// Per entity: how many rows the aggregate table holds.
    /// Rows: `(entity TEXT, partitions BIGINT)`.
    pub fn aggregate_partition_counts(&self, config: &TableConfig) -> Statement {
        let entity = self.entity_column();
        let sql = format!(
            "SELECT CAST({entity} AS TEXT) AS entity, COUNT(*) AS partitions\n\
             FROM {table}\n\
             WHERE {entity} IS NOT NULL\n\
             GROUP BY {entity}",
            entity = entity,
            table = config.table_name,
        );
        Statement::new(StatementKind::Select, sql)
    }

    fn entity_column(&self) -> &'a str {
        self.registry.source().entity_column.as_str()
    }

    fn insert_columns(&self, config: &TableConfig) -> String {
        config
            .output_columns(self.entity_column())
            .into_iter()
            .filter(|c| !config.derived_fields.iter().any(|d| d.name == *c))
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn where_clause(&self, config: &TableConfig, entity_count: usize) -> String {
        let mut clause = format!(
            "WHERE {} IN ({})",
            self.entity_column(),
            placeholders(entity_count)
        );
        if let Some(filter) = &config.filter_condition {
            clause.push_str(&format!(" AND ({})", filter));
        }
        clause
    }

    fn simple_insert(&self, config: &TableConfig, entity_count: usize) -> String {
        let entity = self.entity_column();

        let select = std::iter::once(entity.to_string())
            .chain(config.group_by.iter().map(|g| g.expression.clone()))
            .chain(config.fields.iter().map(|f| f.aggregation.apply(&f.source)))
            .collect::<Vec<_>>()
            .join(", ");

        let group_by = std::iter::once(entity)
            .chain(config.group_by.iter().map(|g| g.expression.as_str()))
            .collect::<Vec<_>>()
            .join(", ");

        format!(
            "INSERT INTO {table} ({columns})\n\
             SELECT {select}\n\
             FROM {source}\n\
             {where_clause}\n\
             GROUP BY {group_by}",
            table = config.table_name,
            columns = self.insert_columns(config),
            select = select,
            source = self.registry.source().table_name,
            where_clause = self.where_clause(config, entity_count),
            group_by = group_by,
        )
    }

    fn two_stage_insert(&self, config: &TableConfig, entity_count: usize) -> String {
        let source = self.registry.source();
        let entity = self.entity_column();

        let inner_select = std::iter::once(entity.to_string())
            .chain(
                config
                    .group_by
                    .iter()
                    .map(|g| format!("{} AS {}", g.expression, g.alias)),
            )
            .chain(
                config
                    .fields
                    .iter()
                    .map(|f| format!("{} AS {}", inner_aggregate(f), f.name)),
            )
            .collect::<Vec<_>>()
            .join(", ");

        let inner_group_by = [entity, source.natural_key.as_str()]
            .into_iter()
            .chain(config.group_by.iter().map(|g| g.expression.as_str()))
            .collect::<Vec<_>>()
            .join(", ");

        let outer_select = std::iter::once(entity.to_string())
            .chain(config.group_by.iter().map(|g| g.alias.clone()))
            .chain(config.fields.iter().map(outer_aggregate))
            .collect::<Vec<_>>()
            .join(", ");

        // The inner query exposes aliases as real columns, so grouping the
        // outer query by alias is plain column grouping.
        let outer_group_by = std::iter::once(entity)
            .chain(config.group_by.iter().map(|g| g.alias.as_str()))
            .collect::<Vec<_>>()
            .join(", ");

        format!(
            "INSERT INTO {table} ({columns})\n\
             SELECT {outer_select}\n\
             FROM (\n    \
                 SELECT {inner_select}\n    \
                 FROM {source}\n    \
                 {where_clause}\n    \
                 GROUP BY {inner_group_by}\n\
             ) AS stage\n\
             GROUP BY {outer_group_by}",
            table = config.table_name,
            columns = self.insert_columns(config),
            outer_select = outer_select,
            inner_select = inner_select,
            source = source.table_name,
            where_clause = self.where_clause(config, entity_count),
            inner_group_by = inner_group_by,
            outer_group_by = outer_group_by,
        )
    }
}

fn inner_aggregate(field: &FieldSpec) -> String {
    if field.partition_scoped || field.aggregation == Aggregation::CountDistinct {
        format!("MAX({})", field.source)
    } else {
        field.aggregation.apply(&field.source)
    }
}

fn outer_aggregate(field: &FieldSpec) -> String {
    if field.partition_scoped {
        return format!("SUM({})", field.name);
    }
    match field.aggregation {
        Aggregation::Sum | Aggregation::Count => format!("SUM({})", field.name),
        Aggregation::CountDistinct => format!("COUNT(DISTINCT {})", field.name),
        Aggregation::Min | Aggregation::First => format!("MIN({})", field.name),
        Aggregation::Max => format!("MAX({})", field.name),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::registry::{FieldSpec, SourceTable};
    use proptest::prelude::*;

    fn registry() -> Registry {
        let simple = TableConfig::new("hourly")
            .group_by("DATE(sold_at) AS sale_date")
            .group_by("CAST(EXTRACT(HOUR FROM sold_at) AS INTEGER) AS sale_hour")
            .field(FieldSpec::count("line_count", "*"))
            .field(FieldSpec::sum("units", "quantity"))
            .field(FieldSpec::first("first_sale_at", "sold_at"))
            .filter("NOT is_return");

        let staged = TableConfig::new("daily")
            .group_by("DATE(sold_at) AS sale_date")
            .field(FieldSpec::sum("units", "quantity"))
            .field(FieldSpec::sum("discount", "receipt_discount").partition_scoped())
            .field(FieldSpec::count_distinct("receipts", "receipt_no"))
            .field(FieldSpec::max("last_sale_at", "sold_at"))
            .derived("avg_units", "units / NULLIF(receipts, 0)")
            .derived("net", "units - discount")
            .two_stage();

        Registry::new(
            SourceTable::new("sales_lines", "store_code", "receipt_no"),
            vec![simple, staged],
            vec![],
        )
        .unwrap()
    }

    fn entities(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_simple_insert_shape() {
        let registry = registry();
        let generator = QueryGenerator::new(&registry);
        let config = registry.get("hourly").unwrap();

        let insert = generator.insert(config, &entities(&["S1", "S2"]));
        assert_eq!(insert.kind, StatementKind::Insert);
        assert_eq!(
            insert.sql,
            "INSERT INTO hourly (store_code, sale_date, sale_hour, line_count, units, first_sale_at)\n\
             SELECT store_code, DATE(sold_at), CAST(EXTRACT(HOUR FROM sold_at) AS INTEGER), COUNT(*), SUM(quantity), MIN(sold_at)\n\
             FROM sales_lines\n\
             WHERE store_code IN ($1, $2) AND (NOT is_return)\n\
             GROUP BY store_code, DATE(sold_at), CAST(EXTRACT(HOUR FROM sold_at) AS INTEGER)"
        );
        assert_eq!(insert.binds, vec!["S1", "S2"]);
    }

    #[test]
    fn test_aliases_never_reach_source_group_by() {
        let registry = registry();
        let generator = QueryGenerator::new(&registry);

        for name in ["hourly", "daily"] {
            let config = registry.get(name).unwrap();
            let sql = generator.insert(config, &entities(&["S1"])).sql;
            let source_group_by = sql
                .lines()
                .find(|l| l.trim_start().starts_with("GROUP BY") && l.contains("sold_at"))
                .unwrap();
            assert!(!source_group_by.contains("sale_date"), "{}", source_group_by);
            assert!(!source_group_by.contains("sale_hour"), "{}", source_group_by);
        }
    }

    #[test]
    fn test_two_stage_insert_shape() {
        let registry = registry();
        let generator = QueryGenerator::new(&registry);
        let config = registry.get("daily").unwrap();

        let insert = generator.insert(config, &entities(&["S1"]));
        assert_eq!(
            insert.sql,
            "INSERT INTO daily (store_code, sale_date, units, discount, receipts, last_sale_at)\n\
             SELECT store_code, sale_date, SUM(units), SUM(discount), COUNT(DISTINCT receipts), MAX(last_sale_at)\n\
             FROM (\n    \
                 SELECT store_code, DATE(sold_at) AS sale_date, SUM(quantity) AS units, MAX(receipt_discount) AS discount, MAX(receipt_no) AS receipts, MAX(sold_at) AS last_sale_at\n    \
                 FROM sales_lines\n    \
                 WHERE store_code IN ($1)\n    \
                 GROUP BY store_code, receipt_no, DATE(sold_at)\n\
             ) AS stage\n\
             GROUP BY store_code, sale_date"
        );
    }

    #[test]
    fn test_delete_and_update() {
        let registry = registry();
        let generator = QueryGenerator::new(&registry);
        let config = registry.get("daily").unwrap();
        let ids = entities(&["A", "B", "C"]);

        let delete = generator.delete(config, &ids);
        assert_eq!(delete.sql, "DELETE FROM daily WHERE store_code IN ($1, $2, $3)");
        assert_eq!(delete.binds, ids);

        let update = generator.update(config, &ids).unwrap();
        assert_eq!(
            update.sql,
            "UPDATE daily SET avg_units = units / NULLIF(receipts, 0), net = units - discount \
             WHERE store_code IN ($1, $2, $3)"
        );

        assert!(generator.update(registry.get("hourly").unwrap(), &ids).is_none());
    }

    #[test]
    fn test_sync_statements_order() {
        let registry = registry();
        let generator = QueryGenerator::new(&registry);

        let kinds: Vec<_> = generator
            .sync_statements("daily", &["B", "A"])
            .unwrap()
            .iter()
            .map(|s| s.kind)
            .collect();
        assert_eq!(
            kinds,
            vec![StatementKind::Delete, StatementKind::Insert, StatementKind::Update]
        );

        let kinds: Vec<_> = generator
            .sync_statements("hourly", &["A"])
            .unwrap()
            .iter()
            .map(|s| s.kind)
            .collect();
        assert_eq!(kinds, vec![StatementKind::Delete, StatementKind::Insert]);
    }

    #[test]
    fn test_empty_entities_is_noop() {
        let registry = registry();
        let generator = QueryGenerator::new(&registry);
        let none: [&str; 0] = [];
        assert!(generator.sync_statements("daily", &none).unwrap().is_empty());
    }

    #[test]
    fn test_unknown_table() {
        let registry = registry();
        let generator = QueryGenerator::new(&registry);
        assert_eq!(
            generator.sync_statements("weekly", &["A"]).unwrap_err(),
            ConfigError::TableNotFound("weekly".to_string())
        );
    }

    #[test]
    fn test_entity_values_only_travel_as_binds() {
        let registry = registry();
        let generator = QueryGenerator::new(&registry);
        let hostile = "x'); DROP TABLE sales_lines; --";

        for statement in generator.sync_statements("daily", &[hostile]).unwrap() {
            assert!(!statement.sql.contains(hostile));
            assert_eq!(statement.binds, vec![hostile.to_string()]);
        }
    }

    #[test]
    fn test_partition_count_queries() {
        let registry = registry();
        let generator = QueryGenerator::new(&registry);
        let config = registry.get("hourly").unwrap();

        let source = generator.source_partition_counts(config);
        assert!(source
            .sql
            .contains("WHERE store_code IS NOT NULL AND (NOT is_return)"));
        assert!(source.sql.contains(
            "GROUP BY store_code, DATE(sold_at), CAST(EXTRACT(HOUR FROM sold_at) AS INTEGER)"
        ));
        assert!(source.binds.is_empty());

        let aggregate = generator.aggregate_partition_counts(config);
        assert_eq!(
            aggregate.sql,
            "SELECT CAST(store_code AS TEXT) AS entity, COUNT(*) AS partitions\nFROM hourly\n\
             WHERE store_code IS NOT NULL\nGROUP BY store_code"
        );

        let unfiltered = generator.source_partition_counts(registry.get("daily").unwrap());
        assert!(unfiltered.sql.contains("WHERE store_code IS NOT NULL\n"));
    }

    #[test]
    fn test_ddl_statements() {
        let registry = registry();
        let generator = QueryGenerator::new(&registry);
        let schema = ExpectedSchema::new(
            "daily",
            vec![
                ColumnSpec::auto_increment_key("id"),
                ColumnSpec::new("store_code", "TEXT NOT NULL"),
                ColumnSpec::new("units", "NUMERIC(14,3) NOT NULL").with_default("0"),
            ],
        );

        assert_eq!(
            generator.create_table(&schema).sql,
            "CREATE TABLE IF NOT EXISTS daily (\n    id BIGSERIAL PRIMARY KEY,\n    \
             store_code TEXT NOT NULL,\n    units NUMERIC(14,3) NOT NULL DEFAULT 0\n)"
        );
        assert_eq!(
            generator.add_column("daily", &schema.columns[2]).sql,
            "ALTER TABLE daily ADD COLUMN IF NOT EXISTS units NUMERIC(14,3) NOT NULL DEFAULT 0"
        );
    }

    proptest! {
        #[test]
        fn prop_one_placeholder_per_distinct_entity(ids in proptest::collection::vec("[A-Z0-9]{1,6}", 1..40)) {
            let registry = registry();
            let generator = QueryGenerator::new(&registry);
            let distinct = normalize_entities(&ids);

            for statement in generator.sync_statements("daily", &ids).unwrap() {
                prop_assert_eq!(&statement.binds, &distinct);
                let last = format!("${}", distinct.len());
                let beyond = format!("${}", distinct.len() + 1);
                prop_assert!(statement.sql.contains(&last));
                prop_assert!(!statement.sql.contains(&beyond));
            }
        }
    }
}
