//! Aggregate table registry
//!
//! Holds one [`TableConfig`] per aggregate table, the [`ExpectedSchema`] of
//! each physical table and the [`SourceTable`] they are all derived from.
//! The registry is built once at startup, validated eagerly, and shared
//! read-only (`Arc<Registry>`) afterwards.
//!
//! Adding an aggregate table only takes a new entry in [`tables`]; nothing in
//! the query generator or the materialization engine is table specific.

pub mod tables;
pub mod types;

use std::collections::{HashMap, HashSet};

use crate::error::ConfigError;

pub use types::{
    Aggregation, ColumnSpec, DerivedFieldSpec, ExpectedSchema, FieldSpec, GroupBySpec,
    SourceTable, TableConfig,
};

/// Validated, immutable set of aggregate table definitions
#[derive(Debug, Clone)]
pub struct Registry {
    source: SourceTable,
    tables: Vec<TableConfig>,
    schemas: HashMap<String, ExpectedSchema>,
}

impl Registry {
    /// Build a registry, rejecting any definition that would generate
    /// broken statements.
    pub fn new(
        source: SourceTable,
        tables: Vec<TableConfig>,
        schemas: Vec<ExpectedSchema>,
    ) -> Result<Self, ConfigError> {
        validate_source(&source)?;

        let mut names = HashSet::new();
        for table in &tables {
            if !names.insert(table.table_name.as_str()) {
                return Err(ConfigError::DuplicateTable(table.table_name.clone()));
            }
            validate_table(&source, table)?;
        }

        let mut schema_map = HashMap::new();
        for schema in schemas {
            let Some(table) = tables.iter().find(|t| t.table_name == schema.table_name) else {
                return Err(ConfigError::TableNotFound(schema.table_name));
            };
            validate_schema(&source, table, &schema)?;
            if schema_map.contains_key(&schema.table_name) {
                return Err(ConfigError::DuplicateTable(schema.table_name));
            }
            schema_map.insert(schema.table_name.clone(), schema);
        }

        Ok(Self {
            source,
            tables,
            schemas: schema_map,
        })
    }

    /// The compiled-in retail aggregates
    pub fn builtin() -> Result<Self, ConfigError> {
        let (tables, schemas): (Vec<_>, Vec<_>) = tables::builtin_tables().into_iter().unzip();
        Self::new(tables::sales_source(), tables, schemas)
    }

    pub fn source(&self) -> &SourceTable {
        &self.source
    }

    pub fn get(&self, table_name: &str) -> Result<&TableConfig, ConfigError> {
        self.tables
            .iter()
            .find(|t| t.table_name == table_name)
            .ok_or_else(|| ConfigError::TableNotFound(table_name.to_string()))
    }

    /// Table names in registration order
    pub fn table_names(&self) -> Vec<&str> {
        self.tables.iter().map(|t| t.table_name.as_str()).collect()
    }

    pub fn tables(&self) -> &[TableConfig] {
        &self.tables
    }

    pub fn schema(&self, table_name: &str) -> Option<&ExpectedSchema> {
        self.schemas.get(table_name)
    }
}

pub(crate) fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn check_identifier(table: &str, name: &str) -> Result<(), ConfigError> {
    if is_identifier(name) {
        Ok(())
    } else {
        Err(ConfigError::InvalidIdentifier {
            table: table.to_string(),
            name: name.to_string(),
        })
    }
}

fn validate_source(source: &SourceTable) -> Result<(), ConfigError> {
    for name in [&source.table_name, &source.entity_column, &source.natural_key] {
        check_identifier(&source.table_name, name)?;
    }
    Ok(())
}

fn validate_table(source: &SourceTable, table: &TableConfig) -> Result<(), ConfigError> {
    let name = table.table_name.as_str();
    check_identifier(name, name)?;

    let mut seen = HashSet::new();
    for column in table.output_columns(&source.entity_column) {
        check_identifier(name, column)?;
        if !seen.insert(column.to_ascii_lowercase()) {
            return Err(ConfigError::DuplicateColumn {
                table: name.to_string(),
                column: column.to_string(),
            });
        }
    }

    for field in &table.fields {
        if field.source.trim().is_empty() {
            return Err(invalid_field(name, &field.name, "has an empty source expression"));
        }
        if field.partition_scoped {
            if !table.two_stage {
                return Err(ConfigError::TwoStageRequired {
                    table: name.to_string(),
                    field: field.name.clone(),
                });
            }
            if field.aggregation != Aggregation::Sum {
                return Err(invalid_field(
                    name,
                    &field.name,
                    "is partition scoped and must use SUM",
                ));
            }
        }
    }

    for derived in &table.derived_fields {
        if derived.formula.trim().is_empty() {
            return Err(invalid_field(name, &derived.name, "has an empty formula"));
        }
    }

    Ok(())
}

fn validate_schema(
    source: &SourceTable,
    table: &TableConfig,
    schema: &ExpectedSchema,
) -> Result<(), ConfigError> {
    let mut seen = HashSet::new();
    for column in &schema.columns {
        check_identifier(&schema.table_name, &column.name)?;
        if !seen.insert(column.name.to_ascii_lowercase()) {
            return Err(ConfigError::DuplicateColumn {
                table: schema.table_name.clone(),
                column: column.name.clone(),
            });
        }
    }

    for column in table.output_columns(&source.entity_column) {
        if schema.column(column).is_none() {
            return Err(ConfigError::UndeclaredColumn {
                table: schema.table_name.clone(),
                column: column.to_string(),
            });
        }
    }

    Ok(())
}

fn invalid_field(table: &str, field: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidField {
        table: table.to_string(),
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn source() -> SourceTable {
        SourceTable::new("sales_lines", "store_code", "receipt_no")
    }

    fn table(name: &str) -> TableConfig {
        TableConfig::new(name)
            .group_by("DATE(sold_at) AS sale_date")
            .field(FieldSpec::sum("units", "quantity"))
    }

    fn schema(name: &str) -> ExpectedSchema {
        ExpectedSchema::new(
            name,
            vec![
                ColumnSpec::auto_increment_key("id"),
                ColumnSpec::new("store_code", "TEXT NOT NULL"),
                ColumnSpec::new("sale_date", "DATE NOT NULL"),
                ColumnSpec::new("units", "NUMERIC(14,3)").with_default("0"),
            ],
        )
    }

    #[test]
    fn test_builtin_registry_loads() {
        let registry = Registry::builtin().unwrap();
        assert!(!registry.table_names().is_empty());
        for name in registry.table_names() {
            assert!(registry.schema(name).is_some(), "{} has no schema", name);
            assert!(registry.get(name).is_ok());
        }
        assert_eq!(registry.source().entity_column, "store_code");
    }

    #[test]
    fn test_unknown_table() {
        let registry = Registry::new(source(), vec![table("a")], vec![schema("a")]).unwrap();
        assert_eq!(
            registry.get("nope").unwrap_err(),
            ConfigError::TableNotFound("nope".to_string())
        );
    }

    #[test]
    fn test_duplicate_table_rejected() {
        let err = Registry::new(source(), vec![table("a"), table("a")], vec![]).unwrap_err();
        assert_eq!(err, ConfigError::DuplicateTable("a".to_string()));
    }

    #[test]
    fn test_partition_scoped_requires_two_stage() {
        let config = table("a").field(FieldSpec::sum("discount", "receipt_discount").partition_scoped());
        let err = Registry::new(source(), vec![config], vec![]).unwrap_err();
        assert!(matches!(err, ConfigError::TwoStageRequired { ref field, .. } if field == "discount"));
    }

    #[test]
    fn test_partition_scoped_requires_sum() {
        let config = table("a")
            .two_stage()
            .field(FieldSpec::max("discount", "receipt_discount").partition_scoped());
        let err = Registry::new(source(), vec![config], vec![]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidField { .. }));
    }

    #[test]
    fn test_duplicate_output_column_rejected() {
        let config = table("a").field(FieldSpec::count("UNITS", "*"));
        let err = Registry::new(source(), vec![config], vec![]).unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateColumn { .. }));
    }

    #[test]
    fn test_alias_must_be_identifier() {
        let config = TableConfig::new("a")
            .group_by("CAST(sold_at AS DATE)")
            .field(FieldSpec::sum("units", "quantity"));
        let err = Registry::new(source(), vec![config], vec![]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidIdentifier { .. }));
    }

    #[test]
    fn test_schema_must_declare_outputs() {
        let config = table("a").field(FieldSpec::sum("net_sales", "net_amount"));
        let err = Registry::new(source(), vec![config], vec![schema("a")]).unwrap_err();
        assert_eq!(
            err,
            ConfigError::UndeclaredColumn {
                table: "a".to_string(),
                column: "net_sales".to_string()
            }
        );
    }

    #[test]
    fn test_schema_for_unknown_table_rejected() {
        let err = Registry::new(source(), vec![table("a")], vec![schema("b")]).unwrap_err();
        assert_eq!(err, ConfigError::TableNotFound("b".to_string()));
    }
}
