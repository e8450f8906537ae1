//! Declarative description of aggregate tables and their expected structure

use serde::Serialize;

/// Aggregation applied to a field's source expression
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Aggregation {
    Sum,
    Count,
    CountDistinct,
    Min,
    Max,
    /// Emulated as `MIN(expr)`. This is not "first by arrival": a true first
    /// value needs an ordering column and a window function.
    First,
}

impl Aggregation {
    /// Apply the operator to a single-stage expression
    pub fn apply(self, expr: &str) -> String {
        match self {
            Aggregation::Sum => format!("SUM({})", expr),
            Aggregation::Count => format!("COUNT({})", expr),
            Aggregation::CountDistinct => format!("COUNT(DISTINCT {})", expr),
            Aggregation::Min | Aggregation::First => format!("MIN({})", expr),
            Aggregation::Max => format!("MAX({})", expr),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Aggregation::Sum => "SUM",
            Aggregation::Count => "COUNT",
            Aggregation::CountDistinct => "COUNT_DISTINCT",
            Aggregation::Min => "MIN",
            Aggregation::Max => "MAX",
            Aggregation::First => "FIRST",
        }
    }
}

/// One aggregated output column
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldSpec {
    pub name: String,
    /// SQL expression over source table columns
    pub source: String,
    pub aggregation: Aggregation,
    /// The source value is repeated on every row of a natural-key unit
    /// (e.g. a receipt-level discount on each receipt line) and must be
    /// counted once per unit.
    pub partition_scoped: bool,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, source: impl Into<String>, aggregation: Aggregation) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
            aggregation,
            partition_scoped: false,
        }
    }

    pub fn sum(name: impl Into<String>, source: impl Into<String>) -> Self {
        Self::new(name, source, Aggregation::Sum)
    }

    pub fn count(name: impl Into<String>, source: impl Into<String>) -> Self {
        Self::new(name, source, Aggregation::Count)
    }

    /// In a two-stage table the value is taken once per natural key before
    /// counting, so `source` must be constant within a unit (a receipt's
    /// customer, not a line's sku) or the count comes out low.
    pub fn count_distinct(name: impl Into<String>, source: impl Into<String>) -> Self {
        Self::new(name, source, Aggregation::CountDistinct)
    }

    pub fn min(name: impl Into<String>, source: impl Into<String>) -> Self {
        Self::new(name, source, Aggregation::Min)
    }

    pub fn max(name: impl Into<String>, source: impl Into<String>) -> Self {
        Self::new(name, source, Aggregation::Max)
    }

    pub fn first(name: impl Into<String>, source: impl Into<String>) -> Self {
        Self::new(name, source, Aggregation::First)
    }

    pub fn partition_scoped(mut self) -> Self {
        self.partition_scoped = true;
        self
    }
}

/// Post-aggregation column computed from other output columns
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DerivedFieldSpec {
    pub name: String,
    pub formula: String,
}

impl DerivedFieldSpec {
    pub fn new(name: impl Into<String>, formula: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            formula: formula.into(),
        }
    }
}

/// One grouping dimension: `expression` goes to GROUP BY, `alias` names the
/// target column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupBySpec {
    pub expression: String,
    pub alias: String,
}

impl GroupBySpec {
    pub fn new(expression: impl Into<String>, alias: impl Into<String>) -> Self {
        Self {
            expression: expression.into(),
            alias: alias.into(),
        }
    }

    /// Parse `"expr AS alias"`. Only the last top-level `AS` counts, so
    /// `CAST(x AS INTEGER) AS hour` splits after the closing parenthesis.
    /// Text without an alias clause is its own alias.
    pub fn parse(text: &str) -> Self {
        match split_alias(text) {
            Some((expression, alias)) => Self::new(expression, alias),
            None => {
                let text = text.trim();
                Self::new(text, text)
            },
        }
    }
}

impl From<&str> for GroupBySpec {
    fn from(text: &str) -> Self {
        GroupBySpec::parse(text)
    }
}

fn split_alias(text: &str) -> Option<(&str, &str)> {
    let bytes = text.as_bytes();
    let mut depth = 0i32;
    let mut in_quote = false;
    let mut split = None;

    for i in 0..bytes.len() {
        match bytes[i] {
            b'\'' => in_quote = !in_quote,
            b'(' if !in_quote => depth += 1,
            b')' if !in_quote => depth -= 1,
            b if !in_quote && depth == 0 && b.is_ascii_whitespace() => {
                if i + 3 < bytes.len()
                    && bytes[i + 1].eq_ignore_ascii_case(&b'a')
                    && bytes[i + 2].eq_ignore_ascii_case(&b's')
                    && bytes[i + 3].is_ascii_whitespace()
                {
                    split = Some(i);
                }
            },
            _ => {},
        }
    }

    split
        .map(|i| (text[..i].trim(), text[i + 4..].trim()))
        .filter(|(expression, alias)| !expression.is_empty() && !alias.is_empty())
}

/// Declarative definition of one aggregate table
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableConfig {
    pub table_name: String,
    pub group_by: Vec<GroupBySpec>,
    pub fields: Vec<FieldSpec>,
    pub derived_fields: Vec<DerivedFieldSpec>,
    /// Extra predicate over source rows, ANDed into the WHERE clause
    pub filter_condition: Option<String>,
    /// Deduplicate per natural key before aggregating
    pub two_stage: bool,
}

impl TableConfig {
    pub fn new(table_name: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            group_by: Vec::new(),
            fields: Vec::new(),
            derived_fields: Vec::new(),
            filter_condition: None,
            two_stage: false,
        }
    }

    pub fn group_by(mut self, spec: impl Into<GroupBySpec>) -> Self {
        self.group_by.push(spec.into());
        self
    }

    pub fn field(mut self, field: FieldSpec) -> Self {
        self.fields.push(field);
        self
    }

    pub fn derived(mut self, name: impl Into<String>, formula: impl Into<String>) -> Self {
        self.derived_fields.push(DerivedFieldSpec::new(name, formula));
        self
    }

    pub fn filter(mut self, condition: impl Into<String>) -> Self {
        self.filter_condition = Some(condition.into());
        self
    }

    pub fn two_stage(mut self) -> Self {
        self.two_stage = true;
        self
    }

    pub fn has_partition_scoped_fields(&self) -> bool {
        self.fields.iter().any(|f| f.partition_scoped)
    }

    /// Every column the generated statements write, entity column first
    pub fn output_columns<'a>(&'a self, entity_column: &'a str) -> Vec<&'a str> {
        std::iter::once(entity_column)
            .chain(self.group_by.iter().map(|g| g.alias.as_str()))
            .chain(self.fields.iter().map(|f| f.name.as_str()))
            .chain(self.derived_fields.iter().map(|d| d.name.as_str()))
            .collect()
    }
}

/// The transactional table every aggregate is derived from
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceTable {
    pub table_name: String,
    /// Owning entity of each row (e.g. store code). Must be text typed:
    /// entity identifiers are bound as text parameters.
    pub entity_column: String,
    /// Identifies the unit partition-scoped values repeat across
    /// (e.g. receipt number).
    pub natural_key: String,
}

impl SourceTable {
    pub fn new(
        table_name: impl Into<String>,
        entity_column: impl Into<String>,
        natural_key: impl Into<String>,
    ) -> Self {
        Self {
            table_name: table_name.into(),
            entity_column: entity_column.into(),
            natural_key: natural_key.into(),
        }
    }
}

/// Expected definition of one physical column
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnSpec {
    pub name: String,
    pub column_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    /// Auto-incrementing primary key; cannot be added to a populated table
    pub auto_increment_key: bool,
}

impl ColumnSpec {
    pub fn new(name: impl Into<String>, column_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            column_type: column_type.into(),
            default: None,
            auto_increment_key: false,
        }
    }

    pub fn auto_increment_key(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            column_type: "BIGSERIAL PRIMARY KEY".to_string(),
            default: None,
            auto_increment_key: true,
        }
    }

    pub fn with_default(mut self, default: impl Into<String>) -> Self {
        self.default = Some(default.into());
        self
    }

    /// `name TYPE [DEFAULT value]`
    pub fn definition(&self) -> String {
        match &self.default {
            Some(default) => format!("{} {} DEFAULT {}", self.name, self.column_type, default),
            None => format!("{} {}", self.name, self.column_type),
        }
    }
}

/// Expected structure of an aggregate table
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExpectedSchema {
    pub table_name: String,
    pub columns: Vec<ColumnSpec>,
}

impl ExpectedSchema {
    pub fn new(table_name: impl Into<String>, columns: Vec<ColumnSpec>) -> Self {
        Self {
            table_name: table_name.into(),
            columns,
        }
    }

    /// Case-insensitive lookup, matching how Postgres folds unquoted names
    pub fn column(&self, name: &str) -> Option<&ColumnSpec> {
        self.columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }
}
