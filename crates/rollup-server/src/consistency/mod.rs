//! Data drift detection between the source table and each aggregate table
//!
//! The unit of comparison is the partition count per entity: how many
//! aggregate rows an entity should have (distinct group-by values in the
//! source, filter applied) against how many it does have. Entities only on
//! the source side are missing, entities only on the aggregate side are
//! orphans, and entities whose counts differ by more than the tolerance are
//! mismatched.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::postgres::PgPool;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::config::DEFAULT_MISMATCH_TOLERANCE;
use crate::db;
use crate::error::AggregateResult;
use crate::query::QueryGenerator;
use crate::registry::Registry;

/// Partition counts of one table, taken fresh for every check
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConsistencySnapshot {
    pub table: String,
    pub present_in_source: BTreeSet<String>,
    pub present_in_aggregate: BTreeSet<String>,
    pub counts_source: BTreeMap<String, i64>,
    pub counts_aggregate: BTreeMap<String, i64>,
}

impl ConsistencySnapshot {
    pub fn new<I, J>(table: impl Into<String>, source: I, aggregate: J) -> Self
    where
        I: IntoIterator<Item = (String, i64)>,
        J: IntoIterator<Item = (String, i64)>,
    {
        let counts_source: BTreeMap<_, _> = source.into_iter().collect();
        let counts_aggregate: BTreeMap<_, _> = aggregate.into_iter().collect();
        Self {
            table: table.into(),
            present_in_source: counts_source.keys().cloned().collect(),
            present_in_aggregate: counts_aggregate.keys().cloned().collect(),
            counts_source,
            counts_aggregate,
        }
    }

    /// Classify drift. An entity on both sides is mismatched when
    /// `|aggregate - source| / source` is strictly greater than `tolerance`.
    pub fn classify(&self, tolerance: f64) -> TableDrift {
        let missing = self
            .present_in_source
            .difference(&self.present_in_aggregate)
            .cloned()
            .collect();
        let orphan = self
            .present_in_aggregate
            .difference(&self.present_in_source)
            .cloned()
            .collect();

        let mismatched = self
            .counts_source
            .iter()
            .filter_map(|(entity, &source_count)| {
                let &aggregate_count = self.counts_aggregate.get(entity)?;
                // Source counts come from GROUP BY, so they are at least 1.
                if source_count <= 0 {
                    return None;
                }
                let diff = (aggregate_count - source_count) as f64 / source_count as f64;
                (diff.abs() > tolerance).then(|| MismatchRecord {
                    table: self.table.clone(),
                    entity: entity.clone(),
                    source_count,
                    aggregate_count,
                    diff_percent: diff * 100.0,
                })
            })
            .collect();

        TableDrift {
            table: self.table.clone(),
            missing,
            orphan,
            mismatched,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MismatchRecord {
    pub table: String,
    pub entity: String,
    pub source_count: i64,
    pub aggregate_count: i64,
    /// `(aggregate - source) / source * 100`
    pub diff_percent: f64,
}

/// Drift of one aggregate table
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TableDrift {
    pub table: String,
    pub missing: Vec<String>,
    pub orphan: Vec<String>,
    pub mismatched: Vec<MismatchRecord>,
}

impl TableDrift {
    pub fn is_consistent(&self) -> bool {
        self.missing.is_empty() && self.orphan.is_empty() && self.mismatched.is_empty()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConsistencyReport {
    pub consistent: bool,
    /// Source-only entities, across all tables
    pub missing: Vec<String>,
    /// Aggregate-only entities, across all tables
    pub orphan: Vec<String>,
    pub mismatched: Vec<MismatchRecord>,
    pub tables: Vec<TableDrift>,
    pub checked_at: DateTime<Utc>,
}

impl ConsistencyReport {
    pub fn from_tables(tables: Vec<TableDrift>, checked_at: DateTime<Utc>) -> Self {
        let missing: BTreeSet<_> = tables.iter().flat_map(|t| t.missing.iter().cloned()).collect();
        let orphan: BTreeSet<_> = tables.iter().flat_map(|t| t.orphan.iter().cloned()).collect();
        let mismatched: Vec<_> = tables.iter().flat_map(|t| t.mismatched.iter().cloned()).collect();

        Self {
            consistent: tables.iter().all(TableDrift::is_consistent),
            missing: missing.into_iter().collect(),
            orphan: orphan.into_iter().collect(),
            mismatched,
            tables,
            checked_at,
        }
    }

    /// Entities to rebuild: missing ones plus mismatched ones, sorted
    pub fn entities_to_sync(&self) -> Vec<String> {
        self.missing
            .iter()
            .cloned()
            .chain(self.mismatched.iter().map(|m| m.entity.clone()))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Orphan entities of each table that reported any
    pub fn orphans_by_table(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.tables
            .iter()
            .filter(|t| !t.orphan.is_empty())
            .map(|t| (t.table.as_str(), t.orphan.as_slice()))
    }
}

pub struct ConsistencyChecker {
    pool: PgPool,
    registry: Arc<Registry>,
    tolerance: f64,
}

impl ConsistencyChecker {
    pub fn new(pool: PgPool, registry: Arc<Registry>) -> Self {
        Self {
            pool,
            registry,
            tolerance: DEFAULT_MISMATCH_TOLERANCE,
        }
    }

    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    /// Take a snapshot of one table
    pub async fn snapshot(&self, table: &str) -> AggregateResult<ConsistencySnapshot> {
        let generator = QueryGenerator::new(&self.registry);
        let config = self.registry.get(table)?;

        let source =
            db::fetch_partition_counts(&self.pool, &generator.source_partition_counts(config)).await?;
        let aggregate = if db::table_exists(&self.pool, table).await? {
            db::fetch_partition_counts(&self.pool, &generator.aggregate_partition_counts(config))
                .await?
        } else {
            Vec::new()
        };

        Ok(ConsistencySnapshot::new(table, source, aggregate))
    }

    #[tracing::instrument(skip(self))]
    pub async fn check_consistency(&self) -> AggregateResult<ConsistencyReport> {
        let mut tables = Vec::new();

        for table in self.registry.table_names() {
            let drift = self.snapshot(table).await?.classify(self.tolerance);
            if !drift.is_consistent() {
                tracing::warn!(
                    table = %table,
                    missing = drift.missing.len(),
                    orphan = drift.orphan.len(),
                    mismatched = drift.mismatched.len(),
                    "Aggregate table drifted from source"
                );
            }
            tables.push(drift);
        }

        let report = ConsistencyReport::from_tables(tables, Utc::now());
        tracing::info!(
            consistent = report.consistent,
            missing = report.missing.len(),
            orphan = report.orphan.len(),
            mismatched = report.mismatched.len(),
            "Consistency check finished"
        );

        Ok(report)
    }
}
