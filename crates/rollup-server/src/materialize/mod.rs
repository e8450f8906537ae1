//! Materialization engine
//!
//! Rebuilds aggregate rows for a set of entities. Each batch of entities is
//! replaced inside one transaction (DELETE, INSERT, UPDATE), so readers see
//! either the old rows or the new ones. A batch that fails is rolled back and
//! retried one entity at a time; entities that still fail are recorded and
//! the run carries on with the rest. Only loss of the store aborts a run.

use serde::Serialize;
use sqlx::postgres::PgPool;
use sqlx::{Postgres, Transaction};
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::config::DEFAULT_BATCH_SIZE;
use crate::db;
use crate::error::{is_connectivity_error, AggregateResult};
use crate::query::{normalize_entities, QueryGenerator, Statement, StatementKind};
use crate::registry::{ExpectedSchema, Registry};

/// One entity that could not be processed for one table
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntityFailure {
    pub table: String,
    pub entity: String,
    pub error: String,
}

/// Result of rebuilding one table
#[derive(Debug, Clone, Default, Serialize)]
pub struct TableSyncReport {
    pub table: String,
    pub synced: Vec<String>,
    pub failed: Vec<EntityFailure>,
    pub rows_deleted: u64,
    pub rows_inserted: u64,
    /// The table did not exist and was created from its expected schema
    pub created: bool,
}

impl TableSyncReport {
    fn new(table: &str) -> Self {
        Self {
            table: table.to_string(),
            ..Default::default()
        }
    }
}

/// Result of rebuilding every registered table
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    pub tables: Vec<TableSyncReport>,
}

impl SyncReport {
    pub fn failures(&self) -> impl Iterator<Item = &EntityFailure> {
        self.tables.iter().flat_map(|t| t.failed.iter())
    }

    /// Entities that failed in at least one table, sorted
    pub fn failed_entities(&self) -> Vec<String> {
        self.failures()
            .map(|f| f.entity.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Entities rebuilt in every table they were requested for, sorted
    pub fn synced_entities(&self) -> Vec<String> {
        let failed: BTreeSet<_> = self.failures().map(|f| f.entity.as_str()).collect();
        self.tables
            .iter()
            .flat_map(|t| t.synced.iter())
            .filter(|e| !failed.contains(e.as_str()))
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn is_success(&self) -> bool {
        self.failures().next().is_none()
    }
}

/// Result of deleting entities from one table
#[derive(Debug, Clone, Default, Serialize)]
pub struct TableCleanup {
    pub table: String,
    pub removed: Vec<String>,
    pub failed: Vec<EntityFailure>,
    pub rows_deleted: u64,
}

#[derive(Debug, Default)]
struct BatchOutcome {
    rows_deleted: u64,
    rows_inserted: u64,
    created: bool,
}

#[derive(Debug, Default)]
struct BatchRun {
    succeeded: Vec<String>,
    failed: Vec<EntityFailure>,
    rows_deleted: u64,
    rows_inserted: u64,
    created: bool,
}

impl BatchRun {
    fn absorb(&mut self, entities: &[String], outcome: BatchOutcome) {
        self.succeeded.extend_from_slice(entities);
        self.rows_deleted += outcome.rows_deleted;
        self.rows_inserted += outcome.rows_inserted;
        self.created |= outcome.created;
    }
}

#[derive(Clone)]
pub struct MaterializationEngine {
    pool: PgPool,
    registry: Arc<Registry>,
    batch_size: usize,
}

impl MaterializationEngine {
    pub fn new(pool: PgPool, registry: Arc<Registry>) -> Self {
        Self {
            pool,
            registry,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Rebuild every registered table for `entities`
    #[tracing::instrument(skip(self, entities), fields(entity_count = entities.len()))]
    pub async fn sync_partitions<S: AsRef<str>>(&self, entities: &[S]) -> AggregateResult<SyncReport> {
        let entities = normalize_entities(entities);
        let mut report = SyncReport::default();

        for table in self.registry.table_names() {
            report.tables.push(self.sync_table(table, &entities).await?);
        }

        tracing::info!(
            tables = report.tables.len(),
            synced = report.synced_entities().len(),
            failed = report.failed_entities().len(),
            "Partition sync finished"
        );

        Ok(report)
    }

    /// Rebuild one table for `entities`
    #[tracing::instrument(skip(self, entities), fields(entity_count = entities.len()))]
    pub async fn sync_table<S: AsRef<str>>(
        &self,
        table: &str,
        entities: &[S],
    ) -> AggregateResult<TableSyncReport> {
        let config = self.registry.get(table)?;
        let entities = normalize_entities(entities);
        let mut report = TableSyncReport::new(table);
        if entities.is_empty() {
            return Ok(report);
        }

        let generator = QueryGenerator::new(&self.registry);
        let schema = self.registry.schema(table);
        let run = self
            .run_in_batches(table, &entities, schema, |batch| {
                let mut statements = vec![generator.delete(config, batch), generator.insert(config, batch)];
                statements.extend(generator.update(config, batch));
                statements
            })
            .await?;

        report.synced = run.succeeded;
        report.failed = run.failed;
        report.rows_deleted = run.rows_deleted;
        report.rows_inserted = run.rows_inserted;
        report.created = run.created;

        tracing::info!(
            table = %table,
            synced = report.synced.len(),
            failed = report.failed.len(),
            rows_inserted = report.rows_inserted,
            created = report.created,
            "Aggregate table synced"
        );

        Ok(report)
    }

    /// Remove every row of `entities` from one table. A table that does not
    /// exist holds nothing and is left alone.
    #[tracing::instrument(skip(self, entities), fields(entity_count = entities.len()))]
    pub async fn delete_entities<S: AsRef<str>>(
        &self,
        table: &str,
        entities: &[S],
    ) -> AggregateResult<TableCleanup> {
        let config = self.registry.get(table)?;
        let entities = normalize_entities(entities);
        let mut cleanup = TableCleanup {
            table: table.to_string(),
            ..Default::default()
        };
        if entities.is_empty() || !db::table_exists(&self.pool, table).await? {
            return Ok(cleanup);
        }

        let generator = QueryGenerator::new(&self.registry);
        let run = self
            .run_in_batches(table, &entities, None, |batch| vec![generator.delete(config, batch)])
            .await?;

        cleanup.removed = run.succeeded;
        cleanup.failed = run.failed;
        cleanup.rows_deleted = run.rows_deleted;

        tracing::info!(
            table = %table,
            removed = cleanup.removed.len(),
            rows_deleted = cleanup.rows_deleted,
            "Entities removed from aggregate table"
        );

        Ok(cleanup)
    }

    async fn run_in_batches<F>(
        &self,
        table: &str,
        entities: &[String],
        schema: Option<&ExpectedSchema>,
        build: F,
    ) -> AggregateResult<BatchRun>
    where
        F: Fn(&[String]) -> Vec<Statement>,
    {
        let mut run = BatchRun::default();

        for batch in entities.chunks(self.batch_size) {
            let err = match self.run_batch(schema, &build(batch)).await {
                Ok(outcome) => {
                    run.absorb(batch, outcome);
                    continue;
                },
                Err(e) if is_connectivity_error(&e) => return Err(e.into()),
                Err(e) => e,
            };

            if batch.len() == 1 {
                run.failed.push(failure(table, &batch[0], &err));
                continue;
            }

            tracing::warn!(
                table = %table,
                batch_size = batch.len(),
                error = %err,
                "Batch failed, retrying entities one at a time"
            );

            for entity in batch {
                let single = std::slice::from_ref(entity);
                match self.run_batch(schema, &build(single)).await {
                    Ok(outcome) => run.absorb(single, outcome),
                    Err(e) if is_connectivity_error(&e) => return Err(e.into()),
                    Err(e) => run.failed.push(failure(table, entity, &e)),
                }
            }
        }

        Ok(run)
    }

    async fn run_batch(
        &self,
        schema: Option<&ExpectedSchema>,
        statements: &[Statement],
    ) -> Result<BatchOutcome, sqlx::Error> {
        let generator = QueryGenerator::new(&self.registry);
        let mut tx = self.pool.begin().await?;

        match apply(&mut tx, &generator, schema, statements).await {
            Ok(outcome) => {
                tx.commit().await?;
                Ok(outcome)
            },
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    tracing::warn!(error = %rollback, "Rollback failed");
                }
                Err(e)
            },
        }
    }
}

async fn apply(
    tx: &mut Transaction<'_, Postgres>,
    generator: &QueryGenerator<'_>,
    schema: Option<&ExpectedSchema>,
    statements: &[Statement],
) -> Result<BatchOutcome, sqlx::Error> {
    let mut outcome = BatchOutcome::default();

    if let Some(schema) = schema {
        if !db::table_exists(&mut **tx, &schema.table_name).await? {
            db::execute(&mut **tx, &generator.create_table(schema)).await?;
            outcome.created = true;
            tracing::info!(table = %schema.table_name, "Created missing aggregate table");
        }
    }

    for statement in statements {
        let rows = db::execute(&mut **tx, statement).await?;
        match statement.kind {
            StatementKind::Delete => outcome.rows_deleted += rows,
            StatementKind::Insert => outcome.rows_inserted += rows,
            _ => {},
        }
    }

    Ok(outcome)
}

fn failure(table: &str, entity: &str, err: &sqlx::Error) -> EntityFailure {
    tracing::warn!(table = %table, entity = %entity, error = %err, "Entity sync failed");
    EntityFailure {
        table: table.to_string(),
        entity: entity.to_string(),
        error: err.to_string(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use sqlx::postgres::PgPoolOptions;
    use std::time::Duration;

    fn unreachable_engine() -> MaterializationEngine {
        let pool = PgPoolOptions::new()
            .acquire_timeout(Duration::from_millis(300))
            .connect_lazy("postgresql://rollup@127.0.0.1:1/rollup")
            .unwrap();
        MaterializationEngine::new(pool, Arc::new(Registry::builtin().unwrap()))
    }

    fn table_report(table: &str, synced: &[&str], failed: &[&str]) -> TableSyncReport {
        TableSyncReport {
            table: table.to_string(),
            synced: synced.iter().map(|s| s.to_string()).collect(),
            failed: failed
                .iter()
                .map(|e| EntityFailure {
                    table: table.to_string(),
                    entity: e.to_string(),
                    error: "division by zero".to_string(),
                })
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_sync_report_merges_tables() {
        let report = SyncReport {
            tables: vec![
                table_report("daily", &["A", "B"], &["C"]),
                table_report("hourly", &["A", "C"], &["B"]),
                table_report("returns", &["A", "B", "C", "D"], &[]),
            ],
        };

        assert_eq!(report.failed_entities(), vec!["B", "C"]);
        assert_eq!(report.synced_entities(), vec!["A", "D"]);
        assert!(!report.is_success());
        assert_eq!(report.failures().count(), 2);
    }

    #[test]
    fn test_empty_report_is_success() {
        let report = SyncReport::default();
        assert!(report.is_success());
        assert!(report.synced_entities().is_empty());
    }

    #[test]
    fn test_batch_run_absorb() {
        let mut run = BatchRun::default();
        let batch = vec!["A".to_string(), "B".to_string()];
        run.absorb(
            &batch,
            BatchOutcome {
                rows_deleted: 3,
                rows_inserted: 4,
                created: true,
            },
        );
        run.absorb(&batch[..1], BatchOutcome::default());

        assert_eq!(run.succeeded, vec!["A", "B", "A"]);
        assert_eq!(run.rows_deleted, 3);
        assert_eq!(run.rows_inserted, 4);
        assert!(run.created);
    }

    #[tokio::test]
    async fn test_store_down_aborts_sync() {
        let engine = unreachable_engine();

        let err = engine.sync_partitions(&["A", "B"]).await.unwrap_err();
        assert!(err.is_connectivity(), "{:?}", err);

        let err = engine.sync_table("daily_store_sales", &["A"]).await.unwrap_err();
        assert!(err.is_connectivity(), "{:?}", err);
    }

    #[tokio::test]
    async fn test_store_down_aborts_delete() {
        let engine = unreachable_engine();

        let err = engine
            .delete_entities("daily_store_sales", &["A"])
            .await
            .unwrap_err();
        assert!(err.is_connectivity(), "{:?}", err);
    }
}
