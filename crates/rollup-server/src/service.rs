//! Aggregate service: owns the engine components and the sync gate
//!
//! Built once per process and shared behind an `Arc`. Every operation that
//! writes aggregate rows goes through the [`SyncGate`], so at most one sync
//! or repair cycle runs at a time. Read-only operations (schema validation,
//! consistency checks) do not take the gate.

use serde::Serialize;
use sqlx::postgres::PgPool;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use uuid::Uuid;

use crate::config::AggregateSettings;
use crate::consistency::{ConsistencyChecker, ConsistencyReport};
use crate::error::{AggregateError, AggregateResult};
use crate::materialize::{EntityFailure, MaterializationEngine, SyncReport, TableCleanup, TableSyncReport};
use crate::registry::Registry;
use crate::schema::{SchemaReport, SchemaValidator};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    #[default]
    Idle,
    Checking,
    Repairing,
}

/// In-process mutual exclusion for sync and repair cycles
#[derive(Debug, Clone, Default)]
pub struct SyncGate {
    state: Arc<Mutex<SyncState>>,
}

impl SyncGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> SyncState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Move from `Idle` to `state`, or `None` if a cycle is already running
    pub fn try_acquire(&self, state: SyncState) -> Option<SyncPermit> {
        let mut current = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *current != SyncState::Idle {
            return None;
        }
        *current = state;
        Some(SyncPermit {
            state: Arc::clone(&self.state),
        })
    }
}

/// Held for the duration of a cycle; dropping it returns the gate to `Idle`
#[derive(Debug)]
pub struct SyncPermit {
    state: Arc<Mutex<SyncState>>,
}

impl SyncPermit {
    pub fn advance(&self, next: SyncState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = next;
    }
}

impl Drop for SyncPermit {
    fn drop(&mut self) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = SyncState::Idle;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairStatus {
    Consistent,
    Repaired,
    AlreadySyncing,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RepairSummary {
    pub synced_entities: Vec<String>,
    pub failed_entities: Vec<EntityFailure>,
    pub removed_orphans: Vec<TableCleanup>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RepairOutcome {
    pub cycle_id: Uuid,
    pub status: RepairStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub check: Option<ConsistencyReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repair: Option<RepairSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StartupReport {
    pub schema: SchemaReport,
    pub repair: RepairOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestSyncReport {
    pub sync: SyncReport,
    pub repair: RepairOutcome,
}

pub struct AggregateService {
    registry: Arc<Registry>,
    settings: AggregateSettings,
    engine: MaterializationEngine,
    validator: SchemaValidator,
    checker: ConsistencyChecker,
    gate: SyncGate,
}

impl AggregateService {
    pub fn new(pool: PgPool, registry: Arc<Registry>, settings: AggregateSettings) -> Self {
        let engine = MaterializationEngine::new(pool.clone(), Arc::clone(&registry))
            .with_batch_size(settings.batch_size);
        let validator = SchemaValidator::new(
            pool.clone(),
            Arc::clone(&registry),
            settings.skip_auto_increment_columns,
        );
        let checker = ConsistencyChecker::new(pool, Arc::clone(&registry))
            .with_tolerance(settings.mismatch_tolerance);

        Self {
            registry,
            settings,
            engine,
            validator,
            checker,
            gate: SyncGate::new(),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn settings(&self) -> &AggregateSettings {
        &self.settings
    }

    pub fn gate(&self) -> &SyncGate {
        &self.gate
    }

    pub async fn validate_schema(&self) -> AggregateResult<SchemaReport> {
        self.validator.validate_and_fix().await
    }

    pub async fn check_consistency(&self) -> AggregateResult<ConsistencyReport> {
        self.checker.check_consistency().await
    }

    /// Rebuild every table for `entities`. Fails with
    /// [`AggregateError::SyncInProgress`] while another cycle runs.
    pub async fn sync_partitions<S: AsRef<str> + Sync>(&self, entities: &[S]) -> AggregateResult<SyncReport> {
        let _permit = self
            .gate
            .try_acquire(SyncState::Repairing)
            .ok_or(AggregateError::SyncInProgress)?;
        self.engine.sync_partitions(entities).await
    }

    pub async fn sync_table<S: AsRef<str> + Sync>(
        &self,
        table: &str,
        entities: &[S],
    ) -> AggregateResult<TableSyncReport> {
        let _permit = self
            .gate
            .try_acquire(SyncState::Repairing)
            .ok_or(AggregateError::SyncInProgress)?;
        self.engine.sync_table(table, entities).await
    }

    /// Check every table and repair whatever drifted
    pub async fn check_and_repair(&self) -> AggregateResult<RepairOutcome> {
        self.repair_cycle(Uuid::new_v4()).await
    }

    #[tracing::instrument(skip(self))]
    async fn repair_cycle(&self, cycle_id: Uuid) -> AggregateResult<RepairOutcome> {
        let Some(permit) = self.gate.try_acquire(SyncState::Checking) else {
            tracing::info!("Sync already in progress, skipping repair cycle");
            return Ok(RepairOutcome {
                cycle_id,
                status: RepairStatus::AlreadySyncing,
                check: None,
                repair: None,
            });
        };

        let check = self.checker.check_consistency().await?;
        if check.consistent {
            return Ok(RepairOutcome {
                cycle_id,
                status: RepairStatus::Consistent,
                check: Some(check),
                repair: None,
            });
        }

        permit.advance(SyncState::Repairing);

        let sync = self.engine.sync_partitions(&check.entities_to_sync()).await?;
        let mut summary = RepairSummary {
            synced_entities: sync.synced_entities(),
            failed_entities: sync.failures().cloned().collect(),
            removed_orphans: Vec::new(),
        };

        for (table, orphans) in check.orphans_by_table() {
            let cleanup = self.engine.delete_entities(table, orphans).await?;
            summary.failed_entities.extend(cleanup.failed.iter().cloned());
            summary.removed_orphans.push(cleanup);
        }

        tracing::info!(
            synced = summary.synced_entities.len(),
            failed = summary.failed_entities.len(),
            orphan_tables = summary.removed_orphans.len(),
            "Repair cycle finished"
        );

        Ok(RepairOutcome {
            cycle_id,
            status: RepairStatus::Repaired,
            check: Some(check),
            repair: Some(summary),
        })
    }

    /// Process start: fix schema drift, then one check-and-repair pass
    pub async fn startup(&self) -> AggregateResult<StartupReport> {
        let schema = self.validate_schema().await?;
        if !schema.success {
            tracing::warn!("Schema validation reported failures, continuing with repair");
        }
        let repair = self.check_and_repair().await?;
        Ok(StartupReport { schema, repair })
    }

    /// After an ingestion batch: rebuild exactly the touched entities, then
    /// run a check-and-repair pass as a safety net.
    #[tracing::instrument(skip(self, entities), fields(entity_count = entities.len()))]
    pub async fn after_ingest<S: AsRef<str> + Sync>(&self, entities: &[S]) -> AggregateResult<IngestSyncReport> {
        let sync = self.sync_partitions(entities).await?;
        let repair = self.check_and_repair().await?;
        Ok(IngestSyncReport { sync, repair })
    }

    /// Run check-and-repair every `period`, starting one period from now.
    /// The task runs until aborted.
    pub fn spawn_periodic(self: Arc<Self>, period: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!(period_secs = period.as_secs(), "Periodic repair started");

            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                match self.check_and_repair().await {
                    Ok(outcome) => tracing::info!(
                        cycle_id = %outcome.cycle_id,
                        status = ?outcome.status,
                        "Periodic repair cycle completed"
                    ),
                    Err(e) => tracing::error!(error = %e, "Periodic repair cycle failed"),
                }
            }
        })
    }
}
