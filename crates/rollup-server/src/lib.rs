//! Rollup Server Library
//!
//! Configuration-driven materialized aggregates over a transactional source
//! table in PostgreSQL.
//!
//! # Overview
//!
//! - **Registry**: declarative [`registry::TableConfig`] per aggregate table,
//!   with its expected physical schema
//! - **Query generation**: DELETE / INSERT ... SELECT / UPDATE statements with
//!   entity identifiers bound as `$n` parameters
//! - **Materialization**: transactional replace of an entity's aggregate rows,
//!   with per-entity fallback when a batch fails
//! - **Schema validation**: adds columns missing from live aggregate tables
//! - **Consistency checking**: finds missing, orphan and mismatched entities
//!   and repairs them
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use rollup_server::{config::Config, db, registry::Registry, service::AggregateService};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load()?;
//!     let pool = db::create_pool(&config.database).await?;
//!     let registry = Arc::new(Registry::builtin()?);
//!     let service = AggregateService::new(pool, registry, config.aggregates);
//!     let report = service.startup().await?;
//!     println!("{}", serde_json::to_string_pretty(&report)?);
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod config;
pub mod consistency;
pub mod db;
pub mod error;
pub mod materialize;
pub mod query;
pub mod registry;
pub mod schema;
pub mod service;

pub use error::{AggregateError, AggregateResult, ConfigError};
pub use service::{AggregateService, RepairOutcome, RepairStatus};
