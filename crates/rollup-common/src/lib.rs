//! Rollup Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared plumbing for the rollup workspace members.
//!
//! - **Logging**: tracing subscriber setup driven by `LOG_*` environment variables
//!
//! # Example
//!
//! ```no_run
//! use rollup_common::logging::{init_logging, LogConfig};
//!
//! fn main() -> anyhow::Result<()> {
//!     let _guard = init_logging(&LogConfig::from_env()?)?;
//!     tracing::info!("rollup started");
//!     Ok(())
//! }
//! ```

pub mod logging;

pub use logging::{init_logging, LogConfig, LogGuard};
