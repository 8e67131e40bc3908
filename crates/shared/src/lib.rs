// Test code patterns:
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Eventgate shared infrastructure
//!
//! Configuration and database plumbing used by the pipeline library and the worker.

pub mod config;
pub mod db;

pub use config::{parse_forward_routes, Config, ConfigError, ForwardRoute};
pub use db::{create_migration_pool, create_pool, run_migrations};
