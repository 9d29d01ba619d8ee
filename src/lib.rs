//! Partition leader failover & migration.
//!
//! Each replica of a partition runs a `PartitionInitiator` which watches leader appointments in
//! the coordination store, repairs the partition's replicas before taking over after a failure,
//! and hands leadership off without a repair when a migration is requested.

pub mod app;
pub mod appointer;
pub mod cache;
pub mod config;
pub mod error;
pub mod execution;
#[cfg(test)]
mod fixtures;
pub mod initiator;
pub mod migration;
pub mod models;
pub mod prom;
pub mod repair;
#[cfg(test)]
mod repair_test;
pub mod site;
pub mod store;
pub mod task_queue;
#[cfg(test)]
mod task_queue_test;
pub mod term;
pub mod transport;
mod utils;

pub use crate::{app::App, config::Config};
