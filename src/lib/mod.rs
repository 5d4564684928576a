#![allow(missing_docs)]
//! # Event Query Latency Probe
//!
//! This crate builds dependency graphs of completion signals spread across
//! one or more signal pools and measures how long a non-blocking status query
//! on a signal takes, as a function of graph shape and pool layout.
//!
//! ## Core Modules
//!
//! - `backend`: The driver capability set, as a trait.
//! - `sim`: An in-process backend whose query cost grows with the dependency
//!   record of the queried signal and with every pool boundary it crosses.
//! - `model`: Handles, commands and the scenario configuration record.
//! - `layout`: The signal arena, its role table and pool layouts.
//! - `graph`: Logical plans for the phased and kernel-trace topologies.
//! - `kernel`: Real or simulated kernel launches.
//! - `harness`: Sessions that realize plans on a backend and tear them down.
//! - `probe`: Timed status queries and latency bands.
//! - `compare`: Unified vs partitioned layout comparison.
//! - `scenario`: The built-in scenarios and their reports.
//! - `watchdog`: Process-level timeout.

pub mod backend;
pub mod compare;
pub mod graph;
pub mod harness;
pub mod kernel;
pub mod layout;
pub mod model;
pub mod probe;
pub mod scenario;
pub mod sim;
pub mod watchdog;

pub use backend::{Backend, BackendError, BackendResult};
pub use compare::{ComparisonHarness, ComparisonReport, Verdict};
pub use graph::{build_phased_dependency_graph, build_trace_replica, DependencyGraph, GraphError};
pub use harness::Session;
pub use layout::{EventId, SignalArena, SignalRole};
pub use model::{PoolLayout, ScenarioConfig, SignalStatus, Topology};
pub use probe::{probe, LatencyBand, Measurement};
pub use scenario::{Scenario, ScenarioReport};
pub use sim::{CostModel, SimulatedBackend};
pub use watchdog::{Watchdog, TIMEOUT_EXIT_CODE};

// Re-export common types
pub use anyhow::{Error, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
