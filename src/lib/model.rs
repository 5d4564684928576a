//! # Backend Handles, Commands and Scenario Records
//!
//! This module defines the core data structures shared by the backend adapter,
//! the graph builder and the scenario runners.
//!
//! - Handles (`SignalId`, `PoolId`, ...): opaque, copyable identifiers handed
//!   out by a `Backend`. They carry no ownership; the backend enforces the
//!   ownership tree.
//! - `Command`: the unit of work submitted to a command stream, with an
//!   optional wait-list and an optional completion signal.
//! - `LaunchArgs` / `TimestampPair`: `#[repr(C)]` POD payloads that are written
//!   into backend memory byte-for-byte.
//! - `ScenarioConfig`: the configuration record driving one graph build.

use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

macro_rules! handle {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "#{}"), self.0)
            }
        }
    };
}

handle!(
    /// A device exposed by the backend.
    DeviceId,
    "device"
);
handle!(
    /// Root of the ownership tree.
    ContextId,
    "context"
);
handle!(
    /// A memory allocation owned by a context.
    MemHandle,
    "mem"
);
handle!(
    /// An in-order, immediate command stream.
    StreamId,
    "stream"
);
handle!(
    /// A fixed-capacity signal pool.
    PoolId,
    "pool"
);
handle!(
    /// A completion signal living in one pool slot.
    SignalId,
    "signal"
);
handle!(
    /// A compiled IL module.
    ModuleId,
    "module"
);
handle!(
    /// A kernel created from a module.
    KernelId,
    "kernel"
);

/// Observable state of a signal.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalStatus {
    Unsignaled,
    Signaled,
}

impl SignalStatus {
    pub fn is_signaled(self) -> bool {
        self == SignalStatus::Signaled
    }
}

impl fmt::Display for SignalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalStatus::Signaled => write!(f, "SIGNALED"),
            SignalStatus::Unsignaled => write!(f, "NOT_READY"),
        }
    }
}

/// Where a memory allocation lives.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryKind {
    Device,
    Host,
    Shared,
}

/// A byte range inside a memory allocation.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MemRegion {
    pub mem: MemHandle,
    pub offset: usize,
    pub len: usize,
}

impl MemRegion {
    pub fn new(mem: MemHandle, offset: usize, len: usize) -> Self {
        Self { mem, offset, len }
    }

    /// The first `len` bytes of an allocation.
    pub fn head(mem: MemHandle, len: usize) -> Self {
        Self::new(mem, 0, len)
    }
}

/// Work-group geometry for a kernel launch.
///
/// Written as-is into the launch record, so it is `#[repr(C)]` and `Pod`.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Pod, Zeroable, Serialize, Deserialize)]
pub struct LaunchArgs {
    /// Number of work-groups in x, y, z
    pub group_count: [u32; 3],
    /// Work-items per group in x, y, z
    pub group_size: [u32; 3],
}

impl LaunchArgs {
    /// A single 1x1x1 group.
    pub fn single() -> Self {
        Self {
            group_count: [1, 1, 1],
            group_size: [1, 1, 1],
        }
    }

    /// One-dimensional launch.
    pub fn linear(groups: u32, group_size: u32) -> Self {
        Self {
            group_count: [groups, 1, 1],
            group_size: [group_size, 1, 1],
        }
    }

    /// Total work-items across all groups.
    pub fn total_items(&self) -> u64 {
        let groups: u64 = self.group_count.iter().map(|&g| g as u64).product();
        let size: u64 = self.group_size.iter().map(|&s| s as u64).product();
        groups * size
    }
}

/// Host and device clocks sampled at the same instant (nanoseconds).
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Pod, Zeroable, Serialize, Deserialize)]
pub struct TimestampPair {
    pub host: u64,
    pub device: u64,
}

/// The five command types a stream accepts.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    Fill,
    Copy,
    WriteTimestamp,
    Barrier,
    Launch,
}

/// The operation a command performs, with its parameters.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CommandOp {
    /// Fill `dst` with a repeated byte
    Fill { dst: MemRegion, pattern: u8 },
    /// Copy `src` into `dst`; lengths must match
    Copy { src: MemRegion, dst: MemRegion },
    /// Write the device clock (8 bytes) at `dst`
    WriteTimestamp { dst: MemRegion },
    /// Wait, then signal; no other effect
    Barrier,
    /// Launch a kernel with the given geometry
    Launch { kernel: KernelId, args: LaunchArgs },
}

impl CommandOp {
    pub fn kind(&self) -> CommandKind {
        match self {
            CommandOp::Fill { .. } => CommandKind::Fill,
            CommandOp::Copy { .. } => CommandKind::Copy,
            CommandOp::WriteTimestamp { .. } => CommandKind::WriteTimestamp,
            CommandOp::Barrier => CommandKind::Barrier,
            CommandOp::Launch { .. } => CommandKind::Launch,
        }
    }
}

/// A command as submitted to a stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Command {
    pub op: CommandOp,
    /// Signals that must be signaled before the command executes
    pub wait_list: Vec<SignalId>,
    /// Signal set when the command finishes
    pub completion: Option<SignalId>,
}

impl Command {
    pub fn new(op: CommandOp) -> Self {
        Self {
            op,
            wait_list: Vec::new(),
            completion: None,
        }
    }

    /// Barrier shorthand: wait on `wait_list`, then signal `completion`.
    pub fn barrier(completion: SignalId, wait_list: &[SignalId]) -> Self {
        Self::new(CommandOp::Barrier)
            .signal(completion)
            .wait_on(wait_list)
    }

    /// Set the completion signal
    pub fn signal(mut self, completion: SignalId) -> Self {
        self.completion = Some(completion);
        self
    }

    /// Append to the wait-list
    pub fn wait_on(mut self, signals: &[SignalId]) -> Self {
        self.wait_list.extend_from_slice(signals);
        self
    }

    pub fn kind(&self) -> CommandKind {
        self.op.kind()
    }
}

/// Shape of the logical dependency graph a scenario builds.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topology {
    /// Phased windows, stride cross-links, timing chains and a hub web
    Phased,
    /// The 16-signal kernel trace (timestamps, barriers, kernel phases)
    TraceReplica,
}

/// How signals are distributed over pools.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolLayout {
    /// Every signal drawn from one pool
    Unified,
    /// One pool per logical role
    Partitioned,
}

impl fmt::Display for PoolLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolLayout::Unified => write!(f, "unified"),
            PoolLayout::Partitioned => write!(f, "partitioned"),
        }
    }
}

/// Rejected scenario parameters.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("event count {0} is too small (need at least {min})", min = ScenarioConfig::MIN_EVENTS)]
    TooFewEvents(usize),
    #[error("event count {0} does not fit a 32-bit slot index")]
    TooManyEvents(usize),
    #[error("target event {target} is outside 1..{max}")]
    TargetOutOfRange { target: usize, max: usize },
    #[error("role table for {events} events around target {target} leaves role '{role}' empty")]
    EmptyRole {
        events: usize,
        target: usize,
        role: &'static str,
    },
    #[error("repetitions must be non-zero")]
    NoRepetitions,
    #[error("unified pool capacity {capacity} cannot hold {events} events")]
    PoolTooSmall { capacity: u32, events: usize },
}

/// The configuration record for one graph build and probe run.
///
/// Every scenario is one of these with fixed values; nothing here is read
/// from the command line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioConfig {
    /// Total signals in the arena
    pub event_count: usize,
    /// Number of phase windows (phased topology only)
    pub phase_count: usize,
    /// Pool layout strategy
    pub layout: PoolLayout,
    /// Logical index of the probed (hub) event
    pub target_event: usize,
    /// Queries per probed event
    pub repetitions: usize,
    /// Graph shape
    pub topology: Topology,
    /// Also probe target-1 and target+1
    pub probe_neighbors: bool,
    /// Capacity of the single pool under the unified layout
    pub unified_pool_capacity: u32,
    /// Size of the device/host scratch buffers
    pub buffer_bytes: usize,
}

impl ScenarioConfig {
    /// Smallest arena the role table can partition.
    pub const MIN_EVENTS: usize = 8;

    /// Create a phased-topology config with unified layout
    pub fn new(event_count: usize, phase_count: usize, target_event: usize) -> Self {
        Self {
            event_count,
            phase_count,
            layout: PoolLayout::Unified,
            target_event,
            repetitions: 3,
            topology: Topology::Phased,
            probe_neighbors: false,
            unified_pool_capacity: u32::try_from(event_count).unwrap_or(u32::MAX),
            buffer_bytes: 4096,
        }
    }

    /// Set the pool layout
    pub fn with_layout(mut self, layout: PoolLayout) -> Self {
        self.layout = layout;
        self
    }

    /// Set the topology
    pub fn with_topology(mut self, topology: Topology) -> Self {
        self.topology = topology;
        self
    }

    /// Set queries per probed event
    pub fn with_repetitions(mut self, repetitions: usize) -> Self {
        self.repetitions = repetitions;
        self
    }

    /// Probe the target's neighbours as well
    pub fn with_neighbors(mut self) -> Self {
        self.probe_neighbors = true;
        self
    }

    /// Oversize the unified pool
    pub fn with_unified_capacity(mut self, capacity: u32) -> Self {
        self.unified_pool_capacity = capacity;
        self
    }

    /// Set scratch buffer size
    pub fn with_buffer_bytes(mut self, bytes: usize) -> Self {
        self.buffer_bytes = bytes;
        self
    }

    /// Events to probe, in probe order.
    pub fn probe_targets(&self) -> Vec<usize> {
        if self.probe_neighbors {
            vec![self.target_event, self.target_event - 1, self.target_event + 1]
        } else {
            vec![self.target_event]
        }
    }

    /// Check the record before any backend work happens.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.event_count < Self::MIN_EVENTS {
            return Err(ConfigError::TooFewEvents(self.event_count));
        }
        if u32::try_from(self.event_count).is_err() {
            return Err(ConfigError::TooManyEvents(self.event_count));
        }
        if self.target_event == 0 || self.target_event + 1 >= self.event_count {
            return Err(ConfigError::TargetOutOfRange {
                target: self.target_event,
                max: self.event_count - 1,
            });
        }
        if self.repetitions == 0 {
            return Err(ConfigError::NoRepetitions);
        }
        if (self.unified_pool_capacity as usize) < self.event_count {
            return Err(ConfigError::PoolTooSmall {
                capacity: self.unified_pool_capacity,
                events: self.event_count,
            });
        }
        crate::layout::RoleTable::new(self.event_count, self.target_event).map(|_| ())
    }
}
