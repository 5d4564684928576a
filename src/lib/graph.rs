//! # Dependency Graph Builder
//!
//! Builds the logical plan a scenario submits: an ordered list of steps
//! (commands, host syncs, timestamp samples) over arena `EventId`s. The plan
//! knows nothing about pools or backend handles; `crate::harness` realizes it
//! under a concrete `PoolLayout`, so both layouts always see the same edges in
//! the same submission order.
//!
//! ## Ordering invariant
//!
//! A command may only wait on an event that an earlier command already
//! signals. Every edge therefore points from a lower submission sequence
//! number to a higher one and the command graph is acyclic by construction.
//! `GraphBuilder::submit` rejects violations; the generators below check
//! before emitting and skip steps that would break the rule, so they never
//! produce one.
//!
//! ## Topologies
//!
//! - **Phased** (`build_phased_dependency_graph`): bounded windows of
//!   timestamp/copy/barrier chains with back-references, stride cross-links,
//!   periodic timing chains and a hub web around the target event.
//! - **Trace replica** (`build_trace_replica`): the 16-signal kernel trace with
//!   two timestamp pairs, gate barriers and six kernel phases feeding a hub.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::layout::EventId;
use crate::model::{LaunchArgs, ScenarioConfig, Topology};

/// Events per phase window.
pub const PHASE_WINDOW: usize = 40;
/// Forward offsets from the window event: timestamp, copy, then barrier chain.
const TIMESTAMP_OFFSET: usize = 5;
const COPY_OFFSET: usize = 6;
const CHAIN_OFFSETS: [usize; 3] = [7, 8, 9];
/// Long back-references added to each window event.
const BACK_REFERENCES: [usize; 2] = [10, 20];
/// Cross-link pass: every `CROSS_STRIDE`th event from `CROSS_START` links
/// forward to `CROSS_FANOUT` events spaced `CROSS_STRIDE` apart.
const CROSS_START: usize = 50;
const CROSS_STRIDE: usize = 10;
const CROSS_FANOUT: usize = 4;
/// Timing pass.
const TIMING_START: usize = 100;
const TIMING_STRIDE: usize = 50;
const TIMING_CHAIN: usize = 5;
/// Half-width of the window around the hub.
pub const HUB_RADIUS: usize = 50;

/// Signals in the kernel-trace topology.
pub const TRACE_EVENTS: usize = 16;
/// Hub of the kernel-trace topology.
pub const TRACE_TARGET: usize = 9;

/// Scratch buffers a plan refers to; realized as backend allocations.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferRole {
    /// Large device buffer cleared by the initial fill
    Device,
    /// Large host buffer
    Host,
    /// Small shared buffer receiving device timestamps
    Shared,
    /// Host-visible destination of timestamp copies
    Readback,
}

/// Kernels a trace plan launches.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KernelRole {
    Reset,
    Main,
}

/// A command in logical terms.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PlanOp {
    /// Fill a whole buffer with a byte
    Fill { buffer: BufferRole, pattern: u8 },
    /// Write the device clock into the first 8 bytes of a buffer
    WriteTimestamp { buffer: BufferRole },
    /// Copy the first 8 bytes of one buffer into another
    CopyTimestamp { src: BufferRole, dst: BufferRole },
    Barrier,
    Launch { kernel: KernelRole, args: LaunchArgs },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlannedCommand {
    pub op: PlanOp,
    pub waits: Vec<EventId>,
    pub completion: Option<EventId>,
}

/// One step of a plan, replayed in order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Step {
    /// Sample host/device clocks (host-side only)
    SampleTimestamps,
    Submit(PlannedCommand),
    /// Block the host until the event is signaled
    HostSync(EventId),
    /// Block the host until the stream is idle
    StreamSync,
}

/// A dependency from a waited event to a command's completion event.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub from: EventId,
    pub to: EventId,
    /// Sequence number of the latest command signaling `from`
    pub producer_seq: usize,
    /// Sequence number of the dependent command
    pub consumer_seq: usize,
}

/// Plans that would break the ordering invariant.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("{event} is outside a graph of {count} events")]
    UnknownEvent { event: EventId, count: usize },
    #[error("command #{seq} waits on {event}, which no earlier command signals")]
    ForwardDependency { event: EventId, seq: usize },
    #[error("command #{seq} waits on its own completion {event}")]
    SelfDependency { event: EventId, seq: usize },
    #[error("host sync on {0}, which no submitted command signals")]
    SyncOnUnproduced(EventId),
}

/// Records a plan while enforcing the ordering invariant.
#[derive(Debug)]
pub struct GraphBuilder {
    event_count: usize,
    steps: Vec<Step>,
    edges: Vec<Edge>,
    /// Latest command sequence number signaling each event
    producer: Vec<Option<usize>>,
    submitted: usize,
    skipped: usize,
}

impl GraphBuilder {
    pub fn new(event_count: usize) -> Self {
        Self {
            event_count,
            steps: Vec::new(),
            edges: Vec::new(),
            producer: vec![None; event_count],
            submitted: 0,
            skipped: 0,
        }
    }

    fn check(&self, event: EventId) -> Result<(), GraphError> {
        if event.0 < self.event_count {
            Ok(())
        } else {
            Err(GraphError::UnknownEvent {
                event,
                count: self.event_count,
            })
        }
    }

    /// Whether some already-submitted command signals `event`.
    pub fn is_produced(&self, event: EventId) -> bool {
        self.producer.get(event.0).copied().flatten().is_some()
    }

    /// Record a command. Returns its submission sequence number.
    pub fn submit(
        &mut self,
        op: PlanOp,
        waits: &[EventId],
        completion: Option<EventId>,
    ) -> Result<usize, GraphError> {
        let seq = self.submitted;

        for event in waits.iter().chain(completion.iter()) {
            self.check(*event)?;
        }
        for waited in waits {
            if Some(*waited) == completion {
                return Err(GraphError::SelfDependency {
                    event: *waited,
                    seq,
                });
            }
            if !self.is_produced(*waited) {
                return Err(GraphError::ForwardDependency {
                    event: *waited,
                    seq,
                });
            }
        }

        if let Some(to) = completion {
            for from in waits {
                if let Some(producer_seq) = self.producer[from.0] {
                    self.edges.push(Edge {
                        from: *from,
                        to,
                        producer_seq,
                        consumer_seq: seq,
                    });
                }
            }
            self.producer[to.0] = Some(seq);
        }

        self.steps.push(Step::Submit(PlannedCommand {
            op,
            waits: waits.to_vec(),
            completion,
        }));
        self.submitted += 1;
        Ok(seq)
    }

    pub fn barrier(&mut self, completion: EventId, waits: &[EventId]) -> Result<usize, GraphError> {
        self.submit(PlanOp::Barrier, waits, Some(completion))
    }

    /// Barrier that is only emitted when every wait is already produced.
    ///
    /// Returns `false` (and records nothing) when it would break ordering.
    pub fn try_barrier(&mut self, completion: EventId, waits: &[EventId]) -> Result<bool, GraphError> {
        self.check(completion)?;
        for event in waits {
            self.check(*event)?;
        }
        if waits.contains(&completion) || !waits.iter().all(|w| self.is_produced(*w)) {
            self.skipped += 1;
            return Ok(false);
        }
        self.barrier(completion, waits)?;
        Ok(true)
    }

    pub fn fill(&mut self, buffer: BufferRole, pattern: u8, completion: EventId) -> Result<usize, GraphError> {
        self.submit(PlanOp::Fill { buffer, pattern }, &[], Some(completion))
    }

    pub fn write_timestamp(
        &mut self,
        buffer: BufferRole,
        completion: EventId,
        waits: &[EventId],
    ) -> Result<usize, GraphError> {
        self.submit(PlanOp::WriteTimestamp { buffer }, waits, Some(completion))
    }

    pub fn copy_timestamp(
        &mut self,
        src: BufferRole,
        dst: BufferRole,
        completion: EventId,
        waits: &[EventId],
    ) -> Result<usize, GraphError> {
        self.submit(PlanOp::CopyTimestamp { src, dst }, waits, Some(completion))
    }

    pub fn launch(
        &mut self,
        kernel: KernelRole,
        args: LaunchArgs,
        completion: EventId,
        waits: &[EventId],
    ) -> Result<usize, GraphError> {
        self.submit(PlanOp::Launch { kernel, args }, waits, Some(completion))
    }

    pub fn sample_timestamps(&mut self) {
        self.steps.push(Step::SampleTimestamps);
    }

    pub fn host_sync(&mut self, event: EventId) -> Result<(), GraphError> {
        self.check(event)?;
        if !self.is_produced(event) {
            return Err(GraphError::SyncOnUnproduced(event));
        }
        self.steps.push(Step::HostSync(event));
        Ok(())
    }

    pub fn stream_sync(&mut self) {
        self.steps.push(Step::StreamSync);
    }

    pub fn finish(self) -> DependencyGraph {
        DependencyGraph {
            event_count: self.event_count,
            steps: self.steps,
            edges: self.edges,
            commands: self.submitted,
            skipped: self.skipped,
        }
    }
}

/// A finished plan.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    event_count: usize,
    steps: Vec<Step>,
    edges: Vec<Edge>,
    commands: usize,
    skipped: usize,
}

impl DependencyGraph {
    pub fn event_count(&self) -> usize {
        self.event_count
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn command_count(&self) -> usize {
        self.commands
    }

    /// Generator steps dropped to keep the ordering invariant.
    pub fn skipped_count(&self) -> usize {
        self.skipped
    }

    pub fn in_degree(&self, event: EventId) -> usize {
        self.edges.iter().filter(|e| e.to == event).count()
    }

    pub fn out_degree(&self, event: EventId) -> usize {
        self.edges.iter().filter(|e| e.from == event).count()
    }

    /// Every edge goes from an earlier command to a later one.
    pub fn is_ordered(&self) -> bool {
        self.edges.iter().all(|e| e.producer_seq < e.consumer_seq)
    }

    /// Events signaled by at least one command.
    pub fn produced_events(&self) -> Vec<EventId> {
        let mut produced = vec![false; self.event_count];
        for step in &self.steps {
            if let Step::Submit(PlannedCommand {
                completion: Some(e),
                ..
            }) = step
            {
                produced[e.0] = true;
            }
        }
        produced
            .iter()
            .enumerate()
            .filter(|(_, p)| **p)
            .map(|(i, _)| EventId(i))
            .collect()
    }
}

/// Build the plan for a scenario record.
pub fn build_graph(config: &ScenarioConfig) -> Result<DependencyGraph, GraphError> {
    match config.topology {
        Topology::Phased => build_phased_dependency_graph(
            config.event_count,
            config.phase_count,
            config.target_event,
        ),
        Topology::TraceReplica => build_trace_replica(),
    }
}

/// Phased topology over `event_count` events with a hub at `target`.
///
/// Chain length grows with `event_count`; fan-in and fan-out stay bounded
/// everywhere except at the hub.
pub fn build_phased_dependency_graph(
    event_count: usize,
    phase_count: usize,
    target: usize,
) -> Result<DependencyGraph, GraphError> {
    let n = event_count;
    let e = EventId;
    let mut b = GraphBuilder::new(n);

    // Clear the device buffer and wait for it like the trace does
    b.fill(BufferRole::Device, 0, e(0))?;
    b.host_sync(e(0))?;
    b.stream_sync();

    for phase in 0..phase_count {
        let start = 1 + phase * PHASE_WINDOW;
        let end = (1 + (phase + 1) * PHASE_WINDOW).min(n.saturating_sub(20));
        debug!("[BUILD:PHASE] Phase {} covers events {}..{}", phase + 1, start, end);

        for i in start..end {
            if i + 10 >= n {
                continue;
            }
            b.sample_timestamps();
            b.write_timestamp(BufferRole::Shared, e(i + TIMESTAMP_OFFSET), &[])?;
            b.copy_timestamp(
                BufferRole::Shared,
                BufferRole::Readback,
                e(i + COPY_OFFSET),
                &[e(i + TIMESTAMP_OFFSET)],
            )?;
            b.barrier(e(i), &[e(i + COPY_OFFSET)])?;

            let mut prev = i + COPY_OFFSET;
            for offset in CHAIN_OFFSETS {
                b.barrier(e(i + offset), &[e(prev)])?;
                prev = i + offset;
            }

            for back in BACK_REFERENCES {
                if i > back {
                    b.try_barrier(e(i), &[e(i - back)])?;
                }
            }
        }
    }

    debug!("[BUILD:CROSS] Adding stride cross-links");
    for i in (CROSS_START..n.saturating_sub(CROSS_START)).step_by(CROSS_STRIDE) {
        for j in 1..=CROSS_FANOUT {
            let to = i + j * CROSS_STRIDE;
            if to < n {
                b.try_barrier(e(to), &[e(i)])?;
            }
        }
    }

    debug!("[BUILD:TIMING] Adding timing chains");
    for i in (TIMING_START..n.saturating_sub(TIMING_START)).step_by(TIMING_STRIDE) {
        b.sample_timestamps();
        b.write_timestamp(BufferRole::Shared, e(i + 10), &[])?;
        b.copy_timestamp(BufferRole::Shared, BufferRole::Readback, e(i + 20), &[e(i + 10)])?;
        for k in 0..TIMING_CHAIN {
            if i + 20 + k < n {
                b.try_barrier(e(i + 20 + k), &[e(i + 19 + k)])?;
            }
        }
    }

    debug!("[BUILD:HUB] Weaving hub around {}", e(target));
    for i in target.saturating_sub(HUB_RADIUS)..target + HUB_RADIUS {
        if i == 0 || i + 1 >= n {
            continue;
        }
        if i != target {
            b.try_barrier(e(target), &[e(i)])?;
        }
        b.try_barrier(e(i + 1), &[e(i)])?;
    }

    b.stream_sync();
    Ok(b.finish())
}

/// The 16-signal kernel trace.
///
/// Arena roles (see `crate::layout::RoleTable` for 16 events, target 9):
/// base 0..4, timing 4..6, secondary-timing 6..9, hub 9, kernel-phase 10..16.
pub fn build_trace_replica() -> Result<DependencyGraph, GraphError> {
    let e = EventId;
    let mut b = GraphBuilder::new(TRACE_EVENTS);

    b.fill(BufferRole::Device, 0, e(0))?;
    b.host_sync(e(0))?;
    b.stream_sync();

    // First timestamp pair, then the gate barriers
    b.sample_timestamps();
    b.write_timestamp(BufferRole::Shared, e(4), &[])?;
    b.copy_timestamp(BufferRole::Shared, BufferRole::Readback, e(5), &[e(4)])?;
    b.barrier(e(1), &[e(5)])?;
    b.barrier(e(6), &[e(5)])?;

    b.launch(KernelRole::Reset, LaunchArgs::single(), e(10), &[e(6)])?;
    b.host_sync(e(10))?;
    b.stream_sync();

    let main = LaunchArgs::linear(384, 256);
    b.launch(KernelRole::Main, main, e(11), &[e(6)])?;
    b.launch(KernelRole::Main, main, e(12), &[e(11)])?;
    b.launch(KernelRole::Main, main, e(13), &[e(12)])?;
    b.launch(KernelRole::Reset, LaunchArgs::single(), e(14), &[e(11), e(10)])?;
    b.launch(KernelRole::Main, main, e(15), &[e(13), e(14)])?;

    // Second timestamp pair after the main kernel
    b.sample_timestamps();
    b.write_timestamp(BufferRole::Shared, e(7), &[e(11)])?;
    b.copy_timestamp(BufferRole::Shared, BufferRole::Readback, e(8), &[e(7)])?;

    let hub_waits: Vec<EventId> = (10..TRACE_EVENTS).map(e).chain([e(8)]).collect();
    b.barrier(e(TRACE_TARGET), &hub_waits)?;

    b.barrier(e(3), &[e(TRACE_TARGET)])?;
    b.barrier(e(2), &[e(TRACE_TARGET), e(1)])?;

    b.stream_sync();
    Ok(b.finish())
}
