//! # Session
//!
//! Owns the backend objects of one scenario run and realizes logical plans on
//! them.
//!
//! ```text
//! open:   context -> buffers -> stream -> kernel path
//! build:  arena (first build only) -> replay plan steps
//! replay: reset every signal -> replay plan steps
//! close:  sync -> signals -> pools -> kernels/module -> stream -> memory -> context
//! ```
//!
//! Every backend failure is wrapped with the name of the failing call and
//! ends the run. Objects created before a failure are not cleaned up.

use anyhow::{anyhow, Context, Result};
use std::time::Duration;
use tracing::{debug, info};

use crate::backend::{Backend, BackendError};
use crate::graph::{BufferRole, DependencyGraph, PlanOp, PlannedCommand, Step};
use crate::kernel::KernelPath;
use crate::layout::{plan_pools, EventId, RoleTable, SignalArena};
use crate::model::{
    Command, CommandOp, ContextId, DeviceId, MemHandle, MemRegion, MemoryKind, ScenarioConfig,
    SignalId, SignalStatus, StreamId, TimestampPair, Topology,
};

/// Timeout handed to every synchronize call.
pub const WAIT_FOREVER: Duration = Duration::MAX;
/// Shared timestamp buffer size and alignment.
const SHARED_BYTES: usize = 32;
const TIMESTAMP_ALIGN: usize = 8;
/// Bytes written by one timestamp.
const TIMESTAMP_BYTES: usize = 8;

/// Scratch allocations referenced by plan buffer roles.
#[derive(Debug, Clone, Copy)]
struct Buffers {
    device: MemHandle,
    host: MemHandle,
    shared: MemHandle,
    readback: MemHandle,
    bytes: usize,
}

impl Buffers {
    fn allocate<B: Backend>(backend: &mut B, context: ContextId, bytes: usize) -> Result<Self> {
        let device = backend
            .allocate_memory(context, MemoryKind::Device, bytes, 0)
            .with_context(|| format!("allocate_memory(device, {} bytes)", bytes))?;
        let host = backend
            .allocate_memory(context, MemoryKind::Host, bytes, 0)
            .with_context(|| format!("allocate_memory(host, {} bytes)", bytes))?;
        let shared = backend
            .allocate_memory(context, MemoryKind::Shared, SHARED_BYTES, TIMESTAMP_ALIGN)
            .context("allocate_memory(shared timestamps)")?;
        let readback = backend
            .allocate_memory(context, MemoryKind::Host, TIMESTAMP_BYTES, TIMESTAMP_ALIGN)
            .context("allocate_memory(timestamp readback)")?;

        Ok(Self {
            device,
            host,
            shared,
            readback,
            bytes,
        })
    }

    fn get(&self, role: BufferRole) -> MemHandle {
        match role {
            BufferRole::Device => self.device,
            BufferRole::Host => self.host,
            BufferRole::Shared => self.shared,
            BufferRole::Readback => self.readback,
        }
    }

    fn size(&self, role: BufferRole) -> usize {
        match role {
            BufferRole::Device | BufferRole::Host => self.bytes,
            BufferRole::Shared => SHARED_BYTES,
            BufferRole::Readback => TIMESTAMP_BYTES,
        }
    }

    fn whole(&self, role: BufferRole) -> MemRegion {
        MemRegion::head(self.get(role), self.size(role))
    }

    fn timestamp(&self, role: BufferRole) -> MemRegion {
        MemRegion::head(self.get(role), TIMESTAMP_BYTES)
    }

    /// Release in reverse allocation order.
    fn free<B: Backend>(self, backend: &mut B, context: ContextId) -> Result<()> {
        for mem in [self.readback, self.shared, self.host, self.device] {
            backend
                .free_memory(context, mem)
                .with_context(|| format!("free_memory({})", mem))?;
        }
        Ok(())
    }
}

/// Counters from one realization of a plan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildStats {
    pub commands: usize,
    pub launches: usize,
    pub host_syncs: usize,
}

/// Backend objects for one scenario run.
pub struct Session<'a, B: Backend> {
    backend: &'a mut B,
    config: ScenarioConfig,
    device: DeviceId,
    context: ContextId,
    stream: StreamId,
    buffers: Buffers,
    kernels: KernelPath,
    arena: Option<SignalArena>,
    timestamps: Vec<TimestampPair>,
}

impl<'a, B: Backend> Session<'a, B> {
    /// Create the context, buffers, stream and kernel path for `config`.
    ///
    /// Kernels are only loaded for the trace topology; `il` is the module
    /// source, if one could be read.
    pub fn open(backend: &'a mut B, config: &ScenarioConfig, il: Option<&[u8]>) -> Result<Self> {
        config.validate()?;

        let device = backend
            .enumerate_devices()
            .context("enumerate_devices")?
            .first()
            .copied()
            .ok_or(BackendError::NoDevice)
            .context("enumerate_devices")?;
        let context = backend
            .create_context(device)
            .with_context(|| format!("create_context({})", device))?;
        let buffers = Buffers::allocate(backend, context, config.buffer_bytes)?;
        let stream = backend
            .create_command_stream(context, device)
            .context("create_command_stream")?;

        let kernels = match config.topology {
            Topology::TraceReplica => KernelPath::select(backend, context, device, il)?,
            Topology::Phased => KernelPath::Simulated {
                reason: "topology launches no kernels".into(),
            },
        };

        info!(
            "[SESSION:OPEN] {} on {} ({} layout, {} kernels)",
            context,
            device,
            config.layout,
            kernels.name()
        );

        Ok(Self {
            backend,
            config: config.clone(),
            device,
            context,
            stream,
            buffers,
            kernels,
            arena: None,
            timestamps: Vec::new(),
        })
    }

    pub fn backend(&self) -> &B {
        &*self.backend
    }

    pub fn config(&self) -> &ScenarioConfig {
        &self.config
    }

    pub fn stream(&self) -> StreamId {
        self.stream
    }

    pub fn kernel_path(&self) -> &KernelPath {
        &self.kernels
    }

    /// Host/device clock pairs sampled while replaying plans.
    pub fn timestamps(&self) -> &[TimestampPair] {
        &self.timestamps
    }

    /// Create the arena (first call only) and submit `graph`.
    pub fn build(&mut self, graph: &DependencyGraph) -> Result<BuildStats> {
        if graph.event_count() != self.config.event_count {
            return Err(anyhow!(
                "plan covers {} events but the session was opened for {}",
                graph.event_count(),
                self.config.event_count
            ));
        }

        if self.arena.is_none() {
            let roles = RoleTable::new(self.config.event_count, self.config.target_event)?;
            let arena = SignalArena::create(
                &mut *self.backend,
                self.context,
                self.config.layout,
                roles,
                self.config.unified_pool_capacity,
            )?;
            self.arena = Some(arena);
        }

        self.submit_plan(graph)
    }

    /// Reset every signal, then submit `graph` again.
    pub fn replay(&mut self, graph: &DependencyGraph) -> Result<BuildStats> {
        let arena = self
            .arena
            .as_ref()
            .ok_or_else(|| anyhow!("replay before the first build"))?;
        self.backend
            .synchronize_stream(self.stream, WAIT_FOREVER)
            .context("synchronize_stream before reset")?;
        arena.reset_all(&mut *self.backend)?;
        debug!("[SESSION:REPLAY] Reset {} signals", arena.len());
        self.submit_plan(graph)
    }

    fn arena(&self) -> Result<&SignalArena> {
        self.arena.as_ref().ok_or_else(|| anyhow!("no plan has been built"))
    }

    /// Backend signal behind a logical event.
    pub fn signal(&self, event: EventId) -> Result<SignalId> {
        self.arena()?.signal(event)
    }

    /// Pool capacities in creation order.
    pub fn pool_capacities(&self) -> Result<Vec<u32>> {
        let arena = self.arena()?;
        Ok(plan_pools(
            arena.layout(),
            arena.roles(),
            self.config.unified_pool_capacity,
        )
        .iter()
        .map(|p| p.capacity)
        .collect())
    }

    /// Current status of every event, in arena order.
    pub fn statuses(&self) -> Result<Vec<SignalStatus>> {
        let arena = self.arena()?;
        (0..arena.len())
            .map(|i| {
                let signal = arena.signal(EventId(i))?;
                self.backend
                    .query_status(signal)
                    .with_context(|| format!("query_status({})", signal))
            })
            .collect()
    }

    fn lower(&self, arena: &SignalArena, cmd: &PlannedCommand) -> Result<Command> {
        let op = match cmd.op {
            PlanOp::Fill { buffer, pattern } => CommandOp::Fill {
                dst: self.buffers.whole(buffer),
                pattern,
            },
            PlanOp::WriteTimestamp { buffer } => CommandOp::WriteTimestamp {
                dst: self.buffers.timestamp(buffer),
            },
            PlanOp::CopyTimestamp { src, dst } => CommandOp::Copy {
                src: self.buffers.timestamp(src),
                dst: self.buffers.timestamp(dst),
            },
            PlanOp::Barrier => CommandOp::Barrier,
            PlanOp::Launch { kernel, args } => self.kernels.lower(kernel, args),
        };

        let waits = cmd
            .waits
            .iter()
            .map(|e| arena.signal(*e))
            .collect::<Result<Vec<_>>>()?;
        let mut command = Command::new(op).wait_on(&waits);
        if let Some(event) = cmd.completion {
            command = command.signal(arena.signal(event)?);
        }
        Ok(command)
    }

    fn submit_plan(&mut self, graph: &DependencyGraph) -> Result<BuildStats> {
        let arena = self.arena.take().ok_or_else(|| anyhow!("no arena"))?;
        let result = self.submit_steps(&arena, graph);
        self.arena = Some(arena);
        let stats = result?;

        info!(
            "[SESSION:BUILD] Submitted {} commands ({} launches, {} host syncs)",
            stats.commands, stats.launches, stats.host_syncs
        );
        Ok(stats)
    }

    fn submit_steps(&mut self, arena: &SignalArena, graph: &DependencyGraph) -> Result<BuildStats> {
        let mut stats = BuildStats::default();

        for step in graph.steps() {
            match step {
                Step::SampleTimestamps => {
                    let pair = self
                        .backend
                        .global_timestamps(self.device)
                        .context("global_timestamps")?;
                    self.timestamps.push(pair);
                }
                Step::Submit(planned) => {
                    let command = self.lower(arena, planned)?;
                    if matches!(command.op, CommandOp::Launch { .. }) {
                        stats.launches += 1;
                    }
                    self.backend
                        .submit_command(self.stream, &command)
                        .with_context(|| {
                            format!("submit_command({:?} #{})", command.kind(), stats.commands)
                        })?;
                    stats.commands += 1;
                }
                Step::HostSync(event) => {
                    let signal = arena.signal(*event)?;
                    self.backend
                        .synchronize_signal(signal, WAIT_FOREVER)
                        .with_context(|| format!("synchronize_signal({})", event))?;
                    stats.host_syncs += 1;
                }
                Step::StreamSync => {
                    self.backend
                        .synchronize_stream(self.stream, WAIT_FOREVER)
                        .context("synchronize_stream")?;
                }
            }
        }

        Ok(stats)
    }

    /// Synchronize, then destroy everything in reverse creation order.
    pub fn close(self) -> Result<()> {
        let Session {
            backend,
            context,
            stream,
            buffers,
            kernels,
            arena,
            ..
        } = self;

        backend
            .synchronize_stream(stream, WAIT_FOREVER)
            .context("synchronize_stream before teardown")?;
        if let Some(arena) = arena {
            arena.destroy(backend)?;
        }
        kernels.destroy(backend)?;
        backend
            .destroy_stream(stream)
            .with_context(|| format!("destroy_stream({})", stream))?;
        buffers.free(backend, context)?;
        backend
            .destroy_context(context)
            .with_context(|| format!("destroy_context({})", context))?;

        debug!("[SESSION:CLOSE] Released {}", context);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendResult;
    use crate::graph::{build_graph, build_trace_replica, TRACE_TARGET};
    use crate::kernel::{MAIN_KERNEL, RESET_KERNEL};
    use crate::model::{KernelId, ModuleId, PoolId, PoolLayout};
    use crate::sim::{spirv_module, CostModel, SimulatedBackend};

    fn trace_config(layout: PoolLayout) -> ScenarioConfig {
        ScenarioConfig::new(16, 0, TRACE_TARGET)
            .with_topology(Topology::TraceReplica)
            .with_layout(layout)
    }

    #[test]
    fn test_trace_build_signals_everything() {
        let mut backend = SimulatedBackend::default().with_cost_model(CostModel::free());
        let graph = build_trace_replica().unwrap();

        let mut session = Session::open(&mut backend, &trace_config(PoolLayout::Partitioned), None).unwrap();
        let stats = session.build(&graph).unwrap();
        assert_eq!(stats.commands, graph.command_count());
        assert_eq!(stats.launches, 0);
        assert_eq!(stats.host_syncs, 2);
        assert_eq!(session.pool_capacities().unwrap(), vec![4, 2, 3, 6, 1]);
        assert_eq!(session.timestamps().len(), 2);
        assert!(session.statuses().unwrap().iter().all(|s| s.is_signaled()));
        session.close().unwrap();

        assert_eq!(backend.live_objects(), 0);
    }

    #[test]
    fn test_real_kernels_are_launched() {
        let mut backend = SimulatedBackend::default().with_cost_model(CostModel::free());
        let il = spirv_module(&[RESET_KERNEL, MAIN_KERNEL]);
        let graph = build_trace_replica().unwrap();

        let mut session =
            Session::open(&mut backend, &trace_config(PoolLayout::Unified), Some(il.as_slice())).unwrap();
        assert!(session.kernel_path().is_real());
        let stats = session.build(&graph).unwrap();
        assert_eq!(stats.launches, 6);
        session.close().unwrap();
        assert_eq!(backend.live_objects(), 0);
    }

    #[test]
    fn test_replay_reproduces_final_state() {
        let mut backend = SimulatedBackend::default().with_cost_model(CostModel::free());
        let config = ScenarioConfig::new(120, 3, 60);
        let graph = build_graph(&config).unwrap();

        let mut session = Session::open(&mut backend, &config, None).unwrap();
        session.build(&graph).unwrap();
        let first = session.statuses().unwrap();
        session.replay(&graph).unwrap();
        let second = session.statuses().unwrap();
        assert_eq!(first, second);
        assert!(first.iter().any(|s| s.is_signaled()));
        session.close().unwrap();
    }

    #[test]
    fn test_layouts_produce_same_states() {
        let graph = build_trace_replica().unwrap();
        let mut states = Vec::new();
        for layout in [PoolLayout::Unified, PoolLayout::Partitioned] {
            let mut backend = SimulatedBackend::default().with_cost_model(CostModel::free());
            let mut session = Session::open(&mut backend, &trace_config(layout), None).unwrap();
            session.build(&graph).unwrap();
            states.push(session.statuses().unwrap());
            session.close().unwrap();
        }
        assert_eq!(states[0], states[1]);
    }

    #[test]
    fn test_mismatched_plan_and_invalid_config() {
        let mut backend = SimulatedBackend::default();
        let graph = build_trace_replica().unwrap();
        let config = ScenarioConfig::new(120, 3, 60);

        let mut session = Session::open(&mut backend, &config, None).unwrap();
        assert!(session.build(&graph).is_err());
        assert!(session.signal(EventId(0)).is_err());
        session.close().unwrap();

        let bad = ScenarioConfig::new(16, 0, 5);
        assert!(Session::open(&mut backend, &bad, None).is_err());
    }

    /// Delegates to the simulator and logs every create/destroy call.
    struct Recording {
        inner: SimulatedBackend,
        calls: Vec<&'static str>,
    }

    impl Backend for Recording {
        fn enumerate_devices(&self) -> BackendResult<Vec<DeviceId>> {
            self.inner.enumerate_devices()
        }
        fn create_context(&mut self, device: DeviceId) -> BackendResult<ContextId> {
            self.calls.push("create_context");
            self.inner.create_context(device)
        }
        fn allocate_memory(
            &mut self,
            context: ContextId,
            kind: MemoryKind,
            size: usize,
            alignment: usize,
        ) -> BackendResult<MemHandle> {
            self.calls.push("allocate_memory");
            self.inner.allocate_memory(context, kind, size, alignment)
        }
        fn create_command_stream(
            &mut self,
            context: ContextId,
            device: DeviceId,
        ) -> BackendResult<StreamId> {
            self.calls.push("create_stream");
            self.inner.create_command_stream(context, device)
        }
        fn create_signal_pool(&mut self, context: ContextId, capacity: u32) -> BackendResult<PoolId> {
            self.calls.push("create_pool");
            self.inner.create_signal_pool(context, capacity)
        }
        fn create_signal(&mut self, pool: PoolId, slot: u32) -> BackendResult<SignalId> {
            self.calls.push("create_signal");
            self.inner.create_signal(pool, slot)
        }
        fn reset_signal(&mut self, signal: SignalId) -> BackendResult<()> {
            self.inner.reset_signal(signal)
        }
        fn submit_command(&mut self, stream: StreamId, command: &Command) -> BackendResult<()> {
            self.inner.submit_command(stream, command)
        }
        fn query_status(&self, signal: SignalId) -> BackendResult<SignalStatus> {
            self.inner.query_status(signal)
        }
        fn synchronize_stream(&mut self, stream: StreamId, timeout: Duration) -> BackendResult<()> {
            self.inner.synchronize_stream(stream, timeout)
        }
        fn synchronize_signal(&mut self, signal: SignalId, timeout: Duration) -> BackendResult<()> {
            self.inner.synchronize_signal(signal, timeout)
        }
        fn global_timestamps(&self, device: DeviceId) -> BackendResult<TimestampPair> {
            self.inner.global_timestamps(device)
        }
        fn create_module(
            &mut self,
            context: ContextId,
            device: DeviceId,
            il: &[u8],
        ) -> BackendResult<ModuleId> {
            self.calls.push("create_module");
            self.inner.create_module(context, device, il)
        }
        fn create_kernel(&mut self, module: ModuleId, name: &str) -> BackendResult<KernelId> {
            self.calls.push("create_kernel");
            self.inner.create_kernel(module, name)
        }
        fn destroy_kernel(&mut self, kernel: KernelId) -> BackendResult<()> {
            self.calls.push("destroy_kernel");
            self.inner.destroy_kernel(kernel)
        }
        fn destroy_module(&mut self, module: ModuleId) -> BackendResult<()> {
            self.calls.push("destroy_module");
            self.inner.destroy_module(module)
        }
        fn destroy_signal(&mut self, signal: SignalId) -> BackendResult<()> {
            self.calls.push("destroy_signal");
            self.inner.destroy_signal(signal)
        }
        fn destroy_pool(&mut self, pool: PoolId) -> BackendResult<()> {
            self.calls.push("destroy_pool");
            self.inner.destroy_pool(pool)
        }
        fn free_memory(&mut self, context: ContextId, mem: MemHandle) -> BackendResult<()> {
            self.calls.push("free_memory");
            self.inner.free_memory(context, mem)
        }
        fn destroy_stream(&mut self, stream: StreamId) -> BackendResult<()> {
            self.calls.push("destroy_stream");
            self.inner.destroy_stream(stream)
        }
        fn destroy_context(&mut self, context: ContextId) -> BackendResult<()> {
            self.calls.push("destroy_context");
            self.inner.destroy_context(context)
        }
    }

    /// Collapse runs of the same call so the order reads per object kind.
    fn phases(calls: &[&'static str]) -> Vec<&'static str> {
        let mut out: Vec<&'static str> = Vec::new();
        for call in calls {
            if out.last() != Some(call) {
                out.push(call);
            }
        }
        out
    }

    #[test]
    fn test_close_reverses_creation_order() {
        let mut backend = Recording {
            inner: SimulatedBackend::default().with_cost_model(CostModel::free()),
            calls: Vec::new(),
        };
        let il = spirv_module(&[RESET_KERNEL, MAIN_KERNEL]);
        let graph = build_trace_replica().unwrap();

        let mut session =
            Session::open(&mut backend, &trace_config(PoolLayout::Partitioned), Some(il.as_slice()))
                .unwrap();
        assert!(session.kernel_path().is_real());
        session.build(&graph).unwrap();
        session.close().unwrap();

        let order = phases(&backend.calls);
        let split = order
            .iter()
            .position(|c| c.starts_with("destroy") || *c == "free_memory")
            .unwrap();
        let (created, destroyed) = order.split_at(split);
        assert_eq!(
            created,
            [
                "create_context",
                "allocate_memory",
                "create_stream",
                "create_module",
                "create_kernel",
                "create_pool",
                "create_signal",
            ]
        );
        assert_eq!(
            destroyed,
            [
                "destroy_signal",
                "destroy_pool",
                "destroy_kernel",
                "destroy_module",
                "destroy_stream",
                "free_memory",
                "destroy_context",
            ]
        );
        assert_eq!(backend.inner.live_objects(), 0);
    }

    #[test]
    fn test_open_without_devices() {
        let mut backend = SimulatedBackend::new(0);
        let err = Session::open(&mut backend, &ScenarioConfig::new(120, 3, 60), None)
            .err()
            .unwrap();
        assert!(format!("{:#}", err).contains("no device"));
    }
}
