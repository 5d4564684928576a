//! # Simulated Backend
//!
//! An in-process implementation of [`Backend`] that follows the driver
//! contract closely enough to exercise the harness end to end:
//!
//! - Ownership tree: contexts own memory, streams, pools and modules; pools own
//!   signals; modules own kernels. Destroying a parent with live children
//!   fails.
//! - Streams are in-order and immediate: a submitted command executes as soon
//!   as its wait-list is signaled, and a blocked command holds back every
//!   command behind it.
//! - Every signal keeps a dependency record: the union of the wait-lists of
//!   the commands that signaled it since its last reset.
//!
//! ## Query cost model
//!
//! `query_status` walks the transitive dependency record of the queried
//! signal before answering. Each edge visited costs
//! [`CostModel::per_dependency`]; an edge whose two signals live in different
//! pools additionally costs [`CostModel::per_cross_pool`]. The total is spent
//! busy-waiting, so it shows up in wall-clock measurements exactly like driver
//! work would.
//!
//! ```text
//!   query(e9) ──► e9.deps ─► e8 (same pool)      +per_dependency
//!                       └──► e11 (other pool)    +per_dependency +per_cross_pool
//!                              └──► e6 ...
//! ```

use std::collections::{HashMap, HashSet, VecDeque};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::backend::{Backend, BackendError, BackendResult};
use crate::model::{
    Command, CommandOp, ContextId, DeviceId, KernelId, MemHandle, MemRegion, MemoryKind, ModuleId,
    PoolId, SignalId, SignalStatus, StreamId, TimestampPair,
};

/// First word of every SPIR-V binary.
pub const SPIRV_MAGIC: u32 = 0x0723_0203;
const SPIRV_HEADER_WORDS: usize = 5;
const OP_ENTRY_POINT: u32 = 15;

/// Per-query resolution cost charged by the simulated backend.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CostModel {
    /// Charged for every dependency edge traversed
    pub per_dependency: Duration,
    /// Extra charge when the edge crosses a pool boundary
    pub per_cross_pool: Duration,
    /// Sleep before answering; models a query that never comes back
    pub query_stall: Option<Duration>,
}

impl Default for CostModel {
    fn default() -> Self {
        Self {
            per_dependency: Duration::from_nanos(40),
            per_cross_pool: Duration::from_micros(4),
            query_stall: None,
        }
    }
}

impl CostModel {
    /// No traversal cost at all.
    pub fn free() -> Self {
        Self {
            per_dependency: Duration::ZERO,
            per_cross_pool: Duration::ZERO,
            query_stall: None,
        }
    }

    /// Make every query sleep for `stall` first
    pub fn with_stall(mut self, stall: Duration) -> Self {
        self.query_stall = Some(stall);
        self
    }
}

/// What resolving one query had to traverse.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryCost {
    /// Distinct signals reached, including the queried one
    pub visited: usize,
    /// Dependency edges walked
    pub edges: usize,
    /// Edges whose endpoints live in different pools
    pub cross_pool_edges: usize,
}

impl QueryCost {
    /// Busy time the cost model charges for this traversal.
    pub fn modeled(&self, model: &CostModel) -> Duration {
        model.per_dependency * self.edges as u32 + model.per_cross_pool * self.cross_pool_edges as u32
    }
}

struct ContextEntry {
    live: usize,
}

struct MemEntry {
    context: ContextId,
    kind: MemoryKind,
    data: Vec<u8>,
}

struct StreamEntry {
    context: ContextId,
    queue: VecDeque<Command>,
    executed: u64,
}

struct PoolEntry {
    context: ContextId,
    slots: Vec<Option<SignalId>>,
    live: usize,
}

struct SignalEntry {
    pool: PoolId,
    slot: u32,
    status: SignalStatus,
    deps: Vec<SignalId>,
    pending_refs: usize,
}

struct ModuleEntry {
    context: ContextId,
    entry_points: Vec<String>,
    live: usize,
}

struct KernelEntry {
    module: ModuleId,
    launches: u64,
}

fn entry<'a, T>(map: &'a HashMap<u64, T>, kind: &'static str, id: u64) -> BackendResult<&'a T> {
    map.get(&id).ok_or(BackendError::InvalidHandle { kind, id })
}

fn entry_mut<'a, T>(
    map: &'a mut HashMap<u64, T>,
    kind: &'static str,
    id: u64,
) -> BackendResult<&'a mut T> {
    map.get_mut(&id).ok_or(BackendError::InvalidHandle { kind, id })
}

fn spin_for(duration: Duration) {
    if duration.is_zero() {
        return;
    }
    let deadline = Instant::now() + duration;
    while Instant::now() < deadline {
        std::hint::spin_loop();
    }
}

/// Extract `OpEntryPoint` names from a little-endian SPIR-V binary.
fn parse_entry_points(il: &[u8]) -> BackendResult<Vec<String>> {
    if il.len() < SPIRV_HEADER_WORDS * 4 || il.len() % 4 != 0 {
        return Err(BackendError::InvalidModule(format!(
            "{} bytes is not a SPIR-V header followed by whole words",
            il.len()
        )));
    }

    let words: Vec<u32> = il
        .chunks_exact(4)
        .map(|chunk| u32::from_le(bytemuck::pod_read_unaligned(chunk)))
        .collect();

    if words[0] != SPIRV_MAGIC {
        return Err(BackendError::InvalidModule(format!(
            "bad magic {:#010x}",
            words[0]
        )));
    }

    let mut entry_points = Vec::new();
    let mut at = SPIRV_HEADER_WORDS;
    while at < words.len() {
        let word_count = (words[at] >> 16) as usize;
        let opcode = words[at] & 0xffff;
        if word_count == 0 || at + word_count > words.len() {
            return Err(BackendError::InvalidModule(format!(
                "truncated instruction at word {}",
                at
            )));
        }

        // OpEntryPoint <execution model> <function id> <name literal> ...
        if opcode == OP_ENTRY_POINT && word_count > 3 {
            let name: Vec<u8> = words[at + 3..at + word_count]
                .iter()
                .flat_map(|w| w.to_le_bytes())
                .take_while(|&b| b != 0)
                .collect();
            entry_points.push(String::from_utf8_lossy(&name).into_owned());
        }
        at += word_count;
    }

    Ok(entry_points)
}

/// In-process backend with a configurable query cost model.
pub struct SimulatedBackend {
    devices: Vec<DeviceId>,
    cost: CostModel,
    epoch: Instant,
    next_handle: u64,

    contexts: HashMap<u64, ContextEntry>,
    memory: HashMap<u64, MemEntry>,
    streams: HashMap<u64, StreamEntry>,
    pools: HashMap<u64, PoolEntry>,
    signals: HashMap<u64, SignalEntry>,
    modules: HashMap<u64, ModuleEntry>,
    kernels: HashMap<u64, KernelEntry>,
}

impl Default for SimulatedBackend {
    fn default() -> Self {
        Self::new(1)
    }
}

impl SimulatedBackend {
    /// Create a backend exposing `device_count` devices.
    pub fn new(device_count: usize) -> Self {
        let mut backend = Self {
            devices: Vec::with_capacity(device_count),
            cost: CostModel::default(),
            epoch: Instant::now(),
            next_handle: 1,
            contexts: HashMap::new(),
            memory: HashMap::new(),
            streams: HashMap::new(),
            pools: HashMap::new(),
            signals: HashMap::new(),
            modules: HashMap::new(),
            kernels: HashMap::new(),
        };
        for _ in 0..device_count {
            let id = backend.next_id();
            backend.devices.push(DeviceId(id));
        }
        backend
    }

    /// Replace the query cost model
    pub fn with_cost_model(mut self, cost: CostModel) -> Self {
        self.cost = cost;
        self
    }

    pub fn cost_model(&self) -> &CostModel {
        &self.cost
    }

    /// Walk the dependency record of `signal` without charging for it.
    pub fn resolution_cost(&self, signal: SignalId) -> BackendResult<QueryCost> {
        entry(&self.signals, "signal", signal.0)?;

        let mut visited = HashSet::from([signal]);
        let mut stack = vec![signal];
        let mut cost = QueryCost::default();

        while let Some(current) = stack.pop() {
            // Destroyed signals can linger in older records
            let Some(current_entry) = self.signals.get(&current.0) else {
                continue;
            };
            for dep in &current_entry.deps {
                cost.edges += 1;
                if let Some(dep_entry) = self.signals.get(&dep.0) {
                    if dep_entry.pool != current_entry.pool {
                        cost.cross_pool_edges += 1;
                    }
                }
                if visited.insert(*dep) {
                    stack.push(*dep);
                }
            }
        }

        cost.visited = visited.len();
        Ok(cost)
    }

    /// Commands still queued on `stream`.
    pub fn pending_commands(&self, stream: StreamId) -> BackendResult<usize> {
        Ok(entry(&self.streams, "stream", stream.0)?.queue.len())
    }

    /// Commands executed so far on `stream`.
    pub fn executed_commands(&self, stream: StreamId) -> BackendResult<u64> {
        Ok(entry(&self.streams, "stream", stream.0)?.executed)
    }

    pub fn kernel_launches(&self, kernel: KernelId) -> BackendResult<u64> {
        Ok(entry(&self.kernels, "kernel", kernel.0)?.launches)
    }

    /// Pool and slot a signal occupies.
    pub fn signal_location(&self, signal: SignalId) -> BackendResult<(PoolId, u32)> {
        let e = entry(&self.signals, "signal", signal.0)?;
        Ok((e.pool, e.slot))
    }

    pub fn memory_kind(&self, mem: MemHandle) -> BackendResult<MemoryKind> {
        Ok(entry(&self.memory, "memory", mem.0)?.kind)
    }

    /// Host view of an allocation.
    pub fn read_memory(&self, mem: MemHandle) -> BackendResult<&[u8]> {
        Ok(&entry(&self.memory, "memory", mem.0)?.data)
    }

    /// Objects of any kind that have not been destroyed.
    pub fn live_objects(&self) -> usize {
        self.contexts.len()
            + self.memory.len()
            + self.streams.len()
            + self.pools.len()
            + self.signals.len()
            + self.modules.len()
            + self.kernels.len()
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_handle;
        self.next_handle += 1;
        id
    }

    fn check_device(&self, device: DeviceId) -> BackendResult<()> {
        if self.devices.contains(&device) {
            Ok(())
        } else {
            Err(BackendError::InvalidHandle {
                kind: "device",
                id: device.0,
            })
        }
    }

    fn device_clock(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    fn status_of(&self, signal: SignalId) -> SignalStatus {
        self.signals
            .get(&signal.0)
            .map_or(SignalStatus::Unsignaled, |e| e.status)
    }

    fn check_region(&self, context: ContextId, region: &MemRegion) -> BackendResult<()> {
        let mem = entry(&self.memory, "memory", region.mem.0)?;
        if mem.context != context {
            return Err(BackendError::ForeignHandle(region.mem.to_string()));
        }
        let end = region.offset.checked_add(region.len);
        if end.map_or(true, |end| end > mem.data.len()) {
            return Err(BackendError::OutOfBounds {
                offset: region.offset,
                len: region.len,
                size: mem.data.len(),
            });
        }
        Ok(())
    }

    fn check_signal(&self, context: ContextId, signal: SignalId) -> BackendResult<()> {
        let sig = entry(&self.signals, "signal", signal.0)?;
        let pool = entry(&self.pools, "pool", sig.pool.0)?;
        if pool.context != context {
            return Err(BackendError::ForeignHandle(signal.to_string()));
        }
        Ok(())
    }

    fn validate(&self, context: ContextId, command: &Command) -> BackendResult<()> {
        for signal in command.wait_list.iter().chain(command.completion.iter()) {
            self.check_signal(context, *signal)?;
        }

        match &command.op {
            CommandOp::Fill { dst, .. } => self.check_region(context, dst),
            CommandOp::Copy { src, dst } => {
                if src.len != dst.len {
                    return Err(BackendError::LengthMismatch {
                        src: src.len,
                        dst: dst.len,
                    });
                }
                self.check_region(context, src)?;
                self.check_region(context, dst)
            }
            CommandOp::WriteTimestamp { dst } => {
                if dst.len != 8 {
                    return Err(BackendError::TimestampRegion(dst.len));
                }
                self.check_region(context, dst)
            }
            CommandOp::Barrier => Ok(()),
            CommandOp::Launch { kernel, .. } => {
                let k = entry(&self.kernels, "kernel", kernel.0)?;
                let module = entry(&self.modules, "module", k.module.0)?;
                if module.context != context {
                    return Err(BackendError::ForeignHandle(kernel.to_string()));
                }
                Ok(())
            }
        }
    }

    fn execute(&mut self, command: &Command) -> BackendResult<()> {
        match command.op {
            CommandOp::Fill { dst, pattern } => {
                let mem = entry_mut(&mut self.memory, "memory", dst.mem.0)?;
                mem.data[dst.offset..dst.offset + dst.len].fill(pattern);
            }
            CommandOp::Copy { src, dst } => {
                let bytes = entry(&self.memory, "memory", src.mem.0)?.data
                    [src.offset..src.offset + src.len]
                    .to_vec();
                let mem = entry_mut(&mut self.memory, "memory", dst.mem.0)?;
                mem.data[dst.offset..dst.offset + dst.len].copy_from_slice(&bytes);
            }
            CommandOp::WriteTimestamp { dst } => {
                let now = self.device_clock();
                let mem = entry_mut(&mut self.memory, "memory", dst.mem.0)?;
                mem.data[dst.offset..dst.offset + 8].copy_from_slice(bytemuck::bytes_of(&now));
            }
            CommandOp::Barrier => {}
            CommandOp::Launch { kernel, .. } => {
                entry_mut(&mut self.kernels, "kernel", kernel.0)?.launches += 1;
            }
        }

        for waited in &command.wait_list {
            if let Some(sig) = self.signals.get_mut(&waited.0) {
                sig.pending_refs = sig.pending_refs.saturating_sub(1);
            }
        }

        if let Some(completion) = command.completion {
            let sig = entry_mut(&mut self.signals, "signal", completion.0)?;
            sig.status = SignalStatus::Signaled;
            sig.pending_refs = sig.pending_refs.saturating_sub(1);
            for waited in &command.wait_list {
                if !sig.deps.contains(waited) {
                    sig.deps.push(*waited);
                }
            }
        }

        Ok(())
    }

    /// Execute queued commands on `stream` until the head is blocked.
    fn drain(&mut self, stream: StreamId) -> BackendResult<()> {
        loop {
            let queued = entry(&self.streams, "stream", stream.0)?;
            let ready = match queued.queue.front() {
                Some(head) => head
                    .wait_list
                    .iter()
                    .all(|s| self.status_of(*s).is_signaled()),
                None => return Ok(()),
            };
            if !ready {
                return Ok(());
            }

            let queued = entry_mut(&mut self.streams, "stream", stream.0)?;
            let Some(command) = queued.queue.pop_front() else {
                return Ok(());
            };
            queued.executed += 1;
            self.execute(&command)?;
        }
    }

    /// Drain every stream until none makes progress.
    fn drain_all(&mut self) -> BackendResult<()> {
        loop {
            let before: u64 = self.streams.values().map(|s| s.executed).sum();
            let ids: Vec<u64> = self.streams.keys().copied().collect();
            for id in ids {
                self.drain(StreamId(id))?;
            }
            let after: u64 = self.streams.values().map(|s| s.executed).sum();
            if after == before {
                return Ok(());
            }
        }
    }
}

impl Backend for SimulatedBackend {
    fn enumerate_devices(&self) -> BackendResult<Vec<DeviceId>> {
        Ok(self.devices.clone())
    }

    fn create_context(&mut self, device: DeviceId) -> BackendResult<ContextId> {
        self.check_device(device)?;
        let id = self.next_id();
        self.contexts.insert(id, ContextEntry { live: 0 });
        Ok(ContextId(id))
    }

    fn allocate_memory(
        &mut self,
        context: ContextId,
        kind: MemoryKind,
        size: usize,
        alignment: usize,
    ) -> BackendResult<MemHandle> {
        if size == 0 {
            return Err(BackendError::ZeroSize);
        }
        // Zero means "driver default"
        if alignment != 0 && !alignment.is_power_of_two() {
            return Err(BackendError::InvalidAlignment(alignment));
        }
        entry_mut(&mut self.contexts, "context", context.0)?.live += 1;

        let id = self.next_id();
        self.memory.insert(
            id,
            MemEntry {
                context,
                kind,
                data: vec![0; size],
            },
        );
        Ok(MemHandle(id))
    }

    fn create_command_stream(
        &mut self,
        context: ContextId,
        device: DeviceId,
    ) -> BackendResult<StreamId> {
        self.check_device(device)?;
        entry_mut(&mut self.contexts, "context", context.0)?.live += 1;

        let id = self.next_id();
        self.streams.insert(
            id,
            StreamEntry {
                context,
                queue: VecDeque::new(),
                executed: 0,
            },
        );
        Ok(StreamId(id))
    }

    fn create_signal_pool(&mut self, context: ContextId, capacity: u32) -> BackendResult<PoolId> {
        if capacity == 0 {
            return Err(BackendError::ZeroCapacity);
        }
        entry_mut(&mut self.contexts, "context", context.0)?.live += 1;

        let id = self.next_id();
        self.pools.insert(
            id,
            PoolEntry {
                context,
                slots: vec![None; capacity as usize],
                live: 0,
            },
        );
        Ok(PoolId(id))
    }

    fn create_signal(&mut self, pool: PoolId, slot: u32) -> BackendResult<SignalId> {
        let id = self.next_id();
        let owner = entry_mut(&mut self.pools, "pool", pool.0)?;
        let capacity = owner.slots.len() as u32;
        let Some(cell) = owner.slots.get_mut(slot as usize) else {
            return Err(BackendError::SlotOutOfRange { slot, capacity });
        };
        if cell.is_some() {
            return Err(BackendError::SlotInUse { slot });
        }
        *cell = Some(SignalId(id));
        owner.live += 1;

        self.signals.insert(
            id,
            SignalEntry {
                pool,
                slot,
                status: SignalStatus::Unsignaled,
                deps: Vec::new(),
                pending_refs: 0,
            },
        );
        Ok(SignalId(id))
    }

    fn reset_signal(&mut self, signal: SignalId) -> BackendResult<()> {
        let sig = entry_mut(&mut self.signals, "signal", signal.0)?;
        sig.status = SignalStatus::Unsignaled;
        sig.deps.clear();
        Ok(())
    }

    fn submit_command(&mut self, stream: StreamId, command: &Command) -> BackendResult<()> {
        let context = entry(&self.streams, "stream", stream.0)?.context;
        self.validate(context, command)?;

        for signal in command.wait_list.iter().chain(command.completion.iter()) {
            entry_mut(&mut self.signals, "signal", signal.0)?.pending_refs += 1;
        }
        entry_mut(&mut self.streams, "stream", stream.0)?
            .queue
            .push_back(command.clone());

        self.drain_all()
    }

    fn query_status(&self, signal: SignalId) -> BackendResult<SignalStatus> {
        if let Some(stall) = self.cost.query_stall {
            thread::sleep(stall);
        }
        let cost = self.resolution_cost(signal)?;
        spin_for(cost.modeled(&self.cost));
        Ok(self.status_of(signal))
    }

    fn synchronize_stream(&mut self, stream: StreamId, timeout: Duration) -> BackendResult<()> {
        self.drain_all()?;
        let pending = entry(&self.streams, "stream", stream.0)?.queue.len();
        // Nothing outside this process can unblock the head, so waiting is futile
        if pending > 0 {
            return Err(BackendError::StreamStalled {
                stream,
                pending,
                timeout,
            });
        }
        Ok(())
    }

    fn synchronize_signal(&mut self, signal: SignalId, timeout: Duration) -> BackendResult<()> {
        entry(&self.signals, "signal", signal.0)?;
        self.drain_all()?;
        if self.status_of(signal).is_signaled() {
            Ok(())
        } else {
            Err(BackendError::NotReady { signal, timeout })
        }
    }

    fn global_timestamps(&self, device: DeviceId) -> BackendResult<TimestampPair> {
        self.check_device(device)?;
        let host = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or_default();
        Ok(TimestampPair {
            host,
            device: self.device_clock(),
        })
    }

    fn create_module(
        &mut self,
        context: ContextId,
        device: DeviceId,
        il: &[u8],
    ) -> BackendResult<ModuleId> {
        self.check_device(device)?;
        entry(&self.contexts, "context", context.0)?;
        let entry_points = parse_entry_points(il)?;
        entry_mut(&mut self.contexts, "context", context.0)?.live += 1;

        tracing::debug!(
            "Compiled module with {} entry point(s): {:?}",
            entry_points.len(),
            entry_points
        );

        let id = self.next_id();
        self.modules.insert(
            id,
            ModuleEntry {
                context,
                entry_points,
                live: 0,
            },
        );
        Ok(ModuleId(id))
    }

    fn create_kernel(&mut self, module: ModuleId, name: &str) -> BackendResult<KernelId> {
        let owner = entry_mut(&mut self.modules, "module", module.0)?;
        if !owner.entry_points.iter().any(|e| e == name) {
            return Err(BackendError::KernelNotFound(name.to_string()));
        }
        owner.live += 1;

        let id = self.next_id();
        self.kernels.insert(
            id,
            KernelEntry {
                module,
                launches: 0,
            },
        );
        Ok(KernelId(id))
    }

    fn destroy_kernel(&mut self, kernel: KernelId) -> BackendResult<()> {
        let module = entry(&self.kernels, "kernel", kernel.0)?.module;
        entry_mut(&mut self.modules, "module", module.0)?.live -= 1;
        self.kernels.remove(&kernel.0);
        Ok(())
    }

    fn destroy_module(&mut self, module: ModuleId) -> BackendResult<()> {
        let owner = entry(&self.modules, "module", module.0)?;
        if owner.live > 0 {
            return Err(BackendError::StillInUse {
                what: module.to_string(),
                live: owner.live,
            });
        }
        let context = owner.context;
        entry_mut(&mut self.contexts, "context", context.0)?.live -= 1;
        self.modules.remove(&module.0);
        Ok(())
    }

    fn destroy_signal(&mut self, signal: SignalId) -> BackendResult<()> {
        let sig = entry(&self.signals, "signal", signal.0)?;
        if sig.pending_refs > 0 {
            return Err(BackendError::SignalInUse(signal));
        }
        let (pool, slot) = (sig.pool, sig.slot);

        let owner = entry_mut(&mut self.pools, "pool", pool.0)?;
        owner.slots[slot as usize] = None;
        owner.live -= 1;
        self.signals.remove(&signal.0);
        Ok(())
    }

    fn destroy_pool(&mut self, pool: PoolId) -> BackendResult<()> {
        let owner = entry(&self.pools, "pool", pool.0)?;
        if owner.live > 0 {
            return Err(BackendError::StillInUse {
                what: pool.to_string(),
                live: owner.live,
            });
        }
        let context = owner.context;
        entry_mut(&mut self.contexts, "context", context.0)?.live -= 1;
        self.pools.remove(&pool.0);
        Ok(())
    }

    fn free_memory(&mut self, context: ContextId, mem: MemHandle) -> BackendResult<()> {
        let allocation = entry(&self.memory, "memory", mem.0)?;
        if allocation.context != context {
            return Err(BackendError::ForeignHandle(mem.to_string()));
        }
        entry_mut(&mut self.contexts, "context", context.0)?.live -= 1;
        self.memory.remove(&mem.0);
        Ok(())
    }

    fn destroy_stream(&mut self, stream: StreamId) -> BackendResult<()> {
        let queued = entry(&self.streams, "stream", stream.0)?;
        if !queued.queue.is_empty() {
            return Err(BackendError::StillInUse {
                what: stream.to_string(),
                live: queued.queue.len(),
            });
        }
        let context = queued.context;
        entry_mut(&mut self.contexts, "context", context.0)?.live -= 1;
        self.streams.remove(&stream.0);
        Ok(())
    }

    fn destroy_context(&mut self, context: ContextId) -> BackendResult<()> {
        let owner = entry(&self.contexts, "context", context.0)?;
        if owner.live > 0 {
            return Err(BackendError::StillInUse {
                what: context.to_string(),
                live: owner.live,
            });
        }
        self.contexts.remove(&context.0);
        Ok(())
    }
}

/// Encode a minimal SPIR-V module declaring one kernel entry point per name.
#[cfg(test)]
pub(crate) fn spirv_module(names: &[&str]) -> Vec<u8> {
    let mut words = vec![SPIRV_MAGIC, 0x0001_0000, 0, 16, 0];
    for (i, name) in names.iter().enumerate() {
        let mut literal = name.as_bytes().to_vec();
        literal.push(0);
        while literal.len() % 4 != 0 {
            literal.push(0);
        }
        let word_count = 3 + literal.len() / 4;
        words.push(((word_count as u32) << 16) | OP_ENTRY_POINT);
        words.push(6); // Kernel execution model
        words.push(i as u32 + 1);
        words.extend(
            literal
                .chunks_exact(4)
                .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]])),
        );
    }
    words.iter().flat_map(|w| w.to_le_bytes()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (SimulatedBackend, ContextId, StreamId, PoolId) {
        let mut backend = SimulatedBackend::default().with_cost_model(CostModel::free());
        let device = backend.enumerate_devices().unwrap()[0];
        let ctx = backend.create_context(device).unwrap();
        let stream = backend.create_command_stream(ctx, device).unwrap();
        let pool = backend.create_signal_pool(ctx, 8).unwrap();
        (backend, ctx, stream, pool)
    }

    #[test]
    fn test_slot_rules() {
        let (mut backend, _ctx, _stream, pool) = setup();

        backend.create_signal(pool, 3).unwrap();
        assert_eq!(
            backend.create_signal(pool, 3),
            Err(BackendError::SlotInUse { slot: 3 })
        );
        assert_eq!(
            backend.create_signal(pool, 8),
            Err(BackendError::SlotOutOfRange {
                slot: 8,
                capacity: 8
            })
        );
    }

    #[test]
    fn test_barrier_chain_executes_in_order() {
        let (mut backend, _ctx, stream, pool) = setup();
        let a = backend.create_signal(pool, 0).unwrap();
        let b = backend.create_signal(pool, 1).unwrap();

        backend.submit_command(stream, &Command::barrier(a, &[])).unwrap();
        backend.submit_command(stream, &Command::barrier(b, &[a])).unwrap();
        backend
            .synchronize_stream(stream, Duration::from_secs(1))
            .unwrap();

        assert_eq!(backend.query_status(a).unwrap(), SignalStatus::Signaled);
        assert_eq!(backend.query_status(b).unwrap(), SignalStatus::Signaled);
        assert_eq!(backend.executed_commands(stream).unwrap(), 2);
    }

    #[test]
    fn test_blocked_head_holds_stream() {
        let (mut backend, _ctx, stream, pool) = setup();
        let never = backend.create_signal(pool, 0).unwrap();
        let a = backend.create_signal(pool, 1).unwrap();
        let b = backend.create_signal(pool, 2).unwrap();

        backend.submit_command(stream, &Command::barrier(a, &[never])).unwrap();
        backend.submit_command(stream, &Command::barrier(b, &[])).unwrap();

        assert_eq!(backend.pending_commands(stream).unwrap(), 2);
        assert_eq!(backend.query_status(b).unwrap(), SignalStatus::Unsignaled);
        assert!(matches!(
            backend.synchronize_stream(stream, Duration::from_millis(1)),
            Err(BackendError::StreamStalled { pending: 2, .. })
        ));
    }

    #[test]
    fn test_destroy_signal_referenced_by_pending_command() {
        let (mut backend, _ctx, stream, pool) = setup();
        let never = backend.create_signal(pool, 0).unwrap();
        let a = backend.create_signal(pool, 1).unwrap();

        backend.submit_command(stream, &Command::barrier(a, &[never])).unwrap();
        assert_eq!(
            backend.destroy_signal(never),
            Err(BackendError::SignalInUse(never))
        );
        assert_eq!(backend.destroy_signal(a), Err(BackendError::SignalInUse(a)));
    }

    #[test]
    fn test_ownership_teardown_order() {
        let (mut backend, ctx, stream, pool) = setup();
        let sig = backend.create_signal(pool, 0).unwrap();
        let mem = backend
            .allocate_memory(ctx, MemoryKind::Host, 64, 4096)
            .unwrap();

        assert!(matches!(
            backend.destroy_pool(pool),
            Err(BackendError::StillInUse { live: 1, .. })
        ));
        assert!(matches!(
            backend.destroy_context(ctx),
            Err(BackendError::StillInUse { .. })
        ));

        backend.destroy_signal(sig).unwrap();
        backend.destroy_pool(pool).unwrap();
        backend.free_memory(ctx, mem).unwrap();
        backend.destroy_stream(stream).unwrap();
        backend.destroy_context(ctx).unwrap();
        assert_eq!(backend.live_objects(), 0);
    }

    #[test]
    fn test_memory_commands() {
        let (mut backend, ctx, stream, pool) = setup();
        let device = backend
            .allocate_memory(ctx, MemoryKind::Device, 32, 0)
            .unwrap();
        let shared = backend
            .allocate_memory(ctx, MemoryKind::Shared, 32, 8)
            .unwrap();
        let done = backend.create_signal(pool, 0).unwrap();
        let stamped = backend.create_signal(pool, 1).unwrap();

        backend
            .submit_command(
                stream,
                &Command::new(CommandOp::Fill {
                    dst: MemRegion::head(device, 32),
                    pattern: 0xab,
                })
                .signal(done),
            )
            .unwrap();
        backend
            .submit_command(
                stream,
                &Command::new(CommandOp::Copy {
                    src: MemRegion::new(device, 0, 16),
                    dst: MemRegion::new(shared, 16, 16),
                })
                .wait_on(&[done]),
            )
            .unwrap();
        backend
            .submit_command(
                stream,
                &Command::new(CommandOp::WriteTimestamp {
                    dst: MemRegion::head(shared, 8),
                })
                .signal(stamped),
            )
            .unwrap();

        let bytes = backend.read_memory(shared).unwrap();
        assert!(bytes[16..].iter().all(|&b| b == 0xab));
        let ts: u64 = bytemuck::pod_read_unaligned(&bytes[..8]);
        assert!(ts > 0);
        assert_eq!(
            backend.memory_kind(shared).unwrap(),
            MemoryKind::Shared
        );
    }

    #[test]
    fn test_invalid_regions_rejected_at_submit() {
        let (mut backend, ctx, stream, _pool) = setup();
        let mem = backend
            .allocate_memory(ctx, MemoryKind::Host, 16, 0)
            .unwrap();

        assert!(matches!(
            backend.submit_command(
                stream,
                &Command::new(CommandOp::Fill {
                    dst: MemRegion::new(mem, 8, 16),
                    pattern: 0,
                })
            ),
            Err(BackendError::OutOfBounds { .. })
        ));
        assert_eq!(
            backend.submit_command(
                stream,
                &Command::new(CommandOp::WriteTimestamp {
                    dst: MemRegion::head(mem, 4),
                })
            ),
            Err(BackendError::TimestampRegion(4))
        );
        assert_eq!(
            backend.allocate_memory(ctx, MemoryKind::Host, 16, 3),
            Err(BackendError::InvalidAlignment(3))
        );
    }

    #[test]
    fn test_reset_clears_record() {
        let (mut backend, _ctx, stream, pool) = setup();
        let a = backend.create_signal(pool, 0).unwrap();
        let b = backend.create_signal(pool, 1).unwrap();
        backend.submit_command(stream, &Command::barrier(a, &[])).unwrap();
        backend.submit_command(stream, &Command::barrier(b, &[a])).unwrap();

        assert_eq!(backend.resolution_cost(b).unwrap().edges, 1);
        backend.reset_signal(b).unwrap();
        assert_eq!(backend.query_status(b).unwrap(), SignalStatus::Unsignaled);
        assert_eq!(backend.resolution_cost(b).unwrap().edges, 0);
    }

    #[test]
    fn test_resignal_keeps_status_and_grows_record() {
        let (mut backend, _ctx, stream, pool) = setup();
        let a = backend.create_signal(pool, 0).unwrap();
        let b = backend.create_signal(pool, 1).unwrap();
        let c = backend.create_signal(pool, 2).unwrap();
        backend.submit_command(stream, &Command::barrier(a, &[])).unwrap();
        backend.submit_command(stream, &Command::barrier(b, &[])).unwrap();
        backend.submit_command(stream, &Command::barrier(c, &[a])).unwrap();
        assert_eq!(backend.resolution_cost(c).unwrap().edges, 1);

        backend.submit_command(stream, &Command::barrier(c, &[b])).unwrap();
        assert_eq!(backend.query_status(c).unwrap(), SignalStatus::Signaled);
        assert_eq!(backend.resolution_cost(c).unwrap().edges, 2);

        // Repeated waits are recorded once
        backend.submit_command(stream, &Command::barrier(c, &[a, b])).unwrap();
        assert_eq!(backend.resolution_cost(c).unwrap().edges, 2);
    }

    #[test]
    fn test_cross_pool_edges_counted() {
        let (mut backend, ctx, stream, pool) = setup();
        let other = backend.create_signal_pool(ctx, 4).unwrap();
        let a = backend.create_signal(pool, 0).unwrap();
        let b = backend.create_signal(other, 0).unwrap();
        let c = backend.create_signal(pool, 1).unwrap();

        backend.submit_command(stream, &Command::barrier(a, &[])).unwrap();
        backend.submit_command(stream, &Command::barrier(b, &[a])).unwrap();
        backend.submit_command(stream, &Command::barrier(c, &[a, b])).unwrap();

        let cost = backend.resolution_cost(c).unwrap();
        assert_eq!(cost.visited, 3);
        assert_eq!(cost.edges, 3);
        assert_eq!(cost.cross_pool_edges, 2);

        let model = CostModel::default();
        assert_eq!(
            cost.modeled(&model),
            model.per_dependency * 3 + model.per_cross_pool * 2
        );
    }

    #[test]
    fn test_module_entry_points() {
        let (mut backend, ctx, _stream, _pool) = setup();
        let device = backend.enumerate_devices().unwrap()[0];
        let il = spirv_module(&["__chip_reset_non_symbols", "main_kernel"]);

        let module = backend.create_module(ctx, device, &il).unwrap();
        let kernel = backend.create_kernel(module, "main_kernel").unwrap();
        assert_eq!(
            backend.create_kernel(module, "missing"),
            Err(BackendError::KernelNotFound("missing".into()))
        );
        assert!(matches!(
            backend.destroy_module(module),
            Err(BackendError::StillInUse { .. })
        ));
        backend.destroy_kernel(kernel).unwrap();
        backend.destroy_module(module).unwrap();
    }

    #[test]
    fn test_module_rejects_garbage() {
        let (mut backend, ctx, _stream, _pool) = setup();
        let device = backend.enumerate_devices().unwrap()[0];

        assert!(matches!(
            backend.create_module(ctx, device, b"not spirv at all, honest!"),
            Err(BackendError::InvalidModule(_))
        ));
        assert!(matches!(
            backend.create_module(ctx, device, &[0u8; 20]),
            Err(BackendError::InvalidModule(_))
        ));
    }
}
