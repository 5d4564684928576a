//! # Backend Adapter
//!
//! The fixed capability set the harness needs from a driver: contexts, memory,
//! command streams, signal pools and signals, command submission, status
//! queries and teardown. Everything the harness measures goes through this
//! trait; the only implementation shipped with the crate is
//! [`crate::sim::SimulatedBackend`].
//!
//! Every operation returns `BackendResult`. A non-success result is fatal for
//! the harness: it is reported with the name of the failing call and the run
//! ends.

use std::time::Duration;
use thiserror::Error;

use crate::model::{
    Command, ContextId, DeviceId, KernelId, MemHandle, MemoryKind, ModuleId, PoolId, SignalId,
    SignalStatus, StreamId, TimestampPair,
};

/// Failures reported by a backend call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("no device available")]
    NoDevice,
    #[error("invalid {kind} handle {id}")]
    InvalidHandle { kind: &'static str, id: u64 },
    #[error("slot {slot} out of range for pool of capacity {capacity}")]
    SlotOutOfRange { slot: u32, capacity: u32 },
    #[error("slot {slot} already holds a live signal")]
    SlotInUse { slot: u32 },
    #[error("pool capacity must be non-zero")]
    ZeroCapacity,
    #[error("alignment {0} is not a power of two")]
    InvalidAlignment(usize),
    #[error("allocation size must be non-zero")]
    ZeroSize,
    #[error("region {offset}+{len} out of bounds for allocation of {size} bytes")]
    OutOfBounds {
        offset: usize,
        len: usize,
        size: usize,
    },
    #[error("copy length mismatch: src {src} bytes, dst {dst} bytes")]
    LengthMismatch { src: usize, dst: usize },
    #[error("timestamp region must be 8 bytes, got {0}")]
    TimestampRegion(usize),
    #[error("{0} belongs to a different context")]
    ForeignHandle(String),
    #[error("signal {0} is referenced by a pending command")]
    SignalInUse(SignalId),
    #[error("{what} still owns {live} live object(s)")]
    StillInUse { what: String, live: usize },
    #[error("stream {stream} stalled with {pending} pending command(s) after {timeout:?}")]
    StreamStalled {
        stream: StreamId,
        pending: usize,
        timeout: Duration,
    },
    #[error("signal {signal} not ready after {timeout:?}")]
    NotReady { signal: SignalId, timeout: Duration },
    #[error("invalid IL module: {0}")]
    InvalidModule(String),
    #[error("kernel '{0}' not found in module")]
    KernelNotFound(String),
}

/// Convenience alias.
pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Primitive driver operations used by the graph builder, the prober and the
/// scenario runners.
///
/// Query and timestamp calls take `&self`: they must not change signal state.
/// Everything else takes `&mut self`.
pub trait Backend {
    /// Devices visible through the first driver.
    fn enumerate_devices(&self) -> BackendResult<Vec<DeviceId>>;

    fn create_context(&mut self, device: DeviceId) -> BackendResult<ContextId>;

    fn allocate_memory(
        &mut self,
        context: ContextId,
        kind: MemoryKind,
        size: usize,
        alignment: usize,
    ) -> BackendResult<MemHandle>;

    /// Create an in-order, immediate-execution stream.
    fn create_command_stream(
        &mut self,
        context: ContextId,
        device: DeviceId,
    ) -> BackendResult<StreamId>;

    fn create_signal_pool(&mut self, context: ContextId, capacity: u32) -> BackendResult<PoolId>;

    fn create_signal(&mut self, pool: PoolId, slot: u32) -> BackendResult<SignalId>;

    /// Return a signal to the unsignaled state and start a new reset cycle.
    fn reset_signal(&mut self, signal: SignalId) -> BackendResult<()>;

    fn submit_command(&mut self, stream: StreamId, command: &Command) -> BackendResult<()>;

    /// Non-blocking status poll. This is the call whose latency is measured.
    fn query_status(&self, signal: SignalId) -> BackendResult<SignalStatus>;

    /// Wait until every command submitted to `stream` has executed.
    fn synchronize_stream(&mut self, stream: StreamId, timeout: Duration) -> BackendResult<()>;

    /// Wait until `signal` is signaled.
    fn synchronize_signal(&mut self, signal: SignalId, timeout: Duration) -> BackendResult<()>;

    fn global_timestamps(&self, device: DeviceId) -> BackendResult<TimestampPair>;

    /// Compile an IL module. Failure here selects the simulated kernel path.
    fn create_module(
        &mut self,
        context: ContextId,
        device: DeviceId,
        il: &[u8],
    ) -> BackendResult<ModuleId>;

    fn create_kernel(&mut self, module: ModuleId, name: &str) -> BackendResult<KernelId>;

    fn destroy_kernel(&mut self, kernel: KernelId) -> BackendResult<()>;

    fn destroy_module(&mut self, module: ModuleId) -> BackendResult<()>;

    /// Forbidden while a pending command references the signal.
    fn destroy_signal(&mut self, signal: SignalId) -> BackendResult<()>;

    /// Forbidden while the pool still owns live signals.
    fn destroy_pool(&mut self, pool: PoolId) -> BackendResult<()>;

    fn free_memory(&mut self, context: ContextId, mem: MemHandle) -> BackendResult<()>;

    fn destroy_stream(&mut self, stream: StreamId) -> BackendResult<()>;

    /// Forbidden while the context still owns anything.
    fn destroy_context(&mut self, context: ContextId) -> BackendResult<()>;
}
