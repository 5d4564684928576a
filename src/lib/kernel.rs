//! # Kernel Path
//!
//! The trace topology launches two kernels. Whether they can be launched for
//! real is decided once per session: the IL is loaded and compiled, both
//! kernels are created, and any failure along the way selects the simulated
//! path instead. On the simulated path every launch is lowered to a barrier
//! with the same wait-list and completion signal, so the dependency graph is
//! unchanged.

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use tracing::{info, warn};

use crate::backend::Backend;
use crate::graph::KernelRole;
use crate::model::{CommandOp, ContextId, DeviceId, KernelId, LaunchArgs, ModuleId};

/// IL file looked up next to the working directory.
pub const KERNEL_FILE: &str = "kernel.spv";
/// Clears the device buffer before the counting kernel runs.
pub const RESET_KERNEL: &str = "__chip_reset_non_symbols";
/// The counting kernel.
pub const MAIN_KERNEL: &str = "_Z15addCountReverseIiEvPKT_PS0_li";

/// Read an IL file, or `None` (with a warning) if it cannot be read.
pub fn load_kernel_file(path: &Path) -> Option<Vec<u8>> {
    match fs::read(path) {
        Ok(bytes) => {
            info!("[KERNEL:LOAD] Read {} bytes from {}", bytes.len(), path.display());
            Some(bytes)
        }
        Err(e) => {
            warn!("[KERNEL:LOAD] Cannot read {}: {}", path.display(), e);
            None
        }
    }
}

/// How kernel launches are realized for a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelPath {
    Real {
        module: ModuleId,
        reset: KernelId,
        main: KernelId,
    },
    Simulated {
        reason: String,
    },
}

impl KernelPath {
    /// Compile `il` and create both kernels, falling back to `Simulated`.
    ///
    /// Only a failure to clean up after a partial load is an error.
    pub fn select<B: Backend>(
        backend: &mut B,
        context: ContextId,
        device: DeviceId,
        il: Option<&[u8]>,
    ) -> Result<Self> {
        let Some(il) = il else {
            return Ok(Self::simulated("no IL available"));
        };

        let module = match backend.create_module(context, device, il) {
            Ok(module) => module,
            Err(e) => return Ok(Self::simulated(format!("create_module: {}", e))),
        };

        let reset = match backend.create_kernel(module, RESET_KERNEL) {
            Ok(kernel) => kernel,
            Err(e) => {
                backend
                    .destroy_module(module)
                    .context("destroy_module after failed kernel load")?;
                return Ok(Self::simulated(format!("create_kernel: {}", e)));
            }
        };

        let main = match backend.create_kernel(module, MAIN_KERNEL) {
            Ok(kernel) => kernel,
            Err(e) => {
                backend
                    .destroy_kernel(reset)
                    .context("destroy_kernel after failed kernel load")?;
                backend
                    .destroy_module(module)
                    .context("destroy_module after failed kernel load")?;
                return Ok(Self::simulated(format!("create_kernel: {}", e)));
            }
        };

        info!("[KERNEL:PATH] Real kernels loaded from {}", module);
        Ok(KernelPath::Real {
            module,
            reset,
            main,
        })
    }

    fn simulated(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        warn!("[KERNEL:PATH] Using simulated kernels ({})", reason);
        KernelPath::Simulated { reason }
    }

    pub fn is_real(&self) -> bool {
        matches!(self, KernelPath::Real { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            KernelPath::Real { .. } => "real",
            KernelPath::Simulated { .. } => "simulated",
        }
    }

    pub fn kernel(&self, role: KernelRole) -> Option<KernelId> {
        match (self, role) {
            (KernelPath::Real { reset, .. }, KernelRole::Reset) => Some(*reset),
            (KernelPath::Real { main, .. }, KernelRole::Main) => Some(*main),
            (KernelPath::Simulated { .. }, _) => None,
        }
    }

    /// The command a planned launch becomes on this path.
    pub fn lower(&self, role: KernelRole, args: LaunchArgs) -> CommandOp {
        match self.kernel(role) {
            Some(kernel) => CommandOp::Launch { kernel, args },
            None => CommandOp::Barrier,
        }
    }

    /// Destroy kernels, then the module.
    pub fn destroy<B: Backend>(self, backend: &mut B) -> Result<()> {
        if let KernelPath::Real {
            module,
            reset,
            main,
        } = self
        {
            backend
                .destroy_kernel(main)
                .with_context(|| format!("destroy_kernel({})", main))?;
            backend
                .destroy_kernel(reset)
                .with_context(|| format!("destroy_kernel({})", reset))?;
            backend
                .destroy_module(module)
                .with_context(|| format!("destroy_module({})", module))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{spirv_module, SimulatedBackend};

    fn context(backend: &mut SimulatedBackend) -> (DeviceId, ContextId) {
        let device = backend.enumerate_devices().unwrap()[0];
        (device, backend.create_context(device).unwrap())
    }

    #[test]
    fn test_real_path_with_both_kernels() {
        let mut backend = SimulatedBackend::default();
        let (device, ctx) = context(&mut backend);
        let il = spirv_module(&[RESET_KERNEL, MAIN_KERNEL]);

        let path = KernelPath::select(&mut backend, ctx, device, Some(il.as_slice())).unwrap();
        assert!(path.is_real());
        assert!(matches!(
            path.lower(KernelRole::Main, LaunchArgs::single()),
            CommandOp::Launch { .. }
        ));

        path.destroy(&mut backend).unwrap();
        backend.destroy_context(ctx).unwrap();
        assert_eq!(backend.live_objects(), 0);
    }

    #[test]
    fn test_missing_kernel_falls_back_and_cleans_up() {
        let mut backend = SimulatedBackend::default();
        let (device, ctx) = context(&mut backend);
        let il = spirv_module(&[RESET_KERNEL]);

        let path = KernelPath::select(&mut backend, ctx, device, Some(il.as_slice())).unwrap();
        assert_eq!(path.name(), "simulated");
        assert_eq!(path.lower(KernelRole::Reset, LaunchArgs::single()), CommandOp::Barrier);

        // The partially loaded module was released
        backend.destroy_context(ctx).unwrap();
    }

    #[test]
    fn test_unreadable_or_invalid_il() {
        let mut backend = SimulatedBackend::default();
        let (device, ctx) = context(&mut backend);

        assert!(load_kernel_file(Path::new("/nonexistent/kernel.spv")).is_none());
        let none = KernelPath::select(&mut backend, ctx, device, None).unwrap();
        assert!(!none.is_real());
        let garbage = KernelPath::select(&mut backend, ctx, device, Some(&b"garbage!"[..])).unwrap();
        assert!(!garbage.is_real());
    }
}
