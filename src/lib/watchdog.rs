//! Fixed-duration alarm for runs that may hang inside a status query.
//!
//! The harness itself has no timeouts. A `Watchdog` runs on its own thread
//! and, unless disarmed first, reports a timeout and ends the process with
//! [`TIMEOUT_EXIT_CODE`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::error;

/// Exit status of a run stopped by the watchdog.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

pub struct Watchdog {
    cancel: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
    fired: Arc<AtomicBool>,
}

impl Watchdog {
    /// Exit the process with [`TIMEOUT_EXIT_CODE`] after `limit`.
    pub fn arm(limit: Duration, label: impl Into<String>) -> Self {
        let label = label.into();
        Self::with_callback(
            limit,
            Box::new(move || {
                error!("[WATCHDOG:TIMEOUT] {} did not finish within {:?}", label, limit);
                println!("TIMEOUT: {} exceeded {:?}", label, limit);
                std::process::exit(TIMEOUT_EXIT_CODE);
            }),
        )
    }

    /// Run `on_expire` after `limit` unless disarmed first.
    pub fn with_callback(limit: Duration, on_expire: Box<dyn FnOnce() + Send>) -> Self {
        let (cancel, rx) = mpsc::channel::<()>();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);

        let handle = thread::spawn(move || {
            // A message or a dropped sender both mean disarm
            if let Err(RecvTimeoutError::Timeout) = rx.recv_timeout(limit) {
                flag.store(true, Ordering::SeqCst);
                on_expire();
            }
        });

        Self {
            cancel: Some(cancel),
            handle: Some(handle),
            fired,
        }
    }

    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    /// Stop the alarm. Returns whether it had already fired.
    pub fn disarm(mut self) -> bool {
        self.stop();
        self.has_fired()
    }

    fn stop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Backend;
    use crate::sim::{CostModel, SimulatedBackend};
    use std::process::Command;
    use std::time::Instant;

    /// Set in the re-executed test binary that hosts an armed watchdog.
    const STALLED_CHILD_ENV: &str = "EVQ_WATCHDOG_STALLED_CHILD";

    #[test]
    fn test_disarm_before_expiry() {
        let start = Instant::now();
        let watchdog = Watchdog::with_callback(Duration::from_secs(30), Box::new(|| {}));
        assert!(!watchdog.disarm());
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_fires_on_stalled_query() {
        let mut backend = SimulatedBackend::default()
            .with_cost_model(CostModel::free().with_stall(Duration::from_millis(300)));
        let device = backend.enumerate_devices().unwrap()[0];
        let ctx = backend.create_context(device).unwrap();
        let pool = backend.create_signal_pool(ctx, 1).unwrap();
        let signal = backend.create_signal(pool, 0).unwrap();

        let expired = Arc::new(AtomicBool::new(false));
        let seen = Arc::clone(&expired);
        let watchdog = Watchdog::with_callback(
            Duration::from_millis(20),
            Box::new(move || seen.store(true, Ordering::SeqCst)),
        );

        backend.query_status(signal).unwrap();
        assert!(watchdog.has_fired());
        assert!(watchdog.disarm());
        assert!(expired.load(Ordering::SeqCst));
    }

    #[test]
    fn test_arm_exits_with_timeout_code() {
        if std::env::var_os(STALLED_CHILD_ENV).is_some() {
            let _watchdog = Watchdog::arm(Duration::from_millis(50), "stalled-run");
            thread::sleep(Duration::from_secs(20));
            return;
        }

        let output = Command::new(std::env::current_exe().unwrap())
            .args([
                "--exact",
                "watchdog::tests::test_arm_exits_with_timeout_code",
                "--nocapture",
                "--test-threads=1",
            ])
            .env(STALLED_CHILD_ENV, "1")
            .output()
            .unwrap();

        assert_eq!(output.status.code(), Some(TIMEOUT_EXIT_CODE));
        let stdout = String::from_utf8_lossy(&output.stdout);
        assert!(
            stdout.contains("TIMEOUT: stalled-run exceeded"),
            "stdout was: {}",
            stdout
        );
    }
}
