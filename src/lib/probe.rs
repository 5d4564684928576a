//! # Latency Prober
//!
//! Times repeated non-blocking status queries on one signal and sorts each
//! result into a latency band. The prober never retries, never changes signal
//! state and has no timeout of its own; a query that never returns is the
//! watchdog's business.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::backend::{Backend, BackendResult};
use crate::layout::EventId;
use crate::model::{SignalId, SignalStatus};

/// Upper bound (exclusive) of the fast band, in microseconds.
pub const FAST_LIMIT_US: u64 = 100;
/// Upper bound (inclusive) of the elevated band, in microseconds.
pub const BLOCKING_LIMIT_US: u64 = 1_000;

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LatencyBand {
    /// Under 100µs
    Fast,
    /// 100µs to 1ms
    Elevated,
    /// Over 1ms
    Blocking,
}

impl LatencyBand {
    pub fn classify(duration_us: u64) -> Self {
        if duration_us < FAST_LIMIT_US {
            LatencyBand::Fast
        } else if duration_us <= BLOCKING_LIMIT_US {
            LatencyBand::Elevated
        } else {
            LatencyBand::Blocking
        }
    }
}

impl fmt::Display for LatencyBand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LatencyBand::Fast => write!(f, "fast"),
            LatencyBand::Elevated => write!(f, "elevated"),
            LatencyBand::Blocking => write!(f, "BLOCKING"),
        }
    }
}

/// One timed query.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Measurement {
    pub duration_us: u64,
    pub status: SignalStatus,
    pub band: LatencyBand,
}

impl Measurement {
    pub fn new(duration: Duration, status: SignalStatus) -> Self {
        let duration_us = duration.as_micros() as u64;
        Self {
            duration_us,
            status,
            band: LatencyBand::classify(duration_us),
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::from_micros(self.duration_us)
    }
}

/// Issue `repetitions` back-to-back queries on `signal`.
pub fn probe<B: Backend>(
    backend: &B,
    signal: SignalId,
    repetitions: usize,
) -> BackendResult<Vec<Measurement>> {
    let mut measurements = Vec::with_capacity(repetitions);
    for rep in 0..repetitions {
        let start = Instant::now();
        let status = backend.query_status(signal)?;
        let m = Measurement::new(start.elapsed(), status);
        debug!(
            "[PROBE:QUERY] {} #{}: {} in {} us ({})",
            signal,
            rep + 1,
            m.status,
            m.duration_us,
            m.band
        );
        measurements.push(m);
    }
    Ok(measurements)
}

/// Measurements taken on one logical event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeSeries {
    pub event: EventId,
    pub measurements: Vec<Measurement>,
}

impl ProbeSeries {
    pub fn new(event: EventId, measurements: Vec<Measurement>) -> Self {
        Self {
            event,
            measurements,
        }
    }

    pub fn first(&self) -> Option<&Measurement> {
        self.measurements.first()
    }

    /// Shortest query in the series.
    pub fn fastest_us(&self) -> Option<u64> {
        self.measurements.iter().map(|m| m.duration_us).min()
    }

    pub fn slowest_us(&self) -> Option<u64> {
        self.measurements.iter().map(|m| m.duration_us).max()
    }

    pub fn worst_band(&self) -> Option<LatencyBand> {
        self.measurements.iter().map(|m| m.band).max()
    }

    pub fn all_signaled(&self) -> bool {
        self.measurements.iter().all(|m| m.status.is_signaled())
    }
}

impl fmt::Display for ProbeSeries {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.event)?;
        for m in &self.measurements {
            write!(f, " {}us/{}/{}", m.duration_us, m.status, m.band)?;
        }
        Ok(())
    }
}
