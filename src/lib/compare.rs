//! # Comparison Harness
//!
//! Realizes one logical topology under the unified and the partitioned pool
//! layouts, probes the same logical target in each and reports how much
//! slower the partitioned query is. Both runs use fresh sessions on the same
//! backend; no run is retried.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{info, warn};

use crate::backend::Backend;
use crate::graph::{build_graph, DependencyGraph};
use crate::harness::Session;
use crate::layout::EventId;
use crate::model::{PoolLayout, ScenarioConfig};
use crate::probe::{probe, ProbeSeries};

/// Ratio at or above which the regression is confirmed.
pub const CONFIRMED_RATIO: f64 = 10.0;
/// Ratio at or above which the regression is partial.
pub const PARTIAL_RATIO: f64 = 1.5;
/// Partitioned query time that confirms the regression on its own.
pub const CONFIRMED_PARTITIONED_US: u64 = 1_000;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    ConfirmedRegression,
    Partial,
    Inconclusive,
}

impl Verdict {
    pub fn classify(ratio: f64, partitioned_us: u64) -> Self {
        if ratio >= CONFIRMED_RATIO || partitioned_us > CONFIRMED_PARTITIONED_US {
            Verdict::ConfirmedRegression
        } else if ratio >= PARTIAL_RATIO {
            Verdict::Partial
        } else {
            Verdict::Inconclusive
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::ConfirmedRegression => write!(f, "CONFIRMED REGRESSION"),
            Verdict::Partial => write!(f, "PARTIAL"),
            Verdict::Inconclusive => write!(f, "INCONCLUSIVE"),
        }
    }
}

/// `partitioned / unified`, with the denominator clamped to 1µs.
pub fn slowdown_ratio(unified_us: u64, partitioned_us: u64) -> f64 {
    partitioned_us as f64 / unified_us.max(1) as f64
}

/// Result of one layout's run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayoutRun {
    pub layout: PoolLayout,
    pub pool_capacities: Vec<u32>,
    pub kernel_path: String,
    pub series: ProbeSeries,
}

impl LayoutRun {
    /// Fastest query of the run, in microseconds.
    pub fn duration_us(&self) -> u64 {
        self.series.fastest_us().unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonReport {
    pub target: EventId,
    pub unified: LayoutRun,
    pub partitioned: LayoutRun,
    pub slowdown_ratio: f64,
    pub verdict: Verdict,
}

impl fmt::Display for ComparisonReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Pool layout comparison on {}", self.target)?;
        for run in [&self.unified, &self.partitioned] {
            writeln!(
                f,
                "  {:<12} pools {:?} ({} kernels): {} us  [{}]",
                run.layout.to_string(),
                run.pool_capacities,
                run.kernel_path,
                run.duration_us(),
                run.series
            )?;
        }
        writeln!(f, "  slowdown: {:.1}x", self.slowdown_ratio)?;
        write!(f, "  verdict: {}", self.verdict)
    }
}

/// Runs a scenario record under both layouts.
pub struct ComparisonHarness<'a, B: Backend> {
    backend: &'a mut B,
    config: ScenarioConfig,
    il: Option<Vec<u8>>,
}

impl<'a, B: Backend> ComparisonHarness<'a, B> {
    pub fn new(backend: &'a mut B, config: ScenarioConfig) -> Self {
        Self {
            backend,
            config,
            il: None,
        }
    }

    /// Kernel module source for topologies that launch kernels
    pub fn with_kernel_il(mut self, il: Option<Vec<u8>>) -> Self {
        self.il = il;
        self
    }

    fn run_layout(&mut self, graph: &DependencyGraph, layout: PoolLayout) -> Result<LayoutRun> {
        let config = self.config.clone().with_layout(layout);
        let target = EventId(config.target_event);

        let mut session = Session::open(&mut *self.backend, &config, self.il.as_deref())?;
        session.build(graph)?;
        let signal = session.signal(target)?;
        let measurements = probe(session.backend(), signal, config.repetitions)
            .with_context(|| format!("query_status({})", signal))?;
        let run = LayoutRun {
            layout,
            pool_capacities: session.pool_capacities()?,
            kernel_path: session.kernel_path().name().to_string(),
            series: ProbeSeries::new(target, measurements),
        };
        session.close()?;

        info!(
            "[COMPARE:RUN] {} layout: {} pool(s), fastest query {} us",
            layout,
            run.pool_capacities.len(),
            run.duration_us()
        );
        Ok(run)
    }

    pub fn run(mut self) -> Result<ComparisonReport> {
        self.config.validate()?;
        let graph = build_graph(&self.config)?;

        let unified = self.run_layout(&graph, PoolLayout::Unified)?;
        let partitioned = self.run_layout(&graph, PoolLayout::Partitioned)?;

        let ratio = slowdown_ratio(unified.duration_us(), partitioned.duration_us());
        let verdict = Verdict::classify(ratio, partitioned.duration_us());
        if verdict == Verdict::Inconclusive {
            warn!("[COMPARE:VERDICT] No measurable slowdown ({:.2}x)", ratio);
        } else {
            info!("[COMPARE:VERDICT] {} ({:.1}x)", verdict, ratio);
        }

        Ok(ComparisonReport {
            target: EventId(self.config.target_event),
            unified,
            partitioned,
            slowdown_ratio: ratio,
            verdict,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::TRACE_TARGET;
    use crate::model::Topology;
    use crate::sim::{CostModel, SimulatedBackend};

    fn trace_config() -> ScenarioConfig {
        ScenarioConfig::new(16, 0, TRACE_TARGET)
            .with_topology(Topology::TraceReplica)
            .with_repetitions(5)
    }

    #[test]
    fn test_verdict_thresholds() {
        assert_eq!(Verdict::classify(12.0, 50), Verdict::ConfirmedRegression);
        assert_eq!(Verdict::classify(1.0, 1_500), Verdict::ConfirmedRegression);
        assert_eq!(Verdict::classify(1.5, 10), Verdict::Partial);
        assert_eq!(Verdict::classify(1.2, 10), Verdict::Inconclusive);
        assert_eq!(slowdown_ratio(0, 40), 40.0);
        assert_eq!(slowdown_ratio(4, 40), 10.0);
    }

    #[test]
    fn test_partitioned_is_never_faster() {
        let mut backend = SimulatedBackend::default();
        for _ in 0..10 {
            let report = ComparisonHarness::new(&mut backend, trace_config())
                .run()
                .unwrap();

            assert_eq!(report.unified.pool_capacities, vec![16]);
            assert_eq!(report.partitioned.pool_capacities, vec![4, 2, 3, 6, 1]);
            assert!(report.partitioned.duration_us() >= report.unified.duration_us());
            assert!(report.unified.series.all_signaled());
            assert!(report.partitioned.series.all_signaled());
            assert_eq!(report.partitioned.series.measurements.len(), 5);
            assert_ne!(report.verdict, Verdict::Inconclusive);
            assert_eq!(backend.live_objects(), 0);
        }
    }

    #[test]
    fn test_free_cost_model_stays_fast() {
        let mut backend = SimulatedBackend::default().with_cost_model(CostModel::free());
        let report = ComparisonHarness::new(&mut backend, trace_config())
            .run()
            .unwrap();
        // Pool crossings cost nothing here
        assert!(report.partitioned.duration_us() < CONFIRMED_PARTITIONED_US);
    }
}
