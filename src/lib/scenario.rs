//! # Scenarios
//!
//! The built-in scenario records and their runners. Graph parameters are fixed
//! per scenario; only the scenario name is chosen at run time.
//!
//! | scenario          | events | target | layout                | probes            |
//! |-------------------|--------|--------|-----------------------|-------------------|
//! | `blocking-query`  | 500    | 250    | unified (cap. 1000)   | 250, 249, 251 x3  |
//! | `pool-comparison` | 16     | 9      | unified + partitioned | 9 x3 per layout   |
//! | `trace-replica`   | 16     | 9      | unified               | 9 x3              |
//! | `smoke`           | -      | -      | -                     | -                 |

use anyhow::{Context, Result};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{info, warn};

use crate::backend::{Backend, BackendError};
use crate::compare::{ComparisonHarness, ComparisonReport};
use crate::graph::{build_graph, TRACE_EVENTS, TRACE_TARGET};
use crate::harness::Session;
use crate::layout::EventId;
use crate::model::{PoolLayout, ScenarioConfig, Topology};
use crate::probe::{probe, LatencyBand, ProbeSeries, FAST_LIMIT_US};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Scenario {
    /// 500-event phased graph, probe the hub and its neighbours
    BlockingQuery,
    /// 16-event trace under unified and partitioned pools
    PoolComparison,
    /// 16-event kernel trace, probe the hub
    TraceReplica,
    /// Device discovery and context setup only
    Smoke,
}

impl Scenario {
    pub const ALL: [Scenario; 4] = [
        Scenario::Smoke,
        Scenario::TraceReplica,
        Scenario::PoolComparison,
        Scenario::BlockingQuery,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Scenario::BlockingQuery => "blocking-query",
            Scenario::PoolComparison => "pool-comparison",
            Scenario::TraceReplica => "trace-replica",
            Scenario::Smoke => "smoke",
        }
    }

    /// The fixed record, or `None` for scenarios that build no graph.
    pub fn config(self) -> Option<ScenarioConfig> {
        match self {
            Scenario::BlockingQuery => Some(
                ScenarioConfig::new(500, 10, 250)
                    .with_unified_capacity(1000)
                    .with_neighbors()
                    .with_buffer_bytes(40_000_000),
            ),
            Scenario::PoolComparison | Scenario::TraceReplica => Some(
                ScenarioConfig::new(TRACE_EVENTS, 0, TRACE_TARGET)
                    .with_topology(Topology::TraceReplica),
            ),
            Scenario::Smoke => None,
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Probes of a single-layout graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryReport {
    pub config: ScenarioConfig,
    pub kernel_path: String,
    pub commands: usize,
    pub edges: usize,
    pub launches: usize,
    pub series: Vec<ProbeSeries>,
}

impl QueryReport {
    /// Band of the very first query on the target.
    pub fn first_band(&self) -> Option<LatencyBand> {
        self.series.first().and_then(|s| s.first()).map(|m| m.band)
    }

    pub fn all_signaled(&self) -> bool {
        self.series.iter().all(ProbeSeries::all_signaled)
    }

    /// First target query is at or above the critical threshold.
    pub fn critical(&self) -> bool {
        self.series
            .first()
            .and_then(|s| s.first())
            .map_or(false, |m| m.duration_us >= FAST_LIMIT_US)
    }
}

impl fmt::Display for QueryReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} events, {} commands, {} edges, {} launches ({} kernels, {} layout)",
            self.config.event_count,
            self.commands,
            self.edges,
            self.launches,
            self.kernel_path,
            self.config.layout
        )?;
        for series in &self.series {
            writeln!(f, "  {}", series)?;
        }
        if let Some(band) = self.first_band() {
            writeln!(f, "  first query: {}", band)?;
        }
        write!(
            f,
            "  critical (>= {} us): {}",
            FAST_LIMIT_US,
            if self.critical() { "YES" } else { "no" }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmokeReport {
    pub devices: usize,
    pub context_ok: bool,
    pub stream_ok: bool,
}

impl fmt::Display for SmokeReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} device(s), context {}, stream {}",
            self.devices,
            if self.context_ok { "ok" } else { "FAILED" },
            if self.stream_ok { "ok" } else { "FAILED" }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "scenario", rename_all = "kebab-case")]
pub enum ScenarioReport {
    BlockingQuery(QueryReport),
    PoolComparison(ComparisonReport),
    TraceReplica(QueryReport),
    Smoke(SmokeReport),
}

impl fmt::Display for ScenarioReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScenarioReport::BlockingQuery(r) => write!(f, "[blocking-query] {}", r),
            ScenarioReport::PoolComparison(r) => write!(f, "[pool-comparison] {}", r),
            ScenarioReport::TraceReplica(r) => write!(f, "[trace-replica] {}", r),
            ScenarioReport::Smoke(r) => write!(f, "[smoke] {}", r),
        }
    }
}

/// Build `config`'s graph on one layout and probe its targets.
pub fn run_query<B: Backend>(
    backend: &mut B,
    config: &ScenarioConfig,
    il: Option<&[u8]>,
) -> Result<QueryReport> {
    let graph = build_graph(config)?;
    info!(
        "[SCENARIO:BUILD] {} commands, {} edges over {} events",
        graph.command_count(),
        graph.edges().len(),
        graph.event_count()
    );

    let mut session = Session::open(backend, config, il)?;
    let stats = session.build(&graph)?;

    let mut series = Vec::new();
    for target in config.probe_targets() {
        let event = EventId(target);
        let signal = session.signal(event)?;
        let measurements = probe(session.backend(), signal, config.repetitions)
            .with_context(|| format!("query_status({})", event))?;
        series.push(ProbeSeries::new(event, measurements));
    }

    let report = QueryReport {
        config: config.clone(),
        kernel_path: session.kernel_path().name().to_string(),
        commands: stats.commands,
        edges: graph.edges().len(),
        launches: stats.launches,
        series,
    };
    session.close()?;

    if !report.all_signaled() {
        warn!("[SCENARIO:PROBE] Some probed events are not signaled after a full sync");
    }
    Ok(report)
}

/// Enumerate devices, create a context and a stream, tear down.
pub fn run_smoke<B: Backend>(backend: &mut B) -> Result<SmokeReport> {
    let devices = backend.enumerate_devices().context("enumerate_devices")?;
    let device = *devices
        .first()
        .ok_or(BackendError::NoDevice)
        .context("enumerate_devices")?;
    info!("[SCENARIO:SMOKE] {} device(s) found", devices.len());

    let context = backend
        .create_context(device)
        .with_context(|| format!("create_context({})", device))?;
    let stream = backend
        .create_command_stream(context, device)
        .context("create_command_stream")?;
    backend
        .destroy_stream(stream)
        .with_context(|| format!("destroy_stream({})", stream))?;
    backend
        .destroy_context(context)
        .with_context(|| format!("destroy_context({})", context))?;

    Ok(SmokeReport {
        devices: devices.len(),
        context_ok: true,
        stream_ok: true,
    })
}

/// Run a built-in scenario.
pub fn run<B: Backend>(
    scenario: Scenario,
    backend: &mut B,
    il: Option<&[u8]>,
) -> Result<ScenarioReport> {
    info!("[SCENARIO:START] {}", scenario);
    let record = || {
        scenario
            .config()
            .with_context(|| format!("{} has no graph record", scenario))
    };

    let report = match scenario {
        Scenario::Smoke => ScenarioReport::Smoke(run_smoke(backend)?),
        Scenario::BlockingQuery => ScenarioReport::BlockingQuery(run_query(backend, &record()?, il)?),
        Scenario::TraceReplica => ScenarioReport::TraceReplica(run_query(
            backend,
            &record()?.with_layout(PoolLayout::Unified),
            il,
        )?),
        Scenario::PoolComparison => ScenarioReport::PoolComparison(
            ComparisonHarness::new(backend, record()?)
                .with_kernel_il(il.map(<[u8]>::to_vec))
                .run()?,
        ),
    };
    info!("[SCENARIO:DONE] {}", scenario);
    Ok(report)
}
