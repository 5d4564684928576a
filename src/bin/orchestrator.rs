// Orchestrator - Runs every scenario as a child probe process
// Enforces a wall-clock bound per child and aggregates their reports

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use evq::{Scenario, TIMEOUT_EXIT_CODE};

#[derive(Parser, Debug, Serialize)]
#[command(author, version, about = "Orchestrator for event query probe scenarios")]
struct Args {
    /// Scenarios to run (default: all)
    #[arg(long, value_enum, value_delimiter = ',')]
    scenarios: Vec<Scenario>,

    /// Path to the probe binary
    #[arg(long, default_value = "./target/release/probe")]
    probe_bin: PathBuf,

    /// Kernel IL module passed to the probes
    #[arg(long, default_value = "kernel.spv")]
    kernel: PathBuf,

    /// Wall-clock bound per child in seconds
    #[arg(long, default_value = "120")]
    timeout_secs: u64,

    /// Results directory
    #[arg(long, default_value = "results/orchestrated")]
    out_dir: String,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

/// How a child probe ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
enum Outcome {
    Completed,
    Failed { code: Option<i32> },
    TimedOut { killed: bool },
}

impl Outcome {
    fn from_status(status: ExitStatus) -> Self {
        match status.code() {
            Some(0) => Outcome::Completed,
            Some(TIMEOUT_EXIT_CODE) => Outcome::TimedOut { killed: false },
            code => Outcome::Failed { code },
        }
    }
}

fn main() -> Result<()> {
    let mut args = Args::parse();
    if args.scenarios.is_empty() {
        args.scenarios = Scenario::ALL.to_vec();
    }

    let filter = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!("[ORCHESTRATOR:INIT] Starting orchestration");
    info!(
        "[ORCHESTRATOR:INIT] Scenarios: {:?}, bound: {} s",
        args.scenarios.iter().map(|s| s.name()).collect::<Vec<_>>(),
        args.timeout_secs
    );

    fs::create_dir_all(&args.out_dir).context("Failed to create results directory")?;

    // Save orchestrator arguments and the fixed scenario records
    let config_path = Path::new(&args.out_dir).join("config.json");
    let records: serde_json::Map<String, Value> = args
        .scenarios
        .iter()
        .map(|s| -> Result<(String, Value)> {
            Ok((s.name().to_string(), serde_json::to_value(s.config())?))
        })
        .collect::<Result<_>>()?;
    let config_json = serde_json::to_string_pretty(&json!({
        "orchestrator": &args,
        "scenarios": records,
    }))
    .context("Failed to serialize config")?;
    fs::write(&config_path, config_json)
        .with_context(|| format!("Failed to write config to {:?}", config_path))?;

    let start_time = Instant::now();
    let bound = Duration::from_secs(args.timeout_secs);
    let mut outcomes = Vec::new();

    for scenario in &args.scenarios {
        let mut child = start_probe(&args, *scenario)?;
        info!(
            "[ORCHESTRATOR:START] Started {} (PID: {:?})",
            scenario,
            child.id()
        );

        let outcome = wait_with_bound(&mut child, bound)
            .with_context(|| format!("Failed waiting for {}", scenario))?;
        match &outcome {
            Outcome::Completed => info!("[ORCHESTRATOR:SYNC] {} completed successfully", scenario),
            Outcome::Failed { code } => {
                error!("[ORCHESTRATOR:ERROR] {} failed with status: {:?}", scenario, code)
            }
            Outcome::TimedOut { killed } => warn!(
                "[ORCHESTRATOR:TIMEOUT] {} timed out (killed by orchestrator: {})",
                scenario, killed
            ),
        }
        outcomes.push((*scenario, outcome));
    }

    let elapsed = start_time.elapsed();
    info!(
        "[ORCHESTRATOR:DONE] Orchestrator complete. Total time: {:.2} ms",
        elapsed.as_secs_f64() * 1000.0
    );

    aggregate_results(&args.out_dir, &outcomes)?;

    Ok(())
}

fn report_path(out_dir: &str, scenario: Scenario) -> PathBuf {
    Path::new(out_dir).join(format!("{}.json", scenario.name()))
}

fn start_probe(args: &Args, scenario: Scenario) -> Result<Child> {
    let mut cmd = Command::new(&args.probe_bin);

    cmd.arg(scenario.name())
        .arg("--out")
        .arg(report_path(&args.out_dir, scenario))
        .arg("--kernel")
        .arg(&args.kernel)
        // The child's own watchdog fires first; ours is the backstop
        .arg("--timeout-secs")
        .arg(args.timeout_secs.saturating_sub(1).max(1).to_string());

    if args.verbose {
        cmd.arg("--verbose");
    }

    cmd.stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .spawn()
        .with_context(|| format!("Failed to start probe for {}", scenario))
}

fn wait_with_bound(child: &mut Child, bound: Duration) -> Result<Outcome> {
    let start = Instant::now();

    loop {
        if let Some(status) = child.try_wait()? {
            debug!("[ORCHESTRATOR:SYNC] Child exited with {:?}", status);
            return Ok(Outcome::from_status(status));
        }

        if start.elapsed() > bound {
            child.kill().context("Failed to kill child")?;
            child.wait()?;
            return Ok(Outcome::TimedOut { killed: true });
        }

        thread::sleep(Duration::from_millis(10));
    }
}

/// One-line summary of a saved probe report.
fn summarize(report: &Value) -> Option<String> {
    let report = report.get("probe")?.get("report")?;
    match report.get("scenario")?.as_str()? {
        "pool-comparison" => Some(format!(
            "verdict {} ({:.1}x)",
            report.get("verdict")?,
            report.get("slowdown_ratio")?.as_f64()?
        )),
        "blocking-query" | "trace-replica" => {
            let first = report.get("series")?.get(0)?.get("measurements")?.get(0)?;
            Some(format!(
                "first query {} us ({})",
                first.get("duration_us")?,
                first.get("band")?
            ))
        }
        "smoke" => Some(format!("{} device(s)", report.get("devices")?)),
        _ => None,
    }
}

fn aggregate_results(out_dir: &str, outcomes: &[(Scenario, Outcome)]) -> Result<()> {
    let mut summary = serde_json::Map::new();

    for (scenario, outcome) in outcomes {
        let path = report_path(out_dir, *scenario);
        let report = fs::read_to_string(&path)
            .ok()
            .and_then(|data| serde_json::from_str::<Value>(&data).ok());

        if let Some(line) = report.as_ref().and_then(summarize) {
            info!("[ORCHESTRATOR:RESULTS] {}: {}", scenario, line);
        }

        summary.insert(
            scenario.name().to_string(),
            json!({
                "outcome": outcome,
                "report": report,
            }),
        );
    }

    let summary_path = Path::new(out_dir).join("summary.json");
    fs::write(&summary_path, serde_json::to_string_pretty(&summary)?)
        .with_context(|| format!("Failed to write summary to {:?}", summary_path))?;
    info!("[ORCHESTRATOR:RESULTS] Results aggregated in: {}", out_dir);

    Ok(())
}
