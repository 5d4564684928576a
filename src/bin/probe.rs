//! # Probe Process
//!
//! Runs one built-in scenario against the simulated backend and prints its
//! report. Graph parameters are fixed per scenario; the command line only
//! picks the scenario and where the JSON report goes.
//!
//! Exit status: 0 on completion, 1 on a backend or construction error, 124
//! when the watchdog fires.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::info;

use evq::kernel::{load_kernel_file, KERNEL_FILE};
use evq::{scenario, Scenario, ScenarioReport, SimulatedBackend, Watchdog};

#[derive(Parser, Debug)]
#[command(author, version, about = "Event query latency probe")]
struct Args {
    /// Scenario to run
    #[arg(value_enum)]
    scenario: Scenario,

    /// Output file for the JSON report
    #[arg(long)]
    out: Option<String>,

    /// Kernel IL module for the trace scenarios
    #[arg(long, default_value = KERNEL_FILE)]
    kernel: PathBuf,

    /// Watchdog limit in seconds
    #[arg(long, default_value = "60")]
    timeout_secs: u64,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!("[PROBE:INIT] Scenario: {}", args.scenario);
    let watchdog = Watchdog::arm(
        Duration::from_secs(args.timeout_secs),
        args.scenario.name(),
    );

    let il = match args.scenario {
        Scenario::TraceReplica | Scenario::PoolComparison => load_kernel_file(&args.kernel),
        Scenario::BlockingQuery | Scenario::Smoke => None,
    };

    let mut backend = SimulatedBackend::default();
    let start_time = Instant::now();
    let report = scenario::run(args.scenario, &mut backend, il.as_deref())
        .with_context(|| format!("scenario {} failed", args.scenario))?;
    let elapsed = start_time.elapsed();

    watchdog.disarm();

    println!("{}", report);
    info!(
        "[PROBE:DONE] Wall time: {:.2} ms",
        elapsed.as_secs_f64() * 1000.0
    );

    if let Some(ref out_file) = args.out {
        save_results(out_file, &report, elapsed)?;
    }

    Ok(())
}

fn save_results(path: &str, report: &ScenarioReport, elapsed: Duration) -> Result<()> {
    use serde_json::json;
    use std::fs::File;
    use std::io::Write;

    let results = json!({
        "probe": {
            "version": evq::VERSION,
            "wall_time_ms": elapsed.as_secs_f64() * 1000.0,
            "report": report,
        }
    });

    let mut file = File::create(path).with_context(|| format!("Failed to create {}", path))?;
    writeln!(file, "{}", serde_json::to_string_pretty(&results)?)?;
    info!("[PROBE:DONE] Saved results to {}", path);

    Ok(())
}
