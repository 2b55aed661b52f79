//! SpreadView Simulator CLI
//!
//! Run deterministic estimation scenarios against a seeded ground truth.

use clap::Parser;
use spreadview_sim::{ScenarioId, ScenarioResult, ScenarioRunner};
use tracing::{error, info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// SpreadView Deterministic Simulation CLI
#[derive(Parser, Debug)]
#[command(name = "spreadview-sim")]
#[command(about = "Run deterministic simulation scenarios for SpreadView", long_about = None)]
struct Args {
    /// Master seed for determinism (0 = random from time)
    #[arg(short, long, default_value = "42")]
    seed: u64,

    /// Scenario to run (single_wiener, spread_pair, mean_reverting, outliers, async, all)
    #[arg(short = 'S', long, default_value = "all")]
    scenario: String,

    /// Number of consecutive seeds to test (for CI mode)
    #[arg(long, default_value = "1")]
    seeds: usize,

    /// Measurement steps per run
    #[arg(short = 'n', long, default_value = "200")]
    steps: usize,

    /// Mean spacing between measurements in seconds
    #[arg(long, default_value = "3600")]
    step_secs: f64,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// JSON output for CI parsing
    #[arg(long)]
    json: bool,

    /// Export per-step frames of a single scenario to a JSON file
    #[arg(long)]
    export: Option<String>,
}

fn main() {
    let args = Args::parse();

    // RUST_LOG wins over --verbose
    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase()));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .expect("Failed to set tracing subscriber");

    if !args.json {
        info!("SpreadView Simulator v{}", env!("CARGO_PKG_VERSION"));
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    }

    // Parse scenarios
    let scenarios: Vec<ScenarioId> = if args.scenario == "all" {
        ScenarioId::all()
    } else {
        vec![args.scenario.parse().unwrap_or_else(|e| {
            eprintln!("Error: {}", e);
            eprintln!("Available scenarios: single_wiener, spread_pair, mean_reverting, outliers, async, all");
            std::process::exit(1);
        })]
    };

    // Determine base seed
    let base_seed = if args.seed == 0 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(42)
    } else {
        args.seed
    };

    // Handle --export mode
    if let Some(export_path) = &args.export {
        if scenarios.len() > 1 {
            eprintln!("Error: --export only supports a single scenario, not 'all'");
            std::process::exit(1);
        }
        let scenario = scenarios[0];
        info!("Running with export to: {}", export_path);

        let runner = ScenarioRunner::new(base_seed)
            .with_steps(args.steps)
            .with_step_secs(args.step_secs);
        let outcome = runner
            .run_with_export(scenario)
            .and_then(|(result, export)| export.write_to_file(export_path).map(|_| (result, export)));

        match outcome {
            Ok((result, export)) if result.passed => {
                info!(
                    "✓ {} (seed={}) PASSED - exported {} frames to {}",
                    scenario.name(),
                    base_seed,
                    export.frames.len(),
                    export_path
                );
            }
            Ok((result, _)) => {
                error!(
                    "✗ {} FAILED: {}",
                    scenario.name(),
                    result.failure_reason.as_deref().unwrap_or("unknown")
                );
                std::process::exit(1);
            }
            Err(e) => {
                error!("✗ {} aborted: {}", scenario.name(), e);
                std::process::exit(1);
            }
        }
        return;
    }

    // Track results
    let mut all_results: Vec<ScenarioResult> = Vec::new();
    let mut failed_count = 0;

    for seed_offset in 0..args.seeds {
        let seed = base_seed.wrapping_add(seed_offset as u64);

        let runner = ScenarioRunner::new(seed)
            .with_steps(args.steps)
            .with_step_secs(args.step_secs);

        for scenario in &scenarios {
            let result = runner.run(*scenario);

            if !args.json {
                if result.passed {
                    info!(
                        "✓ {} (seed={}) PASSED rms={:.4}",
                        scenario.name(),
                        seed,
                        result.rms_error
                    );
                } else {
                    error!(
                        "✗ {} (seed={}) FAILED: {}",
                        scenario.name(),
                        seed,
                        result.failure_reason.as_deref().unwrap_or("unknown")
                    );
                }
            }

            if !result.passed {
                failed_count += 1;
            }

            all_results.push(result);
        }
    }

    // Summary
    let total = all_results.len();
    let passed = total - failed_count;

    if args.json {
        let summary = serde_json::json!({
            "total": total,
            "passed": passed,
            "failed": failed_count,
            "results": all_results.iter().map(|r| {
                serde_json::json!({
                    "scenario": r.scenario.name(),
                    "seed": r.seed,
                    "passed": r.passed,
                    "steps": r.steps,
                    "time_secs": r.final_time_secs,
                    "accepted": r.accepted,
                    "rejected": r.rejected,
                    "rms_error": r.rms_error,
                    "mean_loglikelihood": r.mean_loglikelihood,
                    "failure_reason": r.failure_reason,
                })
            }).collect::<Vec<_>>(),
        });
        match serde_json::to_string_pretty(&summary) {
            Ok(text) => println!("{}", text),
            Err(e) => {
                error!("Failed to serialize summary: {}", e);
                std::process::exit(1);
            }
        }
    } else {
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

        if failed_count == 0 {
            info!("✅ All {} scenario runs passed!", total);
        } else {
            error!("❌ {}/{} scenario runs failed!", failed_count, total);
            for result in &all_results {
                if !result.passed {
                    error!(
                        "  - {} seed={}: {}",
                        result.scenario.name(),
                        result.seed,
                        result.failure_reason.as_deref().unwrap_or("unknown")
                    );
                }
            }
        }
    }

    if failed_count > 0 {
        std::process::exit(1);
    }
}
