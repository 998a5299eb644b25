//! Heterogeneity Simulator CLI
//!
//! Run deterministic heterogeneity scenarios against simulated participants.

use clap::Parser;
use hetero_sim::profiles::Axis;
use hetero_sim::scenarios::ScenarioId;
use hetero_sim::{ScenarioResult, ScenarioRunner, SimConfig, SimContext};
use tracing::{error, info, Level};
use tracing_subscriber::EnvFilter;

/// Heterogeneity Simulator CLI
#[derive(Parser, Debug)]
#[command(name = "hetero-sim")]
#[command(about = "Run deterministic heterogeneous participant simulations", long_about = None)]
struct Args {
    /// Master seed for determinism (0 = random from time)
    #[arg(short, long)]
    seed: Option<u64>,

    /// Number of simulated participants
    #[arg(short, long)]
    participants: Option<usize>,

    /// Scenario to run (ideal, dropout, stragglers, churn, diurnal, incomplete, bandwidth, async_periodic, all)
    #[arg(short = 'S', long, default_value = "all")]
    scenario: String,

    /// Coordinator rounds per run
    #[arg(short, long)]
    rounds: Option<u64>,

    /// Number of consecutive seeds to test (for CI mode)
    #[arg(long, default_value = "1")]
    seeds: usize,

    /// JSON file with a base SimConfig
    #[arg(short, long)]
    config: Option<String>,

    /// Availability mode override, e.g. HOMO-0.2
    #[arg(long)]
    availability: Option<String>,

    /// Connectivity mode override, e.g. HOMO-0.05
    #[arg(long)]
    connectivity: Option<String>,

    /// Completeness mode override, e.g. PDU-0.5
    #[arg(long)]
    completeness: Option<String>,

    /// Responsiveness mode override, e.g. LN-100-10
    #[arg(long)]
    responsiveness: Option<String>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// JSON output for CI parsing
    #[arg(long)]
    json: bool,

    /// Export per-round records of a single scenario to a JSON file
    #[arg(long)]
    export: Option<String>,
}

fn init_logging(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter).finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
    }
}

fn base_config(args: &Args) -> SimConfig {
    let mut config = match &args.config {
        Some(path) => SimConfig::from_json_file(path).unwrap_or_else(|e| {
            eprintln!("Error: {}: {}", path, e);
            std::process::exit(1);
        }),
        None => SimConfig::default(),
    };

    match args.seed {
        Some(0) => config.seed = SimContext::unseeded().seed(),
        Some(seed) => config.seed = seed,
        None => {}
    }
    if let Some(participants) = args.participants {
        config.num_participants = participants;
    }
    if let Some(rounds) = args.rounds {
        config.num_rounds = rounds;
    }
    config
}

fn with_overrides(mut runner: ScenarioRunner, args: &Args) -> ScenarioRunner {
    let overrides = [
        (Axis::Availability, &args.availability),
        (Axis::Connectivity, &args.connectivity),
        (Axis::Completeness, &args.completeness),
        (Axis::Responsiveness, &args.responsiveness),
    ];
    for (axis, mode) in overrides {
        if let Some(mode) = mode {
            runner = runner.with_override(axis, mode.clone());
        }
    }
    runner
}

fn main() {
    let args = Args::parse();
    init_logging(args.verbose);

    if !args.json {
        info!("Heterogeneity Simulator v{}", env!("CARGO_PKG_VERSION"));
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    }

    // Parse scenarios
    let scenarios: Vec<ScenarioId> = if args.scenario == "all" {
        ScenarioId::all()
    } else {
        vec![args.scenario.parse().unwrap_or_else(|e| {
            eprintln!("Error: {}", e);
            let names: Vec<&str> = ScenarioId::all().iter().map(|s| s.name()).collect();
            eprintln!("Available scenarios: {}, all", names.join(", "));
            std::process::exit(1);
        })]
    };

    let base = base_config(&args);

    // Handle --export mode
    if let Some(export_path) = &args.export {
        if scenarios.len() > 1 {
            eprintln!("Error: --export only supports a single scenario, not 'all'");
            std::process::exit(1);
        }

        let runner = with_overrides(ScenarioRunner::from_config(base.clone()), &args);
        let (result, export) = runner.run_with_export(scenarios[0]);

        if let Err(e) = export.write_to_file(export_path) {
            error!("Failed to write export: {:?}", e);
            std::process::exit(1);
        }
        info!("Exported {} rounds to {}", export.rounds.len(), export_path);

        if !result.passed {
            error!(
                "✗ {} FAILED: {}",
                scenarios[0].name(),
                result.failure_reason.as_deref().unwrap_or("unknown")
            );
            std::process::exit(1);
        }
        return;
    }

    // Track results
    let mut all_results: Vec<ScenarioResult> = Vec::new();
    let mut failed_count = 0;

    for seed_offset in 0..args.seeds {
        let config = SimConfig {
            seed: base.seed.wrapping_add(seed_offset as u64),
            ..base.clone()
        };
        let runner = with_overrides(ScenarioRunner::from_config(config), &args);

        for scenario in &scenarios {
            let result = runner.run(*scenario);

            if !args.json {
                if result.passed {
                    info!(
                        "✓ {} (seed={}) PASSED: {} rounds, {}/{} delivered, t={}",
                        scenario.name(),
                        result.seed,
                        result.rounds,
                        result.metrics.packages_received,
                        result.metrics.selected,
                        result.final_time
                    );
                } else {
                    error!(
                        "✗ {} (seed={}) FAILED: {}",
                        scenario.name(),
                        result.seed,
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
            "results": all_results,
        });
        match serde_json::to_string_pretty(&summary) {
            Ok(json) => println!("{}", json),
            Err(e) => {
                eprintln!("Error: cannot serialize results: {}", e);
                std::process::exit(1);
            }
        }
    } else {
        info!("");
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

    // Exit with proper code for CI
    if failed_count > 0 {
        std::process::exit(1);
    }
}
