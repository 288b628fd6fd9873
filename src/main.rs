//! CLI entry point for the rotation simulator

use clap::{Parser, ValueEnum};
use rotation_sim::{
    config::SimulationConfig,
    montecarlo::{self, Strategy},
    simulation::run_fight,
};
use std::path::PathBuf;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "rotation-sim")]
#[command(version)]
#[command(about = "Rotation DPS simulator with Monte Carlo damage distribution", long_about = None)]
struct Args {
    /// Path to the simulation config file (YAML or JSON)
    #[arg(short, long)]
    config: PathBuf,

    /// Number of resampled fights (overrides the config)
    #[arg(short = 'n', long)]
    fights: Option<u64>,

    /// Resampling strategy (overrides the config)
    #[arg(short, long, value_enum)]
    strategy: Option<Strategy>,

    /// Base seed for reproducible runs
    #[arg(long)]
    seed: Option<u64>,

    /// Worker threads for the parallel strategy (0 = all cores)
    #[arg(short, long)]
    workers: Option<usize>,

    /// Output format
    #[arg(short, long, value_enum, default_value = "text")]
    output: OutputFormat,

    /// Show timing information
    #[arg(short, long, default_value = "false")]
    timing: bool,

    /// Print every damage record of the reference fight
    #[arg(long, default_value = "false")]
    ledger: bool,

    /// Stop resampling after this many milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let config = match SimulationConfig::from_file(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading config: {}", e);
            std::process::exit(1);
        }
    };

    let mut mc = config.montecarlo.clone();
    if let Some(fights) = args.fights {
        mc.fights = fights;
    }
    if let Some(strategy) = args.strategy {
        mc.strategy = strategy;
    }
    if let Some(workers) = args.workers {
        mc.workers = workers;
    }
    if args.seed.is_some() {
        mc.seed = args.seed;
    }
    if args.timeout_ms.is_some() {
        mc.timeout_ms = args.timeout_ms;
    }

    let start = Instant::now();
    let fight = match run_fight(&config) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("Fight simulation failed: {}", e);
            std::process::exit(1);
        }
    };
    let fight_elapsed = start.elapsed();

    let report = match montecarlo::analyze(&fight.ledger, fight.duration_ms, &mc) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("Monte Carlo analysis failed: {}", e);
            std::process::exit(1);
        }
    };
    let elapsed = start.elapsed();

    match args.output {
        OutputFormat::Text => {
            let title = if config.name.is_empty() { "Rotation" } else { config.name.as_str() };
            println!("=== {} ===", title);
            println!(
                "Fight: {:.1}s, {} records, {} actions ({} skipped)",
                fight.duration_ms as f64 / 1000.0,
                fight.ledger.len(),
                fight.executed,
                fight.skipped
            );
            if fight.target_defeated {
                println!("Target defeated at {:.1}s", fight.end_ms as f64 / 1000.0);
            }
            println!("Expected DPS: {:.2}", fight.dps);
            println!();

            if args.ledger {
                println!("--- Ledger ---");
                for r in fight.ledger.records() {
                    println!(
                        "{:>5} {:>9.3}s  {:<28} {:>10.1} ± {:.1}",
                        r.index,
                        r.timestamp as f64 / 1000.0,
                        r.label,
                        r.mean,
                        r.stddev
                    );
                }
                println!();
            }

            println!("--- Breakdown ---");
            for (label, hits, total) in fight.ledger.breakdown() {
                let share = if fight.total_mean > 0.0 { total / fight.total_mean * 100.0 } else { 0.0 };
                println!("{:<28} {:>4} hits {:>12.0} ({:>5.1}%)", label, hits, total, share);
            }
            println!();

            println!("--- Monte Carlo ({} fights, {}) ---", report.fights_run, report.strategy);
            println!(
                "Total damage: {:.0} ± {:.0} (stderr {:.1})",
                report.mean_total_damage, report.std_dev_total, report.stderr
            );
            println!("DPS: {:.2} ± {:.3}", report.mean_dps, report.stderr_dps);
            if report.approximate_percentiles {
                println!("(percentiles estimated from a reservoir sample)");
            }
            for q in &report.percentiles {
                println!("  p{:<6} {:>12.0}  {:>9.2} dps", q.p * 100.0, q.value, q.dps);
            }

            if args.timing {
                println!();
                println!("--- Performance ---");
                println!("Reference fight: {:.3}ms", fight_elapsed.as_secs_f64() * 1000.0);
                println!("Total time: {:.3}s", elapsed.as_secs_f64());
                println!(
                    "Fights/sec: {:.0}",
                    report.fights_run as f64 / elapsed.as_secs_f64().max(1e-9)
                );
            }
        }
        OutputFormat::Json => {
            let mut output = serde_json::json!({
                "fight": fight,
                "report": report,
            });
            if args.timing {
                output["elapsed_seconds"] = serde_json::json!(elapsed.as_secs_f64());
            }
            match serde_json::to_string_pretty(&output) {
                Ok(text) => println!("{}", text),
                Err(e) => {
                    eprintln!("Failed to serialize results: {}", e);
                    std::process::exit(1);
                }
            }
        }
    }
}
