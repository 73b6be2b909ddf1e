use crate::config::config::StateManagerConfig;
use crate::config::types::{OpcodeFlavor, SearcherKind};
use crate::config::validator::validate_config;
use crate::kernel::signal::ShutdownSignals;
use crate::testing::program::PathEnd;
use crate::testing::{run_campaign, run_convergence_proof, CampaignSpec, ConvergenceProofConfig};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Config file (defaults to ./statemgr.json when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a multi-process exploration campaign over a fan-out guest program
    Campaign {
        /// Number of worker processes
        #[arg(long, default_value_t = 2)]
        workers: usize,
        /// How each path of the guest program ends
        #[arg(
            long,
            value_enum,
            value_delimiter = ',',
            default_values_t = [PathEnd::Succeed, PathEnd::Exit, PathEnd::Succeed]
        )]
        paths: Vec<PathEnd>,
        /// Stagnation timeout in seconds (0 disables)
        #[arg(long)]
        timeout: Option<u64>,
        /// Base state selection policy
        #[arg(long, value_enum)]
        searcher: Option<SearcherKind>,
        /// Custom instruction encoding
        #[arg(long, value_enum)]
        opcode_layout: Option<OpcodeFlavor>,
        /// Stop each worker after this many dispatched instructions
        #[arg(long)]
        max_steps: Option<u64>,
        /// Print the outcome as JSON
        #[arg(long)]
        json: bool,
    },
    /// Run randomised in-process fleets and verify single-survivor convergence
    Prove {
        #[arg(long, default_value_t = 20)]
        iterations: usize,
        #[arg(long, default_value_t = 4)]
        max_processes: usize,
        #[arg(long, default_value_t = 6)]
        max_paths: usize,
        /// Percentage of paths that signal success
        #[arg(long, default_value_t = 40)]
        success_percent: u8,
        #[arg(long, default_value_t = 0x5eed)]
        seed: u64,
    },
    /// Validate a config file and print the effective settings
    CheckConfig,
}

fn load_config(path: Option<&PathBuf>) -> Result<StateManagerConfig> {
    let config = match path {
        Some(path) => StateManagerConfig::load_from_file(path)?,
        None => StateManagerConfig::load_default()?,
    };
    Ok(config)
}

pub fn run() -> Result<()> {
    env_logger::init();

    let signals = ShutdownSignals::install()
        .map_err(|e| anyhow::anyhow!("Failed to install signal handlers: {}", e))?;

    let cli = Cli::parse();
    let mut config = load_config(cli.config.as_ref())?;

    match cli.command {
        Commands::Campaign {
            workers,
            paths,
            timeout,
            searcher,
            opcode_layout,
            max_steps,
            json,
        } => {
            if let Some(timeout) = timeout {
                config.timeout_secs = timeout;
            }
            if let Some(searcher) = searcher {
                config.searcher = searcher;
            }
            if let Some(layout) = opcode_layout {
                config.opcode_layout = layout;
            }
            config.max_processes = workers;
            validate_config(&config).context("invalid campaign configuration")?;

            eprintln!(
                "Starting campaign: {} workers, paths {:?}, timeout {}s, searcher {}",
                workers, paths, config.timeout_secs, config.searcher
            );
            let outcome = run_campaign(&CampaignSpec {
                workers,
                paths,
                config,
                max_steps,
            })?;

            if json {
                println!("{}", serde_json::to_string_pretty(&outcome)?);
            } else {
                for (slot, report) in &outcome.reports {
                    println!(
                        "worker {:>2}: succeeded={} terminated={} survivors={}",
                        slot, report.succeeded, report.terminated, report.survivors
                    );
                }
                println!(
                    "campaign {}: {} succeeded, {} survivor(s)",
                    outcome.campaign_id,
                    outcome.succeeded(),
                    outcome.survivors()
                );
            }

            if signals.received() != 0 {
                eprintln!("Campaign interrupted by signal {}", signals.received());
                std::process::exit(130);
            }
            if !outcome.is_clean() || !outcome.is_converged() {
                eprintln!(
                    "Campaign ended unclean: failed workers {:?}, leftover successes {}, \
                     {} survivor(s) for {} success(es)",
                    outcome.failed_workers,
                    outcome.leftover_success_count,
                    outcome.survivors(),
                    outcome.succeeded()
                );
                std::process::exit(1);
            }
            Ok(())
        }
        Commands::Prove {
            iterations,
            max_processes,
            max_paths,
            success_percent,
            seed,
        } => {
            let proof = ConvergenceProofConfig {
                iterations,
                max_processes,
                max_paths,
                success_percent,
                seed,
                ..Default::default()
            };
            let result = run_convergence_proof(&proof)?;
            println!(
                "convergence proof: {}/{} iterations passed",
                result.passes, result.iterations
            );
            for violation in &result.violations {
                println!("  violation: {}", violation);
            }
            if !result.is_pass() {
                std::process::exit(1);
            }
            Ok(())
        }
        Commands::CheckConfig => {
            let validation = validate_config(&config)?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            for warning in &validation.warnings {
                eprintln!("warning: {}", warning);
            }
            eprintln!("Configuration is valid");
            Ok(())
        }
    }
}
