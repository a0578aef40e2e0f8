//! Scenario command line
//!
//! Operates on the RocksDB store configured through `SCENARIO_*` variables.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use scenario::config::print_env_help;
use scenario::{Assignment, Identity, RocksStorage, ScenarioConfig, ScenarioManager};

#[derive(Parser)]
#[command(name = "scenario")]
#[command(about = "Scenario - split testing assignments and reports")]
#[command(version)]
struct Cli {
    /// Storage directory (overrides SCENARIO_STORAGE_PATH)
    #[arg(long, global = true)]
    storage: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print (and create if needed) the treatment for an identity
    Assign {
        experiment: String,
        identity: String,

        /// Only look up, never create an assignment
        #[arg(long)]
        no_create: bool,
    },

    /// Record a goal completion for an identity
    Complete { experiment: String, identity: String },

    /// Print the analysis report as JSON
    Report { experiment: String },

    /// List stored experiments
    List,

    /// Remove an experiment's assignments
    Clear {
        experiment: String,

        /// Delete the experiment definition too
        #[arg(long)]
        delete: bool,
    },

    /// Describe configuration environment variables
    EnvHelp,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    if matches!(cli.command, Commands::EnvHelp) {
        print_env_help();
        return Ok(());
    }

    if let Err(e) = scenario::tracing_setup::init_tracing() {
        eprintln!("Failed to initialize logging: {e}");
    }
    if let Err(e) = scenario::metrics::register_metrics() {
        tracing::warn!("Failed to register metrics: {}", e);
    }

    let mut config = ScenarioConfig::from_env();
    if let Some(path) = cli.storage {
        config.storage_path = path;
    }
    config.log();

    let storage = RocksStorage::from_config(&config)
        .with_context(|| format!("Failed to open storage at {:?}", config.storage_path))?;
    let manager = ScenarioManager::new(Arc::new(storage), config);

    match cli.command {
        Commands::Assign {
            experiment,
            identity,
            no_create,
        } => {
            let identity = Identity::new(identity)?;
            match manager.treatment(&experiment, &identity, !no_create)? {
                Some(Assignment::Single(t)) => println!("{}", t.name()),
                Some(Assignment::Composite { treatments, .. }) => {
                    for (variant, t) in treatments {
                        println!("{variant}\t{}", t.name());
                    }
                }
                None => println!("(unassigned)"),
            }
        }
        Commands::Complete {
            experiment,
            identity,
        } => {
            let identity = Identity::new(identity)?;
            let finished = manager.complete(&experiment, &identity)?;
            info!(experiment = %experiment, finished, "Completion processed");
            println!("{}", if finished { "completed" } else { "no assignment" });
        }
        Commands::Report { experiment } => {
            let report = manager.results(&experiment)?;
            println!("{}", report.to_json_pretty()?);
        }
        Commands::List => {
            for record in manager.list_experiments()? {
                let kind = if record.metadata.multivariate {
                    "multivariate"
                } else if record.parent_id.is_some() {
                    "sub-experiment"
                } else {
                    "simple"
                };
                println!(
                    "{}\t{}\t{}\t{}",
                    record.id,
                    record.name,
                    kind,
                    record.metadata.weighting
                );
            }
        }
        Commands::Clear { experiment, delete } => {
            manager.clear_experiment(&experiment, delete)?;
            println!("cleared {experiment}");
        }
        // printed before storage is opened
        Commands::EnvHelp => {}
    }

    Ok(())
}
