mod manifest;
mod simulate;

use clap::{Parser, Subcommand};
use manifest::{load_config, Manifest};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

#[derive(Parser)]
#[command(name = "flotilla", about = "Flotilla fault-tolerant job scheduler")]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true, env = "FLOTILLA_JSON_LOGS")]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a cluster manifest against the mock executor and print the job table
    Simulate {
        /// Cluster manifest (nodes and jobs)
        #[arg(long)]
        manifest: PathBuf,
        /// Scheduler config file; defaults apply when omitted
        #[arg(long, env = "FLOTILLA_CONFIG")]
        config: Option<PathBuf>,
        /// Give up waiting for jobs after this many seconds
        #[arg(long, default_value_t = 300)]
        deadline_secs: u64,
    },
    /// Validate a scheduler config file and print the effective settings
    CheckConfig {
        /// Scheduler config file
        #[arg(long, env = "FLOTILLA_CONFIG")]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> miette::Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so stdout carries only the JSON report
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if cli.json_logs {
        builder.json().init();
    } else {
        builder.init();
    }

    match cli.command {
        Commands::Simulate {
            manifest,
            config,
            deadline_secs,
        } => run_simulate(&manifest, config.as_deref(), deadline_secs).await,
        Commands::CheckConfig { config } => run_check_config(config.as_deref()),
    }
}

async fn run_simulate(
    manifest_path: &std::path::Path,
    config_path: Option<&std::path::Path>,
    deadline_secs: u64,
) -> miette::Result<()> {
    let config = load_config(config_path)?;
    let manifest = Manifest::load(manifest_path)?;
    info!(
        "Simulating {} node(s) and {} job definition(s) with {} strategy",
        manifest.nodes.len(),
        manifest.jobs.len(),
        config.strategy
    );

    let report = simulate::run(config, manifest, Duration::from_secs(deadline_secs)).await?;
    info!(
        "Simulation finished in {} ms: {:?}",
        report.elapsed_ms, report.counts
    );

    let json = serde_json::to_string_pretty(&report)
        .map_err(|e| miette::miette!("Failed to encode report: {}", e))?;
    println!("{}", json);

    if !report.finished {
        return Err(miette::miette!(
            "Deadline of {}s passed before all jobs finished",
            deadline_secs
        ));
    }
    Ok(())
}

fn run_check_config(config_path: Option<&std::path::Path>) -> miette::Result<()> {
    let config = load_config(config_path)?;
    let yaml = serde_yaml::to_string(&config)
        .map_err(|e| miette::miette!("Failed to encode config: {}", e))?;
    print!("{}", yaml);
    info!("Configuration is valid");
    Ok(())
}
