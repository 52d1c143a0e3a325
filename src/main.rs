use anyhow::{Context, Result};
use chrono::Local;
use clap::Parser;
use log::info;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tilemosaic::config::{POSITIONAL_ARGS, ProjectConfig};
use tilemosaic::download::{HttpTransport, RetryPolicy};
use tilemosaic::orchestrator::{Orchestrator, Workspace};

#[derive(Parser)]
#[command(author, version, about = "Download map tiles and merge them into mosaics", long_about = None)]
struct Cli {
    /// nw_lat nw_lng se_lat se_lng min_zoom max_zoom project map_type.
    /// With any other number of values the config file is used instead.
    #[arg(allow_negative_numbers = true)]
    args: Vec<String>,

    /// Path to the config file
    #[arg(short, long, default_value = "config.conf")]
    config: PathBuf,

    /// Directory holding tiles/, merged/ and the log files
    #[arg(short, long, default_value = ".")]
    workdir: PathBuf,

    /// Empty the project's error and success logs before starting
    #[arg(long)]
    reset_logs: bool,

    /// Per-request HTTP timeout in seconds
    #[arg(long, default_value_t = 30)]
    timeout_secs: u64,
}

fn main() -> Result<()> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    let config = if cli.args.len() == POSITIONAL_ARGS {
        ProjectConfig::from_args(&cli.args).context("Invalid command line arguments")?
    } else {
        info!(
            "Expected {} arguments (nw_lat nw_lng se_lat se_lng min_zoom max_zoom project map_type), reading {}",
            POSITIONAL_ARGS,
            cli.config.display()
        );
        ProjectConfig::from_file(&cli.config)
            .with_context(|| format!("Failed to load config from {}", cli.config.display()))?
    };
    info!("Config: {:?}", config);

    let transport = HttpTransport::new(Duration::from_secs(cli.timeout_secs))
        .context("Failed to create HTTP client")?;
    let workspace = Workspace::new(&cli.workdir);
    let orchestrator = Orchestrator::new(
        config,
        &workspace,
        Arc::new(transport),
        RetryPolicy::default(),
    );

    if cli.reset_logs {
        orchestrator.run_log().reset().context("Failed to reset run logs")?;
    }

    // Tile and region failures are in the error log; only bad input is fatal.
    let summary = orchestrator.run().context("Run aborted")?;
    if summary.tiles_failed > 0 || summary.regions_failed > 0 {
        info!(
            "{} tiles and {} regions failed, see {}",
            summary.tiles_failed,
            summary.regions_failed,
            orchestrator.run_log().error_path().display()
        );
    }

    println!("Download end, end time is {}", Local::now());
    Ok(())
}
