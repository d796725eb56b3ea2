//! mindtrial CLI - evaluate prompt tasks against language-model providers.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use mindtrial::config::{load_config, load_tasks};
use mindtrial::report::print_summary;
use mindtrial::sandbox::{SandboxDriver, docker::DockerDriver};

#[derive(Parser)]
#[command(name = "mindtrial")]
#[command(about = "Evaluate prompt tasks against language-model providers", long_about = None)]
#[command(version)]
struct Cli {
    /// Provider/judge/tool configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Task definitions file
    #[arg(short, long, default_value = "tasks.yaml")]
    tasks: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the evaluation batch
    Run,

    /// Load and validate the configuration and task files
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::WARN
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Run => run_batch(&cli.config, &cli.tasks, cli.verbose).await,
        Commands::Validate => validate(&cli.config, &cli.tasks),
    }
}

async fn run_batch(config_path: &Path, tasks_path: &Path, verbose: bool) -> Result<()> {
    let config = load_config(config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;
    let tasks = load_tasks(tasks_path)
        .with_context(|| format!("failed to load tasks from {}", tasks_path.display()))?;

    let driver: Option<Arc<dyn SandboxDriver>> = if config.tools.is_empty() {
        None
    } else {
        Some(Arc::new(DockerDriver::new().context("sandbox driver unavailable")?))
    };
    let runner = config.build_runner(driver)?;

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("interrupted, cancelling batch...");
            interrupt.cancel();
        }
    });

    let mut handle = runner.start(cancel, tasks).await?;
    let total = handle.total();

    let pb = indicatif::ProgressBar::new(total as u64);
    pb.set_style(
        indicatif::ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
            .expect("progress template is valid")
            .progress_chars("#>-"),
    );

    {
        let (progress, messages) = handle.events();
        let mut progress_open = true;
        let mut messages_open = true;
        while progress_open || messages_open {
            tokio::select! {
                fraction = progress.recv(), if progress_open => match fraction {
                    Some(fraction) => pb.set_position((fraction * total as f64).round() as u64),
                    None => progress_open = false,
                },
                message = messages.recv(), if messages_open => match message {
                    Some(message) if verbose => pb.println(message),
                    Some(_) => {}
                    None => messages_open = false,
                },
            }
        }
    }

    let results = handle.results().await;
    pb.finish_and_clear();

    let all_ok = print_summary(&results);
    runner.close().await;

    std::process::exit(if all_ok { 0 } else { 1 });
}

fn validate(config_path: &Path, tasks_path: &Path) -> Result<()> {
    let config = load_config(config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;
    let tasks = load_tasks(tasks_path)
        .with_context(|| format!("failed to load tasks from {}", tasks_path.display()))?;

    let runs: usize = config.providers.iter().map(|p| p.runs.len()).sum();
    println!(
        "Configuration OK: {} providers, {} runs, {} judges, {} tools, {} tasks ({} executions per batch)",
        config.providers.len(),
        runs,
        config.judges.len(),
        config.tools.len(),
        tasks.len(),
        tasks.len() * runs,
    );
    Ok(())
}
