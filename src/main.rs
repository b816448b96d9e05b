use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use formpilot::{EngineConfig, Job, Runner};

#[derive(Parser)]
#[command(name = "formpilot")]
#[command(about = "Agentic form automation driven by a remote planner")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output (-v for info, -vv for debug)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (only errors)
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Run a job file (JSON or YAML)
    Run {
        job: PathBuf,

        /// Engine config file; defaults apply when omitted
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Run in headless mode (overrides config)
        #[arg(long)]
        headless: bool,

        /// Write the run report as JSON to this path
        #[arg(long)]
        report: Option<PathBuf>,
    },
    /// Validate a config file without running
    Check { config: PathBuf },
    /// Print the JSON schema of a planner action
    Schema,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = if cli.quiet {
        "error"
    } else {
        match cli.verbose {
            0 => "warn",
            1 => "info",
            _ => "debug",
        }
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();

    match cli.command {
        Command::Schema => {
            let schema = formpilot::action::action_schema();
            println!("{}", serde_json::to_string_pretty(&schema)?);
            Ok(())
        }
        Command::Check { config } => {
            let config = EngineConfig::load(&config)
                .with_context(|| format!("loading {}", config.display()))?;
            println!("Config valid");
            let endpoints = if config.planner.endpoints.is_empty() {
                config.planner.default_endpoint.clone()
            } else {
                config.planner.endpoints.join(", ")
            };
            println!("  Planner: {}", endpoints);
            println!("  Max iterations: {}", config.engine.max_iterations);
            println!("  Timeout: {}s", config.engine.timeout_secs);
            println!(
                "  Retry: {} attempts, circuit opens after {} failures",
                config.planner.retry.max_attempts, config.planner.circuit.failure_threshold
            );
            Ok(())
        }
        Command::Run {
            job,
            config,
            headless,
            report,
        } => {
            let mut config = match config {
                Some(path) => EngineConfig::load(&path)
                    .with_context(|| format!("loading {}", path.display()))?,
                None => EngineConfig::default(),
            };
            if headless {
                config.browser.headless = true;
            }
            let job = Job::load(&job).with_context(|| format!("loading job {}", job.display()))?;

            println!("Running: {} ({})", job.marketplace, job.step);
            let runner = Runner::new(&config.browser).await?;
            let result = runner.run_job(&config, &job).await;
            runner.close().await?;
            let result = result?;

            println!();
            if result.is_done() {
                println!("✓ Done");
            } else {
                println!("✗ {}", result.outcome);
            }
            println!("  Reason: {}", result.reason);
            println!("  Iterations: {}", result.iterations);
            println!("  Actions: {}", result.history.len());
            if result.modals_dismissed > 0 {
                println!("  Modals dismissed: {}", result.modals_dismissed);
            }
            println!("  Duration: {}ms", result.duration_ms);

            if let Some(path) = report {
                std::fs::write(&path, serde_json::to_string_pretty(&result)?)
                    .with_context(|| format!("writing report {}", path.display()))?;
            }

            if !result.is_done() {
                std::process::exit(1);
            }
            Ok(())
        }
    }
}
