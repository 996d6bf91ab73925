//! Stepwise CLI — the main entry point.
//!
//! Commands:
//! - `run`      — Plan and execute a task against the completion service
//! - `plan`     — Structure a raw planning response into a plan
//! - `evaluate` — Score a step result against a plan
//! - `config`   — Show, locate, or validate configuration

use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "stepwise",
    about = "Stepwise — autonomous plan/execute/evaluate task engine",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Use this config file instead of ~/.stepwise/config.toml
    #[arg(short, long, global = true, env = "STEPWISE_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Plan and run a task
    Run {
        /// The task to accomplish
        task: String,

        /// Override the WebSocket URL
        #[arg(long)]
        url: Option<String>,

        /// Override the iteration budget
        #[arg(long)]
        max_iterations: Option<u32>,
    },

    /// Structure a raw planning response (JSON file, or `-` for stdin)
    Plan {
        input: String,

        /// Task the plan is for
        #[arg(short, long)]
        task: Option<String>,
    },

    /// Evaluate a step result against a plan
    Evaluate {
        /// Plan JSON file
        #[arg(short, long)]
        plan: PathBuf,

        /// The step result text
        #[arg(short, long)]
        result: String,
    },

    /// Configuration helpers
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration as TOML
    Show,
    /// Print the default config file path
    Path,
    /// Validate the configuration
    Validate,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config_path = cli.config.as_deref();
    match cli.command {
        Commands::Run {
            task,
            url,
            max_iterations,
        } => commands::run::run(config_path, &task, url, max_iterations).await?,
        Commands::Plan { input, task } => commands::plan::run(&input, task.as_deref())?,
        Commands::Evaluate { plan, result } => {
            commands::evaluate::run(config_path, &plan, &result).await?
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => commands::config_cmd::show(config_path)?,
            ConfigAction::Path => commands::config_cmd::path(config_path),
            ConfigAction::Validate => commands::config_cmd::validate(config_path)?,
        },
    }

    Ok(())
}
