/// Stepwise CLI - run and inspect hierarchical workflows
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use stepwise_core::{init_logging, ConfigManager, StepwiseConfig};

mod commands;

use commands::{config, run, table, validate};

/// Load configuration from the given path or default location, then apply
/// environment overrides
fn load_config(config_path: Option<&Path>) -> anyhow::Result<StepwiseConfig> {
    let mut manager = ConfigManager::load(config_path)?;
    manager.load_from_env();
    manager.validate()?;
    Ok(manager.config().clone())
}

#[derive(Parser)]
#[command(name = "stepwise")]
#[command(about = "Hierarchical workflow runner", long_about = None)]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Config file path (defaults to .stepwise/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override log level
    #[arg(long, global = true)]
    log_level: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a workflow template against the configured backend
    Run {
        /// Template file (.json or .toml)
        #[arg(short, long)]
        template: PathBuf,

        /// Stage to start at (defaults to the first stage)
        #[arg(long)]
        stage: Option<String>,

        /// Step to start at within the stage
        #[arg(long)]
        step: Option<String>,

        /// Confirm plan updates without prompting
        #[arg(long)]
        auto_confirm: bool,

        /// Write the execution history as JSON when the run ends
        #[arg(long)]
        history_out: Option<PathBuf>,
    },

    /// Validate a workflow template and print its outline
    Validate {
        /// Template file (.json or .toml)
        #[arg(short, long)]
        template: PathBuf,
    },

    /// Print the state transition table
    Table,

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = load_config(args.config.as_deref())?;
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    init_logging(&config.logging);

    match args.command {
        Commands::Run {
            template,
            stage,
            step,
            auto_confirm,
            history_out,
        } => {
            run::execute(
                &config,
                &template,
                stage.as_deref(),
                step.as_deref(),
                auto_confirm,
                history_out.as_deref(),
            )
            .await?;
        }

        Commands::Validate { template } => {
            validate::execute(&template)?;
        }

        Commands::Table => {
            table::execute();
        }

        Commands::Config => {
            config::execute(&config)?;
        }
    }

    Ok(())
}
