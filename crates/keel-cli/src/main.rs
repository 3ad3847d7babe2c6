//! Keel CLI tool.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser)]
#[command(name = "keel")]
#[command(about = "Provisioning orchestration engine", long_about = None)]
struct Cli {
    /// Log output format (logs go to stderr)
    #[arg(long, env = "KEEL_LOG_FORMAT", value_enum, default_value = "text")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a stack file and its dependency graph
    Validate {
        /// Path to the stack file
        #[arg(default_value = "keel.kdl")]
        path: PathBuf,
    },
    /// Show what an apply would do, without applying anything
    Plan {
        /// Path to the stack file
        #[arg(default_value = "keel.kdl")]
        path: PathBuf,
        /// Treat these build nodes as forced
        #[arg(long = "force", value_name = "NODE")]
        force: Vec<String>,
        /// Print the plan as JSON
        #[arg(long)]
        json: bool,
    },
    /// Apply a stack
    Apply {
        /// Path to the stack file
        #[arg(default_value = "keel.kdl")]
        path: PathBuf,
        /// Rebuild these build nodes even if their source is unchanged
        #[arg(long = "force", value_name = "NODE")]
        force: Vec<String>,
        /// Maximum number of nodes applied at once
        #[arg(long)]
        concurrency: Option<usize>,
        /// Write the run report as JSON to this file
        #[arg(long)]
        report: Option<PathBuf>,
    },
    /// Print the content fingerprint of a directory
    Fingerprint {
        /// Directory to fingerprint
        dir: PathBuf,
        /// Glob patterns to exclude (repeatable)
        #[arg(long)]
        exclude: Vec<String>,
        /// Do not apply the default exclusions (.git, target, node_modules, ...)
        #[arg(long)]
        no_default_excludes: bool,
    },
    /// Inspect published parameters
    Params {
        #[command(subcommand)]
        command: ParamCommands,
    },
    /// Inspect published secrets (names only)
    Secrets {
        #[command(subcommand)]
        command: SecretCommands,
    },
}

#[derive(Subcommand)]
enum ParamCommands {
    /// List parameter paths
    List {
        /// Only paths starting with this prefix
        #[arg(default_value = "")]
        prefix: String,
        /// State directory holding the stores
        #[arg(long, env = "KEEL_STATE_DIR", default_value = ".keel")]
        state_dir: PathBuf,
    },
    /// Show one parameter
    Get {
        /// Parameter path, e.g. /amazon/guardrail_id
        path: String,
        /// State directory holding the stores
        #[arg(long, env = "KEEL_STATE_DIR", default_value = ".keel")]
        state_dir: PathBuf,
    },
}

#[derive(Subcommand)]
enum SecretCommands {
    /// List secret names
    List {
        /// Only names starting with this prefix
        #[arg(default_value = "")]
        prefix: String,
        /// State directory holding the stores
        #[arg(long, env = "KEEL_STATE_DIR", default_value = ".keel")]
        state_dir: PathBuf,
    },
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Commands::Validate { path } => {
            commands::validate(&path)?;
        }
        Commands::Plan { path, force, json } => {
            commands::plan::run(&path, &force, json).await?;
        }
        Commands::Apply {
            path,
            force,
            concurrency,
            report,
        } => {
            commands::apply::run(&path, &force, concurrency, report.as_deref()).await?;
        }
        Commands::Fingerprint {
            dir,
            exclude,
            no_default_excludes,
        } => {
            commands::fingerprint::run(&dir, exclude, no_default_excludes).await?;
        }
        Commands::Params { command } => match command {
            ParamCommands::List { prefix, state_dir } => {
                commands::stores::list_params(&state_dir, &prefix).await?;
            }
            ParamCommands::Get { path, state_dir } => {
                commands::stores::get_param(&state_dir, &path).await?;
            }
        },
        Commands::Secrets { command } => match command {
            SecretCommands::List { prefix, state_dir } => {
                commands::stores::list_secrets(&state_dir, &prefix).await?;
            }
        },
    }

    Ok(())
}
