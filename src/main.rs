use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use execbox::ExecutorMode;

mod commands;

use commands::GlobalOptions;

#[derive(Parser)]
#[command(name = "execbox")]
#[command(
    author,
    version,
    about = "Run untrusted code in isolated, resource-limited sandboxes"
)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file (default: ./execbox.toml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Executor: auto, container or process
    #[arg(long, global = true)]
    executor: Option<ExecutorMode>,

    /// Directory for per-execution workspaces
    #[arg(long, global = true, env = "EXECBOX_WORKSPACE_ROOT")]
    workspace_root: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a code snippet
    Exec {
        /// Language id or alias
        #[arg(short, long)]
        language: String,

        /// Source code to run
        #[arg(long, conflicts_with = "code_file")]
        code: Option<String>,

        /// Read the source code from a file
        #[arg(long)]
        code_file: Option<PathBuf>,

        /// Data fed to the program's stdin
        #[arg(long)]
        stdin: Option<String>,

        /// Print the full result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Execute a source file, inferring the language from its extension
    Run {
        file: PathBuf,

        /// Data fed to the program's stdin
        #[arg(long)]
        stdin: Option<String>,

        /// Print the full result as JSON
        #[arg(long)]
        json: bool,

        /// Arguments passed to the program
        #[arg(last = true)]
        args: Vec<String>,
    },

    /// List supported languages and their limits
    Languages {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the seccomp policy as JSON
    Seccomp,

    /// Manage hardened sandbox images
    Images {
        #[command(subcommand)]
        action: commands::images::ImageAction,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("execbox=debug")
    } else {
        EnvFilter::new("execbox=info")
    };

    // stdout carries program output and JSON
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let options = GlobalOptions {
        config: cli.config,
        executor: cli.executor,
        workspace_root: cli.workspace_root,
    };

    match cli.command {
        Commands::Exec {
            language,
            code,
            code_file,
            stdin,
            json,
        } => {
            return commands::run::exec(&options, &language, code, code_file, stdin, json).await;
        }
        Commands::Run {
            file,
            stdin,
            json,
            args,
        } => {
            return commands::run::run(&options, &file, args, stdin, json).await;
        }
        Commands::Languages { json } => {
            commands::languages::run(&options, json)?;
        }
        Commands::Seccomp => {
            commands::seccomp::run()?;
        }
        Commands::Images { action } => {
            commands::images::run(&options, action).await?;
        }
    }

    Ok(ExitCode::SUCCESS)
}
