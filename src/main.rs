use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

mod cmd;

#[derive(Parser)]
#[command(name = "velo")]
#[command(version, about = "Autonomous CI healing: test, patch, commit, repeat")]
pub struct Cli {
    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Process log format on stderr
    #[arg(long, value_enum, default_value = "pretty", global = true)]
    pub log_format: LogFormat,

    /// Also write process logs to a daily-rolling file in this directory
    #[arg(long, global = true)]
    pub log_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Serve the analyze API and the run event streams
    Serve {
        /// Port to serve on (defaults to [server].port)
        #[arg(short, long)]
        port: Option<u16>,

        /// Address to bind (defaults to [server].host)
        #[arg(long)]
        host: Option<String>,

        /// Enable dev mode (permissive CORS, bind on all interfaces)
        #[arg(long)]
        dev: bool,
    },
    /// Heal a repository's failing test suite
    Heal {
        /// Repository URL or local path
        repo_url: String,

        #[arg(long)]
        team: String,

        #[arg(long)]
        leader: String,

        /// Fix-cycle budget (1-20)
        #[arg(long)]
        max_iterations: Option<u32>,

        /// Print the final report as JSON
        #[arg(long)]
        json: bool,

        /// Commit locally but never push
        #[arg(long)]
        no_push: bool,

        /// Submit to a running `velo serve` instead of healing in-process
        #[arg(long, env = "VELO_SERVER")]
        server: Option<String>,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a default velo.toml file
    Init,
}

/// Returns the file writer's guard; logs are lost once it drops.
fn init_tracing(format: LogFormat, log_dir: Option<&PathBuf>) -> Option<WorkerGuard> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("velo=info"));

    let stderr = match format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .boxed(),
        LogFormat::Pretty => tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .boxed(),
    };

    let (file, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "velo.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr)
        .with(file)
        .init();
    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let log_guard = init_tracing(cli.log_format, cli.log_dir.as_ref());

    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    let mut exit_code = 0;
    match &cli.command {
        Commands::Serve { port, host, dev } => {
            cmd::cmd_serve(&project_dir, *port, host.clone(), *dev).await?;
        }
        Commands::Heal {
            repo_url,
            team,
            leader,
            max_iterations,
            json,
            no_push,
            server,
        } => {
            let args = cmd::HealArgs {
                repo_url: repo_url.clone(),
                team: team.clone(),
                leader: leader.clone(),
                max_iterations: *max_iterations,
                json: *json,
                no_push: *no_push,
                server: server.clone(),
            };
            if !cmd::cmd_heal(&project_dir, args).await? {
                exit_code = 1;
            }
        }
        Commands::Config { command } => cmd::cmd_config(&project_dir, command.clone())?,
    }

    if exit_code != 0 {
        // Flush the file writer before exiting past destructors.
        drop(log_guard);
        std::process::exit(exit_code);
    }
    Ok(())
}
