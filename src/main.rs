// src/main.rs

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use pungi::{ComposeOptions, ComposeStatus};
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Mutex;
use tracing::error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, reload};

type FileLayer = Box<dyn Layer<Registry> + Send + Sync>;

#[derive(Parser)]
#[command(name = "pungi")]
#[command(author, version, about = "Distribution compose tool", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a compose
    Compose {
        /// Compose configuration (TOML)
        #[arg(short, long)]
        config: PathBuf,
        /// Directory the compose directory is created in
        #[arg(long, default_value = ".")]
        target_dir: PathBuf,
        /// Compose label, e.g. RC-1.0 or Beta-1
        #[arg(long)]
        label: Option<String>,
        /// Compose date as YYYYMMDD (default: today)
        #[arg(long, value_parser = parse_date)]
        compose_date: Option<NaiveDate>,
        /// Respin number (default: next free one for the date)
        #[arg(long)]
        respin: Option<u32>,
        /// Older compose to reuse results from (repeatable)
        #[arg(long = "old-compose")]
        old_composes: Vec<PathBuf>,
        /// Run only this phase (repeatable)
        #[arg(long = "just-phase")]
        just_phases: Vec<String>,
        /// Skip this phase (repeatable)
        #[arg(long = "skip-phase")]
        skip_phases: Vec<String>,
        /// Do not update the latest-* symlink
        #[arg(long)]
        no_latest_link: bool,
        /// Debug output
        #[arg(short, long, conflicts_with = "quiet")]
        verbose: bool,
        /// Warnings and errors only
        #[arg(short, long)]
        quiet: bool,
    },
    /// Generate shell completion scripts
    Completions {
        /// Shell type
        shell: Shell,
    },
}

fn parse_date(s: &str) -> std::result::Result<NaiveDate, String> {
    NaiveDate::parse_from_str(s, "%Y%m%d").map_err(|e| format!("expected YYYYMMDD: {}", e))
}

/// Stderr logging now, plus a slot for the compose log file once the
/// compose directory exists
fn init_logging(verbose: bool, quiet: bool) -> reload::Handle<Option<FileLayer>, Registry> {
    let default_level = if verbose {
        "debug"
    } else if quiet {
        "warn"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let (file_layer, handle) = reload::Layer::new(None::<FileLayer>);
    tracing_subscriber::registry()
        .with(file_layer)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
    handle
}

fn attach_log_file(handle: &reload::Handle<Option<FileLayer>, Registry>, path: PathBuf) -> Result<()> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("Cannot open {}", path.display()))?;
    let layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(Mutex::new(file))
        .boxed();
    handle
        .reload(Some(layer))
        .context("Cannot attach the compose log file")
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "pungi", &mut std::io::stdout());
            ExitCode::SUCCESS
        }
        Commands::Compose {
            config,
            target_dir,
            label,
            compose_date,
            respin,
            old_composes,
            just_phases,
            skip_phases,
            no_latest_link,
            verbose,
            quiet,
        } => {
            let handle = init_logging(verbose, quiet);
            let options = ComposeOptions {
                target_dir,
                label,
                compose_date,
                respin,
                old_composes,
                just_phases,
                skip_phases,
                no_latest_link,
            };
            match compose(&config, options, &handle) {
                Ok(status) => ExitCode::from(status.exit_code() as u8),
                Err(e) => {
                    error!("{:#}", e);
                    ExitCode::from(ComposeStatus::Doomed.exit_code() as u8)
                }
            }
        }
    }
}

fn compose(
    config: &std::path::Path,
    options: ComposeOptions,
    handle: &reload::Handle<Option<FileLayer>, Registry>,
) -> Result<ComposeStatus> {
    let compose = pungi::prepare_compose(config, options)
        .with_context(|| format!("Cannot start a compose from {}", config.display()))?;
    attach_log_file(handle, compose.paths.global_log())?;
    Ok(pungi::run_compose(&compose)?)
}
