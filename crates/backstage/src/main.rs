//! `backstage`: drive the runtime from a shell.
//!
//! # Examples
//!
//! ```sh
//! # Run a command through the process registry, truncating its output
//! backstage run "cargo test" --wait-ms 120000
//!
//! # Delete overflow files older than a day for this project
//! backstage sweep --max-age-ms 86400000
//!
//! # Show the overflow directory for a project
//! backstage stats --cwd ~/src/app
//!
//! # Middle-truncate piped text to 2000 characters
//! some-noisy-command | backstage truncate --chars 2000 --middle
//! ```
//!
//! Logs go to stderr; set `RUST_LOG` to adjust (default `backstage=info`).

use std::io::{self, Read};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use backstage::background::{self, BackgroundRegistry, RetrieveOptions, UnitStatus};
use backstage::config::RuntimeConfig;
use backstage::overflow::OverflowStore;
use backstage::process::{ProcessRegistry, SpawnOptions};
use backstage::tools::OutputPolicy;
use backstage::truncate::{TruncateOptions, truncate_by_chars, truncate_by_lines};
use clap::{Parser, Subcommand};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Background process and output-bounding runtime for coding agents.
#[derive(Parser)]
#[command(name = "backstage", version)]
struct Cli {
    /// JSON runtime config. A missing file means defaults.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a shell command through the process registry and print its
    /// (truncated) output.
    Run {
        /// Command line, passed to the platform shell.
        command: String,

        /// Kill the command after this many milliseconds.
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Stop waiting after this many milliseconds and stop the command.
        #[arg(long)]
        wait_ms: Option<u64>,

        /// Working directory (defaults to the current one).
        #[arg(long)]
        cwd: Option<PathBuf>,
    },

    /// Delete old overflow files for a project.
    Sweep {
        /// Project directory (defaults to the current one).
        #[arg(long)]
        cwd: Option<PathBuf>,

        /// Age threshold in milliseconds (defaults to the config value).
        #[arg(long)]
        max_age_ms: Option<u64>,
    },

    /// Show the overflow directory for a project.
    Stats {
        /// Project directory (defaults to the current one).
        #[arg(long)]
        cwd: Option<PathBuf>,
    },

    /// Truncate stdin and print the result.
    Truncate {
        /// Character budget.
        #[arg(long, conflicts_with = "lines")]
        chars: Option<usize>,

        /// Line budget.
        #[arg(long)]
        lines: Option<usize>,

        /// Per-line character cap in line mode.
        #[arg(long, default_value_t = backstage::config::DEFAULT_MAX_LINE_CHARS)]
        line_chars: usize,

        /// Keep head and tail instead of only the head.
        #[arg(long)]
        middle: bool,
    },
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("backstage=info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(io::stderr).with_target(false))
        .init();
}

fn working_dir(cwd: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    match cwd {
        Some(dir) => Ok(dir),
        None => std::env::current_dir().context("cannot determine current directory"),
    }
}

async fn run_command(
    config: &RuntimeConfig,
    command: &str,
    timeout_ms: Option<u64>,
    wait_ms: Option<u64>,
    cwd: Option<PathBuf>,
) -> anyhow::Result<ExitCode> {
    let cwd = working_dir(cwd)?;
    let timeout = timeout_ms
        .map(Duration::from_millis)
        .unwrap_or_else(|| config.process_timeout());
    // Wait slightly longer than the process timeout so the timeout path wins.
    let wait = wait_ms
        .map(Duration::from_millis)
        .unwrap_or(timeout + Duration::from_secs(5));

    let processes = ProcessRegistry::from_config(config);
    let id = processes.spawn_with(command, SpawnOptions::default().cwd(&cwd).timeout(timeout));
    let opts = RetrieveOptions::blocking(wait).with_poll_interval(config.poll_interval());
    let retrieved = background::retrieve(&processes, &id, opts).await;

    let policy = OutputPolicy::from_config(config, &cwd);
    println!("{}", policy.apply(&retrieved.message, "shell"));

    Ok(match retrieved.status {
        Some(UnitStatus::Completed) => ExitCode::SUCCESS,
        Some(UnitStatus::Running) => {
            processes.stop(&id);
            eprintln!("Stopped {id} after waiting {}ms", wait.as_millis());
            ExitCode::from(124)
        }
        _ => ExitCode::FAILURE,
    })
}

fn truncate_stdin(
    chars: Option<usize>,
    lines: Option<usize>,
    line_chars: usize,
    middle: bool,
) -> anyhow::Result<()> {
    let mut input = String::new();
    io::stdin()
        .read_to_string(&mut input)
        .context("failed to read stdin")?;
    let opts = if middle {
        TruncateOptions::middle()
    } else {
        TruncateOptions::head()
    };
    let out = match (chars, lines) {
        (_, Some(max_lines)) => truncate_by_lines(&input, max_lines, line_chars, &opts).content,
        (Some(max), None) => truncate_by_chars(&input, max, &opts).content,
        (None, None) => {
            truncate_by_chars(&input, backstage::config::DEFAULT_MAX_OUTPUT_CHARS, &opts).content
        }
    };
    print!("{out}");
    Ok(())
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let config = match &cli.config {
        Some(path) => RuntimeConfig::load(path)?,
        None => RuntimeConfig::default(),
    };

    match cli.command {
        Command::Run {
            command,
            timeout_ms,
            wait_ms,
            cwd,
        } => run_command(&config, &command, timeout_ms, wait_ms, cwd).await,
        Command::Sweep { cwd, max_age_ms } => {
            let cwd = working_dir(cwd)?;
            let store = OverflowStore::from_config(&config)?;
            let max_age = max_age_ms
                .map(Duration::from_millis)
                .unwrap_or_else(|| config.overflow_max_age());
            let removed = store.cleanup(&cwd, max_age);
            println!("Removed {removed} file(s) from {}", store.dir_for(&cwd).display());
            Ok(ExitCode::SUCCESS)
        }
        Command::Stats { cwd } => {
            let cwd = working_dir(cwd)?;
            let stats = OverflowStore::from_config(&config)?.stats(&cwd);
            println!("Directory: {}", stats.dir.display());
            if stats.exists {
                println!("Files:     {}", stats.file_count);
                println!(
                    "Size:      {} bytes",
                    backstage::truncate::format_count(stats.total_bytes as usize)
                );
            } else {
                println!("(does not exist)");
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Truncate {
            chars,
            lines,
            line_chars,
            middle,
        } => {
            truncate_stdin(chars, lines, line_chars, middle)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
