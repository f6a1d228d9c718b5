mod config;
mod daemon;
mod event;
mod history;
mod notifier;
mod paths;
mod pidfile;
mod poller;
mod repos;
mod run;
mod source;
mod status;
mod store;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io::IsTerminal;

use crate::paths::StatePaths;
use crate::repos::{RepoList, TrackedRepository};
use crate::store::RunStore;

const DEFAULT_HISTORY_LINES: usize = 20;

#[derive(Parser)]
#[command(
    name = "ci-monitor",
    version,
    about = "Announce GitHub Actions results for the repositories you care about"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start monitoring a repository (owner/repo)
    Add { repo: String },
    /// Stop monitoring a repository
    Remove { repo: String },
    /// List monitored repositories
    List,
    /// Start the background monitor
    Start {
        /// Run in this process instead of spawning a background daemon
        #[arg(long)]
        foreground: bool,
    },
    /// Stop the background monitor
    Stop,
    /// Show whether the monitor is running and what it watches
    Status,
    /// Show the most recently recorded build results
    History {
        /// Number of entries to show
        count: Option<usize>,
        #[arg(short = 'n', long = "lines", conflicts_with = "count")]
        lines: Option<usize>,
    },
    /// Check every repository once, right now, in the foreground
    Check,
    /// Show or change settings
    Config {
        key: Option<String>,
        #[arg(allow_hyphen_values = true)]
        value: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .init();

    let cli = Cli::parse();
    if let Err(e) = dispatch(cli.command).await {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

async fn dispatch(command: Commands) -> Result<()> {
    let paths = StatePaths::resolve()?;
    paths.ensure_dir()?;

    match command {
        Commands::Add { repo } => cmd_add(&paths, &repo),
        Commands::Remove { repo } => cmd_remove(&paths, &repo),
        Commands::List => cmd_list(&paths),
        Commands::Start { foreground } => daemon::start(&paths, foreground).await,
        Commands::Stop => daemon::stop(&paths).await,
        Commands::Status => daemon::status(&paths),
        Commands::History { count, lines } => {
            cmd_history(&paths, count.or(lines).unwrap_or(DEFAULT_HISTORY_LINES))
        }
        Commands::Check => daemon::check_once(&paths).await.map(|_| ()),
        Commands::Config { key, value } => cmd_config(&paths, key.as_deref(), value.as_deref()),
    }
}

// ── repository list ───────────────────────────────────────────────────────────

fn cmd_add(paths: &StatePaths, raw: &str) -> Result<()> {
    let repo = TrackedRepository::parse(raw)?;
    if RepoList::new(&paths.repos_file()).add(&repo)? {
        println!("Now monitoring {repo}");
    } else {
        println!("{repo} is already being monitored");
    }
    Ok(())
}

fn cmd_remove(paths: &StatePaths, raw: &str) -> Result<()> {
    let repo = TrackedRepository::parse(raw)?;
    RepoList::new(&paths.repos_file()).remove(&repo)?;
    println!("Stopped monitoring {repo}");
    Ok(())
}

fn cmd_list(paths: &StatePaths) -> Result<()> {
    let repos = RepoList::new(&paths.repos_file()).list()?;
    if repos.is_empty() {
        println!("No repositories monitored. Add one with `ci-monitor add <owner/repo>`.");
    }
    for repo in repos {
        println!("{repo}");
    }
    Ok(())
}

// ── history ───────────────────────────────────────────────────────────────────

fn cmd_history(paths: &StatePaths, limit: usize) -> Result<()> {
    let store_path = paths.store_file();
    if !store_path.exists() {
        println!("No history yet.");
        return Ok(());
    }
    let store = RunStore::open_read_only(&store_path).context("failed to open run store")?;
    let records = store.recent(limit)?;
    if records.is_empty() {
        println!("No history yet.");
        return Ok(());
    }
    for record in records {
        println!(
            "{} | {:25} | {:15} | {} {}",
            record
                .recorded_at
                .with_timezone(&chrono::Local)
                .format("%Y-%m-%d %H:%M:%S"),
            record.repo,
            record.workflow,
            record.conclusion.icon(),
            record.conclusion,
        );
    }
    Ok(())
}

// ── config ────────────────────────────────────────────────────────────────────

fn cmd_config(paths: &StatePaths, key: Option<&str>, value: Option<&str>) -> Result<()> {
    let path = paths.config_file();
    let mut cfg = config::load_or_default(&path)?;
    match (key, value) {
        (None, _) => {
            for (key, value) in cfg.entries() {
                println!("{key} = {value}");
            }
        }
        (Some(key), None) => println!("{}", cfg.get(key)?),
        (Some(key), Some(value)) => {
            cfg.set(key, value)?;
            config::save(&path, &cfg)?;
            println!("{key} = {}", cfg.get(key)?);
        }
    }
    Ok(())
}
