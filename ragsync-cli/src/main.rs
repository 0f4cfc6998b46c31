mod client;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use client::{DaemonClient, TriggerResponse, DEFAULT_DAEMON_URL};
use colored::Colorize;
use dialoguer::{Confirm, Input};
use indicatif::{ProgressBar, ProgressStyle};
use ragsync_core::{
    ConfigUpdate, Configuration, DiscoveryMode, FireOutcome, NewSource, RemoteSourceConfig,
    RunOutcome, RunRecord, Source, SourceConfig, SourceId, SourceUpdate, DEFAULT_LOOKBACK_DAYS,
};
use std::path::PathBuf;
use tabled::{Table, Tabled};

#[derive(Parser)]
#[command(name = "ragsync")]
#[command(author, version, about = "Ragsync - keep your RAG index in sync")]
#[command(after_help = "Examples:
  ragsync status                          Daemon and last run at a glance
  ragsync sources add-local notes ~/Notes Sync a local folder
  ragsync auth login                      Connect the remote file store
  ragsync trigger --wait                  Run now and show the result
  ragsync config --interval 30            Run every 30 minutes
")]
struct Cli {
    /// Daemon control API
    #[arg(long, global = true, env = "RAGSYNC_URL", default_value = DEFAULT_DAEMON_URL)]
    url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scheduler state, last run and credential status
    #[command(alias = "st")]
    Status,

    /// Start a run now (ignores pause, not the run mode)
    #[command(alias = "run")]
    Trigger {
        /// Wait for the run to finish and show its result
        #[arg(short, long)]
        wait: bool,
    },

    /// Stop scheduled runs until resumed
    Pause,

    /// Resume scheduled runs
    Resume,

    /// Show or change the runtime configuration
    Config {
        /// Minutes between scheduled runs
        #[arg(short, long)]
        interval: Option<u64>,
        /// Run mode: always-if-awake or only-if-powered
        #[arg(short, long)]
        mode: Option<String>,
        /// Wall-clock budget per run, in seconds
        #[arg(short, long)]
        budget: Option<u64>,
    },

    /// Recent runs, newest first
    #[command(alias = "runs")]
    History {
        #[arg(short, long, default_value = "20")]
        limit: usize,
        /// Show the per-source breakdown of each run
        #[arg(short, long)]
        verbose: bool,
    },

    /// Tail of the daemon log
    Logs {
        #[arg(short = 'n', long, default_value = "50")]
        lines: usize,
    },

    /// Manage sources
    #[command(subcommand)]
    Sources(SourceCommands),

    /// Manage the remote store credential
    #[command(subcommand)]
    Auth(AuthCommands),

    /// List remote folders, to pick a source's folder id
    Folders {
        /// Parent folder id (default: root)
        #[arg(short, long)]
        parent: Option<String>,
    },
}

#[derive(Subcommand)]
enum SourceCommands {
    /// List configured sources
    #[command(alias = "ls")]
    List,

    /// Show one source
    Show { id: SourceId },

    /// Add a local directory
    AddLocal {
        name: String,
        path: PathBuf,
        /// Only the top-level directory
        #[arg(long)]
        no_recursive: bool,
    },

    /// Add a remote file store folder
    AddRemote {
        name: String,
        /// Folder id (default: everything visible)
        #[arg(short, long)]
        folder: Option<String>,
        /// List everything instead of recently touched items
        #[arg(long)]
        full: bool,
        /// How far back "recently touched" reaches
        #[arg(long, default_value_t = DEFAULT_LOOKBACK_DAYS)]
        lookback_days: u32,
    },

    Enable { id: SourceId },

    Disable { id: SourceId },

    /// Remove a source
    #[command(alias = "rm")]
    Remove {
        id: SourceId,
        /// Skip confirmation
        #[arg(short, long)]
        yes: bool,
    },
}

#[derive(Subcommand)]
enum AuthCommands {
    Status,
    /// Print the consent screen URL
    Url,
    /// Authorize interactively
    Login {
        /// Authorization code, if already at hand
        code: Option<String>,
    },
    /// Forget the stored credential
    Logout,
}

#[derive(Tabled)]
struct SourceRow {
    #[tabled(rename = "ID")]
    id: SourceId,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Enabled")]
    enabled: String,
    #[tabled(rename = "Scope")]
    scope: String,
}

impl From<&Source> for SourceRow {
    fn from(source: &Source) -> Self {
        SourceRow {
            id: source.id,
            name: source.name.clone(),
            kind: source.kind().to_string(),
            enabled: if source.enabled { "yes" } else { "no" }.to_string(),
            scope: describe_scope(&source.config),
        }
    }
}

#[derive(Tabled)]
struct RunRow {
    #[tabled(rename = "When")]
    when: String,
    #[tabled(rename = "Trigger")]
    trigger: String,
    #[tabled(rename = "Outcome")]
    outcome: String,
    #[tabled(rename = "New")]
    processed: u64,
    #[tabled(rename = "Skipped")]
    skipped: u64,
    #[tabled(rename = "Took")]
    duration: String,
    #[tabled(rename = "Error")]
    error: String,
}

impl From<&RunRecord> for RunRow {
    fn from(run: &RunRecord) -> Self {
        RunRow {
            when: run
                .timestamp
                .with_timezone(&chrono::Local)
                .format("%Y-%m-%d %H:%M")
                .to_string(),
            trigger: run.trigger.to_string(),
            outcome: run.outcome.to_string(),
            processed: run.total_items_processed,
            skipped: run.total_items_skipped,
            duration: format_secs(run.duration_secs),
            error: run.error.clone().unwrap_or_default(),
        }
    }
}

#[derive(Tabled)]
struct FolderRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Name")]
    name: String,
}

fn describe_scope(config: &SourceConfig) -> String {
    match config {
        SourceConfig::Local(local) => {
            let depth = if local.recursive { "" } else { " (top level)" };
            format!("{}{}", local.path.display(), depth)
        }
        SourceConfig::Remote(remote) => {
            let folder = remote.folder_id.as_deref().unwrap_or("all folders");
            match remote.discovery_mode {
                DiscoveryMode::RecentlyTouched => {
                    format!("{}, touched in {} days", folder, remote.lookback_days)
                }
                DiscoveryMode::FullListing => format!("{}, full listing", folder),
            }
        }
    }
}

fn format_secs(secs: f64) -> String {
    if secs >= 60.0 {
        format!("{}m {:02}s", (secs / 60.0) as u64, (secs % 60.0) as u64)
    } else {
        format!("{:.1}s", secs)
    }
}

fn colored_outcome(outcome: RunOutcome) -> String {
    match outcome {
        RunOutcome::Success => outcome.to_string().bright_green().to_string(),
        RunOutcome::Partial => outcome.to_string().bright_yellow().to_string(),
        RunOutcome::Failure => outcome.to_string().bright_red().to_string(),
    }
}

fn print_header(text: &str) {
    println!("\n{} {}", "=>".bright_green(), text.bold());
}

fn print_success(text: &str) {
    println!("{} {}", "✓".bright_green(), text);
}

fn print_error(text: &str) {
    println!("{} {}", "✗".bright_red(), text);
}

fn print_info(text: &str) {
    println!("{} {}", "•".bright_blue(), text);
}

fn field(label: &str, value: impl std::fmt::Display) {
    println!("  {} {}", format!("{}:", label).bright_blue(), value);
}

fn spinner(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} {msg}") {
        pb.set_style(style);
    }
    pb.set_message(message.to_string());
    pb.enable_steady_tick(std::time::Duration::from_millis(100));
    pb
}

fn print_configuration(config: &Configuration) {
    field("Interval", format!("{} min", config.interval_minutes));
    field("Run mode", &config.run_mode);
    field("Run budget", format_secs(config.run_budget_secs as f64));
    field("Scheduler", config.scheduler_state.to_string());
}

fn print_run(run: &RunRecord, verbose: bool) {
    println!(
        "{} {} run {} ({}, {} new, {} skipped, {} chunks)",
        run.timestamp
            .with_timezone(&chrono::Local)
            .format("%Y-%m-%d %H:%M:%S")
            .to_string()
            .dimmed(),
        run.trigger,
        colored_outcome(run.outcome),
        format_secs(run.duration_secs),
        run.total_items_processed,
        run.total_items_skipped,
        run.total_chunks,
    );
    if !verbose {
        return;
    }
    for (name, stats) in &run.per_source {
        let mut notes = Vec::new();
        if stats.caught_up {
            notes.push("caught up".to_string());
        }
        if stats.budget_exhausted {
            notes.push("budget used".to_string());
        }
        if stats.failed > 0 {
            notes.push(format!("{} failed", stats.failed));
        }
        println!(
            "    {} {} new, {} skipped{}{}",
            format!("{}:", name).bright_cyan(),
            stats.processed,
            stats.skipped,
            if notes.is_empty() {
                String::new()
            } else {
                format!(" [{}]", notes.join(", "))
            },
            stats
                .error
                .as_deref()
                .map(|e| format!("\n      {}", e.bright_red()))
                .unwrap_or_default(),
        );
    }
}

fn print_outcome(outcome: &FireOutcome) {
    match outcome {
        FireOutcome::Completed { record } => {
            match record.outcome {
                RunOutcome::Success => print_success("Run finished"),
                _ => print_error("Run finished with errors"),
            }
            print_run(record, true);
        }
        FireOutcome::Paused => print_info("Scheduler is paused"),
        FireOutcome::ConditionNotMet { reason } => {
            print_info(&format!("Skipped: {}", reason.bright_yellow()))
        }
        FireOutcome::AlreadyRunning => print_info("A run is already in flight"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let daemon = DaemonClient::new(&cli.url)?;

    match cli.command {
        Commands::Status => {
            let status = daemon.status().await?;
            let s = &status.scheduler;

            print_header("Ragsync");
            field("Daemon", daemon.base());
            let state = match (s.state.to_string().as_str(), s.run_in_flight) {
                (_, true) => "running a sync".bright_green().to_string(),
                ("paused", _) => "paused".bright_yellow().to_string(),
                (state, _) => state.to_string(),
            };
            field("Scheduler", state);
            field("Interval", format!("{} min", s.interval_minutes));
            field("Run mode", &s.run_mode);
            field("Run budget", format_secs(s.run_budget_secs as f64));
            if let Some(next) = &s.next_fire {
                field("Next run", next);
            }
            field(
                "Sources",
                format!("{} ({} enabled)", status.sources, status.enabled_sources),
            );
            field(
                "Account",
                match (&status.credential.authenticated, &status.credential.identity) {
                    (true, Some(identity)) => identity.bright_green().to_string(),
                    (true, None) => "authorized".bright_green().to_string(),
                    (false, _) => "not authorized".bright_yellow().to_string(),
                },
            );
            field(
                "Runs",
                format!(
                    "{} since start, {} skipped, {} dropped",
                    s.total_runs, s.total_skips, s.total_dropped
                ),
            );

            println!("\n{}", "Last run".bold().underline());
            match &status.last_run {
                Some(run) => print_run(run, true),
                None => print_info("No runs yet"),
            }
        }

        Commands::Trigger { wait } => {
            if wait {
                let pb = spinner("Syncing...");
                let response = daemon.trigger(true).await;
                pb.finish_and_clear();
                match response? {
                    TriggerResponse::Finished(outcome) => print_outcome(&outcome),
                    TriggerResponse::AlreadyRunning => print_info("A run is already in flight"),
                    TriggerResponse::Started => print_success("Run started"),
                }
            } else {
                match daemon.trigger(false).await? {
                    TriggerResponse::AlreadyRunning => print_info("A run is already in flight"),
                    _ => print_success("Run started; see 'ragsync status' for the result"),
                }
            }
        }

        Commands::Pause => {
            daemon.pause().await?;
            print_success("Scheduled runs paused");
        }

        Commands::Resume => {
            daemon.resume().await?;
            print_success("Scheduled runs resumed");
        }

        Commands::Config {
            interval,
            mode,
            budget,
        } => {
            let config = if interval.is_none() && mode.is_none() && budget.is_none() {
                daemon.configuration().await?
            } else {
                let config = daemon
                    .update_configuration(&ConfigUpdate {
                        interval_minutes: interval,
                        run_mode: mode,
                        run_budget_secs: budget,
                    })
                    .await?;
                print_success("Configuration updated (applies from the next run)");
                config
            };
            print_header("Configuration");
            print_configuration(&config);
        }

        Commands::History { limit, verbose } => {
            let runs = daemon.history(limit).await?;
            if runs.is_empty() {
                print_info("No runs yet");
            } else if verbose {
                for run in &runs {
                    print_run(run, true);
                }
            } else {
                let rows: Vec<RunRow> = runs.iter().map(RunRow::from).collect();
                println!("{}", Table::new(rows));
            }
        }

        Commands::Logs { lines } => {
            let tail = daemon.logs(lines).await?;
            match tail.file {
                Some(file) => {
                    eprintln!("{}", file.dimmed());
                    for line in tail.lines {
                        println!("{}", line);
                    }
                }
                None => print_info("No log file yet"),
            }
        }

        Commands::Sources(command) => sources(&daemon, command).await?,

        Commands::Auth(command) => auth(&daemon, command).await?,

        Commands::Folders { parent } => {
            let folders = daemon.folders(parent.as_deref()).await?;
            if folders.is_empty() {
                print_info("No folders here");
            } else {
                let rows: Vec<FolderRow> = folders
                    .into_iter()
                    .map(|f| FolderRow {
                        id: f.id,
                        name: f.name,
                    })
                    .collect();
                println!("{}", Table::new(rows));
            }
        }
    }

    Ok(())
}

async fn sources(daemon: &DaemonClient, command: SourceCommands) -> Result<()> {
    match command {
        SourceCommands::List => {
            let sources = daemon.list_sources().await?;
            if sources.is_empty() {
                print_info("No sources yet. Try 'ragsync sources add-local <name> <path>'");
            } else {
                let rows: Vec<SourceRow> = sources.iter().map(SourceRow::from).collect();
                println!("{}", Table::new(rows));
            }
        }

        SourceCommands::Show { id } => {
            let source = daemon.get_source(id).await?;
            print_header(&source.name);
            field("ID", source.id);
            field("Kind", source.kind());
            field("Enabled", source.enabled);
            field("Scope", describe_scope(&source.config));
            field("Added", source.created_at.format("%Y-%m-%d %H:%M"));
        }

        SourceCommands::AddLocal {
            name,
            path,
            no_recursive,
        } => {
            // The daemon may run elsewhere; it validates the path on each run
            if !path.is_dir() {
                print_info(&format!(
                    "{} is not a directory on this machine",
                    path.display()
                ));
            }
            let path = std::fs::canonicalize(&path).unwrap_or(path);
            let source = daemon
                .create_source(&NewSource::local(&name, path, !no_recursive))
                .await?;
            print_success(&format!(
                "Added local source {} (id {})",
                source.name.bright_cyan(),
                source.id
            ));
        }

        SourceCommands::AddRemote {
            name,
            folder,
            full,
            lookback_days,
        } => {
            let config = RemoteSourceConfig {
                folder_id: folder,
                discovery_mode: if full {
                    DiscoveryMode::FullListing
                } else {
                    DiscoveryMode::RecentlyTouched
                },
                lookback_days,
            };
            let source = daemon
                .create_source(&NewSource::remote(&name, config))
                .await?;
            print_success(&format!(
                "Added remote source {} (id {})",
                source.name.bright_cyan(),
                source.id
            ));
        }

        SourceCommands::Enable { id } => set_enabled(daemon, id, true).await?,

        SourceCommands::Disable { id } => set_enabled(daemon, id, false).await?,

        SourceCommands::Remove { id, yes } => {
            let source = daemon.get_source(id).await?;
            if !yes {
                let confirmed = Confirm::new()
                    .with_prompt(format!(
                        "Remove source '{}'? Indexed content stays in the index",
                        source.name
                    ))
                    .default(false)
                    .interact()?;
                if !confirmed {
                    print_info("Cancelled");
                    return Ok(());
                }
            }
            daemon.delete_source(id).await?;
            print_success(&format!("Removed {}", source.name.bright_cyan()));
        }
    }
    Ok(())
}

async fn set_enabled(daemon: &DaemonClient, id: SourceId, enabled: bool) -> Result<()> {
    let source = daemon
        .update_source(
            id,
            &SourceUpdate {
                enabled: Some(enabled),
                ..Default::default()
            },
        )
        .await?;
    print_success(&format!(
        "{} {}",
        if enabled { "Enabled" } else { "Disabled" },
        source.name.bright_cyan()
    ));
    Ok(())
}

async fn auth(daemon: &DaemonClient, command: AuthCommands) -> Result<()> {
    match command {
        AuthCommands::Status => {
            let status = daemon.auth_status().await?;
            if status.authenticated {
                print_success(&format!(
                    "Authorized as {}",
                    status
                        .identity
                        .as_deref()
                        .unwrap_or("unknown account")
                        .bright_cyan()
                ));
            } else {
                print_info("Not authorized. Run 'ragsync auth login'");
            }
        }

        AuthCommands::Url => {
            println!("{}", daemon.authorization_url().await?);
        }

        AuthCommands::Login { code } => {
            let code = match code {
                Some(code) => code,
                None => {
                    let url = daemon.authorization_url().await?;
                    print_header("Open this URL and approve access:");
                    println!("\n  {}\n", url.bright_cyan());
                    Input::<String>::new()
                        .with_prompt("Paste the authorization code")
                        .interact_text()?
                }
            };
            if code.trim().is_empty() {
                bail!("no authorization code given");
            }

            let pb = spinner("Exchanging code...");
            let identity = daemon.exchange_code(code.trim()).await;
            pb.finish_and_clear();
            print_success(&format!("Authorized as {}", identity?.bright_cyan()));
        }

        AuthCommands::Logout => {
            daemon.revoke().await?;
            print_success("Stored credential removed");
        }
    }
    Ok(())
}
