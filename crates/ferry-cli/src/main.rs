//! Ferry CLI
//!
//! Replays engine event logs through the orchestrator and manages the
//! persisted transfer history.

mod config;
mod progress;
mod replay;

use clap::{Parser, Subcommand};
use console::style;
use ferry_core::{
    ConfigStore, FileStorage, HistoryFilter, HistoryRecord, HistoryStatus, HistoryStore,
    MemoryStorage, Protocol, SortDirection, SortField, SortOptions, Storage, TransferDirection,
    TransferOrchestrator,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use config::Config;
use progress::{format_bytes, format_seconds, format_speed};
use replay::{EventLog, RecordingEngine};

/// Ferry - transfer orchestration
#[derive(Parser)]
#[command(name = "ferry")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Feed a JSON-lines engine event log through the orchestrator
    Replay {
        /// Event log
        #[arg(required = true)]
        file: PathBuf,

        /// Divide the recorded gaps between events by this factor
        #[arg(long, default_value_t = 1.0)]
        speed_up: f64,

        /// Keep history in memory only
        #[arg(long)]
        no_persist: bool,
    },

    /// Query and maintain transfer history
    History {
        #[command(subcommand)]
        command: HistoryCommand,
    },

    /// Inspect configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Subcommand)]
enum HistoryCommand {
    /// List records
    List {
        /// Only this outcome (completed, failed, cancelled)
        #[arg(long)]
        status: Option<HistoryStatus>,

        /// Only this protocol (tcp, udp)
        #[arg(long)]
        protocol: Option<Protocol>,

        /// Only this direction (sent, received)
        #[arg(long)]
        mode: Option<TransferDirection>,

        /// Case-insensitive search over file name, target and checksum
        #[arg(long)]
        search: Option<String>,

        /// Sort field
        #[arg(long, default_value = "timestamp")]
        sort: SortField,

        /// Ascending order
        #[arg(long)]
        asc: bool,

        /// Show at most this many records
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Show aggregate statistics
    Stats,

    /// Write history as JSON (`-` for stdout)
    Export {
        /// Output file
        file: PathBuf,
    },

    /// Merge records from a JSON export
    Import {
        /// Input file
        file: PathBuf,
    },

    /// Delete every record
    Clear {
        /// Confirm deletion
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Print the effective configuration
    Show,
    /// Check configuration and stored transfer settings
    Validate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(Config::default_path);
    let config = if cli.config.is_some() {
        Config::load(&config_path)?
    } else {
        Config::load_or_default(&config_path)?
    };

    // Initialize logging
    let level = if cli.verbose {
        "debug".to_string()
    } else {
        config.logging.level.to_lowercase()
    };
    tracing_subscriber::fmt()
        .with_env_filter(level.as_str())
        .with_writer(std::io::stderr)
        .init();

    console::set_colors_enabled(config.presentation.color);

    match cli.command {
        Commands::Replay {
            file,
            speed_up,
            no_persist,
        } => {
            config.validate()?;
            run_replay(&file, speed_up, no_persist, &config).await?;
        }
        Commands::History { command } => {
            config.validate()?;
            run_history(command, &config)?;
        }
        Commands::Config { command } => match command {
            ConfigCommand::Show => show_config(&config_path, &config)?,
            ConfigCommand::Validate => validate_config(&config)?,
        },
    }

    Ok(())
}

fn open_storage(config: &Config) -> anyhow::Result<Arc<dyn Storage>> {
    let storage = FileStorage::open(&config.storage.data_dir)?;
    tracing::debug!("Using storage at {}", storage.dir().display());
    Ok(Arc::new(storage))
}

/// Replay an event log
async fn run_replay(
    file: &Path,
    speed_up: f64,
    no_persist: bool,
    config: &Config,
) -> anyhow::Result<()> {
    if speed_up.is_nan() || speed_up <= 0.0 {
        anyhow::bail!("--speed-up must be positive");
    }

    let log = EventLog::read(file)?;
    if log.events.is_empty() {
        anyhow::bail!("No events in {}", file.display());
    }

    let storage: Arc<dyn Storage> = if no_persist {
        Arc::new(MemoryStorage::new())
    } else {
        open_storage(config)?
    };

    let orchestrator = TransferOrchestrator::new(
        Arc::new(RecordingEngine::default()),
        storage,
        config.orchestrator_settings(),
    );
    orchestrator.initialize().await?;

    let summary = replay::replay(&orchestrator, log, speed_up).await?;

    if let Some(snapshot) = orchestrator.snapshot() {
        println!("Final: {}", replay::describe_snapshot(&snapshot));
    }
    if let Some(err) = orchestrator.last_error().await {
        println!(
            "Last error: {} ({})",
            err.message,
            style(err.code.as_str()).red()
        );
    }

    let history_len = orchestrator.history().read().await.len();
    replay::print_summary(&summary, history_len, file);

    orchestrator.cleanup().await;
    Ok(())
}

fn run_history(command: HistoryCommand, config: &Config) -> anyhow::Result<()> {
    let mut store = HistoryStore::load(open_storage(config)?);

    match command {
        HistoryCommand::List {
            status,
            protocol,
            mode,
            search,
            sort,
            asc,
            limit,
        } => {
            store.set_filter(HistoryFilter {
                status,
                protocol,
                mode,
                ..Default::default()
            });
            store.set_search_query(search.unwrap_or_default());
            store.set_sort_options(SortOptions {
                field: sort,
                direction: if asc {
                    SortDirection::Asc
                } else {
                    SortDirection::Desc
                },
            });

            let records = store.filtered_records();
            if records.is_empty() {
                println!("No matching records");
                return Ok(());
            }
            let shown = limit.unwrap_or(records.len());
            for record in records.iter().take(shown) {
                println!("{}", format_record(record));
            }
            if shown < records.len() {
                println!("... {} more", records.len() - shown);
            }
        }
        HistoryCommand::Stats => {
            let stats = store.stats();
            println!("Transfer History");
            println!("  Total:        {}", stats.total);
            println!("  Completed:    {}", stats.completed);
            println!("  Failed:       {}", stats.failed);
            println!("  Cancelled:    {}", stats.cancelled);
            println!("  Success rate: {:.1}%", stats.success_rate);
            println!("  Transferred:  {}", format_bytes(stats.total_bytes));
            println!("  Time:         {}", format_seconds(stats.total_duration));
            println!("  Avg speed:    {}", format_speed(stats.average_speed));
            println!(
                "  Protocols:    tcp {} / udp {}",
                stats.by_protocol.tcp, stats.by_protocol.udp
            );
            println!(
                "  Directions:   sent {} / received {}",
                stats.by_mode.sent, stats.by_mode.received
            );
        }
        HistoryCommand::Export { file } => {
            let json = store.export_history()?;
            if file.as_os_str() == "-" {
                println!("{json}");
            } else {
                std::fs::write(&file, json)?;
                println!("Exported {} records to {}", store.len(), file.display());
            }
        }
        HistoryCommand::Import { file } => {
            let json = std::fs::read_to_string(&file)?;
            let result = store.import_history(&json);
            if !result.success {
                anyhow::bail!(
                    "Import failed: {}",
                    result.errors.first().map_or("invalid input", String::as_str)
                );
            }
            println!(
                "Imported {} records ({} skipped)",
                result.imported, result.skipped
            );
            for error in &result.errors {
                println!("  {}", style(error).yellow());
            }
        }
        HistoryCommand::Clear { yes } => {
            if !yes {
                anyhow::bail!("Refusing to clear {} records without --yes", store.len());
            }
            let removed = store.len();
            store.clear_history();
            println!("Removed {removed} records");
        }
    }

    Ok(())
}

fn format_record(record: &HistoryRecord) -> String {
    let status = match record.status {
        HistoryStatus::Completed => style(record.status.to_string()).green(),
        HistoryStatus::Failed => style(record.status.to_string()).red(),
        HistoryStatus::Cancelled => style(record.status.to_string()).yellow(),
    };
    let mut line = format!(
        "{}  {:<9}  {:<8}  {}  {:>12}  {}",
        record.timestamp.format("%Y-%m-%d %H:%M:%S"),
        status,
        record.mode,
        record.protocol,
        format_bytes(record.size),
        record.filename
    );
    if !record.target.is_empty() {
        line.push_str(&format!(" ({})", record.target));
    }
    if let Some(error) = &record.error {
        line.push_str(&format!(": {error}"));
    }
    line
}

/// Show configuration
fn show_config(path: &Path, config: &Config) -> anyhow::Result<()> {
    println!("# {}", path.display());
    println!("{}", toml::to_string_pretty(config)?);

    let store = ConfigStore::load(open_storage(config)?);
    println!("# stored transfer settings");
    println!("{}", serde_json::to_string_pretty(store.current())?);
    Ok(())
}

/// Validate configuration
fn validate_config(config: &Config) -> anyhow::Result<()> {
    config.validate()?;
    println!("{} CLI configuration", style("ok").green());

    let store = ConfigStore::load(open_storage(config)?);
    match store.validated() {
        Ok(_) => println!("{} stored transfer settings", style("ok").green()),
        Err(e) => anyhow::bail!("Stored transfer settings are invalid: {e}"),
    }
    Ok(())
}
