//! Administrative CLI for depot.

mod api_client;

use anyhow::Result;
use api_client::{
    ApiClient, CacheStats, EntryView, HealthReport, PruneRequest, SearchQuery, SweepReport,
    SweepRun,
};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "depotctl")]
#[command(about = "Administrative CLI for depot")]
#[command(version)]
struct Cli {
    #[command(flatten)]
    api: ApiArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone)]
struct ApiArgs {
    /// Server URL
    #[arg(long, global = true, env = "DEPOT_SERVER", default_value = "http://127.0.0.1:3000")]
    server: String,

    /// Bearer token, when the server requires one
    #[arg(long, global = true, env = "DEPOT_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Output format
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Table)]
    format: OutputFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// List committed cache entries
    List {
        /// Key pattern, `*` matches anything
        #[arg(long)]
        key: Option<String>,
        #[arg(long)]
        limit: Option<i64>,
    },
    /// Show one entry
    Get { id: i64 },
    /// Delete an entry and its stored object
    Delete { id: i64 },
    /// Evict entries not accessed for a number of days
    Prune {
        /// Defaults to the server's retention
        #[arg(long)]
        older_than_days: Option<u32>,
        #[arg(long)]
        scope: Option<String>,
        /// Only list what would be removed
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },
    /// Cache statistics
    Stats {
        /// Include recent activity and entries
        #[arg(long, default_value_t = false)]
        detailed: bool,
    },
    /// Search keys by substring
    Search {
        query: String,
        #[arg(long)]
        scope: Option<String>,
        /// RFC 3339 lower bound on creation time
        #[arg(long)]
        created_after: Option<String>,
        /// RFC 3339 upper bound on creation time
        #[arg(long)]
        created_before: Option<String>,
        #[arg(long)]
        limit: Option<i64>,
    },
    /// Run a scheduled sweep now (`cache` or `uploads`)
    Sweep { kind: String },
    /// Check server health
    Health,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let Cli { api, command } = Cli::parse();
    let client = ApiClient::new(&api.server, api.token.as_deref())?;
    let format = api.format;

    match command {
        Commands::List { key, limit } => {
            let list = client.list_entries(key.as_deref(), limit).await?;
            emit(format, &list, || print_entries(&list.entries))
        }
        Commands::Get { id } => {
            let entry = client.get_entry(id).await?;
            emit(format, &entry, || print_entry(&entry))
        }
        Commands::Delete { id } => {
            let entry = client.delete_entry(id).await?;
            emit(format, &entry, || {
                println!("Deleted entry {} ({})", entry.id, entry.key)
            })
        }
        Commands::Prune {
            older_than_days,
            scope,
            dry_run,
        } => {
            let report = client
                .prune(&PruneRequest {
                    older_than_days,
                    scope,
                    dry_run,
                })
                .await?;
            emit(format, &report, || print_prune_report(&report))
        }
        Commands::Stats { detailed } => {
            let stats = client.stats(detailed).await?;
            emit(format, &stats, || print_stats(&stats))
        }
        Commands::Search {
            query,
            scope,
            created_after,
            created_before,
            limit,
        } => {
            let list = client
                .search(&SearchQuery {
                    query,
                    scope,
                    created_after,
                    created_before,
                    limit,
                })
                .await?;
            emit(format, &list, || print_entries(&list.entries))
        }
        Commands::Sweep { kind } => {
            let run = client.run_sweep(&kind).await?;
            emit(format, &run, || print_sweep_run(&run))
        }
        Commands::Health => {
            let report = client.health().await?;
            emit(format, &report, || print_health(&report))?;
            if !report.is_healthy() {
                anyhow::bail!("server is degraded");
            }
            Ok(())
        }
    }
}

fn emit<T: Serialize>(format: OutputFormat, value: &T, table: impl FnOnce()) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
        OutputFormat::Table => table(),
    }
    Ok(())
}

fn print_entries(entries: &[EntryView]) {
    if entries.is_empty() {
        println!("No entries found.");
        return;
    }
    let key_width = entries
        .iter()
        .map(|e| e.key.len())
        .max()
        .unwrap_or(0)
        .max(3);
    println!(
        "{:>8}  {:<key_width$}  {:<12}  {:<16}  {:>10}  ACCESSED",
        "ID", "KEY", "VERSION", "SCOPE", "SIZE"
    );
    for entry in entries {
        println!(
            "{:>8}  {:<key_width$}  {:<12}  {:<16}  {:>10}  {}",
            entry.id,
            entry.key,
            truncate(&entry.version, 12),
            truncate(&entry.scope, 16),
            format_bytes(entry.size_bytes),
            entry.accessed_at
        );
    }
    println!("\n{} entries", entries.len());
}

fn print_entry(entry: &EntryView) {
    println!("Cache Entry {}", entry.id);
    println!("  Key: {}", entry.key);
    println!("  Version: {}", entry.version);
    println!("  Scope: {}", entry.scope);
    println!("  State: {}", entry.state);
    println!("  Size: {}", format_bytes(entry.size_bytes));
    println!("  Created: {}", entry.created_at);
    println!("  Updated: {}", entry.updated_at);
    println!("  Accessed: {}", entry.accessed_at);
}

fn print_prune_report(report: &SweepReport) {
    if report.dry_run {
        println!("Dry run: {} entries would be removed", report.candidates.len());
        for candidate in &report.candidates {
            println!(
                "  {:>8}  {}  ({}, last accessed {})",
                candidate.id,
                candidate.key,
                format_bytes(candidate.size_bytes),
                candidate.accessed_at
            );
        }
        println!("Would free: {}", format_bytes(report.bytes_freed));
        return;
    }
    println!("Prune complete");
    println!("  Scanned: {}", report.scanned);
    println!("  Deleted: {}", report.deleted);
    println!("  Freed: {}", format_bytes(report.bytes_freed));
    if report.errors > 0 {
        println!("  Errors: {}", report.errors);
    }
}

fn print_stats(stats: &CacheStats) {
    println!("Cache Statistics:");
    println!("  Entries: {}", stats.entry_count);
    println!(
        "  Total size: {}",
        format_bytes(u64::try_from(stats.total_size_bytes).unwrap_or(0))
    );
    println!("  Pending uploads: {}", stats.pending_uploads);
    if let Some(activity) = &stats.recent_activity {
        println!("  Accessed in the last hour: {}", activity.last_hour);
        println!("  Accessed in the last day: {}", activity.last_day);
        println!("  Accessed in the last week: {}", activity.last_week);
    }
    if !stats.recent_entries.is_empty() {
        println!();
        println!("Recently used:");
        print_entries(&stats.recent_entries);
    }
}

fn print_sweep_run(run: &SweepRun) {
    println!("Sweep '{}' finished (job {})", run.kind, run.job_id);
    match serde_json::to_string_pretty(&run.stats) {
        Ok(stats) => println!("{stats}"),
        Err(_) => println!("{}", run.stats),
    }
}

fn print_health(report: &HealthReport) {
    println!("Status: {}", report.status);
    println!("Server version: {}", report.version);
    for (name, component) in [("Storage", &report.storage), ("Database", &report.database)] {
        if let Some(component) = component {
            match &component.error {
                Some(error) => println!(
                    "{name}: {} ({}): {error}",
                    component.status, component.backend
                ),
                None => println!("{name}: {} ({})", component.status, component.backend),
            }
        }
    }
}

fn truncate(value: &str, width: usize) -> String {
    if value.chars().count() <= width {
        return value.to_string();
    }
    let mut out: String = value.chars().take(width.saturating_sub(1)).collect();
    out.push('~');
    out
}

fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;
    const TB: u64 = 1024 * GB;

    if bytes >= TB {
        format!("{:.2} TB", bytes as f64 / TB as f64)
    } else if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
