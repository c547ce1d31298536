mod catalog;
mod detect;
mod hash;
#[cfg(feature = "parallel")]
mod parallel;
mod pipeline;
mod rebuild;
mod record;
mod render;
mod source;
mod text;

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use clap::{Parser, Subcommand};
use eyre::{Context, Result, eyre};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::catalog::{Catalog, SearchFilter};
use crate::pipeline::ExportConfig;

/// Export scraped Poe.com conversations to Markdown/JSONL artifacts and
/// keep a searchable SQLite catalog in sync.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Scrape dump handed over by the scraper (JSON array or JSONL of
    /// conversation records). Required unless --index-only is set.
    #[arg(long, value_name = "PATH")]
    input: Option<PathBuf>,

    /// Populate/update the catalog while exporting.
    #[arg(long)]
    build_db: bool,

    /// Rebuild the catalog from existing rendered artifacts without
    /// calling the renderer.
    #[arg(long, conflicts_with = "build_db")]
    index_only: bool,

    /// Only (re)export conversations updated at or after this timestamp
    /// (RFC 3339, or YYYY-MM-DD).
    #[arg(long, value_name = "TIMESTAMP", value_parser = parse_timestamp)]
    since: Option<DateTime<Utc>>,

    /// Root directory for rendered artifacts.
    /// Defaults to ./output if not set in config.
    #[arg(long, value_name = "PATH")]
    output_dir: Option<PathBuf>,

    /// Catalog file location.
    /// Defaults to <output-dir>/catalog.sqlite.
    #[arg(long, value_name = "PATH")]
    db_path: Option<PathBuf>,

    /// Path to a specific configuration file.
    /// Defaults to $XDG_CONFIG_HOME/poe-chat-export/config.toml
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Re-export even if nothing changed.
    #[arg(short, long)]
    force: bool,

    /// Print each conversation exported or skipped.
    #[arg(short, long)]
    verbose: bool,

    /// Suppress standard output (progress bars, summary).
    #[arg(short, long)]
    quiet: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Search indexed messages by substring.
    Search {
        query: String,

        /// Filter by message author (substring match).
        #[arg(long)]
        author: Option<String>,

        /// Only messages updated at or after this timestamp.
        #[arg(long, value_name = "TIMESTAMP", value_parser = parse_timestamp)]
        from: Option<DateTime<Utc>>,

        /// Only messages updated at or before this timestamp.
        #[arg(long, value_name = "TIMESTAMP", value_parser = parse_timestamp)]
        to: Option<DateTime<Utc>>,

        /// Max results to show.
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Show one conversation (or message) by its graph id.
    Show { graph_id: String },

    /// Show catalog statistics.
    Stats,

    /// List the most recently updated conversations.
    List {
        /// Number of conversations to show.
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

#[derive(Deserialize, Default)]
struct FileConfig {
    input: Option<PathBuf>,
    output_dir: Option<PathBuf>,
    db_path: Option<PathBuf>,
}

fn load_file_config(explicit_path: Option<&Path>) -> Result<FileConfig> {
    let path = if let Some(p) = explicit_path {
        if !p.exists() {
            return Err(eyre!("Config file not found: {}", p.display()));
        }
        Some(p.to_path_buf())
    } else {
        dirs::config_dir()
            .map(|d| d.join("poe-chat-export/config.toml"))
            .filter(|p| p.exists())
    };

    match path {
        None => Ok(FileConfig::default()),
        Some(p) => {
            let content = fs::read_to_string(&p)
                .wrap_err_with(|| format!("Failed to read config: {}", p.display()))?;
            toml::from_str(&content)
                .wrap_err_with(|| format!("Failed to parse config: {}", p.display()))
        }
    }
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        let midnight = date
            .and_hms_opt(0, 0, 0)
            .ok_or_else(|| format!("Invalid date: {}", s))?;
        return Ok(Utc.from_utc_datetime(&midnight));
    }
    Err(format!(
        "Not a recognized timestamp (RFC 3339 or YYYY-MM-DD): {}",
        s
    ))
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    // 1. Load config file (CLI path > default path)
    let file_cfg = load_file_config(cli.config.as_deref())?;

    // 2. Resolve paths (CLI > Config > Default)
    let output_dir = cli
        .output_dir
        .or(file_cfg.output_dir)
        .unwrap_or_else(|| PathBuf::from("output"));
    let db_path = cli
        .db_path
        .or(file_cfg.db_path)
        .unwrap_or_else(|| output_dir.join("catalog.sqlite"));
    let input = cli.input.or(file_cfg.input);

    // Query subcommands only read the catalog; no pipeline run.
    if let Some(command) = cli.command {
        let catalog = Catalog::open(&db_path)?;
        return match command {
            Command::Search {
                query,
                author,
                from,
                to,
                limit,
            } => run_search(
                &catalog,
                &query,
                SearchFilter {
                    author,
                    from,
                    to,
                    limit,
                },
            ),
            Command::Show { graph_id } => run_show(&catalog, &graph_id),
            Command::Stats => run_stats(&catalog),
            Command::List { limit } => run_list(&catalog, limit),
        };
    }

    if input.is_none() && !cli.index_only {
        return Err(eyre!(
            "An input scrape dump is required.\nUse --input to point at the scraper's dump file, or --index-only to rebuild the catalog from existing artifacts."
        ));
    }

    let config = ExportConfig {
        input,
        output_dir,
        db_path,
        build_db: cli.build_db,
        index_only: cli.index_only,
        since: cli.since,
        force: cli.force,
        verbose: cli.verbose,
        quiet: cli.quiet,
    };

    let summary = pipeline::run(&config)?;
    if !summary.is_success() {
        std::process::exit(1);
    }
    Ok(())
}

fn run_search(catalog: &Catalog, query: &str, filter: SearchFilter) -> Result<()> {
    let hits = catalog.search(query, &filter)?;
    if hits.is_empty() {
        println!("No matches.");
        return Ok(());
    }
    println!("Found {} matching message(s):", hits.len());
    for hit in hits {
        let author = hit.author.unwrap_or_else(|| hit.role.clone());
        let when = hit
            .updated_at
            .map(|t| t.format("%Y-%m-%d").to_string())
            .unwrap_or_else(|| "unknown".to_string());
        println!(
            "[{}] #{} {} ({}) — {}",
            hit.conversation_slug, hit.ordinal, author, hit.role, when
        );
        println!("    {}", hit.excerpt);
    }
    Ok(())
}

fn run_show(catalog: &Catalog, graph_id: &str) -> Result<()> {
    if let Some(conv) = catalog.conversation(graph_id)? {
        println!("{}  [{}]", conv.title, conv.graph_id);
        println!("  slug:       {}", conv.slug);
        if let Some(url) = &conv.url {
            println!("  url:        {}", url);
        }
        if let Some(t) = conv.updated_at {
            println!("  updated:    {}", t.to_rfc3339());
        }
        println!("  words:      {}", conv.word_count);
        println!("  hash:       {}", conv.content_hash);
        if let Some(p) = &conv.export_md_path {
            println!("  transcript: {}", p);
        }
        let messages = catalog.messages_for(graph_id)?;
        println!("  messages:   {}", messages.len());
        for m in messages {
            let author = m.author.as_deref().unwrap_or(&m.role);
            println!("    [{}] {} ({}): {}", m.ordinal, author, m.role, m.excerpt);
        }
        return Ok(());
    }
    if let Some(m) = catalog.message(graph_id)? {
        let author = m.author.as_deref().unwrap_or(&m.role);
        println!("Message [{}] in conversation {}", m.graph_id, m.conversation_graph_id);
        println!("  ordinal: {}", m.ordinal);
        println!("  author:  {} ({})", author, m.role);
        println!("  words:   {}", m.word_count);
        println!("  excerpt: {}", m.excerpt);
        return Ok(());
    }
    println!("No conversation or message with graph id {:?}.", graph_id);
    Ok(())
}

fn run_stats(catalog: &Catalog) -> Result<()> {
    let stats = catalog.stats()?;
    println!("Catalog statistics");
    println!("  Conversations: {}", stats.conversations);
    println!("  Messages:      {}", stats.messages);
    println!("  Words:         {}", stats.words);
    println!(
        "  Avg messages per conversation: {:.1}",
        stats.avg_messages_per_conversation
    );
    if let Some(t) = stats.earliest_created {
        println!("  Earliest created: {}", t.format("%Y-%m-%d"));
    }
    if let Some(t) = stats.latest_updated {
        println!("  Latest updated:   {}", t.format("%Y-%m-%d"));
    }
    if !stats.author_distribution.is_empty() {
        println!("  Top authors:");
        for (author, count) in stats.author_distribution {
            println!("    {}: {} message(s)", author, count);
        }
    }
    Ok(())
}

fn run_list(catalog: &Catalog, limit: usize) -> Result<()> {
    let rows = catalog.recent(limit)?;
    if rows.is_empty() {
        println!("No conversations in the catalog.");
        return Ok(());
    }
    for row in rows {
        let when = row
            .updated_at
            .map(|t| t.format("%Y-%m-%d").to_string())
            .unwrap_or_else(|| "unknown".to_string());
        println!("{}  {}  ({} words)", when, row.title, row.word_count);
        println!("          {}", row.slug);
    }
    Ok(())
}
