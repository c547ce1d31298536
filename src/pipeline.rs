//! Pipeline orchestrator: ENUMERATE → per conversation DETECT →
//! [RENDER → CATALOG] | SKIP → SUMMARIZE.
//!
//! Failures are accumulated, never raised: one bad conversation out of
//! thousands costs one summary entry, not the run. Artifacts already
//! committed for other conversations are untouched by a later failure.
use chrono::{DateTime, Utc};
use eyre::{Context, Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use std::fs;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use crate::catalog::{Catalog, ConversationRow, MessageRow};
use crate::detect::{self, Decision, SkipReason, StoredState};
use crate::hash;
use crate::record::Conversation;
use crate::rebuild;
use crate::render::{self, RenderOutput};
use crate::source;

/// Fully resolved run configuration; no process-wide state.
#[derive(Debug, Clone)]
pub struct ExportConfig {
    /// Scrape dump to enumerate. Unused (and optional) in index-only mode.
    pub input: Option<PathBuf>,
    pub output_dir: PathBuf,
    pub db_path: PathBuf,
    pub build_db: bool,
    pub index_only: bool,
    pub since: Option<DateTime<Utc>>,
    pub force: bool,
    pub verbose: bool,
    pub quiet: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Input,
    Render,
    Catalog,
    Walk,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Input => f.write_str("input"),
            Stage::Render => f.write_str("render"),
            Stage::Catalog => f.write_str("catalog"),
            Stage::Walk => f.write_str("walk"),
        }
    }
}

#[derive(Debug)]
pub struct Failure {
    pub graph_id: String,
    pub stage: Stage,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct RunSummary {
    pub exported: usize,
    pub skipped: usize,
    pub failures: Vec<Failure>,
    pub rebuilt_conversations: usize,
    pub rebuilt_messages: usize,
    pub skipped_lines: usize,
    pub elapsed: Duration,
}

impl RunSummary {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

#[cfg(not(feature = "parallel"))]
pub(crate) enum ProcessResult {
    Exported,
    Skipped(SkipReason),
}

pub fn run(config: &ExportConfig) -> Result<RunSummary> {
    let started = Instant::now();
    let mut summary = if config.index_only {
        run_index_only(config)?
    } else {
        run_export_dispatch(config)?
    };
    summary.elapsed = started.elapsed();

    if !config.quiet {
        report(config, &summary);
    }
    Ok(summary)
}

fn run_export_dispatch(config: &ExportConfig) -> Result<RunSummary> {
    let input = config
        .input
        .as_deref()
        .ok_or_else(|| eyre!("An input scrape dump is required unless --index-only is set"))?;
    let loaded = source::load_dump(input)?;

    fs::create_dir_all(&config.output_dir).wrap_err_with(|| {
        format!(
            "Failed to create output directory: {}",
            config.output_dir.display()
        )
    })?;
    let catalog = if config.build_db {
        Some(Catalog::open(&config.db_path)?)
    } else {
        None
    };

    let mut summary = RunSummary::default();
    for err in loaded.errors {
        summary.failures.push(Failure {
            graph_id: err.graph_id,
            stage: Stage::Input,
            reason: err.reason,
        });
    }

    #[cfg(feature = "parallel")]
    crate::parallel::process_all(config, catalog.as_ref(), &loaded.conversations, &mut summary);
    #[cfg(not(feature = "parallel"))]
    process_all_sequential(config, catalog.as_ref(), &loaded.conversations, &mut summary);

    Ok(summary)
}

fn run_index_only(config: &ExportConfig) -> Result<RunSummary> {
    let catalog = Catalog::open(&config.db_path)?;
    let rebuilt = rebuild::rebuild_from_artifacts(&config.output_dir, &catalog, Utc::now())?;

    let mut summary = RunSummary {
        rebuilt_conversations: rebuilt.conversations,
        rebuilt_messages: rebuilt.messages,
        skipped_lines: rebuilt.skipped_lines,
        ..RunSummary::default()
    };
    for (slug, reason) in rebuilt.failed {
        summary.failures.push(Failure {
            graph_id: slug,
            stage: Stage::Walk,
            reason,
        });
    }
    Ok(summary)
}

#[cfg(not(feature = "parallel"))]
fn process_all_sequential(
    config: &ExportConfig,
    catalog: Option<&Catalog>,
    conversations: &[Conversation],
    summary: &mut RunSummary,
) {
    let pb = progress_bar(config, conversations.len() as u64);
    for conv in conversations {
        match process_conversation(conv, config, catalog) {
            Ok(ProcessResult::Exported) => {
                summary.exported += 1;
                if config.verbose {
                    pb.println(format!("Exported: {}", conv.slug));
                }
            }
            Ok(ProcessResult::Skipped(reason)) => {
                summary.skipped += 1;
                if config.verbose {
                    pb.println(format!("Skipped:  {} ({})", conv.slug, reason));
                }
            }
            Err(failure) => {
                pb.println(format!(
                    "Error [{}] at {}: {}",
                    failure.graph_id, failure.stage, failure.reason
                ));
                summary.failures.push(failure);
            }
        }
        pb.inc(1);
    }
    pb.finish_and_clear();
}

/// Detect, render and catalog a single conversation. Each stage failure is
/// tagged so the summary can tell a render problem from a catalog one.
#[cfg(not(feature = "parallel"))]
pub(crate) fn process_conversation(
    conv: &Conversation,
    config: &ExportConfig,
    catalog: Option<&Catalog>,
) -> std::result::Result<ProcessResult, Failure> {
    let content_hash = match decide(conv, config, catalog)? {
        Decision::Skip(reason) => {
            touch_skipped(conv, reason, catalog)?;
            return Ok(ProcessResult::Skipped(reason));
        }
        Decision::Export { content_hash } => content_hash,
    };

    let rendered = render::render_conversation(&config.output_dir, conv, &content_hash)
        .map_err(|e| fail(conv, Stage::Render, e))?;

    if let Some(cat) = catalog {
        upsert_rendered(cat, conv, &content_hash, &rendered)
            .map_err(|e| fail(conv, Stage::Catalog, e))?;
    }
    Ok(ProcessResult::Exported)
}

/// A conversation verified unchanged still gets its `last_indexed_at`
/// advanced, so the catalog records when each row was last confirmed
/// against the source. Since-filtered conversations were never examined
/// and are left alone.
pub(crate) fn touch_skipped(
    conv: &Conversation,
    reason: SkipReason,
    catalog: Option<&Catalog>,
) -> std::result::Result<(), Failure> {
    if reason == SkipReason::Unchanged
        && let Some(cat) = catalog
    {
        cat.touch_last_indexed(&conv.graph_id, Utc::now())
            .map_err(|e| fail(conv, Stage::Catalog, e))?;
    }
    Ok(())
}

pub(crate) fn decide(
    conv: &Conversation,
    config: &ExportConfig,
    catalog: Option<&Catalog>,
) -> std::result::Result<Decision, Failure> {
    let stored = if config.force {
        None
    } else {
        lookup_stored(conv, config, catalog)?
    };
    Ok(detect::decide(config.since, conv.updated_at, stored, || {
        hash::conversation_hash(&conv.title, &conv.messages)
    }))
}

/// Stored state comes from the catalog when one is attached; otherwise the
/// frontmatter of a previously rendered transcript serves, guarded by a
/// graph_id match so an unrelated conversation that happens to share a slug
/// cannot suppress an export.
fn lookup_stored(
    conv: &Conversation,
    config: &ExportConfig,
    catalog: Option<&Catalog>,
) -> std::result::Result<Option<StoredState>, Failure> {
    match catalog {
        Some(cat) => cat
            .stored_state(&conv.graph_id)
            .map_err(|e| fail(conv, Stage::Catalog, e)),
        None => Ok(render::read_frontmatter(&render::transcript_path(
            &config.output_dir,
            &conv.slug,
        ))
        .filter(|fm| fm.graph_id == conv.graph_id)
        .map(|fm| StoredState {
            content_hash: Some(fm.content_hash),
            updated_at: Some(fm.updated_at),
        })),
    }
}

pub(crate) fn upsert_rendered(
    catalog: &Catalog,
    conv: &Conversation,
    content_hash: &str,
    rendered: &RenderOutput,
) -> Result<()> {
    let now = Utc::now();
    catalog.upsert_conversation(&ConversationRow {
        graph_id: conv.graph_id.clone(),
        title: conv.title.clone(),
        slug: conv.slug.clone(),
        url: conv.url.as_ref().map(|u| u.to_string()),
        created_at: conv.created_at,
        updated_at: Some(conv.updated_at),
        parent_graph_id: conv.parent_graph_id.clone(),
        export_md_path: Some(rendered.transcript_path.to_string_lossy().to_string()),
        export_assets_path: Some(rendered.assets_path.to_string_lossy().to_string()),
        content_hash: content_hash.to_string(),
        word_count: rendered.word_count,
        page_order: conv.page_order,
        last_indexed_at: now,
    })?;

    for (m, meta) in conv.messages.iter().zip(&rendered.message_meta) {
        catalog.upsert_message(&MessageRow {
            graph_id: m.graph_id.clone(),
            conversation_graph_id: conv.graph_id.clone(),
            title: m.title.clone(),
            slug: meta.slug.clone(),
            author: m.author.clone(),
            role: m.role.as_str().to_string(),
            ordinal: m.ordinal as i64,
            created_at: m.created_at,
            updated_at: m.updated_at,
            parent_graph_id: m.parent_graph_id.clone(),
            export_md_path: Some(rendered.transcript_path.to_string_lossy().to_string()),
            export_assets_path: Some(rendered.assets_path.to_string_lossy().to_string()),
            content_hash: meta.content_hash.clone(),
            word_count: meta.word_count,
            excerpt: meta.excerpt.clone(),
            last_indexed_at: now,
        })?;
    }
    Ok(())
}

fn fail(conv: &Conversation, stage: Stage, e: eyre::Report) -> Failure {
    Failure {
        graph_id: conv.graph_id.clone(),
        stage,
        reason: format!("{:#}", e),
    }
}

pub(crate) fn progress_bar(config: &ExportConfig, total: u64) -> ProgressBar {
    if config.quiet {
        ProgressBar::hidden()
    } else {
        let bar = ProgressBar::new(total);
        bar.set_style(
            ProgressStyle::with_template(
                "{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} ({percent}%)",
            )
            .unwrap()
            .progress_chars("=>-"),
        );
        bar.println(format!("Found {} conversations.", total));
        bar
    }
}

fn report(config: &ExportConfig, summary: &RunSummary) {
    let mut line = if config.index_only {
        format!(
            "Done. Indexed {} conversations, {} messages.",
            summary.rebuilt_conversations, summary.rebuilt_messages
        )
    } else {
        format!(
            "Done. {} exported, {} skipped.",
            summary.exported, summary.skipped
        )
    };
    if summary.skipped_lines > 0 {
        line.push_str(&format!(
            " Skipped {} corrupt line(s).",
            summary.skipped_lines
        ));
    }
    if !summary.failures.is_empty() {
        line.push_str(&format!(
            " Completed with {} error(s).",
            summary.failures.len()
        ));
    }
    line.push_str(&format!(" ({:.1}s)", summary.elapsed.as_secs_f64()));
    eprintln!("{}", line);
    for f in &summary.failures {
        eprintln!("  failed [{}] at {}: {}", f.graph_id, f.stage, f.reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    fn dump_line(id: &str, updated_at: &str, texts: &[&str]) -> serde_json::Value {
        let messages: Vec<serde_json::Value> = texts
            .iter()
            .enumerate()
            .map(|(i, text)| {
                json!({
                    "graph_id": format!("{}-m{}", id, i),
                    "role": if i % 2 == 0 { "user" } else { "bot" },
                    "author": if i % 2 == 0 { "alice" } else { "Claude" },
                    "created_at": updated_at,
                    "updated_at": updated_at,
                    "content": text,
                })
            })
            .collect();
        json!({
            "graph_id": id,
            "title": format!("Chat {}", id),
            "updated_at": updated_at,
            "created_at": "2024-05-01T08:00:00Z",
            "messages": messages,
        })
    }

    fn write_dump(dir: &Path, lines: &[serde_json::Value]) -> PathBuf {
        let path = dir.join("dump.jsonl");
        let text: String = lines
            .iter()
            .map(|l| format!("{}\n", l))
            .collect();
        fs::write(&path, text).unwrap();
        path
    }

    fn config(tmp: &TempDir, input: Option<PathBuf>) -> ExportConfig {
        ExportConfig {
            input,
            output_dir: tmp.path().join("output"),
            db_path: tmp.path().join("output").join("catalog.sqlite"),
            build_db: true,
            index_only: false,
            since: None,
            force: false,
            verbose: false,
            quiet: true,
        }
    }

    #[test]
    fn fresh_export_populates_artifacts_and_catalog() {
        let tmp = TempDir::new().unwrap();
        let dump = write_dump(
            tmp.path(),
            &[dump_line("c1", "2024-05-01T10:00:00Z", &["hello", "world"])],
        );
        let cfg = config(&tmp, Some(dump));

        let summary = run(&cfg).unwrap();
        assert_eq!(summary.exported, 1);
        assert_eq!(summary.skipped, 0);
        assert!(summary.is_success());

        let transcript = cfg.output_dir.join("chat-c1").join("transcript.md");
        let text = fs::read_to_string(&transcript).unwrap();
        assert!(text.find("hello").unwrap() < text.find("world").unwrap());

        let merged = fs::read_to_string(cfg.output_dir.join("chat-c1").join("merged.jsonl")).unwrap();
        assert_eq!(merged.lines().count(), 2);

        let catalog = Catalog::open(&cfg.db_path).unwrap();
        assert_eq!(catalog.stats().unwrap().conversations, 1);
        assert_eq!(catalog.stats().unwrap().messages, 2);
        let ordinals: Vec<i64> = catalog
            .messages_for("c1")
            .unwrap()
            .iter()
            .map(|m| m.ordinal)
            .collect();
        assert_eq!(ordinals, vec![1, 2]);
    }

    #[test]
    fn unchanged_rerun_skips_and_leaves_files_alone() {
        let tmp = TempDir::new().unwrap();
        let dump = write_dump(
            tmp.path(),
            &[dump_line("c1", "2024-05-01T10:00:00Z", &["hello", "world"])],
        );
        let cfg = config(&tmp, Some(dump));

        run(&cfg).unwrap();
        let transcript = cfg.output_dir.join("chat-c1").join("transcript.md");
        let before = fs::read(&transcript).unwrap();
        let row_before = Catalog::open(&cfg.db_path)
            .unwrap()
            .conversation("c1")
            .unwrap()
            .unwrap();

        std::thread::sleep(std::time::Duration::from_millis(10));
        let summary = run(&cfg).unwrap();
        assert_eq!(summary.exported, 0);
        assert_eq!(summary.skipped, 1);
        assert_eq!(fs::read(&transcript).unwrap(), before);

        // The row is otherwise untouched, but the skip still records when
        // the conversation was last verified against the source.
        let row = Catalog::open(&cfg.db_path)
            .unwrap()
            .conversation("c1")
            .unwrap()
            .unwrap();
        assert!(row.last_indexed_at > row_before.last_indexed_at);
        assert_eq!(row.content_hash, row_before.content_hash);
    }

    #[test]
    fn edited_message_reexports_with_new_hash() {
        let tmp = TempDir::new().unwrap();
        let cfg = config(
            &tmp,
            Some(write_dump(
                tmp.path(),
                &[dump_line("c1", "2024-05-01T10:00:00Z", &["hello", "world"])],
            )),
        );
        run(&cfg).unwrap();
        let hash_before = Catalog::open(&cfg.db_path)
            .unwrap()
            .conversation("c1")
            .unwrap()
            .unwrap()
            .content_hash;

        let cfg2 = ExportConfig {
            input: Some(write_dump(
                tmp.path(),
                &[dump_line("c1", "2024-05-01T11:00:00Z", &["hello", "world!"])],
            )),
            ..cfg.clone()
        };
        let summary = run(&cfg2).unwrap();
        assert_eq!(summary.exported, 1);

        let row = Catalog::open(&cfg.db_path)
            .unwrap()
            .conversation("c1")
            .unwrap()
            .unwrap();
        assert_ne!(row.content_hash, hash_before);
        let merged =
            fs::read_to_string(cfg.output_dir.join("chat-c1").join("merged.jsonl")).unwrap();
        assert!(merged.contains("world!"));
    }

    #[test]
    fn since_filter_skips_old_conversations() {
        let tmp = TempDir::new().unwrap();
        let dump = write_dump(
            tmp.path(),
            &[dump_line("c1", "2024-05-01T10:00:00Z", &["hello"])],
        );
        let mut cfg = config(&tmp, Some(dump));
        cfg.since = Some("2024-06-01T00:00:00Z".parse().unwrap());

        let summary = run(&cfg).unwrap();
        assert_eq!(summary.exported, 0);
        assert_eq!(summary.skipped, 1);
        assert!(!cfg.output_dir.join("chat-c1").exists());
    }

    #[test]
    fn frontmatter_skip_works_without_catalog() {
        let tmp = TempDir::new().unwrap();
        let dump = write_dump(
            tmp.path(),
            &[dump_line("c1", "2024-05-01T10:00:00Z", &["hello"])],
        );
        let mut cfg = config(&tmp, Some(dump));
        cfg.build_db = false;

        let first = run(&cfg).unwrap();
        assert_eq!(first.exported, 1);
        assert!(!cfg.db_path.exists());

        let second = run(&cfg).unwrap();
        assert_eq!(second.exported, 0);
        assert_eq!(second.skipped, 1);
    }

    #[test]
    fn force_reexports_unchanged_conversations() {
        let tmp = TempDir::new().unwrap();
        let dump = write_dump(
            tmp.path(),
            &[dump_line("c1", "2024-05-01T10:00:00Z", &["hello"])],
        );
        let mut cfg = config(&tmp, Some(dump));
        run(&cfg).unwrap();

        cfg.force = true;
        let summary = run(&cfg).unwrap();
        assert_eq!(summary.exported, 1);
        assert_eq!(summary.skipped, 0);
    }

    #[test]
    fn malformed_record_fails_in_isolation() {
        let tmp = TempDir::new().unwrap();
        let dump = write_dump(
            tmp.path(),
            &[
                json!({"graph_id": "bad", "title": "no updated_at", "messages": []}),
                dump_line("c1", "2024-05-01T10:00:00Z", &["hello"]),
            ],
        );
        let cfg = config(&tmp, Some(dump));

        let summary = run(&cfg).unwrap();
        assert_eq!(summary.exported, 1);
        assert_eq!(summary.failures.len(), 1);
        assert_eq!(summary.failures[0].graph_id, "bad");
        assert_eq!(summary.failures[0].stage, Stage::Input);
        assert!(!summary.is_success());
    }

    #[test]
    fn index_only_rebuild_matches_build_db_catalog() {
        let tmp = TempDir::new().unwrap();
        let dump = write_dump(
            tmp.path(),
            &[
                dump_line("c1", "2024-05-01T10:00:00Z", &["hello", "world"]),
                dump_line("c2", "2024-05-02T10:00:00Z", &["hey"]),
            ],
        );
        let cfg = config(&tmp, Some(dump));
        run(&cfg).unwrap();

        let original: Vec<_> = {
            let catalog = Catalog::open(&cfg.db_path).unwrap();
            ["c1", "c2"]
                .iter()
                .map(|id| catalog.conversation(id).unwrap().unwrap())
                .collect()
        };

        fs::remove_file(&cfg.db_path).unwrap();
        let mut index_cfg = cfg.clone();
        index_cfg.index_only = true;
        let summary = run(&index_cfg).unwrap();
        assert_eq!(summary.rebuilt_conversations, 2);
        assert_eq!(summary.rebuilt_messages, 3);
        assert!(summary.is_success());

        let catalog = Catalog::open(&cfg.db_path).unwrap();
        for before in &original {
            let after = catalog.conversation(&before.graph_id).unwrap().unwrap();
            assert_eq!(after.title, before.title);
            assert_eq!(after.slug, before.slug);
            assert_eq!(after.content_hash, before.content_hash);
            assert_eq!(after.word_count, before.word_count);
            assert_eq!(after.created_at, before.created_at);
            assert_eq!(after.updated_at, before.updated_at);
        }
        assert_eq!(catalog.messages_for("c1").unwrap().len(), 2);
        assert_eq!(catalog.messages_for("c2").unwrap().len(), 1);
    }
}
