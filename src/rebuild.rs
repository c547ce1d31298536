//! Index-only mode: repopulate the catalog from previously rendered
//! artifacts without invoking the renderer.
//!
//! Walks the first level of the output root; every directory holding a
//! `merged.jsonl` is a conversation. Conversation metadata comes from the
//! transcript frontmatter, message rows from the merged lines. Corrupt
//! lines are skipped with a warning; a directory whose frontmatter cannot
//! be read is reported as a failed item. Neither aborts the walk.
use chrono::{DateTime, Utc};
use eyre::{Context, Result};
use std::fs;
use std::io::{BufRead, BufReader};
use std::path::Path;

use crate::catalog::{Catalog, ConversationRow, MessageRow};
use crate::render::{self, MergedRecord};

#[derive(Debug, Default)]
pub struct RebuildSummary {
    pub conversations: usize,
    pub messages: usize,
    pub skipped_lines: usize,
    /// (slug, reason) pairs for directories that could not be indexed.
    pub failed: Vec<(String, String)>,
}

pub fn rebuild_from_artifacts(
    output_root: &Path,
    catalog: &Catalog,
    indexed_at: DateTime<Utc>,
) -> Result<RebuildSummary> {
    let mut summary = RebuildSummary::default();

    let mut dirs: Vec<_> = fs::read_dir(output_root)
        .wrap_err_with(|| format!("Failed to read output root: {}", output_root.display()))?
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .map(|e| e.path())
        .collect();
    dirs.sort();

    for dir in dirs {
        let merged = dir.join(render::MERGED_FILE);
        if !merged.is_file() {
            continue;
        }
        let slug = dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        match index_conversation(&dir, &merged, catalog, indexed_at, &mut summary) {
            Ok(indexed_messages) => {
                summary.conversations += 1;
                summary.messages += indexed_messages;
            }
            Err(e) => {
                tracing::warn!(slug = %slug, error = %e, "failed to index conversation directory");
                summary.failed.push((slug, format!("{:#}", e)));
            }
        }
    }

    Ok(summary)
}

fn index_conversation(
    dir: &Path,
    merged: &Path,
    catalog: &Catalog,
    indexed_at: DateTime<Utc>,
    summary: &mut RebuildSummary,
) -> Result<usize> {
    let transcript = dir.join(render::TRANSCRIPT_FILE);
    let fm = render::read_frontmatter(&transcript)
        .ok_or_else(|| eyre::eyre!("unreadable frontmatter in {}", transcript.display()))?;

    // Even with zero readable message lines the conversation row is still
    // recoverable from the frontmatter, so index what we have.
    let records = read_merged(merged, summary)?;

    let assets = dir.join(render::ASSETS_DIR);
    catalog.upsert_conversation(&ConversationRow {
        graph_id: fm.graph_id.clone(),
        title: fm.title,
        slug: fm.slug,
        url: fm.url.map(|u| u.to_string()),
        created_at: fm.created_at,
        updated_at: Some(fm.updated_at),
        parent_graph_id: fm.parent_graph_id,
        export_md_path: transcript
            .is_file()
            .then(|| transcript.to_string_lossy().to_string()),
        export_assets_path: assets.is_dir().then(|| assets.to_string_lossy().to_string()),
        content_hash: fm.content_hash,
        word_count: fm.word_count,
        page_order: fm.page_order,
        last_indexed_at: indexed_at,
    })?;

    let mut indexed = 0usize;
    for rec in records {
        catalog.upsert_message(&MessageRow {
            graph_id: rec.graph_id,
            conversation_graph_id: rec.conversation_graph_id,
            title: rec.section_title,
            slug: rec.section_slug,
            author: rec.author,
            role: rec.role.as_str().to_string(),
            ordinal: rec.ordinal as i64,
            created_at: rec.created_at,
            updated_at: rec.updated_at,
            parent_graph_id: rec.parent_graph_id,
            export_md_path: Some(rec.export_paths.md.to_string_lossy().to_string()),
            export_assets_path: Some(rec.export_paths.assets.to_string_lossy().to_string()),
            content_hash: rec.content_hash,
            word_count: rec.word_count,
            excerpt: rec.excerpt,
            last_indexed_at: indexed_at,
        })?;
        indexed += 1;
    }
    Ok(indexed)
}

/// Stream merged.jsonl, collecting parseable records and counting the rest.
fn read_merged(path: &Path, summary: &mut RebuildSummary) -> Result<Vec<MergedRecord>> {
    let file = fs::File::open(path)
        .wrap_err_with(|| format!("Failed to open {}", path.display()))?;
    let reader = BufReader::new(file);

    let mut records = Vec::new();
    for (lineno, line) in reader.lines().enumerate() {
        let line = line.wrap_err_with(|| format!("Failed to read {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<MergedRecord>(&line) {
            Ok(rec) => records.push(rec),
            Err(e) => {
                tracing::warn!(
                    file = %path.display(),
                    line = lineno + 1,
                    error = %e,
                    "skipping corrupt merged.jsonl line"
                );
                summary.skipped_lines += 1;
            }
        }
    }
    Ok(records)
}
