//! Artifact renderer: materializes one conversation as durable files.
//!
//! Layout under the output root, keyed by the conversation slug:
//!
//! ```text
//! <root>/<conv-slug>/transcript.md                YAML frontmatter + sections
//! <root>/<conv-slug>/merged.jsonl                 one line per message, with content
//! <root>/<conv-slug>/<msg-slug>/section.jsonl     per-message metadata record
//! <root>/<conv-slug>/assets/                      reserved asset directory
//! ```
//!
//! Rendering is deterministic: unchanged input reproduces byte-identical
//! files. Every file is written to a temp file in its final directory and
//! only persisted after a successful flush, so a failed render never leaves
//! a partial file at a committed path.
use chrono::{DateTime, Utc};
use eyre::{Context, Result, eyre};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use url::Url;

use crate::hash;
use crate::record::{Conversation, Message, Role};
use crate::text;

pub const TRANSCRIPT_FILE: &str = "transcript.md";
pub const MERGED_FILE: &str = "merged.jsonl";
pub const SECTION_FILE: &str = "section.jsonl";
pub const ASSETS_DIR: &str = "assets";

pub fn conversation_dir(output_root: &Path, slug: &str) -> PathBuf {
    output_root.join(slug)
}

pub fn transcript_path(output_root: &Path, slug: &str) -> PathBuf {
    conversation_dir(output_root, slug).join(TRANSCRIPT_FILE)
}

/// Conversation metadata embedded at the top of `transcript.md`. Carries
/// everything the catalog needs so that index-only rebuild and catalog-less
/// change detection can both recover it without re-parsing message bodies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frontmatter {
    pub graph_id: String,
    pub title: String,
    pub slug: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<Url>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_graph_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_order: Option<i64>,
    pub content_hash: String,
    pub word_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportPaths {
    pub md: PathBuf,
    pub assets: PathBuf,
}

/// One `merged.jsonl` line. Includes the full message content; this file is
/// the source of truth for index-only rebuild.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergedRecord {
    #[serde(rename = "type")]
    pub kind: String,
    pub conversation_graph_id: String,
    pub graph_id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub section_title: Option<String>,
    pub section_slug: String,
    pub ordinal: u32,
    #[serde(default)]
    pub author: Option<String>,
    pub role: Role,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub parent_graph_id: Option<String>,
    pub export_paths: ExportPaths,
    pub content_hash: String,
    pub word_count: i64,
    pub excerpt: String,
    pub content: String,
}

/// The single record inside a message's `section.jsonl`: the merged record
/// minus the content body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SectionRecord {
    #[serde(rename = "type")]
    pub kind: String,
    pub conversation_graph_id: String,
    pub graph_id: String,
    #[serde(default)]
    pub section_title: Option<String>,
    pub section_slug: String,
    pub ordinal: u32,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    pub export_paths: ExportPaths,
    pub content_hash: String,
    pub word_count: i64,
    pub excerpt: String,
}

/// Derived per-message metadata, index-aligned with the conversation's
/// messages. Shared by the JSONL records and the catalog rows.
#[derive(Debug, Clone)]
pub struct MessageMeta {
    pub slug: String,
    pub content_hash: String,
    pub word_count: i64,
    pub excerpt: String,
}

#[derive(Debug)]
pub struct RenderOutput {
    pub conversation_dir: PathBuf,
    pub transcript_path: PathBuf,
    pub merged_path: PathBuf,
    pub assets_path: PathBuf,
    /// Total across all messages.
    pub word_count: i64,
    pub message_meta: Vec<MessageMeta>,
}

fn message_meta(m: &Message) -> MessageMeta {
    MessageMeta {
        slug: text::message_slug(m.ordinal, m.title.as_deref(), &m.content),
        content_hash: hash::content_hash(&m.content),
        word_count: text::count_words(&m.content),
        excerpt: text::excerpt(&m.content),
    }
}

fn render_transcript(conv: &Conversation, content_hash: &str, word_count: i64) -> Result<String> {
    let fm = Frontmatter {
        graph_id: conv.graph_id.clone(),
        title: conv.title.clone(),
        slug: conv.slug.clone(),
        url: conv.url.clone(),
        created_at: conv.created_at,
        updated_at: conv.updated_at,
        parent_graph_id: conv.parent_graph_id.clone(),
        page_order: conv.page_order,
        content_hash: content_hash.to_string(),
        word_count,
    };

    let mut out = String::new();
    out.push_str("---\n");
    out.push_str(&serde_yaml::to_string(&fm).wrap_err("Failed to serialize frontmatter")?);
    out.push_str("---\n\n");
    out.push_str(&format!("# {}\n", conv.title));

    for m in &conv.messages {
        let author = m.author.as_deref().unwrap_or(m.role.as_str());
        match m.created_at {
            Some(ts) => out.push_str(&format!(
                "\n## [{}] {} — {}\n\n",
                m.ordinal,
                author,
                ts.to_rfc3339()
            )),
            None => out.push_str(&format!("\n## [{}] {}\n\n", m.ordinal, author)),
        }
        out.push_str(&m.content);
        out.push('\n');
    }
    Ok(out)
}

fn merged_record(conv: &Conversation, m: &Message, meta: &MessageMeta, paths: &ExportPaths) -> MergedRecord {
    MergedRecord {
        kind: "message".to_string(),
        conversation_graph_id: conv.graph_id.clone(),
        graph_id: m.graph_id.clone(),
        title: m.title.clone(),
        section_title: m.title.clone(),
        section_slug: meta.slug.clone(),
        ordinal: m.ordinal,
        author: m.author.clone(),
        role: m.role,
        created_at: m.created_at,
        updated_at: m.updated_at,
        parent_graph_id: m.parent_graph_id.clone(),
        export_paths: paths.clone(),
        content_hash: meta.content_hash.clone(),
        word_count: meta.word_count,
        excerpt: meta.excerpt.clone(),
        content: m.content.clone(),
    }
}

fn section_record(rec: &MergedRecord) -> SectionRecord {
    SectionRecord {
        kind: rec.kind.clone(),
        conversation_graph_id: rec.conversation_graph_id.clone(),
        graph_id: rec.graph_id.clone(),
        section_title: rec.section_title.clone(),
        section_slug: rec.section_slug.clone(),
        ordinal: rec.ordinal,
        created_at: rec.created_at,
        updated_at: rec.updated_at,
        export_paths: rec.export_paths.clone(),
        content_hash: rec.content_hash.clone(),
        word_count: rec.word_count,
        excerpt: rec.excerpt.clone(),
    }
}

/// Write `bytes` to `path` through a flushed temp file in the same
/// directory, renaming into place only on success.
fn commit(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| eyre!("No parent directory for {}", path.display()))?;
    let mut tmp = NamedTempFile::new_in(dir)
        .wrap_err_with(|| format!("Failed to create temp file in {}", dir.display()))?;
    tmp.write_all(bytes)
        .and_then(|_| tmp.flush())
        .wrap_err_with(|| format!("Failed to write {}", path.display()))?;
    tmp.persist(path)
        .map_err(|e| eyre!("Failed to commit {}: {}", path.display(), e.error))?;
    Ok(())
}

/// Render all artifacts for one conversation. `content_hash` is the
/// conversation-level digest already computed by change detection.
pub fn render_conversation(
    output_root: &Path,
    conv: &Conversation,
    content_hash: &str,
) -> Result<RenderOutput> {
    let conv_dir = conversation_dir(output_root, &conv.slug);
    let assets_path = conv_dir.join(ASSETS_DIR);
    fs::create_dir_all(&assets_path)
        .wrap_err_with(|| format!("Failed to create {}", assets_path.display()))?;

    let transcript = conv_dir.join(TRANSCRIPT_FILE);
    let merged = conv_dir.join(MERGED_FILE);

    let meta: Vec<MessageMeta> = conv.messages.iter().map(message_meta).collect();
    let word_count = meta.iter().map(|m| m.word_count).sum();

    let export_paths = ExportPaths {
        md: transcript.clone(),
        assets: assets_path.clone(),
    };

    let transcript_text = render_transcript(conv, content_hash, word_count)?;
    commit(&transcript, transcript_text.as_bytes())?;

    let records: Vec<MergedRecord> = conv
        .messages
        .iter()
        .zip(&meta)
        .map(|(m, meta)| merged_record(conv, m, meta, &export_paths))
        .collect();

    let mut merged_bytes = Vec::new();
    for rec in &records {
        serde_json::to_writer(&mut merged_bytes, rec)
            .wrap_err_with(|| format!("Failed to serialize message {}", rec.graph_id))?;
        merged_bytes.push(b'\n');
    }
    commit(&merged, &merged_bytes)?;

    for rec in &records {
        let section_dir = conv_dir.join(&rec.section_slug);
        fs::create_dir_all(&section_dir)
            .wrap_err_with(|| format!("Failed to create {}", section_dir.display()))?;
        let mut bytes = Vec::new();
        serde_json::to_writer(&mut bytes, &section_record(rec))
            .wrap_err_with(|| format!("Failed to serialize section {}", rec.section_slug))?;
        bytes.push(b'\n');
        commit(&section_dir.join(SECTION_FILE), &bytes)?;
    }

    Ok(RenderOutput {
        conversation_dir: conv_dir,
        transcript_path: transcript,
        merged_path: merged,
        assets_path,
        word_count,
        message_meta: meta,
    })
}

/// Read the YAML frontmatter back out of an existing transcript. Returns
/// `None` when the file is missing or the block cannot be parsed.
pub fn read_frontmatter(path: &Path) -> Option<Frontmatter> {
    let text = fs::read_to_string(path).ok()?;
    let rest = text.strip_prefix("---\n")?;
    let end = rest.find("\n---\n")?;
    serde_yaml::from_str(&rest[..end]).ok()
}
