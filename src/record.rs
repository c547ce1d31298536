//! Typed records for the conversation stream handed over by the scraping
//! collaborator, and the validation applied at that boundary.
//!
//! The wire shapes (`RawConversation`, `RawMessage`) mirror the scrape dump
//! exactly; `Conversation::try_from` is where loose upstream data becomes a
//! record the pipeline can trust: non-empty ids, unique message ids, ordinals
//! that are strictly increasing and gap-free, resolved title and slug.
use chrono::{DateTime, Utc};
use eyre::{Result, bail};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use url::Url;

use crate::text;

/// Conversation turn role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    /// Accepts "assistant" as a legacy spelling from older dumps.
    #[serde(alias = "assistant")]
    Bot,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Bot => "bot",
            Role::System => "system",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Wire shapes
// ---------------------------------------------------------------------------

/// One conversation as it appears in the scrape dump (JSON array element or
/// JSONL line), messages nested in display order.
#[derive(Debug, Clone, Deserialize)]
pub struct RawConversation {
    pub graph_id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub slug: Option<String>,
    #[serde(default)]
    pub url: Option<Url>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub parent_graph_id: Option<String>,
    #[serde(default)]
    pub page_order: Option<i64>,
    #[serde(default)]
    pub messages: Vec<RawMessage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawMessage {
    pub graph_id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    pub role: Role,
    #[serde(default)]
    pub ordinal: Option<u32>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub parent_graph_id: Option<String>,
    pub content: String,
}

// ---------------------------------------------------------------------------
// Validated records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Conversation {
    pub graph_id: String,
    pub title: String,
    pub slug: String,
    pub url: Option<Url>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub parent_graph_id: Option<String>,
    pub page_order: Option<i64>,
    pub messages: Vec<Message>,
}

#[derive(Debug, Clone)]
pub struct Message {
    pub graph_id: String,
    pub title: Option<String>,
    pub author: Option<String>,
    pub role: Role,
    pub ordinal: u32,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub parent_graph_id: Option<String>,
    pub content: String,
}

impl TryFrom<RawConversation> for Conversation {
    type Error = eyre::Report;

    fn try_from(raw: RawConversation) -> Result<Self> {
        let graph_id = raw.graph_id.trim().to_string();
        if graph_id.is_empty() {
            bail!("conversation graph_id is empty");
        }

        let title = raw
            .title
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .unwrap_or("Untitled Conversation")
            .to_string();

        // A supplied slug is re-slugified so upstream data can never smuggle
        // path separators into the output layout.
        let slug = match raw.slug.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            Some(s) => text::slugify(s),
            None => text::slugify(&title),
        };

        let ordinals = check_ordinals(&raw.messages)?;

        let mut seen = HashSet::new();
        let mut messages = Vec::with_capacity(raw.messages.len());
        let mut prev_graph_id: Option<String> = None;
        for (m, ordinal) in raw.messages.into_iter().zip(ordinals) {
            let msg_graph_id = m.graph_id.trim().to_string();
            if msg_graph_id.is_empty() {
                bail!("message at ordinal {} has an empty graph_id", ordinal);
            }
            if !seen.insert(msg_graph_id.clone()) {
                bail!("duplicate message graph_id {:?}", msg_graph_id);
            }
            // Threaded replies default to chaining onto the previous message;
            // the first message falls back to the conversation's parent.
            let parent_graph_id = m
                .parent_graph_id
                .or_else(|| prev_graph_id.clone())
                .or_else(|| raw.parent_graph_id.clone());
            prev_graph_id = Some(msg_graph_id.clone());
            messages.push(Message {
                graph_id: msg_graph_id,
                title: m.title,
                author: m.author,
                role: m.role,
                ordinal,
                created_at: m.created_at,
                updated_at: m.updated_at,
                parent_graph_id,
                content: m.content,
            });
        }

        Ok(Conversation {
            graph_id,
            title,
            slug,
            url: raw.url,
            created_at: raw.created_at,
            updated_at: raw.updated_at,
            parent_graph_id: raw.parent_graph_id,
            page_order: raw.page_order,
            messages,
        })
    }
}

/// Resolve message ordinals. Either every message carries one (strictly
/// increasing, gap-free, starting at 0 or 1) or none does, in which case
/// they are numbered 1..=n in input order. A mix is rejected.
fn check_ordinals(messages: &[RawMessage]) -> Result<Vec<u32>> {
    let supplied = messages.iter().filter(|m| m.ordinal.is_some()).count();
    if supplied == 0 {
        return Ok((1..=messages.len() as u32).collect());
    }
    if supplied != messages.len() {
        bail!(
            "{} of {} messages carry an ordinal; expected all or none",
            supplied,
            messages.len()
        );
    }
    let ordinals: Vec<u32> = messages.iter().map(|m| m.ordinal.unwrap_or(0)).collect();
    let first = ordinals[0];
    if first > 1 {
        bail!("ordinals must start at 0 or 1, got {}", first);
    }
    for (i, pair) in ordinals.windows(2).enumerate() {
        if pair[1] != pair[0] + 1 {
            bail!(
                "ordinals must be contiguous and increasing: {} followed by {} at position {}",
                pair[0],
                pair[1],
                i + 1
            );
        }
    }
    Ok(ordinals)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_msg(id: &str, ordinal: Option<u32>) -> RawMessage {
        RawMessage {
            graph_id: id.to_string(),
            title: None,
            author: None,
            role: Role::User,
            ordinal,
            created_at: None,
            updated_at: None,
            parent_graph_id: None,
            content: "hi".to_string(),
        }
    }

    fn raw_conv(messages: Vec<RawMessage>) -> RawConversation {
        RawConversation {
            graph_id: "c1".to_string(),
            title: Some("A Chat".to_string()),
            slug: None,
            url: None,
            created_at: None,
            updated_at: Utc::now(),
            parent_graph_id: None,
            page_order: None,
            messages,
        }
    }

    #[test]
    fn assigns_ordinals_when_absent() {
        let conv =
            Conversation::try_from(raw_conv(vec![raw_msg("m1", None), raw_msg("m2", None)]))
                .unwrap();
        let ordinals: Vec<u32> = conv.messages.iter().map(|m| m.ordinal).collect();
        assert_eq!(ordinals, vec![1, 2]);
    }

    #[test]
    fn keeps_supplied_ordinals_from_zero() {
        let conv =
            Conversation::try_from(raw_conv(vec![raw_msg("m1", Some(0)), raw_msg("m2", Some(1))]))
                .unwrap();
        let ordinals: Vec<u32> = conv.messages.iter().map(|m| m.ordinal).collect();
        assert_eq!(ordinals, vec![0, 1]);
    }

    #[test]
    fn rejects_ordinal_gaps() {
        let res =
            Conversation::try_from(raw_conv(vec![raw_msg("m1", Some(1)), raw_msg("m2", Some(3))]));
        assert!(res.is_err());
    }

    #[test]
    fn rejects_mixed_ordinals() {
        let res =
            Conversation::try_from(raw_conv(vec![raw_msg("m1", Some(1)), raw_msg("m2", None)]));
        assert!(res.is_err());
    }

    #[test]
    fn rejects_duplicate_message_ids() {
        let res =
            Conversation::try_from(raw_conv(vec![raw_msg("m1", None), raw_msg("m1", None)]));
        assert!(res.is_err());
    }

    #[test]
    fn rejects_empty_conversation_id() {
        let mut raw = raw_conv(vec![]);
        raw.graph_id = "  ".to_string();
        assert!(Conversation::try_from(raw).is_err());
    }

    #[test]
    fn resolves_title_and_slug() {
        let mut raw = raw_conv(vec![]);
        raw.title = None;
        let conv = Conversation::try_from(raw).unwrap();
        assert_eq!(conv.title, "Untitled Conversation");
        assert_eq!(conv.slug, "untitled-conversation");

        let mut raw = raw_conv(vec![]);
        raw.slug = Some("My/Unsafe Slug".to_string());
        let conv = Conversation::try_from(raw).unwrap();
        assert_eq!(conv.slug, "my-unsafe-slug");
    }

    #[test]
    fn chains_parent_ids() {
        let conv =
            Conversation::try_from(raw_conv(vec![raw_msg("m1", None), raw_msg("m2", None)]))
                .unwrap();
        assert_eq!(conv.messages[0].parent_graph_id, None);
        assert_eq!(conv.messages[1].parent_graph_id.as_deref(), Some("m1"));
    }

    #[test]
    fn role_parses_legacy_assistant() {
        let role: Role = serde_json::from_str("\"assistant\"").unwrap();
        assert_eq!(role, Role::Bot);
        assert_eq!(serde_json::to_string(&Role::Bot).unwrap(), "\"bot\"");
    }
}
