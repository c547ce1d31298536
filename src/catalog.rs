//! SQLite catalog: the durable relational mirror of everything exported.
//!
//! Two tables keyed by `graph_id` with insert-or-replace upserts. Rows are
//! created on first export, updated in place afterwards, and never deleted
//! here. `last_indexed_at` advances on every write whether or not content
//! changed. The read surface (lookup, search, stats, recent) is what the
//! query subcommands and downstream GUIs consume.
use chrono::{DateTime, Utc};
use eyre::{Context, Result};
use rusqlite::{Connection, OptionalExtension, named_params};
use std::fs;
use std::path::Path;

use crate::detect::StoredState;

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS conversations (
  graph_id TEXT PRIMARY KEY,
  title TEXT,
  slug TEXT,
  url TEXT,
  created_at TEXT,
  updated_at TEXT,
  parent_graph_id TEXT,
  export_md_path TEXT,
  export_assets_path TEXT,
  content_hash TEXT,
  word_count INTEGER,
  page_order INTEGER,
  last_indexed_at TEXT
);

CREATE TABLE IF NOT EXISTS messages (
  graph_id TEXT PRIMARY KEY,
  conversation_graph_id TEXT NOT NULL,
  title TEXT,
  slug TEXT,
  author TEXT,
  role TEXT,
  ordinal INTEGER,
  created_at TEXT,
  updated_at TEXT,
  parent_graph_id TEXT,
  export_md_path TEXT,
  export_assets_path TEXT,
  content_hash TEXT,
  word_count INTEGER,
  excerpt TEXT,
  last_indexed_at TEXT,
  FOREIGN KEY (conversation_graph_id) REFERENCES conversations(graph_id)
);

CREATE INDEX IF NOT EXISTS idx_conversations_updated_at ON conversations(updated_at);
CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(conversation_graph_id);
CREATE INDEX IF NOT EXISTS idx_messages_updated_at ON messages(updated_at);
";

#[derive(Debug, Clone)]
pub struct ConversationRow {
    pub graph_id: String,
    pub title: String,
    pub slug: String,
    pub url: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub parent_graph_id: Option<String>,
    pub export_md_path: Option<String>,
    pub export_assets_path: Option<String>,
    pub content_hash: String,
    pub word_count: i64,
    pub page_order: Option<i64>,
    pub last_indexed_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct MessageRow {
    pub graph_id: String,
    pub conversation_graph_id: String,
    pub title: Option<String>,
    pub slug: String,
    pub author: Option<String>,
    pub role: String,
    pub ordinal: i64,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub parent_graph_id: Option<String>,
    pub export_md_path: Option<String>,
    pub export_assets_path: Option<String>,
    pub content_hash: String,
    pub word_count: i64,
    pub excerpt: String,
    pub last_indexed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct SearchFilter {
    pub author: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub limit: usize,
}

#[derive(Debug, Clone)]
pub struct SearchHit {
    pub conversation_graph_id: String,
    pub conversation_title: String,
    pub conversation_slug: String,
    pub message_graph_id: String,
    pub ordinal: i64,
    pub author: Option<String>,
    pub role: String,
    pub excerpt: String,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct CatalogStats {
    pub conversations: i64,
    pub messages: i64,
    pub words: i64,
    pub avg_messages_per_conversation: f64,
    pub earliest_created: Option<DateTime<Utc>>,
    pub latest_updated: Option<DateTime<Utc>>,
    pub author_distribution: Vec<(String, i64)>,
}

pub struct Catalog {
    conn: Connection,
}

impl Catalog {
    /// Open (creating if needed) the catalog at `path` and ensure the schema.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent()
            && !dir.as_os_str().is_empty()
        {
            fs::create_dir_all(dir)
                .wrap_err_with(|| format!("Failed to create {}", dir.display()))?;
        }
        let conn = Connection::open(path)
            .wrap_err_with(|| format!("Failed to open catalog: {}", path.display()))?;
        let _mode: String = conn
            .query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))
            .wrap_err("Failed to enable WAL")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")
            .wrap_err("Failed to enable foreign keys")?;
        conn.execute_batch(SCHEMA_SQL)
            .wrap_err("Failed to ensure catalog schema")?;
        Ok(Self { conn })
    }

    /// The change-detection view of a conversation row.
    pub fn stored_state(&self, graph_id: &str) -> Result<Option<StoredState>> {
        self.conn
            .query_row(
                "SELECT content_hash, updated_at FROM conversations WHERE graph_id = ?1",
                [graph_id],
                |row| {
                    Ok(StoredState {
                        content_hash: row.get(0)?,
                        updated_at: row.get(1)?,
                    })
                },
            )
            .optional()
            .wrap_err_with(|| format!("Failed to read stored state for {}", graph_id))
    }

    pub fn upsert_conversation(&self, row: &ConversationRow) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO conversations (graph_id, title, slug, url, created_at, updated_at,
                    parent_graph_id, export_md_path, export_assets_path, content_hash,
                    word_count, page_order, last_indexed_at)
                 VALUES (:graph_id, :title, :slug, :url, :created_at, :updated_at,
                    :parent_graph_id, :export_md_path, :export_assets_path, :content_hash,
                    :word_count, :page_order, :last_indexed_at)
                 ON CONFLICT(graph_id) DO UPDATE SET
                    title = excluded.title,
                    slug = excluded.slug,
                    url = excluded.url,
                    created_at = COALESCE(conversations.created_at, excluded.created_at),
                    updated_at = excluded.updated_at,
                    parent_graph_id = excluded.parent_graph_id,
                    export_md_path = excluded.export_md_path,
                    export_assets_path = excluded.export_assets_path,
                    content_hash = excluded.content_hash,
                    word_count = excluded.word_count,
                    page_order = excluded.page_order,
                    last_indexed_at = excluded.last_indexed_at",
                named_params! {
                    ":graph_id": row.graph_id,
                    ":title": row.title,
                    ":slug": row.slug,
                    ":url": row.url,
                    ":created_at": row.created_at,
                    ":updated_at": row.updated_at,
                    ":parent_graph_id": row.parent_graph_id,
                    ":export_md_path": row.export_md_path,
                    ":export_assets_path": row.export_assets_path,
                    ":content_hash": row.content_hash,
                    ":word_count": row.word_count,
                    ":page_order": row.page_order,
                    ":last_indexed_at": row.last_indexed_at,
                },
            )
            .wrap_err_with(|| format!("Failed to upsert conversation {}", row.graph_id))?;
        Ok(())
    }

    pub fn upsert_message(&self, row: &MessageRow) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO messages (graph_id, conversation_graph_id, title, slug, author,
                    role, ordinal, created_at, updated_at, parent_graph_id, export_md_path,
                    export_assets_path, content_hash, word_count, excerpt, last_indexed_at)
                 VALUES (:graph_id, :conversation_graph_id, :title, :slug, :author,
                    :role, :ordinal, :created_at, :updated_at, :parent_graph_id, :export_md_path,
                    :export_assets_path, :content_hash, :word_count, :excerpt, :last_indexed_at)
                 ON CONFLICT(graph_id) DO UPDATE SET
                    conversation_graph_id = excluded.conversation_graph_id,
                    title = excluded.title,
                    slug = excluded.slug,
                    author = excluded.author,
                    role = excluded.role,
                    ordinal = excluded.ordinal,
                    created_at = COALESCE(messages.created_at, excluded.created_at),
                    updated_at = excluded.updated_at,
                    parent_graph_id = excluded.parent_graph_id,
                    export_md_path = excluded.export_md_path,
                    export_assets_path = excluded.export_assets_path,
                    content_hash = excluded.content_hash,
                    word_count = excluded.word_count,
                    excerpt = excluded.excerpt,
                    last_indexed_at = excluded.last_indexed_at",
                named_params! {
                    ":graph_id": row.graph_id,
                    ":conversation_graph_id": row.conversation_graph_id,
                    ":title": row.title,
                    ":slug": row.slug,
                    ":author": row.author,
                    ":role": row.role,
                    ":ordinal": row.ordinal,
                    ":created_at": row.created_at,
                    ":updated_at": row.updated_at,
                    ":parent_graph_id": row.parent_graph_id,
                    ":export_md_path": row.export_md_path,
                    ":export_assets_path": row.export_assets_path,
                    ":content_hash": row.content_hash,
                    ":word_count": row.word_count,
                    ":excerpt": row.excerpt,
                    ":last_indexed_at": row.last_indexed_at,
                },
            )
            .wrap_err_with(|| format!("Failed to upsert message {}", row.graph_id))?;
        Ok(())
    }

    /// Record that a conversation and its messages were seen and verified
    /// unchanged. Keeps `last_indexed_at` advancing even when the skip
    /// logic leaves every other column alone.
    pub fn touch_last_indexed(
        &self,
        conversation_graph_id: &str,
        indexed_at: DateTime<Utc>,
    ) -> Result<()> {
        self.conn
            .execute(
                "UPDATE conversations SET last_indexed_at = ?2 WHERE graph_id = ?1",
                rusqlite::params![conversation_graph_id, indexed_at],
            )
            .wrap_err_with(|| format!("Failed to touch conversation {}", conversation_graph_id))?;
        self.conn
            .execute(
                "UPDATE messages SET last_indexed_at = ?2 WHERE conversation_graph_id = ?1",
                rusqlite::params![conversation_graph_id, indexed_at],
            )
            .wrap_err_with(|| {
                format!("Failed to touch messages of {}", conversation_graph_id)
            })?;
        Ok(())
    }

    pub fn conversation(&self, graph_id: &str) -> Result<Option<ConversationRow>> {
        self.conn
            .query_row(
                &format!("{} WHERE graph_id = ?1", SELECT_CONVERSATION),
                [graph_id],
                conversation_from_row,
            )
            .optional()
            .wrap_err_with(|| format!("Failed to look up conversation {}", graph_id))
    }

    pub fn message(&self, graph_id: &str) -> Result<Option<MessageRow>> {
        self.conn
            .query_row(
                &format!("{} WHERE graph_id = ?1", SELECT_MESSAGE),
                [graph_id],
                message_from_row,
            )
            .optional()
            .wrap_err_with(|| format!("Failed to look up message {}", graph_id))
    }

    /// All messages of one conversation in display order.
    pub fn messages_for(&self, conversation_graph_id: &str) -> Result<Vec<MessageRow>> {
        let mut stmt = self.conn.prepare(&format!(
            "{} WHERE conversation_graph_id = ?1 ORDER BY ordinal",
            SELECT_MESSAGE
        ))?;
        let rows = stmt
            .query_map([conversation_graph_id], message_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .wrap_err_with(|| format!("Failed to list messages of {}", conversation_graph_id))?;
        Ok(rows)
    }

    pub fn recent(&self, limit: usize) -> Result<Vec<ConversationRow>> {
        let mut stmt = self.conn.prepare(&format!(
            "{} ORDER BY updated_at DESC, graph_id LIMIT {}",
            SELECT_CONVERSATION, limit as i64
        ))?;
        let rows = stmt
            .query_map([], conversation_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .wrap_err("Failed to list recent conversations")?;
        Ok(rows)
    }

    /// Substring search over message excerpts and titles plus conversation
    /// titles, optionally narrowed by author and date range.
    pub fn search(&self, query: &str, filter: &SearchFilter) -> Result<Vec<SearchHit>> {
        let mut conditions = vec![
            "(m.excerpt LIKE ?1 OR COALESCE(m.title, '') LIKE ?1 OR c.title LIKE ?1)".to_string(),
        ];
        let mut params: Vec<String> = vec![format!("%{}%", query)];

        if let Some(author) = &filter.author {
            params.push(format!("%{}%", author));
            conditions.push(format!("m.author LIKE ?{}", params.len()));
        }
        if let Some(from) = filter.from {
            params.push(from.to_rfc3339());
            conditions.push(format!(
                "datetime(COALESCE(m.updated_at, m.created_at)) >= datetime(?{})",
                params.len()
            ));
        }
        if let Some(to) = filter.to {
            params.push(to.to_rfc3339());
            conditions.push(format!(
                "datetime(COALESCE(m.updated_at, m.created_at)) <= datetime(?{})",
                params.len()
            ));
        }

        let limit = if filter.limit == 0 { 20 } else { filter.limit };
        let sql = format!(
            "SELECT m.conversation_graph_id, c.title, c.slug, m.graph_id, m.ordinal,
                    m.author, m.role, m.excerpt, m.updated_at
             FROM messages m
             JOIN conversations c ON c.graph_id = m.conversation_graph_id
             WHERE {}
             ORDER BY COALESCE(m.updated_at, m.created_at) DESC, m.graph_id
             LIMIT {}",
            conditions.join(" AND "),
            limit as i64
        );

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(params.iter()), |row| {
                Ok(SearchHit {
                    conversation_graph_id: row.get(0)?,
                    conversation_title: row.get(1)?,
                    conversation_slug: row.get(2)?,
                    message_graph_id: row.get(3)?,
                    ordinal: row.get(4)?,
                    author: row.get(5)?,
                    role: row.get::<_, Option<String>>(6)?.unwrap_or_default(),
                    excerpt: row.get::<_, Option<String>>(7)?.unwrap_or_default(),
                    updated_at: row.get(8)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .wrap_err("Search query failed")?;
        Ok(rows)
    }

    pub fn stats(&self) -> Result<CatalogStats> {
        let conversations: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM conversations", [], |r| r.get(0))?;
        let messages: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM messages", [], |r| r.get(0))?;
        let words: i64 = self.conn.query_row(
            "SELECT COALESCE(SUM(word_count), 0) FROM conversations",
            [],
            |r| r.get(0),
        )?;
        let (earliest_created, latest_updated) = self.conn.query_row(
            "SELECT MIN(created_at), MAX(updated_at) FROM conversations",
            [],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )?;

        let mut stmt = self.conn.prepare(
            "SELECT author, COUNT(*) FROM messages
             WHERE author IS NOT NULL AND author != ''
             GROUP BY author ORDER BY COUNT(*) DESC, author LIMIT 10",
        )?;
        let author_distribution = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let avg = if conversations > 0 {
            messages as f64 / conversations as f64
        } else {
            0.0
        };

        Ok(CatalogStats {
            conversations,
            messages,
            words,
            avg_messages_per_conversation: avg,
            earliest_created,
            latest_updated,
            author_distribution,
        })
    }
}

const SELECT_CONVERSATION: &str = "SELECT graph_id, title, slug, url, created_at, updated_at,
    parent_graph_id, export_md_path, export_assets_path, content_hash, word_count,
    page_order, last_indexed_at FROM conversations";

const SELECT_MESSAGE: &str = "SELECT graph_id, conversation_graph_id, title, slug, author,
    role, ordinal, created_at, updated_at, parent_graph_id, export_md_path,
    export_assets_path, content_hash, word_count, excerpt, last_indexed_at FROM messages";

fn conversation_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConversationRow> {
    Ok(ConversationRow {
        graph_id: row.get(0)?,
        title: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
        slug: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
        url: row.get(3)?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
        parent_graph_id: row.get(6)?,
        export_md_path: row.get(7)?,
        export_assets_path: row.get(8)?,
        content_hash: row.get::<_, Option<String>>(9)?.unwrap_or_default(),
        word_count: row.get::<_, Option<i64>>(10)?.unwrap_or_default(),
        page_order: row.get(11)?,
        last_indexed_at: row.get(12)?,
    })
}

fn message_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        graph_id: row.get(0)?,
        conversation_graph_id: row.get(1)?,
        title: row.get(2)?,
        slug: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
        author: row.get(4)?,
        role: row.get::<_, Option<String>>(5)?.unwrap_or_default(),
        ordinal: row.get::<_, Option<i64>>(6)?.unwrap_or_default(),
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
        parent_graph_id: row.get(9)?,
        export_md_path: row.get(10)?,
        export_assets_path: row.get(11)?,
        content_hash: row.get::<_, Option<String>>(12)?.unwrap_or_default(),
        word_count: row.get::<_, Option<i64>>(13)?.unwrap_or_default(),
        excerpt: row.get::<_, Option<String>>(14)?.unwrap_or_default(),
        last_indexed_at: row.get(15)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn ts(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, hour, 0, 0).unwrap()
    }

    fn conv_row(indexed_at: DateTime<Utc>) -> ConversationRow {
        ConversationRow {
            graph_id: "c1".to_string(),
            title: "A Chat".to_string(),
            slug: "a-chat".to_string(),
            url: None,
            created_at: Some(ts(9)),
            updated_at: Some(ts(10)),
            parent_graph_id: None,
            export_md_path: Some("out/a-chat/transcript.md".to_string()),
            export_assets_path: Some("out/a-chat/assets".to_string()),
            content_hash: "h1".to_string(),
            word_count: 2,
            page_order: Some(1),
            last_indexed_at: indexed_at,
        }
    }

    fn msg_row(id: &str, ordinal: i64, indexed_at: DateTime<Utc>) -> MessageRow {
        MessageRow {
            graph_id: id.to_string(),
            conversation_graph_id: "c1".to_string(),
            title: None,
            slug: format!("{:03}-hello", ordinal),
            author: Some("alice".to_string()),
            role: "user".to_string(),
            ordinal,
            created_at: Some(ts(9)),
            updated_at: Some(ts(10)),
            parent_graph_id: None,
            export_md_path: None,
            export_assets_path: None,
            content_hash: "mh".to_string(),
            word_count: 1,
            excerpt: "hello world".to_string(),
            last_indexed_at: indexed_at,
        }
    }

    fn open_temp() -> (TempDir, Catalog) {
        let tmp = TempDir::new().unwrap();
        let catalog = Catalog::open(&tmp.path().join("catalog.sqlite")).unwrap();
        (tmp, catalog)
    }

    #[test]
    fn upsert_is_idempotent_and_advances_last_indexed_at() {
        let (_tmp, catalog) = open_temp();
        catalog.upsert_conversation(&conv_row(ts(11))).unwrap();
        catalog.upsert_conversation(&conv_row(ts(12))).unwrap();

        let row = catalog.conversation("c1").unwrap().unwrap();
        assert_eq!(row.title, "A Chat");
        assert_eq!(row.content_hash, "h1");
        assert_eq!(row.last_indexed_at, ts(12));
        assert_eq!(catalog.stats().unwrap().conversations, 1);
    }

    #[test]
    fn upsert_preserves_first_created_at() {
        let (_tmp, catalog) = open_temp();
        catalog.upsert_conversation(&conv_row(ts(11))).unwrap();
        let mut later = conv_row(ts(12));
        later.created_at = Some(ts(23));
        catalog.upsert_conversation(&later).unwrap();

        let row = catalog.conversation("c1").unwrap().unwrap();
        assert_eq!(row.created_at, Some(ts(9)));
    }

    #[test]
    fn touch_advances_last_indexed_at_only() {
        let (_tmp, catalog) = open_temp();
        catalog.upsert_conversation(&conv_row(ts(11))).unwrap();
        catalog.upsert_message(&msg_row("m1", 1, ts(11))).unwrap();

        catalog.touch_last_indexed("c1", ts(13)).unwrap();

        let conv = catalog.conversation("c1").unwrap().unwrap();
        assert_eq!(conv.last_indexed_at, ts(13));
        assert_eq!(conv.content_hash, "h1");
        let msg = catalog.message("m1").unwrap().unwrap();
        assert_eq!(msg.last_indexed_at, ts(13));
        assert_eq!(msg.excerpt, "hello world");
    }

    #[test]
    fn stored_state_roundtrip() {
        let (_tmp, catalog) = open_temp();
        assert!(catalog.stored_state("c1").unwrap().is_none());

        catalog.upsert_conversation(&conv_row(ts(11))).unwrap();
        let state = catalog.stored_state("c1").unwrap().unwrap();
        assert_eq!(state.content_hash.as_deref(), Some("h1"));
        assert_eq!(state.updated_at, Some(ts(10)));
    }

    #[test]
    fn messages_ordered_by_ordinal() {
        let (_tmp, catalog) = open_temp();
        catalog.upsert_conversation(&conv_row(ts(11))).unwrap();
        catalog.upsert_message(&msg_row("m2", 2, ts(11))).unwrap();
        catalog.upsert_message(&msg_row("m1", 1, ts(11))).unwrap();

        let msgs = catalog.messages_for("c1").unwrap();
        let ordinals: Vec<i64> = msgs.iter().map(|m| m.ordinal).collect();
        assert_eq!(ordinals, vec![1, 2]);
    }

    #[test]
    fn message_requires_existing_conversation() {
        let (_tmp, catalog) = open_temp();
        assert!(catalog.upsert_message(&msg_row("m1", 1, ts(11))).is_err());
    }

    #[test]
    fn search_matches_excerpt_and_honors_filters() {
        let (_tmp, catalog) = open_temp();
        catalog.upsert_conversation(&conv_row(ts(11))).unwrap();
        catalog.upsert_message(&msg_row("m1", 1, ts(11))).unwrap();

        let hits = catalog.search("hello", &SearchFilter::default()).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].conversation_slug, "a-chat");

        let none = catalog.search("absent", &SearchFilter::default()).unwrap();
        assert!(none.is_empty());

        let filtered = catalog
            .search(
                "hello",
                &SearchFilter {
                    author: Some("bob".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(filtered.is_empty());

        let out_of_range = catalog
            .search(
                "hello",
                &SearchFilter {
                    from: Some(ts(12)),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(out_of_range.is_empty());
    }

    #[test]
    fn stats_aggregates() {
        let (_tmp, catalog) = open_temp();
        catalog.upsert_conversation(&conv_row(ts(11))).unwrap();
        catalog.upsert_message(&msg_row("m1", 1, ts(11))).unwrap();
        catalog.upsert_message(&msg_row("m2", 2, ts(11))).unwrap();

        let stats = catalog.stats().unwrap();
        assert_eq!(stats.conversations, 1);
        assert_eq!(stats.messages, 2);
        assert_eq!(stats.words, 2);
        assert!((stats.avg_messages_per_conversation - 2.0).abs() < f64::EPSILON);
        assert_eq!(stats.earliest_created, Some(ts(9)));
        assert_eq!(stats.author_distribution, vec![("alice".to_string(), 2)]);
    }
}
