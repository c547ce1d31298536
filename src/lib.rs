//! # poe-chat-export
//!
//! A CLI tool that turns scraped [Poe](https://poe.com) conversations into
//! durable Markdown/JSONL artifacts and keeps a searchable SQLite catalog
//! synchronized with them.
//!
//! ## What it does
//!
//! The collaborating scraper hands over a dump file (JSON array or JSONL)
//! of conversation records, each with its messages in display order. This
//! tool renders every conversation into a per-slug directory holding a
//! `transcript.md` with YAML frontmatter, a metadata-rich `merged.jsonl`,
//! and one `section.jsonl` per message. With `--build-db` it also upserts
//! matching rows into a SQLite catalog that powers the `search`, `stats`
//! and `list` subcommands.
//!
//! ## Incremental export
//!
//! On repeated runs, conversations are skipped when their content hash is
//! unchanged **and** their `updated_at` is not newer than the stored one;
//! either signal alone does not suppress a re-export. The stored state
//! comes from the catalog, or from the transcript frontmatter when no
//! catalog is attached. `--since` pre-filters old conversations before any
//! hashing happens.
//!
//! ## Index-only rebuild
//!
//! `--index-only` repopulates the catalog purely from previously rendered
//! artifacts (useful after deleting or relocating the catalog file),
//! skipping corrupt lines with a warning instead of aborting.
//!
//! ## Usage
//!
//! ```sh
//! # Full pipeline: render artifacts and build the catalog
//! poe-chat-export --input dump.jsonl --build-db --output-dir ~/poe-archive
//!
//! # Only conversations touched since May
//! poe-chat-export --input dump.jsonl --build-db --since 2024-05-01
//!
//! # Rebuild the catalog from artifacts alone
//! poe-chat-export --index-only --output-dir ~/poe-archive
//!
//! # Query the catalog
//! poe-chat-export search "borrow checker" --author Claude
//! ```
//!
//! Preferences can be persisted in `~/.config/poe-chat-export/config.toml`.
