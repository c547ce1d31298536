//! Change detection: decides per conversation whether export is necessary.
//!
//! The skip rule is deliberately asymmetric: hash equality alone is not
//! enough (a client clock skew could leave `updated_at` untouched despite an
//! edit) and a non-newer timestamp alone is not enough either (sources bump
//! `updated_at` on metadata touches without a content change). Both signals
//! must agree before a conversation is skipped.
use chrono::{DateTime, Utc};

/// What is already known about a conversation, from the catalog row when
/// `--build-db` is active or from the existing transcript frontmatter
/// otherwise.
#[derive(Debug, Clone, Default)]
pub struct StoredState {
    pub content_hash: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    SinceFilter,
    Unchanged,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::SinceFilter => f.write_str("since-filter"),
            SkipReason::Unchanged => f.write_str("unchanged"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Skip(SkipReason),
    /// Export, carrying the content hash computed along the way so the
    /// caller never hashes twice.
    Export { content_hash: String },
}

/// Apply the detection policy, in order:
/// 1. `updated_at` older than the since-filter skips without hashing.
/// 2. No stored state means a first-time export.
/// 3. Equal hash AND non-newer `updated_at` skips.
/// 4. Anything else exports.
///
/// `compute_hash` is only invoked past step 1, which keeps `--since` runs
/// over large corpora cheap.
pub fn decide(
    since: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
    stored: Option<StoredState>,
    compute_hash: impl FnOnce() -> String,
) -> Decision {
    if let Some(cutoff) = since
        && updated_at < cutoff
    {
        return Decision::Skip(SkipReason::SinceFilter);
    }

    let content_hash = compute_hash();
    match stored {
        None => Decision::Export { content_hash },
        Some(state) => {
            let hash_equal = state.content_hash.as_deref() == Some(content_hash.as_str());
            let not_newer = state.updated_at.is_some_and(|prev| updated_at <= prev);
            if hash_equal && not_newer {
                Decision::Skip(SkipReason::Unchanged)
            } else {
                Decision::Export { content_hash }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, hour, 0, 0).unwrap()
    }

    fn stored(hash: &str, hour: u32) -> StoredState {
        StoredState {
            content_hash: Some(hash.to_string()),
            updated_at: Some(ts(hour)),
        }
    }

    #[test]
    fn since_filter_skips_without_hashing() {
        let d = decide(Some(ts(12)), ts(10), None, || {
            panic!("hash must not be computed under the since pre-filter")
        });
        assert_eq!(d, Decision::Skip(SkipReason::SinceFilter));
    }

    #[test]
    fn since_filter_keeps_equal_or_newer() {
        let d = decide(Some(ts(10)), ts(10), None, || "h".to_string());
        assert!(matches!(d, Decision::Export { .. }));
    }

    #[test]
    fn first_time_exports() {
        let d = decide(None, ts(10), None, || "h".to_string());
        assert_eq!(
            d,
            Decision::Export {
                content_hash: "h".to_string()
            }
        );
    }

    #[test]
    fn equal_hash_and_not_newer_skips() {
        let d = decide(None, ts(10), Some(stored("h", 10)), || "h".to_string());
        assert_eq!(d, Decision::Skip(SkipReason::Unchanged));

        let d = decide(None, ts(9), Some(stored("h", 10)), || "h".to_string());
        assert_eq!(d, Decision::Skip(SkipReason::Unchanged));
    }

    #[test]
    fn changed_hash_exports_despite_old_timestamp() {
        let d = decide(None, ts(9), Some(stored("h", 10)), || "other".to_string());
        assert!(matches!(d, Decision::Export { .. }));
    }

    #[test]
    fn newer_timestamp_exports_despite_equal_hash() {
        let d = decide(None, ts(11), Some(stored("h", 10)), || "h".to_string());
        assert!(matches!(d, Decision::Export { .. }));
    }

    #[test]
    fn missing_stored_timestamp_exports() {
        let state = StoredState {
            content_hash: Some("h".to_string()),
            updated_at: None,
        };
        let d = decide(None, ts(10), Some(state), || "h".to_string());
        assert!(matches!(d, Decision::Export { .. }));
    }
}
