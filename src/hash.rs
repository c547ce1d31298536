use sha2::{Digest, Sha256};

use crate::record::Message;
use crate::text::normalize;

/// Hex digest over a single piece of normalized text. Used at message
/// granularity.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize(text).as_bytes());
    to_hex(hasher.finalize().as_slice())
}

/// Hex digest over a conversation's semantic content: the normalized title
/// plus every message's ordinal, role and normalized body, in order.
/// Editing, adding, removing, reordering or re-roling a message all change
/// the digest. The 0x1f/0x1e separators keep field boundaries unambiguous.
pub fn conversation_hash(title: &str, messages: &[Message]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize(title).as_bytes());
    for m in messages {
        hasher.update([0x1e]);
        hasher.update(m.ordinal.to_string().as_bytes());
        hasher.update([0x1f]);
        hasher.update(m.role.as_str().as_bytes());
        hasher.update([0x1f]);
        hasher.update(normalize(&m.content).as_bytes());
    }
    to_hex(hasher.finalize().as_slice())
}

fn to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}
