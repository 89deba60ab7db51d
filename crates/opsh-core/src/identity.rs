//! Random identifiers for executions and terminal sessions.
//!
//! Ids are 16 random bytes, hex-encoded (32 chars). Display names use a
//! short prefix, the way short commit hashes are shown.

use rand::Rng;

/// Minimum length of a short id.
pub const SHORT_ID_LEN: usize = 8;

/// Generate a random id (hex-encoded, 16 bytes = 32 hex chars).
pub fn generate_id() -> String {
    let mut rng = rand::thread_rng();
    let bytes: [u8; 16] = rng.gen();
    hex::encode(bytes)
}

/// First [`SHORT_ID_LEN`] characters of an id, or the whole id if shorter.
pub fn short_id(id: &str) -> &str {
    match id.char_indices().nth(SHORT_ID_LEN) {
        Some((idx, _)) => &id[..idx],
        None => id,
    }
}

/// Human-readable terminal name derived from a session id.
pub fn terminal_name(id: &str) -> String {
    format!("term-{}", short_id(id))
}
