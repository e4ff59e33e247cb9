/// Deterministic names for bridge topics and their consumer groups

use sha2::{Digest, Sha256};

/// Hex digits of the hash suffix appended to over-long names
const HASH_SUFFIX_LEN: usize = 8;

/// Replace every character outside `[A-Za-z0-9._-]` with `_`
pub fn sanitize(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// `{workflow}_{parent}_to_{child}`, sanitized and kept within `max_len`
///
/// Over-long names are truncated and suffixed with a hash of the unsanitized
/// name so distinct edges never collide after truncation.
pub fn topic_name(workflow_slug: &str, parent_id: &str, child_id: &str, max_len: usize) -> String {
    let raw = format!("{}_{}_to_{}", workflow_slug, parent_id, child_id);
    let name = sanitize(&raw);
    if name.len() <= max_len {
        return name;
    }

    let digest = hex::encode(Sha256::digest(raw.as_bytes()));
    if max_len <= HASH_SUFFIX_LEN + 1 {
        return digest[..max_len.min(digest.len())].to_string();
    }
    let keep = max_len - HASH_SUFFIX_LEN - 1;
    format!("{}_{}", &name[..keep], &digest[..HASH_SUFFIX_LEN])
}

pub fn consumer_group(topic: &str) -> String {
    format!("{}_consumer", topic)
}
