//! Small shared helpers.

use std::path::PathBuf;

/// Generate a unique command identifier.
#[must_use]
pub fn generate_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Home directory, falling back to the working directory.
#[must_use]
pub fn home_dir() -> PathBuf {
    dirs_next::home_dir().unwrap_or_else(|| PathBuf::from("."))
}

/// Directory that holds the switchboard configuration.
#[must_use]
pub fn config_dir() -> PathBuf {
    dirs_next::config_dir().map_or_else(|| home_dir().join(".switchboard"), |d| d.join("switchboard"))
}

/// Default configuration file path.
#[must_use]
pub fn config_path() -> PathBuf {
    config_dir().join("config.json")
}

/// Split a payload into pieces of at most `limit` bytes.
///
/// Cuts on raw byte offsets, so concatenating the pieces always yields the
/// input. An empty payload produces no pieces.
#[must_use]
pub fn segment_bytes(payload: &[u8], limit: usize) -> Vec<&[u8]> {
    if limit == 0 {
        return vec![payload];
    }
    payload.chunks(limit).collect()
}

/// Split text into chunks of at most `max_chars` characters.
///
/// Used by the socket protocols, whose frames must stay valid UTF-8.
#[must_use]
pub fn split_into_chunks(text: &str, max_chars: usize) -> Vec<String> {
    if max_chars == 0 || text.chars().count() <= max_chars {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut count = 0;
    for c in text.chars() {
        if count == max_chars {
            chunks.push(std::mem::take(&mut current));
            count = 0;
        }
        current.push(c);
        count += 1;
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Truncate a string for log output.
#[must_use]
pub fn truncate_str(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let mut out: String = s.chars().take(max_chars).collect();
        out.push('…');
        out
    }
}
