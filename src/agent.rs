use rand::Rng;
use rand::seq::SliceRandom;

use crate::error::{MessengerError, Result};

/// Compact default word lists. Themed lists can be supplied via the
/// `nameWords` config option; these keep name generation working without
/// any configuration.
const ADJECTIVES: &[&str] = &[
    "amber", "bold", "brisk", "calm", "clever", "deft", "eager", "fleet",
    "keen", "lively", "lucid", "mellow", "nimble", "quiet", "rapid", "sly",
    "steady", "swift", "vivid", "wry",
];

const NOUNS: &[&str] = &[
    "badger", "crane", "falcon", "fox", "heron", "ibex", "jay", "lark",
    "lynx", "marten", "otter", "owl", "raven", "shrike", "stoat", "swallow",
    "tern", "vole", "wren", "yak",
];

/// Word pools used for name generation, after config resolution.
#[derive(Debug, Clone)]
pub struct NameWords {
    pub adjectives: Vec<String>,
    pub nouns: Vec<String>,
}

impl Default for NameWords {
    fn default() -> Self {
        Self {
            adjectives: ADJECTIVES.iter().map(|s| s.to_string()).collect(),
            nouns: NOUNS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Env-var tests anywhere in the crate serialize on this lock.
#[cfg(test)]
pub(crate) static ENV_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

/// Name forced via `PI_AGENT_NAME`, if any.
pub fn forced_name() -> Option<String> {
    std::env::var("PI_AGENT_NAME")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// A fresh session identifier, stable for one process lifetime.
pub fn new_session_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Generate a candidate name. Early attempts are plain `adjective-noun`;
/// after a collision a short hex suffix keeps retries distinct.
pub fn generate_name(words: &NameWords, attempt: usize) -> String {
    let mut rng = rand::thread_rng();
    let adjective = words
        .adjectives
        .choose(&mut rng)
        .map(String::as_str)
        .unwrap_or("swift");
    let noun = words
        .nouns
        .choose(&mut rng)
        .map(String::as_str)
        .unwrap_or("otter");
    if attempt < 3 {
        format!("{adjective}-{noun}")
    } else {
        let suffix = rng.gen_range(0..=u16::MAX);
        format!("{adjective}-{noun}-{suffix:04x}")
    }
}

/// Validate an agent name: 1-50 chars of `[A-Za-z0-9_-]`, where the leading
/// character must be a letter, digit, or underscore.
pub fn validate_name(name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && name.len() <= 50
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        && name
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_');
    if ok {
        Ok(())
    } else {
        Err(MessengerError::InvalidName(name.to_string()))
    }
}
