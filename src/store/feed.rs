use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::store::atomic;

/// A single event in the per-project activity feed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeedEvent {
    pub ts: DateTime<Utc>,
    pub agent: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview: Option<String>,
}

impl FeedEvent {
    pub fn now(agent: &str, event_type: &str) -> Self {
        Self {
            ts: Utc::now(),
            agent: agent.into(),
            event_type: event_type.into(),
            target: None,
            preview: None,
        }
    }

    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn preview(mut self, preview: impl Into<String>) -> Self {
        self.preview = Some(truncate(&preview.into(), 80));
        self
    }
}

/// Append-only JSON-lines feed under `P/.pi/messenger/feed.jsonl`,
/// trimmed back to the retention bound once it grows past twice that.
pub struct Feed {
    path: PathBuf,
    retention: usize,
}

impl Feed {
    pub fn new(path: PathBuf, retention: usize) -> Self {
        Self { path, retention }
    }

    /// Append one event. Failures are logged and swallowed; the feed is an
    /// observability surface, never a correctness dependency.
    pub fn append(&self, event: &FeedEvent) {
        if let Err(err) = self.try_append(event) {
            warn!(feed = %self.path.display(), %err, "feed append failed");
        }
    }

    fn try_append(&self, event: &FeedEvent) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut line = serde_json::to_string(event)?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        drop(file);
        self.maybe_trim();
        Ok(())
    }

    /// Read events, optionally limited to the last `limit`.
    pub fn read(&self, limit: Option<usize>) -> Vec<FeedEvent> {
        let Ok(content) = fs::read_to_string(&self.path) else {
            return vec![];
        };
        let mut events: Vec<FeedEvent> = content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect();
        if let Some(n) = limit {
            let len = events.len();
            if len > n {
                events = events.split_off(len - n);
            }
        }
        events
    }

    fn maybe_trim(&self) {
        let events = self.read(None);
        if events.len() <= self.retention * 2 {
            return;
        }
        let keep = &events[events.len() - self.retention..];
        let mut out = String::new();
        for event in keep {
            if let Ok(line) = serde_json::to_string(event) {
                out.push_str(&line);
                out.push('\n');
            }
        }
        if let Err(err) = atomic::write_text(&self.path, &out) {
            warn!(feed = %self.path.display(), %err, "feed trim failed");
        }
    }
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() > max_len {
        let truncated: String = s.chars().take(max_len - 3).collect();
        format!("{truncated}...")
    } else {
        s.to_string()
    }
}
