use std::fs;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::Result;
use crate::store::atomic;
use crate::store::paths::Dirs;

/// A pending message: one file under `B/inbox/<recipient>/`.
///
/// The file name starts with the timestamp so alphabetical order is
/// delivery order; a short random tail keeps same-millisecond sends
/// distinct.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub from: String,
    pub to: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub reply_to: Option<String>,
}

pub struct Inbox {
    dirs: Dirs,
}

impl Inbox {
    pub fn new(dirs: Dirs) -> Self {
        Self { dirs }
    }

    /// Compose and enqueue a message for `to`. The recipient's activeness
    /// is the caller's concern; this layer only writes the file.
    pub fn send(
        &self,
        from: &str,
        to: &str,
        text: &str,
        reply_to: Option<&str>,
    ) -> Result<Message> {
        let now = Utc::now();
        let message = Message {
            id: uuid::Uuid::new_v4().to_string(),
            from: from.into(),
            to: to.into(),
            text: text.into(),
            timestamp: now,
            reply_to: reply_to.map(String::from),
        };

        let dir = self.dirs.inbox_dir(to);
        fs::create_dir_all(&dir)?;
        // Nanosecond stamp: two sends from one process in the same
        // millisecond must still sort in write order.
        let stamp = now.format("%Y%m%dT%H%M%S%9f");
        let short_id = message.id.get(..8).unwrap_or(&message.id);
        atomic::write_json(&dir.join(format!("{stamp}-{short_id}.json")), &message)?;
        Ok(message)
    }

    /// Pending message files for `name`, ascending by file name
    /// (= timestamp order).
    pub fn pending_files(&self, name: &str) -> Vec<PathBuf> {
        let dir = self.dirs.inbox_dir(name);
        let Ok(entries) = fs::read_dir(&dir) else {
            return vec![];
        };
        let mut files: Vec<PathBuf> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("json"))
            .collect();
        files.sort();
        files
    }

    pub fn pending_count(&self, name: &str) -> usize {
        self.pending_files(name).len()
    }

    /// Drain the inbox: read each file in order, hand it to `deliver`, then
    /// unlink. Unparseable files are deleted outright; replaying them can
    /// never succeed.
    ///
    /// Returns the number of messages delivered.
    pub fn drain(&self, name: &str, mut deliver: impl FnMut(Message)) -> usize {
        let mut delivered = 0;
        for path in self.pending_files(name) {
            match atomic::read_json::<Message>(&path) {
                Some(message) => {
                    deliver(message);
                    delivered += 1;
                }
                None => {
                    warn!(file = %path.display(), "dropping unparseable inbox message");
                }
            }
            if let Err(err) = fs::remove_file(&path) {
                warn!(file = %path.display(), %err, "inbox unlink failed");
            }
        }
        if delivered > 0 {
            debug!(agent = name, delivered, "drained inbox");
        }
        delivered
    }

    /// Remove every pending message for `name` without delivering.
    pub fn clear(&self, name: &str) {
        for path in self.pending_files(name) {
            let _ = fs::remove_file(&path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn setup() -> (tempfile::TempDir, Inbox) {
        let dir = tempdir().unwrap();
        let dirs = Dirs::at(dir.path().join("base"), dir.path().join("proj"));
        (dir, Inbox::new(dirs))
    }

    #[test]
    fn send_creates_one_sortable_file() {
        let (_dir, inbox) = setup();
        let msg = inbox.send("alpha", "beta", "hello", None).unwrap();
        assert_eq!(msg.from, "alpha");
        assert_eq!(msg.to, "beta");
        assert!(msg.reply_to.is_none());

        let files = inbox.pending_files("beta");
        assert_eq!(files.len(), 1);
        let name = files[0].file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.ends_with(".json"));
        assert!(name.contains('-'));
    }

    #[test]
    fn drain_delivers_in_send_order_and_empties() {
        let (_dir, inbox) = setup();
        for i in 0..5 {
            inbox
                .send("alpha", "beta", &format!("msg-{i}"), None)
                .unwrap();
        }

        let mut seen = Vec::new();
        let delivered = inbox.drain("beta", |m| seen.push(m.text));
        assert_eq!(delivered, 5);
        assert_eq!(seen, vec!["msg-0", "msg-1", "msg-2", "msg-3", "msg-4"]);
        assert_eq!(inbox.pending_count("beta"), 0);
    }

    #[test]
    fn drain_deletes_unparseable_files() {
        let (_dir, inbox) = setup();
        inbox.send("alpha", "beta", "good", None).unwrap();
        let dir = inbox.dirs.inbox_dir("beta");
        fs::write(dir.join("00000000T000000000-corrupt.json"), "NOT JSON").unwrap();

        let mut seen = Vec::new();
        let delivered = inbox.drain("beta", |m| seen.push(m.text));
        assert_eq!(delivered, 1);
        assert_eq!(seen, vec!["good"]);
        assert_eq!(inbox.pending_count("beta"), 0);
    }

    #[test]
    fn drain_missing_inbox_is_empty() {
        let (_dir, inbox) = setup();
        assert_eq!(inbox.drain("ghost", |_| {}), 0);
    }

    #[test]
    fn reply_to_round_trips() {
        let (_dir, inbox) = setup();
        let orig = inbox.send("alpha", "beta", "question", None).unwrap();
        inbox
            .send("beta", "alpha", "answer", Some(&orig.id))
            .unwrap();

        let mut seen = Vec::new();
        inbox.drain("alpha", |m| seen.push(m));
        assert_eq!(seen[0].reply_to.as_deref(), Some(orig.id.as_str()));
    }

    #[test]
    fn clear_discards_without_delivery() {
        let (_dir, inbox) = setup();
        inbox.send("alpha", "beta", "one", None).unwrap();
        inbox.send("alpha", "beta", "two", None).unwrap();
        inbox.clear("beta");
        assert_eq!(inbox.pending_count("beta"), 0);
    }
}
