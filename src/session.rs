use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use tracing::warn;

use crate::config::Config;
use crate::status::{self, EventKind, EventWindow};
use crate::store::inbox::Message;
use crate::store::registry::{
    ActivityInfo, FILES_MODIFIED_CAP, PresenceRecord, Registry, SessionCounters,
};

const HISTORY_CAP: usize = 50;
const ECHO_WINDOW_SECS: i64 = 60;
const ECHO_LIMIT: usize = 3;
const FLUSH_DEBOUNCE_SECS: i64 = 10;
pub const HEARTBEAT_INTERVAL: StdDuration = StdDuration::from_secs(15);

/// One entry of the in-memory per-sender chat history.
#[derive(Debug, Clone)]
pub struct ChatEntry {
    pub from: String,
    pub text: String,
    pub at: DateTime<Utc>,
    pub wake: bool,
}

/// The outcome of delivering one message locally.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message: Message,
    /// Hand to the host as steering input ("wake up") unless suppressed.
    pub wake: bool,
    /// Set when echo-loop suppression kicked in.
    pub note: Option<String>,
    /// Sender location/model line, on first contact of a new session.
    pub sender_details: Option<String>,
    /// How to reply, when the config asks for the hint.
    pub reply_hint: Option<String>,
}

/// Per-process mutable session state.
///
/// Everything the dispatcher mutates between calls lives here, guarded by
/// one mutex: chat history, unread counters, the echo-suppression window,
/// session counters, and the registered identity.
#[derive(Default)]
pub struct SessionState {
    pub name: Option<String>,
    pub session_id: String,
    pub model: String,
    pub spec: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    history: HashMap<String, VecDeque<ChatEntry>>,
    unread: HashMap<String, u32>,
    recent_from: HashMap<String, VecDeque<DateTime<Utc>>>,
    known_sessions: HashMap<String, String>,
    pub events: EventWindow,
    pub counters: SessionCounters,
    pub current_activity: Option<String>,
    pub last_activity_at: Option<DateTime<Utc>>,
    last_flush_at: Option<DateTime<Utc>>,
}

impl SessionState {
    pub fn new(session_id: String, model: String) -> Self {
        Self {
            session_id,
            model,
            ..Default::default()
        }
    }

    pub fn registered_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Record an activity event and bump the last-activity stamp.
    pub fn record_event(&mut self, kind: EventKind) {
        self.events.record(kind);
        self.last_activity_at = Some(Utc::now());
    }

    /// Note a modified file on the session counters (bounded list).
    pub fn record_file_modified(&mut self, path: &str) {
        let files = &mut self.counters.files_modified;
        files.retain(|f| f != path);
        files.push(path.to_string());
        if files.len() > FILES_MODIFIED_CAP {
            let excess = files.len() - FILES_MODIFIED_CAP;
            files.drain(..excess);
        }
    }

    /// Deliver one message into local state.
    ///
    /// Applies the echo-loop rule: once three messages from the same sender
    /// have arrived within 60 s, the next one is shown but does not wake the
    /// host, and carries a one-line suppression note.
    pub fn deliver(&mut self, message: Message, sender: Option<&PresenceRecord>, config: &Config) -> Delivery {
        let now = Utc::now();
        let from = message.from.clone();

        let window = self.recent_from.entry(from.clone()).or_default();
        let horizon = now - Duration::seconds(ECHO_WINDOW_SECS);
        while window.front().is_some_and(|at| *at < horizon) {
            window.pop_front();
        }
        let suppressed = window.len() >= ECHO_LIMIT;
        window.push_back(now);

        let note = suppressed.then(|| {
            format!(
                "loop suppressed — too many rapid exchanges with {from}, no reply needed"
            )
        });

        let sender_details = sender.and_then(|record| {
            if !config.sender_details_on_first_contact {
                return None;
            }
            let known = self.known_sessions.get(&from);
            if known == Some(&record.session_id) {
                return None;
            }
            self.known_sessions
                .insert(from.clone(), record.session_id.clone());
            Some(format!(
                "{} is in {} on {}",
                record.name, record.cwd, record.model
            ))
        });

        let entry = ChatEntry {
            from: from.clone(),
            text: message.text.clone(),
            at: now,
            wake: !suppressed,
        };
        let history = self.history.entry(from.clone()).or_default();
        history.push_back(entry);
        while history.len() > HISTORY_CAP {
            history.pop_front();
        }

        let reply_hint = config.reply_hint.then(|| {
            format!("reply with {{\"action\":\"send\",\"to\":\"{from}\",\"message\":\"...\"}}")
        });

        *self.unread.entry(from).or_insert(0) += 1;

        Delivery {
            message,
            wake: !suppressed,
            note,
            sender_details,
            reply_hint,
        }
    }

    pub fn history_with(&self, sender: &str) -> impl Iterator<Item = &ChatEntry> {
        self.history.get(sender).into_iter().flatten()
    }

    pub fn unread_count(&self, sender: &str) -> u32 {
        self.unread.get(sender).copied().unwrap_or(0)
    }

    pub fn total_unread(&self) -> u32 {
        self.unread.values().sum()
    }

    pub fn mark_read(&mut self, sender: &str) {
        self.unread.remove(sender);
    }

    /// Rewrite the presence record with current counters and activity if the
    /// debounce window has elapsed (or `force`).
    ///
    /// Returns true when a write happened.
    pub fn flush_presence(&mut self, registry: &Registry, config: &Config, force: bool) -> bool {
        let Some(name) = self.name.clone() else {
            return false;
        };
        let now = Utc::now();
        if !force
            && self
                .last_flush_at
                .is_some_and(|at| now - at < Duration::seconds(FLUSH_DEBOUNCE_SECS))
        {
            return false;
        }

        let Some(mut record) = registry.read(&name) else {
            return false;
        };

        record.session = Some(self.counters.clone());
        record.activity = Some(ActivityInfo {
            last_activity_at: self.last_activity_at,
            current_activity: self.current_activity.clone(),
            last_tool_call: None,
        });
        if config.auto_status {
            let started = self.started_at.unwrap_or(record.started_at);
            record.status_message = Some(status::auto_status(
                now,
                started,
                &self.events,
                self.current_activity.as_deref(),
            ))
            .filter(|s| !s.is_empty());
        }

        if let Err(err) = registry.write(&record) {
            warn!(agent = %name, %err, "presence flush failed");
            return false;
        }
        self.last_flush_at = Some(now);
        true
    }
}

/// Background heartbeat: rewrites the presence record every 15 s so other
/// agents observe a fresh record while this one is quietly working.
pub struct HeartbeatGuard {
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl HeartbeatGuard {
    pub fn start(
        state: Arc<Mutex<SessionState>>,
        registry: Arc<Registry>,
        config: Config,
    ) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_thread = Arc::clone(&stop);

        let handle = thread::spawn(move || {
            let tick = StdDuration::from_millis(200);
            let mut elapsed = StdDuration::ZERO;
            loop {
                if stop_thread.load(Ordering::SeqCst) {
                    break;
                }
                thread::sleep(tick);
                elapsed += tick;
                if elapsed >= HEARTBEAT_INTERVAL {
                    elapsed = StdDuration::ZERO;
                    let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
                    state.flush_presence(&registry, &config, true);
                }
            }
        });

        Self {
            stop,
            handle: Some(handle),
        }
    }

    pub fn stop(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for HeartbeatGuard {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(from: &str, text: &str) -> Message {
        Message {
            id: uuid::Uuid::new_v4().to_string(),
            from: from.into(),
            to: "me".into(),
            text: text.into(),
            timestamp: Utc::now(),
            reply_to: None,
        }
    }

    fn state() -> SessionState {
        SessionState::new("sess-1".into(), "test-model".into())
    }

    #[test]
    fn delivery_records_history_and_unread() {
        let mut state = state();
        let config = Config::default();
        let delivery = state.deliver(message("alpha", "hello"), None, &config);
        assert!(delivery.wake);
        assert!(delivery.note.is_none());
        assert_eq!(state.unread_count("alpha"), 1);
        assert_eq!(state.history_with("alpha").count(), 1);

        state.mark_read("alpha");
        assert_eq!(state.unread_count("alpha"), 0);
    }

    #[test]
    fn fourth_rapid_message_is_suppressed() {
        let mut state = state();
        let config = Config::default();
        for i in 0..3 {
            let delivery = state.deliver(message("alpha", &format!("m{i}")), None, &config);
            assert!(delivery.wake, "message {i} should wake");
        }
        let fourth = state.deliver(message("alpha", "m3"), None, &config);
        assert!(!fourth.wake);
        let note = fourth.note.unwrap();
        assert!(note.contains("loop suppressed"));
        assert!(note.contains("alpha"));
    }

    #[test]
    fn suppression_is_per_sender() {
        let mut state = state();
        let config = Config::default();
        for _ in 0..3 {
            state.deliver(message("alpha", "x"), None, &config);
        }
        let other = state.deliver(message("beta", "y"), None, &config);
        assert!(other.wake);
    }

    #[test]
    fn history_is_bounded() {
        let mut state = state();
        let config = Config::default();
        for i in 0..60 {
            state.deliver(message("alpha", &format!("m{i}")), None, &config);
        }
        assert_eq!(state.history_with("alpha").count(), HISTORY_CAP);
        let first = state.history_with("alpha").next().unwrap();
        assert_eq!(first.text, "m10");
    }

    #[test]
    fn sender_details_once_per_session_identity() {
        let mut state = state();
        let config = Config::default();
        let sender = PresenceRecord::new("alpha", "sess-a", "/repo", "model-x");

        let first = state.deliver(message("alpha", "one"), Some(&sender), &config);
        assert!(first.sender_details.is_some());
        let second = state.deliver(message("alpha", "two"), Some(&sender), &config);
        assert!(second.sender_details.is_none());

        // New session identity of the same name: enrich again.
        let restarted = PresenceRecord::new("alpha", "sess-b", "/repo", "model-x");
        let third = state.deliver(message("alpha", "three"), Some(&restarted), &config);
        assert!(third.sender_details.is_some());
    }

    #[test]
    fn sender_details_respect_config() {
        let mut state = state();
        let mut config = Config::default();
        config.sender_details_on_first_contact = false;
        let sender = PresenceRecord::new("alpha", "sess-a", "/repo", "model-x");
        let delivery = state.deliver(message("alpha", "one"), Some(&sender), &config);
        assert!(delivery.sender_details.is_none());
    }

    #[test]
    fn files_modified_is_bounded_and_deduped() {
        let mut state = state();
        for i in 0..30 {
            state.record_file_modified(&format!("src/file{i}.rs"));
        }
        state.record_file_modified("src/file29.rs");
        assert_eq!(state.counters.files_modified.len(), FILES_MODIFIED_CAP);
        assert_eq!(
            state.counters.files_modified.last().map(String::as_str),
            Some("src/file29.rs")
        );
    }
}
