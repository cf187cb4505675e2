use std::fs;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::agent;
use crate::error::{MessengerError, Result};
use crate::proc;
use crate::store::atomic;
use crate::store::lock::SwarmLock;
use crate::store::paths::Dirs;

const CACHE_TTL: Duration = Duration::from_secs(1);
const REGISTER_ATTEMPTS: usize = 20;
pub const FILES_MODIFIED_CAP: usize = 20;

// ---------------------------------------------------------------------------
// Data model
// ---------------------------------------------------------------------------

/// A path reservation attached to a presence record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Reservation {
    pub pattern: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub since: DateTime<Utc>,
}

/// Session counters carried on the presence record.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionCounters {
    #[serde(default)]
    pub tool_calls: u64,
    #[serde(default)]
    pub tokens: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files_modified: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ActivityInfo {
    pub last_activity_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_activity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_tool_call: Option<String>,
}

/// One agent's registry entry: `B/registry/<name>.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    pub name: String,
    pub pid: u32,
    pub session_id: String,
    pub cwd: String,
    pub model: String,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reservations: Vec<Reservation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_human: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionCounters>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity: Option<ActivityInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_status: Option<String>,
}

impl PresenceRecord {
    pub fn new(name: &str, session_id: &str, cwd: &str, model: &str) -> Self {
        Self {
            name: name.into(),
            pid: std::process::id(),
            session_id: session_id.into(),
            cwd: cwd.into(),
            model: model.into(),
            started_at: Utc::now(),
            reservations: vec![],
            git_branch: None,
            spec: None,
            is_human: None,
            session: None,
            activity: None,
            status_message: None,
            custom_status: None,
        }
    }

    pub fn last_activity_at(&self) -> Option<DateTime<Utc>> {
        self.activity.as_ref().and_then(|a| a.last_activity_at)
    }
}

/// One matching reservation held by another live agent.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ReservationConflict {
    pub agent: String,
    pub pattern: String,
    pub reason: Option<String>,
    pub registration: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// The presence registry: one JSON file per agent under `B/registry/`.
///
/// Discovery results are cached for one second; each refresh prunes records
/// whose PID no longer probes alive.
pub struct Registry {
    dirs: Dirs,
    cache: Mutex<Option<(Instant, Vec<PresenceRecord>)>>,
}

impl Registry {
    pub fn new(dirs: Dirs) -> Self {
        Self {
            dirs,
            cache: Mutex::new(None),
        }
    }

    pub fn dirs(&self) -> &Dirs {
        &self.dirs
    }

    /// Register a presence record, first writer wins.
    ///
    /// Writes the record, reads it back, and checks the stored session id:
    /// a mismatch means another process raced us to the name. When `forced`
    /// the caller insists on exactly this name (`PI_AGENT_NAME`) and a lost
    /// race is `name_taken` rather than a retry.
    pub fn register(&self, record: &PresenceRecord, forced: bool) -> Result<()> {
        agent::validate_name(&record.name)?;

        let path = self.dirs.presence_path(&record.name);
        if let Some(existing) = atomic::read_json::<PresenceRecord>(&path) {
            if proc::pid_alive(existing.pid) && existing.session_id != record.session_id {
                return Err(if forced {
                    MessengerError::NameTaken(record.name.clone())
                } else {
                    MessengerError::RaceLost(record.name.clone())
                });
            }
            // Stale record from a dead process; fall through and take over.
        }

        atomic::write_json(&path, record)?;

        let written = atomic::read_json::<PresenceRecord>(&path);
        match written {
            Some(current) if current.session_id == record.session_id => {
                fs::create_dir_all(self.dirs.inbox_dir(&record.name))?;
                self.invalidate();
                Ok(())
            }
            _ => Err(if forced {
                MessengerError::NameTaken(record.name.clone())
            } else {
                MessengerError::RaceLost(record.name.clone())
            }),
        }
    }

    /// Join the mesh: resolve a name (env override or generated), then
    /// register with bounded retries on lost races.
    pub fn join(&self, mut record: PresenceRecord, words: &agent::NameWords) -> Result<PresenceRecord> {
        if let Some(name) = agent::forced_name() {
            record.name = name;
            self.register(&record, true)?;
            return Ok(record);
        }

        for attempt in 0..REGISTER_ATTEMPTS {
            record.name = agent::generate_name(words, attempt);
            match self.register(&record, false) {
                Ok(()) => return Ok(record),
                Err(MessengerError::RaceLost(_)) => continue,
                Err(err) => return Err(err),
            }
        }
        Err(MessengerError::NameTaken(record.name))
    }

    /// Remove an agent: presence record, inbox contents, nothing else.
    /// (Claims cleanup lives with the claim store; callers compose the two.)
    pub fn unregister(&self, name: &str) -> Result<()> {
        agent::validate_name(name)?;
        let path = self.dirs.presence_path(name);
        if path.exists() {
            fs::remove_file(&path)?;
        }
        let inbox = self.dirs.inbox_dir(name);
        if inbox.exists() {
            let _ = fs::remove_dir_all(&inbox);
        }
        self.invalidate();
        Ok(())
    }

    /// Rename an agent under the swarm lock: new record in, old record out,
    /// inbox directory moved along.
    pub fn rename(&self, record: &mut PresenceRecord, new_name: &str) -> Result<()> {
        agent::validate_name(new_name)?;
        if record.name == new_name {
            return Err(MessengerError::SameName);
        }

        let lock = SwarmLock::new(self.dirs.swarm_lock_path());
        let old_name = record.name.clone();
        let result = lock.with(|| {
            let target = self.dirs.presence_path(new_name);
            if let Some(existing) = atomic::read_json::<PresenceRecord>(&target) {
                if proc::pid_alive(existing.pid) {
                    return Err(MessengerError::NameTaken(new_name.to_string()));
                }
                let _ = fs::remove_file(&target);
            }

            record.name = new_name.to_string();
            atomic::write_json(&target, record)?;
            let _ = fs::remove_file(self.dirs.presence_path(&old_name));

            let old_inbox = self.dirs.inbox_dir(&old_name);
            let new_inbox = self.dirs.inbox_dir(new_name);
            if old_inbox.exists() {
                fs::rename(&old_inbox, &new_inbox)?;
            } else {
                fs::create_dir_all(&new_inbox)?;
            }
            Ok(())
        });
        if result.is_err() {
            record.name = old_name;
        }
        result?;

        self.invalidate();
        Ok(())
    }

    /// Read one presence record (no liveness filtering).
    pub fn read(&self, name: &str) -> Option<PresenceRecord> {
        atomic::read_json(&self.dirs.presence_path(name))
    }

    /// Rewrite a presence record.
    pub fn write(&self, record: &PresenceRecord) -> Result<()> {
        atomic::write_json(&self.dirs.presence_path(&record.name), record)?;
        self.invalidate();
        Ok(())
    }

    /// All live agents, through the 1-second TTL cache.
    ///
    /// Records whose PID is dead are pruned from disk (best effort) and
    /// never returned. With `scope_to_cwd` set, only agents whose working
    /// directory equals `cwd` are included.
    pub fn active_agents(&self, scope_to_cwd: Option<&str>) -> Vec<PresenceRecord> {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        let fresh = match cache.as_ref() {
            Some((at, records)) if at.elapsed() < CACHE_TTL => records.clone(),
            _ => {
                let scanned = self.scan_and_prune();
                *cache = Some((Instant::now(), scanned.clone()));
                scanned
            }
        };
        drop(cache);

        match scope_to_cwd {
            Some(cwd) => fresh.into_iter().filter(|r| r.cwd == cwd).collect(),
            None => fresh,
        }
    }

    /// Is this agent present with a live PID?
    pub fn is_active(&self, name: &str) -> bool {
        self.active_agents(None).iter().any(|r| r.name == name)
    }

    /// Drop the discovery cache so the next call rescans.
    pub fn invalidate(&self) {
        *self.cache.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    fn scan_and_prune(&self) -> Vec<PresenceRecord> {
        let dir = self.dirs.registry_dir();
        let Ok(entries) = fs::read_dir(&dir) else {
            return vec![];
        };

        let mut records = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(record) = atomic::read_json::<PresenceRecord>(&path) else {
                // Unreadable or foreign-truncated; treated as absent.
                continue;
            };
            if proc::pid_alive(record.pid) {
                records.push(record);
            } else {
                debug!(agent = %record.name, pid = record.pid, "pruning dead presence record");
                if let Err(err) = fs::remove_file(&path) {
                    warn!(agent = %record.name, %err, "dead record prune failed");
                }
                let _ = fs::remove_dir_all(self.dirs.inbox_dir(&record.name));
            }
        }
        records.sort_by(|a, b| a.name.cmp(&b.name));
        records
    }

    // -- reservations -------------------------------------------------------

    /// Add reservations to an agent's record (normalized, deduplicated).
    pub fn reserve(
        &self,
        name: &str,
        patterns: Vec<String>,
        reason: Option<String>,
    ) -> Result<Vec<Reservation>> {
        if patterns.is_empty() {
            return Err(MessengerError::EmptyPatterns);
        }
        let mut record = self.read(name).ok_or(MessengerError::NotRegistered)?;
        let now = Utc::now();
        for pattern in patterns {
            let pattern = normalize_pattern(&pattern);
            if record.reservations.iter().any(|r| r.pattern == pattern) {
                continue;
            }
            record.reservations.push(Reservation {
                pattern,
                reason: reason.clone(),
                since: now,
            });
        }
        self.write(&record)?;
        Ok(record.reservations)
    }

    /// Release specific patterns, or all of them when `patterns` is empty.
    pub fn release(&self, name: &str, patterns: Vec<String>) -> Result<Vec<Reservation>> {
        let mut record = self.read(name).ok_or(MessengerError::NotRegistered)?;
        if patterns.is_empty() {
            record.reservations.clear();
        } else {
            let targets: Vec<String> = patterns.iter().map(|p| normalize_pattern(p)).collect();
            record.reservations.retain(|r| {
                !targets
                    .iter()
                    .any(|t| r.pattern.trim_end_matches('/') == t.trim_end_matches('/'))
            });
        }
        self.write(&record)?;
        Ok(record.reservations)
    }

    /// Every other live agent whose reservation matches `path`.
    ///
    /// A non-empty result is a hard block for write-like tool calls.
    pub fn conflicts_with_other_agents(
        &self,
        path: &str,
        self_name: Option<&str>,
    ) -> Vec<ReservationConflict> {
        let mut conflicts = Vec::new();
        for record in self.active_agents(None) {
            if Some(record.name.as_str()) == self_name {
                continue;
            }
            for reservation in &record.reservations {
                if pattern_matches(&reservation.pattern, path) {
                    conflicts.push(ReservationConflict {
                        agent: record.name.clone(),
                        pattern: reservation.pattern.clone(),
                        reason: reservation.reason.clone(),
                        registration: record.started_at,
                    });
                }
            }
        }
        conflicts
    }
}

// ---------------------------------------------------------------------------
// Pattern matching
// ---------------------------------------------------------------------------

/// Literal reservation matching: a trailing `/` makes the pattern a
/// directory prefix; anything else is exact string equality. No globs.
pub fn pattern_matches(pattern: &str, path: &str) -> bool {
    if let Some(dir) = pattern.strip_suffix('/') {
        path == dir || path == pattern || path.starts_with(pattern)
    } else {
        path == pattern
    }
}

fn normalize_pattern(pattern: &str) -> String {
    pattern.trim().to_string()
}
