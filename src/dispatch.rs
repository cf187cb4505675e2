use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde_json::{Value, json};
use tracing::debug;

use crate::agent;
use crate::config::Config;
use crate::crew::executor::{Backend, Executor};
use crate::crew::model::Evidence;
use crate::crew::orchestrate;
use crate::crew::store::CrewStore;
use crate::error::{MessengerError, Result};
use crate::git;
use crate::session::{Delivery, HeartbeatGuard, SessionState};
use crate::status;
use crate::store::atomic;
use crate::store::claims::ClaimStore;
use crate::store::feed::{Feed, FeedEvent};
use crate::store::inbox::Inbox;
use crate::store::paths::Dirs;
use crate::store::registry::{PresenceRecord, Registry};
use crate::watcher::{DrainGuard, InboxWatcher, drain_guarded};

/// Every dispatcher result: a human line plus structured details.
/// `details.mode` echoes the action; `details.error` carries the error tag.
#[derive(Debug, Clone)]
pub struct Response {
    pub text: String,
    pub details: Value,
}

impl Response {
    fn ok(text: impl Into<String>, mode: &str, mut details: Value) -> Self {
        insert(&mut details, "mode", json!(mode));
        Self {
            text: text.into(),
            details,
        }
    }

    fn error(err: &MessengerError, mode: &str) -> Self {
        let mut details = json!({ "mode": mode, "error": err.code() });
        enrich_error(&mut details, err);
        Self {
            text: format!("Error: {err}"),
            details,
        }
    }

    fn warning(text: impl Into<String>, mode: &str, mut details: Value) -> Self {
        insert(&mut details, "mode", json!(mode));
        Self {
            text: format!("Warning: {}", text.into()),
            details,
        }
    }

    pub fn is_error(&self) -> bool {
        self.details.get("error").is_some()
    }
}

fn insert(details: &mut Value, key: &str, value: Value) {
    if let Some(map) = details.as_object_mut() {
        map.insert(key.to_string(), value);
    }
}

/// Attach structured context that programmatic consumers rely on.
fn enrich_error(details: &mut Value, err: &MessengerError) {
    match err {
        MessengerError::AlreadyClaimed { task_id, agent } => {
            insert(details, "conflict", json!({ "taskId": task_id, "agent": agent }));
        }
        MessengerError::AlreadyHaveClaim { spec, task_id, .. } => {
            insert(details, "existing", json!({ "spec": spec, "taskId": task_id }));
        }
        MessengerError::NotYourClaim { task_id, owner } => {
            insert(details, "conflict", json!({ "taskId": task_id, "agent": owner }));
        }
        MessengerError::AlreadyCompleted { task_id, by } => {
            insert(details, "conflict", json!({ "taskId": task_id, "agent": by }));
        }
        _ => {}
    }
}

/// Result of the write-enforcement hook.
#[derive(Debug, Clone)]
pub struct WriteBlock {
    pub block: bool,
    pub reason: String,
}

/// The single externally-invoked tool surface.
///
/// One instance per host session. Holds the store handles plus the mutable
/// session state; the host calls `dispatch` with an action record and gets
/// a `Response` back.
pub struct Dispatcher {
    cwd: PathBuf,
    dirs: Dirs,
    config: Config,
    registry: Arc<Registry>,
    inbox: Inbox,
    claims: ClaimStore,
    feed: Feed,
    crew: CrewStore,
    backend: Backend,
    state: Arc<Mutex<SessionState>>,
    drain: Arc<DrainGuard>,
    watcher: Mutex<Option<InboxWatcher>>,
    heartbeat: Mutex<Option<HeartbeatGuard>>,
    sink: Arc<dyn Fn(&Delivery) + Send + Sync>,
}

impl Dispatcher {
    pub fn new(cwd: PathBuf, model: &str) -> Self {
        let dirs = Dirs::resolve(&cwd);
        let config = Config::load(&cwd);
        Self::with_parts(cwd, dirs, config, model, Backend::host("pi"), Arc::new(|_| {}))
    }

    pub fn with_parts(
        cwd: PathBuf,
        dirs: Dirs,
        config: Config,
        model: &str,
        backend: Backend,
        sink: Arc<dyn Fn(&Delivery) + Send + Sync>,
    ) -> Self {
        let state = SessionState::new(agent::new_session_id(), model.to_string());
        Self {
            registry: Arc::new(Registry::new(dirs.clone())),
            inbox: Inbox::new(dirs.clone()),
            claims: ClaimStore::new(dirs.clone()),
            feed: Feed::new(dirs.feed_path(), config.feed_retention),
            crew: CrewStore::new(dirs.clone()),
            backend,
            state: Arc::new(Mutex::new(state)),
            drain: Arc::new(DrainGuard::default()),
            watcher: Mutex::new(None),
            heartbeat: Mutex::new(None),
            sink,
            cwd,
            dirs,
            config,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn session_name(&self) -> Option<String> {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).name.clone()
    }

    /// Dispatch one action record. Unknown or omitted actions fall back as
    /// specified: omitted means `status`, unknown is an error.
    pub fn dispatch(&self, request: &Value) -> Response {
        let action = request
            .get("action")
            .and_then(Value::as_str)
            .unwrap_or("status")
            .to_string();

        let result = match action.as_str() {
            "join" => self.handle_join(request),
            "status" => self.handle_status(),
            "list" => self.handle_list(),
            "feed" => self.handle_feed(request),
            "whois" => self.handle_whois(request),
            "set_status" => self.handle_set_status(request),
            "spec" => self.handle_spec(request),
            "send" => self.handle_send(request),
            "broadcast" => self.handle_broadcast(request),
            "reserve" => self.handle_reserve(request),
            "release" => self.handle_release(request),
            "rename" => self.handle_rename(request),
            "leave" => self.handle_leave(),
            "swarm" => self.handle_swarm(request),
            "claim" => self.handle_claim(request),
            "unclaim" => self.handle_unclaim(request),
            "complete" => self.handle_complete(request),
            "autoRegisterPath" => self.handle_auto_register(request),
            "epic.create" => self.handle_epic_create(request),
            "epic.show" => self.handle_epic_show(request),
            "epic.list" => self.handle_epic_list(),
            "epic.close" => self.handle_epic_close(request),
            "epic.set_spec" => self.handle_epic_set_spec(request),
            "task.create" => self.handle_task_create(request),
            "task.show" => self.handle_task_show(request),
            "task.list" => self.handle_task_list(request),
            "task.start" => self.handle_task_start(request),
            "task.done" => self.handle_task_done(request),
            "task.block" => self.handle_task_block(request),
            "task.unblock" => self.handle_task_unblock(request),
            "task.ready" => self.handle_task_ready(request),
            "task.reset" => self.handle_task_reset(request),
            "plan" => self.handle_plan(request),
            "work" => self.handle_work(request),
            "review" => self.handle_review(request),
            "checkpoint.save" => self.handle_checkpoint_save(request),
            "checkpoint.restore" => self.handle_checkpoint_restore(request),
            "checkpoint.delete" => self.handle_checkpoint_delete(request),
            "checkpoint.list" => self.handle_checkpoint_list(),
            "crew.status" => self.handle_crew_status(),
            "crew.validate" => self.handle_crew_validate(request),
            "crew.agents" => self.handle_crew_agents(),
            "crew.install" => self.handle_crew_install(true),
            "crew.uninstall" => self.handle_crew_install(false),
            other => Err(MessengerError::UnknownAction(other.to_string())),
        };

        match result {
            Ok(response) => response,
            Err(err) => Response::error(&err, &action),
        }
    }

    /// The write-enforcement hook: called by the host before write-like
    /// tool calls. A returned block names every reserving agent.
    pub fn check_write_conflict(&self, path: &str) -> Option<WriteBlock> {
        let self_name = self.session_name();
        let conflicts = self
            .registry
            .conflicts_with_other_agents(path, self_name.as_deref());
        if conflicts.is_empty() {
            return None;
        }
        let lines: Vec<String> = conflicts
            .iter()
            .map(|c| {
                let reason = c
                    .reason
                    .as_deref()
                    .map(|r| format!(" ({r})"))
                    .unwrap_or_default();
                format!("{} reserved '{}'{reason}", c.agent, c.pattern)
            })
            .collect();
        Some(WriteBlock {
            block: true,
            reason: format!("path is reserved by another agent: {}", lines.join("; ")),
        })
    }

    // -- helpers -------------------------------------------------------------

    fn require_name(&self) -> Result<String> {
        self.session_name().ok_or(MessengerError::NotRegistered)
    }

    fn resolve_spec(&self, request: &Value) -> Result<String> {
        if let Some(spec) = opt_str(request, "spec") {
            return Ok(canonicalize_spec(&self.cwd, &spec));
        }
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .spec
            .clone()
            .ok_or(MessengerError::NoSpec)
    }

    fn feed_event(&self, event_type: &str, target: Option<&str>, preview: Option<&str>) {
        let agent = self.session_name().unwrap_or_else(|| "-".into());
        let mut event = FeedEvent::now(&agent, event_type);
        if let Some(target) = target {
            event = event.target(target);
        }
        if let Some(preview) = preview {
            event = event.preview(preview);
        }
        self.feed.append(&event);
    }

    fn scoped_cwd(&self) -> Option<String> {
        self.config
            .scope_to_folder
            .then(|| self.cwd.display().to_string())
    }

    fn executor(&self) -> Executor {
        Executor::new(
            self.backend.clone(),
            self.dirs.clone(),
            self.config.crew.worker_concurrency,
        )
        .with_artifacts(self.config.crew.artifacts_enabled)
    }

    fn start_watcher(&self, name: &str) {
        let dir = self.dirs.inbox_dir(name);
        let drain = Arc::clone(&self.drain);
        let registry = Arc::clone(&self.registry);
        let state = Arc::clone(&self.state);
        let sink = Arc::clone(&self.sink);
        let dirs = self.dirs.clone();
        let config = self.config.clone();
        let name = name.to_string();

        let watcher = InboxWatcher::start(dir, move || {
            drain_guarded(&drain, || {
                let inbox = Inbox::new(dirs.clone());
                inbox.drain(&name, |message| {
                    let sender = registry.read(&message.from);
                    let delivery = state
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .deliver(message, sender.as_ref(), &config);
                    sink(&delivery);
                });
            });
        });
        *self.watcher.lock().unwrap_or_else(|e| e.into_inner()) = Some(watcher);
    }

    fn stop_watcher(&self) {
        if let Some(watcher) = self.watcher.lock().unwrap_or_else(|e| e.into_inner()).take() {
            watcher.stop();
        }
    }

    /// Drain the inbox synchronously (used by hosts without a live watcher
    /// and by tests).
    pub fn drain_inbox(&self) -> usize {
        let Some(name) = self.session_name() else {
            return 0;
        };
        let mut count = 0;
        drain_guarded(&self.drain, || {
            count += self.inbox.drain(&name, |message| {
                let sender = self.registry.read(&message.from);
                let delivery = self
                    .state
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .deliver(message, sender.as_ref(), &self.config);
                (self.sink)(&delivery);
            });
        });
        count
    }

    // -- mesh actions --------------------------------------------------------

    fn handle_join(&self, request: &Value) -> Result<Response> {
        if let Some(existing) = self.session_name() {
            return Ok(Response::ok(
                format!("Already joined as {existing}."),
                "join",
                json!({ "name": existing, "alreadyJoined": true }),
            ));
        }

        let (session_id, model) = {
            let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            (state.session_id.clone(), state.model.clone())
        };
        let mut record = PresenceRecord::new(
            "pending",
            &session_id,
            &self.cwd.display().to_string(),
            &model,
        );
        record.git_branch = git::current_branch(&self.cwd);
        if let Some(spec) = opt_str(request, "spec") {
            record.spec = Some(canonicalize_spec(&self.cwd, &spec));
        }

        let record = self.registry.join(record, &self.config.name_words)?;

        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.name = Some(record.name.clone());
            state.started_at = Some(record.started_at);
            state.spec = record.spec.clone();
        }
        self.start_watcher(&record.name);
        *self.heartbeat.lock().unwrap_or_else(|e| e.into_inner()) = Some(HeartbeatGuard::start(
            Arc::clone(&self.state),
            Arc::clone(&self.registry),
            self.config.clone(),
        ));
        self.feed_event("join", None, Some("joined the mesh"));
        debug!(agent = %record.name, "joined mesh");

        let mut details = json!({ "name": record.name, "sessionId": record.session_id });
        if self.config.registration_context {
            insert(
                &mut details,
                "context",
                json!(
                    "You are on a shared workstation mesh. Use `list` to see peers, \
                     `send` to message them, and `reserve` before editing contested paths."
                ),
            );
        }
        Ok(Response::ok(
            format!("Joined the mesh as {}.", record.name),
            "join",
            details,
        ))
    }

    fn handle_leave(&self) -> Result<Response> {
        let name = self.require_name()?;
        self.stop_watcher();
        if let Some(heartbeat) = self
            .heartbeat
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            heartbeat.stop();
        }
        let removed_claims = self.claims.remove_agent_claims(&name)?;
        self.registry.unregister(&name)?;
        self.feed_event("leave", None, Some("left the mesh"));
        self.state.lock().unwrap_or_else(|e| e.into_inner()).name = None;

        Ok(Response::ok(
            format!("Left the mesh ({name})."),
            "leave",
            json!({ "name": name, "removedClaims": removed_claims }),
        ))
    }

    fn handle_status(&self) -> Result<Response> {
        let peers = self.registry.active_agents(self.scoped_cwd().as_deref());
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let name = state.name.clone();
        let unread = state.total_unread();
        let spec = state.spec.clone();
        drop(state);

        let peer_count = peers
            .iter()
            .filter(|p| Some(&p.name) != name.as_ref())
            .count();
        let text = match &name {
            Some(name) => format!("{name}: {peer_count} peer(s) active, {unread} unread."),
            None => format!("Not joined. {peer_count} agent(s) active."),
        };
        Ok(Response::ok(
            text,
            "status",
            json!({
                "name": name,
                "peers": peer_count,
                "unread": unread,
                "spec": spec,
            }),
        ))
    }

    fn handle_list(&self) -> Result<Response> {
        let agents = self.registry.active_agents(self.scoped_cwd().as_deref());
        let now = chrono::Utc::now();
        let entries: Vec<Value> = agents
            .iter()
            .map(|record| {
                let holds_work = !record.reservations.is_empty()
                    || self.claims.claim_of(&record.name).is_some();
                let tier = status::status_tier(
                    now,
                    record.last_activity_at(),
                    holds_work,
                    self.config.stuck_threshold_secs,
                );
                if tier == status::StatusTier::Stuck && self.config.stuck_notify {
                    self.feed.append(
                        &FeedEvent::now(&record.name, "stuck")
                            .preview("holding work with no recent activity"),
                    );
                }
                json!({
                    "name": record.name,
                    "cwd": record.cwd,
                    "model": record.model,
                    "status": tier,
                    "statusMessage": record.custom_status.clone()
                        .or_else(|| record.status_message.clone()),
                    "reservations": record.reservations.len(),
                })
            })
            .collect();
        Ok(Response::ok(
            format!("{} agent(s) active.", agents.len()),
            "list",
            json!({ "agents": entries }),
        ))
    }

    fn handle_feed(&self, request: &Value) -> Result<Response> {
        let limit = request
            .get("limit")
            .and_then(Value::as_u64)
            .map(|n| n as usize)
            .unwrap_or(20);
        let events = self.feed.read(Some(limit));
        Ok(Response::ok(
            format!("{} feed event(s).", events.len()),
            "feed",
            json!({ "events": events }),
        ))
    }

    fn handle_whois(&self, request: &Value) -> Result<Response> {
        let name = opt_str(request, "name").ok_or(MessengerError::MissingRecipient)?;
        let record = self
            .registry
            .read(&name)
            .filter(|r| crate::proc::pid_alive(r.pid))
            .ok_or_else(|| MessengerError::RecipientNotFound(name.clone()))?;

        let now = chrono::Utc::now();
        let holds_work =
            !record.reservations.is_empty() || self.claims.claim_of(&record.name).is_some();
        let tier = status::status_tier(
            now,
            record.last_activity_at(),
            holds_work,
            self.config.stuck_threshold_secs,
        );
        let last_activity_secs = record
            .last_activity_at()
            .map(|at| (now - at).num_seconds().max(0));
        Ok(Response::ok(
            format!("{} [{tier}] in {}", record.name, record.cwd),
            "whois",
            json!({
                "agent": record,
                "tier": tier,
                "lastActivitySecs": last_activity_secs,
            }),
        ))
    }

    fn handle_set_status(&self, request: &Value) -> Result<Response> {
        let name = self.require_name()?;
        let message = opt_str(request, "message").filter(|s| !s.trim().is_empty());
        let mut record = self.registry.read(&name).ok_or(MessengerError::NotRegistered)?;
        record.custom_status = message.clone();
        self.registry.write(&record)?;

        let text = match &message {
            Some(message) => format!("Status set: {message}"),
            None => "Status cleared.".to_string(),
        };
        Ok(Response::ok(text, "set_status", json!({ "status": message })))
    }

    fn handle_spec(&self, request: &Value) -> Result<Response> {
        let name = self.require_name()?;
        let spec = opt_str(request, "spec").ok_or(MessengerError::NoSpec)?;
        let canonical = canonicalize_spec(&self.cwd, &spec);

        let mut record = self.registry.read(&name).ok_or(MessengerError::NotRegistered)?;
        record.spec = Some(canonical.clone());
        self.registry.write(&record)?;
        self.state.lock().unwrap_or_else(|e| e.into_inner()).spec = Some(canonical.clone());

        if Path::new(&canonical).exists() {
            Ok(Response::ok(
                format!("Working spec set to {canonical}."),
                "spec",
                json!({ "spec": canonical }),
            ))
        } else {
            Ok(Response::warning(
                format!("spec file {canonical} does not exist (set anyway)"),
                "spec",
                json!({ "spec": canonical, "warning": "spec_missing" }),
            ))
        }
    }

    fn handle_send(&self, request: &Value) -> Result<Response> {
        let from = self.require_name()?;
        let recipients = str_list(request, "to");
        if recipients.is_empty() {
            return Err(if request.get("to").is_some() {
                MessengerError::EmptyRecipients
            } else {
                MessengerError::MissingRecipient
            });
        }
        let text = opt_str(request, "message")
            .filter(|s| !s.trim().is_empty())
            .ok_or(MessengerError::MissingMessage)?;
        let reply_to = opt_str(request, "replyTo");

        let active = self.registry.active_agents(None);
        let mut sent = Vec::new();
        let mut failures = Vec::new();
        let mut first_error = None;
        for to in &recipients {
            match self.send_one(&from, to, &text, reply_to.as_deref(), &active) {
                Ok(()) => sent.push(to.clone()),
                Err(err) => {
                    failures.push(json!({ "to": to, "error": err.code() }));
                    first_error.get_or_insert(err);
                }
            }
        }

        if sent.is_empty() {
            // Single recipient: surface the precise failure.
            return Err(match first_error {
                Some(err) if recipients.len() == 1 => err,
                _ => MessengerError::NoRecipients,
            });
        }

        let text_line = if sent.len() == 1 {
            format!("Message sent to {}.", sent[0])
        } else {
            format!("Message sent to {} recipient(s).", sent.len())
        };
        Ok(Response::ok(
            text_line,
            "send",
            json!({ "sent": sent, "failures": failures }),
        ))
    }

    fn send_one(
        &self,
        from: &str,
        to: &str,
        text: &str,
        reply_to: Option<&str>,
        active: &[PresenceRecord],
    ) -> Result<()> {
        if to == from {
            return Err(MessengerError::CannotSendToSelf);
        }
        if !active.iter().any(|r| r.name == to) {
            return Err(if self.registry.read(to).is_some() {
                MessengerError::RecipientNotActive(to.to_string())
            } else {
                MessengerError::RecipientNotFound(to.to_string())
            });
        }
        self.inbox.send(from, to, text, reply_to)?;
        self.feed_event("message", Some(to), Some(text));
        Ok(())
    }

    fn handle_broadcast(&self, request: &Value) -> Result<Response> {
        let from = self.require_name()?;
        let text = opt_str(request, "message")
            .filter(|s| !s.trim().is_empty())
            .ok_or(MessengerError::MissingMessage)?;
        let reply_to = opt_str(request, "replyTo");

        let peers: Vec<PresenceRecord> = self
            .registry
            .active_agents(None)
            .into_iter()
            .filter(|r| r.name != from)
            .collect();
        if peers.is_empty() {
            return Err(MessengerError::NoRecipients);
        }

        let mut sent = 0usize;
        let mut failures = Vec::new();
        for peer in &peers {
            match self.inbox.send(&from, &peer.name, &text, reply_to.as_deref()) {
                Ok(_) => sent += 1,
                Err(err) => failures.push(json!({ "to": peer.name, "error": err.code() })),
            }
        }
        self.feed_event("message", None, Some(&format!("broadcast: {text}")));
        Ok(Response::ok(
            format!("Broadcast sent to {sent} agent(s)."),
            "broadcast",
            json!({ "sent": sent, "failures": failures }),
        ))
    }

    fn handle_reserve(&self, request: &Value) -> Result<Response> {
        let name = self.require_name()?;
        let paths = str_list(request, "paths");
        if paths.is_empty() {
            return Err(MessengerError::MissingPaths);
        }
        let reason = opt_str(request, "reason");
        let reservations = self.registry.reserve(&name, paths.clone(), reason)?;
        self.feed_event("reserve", None, Some(&paths.join(", ")));
        Ok(Response::ok(
            format!("Reserved {} path(s).", paths.len()),
            "reserve",
            json!({ "reservations": reservations }),
        ))
    }

    fn handle_release(&self, request: &Value) -> Result<Response> {
        let name = self.require_name()?;
        let paths = str_list(request, "paths");
        let remaining = self.registry.release(&name, paths.clone())?;
        let preview = if paths.is_empty() {
            "released all".to_string()
        } else {
            format!("released {}", paths.join(", "))
        };
        self.feed_event("release", None, Some(&preview));
        Ok(Response::ok(
            if paths.is_empty() {
                "Released all reservations.".to_string()
            } else {
                format!("Released {} path(s).", paths.len())
            },
            "release",
            json!({ "reservations": remaining }),
        ))
    }

    fn handle_rename(&self, request: &Value) -> Result<Response> {
        let old_name = self.require_name()?;
        let new_name = opt_str(request, "name").ok_or(MessengerError::MissingId)?;

        let mut record = self
            .registry
            .read(&old_name)
            .ok_or(MessengerError::NotRegistered)?;
        self.stop_watcher();
        let renamed = self.registry.rename(&mut record, &new_name);
        // The watcher follows whichever name we ended up with.
        self.start_watcher(&record.name);
        renamed?;

        self.state.lock().unwrap_or_else(|e| e.into_inner()).name = Some(new_name.clone());
        self.feed_event("join", None, Some(&format!("renamed from {old_name}")));
        Ok(Response::ok(
            format!("Renamed {old_name} -> {new_name}."),
            "rename",
            json!({ "from": old_name, "to": new_name }),
        ))
    }

    // -- swarm actions -------------------------------------------------------

    fn handle_swarm(&self, request: &Value) -> Result<Response> {
        let spec = opt_str(request, "spec").map(|s| canonicalize_spec(&self.cwd, &s));
        let view = self.claims.view(spec.as_deref());
        let claim_count: usize = view.claims.values().map(|t| t.len()).sum();
        let done_count: usize = view.completions.values().map(|t| t.len()).sum();
        Ok(Response::ok(
            format!("{claim_count} claim(s), {done_count} completion(s)."),
            "swarm",
            json!({
                "claims": view.claims,
                "completions": view.completions,
                "pruned": view.pruned,
            }),
        ))
    }

    fn handle_claim(&self, request: &Value) -> Result<Response> {
        let name = self.require_name()?;
        let task_id = opt_str(request, "taskId").ok_or(MessengerError::MissingId)?;
        let spec = self.resolve_spec(request)?;
        let reason = opt_str(request, "reason");
        let session_id = self
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .session_id
            .clone();

        let claim = self.claims.claim(&spec, &task_id, &name, &session_id, reason)?;
        self.feed_event("task.start", Some(&task_id), None);
        Ok(Response::ok(
            format!("Claimed {task_id}."),
            "claim",
            json!({ "taskId": task_id, "spec": spec, "claimedAt": claim.claimed_at }),
        ))
    }

    fn handle_unclaim(&self, request: &Value) -> Result<Response> {
        let name = self.require_name()?;
        let task_id = opt_str(request, "taskId").ok_or(MessengerError::MissingId)?;
        let spec = self.resolve_spec(request)?;
        self.claims.unclaim(&spec, &task_id, &name)?;
        self.feed_event("task.reset", Some(&task_id), None);
        Ok(Response::ok(
            format!("Unclaimed {task_id}."),
            "unclaim",
            json!({ "taskId": task_id, "spec": spec }),
        ))
    }

    fn handle_complete(&self, request: &Value) -> Result<Response> {
        let name = self.require_name()?;
        let task_id = opt_str(request, "taskId").ok_or(MessengerError::MissingId)?;
        let spec = self.resolve_spec(request)?;
        let notes = opt_str(request, "notes");
        let completion = self.claims.complete(&spec, &task_id, &name, notes)?;
        self.feed_event("task.done", Some(&task_id), None);
        Ok(Response::ok(
            format!("Completed {task_id}."),
            "complete",
            json!({
                "taskId": task_id,
                "spec": spec,
                "completedAt": completion.completed_at,
            }),
        ))
    }

    fn handle_auto_register(&self, request: &Value) -> Result<Response> {
        let op = opt_str(request, "autoRegisterPath")
            .ok_or_else(|| MessengerError::UnknownOperation("autoRegisterPath".into()))?;
        let path = self.dirs.auto_register_path();
        let mut paths: Vec<String> = atomic::read_json(&path).unwrap_or_default();
        let cwd = self.cwd.display().to_string();

        match op.as_str() {
            "add" => {
                if !paths.contains(&cwd) {
                    paths.push(cwd.clone());
                    atomic::write_json(&path, &paths)?;
                }
                Ok(Response::ok(
                    format!("Auto-join enabled for {cwd}."),
                    "autoRegisterPath",
                    json!({ "paths": paths }),
                ))
            }
            "remove" => {
                paths.retain(|p| p != &cwd);
                atomic::write_json(&path, &paths)?;
                Ok(Response::ok(
                    format!("Auto-join disabled for {cwd}."),
                    "autoRegisterPath",
                    json!({ "paths": paths }),
                ))
            }
            "list" => Ok(Response::ok(
                format!("{} auto-join path(s).", paths.len()),
                "autoRegisterPath",
                json!({ "paths": paths }),
            )),
            other => Err(MessengerError::UnknownOperation(other.to_string())),
        }
    }

    // -- crew actions --------------------------------------------------------

    fn handle_epic_create(&self, request: &Value) -> Result<Response> {
        let title = opt_str(request, "title").ok_or(MessengerError::MissingTitle)?;
        let epic = self.crew.create_epic(&title)?;
        Ok(Response::ok(
            format!("Created epic {} ({}).", epic.id, epic.title),
            "epic.create",
            json!({ "epic": epic }),
        ))
    }

    fn handle_epic_show(&self, request: &Value) -> Result<Response> {
        let id = opt_str(request, "id").ok_or(MessengerError::MissingId)?;
        let epic = self.crew.read_epic(&id)?;
        let tasks = self.crew.list_tasks(&id);
        let spec = self.crew.read_epic_spec(&id);
        Ok(Response::ok(
            format!(
                "{} [{}] {}/{} done.",
                epic.id, epic.status, epic.completed_count, epic.task_count
            ),
            "epic.show",
            json!({ "epic": epic, "tasks": tasks, "spec": spec }),
        ))
    }

    fn handle_epic_list(&self) -> Result<Response> {
        let mut epics = self.crew.list_epics();
        epics.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(Response::ok(
            format!("{} epic(s).", epics.len()),
            "epic.list",
            json!({ "epics": epics }),
        ))
    }

    fn handle_epic_close(&self, request: &Value) -> Result<Response> {
        let id = opt_str(request, "id").ok_or(MessengerError::MissingId)?;
        let epic = self.crew.close_epic(&id)?;
        Ok(Response::ok(
            format!("Closed epic {id}."),
            "epic.close",
            json!({ "epic": epic }),
        ))
    }

    fn handle_epic_set_spec(&self, request: &Value) -> Result<Response> {
        let id = opt_str(request, "id").ok_or(MessengerError::MissingId)?;
        let content = opt_str(request, "content").ok_or(MessengerError::MissingContent)?;
        self.crew.set_epic_spec(&id, &content)?;
        Ok(Response::ok(
            format!("Spec updated for {id}."),
            "epic.set_spec",
            json!({ "id": id }),
        ))
    }

    fn handle_task_create(&self, request: &Value) -> Result<Response> {
        let epic_id = opt_str(request, "epic").ok_or(MessengerError::MissingId)?;
        let title = opt_str(request, "title").ok_or(MessengerError::MissingTitle)?;
        let description = opt_str(request, "description");
        let depends_on = str_list(request, "dependsOn");
        let task = self
            .crew
            .create_task(&epic_id, &title, description.as_deref(), depends_on)?;
        Ok(Response::ok(
            format!("Created task {}.", task.id),
            "task.create",
            json!({ "task": task }),
        ))
    }

    fn handle_task_show(&self, request: &Value) -> Result<Response> {
        let id = opt_str(request, "id").ok_or(MessengerError::MissingId)?;
        let task = self.crew.read_task(&id)?;
        let spec = self.crew.read_task_spec(&id);
        Ok(Response::ok(
            format!("{} [{}] {}", task.id, task.status, task.title),
            "task.show",
            json!({ "task": task, "spec": spec }),
        ))
    }

    fn handle_task_list(&self, request: &Value) -> Result<Response> {
        let epic_id = opt_str(request, "epic").ok_or(MessengerError::MissingId)?;
        self.crew.read_epic(&epic_id)?;
        let tasks = self.crew.list_tasks(&epic_id);
        Ok(Response::ok(
            format!("{} task(s).", tasks.len()),
            "task.list",
            json!({ "tasks": tasks }),
        ))
    }

    fn handle_task_start(&self, request: &Value) -> Result<Response> {
        let id = opt_str(request, "id").ok_or(MessengerError::MissingId)?;
        let agent = self
            .session_name()
            .unwrap_or_else(|| format!("pid-{}", std::process::id()));
        let task = self.crew.start_task(&id, &agent)?;
        self.feed_event("task.start", Some(&id), None);
        Ok(Response::ok(
            format!("Started {id}."),
            "task.start",
            json!({ "task": task }),
        ))
    }

    fn handle_task_done(&self, request: &Value) -> Result<Response> {
        let id = opt_str(request, "id").ok_or(MessengerError::MissingId)?;
        let summary = opt_str(request, "summary").unwrap_or_default();
        let evidence = request
            .get("evidence")
            .cloned()
            .and_then(|v| serde_json::from_value::<Evidence>(v).ok());
        let task = self.crew.complete_task(&id, &summary, evidence)?;
        self.feed_event("task.done", Some(&id), None);
        Ok(Response::ok(
            format!("Completed {id}."),
            "task.done",
            json!({ "task": task }),
        ))
    }

    fn handle_task_block(&self, request: &Value) -> Result<Response> {
        let id = opt_str(request, "id").ok_or(MessengerError::MissingId)?;
        let reason = opt_str(request, "reason").ok_or(MessengerError::MissingContent)?;
        let task = self.crew.block_task(&id, &reason)?;
        self.feed_event("task.block", Some(&id), Some(&reason));
        Ok(Response::ok(
            format!("Blocked {id}."),
            "task.block",
            json!({ "task": task }),
        ))
    }

    fn handle_task_unblock(&self, request: &Value) -> Result<Response> {
        let id = opt_str(request, "id").ok_or(MessengerError::MissingId)?;
        let task = self.crew.unblock_task(&id)?;
        self.feed_event("task.unblock", Some(&id), None);
        Ok(Response::ok(
            format!("Unblocked {id}."),
            "task.unblock",
            json!({ "task": task }),
        ))
    }

    fn handle_task_ready(&self, request: &Value) -> Result<Response> {
        let epic_id = opt_str(request, "epic").ok_or(MessengerError::MissingId)?;
        self.crew.read_epic(&epic_id)?;
        let ready = self.crew.ready_tasks(&epic_id);
        Ok(Response::ok(
            format!("{} task(s) ready.", ready.len()),
            "task.ready",
            json!({ "tasks": ready }),
        ))
    }

    fn handle_task_reset(&self, request: &Value) -> Result<Response> {
        let id = opt_str(request, "id").ok_or(MessengerError::MissingId)?;
        let cascade = request
            .get("cascade")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let reset = self.crew.reset_task(&id, cascade)?;
        self.feed_event("task.reset", Some(&id), None);
        Ok(Response::ok(
            format!("Reset {} task(s).", reset.len()),
            "task.reset",
            json!({ "reset": reset }),
        ))
    }

    fn handle_plan(&self, request: &Value) -> Result<Response> {
        let target = opt_str(request, "target").ok_or(MessengerError::MissingId)?;
        let idea = request
            .get("idea")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        self.feed_event("plan.start", Some(&target), None);
        let executor = self.executor();
        executor.cleanup_artifacts(self.config.crew.artifacts_cleanup_days);
        let result = orchestrate::plan(&self.crew, &executor, &self.config.crew, &target, idea);
        match result {
            Ok(outcome) => {
                self.feed_event(
                    "plan.done",
                    Some(&outcome.epic.id),
                    Some(&format!("{} task(s)", outcome.tasks.len())),
                );
                Ok(Response::ok(
                    format!(
                        "Planned epic {}: {} task(s) from {} scout(s).",
                        outcome.epic.id,
                        outcome.tasks.len(),
                        outcome.scouts_run
                    ),
                    "plan",
                    json!({ "epic": outcome.epic, "tasks": outcome.tasks }),
                ))
            }
            Err(MessengerError::Cancelled) => {
                self.feed_event("plan.cancel", Some(&target), None);
                Err(MessengerError::Cancelled)
            }
            Err(err) => {
                self.feed_event("plan.failed", Some(&target), Some(&err.to_string()));
                Err(err)
            }
        }
    }

    fn handle_work(&self, request: &Value) -> Result<Response> {
        let target = opt_str(request, "target").ok_or(MessengerError::MissingId)?;
        let autonomous = request
            .get("autonomous")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let concurrency = request
            .get("concurrency")
            .and_then(Value::as_u64)
            .map(|n| n as usize);

        let executor = self.executor();
        executor.cleanup_artifacts(self.config.crew.artifacts_cleanup_days);
        let report = orchestrate::work(
            &self.crew,
            &executor,
            &self.config.crew,
            &target,
            autonomous,
            concurrency,
        )?;
        Ok(Response::ok(
            format!(
                "Ran {} wave(s): {} completed, {} failed, {} blocked.",
                report.waves, report.completed, report.failed, report.blocked
            ),
            "work",
            json!({ "report": report }),
        ))
    }

    fn handle_review(&self, request: &Value) -> Result<Response> {
        let target = opt_str(request, "target").ok_or(MessengerError::MissingId)?;
        let review_type = opt_str(request, "type").unwrap_or_else(|| "impl".into());
        let executor = self.executor();
        let outcome = orchestrate::review(&self.crew, &executor, &target, &review_type)?;
        self.feed_event(
            "task.done",
            Some(&target),
            Some(&format!("review verdict: {}", outcome.verdict)),
        );
        Ok(Response::ok(
            format!("Review verdict: {}.", outcome.verdict),
            "review",
            json!({ "verdict": outcome.verdict, "output": outcome.output }),
        ))
    }

    fn handle_checkpoint_save(&self, request: &Value) -> Result<Response> {
        let id = opt_str(request, "id").ok_or(MessengerError::MissingId)?;
        let checkpoint = self.crew.checkpoint_save(&id)?;
        Ok(Response::ok(
            format!("Checkpoint saved for {id} ({} task(s)).", checkpoint.tasks.len()),
            "checkpoint.save",
            json!({ "id": id, "tasks": checkpoint.tasks.len() }),
        ))
    }

    fn handle_checkpoint_restore(&self, request: &Value) -> Result<Response> {
        let id = opt_str(request, "id").ok_or(MessengerError::MissingId)?;
        let checkpoint = self.crew.checkpoint_restore(&id)?;
        Ok(Response::ok(
            format!(
                "Checkpoint restored for {id}; current state replaced ({} task(s)).",
                checkpoint.tasks.len()
            ),
            "checkpoint.restore",
            json!({ "id": id, "tasks": checkpoint.tasks.len() }),
        ))
    }

    fn handle_checkpoint_delete(&self, request: &Value) -> Result<Response> {
        let id = opt_str(request, "id").ok_or(MessengerError::MissingId)?;
        self.crew.checkpoint_delete(&id)?;
        Ok(Response::ok(
            format!("Checkpoint deleted for {id}."),
            "checkpoint.delete",
            json!({ "id": id }),
        ))
    }

    fn handle_checkpoint_list(&self) -> Result<Response> {
        let entries: Vec<Value> = self
            .crew
            .checkpoint_list()
            .into_iter()
            .map(|(checkpoint, bytes)| {
                json!({
                    "id": checkpoint.id,
                    "createdAt": checkpoint.created_at,
                    "tasks": checkpoint.tasks.len(),
                    "bytes": bytes,
                })
            })
            .collect();
        Ok(Response::ok(
            format!("{} checkpoint(s).", entries.len()),
            "checkpoint.list",
            json!({ "checkpoints": entries }),
        ))
    }

    fn handle_crew_status(&self) -> Result<Response> {
        let epics = self.crew.list_epics();
        let entries: Vec<Value> = epics
            .iter()
            .map(|epic| {
                json!({
                    "id": epic.id,
                    "title": epic.title,
                    "status": epic.status,
                    "done": epic.completed_count,
                    "total": epic.task_count,
                })
            })
            .collect();
        Ok(Response::ok(
            format!("{} epic(s).", epics.len()),
            "crew.status",
            json!({ "epics": entries }),
        ))
    }

    fn handle_crew_validate(&self, request: &Value) -> Result<Response> {
        let targets: Vec<String> = match opt_str(request, "id") {
            Some(id) => vec![id],
            None => self.crew.list_epics().into_iter().map(|e| e.id).collect(),
        };
        let mut reports = Vec::new();
        let mut error_count = 0;
        for id in &targets {
            let report = self.crew.validate_epic(id)?;
            error_count += report.errors.len();
            reports.push(json!({
                "id": id,
                "errors": report.errors,
                "warnings": report.warnings,
            }));
        }
        Ok(Response::ok(
            format!("Validated {} epic(s): {error_count} error(s).", targets.len()),
            "crew.validate",
            json!({ "reports": reports }),
        ))
    }

    fn handle_crew_agents(&self) -> Result<Response> {
        let workers: Vec<Value> = self
            .registry
            .active_agents(None)
            .into_iter()
            .filter(|r| r.name.starts_with("worker-") || r.name.starts_with("scout-"))
            .map(|r| json!({ "name": r.name, "pid": r.pid, "cwd": r.cwd }))
            .collect();
        Ok(Response::ok(
            format!("{} crew worker(s) registered.", workers.len()),
            "crew.agents",
            json!({ "workers": workers }),
        ))
    }

    fn handle_crew_install(&self, install: bool) -> Result<Response> {
        let op = if install { "add" } else { "remove" };
        let request = json!({ "autoRegisterPath": op });
        let inner = self.handle_auto_register(&request)?;
        let mode = if install { "crew.install" } else { "crew.uninstall" };
        Ok(Response::ok(inner.text, mode, inner.details))
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.stop_watcher();
        if let Some(heartbeat) = self
            .heartbeat
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            heartbeat.stop();
        }
    }
}

// ---------------------------------------------------------------------------
// Request field helpers
// ---------------------------------------------------------------------------

fn opt_str(request: &Value, key: &str) -> Option<String> {
    request
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
}

/// A field that may be a string (possibly comma-separated) or an array of
/// strings.
fn str_list(request: &Value, key: &str) -> Vec<String> {
    match request.get(key) {
        Some(Value::String(s)) => s
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect(),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect(),
        _ => vec![],
    }
}

/// Absolutize against `cwd` and lexically normalize. Symlinks are left
/// alone; equality on spec paths is plain string comparison.
pub fn canonicalize_spec(cwd: &Path, spec: &str) -> String {
    let path = Path::new(spec);
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        cwd.join(path)
    };
    let mut parts: Vec<std::ffi::OsString> = Vec::new();
    for component in absolute.components() {
        use std::path::Component;
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                parts.pop();
            }
            other => parts.push(other.as_os_str().to_os_string()),
        }
    }
    let mut out = PathBuf::new();
    for part in parts {
        out.push(part);
    }
    out.display().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonicalize_absolutizes_and_normalizes() {
        let cwd = Path::new("/work/repo");
        assert_eq!(canonicalize_spec(cwd, "specs/s.md"), "/work/repo/specs/s.md");
        assert_eq!(canonicalize_spec(cwd, "./specs/../s.md"), "/work/repo/s.md");
        assert_eq!(canonicalize_spec(cwd, "/abs/s.md"), "/abs/s.md");
    }

    #[test]
    fn str_list_accepts_string_and_array() {
        let v = json!({ "to": "a, b" });
        assert_eq!(str_list(&v, "to"), vec!["a", "b"]);
        let v = json!({ "to": ["a", "b"] });
        assert_eq!(str_list(&v, "to"), vec!["a", "b"]);
        let v = json!({ "to": "" });
        assert!(str_list(&v, "to").is_empty());
        let v = json!({});
        assert!(str_list(&v, "to").is_empty());
    }

    #[test]
    fn error_details_carry_structured_context() {
        let response = Response::error(
            &MessengerError::AlreadyClaimed {
                task_id: "T1".into(),
                agent: "alpha".into(),
            },
            "claim",
        );
        assert!(response.text.starts_with("Error:"));
        assert_eq!(response.details["mode"], "claim");
        assert_eq!(response.details["error"], "already_claimed");
        assert_eq!(response.details["conflict"]["agent"], "alpha");

        let response = Response::error(
            &MessengerError::AlreadyHaveClaim {
                agent: "alpha".into(),
                spec: "/s.md".into(),
                task_id: "T1".into(),
            },
            "claim",
        );
        assert_eq!(response.details["existing"]["taskId"], "T1");
    }
}
