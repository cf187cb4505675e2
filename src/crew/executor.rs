use std::collections::{HashMap, HashSet, VecDeque};
use std::fs;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, warn};

use crate::proc;
use crate::store::inbox::Inbox;
use crate::store::paths::Dirs;

pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 200 * 1024;
pub const DEFAULT_MAX_OUTPUT_LINES: usize = 5000;
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(30);
const TERM_GRACE: Duration = Duration::from_secs(5);
const WRAP_UP_TEXT: &str =
    "wrap up: finish your current step, write your summary, and exit cleanly";

/// One unit of work for a child agent process.
#[derive(Debug, Clone)]
pub struct WorkerSpec {
    pub agent_name: String,
    pub prompt: String,
    pub system_prompt: Option<String>,
    pub model: Option<String>,
    pub max_output_bytes: usize,
    pub max_output_lines: usize,
}

impl WorkerSpec {
    pub fn new(agent_name: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            agent_name: agent_name.into(),
            prompt: prompt.into(),
            system_prompt: None,
            model: None,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            max_output_lines: DEFAULT_MAX_OUTPUT_LINES,
        }
    }
}

/// Result of one worker run.
#[derive(Debug, Clone)]
pub struct WorkerOutcome {
    pub agent_name: String,
    pub success: bool,
    pub exit_code: i32,
    pub output: String,
    pub truncated: bool,
    pub cancelled: bool,
    pub artifact_dir: Option<PathBuf>,
}

/// Progress notifications pushed back to the caller.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Started { agent: String },
    Finished { agent: String, success: bool },
}

pub type EventSink = Arc<dyn Fn(WorkerEvent) + Send + Sync>;

/// How worker processes are launched.
///
/// `Host` spawns the host coding agent with the well-known argument
/// pattern; `Stub` synthesizes outcomes in-process for tests and dry runs.
#[derive(Debug, Clone)]
pub enum Backend {
    Host {
        program: String,
        extra_args: Vec<String>,
    },
    Stub {
        fail: HashSet<String>,
        /// agent name -> canned raw output, for deterministic tests
        scripted: HashMap<String, String>,
    },
}

impl Backend {
    pub fn host(program: impl Into<String>) -> Self {
        Self::Host {
            program: program.into(),
            extra_args: vec![],
        }
    }

    pub fn stub() -> Self {
        Self::Stub {
            fail: HashSet::new(),
            scripted: HashMap::new(),
        }
    }

    pub fn stub_failing(fail: impl IntoIterator<Item = String>) -> Self {
        Self::Stub {
            fail: fail.into_iter().collect(),
            scripted: HashMap::new(),
        }
    }

    pub fn stub_scripted(scripted: impl IntoIterator<Item = (String, String)>) -> Self {
        Self::Stub {
            fail: HashSet::new(),
            scripted: scripted.into_iter().collect(),
        }
    }
}

/// Runs agent-tasks as child processes with bounded concurrency, captures
/// their JSON-lines progress streams, and shuts them down gracefully on
/// cancellation: steer message into the worker's inbox, a grace window,
/// SIGTERM, then SIGKILL.
pub struct Executor {
    backend: Backend,
    dirs: Dirs,
    concurrency: usize,
    shutdown_grace: Duration,
    artifacts_enabled: bool,
    pub cancel: Arc<AtomicBool>,
    events: EventSink,
}

impl Executor {
    pub fn new(backend: Backend, dirs: Dirs, concurrency: usize) -> Self {
        Self {
            backend,
            dirs,
            concurrency: concurrency.max(1),
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            artifacts_enabled: false,
            cancel: Arc::new(AtomicBool::new(false)),
            events: Arc::new(|_| {}),
        }
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_artifacts(mut self, enabled: bool) -> Self {
        self.artifacts_enabled = enabled;
        self
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    /// Run every spec, at most `concurrency` at a time. Specs not yet
    /// started when cancellation arrives come back as cancelled outcomes.
    pub fn run(&self, specs: Vec<WorkerSpec>) -> Vec<WorkerOutcome> {
        let queue: Arc<Mutex<VecDeque<WorkerSpec>>> = Arc::new(Mutex::new(specs.into()));
        let outcomes: Arc<Mutex<Vec<WorkerOutcome>>> = Arc::new(Mutex::new(Vec::new()));

        let workers = self.concurrency;
        thread::scope(|scope| {
            for _ in 0..workers {
                let queue = Arc::clone(&queue);
                let outcomes = Arc::clone(&outcomes);
                scope.spawn(move || {
                    loop {
                        let spec = queue.lock().unwrap_or_else(|e| e.into_inner()).pop_front();
                        let Some(spec) = spec else { break };

                        let outcome = if self.cancel.load(Ordering::SeqCst) {
                            cancelled_outcome(spec)
                        } else {
                            (self.events)(WorkerEvent::Started {
                                agent: spec.agent_name.clone(),
                            });
                            let outcome = self.run_one(spec);
                            (self.events)(WorkerEvent::Finished {
                                agent: outcome.agent_name.clone(),
                                success: outcome.success,
                            });
                            outcome
                        };
                        outcomes
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .push(outcome);
                    }
                });
            }
        });

        Arc::try_unwrap(outcomes)
            .map(|m| m.into_inner().unwrap_or_else(|e| e.into_inner()))
            .unwrap_or_default()
    }

    fn run_one(&self, spec: WorkerSpec) -> WorkerOutcome {
        match &self.backend {
            Backend::Stub { fail, scripted } => self.run_stub(spec, fail, scripted),
            Backend::Host {
                program,
                extra_args,
            } => self.run_host(spec, program, extra_args),
        }
    }

    fn run_stub(
        &self,
        spec: WorkerSpec,
        fail: &HashSet<String>,
        scripted: &HashMap<String, String>,
    ) -> WorkerOutcome {
        let success = !fail.contains(&spec.agent_name);
        let first_line = spec.prompt.lines().next().unwrap_or("").to_string();
        let raw = if let Some(canned) = scripted.get(&spec.agent_name) {
            canned.clone()
        } else if success {
            format!("{{\"type\":\"result\",\"summary\":\"completed: {first_line}\"}}\n")
        } else {
            format!("{{\"type\":\"error\",\"summary\":\"failed: {first_line}\"}}\n")
        };
        let lines: Vec<String> = raw.lines().map(String::from).collect();
        let (output, truncated) =
            truncate_output(&lines, spec.max_output_lines, spec.max_output_bytes);
        let artifact_dir = self.write_artifacts(&spec, &output);
        WorkerOutcome {
            agent_name: spec.agent_name,
            success,
            exit_code: i32::from(!success),
            output,
            truncated,
            cancelled: false,
            artifact_dir,
        }
    }

    fn run_host(&self, spec: WorkerSpec, program: &str, extra_args: &[String]) -> WorkerOutcome {
        let mut cmd = Command::new(program);
        cmd.args(extra_args)
            .arg("--output-format")
            .arg("stream-json")
            .arg("--no-session")
            .arg("-p")
            .arg(&spec.prompt)
            .env("PI_CREW_WORKER", "1")
            .env("PI_AGENT_NAME", &spec.agent_name)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        if let Some(model) = &spec.model {
            cmd.arg("--model").arg(model);
        }

        // The system prompt travels via a temp file path, not argv.
        let system_prompt_file = spec.system_prompt.as_ref().and_then(|content| {
            let path = std::env::temp_dir().join(format!(
                "pi-crew-system-{}-{}.md",
                std::process::id(),
                spec.agent_name
            ));
            match fs::write(&path, content) {
                Ok(()) => Some(path),
                Err(err) => {
                    warn!(agent = %spec.agent_name, %err, "system prompt temp file failed");
                    None
                }
            }
        });
        if let Some(path) = &system_prompt_file {
            cmd.arg("--append-system-prompt").arg(path);
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => {
                return WorkerOutcome {
                    agent_name: spec.agent_name,
                    success: false,
                    exit_code: 1,
                    output: format!("failed to spawn worker: {err}"),
                    truncated: false,
                    cancelled: false,
                    artifact_dir: None,
                };
            }
        };
        let pid = child.id();
        debug!(agent = %spec.agent_name, pid, "spawned worker");

        // Stream stdout on a side thread; the stream is JSON-lines.
        let stdout = child.stdout.take();
        let max_lines = spec.max_output_lines;
        let stdout_handle = thread::spawn(move || {
            let mut lines = Vec::new();
            let mut dropped = false;
            if let Some(stdout) = stdout {
                for line in BufReader::new(stdout).lines() {
                    match line {
                        Ok(line) => {
                            // Keep one line past the cap so truncation is
                            // detected, then stop storing.
                            if lines.len() <= max_lines {
                                lines.push(line);
                            } else {
                                dropped = true;
                            }
                        }
                        Err(_) => break,
                    }
                }
            }
            (lines, dropped)
        });
        let stderr = child.stderr.take();
        let stderr_handle = thread::spawn(move || {
            let mut text = String::new();
            if let Some(stderr) = stderr {
                for line in BufReader::new(stderr).lines().map_while(|l| l.ok()) {
                    text.push_str(&line);
                    text.push('\n');
                }
            }
            text
        });

        let mut cancelled = false;
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break Some(status),
                Ok(None) => {
                    if self.cancel.load(Ordering::SeqCst) && !cancelled {
                        cancelled = true;
                        self.wind_down(&spec.agent_name, &mut child, pid);
                        // wind_down either saw the child exit or killed it;
                        // the next try_wait observes the final status.
                        continue;
                    }
                    thread::sleep(Duration::from_millis(100));
                }
                Err(err) => {
                    warn!(agent = %spec.agent_name, %err, "wait on worker failed");
                    break None;
                }
            }
        };

        let (lines, dropped) = stdout_handle.join().unwrap_or_default();
        let stderr_text = stderr_handle.join().unwrap_or_default();
        let _ = child.wait();
        if let Some(path) = &system_prompt_file {
            let _ = fs::remove_file(path);
        }

        let (mut output, mut truncated) =
            truncate_output(&lines, spec.max_output_lines, spec.max_output_bytes);
        truncated |= dropped;
        let exit_code = status.and_then(|s| s.code()).unwrap_or(-1);
        let success = status.is_some_and(|s| s.success()) && !cancelled;
        if !success && output.trim().is_empty() {
            output = stderr_text;
        }

        let artifact_dir = self.write_artifacts(&spec, &output);
        WorkerOutcome {
            agent_name: spec.agent_name,
            success,
            exit_code,
            output,
            truncated,
            cancelled,
            artifact_dir,
        }
    }

    /// Graceful shutdown: steer message, grace window, then escalate.
    fn wind_down(&self, agent: &str, child: &mut std::process::Child, pid: u32) {
        debug!(agent, pid, "winding down worker");
        let inbox = Inbox::new(self.dirs.clone());
        let _ = inbox.send("crew", agent, WRAP_UP_TEXT, None);

        let deadline = Instant::now() + self.shutdown_grace;
        while Instant::now() < deadline {
            if let Ok(Some(_)) = child.try_wait() {
                return;
            }
            thread::sleep(Duration::from_millis(100));
        }
        proc::terminate_with_grace(pid, TERM_GRACE);
    }

    fn write_artifacts(&self, spec: &WorkerSpec, output: &str) -> Option<PathBuf> {
        if !self.artifacts_enabled {
            return None;
        }
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%3f");
        let dir = self
            .dirs
            .artifacts_dir()
            .join(format!("{}-{stamp}", spec.agent_name));
        let write = || -> std::io::Result<()> {
            fs::create_dir_all(&dir)?;
            fs::write(dir.join("prompt.md"), &spec.prompt)?;
            fs::write(dir.join("output.txt"), output)?;
            fs::write(dir.join("stream.jsonl"), output)?;
            let meta = serde_json::json!({
                "agent": spec.agent_name,
                "model": spec.model,
                "createdAt": Utc::now(),
            });
            fs::write(dir.join("meta.json"), serde_json::to_string_pretty(&meta)?)?;
            Ok(())
        };
        match write() {
            Ok(()) => Some(dir),
            Err(err) => {
                warn!(agent = %spec.agent_name, %err, "artifact write failed");
                None
            }
        }
    }

    /// Remove artifact directories older than `cleanup_days`.
    pub fn cleanup_artifacts(&self, cleanup_days: u32) {
        let root = self.dirs.artifacts_dir();
        let Ok(entries) = fs::read_dir(&root) else {
            return;
        };
        let horizon = Duration::from_secs(u64::from(cleanup_days) * 24 * 3600);
        for entry in entries.flatten() {
            let Ok(meta) = entry.metadata() else { continue };
            let age = meta.modified().ok().and_then(|t| t.elapsed().ok());
            if age.is_some_and(|a| a > horizon) {
                debug!(dir = %entry.path().display(), "removing old artifact dir");
                let _ = fs::remove_dir_all(entry.path());
            }
        }
    }
}

fn cancelled_outcome(spec: WorkerSpec) -> WorkerOutcome {
    WorkerOutcome {
        agent_name: spec.agent_name,
        success: false,
        exit_code: -1,
        output: String::new(),
        truncated: false,
        cancelled: true,
        artifact_dir: None,
    }
}

/// Cap captured output, lines first, then bytes.
///
/// The byte cut lands on a line boundary found by binary search: the
/// largest prefix of whole lines that fits the byte budget.
pub fn truncate_output(lines: &[String], max_lines: usize, max_bytes: usize) -> (String, bool) {
    let mut truncated = false;
    let kept = if lines.len() > max_lines {
        truncated = true;
        &lines[..max_lines]
    } else {
        lines
    };

    // Cumulative byte size of the first k lines (newline-joined).
    let size_of = |k: usize| -> usize {
        if k == 0 {
            return 0;
        }
        kept[..k].iter().map(|l| l.len() + 1).sum()
    };

    if size_of(kept.len()) <= max_bytes {
        return (kept.join("\n") + if kept.is_empty() { "" } else { "\n" }, truncated);
    }

    truncated = true;
    let (mut lo, mut hi) = (0usize, kept.len());
    while lo < hi {
        let mid = (lo + hi).div_ceil(2);
        if size_of(mid) <= max_bytes {
            lo = mid;
        } else {
            hi = mid - 1;
        }
    }
    let mut out = kept[..lo].join("\n");
    if lo > 0 {
        out.push('\n');
    }
    (out, truncated)
}
