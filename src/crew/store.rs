use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use rand::Rng;
use tracing::debug;

use crate::crew::graph;
use crate::crew::model::{Checkpoint, CrewTask, Epic, EpicStatus, Evidence, TaskStatus};
use crate::error::{MessengerError, Result};
use crate::git;
use crate::store::atomic;
use crate::store::lock::SwarmLock;
use crate::store::paths::Dirs;

const SPEC_STUB_MARKER: &str = "_(spec pending)_";

/// The crew epic/task store under `P/.pi/messenger/crew/`.
///
/// Id allocation happens inside the swarm lock; everything else relies on
/// atomic single-file writes.
pub struct CrewStore {
    dirs: Dirs,
}

impl CrewStore {
    pub fn new(dirs: Dirs) -> Self {
        Self { dirs }
    }

    pub fn dirs(&self) -> &Dirs {
        &self.dirs
    }

    fn lock(&self) -> SwarmLock {
        SwarmLock::new(self.dirs.swarm_lock_path())
    }

    fn epic_path(&self, id: &str) -> PathBuf {
        self.dirs.epics_dir().join(format!("{id}.json"))
    }

    fn epic_spec_path(&self, id: &str) -> PathBuf {
        self.dirs.epic_specs_dir().join(format!("{id}.md"))
    }

    fn task_path(&self, id: &str) -> PathBuf {
        self.dirs.tasks_dir().join(format!("{id}.json"))
    }

    fn task_spec_path(&self, id: &str) -> PathBuf {
        self.dirs.tasks_dir().join(format!("{id}.md"))
    }

    fn block_path(&self, id: &str) -> PathBuf {
        self.dirs.blocks_dir().join(format!("{id}.md"))
    }

    fn checkpoint_path(&self, epic_id: &str) -> PathBuf {
        self.dirs.checkpoints_dir().join(format!("{epic_id}.json"))
    }

    // -- epics --------------------------------------------------------------

    /// Create an epic: id allocated under the swarm lock, status `planning`,
    /// a stub spec alongside.
    pub fn create_epic(&self, title: &str) -> Result<Epic> {
        let title = title.trim();
        if title.is_empty() {
            return Err(MessengerError::MissingTitle);
        }

        self.lock().with(|| {
            let id = self.allocate_epic_id()?;
            let epic = Epic::new(id.clone(), title.to_string());
            atomic::write_json(&self.epic_path(&id), &epic)?;
            atomic::write_text(&self.epic_spec_path(&id), &spec_stub(title))?;
            debug!(epic = %id, "created epic");
            Ok(epic)
        })
    }

    pub fn read_epic(&self, id: &str) -> Result<Epic> {
        atomic::read_json(&self.epic_path(id)).ok_or_else(|| MessengerError::NotFound(id.into()))
    }

    pub fn list_epics(&self) -> Vec<Epic> {
        list_json(&self.dirs.epics_dir())
    }

    /// Read-modify-write an epic, touching `updated_at`.
    pub fn update_epic(&self, id: &str, patch: impl FnOnce(&mut Epic)) -> Result<Epic> {
        let mut epic = self.read_epic(id)?;
        patch(&mut epic);
        epic.updated_at = Utc::now();
        atomic::write_json(&self.epic_path(id), &epic)?;
        Ok(epic)
    }

    /// Close an epic. Every task must be `done`.
    pub fn close_epic(&self, id: &str) -> Result<Epic> {
        let tasks = self.list_tasks(id);
        let remaining = tasks
            .iter()
            .filter(|t| t.status != TaskStatus::Done)
            .count();
        if remaining > 0 {
            return Err(MessengerError::IncompleteTasks {
                epic: id.into(),
                remaining,
            });
        }
        self.update_epic(id, |epic| {
            epic.status = EpicStatus::Completed;
            epic.closed_at = Some(Utc::now());
        })
    }

    pub fn set_epic_spec(&self, id: &str, content: &str) -> Result<()> {
        self.read_epic(id)?;
        atomic::write_text(&self.epic_spec_path(id), content)?;
        self.update_epic(id, |_| {})?;
        Ok(())
    }

    pub fn read_epic_spec(&self, id: &str) -> String {
        fs::read_to_string(self.epic_spec_path(id)).unwrap_or_default()
    }

    // -- tasks --------------------------------------------------------------

    /// Create a task under an epic: id `<epic>.<M>` allocated under the
    /// swarm lock, dependency references checked against the same epic.
    pub fn create_task(
        &self,
        epic_id: &str,
        title: &str,
        description: Option<&str>,
        depends_on: Vec<String>,
    ) -> Result<CrewTask> {
        let title = title.trim();
        if title.is_empty() {
            return Err(MessengerError::MissingTitle);
        }
        self.read_epic(epic_id)?;

        self.lock().with(|| {
            let existing = self.list_tasks(epic_id);
            for dep in &depends_on {
                if !existing.iter().any(|t| &t.id == dep) {
                    return Err(MessengerError::OrphanDependency {
                        task: format!("{epic_id}.new"),
                        dep: dep.clone(),
                    });
                }
            }

            let id = self.allocate_task_id(epic_id)?;
            if graph::would_cycle(&existing, &id, &depends_on) {
                return Err(MessengerError::CircularDependency(id));
            }

            let task = CrewTask::new(id.clone(), epic_id.to_string(), title.to_string(), depends_on);
            atomic::write_json(&self.task_path(&id), &task)?;
            let spec_body = match description {
                Some(desc) if !desc.trim().is_empty() => format!("# {title}\n\n{desc}\n"),
                _ => spec_stub(title),
            };
            atomic::write_text(&self.task_spec_path(&id), &spec_body)?;

            self.update_epic(epic_id, |epic| epic.task_count += 1)?;
            debug!(task = %id, "created task");
            Ok(task)
        })
    }

    pub fn read_task(&self, id: &str) -> Result<CrewTask> {
        atomic::read_json(&self.task_path(id)).ok_or_else(|| MessengerError::NotFound(id.into()))
    }

    /// All tasks of one epic, ordered by id suffix.
    pub fn list_tasks(&self, epic_id: &str) -> Vec<CrewTask> {
        let mut tasks: Vec<CrewTask> = list_json::<CrewTask>(&self.dirs.tasks_dir())
            .into_iter()
            .filter(|t| t.epic_id == epic_id)
            .collect();
        tasks.sort_by_key(|t| task_ordinal(&t.id));
        tasks
    }

    fn write_task(&self, task: &CrewTask) -> Result<()> {
        atomic::write_json(&self.task_path(&task.id), task)
    }

    pub fn read_task_spec(&self, id: &str) -> String {
        fs::read_to_string(self.task_spec_path(id)).unwrap_or_default()
    }

    /// Replace a task's dependency list, rejecting unknown references and
    /// cycles.
    pub fn set_task_deps(&self, id: &str, depends_on: Vec<String>) -> Result<CrewTask> {
        let mut task = self.read_task(id)?;
        let siblings = self.list_tasks(&task.epic_id);
        for dep in &depends_on {
            if dep == id || !siblings.iter().any(|t| &t.id == dep) {
                return Err(MessengerError::OrphanDependency {
                    task: id.to_string(),
                    dep: dep.clone(),
                });
            }
        }
        let others: Vec<CrewTask> = siblings.into_iter().filter(|t| t.id != id).collect();
        if graph::would_cycle(&others, id, &depends_on) {
            return Err(MessengerError::CircularDependency(id.to_string()));
        }
        task.depends_on = depends_on;
        task.updated_at = Utc::now();
        self.write_task(&task)?;
        Ok(task)
    }

    pub fn task_spec_is_stub(&self, id: &str) -> bool {
        let content = self.read_task_spec(id);
        content.trim().is_empty() || content.contains(SPEC_STUB_MARKER)
    }

    /// `todo` → `in_progress`; records start stamp, assignee, base commit.
    pub fn start_task(&self, id: &str, agent: &str) -> Result<CrewTask> {
        let mut task = self.read_task(id)?;
        if task.status != TaskStatus::Todo {
            return Err(MessengerError::UnknownOperation(format!(
                "cannot start task in status {}",
                task.status
            )));
        }
        let now = Utc::now();
        task.status = TaskStatus::InProgress;
        task.started_at = Some(now);
        task.assigned_to = Some(agent.to_string());
        task.attempt_count += 1;
        task.base_commit = git::current_sha(self.dirs.project());
        task.updated_at = now;
        self.write_task(&task)?;
        Ok(task)
    }

    /// `in_progress` → `done`; updates the epic's completion count and
    /// status.
    pub fn complete_task(
        &self,
        id: &str,
        summary: &str,
        evidence: Option<Evidence>,
    ) -> Result<CrewTask> {
        let mut task = self.read_task(id)?;
        if task.status != TaskStatus::InProgress {
            return Err(MessengerError::UnknownOperation(format!(
                "cannot complete task in status {}",
                task.status
            )));
        }
        let now = Utc::now();
        task.status = TaskStatus::Done;
        task.completed_at = Some(now);
        task.assigned_to = None;
        task.summary = Some(summary.to_string()).filter(|s| !s.is_empty());
        task.evidence = evidence;
        task.updated_at = now;
        self.write_task(&task)?;

        self.refresh_epic_counts(&task.epic_id)?;
        Ok(task)
    }

    /// Any unfinished status → `blocked`, with a block context file.
    pub fn block_task(&self, id: &str, reason: &str) -> Result<CrewTask> {
        let mut task = self.read_task(id)?;
        if task.status == TaskStatus::Done {
            return Err(MessengerError::UnknownOperation(
                "cannot block a done task".into(),
            ));
        }
        let now = Utc::now();
        task.status = TaskStatus::Blocked;
        task.blocked_reason = Some(reason.to_string());
        task.updated_at = now;
        self.write_task(&task)?;
        atomic::write_text(
            &self.block_path(id),
            &format!("# Blocked: {}\n\n{}\n\nSince: {}\n", task.title, reason, now),
        )?;
        Ok(task)
    }

    /// `blocked` → `todo`; removes the block context file.
    pub fn unblock_task(&self, id: &str) -> Result<CrewTask> {
        let mut task = self.read_task(id)?;
        if task.status != TaskStatus::Blocked {
            return Err(MessengerError::UnknownOperation(format!(
                "cannot unblock task in status {}",
                task.status
            )));
        }
        task.status = TaskStatus::Todo;
        task.blocked_reason = None;
        task.updated_at = Utc::now();
        self.write_task(&task)?;
        let _ = fs::remove_file(self.block_path(id));
        Ok(task)
    }

    /// Wipe execution state back to `todo`. With `cascade`, every task
    /// depending (transitively) on this one that has left `todo` is reset
    /// too.
    pub fn reset_task(&self, id: &str, cascade: bool) -> Result<Vec<String>> {
        let task = self.read_task(id)?;
        let epic_id = task.epic_id.clone();
        let mut reset_ids = Vec::new();
        self.reset_one(&task.id, &mut reset_ids)?;

        if cascade {
            let tasks = self.list_tasks(&epic_id);
            let mut frontier = vec![id.to_string()];
            while let Some(current) = frontier.pop() {
                for dependent in tasks
                    .iter()
                    .filter(|t| t.depends_on.contains(&current))
                {
                    if reset_ids.contains(&dependent.id) {
                        continue;
                    }
                    let fresh = self.read_task(&dependent.id)?;
                    if fresh.status != TaskStatus::Todo {
                        self.reset_one(&dependent.id, &mut reset_ids)?;
                    }
                    frontier.push(dependent.id.clone());
                }
            }
        }

        self.refresh_epic_counts(&epic_id)?;
        Ok(reset_ids)
    }

    fn reset_one(&self, id: &str, reset_ids: &mut Vec<String>) -> Result<()> {
        let mut task = self.read_task(id)?;
        task.status = TaskStatus::Todo;
        task.started_at = None;
        task.completed_at = None;
        task.base_commit = None;
        task.assigned_to = None;
        task.summary = None;
        task.evidence = None;
        task.blocked_reason = None;
        task.updated_at = Utc::now();
        self.write_task(&task)?;
        let _ = fs::remove_file(self.block_path(id));
        reset_ids.push(id.to_string());
        Ok(())
    }

    /// Recompute `completed_count` from task files and derive the epic
    /// status: `completed` only when everything is done.
    pub fn refresh_epic_counts(&self, epic_id: &str) -> Result<Epic> {
        let tasks = self.list_tasks(epic_id);
        let total = tasks.len();
        let done = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Done)
            .count();
        self.update_epic(epic_id, |epic| {
            epic.task_count = total;
            epic.completed_count = done;
            if total > 0 && done == total {
                epic.status = EpicStatus::Completed;
            } else {
                epic.status = EpicStatus::Active;
            }
        })
    }

    pub fn ready_tasks(&self, epic_id: &str) -> Vec<CrewTask> {
        let tasks = self.list_tasks(epic_id);
        graph::ready_tasks(&tasks).into_iter().cloned().collect()
    }

    pub fn validate_epic(&self, epic_id: &str) -> Result<graph::ValidationReport> {
        let epic = self.read_epic(epic_id)?;
        let tasks = self.list_tasks(epic_id);
        Ok(graph::validate_epic(&epic, &tasks, |id| {
            self.task_spec_is_stub(id)
        }))
    }

    // -- checkpoints ---------------------------------------------------------

    /// Snapshot the epic record, all tasks, and every spec into one file.
    /// Last writer wins on the snapshot path.
    pub fn checkpoint_save(&self, epic_id: &str) -> Result<Checkpoint> {
        let epic = self.read_epic(epic_id)?;
        let tasks = self.list_tasks(epic_id);
        let mut task_specs = BTreeMap::new();
        for task in &tasks {
            task_specs.insert(task.id.clone(), self.read_task_spec(&task.id));
        }
        let checkpoint = Checkpoint {
            id: epic_id.to_string(),
            created_at: Utc::now(),
            epic_spec: self.read_epic_spec(epic_id),
            epic,
            tasks,
            task_specs,
        };
        atomic::write_json(&self.checkpoint_path(epic_id), &checkpoint)?;
        Ok(checkpoint)
    }

    /// Restore an epic from its snapshot: every file rewritten atomically,
    /// tasks created after the snapshot removed. Destructive by design.
    pub fn checkpoint_restore(&self, epic_id: &str) -> Result<Checkpoint> {
        let checkpoint: Checkpoint = atomic::read_json(&self.checkpoint_path(epic_id))
            .ok_or_else(|| MessengerError::NotFound(format!("checkpoint {epic_id}")))?;

        atomic::write_json(&self.epic_path(epic_id), &checkpoint.epic)?;
        atomic::write_text(&self.epic_spec_path(epic_id), &checkpoint.epic_spec)?;

        let snapshot_ids: Vec<&str> = checkpoint.tasks.iter().map(|t| t.id.as_str()).collect();
        for task in self.list_tasks(epic_id) {
            if !snapshot_ids.contains(&task.id.as_str()) {
                let _ = fs::remove_file(self.task_path(&task.id));
                let _ = fs::remove_file(self.task_spec_path(&task.id));
                let _ = fs::remove_file(self.block_path(&task.id));
            }
        }
        for task in &checkpoint.tasks {
            atomic::write_json(&self.task_path(&task.id), task)?;
            let spec = checkpoint
                .task_specs
                .get(&task.id)
                .cloned()
                .unwrap_or_default();
            atomic::write_text(&self.task_spec_path(&task.id), &spec)?;
            if task.status != TaskStatus::Blocked {
                let _ = fs::remove_file(self.block_path(&task.id));
            }
        }
        Ok(checkpoint)
    }

    pub fn checkpoint_delete(&self, epic_id: &str) -> Result<()> {
        let path = self.checkpoint_path(epic_id);
        if !path.exists() {
            return Err(MessengerError::NotFound(format!("checkpoint {epic_id}")));
        }
        fs::remove_file(path)?;
        Ok(())
    }

    pub fn checkpoint_list(&self) -> Vec<(Checkpoint, u64)> {
        let dir = self.dirs.checkpoints_dir();
        let Ok(entries) = fs::read_dir(&dir) else {
            return vec![];
        };
        let mut out = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            if let Some(checkpoint) = atomic::read_json::<Checkpoint>(&path) {
                out.push((checkpoint, size));
            }
        }
        out.sort_by(|a, b| a.0.id.cmp(&b.0.id));
        out
    }

    // -- id allocation -------------------------------------------------------

    /// `c-<N>-<sss>`: N is max over existing epics plus one, sss is three
    /// lowercase alphanumerics.
    fn allocate_epic_id(&self) -> Result<String> {
        let max_n = max_epic_number(&self.dirs.epics_dir());
        Ok(format!("c-{}-{}", max_n + 1, random_suffix()))
    }

    /// `<epic_id>.<M>`: M is max over the epic's existing tasks plus one.
    fn allocate_task_id(&self, epic_id: &str) -> Result<String> {
        let max_m = self
            .list_tasks(epic_id)
            .iter()
            .map(|t| task_ordinal(&t.id))
            .max()
            .unwrap_or(0);
        Ok(format!("{epic_id}.{}", max_m + 1))
    }
}

fn spec_stub(title: &str) -> String {
    format!("# {title}\n\n{SPEC_STUB_MARKER}\n")
}

fn random_suffix() -> String {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..3)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

fn max_epic_number(dir: &Path) -> u64 {
    let Ok(entries) = fs::read_dir(dir) else {
        return 0;
    };
    entries
        .flatten()
        .filter_map(|entry| {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let stem = name.strip_suffix(".json")?;
            let rest = stem.strip_prefix("c-")?;
            let (n, _suffix) = rest.split_once('-')?;
            n.parse::<u64>().ok()
        })
        .max()
        .unwrap_or(0)
}

/// The `<M>` ordinal of a task id; 0 for malformed ids so they sort first.
fn task_ordinal(id: &str) -> u64 {
    id.rsplit_once('.')
        .and_then(|(_, m)| m.parse().ok())
        .unwrap_or(0)
}

fn list_json<T: serde::de::DeserializeOwned>(dir: &Path) -> Vec<T> {
    let Ok(entries) = fs::read_dir(dir) else {
        return vec![];
    };
    entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("json"))
        .filter_map(|p| atomic::read_json(&p))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn setup() -> (tempfile::TempDir, CrewStore) {
        let dir = tempdir().unwrap();
        let dirs = Dirs::at(dir.path().join("base"), dir.path().join("proj"));
        (dir, CrewStore::new(dirs))
    }

    #[test]
    fn epic_ids_increment_with_random_suffix() {
        let (_dir, store) = setup();
        let first = store.create_epic("First").unwrap();
        let second = store.create_epic("Second").unwrap();

        assert!(first.id.starts_with("c-1-"));
        assert!(second.id.starts_with("c-2-"));
        let suffix = first.id.rsplit('-').next().unwrap();
        assert_eq!(suffix.len(), 3);
        assert!(suffix.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
        assert_eq!(first.status, EpicStatus::Planning);
        assert_eq!(first.task_count, 0);
    }

    #[test]
    fn epic_gets_a_stub_spec() {
        let (_dir, store) = setup();
        let epic = store.create_epic("OAuth support").unwrap();
        let spec = store.read_epic_spec(&epic.id);
        assert!(spec.contains("OAuth support"));
        assert!(spec.contains(SPEC_STUB_MARKER));
    }

    #[test]
    fn task_ids_are_per_epic_ordinals() {
        let (_dir, store) = setup();
        let epic_a = store.create_epic("A").unwrap();
        let epic_b = store.create_epic("B").unwrap();

        let t1 = store.create_task(&epic_a.id, "one", None, vec![]).unwrap();
        let t2 = store.create_task(&epic_a.id, "two", None, vec![]).unwrap();
        let other = store.create_task(&epic_b.id, "other", None, vec![]).unwrap();

        assert_eq!(t1.id, format!("{}.1", epic_a.id));
        assert_eq!(t2.id, format!("{}.2", epic_a.id));
        assert_eq!(other.id, format!("{}.1", epic_b.id));
        assert_eq!(store.read_epic(&epic_a.id).unwrap().task_count, 2);
    }

    #[test]
    fn create_task_rejects_unknown_dep() {
        let (_dir, store) = setup();
        let epic = store.create_epic("E").unwrap();
        let err = store
            .create_task(&epic.id, "t", None, vec!["ghost".into()])
            .unwrap_err();
        assert!(matches!(err, MessengerError::OrphanDependency { .. }));
    }

    #[test]
    fn create_task_rejects_cross_epic_dep() {
        let (_dir, store) = setup();
        let epic_a = store.create_epic("A").unwrap();
        let epic_b = store.create_epic("B").unwrap();
        let foreign = store.create_task(&epic_b.id, "t", None, vec![]).unwrap();

        let err = store
            .create_task(&epic_a.id, "t", None, vec![foreign.id])
            .unwrap_err();
        assert!(matches!(err, MessengerError::OrphanDependency { .. }));
    }

    #[test]
    fn lifecycle_todo_through_done_updates_epic() {
        let (_dir, store) = setup();
        let epic = store.create_epic("E").unwrap();
        let task = store.create_task(&epic.id, "t", None, vec![]).unwrap();

        let started = store.start_task(&task.id, "alpha").unwrap();
        assert_eq!(started.status, TaskStatus::InProgress);
        assert_eq!(started.assigned_to.as_deref(), Some("alpha"));
        assert_eq!(started.attempt_count, 1);
        assert!(started.started_at.is_some());

        let done = store.complete_task(&task.id, "built it", None).unwrap();
        assert_eq!(done.status, TaskStatus::Done);
        assert!(done.assigned_to.is_none());
        assert!(done.completed_at.is_some());

        let epic = store.read_epic(&epic.id).unwrap();
        assert_eq!(epic.completed_count, 1);
        assert_eq!(epic.status, EpicStatus::Completed);
    }

    #[test]
    fn completion_of_some_tasks_keeps_epic_active() {
        let (_dir, store) = setup();
        let epic = store.create_epic("E").unwrap();
        let t1 = store.create_task(&epic.id, "a", None, vec![]).unwrap();
        store.create_task(&epic.id, "b", None, vec![]).unwrap();

        store.start_task(&t1.id, "alpha").unwrap();
        store.complete_task(&t1.id, "ok", None).unwrap();

        let epic = store.read_epic(&epic.id).unwrap();
        assert_eq!(epic.completed_count, 1);
        assert_eq!(epic.status, EpicStatus::Active);
    }

    #[test]
    fn invalid_transitions_are_rejected() {
        let (_dir, store) = setup();
        let epic = store.create_epic("E").unwrap();
        let task = store.create_task(&epic.id, "t", None, vec![]).unwrap();

        assert!(store.complete_task(&task.id, "nope", None).is_err());
        store.start_task(&task.id, "alpha").unwrap();
        assert!(store.start_task(&task.id, "alpha").is_err());
        assert!(store.unblock_task(&task.id).is_err());
    }

    #[test]
    fn block_and_unblock_manage_context_file() {
        let (_dir, store) = setup();
        let epic = store.create_epic("E").unwrap();
        let task = store.create_task(&epic.id, "t", None, vec![]).unwrap();
        store.start_task(&task.id, "alpha").unwrap();

        let blocked = store.block_task(&task.id, "waiting on schema").unwrap();
        assert_eq!(blocked.status, TaskStatus::Blocked);
        assert_eq!(blocked.blocked_reason.as_deref(), Some("waiting on schema"));
        let block_file = store.block_path(&task.id);
        assert!(block_file.exists());
        assert!(fs::read_to_string(&block_file)
            .unwrap()
            .contains("waiting on schema"));

        let unblocked = store.unblock_task(&task.id).unwrap();
        assert_eq!(unblocked.status, TaskStatus::Todo);
        assert!(unblocked.blocked_reason.is_none());
        assert!(!block_file.exists());
    }

    #[test]
    fn done_tasks_cannot_be_blocked() {
        let (_dir, store) = setup();
        let epic = store.create_epic("E").unwrap();
        let task = store.create_task(&epic.id, "t", None, vec![]).unwrap();
        store.start_task(&task.id, "a").unwrap();
        store.complete_task(&task.id, "ok", None).unwrap();
        assert!(store.block_task(&task.id, "why").is_err());
    }

    #[test]
    fn reset_clears_execution_state() {
        let (_dir, store) = setup();
        let epic = store.create_epic("E").unwrap();
        let task = store.create_task(&epic.id, "t", None, vec![]).unwrap();
        store.start_task(&task.id, "alpha").unwrap();
        store.complete_task(&task.id, "done", None).unwrap();

        store.reset_task(&task.id, false).unwrap();
        let fresh = store.read_task(&task.id).unwrap();
        assert_eq!(fresh.status, TaskStatus::Todo);
        assert!(fresh.started_at.is_none());
        assert!(fresh.completed_at.is_none());
        assert!(fresh.summary.is_none());
        // attempt_count survives reset; it feeds the auto-block policy.
        assert_eq!(fresh.attempt_count, 1);

        let epic = store.read_epic(&epic.id).unwrap();
        assert_eq!(epic.completed_count, 0);
        assert_eq!(epic.status, EpicStatus::Active);
    }

    #[test]
    fn cascade_reset_walks_dependents() {
        let (_dir, store) = setup();
        let epic = store.create_epic("E").unwrap();
        let a = store.create_task(&epic.id, "a", None, vec![]).unwrap();
        let b = store
            .create_task(&epic.id, "b", None, vec![a.id.clone()])
            .unwrap();
        let c = store
            .create_task(&epic.id, "c", None, vec![b.id.clone()])
            .unwrap();
        let unrelated = store.create_task(&epic.id, "u", None, vec![]).unwrap();

        for id in [&a.id, &b.id, &c.id, &unrelated.id] {
            store.start_task(id, "alpha").unwrap();
            store.complete_task(id, "ok", None).unwrap();
        }

        let reset = store.reset_task(&a.id, true).unwrap();
        assert!(reset.contains(&a.id));
        assert!(reset.contains(&b.id));
        assert!(reset.contains(&c.id));
        assert!(!reset.contains(&unrelated.id));

        assert_eq!(
            store.read_task(&unrelated.id).unwrap().status,
            TaskStatus::Done
        );
        let epic = store.read_epic(&epic.id).unwrap();
        assert_eq!(epic.completed_count, 1);
    }

    #[test]
    fn set_task_deps_validates_and_replaces() {
        let (_dir, store) = setup();
        let epic = store.create_epic("E").unwrap();
        let a = store.create_task(&epic.id, "a", None, vec![]).unwrap();
        let b = store.create_task(&epic.id, "b", None, vec![]).unwrap();

        let patched = store.set_task_deps(&b.id, vec![a.id.clone()]).unwrap();
        assert_eq!(patched.depends_on, vec![a.id.clone()]);

        let err = store.set_task_deps(&a.id, vec![b.id.clone()]).unwrap_err();
        assert!(matches!(err, MessengerError::CircularDependency(_)));
        let err = store.set_task_deps(&a.id, vec!["ghost".into()]).unwrap_err();
        assert!(matches!(err, MessengerError::OrphanDependency { .. }));
        let err = store.set_task_deps(&a.id, vec![a.id.clone()]).unwrap_err();
        assert!(matches!(err, MessengerError::OrphanDependency { .. }));
    }

    #[test]
    fn close_epic_requires_everything_done() {
        let (_dir, store) = setup();
        let epic = store.create_epic("E").unwrap();
        let task = store.create_task(&epic.id, "t", None, vec![]).unwrap();

        let err = store.close_epic(&epic.id).unwrap_err();
        assert!(matches!(err, MessengerError::IncompleteTasks { remaining: 1, .. }));

        store.start_task(&task.id, "a").unwrap();
        store.complete_task(&task.id, "ok", None).unwrap();
        let closed = store.close_epic(&epic.id).unwrap();
        assert_eq!(closed.status, EpicStatus::Completed);
        assert!(closed.closed_at.is_some());
    }

    #[test]
    fn checkpoint_save_restore_round_trips() {
        let (_dir, store) = setup();
        let epic = store.create_epic("E").unwrap();
        let mut ids = Vec::new();
        for i in 0..3 {
            ids.push(store.create_task(&epic.id, &format!("t{i}"), None, vec![]).unwrap().id);
        }
        store.set_epic_spec(&epic.id, "# E\n\nreal spec\n").unwrap();

        store.checkpoint_save(&epic.id).unwrap();

        // Complete two tasks and add a straggler after the snapshot.
        for id in ids.iter().take(2) {
            store.start_task(id, "alpha").unwrap();
            store.complete_task(id, "done", None).unwrap();
        }
        store.create_task(&epic.id, "straggler", None, vec![]).unwrap();

        store.checkpoint_restore(&epic.id).unwrap();

        let epic_after = store.read_epic(&epic.id).unwrap();
        assert_eq!(epic_after.completed_count, 0);
        assert_eq!(epic_after.task_count, 3);
        let tasks = store.list_tasks(&epic.id);
        assert_eq!(tasks.len(), 3);
        assert!(tasks.iter().all(|t| t.status == TaskStatus::Todo));
        assert_eq!(store.read_epic_spec(&epic.id), "# E\n\nreal spec\n");
    }

    #[test]
    fn checkpoint_save_is_idempotent() {
        let (_dir, store) = setup();
        let epic = store.create_epic("E").unwrap();
        store.checkpoint_save(&epic.id).unwrap();
        store.checkpoint_save(&epic.id).unwrap();
        assert_eq!(store.checkpoint_list().len(), 1);
    }

    #[test]
    fn checkpoint_delete_and_missing() {
        let (_dir, store) = setup();
        let epic = store.create_epic("E").unwrap();
        assert!(store.checkpoint_restore(&epic.id).is_err());
        store.checkpoint_save(&epic.id).unwrap();
        store.checkpoint_delete(&epic.id).unwrap();
        assert!(store.checkpoint_delete(&epic.id).is_err());
    }

    #[test]
    fn checkpoint_list_reports_metadata() {
        let (_dir, store) = setup();
        let epic = store.create_epic("E").unwrap();
        store.create_task(&epic.id, "t", None, vec![]).unwrap();
        store.checkpoint_save(&epic.id).unwrap();

        let list = store.checkpoint_list();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].0.id, epic.id);
        assert_eq!(list[0].0.tasks.len(), 1);
        assert!(list[0].1 > 0);
    }

    #[test]
    fn validate_reports_through_store() {
        let (_dir, store) = setup();
        let epic = store.create_epic("E").unwrap();
        store.create_task(&epic.id, "t", None, vec![]).unwrap();
        let report = store.validate_epic(&epic.id).unwrap();
        assert!(report.is_clean());
        // The fresh task has a stub spec.
        assert!(report.warnings.iter().any(|w| w.contains("stub")));
    }

    #[test]
    fn ready_tasks_respect_dependencies() {
        let (_dir, store) = setup();
        let epic = store.create_epic("E").unwrap();
        let a = store.create_task(&epic.id, "a", None, vec![]).unwrap();
        let b = store
            .create_task(&epic.id, "b", None, vec![a.id.clone()])
            .unwrap();

        let ready: Vec<String> = store.ready_tasks(&epic.id).iter().map(|t| t.id.clone()).collect();
        assert_eq!(ready, vec![a.id.clone()]);

        store.start_task(&a.id, "x").unwrap();
        store.complete_task(&a.id, "ok", None).unwrap();
        let ready: Vec<String> = store.ready_tasks(&epic.id).iter().map(|t| t.id.clone()).collect();
        assert_eq!(ready, vec![b.id]);
    }

    #[test]
    fn missing_epic_or_task_is_not_found() {
        let (_dir, store) = setup();
        assert!(matches!(
            store.read_epic("c-9-zzz").unwrap_err(),
            MessengerError::NotFound(_)
        ));
        assert!(matches!(
            store.read_task("c-9-zzz.1").unwrap_err(),
            MessengerError::NotFound(_)
        ));
        assert!(store
            .create_task("c-9-zzz", "t", None, vec![])
            .is_err());
    }
}
