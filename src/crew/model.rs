use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EpicStatus {
    #[default]
    Planning,
    Active,
    Blocked,
    Completed,
    Archived,
}

impl std::fmt::Display for EpicStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Planning => write!(f, "planning"),
            Self::Active => write!(f, "active"),
            Self::Blocked => write!(f, "blocked"),
            Self::Completed => write!(f, "completed"),
            Self::Archived => write!(f, "archived"),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Todo,
    InProgress,
    Done,
    Blocked,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Todo => write!(f, "todo"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Done => write!(f, "done"),
            Self::Blocked => write!(f, "blocked"),
        }
    }
}

/// An epic: `P/.pi/messenger/crew/epics/<id>.json`.
///
/// `task_count` and `completed_count` are denormalized; the task lifecycle
/// operations keep them in step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Epic {
    pub id: String,
    pub title: String,
    pub status: EpicStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<DateTime<Utc>>,
    pub task_count: usize,
    pub completed_count: usize,
}

impl Epic {
    pub fn new(id: String, title: String) -> Self {
        let now = Utc::now();
        Self {
            id,
            title,
            status: EpicStatus::Planning,
            created_at: now,
            updated_at: now,
            closed_at: None,
            task_count: 0,
            completed_count: 0,
        }
    }
}

/// Completion evidence attached to a finished task.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Evidence {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commits: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tests: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prs: Option<Vec<String>>,
}

/// A crew task: `P/.pi/messenger/crew/tasks/<id>.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CrewTask {
    pub id: String,
    pub epic_id: String,
    pub title: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_commit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence: Option<Evidence>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_reason: Option<String>,
    #[serde(default)]
    pub attempt_count: u32,
}

impl CrewTask {
    pub fn new(id: String, epic_id: String, title: String, depends_on: Vec<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            epic_id,
            title,
            status: TaskStatus::Todo,
            depends_on,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            base_commit: None,
            assigned_to: None,
            summary: None,
            evidence: None,
            blocked_reason: None,
            attempt_count: 0,
        }
    }
}

/// A frozen copy of an epic and everything under it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Checkpoint {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub epic: Epic,
    pub tasks: Vec<CrewTask>,
    pub epic_spec: String,
    /// task id -> spec body
    pub task_specs: BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_serialize_snake_case() {
        assert_eq!(
            serde_json::to_string(&TaskStatus::InProgress).unwrap(),
            r#""in_progress""#
        );
        assert_eq!(
            serde_json::to_string(&EpicStatus::Planning).unwrap(),
            r#""planning""#
        );
    }

    #[test]
    fn task_round_trips_and_omits_empty_optionals() {
        let task = CrewTask::new("c-1-abc.1".into(), "c-1-abc".into(), "Build".into(), vec![]);
        let json = serde_json::to_string(&task).unwrap();
        assert!(!json.contains("started_at"));
        assert!(!json.contains("depends_on"));
        assert!(!json.contains("evidence"));
        let parsed: CrewTask = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, task);
    }

    #[test]
    fn epic_round_trips() {
        let epic = Epic::new("c-3-xyz".into(), "OAuth".into());
        let json = serde_json::to_string(&epic).unwrap();
        assert!(!json.contains("closed_at"));
        let parsed: Epic = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, epic);
    }

    #[test]
    fn checkpoint_round_trips() {
        let epic = Epic::new("c-1-abc".into(), "E".into());
        let task = CrewTask::new("c-1-abc.1".into(), "c-1-abc".into(), "T".into(), vec![]);
        let mut task_specs = BTreeMap::new();
        task_specs.insert(task.id.clone(), "# T\n".to_string());
        let checkpoint = Checkpoint {
            id: epic.id.clone(),
            created_at: Utc::now(),
            epic,
            tasks: vec![task],
            epic_spec: "# E\n".into(),
            task_specs,
        };
        let json = serde_json::to_string(&checkpoint).unwrap();
        let parsed: Checkpoint = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, checkpoint);
    }
}
