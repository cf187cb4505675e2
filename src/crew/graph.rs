use std::collections::{HashMap, HashSet};

use crate::crew::model::{CrewTask, Epic, TaskStatus};

/// Tasks eligible for execution: status `todo` with every dependency `done`.
pub fn ready_tasks<'a>(tasks: &'a [CrewTask]) -> Vec<&'a CrewTask> {
    let by_id: HashMap<&str, &CrewTask> =
        tasks.iter().map(|t| (t.id.as_str(), t)).collect();
    tasks
        .iter()
        .filter(|task| {
            task.status == TaskStatus::Todo
                && task.depends_on.iter().all(|dep| {
                    by_id
                        .get(dep.as_str())
                        .is_some_and(|d| d.status == TaskStatus::Done)
                })
        })
        .collect()
}

/// Validation output for one epic.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Validate an epic's task graph and denormalized counts.
///
/// Errors: dependencies on unknown tasks, and any cycle. Warnings: stub
/// specs and count drift.
pub fn validate_epic(
    epic: &Epic,
    tasks: &[CrewTask],
    spec_is_stub: impl Fn(&str) -> bool,
) -> ValidationReport {
    let mut report = ValidationReport::default();
    let ids: HashSet<&str> = tasks.iter().map(|t| t.id.as_str()).collect();

    for task in tasks {
        for dep in &task.depends_on {
            if !ids.contains(dep.as_str()) {
                report
                    .errors
                    .push(format!("task {} depends on unknown task {}", task.id, dep));
            }
        }
    }

    for id in cycle_members(tasks) {
        report.errors.push(format!("task {id} is part of a dependency cycle"));
    }

    for task in tasks {
        if spec_is_stub(&task.id) {
            report.warnings.push(format!("task {} has a stub spec", task.id));
        }
    }

    let done = tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Done)
        .count();
    if epic.task_count != tasks.len() {
        report.warnings.push(format!(
            "epic {} task_count is {} but {} task file(s) exist",
            epic.id,
            epic.task_count,
            tasks.len()
        ));
    }
    if epic.completed_count != done {
        report.warnings.push(format!(
            "epic {} completed_count is {} but {} task(s) are done",
            epic.id, epic.completed_count, done
        ));
    }

    report
}

/// Detect whether adding dependencies would close a cycle, before writing.
pub fn would_cycle(tasks: &[CrewTask], task_id: &str, new_deps: &[String]) -> bool {
    let mut edges: HashMap<&str, Vec<&str>> = HashMap::new();
    for task in tasks {
        edges
            .entry(task.id.as_str())
            .or_default()
            .extend(task.depends_on.iter().map(String::as_str));
    }
    edges
        .entry(task_id)
        .or_default()
        .extend(new_deps.iter().map(String::as_str));

    // A cycle through the new edges must pass through task_id.
    let mut visited = HashSet::new();
    let mut stack = HashSet::new();
    has_cycle_from(task_id, &edges, &mut visited, &mut stack)
}

/// One representative task id per reachable cycle.
fn cycle_members(tasks: &[CrewTask]) -> Vec<String> {
    let edges: HashMap<&str, Vec<&str>> = tasks
        .iter()
        .map(|t| {
            (
                t.id.as_str(),
                t.depends_on.iter().map(String::as_str).collect(),
            )
        })
        .collect();

    let mut members = Vec::new();
    let mut visited = HashSet::new();
    for task in tasks {
        let mut stack = HashSet::new();
        if !visited.contains(task.id.as_str())
            && has_cycle_from(task.id.as_str(), &edges, &mut visited, &mut stack)
        {
            members.push(task.id.clone());
        }
    }
    members
}

/// DFS with a visited set and a recursion-stack set.
fn has_cycle_from<'a>(
    node: &'a str,
    edges: &HashMap<&'a str, Vec<&'a str>>,
    visited: &mut HashSet<&'a str>,
    stack: &mut HashSet<&'a str>,
) -> bool {
    if stack.contains(node) {
        return true;
    }
    if visited.contains(node) {
        return false;
    }
    visited.insert(node);
    stack.insert(node);
    if let Some(deps) = edges.get(node) {
        for dep in deps {
            if has_cycle_from(dep, edges, visited, stack) {
                return true;
            }
        }
    }
    stack.remove(node);
    false
}
