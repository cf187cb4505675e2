use std::collections::HashMap;

use serde::Serialize;
use tracing::{debug, warn};

use crate::config::CrewConfig;
use crate::crew::executor::{Executor, WorkerOutcome, WorkerSpec};
use crate::crew::model::{CrewTask, Epic, TaskStatus};
use crate::crew::store::CrewStore;
use crate::error::{MessengerError, Result};

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct PlanOutcome {
    pub epic: Epic,
    pub tasks: Vec<CrewTask>,
    pub scouts_run: usize,
}

/// A task block parsed from the analyst's output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskBlock {
    pub title: String,
    pub depends_on_titles: Vec<String>,
    pub description: String,
}

/// Run the planning pipeline for `target`.
///
/// With `idea` set, `target` is a new epic's title; otherwise it names an
/// existing epic. Scouts survey in parallel, the analyst turns their
/// reports into task blocks, and each block becomes a task. Declared
/// dependencies that resolve to a sibling title are wired up; the rest are
/// dropped.
pub fn plan(
    store: &CrewStore,
    executor: &Executor,
    config: &CrewConfig,
    target: &str,
    idea: bool,
) -> Result<PlanOutcome> {
    if config.scout_concurrency == 0 {
        return Err(MessengerError::NoScouts);
    }

    let epic = if idea {
        store.create_epic(target)?
    } else {
        store.read_epic(target)?
    };
    let epic_spec = store.read_epic_spec(&epic.id);

    let scout_specs: Vec<WorkerSpec> = (1..=config.scout_concurrency)
        .map(|i| {
            WorkerSpec::new(
                format!("scout-{i}"),
                format!(
                    "Survey the workspace for epic '{}' (angle {i} of {}).\n\n{epic_spec}",
                    epic.title, config.scout_concurrency
                ),
            )
        })
        .collect();
    let scout_outcomes = executor.run(scout_specs);
    let scouts_run = scout_outcomes.len();
    let reports: Vec<&WorkerOutcome> =
        scout_outcomes.iter().filter(|o| o.success).collect();
    if reports.is_empty() {
        let detail = scout_outcomes
            .first()
            .map(|o| o.output.clone())
            .unwrap_or_default();
        return Err(if scout_outcomes.iter().any(|o| o.cancelled) {
            MessengerError::Cancelled
        } else {
            MessengerError::GeneratorFailed(detail)
        });
    }

    let mut analyst_prompt = format!(
        "Epic: {}\n\nTurn these scout reports into TASK blocks \
         (TASK: / DEPENDS: / DESC: lines).\n",
        epic.title
    );
    for report in &reports {
        analyst_prompt.push_str("\n---\n");
        analyst_prompt.push_str(&report.output);
    }
    let analyst_outcomes = executor.run(vec![WorkerSpec::new("analyst", analyst_prompt)]);
    let analyst = analyst_outcomes
        .into_iter()
        .next()
        .ok_or(MessengerError::NoAnalyst)?;
    if analyst.cancelled {
        return Err(MessengerError::Cancelled);
    }
    if !analyst.success {
        return Err(MessengerError::AnalystFailed(analyst.output));
    }

    let blocks = parse_task_blocks(&analyst.output);
    debug!(epic = %epic.id, blocks = blocks.len(), "analyst produced task blocks");

    // First pass: create every task so titles resolve to ids.
    let mut title_to_id: HashMap<String, String> = HashMap::new();
    let mut created = Vec::new();
    for block in &blocks {
        let task = store.create_task(
            &epic.id,
            &block.title,
            Some(&block.description).filter(|d| !d.is_empty()).map(String::as_str),
            vec![],
        )?;
        title_to_id.insert(normalize_title(&block.title), task.id.clone());
        created.push(task);
    }

    // Second pass: wire resolvable dependency titles.
    for (block, task) in blocks.iter().zip(created.iter_mut()) {
        let deps: Vec<String> = block
            .depends_on_titles
            .iter()
            .filter_map(|t| title_to_id.get(&normalize_title(t)).cloned())
            .filter(|dep| dep != &task.id)
            .collect();
        if deps.is_empty() {
            continue;
        }
        match store.set_task_deps(&task.id, deps) {
            Ok(updated) => *task = updated,
            Err(err) => {
                warn!(task = %task.id, %err, "dropping unresolvable dependencies");
            }
        }
    }

    let epic = store.read_epic(&epic.id)?;
    Ok(PlanOutcome {
        epic,
        tasks: created,
        scouts_run,
    })
}

/// Parse `TASK:` blocks out of analyst output. Lines outside a block are
/// ignored; `DEPENDS:` lists titles separated by `;` or `,`; everything
/// after `DESC:` until the next `TASK:` is the description.
pub fn parse_task_blocks(output: &str) -> Vec<TaskBlock> {
    let mut blocks: Vec<TaskBlock> = Vec::new();
    let mut in_desc = false;
    for line in output.lines() {
        if let Some(title) = line.strip_prefix("TASK:") {
            let title = title.trim();
            in_desc = false;
            if !title.is_empty() {
                blocks.push(TaskBlock {
                    title: title.to_string(),
                    depends_on_titles: vec![],
                    description: String::new(),
                });
            }
            continue;
        }
        let Some(current) = blocks.last_mut() else {
            continue;
        };
        if let Some(deps) = line.strip_prefix("DEPENDS:") {
            in_desc = false;
            current.depends_on_titles = deps
                .split([';', ','])
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        } else if let Some(desc) = line.strip_prefix("DESC:") {
            in_desc = true;
            current.description = desc.trim().to_string();
        } else if in_desc {
            if !current.description.is_empty() {
                current.description.push('\n');
            }
            current.description.push_str(line);
        }
    }
    for block in &mut blocks {
        block.description = block.description.trim().to_string();
    }
    blocks
}

fn normalize_title(title: &str) -> String {
    title.trim().to_lowercase()
}

// ---------------------------------------------------------------------------
// Work
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Serialize)]
pub struct WorkReport {
    pub waves: u32,
    pub completed: usize,
    pub failed: usize,
    pub blocked: usize,
    pub cancelled: bool,
}

/// Execute ready tasks in waves.
///
/// Each wave starts up to the concurrency limit of ready tasks, waits for
/// the workers, and records results. Failed tasks return to `todo` until
/// their attempt budget runs out, then auto-block. The loop ends when every
/// task is `done` or `blocked`, the wave budget is spent, or cancellation
/// arrives. Non-autonomous mode runs a single wave.
pub fn work(
    store: &CrewStore,
    executor: &Executor,
    config: &CrewConfig,
    epic_id: &str,
    autonomous: bool,
    concurrency: Option<usize>,
) -> Result<WorkReport> {
    store.read_epic(epic_id)?;
    let limit = concurrency.unwrap_or(config.worker_concurrency).max(1);
    let max_waves = if autonomous { config.max_waves } else { 1 };
    let mut report = WorkReport::default();

    for _wave in 0..max_waves {
        let ready = store.ready_tasks(epic_id);
        if ready.is_empty() {
            break;
        }
        report.waves += 1;

        let batch: Vec<CrewTask> = ready.into_iter().take(limit).collect();
        let mut specs = Vec::new();
        for task in &batch {
            let worker = worker_name(&task.id);
            store.start_task(&task.id, &worker)?;
            let spec_body = store.read_task_spec(&task.id);
            specs.push(WorkerSpec::new(
                worker,
                format!("Task {}: {}\n\n{spec_body}", task.id, task.title),
            ));
        }

        let outcomes = executor.run(specs);
        let by_worker: HashMap<String, &WorkerOutcome> = outcomes
            .iter()
            .map(|o| (o.agent_name.clone(), o))
            .collect();

        for task in &batch {
            let Some(outcome) = by_worker.get(&worker_name(&task.id)) else {
                continue;
            };
            if outcome.cancelled {
                store.reset_task(&task.id, false)?;
                report.cancelled = true;
                continue;
            }
            if outcome.success {
                store.complete_task(&task.id, &extract_summary(&outcome.output), None)?;
                report.completed += 1;
            } else {
                report.failed += 1;
                let fresh = store.read_task(&task.id)?;
                if fresh.attempt_count >= config.max_attempts_per_task {
                    store.block_task(
                        &task.id,
                        &format!(
                            "auto-blocked after {} failed attempt(s)",
                            fresh.attempt_count
                        ),
                    )?;
                    report.blocked += 1;
                } else {
                    store.reset_task(&task.id, false)?;
                }
            }
        }

        if report.cancelled {
            break;
        }
        let tasks = store.list_tasks(epic_id);
        let open = tasks
            .iter()
            .any(|t| !matches!(t.status, TaskStatus::Done | TaskStatus::Blocked));
        if !open {
            break;
        }
    }

    store.refresh_epic_counts(epic_id)?;
    Ok(report)
}

fn worker_name(task_id: &str) -> String {
    format!("worker-{}", task_id.replace('.', "-"))
}

/// Pull a human summary out of a worker's JSONL stream: the last line with
/// a `summary` field, else the last non-empty line.
pub fn extract_summary(output: &str) -> String {
    let mut summary = None;
    for line in output.lines() {
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(line) {
            if let Some(s) = value.get("summary").and_then(|v| v.as_str()) {
                summary = Some(s.to_string());
            }
        }
    }
    summary.unwrap_or_else(|| {
        output
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .unwrap_or("(no output)")
            .chars()
            .take(200)
            .collect()
    })
}

// ---------------------------------------------------------------------------
// Review
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Ship,
    NeedsWork,
    MajorRethink,
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ship => write!(f, "SHIP"),
            Self::NeedsWork => write!(f, "NEEDS_WORK"),
            Self::MajorRethink => write!(f, "MAJOR_RETHINK"),
        }
    }
}

#[derive(Debug)]
pub struct ReviewOutcome {
    pub verdict: Verdict,
    pub output: String,
}

/// Run a review worker over an epic and extract its verdict tag.
///
/// `review_type` is `plan` or `impl`. The verdict tag is authoritative; the
/// rest of the output is carried verbatim for the record.
pub fn review(
    store: &CrewStore,
    executor: &Executor,
    epic_id: &str,
    review_type: &str,
) -> Result<ReviewOutcome> {
    let epic = store.read_epic(epic_id)?;
    let tasks = store.list_tasks(epic_id);
    let mut prompt = format!(
        "Review ({review_type}) of epic '{}' [{}].\n\
         End with one line: VERDICT: SHIP | NEEDS_WORK | MAJOR_RETHINK\n\nTasks:\n",
        epic.title, epic.id
    );
    for task in &tasks {
        prompt.push_str(&format!("- {} [{}] {}\n", task.id, task.status, task.title));
    }

    let outcomes = executor.run(vec![WorkerSpec::new("reviewer", prompt)]);
    let outcome = outcomes
        .into_iter()
        .next()
        .ok_or_else(|| MessengerError::AnalystFailed("no reviewer outcome".into()))?;
    if outcome.cancelled {
        return Err(MessengerError::Cancelled);
    }
    if !outcome.success {
        return Err(MessengerError::AnalystFailed(outcome.output));
    }

    let verdict = parse_verdict(&outcome.output)
        .ok_or_else(|| MessengerError::AnalystFailed("no verdict in review output".into()))?;
    Ok(ReviewOutcome {
        verdict,
        output: outcome.output,
    })
}

/// The last `SHIP` / `NEEDS_WORK` / `MAJOR_RETHINK` found on its own line
/// (optionally prefixed `VERDICT:`) wins.
pub fn parse_verdict(output: &str) -> Option<Verdict> {
    let mut verdict = None;
    for line in output.lines() {
        let token = line
            .trim()
            .trim_start_matches("VERDICT:")
            .trim()
            .trim_matches('"');
        verdict = match token {
            "SHIP" => Some(Verdict::Ship),
            "NEEDS_WORK" => Some(Verdict::NeedsWork),
            "MAJOR_RETHINK" => Some(Verdict::MajorRethink),
            _ => verdict,
        };
    }
    // Fall back to a summary field in the JSONL stream.
    if verdict.is_none() {
        for line in output.lines() {
            if let Ok(value) = serde_json::from_str::<serde_json::Value>(line) {
                if let Some(s) = value.get("summary").and_then(|v| v.as_str()) {
                    for token in ["MAJOR_RETHINK", "NEEDS_WORK", "SHIP"] {
                        if s.contains(token) {
                            return parse_verdict(token);
                        }
                    }
                }
            }
        }
    }
    verdict
}
