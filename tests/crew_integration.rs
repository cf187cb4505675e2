use std::path::Path;
use std::sync::Arc;

use serde_json::json;
use tempfile::tempdir;

use pi_messenger::config::Config;
use pi_messenger::crew::executor::Backend;
use pi_messenger::dispatch::Dispatcher;
use pi_messenger::store::paths::Dirs;

fn dispatcher_with_backend(root: &Path, backend: Backend) -> Dispatcher {
    let dirs = Dirs::at(root.join("base"), root.join(".pi").join("messenger"));
    Dispatcher::with_parts(
        root.to_path_buf(),
        dirs,
        Config::default(),
        "test-model",
        backend,
        Arc::new(|_| {}),
    )
}

fn dispatcher(root: &Path) -> Dispatcher {
    dispatcher_with_backend(root, Backend::stub())
}

fn create_epic(d: &Dispatcher, title: &str) -> String {
    let response = d.dispatch(&json!({ "action": "epic.create", "title": title }));
    assert!(!response.is_error(), "{}", response.text);
    response.details["epic"]["id"].as_str().unwrap().to_string()
}

fn create_task(d: &Dispatcher, epic: &str, title: &str, deps: &[&str]) -> String {
    let response = d.dispatch(&json!({
        "action": "task.create",
        "epic": epic,
        "title": title,
        "dependsOn": deps,
    }));
    assert!(!response.is_error(), "{}", response.text);
    response.details["task"]["id"].as_str().unwrap().to_string()
}

#[test]
fn epic_crud_through_dispatcher() {
    let dir = tempdir().unwrap();
    let d = dispatcher(dir.path());

    let id = create_epic(&d, "Ship OAuth");
    assert!(id.starts_with("c-1-"));

    let show = d.dispatch(&json!({ "action": "epic.show", "id": id }));
    assert_eq!(show.details["epic"]["status"], "planning");
    assert!(show.details["spec"].as_str().unwrap().contains("Ship OAuth"));

    let list = d.dispatch(&json!({ "action": "epic.list" }));
    assert_eq!(list.details["epics"].as_array().unwrap().len(), 1);

    d.dispatch(&json!({ "action": "epic.set_spec", "id": id, "content": "# Real spec\n" }));
    let show = d.dispatch(&json!({ "action": "epic.show", "id": id }));
    assert_eq!(show.details["spec"], "# Real spec\n");

    let missing = d.dispatch(&json!({ "action": "epic.show", "id": "c-9-zzz" }));
    assert_eq!(missing.details["error"], "not_found");
    let untitled = d.dispatch(&json!({ "action": "epic.create" }));
    assert_eq!(untitled.details["error"], "missing_title");
}

#[test]
fn task_lifecycle_through_dispatcher() {
    let dir = tempdir().unwrap();
    let d = dispatcher(dir.path());
    let epic = create_epic(&d, "E");
    let a = create_task(&d, &epic, "first", &[]);
    let b = create_task(&d, &epic, "second", &[a.as_str()]);

    let ready = d.dispatch(&json!({ "action": "task.ready", "epic": epic }));
    let ready_ids: Vec<&str> = ready.details["tasks"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|t| t["id"].as_str())
        .collect();
    assert_eq!(ready_ids, vec![a.as_str()]);

    d.dispatch(&json!({ "action": "task.start", "id": a }));
    let done = d.dispatch(&json!({ "action": "task.done", "id": a, "summary": "built" }));
    assert_eq!(done.details["task"]["status"], "done");

    let ready = d.dispatch(&json!({ "action": "task.ready", "epic": epic }));
    let ready_ids: Vec<&str> = ready.details["tasks"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|t| t["id"].as_str())
        .collect();
    assert_eq!(ready_ids, vec![b.as_str()]);

    d.dispatch(&json!({ "action": "task.start", "id": b }));
    d.dispatch(&json!({ "action": "task.block", "id": b, "reason": "api down" }));
    let show = d.dispatch(&json!({ "action": "task.show", "id": b }));
    assert_eq!(show.details["task"]["status"], "blocked");

    d.dispatch(&json!({ "action": "task.unblock", "id": b }));
    let show = d.dispatch(&json!({ "action": "task.show", "id": b }));
    assert_eq!(show.details["task"]["status"], "todo");

    let reset = d.dispatch(&json!({ "action": "task.reset", "id": a, "cascade": true }));
    assert!(!reset.is_error());
    let epic_state = d.dispatch(&json!({ "action": "epic.show", "id": epic }));
    assert_eq!(epic_state.details["epic"]["completed_count"], 0);
}

#[test]
fn epic_close_requires_all_done() {
    let dir = tempdir().unwrap();
    let d = dispatcher(dir.path());
    let epic = create_epic(&d, "E");
    let task = create_task(&d, &epic, "only", &[]);

    let response = d.dispatch(&json!({ "action": "epic.close", "id": epic }));
    assert_eq!(response.details["error"], "incomplete_tasks");

    d.dispatch(&json!({ "action": "task.start", "id": task }));
    d.dispatch(&json!({ "action": "task.done", "id": task }));
    let response = d.dispatch(&json!({ "action": "epic.close", "id": epic }));
    assert!(!response.is_error());
    assert_eq!(response.details["epic"]["status"], "completed");
}

#[test]
fn validate_flags_orphans_and_cycles() {
    let dir = tempdir().unwrap();
    let d = dispatcher(dir.path());
    let epic = create_epic(&d, "E");
    create_task(&d, &epic, "a", &[]);

    let response = d.dispatch(&json!({
        "action": "task.create",
        "epic": epic,
        "title": "bad",
        "dependsOn": ["ghost"],
    }));
    assert_eq!(response.details["error"], "orphan_dependency");

    let response = d.dispatch(&json!({ "action": "crew.validate", "id": epic }));
    assert!(!response.is_error());
    let report = &response.details["reports"][0];
    assert!(report["errors"].as_array().unwrap().is_empty());
}

#[test]
fn checkpoint_save_and_destructive_restore() {
    let dir = tempdir().unwrap();
    let d = dispatcher(dir.path());
    let epic = create_epic(&d, "E");
    let mut tasks = Vec::new();
    for i in 0..3 {
        tasks.push(create_task(&d, &epic, &format!("t{i}"), &[]));
    }

    let saved = d.dispatch(&json!({ "action": "checkpoint.save", "id": epic }));
    assert!(!saved.is_error());

    for id in tasks.iter().take(2) {
        d.dispatch(&json!({ "action": "task.start", "id": id }));
        d.dispatch(&json!({ "action": "task.done", "id": id }));
    }

    let list = d.dispatch(&json!({ "action": "checkpoint.list" }));
    assert_eq!(list.details["checkpoints"].as_array().unwrap().len(), 1);
    assert_eq!(list.details["checkpoints"][0]["tasks"], 3);

    let restored = d.dispatch(&json!({ "action": "checkpoint.restore", "id": epic }));
    assert!(!restored.is_error());
    assert!(restored.text.contains("current state replaced"));

    let show = d.dispatch(&json!({ "action": "epic.show", "id": epic }));
    assert_eq!(show.details["epic"]["completed_count"], 0);
    let statuses: Vec<&str> = show.details["tasks"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|t| t["status"].as_str())
        .collect();
    assert_eq!(statuses, vec!["todo", "todo", "todo"]);

    d.dispatch(&json!({ "action": "checkpoint.delete", "id": epic }));
    let response = d.dispatch(&json!({ "action": "checkpoint.restore", "id": epic }));
    assert_eq!(response.details["error"], "not_found");
}

const ANALYST_SCRIPT: &str = "\
TASK: Wire routes
DESC: HTTP layer.
TASK: Storage
DEPENDS: Wire routes
DESC: Token persistence.
";

#[test]
fn plan_creates_epic_with_dependent_tasks() {
    let dir = tempdir().unwrap();
    let d = dispatcher_with_backend(
        dir.path(),
        Backend::stub_scripted([("analyst".to_string(), ANALYST_SCRIPT.to_string())]),
    );

    let response = d.dispatch(&json!({ "action": "plan", "target": "Add OAuth", "idea": true }));
    assert!(!response.is_error(), "{}", response.text);
    let epic_id = response.details["epic"]["id"].as_str().unwrap();
    assert_eq!(response.details["epic"]["task_count"], 2);

    let tasks = response.details["tasks"].as_array().unwrap();
    assert_eq!(tasks.len(), 2);
    assert_eq!(tasks[0]["depends_on"].as_array().map(Vec::len), None);
    assert_eq!(
        tasks[1]["depends_on"][0].as_str().unwrap(),
        tasks[0]["id"].as_str().unwrap()
    );

    // plan events land in the feed
    let feed = d.dispatch(&json!({ "action": "feed", "limit": 10 }));
    let kinds: Vec<&str> = feed.details["events"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|e| e["type"].as_str())
        .collect();
    assert!(kinds.contains(&"plan.start"));
    assert!(kinds.contains(&"plan.done"));

    let status = d.dispatch(&json!({ "action": "crew.status" }));
    assert_eq!(status.details["epics"][0]["id"], epic_id);
}

#[test]
fn work_executes_waves_to_completion() {
    let dir = tempdir().unwrap();
    let d = dispatcher(dir.path());
    let epic = create_epic(&d, "E");
    let a = create_task(&d, &epic, "a", &[]);
    let _b = create_task(&d, &epic, "b", &[a.as_str()]);

    let response = d.dispatch(&json!({
        "action": "work",
        "target": epic,
        "autonomous": true,
        "concurrency": 2,
    }));
    assert!(!response.is_error(), "{}", response.text);
    assert_eq!(response.details["report"]["completed"], 2);

    let show = d.dispatch(&json!({ "action": "epic.show", "id": epic }));
    assert_eq!(show.details["epic"]["status"], "completed");
}

#[test]
fn review_returns_verdict() {
    let dir = tempdir().unwrap();
    let d = dispatcher_with_backend(
        dir.path(),
        Backend::stub_scripted([(
            "reviewer".to_string(),
            "solid work\nVERDICT: NEEDS_WORK\n".to_string(),
        )]),
    );
    let epic = create_epic(&d, "E");

    let response = d.dispatch(&json!({ "action": "review", "target": epic, "type": "impl" }));
    assert!(!response.is_error());
    assert_eq!(response.details["verdict"], "NEEDS_WORK");
}

#[test]
fn crew_agents_lists_worker_presences() {
    let dir = tempdir().unwrap();
    let d = dispatcher(dir.path());
    let response = d.dispatch(&json!({ "action": "crew.agents" }));
    assert!(!response.is_error());
    assert_eq!(response.details["workers"].as_array().unwrap().len(), 0);
}
