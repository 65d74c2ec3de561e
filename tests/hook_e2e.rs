use std::fs;
use std::io::Write;
use std::path::Path;
use std::process::{Command, Output, Stdio};

use serde_json::{Value, json};

const COVERAGE: &str = r#"{
  "meta": {"show_contexts": true},
  "files": {
    "taskboard/cli.py": {
      "executed_lines": [3, 4, 5],
      "contexts": {
        "3": ["tests/test_cli.py::test_add|run"],
        "4": ["tests/test_cli.py::test_add|run"],
        "5": ["tests/test_cli.py::test_list|run"]
      }
    }
  }
}"#;

const CLI_SOURCE: &str = "import sys\n\ndef add(task):\n    store.append(task)\ndef list_tasks(): print(store)\n";

fn run_cli(repo: &Path, home: &Path, args: &[&str], stdin: Option<&str>) -> Output {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_motive"));
    cmd.current_dir(repo)
        .env("HOME", home)
        .env_remove("MOTIVE_LOG")
        .args(args);
    let Some(input) = stdin else {
        return cmd.output().expect("command runs");
    };

    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let mut child = cmd.spawn().expect("command spawns");
    {
        let mut pipe = child.stdin.take().expect("stdin pipe");
        pipe.write_all(input.as_bytes()).expect("stdin write");
    }
    child.wait_with_output().expect("command output")
}

fn run_ok(repo: &Path, home: &Path, args: &[&str]) -> Value {
    let output = run_cli(repo, home, args, None);
    assert!(
        output.status.success(),
        "command failed: args={args:?}\nstderr={}",
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).expect("json stdout")
}

/// Runs the hook and returns its JSON output, or `None` when it stayed quiet.
fn hook(repo: &Path, home: &Path, args: &[&str], event: &Value) -> Option<Value> {
    let mut full = vec!["hook"];
    full.extend_from_slice(args);
    let output = run_cli(repo, home, &full, Some(&event.to_string()));
    assert!(output.status.success(), "hook must always exit 0");
    let stdout = String::from_utf8_lossy(&output.stdout);
    if stdout.trim().is_empty() {
        return None;
    }
    Some(serde_json::from_str(stdout.trim()).expect("hook json"))
}

fn context(output: Option<Value>) -> String {
    output.expect("hook output")["additionalContext"]
        .as_str()
        .expect("additionalContext")
        .to_string()
}

fn seed(repo: &Path, home: &Path) {
    run_ok(repo, home, &["init"]);
    fs::write(
        repo.join(".motive/config.yml"),
        "coverage:\n  format: coverage-json\n  path: coverage.json\n",
    )
    .expect("config");
    fs::write(repo.join("coverage.json"), COVERAGE).expect("coverage");
    fs::create_dir_all(repo.join("taskboard")).expect("src dir");
    fs::write(repo.join("taskboard/cli.py"), CLI_SOURCE).expect("cli source");
    fs::write(repo.join("taskboard/store.py"), "def save():\n    return True\n").expect("store");

    run_ok(repo, home, &["add", "goal", "Users manage their tasks"]);
    run_ok(repo, home, &["add", "expectation", "Tasks persist", "--parent", "g-001"]);
    run_ok(repo, home, &["add", "facet", "add stores a task", "--parent", "e-001"]);
    run_ok(repo, home, &["add", "facet", "list prints tasks", "--parent", "e-001"]);
    run_ok(repo, home, &["link", "f-001", "tests/test_cli.py::test_add"]);
    run_ok(repo, home, &["link", "f-002", "tests/test_cli.py::test_list"]);
    run_ok(repo, home, &["rebuild"]);
}

fn read_event(repo: &Path, file: &str, session: &str) -> Value {
    json!({
        "tool_name": "Read",
        "tool_input": {"file_path": file},
        "session_id": session,
        "cwd": repo,
    })
}

fn edit_event(repo: &Path, file: &str, old: &str, new: &str) -> Value {
    json!({
        "tool_name": "Edit",
        "tool_input": {"file_path": file, "old_string": old, "new_string": new},
        "session_id": "s-1",
        "cwd": repo,
    })
}

#[test]
fn repeated_reads_are_suppressed_until_a_new_session() {
    let temp = tempfile::tempdir().expect("tempdir");
    let home = tempfile::tempdir().expect("home");
    let repo = temp.path();
    seed(repo, home.path());

    let first = context(hook(repo, home.path(), &[], &read_event(repo, "taskboard/cli.py", "s-1")));
    assert!(first.starts_with("Motivation for taskboard/cli.py:"), "{first}");
    assert!(first.contains("f-001"));
    assert!(first.contains("f-002"));

    assert!(hook(repo, home.path(), &[], &read_event(repo, "taskboard/cli.py", "s-1")).is_none());

    let other_session =
        context(hook(repo, home.path(), &[], &read_event(repo, "taskboard/cli.py", "s-2")));
    assert!(other_session.starts_with("Motivation for taskboard/cli.py:"));

    run_ok(repo, home.path(), &["session-start", "--session-id", "s-2"]);
    assert!(hook(repo, home.path(), &[], &read_event(repo, "taskboard/cli.py", "s-2")).is_some());
}

#[test]
fn mapped_edit_reports_served_facets() {
    let temp = tempfile::tempdir().expect("tempdir");
    let home = tempfile::tempdir().expect("home");
    let repo = temp.path();
    seed(repo, home.path());

    let event = edit_event(repo, "taskboard/cli.py", "store.add(task)", "store.append(task)");
    let text = context(hook(repo, home.path(), &[], &event));
    assert!(text.starts_with("Edit to taskboard/cli.py lines 4 serves:"), "{text}");
    assert!(text.contains("[F] f-001 add stores a task"));
    assert!(!text.contains("f-002"));

    let log = run_ok(repo, home.path(), &["log"]);
    assert_eq!(log["count"], 1);
    assert_eq!(log["entries"][0]["facets"], json!(["f-001"]));
    assert_eq!(log["entries"][0]["ancestor_chains"], json!([["g-001", "e-001", "f-001"]]));
}

#[test]
fn unmapped_edit_is_nudged_logged_and_guarded() {
    let temp = tempfile::tempdir().expect("tempdir");
    let home = tempfile::tempdir().expect("home");
    let repo = temp.path();
    seed(repo, home.path());

    let event = edit_event(repo, "taskboard/store.py", "return False", "return True");
    let nudge = context(hook(repo, home.path(), &[], &event));
    assert!(nudge.contains("taskboard/store.py lines 2 is unmapped"), "{nudge}");

    let unmapped = run_ok(repo, home.path(), &["log", "--unmapped"]);
    assert_eq!(unmapped["count"], 1);
    assert_eq!(unmapped["entries"][0]["file"], "taskboard/store.py");
    assert_eq!(unmapped["entries"][0]["affected_lines"], json!([2]));

    let guarded = hook(repo, home.path(), &["--variant", "guard"], &event).expect("decision");
    assert_eq!(guarded["permissionDecision"], "deny");
    assert!(
        guarded["permissionDecisionReason"]
            .as_str()
            .expect("reason")
            .contains("unmapped")
    );

    let mapped = edit_event(repo, "taskboard/cli.py", "store.add(task)", "store.append(task)");
    let allowed = hook(repo, home.path(), &["--variant", "guard"], &mapped).expect("decision");
    assert_eq!(allowed["permissionDecision"], "allow");
}

#[test]
fn skipped_files_and_garbage_input_stay_silent() {
    let temp = tempfile::tempdir().expect("tempdir");
    let home = tempfile::tempdir().expect("home");
    let repo = temp.path();
    seed(repo, home.path());

    assert!(hook(repo, home.path(), &[], &read_event(repo, "tests/test_cli.py", "s-1")).is_none());
    assert!(hook(repo, home.path(), &[], &read_event(repo, ".motive/catalog.json", "s-1")).is_none());
    assert!(hook(repo, home.path(), &[], &json!({"tool_name": "Bash"})).is_none());

    let garbage = run_cli(repo, home.path(), &["hook"], Some("{not json"));
    assert!(garbage.status.success());
    assert!(garbage.stdout.is_empty());
}

#[test]
fn hook_is_quiet_before_any_index_exists() {
    let temp = tempfile::tempdir().expect("tempdir");
    let home = tempfile::tempdir().expect("home");
    let repo = temp.path();
    run_ok(repo, home.path(), &["init"]);
    fs::write(repo.join("app.py"), "print('hi')\n").expect("source");

    assert!(hook(repo, home.path(), &[], &read_event(repo, "app.py", "s-1")).is_none());
    let edit = edit_event(repo, "app.py", "print('hey')", "print('hi')");
    assert!(hook(repo, home.path(), &[], &edit).is_none());
    let log = run_ok(repo, home.path(), &["log"]);
    assert_eq!(log["count"], 1);
}

#[test]
fn hook_without_home_still_answers_and_exits_zero() {
    let temp = tempfile::tempdir().expect("tempdir");
    let home = tempfile::tempdir().expect("home");
    let repo = temp.path();
    seed(repo, home.path());

    let mut child = Command::new(env!("CARGO_BIN_EXE_motive"))
        .current_dir(repo)
        .env_remove("HOME")
        .env_remove("MOTIVE_LOG")
        .arg("hook")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("command spawns");
    {
        let mut pipe = child.stdin.take().expect("stdin pipe");
        pipe.write_all(read_event(repo, "taskboard/cli.py", "s-1").to_string().as_bytes())
            .expect("stdin write");
    }
    let output = child.wait_with_output().expect("command output");

    assert!(
        output.status.success(),
        "stderr={}",
        String::from_utf8_lossy(&output.stderr)
    );
    let payload: Value = serde_json::from_slice(&output.stdout).expect("hook json");
    assert!(
        payload["additionalContext"]
            .as_str()
            .expect("additionalContext")
            .starts_with("Motivation for taskboard/cli.py:")
    );
}
