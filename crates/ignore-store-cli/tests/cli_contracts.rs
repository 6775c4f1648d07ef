#![allow(clippy::single_match_else, clippy::uninlined_format_args)]

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use rusqlite::Connection;
use serde_json::Value;
use ulid::Ulid;

fn ignorectl_output(db_path: &Path, args: &[&str]) -> Output {
    let mut command = Command::new(env!("CARGO_BIN_EXE_ignorectl"));
    command.arg("--db").arg(db_path);
    for arg in args {
        command.arg(arg);
    }

    match command.output() {
        Ok(output) => output,
        Err(err) => panic!("failed to run ignorectl command {:?}: {err}", args),
    }
}

fn stdout_json(output: &Output) -> Value {
    match serde_json::from_slice::<Value>(&output.stdout) {
        Ok(value) => value,
        Err(err) => panic!(
            "failed to parse stdout as JSON: {err}\nstdout={}\nstderr={}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        ),
    }
}

fn assert_success(output: &Output) {
    assert!(
        output.status.success(),
        "command failed\nstdout={}\nstderr={}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
}

fn temp_db_path(label: &str) -> PathBuf {
    std::env::temp_dir().join(format!("ignorectl-contract-{label}-{}.sqlite3", Ulid::new()))
}

fn remove_db(path: &Path) {
    for suffix in ["", "-wal", "-shm"] {
        let _ = std::fs::remove_file(format!("{}{suffix}", path.display()));
    }
}

fn record_trace(db_path: &Path, keys: &[&str]) -> String {
    let mut args = vec!["traces", "record", "--commit", "c1", "--digest", "d1"];
    for key in keys {
        args.push("--key");
        args.push(*key);
    }
    let output = ignorectl_output(db_path, &args);
    assert_success(&output);
    match stdout_json(&output)["trace_id"].as_str() {
        Some(value) => value.to_string(),
        None => panic!("record output missing trace_id"),
    }
}

fn trace_states(db_path: &Path, trace_id: &str) -> Value {
    let output = ignorectl_output(db_path, &["traces", "show", "--trace-id", trace_id, "--json"]);
    assert_success(&output);
    stdout_json(&output)["states"].clone()
}

#[test]
fn help_lists_expected_subcommands() {
    let output = match Command::new(env!("CARGO_BIN_EXE_ignorectl"))
        .arg("--help")
        .output()
    {
        Ok(value) => value,
        Err(err) => panic!("failed to run help command: {err}"),
    };

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for required in ["rules", "traces", "backfill", "reconcile", "status", "check"] {
        assert!(stdout.contains(required), "help output missing {required}");
    }
}

#[test]
fn rule_lifecycle_converges_both_tables() {
    let db = temp_db_path("lifecycle");
    let sailfish = record_trace(&db, &["model=Sailfish", "os=Android", "name=One"]);
    let bullhead = record_trace(&db, &["model=Bullhead", "os=Android", "name=One"]);

    let output = ignorectl_output(
        &db,
        &[
            "rules",
            "create",
            "--author",
            "alice@example.com",
            "--query",
            "os=Android&model=Sailfish",
            "--expires",
            "2d",
            "--note",
            "known flake",
        ],
    );
    assert_success(&output);
    let created = stdout_json(&output);
    assert_eq!(created["rule"]["query"]["model"][0], "Sailfish");
    assert_eq!(created["convergence"]["complete"], true);
    let rule_id = match created["rule"]["id"].as_str() {
        Some(value) => value.to_string(),
        None => panic!("create output missing rule id"),
    };

    let states = trace_states(&db, &sailfish);
    assert_eq!(states["traces"], "true");
    assert_eq!(states["values_at_head"], "true");
    assert_eq!(trace_states(&db, &bullhead)["traces"], "unknown");

    let output = ignorectl_output(&db, &["backfill", "run", "--json"]);
    assert_success(&output);
    assert_eq!(stdout_json(&output)["complete"], true);
    assert_eq!(trace_states(&db, &bullhead)["values_at_head"], "false");

    let output = ignorectl_output(
        &db,
        &[
            "rules",
            "update",
            "--id",
            &rule_id,
            "--updated-by",
            "bob@example.com",
            "--query",
            "os=Android",
            "--expires",
            "2d",
        ],
    );
    assert_success(&output);
    assert_eq!(stdout_json(&output)["rule"]["updated_by"], "bob@example.com");
    assert_eq!(trace_states(&db, &bullhead)["traces"], "true");

    let output = ignorectl_output(&db, &["rules", "list", "--json"]);
    assert_success(&output);
    let listed = stdout_json(&output);
    assert_eq!(listed.as_array().map(Vec::len), Some(1));

    let output = ignorectl_output(&db, &["rules", "delete", "--id", &rule_id]);
    assert_success(&output);
    assert_eq!(stdout_json(&output)["deleted"], true);
    assert_eq!(trace_states(&db, &sailfish)["traces"], "false");

    let output = ignorectl_output(&db, &["rules", "delete", "--id", &rule_id]);
    assert_success(&output);
    assert_eq!(stdout_json(&output)["deleted"], false);

    let output = ignorectl_output(&db, &["check", "--json"]);
    assert_success(&output);
    assert_eq!(stdout_json(&output)["healthy"], true);

    remove_db(&db);
}

#[test]
fn invalid_query_exits_non_zero_without_writing() {
    let db = temp_db_path("invalid");
    let output = ignorectl_output(
        &db,
        &[
            "rules",
            "create",
            "--author",
            "alice@example.com",
            "--query",
            "os=Android;model=Pixel",
            "--expires",
            "1d",
        ],
    );
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("invalid query"), "stderr={stderr}");

    let output = ignorectl_output(&db, &["rules", "list", "--json"]);
    assert_success(&output);
    assert_eq!(stdout_json(&output), Value::Array(Vec::new()));

    remove_db(&db);
}

#[test]
fn check_exits_non_zero_on_cross_table_mismatch() {
    let db = temp_db_path("mismatch");
    let trace_id = record_trace(&db, &["os=Android"]);
    assert_success(&ignorectl_output(
        &db,
        &["--strategy", "push-down", "backfill", "run"],
    ));

    let conn = match Connection::open(&db) {
        Ok(conn) => conn,
        Err(err) => panic!("failed to open db: {err}"),
    };
    if let Err(err) = conn.execute(
        "UPDATE traces SET matches_any_ignore_rule = 'true' WHERE trace_id = ?1",
        [trace_id.as_str()],
    ) {
        panic!("failed to corrupt traces row: {err}");
    }
    drop(conn);

    let output = ignorectl_output(&db, &["check", "--json"]);
    assert!(!output.status.success());
    let check = stdout_json(&output);
    assert_eq!(check["healthy"], false);
    assert_eq!(check["mismatch_sample"][0], trace_id.as_str());

    let output = ignorectl_output(&db, &["status", "--json"]);
    assert_success(&output);
    assert_eq!(stdout_json(&output)["cross_table_mismatches"], 1);

    assert_success(&ignorectl_output(&db, &["reconcile"]));
    assert_success(&ignorectl_output(&db, &["check"]));

    remove_db(&db);
}
