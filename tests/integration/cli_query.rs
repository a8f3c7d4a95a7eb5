#![allow(missing_docs)]

use std::fs;
use std::path::PathBuf;

use assert_cmd::cargo::cargo_bin_cmd;
use serde_json::{json, Value};
use tempfile::TempDir;

fn write_fixture(name: &str) -> (TempDir, PathBuf) {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join(format!("{name}.json"));
    let fixture = json!({
        "collections": {
            "users": [
                { "_key": "u1", "name": "Ann", "age": 34, "city": "Berlin" },
                { "_key": "u2", "name": "Ben", "age": 25, "city": "Berlin" },
                { "_key": "u3", "name": "Eve", "age": 52, "city": "Paris" }
            ]
        },
        "indexes": [
            { "collection": "users", "column": "city", "kind": "hash" },
            { "collection": "users", "column": "age" }
        ],
        "graphs": {
            "social": {
                "vertex_collection": "users",
                "edges": [
                    { "_from": "u1", "_to": "u2", "_type": "knows" },
                    { "_from": "u2", "_to": "u3", "_type": "knows" }
                ]
            }
        }
    });
    fs::write(&path, serde_json::to_vec_pretty(&fixture).expect("encode")).expect("write fixture");
    (dir, path)
}

/// Runs `query` against a fresh fixture and returns parsed JSON stdout.
fn query_json(name: &str, extra: &[&str], query: &str) -> Value {
    let (dir, data) = write_fixture(name);
    let output = cargo_bin_cmd!("penumbra")
        .env_remove("PENUMBRA_CONFIG")
        .arg("query")
        .arg("--data")
        .arg(&data)
        .arg("--config")
        .arg(dir.path().join("absent.toml"))
        .args(extra)
        .arg(query)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    serde_json::from_slice(&output).expect("valid json")
}

#[test]
fn query_prints_rows_as_json() {
    let json = query_json(
        "rows",
        &[],
        r#"FOR u IN users FILTER u.city == "Berlin" SORT u.age RETURN u.name"#,
    );
    assert_eq!(json["rows"], json!(["Ben", "Ann"]));
    assert_eq!(json["count"], json!(2));
    assert!(json.get("plan").is_none());
    assert!(json.get("nextCursor").is_none());
}

#[test]
fn explain_includes_plan_and_metrics() {
    let json = query_json(
        "explain",
        &["--explain"],
        r#"FOR u IN users FILTER u.age > 30 RETURN u._key"#,
    );
    assert_eq!(json["rows"], json!(["u1", "u3"]));
    assert_eq!(json["plan"]["mode"], json!("IndexOptimized"));
    assert!(json["metrics"].is_object());
}

#[test]
fn traversal_over_fixture_graph() {
    let json = query_json(
        "graph",
        &[],
        r#"FOR v IN 1..2 OUTBOUND "u1" GRAPH "social" RETURN v.name"#,
    );
    assert_eq!(json["rows"], json!(["Ben", "Eve"]));
}

#[test]
fn cursor_pages_through_results() {
    let query = "FOR u IN users SORT u.age LIMIT 2 RETURN u.name";
    let first = query_json("page1", &["--use-cursor"], query);
    assert_eq!(first["rows"], json!(["Ben", "Ann"]));
    let token = first["nextCursor"].as_str().expect("cursor").to_owned();

    let second = query_json("page2", &["--cursor", &token], query);
    assert_eq!(second["rows"], json!(["Eve"]));
    assert!(second.get("nextCursor").is_none());
}

#[test]
fn unindexed_filter_needs_allow_full_scan() {
    let (dir, data) = write_fixture("fullscan");
    let query = r#"FOR u IN users FILTER u.name == "Eve" RETURN u.age"#;
    cargo_bin_cmd!("penumbra")
        .env_remove("PENUMBRA_CONFIG")
        .arg("query")
        .arg("--data")
        .arg(&data)
        .arg("--config")
        .arg(dir.path().join("absent.toml"))
        .arg(query)
        .assert()
        .failure()
        .code(1);

    let json = query_json("fullscan-allowed", &["--allow-full-scan"], query);
    assert_eq!(json["rows"], json!([52]));
}

#[test]
fn text_format_lists_rows_and_count() {
    let (dir, data) = write_fixture("text");
    let output = cargo_bin_cmd!("penumbra")
        .env_remove("PENUMBRA_CONFIG")
        .args(["--format", "text", "query", "--data"])
        .arg(&data)
        .arg("--config")
        .arg(dir.path().join("absent.toml"))
        .arg(r#"FOR u IN users FILTER u.city == "Paris" RETURN u.name"#)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8(output).expect("utf8");
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines, vec![r#""Eve""#, "(1 rows)"]);
}

#[test]
fn parse_prints_the_syntax_tree() {
    let output = cargo_bin_cmd!("penumbra")
        .args(["parse", "FOR u IN users RETURN u"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let json: Value = serde_json::from_slice(&output).expect("valid json");
    assert!(json.is_object());
}

#[test]
fn syntax_error_exits_non_zero() {
    let output = cargo_bin_cmd!("penumbra")
        .args(["parse", "FOR u IN users\nFILTR u.age > 3 RETURN u"])
        .assert()
        .failure()
        .code(1)
        .get_output()
        .stderr
        .clone();
    let stderr = String::from_utf8(output).expect("utf8");
    assert!(stderr.starts_with("error:"), "{stderr}");
    assert!(stderr.contains("line 2"), "{stderr}");
}

#[test]
fn missing_fixture_is_reported() {
    let dir = TempDir::new().expect("tempdir");
    cargo_bin_cmd!("penumbra")
        .args(["query", "--data"])
        .arg(dir.path().join("nope.json"))
        .arg("FOR u IN users RETURN u")
        .assert()
        .failure()
        .code(1);
}

#[test]
fn profile_flag_reports_phase_timers() {
    let (dir, data) = write_fixture("profile");
    let output = cargo_bin_cmd!("penumbra")
        .env_remove("PENUMBRA_CONFIG")
        .env_remove("PENUMBRA_PROFILE")
        .arg("query")
        .arg("--data")
        .arg(&data)
        .arg("--config")
        .arg(dir.path().join("absent.toml"))
        .arg("--profile")
        .arg(r#"FOR u IN users FILTER u.city == "Berlin" RETURN u.name"#)
        .assert()
        .success()
        .get_output()
        .stderr
        .clone();
    let stderr = String::from_utf8(output).expect("utf8");
    let line = stderr
        .lines()
        .find_map(|line| line.strip_prefix("profile: "))
        .unwrap_or_else(|| panic!("no profile line in {stderr}"));
    let profile: Value = serde_json::from_str(line).expect("profile json");
    assert_eq!(profile["parse_count"], json!(1));
    assert_eq!(profile["plan_count"], json!(1));
    assert!(profile["fetch_count"].as_u64().is_some_and(|n| n >= 1));
}
