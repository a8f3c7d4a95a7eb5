//! Graph traversal and shortest path through the engine.

use penumbra::config::EngineConfig;
use penumbra::query::errors::ErrorKind;
use penumbra::query::profile::Metrics;
use penumbra::storage::MemoryBackend;
use penumbra::{QueryEngine, QueryRequest, Value};
use serde_json::json;

fn chain() -> MemoryBackend {
    MemoryBackend::new()
        .with_collection("users")
        .with_document("users", "user1", json!({"age": 20}).into())
        .with_document("users", "a", json!({"age": 22}).into())
        .with_document("users", "b", json!({"age": 28}).into())
        .with_document("users", "c", json!({"age": 45}).into())
        .with_graph("social", Some("users"))
        .with_edge("social", "user1", "a", Some("follows"), json!({"since": 2019}).into())
        .with_edge("social", "a", "b", Some("follows"), json!({"since": 2021}).into())
        .with_edge("social", "b", "c", Some("follows"), json!({"since": 2023}).into())
}

fn run(backend: MemoryBackend, query: &str) -> (Vec<Value>, Metrics) {
    run_with(backend, EngineConfig::default(), query)
}

fn run_with(backend: MemoryBackend, config: EngineConfig, query: &str) -> (Vec<Value>, Metrics) {
    let response = QueryEngine::with_backend(backend, config)
        .execute(&QueryRequest::new(query).explain())
        .unwrap_or_else(|err| panic!("{query}: {err}"));
    (response.rows, response.metrics.expect("explain metrics"))
}

fn keys(rows: &[Value]) -> Vec<&str> {
    rows.iter().filter_map(Value::as_str).collect()
}

#[test]
fn filter_on_the_last_level_prunes_only_there() {
    let (rows, metrics) = run(
        chain(),
        r#"FOR v IN 1..3 OUTBOUND "user1" GRAPH "social" FILTER v.age > 30 RETURN v._key"#,
    );
    assert_eq!(keys(&rows), vec!["c"]);
    assert_eq!(metrics.pruned_last_level, 0);

    let (rows, metrics) = run(
        chain(),
        r#"FOR v IN 1..2 OUTBOUND "user1" GRAPH "social" FILTER v.age > 30 RETURN v._key"#,
    );
    assert!(rows.is_empty());
    assert_eq!(metrics.pruned_last_level, 1);
    assert_eq!(metrics.enqueued_per_depth.get(&2), None);
}

#[test]
fn depth_window_and_direction() {
    let (rows, _) = run(chain(), r#"FOR v IN 2..3 OUTBOUND "user1" GRAPH "social" RETURN v._key"#);
    assert_eq!(keys(&rows), vec!["b", "c"]);

    let (rows, _) = run(chain(), r#"FOR v IN 0..1 OUTBOUND "user1" GRAPH "social" RETURN v._key"#);
    assert_eq!(keys(&rows), vec!["user1", "a"]);

    let (rows, _) = run(chain(), r#"FOR v IN 1..2 INBOUND "c" GRAPH "social" RETURN v._key"#);
    assert_eq!(keys(&rows), vec!["b", "a"]);

    let (rows, _) = run(chain(), r#"FOR v IN 1..1 ANY "b" GRAPH "social" RETURN v._key"#);
    assert_eq!(keys(&rows), vec!["c", "a"]);
}

#[test]
fn edge_and_path_variables() {
    let (rows, _) = run(
        chain(),
        r#"FOR v, e, p IN 1..3 OUTBOUND "user1" GRAPH "social" FILTER v._key == "c" RETURN [p.length, e._from, e.since, LENGTH(p.edges)]"#,
    );
    assert_eq!(rows, vec![Value::from(json!([3, "b", 2023, 3]))]);

    let (rows, _) = run(
        chain(),
        r#"FOR v, e IN 0..1 OUTBOUND "user1" GRAPH "social" RETURN e"#,
    );
    assert_eq!(rows[0], Value::Null);
    assert_eq!(rows[1].get_path(&["_to"]), Value::from("a"));
}

#[test]
fn cycles_visit_each_vertex_once() {
    let backend = MemoryBackend::new()
        .with_graph("ring", None)
        .with_edge("ring", "x", "y", None, Value::Null)
        .with_edge("ring", "y", "z", None, Value::Null)
        .with_edge("ring", "z", "x", None, Value::Null)
        .with_edge("ring", "x", "z", None, Value::Null);
    let (rows, metrics) = run(backend, r#"FOR v IN 1..10 OUTBOUND "x" GRAPH "ring" RETURN v._key"#);
    assert_eq!(keys(&rows), vec!["y", "z"]);
    assert_eq!(metrics.enqueued_per_depth.get(&1), Some(&2));
    assert_eq!(metrics.enqueued_per_depth.get(&2), None);
}

#[test]
fn path_quantifiers() {
    let query = |constraint: &str| {
        format!(r#"FOR v IN 1..3 OUTBOUND "user1" GRAPH "social" FILTER {constraint} RETURN v._key"#)
    };
    let (rows, metrics) = run(chain(), &query("PATH_ALL(v.age < 30)"));
    assert_eq!(keys(&rows), vec!["a", "b"]);
    assert_eq!(metrics.path_constraint_rejections, 1);

    let (rows, _) = run(chain(), &query("PATH_NONE(v.age > 25)"));
    assert_eq!(keys(&rows), vec!["a"]);

    let (rows, _) = run(chain(), &query("PATH_ANY(v.age > 25)"));
    assert_eq!(keys(&rows), vec!["b", "c"]);
}

#[test]
fn frontier_soft_limit_is_reported_not_enforced() {
    let mut backend = MemoryBackend::new().with_graph("star", None);
    for leaf in ["s1", "s2", "s3"] {
        backend = backend.with_edge("star", "hub", leaf, None, Value::Null);
    }
    let mut config = EngineConfig::default();
    config.traversal.max_frontier_size = 1;
    let (rows, metrics) = run_with(
        backend,
        config,
        r#"FOR v IN 1..2 OUTBOUND "hub" GRAPH "star" RETURN v._key"#,
    );
    assert_eq!(keys(&rows), vec!["s1", "s2", "s3"]);
    assert_eq!(metrics.max_frontier_size_reached, 3);
    assert!(metrics.frontier_limit_hits >= 1);
}

fn wide_star(leaves: usize) -> MemoryBackend {
    let mut backend = MemoryBackend::new()
        .with_collection("nodes")
        .with_document("nodes", "hub", json!({"n": -1}).into());
    for i in 0..leaves {
        backend = backend.with_document("nodes", format!("s{i:02}"), json!({"n": i}).into());
    }
    backend = backend.with_graph("star", Some("nodes"));
    for i in 0..leaves {
        backend = backend.with_edge("star", "hub", &format!("s{i:02}"), None, Value::Null);
    }
    backend
}

#[test]
fn limit_stops_filtering_traversal_rows_early() {
    let (rows, metrics) = run(
        wide_star(50),
        r#"FOR v IN 1..2 OUTBOUND "hub" GRAPH "star" FILTER v.n >= 0 LIMIT 1 RETURN v._key"#,
    );
    assert_eq!(keys(&rows), vec!["s00"]);
    assert_eq!(metrics.filter_evaluations_total, 2);

    let (rows, metrics) = run(
        wide_star(50),
        r#"FOR v IN 1..1 OUTBOUND "hub" GRAPH "star" LIMIT 2, 1 RETURN v._key"#,
    );
    assert_eq!(keys(&rows), vec!["s02"]);
    assert_eq!(metrics.enqueued_per_depth.get(&1), Some(&4));
}

fn roads(ac_weight: f64) -> MemoryBackend {
    MemoryBackend::new()
        .with_graph("roads", None)
        .with_edge("roads", "a", "b", None, json!({"w": 1.0}).into())
        .with_edge("roads", "b", "c", None, json!({"w": 1.5}).into())
        .with_edge("roads", "a", "c", None, json!({"w": ac_weight}).into())
}

#[test]
fn shortest_path_follows_weights() {
    let weighted = r#"FOR v IN OUTBOUND SHORTEST_PATH "a" TO "c" GRAPH "roads" WEIGHT "w" RETURN v._key"#;
    let (rows, _) = run(roads(5.0), weighted);
    assert_eq!(keys(&rows), vec!["a", "b", "c"]);

    let (rows, _) = run(roads(2.0), weighted);
    assert_eq!(keys(&rows), vec!["a", "c"]);

    let (rows, _) = run(
        roads(5.0),
        r#"FOR v IN OUTBOUND SHORTEST_PATH "a" TO "c" GRAPH "roads" RETURN v._key"#,
    );
    assert_eq!(keys(&rows), vec!["a", "c"]);

    let (rows, _) = run(
        roads(5.0),
        r#"FOR v IN OUTBOUND SHORTEST_PATH "c" TO "a" GRAPH "roads" RETURN v._key"#,
    );
    assert!(rows.is_empty());
}

#[test]
fn negative_stored_weight_fails_at_runtime() {
    let err = QueryEngine::with_backend(roads(-1.0), EngineConfig::default())
        .execute(&QueryRequest::new(
            r#"FOR v IN OUTBOUND SHORTEST_PATH "a" TO "c" GRAPH "roads" WEIGHT "w" RETURN v"#,
        ))
        .expect_err("negative weight");
    assert_eq!(err.kind(), ErrorKind::Runtime);
    assert_eq!(err.code(), "NEGATIVE_WEIGHT");
}

#[test]
fn depth_beyond_the_hard_limit_is_rejected() {
    let mut config = EngineConfig::default();
    config.traversal.max_depth = 4;
    let err = QueryEngine::with_backend(chain(), config)
        .execute(&QueryRequest::new(
            r#"FOR v IN 1..9 OUTBOUND "user1" GRAPH "social" RETURN v"#,
        ))
        .expect_err("too deep");
    assert_eq!(err.code(), "INVALID_DEPTH");
}
