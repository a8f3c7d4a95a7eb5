//! End-to-end scenarios through [`QueryEngine::execute`].

use penumbra::config::EngineConfig;
use penumbra::query::errors::{ErrorKind, QueryError, RuntimeError};
use penumbra::query::fusion::reciprocal_rank_fusion;
use penumbra::query::physical::{ExecutionMode, SortStrategy};
use penumbra::storage::{IndexKind, MemoryBackend, TextHit, VectorHit};
use penumbra::{QueryEngine, QueryRequest, Value};
use serde_json::json;

fn users() -> MemoryBackend {
    let people = [
        ("u1", "Ann", 34, "Berlin", 100),
        ("u2", "Ben", 25, "Berlin", 300),
        ("u3", "Cat", 41, "Berlin", 200),
        ("u4", "Dan", 30, "Munich", 400),
        ("u5", "Eve", 52, "Paris", 500),
        ("u6", "Fay", 15, "Berlin", 600),
    ];
    let mut backend = MemoryBackend::new().with_collection("users");
    for (key, name, age, city, created_at) in people {
        backend = backend.with_document(
            "users",
            key,
            json!({"name": name, "age": age, "city": city, "created_at": created_at}).into(),
        );
    }
    backend
        .with_index("users", "city", IndexKind::Hash)
        .with_index("users", "age", IndexKind::Ordered)
        .with_index("users", "created_at", IndexKind::Ordered)
}

fn social() -> MemoryBackend {
    users()
        .with_document("users", "user1", json!({"name": "root", "age": 20}).into())
        .with_document("users", "a", json!({"name": "a", "age": 22}).into())
        .with_document("users", "b", json!({"name": "b", "age": 28}).into())
        .with_document("users", "c", json!({"name": "c", "age": 45}).into())
        .with_graph("social", Some("users"))
        .with_edge("social", "user1", "a", Some("follows"), Value::Null)
        .with_edge("social", "a", "b", Some("follows"), Value::Null)
        .with_edge("social", "b", "c", Some("follows"), Value::Null)
}

fn engine(backend: MemoryBackend) -> QueryEngine {
    QueryEngine::with_backend(backend, EngineConfig::default())
}

fn strings(rows: &[Value]) -> Vec<&str> {
    rows.iter().filter_map(Value::as_str).collect()
}

#[test]
fn berlin_adults_newest_first() {
    let response = engine(users())
        .execute(
            &QueryRequest::new(
                r#"FOR u IN users FILTER u.age > 18 AND u.city == "Berlin" SORT u.created_at DESC LIMIT 10 RETURN u.name"#,
            )
            .explain(),
        )
        .expect("query");
    assert_eq!(strings(&response.rows), vec!["Ben", "Cat", "Ann"]);
    assert_eq!(response.count, 3);

    let plan = response.plan.expect("plan");
    assert_eq!(plan.mode, ExecutionMode::IndexOptimized);
    assert_eq!(plan.sort, SortStrategy::InMemory);
    let kinds: Vec<&str> = plan.predicate_order.iter().map(|p| p.kind).collect();
    assert_eq!(kinds, vec!["equality", "range"]);
    let metrics = response.metrics.expect("metrics");
    assert_eq!(metrics.rows_scanned, 4);
    assert!(metrics.filter_short_circuits <= metrics.filter_evaluations_total);
}

#[test]
fn constant_false_filter_never_touches_the_graph() {
    let response = engine(social())
        .execute(
            &QueryRequest::new(r#"FOR v IN 1..3 OUTBOUND "user1" GRAPH "social" FILTER 1 == 2 RETURN v"#)
                .explain(),
        )
        .expect("query");
    assert!(response.rows.is_empty());
    let metrics = response.metrics.expect("metrics");
    assert!(metrics.constant_filter_precheck);
    assert_eq!(metrics.constant_filter_result, Some(false));
    assert_eq!(metrics.edges_expanded, 0);
}

#[test]
fn rrf_scores_every_listed_document() {
    let fused = reciprocal_rank_fusion(
        &[
            VectorHit { key: "A".into(), distance: 0.1 },
            VectorHit { key: "B".into(), distance: 0.3 },
        ],
        &[
            TextHit { key: "B".into(), score: 7.0 },
            TextHit { key: "C".into(), score: 2.0 },
        ],
        60.0,
        0.5,
        0.5,
    );
    let keys: Vec<&str> = fused.iter().map(|h| h.key.as_str()).collect();
    assert_eq!(keys, vec!["B", "A", "C"]);
    let c = fused.iter().find(|h| h.key == "C").expect("C fused");
    assert!(c.score > 0.0);
    assert_eq!(c.vector_rank, None);
}

#[test]
fn hybrid_query_orders_by_fused_score() {
    let backend = MemoryBackend::new()
        .with_collection("docs")
        .with_document("docs", "A", json!({"embedding": [1.0, 0.0], "body": "nothing relevant"}).into())
        .with_document("docs", "B", json!({"embedding": [0.8, 0.6], "body": "rust rust rust"}).into())
        .with_document(
            "docs",
            "C",
            json!({"embedding": [-1.0, 0.0], "body": "rust and many other words here"}).into(),
        )
        .with_vector_index("docs", "embedding")
        .with_fulltext_index("docs", "body");
    let response = engine(backend)
        .execute(&QueryRequest::new(
            r#"FOR d IN docs FILTER FULLTEXT(d.body, "rust", 2) AND NEAR(d.embedding, [1, 0], 2, "cosine") RETURN {key: d._key, score: SCORE(d)}"#,
        ))
        .expect("hybrid query");
    let keys: Vec<Value> = response
        .rows
        .iter()
        .map(|row| row.get_path(&["key"]))
        .collect();
    assert_eq!(keys, vec![Value::from("B"), Value::from("A"), Value::from("C")]);
    let score = |i: usize| response.rows[i].get_path(&["score"]).as_f64().unwrap_or_default();
    assert!((score(0) - (0.5 / 62.0 + 0.5 / 61.0)).abs() < 1e-12);
    assert!(score(2) > 0.0);
}

#[test]
fn unindexed_filter_requires_permission() {
    let engine = engine(users());
    let query = r#"FOR u IN users FILTER u.name == "Eve" RETURN u.age"#;
    let err = engine
        .execute(&QueryRequest::new(query).explain())
        .expect_err("index required");
    assert_eq!(err.kind(), ErrorKind::Semantic);
    assert_eq!(err.code(), "INDEX_REQUIRED");
    assert!(err.to_string().contains("name"), "{err}");

    let response = engine
        .execute(&QueryRequest::new(query).allow_full_scan().explain())
        .expect("full scan permitted");
    assert_eq!(response.rows, vec![Value::Int(52)]);
    assert_eq!(
        response.plan.expect("plan").mode,
        ExecutionMode::FullScanFallback
    );
}

#[test]
fn syntax_errors_carry_a_location() {
    let err = engine(users())
        .execute(&QueryRequest::new("FOR u IN users\nFILTR u.age > 3 RETURN u"))
        .expect_err("syntax");
    let body = err.to_body();
    assert_eq!(body.kind, ErrorKind::Syntax);
    assert_eq!(body.line, Some(2));
}

#[test]
fn unknown_collection_suggests_a_name() {
    let err = engine(users())
        .execute(&QueryRequest::new("FOR u IN user RETURN u"))
        .expect_err("unknown collection");
    assert_eq!(err.code(), "UNKNOWN_COLLECTION");
    assert!(err.to_string().contains("users"), "{err}");
}

#[test]
fn runtime_errors_name_the_failing_row() {
    let backend = users().with_document("users", "u7", json!({"name": "Gus", "age": "old"}).into());
    let err = engine(backend)
        .execute(&QueryRequest::new("FOR u IN users RETURN u.age + 1"))
        .expect_err("type mismatch");
    assert!(matches!(err, QueryError::Runtime(RuntimeError::TypeMismatch { .. })));
    assert!(err.to_string().contains("users/u7"), "{err}");
}

#[test]
fn unavailable_storage_is_a_runtime_error() {
    let backend = users().fail_after(1);
    let err = engine(backend)
        .execute(&QueryRequest::new(r#"FOR u IN users FILTER u.city == "Paris" RETURN u"#))
        .expect_err("storage down");
    assert_eq!(err.kind(), ErrorKind::Runtime);
    assert_eq!(err.code(), "COLLABORATOR_UNAVAILABLE");
}

#[test]
fn disjunction_over_two_indexes() {
    let response = engine(users())
        .execute(&QueryRequest::new(
            r#"FOR u IN users FILTER u.city == "Paris" OR u.age < 20 RETURN u.name"#,
        ))
        .expect("query");
    assert_eq!(strings(&response.rows), vec!["Eve", "Fay"]);
}

#[test]
fn join_on_field_equality() {
    let backend = users()
        .with_collection("orders")
        .with_document("orders", "o1", json!({"user": "u1", "total": 30}).into())
        .with_document("orders", "o2", json!({"user": "u3", "total": 70}).into())
        .with_document("orders", "o3", json!({"user": "u1", "total": 15}).into());
    let response = engine(backend)
        .execute(&QueryRequest::new(
            "FOR o IN orders FOR u IN users FILTER o.user == u._key SORT o.total DESC RETURN [u.name, o.total]",
        ))
        .expect("join");
    assert_eq!(
        response.rows,
        vec![
            Value::from(vec![Value::from("Cat"), Value::Int(70)]),
            Value::from(vec![Value::from("Ann"), Value::Int(30)]),
            Value::from(vec![Value::from("Ann"), Value::Int(15)]),
        ]
    );
}

#[test]
fn parallel_index_scans_intersect() {
    let query = r#"FOR u IN users FILTER u.city == "Berlin" AND u.created_at < 450 RETURN u.name"#;
    let response = engine(users())
        .execute(&QueryRequest::new(query).explain())
        .expect("query");
    assert_eq!(strings(&response.rows), vec!["Ann", "Ben", "Cat"]);
    assert_eq!(response.plan.expect("plan").mode, ExecutionMode::IndexParallel);
    assert_eq!(response.metrics.expect("metrics").index_lookups, 2);

    // two estimates and one scan succeed, the second scan fails
    let err = engine(users().fail_after(3))
        .execute(&QueryRequest::new(query))
        .expect_err("storage down mid-scan");
    assert_eq!(err.kind(), ErrorKind::Runtime);
    assert_eq!(err.code(), "COLLABORATOR_UNAVAILABLE");
}

fn shop(config: EngineConfig) -> QueryEngine {
    let mut backend = MemoryBackend::new()
        .with_collection("users")
        .with_collection("orders");
    for i in 0..40 {
        let key = format!("u{i:02}");
        let city = if i % 4 == 0 { "Oslo" } else { "Rome" };
        backend = backend
            .with_document("users", key.clone(), json!({"city": city}).into())
            .with_document("orders", format!("o{i:02}"), json!({"user": key, "total": i}).into());
    }
    QueryEngine::with_backend(backend.with_index("users", "city", IndexKind::Hash), config)
}

#[test]
fn join_results_do_not_depend_on_the_build_side() {
    let query = r#"FOR u IN users FOR o IN orders FILTER u.city == "Oslo" AND o.user == u._key RETURN o.total"#;
    let expected: Vec<Value> = (0..40).step_by(4).map(Value::Int).collect();
    for budget in [64 * 1024 * 1024, 3000, 1024] {
        let mut config = EngineConfig::default();
        config.optimizer.hash_join_memory_budget_bytes = budget;
        let response = shop(config)
            .execute(&QueryRequest::new(query).explain())
            .expect("join");
        assert_eq!(response.rows, expected, "budget {budget}");
        let root = response.plan.expect("plan").root;
        let build = root.find("HashJoin").and_then(|node| node.get("build"));
        let want = match budget {
            1024 => None,
            _ => Some("left"),
        };
        assert_eq!(build, want, "budget {budget}");
    }
}

#[test]
fn join_limit_stops_after_the_page() {
    let response = shop(EngineConfig::default())
        .execute(
            &QueryRequest::new("FOR u IN users FOR o IN orders FILTER o.user == u._key LIMIT 1 RETURN o._key")
                .explain(),
        )
        .expect("join");
    assert_eq!(strings(&response.rows), vec!["o00"]);
    let plan = response.plan.expect("plan");
    assert!(plan.early_exit);
    // the page row plus one more to detect a further page
    assert_eq!(response.metrics.expect("metrics").filter_evaluations_total, 2);
}
