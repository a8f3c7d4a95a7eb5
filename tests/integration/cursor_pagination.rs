//! Cursor paging over sorted, natural, ranked and traversal results.

use penumbra::config::EngineConfig;
use penumbra::storage::{IndexKind, MemoryBackend};
use penumbra::{QueryEngine, QueryRequest, QueryResponse, Value};
use serde_json::json;

fn items() -> MemoryBackend {
    let mut backend = MemoryBackend::new().with_collection("items");
    for i in 0..23_i64 {
        let text = if i % 3 == 0 { "red apple" } else { "green apple pie" };
        backend = backend.with_document(
            "items",
            format!("k{i:02}"),
            json!({"bucket": i % 4, "n": i, "text": text}).into(),
        );
    }
    backend
        .with_index("items", "bucket", IndexKind::Ordered)
        .with_fulltext_index("items", "text")
}

fn engine(config: EngineConfig) -> QueryEngine {
    QueryEngine::with_backend(items(), config)
}

/// Follows cursors until exhausted, returning every page.
fn drain(engine: &QueryEngine, first: QueryRequest) -> Vec<QueryResponse> {
    let mut pages = Vec::new();
    let mut request = first.clone();
    loop {
        let page = engine.execute(&request).expect("page");
        let next = page.next_cursor.clone();
        pages.push(page);
        match next {
            Some(token) => request = first.clone().with_cursor(token),
            None => return pages,
        }
        assert!(pages.len() < 100, "cursor never ended");
    }
}

fn flatten(pages: &[QueryResponse]) -> Vec<Value> {
    pages.iter().flat_map(|p| p.rows.iter().cloned()).collect()
}

#[test]
fn sorted_pages_concatenate_to_the_full_result() {
    let engine = engine(EngineConfig::default());
    let full = engine
        .execute(&QueryRequest::new("FOR i IN items SORT i.bucket DESC RETURN i.n"))
        .expect("full");
    let pages = drain(
        &engine,
        QueryRequest::new("FOR i IN items SORT i.bucket DESC LIMIT 5 RETURN i.n").paged(),
    );
    assert_eq!(pages.len(), 5);
    assert!(pages.iter().all(|p| p.count <= 5));
    assert_eq!(flatten(&pages), full.rows);
}

#[test]
fn offset_applies_to_the_first_page_only() {
    let engine = engine(EngineConfig::default());
    let pages = drain(
        &engine,
        QueryRequest::new("FOR i IN items SORT i.n LIMIT 20, 2 RETURN i.n").paged(),
    );
    let rows = flatten(&pages);
    assert_eq!(rows, vec![Value::Int(20), Value::Int(21), Value::Int(22)]);
}

#[test]
fn default_page_size_without_limit() {
    let mut config = EngineConfig::default();
    config.execution.default_page_size = 10;
    let engine = engine(config);
    let pages = drain(&engine, QueryRequest::new("FOR i IN items RETURN i._key").paged());
    let sizes: Vec<usize> = pages.iter().map(|p| p.count).collect();
    assert_eq!(sizes, vec![10, 10, 3]);

    let unpaged = engine
        .execute(&QueryRequest::new("FOR i IN items RETURN i._key"))
        .expect("unpaged");
    assert_eq!(unpaged.count, 23);
    assert!(unpaged.next_cursor.is_none());
}

#[test]
fn ranked_results_page_by_position() {
    let engine = engine(EngineConfig::default());
    let query = r#"FOR i IN items FILTER FULLTEXT(i.text, "apple", 50) RETURN i._key"#;
    let full = engine.execute(&QueryRequest::new(query)).expect("full");
    assert_eq!(full.count, 23);
    let paged = r#"FOR i IN items FILTER FULLTEXT(i.text, "apple", 50) LIMIT 7 RETURN i._key"#;
    let pages = drain(&engine, QueryRequest::new(paged).paged());
    assert_eq!(flatten(&pages), full.rows);
}

#[test]
fn traversal_results_page_by_position() {
    let mut backend = MemoryBackend::new().with_graph("tree", None);
    for (from, to) in [("r", "a"), ("r", "b"), ("a", "c"), ("a", "d"), ("b", "e"), ("e", "f")] {
        backend = backend.with_edge("tree", from, to, None, Value::Null);
    }
    let engine = QueryEngine::with_backend(backend, EngineConfig::default());
    let pages = drain(
        &engine,
        QueryRequest::new(r#"FOR v IN 1..3 OUTBOUND "r" GRAPH "tree" LIMIT 4 RETURN v._key"#).paged(),
    );
    let keys: Vec<Value> = ["a", "b", "c", "d", "e", "f"].into_iter().map(Value::from).collect();
    assert_eq!(flatten(&pages), keys);
}

#[test]
fn failed_page_does_not_consume_the_cursor() {
    let query = "FOR i IN items SORT i.bucket LIMIT 6 RETURN i.n";
    let healthy = engine(EngineConfig::default());
    let first = healthy.execute(&QueryRequest::new(query).paged()).expect("first page");
    let token = first.next_cursor.expect("more pages");

    let failing = QueryEngine::with_backend(items().fail_after(0), EngineConfig::default());
    assert!(failing
        .execute(&QueryRequest::new(query).with_cursor(token.clone()))
        .is_err());

    let retry = healthy
        .execute(&QueryRequest::new(query).with_cursor(token.clone()))
        .expect("retry");
    let again = healthy
        .execute(&QueryRequest::new(query).with_cursor(token))
        .expect("retry again");
    assert_eq!(retry.rows, again.rows);
    assert_eq!(retry.count, 6);
    assert!(retry.rows.iter().all(|row| !first.rows.contains(row)));
}

#[test]
fn tampered_cursor_is_rejected() {
    let engine = engine(EngineConfig::default());
    let err = engine
        .execute(&QueryRequest::new("FOR i IN items RETURN i").with_cursor("not-a-cursor"))
        .expect_err("invalid token");
    assert_eq!(err.code(), "INVALID_CURSOR");
}

#[test]
fn join_pages_resume_after_the_last_pair() {
    let mut backend = items().with_collection("notes");
    for j in 0..30_i64 {
        backend = backend.with_document(
            "notes",
            format!("n{j:02}"),
            json!({"item": format!("k{:02}", j % 23)}).into(),
        );
    }
    let engine = QueryEngine::with_backend(backend, EngineConfig::default());
    let full = engine
        .execute(&QueryRequest::new(
            "FOR i IN items FOR n IN notes FILTER n.item == i._key RETURN [i._key, n._key]",
        ))
        .expect("full");
    assert_eq!(full.count, 30);

    let pages = drain(
        &engine,
        QueryRequest::new("FOR i IN items FOR n IN notes FILTER n.item == i._key LIMIT 4 RETURN [i._key, n._key]")
            .paged(),
    );
    assert_eq!(pages.len(), 8);
    assert_eq!(flatten(&pages), full.rows);
}

#[test]
fn disjunction_pages_cover_the_union_once() {
    let engine = engine(EngineConfig::default());
    let filter = "FILTER i.bucket == 1 OR i.bucket == 2 OR i.n > 18";
    let full = engine
        .execute(&QueryRequest::new(format!("FOR i IN items {filter} RETURN i.n")).allow_full_scan())
        .expect("full");
    assert_eq!(full.count, 14);

    let pages = drain(
        &engine,
        QueryRequest::new(format!("FOR i IN items {filter} LIMIT 3 RETURN i.n"))
            .allow_full_scan()
            .paged(),
    );
    assert_eq!(flatten(&pages), full.rows);
}

#[test]
fn oversized_offset_cursor_fails_cleanly() {
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine as _;
    use penumbra::query::cursor::query_fingerprint;

    let mut backend = MemoryBackend::new().with_graph("tree", None);
    for leaf in ["a", "b", "c"] {
        backend = backend.with_edge("tree", "r", leaf, None, Value::Null);
    }
    let engine = QueryEngine::with_backend(backend, EngineConfig::default());
    let query = r#"FOR v IN 1..1 OUTBOUND "r" GRAPH "tree" LIMIT 2 RETURN v._key"#;
    let forged = |rows: u64| {
        let body = json!({
            "v": 1,
            "q": format!("{:016x}", query_fingerprint(query)),
            "a": {"offset": {"rows": rows}},
        });
        URL_SAFE_NO_PAD.encode(body.to_string())
    };

    let err = engine
        .execute(&QueryRequest::new(query).with_cursor(forged(u64::MAX)))
        .expect_err("offset out of range");
    assert_eq!(err.code(), "INVALID_CURSOR");

    let past_the_end = engine
        .execute(&QueryRequest::new(query).with_cursor(forged(1 << 40)))
        .expect("empty page");
    assert_eq!(past_the_end.count, 0);
    assert!(past_the_end.next_cursor.is_none());
}
