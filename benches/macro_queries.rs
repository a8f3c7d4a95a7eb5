//! Macro benchmark that runs representative query mixes over synthetic data.
#![forbid(unsafe_code)]
#![allow(missing_docs)]

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use penumbra::config::EngineConfig;
use penumbra::query::parser::parse;
use penumbra::storage::{IndexKind, MemoryBackend};
use penumbra::{QueryEngine, QueryRequest, Value};
use serde_json::json;

const USER_COUNT: usize = 20_000;
const FANOUT: usize = 4;

const CITIES: [&str; 5] = ["Berlin", "Munich", "Paris", "Lima", "Oslo"];

const MIX: [&str; 4] = [
    r#"FOR u IN users FILTER u.age > 30 AND u.city == "Berlin" SORT u.created_at DESC LIMIT 20 RETURN u.name"#,
    r#"FOR u IN users FILTER u.city == "Paris" OR u.age < 20 LIMIT 50 RETURN u._key"#,
    r#"FOR v IN 1..3 OUTBOUND "u0" GRAPH "social" FILTER v.age > 60 LIMIT 25 RETURN v._key"#,
    r#"FOR v IN OUTBOUND SHORTEST_PATH "u0" TO "u9999" GRAPH "social" RETURN v._key"#,
];

/// Deterministic synthetic social graph.
fn dataset(users: usize) -> MemoryBackend {
    let mut backend = MemoryBackend::new().with_collection("users");
    for i in 0..users {
        let doc = json!({
            "name": format!("user{i}"),
            "age": 15 + (i * 7) % 60,
            "city": CITIES[i % CITIES.len()],
            "created_at": (i * 7919) % 100_003,
        });
        backend = backend.with_document("users", format!("u{i}"), doc.into());
    }
    backend = backend
        .with_index("users", "age", IndexKind::Ordered)
        .with_index("users", "city", IndexKind::Hash)
        .with_index("users", "created_at", IndexKind::Ordered)
        .with_graph("social", Some("users"));
    for i in 0..users {
        for step in 1..=FANOUT {
            let to = (i * 31 + step * 977) % users;
            backend = backend.with_edge(
                "social",
                &format!("u{i}"),
                &format!("u{to}"),
                Some("follows"),
                Value::Null,
            );
        }
    }
    backend
}

fn macro_queries(c: &mut Criterion) {
    let engine = QueryEngine::with_backend(dataset(USER_COUNT), EngineConfig::default());

    let mut group = c.benchmark_group("macro/query_mix");
    group.sample_size(20);
    group.throughput(Throughput::Elements(MIX.len() as u64));
    group.bench_function("synthetic_mix", |b| {
        b.iter(|| {
            for query in MIX {
                let response = engine
                    .execute(&QueryRequest::new(query))
                    .expect("query mix");
                black_box(response.count);
            }
        })
    });
    group.finish();

    let mut group = c.benchmark_group("macro/stages");
    group.bench_function("parse", |b| b.iter(|| black_box(parse(MIX[0]).expect("parse"))));
    group.bench_function("explain", |b| {
        b.iter(|| black_box(engine.explain(MIX[0], false).expect("explain")))
    });
    group.bench_function("paged_scan", |b| {
        b.iter(|| {
            let response = engine
                .execute(&QueryRequest::new("FOR u IN users SORT u.age LIMIT 100 RETURN u._key").paged())
                .expect("page");
            black_box(response.next_cursor)
        })
    });
    group.finish();
}

criterion_group!(benches, macro_queries);
criterion_main!(benches);
