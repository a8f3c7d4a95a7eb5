//! In-memory implementation of every collaborator trait.
//!
//! Used by the CLI (through [`crate::storage::fixture`]) and by tests. Data is
//! held behind a `parking_lot::RwLock`; every read sees a consistent snapshot.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::RwLock;

use crate::query::ast::Direction;
use crate::query::value::Value;
use crate::storage::{
    Estimate, FulltextIndex, GraphIndex, IndexKind, Metric, Neighbor, Record, ScanPredicate,
    Storage, StorageError, StorageResult, TextHit, VectorHit, VectorIndex,
};

const FAILURES_DISABLED: usize = usize::MAX;

/// In-memory documents, secondary indexes, graphs and ranked indexes.
pub struct MemoryBackend {
    state: RwLock<State>,
    remaining_calls: AtomicUsize,
}

#[derive(Default)]
struct State {
    collections: BTreeMap<String, Collection>,
    graphs: BTreeMap<String, GraphData>,
    vector_indexes: BTreeSet<(String, String)>,
    fulltext_indexes: BTreeSet<(String, String)>,
}

#[derive(Default)]
struct Collection {
    docs: BTreeMap<String, Value>,
    indexes: BTreeMap<String, ColumnIndex>,
}

struct ColumnIndex {
    kind: IndexKind,
    entries: BTreeMap<Value, BTreeSet<String>>,
}

#[derive(Default)]
struct GraphData {
    vertex_collection: Option<String>,
    edges: Vec<Value>,
    outbound: HashMap<String, Vec<usize>>,
    inbound: HashMap<String, Vec<usize>>,
}

fn column_path(column: &str) -> Vec<&str> {
    column.split('.').collect()
}

impl Collection {
    fn index_doc(&mut self, key: &str, doc: &Value) {
        for (column, index) in self.indexes.iter_mut() {
            let value = doc.get_path(&column_path(column));
            index.entries.entry(value).or_default().insert(key.to_owned());
        }
    }

    fn unindex_doc(&mut self, key: &str, doc: &Value) {
        for (column, index) in self.indexes.iter_mut() {
            let value = doc.get_path(&column_path(column));
            if let Some(keys) = index.entries.get_mut(&value) {
                keys.remove(key);
                if keys.is_empty() {
                    index.entries.remove(&value);
                }
            }
        }
    }

    fn insert(&mut self, key: String, mut doc: Value) {
        if let Value::Object(map) = &mut doc {
            map.insert("_key".into(), Value::String(key.clone()));
        }
        if let Some(old) = self.docs.remove(&key) {
            self.unindex_doc(&key, &old);
        }
        self.index_doc(&key, &doc);
        self.docs.insert(key, doc);
    }

    fn build_index(&mut self, column: &str, kind: IndexKind) {
        let path = column_path(column);
        let mut entries: BTreeMap<Value, BTreeSet<String>> = BTreeMap::new();
        for (key, doc) in &self.docs {
            entries
                .entry(doc.get_path(&path))
                .or_default()
                .insert(key.clone());
        }
        self.indexes
            .insert(column.to_owned(), ColumnIndex { kind, entries });
    }

    /// Keys matched through the column index, in key order.
    fn index_keys(&self, predicate: &ScanPredicate) -> StorageResult<BTreeSet<String>> {
        let Some(column) = predicate.column() else {
            return Ok(self.docs.keys().cloned().collect());
        };
        let index = self.indexes.get(column).ok_or_else(|| {
            StorageError::Unsupported(format!("no index on column '{column}'"))
        })?;
        let mut keys = BTreeSet::new();
        match predicate {
            ScanPredicate::All => {}
            ScanPredicate::Eq { value, .. } => {
                if let Some(found) = index.entries.get(value) {
                    keys.extend(found.iter().cloned());
                }
            }
            ScanPredicate::In { values, .. } => {
                for value in values {
                    if let Some(found) = index.entries.get(value) {
                        keys.extend(found.iter().cloned());
                    }
                }
            }
            ScanPredicate::Range { lo, hi, .. } => {
                if !index.kind.supports_range() {
                    return Err(StorageError::Unsupported(format!(
                        "hash index on '{column}' cannot answer ranges"
                    )));
                }
                if range_is_empty(lo, hi) {
                    return Ok(keys);
                }
                for (_, found) in index.entries.range((lo.clone(), hi.clone())) {
                    keys.extend(found.iter().cloned());
                }
            }
        }
        Ok(keys)
    }
}

fn range_is_empty(lo: &std::ops::Bound<Value>, hi: &std::ops::Bound<Value>) -> bool {
    use std::ops::Bound::*;
    match (lo, hi) {
        (Included(a), Included(b)) => a > b,
        (Included(a), Excluded(b)) | (Excluded(a), Included(b)) | (Excluded(a), Excluded(b)) => {
            a >= b
        }
        _ => false,
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    /// Creates an empty backend.
    pub fn new() -> Self {
        Self {
            state: RwLock::new(State::default()),
            remaining_calls: AtomicUsize::new(FAILURES_DISABLED),
        }
    }

    /// Registers an empty collection.
    pub fn with_collection(self, name: impl Into<String>) -> Self {
        self.state
            .write()
            .collections
            .entry(name.into())
            .or_default();
        self
    }

    /// Inserts a document; `_key` is set to `key`.
    pub fn with_document(self, collection: &str, key: impl Into<String>, doc: Value) -> Self {
        self.insert_document(collection, key, doc);
        self
    }

    /// Declares a secondary index on a (dotted) column.
    pub fn with_index(self, collection: &str, column: &str, kind: IndexKind) -> Self {
        self.state
            .write()
            .collections
            .entry(collection.to_owned())
            .or_default()
            .build_index(column, kind);
        self
    }

    /// Declares a graph whose vertices live in `vertex_collection`.
    pub fn with_graph(self, name: impl Into<String>, vertex_collection: Option<&str>) -> Self {
        let mut state = self.state.write();
        let graph = state.graphs.entry(name.into()).or_default();
        graph.vertex_collection = vertex_collection.map(str::to_owned);
        drop(state);
        self
    }

    /// Adds an edge; `attributes` (an object or null) are merged into the edge document.
    pub fn with_edge(
        self,
        graph: &str,
        from: &str,
        to: &str,
        edge_type: Option<&str>,
        attributes: Value,
    ) -> Self {
        self.insert_edge(graph, None, from, to, edge_type, attributes);
        self
    }

    /// Marks `collection.column` as vector-indexed.
    pub fn with_vector_index(self, collection: &str, column: &str) -> Self {
        self.state
            .write()
            .vector_indexes
            .insert((collection.to_owned(), column.to_owned()));
        self
    }

    /// Marks `collection.column` as full-text indexed.
    pub fn with_fulltext_index(self, collection: &str, column: &str) -> Self {
        self.state
            .write()
            .fulltext_indexes
            .insert((collection.to_owned(), column.to_owned()));
        self
    }

    /// Makes every collaborator call after the next `calls` fail as unavailable.
    pub fn fail_after(self, calls: usize) -> Self {
        self.remaining_calls.store(calls, Ordering::SeqCst);
        self
    }

    /// Restores normal operation after [`MemoryBackend::fail_after`].
    pub fn recover(&self) {
        self.remaining_calls
            .store(FAILURES_DISABLED, Ordering::SeqCst);
    }

    /// Inserts or replaces a document.
    pub fn insert_document(&self, collection: &str, key: impl Into<String>, doc: Value) {
        self.state
            .write()
            .collections
            .entry(collection.to_owned())
            .or_default()
            .insert(key.into(), doc);
    }

    /// Inserts an edge, generating a key when none is given.
    pub fn insert_edge(
        &self,
        graph: &str,
        key: Option<String>,
        from: &str,
        to: &str,
        edge_type: Option<&str>,
        attributes: Value,
    ) {
        let mut state = self.state.write();
        let data = state.graphs.entry(graph.to_owned()).or_default();
        let idx = data.edges.len();
        let mut doc = match attributes {
            Value::Object(map) => map,
            _ => BTreeMap::new(),
        };
        let key = key.unwrap_or_else(|| format!("e{idx}"));
        doc.insert("_key".into(), Value::String(key));
        doc.insert("_from".into(), Value::from(from));
        doc.insert("_to".into(), Value::from(to));
        if let Some(edge_type) = edge_type {
            doc.insert("_type".into(), Value::from(edge_type));
        }
        data.edges.push(Value::Object(doc));
        data.outbound.entry(from.to_owned()).or_default().push(idx);
        data.inbound.entry(to.to_owned()).or_default().push(idx);
    }

    fn check_available(&self, operation: &str) -> StorageResult<()> {
        let result = self
            .remaining_calls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| match left {
                FAILURES_DISABLED => Some(left),
                0 => None,
                n => Some(n - 1),
            });
        match result {
            Ok(_) => Ok(()),
            Err(_) => Err(StorageError::Unavailable(format!(
                "backend unavailable during {operation}"
            ))),
        }
    }

    fn with_collection_ref<T>(
        &self,
        collection: &str,
        f: impl FnOnce(&Collection) -> StorageResult<T>,
    ) -> StorageResult<T> {
        let state = self.state.read();
        let coll = state
            .collections
            .get(collection)
            .ok_or_else(|| StorageError::NotFound {
                what: "collection",
                name: collection.to_owned(),
            })?;
        f(coll)
    }
}

impl Storage for MemoryBackend {
    fn collections(&self) -> Vec<String> {
        self.state.read().collections.keys().cloned().collect()
    }

    fn get(&self, collection: &str, key: &str) -> StorageResult<Option<Value>> {
        self.check_available("get")?;
        self.with_collection_ref(collection, |coll| Ok(coll.docs.get(key).cloned()))
    }

    fn scan(&self, collection: &str, predicate: &ScanPredicate) -> StorageResult<Vec<Record>> {
        self.check_available("scan")?;
        self.with_collection_ref(collection, |coll| {
            let keys = coll.index_keys(predicate)?;
            Ok(keys
                .into_iter()
                .filter_map(|key| coll.docs.get(&key).map(|doc| (key, doc.clone())))
                .collect())
        })
    }

    fn scan_ordered(
        &self,
        collection: &str,
        column: &str,
        descending: bool,
    ) -> StorageResult<Vec<Record>> {
        self.check_available("ordered scan")?;
        self.with_collection_ref(collection, |coll| {
            let index = coll
                .indexes
                .get(column)
                .filter(|index| index.kind.supports_range())
                .ok_or_else(|| {
                    StorageError::Unsupported(format!("no ordered index on column '{column}'"))
                })?;
            let groups: Box<dyn Iterator<Item = &BTreeSet<String>>> = if descending {
                Box::new(index.entries.values().rev())
            } else {
                Box::new(index.entries.values())
            };
            Ok(groups
                .flat_map(|keys| keys.iter())
                .filter_map(|key| coll.docs.get(key).map(|doc| (key.clone(), doc.clone())))
                .collect())
        })
    }

    fn estimate_cardinality(
        &self,
        collection: &str,
        predicate: &ScanPredicate,
        max_sample: u64,
    ) -> StorageResult<Estimate> {
        self.check_available("estimate")?;
        self.with_collection_ref(collection, |coll| {
            let count = match predicate.column() {
                None => coll.docs.len() as u64,
                Some(column) if coll.indexes.contains_key(column) => {
                    coll.index_keys(predicate)?.len() as u64
                }
                Some(_) => coll
                    .docs
                    .values()
                    .filter(|doc| predicate.matches(doc))
                    .take(max_sample as usize + 1)
                    .count() as u64,
            };
            Ok(if count > max_sample {
                Estimate {
                    count: max_sample,
                    capped: true,
                }
            } else {
                Estimate::exact(count)
            })
        })
    }

    fn index_kind(&self, collection: &str, column: &str) -> Option<IndexKind> {
        let state = self.state.read();
        state
            .collections
            .get(collection)
            .and_then(|coll| coll.indexes.get(column))
            .map(|index| index.kind)
    }
}

impl GraphIndex for MemoryBackend {
    fn graphs(&self) -> Vec<String> {
        self.state.read().graphs.keys().cloned().collect()
    }

    fn adjacency(
        &self,
        graph: &str,
        vertex: &str,
        direction: Direction,
        edge_type: Option<&str>,
    ) -> StorageResult<Vec<Neighbor>> {
        self.check_available("adjacency")?;
        let state = self.state.read();
        let data = state.graphs.get(graph).ok_or_else(|| StorageError::NotFound {
            what: "graph",
            name: graph.to_owned(),
        })?;
        let mut out = Vec::new();
        let mut push = |indices: Option<&Vec<usize>>, other_end: &str| {
            for &idx in indices.into_iter().flatten() {
                let edge = &data.edges[idx];
                if let Some(wanted) = edge_type {
                    if edge.get_path(&["_type"]).as_str() != Some(wanted) {
                        continue;
                    }
                }
                let Some(vertex) = edge.get_path(&[other_end]).as_str().map(str::to_owned) else {
                    continue;
                };
                let edge_key = edge.document_key().unwrap_or_default().to_owned();
                out.push(Neighbor {
                    vertex,
                    edge_key,
                    edge: edge.clone(),
                });
            }
        };
        if matches!(direction, Direction::Outbound | Direction::Any) {
            push(data.outbound.get(vertex), "_to");
        }
        if matches!(direction, Direction::Inbound | Direction::Any) {
            push(data.inbound.get(vertex), "_from");
        }
        Ok(out)
    }

    fn vertex(&self, graph: &str, vertex: &str) -> StorageResult<Option<Value>> {
        self.check_available("vertex lookup")?;
        let state = self.state.read();
        let data = state.graphs.get(graph).ok_or_else(|| StorageError::NotFound {
            what: "graph",
            name: graph.to_owned(),
        })?;
        Ok(data
            .vertex_collection
            .as_ref()
            .and_then(|name| state.collections.get(name))
            .and_then(|coll| coll.docs.get(vertex))
            .cloned())
    }
}

fn vector_of(value: &Value) -> Option<Vec<f64>> {
    match value {
        Value::Array(items) => items.iter().map(Value::as_f64).collect(),
        _ => None,
    }
}

impl VectorIndex for MemoryBackend {
    fn has_index(&self, collection: &str, column: &str) -> bool {
        self.state
            .read()
            .vector_indexes
            .contains(&(collection.to_owned(), column.to_owned()))
    }

    fn search(
        &self,
        collection: &str,
        column: &str,
        vector: &[f64],
        k: usize,
        metric: Metric,
    ) -> StorageResult<Vec<VectorHit>> {
        self.check_available("vector search")?;
        let path = column_path(column);
        self.with_collection_ref(collection, |coll| {
            let mut hits: Vec<VectorHit> = coll
                .docs
                .iter()
                .filter_map(|(key, doc)| {
                    let candidate = vector_of(&doc.get_path(&path))?;
                    (candidate.len() == vector.len()).then(|| VectorHit {
                        key: key.clone(),
                        distance: metric.distance(vector, &candidate),
                    })
                })
                .collect();
            hits.sort_by(|a, b| {
                a.distance
                    .total_cmp(&b.distance)
                    .then_with(|| a.key.cmp(&b.key))
            });
            hits.truncate(k);
            Ok(hits)
        })
    }
}

fn tokens(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

const BM25_K1: f64 = 1.2;
const BM25_B: f64 = 0.75;

impl FulltextIndex for MemoryBackend {
    fn has_index(&self, collection: &str, column: &str) -> bool {
        self.state
            .read()
            .fulltext_indexes
            .contains(&(collection.to_owned(), column.to_owned()))
    }

    fn search(
        &self,
        collection: &str,
        column: &str,
        query: &str,
        limit: usize,
    ) -> StorageResult<Vec<TextHit>> {
        self.check_available("full-text search")?;
        let path = column_path(column);
        let terms: BTreeSet<String> = tokens(query).into_iter().collect();
        self.with_collection_ref(collection, |coll| {
            let docs: Vec<(&String, Vec<String>)> = coll
                .docs
                .iter()
                .filter_map(|(key, doc)| match doc.get_path(&path) {
                    Value::String(text) => Some((key, tokens(&text))),
                    _ => None,
                })
                .collect();
            if docs.is_empty() || terms.is_empty() {
                return Ok(Vec::new());
            }
            let n = docs.len() as f64;
            let avg_len = docs.iter().map(|(_, t)| t.len()).sum::<usize>() as f64 / n;
            let mut doc_freq: HashMap<&str, usize> = HashMap::new();
            for (_, toks) in &docs {
                let unique: BTreeSet<&str> = toks.iter().map(String::as_str).collect();
                for term in unique {
                    if terms.contains(term) {
                        *doc_freq.entry(term).or_default() += 1;
                    }
                }
            }
            let mut hits: Vec<TextHit> = docs
                .iter()
                .filter_map(|(key, toks)| {
                    let len = toks.len() as f64;
                    let score: f64 = terms
                        .iter()
                        .map(|term| {
                            let tf = toks.iter().filter(|t| *t == term).count() as f64;
                            if tf == 0.0 {
                                return 0.0;
                            }
                            let df = doc_freq.get(term.as_str()).copied().unwrap_or(0) as f64;
                            let idf = (1.0 + (n - df + 0.5) / (df + 0.5)).ln();
                            let norm = tf + BM25_K1 * (1.0 - BM25_B + BM25_B * len / avg_len.max(1.0));
                            idf * tf * (BM25_K1 + 1.0) / norm
                        })
                        .sum();
                    (score > 0.0).then(|| TextHit {
                        key: (*key).clone(),
                        score,
                    })
                })
                .collect();
            hits.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.key.cmp(&b.key)));
            hits.truncate(limit);
            Ok(hits)
        })
    }
}
