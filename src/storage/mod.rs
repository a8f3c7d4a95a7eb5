//! Collaborator interfaces consumed by the query engine.
//!
//! The engine never owns data: documents live behind [`Storage`], adjacency
//! behind [`GraphIndex`], and ranked retrieval behind [`VectorIndex`] and
//! [`FulltextIndex`]. [`memory::MemoryBackend`] implements all four in memory.

use std::ops::Bound;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::query::ast::Direction;
use crate::query::value::Value;

/// Dataset fixtures for the CLI and tests.
pub mod fixture;
/// In-memory collaborators.
pub mod memory;

pub use memory::MemoryBackend;

/// Errors surfaced by collaborators.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// Backend cannot serve the request right now.
    #[error("{0}")]
    Unavailable(String),
    /// Requested collection, graph or index does not exist.
    #[error("{what} '{name}' not found")]
    NotFound {
        /// Kind of object.
        what: &'static str,
        /// Its name.
        name: String,
    },
    /// Request is not supported by this backend.
    #[error("unsupported request: {0}")]
    Unsupported(String),
}

/// Convenience alias for collaborator results.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Document key paired with the document.
pub type Record = (String, Value);

/// Capability of a secondary index on one column.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexKind {
    /// Point lookups and set membership only.
    Hash,
    /// Point lookups, membership, ranges and ordered iteration.
    Ordered,
}

impl IndexKind {
    /// Whether the index answers range predicates.
    pub fn supports_range(self) -> bool {
        matches!(self, IndexKind::Ordered)
    }
}

/// Predicate pushed down to a storage scan.
#[derive(Clone, Debug, PartialEq)]
pub enum ScanPredicate {
    /// Every document.
    All,
    /// `column == value`.
    Eq {
        /// Dotted column path.
        column: String,
        /// Value to match.
        value: Value,
    },
    /// `lo <= column <= hi` with per-bound inclusivity.
    Range {
        /// Dotted column path.
        column: String,
        /// Lower bound.
        lo: Bound<Value>,
        /// Upper bound.
        hi: Bound<Value>,
    },
    /// `column IN values`.
    In {
        /// Dotted column path.
        column: String,
        /// Accepted values.
        values: Vec<Value>,
    },
}

impl ScanPredicate {
    /// Column the predicate restricts, if any.
    pub fn column(&self) -> Option<&str> {
        match self {
            ScanPredicate::All => None,
            ScanPredicate::Eq { column, .. }
            | ScanPredicate::Range { column, .. }
            | ScanPredicate::In { column, .. } => Some(column),
        }
    }

    /// Whether `value` (the column's value) satisfies the predicate.
    pub fn matches_value(&self, value: &Value) -> bool {
        match self {
            ScanPredicate::All => true,
            ScanPredicate::Eq { value: want, .. } => value == want,
            ScanPredicate::Range { lo, hi, .. } => {
                let above = match lo {
                    Bound::Included(lo) => value >= lo,
                    Bound::Excluded(lo) => value > lo,
                    Bound::Unbounded => true,
                };
                let below = match hi {
                    Bound::Included(hi) => value <= hi,
                    Bound::Excluded(hi) => value < hi,
                    Bound::Unbounded => true,
                };
                above && below
            }
            ScanPredicate::In { values, .. } => values.iter().any(|v| v == value),
        }
    }

    /// Whether a whole document satisfies the predicate.
    pub fn matches(&self, doc: &Value) -> bool {
        match self.column() {
            None => true,
            Some(column) => {
                let path: Vec<&str> = column.split('.').collect();
                self.matches_value(&doc.get_path(&path))
            }
        }
    }
}

/// Cardinality estimate; `capped` means the sample limit was hit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct Estimate {
    /// Counted rows, at most the sample cap.
    pub count: u64,
    /// True when counting stopped at the cap.
    pub capped: bool,
}

impl Estimate {
    /// Exact estimate.
    pub fn exact(count: u64) -> Self {
        Self {
            count,
            capped: false,
        }
    }

    /// Value used for ordering: capped estimates are worst case.
    pub fn ordering_cost(&self) -> u64 {
        if self.capped {
            u64::MAX
        } else {
            self.count
        }
    }
}

/// Document store.
pub trait Storage: Send + Sync {
    /// Names of all collections.
    fn collections(&self) -> Vec<String>;

    /// Point lookup by document key.
    fn get(&self, collection: &str, key: &str) -> StorageResult<Option<Value>>;

    /// Documents matching `predicate`, in ascending key order.
    ///
    /// Predicates other than [`ScanPredicate::All`] require an index on their
    /// column.
    fn scan(&self, collection: &str, predicate: &ScanPredicate) -> StorageResult<Vec<Record>>;

    /// All documents ordered by `column` through its ordered index; ties in
    /// key order.
    fn scan_ordered(
        &self,
        collection: &str,
        column: &str,
        descending: bool,
    ) -> StorageResult<Vec<Record>>;

    /// Number of documents matching `predicate`, counting at most `max_sample`.
    fn estimate_cardinality(
        &self,
        collection: &str,
        predicate: &ScanPredicate,
        max_sample: u64,
    ) -> StorageResult<Estimate>;

    /// Secondary index on `column`, if one exists.
    fn index_kind(&self, collection: &str, column: &str) -> Option<IndexKind>;
}

/// Adjacency entry returned by [`GraphIndex::adjacency`].
#[derive(Clone, Debug, PartialEq)]
pub struct Neighbor {
    /// Vertex on the other end of the edge.
    pub vertex: String,
    /// Edge key.
    pub edge_key: String,
    /// Edge document (`_key`, `_from`, `_to`, `_type`, attributes).
    pub edge: Value,
}

/// Graph adjacency.
pub trait GraphIndex: Send + Sync {
    /// Names of all graphs.
    fn graphs(&self) -> Vec<String>;

    /// Edges incident to `vertex` in `direction`, optionally filtered by type,
    /// in a stable order.
    fn adjacency(
        &self,
        graph: &str,
        vertex: &str,
        direction: Direction,
        edge_type: Option<&str>,
    ) -> StorageResult<Vec<Neighbor>>;

    /// Vertex document, if the vertex is stored.
    fn vertex(&self, graph: &str, vertex: &str) -> StorageResult<Option<Value>>;
}

/// Distance metric for nearest-neighbor search.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    /// `1 - cos(a, b)`.
    #[default]
    Cosine,
    /// Euclidean distance.
    Euclidean,
    /// Negated dot product.
    Dot,
}

impl Metric {
    /// Parses a metric name.
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "cosine" => Some(Metric::Cosine),
            "euclidean" | "l2" => Some(Metric::Euclidean),
            "dot" | "inner_product" => Some(Metric::Dot),
            _ => None,
        }
    }

    /// Name used in explain output.
    pub fn as_str(self) -> &'static str {
        match self {
            Metric::Cosine => "cosine",
            Metric::Euclidean => "euclidean",
            Metric::Dot => "dot",
        }
    }

    /// Distance between two vectors; smaller is closer.
    pub fn distance(self, a: &[f64], b: &[f64]) -> f64 {
        match self {
            Metric::Cosine => {
                let dot: f64 = a.iter().zip(b).map(|(x, y)| x * y).sum();
                let na: f64 = a.iter().map(|x| x * x).sum::<f64>().sqrt();
                let nb: f64 = b.iter().map(|x| x * x).sum::<f64>().sqrt();
                if na == 0.0 || nb == 0.0 {
                    1.0
                } else {
                    1.0 - dot / (na * nb)
                }
            }
            Metric::Euclidean => a
                .iter()
                .zip(b)
                .map(|(x, y)| (x - y) * (x - y))
                .sum::<f64>()
                .sqrt(),
            Metric::Dot => -a.iter().zip(b).map(|(x, y)| x * y).sum::<f64>(),
        }
    }
}

/// Vector search hit, nearest first.
#[derive(Clone, Debug, PartialEq)]
pub struct VectorHit {
    /// Document key.
    pub key: String,
    /// Distance under the requested metric.
    pub distance: f64,
}

/// Approximate nearest-neighbor index.
pub trait VectorIndex: Send + Sync {
    /// Whether `collection.column` is vector-indexed.
    fn has_index(&self, collection: &str, column: &str) -> bool;

    /// The `k` nearest documents, nearest first.
    fn search(
        &self,
        collection: &str,
        column: &str,
        vector: &[f64],
        k: usize,
        metric: Metric,
    ) -> StorageResult<Vec<VectorHit>>;
}

/// Full-text search hit, most relevant first.
#[derive(Clone, Debug, PartialEq)]
pub struct TextHit {
    /// Document key.
    pub key: String,
    /// Relevance score (higher is better).
    pub score: f64,
}

/// Full-text index.
pub trait FulltextIndex: Send + Sync {
    /// Whether `collection.column` is full-text indexed.
    fn has_index(&self, collection: &str, column: &str) -> bool;

    /// Up to `limit` matching documents, most relevant first.
    fn search(
        &self,
        collection: &str,
        column: &str,
        query: &str,
        limit: usize,
    ) -> StorageResult<Vec<TextHit>>;
}
