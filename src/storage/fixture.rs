//! JSON dataset descriptions loaded into a [`MemoryBackend`].
//!
//! ```json
//! {
//!   "collections": { "users": [{ "_key": "u1", "age": 31 }] },
//!   "indexes": [{ "collection": "users", "column": "age", "kind": "ordered" }],
//!   "graphs": {
//!     "social": {
//!       "vertex_collection": "users",
//!       "edges": [{ "_from": "u1", "_to": "u2", "_type": "knows", "weight": 2 }]
//!     }
//!   },
//!   "vector_indexes": [{ "collection": "docs", "column": "embedding" }],
//!   "fulltext_indexes": [{ "collection": "docs", "column": "body" }]
//! }
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::query::value::Value;
use crate::storage::{IndexKind, MemoryBackend};

/// Errors raised while loading a fixture.
#[derive(Debug, Error)]
pub enum FixtureError {
    /// File could not be read.
    #[error("failed to read fixture {path}: {source}")]
    Read {
        /// Fixture path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// File is not a valid fixture document.
    #[error("invalid fixture: {0}")]
    Parse(#[from] serde_json::Error),
    /// A document has no string `_key`.
    #[error("document #{index} in collection '{collection}' has no string _key")]
    MissingKey {
        /// Collection name.
        collection: String,
        /// Position within the collection array.
        index: usize,
    },
}

/// Secondary or ranked index declaration.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IndexSpec {
    /// Indexed collection.
    pub collection: String,
    /// Dotted column path.
    pub column: String,
    /// Capability; defaults to ordered.
    #[serde(default = "default_index_kind")]
    pub kind: IndexKind,
}

fn default_index_kind() -> IndexKind {
    IndexKind::Ordered
}

/// Ranked index declaration.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RankedIndexSpec {
    /// Indexed collection.
    pub collection: String,
    /// Dotted column path.
    pub column: String,
}

/// Edge document in a fixture.
#[derive(Clone, Debug, Deserialize)]
pub struct EdgeSpec {
    /// Optional edge key; generated when absent.
    #[serde(rename = "_key", default)]
    pub key: Option<String>,
    /// Source vertex.
    #[serde(rename = "_from")]
    pub from: String,
    /// Target vertex.
    #[serde(rename = "_to")]
    pub to: String,
    /// Edge type.
    #[serde(rename = "_type", default)]
    pub edge_type: Option<String>,
    /// Remaining attributes.
    #[serde(flatten)]
    pub attributes: BTreeMap<String, Value>,
}

/// Graph declaration.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GraphSpec {
    /// Collection holding the vertex documents.
    #[serde(default)]
    pub vertex_collection: Option<String>,
    /// Edges in adjacency order.
    #[serde(default)]
    pub edges: Vec<EdgeSpec>,
}

/// Complete dataset.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Fixture {
    /// Documents per collection.
    pub collections: BTreeMap<String, Vec<Value>>,
    /// Secondary indexes.
    pub indexes: Vec<IndexSpec>,
    /// Graphs by name.
    pub graphs: BTreeMap<String, GraphSpec>,
    /// Vector-indexed columns.
    pub vector_indexes: Vec<RankedIndexSpec>,
    /// Full-text indexed columns.
    pub fulltext_indexes: Vec<RankedIndexSpec>,
}

impl Fixture {
    /// Parses a fixture from JSON text.
    pub fn from_json(text: &str) -> Result<Self, FixtureError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Reads a fixture file.
    pub fn load(path: &Path) -> Result<Self, FixtureError> {
        let text = fs::read_to_string(path).map_err(|source| FixtureError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&text)
    }

    /// Builds the in-memory backend described by the fixture.
    pub fn into_backend(self) -> Result<MemoryBackend, FixtureError> {
        let mut backend = MemoryBackend::new();
        for (collection, docs) in self.collections {
            backend = backend.with_collection(collection.clone());
            for (index, doc) in docs.into_iter().enumerate() {
                let key = doc
                    .document_key()
                    .map(str::to_owned)
                    .ok_or_else(|| FixtureError::MissingKey {
                        collection: collection.clone(),
                        index,
                    })?;
                backend.insert_document(&collection, key, doc);
            }
        }
        for index in self.indexes {
            backend = backend.with_index(&index.collection, &index.column, index.kind);
        }
        for (name, graph) in self.graphs {
            backend = backend.with_graph(name.clone(), graph.vertex_collection.as_deref());
            for edge in graph.edges {
                backend.insert_edge(
                    &name,
                    edge.key,
                    &edge.from,
                    &edge.to,
                    edge.edge_type.as_deref(),
                    Value::Object(edge.attributes),
                );
            }
        }
        for spec in self.vector_indexes {
            backend = backend.with_vector_index(&spec.collection, &spec.column);
        }
        for spec in self.fulltext_indexes {
            backend = backend.with_fulltext_index(&spec.collection, &spec.column);
        }
        Ok(backend)
    }
}
