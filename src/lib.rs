//! Penumbra: a multi-model query engine.
//!
//! One declarative language covers document filtering, joins, graph
//! traversal, weighted shortest paths and hybrid full-text/vector retrieval.
//! Queries run against pluggable collaborators described in [`storage`];
//! [`storage::MemoryBackend`] implements all of them in memory.

#![warn(missing_docs)]

pub mod config;
pub mod query;
pub mod storage;

pub use config::EngineConfig;
pub use query::{QueryEngine, QueryError, QueryRequest, QueryResponse, Value};
