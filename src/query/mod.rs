#![forbid(unsafe_code)]

//! Query language front end, optimizer and executor.
//!
//! A query flows through [`parser`] (text to [`ast`]), [`analyze`] (names,
//! scopes and the DNF filter in [`logical`]), [`planner`] (access paths and
//! join order in [`physical`]) and finally [`executor`]. [`engine`] wires the
//! stages together behind one request/response call.

/// Parsed query tree.
pub mod ast;

/// Name resolution, LET handling and predicate translation into DNF.
pub mod analyze;

/// Cancellation tokens and deadlines.
pub mod cancel;

/// Opaque pagination tokens bound to the query text.
pub mod cursor;

/// Request/response entry point.
pub mod engine;

/// Syntax, semantic and runtime errors.
pub mod errors;

/// Expression evaluation over row bindings.
pub mod eval;

/// Plan interpreter.
///
/// Produces rows per plan shape, then applies LET, COLLECT, SORT, paging
/// and projection.
pub mod executor;

/// Scalar functions, aggregates and path quantifiers.
pub mod functions;

/// Rank fusion for hybrid retrieval.
pub mod fusion;

/// Tokenizer.
pub mod lexer;

/// Translated query: sources, classified predicates and clauses.
pub mod logical;

/// Names of collections and graphs known to the translator.
pub mod metadata;

/// Recursive-descent parser.
pub mod parser;

/// Physical plan and explain tree.
pub mod physical;

/// Cost-based access path and join selection.
pub mod planner;

/// Execution metrics and opt-in stage timers.
pub mod profile;

/// Breadth-first traversal and weighted shortest path.
pub mod traversal;

/// Dynamic document values.
pub mod value;

pub use engine::{Collaborators, QueryEngine, QueryRequest, QueryResponse};
pub use errors::{QueryError, RuntimeError, SemanticError, SyntaxError};
pub use value::Value;
