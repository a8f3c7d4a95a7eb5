#![forbid(unsafe_code)]
#![allow(missing_docs)]

use std::fmt;

use serde::Serialize;
use thiserror::Error;

/// Parse failure with the position of the offending token.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{message} (line {line}, column {column})")]
pub struct SyntaxError {
    /// Human readable description.
    pub message: String,
    /// 1-based line.
    pub line: usize,
    /// 1-based column.
    pub column: usize,
}

impl SyntaxError {
    pub fn new(message: impl Into<String>, line: usize, column: usize) -> Self {
        Self {
            message: message.into(),
            line,
            column,
        }
    }
}

fn did_you_mean(suggestion: &Option<String>) -> String {
    match suggestion {
        Some(name) => format!("; did you mean '{name}'?"),
        None => String::new(),
    }
}

/// Errors detected while translating or planning a well-formed query.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SemanticError {
    /// Referenced collection is unknown to storage.
    #[error("unknown collection '{name}'{}", did_you_mean(.suggestion))]
    UnknownCollection {
        name: String,
        suggestion: Option<String>,
    },
    /// Referenced graph is unknown to the graph index.
    #[error("unknown graph '{name}'{}", did_you_mean(.suggestion))]
    UnknownGraph {
        name: String,
        suggestion: Option<String>,
    },
    /// Function name is not registered.
    #[error("unknown function '{name}'{}", did_you_mean(.suggestion))]
    UnknownFunction {
        name: String,
        suggestion: Option<String>,
    },
    /// Variable read before any clause bound it.
    #[error("unknown variable '{name}'{}", did_you_mean(.suggestion))]
    UnknownVariable {
        name: String,
        suggestion: Option<String>,
    },
    /// Variable bound twice.
    #[error("variable '{name}' is already declared")]
    DuplicateVariable { name: String },
    /// Wrong number of function arguments.
    #[error("function {function} expects {expected} argument(s), got {found}")]
    Arity {
        function: String,
        expected: String,
        found: usize,
    },
    /// Argument has the wrong shape or type.
    #[error("invalid argument for {function}: {message}")]
    InvalidArgument { function: String, message: String },
    /// Predicate needs a collection sweep and the caller did not allow it.
    #[error("index required: no index on {collection}.{column} and full scans are not allowed")]
    IndexRequired { collection: String, column: String },
    /// Shortest path weight is negative.
    #[error("negative edge weight {weight} is not supported by shortest path")]
    NegativeWeight { weight: String },
    /// Traversal depth bounds are invalid.
    #[error("invalid traversal depth {min}..{max} (maximum allowed depth is {limit})")]
    InvalidDepth { min: u32, max: u32, limit: u32 },
    /// Cursor token could not be decoded or belongs to another query.
    #[error("invalid cursor: {reason}")]
    InvalidCursor { reason: String },
    /// Construct is understood but not supported in this position.
    #[error("unsupported: {feature}")]
    Unsupported { feature: String },
}

impl SemanticError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            SemanticError::UnknownCollection { .. } => "UNKNOWN_COLLECTION",
            SemanticError::UnknownGraph { .. } => "UNKNOWN_GRAPH",
            SemanticError::UnknownFunction { .. } => "UNKNOWN_FUNCTION",
            SemanticError::UnknownVariable { .. } => "UNKNOWN_VARIABLE",
            SemanticError::DuplicateVariable { .. } => "DUPLICATE_VARIABLE",
            SemanticError::Arity { .. } => "ARITY",
            SemanticError::InvalidArgument { .. } => "INVALID_ARGUMENT",
            SemanticError::IndexRequired { .. } => "INDEX_REQUIRED",
            SemanticError::NegativeWeight { .. } => "NEGATIVE_WEIGHT",
            SemanticError::InvalidDepth { .. } => "INVALID_DEPTH",
            SemanticError::InvalidCursor { .. } => "INVALID_CURSOR",
            SemanticError::Unsupported { .. } => "UNSUPPORTED",
        }
    }
}

fn in_context(context: &Option<String>) -> String {
    match context {
        Some(ctx) => format!(" (while processing {ctx})"),
        None => String::new(),
    }
}

/// Failures raised while executing a plan.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RuntimeError {
    /// Division or modulo by zero.
    #[error("division by zero{}", in_context(.context))]
    DivisionByZero { context: Option<String> },
    /// Operand has the wrong type for the operation.
    #[error("type mismatch in {operation}: expected {expected}, found {found}{}", in_context(.context))]
    TypeMismatch {
        operation: String,
        expected: &'static str,
        found: &'static str,
        context: Option<String>,
    },
    /// A storage or index collaborator failed.
    #[error("{collaborator} unavailable: {message}{}", in_context(.context))]
    Collaborator {
        collaborator: &'static str,
        message: String,
        context: Option<String>,
    },
    /// A stored edge weight is negative.
    #[error("negative edge weight {weight} on edge '{edge}'")]
    NegativeWeight { edge: String, weight: f64 },
    /// Deadline passed.
    #[error("query exceeded its deadline after {elapsed_ms} ms")]
    Timeout { elapsed_ms: u64 },
    /// Cancelled by the caller.
    #[error("query cancelled")]
    Cancelled,
    /// Operation is not valid in the evaluation context.
    #[error("invalid operation: {message}{}", in_context(.context))]
    InvalidOperation {
        message: String,
        context: Option<String>,
    },
}

impl RuntimeError {
    pub fn type_mismatch(operation: impl Into<String>, expected: &'static str, found: &'static str) -> Self {
        RuntimeError::TypeMismatch {
            operation: operation.into(),
            expected,
            found,
            context: None,
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        RuntimeError::InvalidOperation {
            message: message.into(),
            context: None,
        }
    }

    /// Wraps a collaborator failure, naming the entity being fetched.
    pub fn collaborator(
        collaborator: &'static str,
        source: &crate::storage::StorageError,
        entity: impl Into<String>,
    ) -> Self {
        RuntimeError::Collaborator {
            collaborator,
            message: source.to_string(),
            context: Some(entity.into()),
        }
    }

    /// Attaches the row or entity being processed, keeping an existing one.
    pub fn with_context(mut self, ctx: impl FnOnce() -> String) -> Self {
        match &mut self {
            RuntimeError::DivisionByZero { context }
            | RuntimeError::TypeMismatch { context, .. }
            | RuntimeError::Collaborator { context, .. }
            | RuntimeError::InvalidOperation { context, .. } => {
                if context.is_none() {
                    *context = Some(ctx());
                }
            }
            RuntimeError::NegativeWeight { .. }
            | RuntimeError::Timeout { .. }
            | RuntimeError::Cancelled => {}
        }
        self
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            RuntimeError::DivisionByZero { .. } => "DIVISION_BY_ZERO",
            RuntimeError::TypeMismatch { .. } => "TYPE_MISMATCH",
            RuntimeError::Collaborator { .. } => "COLLABORATOR_UNAVAILABLE",
            RuntimeError::NegativeWeight { .. } => "NEGATIVE_WEIGHT",
            RuntimeError::Timeout { .. } => "TIMEOUT",
            RuntimeError::Cancelled => "CANCELLED",
            RuntimeError::InvalidOperation { .. } => "INVALID_OPERATION",
        }
    }
}

/// Error category reported to callers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Rejected by the lexer or parser.
    Syntax,
    /// Rejected by analysis before execution.
    Semantic,
    /// Failed while executing.
    Runtime,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Syntax => f.write_str("syntax"),
            ErrorKind::Semantic => f.write_str("semantic"),
            ErrorKind::Runtime => f.write_str("runtime"),
        }
    }
}

/// Any error a query can fail with.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum QueryError {
    /// See [`SyntaxError`].
    #[error("syntax error: {0}")]
    Syntax(#[from] SyntaxError),
    /// See [`SemanticError`].
    #[error("semantic error: {0}")]
    Semantic(#[from] SemanticError),
    /// See [`RuntimeError`].
    #[error("runtime error: {0}")]
    Runtime(#[from] RuntimeError),
}

impl QueryError {
    /// Category of the failure.
    pub fn kind(&self) -> ErrorKind {
        match self {
            QueryError::Syntax(_) => ErrorKind::Syntax,
            QueryError::Semantic(_) => ErrorKind::Semantic,
            QueryError::Runtime(_) => ErrorKind::Runtime,
        }
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            QueryError::Syntax(_) => "SYNTAX_ERROR",
            QueryError::Semantic(err) => err.code(),
            QueryError::Runtime(err) => err.code(),
        }
    }

    /// Structured body for callers.
    pub fn to_body(&self) -> ErrorBody {
        let (message, line, column) = match self {
            QueryError::Syntax(err) => (err.message.clone(), Some(err.line), Some(err.column)),
            QueryError::Semantic(err) => (err.to_string(), None, None),
            QueryError::Runtime(err) => (err.to_string(), None, None),
        };
        ErrorBody {
            kind: self.kind(),
            code: self.code(),
            message,
            line,
            column,
        }
    }
}

/// Serialized error returned to callers.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ErrorBody {
    /// Category.
    pub kind: ErrorKind,
    /// Stable code such as `INVALID_CURSOR`.
    pub code: &'static str,
    /// Human-readable message.
    pub message: String,
    /// Source line, for syntax errors.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<usize>,
    /// Source column, for syntax errors.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub column: Option<usize>,
}

/// Display adapter that prefixes errors with their code.
pub struct QueryErrorWithCode<'a>(pub &'a QueryError);

impl fmt::Display for QueryErrorWithCode<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.0.code(), self.0)
    }
}

const SUGGESTION_MAX_DISTANCE: usize = 2;

/// Closest candidate within a small edit distance, for "did you mean" hints.
pub fn closest_match<'a, I>(needle: &str, candidates: I) -> Option<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let needle_lower = needle.to_lowercase();
    let needle_chars: Vec<char> = needle_lower.chars().collect();
    let mut best: Option<(usize, &str)> = None;
    for candidate in candidates {
        if candidate == needle {
            continue;
        }
        let dist = levenshtein_with_max(
            &candidate.to_lowercase(),
            &needle_chars,
            SUGGESTION_MAX_DISTANCE,
        );
        if dist > SUGGESTION_MAX_DISTANCE {
            continue;
        }
        match best {
            Some((best_dist, best_name)) if (best_dist, best_name) <= (dist, candidate) => {}
            _ => best = Some((dist, candidate)),
        }
    }
    best.map(|(_, name)| name.to_owned())
}

fn levenshtein_with_max(value: &str, needle_chars: &[char], max_dist: usize) -> usize {
    let n = needle_chars.len();
    if n == 0 {
        return value.chars().count();
    }
    let mut prev: Vec<usize> = (0..=n).collect();
    let mut curr: Vec<usize> = vec![0; n + 1];
    for (i, c) in value.chars().enumerate() {
        curr[0] = i + 1;
        let mut row_min = curr[0];
        for j in 1..=n {
            let cost = usize::from(c != needle_chars[j - 1]);
            let d = (prev[j] + 1).min(curr[j - 1] + 1).min(prev[j - 1] + cost);
            curr[j] = d;
            row_min = row_min.min(d);
        }
        if row_min > max_dist {
            return max_dist + 1;
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[n]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suggests_near_miss_names() {
        let names = ["users", "orders", "products"];
        assert_eq!(closest_match("usres", names), Some("users".into()));
        assert_eq!(closest_match("ordr", names), Some("orders".into()));
        assert_eq!(closest_match("zzzzzz", names), None);
    }

    #[test]
    fn unknown_collection_message_includes_hint() {
        let err = SemanticError::UnknownCollection {
            name: "usres".into(),
            suggestion: Some("users".into()),
        };
        assert_eq!(
            err.to_string(),
            "unknown collection 'usres'; did you mean 'users'?"
        );
    }

    #[test]
    fn context_is_attached_once() {
        let err = RuntimeError::DivisionByZero { context: None }
            .with_context(|| "users/u1".into())
            .with_context(|| "users/u2".into());
        assert_eq!(err.to_string(), "division by zero (while processing users/u1)");
    }

    #[test]
    fn syntax_errors_keep_location_in_body() {
        let err = QueryError::from(SyntaxError::new("unexpected token 'FILTR'", 2, 5));
        let body = err.to_body();
        assert_eq!(body.kind, ErrorKind::Syntax);
        assert_eq!(body.line, Some(2));
        assert_eq!(body.column, Some(5));
        assert_eq!(
            QueryErrorWithCode(&err).to_string(),
            "[SYNTAX_ERROR] syntax error: unexpected token 'FILTR' (line 2, column 5)"
        );
    }
}
