//! Query entry point.
//!
//! [`QueryEngine::execute`] runs the whole pipeline for one request: parse,
//! translate, plan, execute and page. Each request gets its own deadline,
//! metrics and cursor handling; the engine itself holds no per-query state
//! and can be shared across threads.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, debug_span};

use crate::config::EngineConfig;
use crate::query::analyze::analyze;
use crate::query::cancel::{CancelToken, Deadline};
use crate::query::cursor::{query_fingerprint, Anchor, Cursor};
use crate::query::errors::{QueryError, SemanticError};
use crate::query::executor::{ExecContext, Executor, Window};
use crate::query::metadata::Catalog;
use crate::query::parser::parse;
use crate::query::physical::{PlanDescription, QueryPlan};
use crate::query::planner::{PlanOptions, Planner};
use crate::query::profile::{profile_timer, record_profile_timer, Metrics, QueryProfileKind};
use crate::query::value::Value;
use crate::storage::{FulltextIndex, GraphIndex, MemoryBackend, Storage, VectorIndex};

/// One query request.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequest {
    /// Query text.
    #[serde(rename = "queryText")]
    pub query: String,
    /// Return the plan description and execution metrics.
    #[serde(default)]
    pub explain: bool,
    /// Page the result and return a cursor for the rest.
    #[serde(default)]
    pub use_cursor: bool,
    /// Cursor from a previous page of the same query.
    #[serde(default)]
    pub cursor: Option<String>,
    /// Permit full collection scans for predicates without an index.
    #[serde(default)]
    pub allow_full_scan: bool,
    /// Cancellation token checked while the query runs.
    #[serde(skip)]
    pub cancel: Option<CancelToken>,
}

impl QueryRequest {
    /// Request for `query` with every option off.
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Self::default()
        }
    }

    /// Requests the plan and metrics.
    pub fn explain(mut self) -> Self {
        self.explain = true;
        self
    }

    /// Requests cursor paging.
    pub fn paged(mut self) -> Self {
        self.use_cursor = true;
        self
    }

    /// Resumes from `cursor`.
    pub fn with_cursor(mut self, cursor: impl Into<String>) -> Self {
        self.cursor = Some(cursor.into());
        self
    }

    /// Permits full scans.
    pub fn allow_full_scan(mut self) -> Self {
        self.allow_full_scan = true;
        self
    }

    /// Attaches a cancellation token.
    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// Result of one request.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResponse {
    /// Projected rows of this page.
    pub rows: Vec<Value>,
    /// Number of rows in this page.
    pub count: usize,
    /// Plan description, with `explain`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<PlanDescription>,
    /// Execution metrics, with `explain`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<Metrics>,
    /// Token for the next page, when one exists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

/// The four collaborators a query runs against.
#[derive(Clone)]
pub struct Collaborators {
    /// Document store.
    pub storage: Arc<dyn Storage>,
    /// Graph adjacency.
    pub graph: Arc<dyn GraphIndex>,
    /// Nearest-neighbor index.
    pub vectors: Arc<dyn VectorIndex>,
    /// Full-text index.
    pub fulltext: Arc<dyn FulltextIndex>,
}

impl Collaborators {
    /// All four roles served by one in-memory backend.
    pub fn from_backend(backend: Arc<MemoryBackend>) -> Self {
        Self {
            storage: Arc::clone(&backend) as _,
            graph: Arc::clone(&backend) as _,
            vectors: Arc::clone(&backend) as _,
            fulltext: backend as _,
        }
    }
}

impl Catalog for Collaborators {
    fn collections(&self) -> Vec<String> {
        self.storage.collections()
    }

    fn graphs(&self) -> Vec<String> {
        self.graph.graphs()
    }
}

/// Parses, plans and executes queries.
#[derive(Clone)]
pub struct QueryEngine {
    collaborators: Collaborators,
    config: EngineConfig,
}

impl QueryEngine {
    /// Engine over `collaborators`.
    pub fn new(collaborators: Collaborators, config: EngineConfig) -> Self {
        Self {
            collaborators,
            config,
        }
    }

    /// Engine over an in-memory backend.
    pub fn with_backend(backend: MemoryBackend, config: EngineConfig) -> Self {
        Self::new(Collaborators::from_backend(Arc::new(backend)), config)
    }

    /// Active configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Plans `query` without executing it.
    pub fn explain(&self, query: &str, allow_full_scan: bool) -> Result<PlanDescription, QueryError> {
        Ok(self.prepare(query, allow_full_scan)?.describe())
    }

    fn prepare(&self, query: &str, allow_full_scan: bool) -> Result<QueryPlan, QueryError> {
        let timer = profile_timer();
        let ast = parse(query)?;
        record_profile_timer(QueryProfileKind::Parse, timer);

        let timer = profile_timer();
        let logical = analyze(&ast, &self.collaborators, &self.config)?;
        let planner = Planner::new(
            self.collaborators.storage.as_ref(),
            self.collaborators.vectors.as_ref(),
            self.collaborators.fulltext.as_ref(),
            &self.config,
        );
        let plan = planner.plan(logical, PlanOptions { allow_full_scan })?;
        record_profile_timer(QueryProfileKind::Plan, timer);
        debug!(
            mode = plan.mode.as_str(),
            plan_hash = format_args!("{:016x}", plan.plan_hash),
            early_exit = plan.early_exit,
            "planned query"
        );
        Ok(plan)
    }

    /// Runs one request.
    ///
    /// Without LIMIT and without cursors every row is returned. With cursors
    /// the page size is the LIMIT count, or the configured default page
    /// size; the LIMIT offset applies to the first page only.
    pub fn execute(&self, request: &QueryRequest) -> Result<QueryResponse, QueryError> {
        let span = debug_span!(
            "query",
            hash = format_args!("{:016x}", query_fingerprint(&request.query))
        );
        let _guard = span.enter();

        let deadline = Deadline::start(
            self.config.execution.timeout_ms.map(Duration::from_millis),
            request.cancel.clone(),
        );
        let cursor = request
            .cursor
            .as_deref()
            .map(|token| Cursor::decode(token, &request.query))
            .transpose()?;
        let plan = self.prepare(&request.query, request.allow_full_scan)?;
        if let Some(cursor) = &cursor {
            let keyed = matches!(cursor.anchor, Anchor::After { .. });
            if keyed != plan.resumes_after() {
                return Err(SemanticError::InvalidCursor {
                    reason: "cursor does not match the plan's resume position".into(),
                }
                .into());
            }
        }

        let paging = request.use_cursor || cursor.is_some();
        let limit = plan.logical.limit;
        let take = limit
            .map(|l| l.count)
            .or_else(|| paging.then_some(self.config.execution.default_page_size));
        let window = match cursor.map(|c| c.anchor) {
            None => Window {
                skip: limit.map_or(0, |l| l.offset),
                take,
                after: None,
            },
            Some(Anchor::Offset { rows }) => Window {
                skip: rows,
                take,
                after: None,
            },
            Some(Anchor::After {
                sort_values,
                tiebreak,
            }) => Window {
                skip: 0,
                take,
                after: Some((sort_values, tiebreak)),
            },
        };

        let mut ctx = ExecContext::new(&self.config, deadline, request.explain);
        let executor = Executor::new(
            self.collaborators.storage.as_ref(),
            self.collaborators.graph.as_ref(),
            self.collaborators.vectors.as_ref(),
            self.collaborators.fulltext.as_ref(),
        );
        let output = executor.run(&plan, &window, &mut ctx)?;
        let elapsed = ctx.deadline.elapsed();
        ctx.record(|m| m.elapsed_us = elapsed.as_micros().min(u64::MAX as u128) as u64);

        let next_cursor = output
            .next
            .filter(|_| paging)
            .map(|anchor| Cursor::new(&request.query, anchor).encode());
        debug!(
            rows = output.rows.len(),
            more = next_cursor.is_some(),
            elapsed_us = elapsed.as_micros() as u64,
            "query finished"
        );
        Ok(QueryResponse {
            count: output.rows.len(),
            rows: output.rows,
            plan: request.explain.then(|| plan.describe()),
            metrics: ctx.metrics,
            next_cursor,
        })
    }
}
