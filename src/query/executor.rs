//! Plan interpreter.
//!
//! Every plan shape produces rows (variable bindings plus a unique tiebreak)
//! which then flow through the shared tail: LET bindings, COLLECT, SORT,
//! pagination and projection.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use rayon::prelude::*;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, trace};

use crate::config::EngineConfig;
use crate::query::ast::{Expr, SortDirection};
use crate::query::cancel::{Deadline, Ticker};
use crate::query::cursor::Anchor;
use crate::query::errors::RuntimeError;
use crate::query::eval::{Bindings, EvalTrace, Evaluator, RankedHits};
use crate::query::functions::Accumulator;
use crate::query::fusion;
use crate::query::logical::{GraphVars, LetBinding, LogicalQuery, Predicate, PredicateKind, Source};
use crate::query::physical::{
    Access, BuildSide, ConjunctionPlan, JoinStep, JoinStrategy, PlanShape, PlannedPredicate, QueryPlan,
    SortStrategy, SourcePlan,
};
use crate::query::planner::scan_predicate;
use crate::query::profile::{profile_timer, record_profile_timer, Metrics, QueryProfileKind};
use crate::query::traversal::{self, Traversal, VisitId};
use crate::query::value::Value;
use crate::storage::{
    FulltextIndex, GraphIndex, Record, ScanPredicate, Storage, TextHit, VectorHit, VectorIndex,
};

/// Per-query execution state: configuration, deadline and optional metrics.
pub struct ExecContext<'a> {
    /// Engine configuration.
    pub config: &'a EngineConfig,
    /// Deadline and cancellation.
    pub deadline: Deadline,
    /// Present only when explain output was requested.
    pub metrics: Option<Metrics>,
}

impl<'a> ExecContext<'a> {
    /// New context; metrics are collected only with `explain`.
    pub fn new(config: &'a EngineConfig, deadline: Deadline, explain: bool) -> Self {
        Self {
            config,
            deadline,
            metrics: explain.then(Metrics::default),
        }
    }

    /// Updates the metrics when they are being collected.
    pub fn record(&mut self, update: impl FnOnce(&mut Metrics)) {
        if let Some(metrics) = self.metrics.as_mut() {
            update(metrics);
        }
    }

    fn ticker(&self) -> Ticker {
        Ticker::new(self.config.execution.scan_batch_size)
    }
}

/// Portion of the ordered output to return.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Window {
    /// Rows to skip after the anchor.
    pub skip: u64,
    /// Page size; everything when `None`.
    pub take: Option<u64>,
    /// Resume strictly after these sort values and tiebreak.
    pub after: Option<(Vec<Value>, Value)>,
}

/// Projected rows of one page.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ExecOutput {
    /// RETURN values in order.
    pub rows: Vec<Value>,
    /// Where the next page starts, when more rows exist.
    pub next: Option<Anchor>,
}

#[derive(Clone, Debug)]
struct Row {
    bindings: Bindings,
    tiebreak: Value,
    score: Option<f64>,
    visit: Option<VisitId>,
    lets_bound: bool,
    sort_values: Vec<Value>,
}

impl Row {
    fn new(bindings: Bindings, tiebreak: Value) -> Self {
        Self {
            bindings,
            tiebreak,
            score: None,
            visit: None,
            lets_bound: false,
            sort_values: Vec::new(),
        }
    }
}

struct Candidate {
    key: String,
    doc: Value,
    score: Option<f64>,
}

impl From<Record> for Candidate {
    fn from((key, doc): Record) -> Self {
        Self {
            key,
            doc,
            score: None,
        }
    }
}

struct LetProgram<'p> {
    lets: &'p [LetBinding],
}

impl LetProgram<'_> {
    fn bind(&self, row: &mut Row, evaluator: &Evaluator<'_>) -> Result<(), RuntimeError> {
        if row.lets_bound {
            return Ok(());
        }
        for binding in self.lets {
            let value = evaluator.eval(&binding.expr, &row.bindings, &mut EvalTrace::default())?;
            row.bindings.bind(binding.variable.clone(), value);
        }
        row.lets_bound = true;
        Ok(())
    }
}

/// DNF filter split per conjunction into conditions evaluated before and
/// after the LET bindings they depend on.
struct FilterProgram<'p> {
    conjunctions: Vec<(Vec<&'p Expr>, Vec<&'p Expr>)>,
}

impl<'p> FilterProgram<'p> {
    fn new<I, J>(conjunctions: I, let_vars: &BTreeSet<&str>) -> Self
    where
        I: IntoIterator<Item = J>,
        J: IntoIterator<Item = &'p Expr>,
    {
        let conjunctions = conjunctions
            .into_iter()
            .map(|exprs| {
                exprs.into_iter().partition(|expr: &&Expr| {
                    !expr
                        .variables()
                        .iter()
                        .any(|v| let_vars.contains(v.as_str()))
                })
            })
            .collect();
        Self { conjunctions }
    }

    fn from_planned(
        conjunctions: &'p [Vec<PlannedPredicate>],
        let_vars: &BTreeSet<&str>,
    ) -> Self {
        Self::new(
            conjunctions
                .iter()
                .map(|c| c.iter().map(|p| &p.predicate.expr)),
            let_vars,
        )
    }

    fn is_trivial(&self) -> bool {
        self.conjunctions
            .iter()
            .any(|(pre, post)| pre.is_empty() && post.is_empty())
    }

    fn evaluate(
        &self,
        row: &mut Row,
        lets: &LetProgram<'_>,
        evaluator: &Evaluator<'_>,
        ctx: &mut ExecContext<'_>,
    ) -> Result<bool, RuntimeError> {
        if self.is_trivial() {
            return Ok(true);
        }
        let mut trace = EvalTrace::default();
        let mut accepted = false;
        for (ci, (pre, post)) in self.conjunctions.iter().enumerate() {
            let total = pre.len() + post.len();
            let mut passed = true;
            for (i, expr) in pre.iter().chain(post.iter()).enumerate() {
                if i == pre.len() {
                    lets.bind(row, evaluator)?;
                }
                if !evaluator.test(expr, &row.bindings, &mut trace)? {
                    passed = false;
                    if i + 1 < total {
                        trace.short_circuited = true;
                    }
                    break;
                }
            }
            if passed {
                accepted = true;
                if ci + 1 < self.conjunctions.len() {
                    trace.short_circuited = true;
                }
                break;
            }
        }
        ctx.record(|m| {
            m.filter_evaluations_total += 1;
            if trace.short_circuited {
                m.filter_short_circuits += 1;
            }
        });
        Ok(accepted)
    }
}

/// Collects rows while they are produced, stopping early once a streamed
/// page is complete.
struct Sink<'w> {
    rows: Vec<Row>,
    limit: Option<usize>,
    after: Option<&'w (Vec<Value>, Value)>,
    sort: &'w [crate::query::ast::SortKey],
    directions: Vec<SortDirection>,
}

impl Sink<'_> {
    fn full(&self) -> bool {
        self.limit.is_some_and(|limit| self.rows.len() >= limit)
    }

    /// Adds a filtered row with its LETs bound; returns `false` once no more
    /// rows are needed.
    fn push(&mut self, mut row: Row, evaluator: &Evaluator<'_>) -> Result<bool, RuntimeError> {
        if self.limit.is_some() {
            if let Some((values, tiebreak)) = self.after {
                row.sort_values = sort_values(self.sort, &row, evaluator)?;
                let position = compare_keys(
                    (&row.sort_values, &row.tiebreak),
                    (values, tiebreak),
                    &self.directions,
                );
                if position != Ordering::Greater {
                    return Ok(true);
                }
            }
        }
        self.rows.push(row);
        Ok(!self.full())
    }
}

fn sort_values(
    sort: &[crate::query::ast::SortKey],
    row: &Row,
    evaluator: &Evaluator<'_>,
) -> Result<Vec<Value>, RuntimeError> {
    sort.iter()
        .map(|key| evaluator.eval(&key.expr, &row.bindings, &mut EvalTrace::default()))
        .collect()
}

fn compare_keys(
    (values, tiebreak): (&[Value], &Value),
    (other_values, other_tiebreak): (&[Value], &Value),
    directions: &[SortDirection],
) -> Ordering {
    for ((value, other), direction) in values.iter().zip(other_values).zip(directions) {
        let ord = match direction {
            SortDirection::Asc => value.cmp(other),
            SortDirection::Desc => other.cmp(value),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    tiebreak.cmp(other_tiebreak)
}

fn compare_rows(a: &Row, b: &Row, sort: &SortStrategy, directions: &[SortDirection]) -> Ordering {
    match sort {
        SortStrategy::Ranked => b
            .score
            .unwrap_or(f64::NEG_INFINITY)
            .total_cmp(&a.score.unwrap_or(f64::NEG_INFINITY))
            .then_with(|| a.tiebreak.cmp(&b.tiebreak)),
        _ => compare_keys(
            (&a.sort_values, &a.tiebreak),
            (&b.sort_values, &b.tiebreak),
            directions,
        ),
    }
}

fn storage_error(collection: &str, what: &str) -> impl FnOnce(crate::storage::StorageError) -> RuntimeError {
    let entity = format!("{what} on {collection}");
    move |err| RuntimeError::collaborator("storage", &err, entity)
}

/// Interprets a [`QueryPlan`] against the collaborators.
pub struct Executor<'a> {
    storage: &'a dyn Storage,
    graph: &'a dyn GraphIndex,
    vectors: &'a dyn VectorIndex,
    fulltext: &'a dyn FulltextIndex,
}

impl<'a> Executor<'a> {
    /// Executor over the given collaborators.
    pub fn new(
        storage: &'a dyn Storage,
        graph: &'a dyn GraphIndex,
        vectors: &'a dyn VectorIndex,
        fulltext: &'a dyn FulltextIndex,
    ) -> Self {
        Self {
            storage,
            graph,
            vectors,
            fulltext,
        }
    }

    /// Runs `plan` and returns the requested window of projected rows.
    pub fn run(
        &self,
        plan: &QueryPlan,
        window: &Window,
        ctx: &mut ExecContext<'_>,
    ) -> Result<ExecOutput, RuntimeError> {
        let logical = &plan.logical;
        let directions: Vec<SortDirection> = logical.sort.iter().map(|k| k.direction).collect();
        let plain = Evaluator::new();

        let mut constant_ok = true;
        if let Some(expr) = &logical.constant_filter {
            constant_ok = plain.test(expr, &Bindings::new(), &mut EvalTrace::default())?;
            ctx.record(|m| {
                m.constant_filter_precheck = true;
                m.constant_filter_result = Some(constant_ok);
            });
            debug!(passed = constant_ok, "constant filter checked before scanning");
        }

        let streaming = plan.early_exit && window.take.is_some();
        let limit = window
            .take
            .filter(|_| streaming)
            .map(|take| {
                let wanted = window.skip.saturating_add(take).saturating_add(1);
                usize::try_from(wanted).unwrap_or(usize::MAX)
            });
        let mut sink = Sink {
            rows: Vec::new(),
            limit,
            after: window.after.as_ref(),
            sort: &logical.sort,
            directions: directions.clone(),
        };
        let let_vars: BTreeSet<&str> = logical.lets.iter().map(|l| l.variable.as_str()).collect();
        let lets = LetProgram {
            lets: &logical.lets,
        };

        let mut traversal_out: Option<(Traversal, &GraphVars)> = None;
        if constant_ok && logical.filter.is_false() {
            debug!("filter rejects every row");
        } else if constant_ok {
            match &plan.shape {
                PlanShape::Single {
                    collection,
                    variable,
                    conjunctions,
                } => self.run_single(collection, variable, conjunctions, &lets, &let_vars, &mut sink, ctx)?,
                PlanShape::Join {
                    sources,
                    steps,
                    residual,
                } => self.run_join(sources, steps, residual, &lets, &let_vars, &mut sink, ctx)?,
                PlanShape::Traversal { prune } => {
                    let Some(Source::Traversal(source)) = logical.sources.first() else {
                        return Err(RuntimeError::invalid("traversal plan without traversal source"));
                    };
                    let row_limit = sink.limit.filter(|_| logical.filter.is_true());
                    let out = traversal::breadth_first(
                        self.graph,
                        source,
                        &logical.path_constraints,
                        prune,
                        row_limit,
                        ctx,
                    )?;
                    self.emit_graph_rows(&out, &source.vars, logical, &lets, &let_vars, &mut sink, ctx)?;
                    traversal_out = Some((out, &source.vars));
                }
                PlanShape::ShortestPath => {
                    let Some(Source::ShortestPath(source)) = logical.sources.first() else {
                        return Err(RuntimeError::invalid("shortest path plan without source"));
                    };
                    let out = traversal::shortest_path(
                        self.graph,
                        source,
                        &logical.path_constraints,
                        ctx,
                    )?;
                    self.emit_graph_rows(&out, &source.vars, logical, &lets, &let_vars, &mut sink, ctx)?;
                    traversal_out = Some((out, &source.vars));
                }
            }
        }

        let mut rows = sink.rows;
        if let Some(collect) = &logical.collect {
            rows = collect_rows(collect, rows, &plain)?;
        }

        let timer = profile_timer();
        let needs_sort = matches!(plan.sort, SortStrategy::InMemory | SortStrategy::Ranked);
        if !logical.sort.is_empty() {
            for row in rows.iter_mut() {
                if row.sort_values.is_empty() {
                    row.sort_values = sort_values(&logical.sort, row, &plain)
                        .map_err(|err| err.with_context(|| row_label(&plan.shape, row)))?;
                }
            }
        }
        if needs_sort {
            rows.sort_by(|a, b| compare_rows(a, b, &plan.sort, &directions));
        }
        record_profile_timer(QueryProfileKind::Filter, timer);

        if let Some((values, tiebreak)) = &window.after {
            rows.retain(|row| {
                compare_keys((&row.sort_values, &row.tiebreak), (values, tiebreak), &directions)
                    == Ordering::Greater
            });
        }
        let skip = usize::try_from(window.skip).unwrap_or(usize::MAX);
        let mut page: Vec<Row> = rows.into_iter().skip(skip).collect();
        let has_more = match window.take {
            Some(take) if page.len() as u64 > take => {
                page.truncate(take as usize);
                true
            }
            _ => false,
        };

        let next = match (has_more, page.last()) {
            (true, Some(last)) if plan.resumes_after() => Some(Anchor::After {
                sort_values: last.sort_values.clone(),
                tiebreak: last.tiebreak.clone(),
            }),
            (true, _) => Some(Anchor::Offset {
                rows: window.skip.saturating_add(page.len() as u64),
            }),
            (false, _) => None,
        };

        let lazy_path = traversal_out
            .as_ref()
            .filter(|(_, vars)| {
                vars.path
                    .as_deref()
                    .is_some_and(|p| logical.projection.variables().contains(p))
            });
        let mut projected = Vec::with_capacity(page.len());
        for mut row in page {
            if let (Some((out, vars)), Some(id)) = (lazy_path, row.visit) {
                if let Some(path_var) = &vars.path {
                    if row.bindings.get(path_var).is_none() {
                        row.bindings.bind(path_var.clone(), out.path(id));
                    }
                }
            }
            let value = plain
                .eval(&logical.projection, &row.bindings, &mut EvalTrace::default())
                .map_err(|err| err.with_context(|| row_label(&plan.shape, &row)))?;
            projected.push(value);
        }
        Ok(ExecOutput {
            rows: projected,
            next,
        })
    }

    fn fetch_text(&self, collection: &str, predicate: &Predicate) -> Result<Vec<TextHit>, RuntimeError> {
        let PredicateKind::Fulltext {
            column,
            query,
            limit,
            ..
        } = &predicate.kind
        else {
            return Ok(Vec::new());
        };
        let timer = profile_timer();
        let hits = self
            .fulltext
            .search(collection, column, query, *limit)
            .map_err(|err| {
                RuntimeError::collaborator("fulltext index", &err, format!("{collection}.{column}"))
            });
        record_profile_timer(QueryProfileKind::Fetch, timer);
        hits
    }

    fn fetch_vector(&self, collection: &str, predicate: &Predicate) -> Result<Vec<VectorHit>, RuntimeError> {
        let PredicateKind::NearestNeighbor {
            column,
            vector,
            k,
            metric,
            ..
        } = &predicate.kind
        else {
            return Ok(Vec::new());
        };
        let timer = profile_timer();
        let hits = self
            .vectors
            .search(collection, column, vector, *k, *metric)
            .map_err(|err| {
                RuntimeError::collaborator("vector index", &err, format!("{collection}.{column}"))
            });
        record_profile_timer(QueryProfileKind::Fetch, timer);
        hits
    }

    fn scan(&self, collection: &str, predicate: &ScanPredicate) -> Result<Vec<Record>, RuntimeError> {
        let timer = profile_timer();
        let records = self
            .storage
            .scan(collection, predicate)
            .map_err(storage_error(collection, "scan"));
        record_profile_timer(QueryProfileKind::Fetch, timer);
        records
    }

    fn parallel_scan(
        &self,
        collection: &str,
        predicates: Vec<ScanPredicate>,
        ctx: &ExecContext<'_>,
    ) -> Result<Vec<Record>, RuntimeError> {
        let deadline = &ctx.deadline;
        let mut results: Vec<Vec<Record>> = predicates
            .par_iter()
            .map(|predicate| {
                deadline.check()?;
                let records = self.scan(collection, predicate)?;
                deadline.check()?;
                Ok(records)
            })
            .collect::<Result<Vec<_>, RuntimeError>>()?;
        results.sort_by_key(Vec::len);
        let mut iter = results.into_iter();
        let Some(base) = iter.next() else {
            return Ok(Vec::new());
        };
        let others: Vec<FxHashSet<String>> = iter
            .map(|records| records.into_iter().map(|(key, _)| key).collect())
            .collect();
        Ok(base
            .into_iter()
            .filter(|(key, _)| others.iter().all(|keys| keys.contains(key)))
            .collect())
    }

    /// Candidates of one access path, in access order.
    fn candidates(
        &self,
        collection: &str,
        access: &Access,
        predicates: &[PlannedPredicate],
        ctx: &mut ExecContext<'_>,
    ) -> Result<Vec<Candidate>, RuntimeError> {
        let scan_of = |i: usize| {
            scan_predicate(&predicates[i].predicate.kind)
                .ok_or_else(|| RuntimeError::invalid("index scan over a non-indexable predicate"))
        };
        let candidates: Vec<Candidate> = match access {
            Access::IndexScan { predicate } => {
                ctx.record(|m| m.index_lookups += 1);
                self.scan(collection, &scan_of(*predicate)?)?
                    .into_iter()
                    .map(Candidate::from)
                    .collect()
            }
            Access::ParallelIndexScan { predicates: which } => {
                let scans = which.iter().map(|&i| scan_of(i)).collect::<Result<Vec<_>, _>>()?;
                ctx.record(|m| m.index_lookups += scans.len() as u64);
                self.parallel_scan(collection, scans, ctx)?
                    .into_iter()
                    .map(Candidate::from)
                    .collect()
            }
            Access::RankedSearch { fulltext, vector } => {
                let text = match fulltext {
                    Some(i) => self.fetch_text(collection, &predicates[*i].predicate)?,
                    None => Vec::new(),
                };
                let near = match vector {
                    Some(i) => self.fetch_vector(collection, &predicates[*i].predicate)?,
                    None => Vec::new(),
                };
                ctx.record(|m| m.index_lookups += (fulltext.is_some() as u64) + (vector.is_some() as u64));
                let fused = fusion::fuse(&near, &text, &ctx.config.fusion);
                trace!(hits = fused.len(), "fused ranked hits");
                let mut out = Vec::with_capacity(fused.len());
                for hit in fused {
                    let doc = self
                        .storage
                        .get(collection, &hit.key)
                        .map_err(storage_error(collection, "get"))?;
                    if let Some(doc) = doc {
                        out.push(Candidate {
                            key: hit.key,
                            doc,
                            score: Some(hit.score),
                        });
                    }
                }
                out
            }
            Access::OrderedSweep { column, descending } => {
                ctx.record(|m| m.index_lookups += 1);
                let timer = profile_timer();
                let records = self
                    .storage
                    .scan_ordered(collection, column, *descending)
                    .map_err(storage_error(collection, "ordered scan"))?;
                record_profile_timer(QueryProfileKind::Fetch, timer);
                records.into_iter().map(Candidate::from).collect()
            }
            Access::FullScan => self
                .scan(collection, &ScanPredicate::All)?
                .into_iter()
                .map(Candidate::from)
                .collect(),
        };
        ctx.record(|m| m.rows_scanned += candidates.len() as u64);
        Ok(candidates)
    }

    /// Hit sets of ranked predicates evaluated as filters.
    fn ranked_filters(
        &self,
        collection: &str,
        plan: &ConjunctionPlan,
    ) -> Result<RankedHits, RuntimeError> {
        let covered = plan.access.covered();
        let mut hits = RankedHits::default();
        for (i, planned) in plan.predicates.iter().enumerate() {
            let predicate = &planned.predicate;
            if covered.contains(&i) || hits.contains_call(&predicate.expr) {
                continue;
            }
            match predicate.kind {
                PredicateKind::Fulltext { .. } => {
                    let text = self.fetch_text(collection, predicate)?;
                    hits.insert(&predicate.expr, text.into_iter().map(|h| (h.key, h.score)));
                }
                PredicateKind::NearestNeighbor { .. } => {
                    let near = self.fetch_vector(collection, predicate)?;
                    hits.insert(&predicate.expr, near.into_iter().map(|h| (h.key, h.distance)));
                }
                _ => {}
            }
        }
        Ok(hits)
    }

    #[allow(clippy::too_many_arguments)]
    fn run_single(
        &self,
        collection: &str,
        variable: &str,
        conjunctions: &[ConjunctionPlan],
        lets: &LetProgram<'_>,
        let_vars: &BTreeSet<&str>,
        sink: &mut Sink<'_>,
        ctx: &mut ExecContext<'_>,
    ) -> Result<(), RuntimeError> {
        let union = conjunctions.len() > 1;
        let mut merged: BTreeMap<String, Row> = BTreeMap::new();
        let mut ticker = ctx.ticker();

        for plan in conjunctions {
            let covered = plan.access.covered();
            let ranked = self.ranked_filters(collection, plan)?;
            let evaluator = Evaluator::with_ranked(&ranked);
            let filter = FilterProgram::new(
                [plan
                    .predicates
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| !covered.contains(i))
                    .map(|(_, p)| &p.predicate.expr)],
                let_vars,
            );
            let candidates = self.candidates(collection, &plan.access, &plan.predicates, ctx)?;
            debug!(
                collection,
                access = plan.access.op_name(),
                candidates = candidates.len(),
                "evaluating conjunction"
            );

            let timer = profile_timer();
            for candidate in candidates {
                ticker.tick(&ctx.deadline)?;
                if union {
                    if let Some(existing) = merged.get_mut(&candidate.key) {
                        if candidate.score.is_none() || existing.score >= candidate.score {
                            continue;
                        }
                    }
                }
                let key = candidate.key;
                let mut bindings = Bindings::new().with(variable, candidate.doc);
                if let Some(score) = candidate.score {
                    bindings.set_score(variable, score);
                }
                let mut row = Row::new(bindings, Value::String(key.clone()));
                row.score = candidate.score;
                let passed = filter
                    .evaluate(&mut row, lets, &evaluator, ctx)
                    .and_then(|passed| {
                        if passed {
                            lets.bind(&mut row, &evaluator)?;
                        }
                        Ok(passed)
                    })
                    .map_err(|err| err.with_context(|| format!("{collection}/{key}")))?;
                if !passed {
                    continue;
                }
                if union {
                    merged.insert(key, row);
                } else if !sink.push(row, &evaluator)? {
                    debug!(collection, rows = sink.rows.len(), "limit reached, stopping scan");
                    break;
                }
            }
            record_profile_timer(QueryProfileKind::Filter, timer);
        }
        if union {
            sink.rows.extend(merged.into_values());
        }
        Ok(())
    }

    fn source_rows(
        &self,
        source: &SourcePlan,
        ctx: &mut ExecContext<'_>,
    ) -> Result<Vec<(String, Value)>, RuntimeError> {
        let covered = source.access.covered();
        let filter = FilterProgram::new(
            [source
                .predicates
                .iter()
                .enumerate()
                .filter(|(i, _)| !covered.contains(i))
                .map(|(_, p)| &p.predicate.expr)],
            &BTreeSet::new(),
        );
        let lets = LetProgram { lets: &[] };
        let evaluator = Evaluator::new();
        let mut ticker = ctx.ticker();
        let mut out = Vec::new();
        for candidate in self.candidates(&source.collection, &source.access, &source.predicates, ctx)? {
            ticker.tick(&ctx.deadline)?;
            let mut row = Row::new(
                Bindings::new().with(source.variable.clone(), candidate.doc),
                Value::Null,
            );
            let passed = filter
                .evaluate(&mut row, &lets, &evaluator, ctx)
                .map_err(|err| err.with_context(|| format!("{}/{}", source.collection, candidate.key)))?;
            if passed {
                let doc = row
                    .bindings
                    .get(&source.variable)
                    .cloned()
                    .unwrap_or_default();
                out.push((candidate.key, doc));
            }
        }
        Ok(out)
    }

    #[allow(clippy::too_many_arguments)]
    fn run_join(
        &self,
        sources: &[SourcePlan],
        steps: &[JoinStep],
        residual: &[Vec<PlannedPredicate>],
        lets: &LetProgram<'_>,
        let_vars: &BTreeSet<&str>,
        sink: &mut Sink<'_>,
        ctx: &mut ExecContext<'_>,
    ) -> Result<(), RuntimeError> {
        let inputs = sources
            .iter()
            .map(|source| self.source_rows(source, ctx))
            .collect::<Result<Vec<_>, _>>()?;
        let Some(first) = sources.first() else {
            return Ok(());
        };

        let mut partial: Vec<(Bindings, Vec<Value>)> = inputs[0]
            .iter()
            .map(|(key, doc)| {
                (
                    Bindings::new().with(first.variable.clone(), doc.clone()),
                    vec![Value::String(key.clone())],
                )
            })
            .collect();
        let mut ticker = ctx.ticker();
        let filter = FilterProgram::from_planned(residual, let_vars);
        let evaluator = Evaluator::new();

        for (n, step) in steps.iter().enumerate() {
            let right = &sources[step.right];
            let right_rows = &inputs[step.right];
            let matcher = JoinMatcher::build(step, &right.variable, &partial, right_rows);
            let last = n + 1 == steps.len();
            let mut joined = Vec::new();
            let mut produced = 0usize;

            'left: for (li, (bindings, keys)) in partial.iter().enumerate() {
                for ri in matcher.matches(li, bindings, right_rows) {
                    ticker.tick(&ctx.deadline)?;
                    let (key, doc) = &right_rows[ri];
                    let mut next = bindings.clone();
                    next.bind(right.variable.clone(), doc.clone());
                    let mut next_keys = keys.clone();
                    next_keys.push(Value::String(key.clone()));
                    produced += 1;
                    if !last {
                        joined.push((next, next_keys));
                        continue;
                    }
                    if !self.emit_joined(next, next_keys, &filter, lets, &evaluator, sink, ctx)? {
                        break 'left;
                    }
                }
            }
            debug!(
                right = %right.variable,
                strategy = ?step.strategy,
                build = step.build.as_str(),
                rows = produced,
                "join step finished"
            );
            partial = joined;
        }
        if steps.is_empty() {
            for (bindings, keys) in partial {
                ticker.tick(&ctx.deadline)?;
                if !self.emit_joined(bindings, keys, &filter, lets, &evaluator, sink, ctx)? {
                    break;
                }
            }
        }
        Ok(())
    }

    /// Filters one joined row into the sink; `false` once the sink is full.
    #[allow(clippy::too_many_arguments)]
    fn emit_joined(
        &self,
        bindings: Bindings,
        keys: Vec<Value>,
        filter: &FilterProgram<'_>,
        lets: &LetProgram<'_>,
        evaluator: &Evaluator<'_>,
        sink: &mut Sink<'_>,
        ctx: &mut ExecContext<'_>,
    ) -> Result<bool, RuntimeError> {
        let tiebreak = Value::Array(keys);
        let mut row = Row::new(bindings, tiebreak);
        let passed = filter
            .evaluate(&mut row, lets, evaluator, ctx)
            .and_then(|passed| {
                if passed {
                    lets.bind(&mut row, evaluator)?;
                }
                Ok(passed)
            })
            .map_err(|err| err.with_context(|| format!("joined row {}", row.tiebreak)))?;
        if !passed {
            return Ok(true);
        }
        sink.push(row, evaluator)
    }

    #[allow(clippy::too_many_arguments)]
    fn emit_graph_rows(
        &self,
        out: &Traversal,
        vars: &GraphVars,
        logical: &LogicalQuery,
        lets: &LetProgram<'_>,
        let_vars: &BTreeSet<&str>,
        sink: &mut Sink<'_>,
        ctx: &mut ExecContext<'_>,
    ) -> Result<(), RuntimeError> {
        let eager_path = vars
            .path
            .as_deref()
            .is_some_and(|p| reads_outside_projection(logical, p));
        let filter = FilterProgram::new(
            logical
                .filter
                .conjunctions
                .iter()
                .map(|c| c.predicates.iter().map(|p| &p.expr)),
            let_vars,
        );
        let evaluator = Evaluator::new();
        let mut ticker = ctx.ticker();
        for &id in &out.rows {
            ticker.tick(&ctx.deadline)?;
            let mut row = Row::new(out.bindings(id, vars, eager_path), Value::from(out.key(id)));
            row.visit = Some(id);
            let passed = filter
                .evaluate(&mut row, lets, &evaluator, ctx)
                .and_then(|passed| {
                    if passed {
                        lets.bind(&mut row, &evaluator)?;
                    }
                    Ok(passed)
                })
                .map_err(|err| err.with_context(|| format!("vertex {}", out.key(id))))?;
            if passed && !sink.push(row, &evaluator)? {
                break;
            }
        }
        Ok(())
    }
}

/// Matching strategy of one join step.
enum JoinMatcher {
    /// Right rows by key value, looked up per left row.
    BuildRight {
        left_var: String,
        left_path: Vec<String>,
        table: FxHashMap<Value, Vec<usize>>,
    },
    /// Matching right rows per left row, found by probing a table of left
    /// key values with every right row.
    BuildLeft { matches: Vec<Vec<usize>> },
    /// Every pair, optionally compared on the key columns.
    Scan {
        key: Option<(String, Vec<String>, Vec<String>)>,
        right_len: usize,
    },
}

impl JoinMatcher {
    fn build(
        step: &JoinStep,
        right_var: &str,
        partial: &[(Bindings, Vec<Value>)],
        right_rows: &[(String, Value)],
    ) -> Self {
        let key = step.key.as_ref().and_then(|key| {
            let right_col = key.column_for(right_var)?;
            let (left_var, left_col) = if key.left_variable == right_var {
                (&key.right_variable, &key.right_column)
            } else {
                (&key.left_variable, &key.left_column)
            };
            Some((left_var.clone(), split_column(left_col), split_column(right_col)))
        });
        let left_value = |bindings: &Bindings, var: &str, path: &[String]| {
            bindings
                .get(var)
                .map(|doc| doc.get_path(path))
                .unwrap_or_default()
        };
        match (&step.strategy, key) {
            (JoinStrategy::HashJoin, Some((left_var, left_path, right_path))) => match step.build {
                BuildSide::Right => {
                    let mut table: FxHashMap<Value, Vec<usize>> = FxHashMap::default();
                    for (idx, (_, doc)) in right_rows.iter().enumerate() {
                        table.entry(doc.get_path(&right_path)).or_default().push(idx);
                    }
                    JoinMatcher::BuildRight {
                        left_var,
                        left_path,
                        table,
                    }
                }
                BuildSide::Left => {
                    let mut table: FxHashMap<Value, Vec<usize>> = FxHashMap::default();
                    for (idx, (bindings, _)) in partial.iter().enumerate() {
                        table
                            .entry(left_value(bindings, &left_var, &left_path))
                            .or_default()
                            .push(idx);
                    }
                    let mut matches = vec![Vec::new(); partial.len()];
                    for (ri, (_, doc)) in right_rows.iter().enumerate() {
                        for &li in table.get(&doc.get_path(&right_path)).into_iter().flatten() {
                            matches[li].push(ri);
                        }
                    }
                    JoinMatcher::BuildLeft { matches }
                }
            },
            (_, key) => JoinMatcher::Scan {
                key,
                right_len: right_rows.len(),
            },
        }
    }

    /// Right row indexes joining left row `li`, in right input order.
    fn matches(&self, li: usize, bindings: &Bindings, right_rows: &[(String, Value)]) -> Vec<usize> {
        match self {
            JoinMatcher::BuildRight {
                left_var,
                left_path,
                table,
            } => {
                let wanted = bindings
                    .get(left_var)
                    .map(|doc| doc.get_path(left_path))
                    .unwrap_or_default();
                table.get(&wanted).cloned().unwrap_or_default()
            }
            JoinMatcher::BuildLeft { matches } => matches.get(li).cloned().unwrap_or_default(),
            JoinMatcher::Scan { key: None, right_len } => (0..*right_len).collect(),
            JoinMatcher::Scan {
                key: Some((left_var, left_path, right_path)),
                ..
            } => {
                let left = bindings
                    .get(left_var)
                    .map(|doc| doc.get_path(left_path))
                    .unwrap_or_default();
                right_rows
                    .iter()
                    .enumerate()
                    .filter(|(_, (_, doc))| doc.get_path(right_path) == left)
                    .map(|(ri, _)| ri)
                    .collect()
            }
        }
    }
}

/// Error context naming the row being processed.
fn row_label(shape: &PlanShape, row: &Row) -> String {
    match (shape, &row.tiebreak) {
        (PlanShape::Single { collection, .. }, Value::String(key)) => format!("{collection}/{key}"),
        (PlanShape::Traversal { .. } | PlanShape::ShortestPath, Value::String(key)) => {
            format!("vertex {key}")
        }
        (_, tiebreak) => format!("row {tiebreak}"),
    }
}

fn split_column(column: &str) -> Vec<String> {
    column.split('.').map(str::to_owned).collect()
}

/// Whether `variable` is read by any clause other than RETURN.
fn reads_outside_projection(logical: &LogicalQuery, variable: &str) -> bool {
    let filter = logical.filter.to_expr();
    let mut exprs: Vec<&Expr> = vec![&filter];
    exprs.extend(logical.lets.iter().map(|l| &l.expr));
    exprs.extend(logical.sort.iter().map(|k| &k.expr));
    if let Some(collect) = &logical.collect {
        exprs.extend(collect.groups.iter().map(|(_, e)| e));
        exprs.extend(collect.aggregates.iter().map(|a| &a.argument));
    }
    exprs.iter().any(|e| e.variables().contains(variable))
}

fn collect_rows(
    collect: &crate::query::logical::Collect,
    rows: Vec<Row>,
    evaluator: &Evaluator<'_>,
) -> Result<Vec<Row>, RuntimeError> {
    let fresh = || -> Vec<Accumulator> {
        collect
            .aggregates
            .iter()
            .map(|a| Accumulator::new(a.function))
            .collect()
    };
    let mut groups: BTreeMap<Vec<Value>, Vec<Accumulator>> = BTreeMap::new();
    for row in &rows {
        let mut trace = EvalTrace::default();
        let key = collect
            .groups
            .iter()
            .map(|(_, expr)| evaluator.eval(expr, &row.bindings, &mut trace))
            .collect::<Result<Vec<_>, _>>()?;
        let accumulators = groups.entry(key).or_insert_with(fresh);
        for (aggregate, acc) in collect.aggregates.iter().zip(accumulators.iter_mut()) {
            let value = evaluator.eval(&aggregate.argument, &row.bindings, &mut trace)?;
            acc.push(&value)?;
        }
    }
    if groups.is_empty() && collect.groups.is_empty() {
        groups.insert(Vec::new(), fresh());
    }
    Ok(groups
        .into_iter()
        .map(|(key, accumulators)| {
            let mut bindings = Bindings::new();
            for ((name, _), value) in collect.groups.iter().zip(&key) {
                bindings.bind(name.clone(), value.clone());
            }
            for (aggregate, acc) in collect.aggregates.iter().zip(&accumulators) {
                bindings.bind(aggregate.variable.clone(), acc.finish());
            }
            let mut row = Row::new(bindings, Value::Array(key));
            row.lets_bound = true;
            row
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::analyze::analyze;
    use crate::query::metadata::StaticCatalog;
    use crate::query::parser::parse;
    use crate::query::planner::{PlanOptions, Planner};
    use crate::storage::{IndexKind, MemoryBackend};
    use serde_json::json;

    fn backend() -> MemoryBackend {
        let people = [
            ("p1", "Ada", 36, "Oslo"),
            ("p2", "Bob", 17, "Rome"),
            ("p3", "Cy", 52, "Oslo"),
            ("p4", "Di", 29, "Rome"),
            ("p5", "Ed", 41, "Lima"),
        ];
        let mut backend = MemoryBackend::new().with_collection("people");
        for (key, name, age, city) in people {
            backend = backend.with_document(
                "people",
                key,
                json!({"name": name, "age": age, "city": city}).into(),
            );
        }
        backend
            .with_index("people", "city", IndexKind::Hash)
            .with_index("people", "age", IndexKind::Ordered)
    }

    fn run(backend: &MemoryBackend, query: &str, window: Window) -> Result<(ExecOutput, Option<Metrics>), String> {
        let config = EngineConfig::default();
        let catalog = StaticCatalog::new().with_collection("people");
        let ast = parse(query).map_err(|e| e.to_string())?;
        let logical = analyze(&ast, &catalog, &config).map_err(|e| e.to_string())?;
        let plan = Planner::new(backend, backend, backend, &config)
            .plan(logical, PlanOptions { allow_full_scan: true })
            .map_err(|e| e.to_string())?;
        let mut ctx = ExecContext::new(&config, Deadline::unbounded(), true);
        let out = Executor::new(backend, backend, backend, backend)
            .run(&plan, &window, &mut ctx)
            .map_err(|e| e.to_string())?;
        Ok((out, ctx.metrics))
    }

    fn names(out: &ExecOutput) -> Vec<String> {
        out.rows.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn disjunction_unions_each_conjunction_once() {
        let backend = backend();
        let (out, _) = run(
            &backend,
            r#"FOR p IN people FILTER p.city == "Oslo" OR p.age < 30 RETURN p.name"#,
            Window::default(),
        )
        .expect("run");
        assert_eq!(names(&out), vec![r#""Ada""#, r#""Bob""#, r#""Cy""#, r#""Di""#]);
    }

    #[test]
    fn sort_limit_and_cursor_anchor() {
        let backend = backend();
        let window = Window {
            skip: 0,
            take: Some(2),
            after: None,
        };
        let (out, _) = run(
            &backend,
            "FOR p IN people SORT p.age DESC LIMIT 2 RETURN p.name",
            window,
        )
        .expect("run");
        assert_eq!(names(&out), vec![r#""Cy""#, r#""Ed""#]);
        assert_eq!(
            out.next,
            Some(Anchor::After {
                sort_values: vec![Value::Int(41)],
                tiebreak: Value::from("p5"),
            })
        );
    }

    #[test]
    fn streaming_limit_stops_the_filter_early() {
        let backend = backend();
        let window = Window {
            skip: 0,
            take: Some(1),
            after: None,
        };
        let (out, metrics) = run(
            &backend,
            r#"FOR p IN people FILTER p.name != "Zed" SORT p.age LIMIT 1 RETURN p.name"#,
            window,
        )
        .expect("run");
        assert_eq!(names(&out), vec![r#""Bob""#]);
        // one row for the page plus one extra to detect more
        assert_eq!(metrics.expect("metrics").filter_evaluations_total, 2);
    }

    #[test]
    fn collect_without_groups_yields_one_row_on_empty_input() {
        let backend = backend();
        let (out, _) = run(
            &backend,
            r#"FOR p IN people FILTER p.city == "Paris" COLLECT AGGREGATE n = COUNT(p) RETURN n"#,
            Window::default(),
        )
        .expect("run");
        assert_eq!(out.rows, vec![Value::Int(0)]);
    }

    #[test]
    fn grouped_aggregates_in_group_order() {
        let backend = backend();
        let (out, _) = run(
            &backend,
            "FOR p IN people COLLECT city = p.city AGGREGATE n = COUNT(p), oldest = MAX(p.age) RETURN [city, n, oldest]",
            Window::default(),
        )
        .expect("run");
        assert_eq!(
            names(&out),
            vec![r#"["Lima",1,41]"#, r#"["Oslo",2,52]"#, r#"["Rome",2,29]"#]
        );
    }

    #[test]
    fn statistical_aggregates_in_collect() {
        let backend = backend();
        let (out, _) = run(
            &backend,
            "FOR p IN people COLLECT AGGREGATE med = MEDIAN(p.age), p90 = PERCENTILE(p.age, 90), spread = RANGE(p.age) RETURN [med, p90, spread]",
            Window::default(),
        )
        .expect("run");
        let Value::Array(stats) = &out.rows[0] else {
            panic!("array row expected");
        };
        assert_eq!(stats[0], Value::Float(36.0));
        let p90 = stats[1].as_f64().expect("number");
        assert!((p90 - 47.6).abs() < 1e-9, "{p90}");
        assert_eq!(stats[2], Value::Float(35.0));

        let err = run(
            &backend,
            "FOR p IN people COLLECT AGGREGATE p90 = PERCENTILE(p.age) RETURN p90",
            Window::default(),
        )
        .expect_err("missing rank");
        assert!(err.contains("PERCENTILE"), "{err}");
    }

    #[test]
    fn false_constant_filter_skips_storage() {
        let backend = backend();
        let (out, metrics) = run(
            &backend,
            "FOR p IN people FILTER 1 > 2 RETURN p",
            Window::default(),
        )
        .expect("run");
        assert!(out.rows.is_empty());
        let metrics = metrics.expect("metrics");
        assert!(metrics.constant_filter_precheck);
        assert_eq!(metrics.constant_filter_result, Some(false));
        assert_eq!(metrics.rows_scanned, 0);
    }

    #[test]
    fn contradictory_filter_skips_storage() {
        let backend = backend();
        let (out, metrics) = run(
            &backend,
            "FOR p IN people FILTER p.age > 1 AND false RETURN p",
            Window::default(),
        )
        .expect("run");
        assert!(out.rows.is_empty());
        let metrics = metrics.expect("metrics");
        assert_eq!(metrics.rows_scanned, 0);
        assert_eq!(metrics.filter_evaluations_total, 0);
    }

    #[test]
    fn let_errors_only_for_rows_passing_earlier_filters() {
        let backend = backend().with_document("people", "p6", json!({"name": "Zed", "age": 0}).into());
        let (out, _) = run(
            &backend,
            "FOR p IN people FILTER p.age != 0 LET r = 100 / p.age FILTER r > 2 RETURN p.name",
            Window::default(),
        )
        .expect("run");
        assert_eq!(names(&out), vec![r#""Ada""#, r#""Bob""#, r#""Di""#, r#""Ed""#]);

        let err = run(
            &backend,
            "FOR p IN people LET r = 100 / p.age RETURN r",
            Window::default(),
        )
        .expect_err("division by zero");
        assert!(err.contains("division by zero"), "{err}");
        assert!(err.contains("people/p6"), "{err}");
    }
}
