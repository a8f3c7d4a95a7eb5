//! Cost-based planner: access path per conjunction, predicate order, join
//! strategy, sort strategy and the explain tree.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::hash::Hasher;

use tracing::debug;
use xxhash_rust::xxh64::Xxh64;

use crate::config::EngineConfig;
use crate::query::ast::{Expr, SortDirection};
use crate::query::errors::{QueryError, RuntimeError, SemanticError};
use crate::query::logical::{
    Conjunction, GraphVars, LogicalQuery, Predicate, PredicateKind, Source,
};
use crate::query::physical::{
    Access, BuildSide, ConjunctionPlan, ExecutionMode, ExplainNode, JoinStep, JoinStrategy, PlanShape,
    PlannedPredicate, QueryPlan, SortStrategy, SourcePlan,
};
use crate::storage::{Estimate, FulltextIndex, IndexKind, ScanPredicate, Storage, VectorIndex};

/// Per-request planner switches.
#[derive(Clone, Copy, Debug, Default)]
pub struct PlanOptions {
    /// Caller accepts full collection sweeps for unindexed predicates.
    pub allow_full_scan: bool,
}

/// Chooses a [`QueryPlan`] for a translated query.
pub struct Planner<'a> {
    storage: &'a dyn Storage,
    vectors: &'a dyn VectorIndex,
    fulltext: &'a dyn FulltextIndex,
    config: &'a EngineConfig,
}

/// Storage predicate equivalent to an index-servable classification.
pub fn scan_predicate(kind: &PredicateKind) -> Option<ScanPredicate> {
    match kind {
        PredicateKind::Equality { column, value, .. } => Some(ScanPredicate::Eq {
            column: column.clone(),
            value: value.clone(),
        }),
        PredicateKind::Range { column, lo, hi, .. } => Some(ScanPredicate::Range {
            column: column.clone(),
            lo: lo.clone(),
            hi: hi.clone(),
        }),
        PredicateKind::SetMembership { column, values, .. } => Some(ScanPredicate::In {
            column: column.clone(),
            values: values.clone(),
        }),
        _ => None,
    }
}

fn by_cost(a: &PlannedPredicate, b: &PlannedPredicate) -> Ordering {
    a.ordering_cost()
        .cmp(&b.ordering_cost())
        .then_with(|| {
            a.predicate
                .kind
                .preference()
                .cmp(&b.predicate.kind.preference())
        })
}

fn predicate_column(predicate: &Predicate) -> String {
    predicate
        .kind
        .column()
        .map_or_else(|| predicate.expr.render(), str::to_owned)
}

impl<'a> Planner<'a> {
    /// Planner over the given collaborators.
    pub fn new(
        storage: &'a dyn Storage,
        vectors: &'a dyn VectorIndex,
        fulltext: &'a dyn FulltextIndex,
        config: &'a EngineConfig,
    ) -> Self {
        Self {
            storage,
            vectors,
            fulltext,
            config,
        }
    }

    /// Plans `logical`.
    pub fn plan(&self, logical: LogicalQuery, options: PlanOptions) -> Result<QueryPlan, QueryError> {
        let shape = match logical.sources.as_slice() {
            [Source::Collection {
                variable,
                collection,
            }] => self.plan_single(&logical, variable, collection, options)?,
            [Source::Traversal(traversal)] => PlanShape::Traversal {
                prune: prune_predicates(&logical, &traversal.vars),
            },
            [Source::ShortestPath(_)] => PlanShape::ShortestPath,
            [] => {
                return Err(SemanticError::Unsupported {
                    feature: "query without FOR source".into(),
                }
                .into())
            }
            _ => self.plan_join(&logical, options)?,
        };

        let mode = match &shape {
            PlanShape::Single { conjunctions, .. } => conjunctions
                .iter()
                .map(|c| c.mode)
                .max()
                .unwrap_or(ExecutionMode::IndexOptimized),
            PlanShape::Join { sources, .. } => sources
                .iter()
                .map(|s| s.mode)
                .max()
                .unwrap_or(ExecutionMode::FullScanFallback),
            PlanShape::Traversal { .. } | PlanShape::ShortestPath => ExecutionMode::IndexOptimized,
        };
        let join_strategy = match &shape {
            PlanShape::Join { steps, .. } => steps.first().map(|s| s.strategy.clone()),
            _ => None,
        };
        let sort = sort_strategy(&logical, &shape);
        let early_exit = logical.limit.is_some()
            && logical.collect.is_none()
            && matches!(sort, SortStrategy::Natural | SortStrategy::IndexOrder { .. })
            && match &shape {
                PlanShape::Single { conjunctions, .. } => conjunctions.len() == 1,
                PlanShape::Join { .. } | PlanShape::Traversal { .. } | PlanShape::ShortestPath => true,
            };

        let explain = build_explain(&logical, &shape, mode, &sort, early_exit);
        let plan_hash = compute_plan_hash(&explain);
        debug!(
            mode = mode.as_str(),
            plan_hash = format_args!("{plan_hash:016x}"),
            early_exit,
            "planned query"
        );
        Ok(QueryPlan {
            logical,
            mode,
            shape,
            join_strategy,
            sort,
            early_exit,
            plan_hash,
            explain,
        })
    }

    fn estimate(&self, collection: &str, predicate: &Predicate) -> Result<Option<Estimate>, QueryError> {
        let estimate = match &predicate.kind {
            PredicateKind::Fulltext { limit, .. } => Some(Estimate::exact(*limit as u64)),
            PredicateKind::NearestNeighbor { k, .. } => Some(Estimate::exact(*k as u64)),
            kind => match scan_predicate(kind) {
                Some(scan) => Some(
                    self.storage
                        .estimate_cardinality(
                            collection,
                            &scan,
                            self.config.optimizer.estimate_sample_cap,
                        )
                        .map_err(|err| {
                            RuntimeError::collaborator("storage", &err, format!("estimate on {collection}"))
                        })?,
                ),
                None => None,
            },
        };
        Ok(estimate)
    }

    fn is_indexed(&self, collection: &str, kind: &PredicateKind) -> bool {
        match kind {
            PredicateKind::Equality { column, .. } | PredicateKind::SetMembership { column, .. } => {
                self.storage.index_kind(collection, column).is_some()
            }
            PredicateKind::Range { column, .. } => self
                .storage
                .index_kind(collection, column)
                .is_some_and(IndexKind::supports_range),
            PredicateKind::Fulltext { column, .. } => self.fulltext.has_index(collection, column),
            PredicateKind::NearestNeighbor { column, .. } => {
                self.vectors.has_index(collection, column)
            }
            PredicateKind::Geo { .. } | PredicateKind::Residual { .. } => false,
        }
    }

    fn annotate(
        &self,
        collection: &str,
        variable: &str,
        predicates: &[Predicate],
    ) -> Result<Vec<PlannedPredicate>, QueryError> {
        let mut planned = predicates
            .iter()
            .map(|predicate| -> Result<PlannedPredicate, QueryError> {
                let own = predicate.kind.variable() == Some(variable);
                Ok(PlannedPredicate {
                    estimate: if own {
                        self.estimate(collection, predicate)?
                    } else {
                        None
                    },
                    indexed: own && self.is_indexed(collection, &predicate.kind),
                    predicate: predicate.clone(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        planned.sort_by(by_cost);
        for p in &planned {
            if p.predicate.kind.is_ranked() && !p.indexed {
                return Err(SemanticError::IndexRequired {
                    collection: collection.to_owned(),
                    column: predicate_column(&p.predicate),
                }
                .into());
            }
        }
        Ok(planned)
    }

    /// Index-driven access for `planned`, if any predicate has an index.
    fn index_access(&self, planned: &[PlannedPredicate]) -> Option<(ExecutionMode, Access)> {
        let fulltext = planned
            .iter()
            .position(|p| matches!(p.predicate.kind, PredicateKind::Fulltext { .. }));
        let vector = planned
            .iter()
            .position(|p| matches!(p.predicate.kind, PredicateKind::NearestNeighbor { .. }));
        if fulltext.is_some() || vector.is_some() {
            return Some((
                ExecutionMode::IndexOptimized,
                Access::RankedSearch { fulltext, vector },
            ));
        }

        let indexed: Vec<usize> = planned
            .iter()
            .enumerate()
            .filter(|(_, p)| p.indexed)
            .map(|(i, _)| i)
            .collect();
        let first = *indexed.first()?;
        let best = planned[first].ordering_cost();
        let ties: Vec<usize> = indexed
            .iter()
            .copied()
            .filter(|&i| planned[i].ordering_cost() == best)
            .collect();
        if self.config.optimizer.parallel_scans && ties.len() >= 2 && best != u64::MAX {
            Some((
                ExecutionMode::IndexParallel,
                Access::ParallelIndexScan { predicates: ties },
            ))
        } else {
            Some((
                ExecutionMode::IndexOptimized,
                Access::IndexScan { predicate: first },
            ))
        }
    }

    fn plan_conjunction(
        &self,
        collection: &str,
        variable: &str,
        conjunction: &Conjunction,
        sort_hint: Option<&(String, bool)>,
        options: PlanOptions,
    ) -> Result<ConjunctionPlan, QueryError> {
        let predicates = self.annotate(collection, variable, &conjunction.predicates)?;
        let (mode, access) = match self.index_access(&predicates) {
            Some(found) => found,
            None => match sort_hint {
                Some((column, descending)) => (
                    ExecutionMode::IndexRangeAware,
                    Access::OrderedSweep {
                        column: column.clone(),
                        descending: *descending,
                    },
                ),
                None if predicates.is_empty() || options.allow_full_scan => {
                    (ExecutionMode::FullScanFallback, Access::FullScan)
                }
                None => {
                    return Err(SemanticError::IndexRequired {
                        collection: collection.to_owned(),
                        column: predicate_column(&predicates[0].predicate),
                    }
                    .into())
                }
            },
        };
        debug!(
            collection,
            mode = mode.as_str(),
            access = access.op_name(),
            predicates = predicates.len(),
            "planned conjunction"
        );
        Ok(ConjunctionPlan {
            mode,
            access,
            predicates,
        })
    }

    fn plan_single(
        &self,
        logical: &LogicalQuery,
        variable: &str,
        collection: &str,
        options: PlanOptions,
    ) -> Result<PlanShape, QueryError> {
        let sort_hint = self.sort_hint(logical, variable, collection);
        let conjunctions = logical
            .filter
            .conjunctions
            .iter()
            .map(|c| self.plan_conjunction(collection, variable, c, sort_hint.as_ref(), options))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(PlanShape::Single {
            collection: collection.to_owned(),
            variable: variable.to_owned(),
            conjunctions,
        })
    }

    /// Ordered index usable to produce rows in SORT order.
    fn sort_hint(&self, logical: &LogicalQuery, variable: &str, collection: &str) -> Option<(String, bool)> {
        if logical.collect.is_some() || logical.filter.is_ranked() {
            return None;
        }
        let [key] = logical.sort.as_slice() else {
            return None;
        };
        let Expr::FieldAccess {
            variable: var,
            path,
        } = &key.expr
        else {
            return None;
        };
        if var != variable {
            return None;
        }
        let column = path.join(".");
        self.storage
            .index_kind(collection, &column)
            .filter(|kind| kind.supports_range())
            .map(|_| (column, key.direction == SortDirection::Desc))
    }

    fn plan_join(&self, logical: &LogicalQuery, options: PlanOptions) -> Result<PlanShape, QueryError> {
        if logical.filter.is_ranked() {
            return Err(SemanticError::Unsupported {
                feature: "FULLTEXT/NEAR in a query with several FOR clauses".into(),
            }
            .into());
        }
        let inputs: Vec<(&str, &str)> = logical
            .sources
            .iter()
            .filter_map(|s| s.collection().map(|c| (s.variable(), c)))
            .collect();
        let single = logical.filter.conjunctions.len() == 1 && !logical.filter.fallback;

        let mut remaining: Vec<Predicate> = Vec::new();
        let mut pushed: Vec<Vec<Predicate>> = vec![Vec::new(); inputs.len()];
        if single {
            for predicate in &logical.filter.conjunctions[0].predicates {
                let vars = predicate.variables();
                let target = inputs
                    .iter()
                    .position(|(var, _)| vars.len() == 1 && vars.contains(*var));
                match target {
                    Some(i) if predicate.join.is_none() => pushed[i].push(predicate.clone()),
                    _ => remaining.push(predicate.clone()),
                }
            }
        }

        let mut sources = Vec::with_capacity(inputs.len());
        for ((variable, collection), own) in inputs.iter().zip(pushed) {
            let predicates = self.annotate(collection, variable, &own)?;
            let (mode, access) = match self.index_access(&predicates) {
                Some(found) => found,
                None if predicates.is_empty() || options.allow_full_scan => {
                    (ExecutionMode::FullScanFallback, Access::FullScan)
                }
                None => {
                    return Err(SemanticError::IndexRequired {
                        collection: (*collection).to_owned(),
                        column: predicate_column(&predicates[0].predicate),
                    }
                    .into())
                }
            };
            let estimate = match access.covered().first() {
                Some(&i) => predicates[i].estimate,
                None => None,
            };
            let estimate = match estimate {
                Some(estimate) => estimate,
                None => self
                    .storage
                    .estimate_cardinality(
                        collection,
                        &ScanPredicate::All,
                        self.config.optimizer.estimate_sample_cap,
                    )
                    .map_err(|err| {
                        RuntimeError::collaborator("storage", &err, format!("estimate on {collection}"))
                    })?,
            };
            sources.push(SourcePlan {
                variable: (*variable).to_owned(),
                collection: (*collection).to_owned(),
                access,
                mode,
                predicates,
                estimate,
            });
        }

        let residual: Vec<Vec<PlannedPredicate>> = if single {
            vec![unplanned(remaining)]
        } else {
            logical
                .filter
                .conjunctions
                .iter()
                .map(|c| unplanned(c.predicates.clone()))
                .collect()
        };
        if !single && !options.allow_full_scan {
            let blocking = residual
                .iter()
                .flatten()
                .find(|p| p.predicate.join.is_none());
            if let Some(p) = blocking {
                let collection = p
                    .predicate
                    .kind
                    .variable()
                    .and_then(|v| inputs.iter().find(|(var, _)| *var == v))
                    .map_or(inputs[0].1, |(_, c)| *c);
                return Err(SemanticError::IndexRequired {
                    collection: collection.to_owned(),
                    column: predicate_column(&p.predicate),
                }
                .into());
            }
        }

        let budget = self.config.optimizer.hash_join_memory_budget_bytes;
        let row_bytes = self.config.optimizer.estimated_row_bytes;
        let mut steps = Vec::with_capacity(sources.len().saturating_sub(1));
        for right in 1..sources.len() {
            let left_vars: BTreeSet<&str> =
                sources[..right].iter().map(|s| s.variable.as_str()).collect();
            let right_var = sources[right].variable.as_str();
            let key = residual
                .iter()
                .take(usize::from(single))
                .flatten()
                .filter_map(|p| p.predicate.join.as_ref())
                .find(|k| {
                    (k.left_variable == right_var && left_vars.contains(k.right_variable.as_str()))
                        || (k.right_variable == right_var
                            && left_vars.contains(k.left_variable.as_str()))
                })
                .cloned();
            let left = sources[..right].iter().fold(Estimate::exact(1), |acc, s| Estimate {
                count: acc.count.saturating_mul(s.estimate.count),
                capped: acc.capped || s.estimate.capped,
            });
            let incoming = sources[right].estimate;
            let fits = |e: Estimate| !e.capped && e.count.saturating_mul(row_bytes) <= budget;
            let build = match (fits(left), fits(incoming)) {
                (true, true) if left.count < incoming.count => Some(BuildSide::Left),
                (_, true) => Some(BuildSide::Right),
                (true, false) => Some(BuildSide::Left),
                (false, false) => None,
            };
            let (strategy, build) = match (key.is_some(), build) {
                (true, Some(side)) => (JoinStrategy::HashJoin, side),
                _ => (JoinStrategy::NestedLoop, BuildSide::Right),
            };
            debug!(
                right = right_var,
                left_rows = left.count,
                right_rows = incoming.count,
                strategy = ?strategy,
                build = build.as_str(),
                "planned join step"
            );
            steps.push(JoinStep {
                right,
                strategy,
                build,
                key,
            });
        }

        Ok(PlanShape::Join {
            sources,
            steps,
            residual,
        })
    }
}

fn unplanned(mut predicates: Vec<Predicate>) -> Vec<PlannedPredicate> {
    predicates.sort_by_key(|p| p.kind.preference());
    predicates
        .into_iter()
        .map(|predicate| PlannedPredicate {
            predicate,
            estimate: None,
            indexed: false,
        })
        .collect()
}

/// Conjuncts of a single-conjunction traversal filter that only read the
/// vertex or edge variable.
fn prune_predicates(logical: &LogicalQuery, vars: &GraphVars) -> Vec<Predicate> {
    let filter = &logical.filter;
    if filter.fallback || filter.conjunctions.len() != 1 {
        return Vec::new();
    }
    let allowed: BTreeSet<&str> = std::iter::once(vars.vertex.as_str())
        .chain(vars.edge.as_deref())
        .collect();
    filter.conjunctions[0]
        .predicates
        .iter()
        .filter(|p| {
            let read = p.expr.variables();
            !read.is_empty() && read.iter().all(|v| allowed.contains(v.as_str()))
        })
        .cloned()
        .collect()
}

fn sort_strategy(logical: &LogicalQuery, shape: &PlanShape) -> SortStrategy {
    if logical.sort.is_empty() {
        return if logical.collect.is_none() && logical.filter.is_ranked() {
            SortStrategy::Ranked
        } else {
            SortStrategy::Natural
        };
    }
    if let PlanShape::Single { conjunctions, .. } = shape {
        if let [ConjunctionPlan {
            access: Access::OrderedSweep { column, descending },
            ..
        }] = conjunctions.as_slice()
        {
            return SortStrategy::IndexOrder {
                column: column.clone(),
                descending: *descending,
            };
        }
    }
    SortStrategy::InMemory
}

fn describe_predicate(planned: &PlannedPredicate) -> String {
    let expr = planned.predicate.expr.render();
    match planned.estimate {
        Some(est) if est.capped => format!("{expr} (est>={}, capped)", est.count),
        Some(est) => format!("{expr} (est={})", est.count),
        None => expr,
    }
}

fn access_node(access: &Access, predicates: &[PlannedPredicate], collection: &str) -> ExplainNode {
    let mut node = ExplainNode::new(access.op_name()).prop("collection", collection);
    match access {
        Access::IndexScan { predicate } => {
            let p = &predicates[*predicate];
            node = node
                .prop("index", p.predicate.kind.column().unwrap_or_default())
                .literal("predicate", describe_predicate(p));
        }
        Access::ParallelIndexScan { predicates: which } => {
            for (n, i) in which.iter().enumerate() {
                node = node.literal(format!("scan{n}"), describe_predicate(&predicates[*i]));
            }
        }
        Access::RankedSearch { fulltext, vector } => {
            for i in fulltext.iter().chain(vector.iter()) {
                node = node.literal(
                    predicates[*i].predicate.kind.name(),
                    describe_predicate(&predicates[*i]),
                );
            }
            if fulltext.is_some() && vector.is_some() {
                node = node.prop("fusion", "hybrid");
            }
        }
        Access::OrderedSweep { column, descending } => {
            node = node
                .prop("index", column.as_str())
                .prop("order", if *descending { "desc" } else { "asc" });
        }
        Access::FullScan => {}
    }
    node
}

fn filter_node(input: ExplainNode, predicates: &[&PlannedPredicate]) -> ExplainNode {
    if predicates.is_empty() {
        return input;
    }
    let mut node = ExplainNode::new("Filter");
    for (n, p) in predicates.iter().enumerate() {
        node = node.literal(format!("p{n}"), describe_predicate(p));
    }
    node.input(input)
}

fn conjunction_node(plan: &ConjunctionPlan, collection: &str) -> ExplainNode {
    let covered = plan.access.covered();
    let rest: Vec<&PlannedPredicate> = plan
        .predicates
        .iter()
        .enumerate()
        .filter(|(i, _)| !covered.contains(i))
        .map(|(_, p)| p)
        .collect();
    let scan = access_node(&plan.access, &plan.predicates, collection).prop("mode", plan.mode.as_str());
    filter_node(scan, &rest)
}

fn source_node(logical: &LogicalQuery, shape: &PlanShape) -> ExplainNode {
    match shape {
        PlanShape::Single {
            collection,
            conjunctions,
            ..
        } => match conjunctions.as_slice() {
            [] => ExplainNode::new("Empty").prop("reason", "filter is always false"),
            [only] => conjunction_node(only, collection),
            many => many.iter().fold(ExplainNode::new("Union"), |node, c| {
                node.input(conjunction_node(c, collection))
            }),
        },
        PlanShape::Join {
            sources,
            steps,
            residual,
        } => {
            let input = |s: &SourcePlan| {
                let covered = s.access.covered();
                let rest: Vec<&PlannedPredicate> = s
                    .predicates
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| !covered.contains(i))
                    .map(|(_, p)| p)
                    .collect();
                let scan = access_node(&s.access, &s.predicates, &s.collection)
                    .prop("mode", s.mode.as_str())
                    .prop("var", s.variable.as_str());
                filter_node(scan, &rest)
            };
            let mut node = sources.first().map(|s| input(s)).unwrap_or_else(|| ExplainNode::new("Empty"));
            for step in steps {
                let mut join = match step.strategy {
                    JoinStrategy::HashJoin => {
                        ExplainNode::new("HashJoin").prop("build", step.build.as_str())
                    }
                    JoinStrategy::NestedLoop => ExplainNode::new("NestedLoopJoin"),
                };
                if let Some(key) = &step.key {
                    join = join.prop(
                        "on",
                        format!(
                            "{}.{} == {}.{}",
                            key.left_variable, key.left_column, key.right_variable, key.right_column
                        ),
                    );
                }
                node = join.input(node).input(input(&sources[step.right]));
            }
            if residual.len() == 1 {
                let preds: Vec<&PlannedPredicate> = residual[0].iter().collect();
                filter_node(node, &preds)
            } else {
                ExplainNode::new("Filter")
                    .literal("dnf", logical.filter.to_expr().render())
                    .input(node)
            }
        }
        PlanShape::Traversal { prune } => {
            let mut node = ExplainNode::new("Traversal");
            if let Some(Source::Traversal(t)) = logical.sources.first() {
                node = node
                    .prop("graph", t.graph.as_str())
                    .literal("start", t.start.as_str())
                    .prop("depth", format!("{}..{}", t.min_depth, t.max_depth))
                    .prop("direction", t.direction.as_str());
                if let Some(edge_type) = &t.edge_type {
                    node = node.prop("edge_type", edge_type.as_str());
                }
            }
            for (n, p) in prune.iter().enumerate() {
                node = node.literal(format!("prune{n}"), p.expr.render());
            }
            for (n, c) in logical.path_constraints.iter().enumerate() {
                node = node.literal(
                    format!("path{n}"),
                    format!("PATH_{}({})", c.quantifier.name(), c.condition.render()),
                );
            }
            traversal_filter(logical, node)
        }
        PlanShape::ShortestPath => {
            let mut node = ExplainNode::new("ShortestPath");
            if let Some(Source::ShortestPath(s)) = logical.sources.first() {
                node = node
                    .prop("graph", s.graph.as_str())
                    .literal("start", s.start.as_str())
                    .literal("target", s.target.as_str())
                    .prop("direction", s.direction.as_str());
                if let Some(weight) = &s.weight {
                    node = node.prop(
                        "weight",
                        format!("{} (default {})", weight.attribute, weight.default),
                    );
                }
            }
            traversal_filter(logical, node)
        }
    }
}

fn traversal_filter(logical: &LogicalQuery, node: ExplainNode) -> ExplainNode {
    if logical.filter.is_true() {
        node
    } else {
        ExplainNode::new("Filter")
            .literal("dnf", logical.filter.to_expr().render())
            .input(node)
    }
}

fn build_explain(
    logical: &LogicalQuery,
    shape: &PlanShape,
    mode: ExecutionMode,
    sort: &SortStrategy,
    early_exit: bool,
) -> ExplainNode {
    let mut node = source_node(logical, shape);
    if let Some(constant) = &logical.constant_filter {
        node = ExplainNode::new("ConstantFilter")
            .literal("expr", constant.render())
            .input(node);
    }
    if !logical.lets.is_empty() {
        let vars: Vec<&str> = logical.lets.iter().map(|l| l.variable.as_str()).collect();
        node = ExplainNode::new("Let").prop("vars", vars.join(", ")).input(node);
    }
    if let Some(collect) = &logical.collect {
        let groups: Vec<&str> = collect.groups.iter().map(|(v, _)| v.as_str()).collect();
        let aggregates: Vec<String> = collect
            .aggregates
            .iter()
            .map(|a| format!("{} = {}({})", a.variable, a.function.name(), a.argument.render()))
            .collect();
        node = ExplainNode::new("Collect")
            .prop("groups", groups.join(", "))
            .prop("aggregates", aggregates.join(", "))
            .input(node);
    }
    match sort {
        SortStrategy::InMemory | SortStrategy::IndexOrder { .. } => {
            let keys: Vec<String> = logical
                .sort
                .iter()
                .map(|k| {
                    let dir = match k.direction {
                        SortDirection::Asc => "ASC",
                        SortDirection::Desc => "DESC",
                    };
                    format!("{} {dir}", k.expr.render())
                })
                .collect();
            let strategy = if matches!(sort, SortStrategy::InMemory) {
                "in_memory"
            } else {
                "index_order"
            };
            node = ExplainNode::new("Sort")
                .prop("strategy", strategy)
                .literal("keys", keys.join(", "))
                .input(node);
        }
        SortStrategy::Ranked => {
            node = ExplainNode::new("Sort")
                .prop("strategy", "score_desc")
                .input(node);
        }
        SortStrategy::Natural => {}
    }
    if let Some(limit) = &logical.limit {
        node = ExplainNode::new("Limit")
            .prop("offset", limit.offset.to_string())
            .prop("count", limit.count.to_string())
            .prop("early_exit", early_exit.to_string())
            .input(node);
    }
    ExplainNode::new("Project")
        .literal("expr", logical.projection.render())
        .prop("mode", mode.as_str())
        .input(node)
}

fn compute_plan_hash(root: &ExplainNode) -> u64 {
    let mut hasher = Xxh64::new(0);
    hash_explain_node(root, &mut hasher);
    hasher.finish()
}

fn hash_explain_node(node: &ExplainNode, hasher: &mut Xxh64) {
    hasher.write(node.op.as_bytes());
    hasher.write_u64(node.props.len() as u64);
    for prop in &node.props {
        hasher.write(prop.key.as_bytes());
        hasher.write(prop.value.as_bytes());
    }
    hasher.write_u64(node.inputs.len() as u64);
    for child in &node.inputs {
        hash_explain_node(child, hasher);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::analyze::analyze;
    use crate::query::metadata::StaticCatalog;
    use crate::query::parser::parse;
    use crate::storage::MemoryBackend;
    use serde_json::json;

    fn backend() -> MemoryBackend {
        let mut backend = MemoryBackend::new()
            .with_collection("users")
            .with_collection("orders");
        for i in 0..40 {
            let key = format!("u{i:02}");
            let city = if i % 4 == 0 { "Oslo" } else { "Rome" };
            backend = backend.with_document(
                "users",
                key.clone(),
                json!({"age": 20 + i, "city": city, "team": i % 2}).into(),
            );
            backend = backend.with_document(
                "orders",
                format!("o{i:02}"),
                json!({"user": key, "total": i * 10}).into(),
            );
        }
        backend
            .with_index("users", "city", IndexKind::Hash)
            .with_index("users", "age", IndexKind::Ordered)
    }

    fn plan_with(
        backend: &MemoryBackend,
        config: &EngineConfig,
        query: &str,
        allow_full_scan: bool,
    ) -> Result<QueryPlan, QueryError> {
        let catalog = StaticCatalog::new()
            .with_collection("users")
            .with_collection("orders");
        let ast = parse(query)?;
        let logical = analyze(&ast, &catalog, config)?;
        Planner::new(backend, backend, backend, config)
            .plan(logical, PlanOptions { allow_full_scan })
    }

    fn plan(backend: &MemoryBackend, query: &str) -> Result<QueryPlan, QueryError> {
        plan_with(backend, &EngineConfig::default(), query, false)
    }

    #[test]
    fn most_selective_index_drives_the_scan() {
        let backend = backend();
        let plan = plan(
            &backend,
            r#"FOR u IN users FILTER u.age >= 20 AND u.city == "Oslo" RETURN u"#,
        )
        .expect("plan");
        assert_eq!(plan.mode, ExecutionMode::IndexOptimized);
        let PlanShape::Single { conjunctions, .. } = &plan.shape else {
            panic!("single shape expected");
        };
        let first = &conjunctions[0];
        assert_eq!(first.access, Access::IndexScan { predicate: 0 });
        assert_eq!(first.predicates[0].predicate.kind.name(), "equality");
        assert_eq!(first.predicates[0].estimate, Some(Estimate::exact(10)));
        assert_eq!(first.predicates[1].estimate, Some(Estimate::exact(40)));
    }

    #[test]
    fn unindexed_filter_requires_permission() {
        let backend = backend();
        let err = plan(&backend, "FOR u IN users FILTER u.team == 1 RETURN u")
            .expect_err("no index on team");
        assert_eq!(err.code(), "INDEX_REQUIRED");
        assert!(err.to_string().contains("users.team"));

        let plan = plan_with(
            &backend,
            &EngineConfig::default(),
            "FOR u IN users FILTER u.team == 1 RETURN u",
            true,
        )
        .expect("allowed");
        assert_eq!(plan.mode, ExecutionMode::FullScanFallback);
    }

    #[test]
    fn sorted_sweep_uses_the_range_index_without_permission() {
        let backend = backend();
        let plan = plan(
            &backend,
            "FOR u IN users FILTER u.team == 1 SORT u.age DESC LIMIT 3 RETURN u",
        )
        .expect("plan");
        assert_eq!(plan.mode, ExecutionMode::IndexRangeAware);
        assert_eq!(
            plan.sort,
            SortStrategy::IndexOrder {
                column: "age".into(),
                descending: true
            }
        );
        assert!(plan.early_exit);
    }

    #[test]
    fn equal_estimates_scan_in_parallel() {
        let backend = backend().with_index("users", "team", IndexKind::Hash);
        let query = "FOR u IN users FILTER u.age < 40 AND u.team == 0 RETURN u";
        let plan = plan(&backend, query).expect("plan");
        let PlanShape::Single { conjunctions, .. } = &plan.shape else {
            panic!("single shape expected");
        };
        assert_eq!(conjunctions[0].predicates[0].estimate, Some(Estimate::exact(20)));
        assert_eq!(conjunctions[0].predicates[1].estimate, Some(Estimate::exact(20)));
        assert_eq!(plan.mode, ExecutionMode::IndexParallel);

        let mut config = EngineConfig::default();
        config.optimizer.parallel_scans = false;
        let serial = plan_with(&backend, &config, query, false).expect("plan");
        assert_eq!(serial.mode, ExecutionMode::IndexOptimized);
    }

    #[test]
    fn capped_estimates_sort_after_exact_ones() {
        let backend = backend();
        let mut config = EngineConfig::default();
        config.optimizer.estimate_sample_cap = 5;
        let plan = plan_with(
            &backend,
            &config,
            r#"FOR u IN users FILTER u.age > 0 AND u.team == 1 RETURN u"#,
            true,
        )
        .expect("plan");
        let order: Vec<(&str, bool)> = plan
            .predicate_order()
            .iter()
            .map(|p| (p.predicate.kind.name(), p.estimate.is_some_and(|e| e.capped)))
            .collect();
        assert_eq!(order, vec![("equality", true), ("range", true)]);
    }

    #[test]
    fn join_strategy_follows_the_memory_budget() {
        let backend = backend();
        let query = "FOR u IN users FOR o IN orders FILTER o.user == u._key RETURN [u, o]";
        let plan = plan(&backend, query).expect("plan");
        assert_eq!(plan.join_strategy, Some(JoinStrategy::HashJoin));

        let mut config = EngineConfig::default();
        config.optimizer.hash_join_memory_budget_bytes = 1024;
        let plan = plan_with(&backend, &config, query, false).expect("plan");
        assert_eq!(plan.join_strategy, Some(JoinStrategy::NestedLoop));
        assert!(plan.explain.find("NestedLoopJoin").is_some());
    }

    #[test]
    fn hash_join_builds_on_the_side_that_fits() {
        let backend = backend();
        let mut config = EngineConfig::default();
        config.optimizer.hash_join_memory_budget_bytes = 3000;
        let query = r#"FOR u IN users FOR o IN orders FILTER u.city == "Oslo" AND o.user == u._key RETURN [u, o]"#;
        let plan = plan_with(&backend, &config, query, false).expect("plan");
        assert_eq!(plan.join_strategy, Some(JoinStrategy::HashJoin));
        let PlanShape::Join { sources, steps, .. } = &plan.shape else {
            panic!("join shape expected");
        };
        assert_eq!(sources[0].estimate, Estimate::exact(10));
        assert_eq!(sources[1].estimate, Estimate::exact(40));
        assert_eq!(steps[0].build, BuildSide::Left);
        let join = plan.explain.find("HashJoin").expect("hash join node");
        assert_eq!(join.get("build"), Some("left"));

        let query = "FOR u IN users FOR o IN orders FILTER o.user == u._key RETURN [u, o]";
        let plan = self::plan(&backend, query).expect("plan");
        let PlanShape::Join { steps, .. } = &plan.shape else {
            panic!("join shape expected");
        };
        assert_eq!(steps[0].build, BuildSide::Right);
    }

    #[test]
    fn plan_hash_is_stable() {
        let backend = backend();
        let query = r#"FOR u IN users FILTER u.city == "Rome" RETURN u.age"#;
        let a = plan(&backend, query).expect("plan");
        let b = plan(&backend, query).expect("plan");
        assert_eq!(a.plan_hash, b.plan_hash);
        let c = plan(&backend, r#"FOR u IN users FILTER u.city == "Oslo" RETURN u.age"#)
            .expect("plan");
        assert_ne!(a.plan_hash, c.plan_hash);
    }

    #[test]
    fn ranked_predicates_need_their_index() {
        let backend = backend().with_collection("docs");
        let catalog = StaticCatalog::new().with_collection("docs");
        let config = EngineConfig::default();
        let ast = parse(r#"FOR d IN docs FILTER FULLTEXT(d.body, "rust") RETURN d"#).expect("parse");
        let logical = analyze(&ast, &catalog, &config).expect("analyze");
        let err = Planner::new(&backend, &backend, &backend, &config)
            .plan(logical, PlanOptions { allow_full_scan: true })
            .expect_err("no fulltext index");
        assert_eq!(err.code(), "INDEX_REQUIRED");
    }
}
