#![forbid(unsafe_code)]
#![allow(missing_docs)]

//! Predicate translation and semantic analysis.
//!
//! Walks the clauses in order, resolving names against the [`Catalog`],
//! inlining simple LET bindings, validating function calls, splitting off
//! constant and path-wide filters, and rewriting the remaining filter into a
//! bounded disjunctive normal form of classified predicates.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::ops::Bound;

use tracing::debug;

use crate::config::EngineConfig;
use crate::query::ast::{
    BinaryOperator, Clause, Expr, ForSource, QueryAst, SortKey, UnaryOperator,
};
use crate::query::errors::{closest_match, QueryError, SemanticError};
use crate::query::eval::eval_const;
use crate::query::functions::{self, coordinates, AggregateFn, FunctionKind, PathQuantifier};
use crate::query::logical::{
    Aggregate, Collect, Conjunction, Dnf, GraphVars, JoinKey, LetBinding, LogicalQuery,
    PathConstraint, Predicate, PredicateKind, ShortestPathSource, Source, TraversalSource,
};
use crate::query::metadata::{resolve_collection, resolve_graph, Catalog};
use crate::query::value::Value;
use crate::storage::Metric;

/// Hit limit of `FULLTEXT` calls without an explicit limit.
pub const DEFAULT_FULLTEXT_LIMIT: usize = 100;

/// Convenience alias for analyzer results.
pub type AnalyzeResult<T> = std::result::Result<T, SemanticError>;

/// Translates a parsed query into a [`LogicalQuery`].
pub fn analyze(
    ast: &QueryAst,
    catalog: &dyn Catalog,
    config: &EngineConfig,
) -> Result<LogicalQuery, QueryError> {
    Translator::new(catalog, config).run(ast)
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum VarKind {
    Collection,
    Graph,
    Let,
    Collected,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Position {
    Filter,
    Other,
}

struct Translator<'c> {
    catalog: &'c dyn Catalog,
    config: &'c EngineConfig,
    scope: Vec<(String, VarKind)>,
    substitutions: Vec<(String, Expr)>,
    sources: Vec<Source>,
    lets: Vec<LetBinding>,
    constant_filters: Vec<Expr>,
    filters: Vec<Expr>,
    collect: Option<Collect>,
    sort: Vec<SortKey>,
    limit: Option<crate::query::ast::LimitClause>,
    projection: Option<Expr>,
}

impl<'c> Translator<'c> {
    fn new(catalog: &'c dyn Catalog, config: &'c EngineConfig) -> Self {
        Self {
            catalog,
            config,
            scope: Vec::new(),
            substitutions: Vec::new(),
            sources: Vec::new(),
            lets: Vec::new(),
            constant_filters: Vec::new(),
            filters: Vec::new(),
            collect: None,
            sort: Vec::new(),
            limit: None,
            projection: None,
        }
    }

    fn run(mut self, ast: &QueryAst) -> Result<LogicalQuery, QueryError> {
        for clause in &ast.clauses {
            match clause {
                Clause::For(for_clause) => {
                    let source = self.source(for_clause)?;
                    let kind = match source {
                        Source::Collection { .. } => VarKind::Collection,
                        _ => VarKind::Graph,
                    };
                    for name in for_clause.variables() {
                        self.declare(name)?;
                        self.scope.push((name.to_owned(), kind));
                    }
                    self.sources.push(source);
                }
                Clause::Let(let_clause) => {
                    let value = self.rewrite(&let_clause.value, Position::Other)?;
                    self.declare(&let_clause.variable)?;
                    if value.variables().is_empty() {
                        let folded = eval_const(&value)?;
                        self.substitutions
                            .push((let_clause.variable.clone(), Expr::literal(folded)));
                        self.scope.push((let_clause.variable.clone(), VarKind::Let));
                    } else if matches!(value, Expr::FieldAccess { .. } | Expr::Variable { .. }) {
                        self.substitutions.push((let_clause.variable.clone(), value));
                        self.scope.push((let_clause.variable.clone(), VarKind::Let));
                    } else {
                        self.scope.push((let_clause.variable.clone(), VarKind::Let));
                        self.lets.push(LetBinding {
                            variable: let_clause.variable.clone(),
                            expr: value,
                        });
                    }
                }
                Clause::Filter(filter) => {
                    let condition = self.rewrite(&filter.condition, Position::Filter)?;
                    if condition.variables().is_empty() {
                        self.constant_filters.push(condition);
                    } else {
                        self.filters.push(condition);
                    }
                }
                Clause::Collect(collect) => {
                    let mut groups = Vec::with_capacity(collect.groups.len());
                    for (name, expr) in &collect.groups {
                        groups.push((name.clone(), self.rewrite(expr, Position::Other)?));
                    }
                    let mut aggregates = Vec::with_capacity(collect.aggregates.len());
                    for spec in &collect.aggregates {
                        let function = AggregateFn::from_name(&spec.function).ok_or_else(|| {
                            SemanticError::UnknownFunction {
                                name: spec.function.clone(),
                                suggestion: closest_match(
                                    &spec.function,
                                    AggregateFn::NAMES.iter().copied(),
                                ),
                            }
                        })?;
                        let parameters = spec
                            .parameters
                            .iter()
                            .map(|expr| {
                                expr.const_value().ok_or_else(|| SemanticError::InvalidArgument {
                                    function: spec.function.clone(),
                                    message: "extra arguments must be constants".into(),
                                })
                            })
                            .collect::<AnalyzeResult<Vec<_>>>()?;
                        let function = function.with_parameters(&parameters).map_err(|message| {
                            SemanticError::InvalidArgument {
                                function: spec.function.clone(),
                                message,
                            }
                        })?;
                        aggregates.push(Aggregate {
                            variable: spec.variable.clone(),
                            function,
                            argument: self.rewrite(&spec.argument, Position::Other)?,
                        });
                    }
                    self.scope.clear();
                    self.substitutions.clear();
                    for name in groups
                        .iter()
                        .map(|(name, _)| name)
                        .chain(aggregates.iter().map(|a| &a.variable))
                    {
                        self.declare(name)?;
                        self.scope.push((name.clone(), VarKind::Collected));
                    }
                    self.collect = Some(Collect { groups, aggregates });
                }
                Clause::Sort(sort) => {
                    for key in &sort.keys {
                        let expr = self.rewrite(&key.expr, Position::Other)?;
                        self.sort.push(SortKey {
                            expr,
                            direction: key.direction,
                        });
                    }
                }
                Clause::Limit(limit) => self.limit = Some(*limit),
                Clause::Return(ret) => {
                    let projection = self.rewrite(&ret.expr, Position::Other)?;
                    self.projection = Some(projection);
                }
            }
        }
        self.finish()
    }

    fn finish(self) -> Result<LogicalQuery, QueryError> {
        let has_graph = self
            .sources
            .iter()
            .any(|s| !matches!(s, Source::Collection { .. }));
        if has_graph && self.sources.len() > 1 {
            return Err(SemanticError::Unsupported {
                feature: "graph traversal combined with other FOR clauses".into(),
            }
            .into());
        }
        let projection = self.projection.clone().ok_or_else(|| SemanticError::Unsupported {
            feature: "query without RETURN".into(),
        })?;

        let mut path_constraints = Vec::new();
        let mut remaining = Vec::new();
        for filter in &self.filters {
            let mut conjuncts = Vec::new();
            flatten_and(filter, &mut conjuncts);
            for conjunct in conjuncts {
                match path_call(conjunct) {
                    Some((quantifier, condition)) => {
                        path_constraints.push(self.path_constraint(quantifier, condition)?);
                    }
                    None => {
                        if contains_call(conjunct, |kind| matches!(kind, FunctionKind::Path(_))) {
                            return Err(SemanticError::Unsupported {
                                feature: "PATH_ALL/PATH_NONE/PATH_ANY must be top-level FILTER conditions"
                                    .into(),
                            }
                            .into());
                        }
                        remaining.push(conjunct.clone());
                    }
                }
            }
        }

        let filter = match remaining
            .into_iter()
            .reduce(|acc, next| Expr::binary(BinaryOperator::And, acc, next))
        {
            Some(expr) => self.normalize(&expr)?,
            None => Dnf::always_true(),
        };
        let constant_filter = self
            .constant_filters
            .iter()
            .cloned()
            .reduce(|acc, next| Expr::binary(BinaryOperator::And, acc, next));

        debug!(
            conjunctions = filter.conjunctions.len(),
            fallback = filter.fallback,
            path_constraints = path_constraints.len(),
            constant = constant_filter.is_some(),
            "translated filter"
        );

        Ok(LogicalQuery {
            sources: self.sources,
            lets: self.lets,
            constant_filter,
            filter,
            path_constraints,
            collect: self.collect,
            sort: self.sort,
            limit: self.limit,
            projection,
        })
    }

    fn declare(&self, name: &str) -> AnalyzeResult<()> {
        if self.scope.iter().any(|(declared, _)| declared == name) {
            return Err(SemanticError::DuplicateVariable {
                name: name.to_owned(),
            });
        }
        Ok(())
    }

    fn kind_of(&self, name: &str) -> Option<VarKind> {
        self.scope
            .iter()
            .find(|(declared, _)| declared == name)
            .map(|(_, kind)| *kind)
    }

    fn source(&self, clause: &crate::query::ast::ForClause) -> AnalyzeResult<Source> {
        let vars = || GraphVars {
            vertex: clause.variable.clone(),
            edge: clause.edge_variable.clone(),
            path: clause.path_variable.clone(),
        };
        match &clause.source {
            ForSource::Collection { name } => {
                if clause.edge_variable.is_some() {
                    return Err(SemanticError::Unsupported {
                        feature: "edge and path variables on a collection loop".into(),
                    });
                }
                resolve_collection(self.catalog, name)?;
                Ok(Source::Collection {
                    variable: clause.variable.clone(),
                    collection: name.clone(),
                })
            }
            ForSource::Traversal(spec) => {
                resolve_graph(self.catalog, &spec.graph)?;
                let limit = self.config.traversal.max_depth;
                if spec.min_depth > spec.max_depth || spec.max_depth > limit {
                    return Err(SemanticError::InvalidDepth {
                        min: spec.min_depth,
                        max: spec.max_depth,
                        limit,
                    });
                }
                Ok(Source::Traversal(TraversalSource {
                    vars: vars(),
                    graph: spec.graph.clone(),
                    start: spec.start.clone(),
                    min_depth: spec.min_depth,
                    max_depth: spec.max_depth,
                    direction: spec.direction,
                    edge_type: spec.edge_type.clone(),
                }))
            }
            ForSource::ShortestPath(spec) => {
                resolve_graph(self.catalog, &spec.graph)?;
                if let Some(weight) = &spec.weight {
                    if weight.default < 0.0 || !weight.default.is_finite() {
                        return Err(SemanticError::NegativeWeight {
                            weight: weight.default.to_string(),
                        });
                    }
                }
                Ok(Source::ShortestPath(ShortestPathSource {
                    vars: vars(),
                    graph: spec.graph.clone(),
                    start: spec.start.clone(),
                    target: spec.target.clone(),
                    direction: spec.direction,
                    edge_type: spec.edge_type.clone(),
                    weight: spec.weight.clone(),
                }))
            }
        }
    }

    /// Inlines LET substitutions and validates variables and calls.
    fn rewrite(&self, expr: &Expr, position: Position) -> AnalyzeResult<Expr> {
        let mut rewritten = expr.clone();
        for (name, replacement) in self.substitutions.iter().rev() {
            rewritten = rewritten.substitute(name, replacement);
        }
        for name in rewritten.variables() {
            if self.kind_of(&name).is_none() {
                let known: Vec<&str> = self.scope.iter().map(|(n, _)| n.as_str()).collect();
                return Err(SemanticError::UnknownVariable {
                    suggestion: closest_match(&name, known),
                    name,
                });
            }
        }
        let mut calls: Vec<(&str, &[Expr])> = Vec::new();
        rewritten.visit_calls(&mut |name, args| calls.push((name, args)));
        for (name, args) in calls {
            let spec = functions::lookup(name).ok_or_else(|| SemanticError::UnknownFunction {
                name: name.to_owned(),
                suggestion: closest_match(name, functions::names()),
            })?;
            if !spec.accepts(args.len()) {
                return Err(SemanticError::Arity {
                    function: name.to_owned(),
                    expected: spec.expected(),
                    found: args.len(),
                });
            }
            match spec.kind {
                FunctionKind::Fulltext | FunctionKind::Near => {
                    if position != Position::Filter {
                        return Err(SemanticError::Unsupported {
                            feature: format!("{name} outside FILTER"),
                        });
                    }
                    self.ranked_kind(name, args)?;
                }
                FunctionKind::Path(_) if position != Position::Filter => {
                    return Err(SemanticError::Unsupported {
                        feature: format!("{name} outside FILTER"),
                    });
                }
                FunctionKind::Score => match args.first() {
                    Some(Expr::Variable { name: var })
                        if self.kind_of(var) == Some(VarKind::Collection) => {}
                    _ => {
                        return Err(SemanticError::InvalidArgument {
                            function: name.to_owned(),
                            message: "argument must be a collection loop variable".into(),
                        })
                    }
                },
                _ => {}
            }
        }
        Ok(rewritten)
    }

    fn ranked_kind(&self, name: &str, args: &[Expr]) -> AnalyzeResult<PredicateKind> {
        let invalid = |message: &str| SemanticError::InvalidArgument {
            function: name.to_owned(),
            message: message.to_owned(),
        };
        let (variable, column) = match args.first() {
            Some(Expr::FieldAccess { variable, path })
                if self.kind_of(variable) == Some(VarKind::Collection) =>
            {
                (variable.clone(), path.join("."))
            }
            _ => return Err(invalid("first argument must be a field of a collection loop variable")),
        };
        let positive = |arg: Option<&Expr>, what: &str| -> AnalyzeResult<Option<usize>> {
            match arg.map(Expr::const_value) {
                None => Ok(None),
                Some(Some(Value::Int(n))) if n > 0 => Ok(Some(n as usize)),
                Some(_) => Err(invalid(&format!("{what} must be a positive integer literal"))),
            }
        };
        if name == "FULLTEXT" {
            let query = match args.get(1).and_then(Expr::const_value) {
                Some(Value::String(query)) => query,
                _ => return Err(invalid("query must be a string literal")),
            };
            let limit = positive(args.get(2), "limit")?.unwrap_or(DEFAULT_FULLTEXT_LIMIT);
            return Ok(PredicateKind::Fulltext {
                variable,
                column,
                query,
                limit,
            });
        }
        let vector = match args.get(1).and_then(Expr::const_value) {
            Some(Value::Array(items)) if !items.is_empty() => items
                .iter()
                .map(Value::as_f64)
                .collect::<Option<Vec<f64>>>()
                .ok_or_else(|| invalid("vector must contain only numbers"))?,
            _ => return Err(invalid("vector must be a non-empty array literal")),
        };
        let k = positive(args.get(2), "k")?
            .ok_or_else(|| invalid("k must be a positive integer literal"))?;
        let metric = match args.get(3).map(Expr::const_value) {
            None => Metric::default(),
            Some(Some(Value::String(name))) => Metric::parse(&name)
                .ok_or_else(|| invalid("metric must be one of cosine, euclidean, dot"))?,
            Some(_) => return Err(invalid("metric must be a string literal")),
        };
        Ok(PredicateKind::NearestNeighbor {
            variable,
            column,
            vector,
            k,
            metric,
        })
    }

    fn path_constraint(
        &self,
        quantifier: PathQuantifier,
        condition: &Expr,
    ) -> AnalyzeResult<PathConstraint> {
        let vars = match self.sources.as_slice() {
            [Source::Traversal(t)] => &t.vars,
            [Source::ShortestPath(s)] => {
                if quantifier == PathQuantifier::Any {
                    return Err(SemanticError::Unsupported {
                        feature: "PATH_ANY with SHORTEST_PATH".into(),
                    });
                }
                &s.vars
            }
            _ => {
                return Err(SemanticError::Unsupported {
                    feature: "path constraints outside a graph traversal".into(),
                })
            }
        };
        let allowed: BTreeSet<&str> = std::iter::once(vars.vertex.as_str())
            .chain(vars.edge.as_deref())
            .collect();
        if let Some(stray) = condition
            .variables()
            .into_iter()
            .find(|var| !allowed.contains(var.as_str()))
        {
            return Err(SemanticError::InvalidArgument {
                function: format!("PATH_{quantifier:?}").to_uppercase(),
                message: format!("condition may only read the vertex and edge variables, not '{stray}'"),
            });
        }
        if contains_call(condition, |kind| {
            matches!(kind, FunctionKind::Fulltext | FunctionKind::Near)
        }) {
            return Err(SemanticError::Unsupported {
                feature: "ranked search inside a path constraint".into(),
            });
        }
        Ok(PathConstraint {
            quantifier,
            condition: condition.clone(),
        })
    }

    fn normalize(&self, expr: &Expr) -> AnalyzeResult<Dnf> {
        let budget = &self.config.translator;
        let clauses = to_nnf(expr, false, 0, budget.max_dnf_depth)
            .and_then(|nnf| distribute(nnf, budget.max_dnf_conjunctions));
        let Some(clauses) = clauses else {
            if contains_call(expr, |kind| {
                matches!(kind, FunctionKind::Fulltext | FunctionKind::Near)
            }) {
                return Err(SemanticError::Unsupported {
                    feature: "ranked search inside a filter too complex to normalize".into(),
                });
            }
            debug!("filter exceeded the normalization budget; evaluating it as a residual");
            return Ok(Dnf {
                conjunctions: vec![Conjunction {
                    predicates: vec![Predicate {
                        kind: PredicateKind::Residual {
                            variables: expr.variables(),
                        },
                        expr: expr.clone(),
                        join: None,
                    }],
                }],
                fallback: true,
            });
        };
        let mut conjunctions = Vec::with_capacity(clauses.len());
        for leaves in clauses {
            let mut predicates = Vec::with_capacity(leaves.len());
            for leaf in leaves {
                predicates.push(self.classify(leaf)?);
            }
            conjunctions.push(Conjunction {
                predicates: merge_ranges(predicates),
            });
        }
        Ok(Dnf {
            conjunctions,
            fallback: false,
        })
    }

    fn classify(&self, leaf: Expr) -> AnalyzeResult<Predicate> {
        if let Expr::FunctionCall { name, args } = &leaf {
            if name == "FULLTEXT" || name == "NEAR" {
                let kind = self.ranked_kind(name, args)?;
                return Ok(Predicate {
                    kind,
                    expr: leaf,
                    join: None,
                });
            }
        }
        if contains_call(&leaf, |kind| {
            matches!(kind, FunctionKind::Fulltext | FunctionKind::Near)
        }) {
            return Err(SemanticError::Unsupported {
                feature: "FULLTEXT and NEAR must appear as plain, non-negated FILTER conditions"
                    .into(),
            });
        }
        let mut join = None;
        let kind = if let Expr::BinaryOp { op, left, right } = &leaf {
            self.column_predicate(*op, left, right)
                .or_else(|| geo_predicate(*op, left, right))
                .unwrap_or_else(|| {
                    join = self.join_key(*op, left, right);
                    PredicateKind::Residual {
                        variables: leaf.variables(),
                    }
                })
        } else {
            PredicateKind::Residual {
                variables: leaf.variables(),
            }
        };
        Ok(Predicate {
            kind,
            expr: leaf,
            join,
        })
    }

    fn loop_field<'e>(&self, expr: &'e Expr) -> Option<(&'e str, String)> {
        match expr {
            Expr::FieldAccess { variable, path }
                if matches!(
                    self.kind_of(variable),
                    Some(VarKind::Collection | VarKind::Graph)
                ) =>
            {
                Some((variable, path.join(".")))
            }
            _ => None,
        }
    }

    fn column_predicate(&self, op: BinaryOperator, left: &Expr, right: &Expr) -> Option<PredicateKind> {
        let (op, field, value) = match (self.loop_field(left), right.const_value()) {
            (Some(field), Some(value)) => (op, field, value),
            _ => match (left.const_value(), self.loop_field(right)) {
                (Some(value), Some(field)) if op != BinaryOperator::In => (op.flipped()?, field, value),
                _ => return None,
            },
        };
        let (variable, column) = (field.0.to_owned(), field.1);
        Some(match op {
            BinaryOperator::Eq => PredicateKind::Equality {
                variable,
                column,
                value,
            },
            BinaryOperator::Lt => range(variable, column, Bound::Unbounded, Bound::Excluded(value)),
            BinaryOperator::Le => range(variable, column, Bound::Unbounded, Bound::Included(value)),
            BinaryOperator::Gt => range(variable, column, Bound::Excluded(value), Bound::Unbounded),
            BinaryOperator::Ge => range(variable, column, Bound::Included(value), Bound::Unbounded),
            BinaryOperator::In => match value {
                Value::Array(values) => PredicateKind::SetMembership {
                    variable,
                    column,
                    values,
                },
                _ => return None,
            },
            _ => return None,
        })
    }

    fn join_key(&self, op: BinaryOperator, left: &Expr, right: &Expr) -> Option<JoinKey> {
        if op != BinaryOperator::Eq {
            return None;
        }
        let (lv, lc) = self.loop_field(left)?;
        let (rv, rc) = self.loop_field(right)?;
        let collection_var = |v: &str| self.kind_of(v) == Some(VarKind::Collection);
        (lv != rv && collection_var(lv) && collection_var(rv)).then(|| JoinKey {
            left_variable: lv.to_owned(),
            left_column: lc,
            right_variable: rv.to_owned(),
            right_column: rc,
        })
    }
}

fn range(variable: String, column: String, lo: Bound<Value>, hi: Bound<Value>) -> PredicateKind {
    PredicateKind::Range {
        variable,
        column,
        lo,
        hi,
    }
}

fn geo_predicate(op: BinaryOperator, left: &Expr, right: &Expr) -> Option<PredicateKind> {
    let (op, call, radius) = match (left, right) {
        (Expr::FunctionCall { .. }, other) => (op, left, other),
        (other, Expr::FunctionCall { .. }) => (op.flipped()?, right, other),
        _ => return None,
    };
    if !matches!(op, BinaryOperator::Lt | BinaryOperator::Le) {
        return None;
    }
    let Expr::FunctionCall { name, args } = call else {
        return None;
    };
    if name != "GEO_DISTANCE" {
        return None;
    }
    let Some(Expr::FieldAccess { variable, path }) = args.first() else {
        return None;
    };
    let center = coordinates(&args.get(1)?.const_value()?)?;
    let radius_m = radius.const_value()?.as_f64()?;
    Some(PredicateKind::Geo {
        variable: variable.clone(),
        column: path.join("."),
        center,
        radius_m,
    })
}

fn flatten_and<'e>(expr: &'e Expr, out: &mut Vec<&'e Expr>) {
    match expr {
        Expr::BinaryOp {
            op: BinaryOperator::And,
            left,
            right,
        } => {
            flatten_and(left, out);
            flatten_and(right, out);
        }
        other => out.push(other),
    }
}

fn path_call(expr: &Expr) -> Option<(PathQuantifier, &Expr)> {
    let Expr::FunctionCall { name, args } = expr else {
        return None;
    };
    match functions::lookup(name)?.kind {
        FunctionKind::Path(quantifier) => Some((quantifier, args.first()?)),
        _ => None,
    }
}

fn contains_call(expr: &Expr, mut pred: impl FnMut(FunctionKind) -> bool) -> bool {
    let mut found = false;
    expr.visit_calls(&mut |name, _| {
        if let Some(spec) = functions::lookup(name) {
            found |= pred(spec.kind);
        }
    });
    found
}

/// Boolean tree with negations pushed to the leaves.
#[derive(Debug)]
enum Nnf {
    Leaf(Expr),
    Const(bool),
    And(Vec<Nnf>),
    Or(Vec<Nnf>),
}

/// Pushes NOT to the leaves with De Morgan's laws; `None` past `max_depth`.
fn to_nnf(expr: &Expr, negate: bool, depth: usize, max_depth: usize) -> Option<Nnf> {
    if depth > max_depth {
        return None;
    }
    let next = depth + 1;
    Some(match expr {
        Expr::BinaryOp { op, left, right }
            if matches!(op, BinaryOperator::And | BinaryOperator::Or) =>
        {
            let l = to_nnf(left, negate, next, max_depth)?;
            let r = to_nnf(right, negate, next, max_depth)?;
            let conjunctive = (*op == BinaryOperator::And) != negate;
            if conjunctive {
                Nnf::And(vec![l, r])
            } else {
                Nnf::Or(vec![l, r])
            }
        }
        Expr::UnaryOp {
            op: UnaryOperator::Not,
            operand,
        } => to_nnf(operand, !negate, next, max_depth)?,
        Expr::Literal { value } => Nnf::Const(value.is_truthy() != negate),
        Expr::BinaryOp { op, left, right } if negate => match op.negated() {
            Some(negated) => Nnf::Leaf(Expr::binary(
                negated,
                left.as_ref().clone(),
                right.as_ref().clone(),
            )),
            None => Nnf::Leaf(Expr::not(expr.clone())),
        },
        other if negate => Nnf::Leaf(Expr::not(other.clone())),
        other => Nnf::Leaf(other.clone()),
    })
}

/// Distributes AND over OR; `None` once more than `max` conjunctions appear.
fn distribute(node: Nnf, max: usize) -> Option<Vec<Vec<Expr>>> {
    match node {
        Nnf::Leaf(expr) => Some(vec![vec![expr]]),
        Nnf::Const(true) => Some(vec![Vec::new()]),
        Nnf::Const(false) => Some(Vec::new()),
        Nnf::Or(children) => {
            let mut out = Vec::new();
            for child in children {
                out.extend(distribute(child, max)?);
                if out.len() > max {
                    return None;
                }
            }
            Some(out)
        }
        Nnf::And(children) => {
            let mut acc: Vec<Vec<Expr>> = vec![Vec::new()];
            for child in children {
                let rhs = distribute(child, max)?;
                if acc.len().saturating_mul(rhs.len()) > max {
                    return None;
                }
                let mut next = Vec::with_capacity(acc.len() * rhs.len());
                for left in &acc {
                    for right in &rhs {
                        let mut merged = left.clone();
                        merged.extend(right.iter().cloned());
                        next.push(merged);
                    }
                }
                acc = next;
            }
            Some(acc)
        }
    }
}

/// Combines range predicates on the same column into one.
fn merge_ranges(predicates: Vec<Predicate>) -> Vec<Predicate> {
    let mut out: Vec<Predicate> = Vec::with_capacity(predicates.len());
    for predicate in predicates {
        match predicate.kind {
            PredicateKind::Range {
                variable,
                column,
                lo,
                hi,
            } => {
                let existing = out.iter_mut().find(|p| {
                    matches!(&p.kind, PredicateKind::Range { variable: v, column: c, .. } if *v == variable && *c == column)
                });
                match existing {
                    Some(Predicate {
                        kind: PredicateKind::Range { lo: elo, hi: ehi, .. },
                        expr,
                        ..
                    }) => {
                        *elo = tighter(elo.clone(), lo, Ordering::Greater);
                        *ehi = tighter(ehi.clone(), hi, Ordering::Less);
                        *expr = Expr::binary(BinaryOperator::And, expr.clone(), predicate.expr);
                    }
                    _ => out.push(Predicate {
                        kind: PredicateKind::Range {
                            variable,
                            column,
                            lo,
                            hi,
                        },
                        expr: predicate.expr,
                        join: predicate.join,
                    }),
                }
            }
            kind => out.push(Predicate {
                kind,
                expr: predicate.expr,
                join: predicate.join,
            }),
        }
    }
    out
}

/// Picks the more restrictive bound; `prefer` is the ordering that wins.
fn tighter(a: Bound<Value>, b: Bound<Value>, prefer: Ordering) -> Bound<Value> {
    let (va, vb) = match (&a, &b) {
        (Bound::Unbounded, _) => return b,
        (_, Bound::Unbounded) => return a,
        (Bound::Included(va) | Bound::Excluded(va), Bound::Included(vb) | Bound::Excluded(vb)) => {
            (va, vb)
        }
    };
    match va.cmp(vb) {
        Ordering::Equal => {
            if matches!(a, Bound::Excluded(_)) {
                a
            } else {
                b
            }
        }
        ord if ord == prefer => a,
        _ => b,
    }
}
