//! Logical query produced by the predicate translator and consumed by the
//! planner.

use std::collections::BTreeSet;
use std::ops::Bound;

use serde::Serialize;

use crate::query::ast::{BinaryOperator, Direction, Expr, LimitClause, SortKey, WeightSpec};
use crate::query::functions::{AggregateFn, PathQuantifier};
use crate::query::value::Value;
use crate::storage::Metric;

/// Data source bound by a FOR clause.
#[derive(Clone, Debug, PartialEq)]
pub enum Source {
    /// Collection scan bound to `variable`.
    Collection {
        /// Loop variable.
        variable: String,
        /// Collection name.
        collection: String,
    },
    /// Breadth-first traversal.
    Traversal(TraversalSource),
    /// Dijkstra shortest path.
    ShortestPath(ShortestPathSource),
}

impl Source {
    /// Variable holding the document or vertex.
    pub fn variable(&self) -> &str {
        match self {
            Source::Collection { variable, .. } => variable,
            Source::Traversal(t) => &t.vars.vertex,
            Source::ShortestPath(s) => &s.vars.vertex,
        }
    }

    /// Collection name for collection sources.
    pub fn collection(&self) -> Option<&str> {
        match self {
            Source::Collection { collection, .. } => Some(collection),
            _ => None,
        }
    }
}

/// Variables introduced by a graph FOR clause.
#[derive(Clone, Debug, PartialEq)]
pub struct GraphVars {
    /// Vertex variable.
    pub vertex: String,
    /// Incoming edge variable.
    pub edge: Option<String>,
    /// Path variable.
    pub path: Option<String>,
}

/// Traversal parameters after validation.
#[derive(Clone, Debug, PartialEq)]
pub struct TraversalSource {
    /// Bound variables.
    pub vars: GraphVars,
    /// Graph name.
    pub graph: String,
    /// Start vertex key.
    pub start: String,
    /// Smallest depth producing rows.
    pub min_depth: u32,
    /// Deepest level explored.
    pub max_depth: u32,
    /// Adjacency direction.
    pub direction: Direction,
    /// Optional edge type filter.
    pub edge_type: Option<String>,
}

/// Shortest path parameters after validation.
#[derive(Clone, Debug, PartialEq)]
pub struct ShortestPathSource {
    /// Bound variables.
    pub vars: GraphVars,
    /// Graph name.
    pub graph: String,
    /// Start vertex key.
    pub start: String,
    /// Target vertex key.
    pub target: String,
    /// Adjacency direction.
    pub direction: Direction,
    /// Optional edge type filter.
    pub edge_type: Option<String>,
    /// Weight attribute; unit weights when absent.
    pub weight: Option<WeightSpec>,
}

/// Path-wide traversal constraint (`PATH_ALL`, `PATH_NONE`, `PATH_ANY`).
#[derive(Clone, Debug, PartialEq)]
pub struct PathConstraint {
    /// Quantifier over the hops of a path.
    pub quantifier: PathQuantifier,
    /// Condition evaluated per hop with the vertex and edge variables bound.
    pub condition: Expr,
}

/// Equality between fields of two different loop variables.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct JoinKey {
    /// Left variable.
    pub left_variable: String,
    /// Left column.
    pub left_column: String,
    /// Right variable.
    pub right_variable: String,
    /// Right column.
    pub right_column: String,
}

impl JoinKey {
    /// Column of `variable` participating in the join.
    pub fn column_for(&self, variable: &str) -> Option<&str> {
        if self.left_variable == variable {
            Some(&self.left_column)
        } else if self.right_variable == variable {
            Some(&self.right_column)
        } else {
            None
        }
    }
}

/// Classified predicate.
#[derive(Clone, Debug, PartialEq)]
pub enum PredicateKind {
    /// `var.column == value`.
    Equality {
        /// Loop variable.
        variable: String,
        /// Dotted column.
        column: String,
        /// Compared value.
        value: Value,
    },
    /// `lo <(=) var.column <(=) hi`.
    Range {
        /// Loop variable.
        variable: String,
        /// Dotted column.
        column: String,
        /// Lower bound.
        lo: Bound<Value>,
        /// Upper bound.
        hi: Bound<Value>,
    },
    /// `var.column IN [values]`.
    SetMembership {
        /// Loop variable.
        variable: String,
        /// Dotted column.
        column: String,
        /// Accepted values.
        values: Vec<Value>,
    },
    /// `FULLTEXT(var.column, query, limit)`.
    Fulltext {
        /// Loop variable.
        variable: String,
        /// Dotted column.
        column: String,
        /// Search text.
        query: String,
        /// Maximum hits.
        limit: usize,
    },
    /// `NEAR(var.column, vector, k, metric)`.
    NearestNeighbor {
        /// Loop variable.
        variable: String,
        /// Dotted column.
        column: String,
        /// Query vector.
        vector: Vec<f64>,
        /// Number of neighbors.
        k: usize,
        /// Distance metric.
        metric: Metric,
    },
    /// `GEO_DISTANCE(var.column, [lat, lon]) <(=) radius`.
    Geo {
        /// Loop variable.
        variable: String,
        /// Dotted column.
        column: String,
        /// Center point.
        center: (f64, f64),
        /// Radius in meters.
        radius_m: f64,
    },
    /// Anything else, interpreted per candidate.
    Residual {
        /// Variables read by the expression.
        variables: BTreeSet<String>,
    },
}

impl PredicateKind {
    /// Short name used in explain output and tie breaking.
    pub fn name(&self) -> &'static str {
        match self {
            PredicateKind::Equality { .. } => "equality",
            PredicateKind::Range { .. } => "range",
            PredicateKind::SetMembership { .. } => "set_membership",
            PredicateKind::Fulltext { .. } => "fulltext",
            PredicateKind::NearestNeighbor { .. } => "nearest_neighbor",
            PredicateKind::Geo { .. } => "geo",
            PredicateKind::Residual { .. } => "residual",
        }
    }

    /// Tie-break preference when estimates are equal; lower wins.
    pub fn preference(&self) -> u8 {
        match self {
            PredicateKind::Equality { .. } => 0,
            PredicateKind::Range { .. } => 1,
            PredicateKind::SetMembership { .. } => 2,
            PredicateKind::Fulltext { .. } => 3,
            PredicateKind::NearestNeighbor { .. } => 4,
            PredicateKind::Geo { .. } => 5,
            PredicateKind::Residual { .. } => 6,
        }
    }

    /// Single loop variable the predicate restricts, if classified.
    pub fn variable(&self) -> Option<&str> {
        match self {
            PredicateKind::Equality { variable, .. }
            | PredicateKind::Range { variable, .. }
            | PredicateKind::SetMembership { variable, .. }
            | PredicateKind::Fulltext { variable, .. }
            | PredicateKind::NearestNeighbor { variable, .. }
            | PredicateKind::Geo { variable, .. } => Some(variable),
            PredicateKind::Residual { .. } => None,
        }
    }

    /// Column the predicate restricts, if classified.
    pub fn column(&self) -> Option<&str> {
        match self {
            PredicateKind::Equality { column, .. }
            | PredicateKind::Range { column, .. }
            | PredicateKind::SetMembership { column, .. }
            | PredicateKind::Fulltext { column, .. }
            | PredicateKind::NearestNeighbor { column, .. }
            | PredicateKind::Geo { column, .. } => Some(column),
            PredicateKind::Residual { .. } => None,
        }
    }

    /// Whether the predicate produces a ranking.
    pub fn is_ranked(&self) -> bool {
        matches!(
            self,
            PredicateKind::Fulltext { .. } | PredicateKind::NearestNeighbor { .. }
        )
    }
}

/// Classified leaf together with the expression it came from.
#[derive(Clone, Debug, PartialEq)]
pub struct Predicate {
    /// Classification.
    pub kind: PredicateKind,
    /// Expression evaluated when the predicate is applied as a filter.
    pub expr: Expr,
    /// Set for field-to-field equalities between two loop variables.
    pub join: Option<JoinKey>,
}

impl Predicate {
    /// Variables the predicate reads.
    pub fn variables(&self) -> BTreeSet<String> {
        match &self.kind {
            PredicateKind::Residual { variables } => variables.clone(),
            kind => kind
                .variable()
                .map(|v| BTreeSet::from([v.to_owned()]))
                .unwrap_or_default(),
        }
    }
}

/// AND-group of predicates.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Conjunction {
    /// Predicates in translation order; the planner reorders them.
    pub predicates: Vec<Predicate>,
}

impl Conjunction {
    /// The conjunction as one expression (`true` when empty).
    pub fn to_expr(&self) -> Expr {
        self.predicates
            .iter()
            .map(|p| p.expr.clone())
            .reduce(|acc, next| Expr::binary(BinaryOperator::And, acc, next))
            .unwrap_or_else(|| Expr::literal(true))
    }
}

/// Filter in disjunctive normal form.
///
/// No conjunctions means "always false"; one empty conjunction means
/// "always true".
#[derive(Clone, Debug, PartialEq)]
pub struct Dnf {
    /// OR of these conjunctions.
    pub conjunctions: Vec<Conjunction>,
    /// Budget was exceeded and the filter is one residual predicate.
    pub fallback: bool,
}

impl Dnf {
    /// Always-true filter.
    pub fn always_true() -> Self {
        Self {
            conjunctions: vec![Conjunction::default()],
            fallback: false,
        }
    }

    /// Whether the filter accepts everything.
    pub fn is_true(&self) -> bool {
        self.conjunctions.iter().any(|c| c.predicates.is_empty())
    }

    /// Whether the filter rejects everything.
    pub fn is_false(&self) -> bool {
        self.conjunctions.is_empty()
    }

    /// The DNF as one expression.
    pub fn to_expr(&self) -> Expr {
        self.conjunctions
            .iter()
            .map(Conjunction::to_expr)
            .reduce(|acc, next| Expr::binary(BinaryOperator::Or, acc, next))
            .unwrap_or_else(|| Expr::literal(false))
    }

    /// Whether any predicate ranks results.
    pub fn is_ranked(&self) -> bool {
        self.conjunctions
            .iter()
            .flat_map(|c| c.predicates.iter())
            .any(|p| p.kind.is_ranked())
    }
}

/// LET evaluated per row.
#[derive(Clone, Debug, PartialEq)]
pub struct LetBinding {
    /// Bound name.
    pub variable: String,
    /// Expression.
    pub expr: Expr,
}

/// Aggregate after validation.
#[derive(Clone, Debug, PartialEq)]
pub struct Aggregate {
    /// Output variable.
    pub variable: String,
    /// Aggregate function.
    pub function: AggregateFn,
    /// Argument evaluated per input row.
    pub argument: Expr,
}

/// COLLECT after validation.
#[derive(Clone, Debug, PartialEq)]
pub struct Collect {
    /// Group variables and their key expressions.
    pub groups: Vec<(String, Expr)>,
    /// Aggregates per group.
    pub aggregates: Vec<Aggregate>,
}

/// Translator output.
#[derive(Clone, Debug, PartialEq)]
pub struct LogicalQuery {
    /// FOR sources in declaration order.
    pub sources: Vec<Source>,
    /// Runtime LET bindings in declaration order.
    pub lets: Vec<LetBinding>,
    /// Filters that read no loop variable, AND-ed.
    pub constant_filter: Option<Expr>,
    /// Remaining filter in DNF.
    pub filter: Dnf,
    /// Path-wide constraints of a traversal.
    pub path_constraints: Vec<PathConstraint>,
    /// Grouping stage.
    pub collect: Option<Collect>,
    /// Sort keys.
    pub sort: Vec<SortKey>,
    /// Offset and count.
    pub limit: Option<LimitClause>,
    /// RETURN expression.
    pub projection: Expr,
}

impl LogicalQuery {
    /// Whether any clause after the sources reads `variable`.
    pub fn references(&self, variable: &str) -> bool {
        let filter = self.filter.to_expr();
        let mut exprs: Vec<&Expr> = vec![&self.projection, &filter];
        exprs.extend(self.lets.iter().map(|l| &l.expr));
        exprs.extend(self.sort.iter().map(|k| &k.expr));
        if let Some(collect) = &self.collect {
            exprs.extend(collect.groups.iter().map(|(_, e)| e));
            exprs.extend(collect.aggregates.iter().map(|a| &a.argument));
        }
        exprs
            .iter()
            .any(|expr| expr.variables().contains(variable))
    }
}
