//! Query plan selected by the planner and its explain representation.

use serde::Serialize;

use crate::query::logical::{JoinKey, LogicalQuery, Predicate};
use crate::storage::Estimate;

/// How candidate rows are obtained.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum ExecutionMode {
    /// Index scans drive every conjunction.
    IndexOptimized,
    /// Several equally selective index scans run in parallel and are
    /// intersected.
    IndexParallel,
    /// A sweep in the order of the range index on the sort key.
    IndexRangeAware,
    /// A full collection sweep.
    FullScanFallback,
}

impl ExecutionMode {
    /// Explain spelling.
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionMode::IndexOptimized => "IndexOptimized",
            ExecutionMode::IndexParallel => "IndexParallel",
            ExecutionMode::IndexRangeAware => "IndexRangeAware",
            ExecutionMode::FullScanFallback => "FullScanFallback",
        }
    }
}

/// Predicate with its planning annotations.
#[derive(Clone, Debug, PartialEq)]
pub struct PlannedPredicate {
    /// Classified predicate.
    pub predicate: Predicate,
    /// Storage estimate when one was requested.
    pub estimate: Option<Estimate>,
    /// Whether an index can answer the predicate.
    pub indexed: bool,
}

impl PlannedPredicate {
    /// Cost used for ordering; unknown estimates count as worst case.
    pub fn ordering_cost(&self) -> u64 {
        self.estimate.map_or(u64::MAX, |e| e.ordering_cost())
    }
}

/// Access path of one conjunction or join input.
#[derive(Clone, Debug, PartialEq)]
pub enum Access {
    /// Scan through the index of one predicate.
    IndexScan {
        /// Position in the ordered predicate list.
        predicate: usize,
    },
    /// Parallel index scans intersected by key.
    ParallelIndexScan {
        /// Positions in the ordered predicate list.
        predicates: Vec<usize>,
    },
    /// Full-text and/or vector retrieval, fused into one ranking.
    RankedSearch {
        /// Position of the `FULLTEXT` predicate.
        fulltext: Option<usize>,
        /// Position of the `NEAR` predicate.
        vector: Option<usize>,
    },
    /// Whole collection in the order of an ordered index.
    OrderedSweep {
        /// Indexed column.
        column: String,
        /// Descending order.
        descending: bool,
    },
    /// Whole collection in key order.
    FullScan,
}

impl Access {
    /// Predicate positions satisfied by the access path itself.
    pub fn covered(&self) -> Vec<usize> {
        match self {
            Access::IndexScan { predicate } => vec![*predicate],
            Access::ParallelIndexScan { predicates } => predicates.clone(),
            Access::RankedSearch { fulltext, vector } => {
                fulltext.iter().chain(vector.iter()).copied().collect()
            }
            Access::OrderedSweep { .. } | Access::FullScan => Vec::new(),
        }
    }

    /// Explain operator name.
    pub fn op_name(&self) -> &'static str {
        match self {
            Access::IndexScan { .. } => "IndexScan",
            Access::ParallelIndexScan { .. } => "ParallelIndexScan",
            Access::RankedSearch { .. } => "RankedSearch",
            Access::OrderedSweep { .. } => "OrderedSweep",
            Access::FullScan => "FullScan",
        }
    }
}

/// Plan of one DNF conjunction over a single collection.
#[derive(Clone, Debug, PartialEq)]
pub struct ConjunctionPlan {
    /// Chosen mode.
    pub mode: ExecutionMode,
    /// Candidate source.
    pub access: Access,
    /// Predicates, most selective first.
    pub predicates: Vec<PlannedPredicate>,
}

/// One FOR input of a join.
#[derive(Clone, Debug, PartialEq)]
pub struct SourcePlan {
    /// Loop variable.
    pub variable: String,
    /// Collection.
    pub collection: String,
    /// Candidate source.
    pub access: Access,
    /// Mode of the access path.
    pub mode: ExecutionMode,
    /// Single-variable predicates evaluated on this input.
    pub predicates: Vec<PlannedPredicate>,
    /// Estimated input size.
    pub estimate: Estimate,
}

/// How two inputs are combined.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinStrategy {
    /// Build a hash table on the smaller input that fits the budget.
    HashJoin,
    /// Evaluate the join condition for every pair.
    NestedLoop,
}

/// Input a hash join builds its table on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildSide {
    /// Rows joined so far; the new source looks up matches.
    Left,
    /// The new source; joined rows look up matches.
    Right,
}

impl BuildSide {
    /// Lower-case name for explain output.
    pub fn as_str(self) -> &'static str {
        match self {
            BuildSide::Left => "left",
            BuildSide::Right => "right",
        }
    }
}

/// Left-deep join step adding source `right`.
#[derive(Clone, Debug, PartialEq)]
pub struct JoinStep {
    /// Index of the joined source.
    pub right: usize,
    /// Strategy.
    pub strategy: JoinStrategy,
    /// Hash table side; meaningful for [`JoinStrategy::HashJoin`].
    pub build: BuildSide,
    /// Equality driving a hash join.
    pub key: Option<JoinKey>,
}

/// Shape of the work to execute.
#[derive(Clone, Debug, PartialEq)]
pub enum PlanShape {
    /// One collection, one plan per conjunction; results are unioned.
    Single {
        /// Collection scanned.
        collection: String,
        /// Loop variable.
        variable: String,
        /// Plans per conjunction.
        conjunctions: Vec<ConjunctionPlan>,
    },
    /// Several collections joined left-deep.
    Join {
        /// Inputs in FOR order.
        sources: Vec<SourcePlan>,
        /// Join steps for sources `1..`.
        steps: Vec<JoinStep>,
        /// Filter evaluated on joined rows, as ordered conjunctions.
        residual: Vec<Vec<PlannedPredicate>>,
    },
    /// Breadth-first traversal.
    Traversal {
        /// Conjuncts on the vertex/edge used to prune the last level.
        prune: Vec<Predicate>,
    },
    /// Dijkstra shortest path.
    ShortestPath,
}

/// Ordering of the produced rows.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum SortStrategy {
    /// Source order: key order, join key order or traversal order.
    Natural,
    /// Rows already arrive in index order.
    IndexOrder {
        /// Indexed column.
        column: String,
        /// Descending order.
        descending: bool,
    },
    /// Materialize and sort.
    InMemory,
    /// Fused relevance, best first.
    Ranked,
}

/// Plan ready for execution.
#[derive(Clone, Debug)]
pub struct QueryPlan {
    /// Translated query.
    pub logical: LogicalQuery,
    /// Worst mode across the plan.
    pub mode: ExecutionMode,
    /// Work to execute.
    pub shape: PlanShape,
    /// Join strategy of the first join step, if any.
    pub join_strategy: Option<JoinStrategy>,
    /// Row ordering.
    pub sort: SortStrategy,
    /// LIMIT may stop production early.
    pub early_exit: bool,
    /// Deterministic hash of the explain tree.
    pub plan_hash: u64,
    /// Human-readable plan tree.
    pub explain: ExplainNode,
}

impl QueryPlan {
    /// Predicates in evaluation order, flattened across conjunctions.
    pub fn predicate_order(&self) -> Vec<&PlannedPredicate> {
        match &self.shape {
            PlanShape::Single { conjunctions, .. } => conjunctions
                .iter()
                .flat_map(|c| c.predicates.iter())
                .collect(),
            PlanShape::Join {
                sources, residual, ..
            } => sources
                .iter()
                .flat_map(|s| s.predicates.iter())
                .chain(residual.iter().flatten())
                .collect(),
            PlanShape::Traversal { .. } | PlanShape::ShortestPath => Vec::new(),
        }
    }

    /// Whether continuation cursors for this plan carry sort keys rather
    /// than a row offset.
    pub fn resumes_after(&self) -> bool {
        match self.sort {
            SortStrategy::Ranked => false,
            SortStrategy::Natural => {
                self.logical.collect.is_some()
                    || matches!(self.shape, PlanShape::Single { .. } | PlanShape::Join { .. })
            }
            SortStrategy::IndexOrder { .. } | SortStrategy::InMemory => true,
        }
    }

    /// Caller-facing description.
    pub fn describe(&self) -> PlanDescription {
        let predicate_order = match &self.shape {
            PlanShape::Traversal { .. } | PlanShape::ShortestPath => self
                .logical
                .filter
                .conjunctions
                .iter()
                .flat_map(|c| c.predicates.iter())
                .map(|p| PredicateDescription::unplanned(p))
                .collect(),
            _ => self
                .predicate_order()
                .into_iter()
                .map(PredicateDescription::from_planned)
                .collect(),
        };
        PlanDescription {
            mode: self.mode,
            plan_hash: format!("{:016x}", self.plan_hash),
            predicate_order,
            join_strategy: self.join_strategy.clone(),
            sort: self.sort.clone(),
            early_exit: self.early_exit,
            root: self.explain.clone(),
        }
    }
}

/// One predicate in the plan description.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PredicateDescription {
    /// Predicate kind.
    pub kind: &'static str,
    /// Rendered expression.
    pub expr: String,
    /// Estimated matches.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimate: Option<u64>,
    /// Estimate stopped at the sample cap.
    pub capped: bool,
    /// Answered by an index.
    pub indexed: bool,
}

impl PredicateDescription {
    fn from_planned(planned: &PlannedPredicate) -> Self {
        Self {
            kind: planned.predicate.kind.name(),
            expr: planned.predicate.expr.render(),
            estimate: planned.estimate.map(|e| e.count),
            capped: planned.estimate.is_some_and(|e| e.capped),
            indexed: planned.indexed,
        }
    }

    fn unplanned(predicate: &Predicate) -> Self {
        Self {
            kind: predicate.kind.name(),
            expr: predicate.expr.render(),
            estimate: None,
            capped: false,
            indexed: false,
        }
    }
}

/// Plan summary returned with explain responses.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PlanDescription {
    /// Overall mode.
    pub mode: ExecutionMode,
    /// Hex plan hash.
    pub plan_hash: String,
    /// Predicates in evaluation order.
    pub predicate_order: Vec<PredicateDescription>,
    /// First join strategy.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub join_strategy: Option<JoinStrategy>,
    /// Row ordering.
    pub sort: SortStrategy,
    /// LIMIT stops production early.
    pub early_exit: bool,
    /// Operator tree.
    pub root: ExplainNode,
}

/// Explain node representing an operator with optional metadata.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ExplainNode {
    /// Operator name
    pub op: String,
    /// Additional properties describing the operator
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub props: Vec<ExplainProp>,
    /// Input operators
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<ExplainNode>,
}

impl ExplainNode {
    /// Creates a new explain node with the given operator name.
    pub fn new(op: impl Into<String>) -> Self {
        Self {
            op: op.into(),
            props: Vec::new(),
            inputs: Vec::new(),
        }
    }

    /// Adds a property.
    pub fn prop(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.props.push(ExplainProp::plain(key, value));
        self
    }

    /// Adds a property holding query literals.
    pub fn literal(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.props.push(ExplainProp::literal(key, value));
        self
    }

    /// Adds an input.
    pub fn input(mut self, child: ExplainNode) -> Self {
        self.inputs.push(child);
        self
    }

    /// Finds the first node with the given operator, depth first.
    pub fn find(&self, op: &str) -> Option<&ExplainNode> {
        if self.op == op {
            return Some(self);
        }
        self.inputs.iter().find_map(|child| child.find(op))
    }

    /// Value of a property.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.props
            .iter()
            .find(|prop| prop.key == key)
            .map(|prop| prop.value.as_str())
    }

    /// Indented text rendering, one operator per line.
    pub fn render(&self) -> String {
        let mut out = String::new();
        self.render_into(0, &mut out);
        out
    }

    fn render_into(&self, depth: usize, out: &mut String) {
        out.push_str(&"  ".repeat(depth));
        out.push_str(&self.op);
        if !self.props.is_empty() {
            let props: Vec<String> = self
                .props
                .iter()
                .map(|p| format!("{}={}", p.key, p.value))
                .collect();
            out.push_str(" [");
            out.push_str(&props.join(", "));
            out.push(']');
        }
        out.push('\n');
        for child in &self.inputs {
            child.render_into(depth + 1, out);
        }
    }
}

/// Single property associated with an [`ExplainNode`].
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ExplainProp {
    /// Property key.
    pub key: String,
    /// Property value serialized for display.
    pub value: String,
    /// Whether this property contains literal data that may be redacted.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub redactable: bool,
}

impl ExplainProp {
    fn plain(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            redactable: false,
        }
    }

    fn literal(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            redactable: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explain_tree_renders_indented() {
        let tree = ExplainNode::new("Project")
            .literal("expr", "u.name")
            .input(ExplainNode::new("IndexScan").prop("column", "city"));
        assert_eq!(
            tree.render(),
            "Project [expr=u.name]\n  IndexScan [column=city]\n"
        );
        assert_eq!(
            tree.find("IndexScan").and_then(|n| n.get("column")),
            Some("city")
        );
    }

    #[test]
    fn worst_mode_orders_last() {
        let modes = [
            ExecutionMode::IndexParallel,
            ExecutionMode::FullScanFallback,
            ExecutionMode::IndexOptimized,
        ];
        assert_eq!(modes.iter().max(), Some(&ExecutionMode::FullScanFallback));
    }
}
