//! Breadth-first traversal with last-level pruning, and Dijkstra shortest
//! path, over the [`GraphIndex`] collaborator.
//!
//! Both produce a [`Traversal`]: an arena of visited vertices (dense ids,
//! parent links for path reconstruction) plus the ids of the vertices that
//! become rows, in output order.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, trace, warn};

use crate::query::ast::{Direction, WeightSpec};
use crate::query::errors::RuntimeError;
use crate::query::eval::{Bindings, EvalTrace, Evaluator};
use crate::query::executor::ExecContext;
use crate::query::functions::{object, PathQuantifier};
use crate::query::logical::{
    GraphVars, PathConstraint, Predicate, ShortestPathSource, TraversalSource,
};
use crate::query::profile::{profile_timer, record_profile_timer, Metrics, QueryProfileKind};
use crate::query::value::Value;
use crate::storage::{GraphIndex, Neighbor};

/// Dense vertex id within one traversal.
pub type VisitId = u32;

#[derive(Clone, Debug)]
struct Visit {
    key: String,
    doc: Value,
    parent: Option<VisitId>,
    edge: Option<Value>,
    depth: u32,
    any_satisfied: bool,
}

/// Result of a traversal.
#[derive(Clone, Debug, Default)]
pub struct Traversal {
    visits: Vec<Visit>,
    /// Vertices producing rows, in output order.
    pub rows: Vec<VisitId>,
}

impl Traversal {
    fn push(&mut self, visit: Visit) -> VisitId {
        self.visits.push(visit);
        (self.visits.len() - 1) as VisitId
    }

    fn visit(&self, id: VisitId) -> &Visit {
        &self.visits[id as usize]
    }

    /// Key of a visited vertex.
    pub fn key(&self, id: VisitId) -> &str {
        &self.visit(id).key
    }

    /// Depth at which the vertex was reached.
    pub fn depth(&self, id: VisitId) -> u32 {
        self.visit(id).depth
    }

    /// Binds the vertex, its incoming edge and optionally the path.
    pub fn bindings(&self, id: VisitId, vars: &GraphVars, with_path: bool) -> Bindings {
        let visit = self.visit(id);
        let mut row = Bindings::new().with(vars.vertex.clone(), visit.doc.clone());
        if let Some(edge_var) = &vars.edge {
            row.bind(edge_var.clone(), visit.edge.clone().unwrap_or(Value::Null));
        }
        if with_path {
            if let Some(path_var) = &vars.path {
                row.bind(path_var.clone(), self.path(id));
            }
        }
        row
    }

    /// `{vertices, edges, length}` from the start vertex to `id`.
    pub fn path(&self, id: VisitId) -> Value {
        let mut vertices = Vec::new();
        let mut edges = Vec::new();
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            let visit = self.visit(current);
            vertices.push(visit.doc.clone());
            if let Some(edge) = &visit.edge {
                edges.push(edge.clone());
            }
            cursor = visit.parent;
        }
        vertices.reverse();
        edges.reverse();
        let length = edges.len() as i64;
        object([
            ("vertices", Value::Array(vertices)),
            ("edges", Value::Array(edges)),
            ("length", Value::Int(length)),
        ])
    }
}

fn fetch_vertex(graph: &dyn GraphIndex, name: &str, key: &str) -> Result<Value, RuntimeError> {
    let doc = graph
        .vertex(name, key)
        .map_err(|err| RuntimeError::collaborator("graph index", &err, format!("vertex {key}")))?;
    Ok(doc.unwrap_or_else(|| object([("_key", Value::from(key))])))
}

fn adjacency(
    graph: &dyn GraphIndex,
    name: &str,
    key: &str,
    direction: Direction,
    edge_type: Option<&str>,
) -> Result<Vec<Neighbor>, RuntimeError> {
    let timer = profile_timer();
    let result = graph
        .adjacency(name, key, direction, edge_type)
        .map_err(|err| RuntimeError::collaborator("graph index", &err, format!("adjacency of {key}")));
    record_profile_timer(QueryProfileKind::Expand, timer);
    result
}

/// Outcome of the per-hop path constraint checks.
enum HopCheck {
    Rejected,
    Accepted { any_satisfied: bool },
}

fn check_hop(
    constraints: &[PathConstraint],
    hop: &Bindings,
    inherited_any: bool,
) -> Result<HopCheck, RuntimeError> {
    let evaluator = Evaluator::new();
    let mut any_satisfied = inherited_any;
    for constraint in constraints {
        let holds = evaluator.test(&constraint.condition, hop, &mut EvalTrace::default())?;
        match constraint.quantifier {
            PathQuantifier::All if !holds => return Ok(HopCheck::Rejected),
            PathQuantifier::None if holds => return Ok(HopCheck::Rejected),
            PathQuantifier::Any => any_satisfied |= holds,
            PathQuantifier::All | PathQuantifier::None => {}
        }
    }
    Ok(HopCheck::Accepted { any_satisfied })
}

fn hop_bindings(vars: &GraphVars, doc: &Value, edge: &Value) -> Bindings {
    let mut hop = Bindings::new().with(vars.vertex.clone(), doc.clone());
    if let Some(edge_var) = &vars.edge {
        hop.bind(edge_var.clone(), edge.clone());
    }
    hop
}

/// Evaluates the prune conjuncts; `false` means the candidate is dropped.
fn survives_pruning(
    prune: &[Predicate],
    hop: &Bindings,
    ctx: &mut ExecContext<'_>,
) -> Result<bool, RuntimeError> {
    let evaluator = Evaluator::new();
    let mut trace = EvalTrace::default();
    let mut passed = true;
    for (i, predicate) in prune.iter().enumerate() {
        if !evaluator.test(&predicate.expr, hop, &mut trace)? {
            passed = false;
            if i + 1 < prune.len() {
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
    Ok(passed)
}

/// Level-order traversal from `source.start`.
///
/// A vertex is visited at most once. Rows are emitted at discovery for
/// depths within `min_depth..=max_depth`; vertices at `max_depth` are not
/// expanded. `prune` conjuncts are only applied to candidates at the last
/// level, where dropping a vertex cannot hide deeper results. With
/// `row_limit` the walk stops once that many rows were emitted.
pub fn breadth_first(
    graph: &dyn GraphIndex,
    source: &TraversalSource,
    constraints: &[PathConstraint],
    prune: &[Predicate],
    row_limit: Option<usize>,
    ctx: &mut ExecContext<'_>,
) -> Result<Traversal, RuntimeError> {
    let has_any = constraints
        .iter()
        .any(|c| c.quantifier == PathQuantifier::Any);
    let max_frontier = ctx.config.traversal.max_frontier_size;
    let mut out = Traversal::default();
    let mut visited: FxHashSet<String> = FxHashSet::default();
    let mut frontier: VecDeque<VisitId> = VecDeque::new();
    let mut warned = false;

    let start = out.push(Visit {
        key: source.start.clone(),
        doc: fetch_vertex(graph, &source.graph, &source.start)?,
        parent: None,
        edge: None,
        depth: 0,
        any_satisfied: false,
    });
    visited.insert(source.start.clone());
    ctx.record(|m| Metrics::bump(&mut m.enqueued_per_depth, 0, 1));
    if source.min_depth == 0 && !has_any {
        out.rows.push(start);
    }
    if source.max_depth > 0 {
        frontier.push_back(start);
    }

    let complete = |out: &Traversal| row_limit.is_some_and(|limit| out.rows.len() >= limit);
    'walk: while let Some(current) = frontier.pop_front() {
        if complete(&out) {
            break;
        }
        ctx.deadline.check()?;
        let (key, depth, inherited_any) = {
            let visit = out.visit(current);
            (visit.key.clone(), visit.depth, visit.any_satisfied)
        };
        ctx.record(|m| Metrics::bump(&mut m.frontier_processed_per_depth, depth, 1));
        let next_depth = depth + 1;
        let last_level = next_depth == source.max_depth;

        let neighbors = adjacency(
            graph,
            &source.graph,
            &key,
            source.direction,
            source.edge_type.as_deref(),
        )?;
        ctx.record(|m| m.edges_expanded += neighbors.len() as u64);

        for neighbor in neighbors {
            if visited.contains(&neighbor.vertex) {
                continue;
            }
            let doc = fetch_vertex(graph, &source.graph, &neighbor.vertex)?;
            let hop = hop_bindings(&source.vars, &doc, &neighbor.edge);
            let any_satisfied = match check_hop(constraints, &hop, inherited_any)? {
                HopCheck::Rejected => {
                    ctx.record(|m| m.path_constraint_rejections += 1);
                    continue;
                }
                HopCheck::Accepted { any_satisfied } => any_satisfied,
            };
            if last_level && !prune.is_empty() && !survives_pruning(prune, &hop, ctx)? {
                visited.insert(neighbor.vertex);
                ctx.record(|m| m.pruned_last_level += 1);
                continue;
            }

            visited.insert(neighbor.vertex.clone());
            let id = out.push(Visit {
                key: neighbor.vertex,
                doc,
                parent: Some(current),
                edge: Some(neighbor.edge),
                depth: next_depth,
                any_satisfied,
            });
            ctx.record(|m| Metrics::bump(&mut m.enqueued_per_depth, next_depth, 1));
            if !last_level {
                frontier.push_back(id);
            }
            if next_depth >= source.min_depth && (!has_any || any_satisfied) {
                out.rows.push(id);
                if complete(&out) {
                    trace!(rows = out.rows.len(), "traversal row limit reached");
                    break 'walk;
                }
            }
        }

        let size = frontier.len();
        ctx.record(|m| m.max_frontier_size_reached = m.max_frontier_size_reached.max(size as u64));
        if size > max_frontier {
            ctx.record(|m| m.frontier_limit_hits += 1);
            if !warned {
                warn!(
                    frontier = size,
                    limit = max_frontier,
                    graph = %source.graph,
                    "traversal frontier exceeded the configured size"
                );
                warned = true;
            }
        }
    }

    debug!(
        graph = %source.graph,
        visited = out.visits.len(),
        rows = out.rows.len(),
        "breadth-first traversal finished"
    );
    Ok(out)
}

#[derive(Clone, Copy, Debug)]
struct DijkstraEntry {
    id: VisitId,
    distance: f64,
}

impl PartialEq for DijkstraEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for DijkstraEntry {}

impl PartialOrd for DijkstraEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DijkstraEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // min-heap on distance, then discovery order
        other
            .distance
            .total_cmp(&self.distance)
            .then_with(|| other.id.cmp(&self.id))
    }
}

fn edge_weight(weight: Option<&WeightSpec>, neighbor: &Neighbor) -> Result<f64, RuntimeError> {
    let Some(spec) = weight else {
        return Ok(1.0);
    };
    let value = neighbor
        .edge
        .get_path(&[spec.attribute.as_str()])
        .as_f64()
        .unwrap_or(spec.default);
    if value < 0.0 || value.is_nan() {
        return Err(RuntimeError::NegativeWeight {
            edge: neighbor.edge_key.clone(),
            weight: value,
        });
    }
    Ok(value)
}

/// Dijkstra from `source.start` to `source.target`.
///
/// Rows are the vertices of the cheapest path in path order; no rows when
/// the target is unreachable.
pub fn shortest_path(
    graph: &dyn GraphIndex,
    source: &ShortestPathSource,
    constraints: &[PathConstraint],
    ctx: &mut ExecContext<'_>,
) -> Result<Traversal, RuntimeError> {
    let mut out = Traversal::default();
    let mut ids: FxHashMap<String, VisitId> = FxHashMap::default();
    let mut distance: Vec<f64> = Vec::new();
    let mut finalized: FxHashSet<VisitId> = FxHashSet::default();
    let mut heap = BinaryHeap::new();

    let start = out.push(Visit {
        key: source.start.clone(),
        doc: fetch_vertex(graph, &source.graph, &source.start)?,
        parent: None,
        edge: None,
        depth: 0,
        any_satisfied: false,
    });
    ids.insert(source.start.clone(), start);
    distance.push(0.0);
    heap.push(DijkstraEntry {
        id: start,
        distance: 0.0,
    });

    let mut reached = None;
    while let Some(DijkstraEntry { id, distance: cost }) = heap.pop() {
        if cost > distance[id as usize] || !finalized.insert(id) {
            continue;
        }
        if out.key(id) == source.target {
            reached = Some(id);
            break;
        }
        ctx.deadline.check()?;
        let depth = out.depth(id);
        ctx.record(|m| Metrics::bump(&mut m.frontier_processed_per_depth, depth, 1));

        let key = out.key(id).to_owned();
        let neighbors = adjacency(
            graph,
            &source.graph,
            &key,
            source.direction,
            source.edge_type.as_deref(),
        )?;
        ctx.record(|m| m.edges_expanded += neighbors.len() as u64);

        for neighbor in neighbors {
            let known = ids.get(&neighbor.vertex).copied();
            if known.is_some_and(|n| finalized.contains(&n)) {
                continue;
            }
            let weight = edge_weight(source.weight.as_ref(), &neighbor)?;
            let candidate = cost + weight;
            if known.is_some_and(|n| candidate >= distance[n as usize]) {
                continue;
            }
            let doc = match known {
                Some(n) => out.visit(n).doc.clone(),
                None => fetch_vertex(graph, &source.graph, &neighbor.vertex)?,
            };
            if !constraints.is_empty() {
                let hop = hop_bindings(&source.vars, &doc, &neighbor.edge);
                if let HopCheck::Rejected = check_hop(constraints, &hop, false)? {
                    ctx.record(|m| m.path_constraint_rejections += 1);
                    continue;
                }
            }
            let target = match known {
                Some(n) => {
                    let visit = &mut out.visits[n as usize];
                    visit.parent = Some(id);
                    visit.edge = Some(neighbor.edge);
                    visit.depth = depth + 1;
                    distance[n as usize] = candidate;
                    n
                }
                None => {
                    let n = out.push(Visit {
                        key: neighbor.vertex.clone(),
                        doc,
                        parent: Some(id),
                        edge: Some(neighbor.edge),
                        depth: depth + 1,
                        any_satisfied: false,
                    });
                    ids.insert(neighbor.vertex, n);
                    distance.push(candidate);
                    ctx.record(|m| Metrics::bump(&mut m.enqueued_per_depth, depth + 1, 1));
                    n
                }
            };
            heap.push(DijkstraEntry {
                id: target,
                distance: candidate,
            });
        }
        let size = heap.len();
        ctx.record(|m| m.max_frontier_size_reached = m.max_frontier_size_reached.max(size as u64));
    }

    if let Some(target) = reached {
        let mut path = Vec::new();
        let mut cursor = Some(target);
        while let Some(current) = cursor {
            path.push(current);
            cursor = out.visit(current).parent;
        }
        path.reverse();
        out.rows = path;
    }
    debug!(
        graph = %source.graph,
        reached = reached.is_some(),
        cost = reached.map(|id| distance[id as usize]),
        "shortest path finished"
    );
    Ok(out)
}
