//! Abstract syntax tree produced by the parser.
//!
//! The tree is immutable once parsed; later stages borrow it and build their
//! own representations instead of rewriting nodes in place.

use std::collections::BTreeSet;

use serde::Serialize;

use crate::query::value::Value;

/// Source position (1-based line and column).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Pos {
    /// Line number, starting at 1.
    pub line: usize,
    /// Column number in characters, starting at 1.
    pub column: usize,
}

/// Parsed query: clauses in source order.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct QueryAst {
    /// Clauses exactly as they appeared in the text.
    pub clauses: Vec<Clause>,
}

impl QueryAst {
    /// FOR clauses in declaration order.
    pub fn for_clauses(&self) -> impl Iterator<Item = &ForClause> {
        self.clauses.iter().filter_map(|clause| match clause {
            Clause::For(f) => Some(f),
            _ => None,
        })
    }
}

/// One query clause.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "clause", rename_all = "snake_case")]
pub enum Clause {
    /// `FOR var IN source`.
    For(ForClause),
    /// `LET var = expr`.
    Let(LetClause),
    /// `FILTER expr`.
    Filter(FilterClause),
    /// `COLLECT ... AGGREGATE ...`.
    Collect(CollectClause),
    /// `SORT expr [ASC|DESC], ...`.
    Sort(SortClause),
    /// `LIMIT [offset,] count`.
    Limit(LimitClause),
    /// `RETURN expr`.
    Return(ReturnClause),
}

/// Loop binding over a collection or a graph traversal.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ForClause {
    /// Bound variable (the vertex variable for traversals).
    pub variable: String,
    /// Edge variable of a traversal (`FOR v, e IN ...`).
    pub edge_variable: Option<String>,
    /// Path variable of a traversal (`FOR v, e, p IN ...`).
    pub path_variable: Option<String>,
    /// Data source.
    pub source: ForSource,
    /// Position of the FOR keyword.
    pub pos: Pos,
}

impl ForClause {
    /// All variables introduced by this clause.
    pub fn variables(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.variable.as_str())
            .chain(self.edge_variable.as_deref())
            .chain(self.path_variable.as_deref())
    }
}

/// Source of a FOR clause.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ForSource {
    /// Iterate over a collection.
    Collection {
        /// Collection name.
        name: String,
    },
    /// Breadth-first traversal bounded by depth.
    Traversal(TraversalSpec),
    /// Weighted shortest path between two vertices.
    ShortestPath(ShortestPathSpec),
}

/// Edge direction used when fetching adjacency.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Follow edges from `_from` to `_to`.
    #[default]
    Outbound,
    /// Follow edges from `_to` back to `_from`.
    Inbound,
    /// Follow edges in both directions.
    Any,
}

impl Direction {
    /// Keyword spelling of the direction.
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Outbound => "OUTBOUND",
            Direction::Inbound => "INBOUND",
            Direction::Any => "ANY",
        }
    }
}

/// `min..max DIRECTION "start" [TYPE "t"] GRAPH "g"`.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TraversalSpec {
    /// Minimum depth of produced rows.
    pub min_depth: u32,
    /// Maximum depth explored.
    pub max_depth: u32,
    /// Adjacency direction.
    pub direction: Direction,
    /// Start vertex id.
    pub start: String,
    /// Optional edge type filter.
    pub edge_type: Option<String>,
    /// Graph name.
    pub graph: String,
}

/// `DIRECTION SHORTEST_PATH "a" TO "b" [TYPE "t"] GRAPH "g" [WEIGHT "attr" [DEFAULT n]]`.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ShortestPathSpec {
    /// Adjacency direction.
    pub direction: Direction,
    /// Start vertex id.
    pub start: String,
    /// Target vertex id.
    pub target: String,
    /// Optional edge type filter.
    pub edge_type: Option<String>,
    /// Graph name.
    pub graph: String,
    /// Edge attribute holding the weight; unit weights when absent.
    pub weight: Option<WeightSpec>,
}

/// Weight attribute and the default used when an edge lacks it.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct WeightSpec {
    /// Edge attribute name.
    pub attribute: String,
    /// Weight for edges without the attribute.
    pub default: f64,
}

/// `LET var = expr`.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LetClause {
    /// Bound name.
    pub variable: String,
    /// Bound expression.
    pub value: Expr,
    /// Position of the LET keyword.
    pub pos: Pos,
}

/// `FILTER expr`.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FilterClause {
    /// Boolean condition.
    pub condition: Expr,
    /// Position of the FILTER keyword.
    pub pos: Pos,
}

/// `COLLECT g = expr, ... [AGGREGATE a = FUNC(expr), ...]`.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CollectClause {
    /// Group variables and their key expressions.
    pub groups: Vec<(String, Expr)>,
    /// Aggregate variables.
    pub aggregates: Vec<AggregateSpec>,
    /// Position of the COLLECT keyword.
    pub pos: Pos,
}

/// One `name = FUNC(expr)` aggregate.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AggregateSpec {
    /// Output variable.
    pub variable: String,
    /// Aggregate function name, upper-cased.
    pub function: String,
    /// Aggregated expression.
    pub argument: Expr,
    /// Further arguments, such as the rank of `PERCENTILE`.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<Expr>,
}

/// Sort direction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    /// Ascending (default).
    #[default]
    Asc,
    /// Descending.
    Desc,
}

/// One SORT key.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SortKey {
    /// Sort expression.
    pub expr: Expr,
    /// Direction.
    pub direction: SortDirection,
}

/// `SORT key, ...`.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SortClause {
    /// Keys in priority order.
    pub keys: Vec<SortKey>,
}

/// `LIMIT [offset,] count`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct LimitClause {
    /// Rows to skip.
    pub offset: u64,
    /// Rows to return.
    pub count: u64,
}

/// `RETURN expr`.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ReturnClause {
    /// Projected expression.
    pub expr: Expr,
}

/// Binary operators.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BinaryOperator {
    /// `==`
    Eq,
    /// `!=`
    Ne,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
    /// `IN`
    In,
    /// `NOT IN`
    NotIn,
    /// `AND` / `&&`
    And,
    /// `OR` / `||`
    Or,
    /// `XOR`
    Xor,
    /// `+`
    Add,
    /// `-`
    Sub,
    /// `*`
    Mul,
    /// `/`
    Div,
    /// `%`
    Mod,
}

impl BinaryOperator {
    /// Operator spelling.
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOperator::Eq => "==",
            BinaryOperator::Ne => "!=",
            BinaryOperator::Lt => "<",
            BinaryOperator::Le => "<=",
            BinaryOperator::Gt => ">",
            BinaryOperator::Ge => ">=",
            BinaryOperator::In => "IN",
            BinaryOperator::NotIn => "NOT IN",
            BinaryOperator::And => "AND",
            BinaryOperator::Or => "OR",
            BinaryOperator::Xor => "XOR",
            BinaryOperator::Add => "+",
            BinaryOperator::Sub => "-",
            BinaryOperator::Mul => "*",
            BinaryOperator::Div => "/",
            BinaryOperator::Mod => "%",
        }
    }

    /// Exact negation of a comparison or membership test.
    pub fn negated(self) -> Option<BinaryOperator> {
        Some(match self {
            BinaryOperator::Eq => BinaryOperator::Ne,
            BinaryOperator::Ne => BinaryOperator::Eq,
            BinaryOperator::Lt => BinaryOperator::Ge,
            BinaryOperator::Le => BinaryOperator::Gt,
            BinaryOperator::Gt => BinaryOperator::Le,
            BinaryOperator::Ge => BinaryOperator::Lt,
            BinaryOperator::In => BinaryOperator::NotIn,
            BinaryOperator::NotIn => BinaryOperator::In,
            _ => return None,
        })
    }

    /// Comparison with operands swapped (`a < b` is `b > a`).
    pub fn flipped(self) -> Option<BinaryOperator> {
        Some(match self {
            BinaryOperator::Eq => BinaryOperator::Eq,
            BinaryOperator::Ne => BinaryOperator::Ne,
            BinaryOperator::Lt => BinaryOperator::Gt,
            BinaryOperator::Le => BinaryOperator::Ge,
            BinaryOperator::Gt => BinaryOperator::Lt,
            BinaryOperator::Ge => BinaryOperator::Le,
            _ => return None,
        })
    }
}

/// Unary operators.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnaryOperator {
    /// `NOT` / `!`
    Not,
    /// Arithmetic negation.
    Neg,
}

/// Expression node.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "expr", rename_all = "snake_case")]
pub enum Expr {
    /// `left op right`.
    BinaryOp {
        /// Operator.
        op: BinaryOperator,
        /// Left operand.
        left: Box<Expr>,
        /// Right operand.
        right: Box<Expr>,
    },
    /// `op operand`.
    UnaryOp {
        /// Operator.
        op: UnaryOperator,
        /// Operand.
        operand: Box<Expr>,
    },
    /// `NAME(args...)`; the name is upper-cased by the parser.
    FunctionCall {
        /// Function name.
        name: String,
        /// Arguments.
        args: Vec<Expr>,
    },
    /// `variable.a.b`.
    FieldAccess {
        /// Base variable.
        variable: String,
        /// Attribute path (non-empty).
        path: Vec<String>,
    },
    /// Constant.
    Literal {
        /// Literal value.
        value: Value,
    },
    /// Bare variable reference.
    Variable {
        /// Variable name.
        name: String,
    },
    /// `[a, b, ...]`.
    Array {
        /// Elements.
        elements: Vec<Expr>,
    },
    /// `{ key: expr, ... }`.
    Object {
        /// Fields in source order.
        fields: Vec<(String, Expr)>,
    },
}

impl Expr {
    /// Literal constructor.
    pub fn literal(value: impl Into<Value>) -> Self {
        Expr::Literal {
            value: value.into(),
        }
    }

    /// Binary operator constructor.
    pub fn binary(op: BinaryOperator, left: Expr, right: Expr) -> Self {
        Expr::BinaryOp {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    /// `NOT operand`.
    pub fn not(operand: Expr) -> Self {
        Expr::UnaryOp {
            op: UnaryOperator::Not,
            operand: Box::new(operand),
        }
    }

    /// `variable.path`.
    pub fn field(variable: impl Into<String>, path: &[&str]) -> Self {
        Expr::FieldAccess {
            variable: variable.into(),
            path: path.iter().map(|s| (*s).to_owned()).collect(),
        }
    }

    /// Collects every variable the expression reads.
    pub fn collect_variables(&self, out: &mut BTreeSet<String>) {
        match self {
            Expr::BinaryOp { left, right, .. } => {
                left.collect_variables(out);
                right.collect_variables(out);
            }
            Expr::UnaryOp { operand, .. } => operand.collect_variables(out),
            Expr::FunctionCall { args, .. } => {
                for arg in args {
                    arg.collect_variables(out);
                }
            }
            Expr::FieldAccess { variable, .. } => {
                out.insert(variable.clone());
            }
            Expr::Variable { name } => {
                out.insert(name.clone());
            }
            Expr::Literal { .. } => {}
            Expr::Array { elements } => {
                for element in elements {
                    element.collect_variables(out);
                }
            }
            Expr::Object { fields } => {
                for (_, value) in fields {
                    value.collect_variables(out);
                }
            }
        }
    }

    /// Variables read by the expression.
    pub fn variables(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.collect_variables(&mut out);
        out
    }

    /// Visits every function call in the tree, outermost first.
    pub fn visit_calls<'a>(&'a self, visit: &mut dyn FnMut(&'a str, &'a [Expr])) {
        match self {
            Expr::BinaryOp { left, right, .. } => {
                left.visit_calls(visit);
                right.visit_calls(visit);
            }
            Expr::UnaryOp { operand, .. } => operand.visit_calls(visit),
            Expr::FunctionCall { name, args } => {
                visit(name, args);
                for arg in args {
                    arg.visit_calls(visit);
                }
            }
            Expr::Array { elements } => {
                for element in elements {
                    element.visit_calls(visit);
                }
            }
            Expr::Object { fields } => {
                for (_, value) in fields {
                    value.visit_calls(visit);
                }
            }
            Expr::FieldAccess { .. } | Expr::Literal { .. } | Expr::Variable { .. } => {}
        }
    }

    /// Replaces references to `name` with `replacement`.
    ///
    /// Attribute access on a substituted field access extends its path; on a
    /// literal object it resolves the attribute immediately.
    pub fn substitute(&self, name: &str, replacement: &Expr) -> Expr {
        match self {
            Expr::Variable { name: var } if var == name => replacement.clone(),
            Expr::FieldAccess { variable, path } if variable == name => match replacement {
                Expr::FieldAccess {
                    variable: inner,
                    path: prefix,
                } => Expr::FieldAccess {
                    variable: inner.clone(),
                    path: prefix.iter().chain(path.iter()).cloned().collect(),
                },
                Expr::Variable { name: inner } => Expr::FieldAccess {
                    variable: inner.clone(),
                    path: path.clone(),
                },
                Expr::Literal { value } => Expr::Literal {
                    value: value.get_path(path),
                },
                _ => self.clone(),
            },
            Expr::BinaryOp { op, left, right } => Expr::BinaryOp {
                op: *op,
                left: Box::new(left.substitute(name, replacement)),
                right: Box::new(right.substitute(name, replacement)),
            },
            Expr::UnaryOp { op, operand } => Expr::UnaryOp {
                op: *op,
                operand: Box::new(operand.substitute(name, replacement)),
            },
            Expr::FunctionCall { name: fname, args } => Expr::FunctionCall {
                name: fname.clone(),
                args: args
                    .iter()
                    .map(|arg| arg.substitute(name, replacement))
                    .collect(),
            },
            Expr::Array { elements } => Expr::Array {
                elements: elements
                    .iter()
                    .map(|e| e.substitute(name, replacement))
                    .collect(),
            },
            Expr::Object { fields } => Expr::Object {
                fields: fields
                    .iter()
                    .map(|(k, v)| (k.clone(), v.substitute(name, replacement)))
                    .collect(),
            },
            other => other.clone(),
        }
    }

    /// Constant value of the expression when it contains no variables or calls.
    pub fn const_value(&self) -> Option<Value> {
        match self {
            Expr::Literal { value } => Some(value.clone()),
            Expr::UnaryOp {
                op: UnaryOperator::Neg,
                operand,
            } => match operand.const_value()? {
                Value::Int(v) => v.checked_neg().map(Value::Int),
                Value::Float(v) => Some(Value::Float(-v)),
                _ => None,
            },
            Expr::Array { elements } => elements
                .iter()
                .map(Expr::const_value)
                .collect::<Option<Vec<_>>>()
                .map(Value::Array),
            Expr::Object { fields } => fields
                .iter()
                .map(|(k, v)| v.const_value().map(|v| (k.clone(), v)))
                .collect::<Option<_>>()
                .map(Value::Object),
            _ => None,
        }
    }

    /// Renders the expression back to query syntax for explain output.
    pub fn render(&self) -> String {
        match self {
            Expr::BinaryOp { op, left, right } => {
                format!("({} {} {})", left.render(), op.symbol(), right.render())
            }
            Expr::UnaryOp {
                op: UnaryOperator::Not,
                operand,
            } => format!("NOT {}", operand.render()),
            Expr::UnaryOp {
                op: UnaryOperator::Neg,
                operand,
            } => format!("-{}", operand.render()),
            Expr::FunctionCall { name, args } => {
                let args: Vec<String> = args.iter().map(Expr::render).collect();
                format!("{name}({})", args.join(", "))
            }
            Expr::FieldAccess { variable, path } => format!("{variable}.{}", path.join(".")),
            Expr::Literal { value } => value.to_string(),
            Expr::Variable { name } => name.clone(),
            Expr::Array { elements } => {
                let items: Vec<String> = elements.iter().map(Expr::render).collect();
                format!("[{}]", items.join(", "))
            }
            Expr::Object { fields } => {
                let items: Vec<String> = fields
                    .iter()
                    .map(|(k, v)| format!("{k}: {}", v.render()))
                    .collect();
                format!("{{{}}}", items.join(", "))
            }
        }
    }
}
