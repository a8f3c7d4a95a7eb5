//! Expression interpreter used for residual predicates, LET bindings, sort
//! keys and projections.

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::query::ast::{BinaryOperator, Expr, UnaryOperator};
use crate::query::errors::RuntimeError;
use crate::query::functions::{self, FunctionKind};
use crate::query::value::Value;

/// Variable slots of one row.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Bindings {
    slots: SmallVec<[(String, Value); 4]>,
    scores: SmallVec<[(String, f64); 2]>,
}

impl Bindings {
    /// Empty row.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`Bindings::bind`].
    pub fn with(mut self, name: impl Into<String>, value: Value) -> Self {
        self.bind(name, value);
        self
    }

    /// Binds or rebinds a variable.
    pub fn bind(&mut self, name: impl Into<String>, value: Value) {
        let name = name.into();
        match self.slots.iter_mut().find(|(slot, _)| *slot == name) {
            Some((_, slot)) => *slot = value,
            None => self.slots.push((name, value)),
        }
    }

    /// Current value of a variable.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.slots
            .iter()
            .find(|(slot, _)| slot == name)
            .map(|(_, value)| value)
    }

    /// Records the relevance score of a ranked variable.
    pub fn set_score(&mut self, name: impl Into<String>, score: f64) {
        let name = name.into();
        match self.scores.iter_mut().find(|(slot, _)| *slot == name) {
            Some((_, slot)) => *slot = score,
            None => self.scores.push((name, score)),
        }
    }

    /// Relevance score of a ranked variable.
    pub fn score(&self, name: &str) -> Option<f64> {
        self.scores
            .iter()
            .find(|(slot, _)| slot == name)
            .map(|(_, score)| *score)
    }

    /// Merges another row's slots into this one.
    pub fn extend(&mut self, other: &Bindings) {
        for (name, value) in &other.slots {
            self.bind(name.clone(), value.clone());
        }
        for (name, score) in &other.scores {
            self.set_score(name.clone(), *score);
        }
    }
}

/// Hit sets of the ranked calls (`FULLTEXT`, `NEAR`) in a query, keyed by the
/// rendered call.
#[derive(Clone, Debug, Default)]
pub struct RankedHits {
    sets: FxHashMap<String, FxHashMap<String, f64>>,
}

impl RankedHits {
    /// Registers the hits of one call.
    pub fn insert(&mut self, call: &Expr, hits: impl IntoIterator<Item = (String, f64)>) {
        self.sets
            .entry(call.render())
            .or_default()
            .extend(hits);
    }

    /// Whether a call's hits are registered.
    pub fn contains_call(&self, call: &Expr) -> bool {
        self.sets.contains_key(&call.render())
    }

    fn lookup(&self, rendered: &str, key: &str) -> Option<bool> {
        self.sets.get(rendered).map(|hits| hits.contains_key(key))
    }
}

/// Per-evaluation bookkeeping for explain metrics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EvalTrace {
    /// An AND or OR skipped its right operand.
    pub short_circuited: bool,
}

/// Stateless evaluator; ranked calls resolve against `ranked` when present.
#[derive(Clone, Copy, Debug, Default)]
pub struct Evaluator<'a> {
    ranked: Option<&'a RankedHits>,
}

impl<'a> Evaluator<'a> {
    /// Evaluator without ranked hit sets.
    pub fn new() -> Self {
        Self { ranked: None }
    }

    /// Evaluator resolving `FULLTEXT`/`NEAR` through precomputed hit sets.
    pub fn with_ranked(ranked: &'a RankedHits) -> Self {
        Self {
            ranked: Some(ranked),
        }
    }

    /// Evaluates a condition to a boolean via truthiness.
    pub fn test(
        &self,
        expr: &Expr,
        row: &Bindings,
        trace: &mut EvalTrace,
    ) -> Result<bool, RuntimeError> {
        Ok(self.eval(expr, row, trace)?.is_truthy())
    }

    /// Evaluates `expr` against `row`.
    pub fn eval(
        &self,
        expr: &Expr,
        row: &Bindings,
        trace: &mut EvalTrace,
    ) -> Result<Value, RuntimeError> {
        match expr {
            Expr::Literal { value } => Ok(value.clone()),
            Expr::Variable { name } => row
                .get(name)
                .cloned()
                .ok_or_else(|| RuntimeError::invalid(format!("variable '{name}' is not bound"))),
            Expr::FieldAccess { variable, path } => match row.get(variable) {
                Some(value) => Ok(value.get_path(path)),
                None => Err(RuntimeError::invalid(format!(
                    "variable '{variable}' is not bound"
                ))),
            },
            Expr::Array { elements } => elements
                .iter()
                .map(|element| self.eval(element, row, trace))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Expr::Object { fields } => {
                let mut map = std::collections::BTreeMap::new();
                for (key, value) in fields {
                    map.insert(key.clone(), self.eval(value, row, trace)?);
                }
                Ok(Value::Object(map))
            }
            Expr::UnaryOp { op, operand } => {
                let value = self.eval(operand, row, trace)?;
                match op {
                    UnaryOperator::Not => Ok(Value::Bool(!value.is_truthy())),
                    UnaryOperator::Neg => negate(value),
                }
            }
            Expr::BinaryOp { op, left, right } => self.binary(*op, left, right, row, trace),
            Expr::FunctionCall { name, args } => self.call(expr, name, args, row, trace),
        }
    }

    fn binary(
        &self,
        op: BinaryOperator,
        left: &Expr,
        right: &Expr,
        row: &Bindings,
        trace: &mut EvalTrace,
    ) -> Result<Value, RuntimeError> {
        match op {
            BinaryOperator::And => {
                if !self.test(left, row, trace)? {
                    trace.short_circuited = true;
                    return Ok(Value::Bool(false));
                }
                Ok(Value::Bool(self.test(right, row, trace)?))
            }
            BinaryOperator::Or => {
                if self.test(left, row, trace)? {
                    trace.short_circuited = true;
                    return Ok(Value::Bool(true));
                }
                Ok(Value::Bool(self.test(right, row, trace)?))
            }
            _ => {
                let l = self.eval(left, row, trace)?;
                let r = self.eval(right, row, trace)?;
                apply_binary(op, &l, &r)
            }
        }
    }

    fn call(
        &self,
        call: &Expr,
        name: &str,
        args: &[Expr],
        row: &Bindings,
        trace: &mut EvalTrace,
    ) -> Result<Value, RuntimeError> {
        let spec = functions::lookup(name)
            .ok_or_else(|| RuntimeError::invalid(format!("unknown function {name}")))?;
        match spec.kind {
            FunctionKind::Scalar(f) => {
                let values = args
                    .iter()
                    .map(|arg| self.eval(arg, row, trace))
                    .collect::<Result<Vec<_>, _>>()?;
                f(&values)
            }
            FunctionKind::Fulltext | FunctionKind::Near => {
                let ranked = self.ranked.ok_or_else(|| {
                    RuntimeError::invalid(format!("{name} is only valid inside FILTER"))
                })?;
                let Some(Expr::FieldAccess { variable, .. }) = args.first() else {
                    return Err(RuntimeError::invalid(format!(
                        "{name} expects a field as first argument"
                    )));
                };
                let key = row
                    .get(variable)
                    .and_then(Value::document_key)
                    .unwrap_or_default();
                ranked
                    .lookup(&call.render(), key)
                    .map(Value::Bool)
                    .ok_or_else(|| RuntimeError::invalid(format!("{name} hits were not fetched")))
            }
            FunctionKind::Score => match args.first() {
                Some(Expr::Variable { name: var }) => {
                    Ok(row.score(var).map_or(Value::Null, Value::Float))
                }
                _ => Err(RuntimeError::invalid("SCORE expects a variable")),
            },
            FunctionKind::Path(_) => Err(RuntimeError::invalid(format!(
                "{name} is only valid as a traversal FILTER condition"
            ))),
        }
    }
}

/// Evaluates an expression that reads no variables.
pub fn eval_const(expr: &Expr) -> Result<Value, RuntimeError> {
    Evaluator::new().eval(expr, &Bindings::new(), &mut EvalTrace::default())
}

fn negate(value: Value) -> Result<Value, RuntimeError> {
    match value {
        Value::Int(v) => Ok(v
            .checked_neg()
            .map_or(Value::Float(-(v as f64)), Value::Int)),
        Value::Float(v) => Ok(Value::Float(-v)),
        other => Err(RuntimeError::type_mismatch(
            "unary -",
            "number",
            other.type_name(),
        )),
    }
}

/// Applies a non-short-circuit binary operator to two values.
pub fn apply_binary(op: BinaryOperator, l: &Value, r: &Value) -> Result<Value, RuntimeError> {
    Ok(match op {
        BinaryOperator::Eq => Value::Bool(l == r),
        BinaryOperator::Ne => Value::Bool(l != r),
        BinaryOperator::Lt => Value::Bool(l < r),
        BinaryOperator::Le => Value::Bool(l <= r),
        BinaryOperator::Gt => Value::Bool(l > r),
        BinaryOperator::Ge => Value::Bool(l >= r),
        BinaryOperator::In => Value::Bool(contains(r, l)),
        BinaryOperator::NotIn => Value::Bool(!contains(r, l)),
        BinaryOperator::And => Value::Bool(l.is_truthy() && r.is_truthy()),
        BinaryOperator::Or => Value::Bool(l.is_truthy() || r.is_truthy()),
        BinaryOperator::Xor => Value::Bool(l.is_truthy() != r.is_truthy()),
        BinaryOperator::Add
        | BinaryOperator::Sub
        | BinaryOperator::Mul
        | BinaryOperator::Div
        | BinaryOperator::Mod => return arithmetic(op, l, r),
    })
}

fn contains(haystack: &Value, needle: &Value) -> bool {
    match haystack {
        Value::Array(items) => items.iter().any(|item| item == needle),
        _ => false,
    }
}

fn arithmetic(op: BinaryOperator, l: &Value, r: &Value) -> Result<Value, RuntimeError> {
    if let (Value::Int(a), Value::Int(b)) = (l, r) {
        let (a, b) = (*a, *b);
        let exact = match op {
            BinaryOperator::Add => a.checked_add(b),
            BinaryOperator::Sub => a.checked_sub(b),
            BinaryOperator::Mul => a.checked_mul(b),
            BinaryOperator::Div => {
                if b == 0 {
                    return Err(RuntimeError::DivisionByZero { context: None });
                }
                match a.checked_rem(b) {
                    Some(0) => a.checked_div(b),
                    _ => None,
                }
            }
            BinaryOperator::Mod => {
                if b == 0 {
                    return Err(RuntimeError::DivisionByZero { context: None });
                }
                a.checked_rem(b)
            }
            _ => None,
        };
        if let Some(v) = exact {
            return Ok(Value::Int(v));
        }
    }
    let (Some(a), Some(b)) = (l.as_f64(), r.as_f64()) else {
        let found = if l.as_f64().is_none() { l } else { r };
        return Err(RuntimeError::type_mismatch(
            op.symbol(),
            "number",
            found.type_name(),
        ));
    };
    Ok(Value::Float(match op {
        BinaryOperator::Add => a + b,
        BinaryOperator::Sub => a - b,
        BinaryOperator::Mul => a * b,
        BinaryOperator::Div | BinaryOperator::Mod if b == 0.0 => {
            return Err(RuntimeError::DivisionByZero { context: None })
        }
        BinaryOperator::Div => a / b,
        _ => a % b,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::parser::parse;
    use crate::query::ast::Clause;
    use serde_json::json;

    fn filter_of(query: &str) -> Expr {
        let ast = parse(query).expect("parse");
        ast.clauses
            .into_iter()
            .find_map(|clause| match clause {
                Clause::Filter(f) => Some(f.condition),
                _ => None,
            })
            .expect("filter clause")
    }

    fn row() -> Bindings {
        Bindings::new().with(
            "u",
            json!({"_key": "u1", "age": 31, "tags": ["a", "b"], "name": "Ada"}).into(),
        )
    }

    #[test]
    fn and_short_circuits_on_false() {
        let expr = filter_of("FOR u IN users FILTER u.age < 18 AND u.age / 0 > 1 RETURN u");
        let mut trace = EvalTrace::default();
        let result = Evaluator::new().test(&expr, &row(), &mut trace);
        assert_eq!(result, Ok(false));
        assert!(trace.short_circuited);
    }

    #[test]
    fn division_by_zero_is_a_runtime_error() {
        let expr = filter_of("FOR u IN users FILTER u.age / 0 > 1 RETURN u");
        let result = Evaluator::new().test(&expr, &row(), &mut EvalTrace::default());
        assert!(matches!(result, Err(RuntimeError::DivisionByZero { .. })));
    }

    #[test]
    fn integer_division_stays_integral_when_exact() {
        assert_eq!(
            apply_binary(BinaryOperator::Div, &Value::Int(9), &Value::Int(3)),
            Ok(Value::Int(3))
        );
        assert_eq!(
            apply_binary(BinaryOperator::Div, &Value::Int(7), &Value::Int(2)),
            Ok(Value::Float(3.5))
        );
    }

    #[test]
    fn membership_against_non_arrays_is_false() {
        assert_eq!(
            apply_binary(BinaryOperator::In, &Value::Int(1), &Value::from("1")),
            Ok(Value::Bool(false))
        );
        let expr = filter_of(r#"FOR u IN users FILTER "a" IN u.tags RETURN u"#);
        assert_eq!(
            Evaluator::new().test(&expr, &row(), &mut EvalTrace::default()),
            Ok(true)
        );
    }

    #[test]
    fn adding_a_string_is_a_type_mismatch() {
        let result = apply_binary(BinaryOperator::Add, &Value::Int(1), &Value::from("x"));
        assert!(matches!(
            result,
            Err(RuntimeError::TypeMismatch { found: "string", .. })
        ));
    }

    #[test]
    fn ranked_calls_resolve_through_hit_sets() {
        let expr = filter_of(r#"FOR u IN users FILTER FULLTEXT(u.name, "ada") RETURN u"#);
        assert!(Evaluator::new()
            .test(&expr, &row(), &mut EvalTrace::default())
            .is_err());
        let mut hits = RankedHits::default();
        hits.insert(&expr, vec![("u1".to_owned(), 2.0)]);
        assert_eq!(
            Evaluator::with_ranked(&hits).test(&expr, &row(), &mut EvalTrace::default()),
            Ok(true)
        );
    }
}
