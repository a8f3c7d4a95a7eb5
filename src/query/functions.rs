//! Built-in function registry: scalar functions, ranking functions, path
//! quantifiers and aggregates.

use std::collections::BTreeMap;

use crate::query::errors::RuntimeError;
use crate::query::value::Value;

/// Signature of a scalar function implementation.
pub type ScalarFn = fn(&[Value]) -> Result<Value, RuntimeError>;

/// Quantifier of a path-wide constraint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PathQuantifier {
    /// Every hop satisfies the condition.
    All,
    /// No hop satisfies the condition.
    None,
    /// At least one hop satisfies the condition.
    Any,
}

impl PathQuantifier {
    /// Upper-case spelling without the `PATH_` prefix.
    pub fn name(self) -> &'static str {
        match self {
            PathQuantifier::All => "ALL",
            PathQuantifier::None => "NONE",
            PathQuantifier::Any => "ANY",
        }
    }
}

/// How a registered function is evaluated.
#[derive(Clone, Copy, Debug)]
pub enum FunctionKind {
    /// Pure function of its argument values.
    Scalar(ScalarFn),
    /// `FULLTEXT(field, query [, limit])`.
    Fulltext,
    /// `NEAR(field, vector, k [, metric])`.
    Near,
    /// `SCORE(var)`: relevance of a ranked row.
    Score,
    /// `PATH_ALL/PATH_NONE/PATH_ANY(condition)`.
    Path(PathQuantifier),
}

/// Registry entry.
#[derive(Clone, Copy, Debug)]
pub struct FunctionSpec {
    /// Upper-case name.
    pub name: &'static str,
    /// Minimum argument count.
    pub min_args: usize,
    /// Maximum argument count; `None` for variadic.
    pub max_args: Option<usize>,
    /// Evaluation strategy.
    pub kind: FunctionKind,
}

impl FunctionSpec {
    /// Whether `count` arguments are accepted.
    pub fn accepts(&self, count: usize) -> bool {
        count >= self.min_args && self.max_args.map_or(true, |max| count <= max)
    }

    /// Arity description for error messages.
    pub fn expected(&self) -> String {
        match self.max_args {
            Some(max) if max == self.min_args => max.to_string(),
            Some(max) => format!("{}..{}", self.min_args, max),
            None => format!("at least {}", self.min_args),
        }
    }
}

const fn scalar(name: &'static str, min: usize, max: Option<usize>, f: ScalarFn) -> FunctionSpec {
    FunctionSpec {
        name,
        min_args: min,
        max_args: max,
        kind: FunctionKind::Scalar(f),
    }
}

static FUNCTIONS: &[FunctionSpec] = &[
    scalar("ABS", 1, Some(1), abs),
    scalar("CEIL", 1, Some(1), ceil),
    scalar("FLOOR", 1, Some(1), floor),
    scalar("ROUND", 1, Some(1), round),
    scalar("LENGTH", 1, Some(1), length),
    scalar("LOWER", 1, Some(1), lower),
    scalar("UPPER", 1, Some(1), upper),
    scalar("CONCAT", 1, None, concat),
    scalar("SUBSTRING", 2, Some(3), substring),
    scalar("MIN", 1, None, min),
    scalar("MAX", 1, None, max),
    scalar("COUNT", 1, Some(1), count),
    scalar("SUM", 1, Some(1), sum),
    scalar("AVG", 1, Some(1), avg),
    scalar("GEO_DISTANCE", 2, Some(2), geo_distance),
    FunctionSpec {
        name: "FULLTEXT",
        min_args: 2,
        max_args: Some(3),
        kind: FunctionKind::Fulltext,
    },
    FunctionSpec {
        name: "NEAR",
        min_args: 3,
        max_args: Some(4),
        kind: FunctionKind::Near,
    },
    FunctionSpec {
        name: "SCORE",
        min_args: 1,
        max_args: Some(1),
        kind: FunctionKind::Score,
    },
    FunctionSpec {
        name: "PATH_ALL",
        min_args: 1,
        max_args: Some(1),
        kind: FunctionKind::Path(PathQuantifier::All),
    },
    FunctionSpec {
        name: "PATH_NONE",
        min_args: 1,
        max_args: Some(1),
        kind: FunctionKind::Path(PathQuantifier::None),
    },
    FunctionSpec {
        name: "PATH_ANY",
        min_args: 1,
        max_args: Some(1),
        kind: FunctionKind::Path(PathQuantifier::Any),
    },
];

/// Looks up a function by (upper-case) name.
pub fn lookup(name: &str) -> Option<&'static FunctionSpec> {
    FUNCTIONS.iter().find(|spec| spec.name == name)
}

/// All registered names, for suggestions.
pub fn names() -> impl Iterator<Item = &'static str> {
    FUNCTIONS.iter().map(|spec| spec.name)
}

fn number(function: &str, value: &Value) -> Result<Option<f64>, RuntimeError> {
    match value {
        Value::Null => Ok(None),
        Value::Int(v) => Ok(Some(*v as f64)),
        Value::Float(v) => Ok(Some(*v)),
        other => Err(RuntimeError::type_mismatch(function, "number", other.type_name())),
    }
}

fn integral(value: f64) -> Value {
    if value.fract() == 0.0 && value.abs() < 9.0e15 {
        Value::Int(value as i64)
    } else {
        Value::Float(value)
    }
}

fn abs(args: &[Value]) -> Result<Value, RuntimeError> {
    match &args[0] {
        Value::Int(v) => Ok(v.checked_abs().map_or(Value::Float((*v as f64).abs()), Value::Int)),
        other => Ok(number("ABS", other)?.map_or(Value::Null, |v| Value::Float(v.abs()))),
    }
}

fn ceil(args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(number("CEIL", &args[0])?.map_or(Value::Null, |v| integral(v.ceil())))
}

fn floor(args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(number("FLOOR", &args[0])?.map_or(Value::Null, |v| integral(v.floor())))
}

fn round(args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(number("ROUND", &args[0])?.map_or(Value::Null, |v| integral(v.round())))
}

fn length(args: &[Value]) -> Result<Value, RuntimeError> {
    let len = match &args[0] {
        Value::Null => 0,
        Value::String(s) => s.chars().count(),
        Value::Array(items) => items.len(),
        Value::Object(map) => map.len(),
        other => {
            return Err(RuntimeError::type_mismatch(
                "LENGTH",
                "string, array or object",
                other.type_name(),
            ))
        }
    };
    Ok(Value::Int(len as i64))
}

fn lower(args: &[Value]) -> Result<Value, RuntimeError> {
    match &args[0] {
        Value::Null => Ok(Value::Null),
        Value::String(s) => Ok(Value::String(s.to_lowercase())),
        other => Err(RuntimeError::type_mismatch("LOWER", "string", other.type_name())),
    }
}

fn upper(args: &[Value]) -> Result<Value, RuntimeError> {
    match &args[0] {
        Value::Null => Ok(Value::Null),
        Value::String(s) => Ok(Value::String(s.to_uppercase())),
        other => Err(RuntimeError::type_mismatch("UPPER", "string", other.type_name())),
    }
}

fn concat(args: &[Value]) -> Result<Value, RuntimeError> {
    let mut out = String::new();
    for arg in args {
        match arg {
            Value::Null => {}
            Value::String(s) => out.push_str(s),
            other => out.push_str(&other.to_string()),
        }
    }
    Ok(Value::String(out))
}

fn substring(args: &[Value]) -> Result<Value, RuntimeError> {
    let text = match &args[0] {
        Value::Null => return Ok(Value::Null),
        Value::String(s) => s,
        other => {
            return Err(RuntimeError::type_mismatch(
                "SUBSTRING",
                "string",
                other.type_name(),
            ))
        }
    };
    let chars: Vec<char> = text.chars().collect();
    let len = chars.len() as i64;
    let offset = match &args[1] {
        Value::Int(v) => *v,
        other => return Err(RuntimeError::type_mismatch("SUBSTRING", "int", other.type_name())),
    };
    let start = if offset < 0 { (len + offset).max(0) } else { offset.min(len) };
    let take = match args.get(2) {
        None | Some(Value::Null) => len - start,
        Some(Value::Int(v)) => (*v).max(0).min(len - start),
        Some(other) => {
            return Err(RuntimeError::type_mismatch("SUBSTRING", "int", other.type_name()))
        }
    };
    let slice: String = chars[start as usize..(start + take) as usize].iter().collect();
    Ok(Value::String(slice))
}

fn spread(args: &[Value]) -> &[Value] {
    match args {
        [Value::Array(items)] => items.as_slice(),
        _ => args,
    }
}

fn min(args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(spread(args)
        .iter()
        .filter(|v| !v.is_null())
        .min()
        .cloned()
        .unwrap_or(Value::Null))
}

fn max(args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(spread(args)
        .iter()
        .filter(|v| !v.is_null())
        .max()
        .cloned()
        .unwrap_or(Value::Null))
}

fn array_arg<'a>(function: &str, value: &'a Value) -> Result<&'a [Value], RuntimeError> {
    match value {
        Value::Array(items) => Ok(items),
        Value::Null => Ok(&[]),
        other => Err(RuntimeError::type_mismatch(function, "array", other.type_name())),
    }
}

fn count(args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(Value::Int(array_arg("COUNT", &args[0])?.len() as i64))
}

fn sum(args: &[Value]) -> Result<Value, RuntimeError> {
    let mut acc = Accumulator::new(AggregateFn::Sum);
    for item in array_arg("SUM", &args[0])? {
        acc.push(item)?;
    }
    Ok(acc.finish())
}

fn avg(args: &[Value]) -> Result<Value, RuntimeError> {
    let mut acc = Accumulator::new(AggregateFn::Avg);
    for item in array_arg("AVG", &args[0])? {
        acc.push(item)?;
    }
    Ok(acc.finish())
}

const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Reads a `[lat, lon]` pair.
pub fn coordinates(value: &Value) -> Option<(f64, f64)> {
    match value {
        Value::Array(items) if items.len() == 2 => Some((items[0].as_f64()?, items[1].as_f64()?)),
        Value::Object(map) => Some((
            map.get("lat")?.as_f64()?,
            map.get("lon").or_else(|| map.get("lng"))?.as_f64()?,
        )),
        _ => None,
    }
}

/// Great-circle distance in meters.
pub fn haversine_m(a: (f64, f64), b: (f64, f64)) -> f64 {
    let (lat1, lon1) = (a.0.to_radians(), a.1.to_radians());
    let (lat2, lon2) = (b.0.to_radians(), b.1.to_radians());
    let dlat = lat2 - lat1;
    let dlon = lon2 - lon1;
    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().min(1.0).asin()
}

fn geo_distance(args: &[Value]) -> Result<Value, RuntimeError> {
    if args[0].is_null() || args[1].is_null() {
        return Ok(Value::Null);
    }
    let a = coordinates(&args[0])
        .ok_or_else(|| RuntimeError::type_mismatch("GEO_DISTANCE", "[lat, lon]", args[0].type_name()))?;
    let b = coordinates(&args[1])
        .ok_or_else(|| RuntimeError::type_mismatch("GEO_DISTANCE", "[lat, lon]", args[1].type_name()))?;
    Ok(Value::Float(haversine_m(a, b)))
}

/// Aggregate functions usable in `COLLECT ... AGGREGATE`.
#[derive(Clone, Copy, Debug, PartialEq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateFn {
    /// Number of non-null values.
    Count,
    /// Sum of numbers.
    Sum,
    /// Mean of numbers; null when there are none.
    Avg,
    /// Smallest non-null value.
    Min,
    /// Largest non-null value.
    Max,
    /// Linearly interpolated percentile, `0..=100`.
    Percentile(f64),
    /// 50th percentile.
    Median,
    /// Sample variance; null below two values.
    Variance,
    /// Population variance.
    VariancePop,
    /// Sample standard deviation; null below two values.
    Stddev,
    /// Population standard deviation.
    StddevPop,
    /// Largest minus smallest value.
    Range,
    /// 75th minus 25th percentile; null below four values.
    Iqr,
    /// Mean absolute deviation from the mean.
    Mad,
}

impl AggregateFn {
    /// Resolves an upper-case aggregate name. `PERCENTILE` starts at the
    /// median until [`AggregateFn::with_parameters`] sets its rank.
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "COUNT" => AggregateFn::Count,
            "SUM" => AggregateFn::Sum,
            "AVG" | "AVERAGE" => AggregateFn::Avg,
            "MIN" => AggregateFn::Min,
            "MAX" => AggregateFn::Max,
            "PERCENTILE" => AggregateFn::Percentile(50.0),
            "MEDIAN" => AggregateFn::Median,
            "VARIANCE" | "VARIANCE_SAMPLE" => AggregateFn::Variance,
            "VARIANCE_POP" | "VARIANCE_POPULATION" => AggregateFn::VariancePop,
            "STDDEV" | "STDDEV_SAMPLE" => AggregateFn::Stddev,
            "STDDEV_POP" | "STDDEV_POPULATION" => AggregateFn::StddevPop,
            "RANGE" => AggregateFn::Range,
            "IQR" => AggregateFn::Iqr,
            "MAD" => AggregateFn::Mad,
            _ => return None,
        })
    }

    /// Applies the constant arguments after the aggregated expression.
    pub fn with_parameters(self, params: &[Value]) -> Result<Self, String> {
        match (self, params) {
            (AggregateFn::Percentile(_), [rank]) => match rank.as_f64() {
                Some(p) if (0.0..=100.0).contains(&p) => Ok(AggregateFn::Percentile(p)),
                _ => Err("percentile must be a number between 0 and 100".into()),
            },
            (AggregateFn::Percentile(_), _) => {
                Err("expects the aggregated value and a percentile".into())
            }
            (function, []) => Ok(function),
            (_, extra) => Err(format!("takes one argument, got {}", extra.len() + 1)),
        }
    }

    /// Canonical upper-case name.
    pub fn name(self) -> &'static str {
        match self {
            AggregateFn::Count => "COUNT",
            AggregateFn::Sum => "SUM",
            AggregateFn::Avg => "AVG",
            AggregateFn::Min => "MIN",
            AggregateFn::Max => "MAX",
            AggregateFn::Percentile(_) => "PERCENTILE",
            AggregateFn::Median => "MEDIAN",
            AggregateFn::Variance => "VARIANCE",
            AggregateFn::VariancePop => "VARIANCE_POP",
            AggregateFn::Stddev => "STDDEV",
            AggregateFn::StddevPop => "STDDEV_POP",
            AggregateFn::Range => "RANGE",
            AggregateFn::Iqr => "IQR",
            AggregateFn::Mad => "MAD",
        }
    }

    /// Names accepted by [`AggregateFn::from_name`].
    pub const NAMES: [&'static str; 14] = [
        "COUNT",
        "SUM",
        "AVG",
        "MIN",
        "MAX",
        "PERCENTILE",
        "MEDIAN",
        "VARIANCE",
        "VARIANCE_POP",
        "STDDEV",
        "STDDEV_POP",
        "RANGE",
        "IQR",
        "MAD",
    ];
}

/// Running state of one aggregate.
#[derive(Clone, Debug)]
pub struct Accumulator {
    function: AggregateFn,
    count: u64,
    int_sum: Option<i64>,
    float_sum: f64,
    saw_float: bool,
    extreme: Option<Value>,
    samples: Vec<f64>,
}

impl Accumulator {
    /// Empty accumulator.
    pub fn new(function: AggregateFn) -> Self {
        Self {
            function,
            count: 0,
            int_sum: Some(0),
            float_sum: 0.0,
            saw_float: false,
            extreme: None,
            samples: Vec::new(),
        }
    }

    /// Folds one value; nulls are skipped.
    pub fn push(&mut self, value: &Value) -> Result<(), RuntimeError> {
        if value.is_null() {
            return Ok(());
        }
        match self.function {
            AggregateFn::Count => {}
            AggregateFn::Sum | AggregateFn::Avg => {
                let name = self.function.name();
                match value {
                    Value::Int(v) => {
                        self.int_sum = self.int_sum.and_then(|acc| acc.checked_add(*v));
                        self.float_sum += *v as f64;
                    }
                    Value::Float(v) => {
                        self.saw_float = true;
                        self.float_sum += v;
                    }
                    other => {
                        return Err(RuntimeError::type_mismatch(name, "number", other.type_name()))
                    }
                }
            }
            AggregateFn::Min => {
                if self.extreme.as_ref().map_or(true, |cur| value < cur) {
                    self.extreme = Some(value.clone());
                }
            }
            AggregateFn::Max => {
                if self.extreme.as_ref().map_or(true, |cur| value > cur) {
                    self.extreme = Some(value.clone());
                }
            }
            function => {
                let number = value.as_f64().ok_or_else(|| {
                    RuntimeError::type_mismatch(function.name(), "number", value.type_name())
                })?;
                self.samples.push(number);
            }
        }
        self.count += 1;
        Ok(())
    }

    /// Final value.
    pub fn finish(&self) -> Value {
        match self.function {
            AggregateFn::Count => Value::Int(self.count as i64),
            AggregateFn::Sum => match (self.saw_float, self.int_sum) {
                (false, Some(total)) => Value::Int(total),
                _ => Value::Float(self.float_sum),
            },
            AggregateFn::Avg if self.count == 0 => Value::Null,
            AggregateFn::Avg => Value::Float(self.float_sum / self.count as f64),
            AggregateFn::Min | AggregateFn::Max => self.extreme.clone().unwrap_or(Value::Null),
            function => statistic(function, &self.samples).map_or(Value::Null, Value::Float),
        }
    }
}

/// Statistical aggregates over the collected numbers.
fn statistic(function: AggregateFn, samples: &[f64]) -> Option<f64> {
    let n = samples.len();
    if n == 0 {
        return None;
    }
    let mean = samples.iter().sum::<f64>() / n as f64;
    let squares = || samples.iter().map(|x| (x - mean).powi(2)).sum::<f64>();
    let sorted = || {
        let mut sorted = samples.to_vec();
        sorted.sort_by(f64::total_cmp);
        sorted
    };
    match function {
        AggregateFn::Percentile(p) => Some(percentile(&sorted(), p)),
        AggregateFn::Median => Some(percentile(&sorted(), 50.0)),
        AggregateFn::Variance => (n >= 2).then(|| squares() / (n - 1) as f64),
        AggregateFn::VariancePop => Some(squares() / n as f64),
        AggregateFn::Stddev => (n >= 2).then(|| (squares() / (n - 1) as f64).sqrt()),
        AggregateFn::StddevPop => Some((squares() / n as f64).sqrt()),
        AggregateFn::Range => {
            let (lo, hi) = samples
                .iter()
                .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &x| (lo.min(x), hi.max(x)));
            Some(hi - lo)
        }
        AggregateFn::Iqr if n < 4 => None,
        AggregateFn::Iqr => {
            let sorted = sorted();
            Some(percentile(&sorted, 75.0) - percentile(&sorted, 25.0))
        }
        AggregateFn::Mad => Some(samples.iter().map(|x| (x - mean).abs()).sum::<f64>() / n as f64),
        AggregateFn::Count | AggregateFn::Sum | AggregateFn::Avg | AggregateFn::Min | AggregateFn::Max => None,
    }
}

/// Percentile `p` of ascending `sorted`, interpolating between the two
/// nearest ranks.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    let rank = p / 100.0 * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let weight = rank - lower as f64;
    sorted[lower] * (1.0 - weight) + sorted[upper] * weight
}

/// Object value from `(key, value)` pairs.
pub fn object<I, K>(pairs: I) -> Value
where
    I: IntoIterator<Item = (K, Value)>,
    K: Into<String>,
{
    Value::Object(
        pairs
            .into_iter()
            .map(|(k, v)| (k.into(), v))
            .collect::<BTreeMap<_, _>>(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(name: &str, args: &[Value]) -> Result<Value, RuntimeError> {
        let spec = lookup(name).expect("registered");
        assert!(spec.accepts(args.len()));
        match spec.kind {
            FunctionKind::Scalar(f) => f(args),
            other => panic!("not scalar: {other:?}"),
        }
    }

    #[test]
    fn numeric_functions() {
        assert_eq!(call("ABS", &[Value::Int(-4)]).unwrap(), Value::Int(4));
        assert_eq!(call("CEIL", &[Value::Float(1.2)]).unwrap(), Value::Int(2));
        assert_eq!(call("FLOOR", &[Value::Float(-1.2)]).unwrap(), Value::Int(-2));
        assert_eq!(call("ROUND", &[Value::Float(2.5)]).unwrap(), Value::Int(3));
        assert!(call("ABS", &[Value::from("x")]).is_err());
    }

    #[test]
    fn string_functions() {
        assert_eq!(call("LOWER", &[Value::from("AbC")]).unwrap(), Value::from("abc"));
        assert_eq!(
            call("CONCAT", &[Value::from("a"), Value::Int(1), Value::Null]).unwrap(),
            Value::from("a1")
        );
        assert_eq!(
            call("SUBSTRING", &[Value::from("penumbra"), Value::Int(-5), Value::Int(3)]).unwrap(),
            Value::from("umb")
        );
        assert_eq!(call("LENGTH", &[Value::from("héllo")]).unwrap(), Value::Int(5));
    }

    #[test]
    fn min_max_spread_single_array() {
        let arr = Value::Array(vec![Value::Int(3), Value::Null, Value::Int(1)]);
        assert_eq!(call("MIN", &[arr.clone()]).unwrap(), Value::Int(1));
        assert_eq!(call("MAX", &[Value::Int(2), Value::Int(7)]).unwrap(), Value::Int(7));
    }

    #[test]
    fn geo_distance_is_symmetric() {
        let berlin = Value::Array(vec![Value::Float(52.52), Value::Float(13.405)]);
        let paris = Value::Array(vec![Value::Float(48.8566), Value::Float(2.3522)]);
        let ab = call("GEO_DISTANCE", &[berlin.clone(), paris.clone()]).unwrap();
        let ba = call("GEO_DISTANCE", &[paris, berlin]).unwrap();
        assert_eq!(ab, ba);
        let meters = ab.as_f64().unwrap();
        assert!((870_000.0..890_000.0).contains(&meters), "{meters}");
    }

    #[test]
    fn accumulators_skip_nulls() {
        let mut sum = Accumulator::new(AggregateFn::Sum);
        let mut avg = Accumulator::new(AggregateFn::Avg);
        for v in [Value::Int(2), Value::Null, Value::Int(4)] {
            sum.push(&v).unwrap();
            avg.push(&v).unwrap();
        }
        assert_eq!(sum.finish(), Value::Int(6));
        assert_eq!(avg.finish(), Value::Float(3.0));
        assert_eq!(Accumulator::new(AggregateFn::Avg).finish(), Value::Null);
    }

    fn aggregate(function: AggregateFn, values: &[Value]) -> Value {
        let mut acc = Accumulator::new(function);
        for v in values {
            acc.push(v).unwrap();
        }
        acc.finish()
    }

    fn float(value: Value) -> f64 {
        value.as_f64().expect("number")
    }

    #[test]
    fn statistical_aggregates() {
        let values: Vec<Value> = (1..=10).map(Value::Int).chain([Value::Null]).collect();
        assert_eq!(aggregate(AggregateFn::Median, &values), Value::Float(5.5));
        assert!((float(aggregate(AggregateFn::Percentile(90.0), &values)) - 9.1).abs() < 1e-9);
        assert_eq!(aggregate(AggregateFn::Percentile(0.0), &values), Value::Float(1.0));
        assert_eq!(aggregate(AggregateFn::Percentile(100.0), &values), Value::Float(10.0));
        assert!((float(aggregate(AggregateFn::Variance, &values)) - 82.5 / 9.0).abs() < 1e-9);
        assert_eq!(aggregate(AggregateFn::VariancePop, &values), Value::Float(8.25));
        assert!((float(aggregate(AggregateFn::Stddev, &values)) - (82.5f64 / 9.0).sqrt()).abs() < 1e-9);
        assert_eq!(aggregate(AggregateFn::StddevPop, &values), Value::Float(8.25f64.sqrt()));
        assert_eq!(aggregate(AggregateFn::Range, &values), Value::Float(9.0));
        assert_eq!(aggregate(AggregateFn::Iqr, &values), Value::Float(4.5));
        assert_eq!(aggregate(AggregateFn::Mad, &values), Value::Float(2.5));
    }

    #[test]
    fn statistical_aggregates_on_small_inputs() {
        let one = [Value::Float(4.0)];
        assert_eq!(aggregate(AggregateFn::Median, &one), Value::Float(4.0));
        assert_eq!(aggregate(AggregateFn::Variance, &one), Value::Null);
        assert_eq!(aggregate(AggregateFn::Stddev, &one), Value::Null);
        assert_eq!(aggregate(AggregateFn::VariancePop, &one), Value::Float(0.0));
        assert_eq!(aggregate(AggregateFn::Iqr, &[Value::Int(1), Value::Int(2), Value::Int(3)]), Value::Null);
        for function in [AggregateFn::Median, AggregateFn::Range, AggregateFn::Mad] {
            assert_eq!(aggregate(function, &[]), Value::Null, "{}", function.name());
        }
        let err = Accumulator::new(AggregateFn::Median)
            .push(&Value::from("x"))
            .expect_err("not a number");
        assert!(err.to_string().contains("MEDIAN"), "{err}");
    }

    #[test]
    fn percentile_takes_a_constant_rank() {
        let percentile = AggregateFn::from_name("PERCENTILE").expect("known");
        assert_eq!(
            percentile.with_parameters(&[Value::Int(90)]),
            Ok(AggregateFn::Percentile(90.0))
        );
        assert!(percentile.with_parameters(&[Value::Int(101)]).is_err());
        assert!(percentile.with_parameters(&[]).is_err());
        assert!(AggregateFn::Median.with_parameters(&[Value::Int(1)]).is_err());
        assert_eq!(AggregateFn::from_name("STDDEV_SAMPLE"), Some(AggregateFn::Stddev));
    }

    #[test]
    fn arity_descriptions() {
        assert_eq!(lookup("SUBSTRING").unwrap().expected(), "2..3");
        assert_eq!(lookup("CONCAT").unwrap().expected(), "at least 1");
        assert!(!lookup("NEAR").unwrap().accepts(2));
    }
}
