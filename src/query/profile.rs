//! Execution metrics returned with explain responses, plus process-wide
//! phase timers enabled by the `PENUMBRA_PROFILE` environment variable.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Instant;

use serde::Serialize;

/// Counters collected while executing one query with explain enabled.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Metrics {
    /// Documents or vertices produced by access paths.
    pub rows_scanned: u64,
    /// Index, ranked or sweep calls issued to storage.
    pub index_lookups: u64,
    /// Adjacency entries examined by traversals.
    pub edges_expanded: u64,
    /// Last-level candidates rejected before being emitted.
    pub pruned_last_level: u64,
    /// Candidates rejected by `PATH_ALL`/`PATH_NONE`.
    pub path_constraint_rejections: u64,
    /// Row-level filter evaluations.
    pub filter_evaluations_total: u64,
    /// Filter evaluations in which AND/OR skipped an operand.
    pub filter_short_circuits: u64,
    /// Vertices expanded per depth.
    pub frontier_processed_per_depth: BTreeMap<u32, u64>,
    /// Vertices discovered per depth.
    pub enqueued_per_depth: BTreeMap<u32, u64>,
    /// The constant filter was checked before touching storage.
    pub constant_filter_precheck: bool,
    /// Outcome of that check.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub constant_filter_result: Option<bool>,
    /// Largest frontier observed.
    pub max_frontier_size_reached: u64,
    /// Times a frontier exceeded the configured size.
    pub frontier_limit_hits: u64,
    /// Wall-clock execution time.
    pub elapsed_us: u64,
}

impl Metrics {
    /// Adds `n` to the per-depth counter.
    pub fn bump(map: &mut BTreeMap<u32, u64>, depth: u32, n: u64) {
        *map.entry(depth).or_default() += n;
    }
}

/// Totals of the process-wide phase timers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueryProfileSnapshot {
    /// Nanoseconds spent parsing.
    pub parse_ns: u64,
    /// Number of parses.
    pub parse_count: u64,
    /// Nanoseconds spent translating and planning.
    pub plan_ns: u64,
    /// Number of plans.
    pub plan_count: u64,
    /// Nanoseconds spent in storage and index calls.
    pub fetch_ns: u64,
    /// Number of storage and index calls.
    pub fetch_count: u64,
    /// Nanoseconds spent expanding traversal frontiers.
    pub expand_ns: u64,
    /// Number of frontier expansions.
    pub expand_count: u64,
    /// Nanoseconds spent filtering rows.
    pub filter_ns: u64,
    /// Number of filter passes.
    pub filter_count: u64,
}

#[derive(Default)]
struct QueryProfileCounters {
    parse_ns: AtomicU64,
    parse_count: AtomicU64,
    plan_ns: AtomicU64,
    plan_count: AtomicU64,
    fetch_ns: AtomicU64,
    fetch_count: AtomicU64,
    expand_ns: AtomicU64,
    expand_count: AtomicU64,
    filter_ns: AtomicU64,
    filter_count: AtomicU64,
}

static PROFILE_ENABLED: OnceLock<bool> = OnceLock::new();
static PROFILE_COUNTERS: OnceLock<QueryProfileCounters> = OnceLock::new();

fn profiling_enabled() -> bool {
    *PROFILE_ENABLED.get_or_init(|| std::env::var_os("PENUMBRA_PROFILE").is_some())
}

/// Turns the phase timers on regardless of `PENUMBRA_PROFILE`; returns
/// whether they are on. Has no effect once a timer has already run disabled.
pub fn enable_profiling() -> bool {
    let _ = PROFILE_ENABLED.set(true);
    profiling_enabled()
}

fn counters() -> Option<&'static QueryProfileCounters> {
    profiling_enabled().then(|| PROFILE_COUNTERS.get_or_init(QueryProfileCounters::default))
}

pub(crate) fn profile_timer() -> Option<Instant> {
    profiling_enabled().then(Instant::now)
}

pub(crate) enum QueryProfileKind {
    Parse,
    Plan,
    Fetch,
    Expand,
    Filter,
}

pub(crate) fn record_profile_timer(kind: QueryProfileKind, start: Option<Instant>) {
    let Some(start) = start else {
        return;
    };
    let Some(counters) = counters() else {
        return;
    };
    let nanos = start.elapsed().as_nanos().min(u64::MAX as u128) as u64;
    let (ns, count) = match kind {
        QueryProfileKind::Parse => (&counters.parse_ns, &counters.parse_count),
        QueryProfileKind::Plan => (&counters.plan_ns, &counters.plan_count),
        QueryProfileKind::Fetch => (&counters.fetch_ns, &counters.fetch_count),
        QueryProfileKind::Expand => (&counters.expand_ns, &counters.expand_count),
        QueryProfileKind::Filter => (&counters.filter_ns, &counters.filter_count),
    };
    ns.fetch_add(nanos, Ordering::Relaxed);
    count.fetch_add(1, Ordering::Relaxed);
}

/// Current phase timer totals, or `None` while profiling is off.
///
/// With `reset` the counters are zeroed as they are read.
pub fn profile_snapshot(reset: bool) -> Option<QueryProfileSnapshot> {
    let counters = counters()?;
    let load = |counter: &AtomicU64| {
        if reset {
            counter.swap(0, Ordering::Relaxed)
        } else {
            counter.load(Ordering::Relaxed)
        }
    };
    Some(QueryProfileSnapshot {
        parse_ns: load(&counters.parse_ns),
        parse_count: load(&counters.parse_count),
        plan_ns: load(&counters.plan_ns),
        plan_count: load(&counters.plan_count),
        fetch_ns: load(&counters.fetch_ns),
        fetch_count: load(&counters.fetch_count),
        expand_ns: load(&counters.expand_ns),
        expand_count: load(&counters.expand_count),
        filter_ns: load(&counters.filter_ns),
        filter_count: load(&counters.filter_count),
    })
}
