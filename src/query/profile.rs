use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Instant;

/// A snapshot of query profiling metrics.
///
/// Profiling is enabled via the `SPINDLE_PROFILE` environment variable and
/// tracks time spent in the optimizer and in the executor's pull protocol.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryProfileSnapshot {
    /// Total nanoseconds spent in optimizer rules.
    pub optimize_ns: u64,
    /// Number of optimizer runs.
    pub optimize_count: u64,
    /// Total nanoseconds spent instantiating block trees.
    pub build_ns: u64,
    /// Number of block trees built.
    pub build_count: u64,
    /// Total nanoseconds spent serving top-level pulls.
    pub pull_ns: u64,
    /// Number of top-level pulls.
    pub pull_count: u64,
    /// Total nanoseconds spent in `skip` calls issued by limit blocks.
    pub skip_ns: u64,
    /// Number of `skip` calls issued by limit blocks.
    pub skip_count: u64,
}

#[derive(Default)]
struct QueryProfileCounters {
    optimize_ns: AtomicU64,
    optimize_count: AtomicU64,
    build_ns: AtomicU64,
    build_count: AtomicU64,
    pull_ns: AtomicU64,
    pull_count: AtomicU64,
    skip_ns: AtomicU64,
    skip_count: AtomicU64,
}

static PROFILE_ENABLED: OnceLock<bool> = OnceLock::new();
static PROFILE_COUNTERS: OnceLock<QueryProfileCounters> = OnceLock::new();

fn profiling_enabled() -> bool {
    *PROFILE_ENABLED.get_or_init(|| std::env::var_os("SPINDLE_PROFILE").is_some())
}

fn counters() -> Option<&'static QueryProfileCounters> {
    profiling_enabled().then(|| PROFILE_COUNTERS.get_or_init(QueryProfileCounters::default))
}

pub(crate) fn profile_timer() -> Option<Instant> {
    profiling_enabled().then(Instant::now)
}

pub(crate) enum QueryProfileKind {
    /// Optimizer rule application.
    Optimize,
    /// Block tree construction.
    Build,
    /// One top-level pull.
    Pull,
    /// Offset or drain skip issued by a limit block.
    Skip,
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
        QueryProfileKind::Optimize => (&counters.optimize_ns, &counters.optimize_count),
        QueryProfileKind::Build => (&counters.build_ns, &counters.build_count),
        QueryProfileKind::Pull => (&counters.pull_ns, &counters.pull_count),
        QueryProfileKind::Skip => (&counters.skip_ns, &counters.skip_count),
    };
    ns.fetch_add(nanos, Ordering::Relaxed);
    count.fetch_add(1, Ordering::Relaxed);
}

/// Retrieves a snapshot of current query profiling metrics.
///
/// Returns `None` when `SPINDLE_PROFILE` is not set. With `reset`, counters are
/// zeroed after reading.
///
/// ```no_run
/// use spindle::query::profile::profile_snapshot;
///
/// if let Some(snapshot) = profile_snapshot(false) {
///     println!("pulls: {} in {}ns", snapshot.pull_count, snapshot.pull_ns);
/// }
/// ```
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
        optimize_ns: load(&counters.optimize_ns),
        optimize_count: load(&counters.optimize_count),
        build_ns: load(&counters.build_ns),
        build_count: load(&counters.build_count),
        pull_ns: load(&counters.pull_ns),
        pull_count: load(&counters.pull_count),
        skip_ns: load(&counters.skip_ns),
        skip_count: load(&counters.skip_count),
    })
}
