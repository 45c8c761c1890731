use std::sync::atomic::{AtomicU64, Ordering};

use lazy_static::lazy_static;
use prometheus::{core::Collector, IntCounter, IntCounterVec, Registry};
use tracing::error;

#[derive(Default, Clone, Copy, Debug, PartialEq, Eq)]
pub struct WaitMetricsSnapshot {
    pub started: u64,
    pub resolved: u64,
    pub timed_out: u64,
    pub failed: u64,
    pub reruns: u64,
    pub recoverable: u64,
}

static STARTED: AtomicU64 = AtomicU64::new(0);
static RESOLVED: AtomicU64 = AtomicU64::new(0);
static TIMED_OUT: AtomicU64 = AtomicU64::new(0);
static FAILED: AtomicU64 = AtomicU64::new(0);
static RERUNS: AtomicU64 = AtomicU64::new(0);
static RECOVERABLE: AtomicU64 = AtomicU64::new(0);

lazy_static! {
    static ref WAIT_TASKS_STARTED: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new("soul_wait_tasks_started_total", "Wait tasks created"),
        &["polling"]
    )
    .unwrap();
    static ref WAIT_TASKS_SETTLED: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new(
            "soul_wait_tasks_settled_total",
            "Wait tasks settled, by outcome"
        ),
        &["outcome"]
    )
    .unwrap();
    static ref WAIT_TASK_RERUNS: IntCounter =
        IntCounter::new("soul_wait_task_reruns_total", "Wait task re-runs").unwrap();
    static ref WAIT_TASK_RECOVERABLE: IntCounter = IntCounter::new(
        "soul_wait_task_recoverable_total",
        "Runs interrupted by a replaced execution context",
    )
    .unwrap();
}

fn register<C>(registry: &Registry, collector: C)
where
    C: Collector + Clone + Send + Sync + 'static,
{
    if let Err(err) = registry.register(Box::new(collector.clone())) {
        if !matches!(err, prometheus::Error::AlreadyReg) {
            error!(?err, "failed to register wait metric");
        }
    }
}

pub fn register_metrics(registry: &Registry) {
    register(registry, WAIT_TASKS_STARTED.clone());
    register(registry, WAIT_TASKS_SETTLED.clone());
    register(registry, WAIT_TASK_RERUNS.clone());
    register(registry, WAIT_TASK_RECOVERABLE.clone());
}

pub fn record_started(polling: &str) {
    STARTED.fetch_add(1, Ordering::Relaxed);
    WAIT_TASKS_STARTED.with_label_values(&[polling]).inc();
}

pub fn record_resolved() {
    RESOLVED.fetch_add(1, Ordering::Relaxed);
    WAIT_TASKS_SETTLED.with_label_values(&["resolved"]).inc();
}

pub fn record_timed_out() {
    TIMED_OUT.fetch_add(1, Ordering::Relaxed);
    WAIT_TASKS_SETTLED.with_label_values(&["timeout"]).inc();
}

pub fn record_failed() {
    FAILED.fetch_add(1, Ordering::Relaxed);
    WAIT_TASKS_SETTLED.with_label_values(&["failed"]).inc();
}

pub fn record_rerun() {
    RERUNS.fetch_add(1, Ordering::Relaxed);
    WAIT_TASK_RERUNS.inc();
}

pub fn record_recoverable() {
    RECOVERABLE.fetch_add(1, Ordering::Relaxed);
    WAIT_TASK_RECOVERABLE.inc();
}

pub fn snapshot() -> WaitMetricsSnapshot {
    WaitMetricsSnapshot {
        started: STARTED.load(Ordering::Relaxed),
        resolved: RESOLVED.load(Ordering::Relaxed),
        timed_out: TIMED_OUT.load(Ordering::Relaxed),
        failed: FAILED.load(Ordering::Relaxed),
        reruns: RERUNS.load(Ordering::Relaxed),
        recoverable: RECOVERABLE.load(Ordering::Relaxed),
    }
}

pub fn reset() {
    STARTED.store(0, Ordering::Relaxed);
    RESOLVED.store(0, Ordering::Relaxed);
    TIMED_OUT.store(0, Ordering::Relaxed);
    FAILED.store(0, Ordering::Relaxed);
    RERUNS.store(0, Ordering::Relaxed);
    RECOVERABLE.store(0, Ordering::Relaxed);
}
