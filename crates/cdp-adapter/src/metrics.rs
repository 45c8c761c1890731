use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use lazy_static::lazy_static;
use prometheus::{
    core::Collector, histogram_opts, HistogramVec, IntCounter, IntCounterVec, Registry,
};
use tracing::error;

#[derive(Default, Clone, Copy, Debug, PartialEq, Eq)]
pub struct AdapterMetricsSnapshot {
    pub commands: u64,
    pub command_success: u64,
    pub command_failures: u64,
    pub command_latency_total_us: u64,
    pub events: u64,
    pub contexts_created: u64,
    pub contexts_dropped: u64,
    pub binding_calls: u64,
}

static COMMANDS: AtomicU64 = AtomicU64::new(0);
static COMMAND_SUCCESS: AtomicU64 = AtomicU64::new(0);
static COMMAND_FAILURES: AtomicU64 = AtomicU64::new(0);
static COMMAND_LATENCY_TOTAL_US: AtomicU64 = AtomicU64::new(0);
static EVENTS: AtomicU64 = AtomicU64::new(0);
static CONTEXTS_CREATED: AtomicU64 = AtomicU64::new(0);
static CONTEXTS_DROPPED: AtomicU64 = AtomicU64::new(0);
static BINDING_CALLS: AtomicU64 = AtomicU64::new(0);

lazy_static! {
    static ref CDP_COMMANDS_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new("soul_cdp_commands_total", "Total CDP commands executed"),
        &["method"]
    )
    .unwrap();
    static ref CDP_COMMAND_FAILURES_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new(
            "soul_cdp_command_failures_total",
            "Total CDP command failures, by error kind"
        ),
        &["method", "kind"]
    )
    .unwrap();
    static ref CDP_COMMAND_DURATION: HistogramVec = HistogramVec::new(
        histogram_opts!(
            "soul_cdp_command_duration_seconds",
            "CDP command latency",
            vec![0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 5.0]
        ),
        &["method"]
    )
    .unwrap();
    static ref CDP_EVENTS_TOTAL: IntCounter =
        IntCounter::new("soul_cdp_events_total", "Total CDP events consumed").unwrap();
    static ref CDP_CONTEXT_EVENTS_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new(
            "soul_cdp_context_events_total",
            "Main-frame execution context lifecycle"
        ),
        &["event"]
    )
    .unwrap();
    static ref CDP_BINDING_CALLS_TOTAL: IntCounter = IntCounter::new(
        "soul_cdp_binding_calls_total",
        "Binding invocations dispatched to host handlers",
    )
    .unwrap();
}

fn register<C>(registry: &Registry, collector: C)
where
    C: Collector + Clone + Send + Sync + 'static,
{
    if let Err(err) = registry.register(Box::new(collector.clone())) {
        if !matches!(err, prometheus::Error::AlreadyReg) {
            error!(?err, "failed to register cdp metric");
        }
    }
}

pub fn register_metrics(registry: &Registry) {
    register(registry, CDP_COMMANDS_TOTAL.clone());
    register(registry, CDP_COMMAND_FAILURES_TOTAL.clone());
    register(registry, CDP_COMMAND_DURATION.clone());
    register(registry, CDP_EVENTS_TOTAL.clone());
    register(registry, CDP_CONTEXT_EVENTS_TOTAL.clone());
    register(registry, CDP_BINDING_CALLS_TOTAL.clone());
}

pub fn record_command(method: &str) {
    COMMANDS.fetch_add(1, Ordering::Relaxed);
    CDP_COMMANDS_TOTAL.with_label_values(&[method]).inc();
}

pub fn record_command_success(method: &str, duration: Duration) {
    COMMAND_SUCCESS.fetch_add(1, Ordering::Relaxed);
    let micros = duration.as_micros().min(u64::MAX as u128) as u64;
    COMMAND_LATENCY_TOTAL_US.fetch_add(micros, Ordering::Relaxed);
    CDP_COMMAND_DURATION
        .with_label_values(&[method])
        .observe(duration.as_secs_f64());
}

pub fn record_command_failure(method: &str, kind: &str) {
    COMMAND_FAILURES.fetch_add(1, Ordering::Relaxed);
    CDP_COMMAND_FAILURES_TOTAL
        .with_label_values(&[method, kind])
        .inc();
}

pub fn record_event() {
    EVENTS.fetch_add(1, Ordering::Relaxed);
    CDP_EVENTS_TOTAL.inc();
}

pub fn record_context_created() {
    CONTEXTS_CREATED.fetch_add(1, Ordering::Relaxed);
    CDP_CONTEXT_EVENTS_TOTAL.with_label_values(&["created"]).inc();
}

pub fn record_context_dropped() {
    CONTEXTS_DROPPED.fetch_add(1, Ordering::Relaxed);
    CDP_CONTEXT_EVENTS_TOTAL.with_label_values(&["dropped"]).inc();
}

pub fn record_binding_call() {
    BINDING_CALLS.fetch_add(1, Ordering::Relaxed);
    CDP_BINDING_CALLS_TOTAL.inc();
}

pub fn snapshot() -> AdapterMetricsSnapshot {
    AdapterMetricsSnapshot {
        commands: COMMANDS.load(Ordering::Relaxed),
        command_success: COMMAND_SUCCESS.load(Ordering::Relaxed),
        command_failures: COMMAND_FAILURES.load(Ordering::Relaxed),
        command_latency_total_us: COMMAND_LATENCY_TOTAL_US.load(Ordering::Relaxed),
        events: EVENTS.load(Ordering::Relaxed),
        contexts_created: CONTEXTS_CREATED.load(Ordering::Relaxed),
        contexts_dropped: CONTEXTS_DROPPED.load(Ordering::Relaxed),
        binding_calls: BINDING_CALLS.load(Ordering::Relaxed),
    }
}

pub fn reset() {
    for counter in [
        &COMMANDS,
        &COMMAND_SUCCESS,
        &COMMAND_FAILURES,
        &COMMAND_LATENCY_TOTAL_US,
        &EVENTS,
        &CONTEXTS_CREATED,
        &CONTEXTS_DROPPED,
        &BINDING_CALLS,
    ] {
        counter.store(0, Ordering::Relaxed);
    }
}
