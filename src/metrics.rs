use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_int_counter, register_int_gauge, Encoder, Histogram, IntCounter,
    IntGauge, TextEncoder,
};
use std::time::Instant;

lazy_static! {
    // Job metrics
    pub static ref JOBS_STARTED: IntCounter = register_int_counter!(
        "jobs_started_total",
        "Total number of streaming computations started"
    ).unwrap();

    pub static ref JOBS_REUSED: IntCounter = register_int_counter!(
        "jobs_reused_total",
        "Total number of queries answered by an already running job"
    ).unwrap();

    pub static ref JOBS_STOPPED: IntCounter = register_int_counter!(
        "jobs_stopped_total",
        "Total number of streaming computations stopped"
    ).unwrap();

    pub static ref JOBS_ACTIVE: IntGauge = register_int_gauge!(
        "jobs_active",
        "Number of streaming computations currently running"
    ).unwrap();

    // Connection metrics
    pub static ref STREAM_CONNECTIONS: IntCounter = register_int_counter!(
        "stream_connections_total",
        "Total number of streaming connections opened"
    ).unwrap();

    // Query metrics
    pub static ref QUERY_DURATION: Histogram = register_histogram!(
        "query_duration_seconds",
        "Time from receiving a query batch until every target is answered",
        vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.0, 5.0, 15.0, 30.0]
    ).unwrap();
}

pub struct QueryTimer {
    start: Instant,
}

impl QueryTimer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for QueryTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for QueryTimer {
    fn drop(&mut self) {
        QUERY_DURATION.observe(self.start.elapsed().as_secs_f64());
    }
}

pub fn record_job_started() {
    JOBS_STARTED.inc();
    JOBS_ACTIVE.inc();
}

pub fn record_job_stopped() {
    JOBS_STOPPED.inc();
    JOBS_ACTIVE.dec();
}

pub fn record_job_reused() {
    JOBS_REUSED.inc();
}

pub fn record_connection() {
    STREAM_CONNECTIONS.inc();
}

/// Renders every registered metric in the prometheus text format.
pub fn gather_text() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
    }
    String::from_utf8(buffer).unwrap_or_default()
}
