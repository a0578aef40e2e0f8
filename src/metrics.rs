//! Operational metrics with Prometheus
//!
//! Exposes counters for the request-time and batch paths:
//! - Assignment lookups and creations
//! - Goal completions
//! - Consolidated result records
//! - Analysis latency
//!
//! NOTE: Identities never appear in metric labels. Experiment names do not
//! either; a long-running deployment can accumulate thousands of them.

use lazy_static::lazy_static;
use prometheus::{Histogram, HistogramOpts, IntCounterVec, IntGauge, Opts, Registry};
use std::sync::Once;

lazy_static! {
    /// Global metrics registry
    pub static ref METRICS_REGISTRY: Registry = Registry::new();

    // ============================================================================
    // Request-time Metrics
    // ============================================================================

    /// Treatment lookups by outcome (existing, created, unassigned)
    pub static ref ASSIGNMENTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("scenario_assignments_total", "Treatment lookups by outcome"),
        &["outcome"]
    ).unwrap();

    /// Completion calls by result (finished, no_assignment)
    pub static ref COMPLETIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("scenario_completions_total", "Goal completion calls by result"),
        &["result"]
    ).unwrap();

    // ============================================================================
    // Batch Metrics
    // ============================================================================

    /// Raw result records consumed by consolidation (simple, multivariate, skipped)
    pub static ref CONSOLIDATED_RECORDS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("scenario_consolidated_records_total", "Raw result records consolidated"),
        &["kind"]
    ).unwrap();

    /// Sub-experiment records waiting for their siblings in the current run
    pub static ref PENDING_MULTIVARIATE: IntGauge = IntGauge::new(
        "scenario_pending_multivariate_records",
        "Sub-experiment records buffered awaiting sibling results"
    ).unwrap();

    /// Consolidate + summarize duration
    pub static ref ANALYSIS_DURATION: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "scenario_analysis_duration_seconds",
            "Experiment analysis duration"
        )
        .buckets(vec![0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0])
    ).unwrap();
}

static REGISTER: Once = Once::new();

/// Register all metrics with the global registry
///
/// Safe to call more than once; only the first call registers.
pub fn register_metrics() -> Result<(), prometheus::Error> {
    let mut result = Ok(());
    REGISTER.call_once(|| {
        result = register_all();
    });
    result
}

fn register_all() -> Result<(), prometheus::Error> {
    METRICS_REGISTRY.register(Box::new(ASSIGNMENTS_TOTAL.clone()))?;
    METRICS_REGISTRY.register(Box::new(COMPLETIONS_TOTAL.clone()))?;

    METRICS_REGISTRY.register(Box::new(CONSOLIDATED_RECORDS_TOTAL.clone()))?;
    METRICS_REGISTRY.register(Box::new(PENDING_MULTIVARIATE.clone()))?;
    METRICS_REGISTRY.register(Box::new(ANALYSIS_DURATION.clone()))?;

    Ok(())
}

/// Render the registry in Prometheus text exposition format
pub fn gather_text() -> Result<String, prometheus::Error> {
    use prometheus::Encoder;

    let encoder = prometheus::TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&METRICS_REGISTRY.gather(), &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}

/// Helper to time operations with histogram (RAII pattern)
/// Usage: let _timer = Timer::new(ANALYSIS_DURATION.clone());
pub struct Timer {
    histogram: Histogram,
    start: std::time::Instant,
}

impl Timer {
    /// Create timer that records duration to histogram on drop
    pub fn new(histogram: Histogram) -> Self {
        Self {
            histogram,
            start: std::time::Instant::now(),
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        let duration = self.start.elapsed().as_secs_f64();
        self.histogram.observe(duration);
    }
}
