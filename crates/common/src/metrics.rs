//! Metrics collection for Handoff
//!
//! Prometheus metrics for the decode router. Each router instance owns its own
//! registry so several routers can live in one process.

use crate::error::{Result, RouterError};
use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, IntGaugeVec, Opts, Registry};
use std::fmt;
use std::sync::Arc;

/// Metrics registry for the decode router
#[derive(Clone)]
pub struct RouterMetrics {
    pub registry: Arc<Registry>,

    /// Successful reservations
    pub reservations_total: IntCounter,

    /// Dispatches relayed back with a worker response
    pub dispatch_success: IntCounter,

    /// Dispatches that failed upstream
    pub dispatch_failed: IntCounter,

    /// Reservations rejected because no workers are registered
    pub no_workers_available: IntCounter,

    /// Dispatches naming an unknown worker
    pub worker_not_found: IntCounter,

    /// Leases reclaimed by the sweeper
    pub leases_expired: IntCounter,

    /// Dispatches currently waiting on a decode worker
    pub active_dispatches: IntGauge,

    /// Tracked load per decode worker
    pub worker_load: IntGaugeVec,

    /// Decode worker response time
    pub upstream_duration: Histogram,
}

impl RouterMetrics {
    /// Create a new metrics registry
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new());

        let reservations_total = IntCounter::new(
            "router_reservations_total",
            "Total number of decode worker reservations",
        )?;

        let dispatch_success = IntCounter::new(
            "router_dispatch_success_total",
            "Total number of decode dispatches that succeeded",
        )?;

        let dispatch_failed = IntCounter::new(
            "router_dispatch_failed_total",
            "Total number of decode dispatches that failed upstream",
        )?;

        let no_workers_available = IntCounter::new(
            "router_no_workers_available_total",
            "Total reservations rejected due to no workers",
        )?;

        let worker_not_found = IntCounter::new(
            "router_worker_not_found_total",
            "Total dispatches referencing an unknown worker",
        )?;

        let leases_expired = IntCounter::new(
            "router_leases_expired_total",
            "Total reservation leases reclaimed after expiry",
        )?;

        let active_dispatches = IntGauge::new(
            "router_active_dispatches",
            "Current number of in-flight decode dispatches",
        )?;

        let worker_load = IntGaugeVec::new(
            Opts::new("router_worker_load", "Tracked load per decode worker"),
            &["worker"],
        )?;

        let upstream_duration = Histogram::with_opts(
            HistogramOpts::new(
                "router_upstream_duration_seconds",
                "Decode worker response time in seconds",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 300.0]),
        )?;

        registry.register(Box::new(reservations_total.clone()))?;
        registry.register(Box::new(dispatch_success.clone()))?;
        registry.register(Box::new(dispatch_failed.clone()))?;
        registry.register(Box::new(no_workers_available.clone()))?;
        registry.register(Box::new(worker_not_found.clone()))?;
        registry.register(Box::new(leases_expired.clone()))?;
        registry.register(Box::new(active_dispatches.clone()))?;
        registry.register(Box::new(worker_load.clone()))?;
        registry.register(Box::new(upstream_duration.clone()))?;

        Ok(RouterMetrics {
            registry,
            reservations_total,
            dispatch_success,
            dispatch_failed,
            no_workers_available,
            worker_not_found,
            leases_expired,
            active_dispatches,
            worker_load,
            upstream_duration,
        })
    }

    /// Record a worker's current load
    pub fn set_worker_load(&self, worker: &str, load: u64) {
        self.worker_load
            .with_label_values(&[worker])
            .set(i64::try_from(load).unwrap_or(i64::MAX));
    }

    /// Gather all metrics as text
    pub fn gather(&self) -> Result<String> {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| RouterError::internal(format!("Failed to encode metrics: {}", e)))?;
        String::from_utf8(buffer).map_err(|e| RouterError::internal(e.to_string()))
    }
}

impl fmt::Debug for RouterMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouterMetrics")
            .field("reservations_total", &self.reservations_total.get())
            .field("active_dispatches", &self.active_dispatches.get())
            .finish_non_exhaustive()
    }
}
