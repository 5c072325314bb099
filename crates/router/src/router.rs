//! Reservation and dispatch lifecycle
//!
//! A request moves UNRESERVED -> RESERVED (load += w) -> RELEASED (load -= w).
//! Reservation charges the least-loaded worker and grants a lease; dispatch
//! consumes the lease, forwards to the worker and releases the weight whether
//! the worker call succeeds, fails, times out or is cancelled.

use crate::lease::LeaseTable;
use crate::registry::WorkerRegistry;
use crate::worker_client::{DecodeClient, DecodeResponse};
use handoff_common::error::{Result, RouterError};
use handoff_common::{RouterConfig, RouterMetrics};
use handoff_protocol::{DispatchRequest, GenerateRequest, ReservationResponse, WorkerLoad};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Load charged for a request: the character count of its prompt text
pub fn load_weight(text: &str) -> u64 {
    text.chars().count() as u64
}

/// Decode router state shared by all request handlers
#[derive(Debug)]
pub struct DecodeRouter {
    registry: WorkerRegistry,
    leases: LeaseTable,
    client: DecodeClient,
    metrics: RouterMetrics,
}

impl DecodeRouter {
    /// Create a router over an existing registry
    pub fn new(
        registry: WorkerRegistry,
        client: DecodeClient,
        lease_ttl: Duration,
    ) -> Result<Self> {
        let metrics = RouterMetrics::new()?;
        for id in registry.ids() {
            metrics.set_worker_load(id, 0);
        }

        Ok(Self {
            registry,
            leases: LeaseTable::new(lease_ttl),
            client,
            metrics,
        })
    }

    /// Create a router from validated configuration
    pub fn from_config(config: &RouterConfig) -> Result<Self> {
        config.validate()?;

        let registry = WorkerRegistry::new(config.worker_addresses(), config.selection.tie_break)?;
        let client = DecodeClient::new(config.request_timeout(), config.connect_timeout())?;

        info!(
            "Registered {} decode workers (tie-break: {})",
            registry.len(),
            registry.tie_break()
        );
        Self::new(registry, client, config.reservation_ttl())
    }

    pub fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    pub fn leases(&self) -> &LeaseTable {
        &self.leases
    }

    pub fn metrics(&self) -> &RouterMetrics {
        &self.metrics
    }

    /// Select the least-loaded decode worker for a finished prefill and charge it
    pub fn reserve(&self, text: &str) -> Result<ReservationResponse> {
        let weight = load_weight(text);

        let record = self
            .registry
            .reserve_with(weight, |id, load| self.metrics.set_worker_load(id, load))
            .map_err(|e| {
                if matches!(e, RouterError::NoWorkersAvailable) {
                    self.metrics.no_workers_available.inc();
                }
                error!("Reservation failed: {}", e);
                e
            })?;
        let lease = self.leases.grant(&record.id, weight);

        self.metrics.reservations_total.inc();
        info!(
            "Prefill finished, selected decode worker {} (weight {}, load {})",
            record.id, weight, record.load
        );

        Ok(ReservationResponse {
            decode_worker_url: record.id.clone(),
            decode_worker_id: record.id,
            reservation_id: lease.id,
            lease_expires_in_ms: u64::try_from(self.leases.ttl().as_millis()).unwrap_or(u64::MAX),
        })
    }

    /// Forward a decode request to its reserved worker and release the reservation
    pub async fn dispatch(&self, request: &DispatchRequest) -> Result<DecodeResponse> {
        let worker = request.decode_worker_id.as_str();

        if !self.registry.contains(worker) {
            self.metrics.worker_not_found.inc();
            warn!("Dispatch to unknown decode worker {}", worker);
            return Err(RouterError::worker_not_found(worker));
        }

        let weight = self.claim_weight(worker, request)?;
        let _in_flight = InFlight::start(self, worker, weight);

        debug!("Dispatching decode request to {} (weight {})", worker, weight);
        let timer = self.metrics.upstream_duration.start_timer();
        let result = self.client.generate(worker, &GenerateRequest::from(request)).await;
        timer.observe_duration();

        match &result {
            Ok(_) => {
                self.metrics.dispatch_success.inc();
                info!("Decode request completed on {}", worker);
            }
            Err(e) => {
                self.metrics.dispatch_failed.inc();
                error!("Decode request failed: {}", e);
            }
        }
        result
    }

    /// Weight to release for this dispatch, consuming its lease
    fn claim_weight(&self, worker: &str, request: &DispatchRequest) -> Result<u64> {
        let lease = match request.reservation_id {
            Some(id) => {
                let lease = self.leases.take(&id, worker)?;
                if lease.is_none() {
                    warn!(
                        "Reservation {} is no longer outstanding; its load was already released",
                        id
                    );
                }
                lease
            }
            None => {
                let weight = load_weight(&request.text);
                let lease = self.leases.claim_oldest(worker, weight);
                if lease.is_none() {
                    warn!(
                        "No outstanding reservation of {} on {}; nothing to release",
                        weight, worker
                    );
                }
                lease
            }
        };

        Ok(lease.map_or(0, |lease| lease.weight))
    }

    fn release(&self, worker: &str, weight: u64) {
        if weight == 0 {
            return;
        }

        let observe = |id: &str, load: u64| self.metrics.set_worker_load(id, load);
        match self.registry.release_with(worker, weight, observe) {
            Ok(load) => {
                debug!("Released {} from {} (load {})", weight, worker, load);
            }
            Err(e) => warn!("Failed to release {} from {}: {}", weight, worker, e),
        }
    }

    /// Release every lease that has expired, returning how many were reclaimed
    pub fn reap_expired(&self) -> usize {
        let expired = self.leases.reap_expired(Instant::now());

        for lease in &expired {
            warn!(
                "Reservation {} on {} expired unclaimed; releasing {}",
                lease.id, lease.worker_id, lease.weight
            );
            self.release(&lease.worker_id, lease.weight);
        }

        self.metrics.leases_expired.inc_by(expired.len() as u64);
        expired.len()
    }

    /// Current load and outstanding reservations per worker, in registration order
    pub fn worker_loads(&self) -> Vec<WorkerLoad> {
        let outstanding = self.leases.outstanding_by_worker();
        self.registry
            .all()
            .into_iter()
            .map(|record| WorkerLoad {
                outstanding_reservations: outstanding.get(&record.id).copied().unwrap_or(0),
                decode_worker_id: record.id,
                load: record.load,
            })
            .collect()
    }

    /// Start background task reclaiming expired reservations
    pub fn start_lease_sweeper(self: Arc<Self>, period: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                interval.tick().await;

                let reclaimed = self.reap_expired();
                if reclaimed > 0 {
                    info!("Lease sweep reclaimed {} reservations", reclaimed);
                }
            }
        })
    }
}

/// Holds a dispatch's weight until the dispatch future completes or is dropped
struct InFlight<'a> {
    router: &'a DecodeRouter,
    worker: &'a str,
    weight: u64,
}

impl<'a> InFlight<'a> {
    fn start(router: &'a DecodeRouter, worker: &'a str, weight: u64) -> Self {
        router.metrics.active_dispatches.inc();
        Self {
            router,
            worker,
            weight,
        }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.router.metrics.active_dispatches.dec();
        self.router.release(self.worker, self.weight);
    }
}
