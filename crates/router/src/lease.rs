//! Reservation leases
//!
//! Every reservation is recorded as a lease carrying the charged worker and
//! weight. A lease is consumed exactly once: by the dispatch that presents its
//! token, by a token-less dispatch that matches it, or by the sweeper once it
//! expires. The consumer is responsible for releasing the weight.

use handoff_common::error::{Result, RouterError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// An outstanding reservation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub id: Uuid,
    pub worker_id: String,
    pub weight: u64,
    pub expires_at: Instant,

    /// Grant order, used to pick the oldest match
    seq: u64,
}

#[derive(Debug, Default)]
struct LeaseBook {
    next_seq: u64,
    leases: HashMap<Uuid, Lease>,
}

/// Table of outstanding reservation leases
#[derive(Debug)]
pub struct LeaseTable {
    ttl: Duration,
    book: Mutex<LeaseBook>,
}

impl LeaseTable {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            book: Mutex::new(LeaseBook::default()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn len(&self) -> usize {
        self.book.lock().leases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Record a reservation of `weight` on `worker_id`
    pub fn grant(&self, worker_id: impl Into<String>, weight: u64) -> Lease {
        let mut book = self.book.lock();
        let seq = book.next_seq;
        book.next_seq += 1;

        let lease = Lease {
            id: Uuid::new_v4(),
            worker_id: worker_id.into(),
            weight,
            expires_at: Instant::now() + self.ttl,
            seq,
        };
        book.leases.insert(lease.id, lease.clone());
        lease
    }

    /// Remove the lease with `id`, provided it was granted on `worker_id`
    ///
    /// Returns `Ok(None)` when the lease is unknown (already consumed or
    /// reclaimed). A lease granted on another worker is left in place and
    /// reported as invalid input.
    pub fn take(&self, id: &Uuid, worker_id: &str) -> Result<Option<Lease>> {
        let mut book = self.book.lock();
        let owner = match book.leases.get(id) {
            Some(lease) => lease.worker_id.clone(),
            None => return Ok(None),
        };

        if owner != worker_id {
            return Err(RouterError::invalid_input(format!(
                "Reservation {} was granted on {}, not {}",
                id, owner, worker_id
            )));
        }
        Ok(book.leases.remove(id))
    }

    /// Remove the oldest lease on `worker_id` with exactly `weight`
    pub fn claim_oldest(&self, worker_id: &str, weight: u64) -> Option<Lease> {
        let mut book = self.book.lock();
        let id = book
            .leases
            .values()
            .filter(|lease| lease.worker_id == worker_id && lease.weight == weight)
            .min_by_key(|lease| lease.seq)
            .map(|lease| lease.id)?;
        book.leases.remove(&id)
    }

    /// Remove and return every lease that expired at or before `now`
    pub fn reap_expired(&self, now: Instant) -> Vec<Lease> {
        let mut book = self.book.lock();
        let expired: Vec<Uuid> = book
            .leases
            .values()
            .filter(|lease| lease.expires_at <= now)
            .map(|lease| lease.id)
            .collect();

        let mut reaped: Vec<Lease> = expired
            .iter()
            .filter_map(|id| book.leases.remove(id))
            .collect();
        reaped.sort_by_key(|lease| lease.seq);
        reaped
    }

    /// Outstanding lease count per worker
    pub fn outstanding_by_worker(&self) -> HashMap<String, usize> {
        let book = self.book.lock();
        let mut counts = HashMap::new();
        for lease in book.leases.values() {
            *counts.entry(lease.worker_id.clone()).or_insert(0) += 1;
        }
        counts
    }
}
