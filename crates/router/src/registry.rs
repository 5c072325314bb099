//! Decode worker registry
//!
//! Holds the fixed set of decode workers and the router's load estimate for
//! each. All load mutations go through one lock around the selection heap, so
//! select-then-increment and decrement are each a single atomic step.

use crate::selection::{tie_ranks, LoadHeap};
use handoff_common::error::{Result, RouterError};
use handoff_common::TieBreak;
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::{debug, warn};

/// A decode worker and its tracked load
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerRecord {
    /// Worker base URL
    pub id: String,

    /// Outstanding work assigned to this worker
    pub load: u64,
}

/// Registry of decode workers
#[derive(Debug)]
pub struct WorkerRegistry {
    /// Worker ids in registration order; index is the worker's slot
    ids: Vec<String>,

    /// Worker id to slot
    slots: HashMap<String, usize>,

    tie_break: TieBreak,

    /// Loads and selection order
    state: Mutex<LoadHeap>,
}

impl WorkerRegistry {
    /// Build a registry with every worker at load 0
    ///
    /// Fails with a configuration error if `addresses` is empty or repeats an id.
    pub fn new<I, S>(addresses: I, tie_break: TieBreak) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let ids: Vec<String> = addresses.into_iter().map(Into::into).collect();
        if ids.is_empty() {
            return Err(RouterError::config("Decode worker list is empty"));
        }

        let mut slots = HashMap::with_capacity(ids.len());
        for (slot, id) in ids.iter().enumerate() {
            if slots.insert(id.clone(), slot).is_some() {
                return Err(RouterError::config(format!("Duplicate decode worker: {}", id)));
            }
        }

        let state = Mutex::new(LoadHeap::new(tie_ranks(&ids, tie_break)));

        Ok(Self {
            ids,
            slots,
            tie_break,
            state,
        })
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn tie_break(&self) -> TieBreak {
        self.tie_break
    }

    pub fn contains(&self, id: &str) -> bool {
        self.slots.contains_key(id)
    }

    /// Worker ids in registration order
    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    fn slot(&self, id: &str) -> Result<usize> {
        self.slots
            .get(id)
            .copied()
            .ok_or_else(|| RouterError::worker_not_found(id))
    }

    /// Look up a single worker
    pub fn get(&self, id: &str) -> Result<WorkerRecord> {
        let slot = self.slot(id)?;
        let load = self.state.lock().load(slot);
        Ok(WorkerRecord {
            id: self.ids[slot].clone(),
            load,
        })
    }

    /// Point-in-time snapshot of every worker, in registration order
    pub fn all(&self) -> Vec<WorkerRecord> {
        let state = self.state.lock();
        self.ids
            .iter()
            .zip(state.loads())
            .map(|(id, &load)| WorkerRecord {
                id: id.clone(),
                load,
            })
            .collect()
    }

    /// The worker that the next reservation would pick
    pub fn least_loaded(&self) -> Result<WorkerRecord> {
        let state = self.state.lock();
        let slot = state.peek().ok_or(RouterError::NoWorkersAvailable)?;
        Ok(WorkerRecord {
            id: self.ids[slot].clone(),
            load: state.load(slot),
        })
    }

    /// Pick the least-loaded worker and charge it `weight` in one step
    ///
    /// Returns the chosen worker with its load after the charge.
    pub fn reserve(&self, weight: u64) -> Result<WorkerRecord> {
        self.reserve_with(weight, |_, _| {})
    }

    /// [`reserve`](Self::reserve), handing the new load to `observe` while the
    /// registry lock is still held
    ///
    /// Observers therefore see every load change of a worker in order.
    pub fn reserve_with<F>(&self, weight: u64, observe: F) -> Result<WorkerRecord>
    where
        F: FnOnce(&str, u64),
    {
        let mut state = self.state.lock();
        let slot = state.peek().ok_or(RouterError::NoWorkersAvailable)?;
        let load = state.add(slot, weight);
        observe(&self.ids[slot], load);
        drop(state);

        debug!("Reserved {} on {} (load {})", weight, self.ids[slot], load);
        Ok(WorkerRecord {
            id: self.ids[slot].clone(),
            load,
        })
    }

    /// Add `weight` to a named worker
    pub fn charge(&self, id: &str, weight: u64) -> Result<u64> {
        let slot = self.slot(id)?;
        Ok(self.state.lock().add(slot, weight))
    }

    /// Subtract `weight` from a named worker, never going below zero
    pub fn release(&self, id: &str, weight: u64) -> Result<u64> {
        self.release_with(id, weight, |_, _| {})
    }

    /// [`release`](Self::release), handing the new load to `observe` under the lock
    pub fn release_with<F>(&self, id: &str, weight: u64, observe: F) -> Result<u64>
    where
        F: FnOnce(&str, u64),
    {
        let slot = self.slot(id)?;
        let mut state = self.state.lock();
        let (load, shortfall) = state.sub(slot, weight);
        observe(&self.ids[slot], load);
        drop(state);

        if shortfall > 0 {
            warn!(
                "Release of {} on {} exceeded tracked load by {}; clamped to 0",
                weight, id, shortfall
            );
        }
        Ok(load)
    }
}

impl Default for WorkerRegistry {
    /// A registry with no workers; reservations against it fail with `NoWorkersAvailable`
    fn default() -> Self {
        Self {
            ids: Vec::new(),
            slots: HashMap::new(),
            tie_break: TieBreak::default(),
            state: Mutex::new(LoadHeap::new(Vec::new())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn registry(workers: &[&str]) -> WorkerRegistry {
        WorkerRegistry::new(workers.iter().copied(), TieBreak::FirstRegistered).unwrap()
    }

    fn loads(registry: &WorkerRegistry) -> Vec<u64> {
        registry.all().into_iter().map(|r| r.load).collect()
    }

    #[test]
    fn test_new_rejects_empty_list() {
        let result = WorkerRegistry::new(Vec::<String>::new(), TieBreak::FirstRegistered);
        assert!(matches!(result, Err(RouterError::Config(_))));
    }

    #[test]
    fn test_new_rejects_duplicates() {
        let result = WorkerRegistry::new(["http://a:1", "http://a:1"], TieBreak::FirstRegistered);
        assert!(matches!(result, Err(RouterError::Config(_))));
    }

    #[test]
    fn test_get_and_not_found() {
        let registry = registry(&["http://a:1", "http://b:1"]);

        assert_eq!(
            registry.get("http://b:1").unwrap(),
            WorkerRecord {
                id: "http://b:1".into(),
                load: 0,
            }
        );
        assert!(matches!(
            registry.get("http://z:1"),
            Err(RouterError::WorkerNotFound(_))
        ));
    }

    #[test]
    fn test_empty_registry_has_no_workers_available() {
        let registry = WorkerRegistry::default();

        assert!(matches!(registry.reserve(5), Err(RouterError::NoWorkersAvailable)));
        assert!(matches!(registry.least_loaded(), Err(RouterError::NoWorkersAvailable)));
        assert!(registry.all().is_empty());
    }

    #[test]
    fn test_reserve_release_scenario() {
        let registry = registry(&["http://a:1", "http://b:1", "http://c:1"]);

        assert_eq!(registry.reserve(5).unwrap().id, "http://a:1");
        assert_eq!(loads(&registry), vec![5, 0, 0]);

        assert_eq!(registry.reserve(3).unwrap().id, "http://b:1");
        assert_eq!(loads(&registry), vec![5, 3, 0]);

        registry.release("http://a:1", 5).unwrap();
        assert_eq!(loads(&registry), vec![0, 3, 0]);

        assert_eq!(registry.reserve(1).unwrap().id, "http://a:1");
        assert_eq!(loads(&registry), vec![1, 3, 0]);
    }

    #[test]
    fn test_lowest_id_tie_break() {
        let registry =
            WorkerRegistry::new(["http://c:1", "http://a:1", "http://b:1"], TieBreak::LowestId)
                .unwrap();

        assert_eq!(registry.reserve(2).unwrap().id, "http://a:1");
        assert_eq!(registry.reserve(2).unwrap().id, "http://b:1");
        assert_eq!(registry.reserve(2).unwrap().id, "http://c:1");
    }

    #[test]
    fn test_release_never_goes_negative() {
        let registry = registry(&["http://a:1"]);
        registry.charge("http://a:1", 3).unwrap();

        assert_eq!(registry.release("http://a:1", 10).unwrap(), 0);
        assert_eq!(registry.get("http://a:1").unwrap().load, 0);
    }

    #[test]
    fn test_paired_operations_conserve_load() {
        let registry = registry(&["http://a:1", "http://b:1"]);
        registry.charge("http://b:1", 7).unwrap();

        let mut reserved = Vec::new();
        for weight in [4, 9, 1, 6, 2] {
            reserved.push((registry.reserve(weight).unwrap().id, weight));
        }
        for (id, weight) in reserved {
            registry.release(&id, weight).unwrap();
        }

        assert_eq!(loads(&registry), vec![0, 7]);
    }

    #[test]
    fn test_observers_see_load_under_lock() {
        let registry = registry(&["http://a:1", "http://b:1"]);
        let mut seen = Vec::new();

        registry
            .reserve_with(4, |id, load| seen.push((id.to_string(), load)))
            .unwrap();
        registry
            .release_with("http://a:1", 10, |id, load| seen.push((id.to_string(), load)))
            .unwrap();

        assert_eq!(
            seen,
            vec![("http://a:1".to_string(), 4), ("http://a:1".to_string(), 0)]
        );
        assert!(registry
            .release_with("http://z:1", 1, |_, _| panic!("unknown worker observed"))
            .is_err());
    }

    #[test]
    fn test_concurrent_reservations_have_no_lost_updates() {
        let registry = Arc::new(registry(&["http://a:1"]));
        let threads = 16;
        let per_thread = 500;
        let weight = 3;

        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    for _ in 0..per_thread {
                        registry.reserve(weight).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(
            registry.get("http://a:1").unwrap().load,
            threads * per_thread * weight
        );
    }
}
