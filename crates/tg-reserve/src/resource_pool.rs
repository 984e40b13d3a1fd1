//! ResourcePool - named counters with guarded decrement-with-floor
//!
//! - One mutex per counter; the registry map is only used for lookup, so
//!   unrelated counters never contend on the same lock
//! - Check-then-mutate happens inside a single critical section
//! - No I/O, sleeping or awaiting while a counter lock is held

use std::sync::Arc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use tracing::{debug, info};

use tg_common::{CounterSnapshot, DecrementResult};
use crate::error::ReserveError;
use crate::service_metrics;
use crate::Result;

/// A single bounded counter. `level` is only touched under its own mutex.
struct Counter {
    name: Arc<str>,
    capacity: u32,
    level: Mutex<u32>,
    /// Gate that must be held while a reservation against this counter is in service
    gate: Option<Arc<str>>,
}

/// Registry of named counters
pub struct ResourcePool {
    counters: DashMap<Arc<str>, Arc<Counter>>,
}

impl ResourcePool {
    pub fn new() -> Self {
        Self {
            counters: DashMap::new(),
        }
    }

    /// Register a counter with the given capacity and starting level
    pub fn register(&self, name: &str, capacity: u32, initial_level: u32) -> Result<()> {
        self.register_gated(name, capacity, initial_level, None)
    }

    /// Register a counter whose reservations must hold a ticket from `gate`
    pub fn register_gated(
        &self,
        name: &str,
        capacity: u32,
        initial_level: u32,
        gate: Option<&str>,
    ) -> Result<()> {
        if initial_level > capacity {
            return Err(ReserveError::InvalidArgument(format!(
                "initial level {} exceeds capacity {} for {}",
                initial_level, capacity, name
            )));
        }

        match self.counters.entry(Arc::from(name)) {
            Entry::Occupied(_) => Err(ReserveError::DuplicateResource(name.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(Counter {
                    name: Arc::from(name),
                    capacity,
                    level: Mutex::new(initial_level),
                    gate: gate.map(Arc::from),
                }));
                info!(resource = %name, capacity, level = initial_level, gate = ?gate, "Counter registered");
                service_metrics::set_counter_level(name, initial_level);
                Ok(())
            }
        }
    }

    /// Look up a counter and release the map guard before returning
    fn counter(&self, name: &str) -> Result<Arc<Counter>> {
        self.counters
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| ReserveError::UnknownResource(name.to_string()))
    }

    /// Atomically subtract `amount` if the level allows it.
    ///
    /// Denial is not an error: the result carries `granted: false` and the
    /// unchanged level.
    pub fn try_decrement(&self, name: &str, amount: u32) -> Result<DecrementResult> {
        if amount == 0 {
            return Err(ReserveError::InvalidArgument(format!(
                "amount must be positive (resource {})",
                name
            )));
        }
        let counter = self.counter(name)?;

        let result = {
            let mut level = counter.level.lock();
            if *level >= amount {
                *level -= amount;
                DecrementResult { granted: true, new_level: *level }
            } else {
                DecrementResult { granted: false, new_level: *level }
            }
        };

        debug!(
            resource = %counter.name,
            amount,
            granted = result.granted,
            level = result.new_level,
            "Decrement attempted"
        );
        if result.granted {
            service_metrics::set_counter_level(&counter.name, result.new_level);
        }
        Ok(result)
    }

    /// Return `amount` units to a counter (refund / restock).
    ///
    /// Fails without mutating when the result would exceed capacity.
    pub fn release(&self, name: &str, amount: u32) -> Result<u32> {
        if amount == 0 {
            return Err(ReserveError::InvalidArgument(format!(
                "amount must be positive (resource {})",
                name
            )));
        }
        let counter = self.counter(name)?;

        let new_level = {
            let mut level = counter.level.lock();
            match level.checked_add(amount) {
                Some(next) if next <= counter.capacity => {
                    *level = next;
                    next
                }
                _ => {
                    return Err(ReserveError::CapacityExceeded {
                        resource: name.to_string(),
                        level: *level,
                        amount,
                        capacity: counter.capacity,
                    });
                }
            }
        };

        debug!(resource = %counter.name, amount, level = new_level, "Units released");
        service_metrics::set_counter_level(&counter.name, new_level);
        Ok(new_level)
    }

    /// Snapshot read; may be stale relative to concurrent mutators
    pub fn level_of(&self, name: &str) -> Result<u32> {
        let counter = self.counter(name)?;
        let level = *counter.level.lock();
        Ok(level)
    }

    pub fn capacity_of(&self, name: &str) -> Result<u32> {
        Ok(self.counter(name)?.capacity)
    }

    /// Gate bound to the counter, if any
    pub fn gate_of(&self, name: &str) -> Result<Option<Arc<str>>> {
        Ok(self.counter(name)?.gate.clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.counters.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    /// Levels of all counters, sorted by name
    pub fn snapshot(&self) -> Vec<CounterSnapshot> {
        let counters: Vec<Arc<Counter>> = self
            .counters
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut snapshot: Vec<CounterSnapshot> = counters
            .iter()
            .map(|c| CounterSnapshot {
                name: c.name.to_string(),
                capacity: c.capacity,
                level: *c.level.lock(),
                gate: c.gate.as_ref().map(|g| g.to_string()),
            })
            .collect();
        snapshot.sort_by(|a, b| a.name.cmp(&b.name));
        snapshot
    }
}

impl Default for ResourcePool {
    fn default() -> Self {
        Self::new()
    }
}
