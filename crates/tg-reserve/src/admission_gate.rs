//! AdmissionGate - counting-semaphore admission control for bounded facilities
//!
//! A gate hands out at most `slots` tickets at a time. Tickets are RAII values:
//! releasing one consumes it, and dropping an unreleased ticket returns its
//! slot, so an error path or a panic cannot leak occupancy.
//!
//! Waiters are admitted in FIFO order (tokio's semaphore is fair).

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use tg_common::GateSnapshot;
use crate::error::ReserveError;
use crate::service_metrics;
use crate::Result;

static NEXT_GATE_ID: AtomicU64 = AtomicU64::new(1);

/// Occupancy bookkeeping shared between a gate and its tickets
struct GateState {
    name: Arc<str>,
    outstanding: AtomicU32,
    high_water_mark: AtomicU32,
    next_ticket: AtomicU64,
}

impl GateState {
    fn on_acquire(&self) -> u64 {
        let now = self.outstanding.fetch_add(1, Ordering::SeqCst) + 1;
        self.high_water_mark.fetch_max(now, Ordering::SeqCst);
        service_metrics::set_gate_outstanding(&self.name, now);
        self.next_ticket.fetch_add(1, Ordering::SeqCst)
    }

    fn on_release(&self) {
        let now = self.outstanding.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        service_metrics::set_gate_outstanding(&self.name, now);
    }
}

/// Proof of occupancy in an [`AdmissionGate`]
#[must_use = "dropping a ticket immediately releases its slot"]
pub struct Ticket {
    id: u64,
    gate_id: u64,
    permit: Option<OwnedSemaphorePermit>,
    state: Arc<GateState>,
}

impl Ticket {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn gate(&self) -> &str {
        &self.state.name
    }

    fn return_slot(&mut self) {
        if let Some(permit) = self.permit.take() {
            // Bookkeeping first so `outstanding` never exceeds the permits in use
            self.state.on_release();
            drop(permit);
        }
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        if self.permit.is_some() {
            debug!(gate = %self.state.name, ticket = self.id, "Ticket dropped without release, returning slot");
            self.return_slot();
        }
    }
}

impl std::fmt::Debug for Ticket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ticket")
            .field("gate", &self.state.name)
            .field("id", &self.id)
            .finish()
    }
}

/// Bounded facility with `slots` interchangeable tickets
pub struct AdmissionGate {
    id: u64,
    slots: u32,
    semaphore: Arc<Semaphore>,
    state: Arc<GateState>,
}

impl AdmissionGate {
    pub fn new(name: &str, slots: u32) -> Self {
        if slots == 0 {
            warn!(gate = %name, "Gate created with zero slots; every acquire will wait or time out");
        }
        Self {
            id: NEXT_GATE_ID.fetch_add(1, Ordering::Relaxed),
            slots,
            semaphore: Arc::new(Semaphore::new(slots as usize)),
            state: Arc::new(GateState {
                name: Arc::from(name),
                outstanding: AtomicU32::new(0),
                high_water_mark: AtomicU32::new(0),
                next_ticket: AtomicU64::new(1),
            }),
        }
    }

    /// Wait until a slot is free. With a timeout, gives up with
    /// `ServiceUnavailable` once it elapses. A closed gate also yields
    /// `ServiceUnavailable`.
    pub async fn acquire(&self, timeout: Option<Duration>) -> Result<Ticket> {
        let acquire = Arc::clone(&self.semaphore).acquire_owned();

        let permit = match timeout {
            Some(limit) => match tokio::time::timeout(limit, acquire).await {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => return Err(self.closed_error()),
                Err(_) => {
                    debug!(gate = %self.state.name, timeout_ms = limit.as_millis() as u64, "Gate acquire timed out");
                    return Err(ReserveError::ServiceUnavailable(format!(
                        "timed out after {}ms waiting for a slot at {}",
                        limit.as_millis(),
                        self.state.name
                    )));
                }
            },
            None => acquire.await.map_err(|_| self.closed_error())?,
        };

        Ok(self.issue(permit))
    }

    /// Take a slot only if one is free right now
    pub fn try_acquire(&self) -> Option<Ticket> {
        Arc::clone(&self.semaphore)
            .try_acquire_owned()
            .ok()
            .map(|permit| self.issue(permit))
    }

    fn issue(&self, permit: OwnedSemaphorePermit) -> Ticket {
        let id = self.state.on_acquire();
        debug!(gate = %self.state.name, ticket = id, outstanding = self.outstanding(), "Ticket acquired");
        Ticket {
            id,
            gate_id: self.id,
            permit: Some(permit),
            state: Arc::clone(&self.state),
        }
    }

    /// Return a ticket to the gate.
    ///
    /// Releasing twice is impossible since the ticket is consumed. A ticket
    /// issued by a different gate is rejected with `DoubleRelease` in every
    /// build profile; that ticket still returns its slot to the gate that
    /// issued it when dropped.
    pub fn release(&self, mut ticket: Ticket) -> Result<()> {
        if ticket.gate_id != self.id {
            warn!(
                gate = %self.state.name,
                ticket_gate = %ticket.state.name,
                ticket = ticket.id,
                "Ticket released to the wrong gate"
            );
            return Err(ReserveError::DoubleRelease {
                gate: self.state.name.to_string(),
                ticket: ticket.id,
            });
        }

        ticket.return_slot();
        debug!(gate = %self.state.name, ticket = ticket.id, outstanding = self.outstanding(), "Ticket released");
        Ok(())
    }

    /// Stop admitting; pending and future acquires fail with `ServiceUnavailable`.
    /// Tickets already held stay valid until released.
    pub fn close(&self) {
        self.semaphore.close();
        debug!(gate = %self.state.name, "Gate closed");
    }

    pub fn is_closed(&self) -> bool {
        self.semaphore.is_closed()
    }

    fn closed_error(&self) -> ReserveError {
        ReserveError::ServiceUnavailable(format!("gate {} is closed", self.state.name))
    }

    pub fn name(&self) -> &str {
        &self.state.name
    }

    pub fn slots(&self) -> u32 {
        self.slots
    }

    /// Tickets currently held
    pub fn outstanding(&self) -> u32 {
        self.state.outstanding.load(Ordering::SeqCst)
    }

    /// Free slots right now
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Highest number of simultaneously held tickets observed
    pub fn high_water_mark(&self) -> u32 {
        self.state.high_water_mark.load(Ordering::SeqCst)
    }

    pub fn reset_high_water_mark(&self) {
        self.state
            .high_water_mark
            .store(self.outstanding(), Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> GateSnapshot {
        GateSnapshot {
            name: self.state.name.to_string(),
            slots: self.slots,
            outstanding: self.outstanding(),
            high_water_mark: self.high_water_mark(),
        }
    }
}
