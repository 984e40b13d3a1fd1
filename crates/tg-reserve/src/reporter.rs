//! OutcomeReporter - exactly-once delivery of reservation outcomes
//!
//! Workers never touch presentation state. They hand an outcome value to the
//! reporter, which resolves the correlation handle once and fans the outcome
//! out to:
//! - per-handle subscribers (oneshot channels)
//! - registered sinks, e.g. a [`ChannelSink`] drained by a single event loop
//!
//! Reports for an already-resolved handle are ignored. A sink that panics is
//! logged and skipped; it never takes the reporting worker down with it.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use tg_common::{CorrelationId, OutcomeStatus, ReservationOutcome};
use crate::error::ReserveError;
use crate::Result;

/// Receiver of every resolved outcome
pub trait OutcomeSink: Send + Sync {
    fn deliver(&self, outcome: &ReservationOutcome);
}

/// Writes each outcome as a structured log line
pub struct LogSink;

impl OutcomeSink for LogSink {
    fn deliver(&self, outcome: &ReservationOutcome) {
        match outcome.status {
            OutcomeStatus::Granted | OutcomeStatus::Denied | OutcomeStatus::Cancelled => info!(
                correlation_id = %outcome.correlation_id,
                resource = %outcome.resource,
                status = %outcome.status,
                level = ?outcome.level,
                elapsed_ms = outcome.elapsed_ms,
                "{}", outcome.message
            ),
            OutcomeStatus::ServiceUnavailable => warn!(
                correlation_id = %outcome.correlation_id,
                resource = %outcome.resource,
                elapsed_ms = outcome.elapsed_ms,
                "{}", outcome.message
            ),
        }
    }
}

/// Forwards outcomes to a single consumer (UI/event loop)
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<ReservationOutcome>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ReservationOutcome>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl OutcomeSink for ChannelSink {
    fn deliver(&self, outcome: &ReservationOutcome) {
        if self.tx.send(outcome.clone()).is_err() {
            debug!(correlation_id = %outcome.correlation_id, "Outcome consumer gone, dropping event");
        }
    }
}

enum Slot {
    Pending {
        submitted: bool,
        waiters: Vec<oneshot::Sender<ReservationOutcome>>,
    },
    Resolved(ReservationOutcome),
}

type SlotTable = DashMap<CorrelationId, Slot>;

/// Drop waiters whose subscription is gone; remove the slot entirely when
/// nothing was submitted under the handle and nobody is listening
fn prune(slots: &SlotTable, correlation_id: &CorrelationId) {
    slots.remove_if_mut(correlation_id, |_, slot| match slot {
        Slot::Pending { submitted, waiters } => {
            waiters.retain(|w| !w.is_closed());
            !*submitted && waiters.is_empty()
        }
        Slot::Resolved(_) => false,
    });
}

/// Future-like handle for one correlation id's outcome.
///
/// Dropping an unresolved subscription unregisters it from the reporter.
pub struct OutcomeSubscription {
    correlation_id: CorrelationId,
    rx: Option<oneshot::Receiver<ReservationOutcome>>,
    slots: Weak<SlotTable>,
}

impl OutcomeSubscription {
    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    /// Wait for the outcome
    pub async fn wait(mut self) -> Result<ReservationOutcome> {
        let received = match self.rx.take() {
            Some(rx) => rx.await.ok(),
            None => None,
        };
        received.ok_or_else(|| {
            ReserveError::ServiceUnavailable(format!(
                "outcome for {} will never be delivered",
                self.correlation_id
            ))
        })
    }

    /// Non-blocking check
    pub fn try_recv(&mut self) -> Option<ReservationOutcome> {
        self.rx.as_mut().and_then(|rx| rx.try_recv().ok())
    }
}

impl Drop for OutcomeSubscription {
    fn drop(&mut self) {
        // Close first so this waiter counts as gone when pruning
        if let Some(mut rx) = self.rx.take() {
            rx.close();
        }
        if let Some(slots) = self.slots.upgrade() {
            prune(&slots, &self.correlation_id);
        }
    }
}

pub struct OutcomeReporter {
    slots: Arc<SlotTable>,
    sinks: RwLock<Vec<Arc<dyn OutcomeSink>>>,
    delivered: AtomicU64,
    duplicates: AtomicU64,
}

impl OutcomeReporter {
    pub fn new() -> Self {
        Self {
            slots: Arc::new(DashMap::new()),
            sinks: RwLock::new(Vec::new()),
            delivered: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
        }
    }

    pub fn with_sink(self, sink: Arc<dyn OutcomeSink>) -> Self {
        self.add_sink(sink);
        self
    }

    pub fn add_sink(&self, sink: Arc<dyn OutcomeSink>) {
        self.sinks.write().push(sink);
    }

    /// Mark a handle as submitted. Each handle may be submitted once.
    pub fn track(&self, correlation_id: &CorrelationId) -> Result<()> {
        match self.slots.entry(correlation_id.clone()) {
            Entry::Occupied(mut entry) => match entry.get_mut() {
                Slot::Pending { submitted, .. } if !*submitted => {
                    *submitted = true;
                    Ok(())
                }
                _ => Err(ReserveError::DuplicateCorrelation(correlation_id.to_string())),
            },
            Entry::Vacant(entry) => {
                entry.insert(Slot::Pending { submitted: true, waiters: Vec::new() });
                Ok(())
            }
        }
    }

    /// Undo `track` for a request that never reached a worker.
    /// Live subscribers that registered early keep waiting for a resubmission.
    pub fn untrack(&self, correlation_id: &CorrelationId) {
        if let Some(mut slot) = self.slots.get_mut(correlation_id) {
            if let Slot::Pending { submitted, .. } = slot.value_mut() {
                *submitted = false;
            }
        }
        prune(&self.slots, correlation_id);
    }

    /// Register interest in a handle's outcome. Subscribing after resolution
    /// yields the stored outcome immediately.
    pub fn subscribe(&self, correlation_id: &CorrelationId) -> OutcomeSubscription {
        let (tx, rx) = oneshot::channel();

        match self.slots.entry(correlation_id.clone()) {
            Entry::Occupied(mut entry) => match entry.get_mut() {
                Slot::Pending { waiters, .. } => waiters.push(tx),
                Slot::Resolved(outcome) => {
                    let _ = tx.send(outcome.clone());
                }
            },
            Entry::Vacant(entry) => {
                entry.insert(Slot::Pending { submitted: false, waiters: vec![tx] });
            }
        }

        OutcomeSubscription {
            correlation_id: correlation_id.clone(),
            rx: Some(rx),
            slots: Arc::downgrade(&self.slots),
        }
    }

    /// Resolve a handle and deliver its outcome.
    ///
    /// Returns `false` without delivering anything when the handle was already
    /// resolved.
    pub fn report(&self, outcome: ReservationOutcome) -> bool {
        let waiters = match self.slots.entry(outcome.correlation_id.clone()) {
            Entry::Occupied(mut entry) => {
                if matches!(entry.get(), Slot::Resolved(_)) {
                    self.duplicates.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        correlation_id = %outcome.correlation_id,
                        status = %outcome.status,
                        "Duplicate outcome report ignored"
                    );
                    return false;
                }
                match std::mem::replace(entry.get_mut(), Slot::Resolved(outcome.clone())) {
                    Slot::Pending { waiters, .. } => waiters,
                    Slot::Resolved(_) => Vec::new(),
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(Slot::Resolved(outcome.clone()));
                Vec::new()
            }
        };
        // Map guard released; deliver without holding any lock on the slot table
        self.delivered.fetch_add(1, Ordering::Relaxed);

        for waiter in waiters {
            let _ = waiter.send(outcome.clone());
        }

        let sinks: Vec<Arc<dyn OutcomeSink>> = self.sinks.read().clone();
        for sink in sinks {
            let delivered = std::panic::catch_unwind(AssertUnwindSafe(|| sink.deliver(&outcome)));
            if delivered.is_err() {
                error!(
                    correlation_id = %outcome.correlation_id,
                    status = %outcome.status,
                    "Outcome sink panicked; skipping it for this outcome"
                );
            }
        }
        true
    }

    pub fn outcome_of(&self, correlation_id: &CorrelationId) -> Option<ReservationOutcome> {
        self.slots.get(correlation_id).and_then(|slot| match slot.value() {
            Slot::Resolved(outcome) => Some(outcome.clone()),
            Slot::Pending { .. } => None,
        })
    }

    pub fn is_resolved(&self, correlation_id: &CorrelationId) -> bool {
        self.outcome_of(correlation_id).is_some()
    }

    /// Entries in the resolution table, resolved ones included
    pub fn tracked_count(&self) -> usize {
        self.slots.len()
    }

    /// Handles submitted but not yet resolved
    pub fn pending_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| matches!(slot.value(), Slot::Pending { submitted: true, .. }))
            .count()
    }

    pub fn delivered_count(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn duplicate_count(&self) -> u64 {
        self.duplicates.load(Ordering::Relaxed)
    }
}

impl Default for OutcomeReporter {
    fn default() -> Self {
        Self::new()
    }
}
