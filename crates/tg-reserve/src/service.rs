//! ReservationService - bounded worker pool executing reservations end to end
//!
//! - `submit` validates synchronously and enqueues onto a bounded queue
//! - A fixed set of worker tasks drains the queue
//! - Each worker: optional gate ticket -> external step (no locks held) ->
//!   single commit against the ResourcePool -> release ticket -> report
//! - Cancellation is honoured until the commit step begins
//! - Failures and panics inside a worker become `ServiceUnavailable` outcomes;
//!   they never reach the submitting caller or sibling workers

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::time::{Duration, Instant};
use dashmap::DashMap;
use futures::FutureExt;
use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify};
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use tg_common::{
    CorrelationId, OutcomeStatus, ReservationOutcome, ReservationRequest, ReservationStats,
};
use tg_config::{AppConfig, CounterConfig, GateConfig, WorkerConfig};
use crate::admission_gate::AdmissionGate;
use crate::error::ReserveError;
use crate::external_step::{ExternalStep, SimulatedLatency, StepError};
use crate::reporter::{OutcomeReporter, OutcomeSink, OutcomeSubscription};
use crate::resource_pool::ResourcePool;
use crate::service_metrics;
use crate::Result;

const PENDING: u8 = 0;
const COMMITTING: u8 = 1;
const CANCELLED: u8 = 2;

/// Per-request cancellation latch. Exactly one of `cancel` and
/// `begin_commit` can win.
struct CancelState {
    state: AtomicU8,
    notify: Notify,
}

impl CancelState {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(PENDING),
            notify: Notify::new(),
        }
    }

    fn cancel(&self) -> bool {
        let won = self
            .state
            .compare_exchange(PENDING, CANCELLED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if won {
            // notify_one stores a permit, so a worker that starts waiting later still wakes
            self.notify.notify_one();
        }
        won
    }

    fn begin_commit(&self) -> bool {
        self.state
            .compare_exchange(PENDING, COMMITTING, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::SeqCst) == CANCELLED
    }

    async fn cancelled(&self) {
        while !self.is_cancelled() {
            self.notify.notified().await;
        }
    }
}

/// A unit of work handed from `submit` to a worker
struct Job {
    request: ReservationRequest,
    cancel: Arc<CancelState>,
    enqueued_at: Instant,
}

struct Facility {
    gate: Arc<AdmissionGate>,
    acquire_timeout: Option<Duration>,
}

#[derive(Default)]
struct Stats {
    submitted: AtomicU64,
    granted: AtomicU64,
    denied: AtomicU64,
    unavailable: AtomicU64,
    cancelled: AtomicU64,
    queue_depth: AtomicU32,
    active_workers: AtomicU32,
}

/// State shared by the service handle and its workers
struct Inner {
    pool: ResourcePool,
    gates: DashMap<Arc<str>, Facility>,
    reporter: Arc<OutcomeReporter>,
    step: Arc<dyn ExternalStep>,
    step_timeout: Option<Duration>,
    cancellations: DashMap<CorrelationId, Arc<CancelState>>,
    stats: Stats,
}

impl Inner {
    fn gate(&self, name: &str) -> Option<(Arc<AdmissionGate>, Option<Duration>)> {
        self.gates
            .get(name)
            .map(|f| (Arc::clone(&f.gate), f.acquire_timeout))
    }

    /// Gate to hold while servicing `resource`: the facility itself, or the
    /// gate bound to a counter
    fn gate_for(&self, resource: &str) -> Option<(Arc<AdmissionGate>, Option<Duration>)> {
        if let Some(gate) = self.gate(resource) {
            return Some(gate);
        }
        match self.pool.gate_of(resource) {
            Ok(Some(gate_name)) => self.gate(&gate_name),
            _ => None,
        }
    }

    async fn run_step(&self, request: &ReservationRequest) -> std::result::Result<(), StepError> {
        let step = self.step.perform(request);
        match self.step_timeout {
            Some(limit) => match tokio::time::timeout(limit, step).await {
                Ok(result) => result,
                Err(_) => Err(StepError::TimedOut(limit)),
            },
            None => step.await,
        }
    }

    /// Service one request and produce its single outcome
    async fn execute(&self, job: &Job) -> ReservationOutcome {
        let request = &job.request;
        let started = job.enqueued_at;

        if job.cancel.is_cancelled() {
            return ReservationOutcome::cancelled(request, started.elapsed());
        }

        // Enter the facility first; the ticket is held through the external
        // step and the commit, and released by drop on every early return
        let ticket = match self.gate_for(&request.resource) {
            Some((gate, timeout)) => {
                let acquired = tokio::select! {
                    biased;
                    _ = job.cancel.cancelled() => {
                        return ReservationOutcome::cancelled(request, started.elapsed());
                    }
                    acquired = gate.acquire(timeout) => acquired,
                };
                match acquired {
                    Ok(ticket) => Some((gate, ticket)),
                    Err(e) => {
                        return ReservationOutcome::service_unavailable(request, e.to_string(), started.elapsed());
                    }
                }
            }
            None => None,
        };

        let step_started = Instant::now();
        let step_result = tokio::select! {
            biased;
            _ = job.cancel.cancelled() => {
                return ReservationOutcome::cancelled(request, started.elapsed());
            }
            result = self.run_step(request) => result,
        };
        service_metrics::record_step_latency(&request.resource, step_started.elapsed());

        if let Err(e) = step_result {
            debug!(correlation_id = %request.correlation_id, error = %e, "External step failed");
            return ReservationOutcome::service_unavailable(request, e.to_string(), started.elapsed());
        }

        if !job.cancel.begin_commit() {
            return ReservationOutcome::cancelled(request, started.elapsed());
        }

        let outcome = if self.pool.contains(&request.resource) {
            match self.pool.try_decrement(&request.resource, request.amount) {
                Ok(r) if r.granted => {
                    ReservationOutcome::granted(request, Some(r.new_level), started.elapsed())
                }
                Ok(r) => ReservationOutcome::denied(request, r.new_level, started.elapsed()),
                Err(e) => ReservationOutcome::service_unavailable(request, e.to_string(), started.elapsed()),
            }
        } else {
            // Facility: holding the ticket through the step was the service
            ReservationOutcome::granted(request, None, started.elapsed())
        };

        if let Some((gate, ticket)) = ticket {
            if let Err(e) = gate.release(ticket) {
                error!(correlation_id = %request.correlation_id, error = %e, "Ticket release failed");
            }
        }

        outcome
    }

    /// Record and report a terminal outcome
    fn finish(&self, outcome: ReservationOutcome) {
        let counter = match outcome.status {
            OutcomeStatus::Granted => &self.stats.granted,
            OutcomeStatus::Denied => &self.stats.denied,
            OutcomeStatus::ServiceUnavailable => &self.stats.unavailable,
            OutcomeStatus::Cancelled => &self.stats.cancelled,
        };
        counter.fetch_add(1, Ordering::SeqCst);
        service_metrics::record_outcome(&outcome.resource, outcome.status);

        self.cancellations.remove(&outcome.correlation_id);

        debug!(
            correlation_id = %outcome.correlation_id,
            resource = %outcome.resource,
            status = %outcome.status,
            level = ?outcome.level,
            "Reservation finished"
        );

        let correlation_id = outcome.correlation_id.clone();
        if !self.reporter.report(outcome) {
            warn!(correlation_id = %correlation_id, "Worker produced a second outcome for a resolved request");
        }
    }
}

/// Worker loop: take jobs until the queue closes
async fn run_worker(
    worker_id: usize,
    inner: Arc<Inner>,
    rx: Arc<AsyncMutex<mpsc::Receiver<Job>>>,
) {
    debug!(worker_id, "Reservation worker started");

    loop {
        let job = {
            let mut rx = rx.lock().await;
            rx.recv().await
        };
        let Some(job) = job else {
            break;
        };

        let depth = inner.stats.queue_depth.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        service_metrics::set_queue_depth(depth);
        let active = inner.stats.active_workers.fetch_add(1, Ordering::SeqCst) + 1;
        service_metrics::set_active_workers(active);

        let outcome = match AssertUnwindSafe(inner.execute(&job)).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(_) => {
                error!(
                    worker_id,
                    correlation_id = %job.request.correlation_id,
                    "Reservation worker panicked; reporting service unavailable"
                );
                ReservationOutcome::service_unavailable(
                    &job.request,
                    "reservation worker failed unexpectedly",
                    job.enqueued_at.elapsed(),
                )
            }
        };
        inner.finish(outcome);

        let active = inner.stats.active_workers.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        service_metrics::set_active_workers(active);
    }

    debug!(worker_id, "Reservation worker exited");
}

/// Coordinator handle: submit reservations, observe outcomes and levels
pub struct ReservationService {
    inner: Arc<Inner>,
    queue_tx: parking_lot::Mutex<Option<mpsc::Sender<Job>>>,
    workers: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    accepting: AtomicBool,
}

impl ReservationService {
    pub fn builder() -> ReservationServiceBuilder {
        ReservationServiceBuilder::new()
    }

    /// Build from an application config with the simulated external step
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        ReservationServiceBuilder::from_config(config).build()
    }

    /// Fire-and-forget entry point. Returns once the request is queued.
    ///
    /// Unknown resources, non-positive amounts, an amount other than one for
    /// a facility, reused correlation handles, a full queue and shutdown are
    /// reported here, synchronously.
    pub fn submit(
        &self,
        resource: &str,
        amount: u32,
        correlation_id: impl Into<CorrelationId>,
    ) -> Result<()> {
        self.submit_request(ReservationRequest::new(resource, amount, correlation_id))
    }

    pub fn submit_request(&self, request: ReservationRequest) -> Result<()> {
        if !self.accepting.load(Ordering::SeqCst) {
            service_metrics::record_rejected("shutdown");
            return Err(ReserveError::ShutdownInProgress);
        }
        if request.amount == 0 {
            service_metrics::record_rejected("invalid_amount");
            return Err(ReserveError::InvalidArgument(format!(
                "amount must be positive (resource {})",
                request.resource
            )));
        }
        if !self.inner.pool.contains(&request.resource) {
            if self.inner.gate(&request.resource).is_none() {
                service_metrics::record_rejected("unknown_resource");
                return Err(ReserveError::UnknownResource(request.resource));
            }
            // A facility admits one holder per ticket
            if request.amount != 1 {
                service_metrics::record_rejected("invalid_amount");
                return Err(ReserveError::InvalidArgument(format!(
                    "facility {} admits one holder per request, got amount {}",
                    request.resource, request.amount
                )));
            }
        }

        let tx = match self.queue_tx.lock().as_ref() {
            Some(tx) => tx.clone(),
            None => return Err(ReserveError::ShutdownInProgress),
        };

        let correlation_id = request.correlation_id.clone();
        self.inner.reporter.track(&correlation_id).inspect_err(|_| {
            service_metrics::record_rejected("duplicate_correlation");
        })?;

        let cancel = Arc::new(CancelState::new());
        self.inner
            .cancellations
            .insert(correlation_id.clone(), Arc::clone(&cancel));

        let resource = request.resource.clone();
        let job = Job {
            request,
            cancel,
            enqueued_at: Instant::now(),
        };

        // Count before sending so a fast worker never decrements below zero
        self.inner.stats.queue_depth.fetch_add(1, Ordering::SeqCst);
        if let Err(e) = tx.try_send(job) {
            self.inner.stats.queue_depth.fetch_sub(1, Ordering::SeqCst);
            self.inner.cancellations.remove(&correlation_id);
            self.inner.reporter.untrack(&correlation_id);
            return Err(match e {
                TrySendError::Full(_) => {
                    service_metrics::record_rejected("queue_full");
                    debug!(correlation_id = %correlation_id, resource = %resource, "Request queue full, rejecting");
                    ReserveError::QueueFull(resource)
                }
                TrySendError::Closed(_) => ReserveError::ShutdownInProgress,
            });
        }

        self.inner.stats.submitted.fetch_add(1, Ordering::SeqCst);
        service_metrics::set_queue_depth(self.inner.stats.queue_depth.load(Ordering::SeqCst));
        debug!(correlation_id = %correlation_id, resource = %resource, "Reservation submitted");
        Ok(())
    }

    /// Subscribe, then submit, so the outcome cannot be missed. On a
    /// synchronous rejection the subscription is dropped and unregistered.
    pub fn submit_and_subscribe(
        &self,
        resource: &str,
        amount: u32,
        correlation_id: impl Into<CorrelationId>,
    ) -> Result<OutcomeSubscription> {
        let correlation_id = correlation_id.into();
        let subscription = self.inner.reporter.subscribe(&correlation_id);
        self.submit(resource, amount, correlation_id)?;
        Ok(subscription)
    }

    pub fn subscribe(&self, correlation_id: &CorrelationId) -> OutcomeSubscription {
        self.inner.reporter.subscribe(correlation_id)
    }

    /// Cancel a request that has not started committing.
    ///
    /// Returns `false` when the request is unknown, already committing, or
    /// already finished.
    pub fn cancel(&self, correlation_id: &CorrelationId) -> bool {
        let cancel = match self.inner.cancellations.get(correlation_id) {
            Some(entry) => Arc::clone(entry.value()),
            None => return false,
        };
        let cancelled = cancel.cancel();
        if cancelled {
            debug!(correlation_id = %correlation_id, "Reservation cancelled");
        }
        cancelled
    }

    pub fn level_of(&self, resource: &str) -> Result<u32> {
        self.inner.pool.level_of(resource)
    }

    pub fn pool(&self) -> &ResourcePool {
        &self.inner.pool
    }

    pub fn gate(&self, name: &str) -> Option<Arc<AdmissionGate>> {
        self.inner.gate(name).map(|(gate, _)| gate)
    }

    pub fn reporter(&self) -> &Arc<OutcomeReporter> {
        &self.inner.reporter
    }

    pub fn add_sink(&self, sink: Arc<dyn OutcomeSink>) {
        self.inner.reporter.add_sink(sink);
    }

    pub fn worker_count(&self) -> usize {
        self.workers.lock().len()
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> ReservationStats {
        let s = &self.inner.stats;
        let mut gates: Vec<_> = self
            .inner
            .gates
            .iter()
            .map(|f| f.gate.snapshot())
            .collect();
        gates.sort_by(|a, b| a.name.cmp(&b.name));

        ReservationStats {
            submitted: s.submitted.load(Ordering::SeqCst),
            granted: s.granted.load(Ordering::SeqCst),
            denied: s.denied.load(Ordering::SeqCst),
            unavailable: s.unavailable.load(Ordering::SeqCst),
            cancelled: s.cancelled.load(Ordering::SeqCst),
            queue_depth: s.queue_depth.load(Ordering::SeqCst),
            active_workers: s.active_workers.load(Ordering::SeqCst),
            counters: self.inner.pool.snapshot(),
            gates,
        }
    }

    /// Stop accepting requests, let workers finish everything already
    /// queued, then close the gates.
    pub async fn shutdown(&self) {
        if !self.accepting.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down reservation service");

        // Dropping the only sender closes the queue once it is drained
        drop(self.queue_tx.lock().take());
        let workers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());

        for handle in workers {
            if let Err(e) = handle.await {
                error!(error = %e, "Reservation worker terminated abnormally");
            }
        }

        for facility in self.inner.gates.iter() {
            facility.gate.close();
        }

        let stats = self.stats();
        info!(
            submitted = stats.submitted,
            granted = stats.granted,
            denied = stats.denied,
            unavailable = stats.unavailable,
            cancelled = stats.cancelled,
            "Reservation service stopped"
        );
    }
}

/// Builder for [`ReservationService`]
pub struct ReservationServiceBuilder {
    worker: WorkerConfig,
    counters: Vec<CounterConfig>,
    gates: Vec<GateConfig>,
    step: Option<Arc<dyn ExternalStep>>,
    reporter: Option<Arc<OutcomeReporter>>,
}

impl ReservationServiceBuilder {
    pub fn new() -> Self {
        Self {
            worker: WorkerConfig::default(),
            counters: Vec::new(),
            gates: Vec::new(),
            step: None,
            reporter: None,
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            worker: config.worker.clone(),
            counters: config.counters.clone(),
            gates: config.gates.clone(),
            step: None,
            reporter: None,
        }
    }

    pub fn worker_config(mut self, worker: WorkerConfig) -> Self {
        self.worker = worker;
        self
    }

    pub fn pool_size(mut self, pool_size: usize) -> Self {
        self.worker.pool_size = pool_size;
        self
    }

    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.worker.queue_capacity = capacity;
        self
    }

    pub fn step_timeout(mut self, timeout: Duration) -> Self {
        self.worker.step_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    /// Counter starting full
    pub fn counter(self, name: &str, capacity: u32) -> Self {
        self.counter_at(name, capacity, capacity)
    }

    pub fn counter_at(mut self, name: &str, capacity: u32, level: u32) -> Self {
        self.counters.push(CounterConfig {
            name: name.to_string(),
            capacity,
            initial_level: Some(level),
            gate: None,
        });
        self
    }

    /// Counter whose reservations must hold a ticket from `gate` while in service
    pub fn gated_counter(mut self, name: &str, capacity: u32, level: u32, gate: &str) -> Self {
        self.counters.push(CounterConfig {
            name: name.to_string(),
            capacity,
            initial_level: Some(level),
            gate: Some(gate.to_string()),
        });
        self
    }

    pub fn gate(mut self, name: &str, slots: u32) -> Self {
        self.gates.push(GateConfig {
            name: name.to_string(),
            slots,
            acquire_timeout_ms: None,
        });
        self
    }

    pub fn gate_with_timeout(mut self, name: &str, slots: u32, timeout: Duration) -> Self {
        self.gates.push(GateConfig {
            name: name.to_string(),
            slots,
            acquire_timeout_ms: Some(timeout.as_millis() as u64),
        });
        self
    }

    pub fn external_step(mut self, step: Arc<dyn ExternalStep>) -> Self {
        self.step = Some(step);
        self
    }

    pub fn reporter(mut self, reporter: Arc<OutcomeReporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    /// Validate, register resources and spawn the worker pool.
    /// Must be called from within a tokio runtime.
    pub fn build(self) -> Result<ReservationService> {
        let config = AppConfig {
            dev_mode: false,
            worker: self.worker,
            gates: self.gates,
            counters: self.counters,
        };
        config.validate()?;

        let pool = ResourcePool::new();
        for counter in &config.counters {
            pool.register_gated(
                &counter.name,
                counter.capacity,
                counter.initial_level(),
                counter.gate.as_deref(),
            )?;
        }

        let gates = DashMap::new();
        for gate in &config.gates {
            info!(gate = %gate.name, slots = gate.slots, "Gate registered");
            gates.insert(
                Arc::from(gate.name.as_str()),
                Facility {
                    gate: Arc::new(AdmissionGate::new(&gate.name, gate.slots)),
                    acquire_timeout: gate.acquire_timeout(),
                },
            );
        }

        let step = self
            .step
            .unwrap_or_else(|| Arc::new(SimulatedLatency::from_config(&config.worker)));

        let inner = Arc::new(Inner {
            pool,
            gates,
            reporter: self.reporter.unwrap_or_default(),
            step,
            step_timeout: config.worker.step_timeout(),
            cancellations: DashMap::new(),
            stats: Stats::default(),
        });

        let (tx, rx) = mpsc::channel(config.worker.queue_capacity);
        let rx = Arc::new(AsyncMutex::new(rx));
        let workers = (0..config.worker.pool_size)
            .map(|worker_id| tokio::spawn(run_worker(worker_id, Arc::clone(&inner), Arc::clone(&rx))))
            .collect();

        info!(
            pool_size = config.worker.pool_size,
            queue_capacity = config.worker.queue_capacity,
            counters = config.counters.len(),
            gates = config.gates.len(),
            "Reservation service started"
        );

        Ok(ReservationService {
            inner,
            queue_tx: parking_lot::Mutex::new(Some(tx)),
            workers: parking_lot::Mutex::new(workers),
            accepting: AtomicBool::new(true),
        })
    }
}

impl Default for ReservationServiceBuilder {
    fn default() -> Self {
        Self::new()
    }
}
