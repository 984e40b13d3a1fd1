//! ReservationService Tests
//!
//! Tests for:
//! - No double-spend and the destination scenario
//! - Exactly-once outcomes under induced failures and panics
//! - Ticket recovery on failure paths
//! - Facility admission bound
//! - Cancellation, synchronous validation, queue capacity, shutdown
//! - Faulty outcome sinks and subscription bookkeeping
//! - External latency running outside the critical section

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Notify;

use tg_reserve::{
    ChannelSink, CorrelationId, ExternalStep, OutcomeSink, OutcomeStatus, ReservationOutcome,
    ReservationRequest, ReservationService, ReserveError, SimulatedLatency, StepError,
};

/// Mock external step that tracks calls and concurrency and can simulate
/// delays, failures, panics and stalls
struct MockStep {
    delay: Duration,
    /// Fail every n-th call (1-based)
    fail_every: Option<u32>,
    panic_every: Option<u32>,
    /// Block until notified
    gate: Option<Arc<Notify>>,
    calls: AtomicU32,
    active: AtomicU32,
    peak: AtomicU32,
}

impl MockStep {
    fn new() -> Self {
        Self {
            delay: Duration::ZERO,
            fail_every: None,
            panic_every: None,
            gate: None,
            calls: AtomicU32::new(0),
            active: AtomicU32::new(0),
            peak: AtomicU32::new(0),
        }
    }

    fn with_delay(delay_ms: u64) -> Self {
        Self { delay: Duration::from_millis(delay_ms), ..Self::new() }
    }

    fn failing_every(n: u32) -> Self {
        Self { fail_every: Some(n), ..Self::new() }
    }

    fn panicking_every(n: u32) -> Self {
        Self { panic_every: Some(n), ..Self::new() }
    }

    fn blocked_on(notify: Arc<Notify>) -> Self {
        Self { gate: Some(notify), ..Self::new() }
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn peak(&self) -> u32 {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExternalStep for MockStep {
    async fn perform(&self, _request: &ReservationRequest) -> Result<(), StepError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        if let Some(notify) = &self.gate {
            notify.notified().await;
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);

        if self.panic_every.is_some_and(|k| n % k == 0) {
            panic!("upstream client crashed");
        }
        if self.fail_every.is_some_and(|k| n % k == 0) {
            return Err(StepError::Failed("upstream returned 503".into()));
        }
        Ok(())
    }
}

async fn wait_all(subs: Vec<tg_reserve::OutcomeSubscription>) -> Vec<ReservationOutcome> {
    let mut outcomes = Vec::new();
    for sub in subs {
        let outcome = tokio::time::timeout(Duration::from_secs(5), sub.wait())
            .await
            .expect("outcome not delivered in time")
            .unwrap();
        outcomes.push(outcome);
    }
    outcomes
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_no_double_spend_on_last_unit() {
    let step = Arc::new(MockStep::with_delay(20));
    let service = ReservationService::builder()
        .pool_size(4)
        .counter_at("Ciudad Antigua", 10, 1)
        .external_step(step.clone())
        .build()
        .unwrap();

    let a = service.submit_and_subscribe("Ciudad Antigua", 1, "visitor-a").unwrap();
    let b = service.submit_and_subscribe("Ciudad Antigua", 1, "visitor-b").unwrap();
    let outcomes = wait_all(vec![a, b]).await;

    let granted = outcomes.iter().filter(|o| o.is_granted()).count();
    let denied: Vec<_> = outcomes.iter().filter(|o| o.status == OutcomeStatus::Denied).collect();
    assert_eq!(granted, 1);
    assert_eq!(denied.len(), 1);
    assert_eq!(denied[0].level, Some(0));
    assert_eq!(service.level_of("Ciudad Antigua").unwrap(), 0);
    // Both requests were in their external step at the same time
    assert_eq!(step.peak(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_montana_escondida_five_requests_three_seats() {
    let service = ReservationService::builder()
        .pool_size(5)
        .counter("Montaña Escondida", 3)
        .external_step(Arc::new(SimulatedLatency::new(
            Duration::from_millis(5),
            Duration::from_millis(40),
        )))
        .build()
        .unwrap();

    let subs: Vec<_> = (0..5)
        .map(|i| {
            service
                .submit_and_subscribe("Montaña Escondida", 1, format!("click-{}", i))
                .unwrap()
        })
        .collect();
    let outcomes = wait_all(subs).await;

    let mut granted_levels: Vec<u32> = outcomes
        .iter()
        .filter(|o| o.is_granted())
        .map(|o| o.level.unwrap())
        .collect();
    granted_levels.sort();
    assert_eq!(granted_levels, vec![0, 1, 2]);

    let denied: Vec<_> = outcomes.iter().filter(|o| o.status == OutcomeStatus::Denied).collect();
    assert_eq!(denied.len(), 2);
    assert!(denied.iter().all(|o| o.level == Some(0)));

    let stats = service.stats();
    assert_eq!(stats.submitted, 5);
    assert_eq!(stats.granted, 3);
    assert_eq!(stats.denied, 2);
    assert_eq!(stats.completed(), 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_exactly_once_under_induced_failures() {
    tg_common::logging::init_test_logging();
    let (sink, mut events) = ChannelSink::new();
    let step = Arc::new(MockStep::failing_every(3));
    let service = ReservationService::builder()
        .pool_size(6)
        .counter("Mercado Local", 100)
        .external_step(step.clone())
        .build()
        .unwrap();
    service.add_sink(Arc::new(sink));

    for i in 0..30 {
        service.submit("Mercado Local", 1, format!("m-{}", i)).unwrap();
    }

    let mut seen = HashSet::new();
    let mut unavailable = 0;
    while seen.len() < 30 {
        let outcome = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("missing outcomes")
            .unwrap();
        assert!(seen.insert(outcome.correlation_id.clone()), "duplicate outcome delivered");
        if outcome.status == OutcomeStatus::ServiceUnavailable {
            unavailable += 1;
        }
    }

    assert_eq!(unavailable, 10);
    assert_eq!(step.calls(), 30);
    assert_eq!(service.level_of("Mercado Local").unwrap(), 80);
    assert_eq!(service.reporter().delivered_count(), 30);
    assert_eq!(service.reporter().duplicate_count(), 0);

    // Nothing further arrives
    service.shutdown().await;
    assert!(events.try_recv().is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_panicking_step_reported_and_siblings_unaffected() {
    let step = Arc::new(MockStep::panicking_every(2));
    let service = ReservationService::builder()
        .pool_size(2)
        .gate("cajeros", 1)
        .gated_counter("saldo", 200, 200, "cajeros")
        .external_step(step.clone())
        .build()
        .unwrap();

    let subs: Vec<_> = (0..6)
        .map(|i| service.submit_and_subscribe("saldo", 10, format!("w-{}", i)).unwrap())
        .collect();
    let outcomes = wait_all(subs).await;

    let panicked = outcomes
        .iter()
        .filter(|o| o.status == OutcomeStatus::ServiceUnavailable)
        .count();
    assert_eq!(panicked, 3);
    assert_eq!(service.level_of("saldo").unwrap(), 170);

    // Workers survived and every ticket came back
    let gate = service.gate("cajeros").unwrap();
    assert_eq!(gate.outstanding(), 0);
    assert_eq!(service.worker_count(), 2);
    let next = service.submit_and_subscribe("saldo", 10, "after-panic").unwrap();
    let next = wait_all(vec![next]).await;
    assert_eq!(next.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failed_step_returns_gate_ticket() {
    let step = Arc::new(MockStep::failing_every(1));
    let service = ReservationService::builder()
        .gate("cajeros", 2)
        .gated_counter("saldo", 200, 200, "cajeros")
        .external_step(step)
        .build()
        .unwrap();
    let gate = service.gate("cajeros").unwrap();
    let before = gate.outstanding();

    let sub = service.submit_and_subscribe("saldo", 100, "withdraw-1").unwrap();
    let outcome = wait_all(vec![sub]).await.remove(0);

    assert_eq!(outcome.status, OutcomeStatus::ServiceUnavailable);
    assert_eq!(gate.outstanding(), before);
    assert_eq!(gate.high_water_mark(), 1);
    assert_eq!(service.level_of("saldo").unwrap(), 200);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_atm_facility_admits_two_at_a_time() {
    let service = ReservationService::builder()
        .pool_size(6)
        .gate("cajeros", 2)
        .external_step(Arc::new(SimulatedLatency::new(
            Duration::from_millis(10),
            Duration::from_millis(30),
        )))
        .build()
        .unwrap();

    let gate = service.gate("cajeros").unwrap();
    let subs: Vec<_> = (0..6)
        .map(|i| service.submit_and_subscribe("cajeros", 1, format!("Cliente-{}", i)).unwrap())
        .collect();

    // Sample occupancy while the clients are being served
    let sampler = {
        let gate = Arc::clone(&gate);
        tokio::spawn(async move {
            let mut max_seen = 0;
            for _ in 0..50 {
                max_seen = max_seen.max(gate.outstanding());
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
            max_seen
        })
    };

    let outcomes = wait_all(subs).await;
    assert!(outcomes.iter().all(|o| o.is_granted() && o.level.is_none()));
    assert!(sampler.await.unwrap() <= 2);
    assert_eq!(gate.high_water_mark(), 2);
    assert_eq!(gate.outstanding(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_gate_acquire_timeout_is_service_unavailable() {
    let release = Arc::new(Notify::new());
    let step = Arc::new(MockStep::blocked_on(release.clone()));
    let service = ReservationService::builder()
        .pool_size(2)
        .gate_with_timeout("cajeros", 1, Duration::from_millis(50))
        .external_step(step)
        .build()
        .unwrap();

    let first = service.submit_and_subscribe("cajeros", 1, "holder").unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    let second = service.submit_and_subscribe("cajeros", 1, "waiter").unwrap();

    let waiter = wait_all(vec![second]).await.remove(0);
    assert_eq!(waiter.status, OutcomeStatus::ServiceUnavailable);

    release.notify_one();
    let holder = wait_all(vec![first]).await.remove(0);
    assert!(holder.is_granted());
    assert_eq!(service.gate("cajeros").unwrap().outstanding(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_step_timeout_is_service_unavailable() {
    let service = ReservationService::builder()
        .counter("Playas del Sol", 5)
        .step_timeout(Duration::from_millis(20))
        .external_step(Arc::new(MockStep::with_delay(500)))
        .build()
        .unwrap();

    let sub = service.submit_and_subscribe("Playas del Sol", 1, "slow").unwrap();
    let outcome = wait_all(vec![sub]).await.remove(0);
    assert_eq!(outcome.status, OutcomeStatus::ServiceUnavailable);
    assert!(outcome.message.contains("timed out"));
    assert_eq!(service.level_of("Playas del Sol").unwrap(), 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_before_commit() {
    let release = Arc::new(Notify::new());
    let step = Arc::new(MockStep::blocked_on(release.clone()));
    let service = ReservationService::builder()
        .gate("cajeros", 1)
        .gated_counter("saldo", 200, 200, "cajeros")
        .external_step(step.clone())
        .build()
        .unwrap();

    let id = CorrelationId::from("change-of-mind");
    let sub = service.submit_and_subscribe("saldo", 50, id.clone()).unwrap();
    while step.calls() == 0 {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    assert!(service.cancel(&id));
    let outcome = wait_all(vec![sub]).await.remove(0);
    assert_eq!(outcome.status, OutcomeStatus::Cancelled);
    assert_eq!(service.level_of("saldo").unwrap(), 200);
    assert_eq!(service.gate("cajeros").unwrap().outstanding(), 0);

    // Already final
    assert!(!service.cancel(&id));
    assert_eq!(service.stats().cancelled, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_after_commit_returns_false() {
    let service = ReservationService::builder()
        .counter("Ciudad Antigua", 2)
        .external_step(Arc::new(SimulatedLatency::instant()))
        .build()
        .unwrap();

    let id = CorrelationId::from("done");
    let sub = service.submit_and_subscribe("Ciudad Antigua", 1, id.clone()).unwrap();
    assert!(wait_all(vec![sub]).await[0].is_granted());
    assert!(!service.cancel(&id));
    assert!(!service.cancel(&CorrelationId::from("never-submitted")));
}

#[tokio::test]
async fn test_synchronous_validation_errors() {
    let service = ReservationService::builder()
        .counter("Ciudad Antigua", 2)
        .gate("cajeros", 2)
        .external_step(Arc::new(SimulatedLatency::instant()))
        .build()
        .unwrap();

    assert_eq!(
        service.submit("Atlantis", 1, "x1"),
        Err(ReserveError::UnknownResource("Atlantis".into()))
    );
    assert!(matches!(
        service.submit("Ciudad Antigua", 0, "x2"),
        Err(ReserveError::InvalidArgument(_))
    ));
    assert!(matches!(service.level_of("Atlantis"), Err(ReserveError::UnknownResource(_))));

    service.submit("Ciudad Antigua", 1, "dup").unwrap();
    assert_eq!(
        service.submit("Ciudad Antigua", 1, "dup"),
        Err(ReserveError::DuplicateCorrelation("dup".into()))
    );
    assert_eq!(service.stats().submitted, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_queue_full_rejects_synchronously() {
    let release = Arc::new(Notify::new());
    let service = ReservationService::builder()
        .pool_size(1)
        .queue_capacity(1)
        .counter("Mercado Local", 10)
        .external_step(Arc::new(MockStep::blocked_on(release.clone())))
        .build()
        .unwrap();

    // First occupies the only worker, second fills the queue
    let first = service.submit_and_subscribe("Mercado Local", 1, "q-1").unwrap();
    while service.stats().active_workers == 0 {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    let second = service.submit_and_subscribe("Mercado Local", 1, "q-2").unwrap();

    let err = service.submit("Mercado Local", 1, "q-3").unwrap_err();
    assert_eq!(err, ReserveError::QueueFull("Mercado Local".into()));

    // The rejected handle can be reused once there is room
    release.notify_one();
    wait_all(vec![first]).await;
    release.notify_one();
    wait_all(vec![second]).await;
    let third = service.submit_and_subscribe("Mercado Local", 1, "q-3");
    release.notify_one();
    assert!(wait_all(vec![third.unwrap()]).await[0].is_granted());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_shutdown_drains_queue_then_rejects() {
    let service = ReservationService::builder()
        .pool_size(2)
        .counter("Playas del Sol", 10)
        .external_step(Arc::new(MockStep::with_delay(10)))
        .build()
        .unwrap();

    for i in 0..6 {
        service.submit("Playas del Sol", 1, format!("s-{}", i)).unwrap();
    }
    service.shutdown().await;

    let stats = service.stats();
    assert_eq!(stats.granted, 6);
    assert_eq!(stats.queue_depth, 0);
    assert_eq!(service.level_of("Playas del Sol").unwrap(), 4);
    assert!(!service.is_accepting());
    assert_eq!(
        service.submit("Playas del Sol", 1, "late"),
        Err(ReserveError::ShutdownInProgress)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_latency_does_not_serialize_requests() {
    let step = Arc::new(MockStep::with_delay(200));
    let service = ReservationService::builder()
        .pool_size(8)
        .counter("Ciudad Antigua", 100)
        .external_step(step.clone())
        .build()
        .unwrap();

    let started = Instant::now();
    let subs: Vec<_> = (0..8)
        .map(|i| service.submit_and_subscribe("Ciudad Antigua", 1, format!("p-{}", i)).unwrap())
        .collect();
    let outcomes = wait_all(subs).await;

    assert!(outcomes.iter().all(|o| o.is_granted()));
    // Serial execution would take 1.6s
    assert!(started.elapsed() < Duration::from_millis(1000));
    assert_eq!(step.peak(), 8);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_bank_withdrawals_never_overdraw() {
    // Two tellers withdraw 90 and 50 from a balance of 90, three rounds each.
    // Each round is a new request with a fresh handle.
    let service = ReservationService::builder()
        .pool_size(2)
        .gate("cajeros", 2)
        .gated_counter("saldo", 90, 90, "cajeros")
        .external_step(Arc::new(SimulatedLatency::new(
            Duration::from_millis(1),
            Duration::from_millis(10),
        )))
        .build()
        .unwrap();

    let mut subs = Vec::new();
    for round in 0..3 {
        subs.push(service.submit_and_subscribe("saldo", 90, format!("Hilo-1-{}", round)).unwrap());
        subs.push(service.submit_and_subscribe("saldo", 50, format!("Hilo-2-{}", round)).unwrap());
    }
    let outcomes = wait_all(subs).await;

    let withdrawn: u32 = outcomes
        .iter()
        .filter(|o| o.is_granted())
        .map(|o| o.amount)
        .sum();
    assert!(withdrawn <= 90);
    assert!(withdrawn == 90 || withdrawn == 50);
    assert_eq!(service.level_of("saldo").unwrap(), 90 - withdrawn);
    assert!(outcomes
        .iter()
        .filter(|o| o.status == OutcomeStatus::Denied)
        .all(|o| o.level.unwrap() < o.amount));
}

#[tokio::test]
async fn test_from_config() {
    let config = tg_config::AppConfig::from_toml(
        r#"
[worker]
pool_size = 3
latency_min_ms = 0
latency_max_ms = 0

[[gates]]
name = "cajeros"
slots = 2

[[counters]]
name = "Montaña Escondida"
capacity = 3
"#,
    )
    .unwrap();

    let service = ReservationService::from_config(&config).unwrap();
    assert_eq!(service.worker_count(), 3);
    assert_eq!(service.level_of("Montaña Escondida").unwrap(), 3);

    let sub = service.submit_and_subscribe("Montaña Escondida", 2, "cfg-1").unwrap();
    let outcome = sub.wait().await.unwrap();
    assert_eq!(outcome.level, Some(1));

    let stats = service.stats();
    assert_eq!(stats.gates.len(), 1);
    assert_eq!(stats.gates[0].slots, 2);
    assert_eq!(stats.counters[0].level, 1);
}

/// Sink that panics on one correlation handle
struct PanickingSink {
    poison: &'static str,
}

impl OutcomeSink for PanickingSink {
    fn deliver(&self, outcome: &ReservationOutcome) {
        if outcome.correlation_id.as_str() == self.poison {
            panic!("event loop crashed while rendering {}", self.poison);
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_panicking_sink_does_not_stall_the_worker() {
    let (sink, mut events) = ChannelSink::new();
    let service = ReservationService::builder()
        .pool_size(1)
        .counter("Mercado Local", 10)
        .external_step(Arc::new(SimulatedLatency::instant()))
        .build()
        .unwrap();
    service.add_sink(Arc::new(PanickingSink { poison: "boom" }));
    service.add_sink(Arc::new(sink));

    let boom = service.submit_and_subscribe("Mercado Local", 1, "boom").unwrap();
    assert!(wait_all(vec![boom]).await[0].is_granted());

    // The only worker is still alive and serves the next request
    let next = service.submit_and_subscribe("Mercado Local", 1, "next").unwrap();
    assert!(wait_all(vec![next]).await[0].is_granted());

    // Sinks registered after the faulty one still saw both outcomes
    let mut seen = Vec::new();
    for _ in 0..2 {
        let outcome = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("sink starved")
            .unwrap();
        seen.push(outcome.correlation_id.to_string());
    }
    seen.sort();
    assert_eq!(seen, vec!["boom".to_string(), "next".to_string()]);

    service.shutdown().await;
    let stats = service.stats();
    assert_eq!(stats.active_workers, 0);
    assert_eq!(stats.granted, 2);
    assert_eq!(service.level_of("Mercado Local").unwrap(), 8);
}

#[tokio::test]
async fn test_facility_rejects_amount_other_than_one() {
    let service = ReservationService::builder()
        .gate("cajeros", 2)
        .external_step(Arc::new(SimulatedLatency::instant()))
        .build()
        .unwrap();

    assert!(matches!(
        service.submit("cajeros", 5, "bulk"),
        Err(ReserveError::InvalidArgument(_))
    ));
    assert!(matches!(
        service.submit("cajeros", 2, "pair"),
        Err(ReserveError::InvalidArgument(_))
    ));
    assert_eq!(service.stats().submitted, 0);

    let sub = service.submit_and_subscribe("cajeros", 1, "single").unwrap();
    let outcome = sub.wait().await.unwrap();
    assert!(outcome.is_granted());
    assert_eq!(outcome.amount, 1);
    assert_eq!(service.gate("cajeros").unwrap().high_water_mark(), 1);
}

#[tokio::test]
async fn test_rejected_submissions_leave_no_subscription_slots() {
    let service = ReservationService::builder()
        .counter("Ciudad Antigua", 5)
        .gate("cajeros", 2)
        .external_step(Arc::new(SimulatedLatency::instant()))
        .build()
        .unwrap();
    let reporter = Arc::clone(service.reporter());

    for i in 0..100 {
        assert!(service.submit_and_subscribe("Atlantis", 1, format!("lost-{}", i)).is_err());
        assert!(service.submit_and_subscribe("Ciudad Antigua", 0, format!("zero-{}", i)).is_err());
        assert!(service.submit_and_subscribe("cajeros", 3, format!("bulk-{}", i)).is_err());
    }
    assert_eq!(reporter.tracked_count(), 0);

    // A rejected duplicate does not disturb the original request
    let original = service.submit_and_subscribe("Ciudad Antigua", 1, "dup").unwrap();
    for _ in 0..10 {
        assert!(matches!(
            service.submit_and_subscribe("Ciudad Antigua", 1, "dup"),
            Err(ReserveError::DuplicateCorrelation(_))
        ));
    }
    assert_eq!(reporter.tracked_count(), 1);
    assert!(original.wait().await.unwrap().is_granted());
    assert_eq!(reporter.tracked_count(), 1);
    assert_eq!(reporter.pending_count(), 0);
}
