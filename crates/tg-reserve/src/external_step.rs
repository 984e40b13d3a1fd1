//! ExternalStep - the long-latency call a reservation makes before committing
//!
//! Stands in for a network/API round trip. Implementations must not touch
//! the resource pool or hold any lock: the worker runs this step outside every
//! critical section.

use std::time::Duration;
use async_trait::async_trait;
use rand::Rng;
use thiserror::Error;
use tracing::debug;

use tg_common::ReservationRequest;
use tg_config::WorkerConfig;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StepError {
    #[error("external step failed: {0}")]
    Failed(String),

    #[error("external step timed out after {0:?}")]
    TimedOut(Duration),
}

/// Trait for the external step performed by reservation workers
#[async_trait]
pub trait ExternalStep: Send + Sync {
    async fn perform(&self, request: &ReservationRequest) -> Result<(), StepError>;
}

/// Random delay within `[min, max]` with an optional injected failure rate
#[derive(Debug, Clone)]
pub struct SimulatedLatency {
    min: Duration,
    max: Duration,
    failure_rate: f64,
}

impl SimulatedLatency {
    pub fn new(min: Duration, max: Duration) -> Self {
        let (min, max) = if min <= max { (min, max) } else { (max, min) };
        Self { min, max, failure_rate: 0.0 }
    }

    /// No delay, never fails
    pub fn instant() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO)
    }

    pub fn from_config(config: &WorkerConfig) -> Self {
        let (min, max) = config.latency_range();
        Self::new(min, max).with_failure_rate(config.failure_rate)
    }

    pub fn with_failure_rate(mut self, rate: f64) -> Self {
        self.failure_rate = rate.clamp(0.0, 1.0);
        self
    }

    /// Draw the delay and the failure decision up front; the thread-local
    /// RNG must not live across an await point
    fn draw(&self) -> (Duration, bool) {
        let mut rng = rand::rng();
        let min_ms = self.min.as_millis() as u64;
        let max_ms = self.max.as_millis() as u64;
        let delay = Duration::from_millis(rng.random_range(min_ms..=max_ms));
        let fail = self.failure_rate > 0.0 && rng.random_bool(self.failure_rate);
        (delay, fail)
    }
}

#[async_trait]
impl ExternalStep for SimulatedLatency {
    async fn perform(&self, request: &ReservationRequest) -> Result<(), StepError> {
        let (delay, fail) = self.draw();

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if fail {
            debug!(
                correlation_id = %request.correlation_id,
                delay_ms = delay.as_millis() as u64,
                "Simulated external step failure"
            );
            return Err(StepError::Failed(format!(
                "simulated upstream error for {}",
                request.resource
            )));
        }
        Ok(())
    }
}
