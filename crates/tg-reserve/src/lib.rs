//! Tollgate Reservation Core
//!
//! Coordinates concurrent reservations against finite shared resources:
//! - ResourcePool: named counters with per-counter guarded decrement-with-floor
//! - AdmissionGate: counting-semaphore admission for bounded facilities
//! - ExternalStep: the simulated long-latency call made before committing
//! - ReservationService: bounded worker pool running reservations end to end
//! - OutcomeReporter: exactly-once outcome delivery to subscribers and sinks

pub mod error;
pub mod resource_pool;
pub mod admission_gate;
pub mod external_step;
pub mod reporter;
pub mod service;
pub mod service_metrics;

pub use error::ReserveError;
pub use resource_pool::ResourcePool;
pub use admission_gate::{AdmissionGate, Ticket};
pub use external_step::{ExternalStep, SimulatedLatency, StepError};
pub use reporter::{OutcomeReporter, OutcomeSink, OutcomeSubscription, LogSink, ChannelSink};
pub use service::{ReservationService, ReservationServiceBuilder};

pub use tg_common::{
    CorrelationId, DecrementResult, OutcomeStatus, ReservationOutcome, ReservationRequest,
    ReservationStats,
};

pub type Result<T> = std::result::Result<T, ReserveError>;
