use serde::{Deserialize, Serialize};
use chrono::{DateTime, Utc};
use std::fmt;
use std::time::Duration;

pub mod logging;

// ============================================================================
// Request Types
// ============================================================================

/// Caller-supplied identifier linking a request to its eventual outcome.
///
/// Handles are single-use: a retry is a new request with a fresh handle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a random handle for callers that have no natural identifier
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CorrelationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for CorrelationId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A reservation against a named counter or facility.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReservationRequest {
    pub resource: String,
    pub amount: u32,
    pub correlation_id: CorrelationId,
}

impl ReservationRequest {
    pub fn new(resource: impl Into<String>, amount: u32, correlation_id: impl Into<CorrelationId>) -> Self {
        Self {
            resource: resource.into(),
            amount,
            correlation_id: correlation_id.into(),
        }
    }
}

// ============================================================================
// Outcome Types
// ============================================================================

/// Terminal state of a reservation request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutcomeStatus {
    /// Decrement committed (or facility service completed)
    Granted,
    /// Counter exhausted; a normal terminal state, not an error
    Denied,
    /// External step failed, timed out, or the gate could not be entered in time
    ServiceUnavailable,
    /// Cancelled by the caller before the commit step
    Cancelled,
}

impl OutcomeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeStatus::Granted => "granted",
            OutcomeStatus::Denied => "denied",
            OutcomeStatus::ServiceUnavailable => "service_unavailable",
            OutcomeStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The single terminal result produced for a reservation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReservationOutcome {
    pub correlation_id: CorrelationId,
    pub resource: String,
    pub amount: u32,
    pub status: OutcomeStatus,
    /// Counter level after the commit attempt; `None` for facilities or
    /// when the counter was never consulted
    pub level: Option<u32>,
    pub message: String,
    pub elapsed_ms: u64,
    pub completed_at: DateTime<Utc>,
}

impl ReservationOutcome {
    fn build(
        request: &ReservationRequest,
        status: OutcomeStatus,
        level: Option<u32>,
        message: String,
        elapsed: Duration,
    ) -> Self {
        Self {
            correlation_id: request.correlation_id.clone(),
            resource: request.resource.clone(),
            amount: request.amount,
            status,
            level,
            message,
            elapsed_ms: elapsed.as_millis() as u64,
            completed_at: Utc::now(),
        }
    }

    pub fn granted(request: &ReservationRequest, level: Option<u32>, elapsed: Duration) -> Self {
        let message = match level {
            Some(l) => format!("Reserved {} of {}; {} remaining", request.amount, request.resource, l),
            None => format!("Served at {}", request.resource),
        };
        Self::build(request, OutcomeStatus::Granted, level, message, elapsed)
    }

    pub fn denied(request: &ReservationRequest, level: u32, elapsed: Duration) -> Self {
        let message = format!(
            "Insufficient {}: requested {}, available {}",
            request.resource, request.amount, level
        );
        Self::build(request, OutcomeStatus::Denied, Some(level), message, elapsed)
    }

    pub fn service_unavailable(request: &ReservationRequest, reason: impl Into<String>, elapsed: Duration) -> Self {
        Self::build(request, OutcomeStatus::ServiceUnavailable, None, reason.into(), elapsed)
    }

    pub fn cancelled(request: &ReservationRequest, elapsed: Duration) -> Self {
        let message = format!("Reservation for {} cancelled before commit", request.resource);
        Self::build(request, OutcomeStatus::Cancelled, None, message, elapsed)
    }

    pub fn is_granted(&self) -> bool {
        self.status == OutcomeStatus::Granted
    }
}

// ============================================================================
// Resource State
// ============================================================================

/// Result of a guarded decrement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecrementResult {
    pub granted: bool,
    pub new_level: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CounterSnapshot {
    pub name: String,
    pub capacity: u32,
    pub level: u32,
    pub gate: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GateSnapshot {
    pub name: String,
    pub slots: u32,
    pub outstanding: u32,
    pub high_water_mark: u32,
}

/// Aggregate statistics for status display
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReservationStats {
    pub submitted: u64,
    pub granted: u64,
    pub denied: u64,
    pub unavailable: u64,
    pub cancelled: u64,
    pub queue_depth: u32,
    pub active_workers: u32,
    pub counters: Vec<CounterSnapshot>,
    pub gates: Vec<GateSnapshot>,
}

impl ReservationStats {
    /// Requests that have reached a terminal state
    pub fn completed(&self) -> u64 {
        self.granted + self.denied + self.unavailable + self.cancelled
    }
}
