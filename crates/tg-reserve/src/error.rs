use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReserveError {
    #[error("Unknown resource: {0}")]
    UnknownResource(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Resource already registered: {0}")]
    DuplicateResource(String),

    #[error("Correlation id already submitted: {0}")]
    DuplicateCorrelation(String),

    #[error("Capacity exceeded for {resource}: level {level} + {amount} > capacity {capacity}")]
    CapacityExceeded {
        resource: String,
        level: u32,
        amount: u32,
        capacity: u32,
    },

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    /// A ticket was presented to a gate that does not have it outstanding
    #[error("Ticket {ticket} is not outstanding at gate {gate}")]
    DoubleRelease { gate: String, ticket: u64 },

    #[error("Request queue full: {0}")]
    QueueFull(String),

    #[error("Shutdown in progress")]
    ShutdownInProgress,

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<tg_config::ConfigError> for ReserveError {
    fn from(e: tg_config::ConfigError) -> Self {
        ReserveError::Config(e.to_string())
    }
}
