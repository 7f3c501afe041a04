#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Malformed date/time, empty ride id. Not retryable.
    InvalidInput(String),
    /// The slot is held or booked by someone else.
    Conflict(String),
    /// Promotion found no live hold: it expired before payment confirmation.
    HoldLost(String),
    LimitExceeded(&'static str),
    /// The durable log refused the write; the mutation did not happen.
    WalError(String),
    /// A backing source could not be read.
    Unavailable(String),
}

impl EngineError {
    /// Client-fault errors are reported back verbatim and never retried.
    pub fn is_client_fault(&self) -> bool {
        matches!(
            self,
            EngineError::InvalidInput(_) | EngineError::LimitExceeded(_)
        )
    }

    pub fn is_storage_fault(&self) -> bool {
        matches!(self, EngineError::WalError(_) | EngineError::Unavailable(_))
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            EngineError::Conflict(key) => {
                write!(f, "selected time slot is no longer available: {key}")
            }
            EngineError::HoldLost(key) => {
                write!(f, "hold expired before the booking was finalized: {key}")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
            EngineError::Unavailable(e) => write!(f, "storage unavailable: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
