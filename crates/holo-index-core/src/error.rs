//! Error taxonomy shared by every HoloIndex component.
//!
//! Only [`HoloError::InvalidFeedback`], [`HoloError::CorruptionDetected`] and
//! [`HoloError::StoreUnavailable`] are expected to reach callers directly.
//! Degradations and component timeouts are normally folded into the composed
//! output as warnings; the variants exist so that components can report them
//! in a structured way.

/// Result alias used across the core and application crates.
pub type HoloResult<T> = Result<T, HoloError>;

#[derive(Debug, thiserror::Error)]
pub enum HoloError {
    /// A primary dependency (embedding provider, reasoning engine) was
    /// unavailable and a fallback produced the result.
    #[error("degraded search: {reason}")]
    DegradedSearch { reason: String },

    /// A routed component exceeded its time budget.
    #[error("component {component} timed out after {budget_ms}ms")]
    ComponentTimeout { component: String, budget_ms: u64 },

    /// A coordination-store invariant was violated. The offending write was
    /// rejected and the prior value retained.
    #[error("corruption detected: {details}")]
    CorruptionDetected { details: String },

    /// A feedback submission was malformed or referenced an unknown query.
    #[error("invalid feedback: {reason}")]
    InvalidFeedback { reason: String },

    /// The transactional backend could not be reached.
    #[error("store unavailable: {reason}")]
    StoreUnavailable { reason: String },

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    /// Any other storage-layer failure (constraint violation, bad row, ...).
    #[error("storage error: {message}")]
    Storage { message: String },
}

impl HoloError {
    pub fn storage(message: impl Into<String>) -> Self {
        HoloError::Storage {
            message: message.into(),
        }
    }

    pub fn unavailable(reason: impl Into<String>) -> Self {
        HoloError::StoreUnavailable {
            reason: reason.into(),
        }
    }

    pub fn invalid_feedback(reason: impl Into<String>) -> Self {
        HoloError::InvalidFeedback {
            reason: reason.into(),
        }
    }

    pub fn corruption(details: impl Into<String>) -> Self {
        HoloError::CorruptionDetected {
            details: details.into(),
        }
    }

    /// Whether the error means the backend itself is unreachable, as opposed
    /// to a rejected operation.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, HoloError::StoreUnavailable { .. })
    }
}

impl From<serde_json::Error> for HoloError {
    fn from(e: serde_json::Error) -> Self {
        HoloError::storage(format!("serialization: {e}"))
    }
}
