use thiserror::Error;

/// Faults from talking to the booking backend.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Network failure; nothing reached the backend or came back.
    #[error("network failure: {0}")]
    Transport(#[from] reqwest::Error),
    /// The backend answered, but with a body we could not read.
    #[error("unreadable response: {0}")]
    InvalidResponse(#[from] serde_json::Error),
    /// The backend explicitly refused the operation. Carries the backend's
    /// own reason when it gave one.
    #[error("{0}")]
    Rejected(String),
}

impl ApiError {
    /// True for explicit backend refusals, false for connectivity-class
    /// faults (transport and unreadable responses).
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Rejected(_))
    }
}

/// Faults from the local cache. Never fatal; callers log and carry on with
/// in-memory state.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache io: {0}")]
    Io(#[from] std::io::Error),
    #[error("cache encoding: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Why a booking attempt (or cancellation) did not go through.
///
/// Validation and gating variants are produced before any network call is
/// made; `Api` wraps what the backend or the network said afterwards.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("no massage type selected")]
    MissingType,
    #[error("no duration selected")]
    MissingDuration,
    #[error("no slot selected")]
    MissingSlot,
    #[error("unknown massage type: {0}")]
    UnknownType(String),
    #[error("massage type {massage_type} has no {minutes}-minute option")]
    UnknownDuration { massage_type: String, minutes: i64 },
    #[error("cooldown active: {remaining_secs}s left")]
    CooldownActive { remaining_secs: i64 },
    #[error("another booking operation is already in flight")]
    Busy,
    #[error("booking limit reached: {0}")]
    LimitReached(String),
    #[error(transparent)]
    Api(#[from] ApiError),
}

impl SubmitError {
    /// True when the attempt never left the client (validation, cooldown,
    /// concurrency or policy gate) — no state changed anywhere.
    pub fn is_local(&self) -> bool {
        !matches!(self, Self::Api(_))
    }
}
