use std::fmt;

/// Canonical category for a core-level failure.
///
/// Coarse-grained on purpose: used for policy decisions (does a queue
/// operation recover or propagate?) and as an observability dimension in
/// logs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Null/invalid required input, or API misuse (includes a detected
    /// thenable-adoption cycle).
    InvalidArgument,
    /// Reaction queue growth or scheduler task allocation failed.
    AllocationFailed,
    /// Reserved for deferred-layer misuse diagnostics; resolving/rejecting
    /// an already-settled promise is a silent no-op, not an error.
    AlreadySettled,
    /// Submission to a queue that is being freed.
    QueueShuttingDown,
    /// Generic wrapper when an `on_error` handler re-propagates.
    OperationFailed,
    /// `flush` or a user-built timeout combinator exceeded its bound.
    Timeout,
    /// State could not be made durable.
    DurabilityFailed,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::InvalidArgument => "invalid argument",
            Self::AllocationFailed => "allocation failed",
            Self::AlreadySettled => "already settled",
            Self::QueueShuttingDown => "queue shutting down",
            Self::OperationFailed => "operation failed",
            Self::Timeout => "timeout",
            Self::DurabilityFailed => "durability failed",
        };
        f.write_str(s)
    }
}

/// Structured core error: a coarse `kind` plus a human-readable `message`
/// and optional low-level `detail`.
///
/// Carried as a rejection payload or returned directly from synchronous
/// API entry points.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct CoreError {
    pub kind: ErrorKind,
    pub message: String,
    pub detail: Option<String>,
}

impl CoreError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}
