use thiserror::Error;

/// An error that happens when computing a value through the dispatcher.
///
/// Only the final classification of a computation ever reaches a caller;
/// transient per-attempt failures are absorbed by the retry policy and are
/// never surfaced individually.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ComputeError {
    /// The wrapped operation returned a fatal error.
    ///
    /// The attached string is the operation's own error message, surfaced
    /// verbatim. Fatal errors are never cached.
    #[error("operation failed: {0}")]
    OperationFailed(String),
    /// The operation failed on every retryable attempt.
    ///
    /// The attached string is the cause of the last attempt.
    #[error("retries exhausted: {0}")]
    RetryExhausted(String),
    /// The overall time budget for the call elapsed.
    ///
    /// This is returned both for a leader whose retry budget ran out and for
    /// a follower that stopped waiting, as well as when a leader was
    /// cancelled before publishing an outcome.
    #[error("deadline exceeded")]
    DeadlineExceeded,
    /// The worker pool queue was full at submission time.
    ///
    /// This is surfaced immediately without waiting, so callers can shed
    /// load instead of blocking.
    #[error("worker pool overloaded")]
    Overloaded,
    /// An unexpected error in the dispatcher itself.
    ///
    /// This variant is not expected during normal operation and is always
    /// accompanied by a `tracing::error!` log.
    #[error("internal error")]
    InternalError,
}

impl ComputeError {
    #[track_caller]
    pub(crate) fn from_std_error<E: std::error::Error + 'static>(e: E) -> Self {
        let dynerr: &dyn std::error::Error = &e; // tracing expects a `&dyn Error`
        tracing::error!(error = dynerr);
        Self::InternalError
    }
}

/// The result of a computation, either a value or the reason it failed.
pub type ComputeResult<T> = Result<T, ComputeError>;

/// A failure reported by the wrapped operation itself.
///
/// The embedding application classifies its own failures; the retry policy
/// matches on this exhaustively and never inspects the message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OperationError {
    /// The failure is worth retrying (connection loss, 5xx response, …).
    #[error("transient: {0}")]
    Transient(String),
    /// Retrying cannot help (bad input, 4xx response, …).
    #[error("fatal: {0}")]
    Fatal(String),
}
