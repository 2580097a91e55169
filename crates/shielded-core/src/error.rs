use std::fmt;

/// Errors surfaced to application code by the shielded runtime.
///
/// Transient conflicts and writable-read collisions are deliberately absent
/// from this enum: the runner swallows and retries them internally (see the
/// crate-level docs on `in_transaction`), so they never reach a caller.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A cell or dictionary write, or a query like
    /// `Shield::current_transaction_start_stamp`, was attempted with no
    /// active transaction on the current thread.
    #[error("not in a transaction: {operation} requires an active transaction")]
    NotInTransaction {
        /// Name of the operation that was attempted.
        operation: &'static str,
    },

    /// An internal consistency check failed: the commit protocol was
    /// violated in a way that validation should have already ruled out.
    /// This always indicates a bug in the runtime rather than a retryable
    /// application-level conflict.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// An operation was attempted against a transaction that already
    /// finished committing or rolling back on this thread (or was never
    /// started on it): `enlist`, `pre_commit`, `side_effect`,
    /// `sync_side_effect`, and `rollback` are only valid while a commit
    /// attempt for the calling thread is still in flight.
    #[error("continuation already completed: {operation} has no active transaction on this thread")]
    ContinuationCompleted {
        /// Name of the operation that was attempted.
        operation: &'static str,
    },
}

impl Error {
    /// Builds a [`Error::NotInTransaction`] naming the offending operation.
    pub fn not_in_transaction(operation: &'static str) -> Self {
        Error::NotInTransaction { operation }
    }

    /// Builds a [`Error::ProtocolViolation`] with a formatted message.
    pub fn protocol_violation(message: impl fmt::Display) -> Self {
        Error::ProtocolViolation(message.to_string())
    }

    /// Builds a [`Error::ContinuationCompleted`] naming the offending
    /// operation.
    pub fn continuation_completed(operation: &'static str) -> Self {
        Error::ContinuationCompleted { operation }
    }

    /// True for errors that indicate a programmer error in how the
    /// transaction API was used, as opposed to a data race the runner
    /// already retried away.
    pub fn is_misuse(&self) -> bool {
        matches!(
            self,
            Error::NotInTransaction { .. } | Error::ContinuationCompleted { .. }
        )
    }

    /// True for errors that indicate a bug in the runtime itself.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, Error::ProtocolViolation(_))
    }
}
