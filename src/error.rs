//! Error types for flow execution.

use thiserror::Error;

/// The main error type for flow operations.
///
/// Every way a unit can fail surfaces as one of these values inside the
/// failing [`Response`](crate::Response). Lifecycle calls on
/// [`FlowEngine`](crate::FlowEngine) reuse the same type for rejected
/// transitions.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A unit completed with a payload other than the type it declared.
    #[error("Type mismatch: expected `{expected}`, got `{actual}`")]
    TypeMismatch {
        /// Type name the unit declared.
        expected: &'static str,
        /// Type name of the payload actually delivered.
        actual: &'static str,
    },

    /// A retry-decorated unit spent its whole attempt budget.
    #[error("Retries exhausted after {retries} retries: {last}")]
    RetryExhausted {
        /// Number of retries performed after the first attempt.
        retries: u32,
        /// The error reported by the final attempt.
        last: Box<Error>,
    },

    /// A switch selector picked no unit and the flow is configured to fail.
    #[error("No unit selected for branch {branch}")]
    NoBranchSelected {
        /// Position of the branch inside its step.
        branch: usize,
    },

    /// A lifecycle operation was called from a state that does not allow it.
    #[error("Cannot {op} a flow in state {state}")]
    InvalidTransition {
        /// The rejected operation.
        op: &'static str,
        /// The state the engine was in.
        state: crate::FlowState,
    },

    /// The flow was cancelled before it settled.
    #[error("Flow cancelled")]
    Cancelled,

    /// An error occurred while executing a unit.
    #[error("Execution error: {0}")]
    Execution(String),

    /// A generic error with a message.
    #[error("{0}")]
    Message(String),
}

impl Error {
    /// Follow `RetryExhausted` wrappers down to the error that caused them.
    pub fn root(&self) -> &Error {
        match self {
            Error::RetryExhausted { last, .. } => last.root(),
            other => other,
        }
    }
}

impl From<String> for Error {
    fn from(msg: String) -> Self {
        Error::Message(msg)
    }
}

impl From<&str> for Error {
    fn from(msg: &str) -> Self {
        Error::Message(msg.to_string())
    }
}

/// A specialized `Result` type for flow operations.
pub type Result<T> = std::result::Result<T, Error>;
