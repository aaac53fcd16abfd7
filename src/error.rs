//! Agent error types
//!
//! Distinguishes the error kinds the agent reacts to differently:
//! configuration errors are fatal at startup, connection errors are retried
//! with backoff, persistence errors abort the operation but leave the
//! component running.

use thiserror::Error;

/// Agent error kinds
#[derive(Error, Debug)]
pub enum AgentError {
    /// Configuration invalid; fatal at startup
    #[error("invalid configuration: {0}")]
    BadArgs(String),

    /// Service bring-up failed; fatal unless a retry path exists
    #[error("cannot initialize: {0}")]
    CantInitialize(String),

    /// Network/TLS/MQTT failure; retried with backoff
    #[error("cannot connect: {0}")]
    CantConnect(String),

    /// Persistence read failure; logged, operation aborted
    #[error("cannot read: {0}")]
    CantRead(String),

    /// Persistence write failure; logged, operation aborted
    #[error("cannot write: {0}")]
    CantWrite(String),

    /// Request expired; the waiter is resumed with a null result
    #[error("request timed out: {0}")]
    Timeout(String),

    /// Precondition violation; logged, operation dropped
    #[error("bad state: {0}")]
    BadState(String),

    /// Bounded buffer exceeded; payload dropped with a warning
    #[error("payload too large: {0}")]
    WontFit(String),
}

impl AgentError {
    /// True for errors that should abort startup rather than retry
    pub fn is_fatal(&self) -> bool {
        matches!(self, AgentError::BadArgs(_) | AgentError::CantInitialize(_))
    }
}
