//! Error hierarchy for the execution engine.
//!
//! Transient outcomes (timeouts, abnormal work-unit exits) never surface as
//! errors; they travel as [`ExecutionOutcome`](crate::ExecutionOutcome) data.
//! Only configuration and capacity failures terminate a call.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    /// The task supervisor is at capacity. Fatal for this call, never
    /// retried internally.
    #[error("task supervisor at capacity ({limit} units running)")]
    ResourceExhausted { limit: usize },

    /// The local node identity is not of the required `shortname@hostname`
    /// shape. Raised before any connection attempt.
    #[error("invalid node identity '{0}': expected shortname@hostname")]
    InvalidIdentity(String),

    /// The requested work kind has no registered handler.
    #[error("no work unit registered under kind '{0}'")]
    UnknownTask(String),
}
