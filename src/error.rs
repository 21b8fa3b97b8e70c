//! Custom error types for the master.
//!
//! This module defines the primary error type, `MasterError`, shared by the
//! scheduler, the worker protocol, the replication layer and the broker.
//!
//! ## Error Hierarchy
//!
//! - **`Protocol`**: A malformed or out-of-sequence message on any channel
//!   (worker pipe, replication stream, control connection), or a mutation that
//!   does not fit the container it targets.
//! - **`Lookup`**: An unknown device, parameter, result, `rid` or `trid`.
//! - **`Cancellation`**: An attempt to cancel the queue head while it runs.
//! - **`Process`**: The worker subprocess crashed, stopped answering or ran
//!   past its timeout.
//! - **`UnitExecution`**: The experiment itself failed. Carries the formatted
//!   error text produced inside the worker.
//! - **`ParentAction`**: The master rejected a non-lookup request coming from
//!   the worker (or a control request coming from a client).
//! - **`Device`**: A device driver failed to open, execute or close.
//!
//! Run-level failures (`UnitExecution`, `Process`) are caught at the
//! scheduler's per-run boundary and only ever logged.

use thiserror::Error;

/// Convenience alias for results using the master error type.
pub type MasterResult<T> = std::result::Result<T, MasterError>;

/// Errors raised anywhere in the master or the worker.
#[derive(Error, Debug)]
pub enum MasterError {
    /// Malformed or unexpected message, or a mutation that does not fit its
    /// target container
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Unknown name or id
    #[error("Lookup error: {0}")]
    Lookup(String),

    /// The run is executing and cannot be cancelled
    #[error("Cannot cancel RID {0}: it is currently running")]
    Cancellation(u64),

    /// Worker crashed, timed out or broke the protocol
    #[error("Worker process error: {0}")]
    Process(String),

    /// The experiment failed; carries the worker-side error text
    #[error("Experiment failed:\n{0}")]
    UnitExecution(String),

    /// A request was rejected for a reason other than a failed lookup
    #[error("Request rejected by master: {0}")]
    ParentAction(String),

    /// Device driver failure
    #[error("Device error: {0}")]
    Device(String),

    /// Configuration could not be loaded
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration loaded but is invalid
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// I/O
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for MasterError {
    fn from(err: serde_json::Error) -> Self {
        MasterError::Protocol(err.to_string())
    }
}

impl From<figment::Error> for MasterError {
    fn from(err: figment::Error) -> Self {
        MasterError::Config(Box::new(err))
    }
}
