//! Object protocol shared by every channel of the master.
//!
//! - [`Value`]: the dynamic value model (integers of any size, floats
//!   including NaN/Infinity, strings, bytes, lists, tuples, mappings, bools
//!   and none).
//! - [`ObjectChannel`]: a line-delimited transport carrying one encoded value
//!   (or serde message) per line.
//! - [`Reply`]: the `{status: ok|error}` envelope used to answer requests on
//!   both the worker pipe and control connections. Error replies carry an
//!   [`ErrorKind`] for the variants a client needs to tell apart.

pub mod channel;
pub mod value;

pub use channel::ObjectChannel;
pub use value::Value;

use serde::{Deserialize, Serialize};

use crate::error::MasterError;

/// Answer to a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Reply {
    /// The request succeeded; `data` is its result (`None` when there is
    /// nothing to return).
    Ok {
        /// Result of the request
        #[serde(default)]
        data: Value,
    },
    /// The request was rejected.
    Error {
        /// Human-readable reason
        message: String,
        /// Category of the failure, omitted on the wire for [`ErrorKind::Other`]
        #[serde(default, skip_serializing_if = "ErrorKind::is_other")]
        kind: ErrorKind,
    },
}

/// Which [`MasterError`] an error reply stands for, so that clients can
/// rebuild the specific variant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ErrorKind {
    /// Anything without a dedicated kind
    #[default]
    Other,
    /// Unknown name or id
    Lookup {
        /// Detail of the failed lookup, without the display prefix
        what: String,
    },
    /// The run `rid` is executing and cannot be cancelled
    Cancellation {
        /// Run id
        rid: u64,
    },
}

impl ErrorKind {
    /// Classifies `err`.
    pub fn of(err: &MasterError) -> Self {
        match err {
            MasterError::Lookup(what) => ErrorKind::Lookup { what: what.clone() },
            MasterError::Cancellation(rid) => ErrorKind::Cancellation { rid: *rid },
            _ => ErrorKind::Other,
        }
    }

    /// True for [`ErrorKind::Other`].
    pub fn is_other(&self) -> bool {
        matches!(self, ErrorKind::Other)
    }

    /// Rebuilds the error on the receiving side. Replies without a specific
    /// kind become [`MasterError::ParentAction`].
    pub fn into_error(self, message: String) -> MasterError {
        match self {
            ErrorKind::Other => MasterError::ParentAction(message),
            ErrorKind::Lookup { what } => MasterError::Lookup(what),
            ErrorKind::Cancellation { rid } => MasterError::Cancellation(rid),
        }
    }
}

impl Reply {
    /// Wraps a handler result, keeping the error's kind.
    pub fn from_result(result: Result<Value, MasterError>) -> Self {
        match result {
            Ok(data) => Reply::Ok { data },
            Err(err) => Reply::Error {
                message: err.to_string(),
                kind: ErrorKind::of(&err),
            },
        }
    }

    /// An error reply without a specific kind.
    pub fn error(message: impl Into<String>) -> Self {
        Reply::Error {
            message: message.into(),
            kind: ErrorKind::Other,
        }
    }
}

/// Encodes a value as a single protocol line (without terminator).
pub fn encode(value: &Value) -> Result<String, MasterError> {
    Ok(serde_json::to_string(value)?)
}

/// Decodes a value from its textual form. Multi-line (pretty) input is
/// accepted, which is how flat-file databases are stored.
pub fn decode(text: &str) -> Result<Value, MasterError> {
    Ok(serde_json::from_str(text)?)
}
