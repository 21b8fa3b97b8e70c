//! Messages exchanged over the worker's stdin/stdout pipe.
//!
//! ```text
//! master                                   worker
//!   │ ── RunParams ─────────────────────────► │
//!   │ ◄───────────────────────────── "ack" ── │
//!   │ ◄──────────── WorkerRequest (RPC) ───── │   any number of times
//!   │ ── Reply ─────────────────────────────► │
//!   │ ◄──────── report_completed ──────────── │   exactly once, no reply
//! ```

use serde::{Deserialize, Serialize};

use crate::protocol::Value;
use crate::sync_struct::Mod;

/// Acknowledgement sent by the worker after it accepted a run request.
pub const ACK: &str = "ack";

/// Outcome carried by the completion report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompletionStatus {
    /// The run succeeded
    Ok,
    /// The run failed; see the message
    Failed,
}

/// A message sent by the worker while a run is in progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum WorkerRequest {
    /// Device database entry for `name`
    ReqDevice {
        /// Device name
        name: String,
    },
    /// Parameter database value for `name`
    ReqParameter {
        /// Parameter name
        name: String,
    },
    /// Persist a parameter
    SetParameter {
        /// Parameter name
        name: String,
        /// New value
        value: Value,
    },
    /// Declare the realtime results of the run that just started
    InitRtResults {
        /// Mapping of result name (or tuple of names) to display hints
        description: Value,
    },
    /// Forward one mutation of the realtime results
    UpdateRtResults {
        /// Event to replay on the published results
        #[serde(rename = "mod")]
        modification: Mod,
    },
    /// End of the run. Not answered.
    ReportCompleted {
        /// Whether the run succeeded
        status: CompletionStatus,
        /// Formatted error for a failed run
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

impl WorkerRequest {
    /// Completion report for `result`.
    pub fn completed(result: &anyhow::Result<()>) -> Self {
        match result {
            Ok(()) => Self::ReportCompleted {
                status: CompletionStatus::Ok,
                message: None,
            },
            Err(e) => Self::ReportCompleted {
                status: CompletionStatus::Failed,
                message: Some(format!("{e:?}")),
            },
        }
    }

    /// Wire name of the request.
    pub fn action(&self) -> &'static str {
        match self {
            Self::ReqDevice { .. } => "req_device",
            Self::ReqParameter { .. } => "req_parameter",
            Self::SetParameter { .. } => "set_parameter",
            Self::InitRtResults { .. } => "init_rt_results",
            Self::UpdateRtResults { .. } => "update_rt_results",
            Self::ReportCompleted { .. } => "report_completed",
        }
    }
}
