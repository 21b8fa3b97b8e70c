//! Message types shared by the scheduler, the worker and control clients
//!
//! [`RunParams`] describes one experiment run and travels unchanged from a
//! control client, through the scheduler's queue, to the worker subprocess.
//! [`ControlRequest`] is what a control client sends to the master; every
//! request is answered with a [`Reply`](crate::protocol::Reply).

use serde::{Deserialize, Serialize};

use crate::protocol::Value;

/// What to run and with which arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunParams {
    /// Registered experiment name
    pub experiment: String,
    /// Mapping of experiment arguments
    #[serde(default = "Value::dict")]
    pub arguments: Value,
}

impl RunParams {
    /// Run of `experiment` with no arguments.
    pub fn new(experiment: impl Into<String>) -> Self {
        Self {
            experiment: experiment.into(),
            arguments: Value::dict(),
        }
    }

    /// Replaces the arguments mapping.
    pub fn with_arguments(mut self, arguments: Value) -> Self {
        self.arguments = arguments;
        self
    }
}

/// Requests accepted on the control port.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ControlRequest {
    /// Append a run to the queue. Answered with its `rid`.
    SubmitQueued {
        /// What to run
        run_params: RunParams,
        /// Seconds before the run is aborted
        #[serde(default)]
        timeout: Option<f64>,
    },

    /// Schedule a run for a wall-clock time. Answered with its `trid`.
    SubmitTimed {
        /// What to run
        run_params: RunParams,
        /// Seconds before the run is aborted
        #[serde(default)]
        timeout: Option<f64>,
        /// Seconds since the Unix epoch; now when absent
        #[serde(default)]
        next_run: Option<f64>,
    },

    /// Remove a queued run that is not executing
    CancelQueued {
        /// Run id
        rid: u64,
    },

    /// Remove a timed run
    CancelTimed {
        /// Timed run id
        trid: u64,
    },
}

impl ControlRequest {
    /// Helper to create a SubmitQueued request
    pub fn submit_queued(run_params: RunParams, timeout: Option<f64>) -> Self {
        Self::SubmitQueued {
            run_params,
            timeout,
        }
    }

    /// Helper to create a SubmitTimed request
    pub fn submit_timed(run_params: RunParams, timeout: Option<f64>, next_run: Option<f64>) -> Self {
        Self::SubmitTimed {
            run_params,
            timeout,
            next_run,
        }
    }
}
