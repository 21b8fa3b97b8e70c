//! Master-side answers to worker requests.

use std::sync::Arc;

use tracing::debug;

use super::messages::WorkerRequest;
use crate::db::{realtime_names, FlatFileDb};
use crate::error::{MasterError, MasterResult};
use crate::protocol::Value;
use crate::sync_struct::{lock, SharedNotifier};

/// Handles the RPC requests a worker makes while a run executes.
///
/// Called on the scheduler's task between reads of the worker pipe, so
/// implementations should not block for long.
pub trait RequestHandler: Send + Sync {
    /// Answers one request. The returned value is sent back as `data`.
    fn handle(&self, request: WorkerRequest) -> MasterResult<Value>;
}

/// The master's handlers: device and parameter databases plus the
/// published realtime results of the current run.
pub struct MasterHandlers {
    devices: Arc<FlatFileDb>,
    parameters: Arc<FlatFileDb>,
    rt_results: SharedNotifier,
}

impl MasterHandlers {
    /// Handlers over the master's databases and realtime results notifier.
    pub fn new(
        devices: Arc<FlatFileDb>,
        parameters: Arc<FlatFileDb>,
        rt_results: SharedNotifier,
    ) -> Self {
        Self {
            devices,
            parameters,
            rt_results,
        }
    }

    /// Replaces the realtime results with one empty sequence per name.
    fn init_rt_results(&self, description: &Value) -> MasterResult<()> {
        let names = realtime_names(description)?;
        let mut rt = lock(&self.rt_results);
        let stale: Vec<Value> = rt
            .read()
            .as_dict()
            .map(|entries| entries.iter().map(|(k, _)| k.clone()).collect())
            .unwrap_or_default();
        for key in stale {
            rt.remove_key(key)?;
        }
        for name in names {
            rt.insert(name, Value::list())?;
        }
        Ok(())
    }
}

impl RequestHandler for MasterHandlers {
    fn handle(&self, request: WorkerRequest) -> MasterResult<Value> {
        debug!("Worker request: {}", request.action());
        match request {
            WorkerRequest::ReqDevice { name } => self.devices.request(&name),
            WorkerRequest::ReqParameter { name } => self.parameters.request(&name),
            WorkerRequest::SetParameter { name, value } => {
                self.parameters.set(&name, value)?;
                Ok(Value::None)
            }
            WorkerRequest::InitRtResults { description } => {
                self.init_rt_results(&description)?;
                Ok(Value::None)
            }
            WorkerRequest::UpdateRtResults { modification } => {
                lock(&self.rt_results).replay(modification)?;
                Ok(Value::None)
            }
            WorkerRequest::ReportCompleted { .. } => Err(MasterError::Protocol(
                "completion report is not a request".to_string(),
            )),
        }
    }
}
