//! The worker subprocess: runs experiments on request from the master.

use std::sync::Arc;

use tracing::{error, info};

use super::link::ParentLink;
use crate::db::{realtime_names, DbHub, ResultDb};
use crate::error::MasterResult;
use crate::experiment::ExperimentRegistry;
use crate::instrument::DeviceRegistry;
use crate::messages::RunParams;

/// Serves run requests until the master closes the pipe.
pub struct WorkerHost {
    experiments: Arc<ExperimentRegistry>,
    devices: Arc<DeviceRegistry>,
}

impl Default for WorkerHost {
    fn default() -> Self {
        Self::new(ExperimentRegistry::new(), DeviceRegistry::new())
    }
}

impl WorkerHost {
    /// Host serving the given experiments and drivers.
    pub fn new(experiments: ExperimentRegistry, devices: DeviceRegistry) -> Self {
        Self {
            experiments: Arc::new(experiments),
            devices: Arc::new(devices),
        }
    }

    /// Runs requests one at a time. Returns `Ok` on a clean end of input;
    /// a broken pipe ends the loop with an error.
    pub async fn serve(&self, mut link: ParentLink) -> MasterResult<()> {
        while let Some(params) = link.next_run().await? {
            link.ack().await?;
            link = self.run_one(link, params).await?;
        }
        info!("Master closed the pipe, worker exiting");
        Ok(())
    }

    /// Executes one run and sends exactly one completion report.
    async fn run_one(&self, mut link: ParentLink, params: RunParams) -> MasterResult<ParentLink> {
        info!("Running '{}'", params.experiment);

        let mut experiment = match self
            .experiments
            .create(&params.experiment, &params.arguments)
        {
            Ok(experiment) => experiment,
            Err(e) => {
                link.report_completed(&Err(e.into())).await?;
                return Ok(link);
            }
        };

        let description = experiment.realtime_results();
        let names = match realtime_names(&description) {
            Ok(names) => names,
            Err(e) => {
                link.report_completed(&Err(e.into())).await?;
                return Ok(link);
            }
        };
        if let Err(e) = link.init_rt_results(description).await {
            link.report_completed(&Err(e.into())).await?;
            return Ok(link);
        }

        let mut hub = DbHub::new(link, self.devices.clone(), ResultDb::new(names));
        let outcome = experiment.run(&mut hub).await;
        if let Err(e) = &outcome {
            error!("'{}' failed: {:#}", params.experiment, e);
        }
        let reported = hub.link().report_completed(&outcome).await;
        let link = hub.close().await;
        reported?;
        Ok(link)
    }
}
