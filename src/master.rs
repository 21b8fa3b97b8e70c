//! The master process: wires the databases, the worker, the scheduler and
//! the network services together and tears them down in order.
//!
//! ```text
//!   control clients ──► ControlServer ──► SchedulerHandle
//!                                              │
//!                      Scheduler loop ──► Worker ──► worker subprocess
//!                                              │          │ RPC
//!                                        MasterHandlers ◄─┘
//!                                         │    │    │
//!                                ddb.json  pdb.json  rt results
//!
//!   Publishers: queue, timed, rt_results, parameters
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{error, info};

use crate::config::Settings;
use crate::control::ControlServer;
use crate::db::FlatFileDb;
use crate::error::MasterResult;
use crate::messages::RunParams;
use crate::protocol::Value;
use crate::scheduler::{Scheduler, SchedulerHandle};
use crate::sync_struct::{Notifier, Publisher, SharedNotifier};
use crate::worker::{MasterHandlers, Worker};

/// Where each service ended up listening.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MasterAddresses {
    /// Control server
    pub control: SocketAddr,
    /// Queue publisher
    pub queue: SocketAddr,
    /// Timed table publisher
    pub timed: SocketAddr,
    /// Realtime results publisher
    pub rt_results: SocketAddr,
    /// Parameter database publisher
    pub parameters: SocketAddr,
}

async fn publish(notifier: SharedNotifier, addr: String) -> MasterResult<(Publisher, SocketAddr)> {
    let mut publisher = Publisher::new(notifier);
    let local = publisher.start(addr).await?;
    Ok((publisher, local))
}

/// A running master.
pub struct Master {
    scheduler: Scheduler<Worker>,
    control: ControlServer,
    publishers: Vec<Publisher>,
    parameters: Arc<FlatFileDb>,
    rt_results: SharedNotifier,
    addresses: MasterAddresses,
}

impl Master {
    /// Opens the databases, binds every listener and starts the scheduler.
    pub async fn start(settings: &Settings) -> MasterResult<Self> {
        info!("Starting {}", settings.application.name);
        let devices = Arc::new(FlatFileDb::open(&settings.databases.device_db)?);
        let parameters = Arc::new(FlatFileDb::open(&settings.databases.parameter_db)?);
        let rt_results = Notifier::shared(Value::dict());

        let handlers = Arc::new(MasterHandlers::new(
            devices,
            parameters.clone(),
            rt_results.clone(),
        ));
        let worker = Worker::from_config(&settings.worker, handlers)?;
        let mut scheduler = Scheduler::new(
            worker,
            Arc::new(|rid: u64, params: &RunParams| info!("Starting RID {} ({})", rid, params.experiment)),
        );
        let handle = scheduler.handle();

        let net = &settings.network;
        let bind = |port: u16| format!("{}:{}", net.bind, port);

        let (queue, queue_addr) = publish(handle.queue(), bind(net.queue_port)).await?;
        let (timed, timed_addr) = publish(handle.timed(), bind(net.timed_port)).await?;
        let (rt, rt_addr) = publish(rt_results.clone(), bind(net.rt_results_port)).await?;
        let (params, params_addr) =
            publish(parameters.notifier(), bind(net.parameters_port)).await?;

        let mut control = ControlServer::new(handle);
        let control_addr = control.start(bind(net.control_port)).await?;

        scheduler.start();
        let addresses = MasterAddresses {
            control: control_addr,
            queue: queue_addr,
            timed: timed_addr,
            rt_results: rt_addr,
            parameters: params_addr,
        };
        info!("Master ready: {:?}", addresses);

        Ok(Self {
            scheduler,
            control,
            publishers: vec![queue, timed, rt, params],
            parameters,
            rt_results,
            addresses,
        })
    }

    /// Bound addresses of every listener.
    pub fn addresses(&self) -> MasterAddresses {
        self.addresses
    }

    /// Handle to the scheduler, for submissions and cancellations.
    pub fn scheduler(&self) -> SchedulerHandle {
        self.scheduler.handle()
    }

    /// The parameter database.
    pub fn parameters(&self) -> Arc<FlatFileDb> {
        self.parameters.clone()
    }

    /// Realtime results of the current run, as published.
    pub fn rt_results(&self) -> SharedNotifier {
        self.rt_results.clone()
    }

    /// Serves until Ctrl-C, then shuts down.
    pub async fn run_until_signal(self) -> MasterResult<()> {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
        }
        info!("Shutdown requested");
        self.shutdown().await;
        Ok(())
    }

    /// Stops accepting requests, stops the scheduler (terminating the
    /// worker), then closes the publishers.
    pub async fn shutdown(mut self) {
        self.control.stop().await;
        self.scheduler.stop().await;
        for publisher in &mut self.publishers {
            publisher.stop().await;
        }
        info!("Master stopped");
    }
}
