//! Control port: run submission and cancellation over TCP.
//!
//! Each line sent by a client is one [`ControlRequest`]; each is answered
//! with one [`Reply`] line. An undecodable request is answered with an error
//! and the connection is closed.

use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{MasterError, MasterResult};
use crate::messages::{ControlRequest, RunParams};
use crate::protocol::{ObjectChannel, Reply, Value};
use crate::scheduler::SchedulerHandle;

/// Applies a control request to the scheduler.
pub fn dispatch(scheduler: &SchedulerHandle, request: ControlRequest) -> MasterResult<Value> {
    match request {
        ControlRequest::SubmitQueued {
            run_params,
            timeout,
        } => scheduler.submit_queued(run_params, timeout).map(Value::from),
        ControlRequest::SubmitTimed {
            run_params,
            timeout,
            next_run,
        } => scheduler
            .submit_timed(run_params, timeout, next_run)
            .map(Value::from),
        ControlRequest::CancelQueued { rid } => scheduler.cancel_queued(rid).map(|()| Value::None),
        ControlRequest::CancelTimed { trid } => scheduler.cancel_timed(trid).map(|()| Value::None),
    }
}

/// Accepts control clients.
pub struct ControlServer {
    scheduler: SchedulerHandle,
    cancel: CancellationToken,
    server: Option<JoinHandle<()>>,
}

impl ControlServer {
    /// Server for `scheduler`; nothing is bound until [`ControlServer::start`].
    pub fn new(scheduler: SchedulerHandle) -> Self {
        Self {
            scheduler,
            cancel: CancellationToken::new(),
            server: None,
        }
    }

    /// Binds `addr` and starts accepting clients. Returns the bound address,
    /// which differs from `addr` when port 0 was requested.
    pub async fn start<A: ToSocketAddrs>(&mut self, addr: A) -> MasterResult<SocketAddr> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        info!("Control server listening on {}", local);
        self.server = Some(tokio::spawn(accept_loop(
            listener,
            self.scheduler.clone(),
            self.cancel.clone(),
        )));
        Ok(local)
    }

    /// Stops accepting and closes every open connection.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(server) = self.server.take() {
            if let Err(e) = server.await {
                warn!("Control server task ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn accept_loop(listener: TcpListener, scheduler: SchedulerHandle, cancel: CancellationToken) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!("Control connection from {}", peer);
                    connections.spawn(handle_connection(stream, scheduler.clone(), cancel.child_token()));
                }
                Err(e) => warn!("Failed to accept control connection: {}", e),
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
    while connections.join_next().await.is_some() {}
}

async fn handle_connection(stream: TcpStream, scheduler: SchedulerHandle, cancel: CancellationToken) {
    let (read, write) = stream.into_split();
    let mut channel = ObjectChannel::new(read, write);
    let result = tokio::select! {
        _ = cancel.cancelled() => Ok(()),
        result = serve_connection(&mut channel, &scheduler) => result,
    };
    if let Err(e) = result {
        debug!("Control connection closed: {}", e);
    }
    let _ = channel.shutdown().await;
}

async fn serve_connection(
    channel: &mut ObjectChannel<OwnedReadHalf, OwnedWriteHalf>,
    scheduler: &SchedulerHandle,
) -> MasterResult<()> {
    loop {
        let request = match channel.recv::<ControlRequest>().await {
            Ok(Some(request)) => request,
            Ok(None) => return Ok(()),
            Err(e) => {
                channel
                    .send(&Reply::error(e.to_string()))
                    .await?;
                return Err(e);
            }
        };
        let reply = Reply::from_result(dispatch(scheduler, request));
        channel.send(&reply).await?;
    }
}

/// Client for the control port.
pub struct ControlClient {
    channel: ObjectChannel<OwnedReadHalf, OwnedWriteHalf>,
}

impl ControlClient {
    /// Connects to a control server.
    pub async fn connect<A: ToSocketAddrs>(addr: A) -> MasterResult<Self> {
        let stream = TcpStream::connect(addr).await?;
        let (read, write) = stream.into_split();
        Ok(Self {
            channel: ObjectChannel::new(read, write),
        })
    }

    /// Sends one request and waits for its reply.
    ///
    /// Error replies are mapped back to the error the server raised for
    /// lookups and cancellations; any other rejection is
    /// [`MasterError::ParentAction`].
    pub async fn call(&mut self, request: &ControlRequest) -> MasterResult<Value> {
        self.channel.send(request).await?;
        match self.channel.expect::<Reply>().await? {
            Reply::Ok { data } => Ok(data),
            Reply::Error { message, kind } => Err(kind.into_error(message)),
        }
    }

    /// Queues a run and returns its `rid`.
    pub async fn submit_queued(&mut self, run_params: RunParams, timeout: Option<f64>) -> MasterResult<u64> {
        let data = self
            .call(&ControlRequest::submit_queued(run_params, timeout))
            .await?;
        as_id(&data)
    }

    /// Schedules a timed run and returns its `trid`.
    pub async fn submit_timed(
        &mut self,
        run_params: RunParams,
        timeout: Option<f64>,
        next_run: Option<f64>,
    ) -> MasterResult<u64> {
        let data = self
            .call(&ControlRequest::submit_timed(run_params, timeout, next_run))
            .await?;
        as_id(&data)
    }

    /// Removes a queued run. Fails with [`MasterError::Cancellation`] if it is
    /// the run currently executing.
    pub async fn cancel_queued(&mut self, rid: u64) -> MasterResult<()> {
        self.call(&ControlRequest::CancelQueued { rid }).await.map(|_| ())
    }

    /// Removes a timed run.
    pub async fn cancel_timed(&mut self, trid: u64) -> MasterResult<()> {
        self.call(&ControlRequest::CancelTimed { trid }).await.map(|_| ())
    }
}

fn as_id(data: &Value) -> MasterResult<u64> {
    data.as_i64()
        .and_then(|id| u64::try_from(id).ok())
        .ok_or_else(|| MasterError::Protocol(format!("expected an id, got {data}")))
}
