//! Master side of the worker: spawns the subprocess and drives one run at a
//! time through its pipe.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, info, warn};

use super::handlers::RequestHandler;
use super::messages::{CompletionStatus, WorkerRequest, ACK};
use crate::config::WorkerConfig;
use crate::error::{MasterError, MasterResult};
use crate::messages::RunParams;
use crate::protocol::{ObjectChannel, Reply, Value};
use crate::scheduler::RunExecutor;

/// Drives one run over an established pipe: request, ack, then answer
/// worker RPCs until the completion report arrives.
///
/// End of stream at any point is a [`MasterError::Process`] error; a failed
/// report is a [`MasterError::UnitExecution`] error carrying the worker's
/// error text.
pub async fn run_exchange<R, W>(
    channel: &mut ObjectChannel<R, W>,
    params: &RunParams,
    handler: &dyn RequestHandler,
) -> MasterResult<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    channel.send(params).await?;
    let ack: Value = channel.recv().await?.ok_or_else(worker_exited)?;
    if ack.as_str() != Some(ACK) {
        return Err(MasterError::Protocol(format!(
            "expected acknowledgement from worker, got {ack}"
        )));
    }

    loop {
        let request: WorkerRequest = channel.recv().await?.ok_or_else(worker_exited)?;
        match request {
            WorkerRequest::ReportCompleted {
                status: CompletionStatus::Ok,
                ..
            } => return Ok(()),
            WorkerRequest::ReportCompleted {
                status: CompletionStatus::Failed,
                message,
            } => {
                return Err(MasterError::UnitExecution(
                    message.unwrap_or_else(|| "no error text".to_string()),
                ))
            }
            request => {
                let reply = Reply::from_result(handler.handle(request));
                channel.send(&reply).await?;
            }
        }
    }
}

fn worker_exited() -> MasterError {
    MasterError::Process("worker exited unexpectedly".to_string())
}

struct WorkerProcess {
    child: Child,
    channel: ObjectChannel<ChildStdout, ChildStdin>,
    /// Set while a run exchange is underway; a process dropped in this state
    /// is out of sync with its pipe.
    in_flight: bool,
}

/// Owns the worker subprocess.
///
/// The process is started on the first run and kept across runs. It is
/// killed (and replaced on the next run) after a timeout, a crash or any
/// protocol failure; an experiment failure leaves it running.
pub struct Worker {
    program: PathBuf,
    args: Vec<String>,
    handler: Arc<dyn RequestHandler>,
    shutdown_timeout: Duration,
    process: Option<WorkerProcess>,
}

impl Worker {
    /// Worker that starts `program args` on demand and answers its requests
    /// with `handler`.
    pub fn new(
        program: PathBuf,
        args: Vec<String>,
        handler: Arc<dyn RequestHandler>,
        shutdown_timeout: Duration,
    ) -> Self {
        Self {
            program,
            args,
            handler,
            shutdown_timeout,
            process: None,
        }
    }

    /// Worker from configuration; runs the current executable when no
    /// program is configured.
    pub fn from_config(config: &WorkerConfig, handler: Arc<dyn RequestHandler>) -> MasterResult<Self> {
        let program = match &config.program {
            Some(program) => program.clone(),
            None => std::env::current_exe()?,
        };
        Ok(Self::new(
            program,
            config.args.clone(),
            handler,
            config.shutdown_timeout(),
        ))
    }

    /// True while a subprocess is alive.
    pub fn is_running(&self) -> bool {
        self.process.is_some()
    }

    /// Starts the subprocess unless one is already running.
    pub fn create_process(&mut self) -> MasterResult<()> {
        if self.process.is_some() {
            return Ok(());
        }
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                MasterError::Process(format!("failed to start {}: {}", self.program.display(), e))
            })?;
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(MasterError::Process("worker pipes unavailable".to_string()));
        };
        info!("Started worker process (pid {:?})", child.id());
        self.process = Some(WorkerProcess {
            child,
            channel: ObjectChannel::new(stdout, stdin),
            in_flight: false,
        });
        Ok(())
    }

    /// Executes one run, bounded by `timeout` when given.
    pub async fn run(&mut self, params: &RunParams, timeout: Option<Duration>) -> MasterResult<()> {
        if self.process.as_ref().is_some_and(|p| p.in_flight) {
            warn!("Worker was abandoned in the middle of a run, replacing it");
            self.kill_process().await;
        }
        self.create_process()?;
        let Some(process) = self.process.as_mut() else {
            return Err(MasterError::Process("worker not started".to_string()));
        };

        process.in_flight = true;
        let exchange = run_exchange(&mut process.channel, params, self.handler.as_ref());
        let outcome = match timeout {
            Some(limit) => tokio::time::timeout(limit, exchange)
                .await
                .unwrap_or_else(|_| {
                    Err(MasterError::Process(format!(
                        "run exceeded its timeout of {limit:?}"
                    )))
                }),
            None => exchange.await,
        };
        process.in_flight = false;

        let outcome = outcome.map_err(|e| match e {
            MasterError::Io(io) => MasterError::Process(format!("worker pipe failed: {io}")),
            other => other,
        });
        if let Err(e) = &outcome {
            if !matches!(e, MasterError::UnitExecution(_)) {
                warn!("Terminating worker: {}", e);
                self.kill_process().await;
            }
        }
        outcome
    }

    async fn kill_process(&mut self) {
        let Some(mut process) = self.process.take() else {
            return;
        };
        if let Err(e) = process.child.start_kill() {
            debug!("Worker already gone: {}", e);
        }
        match process.child.wait().await {
            Ok(status) => info!("Worker process exited ({})", status),
            Err(e) => warn!("Failed to reap worker process: {}", e),
        }
    }

    /// Closes the worker's stdin and waits for it to exit, killing it after
    /// the shutdown grace period.
    pub async fn end_process(&mut self) {
        let Some(process) = self.process.take() else {
            return;
        };
        if process.in_flight {
            self.process = Some(process);
            self.kill_process().await;
            return;
        }

        let WorkerProcess { mut child, channel, .. } = process;
        let (_stdout, stdin) = channel.into_inner();
        drop(stdin);
        match tokio::time::timeout(self.shutdown_timeout, child.wait()).await {
            Ok(Ok(status)) => info!("Worker process exited ({})", status),
            Ok(Err(e)) => warn!("Failed to wait for worker process: {}", e),
            Err(_) => {
                warn!(
                    "Worker did not exit within {:?}, killing it",
                    self.shutdown_timeout
                );
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill worker process: {}", e);
                }
            }
        }
    }
}

#[async_trait]
impl RunExecutor for Worker {
    async fn run(&mut self, params: &RunParams, timeout: Option<Duration>) -> MasterResult<()> {
        Worker::run(self, params, timeout).await
    }

    async fn shutdown(&mut self) {
        self.end_process().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::FlatFileDb;
    use crate::sync_struct::{lock, Notifier};
    use crate::worker::handlers::MasterHandlers;
    use crate::worker::host::WorkerHost;
    use crate::worker::link::ParentLink;

    fn device_db() -> Value {
        Value::from_pairs([
            (
                "dds",
                Value::from_pairs([
                    ("driver", Value::from("mock_dds")),
                    (
                        "arguments",
                        Value::from_pairs([
                            ("center_frequency", Value::Float(2.0)),
                            ("linewidth", Value::Float(1.0)),
                        ]),
                    ),
                ]),
            ),
            ("ttl_out", Value::from_pairs([("driver", Value::from("mock_ttl"))])),
            ("ttl", Value::from("ttl_out")),
        ])
    }

    /// Connects a [`WorkerHost`] task to a master channel in memory.
    fn in_process_worker() -> (
        ObjectChannel<tokio::io::ReadHalf<tokio::io::DuplexStream>, tokio::io::WriteHalf<tokio::io::DuplexStream>>,
        tokio::task::JoinHandle<MasterResult<()>>,
    ) {
        let (worker_end, master_end) = tokio::io::duplex(64 * 1024);
        let (r, w) = tokio::io::split(worker_end);
        let worker = tokio::spawn(async move { WorkerHost::default().serve(ParentLink::new(r, w)).await });
        let (r, w) = tokio::io::split(master_end);
        (ObjectChannel::new(r, w), worker)
    }

    #[tokio::test]
    async fn test_flopping_run_in_process() {
        let parameters = Arc::new(FlatFileDb::in_memory(Value::dict()));
        let rt = Notifier::shared(Value::dict());
        let handlers = MasterHandlers::new(
            Arc::new(FlatFileDb::in_memory(device_db())),
            parameters.clone(),
            rt.clone(),
        );
        let (mut channel, worker) = in_process_worker();

        let params = RunParams::new("flopping").with_arguments(Value::from_pairs([
            ("npoints", Value::Int(5)),
            ("start", Value::Float(0.0)),
            ("stop", Value::Float(4.0)),
        ]));
        run_exchange(&mut channel, &params, &handlers).await.unwrap();

        let rt = lock(&rt).read().clone();
        let frequencies = rt.get("frequency").and_then(Value::as_list).unwrap();
        let brightness = rt.get("brightness").and_then(Value::as_list).unwrap();
        assert_eq!(frequencies.len(), 5);
        assert_eq!(brightness.len(), 5);
        assert_eq!(brightness[2], Value::Float(1.0));
        assert_eq!(
            parameters.request("flopping_peak").unwrap(),
            Value::Float(2.0)
        );

        drop(channel);
        worker.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_failure_carries_error_text() {
        let handlers = MasterHandlers::new(
            Arc::new(FlatFileDb::in_memory(Value::dict())),
            Arc::new(FlatFileDb::in_memory(Value::dict())),
            Notifier::shared(Value::dict()),
        );
        let (mut channel, worker) = in_process_worker();

        let params = RunParams::new("fail")
            .with_arguments(Value::from_pairs([("message", Value::from("laser unlocked"))]));
        match run_exchange(&mut channel, &params, &handlers).await {
            Err(MasterError::UnitExecution(text)) => assert!(text.contains("laser unlocked")),
            other => panic!("unexpected outcome: {:?}", other),
        }

        // Missing devices fail the run, not the worker.
        let params = RunParams::new("flopping");
        assert!(matches!(
            run_exchange(&mut channel, &params, &handlers).await,
            Err(MasterError::UnitExecution(_))
        ));
        run_exchange(&mut channel, &RunParams::new("noop"), &handlers)
            .await
            .unwrap();

        drop(channel);
        worker.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_closed_pipe_is_process_error() {
        let handlers = MasterHandlers::new(
            Arc::new(FlatFileDb::in_memory(Value::dict())),
            Arc::new(FlatFileDb::in_memory(Value::dict())),
            Notifier::shared(Value::dict()),
        );
        let (worker_end, master_end) = tokio::io::duplex(1024);
        let (r, w) = tokio::io::split(master_end);
        let mut channel = ObjectChannel::new(r, w);
        // A peer that reads the request and then goes away.
        let peer = tokio::spawn(async move {
            let (r, w) = tokio::io::split(worker_end);
            let mut peer = ObjectChannel::new(r, w);
            let _: RunParams = peer.expect().await.unwrap();
        });

        let result = run_exchange(&mut channel, &RunParams::new("noop"), &handlers).await;
        peer.await.unwrap();
        assert!(matches!(result, Err(MasterError::Process(_))));
    }

    #[tokio::test]
    async fn test_missing_program_is_process_error() {
        let handlers: Arc<dyn RequestHandler> = Arc::new(MasterHandlers::new(
            Arc::new(FlatFileDb::in_memory(Value::dict())),
            Arc::new(FlatFileDb::in_memory(Value::dict())),
            Notifier::shared(Value::dict()),
        ));
        let mut worker = Worker::new(
            PathBuf::from("/nonexistent/daq_master_worker"),
            Vec::new(),
            handlers,
            Duration::from_millis(100),
        );
        assert!(matches!(
            worker.run(&RunParams::new("noop"), None).await,
            Err(MasterError::Process(_))
        ));
        assert!(!worker.is_running());
        worker.end_process().await;
    }
}
