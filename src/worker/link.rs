//! Worker side of the pipe to the master.

use tokio::io::{AsyncRead, AsyncWrite};

use super::messages::{WorkerRequest, ACK};
use crate::error::{MasterError, MasterResult};
use crate::messages::RunParams;
use crate::protocol::{ObjectChannel, Reply, Value};
use crate::sync_struct::Mod;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Blocking request/reply calls into the master.
///
/// Failed lookups come back as [`MasterError::Lookup`], every other rejection
/// as [`MasterError::ParentAction`]. A broken pipe surfaces as `Io` or
/// `Protocol`.
pub struct ParentLink {
    channel: ObjectChannel<BoxedReader, BoxedWriter>,
}

impl ParentLink {
    /// Link over an arbitrary reader/writer pair.
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            channel: ObjectChannel::new(Box::new(reader), Box::new(writer)),
        }
    }

    /// Link over the process's stdin and stdout.
    ///
    /// On unix the pipe to the master is moved to a private descriptor and
    /// fd 1 is pointed at stderr, so anything an experiment prints ends up
    /// in the worker's log instead of on the protocol stream. Call this once,
    /// before any experiment runs.
    pub fn stdio() -> MasterResult<Self> {
        Ok(Self::new(tokio::io::stdin(), protocol_stdout()?))
    }

    /// Waits for the next run request. `None` once the master closed the
    /// pipe.
    pub async fn next_run(&mut self) -> MasterResult<Option<RunParams>> {
        self.channel.recv().await
    }

    /// Accepts the run request just received.
    pub async fn ack(&mut self) -> MasterResult<()> {
        self.channel.send(ACK).await
    }

    /// Device description of `name`.
    pub async fn request_device(&mut self, name: &str) -> MasterResult<Value> {
        self.call(&WorkerRequest::ReqDevice {
            name: name.to_string(),
        })
        .await
        .map_err(as_lookup)
    }

    /// Parameter value of `name`.
    pub async fn request_parameter(&mut self, name: &str) -> MasterResult<Value> {
        self.call(&WorkerRequest::ReqParameter {
            name: name.to_string(),
        })
        .await
        .map_err(as_lookup)
    }

    /// Asks the master to persist a parameter.
    pub async fn set_parameter(&mut self, name: &str, value: Value) -> MasterResult<()> {
        self.call(&WorkerRequest::SetParameter {
            name: name.to_string(),
            value,
        })
        .await
        .map(|_| ())
    }

    /// Declares the realtime results of the current run.
    pub async fn init_rt_results(&mut self, description: Value) -> MasterResult<()> {
        self.call(&WorkerRequest::InitRtResults { description })
            .await
            .map(|_| ())
    }

    /// Forwards one realtime result mutation.
    pub async fn update_rt_results(&mut self, modification: Mod) -> MasterResult<()> {
        self.call(&WorkerRequest::UpdateRtResults { modification })
            .await
            .map(|_| ())
    }

    /// Sends the completion report for the current run. The master does not
    /// answer it.
    pub async fn report_completed(&mut self, outcome: &anyhow::Result<()>) -> MasterResult<()> {
        self.channel.send(&WorkerRequest::completed(outcome)).await
    }

    async fn call(&mut self, request: &WorkerRequest) -> MasterResult<Value> {
        self.channel.send(request).await?;
        match self.channel.expect::<Reply>().await? {
            Reply::Ok { data } => Ok(data),
            Reply::Error { message, .. } => Err(MasterError::ParentAction(format!(
                "{}: {}",
                request.action(),
                message
            ))),
        }
    }
}

#[cfg(unix)]
#[allow(unsafe_code)] // Plain descriptor juggling on fds this process owns
fn protocol_stdout() -> MasterResult<tokio::fs::File> {
    use std::os::fd::{FromRawFd, OwnedFd};

    // Flush anything buffered for the old fd 1 first.
    std::io::Write::flush(&mut std::io::stdout())?;
    let fd = unsafe { libc::dup(libc::STDOUT_FILENO) };
    if fd < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    // SAFETY: `fd` was just returned by dup and is owned by nobody else.
    let pipe = unsafe { OwnedFd::from_raw_fd(fd) };
    if unsafe { libc::dup2(libc::STDERR_FILENO, libc::STDOUT_FILENO) } < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(tokio::fs::File::from_std(std::fs::File::from(pipe)))
}

#[cfg(not(unix))]
fn protocol_stdout() -> MasterResult<tokio::io::Stdout> {
    Ok(tokio::io::stdout())
}

fn as_lookup(err: MasterError) -> MasterError {
    match err {
        MasterError::ParentAction(message) => MasterError::Lookup(message),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rejections_are_classified() {
        let (worker_end, master_end) = tokio::io::duplex(4096);
        let (r, w) = tokio::io::split(worker_end);
        let mut link = ParentLink::new(r, w);

        let master = tokio::spawn(async move {
            let (r, w) = tokio::io::split(master_end);
            let mut channel = ObjectChannel::new(r, w);
            for _ in 0..2 {
                let _: WorkerRequest = channel.expect().await.unwrap();
                channel
                    .send(&Reply::error("nope"))
                    .await
                    .unwrap();
            }
        });

        assert!(matches!(
            link.request_device("ttl").await,
            Err(MasterError::Lookup(_))
        ));
        assert!(matches!(
            link.set_parameter("p", Value::Int(1)).await,
            Err(MasterError::ParentAction(_))
        ));
        master.await.unwrap();
    }
}
