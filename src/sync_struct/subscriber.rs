//! Replication client.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{Mirror, Mod, PREAMBLE};
use crate::error::{MasterError, MasterResult};
use crate::protocol::{ObjectChannel, Value};

type Builder<T> = Box<dyn Fn(Value) -> T + Send + Sync>;

/// Callback run after every applied replication message.
pub type NotifyCallback<T> = Box<dyn Fn(&T) + Send + Sync>;

/// Keeps a local mirror of a published notifier.
pub struct Subscriber<T: Mirror> {
    mirror: Arc<Mutex<Option<T>>>,
    version: watch::Receiver<u64>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
    writer: Option<OwnedWriteHalf>,
}

impl Subscriber<Value> {
    /// Connects and mirrors the raw [`Value`].
    pub async fn connect_value<A: ToSocketAddrs>(addr: A) -> MasterResult<Self> {
        Self::connect(addr, |v| v, None).await
    }
}

impl<T: Mirror> Subscriber<T> {
    /// Connects to a publisher, sends the preamble and starts applying
    /// events. `builder` turns every snapshot into the mirror; `notify`
    /// runs after each applied message.
    pub async fn connect<A, F>(
        addr: A,
        builder: F,
        notify: Option<NotifyCallback<T>>,
    ) -> MasterResult<Self>
    where
        A: ToSocketAddrs,
        F: Fn(Value) -> T + Send + Sync + 'static,
    {
        let stream = TcpStream::connect(addr).await?;
        let (read, mut writer) = stream.into_split();
        writer.write_all(PREAMBLE).await?;

        let mirror = Arc::new(Mutex::new(None));
        let (version_tx, version) = watch::channel(0u64);
        let cancel = CancellationToken::new();

        let channel = ObjectChannel::new(read, tokio::io::sink());
        let task = tokio::spawn(receive_task(
            channel,
            Box::new(builder),
            notify,
            mirror.clone(),
            version_tx,
            cancel.clone(),
        ));

        Ok(Self {
            mirror,
            version,
            cancel,
            task: Some(task),
            writer: Some(writer),
        })
    }

    /// Runs `f` against the current mirror (`None` before the snapshot).
    pub fn read<R>(&self, f: impl FnOnce(Option<&T>) -> R) -> R {
        let guard = self.mirror.lock().unwrap_or_else(PoisonError::into_inner);
        f(guard.as_ref())
    }

    /// Waits until the mirror satisfies `predicate`.
    ///
    /// Fails if the stream ends before that happens.
    pub async fn wait_until(&self, predicate: impl Fn(&T) -> bool) -> MasterResult<()> {
        let mut version = self.version.clone();
        loop {
            if self.read(|m| m.is_some_and(&predicate)) {
                return Ok(());
            }
            if version.changed().await.is_err() {
                return Err(MasterError::Protocol(
                    "replication stream closed".to_string(),
                ));
            }
        }
    }

    /// Stops the read task, waits for it, then releases the connection.
    pub async fn close(mut self) -> MasterResult<()> {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("Subscriber task ended abnormally: {}", e);
            }
        }
        if let Some(mut writer) = self.writer.take() {
            let _ = writer.shutdown().await;
        }
        Ok(())
    }
}

impl<T: Mirror> Drop for Subscriber<T> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn receive_task<T, R>(
    mut channel: ObjectChannel<R, tokio::io::Sink>,
    builder: Builder<T>,
    notify: Option<NotifyCallback<T>>,
    mirror: Arc<Mutex<Option<T>>>,
    version: watch::Sender<u64>,
    cancel: CancellationToken,
) where
    T: Mirror,
    R: tokio::io::AsyncRead + Unpin,
{
    let received = async {
        while let Some(m) = channel.recv::<Mod>().await? {
            {
                let mut guard = mirror.lock().unwrap_or_else(PoisonError::into_inner);
                if let Mod::Init { structure } = m {
                    *guard = Some(builder(structure));
                } else {
                    match guard.as_mut() {
                        Some(target) => target.apply_mod(&m)?,
                        None => {
                            return Err(MasterError::Protocol(
                                "event received before snapshot".to_string(),
                            ))
                        }
                    }
                }
                if let (Some(callback), Some(target)) = (&notify, guard.as_ref()) {
                    callback(target);
                }
            }
            version.send_modify(|v| *v += 1);
        }
        Ok::<(), MasterError>(())
    };

    tokio::select! {
        _ = cancel.cancelled() => debug!("Subscriber cancelled"),
        result = received => match result {
            Ok(()) => debug!("Replication stream ended"),
            Err(e) => warn!("Replication stream failed: {}", e),
        },
    }
}
