//! Replication server.
//!
//! Each accepted connection runs in its own task with its own unbounded
//! queue, so a slow subscriber never blocks the notifier or the other
//! subscribers. Connection errors (bad preamble, reset, write failure) end
//! only that connection.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::notifier::{lock, ModSink, SharedNotifier};
use super::{Mod, PREAMBLE};
use crate::error::MasterResult;
use crate::protocol::ObjectChannel;

type Line = Arc<[u8]>;

/// Per-connection delivery queues.
#[derive(Default)]
struct Recipients {
    next_id: AtomicU64,
    queues: Mutex<HashMap<u64, mpsc::UnboundedSender<Line>>>,
}

impl Recipients {
    fn register(&self) -> (u64, mpsc::UnboundedReceiver<Line>) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        self.queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, tx);
        (id, rx)
    }

    fn unregister(&self, id: u64) {
        self.queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }

    fn len(&self) -> usize {
        self.queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl ModSink for Recipients {
    fn publish(&self, m: &Mod) {
        let line: Line = match serde_json::to_string(m) {
            Ok(mut text) => {
                text.push('\n');
                Arc::from(text.into_bytes())
            }
            Err(e) => {
                warn!("Dropping unencodable replication event: {}", e);
                return;
            }
        };
        self.queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|_, queue| queue.send(line.clone()).is_ok());
    }
}

/// Removes a recipient when its connection task ends, however it ends.
struct Registration<'a> {
    recipients: &'a Recipients,
    id: u64,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.recipients.unregister(self.id);
    }
}

/// Serves one notifier to any number of subscribers.
pub struct Publisher {
    notifier: SharedNotifier,
    recipients: Arc<Recipients>,
    cancel: CancellationToken,
    server: Option<JoinHandle<()>>,
}

impl Publisher {
    /// Attaches a new publisher to `notifier`. Mutations are forwarded from
    /// now on, even before [`Publisher::start`] is called.
    pub fn new(notifier: SharedNotifier) -> Self {
        let recipients = Arc::new(Recipients::default());
        lock(&notifier).set_sink(recipients.clone());
        Self {
            notifier,
            recipients,
            cancel: CancellationToken::new(),
            server: None,
        }
    }

    /// Binds the listener and starts accepting subscribers.
    pub async fn start<A: ToSocketAddrs>(&mut self, addr: A) -> MasterResult<SocketAddr> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        info!("Publisher listening on {}", local);

        let notifier = self.notifier.clone();
        let recipients = self.recipients.clone();
        let cancel = self.cancel.clone();
        self.server = Some(tokio::spawn(accept_loop(
            listener, notifier, recipients, cancel,
        )));
        Ok(local)
    }

    /// Number of subscribers currently registered.
    pub fn recipient_count(&self) -> usize {
        self.recipients.len()
    }

    /// Stops accepting, closes every connection and waits for all of them.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(server) = self.server.take() {
            if let Err(e) = server.await {
                warn!("Publisher task ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn accept_loop(
    listener: TcpListener,
    notifier: SharedNotifier,
    recipients: Arc<Recipients>,
    cancel: CancellationToken,
) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!("Replication connection from {}", peer);
                    connections.spawn(handle_connection(
                        stream,
                        notifier.clone(),
                        recipients.clone(),
                        cancel.child_token(),
                    ));
                }
                Err(e) => warn!("Failed to accept replication connection: {}", e),
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
    while connections.join_next().await.is_some() {}
}

async fn handle_connection(
    stream: TcpStream,
    notifier: SharedNotifier,
    recipients: Arc<Recipients>,
    cancel: CancellationToken,
) {
    let peer = stream.peer_addr().ok();
    let (read, write) = stream.into_split();
    let mut channel = ObjectChannel::new(read, write);

    let result = tokio::select! {
        _ = cancel.cancelled() => Ok(()),
        result = serve_connection(&mut channel, &notifier, &recipients) => result,
    };
    if let Err(e) = result {
        // Subscribers going away is routine.
        debug!("Replication connection {:?} closed: {}", peer, e);
    }
    let _ = channel.shutdown().await;
}

async fn serve_connection<R, W>(
    channel: &mut ObjectChannel<R, W>,
    notifier: &SharedNotifier,
    recipients: &Recipients,
) -> MasterResult<()>
where
    R: tokio::io::AsyncRead + Unpin,
    W: tokio::io::AsyncWrite + Unpin,
{
    let preamble = channel.recv_raw_line(PREAMBLE.len()).await?;
    if preamble != PREAMBLE {
        debug!("Closing replication connection with bad preamble");
        return Ok(());
    }

    // Snapshot and registration form one step: both happen under the
    // notifier lock, and every publish runs with that lock held, so no
    // event can land in both or in neither. No await between the two.
    let (snapshot, mut queue, id) = {
        let guard = lock(notifier);
        let snapshot = Mod::Init {
            structure: guard.read().clone(),
        };
        let (id, queue) = recipients.register();
        (snapshot, queue, id)
    };
    let _registration = Registration { recipients, id };

    channel.send(&snapshot).await?;
    while let Some(line) = queue.recv().await {
        channel.send_line(&line).await?;
    }
    Ok(())
}
