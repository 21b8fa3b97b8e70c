//! Per-run broker between an experiment and the master.

use std::sync::Arc;

use tracing::{debug, warn};

use super::result_db::ResultDb;
use crate::error::{MasterError, MasterResult};
use crate::instrument::{Device, DeviceRegistry};
use crate::protocol::Value;
use crate::worker::link::ParentLink;

/// Longest alias chain followed before giving up.
const MAX_ALIAS_DEPTH: usize = 16;

/// Gives an experiment its devices, parameters and results.
///
/// Devices are opened on first request and cached by name for the rest of
/// the run; [`DbHub::close`] shuts them down in reverse order of creation.
/// Realtime result changes are forwarded to the master before the call that
/// made them returns.
pub struct DbHub {
    link: ParentLink,
    registry: Arc<DeviceRegistry>,
    devices: Vec<(String, Box<dyn Device>)>,
    results: ResultDb,
}

impl DbHub {
    /// Hub for one run. Devices are opened lazily through `registry`.
    pub fn new(link: ParentLink, registry: Arc<DeviceRegistry>, results: ResultDb) -> Self {
        Self {
            link,
            registry,
            devices: Vec::new(),
            results,
        }
    }

    /// Returns the device called `name`, opening it on first use.
    ///
    /// A description that is a plain string names another entry; the chain
    /// is followed until a real description is found.
    pub async fn get_device(&mut self, name: &str) -> MasterResult<&mut dyn Device> {
        let index = match self.devices.iter().position(|(n, _)| n == name) {
            Some(index) => index,
            None => self.open_device(name).await?,
        };
        Ok(self.devices[index].1.as_mut())
    }

    async fn open_device(&mut self, name: &str) -> MasterResult<usize> {
        let mut description = self.link.request_device(name).await?;
        let mut depth = 0;
        while let Value::Str(target) = &description {
            depth += 1;
            if depth > MAX_ALIAS_DEPTH {
                return Err(MasterError::Lookup(format!(
                    "alias chain for device '{name}' is too long"
                )));
            }
            let target = target.clone();
            debug!("Device '{}' resolves through alias '{}'", name, target);
            description = self.link.request_device(&target).await?;
        }

        let mut device = self.registry.create(name, &description)?;
        device
            .initialize()
            .await
            .map_err(|e| MasterError::Device(format!("{name}: {e:#}")))?;
        self.devices.push((name.to_string(), device));
        Ok(self.devices.len() - 1)
    }

    /// Current value of parameter `name`, as stored by the master.
    pub async fn get_parameter(&mut self, name: &str) -> MasterResult<Value> {
        self.link.request_parameter(name).await
    }

    /// Persists parameter `name` in the master's parameter database.
    pub async fn set_parameter(&mut self, name: &str, value: Value) -> MasterResult<()> {
        self.link.set_parameter(name, value).await
    }

    /// See [`ResultDb::get`].
    pub fn get_result(&mut self, name: &str) -> MasterResult<Value> {
        self.results.get(name)
    }

    /// Sets a result. Realtime results reach the master before this returns.
    pub async fn set_result(&mut self, name: &str, value: Value) -> MasterResult<()> {
        self.results.set(name, value)?;
        self.flush_results().await
    }

    /// Appends `x` to the sequence result `name`.
    pub async fn append_result(&mut self, name: &str, x: Value) -> MasterResult<()> {
        self.results.append(name, x)?;
        self.flush_results().await
    }

    /// Results recorded so far.
    pub fn results(&self) -> &ResultDb {
        &self.results
    }

    pub(crate) fn link(&mut self) -> &mut ParentLink {
        &mut self.link
    }

    async fn flush_results(&mut self) -> MasterResult<()> {
        for m in self.results.take_pending() {
            self.link.update_rt_results(m).await?;
        }
        Ok(())
    }

    /// Shuts every open device down, newest first, and hands the link back.
    /// Shutdown failures are logged and do not stop the others.
    pub async fn close(mut self) -> ParentLink {
        while let Some((name, mut device)) = self.devices.pop() {
            if let Err(e) = device.shutdown().await {
                warn!("Failed to close device '{}': {:#}", name, e);
            }
        }
        self.link
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::Command;
    use crate::protocol::{ObjectChannel, Reply};
    use crate::worker::messages::WorkerRequest;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tokio::io::{DuplexStream, ReadHalf, WriteHalf};

    type Log = Arc<Mutex<Vec<String>>>;

    struct Recording {
        id: String,
        log: Log,
    }

    #[async_trait]
    impl Device for Recording {
        fn id(&self) -> &str {
            &self.id
        }
        async fn initialize(&mut self) -> anyhow::Result<()> {
            self.log.lock().unwrap().push(format!("open {}", self.id));
            Ok(())
        }
        async fn execute(&mut self, _cmd: Command) -> anyhow::Result<Value> {
            Ok(Value::from(self.id.as_str()))
        }
        async fn shutdown(&mut self) -> anyhow::Result<()> {
            self.log.lock().unwrap().push(format!("close {}", self.id));
            Ok(())
        }
    }

    type MasterChannel = ObjectChannel<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>;

    fn hub_with_recorder(log: Log) -> (DbHub, MasterChannel) {
        let mut registry = DeviceRegistry::empty();
        registry.register("recording", move |name, _| {
            Ok(Box::new(Recording {
                id: name.to_string(),
                log: log.clone(),
            }) as Box<dyn Device>)
        });
        let (worker_end, master_end) = tokio::io::duplex(4096);
        let (r, w) = tokio::io::split(worker_end);
        let hub = DbHub::new(
            ParentLink::new(r, w),
            Arc::new(registry),
            ResultDb::new(["counts"]),
        );
        let (r, w) = tokio::io::split(master_end);
        (hub, ObjectChannel::new(r, w))
    }

    /// Answers device requests from a fixed database.
    async fn serve_devices(mut channel: MasterChannel, ddb: Value) -> MasterChannel {
        while let Ok(Some(req)) = channel.recv::<WorkerRequest>().await {
            let reply = match req {
                WorkerRequest::ReqDevice { name } => match ddb.get(&name) {
                    Some(v) => Reply::Ok { data: v.clone() },
                    None => Reply::error(format!("'{name}' not found")),
                },
                WorkerRequest::UpdateRtResults { .. } => Reply::Ok { data: Value::None },
                other => Reply::error(format!("unexpected {}", other.action())),
            };
            if channel.send(&reply).await.is_err() {
                break;
            }
        }
        channel
    }

    fn recording() -> Value {
        Value::from_pairs([("driver", Value::from("recording"))])
    }

    #[tokio::test]
    async fn test_devices_cached_and_closed_in_reverse() {
        let log = Log::default();
        let (mut hub, channel) = hub_with_recorder(log.clone());
        let ddb = Value::from_pairs([
            ("a", recording()),
            ("b", recording()),
            ("alias", Value::from("b")),
            ("chain", Value::from("alias")),
        ]);
        let master = tokio::spawn(serve_devices(channel, ddb));

        hub.get_device("a").await.unwrap();
        hub.get_device("b").await.unwrap();
        let again = hub.get_device("a").await.unwrap();
        assert_eq!(
            again.execute(Command::Get("id".into())).await.unwrap(),
            Value::from("a")
        );
        // An alias opens its own instance under the requested name.
        hub.get_device("alias").await.unwrap();
        hub.get_device("chain").await.unwrap();

        drop(hub.close().await);
        master.await.unwrap();
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "open a",
                "open b",
                "open alias",
                "open chain",
                "close chain",
                "close alias",
                "close b",
                "close a"
            ]
        );
    }

    #[tokio::test]
    async fn test_alias_cycle_and_missing_device() {
        let (mut hub, channel) = hub_with_recorder(Log::default());
        let ddb = Value::from_pairs([("x", Value::from("y")), ("y", Value::from("x"))]);
        let master = tokio::spawn(serve_devices(channel, ddb));

        assert!(matches!(
            hub.get_device("x").await,
            Err(MasterError::Lookup(_))
        ));
        assert!(matches!(
            hub.get_device("nothing").await,
            Err(MasterError::Lookup(_))
        ));
        drop(hub.close().await);
        master.await.unwrap();
    }

    #[tokio::test]
    async fn test_realtime_results_forwarded() {
        let (mut hub, mut channel) = hub_with_recorder(Log::default());
        let master = tokio::spawn(async move {
            let req: WorkerRequest = channel.expect().await.unwrap();
            channel.send(&Reply::Ok { data: Value::None }).await.unwrap();
            req
        });

        hub.append_result("counts", Value::Int(3)).await.unwrap();
        // Ordinary results never reach the master.
        hub.set_result("fit", Value::Float(0.5)).await.unwrap();

        let forwarded = master.await.unwrap();
        assert!(matches!(forwarded, WorkerRequest::UpdateRtResults { .. }));
        assert_eq!(
            hub.results().realtime().get("counts"),
            Some(&Value::List(vec![Value::Int(3)]))
        );
    }
}
