//! Per-run result storage inside the worker.

use std::sync::{Arc, Mutex, PoisonError};

use crate::error::{MasterError, MasterResult};
use crate::protocol::Value;
use crate::sync_struct::{Mod, ModSink, Notifier};

/// Extracts the realtime result names from a run's description.
///
/// Description keys are either a single name or a tuple of names; values
/// are free-form (plot hints and the like) and ignored here.
pub fn realtime_names(description: &Value) -> MasterResult<Vec<String>> {
    let entries = description.as_dict().ok_or_else(|| {
        MasterError::Protocol(format!(
            "realtime results description must be a mapping, found {}",
            description.kind()
        ))
    })?;

    let mut names = Vec::new();
    for (key, _) in entries {
        match key {
            Value::Str(name) => push_unique(&mut names, name),
            Value::Tuple(items) | Value::List(items) => {
                for item in items {
                    let name = item.as_str().ok_or_else(|| {
                        MasterError::Protocol(format!("result name {item} is not a string"))
                    })?;
                    push_unique(&mut names, name);
                }
            }
            other => {
                return Err(MasterError::Protocol(format!(
                    "result key {other} is neither a name nor a tuple of names"
                )))
            }
        }
    }
    Ok(names)
}

fn push_unique(names: &mut Vec<String>, name: &str) {
    if !names.iter().any(|n| n == name) {
        names.push(name.to_string());
    }
}

/// Events waiting to be forwarded to the master.
#[derive(Default)]
struct Outbox(Mutex<Vec<Mod>>);

impl ModSink for Outbox {
    fn publish(&self, m: &Mod) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(m.clone());
    }
}

/// Realtime and ordinary results of one run.
///
/// Realtime results start as empty sequences and every change to them is
/// queued for the master ([`ResultDb::take_pending`]). Ordinary results are
/// created as empty sequences on first access and stay in the worker.
pub struct ResultDb {
    realtime: Notifier,
    outbox: Arc<Outbox>,
    ordinary: Notifier,
}

impl ResultDb {
    /// Store whose realtime results are `realtime_names`, each starting as an
    /// empty sequence.
    pub fn new<I, S>(realtime_names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let realtime = Value::Dict(
            realtime_names
                .into_iter()
                .map(|name| (Value::Str(name.into()), Value::list()))
                .collect(),
        );
        let outbox = Arc::new(Outbox::default());
        let mut realtime = Notifier::new(realtime);
        realtime.set_sink(outbox.clone());
        Self {
            realtime,
            outbox,
            ordinary: Notifier::new(Value::dict()),
        }
    }

    /// True if `name` was declared as a realtime result.
    pub fn is_realtime(&self, name: &str) -> bool {
        self.realtime.read().get(name).is_some()
    }

    /// Current value of `name`, creating an empty ordinary result if it does
    /// not exist yet.
    pub fn get(&mut self, name: &str) -> MasterResult<Value> {
        if let Some(value) = self.realtime.read().get(name) {
            return Ok(value.clone());
        }
        if self.ordinary.read().get(name).is_none() {
            self.ordinary.insert(name, Value::list())?;
        }
        Ok(self.ordinary.read().get(name).cloned().unwrap_or_default())
    }

    /// Sets `name`, replacing any previous value.
    pub fn set(&mut self, name: &str, value: Value) -> MasterResult<()> {
        if self.is_realtime(name) {
            self.realtime.insert(name, value)
        } else {
            self.ordinary.insert(name, value)
        }
    }

    /// Appends to a sequence result. Realtime results are replaced by their
    /// extended sequence, which replicates as a single event.
    pub fn append(&mut self, name: &str, x: Value) -> MasterResult<()> {
        let mut current = self.get(name)?;
        match &mut current {
            Value::List(items) => items.push(x),
            other => {
                return Err(MasterError::Protocol(format!(
                    "cannot append to result '{name}' holding a {}",
                    other.kind()
                )))
            }
        }
        self.set(name, current)
    }

    /// Drains the realtime events produced since the last call.
    pub fn take_pending(&self) -> Vec<Mod> {
        std::mem::take(&mut *self.outbox.0.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Realtime results mapping.
    pub fn realtime(&self) -> &Value {
        self.realtime.read()
    }

    /// Ordinary results mapping.
    pub fn ordinary(&self) -> &Value {
        self.ordinary.read()
    }
}
