//! Experiments the worker can run.
//!
//! An experiment is looked up by the `experiment` name of a run request and
//! built from its `arguments` mapping. It declares its realtime results up
//! front, then runs against a [`DbHub`] that gives it devices, parameters
//! and result storage.
//!
//! # Example
//!
//! ```rust,ignore
//! let mut registry = ExperimentRegistry::new();
//! registry.register("scan", |args| Ok(Box::new(Scan::from_arguments(args)?) as Box<dyn Experiment>));
//!
//! let mut experiment = registry.create("scan", &arguments)?;
//! let description = experiment.realtime_results();
//! experiment.run(&mut hub).await?;
//! ```

pub mod builtin;

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;

use crate::db::DbHub;
use crate::error::{MasterError, MasterResult};
use crate::protocol::Value;

/// A runnable experiment.
///
/// Experiments run inside the worker subprocess. Its stdout is redirected to
/// stderr there (see [`crate::worker::ParentLink::stdio`]), so printing is
/// harmless but only shows up in the worker's log.
#[async_trait]
pub trait Experiment: Send {
    /// Realtime results this experiment produces, keyed by name or tuple of
    /// names. Published to the master before [`Experiment::run`] starts.
    fn realtime_results(&self) -> Value {
        Value::dict()
    }

    /// Runs the experiment to completion. An error fails the run.
    async fn run(&mut self, hub: &mut DbHub) -> Result<()>;
}

type ExperimentFactory = Box<dyn Fn(&Value) -> Result<Box<dyn Experiment>> + Send + Sync>;

/// Experiment name to constructor.
pub struct ExperimentRegistry {
    factories: HashMap<String, ExperimentFactory>,
}

impl Default for ExperimentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ExperimentRegistry {
    /// Registry with the built-in experiments.
    pub fn new() -> Self {
        let mut registry = Self::empty();
        builtin::register(&mut registry);
        registry
    }

    /// Registry without any experiments.
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registers `factory` under `name`, replacing any previous entry.
    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&Value) -> Result<Box<dyn Experiment>> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_string(), Box::new(factory));
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Builds the experiment `name`. Unknown names are lookup errors; bad
    /// arguments are reported as experiment failures.
    pub fn create(&self, name: &str, arguments: &Value) -> MasterResult<Box<dyn Experiment>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| MasterError::Lookup(format!("experiment '{name}' not found")))?;
        factory(arguments)
            .map_err(|e| MasterError::UnitExecution(format!("invalid arguments for '{name}': {e:#}")))
    }
}
