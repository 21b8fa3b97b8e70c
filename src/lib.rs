//! Experiment control master.
//!
//! Runs experiments one at a time in an isolated worker subprocess, on
//! request from control clients or at scheduled times, and replicates its
//! state (run queue, timed runs, realtime results, parameters) to any number
//! of TCP subscribers.
//!
//! - [`scheduler`]: the run queue, timed runs and the execution loop
//! - [`worker`]: the subprocess protocol, both ends
//! - [`sync_struct`]: notifier, publisher and subscriber for state replication
//! - [`db`]: device/parameter databases and the per-run broker
//! - [`experiment`] and [`instrument`]: what a worker can run and drive
//! - [`control`]: the submission/cancellation port
//! - [`master`]: everything wired together

pub mod config;
pub mod control;
pub mod db;
pub mod error;
pub mod experiment;
pub mod instrument;
pub mod master;
pub mod messages;
pub mod protocol;
pub mod scheduler;
pub mod sync_struct;
pub mod worker;

pub use error::{MasterError, MasterResult};
