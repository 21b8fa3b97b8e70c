//! Databases and the per-run broker.
//!
//! The master owns two [`FlatFileDb`]s (devices and parameters). Inside the
//! worker, a [`DbHub`] reaches them through the pipe and keeps the run's
//! [`ResultDb`].

pub mod flat_file;
pub mod hub;
pub mod result_db;

pub use flat_file::FlatFileDb;
pub use hub::DbHub;
pub use result_db::{realtime_names, ResultDb};
