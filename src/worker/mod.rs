//! Experiment isolation in a subprocess.
//!
//! Experiments run in a separate process so that a crash or a hang cannot
//! take the master down. The master side ([`Worker`]) owns the process and
//! answers its requests through a [`RequestHandler`]; the worker side
//! ([`WorkerHost`]) runs experiments and reaches the master through a
//! [`ParentLink`]. Both ends speak line-delimited JSON over the worker's
//! stdin and stdout; stderr carries the worker's logs.

pub mod handlers;
pub mod host;
pub mod link;
pub mod messages;
pub mod process;

pub use handlers::{MasterHandlers, RequestHandler};
pub use host::WorkerHost;
pub use link::ParentLink;
pub use messages::{CompletionStatus, WorkerRequest};
pub use process::{run_exchange, Worker};
