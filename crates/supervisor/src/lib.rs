//! Worker supervisor: spawns per-agent child processes, correlates task
//! replies, monitors heartbeats, and restarts crashed workers with
//! exponential backoff.

mod runtime;
mod supervisor;
mod transport;

pub use runtime::{container_command, local_command};
pub use supervisor::{
    AgentStateChange, InternalTaskRouter, WorkerSupervisor, WorkerView,
};
pub use transport::{spawn_worker, SpawnedWorker, StdioTransport, WorkerExit};
