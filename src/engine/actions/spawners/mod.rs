use super::run::ActionRun;
use serde_json::Value as JsonValue;
use std::time::Duration;

pub mod ipc;
pub mod local;

pub use ipc::IpcSpawner;
pub use local::LocalSpawner;

/// Everything a spawner needs to execute one action run.
#[derive(Debug, Clone)]
pub struct Job {
    pub action: String,
    pub label: String,
    pub cmd: Vec<String>,
    pub cwd: Option<String>,
    pub timeout: Duration,
    pub detached: bool,
    /// Arguments forwarded to remote actions.
    pub args: JsonValue,
}

/// Executes a job and drives `run` to a terminal state. Called on the run's
/// own thread; may block up to the job timeout.
pub trait Spawner: Send + Sync {
    fn execute(&self, job: &Job, run: &ActionRun);
}
