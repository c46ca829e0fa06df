//! On-demand action execution.
//!
//! Each run gets its own thread and an [`ActionRun`] that callers poll for
//! progress. Runs sharing a non-empty mutex name never overlap: a second run
//! is rejected as busy while the first is still running.

pub mod output;
pub mod run;
pub mod spawners;

#[cfg(test)]
mod actions_tests;

use crate::error::ActionError;
use crate::model::{ActionMode, ActionSpec, OutputLimits, Target};
use crate::services::ipc::IpcClient;
use serde_json::{json, Value as JsonValue};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

pub use output::{OutputBuffer, OutputLine, OutputStream};
pub use run::{ActionRun, ActionRunSnapshot, RunId, RunState};
use spawners::{IpcSpawner, Job, LocalSpawner, Spawner};

pub const VALUE_PLACEHOLDER: &str = "{value}";

/// Holders of named exclusion groups. A holder whose run is no longer
/// running does not block anyone, even before its lease is dropped.
#[derive(Default)]
struct MutexRegistry {
    held: Mutex<HashMap<String, Arc<ActionRun>>>,
}

struct Lease {
    registry: Arc<MutexRegistry>,
    name: String,
    id: RunId,
}

impl MutexRegistry {
    fn acquire(self: &Arc<Self>, run: &Arc<ActionRun>) -> Result<Option<Lease>, ActionError> {
        let name = run.mutex();
        if name.is_empty() {
            return Ok(None);
        }
        let mut held = self.held.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(holder) = held.get(name) {
            if !holder.state().is_terminal() {
                return Err(ActionError::Busy {
                    mutex: name.to_string(),
                    holder: holder.id(),
                });
            }
        }
        held.insert(name.to_string(), Arc::clone(run));
        Ok(Some(Lease {
            registry: Arc::clone(self),
            name: name.to_string(),
            id: run.id(),
        }))
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Ok(mut held) = self.registry.held.lock() {
            if held.get(&self.name).map(|r| r.id()) == Some(self.id) {
                held.remove(&self.name);
            }
        }
    }
}

#[derive(Default)]
struct RunTable {
    by_id: HashMap<RunId, Arc<ActionRun>>,
    latest: HashMap<(String, String), RunId>,
}

impl RunTable {
    // A superseded run stays reachable by id only while it is still running
    fn insert(&mut self, run: Arc<ActionRun>) {
        let key = (run.target_id().to_string(), run.action().to_string());
        self.latest.insert(key, run.id());
        self.by_id.insert(run.id(), run);
        self.prune();
    }

    fn prune(&mut self) {
        let latest = &self.latest;
        self.by_id.retain(|id, r| {
            !r.state().is_terminal()
                || latest.get(&(r.target_id().to_string(), r.action().to_string())) == Some(id)
        });
    }
}

pub struct ActionExecutor {
    local: Arc<dyn Spawner>,
    endpoints: Mutex<HashMap<String, Arc<IpcClient>>>,
    mutexes: Arc<MutexRegistry>,
    runs: Mutex<RunTable>,
    next_id: AtomicU64,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Default for ActionExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl ActionExecutor {
    pub fn new() -> Self {
        Self::with_spawner(Arc::new(LocalSpawner::new()))
    }

    /// Executor whose exec-mode actions go through `local`.
    pub fn with_spawner(local: Arc<dyn Spawner>) -> Self {
        Self {
            local,
            endpoints: Mutex::new(HashMap::new()),
            mutexes: Arc::new(MutexRegistry::default()),
            runs: Mutex::new(RunTable::default()),
            next_id: AtomicU64::new(1),
            threads: Mutex::new(Vec::new()),
        }
    }

    /// Route ipc-mode actions of `target_id` through `client`.
    pub fn register_endpoint(&self, target_id: &str, client: Arc<IpcClient>) {
        if let Ok(mut map) = self.endpoints.lock() {
            map.insert(target_id.to_string(), client);
        }
    }

    pub fn run(
        &self,
        target: &Target,
        action: &str,
        limits: OutputLimits,
    ) -> Result<Arc<ActionRun>, ActionError> {
        self.start(target, action, None, limits)
    }

    /// Like [`run`](Self::run), with `{value}` in `cmd` and `cwd` replaced by `value`.
    pub fn run_with_value(
        &self,
        target: &Target,
        action: &str,
        value: &str,
        limits: OutputLimits,
    ) -> Result<Arc<ActionRun>, ActionError> {
        self.start(target, action, Some(value), limits)
    }

    fn start(
        &self,
        target: &Target,
        action: &str,
        value: Option<&str>,
        limits: OutputLimits,
    ) -> Result<Arc<ActionRun>, ActionError> {
        let spec = target
            .action(action)
            .ok_or_else(|| ActionError::UnknownAction {
                target: target.id.clone(),
                action: action.to_string(),
            })?;
        let spawner = self.spawner_for(target, spec)?;
        let job = build_job(spec, value);

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let run = Arc::new(ActionRun::new(
            id,
            &target.id,
            &spec.name,
            &spec.mutex,
            spec.detached,
            limits,
        ));
        let lease = self.mutexes.acquire(&run).inspect_err(|e| {
            tracing::info!(target_id = %target.id, action = %spec.name, "{e}");
        })?;

        tracing::info!(
            target_id = %target.id,
            action = %spec.name,
            run_id = id,
            detached = spec.detached,
            "starting action"
        );
        let worker = Arc::clone(&run);
        let handle = thread::Builder::new()
            .name(format!("action-{id}"))
            .spawn(move || {
                let _lease = lease;
                spawner.execute(&job, &worker);
                // A spawner that forgot to finish must not leave the run running forever
                worker.finish(RunState::Failed, None, Some("run ended without a result".into()));
            })
            .map_err(ActionError::Spawn)?;

        if let Ok(mut runs) = self.runs.lock() {
            runs.insert(Arc::clone(&run));
        }
        if let Ok(mut threads) = self.threads.lock() {
            threads.retain(|h| !h.is_finished());
            threads.push(handle);
        }
        Ok(run)
    }

    fn spawner_for(&self, target: &Target, spec: &ActionSpec) -> Result<Arc<dyn Spawner>, ActionError> {
        match spec.mode {
            ActionMode::Exec => Ok(Arc::clone(&self.local)),
            ActionMode::Ipc => {
                let client = self
                    .endpoints
                    .lock()
                    .ok()
                    .and_then(|m| m.get(&target.id).cloned())
                    .ok_or_else(|| ActionError::NoEndpoint(target.id.clone()))?;
                Ok(Arc::new(IpcSpawner::new(client)))
            }
        }
    }

    pub fn get(&self, id: RunId) -> Option<Arc<ActionRun>> {
        let mut runs = self.runs.lock().ok()?;
        runs.prune();
        runs.by_id.get(&id).cloned()
    }

    pub fn run_state(&self, id: RunId) -> Option<ActionRunSnapshot> {
        self.get(id).map(|r| r.snapshot())
    }

    pub fn latest(&self, target_id: &str, action: &str) -> Option<ActionRunSnapshot> {
        let runs = self.runs.lock().ok()?;
        let id = runs
            .latest
            .get(&(target_id.to_string(), action.to_string()))?;
        runs.by_id.get(id).map(|r| r.snapshot())
    }

    /// Cancel every running run and wait for their threads.
    pub fn shutdown(&self) {
        let running: Vec<Arc<ActionRun>> = match self.runs.lock() {
            Ok(runs) => runs.by_id.values().cloned().collect(),
            Err(_) => Vec::new(),
        };
        for run in running.iter().filter(|r| !r.state().is_terminal()) {
            run.cancel();
        }
        let handles: Vec<JoinHandle<()>> = match self.threads.lock() {
            Ok(mut threads) => threads.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for h in handles {
            let _ = h.join();
        }
    }
}

impl Drop for ActionExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn substitute(text: &str, value: Option<&str>) -> String {
    match value {
        Some(v) => text.replace(VALUE_PLACEHOLDER, v),
        None => text.to_string(),
    }
}

fn build_job(spec: &ActionSpec, value: Option<&str>) -> Job {
    let args: JsonValue = match value {
        Some(v) => json!({ "value": v }),
        None => json!({}),
    };
    Job {
        action: spec.name.clone(),
        label: spec.label.clone(),
        cmd: spec.cmd.iter().map(|c| substitute(c, value)).collect(),
        cwd: spec.cwd.as_deref().map(|c| substitute(c, value)),
        timeout: spec.timeout(),
        detached: spec.detached,
        args,
    }
}
