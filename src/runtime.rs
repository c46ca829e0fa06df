//! The running monitor: workers for one loaded configuration plus the
//! read-only accessors a renderer polls.

use crate::engine::actions::{ActionExecutor, ActionRun, ActionRunSnapshot, RunId};
use crate::engine::log_tailer::{FileTail, IpcTail, LogTailer, TailSnapshot, TailSource};
use crate::engine::status_poller::{
    ExecStatusSource, IpcStatusSource, StatusPoller, StatusSnapshot, StatusSource,
};
use crate::error::{ActionError, ConfigError};
use crate::model::{LogMode, LogSpec, StatusSpec, Target};
use crate::services::config_loader::{self, LoadedConfig};
use crate::services::ipc::IpcClient;
use anyhow::Result;
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

/// Workers belonging to one configuration generation. Dropping it stops and
/// joins every worker.
struct Generation {
    config: Arc<LoadedConfig>,
    pollers: HashMap<String, StatusPoller>,
    tailers: HashMap<(String, String), LogTailer>,
}

impl Generation {
    fn idle(config: Arc<LoadedConfig>) -> Self {
        Self {
            config,
            pollers: HashMap::new(),
            tailers: HashMap::new(),
        }
    }

    fn start(config: Arc<LoadedConfig>, executor: &ActionExecutor) -> Self {
        let mut generation = Self::idle(Arc::clone(&config));
        for target in &config.targets {
            let client = ipc_client(target, &config);
            if let Some(client) = &client {
                executor.register_endpoint(&target.id, Arc::clone(client));
            }
            let source: Arc<dyn StatusSource> = match (&target.status, &client) {
                (StatusSpec::Exec(e), _) => Arc::new(ExecStatusSource::new(
                    e.cmd.clone(),
                    e.cwd.clone(),
                    target.status_timeout(&config.root),
                )),
                (StatusSpec::Ipc(_), Some(client)) => {
                    Arc::new(IpcStatusSource::new(Arc::clone(client)))
                }
                (StatusSpec::Ipc(_), None) => continue,
            };
            generation.pollers.insert(
                target.id.clone(),
                StatusPoller::start(&target.id, target.refresh_interval(&config.root), source),
            );
            for log in &target.logs {
                let Some(source) = tail_source(log, client.as_ref()) else {
                    continue;
                };
                generation.tailers.insert(
                    (target.id.clone(), log.stream.clone()),
                    LogTailer::start(&target.id, log, source),
                );
            }
        }
        tracing::info!(
            targets = generation.pollers.len(),
            logs = generation.tailers.len(),
            "monitor workers started"
        );
        generation
    }
}

fn ipc_client(target: &Target, config: &LoadedConfig) -> Option<Arc<IpcClient>> {
    let spec = target.status.ipc()?;
    match IpcClient::new(
        &spec.endpoint,
        target.status_timeout(&config.root),
        spec.max_response_bytes(),
    ) {
        Ok(client) => Some(Arc::new(client)),
        Err(e) => {
            tracing::warn!(target_id = %target.id, error = %e, "ipc endpoint unusable; target not monitored");
            None
        }
    }
}

fn tail_source(log: &LogSpec, client: Option<&Arc<IpcClient>>) -> Option<Box<dyn TailSource>> {
    match log.mode {
        LogMode::File => Some(Box::new(FileTail::new(log.clone())) as Box<dyn TailSource>),
        LogMode::Ipc => client.map(|c| {
            Box::new(IpcTail::new(Arc::clone(c), &log.stream, log.max_line_bytes)) as Box<dyn TailSource>
        }),
    }
}

/// Everything a renderer needs for one target, in one serializable value.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetView {
    pub id: String,
    pub title: String,
    pub status: Option<StatusSnapshot>,
    pub logs: Vec<TailSnapshot>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorSnapshot {
    pub targets: Vec<TargetView>,
    pub config_errors: Vec<ConfigError>,
}

pub struct Monitor {
    current: Mutex<Generation>,
    // Outlives reloads so a running action is not killed by one
    executor: ActionExecutor,
}

impl Monitor {
    pub fn start(config: LoadedConfig) -> Self {
        let executor = ActionExecutor::new();
        let generation = Generation::start(Arc::new(config), &executor);
        Self {
            current: Mutex::new(generation),
            executor,
        }
    }

    /// Load the configuration at `path` and start monitoring it.
    pub fn from_path(path: &Path) -> Result<Self> {
        Ok(Self::start(config_loader::load(path)?))
    }

    fn lock(&self) -> MutexGuard<'_, Generation> {
        self.current.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn config(&self) -> Arc<LoadedConfig> {
        Arc::clone(&self.lock().config)
    }

    pub fn current_status(&self, target_id: &str) -> Option<Arc<StatusSnapshot>> {
        self.lock().pollers.get(target_id).map(StatusPoller::snapshot)
    }

    pub fn tail_snapshot(&self, target_id: &str, stream: &str) -> Option<Arc<TailSnapshot>> {
        self.lock()
            .tailers
            .get(&(target_id.to_string(), stream.to_string()))
            .map(LogTailer::snapshot)
    }

    pub fn tail_lines(&self, target_id: &str, stream: &str) -> Option<Vec<String>> {
        self.tail_snapshot(target_id, stream).map(|s| s.lines.clone())
    }

    pub fn action_run_state(&self, run_id: RunId) -> Option<ActionRunSnapshot> {
        self.executor.run_state(run_id)
    }

    pub fn latest_action_run(&self, target_id: &str, action: &str) -> Option<ActionRunSnapshot> {
        self.executor.latest(target_id, action)
    }

    pub fn run_action(&self, target_id: &str, action: &str) -> Result<Arc<ActionRun>, ActionError> {
        self.start_action(target_id, action, None)
    }

    pub fn run_action_with_value(
        &self,
        target_id: &str,
        action: &str,
        value: &str,
    ) -> Result<Arc<ActionRun>, ActionError> {
        self.start_action(target_id, action, Some(value))
    }

    fn start_action(
        &self,
        target_id: &str,
        action: &str,
        value: Option<&str>,
    ) -> Result<Arc<ActionRun>, ActionError> {
        let config = self.config();
        let target = config
            .target(target_id)
            .ok_or_else(|| ActionError::UnknownTarget(target_id.to_string()))?;
        let limits = target.output_limits(&config.root);
        match value {
            Some(v) => self.executor.run_with_value(target, action, v, limits),
            None => self.executor.run(target, action, limits),
        }
    }

    /// Ask for an immediate status poll. False if the target is unknown.
    pub fn refresh_now(&self, target_id: &str) -> bool {
        match self.lock().pollers.get(target_id) {
            Some(p) => {
                p.refresh_now();
                true
            }
            None => false,
        }
    }

    /// Everything currently known, target by target in configuration order.
    pub fn snapshot(&self) -> MonitorSnapshot {
        let current = self.lock();
        let targets = current
            .config
            .targets
            .iter()
            .map(|t| TargetView {
                id: t.id.clone(),
                title: t.title.clone(),
                status: current.pollers.get(&t.id).map(|p| (*p.snapshot()).clone()),
                logs: t
                    .logs
                    .iter()
                    .filter_map(|l| current.tailers.get(&(t.id.clone(), l.stream.clone())))
                    .map(|tailer| (*tailer.snapshot()).clone())
                    .collect(),
            })
            .collect();
        MonitorSnapshot {
            targets,
            config_errors: current.config.errors.clone(),
        }
    }

    /// Replace the configuration with the one at `path`. A root document
    /// that fails to load leaves the current configuration running.
    pub fn reload(&self, path: &Path) -> Result<()> {
        let next = Arc::new(config_loader::load(path)?);
        // Stop the old workers outside the lock; readers see the new
        // configuration with no workers until the new generation is in
        let old = std::mem::replace(&mut *self.lock(), Generation::idle(Arc::clone(&next)));
        drop(old);
        let generation = Generation::start(next, &self.executor);
        *self.lock() = generation;
        tracing::info!(path = %path.display(), "configuration reloaded");
        Ok(())
    }

    /// Stop every worker and wait for it. Running actions are cancelled.
    pub fn shutdown(&self) {
        let config = self.config();
        let old = std::mem::replace(&mut *self.lock(), Generation::idle(config));
        drop(old);
        self.executor.shutdown();
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        self.shutdown();
    }
}
