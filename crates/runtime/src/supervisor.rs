use std::collections::HashMap;
use std::sync::Arc;

use drift_config::ExperimentConfig;
use drift_reviewer::DefenseStatistics;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, broadcast, oneshot, watch};
use tracing::info;
use uuid::Uuid;

use crate::events::EventEnvelope;
use crate::experiment::{Experiment, ExperimentStatistics, ExperimentStatus, StateError};
use crate::worker::{SharedContext, WorkerHandles, spawn_worker};

/// One line per experiment for `list()` — the cheap fields a dashboard needs
/// without pulling the full statistics blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentSummary {
    pub uuid: Uuid,
    pub name: String,
    pub status: ExperimentStatus,
    pub current_episode: u32,
    pub total_episodes: u32,
}

impl From<&Experiment> for ExperimentSummary {
    fn from(exp: &Experiment) -> Self {
        Self {
            uuid: exp.uuid,
            name: exp.name.clone(),
            status: exp.status,
            current_episode: exp.current_episode,
            total_episodes: exp.total_episodes,
        }
    }
}

struct ExperimentHandle {
    handles: WorkerHandles,
    join: tokio::task::JoinHandle<()>,
    seed: u64,
    config: ExperimentConfig,
}

/// Owns every in-flight experiment and is the only thing that talks to a
/// worker task directly. Mirrors `aigent-runtime::server::DaemonState`: a
/// `Mutex`-guarded registry, commands posted into an `mpsc` inbox, progress
/// read back off a `broadcast` channel — generalized here from "one daemon,
/// one conversation" to "one supervisor, many concurrent experiments".
pub struct Supervisor {
    experiments: Mutex<HashMap<Uuid, ExperimentHandle>>,
    shared: Arc<SharedContext>,
}

impl Supervisor {
    pub fn new(shared: Arc<SharedContext>) -> Self {
        Self { experiments: Mutex::new(HashMap::new()), shared }
    }

    /// Creates and immediately starts a new experiment, spawning its worker
    /// task. The seed is drawn from system entropy at creation time and
    /// stored so `reset` can later replay the identical episode-by-episode
    /// trace (§9: reset + start with the same seed reproduces the run).
    pub async fn start(&self, name: impl Into<String>, config: ExperimentConfig) -> anyhow::Result<Uuid> {
        self.start_with_seed(name, config, rand::random::<u64>()).await
    }

    /// Same as [`Supervisor::start`] but with an explicit seed, for callers
    /// that need a reproducible run without going through `reset` first
    /// (integration tests; offline replay of a previously logged seed).
    pub async fn start_with_seed(
        &self,
        name: impl Into<String>,
        config: ExperimentConfig,
        seed: u64,
    ) -> anyhow::Result<Uuid> {
        config.validate()?;
        let experiment = Experiment::new(name, config.clone());
        let uuid = experiment.uuid;

        let (handles, join) = spawn_worker(experiment, seed, self.shared.clone());
        self.experiments.lock().await.insert(uuid, ExperimentHandle { handles, join, seed, config });
        info!(experiment = %uuid, "experiment started");
        Ok(uuid)
    }

    async fn send_command<F>(&self, uuid: Uuid, make_cmd: F) -> Result<(), StateError>
    where
        F: FnOnce(oneshot::Sender<Result<(), StateError>>) -> crate::commands::WorkerCommand,
    {
        let command_tx = {
            let guard = self.experiments.lock().await;
            let handle = guard.get(&uuid).ok_or(StateError::NotFound)?;
            handle.handles.command_tx.clone()
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        if command_tx.send(make_cmd(reply_tx)).await.is_err() {
            return Err(StateError::NotFound);
        }
        reply_rx.await.unwrap_or(Err(StateError::NotFound))
    }

    pub async fn pause(&self, uuid: Uuid) -> Result<(), StateError> {
        self.send_command(uuid, crate::commands::WorkerCommand::Pause).await
    }

    pub async fn resume(&self, uuid: Uuid) -> Result<(), StateError> {
        self.send_command(uuid, crate::commands::WorkerCommand::Resume).await
    }

    pub async fn stop(&self, uuid: Uuid) -> Result<(), StateError> {
        self.send_command(uuid, crate::commands::WorkerCommand::Stop).await
    }

    /// Resets a finished experiment back to `created`, ready to `start`
    /// again with an identical seed. The worker task for the previous run
    /// has already exited by the time `reset` is legal (the state machine
    /// only allows it from `stopped`/`completed`/`failed`), so this is
    /// handled directly against the stored snapshot rather than through the
    /// command channel — there is no live worker left to send a command to.
    pub async fn reset(&self, uuid: Uuid) -> Result<Uuid, StateError> {
        let (mut snapshot, seed, config) = {
            let mut guard = self.experiments.lock().await;
            let handle = guard.remove(&uuid).ok_or(StateError::NotFound)?;
            let snapshot = handle.handles.snapshot_rx.borrow().clone();
            (snapshot, handle.seed, handle.config)
        };
        snapshot.reset()?;

        let (handles, join) = spawn_worker(snapshot, seed, self.shared.clone());
        let new_uuid = handles.snapshot_rx.borrow().uuid;
        self.experiments.lock().await.insert(new_uuid, ExperimentHandle { handles, join, seed, config });
        Ok(new_uuid)
    }

    pub async fn status(&self, uuid: Uuid) -> Result<Experiment, StateError> {
        let guard = self.experiments.lock().await;
        let handle = guard.get(&uuid).ok_or(StateError::NotFound)?;
        Ok(handle.handles.snapshot_rx.borrow().clone())
    }

    pub async fn metrics(&self, uuid: Uuid) -> Result<ExperimentStatistics, StateError> {
        Ok(self.status(uuid).await?.statistics)
    }

    pub async fn list(&self) -> Vec<ExperimentSummary> {
        let guard = self.experiments.lock().await;
        guard.values().map(|handle| ExperimentSummary::from(&*handle.handles.snapshot_rx.borrow())).collect()
    }

    pub async fn subscribe(&self, uuid: Uuid) -> Result<broadcast::Receiver<EventEnvelope>, StateError> {
        let guard = self.experiments.lock().await;
        let handle = guard.get(&uuid).ok_or(StateError::NotFound)?;
        Ok(handle.handles.event_tx.subscribe())
    }

    /// Watch handle for callers that want to react to status changes
    /// without polling `status`.
    pub async fn watch(&self, uuid: Uuid) -> Result<watch::Receiver<Experiment>, StateError> {
        let guard = self.experiments.lock().await;
        let handle = guard.get(&uuid).ok_or(StateError::NotFound)?;
        Ok(handle.handles.snapshot_rx.clone())
    }

    pub fn defense_statistics(&self) -> DefenseStatistics {
        self.shared.reviewer.defense_statistics()
    }

    pub fn reset_defense_statistics(&self) {
        self.shared.reviewer.stats().reset();
    }

    /// Aborts every still-running worker task. Intended for process
    /// shutdown, not part of the Control API surface.
    pub async fn shutdown(&self) {
        let mut guard = self.experiments.lock().await;
        for (_, handle) in guard.drain() {
            handle.join.abort();
        }
    }
}
