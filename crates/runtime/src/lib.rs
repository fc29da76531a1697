mod commands;
mod events;
mod experiment;
mod rng;
mod scenario;
mod supervisor;
mod worker;

pub use commands::WorkerCommand;
pub use events::{BROADCAST_CAP, EventEnvelope, ExperimentEvent};
pub use experiment::{Experiment, ExperimentStatistics, ExperimentStatus, STATS_WINDOW_SIZE, StateError};
pub use rng::SeededRng;
pub use scenario::synthesize_issue;
pub use supervisor::{ExperimentSummary, Supervisor};
pub use worker::{SharedContext, WorkerHandles, spawn_worker};
