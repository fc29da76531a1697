use tokio::sync::oneshot;

use crate::experiment::StateError;

/// Posted into a worker's inbox by the Supervisor and drained at the
/// suspension point (top of each episode, or the pause-wait loop). The
/// `oneshot` reply lets `Supervisor::pause`/`resume`/`stop`/`reset` return
/// only once the worker has actually applied (or rejected) the transition,
/// so a caller never observes a stale status right after issuing a command.
pub enum WorkerCommand {
    Pause(oneshot::Sender<Result<(), StateError>>),
    Resume(oneshot::Sender<Result<(), StateError>>),
    Stop(oneshot::Sender<Result<(), StateError>>),
}
