use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::experiment::ExperimentStatus;

/// Broadcast channel capacity per experiment. Lagging subscribers (an SSE
/// client that stalls mid-stream) drop old events rather than back-pressure
/// the episode loop.
pub const BROADCAST_CAP: usize = 256;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExperimentEvent {
    EpisodeCompleted {
        episode: u32,
        strategy: String,
        reward_total: f32,
        is_violation: bool,
    },
    ViolationDetected {
        episode: u32,
        violation_tags: Vec<String>,
        risk_level: String,
    },
    DefenseAction {
        episode: u32,
        action: String,
    },
    ExperimentCompleted {
        total_episodes: u32,
    },
    StatusChanged {
        status: ExperimentStatus,
    },
    Error {
        message: String,
    },
}

/// One event on the wire: the experiment it belongs to, a monotonically
/// increasing per-experiment sequence number, a wall-clock timestamp, and
/// the event payload itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub experiment_id: Uuid,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub event: ExperimentEvent,
}
