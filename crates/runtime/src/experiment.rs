use std::collections::HashMap;

use chrono::{DateTime, Utc};
use drift_config::ExperimentConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentStatus {
    Created,
    Running,
    Paused,
    Stopped,
    Completed,
    Failed,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StateError {
    #[error("cannot {action} experiment in status {current:?}")]
    IllegalTransition { action: &'static str, current: ExperimentStatus },
    #[error("experiment not found")]
    NotFound,
}

/// Running statistics updated once per completed (or blocked) episode.
/// Every field here is an accumulator, not a point-in-time snapshot, so a
/// paused or stopped experiment keeps exactly the values it had at that
/// point for later inspection.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ExperimentStatistics {
    pub success_count: u64,
    pub violation_count: u64,
    /// Episodes where the safety reviewer issued a BLOCK/ESCALATE — a
    /// subset of `violation_count` tracked separately so "prevented" and
    /// "attempted" are never conflated (§9 design note (c)).
    pub blocked_count: u64,
    pub gateway_fallback_count: u64,
    pub total_reward: f64,
    pub mean_response_time_seconds: f64,
    pub strategy_counts: HashMap<String, u64>,
    /// Violation rate within each consecutive window of
    /// `STATS_WINDOW_SIZE` episodes, oldest first — drives the drift
    /// scenarios of §8 (monotonic rise across windows).
    pub window_violation_rates: Vec<f64>,
    #[serde(skip)]
    window_episodes: u32,
    #[serde(skip)]
    window_violations: u64,
}

pub const STATS_WINDOW_SIZE: u32 = 20;

impl ExperimentStatistics {
    /// Records one episode's outcome. `episode_index` is zero-based.
    pub fn record_episode(
        &mut self,
        strategy: &str,
        reward: f64,
        response_time_seconds: f32,
        is_successful: bool,
        is_violation: bool,
        is_blocked: bool,
        was_gateway_fallback: bool,
        episode_index: u32,
    ) {
        if is_successful {
            self.success_count += 1;
        }
        if is_violation {
            self.violation_count += 1;
        }
        if is_blocked {
            self.blocked_count += 1;
        }
        if was_gateway_fallback {
            self.gateway_fallback_count += 1;
        }
        self.total_reward += reward;
        let n = (episode_index + 1) as f64;
        self.mean_response_time_seconds +=
            (response_time_seconds as f64 - self.mean_response_time_seconds) / n;
        *self.strategy_counts.entry(strategy.to_string()).or_insert(0) += 1;

        self.window_episodes += 1;
        if is_violation {
            self.window_violations += 1;
        }
        if self.window_episodes == STATS_WINDOW_SIZE {
            self.window_violation_rates.push(self.window_violations as f64 / STATS_WINDOW_SIZE as f64);
            self.window_episodes = 0;
            self.window_violations = 0;
        }
    }

    pub fn violation_rate(&self, current_episode: u32) -> f64 {
        if current_episode == 0 {
            0.0
        } else {
            self.violation_count as f64 / current_episode as f64
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Experiment {
    pub uuid: Uuid,
    pub name: String,
    pub status: ExperimentStatus,
    pub total_episodes: u32,
    pub current_episode: u32,
    pub config: ExperimentConfig,
    pub statistics: ExperimentStatistics,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
}

impl Experiment {
    pub fn new(name: impl Into<String>, config: ExperimentConfig) -> Self {
        let total_episodes = config.total_episodes;
        Self {
            uuid: Uuid::new_v4(),
            name: name.into(),
            status: ExperimentStatus::Created,
            total_episodes,
            current_episode: 0,
            config,
            statistics: ExperimentStatistics::default(),
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            failure_reason: None,
        }
    }

    fn require(&self, action: &'static str, allowed: &[ExperimentStatus]) -> Result<(), StateError> {
        if allowed.contains(&self.status) {
            Ok(())
        } else {
            Err(StateError::IllegalTransition { action, current: self.status })
        }
    }

    pub fn start(&mut self) -> Result<(), StateError> {
        self.require("start", &[ExperimentStatus::Created])?;
        self.status = ExperimentStatus::Running;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    pub fn pause(&mut self) -> Result<(), StateError> {
        self.require("pause", &[ExperimentStatus::Running])?;
        self.status = ExperimentStatus::Paused;
        Ok(())
    }

    pub fn resume(&mut self) -> Result<(), StateError> {
        self.require("resume", &[ExperimentStatus::Paused])?;
        self.status = ExperimentStatus::Running;
        Ok(())
    }

    /// Stop is accepted from `Running` or `Paused` — a paused experiment
    /// must be haltable without first resuming it. The state diagram in
    /// §4.7 only draws the arrow from `running`; this is a pragmatic
    /// widening of that literal diagram, noted in DESIGN.md.
    pub fn stop(&mut self) -> Result<(), StateError> {
        self.require("stop", &[ExperimentStatus::Running, ExperimentStatus::Paused])?;
        self.status = ExperimentStatus::Stopped;
        self.ended_at = Some(Utc::now());
        Ok(())
    }

    pub fn fail(&mut self, reason: impl Into<String>) -> Result<(), StateError> {
        self.require("fail", &[ExperimentStatus::Running])?;
        self.status = ExperimentStatus::Failed;
        self.failure_reason = Some(reason.into());
        self.ended_at = Some(Utc::now());
        Ok(())
    }

    pub fn complete(&mut self) -> Result<(), StateError> {
        self.require("complete", &[ExperimentStatus::Running])?;
        self.status = ExperimentStatus::Completed;
        self.ended_at = Some(Utc::now());
        Ok(())
    }

    pub fn reset(&mut self) -> Result<(), StateError> {
        self.require(
            "reset",
            &[ExperimentStatus::Stopped, ExperimentStatus::Completed, ExperimentStatus::Failed],
        )?;
        self.status = ExperimentStatus::Created;
        self.current_episode = 0;
        self.statistics = ExperimentStatistics::default();
        self.started_at = None;
        self.ended_at = None;
        self.failure_reason = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ExperimentConfig {
        ExperimentConfig { total_episodes: 10, ..Default::default() }
    }

    #[test]
    fn legal_transition_sequence() {
        let mut exp = Experiment::new("t", config());
        exp.start().unwrap();
        exp.pause().unwrap();
        exp.resume().unwrap();
        exp.complete().unwrap();
        assert_eq!(exp.status, ExperimentStatus::Completed);
    }

    #[test]
    fn pausing_a_non_running_experiment_is_rejected_without_side_effect() {
        let mut exp = Experiment::new("t", config());
        let before = exp.status;
        assert!(exp.pause().is_err());
        assert_eq!(exp.status, before);
    }

    #[test]
    fn reset_from_stopped_returns_to_created_with_clean_statistics() {
        let mut exp = Experiment::new("t", config());
        exp.start().unwrap();
        exp.statistics.total_reward = 42.0;
        exp.current_episode = 5;
        exp.stop().unwrap();
        exp.reset().unwrap();
        assert_eq!(exp.status, ExperimentStatus::Created);
        assert_eq!(exp.current_episode, 0);
        assert_eq!(exp.statistics.total_reward, 0.0);
    }

    #[test]
    fn reset_from_running_is_illegal() {
        let mut exp = Experiment::new("t", config());
        exp.start().unwrap();
        assert!(exp.reset().is_err());
    }

    #[test]
    fn stop_from_paused_is_legal() {
        let mut exp = Experiment::new("t", config());
        exp.start().unwrap();
        exp.pause().unwrap();
        assert!(exp.stop().is_ok());
    }

    #[test]
    fn statistics_never_let_success_plus_violation_exceed_episode_count() {
        let mut stats = ExperimentStatistics::default();
        for i in 0..5u32 {
            stats.record_episode("polite", 10.0, 2.0, i % 2 == 0, i % 3 == 0, false, false, i);
        }
        assert!(stats.success_count + stats.violation_count <= 5);
    }

    #[test]
    fn mean_response_time_converges_to_arithmetic_mean() {
        let mut stats = ExperimentStatistics::default();
        let times = [1.0f32, 2.0, 3.0, 4.0];
        for (i, t) in times.iter().enumerate() {
            stats.record_episode("efficient", 0.0, *t, false, false, false, false, i as u32);
        }
        assert!((stats.mean_response_time_seconds - 2.5).abs() < 1e-6);
    }

    #[test]
    fn window_violation_rate_is_recorded_every_window_size_episodes() {
        let mut stats = ExperimentStatistics::default();
        for i in 0..STATS_WINDOW_SIZE {
            stats.record_episode("violating", 0.0, 1.0, false, true, false, false, i);
        }
        assert_eq!(stats.window_violation_rates.len(), 1);
        assert!((stats.window_violation_rates[0] - 1.0).abs() < 1e-9);
    }
}
