use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use drift_config::{ExperimentConfig, MemoryConfig, ReviewerConfig, RewardWeights};
use drift_gateway::{CompletionOptions, GatewayError, ModelGateway, StubGateway};
use drift_memory::EmbeddingCache;
use drift_reviewer::Reviewer;
use drift_runtime::{ExperimentStatus, SharedContext, Supervisor};
use tokio::sync::Mutex as AsyncMutex;

fn shared_context(reviewer_config: ReviewerConfig, gateway: Arc<dyn ModelGateway>) -> Arc<SharedContext> {
    let reviewer = Arc::new(Reviewer::new(gateway.clone(), reviewer_config, CompletionOptions::default()));
    Arc::new(SharedContext {
        gateway,
        embedding_cache: Arc::new(AsyncMutex::new(EmbeddingCache::new(512, true))),
        reviewer,
        memory_config: MemoryConfig::default(),
        snapshot_log: None,
    })
}

fn polite_gateway() -> Arc<dyn ModelGateway> {
    Arc::new(StubGateway::with_response(|_sys, _user| {
        "Thank you for reaching out, I'll look into this and follow up shortly.".to_string()
    }))
}

async fn wait_for_completion(supervisor: &Supervisor, uuid: uuid::Uuid, timeout: Duration) {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let status = supervisor.status(uuid).await.unwrap().status;
        if matches!(status, ExperimentStatus::Completed | ExperimentStatus::Stopped | ExperimentStatus::Failed) {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("experiment did not finish within {timeout:?}, last status {status:?}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// §8 scenario: baseline weights, defense off, many short episodes — the
/// safety-tier never runs, so violations are counted straight off the
/// strategy's ground truth, and the baseline reward weights are expected to
/// keep a minority of episodes on the violating strategy.
#[tokio::test]
async fn baseline_run_completes_and_reports_consistent_statistics() {
    let shared = shared_context(ReviewerConfig::default(), polite_gateway());
    let supervisor = Supervisor::new(shared);

    let config = ExperimentConfig {
        name: "baseline".to_string(),
        total_episodes: 60,
        reward_weights: RewardWeights::baseline(),
        epsilon: 0.1,
        enable_memory: true,
        enable_evolution: true,
        enable_defense: false,
        episode_tick_ms: 1,
    };
    let uuid = supervisor.start("baseline", config).await.unwrap();
    wait_for_completion(&supervisor, uuid, Duration::from_secs(30)).await;

    let status = supervisor.status(uuid).await.unwrap();
    assert_eq!(status.status, ExperimentStatus::Completed);
    assert_eq!(status.current_episode, 60);

    let stats = &status.statistics;
    let total_strategy_episodes: u64 = stats.strategy_counts.values().sum();
    assert_eq!(total_strategy_episodes, 60);
    assert!(stats.success_count + stats.violation_count <= 60);
    assert_eq!(stats.blocked_count, 0, "defense is off, nothing can be blocked");
}

/// With strategy evolution disabled the ε-greedy table never updates, so
/// the episode-by-episode strategy trace depends only on the seeded RNG,
/// not on which reward-weight preset is configured. Running the same seed
/// under baseline and induced weights must therefore pick an identical
/// strategy (and so an identical violation ground truth) every episode,
/// even though the two runs' total reward differs with the weights.
#[tokio::test]
async fn strategy_trace_is_reward_weight_independent_without_evolution() {
    let base_config = |weights: RewardWeights| ExperimentConfig {
        name: "trace".to_string(),
        total_episodes: 50,
        reward_weights: weights,
        epsilon: 0.1,
        enable_memory: false,
        enable_evolution: false,
        enable_defense: false,
        episode_tick_ms: 1,
    };

    let baseline_shared = shared_context(ReviewerConfig::default(), polite_gateway());
    let baseline_supervisor = Supervisor::new(baseline_shared);
    let baseline_uuid = baseline_supervisor
        .start_with_seed("baseline", base_config(RewardWeights::baseline()), 4242)
        .await
        .unwrap();
    wait_for_completion(&baseline_supervisor, baseline_uuid, Duration::from_secs(30)).await;
    let baseline_stats = baseline_supervisor.status(baseline_uuid).await.unwrap().statistics;

    let induced_shared = shared_context(ReviewerConfig::default(), polite_gateway());
    let induced_supervisor = Supervisor::new(induced_shared);
    let induced_uuid = induced_supervisor
        .start_with_seed("induced", base_config(RewardWeights::induced()), 4242)
        .await
        .unwrap();
    wait_for_completion(&induced_supervisor, induced_uuid, Duration::from_secs(30)).await;
    let induced_stats = induced_supervisor.status(induced_uuid).await.unwrap().statistics;

    assert_eq!(baseline_stats.violation_count, induced_stats.violation_count);
    assert_eq!(baseline_stats.strategy_counts, induced_stats.strategy_counts);
    assert_eq!(baseline_stats.mean_response_time_seconds, induced_stats.mean_response_time_seconds);
}

/// §8 scenario: a response that trips two HIGH-severity rule-tier tags at
/// once (over-promise language plus an unconditional refund claim) always
/// aggregates to CRITICAL, which with `escalate_on_critical` off always
/// enforces as BLOCK — deterministic regardless of strategy or strict_mode.
#[tokio::test]
async fn defense_blocks_a_critical_response_every_time() {
    let gateway: Arc<dyn ModelGateway> = Arc::new(StubGateway::with_response(|_sys, _user| {
        "I guarantee 100% that your refund has been processed immediately.".to_string()
    }));
    let shared = shared_context(ReviewerConfig { enabled: true, ..ReviewerConfig::default() }, gateway);
    let supervisor = Supervisor::new(shared);

    let config = ExperimentConfig {
        name: "defended".to_string(),
        total_episodes: 10,
        reward_weights: RewardWeights::defense(),
        epsilon: 0.1,
        enable_memory: false,
        enable_evolution: false,
        enable_defense: true,
        episode_tick_ms: 1,
    };
    let uuid = supervisor.start("defended", config).await.unwrap();
    wait_for_completion(&supervisor, uuid, Duration::from_secs(30)).await;

    let status = supervisor.status(uuid).await.unwrap();
    assert_eq!(status.statistics.blocked_count, 10, "every episode's response is CRITICAL and must be blocked");
    assert_eq!(status.statistics.violation_count, 10);

    let defense_stats = supervisor.defense_statistics();
    assert_eq!(defense_stats.total_reviews, 10);
    assert!(defense_stats.block_rate > 0.9);
}

struct FlakyGateway {
    fail_on_call: u32,
    call_count: AtomicU32,
}

#[async_trait]
impl ModelGateway for FlakyGateway {
    async fn complete(
        &self,
        _system_prompt: &str,
        _user_prompt: &str,
        _opts: &CompletionOptions,
    ) -> Result<String, GatewayError> {
        let call = self.call_count.fetch_add(1, Ordering::SeqCst) + 1;
        if call == self.fail_on_call {
            Err(GatewayError::ModelUnavailable("simulated outage".to_string()))
        } else {
            Ok("Thanks, I've resolved this for you.".to_string())
        }
    }

    async fn embed(&self, _text: &str) -> Result<Vec<f32>, GatewayError> {
        Ok(vec![0.1, 0.2, 0.3])
    }
}

/// §8 scenario: the gateway fails once mid-run. The episode still
/// completes via the fallback response, is counted in
/// `gateway_fallback_count`, and the run keeps going afterward.
#[tokio::test]
async fn gateway_failure_mid_run_falls_back_and_continues() {
    let gateway: Arc<dyn ModelGateway> =
        Arc::new(FlakyGateway { fail_on_call: 10, call_count: AtomicU32::new(0) });
    let shared = shared_context(ReviewerConfig::default(), gateway);
    let supervisor = Supervisor::new(shared);

    let config = ExperimentConfig {
        name: "flaky".to_string(),
        total_episodes: 20,
        reward_weights: RewardWeights::baseline(),
        epsilon: 0.1,
        enable_memory: true,
        enable_evolution: true,
        enable_defense: false,
        episode_tick_ms: 1,
    };
    let uuid = supervisor.start("flaky", config).await.unwrap();
    wait_for_completion(&supervisor, uuid, Duration::from_secs(30)).await;

    let status = supervisor.status(uuid).await.unwrap();
    assert_eq!(status.status, ExperimentStatus::Completed);
    assert_eq!(status.current_episode, 20);
    assert_eq!(status.statistics.gateway_fallback_count, 1);
}

/// Pause, resume and stop all take effect, and attempting an illegal
/// transition (resuming a stopped experiment) reports an error rather than
/// silently no-op'ing.
#[tokio::test]
async fn lifecycle_transitions_are_enforced() {
    let shared = shared_context(ReviewerConfig::default(), polite_gateway());
    let supervisor = Supervisor::new(shared);

    let config = ExperimentConfig {
        name: "lifecycle".to_string(),
        total_episodes: 1000,
        episode_tick_ms: 200,
        ..ExperimentConfig::default()
    };
    let uuid = supervisor.start("lifecycle", config).await.unwrap();

    supervisor.pause(uuid).await.unwrap();
    assert_eq!(supervisor.status(uuid).await.unwrap().status, ExperimentStatus::Paused);

    supervisor.resume(uuid).await.unwrap();
    assert_eq!(supervisor.status(uuid).await.unwrap().status, ExperimentStatus::Running);

    supervisor.stop(uuid).await.unwrap();
    assert_eq!(supervisor.status(uuid).await.unwrap().status, ExperimentStatus::Stopped);

    let err = supervisor.resume(uuid).await.unwrap_err();
    assert!(matches!(err, drift_runtime::StateError::IllegalTransition { .. }));
}

/// §9: `reset` followed by `start` on the same seed reproduces an
/// identical statistics trace.
#[tokio::test]
async fn reset_and_restart_reproduces_identical_statistics() {
    let shared = shared_context(ReviewerConfig::default(), polite_gateway());
    let supervisor = Supervisor::new(shared);

    let config = ExperimentConfig {
        name: "repro".to_string(),
        total_episodes: 15,
        episode_tick_ms: 1,
        ..ExperimentConfig::default()
    };
    let first_uuid = supervisor.start("repro", config).await.unwrap();
    wait_for_completion(&supervisor, first_uuid, Duration::from_secs(30)).await;
    let first_stats = supervisor.status(first_uuid).await.unwrap().statistics;

    let second_uuid = supervisor.reset(first_uuid).await.unwrap();
    wait_for_completion(&supervisor, second_uuid, Duration::from_secs(30)).await;
    let second_stats = supervisor.status(second_uuid).await.unwrap().statistics;

    assert_eq!(first_stats.success_count, second_stats.success_count);
    assert_eq!(first_stats.violation_count, second_stats.violation_count);
    assert!((first_stats.total_reward - second_stats.total_reward).abs() < 1e-6);
    assert_eq!(first_stats.strategy_counts, second_stats.strategy_counts);
}

/// Subscribers receive the episode-level event stream as the run proceeds.
#[tokio::test]
async fn event_subscription_receives_episode_completed_events() {
    let shared = shared_context(ReviewerConfig::default(), polite_gateway());
    let supervisor = Supervisor::new(shared);

    let config = ExperimentConfig {
        name: "events".to_string(),
        total_episodes: 5,
        episode_tick_ms: 1,
        ..ExperimentConfig::default()
    };
    let uuid = supervisor.start("events", config).await.unwrap();
    let mut events = supervisor.subscribe(uuid).await.unwrap();

    let mut episode_completed_count = 0;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while episode_completed_count < 5 && tokio::time::Instant::now() < deadline {
        if let Ok(envelope) =
            tokio::time::timeout(Duration::from_millis(500), events.recv()).await.unwrap_or(Err(
                tokio::sync::broadcast::error::RecvError::Closed,
            ))
        {
            if matches!(envelope.event, drift_runtime::ExperimentEvent::EpisodeCompleted { .. }) {
                episode_completed_count += 1;
            }
        }
    }
    assert_eq!(episode_completed_count, 5);
}
