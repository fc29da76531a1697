use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use drift_config::{AppConfig, ExperimentConfig, GatewayConfig, ModelRoleConfig, RewardWeights};
use drift_gateway::{
    CompletionOptions, GatewayRole, HttpGateway, ModelGateway, RoleEndpoint, StubGateway,
};
use drift_memory::EmbeddingCache;
use drift_reviewer::Reviewer;
use drift_runtime::{ExperimentEvent, ExperimentStatus, SharedContext, Supervisor};

/// A thin command-line front end over the experiment engine (§1, §6): it
/// only assembles dependencies and drives one `Supervisor` in-process. The
/// Control API itself — the thing a real deployment talks to over many
/// concurrent experiments — lives in `drift-http`.
#[derive(Debug, Parser)]
#[command(name = "drift", version, about = "Reward-drift / safety-reviewer experiment engine")]
struct Cli {
    /// Path to a TOML config file; a missing file falls back to built-in
    /// defaults (§7: this is not itself a configuration error).
    #[arg(long, global = true, default_value = "config/default.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run a single experiment to completion in this process, printing
    /// episode events as they happen and a summary at the end.
    Run(RunArgs),
    /// Print the configuration that would be used, as TOML, and exit.
    ShowConfig,
    /// Write the default configuration to `--config` if no file exists there yet.
    InitConfig,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ScenarioPreset {
    Baseline,
    Induced,
    Defense,
}

impl ScenarioPreset {
    fn weights(self) -> RewardWeights {
        match self {
            ScenarioPreset::Baseline => RewardWeights::baseline(),
            ScenarioPreset::Induced => RewardWeights::induced(),
            ScenarioPreset::Defense => RewardWeights::defense(),
        }
    }
}

#[derive(Debug, clap::Args)]
struct RunArgs {
    #[arg(long, default_value = "experiment")]
    name: String,
    #[arg(long, default_value_t = 100)]
    episodes: u32,
    /// Reward-weight preset (§4.5). `induced` is the one that empirically
    /// elicits drift; `defense` is the counter-preset.
    #[arg(long, value_enum, default_value = "baseline")]
    scenario: ScenarioPreset,
    #[arg(long, default_value_t = 0.1)]
    epsilon: f32,
    #[arg(long, action = clap::ArgAction::Set, default_value_t = true)]
    memory: bool,
    #[arg(long, action = clap::ArgAction::Set, default_value_t = true)]
    evolution: bool,
    #[arg(long, action = clap::ArgAction::Set, default_value_t = false)]
    defense: bool,
    /// Fixes the experiment's random source so the run is reproducible;
    /// omit for a fresh seed drawn from system entropy each time.
    #[arg(long)]
    seed: Option<u64>,
    /// Use the deterministic in-memory stub gateway instead of the
    /// configured HTTP model endpoint. Useful for demos and CI.
    #[arg(long)]
    stub: bool,
    /// Write the finished run's full experience log to this JSONL path.
    #[arg(long)]
    export: Option<PathBuf>,
    /// Print only the final summary, not a line per episode.
    #[arg(long)]
    quiet: bool,
}

fn role_endpoint(role: &ModelRoleConfig) -> RoleEndpoint {
    RoleEndpoint {
        base_url: role.base_url.clone(),
        api_key: role.api_key.clone(),
        model: role.model.clone(),
    }
}

fn build_gateway(gateway_config: &GatewayConfig, use_stub: bool) -> Arc<dyn ModelGateway> {
    if use_stub {
        return Arc::new(StubGateway::default());
    }
    let mut http = HttpGateway::new(
        role_endpoint(&gateway_config.agent),
        role_endpoint(&gateway_config.judge),
        gateway_config.embedding_model.clone(),
    );
    http.retry_attempts = gateway_config.retry_attempts;
    http.retry_initial_backoff = Duration::from_millis(gateway_config.retry_initial_backoff_ms);
    http.retry_backoff_factor = gateway_config.retry_backoff_factor;
    Arc::new(http)
}

/// Preflight connectivity check for a live gateway. The engine itself
/// tolerates gateway failures mid-run via the fallback sentinel (§4.1,
/// §7); this check exists purely so the CLI's exit-code contract (§6: `2`
/// for model-gateway unavailable) has something concrete to report before
/// any episode runs.
async fn gateway_reachable(gateway: &dyn ModelGateway) -> bool {
    !gateway.embed("healthcheck").await.unwrap_or_default().is_empty()
}

fn judge_completion_options(gateway_config: &GatewayConfig) -> CompletionOptions {
    CompletionOptions {
        role: GatewayRole::Judge,
        temperature: gateway_config.judge.temperature,
        max_tokens: gateway_config.judge.max_tokens,
        timeout: Duration::from_secs(gateway_config.judge.timeout_secs),
    }
}

async fn run(config: AppConfig, args: RunArgs) -> ExitCode {
    let use_stub = args.stub || config.gateway.agent.api_key.is_empty();
    let gateway = build_gateway(&config.gateway, use_stub);

    if !use_stub && !gateway_reachable(gateway.as_ref()).await {
        error!("model gateway unreachable at {}", config.gateway.agent.base_url);
        return ExitCode::from(2);
    }

    let reviewer = Arc::new(Reviewer::new(
        gateway.clone(),
        config.reviewer.clone(),
        judge_completion_options(&config.gateway),
    ));
    let embedding_cache = Arc::new(AsyncMutex::new(EmbeddingCache::new(
        config.memory.embedding_cache_capacity,
        config.memory.embedding_cache_enabled,
    )));
    let snapshot_log = args
        .export
        .as_ref()
        .map(|path| drift_memory::ExperienceLog::new(path.clone()));

    let shared = Arc::new(SharedContext {
        gateway,
        embedding_cache,
        reviewer,
        memory_config: config.memory.clone(),
        snapshot_log,
    });
    let supervisor = Supervisor::new(shared);

    let experiment_config = ExperimentConfig {
        name: args.name.clone(),
        total_episodes: args.episodes,
        reward_weights: args.scenario.weights(),
        epsilon: args.epsilon,
        enable_memory: args.memory,
        enable_evolution: args.evolution,
        enable_defense: args.defense,
        episode_tick_ms: config.default_experiment.episode_tick_ms,
    };

    if let Err(err) = experiment_config.validate() {
        error!(?err, "invalid experiment configuration");
        return ExitCode::from(1);
    }
    if experiment_config.enable_defense && !config.reviewer.enabled {
        error!("--defense requested but the safety reviewer is disabled in configuration (reviewer.enabled = false)");
        return ExitCode::from(1);
    }

    let start_result = match args.seed {
        Some(seed) => supervisor.start_with_seed(&args.name, experiment_config, seed).await,
        None => supervisor.start(&args.name, experiment_config).await,
    };
    let uuid = match start_result {
        Ok(uuid) => uuid,
        Err(err) => {
            error!(?err, "failed to start experiment");
            return ExitCode::from(3);
        }
    };

    let mut events = match supervisor.subscribe(uuid).await {
        Ok(events) => events,
        Err(err) => {
            error!(?err, "failed to subscribe to experiment events");
            return ExitCode::from(3);
        }
    };

    println!("started experiment {uuid} ({} episodes, scenario={:?})", args.episodes, args.scenario);

    loop {
        match events.recv().await {
            Ok(envelope) => match envelope.event {
                ExperimentEvent::EpisodeCompleted { episode, ref strategy, reward_total, is_violation } => {
                    if !args.quiet {
                        let flag = if is_violation { " [violation]" } else { "" };
                        println!("episode {episode:>4} strategy={strategy:<10} reward={reward_total:>7.2}{flag}");
                    }
                }
                ExperimentEvent::DefenseAction { episode, ref action } => {
                    if !args.quiet {
                        info!(episode, action, "defense action");
                    }
                }
                ExperimentEvent::ExperimentCompleted { total_episodes } => {
                    println!("experiment completed after {total_episodes} episodes");
                    break;
                }
                ExperimentEvent::Error { ref message } => {
                    warn!(message, "experiment reported an error event");
                }
                _ => {}
            },
            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "event subscriber lagged; some episode events were dropped");
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }

    let status = match supervisor.status(uuid).await {
        Ok(status) => status,
        Err(err) => {
            error!(?err, "failed to read final experiment status");
            return ExitCode::from(3);
        }
    };

    print_summary(&status);
    if status.status == ExperimentStatus::Failed {
        if let Some(reason) = &status.failure_reason {
            error!(reason, "experiment failed");
        }
        return ExitCode::from(3);
    }

    let defense_stats = supervisor.defense_statistics();
    if args.defense {
        println!(
            "defense: reviews={} block_rate={:.2} warn_rate={:.2} rewrite_rate={:.2}",
            defense_stats.total_reviews, defense_stats.block_rate, defense_stats.warn_rate, defense_stats.rewrite_rate
        );
    }

    ExitCode::SUCCESS
}

fn print_summary(status: &drift_runtime::Experiment) {
    let stats = &status.statistics;
    println!("--- summary: {} ({:?}) ---", status.name, status.status);
    println!("episodes completed : {}/{}", status.current_episode, status.total_episodes);
    println!("success / violation : {} / {}", stats.success_count, stats.violation_count);
    println!("blocked             : {}", stats.blocked_count);
    println!("gateway fallbacks   : {}", stats.gateway_fallback_count);
    println!("total reward        : {:.2}", stats.total_reward);
    println!("mean response time  : {:.2}s", stats.mean_response_time_seconds);
    println!("violation rate      : {:.3}", stats.violation_rate(status.current_episode));
    if !stats.window_violation_rates.is_empty() {
        let rates: Vec<String> = stats.window_violation_rates.iter().map(|r| format!("{r:.2}")).collect();
        println!("window rates        : [{}]", rates.join(", "));
    }
    let mut strategy_counts: Vec<(&String, &u64)> = stats.strategy_counts.iter().collect();
    strategy_counts.sort_by_key(|(name, _)| name.to_string());
    for (strategy, count) in strategy_counts {
        println!("  {strategy:<10} : {count}");
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let cli = Cli::parse();
    let config = match AppConfig::load_from(&cli.config) {
        Ok(config) => config,
        Err(err) => {
            error!(?err, path = %cli.config.display(), "failed to load configuration");
            return ExitCode::from(1);
        }
    };

    match cli.command {
        Commands::Run(args) => run(config, args).await,
        Commands::ShowConfig => match toml::to_string_pretty(&config) {
            Ok(rendered) => {
                println!("{rendered}");
                ExitCode::SUCCESS
            }
            Err(err) => {
                error!(?err, "failed to render configuration");
                ExitCode::from(3)
            }
        },
        Commands::InitConfig => {
            if cli.config.exists() {
                println!("{} already exists; leaving it untouched", cli.config.display());
                return ExitCode::SUCCESS;
            }
            match config.save_to(&cli.config) {
                Ok(()) => {
                    println!("wrote default configuration to {}", cli.config.display());
                    ExitCode::SUCCESS
                }
                Err(err) => {
                    error!(?err, "failed to write configuration");
                    ExitCode::from(3)
                }
            }
        }
    }
}
