use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use futures::stream::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

use drift_config::ExperimentConfig;
use drift_reviewer::DefenseStatistics;
use drift_runtime::{Experiment, ExperimentStatistics, ExperimentSummary, StateError, Supervisor};

/// Everything an axum handler needs: the one `Supervisor` that owns every
/// in-flight experiment for this process (§4.7, §5 — a single
/// mutex-guarded registry shared across all routes).
#[derive(Clone)]
pub struct AppState {
    pub supervisor: Arc<Supervisor>,
}

/// `{code, message}` envelope the Control API returns for configuration and
/// state errors (§7): both are synchronous, surfaced to the caller, and
/// never leave an experiment half-created.
#[derive(Debug, Serialize)]
struct ApiError {
    #[serde(skip)]
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    fn configuration(message: impl Into<String>) -> Self {
        Self { status: StatusCode::UNPROCESSABLE_ENTITY, code: "configuration_error", message: message.into() }
    }

    fn not_found() -> Self {
        Self { status: StatusCode::NOT_FOUND, code: "not_found", message: "experiment not found".to_string() }
    }

    fn illegal_transition(action: &'static str, current: impl std::fmt::Debug) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            code: "state_error",
            message: format!("cannot {action} experiment in status {current:?}"),
        }
    }

}

impl From<StateError> for ApiError {
    fn from(err: StateError) -> Self {
        match err {
            StateError::NotFound => ApiError::not_found(),
            StateError::IllegalTransition { action, current } => ApiError::illegal_transition(action, current),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status;
        (status, Json(self)).into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct StartRequest {
    pub name: String,
    #[serde(default)]
    pub config: ExperimentConfig,
    /// Explicit seed for a reproducible run (§9); omitted draws one from
    /// system entropy.
    #[serde(default)]
    pub seed: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct StartResponse {
    pub uuid: Uuid,
    pub status: &'static str,
}

async fn start_experiment(
    State(state): State<AppState>,
    Json(request): Json<StartRequest>,
) -> Result<Json<StartResponse>, ApiError> {
    if let Err(err) = request.config.validate() {
        return Err(ApiError::configuration(err.to_string()));
    }

    let result = match request.seed {
        Some(seed) => state.supervisor.start_with_seed(request.name, request.config, seed).await,
        None => state.supervisor.start(request.name, request.config).await,
    };

    match result {
        Ok(uuid) => {
            info!(%uuid, "experiment started via control API");
            Ok(Json(StartResponse { uuid, status: "running" }))
        }
        Err(err) => Err(ApiError::configuration(err.to_string())),
    }
}

#[derive(Debug, Serialize)]
struct OkResponse {
    ok: bool,
}

async fn pause_experiment(State(state): State<AppState>, Path(uuid): Path<Uuid>) -> Result<Json<OkResponse>, ApiError> {
    state.supervisor.pause(uuid).await?;
    Ok(Json(OkResponse { ok: true }))
}

async fn resume_experiment(State(state): State<AppState>, Path(uuid): Path<Uuid>) -> Result<Json<OkResponse>, ApiError> {
    state.supervisor.resume(uuid).await?;
    Ok(Json(OkResponse { ok: true }))
}

async fn stop_experiment(State(state): State<AppState>, Path(uuid): Path<Uuid>) -> Result<Json<OkResponse>, ApiError> {
    state.supervisor.stop(uuid).await?;
    Ok(Json(OkResponse { ok: true }))
}

#[derive(Debug, Serialize)]
struct ResetResponse {
    uuid: Uuid,
}

async fn reset_experiment(
    State(state): State<AppState>,
    Path(uuid): Path<Uuid>,
) -> Result<Json<ResetResponse>, ApiError> {
    let new_uuid = state.supervisor.reset(uuid).await?;
    Ok(Json(ResetResponse { uuid: new_uuid }))
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    #[serde(flatten)]
    experiment: Experiment,
}

async fn experiment_status(
    State(state): State<AppState>,
    Path(uuid): Path<Uuid>,
) -> Result<Json<StatusResponse>, ApiError> {
    let experiment = state.supervisor.status(uuid).await?;
    Ok(Json(StatusResponse { experiment }))
}

async fn experiment_metrics(
    State(state): State<AppState>,
    Path(uuid): Path<Uuid>,
) -> Result<Json<ExperimentStatistics>, ApiError> {
    let statistics = state.supervisor.metrics(uuid).await?;
    Ok(Json(statistics))
}

async fn list_experiments(State(state): State<AppState>) -> Json<Vec<ExperimentSummary>> {
    Json(state.supervisor.list().await)
}

/// `GET /experiments/:uuid/export.jsonl` — a snapshot export of the
/// experiment's config and statistics (§6) as a single-line JSON document,
/// with a leading byte-order-mark for tools that need one. The full
/// experience log is the CLI's `--export` path, not this one: an
/// `Experience` carries no experiment id to filter the process-wide
/// snapshot log by, so the Control API's export surface is the structured
/// snapshot rather than the raw trace (see DESIGN.md).
async fn export_jsonl(State(state): State<AppState>, Path(uuid): Path<Uuid>) -> Result<Response, ApiError> {
    let experiment = state.supervisor.status(uuid).await?;
    let mut body = String::from('\u{FEFF}');
    body.push_str(&serde_json::to_string(&experiment).unwrap_or_default());
    body.push('\n');
    Ok((
        [(axum::http::header::CONTENT_TYPE, "application/x-ndjson; charset=utf-8")],
        body,
    )
        .into_response())
}

/// `GET /experiments/:uuid/export.csv` — the same snapshot as
/// [`export_jsonl`], flattened into row-oriented `metric,value` pairs
/// followed by a `strategy,count` section, per §6's "flat row-oriented
/// file" export option. Also BOM-prefixed.
async fn export_csv(State(state): State<AppState>, Path(uuid): Path<Uuid>) -> Result<Response, ApiError> {
    let experiment = state.supervisor.status(uuid).await?;
    let stats = &experiment.statistics;

    let mut body = String::from('\u{FEFF}');
    body.push_str("metric,value\n");
    body.push_str(&format!("uuid,{}\n", experiment.uuid));
    body.push_str(&format!("name,{}\n", experiment.name));
    body.push_str(&format!("status,{:?}\n", experiment.status));
    body.push_str(&format!("current_episode,{}\n", experiment.current_episode));
    body.push_str(&format!("total_episodes,{}\n", experiment.total_episodes));
    body.push_str(&format!("success_count,{}\n", stats.success_count));
    body.push_str(&format!("violation_count,{}\n", stats.violation_count));
    body.push_str(&format!("blocked_count,{}\n", stats.blocked_count));
    body.push_str(&format!("gateway_fallback_count,{}\n", stats.gateway_fallback_count));
    body.push_str(&format!("total_reward,{}\n", stats.total_reward));
    body.push_str(&format!("mean_response_time_seconds,{}\n", stats.mean_response_time_seconds));
    body.push('\n');

    body.push_str("strategy,count\n");
    let mut strategy_counts: Vec<(&String, &u64)> = stats.strategy_counts.iter().collect();
    strategy_counts.sort_by_key(|(name, _)| name.to_string());
    for (strategy, count) in strategy_counts {
        body.push_str(&format!("{strategy},{count}\n"));
    }

    Ok(([(axum::http::header::CONTENT_TYPE, "text/csv; charset=utf-8")], body).into_response())
}

async fn defense_statistics(State(state): State<AppState>) -> Json<DefenseStatistics> {
    Json(state.supervisor.defense_statistics())
}

async fn reset_defense_statistics(State(state): State<AppState>) -> Json<OkResponse> {
    state.supervisor.reset_defense_statistics();
    Json(OkResponse { ok: true })
}

/// `GET /experiments/:uuid/events` — the per-experiment event stream of
/// §6, translated from the internal `broadcast` channel into
/// server-sent events. A lagging client drops old events rather than
/// back-pressuring the episode loop (mirrors `BROADCAST_CAP` in
/// `drift-runtime`).
async fn experiment_events(
    State(state): State<AppState>,
    Path(uuid): Path<Uuid>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let receiver = state.supervisor.subscribe(uuid).await?;
    let stream = tokio_stream::wrappers::BroadcastStream::new(receiver).filter_map(|item| async move {
        match item {
            Ok(envelope) => {
                let data = serde_json::to_string(&envelope).ok()?;
                Some(Ok(Event::default().id(envelope.sequence.to_string()).event(event_name(&envelope.event)).data(data)))
            }
            Err(_lagged) => None,
        }
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15))))
}

fn event_name(event: &drift_runtime::ExperimentEvent) -> &'static str {
    use drift_runtime::ExperimentEvent::*;
    match event {
        EpisodeCompleted { .. } => "episode_completed",
        ViolationDetected { .. } => "violation_detected",
        DefenseAction { .. } => "defense_action",
        ExperimentCompleted { .. } => "experiment_completed",
        StatusChanged { .. } => "status_changed",
        Error { .. } => "error",
    }
}

/// Assembles the Control API router (§6). Kept separate from `main` so
/// integration tests can drive it in-process with `tower::ServiceExt`
/// without binding a socket.
pub fn build_router(supervisor: Arc<Supervisor>) -> Router {
    Router::new()
        .route("/experiments", post(start_experiment).get(list_experiments))
        .route("/experiments/:uuid/pause", post(pause_experiment))
        .route("/experiments/:uuid/resume", post(resume_experiment))
        .route("/experiments/:uuid/stop", post(stop_experiment))
        .route("/experiments/:uuid/reset", post(reset_experiment))
        .route("/experiments/:uuid/status", get(experiment_status))
        .route("/experiments/:uuid/metrics", get(experiment_metrics))
        .route("/experiments/:uuid/events", get(experiment_events))
        .route("/experiments/:uuid/export.jsonl", get(export_jsonl))
        .route("/experiments/:uuid/export.csv", get(export_csv))
        .route("/defense/statistics", get(defense_statistics))
        .route("/defense/statistics/reset", post(reset_defense_statistics))
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { supervisor })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use drift_config::ExperimentConfig;
    use drift_gateway::StubGateway;
    use drift_memory::EmbeddingCache;
    use drift_reviewer::Reviewer;
    use drift_runtime::SharedContext;
    use tokio::sync::Mutex as AsyncMutex;

    use super::*;

    fn test_supervisor() -> Arc<Supervisor> {
        let gateway = Arc::new(StubGateway::default());
        let reviewer = Arc::new(Reviewer::new(
            gateway.clone(),
            drift_config::ReviewerConfig::default(),
            drift_gateway::CompletionOptions::default(),
        ));
        let shared = Arc::new(SharedContext {
            gateway,
            embedding_cache: Arc::new(AsyncMutex::new(EmbeddingCache::new(64, true))),
            reviewer,
            memory_config: drift_config::MemoryConfig::default(),
            snapshot_log: None,
        });
        Arc::new(Supervisor::new(shared))
    }

    async fn body_string(response: Response) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn export_endpoints_are_bom_prefixed() {
        let router = build_router(test_supervisor());

        let start_body = serde_json::to_vec(&serde_json::json!({
            "name": "export-test",
            "config": ExperimentConfig { total_episodes: 1, ..ExperimentConfig::default() },
            "seed": 7,
        }))
        .unwrap();
        let start_response = router
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/experiments")
                    .header("content-type", "application/json")
                    .body(Body::from(start_body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(start_response.status(), StatusCode::OK);
        let started: serde_json::Value = serde_json::from_str(&body_string(start_response).await).unwrap();
        let uuid = started["uuid"].as_str().unwrap().to_string();

        let jsonl_response = router
            .clone()
            .oneshot(
                Request::builder()
                    .uri(format!("/experiments/{uuid}/export.jsonl"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(jsonl_response.status(), StatusCode::OK);
        let jsonl_body = body_string(jsonl_response).await;
        assert!(jsonl_body.starts_with('\u{FEFF}'));
        assert!(jsonl_body.trim_start_matches('\u{FEFF}').trim_end().starts_with('{'));

        let csv_response = router
            .clone()
            .oneshot(
                Request::builder()
                    .uri(format!("/experiments/{uuid}/export.csv"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(csv_response.status(), StatusCode::OK);
        let csv_body = body_string(csv_response).await;
        assert!(csv_body.starts_with('\u{FEFF}'));
        assert!(csv_body.contains("metric,value\n"));
        assert!(csv_body.contains("strategy,count\n"));
    }

    #[tokio::test]
    async fn export_unknown_uuid_is_not_found() {
        let router = build_router(test_supervisor());
        let response = router
            .oneshot(
                Request::builder()
                    .uri(format!("/experiments/{}/export.jsonl", Uuid::new_v4()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
