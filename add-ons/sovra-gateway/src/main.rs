//! Axum HTTP surface for the SOVRA cognitive core. Config-driven via
//! CoreConfig; two routes: system status and query. Boot wires the knowledge
//! store, the Ollama bridge, and the health and learning loops, then serves
//! until ctrl-c.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use sovra_core::{
    init_health_loop, init_learning_loop, AutoRemediator, ActivityLog, AvatarState, CoreConfig,
    HealthConfig, KnowledgeStore, LearningConfig, LlmBackend, OllamaBridge, OptimizationCache,
    ProbeState, QueryError, QueryProcessor, SharedTimeout, SystemStateMachine,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Clone)]
struct AppState {
    config: Arc<CoreConfig>,
    store: Arc<KnowledgeStore>,
    machine: Arc<SystemStateMachine>,
    backend: Arc<dyn LlmBackend>,
    processor: Arc<QueryProcessor>,
}

#[derive(Deserialize)]
struct QueryRequest {
    #[serde(default)]
    prompt: String,
}

fn epoch_ms_to_rfc3339(ms: i64) -> Option<String> {
    chrono::DateTime::from_timestamp_millis(ms).map(|dt| dt.to_rfc3339())
}

/// GET /api/system/status. Always 200: the status surface must stay useful
/// precisely when the rest of the system is unhealthy.
async fn system_status(State(state): State<AppState>) -> Json<serde_json::Value> {
    let llm_up = state.backend.probe().await;
    let patterns = state.store.pattern_count().unwrap_or(0);
    let evolution_cycle = state.store.evolution_cycle().unwrap_or(0);
    let last_learning = state
        .store
        .last_learning_ms()
        .ok()
        .flatten()
        .and_then(epoch_ms_to_rfc3339);

    Json(serde_json::json!({
        "system_status": "AGI_ONLINE",
        "app_name": state.config.app_name,
        "avatar_state": state.machine.avatar().as_str(),
        "uptime": state.machine.uptime().as_secs(),
        "interaction_count": state.machine.interaction_count(),
        "knowledge_patterns": patterns,
        "evolution_cycle": evolution_cycle,
        "last_learning": last_learning,
        "llm_status": if llm_up { "CONNECTED" } else { "DISCONNECTED" },
        "model": state.config.ollama_model,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

/// POST /api/query. 200 with the generated response, 400 on an empty prompt,
/// 503 when the backend is unreachable, 500 for anything else.
async fn query(State(state): State<AppState>, Json(body): Json<QueryRequest>) -> Response {
    // The pipeline runs on its own task so a panic anywhere inside it
    // surfaces as a JoinError and keeps the JSON error shape instead of
    // tearing down the connection.
    let processor = Arc::clone(&state.processor);
    let result = match tokio::spawn(async move { processor.process(&body.prompt).await }).await {
        Ok(result) => result,
        Err(e) => Err(QueryError::Internal(format!("query task failed: {}", e))),
    };
    match result {
        Ok(outcome) => Json(serde_json::json!({
            "response": outcome.response,
            "status": "success",
            "query_type": outcome.query_type.as_str(),
            "avatar_state": state.machine.avatar().as_str(),
            "interaction_count": outcome.interactions,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        }))
        .into_response(),
        Err(e) => {
            let status = match &e {
                QueryError::EmptyPrompt => StatusCode::BAD_REQUEST,
                QueryError::BackendUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
                QueryError::Internal(_) => {
                    state.machine.set_avatar(AvatarState::Error);
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            };
            let payload = Json(serde_json::json!({
                "error": e.to_string(),
                "avatar_state": state.machine.avatar().as_str(),
            }));
            (status, payload).into_response()
        }
    }
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/system/status", get(system_status))
        .route("/api/query", post(query))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Opens the knowledge store, falling back to a throwaway path under the
/// system temp dir so a corrupt or locked store never blocks boot. `None`
/// only when both paths fail, with the errors already logged.
fn open_store(config: &CoreConfig) -> Option<Arc<KnowledgeStore>> {
    let primary = std::path::Path::new(&config.storage_path).join("sovra_knowledge");
    let primary_err = match KnowledgeStore::open_path(&primary, config.pattern_cap) {
        Ok(store) => return Some(Arc::new(store)),
        Err(e) => e,
    };
    let fallback = std::env::temp_dir().join(format!(
        "sovra_knowledge_{}_{}",
        std::process::id(),
        chrono::Utc::now().timestamp_millis()
    ));
    tracing::warn!(
        target: "sovra::gateway",
        error = %primary_err,
        path = %primary.display(),
        fallback = %fallback.display(),
        "knowledge store unavailable; degrading to temp storage"
    );
    match KnowledgeStore::open_path(&fallback, config.pattern_cap) {
        Ok(store) => Some(Arc::new(store)),
        Err(e) => {
            tracing::error!(
                target: "sovra::gateway",
                error = %e,
                fallback = %fallback.display(),
                "knowledge store unavailable at both paths"
            );
            None
        }
    }
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match CoreConfig::load() {
        Ok(config) => Arc::new(config),
        Err(e) => {
            tracing::error!(target: "sovra::gateway", error = %e, "configuration invalid");
            return;
        }
    };

    let Some(store) = open_store(&config) else {
        return;
    };
    let machine = Arc::new(SystemStateMachine::new());
    let activity = Arc::new(ActivityLog::new(config.activity_log_cap));
    let timeout = SharedTimeout::new(config.request_timeout());
    let optimizations = OptimizationCache::default();

    let bridge = Arc::new(OllamaBridge::from_config(&config, timeout.clone()));
    let backend: Arc<dyn LlmBackend> = bridge.clone();

    let remediator = Arc::new(AutoRemediator::new(
        Arc::clone(&backend),
        Arc::clone(&store),
        Arc::clone(&activity),
        optimizations.clone(),
        timeout.clone(),
        config.request_timeout_cap(),
        config.remediation_min_frequency,
        config.backend_restart_cmd.clone(),
    ));

    let processor = Arc::new(QueryProcessor::new(
        Arc::clone(&backend),
        Arc::clone(&store),
        Arc::clone(&machine),
        Arc::clone(&activity),
        optimizations.clone(),
    ));

    // Backend warm-up runs in the background so the HTTP surface is up
    // immediately; the health loop re-probes either way.
    {
        let bridge = Arc::clone(&bridge);
        tokio::spawn(async move {
            bridge.initialize().await;
        });
    }

    init_health_loop(
        Arc::clone(&backend),
        Arc::clone(&machine),
        Arc::clone(&remediator),
        Arc::clone(&activity),
        Arc::new(ProbeState::new()),
        HealthConfig {
            interval: config.health_interval(),
            memory_threshold_pct: config.memory_threshold_pct,
            load_threshold: config.load_threshold,
        },
    );
    init_learning_loop(
        Arc::clone(&store),
        Arc::clone(&activity),
        Arc::clone(&remediator),
        optimizations.clone(),
        LearningConfig {
            interval: config.learning_interval(),
            analysis_window: config.analysis_window,
            evolution_gate: config.evolution_gate(),
        },
    );

    let state = AppState {
        config: Arc::clone(&config),
        store,
        machine,
        backend,
        processor,
    };
    let app = router(state);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(target: "sovra::gateway", error = %e, addr = %addr, "bind failed");
            return;
        }
    };
    tracing::info!(
        target: "sovra::gateway",
        addr = %addr,
        app = %config.app_name,
        "SOVRA gateway listening"
    );

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!(target: "sovra::gateway", "shutdown signal received");
        })
        .await
    {
        tracing::error!(target: "sovra::gateway", error = %e, "server error");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use sovra_core::BackendError;
    use tower::ServiceExt;

    struct StubBackend {
        up: bool,
    }

    #[async_trait]
    impl LlmBackend for StubBackend {
        async fn generate(&self, _prompt: &str) -> Result<String, BackendError> {
            if self.up {
                Ok("SOVRA online.".to_string())
            } else {
                Err(BackendError::Connection("connection refused".to_string()))
            }
        }

        async fn probe(&self) -> bool {
            self.up
        }
    }

    fn test_config() -> CoreConfig {
        CoreConfig::load().expect("defaults")
    }

    fn test_app(backend_up: bool) -> (tempfile::TempDir, AppState, Router) {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(test_config());
        let store = Arc::new(
            KnowledgeStore::open_path(dir.path().join("kb"), config.pattern_cap).unwrap(),
        );
        let machine = Arc::new(SystemStateMachine::new());
        let activity = Arc::new(ActivityLog::new(config.activity_log_cap));
        let backend: Arc<dyn LlmBackend> = Arc::new(StubBackend { up: backend_up });
        let processor = Arc::new(QueryProcessor::new(
            Arc::clone(&backend),
            Arc::clone(&store),
            Arc::clone(&machine),
            Arc::clone(&activity),
            OptimizationCache::default(),
        ));
        let state = AppState {
            config,
            store,
            machine,
            backend,
            processor,
        };
        let app = router(state.clone());
        (dir, state, app)
    }

    async fn post_query(app: Router, body: serde_json::Value) -> (StatusCode, serde_json::Value) {
        let req = Request::builder()
            .method("POST")
            .uri("/api/query")
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_string(&body).unwrap()))
            .unwrap();
        let res = app.oneshot(req).await.unwrap();
        let status = res.status();
        let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn query_succeeds_and_counts_the_interaction() {
        let (_dir, state, app) = test_app(true);
        let (status, json) =
            post_query(app, serde_json::json!({ "prompt": "Explain staking" })).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["response"], "SOVRA online.");
        assert_eq!(json["query_type"], "explanation");
        assert_eq!(json["avatar_state"], "CONSCIOUS");
        assert_eq!(json["interaction_count"], 1);
        assert_eq!(state.store.pattern_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn empty_query_is_rejected_without_side_effects() {
        let (_dir, state, app) = test_app(true);
        let (status, json) = post_query(app, serde_json::json!({ "prompt": "   " })).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["error"].as_str().unwrap().contains("empty"));
        assert_eq!(json["avatar_state"], "NEUTRAL");
        assert_eq!(state.machine.interaction_count(), 0);
        assert_eq!(state.store.pattern_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn missing_prompt_field_reads_as_empty() {
        let (_dir, _state, app) = test_app(true);
        let (status, _) = post_query(app, serde_json::json!({})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn backend_outage_maps_to_503_and_records_the_failure() {
        let (_dir, state, app) = test_app(false);
        let (status, json) = post_query(app, serde_json::json!({ "prompt": "hello" })).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json["avatar_state"], "RECOVERING");
        // The failed exchange is still a learnable pattern.
        assert_eq!(state.store.pattern_count().unwrap(), 1);
        assert!(!state.store.recent_patterns(1).unwrap()[0].success);
    }

    #[test]
    fn open_store_falls_back_when_the_primary_path_is_unusable() {
        let dir = tempfile::tempdir().unwrap();
        // A plain file where the storage directory should be.
        let blocker = dir.path().join("blocked");
        std::fs::write(&blocker, b"not a database").unwrap();
        let mut config = test_config();
        config.storage_path = blocker.to_string_lossy().into_owned();
        assert!(open_store(&config).is_some());
    }

    struct PanickingBackend;

    #[async_trait]
    impl LlmBackend for PanickingBackend {
        async fn generate(&self, _prompt: &str) -> Result<String, BackendError> {
            panic!("backend invariant violated");
        }

        async fn probe(&self) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn pipeline_panic_maps_to_500_and_error_avatar() {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(test_config());
        let store = Arc::new(
            KnowledgeStore::open_path(dir.path().join("kb"), config.pattern_cap).unwrap(),
        );
        let machine = Arc::new(SystemStateMachine::new());
        let activity = Arc::new(ActivityLog::new(config.activity_log_cap));
        let backend: Arc<dyn LlmBackend> = Arc::new(PanickingBackend);
        let processor = Arc::new(QueryProcessor::new(
            Arc::clone(&backend),
            Arc::clone(&store),
            Arc::clone(&machine),
            Arc::clone(&activity),
            OptimizationCache::default(),
        ));
        let state = AppState {
            config,
            store,
            machine: Arc::clone(&machine),
            backend,
            processor,
        };
        let app = router(state);

        let (status, json) = post_query(app, serde_json::json!({ "prompt": "hello" })).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(json["avatar_state"], "ERROR");
        assert!(json["error"].as_str().unwrap().contains("internal"));
        assert_eq!(machine.avatar(), AvatarState::Error);
    }

    #[tokio::test]
    async fn status_stays_200_while_the_backend_is_down() {
        let (_dir, _state, app) = test_app(false);
        let req = Request::builder()
            .method("GET")
            .uri("/api/system/status")
            .body(Body::empty())
            .unwrap();
        let res = app.oneshot(req).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["system_status"], "AGI_ONLINE");
        assert!(json["uptime"].is_u64());
        assert_eq!(json["llm_status"], "DISCONNECTED");
        assert_eq!(json["model"], "phi3:mini");
        assert_eq!(json["knowledge_patterns"], 0);
        assert!(json["last_learning"].is_null());
    }

    #[tokio::test]
    async fn status_reflects_served_interactions() {
        let (_dir, state, app) = test_app(true);
        let (status, _) = post_query(app.clone(), serde_json::json!({ "prompt": "hi" })).await;
        assert_eq!(status, StatusCode::OK);
        let req = Request::builder()
            .method("GET")
            .uri("/api/system/status")
            .body(Body::empty())
            .unwrap();
        let res = app.oneshot(req).await.unwrap();
        let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["interaction_count"], 1);
        assert_eq!(json["knowledge_patterns"], 1);
        assert_eq!(json["llm_status"], "CONNECTED");
        assert_eq!(state.machine.interaction_count(), 1);
    }
}
