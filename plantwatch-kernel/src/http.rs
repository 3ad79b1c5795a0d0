/**
 * API D'ADMINISTRATION PLANTWATCH
 *
 * ROUTES :
 * - GET  /health          : liveness, toujours accessible
 * - GET  /system/health   : état du kernel (MQTT, jobs, buffer, flush)
 * - GET  /jobs            : jobs actifs avec compteurs d'exécutions
 * - GET  /jobs/{plan_id}  : détail d'un job
 * - POST /commands        : commande de plan, transmise au bridge (202)
 *
 * SÉCURITÉ :
 * Header `x-api-key` obligatoire sauf sur /health. Sans clé configurée
 * (`PLANTWATCH_API_KEY`), toutes les routes protégées répondent 401.
 */

use crate::bridge::{PlanCommand, SharedBridge};
use crate::health::{HealthTracker, KernelHealth};
use crate::ingest::SharedIngestor;
use crate::scheduler::{JobView, SharedJobRegistry};
use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use std::sync::Arc;
use tracing::warn;

#[derive(Clone)]
pub struct AppState {
    pub registry: SharedJobRegistry,
    pub ingestor: SharedIngestor,
    pub bridge: SharedBridge,
    pub health_tracker: HealthTracker,
    pub api_key: Option<Arc<str>>,
}

async fn require_api_key(State(app): State<AppState>, req: Request, next: Next) -> Result<Response, StatusCode> {
    let path = req.uri().path();

    if path == "/health" {
        return Ok(next.run(req).await);
    }

    let Some(expected) = app.api_key.as_deref() else {
        warn!(path, "PLANTWATCH_API_KEY not set, API access denied");
        return Err(StatusCode::UNAUTHORIZED);
    };

    let ok = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == expected)
        .unwrap_or(false);

    if !ok {
        warn!(path, "rejected request with missing or wrong API key");
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/system/health", get(get_system_health))
        .route("/jobs", get(list_jobs))
        .route("/jobs/{plan_id}", get(get_job))
        .route("/commands", post(submit_command))
        .layer(middleware::from_fn_with_state(app_state.clone(), require_api_key))
        .with_state(app_state)
}

// GET /system/health
async fn get_system_health(State(app): State<AppState>) -> Json<KernelHealth> {
    Json(app.health_tracker.get_health(&app.registry, &app.ingestor))
}

// GET /jobs
async fn list_jobs(State(app): State<AppState>) -> Json<Vec<JobView>> {
    Json(app.registry.list_jobs())
}

// GET /jobs/{plan_id}
async fn get_job(State(app): State<AppState>, Path(plan_id): Path<u64>) -> Result<Json<JobView>, StatusCode> {
    app.registry.job(plan_id).map(Json).ok_or(StatusCode::NOT_FOUND)
}

// POST /commands
async fn submit_command(
    State(app): State<AppState>,
    Json(command): Json<PlanCommand>,
) -> (StatusCode, Json<serde_json::Value>) {
    let plan_id = command.plan_id();
    let action = command.action();
    match app.bridge.submit(command).await {
        Ok(()) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({ "ok": true, "plan_id": plan_id, "action": action })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "ok": false, "msg": e.to_string() })),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::LifecycleBridge;
    use crate::collector::{CollectError, ReadingSource};
    use crate::ingest::BatchIngestor;
    use crate::models::{CanonicalReading, CollectionPlan};
    use crate::publisher::{PublishError, ReadingPublisher};
    use crate::scheduler::JobRegistry;
    use crate::store::{ReadingStore, StorageError};
    use async_trait::async_trait;
    use std::time::Duration;

    struct FailingSource;

    #[async_trait]
    impl ReadingSource for FailingSource {
        async fn collect(&self, plan: &CollectionPlan) -> Result<CanonicalReading, CollectError> {
            Err(CollectError::CollectionFailed {
                attempts: 1,
                last_error: format!("{} unreachable", plan.endpoint),
            })
        }
    }

    struct NullPublisher;

    #[async_trait]
    impl ReadingPublisher for NullPublisher {
        async fn publish(&self, _reading: &CanonicalReading) -> Result<(), PublishError> {
            Ok(())
        }
    }

    struct NullStore;

    #[async_trait]
    impl ReadingStore for NullStore {
        async fn insert_batch(&self, readings: &[CanonicalReading]) -> Result<usize, StorageError> {
            Ok(readings.len())
        }
    }

    async fn serve(api_key: Option<&str>) -> (String, AppState) {
        let registry = Arc::new(JobRegistry::new(Arc::new(FailingSource), Arc::new(NullPublisher)));
        let ingestor = Arc::new(BatchIngestor::with_limits(Arc::new(NullStore), 50, Duration::from_secs(10)));
        let bridge = Arc::new(LifecycleBridge::start(registry.clone(), None, 2));
        let state = AppState {
            registry,
            ingestor,
            bridge,
            health_tracker: HealthTracker::new(),
            api_key: api_key.map(Arc::from),
        };

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = build_router(state.clone());
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        (format!("http://{addr}"), state)
    }

    #[tokio::test]
    async fn health_is_public_and_rest_needs_key() {
        let (base, _state) = serve(Some("secret")).await;
        let client = reqwest::Client::new();

        let res = client.get(format!("{base}/health")).send().await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);

        let res = client.get(format!("{base}/jobs")).send().await.unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

        let res = client
            .get(format!("{base}/jobs"))
            .header("x-api-key", "wrong")
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

        let res = client
            .get(format!("{base}/system/health"))
            .header("x-api-key", "secret")
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let health: KernelHealth = res.json().await.unwrap();
        assert_eq!(health.active_jobs, 0);
    }

    #[tokio::test]
    async fn missing_server_key_denies_everything_but_health() {
        let (base, _state) = serve(None).await;
        let res = reqwest::Client::new()
            .get(format!("{base}/jobs"))
            .header("x-api-key", "")
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn posted_command_schedules_a_job() {
        let (base, state) = serve(Some("k")).await;
        let client = reqwest::Client::new();

        let res = client
            .post(format!("{base}/commands"))
            .header("x-api-key", "k")
            .json(&serde_json::json!({
                "action": "created",
                "plan": { "id": 12, "machine_id": 3, "interval_secs": 60, "endpoint": "http://m3.local/data" }
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::ACCEPTED);
        state.bridge.sync().await.unwrap();

        let job: serde_json::Value = client
            .get(format!("{base}/jobs/12"))
            .header("x-api-key", "k")
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(job["machine_id"], 3);
        assert_eq!(job["method"], "GET");

        let res = client
            .get(format!("{base}/jobs/99"))
            .header("x-api-key", "k")
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
        state.registry.shutdown();
    }
}
