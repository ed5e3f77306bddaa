//! Status HTTP API.
//!
//! Read-only views of the session, producer health and recovery ledger,
//! plus operator endpoints to trigger recoveries by hand.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use tower_http::cors::CorsLayer;

use crate::alerts::RecentAlerts;
use crate::connector::FeedConnector;
use crate::envelope::MessageStats;
use crate::error::RecoveryError;
use crate::health::{now_millis, ProducerHealthTracker};
use crate::recovery::RecoveryCoordinator;

/// Shared state behind every route.
#[derive(Clone)]
pub struct AppState {
    pub tracker: Arc<ProducerHealthTracker>,
    pub coordinator: Arc<RecoveryCoordinator>,
    pub stats: Arc<MessageStats>,
    pub alerts: Arc<RecentAlerts>,
    pub connector: Option<Arc<FeedConnector>>,
}

/// Build the status router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/producers", get(producers))
        .route("/bets/acceptance", get(bet_acceptance))
        .route("/session", get(session))
        .route("/stats", get(stats))
        .route("/alerts", get(alerts))
        .route("/recovery", get(recovery_requests).post(full_recovery))
        .route("/recovery/:product", post(product_recovery))
        .route("/recovery/:product/events/:event_id", post(event_recovery))
        .route("/recovery/:product/stateful/:event_id", post(stateful_recovery))
        .layer(CorsLayer::permissive())
        .with_state(Arc::new(state))
}

/// Health check endpoint (liveness)
async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "oddsfeed",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Readiness check endpoint - verifies the broker session is up
async fn readiness_check(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    match &state.connector {
        Some(connector) if connector.is_connected() => Ok(Json(serde_json::json!({
            "status": "ready",
            "service": "oddsfeed",
            "feed": "connected"
        }))),
        _ => Err(StatusCode::SERVICE_UNAVAILABLE),
    }
}

async fn producers(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.tracker.reports_at(now_millis()))
}

/// 200 while accepting bets, 503 otherwise; the body carries the reason.
async fn bet_acceptance(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let verdict = state.tracker.can_accept_bets();
    let status = if verdict.accepting {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(verdict))
}

async fn session(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, AppError> {
    let connector = state
        .connector
        .as_ref()
        .ok_or_else(|| AppError::NotFound("no feed session".to_string()))?;
    Ok(Json(connector.session()))
}

async fn stats(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.stats.snapshot())
}

async fn alerts(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.alerts.records())
}

async fn recovery_requests(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "requests": state.coordinator.requests(),
        "pending_retries": state.coordinator.pending_retries(),
    }))
}

async fn full_recovery(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, AppError> {
    let report = state.coordinator.trigger_full_recovery().await?;
    Ok((StatusCode::ACCEPTED, Json(report)))
}

async fn product_recovery(
    State(state): State<Arc<AppState>>,
    Path(product): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let outcome = state.coordinator.trigger_product_recovery(&product).await?;
    Ok((StatusCode::ACCEPTED, Json(outcome)))
}

async fn event_recovery(
    State(state): State<Arc<AppState>>,
    Path((product, event_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, AppError> {
    let request_id = state
        .coordinator
        .trigger_event_recovery(&product, &event_id)
        .await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "request_id": request_id })),
    ))
}

async fn stateful_recovery(
    State(state): State<Arc<AppState>>,
    Path((product, event_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, AppError> {
    let request_id = state
        .coordinator
        .trigger_stateful_messages_recovery(&product, &event_id)
        .await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "request_id": request_id })),
    ))
}

// Error handling

#[derive(Debug)]
enum AppError {
    NotFound(String),
    BadGateway(String),
}

impl From<RecoveryError> for AppError {
    fn from(e: RecoveryError) -> Self {
        match e {
            RecoveryError::UnknownProduct(_) => AppError::NotFound(e.to_string()),
            other => AppError::BadGateway(other.to_string()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::BadGateway(msg) => (StatusCode::BAD_GATEWAY, msg),
        };

        (status, Json(serde_json::json!({
            "error": message
        }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HealthConfig, RecoveryConfig};
    use crate::error::ApiError;
    use crate::recovery::{ApiReply, MemoryRecoveryStore, RecoveryApi, RecoveryCall};
    use async_trait::async_trait;

    struct AcceptAll;

    #[async_trait]
    impl RecoveryApi for AcceptAll {
        async fn initiate(&self, _call: &RecoveryCall) -> Result<ApiReply, ApiError> {
            Ok(ApiReply {
                status: 202,
                body: String::new(),
            })
        }
    }

    async fn serve() -> (String, Arc<ProducerHealthTracker>) {
        let alerts = Arc::new(RecentAlerts::new(16));
        let tracker = Arc::new(ProducerHealthTracker::new(
            &HealthConfig::default(),
            Vec::new(),
            alerts.clone(),
        ));
        let state = AppState {
            tracker: tracker.clone(),
            coordinator: RecoveryCoordinator::with_first_request_id(
                Arc::new(AcceptAll),
                Arc::new(MemoryRecoveryStore::new()),
                RecoveryConfig::default(),
                1,
            ),
            stats: Arc::new(MessageStats::new()),
            alerts,
            connector: None,
        };

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(state)).await.unwrap();
        });
        (format!("http://{}", addr), tracker)
    }

    #[tokio::test]
    async fn test_health_and_readiness() {
        let (base, _) = serve().await;

        let health = reqwest::get(format!("{}/health", base)).await.unwrap();
        let ready = reqwest::get(format!("{}/ready", base)).await.unwrap();

        assert_eq!(health.status(), 200);
        assert_eq!(ready.status(), 503);
    }

    #[tokio::test]
    async fn test_bet_acceptance_reflects_tracker() {
        let (base, tracker) = serve().await;

        tracker.record_alive(1, now_millis() - 60_000, true);
        let closed = reqwest::get(format!("{}/bets/acceptance", base)).await.unwrap();
        assert_eq!(closed.status(), 503);
        let body: serde_json::Value = closed.json().await.unwrap();
        assert!(body["reason"]
            .as_str()
            .unwrap()
            .starts_with("Producer 1 is down"));

        tracker.record_alive(1, now_millis(), true);
        let open = reqwest::get(format!("{}/bets/acceptance", base)).await.unwrap();
        assert_eq!(open.status(), 200);
        let body: serde_json::Value = open.json().await.unwrap();
        assert_eq!(body["reason"], "All producers are healthy");
    }

    #[tokio::test]
    async fn test_manual_recovery_routes() {
        let (base, _) = serve().await;
        let client = reqwest::Client::new();

        let product = client
            .post(format!("{}/recovery/pre", base))
            .send()
            .await
            .unwrap();
        assert_eq!(product.status(), 202);
        let body: serde_json::Value = product.json().await.unwrap();
        assert_eq!(body["result"], "initiated");

        let unknown = client
            .post(format!("{}/recovery/nope", base))
            .send()
            .await
            .unwrap();
        assert_eq!(unknown.status(), 404);

        let event = client
            .post(format!("{}/recovery/liveodds/events/sr:match:1", base))
            .send()
            .await
            .unwrap();
        assert_eq!(event.status(), 202);

        let ledger: serde_json::Value = reqwest::get(format!("{}/recovery", base))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(ledger["requests"].as_array().unwrap().len(), 2);
    }
}
