//! HTTP routes for the room service.
//!
//! Defines the Axum router and application state.

use crate::actors::RoomRegistryActorHandle;
use crate::auth::SessionTokenIssuer;
use crate::config::Config;
use crate::handlers;
use crate::media::allocator::WorkerPool;
use crate::middleware::http_metrics_middleware;
use crate::observability::{health_router, HealthState};
use crate::signaling::ws_handler;
use axum::{
    http::{header, HeaderValue, Method},
    middleware,
    routing::{get, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::warn;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Service configuration.
    pub config: Config,
    /// Handle to the registry actor, the only owner of room state.
    pub registry: RoomRegistryActorHandle,
    /// Session token signer/verifier.
    pub issuer: SessionTokenIssuer,
    /// Media worker pool for router and transport allocation.
    pub workers: Arc<WorkerPool>,
    /// Liveness/readiness flags.
    pub health: Arc<HealthState>,
    /// Process start, for uptime reporting.
    pub started_at: Instant,
}

/// Build the application routes.
///
/// Creates an Axum router with:
/// - `/live`, `/ready` - probes
/// - `/metrics` - Prometheus metrics endpoint
/// - `/api/health`, `/api/status` - public status
/// - `/api/rooms/create`, `/api/rooms/join` - admission
/// - `/api/rooms/can-create`, `/api/rooms/limits` - admission preflight
/// - `/ws` - signaling WebSocket
/// - CORS for the configured web client origin
/// - TraceLayer for request logging
/// - HTTP metrics middleware
/// - 30 second request timeout
pub fn build_routes(state: Arc<AppState>, metrics_handle: PrometheusHandle) -> Router {
    let cors = cors_layer(&state.config.cors_origin);
    let health_state = Arc::clone(&state.health);

    let api_routes = Router::new()
        .route("/api/health", get(handlers::health))
        .route("/api/status", get(handlers::status))
        .route("/api/rooms/create", post(handlers::create_room))
        .route("/api/rooms/join", post(handlers::join_room))
        .route("/api/rooms/can-create", get(handlers::can_create))
        .route("/api/rooms/limits", get(handlers::limits))
        .route("/ws", get(ws_handler))
        .with_state(state);

    // Metrics route with its own state
    let metrics_routes = Router::new()
        .route("/metrics", get(handlers::metrics_handler))
        .with_state(metrics_handle);

    // Layer order (bottom-to-top execution):
    // 1. TimeoutLayer - Timeout the request (innermost)
    // 2. TraceLayer - Log request details
    // 3. CorsLayer - Answer preflights, tag responses
    // 4. http_metrics_middleware - Record ALL responses (outermost)
    api_routes
        .merge(metrics_routes)
        .merge(health_router(health_state))
        .layer(TimeoutLayer::new(Duration::from_secs(30)))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(middleware::from_fn(http_metrics_middleware))
}

/// `*` allows any origin; anything else must be a single exact origin.
fn cors_layer(origin: &str) -> CorsLayer {
    let allow_origin = if origin.trim() == "*" {
        AllowOrigin::any()
    } else {
        match HeaderValue::from_str(origin.trim()) {
            Ok(value) => AllowOrigin::exact(value),
            Err(e) => {
                warn!(target: "room.http", error = %e, "Invalid CORS origin, cross-origin requests will be refused");
                AllowOrigin::list(Vec::new())
            }
        }
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE])
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::actors::RoomRegistryActorHandle;
    use crate::capacity::CapacityPool;
    use crate::media::local::LocalEngine;
    use crate::registry::RoomRegistry;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use metrics_exporter_prometheus::PrometheusBuilder;
    use serde_json::{json, Value};
    use std::collections::HashMap;
    use tower::ServiceExt;

    async fn test_app(overrides: &[(&str, &str)]) -> Router {
        let mut vars = HashMap::from([
            (
                "ROOM_JWT_SECRET".to_string(),
                "0123456789abcdef0123456789abcdef".to_string(),
            ),
            ("PASSWORD_HASH_COST".to_string(), "4".to_string()),
            ("MEDIA_WORKERS".to_string(), "1".to_string()),
        ]);
        for (key, value) in overrides {
            vars.insert((*key).to_string(), (*value).to_string());
        }
        let config = Config::from_vars(&vars).unwrap();

        let engine = LocalEngine::new();
        let workers = WorkerPool::start(&engine, &config.media).await.unwrap();
        let registry = RoomRegistryActorHandle::new(
            RoomRegistry::new(CapacityPool::new(config.capacity), config.tiers.clone()),
            config.housekeeping.clone(),
        );
        let issuer = SessionTokenIssuer::new(&config.jwt_secret, config.session_token_ttl_seconds);

        let state = Arc::new(AppState {
            config,
            registry,
            issuer,
            workers: Arc::new(workers),
            health: Arc::new(HealthState::new()),
            started_at: Instant::now(),
        });
        let handle = PrometheusBuilder::new().build_recorder().handle();
        build_routes(state, handle)
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    fn post_json(uri: &str, body: &Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[test]
    fn test_app_state_is_clone() {
        fn assert_clone<T: Clone>() {}
        assert_clone::<AppState>();
    }

    #[tokio::test]
    async fn test_malformed_json_is_bad_request() {
        let app = test_app(&[]).await;
        let request = Request::builder()
            .method("POST")
            .uri("/api/rooms/create")
            .header("content-type", "application/json")
            .body(Body::from("{not json"))
            .unwrap();

        let (status, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "BAD_REQUEST");
    }

    #[tokio::test]
    async fn test_create_then_duplicate_conflicts() {
        let app = test_app(&[]).await;
        let body = json!({"roomName": "team", "password": "hunter2", "displayName": "Ana"});

        let (status, created) = send(&app, post_json("/api/rooms/create", &body)).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["roomName"], "team");
        assert_eq!(created["tier"], "free");
        assert_eq!(created["limits"]["maxParticipants"], 4);
        assert!(created["sessionToken"].as_str().is_some_and(|t| !t.is_empty()));

        let (status, error) = send(&app, post_json("/api/rooms/create", &body)).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(error["error"]["code"], "ROOM_EXISTS");
    }

    #[tokio::test]
    async fn test_join_errors() {
        let app = test_app(&[]).await;
        let create = json!({"roomName": "team", "password": "hunter2"});
        send(&app, post_json("/api/rooms/create", &create)).await;

        let (status, _) = send(
            &app,
            post_json(
                "/api/rooms/join",
                &json!({"roomName": "nope", "password": "hunter2"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = send(
            &app,
            post_json(
                "/api/rooms/join",
                &json!({"roomName": "team", "password": "wrong!"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"]["code"], "INVALID_PASSWORD");

        let (status, body) = send(
            &app,
            post_json(
                "/api/rooms/join",
                &json!({"roomName": "team", "password": "hunter2", "displayName": "Bo"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["roomName"], "team");
    }

    #[tokio::test]
    async fn test_can_create_and_limits() {
        let app = test_app(&[("TOTAL_MAX_ROOMS", "10"), ("SUPPORTER_POOL_PERCENT", "0")]).await;

        let (status, body) = send(&app, get("/api/rooms/can-create?tier=supporter")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["allowed"], false);
        assert_eq!(body["reason"], "supporter_pool_full");
        assert_eq!(body["pool"]["max"], 0);

        let (_, body) = send(&app, get("/api/rooms/can-create")).await;
        assert_eq!(body["allowed"], true);
        assert_eq!(body["tier"], "free");

        let (status, _) = send(&app, get("/api/rooms/can-create?tier=gold")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = send(&app, get("/api/rooms/limits")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["supporter"]["maxScreenShares"], 3);
    }

    #[tokio::test]
    async fn test_status_lists_public_fields_only() {
        let app = test_app(&[]).await;
        send(
            &app,
            post_json(
                "/api/rooms/create",
                &json!({"roomName": "team", "password": "hunter2"}),
            ),
        )
        .await;

        let (status, body) = send(&app, get("/api/status")).await;
        assert_eq!(status, StatusCode::OK);
        let room = &body["rooms"][0];
        assert_eq!(room["name"], "team");
        assert_eq!(room["participants"], 1);
        assert!(room.get("passwordHash").is_none());
        assert_eq!(body["capacity"]["free"]["active"], 1);
        assert!(body["system"]["cpu"]["cores"].is_number());

        let (status, body) = send(&app, get("/api/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["rooms"], 1);
    }

    #[tokio::test]
    async fn test_probes_are_mounted() {
        let app = test_app(&[]).await;
        let response = app.clone().oneshot(get("/live")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let response = app.oneshot(get("/ready")).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
