//! HTTP metrics middleware.
//!
//! Records every response, including the ones axum produces before a
//! handler runs (404, 405, 413) and the `101` of a WebSocket upgrade. The
//! duration of an upgraded request covers the handshake only.

use crate::observability::metrics::record_http_request;
use axum::{extract::Request, middleware::Next, response::Response};
use std::time::Instant;

/// Record method, normalized path, status and duration for each request.
///
/// Applied as the outermost layer so timeouts are counted too.
pub async fn http_metrics_middleware(request: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = request.method().to_string();
    let path = request.uri().path().to_string();

    let response = next.run(request).await;

    record_http_request(&method, &path, response.status().as_u16(), start.elapsed());

    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{Request as HttpRequest, StatusCode},
        middleware,
        routing::{get, post},
        Router,
    };
    use tower::ServiceExt;

    async fn ok() -> &'static str {
        "OK"
    }

    async fn conflict() -> (StatusCode, &'static str) {
        (StatusCode::CONFLICT, "exists")
    }

    fn test_app() -> Router {
        Router::new()
            .route("/api/health", get(ok))
            .route("/api/rooms/create", post(conflict))
            .layer(middleware::from_fn(http_metrics_middleware))
    }

    async fn send(method: &str, uri: &str) -> StatusCode {
        let request = HttpRequest::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .expect("request builder should succeed");

        test_app()
            .oneshot(request)
            .await
            .expect("request should succeed")
            .status()
    }

    #[tokio::test]
    async fn test_passes_success_through() {
        assert_eq!(send("GET", "/api/health").await, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_passes_handler_error_through() {
        assert_eq!(send("POST", "/api/rooms/create").await, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_records_framework_responses() {
        assert_eq!(send("GET", "/nonexistent").await, StatusCode::NOT_FOUND);
        assert_eq!(
            send("GET", "/api/rooms/create").await,
            StatusCode::METHOD_NOT_ALLOWED
        );
    }
}
