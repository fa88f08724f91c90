use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tower_http::trace::TraceLayer;

use crate::api::types::{ErrorResponse, ExecuteRequest, ExecuteResponse, PingResponse};
use crate::limiter::AdmissionLimiter;
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::sandbox::{ExecutionResult, SandboxExecutor};
use crate::shutdown::ShutdownCoordinator;

/// Shared state for the API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub executor: Arc<SandboxExecutor>,
    pub metrics: Arc<Metrics>,
    pub limiter: Arc<AdmissionLimiter>,
    pub coordinator: Arc<ShutdownCoordinator>,
}

pub struct ApiServer;

impl ApiServer {
    /// Build the axum router.
    pub fn router(state: ApiState) -> Router {
        Router::new()
            // Admission-controlled routes.
            .route(
                "/execute",
                post(execute_handler).fallback(execute_wrong_method),
            )
            .route_layer(axum::middleware::from_fn_with_state(
                Arc::clone(&state.limiter),
                admission_middleware,
            ))
            // Unlimited routes (added after the layer).
            .route("/ping", get(ping_handler))
            .route("/metrics", get(metrics_handler))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Serve on an already bound listener until `shutdown` resolves and
    /// in-flight requests have completed.
    pub async fn serve<F>(
        listener: tokio::net::TcpListener,
        state: ApiState,
        shutdown: F,
    ) -> std::io::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if let Ok(addr) = listener.local_addr() {
            tracing::info!("Sandbox API listening on {}", addr);
        }
        axum::serve(
            listener,
            Self::router(state).into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown)
        .await
    }
}

/// Identify the caller: first `X-Forwarded-For` entry, else the peer IP.
pub fn caller_key(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok())
        && let Some(first) = forwarded.split(',').map(str::trim).find(|s| !s.is_empty())
    {
        return first.to_string();
    }
    peer.map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

async fn admission_middleware(
    State(limiter): State<Arc<AdmissionLimiter>>,
    request: Request,
    next: Next,
) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let key = caller_key(request.headers(), peer);

    match limiter.admit(&key) {
        Ok(_) => next.run(request).await,
        Err(denied) => {
            tracing::debug!(caller = %key, retry_after = ?denied.retry_after, "Admission denied");
            let retry_secs = denied.retry_after.as_secs_f64().ceil().max(1.0) as u64;
            (
                StatusCode::TOO_MANY_REQUESTS,
                [(header::RETRY_AFTER, retry_secs.to_string())],
                "Too many requests",
            )
                .into_response()
        }
    }
}

// -- Handlers --

async fn ping_handler() -> Json<PingResponse> {
    Json(PingResponse {
        status: "ok".to_string(),
    })
}

async fn metrics_handler(State(state): State<ApiState>) -> Json<MetricsSnapshot> {
    Json(state.metrics.snapshot())
}

async fn execute_wrong_method(State(state): State<ApiState>) -> Response {
    state.metrics.record_request();
    state.metrics.record_error();
    (
        StatusCode::METHOD_NOT_ALLOWED,
        [(header::ALLOW, "POST")],
        Json(ErrorResponse::new("Method not allowed")),
    )
        .into_response()
}

async fn execute_handler(State(state): State<ApiState>, body: Bytes) -> Response {
    state.metrics.record_request();
    let response = run_execute(&state, &body).await;
    if !response.status().is_success() {
        state.metrics.record_error();
    }
    response
}

async fn run_execute(state: &ApiState, body: &[u8]) -> Response {
    if !state.coordinator.is_accepting() {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "server is shutting down");
    }

    let payload: ExecuteRequest = match serde_json::from_slice(body) {
        Ok(payload) => payload,
        Err(e) => {
            tracing::debug!(error = %e, "Rejected malformed execute body");
            return error_response(StatusCode::BAD_REQUEST, "Invalid JSON");
        }
    };

    let request = match state.executor.request(
        &payload.language,
        &payload.source_code,
        payload.timeout_ms,
    ) {
        Ok(request) => request,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, &e.to_string()),
    };

    let result: ExecutionResult = state.executor.execute(&request).await.into();
    match result.failure {
        Some(failure) => error_response(StatusCode::BAD_REQUEST, &failure),
        None => Json(ExecuteResponse::from(result)).into_response(),
    }
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(ErrorResponse::new(message))).into_response()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;
    use crate::config::{RateLimitConfig, SandboxConfig, ShutdownConfig};
    use crate::sandbox::testing::FakeRuntime;
    use crate::sandbox::{InstanceRegistry, OutputChunk};

    fn test_state_with(runtime: Arc<FakeRuntime>, burst: u32) -> ApiState {
        let registry = Arc::new(InstanceRegistry::new());
        let executor = SandboxExecutor::new(runtime, Arc::clone(&registry), SandboxConfig::default());
        ApiState {
            executor: Arc::new(executor),
            metrics: Arc::new(Metrics::new()),
            limiter: Arc::new(AdmissionLimiter::new(RateLimitConfig {
                burst,
                ..Default::default()
            })),
            coordinator: Arc::new(ShutdownCoordinator::new(
                registry,
                &ShutdownConfig::default(),
                Duration::from_secs(1),
            )),
        }
    }

    fn test_state() -> ApiState {
        test_state_with(Arc::new(FakeRuntime::new()), 10)
    }

    fn execute_request(body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/execute")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn ping_returns_ok() {
        let router = ApiServer::router(test_state());
        let req = Request::builder().uri("/ping").body(Body::empty()).unwrap();

        let resp = router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await, serde_json::json!({"status": "ok"}));
    }

    #[tokio::test]
    async fn execute_python_success() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.script(|s| s.output = vec![OutputChunk::Stdout(b"4\n".to_vec())]);
        let state = test_state_with(runtime, 10);
        let router = ApiServer::router(state.clone());

        let resp = router
            .oneshot(execute_request(
                r#"{"language":"python","source_code":"print(2+2)"}"#,
            ))
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            body_json(resp).await,
            serde_json::json!({"stdout": "4\n", "stderr": "", "exit_code": 0, "error": ""})
        );
        assert_eq!(
            state.metrics.snapshot(),
            MetricsSnapshot {
                total_requests: 1,
                total_errors: 0
            }
        );
        assert!(state.executor.registry().is_empty());
    }

    #[tokio::test]
    async fn execute_unsupported_language() {
        let state = test_state();
        let router = ApiServer::router(state.clone());

        let resp = router
            .oneshot(execute_request(
                r#"{"language":"ruby","source_code":"puts 1"}"#,
            ))
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            body_json(resp).await,
            serde_json::json!({"error": "unsupported language: ruby"})
        );
        assert_eq!(state.metrics.snapshot().total_errors, 1);
    }

    #[tokio::test]
    async fn execute_empty_source() {
        let router = ApiServer::router(test_state());
        let resp = router
            .oneshot(execute_request(r#"{"language":"python","source_code":""}"#))
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            body_json(resp).await,
            serde_json::json!({"error": "source_code cannot be empty"})
        );
    }

    #[tokio::test]
    async fn execute_missing_source_is_empty_source() {
        let state = test_state();
        let router = ApiServer::router(state.clone());
        let resp = router
            .oneshot(execute_request(r#"{"language":"python"}"#))
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            body_json(resp).await,
            serde_json::json!({"error": "source_code cannot be empty"})
        );
        assert_eq!(state.metrics.snapshot().total_errors, 1);
    }

    #[tokio::test]
    async fn execute_invalid_json() {
        let state = test_state();
        let router = ApiServer::router(state.clone());

        let resp = router.oneshot(execute_request("{not json")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            body_json(resp).await,
            serde_json::json!({"error": "Invalid JSON"})
        );
        assert_eq!(
            state.metrics.snapshot(),
            MetricsSnapshot {
                total_requests: 1,
                total_errors: 1
            }
        );
    }

    #[tokio::test]
    async fn execute_wrong_method_is_counted() {
        let state = test_state();
        let router = ApiServer::router(state.clone());

        let req = Request::builder()
            .method("GET")
            .uri("/execute")
            .body(Body::empty())
            .unwrap();
        let resp = router.oneshot(req).await.unwrap();

        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(
            state.metrics.snapshot(),
            MetricsSnapshot {
                total_requests: 1,
                total_errors: 1
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn execute_timeout() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.script(|s| s.run_for = Some(Duration::from_secs(60)));
        let state = test_state_with(runtime, 10);
        let router = ApiServer::router(state.clone());

        let resp = router
            .oneshot(execute_request(
                r#"{"language":"python","source_code":"import time; time.sleep(60)","timeout_ms":100}"#,
            ))
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            body_json(resp).await,
            serde_json::json!({"error": "execution timed out after 100ms"})
        );
        assert!(state.executor.registry().is_empty());
    }

    #[tokio::test]
    async fn admission_denied_after_burst() {
        let state = test_state_with(Arc::new(FakeRuntime::new()), 2);
        let router = ApiServer::router(state.clone());
        let body = r#"{"language":"python","source_code":"print(1)"}"#;

        for _ in 0..2 {
            let resp = router.clone().oneshot(execute_request(body)).await.unwrap();
            assert_eq!(resp.status(), StatusCode::OK);
        }

        let resp = router.clone().oneshot(execute_request(body)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(resp.headers().contains_key(header::RETRY_AFTER));

        // Denials never reach the handler.
        assert_eq!(state.metrics.snapshot().total_requests, 2);

        // /ping is not rate limited.
        let req = Request::builder().uri("/ping").body(Body::empty()).unwrap();
        let resp = router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn admission_keyed_by_forwarded_for() {
        let state = test_state_with(Arc::new(FakeRuntime::new()), 1);
        let router = ApiServer::router(state);
        let body = r#"{"language":"python","source_code":"print(1)"}"#;

        for (client, expected) in [
            ("10.0.0.1", StatusCode::OK),
            ("10.0.0.1, 192.168.1.1", StatusCode::TOO_MANY_REQUESTS),
            ("10.0.0.2", StatusCode::OK),
        ] {
            let mut req = execute_request(body);
            req.headers_mut()
                .insert("x-forwarded-for", client.parse().unwrap());
            let resp = router.clone().oneshot(req).await.unwrap();
            assert_eq!(resp.status(), expected, "client {client}");
        }
    }

    #[tokio::test]
    async fn execute_refused_while_draining() {
        let state = test_state();
        state.coordinator.begin_drain();
        let router = ApiServer::router(state);

        let resp = router
            .oneshot(execute_request(
                r#"{"language":"python","source_code":"print(1)"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            body_json(resp).await,
            serde_json::json!({"error": "server is shutting down"})
        );
    }

    #[test]
    fn caller_key_prefers_forwarded_for() {
        let peer: SocketAddr = "127.0.0.1:5555".parse().unwrap();
        let mut headers = HeaderMap::new();
        assert_eq!(caller_key(&headers, Some(peer)), "127.0.0.1");
        assert_eq!(caller_key(&headers, None), "unknown");

        headers.insert("x-forwarded-for", " 203.0.113.9 , 10.0.0.1".parse().unwrap());
        assert_eq!(caller_key(&headers, Some(peer)), "203.0.113.9");
    }
}
