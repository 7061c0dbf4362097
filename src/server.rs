//! Axum router construction and route mapping.
//!
//! The [`app`] function wires the upload endpoints, the health check,
//! and the observability endpoints to their handlers and returns a
//! ready-to-serve [`axum::Router`].

use axum::{
    extract::DefaultBodyLimit,
    http::{HeaderValue, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;

use crate::errors::generate_request_id;
use crate::handlers::upload;
use crate::metrics::{metrics_handler, metrics_middleware};
use crate::AppState;

// -- OpenAPI specification ----------------------------------------------------

/// OpenAPI documentation for the ChunkFlow upload API.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "ChunkFlow Upload API",
        version = "0.1.0",
        description = "Resumable chunked-upload coordination service"
    ),
    paths(
        health_check,
        crate::handlers::upload::pre_upload,
        crate::handlers::upload::upload_chunk,
        crate::handlers::upload::upload_status,
    ),
    tags(
        (name = "Health", description = "Health check endpoints"),
        (name = "Upload", description = "Resumable chunked-upload operations"),
    )
)]
struct ApiDoc;

/// Build the axum [`Router`] with all routes.
///
/// The returned router is ready to be passed to `axum::serve`.
pub fn app(state: Arc<AppState>) -> Router {
    let openapi = ApiDoc::openapi();
    // Chunks ride inside a multipart envelope; leave headroom for the
    // form framing around the configured chunk ceiling.
    let body_limit = state.config.server.max_chunk_size as usize + 64 * 1024;

    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_handler))
        .route(
            "/openapi.json",
            get(move || async move { Json(openapi).into_response() }),
        )
        .route("/files/pre_upload", post(upload::pre_upload))
        .route("/files/upload", post(upload::upload_chunk))
        .route("/files/:file_hash/status", get(upload::upload_status))
        .with_state(state)
        // Layer ordering: inner layers run first, outer layers wrap them.
        .layer(middleware::from_fn(common_headers_middleware))
        .layer(middleware::from_fn(metrics_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .layer(DefaultBodyLimit::max(body_limit))
}

// -- Common headers middleware -----------------------------------------------

/// Tower middleware that adds common response headers to every response:
/// - `x-request-id`: 16-character uppercase hex string
/// - `Date`: RFC 7231 formatted timestamp
/// - `Server`: `ChunkFlow`
async fn common_headers_middleware(req: Request<axum::body::Body>, next: Next) -> Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();

    // Only set x-request-id if not already present (error handler may set it).
    if !headers.contains_key("x-request-id") {
        let request_id = generate_request_id();
        if let Ok(value) = HeaderValue::from_str(&request_id) {
            headers.insert("x-request-id", value);
        }
    }

    let date = httpdate::fmt_http_date(std::time::SystemTime::now());
    // Always overwrite Date and Server to ensure consistency.
    if let Ok(value) = HeaderValue::from_str(&date) {
        headers.insert("date", value);
    }
    headers.insert("server", HeaderValue::from_static("ChunkFlow"));

    response
}

// -- Health check ------------------------------------------------------------

/// `GET /health` -- Returns `{"status": "ok"}` with 200 OK.
#[utoipa::path(
    get,
    path = "/health",
    tag = "Health",
    operation_id = "HealthCheck",
    responses(
        (status = 200, description = "Health check OK")
    )
)]
async fn health_check() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "application/json")],
        r#"{"status":"ok"}"#,
    )
}

// -- Tests --------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::coordinator::UploadCoordinator;
    use crate::gateway::memory::MemoryGateway;
    use crate::metadata::memory::MemoryMetadataStore;
    use crate::session::memory::MemorySessionStore;
    use axum::body::Body;
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tower::util::ServiceExt;

    fn test_app() -> Router {
        let coordinator = UploadCoordinator::new(
            Arc::new(MemorySessionStore::new(Duration::from_secs(3600))),
            Arc::new(MemoryGateway::new()),
            Arc::new(MemoryMetadataStore::new()),
            3,
            Duration::from_millis(1),
        );
        let state = Arc::new(AppState {
            config: Config::default(),
            coordinator: Arc::new(coordinator),
        });
        app(state)
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn chunk_request(hash: &str, index: u32, total: u32, data: &str) -> Request<Body> {
        let boundary = "chunkflow-test-boundary";
        let mut body = String::new();
        for (name, value) in [
            ("file_hash", hash.to_string()),
            ("chunk_index", index.to_string()),
            ("total_chunks", total.to_string()),
            ("file_name", "clip.mp4".to_string()),
        ] {
            body.push_str(&format!(
                "--{boundary}\r\ncontent-disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
            ));
        }
        body.push_str(&format!(
            "--{boundary}\r\ncontent-disposition: form-data; name=\"chunk\"; filename=\"blob\"\r\n\
             content-type: application/octet-stream\r\n\r\n{data}\r\n--{boundary}--\r\n"
        ));

        Request::builder()
            .method("POST")
            .uri("/files/upload")
            .header(
                "content-type",
                format!("multipart/form-data; boundary={boundary}"),
            )
            .header("x-owner-id", "7")
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let response = test_app()
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("server").unwrap(),
            &HeaderValue::from_static("ChunkFlow")
        );
        assert!(response.headers().contains_key("x-request-id"));
    }

    #[tokio::test]
    async fn test_pre_upload_new_file() {
        let response = test_app()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/files/pre_upload")
                    .header("content-type", "application/json")
                    .header("x-owner-id", "7")
                    .body(Body::from(
                        r#"{"file_hash":"abc123","file_size":42,"file_name":"clip.mp4"}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        assert_eq!(json["status"], "new_upload");
        assert!(json["file_id"].as_i64().unwrap() > 0);
        assert_eq!(json["missing_parts"].as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_pre_upload_rejects_empty_hash() {
        let response = test_app()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/files/pre_upload")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        r#"{"file_hash":"","file_size":42,"file_name":"clip.mp4"}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let json = body_json(response).await;
        assert_eq!(json["error"]["code"], "InvalidRequest");
        assert_eq!(json["error"]["retryable"], false);
    }

    #[tokio::test]
    async fn test_chunk_upload_roundtrip() {
        let app = test_app();

        // Two chunks; the second response reports the finalize.
        let response = app
            .clone()
            .oneshot(chunk_request("abc123", 0, 2, "hello "))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["accepted"], true);
        assert_eq!(json["finalize_triggered"], false);

        let response = app
            .clone()
            .oneshot(chunk_request("abc123", 1, 2, "world"))
            .await
            .unwrap();
        let json = body_json(response).await;
        assert_eq!(json["accepted"], true);
        assert_eq!(json["finalize_triggered"], true);

        // The status probe confirms completion.
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/files/abc123/status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "complete");
    }

    #[tokio::test]
    async fn test_chunk_out_of_range_is_400() {
        let response = test_app()
            .oneshot(chunk_request("abc123", 5, 2, "data"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response).await;
        assert_eq!(json["error"]["code"], "InvalidChunk");
    }

    #[tokio::test]
    async fn test_missing_form_field_is_400() {
        let boundary = "chunkflow-test-boundary";
        let body = format!(
            "--{boundary}\r\ncontent-disposition: form-data; name=\"file_hash\"\r\n\r\nabc\r\n--{boundary}--\r\n"
        );
        let response = test_app()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/files/upload")
                    .header(
                        "content-type",
                        format!("multipart/form-data; boundary={boundary}"),
                    )
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_status_unknown_hash_is_404() {
        let response = test_app()
            .oneshot(
                Request::builder()
                    .uri("/files/doesnotexist/status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let json = body_json(response).await;
        assert_eq!(json["error"]["code"], "FileNotFound");
    }

    #[tokio::test]
    async fn test_openapi_served() {
        let response = test_app()
            .oneshot(
                Request::builder()
                    .uri("/openapi.json")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["info"]["title"], "ChunkFlow Upload API");
    }
}
