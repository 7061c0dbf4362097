//! Upload API handlers.
//!
//! Three endpoints drive a resumable upload: the pre-upload probe
//! (what does the server already have?), the chunk submission
//! (multipart/form-data, one chunk per request), and the completion
//! probe (also the finalize-retry trigger).
//!
//! Owner identity arrives in the `x-owner-id` header, injected by the
//! upstream gateway; requests without it run as `anonymous`.

use std::sync::Arc;

use axum::extract::{Multipart, Path, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use serde::Deserialize;
use tracing::debug;

use crate::errors::UploadError;
use crate::AppState;

/// Fallback owner when the upstream gateway sends no identity header.
const ANONYMOUS_OWNER: &str = "anonymous";

fn owner_id(headers: &HeaderMap) -> String {
    headers
        .get("x-owner-id")
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
        .unwrap_or(ANONYMOUS_OWNER)
        .to_string()
}

// -- Pre-upload probe ----------------------------------------------------------

/// Request body for `POST /files/pre_upload`.
#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct PreUploadRequest {
    pub file_hash: String,
    /// Declared size in bytes, recorded on the file until finalize
    /// replaces it with the summed part sizes.
    #[serde(default)]
    pub file_size: u64,
    pub file_name: String,
}

/// `POST /files/pre_upload` -- Probe what the server already holds for
/// a content hash. Returns `new_upload`, `partial_upload` (with the
/// missing 0-based chunk indices), or `completed`.
#[utoipa::path(
    post,
    path = "/files/pre_upload",
    tag = "Upload",
    operation_id = "PreUpload",
    responses(
        (status = 200, description = "Probe result with upload status and missing chunks"),
        (status = 400, description = "Malformed request"),
        (status = 503, description = "Session store unavailable")
    )
)]
pub async fn pre_upload(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<PreUploadRequest>,
) -> Result<Response, UploadError> {
    if req.file_hash.is_empty() {
        return Err(UploadError::InvalidRequest {
            message: "file_hash must not be empty".to_string(),
        });
    }
    if req.file_name.is_empty() {
        return Err(UploadError::InvalidRequest {
            message: "file_name must not be empty".to_string(),
        });
    }

    let owner = owner_id(&headers);
    debug!(
        "Pre-upload probe: hash={} name={} size={} owner={}",
        req.file_hash, req.file_name, req.file_size, owner
    );

    let probe = state
        .coordinator
        .probe(&req.file_hash, &req.file_name, req.file_size, &owner)
        .await?;

    Ok(Json(serde_json::json!({
        "file_id": probe.file_id,
        "status": probe.status,
        "missing_parts": probe.missing_chunks,
    }))
    .into_response())
}

// -- Chunk submission ----------------------------------------------------------

/// Parsed multipart/form-data fields of a chunk submission.
struct ChunkForm {
    file_hash: String,
    chunk_index: u32,
    total_chunks: u32,
    file_name: String,
    chunk: Bytes,
}

async fn read_chunk_form(mut multipart: Multipart) -> Result<ChunkForm, UploadError> {
    let mut file_hash = None;
    let mut chunk_index = None;
    let mut total_chunks = None;
    let mut file_name = None;
    let mut chunk = None;

    while let Some(field) = multipart.next_field().await.map_err(|e| {
        UploadError::InvalidRequest {
            message: format!("Malformed multipart body: {e}"),
        }
    })? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file_hash" => file_hash = Some(read_text(field, "file_hash").await?),
            "chunk_index" => chunk_index = Some(read_u32(field, "chunk_index").await?),
            "total_chunks" => total_chunks = Some(read_u32(field, "total_chunks").await?),
            "file_name" => file_name = Some(read_text(field, "file_name").await?),
            "chunk" => {
                chunk = Some(field.bytes().await.map_err(|e| {
                    UploadError::InvalidRequest {
                        message: format!("Failed to read chunk body: {e}"),
                    }
                })?)
            }
            other => {
                debug!("Ignoring unknown form field: {}", other);
            }
        }
    }

    Ok(ChunkForm {
        file_hash: require(file_hash, "file_hash")?,
        chunk_index: require(chunk_index, "chunk_index")?,
        total_chunks: require(total_chunks, "total_chunks")?,
        file_name: require(file_name, "file_name")?,
        chunk: require(chunk, "chunk")?,
    })
}

async fn read_text(
    field: axum::extract::multipart::Field<'_>,
    name: &str,
) -> Result<String, UploadError> {
    field.text().await.map_err(|e| UploadError::InvalidRequest {
        message: format!("Failed to read field {name}: {e}"),
    })
}

async fn read_u32(
    field: axum::extract::multipart::Field<'_>,
    name: &str,
) -> Result<u32, UploadError> {
    let text = read_text(field, name).await?;
    text.parse().map_err(|_| UploadError::InvalidRequest {
        message: format!("Field {name} must be a non-negative integer, got {text:?}"),
    })
}

fn require<T>(value: Option<T>, name: &str) -> Result<T, UploadError> {
    value.ok_or_else(|| UploadError::InvalidRequest {
        message: format!("Missing form field {name}"),
    })
}

/// `POST /files/upload` -- Submit one chunk of a file as
/// multipart/form-data with fields `file_hash`, `chunk_index` (0-based),
/// `total_chunks`, `file_name`, and `chunk` (the bytes). The submission
/// that completes the set finalizes the object before responding.
#[utoipa::path(
    post,
    path = "/files/upload",
    tag = "Upload",
    operation_id = "UploadChunk",
    responses(
        (status = 200, description = "Chunk accepted; body reports whether it finalized the file"),
        (status = 400, description = "Invalid chunk or malformed form"),
        (status = 502, description = "Object store rejected the chunk"),
        (status = 503, description = "Session store unavailable")
    )
)]
pub async fn upload_chunk(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    multipart: Multipart,
) -> Result<Response, UploadError> {
    let form = read_chunk_form(multipart).await?;
    if form.file_hash.is_empty() {
        return Err(UploadError::InvalidRequest {
            message: "file_hash must not be empty".to_string(),
        });
    }
    if form.chunk.is_empty() {
        return Err(UploadError::InvalidChunk {
            message: "chunk must not be empty".to_string(),
        });
    }

    let owner = owner_id(&headers);
    debug!(
        "Chunk submission: hash={} index={}/{} bytes={} owner={}",
        form.file_hash,
        form.chunk_index,
        form.total_chunks,
        form.chunk.len(),
        owner
    );

    let outcome = state
        .coordinator
        .ingest_chunk(
            &form.file_hash,
            form.chunk_index,
            form.total_chunks,
            &form.file_name,
            &owner,
            form.chunk,
        )
        .await?;

    Ok(Json(serde_json::json!({
        "accepted": outcome.accepted,
        "finalize_triggered": outcome.finalize_triggered,
    }))
    .into_response())
}

// -- Completion probe ----------------------------------------------------------

/// `GET /files/:file_hash/status` -- Report whether the file is fully
/// assembled. When every chunk is recorded but a previous finalize
/// failed, this call retries the finalize.
#[utoipa::path(
    get,
    path = "/files/{file_hash}/status",
    tag = "Upload",
    operation_id = "UploadStatus",
    params(
        ("file_hash" = String, Path, description = "Content hash of the file")
    ),
    responses(
        (status = 200, description = "Current upload status"),
        (status = 404, description = "No upload known for this hash")
    )
)]
pub async fn upload_status(
    State(state): State<Arc<AppState>>,
    Path(file_hash): Path<String>,
) -> Result<Response, UploadError> {
    let status = state.coordinator.check_completion(&file_hash).await?;
    Ok(Json(serde_json::json!({ "status": status })).into_response())
}
