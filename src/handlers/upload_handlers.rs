//! HTTP handlers for chunked uploads.
//! Decode path parameters and bodies, then delegate to `UploadService`.

use crate::{
    errors::AppError,
    models::upload::{
        ChunkResponse, CreateUploadResponse, StatusResponse, UploadDescriptor, UploadId,
    },
    services::{
        finalize::{FinishOutcome, ProcessedOutcome},
        upload_service::{PollOutcome, UploadError, UploadService},
    },
};
use axum::{
    Json,
    body::Body,
    extract::{Multipart, Path, State},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use serde::Serialize;
use tokio_util::io::ReaderStream;

/// Multipart form field carrying the chunk bytes.
const CHUNK_FIELD: &str = "chunk";

/// Body of the long-poll endpoints.
#[derive(Debug, Serialize)]
pub struct FinishResponse {
    /// `stored`, `timed_out` or `failed`.
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<FinishOutcome> for FinishResponse {
    fn from(outcome: FinishOutcome) -> Self {
        let empty = Self {
            status: "",
            digest: None,
            name: None,
            size: None,
            url: None,
            mime_type: None,
            thumbnail: None,
            error: None,
        };
        match outcome {
            FinishOutcome::Stored(stored) => Self {
                status: "stored",
                url: Some(format!("/api/files/{}", stored.digest)),
                digest: Some(stored.digest),
                name: Some(stored.name),
                size: Some(stored.size),
                ..empty
            },
            FinishOutcome::TimedOut => Self {
                status: "timed_out",
                error: Some("upload timed out before all chunks arrived".into()),
                ..empty
            },
            FinishOutcome::Failed(reason) => Self {
                status: "failed",
                error: Some(reason),
                ..empty
            },
        }
    }
}

impl From<ProcessedOutcome> for FinishResponse {
    fn from(outcome: ProcessedOutcome) -> Self {
        Self {
            mime_type: outcome.mime_type,
            thumbnail: outcome
                .thumbnail
                .map(|p| p.to_string_lossy().into_owned()),
            ..outcome.finish.into()
        }
    }
}

fn parse_upload_id(raw: &str) -> Result<UploadId, AppError> {
    raw.parse::<UploadId>()
        .map_err(|msg| UploadError::InvalidUploadId(msg).into())
}

/// `POST /api/upload`: create an upload session.
pub async fn create_upload(
    State(service): State<UploadService>,
    Json(descriptor): Json<UploadDescriptor>,
) -> Result<Json<CreateUploadResponse>, AppError> {
    let upload_id = service.create_upload(descriptor).await?;
    Ok(Json(CreateUploadResponse {
        upload_id,
        status: "success".into(),
    }))
}

/// `POST /api/upload/chunk/{upload_id}/{chunk_id}`: write one chunk.
///
/// The chunk bytes travel in the multipart field `chunk`.
pub async fn upload_chunk(
    State(service): State<UploadService>,
    Path((upload_id, chunk_id)): Path<(String, String)>,
    multipart: Multipart,
) -> Result<Json<ChunkResponse>, AppError> {
    let id = parse_upload_id(&upload_id)?;
    let index = chunk_id
        .parse::<u32>()
        .map_err(|_| UploadError::MalformedChunkIndex(chunk_id.clone()))?;
    let data = read_chunk_field(multipart).await?;

    service.write_chunk(id, index, data).await?;
    Ok(Json(ChunkResponse {
        upload_id: id,
        chunk: index,
    }))
}

async fn read_chunk_field(mut multipart: Multipart) -> Result<Bytes, AppError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| AppError::new(err.status(), err.body_text()))?
    {
        if field.name() == Some(CHUNK_FIELD) {
            return field
                .bytes()
                .await
                .map_err(|err| AppError::new(err.status(), err.body_text()));
        }
    }
    Err(AppError::bad_request(format!(
        "missing multipart field `{}`",
        CHUNK_FIELD
    )))
}

/// `GET /api/upload/{upload_id}/status`: received chunk indices.
pub async fn upload_status(
    State(service): State<UploadService>,
    Path(upload_id): Path<String>,
) -> Result<Json<StatusResponse>, AppError> {
    let id = parse_upload_id(&upload_id)?;
    let status = service.status(id).await?;
    Ok(Json(StatusResponse { status }))
}

/// `GET /api/upload/{upload_id}/finished`: long-poll for finalization.
pub async fn upload_finished(
    State(service): State<UploadService>,
    Path(upload_id): Path<String>,
) -> Result<Response, AppError> {
    let id = parse_upload_id(&upload_id)?;
    Ok(poll_response(service.await_finished(id).await?))
}

/// `GET /api/upload/{upload_id}/processed`: long-poll for post-processing.
pub async fn upload_processed(
    State(service): State<UploadService>,
    Path(upload_id): Path<String>,
) -> Result<Response, AppError> {
    let id = parse_upload_id(&upload_id)?;
    Ok(poll_response(service.await_processed(id).await?))
}

fn poll_response<T: Into<FinishResponse>>(outcome: PollOutcome<T>) -> Response {
    match outcome {
        PollOutcome::Ready(value) => (StatusCode::OK, Json(value.into())).into_response(),
        PollOutcome::Pending => (
            StatusCode::REQUEST_TIMEOUT,
            Json(serde_json::json!({ "status": "pending" })),
        )
            .into_response(),
    }
}

/// `GET /api/files/{digest}`: stream a stored file.
pub async fn get_file(
    State(service): State<UploadService>,
    Path(digest): Path<String>,
) -> Result<Response, AppError> {
    let (record, file) = service.open_file(&digest).await?;
    let len = file.metadata().await.map_err(UploadError::Io)?.len();

    let mut response = Response::new(Body::from_stream(ReaderStream::new(file)));
    let headers = response.headers_mut();

    let content_type = record
        .as_ref()
        .and_then(|r| r.mime_type.clone())
        .unwrap_or_else(|| "application/octet-stream".into());
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
    if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", digest)) {
        headers.insert(header::ETAG, value);
    }
    if let Some(record) = &record {
        let disposition = format!("inline; filename=\"{}\"", record.name.replace('"', ""));
        if let Ok(value) = HeaderValue::from_str(&disposition) {
            headers.insert(header::CONTENT_DISPOSITION, value);
        }
    }

    *response.status_mut() = StatusCode::OK;
    Ok(response)
}
