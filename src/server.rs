//! HTTP front end: the chat stream, the upload helper and a health check.

use std::convert::Infallible;
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::multipart::MultipartRejection;
use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::header::{
    ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN,
    CACHE_CONTROL, CONTENT_TYPE,
};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine as _;
use futures_util::StreamExt;
use serde::Serialize;
use tracing::{info, warn};

use crate::chat::ChatRequest;
use crate::service::RelayService;

pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 20 * 1024 * 1024;

#[derive(Clone, Debug)]
pub struct RelayHttpState {
    service: Arc<RelayService>,
    max_body_bytes: usize,
}

impl RelayHttpState {
    pub fn new(service: RelayService) -> Self {
        Self {
            service: Arc::new(service),
            max_body_bytes: DEFAULT_MAX_UPLOAD_BYTES,
        }
    }

    pub fn with_max_body_bytes(mut self, max_body_bytes: usize) -> Self {
        self.max_body_bytes = max_body_bytes;
        self
    }

    pub fn service(&self) -> &RelayService {
        &self.service
    }
}

#[derive(Debug, Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    keys: usize,
}

#[derive(Debug, Serialize)]
struct UploadResponse {
    success: bool,
    filename: String,
    size: usize,
    #[serde(rename = "type")]
    mime_type: String,
    data: String,
}

fn error_response(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> (StatusCode, Json<ErrorResponse>) {
    (
        status,
        Json(ErrorResponse {
            error: ErrorDetail {
                code,
                message: message.into(),
            },
        }),
    )
}

pub fn router(state: RelayHttpState) -> Router {
    let max_body_bytes = state.max_body_bytes;
    Router::new()
        .route("/health", get(health))
        .route("/api/chat", post(handle_chat).options(preflight))
        .route("/api/upload", post(handle_upload).options(preflight))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(axum::middleware::map_response(add_cors_headers))
        .with_state(state)
}

async fn add_cors_headers(mut response: Response) -> Response {
    let headers = response.headers_mut();
    headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    headers.insert(
        ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, OPTIONS"),
    );
    headers.insert(
        ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type"),
    );
    response
}

async fn preflight() -> StatusCode {
    StatusCode::NO_CONTENT
}

async fn health(State(state): State<RelayHttpState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        keys: state.service.pool_size(),
    })
}

async fn handle_chat(State(state): State<RelayHttpState>, body: Bytes) -> Response {
    let prepared = match ChatRequest::from_json(&body)
        .and_then(|request| state.service.prepare(request))
    {
        Ok(prepared) => prepared,
        Err(err) => {
            warn!(error = %err, "rejected chat request");
            return error_response(StatusCode::BAD_REQUEST, "invalid_request", err.to_string())
                .into_response();
        }
    };

    let events = state.service.stream_chat(prepared).await;
    let stream = events.map(|event| Ok::<_, Infallible>(event.to_sse()));

    let mut response = Response::new(Body::from_stream(stream));
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    response
}

async fn handle_upload(multipart: Result<Multipart, MultipartRejection>) -> Response {
    let mut multipart = match multipart {
        Ok(multipart) => multipart,
        Err(rejection) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "invalid_request",
                rejection.body_text(),
            )
            .into_response();
        }
    };

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(err) => {
                return error_response(StatusCode::BAD_REQUEST, "invalid_request", err.body_text())
                    .into_response();
            }
        };
        if field.name() != Some("file") {
            continue;
        }

        let filename = field.file_name().unwrap_or_default().to_string();
        if filename.is_empty() {
            return error_response(StatusCode::BAD_REQUEST, "invalid_request", "no file selected")
                .into_response();
        }
        let mime_type = field
            .content_type()
            .filter(|value| !value.is_empty())
            .unwrap_or("application/octet-stream")
            .to_string();
        let content = match field.bytes().await {
            Ok(content) => content,
            Err(err) => {
                return error_response(StatusCode::BAD_REQUEST, "invalid_request", err.body_text())
                    .into_response();
            }
        };

        info!(filename = %filename, size = content.len(), mime_type = %mime_type, "file uploaded");
        return Json(UploadResponse {
            success: true,
            filename,
            size: content.len(),
            mime_type,
            data: base64::engine::general_purpose::STANDARD.encode(&content),
        })
        .into_response();
    }

    error_response(StatusCode::BAD_REQUEST, "invalid_request", "file not found").into_response()
}
