//! HTTP conversion service.
//!
//! One endpoint takes raw document bytes and answers in the requested mode:
//!
//! | mode       | response                                                    |
//! |------------|-------------------------------------------------------------|
//! | `archive`  | ZIP with `<n>.md` and `<n>.jpeg` per page (default)         |
//! | `json`     | `{file_name, file_size, total_pages, pages: [{content, image_base64?}]}` |
//! | `persist`  | writes `page_<n>.md` / `page_<n>.png` under the results root; `{file_name, file_size, total_pages}` |
//! | `markdown` | `{content}` for the whole document                          |
//!
//! Errors are `{"detail": "..."}`: 400 for an empty body, an unknown mode or
//! a rejected document, 500 for everything else, including a page image that
//! was requested but is unavailable.

use crate::convert::Converter;
use crate::error::ConvertError;
use crate::export::package::{
    persist, AggregateResponse, ArchiveBuilder, MarkdownResponse, DEFAULT_FILE_NAME,
};
use crate::pipeline::scheduler::Conversion;
use crate::stream::page_stream;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::StreamExt;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Largest accepted upload.
pub const MAX_UPLOAD_BYTES: usize = 512 * 1024 * 1024;

/// Server state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    /// Converter for the page-oriented modes (`archive`, `json`, `persist`).
    pub pages: Arc<Converter>,
    /// Converter for `markdown` mode.
    pub markdown: Arc<Converter>,
    /// Directory that receives one sub-directory per `persist` request.
    pub results_root: PathBuf,
}

impl AppState {
    pub fn new(pages: Converter, markdown: Converter, results_root: impl Into<PathBuf>) -> Self {
        Self {
            pages: Arc::new(pages),
            markdown: Arc::new(markdown),
            results_root: results_root.into(),
        }
    }

    /// Serve every mode with the same converter.
    pub fn single(converter: Converter, results_root: impl Into<PathBuf>) -> Self {
        let converter = Arc::new(converter);
        Self {
            pages: Arc::clone(&converter),
            markdown: converter,
            results_root: results_root.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Json,
    Archive,
    Persist,
    Markdown,
}

impl Mode {
    fn parse(s: Option<&str>) -> Option<Mode> {
        match s.unwrap_or("archive") {
            "json" => Some(Mode::Json),
            "archive" => Some(Mode::Archive),
            "persist" => Some(Mode::Persist),
            "markdown" => Some(Mode::Markdown),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ConvertQuery {
    pub mode: Option<String>,
    pub file_name: Option<String>,
    /// `json` mode only: include base64 page images. Defaults to whether the
    /// converter retains page images.
    pub images: Option<bool>,
}

/// An error response: status plus `{"detail": ...}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    detail: String,
}

impl ApiError {
    fn bad_request(detail: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            detail: detail.into(),
        }
    }
}

impl From<ConvertError> for ApiError {
    fn from(e: ConvertError) -> Self {
        let status = if e.is_client_error() {
            StatusCode::BAD_REQUEST
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        Self {
            status,
            detail: e.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(serde_json::json!({ "detail": self.detail }))).into_response()
    }
}

/// Cancels the conversion unless disarmed, so a request that fails or goes
/// away mid-flight stops its pages.
struct CancelOnDrop(Option<Arc<Conversion>>);

impl CancelOnDrop {
    fn disarm(mut self) {
        self.0 = None;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if let Some(conversion) = self.0.take() {
            conversion.cancel();
        }
    }
}

/// Build the router with all endpoints.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/convert", post(convert))
        .route("/convert/", post(convert))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve on an already bound listener until the process stops.
pub async fn serve(listener: TcpListener, state: AppState) -> Result<(), std::io::Error> {
    if let Ok(addr) = listener.local_addr() {
        info!("Conversion service listening on {}", addr);
    }
    axum::serve(listener, build_router(state)).await
}

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn convert(
    State(state): State<AppState>,
    Query(query): Query<ConvertQuery>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let mode = Mode::parse(query.mode.as_deref())
        .ok_or_else(|| ApiError::bad_request(format!("unknown mode '{}'", query.mode.unwrap_or_default())))?;
    if body.is_empty() {
        return Err(ApiError::bad_request("request body is empty"));
    }
    let file_name = query
        .file_name
        .filter(|n| !n.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_FILE_NAME.to_string());
    let file_size = body.len();
    info!("Convert request: {} ({} bytes, {:?})", file_name, file_size, mode);

    let converter = match mode {
        Mode::Markdown => &state.markdown,
        _ => &state.pages,
    };
    let conversion = Arc::new(converter.start(&file_name, body.to_vec()).await?);
    let guard = CancelOnDrop(Some(Arc::clone(&conversion)));

    let response = match mode {
        Mode::Archive => archive_response(&conversion).await?,
        Mode::Json => {
            let doc = conversion.document().await?;
            let images = query.images.unwrap_or(converter.config().generate_page_images);
            Json(AggregateResponse::build(&doc, file_size, images)?).into_response()
        }
        Mode::Persist => {
            let doc = conversion.document().await?;
            let (dir, summary) = persist(&doc, file_size, &state.results_root).await?;
            info!("Persisted '{}' to {}", file_name, dir.display());
            Json(summary).into_response()
        }
        Mode::Markdown => {
            let doc = conversion.document().await?;
            Json(MarkdownResponse::build(&doc, &converter.config().page_separator)).into_response()
        }
    };
    guard.disarm();
    Ok(response)
}

/// Build the archive from the in-order page stream, so entries are written
/// while later pages are still in the pipeline.
async fn archive_response(conversion: &Arc<Conversion>) -> Result<Response, ApiError> {
    let mut pages = page_stream(Arc::clone(conversion));
    let mut archive = ArchiveBuilder::new();
    while let Some(page) = pages.next().await {
        let page = page?;
        if let Err(e) = archive.add_page(&page) {
            warn!("Archive aborted: {}", e);
            return Err(e.into());
        }
    }
    // Surfaces a document-level failure such as every page failing to decode.
    conversion.document().await?;
    let bytes = archive.finish()?;
    Ok((
        [
            (header::CONTENT_TYPE, "application/zip"),
            (header::CONTENT_DISPOSITION, "attachment; filename=result.zip"),
        ],
        bytes,
    )
        .into_response())
}
