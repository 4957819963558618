//! HTTP front end for the streamer.
//!
//! Routes:
//! - `POST /download`                  - Stream the archive described by a JSON manifest
//! - `GET  /download?zsurl=|zsid=`     - Stream the archive described by a remote list file
//! - `POST /create_download_link`      - Store a manifest, answer with a link id
//! - `GET  /download_link/{link_id}`   - Stream the archive behind a stored link

use std::io;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, bail};
use axum::{
    Json, Router,
    body::Body,
    extract::{DefaultBodyLimit, Path, Query, State, rejection::BytesRejection},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use bytes::Bytes;
use futures::{StreamExt, future, stream};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, instrument, warn};

use crate::build_info;
use crate::cache::LinkCache;
use crate::descriptor::ArchiveRequest;
use crate::error::StreamError;
use crate::io::RetryingFetcher;
use crate::stream::{AbortSignal, ZipStreamer};

/// Capacity of the in-memory pipe between the assembler and the response body.
const STREAM_BUFFER_SIZE: usize = 64 * 1024;

/// Where `GET /download` finds list files.
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
    /// Prepended to `zsid` to form a list file URL
    pub listfile_url_prefix: Option<String>,
    /// Password sent with list file requests (the user name is empty)
    pub listfile_basic_auth: Option<String>,
}

/// State shared by every request.
pub struct AppState {
    streamer: Arc<ZipStreamer<RetryingFetcher>>,
    links: LinkCache,
    listfile_client: reqwest::Client,
    config: ServerConfig,
}

impl AppState {
    pub fn new(
        streamer: ZipStreamer<RetryingFetcher>,
        links: LinkCache,
        config: ServerConfig,
    ) -> Self {
        let listfile_client = streamer.fetcher().client().clone();
        Self {
            streamer: Arc::new(streamer),
            links,
            listfile_client,
            config,
        }
    }

    pub fn links(&self) -> &LinkCache {
        &self.links
    }
}

/// Build the axum [`Router`] with all routes and shared state.
///
/// Manifest bodies are not size limited; long file lists are what download
/// links are for.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/download", post(handle_post_download).get(handle_get_download))
        .route("/create_download_link", post(handle_create_link))
        .route("/download_link/{link_id}", get(handle_download_link))
        .layer(DefaultBodyLimit::disable())
        .with_state(state)
}

/// Periodically drop expired download links until the task is aborted.
pub fn spawn_link_sweeper(state: Arc<AppState>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let links = state.links();
            let removed = links.sweep_expired();
            if removed > 0 {
                debug!(removed, remaining = links.len(), "expired download links swept");
            }
        }
    })
}

#[derive(Debug, Deserialize)]
struct ListFileQuery {
    zsurl: Option<String>,
    zsid: Option<String>,
}

#[derive(Serialize)]
struct LinkCreated {
    status: &'static str,
    link_id: String,
}

/// `POST /download`
#[instrument(skip_all)]
async fn handle_post_download(
    State(state): State<Arc<AppState>>,
    body: Result<Bytes, BytesRejection>,
) -> Result<Response, AppError> {
    let request = parse_manifest(&read_body(body)?)?;
    Ok(stream_response(&state, request))
}

/// `GET /download?zsurl=<url>` or `GET /download?zsid=<id>`
#[instrument(skip(state))]
async fn handle_get_download(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListFileQuery>,
) -> Result<Response, AppError> {
    let url = resolve_list_file_url(&query, state.config.listfile_url_prefix.as_deref())
        .ok_or(AppError::BadRequest("invalid parameters"))?;

    let request = retrieve_list_file(&state, &url).await.map_err(|e| {
        warn!(%url, error = %format!("{e:#}"), "list file unavailable");
        AppError::NotFound("file not found")
    })?;
    Ok(stream_response(&state, request))
}

/// `POST /create_download_link`
#[instrument(skip_all)]
async fn handle_create_link(
    State(state): State<Arc<AppState>>,
    body: Result<Bytes, BytesRejection>,
) -> Result<Response, AppError> {
    let request = parse_manifest(&read_body(body)?)?;
    let link_id = state.links.insert(request);
    Ok(Json(LinkCreated {
        status: "ok",
        link_id,
    })
    .into_response())
}

/// `GET /download_link/{link_id}`
#[instrument(skip(state))]
async fn handle_download_link(
    State(state): State<Arc<AppState>>,
    Path(link_id): Path<String>,
) -> Result<Response, AppError> {
    let request = state
        .links
        .get(&link_id)
        .ok_or(AppError::NotFound("link not found"))?;
    Ok(stream_response(&state, request))
}

fn read_body(body: Result<Bytes, BytesRejection>) -> Result<Bytes, AppError> {
    body.map_err(|rejection| {
        debug!(error = %rejection.body_text(), "request body unreadable");
        AppError::BadRequest("missing body")
    })
}

fn parse_manifest(body: &[u8]) -> Result<ArchiveRequest, AppError> {
    if body.is_empty() {
        return Err(AppError::BadRequest("missing body"));
    }
    ArchiveRequest::from_json(body).map_err(|e| {
        debug!(error = %e, "rejected manifest");
        AppError::BadRequest("invalid body")
    })
}

/// `zsurl` wins; otherwise `zsid` is appended to the configured prefix.
fn resolve_list_file_url(query: &ListFileQuery, prefix: Option<&str>) -> Option<String> {
    let non_empty = |v: &Option<String>| v.as_deref().filter(|s| !s.is_empty()).map(str::to_owned);

    non_empty(&query.zsurl).or_else(|| {
        let prefix = prefix.filter(|p| !p.is_empty())?;
        non_empty(&query.zsid).map(|id| format!("{prefix}{id}"))
    })
}

async fn retrieve_list_file(state: &AppState, url: &str) -> anyhow::Result<ArchiveRequest> {
    let mut request = state
        .listfile_client
        .get(url)
        .header(header::USER_AGENT, build_info::user_agent());
    if let Some(password) = &state.config.listfile_basic_auth {
        request = request.basic_auth("", Some(password));
    }

    let response = request.send().await.context("list file request failed")?;
    if response.status() != reqwest::StatusCode::OK {
        bail!("list file server responded with {}", response.status());
    }
    let body = response.bytes().await.context("failed to read list file")?;
    let request = ArchiveRequest::from_json(&body).context("invalid list file")?;
    debug!(%url, entries = request.entries().len(), "list file retrieved");
    Ok(request)
}

/// Ends the response body with an error so the connection is dropped
/// without a terminating chunk.
struct ResponseAbort(oneshot::Sender<io::Error>);

impl AbortSignal for ResponseAbort {
    fn abort(self, reason: &StreamError) {
        // The receiver is gone when the client already disconnected.
        let _ = self.0.send(io::Error::other(reason.to_string()));
    }
}

/// Answer with headers right away and stream the archive into the body
/// from a spawned task.
fn stream_response(state: &Arc<AppState>, request: ArchiveRequest) -> Response {
    let (writer, reader) = tokio::io::duplex(STREAM_BUFFER_SIZE);
    let (abort_tx, abort_rx) = oneshot::channel::<io::Error>();

    let abort = stream::once(abort_rx).filter_map(|outcome| future::ready(outcome.ok().map(Err)));
    let body = Body::from_stream(ReaderStream::new(reader).chain(abort));

    let disposition = HeaderValue::from_str(&format!(
        "attachment; filename=\"{}\"",
        request.escaped_suggested_filename()
    ))
    .unwrap_or_else(|_| HeaderValue::from_static("attachment"));

    info!(
        entries = request.entries().len(),
        filename = request.suggested_filename(),
        compression = %state.streamer.compression(),
        "archive transfer started"
    );

    let streamer = Arc::clone(&state.streamer);
    tokio::spawn(async move {
        // Failures are logged and signalled through the abort.
        let _ = streamer
            .stream_or_abort(&request, writer, ResponseAbort(abort_tx))
            .await;
    });

    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, HeaderValue::from_static("application/zip")),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        body,
    )
        .into_response()
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Request-level failure, answered before any archive bytes are sent.
#[derive(Debug)]
pub enum AppError {
    BadRequest(&'static str),
    NotFound(&'static str),
}

#[derive(Serialize)]
struct ErrorBody {
    status: &'static str,
    error: &'static str,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
        };
        (status, Json(ErrorBody { status: "error", error })).into_response()
    }
}
