//! HTTP API — thin routing layer over [`StorageEngine`].
//!
//! Endpoints:
//!   POST   /            multipart field `file`    → upload, returns URL
//!   GET    /{id}                                  → file content
//!   GET    /{id}/infos                            → entry metadata (JSON)
//!   DELETE /{id}                                  → delete
//!   GET    /ls?type=image/&limit=N                → live entries (JSON)
//!   anything else                                 → 404 + help text
//!
//! The engine is synchronous; every call goes through `spawn_blocking`.
//! Upload bodies are forwarded chunk by chunk over a bounded channel to the
//! blocking side, so nothing is buffered whole.

use std::io::{self, Read};
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::multipart::Field;
use axum::extract::{DefaultBodyLimit, Multipart, Path, Query, State};
use axum::http::header::{
    CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE, HOST, USER_AGENT,
};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use bytes::Buf;
use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio_stream::Stream;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::config::ServerConfig;
use crate::engine::{ListFilter, StorageEngine};
use crate::error::StashError;
use crate::storage::entry::Entry;

/// Chunks in flight between the request body and the blocking upload.
const UPLOAD_CHANNEL_DEPTH: usize = 16;
const DOWNLOAD_CHUNK: usize = 64 * 1024;

/// Shared state passed to all handlers.
pub struct AppState {
    pub engine: Arc<StorageEngine>,
    pub server: ServerConfig,
}

// ──────────────── request / response types ────────────────────────────────

#[derive(Deserialize)]
pub struct ListParams {
    #[serde(rename = "type")]
    content_type: Option<String>,
    limit: Option<usize>,
}

#[derive(Serialize)]
struct FileInfo {
    id: String,
    name: String,
    size: u64,
    sha256: String,
    #[serde(rename = "type")]
    content_type: String,
    timestamp: String,
    expire: String,
    url: String,
}

impl FileInfo {
    fn from_entry(entry: &Entry, base: &str) -> Self {
        Self {
            id: entry.id.clone(),
            name: entry.original_name.clone(),
            size: entry.size_bytes,
            sha256: entry.sha256.clone(),
            content_type: entry.content_type.clone(),
            timestamp: format_ts(entry.uploaded_at),
            expire: format_ts(entry.expires_at()),
            url: format!("{base}/{}", entry.id),
        }
    }
}

fn format_ts(secs: i64) -> String {
    Utc.timestamp_opt(secs, 0)
        .single()
        .map(|t| t.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .unwrap_or_else(|| secs.to_string())
}

// ──────────────── router ──────────────────────────────────────────────────

/// Build the axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(handle_help).post(handle_upload))
        .route("/ls", get(handle_list))
        .route("/{id}", get(handle_fetch).delete(handle_delete))
        .route("/{id}/infos", get(handle_infos))
        .fallback(handle_help)
        .layer(DefaultBodyLimit::disable())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start the HTTP server; returns when CTRL+C is received.
pub async fn start_server(state: Arc<AppState>) -> io::Result<()> {
    let addr = format!("{}:{}", state.server.bind, state.server.port);
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr, "HTTP API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Received CTRL+C, shutting down…"),
                Err(e) => error!(error = %e, "Signal error"),
            }
        })
        .await
}

// ──────────────── handlers ────────────────────────────────────────────────

async fn handle_help(headers: HeaderMap) -> Response {
    (StatusCode::NOT_FOUND, help_text(&base_url(&headers))).into_response()
}

async fn handle_upload(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Response {
    let base = base_url(&headers);

    loop {
        match multipart.next_field().await {
            Ok(Some(field)) if field.name() == Some("file") => {
                return stream_upload(&state, field, &base).await;
            }
            Ok(Some(_)) => continue,
            Ok(None) => {
                return (StatusCode::BAD_REQUEST, help_text(&base)).into_response();
            }
            Err(e) => {
                return (StatusCode::BAD_REQUEST, format!("Invalid multipart body: {e}\n"))
                    .into_response();
            }
        }
    }
}

/// Pump the multipart field into a blocking `StorageEngine::upload`.
async fn stream_upload(state: &AppState, mut field: Field<'_>, base: &str) -> Response {
    let name = field.file_name().unwrap_or_default().to_string();
    let content_type = field.content_type().map(str::to_string);

    let (tx, rx) = mpsc::channel::<io::Result<Option<Bytes>>>(UPLOAD_CHANNEL_DEPTH);
    let engine = state.engine.clone();
    let upload = tokio::task::spawn_blocking(move || {
        engine.upload(&name, content_type.as_deref(), ChannelReader::new(rx))
    });

    // If this future is dropped mid-body, `tx` goes away without the end
    // marker and the blocking side fails the upload.
    loop {
        let item = field.chunk().await.map_err(|e| {
            warn!(error = %e, "Upload stream interrupted");
            io::Error::other(e.to_string())
        });
        let last = !matches!(item, Ok(Some(_)));
        if tx.send(item).await.is_err() {
            // Upload side gave up; its error is reported below.
            break;
        }
        if last {
            break;
        }
    }
    drop(tx);

    match upload.await {
        Ok(Ok(entry)) => (StatusCode::OK, format!("{base}/{}\n", entry.id)).into_response(),
        Ok(Err(e)) => error_response(e, base),
        Err(e) => join_error(e),
    }
}

async fn handle_fetch(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let base = base_url(&headers);
    let engine = state.engine.clone();
    let (entry, file) = match tokio::task::spawn_blocking(move || engine.fetch(&id)).await {
        Ok(Ok(found)) => found,
        Ok(Err(e)) => return error_response(e, &base),
        Err(e) => return join_error(e),
    };

    let user_agent = headers
        .get(USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let disposition = if state.server.displays_inline_for(user_agent) {
        "inline"
    } else {
        "attachment"
    };

    (
        StatusCode::OK,
        [
            (CONTENT_TYPE, entry.content_type.clone()),
            (CONTENT_LENGTH, entry.size_bytes.to_string()),
            (CONTENT_DISPOSITION, content_disposition(disposition, &entry.original_name)),
        ],
        Body::from_stream(file_stream(file)),
    )
        .into_response()
}

async fn handle_infos(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let base = base_url(&headers);
    let engine = state.engine.clone();
    match tokio::task::spawn_blocking(move || engine.inspect(&id)).await {
        Ok(Ok(entry)) => Json(FileInfo::from_entry(&entry, &base)).into_response(),
        Ok(Err(e)) => error_response(e, &base),
        Err(e) => join_error(e),
    }
}

async fn handle_delete(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    if state.server.is_disabled("delete") {
        info!("[delete] Tried to call delete but this url is disabled");
        return (StatusCode::FORBIDDEN, "Administrator disabled the delete option.\n")
            .into_response();
    }

    let base = base_url(&headers);
    let engine = state.engine.clone();
    match tokio::task::spawn_blocking(move || engine.delete(&id)).await {
        Ok(Ok(entry)) => (StatusCode::OK, format!("File {} deleted\n", entry.id)).into_response(),
        Ok(Err(e)) => error_response(e, &base),
        Err(e) => join_error(e),
    }
}

async fn handle_list(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListParams>,
    headers: HeaderMap,
) -> Response {
    if state.server.is_disabled("ls") {
        info!("[ls] Tried to call /ls but this url is disabled");
        return (StatusCode::FORBIDDEN, "Administrator disabled the /ls option.\n")
            .into_response();
    }

    let base = base_url(&headers);
    let filter = ListFilter { content_type_prefix: params.content_type, limit: params.limit };
    let engine = state.engine.clone();
    match tokio::task::spawn_blocking(move || engine.list(&filter)).await {
        Ok(Ok(entries)) => {
            let infos: Vec<FileInfo> =
                entries.iter().map(|e| FileInfo::from_entry(e, &base)).collect();
            Json(infos).into_response()
        }
        Ok(Err(e)) => error_response(e, &base),
        Err(e) => join_error(e),
    }
}

// ──────────────── helpers ─────────────────────────────────────────────────

fn error_response(err: StashError, base: &str) -> Response {
    let status = match &err {
        StashError::NotFound { .. } | StashError::Expired { .. } => {
            return (StatusCode::NOT_FOUND, help_text(base)).into_response();
        }
        StashError::InvalidUpload(_) => StatusCode::BAD_REQUEST,
        StashError::ResourceExhausted { .. } | StashError::StoreUnavailable(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        StashError::IndexCorrupt(_)
        | StashError::BlobIo { .. }
        | StashError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        error!(error = %err, "Request failed");
    }
    (status, format!("{err}\n")).into_response()
}

fn join_error(e: tokio::task::JoinError) -> Response {
    error!(error = %e, "Blocking storage task failed");
    (StatusCode::INTERNAL_SERVER_ERROR, "Internal error\n").into_response()
}

fn base_url(headers: &HeaderMap) -> String {
    let host = headers
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost");
    let scheme = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("http");
    format!("{scheme}://{host}")
}

fn help_text(base: &str) -> String {
    let helps = [
        ("Upload a file:", format!("curl {base} -F file=@**filename**")),
        ("View all uploaded files:", format!("curl {base}/ls")),
        ("Get infos about one file:", format!("curl {base}/**file_id**/infos")),
        ("Get a file:", format!("curl -JO {base}/**file_id**")),
        ("Delete a file:", format!("curl -XDELETE {base}/**id**")),
        (
            "Create an alias for cli usage:",
            format!("stash() {{ curl -F file=@\"$1\" {base}; }}"),
        ),
    ];
    let mut out = String::new();
    for (what, how) in helps {
        out.push_str(&format!("{what:<32}{how}\n"));
    }
    out
}

/// `attachment; filename="x"; filename*=UTF-8''x`, ASCII-only so it is
/// always a valid header value.
fn content_disposition(kind: &str, name: &str) -> String {
    let ascii: String = name
        .chars()
        .map(|c| match c {
            '"' | '\\' => '_',
            c if c.is_ascii_graphic() || c == ' ' => c,
            _ => '_',
        })
        .collect();
    let mut encoded = String::with_capacity(name.len());
    for b in name.bytes() {
        if b.is_ascii_alphanumeric() || b"-._~".contains(&b) {
            encoded.push(b as char);
        } else {
            encoded.push_str(&format!("%{b:02X}"));
        }
    }
    format!("{kind}; filename=\"{ascii}\"; filename*=UTF-8''{encoded}")
}

fn file_stream(file: std::fs::File) -> impl Stream<Item = io::Result<Bytes>> {
    async_stream::try_stream! {
        let mut file = tokio::fs::File::from_std(file);
        let mut buf = vec![0u8; DOWNLOAD_CHUNK];
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            yield Bytes::copy_from_slice(&buf[..n]);
        }
    }
}

/// Blocking `Read` over the chunks the async handler forwards.
///
/// `Ok(None)` marks the end of the body. `Err` means the client stream
/// broke. A channel that closes before the end marker is a cancelled
/// request and reads as `UnexpectedEof`.
struct ChannelReader {
    rx: mpsc::Receiver<io::Result<Option<Bytes>>>,
    current: Bytes,
    finished: bool,
}

impl ChannelReader {
    fn new(rx: mpsc::Receiver<io::Result<Option<Bytes>>>) -> Self {
        Self { rx, current: Bytes::new(), finished: false }
    }
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.current.is_empty() {
            if self.finished {
                return Ok(0);
            }
            match self.rx.blocking_recv() {
                Some(Ok(Some(chunk))) => self.current = chunk,
                Some(Ok(None)) => self.finished = true,
                Some(Err(e)) => return Err(e),
                None => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "request body ended before the upload completed",
                    ))
                }
            }
        }
        let n = buf.len().min(self.current.len());
        buf[..n].copy_from_slice(&self.current[..n]);
        self.current.advance(n);
        Ok(n)
    }
}
