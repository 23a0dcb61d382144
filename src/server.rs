//!
//! blobsync HTTP server
//! --------------------
//! Axum-based storage protocol: REST-style endpoints under the versioned
//! `/v1` prefix mapped onto a `BlobStore`, every JSON response wrapped in the
//! `{data, error}` envelope with the status derived from the error kind.
//! Downloads carry identity in headers (the body is the raw file) and honor a
//! single `Range: bytes=start-end` request. Optional HTTP basic auth checks
//! configured users.
//!
//! Every data-carrying handler holds a `TaskTracker` token so shutdown can
//! drain in-flight uploads and downloads before the store is dropped, and the
//! shutdown `CancellationToken` is handed to long-running store scans.

use std::io::{self, SeekFrom};
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Query, Request, State};
use axum::http::header::{self, HeaderMap, HeaderValue};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use base64::Engine;
use chrono::Utc;
use futures_util::{StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::{ReaderStream, StreamReader, SyncIoBridge};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info};

use crate::config::{ServerConfig, UserConfig};
use crate::error::{Error, Result};
use crate::storage::BlobStore;
use crate::types::{format_http_date, parse_http_date, ApiError, ApiResponse, FileMetadata, FileUpload};

pub const DIGEST_PREFIX: &str = "sha256=";

/// Shared server state injected into all handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<BlobStore>,
    /// Outstanding request work; shutdown waits on it before teardown.
    pub tracker: TaskTracker,
    /// Cancelled when shutdown begins; polled by store scans.
    pub shutdown: CancellationToken,
    /// Basic-auth users; empty disables auth.
    pub users: Arc<Vec<UserConfig>>,
}

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/gen_204", get(gen_204))
        .route("/upload", put(upload))
        .route("/download", get(download))
        .route("/stat", get(stat))
        .route("/list", get(list))
        .route("/move", post(move_entry))
        .route("/delete", delete(delete_entry))
        .layer(middleware::from_fn_with_state(state.clone(), basic_auth))
        .with_state(state);

    Router::new().nest("/v1", api)
}

/// Start the server and block until shutdown; in-flight transfers are
/// drained before the store is dropped.
pub async fn run(cfg: ServerConfig) -> anyhow::Result<()> {
    let state = AppState {
        store: Arc::new(BlobStore::new(&cfg.data_dir)?),
        tracker: TaskTracker::new(),
        shutdown: CancellationToken::new(),
        users: Arc::new(cfg.users),
    };

    let app = router(state.clone());
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", cfg.http_port)).await?;
    info!(
        target: "blobsync::server",
        "listening on {} (data dir '{}', auth {})",
        listener.local_addr()?,
        cfg.data_dir,
        if state.users.is_empty() { "off" } else { "on" }
    );

    let shutdown = state.shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!(target: "blobsync::server", "shutdown requested, draining requests");
            shutdown.cancel();
        })
        .await?;

    state.tracker.close();
    state.tracker.wait().await;
    info!(target: "blobsync::server", "all requests drained, exiting");
    Ok(())
}

/// Wrap an operation result into the `{data, error}` envelope with the
/// status code derived from the error kind.
fn envelope<T: Serialize>(result: Result<T>) -> Response {
    match result {
        Ok(val) => (
            StatusCode::OK,
            Json(ApiResponse { data: Some(val), error: None }),
        )
            .into_response(),
        Err(err) => error_response(&err),
    }
}

fn error_response(err: &Error) -> Response {
    let status =
        StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (
        status,
        Json(ApiResponse::<()> {
            data: None,
            error: Some(ApiError { message: err.to_string() }),
        }),
    )
        .into_response()
}

async fn basic_auth(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Response {
    if state.users.is_empty() {
        return next.run(req).await;
    }

    let ok = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Basic "))
        .and_then(|v| base64::engine::general_purpose::STANDARD.decode(v).ok())
        .and_then(|v| String::from_utf8(v).ok())
        .and_then(|v| {
            let (user, pass) = v.split_once(':')?;
            Some(
                state
                    .users
                    .iter()
                    .any(|u| u.username == user && u.password == pass),
            )
        })
        .unwrap_or(false);

    if !ok {
        let mut resp = error_response(&Error::network("unauthorized"));
        *resp.status_mut() = StatusCode::UNAUTHORIZED;
        resp.headers_mut().insert(
            header::WWW_AUTHENTICATE,
            HeaderValue::from_static("Basic realm=\"blobsync\""),
        );
        return resp;
    }

    next.run(req).await
}

async fn gen_204() -> StatusCode {
    StatusCode::NO_CONTENT
}

#[derive(Deserialize)]
struct NameParams {
    #[serde(default)]
    name: String,
    #[serde(default)]
    overwrite: Option<String>,
    #[serde(default)]
    new_name: Option<String>,
}

fn flag(val: &Option<String>) -> bool {
    val.as_deref().is_some_and(|v| v.eq_ignore_ascii_case("true"))
}

async fn upload(
    State(state): State<AppState>,
    Query(params): Query<NameParams>,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let _work = state.tracker.token();

    let Some(size) = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
    else {
        return error_response(&Error::network("upload requires a content length"));
    };

    let modified = headers
        .get(header::LAST_MODIFIED)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_http_date)
        .unwrap_or_else(Utc::now);

    let sha256 = headers
        .get(header::ETAG)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix(DIGEST_PREFIX))
        .unwrap_or_default()
        .to_string();

    // the body streams into the container writer; the blocking store write
    // runs off the async workers
    let reader = SyncIoBridge::new(StreamReader::new(
        body.into_data_stream().map_err(io::Error::other),
    ));
    let upload = FileUpload {
        meta: FileMetadata { name: params.name, size, modified, sha256 },
        reader,
    };

    let store = state.store.clone();
    let overwrite = flag(&params.overwrite);
    let cancel = state.shutdown.clone();
    match tokio::task::spawn_blocking(move || store.put(upload, overwrite, &cancel)).await {
        Ok(result) => envelope(result),
        Err(e) => error_response(&Error::network(format!("upload task: {e}"))),
    }
}

async fn download(
    State(state): State<AppState>,
    Query(params): Query<NameParams>,
    headers: HeaderMap,
) -> Response {
    let _work = state.tracker.token();

    let (meta, mut reader) = match state.store.get(&params.name) {
        Ok(entry) => entry,
        Err(err) => return error_response(&err),
    };

    let range = match headers.get(header::RANGE).map(|v| v.to_str().unwrap_or("")) {
        Some(spec) => match parse_range(spec, meta.size) {
            Ok(range) => Some(range),
            Err(err) => return error_response(&err),
        },
        None => None,
    };

    let (status, offset, len, content_range) = match range {
        Some((start, end)) => (
            StatusCode::PARTIAL_CONTENT,
            start,
            end - start + 1,
            Some(format!("bytes {start}-{end}/{}", meta.size)),
        ),
        None => (StatusCode::OK, 0, meta.size, None),
    };

    // hand the container file to the runtime and stream the data section
    // instead of buffering it
    let (data_start, _) = match reader.data_span() {
        Ok(span) => span,
        Err(err) => return error_response(&err),
    };
    let mut file = tokio::fs::File::from_std(reader.into_inner());
    if let Err(source) = file.seek(SeekFrom::Start(data_start + offset)).await {
        return error_response(&Error::Io { path: meta.name.clone().into(), source });
    }

    // the tracker token rides the stream so shutdown drains active downloads
    let work = state.tracker.token();
    let stream = ReaderStream::new(file.take(len)).map(move |chunk| {
        let _work = &work;
        chunk
    });

    let mut resp = (status, Body::from_stream(stream)).into_response();
    let hdrs = resp.headers_mut();
    hdrs.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
    hdrs.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    hdrs.insert(
        header::LAST_MODIFIED,
        HeaderValue::from_str(&format_http_date(&meta.modified)).unwrap(),
    );
    if let Ok(val) = HeaderValue::from_str(&format!("{DIGEST_PREFIX}{}", meta.sha256)) {
        hdrs.insert(header::ETAG, val);
    }
    if let Ok(val) = HeaderValue::from_str(&format!(
        "attachment; filename={}",
        urlencoding::encode(&meta.name)
    )) {
        hdrs.insert(header::CONTENT_DISPOSITION, val);
    }
    if let Some(content_range) = content_range {
        hdrs.insert(
            header::CONTENT_RANGE,
            HeaderValue::from_str(&content_range).unwrap(),
        );
    }
    resp
}

/// Parse a single `bytes=start-end` range against a known size, returning
/// inclusive bounds. Multi-range requests, malformed specs and out-of-bounds
/// ranges all map to `UnsatisfiableRange` (never served whole silently).
fn parse_range(spec: &str, size: u64) -> Result<(u64, u64)> {
    let unsatisfiable = || Error::UnsatisfiableRange { spec: spec.to_string(), size };

    let ranges = spec.strip_prefix("bytes=").ok_or_else(unsatisfiable)?;
    if ranges.contains(',') {
        return Err(unsatisfiable());
    }

    let (from, to) = ranges.split_once('-').ok_or_else(unsatisfiable)?;
    let (start, end) = match (from, to) {
        ("", "") => return Err(unsatisfiable()),
        // suffix form: last N bytes
        ("", suffix) => {
            let n: u64 = suffix.parse().map_err(|_| unsatisfiable())?;
            if n == 0 || n > size {
                return Err(unsatisfiable());
            }
            (size - n, size - 1)
        }
        (from, "") => (from.parse().map_err(|_| unsatisfiable())?, size.saturating_sub(1)),
        (from, to) => (
            from.parse().map_err(|_| unsatisfiable())?,
            to.parse().map_err(|_| unsatisfiable())?,
        ),
    };

    if start > end || end >= size {
        return Err(unsatisfiable());
    }
    Ok((start, end))
}

async fn stat(State(state): State<AppState>, Query(params): Query<NameParams>) -> Response {
    envelope(state.store.stat(&params.name))
}

#[derive(Deserialize)]
struct ListParams {
    #[serde(default)]
    prefix: String,
    #[serde(default)]
    recursive: Option<String>,
    #[serde(default)]
    offset: Option<usize>,
    #[serde(default)]
    limit: Option<usize>,
}

async fn list(State(state): State<AppState>, Query(params): Query<ListParams>) -> Response {
    let _work = state.tracker.token();

    let result = state.store.list(
        &params.prefix,
        flag(&params.recursive),
        params.offset.unwrap_or(0),
        params.limit.unwrap_or(0),
        &state.shutdown,
    );
    if let Err(err) = &result {
        error!(target: "blobsync::server", "list '{}': {}", params.prefix, err);
    }
    envelope(result)
}

async fn move_entry(State(state): State<AppState>, Query(params): Query<NameParams>) -> Response {
    envelope(state.store.rename(
        &params.name,
        params.new_name.as_deref().unwrap_or_default(),
        flag(&params.overwrite),
    ))
}

async fn delete_entry(State(state): State<AppState>, Query(params): Query<NameParams>) -> Response {
    envelope(state.store.delete(&params.name))
}
