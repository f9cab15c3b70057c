use std::{
    io::{self, SeekFrom},
    path::{Path, PathBuf},
    sync::Arc,
};

use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderMap, HeaderValue, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    Router,
};
use futures::TryStreamExt;
use shared::{domain::FileName, error::AddressError};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::{AsyncReadExt, AsyncSeekExt},
};
use tokio_util::io::ReaderStream;
use tower_http::{set_header::SetResponseHeaderLayer, trace::TraceLayer};
use tracing::{debug, warn, Instrument, Span};

use crate::range::{parse_range, RangeError};

pub const PARQUET_CONTENT_TYPE: &str = "application/vnd.apache.parquet";

/// The one file a data-plane server exposes, fixed at construction.
#[derive(Debug, Clone)]
pub struct ServedFile {
    path: PathBuf,
    name: FileName,
    request_path: String,
}

impl ServedFile {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, AddressError> {
        let path = path.into();
        let name = FileName::from_path(&path)?;
        let request_path = name.url_path();
        Ok(Self {
            path,
            name,
            request_path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn name(&self) -> &FileName {
        &self.name
    }

    pub fn request_path(&self) -> &str {
        &self.request_path
    }
}

#[derive(Debug, Error)]
pub enum FileServerError {
    #[error("File not found. Please use {expected}")]
    WrongPath { expected: String },
    #[error("File not found on server")]
    Missing,
    #[error(transparent)]
    Range(#[from] RangeError),
    #[error("Unsupported method: {0}")]
    UnsupportedMethod(Method),
    #[error("Internal server error: {0}")]
    Io(#[from] io::Error),
}

impl FileServerError {
    fn status(&self) -> StatusCode {
        match self {
            Self::WrongPath { .. } | Self::Missing => StatusCode::NOT_FOUND,
            Self::Range(RangeError::Malformed) => StatusCode::BAD_REQUEST,
            Self::Range(RangeError::Unsatisfiable) => StatusCode::RANGE_NOT_SATISFIABLE,
            Self::UnsupportedMethod(_) | Self::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn from_fs(error: io::Error) -> Self {
        if error.kind() == io::ErrorKind::NotFound {
            Self::Missing
        } else {
            Self::Io(error)
        }
    }
}

impl IntoResponse for FileServerError {
    fn into_response(self) -> Response {
        (self.status(), self.to_string()).into_response()
    }
}

#[derive(Clone)]
struct DataPlaneState {
    file: Arc<ServedFile>,
    span: Span,
}

/// HTTP server for a single file with single-range support and permissive
/// CORS, so a browser viewer on another origin can read it piecewise.
pub struct RangeFileServer {
    state: DataPlaneState,
}

impl RangeFileServer {
    pub fn new(file: ServedFile, span: Span) -> Self {
        Self {
            state: DataPlaneState {
                file: Arc::new(file),
                span,
            },
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .fallback(serve_file)
            .with_state(self.state.clone())
            .layer(SetResponseHeaderLayer::overriding(
                header::ACCESS_CONTROL_ALLOW_ORIGIN,
                HeaderValue::from_static("*"),
            ))
            .layer(SetResponseHeaderLayer::overriding(
                header::ACCESS_CONTROL_ALLOW_METHODS,
                HeaderValue::from_static("GET, HEAD, OPTIONS"),
            ))
            .layer(SetResponseHeaderLayer::overriding(
                header::ACCESS_CONTROL_ALLOW_HEADERS,
                HeaderValue::from_static("*"),
            ))
            .layer(TraceLayer::new_for_http())
    }
}

async fn serve_file(
    State(state): State<DataPlaneState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let file = state.file.clone();
    let result = async move {
        match method {
            Method::OPTIONS => Ok(StatusCode::OK.into_response()),
            Method::GET => respond(&file, &uri, &headers, true).await,
            Method::HEAD => respond(&file, &uri, &headers, false).await,
            other => Err(FileServerError::UnsupportedMethod(other)),
        }
    }
    .instrument(state.span.clone())
    .await;

    result.unwrap_or_else(|error| {
        let _entered = state.span.enter();
        debug!(%error, "request rejected");
        error.into_response()
    })
}

async fn respond(
    file: &ServedFile,
    uri: &Uri,
    headers: &HeaderMap,
    with_body: bool,
) -> Result<Response, FileServerError> {
    let requested = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| uri.path());
    if requested != file.request_path() {
        return Err(FileServerError::WrongPath {
            expected: file.request_path().to_string(),
        });
    }

    let file_size = fs::metadata(file.path())
        .await
        .map_err(FileServerError::from_fs)?
        .len();

    // HEAD always describes the whole file.
    let range = match headers.get(header::RANGE).filter(|_| with_body) {
        Some(value) => {
            let value = value.to_str().map_err(|_| RangeError::Malformed)?;
            let resolved = parse_range(value, file_size)?;
            if let Some(requested_end) = resolved.clamped_from {
                warn!(
                    requested_end,
                    file_size,
                    "range end past end of file; clamping to last byte"
                );
            }
            Some(resolved.range)
        }
        None => None,
    };

    let (status, start, content_length) = match range {
        Some(range) => (StatusCode::PARTIAL_CONTENT, range.start, range.len()),
        None => (StatusCode::OK, 0, file_size),
    };

    let mut response_headers = file_headers(file, content_length);
    if let Some(range) = range {
        if let Ok(value) = HeaderValue::from_str(&range.content_range(file_size)) {
            response_headers.insert(header::CONTENT_RANGE, value);
        }
    }

    if !with_body {
        debug!(file_size, "head");
        return Ok((status, response_headers).into_response());
    }

    let mut handle = File::open(file.path())
        .await
        .map_err(FileServerError::from_fs)?;
    if start > 0 {
        handle.seek(SeekFrom::Start(start)).await?;
    }
    debug!(status = status.as_u16(), start, content_length, file_size, "streaming");

    let stream = ReaderStream::new(handle.take(content_length)).inspect_err(|error| {
        warn!(%error, "read failed while streaming file body");
    });
    Ok((status, response_headers, Body::from_stream(stream)).into_response())
}

fn file_headers(file: &ServedFile, content_length: u64) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(content_length));
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(PARQUET_CONTENT_TYPE),
    );
    if let Ok(value) = HeaderValue::from_str(&format!("attachment; filename=\"{}\"", file.name())) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    headers
}

#[cfg(test)]
#[path = "tests/file_server_tests.rs"]
mod tests;
