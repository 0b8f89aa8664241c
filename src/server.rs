//! HTTP CRUD API over the calibre library.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`    | `/health` | Service and calibre versions |
//! | `GET`    | `/books` | Paginated list (`start`, `limit`, `sort`, `search`) |
//! | `GET`    | `/books/{id}` | One book |
//! | `POST`   | `/books` | Add book files (multipart, optional `data` JSON field) |
//! | `POST`   | `/books/empty` | Add a record without files (JSON) |
//! | `PUT`    | `/books/{id}` | Update metadata (JSON) |
//! | `DELETE` | `/books/{id}` | Remove a book (`?permanent=true` skips the trash) |
//! | `GET`    | `/books/{id}/metadata` | OPF metadata |
//! | `POST`   | `/books/{id}/formats` | Attach a format (multipart) |
//! | `DELETE` | `/books/{id}/formats/{fmt}` | Drop a format |
//! | `GET`    | `/export/{id}` | Download the book file |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "conflict", "message": "Book 3 already exists. ..." } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `unsupported_media_type`
//! (415), `timeout` (408), `conflict` (409), `invalid_payload` (422),
//! `library_busy` (503), `calibre_error` (500), `internal` (500).
//!
//! calibredb calls block, so every handler moves its gateway call onto the
//! blocking pool. They still run one at a time behind the gateway lock.

use axum::{
    body::Bytes,
    extract::{Multipart, Path, Query, RawQuery, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use url::form_urlencoded;

use crate::config::Config;
use crate::error::GatewayError;
use crate::library::{is_supported_file, Library};
use crate::models::Book;
use crate::outcome::{AutomergeMode, CommandOutcome};
use crate::pagination::PaginatedView;
use crate::query::ListQuery;

const DEFAULT_START: usize = 1;
const DEFAULT_LIMIT: usize = 20;

/// Shared application state passed to all route handlers via Axum's `State` extractor.
#[derive(Clone)]
struct AppState {
    library: Arc<Library>,
}

/// Starts the HTTP server on `[server].bind`.
///
/// The library is validated before the listener is bound, so a missing
/// calibredb or library fails startup instead of the first request.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let library = Arc::new(Library::new(config)?);
    let app = build_router(library);

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    info!("calibre-rest listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}

/// All routes, bound to `library`.
pub fn build_router(library: Arc<Library>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/books", get(handle_list_books).post(handle_add_books))
        .route("/books/empty", post(handle_add_empty))
        .route(
            "/books/{id}",
            get(handle_get_book)
                .put(handle_update_book)
                .delete(handle_delete_book),
        )
        .route("/books/{id}/metadata", get(handle_show_metadata))
        .route("/books/{id}/formats", post(handle_add_format))
        .route("/books/{id}/formats/{fmt}", delete(handle_remove_format))
        .route("/export/{id}", get(handle_export))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { library })
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

/// Internal error type that converts into an Axum HTTP response.
#[derive(Debug)]
struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl AppError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::BAD_REQUEST, "bad_request", message)
}

fn unsupported_media_type(message: impl Into<String>) -> AppError {
    AppError::new(
        StatusCode::UNSUPPORTED_MEDIA_TYPE,
        "unsupported_media_type",
        message,
    )
}

fn internal(message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", message)
}

impl From<GatewayError> for AppError {
    fn from(err: GatewayError) -> Self {
        let (status, code) = match &err {
            GatewayError::Validation(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            GatewayError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            GatewayError::Timeout { .. } => (StatusCode::REQUEST_TIMEOUT, "timeout"),
            GatewayError::ConcurrencyConflict { .. } => {
                (StatusCode::SERVICE_UNAVAILABLE, "library_busy")
            }
            GatewayError::Runtime { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "calibre_error"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };
        AppError::new(status, code, err.to_string())
    }
}

/// Run a gateway call on the blocking pool.
async fn blocking<T, F>(state: &AppState, f: F) -> Result<T, AppError>
where
    F: FnOnce(&Library) -> crate::error::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let library = Arc::clone(&state.library);
    tokio::task::spawn_blocking(move || f(&library))
        .await
        .map_err(|e| internal(format!("worker failed: {}", e)))?
        .map_err(AppError::from)
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    calibre_version: String,
}

async fn handle_health(State(state): State<AppState>) -> Result<Json<HealthResponse>, AppError> {
    let calibre_version = blocking(&state, |lib| lib.version()).await?;
    Ok(Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        calibre_version,
    }))
}

// ============ Books ============

#[derive(Serialize)]
struct BookResponse {
    books: Book,
}

/// Body of add requests: book fields plus the automerge policy.
#[derive(Debug, Default, Deserialize)]
struct AddPayload {
    #[serde(default)]
    automerge: AutomergeMode,
    #[serde(flatten)]
    book: Book,
}

async fn handle_get_book(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> Result<Json<BookResponse>, AppError> {
    let book = blocking(&state, move |lib| lib.get_book(id))
        .await?
        .ok_or_else(|| {
            AppError::from(GatewayError::not_found(format!(
                "book {} does not exist",
                id
            )))
        })?;
    Ok(Json(BookResponse { books: book }))
}

/// `sort` and `search` repeat, so the query string is parsed by hand.
fn parse_list_params(raw: Option<&str>) -> Result<(usize, usize, ListQuery), AppError> {
    let mut start = DEFAULT_START;
    let mut limit = DEFAULT_LIMIT;
    let mut query = ListQuery::default();

    for (key, value) in form_urlencoded::parse(raw.unwrap_or("").as_bytes()) {
        match key.as_ref() {
            "start" => {
                start = value
                    .parse()
                    .map_err(|_| bad_request(format!("invalid start \"{}\"", value)))?
            }
            "limit" => {
                limit = value
                    .parse()
                    .map_err(|_| bad_request(format!("invalid limit \"{}\"", value)))?
            }
            "sort" | "sort[]" => query.sort.push(value.into_owned()),
            "search" | "search[]" => query.search.push(value.into_owned()),
            other => warn!("Ignoring unknown query parameter \"{}\"", other),
        }
    }

    Ok((start, limit, query))
}

async fn handle_list_books(
    State(state): State<AppState>,
    RawQuery(raw): RawQuery,
) -> Result<Response, AppError> {
    let (start, limit, query) = parse_list_params(raw.as_deref())?;

    let fetch = query.clone();
    let books = blocking(&state, move |lib| lib.get_books(&fetch, None)).await?;
    if books.is_empty() {
        return Ok(StatusCode::NO_CONTENT.into_response());
    }

    let view = PaginatedView::new(books, start, limit, query)?;
    Ok(Json(view.to_response()).into_response())
}

/// JSON body that may be empty. Non-JSON content types are rejected.
fn parse_json_body<T>(headers: &HeaderMap, body: &Bytes) -> Result<Option<T>, AppError>
where
    T: for<'de> Deserialize<'de>,
{
    if body.is_empty() {
        return Ok(None);
    }
    let is_json = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.starts_with("application/json"))
        .unwrap_or(false);
    if !is_json {
        return Err(unsupported_media_type("Only application/json allowed"));
    }
    serde_json::from_slice(body).map(Some).map_err(|e| {
        AppError::new(
            StatusCode::UNPROCESSABLE_ENTITY,
            "invalid_payload",
            e.to_string(),
        )
    })
}

fn outcome_response(outcome: CommandOutcome) -> Result<Response, AppError> {
    match outcome {
        CommandOutcome::Added { ids } => Ok((
            StatusCode::CREATED,
            Json(serde_json::json!({ "added_ids": ids })),
        )
            .into_response()),
        CommandOutcome::Merged { ids } => Ok((
            StatusCode::OK,
            Json(serde_json::json!({ "merged_ids": ids })),
        )
            .into_response()),
        CommandOutcome::DuplicateConflict { message } => {
            Err(AppError::new(StatusCode::CONFLICT, "conflict", message))
        }
        CommandOutcome::Failure {
            exit_code,
            stdout,
            stderr,
        } => Err(AppError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "calibre_error",
            format!(
                "calibredb exited with status {}.\n\nSTDOUT:\n{}\nSTDERR:\n{}",
                exit_code, stdout, stderr
            ),
        )),
    }
}

async fn handle_add_empty(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let payload: AddPayload = parse_json_body(&headers, &body)?.unwrap_or_default();
    let outcome = blocking(&state, move |lib| {
        lib.add_empty(&payload.book, payload.automerge)
    })
    .await?;
    outcome_response(outcome)
}

/// Strip a client file name down to a safe basename.
fn sanitize_filename(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    cleaned.trim_start_matches(['.', '-']).to_string()
}

/// Uploaded files saved in a temp dir, plus the optional `data` field.
struct Upload {
    dir: TempDir,
    files: Vec<PathBuf>,
    data: Option<String>,
}

async fn save_upload(mut multipart: Multipart) -> Result<Upload, AppError> {
    let dir = tempfile::tempdir().map_err(|e| internal(e.to_string()))?;
    let mut files = Vec::new();
    let mut data = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| bad_request(e.to_string()))?
    {
        let name = field.name().map(str::to_owned);
        match field.file_name().map(str::to_owned) {
            Some(file_name) => {
                if file_name.is_empty() {
                    return Err(bad_request("Invalid file or filename"));
                }
                if !is_supported_file(&file_name) {
                    return Err(bad_request(format!("Invalid filename ({})", file_name)));
                }
                // One subdirectory per file: distinct client names may sanitize alike.
                let slot = dir.path().join(files.len().to_string());
                tokio::fs::create_dir(&slot)
                    .await
                    .map_err(|e| internal(e.to_string()))?;
                let path = slot.join(sanitize_filename(&file_name));
                let bytes = field.bytes().await.map_err(|e| bad_request(e.to_string()))?;
                tokio::fs::write(&path, &bytes)
                    .await
                    .map_err(|e| internal(e.to_string()))?;
                files.push(path);
            }
            None if name.as_deref() == Some("data") => {
                data = Some(field.text().await.map_err(|e| bad_request(e.to_string()))?);
            }
            None => warn!("Ignoring multipart field {:?}", name),
        }
    }

    Ok(Upload { dir, files, data })
}

async fn handle_add_books(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Response, AppError> {
    let upload = save_upload(multipart).await?;
    if upload.files.is_empty() {
        return Err(bad_request("No file provided"));
    }

    let payload: AddPayload = match upload.data.as_deref().map(str::trim) {
        None | Some("") => AddPayload::default(),
        Some(json) => serde_json::from_str(json).map_err(|e| {
            AppError::new(
                StatusCode::UNPROCESSABLE_ENTITY,
                "invalid_payload",
                e.to_string(),
            )
        })?,
    };

    let Upload { dir, files, .. } = upload;
    let outcome = blocking(&state, move |lib| {
        let outcome = lib.add(&files, &payload.book, payload.automerge);
        drop(dir);
        outcome
    })
    .await?;
    outcome_response(outcome)
}

async fn handle_update_book(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<BookResponse>, AppError> {
    let book: Book = parse_json_body(&headers, &body)?
        .ok_or_else(|| bad_request("No data provided"))?;
    let book = blocking(&state, move |lib| lib.set_metadata(id, &book)).await?;
    Ok(Json(BookResponse { books: book }))
}

#[derive(Debug, Default, Deserialize)]
struct DeleteParams {
    #[serde(default)]
    permanent: bool,
}

async fn handle_delete_book(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    Query(params): Query<DeleteParams>,
) -> Result<StatusCode, AppError> {
    blocking(&state, move |lib| lib.remove(&[id], params.permanent)).await?;
    Ok(StatusCode::OK)
}

async fn handle_show_metadata(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> Result<Response, AppError> {
    let opf = blocking(&state, move |lib| lib.show_metadata(id)).await?;
    Ok(([(header::CONTENT_TYPE, "application/oebps-package+xml")], opf).into_response())
}

#[derive(Debug, Default, Deserialize)]
struct FormatParams {
    #[serde(default)]
    replace: bool,
    #[serde(default)]
    data_file: bool,
}

async fn handle_add_format(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    Query(params): Query<FormatParams>,
    multipart: Multipart,
) -> Result<StatusCode, AppError> {
    let Upload { dir, files, .. } = save_upload(multipart).await?;
    let [file] = <[PathBuf; 1]>::try_from(files)
        .map_err(|_| bad_request("Exactly one file must be provided"))?;

    blocking(&state, move |lib| {
        let result = lib.add_format(id, &file, params.replace, params.data_file);
        drop(dir);
        result
    })
    .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn handle_remove_format(
    State(state): State<AppState>,
    Path((id, fmt)): Path<(u64, String)>,
) -> Result<StatusCode, AppError> {
    blocking(&state, move |lib| lib.remove_format(id, &fmt)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn handle_export(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> Result<Response, AppError> {
    let (name, bytes) = blocking(&state, move |lib| {
        let dir = tempfile::tempdir()?;
        let files = lib.export(&[id], dir.path())?;
        let Some(file) = files.into_iter().next() else {
            return Err(GatewayError::NotApplied(format!(
                "export of book {} produced no files",
                id
            )));
        };
        let name = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("{}", id));
        let bytes = std::fs::read(&file)?;
        Ok((name, bytes))
    })
    .await?;

    let disposition = format!("attachment; filename=\"{}\"", sanitize_filename(&name));
    Ok((
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        bytes,
    )
        .into_response())
}
