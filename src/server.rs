//! HTTP API
//!
//! ## Endpoints
//!
//! - `GET /health`, `GET /healthz`, `GET /version`
//! - `GET /api/dpi/csv/template` - Empty catalog CSV
//! - `POST /api/dpi/csv/save` - Import a catalog CSV (raw body)
//! - `GET /api/dpi/csv/catalogo` - Current catalog
//! - `GET /api/dpi/csv/export?gruppo=` - Catalog as CSV attachment
//! - `GET /api/dpi/csv/imports` - Import audit log
//! - `GET /api/dpi/scadenze` - Catalog items with expiry status
//! - `POST /api/dpi/dashboard/refresh` - Rebuild dashboard files and notify
//! - `GET /api/dpi/dashboard` - Last dashboard snapshot
//! - `GET /` - HTML cruscotto of the catalog
//!
//! With `TPI_STAGING_TOKEN` set, everything but `/health*` needs a matching
//! `X-TPI-Token` header.

use crate::catalog::{csv_template, export_csv, CatalogStore, ClassifiedItem};
use crate::classifier::ClassificationSummary;
use crate::config::Config;
use crate::dashboard::{self, Dashboard, DashboardRun};
use crate::notifier::notify;
use crate::parser::{parse_catalog_csv, write_reject_log, ColumnError, ImportError};
use crate::rate_limit::RateLimiter;
use crate::store::{apply_import, CatalogRepository, ImportRecord, StoreError};
use axum::{
    body::Bytes,
    extract::{rejection::BytesRejection, ConnectInfo, DefaultBodyLimit, Query, Request, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode},
    middleware::{self, Next},
    response::{Html, IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::{Local, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

const REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");
const CORRELATION_ID: HeaderName = HeaderName::from_static("x-correlation-id");
const TPI_TOKEN: HeaderName = HeaderName::from_static("x-tpi-token");

/// Tracked clients above which idle entries are pruned
const RATE_PRUNE_THRESHOLD: usize = 1024;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    repo: Arc<Mutex<Box<dyn CatalogRepository>>>,
    limiter: Arc<RateLimiter>,
}

impl AppState {
    pub fn new(config: Config, repo: Box<dyn CatalogRepository>) -> Self {
        let limiter = RateLimiter::new(config.rate_burst, config.rate_window);
        AppState {
            config: Arc::new(config),
            repo: Arc::new(Mutex::new(repo)),
            limiter: Arc::new(limiter),
        }
    }

    fn repo(&self) -> Result<MutexGuard<'_, Box<dyn CatalogRepository>>, ApiError> {
        self.repo
            .lock()
            .map_err(|_| ApiError::Internal("catalog lock poisoned".to_string()))
    }
}

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    PayloadTooLarge(String),

    #[error("{0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        // Internal details (paths, driver messages) stay in the log
        let detail = match self {
            ApiError::Internal(message) => {
                tracing::error!("Request failed: {}", message);
                "Internal Server Error".to_string()
            }
            other => other.to_string(),
        };

        (status, Json(json!({ "detail": detail }))).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        ApiError::Internal(e.to_string())
    }
}

impl From<ImportError> for ApiError {
    fn from(e: ImportError) -> Self {
        match e {
            ImportError::Io { .. } | ImportError::Write { .. } => {
                ApiError::Internal(format!("{:#}", anyhow::Error::from(e)))
            }
            _ => ApiError::BadRequest(e.to_string()),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        ApiError::Internal(format!("{:#}", e))
    }
}

type ApiResult<T> = Result<T, ApiError>;

// ============================================================================
// ROUTER
// ============================================================================

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    let api_routes = Router::new()
        .route("/dpi/csv/template", get(template_handler))
        .route("/dpi/csv/save", post(save_handler))
        .route("/dpi/csv/catalogo", get(catalog_handler))
        .route("/dpi/csv/export", get(export_handler))
        .route("/dpi/csv/imports", get(imports_handler))
        .route("/dpi/scadenze", get(expiry_handler))
        .route("/dpi/dashboard", get(dashboard_handler))
        .route("/dpi/dashboard/refresh", post(refresh_handler))
        .layer(DefaultBodyLimit::max(state.config.max_upload_bytes.saturating_add(1)))
        .route_layer(middleware::from_fn_with_state(state.clone(), rate_limit));

    Router::new()
        .route("/", get(cruscotto_handler))
        .route("/health", get(health_handler))
        .route("/healthz", get(healthz_handler))
        .route("/version", get(version_handler))
        .nest("/api", api_routes)
        .layer(middleware::from_fn_with_state(state.clone(), token_guard))
        .layer(middleware::from_fn_with_state(state.clone(), security_headers))
        .layer(cors_layer(&state.config))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(request_id))
        .with_state(state)
}

fn cors_layer(config: &Config) -> CorsLayer {
    if !config.is_prod() {
        return CorsLayer::permissive();
    }

    let origins: Vec<HeaderValue> = config
        .cors_origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any)
}

// ============================================================================
// MIDDLEWARE
// ============================================================================

/// Propagate or assign a request id and echo it on the response
async fn request_id(mut request: Request, next: Next) -> Response {
    let incoming = request
        .headers()
        .get(&REQUEST_ID)
        .or_else(|| request.headers().get(&CORRELATION_ID))
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .and_then(|v| HeaderValue::from_str(v).ok());

    let id = incoming.unwrap_or_else(|| {
        HeaderValue::from_str(&uuid::Uuid::new_v4().to_string())
            .unwrap_or_else(|_| HeaderValue::from_static("unknown"))
    });

    request.headers_mut().insert(REQUEST_ID, id.clone());
    let mut response = next.run(request).await;
    response.headers_mut().insert(REQUEST_ID, id);
    response
}

async fn security_headers(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();

    headers.insert(header::X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(header::REFERRER_POLICY, HeaderValue::from_static("no-referrer"));
    if state.config.is_prod() {
        headers.insert(
            header::STRICT_TRANSPORT_SECURITY,
            HeaderValue::from_static("max-age=31536000; includeSubDomains"),
        );
    }

    response
}

/// Staging access control: a shared token in `X-TPI-Token`
async fn token_guard(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let Some(expected) = state.config.staging_token.as_deref() else {
        return next.run(request).await;
    };
    if request.uri().path().starts_with("/health") {
        return next.run(request).await;
    }

    let provided = request.headers().get(&TPI_TOKEN).and_then(|v| v.to_str().ok());
    if provided != Some(expected) {
        tracing::warn!(path = %request.uri().path(), "Missing or invalid X-TPI-Token");
        return ApiError::Unauthorized("Unauthorized: missing or invalid X-TPI-Token".to_string())
            .into_response();
    }

    next.run(request).await
}

async fn rate_limit(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let client = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string());

    if state.limiter.tracked_clients() > RATE_PRUNE_THRESHOLD {
        state.limiter.prune(std::time::Instant::now());
    }

    if !state.limiter.check(&client) {
        tracing::warn!(client = %client, "Rate limit exceeded");
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({ "detail": "Too many requests" })),
        )
            .into_response();
    }

    next.run(request).await
}

// ============================================================================
// SERVICE ENDPOINTS
// ============================================================================

/// GET /health
async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// GET /healthz
async fn healthz_handler() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "time": Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
    }))
}

#[derive(Debug, Serialize)]
pub struct VersionResponse {
    pub app: &'static str,
    pub version: String,
    pub git_sha: String,
    pub build_time: String,
    pub env: &'static str,
}

/// GET /version
async fn version_handler(State(state): State<AppState>) -> Json<VersionResponse> {
    let config = &state.config;
    Json(VersionResponse {
        app: "tpi-evoluto",
        version: config.app_version.clone(),
        git_sha: config.git_sha.clone(),
        build_time: config.build_time.clone(),
        env: config.env.as_str(),
    })
}

// ============================================================================
// CATALOG
// ============================================================================

/// GET /api/dpi/csv/template
async fn template_handler() -> impl IntoResponse {
    csv_response(csv_template(), "catalogo_template.csv")
}

#[derive(Debug, Deserialize)]
pub struct SaveQuery {
    /// Group applied to rows without one
    pub gruppo: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SaveResponse {
    pub status: &'static str,
    pub saved: bool,
    pub csv_path: String,
    pub rows_parsed: usize,
    pub updated_existing: usize,
    pub inserted: usize,
    pub skipped: usize,
    pub total_items: usize,
    pub import_id: String,
    /// Rows refused by validation and left out of the merge
    pub invalid: usize,
    #[serde(rename = "rejectLog")]
    pub reject_log: Option<String>,
    #[serde(rename = "correlationId")]
    pub correlation_id: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub missing_required_headers: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub unknown_headers: Vec<String>,
}

/// POST /api/dpi/csv/save
async fn save_handler(
    State(state): State<AppState>,
    Query(query): Query<SaveQuery>,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> ApiResult<Json<SaveResponse>> {
    let too_large = || {
        ApiError::PayloadTooLarge(format!(
            "File too large (max {} bytes)",
            state.config.max_upload_bytes
        ))
    };

    let body = body.map_err(|rejection| {
        if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
            too_large()
        } else {
            ApiError::BadRequest(rejection.body_text())
        }
    })?;

    if body.iter().all(u8::is_ascii_whitespace) {
        return Err(ApiError::BadRequest("Empty CSV".to_string()));
    }
    if body.len() > state.config.max_upload_bytes {
        return Err(too_large());
    }

    let csv_path = archive_upload(&state.config, &body)?;
    let mut import = parse_catalog_csv(&body, query.gruppo.as_deref())?;
    let rejected = import.take_invalid();
    if import.has_warnings() {
        tracing::warn!(
            missing = ?import.missing_required_headers,
            unknown = ?import.unknown_headers,
            "Catalog upload has header warnings"
        );
    }

    let source_name = csv_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let receipt = {
        let mut repo = state.repo()?;
        apply_import(&mut **repo, &import.rows, &source_name, &body)?
    };

    let reject_log = if rejected.is_empty() {
        None
    } else {
        let dir = state.config.rejects_dir();
        let path = write_reject_log(&dir, &receipt.record.import_id, &rejected)?;
        Some(path.display().to_string())
    };

    let correlation_id = headers
        .get(&REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    tracing::info!(
        correlation_id = %correlation_id,
        import_id = %receipt.record.import_id,
        invalid = rejected.len(),
        "Catalog upload saved"
    );

    Ok(Json(SaveResponse {
        status: "ok",
        saved: true,
        csv_path: csv_path.display().to_string(),
        rows_parsed: receipt.outcome.parsed_count,
        updated_existing: receipt.outcome.updated_count,
        inserted: receipt.outcome.inserted_count,
        skipped: receipt.outcome.skipped_count,
        total_items: receipt.total_items,
        import_id: receipt.record.import_id,
        invalid: rejected.len(),
        reject_log,
        correlation_id,
        missing_required_headers: import.missing_required_headers,
        unknown_headers: import.unknown_headers,
    }))
}

/// Keep a raw copy of every upload
fn archive_upload(config: &Config, body: &[u8]) -> ApiResult<std::path::PathBuf> {
    let dir = config.imports_dir();
    std::fs::create_dir_all(&dir)
        .map_err(|e| ApiError::Internal(format!("Failed to create {}: {}", dir.display(), e)))?;

    let path = dir.join(format!("catalogo_{}.csv", Local::now().format("%Y%m%d_%H%M%S")));
    std::fs::write(&path, body)
        .map_err(|e| ApiError::Internal(format!("Failed to write {}: {}", path.display(), e)))?;

    Ok(path)
}

fn load_catalog(state: &AppState) -> ApiResult<CatalogStore> {
    let repo = state.repo()?;
    Ok(repo.load()?)
}

/// GET /api/dpi/csv/catalogo
async fn catalog_handler(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let store = load_catalog(&state)?;
    Ok(Json(json!({
        "count": store.len(),
        "items": store.items(),
    })))
}

#[derive(Debug, Deserialize)]
pub struct ExportQuery {
    pub gruppo: Option<String>,
}

/// GET /api/dpi/csv/export
async fn export_handler(
    State(state): State<AppState>,
    Query(query): Query<ExportQuery>,
) -> ApiResult<Response> {
    let store = load_catalog(&state)?;
    let group = query.gruppo.as_deref().map(str::trim).filter(|g| !g.is_empty());

    let (content, filename) = match group {
        Some(group) => {
            let items = store.filter_by_group(group);
            if items.is_empty() {
                return Err(ApiError::NotFound(format!("No items in group '{}'", group)));
            }
            (
                export_csv(items)?,
                format!("catalogo_{}.csv", urlencoding::encode(group)),
            )
        }
        None => (export_csv(store.items())?, "catalogo.csv".to_string()),
    };

    Ok(csv_response(content, &filename))
}

fn csv_response(content: String, filename: &str) -> Response {
    let disposition = format!("attachment; filename=\"{}\"", filename);
    (
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        content,
    )
        .into_response()
}

/// GET /api/dpi/csv/imports
async fn imports_handler(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let imports: Vec<ImportRecord> = state.repo()?.imports()?;
    Ok(Json(json!({
        "count": imports.len(),
        "imports": imports,
    })))
}

// ============================================================================
// EXPIRY / DASHBOARD
// ============================================================================

#[derive(Debug, Serialize)]
struct ExpiryResponse<'a> {
    summary: ClassificationSummary,
    items: Vec<ClassifiedItem<'a>>,
}

/// GET /api/dpi/scadenze
async fn expiry_handler(State(state): State<AppState>) -> ApiResult<Response> {
    let store = load_catalog(&state)?;
    let (items, summary) = store.classify(&state.config.classifier(), Local::now().date_naive());

    Ok(Json(ExpiryResponse { summary, items }).into_response())
}

#[derive(Debug, Serialize)]
pub struct RefreshResponse {
    #[serde(flatten)]
    pub run: DashboardRun,
    pub notify: serde_json::Value,
}

/// POST /api/dpi/dashboard/refresh
async fn refresh_handler(State(state): State<AppState>) -> ApiResult<Json<RefreshResponse>> {
    let config = &state.config;
    if !config.scadenzario_path.exists() {
        return Err(ApiError::NotFound(format!(
            "Schedule not found: {}",
            config.scadenzario_path.display()
        )));
    }

    let run = dashboard::refresh(config, Local::now().date_naive()).map_err(refresh_error)?;

    // Webhook failures are reported, never fatal to the refresh
    let notify = match notify(&config.notify, &run.feed).await {
        Ok(outcome) => serde_json::to_value(outcome).unwrap_or_default(),
        Err(e) => {
            tracing::warn!("Notification failed: {}", e);
            json!({ "result": "failed", "error": e.to_string() })
        }
    };

    Ok(Json(RefreshResponse { run, notify }))
}

/// Unusable schedules are the caller's problem; failing to write is ours
fn refresh_error(e: anyhow::Error) -> ApiError {
    let bad_schedule = e.downcast_ref::<ColumnError>().is_some()
        || matches!(
            e.downcast_ref::<ImportError>(),
            Some(ImportError::Csv { .. } | ImportError::MissingHeader)
        );

    if bad_schedule {
        ApiError::BadRequest(format!("{:#}", e))
    } else {
        ApiError::Internal(format!("{:#}", e))
    }
}

/// GET /api/dpi/dashboard
async fn dashboard_handler(State(state): State<AppState>) -> ApiResult<Json<Dashboard>> {
    dashboard::load_dashboard(&state.config.dashboard_json_path())?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound("Dashboard not generated yet".to_string()))
}

/// GET /
async fn cruscotto_handler(State(state): State<AppState>) -> ApiResult<Html<String>> {
    let store = load_catalog(&state)?;
    let (items, summary) = store.classify(&state.config.classifier(), Local::now().date_naive());
    let rows = dashboard::rows_from_items(&items);

    Ok(Html(Dashboard::new(&summary, &rows).render_html()))
}
