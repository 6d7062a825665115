//! HTTP server for the shape API
//!
//! ## Endpoints
//!
//! | Method & Path | Purpose |
//! |---|---|
//! | `GET /v1/shape` | Snapshot, log and long-poll reads |
//! | `DELETE /v1/shape` | Remove a shape by `handle` or every shape of a `table` |
//! | `DELETE /v1/shape/:handle` | Remove a shape by handle |
//! | `OPTIONS /v1/shape` | CORS preflight |
//! | `GET /health`, `GET /v1/health` | Liveness |
//!
//! Every response carries `x-request-id` and `electric-server`.

use crate::auth::{secret_auth_middleware, SecretAuth};
use crate::error::{panic_response, ApiError, ApiResult};
use axum::extract::rejection::QueryRejection;
use axum::extract::{Path, Query, Request, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get};
use axum::{Json, Router};
use electric_core::ident::parse_table;
use electric_core::reader::{
    HEADER_CURSOR, HEADER_HANDLE, HEADER_OFFSET, HEADER_SCHEMA, HEADER_UP_TO_DATE,
};
use electric_core::{Error, Handle, LogOffset, ReadRequest, ReadResponse, Reader, Shape, ShapeCache, ShapeParams};
use serde::{Deserialize, Serialize};
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, info_span, warn, Instrument};

pub const X_REQUEST_ID: &str = "x-request-id";
pub const ELECTRIC_SERVER: &str = "electric-server";

/// Value of the `electric-server` header
pub const SERVER_VERSION: &str = concat!("electric-rs/", env!("CARGO_PKG_VERSION"));

/// Shared handler state
pub struct AppState {
    pub reader: Reader,
}

impl AppState {
    fn cache(&self) -> &ShapeCache {
        self.reader.cache()
    }
}

/// Shape API server
pub struct ShapeServer {
    state: Arc<AppState>,
    auth: Option<SecretAuth>,
}

impl ShapeServer {
    pub fn new(reader: Reader) -> Self {
        Self {
            state: Arc::new(AppState { reader }),
            auth: None,
        }
    }

    /// Require `secret` on shape requests
    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.auth = Some(SecretAuth::new(secret));
        self
    }

    /// Build the Axum router
    pub fn router(&self) -> Router {
        let mut shapes = Router::new()
            .route("/v1/shape", get(get_shape).delete(delete_shape))
            .route("/v1/shape/:handle", delete(delete_shape_by_handle));
        if let Some(auth) = &self.auth {
            shapes = shapes.route_layer(middleware::from_fn_with_state(
                auth.clone(),
                secret_auth_middleware,
            ));
        }

        Router::new()
            .route("/", get(root_handler))
            .route("/health", get(health_handler))
            .route("/v1/health", get(health_handler))
            .merge(shapes)
            .with_state(Arc::clone(&self.state))
            .layer(CatchPanicLayer::custom(panic_response))
            .layer(cors_layer())
            .layer(middleware::from_fn(request_context))
            .layer(middleware::from_fn(preflight_no_content))
            .layer(TraceLayer::new_for_http())
    }

    /// Serve until `shutdown` fires, then give in-flight requests `drain`
    /// to complete
    pub async fn run(
        self,
        addr: SocketAddr,
        shutdown: &broadcast::Sender<()>,
        drain: Duration,
    ) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!("Shape API listening on http://{}", addr);

        let mut stop = shutdown.subscribe();
        let mut deadline = shutdown.subscribe();
        let server = axum::serve(listener, self.router())
            .with_graceful_shutdown(async move {
                let _ = stop.recv().await;
            })
            .into_future();

        tokio::select! {
            result = server => result?,
            _ = async move {
                let _ = deadline.recv().await;
                tokio::time::sleep(drain).await;
            } => {
                warn!(drain_secs = drain.as_secs(), "Drain deadline passed, closing open connections");
            }
        }
        Ok(())
    }
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::ACCEPT, header::IF_NONE_MATCH])
        .expose_headers([
            HeaderName::from_static(HEADER_HANDLE),
            HeaderName::from_static(HEADER_OFFSET),
            HeaderName::from_static(HEADER_SCHEMA),
            HeaderName::from_static(HEADER_UP_TO_DATE),
            HeaderName::from_static(HEADER_CURSOR),
            header::ETAG,
            header::CACHE_CONTROL,
        ])
        .max_age(Duration::from_secs(86_400))
}

/// Tag the request with an id (taken from `x-request-id` or generated),
/// trace it under that id and stamp the response
async fn request_context(request: Request, next: Next) -> Response {
    let request_id = request
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(new_request_id);

    let span = info_span!("request", request_id = %request_id);
    let mut response = next.run(request).instrument(span).await;

    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(X_REQUEST_ID, value);
    }
    headers.insert(ELECTRIC_SERVER, HeaderValue::from_static(SERVER_VERSION));
    response
}

fn new_request_id() -> String {
    hex::encode(rand::random::<[u8; 16]>())
}

/// Preflight answers are `204 No Content`
async fn preflight_no_content(request: Request, next: Next) -> Response {
    let preflight = request.method() == Method::OPTIONS;
    let mut response = next.run(request).await;
    if preflight && response.status() == StatusCode::OK {
        *response.status_mut() = StatusCode::NO_CONTENT;
    }
    response
}

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Serialize)]
struct RootResponse {
    name: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

/// Query parameters of `GET /v1/shape`
#[derive(Debug, Default, Deserialize)]
pub struct ShapeQuery {
    pub table: Option<String>,
    #[serde(rename = "where")]
    pub where_clause: Option<String>,
    pub columns: Option<String>,
    pub replica: Option<String>,
    pub handle: Option<String>,
    pub offset: Option<String>,
    pub live: Option<String>,
    pub cursor: Option<String>,
}

impl ShapeQuery {
    /// Validate the parameters into a read request
    pub fn into_read_request(self) -> ApiResult<ReadRequest> {
        let handle = self
            .handle
            .as_deref()
            .filter(|h| !h.is_empty())
            .map(Handle::parse)
            .transpose()
            .map_err(Error::from)?;

        let offset = match self.offset.as_deref() {
            None | Some("") => LogOffset::BeforeAll,
            Some(offset) => LogOffset::parse(offset)?,
        };

        let table = self
            .table
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| ApiError::BadRequest("table is required".to_string()))?;
        let shape = Shape::from_params(&ShapeParams {
            table,
            where_clause: self.where_clause.as_deref(),
            columns: self.columns.as_deref(),
            replica: self.replica.as_deref(),
        })?;

        let live = matches!(self.live.as_deref(), Some("true") | Some("1"));

        Ok(ReadRequest {
            handle,
            shape: Some(shape),
            offset,
            live,
            cursor: self.cursor,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
struct DeleteQuery {
    handle: Option<String>,
    table: Option<String>,
}

fn query_params<T>(query: Result<Query<T>, QueryRejection>) -> ApiResult<T> {
    query
        .map(|Query(params)| params)
        .map_err(|e| ApiError::BadRequest(e.body_text()))
}

// ============================================================================
// Handlers
// ============================================================================

async fn root_handler() -> Json<RootResponse> {
    Json(RootResponse {
        name: "electric",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn get_shape(
    State(state): State<Arc<AppState>>,
    query: Result<Query<ShapeQuery>, QueryRejection>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let request = query_params(query)?.into_read_request()?;
    let read = state.reader.read(request).await?;
    debug!(
        handle = %read.handle,
        offset = %read.offset,
        items = read.items.len(),
        up_to_date = read.up_to_date,
        "Served shape read"
    );

    let not_modified = headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|tag| tag == read.etag);

    let mut response = if not_modified {
        StatusCode::NOT_MODIFIED.into_response()
    } else {
        let body = read.body()?;
        (
            StatusCode::OK,
            [(header::CONTENT_TYPE, HeaderValue::from_static("application/json"))],
            body,
        )
            .into_response()
    };
    apply_read_headers(&read, response.headers_mut())?;
    Ok(response)
}

fn apply_read_headers(read: &ReadResponse, headers: &mut HeaderMap) -> ApiResult<()> {
    for (name, value) in read.headers() {
        let value = HeaderValue::from_bytes(value.as_bytes())
            .map_err(|e| ApiError::Internal(format!("invalid {name} header: {e}")))?;
        headers.insert(HeaderName::from_static(name), value);
    }
    Ok(())
}

async fn delete_shape(
    State(state): State<Arc<AppState>>,
    query: Result<Query<DeleteQuery>, QueryRejection>,
) -> ApiResult<StatusCode> {
    let params = query_params(query)?;
    if let Some(handle) = params.handle.as_deref().filter(|h| !h.is_empty()) {
        return remove_handle(&state, handle).await;
    }

    let Some(table) = params.table.as_deref().filter(|t| !t.trim().is_empty()) else {
        return Err(ApiError::BadRequest(
            "either handle or table is required".to_string(),
        ));
    };
    let (schema, table) = parse_table(table)?;
    let removed = state.cache().remove_by_table(&schema, &table).await;
    if removed.is_empty() {
        return Err(ApiError::NotFound(format!(
            "no shapes for table {schema}.{table}"
        )));
    }
    info!(schema = %schema, table = %table, removed = removed.len(), "Deleted shapes by table");
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_shape_by_handle(
    State(state): State<Arc<AppState>>,
    Path(handle): Path<String>,
) -> ApiResult<StatusCode> {
    remove_handle(&state, &handle).await
}

async fn remove_handle(state: &AppState, handle: &str) -> ApiResult<StatusCode> {
    let handle = Handle::parse(handle).map_err(Error::from)?;
    match state.cache().remove(&handle).await {
        Ok(()) => Ok(StatusCode::NO_CONTENT),
        Err(Error::ShapeNotFound(_)) => Err(ApiError::NotFound(format!("shape {handle} not found"))),
        Err(e) => Err(e.into()),
    }
}
