//! REST API for PointLedger
//!
//! Read endpoints are public. Endpoints that mutate the ledger, and the
//! privileged side of `/api/integrity`, require the `x-admin-token` header to
//! match the configured admin token.

use axum::{
    extract::{Path, Query, Request, State},
    http::{self, HeaderMap, HeaderName, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::{AllowOrigin, CorsLayer};

use crate::error::LedgerError;
use crate::ledger::{ActionType, Ledger, Metadata};
use crate::reconcile::{TransactionSource, Unprivileged};

pub const ADMIN_TOKEN_HEADER: &str = "x-admin-token";

const MAX_PAGE_LIMIT: usize = 100;

/// Shared state behind every handler.
pub struct ApiNode {
    pub ledger: Arc<Ledger>,
    /// Used by `/api/integrity` for admin callers only.
    pub transactions: Arc<dyn TransactionSource>,
    admin_token: Option<String>,
    started_at: Instant,
}

impl ApiNode {
    pub fn new(
        ledger: Arc<Ledger>,
        transactions: Arc<dyn TransactionSource>,
        admin_token: Option<String>,
    ) -> Self {
        ApiNode {
            ledger,
            transactions,
            admin_token: admin_token.filter(|t| !t.is_empty()),
            started_at: Instant::now(),
        }
    }

    fn is_admin(&self, headers: &HeaderMap) -> bool {
        match (&self.admin_token, headers.get(ADMIN_TOKEN_HEADER)) {
            (Some(expected), Some(given)) => given.as_bytes() == expected.as_bytes(),
            _ => false,
        }
    }

    fn require_admin(&self, headers: &HeaderMap) -> Result<(), ApiError> {
        if self.is_admin(headers) {
            Ok(())
        } else {
            Err(ApiError::Unauthorized)
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug)]
pub enum ApiError {
    Ledger(LedgerError),
    InvalidInput(String),
    NotFound(String),
    Unauthorized,
    InternalError(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Ledger(e) => {
                let status = match &e {
                    LedgerError::Contention { .. } => StatusCode::CONFLICT,
                    LedgerError::ChainInvalid { .. } => StatusCode::UNPROCESSABLE_ENTITY,
                    LedgerError::ChainEmpty => StatusCode::CONFLICT,
                    LedgerError::ReconciliationMismatch { .. } => StatusCode::CONFLICT,
                    LedgerError::InsufficientPrivilege(_) => StatusCode::FORBIDDEN,
                    LedgerError::BlockNotFound(_) => StatusCode::NOT_FOUND,
                    LedgerError::InvalidInput(_) => StatusCode::BAD_REQUEST,
                    LedgerError::ExternalStore(_) => StatusCode::BAD_GATEWAY,
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, e.to_string())
            }
            ApiError::InvalidInput(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "Admin token required".to_string(),
            ),
            ApiError::InternalError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

impl From<LedgerError> for ApiError {
    fn from(err: LedgerError) -> Self {
        ApiError::Ledger(err)
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppendRequest {
    pub user_id: String,
    pub action_type: ActionType,
    pub points: i64,
    #[serde(default)]
    pub metadata: Metadata,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnchorVerifyRequest {
    pub hash: String,
    pub block_count: u64,
}

#[derive(Deserialize)]
pub struct RepairRequest {
    #[serde(default)]
    pub confirm: bool,
}

#[derive(Deserialize)]
struct PaginationQuery {
    #[serde(default)]
    start: u64,
    #[serde(default = "default_limit")]
    limit: usize,
}

#[derive(Deserialize)]
struct LimitQuery {
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    10
}

// ============================================================================
// Utility Functions
// ============================================================================

/// Ledger operations block on the store; run them off the async workers.
async fn with_ledger<T, F>(node: &ApiNode, op: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&Ledger) -> Result<T, LedgerError> + Send + 'static,
{
    let ledger = node.ledger.clone();
    tokio::task::spawn_blocking(move || op(&ledger))
        .await
        .map_err(|e| ApiError::InternalError(format!("ledger task failed: {}", e)))?
        .map_err(ApiError::from)
}

// ============================================================================
// Middleware
// ============================================================================

async fn logging_middleware(req: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let response = next.run(req).await;

    tracing::info!(
        method = %method,
        path = %path,
        status = %response.status().as_u16(),
        duration_ms = %start.elapsed().as_millis(),
        "api.request"
    );

    response
}

// ============================================================================
// API Server
// ============================================================================

/// Build the API router with all endpoints.
pub fn build_api_router(node: Arc<ApiNode>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::mirror_request())
        .allow_methods(vec![
            http::Method::GET,
            http::Method::POST,
            http::Method::OPTIONS,
        ])
        .allow_headers(vec![
            http::header::CONTENT_TYPE,
            HeaderName::from_static(ADMIN_TOKEN_HEADER),
        ])
        .allow_credentials(true);

    let api_routes = Router::new()
        // Ledger endpoints
        .route("/ledger/tip", get(get_tip))
        .route("/ledger/blocks", get(get_blocks))
        .route("/ledger/block/:index", get(get_block))
        .route("/ledger/append", post(append_block))
        .route("/ledger/genesis", post(create_genesis))
        .route("/ledger/verify", get(verify_chain))
        .route("/ledger/repair", post(repair_chain))
        // Integrity
        .route("/integrity", get(run_integrity_checks))
        .route("/audit/proof", get(get_audit_proof))
        // Anchors
        .route("/anchors", get(list_anchors).post(publish_anchor))
        .route("/anchors/latest", get(get_latest_anchor))
        .route("/anchors/verify", post(verify_anchor))
        // System
        .route("/health", get(health_check))
        .layer(middleware::from_fn(logging_middleware))
        .with_state(node);

    Router::new().nest("/api", api_routes).layer(cors)
}

pub async fn run_api_server(
    node: Arc<ApiNode>,
    port: u16,
) -> Result<(), Box<dyn std::error::Error>> {
    let app = build_api_router(node);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;

    tracing::info!(%addr, "api server listening");
    axum::serve(listener, app).await?;

    Ok(())
}

// ============================================================================
// Route Handlers
// ============================================================================

async fn health_check(State(node): State<Arc<ApiNode>>) -> Result<impl IntoResponse, ApiError> {
    let block_count = with_ledger(&node, |ledger| ledger.block_count()).await?;
    Ok(Json(serde_json::json!({
        "status": "healthy",
        "blockCount": block_count,
        "uptimeSeconds": node.started_at.elapsed().as_secs(),
        "timestamp": chrono::Utc::now().to_rfc3339()
    })))
}

async fn get_tip(State(node): State<Arc<ApiNode>>) -> Result<impl IntoResponse, ApiError> {
    let tip = with_ledger(&node, |ledger| ledger.tip()).await?;
    Ok(Json(tip))
}

async fn get_blocks(
    State(node): State<Arc<ApiNode>>,
    Query(query): Query<PaginationQuery>,
) -> Result<impl IntoResponse, ApiError> {
    if query.limit == 0 || query.limit > MAX_PAGE_LIMIT {
        return Err(ApiError::InvalidInput(format!(
            "limit must be between 1 and {}",
            MAX_PAGE_LIMIT
        )));
    }
    let (start, limit) = (query.start, query.limit);
    let (blocks, total) = with_ledger(&node, move |ledger| {
        Ok((ledger.blocks(start, limit)?, ledger.block_count()?))
    })
    .await?;

    Ok(Json(serde_json::json!({
        "blocks": blocks,
        "start": start,
        "limit": limit,
        "total": total
    })))
}

async fn get_block(
    State(node): State<Arc<ApiNode>>,
    Path(index): Path<u64>,
) -> Result<impl IntoResponse, ApiError> {
    let block = with_ledger(&node, move |ledger| ledger.block(index)).await?;
    Ok(Json(block))
}

async fn append_block(
    State(node): State<Arc<ApiNode>>,
    headers: HeaderMap,
    Json(req): Json<AppendRequest>,
) -> Result<impl IntoResponse, ApiError> {
    node.require_admin(&headers)?;
    let block = with_ledger(&node, move |ledger| {
        ledger.append(&req.user_id, req.action_type, req.points, req.metadata)
    })
    .await?;
    Ok((StatusCode::CREATED, Json(block)))
}

async fn create_genesis(
    State(node): State<Arc<ApiNode>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    node.require_admin(&headers)?;
    let genesis = with_ledger(&node, |ledger| ledger.create_genesis()).await?;
    Ok(Json(genesis))
}

async fn verify_chain(State(node): State<Arc<ApiNode>>) -> Result<impl IntoResponse, ApiError> {
    let report = with_ledger(&node, |ledger| ledger.verify_chain()).await?;
    Ok(Json(report))
}

async fn repair_chain(
    State(node): State<Arc<ApiNode>>,
    headers: HeaderMap,
    body: Option<Json<RepairRequest>>,
) -> Result<impl IntoResponse, ApiError> {
    node.require_admin(&headers)?;
    let confirm = body.map(|Json(req)| req.confirm).unwrap_or(false);
    if !confirm {
        return Err(ApiError::InvalidInput(
            "Repair rewrites stored blocks; resend with {\"confirm\": true}".to_string(),
        ));
    }
    let report = with_ledger(&node, |ledger| ledger.repair_chain()).await?;
    Ok(Json(report))
}

async fn run_integrity_checks(
    State(node): State<Arc<ApiNode>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let source: Arc<dyn TransactionSource> = if node.is_admin(&headers) {
        node.transactions.clone()
    } else {
        Arc::new(Unprivileged)
    };
    let report = with_ledger(&node, move |ledger| {
        ledger.run_all_integrity_checks(source.as_ref())
    })
    .await?;
    Ok(Json(report))
}

async fn get_audit_proof(State(node): State<Arc<ApiNode>>) -> Result<impl IntoResponse, ApiError> {
    let proof = with_ledger(&node, |ledger| ledger.generate_audit_proof()).await?;
    Ok(Json(proof))
}

async fn publish_anchor(
    State(node): State<Arc<ApiNode>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    node.require_admin(&headers)?;
    let anchor = with_ledger(&node, |ledger| ledger.publish_anchor()).await?;
    Ok((StatusCode::CREATED, Json(anchor)))
}

async fn list_anchors(
    State(node): State<Arc<ApiNode>>,
    Query(query): Query<LimitQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let limit = query.limit.clamp(1, MAX_PAGE_LIMIT);
    let anchors = with_ledger(&node, move |ledger| ledger.list_anchors(limit)).await?;
    Ok(Json(anchors))
}

async fn get_latest_anchor(
    State(node): State<Arc<ApiNode>>,
) -> Result<impl IntoResponse, ApiError> {
    match with_ledger(&node, |ledger| ledger.latest_anchor()).await? {
        Some(anchor) => Ok(Json(anchor)),
        None => Err(ApiError::NotFound("No anchor has been published".to_string())),
    }
}

async fn verify_anchor(
    State(node): State<Arc<ApiNode>>,
    Json(req): Json<AnchorVerifyRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.hash.trim().is_empty() {
        return Err(ApiError::InvalidInput("hash must not be empty".to_string()));
    }
    let check = with_ledger(&node, move |ledger| {
        ledger.verify_against_anchor(&req.hash, req.block_count)
    })
    .await?;
    Ok(Json(check))
}
