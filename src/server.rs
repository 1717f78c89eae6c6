//! HTTP API.
//!
//! | Route | Auth |
//! |-------|------|
//! | `GET /health` | none |
//! | `POST /v1/pdf` | API key |
//! | `GET /v1/usage` | API key |
//! | `GET/POST /admin/tenants` | admin token |
//! | `POST /admin/tenants/{id}/credits` | admin token |
//! | `POST /admin/tenants/{id}/keys` | admin token |
//! | `DELETE /admin/keys/{key_id}` | admin token |
//!
//! Every error leaves as `{"error":{"code":…,"message":…}}` with the status
//! from [`Html2PdfError::status`]. Admin routes answer 404 when no admin token
//! is configured, so a deployment without one exposes no admin surface.

use crate::auth;
use crate::error::Html2PdfError;
use crate::request::ConversionRequest;
use crate::service::PdfService;
use axum::body::{Body, Bytes};
use axum::extract::rejection::JsonRejection;
use axum::extract::{DefaultBodyLimit, Path, Request, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal::ctrl_c;
#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, Instrument};
use uuid::Uuid;

/// PDF bodies are streamed in chunks of this size.
pub const STREAM_CHUNK_BYTES: usize = 64 * 1024;

const REQUEST_ID: &str = "x-request-id";
const X_PDF_PAGES: &str = "x-pdf-pages";
const X_CREDITS_CHARGED: &str = "x-credits-charged";
const X_CREDITS_REMAINING: &str = "x-credits-remaining";
const X_CACHE: &str = "x-cache";

/// Base64 signatures and CSS/JS ride along with the HTML; leave headroom.
const BODY_LIMIT_OVERHEAD: usize = 8 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    service: Arc<PdfService>,
    admin_token: Option<Arc<str>>,
}

impl AppState {
    pub fn new(service: Arc<PdfService>, admin_token: Option<String>) -> Self {
        Self {
            service,
            admin_token: admin_token.filter(|t| !t.is_empty()).map(Arc::from),
        }
    }
}

impl IntoResponse for Html2PdfError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = json!({
            "error": {
                "code": self.code(),
                "message": self.to_string(),
            }
        });
        (status, Json(body)).into_response()
    }
}

/// Build the application router.
pub fn router(state: AppState) -> Router {
    let body_limit = state
        .service
        .converter()
        .config()
        .max_html_bytes
        .saturating_add(BODY_LIMIT_OVERHEAD);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers([
            HeaderName::from_static(REQUEST_ID),
            HeaderName::from_static(X_PDF_PAGES),
            HeaderName::from_static(X_CREDITS_CHARGED),
            HeaderName::from_static(X_CREDITS_REMAINING),
            HeaderName::from_static(X_CACHE),
        ]);

    Router::new()
        .route("/health", get(health_handler))
        .route("/v1/pdf", post(pdf_handler))
        .route("/v1/usage", get(usage_handler))
        .route(
            "/admin/tenants",
            get(list_tenants_handler).post(create_tenant_handler),
        )
        .route("/admin/tenants/{id}/credits", post(add_credits_handler))
        .route("/admin/tenants/{id}/keys", post(issue_key_handler))
        .route("/admin/keys/{key_id}", delete(revoke_key_handler))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(middleware::from_fn(request_id_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Serve `app` until Ctrl+C or SIGTERM.
pub async fn serve(listener: TcpListener, app: Router) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("Listening on {}", addr);
    }
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("Server shut down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if ctrl_c().await.is_ok() {
            info!("Received Ctrl+C, shutting down");
        } else {
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
                info!("Received terminate signal, shutting down");
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

// ── Middleware ───────────────────────────────────────────────────────────

/// Accept a caller's request id if it is short printable ASCII, else mint one.
fn request_id(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty() && v.len() <= 128 && v.bytes().all(|b| b.is_ascii_graphic()))
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

async fn request_id_middleware(request: Request, next: Next) -> Response {
    let id = request_id(request.headers());
    let span = tracing::info_span!(
        "http.request",
        request_id = %id,
        method = %request.method(),
        route = %request.uri().path(),
    );
    let mut response = next.run(request).instrument(span).await;
    if let Ok(value) = HeaderValue::from_str(&id) {
        response.headers_mut().insert(REQUEST_ID, value);
    }
    response
}

// ── Public handlers ──────────────────────────────────────────────────────

async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

fn header_value(v: impl ToString) -> HeaderValue {
    // Only ever called with numbers and fixed ASCII words.
    HeaderValue::from_str(&v.to_string()).unwrap_or_else(|_| HeaderValue::from_static("0"))
}

fn content_disposition(filename: Option<&str>) -> HeaderValue {
    let stem: String = filename
        .unwrap_or("document")
        .trim_end_matches(".pdf")
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        .take(100)
        .collect();
    let stem = if stem.is_empty() { "document".into() } else { stem };
    HeaderValue::from_str(&format!("inline; filename=\"{stem}.pdf\""))
        .unwrap_or_else(|_| HeaderValue::from_static("inline"))
}

/// Stream `pdf` in fixed-size chunks without copying it.
fn pdf_body(pdf: Vec<u8>) -> Body {
    let bytes = Bytes::from(pdf);
    let len = bytes.len();
    let chunks: Vec<Result<Bytes, std::io::Error>> = (0..len)
        .step_by(STREAM_CHUNK_BYTES)
        .map(|start| Ok(bytes.slice(start..(start + STREAM_CHUNK_BYTES).min(len))))
        .collect();
    Body::from_stream(tokio_stream::iter(chunks))
}

async fn pdf_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<ConversionRequest>, JsonRejection>,
) -> Result<Response, Html2PdfError> {
    let presented = auth::presented_key(&headers).map_err(Html2PdfError::from)?;
    let key = state.service.authenticate(presented).await?;
    let Json(request) = body.map_err(|e| Html2PdfError::InvalidRequest(e.body_text()))?;

    let resp = state.service.convert(&key, &request).await?;
    let stats = &resp.output.stats;

    if let Some(receipt) = resp.vault {
        let body = json!({
            "key": receipt.key,
            "url": receipt.url,
            "size": receipt.size,
            "pages": stats.pages,
            "creditsCharged": resp.credits_charged,
            "creditsRemaining": resp.credits_remaining,
        });
        return Ok((StatusCode::OK, Json(body)).into_response());
    }

    let mut response = Response::new(Body::empty());
    let h = response.headers_mut();
    h.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/pdf"));
    h.insert(header::CONTENT_LENGTH, header_value(stats.bytes));
    h.insert(
        header::CONTENT_DISPOSITION,
        content_disposition(request.filename.as_deref()),
    );
    h.insert(X_PDF_PAGES, header_value(stats.pages));
    h.insert(X_CREDITS_CHARGED, header_value(resp.credits_charged));
    h.insert(X_CREDITS_REMAINING, header_value(resp.credits_remaining));
    h.insert(
        X_CACHE,
        HeaderValue::from_static(if stats.cached { "HIT" } else { "MISS" }),
    );
    *response.body_mut() = pdf_body(resp.output.pdf);
    Ok(response)
}

async fn usage_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, Html2PdfError> {
    let presented = auth::presented_key(&headers).map_err(Html2PdfError::from)?;
    let key = state.service.verify(presented).await?;
    let summary = state.service.usage_summary(&key).await?;
    Ok(Json(summary).into_response())
}

// ── Admin handlers ───────────────────────────────────────────────────────

fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<(), Html2PdfError> {
    match &state.admin_token {
        None => Err(Html2PdfError::NotFound("route".into())),
        Some(token) if auth::verify_admin_token(token, headers) => Ok(()),
        Some(_) => Err(Html2PdfError::Unauthorized),
    }
}

fn json_body<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, Html2PdfError> {
    body.map(|Json(v)| v)
        .map_err(|e| Html2PdfError::InvalidRequest(e.body_text()))
}

#[derive(Debug, Deserialize)]
struct CreateTenantBody {
    name: String,
    #[serde(default)]
    credits: u64,
}

#[derive(Debug, Deserialize)]
struct AddCreditsBody {
    amount: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IssueKeyBody {
    #[serde(default = "default_key_name")]
    name: String,
    daily_limit: Option<u32>,
}

fn default_key_name() -> String {
    "default".to_string()
}

async fn list_tenants_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, Html2PdfError> {
    require_admin(&state, &headers)?;
    let tenants = state.service.store().list_tenants().await?;
    Ok(Json(tenants).into_response())
}

async fn create_tenant_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<CreateTenantBody>, JsonRejection>,
) -> Result<Response, Html2PdfError> {
    require_admin(&state, &headers)?;
    let body = json_body(body)?;
    let tenant = state.service.create_tenant(&body.name, body.credits).await?;
    Ok((StatusCode::CREATED, Json(tenant)).into_response())
}

async fn add_credits_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    body: Result<Json<AddCreditsBody>, JsonRejection>,
) -> Result<Response, Html2PdfError> {
    require_admin(&state, &headers)?;
    let body = json_body(body)?;
    let tenant = state.service.add_credits(&id, body.amount).await?;
    Ok(Json(tenant).into_response())
}

async fn issue_key_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    body: Result<Json<IssueKeyBody>, JsonRejection>,
) -> Result<Response, Html2PdfError> {
    require_admin(&state, &headers)?;
    let body = json_body(body)?;
    let issued = state
        .service
        .issue_key(&id, &body.name, body.daily_limit)
        .await?;
    Ok((StatusCode::CREATED, Json(issued)).into_response())
}

async fn revoke_key_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(key_id): Path<String>,
) -> Result<Response, Html2PdfError> {
    require_admin(&state, &headers)?;
    let record = state.service.revoke_key(&key_id).await?;
    Ok(Json(json!({ "keyId": record.key_id, "revoked": record.revoked })).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn error_body_shape() {
        let resp = Html2PdfError::VaultNotConfigured.into_response();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let v: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(v["error"]["code"], "vault_not_configured");
        assert!(v["error"]["message"].as_str().unwrap().len() > 5);
    }

    #[test]
    fn request_id_is_sanitised() {
        let mut headers = HeaderMap::new();
        headers.insert(REQUEST_ID, HeaderValue::from_static("abc-123"));
        assert_eq!(request_id(&headers), "abc-123");

        headers.insert(REQUEST_ID, HeaderValue::from_static("has space"));
        assert_ne!(request_id(&headers), "has space");
        assert_eq!(request_id(&HeaderMap::new()).len(), 36);
    }

    #[test]
    fn disposition_filename_is_safe() {
        assert_eq!(
            content_disposition(Some("../q1 \"report\".pdf")),
            "inline; filename=\"..q1report.pdf\""
        );
        assert_eq!(content_disposition(None), "inline; filename=\"document.pdf\"");
    }

    #[tokio::test]
    async fn pdf_body_streams_whole_document() {
        let pdf: Vec<u8> = (0..(STREAM_CHUNK_BYTES * 2 + 10)).map(|i| i as u8).collect();
        let body = pdf_body(pdf.clone());
        let collected = axum::body::to_bytes(body, usize::MAX).await.unwrap();
        assert_eq!(collected.as_ref(), pdf.as_slice());
    }
}
