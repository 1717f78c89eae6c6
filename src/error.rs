//! Error types for the edgequake-html2pdf library.
//!
//! Two distinct failure modes exist, as in the rest of the edgequake tools:
//!
//! * [`Html2PdfError`]: **Fatal**: the request cannot produce a PDF
//!   (bad input, render crash, auth failure, no credits). Every variant
//!   carries an HTTP status and a stable machine-readable code so the server
//!   layer can answer without re-classifying errors.
//!
//! * Non-fatal stage failures (AI layout repair giving up after retries) are
//!   stored on [`crate::output::RepairOutcome`] and the pipeline continues
//!   with the unrepaired document.
//!
//! Narrower errors ([`AuthError`], [`StoreError`], [`VaultError`]) are used
//! inside their modules and folded into [`Html2PdfError`] with `From`.

use axum::http::StatusCode;
use thiserror::Error;

/// All fatal errors returned by the conversion service.
#[derive(Debug, Error)]
pub enum Html2PdfError {
    // ── Request errors ────────────────────────────────────────────────────
    /// Request shape is wrong (missing content, both html and url, …).
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// PDF options failed validation.
    #[error("Invalid options: {0}")]
    InvalidOptions(String),

    /// Assembled HTML exceeds the configured limit.
    #[error("Content is {size} bytes, limit is {limit} bytes")]
    ContentTooLarge { size: usize, limit: usize },

    /// URL could not be parsed or uses an unsupported scheme.
    #[error("Invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    /// URL points at a loopback / private / link-local host.
    #[error("Host '{host}' is not allowed")]
    BlockedHost { host: String },

    // ── Fetch errors ──────────────────────────────────────────────────────
    /// Download of a page or merge source failed.
    #[error("Failed to fetch '{url}': {reason}")]
    FetchFailed { url: String, reason: String },

    /// Download exceeded the configured timeout.
    #[error("Fetching '{url}' timed out after {secs}s")]
    FetchTimeout { url: String, secs: u64 },

    /// A merge source was downloaded but is not a PDF.
    #[error("'{url}' is not a PDF (first bytes: {magic:?})")]
    NotAPdf { url: String, magic: Vec<u8> },

    // ── Render errors ─────────────────────────────────────────────────────
    /// Chromium could not be started.
    #[error("Failed to launch headless browser: {0}")]
    BrowserLaunchFailed(String),

    /// The browser started but navigation or printing failed.
    #[error("Render failed: {0}")]
    RenderFailed(String),

    /// The whole render exceeded `render_timeout_secs`.
    #[error("Render timed out after {secs}s")]
    RenderTimeout { secs: u64 },

    /// lopdf could not load or rewrite the rendered document.
    #[error("PDF post-processing failed: {0}")]
    PostProcessFailed(String),

    // ── AI repair ─────────────────────────────────────────────────────────
    /// `aiRepair` was requested but no LLM provider is configured.
    #[error("LLM provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    // ── Accounting ────────────────────────────────────────────────────────
    /// Missing, malformed, unknown or revoked API key.
    #[error("Invalid or missing API key")]
    Unauthorized,

    /// Daily request limit for the key is exhausted.
    #[error("Daily limit of {limit} requests reached for key '{key_id}'")]
    RateLimited { key_id: String, limit: u32 },

    /// Tenant balance does not cover the rendered page count.
    #[error("Insufficient credits: {required} required, {available} available")]
    InsufficientCredits { required: u64, available: u64 },

    /// Referenced tenant / key does not exist (admin routes).
    #[error("{0} not found")]
    NotFound(String),

    // ── Storage ───────────────────────────────────────────────────────────
    /// `saveToVault` was requested but no vault backend is configured.
    #[error("Vault storage is not configured on this server")]
    VaultNotConfigured,

    /// Upload to the vault backend failed.
    #[error("Vault upload failed: {0}")]
    VaultUploadFailed(String),

    /// Persistence layer failure.
    #[error("Store error: {0}")]
    Store(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Html2PdfError {
    /// HTTP status used when this error reaches the API boundary.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_)
            | Self::InvalidOptions(_)
            | Self::InvalidUrl { .. }
            | Self::BlockedHost { .. } => StatusCode::BAD_REQUEST,
            Self::ContentTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::FetchFailed { .. } => StatusCode::BAD_GATEWAY,
            Self::FetchTimeout { .. } | Self::RenderTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::NotAPdf { .. } | Self::PostProcessFailed(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::BrowserLaunchFailed(_)
            | Self::ProviderNotConfigured { .. }
            | Self::VaultNotConfigured => StatusCode::SERVICE_UNAVAILABLE,
            Self::RenderFailed(_) | Self::Store(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::InsufficientCredits { .. } => StatusCode::PAYMENT_REQUIRED,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::VaultUploadFailed(_) => StatusCode::BAD_GATEWAY,
        }
    }

    /// Stable snake_case code, also written to usage logs.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::InvalidOptions(_) => "invalid_options",
            Self::ContentTooLarge { .. } => "content_too_large",
            Self::InvalidUrl { .. } => "invalid_url",
            Self::BlockedHost { .. } => "blocked_host",
            Self::FetchFailed { .. } => "fetch_failed",
            Self::FetchTimeout { .. } => "fetch_timeout",
            Self::NotAPdf { .. } => "not_a_pdf",
            Self::BrowserLaunchFailed(_) => "browser_launch_failed",
            Self::RenderFailed(_) => "render_failed",
            Self::RenderTimeout { .. } => "render_timeout",
            Self::PostProcessFailed(_) => "post_process_failed",
            Self::ProviderNotConfigured { .. } => "provider_not_configured",
            Self::Unauthorized => "unauthorized",
            Self::RateLimited { .. } => "rate_limited",
            Self::InsufficientCredits { .. } => "insufficient_credits",
            Self::NotFound(_) => "not_found",
            Self::VaultNotConfigured => "vault_not_configured",
            Self::VaultUploadFailed(_) => "vault_upload_failed",
            Self::Store(_) => "store_error",
            Self::Internal(_) => "internal",
        }
    }
}

/// API key problems. Every variant surfaces as [`Html2PdfError::Unauthorized`]
/// except the daily limit, so callers cannot probe which keys exist.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("no API key presented")]
    Missing,

    #[error("API key is malformed")]
    Malformed,

    #[error("unknown API key '{0}'")]
    UnknownKey(String),

    #[error("API key '{0}' has been revoked")]
    Revoked(String),

    #[error("secret does not match for key '{0}'")]
    BadSecret(String),

    #[error("daily limit of {limit} reached for key '{key_id}'")]
    DailyLimit { key_id: String, limit: u32 },
}

impl From<AuthError> for Html2PdfError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::DailyLimit { key_id, limit } => Html2PdfError::RateLimited { key_id, limit },
            _ => Html2PdfError::Unauthorized,
        }
    }
}

/// Persistence failures from [`crate::store`].
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("tenant '{0}' not found")]
    TenantNotFound(String),

    #[error("API key '{0}' not found")]
    KeyNotFound(String),

    #[error("insufficient credits: {required} required, {available} available")]
    InsufficientCredits { required: u64, available: u64 },

    #[error("failed to persist store to '{path}': {detail}")]
    Persist { path: String, detail: String },

    #[error("store snapshot is corrupt: {0}")]
    Corrupt(String),

    #[error(transparent)]
    Auth(#[from] AuthError),
}

impl From<StoreError> for Html2PdfError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::TenantNotFound(id) => Html2PdfError::NotFound(format!("tenant '{id}'")),
            StoreError::KeyNotFound(id) => Html2PdfError::NotFound(format!("API key '{id}'")),
            StoreError::InsufficientCredits {
                required,
                available,
            } => Html2PdfError::InsufficientCredits {
                required,
                available,
            },
            StoreError::Auth(e) => e.into(),
            other => Html2PdfError::Store(other.to_string()),
        }
    }
}

/// Vault backend failures from [`crate::vault`].
#[derive(Debug, Error)]
pub enum VaultError {
    #[error("invalid object key '{0}'")]
    InvalidKey(String),

    #[error("upload to '{url}' failed: {reason}")]
    Upload { url: String, reason: String },

    #[error("local write to '{path}' failed: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl From<VaultError> for Html2PdfError {
    fn from(e: VaultError) -> Self {
        Html2PdfError::VaultUploadFailed(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insufficient_credits_display() {
        let e = Html2PdfError::InsufficientCredits {
            required: 12,
            available: 3,
        };
        let msg = e.to_string();
        assert!(msg.contains("12 required"), "got: {msg}");
        assert_eq!(e.status(), StatusCode::PAYMENT_REQUIRED);
        assert_eq!(e.code(), "insufficient_credits");
    }

    #[test]
    fn auth_errors_collapse_to_unauthorized() {
        for e in [
            AuthError::Missing,
            AuthError::Malformed,
            AuthError::UnknownKey("h2p_x".into()),
            AuthError::Revoked("h2p_x".into()),
            AuthError::BadSecret("h2p_x".into()),
        ] {
            let mapped: Html2PdfError = e.into();
            assert!(matches!(mapped, Html2PdfError::Unauthorized));
            assert_eq!(mapped.to_string(), "Invalid or missing API key");
        }
    }

    #[test]
    fn daily_limit_maps_to_429() {
        let mapped: Html2PdfError = AuthError::DailyLimit {
            key_id: "h2p_abc".into(),
            limit: 5,
        }
        .into();
        assert_eq!(mapped.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(mapped.to_string().contains("h2p_abc"));
    }

    #[test]
    fn store_credit_error_keeps_amounts() {
        let mapped: Html2PdfError = StoreError::InsufficientCredits {
            required: 4,
            available: 1,
        }
        .into();
        assert!(matches!(
            mapped,
            Html2PdfError::InsufficientCredits {
                required: 4,
                available: 1
            }
        ));
    }

    #[test]
    fn render_timeout_display() {
        let e = Html2PdfError::RenderTimeout { secs: 60 };
        assert!(e.to_string().contains("60s"));
        assert_eq!(e.status(), StatusCode::GATEWAY_TIMEOUT);
    }
}
