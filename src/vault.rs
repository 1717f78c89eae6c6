//! Vault: optional object storage for finished PDFs.
//!
//! Two backends implement [`VaultBackend`]:
//!
//! * [`S3LikeVault`]: `PUT {base_url}/{key}` against any S3-compatible
//!   endpoint or presigned-URL gateway, with an optional bearer token and
//!   retry with linear backoff.
//! * [`LocalFsVault`]: files under a root directory, written atomically.
//!
//! Object keys are generated by [`object_key`] and always have the shape
//! `{tenant}/{YYYY}/{MM}/{uuid}-{name}.pdf`.

use crate::error::VaultError;
use crate::output::VaultReceipt;
use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tracing::{info, instrument, warn};
use uuid::Uuid;

const MAX_FILENAME_CHARS: usize = 100;

#[async_trait]
pub trait VaultBackend: Send + Sync {
    fn backend_tag(&self) -> &'static str;

    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<VaultReceipt, VaultError>;
}

/// Build the object key for a tenant's PDF.
pub fn object_key(tenant_id: &str, filename: Option<&str>, now: DateTime<Utc>) -> String {
    format!(
        "{}/{:04}/{:02}/{}-{}.pdf",
        sanitize_segment(tenant_id),
        now.year(),
        now.month(),
        Uuid::new_v4(),
        sanitize_filename(filename.unwrap_or("document"))
    )
}

fn sanitize_segment(s: &str) -> String {
    let cleaned: String = s
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "unknown".to_string()
    } else {
        cleaned
    }
}

fn sanitize_filename(name: &str) -> String {
    let name = name.trim();
    let stem = name
        .strip_suffix(".pdf")
        .or_else(|| name.strip_suffix(".PDF"))
        .unwrap_or(name);
    let cleaned: String = stem
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '-'
            }
        })
        .take(MAX_FILENAME_CHARS)
        .collect();
    let cleaned = cleaned.trim_matches(|c| c == '.' || c == '-').to_string();
    if cleaned.is_empty() {
        "document".to_string()
    } else {
        cleaned
    }
}

/// Reject keys that could escape the vault root or address odd paths.
fn validate_key(key: &str) -> Result<(), VaultError> {
    let bad = key.is_empty()
        || key.starts_with('/')
        || key.contains('\\')
        || key.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..")
        || Path::new(key)
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
    if bad {
        return Err(VaultError::InvalidKey(key.to_string()));
    }
    Ok(())
}

// ── S3-compatible HTTP backend ───────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff_ms: 200,
        }
    }
}

#[derive(Debug)]
pub struct S3LikeVault {
    base_url: String,
    public_base_url: Option<String>,
    auth_bearer: Option<String>,
    retry: RetryPolicy,
    client: reqwest::Client,
}

impl S3LikeVault {
    pub fn new(
        base_url: impl Into<String>,
        public_base_url: Option<String>,
        auth_bearer: Option<String>,
        retry: RetryPolicy,
        timeout_secs: u64,
    ) -> Result<Self, VaultError> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        reqwest::Url::parse(&base_url).map_err(|e| VaultError::Upload {
            url: base_url.clone(),
            reason: format!("invalid base url: {e}"),
        })?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| VaultError::Upload {
                url: base_url.clone(),
                reason: format!("http client: {e}"),
            })?;
        Ok(Self {
            base_url,
            public_base_url: public_base_url
                .map(|x| x.trim_end_matches('/').to_string())
                .filter(|x| !x.is_empty()),
            auth_bearer: auth_bearer.filter(|t| !t.is_empty()),
            retry,
            client,
        })
    }

    fn object_url(&self, key: &str) -> String {
        format!("{}/{}", self.base_url, key)
    }

    fn public_url(&self, key: &str) -> String {
        let base = self.public_base_url.as_deref().unwrap_or(&self.base_url);
        format!("{base}/{key}")
    }

    fn headers(&self, content_type: &str) -> Result<HeaderMap, VaultError> {
        let mut headers = HeaderMap::new();
        let ct = HeaderValue::from_str(content_type).map_err(|e| VaultError::Upload {
            url: self.base_url.clone(),
            reason: format!("invalid content type: {e}"),
        })?;
        headers.insert(CONTENT_TYPE, ct);
        if let Some(token) = &self.auth_bearer {
            let value = HeaderValue::from_str(&format!("Bearer {token}")).map_err(|e| {
                VaultError::Upload {
                    url: self.base_url.clone(),
                    reason: format!("invalid auth header: {e}"),
                }
            })?;
            headers.insert(AUTHORIZATION, value);
        }
        Ok(headers)
    }
}

#[async_trait]
impl VaultBackend for S3LikeVault {
    fn backend_tag(&self) -> &'static str {
        "s3"
    }

    #[instrument(name = "vault_s3_put", skip(self, bytes, content_type))]
    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<VaultReceipt, VaultError> {
        validate_key(key)?;
        let url = self.object_url(key);
        let headers = self.headers(content_type)?;
        let size = bytes.len();
        let mut attempt = 0;
        loop {
            attempt += 1;
            let req = self
                .client
                .put(&url)
                .headers(headers.clone())
                .body(bytes.clone());
            let failure = match req.send().await {
                Ok(resp) if resp.status().is_success() => {
                    info!("Stored {} bytes at {}", size, url);
                    return Ok(VaultReceipt {
                        key: key.to_string(),
                        url: self.public_url(key),
                        size,
                    });
                }
                Ok(resp) => {
                    let status = resp.status();
                    // Other client errors will not change on retry.
                    if status.is_client_error() && status.as_u16() != 429 {
                        return Err(VaultError::Upload {
                            url,
                            reason: format!("status {status}"),
                        });
                    }
                    format!("status {status}")
                }
                Err(e) => e.to_string(),
            };
            if attempt >= self.retry.max_attempts {
                return Err(VaultError::Upload {
                    url,
                    reason: format!("{failure} after {attempt} attempts"),
                });
            }
            warn!("Vault upload attempt {} failed: {}", attempt, failure);
            tokio::time::sleep(Duration::from_millis(
                self.retry.base_backoff_ms.saturating_mul(attempt as u64),
            ))
            .await;
        }
    }
}

// ── Local filesystem backend ─────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct LocalFsVault {
    root: PathBuf,
    public_base_url: Option<String>,
}

impl LocalFsVault {
    pub fn new(root: impl Into<PathBuf>, public_base_url: Option<String>) -> Self {
        Self {
            root: root.into(),
            public_base_url: public_base_url
                .map(|x| x.trim_end_matches('/').to_string())
                .filter(|x| !x.is_empty()),
        }
    }

    fn url_for(&self, key: &str, path: &Path) -> String {
        match &self.public_base_url {
            Some(base) => format!("{base}/{key}"),
            None => format!("file://{}", path.display()),
        }
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[async_trait]
impl VaultBackend for LocalFsVault {
    fn backend_tag(&self) -> &'static str {
        "local"
    }

    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        _content_type: &str,
    ) -> Result<VaultReceipt, VaultError> {
        validate_key(key)?;
        let path = self.root.join(key);
        let size = bytes.len();
        let target = path.clone();
        tokio::task::spawn_blocking(move || write_atomic(&target, &bytes))
            .await
            .map_err(|e| VaultError::Io {
                path: path.display().to_string(),
                source: std::io::Error::other(e.to_string()),
            })?
            .map_err(|source| VaultError::Io {
                path: path.display().to_string(),
                source,
            })?;
        info!("Stored {} bytes at {}", size, path.display());
        Ok(VaultReceipt {
            key: key.to_string(),
            url: self.url_for(key, &path),
            size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Bytes;
    use axum::extract::{Path as AxumPath, State};
    use axum::http::{HeaderMap as AxumHeaders, StatusCode};
    use axum::routing::put;
    use axum::Router;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    #[test]
    fn object_key_shape() {
        let now = Utc.with_ymd_and_hms(2024, 2, 9, 12, 0, 0).unwrap();
        let key = object_key("tenant-1", Some("Q1 report.pdf"), now);
        assert!(key.starts_with("tenant-1/2024/02/"), "{key}");
        assert!(key.ends_with("-Q1-report.pdf"), "{key}");
        validate_key(&key).unwrap();

        let key = object_key("t", None, now);
        assert!(key.ends_with("-document.pdf"));
    }

    #[test]
    fn filename_cannot_traverse() {
        assert_eq!(sanitize_filename("../../etc/passwd"), "etc-passwd");
        assert_eq!(sanitize_filename("..."), "document");
        assert_eq!(sanitize_filename(&"a".repeat(500)).len(), MAX_FILENAME_CHARS);
    }

    #[test]
    fn rejects_bad_keys() {
        for bad in ["", "/abs/x.pdf", "a/../b.pdf", "a//b.pdf", "a\\b.pdf", "./a.pdf"] {
            assert!(validate_key(bad).is_err(), "{bad}");
        }
        assert!(validate_key("t/2024/01/x.pdf").is_ok());
    }

    #[tokio::test]
    async fn local_vault_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let vault = LocalFsVault::new(dir.path(), Some("https://cdn.example.com/".into()));
        let receipt = vault
            .put("t/2024/01/a.pdf", b"%PDF-1.7".to_vec(), "application/pdf")
            .await
            .unwrap();
        assert_eq!(receipt.size, 8);
        assert_eq!(receipt.url, "https://cdn.example.com/t/2024/01/a.pdf");
        let written = std::fs::read(dir.path().join("t/2024/01/a.pdf")).unwrap();
        assert_eq!(written, b"%PDF-1.7");
    }

    #[tokio::test]
    async fn local_vault_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let vault = LocalFsVault::new(dir.path(), None);
        let err = vault
            .put("../escape.pdf", vec![1], "application/pdf")
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::InvalidKey(_)));
    }

    #[derive(Clone, Default)]
    struct Bucket {
        failures_left: Arc<AtomicUsize>,
        puts: Arc<Mutex<Vec<(String, Option<String>, usize)>>>,
    }

    async fn put_object(
        State(bucket): State<Bucket>,
        AxumPath(key): AxumPath<String>,
        headers: AxumHeaders,
        body: Bytes,
    ) -> StatusCode {
        if bucket
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return StatusCode::SERVICE_UNAVAILABLE;
        }
        let auth = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        bucket.puts.lock().unwrap().push((key, auth, body.len()));
        StatusCode::OK
    }

    async fn spawn_bucket(bucket: Bucket) -> String {
        let app = Router::new()
            .route("/bucket/{*key}", put(put_object))
            .with_state(bucket);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/bucket")
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_backoff_ms: 1,
        }
    }

    #[tokio::test]
    async fn s3_vault_puts_with_bearer_and_retries() {
        let bucket = Bucket::default();
        bucket.failures_left.store(2, Ordering::SeqCst);
        let base = spawn_bucket(bucket.clone()).await;

        let vault = S3LikeVault::new(
            base,
            Some("https://files.example.com".into()),
            Some("s3cret".into()),
            fast_retry(),
            5,
        )
        .unwrap();
        let receipt = vault
            .put("t/2024/01/a.pdf", vec![0u8; 42], "application/pdf")
            .await
            .unwrap();

        assert_eq!(receipt.url, "https://files.example.com/t/2024/01/a.pdf");
        let puts = bucket.puts.lock().unwrap();
        assert_eq!(puts.len(), 1);
        assert_eq!(puts[0].0, "t/2024/01/a.pdf");
        assert_eq!(puts[0].1.as_deref(), Some("Bearer s3cret"));
        assert_eq!(puts[0].2, 42);
    }

    #[tokio::test]
    async fn s3_vault_gives_up_after_max_attempts() {
        let bucket = Bucket::default();
        bucket.failures_left.store(10, Ordering::SeqCst);
        let base = spawn_bucket(bucket.clone()).await;

        let vault = S3LikeVault::new(base, None, None, fast_retry(), 5).unwrap();
        let err = vault
            .put("t/a.pdf", vec![1], "application/pdf")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("after 3 attempts"), "{err}");
        assert_eq!(bucket.failures_left.load(Ordering::SeqCst), 7);
    }
}
