//! Metered conversions: authentication, credits, vault upload, usage logs.
//!
//! ```text
//! authenticate ──▶ pre-flight ──▶ convert ──▶ charge ──▶ vault ──▶ usage log
//! (key + daily    (≥ 1 credit)              (pages,     (refund    (every
//!  limit)                                    atomic)     on error)   outcome)
//! ```
//!
//! Credits equal the page count of the delivered PDF, so they are charged
//! only after rendering. A tenant whose balance cannot cover the final page
//! count is charged nothing and receives no PDF. Cache hits are charged the
//! same as fresh renders.

use crate::auth::{self, ApiKeyRecord, DailyUsage};
use crate::convert::Converter;
use crate::error::{AuthError, Html2PdfError, StoreError};
use crate::output::ServiceResponse;
use crate::request::ConversionRequest;
use crate::store::{Store, Tenant, UsageLog, UsageStatus};
use crate::vault::{object_key, VaultBackend};
use chrono::{NaiveDate, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

/// Usage logs returned by [`PdfService::usage_summary`].
pub const RECENT_USAGE_LIMIT: usize = 50;

/// What `GET /v1/usage` reports for the calling key.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageSummary {
    pub tenant_id: String,
    pub credits: u64,
    pub key_id: String,
    pub daily_limit: u32,
    pub today: DailyUsage,
    pub recent: Vec<UsageLog>,
}

/// A freshly issued key. `api_key` is the only copy of the plaintext.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuedKey {
    pub key_id: String,
    pub tenant_id: String,
    pub name: String,
    pub daily_limit: u32,
    pub api_key: String,
}

pub struct PdfService {
    converter: Converter,
    store: Arc<dyn Store>,
    vault: Option<Arc<dyn VaultBackend>>,
}

impl std::fmt::Debug for PdfService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PdfService")
            .field("converter", &self.converter)
            .field(
                "vault",
                &self.vault.as_ref().map(|v| v.backend_tag()),
            )
            .finish()
    }
}

fn today() -> NaiveDate {
    Utc::now().date_naive()
}

impl PdfService {
    pub fn new(
        converter: Converter,
        store: Arc<dyn Store>,
        vault: Option<Arc<dyn VaultBackend>>,
    ) -> Self {
        Self {
            converter,
            store,
            vault,
        }
    }

    pub fn converter(&self) -> &Converter {
        &self.converter
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Verify a presented `key_id.secret` without counting a request.
    pub async fn verify(&self, presented: &str) -> Result<ApiKeyRecord, Html2PdfError> {
        let (key_id, secret) = auth::parse_presented_key(presented)?;
        let record = match self.store.key(key_id).await {
            Ok(record) => record,
            Err(StoreError::KeyNotFound(id)) => {
                auth::verify_unknown_key(secret, self.converter.config().pbkdf2_iterations);
                return Err(AuthError::UnknownKey(id).into());
            }
            Err(other) => return Err(other.into()),
        };
        if let Err(e) = auth::check_key(&record, secret) {
            warn!("Rejected API key {}: {}", key_id, e);
            return Err(e.into());
        }
        Ok(record)
    }

    /// Verify a presented key and count the request against its daily limit.
    pub async fn authenticate(&self, presented: &str) -> Result<ApiKeyRecord, Html2PdfError> {
        let record = self.verify(presented).await?;
        Ok(self.store.record_request(&record.key_id, today()).await?)
    }

    /// Run one metered conversion for an authenticated key.
    ///
    /// A usage log is written whatever the outcome.
    pub async fn convert(
        &self,
        key: &ApiKeyRecord,
        request: &ConversionRequest,
    ) -> Result<ServiceResponse, Html2PdfError> {
        let start = Instant::now();
        let mut log = UsageLog {
            id: Uuid::new_v4().to_string(),
            tenant_id: key.tenant_id.clone(),
            key_id: key.key_id.clone(),
            source: request.source_kind(),
            pages: 0,
            credits: 0,
            bytes: 0,
            duration_ms: 0,
            cached: false,
            repaired: false,
            vault_key: None,
            status: UsageStatus::Succeeded,
            error_code: None,
            created_at: Utc::now(),
        };

        let result = self.run(key, request, &mut log).await;

        log.duration_ms = start.elapsed().as_millis() as u64;
        if let Err(ref e) = result {
            log.status = UsageStatus::Failed;
            log.error_code = Some(e.code().to_string());
            warn!("Conversion for tenant {} failed: {}", key.tenant_id, e);
        }
        // Losing a log line must not turn a delivered PDF into an error.
        if let Err(e) = self.store.log_usage(log).await {
            warn!("Failed to write usage log: {}", e);
        }
        result
    }

    async fn run(
        &self,
        key: &ApiKeyRecord,
        request: &ConversionRequest,
        log: &mut UsageLog,
    ) -> Result<ServiceResponse, Html2PdfError> {
        // ── Pre-flight ───────────────────────────────────────────────────
        let vault = match (request.save_to_vault, &self.vault) {
            (true, None) => return Err(Html2PdfError::VaultNotConfigured),
            (true, Some(v)) => Some(Arc::clone(v)),
            (false, _) => None,
        };
        let tenant = self.store.tenant(&key.tenant_id).await?;
        if tenant.credits == 0 {
            return Err(Html2PdfError::InsufficientCredits {
                required: 1,
                available: 0,
            });
        }

        // ── Convert ──────────────────────────────────────────────────────
        let output = self.converter.convert(request).await?;
        let pages = output.stats.pages as u64;
        log.pages = pages;
        log.bytes = output.stats.bytes as u64;
        log.cached = output.stats.cached;
        log.repaired = output.repair.as_ref().is_some_and(|r| r.applied);

        // ── Charge ───────────────────────────────────────────────────────
        let credits_remaining = self.store.charge_credits(&key.tenant_id, pages).await?;
        log.credits = pages;
        if let Err(e) = self.store.record_pages(&key.key_id, today(), pages).await {
            warn!("Failed to record pages for {}: {}", key.key_id, e);
        }

        // ── Vault ────────────────────────────────────────────────────────
        let receipt = match vault {
            None => None,
            Some(vault) => {
                let object = object_key(&key.tenant_id, request.filename.as_deref(), Utc::now());
                match vault.put(&object, output.pdf.clone(), "application/pdf").await {
                    Ok(receipt) => {
                        log.vault_key = Some(receipt.key.clone());
                        Some(receipt)
                    }
                    Err(e) => {
                        match self.store.refund_credits(&key.tenant_id, pages).await {
                            Ok(_) => log.credits = 0,
                            Err(re) => warn!("Refund of {} credits failed: {}", pages, re),
                        }
                        return Err(e.into());
                    }
                }
            }
        };

        info!(
            "Tenant {} charged {} credits ({} left){}",
            key.tenant_id,
            pages,
            credits_remaining,
            if output.stats.cached { " [cached]" } else { "" }
        );

        Ok(ServiceResponse {
            output,
            credits_charged: pages,
            credits_remaining,
            vault: receipt,
        })
    }

    pub async fn usage_summary(&self, key: &ApiKeyRecord) -> Result<UsageSummary, Html2PdfError> {
        let tenant = self.store.tenant(&key.tenant_id).await?;
        let fresh = self.store.key(&key.key_id).await?;
        let day = today();
        let today_usage = fresh.usage_on(day).copied().unwrap_or(DailyUsage {
            date: day,
            requests: 0,
            pages: 0,
        });
        let recent = self
            .store
            .usage_logs(&key.tenant_id, RECENT_USAGE_LIMIT)
            .await?;
        Ok(UsageSummary {
            tenant_id: tenant.id,
            credits: tenant.credits,
            key_id: fresh.key_id,
            daily_limit: fresh.daily_limit,
            today: today_usage,
            recent,
        })
    }

    // ── Administration ───────────────────────────────────────────────────

    pub async fn create_tenant(&self, name: &str, credits: u64) -> Result<Tenant, Html2PdfError> {
        if name.trim().is_empty() {
            return Err(Html2PdfError::InvalidRequest("tenant name is empty".into()));
        }
        Ok(self.store.create_tenant(name.trim(), credits).await?)
    }

    pub async fn add_credits(&self, tenant_id: &str, amount: u64) -> Result<Tenant, Html2PdfError> {
        if amount == 0 {
            return Err(Html2PdfError::InvalidRequest("amount must be positive".into()));
        }
        Ok(self.store.add_credits(tenant_id, amount).await?)
    }

    pub async fn issue_key(
        &self,
        tenant_id: &str,
        name: &str,
        daily_limit: Option<u32>,
    ) -> Result<IssuedKey, Html2PdfError> {
        issue_key(
            self.store.as_ref(),
            tenant_id,
            name,
            daily_limit.unwrap_or(self.converter.config().default_daily_limit),
            self.converter.config().pbkdf2_iterations,
        )
        .await
    }

    pub async fn revoke_key(&self, key_id: &str) -> Result<ApiKeyRecord, Html2PdfError> {
        Ok(self.store.revoke_key(key_id).await?)
    }
}

/// Create and store a key for `tenant_id`.
///
/// Shared by the admin API and the CLI, which edits the store directly.
pub async fn issue_key(
    store: &dyn Store,
    tenant_id: &str,
    name: &str,
    daily_limit: u32,
    iterations: u32,
) -> Result<IssuedKey, Html2PdfError> {
    if daily_limit == 0 {
        return Err(Html2PdfError::InvalidRequest(
            "dailyLimit must be at least 1".into(),
        ));
    }
    store.tenant(tenant_id).await?;
    let (record, api_key) = auth::generate_key(tenant_id, name, daily_limit, iterations);
    let issued = IssuedKey {
        key_id: record.key_id.clone(),
        tenant_id: record.tenant_id.clone(),
        name: record.name.clone(),
        daily_limit,
        api_key,
    };
    store.insert_key(record).await?;
    info!("Issued API key {} for tenant {}", issued.key_id, tenant_id);
    Ok(issued)
}
