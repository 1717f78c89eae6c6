//! API keys: generation, PBKDF2 hashing, constant-time verification and
//! per-day request limits.
//!
//! A key handed to a client looks like `h2p_0123456789abcdef.<64 hex chars>`.
//! The part before the dot is the public `key_id` used for lookup; only a
//! salted PBKDF2-HMAC-SHA256 hash of the secret after the dot is stored.
//!
//! Daily usage lives inside the key record itself as a short array of
//! [`DailyUsage`] entries, so checking and bumping the limit is a single
//! record update.

use crate::error::AuthError;
use axum::http::{header, HeaderMap};
use chrono::{DateTime, Days, NaiveDate, Utc};
use pbkdf2::pbkdf2_hmac;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;

/// Prefix of every key id.
pub const KEY_PREFIX: &str = "h2p_";

/// Header carrying the API key. `Authorization: Bearer` is accepted too.
pub const API_KEY_HEADER: &str = "x-api-key";

/// Days of per-key usage kept on the record.
pub const USAGE_RETENTION_DAYS: u64 = 31;

const SALT_BYTES: usize = 16;
const SECRET_BYTES: usize = 32;
const HASH_BYTES: usize = 32;

/// Requests and pages for one key on one UTC day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyUsage {
    pub date: NaiveDate,
    pub requests: u32,
    pub pages: u64,
}

/// Stored form of an API key. Never contains the plaintext secret.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKeyRecord {
    pub key_id: String,
    pub tenant_id: String,
    pub name: String,
    /// Hex PBKDF2-HMAC-SHA256 of the secret.
    pub hash: String,
    /// Hex of 16 random bytes. The hex text itself is the PBKDF2 salt input.
    pub salt: String,
    pub iterations: u32,
    pub daily_limit: u32,
    #[serde(default)]
    pub usage: Vec<DailyUsage>,
    #[serde(default)]
    pub revoked: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_used_at: Option<DateTime<Utc>>,
}

impl ApiKeyRecord {
    pub fn usage_on(&self, date: NaiveDate) -> Option<&DailyUsage> {
        self.usage.iter().find(|u| u.date == date)
    }

    /// Count one request against `today`, enforcing `daily_limit`.
    ///
    /// Also drops usage entries older than [`USAGE_RETENTION_DAYS`].
    pub fn record_request(&mut self, today: NaiveDate) -> Result<(), AuthError> {
        self.prune(today);
        let limit = self.daily_limit;
        let entry = self.entry_for(today);
        if entry.requests < limit {
            entry.requests += 1;
            self.last_used_at = Some(Utc::now());
            return Ok(());
        }
        Err(AuthError::DailyLimit {
            key_id: self.key_id.clone(),
            limit,
        })
    }

    /// Add billed pages to `today`'s entry.
    pub fn record_pages(&mut self, today: NaiveDate, pages: u64) {
        let entry = self.entry_for(today);
        entry.pages += pages;
    }

    fn entry_for(&mut self, date: NaiveDate) -> &mut DailyUsage {
        let idx = match self.usage.iter().position(|u| u.date == date) {
            Some(idx) => idx,
            None => {
                self.usage.push(DailyUsage {
                    date,
                    requests: 0,
                    pages: 0,
                });
                self.usage.len() - 1
            }
        };
        &mut self.usage[idx]
    }

    fn prune(&mut self, today: NaiveDate) {
        if let Some(cutoff) = today.checked_sub_days(Days::new(USAGE_RETENTION_DAYS)) {
            self.usage.retain(|u| u.date > cutoff);
        }
    }
}

fn random_hex(len: usize) -> String {
    let mut buf = vec![0u8; len];
    OsRng.fill_bytes(&mut buf);
    hex::encode(buf)
}

/// PBKDF2-HMAC-SHA256 of `secret`, 32 bytes, hex encoded.
pub fn hash_secret(secret: &str, salt: &str, iterations: u32) -> String {
    let mut out = [0u8; HASH_BYTES];
    pbkdf2_hmac::<Sha256>(secret.as_bytes(), salt.as_bytes(), iterations, &mut out);
    hex::encode(out)
}

/// Create a new key for `tenant_id`. Returns the record and the plaintext
/// key, which is not recoverable afterwards.
pub fn generate_key(
    tenant_id: &str,
    name: &str,
    daily_limit: u32,
    iterations: u32,
) -> (ApiKeyRecord, String) {
    let key_id = format!("{KEY_PREFIX}{}", random_hex(8));
    let secret = random_hex(SECRET_BYTES);
    let salt = random_hex(SALT_BYTES);
    let record = ApiKeyRecord {
        key_id: key_id.clone(),
        tenant_id: tenant_id.to_string(),
        name: name.to_string(),
        hash: hash_secret(&secret, &salt, iterations),
        salt,
        iterations,
        daily_limit,
        usage: Vec::new(),
        revoked: false,
        created_at: Utc::now(),
        last_used_at: None,
    };
    (record, format!("{key_id}.{secret}"))
}

/// Split `"key_id.secret"` into its parts.
pub fn parse_presented_key(presented: &str) -> Result<(&str, &str), AuthError> {
    let (key_id, secret) = presented
        .trim()
        .split_once('.')
        .ok_or(AuthError::Malformed)?;
    let id_ok = key_id.len() == KEY_PREFIX.len() + 16
        && key_id.starts_with(KEY_PREFIX)
        && key_id[KEY_PREFIX.len()..]
            .bytes()
            .all(|b| b.is_ascii_hexdigit());
    if !id_ok || secret.is_empty() {
        return Err(AuthError::Malformed);
    }
    Ok((key_id, secret))
}

/// Recompute the hash for `secret` and compare in constant time.
pub fn verify_secret(record: &ApiKeyRecord, secret: &str) -> bool {
    let candidate = hash_secret(secret, &record.salt, record.iterations);
    bool::from(candidate.as_bytes().ct_eq(record.hash.as_bytes()))
}

/// Salt and hash of a key that never exists. Presented secrets for unknown
/// key ids are checked against these so the lookup miss costs a full hash.
const DECOY_SALT: &str = "00000000000000000000000000000000";
const DECOY_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Run the same PBKDF2 and comparison as [`verify_secret`] for a key id with
/// no record. Always `false`.
pub fn verify_unknown_key(secret: &str, iterations: u32) -> bool {
    let candidate = hash_secret(secret, DECOY_SALT, iterations);
    let _ = bool::from(candidate.as_bytes().ct_eq(DECOY_HASH.as_bytes()));
    false
}

/// Check a looked-up record against the presented secret.
pub fn check_key(record: &ApiKeyRecord, secret: &str) -> Result<(), AuthError> {
    if record.revoked {
        return Err(AuthError::Revoked(record.key_id.clone()));
    }
    if !verify_secret(record, secret) {
        return Err(AuthError::BadSecret(record.key_id.clone()));
    }
    Ok(())
}

fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
}

/// API key from `x-api-key`, falling back to `Authorization: Bearer`.
pub fn presented_key(headers: &HeaderMap) -> Result<&str, AuthError> {
    let from_header = headers
        .get(API_KEY_HEADER)
        .map(|v| v.to_str().map_err(|_| AuthError::Malformed))
        .transpose()?;
    from_header
        .or_else(|| bearer(headers))
        .filter(|k| !k.is_empty())
        .ok_or(AuthError::Missing)
}

/// Constant-time comparison of the admin bearer token.
pub fn verify_admin_token(expected: &str, headers: &HeaderMap) -> bool {
    match bearer(headers) {
        Some(presented) => bool::from(presented.as_bytes().ct_eq(expected.as_bytes())),
        None => false,
    }
}
