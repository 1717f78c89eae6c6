//! Tenants, API keys, credit balances and usage logs.
//!
//! [`Store`] is the persistence seam. [`JsonStore`] keeps everything in
//! memory behind one `RwLock` and, when opened with a path, rewrites a JSON
//! snapshot after every mutation (temp file + rename, so a crash never leaves
//! a half-written file). A running server and the CLI's `tenants` / `keys`
//! commands can share one file: mutations re-read it under a lock file and
//! reads pick up changes made by the other process.
//!
//! Credit changes happen under the write lock, which makes
//! [`Store::charge_credits`] an atomic check-and-debit.

use crate::auth::ApiKeyRecord;
use crate::error::{AuthError, StoreError};
use crate::request::SourceKind;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use fs2::FileExt;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info};
use uuid::Uuid;

/// Usage log entries kept in a snapshot; older ones are dropped first.
const MAX_USAGE_LOGS: usize = 10_000;

/// A customer account holding a credit balance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tenant {
    pub id: String,
    pub name: String,
    pub credits: u64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UsageStatus {
    Succeeded,
    Failed,
}

/// One metered request, written whether it succeeded or not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageLog {
    pub id: String,
    pub tenant_id: String,
    pub key_id: String,
    pub source: SourceKind,
    pub pages: u64,
    pub credits: u64,
    pub bytes: u64,
    pub duration_ms: u64,
    pub cached: bool,
    pub repaired: bool,
    pub vault_key: Option<String>,
    pub status: UsageStatus,
    pub error_code: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn create_tenant(&self, name: &str, credits: u64) -> Result<Tenant, StoreError>;
    async fn tenant(&self, id: &str) -> Result<Tenant, StoreError>;
    async fn list_tenants(&self) -> Result<Vec<Tenant>, StoreError>;
    async fn add_credits(&self, id: &str, amount: u64) -> Result<Tenant, StoreError>;
    /// Debit `amount` if the balance covers it; otherwise change nothing.
    /// Returns the remaining balance.
    async fn charge_credits(&self, id: &str, amount: u64) -> Result<u64, StoreError>;
    async fn refund_credits(&self, id: &str, amount: u64) -> Result<u64, StoreError>;

    /// Store a new key. The owning tenant must exist.
    async fn insert_key(&self, record: ApiKeyRecord) -> Result<(), StoreError>;
    async fn key(&self, key_id: &str) -> Result<ApiKeyRecord, StoreError>;
    async fn list_keys(&self, tenant_id: Option<&str>) -> Result<Vec<ApiKeyRecord>, StoreError>;
    async fn revoke_key(&self, key_id: &str) -> Result<ApiKeyRecord, StoreError>;
    /// Count one request for `today` against the key's daily limit.
    async fn record_request(
        &self,
        key_id: &str,
        today: NaiveDate,
    ) -> Result<ApiKeyRecord, StoreError>;
    async fn record_pages(&self, key_id: &str, today: NaiveDate, pages: u64)
        -> Result<(), StoreError>;

    async fn log_usage(&self, log: UsageLog) -> Result<(), StoreError>;
    /// Most recent first.
    async fn usage_logs(&self, tenant_id: &str, limit: usize) -> Result<Vec<UsageLog>, StoreError>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    #[serde(default)]
    tenants: BTreeMap<String, Tenant>,
    #[serde(default)]
    keys: BTreeMap<String, ApiKeyRecord>,
    #[serde(default)]
    usage: Vec<UsageLog>,
}

/// Identifies one version of the snapshot file on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    modified: Option<SystemTime>,
    len: u64,
}

#[derive(Debug, Default)]
struct Loaded {
    snapshot: Snapshot,
    /// Stamp of the file `snapshot` was read from or last written to.
    stamp: Option<FileStamp>,
}

/// In-memory store with optional JSON file persistence.
///
/// With a path, several processes may share the file: every mutation takes an
/// exclusive lock on `<path>.lock`, re-reads the file if another process
/// changed it, applies the change and writes the result back. Reads reload
/// the snapshot whenever the file's stamp has moved.
#[derive(Debug)]
pub struct JsonStore {
    path: Option<PathBuf>,
    state: RwLock<Loaded>,
}

impl JsonStore {
    /// A store that lives only as long as the process.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: RwLock::new(Loaded::default()),
        }
    }

    /// Load `path` if it exists, otherwise start empty and create it on the
    /// first write.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let (snapshot, stamp) = load(&path).await?;
        info!(
            "Store opened: {} ({} tenants, {} keys)",
            path.display(),
            snapshot.tenants.len(),
            snapshot.keys.len()
        );
        Ok(Self {
            path: Some(path),
            state: RwLock::new(Loaded { snapshot, stamp }),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Read access to a snapshot no older than the file on disk.
    async fn current(&self) -> Result<RwLockReadGuard<'_, Loaded>, StoreError> {
        let Some(path) = self.path.as_deref() else {
            return Ok(self.state.read().await);
        };
        let on_disk = file_stamp(path).await?;
        {
            let state = self.state.read().await;
            if state.stamp == on_disk {
                return Ok(state);
            }
        }
        let mut state = self.state.write().await;
        reload_if_stale(&mut state, path).await?;
        Ok(RwLockWriteGuard::downgrade(state))
    }

    /// Re-read the file, apply `change` and persist the result, all under the
    /// lock file. Nothing is written when `change` fails.
    async fn mutate<T, F>(&self, change: F) -> Result<T, StoreError>
    where
        T: Send,
        F: FnOnce(&mut Snapshot) -> Result<T, StoreError> + Send,
    {
        let mut state = self.state.write().await;
        let Some(path) = self.path.as_deref() else {
            return change(&mut state.snapshot);
        };
        let _lock = FileLock::acquire(path).await?;
        // Stamps can miss a same-length write inside one mtime tick, so
        // always start from the file while holding the lock.
        let (snapshot, stamp) = load(path).await?;
        if stamp.is_some() {
            state.snapshot = snapshot;
            state.stamp = stamp;
        }
        let value = change(&mut state.snapshot)?;
        state.stamp = persist(path, &state.snapshot).await?;
        Ok(value)
    }
}

fn persist_error(path: &Path, detail: impl ToString) -> StoreError {
    StoreError::Persist {
        path: path.display().to_string(),
        detail: detail.to_string(),
    }
}

async fn file_stamp(path: &Path) -> Result<Option<FileStamp>, StoreError> {
    match tokio::fs::metadata(path).await {
        Ok(meta) => Ok(Some(FileStamp {
            modified: meta.modified().ok(),
            len: meta.len(),
        })),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(persist_error(path, e)),
    }
}

/// Read the snapshot file. The stamp is taken first, so a concurrent write
/// can only make it look stale, never fresh.
async fn load(path: &Path) -> Result<(Snapshot, Option<FileStamp>), StoreError> {
    let stamp = file_stamp(path).await?;
    let snapshot = match tokio::fs::read(path).await {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map_err(|e| StoreError::Corrupt(format!("{}: {e}", path.display())))?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Snapshot::default(),
        Err(e) => return Err(persist_error(path, e)),
    };
    Ok((snapshot, stamp))
}

async fn reload_if_stale(state: &mut Loaded, path: &Path) -> Result<(), StoreError> {
    let on_disk = file_stamp(path).await?;
    if on_disk.is_some() && on_disk != state.stamp {
        let (snapshot, stamp) = load(path).await?;
        debug!("Store reloaded from {}", path.display());
        state.snapshot = snapshot;
        state.stamp = stamp;
    }
    Ok(())
}

/// Write the snapshot atomically and return the new file stamp.
async fn persist(path: &Path, snapshot: &Snapshot) -> Result<Option<FileStamp>, StoreError> {
    let bytes = serde_json::to_vec(snapshot).map_err(|e| StoreError::Corrupt(e.to_string()))?;
    let target = path.to_path_buf();
    tokio::task::spawn_blocking(move || write_atomic(&target, &bytes))
        .await
        .map_err(|e| persist_error(path, e))?
        .map_err(|e| persist_error(path, e))?;
    file_stamp(path).await
}

fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Exclusive advisory lock on `<store path>.lock`, released on drop.
struct FileLock(File);

impl FileLock {
    async fn acquire(store_path: &Path) -> Result<Self, StoreError> {
        let mut name = store_path.as_os_str().to_owned();
        name.push(".lock");
        let lock_path = PathBuf::from(name);
        let display = lock_path.clone();
        tokio::task::spawn_blocking(move || -> std::io::Result<FileLock> {
            if let Some(dir) = lock_path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(dir)?;
            }
            let file = OpenOptions::new()
                .create(true)
                .truncate(false)
                .read(true)
                .write(true)
                .open(&lock_path)?;
            FileExt::lock_exclusive(&file)?;
            Ok(FileLock(file))
        })
        .await
        .map_err(|e| persist_error(&display, e))?
        .map_err(|e| persist_error(&display, e))
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.0);
    }
}

fn tenant_mut<'a>(s: &'a mut Snapshot, id: &str) -> Result<&'a mut Tenant, StoreError> {
    s.tenants
        .get_mut(id)
        .ok_or_else(|| StoreError::TenantNotFound(id.to_string()))
}

fn key_mut<'a>(s: &'a mut Snapshot, key_id: &str) -> Result<&'a mut ApiKeyRecord, StoreError> {
    s.keys
        .get_mut(key_id)
        .ok_or_else(|| StoreError::KeyNotFound(key_id.to_string()))
}

#[async_trait]
impl Store for JsonStore {
    async fn create_tenant(&self, name: &str, credits: u64) -> Result<Tenant, StoreError> {
        let tenant = Tenant {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            credits,
            created_at: Utc::now(),
        };
        let created = tenant.clone();
        self.mutate(move |s| {
            s.tenants.insert(created.id.clone(), created);
            Ok(())
        })
        .await?;
        info!("Created tenant {} ({}) with {} credits", tenant.id, name, credits);
        Ok(tenant)
    }

    async fn tenant(&self, id: &str) -> Result<Tenant, StoreError> {
        let state = self.current().await?;
        let tenant = state.snapshot.tenants.get(id).cloned();
        tenant.ok_or_else(|| StoreError::TenantNotFound(id.to_string()))
    }

    async fn list_tenants(&self) -> Result<Vec<Tenant>, StoreError> {
        let state = self.current().await?;
        let mut tenants: Vec<Tenant> = state.snapshot.tenants.values().cloned().collect();
        tenants.sort_by_key(|t| t.created_at);
        Ok(tenants)
    }

    async fn add_credits(&self, id: &str, amount: u64) -> Result<Tenant, StoreError> {
        self.mutate(|s| {
            let tenant = tenant_mut(s, id)?;
            tenant.credits = tenant.credits.saturating_add(amount);
            Ok(tenant.clone())
        })
        .await
    }

    async fn charge_credits(&self, id: &str, amount: u64) -> Result<u64, StoreError> {
        let remaining = self
            .mutate(|s| {
                let tenant = tenant_mut(s, id)?;
                if tenant.credits < amount {
                    return Err(StoreError::InsufficientCredits {
                        required: amount,
                        available: tenant.credits,
                    });
                }
                tenant.credits -= amount;
                Ok(tenant.credits)
            })
            .await?;
        debug!("Charged {} credits to {}, {} left", amount, id, remaining);
        Ok(remaining)
    }

    async fn refund_credits(&self, id: &str, amount: u64) -> Result<u64, StoreError> {
        let remaining = self
            .mutate(|s| {
                let tenant = tenant_mut(s, id)?;
                tenant.credits = tenant.credits.saturating_add(amount);
                Ok(tenant.credits)
            })
            .await?;
        debug!("Refunded {} credits to {}", amount, id);
        Ok(remaining)
    }

    async fn insert_key(&self, record: ApiKeyRecord) -> Result<(), StoreError> {
        self.mutate(move |s| {
            if !s.tenants.contains_key(&record.tenant_id) {
                return Err(StoreError::TenantNotFound(record.tenant_id));
            }
            s.keys.insert(record.key_id.clone(), record);
            Ok(())
        })
        .await
    }

    async fn key(&self, key_id: &str) -> Result<ApiKeyRecord, StoreError> {
        let state = self.current().await?;
        let key = state.snapshot.keys.get(key_id).cloned();
        key.ok_or_else(|| StoreError::KeyNotFound(key_id.to_string()))
    }

    async fn list_keys(&self, tenant_id: Option<&str>) -> Result<Vec<ApiKeyRecord>, StoreError> {
        let state = self.current().await?;
        let mut keys: Vec<ApiKeyRecord> = state
            .snapshot
            .keys
            .values()
            .filter(|k| tenant_id.map_or(true, |t| k.tenant_id == t))
            .cloned()
            .collect();
        keys.sort_by_key(|k| k.created_at);
        Ok(keys)
    }

    async fn revoke_key(&self, key_id: &str) -> Result<ApiKeyRecord, StoreError> {
        let key = self
            .mutate(|s| {
                let key = key_mut(s, key_id)?;
                key.revoked = true;
                Ok(key.clone())
            })
            .await?;
        info!("Revoked API key {}", key_id);
        Ok(key)
    }

    async fn record_request(
        &self,
        key_id: &str,
        today: NaiveDate,
    ) -> Result<ApiKeyRecord, StoreError> {
        self.mutate(|s| {
            let key = s
                .keys
                .get_mut(key_id)
                .ok_or_else(|| AuthError::UnknownKey(key_id.to_string()))?;
            key.record_request(today)?;
            Ok(key.clone())
        })
        .await
    }

    async fn record_pages(
        &self,
        key_id: &str,
        today: NaiveDate,
        pages: u64,
    ) -> Result<(), StoreError> {
        self.mutate(|s| {
            key_mut(s, key_id)?.record_pages(today, pages);
            Ok(())
        })
        .await
    }

    async fn log_usage(&self, log: UsageLog) -> Result<(), StoreError> {
        self.mutate(move |s| {
            s.usage.push(log);
            if s.usage.len() > MAX_USAGE_LOGS {
                let excess = s.usage.len() - MAX_USAGE_LOGS;
                s.usage.drain(..excess);
            }
            Ok(())
        })
        .await
    }

    async fn usage_logs(&self, tenant_id: &str, limit: usize) -> Result<Vec<UsageLog>, StoreError> {
        let state = self.current().await?;
        let logs = state
            .snapshot
            .usage
            .iter()
            .rev()
            .filter(|l| l.tenant_id == tenant_id)
            .take(limit)
            .cloned()
            .collect();
        Ok(logs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::generate_key;

    fn log(tenant_id: &str, pages: u64) -> UsageLog {
        UsageLog {
            id: Uuid::new_v4().to_string(),
            tenant_id: tenant_id.to_string(),
            key_id: "h2p_0000000000000000".into(),
            source: SourceKind::Html,
            pages,
            credits: pages,
            bytes: 100,
            duration_ms: 5,
            cached: false,
            repaired: false,
            vault_key: None,
            status: UsageStatus::Succeeded,
            error_code: None,
            created_at: Utc::now(),
        }
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, 1).unwrap()
    }

    #[tokio::test]
    async fn charge_is_all_or_nothing() {
        let store = JsonStore::in_memory();
        let t = store.create_tenant("acme", 5).await.unwrap();
        assert_eq!(store.charge_credits(&t.id, 3).await.unwrap(), 2);
        let err = store.charge_credits(&t.id, 3).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::InsufficientCredits {
                required: 3,
                available: 2
            }
        ));
        assert_eq!(store.tenant(&t.id).await.unwrap().credits, 2);
        assert_eq!(store.refund_credits(&t.id, 3).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn add_credits_to_unknown_tenant() {
        let store = JsonStore::in_memory();
        assert!(matches!(
            store.add_credits("nope", 1).await,
            Err(StoreError::TenantNotFound(_))
        ));
    }

    #[tokio::test]
    async fn key_requires_tenant() {
        let store = JsonStore::in_memory();
        let (record, _) = generate_key("ghost", "ci", 10, 1_000);
        assert!(matches!(
            store.insert_key(record).await,
            Err(StoreError::TenantNotFound(_))
        ));
    }

    #[tokio::test]
    async fn record_request_counts_and_limits() {
        let store = JsonStore::in_memory();
        let t = store.create_tenant("acme", 5).await.unwrap();
        let (record, _) = generate_key(&t.id, "ci", 1, 1_000);
        let key_id = record.key_id.clone();
        store.insert_key(record).await.unwrap();

        let updated = store.record_request(&key_id, today()).await.unwrap();
        assert_eq!(updated.usage_on(today()).unwrap().requests, 1);
        assert!(matches!(
            store.record_request(&key_id, today()).await,
            Err(StoreError::Auth(AuthError::DailyLimit { limit: 1, .. }))
        ));
        assert!(matches!(
            store.record_request("h2p_ffffffffffffffff", today()).await,
            Err(StoreError::Auth(AuthError::UnknownKey(_)))
        ));

        store.record_pages(&key_id, today(), 4).await.unwrap();
        let key = store.key(&key_id).await.unwrap();
        assert_eq!(key.usage_on(today()).unwrap().pages, 4);
    }

    #[tokio::test]
    async fn revoke_and_list_keys() {
        let store = JsonStore::in_memory();
        let a = store.create_tenant("a", 0).await.unwrap();
        let b = store.create_tenant("b", 0).await.unwrap();
        let (ka, _) = generate_key(&a.id, "a", 10, 1_000);
        let (kb, _) = generate_key(&b.id, "b", 10, 1_000);
        let ka_id = ka.key_id.clone();
        store.insert_key(ka).await.unwrap();
        store.insert_key(kb).await.unwrap();

        assert_eq!(store.list_keys(None).await.unwrap().len(), 2);
        assert_eq!(store.list_keys(Some(&a.id)).await.unwrap().len(), 1);
        assert!(store.revoke_key(&ka_id).await.unwrap().revoked);
        assert!(store.key(&ka_id).await.unwrap().revoked);
    }

    #[tokio::test]
    async fn usage_logs_newest_first_per_tenant() {
        let store = JsonStore::in_memory();
        store.log_usage(log("a", 1)).await.unwrap();
        store.log_usage(log("b", 9)).await.unwrap();
        store.log_usage(log("a", 2)).await.unwrap();
        let logs = store.usage_logs("a", 10).await.unwrap();
        assert_eq!(logs.iter().map(|l| l.pages).collect::<Vec<_>>(), vec![2, 1]);
        assert_eq!(store.usage_logs("a", 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn snapshot_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("store.json");

        let store = JsonStore::open(&path).await.unwrap();
        let t = store.create_tenant("acme", 7).await.unwrap();
        let (record, _) = generate_key(&t.id, "ci", 10, 1_000);
        let key_id = record.key_id.clone();
        store.insert_key(record).await.unwrap();
        store.charge_credits(&t.id, 2).await.unwrap();
        drop(store);

        let reopened = JsonStore::open(&path).await.unwrap();
        assert_eq!(reopened.tenant(&t.id).await.unwrap().credits, 5);
        assert_eq!(reopened.key(&key_id).await.unwrap().tenant_id, t.id);
    }

    #[tokio::test]
    async fn shared_file_keeps_writes_from_both_handles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        // One handle plays the server, the other the CLI editing the same file.
        let server = JsonStore::open(&path).await.unwrap();
        let cli = JsonStore::open(&path).await.unwrap();

        let acme = server.create_tenant("acme", 7).await.unwrap();
        let globex = cli.create_tenant("globex", 3).await.unwrap();
        server.charge_credits(&acme.id, 2).await.unwrap();

        assert_eq!(server.tenant(&globex.id).await.unwrap().credits, 3);
        // Reads alone pick up the CLI's later key.
        let (record, _) = generate_key(&globex.id, "ci", 10, 1_000);
        let key_id = record.key_id.clone();
        cli.insert_key(record).await.unwrap();
        assert_eq!(server.key(&key_id).await.unwrap().tenant_id, globex.id);
        assert_eq!(cli.tenant(&acme.id).await.unwrap().credits, 5);

        let reopened = JsonStore::open(&path).await.unwrap();
        assert_eq!(reopened.list_tenants().await.unwrap().len(), 2);
        assert_eq!(reopened.tenant(&acme.id).await.unwrap().credits, 5);
        assert!(reopened.key(&key_id).await.is_ok());
        assert!(dir.path().join("store.json.lock").exists());
    }

    #[tokio::test]
    async fn snapshot_is_written_compact() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        let store = JsonStore::open(&path).await.unwrap();
        store.create_tenant("acme", 1).await.unwrap();
        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(!raw.contains('\n'));
        assert!(raw.starts_with("{\"tenants\":{"));
    }

    #[tokio::test]
    async fn corrupt_snapshot_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        std::fs::write(&path, b"{ not json").unwrap();
        assert!(matches!(
            JsonStore::open(&path).await,
            Err(StoreError::Corrupt(_))
        ));
    }
}
