//! In-memory cache of finished PDFs for HTML conversions.
//!
//! Entries are keyed by a SHA-256 over the assembled HTML and every option
//! that changes the output bytes, expire after a fixed TTL, and are evicted
//! oldest-first when the cache is full. A capacity of zero disables caching.
//!
//! URL conversions are never cached: the page behind a URL can change
//! between two identical requests.

use crate::request::ConversionRequest;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

/// A cached conversion result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedPdf {
    pub pdf: Vec<u8>,
    pub pages: usize,
}

#[derive(Debug)]
struct Entry {
    value: CachedPdf,
    inserted_at: Instant,
    seq: u64,
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    next_seq: u64,
}

/// TTL + capacity bounded PDF cache, safe to share across request tasks.
#[derive(Debug)]
pub struct PdfCache {
    ttl: Duration,
    capacity: usize,
    inner: Mutex<Inner>,
}

/// Everything besides the HTML that changes the produced bytes.
#[derive(Serialize)]
struct KeyMaterial<'a> {
    options: &'a crate::config::PdfOptions,
    watermark: &'a Option<crate::request::Watermark>,
    signature: &'a Option<crate::request::Signature>,
    merge_urls: &'a [String],
    ai_repair: bool,
}

/// Stable cache key for an assembled document and the request that produced it.
pub fn cache_key(html: &str, request: &ConversionRequest) -> String {
    let material = KeyMaterial {
        options: &request.options,
        watermark: &request.watermark,
        signature: &request.signature,
        merge_urls: &request.merge_urls,
        ai_repair: request.ai_repair,
    };
    // Serialising plain data structs cannot fail.
    let options_json = serde_json::to_string(&material).unwrap_or_default();

    let mut hasher = Sha256::new();
    hasher.update(html.as_bytes());
    hasher.update(b"\n\x00\n");
    hasher.update(options_json.as_bytes());
    hex::encode(hasher.finalize())
}

impl PdfCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            ttl,
            capacity,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.capacity > 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A panic while holding the lock leaves the map consistent; keep serving.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Fetch a live entry. Expired entries are dropped on the way.
    pub fn get(&self, key: &str) -> Option<CachedPdf> {
        if !self.is_enabled() {
            return None;
        }
        let mut inner = self.lock();
        let expired = match inner.entries.get(key) {
            None => return None,
            Some(entry) => entry.inserted_at.elapsed() >= self.ttl,
        };
        if expired {
            inner.entries.remove(key);
            debug!("Cache entry {} expired", &key[..key.len().min(12)]);
            return None;
        }
        inner.entries.get(key).map(|e| e.value.clone())
    }

    pub fn insert(&self, key: String, value: CachedPdf) {
        if !self.is_enabled() {
            return;
        }
        let ttl = self.ttl;
        let mut inner = self.lock();
        inner
            .entries
            .retain(|_, entry| entry.inserted_at.elapsed() < ttl);

        if !inner.entries.contains_key(&key) && inner.entries.len() >= self.capacity {
            let oldest = inner
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.seq)
                .map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                inner.entries.remove(&oldest);
                debug!("Cache full; evicted {}", &oldest[..oldest.len().min(12)]);
            }
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.entries.insert(
            key,
            Entry {
                value,
                inserted_at: Instant::now(),
                seq,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
