//! Result types produced by the conversion pipeline.

use crate::request::SourceKind;
use serde::{Deserialize, Serialize};

/// A rendered, post-processed PDF plus what it took to produce it.
#[derive(Debug, Clone)]
pub struct ConversionOutput {
    pub pdf: Vec<u8>,
    pub stats: ConversionStats,
    pub repair: Option<RepairOutcome>,
}

/// Timings and counters for one conversion.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversionStats {
    /// Page count of the final document; this is what credits are charged on.
    pub pages: usize,
    pub bytes: usize,
    /// Served from the in-memory cache without rendering.
    pub cached: bool,
    pub source: Option<SourceKind>,
    /// Number of PDFs merged after the rendered pages.
    pub merged_sources: usize,
    pub total_duration_ms: u64,
    pub repair_duration_ms: u64,
    pub render_duration_ms: u64,
    pub postprocess_duration_ms: u64,
}

/// What the AI repair stage did. Failures here are never fatal.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepairOutcome {
    /// The repaired HTML was used for rendering.
    pub applied: bool,
    pub input_tokens: usize,
    pub output_tokens: usize,
    pub retries: u32,
    /// Why the original HTML was kept, if it was.
    pub error: Option<String>,
}

/// Location of a PDF uploaded to the vault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VaultReceipt {
    pub key: String,
    pub url: String,
    pub size: usize,
}

/// Everything the service hands back for one authorised request.
#[derive(Debug, Clone)]
pub struct ServiceResponse {
    pub output: ConversionOutput,
    pub credits_charged: u64,
    pub credits_remaining: u64,
    pub vault: Option<VaultReceipt>,
}
