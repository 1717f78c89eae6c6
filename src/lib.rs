//! # edgequake-html2pdf
//!
//! Multi-tenant HTML/URL-to-PDF conversion service.
//!
//! ## Why this crate?
//!
//! Printing HTML faithfully needs a real browser engine; everything around
//! that browser is plumbing: validating input, gluing HTML/CSS/JS together,
//! post-processing the PDF, knowing who asked and what they owe. This crate
//! is that plumbing, with headless Chromium (via chromiumoxide) doing the
//! layout and lopdf doing the PDF surgery.
//!
//! ## Pipeline Overview
//!
//! ```text
//! request
//!  │
//!  ├─ 1. Validate  exactly one source, size limits, URL host checks, options
//!  ├─ 2. Assemble  merge HTML + CSS + JS, or navigate to the URL
//!  ├─ 3. Repair    optional LLM pass fixing print layout (never fatal)
//!  ├─ 4. Render    fresh headless Chromium, Page.printToPDF
//!  ├─ 5. Polish    merge extra PDFs → watermark → signature
//!  ├─ 6. Count     page count of the final bytes = credits charged
//!  └─ 7. Deliver   stream the PDF, or upload to the vault and return a link
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_html2pdf::{ConversionRequest, Converter, ServiceConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let converter = Converter::new(ServiceConfig::default())?;
//!     let mut request = ConversionRequest::from_html("<h1>Invoice #42</h1>");
//!     request.css = Some("h1 { color: navy }".into());
//!     let output = converter.convert(&request).await?;
//!     std::fs::write("invoice.pdf", &output.pdf)?;
//!     eprintln!("{} pages in {}ms", output.stats.pages, output.stats.total_duration_ms);
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `html2pdf` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! Disable `cli` when embedding only the library:
//! ```toml
//! edgequake-html2pdf = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod auth;
pub mod cache;
pub mod config;
pub mod convert;
pub mod error;
pub mod output;
pub mod pipeline;
pub mod prompts;
pub mod request;
pub mod server;
pub mod service;
pub mod store;
pub mod vault;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{Margins, PaperFormat, PdfOptions, PdfOptionsBuilder, ServiceConfig, ServiceConfigBuilder};
pub use convert::Converter;
pub use error::{AuthError, Html2PdfError, StoreError, VaultError};
pub use output::{ConversionOutput, ConversionStats, RepairOutcome, ServiceResponse, VaultReceipt};
pub use pipeline::render::{ChromiumRenderer, Renderer};
pub use request::{ConversionRequest, Signature, SourceKind, Watermark};
pub use service::PdfService;
pub use store::{JsonStore, Store};
pub use vault::{LocalFsVault, S3LikeVault, VaultBackend};
