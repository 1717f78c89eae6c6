//! Pipeline stages for HTML/URL-to-PDF conversion.
//!
//! Each submodule implements exactly one transformation step, so every stage
//! is testable on its own and the renderer can be swapped without touching
//! the others.
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ repair ──▶ render ──▶ postprocess ──▶ inspect
//! (merge/   (LLM,      (Chromium)  (lopdf merge,   (page count
//!  fetch)    optional)              stamps)         for billing)
//! ```
//!
//! 1. [`input`]: assemble HTML/CSS/JS into one document, or validate and
//!    fetch a URL
//! 2. [`repair`]: optional LLM pass fixing print layout; never fatal once
//!    a provider exists. [`sanitize`] strips the model's wrapping.
//! 3. [`render`]: fresh headless browser per request, `Page.printToPDF`
//! 4. [`postprocess`]: merge extra PDFs, then watermark, then signature;
//!    runs in `spawn_blocking`
//! 5. [`inspect`]: parse the final bytes and count pages

pub mod input;
pub mod inspect;
pub mod postprocess;
pub mod render;
pub mod repair;
pub mod sanitize;
