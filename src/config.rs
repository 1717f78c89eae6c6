//! Configuration types for HTML-to-PDF conversion.
//!
//! Two structs control everything:
//!
//! * [`PdfOptions`]: per-request print settings (paper, margins, scale …).
//!   Deserialised from the request body with camelCase keys and defaults for
//!   every field, or built in code via [`PdfOptions::builder()`].
//! * [`ServiceConfig`]: process-wide limits and knobs (render timeout, cache
//!   size, PBKDF2 cost, LLM provider), built via [`ServiceConfig::builder()`].

use crate::error::Html2PdfError;
use edgequake_llm::LLMProvider;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

// ── Per-request print options ────────────────────────────────────────────

/// Print settings handed to the renderer.
///
/// # Example
/// ```rust
/// use edgequake_html2pdf::{PaperFormat, PdfOptions};
///
/// let options = PdfOptions::builder()
///     .format(PaperFormat::Letter)
///     .landscape(true)
///     .margin_all("12mm")
///     .build()
///     .unwrap();
/// assert!(options.landscape);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PdfOptions {
    /// Named paper size. Ignored when both `width` and `height` are set.
    pub format: PaperFormat,

    /// Custom paper width as a CSS length ("210mm", "8.5in", "800px").
    pub width: Option<String>,

    /// Custom paper height as a CSS length.
    pub height: Option<String>,

    /// Rotate the paper 90°. Default: false.
    pub landscape: bool,

    /// Print CSS backgrounds and colours. Default: true.
    pub print_background: bool,

    /// Rendering scale, 0.1–2.0 (Chromium's accepted range). Default: 1.0.
    pub scale: f64,

    /// Page margins as CSS lengths. Default: zero on every side.
    pub margin: Margins,

    /// Print the header/footer templates. Default: false.
    pub display_header_footer: bool,

    /// HTML template for the page header (Chromium template classes apply).
    pub header_template: Option<String>,

    /// HTML template for the page footer.
    pub footer_template: Option<String>,

    /// Page ranges to print, e.g. "1-5, 8". Default: all pages.
    pub page_ranges: Option<String>,

    /// Let CSS `@page size` override `format`/`width`/`height`. Default: false.
    pub prefer_css_page_size: bool,

    /// Extra wait after load before printing, in milliseconds. Default: 0.
    ///
    /// Gives client-side scripts (charts, web fonts) time to settle.
    pub delay_ms: u64,
}

impl Default for PdfOptions {
    fn default() -> Self {
        Self {
            format: PaperFormat::default(),
            width: None,
            height: None,
            landscape: false,
            print_background: true,
            scale: 1.0,
            margin: Margins::default(),
            display_header_footer: false,
            header_template: None,
            footer_template: None,
            page_ranges: None,
            prefer_css_page_size: false,
            delay_ms: 0,
        }
    }
}

impl PdfOptions {
    /// Create a new builder for `PdfOptions`.
    pub fn builder() -> PdfOptionsBuilder {
        PdfOptionsBuilder {
            options: Self::default(),
        }
    }

    /// Paper size in inches (portrait orientation; Chromium rotates for landscape).
    pub fn paper_size_inches(&self) -> Result<(f64, f64), Html2PdfError> {
        match (&self.width, &self.height) {
            (Some(w), Some(h)) => Ok((
                parse_length(w).map_err(Html2PdfError::InvalidOptions)?,
                parse_length(h).map_err(Html2PdfError::InvalidOptions)?,
            )),
            (None, None) => Ok(self.format.dimensions_inches()),
            _ => Err(Html2PdfError::InvalidOptions(
                "width and height must be given together".into(),
            )),
        }
    }

    /// Check every option against its accepted range.
    pub fn validate(&self, max_delay_ms: u64) -> Result<(), Html2PdfError> {
        if !(0.1..=2.0).contains(&self.scale) {
            return Err(Html2PdfError::InvalidOptions(format!(
                "scale must be 0.1–2.0, got {}",
                self.scale
            )));
        }
        let (w, h) = self.paper_size_inches()?;
        if w <= 0.0 || h <= 0.0 {
            return Err(Html2PdfError::InvalidOptions(
                "paper width and height must be positive".into(),
            ));
        }
        self.margin.to_inches()?;
        if self.delay_ms > max_delay_ms {
            return Err(Html2PdfError::InvalidOptions(format!(
                "delayMs must be ≤ {max_delay_ms}, got {}",
                self.delay_ms
            )));
        }
        if let Some(ref ranges) = self.page_ranges {
            if ranges.trim().is_empty()
                || !ranges
                    .chars()
                    .all(|c| c.is_ascii_digit() || c == '-' || c == ',' || c == ' ')
            {
                return Err(Html2PdfError::InvalidOptions(format!(
                    "pageRanges '{ranges}' is not a list like \"1-3, 5\""
                )));
            }
        }
        Ok(())
    }
}

/// Builder for [`PdfOptions`].
#[derive(Debug)]
pub struct PdfOptionsBuilder {
    options: PdfOptions,
}

impl PdfOptionsBuilder {
    pub fn format(mut self, format: PaperFormat) -> Self {
        self.options.format = format;
        self
    }

    pub fn size(mut self, width: impl Into<String>, height: impl Into<String>) -> Self {
        self.options.width = Some(width.into());
        self.options.height = Some(height.into());
        self
    }

    pub fn landscape(mut self, v: bool) -> Self {
        self.options.landscape = v;
        self
    }

    pub fn print_background(mut self, v: bool) -> Self {
        self.options.print_background = v;
        self
    }

    pub fn scale(mut self, scale: f64) -> Self {
        self.options.scale = scale.clamp(0.1, 2.0);
        self
    }

    pub fn margin(mut self, margin: Margins) -> Self {
        self.options.margin = margin;
        self
    }

    pub fn margin_all(mut self, length: impl Into<String>) -> Self {
        let length = length.into();
        self.options.margin = Margins {
            top: Some(length.clone()),
            right: Some(length.clone()),
            bottom: Some(length.clone()),
            left: Some(length),
        };
        self
    }

    pub fn header_footer(
        mut self,
        header: Option<String>,
        footer: Option<String>,
    ) -> Self {
        self.options.display_header_footer = header.is_some() || footer.is_some();
        self.options.header_template = header;
        self.options.footer_template = footer;
        self
    }

    pub fn page_ranges(mut self, ranges: impl Into<String>) -> Self {
        self.options.page_ranges = Some(ranges.into());
        self
    }

    pub fn prefer_css_page_size(mut self, v: bool) -> Self {
        self.options.prefer_css_page_size = v;
        self
    }

    pub fn delay_ms(mut self, ms: u64) -> Self {
        self.options.delay_ms = ms;
        self
    }

    /// Build the options, validating with the default delay cap.
    pub fn build(self) -> Result<PdfOptions, Html2PdfError> {
        self.options
            .validate(ServiceConfig::default().max_delay_ms)?;
        Ok(self.options)
    }
}

/// Named paper sizes, matching Chromium's print presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PaperFormat {
    Letter,
    Legal,
    Tabloid,
    Ledger,
    A0,
    A1,
    A2,
    A3,
    #[default]
    A4,
    A5,
    A6,
}

impl PaperFormat {
    /// Portrait `(width, height)` in inches.
    pub fn dimensions_inches(self) -> (f64, f64) {
        match self {
            PaperFormat::Letter => (8.5, 11.0),
            PaperFormat::Legal => (8.5, 14.0),
            PaperFormat::Tabloid => (11.0, 17.0),
            PaperFormat::Ledger => (17.0, 11.0),
            PaperFormat::A0 => (33.1, 46.8),
            PaperFormat::A1 => (23.4, 33.1),
            PaperFormat::A2 => (16.54, 23.4),
            PaperFormat::A3 => (11.7, 16.54),
            PaperFormat::A4 => (8.27, 11.7),
            PaperFormat::A5 => (5.83, 8.27),
            PaperFormat::A6 => (4.13, 5.83),
        }
    }

    /// Case-insensitive lookup ("a4", "LETTER").
    pub fn parse(name: &str) -> Option<Self> {
        let format = match name.trim().to_ascii_lowercase().as_str() {
            "letter" => PaperFormat::Letter,
            "legal" => PaperFormat::Legal,
            "tabloid" => PaperFormat::Tabloid,
            "ledger" => PaperFormat::Ledger,
            "a0" => PaperFormat::A0,
            "a1" => PaperFormat::A1,
            "a2" => PaperFormat::A2,
            "a3" => PaperFormat::A3,
            "a4" => PaperFormat::A4,
            "a5" => PaperFormat::A5,
            "a6" => PaperFormat::A6,
            _ => return None,
        };
        Some(format)
    }
}

/// Page margins; each side is a CSS length, `None` meaning zero.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Margins {
    pub top: Option<String>,
    pub right: Option<String>,
    pub bottom: Option<String>,
    pub left: Option<String>,
}

/// Margins converted to inches, the unit the DevTools print call expects.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MarginInches {
    pub top: f64,
    pub right: f64,
    pub bottom: f64,
    pub left: f64,
}

impl Margins {
    pub fn to_inches(&self) -> Result<MarginInches, Html2PdfError> {
        let side = |name: &str, v: &Option<String>| -> Result<f64, Html2PdfError> {
            let Some(v) = v else { return Ok(0.0) };
            let inches = parse_length(v)
                .map_err(|e| Html2PdfError::InvalidOptions(format!("margin.{name}: {e}")))?;
            if inches < 0.0 {
                return Err(Html2PdfError::InvalidOptions(format!(
                    "margin.{name} must not be negative"
                )));
            }
            Ok(inches)
        };
        Ok(MarginInches {
            top: side("top", &self.top)?,
            right: side("right", &self.right)?,
            bottom: side("bottom", &self.bottom)?,
            left: side("left", &self.left)?,
        })
    }
}

/// Parse a CSS length into inches.
///
/// Accepts `px` (96/in), `in`, `cm`, `mm`, `pt` (72/in); a bare number is px.
pub fn parse_length(input: &str) -> Result<f64, String> {
    let s = input.trim().to_ascii_lowercase();
    let (number, per_inch) = if let Some(n) = s.strip_suffix("px") {
        (n, 96.0)
    } else if let Some(n) = s.strip_suffix("in") {
        (n, 1.0)
    } else if let Some(n) = s.strip_suffix("cm") {
        (n, 2.54)
    } else if let Some(n) = s.strip_suffix("mm") {
        (n, 25.4)
    } else if let Some(n) = s.strip_suffix("pt") {
        (n, 72.0)
    } else {
        (s.as_str(), 96.0)
    };
    let value: f64 = number
        .trim()
        .parse()
        .map_err(|_| format!("'{input}' is not a CSS length"))?;
    if !value.is_finite() {
        return Err(format!("'{input}' is not a finite length"));
    }
    Ok(value / per_inch)
}

// ── Process-wide service configuration ───────────────────────────────────

/// Limits and knobs shared by every request.
///
/// Built via [`ServiceConfig::builder()`] or [`ServiceConfig::default()`].
#[derive(Clone)]
pub struct ServiceConfig {
    /// Upper bound on html + css + js bytes. Default: 5 MiB.
    pub max_html_bytes: usize,

    /// Bound on one render call, browser launch included. Default: 60.
    pub render_timeout_secs: u64,

    /// Timeout for URL and merge-source downloads. Default: 30.
    pub fetch_timeout_secs: u64,

    /// Cap on the per-request `delayMs`. Default: 10 000.
    pub max_delay_ms: u64,

    /// Lifetime of a cached PDF. Default: 3600.
    pub cache_ttl_secs: u64,

    /// Number of PDFs kept in the cache. Default: 128. Zero disables caching.
    pub cache_capacity: usize,

    /// Permit loopback / private-network URLs. Default: false.
    ///
    /// The renderer runs inside the service's network, so letting callers
    /// point it at internal hosts would expose them.
    pub allow_private_hosts: bool,

    /// PBKDF2 rounds for newly issued API keys. Default: 100 000.
    pub pbkdf2_iterations: u32,

    /// Requests per UTC day for newly issued keys. Default: 1000.
    pub default_daily_limit: u32,

    /// Maximum number of extra PDFs merged into one request. Default: 10.
    pub max_merge_sources: usize,

    /// Documents larger than this skip AI repair. Default: 200 KiB.
    pub repair_max_html_bytes: usize,

    /// Retry attempts for the repair LLM call. Default: 2.
    pub repair_max_retries: u32,

    /// Initial backoff between repair attempts, doubled each time. Default: 500.
    pub repair_backoff_ms: u64,

    /// LLM model identifier for repair. If None, uses "gpt-4.1-mini".
    pub model: Option<String>,

    /// LLM provider name ("openai", "anthropic", …).
    pub provider_name: Option<String>,

    /// Pre-constructed LLM provider. Takes precedence over `provider_name`.
    pub provider: Option<Arc<dyn LLMProvider>>,

    /// Sampling temperature for repair. Default: 0.0.
    pub temperature: f32,

    /// Maximum tokens the LLM may return. Default: 16 384.
    pub max_tokens: usize,

    /// Path to the Chromium executable. None lets chromiumoxide search.
    pub chrome_executable: Option<String>,

    /// Launch Chromium with `--no-sandbox` (needed in most containers). Default: true.
    pub chrome_no_sandbox: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            max_html_bytes: 5 * 1024 * 1024,
            render_timeout_secs: 60,
            fetch_timeout_secs: 30,
            max_delay_ms: 10_000,
            cache_ttl_secs: 3600,
            cache_capacity: 128,
            allow_private_hosts: false,
            pbkdf2_iterations: 100_000,
            default_daily_limit: 1000,
            max_merge_sources: 10,
            repair_max_html_bytes: 200 * 1024,
            repair_max_retries: 2,
            repair_backoff_ms: 500,
            model: None,
            provider_name: None,
            provider: None,
            temperature: 0.0,
            max_tokens: 16_384,
            chrome_executable: None,
            chrome_no_sandbox: true,
        }
    }
}

impl fmt::Debug for ServiceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceConfig")
            .field("max_html_bytes", &self.max_html_bytes)
            .field("render_timeout_secs", &self.render_timeout_secs)
            .field("fetch_timeout_secs", &self.fetch_timeout_secs)
            .field("cache_ttl_secs", &self.cache_ttl_secs)
            .field("cache_capacity", &self.cache_capacity)
            .field("allow_private_hosts", &self.allow_private_hosts)
            .field("pbkdf2_iterations", &self.pbkdf2_iterations)
            .field("default_daily_limit", &self.default_daily_limit)
            .field("model", &self.model)
            .field("provider_name", &self.provider_name)
            .field("provider", &self.provider.as_ref().map(|_| "<dyn LLMProvider>"))
            .field("chrome_executable", &self.chrome_executable)
            .finish()
    }
}

impl ServiceConfig {
    /// Create a new builder for `ServiceConfig`.
    pub fn builder() -> ServiceConfigBuilder {
        ServiceConfigBuilder {
            config: Self::default(),
        }
    }
}

/// Upper bound for [`ServiceConfig::repair_max_retries`] set via the builder.
pub const MAX_REPAIR_RETRIES: u32 = 10;

/// Builder for [`ServiceConfig`].
#[derive(Debug)]
pub struct ServiceConfigBuilder {
    config: ServiceConfig,
}

impl ServiceConfigBuilder {
    pub fn max_html_bytes(mut self, n: usize) -> Self {
        self.config.max_html_bytes = n;
        self
    }

    pub fn render_timeout_secs(mut self, secs: u64) -> Self {
        self.config.render_timeout_secs = secs.max(1);
        self
    }

    pub fn fetch_timeout_secs(mut self, secs: u64) -> Self {
        self.config.fetch_timeout_secs = secs.max(1);
        self
    }

    pub fn max_delay_ms(mut self, ms: u64) -> Self {
        self.config.max_delay_ms = ms;
        self
    }

    pub fn cache_ttl_secs(mut self, secs: u64) -> Self {
        self.config.cache_ttl_secs = secs;
        self
    }

    pub fn cache_capacity(mut self, n: usize) -> Self {
        self.config.cache_capacity = n;
        self
    }

    pub fn allow_private_hosts(mut self, v: bool) -> Self {
        self.config.allow_private_hosts = v;
        self
    }

    pub fn pbkdf2_iterations(mut self, n: u32) -> Self {
        self.config.pbkdf2_iterations = n;
        self
    }

    pub fn default_daily_limit(mut self, n: u32) -> Self {
        self.config.default_daily_limit = n;
        self
    }

    pub fn max_merge_sources(mut self, n: usize) -> Self {
        self.config.max_merge_sources = n;
        self
    }

    pub fn repair_max_html_bytes(mut self, n: usize) -> Self {
        self.config.repair_max_html_bytes = n;
        self
    }

    /// Clamped to [`MAX_REPAIR_RETRIES`].
    pub fn repair_max_retries(mut self, n: u32) -> Self {
        self.config.repair_max_retries = n.min(MAX_REPAIR_RETRIES);
        self
    }

    pub fn repair_backoff_ms(mut self, ms: u64) -> Self {
        self.config.repair_backoff_ms = ms;
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = Some(model.into());
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.provider_name = Some(name.into());
        self
    }

    pub fn provider(mut self, provider: Arc<dyn LLMProvider>) -> Self {
        self.config.provider = Some(provider);
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
        self
    }

    pub fn chrome_executable(mut self, path: impl Into<String>) -> Self {
        self.config.chrome_executable = Some(path.into());
        self
    }

    pub fn chrome_no_sandbox(mut self, v: bool) -> Self {
        self.config.chrome_no_sandbox = v;
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ServiceConfig, Html2PdfError> {
        let c = &self.config;
        if c.max_html_bytes == 0 {
            return Err(Html2PdfError::InvalidOptions(
                "max_html_bytes must be ≥ 1".into(),
            ));
        }
        if c.pbkdf2_iterations < 1000 {
            return Err(Html2PdfError::InvalidOptions(format!(
                "pbkdf2_iterations must be ≥ 1000, got {}",
                c.pbkdf2_iterations
            )));
        }
        if c.default_daily_limit == 0 {
            return Err(Html2PdfError::InvalidOptions(
                "default_daily_limit must be ≥ 1".into(),
            ));
        }
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_length_units() {
        assert_eq!(parse_length("1in").unwrap(), 1.0);
        assert_eq!(parse_length("96px").unwrap(), 1.0);
        assert_eq!(parse_length("96").unwrap(), 1.0);
        assert_eq!(parse_length("72pt").unwrap(), 1.0);
        assert!((parse_length("25.4mm").unwrap() - 1.0).abs() < 1e-9);
        assert!((parse_length(" 2.54CM ").unwrap() - 1.0).abs() < 1e-9);
        assert!(parse_length("wide").is_err());
        assert!(parse_length("").is_err());
    }

    #[test]
    fn defaults_print_backgrounds_on_a4() {
        let o = PdfOptions::default();
        assert_eq!(o.format, PaperFormat::A4);
        assert!(o.print_background);
        assert_eq!(o.scale, 1.0);
        assert_eq!(o.paper_size_inches().unwrap(), (8.27, 11.7));
    }

    #[test]
    fn deserialises_camel_case_with_defaults() {
        let o: PdfOptions = serde_json::from_str(
            r#"{"format":"Letter","landscape":true,"margin":{"top":"1in"},"delayMs":250}"#,
        )
        .unwrap();
        assert_eq!(o.format, PaperFormat::Letter);
        assert!(o.landscape);
        assert!(o.print_background);
        assert_eq!(o.delay_ms, 250);
        assert_eq!(o.margin.to_inches().unwrap().top, 1.0);
        assert_eq!(o.margin.to_inches().unwrap().left, 0.0);
    }

    #[test]
    fn validate_rejects_out_of_range() {
        let mut o = PdfOptions {
            scale: 3.0,
            ..Default::default()
        };
        assert!(o.validate(10_000).is_err());

        o.scale = 1.0;
        o.width = Some("100mm".into());
        assert!(o.validate(10_000).is_err(), "width without height");

        o.height = Some("200mm".into());
        assert!(o.validate(10_000).is_ok());

        o.delay_ms = 20_000;
        assert!(o.validate(10_000).is_err());

        o.delay_ms = 0;
        o.margin.left = Some("-5mm".into());
        assert!(o.validate(10_000).is_err());

        o.margin.left = None;
        o.page_ranges = Some("1-3; drop table".into());
        assert!(o.validate(10_000).is_err());
    }

    #[test]
    fn builder_clamps_scale() {
        let o = PdfOptions::builder().scale(5.0).build().unwrap();
        assert_eq!(o.scale, 2.0);
    }

    #[test]
    fn paper_format_parse() {
        assert_eq!(PaperFormat::parse("a3"), Some(PaperFormat::A3));
        assert_eq!(PaperFormat::parse("LETTER"), Some(PaperFormat::Letter));
        assert_eq!(PaperFormat::parse("b5"), None);
    }

    #[test]
    fn service_builder_rejects_weak_pbkdf2() {
        assert!(ServiceConfig::builder().pbkdf2_iterations(10).build().is_err());
        assert!(ServiceConfig::builder().pbkdf2_iterations(1000).build().is_ok());
    }

    #[test]
    fn service_builder_caps_repair_retries() {
        let c = ServiceConfig::builder().repair_max_retries(u32::MAX).build().unwrap();
        assert_eq!(c.repair_max_retries, MAX_REPAIR_RETRIES);
        let c = ServiceConfig::builder().repair_max_retries(3).build().unwrap();
        assert_eq!(c.repair_max_retries, 3);
    }
}
