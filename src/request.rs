//! Conversion request body and its validation.
//!
//! The JSON shape accepted by `POST /v1/pdf` (camelCase):
//!
//! ```json
//! {
//!   "html": "<h1>Invoice</h1>", "css": "h1 { color: navy }", "js": null,
//!   "url": null,
//!   "options": { "format": "A4", "margin": { "top": "12mm" } },
//!   "aiRepair": false,
//!   "watermark": { "text": "DRAFT" },
//!   "signature": { "image": "data:image/png;base64,…", "x": 400, "y": 60, "width": 140 },
//!   "mergeUrls": ["https://example.com/terms.pdf"],
//!   "saveToVault": true,
//!   "filename": "invoice-42"
//! }
//! ```

use crate::config::{PdfOptions, ServiceConfig};
use crate::error::Html2PdfError;
use crate::pipeline::input;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};

/// One conversion request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ConversionRequest {
    /// HTML document or fragment. Mutually exclusive with `url`.
    pub html: Option<String>,
    /// Stylesheet merged into the document head.
    pub css: Option<String>,
    /// Script merged at the end of the body.
    pub js: Option<String>,
    /// Page to navigate to. Mutually exclusive with `html`.
    pub url: Option<String>,
    pub options: PdfOptions,
    /// Ask an LLM to fix print-layout problems before rendering.
    pub ai_repair: bool,
    pub watermark: Option<Watermark>,
    pub signature: Option<Signature>,
    /// PDFs appended after the rendered pages, in order.
    pub merge_urls: Vec<String>,
    /// Upload the result to the vault and return its location.
    pub save_to_vault: bool,
    /// Human-readable stem for the vault object name.
    pub filename: Option<String>,
}

/// Which kind of content a request carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Html,
    Url,
}

impl ConversionRequest {
    /// Convenience constructor for an HTML request with default options.
    pub fn from_html(html: impl Into<String>) -> Self {
        Self {
            html: Some(html.into()),
            ..Default::default()
        }
    }

    /// Convenience constructor for a URL request with default options.
    pub fn from_url(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Default::default()
        }
    }

    pub fn source_kind(&self) -> SourceKind {
        if self.url.is_some() {
            SourceKind::Url
        } else {
            SourceKind::Html
        }
    }

    /// Check the request against the service limits before any work starts.
    pub fn validate(&self, config: &ServiceConfig) -> Result<(), Html2PdfError> {
        match (&self.html, &self.url) {
            (Some(_), Some(_)) => {
                return Err(Html2PdfError::InvalidRequest(
                    "provide either 'html' or 'url', not both".into(),
                ))
            }
            (None, None) => {
                return Err(Html2PdfError::InvalidRequest(
                    "one of 'html' or 'url' is required".into(),
                ))
            }
            (Some(html), None) => {
                if html.trim().is_empty() {
                    return Err(Html2PdfError::InvalidRequest("'html' is empty".into()));
                }
                let size = html.len()
                    + self.css.as_ref().map_or(0, String::len)
                    + self.js.as_ref().map_or(0, String::len);
                if size > config.max_html_bytes {
                    return Err(Html2PdfError::ContentTooLarge {
                        size,
                        limit: config.max_html_bytes,
                    });
                }
            }
            (None, Some(url)) => {
                if self.css.is_some() || self.js.is_some() {
                    return Err(Html2PdfError::InvalidRequest(
                        "'css' and 'js' apply only to 'html' content".into(),
                    ));
                }
                input::validate_url(url, config.allow_private_hosts)?;
            }
        }

        self.options.validate(config.max_delay_ms)?;

        if let Some(ref w) = self.watermark {
            w.validate()?;
        }
        if let Some(ref s) = self.signature {
            s.validate()?;
        }

        if self.merge_urls.len() > config.max_merge_sources {
            return Err(Html2PdfError::InvalidRequest(format!(
                "at most {} mergeUrls allowed, got {}",
                config.max_merge_sources,
                self.merge_urls.len()
            )));
        }
        for url in &self.merge_urls {
            input::validate_url(url, config.allow_private_hosts)?;
        }
        Ok(())
    }
}

/// Diagonal text stamped over the pages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Watermark {
    pub text: String,
    /// Fill opacity 0.0–1.0. Default: 0.15.
    pub opacity: f32,
    /// Font size in points. Default: 64.
    pub font_size: f32,
    /// Counter-clockwise rotation in degrees. Default: 45.
    pub rotation: f32,
    /// Grey level 0.0 (black) – 1.0 (white). Default: 0.5.
    pub gray: f32,
    /// Stamp only the first page. Default: false.
    pub first_page_only: bool,
}

impl Default for Watermark {
    fn default() -> Self {
        Self {
            text: String::new(),
            opacity: 0.15,
            font_size: 64.0,
            rotation: 45.0,
            gray: 0.5,
            first_page_only: false,
        }
    }
}

impl Watermark {
    pub fn validate(&self) -> Result<(), Html2PdfError> {
        let len = self.text.chars().count();
        if len == 0 || len > 200 {
            return Err(Html2PdfError::InvalidRequest(
                "watermark.text must be 1–200 characters".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.opacity) {
            return Err(Html2PdfError::InvalidRequest(
                "watermark.opacity must be 0.0–1.0".into(),
            ));
        }
        if !(6.0..=300.0).contains(&self.font_size) {
            return Err(Html2PdfError::InvalidRequest(
                "watermark.fontSize must be 6–300".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.gray) {
            return Err(Html2PdfError::InvalidRequest(
                "watermark.gray must be 0.0–1.0".into(),
            ));
        }
        Ok(())
    }
}

/// Image stamped onto one page (a scanned signature, a seal, a logo).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Signature {
    /// Base64 PNG or JPEG, optionally as a `data:` URL.
    pub image: String,
    /// 1-indexed target page. None = last page.
    pub page: Option<usize>,
    /// Left edge in points from the page's left side. Default: 72.
    pub x: f32,
    /// Bottom edge in points from the page's bottom. Default: 72.
    pub y: f32,
    /// Drawn width in points; height follows the aspect ratio. Default: 150.
    pub width: f32,
}

impl Default for Signature {
    fn default() -> Self {
        Self {
            image: String::new(),
            page: None,
            x: 72.0,
            y: 72.0,
            width: 150.0,
        }
    }
}

impl Signature {
    /// Decode the base64 payload, stripping a `data:…;base64,` prefix.
    pub fn image_bytes(&self) -> Result<Vec<u8>, Html2PdfError> {
        let payload = match self.image.split_once(";base64,") {
            Some((prefix, data)) if prefix.starts_with("data:") => data,
            _ => self.image.as_str(),
        };
        STANDARD
            .decode(payload.trim())
            .map_err(|e| Html2PdfError::InvalidRequest(format!("signature.image: {e}")))
    }

    pub fn validate(&self) -> Result<(), Html2PdfError> {
        if self.image.is_empty() {
            return Err(Html2PdfError::InvalidRequest(
                "signature.image is required".into(),
            ));
        }
        let bytes = self.image_bytes()?;
        let is_png = bytes.starts_with(b"\x89PNG");
        let is_jpeg = bytes.starts_with(&[0xFF, 0xD8, 0xFF]);
        if !is_png && !is_jpeg {
            return Err(Html2PdfError::InvalidRequest(
                "signature.image must be a PNG or JPEG".into(),
            ));
        }
        if self.page == Some(0) {
            return Err(Html2PdfError::InvalidRequest(
                "signature.page is 1-indexed".into(),
            ));
        }
        if self.width <= 0.0 || self.x < 0.0 || self.y < 0.0 {
            return Err(Html2PdfError::InvalidRequest(
                "signature position must be non-negative and width positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ServiceConfig {
        ServiceConfig::builder().max_html_bytes(64).build().unwrap()
    }

    #[test]
    fn requires_exactly_one_source() {
        let both = ConversionRequest {
            html: Some("<p>x</p>".into()),
            url: Some("https://example.com".into()),
            ..Default::default()
        };
        assert!(matches!(
            both.validate(&config()),
            Err(Html2PdfError::InvalidRequest(_))
        ));
        assert!(ConversionRequest::default().validate(&config()).is_err());
        assert!(ConversionRequest::from_html("<p>x</p>")
            .validate(&config())
            .is_ok());
    }

    #[test]
    fn size_limit_counts_css_and_js() {
        let mut req = ConversionRequest::from_html("<p>x</p>");
        req.css = Some("p{}".repeat(20));
        assert!(matches!(
            req.validate(&config()),
            Err(Html2PdfError::ContentTooLarge { limit: 64, .. })
        ));
    }

    #[test]
    fn url_requests_reject_css() {
        let mut req = ConversionRequest::from_url("https://example.com");
        req.css = Some("body{}".into());
        assert!(req.validate(&config()).is_err());
    }

    #[test]
    fn private_hosts_blocked_by_default() {
        let req = ConversionRequest::from_url("http://127.0.0.1:8080/admin");
        assert!(matches!(
            req.validate(&config()),
            Err(Html2PdfError::BlockedHost { .. })
        ));
    }

    #[test]
    fn too_many_merge_sources() {
        let mut req = ConversionRequest::from_html("<p>x</p>");
        req.merge_urls = vec!["https://example.com/a.pdf".into(); 11];
        assert!(req.validate(&config()).is_err());
    }

    #[test]
    fn deserialises_camel_case_body() {
        let req: ConversionRequest = serde_json::from_str(
            r#"{"html":"<p>hi</p>","aiRepair":true,"saveToVault":true,
                "watermark":{"text":"DRAFT"},"options":{"landscape":true}}"#,
        )
        .unwrap();
        assert!(req.ai_repair);
        assert!(req.save_to_vault);
        assert!(req.options.landscape);
        let w = req.watermark.unwrap();
        assert_eq!(w.text, "DRAFT");
        assert_eq!(w.opacity, 0.15);
    }

    #[test]
    fn signature_accepts_data_url() {
        let png_magic = STANDARD.encode(b"\x89PNG\r\n\x1a\nrest");
        let sig = Signature {
            image: format!("data:image/png;base64,{png_magic}"),
            ..Default::default()
        };
        assert!(sig.validate().is_ok());
        assert!(sig.image_bytes().unwrap().starts_with(b"\x89PNG"));

        let gif = Signature {
            image: STANDARD.encode(b"GIF89a"),
            ..Default::default()
        };
        assert!(gif.validate().is_err());
    }

    #[test]
    fn watermark_bounds() {
        let mut w = Watermark {
            text: "CONFIDENTIAL".into(),
            ..Default::default()
        };
        assert!(w.validate().is_ok());
        w.opacity = 1.5;
        assert!(w.validate().is_err());
        w.opacity = 0.3;
        w.text = String::new();
        assert!(w.validate().is_err());
    }
}
