//! Content assembly: turn a request into something the renderer can load.
//!
//! Two kinds of input exist:
//!
//! * **HTML**: the caller's markup plus optional CSS and JS, merged into a
//!   single document. Fragments are wrapped in an HTML5 skeleton so the
//!   browser never falls back to quirks mode.
//! * **URL**: navigated to by the browser. Only fetched here when the HTML
//!   itself is needed (AI repair), in which case a `<base href>` is added so
//!   relative assets still resolve.
//!
//! Every URL is checked before use. The renderer runs inside our network, so
//! loopback, private and link-local targets are refused unless the operator
//! opts in.

use crate::error::Html2PdfError;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use tracing::{debug, info};

/// Upper bound on a single download (page HTML or merge source).
const MAX_DOWNLOAD_BYTES: usize = 50 * 1024 * 1024;

/// What the renderer should load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderSource {
    /// A complete HTML document, loaded with `setContent`.
    Html(String),
    /// A page the browser navigates to.
    Url(String),
}

impl RenderSource {
    pub fn describe(&self) -> String {
        match self {
            RenderSource::Html(html) => format!("html ({} bytes)", html.len()),
            RenderSource::Url(url) => format!("url {url}"),
        }
    }
}

/// Validate scheme and host of a caller-supplied URL.
pub fn validate_url(url: &str, allow_private_hosts: bool) -> Result<reqwest::Url, Html2PdfError> {
    let parsed = reqwest::Url::parse(url).map_err(|e| Html2PdfError::InvalidUrl {
        url: url.to_string(),
        reason: e.to_string(),
    })?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(Html2PdfError::InvalidUrl {
            url: url.to_string(),
            reason: format!("scheme '{}' is not http or https", parsed.scheme()),
        });
    }
    let host = parsed
        .host_str()
        .ok_or_else(|| Html2PdfError::InvalidUrl {
            url: url.to_string(),
            reason: "missing host".into(),
        })?
        .to_ascii_lowercase();
    if !allow_private_hosts && is_private_host(&host) {
        return Err(Html2PdfError::BlockedHost { host });
    }
    Ok(parsed)
}

/// Loopback, private, link-local, unspecified or `localhost` names.
fn is_private_host(host: &str) -> bool {
    if host == "localhost" || host.ends_with(".localhost") {
        return true;
    }
    let bare = host.trim_start_matches('[').trim_end_matches(']');
    match bare.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => is_private_v4(v4),
        // `::ffff:a.b.c.d` and `::a.b.c.d` reach the embedded IPv4 host.
        Ok(IpAddr::V6(v6)) => {
            v6.is_loopback()
                || v6.is_unspecified()
                || v6.is_unique_local()
                || v6.is_unicast_link_local()
                || v6.to_ipv4().is_some_and(is_private_v4)
        }
        Err(_) => false,
    }
}

fn is_private_v4(v4: Ipv4Addr) -> bool {
    v4.is_private()
        || v4.is_loopback()
        || v4.is_link_local()
        || v4.is_broadcast()
        || v4.is_unspecified()
}

// ── HTML / CSS / JS merge ────────────────────────────────────────────────

/// Merge HTML, CSS and JS into a single document.
///
/// CSS lands in a `<style>` before `</head>`, JS in a `<script>` before the
/// last `</body>`. Closing tags inside the CSS/JS are neutralised so they
/// cannot terminate the element early.
pub fn assemble_html(html: &str, css: Option<&str>, js: Option<&str>) -> String {
    let mut doc = if has_document_element(html) {
        html.to_string()
    } else {
        wrap_fragment(html)
    };

    if let Some(css) = css.filter(|c| !c.trim().is_empty()) {
        let tag = format!(
            "<style>\n{}\n</style>\n",
            replace_ci(css, "</style", "<\\/style")
        );
        insert_into_head(&mut doc, &tag);
    }

    if let Some(js) = js.filter(|j| !j.trim().is_empty()) {
        let tag = format!(
            "<script>\n{}\n</script>\n",
            replace_ci(js, "</script", "<\\/script")
        );
        match rfind_ci(&doc, "</body>").or_else(|| rfind_ci(&doc, "</html>")) {
            Some(at) => doc.insert_str(at, &tag),
            None => doc.push_str(&tag),
        }
    }

    doc
}

/// Add `<base href>` right after the opening `<head>` tag.
pub fn inject_base_href(html: &str, base: &str) -> String {
    let tag = format!("<base href=\"{}\">", base.replace('"', "%22"));
    let mut doc = if has_document_element(html) {
        html.to_string()
    } else {
        wrap_fragment(html)
    };
    match find_ci(&doc, "<head") {
        Some(start) => {
            let close = doc[start..].find('>').map(|i| start + i + 1);
            match close {
                Some(at) => doc.insert_str(at, &tag),
                None => doc.insert_str(0, &tag),
            }
        }
        None => insert_into_head(&mut doc, &tag),
    }
    doc
}

fn has_document_element(html: &str) -> bool {
    find_ci(html, "<html").is_some()
}

fn wrap_fragment(fragment: &str) -> String {
    format!(
        "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n</head>\n<body>\n{}\n</body>\n</html>\n",
        fragment
    )
}

fn insert_into_head(doc: &mut String, tag: &str) {
    if let Some(at) = find_ci(doc, "</head>") {
        doc.insert_str(at, tag);
    } else if let Some(at) = find_ci(doc, "<body") {
        doc.insert_str(at, &format!("<head>\n{tag}</head>\n"));
    } else {
        doc.insert_str(0, tag);
    }
}

// ASCII lowercasing keeps byte offsets stable, so indices map back to `haystack`.
fn find_ci(haystack: &str, needle: &str) -> Option<usize> {
    haystack.to_ascii_lowercase().find(needle)
}

fn rfind_ci(haystack: &str, needle: &str) -> Option<usize> {
    haystack.to_ascii_lowercase().rfind(needle)
}

fn replace_ci(input: &str, needle: &str, replacement: &str) -> String {
    let lower = input.to_ascii_lowercase();
    let mut out = String::with_capacity(input.len());
    let mut last = 0;
    for (at, _) in lower.match_indices(needle) {
        out.push_str(&input[last..at]);
        out.push_str(replacement);
        last = at + needle.len();
    }
    out.push_str(&input[last..]);
    out
}

// ── Downloads ────────────────────────────────────────────────────────────

/// HTTP client for page HTML and merge sources.
///
/// Redirects are followed (up to 5) only while they stay on allowed hosts;
/// otherwise a public URL could bounce the fetch onto an internal address.
#[derive(Clone)]
pub struct Fetcher {
    client: reqwest::Client,
    timeout_secs: u64,
}

impl Fetcher {
    pub fn new(timeout_secs: u64, allow_private_hosts: bool) -> Result<Self, Html2PdfError> {
        let policy = reqwest::redirect::Policy::custom(move |attempt| {
            if attempt.previous().len() >= 5 {
                return attempt.stop();
            }
            let blocked = attempt
                .url()
                .host_str()
                .map(|h| !allow_private_hosts && is_private_host(&h.to_ascii_lowercase()))
                .unwrap_or(true);
            if blocked {
                attempt.error("redirect to a blocked host")
            } else {
                attempt.follow()
            }
        });
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .redirect(policy)
            .user_agent(concat!("edgequake-html2pdf/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Html2PdfError::Internal(format!("http client: {e}")))?;
        Ok(Self {
            client,
            timeout_secs,
        })
    }

    async fn get_bytes(&self, url: &str) -> Result<Vec<u8>, Html2PdfError> {
        let response = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                Html2PdfError::FetchTimeout {
                    url: url.to_string(),
                    secs: self.timeout_secs,
                }
            } else {
                Html2PdfError::FetchFailed {
                    url: url.to_string(),
                    reason: e.to_string(),
                }
            }
        })?;

        if !response.status().is_success() {
            return Err(Html2PdfError::FetchFailed {
                url: url.to_string(),
                reason: format!("HTTP {}", response.status()),
            });
        }
        if let Some(len) = response.content_length() {
            if len as usize > MAX_DOWNLOAD_BYTES {
                return Err(Html2PdfError::FetchFailed {
                    url: url.to_string(),
                    reason: format!("body of {len} bytes exceeds {MAX_DOWNLOAD_BYTES}"),
                });
            }
        }

        let bytes = response.bytes().await.map_err(|e| {
            if e.is_timeout() {
                Html2PdfError::FetchTimeout {
                    url: url.to_string(),
                    secs: self.timeout_secs,
                }
            } else {
                Html2PdfError::FetchFailed {
                    url: url.to_string(),
                    reason: e.to_string(),
                }
            }
        })?;
        if bytes.len() > MAX_DOWNLOAD_BYTES {
            return Err(Html2PdfError::FetchFailed {
                url: url.to_string(),
                reason: format!("body exceeds {MAX_DOWNLOAD_BYTES} bytes"),
            });
        }
        debug!("Fetched {} bytes from {}", bytes.len(), url);
        Ok(bytes.to_vec())
    }

    /// Download a page and return its HTML with a `<base href>` pointing back at it.
    ///
    /// Pages larger than `max_bytes` give `ContentTooLarge`, the same bound
    /// inline HTML is held to.
    pub async fn fetch_html(&self, url: &str, max_bytes: usize) -> Result<String, Html2PdfError> {
        info!("Fetching page HTML from: {}", url);
        let bytes = self.get_bytes(url).await?;
        if bytes.len() > max_bytes {
            return Err(Html2PdfError::ContentTooLarge {
                size: bytes.len(),
                limit: max_bytes,
            });
        }
        let html = String::from_utf8_lossy(&bytes);
        Ok(inject_base_href(&html, url))
    }

    /// Download a PDF, verifying the `%PDF` magic bytes.
    pub async fn fetch_pdf(&self, url: &str) -> Result<Vec<u8>, Html2PdfError> {
        info!("Fetching merge source: {}", url);
        let bytes = self.get_bytes(url).await?;
        if !bytes.starts_with(b"%PDF") {
            return Err(Html2PdfError::NotAPdf {
                url: url.to_string(),
                magic: bytes.iter().take(4).copied().collect(),
            });
        }
        Ok(bytes)
    }
}
