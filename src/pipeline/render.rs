//! Headless render: load the document in Chromium and print it to PDF.
//!
//! ## Why a fresh browser per request?
//!
//! A shared browser accumulates state between tenants (cookies, service
//! workers, cache, leaked tabs) and one crashed renderer process takes every
//! in-flight request down with it. Launching per request costs a few hundred
//! milliseconds but isolates tenants completely, and the browser is always
//! closed before returning.
//!
//! The [`Renderer`] trait is the seam tests use to swap Chromium for an
//! in-process PDF builder.

use crate::config::{PdfOptions, ServiceConfig};
use crate::error::Html2PdfError;
use crate::pipeline::input::RenderSource;
use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::page::PrintToPdfParams;
use chromiumoxide::Page;
use futures::StreamExt;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Anything that can turn a [`RenderSource`] into PDF bytes.
#[async_trait]
pub trait Renderer: Send + Sync {
    async fn render(
        &self,
        source: &RenderSource,
        options: &PdfOptions,
    ) -> Result<Vec<u8>, Html2PdfError>;
}

/// Renderer backed by a headless Chromium launched through chromiumoxide.
#[derive(Debug, Clone)]
pub struct ChromiumRenderer {
    executable: Option<String>,
    no_sandbox: bool,
    timeout_secs: u64,
}

impl ChromiumRenderer {
    pub fn new(config: &ServiceConfig) -> Self {
        Self {
            executable: config.chrome_executable.clone(),
            no_sandbox: config.chrome_no_sandbox,
            timeout_secs: config.render_timeout_secs,
        }
    }

    fn browser_config(&self) -> Result<BrowserConfig, Html2PdfError> {
        let mut builder = BrowserConfig::builder()
            .request_timeout(Duration::from_secs(self.timeout_secs))
            .arg("--disable-gpu")
            .arg("--disable-dev-shm-usage")
            .arg("--hide-scrollbars")
            .arg("--mute-audio");
        if self.no_sandbox {
            builder = builder.no_sandbox();
        }
        if let Some(ref path) = self.executable {
            builder = builder.chrome_executable(path);
        }
        builder.build().map_err(Html2PdfError::BrowserLaunchFailed)
    }

    /// Launch, print and close. The deadline covers launch and printing;
    /// the browser is closed and the handler task aborted on every path.
    async fn render_in_fresh_browser(
        &self,
        source: &RenderSource,
        options: &PdfOptions,
    ) -> Result<Vec<u8>, Html2PdfError> {
        let deadline = Instant::now() + Duration::from_secs(self.timeout_secs);

        let (mut browser, mut handler) = within(deadline, self.timeout_secs, async {
            Browser::launch(self.browser_config()?)
                .await
                .map_err(|e| Html2PdfError::BrowserLaunchFailed(e.to_string()))
        })
        .await?;

        // The CDP handler must be polled for the browser to make progress.
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });

        let result = within(
            deadline,
            self.timeout_secs,
            print_page(&browser, source, options),
        )
        .await;

        let shutdown = async {
            if let Err(e) = browser.close().await {
                warn!("Browser close failed: {}", e);
            }
            if let Err(e) = browser.wait().await {
                warn!("Browser did not exit cleanly: {}", e);
            }
        };
        if tokio::time::timeout(CLOSE_GRACE, shutdown).await.is_err() {
            warn!("Browser did not close within {:?}", CLOSE_GRACE);
        }
        handler_task.abort();

        result
    }
}

/// Time allowed for a graceful browser shutdown after printing.
const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Run `fut` until `deadline`, reporting a miss as [`Html2PdfError::RenderTimeout`].
async fn within<T>(
    deadline: Instant,
    secs: u64,
    fut: impl Future<Output = Result<T, Html2PdfError>>,
) -> Result<T, Html2PdfError> {
    tokio::time::timeout_at(deadline, fut)
        .await
        .map_err(|_| Html2PdfError::RenderTimeout { secs })?
}

#[async_trait]
impl Renderer for ChromiumRenderer {
    async fn render(
        &self,
        source: &RenderSource,
        options: &PdfOptions,
    ) -> Result<Vec<u8>, Html2PdfError> {
        info!("Rendering {}", source.describe());
        let pdf = self.render_in_fresh_browser(source, options).await?;

        if !pdf.starts_with(b"%PDF") {
            return Err(Html2PdfError::RenderFailed(
                "browser output is not a PDF".into(),
            ));
        }
        debug!("Rendered {} bytes", pdf.len());
        Ok(pdf)
    }
}

async fn print_page(
    browser: &Browser,
    source: &RenderSource,
    options: &PdfOptions,
) -> Result<Vec<u8>, Html2PdfError> {
    let page: Page = browser
        .new_page("about:blank")
        .await
        .map_err(|e| Html2PdfError::RenderFailed(format!("new page: {e}")))?;

    match source {
        RenderSource::Html(html) => {
            page.set_content(html.as_str())
                .await
                .map_err(|e| Html2PdfError::RenderFailed(format!("set content: {e}")))?;
        }
        RenderSource::Url(url) => {
            page.goto(url.as_str())
                .await
                .map_err(|e| Html2PdfError::RenderFailed(format!("navigate to {url}: {e}")))?;
            page.wait_for_navigation()
                .await
                .map_err(|e| Html2PdfError::RenderFailed(format!("load {url}: {e}")))?;
        }
    }

    if options.delay_ms > 0 {
        tokio::time::sleep(Duration::from_millis(options.delay_ms)).await;
    }

    let params = print_params(options)?;
    page.pdf(params)
        .await
        .map_err(|e| Html2PdfError::RenderFailed(format!("print to pdf: {e}")))
}

/// Map [`PdfOptions`] onto the DevTools `Page.printToPDF` parameters.
pub fn print_params(options: &PdfOptions) -> Result<PrintToPdfParams, Html2PdfError> {
    let (width, height) = options.paper_size_inches()?;
    let margin = options.margin.to_inches()?;
    Ok(PrintToPdfParams {
        landscape: Some(options.landscape),
        display_header_footer: Some(options.display_header_footer),
        print_background: Some(options.print_background),
        scale: Some(options.scale),
        paper_width: Some(width),
        paper_height: Some(height),
        margin_top: Some(margin.top),
        margin_bottom: Some(margin.bottom),
        margin_left: Some(margin.left),
        margin_right: Some(margin.right),
        page_ranges: options.page_ranges.clone(),
        // An empty template suppresses Chromium's default date/title header.
        header_template: options
            .display_header_footer
            .then(|| options.header_template.clone().unwrap_or_else(|| "<span></span>".into())),
        footer_template: options
            .display_header_footer
            .then(|| options.footer_template.clone().unwrap_or_else(|| "<span></span>".into())),
        prefer_css_page_size: Some(options.prefer_css_page_size),
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PaperFormat;

    #[test]
    fn print_params_map_paper_and_margins() {
        let options = PdfOptions::builder()
            .format(PaperFormat::Letter)
            .margin_all("1in")
            .landscape(true)
            .build()
            .unwrap();
        let p = print_params(&options).unwrap();
        assert_eq!(p.paper_width, Some(8.5));
        assert_eq!(p.paper_height, Some(11.0));
        assert_eq!(p.margin_top, Some(1.0));
        assert_eq!(p.margin_left, Some(1.0));
        assert_eq!(p.landscape, Some(true));
        assert_eq!(p.print_background, Some(true));
        assert!(p.header_template.is_none());
    }

    #[test]
    fn header_footer_defaults_to_blank_templates() {
        let options = PdfOptions::builder()
            .header_footer(None, Some("<div class=pageNumber></div>".into()))
            .build()
            .unwrap();
        let p = print_params(&options).unwrap();
        assert_eq!(p.display_header_footer, Some(true));
        assert_eq!(p.header_template.as_deref(), Some("<span></span>"));
        assert_eq!(
            p.footer_template.as_deref(),
            Some("<div class=pageNumber></div>")
        );
    }

    #[test]
    fn chromium_renderer_reads_service_config() {
        let config = ServiceConfig::builder()
            .render_timeout_secs(5)
            .chrome_executable("/usr/bin/chromium")
            .build()
            .unwrap();
        let r = ChromiumRenderer::new(&config);
        assert_eq!(r.timeout_secs, 5);
        assert_eq!(r.executable.as_deref(), Some("/usr/bin/chromium"));
        assert!(r.no_sandbox);
    }

    #[tokio::test]
    async fn deadline_miss_is_a_render_timeout() {
        let deadline = Instant::now() + Duration::from_millis(20);
        let stalled = std::future::pending::<Result<Vec<u8>, Html2PdfError>>();
        assert!(matches!(
            within(deadline, 7, stalled).await,
            Err(Html2PdfError::RenderTimeout { secs: 7 })
        ));
    }

    #[tokio::test]
    async fn work_before_deadline_passes_through() {
        let deadline = Instant::now() + Duration::from_secs(5);
        let out = within(deadline, 5, async { Ok(b"%PDF-1.7".to_vec()) }).await;
        assert_eq!(out.unwrap(), b"%PDF-1.7");

        let failed = within(deadline, 5, async {
            Err::<Vec<u8>, _>(Html2PdfError::RenderFailed("boom".into()))
        })
        .await;
        assert!(matches!(failed, Err(Html2PdfError::RenderFailed(_))));
    }
}
