//! The conversion pipeline, end to end, without auth or billing.
//!
//! [`Converter::convert`] takes a [`ConversionRequest`] through validation,
//! content assembly, optional AI repair, rendering, post-processing and page
//! counting. The HTTP service wraps it with metering; the CLI's `convert`
//! command calls it directly.

use crate::cache::{cache_key, CachedPdf, PdfCache};
use crate::config::ServiceConfig;
use crate::error::Html2PdfError;
use crate::output::{ConversionOutput, ConversionStats, RepairOutcome};
use crate::pipeline::input::{assemble_html, Fetcher, RenderSource};
use crate::pipeline::postprocess::{self, PostProcessPlan};
use crate::pipeline::render::{ChromiumRenderer, Renderer};
use crate::pipeline::{inspect, repair};
use crate::request::{ConversionRequest, SourceKind};
use edgequake_llm::{LLMProvider, ProviderFactory};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

const DEFAULT_REPAIR_MODEL: &str = "gpt-4.1-mini";

/// Shared, long-lived conversion engine. Cheap to put behind an `Arc`.
pub struct Converter {
    config: ServiceConfig,
    renderer: Arc<dyn Renderer>,
    fetcher: Fetcher,
    cache: PdfCache,
}

impl std::fmt::Debug for Converter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Converter")
            .field("config", &self.config)
            .field("renderer", &"<dyn Renderer>")
            .field("cache", &self.cache)
            .finish()
    }
}

impl Converter {
    /// A converter that renders with headless Chromium.
    pub fn new(config: ServiceConfig) -> Result<Self, Html2PdfError> {
        let renderer = Arc::new(ChromiumRenderer::new(&config));
        Self::with_renderer(config, renderer)
    }

    /// A converter using a caller-supplied renderer.
    pub fn with_renderer(
        config: ServiceConfig,
        renderer: Arc<dyn Renderer>,
    ) -> Result<Self, Html2PdfError> {
        let fetcher = Fetcher::new(config.fetch_timeout_secs, config.allow_private_hosts)?;
        let cache = PdfCache::new(
            Duration::from_secs(config.cache_ttl_secs),
            config.cache_capacity,
        );
        Ok(Self {
            config,
            renderer,
            fetcher,
            cache,
        })
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn cache(&self) -> &PdfCache {
        &self.cache
    }

    /// Convert one request to a finished PDF.
    ///
    /// # Errors
    /// Any validation, fetch, render or post-processing failure. AI repair
    /// failures are not errors once a provider exists; see
    /// [`ConversionOutput::repair`].
    pub async fn convert(
        &self,
        request: &ConversionRequest,
    ) -> Result<ConversionOutput, Html2PdfError> {
        let total_start = Instant::now();
        let kind = request.source_kind();

        // ── Step 1: Validate ─────────────────────────────────────────────
        request.validate(&self.config)?;

        // ── Step 2: Provider (fail fast, before any network or browser work)
        let provider = if request.ai_repair {
            Some(resolve_provider(&self.config).await?)
        } else {
            None
        };

        // ── Step 3: Assemble content / consult cache ─────────────────────
        let mut cache_slot: Option<String> = None;
        let mut source = match (&request.html, &request.url) {
            (Some(html), _) => {
                let assembled =
                    assemble_html(html, request.css.as_deref(), request.js.as_deref());
                if self.cache.is_enabled() {
                    let key = cache_key(&assembled, request);
                    if let Some(hit) = self.cache.get(&key) {
                        info!("Cache hit ({} pages)", hit.pages);
                        return Ok(cached_output(hit, kind, total_start));
                    }
                    cache_slot = Some(key);
                }
                RenderSource::Html(assembled)
            }
            (None, Some(url)) if request.ai_repair => {
                RenderSource::Html(
                    self.fetcher
                        .fetch_html(url, self.config.max_html_bytes)
                        .await?,
                )
            }
            (None, Some(url)) => RenderSource::Url(url.clone()),
            (None, None) => {
                return Err(Html2PdfError::InvalidRequest(
                    "one of html or url is required".into(),
                ))
            }
        };

        // ── Step 4: AI layout repair ─────────────────────────────────────
        let mut repair_outcome: Option<RepairOutcome> = None;
        let repair_start = Instant::now();
        if let (Some(provider), RenderSource::Html(html)) = (&provider, &mut source) {
            let (repaired, outcome) =
                repair::repair_layout(provider, html, &request.options, &self.config).await;
            *html = repaired;
            repair_outcome = Some(outcome);
        }
        let repair_duration_ms = repair_start.elapsed().as_millis() as u64;

        // ── Step 5: Merge sources (before rendering so a bad URL costs nothing)
        let merge_sources = futures::future::try_join_all(
            request
                .merge_urls
                .iter()
                .map(|url| self.fetcher.fetch_pdf(url)),
        )
        .await?;

        // ── Step 6: Render ───────────────────────────────────────────────
        let render_start = Instant::now();
        let rendered = self.renderer.render(&source, &request.options).await?;
        let render_duration_ms = render_start.elapsed().as_millis() as u64;
        info!("Rendered {} bytes in {}ms", rendered.len(), render_duration_ms);

        // ── Step 7: Post-process ─────────────────────────────────────────
        let merged_sources = merge_sources.len();
        let plan = PostProcessPlan {
            merge_sources,
            watermark: request.watermark.clone(),
            signature: request.signature.clone(),
        };
        let postprocess_start = Instant::now();
        let pdf = postprocess::apply(rendered, plan).await?;
        let postprocess_duration_ms = postprocess_start.elapsed().as_millis() as u64;

        // ── Step 8: Count pages ──────────────────────────────────────────
        let pages = inspect::page_count(&pdf)?;
        debug!("Final document: {} pages, {} bytes", pages, pdf.len());

        if let Some(key) = cache_slot {
            self.cache.insert(
                key,
                CachedPdf {
                    pdf: pdf.clone(),
                    pages,
                },
            );
        }

        let stats = ConversionStats {
            pages,
            bytes: pdf.len(),
            cached: false,
            source: Some(kind),
            merged_sources,
            total_duration_ms: total_start.elapsed().as_millis() as u64,
            repair_duration_ms,
            render_duration_ms,
            postprocess_duration_ms,
        };
        info!(
            "Conversion complete: {} pages, {}ms total",
            pages, stats.total_duration_ms
        );

        Ok(ConversionOutput {
            pdf,
            stats,
            repair: repair_outcome,
        })
    }

    /// Convert and write the PDF to `output_path` atomically.
    pub async fn convert_to_file(
        &self,
        request: &ConversionRequest,
        output_path: impl AsRef<Path>,
    ) -> Result<ConversionStats, Html2PdfError> {
        let output = self.convert(request).await?;
        let path = output_path.as_ref();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Html2PdfError::Internal(format!("{}: {e}", parent.display())))?;
        }

        // Atomic write: write to temp, then rename
        let tmp_path = path.with_extension("pdf.tmp");
        tokio::fs::write(&tmp_path, &output.pdf)
            .await
            .map_err(|e| Html2PdfError::Internal(format!("{}: {e}", tmp_path.display())))?;
        tokio::fs::rename(&tmp_path, path)
            .await
            .map_err(|e| Html2PdfError::Internal(format!("{}: {e}", path.display())))?;

        Ok(output.stats)
    }
}

fn cached_output(hit: CachedPdf, kind: SourceKind, start: Instant) -> ConversionOutput {
    ConversionOutput {
        stats: ConversionStats {
            pages: hit.pages,
            bytes: hit.pdf.len(),
            cached: true,
            source: Some(kind),
            total_duration_ms: start.elapsed().as_millis() as u64,
            ..Default::default()
        },
        pdf: hit.pdf,
        repair: None,
    }
}

// ── Provider resolution ──────────────────────────────────────────────────

fn create_provider(provider_name: &str, model: &str) -> Result<Arc<dyn LLMProvider>, Html2PdfError> {
    ProviderFactory::create_llm_provider(provider_name, model).map_err(|e| {
        Html2PdfError::ProviderNotConfigured {
            provider: provider_name.to_string(),
            hint: format!("{e}"),
        }
    })
}

/// Resolve the repair LLM provider, from most-specific to least-specific.
///
/// 1. **Pre-built provider** (`config.provider`), used as-is.
/// 2. **Named provider + model** (`config.provider_name`); the factory reads
///    the matching API key from the environment.
/// 3. **Environment pair** (`EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL`),
///    honoured before auto-detection so the model choice survives when
///    several API keys are present.
/// 4. **OpenAI** when `OPENAI_API_KEY` is set.
/// 5. **Full auto-detection** (`ProviderFactory::from_env`).
pub async fn resolve_provider(
    config: &ServiceConfig,
) -> Result<Arc<dyn LLMProvider>, Html2PdfError> {
    if let Some(ref provider) = config.provider {
        return Ok(Arc::clone(provider));
    }

    let model = config.model.as_deref().unwrap_or(DEFAULT_REPAIR_MODEL);
    if let Some(ref name) = config.provider_name {
        return create_provider(name, model);
    }

    if let (Ok(prov), Ok(env_model)) = (
        std::env::var("EDGEQUAKE_LLM_PROVIDER"),
        std::env::var("EDGEQUAKE_MODEL"),
    ) {
        if !prov.is_empty() && !env_model.is_empty() {
            return create_provider(&prov, &env_model);
        }
    }

    if let Ok(openai_key) = std::env::var("OPENAI_API_KEY") {
        if !openai_key.is_empty() {
            return create_provider("openai", model);
        }
    }

    let (llm_provider, _embedding) =
        ProviderFactory::from_env().map_err(|e| Html2PdfError::ProviderNotConfigured {
            provider: "auto".to_string(),
            hint: format!(
                "AI repair needs an LLM provider.\n\
                Set OPENAI_API_KEY, ANTHROPIC_API_KEY, or configure a provider.\n\
                Error: {}",
                e
            ),
        })?;

    Ok(llm_provider)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::inspect::test_support::sample_pdf;
    use crate::pipeline::repair::test_support::ScriptedProvider;
    use crate::request::Watermark;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Records what it was asked to render and returns an N-page PDF.
    #[derive(Default)]
    struct FakeRenderer {
        pages: usize,
        calls: AtomicUsize,
        last_source: Mutex<Option<RenderSource>>,
    }

    #[async_trait]
    impl Renderer for FakeRenderer {
        async fn render(
            &self,
            source: &RenderSource,
            _options: &crate::config::PdfOptions,
        ) -> Result<Vec<u8>, Html2PdfError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_source.lock().unwrap() = Some(source.clone());
            Ok(sample_pdf(self.pages))
        }
    }

    fn converter(pages: usize) -> (Converter, Arc<FakeRenderer>) {
        converter_with(ServiceConfig::default(), pages)
    }

    fn converter_with(config: ServiceConfig, pages: usize) -> (Converter, Arc<FakeRenderer>) {
        let renderer = Arc::new(FakeRenderer {
            pages,
            ..Default::default()
        });
        let c = Converter::with_renderer(config, renderer.clone()).unwrap();
        (c, renderer)
    }

    fn rendered_html(renderer: &FakeRenderer) -> String {
        let source = renderer.last_source.lock().unwrap().clone();
        match source {
            Some(RenderSource::Html(html)) => html,
            other => panic!("unexpected source: {other:?}"),
        }
    }

    #[tokio::test]
    async fn html_is_assembled_and_counted() {
        let (c, renderer) = converter(3);
        let mut req = ConversionRequest::from_html("<h1>Hi</h1>");
        req.css = Some("h1{color:red}".into());
        let out = c.convert(&req).await.unwrap();

        assert_eq!(out.stats.pages, 3);
        assert!(!out.stats.cached);
        assert_eq!(out.stats.source, Some(SourceKind::Html));
        assert!(out.repair.is_none());
        let source = renderer.last_source.lock().unwrap().clone();
        match source {
            Some(RenderSource::Html(html)) => {
                assert!(html.contains("<style>\nh1{color:red}\n</style>"));
                assert!(html.contains("<h1>Hi</h1>"));
            }
            other => panic!("unexpected source: {other:?}"),
        }
    }

    #[tokio::test]
    async fn second_identical_request_hits_cache() {
        let (c, renderer) = converter(2);
        let req = ConversionRequest::from_html("<p>same</p>");
        let first = c.convert(&req).await.unwrap();
        let second = c.convert(&req).await.unwrap();

        assert!(!first.stats.cached);
        assert!(second.stats.cached);
        assert_eq!(second.stats.pages, 2);
        assert_eq!(first.pdf, second.pdf);
        assert_eq!(renderer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn different_options_miss_cache() {
        let (c, renderer) = converter(1);
        let mut req = ConversionRequest::from_html("<p>x</p>");
        c.convert(&req).await.unwrap();
        req.watermark = Some(Watermark {
            text: "DRAFT".into(),
            ..Default::default()
        });
        let out = c.convert(&req).await.unwrap();
        assert!(!out.stats.cached);
        assert_eq!(renderer.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn url_requests_navigate_and_skip_cache() {
        let (c, renderer) = converter(1);
        let req = ConversionRequest::from_url("https://example.com/report");
        c.convert(&req).await.unwrap();
        c.convert(&req).await.unwrap();
        assert_eq!(renderer.calls.load(Ordering::SeqCst), 2);
        assert!(c.cache().is_empty());
        let source = renderer.last_source.lock().unwrap().clone();
        assert_eq!(
            source,
            Some(RenderSource::Url("https://example.com/report".into()))
        );
    }

    #[tokio::test]
    async fn invalid_request_never_renders() {
        let (c, renderer) = converter(1);
        let req = ConversionRequest::default();
        assert!(matches!(
            c.convert(&req).await,
            Err(Html2PdfError::InvalidRequest(_))
        ));
        assert_eq!(renderer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn convert_to_file_writes_pdf() {
        let (c, _) = converter(2);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("doc.pdf");
        let stats = c
            .convert_to_file(&ConversionRequest::from_html("<p>f</p>"), &path)
            .await
            .unwrap();
        assert_eq!(stats.pages, 2);
        let bytes = std::fs::read(&path).unwrap();
        assert!(bytes.starts_with(b"%PDF"));
        assert!(!path.with_extension("pdf.tmp").exists());
    }

    #[tokio::test]
    async fn repaired_html_is_what_gets_rendered() {
        let provider = ScriptedProvider::new(vec![
            Err("503 upstream"),
            Ok("<!DOCTYPE html><html><body><h1>Fixed</h1></body></html>"),
        ]);
        let config = ServiceConfig::builder()
            .provider(provider.clone())
            .repair_backoff_ms(1)
            .build()
            .unwrap();
        let (c, renderer) = converter_with(config, 2);
        let mut req = ConversionRequest::from_html("<h1>Broken</h1>");
        req.ai_repair = true;

        let out = c.convert(&req).await.unwrap();
        let repair = out.repair.unwrap();
        assert!(repair.applied);
        assert_eq!(repair.retries, 1);
        assert_eq!(provider.calls(), 2);
        let html = rendered_html(&renderer);
        assert!(html.contains("<h1>Fixed</h1>"));
        assert!(!html.contains("Broken"));
        assert_eq!(out.stats.pages, 2);
    }

    #[tokio::test]
    async fn unusable_repair_renders_original() {
        let provider = ScriptedProvider::new(vec![Ok("Looks good, no changes needed.")]);
        let config = ServiceConfig::builder()
            .provider(provider)
            .repair_backoff_ms(1)
            .build()
            .unwrap();
        let (c, renderer) = converter_with(config, 1);
        let mut req = ConversionRequest::from_html("<h1>Original</h1>");
        req.ai_repair = true;

        let out = c.convert(&req).await.unwrap();
        let repair = out.repair.unwrap();
        assert!(!repair.applied);
        assert!(repair.error.is_some());
        assert!(rendered_html(&renderer).contains("<h1>Original</h1>"));
    }

    #[tokio::test]
    async fn repair_without_provider_fails_before_rendering() {
        let config = ServiceConfig::builder()
            .provider_name("no-such-provider")
            .build()
            .unwrap();
        let (c, renderer) = converter_with(config, 1);
        let mut req = ConversionRequest::from_html("<p>x</p>");
        req.ai_repair = true;

        assert!(matches!(
            c.convert(&req).await,
            Err(Html2PdfError::ProviderNotConfigured { .. })
        ));
        assert_eq!(renderer.calls.load(Ordering::SeqCst), 0);
    }
}
