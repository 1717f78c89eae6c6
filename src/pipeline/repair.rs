//! AI layout repair: ask an LLM to fix print-layout problems in the HTML.
//!
//! This stage is best effort. A model that errors, times out, or answers with
//! something that is not an HTML document never fails the request: the
//! original document is rendered and [`RepairOutcome::error`] says why.
//!
//! ## Retry Strategy
//!
//! 429 / 5xx responses are frequent under load and usually transient.
//! Exponential backoff (`repair_backoff_ms * 2^(attempt-1)`) with the default
//! 500 ms base and 2 retries waits 500 ms → 1 s before giving up.

use crate::config::{PdfOptions, ServiceConfig};
use crate::output::RepairOutcome;
use crate::pipeline::sanitize::{clean_html, looks_like_html_document};
use crate::prompts::{layout_repair_request, LAYOUT_REPAIR_PROMPT};
use edgequake_llm::{ChatMessage, CompletionOptions, LLMProvider};
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

/// Run the repair call and return the HTML to render next.
///
/// Always returns a usable document: either the repaired one or `html`.
pub async fn repair_layout(
    provider: &Arc<dyn LLMProvider>,
    html: &str,
    options: &PdfOptions,
    config: &ServiceConfig,
) -> (String, RepairOutcome) {
    if html.len() > config.repair_max_html_bytes {
        warn!(
            "Skipping AI repair: document is {} bytes (limit {})",
            html.len(),
            config.repair_max_html_bytes
        );
        return (
            html.to_string(),
            RepairOutcome {
                error: Some(format!(
                    "document exceeds {} bytes; repair skipped",
                    config.repair_max_html_bytes
                )),
                ..Default::default()
            },
        );
    }

    let messages = vec![
        ChatMessage::system(LAYOUT_REPAIR_PROMPT),
        ChatMessage::user(layout_repair_request(html, options)),
    ];
    let completion = build_options(config);

    let mut last_err: Option<String> = None;

    for attempt in 0..=config.repair_max_retries {
        if attempt > 0 {
            let backoff = backoff_ms(config.repair_backoff_ms, attempt);
            warn!(
                "AI repair: retry {}/{} after {}ms",
                attempt, config.repair_max_retries, backoff
            );
            sleep(Duration::from_millis(backoff)).await;
        }

        match provider.chat(&messages, Some(&completion)).await {
            Ok(response) => {
                debug!(
                    "AI repair: {} input tokens, {} output tokens",
                    response.prompt_tokens, response.completion_tokens
                );
                let cleaned = clean_html(&response.content);
                let mut outcome = RepairOutcome {
                    applied: false,
                    input_tokens: response.prompt_tokens,
                    output_tokens: response.completion_tokens,
                    retries: attempt,
                    error: None,
                };
                if !looks_like_html_document(&cleaned) {
                    // A well-formed answer that is not a document will not
                    // improve on retry; keep the original.
                    warn!("AI repair: model did not return an HTML document");
                    outcome.error = Some("model response was not an HTML document".into());
                    return (html.to_string(), outcome);
                }
                info!(
                    "AI repair applied ({} → {} bytes)",
                    html.len(),
                    cleaned.len()
                );
                outcome.applied = true;
                return (cleaned, outcome);
            }
            Err(e) => {
                let err_msg = format!("{}", e);
                warn!("AI repair: attempt {} failed: {}", attempt + 1, err_msg);
                last_err = Some(err_msg);
            }
        }
    }

    let err_msg = last_err.unwrap_or_else(|| "Unknown error".to_string());
    (
        html.to_string(),
        RepairOutcome {
            applied: false,
            retries: config.repair_max_retries,
            error: Some(format!(
                "LLM call failed after {} retries: {}",
                config.repair_max_retries, err_msg
            )),
            ..Default::default()
        },
    )
}

/// Delay before retry number `attempt` (1-based), saturating at `u64::MAX`.
fn backoff_ms(base_ms: u64, attempt: u32) -> u64 {
    let factor = 1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
    base_ms.saturating_mul(factor)
}

/// Build `CompletionOptions` from the service config.
fn build_options(config: &ServiceConfig) -> CompletionOptions {
    CompletionOptions {
        temperature: Some(config.temperature),
        max_tokens: Some(config.max_tokens),
        ..Default::default()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use async_trait::async_trait;
    use edgequake_llm::{ChatMessage, CompletionOptions, LLMProvider, LLMResponse, LlmError};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    /// Answers each chat call with the next scripted reply.
    pub(crate) struct ScriptedProvider {
        replies: Mutex<VecDeque<Result<String, String>>>,
        calls: AtomicUsize,
    }

    impl ScriptedProvider {
        pub(crate) fn new(replies: Vec<Result<&str, &str>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(
                    replies
                        .into_iter()
                        .map(|r| r.map(str::to_string).map_err(str::to_string))
                        .collect(),
                ),
                calls: AtomicUsize::new(0),
            })
        }

        pub(crate) fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl LLMProvider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        fn model(&self) -> &str {
            "scripted-1"
        }

        fn max_context_length(&self) -> usize {
            128_000
        }

        async fn complete(&self, prompt: &str) -> edgequake_llm::Result<LLMResponse> {
            self.complete_with_options(prompt, &CompletionOptions::default())
                .await
        }

        async fn complete_with_options(
            &self,
            _prompt: &str,
            _options: &CompletionOptions,
        ) -> edgequake_llm::Result<LLMResponse> {
            self.chat(&[], None).await
        }

        async fn chat(
            &self,
            _messages: &[ChatMessage],
            _options: Option<&CompletionOptions>,
        ) -> edgequake_llm::Result<LLMResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self.replies.lock().unwrap().pop_front();
            match next {
                Some(Ok(content)) => {
                    Ok(LLMResponse::new(content, "scripted-1").with_usage(120, 40))
                }
                Some(Err(msg)) => Err(LlmError::RateLimited(msg)),
                None => Err(LlmError::ApiError("script exhausted".into())),
            }
        }
    }
}
