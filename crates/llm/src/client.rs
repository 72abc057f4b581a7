//! Capability-aware failover client.
//!
//! One operation, two shapes: `chat` (blocking) and `chat_stream`
//! (connection-time failover, then events). The client:
//!
//! 1. Computes the required capability set from the request.
//! 2. Filters endpoints (healthy ∧ superset), priority ascending then name.
//! 3. Soft-degrades unsatisfiable media blocks instead of failing.
//! 4. Walks endpoints applying the per-class retry policy: auth errors kill
//!    the endpoint for the process lifetime, rate limits back off and retry
//!    on the same endpoint, transient errors retry once, permanent errors
//!    fall through immediately.

use std::sync::Arc;
use std::time::{Duration, Instant};

use valet_domain::cancel::CancelToken;
use valet_domain::capability::{
    block_capability, required_capabilities, Capability, CapabilitySet,
};
use valet_domain::config::{EndpointConfig, NetworkConfig, Settings};
use valet_domain::error::{Error, Result};
use valet_domain::message::{ContentBlock, Message, MessageContent};
use valet_domain::stream::{BoxStream, ProviderEvent};
use valet_domain::trace::TraceEvent;

use crate::endpoint::{Endpoint, EndpointSet};
use crate::traits::{ChatClient, ChatRequest, ChatResponse};

const BACKOFF_CAP_SECS: u64 = 30;
const CANCEL_POLL_MS: u64 = 100;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// LlmClient
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct LlmClient {
    endpoints: EndpointSet,
    settings: Settings,
    network: NetworkConfig,
}

impl LlmClient {
    pub fn from_config(
        configs: &[EndpointConfig],
        network: &NetworkConfig,
        settings: Settings,
    ) -> Self {
        Self {
            endpoints: EndpointSet::from_configs(configs, network),
            settings,
            network: network.clone(),
        }
    }

    /// Build from an already-constructed endpoint set (used by tests).
    pub fn new(endpoints: EndpointSet, settings: Settings) -> Self {
        Self {
            endpoints,
            settings,
            network: NetworkConfig::default(),
        }
    }

    pub fn endpoints(&self) -> &EndpointSet {
        &self.endpoints
    }

    /// Hot reload: atomically swap in a new endpoint list built from fresh
    /// configs. In-flight requests finish on the list they hold.
    pub fn reload(&self, configs: &[EndpointConfig]) {
        let fresh = EndpointSet::from_configs(configs, &self.network);
        self.endpoints.swap(fresh.snapshot().as_ref().clone());
    }

    // ── Selection ──────────────────────────────────────────────────

    /// Resolve the endpoints to attempt, in order, for a request. The bool
    /// marks endpoints that need soft degradation (they miss some of the
    /// request's media capabilities).
    fn plan(&self, req: &ChatRequest) -> Result<(Vec<(Arc<Endpoint>, bool)>, CapabilitySet)> {
        let required = required_capabilities(&req.messages, !req.tools.is_empty(), req.thinking);

        let exact = self.endpoints.eligible(&required);
        if !exact.is_empty() {
            return Ok((exact.into_iter().map(|ep| (ep, false)).collect(), required));
        }

        // No endpoint satisfies everything. Keep the hard requirements
        // (text/tools) and degrade the rest: media blocks are stripped per
        // endpoint; an unsupported thinking request is simply not made.
        let mut core: CapabilitySet = required
            .iter()
            .filter(|c| !is_media_capability(*c))
            .collect();
        let mut eligible = self.endpoints.eligible(&core);
        if eligible.is_empty() && core.contains(Capability::Thinking) {
            let without_thinking: CapabilitySet = core
                .iter()
                .filter(|c| *c != Capability::Thinking)
                .collect();
            core = without_thinking;
            eligible = self.endpoints.eligible(&core);
        }
        if eligible.is_empty() {
            return Err(Error::AllEndpointsFailed);
        }

        let planned = eligible
            .into_iter()
            .map(|ep| {
                let degraded = !ep.capabilities().superset_of(&required);
                (ep, degraded)
            })
            .collect();
        Ok((planned, required))
    }

    /// Build the request actually sent to one endpoint: strip media blocks
    /// the endpoint cannot accept, drop thinking it cannot honour.
    fn request_for(&self, req: &ChatRequest, endpoint: &Endpoint, degraded: bool) -> ChatRequest {
        if !degraded {
            return req.clone();
        }
        let caps = endpoint.capabilities();
        let mut stripped = 0usize;
        let messages: Vec<Message> = req
            .messages
            .iter()
            .map(|m| degrade_message(m, caps, &mut stripped))
            .collect();
        if stripped > 0 {
            TraceEvent::SoftDegrade {
                endpoint: endpoint.name().to_string(),
                stripped_blocks: stripped,
            }
            .emit();
        }
        ChatRequest {
            messages,
            thinking: req.thinking && caps.contains(Capability::Thinking),
            ..req.clone()
        }
    }

    // ── Attempt loop ───────────────────────────────────────────────

    async fn run_attempts<T, F, Fut>(
        &self,
        req: &ChatRequest,
        cancel: &CancelToken,
        mut dispatch: F,
    ) -> Result<T>
    where
        F: FnMut(Arc<Endpoint>, ChatRequest) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let (planned, _required) = self.plan(req)?;
        let mut last_err: Option<Error> = None;
        let mut prev_endpoint: Option<String> = None;

        for (endpoint, degraded) in planned {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled(cancel.reason().unwrap_or_default()));
            }
            if let Some(prev) = &prev_endpoint {
                TraceEvent::LlmFallback {
                    from_endpoint: prev.clone(),
                    to_endpoint: endpoint.name().to_string(),
                    reason: last_err
                        .as_ref()
                        .map(|e| e.to_string())
                        .unwrap_or_else(|| "previous endpoint unavailable".into()),
                }
                .emit();
            }

            let eff_req = self.request_for(req, &endpoint, degraded);
            let mut rate_attempts: u32 = 0;
            let mut transient_retried = false;

            loop {
                if cancel.is_cancelled() {
                    return Err(Error::Cancelled(cancel.reason().unwrap_or_default()));
                }

                let started = Instant::now();
                let result =
                    cancellable(dispatch(endpoint.clone(), eff_req.clone()), cancel).await;
                let duration_ms = started.elapsed().as_millis() as u64;

                match result {
                    Ok(value) => {
                        tracing::debug!(
                            endpoint = %endpoint.name(),
                            duration_ms,
                            "LLM attempt succeeded"
                        );
                        return Ok(value);
                    }
                    Err(e @ Error::Cancelled(_)) => return Err(e),
                    Err(Error::Auth(msg)) => {
                        endpoint.mark_unhealthy(&msg);
                        last_err = Some(Error::Auth(msg));
                        break;
                    }
                    Err(Error::RateLimited(msg)) if rate_attempts < self.settings.retry_count => {
                        let delay = backoff_delay(self.settings.retry_delay_seconds, rate_attempts);
                        tracing::warn!(
                            endpoint = %endpoint.name(),
                            attempt = rate_attempts + 1,
                            delay_secs = delay.as_secs(),
                            "rate limited, backing off"
                        );
                        cancellable_sleep(delay, cancel).await?;
                        rate_attempts += 1;
                        last_err = Some(Error::RateLimited(msg));
                    }
                    Err(e @ (Error::Timeout(_) | Error::Http(_))) if !transient_retried => {
                        tracing::warn!(
                            endpoint = %endpoint.name(),
                            error = %e,
                            "transient failure, retrying once"
                        );
                        transient_retried = true;
                        last_err = Some(e);
                    }
                    Err(e) => {
                        tracing::warn!(
                            endpoint = %endpoint.name(),
                            error = %e,
                            "endpoint attempt failed"
                        );
                        last_err = Some(e);
                        break;
                    }
                }
            }

            if !self.settings.fallback_on_error {
                return Err(last_err.unwrap_or(Error::AllEndpointsFailed));
            }
            prev_endpoint = Some(endpoint.name().to_string());
        }

        match last_err {
            Some(e) => {
                tracing::error!(error = %e, "all endpoints exhausted");
                Err(Error::AllEndpointsFailed)
            }
            None => Err(Error::AllEndpointsFailed),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ChatClient implementation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait::async_trait]
impl ChatClient for LlmClient {
    async fn chat(&self, req: ChatRequest, cancel: &CancelToken) -> Result<ChatResponse> {
        self.run_attempts(&req, cancel, |endpoint, eff_req| async move {
            let started = Instant::now();
            let resp = endpoint.adapter().chat(&eff_req).await?;
            TraceEvent::LlmRequest {
                endpoint: endpoint.name().to_string(),
                model: resp.model.clone(),
                streaming: false,
                duration_ms: started.elapsed().as_millis() as u64,
                prompt_tokens: resp.usage.as_ref().map(|u| u.prompt_tokens),
                completion_tokens: resp.usage.as_ref().map(|u| u.completion_tokens),
            }
            .emit();
            Ok(resp)
        })
        .await
    }

    async fn chat_stream(
        &self,
        req: ChatRequest,
        cancel: &CancelToken,
    ) -> Result<BoxStream<'static, Result<ProviderEvent>>> {
        self.run_attempts(&req, cancel, |endpoint, eff_req| async move {
            let stream = endpoint.adapter().chat_stream(&eff_req).await?;
            TraceEvent::LlmRequest {
                endpoint: endpoint.name().to_string(),
                model: endpoint.config().model.clone(),
                streaming: true,
                duration_ms: 0,
                prompt_tokens: None,
                completion_tokens: None,
            }
            .emit();
            Ok(stream)
        })
        .await
    }

    fn rotate(&self) {
        self.endpoints.rotate();
    }

    fn context_window_tokens(&self) -> u32 {
        let text_only: CapabilitySet = [Capability::Text].into_iter().collect();
        self.endpoints
            .eligible(&text_only)
            .first()
            .map(|ep| ep.config().context_window_tokens)
            .unwrap_or(128_000)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn is_media_capability(cap: Capability) -> bool {
    matches!(
        cap,
        Capability::Vision | Capability::Video | Capability::Audio | Capability::Pdf
    )
}

fn omission_placeholder(block: &ContentBlock) -> &'static str {
    match block {
        ContentBlock::Image { .. } => "[image omitted: endpoint unsupported]",
        ContentBlock::Video { .. } => "[video omitted: endpoint unsupported]",
        ContentBlock::Audio { .. } => "[audio omitted: endpoint unsupported]",
        ContentBlock::Document { .. } => "[document omitted: endpoint unsupported]",
        _ => "[content omitted: endpoint unsupported]",
    }
}

/// Replace media blocks the endpoint cannot accept with text placeholders.
fn degrade_message(msg: &Message, caps: &CapabilitySet, stripped: &mut usize) -> Message {
    let blocks = match &msg.content {
        MessageContent::Text(_) => return msg.clone(),
        MessageContent::Blocks(blocks) => blocks,
    };

    let degraded: Vec<ContentBlock> = blocks
        .iter()
        .map(|b| match block_capability(b) {
            Some(cap) if !caps.contains(cap) => {
                *stripped += 1;
                ContentBlock::Text {
                    text: omission_placeholder(b).to_string(),
                }
            }
            _ => b.clone(),
        })
        .collect();

    Message {
        role: msg.role,
        content: MessageContent::Blocks(degraded),
    }
}

fn backoff_delay(base_secs: u64, attempt: u32) -> Duration {
    let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
    Duration::from_secs(base_secs.saturating_mul(factor).min(BACKOFF_CAP_SECS))
}

/// Await a future while polling the cancel token; dropping the future aborts
/// any in-flight HTTP request.
async fn cancellable<T>(
    fut: impl std::future::Future<Output = Result<T>>,
    cancel: &CancelToken,
) -> Result<T> {
    tokio::pin!(fut);
    let mut ticker = tokio::time::interval(Duration::from_millis(CANCEL_POLL_MS));
    loop {
        tokio::select! {
            result = &mut fut => return result,
            _ = ticker.tick() => {
                if cancel.is_cancelled() {
                    return Err(Error::Cancelled(cancel.reason().unwrap_or_default()));
                }
            }
        }
    }
}

/// Sleep that observes cancellation within one poll interval.
async fn cancellable_sleep(total: Duration, cancel: &CancelToken) -> Result<()> {
    let slice = Duration::from_millis(CANCEL_POLL_MS);
    let mut remaining = total;
    while remaining > Duration::ZERO {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled(cancel.reason().unwrap_or_default()));
        }
        let step = remaining.min(slice);
        tokio::time::sleep(step).await;
        remaining = remaining.saturating_sub(step);
    }
    Ok(())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
