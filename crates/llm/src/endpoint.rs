//! Endpoint records and the hot-swappable endpoint list.
//!
//! An [`Endpoint`] pairs one configured (provider, model, base URL,
//! credentials) combination with its wire adapter and a runtime health flag.
//! [`EndpointSet`] holds the ordered list behind an atomic swap so config
//! reloads never disturb in-flight requests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use valet_domain::capability::CapabilitySet;
use valet_domain::config::{EndpointConfig, NetworkConfig, WireProtocol};
use valet_domain::error::Result;
use valet_domain::trace::TraceEvent;

use crate::anthropic::AnthropicAdapter;
use crate::gemini::GeminiAdapter;
use crate::openai::OpenAiAdapter;
use crate::traits::WireAdapter;
use crate::util::mask_secrets;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Endpoint
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A live endpoint: config plus adapter plus health state. Health is
/// writer-wins (a single atomic store), read lock-free at selection time.
pub struct Endpoint {
    config: EndpointConfig,
    capabilities: CapabilitySet,
    healthy: AtomicBool,
    adapter: Arc<dyn WireAdapter>,
}

impl Endpoint {
    /// Instantiate the adapter matching the configured wire protocol.
    pub fn from_config(config: EndpointConfig, network: &NetworkConfig) -> Result<Self> {
        let adapter: Arc<dyn WireAdapter> = match config.protocol {
            WireProtocol::Anthropic => Arc::new(AnthropicAdapter::from_config(&config, network)?),
            WireProtocol::Openai => Arc::new(OpenAiAdapter::from_config(&config, network)?),
            WireProtocol::Gemini => Arc::new(GeminiAdapter::from_config(&config, network)?),
        };
        let capabilities = config.capability_set();
        Ok(Self {
            config,
            capabilities,
            healthy: AtomicBool::new(true),
            adapter,
        })
    }

    /// Test-only constructor with an explicit adapter.
    pub fn with_adapter(config: EndpointConfig, adapter: Arc<dyn WireAdapter>) -> Self {
        let capabilities = config.capability_set();
        Self {
            config,
            capabilities,
            healthy: AtomicBool::new(true),
            adapter,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &EndpointConfig {
        &self.config
    }

    pub fn capabilities(&self) -> &CapabilitySet {
        &self.capabilities
    }

    pub fn adapter(&self) -> &Arc<dyn WireAdapter> {
        &self.adapter
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    /// Mark the endpoint dead for the rest of the process lifetime
    /// (auth/config failures only).
    pub fn mark_unhealthy(&self, reason: &str) {
        self.healthy.store(false, Ordering::Release);
        TraceEvent::EndpointUnhealthy {
            endpoint: self.config.name.clone(),
            reason: mask_secrets(reason),
        }
        .emit();
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// EndpointSet
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The ordered endpoint list plus a rotation offset.
///
/// The list itself is swapped atomically on hot reload; readers take an
/// `Arc` snapshot, so in-flight requests keep using the list they started
/// with. The rotation offset advances when the engine reports repeated
/// failures, shifting which eligible endpoint is tried first.
pub struct EndpointSet {
    endpoints: RwLock<Arc<Vec<Arc<Endpoint>>>>,
    rotation: AtomicUsize,
}

impl EndpointSet {
    /// Build from configs, skipping endpoints that fail to initialize
    /// (errors are logged with secrets masked).
    pub fn from_configs(configs: &[EndpointConfig], network: &NetworkConfig) -> Self {
        let mut endpoints = Vec::new();
        for cfg in configs {
            if !cfg.enabled {
                continue;
            }
            match Endpoint::from_config(cfg.clone(), network) {
                Ok(ep) => {
                    tracing::info!(
                        endpoint = %cfg.name,
                        protocol = ?cfg.protocol,
                        model = %cfg.model,
                        "registered LLM endpoint"
                    );
                    endpoints.push(Arc::new(ep));
                }
                Err(e) => {
                    tracing::warn!(
                        endpoint = %cfg.name,
                        error = %mask_secrets(&e.to_string()),
                        "failed to initialize LLM endpoint, skipping"
                    );
                }
            }
        }
        Self::from_endpoints(endpoints)
    }

    pub fn from_endpoints(endpoints: Vec<Arc<Endpoint>>) -> Self {
        Self {
            endpoints: RwLock::new(Arc::new(endpoints)),
            rotation: AtomicUsize::new(0),
        }
    }

    /// Atomically replace the endpoint list. In-flight requests finish on
    /// the snapshot they hold.
    pub fn swap(&self, endpoints: Vec<Arc<Endpoint>>) {
        *self.endpoints.write() = Arc::new(endpoints);
        self.rotation.store(0, Ordering::Release);
    }

    /// Snapshot of the current list.
    pub fn snapshot(&self) -> Arc<Vec<Arc<Endpoint>>> {
        self.endpoints.read().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.read().is_empty()
    }

    pub fn len(&self) -> usize {
        self.endpoints.read().len()
    }

    /// Advance the rotation offset so the next eligible endpoint becomes
    /// preferred.
    pub fn rotate(&self) {
        self.rotation.fetch_add(1, Ordering::AcqRel);
    }

    /// Endpoints eligible for `required`: healthy ∧ capability superset,
    /// sorted by priority ascending then name, then rotated left by the
    /// rotation offset.
    pub fn eligible(&self, required: &CapabilitySet) -> Vec<Arc<Endpoint>> {
        let snapshot = self.snapshot();
        let mut eligible: Vec<Arc<Endpoint>> = snapshot
            .iter()
            .filter(|ep| ep.is_healthy() && ep.capabilities().superset_of(required))
            .cloned()
            .collect();
        eligible.sort_by(|a, b| {
            a.config()
                .priority
                .cmp(&b.config().priority)
                .then_with(|| a.name().cmp(b.name()))
        });

        let offset = self.rotation.load(Ordering::Acquire);
        if !eligible.is_empty() && offset > 0 {
            let len = eligible.len();
            eligible.rotate_left(offset % len);
        }
        eligible
    }

    /// Healthy endpoints in priority order, ignoring capabilities. Used for
    /// the soft-degrade path.
    pub fn healthy(&self) -> Vec<Arc<Endpoint>> {
        self.eligible(&CapabilitySet::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use valet_domain::capability::Capability;
    use valet_domain::error::Result as DomainResult;
    use valet_domain::stream::{BoxStream, ProviderEvent};

    use crate::traits::{ChatRequest, ChatResponse};

    struct NullAdapter;

    #[async_trait::async_trait]
    impl WireAdapter for NullAdapter {
        async fn chat(&self, _req: &ChatRequest) -> DomainResult<ChatResponse> {
            unimplemented!("selection tests never dispatch")
        }
        async fn chat_stream(
            &self,
            _req: &ChatRequest,
        ) -> DomainResult<BoxStream<'static, DomainResult<ProviderEvent>>> {
            unimplemented!("selection tests never dispatch")
        }
    }

    fn endpoint(name: &str, priority: u32, caps: &[Capability]) -> Arc<Endpoint> {
        let config = EndpointConfig {
            name: name.into(),
            provider: String::new(),
            protocol: WireProtocol::Openai,
            base_url: "http://localhost".into(),
            auth: Default::default(),
            model: "test".into(),
            priority,
            timeout_secs: 5,
            capabilities: caps.to_vec(),
            context_window_tokens: 8_000,
            enabled: true,
        };
        Arc::new(Endpoint::with_adapter(config, Arc::new(NullAdapter)))
    }

    fn req(caps: &[Capability]) -> CapabilitySet {
        caps.iter().copied().collect()
    }

    #[test]
    fn eligible_filters_by_capability() {
        let set = EndpointSet::from_endpoints(vec![
            endpoint("text-only", 1, &[Capability::Text]),
            endpoint("vision", 2, &[Capability::Text, Capability::Vision]),
        ]);
        let chosen = set.eligible(&req(&[Capability::Text, Capability::Vision]));
        assert_eq!(chosen.len(), 1);
        assert_eq!(chosen[0].name(), "vision");
    }

    #[test]
    fn eligible_sorts_by_priority_then_name() {
        let set = EndpointSet::from_endpoints(vec![
            endpoint("bravo", 5, &[Capability::Text]),
            endpoint("alpha", 5, &[Capability::Text]),
            endpoint("zulu", 1, &[Capability::Text]),
        ]);
        let chosen = set.eligible(&req(&[Capability::Text]));
        let names: Vec<_> = chosen.iter().map(|e| e.name().to_string()).collect();
        assert_eq!(names, vec!["zulu", "alpha", "bravo"]);
    }

    #[test]
    fn unhealthy_endpoints_excluded() {
        let set = EndpointSet::from_endpoints(vec![
            endpoint("a", 1, &[Capability::Text]),
            endpoint("b", 2, &[Capability::Text]),
        ]);
        set.snapshot()[0].mark_unhealthy("auth failed");
        let chosen = set.eligible(&req(&[Capability::Text]));
        assert_eq!(chosen.len(), 1);
        assert_eq!(chosen[0].name(), "b");
    }

    #[test]
    fn rotation_shifts_preference() {
        let set = EndpointSet::from_endpoints(vec![
            endpoint("a", 1, &[Capability::Text]),
            endpoint("b", 2, &[Capability::Text]),
        ]);
        assert_eq!(set.eligible(&req(&[Capability::Text]))[0].name(), "a");
        set.rotate();
        assert_eq!(set.eligible(&req(&[Capability::Text]))[0].name(), "b");
        set.rotate();
        assert_eq!(set.eligible(&req(&[Capability::Text]))[0].name(), "a");
    }

    #[test]
    fn swap_replaces_list_and_resets_rotation() {
        let set = EndpointSet::from_endpoints(vec![endpoint("old", 1, &[Capability::Text])]);
        set.rotate();
        set.swap(vec![endpoint("new", 1, &[Capability::Text])]);
        let chosen = set.eligible(&req(&[Capability::Text]));
        assert_eq!(chosen[0].name(), "new");
    }

    #[test]
    fn snapshot_survives_swap() {
        let set = EndpointSet::from_endpoints(vec![endpoint("old", 1, &[Capability::Text])]);
        let snapshot = set.snapshot();
        set.swap(vec![endpoint("new", 1, &[Capability::Text])]);
        // The pre-swap snapshot still sees the old endpoint.
        assert_eq!(snapshot[0].name(), "old");
        assert_eq!(set.snapshot()[0].name(), "new");
    }
}
