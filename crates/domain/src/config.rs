use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::capability::{Capability, CapabilitySet};
use crate::error::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Root configuration, loaded from a JSON file. Every section is optional;
/// absent sections fall back to defaults so old config files keep parsing.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Primary chat endpoints, in declaration order.
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,
    /// Endpoints reserved for internal compilation work (summaries,
    /// compression). Falls back to `endpoints` when empty.
    #[serde(default)]
    pub compiler_endpoints: Vec<EndpointConfig>,
    /// Speech-to-text endpoints. Parsed for config compatibility; the agent
    /// core itself never dispatches to them.
    #[serde(default)]
    pub stt_endpoints: Vec<EndpointConfig>,
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub prompt: PromptBudgetConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub workspace: WorkspaceConfig,
}

impl Config {
    /// Load the configuration from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(Error::Io)?;
        let config: Config = serde_json::from_str(&raw)?;
        Ok(config)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Endpoints
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Wire protocol a configured endpoint speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireProtocol {
    Anthropic,
    Openai,
    Gemini,
}

/// One configured LLM endpoint: a concrete (provider, model, base URL,
/// credentials) combination. Health is runtime state, not config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub name: String,
    /// Provider slug for logging and diagnostics (e.g. "anthropic", "kimi").
    #[serde(default)]
    pub provider: String,
    pub protocol: WireProtocol,
    pub base_url: String,
    #[serde(default)]
    pub auth: AuthConfig,
    pub model: String,
    /// Lower = preferred. Ties break on name.
    #[serde(default = "d_priority")]
    pub priority: u32,
    #[serde(default = "d_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "d_capabilities")]
    pub capabilities: Vec<Capability>,
    #[serde(default = "d_context_window")]
    pub context_window_tokens: u32,
    #[serde(default = "d_true")]
    pub enabled: bool,
}

impl EndpointConfig {
    pub fn capability_set(&self) -> CapabilitySet {
        self.capabilities.iter().copied().collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AuthConfig {
    /// Direct key (for config-only setups; prefer env or keychain).
    #[serde(default)]
    pub key: Option<String>,
    /// Env var containing the key.
    #[serde(default)]
    pub env: Option<String>,
    /// OS keychain service name (paired with `account`).
    #[serde(default)]
    pub service: Option<String>,
    /// OS keychain account name.
    #[serde(default)]
    pub account: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Settings & network
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Same-endpoint retries on rate limits.
    #[serde(default = "d_retry_count")]
    pub retry_count: u32,
    /// Base delay between retries (doubles per attempt, capped).
    #[serde(default = "d_retry_delay")]
    pub retry_delay_seconds: u64,
    /// Fall through to the next endpoint on failure.
    #[serde(default = "d_true")]
    pub fallback_on_error: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            retry_count: d_retry_count(),
            retry_delay_seconds: d_retry_delay(),
            fallback_on_error: true,
        }
    }
}

/// Global transport knobs, applied uniformly to every HTTP client.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NetworkConfig {
    #[serde(default)]
    pub ipv4_only: bool,
    /// HTTP(S) proxy URL.
    #[serde(default)]
    pub proxy: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Engine
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Hard ceiling on LLM iterations per task.
    #[serde(default = "d_max_iterations")]
    pub max_iterations: u32,
    /// Consecutive empty/unusable LLM replies before the task fails.
    #[serde(default = "d_3u32")]
    pub empty_response_limit: u32,
    /// Sliding window of recent tool-call signatures.
    #[serde(default = "d_10")]
    pub loop_window: usize,
    /// Identical signatures within the window before a discouraging note.
    #[serde(default = "d_3usize")]
    pub loop_warn_threshold: usize,
    /// Identical signatures within the window before the task fails.
    #[serde(default = "d_5")]
    pub loop_fail_threshold: usize,
    /// Request thinking/reasoning content when the endpoint supports it.
    #[serde(default)]
    pub thinking: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_iterations: d_max_iterations(),
            empty_response_limit: d_3u32(),
            loop_window: d_10(),
            loop_warn_threshold: d_3usize(),
            loop_fail_threshold: d_5(),
            thinking: false,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Context manager
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Fraction of the endpoint context window held back as headroom.
    #[serde(default = "d_margin")]
    pub safety_margin_ratio: f64,
    /// Most recent message groups always kept verbatim.
    #[serde(default = "d_4")]
    pub keep_recent_groups: usize,
    /// Max tokens requested from the summarizer per compression pass.
    #[serde(default = "d_2000u32")]
    pub summary_max_tokens: u32,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            safety_margin_ratio: d_margin(),
            keep_recent_groups: d_4(),
            summary_max_tokens: d_2000u32(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Prompt budget
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Per-section token budgets for the assembled system prompt. The budget is
/// observational for now: exceeding a section's share logs a warning and
/// flags the report, but the content is still emitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptBudgetConfig {
    #[serde(default = "d_16000")]
    pub total_tokens: u32,
    #[serde(default = "d_1600")]
    pub identity_tokens: u32,
    #[serde(default = "d_200")]
    pub behaviours_tokens: u32,
    #[serde(default = "d_100")]
    pub tooling_tokens: u32,
    #[serde(default = "d_12000")]
    pub catalog_tokens: u32,
    #[serde(default = "d_300")]
    pub user_tokens: u32,
    #[serde(default = "d_1500")]
    pub memory_tokens: u32,
    #[serde(default = "d_200")]
    pub plan_tokens: u32,
    #[serde(default = "d_100")]
    pub persona_tokens: u32,
}

impl Default for PromptBudgetConfig {
    fn default() -> Self {
        Self {
            total_tokens: d_16000(),
            identity_tokens: d_1600(),
            behaviours_tokens: d_200(),
            tooling_tokens: d_100(),
            catalog_tokens: d_12000(),
            user_tokens: d_300(),
            memory_tokens: d_1500(),
            plan_tokens: d_200(),
            persona_tokens: d_100(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tools
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Concurrent tool executions within one batch. 1 = fully serial.
    #[serde(default = "d_1")]
    pub max_parallel: usize,
    /// Payload guard; longer results are truncated with a stable marker.
    #[serde(default = "d_guard_bytes")]
    pub result_guard_bytes: usize,
    /// Hard timeout for shell executions.
    #[serde(default = "d_60")]
    pub exec_timeout_secs: u64,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            max_parallel: d_1(),
            result_guard_bytes: d_guard_bytes(),
            exec_timeout_secs: d_60(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Memory
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Token-set overlap at or above which two facts are duplicates.
    #[serde(default = "d_07")]
    pub dedupe_threshold: f64,
    /// Retrieval: max injected entries.
    #[serde(default = "d_5usize")]
    pub max_items: usize,
    /// Retrieval: minimum importance for injected entries.
    #[serde(default = "d_05")]
    pub min_importance: f64,
    /// Retrieval: token budget for the injected memory context.
    #[serde(default = "d_400")]
    pub max_tokens: u32,
    /// Core memory file char cap (tail-first truncation).
    #[serde(default = "d_800")]
    pub core_file_max_chars: usize,
    /// Transient entries older than this are pruned.
    #[serde(default = "d_7")]
    pub transient_max_age_days: i64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            dedupe_threshold: d_07(),
            max_items: d_5usize(),
            min_importance: d_05(),
            max_tokens: d_400(),
            core_file_max_chars: d_800(),
            transient_max_age_days: d_7(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scheduler
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "d_30")]
    pub tick_secs: u64,
    #[serde(default = "d_true")]
    pub enabled: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_secs: d_30(),
            enabled: true,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Workspace paths
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    /// Identity/persona files (SOUL.md, AGENT.md, USER.md, ...).
    #[serde(default = "d_identity_dir")]
    pub identity_dir: PathBuf,
    /// Sessions, transcripts, memory, schedule store.
    #[serde(default = "d_state_dir")]
    pub state_dir: PathBuf,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            identity_dir: d_identity_dir(),
            state_dir: d_state_dir(),
        }
    }
}

// ── serde default helpers ──────────────────────────────────────────

fn d_priority() -> u32 {
    100
}
fn d_timeout_secs() -> u64 {
    120
}
fn d_capabilities() -> Vec<Capability> {
    vec![Capability::Text]
}
fn d_context_window() -> u32 {
    128_000
}
fn d_true() -> bool {
    true
}
fn d_retry_count() -> u32 {
    3
}
fn d_retry_delay() -> u64 {
    2
}
fn d_max_iterations() -> u32 {
    100
}
fn d_3u32() -> u32 {
    3
}
fn d_3usize() -> usize {
    3
}
fn d_5() -> usize {
    5
}
fn d_5usize() -> usize {
    5
}
fn d_10() -> usize {
    10
}
fn d_margin() -> f64 {
    0.15
}
fn d_4() -> usize {
    4
}
fn d_2000u32() -> u32 {
    2_000
}
fn d_16000() -> u32 {
    16_000
}
fn d_1600() -> u32 {
    1_600
}
fn d_12000() -> u32 {
    12_000
}
fn d_300() -> u32 {
    300
}
fn d_1500() -> u32 {
    1_500
}
fn d_200() -> u32 {
    200
}
fn d_100() -> u32 {
    100
}
fn d_1() -> usize {
    1
}
fn d_guard_bytes() -> usize {
    200 * 1024
}
fn d_60() -> u64 {
    60
}
fn d_07() -> f64 {
    0.7
}
fn d_05() -> f64 {
    0.5
}
fn d_400() -> u32 {
    400
}
fn d_800() -> usize {
    800
}
fn d_7() -> i64 {
    7
}
fn d_30() -> u64 {
    30
}
fn d_identity_dir() -> PathBuf {
    PathBuf::from("identity")
}
fn d_state_dir() -> PathBuf {
    PathBuf::from("state")
}
