use valet_domain::capability::Capability;
use valet_domain::config::{Config, WireProtocol};

#[test]
fn empty_object_parses_with_defaults() {
    let config: Config = serde_json::from_str("{}").unwrap();
    assert!(config.endpoints.is_empty());
    assert!(config.compiler_endpoints.is_empty());
    assert!(config.stt_endpoints.is_empty());
    assert_eq!(config.settings.retry_count, 3);
    assert_eq!(config.settings.retry_delay_seconds, 2);
    assert!(config.settings.fallback_on_error);
}

#[test]
fn engine_defaults() {
    let config = Config::default();
    assert_eq!(config.engine.max_iterations, 100);
    assert_eq!(config.engine.empty_response_limit, 3);
    assert_eq!(config.engine.loop_window, 10);
}

#[test]
fn prompt_budget_defaults_match_contract() {
    let config = Config::default();
    assert_eq!(config.prompt.total_tokens, 16_000);
    assert_eq!(config.prompt.identity_tokens, 1_600);
    assert_eq!(config.prompt.catalog_tokens, 12_000);
    assert_eq!(config.prompt.user_tokens, 300);
    assert_eq!(config.prompt.memory_tokens, 1_500);
}

#[test]
fn tools_defaults() {
    let config = Config::default();
    assert_eq!(config.tools.max_parallel, 1);
    assert_eq!(config.tools.result_guard_bytes, 200 * 1024);
}

#[test]
fn endpoint_minimal_json() {
    let json = r#"{
        "endpoints": [
            {
                "name": "primary",
                "protocol": "anthropic",
                "base_url": "https://api.anthropic.com",
                "model": "claude-sonnet-4-20250514"
            }
        ]
    }"#;
    let config: Config = serde_json::from_str(json).unwrap();
    let ep = &config.endpoints[0];
    assert_eq!(ep.protocol, WireProtocol::Anthropic);
    assert_eq!(ep.priority, 100);
    assert_eq!(ep.timeout_secs, 120);
    assert!(ep.enabled);
    assert_eq!(ep.capabilities, vec![Capability::Text]);
}

#[test]
fn endpoint_full_json() {
    let json = r#"{
        "endpoints": [
            {
                "name": "vision",
                "provider": "openai",
                "protocol": "openai",
                "base_url": "https://api.openai.com/v1",
                "auth": { "env": "OPENAI_API_KEY" },
                "model": "gpt-4o",
                "priority": 10,
                "timeout_secs": 90,
                "capabilities": ["text", "vision", "tools"],
                "context_window_tokens": 128000
            }
        ],
        "settings": { "retry_count": 5, "retry_delay_seconds": 1, "fallback_on_error": false }
    }"#;
    let config: Config = serde_json::from_str(json).unwrap();
    let ep = &config.endpoints[0];
    assert_eq!(ep.priority, 10);
    let caps = ep.capability_set();
    assert!(caps.contains(Capability::Vision));
    assert!(caps.contains(Capability::Tools));
    assert!(!caps.contains(Capability::Video));
    assert_eq!(config.settings.retry_count, 5);
    assert!(!config.settings.fallback_on_error);
}

#[test]
fn unknown_sections_are_rejected_gracefully() {
    // Extra unknown top-level keys must not break parsing (forward compat).
    let json = r#"{ "endpoints": [], "future_section": { "x": 1 } }"#;
    let config: Config = serde_json::from_str(json).unwrap();
    assert!(config.endpoints.is_empty());
}
