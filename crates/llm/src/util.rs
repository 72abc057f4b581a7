//! Shared utility functions for wire adapters and the client.

use valet_domain::config::{AuthConfig, NetworkConfig};
use valet_domain::error::{Error, Result};

/// Convert a [`reqwest::Error`] into the domain [`Error`] type.
///
/// Timeout errors map to [`Error::Timeout`]; everything else maps to
/// [`Error::Http`].
pub(crate) fn from_reqwest(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout(e.to_string())
    } else {
        Error::Http(e.to_string())
    }
}

/// Map a non-success HTTP status to the error class the retry policy keys on.
///
/// 401/403 → auth (endpoint marked dead for the process lifetime),
/// 408/429 → rate-limited (bounded backoff on the same endpoint),
/// 5xx/529 → transient (one retry, then fall through),
/// anything else → permanent endpoint error (fall through immediately).
pub(crate) fn classify_status(endpoint: &str, status: u16, body: &str) -> Error {
    let message = format!("HTTP {} - {}", status, truncate_body(body));
    match status {
        401 | 403 => Error::Auth(format!("{endpoint}: {message}")),
        408 | 429 => Error::RateLimited(format!("{endpoint}: {message}")),
        500..=599 => Error::Http(format!("{endpoint}: {message}")),
        _ => Error::Endpoint {
            endpoint: endpoint.to_string(),
            message,
        },
    }
}

fn truncate_body(body: &str) -> &str {
    let max = 500;
    if body.len() <= max {
        body
    } else {
        let mut end = max;
        while !body.is_char_boundary(end) && end > 0 {
            end -= 1;
        }
        &body[..end]
    }
}

/// Build the HTTP client for one endpoint, applying the global network
/// settings uniformly (IPv4-only binding, proxy) plus the endpoint timeout.
pub(crate) fn build_http_client(
    network: &NetworkConfig,
    timeout_secs: u64,
) -> Result<reqwest::Client> {
    let mut builder =
        reqwest::Client::builder().timeout(std::time::Duration::from_secs(timeout_secs));

    if network.ipv4_only {
        builder = builder.local_address(std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED));
    }
    if let Some(proxy_url) = &network.proxy {
        let proxy = reqwest::Proxy::all(proxy_url)
            .map_err(|e| Error::Config(format!("invalid proxy '{proxy_url}': {e}")))?;
        builder = builder.proxy(proxy);
    }

    builder.build().map_err(from_reqwest)
}

/// Resolve the API key from an [`AuthConfig`].
///
/// Precedence:
/// 1. `key` field (plaintext — warn)
/// 2. `service` + `account` → OS keychain via `keyring`
/// 3. `env` field (reads environment variable)
/// 4. Fallback for keychain mode: env var `{SERVICE}_{ACCOUNT}` uppercased
/// 5. Error
pub fn resolve_api_key(auth: &AuthConfig) -> Result<String> {
    if let Some(ref key) = auth.key {
        tracing::warn!(
            "API key loaded from plaintext config field 'key' — \
             prefer 'env' or keychain 'service'+'account' instead"
        );
        return Ok(key.clone());
    }

    if let (Some(ref service), Some(ref account)) = (&auth.service, &auth.account) {
        match resolve_from_keychain(service, account) {
            Ok(secret) => return Ok(secret),
            Err(e) => {
                tracing::warn!(
                    service = %service,
                    account = %account,
                    error = %e,
                    "keychain lookup failed, falling through to env"
                );
            }
        }
    }

    if let Some(ref env_var) = auth.env {
        return std::env::var(env_var).map_err(|_| {
            Error::Auth(format!(
                "environment variable '{}' not set or not valid UTF-8",
                env_var
            ))
        });
    }

    if let (Some(ref service), Some(ref account)) = (&auth.service, &auth.account) {
        let fallback_var = keychain_fallback_env_name(service, account);
        if let Ok(val) = std::env::var(&fallback_var) {
            tracing::info!(
                env_var = %fallback_var,
                "API key resolved from keychain headless fallback env var"
            );
            return Ok(val);
        }
    }

    Err(Error::Auth(
        "no API key configured: set 'key', 'env', or keychain \
         'service'+'account' in the endpoint auth section"
            .into(),
    ))
}

/// Try to read a secret from the OS keychain.
pub fn resolve_from_keychain(service: &str, account: &str) -> Result<String> {
    let entry = keyring::Entry::new(service, account)
        .map_err(|e| Error::Auth(format!("keyring entry creation failed: {e}")))?;
    entry
        .get_password()
        .map_err(|e| Error::Auth(format!("keyring get_password failed: {e}")))
}

/// Build the headless fallback env var name for a keychain service/account.
pub fn keychain_fallback_env_name(service: &str, account: &str) -> String {
    format!(
        "{}_{}",
        service.to_uppercase().replace('-', "_"),
        account.to_uppercase().replace('-', "_"),
    )
}

/// Mask substrings that look like API keys or bearer tokens in an error
/// message, so raw secrets never leak into logs or diagnostics.
pub fn mask_secrets(msg: &str) -> String {
    let mut result = msg.to_string();
    for word in msg.split(|c: char| c.is_whitespace() || c == '\'' || c == '"' || c == ',') {
        let trimmed = word.trim();
        if trimmed.len() >= 20
            && trimmed
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            let masked = format!("{}...{}", &trimmed[..4], &trimmed[trimmed.len() - 4..]);
            result = result.replace(trimmed, &masked);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use valet_domain::error::Error;

    #[test]
    fn fallback_env_name_basic() {
        assert_eq!(
            keychain_fallback_env_name("valet", "kimi-api-key"),
            "VALET_KIMI_API_KEY"
        );
    }

    #[test]
    fn resolve_api_key_plaintext() {
        let auth = AuthConfig {
            key: Some("sk-test-123".into()),
            ..Default::default()
        };
        assert_eq!(resolve_api_key(&auth).unwrap(), "sk-test-123");
    }

    #[test]
    fn resolve_api_key_env_var() {
        let var_name = "VALET_TEST_RESOLVE_ENV_KEY_1234";
        std::env::set_var(var_name, "env-secret-value");
        let auth = AuthConfig {
            env: Some(var_name.into()),
            ..Default::default()
        };
        assert_eq!(resolve_api_key(&auth).unwrap(), "env-secret-value");
        std::env::remove_var(var_name);
    }

    #[test]
    fn resolve_api_key_env_var_missing() {
        let auth = AuthConfig {
            env: Some("VALET_TEST_NONEXISTENT_VAR_8888".into()),
            ..Default::default()
        };
        let err = resolve_api_key(&auth).unwrap_err();
        assert!(err.to_string().contains("VALET_TEST_NONEXISTENT_VAR_8888"));
    }

    #[test]
    fn resolve_api_key_no_config() {
        let auth = AuthConfig::default();
        let err = resolve_api_key(&auth).unwrap_err();
        assert!(err.to_string().contains("no API key configured"));
    }

    #[test]
    fn mask_secrets_masks_long_tokens() {
        let masked = mask_secrets("invalid key 'sk_abcdefghijklmnopqrstuvwx' rejected");
        assert!(!masked.contains("sk_abcdefghijklmnopqrstuvwx"));
        assert!(masked.contains("sk_a...uvwx"));
    }

    #[test]
    fn mask_secrets_leaves_short_words() {
        let msg = "connection refused to host";
        assert_eq!(mask_secrets(msg), msg);
    }

    #[test]
    fn classify_status_auth() {
        assert!(matches!(classify_status("ep", 401, "denied"), Error::Auth(_)));
        assert!(matches!(classify_status("ep", 403, "denied"), Error::Auth(_)));
    }

    #[test]
    fn classify_status_rate_limit() {
        assert!(matches!(
            classify_status("ep", 429, "slow down"),
            Error::RateLimited(_)
        ));
    }

    #[test]
    fn classify_status_transient() {
        assert!(matches!(classify_status("ep", 500, "oops"), Error::Http(_)));
        assert!(matches!(classify_status("ep", 529, "busy"), Error::Http(_)));
    }

    #[test]
    fn classify_status_permanent() {
        assert!(matches!(
            classify_status("ep", 400, "bad request"),
            Error::Endpoint { .. }
        ));
    }
}
