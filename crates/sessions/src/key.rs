//! Session identity: `{channel}:{chat_id}:{user_id}`.
//!
//! Each component must be URL-safe so the key can travel through control
//! endpoints unescaped. Persisted filenames derive from the key by replacing
//! `:` with `__`.

use std::fmt;

use serde::{Deserialize, Serialize};

use valet_domain::error::{Error, Result};

/// A conversation identity: channel, chat, and user.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    pub channel: String,
    pub chat_id: String,
    pub user_id: String,
}

impl SessionKey {
    pub fn new(
        channel: impl Into<String>,
        chat_id: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Result<Self> {
        let key = Self {
            channel: channel.into(),
            chat_id: chat_id.into(),
            user_id: user_id.into(),
        };
        key.validate()?;
        Ok(key)
    }

    /// Parse a `{channel}:{chat_id}:{user_id}` string.
    pub fn parse(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 3 {
            return Err(Error::Config(format!(
                "invalid session key '{s}': expected channel:chat_id:user_id"
            )));
        }
        Self::new(parts[0], parts[1], parts[2])
    }

    fn validate(&self) -> Result<()> {
        for (label, component) in [
            ("channel", &self.channel),
            ("chat_id", &self.chat_id),
            ("user_id", &self.user_id),
        ] {
            if component.is_empty() {
                return Err(Error::Config(format!("session key {label} is empty")));
            }
            if !component.chars().all(is_url_safe) {
                return Err(Error::Config(format!(
                    "session key {label} '{component}' contains non-URL-safe characters"
                )));
            }
        }
        Ok(())
    }

    /// Filename stem for persisted artifacts: `:` becomes `__`.
    pub fn file_stem(&self) -> String {
        self.to_string().replace(':', "__")
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.channel, self.chat_id, self.user_id)
    }
}

fn is_url_safe(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_' | '~')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_round_trip() {
        let key = SessionKey::new("telegram", "chat42", "alice").unwrap();
        assert_eq!(key.to_string(), "telegram:chat42:alice");
        let parsed = SessionKey::parse("telegram:chat42:alice").unwrap();
        assert_eq!(parsed, key);
    }

    #[test]
    fn file_stem_replaces_colons() {
        let key = SessionKey::new("cli", "local", "me").unwrap();
        assert_eq!(key.file_stem(), "cli__local__me");
    }

    #[test]
    fn rejects_wrong_arity() {
        assert!(SessionKey::parse("only:two").is_err());
        assert!(SessionKey::parse("a:b:c:d").is_err());
    }

    #[test]
    fn rejects_unsafe_characters() {
        assert!(SessionKey::new("tele gram", "c", "u").is_err());
        assert!(SessionKey::new("t", "c/1", "u").is_err());
        assert!(SessionKey::new("t", "", "u").is_err());
    }

    #[test]
    fn accepts_url_safe_punctuation() {
        let key = SessionKey::new("feishu", "group-1.2", "user_7~x").unwrap();
        assert_eq!(key.chat_id, "group-1.2");
    }
}
