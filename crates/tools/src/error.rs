//! Structured tool errors.
//!
//! Handlers return a typed error object; the executor serializes it into the
//! result payload so the model can reason about the failure and pick an
//! alternative.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorType {
    Transient,
    Permanent,
    Permission,
    Timeout,
    Validation,
    ResourceNotFound,
    RateLimit,
    Dependency,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolError {
    pub error_type: ToolErrorType,
    pub tool_name: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_suggestion: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub alternative_tools: Vec<String>,
}

impl ToolError {
    pub fn new(
        error_type: ToolErrorType,
        tool_name: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            error_type,
            tool_name: tool_name.into(),
            message: message.into(),
            retry_suggestion: None,
            alternative_tools: Vec::new(),
        }
    }

    pub fn with_retry_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.retry_suggestion = Some(suggestion.into());
        self
    }

    pub fn with_alternatives(mut self, alternatives: Vec<String>) -> Self {
        self.alternative_tools = alternatives;
        self
    }

    pub fn validation(tool_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ToolErrorType::Validation, tool_name, message)
    }

    pub fn not_found(tool_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ToolErrorType::ResourceNotFound, tool_name, message)
    }

    pub fn timeout(tool_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ToolErrorType::Timeout, tool_name, message)
    }

    /// Serialize into the string payload returned to the model.
    pub fn to_payload(&self) -> String {
        serde_json::to_string(self)
            .unwrap_or_else(|_| format!("{{\"error\": \"{}\"}}", self.message))
    }
}

impl std::fmt::Display for ToolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.tool_name, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_is_json_the_model_can_parse() {
        let err = ToolError::new(ToolErrorType::Permission, "write_file", "read-only workspace")
            .with_retry_suggestion("ask the user to unlock the workspace")
            .with_alternatives(vec!["read_file".into()]);
        let payload = err.to_payload();
        let v: serde_json::Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(v["error_type"], "permission");
        assert_eq!(v["tool_name"], "write_file");
        assert_eq!(v["alternative_tools"][0], "read_file");
    }

    #[test]
    fn empty_fields_omitted() {
        let err = ToolError::validation("exec", "missing command");
        let payload = err.to_payload();
        assert!(!payload.contains("retry_suggestion"));
        assert!(!payload.contains("alternative_tools"));
    }
}
