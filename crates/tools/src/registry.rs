//! The tool registry.
//!
//! Maps tool names to async handlers. Tools partition into a small
//! **direct set** (always advertised to the model with full schemas) and a
//! **catalog** (described textually in the prompt; invoked through the
//! generic `call_tool` mechanism, with `tool_help` surfacing detailed docs
//! on demand). The handler map is immutable after registration; reload is
//! an atomic swap.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;

use valet_domain::cancel::CancelToken;
use valet_domain::message::ToolDefinition;

use crate::error::ToolError;

/// Names of the two registry-level tools that front the catalog.
pub const CALL_TOOL: &str = "call_tool";
pub const TOOL_HELP: &str = "tool_help";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Handler trait & spec
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One tool implementation: `(args map, cancel token) → payload | error`.
#[async_trait::async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, args: Value, cancel: &CancelToken) -> Result<String, ToolError>;
}

/// Registry metadata for one tool.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON Schema for the tool's arguments.
    pub parameters: Value,
    pub category: String,
    /// Longer documentation surfaced through `tool_help`.
    pub detailed_help: Option<String>,
    /// Direct tools are always advertised with full schemas; the rest live
    /// in the catalog.
    pub direct: bool,
    /// Tools not marked parallel-safe serialize even when the batch
    /// parallelism ceiling is raised.
    pub parallel_safe: bool,
}

impl ToolSpec {
    pub fn new(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            category: "general".into(),
            detailed_help: None,
            direct: true,
            parallel_safe: false,
        }
    }

    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn detailed_help(mut self, help: impl Into<String>) -> Self {
        self.detailed_help = Some(help.into());
        self
    }

    pub fn catalog(mut self) -> Self {
        self.direct = false;
        self
    }

    pub fn parallel_safe(mut self) -> Self {
        self.parallel_safe = true;
        self
    }

    pub fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: self.parameters.clone(),
        }
    }
}

#[derive(Clone)]
pub struct RegisteredTool {
    pub spec: ToolSpec,
    pub handler: Arc<dyn ToolHandler>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

type ToolMap = Arc<HashMap<String, RegisteredTool>>;

pub struct ToolRegistry {
    tools: RwLock<ToolMap>,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: RwLock::new(Arc::new(HashMap::new())),
        }
    }

    /// Register a tool. Intended for startup; each call swaps the map
    /// atomically so concurrent readers always see a consistent snapshot.
    pub fn register(&self, spec: ToolSpec, handler: Arc<dyn ToolHandler>) {
        let mut guard = self.tools.write();
        let mut next: HashMap<String, RegisteredTool> = guard.as_ref().clone();
        let name = spec.name.clone();
        if next
            .insert(name.clone(), RegisteredTool { spec, handler })
            .is_some()
        {
            tracing::warn!(tool = %name, "tool re-registered, previous handler replaced");
        }
        *guard = Arc::new(next);
    }

    /// Atomic full-map replacement (hot reload).
    pub fn swap(&self, tools: Vec<(ToolSpec, Arc<dyn ToolHandler>)>) {
        let map: HashMap<String, RegisteredTool> = tools
            .into_iter()
            .map(|(spec, handler)| {
                (spec.name.clone(), RegisteredTool { spec, handler })
            })
            .collect();
        *self.tools.write() = Arc::new(map);
    }

    pub fn get(&self, name: &str) -> Option<RegisteredTool> {
        self.tools.read().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.tools.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.read().is_empty()
    }

    /// Definitions advertised to the model: every direct tool, plus
    /// `call_tool` / `tool_help` when a catalog exists.
    pub fn direct_definitions(&self) -> Vec<ToolDefinition> {
        let map = self.tools.read().clone();
        let mut defs: Vec<ToolDefinition> = map
            .values()
            .filter(|t| t.spec.direct)
            .map(|t| t.spec.definition())
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));

        let has_catalog = map.values().any(|t| !t.spec.direct);
        if has_catalog {
            defs.push(ToolDefinition {
                name: CALL_TOOL.into(),
                description: "Invoke a catalog tool by name. See the tool catalog in the \
                              system prompt for available names."
                    .into(),
                parameters: serde_json::json!({
                    "type": "object",
                    "properties": {
                        "name": { "type": "string", "description": "Catalog tool name" },
                        "arguments": { "type": "object", "description": "Arguments for the tool" }
                    },
                    "required": ["name"]
                }),
            });
            defs.push(ToolDefinition {
                name: TOOL_HELP.into(),
                description: "Get detailed usage documentation for a tool.".into(),
                parameters: serde_json::json!({
                    "type": "object",
                    "properties": {
                        "name": { "type": "string", "description": "Tool name" }
                    },
                    "required": ["name"]
                }),
            });
        }
        defs
    }

    /// One-line-per-tool synopsis of the catalog, grouped by category, for
    /// the system prompt.
    pub fn catalog_synopsis(&self) -> String {
        let map = self.tools.read().clone();
        let mut by_category: std::collections::BTreeMap<String, Vec<&RegisteredTool>> =
            std::collections::BTreeMap::new();
        for tool in map.values().filter(|t| !t.spec.direct) {
            by_category
                .entry(tool.spec.category.clone())
                .or_default()
                .push(tool);
        }
        if by_category.is_empty() {
            return String::new();
        }

        let mut out = String::new();
        for (category, mut tools) in by_category {
            tools.sort_by(|a, b| a.spec.name.cmp(&b.spec.name));
            out.push_str(&format!("### {category}\n"));
            for tool in tools {
                out.push_str(&format!("- {}: {}\n", tool.spec.name, tool.spec.description));
            }
        }
        out
    }

    /// Detailed help for a tool, for `tool_help`.
    pub fn help_for(&self, name: &str) -> Option<String> {
        let tool = self.get(name)?;
        Some(match &tool.spec.detailed_help {
            Some(help) => help.clone(),
            None => format!(
                "{}: {}\nParameters schema: {}",
                tool.spec.name, tool.spec.description, tool.spec.parameters
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoHandler;

    #[async_trait::async_trait]
    impl ToolHandler for EchoHandler {
        async fn call(&self, args: Value, _cancel: &CancelToken) -> Result<String, ToolError> {
            Ok(args.to_string())
        }
    }

    fn spec(name: &str) -> ToolSpec {
        ToolSpec::new(name, format!("{name} tool"), serde_json::json!({"type": "object"}))
    }

    #[test]
    fn register_and_lookup() {
        let reg = ToolRegistry::new();
        reg.register(spec("read_file"), Arc::new(EchoHandler));
        assert!(reg.get("read_file").is_some());
        assert!(reg.get("nope").is_none());
        assert_eq!(reg.names(), vec!["read_file"]);
    }

    #[test]
    fn direct_definitions_without_catalog() {
        let reg = ToolRegistry::new();
        reg.register(spec("a"), Arc::new(EchoHandler));
        reg.register(spec("b"), Arc::new(EchoHandler));
        let defs = reg.direct_definitions();
        let names: Vec<_> = defs.iter().map(|d| d.name.as_str()).collect();
        // No catalog -> no call_tool/tool_help.
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn catalog_adds_call_tool_and_help() {
        let reg = ToolRegistry::new();
        reg.register(spec("direct_one"), Arc::new(EchoHandler));
        reg.register(spec("cat_one").catalog().category("desktop"), Arc::new(EchoHandler));

        let defs = reg.direct_definitions();
        let names: Vec<_> = defs.iter().map(|d| d.name.as_str()).collect();
        assert!(names.contains(&"direct_one"));
        assert!(!names.contains(&"cat_one"));
        assert!(names.contains(&CALL_TOOL));
        assert!(names.contains(&TOOL_HELP));

        let synopsis = reg.catalog_synopsis();
        assert!(synopsis.contains("### desktop"));
        assert!(synopsis.contains("- cat_one:"));
    }

    #[test]
    fn help_falls_back_to_schema() {
        let reg = ToolRegistry::new();
        reg.register(spec("x"), Arc::new(EchoHandler));
        let help = reg.help_for("x").unwrap();
        assert!(help.contains("Parameters schema"));

        reg.register(spec("y").detailed_help("full docs here"), Arc::new(EchoHandler));
        assert_eq!(reg.help_for("y").unwrap(), "full docs here");
    }

    #[test]
    fn swap_replaces_everything() {
        let reg = ToolRegistry::new();
        reg.register(spec("old"), Arc::new(EchoHandler));
        reg.swap(vec![(spec("new"), Arc::new(EchoHandler) as Arc<dyn ToolHandler>)]);
        assert!(reg.get("old").is_none());
        assert!(reg.get("new").is_some());
    }
}
