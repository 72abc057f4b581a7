//! Prompt assembler — composes the system prompt from labelled sections
//! under per-section token budgets.
//!
//! Sections: identity (soul/role), core behaviours, tooling instructions,
//! user profile, retrieved memory, active plan status, persona hints, and
//! the tool catalog synopsis. Identity-type sections come from workspace
//! files; memory comes from the core memory file plus the retriever.
//!
//! The budget contract is observational today: an over-budget section logs
//! a warning and flags the report, but its content is still emitted. The
//! `enforce_budgets` switch is the enforcement hook; flipping it truncates
//! instead, without changing any call site.

use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;

use valet_domain::config::{MemoryConfig, PromptBudgetConfig};
use valet_domain::trace::TraceEvent;
use valet_memory::{load_core_memory, MemoryRetriever};
use valet_tools::ToolRegistry;

use crate::context::estimate_tokens;

/// Workspace files feeding the static sections.
const SOUL_FILE: &str = "SOUL.md";
const AGENT_FILE: &str = "AGENT.md";
const TOOLS_FILE: &str = "TOOLS.md";
const USER_FILE: &str = "USER.md";
const PLAN_FILE: &str = "PLAN.md";
const PERSONA_FILE: &str = "PERSONA.md";
const MEMORY_FILE: &str = "MEMORY.md";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Report
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize)]
pub struct SectionReport {
    pub label: String,
    pub estimated_tokens: u32,
    pub budget_tokens: u32,
    pub over_budget: bool,
    pub truncated: bool,
    pub included: bool,
}

/// Machine-readable outcome of one assembly pass.
#[derive(Debug, Clone, Serialize)]
pub struct PromptReport {
    pub sections: Vec<SectionReport>,
    pub total_estimated_tokens: u32,
    pub total_budget_tokens: u32,
    pub over_budget_sections: usize,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Assembler
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct PromptAssembler {
    budget: PromptBudgetConfig,
    memory_config: MemoryConfig,
    identity_dir: PathBuf,
    retriever: Arc<dyn MemoryRetriever>,
    registry: Arc<ToolRegistry>,
    /// Enforcement hook: when true, over-budget sections are truncated to
    /// their budget instead of merely flagged.
    enforce_budgets: bool,
}

impl PromptAssembler {
    pub fn new(
        budget: PromptBudgetConfig,
        memory_config: MemoryConfig,
        identity_dir: PathBuf,
        retriever: Arc<dyn MemoryRetriever>,
        registry: Arc<ToolRegistry>,
    ) -> Self {
        Self {
            budget,
            memory_config,
            identity_dir,
            retriever,
            registry,
            enforce_budgets: false,
        }
    }

    /// Assemble the system prompt for the current user query.
    pub fn assemble(&self, query: &str) -> (String, PromptReport) {
        let sections = [
            ("Identity", self.read_file(SOUL_FILE), self.budget.identity_tokens),
            ("Core behaviours", self.read_file(AGENT_FILE), self.budget.behaviours_tokens),
            ("Tooling", self.read_file(TOOLS_FILE), self.budget.tooling_tokens),
            ("User profile", self.read_file(USER_FILE), self.budget.user_tokens),
            ("Memory", self.memory_section(query), self.budget.memory_tokens),
            ("Active plan", self.read_file(PLAN_FILE), self.budget.plan_tokens),
            ("Persona", self.read_file(PERSONA_FILE), self.budget.persona_tokens),
            ("Tool catalog", self.registry.catalog_synopsis(), self.budget.catalog_tokens),
        ];

        let mut assembled = String::new();
        let mut reports = Vec::new();
        let mut total_estimated = 0u32;
        let mut over_count = 0usize;

        for (label, content, budget_tokens) in sections {
            let content = content.trim().to_string();
            if content.is_empty() {
                reports.push(SectionReport {
                    label: label.into(),
                    estimated_tokens: 0,
                    budget_tokens,
                    over_budget: false,
                    truncated: false,
                    included: false,
                });
                continue;
            }

            let mut estimated = estimate_tokens(&content);
            let over_budget = estimated > budget_tokens;
            let mut truncated = false;
            let mut emitted = content;

            if over_budget {
                over_count += 1;
                if self.enforce_budgets {
                    emitted = truncate_to_tokens(&emitted, budget_tokens);
                    estimated = estimate_tokens(&emitted);
                    truncated = true;
                } else {
                    tracing::warn!(
                        section = label,
                        estimated_tokens = estimated,
                        budget_tokens,
                        "prompt section over budget (content still emitted)"
                    );
                }
            }

            assembled.push_str(&format!("## {label}\n{emitted}\n\n"));
            total_estimated += estimated;
            reports.push(SectionReport {
                label: label.into(),
                estimated_tokens: estimated,
                budget_tokens,
                over_budget,
                truncated,
                included: true,
            });
        }

        if total_estimated > self.budget.total_tokens {
            tracing::warn!(
                total_estimated_tokens = total_estimated,
                total_budget_tokens = self.budget.total_tokens,
                "assembled prompt exceeds total budget"
            );
        }

        TraceEvent::PromptAssembled {
            total_tokens: total_estimated,
            sections_over_budget: over_count,
        }
        .emit();

        let report = PromptReport {
            sections: reports,
            total_estimated_tokens: total_estimated,
            total_budget_tokens: self.budget.total_tokens,
            over_budget_sections: over_count,
        };
        (assembled.trim_end().to_string(), report)
    }

    fn read_file(&self, name: &str) -> String {
        std::fs::read_to_string(self.identity_dir.join(name)).unwrap_or_default()
    }

    /// Core memory file plus retrieved entries, importance-ordered and
    /// deduplicated by the retriever.
    fn memory_section(&self, query: &str) -> String {
        let mut out = String::new();

        let core = load_core_memory(
            &self.identity_dir.join(MEMORY_FILE),
            self.memory_config.core_file_max_chars,
        );
        if !core.is_empty() {
            out.push_str("### Core memory\n");
            out.push_str(&core);
            out.push('\n');
        }

        let related = self.retriever.retrieve(
            query,
            self.memory_config.max_items,
            self.memory_config.min_importance,
        );
        if !related.is_empty() {
            let semantic = related.iter().any(|m| m.semantic);
            out.push_str(if semantic {
                "### Related memories (semantic match)\n"
            } else {
                "### Related memories (keyword match)\n"
            });
            for m in &related {
                out.push_str(&format!("- {}\n", m.content));
            }
        }

        out
    }
}

/// Cut text to approximately `budget` tokens at a line boundary, leaving
/// room for the truncation marker.
fn truncate_to_tokens(text: &str, budget: u32) -> String {
    let body_budget = budget.saturating_sub(8);
    let mut out = String::new();
    for line in text.lines() {
        let candidate_tokens = estimate_tokens(&out) + estimate_tokens(line);
        if candidate_tokens > body_budget {
            break;
        }
        out.push_str(line);
        out.push('\n');
    }
    out.push_str("...(truncated)");
    out
}
