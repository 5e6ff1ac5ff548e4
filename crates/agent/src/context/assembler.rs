//! System prompt assembly and history truncation.
//!
//! The system prompt is built from fixed sections in a fixed order:
//!
//! | Section | Source |
//! |---------|--------|
//! | base block | config override or [`DEFAULT_BASE_PROMPT`] |
//! | `## Current User` | caller identity and roles |
//! | `## Current Context` | page the request came from |
//! | `## Mode` | conversation mode guidance |
//! | `## Reference Material` | selected fragments |
//! | `## Available Tools` | operations offered to the model |
//!
//! Sections with nothing to say are left out entirely.

use super::selector::Selection;
use super::token::estimate_message_tokens;
use opsclaw_catalog::OperationSummary;
use opsclaw_core::message::{Message, Role};
use opsclaw_core::operation::Caller;
use opsclaw_core::reference::FragmentSnapshot;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write;
use tracing::debug;

pub const DEFAULT_BASE_PROMPT: &str = "You are OpsClaw, an assistant for IT operations teams. \
You help inspect and manage infrastructure by calling the operations you are given. \
Base your answers on operation results rather than assumptions, and keep them accurate.";

/// Where in the surrounding application the request was made.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_name: Option<String>,

    #[serde(default)]
    pub selected_items: usize,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub filters: BTreeMap<String, String>,
}

impl PageContext {
    fn is_empty(&self) -> bool {
        self.page_name.is_none()
            && self.path.is_none()
            && self.record_id.is_none()
            && self.model_name.is_none()
            && self.selected_items == 0
            && self.filters.is_empty()
    }
}

/// Guidance text for a conversation mode. Unknown modes get none.
pub fn mode_guidance(mode: &str) -> Option<&'static str> {
    Some(match mode {
        "technical" => {
            "Respond with detailed technical information. Include command examples and configuration details."
        }
        "casual" => "Respond in a friendly, conversational manner. Simplify technical details where appropriate.",
        "brief" => "Keep responses extremely short and to the point. No explanations unless explicitly requested.",
        "verbose" => {
            "Provide detailed explanations and background information. Include related information that might be helpful."
        }
        _ => return None,
    })
}

/// Inputs for one system prompt.
#[derive(Debug, Clone, Copy)]
pub struct AssemblyInput<'a> {
    pub caller: &'a Caller,
    pub page: Option<&'a PageContext>,
    pub mode: Option<&'a str>,
    pub selection: &'a Selection,
    pub tools: &'a [OperationSummary],
}

/// The assembled system prompt and what went into it.
#[derive(Debug, Clone, PartialEq)]
pub struct AssembledContext {
    pub text: String,
    pub bundle_key: Option<String>,
    pub fragments: Vec<FragmentSnapshot>,
}

/// Builds system prompts around a fixed base block.
#[derive(Debug, Clone)]
pub struct ContextAssembler {
    base_prompt: String,
}

impl Default for ContextAssembler {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_PROMPT)
    }
}

impl ContextAssembler {
    pub fn new(base_prompt: impl Into<String>) -> Self {
        Self {
            base_prompt: base_prompt.into(),
        }
    }

    pub fn base_prompt(&self) -> &str {
        &self.base_prompt
    }

    pub fn assemble(&self, input: AssemblyInput<'_>) -> AssembledContext {
        let mut sections = vec![self.base_prompt.clone()];

        sections.push(user_section(input.caller));

        if let Some(page) = input.page.filter(|p| !p.is_empty()) {
            sections.push(page_section(page));
        }

        if let Some(guidance) = input.mode.and_then(mode_guidance) {
            sections.push(format!("\n## Mode\n\n{guidance}"));
        }

        if !input.selection.is_empty() {
            let mut out = String::from("\n## Reference Material\n");
            for fragment in &input.selection.fragments {
                let _ = write!(out, "\n### {}\n\n{}\n", fragment.title, fragment.body.trim_end());
            }
            sections.push(out.trim_end().to_string());
        }

        if !input.tools.is_empty() {
            let mut out = String::from("\n## Available Tools\n\nYou have access to the following tools:\n");
            for tool in input.tools {
                let _ = write!(out, "\n- `{}`: {}", tool.name, tool.description);
                if tool.requires_confirmation {
                    out.push_str(" (requires confirmation)");
                }
            }
            sections.push(out);
        }

        AssembledContext {
            text: sections.join("\n"),
            bundle_key: input.selection.bundle_key.clone(),
            fragments: input.selection.snapshots(),
        }
    }
}

fn user_section(caller: &Caller) -> String {
    let mut out = String::from("\n## Current User\n");
    if let Some(user_id) = &caller.user_id {
        let _ = write!(out, "\nUser ID: {user_id}");
    }
    if !caller.roles.is_empty() {
        let _ = write!(out, "\nRoles: {}", caller.roles.join(", "));
    }
    if caller.roles.iter().any(|r| r == "admin") {
        out.push_str("\nCapabilities: Full access to all models and operations");
    } else {
        out.push_str("\nCapabilities: Standard user access");
    }
    out
}

fn page_section(page: &PageContext) -> String {
    let mut out = String::from("\n## Current Context\n");
    if let Some(name) = &page.page_name {
        let _ = write!(out, "\nCurrent page: {name}");
    }
    if let Some(path) = &page.path {
        let _ = write!(out, "\nURL path: {path}");
    }
    if page.selected_items > 0 {
        let _ = write!(out, "\nSelected items: {} item(s)", page.selected_items);
    }
    if let Some(model) = &page.model_name {
        let _ = write!(out, "\nViewing model: {model}");
    }
    if let Some(record) = &page.record_id {
        let _ = write!(out, "\nRecord ID: {record}");
    }
    if !page.filters.is_empty() {
        let filters: Vec<String> = page.filters.iter().map(|(k, v)| format!("{k}={v}")).collect();
        let _ = write!(out, "\nActive filters: {}", filters.join(", "));
    }
    out
}

/// Result of fitting history into a token budget.
#[derive(Debug, Clone)]
pub struct TruncatedHistory {
    pub turns: Vec<Message>,
    pub dropped: usize,
    pub estimated_tokens: usize,
}

/// Fit replayed history into `budget` estimated tokens.
///
/// System turns and the last `preserve_last` turns are always kept, even
/// if they alone exceed the budget. Older turns are dropped oldest first
/// until the rest fits. The kept window never opens on an orphaned tool
/// result.
pub fn truncate_history(turns: &[Message], budget: usize, preserve_last: usize) -> TruncatedHistory {
    let (system, rest): (Vec<&Message>, Vec<&Message>) = turns.iter().partition(|t| t.role == Role::System);

    let split = rest.len().saturating_sub(preserve_last);
    let (older, preserved) = rest.split_at(split);

    let fixed: usize = system
        .iter()
        .chain(preserved.iter())
        .map(|t| estimate_message_tokens(t))
        .sum();
    let mut remaining = budget.saturating_sub(fixed);

    // Longest suffix of the older turns that fits what is left.
    let mut keep_from = older.len();
    for (index, turn) in older.iter().enumerate().rev() {
        let cost = estimate_message_tokens(turn);
        if cost > remaining {
            break;
        }
        remaining -= cost;
        keep_from = index;
    }

    let mut window: Vec<&Message> = older[keep_from..].iter().chain(preserved.iter()).copied().collect();
    let mut orphans = 0;
    while window.first().is_some_and(|t| t.role == Role::Tool) {
        window.remove(0);
        orphans += 1;
    }
    if orphans > 0 {
        debug!(orphans, "Dropped tool results whose call fell outside the history window");
    }

    let kept: Vec<Message> = system.into_iter().chain(window).cloned().collect();
    let estimated_tokens = kept.iter().map(estimate_message_tokens).sum();
    TruncatedHistory {
        dropped: turns.len() - kept.len(),
        turns: kept,
        estimated_tokens,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opsclaw_core::OperationKind;
    use opsclaw_core::reference::Fragment;

    fn summary(name: &str, confirm: bool) -> OperationSummary {
        OperationSummary {
            name: name.into(),
            display_name: name.into(),
            description: format!("Does {name}"),
            kind: OperationKind::Query,
            requires_confirmation: confirm,
            destructive: false,
            allowed_roles: vec![],
            tags: vec![],
            parameters: serde_json::json!({"type": "object"}),
        }
    }

    #[test]
    fn sections_appear_in_order() {
        let caller = Caller::user("u1").with_roles(["admin", "ops"]);
        let page = PageContext {
            page_name: Some("Virtual machines".into()),
            path: Some("/azure/vms".into()),
            record_id: Some("vm-7".into()),
            ..Default::default()
        };
        let selection = Selection {
            bundle_key: Some("main".into()),
            fragments: vec![Fragment::new("f", "Azure Notes", "Prefer resource groups.")],
        };
        let tools = vec![summary("ping", false), summary("delete_widget", true)];

        let ctx = ContextAssembler::new("BASE").assemble(AssemblyInput {
            caller: &caller,
            page: Some(&page),
            mode: Some("brief"),
            selection: &selection,
            tools: &tools,
        });

        let positions: Vec<usize> = [
            "BASE",
            "## Current User",
            "## Current Context",
            "## Mode",
            "## Reference Material",
            "## Available Tools",
        ]
        .iter()
        .map(|needle| ctx.text.find(needle).unwrap())
        .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));

        assert!(ctx.text.contains("User ID: u1"));
        assert!(ctx.text.contains("Roles: admin, ops"));
        assert!(ctx.text.contains("Capabilities: Full access to all models and operations"));
        assert!(ctx.text.contains("URL path: /azure/vms"));
        assert!(ctx.text.contains("Record ID: vm-7"));
        assert!(ctx.text.contains("### Azure Notes\n\nPrefer resource groups."));
        assert!(ctx.text.contains("- `ping`: Does ping\n"));
        assert!(ctx.text.contains("- `delete_widget`: Does delete_widget (requires confirmation)"));
        assert_eq!(ctx.bundle_key.as_deref(), Some("main"));
        assert_eq!(ctx.fragments.len(), 1);
    }

    #[test]
    fn empty_sections_are_omitted() {
        let caller = Caller::anonymous();
        let ctx = ContextAssembler::default().assemble(AssemblyInput {
            caller: &caller,
            page: Some(&PageContext::default()),
            mode: Some("unknown"),
            selection: &Selection::default(),
            tools: &[],
        });
        assert!(ctx.text.starts_with(DEFAULT_BASE_PROMPT));
        assert!(ctx.text.contains("Capabilities: Standard user access"));
        assert!(!ctx.text.contains("## Current Context"));
        assert!(!ctx.text.contains("## Mode"));
        assert!(!ctx.text.contains("## Reference Material"));
        assert!(!ctx.text.contains("## Available Tools"));
    }

    #[test]
    fn mode_guidance_known_modes() {
        for mode in ["technical", "casual", "brief", "verbose"] {
            assert!(mode_guidance(mode).is_some());
        }
        assert!(mode_guidance("pirate").is_none());
    }

    fn turn(role: Role, chars: usize) -> Message {
        let mut m = Message::user("x".repeat(chars));
        m.role = role;
        m
    }

    #[test]
    fn history_within_budget_is_untouched() {
        let turns = vec![turn(Role::User, 40), turn(Role::Assistant, 40)];
        let out = truncate_history(&turns, 100, 4);
        assert_eq!(out.turns.len(), 2);
        assert_eq!(out.dropped, 0);
        assert_eq!(out.estimated_tokens, 20);
    }

    #[test]
    fn oldest_turns_are_dropped_first() {
        // Each turn costs 10 tokens.
        let turns: Vec<Message> = (0..10)
            .map(|i| turn(if i % 2 == 0 { Role::User } else { Role::Assistant }, 40))
            .collect();
        let out = truncate_history(&turns, 60, 4);
        assert_eq!(out.turns.len(), 6);
        assert_eq!(out.dropped, 4);
        assert_eq!(out.turns[0].id, turns[4].id);
        assert_eq!(out.turns[5].id, turns[9].id);
    }

    #[test]
    fn preserved_and_system_turns_survive_a_tiny_budget() {
        let mut turns = vec![turn(Role::System, 400)];
        turns.extend((0..6).map(|_| turn(Role::User, 400)));
        let out = truncate_history(&turns, 10, 2);
        assert_eq!(out.turns.len(), 3);
        assert_eq!(out.turns[0].role, Role::System);
        assert_eq!(out.turns[2].id, turns[6].id);
    }

    #[test]
    fn window_never_opens_on_a_tool_result() {
        let turns = vec![
            turn(Role::User, 40),
            turn(Role::Assistant, 40),
            turn(Role::Tool, 40),
            turn(Role::Assistant, 40),
        ];
        let out = truncate_history(&turns, 0, 2);
        assert_eq!(out.turns.len(), 1);
        assert_eq!(out.turns[0].role, Role::Assistant);
        assert_eq!(out.dropped, 3);
    }
}
