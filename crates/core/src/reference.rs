//! Reference fragments, bundles, and usage records.
//!
//! A fragment is a reusable block of instruction text that can be targeted
//! at specific roles, modes, pages, or operations. A bundle is an ordered,
//! named collection of fragments. Every assembled response leaves behind a
//! usage record so the exact instruction text can be audited later.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Broad purpose of a fragment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FragmentCategory {
    SystemBehavior,
    ToolUsage,
    DomainKnowledge,
    StyleGuide,
    PageContext,
    RoleContext,
    #[default]
    Other,
}

/// Applicability predicates. `None` means unrestricted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Applicability {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roles: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modes: Option<Vec<String>>,

    /// Exact paths or prefix wildcards such as `/azure/*`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pages: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<String>>,
}

/// A reusable, independently targetable block of instruction text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fragment {
    pub key: String,

    pub title: String,

    #[serde(default)]
    pub category: FragmentCategory,

    pub body: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    #[serde(default)]
    pub applies_to: Applicability,

    /// Soft-delete flag
    #[serde(default = "default_active")]
    pub active: bool,

    /// Bumped whenever the body changes
    #[serde(default = "default_version")]
    pub version: u32,
}

fn default_active() -> bool {
    true
}

fn default_version() -> u32 {
    1
}

impl Fragment {
    pub fn new(key: impl Into<String>, title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            title: title.into(),
            category: FragmentCategory::Other,
            body: body.into(),
            tags: Vec::new(),
            applies_to: Applicability::default(),
            active: true,
            version: 1,
        }
    }

    pub fn with_category(mut self, category: FragmentCategory) -> Self {
        self.category = category;
        self
    }

    pub fn for_roles<I: IntoIterator<Item = S>, S: Into<String>>(mut self, roles: I) -> Self {
        self.applies_to.roles = Some(roles.into_iter().map(Into::into).collect());
        self
    }

    pub fn for_modes<I: IntoIterator<Item = S>, S: Into<String>>(mut self, modes: I) -> Self {
        self.applies_to.modes = Some(modes.into_iter().map(Into::into).collect());
        self
    }

    pub fn for_pages<I: IntoIterator<Item = S>, S: Into<String>>(mut self, pages: I) -> Self {
        self.applies_to.pages = Some(pages.into_iter().map(Into::into).collect());
        self
    }

    pub fn for_tools<I: IntoIterator<Item = S>, S: Into<String>>(mut self, tools: I) -> Self {
        self.applies_to.tools = Some(tools.into_iter().map(Into::into).collect());
        self
    }

    /// Minimal identity of this fragment for usage records.
    pub fn snapshot(&self) -> FragmentSnapshot {
        FragmentSnapshot {
            key: self.key.clone(),
            title: self.title.clone(),
            category: self.category,
            version: self.version,
        }
    }
}

/// One slot in a bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleEntry {
    pub fragment_key: String,
    pub order: i32,
}

/// A named, ordered collection of fragments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bundle {
    pub key: String,

    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default)]
    pub is_default: bool,

    #[serde(default)]
    pub entries: Vec<BundleEntry>,
}

impl Bundle {
    pub fn new(key: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            name: name.into(),
            description: None,
            is_default: false,
            entries: Vec::new(),
        }
    }

    /// Entries sorted by their order index (stable for equal orders).
    pub fn ordered_entries(&self) -> Vec<&BundleEntry> {
        let mut entries: Vec<&BundleEntry> = self.entries.iter().collect();
        entries.sort_by_key(|e| e.order);
        entries
    }
}

/// Which fragment (and which revision of it) contributed to a response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FragmentSnapshot {
    pub key: String,
    pub title: String,
    pub category: FragmentCategory,
    pub version: u32,
}

/// Immutable snapshot of the instruction text behind one response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceUsageRecord {
    pub id: String,

    pub conversation_id: String,

    /// The assistant turn this instruction text produced
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,

    /// Position of the user turn within the conversation
    pub turn_index: usize,

    pub model: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bundle_key: Option<String>,

    pub assembled_text: String,

    pub fragments: Vec<FragmentSnapshot>,

    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fragment_defaults_to_active_version_one() {
        let json = r#"{"key":"k","title":"T","body":"B"}"#;
        let fragment: Fragment = serde_json::from_str(json).unwrap();
        assert!(fragment.active);
        assert_eq!(fragment.version, 1);
        assert_eq!(fragment.category, FragmentCategory::Other);
        assert_eq!(fragment.applies_to, Applicability::default());
    }

    #[test]
    fn bundle_orders_entries() {
        let mut bundle = Bundle::new("b", "Bundle");
        bundle.entries.push(BundleEntry { fragment_key: "late".into(), order: 20 });
        bundle.entries.push(BundleEntry { fragment_key: "early".into(), order: 10 });
        let keys: Vec<_> = bundle.ordered_entries().iter().map(|e| e.fragment_key.as_str()).collect();
        assert_eq!(keys, vec!["early", "late"]);
    }

    #[test]
    fn builder_sets_predicates() {
        let f = Fragment::new("azure", "Azure", "Use the Azure tools.")
            .with_category(FragmentCategory::PageContext)
            .for_pages(["/azure/*"]);
        assert_eq!(f.applies_to.pages, Some(vec!["/azure/*".to_string()]));
        assert!(f.applies_to.roles.is_none());
    }
}
