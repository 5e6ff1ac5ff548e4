//! Reference library: the fragments and bundles the selector draws from.
//!
//! The library is shared by every request, so all state sits behind a
//! lock and every accessor hands out owned copies. It can be seeded from
//! a TOML document:
//!
//! ```toml
//! [[fragments]]
//! key = "style.brief"
//! title = "Brief answers"
//! category = "style_guide"
//! body = "Answer in one or two sentences."
//! applies_to = { modes = ["brief"] }
//!
//! [[bundles]]
//! key = "profile.default_it_assistant"
//! name = "Default IT assistant"
//! is_default = true
//! entries = [{ fragment_key = "style.brief", order = 10 }]
//! ```

use opsclaw_core::reference::{Bundle, BundleEntry, Fragment, FragmentCategory};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::RwLock;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Key of the bundle seeded by [`ReferenceLibrary::with_defaults`].
pub const DEFAULT_BUNDLE_KEY: &str = "profile.default_it_assistant";

#[derive(Debug, Error)]
pub enum LibraryError {
    #[error("Fragment '{0}' does not exist")]
    UnknownFragment(String),

    #[error("Bundle '{0}' does not exist")]
    UnknownBundle(String),

    #[error("Bundle '{0}' already exists")]
    DuplicateBundle(String),

    #[error("Failed to read reference file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse reference file: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Default, Deserialize)]
struct LibraryFile {
    #[serde(default)]
    fragments: Vec<Fragment>,
    #[serde(default)]
    bundles: Vec<Bundle>,
}

#[derive(Default)]
struct Shelves {
    fragments: BTreeMap<String, Fragment>,
    bundles: BTreeMap<String, Bundle>,
}

/// Shared store of reference fragments and bundles.
#[derive(Default)]
pub struct ReferenceLibrary {
    shelves: RwLock<Shelves>,
}

impl ReferenceLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    /// A library holding the stock operations-assistant fragments and a
    /// default bundle that includes them all.
    pub fn with_defaults() -> Self {
        let library = Self::new();
        let mut bundle = Bundle::new(DEFAULT_BUNDLE_KEY, "Default IT assistant");
        bundle.description = Some("Core references for the operations assistant".into());
        bundle.is_default = true;

        for (index, fragment) in default_fragments().into_iter().enumerate() {
            bundle.entries.push(BundleEntry {
                fragment_key: fragment.key.clone(),
                order: index as i32 * 10,
            });
            library.upsert_fragment(fragment);
        }
        // A fresh library cannot already contain the bundle.
        let _ = library.create_bundle(bundle);
        library
    }

    /// Parse a TOML document of `[[fragments]]` and `[[bundles]]`.
    pub fn from_toml_str(source: &str) -> Result<Self, LibraryError> {
        let library = Self::new();
        library.load_toml_str(source)?;
        Ok(library)
    }

    /// Merge a TOML document into this library.
    ///
    /// Fragments go through [`upsert_fragment`](Self::upsert_fragment);
    /// bundles replace any bundle with the same key.
    pub fn load_toml_str(&self, source: &str) -> Result<(), LibraryError> {
        let file: LibraryFile = toml::from_str(source)?;
        let fragment_count = file.fragments.len();
        let bundle_count = file.bundles.len();

        for fragment in file.fragments {
            self.upsert_fragment(fragment);
        }
        for bundle in file.bundles {
            self.put_bundle(bundle);
        }
        info!(fragments = fragment_count, bundles = bundle_count, "Loaded reference library");
        Ok(())
    }

    pub fn load_file(&self, path: &Path) -> Result<(), LibraryError> {
        let source = std::fs::read_to_string(path)?;
        self.load_toml_str(&source)
    }

    // ── Fragments ───────────────────────────────────────────────────────

    /// Create or update a fragment and return the stored copy.
    ///
    /// An update keeps the stored version unless the body changed, in
    /// which case the version is bumped by one.
    pub fn upsert_fragment(&self, mut fragment: Fragment) -> Fragment {
        let mut shelves = self.shelves.write().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = shelves.fragments.get(&fragment.key) {
            fragment.version = if existing.body != fragment.body {
                existing.version + 1
            } else {
                existing.version
            };
            debug!(fragment = %fragment.key, version = fragment.version, "Updated fragment");
        }
        shelves.fragments.insert(fragment.key.clone(), fragment.clone());
        fragment
    }

    /// Soft-delete a fragment. Returns false when it does not exist.
    pub fn deactivate_fragment(&self, key: &str) -> bool {
        let mut shelves = self.shelves.write().unwrap_or_else(|e| e.into_inner());
        match shelves.fragments.get_mut(key) {
            Some(fragment) => {
                fragment.active = false;
                true
            }
            None => false,
        }
    }

    pub fn fragment(&self, key: &str) -> Option<Fragment> {
        self.shelves
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .fragments
            .get(key)
            .cloned()
    }

    /// Fragments sorted by key, optionally including inactive ones.
    pub fn fragments(&self, include_inactive: bool) -> Vec<Fragment> {
        self.shelves
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .fragments
            .values()
            .filter(|f| include_inactive || f.active)
            .cloned()
            .collect()
    }

    // ── Bundles ─────────────────────────────────────────────────────────

    /// Add a new bundle. A default bundle clears the previous default.
    pub fn create_bundle(&self, bundle: Bundle) -> Result<(), LibraryError> {
        if self.bundle(&bundle.key).is_some() {
            return Err(LibraryError::DuplicateBundle(bundle.key));
        }
        self.put_bundle(bundle);
        Ok(())
    }

    /// Insert or replace a bundle. Replacing the current default keeps
    /// the default flag, so the library never loses its default bundle.
    fn put_bundle(&self, mut bundle: Bundle) {
        let mut shelves = self.shelves.write().unwrap_or_else(|e| e.into_inner());
        if !bundle.is_default
            && shelves.bundles.get(&bundle.key).is_some_and(|existing| existing.is_default)
        {
            warn!(bundle = %bundle.key, "Replacement for the default bundle is not marked default; keeping it as default");
            bundle.is_default = true;
        }
        if bundle.is_default {
            for other in shelves.bundles.values_mut() {
                other.is_default = false;
            }
        }
        shelves.bundles.insert(bundle.key.clone(), bundle);
    }

    pub fn bundle(&self, key: &str) -> Option<Bundle> {
        self.shelves
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .bundles
            .get(key)
            .cloned()
    }

    pub fn default_bundle(&self) -> Option<Bundle> {
        self.shelves
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .bundles
            .values()
            .find(|b| b.is_default)
            .cloned()
    }

    pub fn bundles(&self) -> Vec<Bundle> {
        self.shelves
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .bundles
            .values()
            .cloned()
            .collect()
    }

    /// Place a fragment in a bundle at `order`, moving it if already present.
    pub fn add_to_bundle(&self, bundle_key: &str, fragment_key: &str, order: i32) -> Result<(), LibraryError> {
        let mut shelves = self.shelves.write().unwrap_or_else(|e| e.into_inner());
        if !shelves.fragments.contains_key(fragment_key) {
            return Err(LibraryError::UnknownFragment(fragment_key.to_string()));
        }
        let bundle = shelves
            .bundles
            .get_mut(bundle_key)
            .ok_or_else(|| LibraryError::UnknownBundle(bundle_key.to_string()))?;

        match bundle.entries.iter_mut().find(|e| e.fragment_key == fragment_key) {
            Some(entry) => entry.order = order,
            None => bundle.entries.push(BundleEntry {
                fragment_key: fragment_key.to_string(),
                order,
            }),
        }
        Ok(())
    }

    /// Returns whether the fragment was part of the bundle.
    pub fn remove_from_bundle(&self, bundle_key: &str, fragment_key: &str) -> Result<bool, LibraryError> {
        let mut shelves = self.shelves.write().unwrap_or_else(|e| e.into_inner());
        let bundle = shelves
            .bundles
            .get_mut(bundle_key)
            .ok_or_else(|| LibraryError::UnknownBundle(bundle_key.to_string()))?;
        let before = bundle.entries.len();
        bundle.entries.retain(|e| e.fragment_key != fragment_key);
        Ok(bundle.entries.len() != before)
    }
}

fn default_fragments() -> Vec<Fragment> {
    vec![
        Fragment::new(
            "core.assistant.behavior.v1",
            "Core Assistant Behavior",
            "You are an IT operations assistant. Prefer inspecting real systems through the \
             available tools over guessing, and ground every answer in tool results.\n\
             - Infer required parameters when it is safe to do so; otherwise ask one concise question.\n\
             - Leave optional parameters unset or use safe defaults, and mention any assumptions.\n\
             - Never work around confirmation requirements on destructive operations.\n\
             - If you lack the information to finish a task safely, say what is missing.",
        )
        .with_category(FragmentCategory::SystemBehavior),
        Fragment::new(
            "style.response_format.v1",
            "Response Formatting",
            "Use tables or bullet lists for collections of items, numbered lists for procedures, \
             and code blocks for commands. Give counts with context, e.g. '12 hosts (3 offline)'.",
        )
        .with_category(FragmentCategory::StyleGuide),
        Fragment::new(
            "style.technical.v1",
            "Technical Style",
            "Assume strong technical knowledge. Use precise terminology, skip the basics, and keep \
             paragraphs short.",
        )
        .with_category(FragmentCategory::StyleGuide)
        .for_modes(["technical"]),
        Fragment::new(
            "style.casual.v1",
            "Casual Style",
            "Keep the tone friendly and conversational. Simplify details where it does not cost accuracy.",
        )
        .with_category(FragmentCategory::StyleGuide)
        .for_modes(["casual"]),
        Fragment::new(
            "role.admin.context.v1",
            "Administrator Context",
            "The user is an administrator and may run every operation, including destructive ones. \
             Still state the impact of a destructive change before requesting it.",
        )
        .with_category(FragmentCategory::RoleContext)
        .for_roles(["admin"]),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_change_bumps_version() {
        let library = ReferenceLibrary::new();
        let first = library.upsert_fragment(Fragment::new("k", "Title", "one"));
        assert_eq!(first.version, 1);

        let retitled = library.upsert_fragment(Fragment::new("k", "New title", "one"));
        assert_eq!(retitled.version, 1);

        let rewritten = library.upsert_fragment(Fragment::new("k", "New title", "two"));
        assert_eq!(rewritten.version, 2);
        assert_eq!(library.fragment("k").unwrap().body, "two");
    }

    #[test]
    fn deactivate_is_soft() {
        let library = ReferenceLibrary::new();
        library.upsert_fragment(Fragment::new("k", "T", "B"));
        assert!(library.deactivate_fragment("k"));
        assert!(!library.deactivate_fragment("missing"));
        assert!(library.fragments(false).is_empty());
        assert_eq!(library.fragments(true).len(), 1);
    }

    #[test]
    fn new_default_bundle_clears_previous_default() {
        let library = ReferenceLibrary::new();
        let mut a = Bundle::new("a", "A");
        a.is_default = true;
        let mut b = Bundle::new("b", "B");
        b.is_default = true;

        library.create_bundle(a).unwrap();
        library.create_bundle(b).unwrap();

        assert_eq!(library.default_bundle().unwrap().key, "b");
        assert!(!library.bundle("a").unwrap().is_default);
    }

    #[test]
    fn duplicate_bundle_is_rejected() {
        let library = ReferenceLibrary::new();
        library.create_bundle(Bundle::new("a", "A")).unwrap();
        assert!(matches!(
            library.create_bundle(Bundle::new("a", "Again")),
            Err(LibraryError::DuplicateBundle(_))
        ));
    }

    #[test]
    fn add_to_bundle_updates_order_when_present() {
        let library = ReferenceLibrary::new();
        library.upsert_fragment(Fragment::new("f", "F", "body"));
        library.create_bundle(Bundle::new("b", "B")).unwrap();

        library.add_to_bundle("b", "f", 5).unwrap();
        library.add_to_bundle("b", "f", 1).unwrap();

        let bundle = library.bundle("b").unwrap();
        assert_eq!(bundle.entries.len(), 1);
        assert_eq!(bundle.entries[0].order, 1);
    }

    #[test]
    fn add_to_bundle_checks_both_sides() {
        let library = ReferenceLibrary::new();
        library.create_bundle(Bundle::new("b", "B")).unwrap();
        assert!(matches!(
            library.add_to_bundle("b", "nope", 0),
            Err(LibraryError::UnknownFragment(_))
        ));
        library.upsert_fragment(Fragment::new("f", "F", "body"));
        assert!(matches!(
            library.add_to_bundle("nope", "f", 0),
            Err(LibraryError::UnknownBundle(_))
        ));
    }

    #[test]
    fn remove_from_bundle_reports_membership() {
        let library = ReferenceLibrary::new();
        library.upsert_fragment(Fragment::new("f", "F", "body"));
        library.create_bundle(Bundle::new("b", "B")).unwrap();
        library.add_to_bundle("b", "f", 0).unwrap();

        assert!(library.remove_from_bundle("b", "f").unwrap());
        assert!(!library.remove_from_bundle("b", "f").unwrap());
    }

    #[test]
    fn loads_toml() {
        let library = ReferenceLibrary::from_toml_str(
            r#"
            [[fragments]]
            key = "style.brief"
            title = "Brief"
            category = "style_guide"
            body = "Be brief."
            applies_to = { modes = ["brief"] }

            [[bundles]]
            key = "main"
            name = "Main"
            is_default = true
            entries = [{ fragment_key = "style.brief", order = 10 }]
            "#,
        )
        .unwrap();

        let fragment = library.fragment("style.brief").unwrap();
        assert_eq!(fragment.category, FragmentCategory::StyleGuide);
        assert_eq!(fragment.applies_to.modes, Some(vec!["brief".to_string()]));
        assert_eq!(library.default_bundle().unwrap().key, "main");
    }

    #[test]
    fn bad_toml_is_a_parse_error() {
        assert!(matches!(
            ReferenceLibrary::from_toml_str("[[fragments]]\nkey = 1"),
            Err(LibraryError::Parse(_))
        ));
    }

    #[test]
    fn defaults_have_a_default_bundle() {
        let library = ReferenceLibrary::with_defaults();
        let bundle = library.default_bundle().unwrap();
        assert_eq!(bundle.key, DEFAULT_BUNDLE_KEY);
        assert_eq!(bundle.entries.len(), library.fragments(false).len());
    }

    #[test]
    fn load_file_merges_into_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("references.toml");
        std::fs::write(
            &path,
            "[[fragments]]\nkey = \"runbook.dns\"\ntitle = \"DNS\"\nbody = \"Use the internal resolver.\"\n",
        )
        .unwrap();

        let library = ReferenceLibrary::with_defaults();
        library.load_file(&path).unwrap();
        assert!(library.fragment("runbook.dns").is_some());
        assert!(library.default_bundle().is_some());

        assert!(matches!(
            library.load_file(&dir.path().join("missing.toml")),
            Err(LibraryError::Io(_))
        ));
    }

    #[test]
    fn replacing_default_bundle_keeps_it_default() {
        let library = ReferenceLibrary::with_defaults();
        library
            .load_toml_str(
                r#"
            [[fragments]]
            key = "style.brief"
            title = "Brief"
            category = "style_guide"
            body = "Be brief."

            [[bundles]]
            key = "profile.default_it_assistant"
            name = "Trimmed default"
            is_default = false
            entries = [{ fragment_key = "style.brief", order = 10 }]
            "#,
            )
            .unwrap();

        let default = library.default_bundle().unwrap();
        assert_eq!(default.key, DEFAULT_BUNDLE_KEY);
        assert_eq!(default.name, "Trimmed default");
        assert_eq!(default.entries.len(), 1);
    }
}
