//! Reference selection: which fragments of a bundle apply to this request.

use super::library::ReferenceLibrary;
use opsclaw_core::reference::{Applicability, Fragment, FragmentSnapshot};
use tracing::debug;

/// Everything the selector looks at. Identical queries against an
/// unchanged library always select the same fragments in the same order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReferenceQuery {
    /// Bundle to draw from; `None` or an unknown key means the default bundle
    pub bundle_key: Option<String>,
    pub roles: Vec<String>,
    pub mode: Option<String>,
    pub page_path: Option<String>,
    /// Names of the operations offered to the model
    pub tools: Vec<String>,
}

/// The outcome of a selection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Selection {
    /// Bundle actually used, if any
    pub bundle_key: Option<String>,
    pub fragments: Vec<Fragment>,
}

impl Selection {
    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    pub fn snapshots(&self) -> Vec<FragmentSnapshot> {
        self.fragments.iter().map(Fragment::snapshot).collect()
    }
}

/// Pick the active, applicable fragments of the requested bundle in
/// bundle order.
pub fn select(library: &ReferenceLibrary, query: &ReferenceQuery) -> Selection {
    let bundle = query
        .bundle_key
        .as_deref()
        .and_then(|key| library.bundle(key))
        .or_else(|| library.default_bundle());

    let Some(bundle) = bundle else {
        debug!("No reference bundle available, using base instructions only");
        return Selection::default();
    };

    let fragments: Vec<Fragment> = bundle
        .ordered_entries()
        .into_iter()
        .filter_map(|entry| library.fragment(&entry.fragment_key))
        .filter(|fragment| fragment.active && applies(&fragment.applies_to, query))
        .collect();

    debug!(bundle = %bundle.key, selected = fragments.len(), "Selected reference fragments");
    Selection {
        bundle_key: Some(bundle.key),
        fragments,
    }
}

/// Every predicate that is set must match; unset (or empty) ones pass.
pub fn applies(predicates: &Applicability, query: &ReferenceQuery) -> bool {
    let roles_ok = restricted(&predicates.roles)
        .is_none_or(|roles| roles.iter().any(|r| query.roles.contains(r)));

    let mode_ok = restricted(&predicates.modes)
        .is_none_or(|modes| query.mode.as_ref().is_some_and(|m| modes.contains(m)));

    let page_ok = restricted(&predicates.pages).is_none_or(|pages| {
        query
            .page_path
            .as_deref()
            .is_some_and(|path| pages.iter().any(|p| page_matches(p, path)))
    });

    let tools_ok = restricted(&predicates.tools)
        .is_none_or(|tools| tools.iter().any(|t| query.tools.contains(t)));

    roles_ok && mode_ok && page_ok && tools_ok
}

fn restricted(list: &Option<Vec<String>>) -> Option<&Vec<String>> {
    list.as_ref().filter(|l| !l.is_empty())
}

/// `/azure/*` matches any path starting with `/azure/`; anything else is exact.
pub fn page_matches(pattern: &str, path: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => path.starts_with(prefix),
        None => pattern == path,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opsclaw_core::reference::Bundle;

    fn library() -> ReferenceLibrary {
        let library = ReferenceLibrary::new();
        library.upsert_fragment(Fragment::new("base", "Base", "Always here"));
        library.upsert_fragment(Fragment::new("admin", "Admin", "Admin only").for_roles(["admin"]));
        library.upsert_fragment(Fragment::new("azure", "Azure", "Azure pages").for_pages(["/azure/*"]));
        library.upsert_fragment(Fragment::new("brief", "Brief", "Be brief").for_modes(["brief"]));
        library.upsert_fragment(Fragment::new("ping", "Ping", "Ping usage").for_tools(["ping"]));

        let mut bundle = Bundle::new("main", "Main");
        bundle.is_default = true;
        library.create_bundle(bundle).unwrap();
        for (order, key) in ["ping", "brief", "azure", "admin", "base"].iter().enumerate() {
            library.add_to_bundle("main", key, 50 - order as i32).unwrap();
        }
        library
    }

    fn keys(selection: &Selection) -> Vec<&str> {
        selection.fragments.iter().map(|f| f.key.as_str()).collect()
    }

    #[test]
    fn unrestricted_query_gets_only_unrestricted_fragments() {
        let selection = select(&library(), &ReferenceQuery::default());
        assert_eq!(selection.bundle_key.as_deref(), Some("main"));
        assert_eq!(keys(&selection), vec!["base"]);
    }

    #[test]
    fn all_predicates_matching_selects_in_bundle_order() {
        let query = ReferenceQuery {
            bundle_key: None,
            roles: vec!["admin".into()],
            mode: Some("brief".into()),
            page_path: Some("/azure/vms".into()),
            tools: vec!["ping".into()],
        };
        let selection = select(&library(), &query);
        assert_eq!(keys(&selection), vec!["base", "admin", "azure", "brief", "ping"]);
    }

    #[test]
    fn page_patterns() {
        assert!(page_matches("/azure/*", "/azure/vms"));
        assert!(page_matches("/azure/*", "/azure/"));
        assert!(!page_matches("/azure/*", "/azurex"));
        assert!(page_matches("/dashboard", "/dashboard"));
        assert!(!page_matches("/dashboard", "/dashboard/sub"));
    }

    #[test]
    fn unknown_bundle_falls_back_to_default() {
        let query = ReferenceQuery {
            bundle_key: Some("missing".into()),
            ..Default::default()
        };
        assert_eq!(select(&library(), &query).bundle_key.as_deref(), Some("main"));
    }

    #[test]
    fn no_bundle_selects_nothing() {
        let selection = select(&ReferenceLibrary::new(), &ReferenceQuery::default());
        assert!(selection.is_empty());
        assert!(selection.bundle_key.is_none());
    }

    #[test]
    fn inactive_fragments_are_skipped() {
        let library = library();
        library.deactivate_fragment("base");
        assert!(select(&library, &ReferenceQuery::default()).is_empty());
    }

    #[test]
    fn empty_predicate_list_is_unrestricted() {
        let predicates = Applicability {
            roles: Some(vec![]),
            ..Default::default()
        };
        assert!(applies(&predicates, &ReferenceQuery::default()));
    }

    #[test]
    fn selection_is_deterministic() {
        let library = library();
        let query = ReferenceQuery {
            roles: vec!["admin".into()],
            tools: vec!["ping".into()],
            ..Default::default()
        };
        let first = select(&library, &query);
        for _ in 0..10 {
            assert_eq!(select(&library, &query), first);
        }
    }
}
