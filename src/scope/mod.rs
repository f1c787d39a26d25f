//! OAuth scope declarations, registry and request filtering.
//!
//! Every operation declares the upstream scopes it needs when it is
//! registered. Once all operations are in, the registry is frozen and the
//! union of declared scopes, optionally narrowed by the operator allowlist,
//! becomes the `scope` parameter of the upstream authorization request.

pub mod filter;
pub mod registry;

use std::collections::BTreeSet;

pub use filter::{effective_scopes, parse_scope_list};
pub use registry::{ScopeRegistry, ScopeRequirement};

/// A set of scope identifiers. Ordered so scope strings are deterministic.
pub type ScopeSet = BTreeSet<String>;

// --- Redmine scope identifiers ---

/// Read project metadata, trackers and versions
pub const VIEW_PROJECT: &str = "view_project";
/// Read issues, relations, statuses and priorities
pub const VIEW_ISSUES: &str = "view_issues";
/// Full-text search (`/search.json`, project-scoped search)
pub const SEARCH_PROJECT: &str = "search_project";
/// Create issues
pub const ADD_ISSUES: &str = "add_issues";
/// Update issues
pub const EDIT_ISSUES: &str = "edit_issues";
/// Read time entries
pub const VIEW_TIME_ENTRIES: &str = "view_time_entries";

/// Build a [`ScopeSet`] from string slices.
pub fn scope_set<I, S>(scopes: I) -> ScopeSet
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    scopes.into_iter().map(Into::into).collect()
}

/// Render a scope set as the space-separated OAuth `scope` value.
#[must_use]
pub fn format_scope_list(scopes: &ScopeSet) -> String {
    scopes.iter().map(String::as_str).collect::<Vec<_>>().join(" ")
}
