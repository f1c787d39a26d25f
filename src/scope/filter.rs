//! Effective scope computation.

use super::ScopeSet;

/// Scopes to request from the upstream authorization server.
///
/// With no allowlist (or an empty one) every declared scope is requested.
/// Otherwise the request is `declared ∩ allowlist`. Operations needing scopes
/// outside the result stay registered and fail enforcement at call time.
#[must_use]
pub fn effective_scopes(declared: &ScopeSet, allowlist: Option<&ScopeSet>) -> ScopeSet {
    match allowlist {
        Some(allowed) if !allowed.is_empty() => declared.intersection(allowed).cloned().collect(),
        _ => declared.clone(),
    }
}

/// Parse a space-separated scope list (`REDMINE_SCOPES`, token `scope` field).
///
/// Returns `None` for an absent or blank value.
#[must_use]
pub fn parse_scope_list(value: Option<&str>) -> Option<ScopeSet> {
    let scopes: ScopeSet = value?.split_whitespace().map(str::to_string).collect();
    if scopes.is_empty() { None } else { Some(scopes) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::{ADD_ISSUES, SEARCH_PROJECT, VIEW_ISSUES, VIEW_PROJECT, scope_set};

    fn declared() -> ScopeSet {
        scope_set([VIEW_ISSUES, SEARCH_PROJECT, VIEW_PROJECT])
    }

    #[test]
    fn absent_allowlist_requests_everything_declared() {
        assert_eq!(effective_scopes(&declared(), None), declared());
    }

    #[test]
    fn empty_allowlist_is_treated_as_absent() {
        assert_eq!(effective_scopes(&declared(), Some(&ScopeSet::new())), declared());
    }

    #[test]
    fn allowlist_narrows_to_intersection() {
        let allow = scope_set([VIEW_ISSUES]);
        assert_eq!(
            effective_scopes(&declared(), Some(&allow)),
            scope_set([VIEW_ISSUES])
        );
    }

    #[test]
    fn allowlist_never_widens() {
        // ADD_ISSUES is allowed but not declared by any operation
        let allow = scope_set([VIEW_ISSUES, ADD_ISSUES]);
        let effective = effective_scopes(&declared(), Some(&allow));

        assert!(effective.is_subset(&declared()));
        assert!(!effective.contains(ADD_ISSUES));
    }

    #[test]
    fn containment_holds_across_combinations() {
        let universe = [VIEW_ISSUES, SEARCH_PROJECT, VIEW_PROJECT, ADD_ISSUES];
        // every subset of the universe as declared × every subset as allowlist
        for d in 0u8..16 {
            for a in 0u8..16 {
                let pick = |mask: u8| -> ScopeSet {
                    universe
                        .iter()
                        .enumerate()
                        .filter(|(i, _)| mask & (1 << i) != 0)
                        .map(|(_, s)| (*s).to_string())
                        .collect()
                };
                let (declared, allow) = (pick(d), pick(a));

                let effective = effective_scopes(&declared, Some(&allow));
                assert!(effective.is_subset(&declared));
                assert_eq!(effective_scopes(&declared, None), declared);
            }
        }
    }

    #[test]
    fn parse_scope_list_splits_on_whitespace() {
        assert_eq!(
            parse_scope_list(Some("view_issues  search_project\tview_project")),
            Some(scope_set([VIEW_ISSUES, SEARCH_PROJECT, VIEW_PROJECT]))
        );
    }

    #[test]
    fn parse_scope_list_blank_is_none() {
        assert_eq!(parse_scope_list(None), None);
        assert_eq!(parse_scope_list(Some("   ")), None);
    }
}
