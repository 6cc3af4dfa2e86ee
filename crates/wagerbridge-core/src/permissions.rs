//! Tagged capability set replacing glob-matched permission strings
//! (Design note 1: "Dynamic permission lists → tagged capability set").
//!
//! Permissions are still stored and transmitted as `resource:action`
//! strings (spec.md §3's ApiKey), but parsed once into a typed
//! `PermissionSet` with a precomputed fast-path lookup, rather than
//! re-matching glob patterns on every check.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

const WILDCARD: &str = "*";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Permission {
    pub resource: String,
    pub action: String,
}

impl Permission {
    pub fn new(resource: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            action: action.into(),
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.resource, self.action)
    }
}

/// Parses `resource:action` strings (with `*` wildcards on either side)
/// once and offers O(1)-ish grant checks afterward.
#[derive(Debug, Clone, Default)]
pub struct PermissionSet {
    exact: HashSet<(String, String)>,
    all_resources_for_action: HashSet<String>,
    all_actions_for_resource: HashSet<String>,
    full_wildcard: bool,
}

impl PermissionSet {
    pub fn parse(raw: &[String]) -> Self {
        let mut set = Self::default();
        for entry in raw {
            let Some((resource, action)) = entry.split_once(':') else {
                continue;
            };
            match (resource, action) {
                (WILDCARD, WILDCARD) => set.full_wildcard = true,
                (WILDCARD, action) => {
                    set.all_resources_for_action.insert(action.to_string());
                }
                (resource, WILDCARD) => {
                    set.all_actions_for_resource.insert(resource.to_string());
                }
                (resource, action) => {
                    set.exact.insert((resource.to_string(), action.to_string()));
                }
            }
        }
        set
    }

    /// Grant iff one of: `*:*`, `resource:*`, `*:action`, or an exact
    /// `resource:action` match exists (spec.md §4.C stage 4).
    pub fn is_granted(&self, resource: &str, action: &str) -> bool {
        self.full_wildcard
            || self.all_actions_for_resource.contains(resource)
            || self.all_resources_for_action.contains(action)
            || self
                .exact
                .contains(&(resource.to_string(), action.to_string()))
    }

    pub fn is_empty(&self) -> bool {
        !self.full_wildcard
            && self.all_resources_for_action.is_empty()
            && self.all_actions_for_resource.is_empty()
            && self.exact.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_match_grants() {
        let set = PermissionSet::parse(&["wallet:read".to_string()]);
        assert!(set.is_granted("wallet", "read"));
        assert!(!set.is_granted("wallet", "write"));
    }

    #[test]
    fn resource_wildcard_grants_any_action() {
        let set = PermissionSet::parse(&["wallet:*".to_string()]);
        assert!(set.is_granted("wallet", "read"));
        assert!(set.is_granted("wallet", "bet"));
        assert!(!set.is_granted("games", "read"));
    }

    #[test]
    fn action_wildcard_grants_any_resource() {
        let set = PermissionSet::parse(&["*:read".to_string()]);
        assert!(set.is_granted("wallet", "read"));
        assert!(set.is_granted("games", "read"));
        assert!(!set.is_granted("wallet", "write"));
    }

    #[test]
    fn full_wildcard_grants_everything() {
        let set = PermissionSet::parse(&["*:*".to_string()]);
        assert!(set.is_granted("wallet", "bet"));
        assert!(set.is_granted("anything", "anything"));
    }

    #[test]
    fn empty_set_denies_everything() {
        let set = PermissionSet::parse(&[]);
        assert!(set.is_empty());
        assert!(!set.is_granted("wallet", "read"));
    }
}
