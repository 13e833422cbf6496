//! Event and identifier filters for selective reload.
//!
//! An [`EventFilter`] matches against three facets (event type, entity type
//! and id), each a list of glob patterns where `*` matches any run of
//! characters. An empty list places no constraint on its facet.

use crate::{EventType, Identifier, MutationEvent};
use serde::{Deserialize, Serialize};

/// Filter over event types, entity types and ids.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventFilter {
    #[serde(default)]
    pub event_types: Vec<String>,
    /// Matched against the identifier path joined by `/`.
    #[serde(default)]
    pub entity_types: Vec<String>,
    #[serde(default)]
    pub ids: Vec<String>,
}

impl EventFilter {
    /// A filter matching everything.
    pub fn all() -> Self {
        Self::default()
    }

    /// Restrict to the given event types.
    pub fn with_event_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.event_types = types.into_iter().map(Into::into).collect();
        self
    }

    /// Restrict to the given entity types (path patterns).
    pub fn with_entity_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.entity_types = types.into_iter().map(Into::into).collect();
        self
    }

    /// Restrict to the given ids.
    pub fn with_ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ids = ids.into_iter().map(Into::into).collect();
        self
    }

    /// Whether the filter accepts records of this event type at all.
    pub fn matches_event_type(&self, event_type: &EventType) -> bool {
        any_matches(&self.event_types, event_type.as_str())
    }

    /// Whether the filter accepts this identifier, ignoring event types.
    pub fn matches_identifier(&self, identifier: &Identifier) -> bool {
        any_matches(&self.entity_types, &identifier.joined_path())
            && any_matches(&self.ids, &identifier.id)
    }

    /// Whether the filter accepts an identifier under a given event type.
    pub fn matches(&self, event_type: &EventType, identifier: &Identifier) -> bool {
        self.matches_event_type(event_type) && self.matches_identifier(identifier)
    }

    /// Whether the filter accepts a mutation event.
    pub fn matches_event(&self, event: &MutationEvent) -> bool {
        self.matches(&event.event_type, &event.identifier)
    }
}

fn any_matches(patterns: &[String], candidate: &str) -> bool {
    patterns.is_empty() || patterns.iter().any(|p| glob_match(p, candidate))
}

/// Match `candidate` against a pattern where `*` matches any (possibly empty)
/// run of characters.
pub fn glob_match(pattern: &str, candidate: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == candidate;
    }

    let first = parts[0];
    let last = parts[parts.len() - 1];
    if !candidate.starts_with(first) {
        return false;
    }
    let mut rest = &candidate[first.len()..];

    for middle in &parts[1..parts.len() - 1] {
        match rest.find(middle) {
            Some(pos) => rest = &rest[pos + middle.len()..],
            None => return false,
        }
    }

    rest.len() >= last.len() && rest.ends_with(last)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Format;

    #[test]
    fn test_glob_match() {
        assert!(glob_match("*", ""));
        assert!(glob_match("*", "anything"));
        assert!(glob_match("providers", "providers"));
        assert!(!glob_match("providers", "provider"));
        assert!(glob_match("prov*", "providers"));
        assert!(glob_match("*ers", "providers"));
        assert!(glob_match("a/*/c", "a/b/c"));
        assert!(glob_match("a*b*c", "abc"));
        assert!(!glob_match("a*b*c", "acb"));
        assert!(!glob_match("ab*ba", "aba"));
    }

    #[test]
    fn test_empty_filter_matches_everything() {
        let filter = EventFilter::all();
        let ident = Identifier::new(["providers"], "svc1");
        assert!(filter.matches(&EventType::entities(), &ident));
        assert!(filter.matches(&EventType::defaults(), &ident));
    }

    #[test]
    fn test_facets_combine() {
        let filter = EventFilter::all()
            .with_event_types(["entities"])
            .with_entity_types(["providers*"])
            .with_ids(["svc*"]);

        let hit = Identifier::new(["providers", "internal"], "svc1");
        let wrong_id = Identifier::new(["providers"], "db1");
        let wrong_type = Identifier::new(["schemas"], "svc1");

        assert!(filter.matches(&EventType::entities(), &hit));
        assert!(!filter.matches(&EventType::defaults(), &hit));
        assert!(!filter.matches(&EventType::entities(), &wrong_id));
        assert!(!filter.matches(&EventType::entities(), &wrong_type));
    }

    #[test]
    fn test_matches_event() {
        let filter = EventFilter::all().with_ids(["svc1"]);
        let event = MutationEvent::write(
            EventType::entities(),
            Identifier::new(["providers"], "svc1"),
            b"{}".to_vec(),
            Format::Json,
        );
        assert!(filter.matches_event(&event));
    }
}
