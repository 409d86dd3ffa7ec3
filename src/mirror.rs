use std::collections::BTreeSet;

use serde_json::Value;

use crate::protocol::{asset_key, FieldMap, DECK_CONTENT_FIELDS};

/// The server's authoritative copy of controller field values.
///
/// Exists only between an accepted `init` and the next reset.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateMirror {
    fields: FieldMap,
}

impl StateMirror {
    pub fn from_snapshot(fields: FieldMap) -> Self {
        Self { fields }
    }

    /// Set a single field. Returns `true` if the stored value changed.
    pub fn apply(&mut self, field: impl Into<String>, value: Value) -> bool {
        let field = field.into();
        if self.fields.get(&field) == Some(&value) {
            return false;
        }
        self.fields.insert(field, value);
        true
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn fields(&self) -> &FieldMap {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Asset keys referenced by the deck content fields, empty paths excluded.
    pub fn required_assets(&self) -> BTreeSet<String> {
        DECK_CONTENT_FIELDS
            .iter()
            .filter_map(|field| self.fields.get(*field))
            .filter_map(asset_key)
            .map(str::to_owned)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn apply_is_idempotent() {
        let mut mirror = StateMirror::default();
        assert!(mirror.apply("mixer", json!({ "xFader": 0.5 })));
        let after_first = mirror.clone();
        assert!(!mirror.apply("mixer", json!({ "xFader": 0.5 })));
        assert_eq!(mirror, after_first);
    }

    #[test]
    fn apply_replaces_whole_field_value() {
        let mut mirror = StateMirror::default();
        mirror.apply("deck0content", json!({ "filePath": "/a.mp3", "title": "A" }));
        mirror.apply("deck0content", json!({ "filePath": "/b.mp3" }));
        assert_eq!(
            mirror.get("deck0content"),
            Some(&json!({ "filePath": "/b.mp3" }))
        );
    }

    #[test]
    fn required_assets_from_deck_fields_only() {
        let mut mirror = StateMirror::default();
        mirror.apply("deck0content", json!({ "filePath": "/a.mp3" }));
        mirror.apply("deck1content", json!({ "filePath": "" }));
        mirror.apply("deck2content", json!({ "filePath": "/c.mp3" }));
        mirror.apply("mixer", json!({ "filePath": "/not-a-deck.mp3" }));

        let required = mirror.required_assets();
        assert_eq!(
            required.into_iter().collect::<Vec<_>>(),
            vec!["/a.mp3".to_string(), "/c.mp3".to_string()]
        );
    }

    #[test]
    fn same_track_on_two_decks_is_one_asset() {
        let mut mirror = StateMirror::default();
        mirror.apply("deck0content", json!({ "filePath": "/a.mp3" }));
        mirror.apply("deck3content", json!({ "filePath": "/a.mp3" }));
        assert_eq!(mirror.required_assets().len(), 1);
    }
}
