use std::collections::BTreeSet;

/// Tracks which cover assets are required, already loaded, and still needed.
///
/// After every [`recompute`](Self::recompute):
/// - `needed ∩ loaded = ∅`
/// - `needed ∪ loaded ⊇ required`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssetTracker {
    required: BTreeSet<String>,
    loaded: BTreeSet<String>,
    needed: BTreeSet<String>,
}

impl AssetTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a new required set and derive `loaded` and `needed` from it.
    ///
    /// Loaded keys that are no longer required are evicted. Returns `true`
    /// if the needed set changed.
    pub fn recompute(&mut self, required: BTreeSet<String>) -> bool {
        self.loaded.retain(|key| required.contains(key));
        let needed: BTreeSet<String> = required.difference(&self.loaded).cloned().collect();
        self.required = required;

        let changed = needed != self.needed;
        self.needed = needed;
        changed
    }

    /// Record that data for `key` arrived. Returns `false` (and changes
    /// nothing) when the key is not currently required.
    pub fn mark_loaded(&mut self, key: &str) -> bool {
        if !self.required.contains(key) {
            return false;
        }
        self.loaded.insert(key.to_owned());
        self.needed.remove(key);
        true
    }

    pub fn clear(&mut self) {
        self.required.clear();
        self.loaded.clear();
        self.needed.clear();
    }

    pub fn required(&self) -> &BTreeSet<String> {
        &self.required
    }

    pub fn loaded(&self) -> &BTreeSet<String> {
        &self.loaded
    }

    pub fn needed(&self) -> &BTreeSet<String> {
        &self.needed
    }

    pub fn is_loaded(&self, key: &str) -> bool {
        self.loaded.contains(key)
    }
}
