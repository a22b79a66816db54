use rustc_hash::FxHashMap;

use crate::value::Value;

/// Write-intent edits that filters want applied to the outgoing wire form.
///
/// Kept separate from [`Metadata`](crate::Metadata): metadata records what was
/// decoded, a mutation records what should be changed before sending.
#[derive(Clone, Debug, Default)]
pub struct Mutation {
    entries: FxHashMap<String, Value>,
}

impl Mutation {
    /// Creates an empty mutation.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a typed edit.
    pub fn put(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.entries.insert(key.into(), value.into());
    }

    /// Records a string edit.
    pub fn put_string(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), Value::String(value.into()));
    }

    /// Returns an edit by key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    /// Returns `true` when no edits were recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of recorded edits.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Iterates over the edits whose values are strings, sorted by key so
    /// encoders produce deterministic output.
    pub fn string_entries(&self) -> impl Iterator<Item = (&str, &str)> {
        let mut pairs: Vec<_> = self
            .entries
            .iter()
            .filter_map(|(key, value)| value.as_str().map(|value| (key.as_str(), value)))
            .collect();
        pairs.sort_unstable_by(|a, b| a.0.cmp(b.0));
        pairs.into_iter()
    }
}
