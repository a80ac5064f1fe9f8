//! Deterministic layer naming.

use std::collections::HashMap;

/// Issues `"{kind}_{n}"` names with one sequential counter per layer kind.
///
/// Owned by a [`Model`](super::model::Model), so two models never share counters.
#[derive(Debug, Default, Clone)]
pub struct LayerRegistry {
    counters: HashMap<String, usize>,
}

impl LayerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_name(&mut self, kind: &str) -> String {
        let counter = self.counters.entry(kind.to_string()).or_insert(0);
        let name = format!("{}_{}", kind, counter);
        *counter += 1;
        name
    }

    /// Names issued so far for `kind`.
    pub fn count(&self, kind: &str) -> usize {
        self.counters.get(kind).copied().unwrap_or(0)
    }
}
