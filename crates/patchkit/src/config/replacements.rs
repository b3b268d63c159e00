use std::collections::HashMap;

use crate::error::{Error, Result};

/// Replacement functions the embedder makes available to hook entries,
/// keyed by the name tables use for them.
#[derive(Debug, Clone, Default)]
pub struct Replacements {
    functions: HashMap<String, u64>,
}

impl Replacements {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, address: u64) -> &mut Self {
        self.functions.insert(name.into(), address);
        self
    }

    pub fn get(&self, name: &str) -> Option<u64> {
        self.functions.get(name).copied()
    }

    pub fn require(&self, name: &str) -> Result<u64> {
        self.get(name)
            .ok_or_else(|| Error::UnknownReplacement(name.to_string()))
    }
}

impl<S: Into<String>> FromIterator<(S, u64)> for Replacements {
    fn from_iter<I: IntoIterator<Item = (S, u64)>>(iter: I) -> Self {
        Self {
            functions: iter.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }
}
