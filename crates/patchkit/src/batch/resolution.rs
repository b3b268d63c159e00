use std::collections::HashMap;

use crate::error::{Error, Result};

/// Addresses produced by earlier requests of a batch, keyed by name.
///
/// Each key is written at most once per load and may be read any number of
/// times afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolutionTable {
    entries: HashMap<String, u64>,
}

impl ResolutionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, address: u64) -> Result<()> {
        let key = key.into();
        if self.entries.contains_key(&key) {
            return Err(Error::DuplicateKey(key));
        }
        self.entries.insert(key, address);
        Ok(())
    }

    /// Fail early if `key` was already written
    pub fn ensure_vacant(&self, key: &str) -> Result<()> {
        if self.entries.contains_key(key) {
            return Err(Error::DuplicateKey(key.to_string()));
        }
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<u64> {
        self.entries.get(key).copied()
    }

    pub fn require(&self, key: &str) -> Result<u64> {
        self.get(key)
            .ok_or_else(|| Error::UnresolvedKey(key.to_string()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_once() {
        let mut table = ResolutionTable::new();
        table.insert("orgAsicCapsTable", 0x1000).unwrap();
        assert!(matches!(
            table.insert("orgAsicCapsTable", 0x2000),
            Err(Error::DuplicateKey(_))
        ));
        assert_eq!(table.get("orgAsicCapsTable"), Some(0x1000));
        assert!(table.ensure_vacant("orgAsicCapsTable").is_err());
    }

    #[test]
    fn test_require_missing_key() {
        let table = ResolutionTable::new();
        assert!(table.is_empty());
        assert!(matches!(table.require("x"), Err(Error::UnresolvedKey(k)) if k == "x"));
    }
}
