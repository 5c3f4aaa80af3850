//! In-memory KV backend for tests and ephemeral kernels.

use std::collections::BTreeMap;
use std::ops::Bound;

use crate::kv::{KVError, KVStore};

/// BTreeMap-backed [`KVStore`] with a savepoint snapshot stack.
#[derive(Default)]
pub struct MemoryKVStore {
    map: BTreeMap<String, String>,
    /// (label, snapshot at creation), innermost last.
    savepoints: Vec<(String, BTreeMap<String, String>)>,
}

impl MemoryKVStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn find_label(&self, label: &str) -> Result<usize, KVError> {
        self.savepoints
            .iter()
            .rposition(|(l, _)| l == label)
            .ok_or_else(|| KVError::UnknownSavepoint(label.to_string()))
    }
}

impl KVStore for MemoryKVStore {
    fn get(&self, key: &str) -> Result<Option<String>, KVError> {
        Ok(self.map.get(key).cloned())
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), KVError> {
        self.map.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&mut self, key: &str) -> Result<(), KVError> {
        self.map.remove(key);
        Ok(())
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, KVError> {
        Ok(self
            .map
            .range::<String, _>((Bound::Included(prefix.to_string()), Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    fn create_savepoint(&mut self, label: &str) -> Result<(), KVError> {
        self.savepoints.push((label.to_string(), self.map.clone()));
        Ok(())
    }

    fn rollback_to_savepoint(&mut self, label: &str) -> Result<(), KVError> {
        let idx = self.find_label(label)?;
        self.map = self.savepoints[idx].1.clone();
        // the labeled savepoint stays active; everything nested is gone
        self.savepoints.truncate(idx + 1);
        Ok(())
    }

    fn release_savepoint(&mut self, label: &str) -> Result<(), KVError> {
        let idx = self.find_label(label)?;
        self.savepoints.truncate(idx);
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::contract;

    #[test]
    fn test_basic_ops() {
        contract::basic_ops(&mut MemoryKVStore::new());
    }

    #[test]
    fn test_prefix_iteration() {
        contract::prefix_iteration(&mut MemoryKVStore::new());
    }

    #[test]
    fn test_savepoint_rollback() {
        contract::savepoint_rollback(&mut MemoryKVStore::new());
    }

    #[test]
    fn test_nested_savepoints() {
        contract::nested_savepoints(&mut MemoryKVStore::new());
    }

    #[test]
    fn test_rollback_unknown_label_fails() {
        contract::rollback_unknown_label_fails(&mut MemoryKVStore::new());
    }
}
