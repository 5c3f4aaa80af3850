//! The ordered key-value contract the kernel store is built on.
//!
//! Persistence is an external collaborator: the kernel only needs an ordered
//! string map with labeled savepoints. Two implementations ship here (a
//! SQLite one for durability and a BTreeMap one for tests) and the store is
//! written against the trait so hosts can bring their own.

use thiserror::Error;

/// Failures at the storage layer.
#[derive(Debug, Error)]
pub enum KVError {
    #[error("storage backend error: {0}")]
    Backend(String),
    #[error("unknown savepoint label: {0}")]
    UnknownSavepoint(String),
}

impl From<rusqlite::Error> for KVError {
    fn from(e: rusqlite::Error) -> Self {
        KVError::Backend(e.to_string())
    }
}

/// An ordered string→string map with transactional savepoints.
///
/// Savepoints nest: rolling back to a label discards every later savepoint
/// but keeps the labeled one active, matching SQL `ROLLBACK TO`. Committing
/// releases all savepoints at or above the given label.
pub trait KVStore: Send {
    fn get(&self, key: &str) -> Result<Option<String>, KVError>;
    fn set(&mut self, key: &str, value: &str) -> Result<(), KVError>;
    fn delete(&mut self, key: &str) -> Result<(), KVError>;

    /// All keys starting with `prefix`, in lexicographic order.
    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, KVError>;

    fn create_savepoint(&mut self, label: &str) -> Result<(), KVError>;
    fn rollback_to_savepoint(&mut self, label: &str) -> Result<(), KVError>;

    /// Release the labeled savepoint and everything nested inside it,
    /// committing their effects to the enclosing scope.
    fn release_savepoint(&mut self, label: &str) -> Result<(), KVError>;
}

// ============================================================================
// Tests: shared contract suite run against both implementations
// ============================================================================

#[cfg(test)]
pub(crate) mod contract {
    use super::*;

    pub fn basic_ops(kv: &mut dyn KVStore) {
        assert_eq!(kv.get("a").unwrap(), None);
        kv.set("a", "1").unwrap();
        kv.set("b", "2").unwrap();
        assert_eq!(kv.get("a").unwrap().as_deref(), Some("1"));
        kv.set("a", "3").unwrap();
        assert_eq!(kv.get("a").unwrap().as_deref(), Some("3"));
        kv.delete("a").unwrap();
        assert_eq!(kv.get("a").unwrap(), None);
        // deleting a missing key is not an error
        kv.delete("a").unwrap();
    }

    pub fn prefix_iteration(kv: &mut dyn KVStore) {
        kv.set("clist.v1.e2k.o+1", "ko1").unwrap();
        kv.set("clist.v1.e2k.o+2", "ko2").unwrap();
        kv.set("clist.v2.e2k.o+1", "ko3").unwrap();
        kv.set("clist.v1.k2e.ko1", "R o+1").unwrap();
        let keys = kv.keys_with_prefix("clist.v1.e2k.").unwrap();
        assert_eq!(keys, vec!["clist.v1.e2k.o+1", "clist.v1.e2k.o+2"]);
        assert!(kv.keys_with_prefix("clist.v9.").unwrap().is_empty());
    }

    pub fn savepoint_rollback(kv: &mut dyn KVStore) {
        kv.set("x", "before").unwrap();
        kv.create_savepoint("crank").unwrap();
        kv.set("x", "during").unwrap();
        kv.set("y", "new").unwrap();
        kv.delete("x").unwrap();
        kv.rollback_to_savepoint("crank").unwrap();
        assert_eq!(kv.get("x").unwrap().as_deref(), Some("before"));
        assert_eq!(kv.get("y").unwrap(), None);
        // savepoint is still active after rollback; mutate and commit
        kv.set("z", "kept").unwrap();
        kv.release_savepoint("crank").unwrap();
        assert_eq!(kv.get("z").unwrap().as_deref(), Some("kept"));
    }

    pub fn nested_savepoints(kv: &mut dyn KVStore) {
        kv.create_savepoint("crank").unwrap();
        kv.set("a", "1").unwrap();
        kv.create_savepoint("inner").unwrap();
        kv.set("a", "2").unwrap();
        kv.rollback_to_savepoint("inner").unwrap();
        assert_eq!(kv.get("a").unwrap().as_deref(), Some("1"));
        kv.release_savepoint("crank").unwrap();
        assert_eq!(kv.get("a").unwrap().as_deref(), Some("1"));
    }

    pub fn rollback_unknown_label_fails(kv: &mut dyn KVStore) {
        assert!(kv.rollback_to_savepoint("nope").is_err());
    }
}
