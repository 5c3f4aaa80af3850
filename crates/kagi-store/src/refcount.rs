//! Debug-build refcount ledger.
//!
//! Every increment and decrement carries a diagnostic tag saying *why* the
//! hold exists (`queue|slot`, `clist`, `subscribe`, …). In debug builds this
//! ledger records the tagged deltas so that when a kref is finally deleted we
//! can assert the multiset balanced: for every tag added there was exactly
//! one matching remove. Deltas are staged per crank and discarded on
//! rollback, mirroring the store's savepoint discipline.

use std::collections::HashMap;

use kagi_types::KRef;

#[derive(Default)]
pub struct RefCountLedger {
    committed: HashMap<KRef, HashMap<&'static str, i64>>,
    pending: Vec<(KRef, &'static str, i64)>,
}

impl RefCountLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, kref: KRef, tag: &'static str, delta: i64) {
        self.pending.push((kref, tag, delta));
    }

    pub fn commit_crank(&mut self) {
        for (kref, tag, delta) in self.pending.drain(..) {
            *self.committed.entry(kref).or_default().entry(tag).or_insert(0) += delta;
        }
    }

    pub fn rollback_crank(&mut self) {
        self.pending.clear();
    }

    /// Net delta per tag for a kref, combining committed and in-crank state.
    pub fn balance(&self, kref: KRef) -> HashMap<&'static str, i64> {
        let mut balance = self.committed.get(&kref).cloned().unwrap_or_default();
        for (k, tag, delta) in &self.pending {
            if *k == kref {
                *balance.entry(tag).or_insert(0) += delta;
            }
        }
        balance
    }

    /// Called when a kref's record is deleted: every tag must net zero.
    pub fn assert_balanced(&mut self, kref: KRef) {
        let balance = self.balance(kref);
        let unbalanced: Vec<_> = balance.iter().filter(|(_, d)| **d != 0).collect();
        assert!(
            unbalanced.is_empty(),
            "refcount tag imbalance for {}: {:?}",
            kref,
            unbalanced
        );
        self.committed.remove(&kref);
        self.pending.retain(|(k, _, _)| *k != kref);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_balanced_lifecycle() {
        let mut ledger = RefCountLedger::new();
        let kref = KRef::object(1);
        ledger.record(kref, "queue|slot", 1);
        ledger.commit_crank();
        ledger.record(kref, "queue|slot", -1);
        ledger.record(kref, "clist", 1);
        ledger.commit_crank();
        ledger.record(kref, "clist", -1);
        ledger.commit_crank();
        ledger.assert_balanced(kref);
    }

    #[test]
    #[should_panic(expected = "refcount tag imbalance")]
    fn test_imbalance_panics() {
        let mut ledger = RefCountLedger::new();
        let kref = KRef::promise(2);
        ledger.record(kref, "subscribe", 1);
        ledger.commit_crank();
        ledger.assert_balanced(kref);
    }

    #[test]
    fn test_rollback_discards_pending() {
        let mut ledger = RefCountLedger::new();
        let kref = KRef::object(3);
        ledger.record(kref, "clist", 1);
        ledger.rollback_crank();
        ledger.assert_balanced(kref);
    }
}
