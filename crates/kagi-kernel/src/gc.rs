//! Cross-endpoint garbage collection.
//!
//! Refcount transitions feed a per-crank maybe-free set; this module turns
//! that set into batched drop/retire actions, applies the vat-originated GC
//! syscalls, and settles object state as actions are delivered.
//!
//! Signal order for one object: `dropExports` tells the owner to release its
//! strong hold (the object is unreachable everywhere else), `retireExports`
//! tells it the object is also unrecognizable and the kernel record is gone.
//! `retireImports` tells importers their peer abandoned the object. Drops
//! always precede retires for the same kref, and actions aimed at a
//! terminated endpoint are skipped.

use tracing::{debug, trace};

use kagi_store::KernelStore;
use kagi_types::{EndpointId, GCAction, GCActionKind, KRef, KernelError};

/// Is this endpoint past the point of receiving GC signals?
pub fn endpoint_terminated(store: &KernelStore, endpoint: EndpointId) -> Result<bool, KernelError> {
    match endpoint {
        EndpointId::Vat(vat) => match store.vat_state(vat) {
            Ok(state) => Ok(!state.is_live()),
            Err(KernelError::VatNotFound(_)) => Ok(true),
            Err(e) => Err(e),
        },
        EndpointId::Remote(remote) => match store.remote_incarnation(remote) {
            Ok(_) => Ok(false),
            Err(KernelError::RemoteNotFound(_)) => Ok(true),
            Err(e) => Err(e),
        },
        EndpointId::Kernel => Ok(false),
    }
}

/// Re-examine one object whose holds or recognizers changed, scheduling
/// whatever signal its state now warrants.
pub(crate) fn examine_object(store: &mut KernelStore, kref: KRef) -> Result<(), KernelError> {
    if !store.has_kernel_object(kref)? {
        return Ok(());
    }
    let record = store.get_kernel_object(kref)?;
    if record.ref_count > 0 {
        return Ok(());
    }
    let owner_live = !endpoint_terminated(store, record.owner)?
        && store.kref_to_eref(record.owner, kref)?.is_some();
    if !owner_live {
        // abandoned or orphaned export: no one to signal
        if record.recognizable == 0 {
            debug!(%kref, "orphaned object collected");
            store.delete_kernel_object(kref)?;
        }
        return Ok(());
    }
    if record.reachable {
        store.add_gc_actions(GCActionKind::DropExports, record.owner, [kref])?;
        if record.recognizable == 0 {
            store.add_gc_actions(GCActionKind::RetireExports, record.owner, [kref])?;
        }
    } else if record.recognizable == 0 {
        store.add_gc_actions(GCActionKind::RetireExports, record.owner, [kref])?;
    }
    Ok(())
}

/// Drain the maybe-free set, scheduling actions and collecting dead
/// promises. Promise deletion releases `data|slot` holds, which can cascade;
/// the loop runs until the set stays empty.
pub fn process_maybe_free(store: &mut KernelStore) -> Result<(), KernelError> {
    loop {
        let set = store.take_maybe_free();
        if set.is_empty() {
            return Ok(());
        }
        for kref in set {
            if kref.is_promise() {
                collect_promise(store, kref)?;
            } else {
                examine_object(store, kref)?;
            }
        }
    }
}

fn collect_promise(store: &mut KernelStore, kpid: KRef) -> Result<(), KernelError> {
    if !store.has_kernel_promise(kpid)? {
        return Ok(());
    }
    let record = store.get_kernel_promise(kpid)?;
    if record.ref_count > 0 {
        return Ok(());
    }
    trace!(%kpid, "promise collected");
    let slots: Vec<KRef> = record
        .value
        .as_ref()
        .map(|data| data.slots.clone())
        .unwrap_or_default();
    store.delete_kernel_promise(kpid)?;
    for slot in slots {
        store.decrement_ref_count(slot, "data|slot")?;
    }
    Ok(())
}

/// Drop the krefs of a pending action that no longer warrant it; a batch can
/// go stale between scheduling and service.
pub fn filter_gc_action(store: &KernelStore, action: &GCAction) -> Result<Vec<KRef>, KernelError> {
    let mut eligible = Vec::new();
    for &kref in &action.krefs {
        if !store.has_kernel_object(kref)? {
            continue;
        }
        let record = store.get_kernel_object(kref)?;
        let ok = match action.kind {
            GCActionKind::DropExports => {
                record.ref_count == 0
                    && record.reachable
                    && store.kref_to_eref(action.endpoint, kref)?.is_some()
            }
            GCActionKind::RetireExports => {
                record.ref_count == 0 && !record.reachable && record.recognizable == 0
            }
            GCActionKind::RetireImports => store.kref_to_eref(action.endpoint, kref)?.is_some(),
        };
        if ok {
            eligible.push(kref);
        }
    }
    Ok(eligible)
}

/// Settle kernel state after an action was delivered (or splatted at a
/// terminated endpoint with `delivered == false`).
pub fn settle_gc_action(
    store: &mut KernelStore,
    action: &GCAction,
    krefs: &[KRef],
) -> Result<(), KernelError> {
    for &kref in krefs {
        match action.kind {
            GCActionKind::DropExports => {
                let mut record = store.get_kernel_object(kref)?;
                record.reachable = false;
                store.set_kernel_object(kref, &record)?;
            }
            GCActionKind::RetireExports => {
                store.forget_kref(action.endpoint, kref)?;
                store.delete_kernel_object(kref)?;
            }
            GCActionKind::RetireImports => {
                retire_one_import(store, action.endpoint, kref)?;
            }
        }
    }
    Ok(())
}

fn retire_one_import(
    store: &mut KernelStore,
    endpoint: EndpointId,
    kref: KRef,
) -> Result<(), KernelError> {
    let held = store.clist_reachable(endpoint, kref)?;
    store.forget_kref(endpoint, kref)?;
    let mut record = store.get_kernel_object(kref)?;
    record.recognizable = record.recognizable.saturating_sub(1);
    store.set_kernel_object(kref, &record)?;
    if held {
        store.decrement_ref_count(kref, "clist")?;
    }
    examine_object(store, kref)?;
    Ok(())
}

// ── Vat-originated GC syscalls ──────────────────────────────────────────────

/// `dropImports`: the vat released its strong hold but may still recognize.
pub fn syscall_drop_imports(
    store: &mut KernelStore,
    endpoint: EndpointId,
    krefs: &[KRef],
) -> Result<(), KernelError> {
    for &kref in krefs {
        if store.kref_to_eref(endpoint, kref)?.is_none() {
            return Err(KernelError::UnknownKref(kref));
        }
        if store.clist_reachable(endpoint, kref)? {
            store.set_clist_reachable(endpoint, kref, false)?;
            store.decrement_ref_count(kref, "clist")?;
        }
    }
    Ok(())
}

/// `retireImports`: the vat stops recognizing refs it already dropped.
pub fn syscall_retire_imports(
    store: &mut KernelStore,
    endpoint: EndpointId,
    krefs: &[KRef],
) -> Result<(), KernelError> {
    for &kref in krefs {
        if store.kref_to_eref(endpoint, kref)?.is_none() {
            return Err(KernelError::UnknownKref(kref));
        }
        if store.clist_reachable(endpoint, kref)? {
            return Err(KernelError::Protocol(format!(
                "retireImports on {kref} before dropImports"
            )));
        }
        store.forget_kref(endpoint, kref)?;
        let mut record = store.get_kernel_object(kref)?;
        record.recognizable = record.recognizable.saturating_sub(1);
        store.set_kernel_object(kref, &record)?;
        examine_object(store, kref)?;
    }
    Ok(())
}

/// `retireExports`: the owner abandons exports outright; importers that can
/// still recognize them get `retireImports`.
pub fn syscall_retire_exports(
    store: &mut KernelStore,
    endpoint: EndpointId,
    krefs: &[KRef],
) -> Result<(), KernelError> {
    for &kref in krefs {
        let record = store.get_kernel_object(kref)?;
        if record.owner != endpoint {
            return Err(KernelError::Protocol(format!(
                "retireExports on {kref} by non-owner {endpoint}"
            )));
        }
        store.forget_kref(endpoint, kref)?;
        let mut record = record;
        record.reachable = false;
        store.set_kernel_object(kref, &record)?;
        let importers = store.importers_of(kref, endpoint)?;
        let mut any_signal = false;
        for importer in importers {
            if endpoint_terminated(store, importer)? {
                continue;
            }
            store.add_gc_actions(GCActionKind::RetireImports, importer, [kref])?;
            any_signal = true;
        }
        if !any_signal && record.ref_count == 0 && record.recognizable == 0 {
            store.delete_kernel_object(kref)?;
        }
    }
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translator;
    use kagi_store::MemoryKVStore;
    use kagi_types::{ERef, VatConfig, VatId, VatState};

    fn store_with_vats(n: u64) -> KernelStore {
        let mut store = KernelStore::new(Box::new(MemoryKVStore::new()));
        for _ in 0..n {
            let vat = store.get_next_vat_id().unwrap();
            store
                .add_vat(vat, &VatConfig::from_name("test"), None)
                .unwrap();
            store.set_vat_state(vat, VatState::Running).unwrap();
        }
        store
    }

    fn vat(n: u64) -> EndpointId {
        EndpointId::Vat(VatId::new(n))
    }

    fn eref(s: &str) -> ERef {
        s.parse().unwrap()
    }

    /// Alice exports an object, it travels to bob through a queued slot.
    fn exported_to_bob(store: &mut KernelStore) -> KRef {
        let kref = translator::eref_to_kref(store, vat(1), eref("o+0")).unwrap();
        store.increment_ref_count(kref, "queue|slot").unwrap();
        translator::kref_to_eref(store, vat(2), kref, "queue|slot").unwrap();
        kref
    }

    #[test]
    fn test_drop_then_retire_sequence() {
        let mut store = store_with_vats(2);
        let kref = exported_to_bob(&mut store);

        // bob drops: refcount 0, still recognizable
        syscall_drop_imports(&mut store, vat(2), &[kref]).unwrap();
        process_maybe_free(&mut store).unwrap();
        let action = store.next_gc_action().unwrap().unwrap();
        assert_eq!(action.kind, GCActionKind::DropExports);
        assert_eq!(action.endpoint, vat(1));
        assert_eq!(filter_gc_action(&store, &action).unwrap(), vec![kref]);
        settle_gc_action(&mut store, &action, &[kref]).unwrap();
        assert!(!store.get_kernel_object(kref).unwrap().reachable);

        // bob retires: recognizable 0 → retireExports to alice, record dies
        syscall_retire_imports(&mut store, vat(2), &[kref]).unwrap();
        let action = store.next_gc_action().unwrap().unwrap();
        assert_eq!(action.kind, GCActionKind::RetireExports);
        let eligible = filter_gc_action(&store, &action).unwrap();
        settle_gc_action(&mut store, &action, &eligible).unwrap();
        assert!(!store.has_kernel_object(kref).unwrap());
        assert_eq!(store.kref_to_eref(vat(1), kref).unwrap(), None);
    }

    #[test]
    fn test_retire_before_drop_is_protocol_error() {
        let mut store = store_with_vats(2);
        let kref = exported_to_bob(&mut store);
        assert!(matches!(
            syscall_retire_imports(&mut store, vat(2), &[kref]),
            Err(KernelError::Protocol(_))
        ));
    }

    #[test]
    fn test_regained_hold_makes_drop_stale() {
        let mut store = store_with_vats(2);
        let kref = exported_to_bob(&mut store);
        syscall_drop_imports(&mut store, vat(2), &[kref]).unwrap();
        process_maybe_free(&mut store).unwrap();

        // before the action is serviced, a new message re-cites the object
        store.increment_ref_count(kref, "queue|slot").unwrap();
        let action = store.next_gc_action().unwrap().unwrap();
        assert!(filter_gc_action(&store, &action).unwrap().is_empty());
        // rebalance for the ledger
        store.decrement_ref_count(kref, "queue|slot").unwrap();
    }

    #[test]
    fn test_owner_abandonment_retires_importers() {
        let mut store = store_with_vats(2);
        let kref = exported_to_bob(&mut store);

        syscall_retire_exports(&mut store, vat(1), &[kref]).unwrap();
        let action = store.next_gc_action().unwrap().unwrap();
        assert_eq!(action.kind, GCActionKind::RetireImports);
        assert_eq!(action.endpoint, vat(2));
        let eligible = filter_gc_action(&store, &action).unwrap();
        assert_eq!(eligible, vec![kref]);
        settle_gc_action(&mut store, &action, &eligible).unwrap();

        // bob's hold released, record fully collected
        assert!(!store.has_kernel_object(kref).unwrap());
        assert_eq!(store.kref_to_eref(vat(2), kref).unwrap(), None);
    }

    #[test]
    fn test_actions_skip_terminated_endpoint() {
        let mut store = store_with_vats(2);
        let kref = exported_to_bob(&mut store);
        syscall_drop_imports(&mut store, vat(2), &[kref]).unwrap();
        process_maybe_free(&mut store).unwrap();

        store
            .set_vat_state(VatId::new(1), VatState::Terminated)
            .unwrap();
        assert!(endpoint_terminated(&store, vat(1)).unwrap());
        let action = store.next_gc_action().unwrap().unwrap();
        // the run loop checks the endpoint before filtering krefs
        assert_eq!(action.endpoint, vat(1));
    }

    #[test]
    fn test_dead_promise_releases_value_slots() {
        let mut store = store_with_vats(2);
        let object = translator::eref_to_kref(&mut store, vat(1), eref("o+0")).unwrap();
        let (kpid, _) = store.init_kernel_promise(None).unwrap();

        // resolved promise whose value cites the object
        store.increment_ref_count(object, "data|slot").unwrap();
        store
            .resolve_kernel_promise(kpid, false, kagi_types::CapData::new("\"@0\"", vec![object]))
            .unwrap();

        // last holder of the promise lets go
        store.increment_ref_count(kpid, "queue|result").unwrap();
        store.decrement_ref_count(kpid, "queue|result").unwrap();
        process_maybe_free(&mut store).unwrap();

        assert!(!store.has_kernel_promise(kpid).unwrap());
        // the cascade reached the object: its last hold is gone, so the
        // owner is told to drop (and retire, nobody recognizes it)
        let action = store.next_gc_action().unwrap().unwrap();
        assert_eq!(action.kind, GCActionKind::DropExports);
        assert_eq!(action.endpoint, vat(1));
        assert_eq!(action.krefs, vec![object]);
        let retire = store.next_gc_action().unwrap().unwrap();
        assert_eq!(retire.kind, GCActionKind::RetireExports);
    }
}
