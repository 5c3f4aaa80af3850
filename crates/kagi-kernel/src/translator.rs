//! C-list translation between endpoint-local and kernel-global namespaces.
//!
//! Inbound (syscall) translation turns erefs into krefs, allocating kernel
//! records for first-time exports. Outbound (delivery) translation turns
//! krefs into erefs, minting `-`-polarity erefs for first-time imports.
//!
//! Refcount discipline at this layer:
//! - An importer's pairing holds one `clist` count; the owner's pairing for
//!   its own object holds none (otherwise exports could never die).
//! - Promise pairings hold one `clist` count on every endpoint.
//! - Outbound slot translation *transfers* the `queue|slot` hold the message
//!   carried into the importer's `clist` hold; if the importer already had a
//!   pairing, the queue hold is simply released.

use tracing::trace;

use kagi_store::KernelStore;
use kagi_types::{
    CapData, ERef, EndpointId, KRef, KernelError, Message, Polarity, RefKind, VatCapData,
    VatMessage,
};

/// Does a pairing for `kref` at `endpoint` hold a `clist` refcount?
///
/// Object pairings on the owner are free; everything else holds.
fn pairing_holds_count(store: &KernelStore, endpoint: EndpointId, kref: KRef) -> Result<bool, KernelError> {
    if kref.is_promise() {
        return Ok(true);
    }
    Ok(store.get_kernel_object(kref)?.owner != endpoint)
}

// ── Inbound: eref → kref ────────────────────────────────────────────────────

/// Translate one eref cited by a syscall, allocating kernel records for
/// first-time exports.
pub fn eref_to_kref(
    store: &mut KernelStore,
    endpoint: EndpointId,
    eref: ERef,
) -> Result<KRef, KernelError> {
    if let Some(kref) = store.eref_to_kref(endpoint, eref)? {
        return Ok(kref);
    }
    // Unknown eref: only `+`-polarity allocations may introduce entries;
    // a `-` eref the endpoint doesn't have is a forged import.
    if !eref.is_local_allocation() {
        return Err(KernelError::UnknownEref { endpoint, eref });
    }
    let kref = match eref.kind() {
        RefKind::Object => store.init_kernel_object(endpoint)?.0,
        RefKind::Promise => store.init_kernel_promise(Some(endpoint))?.0,
    };
    store.add_clist_entry(endpoint, kref, eref)?;
    if pairing_holds_count(store, endpoint, kref)? {
        store.increment_ref_count(kref, "clist")?;
    }
    trace!(%endpoint, %eref, %kref, "export allocated");
    Ok(kref)
}

/// Translate an inbound result eref. Same allocation rules as a slot, but
/// the promise must be unresolved and either new or decided by the sender
/// (a vat may only designate results it controls).
pub fn result_eref_to_kref(
    store: &mut KernelStore,
    endpoint: EndpointId,
    eref: ERef,
) -> Result<KRef, KernelError> {
    if eref.kind() != RefKind::Promise {
        return Err(KernelError::Protocol(format!(
            "result must be a promise, got {eref}"
        )));
    }
    let existing = store.eref_to_kref(endpoint, eref)?;
    let kref = eref_to_kref(store, endpoint, eref)?;
    if existing.is_some() {
        let record = store.get_kernel_promise(kref)?;
        if !record.is_unresolved() || record.decider != Some(endpoint) {
            return Err(KernelError::Protocol(format!(
                "result {eref} is not an unresolved promise decided by {endpoint}"
            )));
        }
        // while the send is queued, the kernel decides the result
        store.set_promise_decider(kref, None)?;
    } else {
        store.set_promise_decider(kref, None)?;
    }
    Ok(kref)
}

/// Translate the slots of inbound capdata.
pub fn import_capdata(
    store: &mut KernelStore,
    endpoint: EndpointId,
    data: VatCapData,
) -> Result<CapData, KernelError> {
    data.try_map_slots(|eref| eref_to_kref(store, endpoint, eref))
}

// ── Outbound: kref → eref ───────────────────────────────────────────────────

/// Translate one kref for delivery into `endpoint`, minting a fresh
/// `-`-polarity eref if the endpoint has never seen it.
///
/// `held_tag` is the queue hold the citation carried (e.g. `queue|slot`);
/// it is transferred to (or released against) the pairing's `clist` hold.
pub fn kref_to_eref(
    store: &mut KernelStore,
    endpoint: EndpointId,
    kref: KRef,
    held_tag: &'static str,
) -> Result<ERef, KernelError> {
    if let Some(eref) = store.kref_to_eref(endpoint, kref)? {
        // re-import revives reachability for a dropped import
        if kref.is_object() && !store.clist_reachable(endpoint, kref)? {
            store.set_clist_reachable(endpoint, kref, true)?;
            store.increment_ref_count(kref, "clist")?;
        }
        store.decrement_ref_count(kref, held_tag)?;
        return Ok(eref);
    }
    let kind = kref.kind();
    let index = store.next_eref_index(endpoint, kind)?;
    let eref = ERef::new(kind, Polarity::Minus, index);
    store.add_clist_entry(endpoint, kref, eref)?;
    if kref.is_object() {
        let mut record = store.get_kernel_object(kref)?;
        record.recognizable += 1;
        store.set_kernel_object(kref, &record)?;
    }
    if pairing_holds_count(store, endpoint, kref)? {
        store.increment_ref_count(kref, "clist")?;
    }
    store.decrement_ref_count(kref, held_tag)?;
    trace!(%endpoint, %kref, %eref, "import minted");
    Ok(eref)
}

/// Translate outbound capdata, transferring each slot's queue hold.
pub fn export_capdata(
    store: &mut KernelStore,
    endpoint: EndpointId,
    data: CapData,
) -> Result<VatCapData, KernelError> {
    data.try_map_slots(|kref| kref_to_eref(store, endpoint, kref, "queue|slot"))
}

/// Translate a whole outbound message: slots transfer their `queue|slot`
/// holds, the result promise transfers `queue|result` and its decidership
/// moves to the receiving endpoint.
pub fn export_message(
    store: &mut KernelStore,
    endpoint: EndpointId,
    message: Message,
) -> Result<VatMessage, KernelError> {
    let methargs = export_capdata(store, endpoint, message.methargs)?;
    let result = match message.result {
        Some(kpid) => {
            let eref = kref_to_eref(store, endpoint, kpid, "queue|result")?;
            store.set_promise_decider(kpid, Some(endpoint))?;
            Some(eref)
        }
        None => None,
    };
    Ok(VatMessage { methargs, result })
}

/// Translate notify resolution data outbound. The value slots are held by
/// the promise record (`data|slot`), not by the queue, so minting a new
/// pairing adds a fresh `clist` hold with nothing to transfer.
pub fn export_resolution_data(
    store: &mut KernelStore,
    endpoint: EndpointId,
    data: CapData,
) -> Result<VatCapData, KernelError> {
    data.try_map_slots(|kref| {
        if let Some(eref) = store.kref_to_eref(endpoint, kref)? {
            if kref.is_object() && !store.clist_reachable(endpoint, kref)? {
                store.set_clist_reachable(endpoint, kref, true)?;
                store.increment_ref_count(kref, "clist")?;
            }
            return Ok(eref);
        }
        let kind = kref.kind();
        let index = store.next_eref_index(endpoint, kind)?;
        let eref = ERef::new(kind, Polarity::Minus, index);
        store.add_clist_entry(endpoint, kref, eref)?;
        if kref.is_object() {
            let mut record = store.get_kernel_object(kref)?;
            record.recognizable += 1;
            store.set_kernel_object(kref, &record)?;
        }
        if pairing_holds_count(store, endpoint, kref)? {
            store.increment_ref_count(kref, "clist")?;
        }
        Ok(eref)
    })
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use kagi_store::MemoryKVStore;
    use kagi_types::VatId;

    fn store() -> KernelStore {
        KernelStore::new(Box::new(MemoryKVStore::new()))
    }

    fn vat(n: u64) -> EndpointId {
        EndpointId::Vat(VatId::new(n))
    }

    fn eref(s: &str) -> ERef {
        s.parse().unwrap()
    }

    #[test]
    fn test_first_export_allocates_object() {
        let mut store = store();
        let alice = vat(1);
        let kref = eref_to_kref(&mut store, alice, eref("o+0")).unwrap();
        assert_eq!(kref.to_string(), "ko1");
        let record = store.get_kernel_object(kref).unwrap();
        assert_eq!(record.owner, alice);
        // owner pairing holds no refcount
        assert_eq!(record.ref_count, 0);
        // second citation reuses the pairing
        assert_eq!(eref_to_kref(&mut store, alice, eref("o+0")).unwrap(), kref);
        assert_eq!(store.get_kernel_object(kref).unwrap().ref_count, 0);
    }

    #[test]
    fn test_first_export_allocates_promise_with_clist_hold() {
        let mut store = store();
        let alice = vat(1);
        let kpid = eref_to_kref(&mut store, alice, eref("p+0")).unwrap();
        assert!(kpid.is_promise());
        let record = store.get_kernel_promise(kpid).unwrap();
        assert_eq!(record.decider, Some(alice));
        assert_eq!(record.ref_count, 1); // alice's pairing
    }

    #[test]
    fn test_unknown_minus_eref_is_rejected() {
        let mut store = store();
        assert!(matches!(
            eref_to_kref(&mut store, vat(1), eref("o-3")),
            Err(KernelError::UnknownEref { .. })
        ));
    }

    #[test]
    fn test_outbound_mints_minus_eref_and_transfers_hold() {
        let mut store = store();
        let alice = vat(1);
        let bob = vat(2);
        let kref = eref_to_kref(&mut store, alice, eref("o+0")).unwrap();
        // simulate the citation sitting in a queued message
        store.increment_ref_count(kref, "queue|slot").unwrap();

        let minted = kref_to_eref(&mut store, bob, kref, "queue|slot").unwrap();
        assert_eq!(minted, eref("o-1"));
        let record = store.get_kernel_object(kref).unwrap();
        // queue hold became bob's clist hold: count unchanged at 1
        assert_eq!(record.ref_count, 1);
        assert_eq!(record.recognizable, 1);
        assert_eq!(store.kref_to_eref(bob, kref).unwrap(), Some(minted));
    }

    #[test]
    fn test_outbound_existing_pairing_releases_queue_hold() {
        let mut store = store();
        let alice = vat(1);
        let bob = vat(2);
        let kref = eref_to_kref(&mut store, alice, eref("o+0")).unwrap();
        store.increment_ref_count(kref, "queue|slot").unwrap();
        let first = kref_to_eref(&mut store, bob, kref, "queue|slot").unwrap();

        store.increment_ref_count(kref, "queue|slot").unwrap();
        let second = kref_to_eref(&mut store, bob, kref, "queue|slot").unwrap();
        assert_eq!(first, second);
        // still exactly one clist hold
        assert_eq!(store.get_kernel_object(kref).unwrap().ref_count, 1);
        assert_eq!(store.get_kernel_object(kref).unwrap().recognizable, 1);
    }

    #[test]
    fn test_outbound_to_owner_uses_plus_eref() {
        let mut store = store();
        let alice = vat(1);
        let kref = eref_to_kref(&mut store, alice, eref("o+0")).unwrap();
        store.increment_ref_count(kref, "queue|target").unwrap();
        let back = kref_to_eref(&mut store, alice, kref, "queue|target").unwrap();
        assert_eq!(back, eref("o+0"));
        assert_eq!(store.get_kernel_object(kref).unwrap().ref_count, 0);
    }

    #[test]
    fn test_reimport_revives_dropped_reachability() {
        let mut store = store();
        let alice = vat(1);
        let bob = vat(2);
        let kref = eref_to_kref(&mut store, alice, eref("o+0")).unwrap();
        store.increment_ref_count(kref, "queue|slot").unwrap();
        let minted = kref_to_eref(&mut store, bob, kref, "queue|slot").unwrap();

        // bob drops: reachability off, hold released
        store.set_clist_reachable(bob, kref, false).unwrap();
        store.decrement_ref_count(kref, "clist").unwrap();

        // a later delivery re-imports the same object
        store.increment_ref_count(kref, "queue|slot").unwrap();
        let again = kref_to_eref(&mut store, bob, kref, "queue|slot").unwrap();
        assert_eq!(again, minted);
        assert!(store.clist_reachable(bob, kref).unwrap());
        assert_eq!(store.get_kernel_object(kref).unwrap().ref_count, 1);
    }

    #[test]
    fn test_result_must_be_promise() {
        let mut store = store();
        assert!(result_eref_to_kref(&mut store, vat(1), eref("o+1")).is_err());
    }

    #[test]
    fn test_result_translation_parks_decider_with_kernel() {
        let mut store = store();
        let alice = vat(1);
        let kpid = result_eref_to_kref(&mut store, alice, eref("p+4")).unwrap();
        assert_eq!(store.get_kernel_promise(kpid).unwrap().decider, None);
    }

    #[test]
    fn test_export_message_assigns_decider_to_receiver() {
        let mut store = store();
        let alice = vat(1);
        let bob = vat(2);
        let kpid = result_eref_to_kref(&mut store, alice, eref("p+0")).unwrap();
        store.increment_ref_count(kpid, "queue|result").unwrap();

        let message = Message::new(CapData::plain("[\"go\",[]]"), Some(kpid));
        let vat_message = export_message(&mut store, bob, message).unwrap();
        assert_eq!(vat_message.result, Some(eref("p-1")));
        let record = store.get_kernel_promise(kpid).unwrap();
        assert_eq!(record.decider, Some(bob));
        // alice's pairing + bob's pairing
        assert_eq!(record.ref_count, 2);
    }

    #[test]
    fn test_capdata_translation_roundtrip() {
        let mut store = store();
        let alice = vat(1);
        let bob = vat(2);
        let data = VatCapData::new("[\"@0\"]", vec![eref("o+7")]);
        let kernel_data = import_capdata(&mut store, alice, data).unwrap();
        let kref = kernel_data.slots[0];
        store.increment_ref_count(kref, "queue|slot").unwrap();
        let bob_data = export_capdata(&mut store, bob, kernel_data).unwrap();
        assert_eq!(bob_data.body, "[\"@0\"]");
        assert_eq!(bob_data.slots, vec![eref("o-1")]);
    }
}
