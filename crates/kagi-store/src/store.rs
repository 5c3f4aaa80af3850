//! The kernel store: sole mutator of durable kernel state.
//!
//! Everything the kernel persists lives in one KV namespace:
//!
//! ```text
//! nextVatId / nextRemoteId / nextScId / nextKoId / nextKpId
//! ko.<n>                      object record
//! kp.<n>                      promise record
//! kp.<n>.q.<i>                queued pipelined message
//! clist.<endpoint>.k2e.<kref> "R <eref>" | "_ <eref>"   (reachability flag)
//! clist.<endpoint>.e2k.<eref> "<kref>"
//! runQueue.head / runQueue.tail / runQueue.<i>
//! gcActions                   sorted pending GC entries
//! reapQueue                   vats awaiting a reap delivery
//! vat.<id>.{config,state,subcluster,reapInterval,reapCountdown}
//! remote.<id>.incarnation
//! subcluster.<id>.{config,vats,result}
//! vs.<vatId>.<key>            vatstore
//! kkv.<key>                   kernel-scoped kv area
//! ```
//!
//! All mutation happens inside a crank: `start_crank` opens the outer
//! savepoint, `rollback_crank` restores a labeled savepoint and throws away
//! crank-buffered output, `end_crank` commits. Run-queue items produced
//! during a crank are staged in the crank buffer so an aborted crank emits
//! nothing.

use std::collections::BTreeSet;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::trace;

use kagi_types::{
    CapData, EndpointId, ERef, GCAction, GCActionKind, KernelError, KRef, Message, RemoteId,
    RunQueueItem, SubclusterId, VatConfig, VatState, ClusterConfig,
};

use crate::kv::{KVError, KVStore};
use crate::records::{KernelObject, KernelPromise, PromiseState};
#[cfg(debug_assertions)]
use crate::refcount::RefCountLedger;

impl From<KVError> for KernelError {
    fn from(e: KVError) -> Self {
        KernelError::Store(e.to_string())
    }
}

/// Label of the savepoint opened by `start_crank`.
pub const CRANK_SAVEPOINT: &str = "crank";

/// Default deliveries between scheduled reaps.
pub const DEFAULT_REAP_INTERVAL: u64 = 100;

/// One pending entry in the `gcActions` set.
#[derive(
    Clone, Debug, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
struct GcQueueEntry {
    kind: GCActionKind,
    endpoint: EndpointId,
    kref: KRef,
}

pub struct KernelStore {
    kv: Box<dyn KVStore>,
    crank_buffer: Vec<RunQueueItem>,
    /// Krefs whose refcount hit zero this crank; drained by the GC engine.
    maybe_free: BTreeSet<KRef>,
    in_crank: bool,
    #[cfg(debug_assertions)]
    ledger: RefCountLedger,
}

impl KernelStore {
    pub fn new(kv: Box<dyn KVStore>) -> Self {
        Self {
            kv,
            crank_buffer: Vec::new(),
            maybe_free: BTreeSet::new(),
            in_crank: false,
            #[cfg(debug_assertions)]
            ledger: RefCountLedger::new(),
        }
    }

    // ── JSON record helpers ─────────────────────────────────────────────

    fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, KernelError> {
        match self.kv.get(key)? {
            Some(raw) => {
                let value = serde_json::from_str(&raw)
                    .map_err(|e| KernelError::Store(format!("corrupt record {key}: {e}")))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn set_json<T: Serialize>(&mut self, key: &str, value: &T) -> Result<(), KernelError> {
        let raw = serde_json::to_string(value)
            .map_err(|e| KernelError::Store(format!("encode {key}: {e}")))?;
        self.kv.set(key, &raw)?;
        Ok(())
    }

    fn counter_next(&mut self, key: &str) -> Result<u64, KernelError> {
        let current = match self.kv.get(key)? {
            Some(raw) => raw
                .parse::<u64>()
                .map_err(|e| KernelError::Store(format!("corrupt counter {key}: {e}")))?,
            None => 1,
        };
        self.kv.set(key, &(current + 1).to_string())?;
        Ok(current)
    }

    // ── Identity allocation ─────────────────────────────────────────────

    pub fn get_next_vat_id(&mut self) -> Result<kagi_types::VatId, KernelError> {
        Ok(kagi_types::VatId::new(self.counter_next("nextVatId")?))
    }

    pub fn get_next_remote_id(&mut self) -> Result<RemoteId, KernelError> {
        Ok(RemoteId::new(self.counter_next("nextRemoteId")?))
    }

    pub fn get_next_subcluster_id(&mut self) -> Result<SubclusterId, KernelError> {
        Ok(SubclusterId::new(self.counter_next("nextScId")?))
    }

    // ── Object table ────────────────────────────────────────────────────

    fn object_key(kref: KRef) -> String {
        format!("ko.{}", kref.index())
    }

    pub fn init_kernel_object(
        &mut self,
        owner: EndpointId,
    ) -> Result<(KRef, KernelObject), KernelError> {
        let kref = KRef::object(self.counter_next("nextKoId")?);
        let record = KernelObject::new(owner);
        self.set_json(&Self::object_key(kref), &record)?;
        trace!(%kref, %owner, "kernel object created");
        Ok((kref, record))
    }

    pub fn get_kernel_object(&self, kref: KRef) -> Result<KernelObject, KernelError> {
        self.get_json(&Self::object_key(kref))?
            .ok_or(KernelError::UnknownKref(kref))
    }

    pub fn has_kernel_object(&self, kref: KRef) -> Result<bool, KernelError> {
        Ok(self.kv.get(&Self::object_key(kref))?.is_some())
    }

    pub fn set_kernel_object(
        &mut self,
        kref: KRef,
        record: &KernelObject,
    ) -> Result<(), KernelError> {
        self.set_json(&Self::object_key(kref), record)
    }

    pub fn delete_kernel_object(&mut self, kref: KRef) -> Result<(), KernelError> {
        #[cfg(debug_assertions)]
        self.ledger.assert_balanced(kref);
        self.kv.delete(&Self::object_key(kref))?;
        trace!(%kref, "kernel object deleted");
        Ok(())
    }

    // ── Promise table ───────────────────────────────────────────────────

    fn promise_key(kref: KRef) -> String {
        format!("kp.{}", kref.index())
    }

    fn promise_queue_key(kref: KRef, i: u64) -> String {
        format!("kp.{}.q.{}", kref.index(), i)
    }

    pub fn init_kernel_promise(
        &mut self,
        decider: Option<EndpointId>,
    ) -> Result<(KRef, KernelPromise), KernelError> {
        let kref = KRef::promise(self.counter_next("nextKpId")?);
        let record = KernelPromise::new(decider);
        self.set_json(&Self::promise_key(kref), &record)?;
        trace!(%kref, ?decider, "kernel promise created");
        Ok((kref, record))
    }

    pub fn get_kernel_promise(&self, kref: KRef) -> Result<KernelPromise, KernelError> {
        self.get_json(&Self::promise_key(kref))?
            .ok_or(KernelError::UnknownKref(kref))
    }

    pub fn has_kernel_promise(&self, kref: KRef) -> Result<bool, KernelError> {
        Ok(self.kv.get(&Self::promise_key(kref))?.is_some())
    }

    pub fn set_kernel_promise(
        &mut self,
        kref: KRef,
        record: &KernelPromise,
    ) -> Result<(), KernelError> {
        self.set_json(&Self::promise_key(kref), record)
    }

    pub fn delete_kernel_promise(&mut self, kref: KRef) -> Result<(), KernelError> {
        #[cfg(debug_assertions)]
        self.ledger.assert_balanced(kref);
        let record = self.get_kernel_promise(kref)?;
        for i in record.queue_head..record.queue_tail {
            self.kv.delete(&Self::promise_queue_key(kref, i))?;
        }
        self.kv.delete(&Self::promise_key(kref))?;
        trace!(%kref, "kernel promise deleted");
        Ok(())
    }

    /// Queue a pipelined message on an unresolved promise.
    pub fn enqueue_promise_message(
        &mut self,
        kpid: KRef,
        message: Message,
    ) -> Result<(), KernelError> {
        let mut record = self.get_kernel_promise(kpid)?;
        if !record.is_unresolved() {
            return Err(KernelError::InvariantViolation(format!(
                "pipelining onto settled promise {kpid}"
            )));
        }
        let i = record.queue_tail;
        record.queue_tail += 1;
        self.set_json(&Self::promise_queue_key(kpid, i), &message)?;
        self.set_kernel_promise(kpid, &record)?;
        Ok(())
    }

    pub fn get_kernel_promise_message_queue(
        &self,
        kpid: KRef,
    ) -> Result<Vec<Message>, KernelError> {
        let record = self.get_kernel_promise(kpid)?;
        let mut queue = Vec::with_capacity((record.queue_tail - record.queue_head) as usize);
        for i in record.queue_head..record.queue_tail {
            let message = self
                .get_json(&Self::promise_queue_key(kpid, i))?
                .ok_or_else(|| {
                    KernelError::Store(format!("missing promise queue entry {kpid} #{i}"))
                })?;
            queue.push(message);
        }
        Ok(queue)
    }

    /// Mark the promise settled and drain its pipelined queue.
    ///
    /// Subscribers and decider are cleared; callers fan out notifies before
    /// calling this. Returns the drained messages in queue order.
    pub fn resolve_kernel_promise(
        &mut self,
        kpid: KRef,
        rejected: bool,
        data: CapData,
    ) -> Result<Vec<Message>, KernelError> {
        let mut record = self.get_kernel_promise(kpid)?;
        if !record.is_unresolved() {
            return Err(KernelError::InvariantViolation(format!(
                "promise {kpid} resolved twice"
            )));
        }
        let drained = self.get_kernel_promise_message_queue(kpid)?;
        for i in record.queue_head..record.queue_tail {
            self.kv.delete(&Self::promise_queue_key(kpid, i))?;
        }
        record.queue_head = record.queue_tail;
        record.state = if rejected {
            PromiseState::Rejected
        } else {
            PromiseState::Fulfilled
        };
        record.value = Some(data);
        record.decider = None;
        record.subscribers.clear();
        self.set_kernel_promise(kpid, &record)?;
        trace!(%kpid, rejected, drained = drained.len(), "promise resolved");
        Ok(drained)
    }

    /// Returns true if the endpoint was not already subscribed.
    pub fn add_promise_subscriber(
        &mut self,
        kpid: KRef,
        endpoint: EndpointId,
    ) -> Result<bool, KernelError> {
        let mut record = self.get_kernel_promise(kpid)?;
        let added = record.subscribers.insert(endpoint);
        if added {
            self.set_kernel_promise(kpid, &record)?;
        }
        Ok(added)
    }

    pub fn set_promise_decider(
        &mut self,
        kpid: KRef,
        decider: Option<EndpointId>,
    ) -> Result<(), KernelError> {
        let mut record = self.get_kernel_promise(kpid)?;
        record.decider = decider;
        self.set_kernel_promise(kpid, &record)
    }

    /// Every live promise record. Queue entries are skipped.
    pub fn list_promises(&self) -> Result<Vec<(KRef, KernelPromise)>, KernelError> {
        let mut promises = Vec::new();
        for key in self.kv.keys_with_prefix("kp.")? {
            let rest = &key["kp.".len()..];
            if rest.contains('.') {
                continue; // kp.<n>.q.<i>
            }
            let kref = KRef::promise(
                rest.parse::<u64>()
                    .map_err(|e| KernelError::Store(format!("corrupt promise key {key}: {e}")))?,
            );
            promises.push((kref, self.get_kernel_promise(kref)?));
        }
        promises.sort_by_key(|(k, _)| *k);
        Ok(promises)
    }

    // ── Reference counts ────────────────────────────────────────────────

    fn ref_count_of(&self, kref: KRef) -> Result<u64, KernelError> {
        if kref.is_promise() {
            Ok(self.get_kernel_promise(kref)?.ref_count)
        } else {
            Ok(self.get_kernel_object(kref)?.ref_count)
        }
    }

    fn write_ref_count(&mut self, kref: KRef, count: u64) -> Result<(), KernelError> {
        if kref.is_promise() {
            let mut record = self.get_kernel_promise(kref)?;
            record.ref_count = count;
            self.set_kernel_promise(kref, &record)
        } else {
            let mut record = self.get_kernel_object(kref)?;
            record.ref_count = count;
            self.set_kernel_object(kref, &record)
        }
    }

    pub fn increment_ref_count(
        &mut self,
        kref: KRef,
        tag: &'static str,
    ) -> Result<u64, KernelError> {
        let count = self.ref_count_of(kref)? + 1;
        self.write_ref_count(kref, count)?;
        #[cfg(debug_assertions)]
        self.ledger.record(kref, tag, 1);
        trace!(%kref, tag, count, "refcount +");
        // a kref that regained a holder is no longer a free candidate
        self.maybe_free.remove(&kref);
        Ok(count)
    }

    /// Decrement, returning the new count. Zero schedules GC consideration.
    ///
    /// Underflow is a kernel bug: panics in debug builds, errors (aborting
    /// the crank) in release.
    pub fn decrement_ref_count(
        &mut self,
        kref: KRef,
        tag: &'static str,
    ) -> Result<u64, KernelError> {
        let count = self.ref_count_of(kref)?;
        if count == 0 {
            if cfg!(debug_assertions) {
                panic!("refcount underflow on {kref} (tag {tag})");
            }
            return Err(KernelError::InvariantViolation(format!(
                "refcount underflow on {kref} (tag {tag})"
            )));
        }
        let count = count - 1;
        self.write_ref_count(kref, count)?;
        #[cfg(debug_assertions)]
        self.ledger.record(kref, tag, -1);
        trace!(%kref, tag, count, "refcount -");
        if count == 0 {
            self.maybe_free.insert(kref);
        }
        Ok(count)
    }

    /// Drain the krefs whose counts hit zero this crank.
    pub fn take_maybe_free(&mut self) -> BTreeSet<KRef> {
        std::mem::take(&mut self.maybe_free)
    }

    #[cfg(debug_assertions)]
    pub fn ledger_balance(&self, kref: KRef) -> std::collections::HashMap<&'static str, i64> {
        self.ledger.balance(kref)
    }

    // ── C-lists ─────────────────────────────────────────────────────────

    fn k2e_key(endpoint: EndpointId, kref: KRef) -> String {
        format!("clist.{endpoint}.k2e.{kref}")
    }

    fn e2k_key(endpoint: EndpointId, eref: ERef) -> String {
        format!("clist.{endpoint}.e2k.{eref}")
    }

    /// Insert a fresh eref↔kref pairing. Refcount discipline is the
    /// caller's job; insertion itself holds nothing.
    pub fn add_clist_entry(
        &mut self,
        endpoint: EndpointId,
        kref: KRef,
        eref: ERef,
    ) -> Result<(), KernelError> {
        if self.kv.get(&Self::k2e_key(endpoint, kref))?.is_some()
            || self.kv.get(&Self::e2k_key(endpoint, eref))?.is_some()
        {
            return Err(KernelError::ClistCollision {
                endpoint,
                detail: format!("{kref} <-> {eref}"),
            });
        }
        self.kv
            .set(&Self::k2e_key(endpoint, kref), &format!("R {eref}"))?;
        self.kv
            .set(&Self::e2k_key(endpoint, eref), &kref.to_string())?;
        trace!(%endpoint, %kref, %eref, "clist entry added");
        Ok(())
    }

    fn parse_k2e(raw: &str) -> Result<(bool, ERef), KernelError> {
        let (flag, eref) = raw
            .split_once(' ')
            .ok_or_else(|| KernelError::Store(format!("corrupt clist value {raw:?}")))?;
        Ok((flag == "R", eref.parse()?))
    }

    pub fn kref_to_eref(
        &self,
        endpoint: EndpointId,
        kref: KRef,
    ) -> Result<Option<ERef>, KernelError> {
        match self.kv.get(&Self::k2e_key(endpoint, kref))? {
            Some(raw) => Ok(Some(Self::parse_k2e(&raw)?.1)),
            None => Ok(None),
        }
    }

    pub fn eref_to_kref(
        &self,
        endpoint: EndpointId,
        eref: ERef,
    ) -> Result<Option<KRef>, KernelError> {
        match self.kv.get(&Self::e2k_key(endpoint, eref))? {
            Some(raw) => Ok(Some(raw.parse()?)),
            None => Ok(None),
        }
    }

    /// Reachability flag on an importer's entry (false after dropImports).
    pub fn clist_reachable(&self, endpoint: EndpointId, kref: KRef) -> Result<bool, KernelError> {
        let raw = self
            .kv
            .get(&Self::k2e_key(endpoint, kref))?
            .ok_or(KernelError::UnknownKref(kref))?;
        Ok(Self::parse_k2e(&raw)?.0)
    }

    pub fn set_clist_reachable(
        &mut self,
        endpoint: EndpointId,
        kref: KRef,
        reachable: bool,
    ) -> Result<(), KernelError> {
        let raw = self
            .kv
            .get(&Self::k2e_key(endpoint, kref))?
            .ok_or(KernelError::UnknownKref(kref))?;
        let (_, eref) = Self::parse_k2e(&raw)?;
        let flag = if reachable { "R" } else { "_" };
        self.kv
            .set(&Self::k2e_key(endpoint, kref), &format!("{flag} {eref}"))?;
        Ok(())
    }

    pub fn forget_kref(&mut self, endpoint: EndpointId, kref: KRef) -> Result<(), KernelError> {
        if let Some(raw) = self.kv.get(&Self::k2e_key(endpoint, kref))? {
            let (_, eref) = Self::parse_k2e(&raw)?;
            self.kv.delete(&Self::k2e_key(endpoint, kref))?;
            self.kv.delete(&Self::e2k_key(endpoint, eref))?;
            trace!(%endpoint, %kref, %eref, "clist entry forgotten");
        }
        Ok(())
    }

    pub fn forget_eref(&mut self, endpoint: EndpointId, eref: ERef) -> Result<(), KernelError> {
        if let Some(kref) = self.eref_to_kref(endpoint, eref)? {
            self.forget_kref(endpoint, kref)?;
        }
        Ok(())
    }

    /// Remove every entry for an endpoint, returning the pairings and
    /// their reachability flags so the caller can settle refcounts.
    pub fn clear_endpoint_clist(
        &mut self,
        endpoint: EndpointId,
    ) -> Result<Vec<(KRef, ERef, bool)>, KernelError> {
        let prefix = format!("clist.{endpoint}.k2e.");
        let mut pairs = Vec::new();
        for key in self.kv.keys_with_prefix(&prefix)? {
            let kref: KRef = key[prefix.len()..].parse()?;
            let raw = self.kv.get(&key)?.expect("listed key vanished");
            let (reachable, eref) = Self::parse_k2e(&raw)?;
            pairs.push((kref, eref, reachable));
        }
        for (kref, eref, _) in &pairs {
            self.kv.delete(&Self::k2e_key(endpoint, *kref))?;
            self.kv.delete(&Self::e2k_key(endpoint, *eref))?;
        }
        Ok(pairs)
    }

    /// Allocate the next `-`-polarity index for minting an eref into an
    /// endpoint's namespace. Objects and promises count separately.
    pub fn next_eref_index(
        &mut self,
        endpoint: EndpointId,
        kind: kagi_types::RefKind,
    ) -> Result<u64, KernelError> {
        let table = match kind {
            kagi_types::RefKind::Object => "nextMinusObj",
            kagi_types::RefKind::Promise => "nextMinusProm",
        };
        self.counter_next(&format!("clist.{endpoint}.{table}"))
    }

    /// Endpoints other than the owner holding a c-list entry for `kref`.
    pub fn importers_of(
        &self,
        kref: KRef,
        owner: EndpointId,
    ) -> Result<Vec<EndpointId>, KernelError> {
        let mut importers = Vec::new();
        for (vat, _, _) in self.list_vats()? {
            let endpoint = EndpointId::Vat(vat);
            if endpoint != owner && self.kref_to_eref(endpoint, kref)?.is_some() {
                importers.push(endpoint);
            }
        }
        for remote in self.list_remotes()? {
            let endpoint = EndpointId::Remote(remote);
            if endpoint != owner && self.kref_to_eref(endpoint, kref)?.is_some() {
                importers.push(endpoint);
            }
        }
        Ok(importers)
    }

    // ── Run queue ───────────────────────────────────────────────────────

    fn queue_counter(&self, key: &str) -> Result<u64, KernelError> {
        Ok(self
            .kv
            .get(key)?
            .map(|raw| raw.parse::<u64>())
            .transpose()
            .map_err(|e| KernelError::Store(format!("corrupt counter {key}: {e}")))?
            .unwrap_or(0))
    }

    pub fn enqueue_run(&mut self, item: &RunQueueItem) -> Result<(), KernelError> {
        let tail = self.queue_counter("runQueue.tail")?;
        self.set_json(&format!("runQueue.{tail}"), item)?;
        self.kv.set("runQueue.tail", &(tail + 1).to_string())?;
        Ok(())
    }

    pub fn dequeue_run(&mut self) -> Result<Option<RunQueueItem>, KernelError> {
        let head = self.queue_counter("runQueue.head")?;
        let tail = self.queue_counter("runQueue.tail")?;
        if head == tail {
            return Ok(None);
        }
        let key = format!("runQueue.{head}");
        let item = self
            .get_json(&key)?
            .ok_or_else(|| KernelError::Store(format!("missing run queue entry #{head}")))?;
        self.kv.delete(&key)?;
        self.kv.set("runQueue.head", &(head + 1).to_string())?;
        Ok(Some(item))
    }

    pub fn run_queue_length(&self) -> Result<u64, KernelError> {
        Ok(self.queue_counter("runQueue.tail")? - self.queue_counter("runQueue.head")?)
    }

    // ── Crank buffer ────────────────────────────────────────────────────

    /// Stage an item produced mid-crank; a rolled-back crank emits nothing.
    pub fn buffer_crank_output(&mut self, item: RunQueueItem) {
        self.crank_buffer.push(item);
    }

    /// Move buffered items onto the run queue, in insertion order.
    /// Returns how many were enqueued.
    pub fn flush_crank_buffer(&mut self) -> Result<u64, KernelError> {
        let items = std::mem::take(&mut self.crank_buffer);
        let count = items.len() as u64;
        for item in &items {
            self.enqueue_run(item)?;
        }
        Ok(count)
    }

    pub fn crank_buffer_len(&self) -> usize {
        self.crank_buffer.len()
    }

    // ── GC actions ──────────────────────────────────────────────────────

    fn read_gc_entries(&self) -> Result<Vec<GcQueueEntry>, KernelError> {
        Ok(self.get_json("gcActions")?.unwrap_or_default())
    }

    fn write_gc_entries(&mut self, entries: &[GcQueueEntry]) -> Result<(), KernelError> {
        if entries.is_empty() {
            self.kv.delete("gcActions")?;
            Ok(())
        } else {
            self.set_json("gcActions", &entries.to_vec())
        }
    }

    /// Add pending GC work. Entries are kept sorted and deduplicated;
    /// ordering of the sort is service priority (drops before retires).
    pub fn add_gc_actions(
        &mut self,
        kind: GCActionKind,
        endpoint: EndpointId,
        krefs: impl IntoIterator<Item = KRef>,
    ) -> Result<(), KernelError> {
        let mut entries = self.read_gc_entries()?;
        for kref in krefs {
            entries.push(GcQueueEntry {
                kind,
                endpoint,
                kref,
            });
        }
        entries.sort();
        entries.dedup();
        self.write_gc_entries(&entries)
    }

    /// Pop the highest-priority batch: all pending krefs sharing the first
    /// (kind, endpoint) pair.
    pub fn next_gc_action(&mut self) -> Result<Option<GCAction>, KernelError> {
        let entries = self.read_gc_entries()?;
        let Some(first) = entries.first().cloned() else {
            return Ok(None);
        };
        let (batch, rest): (Vec<_>, Vec<_>) = entries
            .into_iter()
            .partition(|e| e.kind == first.kind && e.endpoint == first.endpoint);
        self.write_gc_entries(&rest)?;
        Ok(Some(GCAction {
            kind: first.kind,
            endpoint: first.endpoint,
            krefs: batch.into_iter().map(|e| e.kref).collect(),
        }))
    }

    /// Remove pending actions aimed at an endpoint (used at termination).
    pub fn discard_gc_actions_for(&mut self, endpoint: EndpointId) -> Result<(), KernelError> {
        let entries = self.read_gc_entries()?;
        let kept: Vec<_> = entries
            .into_iter()
            .filter(|e| e.endpoint != endpoint)
            .collect();
        self.write_gc_entries(&kept)
    }

    pub fn gc_action_count(&self) -> Result<u64, KernelError> {
        Ok(self.read_gc_entries()?.len() as u64)
    }

    // ── Reap queue ──────────────────────────────────────────────────────

    pub fn schedule_reap(&mut self, vat: kagi_types::VatId) -> Result<(), KernelError> {
        let mut queue: Vec<kagi_types::VatId> = self.get_json("reapQueue")?.unwrap_or_default();
        if !queue.contains(&vat) {
            queue.push(vat);
            self.set_json("reapQueue", &queue)?;
        }
        Ok(())
    }

    pub fn reap_queue_length(&self) -> Result<u64, KernelError> {
        let queue: Vec<kagi_types::VatId> = self.get_json("reapQueue")?.unwrap_or_default();
        Ok(queue.len() as u64)
    }

    pub fn next_reap_action(&mut self) -> Result<Option<kagi_types::VatId>, KernelError> {
        let mut queue: Vec<kagi_types::VatId> = self.get_json("reapQueue")?.unwrap_or_default();
        if queue.is_empty() {
            return Ok(None);
        }
        let vat = queue.remove(0);
        if queue.is_empty() {
            self.kv.delete("reapQueue")?;
        } else {
            self.set_json("reapQueue", &queue)?;
        }
        Ok(Some(vat))
    }

    // ── Vat records ─────────────────────────────────────────────────────

    pub fn add_vat(
        &mut self,
        vat: kagi_types::VatId,
        config: &VatConfig,
        subcluster: Option<SubclusterId>,
    ) -> Result<(), KernelError> {
        let state_key = format!("vat.{vat}.state");
        if self.kv.get(&state_key)?.is_some() {
            return Err(KernelError::VatAlreadyExists(vat));
        }
        self.set_json(&format!("vat.{vat}.config"), config)?;
        self.kv.set(&state_key, &VatState::Launching.to_string())?;
        if let Some(sc) = subcluster {
            self.kv.set(&format!("vat.{vat}.subcluster"), &sc.to_string())?;
        }
        let interval = config.reap_interval.unwrap_or(DEFAULT_REAP_INTERVAL);
        self.kv
            .set(&format!("vat.{vat}.reapInterval"), &interval.to_string())?;
        self.kv
            .set(&format!("vat.{vat}.reapCountdown"), &interval.to_string())?;
        Ok(())
    }

    pub fn vat_config(&self, vat: kagi_types::VatId) -> Result<VatConfig, KernelError> {
        self.get_json(&format!("vat.{vat}.config"))?
            .ok_or(KernelError::VatNotFound(vat))
    }

    pub fn vat_state(&self, vat: kagi_types::VatId) -> Result<VatState, KernelError> {
        let raw = self
            .kv
            .get(&format!("vat.{vat}.state"))?
            .ok_or(KernelError::VatNotFound(vat))?;
        raw.parse()
            .map_err(|_| KernelError::Store(format!("corrupt vat state {raw:?}")))
    }

    pub fn set_vat_state(
        &mut self,
        vat: kagi_types::VatId,
        state: VatState,
    ) -> Result<(), KernelError> {
        // refuse to resurrect a vat record that was never created
        let key = format!("vat.{vat}.state");
        if self.kv.get(&key)?.is_none() {
            return Err(KernelError::VatNotFound(vat));
        }
        self.kv.set(&key, &state.to_string())?;
        Ok(())
    }

    pub fn vat_subcluster(
        &self,
        vat: kagi_types::VatId,
    ) -> Result<Option<SubclusterId>, KernelError> {
        match self.kv.get(&format!("vat.{vat}.subcluster"))? {
            Some(raw) => Ok(Some(raw.parse()?)),
            None => Ok(None),
        }
    }

    pub fn list_vats(
        &self,
    ) -> Result<Vec<(kagi_types::VatId, VatState, Option<SubclusterId>)>, KernelError> {
        let mut vats = Vec::new();
        for key in self.kv.keys_with_prefix("vat.")? {
            let rest = &key["vat.".len()..];
            if let Some(id_str) = rest.strip_suffix(".state") {
                let vat: kagi_types::VatId = id_str.parse()?;
                vats.push((vat, self.vat_state(vat)?, self.vat_subcluster(vat)?));
            }
        }
        vats.sort_by_key(|(v, _, _)| *v);
        Ok(vats)
    }

    /// Count down toward the next reap; resets and returns true at zero.
    pub fn countdown_to_reap(&mut self, vat: kagi_types::VatId) -> Result<bool, KernelError> {
        let countdown_key = format!("vat.{vat}.reapCountdown");
        let interval_key = format!("vat.{vat}.reapInterval");
        let countdown = self
            .kv
            .get(&countdown_key)?
            .and_then(|raw| raw.parse::<u64>().ok())
            .unwrap_or(DEFAULT_REAP_INTERVAL);
        if countdown <= 1 {
            let interval = self
                .kv
                .get(&interval_key)?
                .and_then(|raw| raw.parse::<u64>().ok())
                .unwrap_or(DEFAULT_REAP_INTERVAL);
            self.kv.set(&countdown_key, &interval.to_string())?;
            Ok(true)
        } else {
            self.kv.set(&countdown_key, &(countdown - 1).to_string())?;
            Ok(false)
        }
    }

    /// Drop every per-vat key: record, vatstore, c-list.
    pub fn delete_vat(&mut self, vat: kagi_types::VatId) -> Result<(), KernelError> {
        for key in self.kv.keys_with_prefix(&format!("vat.{vat}."))? {
            self.kv.delete(&key)?;
        }
        self.clear_vatstore(vat)?;
        self.clear_endpoint_clist(EndpointId::Vat(vat))?;
        Ok(())
    }

    // ── Remote records ──────────────────────────────────────────────────

    pub fn add_remote(&mut self, remote: RemoteId) -> Result<(), KernelError> {
        self.kv
            .set(&format!("remote.{remote}.incarnation"), "0")?;
        Ok(())
    }

    pub fn remote_incarnation(&self, remote: RemoteId) -> Result<u64, KernelError> {
        let raw = self
            .kv
            .get(&format!("remote.{remote}.incarnation"))?
            .ok_or(KernelError::RemoteNotFound(remote))?;
        raw.parse()
            .map_err(|e| KernelError::Store(format!("corrupt incarnation: {e}")))
    }

    pub fn set_remote_incarnation(
        &mut self,
        remote: RemoteId,
        incarnation: u64,
    ) -> Result<(), KernelError> {
        self.kv
            .set(&format!("remote.{remote}.incarnation"), &incarnation.to_string())?;
        Ok(())
    }

    /// Forget a remote entirely (its peer gave up or was given up on).
    pub fn delete_remote(&mut self, remote: RemoteId) -> Result<(), KernelError> {
        for key in self.kv.keys_with_prefix(&format!("remote.{remote}."))? {
            self.kv.delete(&key)?;
        }
        self.clear_endpoint_clist(EndpointId::Remote(remote))?;
        Ok(())
    }

    pub fn list_remotes(&self) -> Result<Vec<RemoteId>, KernelError> {
        let mut remotes = Vec::new();
        for key in self.kv.keys_with_prefix("remote.")? {
            let rest = &key["remote.".len()..];
            if let Some(id_str) = rest.strip_suffix(".incarnation") {
                remotes.push(id_str.parse()?);
            }
        }
        remotes.sort();
        Ok(remotes)
    }

    // ── Subcluster records ──────────────────────────────────────────────

    pub fn add_subcluster(
        &mut self,
        id: SubclusterId,
        config: &ClusterConfig,
        vats: &std::collections::BTreeMap<String, kagi_types::VatId>,
    ) -> Result<(), KernelError> {
        self.set_json(&format!("subcluster.{id}.config"), config)?;
        self.set_json(&format!("subcluster.{id}.vats"), vats)?;
        Ok(())
    }

    pub fn subcluster_config(&self, id: SubclusterId) -> Result<ClusterConfig, KernelError> {
        self.get_json(&format!("subcluster.{id}.config"))?
            .ok_or(KernelError::SubclusterNotFound(id))
    }

    pub fn subcluster_vats(
        &self,
        id: SubclusterId,
    ) -> Result<std::collections::BTreeMap<String, kagi_types::VatId>, KernelError> {
        self.get_json(&format!("subcluster.{id}.vats"))?
            .ok_or(KernelError::SubclusterNotFound(id))
    }

    pub fn set_subcluster_result(
        &mut self,
        id: SubclusterId,
        result: &CapData,
    ) -> Result<(), KernelError> {
        self.set_json(&format!("subcluster.{id}.result"), result)
    }

    /// The promise that will carry the bootstrap call's return value.
    pub fn set_subcluster_result_promise(
        &mut self,
        id: SubclusterId,
        kpid: KRef,
    ) -> Result<(), KernelError> {
        self.kv
            .set(&format!("subcluster.{id}.resultKpid"), &kpid.to_string())?;
        Ok(())
    }

    pub fn subcluster_result_promise(
        &self,
        id: SubclusterId,
    ) -> Result<Option<KRef>, KernelError> {
        match self.kv.get(&format!("subcluster.{id}.resultKpid"))? {
            Some(raw) => Ok(Some(raw.parse()?)),
            None => Ok(None),
        }
    }

    pub fn clear_subcluster_result_promise(&mut self, id: SubclusterId) -> Result<(), KernelError> {
        self.kv.delete(&format!("subcluster.{id}.resultKpid"))?;
        Ok(())
    }

    pub fn subcluster_result(&self, id: SubclusterId) -> Result<Option<CapData>, KernelError> {
        self.get_json(&format!("subcluster.{id}.result"))
    }

    pub fn list_subclusters(&self) -> Result<Vec<SubclusterId>, KernelError> {
        let mut ids = Vec::new();
        for key in self.kv.keys_with_prefix("subcluster.")? {
            let rest = &key["subcluster.".len()..];
            if let Some(id_str) = rest.strip_suffix(".config") {
                ids.push(id_str.parse()?);
            }
        }
        ids.sort();
        Ok(ids)
    }

    pub fn delete_subcluster(&mut self, id: SubclusterId) -> Result<(), KernelError> {
        for key in self.kv.keys_with_prefix(&format!("subcluster.{id}."))? {
            self.kv.delete(&key)?;
        }
        Ok(())
    }

    // ── Vatstore ────────────────────────────────────────────────────────

    pub fn vatstore_get(
        &self,
        vat: kagi_types::VatId,
        key: &str,
    ) -> Result<Option<String>, KernelError> {
        Ok(self.kv.get(&format!("vs.{vat}.{key}"))?)
    }

    pub fn vatstore_set(
        &mut self,
        vat: kagi_types::VatId,
        key: &str,
        value: &str,
    ) -> Result<(), KernelError> {
        self.kv.set(&format!("vs.{vat}.{key}"), value)?;
        Ok(())
    }

    pub fn vatstore_delete(
        &mut self,
        vat: kagi_types::VatId,
        key: &str,
    ) -> Result<(), KernelError> {
        self.kv.delete(&format!("vs.{vat}.{key}"))?;
        Ok(())
    }

    pub fn clear_vatstore(&mut self, vat: kagi_types::VatId) -> Result<(), KernelError> {
        for key in self.kv.keys_with_prefix(&format!("vs.{vat}."))? {
            self.kv.delete(&key)?;
        }
        Ok(())
    }

    // ── Kernel kv area ──────────────────────────────────────────────────

    pub fn kv_get(&self, key: &str) -> Result<Option<String>, KernelError> {
        Ok(self.kv.get(&format!("kkv.{key}"))?)
    }

    pub fn kv_set(&mut self, key: &str, value: &str) -> Result<(), KernelError> {
        self.kv.set(&format!("kkv.{key}"), value)?;
        Ok(())
    }

    pub fn kv_delete(&mut self, key: &str) -> Result<(), KernelError> {
        self.kv.delete(&format!("kkv.{key}"))?;
        Ok(())
    }

    // ── Crank lifecycle ─────────────────────────────────────────────────

    pub fn in_crank(&self) -> bool {
        self.in_crank
    }

    pub fn start_crank(&mut self) -> Result<(), KernelError> {
        if self.in_crank {
            return Err(KernelError::InvariantViolation("crank already open".into()));
        }
        self.in_crank = true;
        self.crank_buffer.clear();
        self.maybe_free.clear();
        self.kv.create_savepoint(CRANK_SAVEPOINT)?;
        Ok(())
    }

    pub fn create_crank_savepoint(&mut self, label: &str) -> Result<(), KernelError> {
        debug_assert!(self.in_crank, "savepoint outside crank");
        self.kv.create_savepoint(label)?;
        Ok(())
    }

    /// Restore the labeled savepoint and discard crank-buffered output.
    pub fn rollback_crank(&mut self, label: &str) -> Result<(), KernelError> {
        self.kv.rollback_to_savepoint(label)?;
        self.crank_buffer.clear();
        self.maybe_free.clear();
        #[cfg(debug_assertions)]
        self.ledger.rollback_crank();
        Ok(())
    }

    pub fn end_crank(&mut self) -> Result<(), KernelError> {
        if !self.in_crank {
            return Err(KernelError::InvariantViolation("no crank open".into()));
        }
        self.kv.release_savepoint(CRANK_SAVEPOINT)?;
        self.in_crank = false;
        #[cfg(debug_assertions)]
        self.ledger.commit_crank();
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryKVStore;
    use kagi_types::{Polarity, VatId};

    fn store() -> KernelStore {
        KernelStore::new(Box::new(MemoryKVStore::new()))
    }

    fn vat(n: u64) -> EndpointId {
        EndpointId::Vat(VatId::new(n))
    }

    #[test]
    fn test_counters_are_monotone() {
        let mut store = store();
        assert_eq!(store.get_next_vat_id().unwrap().to_string(), "v1");
        assert_eq!(store.get_next_vat_id().unwrap().to_string(), "v2");
        assert_eq!(store.get_next_remote_id().unwrap().to_string(), "r1");
        assert_eq!(store.get_next_subcluster_id().unwrap().to_string(), "s1");
    }

    #[test]
    fn test_object_lifecycle() {
        let mut store = store();
        let (kref, record) = store.init_kernel_object(vat(1)).unwrap();
        assert_eq!(kref.to_string(), "ko1");
        assert_eq!(record.ref_count, 0);
        assert!(record.reachable);

        let loaded = store.get_kernel_object(kref).unwrap();
        assert_eq!(loaded, record);

        store.increment_ref_count(kref, "queue|slot").unwrap();
        assert_eq!(store.get_kernel_object(kref).unwrap().ref_count, 1);
        let count = store.decrement_ref_count(kref, "queue|slot").unwrap();
        assert_eq!(count, 0);
        assert!(store.take_maybe_free().contains(&kref));

        store.delete_kernel_object(kref).unwrap();
        assert!(matches!(
            store.get_kernel_object(kref),
            Err(KernelError::UnknownKref(_))
        ));
    }

    #[test]
    #[should_panic(expected = "refcount underflow")]
    fn test_refcount_underflow_panics_in_debug() {
        let mut store = store();
        let (kref, _) = store.init_kernel_object(vat(1)).unwrap();
        let _ = store.decrement_ref_count(kref, "clist");
    }

    #[test]
    fn test_reincrement_cancels_free_candidacy() {
        let mut store = store();
        let (kref, _) = store.init_kernel_object(vat(1)).unwrap();
        store.increment_ref_count(kref, "queue|slot").unwrap();
        store.decrement_ref_count(kref, "queue|slot").unwrap();
        store.increment_ref_count(kref, "clist").unwrap();
        assert!(store.take_maybe_free().is_empty());
        // rebalance so the drop-time ledger check passes
        store.decrement_ref_count(kref, "clist").unwrap();
    }

    #[test]
    fn test_promise_resolution_drains_queue() {
        let mut store = store();
        let (kpid, _) = store.init_kernel_promise(Some(vat(1))).unwrap();
        let m1 = Message::call("inc", vec![], None);
        let m2 = Message::call("dec", vec![], None);
        store.enqueue_promise_message(kpid, m1.clone()).unwrap();
        store.enqueue_promise_message(kpid, m2.clone()).unwrap();
        assert_eq!(
            store.get_kernel_promise_message_queue(kpid).unwrap().len(),
            2
        );

        let drained = store
            .resolve_kernel_promise(kpid, false, CapData::plain("\"done\""))
            .unwrap();
        assert_eq!(drained, vec![m1, m2]);

        let record = store.get_kernel_promise(kpid).unwrap();
        assert_eq!(record.state, PromiseState::Fulfilled);
        assert!(record.decider.is_none());
        assert!(store
            .get_kernel_promise_message_queue(kpid)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_promise_double_resolution_fails() {
        let mut store = store();
        let (kpid, _) = store.init_kernel_promise(Some(vat(1))).unwrap();
        store
            .resolve_kernel_promise(kpid, false, CapData::plain("1"))
            .unwrap();
        assert!(matches!(
            store.resolve_kernel_promise(kpid, true, CapData::plain("2")),
            Err(KernelError::InvariantViolation(_))
        ));
    }

    #[test]
    fn test_pipelining_onto_settled_promise_fails() {
        let mut store = store();
        let (kpid, _) = store.init_kernel_promise(Some(vat(1))).unwrap();
        store
            .resolve_kernel_promise(kpid, false, CapData::plain("1"))
            .unwrap();
        assert!(store
            .enqueue_promise_message(kpid, Message::call("late", vec![], None))
            .is_err());
    }

    #[test]
    fn test_clist_is_partial_bijection() {
        let mut store = store();
        let endpoint = vat(2);
        let kref = KRef::object(5);
        let eref = ERef::object(Polarity::Minus, 1);
        // no entry yet: both directions miss
        assert_eq!(store.kref_to_eref(endpoint, kref).unwrap(), None);
        assert_eq!(store.eref_to_kref(endpoint, eref).unwrap(), None);

        store.add_clist_entry(endpoint, kref, eref).unwrap();
        assert_eq!(store.kref_to_eref(endpoint, kref).unwrap(), Some(eref));
        assert_eq!(store.eref_to_kref(endpoint, eref).unwrap(), Some(kref));

        // duplicate insertion on either side collides
        assert!(store
            .add_clist_entry(endpoint, kref, ERef::object(Polarity::Minus, 2))
            .is_err());
        assert!(store
            .add_clist_entry(endpoint, KRef::object(6), eref)
            .is_err());

        store.forget_kref(endpoint, kref).unwrap();
        assert_eq!(store.kref_to_eref(endpoint, kref).unwrap(), None);
        assert_eq!(store.eref_to_kref(endpoint, eref).unwrap(), None);
    }

    #[test]
    fn test_clist_reachability_flag() {
        let mut store = store();
        let endpoint = vat(1);
        let kref = KRef::object(1);
        let eref = ERef::object(Polarity::Minus, 1);
        store.add_clist_entry(endpoint, kref, eref).unwrap();
        assert!(store.clist_reachable(endpoint, kref).unwrap());
        store.set_clist_reachable(endpoint, kref, false).unwrap();
        assert!(!store.clist_reachable(endpoint, kref).unwrap());
        // flag flip preserves the mapping
        assert_eq!(store.kref_to_eref(endpoint, kref).unwrap(), Some(eref));
    }

    #[test]
    fn test_run_queue_is_fifo_across_cranks() {
        let mut store = store();
        let items: Vec<RunQueueItem> = (0..5)
            .map(|i| RunQueueItem::Notify {
                endpoint: vat(1),
                kpid: KRef::promise(i),
            })
            .collect();
        store.start_crank().unwrap();
        for item in &items {
            store.enqueue_run(item).unwrap();
        }
        store.end_crank().unwrap();
        assert_eq!(store.run_queue_length().unwrap(), 5);

        store.start_crank().unwrap();
        let first = store.dequeue_run().unwrap().unwrap();
        store.end_crank().unwrap();
        assert_eq!(first, items[0]);
        for expected in &items[1..] {
            assert_eq!(store.dequeue_run().unwrap().as_ref(), Some(expected));
        }
        assert_eq!(store.dequeue_run().unwrap(), None);
    }

    #[test]
    fn test_crank_rollback_discards_everything() {
        let mut store = store();
        store.start_crank().unwrap();
        store.create_crank_savepoint("start").unwrap();
        let (kref, _) = store.init_kernel_object(vat(1)).unwrap();
        store.increment_ref_count(kref, "queue|target").unwrap();
        store.buffer_crank_output(RunQueueItem::Reap {
            vat: VatId::new(1),
        });
        store.rollback_crank("start").unwrap();
        store.end_crank().unwrap();

        // the object allocation, refcount, and buffered output all vanished
        assert!(!store.has_kernel_object(kref).unwrap());
        assert_eq!(store.crank_buffer_len(), 0);
        assert_eq!(store.run_queue_length().unwrap(), 0);
        assert!(store.take_maybe_free().is_empty());
    }

    #[test]
    fn test_flush_crank_buffer_moves_items_in_order() {
        let mut store = store();
        store.start_crank().unwrap();
        let a = RunQueueItem::Reap {
            vat: VatId::new(1),
        };
        let b = RunQueueItem::Reap {
            vat: VatId::new(2),
        };
        store.buffer_crank_output(a.clone());
        store.buffer_crank_output(b.clone());
        assert_eq!(store.run_queue_length().unwrap(), 0);
        assert_eq!(store.flush_crank_buffer().unwrap(), 2);
        store.end_crank().unwrap();
        assert_eq!(store.dequeue_run().unwrap(), Some(a));
        assert_eq!(store.dequeue_run().unwrap(), Some(b));
    }

    #[test]
    fn test_gc_actions_batched_by_priority() {
        let mut store = store();
        store
            .add_gc_actions(
                GCActionKind::RetireExports,
                vat(1),
                [KRef::object(3)],
            )
            .unwrap();
        store
            .add_gc_actions(
                GCActionKind::DropExports,
                vat(1),
                [KRef::object(3), KRef::object(4)],
            )
            .unwrap();
        assert_eq!(store.gc_action_count().unwrap(), 3);

        // drops come out before retires, batched per (kind, endpoint)
        let first = store.next_gc_action().unwrap().unwrap();
        assert_eq!(first.kind, GCActionKind::DropExports);
        assert_eq!(first.krefs, vec![KRef::object(3), KRef::object(4)]);

        let second = store.next_gc_action().unwrap().unwrap();
        assert_eq!(second.kind, GCActionKind::RetireExports);
        assert_eq!(store.next_gc_action().unwrap(), None);
    }

    #[test]
    fn test_gc_actions_dedup() {
        let mut store = store();
        for _ in 0..2 {
            store
                .add_gc_actions(GCActionKind::DropExports, vat(1), [KRef::object(1)])
                .unwrap();
        }
        assert_eq!(store.gc_action_count().unwrap(), 1);
    }

    #[test]
    fn test_discard_gc_actions_for_terminated_endpoint() {
        let mut store = store();
        store
            .add_gc_actions(GCActionKind::DropExports, vat(1), [KRef::object(1)])
            .unwrap();
        store
            .add_gc_actions(GCActionKind::DropExports, vat(2), [KRef::object(2)])
            .unwrap();
        store.discard_gc_actions_for(vat(1)).unwrap();
        let action = store.next_gc_action().unwrap().unwrap();
        assert_eq!(action.endpoint, vat(2));
    }

    #[test]
    fn test_reap_queue_dedups() {
        let mut store = store();
        store.schedule_reap(VatId::new(1)).unwrap();
        store.schedule_reap(VatId::new(1)).unwrap();
        store.schedule_reap(VatId::new(2)).unwrap();
        assert_eq!(store.next_reap_action().unwrap(), Some(VatId::new(1)));
        assert_eq!(store.next_reap_action().unwrap(), Some(VatId::new(2)));
        assert_eq!(store.next_reap_action().unwrap(), None);
    }

    #[test]
    fn test_vat_records() {
        let mut store = store();
        let vat_id = VatId::new(1);
        let config = VatConfig::from_name("echo");
        store.add_vat(vat_id, &config, None).unwrap();
        assert!(matches!(
            store.add_vat(vat_id, &config, None),
            Err(KernelError::VatAlreadyExists(_))
        ));
        assert_eq!(store.vat_state(vat_id).unwrap(), VatState::Launching);
        store.set_vat_state(vat_id, VatState::Running).unwrap();
        assert_eq!(store.vat_state(vat_id).unwrap(), VatState::Running);
        assert_eq!(store.vat_config(vat_id).unwrap(), config);

        let listed = store.list_vats().unwrap();
        assert_eq!(listed, vec![(vat_id, VatState::Running, None)]);

        store.delete_vat(vat_id).unwrap();
        assert!(store.vat_state(vat_id).is_err());
    }

    #[test]
    fn test_reap_countdown() {
        let mut store = store();
        let vat_id = VatId::new(1);
        let mut config = VatConfig::from_name("echo");
        config.reap_interval = Some(3);
        store.add_vat(vat_id, &config, None).unwrap();
        assert!(!store.countdown_to_reap(vat_id).unwrap());
        assert!(!store.countdown_to_reap(vat_id).unwrap());
        assert!(store.countdown_to_reap(vat_id).unwrap());
        // countdown resets after firing
        assert!(!store.countdown_to_reap(vat_id).unwrap());
    }

    #[test]
    fn test_vatstore_scoped_per_vat() {
        let mut store = store();
        let v1 = VatId::new(1);
        let v2 = VatId::new(2);
        store.vatstore_set(v1, "greeting", "hi").unwrap();
        store.vatstore_set(v2, "greeting", "yo").unwrap();
        assert_eq!(store.vatstore_get(v1, "greeting").unwrap().as_deref(), Some("hi"));
        store.clear_vatstore(v1).unwrap();
        assert_eq!(store.vatstore_get(v1, "greeting").unwrap(), None);
        assert_eq!(store.vatstore_get(v2, "greeting").unwrap().as_deref(), Some("yo"));
    }

    #[test]
    fn test_subcluster_records() {
        let mut store = store();
        let id = store.get_next_subcluster_id().unwrap();
        let mut vats = std::collections::BTreeMap::new();
        vats.insert("alice".to_string(), VatId::new(1));
        let config = ClusterConfig {
            bootstrap: "alice".to_string(),
            vats: [("alice".to_string(), VatConfig::from_name("alice"))]
                .into_iter()
                .collect(),
        };
        store.add_subcluster(id, &config, &vats).unwrap();
        assert_eq!(store.subcluster_config(id).unwrap(), config);
        assert_eq!(store.subcluster_vats(id).unwrap(), vats);
        assert_eq!(store.subcluster_result(id).unwrap(), None);
        store
            .set_subcluster_result(id, &CapData::plain("\"ok\""))
            .unwrap();
        assert!(store.subcluster_result(id).unwrap().is_some());
        assert_eq!(store.list_subclusters().unwrap(), vec![id]);
        store.delete_subcluster(id).unwrap();
        assert!(store.subcluster_config(id).is_err());
    }

    #[test]
    fn test_remote_incarnation() {
        let mut store = store();
        let remote = store.get_next_remote_id().unwrap();
        store.add_remote(remote).unwrap();
        assert_eq!(store.remote_incarnation(remote).unwrap(), 0);
        store.set_remote_incarnation(remote, 3).unwrap();
        assert_eq!(store.remote_incarnation(remote).unwrap(), 3);
    }

    #[test]
    fn test_kernel_kv_area_is_namespaced() {
        let mut store = store();
        store.kv_set("mode", "test").unwrap();
        assert_eq!(store.kv_get("mode").unwrap().as_deref(), Some("test"));
        store.kv_delete("mode").unwrap();
        assert_eq!(store.kv_get("mode").unwrap(), None);
    }

    #[test]
    fn test_double_start_crank_fails() {
        let mut store = store();
        store.start_crank().unwrap();
        assert!(store.start_crank().is_err());
        store.end_crank().unwrap();
        assert!(store.end_crank().is_err());
    }
}
