//! Kernel-side queueing: send/notify scheduling, promise subscriptions,
//! and resolution fan-out.
//!
//! Inside a crank everything goes through the store's crank buffer so an
//! aborted crank emits nothing; between cranks (kernel-initiated calls)
//! items land directly on the run queue and arm the wake notifier.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Notify, oneshot};
use tracing::{debug, trace, warn};

use kagi_store::KernelStore;
use kagi_types::{
    CapData, EndpointId, KRef, KernelError, Message, RunQueueItem,
};

/// What a kernel subscriber learns when a promise settles.
#[derive(Clone, Debug)]
pub struct ResolutionOutcome {
    pub rejected: bool,
    pub data: CapData,
}

pub struct KernelQueue {
    /// Armed when the run queue goes nonempty; the run loop parks on it.
    wake: Arc<Notify>,
    /// One-shot resolvers for kernel-subscribed promises.
    subscriptions: HashMap<KRef, Vec<oneshot::Sender<ResolutionOutcome>>>,
    /// Promises settled during the current crank; their kernel callbacks
    /// fire at flush, after the state commits.
    resolved_this_crank: Vec<(KRef, ResolutionOutcome)>,
}

impl Default for KernelQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl KernelQueue {
    pub fn new() -> Self {
        Self {
            wake: Arc::new(Notify::new()),
            subscriptions: HashMap::new(),
            resolved_this_crank: Vec::new(),
        }
    }

    pub fn wake_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.wake)
    }

    /// Stage an item: crank-buffered mid-crank, direct (plus wake) between
    /// cranks. Takes the item's queue holds.
    fn stage(&self, store: &mut KernelStore, item: RunQueueItem) -> Result<(), KernelError> {
        for (kref, tag) in item.queue_holds() {
            store.increment_ref_count(kref, tag)?;
        }
        if store.in_crank() {
            store.buffer_crank_output(item);
        } else {
            store.enqueue_run(&item)?;
            self.wake.notify_one();
        }
        Ok(())
    }

    pub fn enqueue_send(
        &self,
        store: &mut KernelStore,
        target: KRef,
        message: Message,
    ) -> Result<(), KernelError> {
        self.stage(store, RunQueueItem::Send { target, message })
    }

    pub fn enqueue_notify(
        &self,
        store: &mut KernelStore,
        endpoint: EndpointId,
        kpid: KRef,
    ) -> Result<(), KernelError> {
        self.stage(store, RunQueueItem::Notify { endpoint, kpid })
    }

    /// An endpoint asks to hear about a promise. Settled promises notify
    /// immediately; unresolved ones record the subscription.
    pub fn subscribe(
        &self,
        store: &mut KernelStore,
        endpoint: EndpointId,
        kpid: KRef,
    ) -> Result<(), KernelError> {
        let record = store.get_kernel_promise(kpid)?;
        if record.is_unresolved() {
            if store.add_promise_subscriber(kpid, endpoint)? {
                store.increment_ref_count(kpid, "subscribe")?;
            }
        } else {
            self.enqueue_notify(store, endpoint, kpid)?;
        }
        Ok(())
    }

    /// Kernel-side subscription with a one-shot resolver, fired at flush of
    /// the crank that settles the promise.
    pub fn subscribe_kernel(
        &mut self,
        store: &mut KernelStore,
        kpid: KRef,
    ) -> Result<oneshot::Receiver<ResolutionOutcome>, KernelError> {
        let (tx, rx) = oneshot::channel();
        let record = store.get_kernel_promise(kpid)?;
        if record.is_unresolved() {
            if store.add_promise_subscriber(kpid, EndpointId::Kernel)? {
                store.increment_ref_count(kpid, "subscribe")?;
            }
            self.subscriptions.entry(kpid).or_default().push(tx);
        } else {
            // already settled: fire straight away
            let _ = tx.send(ResolutionOutcome {
                rejected: record.state == kagi_store::PromiseState::Rejected,
                data: record.value.clone().unwrap_or_else(|| CapData::plain("null")),
            });
        }
        Ok(rx)
    }

    /// Kernel-initiated call: allocate a result promise, subscribe to it,
    /// and enqueue the send. Returns (result promise, resolver receiver).
    pub fn enqueue_message(
        &mut self,
        store: &mut KernelStore,
        target: KRef,
        method: &str,
        args: Vec<serde_json::Value>,
    ) -> Result<(KRef, oneshot::Receiver<ResolutionOutcome>), KernelError> {
        // fail fast on a dead target so no orphan promise is minted
        if target.is_promise() {
            store.get_kernel_promise(target)?;
        } else {
            store.get_kernel_object(target)?;
        }
        let (kpid, _) = store.init_kernel_promise(None)?;
        // the caller names this promise until it releases it
        store.increment_ref_count(kpid, "external")?;
        let rx = self.subscribe_kernel(store, kpid)?;
        let message = Message::call(method, args, Some(kpid));
        self.enqueue_send(store, target, message)?;
        debug!(%target, method, %kpid, "kernel message enqueued");
        Ok((kpid, rx))
    }

    /// Apply a batch of resolutions submitted by `resolver`.
    ///
    /// With `enforce_decider`, each promise must be unresolved and decided
    /// by `resolver` (the vat syscall path). Kernel-internal resolution
    /// (termination, undeliverable sends) bypasses the check.
    pub fn process_resolutions(
        &mut self,
        store: &mut KernelStore,
        resolver: EndpointId,
        enforce_decider: bool,
        resolutions: Vec<(KRef, bool, CapData)>,
    ) -> Result<(), KernelError> {
        for (kpid, rejected, data) in resolutions {
            // keep the promise and its citations alive through processing
            store.increment_ref_count(kpid, "resolve|kpid")?;
            for &slot in &data.slots {
                store.increment_ref_count(slot, "resolve|slot")?;
            }

            let record = store.get_kernel_promise(kpid)?;
            if !record.is_unresolved() {
                return Err(KernelError::InvariantViolation(format!(
                    "resolution of settled promise {kpid}"
                )));
            }
            if enforce_decider && record.decider != Some(resolver) {
                return Err(KernelError::InvariantViolation(format!(
                    "{resolver} resolved {kpid} but decider is {:?}",
                    record.decider
                )));
            }

            // fan out to subscribers; their subscribe holds are consumed
            for subscriber in record.subscribers.iter().copied() {
                store.decrement_ref_count(kpid, "subscribe")?;
                if subscriber == EndpointId::Kernel {
                    continue; // callback fires at flush
                }
                self.enqueue_notify(store, subscriber, kpid)?;
            }

            // the settled value holds its citations until the record dies
            for &slot in &data.slots {
                store.increment_ref_count(slot, "data|slot")?;
            }

            let drained = store.resolve_kernel_promise(kpid, rejected, data.clone())?;
            for message in drained {
                // holds travelled with the message from the promise queue
                store.buffer_crank_output(RunQueueItem::Send {
                    target: kpid,
                    message,
                });
            }

            // the resolver's own pairing is spent
            if let Some(eref) = store.kref_to_eref(resolver, kpid)? {
                trace!(%resolver, %kpid, %eref, "decider pairing retired");
                store.forget_kref(resolver, kpid)?;
                store.decrement_ref_count(kpid, "clist")?;
            }

            self.resolved_this_crank
                .push((kpid, ResolutionOutcome { rejected, data: data.clone() }));

            for &slot in &data.slots {
                store.decrement_ref_count(slot, "resolve|slot")?;
            }
            store.decrement_ref_count(kpid, "resolve|kpid")?;
        }
        Ok(())
    }

    /// Commit path: move crank-buffered items to the run queue and fire the
    /// kernel resolvers for promises settled this crank.
    pub fn flush_crank(&mut self, store: &mut KernelStore) -> Result<u64, KernelError> {
        let count = store.flush_crank_buffer()?;
        for (kpid, outcome) in self.resolved_this_crank.drain(..) {
            if let Some(senders) = self.subscriptions.remove(&kpid) {
                for sender in senders {
                    if sender.send(outcome.clone()).is_err() {
                        warn!(%kpid, "kernel subscriber went away before resolution");
                    }
                }
            }
        }
        if count > 0 {
            self.wake.notify_one();
        }
        Ok(count)
    }

    /// Abort path: the crank rolled back, so nothing resolved.
    pub fn abort_crank(&mut self) {
        self.resolved_this_crank.clear();
    }

    /// Release the queue holds of an item that will never be delivered.
    pub fn splat_item(&self, store: &mut KernelStore, item: &RunQueueItem) -> Result<(), KernelError> {
        for (kref, tag) in item.queue_holds() {
            store.decrement_ref_count(kref, tag)?;
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use kagi_store::MemoryKVStore;
    use kagi_types::VatId;

    fn setup() -> (KernelStore, KernelQueue) {
        (
            KernelStore::new(Box::new(MemoryKVStore::new())),
            KernelQueue::new(),
        )
    }

    fn vat(n: u64) -> EndpointId {
        EndpointId::Vat(VatId::new(n))
    }

    #[test]
    fn test_enqueue_outside_crank_goes_direct() {
        let (mut store, queue) = setup();
        let (target, _) = store.init_kernel_object(vat(1)).unwrap();
        queue
            .enqueue_send(&mut store, target, Message::call("poke", vec![], None))
            .unwrap();
        assert_eq!(store.run_queue_length().unwrap(), 1);
        assert_eq!(store.get_kernel_object(target).unwrap().ref_count, 1);
    }

    #[test]
    fn test_enqueue_inside_crank_is_buffered() {
        let (mut store, mut queue) = setup();
        let (target, _) = store.init_kernel_object(vat(1)).unwrap();
        store.start_crank().unwrap();
        queue
            .enqueue_send(&mut store, target, Message::call("poke", vec![], None))
            .unwrap();
        assert_eq!(store.run_queue_length().unwrap(), 0);
        assert_eq!(store.crank_buffer_len(), 1);
        queue.flush_crank(&mut store).unwrap();
        store.end_crank().unwrap();
        assert_eq!(store.run_queue_length().unwrap(), 1);
    }

    #[test]
    fn test_subscribe_then_resolve_notifies_each_subscriber_once() {
        let (mut store, mut queue) = setup();
        let (kpid, _) = store.init_kernel_promise(Some(vat(1))).unwrap();
        queue.subscribe(&mut store, vat(2), kpid).unwrap();
        queue.subscribe(&mut store, vat(2), kpid).unwrap(); // dedup
        queue.subscribe(&mut store, vat(3), kpid).unwrap();

        store.start_crank().unwrap();
        queue
            .process_resolutions(
                &mut store,
                vat(1),
                true,
                vec![(kpid, false, CapData::plain("\"done\""))],
            )
            .unwrap();
        queue.flush_crank(&mut store).unwrap();
        store.end_crank().unwrap();

        let mut notified = Vec::new();
        while let Some(item) = store.dequeue_run().unwrap() {
            if let RunQueueItem::Notify { endpoint, kpid: k } = item {
                assert_eq!(k, kpid);
                notified.push(endpoint);
            }
        }
        assert_eq!(notified, vec![vat(2), vat(3)]);
    }

    #[test]
    fn test_resolution_by_non_decider_fails() {
        let (mut store, mut queue) = setup();
        let (kpid, _) = store.init_kernel_promise(Some(vat(1))).unwrap();
        store.start_crank().unwrap();
        let result = queue.process_resolutions(
            &mut store,
            vat(2),
            true,
            vec![(kpid, false, CapData::plain("1"))],
        );
        assert!(matches!(result, Err(KernelError::InvariantViolation(_))));
    }

    #[test]
    fn test_resolution_drains_pipelined_queue_to_buffer() {
        let (mut store, mut queue) = setup();
        let (kpid, _) = store.init_kernel_promise(Some(vat(1))).unwrap();
        let queued = Message::call("inc", vec![], None);
        store.increment_ref_count(kpid, "queue|target").unwrap();
        store.enqueue_promise_message(kpid, queued.clone()).unwrap();

        store.start_crank().unwrap();
        queue
            .process_resolutions(
                &mut store,
                vat(1),
                true,
                vec![(kpid, false, CapData::plain("\"counter\""))],
            )
            .unwrap();
        assert_eq!(store.crank_buffer_len(), 1);
        queue.flush_crank(&mut store).unwrap();
        store.end_crank().unwrap();

        match store.dequeue_run().unwrap().unwrap() {
            RunQueueItem::Send { target, message } => {
                assert_eq!(target, kpid);
                assert_eq!(message, queued);
            }
            other => panic!("unexpected item {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_kernel_subscription_fires_at_flush() {
        let (mut store, mut queue) = setup();
        let (target, _) = store.init_kernel_object(vat(1)).unwrap();
        let (kpid, mut rx) = queue
            .enqueue_message(&mut store, target, "hello", vec![serde_json::json!("x")])
            .unwrap();

        // nothing fires before resolution
        assert!(rx.try_recv().is_err());

        store.start_crank().unwrap();
        // give the promise a decider so the enforced path passes
        store.set_promise_decider(kpid, Some(vat(1))).unwrap();
        queue
            .process_resolutions(
                &mut store,
                vat(1),
                true,
                vec![(kpid, false, CapData::plain("\"reply\""))],
            )
            .unwrap();
        queue.flush_crank(&mut store).unwrap();
        store.end_crank().unwrap();

        let outcome = rx.await.unwrap();
        assert!(!outcome.rejected);
        assert_eq!(outcome.data.body, "\"reply\"");
    }

    #[test]
    fn test_abort_discards_pending_callbacks() {
        let (mut store, mut queue) = setup();
        let (kpid, _) = store.init_kernel_promise(Some(vat(1))).unwrap();
        let _rx = queue.subscribe_kernel(&mut store, kpid).unwrap();

        store.start_crank().unwrap();
        store.create_crank_savepoint("start").unwrap();
        queue
            .process_resolutions(
                &mut store,
                vat(1),
                true,
                vec![(kpid, false, CapData::plain("1"))],
            )
            .unwrap();
        store.rollback_crank("start").unwrap();
        queue.abort_crank();
        queue.flush_crank(&mut store).unwrap();
        store.end_crank().unwrap();

        // the promise is still unresolved after the rollback
        assert!(store.get_kernel_promise(kpid).unwrap().is_unresolved());
    }

    #[test]
    fn test_splat_releases_queue_holds() {
        let (mut store, queue) = setup();
        let (target, _) = store.init_kernel_object(vat(1)).unwrap();
        queue
            .enqueue_send(&mut store, target, Message::call("poke", vec![], None))
            .unwrap();
        let item = store.dequeue_run().unwrap().unwrap();
        queue.splat_item(&mut store, &item).unwrap();
        assert_eq!(store.get_kernel_object(target).unwrap().ref_count, 0);
        assert!(store.take_maybe_free().contains(&target));
    }
}
