//! Delivery: routing one queue item to its owner.
//!
//! GC actions take priority over reaps, reaps over ordinary queue items.
//! Sends route through promise state (pipelined messages queue on the
//! promise, settled promises forward or refuse), then to the owning vat,
//! remote peer, or kernel facet. All translation and refcount settlement
//! for a delivery happens inside the delivering crank.

use serde_json::Value;
use tracing::{debug, trace, warn};

use kagi_types::{
    CapData, CrankResults, ERef, EndpointId, GCAction, GCActionKind, KRef, KernelError, Message,
    RunQueueItem, VatDelivery, VatId, VatOneResolution, VatState,
};

use crate::gc;
use crate::kernel::Kernel;
use crate::syscalls::SyscallHandler;
use crate::translator;

/// Where the current crank's work item came from; an aborted run-queue
/// item is consumed after rollback, while GC and reap actions stay pending.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum CrankSource {
    Gc,
    Reap,
    RunQueue,
    Idle,
}

impl Kernel {
    /// Pick and deliver the highest-priority pending item.
    pub(crate) async fn deliver_next(
        &mut self,
    ) -> Result<(CrankSource, CrankResults), KernelError> {
        if let Some(action) = self.store.next_gc_action()? {
            return Ok((CrankSource::Gc, self.deliver_gc_action(action).await?));
        }
        if let Some(vat) = self.store.next_reap_action()? {
            return Ok((CrankSource::Reap, self.deliver_reap(vat).await?));
        }
        let results = match self.store.dequeue_run()? {
            Some(RunQueueItem::Send { target, message }) => {
                self.route_send(target, message).await?
            }
            Some(RunQueueItem::Notify { endpoint, kpid }) => {
                self.deliver_notify(endpoint, kpid).await?
            }
            Some(RunQueueItem::GCAction(action)) => self.deliver_gc_action(action).await?,
            Some(RunQueueItem::Reap { vat }) => self.deliver_reap(vat).await?,
            None => return Ok((CrankSource::Idle, CrankResults::ok())),
        };
        Ok((CrankSource::RunQueue, results))
    }

    /// Consume the run-queue item whose crank aborted: release its holds
    /// and reject its result so the sender learns. Called after rollback,
    /// inside the still-open crank.
    pub(crate) fn discard_aborted_item(&mut self, reason: &str) -> Result<(), KernelError> {
        let Some(item) = self.store.dequeue_run()? else {
            return Ok(());
        };
        warn!(reason, "aborted crank's message discarded");
        match item {
            RunQueueItem::Send { target, message } => {
                let data = CapData::plain(
                    serde_json::json!({ "error": "delivery failed", "detail": reason })
                        .to_string(),
                );
                self.splat_send(target, message, Some(data))?;
            }
            other => {
                self.queue.splat_item(&mut self.store, &other)?;
            }
        }
        Ok(())
    }

    // ── Sends ───────────────────────────────────────────────────────────

    /// Follow the target through promise state to a deliverable endpoint.
    async fn route_send(
        &mut self,
        target: KRef,
        message: Message,
    ) -> Result<CrankResults, KernelError> {
        let mut target = target;
        loop {
            if target.is_promise() {
                let record = match self.store.get_kernel_promise(target) {
                    Ok(record) => record,
                    Err(KernelError::UnknownKref(_)) => {
                        warn!(%target, "send to vanished promise splatted");
                        return self.splat_send(target, message, None);
                    }
                    Err(e) => return Err(e),
                };
                if record.is_unresolved() {
                    // pipelining: park on the promise, holds travel along
                    trace!(%target, "message pipelined");
                    self.store.enqueue_promise_message(target, message)?;
                    return Ok(CrankResults::ok());
                }
                let value = record
                    .value
                    .clone()
                    .unwrap_or_else(|| CapData::plain("null"));
                let rejected = record.state == kagi_store::PromiseState::Rejected;
                if !rejected && value.slots.len() == 1 && value.body == "\"@0\"" {
                    // fulfilled to a reference: retarget and try again
                    let next = value.slots[0];
                    self.store.increment_ref_count(next, "queue|target")?;
                    self.store.decrement_ref_count(target, "queue|target")?;
                    target = next;
                    continue;
                }
                // rejected, or fulfilled to plain data: undeliverable
                debug!(%target, rejected, "message to settled promise refused");
                return self.splat_send(target, message, Some(value));
            }

            let record = match self.store.get_kernel_object(target) {
                Ok(record) => record,
                Err(KernelError::UnknownKref(_)) => {
                    warn!(%target, "send to vanished object splatted");
                    return self.splat_send(target, message, None);
                }
                Err(e) => return Err(e),
            };
            return match record.owner {
                EndpointId::Vat(vat) => self.deliver_send_to_vat(vat, target, message).await,
                EndpointId::Remote(remote) => {
                    self.deliver_send_to_remote(remote, target, message)
                }
                EndpointId::Kernel => self.deliver_facet_send(target, message).await,
            };
        }
    }

    /// Drop a queue hold, tolerating a record that already vanished (a
    /// splatted message may cite krefs its dead endpoint took with it).
    fn release_queue_hold(&mut self, kref: KRef, tag: &'static str) -> Result<(), KernelError> {
        let alive = if kref.is_promise() {
            self.store.has_kernel_promise(kref)?
        } else {
            self.store.has_kernel_object(kref)?
        };
        if alive {
            self.store.decrement_ref_count(kref, tag)?;
        }
        Ok(())
    }

    /// Release a dead send's holds; reject its result so callers learn.
    fn splat_send(
        &mut self,
        target: KRef,
        message: Message,
        reason: Option<CapData>,
    ) -> Result<CrankResults, KernelError> {
        self.release_queue_hold(target, "queue|target")?;
        for &slot in &message.methargs.slots {
            self.release_queue_hold(slot, "queue|slot")?;
        }
        if let Some(result) = message.result {
            self.release_queue_hold(result, "queue|result")?;
            if self.store.has_kernel_promise(result)?
                && self.store.get_kernel_promise(result)?.is_unresolved()
            {
                let data =
                    reason.unwrap_or_else(|| CapData::plain("{\"error\":\"undeliverable\"}"));
                self.queue.process_resolutions(
                    &mut self.store,
                    EndpointId::Kernel,
                    false,
                    vec![(result, true, data)],
                )?;
            }
        }
        Ok(CrankResults::ok())
    }

    async fn deliver_send_to_vat(
        &mut self,
        vat: VatId,
        target: KRef,
        message: Message,
    ) -> Result<CrankResults, KernelError> {
        let state = self.store.vat_state(vat)?;
        if state != VatState::Running {
            debug!(%vat, %state, "send to dead vat splatted");
            return self.splat_send(
                target,
                message,
                Some(CapData::plain("{\"error\":\"vat terminated\"}")),
            );
        }
        let endpoint = EndpointId::Vat(vat);
        let target_eref =
            translator::kref_to_eref(&mut self.store, endpoint, target, "queue|target")?;
        let vat_message = translator::export_message(&mut self.store, endpoint, message)?;
        let delivery = VatDelivery::Message {
            target: target_eref,
            message: vat_message,
        };
        let results = self.deliver_to_vat_worker(vat, delivery).await?;
        if results.abort.is_none() && self.store.countdown_to_reap(vat)? {
            self.store.schedule_reap(vat)?;
        }
        Ok(results)
    }

    /// Run one worker round trip with syscall servicing. Stream failures
    /// abort the crank and schedule the vat's termination.
    pub(crate) async fn deliver_to_vat_worker(
        &mut self,
        vat: VatId,
        delivery: VatDelivery,
    ) -> Result<CrankResults, KernelError> {
        let Some(handle) = self.vats.get_mut(&vat) else {
            return Err(KernelError::VatNotFound(vat));
        };
        let mut sink = SyscallHandler::new(vat, &mut self.store, &mut self.queue);
        match handle.deliver(delivery, &mut sink).await {
            Ok(mut results) => {
                if results.terminate.is_none() {
                    results.terminate = sink.termination;
                }
                // a failed syscall poisons the crank even if the vat
                // shrugged it off
                if results.abort.is_none() {
                    results.abort = sink.error;
                }
                Ok(results)
            }
            Err(e @ (KernelError::StreamRead(_) | KernelError::StreamWrite(_))) => {
                warn!(%vat, error = %e, "worker stream failed");
                let mut results = CrankResults::aborted(e.to_string());
                results.terminate = Some(kagi_types::TerminationRequest {
                    vat,
                    failure: true,
                    info: CapData::plain("{\"error\":\"worker stream failure\"}"),
                });
                Ok(results)
            }
            Err(e) => Ok(CrankResults::aborted(e.to_string())),
        }
    }

    fn deliver_send_to_remote(
        &mut self,
        remote: kagi_types::RemoteId,
        target: KRef,
        message: Message,
    ) -> Result<CrankResults, KernelError> {
        let endpoint = EndpointId::Remote(remote);
        let target_eref =
            translator::kref_to_eref(&mut self.store, endpoint, target, "queue|target")?;
        let vat_message = translator::export_message(&mut self.store, endpoint, message)?;
        let delivery = VatDelivery::Message {
            target: target_eref,
            message: vat_message,
        };
        self.send_remote_delivery(remote, &delivery)?;
        Ok(CrankResults::ok())
    }

    // ── Notifies ────────────────────────────────────────────────────────

    async fn deliver_notify(
        &mut self,
        endpoint: EndpointId,
        kpid: KRef,
    ) -> Result<CrankResults, KernelError> {
        self.store.decrement_ref_count(kpid, "notify")?;
        if gc::endpoint_terminated(&self.store, endpoint)? {
            debug!(%endpoint, %kpid, "notify to terminated endpoint splatted");
            return Ok(CrankResults::ok());
        }
        let record = self.store.get_kernel_promise(kpid)?;
        if record.is_unresolved() {
            // resolution rolled back after the notify was queued
            return Ok(CrankResults::ok());
        }
        let Some(eref) = self.store.kref_to_eref(endpoint, kpid)? else {
            return Ok(CrankResults::ok());
        };
        let rejected = record.state == kagi_store::PromiseState::Rejected;
        let value = record
            .value
            .clone()
            .unwrap_or_else(|| CapData::plain("null"));

        let results = match endpoint {
            EndpointId::Vat(vat) => {
                if self.store.vat_state(vat)? != VatState::Running {
                    return Ok(CrankResults::ok());
                }
                let data =
                    translator::export_resolution_data(&mut self.store, endpoint, value)?;
                let delivery = VatDelivery::Notify {
                    resolutions: vec![VatOneResolution(eref, rejected, data)],
                };
                self.deliver_to_vat_worker(vat, delivery).await?
            }
            EndpointId::Remote(remote) => {
                let data =
                    translator::export_resolution_data(&mut self.store, endpoint, value)?;
                let delivery = VatDelivery::Notify {
                    resolutions: vec![VatOneResolution(eref, rejected, data)],
                };
                self.send_remote_delivery(remote, &delivery)?;
                CrankResults::ok()
            }
            EndpointId::Kernel => CrankResults::ok(),
        };
        if results.abort.is_none() {
            // the subscription is spent; the endpoint no longer names it
            self.store.forget_kref(endpoint, kpid)?;
            self.store.decrement_ref_count(kpid, "clist")?;
        }
        Ok(results)
    }

    // ── GC actions ──────────────────────────────────────────────────────

    async fn deliver_gc_action(&mut self, action: GCAction) -> Result<CrankResults, KernelError> {
        if gc::endpoint_terminated(&self.store, action.endpoint)? {
            debug!(endpoint = %action.endpoint, "gc action to terminated endpoint dropped");
            return Ok(CrankResults::ok());
        }
        let eligible = gc::filter_gc_action(&self.store, &action)?;
        if eligible.is_empty() {
            return Ok(CrankResults::ok());
        }
        let mut refs: Vec<ERef> = Vec::with_capacity(eligible.len());
        for &kref in &eligible {
            if let Some(eref) = self.store.kref_to_eref(action.endpoint, kref)? {
                refs.push(eref);
            }
        }
        let delivery = match action.kind {
            GCActionKind::DropExports => VatDelivery::DropExports { refs },
            GCActionKind::RetireExports => VatDelivery::RetireExports { refs },
            GCActionKind::RetireImports => VatDelivery::RetireImports { refs },
        };
        let results = match action.endpoint {
            EndpointId::Vat(vat) => {
                if self.store.vat_state(vat)? != VatState::Running {
                    return Ok(CrankResults::ok());
                }
                self.deliver_to_vat_worker(vat, delivery).await?
            }
            EndpointId::Remote(remote) => {
                self.send_remote_delivery(remote, &delivery)?;
                CrankResults::ok()
            }
            EndpointId::Kernel => CrankResults::ok(),
        };
        if results.abort.is_none() {
            gc::settle_gc_action(&mut self.store, &action, &eligible)?;
        }
        Ok(results)
    }

    // ── Reaps ───────────────────────────────────────────────────────────

    async fn deliver_reap(&mut self, vat: VatId) -> Result<CrankResults, KernelError> {
        match self.store.vat_state(vat) {
            Ok(VatState::Running) => {}
            _ => return Ok(CrankResults::ok()),
        }
        let Some(handle) = self.vats.get_mut(&vat) else {
            return Ok(CrankResults::ok());
        };
        let mut sink = SyscallHandler::new(vat, &mut self.store, &mut self.queue);
        let reap = match handle.reap(&mut sink).await {
            Ok(reap) => reap,
            Err(e) => {
                warn!(%vat, error = %e, "reap failed");
                return Ok(CrankResults::aborted(e.to_string()));
            }
        };
        if let Some(error) = sink.error {
            return Ok(CrankResults::aborted(error));
        }
        let endpoint = EndpointId::Vat(vat);
        for eref in reap.possibly_dead_set {
            if eref.is_promise() || eref.is_local_allocation() {
                continue; // only dropped imports interest the collector
            }
            if let Some(kref) = self.store.eref_to_kref(endpoint, eref)? {
                if self.store.clist_reachable(endpoint, kref)? {
                    gc::syscall_drop_imports(&mut self.store, endpoint, &[kref])?;
                }
            }
        }
        Ok(CrankResults::ok())
    }

    // ── Kernel facet ────────────────────────────────────────────────────

    /// Messages to kernel-owned objects are control operations from system
    /// vats. Synchronous ones resolve inline; lifecycle ones are re-queued
    /// as commands so no crank awaits a worker launch.
    async fn deliver_facet_send(
        &mut self,
        target: KRef,
        message: Message,
    ) -> Result<CrankResults, KernelError> {
        if !self.facets.contains(&target) {
            return self.splat_send(
                target,
                message,
                Some(CapData::plain("{\"error\":\"no such kernel object\"}")),
            );
        }
        self.store.decrement_ref_count(target, "queue|target")?;
        for &slot in &message.methargs.slots {
            self.store.decrement_ref_count(slot, "queue|slot")?;
        }
        let parsed: Result<(String, Vec<Value>), _> =
            serde_json::from_str(&message.methargs.body);
        let Ok((method, args)) = parsed else {
            return self.reject_facet_result(
                message.result,
                CapData::plain("{\"error\":\"malformed facet call\"}"),
            );
        };
        debug!(%target, method, "facet call");
        // argument errors reject the result promise; they must not escape
        // as crank failures
        let outcome = (|| -> Result<Value, KernelError> {
            match method.as_str() {
                "getStatus" => {
                    let status = self.status()?;
                    Ok(serde_json::to_value(status)
                        .map_err(|e| KernelError::Store(e.to_string()))?)
                }
                "kvGet" => {
                    let key = args
                        .first()
                        .and_then(Value::as_str)
                        .ok_or_else(|| KernelError::Protocol("kvGet needs a key".into()))?;
                    Ok(self
                        .store
                        .kv_get(key)?
                        .map(Value::String)
                        .unwrap_or(Value::Null))
                }
                "kvSet" => {
                    let key = args
                        .first()
                        .and_then(Value::as_str)
                        .ok_or_else(|| KernelError::Protocol("kvSet needs a key".into()))?;
                    let value = args
                        .get(1)
                        .and_then(Value::as_str)
                        .ok_or_else(|| KernelError::Protocol("kvSet needs a value".into()))?;
                    self.store.kv_set(key, value)?;
                    Ok(Value::Null)
                }
                "terminateVat" => {
                    let vat: VatId = args
                        .first()
                        .and_then(Value::as_str)
                        .and_then(|s| s.parse().ok())
                        .ok_or_else(|| KernelError::Protocol("terminateVat needs a vat id".into()))?;
                    let _ = self.cmd_tx.send(crate::kernel::KernelCommand::TerminateVat {
                        vat,
                        reason: CapData::plain("{\"error\":\"terminated by system vat\"}"),
                        reply: oneshot_drop(),
                    });
                    Ok(Value::Null)
                }
                "terminateSubcluster" => {
                    let id: kagi_types::SubclusterId = args
                        .first()
                        .and_then(Value::as_str)
                        .and_then(|s| s.parse().ok())
                        .ok_or_else(|| {
                            KernelError::Protocol("terminateSubcluster needs an id".into())
                        })?;
                    let _ = self
                        .cmd_tx
                        .send(crate::kernel::KernelCommand::TerminateSubcluster {
                            id,
                            reason: CapData::plain("{\"error\":\"terminated by system vat\"}"),
                            reply: oneshot_drop(),
                        });
                    Ok(Value::Null)
                }
                other => Err(KernelError::Protocol(format!(
                    "unknown kernel facet method {other:?}"
                ))),
            }
        })();
        match outcome {
            Ok(value) => {
                if let Some(result) = message.result {
                    self.store.decrement_ref_count(result, "queue|result")?;
                    self.queue.process_resolutions(
                        &mut self.store,
                        EndpointId::Kernel,
                        false,
                        vec![(result, false, CapData::plain(value.to_string()))],
                    )?;
                }
                Ok(CrankResults::ok())
            }
            Err(e) => self.reject_facet_result(
                message.result,
                CapData::plain(
                    serde_json::json!({ "error": e.to_string(), "kind": e.kind() }).to_string(),
                ),
            ),
        }
    }

    fn reject_facet_result(
        &mut self,
        result: Option<KRef>,
        data: CapData,
    ) -> Result<CrankResults, KernelError> {
        if let Some(result) = result {
            self.store.decrement_ref_count(result, "queue|result")?;
            self.queue.process_resolutions(
                &mut self.store,
                EndpointId::Kernel,
                false,
                vec![(result, true, data)],
            )?;
        }
        Ok(CrankResults::ok())
    }
}

/// A reply sender nobody waits on (facet-initiated lifecycle commands).
fn oneshot_drop<T>() -> tokio::sync::oneshot::Sender<T> {
    tokio::sync::oneshot::channel().0
}
