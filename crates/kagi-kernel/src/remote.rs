//! Remote-peer integration.
//!
//! Outbound: a delivery aimed at a remote-owned object is translated into
//! the remote's c-list namespace, serialized, and handed to the network
//! layer as a `remoteDeliver` payload. Inbound: a peer's frame is a syscall
//! in its namespace, serviced in its own crank. Incarnation changes and
//! give-ups tear down everything minted under the old identity, because a
//! kref↔eref binding from a previous incarnation must never resolve.

use tracing::{debug, info, warn};

use kagi_types::{
    CapData, EndpointId, KernelError, Message, RemoteId, VatDelivery, VatSyscall,
};

use crate::gc;
use crate::kernel::{Kernel, START_SAVEPOINT};
use crate::translator;

/// Hands outbound frames to the network layer. Implemented by the remote
/// network's handle; tests use a recording stub.
pub trait RemoteSender: Send {
    fn send_frame(&self, remote: RemoteId, frame: String);

    /// Abort every delay, dial, and queue; part of kernel shutdown.
    fn stop(&self);
}

impl Kernel {
    /// Serialize a translated delivery and ship it.
    pub(crate) fn send_remote_delivery(
        &mut self,
        remote: RemoteId,
        delivery: &VatDelivery,
    ) -> Result<(), KernelError> {
        let frame = serde_json::to_string(delivery)
            .map_err(|e| KernelError::Protocol(format!("encode remote delivery: {e}")))?;
        match &self.remote_sender {
            Some(sender) => {
                debug!(%remote, "remote delivery dispatched");
                sender.send_frame(remote, frame);
                Ok(())
            }
            None => {
                warn!(%remote, "no remote network attached, delivery dropped");
                Ok(())
            }
        }
    }

    /// Service one inbound `remoteDeliver` frame as its own crank.
    pub(crate) fn handle_remote_frame(
        &mut self,
        from: RemoteId,
        frame: &str,
    ) -> Result<Option<String>, KernelError> {
        self.store.remote_incarnation(from)?; // the peer must be known
        let syscall: VatSyscall = serde_json::from_str(frame)
            .map_err(|e| KernelError::Protocol(format!("remote frame: {e}")))?;

        self.store.start_crank()?;
        self.store.create_crank_savepoint(START_SAVEPOINT)?;
        let outcome = self.apply_remote_syscall(from, syscall);
        match &outcome {
            Ok(()) => {
                self.queue.flush_crank(&mut self.store)?;
                gc::process_maybe_free(&mut self.store)?;
            }
            Err(e) => {
                warn!(%from, error = %e, "remote frame rejected, rolling back");
                self.store.rollback_crank(START_SAVEPOINT)?;
                self.queue.abort_crank();
            }
        }
        self.store.end_crank()?;
        outcome?;
        Ok(None)
    }

    fn apply_remote_syscall(
        &mut self,
        from: RemoteId,
        syscall: VatSyscall,
    ) -> Result<(), KernelError> {
        let endpoint = EndpointId::Remote(from);
        match syscall {
            VatSyscall::Send {
                target,
                methargs,
                result,
            } => {
                let target = translator::eref_to_kref(&mut self.store, endpoint, target)?;
                let methargs = translator::import_capdata(&mut self.store, endpoint, methargs)?;
                let result = result
                    .map(|eref| translator::result_eref_to_kref(&mut self.store, endpoint, eref))
                    .transpose()?;
                self.queue
                    .enqueue_send(&mut self.store, target, Message::new(methargs, result))
            }
            VatSyscall::Subscribe { target } => {
                let kpid = translator::eref_to_kref(&mut self.store, endpoint, target)?;
                self.queue.subscribe(&mut self.store, endpoint, kpid)
            }
            VatSyscall::Resolve { resolutions } => {
                let mut translated = Vec::with_capacity(resolutions.len());
                for resolution in resolutions {
                    let kpid = self
                        .store
                        .eref_to_kref(endpoint, resolution.0)?
                        .ok_or(KernelError::UnknownEref {
                            endpoint,
                            eref: resolution.0,
                        })?;
                    let data =
                        translator::import_capdata(&mut self.store, endpoint, resolution.2)?;
                    translated.push((kpid, resolution.1, data));
                }
                self.queue
                    .process_resolutions(&mut self.store, endpoint, true, translated)
            }
            VatSyscall::DropImports { refs } => {
                let krefs = self.remote_known_krefs(endpoint, &refs)?;
                gc::syscall_drop_imports(&mut self.store, endpoint, &krefs)
            }
            VatSyscall::RetireImports { refs } => {
                let krefs = self.remote_known_krefs(endpoint, &refs)?;
                gc::syscall_retire_imports(&mut self.store, endpoint, &krefs)
            }
            VatSyscall::RetireExports { refs } => {
                let krefs = self.remote_known_krefs(endpoint, &refs)?;
                gc::syscall_retire_exports(&mut self.store, endpoint, &krefs)
            }
            VatSyscall::Exit { .. }
            | VatSyscall::VatstoreGet { .. }
            | VatSyscall::VatstoreSet { .. }
            | VatSyscall::VatstoreDelete { .. } => Err(KernelError::Protocol(format!(
                "remote peer {from} sent a vat-only syscall"
            ))),
        }
    }

    fn remote_known_krefs(
        &mut self,
        endpoint: EndpointId,
        refs: &[kagi_types::ERef],
    ) -> Result<Vec<kagi_types::KRef>, KernelError> {
        refs.iter()
            .map(|&eref| {
                self.store
                    .eref_to_kref(endpoint, eref)?
                    .ok_or(KernelError::UnknownEref { endpoint, eref })
            })
            .collect()
    }

    /// Mint an eref for `kref` in the remote's namespace so the peer can
    /// name it. The granting side of establishing a remote link.
    pub(crate) fn export_to_remote(
        &mut self,
        remote: RemoteId,
        kref: kagi_types::KRef,
    ) -> Result<kagi_types::ERef, KernelError> {
        self.store.remote_incarnation(remote)?;
        let endpoint = EndpointId::Remote(remote);
        if let Some(eref) = self.store.kref_to_eref(endpoint, kref)? {
            return Ok(eref);
        }
        let data = CapData::new("\"@0\"", vec![kref]);
        let translated =
            translator::export_resolution_data(&mut self.store, endpoint, data)?;
        Ok(translated.slots[0])
    }

    /// `remoteGiveUp`: the peer dropped all state about us; reciprocate.
    pub(crate) fn remote_give_up(&mut self, remote: RemoteId) -> Result<(), KernelError> {
        self.store.remote_incarnation(remote)?;
        info!(%remote, "peer gave up, tearing down its state");
        self.store.start_crank()?;
        let reason = CapData::plain("{\"error\":\"remote peer gave up\"}");
        let outcome = (|| -> Result<(), KernelError> {
            self.teardown_endpoint_state(EndpointId::Remote(remote), &reason)?;
            self.queue.flush_crank(&mut self.store)?;
            gc::process_maybe_free(&mut self.store)?;
            Ok(())
        })();
        if outcome.is_err() {
            self.store.rollback_crank(kagi_store::CRANK_SAVEPOINT)?;
            self.queue.abort_crank();
        }
        self.store.end_crank()?;
        outcome?;
        self.store.delete_remote(remote)?;
        Ok(())
    }

    /// `remoteIncarnationChange`: stale bindings must never resolve.
    pub(crate) fn remote_incarnation_change(
        &mut self,
        remote: RemoteId,
        new_incarnation: u64,
    ) -> Result<(), KernelError> {
        let old = self.store.remote_incarnation(remote)?;
        if new_incarnation <= old {
            return Err(KernelError::Protocol(format!(
                "incarnation of {remote} went backwards: {old} -> {new_incarnation}"
            )));
        }
        info!(%remote, old, new_incarnation, "remote incarnation changed");
        self.store.start_crank()?;
        let reason = CapData::plain("{\"error\":\"remote incarnation changed\"}");
        let outcome = (|| -> Result<(), KernelError> {
            self.teardown_endpoint_state(EndpointId::Remote(remote), &reason)?;
            self.queue.flush_crank(&mut self.store)?;
            gc::process_maybe_free(&mut self.store)?;
            Ok(())
        })();
        if outcome.is_err() {
            self.store.rollback_crank(kagi_store::CRANK_SAVEPOINT)?;
            self.queue.abort_crank();
        }
        self.store.end_crank()?;
        outcome?;
        self.store.set_remote_incarnation(remote, new_incarnation)?;
        Ok(())
    }
}

/// Recording sender for tests.
#[derive(Clone, Default)]
pub struct NullRemoteSender;

impl RemoteSender for NullRemoteSender {
    fn send_frame(&self, remote: RemoteId, _frame: String) {
        debug!(%remote, "frame dropped by null sender");
    }

    fn stop(&self) {}
}
