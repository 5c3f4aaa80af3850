//! Vat and subcluster lifecycle.
//!
//! Launch is a worker spawn plus the init handshake; termination rejects
//! every promise the dying vat decided, settles its c-list, and drops its
//! pending GC work, all inside one kernel crank so observers see either
//! the whole teardown or none of it.

use std::collections::BTreeMap;

use serde_json::json;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use kagi_types::{
    CapData, ClusterConfig, ERef, EndpointId, KRef, KernelError, Message, SubclusterId, VatConfig,
    VatId, VatState,
};

use crate::gc;
use crate::kernel::{Kernel, KernelCommand};
use crate::queue::ResolutionOutcome;
use crate::syscalls::SyscallHandler;
use crate::translator;
use crate::vat::VatHandle;

impl Kernel {
    pub(crate) async fn launch_vat_internal(
        &mut self,
        config: &VatConfig,
        subcluster: Option<SubclusterId>,
    ) -> Result<VatId, KernelError> {
        config.validate()?;
        let vat = self.store.get_next_vat_id()?;
        self.store.add_vat(vat, config, subcluster)?;

        let stream = self.platform.launch_worker(vat, config).await?;
        let mut handle = VatHandle::new(vat, stream);
        {
            let mut sink = SyscallHandler::new(vat, &mut self.store, &mut self.queue);
            handle.init(config, &mut sink).await?;
        }
        handle.set_state(VatState::Running);
        self.store.set_vat_state(vat, VatState::Running)?;

        // the root export exists from birth and is pinned by the kernel
        let root = translator::eref_to_kref(
            &mut self.store,
            EndpointId::Vat(vat),
            "o+0".parse().expect("static eref"),
        )?;
        self.store.increment_ref_count(root, "pin")?;

        self.vats.insert(vat, handle);
        info!(%vat, %root, "vat launched");
        Ok(vat)
    }

    /// Launch every vat of a cluster, persist the records, and fire the
    /// bootstrap message. The caller gets the result promise's receiver;
    /// a second receiver persists the result when it settles.
    pub(crate) async fn launch_subcluster_internal(
        &mut self,
        config: ClusterConfig,
    ) -> Result<
        (
            SubclusterId,
            BTreeMap<String, VatId>,
            oneshot::Receiver<ResolutionOutcome>,
        ),
        KernelError,
    > {
        config.validate()?;
        let id = self.store.get_next_subcluster_id()?;

        let mut vats = BTreeMap::new();
        for (name, vat_config) in &config.vats {
            let vat = self.launch_vat_internal(vat_config, Some(id)).await?;
            vats.insert(name.clone(), vat);
        }
        self.store.add_subcluster(id, &config, &vats)?;

        // bootstrap(vats): a record of every root, slot-encoded
        let mut body_map = serde_json::Map::new();
        let mut slots = Vec::with_capacity(vats.len());
        for (index, (name, vat)) in vats.iter().enumerate() {
            body_map.insert(name.clone(), json!(format!("@{index}")));
            slots.push(self.vat_root(*vat)?);
        }

        let bootstrap_vat = vats[&config.bootstrap];
        let bootstrap_root = self.vat_root(bootstrap_vat)?;
        let (kpid, _) = self.store.init_kernel_promise(None)?;
        // the subcluster record names its result until termination
        self.store.increment_ref_count(kpid, "external")?;
        self.store.set_subcluster_result_promise(id, kpid)?;

        let result_rx = self.queue.subscribe_kernel(&mut self.store, kpid)?;
        let persist_rx = self.queue.subscribe_kernel(&mut self.store, kpid)?;
        let cmd_tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            if let Ok(outcome) = persist_rx.await {
                let _ = cmd_tx.send(KernelCommand::RecordSubclusterResult { id, outcome });
            }
        });

        let body = json!(["bootstrap", [serde_json::Value::Object(body_map)]]).to_string();
        let message = Message::new(CapData::new(body, slots), Some(kpid));
        self.queue
            .enqueue_send(&mut self.store, bootstrap_root, message)?;

        info!(%id, vats = vats.len(), bootstrap = %config.bootstrap, "subcluster launched");
        Ok((id, vats, result_rx))
    }

    /// Tear a vat down: worker first, then kernel state in one crank.
    pub(crate) async fn terminate_vat_internal(
        &mut self,
        vat: VatId,
        reason: CapData,
        failure: bool,
    ) -> Result<(), KernelError> {
        let state = self.store.vat_state(vat)?;
        if !state.is_live() {
            return Ok(()); // already gone; terminating twice is a no-op
        }
        info!(%vat, failure, "terminating vat");
        self.store.set_vat_state(vat, VatState::Terminating)?;
        if let Some(mut handle) = self.vats.remove(&vat) {
            handle.set_state(VatState::Terminating);
            handle.terminate(Some(reason.body.as_str())).await;
        }
        self.platform.stop_worker(vat).await?;

        let endpoint = EndpointId::Vat(vat);
        self.store.start_crank()?;
        let teardown = (|| -> Result<(), KernelError> {
            // the kernel stops pinning the root
            let root: ERef = "o+0".parse().expect("static eref");
            if let Some(root_kref) = self.store.eref_to_kref(endpoint, root)? {
                self.store.decrement_ref_count(root_kref, "pin")?;
            }

            self.teardown_endpoint_state(endpoint, &reason)?;
            self.queue.flush_crank(&mut self.store)?;
            gc::process_maybe_free(&mut self.store)?;
            Ok(())
        })();
        if let Err(e) = &teardown {
            warn!(%vat, error = %e, "teardown crank failed, rolling back");
            self.store.rollback_crank(kagi_store::CRANK_SAVEPOINT)?;
            self.queue.abort_crank();
        }
        self.store.end_crank()?;
        teardown?;

        self.store.clear_vatstore(vat)?;
        self.store.set_vat_state(vat, VatState::Terminated)?;
        Ok(())
    }

    /// Kernel-side teardown shared by vat termination and remote loss:
    /// reject every promise the endpoint decided, settle its c-list, and
    /// drop its pending GC work. Runs inside an open crank.
    pub(crate) fn teardown_endpoint_state(
        &mut self,
        endpoint: EndpointId,
        reason: &CapData,
    ) -> Result<(), KernelError> {
        // reject everything this endpoint decided
        let decided: Vec<KRef> = self
            .store
            .list_promises()?
            .into_iter()
            .filter(|(_, record)| record.is_unresolved() && record.decider == Some(endpoint))
            .map(|(kpid, _)| kpid)
            .collect();
        for kpid in decided {
            debug!(%endpoint, %kpid, "rejecting promise of dead decider");
            self.queue.process_resolutions(
                &mut self.store,
                endpoint,
                false,
                vec![(kpid, true, reason.clone())],
            )?;
        }

        // settle and drop the c-list
        for (kref, eref, reachable) in self.store.clear_endpoint_clist(endpoint)? {
            if kref.is_promise() {
                self.store.decrement_ref_count(kref, "clist")?;
            } else if eref.is_local_allocation() {
                // its own export is now ownerless
                let mut record = self.store.get_kernel_object(kref)?;
                record.reachable = false;
                self.store.set_kernel_object(kref, &record)?;
                for importer in self.store.importers_of(kref, endpoint)? {
                    if !gc::endpoint_terminated(&self.store, importer)? {
                        self.store.add_gc_actions(
                            kagi_types::GCActionKind::RetireImports,
                            importer,
                            [kref],
                        )?;
                    }
                }
                gc::examine_object(&mut self.store, kref)?;
            } else {
                // an import: recognition and (maybe) reachability end
                if reachable {
                    self.store.decrement_ref_count(kref, "clist")?;
                }
                let mut record = self.store.get_kernel_object(kref)?;
                record.recognizable = record.recognizable.saturating_sub(1);
                self.store.set_kernel_object(kref, &record)?;
                gc::examine_object(&mut self.store, kref)?;
            }
        }

        self.store.discard_gc_actions_for(endpoint)?;
        Ok(())
    }

    /// Terminate every member vat (launch order), then reject the
    /// subcluster's result promise if it never settled.
    pub(crate) async fn terminate_subcluster_internal(
        &mut self,
        id: SubclusterId,
        reason: CapData,
    ) -> Result<(), KernelError> {
        let vats = self.store.subcluster_vats(id)?;
        info!(%id, vats = vats.len(), "terminating subcluster");
        for vat in vats.values() {
            self.terminate_vat_internal(*vat, reason.clone(), false)
                .await?;
        }
        if let Some(kpid) = self.store.subcluster_result_promise(id)? {
            if self.store.has_kernel_promise(kpid)? {
                self.store.start_crank()?;
                let outcome = (|| -> Result<(), KernelError> {
                    if self.store.get_kernel_promise(kpid)?.is_unresolved() {
                        self.queue.process_resolutions(
                            &mut self.store,
                            EndpointId::Kernel,
                            false,
                            vec![(kpid, true, reason)],
                        )?;
                    }
                    self.store.decrement_ref_count(kpid, "external")?;
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
                self.store.clear_subcluster_result_promise(id)?;
            }
        }
        Ok(())
    }

    /// Replace a vat's worker; durable state (c-list, vatstore) carries
    /// over, which is the point of keeping it in the kernel store.
    pub(crate) async fn restart_vat_internal(&mut self, vat: VatId) -> Result<(), KernelError> {
        let state = self.store.vat_state(vat)?;
        if !state.is_live() {
            return Err(KernelError::VatNotRunning {
                vat,
                state: state.to_string(),
            });
        }
        let config = self.store.vat_config(vat)?;
        info!(%vat, "restarting vat worker");
        if let Some(mut handle) = self.vats.remove(&vat) {
            handle.terminate(Some("restart")).await;
        }
        self.platform.stop_worker(vat).await?;

        let stream = self.platform.launch_worker(vat, &config).await?;
        let mut handle = VatHandle::new(vat, stream);
        {
            let mut sink = SyscallHandler::new(vat, &mut self.store, &mut self.queue);
            handle.init(&config, &mut sink).await?;
        }
        handle.set_state(VatState::Running);
        self.store.set_vat_state(vat, VatState::Running)?;
        self.vats.insert(vat, handle);
        Ok(())
    }

    /// Stop the world: every live vat terminates, then the remote network
    /// aborts its delays, dials, and queues.
    pub(crate) async fn terminate_all_internal(&mut self) -> Result<(), KernelError> {
        let vats: Vec<VatId> = self
            .store
            .list_vats()?
            .into_iter()
            .filter(|(_, state, _)| state.is_live())
            .map(|(vat, _, _)| vat)
            .collect();
        for vat in vats {
            self.terminate_vat_internal(
                vat,
                CapData::plain("{\"error\":\"kernel shutdown\"}"),
                false,
            )
            .await?;
        }
        if let Some(sender) = &self.remote_sender {
            sender.stop();
        }
        Ok(())
    }
}
