//! The kernel: crank loop, control surface, and vat registry.
//!
//! The kernel is a single task owning the store, the queue, and every vat
//! handle. External callers hold a cloneable [`KernelHandle`] and talk to
//! the task over a command channel; each command is serviced between
//! cranks, which is what `waitForCrank` serialization means here.
//!
//! ```text
//!   KernelHandle (Clone)        mpsc       Kernel task (single-threaded)
//!   ┌───────────────────┐   ─────────▶   ┌────────────────────────────────┐
//!   │ .launch_subcluster│               │ crank loop: gc → reap → run q   │
//!   │ .enqueue_message  │   ◀─────────  │ KernelStore + KernelQueue       │
//!   │ .terminate_vat    │    oneshot    │ VatHandles (framed workers)     │
//!   └───────────────────┘               └────────────────────────────────┘
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use kagi_store::{KVStore, KernelStore};
use kagi_types::{
    CapData, ClusterConfig, EndpointId, KRef, KernelError, KernelStatus, RemoteId, SubclusterId,
    SubclusterResult, SubclusterStatus, VatId, VatStatus,
};

use crate::platform::PlatformServices;
use crate::queue::{KernelQueue, ResolutionOutcome};
use crate::remote::RemoteSender;
use crate::vat::VatHandle;

/// Savepoint taken at the top of every crank.
pub(crate) const START_SAVEPOINT: &str = "start";

pub(crate) enum KernelCommand {
    LaunchVat {
        config: kagi_types::VatConfig,
        reply: oneshot::Sender<Result<VatId, KernelError>>,
    },
    LaunchSubcluster {
        config: ClusterConfig,
        reply: oneshot::Sender<
            Result<
                (
                    SubclusterId,
                    BTreeMap<String, VatId>,
                    oneshot::Receiver<ResolutionOutcome>,
                ),
                KernelError,
            >,
        >,
    },
    RecordSubclusterResult {
        id: SubclusterId,
        outcome: ResolutionOutcome,
    },
    TerminateVat {
        vat: VatId,
        reason: CapData,
        reply: oneshot::Sender<Result<(), KernelError>>,
    },
    TerminateSubcluster {
        id: SubclusterId,
        reason: CapData,
        reply: oneshot::Sender<Result<(), KernelError>>,
    },
    RestartVat {
        vat: VatId,
        reply: oneshot::Sender<Result<(), KernelError>>,
    },
    TerminateAll {
        reply: oneshot::Sender<Result<(), KernelError>>,
    },
    EnqueueMessage {
        target: KRef,
        method: String,
        args: Vec<Value>,
        reply: oneshot::Sender<
            Result<(KRef, oneshot::Receiver<ResolutionOutcome>), KernelError>,
        >,
    },
    VatRoot {
        vat: VatId,
        reply: oneshot::Sender<Result<KRef, KernelError>>,
    },
    PinObject {
        kref: KRef,
        reply: oneshot::Sender<Result<(), KernelError>>,
    },
    UnpinObject {
        kref: KRef,
        reply: oneshot::Sender<Result<(), KernelError>>,
    },
    ReleasePromise {
        kpid: KRef,
    },
    Status {
        reply: oneshot::Sender<Result<KernelStatus, KernelError>>,
    },
    KvGet {
        key: String,
        reply: oneshot::Sender<Result<Option<String>, KernelError>>,
    },
    KvSet {
        key: String,
        value: String,
        reply: oneshot::Sender<Result<(), KernelError>>,
    },
    GrantFacet {
        reply: oneshot::Sender<Result<KRef, KernelError>>,
    },
    RegisterRemote {
        reply: oneshot::Sender<Result<RemoteId, KernelError>>,
    },
    ExportToRemote {
        remote: RemoteId,
        kref: KRef,
        reply: oneshot::Sender<Result<kagi_types::ERef, KernelError>>,
    },
    RemoteMessage {
        from: RemoteId,
        frame: String,
        reply: oneshot::Sender<Result<Option<String>, KernelError>>,
    },
    RemoteGiveUp {
        remote: RemoteId,
        reply: oneshot::Sender<Result<(), KernelError>>,
    },
    RemoteIncarnationChange {
        remote: RemoteId,
        new_incarnation: u64,
        reply: oneshot::Sender<Result<(), KernelError>>,
    },
    WaitIdle {
        reply: oneshot::Sender<()>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
}

pub struct Kernel {
    pub(crate) store: KernelStore,
    pub(crate) queue: KernelQueue,
    pub(crate) vats: HashMap<VatId, VatHandle>,
    pub(crate) platform: Box<dyn PlatformServices>,
    pub(crate) remote_sender: Option<Box<dyn RemoteSender>>,
    /// Kernel-owned capability objects lent to system vats.
    pub(crate) facets: BTreeSet<KRef>,
    cmd_rx: mpsc::UnboundedReceiver<KernelCommand>,
    pub(crate) cmd_tx: mpsc::UnboundedSender<KernelCommand>,
    /// Replies parked until every ready queue is drained.
    idle_waiters: Vec<oneshot::Sender<()>>,
    stopping: bool,
}

/// Cloneable control handle; every method serializes behind the crank loop.
#[derive(Clone)]
pub struct KernelHandle {
    tx: mpsc::UnboundedSender<KernelCommand>,
}

impl Kernel {
    pub fn make(
        kv: Box<dyn KVStore>,
        platform: Box<dyn PlatformServices>,
        remote_sender: Option<Box<dyn RemoteSender>>,
    ) -> (Self, KernelHandle) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let kernel = Self {
            store: KernelStore::new(kv),
            queue: KernelQueue::new(),
            vats: HashMap::new(),
            platform,
            remote_sender,
            facets: BTreeSet::new(),
            cmd_rx,
            cmd_tx: cmd_tx.clone(),
            idle_waiters: Vec::new(),
            stopping: false,
        };
        (kernel, KernelHandle { tx: cmd_tx })
    }

    fn has_work(&self) -> Result<bool, KernelError> {
        Ok(self.store.gc_action_count()? > 0
            || self.store.reap_queue_length()? > 0
            || self.store.run_queue_length()? > 0)
    }

    /// Drive the kernel until `stop()`.
    ///
    /// Control commands interleave *between* cranks: the loop services
    /// everything already queued on the command channel, runs one crank if
    /// work is pending, and only parks when both are empty.
    pub async fn run(mut self) {
        info!("kernel running");
        let wake = self.queue.wake_handle();
        loop {
            while !self.stopping {
                // commands never wait behind a long queue drain
                while let Ok(command) = self.cmd_rx.try_recv() {
                    self.handle_command(command).await;
                    if self.stopping {
                        break;
                    }
                }
                match self.has_work() {
                    Ok(true) => {
                        if let Err(e) = self.crank_step().await {
                            error!(error = %e, "crank failed");
                            break;
                        }
                    }
                    Ok(false) => {
                        // drained: anyone waiting on idle gets their answer
                        for waiter in self.idle_waiters.drain(..) {
                            let _ = waiter.send(());
                        }
                        break;
                    }
                    Err(e) => {
                        error!(error = %e, "cannot inspect queues");
                        break;
                    }
                }
            }
            if self.stopping {
                break;
            }
            tokio::select! {
                command = self.cmd_rx.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                _ = wake.notified() => {}
            }
        }
        info!("kernel stopped");
    }

    /// Drop the control plane's hold on a result promise, collecting it if
    /// nothing else names it.
    fn release_external_hold(&mut self, kpid: KRef) -> Result<(), KernelError> {
        if !self.store.has_kernel_promise(kpid)? {
            return Ok(());
        }
        self.store.start_crank()?;
        let outcome = (|| -> Result<(), KernelError> {
            self.store.decrement_ref_count(kpid, "external")?;
            crate::gc::process_maybe_free(&mut self.store)?;
            Ok(())
        })();
        if outcome.is_err() {
            self.store.rollback_crank(kagi_store::CRANK_SAVEPOINT)?;
        }
        self.store.end_crank()?;
        outcome
    }

    /// One crank: take the highest-priority item, deliver it, commit or
    /// roll back, then apply any termination the delivery requested.
    ///
    /// Abort semantics: the store is restored to the `start` savepoint, so
    /// the delivery was a no-op; a run-queue message is then consumed (its
    /// result rejected) rather than retried, while GC and reap actions stay
    /// pending and get another chance.
    pub(crate) async fn crank_step(&mut self) -> Result<(), KernelError> {
        self.store.start_crank()?;
        self.store.create_crank_savepoint(START_SAVEPOINT)?;
        let results = self.deliver_next().await;
        let termination = match results {
            Ok((source, results)) => {
                if let Some(reason) = &results.abort {
                    warn!(reason, "crank aborted");
                    self.store.rollback_crank(START_SAVEPOINT)?;
                    self.queue.abort_crank();
                    if source == crate::deliver::CrankSource::RunQueue {
                        let reason = reason.clone();
                        self.discard_aborted_item(&reason)?;
                        self.queue.flush_crank(&mut self.store)?;
                        crate::gc::process_maybe_free(&mut self.store)?;
                    }
                } else {
                    self.queue.flush_crank(&mut self.store)?;
                    crate::gc::process_maybe_free(&mut self.store)?;
                }
                results.terminate
            }
            Err(e) => {
                error!(error = %e, "delivery failed, rolling back");
                self.store.rollback_crank(START_SAVEPOINT)?;
                self.queue.abort_crank();
                None
            }
        };
        self.store.end_crank()?;
        if let Some(termination) = termination {
            self.terminate_vat_internal(termination.vat, termination.info, termination.failure)
                .await?;
        }
        Ok(())
    }

    async fn handle_command(&mut self, command: KernelCommand) {
        match command {
            KernelCommand::LaunchVat { config, reply } => {
                let result = self.launch_vat_internal(&config, None).await;
                let _ = reply.send(result);
            }
            KernelCommand::LaunchSubcluster { config, reply } => {
                let result = self.launch_subcluster_internal(config).await;
                let _ = reply.send(result);
            }
            KernelCommand::RecordSubclusterResult { id, outcome } => {
                if let Err(e) = self.store.set_subcluster_result(id, &outcome.data) {
                    error!(%id, error = %e, "cannot persist subcluster result");
                }
            }
            KernelCommand::TerminateVat { vat, reason, reply } => {
                let result = self.terminate_vat_internal(vat, reason, true).await;
                let _ = reply.send(result);
            }
            KernelCommand::TerminateSubcluster { id, reason, reply } => {
                let result = self.terminate_subcluster_internal(id, reason).await;
                let _ = reply.send(result);
            }
            KernelCommand::RestartVat { vat, reply } => {
                let result = self.restart_vat_internal(vat).await;
                let _ = reply.send(result);
            }
            KernelCommand::TerminateAll { reply } => {
                let result = self.terminate_all_internal().await;
                let _ = reply.send(result);
            }
            KernelCommand::EnqueueMessage {
                target,
                method,
                args,
                reply,
            } => {
                let result = self
                    .queue
                    .enqueue_message(&mut self.store, target, &method, args);
                let _ = reply.send(result);
            }
            KernelCommand::VatRoot { vat, reply } => {
                let result = self.vat_root(vat);
                let _ = reply.send(result);
            }
            KernelCommand::PinObject { kref, reply } => {
                let result = self
                    .store
                    .increment_ref_count(kref, "pin")
                    .map(|_| ());
                let _ = reply.send(result);
            }
            KernelCommand::UnpinObject { kref, reply } => {
                let result = self
                    .store
                    .decrement_ref_count(kref, "pin")
                    .map(|_| ());
                let _ = reply.send(result);
            }
            KernelCommand::ReleasePromise { kpid } => {
                if let Err(e) = self.release_external_hold(kpid) {
                    error!(%kpid, error = %e, "promise release failed");
                }
            }
            KernelCommand::Status { reply } => {
                let _ = reply.send(self.status());
            }
            KernelCommand::KvGet { key, reply } => {
                let _ = reply.send(self.store.kv_get(&key));
            }
            KernelCommand::KvSet { key, value, reply } => {
                let _ = reply.send(self.store.kv_set(&key, &value));
            }
            KernelCommand::GrantFacet { reply } => {
                let _ = reply.send(self.grant_facet());
            }
            KernelCommand::RegisterRemote { reply } => {
                let result = (|| -> Result<RemoteId, KernelError> {
                    let remote = self.store.get_next_remote_id()?;
                    self.store.add_remote(remote)?;
                    Ok(remote)
                })();
                let _ = reply.send(result);
            }
            KernelCommand::ExportToRemote { remote, kref, reply } => {
                let result = self.export_to_remote(remote, kref);
                let _ = reply.send(result);
            }
            KernelCommand::RemoteMessage { from, frame, reply } => {
                let result = self.handle_remote_frame(from, &frame);
                let _ = reply.send(result);
            }
            KernelCommand::RemoteGiveUp { remote, reply } => {
                let result = self.remote_give_up(remote);
                let _ = reply.send(result);
            }
            KernelCommand::RemoteIncarnationChange {
                remote,
                new_incarnation,
                reply,
            } => {
                let result = self.remote_incarnation_change(remote, new_incarnation);
                let _ = reply.send(result);
            }
            KernelCommand::WaitIdle { reply } => {
                // answered by the run loop once every ready queue is empty
                self.idle_waiters.push(reply);
            }
            KernelCommand::Stop { reply } => {
                self.stopping = true;
                let _ = reply.send(());
            }
        }
    }

    pub(crate) fn vat_root(&mut self, vat: VatId) -> Result<KRef, KernelError> {
        // ensure the vat exists before touching its namespace
        self.store.vat_state(vat)?;
        let endpoint = EndpointId::Vat(vat);
        let root: kagi_types::ERef = "o+0".parse().expect("static eref");
        crate::translator::eref_to_kref(&mut self.store, endpoint, root)
    }

    /// Mint a kernel-owned capability object for a system vat.
    fn grant_facet(&mut self) -> Result<KRef, KernelError> {
        let (kref, _) = self.store.init_kernel_object(EndpointId::Kernel)?;
        self.store.increment_ref_count(kref, "pin")?;
        self.facets.insert(kref);
        debug!(%kref, "kernel facet granted");
        Ok(kref)
    }

    pub(crate) fn status(&self) -> Result<KernelStatus, KernelError> {
        let mut subclusters = Vec::new();
        for id in self.store.list_subclusters()? {
            let config = self.store.subcluster_config(id)?;
            subclusters.push(SubclusterStatus {
                id,
                bootstrap: config.bootstrap,
                vats: self.store.subcluster_vats(id)?,
            });
        }
        let vats = self
            .store
            .list_vats()?
            .into_iter()
            .map(|(id, state, subcluster)| VatStatus {
                id,
                state,
                subcluster,
            })
            .collect();
        Ok(KernelStatus {
            subclusters,
            vats,
            run_queue_length: self.store.run_queue_length()?,
            gc_action_count: self.store.gc_action_count()?,
        })
    }
}

// ── KernelHandle ────────────────────────────────────────────────────────────

impl KernelHandle {
    fn send(&self, command: KernelCommand) -> Result<(), KernelError> {
        self.tx
            .send(command)
            .map_err(|_| KernelError::Aborted)
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T, KernelError>>) -> KernelCommand,
    ) -> Result<T, KernelError> {
        let (reply, rx) = oneshot::channel();
        self.send(build(reply))?;
        rx.await.map_err(|_| KernelError::Aborted)?
    }

    pub async fn launch_vat(&self, config: kagi_types::VatConfig) -> Result<VatId, KernelError> {
        self.request(|reply| KernelCommand::LaunchVat { config, reply })
            .await
    }

    /// Launch a subcluster and wait for its bootstrap result.
    pub async fn launch_subcluster(
        &self,
        config: ClusterConfig,
    ) -> Result<SubclusterResult, KernelError> {
        let (id, vats, result_rx) = self
            .request(|reply| KernelCommand::LaunchSubcluster { config, reply })
            .await?;
        let outcome = result_rx.await.map_err(|_| KernelError::Aborted)?;
        debug!(%id, rejected = outcome.rejected, "subcluster bootstrap settled");
        Ok(SubclusterResult {
            bootstrap: outcome.data,
            vats,
        })
    }

    pub async fn terminate_vat(&self, vat: VatId, reason: CapData) -> Result<(), KernelError> {
        self.request(|reply| KernelCommand::TerminateVat { vat, reason, reply })
            .await
    }

    pub async fn terminate_subcluster(
        &self,
        id: SubclusterId,
        reason: CapData,
    ) -> Result<(), KernelError> {
        self.request(|reply| KernelCommand::TerminateSubcluster { id, reason, reply })
            .await
    }

    pub async fn restart_vat(&self, vat: VatId) -> Result<(), KernelError> {
        self.request(|reply| KernelCommand::RestartVat { vat, reply })
            .await
    }

    pub async fn terminate_all(&self) -> Result<(), KernelError> {
        self.request(|reply| KernelCommand::TerminateAll { reply })
            .await
    }

    /// Kernel-initiated send; resolves with the method's result and then
    /// releases the kernel's hold on the result promise.
    pub async fn enqueue_message(
        &self,
        target: KRef,
        method: &str,
        args: Vec<Value>,
    ) -> Result<ResolutionOutcome, KernelError> {
        let (kpid, rx) = self.enqueue_message_raw(target, method, args).await?;
        let outcome = rx.await.map_err(|_| KernelError::Aborted);
        let _ = self.tx.send(KernelCommand::ReleasePromise { kpid });
        outcome
    }

    /// Drop the hold [`Self::enqueue_message_raw`] took on a result
    /// promise. Callers that pipeline onto the promise call this when done.
    pub fn release_promise(&self, kpid: KRef) {
        let _ = self.tx.send(KernelCommand::ReleasePromise { kpid });
    }

    /// Like [`Self::enqueue_message`] but hands back the result promise's
    /// kref immediately, so callers can pipeline further sends onto it
    /// before it settles.
    pub async fn enqueue_message_raw(
        &self,
        target: KRef,
        method: &str,
        args: Vec<Value>,
    ) -> Result<(KRef, oneshot::Receiver<ResolutionOutcome>), KernelError> {
        self.request(|reply| KernelCommand::EnqueueMessage {
            target,
            method: method.to_string(),
            args,
            reply,
        })
        .await
    }

    pub async fn vat_root(&self, vat: VatId) -> Result<KRef, KernelError> {
        self.request(|reply| KernelCommand::VatRoot { vat, reply })
            .await
    }

    /// Hold an object on behalf of the control plane.
    pub async fn pin_object(&self, kref: KRef) -> Result<(), KernelError> {
        self.request(|reply| KernelCommand::PinObject { kref, reply })
            .await
    }

    /// Release a control-plane hold.
    pub async fn unpin_object(&self, kref: KRef) -> Result<(), KernelError> {
        self.request(|reply| KernelCommand::UnpinObject { kref, reply })
            .await
    }

    pub async fn status(&self) -> Result<KernelStatus, KernelError> {
        self.request(|reply| KernelCommand::Status { reply }).await
    }

    pub async fn kv_get(&self, key: &str) -> Result<Option<String>, KernelError> {
        self.request(|reply| KernelCommand::KvGet {
            key: key.to_string(),
            reply,
        })
        .await
    }

    pub async fn kv_set(&self, key: &str, value: &str) -> Result<(), KernelError> {
        self.request(|reply| KernelCommand::KvSet {
            key: key.to_string(),
            value: value.to_string(),
            reply,
        })
        .await
    }

    /// A capability-bearing kernel object for a system vat.
    pub async fn kernel_facet(&self) -> Result<KRef, KernelError> {
        self.request(|reply| KernelCommand::GrantFacet { reply })
            .await
    }

    pub async fn register_remote(&self) -> Result<RemoteId, KernelError> {
        self.request(|reply| KernelCommand::RegisterRemote { reply })
            .await
    }

    /// Mint a reference to `kref` in a remote's namespace, so the peer can
    /// start naming it (the bootstrap grant of a remote link).
    pub async fn export_to_remote(
        &self,
        remote: RemoteId,
        kref: KRef,
    ) -> Result<kagi_types::ERef, KernelError> {
        self.request(|reply| KernelCommand::ExportToRemote { remote, kref, reply })
            .await
    }

    /// Inbound `remoteDeliver`: returns an optional reply frame.
    pub async fn remote_message(
        &self,
        from: RemoteId,
        frame: String,
    ) -> Result<Option<String>, KernelError> {
        self.request(|reply| KernelCommand::RemoteMessage { from, frame, reply })
            .await
    }

    /// Inbound `remoteGiveUp`.
    pub async fn remote_give_up(&self, remote: RemoteId) -> Result<(), KernelError> {
        self.request(|reply| KernelCommand::RemoteGiveUp { remote, reply })
            .await
    }

    /// Inbound `remoteIncarnationChange`.
    pub async fn remote_incarnation_change(
        &self,
        remote: RemoteId,
        new_incarnation: u64,
    ) -> Result<(), KernelError> {
        self.request(|reply| KernelCommand::RemoteIncarnationChange {
            remote,
            new_incarnation,
            reply,
        })
        .await
    }

    /// Resolves once the kernel has no pending GC, reap, or run-queue
    /// work; items enqueued before this call are delivered first.
    pub async fn wait_idle(&self) -> Result<(), KernelError> {
        let (reply, rx) = oneshot::channel();
        self.send(KernelCommand::WaitIdle { reply })?;
        rx.await.map_err(|_| KernelError::Aborted)
    }

    pub async fn stop(&self) -> Result<(), KernelError> {
        let (reply, rx) = oneshot::channel();
        self.send(KernelCommand::Stop { reply })?;
        rx.await.map_err(|_| KernelError::Aborted)
    }
}
