//! Syscall servicing: the kernel side of every vat-originated operation.
//!
//! A [`SyscallHandler`] is built per delivery, borrowing the store and
//! queue for the duration of the crank. Erefs are translated inbound here;
//! everything downstream works in krefs.

use serde_json::Value;
use tracing::debug;

use kagi_store::KernelStore;
use kagi_types::{
    ERef, EndpointId, KRef, KernelError, Message, RefKind, TerminationRequest, VatId, VatSyscall,
};

use crate::gc;
use crate::queue::KernelQueue;
use crate::translator;
use crate::vat::SyscallSink;

pub struct SyscallHandler<'a> {
    vat: VatId,
    store: &'a mut KernelStore,
    queue: &'a mut KernelQueue,
    /// Set when the vat issued `exit` during this delivery.
    pub termination: Option<TerminationRequest>,
    /// First syscall failure; a failed syscall poisons the whole crank.
    pub error: Option<String>,
}

impl<'a> SyscallHandler<'a> {
    pub fn new(vat: VatId, store: &'a mut KernelStore, queue: &'a mut KernelQueue) -> Self {
        Self {
            vat,
            store,
            queue,
            termination: None,
            error: None,
        }
    }

    fn endpoint(&self) -> EndpointId {
        EndpointId::Vat(self.vat)
    }

    /// Translate erefs the vat cites in GC syscalls; they must all exist.
    fn known_krefs(&mut self, refs: &[ERef]) -> Result<Vec<KRef>, KernelError> {
        let endpoint = self.endpoint();
        refs.iter()
            .map(|&eref| {
                self.store
                    .eref_to_kref(endpoint, eref)?
                    .ok_or(KernelError::UnknownEref { endpoint, eref })
            })
            .collect()
    }

    fn handle(&mut self, syscall: VatSyscall) -> Result<Value, KernelError> {
        let endpoint = self.endpoint();
        match syscall {
            VatSyscall::Send {
                target,
                methargs,
                result,
            } => {
                let target = translator::eref_to_kref(self.store, endpoint, target)?;
                let methargs = translator::import_capdata(self.store, endpoint, methargs)?;
                let result = result
                    .map(|eref| translator::result_eref_to_kref(self.store, endpoint, eref))
                    .transpose()?;
                self.queue
                    .enqueue_send(self.store, target, Message::new(methargs, result))?;
                Ok(Value::Null)
            }
            VatSyscall::Subscribe { target } => {
                if target.kind() != RefKind::Promise {
                    return Err(KernelError::Protocol(format!(
                        "subscribe to non-promise {target}"
                    )));
                }
                let kpid = translator::eref_to_kref(self.store, endpoint, target)?;
                self.queue.subscribe(self.store, endpoint, kpid)?;
                Ok(Value::Null)
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
                    let data = translator::import_capdata(self.store, endpoint, resolution.2)?;
                    translated.push((kpid, resolution.1, data));
                }
                self.queue
                    .process_resolutions(self.store, endpoint, true, translated)?;
                Ok(Value::Null)
            }
            VatSyscall::DropImports { refs } => {
                let krefs = self.known_krefs(&refs)?;
                gc::syscall_drop_imports(self.store, endpoint, &krefs)?;
                Ok(Value::Null)
            }
            VatSyscall::RetireImports { refs } => {
                let krefs = self.known_krefs(&refs)?;
                gc::syscall_retire_imports(self.store, endpoint, &krefs)?;
                Ok(Value::Null)
            }
            VatSyscall::RetireExports { refs } => {
                let krefs = self.known_krefs(&refs)?;
                gc::syscall_retire_exports(self.store, endpoint, &krefs)?;
                Ok(Value::Null)
            }
            VatSyscall::Exit { is_failure, info } => {
                let info = translator::import_capdata(self.store, endpoint, info)?;
                debug!(vat = %self.vat, is_failure, "vat requested exit");
                self.termination = Some(TerminationRequest {
                    vat: self.vat,
                    failure: is_failure,
                    info,
                });
                Ok(Value::Null)
            }
            VatSyscall::VatstoreGet { key } => {
                Ok(match self.store.vatstore_get(self.vat, &key)? {
                    Some(value) => Value::String(value),
                    None => Value::Null,
                })
            }
            VatSyscall::VatstoreSet { key, value } => {
                self.store.vatstore_set(self.vat, &key, &value)?;
                Ok(Value::Null)
            }
            VatSyscall::VatstoreDelete { key } => {
                self.store.vatstore_delete(self.vat, &key)?;
                Ok(Value::Null)
            }
        }
    }
}

impl SyscallSink for SyscallHandler<'_> {
    fn syscall(&mut self, syscall: VatSyscall) -> Result<Value, KernelError> {
        let result = self.handle(syscall);
        if let Err(e) = &result {
            self.error.get_or_insert_with(|| e.to_string());
        }
        result
    }
}

// ============================================================================
// Tests
// ============================================================================
