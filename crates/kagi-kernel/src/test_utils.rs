//! In-process vat workers for tests.
//!
//! The loopback platform satisfies [`PlatformServices`] without spawning
//! subprocesses: each "worker" is a tokio task speaking the real worker
//! protocol over an in-memory duplex, driving a scripted [`VatBehavior`].
//! Scenario tests build small behaviors (echo, counter, subscriber) and
//! exercise the kernel end to end through them.

use std::collections::HashMap;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tracing::{debug, warn};

use kagi_types::{
    CrankResults, ERef, KernelError, Polarity, ReapResults, RpcMessage, RpcRequest,
    RpcResponse, SYSCALL_METHOD, VatCapData, VatConfig, VatDelivery, VatId, VatOneResolution,
    VatSyscall, worker_method,
};

use crate::platform::{PlatformServices, WorkerStream};

// ── Vat-side control surface ────────────────────────────────────────────────

/// What a scripted vat can do: allocate erefs and queue syscalls. Queued
/// syscalls are sent (and their replies awaited) before the delivery is
/// answered, matching the worker protocol's interleaving.
#[derive(Default)]
pub struct VatCtl {
    next_object: u64,
    next_promise: u64,
    syscalls: Vec<VatSyscall>,
    possibly_dead: Vec<ERef>,
}

impl VatCtl {
    /// The root export every vat is born with.
    pub fn root() -> ERef {
        ERef::object(Polarity::Plus, 0)
    }

    pub fn alloc_object(&mut self) -> ERef {
        self.next_object += 1;
        ERef::object(Polarity::Plus, self.next_object)
    }

    pub fn alloc_promise(&mut self) -> ERef {
        self.next_promise += 1;
        ERef::promise(Polarity::Plus, self.next_promise)
    }

    pub fn syscall(&mut self, syscall: VatSyscall) {
        self.syscalls.push(syscall);
    }

    /// `method(args…)` with no capability citations.
    pub fn send_call(
        &mut self,
        target: ERef,
        method: &str,
        args: Vec<Value>,
        result: Option<ERef>,
    ) {
        self.syscall(VatSyscall::Send {
            target,
            methargs: VatCapData::plain(json!([method, args]).to_string()),
            result,
        });
    }

    pub fn subscribe(&mut self, target: ERef) {
        self.syscall(VatSyscall::Subscribe { target });
    }

    /// Resolve a promise to plain data.
    pub fn resolve_data(&mut self, kpid: ERef, value: Value) {
        self.syscall(VatSyscall::Resolve {
            resolutions: vec![VatOneResolution(
                kpid,
                false,
                VatCapData::plain(value.to_string()),
            )],
        });
    }

    /// Resolve a promise to a single reference.
    pub fn resolve_to_ref(&mut self, kpid: ERef, target: ERef) {
        self.syscall(VatSyscall::Resolve {
            resolutions: vec![VatOneResolution(
                kpid,
                false,
                VatCapData::new("\"@0\"", vec![target]),
            )],
        });
    }

    pub fn reject(&mut self, kpid: ERef, value: Value) {
        self.syscall(VatSyscall::Resolve {
            resolutions: vec![VatOneResolution(
                kpid,
                true,
                VatCapData::plain(value.to_string()),
            )],
        });
    }

    pub fn drop_imports(&mut self, refs: Vec<ERef>) {
        self.syscall(VatSyscall::DropImports { refs });
    }

    pub fn retire_imports(&mut self, refs: Vec<ERef>) {
        self.syscall(VatSyscall::RetireImports { refs });
    }

    pub fn retire_exports(&mut self, refs: Vec<ERef>) {
        self.syscall(VatSyscall::RetireExports { refs });
    }

    /// Report an import as possibly dead at the next reap.
    pub fn mark_possibly_dead(&mut self, eref: ERef) {
        self.possibly_dead.push(eref);
    }
}

/// A scripted vat. Deliveries arrive in kernel order; syscalls queued on
/// the ctl are issued before the delivery is acknowledged.
pub trait VatBehavior: Send {
    fn deliver(&mut self, ctl: &mut VatCtl, delivery: VatDelivery);

    fn reap(&mut self, _ctl: &mut VatCtl) {}
}

/// Closure-backed behavior for one-off tests.
pub struct FnBehavior<F: FnMut(&mut VatCtl, VatDelivery) + Send>(pub F);

impl<F: FnMut(&mut VatCtl, VatDelivery) + Send> VatBehavior for FnBehavior<F> {
    fn deliver(&mut self, ctl: &mut VatCtl, delivery: VatDelivery) {
        (self.0)(ctl, delivery)
    }
}

/// Parse a `methargs` body into (method, args). Scripted vats all use the
/// standard `[method, [args…]]` encoding.
pub fn parse_methargs(data: &VatCapData) -> Option<(String, Vec<Value>)> {
    serde_json::from_str(&data.body).ok()
}

/// Find the slot eref that a `"@<n>"` citation in `value` refers to.
pub fn cited_slot(data: &VatCapData, value: &Value) -> Option<ERef> {
    let citation = value.as_str()?;
    let index: usize = citation.strip_prefix('@')?.parse().ok()?;
    data.slots.get(index).copied()
}

// ── Worker task ─────────────────────────────────────────────────────────────

async fn run_worker(
    vat: VatId,
    mut behavior: Box<dyn VatBehavior>,
    reader: tokio::io::DuplexStream,
    writer: tokio::io::DuplexStream,
) {
    let mut reader = FramedRead::new(reader, LinesCodec::new());
    let mut writer = FramedWrite::new(writer, LinesCodec::new());
    let mut ctl = VatCtl::default();
    let mut next_syscall_id: u64 = 0;

    while let Some(Ok(line)) = reader.next().await {
        let Ok(RpcMessage::Request(request)) = RpcMessage::parse(&line) else {
            warn!(%vat, "worker ignored junk frame");
            continue;
        };
        match request.method.as_str() {
            worker_method::INIT_SUPERVISOR => {
                if let Some(id) = request.id {
                    let _ = writer
                        .send(RpcMessage::from(RpcResponse::success(id, Value::Null)).to_frame())
                        .await;
                }
            }
            worker_method::DELIVER => {
                let delivery: VatDelivery =
                    match serde_json::from_value(request.params["item"].clone()) {
                        Ok(delivery) => delivery,
                        Err(e) => {
                            warn!(%vat, error = %e, "bad delivery");
                            continue;
                        }
                    };
                behavior.deliver(&mut ctl, delivery);
                if !flush_syscalls(&mut ctl, &mut next_syscall_id, &mut reader, &mut writer).await
                {
                    return;
                }
                if let Some(id) = request.id {
                    let results = serde_json::to_value(CrankResults::ok()).expect("encode");
                    let _ = writer
                        .send(RpcMessage::from(RpcResponse::success(id, results)).to_frame())
                        .await;
                }
            }
            worker_method::BRING_OUT_YOUR_DEAD => {
                behavior.reap(&mut ctl);
                if !flush_syscalls(&mut ctl, &mut next_syscall_id, &mut reader, &mut writer).await
                {
                    return;
                }
                let results = ReapResults {
                    possibly_dead_set: std::mem::take(&mut ctl.possibly_dead),
                };
                if let Some(id) = request.id {
                    let value = serde_json::to_value(results).expect("encode");
                    let _ = writer
                        .send(RpcMessage::from(RpcResponse::success(id, value)).to_frame())
                        .await;
                }
            }
            worker_method::TERMINATE => {
                debug!(%vat, "worker terminating");
                return;
            }
            other => {
                warn!(%vat, method = other, "worker got unknown method");
            }
        }
    }
}

/// Issue queued syscalls one at a time, awaiting each reply. Returns false
/// if the stream died.
async fn flush_syscalls(
    ctl: &mut VatCtl,
    next_id: &mut u64,
    reader: &mut FramedRead<tokio::io::DuplexStream, LinesCodec>,
    writer: &mut FramedWrite<tokio::io::DuplexStream, LinesCodec>,
) -> bool {
    for syscall in ctl.syscalls.drain(..) {
        *next_id += 1;
        let id = *next_id;
        let params = serde_json::to_value(&syscall).expect("encode syscall");
        let request = RpcRequest::new(id, SYSCALL_METHOD, params);
        if writer
            .send(RpcMessage::from(request).to_frame())
            .await
            .is_err()
        {
            return false;
        }
        loop {
            let Some(Ok(line)) = reader.next().await else {
                return false;
            };
            match RpcMessage::parse(&line) {
                Ok(RpcMessage::Response(response)) if response.id == id => {
                    if let Err(e) = response.into_result() {
                        warn!(kind = syscall.kind(), code = e.code, "syscall rejected");
                    }
                    break;
                }
                Ok(_) | Err(_) => continue,
            }
        }
    }
    true
}

// ── Loopback platform ───────────────────────────────────────────────────────

type BehaviorFactory = Box<dyn Fn() -> Box<dyn VatBehavior> + Send>;

/// [`PlatformServices`] that runs workers as in-process tasks. Behaviors
/// register under bundle names; `launch_worker` looks up
/// `config.bundle_name`.
#[derive(Default)]
pub struct LoopbackPlatform {
    factories: HashMap<String, BehaviorFactory>,
    workers: HashMap<VatId, JoinHandle<()>>,
}

impl LoopbackPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, bundle_name: &str, factory: F)
    where
        F: Fn() -> Box<dyn VatBehavior> + Send + 'static,
    {
        self.factories
            .insert(bundle_name.to_string(), Box::new(factory));
    }

    /// Register + builder-style chaining for test setup.
    pub fn with<F>(mut self, bundle_name: &str, factory: F) -> Self
    where
        F: Fn() -> Box<dyn VatBehavior> + Send + 'static,
    {
        self.register(bundle_name, factory);
        self
    }
}

#[async_trait]
impl PlatformServices for LoopbackPlatform {
    async fn launch_worker(
        &mut self,
        vat: VatId,
        config: &VatConfig,
    ) -> Result<WorkerStream, KernelError> {
        let name = config
            .bundle_name
            .as_deref()
            .ok_or_else(|| KernelError::Protocol("loopback platform needs bundleName".into()))?;
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| KernelError::Protocol(format!("no behavior registered for {name:?}")))?;
        let behavior = factory();

        let (kernel_reader, worker_writer) = tokio::io::duplex(64 * 1024);
        let (worker_reader, kernel_writer) = tokio::io::duplex(64 * 1024);
        let task = tokio::spawn(run_worker(vat, behavior, worker_reader, worker_writer));
        self.workers.insert(vat, task);
        Ok(WorkerStream {
            reader: Box::new(kernel_reader),
            writer: Box::new(kernel_writer),
        })
    }

    async fn stop_worker(&mut self, vat: VatId) -> Result<(), KernelError> {
        if let Some(task) = self.workers.remove(&vat) {
            task.abort();
        }
        Ok(())
    }
}

// ── Common scripted behaviors ───────────────────────────────────────────────

/// Replies `"hello from <name> to <arg>"` to any `hello` message.
pub struct Greeter {
    pub name: &'static str,
}

impl VatBehavior for Greeter {
    fn deliver(&mut self, ctl: &mut VatCtl, delivery: VatDelivery) {
        if let VatDelivery::Message { message, .. } = delivery {
            let Some((method, args)) = parse_methargs(&message.methargs) else {
                return;
            };
            match method.as_str() {
                "bootstrap" => {
                    if let Some(result) = message.result {
                        ctl.resolve_data(result, json!("ready"));
                    }
                }
                "hello" => {
                    let caller = args.first().and_then(Value::as_str).unwrap_or("?");
                    if let Some(result) = message.result {
                        ctl.resolve_data(
                            result,
                            json!(format!("hello from {} to {}", self.name, caller)),
                        );
                    }
                }
                _ => {}
            }
        }
    }
}

/// `mkCounter()` resolves to a fresh counter object; `inc()` on a counter
/// returns successive integers starting at 0.
#[derive(Default)]
pub struct CounterFactory {
    counters: HashMap<ERef, i64>,
}

impl VatBehavior for CounterFactory {
    fn deliver(&mut self, ctl: &mut VatCtl, delivery: VatDelivery) {
        let VatDelivery::Message { target, message } = delivery else {
            return;
        };
        let Some((method, _args)) = parse_methargs(&message.methargs) else {
            return;
        };
        match method.as_str() {
            "bootstrap" => {
                if let Some(result) = message.result {
                    ctl.resolve_data(result, json!("ready"));
                }
            }
            "mkCounter" => {
                let counter = ctl.alloc_object();
                self.counters.insert(counter, 0);
                if let Some(result) = message.result {
                    ctl.resolve_to_ref(result, counter);
                }
            }
            "inc" => {
                if let Some(count) = self.counters.get_mut(&target) {
                    let value = *count;
                    *count += 1;
                    if let Some(result) = message.result {
                        ctl.resolve_data(result, json!(value));
                    }
                } else if let Some(result) = message.result {
                    ctl.reject(result, json!("not a counter"));
                }
            }
            _ => {
                if let Some(result) = message.result {
                    ctl.reject(result, json!(format!("unknown method {method}")));
                }
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
