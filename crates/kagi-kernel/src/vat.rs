//! Per-vat handle: the framed worker stream and the delivery protocol.
//!
//! A delivery is one JSON-RPC request down the stream; while the vat works
//! on it, syscall requests flow back up and are serviced inline by the
//! kernel (the crank task), so every syscall effect lands inside the same
//! crank as the delivery that provoked it.

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tracing::{debug, trace, warn};

use kagi_types::{
    CrankResults, KernelError, ReapResults, RpcMessage, RpcRequest, RpcResponse, SYSCALL_METHOD,
    VatConfig, VatDelivery, VatId, VatState, VatSyscall, worker_method,
};

use crate::platform::WorkerStream;

/// Services syscalls issued by a vat mid-delivery.
pub trait SyscallSink: Send {
    fn syscall(&mut self, syscall: VatSyscall) -> Result<Value, KernelError>;
}

pub struct VatHandle {
    id: VatId,
    state: VatState,
    reader: FramedRead<Box<dyn tokio::io::AsyncRead + Send + Unpin>, LinesCodec>,
    writer: FramedWrite<Box<dyn tokio::io::AsyncWrite + Send + Unpin>, LinesCodec>,
    next_request_id: u64,
}

impl VatHandle {
    pub fn new(id: VatId, stream: WorkerStream) -> Self {
        Self {
            id,
            state: VatState::Launching,
            reader: FramedRead::new(stream.reader, LinesCodec::new()),
            writer: FramedWrite::new(stream.writer, LinesCodec::new()),
            next_request_id: 0,
        }
    }

    pub fn id(&self) -> VatId {
        self.id
    }

    pub fn state(&self) -> VatState {
        self.state
    }

    pub fn set_state(&mut self, state: VatState) {
        trace!(vat = %self.id, %state, "vat state");
        self.state = state;
    }

    async fn write_frame(&mut self, message: RpcMessage) -> Result<(), KernelError> {
        self.writer
            .send(message.to_frame())
            .await
            .map_err(|e| KernelError::StreamWrite(format!("vat {}: {e}", self.id)))
    }

    async fn read_frame(&mut self) -> Result<RpcMessage, KernelError> {
        let line = self
            .reader
            .next()
            .await
            .ok_or_else(|| KernelError::StreamRead(format!("vat {} stream closed", self.id)))?
            .map_err(|e| KernelError::StreamRead(format!("vat {}: {e}", self.id)))?;
        RpcMessage::parse(&line)
            .map_err(|e| KernelError::Protocol(format!("vat {} sent junk: {e}", self.id)))
    }

    /// One request/response round trip, servicing interleaved syscalls.
    async fn call(
        &mut self,
        method: &str,
        params: Value,
        sink: &mut dyn SyscallSink,
    ) -> Result<Value, KernelError> {
        self.next_request_id += 1;
        let id = self.next_request_id;
        self.write_frame(RpcRequest::new(id, method, params).into())
            .await?;
        loop {
            match self.read_frame().await? {
                RpcMessage::Request(request) if request.method == SYSCALL_METHOD => {
                    let request_id = request.id;
                    let response = match serde_json::from_value::<VatSyscall>(request.params) {
                        Ok(syscall) => {
                            trace!(vat = %self.id, kind = syscall.kind(), "syscall");
                            match sink.syscall(syscall) {
                                Ok(result) => request_id.map(|rid| RpcResponse::success(rid, result)),
                                Err(e) => {
                                    warn!(vat = %self.id, error = %e, "syscall failed");
                                    request_id.map(|rid| RpcResponse::failure(rid, e.to_rpc_error()))
                                }
                            }
                        }
                        Err(e) => request_id.map(|rid| {
                            RpcResponse::failure(
                                rid,
                                KernelError::Protocol(format!("bad syscall: {e}")).to_rpc_error(),
                            )
                        }),
                    };
                    if let Some(response) = response {
                        self.write_frame(response.into()).await?;
                    }
                }
                RpcMessage::Request(request) => {
                    warn!(vat = %self.id, method = %request.method, "unexpected request");
                    if let Some(rid) = request.id {
                        let error = KernelError::Protocol(format!(
                            "unknown method {}",
                            request.method
                        ));
                        self.write_frame(RpcResponse::failure(rid, error.to_rpc_error()).into())
                            .await?;
                    }
                }
                RpcMessage::Response(response) if response.id == id => {
                    return response.into_result().map_err(|e| {
                        KernelError::Protocol(format!("vat {} error reply: {}", self.id, e.message))
                    });
                }
                RpcMessage::Response(response) => {
                    warn!(vat = %self.id, id = response.id, "stale response dropped");
                }
            }
        }
    }

    /// `initSupervisor`: boot the worker and wait for its ack.
    pub async fn init(
        &mut self,
        config: &VatConfig,
        sink: &mut dyn SyscallSink,
    ) -> Result<(), KernelError> {
        let params = serde_json::json!({ "vatId": self.id, "config": config });
        self.call(worker_method::INIT_SUPERVISOR, params, sink)
            .await?;
        debug!(vat = %self.id, "supervisor initialized");
        Ok(())
    }

    /// One delivery; returns the vat's crank results.
    pub async fn deliver(
        &mut self,
        delivery: VatDelivery,
        sink: &mut dyn SyscallSink,
    ) -> Result<CrankResults, KernelError> {
        let params = serde_json::json!({ "item": delivery });
        let result = self.call(worker_method::DELIVER, params, sink).await?;
        serde_json::from_value(result)
            .map_err(|e| KernelError::Protocol(format!("vat {} crank results: {e}", self.id)))
    }

    /// `bringOutYourDead`: ask the vat for its possibly-dead set.
    pub async fn reap(&mut self, sink: &mut dyn SyscallSink) -> Result<ReapResults, KernelError> {
        let result = self
            .call(worker_method::BRING_OUT_YOUR_DEAD, Value::Null, sink)
            .await?;
        serde_json::from_value(result)
            .map_err(|e| KernelError::Protocol(format!("vat {} reap results: {e}", self.id)))
    }

    /// Best-effort terminate notification; the worker is going away whether
    /// or not it listens.
    pub async fn terminate(&mut self, reason: Option<&str>) {
        let params = serde_json::json!({ "reason": reason });
        let request = RpcRequest::notification(worker_method::TERMINATE, params);
        if let Err(e) = self.write_frame(request.into()).await {
            debug!(vat = %self.id, error = %e, "terminate notification undeliverable");
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    struct NullSink {
        seen: Vec<&'static str>,
    }

    impl SyscallSink for NullSink {
        fn syscall(&mut self, syscall: VatSyscall) -> Result<Value, KernelError> {
            self.seen.push(match syscall {
                VatSyscall::VatstoreGet { .. } => "vatstoreGet",
                _ => "other",
            });
            Ok(Value::Null)
        }
    }

    fn pair() -> (WorkerStream, tokio::io::DuplexStream, tokio::io::DuplexStream) {
        let (kernel_in, worker_out) = tokio::io::duplex(4096);
        let (worker_in, kernel_out) = tokio::io::duplex(4096);
        (
            WorkerStream {
                reader: Box::new(kernel_in),
                writer: Box::new(kernel_out),
            },
            worker_in,
            worker_out,
        )
    }

    #[tokio::test]
    async fn test_deliver_round_trip_with_interleaved_syscall() {
        let (stream, worker_in, mut worker_out) = pair();
        let mut vat = VatHandle::new(VatId::new(1), stream);
        let mut sink = NullSink { seen: Vec::new() };

        let worker = tokio::spawn(async move {
            let mut lines = BufReader::new(worker_in).lines();
            let line = lines.next_line().await.unwrap().unwrap();
            let request: RpcRequest = serde_json::from_str(&line).unwrap();
            assert_eq!(request.method, "deliver");

            // issue a syscall before answering the delivery
            let syscall = RpcRequest::new(
                99,
                SYSCALL_METHOD,
                serde_json::json!({"type": "vatstoreGet", "key": "k"}),
            );
            worker_out
                .write_all(format!("{}\n", RpcMessage::from(syscall).to_frame()).as_bytes())
                .await
                .unwrap();
            let reply = lines.next_line().await.unwrap().unwrap();
            let response: RpcResponse = serde_json::from_str(&reply).unwrap();
            assert_eq!(response.id, 99);

            let done = RpcResponse::success(request.id.unwrap(), serde_json::json!({}));
            worker_out
                .write_all(format!("{}\n", RpcMessage::from(done).to_frame()).as_bytes())
                .await
                .unwrap();
        });

        let delivery = VatDelivery::RetireImports { refs: vec![] };
        let results = vat.deliver(delivery, &mut sink).await.unwrap();
        assert!(results.abort.is_none());
        assert_eq!(sink.seen, vec!["vatstoreGet"]);
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_stream_is_stream_read_error() {
        let (stream, worker_in, worker_out) = pair();
        drop(worker_in);
        drop(worker_out);
        let mut vat = VatHandle::new(VatId::new(1), stream);
        let mut sink = NullSink { seen: Vec::new() };
        let result = vat.deliver(VatDelivery::RetireImports { refs: vec![] }, &mut sink).await;
        assert!(matches!(result, Err(KernelError::StreamRead(_))));
    }
}
