//! Remote-peer protocol against a live kernel: inbound syscall frames,
//! outbound notify fan-out, give-up teardown, and incarnation changes.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;

use kagi_kernel::test_utils::LoopbackPlatform;
use kagi_kernel::{Kernel, KernelHandle, RemoteSender};
use kagi_store::MemoryKVStore;
use kagi_types::{KernelError, RemoteId, VatDelivery, VatSyscall};

/// Captures every frame the kernel ships to a remote.
#[derive(Clone, Default)]
struct RecordingSender {
    frames: Arc<Mutex<Vec<(RemoteId, String)>>>,
}

impl RemoteSender for RecordingSender {
    fn send_frame(&self, remote: RemoteId, frame: String) {
        self.frames.lock().push((remote, frame));
    }

    fn stop(&self) {}
}

fn start_kernel() -> (KernelHandle, RecordingSender) {
    let sender = RecordingSender::default();
    let (kernel, handle) = Kernel::make(
        Box::new(MemoryKVStore::new()),
        Box::new(LoopbackPlatform::new()),
        Some(Box::new(sender.clone())),
    );
    tokio::spawn(kernel.run());
    (handle, sender)
}

fn syscall_frame(syscall: &VatSyscall) -> String {
    serde_json::to_string(syscall).unwrap()
}

#[tokio::test]
async fn test_remote_send_reaches_facet_and_notifies_back() {
    let (handle, sender) = start_kernel();
    let remote = handle.register_remote().await.unwrap();
    let facet = handle.kernel_facet().await.unwrap();
    let granted = handle.export_to_remote(remote, facet).await.unwrap();
    assert_eq!(granted.to_string(), "o-1");

    // the peer calls kvSet through its granted facet and subscribes to the
    // result
    let send = VatSyscall::Send {
        target: granted,
        methargs: kagi_types::VatCapData::plain(
            json!(["kvSet", ["answer", "42"]]).to_string(),
        ),
        result: Some("p+1".parse().unwrap()),
    };
    handle
        .remote_message(remote, syscall_frame(&send))
        .await
        .unwrap();
    let subscribe = VatSyscall::Subscribe {
        target: "p+1".parse().unwrap(),
    };
    handle
        .remote_message(remote, syscall_frame(&subscribe))
        .await
        .unwrap();

    // drive until the notify ships
    for _ in 0..200 {
        if !sender.frames.lock().is_empty() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    assert_eq!(handle.kv_get("answer").await.unwrap().as_deref(), Some("42"));

    let frames = sender.frames.lock().clone();
    let (to, frame) = frames.first().expect("a notify frame").clone();
    assert_eq!(to, remote);
    let delivery: VatDelivery = serde_json::from_str(&frame).unwrap();
    match delivery {
        VatDelivery::Notify { resolutions } => {
            assert_eq!(resolutions[0].0.to_string(), "p+1");
            assert!(!resolutions[0].1);
        }
        other => panic!("expected notify, got {other:?}"),
    }
}

#[tokio::test]
async fn test_remote_vat_only_syscall_is_rejected() {
    let (handle, _) = start_kernel();
    let remote = handle.register_remote().await.unwrap();
    let result = handle
        .remote_message(
            remote,
            syscall_frame(&VatSyscall::VatstoreGet { key: "x".into() }),
        )
        .await;
    assert!(matches!(result, Err(KernelError::Protocol(_))));
}

#[tokio::test]
async fn test_unknown_remote_is_refused() {
    let (handle, _) = start_kernel();
    let result = handle
        .remote_message(RemoteId::new(99), "{}".to_string())
        .await;
    assert!(matches!(result, Err(KernelError::RemoteNotFound(_))));
}

#[tokio::test]
async fn test_give_up_forgets_the_peer() {
    let (handle, _) = start_kernel();
    let remote = handle.register_remote().await.unwrap();
    let facet = handle.kernel_facet().await.unwrap();
    handle.export_to_remote(remote, facet).await.unwrap();

    handle.remote_give_up(remote).await.unwrap();

    // the peer's state is gone; further frames are refused
    let result = handle
        .remote_message(
            remote,
            syscall_frame(&VatSyscall::Subscribe {
                target: "p+1".parse().unwrap(),
            }),
        )
        .await;
    assert!(matches!(result, Err(KernelError::RemoteNotFound(_))));
}

#[tokio::test]
async fn test_incarnation_change_wipes_old_bindings() {
    let (handle, _) = start_kernel();
    let remote = handle.register_remote().await.unwrap();
    let facet = handle.kernel_facet().await.unwrap();
    let granted = handle.export_to_remote(remote, facet).await.unwrap();

    handle.remote_incarnation_change(remote, 1).await.unwrap();

    // the old eref no longer resolves under the new incarnation
    let stale = VatSyscall::Send {
        target: granted,
        methargs: kagi_types::VatCapData::plain(json!(["kvGet", ["x"]]).to_string()),
        result: None,
    };
    let result = handle.remote_message(remote, syscall_frame(&stale)).await;
    assert!(matches!(result, Err(KernelError::UnknownEref { .. })));

    // going backwards is a protocol violation
    let backwards = handle.remote_incarnation_change(remote, 1).await;
    assert!(matches!(backwards, Err(KernelError::Protocol(_))));
}
