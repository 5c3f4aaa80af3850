//! Platform services: spawning and stopping vat workers.
//!
//! The kernel never hosts user code itself. A platform implementation
//! spawns an isolated execution domain per vat and hands back a
//! bidirectional byte pair carrying newline-delimited JSON-RPC. The
//! subprocess platform is the production shape; tests use the loopback
//! platform from [`crate::test_utils`].

use std::collections::HashMap;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tracing::{info, warn};

use kagi_types::{KernelError, VatConfig, VatId};

/// The byte pair connecting the kernel to one worker.
pub struct WorkerStream {
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    pub writer: Box<dyn AsyncWrite + Send + Unpin>,
}

/// Spawns and reaps isolated vat workers.
#[async_trait]
pub trait PlatformServices: Send {
    async fn launch_worker(
        &mut self,
        vat: VatId,
        config: &VatConfig,
    ) -> Result<WorkerStream, KernelError>;

    async fn stop_worker(&mut self, vat: VatId) -> Result<(), KernelError>;
}

/// Subprocess-per-vat platform: the bundle spec names the worker binary,
/// which speaks the worker protocol on stdio.
#[derive(Default)]
pub struct ProcessPlatform {
    children: HashMap<VatId, Child>,
}

impl ProcessPlatform {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PlatformServices for ProcessPlatform {
    async fn launch_worker(
        &mut self,
        vat: VatId,
        config: &VatConfig,
    ) -> Result<WorkerStream, KernelError> {
        let program = config
            .bundle_spec
            .as_deref()
            .and_then(|spec| spec.strip_prefix("exec:"))
            .ok_or_else(|| {
                KernelError::Protocol(
                    "process platform needs an exec: bundle spec".to_string(),
                )
            })?;
        let mut child = Command::new(program)
            .arg(vat.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| KernelError::StreamWrite(format!("spawn {program}: {e}")))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| KernelError::StreamWrite("worker stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| KernelError::StreamRead("worker stdout unavailable".into()))?;
        info!(%vat, program, "worker spawned");
        self.children.insert(vat, child);
        Ok(WorkerStream {
            reader: Box::new(stdout),
            writer: Box::new(stdin),
        })
    }

    async fn stop_worker(&mut self, vat: VatId) -> Result<(), KernelError> {
        if let Some(mut child) = self.children.remove(&vat) {
            if let Err(e) = child.kill().await {
                warn!(%vat, error = %e, "worker did not die cleanly");
            }
        }
        Ok(())
    }
}
