// src/pipeline/command.rs
//
// Control interface. External callers never touch loop state directly:
// requests are enqueued and the loop applies them at the start of its next
// tick, replying over a oneshot channel.

use crate::memory::MemorySummary;
use crate::pipeline::snapshot::Snapshot;
use crate::types::{ManualCommand, ManualInfo, Mode};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

/// Queued control requests, FIFO.
pub const COMMAND_QUEUE_DEPTH: usize = 32;

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("invalid command: {0}")]
    InvalidCommand(String),
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),
    #[error("rejected: emergency preemption active")]
    EmergencyActive,
    #[error("simulator unavailable: {0}")]
    SimulatorUnavailable(String),
    #[error("control loop is not available")]
    Unavailable,
}

/// Mode report returned by `get_mode` and mode-changing requests.
#[derive(Debug, Clone, Serialize)]
pub struct ModeStatus {
    pub mode: Mode,
    pub manual: ManualInfo,
}

#[derive(Debug)]
pub enum ControlRequest {
    Start(oneshot::Sender<Result<(), ControlError>>),
    Stop(oneshot::Sender<()>),
    SetMode(Mode, oneshot::Sender<Result<ModeStatus, ControlError>>),
    ApplyManual {
        command: ManualCommand,
        duration_secs: u32,
        reply: oneshot::Sender<Result<(), ControlError>>,
    },
    CancelManual(oneshot::Sender<ModeStatus>),
    MemorySummary(oneshot::Sender<MemorySummary>),
    /// Terminate the loop task entirely (process shutdown).
    Shutdown(oneshot::Sender<()>),
}

/// Clonable handle to a running control loop.
#[derive(Clone)]
pub struct ControlHandle {
    requests: mpsc::Sender<ControlRequest>,
    status: watch::Receiver<Snapshot>,
    stream: broadcast::Sender<Snapshot>,
}

impl ControlHandle {
    pub(crate) fn new(
        requests: mpsc::Sender<ControlRequest>,
        status: watch::Receiver<Snapshot>,
        stream: broadcast::Sender<Snapshot>,
    ) -> Self {
        Self {
            requests,
            status,
            stream,
        }
    }

    /// Start the simulation. Idempotent: calling while running is an ok
    /// no-op.
    pub async fn start(&self) -> Result<(), ControlError> {
        self.request(ControlRequest::Start).await?
    }

    /// Stop at the end of the current tick. Idempotent.
    pub async fn stop(&self) -> Result<(), ControlError> {
        self.request(ControlRequest::Stop).await
    }

    pub async fn set_mode(&self, mode: Mode) -> Result<ModeStatus, ControlError> {
        self.request(|reply| ControlRequest::SetMode(mode, reply))
            .await?
    }

    pub async fn apply_manual(
        &self,
        command: ManualCommand,
        duration_secs: u32,
    ) -> Result<(), ControlError> {
        self.request(|reply| ControlRequest::ApplyManual {
            command,
            duration_secs,
            reply,
        })
        .await?
    }

    pub async fn cancel_manual(&self) -> Result<ModeStatus, ControlError> {
        self.request(ControlRequest::CancelManual).await
    }

    pub async fn memory_summary(&self) -> Result<MemorySummary, ControlError> {
        self.request(ControlRequest::MemorySummary).await
    }

    pub async fn shutdown(&self) -> Result<(), ControlError> {
        self.request(ControlRequest::Shutdown).await
    }

    /// Latest published snapshot (idle placeholder before the first tick).
    pub fn get_status(&self) -> Snapshot {
        self.status.borrow().clone()
    }

    /// Mode view derived from the latest snapshot.
    pub fn get_mode(&self) -> ModeStatus {
        let snapshot = self.status.borrow();
        ModeStatus {
            mode: snapshot.mode,
            manual: snapshot.manual,
        }
    }

    /// Subscribe to the snapshot stream. Slow readers skip, never stall.
    pub fn subscribe(&self) -> broadcast::Receiver<Snapshot> {
        self.stream.subscribe()
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> ControlRequest,
    ) -> Result<T, ControlError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.requests
            .send(make(reply_tx))
            .await
            .map_err(|_| ControlError::Unavailable)?;
        reply_rx.await.map_err(|_| ControlError::Unavailable)
    }
}
