//! Worker mailbox protocol and the `ChildProcess` seam for user code.
//!
//! A worker is a single-threaded task looping over a typed mailbox. The
//! handover protocol (hand state out, adopt shipped state, answer state
//! queries, observe redundancy transitions) is implemented once by
//! [`spawn_worker`]; user code only implements [`ChildProcess`] and never
//! sees a [`WorkerMessage`].

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::debug;

use processhub_core::RedundancyMode;

/// Capacity of a worker's mailbox.
const MAILBOX_CAPACITY: usize = 64;

// ---------------------------------------------------------------------------
// WorkerMessage / WorkerHandle
// ---------------------------------------------------------------------------

/// Messages a worker must handle to cooperate with the hub.
#[derive(Debug)]
pub enum WorkerMessage {
    /// A migration is in flight: emit the current state so the migrator can
    /// ship it to the incoming replica. Answering marks this child as
    /// retention-handled.
    HandoverStart { state_tx: oneshot::Sender<Value> },
    /// Adopt the shipped state of an outgoing replica.
    Handover { state: Value },
    /// Reply with the current state (graceful-shutdown collection).
    GetState { reply: oneshot::Sender<Value> },
    /// This replica's redundancy mode changed. Informational.
    RedundancySignal { mode: RedundancyMode },
    /// Application-level message forwarded verbatim to user code.
    Cast { payload: Value },
    /// Stop the worker loop.
    Stop,
}

/// Clonable sender half of a worker's mailbox.
///
/// All sends are best-effort: a worker that has already stopped is treated
/// as an absent recipient and the message is dropped silently.
#[derive(Clone)]
pub struct WorkerHandle {
    tx: mpsc::Sender<WorkerMessage>,
}

impl WorkerHandle {
    /// Asks the worker to emit its state for a migration handover.
    pub async fn handover_start(&self, state_tx: oneshot::Sender<Value>) {
        let _ = self.tx.send(WorkerMessage::HandoverStart { state_tx }).await;
    }

    /// Delivers a shipped state for adoption.
    pub async fn handover(&self, state: Value) {
        let _ = self.tx.send(WorkerMessage::Handover { state }).await;
    }

    /// Requests the worker's current state.
    pub async fn get_state(&self, reply: oneshot::Sender<Value>) {
        let _ = self.tx.send(WorkerMessage::GetState { reply }).await;
    }

    /// Notifies the worker of a redundancy mode transition.
    pub async fn redundancy_signal(&self, mode: RedundancyMode) {
        let _ = self.tx.send(WorkerMessage::RedundancySignal { mode }).await;
    }

    /// Forwards an application message.
    pub async fn cast(&self, payload: Value) {
        let _ = self.tx.send(WorkerMessage::Cast { payload }).await;
    }

    /// Asks the worker loop to stop.
    pub async fn stop(&self) {
        let _ = self.tx.send(WorkerMessage::Stop).await;
    }
}

// ---------------------------------------------------------------------------
// ChildProcess
// ---------------------------------------------------------------------------

/// User-supplied stateful worker logic.
///
/// State crosses nodes as an opaque JSON value; a worker that never migrates
/// can keep `apply_state` trivial. Redundancy transitions are informational
/// and default to a no-op.
#[async_trait]
pub trait ChildProcess: Send + 'static {
    /// Snapshot of the in-memory state handed to an incoming replica.
    fn state(&self) -> Value;

    /// Adopts the state of an outgoing replica.
    fn apply_state(&mut self, state: Value);

    /// Handles an application-level message.
    async fn handle_cast(&mut self, _payload: Value) {}

    /// Observes an active/passive transition.
    fn on_redundancy_change(&mut self, _mode: RedundancyMode) {}
}

/// Runs a [`ChildProcess`] behind the worker mailbox protocol.
///
/// The loop ends on [`WorkerMessage::Stop`] or when every handle is dropped.
pub fn spawn_worker(
    child_id: String,
    mut process: Box<dyn ChildProcess>,
) -> (WorkerHandle, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel(MAILBOX_CAPACITY);
    let join = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            match message {
                WorkerMessage::HandoverStart { state_tx } => {
                    // The migrator may have given up already; its absence is
                    // equivalent to a missed retention window.
                    let _ = state_tx.send(process.state());
                }
                WorkerMessage::Handover { state } => {
                    debug!(child_id = %child_id, "adopting handover state");
                    process.apply_state(state);
                }
                WorkerMessage::GetState { reply } => {
                    let _ = reply.send(process.state());
                }
                WorkerMessage::RedundancySignal { mode } => {
                    process.on_redundancy_change(mode);
                }
                WorkerMessage::Cast { payload } => {
                    process.handle_cast(payload).await;
                }
                WorkerMessage::Stop => break,
            }
        }
    });
    (WorkerHandle { tx }, join)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
