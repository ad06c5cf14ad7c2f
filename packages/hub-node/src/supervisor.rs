//! Local child supervision.
//!
//! The hub treats the supervisor as a collaborator behind a trait: it starts
//! and terminates local replicas and hands out worker mailboxes. The
//! bundled [`InProcessSupervisor`] builds workers from a factory closure and
//! runs them as tokio tasks; host applications with their own process
//! management implement [`ChildSupervisor`] instead.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use processhub_core::{ChildSpec, Pid, StartResult};

use crate::worker::{spawn_worker, ChildProcess, WorkerHandle};

// ---------------------------------------------------------------------------
// ChildSupervisor trait
// ---------------------------------------------------------------------------

/// Starts, stops, and exposes locally supervised children.
#[async_trait]
pub trait ChildSupervisor: Send + Sync + 'static {
    /// Starts a child from its spec. Starting an already running child is
    /// answered with `AlreadyStarted` and the existing pid.
    async fn start_child(&self, spec: &ChildSpec) -> StartResult;

    /// Terminates a running child. Returns `false` if it was not running.
    async fn terminate_child(&self, child_id: &str) -> bool;

    /// Returns the mailbox of a running child.
    fn handle(&self, child_id: &str) -> Option<WorkerHandle>;

    /// Returns every running child as `(child_id, spec, pid)`.
    fn running(&self) -> Vec<(String, ChildSpec, Pid)>;
}

// ---------------------------------------------------------------------------
// InProcessSupervisor
// ---------------------------------------------------------------------------

/// Builds a [`ChildProcess`] from a spec, or refuses with a reason.
pub type ChildFactory =
    dyn Fn(&ChildSpec) -> anyhow::Result<Box<dyn ChildProcess>> + Send + Sync;

struct RunningChild {
    spec: ChildSpec,
    pid: Pid,
    handle: WorkerHandle,
    join: JoinHandle<()>,
}

/// Supervisor that runs children as in-process tokio tasks.
pub struct InProcessSupervisor {
    factory: Box<ChildFactory>,
    children: DashMap<String, RunningChild>,
    next_pid: AtomicU64,
}

impl InProcessSupervisor {
    /// Creates a supervisor with the given worker factory.
    pub fn new(
        factory: impl Fn(&ChildSpec) -> anyhow::Result<Box<dyn ChildProcess>> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            factory: Box::new(factory),
            children: DashMap::new(),
            next_pid: AtomicU64::new(1),
        })
    }
}

#[async_trait]
impl ChildSupervisor for InProcessSupervisor {
    async fn start_child(&self, spec: &ChildSpec) -> StartResult {
        match self.children.entry(spec.child_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(existing) => StartResult::AlreadyStarted {
                pid: existing.get().pid,
            },
            dashmap::mapref::entry::Entry::Vacant(vacant) => match (self.factory)(spec) {
                Ok(process) => {
                    let pid = Pid(self.next_pid.fetch_add(1, Ordering::Relaxed));
                    let (handle, join) = spawn_worker(spec.child_id.clone(), process);
                    debug!(child_id = %spec.child_id, pid = %pid, "started child");
                    vacant.insert(RunningChild {
                        spec: spec.clone(),
                        pid,
                        handle,
                        join,
                    });
                    StartResult::Started { pid }
                }
                Err(err) => {
                    let reason = format!("{err:#}");
                    warn!(child_id = %spec.child_id, %reason, "child factory refused start");
                    StartResult::Failed { reason }
                }
            },
        }
    }

    async fn terminate_child(&self, child_id: &str) -> bool {
        let Some((_, child)) = self.children.remove(child_id) else {
            return false;
        };
        child.handle.stop().await;
        // Backstop for workers stuck in user code; a clean loop has already
        // exited on Stop by now.
        child.join.abort();
        debug!(child_id, pid = %child.pid, "terminated child");
        true
    }

    fn handle(&self, child_id: &str) -> Option<WorkerHandle> {
        self.children.get(child_id).map(|c| c.handle.clone())
    }

    fn running(&self) -> Vec<(String, ChildSpec, Pid)> {
        self.children
            .iter()
            .map(|c| (c.key().clone(), c.spec.clone(), c.pid))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
