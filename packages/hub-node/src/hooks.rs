//! Lifecycle hooks for host applications.
//!
//! Hooks are named callback lists dispatched by the coordinator after the
//! corresponding registry or membership change has been applied. Callbacks
//! run synchronously on the dispatching task and must be cheap; anything
//! slow belongs behind the host's own channel.

use std::collections::HashMap;

use parking_lot::Mutex;

use processhub_core::{Pid, RedundancyMode};

/// Hook names a host can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Hook {
    ChildStarted,
    ChildStopped,
    ChildrenMigrated,
    RedundancySignal,
    ClusterJoin,
    ClusterLeave,
}

/// Payload delivered to hook callbacks.
#[derive(Debug, Clone, PartialEq)]
pub enum HookEvent {
    ChildStarted {
        child_id: String,
        node: String,
        pid: Pid,
    },
    ChildStopped {
        child_id: String,
        node: String,
    },
    ChildrenMigrated {
        child_ids: Vec<String>,
        target: String,
    },
    RedundancySignal {
        child_id: String,
        mode: RedundancyMode,
    },
    ClusterJoin {
        node: String,
    },
    ClusterLeave {
        node: String,
    },
}

impl HookEvent {
    /// The hook this event belongs to.
    #[must_use]
    pub fn hook(&self) -> Hook {
        match self {
            Self::ChildStarted { .. } => Hook::ChildStarted,
            Self::ChildStopped { .. } => Hook::ChildStopped,
            Self::ChildrenMigrated { .. } => Hook::ChildrenMigrated,
            Self::RedundancySignal { .. } => Hook::RedundancySignal,
            Self::ClusterJoin { .. } => Hook::ClusterJoin,
            Self::ClusterLeave { .. } => Hook::ClusterLeave,
        }
    }
}

type Callback = Box<dyn Fn(&HookEvent) + Send + Sync>;

/// Registry of hook callbacks for one hub.
#[derive(Default)]
pub struct HookRegistry {
    callbacks: Mutex<HashMap<Hook, Vec<Callback>>>,
}

impl std::fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookRegistry").finish_non_exhaustive()
    }
}

impl HookRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a callback for a hook.
    pub fn on(&self, hook: Hook, callback: impl Fn(&HookEvent) + Send + Sync + 'static) {
        self.callbacks
            .lock()
            .entry(hook)
            .or_default()
            .push(Box::new(callback));
    }

    /// Dispatches an event to every callback registered for its hook.
    pub fn dispatch(&self, event: &HookEvent) {
        let callbacks = self.callbacks.lock();
        if let Some(list) = callbacks.get(&event.hook()) {
            for callback in list {
                callback(event);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    #[test]
    fn dispatch_reaches_matching_hook_only() {
        let registry = HookRegistry::new();
        let started = Arc::new(AtomicUsize::new(0));
        let stopped = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&started);
        registry.on(Hook::ChildStarted, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let counter = Arc::clone(&stopped);
        registry.on(Hook::ChildStopped, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        registry.dispatch(&HookEvent::ChildStarted {
            child_id: "w1".to_string(),
            node: "node-a".to_string(),
            pid: Pid(1),
        });

        assert_eq!(started.load(Ordering::SeqCst), 1);
        assert_eq!(stopped.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn multiple_callbacks_fire_in_registration_order() {
        let registry = HookRegistry::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second"] {
            let order = Arc::clone(&order);
            registry.on(Hook::ClusterJoin, move |_| order.lock().push(tag));
        }

        registry.dispatch(&HookEvent::ClusterJoin {
            node: "node-b".to_string(),
        });
        assert_eq!(*order.lock(), vec!["first", "second"]);
    }
}
