//! Flow event stream with one-shot "scope finished" subscriptions.
//!
//! Scripts can ask to be called back once the flow scope enclosing their step
//! finishes. Each subscription fires at most once: it is removed from the
//! stream before its callback runs. A callback that fails marks the scope
//! failed through the host.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use tracing::{debug, error, info};

use crate::core::types::StepStatus;
use crate::io::host::StepHost;

/// Callback invoked when a subscribed scope finishes.
pub type FinishCallback = Box<dyn FnOnce() -> Result<()> + Send>;

/// Events published by the host while a flow executes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowEvent {
    /// A flow or sub-flow scope reached a final status.
    ScopeFinished {
        exec_id: i64,
        scope_id: String,
        status: StepStatus,
    },
}

/// Handle returned by [`FlowEvents::subscribe_on_finish`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscription {
    id: SubscriptionId,
    exec_id: i64,
    scope_id: String,
    callback: FinishCallback,
}

/// Subscriptions keyed by flow scope.
pub struct FlowEvents {
    host: Arc<dyn StepHost>,
    next_id: AtomicU64,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl fmt::Debug for FlowEvents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowEvents")
            .field("pending", &self.pending())
            .finish()
    }
}

impl FlowEvents {
    pub fn new(host: Arc<dyn StepHost>) -> Self {
        Self {
            host,
            next_id: AtomicU64::new(1),
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    /// Call `callback` once when scope `scope_id` of `exec_id` finishes.
    pub fn subscribe_on_finish(
        &self,
        exec_id: i64,
        scope_id: impl Into<String>,
        callback: FinishCallback,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let scope_id = scope_id.into();
        debug!(exec_id, scope = %scope_id, "registering finish callback");
        if let Ok(mut subs) = self.subscriptions.lock() {
            subs.push(Subscription {
                id,
                exec_id,
                scope_id,
                callback,
            });
        }
        id
    }

    /// Drop a subscription that has not fired yet. Returns true if it existed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let Ok(mut subs) = self.subscriptions.lock() else {
            return false;
        };
        let before = subs.len();
        subs.retain(|sub| sub.id != id);
        subs.len() != before
    }

    /// Number of subscriptions waiting for their scope to finish.
    pub fn pending(&self) -> usize {
        self.subscriptions.lock().map(|subs| subs.len()).unwrap_or(0)
    }

    /// Deliver `event`; returns how many callbacks ran.
    pub fn publish(&self, event: &FlowEvent) -> usize {
        let FlowEvent::ScopeFinished {
            exec_id, scope_id, ..
        } = event;

        let fired: Vec<Subscription> = match self.subscriptions.lock() {
            Ok(mut subs) => {
                let (matching, rest): (Vec<Subscription>, Vec<Subscription>) = std::mem::take(&mut *subs)
                    .into_iter()
                    .partition(|sub| sub.exec_id == *exec_id && sub.scope_id == *scope_id);
                *subs = rest;
                matching
            }
            Err(_) => return 0,
        };

        let count = fired.len();
        for sub in fired {
            info!(exec_id, scope = %scope_id, "running finish callback");
            if let Err(err) = (sub.callback)() {
                error!(exec_id, scope = %scope_id, err = %format!("{err:#}"), "finish callback failed, marking scope failed");
                if let Err(mark_err) = self.host.mark_scope_failed(*exec_id, scope_id) {
                    error!(err = %format!("{mark_err:#}"), "could not mark scope failed");
                }
            }
        }
        count
    }
}

/// Finish subscription capability bound to one step's enclosing scope.
#[derive(Debug, Clone)]
pub struct FinishHook {
    events: Arc<FlowEvents>,
    exec_id: i64,
    scope_id: String,
}

impl FinishHook {
    pub fn new(events: Arc<FlowEvents>, exec_id: i64, scope_id: impl Into<String>) -> Self {
        Self {
            events,
            exec_id,
            scope_id: scope_id.into(),
        }
    }

    /// Register `callback` for when the enclosing scope finishes.
    pub fn register(&self, callback: FinishCallback) -> SubscriptionId {
        self.events
            .subscribe_on_finish(self.exec_id, self.scope_id.clone(), callback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::host::InMemoryHost;
    use anyhow::anyhow;
    use std::sync::atomic::AtomicUsize;

    fn finished(exec_id: i64, scope: &str) -> FlowEvent {
        FlowEvent::ScopeFinished {
            exec_id,
            scope_id: scope.to_string(),
            status: StepStatus::Succeeded,
        }
    }

    #[test]
    fn callback_fires_at_most_once() {
        let host = Arc::new(InMemoryHost::new());
        let events = FlowEvents::new(host);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        events.subscribe_on_finish(
            1,
            "daily",
            Box::new(move || -> Result<()> {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );

        assert_eq!(events.publish(&finished(1, "daily")), 1);
        assert_eq!(events.publish(&finished(1, "daily")), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(events.pending(), 0);
    }

    #[test]
    fn other_scopes_do_not_fire() {
        let host = Arc::new(InMemoryHost::new());
        let events = FlowEvents::new(host);
        events.subscribe_on_finish(1, "daily", Box::new(|| -> Result<()> { Ok(()) }));

        assert_eq!(events.publish(&finished(1, "weekly")), 0);
        assert_eq!(events.publish(&finished(2, "daily")), 0);
        assert_eq!(events.pending(), 1);
    }

    #[test]
    fn failing_callback_marks_scope_failed() {
        let host = Arc::new(InMemoryHost::new());
        let events = FlowEvents::new(host.clone());
        events.subscribe_on_finish(3, "nightly", Box::new(|| -> Result<()> { Err(anyhow!("cleanup failed")) }));

        assert_eq!(events.publish(&finished(3, "nightly")), 1);
        assert_eq!(host.failed_scopes(), vec![(3, "nightly".to_string())]);
    }

    #[test]
    fn unsubscribe_prevents_delivery() {
        let host = Arc::new(InMemoryHost::new());
        let events = Arc::new(FlowEvents::new(host));
        let hook = FinishHook::new(events.clone(), 1, "daily");
        let id = hook.register(Box::new(|| -> Result<()> { Ok(()) }));

        assert!(events.unsubscribe(id));
        assert!(!events.unsubscribe(id));
        assert_eq!(events.publish(&finished(1, "daily")), 0);
    }
}
