//! Process-wide configuration overlay scoped to one script execution.
//!
//! An overlay is installed right before a script body runs and restored
//! right after, on every exit path. Executors that share an [`OverlayGate`]
//! never have two overlays installed at once: the gate hands out a single
//! [`OverlayLease`], and dropping the lease restores the overlay and frees the
//! gate. The lease is an owned value, so the worker can release it after a
//! normal finish and the driving thread can release it after a timeout.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::time::Duration;

use anyhow::{Result, anyhow};
use tracing::{debug, warn};

use crate::core::task::CancelFlag;

/// Ambient environment a script body sees while it runs.
pub trait ConfigOverlay: Send + Sync {
    /// Install `properties` as the ambient configuration.
    fn install(&self, properties: &BTreeMap<String, String>) -> Result<()>;

    /// Undo the most recent [`ConfigOverlay::install`].
    fn restore(&self);
}

/// In-process ambient properties, readable by engines while a script runs.
#[derive(Debug, Default)]
pub struct AmbientProperties {
    current: RwLock<BTreeMap<String, String>>,
    saved: Mutex<Vec<BTreeMap<String, String>>>,
}

impl AmbientProperties {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ambient properties present outside of any script execution.
    pub fn with_base(base: BTreeMap<String, String>) -> Self {
        Self {
            current: RwLock::new(base),
            saved: Mutex::new(Vec::new()),
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.current.read().ok()?.get(key).cloned()
    }

    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.current
            .read()
            .map(|current| current.clone())
            .unwrap_or_default()
    }
}

impl ConfigOverlay for AmbientProperties {
    fn install(&self, properties: &BTreeMap<String, String>) -> Result<()> {
        let mut current = self
            .current
            .write()
            .map_err(|_| anyhow!("ambient properties poisoned"))?;
        let mut saved = self
            .saved
            .lock()
            .map_err(|_| anyhow!("ambient properties poisoned"))?;
        saved.push(current.clone());
        for (key, value) in properties {
            current.insert(key.clone(), value.clone());
        }
        Ok(())
    }

    fn restore(&self) {
        let (Ok(mut current), Ok(mut saved)) = (self.current.write(), self.saved.lock()) else {
            warn!("ambient properties poisoned, cannot restore");
            return;
        };
        match saved.pop() {
            Some(previous) => *current = previous,
            None => warn!("restore called without a matching install"),
        }
    }
}

/// Serializes overlay install/restore across executors.
pub struct OverlayGate {
    overlay: Arc<dyn ConfigOverlay>,
    busy: Mutex<bool>,
    freed: Condvar,
}

impl fmt::Debug for OverlayGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let busy = self.busy.lock().map(|busy| *busy).unwrap_or(true);
        f.debug_struct("OverlayGate").field("busy", &busy).finish()
    }
}

impl OverlayGate {
    pub fn new(overlay: Arc<dyn ConfigOverlay>) -> Self {
        Self {
            overlay,
            busy: Mutex::new(false),
            freed: Condvar::new(),
        }
    }

    /// Wait for the gate, then install `properties`.
    ///
    /// Returns `Ok(None)` when `abort` is raised while waiting; nothing is
    /// installed in that case.
    pub fn acquire(
        self: &Arc<Self>,
        properties: &BTreeMap<String, String>,
        abort: &CancelFlag,
        poll: Duration,
    ) -> Result<Option<OverlayLease>> {
        {
            let mut busy = self
                .busy
                .lock()
                .map_err(|_| anyhow!("overlay gate poisoned"))?;
            while *busy {
                if abort.is_cancelled() {
                    debug!("abandoning overlay wait");
                    return Ok(None);
                }
                busy = self
                    .freed
                    .wait_timeout(busy, poll)
                    .map_err(|_| anyhow!("overlay gate poisoned"))?
                    .0;
            }
            if abort.is_cancelled() {
                return Ok(None);
            }
            *busy = true;
        }

        if let Err(err) = self.overlay.install(properties) {
            self.free();
            return Err(err.context("install configuration overlay"));
        }
        debug!(entries = properties.len(), "configuration overlay installed");
        Ok(Some(OverlayLease {
            gate: Arc::clone(self),
            restored: false,
        }))
    }

    fn free(&self) {
        if let Ok(mut busy) = self.busy.lock() {
            *busy = false;
        }
        self.freed.notify_one();
    }
}

/// Exclusive use of an installed overlay; dropping it restores and frees the gate.
#[derive(Debug)]
pub struct OverlayLease {
    gate: Arc<OverlayGate>,
    restored: bool,
}

impl OverlayLease {
    /// Restore the overlay now but keep the gate busy until the lease drops.
    pub fn restore(&mut self) {
        if self.restored {
            return;
        }
        self.restored = true;
        self.gate.overlay.restore();
        debug!("configuration overlay restored, gate still held");
    }
}

impl Drop for OverlayLease {
    fn drop(&mut self) {
        if !self.restored {
            self.gate.overlay.restore();
            debug!("configuration overlay restored");
        }
        self.gate.free();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn props(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn lease_installs_and_restores() {
        let ambient = Arc::new(AmbientProperties::with_base(props(&[("base", "1")])));
        let gate = Arc::new(OverlayGate::new(ambient.clone()));

        let lease = gate
            .acquire(&props(&[("job", "x")]), &CancelFlag::new(), Duration::from_millis(5))
            .expect("acquire")
            .expect("lease");
        assert_eq!(ambient.get("job").as_deref(), Some("x"));
        assert_eq!(ambient.get("base").as_deref(), Some("1"));

        drop(lease);
        assert_eq!(ambient.get("job"), None);
        assert_eq!(ambient.get("base").as_deref(), Some("1"));
    }

    #[test]
    fn second_acquire_waits_for_release() {
        let ambient = Arc::new(AmbientProperties::new());
        let gate = Arc::new(OverlayGate::new(ambient.clone()));
        let lease = gate
            .acquire(&props(&[("owner", "first")]), &CancelFlag::new(), Duration::from_millis(5))
            .expect("acquire")
            .expect("lease");

        let waiter_gate = gate.clone();
        let waiter_ambient = ambient.clone();
        let waiter = thread::spawn(move || {
            let lease = waiter_gate
                .acquire(&props(&[("owner", "second")]), &CancelFlag::new(), Duration::from_millis(5))
                .expect("acquire")
                .expect("lease");
            let seen = waiter_ambient.get("owner");
            drop(lease);
            seen
        });

        thread::sleep(Duration::from_millis(50));
        assert_eq!(ambient.get("owner").as_deref(), Some("first"));
        drop(lease);

        assert_eq!(waiter.join().expect("join").as_deref(), Some("second"));
        assert_eq!(ambient.get("owner"), None);
    }

    #[test]
    fn early_restore_keeps_gate_busy_until_drop() {
        let ambient = Arc::new(AmbientProperties::new());
        let gate = Arc::new(OverlayGate::new(ambient.clone()));
        let mut lease = gate
            .acquire(&props(&[("owner", "first")]), &CancelFlag::new(), Duration::from_millis(5))
            .expect("acquire")
            .expect("lease");

        lease.restore();
        lease.restore();
        assert_eq!(ambient.get("owner"), None);

        let abort = CancelFlag::new();
        let waiter_gate = gate.clone();
        let waiter_abort = abort.clone();
        let waiter = thread::spawn(move || {
            waiter_gate
                .acquire(&props(&[("owner", "second")]), &waiter_abort, Duration::from_millis(5))
                .expect("acquire")
                .is_some()
        });
        thread::sleep(Duration::from_millis(50));
        assert_eq!(ambient.get("owner"), None, "gate must stay busy after an early restore");

        drop(lease);
        assert!(waiter.join().expect("join"));
        assert_eq!(ambient.get("owner"), None);
        assert!(ambient.snapshot().is_empty());
    }

    #[test]
    fn cancelled_waiter_gives_up_without_installing() {
        let ambient = Arc::new(AmbientProperties::new());
        let gate = Arc::new(OverlayGate::new(ambient.clone()));
        let _held = gate
            .acquire(&props(&[("owner", "first")]), &CancelFlag::new(), Duration::from_millis(5))
            .expect("acquire")
            .expect("lease");

        let abort = CancelFlag::new();
        abort.cancel();
        let lease = gate
            .acquire(&props(&[("owner", "second")]), &abort, Duration::from_millis(5))
            .expect("acquire");
        assert!(lease.is_none());
        assert_eq!(ambient.get("owner").as_deref(), Some("first"));
    }
}
