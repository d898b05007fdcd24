//! Shared leases over named instances launched with `reuse`.
//!
//! Launches that reuse the same name are serialized on a per-name lock, so
//! exactly one of them creates the instance and the rest attach to its lease.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

use crate::lifecycle::LifecycleHooks;
use crate::runtime::InstanceRef;

/// What dropping one holder of a lease left behind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Release {
    /// Other handles still hold the lease
    Remaining(usize),
    /// This was the last holder. `owned` is false for instances created
    /// outside this launcher, which must be left running.
    Last { owned: bool },
}

#[derive(Debug)]
pub(crate) struct Lease {
    name: String,
    reference: InstanceRef,
    owned: bool,
    /// Hooks of the request that created the instance; removal runs these
    hooks: LifecycleHooks,
    holders: Mutex<usize>,
    registry: Weak<ReuseRegistry>,
}

impl Lease {
    pub(crate) fn reference(&self) -> &InstanceRef {
        &self.reference
    }

    pub(crate) fn hooks(&self) -> &LifecycleHooks {
        &self.hooks
    }

    pub(crate) fn holders(&self) -> usize {
        *self.holders.lock()
    }

    /// Add a holder unless the lease is already fully released
    fn try_acquire(&self) -> bool {
        let mut holders = self.holders.lock();
        if *holders == 0 {
            return false;
        }
        *holders += 1;
        true
    }

    pub(crate) fn release(&self) -> Release {
        let remaining = {
            let mut holders = self.holders.lock();
            *holders = holders.saturating_sub(1);
            *holders
        };
        if remaining > 0 {
            return Release::Remaining(remaining);
        }

        if let Some(registry) = self.registry.upgrade() {
            registry.forget(&self.name, self);
        }
        debug!(name = %self.name, owned = self.owned, "♻️ REUSE: last holder released");
        Release::Last { owned: self.owned }
    }
}

#[derive(Debug, Default)]
pub(crate) struct ReuseRegistry {
    leases: DashMap<String, Arc<Lease>>,
    locks: DashMap<String, Arc<AsyncMutex<()>>>,
}

impl ReuseRegistry {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Serialize reuse launches of `name` until the guard is dropped
    pub(crate) async fn lock_name(self: &Arc<Self>, name: &str) -> NameGuard {
        let lock = self.locks.entry(name.to_string()).or_default().clone();
        let guard = lock.lock_owned().await;
        NameGuard {
            registry: self.clone(),
            name: name.to_string(),
            guard: Some(guard),
        }
    }

    /// Drop the lock for `name` once nobody holds or waits on it
    fn prune_lock(&self, name: &str) {
        self.locks
            .remove_if(name, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// Join the live lease for `name`, if there is one
    pub(crate) fn attach(&self, name: &str) -> Option<Arc<Lease>> {
        let lease = self.leases.get(name)?.clone();
        lease.try_acquire().then_some(lease)
    }

    /// Record a new lease with one holder
    pub(crate) fn register(
        self: &Arc<Self>,
        name: &str,
        reference: InstanceRef,
        owned: bool,
        hooks: LifecycleHooks,
    ) -> Arc<Lease> {
        let lease = Arc::new(Lease {
            name: name.to_string(),
            reference,
            owned,
            hooks,
            holders: Mutex::new(1),
            registry: Arc::downgrade(self),
        });
        self.leases.insert(name.to_string(), lease.clone());
        lease
    }

    #[cfg(test)]
    pub(crate) fn is_registered(&self, name: &str) -> bool {
        self.leases.contains_key(name)
    }

    #[cfg(test)]
    pub(crate) fn lock_count(&self) -> usize {
        self.locks.len()
    }

    fn forget(&self, name: &str, lease: &Lease) {
        self.leases
            .remove_if(name, |_, current| std::ptr::eq(Arc::as_ptr(current), lease));
        self.prune_lock(name);
    }
}

/// Holds the per-name reuse lock; the lock entry is pruned on drop when idle
#[derive(Debug)]
pub(crate) struct NameGuard {
    registry: Arc<ReuseRegistry>,
    name: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for NameGuard {
    fn drop(&mut self) {
        // release the mutex first so its Arc no longer counts as a holder
        self.guard.take();
        self.registry.prune_lock(&self.name);
    }
}
