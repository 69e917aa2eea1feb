use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use bluelink_domain::InstanceId;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::ProviderError;

/// A resource lock is keyed by `(instance, resource name)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceLockKey {
    pub instance_id: InstanceId,
    pub resource_name: String,
}

impl ResourceLockKey {
    pub fn new(instance_id: InstanceId, resource_name: impl Into<String>) -> Self {
        Self {
            instance_id,
            resource_name: resource_name.into(),
        }
    }
}

impl std::fmt::Display for ResourceLockKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.instance_id, self.resource_name)
    }
}

#[derive(Debug)]
struct LockEntry {
    acquired_by: String,
    acquired_at: Instant,
}

/// In-process lock table mediating cross-resource mutation, mainly for link
/// operations that touch resources outside their own worker.
///
/// The timeout is a liveness fence, not a correctness fence: a holder older
/// than it is presumed dead and evicted by the next acquirer. Correctness
/// relies on holders releasing on success and on
/// [`release_acquired_by`](Self::release_acquired_by) on the failure path.
pub struct ResourceLockTable {
    /// Dedicated mutex so lock traffic never contends with registry caches.
    locks: Mutex<HashMap<ResourceLockKey, LockEntry>>,
    timeout: Duration,
    check_interval: Duration,
}

impl ResourceLockTable {
    pub fn new(timeout: Duration, check_interval: Duration) -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            timeout,
            check_interval,
        }
    }

    /// Block until the key is free (or its holder has timed out), then take
    /// it. Cancellation surfaces as a lock-timeout error.
    pub async fn acquire(
        &self,
        key: ResourceLockKey,
        acquired_by: &str,
        cancel: &CancellationToken,
    ) -> Result<(), ProviderError> {
        loop {
            if self.try_acquire(&key, acquired_by) {
                return Ok(());
            }
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(ProviderError::LockAcquisitionTimedOut {
                        key: key.to_string(),
                    });
                }
                _ = tokio::time::sleep(self.check_interval) => {}
            }
        }
    }

    fn try_acquire(&self, key: &ResourceLockKey, acquired_by: &str) -> bool {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        match locks.get(key) {
            None => {}
            Some(entry) if entry.acquired_at.elapsed() > self.timeout => {
                warn!(
                    key = %key,
                    holder = %entry.acquired_by,
                    "evicting timed-out resource lock"
                );
            }
            Some(_) => return false,
        }
        locks.insert(
            key.clone(),
            LockEntry {
                acquired_by: acquired_by.to_string(),
                acquired_at: Instant::now(),
            },
        );
        debug!(key = %key, acquired_by = %acquired_by, "resource lock acquired");
        true
    }

    pub fn release(&self, key: &ResourceLockKey) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.remove(key);
    }

    /// Purge every lock belonging to the given instance.
    pub fn release_instance(&self, instance_id: InstanceId) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.retain(|key, _| key.instance_id != instance_id);
    }

    /// Release everything a single caller holds — the failure path for link
    /// operations that locked resources beyond their own endpoints.
    pub fn release_acquired_by(&self, acquired_by: &str) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.retain(|_, entry| entry.acquired_by != acquired_by);
    }

    /// Current holder of a key, if any.
    pub fn holder(&self, key: &ResourceLockKey) -> Option<String> {
        let locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.get(key).map(|e| e.acquired_by.clone())
    }
}
