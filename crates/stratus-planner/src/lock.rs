//! Persisted named locks serializing release binding across deploys.
//!
//! Locks are taken in sorted order so two deploys binding overlapping
//! release sets cannot deadlock. A [`LockSet`] releases everything it
//! holds when dropped.

use tokio::time::Instant;
use tracing::{debug, warn};

use stratus_core::DirectorConfig;
use stratus_state::StateStore;

use crate::epoch_secs;
use crate::error::{PlanError, PlanResult};

pub fn release_lock_name(release: &str) -> String {
    format!("lock:release:{release}")
}

/// Locks held by one owner. Dropping the set releases them.
#[must_use = "locks are released as soon as the set is dropped"]
pub struct LockSet {
    store: StateStore,
    owner: String,
    names: Vec<String>,
}

impl LockSet {
    pub fn names(&self) -> &[String] {
        &self.names
    }

    fn release_all(&mut self) {
        for name in self.names.drain(..).rev() {
            match self.store.release_lock(&name, &self.owner) {
                Ok(true) => debug!(lock = %name, owner = %self.owner, "lock released"),
                Ok(false) => warn!(lock = %name, owner = %self.owner, "lock was no longer held"),
                Err(e) => warn!(lock = %name, error = %e, "failed to release lock"),
            }
        }
    }
}

impl Drop for LockSet {
    fn drop(&mut self) {
        self.release_all();
    }
}

/// Acquire every lock in `names` for `owner`, waiting up to the configured
/// lock timeout for each. On failure, locks taken so far are released.
pub async fn acquire_locks(
    store: &StateStore,
    names: impl IntoIterator<Item = String>,
    owner: &str,
    config: &DirectorConfig,
) -> PlanResult<LockSet> {
    let mut sorted: Vec<String> = names.into_iter().collect();
    sorted.sort();
    sorted.dedup();

    let mut set = LockSet {
        store: store.clone(),
        owner: owner.to_string(),
        names: Vec::with_capacity(sorted.len()),
    };
    // Leases outlive the wait so a crashed holder is eventually taken over.
    let ttl = config.lock_timeout_secs.max(1) * 2;

    for name in sorted {
        let deadline = Instant::now() + config.lock_timeout();
        loop {
            if store.try_acquire_lock(&name, owner, ttl, epoch_secs())? {
                debug!(lock = %name, %owner, "lock acquired");
                set.names.push(name);
                break;
            }
            if Instant::now() >= deadline {
                warn!(lock = %name, %owner, "timed out waiting for lock");
                return Err(PlanError::LockTimeout(name));
            }
            tokio::time::sleep(config.lock_retry()).await;
        }
    }

    Ok(set)
}
