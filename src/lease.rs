use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};
use uuid::Uuid;

use crate::logging::{DEBUG, ERROR};
use crate::storage::{Storage, StorageError};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Whole-process advisory lease kept in the shared record store, so separate
/// processes scheduled at the same time exclude each other.
pub struct RunLease {
    storage: Storage,
    name: String,
    owner: String,
    ttl_secs: i64,
}

impl RunLease {
    pub fn new_owner() -> String {
        Uuid::new_v4().to_string()
    }

    /// Polls until the lease is claimed or `wait` runs out. `Ok(None)` means
    /// someone else holds it. The claim lapses on its own after `ttl`.
    pub fn acquire(
        storage: &Storage,
        name: &str,
        owner: &str,
        ttl: Duration,
        wait: Duration,
    ) -> Result<Option<Self>, StorageError> {
        let ttl_secs = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX / 2);
        let deadline = Instant::now() + wait;
        loop {
            if storage.try_claim_lease(name, owner, ttl_secs)? {
                debug!(target: DEBUG, lease = name, owner, "lease acquired");
                return Ok(Some(Self {
                    storage: storage.clone(),
                    name: name.to_string(),
                    owner: owner.to_string(),
                    ttl_secs,
                }));
            }
            let now = Instant::now();
            if now >= deadline {
                debug!(target: DEBUG, lease = name, "lease busy, giving up");
                return Ok(None);
            }
            thread::sleep(POLL_INTERVAL.min(deadline - now));
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Pushes the expiry out by another `ttl`. `Ok(false)` means the claim
    /// lapsed and another owner took it over.
    pub fn renew(&self) -> Result<bool, StorageError> {
        let renewed = self
            .storage
            .try_claim_lease(&self.name, &self.owner, self.ttl_secs)?;
        if !renewed {
            warn!(target: ERROR, lease = %self.name, owner = %self.owner, "lease was taken over");
        }
        Ok(renewed)
    }

    /// Best-effort; a failure is logged and the lease is left to expire.
    pub fn release(self) {
        match self.storage.release_lease(&self.name, &self.owner) {
            Ok(()) => debug!(target: DEBUG, lease = %self.name, "lease released"),
            Err(err) => warn!(target: ERROR, lease = %self.name, error = %err, "failed to release lease"),
        }
    }
}
