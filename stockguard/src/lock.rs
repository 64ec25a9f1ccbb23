//! Resource lock manager.
//!
//! Short-lived, named, mutually exclusive leases over resources (SKUs),
//! stored in a [`LockStore`] so they are visible to every node.
//!
//! Deadlock freedom rests on one rule: every caller acquires its keys in the
//! same global (lexicographic) order. [`ResourceKeys`] is the only way to name
//! a key set, and it is always sorted and deduplicated, so the rule cannot be
//! broken. Leases expire on their own, so a crashed holder cannot freeze a
//! resource forever.
//!
//! [`LockScope`] ties a [`LockSet`] to a value: dropping an unreleased scope,
//! for example when the future holding it is cancelled, releases its leases
//! in the background instead of leaving them to lapse.

use std::collections::BTreeSet;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use crate::config::{AcquireMode, LockConfig};
use crate::errors::LockError;
use crate::retry::BackoffPolicy;
use crate::store::LockStore;
use crate::types::{OwnerToken, ResourceKey, SkuId, Timestamp};

/// A sorted, duplicate-free set of resource keys.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ResourceKeys(Vec<ResourceKey>);

impl ResourceKeys {
    /// Collects keys into acquisition order.
    pub fn new(keys: impl IntoIterator<Item = ResourceKey>) -> Self {
        let unique: BTreeSet<ResourceKey> = keys.into_iter().collect();
        Self(unique.into_iter().collect())
    }

    /// The keys for a set of SKUs.
    pub fn for_skus<'a>(skus: impl IntoIterator<Item = &'a SkuId>) -> Self {
        Self::new(skus.into_iter().map(ResourceKey::from))
    }

    /// Keys in acquisition order.
    pub fn as_slice(&self) -> &[ResourceKey] {
        &self.0
    }

    /// Number of keys.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there are no keys.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// One held lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle {
    /// The locked resource
    pub key: ResourceKey,
    /// The holder
    pub owner: OwnerToken,
    /// When the lease lapses unless renewed
    pub expires_at: Timestamp,
}

/// Every lease acquired by one `acquire` call, under a single owner token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockSet {
    owner: OwnerToken,
    handles: Vec<LockHandle>,
}

impl LockSet {
    /// The owner token shared by all handles.
    pub const fn owner(&self) -> OwnerToken {
        self.owner
    }

    /// The held leases, in acquisition order.
    pub fn handles(&self) -> &[LockHandle] {
        &self.handles
    }

    /// The earliest expiry among the held leases.
    pub fn expires_at(&self) -> Option<Timestamp> {
        self.handles.iter().map(|handle| handle.expires_at).min()
    }
}

/// Acquires, renews and releases leases through a [`LockStore`].
#[derive(Debug, Clone)]
pub struct ResourceLockManager<S> {
    store: S,
    acquire_timeout: Duration,
    lease: Duration,
    mode: AcquireMode,
    backoff: BackoffPolicy,
}

impl<S> ResourceLockManager<S>
where
    S: LockStore,
{
    /// Creates a manager over `store`.
    pub fn new(store: S, config: LockConfig) -> Self {
        Self {
            store,
            acquire_timeout: config.acquire_timeout.as_duration(),
            lease: config.lease.as_duration(),
            mode: config.mode,
            backoff: config.backoff.policy(),
        }
    }

    /// Acquires every key in order.
    ///
    /// On failure nothing stays held: leases obtained before the contended
    /// key are released before the error is returned.
    #[instrument(skip(self, keys), fields(keys = keys.len()))]
    pub async fn acquire(&self, keys: &ResourceKeys) -> Result<LockSet, LockError> {
        let owner = OwnerToken::generate();
        let started = Instant::now();
        let deadline = started + self.acquire_timeout;
        let mut set = LockSet {
            owner,
            handles: Vec::with_capacity(keys.len()),
        };

        for key in keys.as_slice() {
            match self.acquire_one(key, owner, deadline).await {
                Ok(handle) => set.handles.push(handle),
                Err(error) => {
                    self.release(&set).await;
                    return Err(match error {
                        LockError::Timeout { key, .. } => {
                            let waited = started.elapsed();
                            debug!(%key, ?waited, "lock acquisition timed out");
                            LockError::Timeout { key, waited }
                        }
                        other => other,
                    });
                }
            }
        }

        debug!(%owner, "locks acquired");
        Ok(set)
    }

    async fn acquire_one(
        &self,
        key: &ResourceKey,
        owner: OwnerToken,
        deadline: Instant,
    ) -> Result<LockHandle, LockError> {
        let mut attempt: u32 = 0;
        loop {
            let now = Timestamp::now();
            let expires_at = now.saturating_add(self.lease);
            if self.store.try_acquire(key, owner, expires_at, now).await? {
                return Ok(LockHandle {
                    key: key.clone(),
                    owner,
                    expires_at,
                });
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if self.mode == AcquireMode::FailFast || remaining.is_zero() {
                return Err(LockError::Timeout {
                    key: key.clone(),
                    waited: Duration::ZERO,
                });
            }

            attempt = attempt.saturating_add(1);
            let delay = self
                .backoff
                .delay_for(attempt)
                .max(Duration::from_millis(1))
                .min(remaining);
            debug!(%key, attempt, ?delay, "lock held elsewhere, backing off");
            tokio::time::sleep(delay).await;
        }
    }

    /// Extends every lease in `set` by a full lease period.
    ///
    /// Fails with [`LockError::Lost`] if any lease already expired or was
    /// taken by someone else. The caller must then abandon its critical
    /// section without committing.
    #[instrument(skip(self, set), fields(owner = %set.owner))]
    pub async fn renew(&self, set: &mut LockSet) -> Result<(), LockError> {
        for handle in &mut set.handles {
            let now = Timestamp::now();
            let expires_at = now.saturating_add(self.lease);
            if !self
                .store
                .renew(&handle.key, handle.owner, expires_at, now)
                .await?
            {
                warn!(key = %handle.key, "lease lost before renewal");
                return Err(LockError::Lost {
                    key: handle.key.clone(),
                });
            }
            handle.expires_at = expires_at;
        }
        Ok(())
    }

    /// Releases every lease in `set`. Idempotent: leases that already expired
    /// or were released are skipped. Store failures are logged, not returned,
    /// since an unreleased lease still lapses on its own.
    #[instrument(skip(self, set), fields(owner = %set.owner))]
    pub async fn release(&self, set: &LockSet) {
        for handle in set.handles.iter().rev() {
            if let Err(error) = self.store.release(&handle.key, handle.owner).await {
                warn!(key = %handle.key, %error, "failed to release lease; it will expire");
            }
        }
    }
}

impl<S> ResourceLockManager<S>
where
    S: LockStore + Clone + 'static,
{
    /// Acquires every key in order, like [`acquire`](Self::acquire), and
    /// wraps the leases in a scope that gives them back when dropped.
    pub async fn acquire_scoped(&self, keys: &ResourceKeys) -> Result<LockScope<S>, LockError> {
        let set = self.acquire(keys).await?;
        Ok(LockScope {
            manager: self.clone(),
            set,
            released: false,
        })
    }
}

/// Leases that are released when the scope is dropped.
///
/// [`release`](Self::release) gives them back in line. A scope dropped
/// without it spawns the release on the current runtime; outside a runtime
/// the leases lapse at their expiry.
#[derive(Debug)]
pub struct LockScope<S>
where
    S: LockStore + Clone + 'static,
{
    manager: ResourceLockManager<S>,
    set: LockSet,
    released: bool,
}

impl<S> LockScope<S>
where
    S: LockStore + Clone + 'static,
{
    /// The held leases.
    pub const fn set(&self) -> &LockSet {
        &self.set
    }

    /// The held leases, for renewal.
    pub fn set_mut(&mut self) -> &mut LockSet {
        &mut self.set
    }

    /// Releases every lease now.
    pub async fn release(mut self) {
        self.manager.release(&self.set).await;
        self.released = true;
    }
}

impl<S> Drop for LockScope<S>
where
    S: LockStore + Clone + 'static,
{
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let owner = self.set.owner;
        if let Ok(runtime) = Handle::try_current() {
            debug!(%owner, "lock scope dropped while held, releasing in the background");
            let manager = self.manager.clone();
            let set = self.set.clone();
            runtime.spawn(async move { manager.release(&set).await });
        } else {
            warn!(%owner, "lock scope dropped outside a runtime, leases will lapse");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn key(name: &str) -> ResourceKey {
        ResourceKey::try_new(name).unwrap()
    }

    #[test]
    fn resource_keys_are_sorted_and_unique() {
        let keys = ResourceKeys::new(vec![key("C"), key("A"), key("B"), key("A")]);
        let names: Vec<String> = keys.as_slice().iter().map(ToString::to_string).collect();
        assert_eq!(names, vec!["A", "B", "C"]);
    }

    proptest! {
        #[test]
        fn any_permutation_yields_the_same_order(
            mut names in proptest::collection::vec("[A-Z]{1,3}", 1..12)
        ) {
            let forward = ResourceKeys::new(names.iter().map(|n| key(n)));
            names.reverse();
            let backward = ResourceKeys::new(names.iter().map(|n| key(n)));
            prop_assert_eq!(forward, backward);
        }
    }
}
