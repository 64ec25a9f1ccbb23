//! Optimistic version controller.
//!
//! Applies a pure state transition to a versioned record with a
//! read / compute / conditional-write loop. A conflicting writer makes the
//! conditional write fail; the controller then re-reads and recomputes, up to
//! a bounded number of retries with backoff. There is no priority between
//! retrying writers: the first to commit wins.

use async_trait::async_trait;
use tracing::{debug, instrument, warn};

use crate::config::ConflictRetryConfig;
use crate::errors::{MutationError, StoreResult};
use crate::retry::BackoffPolicy;

/// Something the version controller can mutate.
///
/// The only store primitive required is a write conditioned on the state read
/// being unchanged, which fails with
/// [`StoreError::VersionConflict`](crate::errors::StoreError::VersionConflict)
/// otherwise.
#[async_trait]
pub trait VersionedTarget: Send + Sync {
    /// The state read and written, including whatever versions guard it.
    type State: Send + Sync;
    /// What a successful write returns.
    type Committed: Send;

    /// Identifies the record(s) in logs and errors.
    fn record_id(&self) -> String;

    /// Reads the current state.
    async fn read(&self) -> StoreResult<Self::State>;

    /// Writes `next` if the stored state is still `current`.
    async fn write_if_unchanged(
        &self,
        current: &Self::State,
        next: Self::State,
    ) -> StoreResult<Self::Committed>;
}

/// Retries conditional writes on version conflicts.
#[derive(Debug, Clone, Copy)]
pub struct VersionController {
    max_retries: u32,
    backoff: BackoffPolicy,
}

impl VersionController {
    /// Creates a controller from validated settings.
    pub fn new(config: ConflictRetryConfig) -> Self {
        Self {
            max_retries: config.max_retries.into(),
            backoff: config.backoff.policy(),
        }
    }

    /// Creates a controller from raw settings.
    pub const fn with_policy(max_retries: u32, backoff: BackoffPolicy) -> Self {
        Self {
            max_retries,
            backoff,
        }
    }

    /// Retries allowed after the first attempt.
    pub const fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Reads `target`, computes the next state with `apply`, and writes it if
    /// nobody else wrote in between. Retries on conflict.
    ///
    /// `apply` must be pure: it may run once per attempt. If it returns an
    /// error the loop stops immediately with [`MutationError::Rejected`].
    #[instrument(skip_all, fields(record = %target.record_id()))]
    pub async fn mutate<T, F, E>(
        &self,
        target: &T,
        mut apply: F,
    ) -> Result<T::Committed, MutationError<E>>
    where
        T: VersionedTarget + ?Sized,
        F: FnMut(&T::State) -> Result<T::State, E> + Send,
        E: Send,
    {
        let mut attempt: u32 = 0;
        loop {
            let current = target.read().await.map_err(MutationError::Store)?;
            let next = apply(&current).map_err(MutationError::Rejected)?;

            match target.write_if_unchanged(&current, next).await {
                Ok(committed) => {
                    if attempt > 0 {
                        debug!(attempt, "conditional write succeeded after retry");
                    }
                    return Ok(committed);
                }
                Err(error) if error.is_conflict() => {
                    if attempt >= self.max_retries {
                        warn!(attempts = attempt + 1, "conflict retries exhausted");
                        return Err(MutationError::ConflictExhausted {
                            record: target.record_id(),
                            attempts: attempt + 1,
                        });
                    }
                    attempt += 1;
                    let delay = self.backoff.delay_for(attempt);
                    debug!(attempt, ?delay, %error, "version conflict, retrying");
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
                Err(error) => return Err(MutationError::Store(error)),
            }
        }
    }
}

impl Default for VersionController {
    fn default() -> Self {
        Self::new(ConflictRetryConfig::default())
    }
}
