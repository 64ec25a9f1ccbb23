//! Idempotency guard.
//!
//! Ensures the operation behind an idempotency key runs at most once per
//! principal. The first request creates an `in_progress` record and proceeds;
//! a concurrent duplicate sees `in_progress` and gets
//! [`Begin::Conflict`] without blocking; a later duplicate gets the stored
//! outcome back via [`Begin::Replay`].
//!
//! An `in_progress` record that has not been touched for the grace period is
//! treated as abandoned by a crashed handler and may be taken over. Records
//! expire after their TTL.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::config::IdempotencyConfig;
use crate::errors::{GuardError, StoreError};
use crate::store::IdempotencyStore;
use crate::types::{IdempotencyKey, PrincipalId, Timestamp, Version};

/// An idempotency key scoped to the principal that sent it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ScopedKey {
    /// Who sent the request
    pub principal: PrincipalId,
    /// The client-supplied key
    pub key: IdempotencyKey,
}

impl ScopedKey {
    /// Scopes `key` to `principal`.
    pub const fn new(principal: PrincipalId, key: IdempotencyKey) -> Self {
        Self { principal, key }
    }
}

impl fmt::Display for ScopedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.principal, self.key)
    }
}

/// Where a keyed request stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdempotencyStatus {
    /// A handler is working on it.
    InProgress,
    /// Finished successfully; the response is stored.
    Completed,
    /// Finished with a final failure; the error is stored.
    Failed,
}

/// A finished request's result, as stored and replayed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "snapshot", rename_all = "snake_case")]
pub enum Outcome {
    /// The successful response
    Completed(Value),
    /// The final error
    Failed(Value),
}

impl Outcome {
    /// Snapshots a result.
    pub fn capture<T, E>(result: &Result<T, E>) -> Result<Self, GuardError>
    where
        T: Serialize,
        E: Serialize,
    {
        match result {
            Ok(value) => serde_json::to_value(value).map(Self::Completed),
            Err(error) => serde_json::to_value(error).map(Self::Failed),
        }
        .map_err(|error| GuardError::Snapshot(error.to_string()))
    }

    /// Rebuilds the result a snapshot was taken from.
    pub fn restore<T, E>(self) -> Result<Result<T, E>, GuardError>
    where
        T: for<'de> Deserialize<'de>,
        E: for<'de> Deserialize<'de>,
    {
        match self {
            Self::Completed(value) => serde_json::from_value(value).map(Ok),
            Self::Failed(value) => serde_json::from_value(value).map(Err),
        }
        .map_err(|error| GuardError::Snapshot(error.to_string()))
    }

    const fn status(&self) -> IdempotencyStatus {
        match self {
            Self::Completed(_) => IdempotencyStatus::Completed,
            Self::Failed(_) => IdempotencyStatus::Failed,
        }
    }
}

/// The stored state of one idempotency key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    /// Scoped key
    pub key: ScopedKey,
    /// Current status
    pub status: IdempotencyStatus,
    /// Canonical form of the request the key was first used with
    pub fingerprint: String,
    /// The stored result once finished
    pub outcome: Option<Outcome>,
    /// How many handlers have taken the key, including takeovers
    pub attempt: u32,
    /// First sighting
    pub created_at: Timestamp,
    /// Last status change or takeover
    pub updated_at: Timestamp,
    /// When the record may be purged
    pub expires_at: Timestamp,
    /// Store-assigned version
    pub version: Version,
}

impl IdempotencyRecord {
    fn in_progress(key: ScopedKey, fingerprint: String, now: Timestamp, ttl: Duration) -> Self {
        Self {
            key,
            status: IdempotencyStatus::InProgress,
            fingerprint,
            outcome: None,
            attempt: 1,
            created_at: now,
            updated_at: now,
            expires_at: now.saturating_add(ttl),
            version: Version::initial(),
        }
    }

    /// Whether the TTL lapsed.
    pub fn is_expired_at(&self, now: Timestamp) -> bool {
        self.expires_at <= now
    }
}

/// Proof that the caller owns the current attempt for a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ticket {
    key: ScopedKey,
    version: Version,
}

impl Ticket {
    /// The key this ticket is for.
    pub const fn key(&self) -> &ScopedKey {
        &self.key
    }

    /// The record version this attempt owns.
    pub const fn version(&self) -> Version {
        self.version
    }
}

/// What `begin` decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Begin {
    /// First sight (or takeover): run the operation, then `finish` or `abandon`.
    Proceed(Ticket),
    /// Already finished: return this outcome without re-running anything.
    Replay(Outcome),
    /// Another handler is working on it right now.
    Conflict,
}

/// At-most-once execution per scoped idempotency key.
#[derive(Debug, Clone)]
pub struct IdempotencyGuard<S> {
    store: S,
    ttl: Duration,
    in_progress_grace: Duration,
}

impl<S> IdempotencyGuard<S>
where
    S: IdempotencyStore,
{
    /// Creates a guard over `store`.
    pub fn new(store: S, config: IdempotencyConfig) -> Self {
        Self {
            store,
            ttl: config.ttl.as_duration(),
            in_progress_grace: config.in_progress_grace.as_duration(),
        }
    }

    /// Claims `key` for a request with the given canonical `fingerprint`.
    ///
    /// Reusing a key with a different fingerprint is an error regardless of
    /// the record's status.
    #[instrument(skip(self, fingerprint), fields(key = %key))]
    pub async fn begin(&self, key: &ScopedKey, fingerprint: &str) -> Result<Begin, GuardError> {
        let now = Timestamp::now();
        let fresh =
            IdempotencyRecord::in_progress(key.clone(), fingerprint.to_string(), now, self.ttl);

        let Some(existing) = self.store.insert_if_absent(fresh).await? else {
            debug!("first sight of key");
            return Ok(Begin::Proceed(Ticket {
                key: key.clone(),
                version: Version::initial(),
            }));
        };

        if existing.is_expired_at(now) {
            debug!("previous record expired, starting over");
            let fresh = IdempotencyRecord::in_progress(
                key.clone(),
                fingerprint.to_string(),
                now,
                self.ttl,
            );
            return self.take_over(existing.version, fresh).await;
        }

        if existing.fingerprint != fingerprint {
            warn!("idempotency key reused with a different request");
            return Err(GuardError::KeyReuse {
                key: key.to_string(),
            });
        }

        match (existing.status, existing.outcome.clone()) {
            (IdempotencyStatus::InProgress, _) => {
                let stale_after = existing.updated_at.saturating_add(self.in_progress_grace);
                if stale_after <= now {
                    warn!(
                        attempt = existing.attempt,
                        "reclaiming abandoned in-progress record"
                    );
                    let reclaimed = IdempotencyRecord {
                        attempt: existing.attempt.saturating_add(1),
                        updated_at: now,
                        ..existing.clone()
                    };
                    return self.take_over(existing.version, reclaimed).await;
                }
                debug!("request already in progress");
                Ok(Begin::Conflict)
            }
            (_, Some(outcome)) => {
                debug!(status = ?existing.status, "replaying stored outcome");
                Ok(Begin::Replay(outcome))
            }
            (_, None) => Err(GuardError::Store(StoreError::Internal(format!(
                "finished idempotency record '{key}' has no outcome"
            )))),
        }
    }

    async fn take_over(
        &self,
        expected: Version,
        record: IdempotencyRecord,
    ) -> Result<Begin, GuardError> {
        let key = record.key.clone();
        match self.store.replace(record, expected).await {
            Ok(()) => Ok(Begin::Proceed(Ticket {
                key,
                version: expected.next(),
            })),
            // Someone else took it over first.
            Err(error) if error.is_conflict() => Ok(Begin::Conflict),
            Err(error) => Err(error.into()),
        }
    }

    /// Stores the final outcome of the attempt `ticket` stands for.
    #[instrument(skip(self, ticket, outcome), fields(key = %ticket.key))]
    pub async fn finish(&self, ticket: &Ticket, outcome: Outcome) -> Result<(), GuardError> {
        let current = self
            .store
            .get(&ticket.key)
            .await?
            .filter(|record| record.version == ticket.version)
            .ok_or_else(|| GuardError::Superseded {
                key: ticket.key.to_string(),
            })?;

        let status = outcome.status();
        let finished = IdempotencyRecord {
            status,
            outcome: Some(outcome),
            updated_at: Timestamp::now(),
            ..current
        };
        match self.store.replace(finished, ticket.version).await {
            Ok(()) => {
                info!(?status, "idempotency record finished");
                Ok(())
            }
            Err(error) if error.is_conflict() => Err(GuardError::Superseded {
                key: ticket.key.to_string(),
            }),
            Err(error) => Err(error.into()),
        }
    }

    /// Forgets the attempt so the client may retry with the same key.
    ///
    /// Used when the operation failed without side effects and the failure is
    /// worth retrying. A record already taken over is left alone.
    #[instrument(skip(self, ticket), fields(key = %ticket.key))]
    pub async fn abandon(&self, ticket: &Ticket) -> Result<(), GuardError> {
        match self.store.remove(&ticket.key, ticket.version).await {
            Ok(()) => {
                debug!("idempotency record abandoned");
                Ok(())
            }
            Err(error) if error.is_conflict() => Err(GuardError::Superseded {
                key: ticket.key.to_string(),
            }),
            Err(error) => Err(error.into()),
        }
    }

    /// Reads the record for a key.
    pub async fn record(&self, key: &ScopedKey) -> Result<Option<IdempotencyRecord>, GuardError> {
        Ok(self.store.get(key).await?)
    }

    /// Deletes records past their TTL. Returns how many were removed.
    #[instrument(skip(self))]
    pub async fn purge_expired(&self) -> Result<usize, GuardError> {
        let purged = self.store.purge_expired(Timestamp::now()).await?;
        if purged > 0 {
            info!(purged, "purged expired idempotency records");
        }
        Ok(purged)
    }
}
