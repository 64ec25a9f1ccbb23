//! Configuration with type-safe validation.
//!
//! The conflict-retry bound, lock lease and timeout, and idempotency TTLs are
//! policy constants that trade latency against contention tolerance. Each is a
//! validated `nutype`, so an out-of-range value cannot be constructed.

use std::time::Duration;

use nutype::nutype;
use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;
use crate::retry::BackoffPolicy;

/// How long a lock lease lasts before it expires on its own, in milliseconds.
///
/// Validated to be between 10ms and 10 minutes.
#[nutype(
    validate(greater_or_equal = 10, less_or_equal = 600_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Into,
        Serialize,
        Deserialize
    )
)]
pub struct LockLeaseMs(u64);

impl LockLeaseMs {
    /// Convert to Duration.
    pub fn as_duration(self) -> Duration {
        Duration::from_millis(self.into())
    }
}

/// How long a caller waits to acquire all of its locks, in milliseconds.
///
/// Validated to be between 0 (try once) and 5 minutes.
#[nutype(
    validate(less_or_equal = 300_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Into,
        Serialize,
        Deserialize
    )
)]
pub struct LockTimeoutMs(u64);

impl LockTimeoutMs {
    /// Convert to Duration.
    pub fn as_duration(self) -> Duration {
        Duration::from_millis(self.into())
    }
}

/// Maximum number of retries after an optimistic version conflict.
///
/// Validated to be between 0 and 100.
#[nutype(
    validate(less_or_equal = 100),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Into,
        Serialize,
        Deserialize
    )
)]
pub struct MaxConflictRetries(u32);

/// Base delay between retries in milliseconds.
///
/// Validated to be at most 10 seconds.
#[nutype(
    validate(less_or_equal = 10_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Into,
        Serialize,
        Deserialize
    )
)]
pub struct RetryBaseDelayMs(u64);

impl RetryBaseDelayMs {
    /// Convert to Duration.
    pub fn as_duration(self) -> Duration {
        Duration::from_millis(self.into())
    }
}

/// Cap on a single retry delay in milliseconds.
///
/// Validated to be at most 60 seconds.
#[nutype(
    validate(less_or_equal = 60_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Into,
        Serialize,
        Deserialize
    )
)]
pub struct RetryMaxDelayMs(u64);

impl RetryMaxDelayMs {
    /// Convert to Duration.
    pub fn as_duration(self) -> Duration {
        Duration::from_millis(self.into())
    }
}

/// Exponential backoff multiplier.
///
/// Validated to be between 1.0 and 4.0.
#[nutype(
    validate(greater_or_equal = 1.0, less_or_equal = 4.0),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        PartialOrd,
        Into,
        Serialize,
        Deserialize
    )
)]
pub struct BackoffMultiplier(f64);

/// How long an idempotency record is kept, in seconds.
///
/// Validated to be between 1 second and 7 days.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 604_800),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Into,
        Serialize,
        Deserialize
    )
)]
pub struct IdempotencyTtlSecs(u64);

impl IdempotencyTtlSecs {
    /// Convert to Duration.
    pub fn as_duration(self) -> Duration {
        Duration::from_secs(self.into())
    }
}

/// How long an `in_progress` idempotency record may sit untouched before it
/// is treated as abandoned, in milliseconds.
///
/// Validated to be between 10ms and 1 hour.
#[nutype(
    validate(greater_or_equal = 10, less_or_equal = 3_600_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Into,
        Serialize,
        Deserialize
    )
)]
pub struct InProgressGraceMs(u64);

impl InProgressGraceMs {
    /// Convert to Duration.
    pub fn as_duration(self) -> Duration {
        Duration::from_millis(self.into())
    }
}

/// How long a reservation may stay unpaid before it expires, in milliseconds.
///
/// Validated to be between 10ms and 7 days.
#[nutype(
    validate(greater_or_equal = 10, less_or_equal = 604_800_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Into,
        Serialize,
        Deserialize
    )
)]
pub struct ReservationTtlMs(u64);

impl ReservationTtlMs {
    /// Convert to Duration.
    pub fn as_duration(self) -> Duration {
        Duration::from_millis(self.into())
    }
}

/// Backoff settings in validated form.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Delay before the first retry
    pub base_delay: RetryBaseDelayMs,
    /// Cap on a single delay
    pub max_delay: RetryMaxDelayMs,
    /// Growth factor
    pub multiplier: BackoffMultiplier,
    /// Whether to randomize delays
    pub jitter: bool,
}

impl BackoffConfig {
    /// Safe defaults: 10ms doubling up to 500ms, jittered.
    pub fn new() -> Result<Self, Box<dyn std::error::Error>> {
        Ok(Self {
            base_delay: RetryBaseDelayMs::try_new(10)?,
            max_delay: RetryMaxDelayMs::try_new(500)?,
            multiplier: BackoffMultiplier::try_new(2.0)?,
            jitter: true,
        })
    }

    /// Short, tight delays for tests and single-node use.
    pub fn fast() -> Result<Self, Box<dyn std::error::Error>> {
        Ok(Self {
            base_delay: RetryBaseDelayMs::try_new(1)?,
            max_delay: RetryMaxDelayMs::try_new(20)?,
            multiplier: BackoffMultiplier::try_new(2.0)?,
            jitter: true,
        })
    }

    /// The runtime policy.
    pub fn policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            base_delay: self.base_delay.as_duration(),
            max_delay: self.max_delay.as_duration(),
            multiplier: self.multiplier.into(),
            jitter: self.jitter,
        }
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::new().expect("Default backoff configuration should always be valid")
    }
}

/// What lock acquisition does when a key is validly held by someone else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcquireMode {
    /// Back off and retry until the acquire timeout.
    #[default]
    Wait,
    /// Give up immediately.
    FailFast,
}

/// Resource lock manager settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LockConfig {
    /// Upper bound on waiting for all locks
    pub acquire_timeout: LockTimeoutMs,
    /// Lease length; protects against crashed holders
    pub lease: LockLeaseMs,
    /// Behaviour on a held key
    pub mode: AcquireMode,
    /// Delays between acquisition attempts
    pub backoff: BackoffConfig,
}

impl LockConfig {
    /// Safe defaults: wait up to 2s for locks leased for 10s.
    pub fn new() -> Result<Self, Box<dyn std::error::Error>> {
        Ok(Self {
            acquire_timeout: LockTimeoutMs::try_new(2_000)?,
            lease: LockLeaseMs::try_new(10_000)?,
            mode: AcquireMode::Wait,
            backoff: BackoffConfig::new()?,
        })
    }

    /// Set the acquire timeout.
    #[must_use]
    pub const fn with_acquire_timeout(mut self, timeout: LockTimeoutMs) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Set the lease length.
    #[must_use]
    pub const fn with_lease(mut self, lease: LockLeaseMs) -> Self {
        self.lease = lease;
        self
    }

    /// Set the acquisition mode.
    #[must_use]
    pub const fn with_mode(mut self, mode: AcquireMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the backoff between attempts.
    #[must_use]
    pub const fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self::new().expect("Default lock configuration should always be valid")
    }
}

/// Optimistic version controller settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConflictRetryConfig {
    /// Retries after the first attempt
    pub max_retries: MaxConflictRetries,
    /// Delays between attempts
    pub backoff: BackoffConfig,
}

impl ConflictRetryConfig {
    /// Safe defaults: up to 8 retries.
    pub fn new() -> Result<Self, Box<dyn std::error::Error>> {
        Ok(Self {
            max_retries: MaxConflictRetries::try_new(8)?,
            backoff: BackoffConfig::new()?,
        })
    }

    /// Set the retry bound.
    #[must_use]
    pub const fn with_max_retries(mut self, max_retries: MaxConflictRetries) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the backoff between attempts.
    #[must_use]
    pub const fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }
}

impl Default for ConflictRetryConfig {
    fn default() -> Self {
        Self::new().expect("Default conflict retry configuration should always be valid")
    }
}

/// Idempotency guard settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyConfig {
    /// How long records are kept
    pub ttl: IdempotencyTtlSecs,
    /// When an `in_progress` record counts as abandoned. Must outlast a
    /// placement's lock wait plus one lease, see [`CoordinatorConfig::validate`]
    pub in_progress_grace: InProgressGraceMs,
}

impl IdempotencyConfig {
    /// Safe defaults: 24h retention, 60s grace.
    pub fn new() -> Result<Self, Box<dyn std::error::Error>> {
        Ok(Self {
            ttl: IdempotencyTtlSecs::try_new(86_400)?,
            in_progress_grace: InProgressGraceMs::try_new(60_000)?,
        })
    }

    /// Set the retention.
    #[must_use]
    pub const fn with_ttl(mut self, ttl: IdempotencyTtlSecs) -> Self {
        self.ttl = ttl;
        self
    }

    /// Set the abandonment grace period.
    #[must_use]
    pub const fn with_in_progress_grace(mut self, grace: InProgressGraceMs) -> Self {
        self.in_progress_grace = grace;
        self
    }
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self::new().expect("Default idempotency configuration should always be valid")
    }
}

/// Everything the order coordinator needs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Lock manager settings
    pub locks: LockConfig,
    /// Version controller settings
    pub retries: ConflictRetryConfig,
    /// Idempotency guard settings
    pub idempotency: IdempotencyConfig,
    /// Unpaid reservation lifetime
    pub reservation_ttl: ReservationTtlMs,
}

impl CoordinatorConfig {
    /// Safe production defaults; reservations last 15 minutes.
    pub fn new() -> Result<Self, Box<dyn std::error::Error>> {
        let config = Self {
            locks: LockConfig::new()?,
            retries: ConflictRetryConfig::new()?,
            idempotency: IdempotencyConfig::new()?,
            reservation_ttl: ReservationTtlMs::try_new(900_000)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Short timeouts and tight backoff for tests.
    pub fn fast() -> Result<Self, Box<dyn std::error::Error>> {
        let config = Self {
            locks: LockConfig::new()?
                .with_acquire_timeout(LockTimeoutMs::try_new(5_000)?)
                .with_lease(LockLeaseMs::try_new(5_000)?)
                .with_backoff(BackoffConfig::fast()?),
            retries: ConflictRetryConfig::new()?
                .with_max_retries(MaxConflictRetries::try_new(20)?)
                .with_backoff(BackoffConfig::fast()?),
            idempotency: IdempotencyConfig::new()?,
            reservation_ttl: ReservationTtlMs::try_new(900_000)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks the settings against each other.
    ///
    /// A placement holds its idempotency key in progress for up to the lock
    /// acquire timeout plus one lease. The in-progress grace must be longer,
    /// or a duplicate request can reclaim the key of a placement that is
    /// still running and both execute.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let minimum = self
            .locks
            .acquire_timeout
            .as_duration()
            .saturating_add(self.locks.lease.as_duration());
        let grace = self.idempotency.in_progress_grace.as_duration();
        if grace <= minimum {
            return Err(ConfigError::GraceTooShort { grace, minimum });
        }
        Ok(())
    }

    /// Set the lock settings.
    #[must_use]
    pub const fn with_locks(mut self, locks: LockConfig) -> Self {
        self.locks = locks;
        self
    }

    /// Set the retry settings.
    #[must_use]
    pub const fn with_retries(mut self, retries: ConflictRetryConfig) -> Self {
        self.retries = retries;
        self
    }

    /// Set the idempotency settings.
    #[must_use]
    pub const fn with_idempotency(mut self, idempotency: IdempotencyConfig) -> Self {
        self.idempotency = idempotency;
        self
    }

    /// Set the reservation lifetime.
    #[must_use]
    pub const fn with_reservation_ttl(mut self, ttl: ReservationTtlMs) -> Self {
        self.reservation_ttl = ttl;
        self
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self::new().expect("Default coordinator configuration should always be valid")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_validation() {
        assert!(LockLeaseMs::try_new(5).is_err());
        assert!(LockLeaseMs::try_new(10).is_ok());
        assert!(LockLeaseMs::try_new(600_001).is_err());
    }

    #[test]
    fn retry_bound_validation() {
        assert!(MaxConflictRetries::try_new(0).is_ok());
        assert!(MaxConflictRetries::try_new(101).is_err());
        assert!(BackoffMultiplier::try_new(0.5).is_err());
    }

    #[test]
    fn defaults_are_valid() {
        let config = CoordinatorConfig::default();
        assert_eq!(config.locks.mode, AcquireMode::Wait);
        assert_eq!(
            config.idempotency.ttl.as_duration(),
            Duration::from_secs(86_400)
        );
        assert_eq!(
            config.reservation_ttl.as_duration(),
            Duration::from_secs(900)
        );
    }

    #[test]
    fn grace_must_outlast_lock_wait_and_lease() {
        let config = CoordinatorConfig::default();
        assert_eq!(config.validate(), Ok(()));

        let short = config.with_idempotency(IdempotencyConfig {
            ttl: config.idempotency.ttl,
            in_progress_grace: InProgressGraceMs::try_new(10).unwrap(),
        });
        assert_eq!(
            short.validate(),
            Err(ConfigError::GraceTooShort {
                grace: Duration::from_millis(10),
                minimum: Duration::from_secs(12),
            })
        );

        // A grace equal to the bound still races the last moment of the lease.
        let exact = config.with_idempotency(IdempotencyConfig {
            ttl: config.idempotency.ttl,
            in_progress_grace: InProgressGraceMs::try_new(12_000).unwrap(),
        });
        assert!(exact.validate().is_err());
    }

    #[test]
    fn fast_preset_tightens_backoff() {
        let config = CoordinatorConfig::fast().unwrap();
        assert_eq!(
            config.retries.backoff.policy().base_delay,
            Duration::from_millis(1)
        );
        let retries: u32 = config.retries.max_retries.into();
        assert_eq!(retries, 20);
    }

    #[test]
    fn config_serializes_to_json() {
        let config = CoordinatorConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: CoordinatorConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
