//! Serialized teardown-and-rebuild of the pool.

use crate::config::PoolTuning;
use crate::error::DbResult;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{error, info, instrument, warn};

/// The pool owner as seen by the coordinator.
#[async_trait]
pub trait Recoverable: Send + Sync {
    type Pool: Send + Sync;

    /// Removes the current pool from service, if there is one.
    fn detach(&self) -> Option<Self::Pool>;

    /// Closes a detached or failed pool and waits for it to drain.
    async fn shutdown(&self, pool: Self::Pool);

    async fn create(&self) -> DbResult<Self::Pool>;

    async fn validate(&self, pool: &Self::Pool) -> bool;

    /// Puts a validated pool into service.
    fn attach(&self, pool: Self::Pool);

    async fn warm_up(&self);
}

#[derive(Debug, Clone)]
pub struct RecoverySettings {
    pub attempts: u32,
    pub backoff: Duration,
    pub close_timeout: Duration,
    pub create_timeout: Duration,
    pub validate_timeout: Duration,
    pub warmup_timeout: Duration,
}

impl From<&PoolTuning> for RecoverySettings {
    fn from(tuning: &PoolTuning) -> Self {
        Self {
            attempts: tuning.recovery_attempts,
            backoff: tuning.recovery_backoff,
            close_timeout: tuning.recovery_close_timeout,
            create_timeout: tuning.recovery_create_timeout,
            validate_timeout: tuning.recovery_validate_timeout,
            warmup_timeout: tuning.recovery_warmup_timeout,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum RecoveryOutcome {
    Recovered { attempt: u32 },
    Failed { attempts: u32 },
}

impl RecoveryOutcome {
    pub fn is_recovered(&self) -> bool {
        matches!(self, Self::Recovered { .. })
    }
}

/// `Idle | Recovering`, stored as one atomic so readers never touch the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum RecoveryState {
    Idle = 0,
    Recovering = 1,
}

/// Resets the state to `Idle` even when the recovering future is dropped.
struct RecoveringFlag<'a>(&'a AtomicU8);

impl<'a> RecoveringFlag<'a> {
    fn raise(state: &'a AtomicU8) -> Self {
        state.store(RecoveryState::Recovering as u8, Ordering::Release);
        Self(state)
    }
}

impl Drop for RecoveringFlag<'_> {
    fn drop(&mut self) {
        self.0.store(RecoveryState::Idle as u8, Ordering::Release);
    }
}

/// Runs at most one recovery at a time.
///
/// A caller that arrives while a recovery is running waits for it and takes
/// its outcome instead of rebuilding again. The gate is only ever taken by
/// `recover`; status reads go through `state`, `runs` and `last`.
pub struct RecoveryCoordinator {
    settings: RecoverySettings,
    gate: Mutex<()>,
    state: AtomicU8,
    runs: AtomicU64,
    last: parking_lot::Mutex<Option<RecoveryOutcome>>,
}

impl RecoveryCoordinator {
    pub fn new(settings: RecoverySettings) -> Self {
        Self {
            settings,
            gate: Mutex::new(()),
            state: AtomicU8::new(RecoveryState::Idle as u8),
            runs: AtomicU64::new(0),
            last: parking_lot::Mutex::new(None),
        }
    }

    /// Non-blocking.
    pub fn is_recovering(&self) -> bool {
        self.state.load(Ordering::Acquire) == RecoveryState::Recovering as u8
    }

    /// Completed recovery runs.
    pub fn runs(&self) -> u64 {
        self.runs.load(Ordering::Acquire)
    }

    pub fn last_outcome(&self) -> Option<RecoveryOutcome> {
        *self.last.lock()
    }

    #[instrument(skip_all)]
    pub async fn recover<T: Recoverable>(&self, target: &T) -> RecoveryOutcome {
        let seen = self.runs();
        let _gate = match self.gate.try_lock() {
            Ok(gate) => gate,
            Err(_) => {
                let gate = self.gate.lock().await;
                // Only a run that finished while we waited counts as joined.
                if self.runs() != seen
                    && let Some(outcome) = self.last_outcome()
                {
                    info!(?outcome, "Joined an in-flight recovery");
                    return outcome;
                }
                gate
            }
        };

        let flag = RecoveringFlag::raise(&self.state);
        let outcome = self.run(target).await;
        *self.last.lock() = Some(outcome);
        self.runs.fetch_add(1, Ordering::AcqRel);
        drop(flag);
        outcome
    }

    async fn run<T: Recoverable>(&self, target: &T) -> RecoveryOutcome {
        let settings = &self.settings;
        warn!(attempts = settings.attempts, "Starting connection pool recovery");

        for attempt in 0..settings.attempts {
            if let Some(old) = target.detach()
                && timeout(settings.close_timeout, target.shutdown(old))
                    .await
                    .is_err()
            {
                warn!(attempt = attempt + 1, "Closing the old pool timed out; abandoning it");
            }

            if attempt > 0 {
                tokio::time::sleep(settings.backoff).await;
            }

            let pool = match timeout(settings.create_timeout, target.create()).await {
                Ok(Ok(pool)) => pool,
                Ok(Err(e)) => {
                    error!(attempt = attempt + 1, "Pool creation failed: {}", e);
                    continue;
                }
                Err(_) => {
                    error!(attempt = attempt + 1, "Pool creation timed out");
                    continue;
                }
            };

            let valid = timeout(settings.validate_timeout, target.validate(&pool))
                .await
                .unwrap_or(false);
            if !valid {
                error!(attempt = attempt + 1, "New pool failed validation");
                if timeout(settings.close_timeout, target.shutdown(pool))
                    .await
                    .is_err()
                {
                    warn!(attempt = attempt + 1, "Closing the rejected pool timed out");
                }
                continue;
            }

            target.attach(pool);
            if timeout(settings.warmup_timeout, target.warm_up())
                .await
                .is_err()
            {
                warn!("Warm-up after recovery timed out; continuing with a cold pool");
            }
            info!(attempt = attempt + 1, "Connection pool recovered");
            return RecoveryOutcome::Recovered {
                attempt: attempt + 1,
            };
        }

        error!(
            attempts = settings.attempts,
            "Connection pool recovery failed; pool left unavailable"
        );
        RecoveryOutcome::Failed {
            attempts: settings.attempts,
        }
    }
}
