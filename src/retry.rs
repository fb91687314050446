//! Bounded exponential backoff with human escalation.
//!
//! Cloud and cluster reads are eventually consistent, so every operation the
//! upgrade depends on runs through [`RetryExecutor`]. Once the attempts are
//! exhausted the operator decides at a [`Checkpoint`] whether to proceed,
//! abort, or start over.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, warn};

use crate::checkpoint::{Checkpoint, Decision, Pause};
use crate::error::{KrollError, is_fatal};

/// Default number of backoff sleeps before escalating.
pub const DEFAULT_MAX_DEPTH: u32 = 5;

/// Result of an executed operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T> {
    /// The operation succeeded.
    Completed(T),
    /// The operation never succeeded and the operator chose to proceed.
    Overridden,
}

impl<T> Outcome<T> {
    pub fn is_completed(&self) -> bool {
        matches!(self, Outcome::Completed(_))
    }

    /// The value, if the operation actually succeeded.
    pub fn completed(self) -> Option<T> {
        match self {
            Outcome::Completed(value) => Some(value),
            Outcome::Overridden => None,
        }
    }
}

/// Backoff delay before retrying after a failure at `depth`.
pub fn backoff_delay(depth: u32) -> Duration {
    Duration::from_secs(1u64 << depth.min(62))
}

/// Runs fallible operations with backoff and escalation.
#[derive(Clone)]
pub struct RetryExecutor {
    max_depth: u32,
    pause: Arc<dyn Pause>,
    checkpoint: Arc<dyn Checkpoint>,
}

impl RetryExecutor {
    pub fn new(max_depth: u32, pause: Arc<dyn Pause>, checkpoint: Arc<dyn Checkpoint>) -> Self {
        Self {
            max_depth,
            pause,
            checkpoint,
        }
    }

    /// The checkpoint used for escalation.
    pub fn checkpoint(&self) -> &dyn Checkpoint {
        self.checkpoint.as_ref()
    }

    /// Execute `op`, retrying every failure.
    pub async fn execute<T, F, Fut>(&self, label: &str, op: F) -> Result<Outcome<T>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.execute_with(label, op, |_, _| true).await
    }

    /// Execute `op`, retrying failures for which `should_retry` holds.
    ///
    /// Fatal errors return immediately. Abort surfaces as
    /// [`KrollError::Aborted`].
    pub async fn execute_with<T, F, Fut, P>(
        &self,
        label: &str,
        mut op: F,
        should_retry: P,
    ) -> Result<Outcome<T>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
        P: Fn(&anyhow::Error, u32) -> bool,
    {
        loop {
            let err = match self.attempt(label, &mut op, &should_retry).await {
                Ok(value) => return Ok(Outcome::Completed(value)),
                Err(err) => err,
            };

            if is_fatal(&err) {
                return Err(err);
            }

            warn!("{} failed: {:#}", label, err);

            match self
                .checkpoint
                .decide(&format!("{} failed: {:#}", label, err))?
            {
                Decision::Proceed => {
                    debug!("Proceeding past {}", label);
                    return Ok(Outcome::Overridden);
                }
                Decision::Abort => return Err(KrollError::Aborted.into()),
                Decision::Recheck => {
                    debug!("Rechecking {}", label);
                }
            }
        }
    }

    async fn attempt<T, F, Fut, P>(&self, label: &str, op: &mut F, should_retry: &P) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
        P: Fn(&anyhow::Error, u32) -> bool,
    {
        let mut depth = 0;
        loop {
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if is_fatal(&err) || depth >= self.max_depth || !should_retry(&err, depth) {
                return Err(err);
            }

            let delay = backoff_delay(depth);
            warn!(
                "{} | Attempt #{}/{} | Error message: \"{:#}\" | Waiting {}s",
                label,
                depth,
                self.max_depth,
                err,
                delay.as_secs()
            );
            self.pause.pause(delay).await;
            depth += 1;
        }
    }
}
