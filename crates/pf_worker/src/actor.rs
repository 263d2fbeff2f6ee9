//! Actor contract (C7): each background actor declares its own
//! retry budget, backoff window, wall-clock timeout, and which error kinds
//! bypass retry entirely.

use std::time::Duration;

use async_trait::async_trait;
use pf_core::PipelineError;
use serde_json::Value;

#[async_trait]
pub trait Actor: Send + Sync {
    fn name(&self) -> &'static str;

    fn max_retries(&self) -> u32 {
        5
    }
    fn min_backoff(&self) -> Duration {
        Duration::from_secs(1)
    }
    fn max_backoff(&self) -> Duration {
        Duration::from_secs(60)
    }
    /// Per-job wall-clock cap; exceeding it is a non-`throws` failure that
    /// re-enters the retry pipeline (cancellation and timeouts).
    fn timeout(&self) -> Duration {
        Duration::from_secs(600)
    }

    /// `throws`: error kinds that mark the task permanently failed instead
    /// of being redelivered. Defaults to `PipelineError::is_permanent`.
    fn is_permanent(&self, error: &PipelineError) -> bool {
        error.is_permanent()
    }

    async fn run(&self, payload: Value) -> Result<(), PipelineError>;
}
