//! Fission and fusion pipelines
//!
//! The write path decomposes a payload into encrypted bit-level shards,
//! places replicas and logs the operation; the read path re-validates
//! access, gathers shards and reconstitutes the original bytes.

pub mod fission;
pub mod fusion;

use crate::atoms::AtomError;
use crate::ledger::LedgerError;
use crate::overlay::OverlayError;
use crate::shard::ShardError;
use crate::storage::StorageError;
use crate::tokens::TokenError;
use std::future::Future;
use std::time::Duration;

pub use fission::{FissionOutcome, FissionPipeline, FissionRequest};
pub use fusion::{FusionOutcome, FusionPipeline};

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Unauthorized: {0}")]
    Unauthorized(#[from] TokenError),
    #[error("Classification failed: {0}")]
    Classification(#[from] AtomError),
    #[error("Under-replicated: achieved {achieved} of {required}")]
    UnderReplicated {
        achieved: u32,
        required: u32,
        outcome: Box<FissionOutcome>,
    },
    #[error("Reconstruction failed: {0}")]
    ReconstructionFailed(String),
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Operation cancelled")]
    Cancelled,
    #[error("Deadline exceeded: {0}")]
    Timeout(String),
    #[error(transparent)]
    Shard(#[from] ShardError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Overlay(#[from] OverlayError),
    #[error("Internal pipeline failure: {0}")]
    Internal(String),
}

/// Retry an operation with bounded linear backoff. The attempt itself stays
/// a single call; all retry policy lives here.
pub async fn retry_with_backoff<T, E, F, Fut>(
    attempts: u32,
    backoff: Duration,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut last_err = None;
    for attempt in 0..attempts.max(1) {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                last_err = Some(e);
                if attempt + 1 < attempts {
                    tokio::time::sleep(backoff * (attempt + 1)).await;
                }
            }
        }
    }
    Err(last_err.expect("at least one attempt"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_retry_succeeds_after_failures() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, &str> =
            retry_with_backoff(3, Duration::from_millis(1), || async {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err("not yet")
                } else {
                    Ok(n)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_exhausts() {
        let result: Result<(), &str> =
            retry_with_backoff(2, Duration::from_millis(1), || async { Err("down") }).await;
        assert_eq!(result.unwrap_err(), "down");
    }
}
