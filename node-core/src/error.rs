//! Engine-level error taxonomy
//!
//! Module errors stay close to their subsystems; this is the surface callers
//! and the CLI see. Mapping follows the propagation policy: unauthorized,
//! consensus-rejected and cancelled conditions surface immediately,
//! integrity triggers repair before it gets here, and anything else is
//! opaque internal context.

use crate::config::ConfigError;
use crate::ledger::LedgerError;
use crate::pipeline::PipelineError;
use crate::storage::StorageError;
use crate::tokens::TokenError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Unauthorized: {0}")]
    Unauthorized(#[source] TokenError),
    #[error("Integrity violation: {0}")]
    Integrity(String),
    #[error("Under-replicated: achieved {achieved} of {required}")]
    UnderReplicated { achieved: u32, required: u32 },
    #[error("Unavailable: {0}")]
    Unavailable(String),
    #[error("Consensus rejected: {0}")]
    ConsensusRejected(String),
    #[error("Cancelled")]
    Cancelled,
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<TokenError> for EngineError {
    fn from(e: TokenError) -> Self {
        match e {
            TokenError::Ledger(LedgerError::ConsensusRejected(reason)) => {
                EngineError::ConsensusRejected(reason)
            }
            other => EngineError::Unauthorized(other),
        }
    }
}

impl From<StorageError> for EngineError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::TamperDetected(id) => {
                EngineError::Integrity(format!("tamper detected on shard {id}"))
            }
            StorageError::AuthTagInvalid(id) => {
                EngineError::Integrity(format!("auth tag invalid on shard {id}"))
            }
            StorageError::Unrecoverable(id) => {
                EngineError::Integrity(format!("shard {id} unrecoverable"))
            }
            StorageError::Ledger(LedgerError::ConsensusRejected(reason)) => {
                EngineError::ConsensusRejected(reason)
            }
            other => EngineError::Internal(other.to_string()),
        }
    }
}

impl From<LedgerError> for EngineError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::ConsensusRejected(reason) => EngineError::ConsensusRejected(reason),
            LedgerError::HashMismatch { index } => {
                EngineError::Integrity(format!("record {index} hash mismatch"))
            }
            LedgerError::SignatureInvalid { index } => {
                EngineError::Integrity(format!("record {index} signature invalid"))
            }
            LedgerError::Cancelled => EngineError::Cancelled,
            other => EngineError::Internal(other.to_string()),
        }
    }
}

impl From<PipelineError> for EngineError {
    fn from(e: PipelineError) -> Self {
        match e {
            PipelineError::Unauthorized(inner) => inner.into(),
            PipelineError::UnderReplicated {
                achieved, required, ..
            } => EngineError::UnderReplicated { achieved, required },
            PipelineError::ReconstructionFailed(reason) => EngineError::Integrity(reason),
            PipelineError::Cancelled => EngineError::Cancelled,
            PipelineError::Timeout(what) => EngineError::Unavailable(what),
            PipelineError::Overlay(inner) => EngineError::Unavailable(inner.to_string()),
            PipelineError::Storage(inner) => inner.into(),
            PipelineError::Ledger(inner) => inner.into(),
            PipelineError::InvalidInput(reason) => EngineError::Internal(reason),
            other => EngineError::Internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consensus_rejection_maps_through_layers() {
        let err: EngineError =
            LedgerError::ConsensusRejected("voted down".into()).into();
        assert!(matches!(err, EngineError::ConsensusRejected(_)));

        let err: EngineError =
            TokenError::Ledger(LedgerError::ConsensusRejected("voted down".into())).into();
        assert!(matches!(err, EngineError::ConsensusRejected(_)));
    }

    #[test]
    fn test_tamper_maps_to_integrity() {
        let err: EngineError = StorageError::TamperDetected("s-1".into()).into();
        assert!(matches!(err, EngineError::Integrity(_)));
    }

    #[test]
    fn test_under_replication_keeps_counts() {
        let err: EngineError = PipelineError::UnderReplicated {
            achieved: 3,
            required: 5,
            outcome: Box::new(crate::pipeline::FissionOutcome {
                address: "atm1".into(),
                shard_ids: Vec::new(),
                placement: Default::default(),
                achieved_redundancy: 3,
                required_redundancy: 5,
            }),
        }
        .into();
        assert!(matches!(
            err,
            EngineError::UnderReplicated {
                achieved: 3,
                required: 5
            }
        ));
    }
}
