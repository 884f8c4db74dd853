//! Fusion pipeline (read path)
//!
//! Re-validate access, resolve the shard set from the ledger, gather and
//! verify every shard, reassemble the payload in (byte_index, bit_index)
//! order, and leave a recovery copy plus a fusion record behind.

use crate::ledger::{FusionBody, LedgerAppend, LedgerView, RecordBody, ShardRef};
use crate::pipeline::PipelineError;
use crate::storage::{RepairOutcome, StorageManager};
use crate::tokens::{SealedEnvelope, TokenValidate};
use crate::types::{Address, NodeId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Result of a completed fusion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FusionOutcome {
    pub address: Address,
    pub payload: Vec<u8>,
    pub shard_count: u64,
    pub recovery_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct FusionConfig {
    pub node_id: NodeId,
    pub recovery_dir: PathBuf,
    pub token_timeout: Duration,
    pub max_inflight_shards: usize,
}

impl FusionConfig {
    pub fn from_node_config(config: &crate::config::NodeConfig) -> Self {
        Self {
            node_id: config.node_id.clone(),
            recovery_dir: config.recovery_dir(),
            token_timeout: Duration::from_millis(config.token_validate_timeout_ms),
            max_inflight_shards: config.max_inflight_shards,
        }
    }
}

pub struct FusionPipeline {
    config: FusionConfig,
    tokens: Arc<dyn TokenValidate>,
    ledger_view: Arc<dyn LedgerView>,
    ledger_append: Arc<dyn LedgerAppend>,
    storage: Arc<StorageManager>,
}

impl FusionPipeline {
    pub fn new(
        config: FusionConfig,
        tokens: Arc<dyn TokenValidate>,
        ledger_view: Arc<dyn LedgerView>,
        ledger_append: Arc<dyn LedgerAppend>,
        storage: Arc<StorageManager>,
    ) -> Self {
        Self {
            config,
            tokens,
            ledger_view,
            ledger_append,
            storage,
        }
    }

    /// Run the full read path for `address`.
    pub async fn run(
        &self,
        address: &str,
        token_id: &str,
        envelope: &SealedEnvelope,
        cancel: &watch::Receiver<bool>,
    ) -> Result<FusionOutcome, PipelineError> {
        // 1. PoA validation
        tokio::time::timeout(
            self.config.token_timeout,
            self.tokens.validate(token_id, envelope),
        )
        .await
        .map_err(|_| PipelineError::Timeout("token validation".into()))??;

        // 2. Shard set from the ledger
        let records = self.ledger_view.records(address).await?;
        let create = records
            .iter()
            .rev()
            .find_map(|r| match &r.body {
                RecordBody::ShardCreate(body) => Some(body.clone()),
                _ => None,
            })
            .ok_or_else(|| {
                PipelineError::ReconstructionFailed(format!(
                    "no shard records bound to {address}"
                ))
            })?;

        // 3-4. Gather and verify every shard
        let mut bits: BTreeMap<(u64, u8), u8> = BTreeMap::new();
        for batch in create.shards.chunks(self.config.max_inflight_shards) {
            if *cancel.borrow() {
                return Err(PipelineError::Cancelled);
            }
            for shard_ref in batch {
                let bit = self.fetch_bit(shard_ref).await?;
                bits.insert((shard_ref.byte_index, shard_ref.bit_index), bit);
            }
        }

        if *cancel.borrow() {
            return Err(PipelineError::Cancelled);
        }

        // 5. Reassemble in (byte_index, bit_index) order
        let byte_count = create
            .shards
            .iter()
            .map(|s| s.byte_index + 1)
            .max()
            .unwrap_or(0) as usize;
        let mut payload = vec![0u8; byte_count];
        for byte_index in 0..byte_count as u64 {
            for bit_index in 0..8u8 {
                let bit = bits.get(&(byte_index, bit_index)).copied().ok_or_else(|| {
                    PipelineError::ReconstructionFailed(format!(
                        "missing bit {byte_index}/{bit_index}"
                    ))
                })?;
                payload[byte_index as usize] |= bit << (7 - bit_index);
            }
        }

        let digest = hex::encode(atomvault_pqc::sha256(&payload));
        if digest != create.payload_digest {
            return Err(PipelineError::ReconstructionFailed(
                "reassembled payload digest mismatch".into(),
            ));
        }

        // 6. Recovery copy, then the fusion record
        std::fs::create_dir_all(&self.config.recovery_dir)
            .map_err(|e| PipelineError::Internal(e.to_string()))?;
        let recovery_path = self
            .config
            .recovery_dir
            .join(format!("{address}_{}.bin", crate::types::now_ts()));
        std::fs::write(&recovery_path, &payload)
            .map_err(|e| PipelineError::Internal(e.to_string()))?;

        let body = RecordBody::Fusion(FusionBody {
            address: address.to_string(),
            token_id: token_id.to_string(),
            payload_digest: digest,
            shard_count: create.shards.len() as u64,
            recovered_to: recovery_path.display().to_string(),
        });
        self.ledger_append.append_blocking(body).await?;

        info!(address, bytes = payload.len(), "fusion complete");
        Ok(FusionOutcome {
            address: address.to_string(),
            shard_count: create.shards.len() as u64,
            recovery_path,
            payload,
        })
    }

    /// Retrieve one bit, verifying the stored ciphertext against the ledger
    /// record and falling back to repair on any integrity failure.
    async fn fetch_bit(&self, shard_ref: &ShardRef) -> Result<u8, PipelineError> {
        // Ledger is the source of truth for the expected ciphertext
        let ledger_ok = match self.storage.raw_parts(shard_ref.kind, &shard_ref.shard_id).await
        {
            Ok((ciphertext, _, _)) => {
                atomvault_pqc::sha256_hex(&ciphertext) == shard_ref.ciphertext_hash
            }
            Err(_) => false,
        };

        if !ledger_ok {
            debug!(shard_id = %shard_ref.shard_id, "replica unhealthy, repairing");
            match self.storage.repair(shard_ref.kind, &shard_ref.shard_id).await {
                Ok(RepairOutcome::Repaired(source)) => {
                    debug!(shard_id = %shard_ref.shard_id, %source, "replica restored");
                }
                Ok(RepairOutcome::Unrecoverable) | Err(_) => {
                    warn!(shard_id = %shard_ref.shard_id, "no healthy replica");
                    return Err(PipelineError::ReconstructionFailed(format!(
                        "shard {} unrecoverable",
                        shard_ref.shard_id
                    )));
                }
            }
        }

        let plain = self
            .storage
            .retrieve(shard_ref.kind, &shard_ref.shard_id)
            .await?;
        match plain.as_slice() {
            [bit @ 0] | [bit @ 1] => Ok(*bit),
            _ => Err(PipelineError::ReconstructionFailed(format!(
                "shard {} payload malformed",
                shard_ref.shard_id
            ))),
        }
    }
}
