//! Fission pipeline (write path)
//!
//! Validate → classify → encode → place → log. PoA and classification
//! failures abort with no side effects; placement is at-least-once against
//! idempotent stores; the ledger record always reflects the achieved
//! replica counts.

use crate::atoms;
use crate::ledger::{LedgerAppend, RecordBody, ShardCreateBody, ShardRef, ShardRemoveBody};
use crate::overlay::PeerOverlay;
use crate::pipeline::{retry_with_backoff, PipelineError};
use crate::placement::PlacementOracle;
use crate::shard::{Shard, ShardEncoder, ShardMetadataRecord};
use crate::storage::StorageManager;
use crate::tokens::{SealedEnvelope, TokenValidate};
use crate::types::{derive_address, Address, AtomicMetadata, NodeId, ShardId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Input to one fission call: exactly one payload source plus the PoA.
#[derive(Debug, Clone)]
pub struct FissionRequest {
    pub payload: Option<Vec<u8>>,
    pub file_path: Option<PathBuf>,
    pub token_id: String,
    pub envelope: SealedEnvelope,
}

impl FissionRequest {
    pub fn from_bytes(payload: Vec<u8>, token_id: String, envelope: SealedEnvelope) -> Self {
        Self {
            payload: Some(payload),
            file_path: None,
            token_id,
            envelope,
        }
    }

    fn resolve_payload(&self) -> Result<Vec<u8>, PipelineError> {
        match (&self.payload, &self.file_path) {
            (Some(bytes), None) => {
                if bytes.is_empty() {
                    return Err(PipelineError::InvalidInput("payload is empty".into()));
                }
                Ok(bytes.clone())
            }
            (None, Some(path)) => {
                let bytes = std::fs::read(path).map_err(|e| {
                    PipelineError::InvalidInput(format!("cannot read {}: {e}", path.display()))
                })?;
                if bytes.is_empty() {
                    return Err(PipelineError::InvalidInput("payload file is empty".into()));
                }
                Ok(bytes)
            }
            _ => Err(PipelineError::InvalidInput(
                "exactly one of raw bytes or file path must be given".into(),
            )),
        }
    }
}

/// Result of a completed fission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FissionOutcome {
    pub address: Address,
    pub shard_ids: Vec<ShardId>,
    pub placement: HashMap<ShardId, Vec<NodeId>>,
    pub achieved_redundancy: u32,
    pub required_redundancy: u32,
}

/// Tuning knobs for the write path.
#[derive(Debug, Clone)]
pub struct FissionConfig {
    pub node_id: NodeId,
    pub max_inflight_shards: usize,
    pub retry_attempts: u32,
    pub retry_backoff: Duration,
    pub token_timeout: Duration,
}

impl FissionConfig {
    pub fn from_node_config(config: &crate::config::NodeConfig) -> Self {
        Self {
            node_id: config.node_id.clone(),
            max_inflight_shards: config.max_inflight_shards,
            retry_attempts: config.retry_max_attempts,
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
            token_timeout: Duration::from_millis(config.token_validate_timeout_ms),
        }
    }
}

pub struct FissionPipeline {
    config: FissionConfig,
    tokens: Arc<dyn TokenValidate>,
    encoder: Arc<ShardEncoder>,
    oracle: Arc<dyn PlacementOracle>,
    storage: Arc<StorageManager>,
    ledger: Arc<dyn LedgerAppend>,
    overlay: Option<Arc<PeerOverlay>>,
}

impl FissionPipeline {
    pub fn new(
        config: FissionConfig,
        tokens: Arc<dyn TokenValidate>,
        encoder: Arc<ShardEncoder>,
        oracle: Arc<dyn PlacementOracle>,
        storage: Arc<StorageManager>,
        ledger: Arc<dyn LedgerAppend>,
        overlay: Option<Arc<PeerOverlay>>,
    ) -> Self {
        Self {
            config,
            tokens,
            encoder,
            oracle,
            storage,
            ledger,
            overlay,
        }
    }

    /// Run the full write path. `cancel` flipping to `true` before the
    /// ledger append rolls back locally placed shards.
    pub async fn run(
        &self,
        request: FissionRequest,
        cancel: &watch::Receiver<bool>,
    ) -> Result<FissionOutcome, PipelineError> {
        // 1. Input validation
        let payload = request.resolve_payload()?;

        // 2. PoA validation; fail fast with no side effects
        let validation = tokio::time::timeout(
            self.config.token_timeout,
            self.tokens.validate(&request.token_id, &request.envelope),
        )
        .await
        .map_err(|_| PipelineError::Timeout("token validation".into()))??;
        debug!(owner = %validation.owner_node_id, "poa accepted");

        // 3-4. Classify and derive shards
        let payload_digest = atomvault_pqc::sha256(&payload);
        let address = derive_address(self.encoder.signing_public_key(), &payload_digest);
        let hierarchy = atoms::classify(&address, &payload)?;

        let canonical: Vec<atoms::BitAtom> = hierarchy.canonical_bits().cloned().collect();
        let mut placed: Vec<PlacedShard> = Vec::with_capacity(canonical.len());

        // 5-6. Place shards, bounded by max_inflight_shards per batch
        for batch in canonical.chunks(self.config.max_inflight_shards) {
            if *cancel.borrow() {
                self.rollback(&placed).await;
                return Err(PipelineError::Cancelled);
            }
            for atom in batch {
                let shard = self.encoder.encode(atom, &address).await?;
                let placed_shard = self.place(shard, &request.token_id).await?;
                placed.push(placed_shard);
            }
        }

        if *cancel.borrow() {
            self.rollback(&placed).await;
            return Err(PipelineError::Cancelled);
        }

        // 7. Ledger record with the achieved placement
        let mut atomic = AtomicMetadata::default();
        let mut shard_refs = Vec::with_capacity(placed.len());
        let mut placement = HashMap::new();
        let mut shard_ids = Vec::with_capacity(placed.len());
        let mut achieved_min = u32::MAX;
        let mut required_max = 0u32;
        for item in &placed {
            atomic.add_particle(item.shard.kind, item.achieved);
            shard_refs.push(ShardRef::from_metadata(
                &item.metadata,
                item.shard.frequency,
                item.required,
            ));
            placement.insert(item.shard.shard_id.clone(), item.metadata.placement.clone());
            shard_ids.push(item.shard.shard_id.clone());
            achieved_min = achieved_min.min(item.achieved);
            required_max = required_max.max(item.required);
        }

        let body = RecordBody::ShardCreate(ShardCreateBody {
            address: address.clone(),
            token_id: request.token_id.clone(),
            payload_digest: hex::encode(payload_digest),
            shards: shard_refs,
            atomic,
        });

        if let Err(e) = self.ledger.append_blocking(body).await {
            // Compensate asynchronously; the operation is not successful
            let ledger = Arc::clone(&self.ledger);
            let compensation_address = address.clone();
            let ids = shard_ids.clone();
            tokio::spawn(async move {
                let body = RecordBody::ShardRemove(ShardRemoveBody {
                    address: compensation_address.clone(),
                    shard_ids: ids,
                    reason: "shard_create append failed".into(),
                });
                if let Err(e) = ledger.append_blocking(body).await {
                    warn!(address = %compensation_address, error = %e, "compensating record failed");
                }
            });
            return Err(e.into());
        }

        let outcome = FissionOutcome {
            address: address.clone(),
            shard_ids,
            placement,
            achieved_redundancy: if achieved_min == u32::MAX { 0 } else { achieved_min },
            required_redundancy: required_max,
        };

        // Degraded success surfaces as under-replication; the record above
        // already carries the achieved counts for the audit loop
        if let Some(short) = placed.iter().find(|p| p.achieved < p.required) {
            warn!(
                address = %address,
                achieved = short.achieved,
                required = short.required,
                "fission under-replicated"
            );
            return Err(PipelineError::UnderReplicated {
                achieved: short.achieved,
                required: short.required,
                outcome: Box::new(outcome),
            });
        }

        info!(address = %address, shards = outcome.shard_ids.len(), "fission complete");
        Ok(outcome)
    }

    /// Place one shard on every target the oracle returns. Local stores are
    /// idempotent; remote placements retry with backoff.
    async fn place(&self, shard: Shard, token_id: &str) -> Result<PlacedShard, PipelineError> {
        let required = shard.kind.redundancy_floor();
        let targets = self
            .oracle
            .plan(shard.kind, &shard.shard_id, required)
            .await;

        let bounce = self.encoder.bounce_entry(&shard, token_id);
        let custom = serde_json::to_value(&bounce)
            .map_err(|e| PipelineError::Internal(e.to_string()))?;

        let mut achieved_on: Vec<NodeId> = Vec::new();
        for target in &targets {
            if *target == self.config.node_id {
                match self.storage.store(&shard, custom.clone()).await {
                    Ok(()) => achieved_on.push(target.clone()),
                    Err(crate::storage::StorageError::DuplicateShard(_)) => {
                        achieved_on.push(target.clone())
                    }
                    Err(e) => return Err(e.into()),
                }
                continue;
            }

            let Some(overlay) = &self.overlay else {
                continue;
            };
            let metadata =
                ShardMetadataRecord::from_shard(&shard, token_id, targets.clone());
            let shard_clone = shard.clone();
            let result = retry_with_backoff(
                self.config.retry_attempts,
                self.config.retry_backoff,
                || {
                    let overlay = Arc::clone(overlay);
                    let shard = shard_clone.clone();
                    let metadata = metadata.clone();
                    let target = target.clone();
                    async move { overlay.place_shard(&target, shard, metadata).await }
                },
            )
            .await;
            match result {
                Ok(_stored) => achieved_on.push(target.clone()),
                Err(e) => {
                    warn!(target = %target, shard_id = %shard.shard_id, error = %e, "replica placement failed");
                }
            }
        }

        let metadata = ShardMetadataRecord::from_shard(&shard, token_id, achieved_on.clone());
        Ok(PlacedShard {
            achieved: achieved_on.len() as u32,
            required,
            metadata,
            shard,
        })
    }

    /// Remove locally placed shards after cancellation.
    async fn rollback(&self, placed: &[PlacedShard]) {
        for item in placed {
            if let Err(e) = self.storage.remove(item.shard.kind, &item.shard.shard_id).await {
                warn!(shard_id = %item.shard.shard_id, error = %e, "rollback remove failed");
            }
        }
    }
}

struct PlacedShard {
    shard: Shard,
    metadata: ShardMetadataRecord,
    achieved: u32,
    required: u32,
}
