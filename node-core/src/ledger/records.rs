//! Ledger record and block structures.
//!
//! Every operation kind carries its own tagged body type, so a malformed
//! body is unrepresentable at construction.

use crate::shard::ShardMetadataRecord;
use crate::types::{
    Address, AtomicMetadata, Hash, NodeId, NodeSignature, Particle, RecordKind, ShardId, Timestamp,
};
use serde::{Deserialize, Serialize};

/// Reference to one shard inside a `shard_create` body: identity, reassembly
/// coordinates and the achieved placement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardRef {
    pub shard_id: ShardId,
    pub kind: Particle,
    pub byte_index: u64,
    pub bit_index: u8,
    pub frequency: f64,
    pub ciphertext_hash: Hash,
    pub metadata_hash: Hash,
    pub placement: Vec<NodeId>,
    pub achieved: u32,
    pub required: u32,
}

impl ShardRef {
    pub fn from_metadata(meta: &ShardMetadataRecord, frequency: f64, required: u32) -> Self {
        Self {
            shard_id: meta.shard_id.clone(),
            kind: meta.kind,
            byte_index: meta.byte_index,
            bit_index: meta.bit_index,
            frequency,
            ciphertext_hash: meta.ciphertext_hash.clone(),
            metadata_hash: meta.metadata_hash.clone(),
            placement: meta.placement.clone(),
            achieved: meta.placement.len() as u32,
            required,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardCreateBody {
    pub address: Address,
    pub token_id: String,
    pub payload_digest: Hash,
    pub shards: Vec<ShardRef>,
    pub atomic: AtomicMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardMoveBody {
    pub shard_id: ShardId,
    pub kind: Particle,
    pub from: NodeId,
    pub to: NodeId,
    pub token_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardRepairBody {
    pub shard_id: ShardId,
    pub kind: Particle,
    pub node_id: NodeId,
    /// Where the healthy copy came from: `backup` or a peer node id
    pub source: String,
    pub ciphertext_hash: Hash,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardRemoveBody {
    pub address: Address,
    pub shard_ids: Vec<ShardId>,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenMintBody {
    pub token_id: String,
    pub owner_node_id: NodeId,
    pub public_key: Vec<u8>,
    /// Node whose registry ledger this mint extends
    pub registrar: NodeId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenLifecycleBody {
    pub token_id: String,
    pub owner_node_id: NodeId,
    /// Node whose registry ledger this change extends
    pub registrar: NodeId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditBody {
    pub node_id: NodeId,
    pub scanned: u64,
    pub corrupted: u64,
    pub repaired: u64,
    pub unrecoverable: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusionBody {
    pub address: Address,
    pub token_id: String,
    pub payload_digest: Hash,
    pub shard_count: u64,
    pub recovered_to: String,
}

/// Tagged record payload, one variant per operation kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RecordBody {
    ShardCreate(ShardCreateBody),
    ShardMove(ShardMoveBody),
    ShardRepair(ShardRepairBody),
    ShardRemove(ShardRemoveBody),
    TokenMint(TokenMintBody),
    TokenRedeem(TokenLifecycleBody),
    TokenRevoke(TokenLifecycleBody),
    Audit(AuditBody),
    Fusion(FusionBody),
}

impl RecordBody {
    pub fn kind(&self) -> RecordKind {
        match self {
            RecordBody::ShardCreate(_) => RecordKind::ShardCreate,
            RecordBody::ShardMove(_) => RecordKind::ShardMove,
            RecordBody::ShardRepair(_) => RecordKind::ShardRepair,
            RecordBody::ShardRemove(_) => RecordKind::ShardRemove,
            RecordBody::TokenMint(_) => RecordKind::TokenMint,
            RecordBody::TokenRedeem(_) => RecordKind::TokenRedeem,
            RecordBody::TokenRevoke(_) => RecordKind::TokenRevoke,
            RecordBody::Audit(_) => RecordKind::Audit,
            RecordBody::Fusion(_) => RecordKind::Fusion,
        }
    }

    /// Stable digest of the body used in the record hash preimage.
    pub fn digest(&self) -> Hash {
        let bytes = bincode::serialize(self).expect("record body serializes");
        atomvault_pqc::sha256_hex(&bytes)
    }

    /// The ledger address this body's record belongs to. Token and audit
    /// records extend the registry of the node that wrote them; shard
    /// records extend the data address.
    pub fn ledger_address(&self) -> Address {
        match self {
            RecordBody::ShardCreate(b) => b.address.clone(),
            RecordBody::ShardRemove(b) => b.address.clone(),
            RecordBody::Fusion(b) => b.address.clone(),
            RecordBody::ShardMove(b) => crate::ledger::audit_ledger_address(&b.from),
            RecordBody::ShardRepair(b) => crate::ledger::audit_ledger_address(&b.node_id),
            RecordBody::Audit(b) => crate::ledger::audit_ledger_address(&b.node_id),
            RecordBody::TokenMint(b) => crate::ledger::token_ledger_address(&b.registrar),
            RecordBody::TokenRedeem(b) => crate::ledger::token_ledger_address(&b.registrar),
            RecordBody::TokenRevoke(b) => crate::ledger::token_ledger_address(&b.registrar),
        }
    }

    /// Token referenced by this body, if the kind binds one.
    pub fn token_id(&self) -> Option<&str> {
        match self {
            RecordBody::ShardCreate(b) => Some(&b.token_id),
            RecordBody::ShardMove(b) => Some(&b.token_id),
            RecordBody::TokenMint(b) => Some(&b.token_id),
            RecordBody::TokenRedeem(b) => Some(&b.token_id),
            RecordBody::TokenRevoke(b) => Some(&b.token_id),
            RecordBody::Fusion(b) => Some(&b.token_id),
            RecordBody::ShardRepair(_) | RecordBody::ShardRemove(_) | RecordBody::Audit(_) => None,
        }
    }
}

/// One append-only ledger entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerRecord {
    pub index: u64,
    pub previous_hash: Hash,
    pub timestamp: Timestamp,
    pub kind: RecordKind,
    pub body: RecordBody,
    pub hash: Hash,
    pub nonce: u64,
    pub signature: NodeSignature,
}

impl LedgerRecord {
    pub fn compute_hash(
        index: u64,
        previous_hash: &str,
        timestamp: Timestamp,
        body: &RecordBody,
        nonce: u64,
    ) -> Hash {
        let preimage = format!(
            "{index}:{previous_hash}:{timestamp}:{}:{nonce}",
            body.digest()
        );
        atomvault_pqc::sha256_hex(preimage.as_bytes())
    }

    pub fn hash_matches(&self) -> bool {
        self.hash
            == Self::compute_hash(
                self.index,
                &self.previous_hash,
                self.timestamp,
                &self.body,
                self.nonce,
            )
    }

    /// Whether the hash carries `difficulty` leading zero nibbles.
    pub fn satisfies_pow(&self, difficulty: usize) -> bool {
        self.hash.bytes().take(difficulty).all(|b| b == b'0')
    }
}

/// A consensus batch of ledger records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub index: u64,
    pub previous_hash: Hash,
    pub timestamp: Timestamp,
    pub records: Vec<LedgerRecord>,
    pub atomic_metadata: AtomicMetadata,
    pub hash: Hash,
    pub nonce: u64,
    pub signature: NodeSignature,
}

impl Block {
    pub fn records_digest(records: &[LedgerRecord]) -> Hash {
        let joined: String = records.iter().map(|r| r.hash.as_str()).collect();
        atomvault_pqc::sha256_hex(joined.as_bytes())
    }

    pub fn compute_hash(
        index: u64,
        previous_hash: &str,
        timestamp: Timestamp,
        records: &[LedgerRecord],
        nonce: u64,
    ) -> Hash {
        let preimage = format!(
            "{index}:{previous_hash}:{timestamp}:{}:{nonce}",
            Self::records_digest(records)
        );
        atomvault_pqc::sha256_hex(preimage.as_bytes())
    }

    pub fn hash_matches(&self) -> bool {
        self.hash
            == Self::compute_hash(
                self.index,
                &self.previous_hash,
                self.timestamp,
                &self.records,
                self.nonce,
            )
    }

    /// Sum particle counts and redundancy across the batch.
    pub fn summarize(records: &[LedgerRecord]) -> AtomicMetadata {
        let mut meta = AtomicMetadata::default();
        for record in records {
            if let RecordBody::ShardCreate(body) = &record.body {
                meta.merge(&body.atomic);
            }
        }
        meta
    }

    /// Proposer-race score: shard frequencies plus proton and neutron counts,
    /// normalized by record count.
    pub fn score(&self) -> f64 {
        if self.records.is_empty() {
            return 0.0;
        }
        let mut freq_sum = 0.0;
        for record in &self.records {
            if let RecordBody::ShardCreate(body) = &record.body {
                freq_sum += body.shards.iter().map(|s| s.frequency).sum::<f64>();
            }
        }
        let particle_sum =
            (self.atomic_metadata.proton_count + self.atomic_metadata.neutron_count) as f64;
        (freq_sum + particle_sum) / self.records.len() as f64
    }
}
