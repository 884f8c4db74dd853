// Core types for AtomVault
// Post-Quantum Secure Storage Engine

use serde::{Deserialize, Serialize};
use std::fmt;

/// AtomVault address format (atm1...)
pub type Address = String;

/// SHA-256 digest as hex string
pub type Hash = String;

/// Shard identifier
pub type ShardId = String;

/// Node identifier
pub type NodeId = String;

/// Timestamp (Unix timestamp in seconds)
pub type Timestamp = u64;

/// Current Unix timestamp in seconds.
pub fn now_ts() -> Timestamp {
    chrono::Utc::now().timestamp() as u64
}

/// Particle classification of a bit atom and of the shard derived from it.
///
/// Assignment is deterministic: `bit_index mod 3` in the order
/// proton, neutron, electron.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Particle {
    Proton,
    Neutron,
    Electron,
}

impl Particle {
    pub const ALL: [Particle; 3] = [Particle::Proton, Particle::Neutron, Particle::Electron];

    /// Deterministic particle for a bit position within its byte.
    pub fn for_bit_index(bit_index: u8) -> Self {
        Self::ALL[(bit_index % 3) as usize]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Particle::Proton => "proton",
            Particle::Neutron => "neutron",
            Particle::Electron => "electron",
        }
    }

    /// Minimum replica count for shards of this kind.
    pub fn redundancy_floor(&self) -> u32 {
        match self {
            Particle::Neutron => 5,
            Particle::Proton => 3,
            Particle::Electron => 1,
        }
    }
}

impl fmt::Display for Particle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Particle {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "proton" => Ok(Particle::Proton),
            "neutron" => Ok(Particle::Neutron),
            "electron" => Ok(Particle::Electron),
            other => Err(format!("unknown particle: {other}")),
        }
    }
}

/// Kind of a ledger record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    ShardCreate,
    ShardMove,
    ShardRepair,
    ShardRemove,
    TokenMint,
    TokenRedeem,
    TokenRevoke,
    Audit,
    Fusion,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::ShardCreate => "shard_create",
            RecordKind::ShardMove => "shard_move",
            RecordKind::ShardRepair => "shard_repair",
            RecordKind::ShardRemove => "shard_remove",
            RecordKind::TokenMint => "token_mint",
            RecordKind::TokenRedeem => "token_redeem",
            RecordKind::TokenRevoke => "token_revoke",
            RecordKind::Audit => "audit",
            RecordKind::Fusion => "fusion",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Role of a node in the federation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Hq,
    Corporate,
    Branch,
    Specialized,
}

impl NodeRole {
    /// Admission priority; lower values are contacted first.
    pub fn priority(&self) -> u8 {
        match self {
            NodeRole::Hq => 0,
            NodeRole::Corporate => 1,
            NodeRole::Branch => 2,
            NodeRole::Specialized => 3,
        }
    }
}

/// Identity a node presents during overlay admission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeIdentity {
    pub node_id: NodeId,
    pub role: NodeRole,
    /// Dilithium5 signing public key
    pub public_key: Vec<u8>,
    pub endpoints: Vec<String>,
    /// PoA token attesting this identity
    pub attested_token_id: String,
}

/// Quantum-safe signature with the signer's public key attached, so records
/// and blocks can be verified without a key registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSignature {
    pub signature: Vec<u8>,
    pub public_key: Vec<u8>,
}

impl NodeSignature {
    pub fn empty() -> Self {
        Self {
            signature: Vec::new(),
            public_key: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.signature.is_empty()
    }
}

/// Per-block summary of the shard particles it touches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AtomicMetadata {
    pub proton_count: u64,
    pub neutron_count: u64,
    pub electron_count: u64,
    pub redundancy_level: u64,
}

impl AtomicMetadata {
    pub fn add_particle(&mut self, kind: Particle, redundancy: u32) {
        match kind {
            Particle::Proton => self.proton_count += 1,
            Particle::Neutron => self.neutron_count += 1,
            Particle::Electron => self.electron_count += 1,
        }
        self.redundancy_level += redundancy as u64;
    }

    pub fn merge(&mut self, other: &AtomicMetadata) {
        self.proton_count += other.proton_count;
        self.neutron_count += other.neutron_count;
        self.electron_count += other.electron_count;
        self.redundancy_level += other.redundancy_level;
    }
}

/// Derive the storage address for a payload written by this node:
/// `atm1` + hex(blake3(signing_pubkey || sha256(payload))[0..20]).
///
/// The same payload on the same node always lands on the same address.
pub fn derive_address(signing_public_key: &[u8], payload_digest: &[u8]) -> Address {
    let mut hasher = blake3::Hasher::new();
    hasher.update(signing_public_key);
    hasher.update(payload_digest);
    let digest = hasher.finalize();
    format!("atm1{}", hex::encode(&digest.as_bytes()[0..20]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_particle_assignment_cycles() {
        assert_eq!(Particle::for_bit_index(0), Particle::Proton);
        assert_eq!(Particle::for_bit_index(1), Particle::Neutron);
        assert_eq!(Particle::for_bit_index(2), Particle::Electron);
        assert_eq!(Particle::for_bit_index(3), Particle::Proton);
        assert_eq!(Particle::for_bit_index(7), Particle::Neutron);
    }

    #[test]
    fn test_redundancy_floors() {
        assert_eq!(Particle::Neutron.redundancy_floor(), 5);
        assert_eq!(Particle::Proton.redundancy_floor(), 3);
        assert_eq!(Particle::Electron.redundancy_floor(), 1);
    }

    #[test]
    fn test_address_is_deterministic() {
        let pk = vec![7u8; 64];
        let digest = atomvault_pqc::sha256(b"hi");
        let a = derive_address(&pk, &digest);
        let b = derive_address(&pk, &digest);
        assert_eq!(a, b);
        assert!(a.starts_with("atm1"));
        assert_eq!(a.len(), 4 + 40);

        let other = derive_address(&pk, &atomvault_pqc::sha256(b"ho"));
        assert_ne!(a, other);
    }

    #[test]
    fn test_atomic_metadata_sums() {
        let mut meta = AtomicMetadata::default();
        meta.add_particle(Particle::Neutron, 5);
        meta.add_particle(Particle::Proton, 3);
        meta.add_particle(Particle::Proton, 3);
        assert_eq!(meta.neutron_count, 1);
        assert_eq!(meta.proton_count, 2);
        assert_eq!(meta.redundancy_level, 11);
    }
}
