//! Overlay wire messages
//!
//! Every message travels as a length-prefixed bincode frame, encrypted under
//! the session key and authenticated with an HMAC over
//! `(ciphertext || timestamp)`.

use crate::ledger::{Block, LedgerRecord};
use crate::shard::{Shard, ShardMetadataRecord};
use crate::types::{Address, Hash, NodeId, NodeIdentity, NodeSignature, Particle, ShardId};
use atomvault_pqc::EncryptedPayload;
use serde::{Deserialize, Serialize};

/// Signed vote on one proposed block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockVote {
    pub block_hash: Hash,
    pub voter_id: NodeId,
    pub accept: bool,
    pub reason: Option<String>,
    pub signature: NodeSignature,
}

impl BlockVote {
    /// Canonical bytes the voter signs.
    pub fn signing_bytes(block_hash: &str, voter_id: &str, accept: bool) -> Vec<u8> {
        format!("vote:{block_hash}:{voter_id}:{accept}").into_bytes()
    }
}

/// Application messages exchanged between admitted peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PeerMessage {
    /// Admission handshake: identity, PoA attestation and capabilities
    Hello {
        identity: NodeIdentity,
        capabilities: Vec<Particle>,
    },
    /// Fetch a replica
    ShardRequest { shard_id: ShardId, kind: Particle },
    ShardResponse {
        shard_id: ShardId,
        found: bool,
        ciphertext: Vec<u8>,
        iv: Vec<u8>,
        auth_tag: Vec<u8>,
    },
    /// Place a replica on the receiving node
    ShardBounce {
        shard: Shard,
        from: NodeId,
        to: NodeId,
        metadata: ShardMetadataRecord,
    },
    ShardBounceAck { shard_id: ShardId, stored: bool },
    BlockPropose { block: Block, proposer: NodeId },
    BlockVote(BlockVote),
    SyncRequest { address: Address, from_index: u64 },
    SyncResponse {
        address: Address,
        records: Vec<LedgerRecord>,
    },
    Heartbeat { ts: u64 },
}

impl PeerMessage {
    pub fn kind_name(&self) -> &'static str {
        match self {
            PeerMessage::Hello { .. } => "hello",
            PeerMessage::ShardRequest { .. } => "shard_request",
            PeerMessage::ShardResponse { .. } => "shard_response",
            PeerMessage::ShardBounce { .. } => "shard_bounce",
            PeerMessage::ShardBounceAck { .. } => "shard_bounce_ack",
            PeerMessage::BlockPropose { .. } => "block_propose",
            PeerMessage::BlockVote(_) => "block_vote",
            PeerMessage::SyncRequest { .. } => "sync_request",
            PeerMessage::SyncResponse { .. } => "sync_response",
            PeerMessage::Heartbeat { .. } => "heartbeat",
        }
    }
}

/// Encrypted, authenticated frame as it appears on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecureFrame {
    pub sender: NodeId,
    pub timestamp_ms: u64,
    pub payload: EncryptedPayload,
    pub mac: Vec<u8>,
}

/// Plaintext frames used only while the quantum-secure channel is being
/// established.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum HandshakeFrame {
    /// Responder offers its Kyber1024 public key
    Offer { node_id: NodeId, kem_public: Vec<u8> },
    /// Initiator returns the encapsulation
    Reply { node_id: NodeId, kem_ciphertext: Vec<u8> },
}

/// Session keys derived from the KEM shared secret.
#[derive(Debug, Clone)]
pub struct SessionKeys {
    pub enc_key: [u8; 32],
    pub mac_key: [u8; 32],
}

impl SessionKeys {
    pub fn derive(shared_secret: &[u8]) -> Self {
        let mut enc_input = shared_secret.to_vec();
        enc_input.extend_from_slice(b"enc");
        let mut mac_input = shared_secret.to_vec();
        mac_input.extend_from_slice(b"mac");
        Self {
            enc_key: atomvault_pqc::sha256(&enc_input),
            mac_key: atomvault_pqc::sha256(&mac_input),
        }
    }

    /// Seal a message into a [`SecureFrame`].
    pub fn seal(
        &self,
        sender: &str,
        timestamp_ms: u64,
        message: &PeerMessage,
    ) -> Result<SecureFrame, atomvault_pqc::PqcError> {
        let plain = bincode::serialize(message)
            .map_err(|e| atomvault_pqc::PqcError::EncryptionFailed(e.to_string()))?;
        let payload = atomvault_pqc::aes_gcm_encrypt(&self.enc_key, &plain)?;
        let mac = self.mac(&payload.ciphertext, timestamp_ms);
        Ok(SecureFrame {
            sender: sender.to_string(),
            timestamp_ms,
            payload,
            mac: mac.to_vec(),
        })
    }

    /// Verify and open a [`SecureFrame`].
    pub fn open(&self, frame: &SecureFrame) -> Result<PeerMessage, atomvault_pqc::PqcError> {
        if !atomvault_pqc::hmac_sha256_verify(
            &self.mac_key,
            &Self::mac_input(&frame.payload.ciphertext, frame.timestamp_ms),
            &frame.mac,
        ) {
            return Err(atomvault_pqc::PqcError::VerificationFailed);
        }
        let plain = atomvault_pqc::aes_gcm_decrypt(&self.enc_key, &frame.payload)?;
        bincode::deserialize(&plain)
            .map_err(|e| atomvault_pqc::PqcError::DecryptionFailed(e.to_string()))
    }

    fn mac_input(ciphertext: &[u8], timestamp_ms: u64) -> Vec<u8> {
        let mut input = ciphertext.to_vec();
        input.extend_from_slice(&timestamp_ms.to_be_bytes());
        input
    }

    fn mac(&self, ciphertext: &[u8], timestamp_ms: u64) -> [u8; 32] {
        atomvault_pqc::hmac_sha256(&self.mac_key, &Self::mac_input(ciphertext, timestamp_ms))
    }
}
