//! Shard model and encoding
//!
//! A shard is one canonical bit atom encrypted for storage: AES-256-GCM
//! ciphertext under a fresh key, the key wrapped to the writing node's
//! Kyber1024 key, and a Dilithium5 signature over the metadata hash.

use crate::atoms::{bounce_rate, BitAtom, BounceEntry};
use crate::types::{Address, Hash, NodeId, NodeSignature, Particle, ShardId, Timestamp};
use atomvault_pqc::{KeyId, KeyProvider, KeyRef, SealedBlob};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ShardError {
    #[error("Key provider failure: {0}")]
    KeyProvider(#[from] atomvault_pqc::KeyProviderError),
    #[error("Crypto failure: {0}")]
    Crypto(#[from] atomvault_pqc::PqcError),
    #[error("Malformed wrapped key")]
    MalformedWrappedKey,
    #[error("Shard signature invalid for {0}")]
    SignatureInvalid(ShardId),
    #[error("Shard plaintext malformed")]
    MalformedPlaintext,
}

/// One encrypted bit-level fragment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shard {
    pub shard_id: ShardId,
    pub kind: Particle,
    pub address: Address,
    pub ciphertext: Vec<u8>,
    pub iv: Vec<u8>,
    pub auth_tag: Vec<u8>,
    /// Data key sealed to the writing node's KEM key (bincode [`SealedBlob`])
    pub wrapped_key: Vec<u8>,
    pub metadata_hash: Hash,
    pub redundancy_level: u32,
    pub signature: NodeSignature,
    // Reassembly coordinates
    pub byte_index: u64,
    pub bit_index: u8,
    pub frequency: f64,
}

impl Shard {
    pub fn ciphertext_hash(&self) -> Hash {
        atomvault_pqc::sha256_hex(&self.ciphertext)
    }

    /// Canonical preimage of the signed metadata hash.
    pub fn metadata_preimage(
        shard_id: &str,
        kind: Particle,
        address: &str,
        byte_index: u64,
        bit_index: u8,
        frequency: f64,
        ciphertext_hash: &str,
    ) -> String {
        format!("{shard_id}:{kind}:{address}:{byte_index}:{bit_index}:{frequency}:{ciphertext_hash}")
    }
}

/// The ledger-owned description of a shard and its replicas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardMetadataRecord {
    pub shard_id: ShardId,
    pub address: Address,
    pub kind: Particle,
    pub metadata_hash: Hash,
    pub ciphertext_hash: Hash,
    pub token_id: String,
    pub placement: Vec<NodeId>,
    pub created_at: Timestamp,
    pub version: u32,
    // Reassembly coordinates
    pub byte_index: u64,
    pub bit_index: u8,
}

impl ShardMetadataRecord {
    pub fn from_shard(shard: &Shard, token_id: &str, placement: Vec<NodeId>) -> Self {
        Self {
            shard_id: shard.shard_id.clone(),
            address: shard.address.clone(),
            kind: shard.kind,
            metadata_hash: shard.metadata_hash.clone(),
            ciphertext_hash: shard.ciphertext_hash(),
            token_id: token_id.to_string(),
            placement,
            created_at: crate::types::now_ts(),
            version: 1,
            byte_index: shard.byte_index,
            bit_index: shard.bit_index,
        }
    }
}

/// Encrypts canonical bit atoms into shards and signs their metadata.
pub struct ShardEncoder {
    provider: Arc<dyn KeyProvider>,
    signing_key: KeyId,
    kem_key: KeyId,
    signing_public: Vec<u8>,
    kem_public: Vec<u8>,
}

impl ShardEncoder {
    pub async fn new(
        provider: Arc<dyn KeyProvider>,
        signing_key: KeyId,
        kem_key: KeyId,
    ) -> Result<Self, ShardError> {
        let signing_public = provider.public_key(&signing_key).await?;
        let kem_public = provider.public_key(&kem_key).await?;
        Ok(Self {
            provider,
            signing_key,
            kem_key,
            signing_public,
            kem_public,
        })
    }

    pub fn signing_public_key(&self) -> &[u8] {
        &self.signing_public
    }

    /// Encrypt one canonical bit atom into a shard.
    pub async fn encode(&self, atom: &BitAtom, address: &Address) -> Result<Shard, ShardError> {
        let shard_id =
            crate::atoms::shard_id_for(address, atom.particle, atom.byte_index, atom.bit_index);

        let data_key = atomvault_pqc::generate_sym_key();
        let payload = atomvault_pqc::aes_gcm_encrypt(&data_key, &[atom.bit])?;
        let wrapped = atomvault_pqc::seal_blob(&self.kem_public, &data_key)?;
        let wrapped_key =
            bincode::serialize(&wrapped).map_err(|_| ShardError::MalformedWrappedKey)?;

        let ciphertext_hash = atomvault_pqc::sha256_hex(&payload.ciphertext);
        let metadata_hash = atomvault_pqc::sha256_hex(
            Shard::metadata_preimage(
                &shard_id,
                atom.particle,
                address,
                atom.byte_index,
                atom.bit_index,
                atom.frequency,
                &ciphertext_hash,
            )
            .as_bytes(),
        );

        let signature = self
            .provider
            .sign(&self.signing_key, metadata_hash.as_bytes())
            .await?;

        Ok(Shard {
            shard_id,
            kind: atom.particle,
            address: address.clone(),
            ciphertext: payload.ciphertext,
            iv: payload.iv,
            auth_tag: payload.auth_tag,
            wrapped_key,
            metadata_hash,
            redundancy_level: atom.particle.redundancy_floor(),
            signature: NodeSignature {
                signature,
                public_key: self.signing_public.clone(),
            },
            byte_index: atom.byte_index,
            bit_index: atom.bit_index,
            frequency: atom.frequency,
        })
    }

    /// Unwrap and decrypt a shard back to its bit value.
    pub async fn decode(&self, shard: &Shard) -> Result<u8, ShardError> {
        let wrapped: SealedBlob =
            bincode::deserialize(&shard.wrapped_key).map_err(|_| ShardError::MalformedWrappedKey)?;
        let shared = self
            .provider
            .decapsulate(&self.kem_key, &wrapped.kem_ciphertext)
            .await?;
        let data_key = atomvault_pqc::aes_gcm_decrypt(&shared, &wrapped.payload)?;

        let payload = atomvault_pqc::EncryptedPayload {
            ciphertext: shard.ciphertext.clone(),
            iv: shard.iv.clone(),
            auth_tag: shard.auth_tag.clone(),
        };
        let plain = atomvault_pqc::aes_gcm_decrypt(&data_key, &payload)?;
        match plain.as_slice() {
            [bit @ 0] | [bit @ 1] => Ok(*bit),
            _ => Err(ShardError::MalformedPlaintext),
        }
    }

    /// Verify a shard's metadata signature and hash consistency.
    pub async fn verify(&self, shard: &Shard) -> Result<(), ShardError> {
        let ciphertext_hash = shard.ciphertext_hash();
        let expected = atomvault_pqc::sha256_hex(
            Shard::metadata_preimage(
                &shard.shard_id,
                shard.kind,
                &shard.address,
                shard.byte_index,
                shard.bit_index,
                shard.frequency,
                &ciphertext_hash,
            )
            .as_bytes(),
        );
        if expected != shard.metadata_hash {
            return Err(ShardError::SignatureInvalid(shard.shard_id.clone()));
        }
        let valid = self
            .provider
            .verify(
                KeyRef::PublicKey(&shard.signature.public_key),
                shard.metadata_hash.as_bytes(),
                &shard.signature.signature,
            )
            .await?;
        if !valid {
            return Err(ShardError::SignatureInvalid(shard.shard_id.clone()));
        }
        Ok(())
    }

    /// Bounce ledger entry describing an encoded shard.
    pub fn bounce_entry(&self, shard: &Shard, token_id: &str) -> BounceEntry {
        use base64::Engine;
        let b64 = base64::engine::general_purpose::STANDARD;
        BounceEntry {
            address: shard.address.clone(),
            particle: shard.kind,
            bit_index: shard.bit_index,
            frequency: shard.frequency,
            bounce_rate: bounce_rate(shard.frequency),
            iv: b64.encode(&shard.iv),
            auth_tag: b64.encode(&shard.auth_tag),
            timestamp: chrono::Utc::now(),
            token_id: token_id.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atomvault_pqc::{InMemoryKeyProvider, KeyKind};

    async fn test_encoder() -> ShardEncoder {
        let provider = Arc::new(InMemoryKeyProvider::new());
        let signing = provider.generate_keypair(KeyKind::Signing).await.unwrap();
        let kem = provider.generate_keypair(KeyKind::Kem).await.unwrap();
        ShardEncoder::new(provider, signing, kem).await.unwrap()
    }

    fn test_atom(bit: u8) -> BitAtom {
        BitAtom::new(bit, Particle::Neutron, 3, 1, 440.0)
    }

    #[tokio::test]
    async fn test_encode_decode_roundtrip() {
        let encoder = test_encoder().await;
        let address = "atm1ff".to_string();

        for bit in [0u8, 1u8] {
            let shard = encoder.encode(&test_atom(bit), &address).await.unwrap();
            assert_eq!(shard.kind, Particle::Neutron);
            assert_eq!(shard.redundancy_level, 5);
            encoder.verify(&shard).await.unwrap();
            assert_eq!(encoder.decode(&shard).await.unwrap(), bit);
        }
    }

    #[tokio::test]
    async fn test_shard_id_deterministic() {
        let encoder = test_encoder().await;
        let address = "atm1ff".to_string();
        let a = encoder.encode(&test_atom(1), &address).await.unwrap();
        let b = encoder.encode(&test_atom(1), &address).await.unwrap();
        // Fresh keys and IVs each time, same identity
        assert_eq!(a.shard_id, b.shard_id);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[tokio::test]
    async fn test_tampered_ciphertext_fails_verify() {
        let encoder = test_encoder().await;
        let address = "atm1ff".to_string();
        let mut shard = encoder.encode(&test_atom(1), &address).await.unwrap();
        shard.ciphertext[0] ^= 0x01;
        assert!(encoder.verify(&shard).await.is_err());
    }

    #[tokio::test]
    async fn test_forged_signature_fails_verify() {
        let encoder = test_encoder().await;
        let address = "atm1ff".to_string();
        let mut shard = encoder.encode(&test_atom(1), &address).await.unwrap();
        if let Some(byte) = shard.signature.signature.first_mut() {
            *byte ^= 0xff;
        }
        assert!(matches!(
            encoder.verify(&shard).await,
            Err(ShardError::SignatureInvalid(_))
        ));
    }
}
