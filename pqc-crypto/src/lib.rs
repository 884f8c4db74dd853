//! AtomVault PQC Cryptography Library
//!
//! Provides the primitives the storage engine builds on: SHA-256 hashing,
//! AES-256-GCM with detached tags, Dilithium5 signatures and Kyber1024 key
//! encapsulation, plus the pluggable [`KeyProvider`] used for all key
//! material.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use hmac::{Hmac, Mac};
use pqcrypto_dilithium::dilithium5;
use pqcrypto_kyber::kyber1024;
use pqcrypto_traits::kem::{
    Ciphertext as KemCiphertext, PublicKey as KemPublicKey, SecretKey as KemSecretKey,
    SharedSecret as KemSharedSecret,
};
use pqcrypto_traits::sign::{
    DetachedSignature, PublicKey as SignPublicKey, SecretKey as SignSecretKey,
};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub mod provider;

pub use provider::{
    HsmKeyProvider, InMemoryKeyProvider, KeyId, KeyKind, KeyProvider, KeyProviderError, KeyRef,
};

/// AES-256-GCM nonce length in bytes.
pub const IV_LEN: usize = 12;
/// AES-256-GCM authentication tag length in bytes.
pub const TAG_LEN: usize = 16;
/// Symmetric key length in bytes.
pub const SYM_KEY_LEN: usize = 32;

#[derive(Error, Debug)]
pub enum PqcError {
    #[error("Invalid key format")]
    InvalidKey,
    #[error("Invalid signature format")]
    InvalidSignature,
    #[error("Signature verification failed")]
    VerificationFailed,
    #[error("Invalid KEM ciphertext")]
    InvalidCiphertext,
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),
    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),
    #[error("Invalid key material")]
    InvalidKeyMaterial,
}

/// Hex-encoded SHA-256 digest of `data`.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Raw SHA-256 digest of `data`.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// HMAC-SHA256 over `data` with `key`.
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac =
        <Hmac<Sha256> as Mac>::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// Constant-time HMAC-SHA256 verification.
pub fn hmac_sha256_verify(key: &[u8], data: &[u8], tag: &[u8]) -> bool {
    let mut mac = match <Hmac<Sha256> as Mac>::new_from_slice(key) {
        Ok(m) => m,
        Err(_) => return false,
    };
    mac.update(data);
    mac.verify_slice(tag).is_ok()
}

/// Ciphertext plus the crypto envelope needed to decrypt it again.
///
/// The GCM tag is carried detached so sidecar metadata can store ciphertext
/// hash, IV and tag as separate fields.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EncryptedPayload {
    pub ciphertext: Vec<u8>,
    pub iv: Vec<u8>,
    pub auth_tag: Vec<u8>,
}

/// Encrypt `plaintext` with AES-256-GCM under `key`, generating a fresh
/// 12-byte IV.
pub fn aes_gcm_encrypt(key: &[u8], plaintext: &[u8]) -> Result<EncryptedPayload, PqcError> {
    if key.len() != SYM_KEY_LEN {
        return Err(PqcError::InvalidKeyMaterial);
    }
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| PqcError::EncryptionFailed(e.to_string()))?;

    let mut iv = [0u8; IV_LEN];
    rand::rngs::OsRng.fill_bytes(&mut iv);
    let nonce = Nonce::from_slice(&iv);

    // aes-gcm appends the tag; split it off so it travels detached
    let mut sealed = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| PqcError::EncryptionFailed(e.to_string()))?;
    let auth_tag = sealed.split_off(sealed.len() - TAG_LEN);

    Ok(EncryptedPayload {
        ciphertext: sealed,
        iv: iv.to_vec(),
        auth_tag,
    })
}

/// Decrypt an [`EncryptedPayload`] produced by [`aes_gcm_encrypt`].
pub fn aes_gcm_decrypt(key: &[u8], payload: &EncryptedPayload) -> Result<Vec<u8>, PqcError> {
    if key.len() != SYM_KEY_LEN {
        return Err(PqcError::InvalidKeyMaterial);
    }
    if payload.iv.len() != IV_LEN || payload.auth_tag.len() != TAG_LEN {
        return Err(PqcError::DecryptionFailed("bad iv or tag length".into()));
    }
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| PqcError::DecryptionFailed(e.to_string()))?;
    let nonce = Nonce::from_slice(&payload.iv);

    let mut sealed = payload.ciphertext.clone();
    sealed.extend_from_slice(&payload.auth_tag);

    cipher
        .decrypt(nonce, sealed.as_ref())
        .map_err(|e| PqcError::DecryptionFailed(e.to_string()))
}

/// Generate a fresh 32-byte symmetric key.
pub fn generate_sym_key() -> Vec<u8> {
    let mut key = vec![0u8; SYM_KEY_LEN];
    rand::rngs::OsRng.fill_bytes(&mut key);
    key
}

// --- Dilithium5 signatures -------------------------------------------------

/// Generate a Dilithium5 keypair as raw byte vectors.
pub fn dilithium_keypair() -> (Vec<u8>, Vec<u8>) {
    let (pk, sk) = dilithium5::keypair();
    (pk.as_bytes().to_vec(), sk.as_bytes().to_vec())
}

/// Produce a detached Dilithium5 signature over `message`.
pub fn dilithium_sign(message: &[u8], secret_key: &[u8]) -> Result<Vec<u8>, PqcError> {
    let sk = dilithium5::SecretKey::from_bytes(secret_key).map_err(|_| PqcError::InvalidKey)?;
    let sig = dilithium5::detached_sign(message, &sk);
    Ok(sig.as_bytes().to_vec())
}

/// Verify a detached Dilithium5 signature. A malformed signature or key is
/// reported as a verification failure, not an error.
pub fn dilithium_verify(message: &[u8], signature: &[u8], public_key: &[u8]) -> bool {
    let pk = match dilithium5::PublicKey::from_bytes(public_key) {
        Ok(pk) => pk,
        Err(_) => return false,
    };
    let sig = match dilithium5::DetachedSignature::from_bytes(signature) {
        Ok(sig) => sig,
        Err(_) => return false,
    };
    dilithium5::verify_detached_signature(&sig, message, &pk).is_ok()
}

// --- Kyber1024 KEM ---------------------------------------------------------

/// Generate a Kyber1024 keypair as raw byte vectors.
pub fn kyber_keypair() -> (Vec<u8>, Vec<u8>) {
    let (pk, sk) = kyber1024::keypair();
    (pk.as_bytes().to_vec(), sk.as_bytes().to_vec())
}

/// Encapsulate to `public_key`, returning `(shared_secret, kem_ciphertext)`.
pub fn kyber_encapsulate(public_key: &[u8]) -> Result<(Vec<u8>, Vec<u8>), PqcError> {
    let pk = kyber1024::PublicKey::from_bytes(public_key).map_err(|_| PqcError::InvalidKey)?;
    let (shared, ct) = kyber1024::encapsulate(&pk);
    Ok((shared.as_bytes().to_vec(), ct.as_bytes().to_vec()))
}

/// Decapsulate `ciphertext` with `secret_key`, returning the shared secret.
pub fn kyber_decapsulate(ciphertext: &[u8], secret_key: &[u8]) -> Result<Vec<u8>, PqcError> {
    let sk = kyber1024::SecretKey::from_bytes(secret_key).map_err(|_| PqcError::InvalidKey)?;
    let ct =
        kyber1024::Ciphertext::from_bytes(ciphertext).map_err(|_| PqcError::InvalidCiphertext)?;
    let shared = kyber1024::decapsulate(&ct, &sk);
    Ok(shared.as_bytes().to_vec())
}

/// A small blob sealed to a Kyber1024 public key: KEM ciphertext plus the
/// blob encrypted under the derived shared secret.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SealedBlob {
    pub kem_ciphertext: Vec<u8>,
    pub payload: EncryptedPayload,
}

/// Seal `plaintext` to a Kyber1024 public key.
pub fn seal_blob(public_key: &[u8], plaintext: &[u8]) -> Result<SealedBlob, PqcError> {
    let (shared, kem_ciphertext) = kyber_encapsulate(public_key)?;
    let payload = aes_gcm_encrypt(&shared, plaintext)?;
    Ok(SealedBlob {
        kem_ciphertext,
        payload,
    })
}

/// Open a [`SealedBlob`] with the matching KEM secret key.
pub fn open_blob(secret_key: &[u8], blob: &SealedBlob) -> Result<Vec<u8>, PqcError> {
    let shared = kyber_decapsulate(&blob.kem_ciphertext, secret_key)?;
    aes_gcm_decrypt(&shared, &blob.payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_hex_known_vector() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_aes_gcm_roundtrip_and_tamper() {
        let key = generate_sym_key();
        let payload = aes_gcm_encrypt(&key, b"shard bytes").unwrap();
        assert_eq!(payload.iv.len(), IV_LEN);
        assert_eq!(payload.auth_tag.len(), TAG_LEN);

        let plain = aes_gcm_decrypt(&key, &payload).unwrap();
        assert_eq!(plain, b"shard bytes");

        let mut bad = payload.clone();
        bad.ciphertext[0] ^= 0xff;
        assert!(aes_gcm_decrypt(&key, &bad).is_err());
    }

    #[test]
    fn test_dilithium_sign_verify() {
        let (pk, sk) = dilithium_keypair();
        let sig = dilithium_sign(b"ledger record", &sk).unwrap();
        assert!(dilithium_verify(b"ledger record", &sig, &pk));
        assert!(!dilithium_verify(b"other bytes", &sig, &pk));

        let mut flipped = sig.clone();
        flipped[0] ^= 0x01;
        assert!(!dilithium_verify(b"ledger record", &flipped, &pk));
    }

    #[test]
    fn test_kyber_seal_open() {
        let (pk, sk) = kyber_keypair();
        let blob = seal_blob(&pk, b"token-id-bytes").unwrap();
        let opened = open_blob(&sk, &blob).unwrap();
        assert_eq!(opened, b"token-id-bytes");
    }

    #[test]
    fn test_hmac_verify() {
        let tag = hmac_sha256(b"session-key", b"payload:12345");
        assert!(hmac_sha256_verify(b"session-key", b"payload:12345", &tag));
        assert!(!hmac_sha256_verify(b"session-key", b"payload:12346", &tag));
    }
}
