//! Key provider implementations
//!
//! All key material in the engine is owned by a [`KeyProvider`]. The dev
//! provider keeps keys in process memory; the HSM provider is the
//! configuration shell a vendor adapter plugs into.

use crate::{
    dilithium_keypair, dilithium_sign, dilithium_verify, kyber_decapsulate, kyber_encapsulate,
    kyber_keypair, PqcError,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;
use zeroize::Zeroizing;

#[derive(Debug, thiserror::Error)]
pub enum KeyProviderError {
    #[error("Key not found: {0}")]
    KeyNotFound(String),
    #[error("Key {0} is not a {1:?} key")]
    WrongKeyKind(String, KeyKind),
    #[error("Key generation failed: {0}")]
    GenerationFailed(String),
    #[error("Provider unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Crypto(#[from] PqcError),
}

/// What a generated keypair is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyKind {
    /// Dilithium5 signing keypair.
    Signing,
    /// Kyber1024 encapsulation keypair.
    Kem,
}

/// Opaque handle to a key held by a provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyId(pub String);

impl KeyId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for KeyId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Verification accepts either a provider-held key or a raw public key, so
/// records signed by remote nodes can be checked without importing their keys.
#[derive(Debug, Clone)]
pub enum KeyRef<'a> {
    Id(&'a KeyId),
    PublicKey(&'a [u8]),
}

/// Pluggable source of key material and signing/encapsulation operations.
///
/// Implementations must be safe for concurrent callers; signing with one key
/// never blocks verification with another.
#[async_trait]
pub trait KeyProvider: Send + Sync {
    /// Unique identifier for this provider type.
    fn provider_name(&self) -> &'static str;

    /// Generate a fresh keypair of `kind` and return its handle.
    async fn generate_keypair(&self, kind: KeyKind) -> Result<KeyId, KeyProviderError>;

    /// Public half of a held key.
    async fn public_key(&self, key_id: &KeyId) -> Result<Vec<u8>, KeyProviderError>;

    /// Detached Dilithium5 signature over `message` with the held key.
    async fn sign(&self, key_id: &KeyId, message: &[u8]) -> Result<Vec<u8>, KeyProviderError>;

    /// Verify a detached signature under a held key or a raw public key.
    async fn verify(
        &self,
        key: KeyRef<'_>,
        message: &[u8],
        signature: &[u8],
    ) -> Result<bool, KeyProviderError>;

    /// Encapsulate to a raw Kyber1024 public key; returns `(shared, ct)`.
    async fn encapsulate(&self, public_key: &[u8])
        -> Result<(Vec<u8>, Vec<u8>), KeyProviderError>;

    /// Decapsulate a Kyber1024 ciphertext with the held key.
    async fn decapsulate(
        &self,
        key_id: &KeyId,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, KeyProviderError>;

    /// Check if this provider is available/healthy.
    async fn health_check(&self) -> bool {
        true
    }
}

struct StoredKey {
    kind: KeyKind,
    public: Vec<u8>,
    secret: Zeroizing<Vec<u8>>,
}

/// In-memory provider for dev and test nodes.
///
/// Secret material is zeroized on drop. Readers take a shared lease on the
/// key table; only key generation takes the exclusive lease.
pub struct InMemoryKeyProvider {
    keys: Arc<RwLock<HashMap<KeyId, StoredKey>>>,
}

impl InMemoryKeyProvider {
    pub fn new() -> Self {
        Self {
            keys: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Import an existing keypair, returning its handle. Used when a node
    /// restores identity keys from disk.
    pub async fn import(
        &self,
        kind: KeyKind,
        public: Vec<u8>,
        secret: Vec<u8>,
    ) -> Result<KeyId, KeyProviderError> {
        let id = KeyId(Uuid::new_v4().to_string());
        let mut keys = self.keys.write().await;
        keys.insert(
            id.clone(),
            StoredKey {
                kind,
                public,
                secret: Zeroizing::new(secret),
            },
        );
        Ok(id)
    }
}

impl Default for InMemoryKeyProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyProvider for InMemoryKeyProvider {
    fn provider_name(&self) -> &'static str {
        "local"
    }

    async fn generate_keypair(&self, kind: KeyKind) -> Result<KeyId, KeyProviderError> {
        let (public, secret) = match kind {
            KeyKind::Signing => dilithium_keypair(),
            KeyKind::Kem => kyber_keypair(),
        };
        let id = KeyId(Uuid::new_v4().to_string());
        let mut keys = self.keys.write().await;
        keys.insert(
            id.clone(),
            StoredKey {
                kind,
                public,
                secret: Zeroizing::new(secret),
            },
        );
        log::debug!("generated {kind:?} keypair {id}");
        Ok(id)
    }

    async fn public_key(&self, key_id: &KeyId) -> Result<Vec<u8>, KeyProviderError> {
        let keys = self.keys.read().await;
        keys.get(key_id)
            .map(|k| k.public.clone())
            .ok_or_else(|| KeyProviderError::KeyNotFound(key_id.0.clone()))
    }

    async fn sign(&self, key_id: &KeyId, message: &[u8]) -> Result<Vec<u8>, KeyProviderError> {
        let keys = self.keys.read().await;
        let key = keys
            .get(key_id)
            .ok_or_else(|| KeyProviderError::KeyNotFound(key_id.0.clone()))?;
        if key.kind != KeyKind::Signing {
            return Err(KeyProviderError::WrongKeyKind(
                key_id.0.clone(),
                KeyKind::Signing,
            ));
        }
        Ok(dilithium_sign(message, &key.secret)?)
    }

    async fn verify(
        &self,
        key: KeyRef<'_>,
        message: &[u8],
        signature: &[u8],
    ) -> Result<bool, KeyProviderError> {
        let public = match key {
            KeyRef::PublicKey(pk) => pk.to_vec(),
            KeyRef::Id(id) => self.public_key(id).await?,
        };
        Ok(dilithium_verify(message, signature, &public))
    }

    async fn encapsulate(
        &self,
        public_key: &[u8],
    ) -> Result<(Vec<u8>, Vec<u8>), KeyProviderError> {
        Ok(kyber_encapsulate(public_key)?)
    }

    async fn decapsulate(
        &self,
        key_id: &KeyId,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, KeyProviderError> {
        let keys = self.keys.read().await;
        let key = keys
            .get(key_id)
            .ok_or_else(|| KeyProviderError::KeyNotFound(key_id.0.clone()))?;
        if key.kind != KeyKind::Kem {
            return Err(KeyProviderError::WrongKeyKind(key_id.0.clone(), KeyKind::Kem));
        }
        Ok(kyber_decapsulate(ciphertext, &key.secret)?)
    }
}

/// Remote-HSM provider shell.
///
/// Holds the endpoint and slot configuration and answers health checks; every
/// key operation reports `Unavailable` until a vendor adapter is linked in.
/// Production deployments swap this for the vendor build.
pub struct HsmKeyProvider {
    endpoint: String,
    slot_label: String,
}

impl HsmKeyProvider {
    pub fn new(endpoint: impl Into<String>, slot_label: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            slot_label: slot_label.into(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn offline<T>(&self) -> Result<T, KeyProviderError> {
        Err(KeyProviderError::Unavailable(format!(
            "no HSM adapter linked for {} (slot {})",
            self.endpoint, self.slot_label
        )))
    }
}

#[async_trait]
impl KeyProvider for HsmKeyProvider {
    fn provider_name(&self) -> &'static str {
        "hsm"
    }

    async fn generate_keypair(&self, _kind: KeyKind) -> Result<KeyId, KeyProviderError> {
        self.offline()
    }

    async fn public_key(&self, _key_id: &KeyId) -> Result<Vec<u8>, KeyProviderError> {
        self.offline()
    }

    async fn sign(&self, _key_id: &KeyId, _message: &[u8]) -> Result<Vec<u8>, KeyProviderError> {
        self.offline()
    }

    async fn verify(
        &self,
        key: KeyRef<'_>,
        message: &[u8],
        signature: &[u8],
    ) -> Result<bool, KeyProviderError> {
        // Verification needs no secret material, so it works even offline
        match key {
            KeyRef::PublicKey(pk) => Ok(dilithium_verify(message, signature, pk)),
            KeyRef::Id(_) => self.offline(),
        }
    }

    async fn encapsulate(
        &self,
        public_key: &[u8],
    ) -> Result<(Vec<u8>, Vec<u8>), KeyProviderError> {
        Ok(kyber_encapsulate(public_key)?)
    }

    async fn decapsulate(
        &self,
        _key_id: &KeyId,
        _ciphertext: &[u8],
    ) -> Result<Vec<u8>, KeyProviderError> {
        self.offline()
    }

    async fn health_check(&self) -> bool {
        false
    }
}

/// Build a provider from the `KEY_PROVIDER` environment selector
/// (`local` or `hsm`).
pub fn from_env() -> Arc<dyn KeyProvider> {
    match std::env::var("KEY_PROVIDER").as_deref() {
        Ok("hsm") => {
            let endpoint =
                std::env::var("HSM_ENDPOINT").unwrap_or_else(|_| "https://localhost:7443".into());
            let slot = std::env::var("HSM_SLOT").unwrap_or_else(|_| "atomvault".into());
            log::info!("using remote HSM key provider at {endpoint}");
            Arc::new(HsmKeyProvider::new(endpoint, slot))
        }
        _ => Arc::new(InMemoryKeyProvider::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_generate_sign_verify() {
        let provider = InMemoryKeyProvider::new();
        let id = provider.generate_keypair(KeyKind::Signing).await.unwrap();
        let sig = provider.sign(&id, b"message").await.unwrap();
        assert!(provider
            .verify(KeyRef::Id(&id), b"message", &sig)
            .await
            .unwrap());

        let pk = provider.public_key(&id).await.unwrap();
        assert!(provider
            .verify(KeyRef::PublicKey(&pk), b"message", &sig)
            .await
            .unwrap());
        assert!(!provider
            .verify(KeyRef::PublicKey(&pk), b"other", &sig)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_kem_roundtrip_via_provider() {
        let provider = InMemoryKeyProvider::new();
        let id = provider.generate_keypair(KeyKind::Kem).await.unwrap();
        let pk = provider.public_key(&id).await.unwrap();
        let (shared, ct) = provider.encapsulate(&pk).await.unwrap();
        let recovered = provider.decapsulate(&id, &ct).await.unwrap();
        assert_eq!(shared, recovered);
    }

    #[tokio::test]
    async fn test_wrong_kind_rejected() {
        let provider = InMemoryKeyProvider::new();
        let id = provider.generate_keypair(KeyKind::Kem).await.unwrap();
        assert!(matches!(
            provider.sign(&id, b"x").await,
            Err(KeyProviderError::WrongKeyKind(..))
        ));
    }

    #[tokio::test]
    async fn test_hsm_shell_reports_unavailable() {
        let provider = HsmKeyProvider::new("https://hsm.example", "slot-1");
        assert!(!provider.health_check().await);
        assert!(matches!(
            provider.generate_keypair(KeyKind::Signing).await,
            Err(KeyProviderError::Unavailable(_))
        ));
    }
}
