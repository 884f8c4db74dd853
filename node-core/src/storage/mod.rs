//! Storage Manager
//!
//! Durable shard storage with encryption-at-rest. Each shard persists as a
//! ciphertext file plus a JSON sidecar in the store of its particle kind;
//! a backup copy supports repair. All writes are write-then-rename and
//! fsynced before return.

pub mod audit;

use crate::config::NodeConfig;
use crate::ledger::{LedgerAppend, LedgerError, RecordBody, ShardRepairBody};
use crate::shard::Shard;
use crate::types::{NodeId, Particle, ShardId};
use async_trait::async_trait;
use atomvault_pqc::{KeyId, KeyProvider, SealedBlob};
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Shard already stored with different content: {0}")]
    DuplicateShard(ShardId),
    #[error("Shard not found: {0}")]
    ShardNotFound(ShardId),
    #[error("Tamper detected on shard {0}")]
    TamperDetected(ShardId),
    #[error("Authentication tag invalid on shard {0}")]
    AuthTagInvalid(ShardId),
    #[error("Shard {0} is unrecoverable")]
    Unrecoverable(ShardId),
    #[error("Storage I/O failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("Sidecar malformed: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("Key provider failure: {0}")]
    KeyProvider(#[from] atomvault_pqc::KeyProviderError),
    #[error("Crypto failure: {0}")]
    Crypto(#[from] atomvault_pqc::PqcError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Sidecar metadata persisted next to each ciphertext file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardSidecar {
    pub id: ShardId,
    pub kind: Particle,
    /// Hex SHA-256 of the ciphertext file
    pub ciphertext_hash: String,
    /// Base64 of the wrapped data key
    pub wrapped_key: String,
    /// Base64, 12 bytes
    pub iv: String,
    /// Base64, 16 bytes
    pub auth_tag: String,
    pub custom: serde_json::Value,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Result of a repair attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepairOutcome {
    /// Healthy copy restored; names the source (`backup` or a peer id)
    Repaired(String),
    Unrecoverable,
}

/// Capability to fetch a replica of a shard from a peer that holds it.
#[async_trait]
pub trait ReplicaFetch: Send + Sync {
    /// Returns `(ciphertext, iv, auth_tag, source_node)` if some peer holds
    /// a copy.
    async fn fetch_replica(
        &self,
        kind: Particle,
        shard_id: &str,
    ) -> Option<(Vec<u8>, Vec<u8>, Vec<u8>, NodeId)>;
}

fn b64() -> base64::engine::general_purpose::GeneralPurpose {
    base64::engine::general_purpose::STANDARD
}

/// Durable shard store for one node, one directory tree per particle kind.
pub struct StorageManager {
    root: PathBuf,
    node_id: NodeId,
    provider: Arc<dyn KeyProvider>,
    kem_key: KeyId,
    ledger: Arc<dyn LedgerAppend>,
    replicas: RwLock<Option<Arc<dyn ReplicaFetch>>>,
    shard_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl StorageManager {
    pub fn new(
        config: &NodeConfig,
        provider: Arc<dyn KeyProvider>,
        kem_key: KeyId,
        ledger: Arc<dyn LedgerAppend>,
    ) -> Result<Self, StorageError> {
        for kind in Particle::ALL {
            std::fs::create_dir_all(config.shard_backup_dir(kind))?;
        }
        Ok(Self {
            root: config.root.clone(),
            node_id: config.node_id.clone(),
            provider,
            kem_key,
            ledger,
            replicas: RwLock::new(None),
            shard_locks: Mutex::new(HashMap::new()),
        })
    }

    /// Attach the peer replica source used as the repair fallback.
    pub async fn attach_replicas(&self, replicas: Arc<dyn ReplicaFetch>) {
        *self.replicas.write().await = Some(replicas);
    }

    fn kind_dir(&self, kind: Particle) -> PathBuf {
        self.root.join("shards").join(kind.as_str())
    }

    fn dat_path(&self, kind: Particle, id: &str) -> PathBuf {
        self.kind_dir(kind).join(format!("{id}.dat"))
    }

    fn meta_path(&self, kind: Particle, id: &str) -> PathBuf {
        self.kind_dir(kind).join(format!("{id}.dat.meta"))
    }

    fn backup_path(&self, kind: Particle, id: &str) -> PathBuf {
        self.kind_dir(kind).join("backups").join(format!("{id}.dat"))
    }

    async fn shard_lock(&self, kind: Particle, id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.shard_locks.lock().await;
        locks
            .entry(format!("{kind}/{id}"))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn write_atomic(path: &PathBuf, data: &[u8]) -> Result<(), StorageError> {
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, data)?;
        let file = std::fs::File::open(&tmp)?;
        file.sync_all()?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    fn read_sidecar(&self, kind: Particle, id: &str) -> Result<ShardSidecar, StorageError> {
        let path = self.meta_path(kind, id);
        if !path.exists() {
            return Err(StorageError::ShardNotFound(id.to_string()));
        }
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Persist a shard and its sidecar. Re-storing an identical shard is a
    /// no-op success; a different ciphertext under an existing id is
    /// `DuplicateShard`.
    pub async fn store(&self, shard: &Shard, custom: serde_json::Value) -> Result<(), StorageError> {
        let lock = self.shard_lock(shard.kind, &shard.shard_id).await;
        let _guard = lock.lock().await;

        let dat = self.dat_path(shard.kind, &shard.shard_id);
        let new_hash = shard.ciphertext_hash();
        if dat.exists() {
            let sidecar = self.read_sidecar(shard.kind, &shard.shard_id)?;
            if sidecar.ciphertext_hash == new_hash {
                debug!(shard_id = %shard.shard_id, "duplicate store, no write");
                return Ok(());
            }
            return Err(StorageError::DuplicateShard(shard.shard_id.clone()));
        }

        let sidecar = ShardSidecar {
            id: shard.shard_id.clone(),
            kind: shard.kind,
            ciphertext_hash: new_hash,
            wrapped_key: b64().encode(&shard.wrapped_key),
            iv: b64().encode(&shard.iv),
            auth_tag: b64().encode(&shard.auth_tag),
            custom,
            timestamp: chrono::Utc::now(),
        };

        Self::write_atomic(&dat, &shard.ciphertext)?;
        Self::write_atomic(
            &self.meta_path(shard.kind, &shard.shard_id),
            &serde_json::to_vec_pretty(&sidecar)?,
        )?;
        // Redundant local copy for the repair path
        Self::write_atomic(
            &self.backup_path(shard.kind, &shard.shard_id),
            &shard.ciphertext,
        )?;
        Ok(())
    }

    /// Read back a shard's plaintext. Hash is checked before any key
    /// material is touched.
    pub async fn retrieve(&self, kind: Particle, id: &str) -> Result<Vec<u8>, StorageError> {
        let lock = self.shard_lock(kind, id).await;
        let _guard = lock.lock().await;

        let sidecar = self.read_sidecar(kind, id)?;
        let ciphertext = std::fs::read(self.dat_path(kind, id))?;
        if atomvault_pqc::sha256_hex(&ciphertext) != sidecar.ciphertext_hash {
            return Err(StorageError::TamperDetected(id.to_string()));
        }

        let wrapped_bytes = b64()
            .decode(&sidecar.wrapped_key)
            .map_err(|_| StorageError::AuthTagInvalid(id.to_string()))?;
        let wrapped: SealedBlob = bincode::deserialize(&wrapped_bytes)
            .map_err(|_| StorageError::AuthTagInvalid(id.to_string()))?;
        let shared = self
            .provider
            .decapsulate(&self.kem_key, &wrapped.kem_ciphertext)
            .await?;
        let data_key = atomvault_pqc::aes_gcm_decrypt(&shared, &wrapped.payload)
            .map_err(|_| StorageError::AuthTagInvalid(id.to_string()))?;

        let payload = atomvault_pqc::EncryptedPayload {
            ciphertext,
            iv: b64()
                .decode(&sidecar.iv)
                .map_err(|_| StorageError::AuthTagInvalid(id.to_string()))?,
            auth_tag: b64()
                .decode(&sidecar.auth_tag)
                .map_err(|_| StorageError::AuthTagInvalid(id.to_string()))?,
        };
        atomvault_pqc::aes_gcm_decrypt(&data_key, &payload)
            .map_err(|_| StorageError::AuthTagInvalid(id.to_string()))
    }

    /// Hash-only integrity check used by the audit loop.
    pub async fn verify_integrity(&self, kind: Particle, id: &str) -> Result<bool, StorageError> {
        let sidecar = self.read_sidecar(kind, id)?;
        let ciphertext = std::fs::read(self.dat_path(kind, id))?;
        Ok(atomvault_pqc::sha256_hex(&ciphertext) == sidecar.ciphertext_hash)
    }

    /// Raw ciphertext triple for serving replica requests.
    pub async fn raw_parts(
        &self,
        kind: Particle,
        id: &str,
    ) -> Result<(Vec<u8>, Vec<u8>, Vec<u8>), StorageError> {
        let sidecar = self.read_sidecar(kind, id)?;
        let ciphertext = std::fs::read(self.dat_path(kind, id))?;
        if atomvault_pqc::sha256_hex(&ciphertext) != sidecar.ciphertext_hash {
            return Err(StorageError::TamperDetected(id.to_string()));
        }
        let iv = b64()
            .decode(&sidecar.iv)
            .map_err(|_| StorageError::AuthTagInvalid(id.to_string()))?;
        let auth_tag = b64()
            .decode(&sidecar.auth_tag)
            .map_err(|_| StorageError::AuthTagInvalid(id.to_string()))?;
        Ok((ciphertext, iv, auth_tag))
    }

    /// Restore a corrupted shard from the backup copy or a peer replica and
    /// log the repair.
    pub async fn repair(&self, kind: Particle, id: &str) -> Result<RepairOutcome, StorageError> {
        let lock = self.shard_lock(kind, id).await;
        let _guard = lock.lock().await;

        let sidecar = self.read_sidecar(kind, id)?;

        // Local backup first
        let backup = self.backup_path(kind, id);
        if backup.exists() {
            let data = std::fs::read(&backup)?;
            if atomvault_pqc::sha256_hex(&data) == sidecar.ciphertext_hash {
                Self::write_atomic(&self.dat_path(kind, id), &data)?;
                self.log_repair(kind, id, "backup", &sidecar.ciphertext_hash)
                    .await;
                info!(shard_id = id, "shard repaired from backup");
                return Ok(RepairOutcome::Repaired("backup".into()));
            }
            warn!(shard_id = id, "backup copy is also corrupted");
        }

        // Peer replica fallback
        let replicas = self.replicas.read().await.clone();
        if let Some(replicas) = replicas {
            if let Some((ciphertext, _iv, _tag, source)) =
                replicas.fetch_replica(kind, id).await
            {
                if atomvault_pqc::sha256_hex(&ciphertext) == sidecar.ciphertext_hash {
                    Self::write_atomic(&self.dat_path(kind, id), &ciphertext)?;
                    Self::write_atomic(&self.backup_path(kind, id), &ciphertext)?;
                    self.log_repair(kind, id, &source, &sidecar.ciphertext_hash)
                        .await;
                    info!(shard_id = id, %source, "shard repaired from peer replica");
                    return Ok(RepairOutcome::Repaired(source));
                }
                warn!(shard_id = id, %source, "peer replica hash mismatch");
            }
        }

        Ok(RepairOutcome::Unrecoverable)
    }

    async fn log_repair(&self, kind: Particle, id: &str, source: &str, hash: &str) {
        let body = RecordBody::ShardRepair(ShardRepairBody {
            shard_id: id.to_string(),
            kind,
            node_id: self.node_id.clone(),
            source: source.to_string(),
            ciphertext_hash: hash.to_string(),
        });
        if let Err(e) = self.ledger.append_blocking(body).await {
            // Repair itself succeeded; the record retries on the next sweep
            warn!(shard_id = id, error = %e, "repair record append failed");
        }
    }

    /// Remove a shard, its sidecar and backup. Used by fission rollback.
    pub async fn remove(&self, kind: Particle, id: &str) -> Result<(), StorageError> {
        let lock = self.shard_lock(kind, id).await;
        let _guard = lock.lock().await;
        for path in [
            self.dat_path(kind, id),
            self.meta_path(kind, id),
            self.backup_path(kind, id),
        ] {
            if path.exists() {
                std::fs::remove_file(path)?;
            }
        }
        Ok(())
    }

    pub async fn exists(&self, kind: Particle, id: &str) -> bool {
        self.dat_path(kind, id).exists()
    }

    /// Shard ids present in one store.
    pub fn list(&self, kind: Particle) -> Result<Vec<ShardId>, StorageError> {
        let mut out = Vec::new();
        for entry in std::fs::read_dir(self.kind_dir(kind))? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(id) = name.strip_suffix(".dat") {
                out.push(id.to_string());
            }
        }
        out.sort();
        Ok(out)
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }
}

/// Narrow integrity capability consensus peers use to confirm shard records.
#[async_trait]
pub trait ShardIntegrity: Send + Sync {
    async fn confirm(&self, kind: Particle, shard_id: &str) -> bool;
}

#[async_trait]
impl ShardIntegrity for StorageManager {
    async fn confirm(&self, kind: Particle, shard_id: &str) -> bool {
        match self.verify_integrity(kind, shard_id).await {
            Ok(ok) => ok,
            // A shard this node does not hold cannot be disconfirmed here
            Err(StorageError::ShardNotFound(_)) => true,
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::BitAtom;
    use crate::shard::ShardEncoder;
    use atomvault_pqc::{InMemoryKeyProvider, KeyKind};

    struct NoopLedger;

    #[async_trait]
    impl LedgerAppend for NoopLedger {
        async fn append_blocking(
            &self,
            body: RecordBody,
        ) -> Result<crate::ledger::LedgerRecord, LedgerError> {
            let hash = crate::ledger::LedgerRecord::compute_hash(0, &"0".repeat(64), 0, &body, 0);
            Ok(crate::ledger::LedgerRecord {
                index: 0,
                previous_hash: "0".repeat(64),
                timestamp: 0,
                kind: body.kind(),
                body,
                hash,
                nonce: 0,
                signature: crate::types::NodeSignature::empty(),
            })
        }
    }

    async fn test_setup() -> (StorageManager, ShardEncoder, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = NodeConfig::default();
        config.root = dir.path().to_path_buf();

        let provider = Arc::new(InMemoryKeyProvider::new());
        let signing = provider.generate_keypair(KeyKind::Signing).await.unwrap();
        let kem = provider.generate_keypair(KeyKind::Kem).await.unwrap();

        let storage = StorageManager::new(
            &config,
            provider.clone(),
            kem.clone(),
            Arc::new(NoopLedger),
        )
        .unwrap();
        let encoder = ShardEncoder::new(provider, signing, kem).await.unwrap();
        (storage, encoder, dir)
    }

    async fn sample_shard(encoder: &ShardEncoder, bit: u8) -> Shard {
        let atom = BitAtom::new(bit, Particle::Neutron, 0, 1, 250.0);
        encoder.encode(&atom, &"atm1aa".to_string()).await.unwrap()
    }

    #[tokio::test]
    async fn test_store_retrieve_roundtrip() {
        let (storage, encoder, _dir) = test_setup().await;
        let shard = sample_shard(&encoder, 1).await;
        storage.store(&shard, serde_json::json!({})).await.unwrap();

        let plain = storage
            .retrieve(Particle::Neutron, &shard.shard_id)
            .await
            .unwrap();
        assert_eq!(plain, vec![1]);
    }

    #[tokio::test]
    async fn test_idempotent_store() {
        let (storage, encoder, dir) = test_setup().await;
        let shard = sample_shard(&encoder, 0).await;
        storage.store(&shard, serde_json::json!({})).await.unwrap();
        storage.store(&shard, serde_json::json!({})).await.unwrap();

        let files: Vec<_> = std::fs::read_dir(dir.path().join("shards").join("neutron"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
            .collect();
        // exactly one .dat and one .dat.meta
        assert_eq!(files.len(), 2);
    }

    #[tokio::test]
    async fn test_conflicting_store_rejected() {
        let (storage, encoder, _dir) = test_setup().await;
        let shard = sample_shard(&encoder, 0).await;
        storage.store(&shard, serde_json::json!({})).await.unwrap();

        // Same id, different ciphertext
        let mut other = sample_shard(&encoder, 0).await;
        other.shard_id = shard.shard_id.clone();
        let err = storage.store(&other, serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, StorageError::DuplicateShard(_)));
    }

    #[tokio::test]
    async fn test_tamper_detected_before_decrypt() {
        let (storage, encoder, dir) = test_setup().await;
        let shard = sample_shard(&encoder, 1).await;
        storage.store(&shard, serde_json::json!({})).await.unwrap();

        let dat = dir
            .path()
            .join("shards")
            .join("neutron")
            .join(format!("{}.dat", shard.shard_id));
        let mut data = std::fs::read(&dat).unwrap();
        data[0] ^= 0xff;
        std::fs::write(&dat, &data).unwrap();

        let err = storage
            .retrieve(Particle::Neutron, &shard.shard_id)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::TamperDetected(_)));
        assert!(!storage
            .verify_integrity(Particle::Neutron, &shard.shard_id)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_repair_from_backup() {
        let (storage, encoder, dir) = test_setup().await;
        let shard = sample_shard(&encoder, 1).await;
        storage.store(&shard, serde_json::json!({})).await.unwrap();

        let dat = dir
            .path()
            .join("shards")
            .join("neutron")
            .join(format!("{}.dat", shard.shard_id));
        std::fs::write(&dat, b"garbage").unwrap();

        let outcome = storage
            .repair(Particle::Neutron, &shard.shard_id)
            .await
            .unwrap();
        assert_eq!(outcome, RepairOutcome::Repaired("backup".into()));

        let plain = storage
            .retrieve(Particle::Neutron, &shard.shard_id)
            .await
            .unwrap();
        assert_eq!(plain, vec![1]);
    }

    #[tokio::test]
    async fn test_unrecoverable_when_backup_also_bad() {
        let (storage, encoder, dir) = test_setup().await;
        let shard = sample_shard(&encoder, 1).await;
        storage.store(&shard, serde_json::json!({})).await.unwrap();

        for sub in ["", "backups"] {
            let path = dir
                .path()
                .join("shards")
                .join("neutron")
                .join(sub)
                .join(format!("{}.dat", shard.shard_id));
            std::fs::write(path, b"garbage").unwrap();
        }

        let outcome = storage
            .repair(Particle::Neutron, &shard.shard_id)
            .await
            .unwrap();
        assert_eq!(outcome, RepairOutcome::Unrecoverable);
    }

    #[tokio::test]
    async fn test_remove_clears_all_files() {
        let (storage, encoder, _dir) = test_setup().await;
        let shard = sample_shard(&encoder, 1).await;
        storage.store(&shard, serde_json::json!({})).await.unwrap();
        storage.remove(Particle::Neutron, &shard.shard_id).await.unwrap();
        assert!(!storage.exists(Particle::Neutron, &shard.shard_id).await);
        assert!(storage.list(Particle::Neutron).unwrap().is_empty());
    }
}
