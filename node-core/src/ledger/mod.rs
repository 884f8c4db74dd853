//! Ledger Manager
//!
//! Append-only, tamper-evident record of every token and shard operation.
//! Each address owns one JSON ledger file rewritten atomically on append;
//! the file is the system of record for audit. Appends become durable only
//! after the consensus layer finalizes the containing block.

pub mod records;

use crate::config::NodeConfig;
use crate::types::{Address, Hash, NodeId, NodeSignature, RecordKind, Timestamp};
use async_trait::async_trait;
use atomvault_pqc::{KeyId, KeyProvider};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex, RwLock};
use tracing::{debug, info, warn};

pub use records::{
    AuditBody, Block, FusionBody, LedgerRecord, RecordBody, ShardCreateBody, ShardMoveBody,
    ShardRef, ShardRemoveBody, ShardRepairBody, TokenLifecycleBody, TokenMintBody,
};

/// Ledger address collecting one node's token lifecycle records.
pub fn token_ledger_address(node_id: &str) -> Address {
    format!("token-registry-{node_id}")
}

/// Ledger address collecting one node's audit and repair records.
pub fn audit_ledger_address(node_id: &str) -> Address {
    format!("audit-{node_id}")
}

const GENESIS_HASH_LEN: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("Ledger I/O failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("Ledger file malformed: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("Consensus rejected block: {0}")]
    ConsensusRejected(String),
    #[error("Record {index} hash mismatch")]
    HashMismatch { index: u64 },
    #[error("Record {index} signature invalid")]
    SignatureInvalid { index: u64 },
    #[error("Record {index} misses proof-of-work")]
    PowUnsatisfied { index: u64 },
    #[error("Broken chain link at index {index}")]
    BrokenLink { index: u64 },
    #[error("Key provider failure: {0}")]
    KeyProvider(#[from] atomvault_pqc::KeyProviderError),
    #[error("Append cancelled")]
    Cancelled,
}

/// Outcome of a consensus round over one proposed block.
#[derive(Debug, Clone, PartialEq)]
pub enum ConsensusDecision {
    Accepted,
    Rejected(String),
}

/// Narrow consensus capability the ledger depends on; the consensus engine
/// implements it, the ledger never imports the engine.
#[async_trait]
pub trait ConsensusSubmit: Send + Sync {
    async fn submit(&self, block: Block) -> ConsensusDecision;
}

/// Narrow append capability other modules receive. The target address is
/// derived from the body, so a record cannot land on a foreign chain.
#[async_trait]
pub trait LedgerAppend: Send + Sync {
    async fn append_blocking(&self, body: RecordBody) -> Result<LedgerRecord, LedgerError>;
}

/// Narrow read capability for consensus validation and fusion.
#[async_trait]
pub trait LedgerView: Send + Sync {
    async fn head(&self, address: &str) -> Result<Option<(u64, Hash)>, LedgerError>;
    async fn records(&self, address: &str) -> Result<Vec<LedgerRecord>, LedgerError>;
}

/// Narrow rewrite capability used only by fork resolution after a longer
/// chain has been fully validated.
#[async_trait]
pub trait LedgerReplace: Send + Sync {
    async fn replace_chain(
        &self,
        address: &str,
        records: Vec<LedgerRecord>,
    ) -> Result<(), LedgerError>;
}

/// Resolution of an asynchronous append.
#[derive(Debug)]
pub enum AppendOutcome {
    Finalized(LedgerRecord),
    Rejected(String),
}

/// Handle returned by [`LedgerManager::append_async`].
pub struct AppendHandle {
    rx: oneshot::Receiver<AppendOutcome>,
}

impl AppendHandle {
    /// Wait for finalization or rejection.
    pub async fn resolve(self) -> AppendOutcome {
        self.rx
            .await
            .unwrap_or_else(|_| AppendOutcome::Rejected("append task dropped".into()))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct LedgerMetadata {
    address: Address,
    head_index: u64,
    head_hash: Hash,
    record_count: u64,
    updated_at: Timestamp,
}

/// Append-only ledger over `<root>/ledger/<address>.json` files.
pub struct LedgerManager {
    dir: PathBuf,
    node_id: NodeId,
    provider: Arc<dyn KeyProvider>,
    signing_key: KeyId,
    signing_public: Vec<u8>,
    pow_difficulty: usize,
    pow_kinds: Vec<RecordKind>,
    consensus: RwLock<Option<Arc<dyn ConsensusSubmit>>>,
    heads: RwLock<HashMap<Address, (u64, Hash)>>,
    address_locks: Mutex<HashMap<Address, Arc<Mutex<()>>>>,
}

impl LedgerManager {
    pub async fn new(
        config: &NodeConfig,
        provider: Arc<dyn KeyProvider>,
        signing_key: KeyId,
    ) -> Result<Self, LedgerError> {
        let dir = config.ledger_dir();
        std::fs::create_dir_all(&dir)?;
        let signing_public = provider.public_key(&signing_key).await?;
        Ok(Self {
            dir,
            node_id: config.node_id.clone(),
            provider,
            signing_key,
            signing_public,
            pow_difficulty: config.pow_difficulty,
            pow_kinds: config.pow_kinds.clone(),
            consensus: RwLock::new(None),
            heads: RwLock::new(HashMap::new()),
            address_locks: Mutex::new(HashMap::new()),
        })
    }

    /// Attach the consensus layer. Before attachment appends finalize after
    /// local verification only (single-node mode).
    pub async fn attach_consensus(&self, consensus: Arc<dyn ConsensusSubmit>) {
        *self.consensus.write().await = Some(consensus);
    }

    pub fn signing_public_key(&self) -> &[u8] {
        &self.signing_public
    }

    fn pow_required(&self, kind: RecordKind) -> bool {
        self.pow_difficulty > 0 && self.pow_kinds.contains(&kind)
    }

    fn ledger_file(&self, address: &str) -> PathBuf {
        self.dir.join(format!("{address}.json"))
    }

    fn metadata_file(&self, address: &str) -> PathBuf {
        self.dir.join(format!("{address}-metadata.json"))
    }

    async fn address_lock(&self, address: &str) -> Arc<Mutex<()>> {
        let mut locks = self.address_locks.lock().await;
        locks
            .entry(address.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn load_records(&self, address: &str) -> Result<Vec<LedgerRecord>, LedgerError> {
        let path = self.ledger_file(address);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    async fn load_head(&self, address: &str) -> Result<Option<(u64, Hash)>, LedgerError> {
        {
            let heads = self.heads.read().await;
            if let Some(head) = heads.get(address) {
                return Ok(Some(head.clone()));
            }
        }
        let records = self.load_records(address)?;
        match records.last() {
            Some(last) => {
                let head = (last.index, last.hash.clone());
                self.heads
                    .write()
                    .await
                    .insert(address.to_string(), head.clone());
                Ok(Some(head))
            }
            None => Ok(None),
        }
    }

    /// Write-then-rename the ledger file and its metadata sidecar.
    fn persist(&self, address: &str, records: &[LedgerRecord]) -> Result<(), LedgerError> {
        let path = self.ledger_file(address);
        let tmp = path.with_extension("json.tmp");
        let data = serde_json::to_vec_pretty(records)?;
        std::fs::write(&tmp, &data)?;
        let file = std::fs::File::open(&tmp)?;
        file.sync_all()?;
        std::fs::rename(&tmp, &path)?;

        if let Some(last) = records.last() {
            let meta = LedgerMetadata {
                address: address.to_string(),
                head_index: last.index,
                head_hash: last.hash.clone(),
                record_count: records.len() as u64,
                updated_at: crate::types::now_ts(),
            };
            let meta_path = self.metadata_file(address);
            let meta_tmp = meta_path.with_extension("json.tmp");
            std::fs::write(&meta_tmp, serde_json::to_vec_pretty(&meta)?)?;
            std::fs::rename(&meta_tmp, &meta_path)?;
        }
        Ok(())
    }

    /// Build a record at the current head: fill linkage, mine the nonce when
    /// the kind requires proof-of-work, and sign the hash.
    async fn build_record(
        &self,
        address: &str,
        body: RecordBody,
    ) -> Result<LedgerRecord, LedgerError> {
        let kind = body.kind();
        let (index, previous_hash) = match self.load_head(address).await? {
            Some((head_index, head_hash)) => (head_index + 1, head_hash),
            None => (0, "0".repeat(GENESIS_HASH_LEN)),
        };
        let timestamp = crate::types::now_ts();

        let mut nonce = 0u64;
        let hash = loop {
            let hash = LedgerRecord::compute_hash(index, &previous_hash, timestamp, &body, nonce);
            if !self.pow_required(kind) || hash.bytes().take(self.pow_difficulty).all(|b| b == b'0')
            {
                break hash;
            }
            nonce += 1;
        };

        let signature = self.provider.sign(&self.signing_key, hash.as_bytes()).await?;
        Ok(LedgerRecord {
            index,
            previous_hash,
            timestamp,
            kind,
            body,
            hash,
            nonce,
            signature: NodeSignature {
                signature,
                public_key: self.signing_public.clone(),
            },
        })
    }

    fn build_block(&self, record: &LedgerRecord) -> Block {
        let records = vec![record.clone()];
        let atomic_metadata = Block::summarize(&records);
        let timestamp = record.timestamp;
        let hash = Block::compute_hash(
            record.index,
            &record.previous_hash,
            timestamp,
            &records,
            0,
        );
        Block {
            index: record.index,
            previous_hash: record.previous_hash.clone(),
            timestamp,
            records,
            atomic_metadata,
            hash,
            nonce: 0,
            signature: NodeSignature::empty(),
        }
    }

    /// Verify a single record: hash recomputation, signature, proof-of-work.
    pub fn verify(&self, record: &LedgerRecord) -> Result<(), LedgerError> {
        if !record.hash_matches() {
            return Err(LedgerError::HashMismatch {
                index: record.index,
            });
        }
        if self.pow_required(record.kind) && !record.satisfies_pow(self.pow_difficulty) {
            return Err(LedgerError::PowUnsatisfied {
                index: record.index,
            });
        }
        if !atomvault_pqc::dilithium_verify(
            record.hash.as_bytes(),
            &record.signature.signature,
            &record.signature.public_key,
        ) {
            return Err(LedgerError::SignatureInvalid {
                index: record.index,
            });
        }
        Ok(())
    }

    /// Verify records and linkage over `range` (inclusive); the whole chain
    /// when `range` is `None`.
    pub async fn verify_chain(
        &self,
        address: &str,
        range: Option<(u64, u64)>,
    ) -> Result<(), LedgerError> {
        let records = self.load_records(address)?;
        let mut previous: Option<&LedgerRecord> = None;
        for record in &records {
            if let Some((lo, hi)) = range {
                if record.index < lo || record.index > hi {
                    previous = Some(record);
                    continue;
                }
            }
            self.verify(record)?;
            if let Some(prev) = previous {
                if record.previous_hash != prev.hash || record.index != prev.index + 1 {
                    return Err(LedgerError::BrokenLink {
                        index: record.index,
                    });
                }
            } else if record.index > 0 {
                // Range started mid-chain; linkage of the first record is
                // checked against the stored predecessor if present.
                if let Some(stored_prev) = records.iter().find(|r| r.index + 1 == record.index) {
                    if record.previous_hash != stored_prev.hash {
                        return Err(LedgerError::BrokenLink {
                            index: record.index,
                        });
                    }
                }
            }
            previous = Some(record);
        }
        Ok(())
    }

    /// Append a record and wait for consensus finalization. The target
    /// address is the one the body binds to.
    pub async fn append(&self, body: RecordBody) -> Result<LedgerRecord, LedgerError> {
        let address = body.ledger_address();
        let lock = self.address_lock(&address).await;
        // Head stays consistent for the full append duration
        let _guard = lock.lock().await;

        let record = self.build_record(&address, body).await?;
        let block = self.build_block(&record);

        let consensus = self.consensus.read().await.clone();
        match consensus {
            Some(consensus) => match consensus.submit(block).await {
                ConsensusDecision::Accepted => {}
                ConsensusDecision::Rejected(reason) => {
                    warn!(%address, %reason, "consensus rejected block");
                    return Err(LedgerError::ConsensusRejected(reason));
                }
            },
            None => {
                // Single-node mode: the proposer validates its own block
                self.verify(&record)?;
            }
        }

        let mut records = self.load_records(&address)?;
        records.push(record.clone());
        self.persist(&address, &records)?;
        self.heads
            .write()
            .await
            .insert(address.clone(), (record.index, record.hash.clone()));

        debug!(
            %address,
            index = record.index,
            kind = %record.kind,
            "ledger record finalized"
        );
        Ok(record)
    }

    /// Append without waiting; the handle resolves when the record finalizes
    /// or the block is rejected.
    pub fn append_async(self: &Arc<Self>, body: RecordBody) -> AppendHandle {
        let (tx, rx) = oneshot::channel();
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = match manager.append(body).await {
                Ok(record) => AppendOutcome::Finalized(record),
                Err(LedgerError::ConsensusRejected(reason)) => AppendOutcome::Rejected(reason),
                Err(e) => AppendOutcome::Rejected(e.to_string()),
            };
            let _ = tx.send(outcome);
        });
        AppendHandle { rx }
    }

    /// Addresses with a ledger file on disk.
    pub fn addresses(&self) -> Result<Vec<Address>, LedgerError> {
        let mut out = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(address) = name.strip_suffix(".json") {
                if !address.ends_with("-metadata") && !address.ends_with(".tmp") {
                    out.push(address.to_string());
                }
            }
        }
        out.sort();
        Ok(out)
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }
}

#[async_trait]
impl LedgerAppend for LedgerManager {
    async fn append_blocking(&self, body: RecordBody) -> Result<LedgerRecord, LedgerError> {
        self.append(body).await
    }
}

#[async_trait]
impl LedgerReplace for LedgerManager {
    async fn replace_chain(
        &self,
        address: &str,
        records: Vec<LedgerRecord>,
    ) -> Result<(), LedgerError> {
        let lock = self.address_lock(address).await;
        let _guard = lock.lock().await;
        self.persist(address, &records)?;
        match records.last() {
            Some(last) => {
                self.heads
                    .write()
                    .await
                    .insert(address.to_string(), (last.index, last.hash.clone()));
            }
            None => {
                self.heads.write().await.remove(address);
            }
        }
        info!(address, records = records.len(), "chain replaced after fork resolution");
        Ok(())
    }
}

#[async_trait]
impl LedgerView for LedgerManager {
    async fn head(&self, address: &str) -> Result<Option<(u64, Hash)>, LedgerError> {
        self.load_head(address).await
    }

    async fn records(&self, address: &str) -> Result<Vec<LedgerRecord>, LedgerError> {
        self.load_records(address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atomvault_pqc::{InMemoryKeyProvider, KeyKind};

    async fn test_ledger() -> (Arc<LedgerManager>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = NodeConfig::default();
        config.root = dir.path().to_path_buf();
        let provider = Arc::new(InMemoryKeyProvider::new());
        let signing = provider.generate_keypair(KeyKind::Signing).await.unwrap();
        let ledger = LedgerManager::new(&config, provider, signing).await.unwrap();
        (Arc::new(ledger), dir)
    }

    fn audit_body(scanned: u64) -> RecordBody {
        RecordBody::Audit(AuditBody {
            node_id: "node-A".into(),
            scanned,
            corrupted: 0,
            repaired: 0,
            unrecoverable: 0,
        })
    }

    #[tokio::test]
    async fn test_append_links_records() {
        let (ledger, _dir) = test_ledger().await;
        let r0 = ledger.append(audit_body(1)).await.unwrap();
        let r1 = ledger.append(audit_body(2)).await.unwrap();

        assert_eq!(r0.index, 0);
        assert_eq!(r0.previous_hash, "0".repeat(64));
        assert_eq!(r1.index, 1);
        assert_eq!(r1.previous_hash, r0.hash);

        ledger
            .verify_chain(&audit_ledger_address("node-A"), None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_pow_mined_for_configured_kinds() {
        let (ledger, _dir) = test_ledger().await;
        let body = RecordBody::TokenMint(TokenMintBody {
            token_id: "t-1".into(),
            owner_node_id: "node-A".into(),
            public_key: vec![1, 2, 3],
            registrar: "node-A".into(),
        });
        let record = ledger.append(body).await.unwrap();
        assert!(record.satisfies_pow(2), "hash {} lacks pow", record.hash);
        ledger.verify(&record).unwrap();

        // Audit records are not in the default pow set
        let audit = ledger.append(audit_body(1)).await.unwrap();
        ledger.verify(&audit).unwrap();
    }

    #[tokio::test]
    async fn test_tampered_record_fails_verify() {
        let (ledger, _dir) = test_ledger().await;
        let mut record = ledger.append(audit_body(1)).await.unwrap();
        record.nonce += 1;
        assert!(matches!(
            ledger.verify(&record),
            Err(LedgerError::HashMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_append_async_resolves() {
        let (ledger, _dir) = test_ledger().await;
        let handle = ledger.append_async(audit_body(1));
        match handle.resolve().await {
            AppendOutcome::Finalized(record) => assert_eq!(record.index, 0),
            AppendOutcome::Rejected(reason) => panic!("rejected: {reason}"),
        }
    }

    #[tokio::test]
    async fn test_rejecting_consensus_leaves_no_record() {
        struct RejectAll;
        #[async_trait]
        impl ConsensusSubmit for RejectAll {
            async fn submit(&self, _block: Block) -> ConsensusDecision {
                ConsensusDecision::Rejected("previous hash unknown".into())
            }
        }

        let (ledger, _dir) = test_ledger().await;
        ledger.attach_consensus(Arc::new(RejectAll)).await;
        let err = ledger.append(audit_body(1)).await.unwrap_err();
        assert!(matches!(err, LedgerError::ConsensusRejected(_)));
        assert!(ledger
            .records(&audit_ledger_address("node-A"))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_persisted_file_is_system_of_record() {
        let (ledger, dir) = test_ledger().await;
        ledger.append(audit_body(1)).await.unwrap();
        let address = audit_ledger_address("node-A");
        let path = dir.path().join("ledger").join(format!("{address}.json"));
        let text = std::fs::read_to_string(path).unwrap();
        let parsed: Vec<LedgerRecord> = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed.len(), 1);
        assert!(dir
            .path()
            .join("ledger")
            .join(format!("{address}-metadata.json"))
            .exists());
    }
}
