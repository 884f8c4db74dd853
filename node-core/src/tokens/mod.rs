//! Proof-of-Access token layer
//!
//! Every state-changing operation presents a PoA token. A token is minted
//! with a fresh Dilithium5 keypair, its id sealed to the owner's Kyber1024
//! key; validation re-opens the envelope and re-checks the signature, state
//! and expiry. All known tokens live in `<root>/tokens/tokens.json`; every
//! validated use is appended to `<root>/tokens/usage.log`.

use crate::config::NodeConfig;
use crate::ledger::{LedgerAppend, LedgerError, RecordBody, TokenLifecycleBody, TokenMintBody};
use crate::types::NodeId;
use async_trait::async_trait;
use atomvault_pqc::{KeyId, KeyKind, KeyProvider, KeyRef, SealedBlob};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

/// The encrypted form a caller presents: the token id sealed to the owner's
/// KEM key.
pub type SealedEnvelope = SealedBlob;

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("Token not found: {0}")]
    TokenNotFound(String),
    #[error("Token signature invalid: {0}")]
    SignatureInvalid(String),
    #[error("Envelope does not open to token id: {0}")]
    EnvelopeMismatch(String),
    #[error("Token expired: {0}")]
    Expired(String),
    #[error("Token already redeemed: {0}")]
    AlreadyRedeemed(String),
    #[error("Token revoked: {0}")]
    Revoked(String),
    #[error("Key provider failure: {0}")]
    KeyProvider(#[from] atomvault_pqc::KeyProviderError),
    #[error("Token store I/O failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("Token store malformed: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Lifecycle state of a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenState {
    Active,
    Redeemed,
    Revoked,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenMetadata {
    pub label: Option<String>,
    /// Single-use tokens fail validation after redemption
    pub single_use: bool,
}

/// A minted Proof-of-Access credential.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoaToken {
    pub token_id: Uuid,
    pub owner_node_id: NodeId,
    /// Dilithium5 public key the token signature verifies under
    pub public_key: Vec<u8>,
    /// Signature over the canonical token bytes
    pub signature: Vec<u8>,
    pub not_after: Option<DateTime<Utc>>,
    pub metadata: TokenMetadata,
    pub state: TokenState,
    pub minted_at: DateTime<Utc>,
}

impl PoaToken {
    /// Canonical bytes the token keypair signs.
    pub fn signing_bytes(token_id: &Uuid, owner_node_id: &str) -> Vec<u8> {
        format!("poa:{token_id}:{owner_node_id}").into_bytes()
    }
}

/// Successful validation result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub valid: bool,
    pub owner_node_id: NodeId,
    pub metadata: TokenMetadata,
}

/// Narrow validation capability other modules receive.
#[async_trait]
pub trait TokenValidate: Send + Sync {
    /// Full validation with the sealed envelope.
    async fn validate(
        &self,
        token_id: &str,
        envelope: &SealedEnvelope,
    ) -> Result<ValidationOutcome, TokenError>;

    /// Record-level revalidation without an envelope: signature, state and
    /// expiry. Used by consensus peers that cannot open the owner envelope.
    async fn validate_record(&self, token_id: &str) -> Result<ValidationOutcome, TokenError>;
}

/// Narrow state-lookup capability used by fork replay.
#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn state_of(&self, token_id: &str) -> Option<TokenState>;
}

/// Owner of the token registry and usage log.
pub struct TokenManager {
    node_id: NodeId,
    tokens_file: PathBuf,
    usage_file: PathBuf,
    provider: Arc<dyn KeyProvider>,
    /// Node KEM key the owner envelopes seal to
    kem_key: KeyId,
    ledger: Arc<dyn LedgerAppend>,
    tokens: RwLock<HashMap<Uuid, PoaToken>>,
    token_locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl TokenManager {
    pub async fn new(
        config: &NodeConfig,
        provider: Arc<dyn KeyProvider>,
        kem_key: KeyId,
        ledger: Arc<dyn LedgerAppend>,
    ) -> Result<Self, TokenError> {
        let tokens_file = config.tokens_file();
        let usage_file = config.usage_log_file();
        if let Some(parent) = tokens_file.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let tokens = if tokens_file.exists() {
            let text = std::fs::read_to_string(&tokens_file)?;
            let list: Vec<PoaToken> = serde_json::from_str(&text)?;
            list.into_iter().map(|t| (t.token_id, t)).collect()
        } else {
            HashMap::new()
        };

        Ok(Self {
            node_id: config.node_id.clone(),
            tokens_file,
            usage_file,
            provider,
            kem_key,
            ledger,
            tokens: RwLock::new(tokens),
            token_locks: Mutex::new(HashMap::new()),
        })
    }

    async fn token_lock(&self, token_id: Uuid) -> Arc<Mutex<()>> {
        let mut locks = self.token_locks.lock().await;
        locks
            .entry(token_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Atomic rewrite of tokens.json from the in-memory registry.
    async fn persist(&self) -> Result<(), TokenError> {
        let tokens = self.tokens.read().await;
        let mut list: Vec<&PoaToken> = tokens.values().collect();
        list.sort_by_key(|t| t.token_id);
        let data = serde_json::to_vec_pretty(&list)?;
        let tmp = self.tokens_file.with_extension("json.tmp");
        std::fs::write(&tmp, &data)?;
        std::fs::rename(&tmp, &self.tokens_file)?;
        Ok(())
    }

    /// Mint a token for `owner_node_id`, sealing the id to this node's KEM
    /// key, and log the mint on the ledger. The token becomes visible only
    /// after the ledger record finalizes.
    pub async fn mint(
        &self,
        owner_node_id: &str,
        metadata: TokenMetadata,
    ) -> Result<(Uuid, SealedEnvelope), TokenError> {
        self.mint_with_expiry(owner_node_id, metadata, None).await
    }

    pub async fn mint_with_expiry(
        &self,
        owner_node_id: &str,
        metadata: TokenMetadata,
        not_after: Option<DateTime<Utc>>,
    ) -> Result<(Uuid, SealedEnvelope), TokenError> {
        let token_id = Uuid::new_v4();
        let lock = self.token_lock(token_id).await;
        let _guard = lock.lock().await;

        let signing_key = self.provider.generate_keypair(KeyKind::Signing).await?;
        let public_key = self.provider.public_key(&signing_key).await?;
        let signature = self
            .provider
            .sign(&signing_key, &PoaToken::signing_bytes(&token_id, owner_node_id))
            .await?;

        let kem_public = self.provider.public_key(&self.kem_key).await?;
        let envelope = atomvault_pqc::seal_blob(&kem_public, token_id.to_string().as_bytes())
            .map_err(atomvault_pqc::KeyProviderError::from)?;

        let token = PoaToken {
            token_id,
            owner_node_id: owner_node_id.to_string(),
            public_key: public_key.clone(),
            signature,
            not_after,
            metadata,
            state: TokenState::Active,
            minted_at: Utc::now(),
        };

        // Ledger first: a rejected mint leaves no token behind
        self.ledger
            .append_blocking(RecordBody::TokenMint(TokenMintBody {
                token_id: token_id.to_string(),
                owner_node_id: owner_node_id.to_string(),
                public_key,
                registrar: self.node_id.clone(),
            }))
            .await?;

        self.tokens.write().await.insert(token_id, token);
        self.persist().await?;
        info!(%token_id, owner_node_id, "token minted");
        Ok((token_id, envelope))
    }

    fn parse_id(token_id: &str) -> Result<Uuid, TokenError> {
        Uuid::parse_str(token_id).map_err(|_| TokenError::TokenNotFound(token_id.to_string()))
    }

    async fn lookup(&self, token_id: &str) -> Result<PoaToken, TokenError> {
        let id = Self::parse_id(token_id)?;
        let tokens = self.tokens.read().await;
        tokens
            .get(&id)
            .cloned()
            .ok_or_else(|| TokenError::TokenNotFound(token_id.to_string()))
    }

    fn check_state(token: &PoaToken) -> Result<(), TokenError> {
        match token.state {
            TokenState::Active => {}
            TokenState::Redeemed => {
                return Err(TokenError::AlreadyRedeemed(token.token_id.to_string()))
            }
            TokenState::Revoked => return Err(TokenError::Revoked(token.token_id.to_string())),
        }
        if let Some(not_after) = token.not_after {
            if not_after <= Utc::now() {
                return Err(TokenError::Expired(token.token_id.to_string()));
            }
        }
        Ok(())
    }

    async fn check_signature(&self, token: &PoaToken) -> Result<(), TokenError> {
        let valid = self
            .provider
            .verify(
                KeyRef::PublicKey(&token.public_key),
                &PoaToken::signing_bytes(&token.token_id, &token.owner_node_id),
                &token.signature,
            )
            .await?;
        if !valid {
            return Err(TokenError::SignatureInvalid(token.token_id.to_string()));
        }
        Ok(())
    }

    /// Append one line to the usage log. Never gates the operation; failures
    /// are logged and swallowed.
    pub async fn record_usage(&self, token_id: &str, operation: &str) {
        let line = format!("{} {} {}\n", crate::types::now_ts(), token_id, operation);
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.usage_file)
            .and_then(|mut f| f.write_all(line.as_bytes()));
        if let Err(e) = result {
            warn!(token_id, error = %e, "usage log append failed");
        }
    }

    /// Mark a token consumed. Subsequent validations fail with
    /// `AlreadyRedeemed`.
    pub async fn redeem(&self, token_id: &str) -> Result<(), TokenError> {
        let id = Self::parse_id(token_id)?;
        let lock = self.token_lock(id).await;
        let _guard = lock.lock().await;

        let token = self.lookup(token_id).await?;
        Self::check_state(&token)?;

        self.ledger
            .append_blocking(RecordBody::TokenRedeem(TokenLifecycleBody {
                token_id: token_id.to_string(),
                owner_node_id: token.owner_node_id.clone(),
                registrar: self.node_id.clone(),
            }))
            .await?;

        if let Some(stored) = self.tokens.write().await.get_mut(&id) {
            stored.state = TokenState::Redeemed;
        }
        self.persist().await?;
        self.record_usage(token_id, "redeem").await;
        Ok(())
    }

    /// Revoke a token. Subsequent validations fail with `Revoked`.
    pub async fn revoke(&self, token_id: &str) -> Result<(), TokenError> {
        let id = Self::parse_id(token_id)?;
        let lock = self.token_lock(id).await;
        let _guard = lock.lock().await;

        let token = self.lookup(token_id).await?;
        if token.state == TokenState::Revoked {
            return Err(TokenError::Revoked(token_id.to_string()));
        }

        self.ledger
            .append_blocking(RecordBody::TokenRevoke(TokenLifecycleBody {
                token_id: token_id.to_string(),
                owner_node_id: token.owner_node_id.clone(),
                registrar: self.node_id.clone(),
            }))
            .await?;

        if let Some(stored) = self.tokens.write().await.get_mut(&id) {
            stored.state = TokenState::Revoked;
        }
        self.persist().await?;
        self.record_usage(token_id, "revoke").await;
        Ok(())
    }
}

#[async_trait]
impl TokenValidate for TokenManager {
    async fn validate(
        &self,
        token_id: &str,
        envelope: &SealedEnvelope,
    ) -> Result<ValidationOutcome, TokenError> {
        let token = self.lookup(token_id).await?;
        Self::check_state(&token)?;

        // Envelope must open to exactly this token id
        let shared = self
            .provider
            .decapsulate(&self.kem_key, &envelope.kem_ciphertext)
            .await?;
        let opened = atomvault_pqc::aes_gcm_decrypt(&shared, &envelope.payload)
            .map_err(|_| TokenError::EnvelopeMismatch(token_id.to_string()))?;
        if opened != token.token_id.to_string().as_bytes() {
            return Err(TokenError::EnvelopeMismatch(token_id.to_string()));
        }

        self.check_signature(&token).await?;
        self.record_usage(token_id, "validate").await;

        Ok(ValidationOutcome {
            valid: true,
            owner_node_id: token.owner_node_id,
            metadata: token.metadata,
        })
    }

    async fn validate_record(&self, token_id: &str) -> Result<ValidationOutcome, TokenError> {
        let token = self.lookup(token_id).await?;
        Self::check_state(&token)?;
        self.check_signature(&token).await?;
        Ok(ValidationOutcome {
            valid: true,
            owner_node_id: token.owner_node_id,
            metadata: token.metadata,
        })
    }
}

#[async_trait]
impl TokenStore for TokenManager {
    async fn state_of(&self, token_id: &str) -> Option<TokenState> {
        let id = Uuid::parse_str(token_id).ok()?;
        let tokens = self.tokens.read().await;
        tokens.get(&id).map(|t| t.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::LedgerRecord;

    /// Ledger stub that finalizes everything instantly.
    struct AcceptLedger;

    #[async_trait]
    impl LedgerAppend for AcceptLedger {
        async fn append_blocking(&self, body: RecordBody) -> Result<LedgerRecord, LedgerError> {
            let hash = LedgerRecord::compute_hash(0, &"0".repeat(64), 0, &body, 0);
            Ok(LedgerRecord {
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

    /// Ledger stub that rejects everything.
    struct RejectLedger;

    #[async_trait]
    impl LedgerAppend for RejectLedger {
        async fn append_blocking(&self, _body: RecordBody) -> Result<LedgerRecord, LedgerError> {
            Err(LedgerError::ConsensusRejected("vote failed".into()))
        }
    }

    async fn test_manager(ledger: Arc<dyn LedgerAppend>) -> (TokenManager, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = NodeConfig::default();
        config.root = dir.path().to_path_buf();
        let provider = Arc::new(atomvault_pqc::InMemoryKeyProvider::new());
        let kem = provider.generate_keypair(KeyKind::Kem).await.unwrap();
        let manager = TokenManager::new(&config, provider, kem, ledger)
            .await
            .unwrap();
        (manager, dir)
    }

    #[tokio::test]
    async fn test_mint_then_validate() {
        let (manager, _dir) = test_manager(Arc::new(AcceptLedger)).await;
        let (token_id, envelope) = manager
            .mint("node-A", TokenMetadata::default())
            .await
            .unwrap();

        let outcome = manager
            .validate(&token_id.to_string(), &envelope)
            .await
            .unwrap();
        assert!(outcome.valid);
        assert_eq!(outcome.owner_node_id, "node-A");
    }

    #[tokio::test]
    async fn test_unknown_token_not_found() {
        let (manager, _dir) = test_manager(Arc::new(AcceptLedger)).await;
        let (_, envelope) = manager
            .mint("node-A", TokenMetadata::default())
            .await
            .unwrap();
        let err = manager
            .validate(&Uuid::new_v4().to_string(), &envelope)
            .await
            .unwrap_err();
        assert!(matches!(err, TokenError::TokenNotFound(_)));
    }

    #[tokio::test]
    async fn test_foreign_envelope_mismatch() {
        let (manager, _dir) = test_manager(Arc::new(AcceptLedger)).await;
        let (token_a, _) = manager
            .mint("node-A", TokenMetadata::default())
            .await
            .unwrap();
        let (_, envelope_b) = manager
            .mint("node-B", TokenMetadata::default())
            .await
            .unwrap();

        let err = manager
            .validate(&token_a.to_string(), &envelope_b)
            .await
            .unwrap_err();
        assert!(matches!(err, TokenError::EnvelopeMismatch(_)));
    }

    #[tokio::test]
    async fn test_redeem_blocks_revalidation() {
        let (manager, _dir) = test_manager(Arc::new(AcceptLedger)).await;
        let (token_id, envelope) = manager
            .mint("node-A", TokenMetadata { label: None, single_use: true })
            .await
            .unwrap();

        manager.redeem(&token_id.to_string()).await.unwrap();
        let err = manager
            .validate(&token_id.to_string(), &envelope)
            .await
            .unwrap_err();
        assert!(matches!(err, TokenError::AlreadyRedeemed(_)));

        // Double redemption is also rejected
        let err = manager.redeem(&token_id.to_string()).await.unwrap_err();
        assert!(matches!(err, TokenError::AlreadyRedeemed(_)));
    }

    #[tokio::test]
    async fn test_revoke_blocks_revalidation() {
        let (manager, _dir) = test_manager(Arc::new(AcceptLedger)).await;
        let (token_id, envelope) = manager
            .mint("node-A", TokenMetadata::default())
            .await
            .unwrap();

        manager.revoke(&token_id.to_string()).await.unwrap();
        let err = manager
            .validate(&token_id.to_string(), &envelope)
            .await
            .unwrap_err();
        assert!(matches!(err, TokenError::Revoked(_)));
    }

    #[tokio::test]
    async fn test_expired_token_rejected() {
        let (manager, _dir) = test_manager(Arc::new(AcceptLedger)).await;
        let (token_id, envelope) = manager
            .mint_with_expiry(
                "node-A",
                TokenMetadata::default(),
                Some(Utc::now() - chrono::Duration::seconds(5)),
            )
            .await
            .unwrap();
        let err = manager
            .validate(&token_id.to_string(), &envelope)
            .await
            .unwrap_err();
        assert!(matches!(err, TokenError::Expired(_)));
    }

    #[tokio::test]
    async fn test_rejected_mint_leaves_no_token() {
        let (manager, dir) = test_manager(Arc::new(RejectLedger)).await;
        let err = manager
            .mint("node-A", TokenMetadata::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TokenError::Ledger(LedgerError::ConsensusRejected(_))
        ));
        assert!(!dir.path().join("tokens").join("tokens.json").exists());
        assert!(manager.state_of(&Uuid::new_v4().to_string()).await.is_none());
    }

    #[tokio::test]
    async fn test_usage_log_appends() {
        let (manager, dir) = test_manager(Arc::new(AcceptLedger)).await;
        let (token_id, envelope) = manager
            .mint("node-A", TokenMetadata::default())
            .await
            .unwrap();
        manager
            .validate(&token_id.to_string(), &envelope)
            .await
            .unwrap();
        manager.record_usage(&token_id.to_string(), "fission").await;

        let log = std::fs::read_to_string(dir.path().join("tokens").join("usage.log")).unwrap();
        assert!(log.contains("validate"));
        assert!(log.contains("fission"));
    }
}
