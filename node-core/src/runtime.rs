//! Node runtime
//!
//! Wires the subsystems together for one node: key material, ledger with
//! consensus attached, token registry, shard storage, pipelines and the
//! audit loop. Single-node deployments run with solo consensus and local
//! placement; `enable_federation` switches to the overlay, quorum consensus
//! and round-robin placement.

use crate::config::NodeConfig;
use crate::consensus::{BlockValidator, ConsensusEngine, SoloConsensus};
use crate::error::EngineError;
use crate::ledger::LedgerManager;
use crate::overlay::{OverlayConfig, PeerOverlay};
use crate::pipeline::fission::{FissionConfig, FissionPipeline};
use crate::pipeline::fusion::{FusionConfig, FusionPipeline};
use crate::placement::{RoundRobinPlacement, StaticPlacement};
use crate::shard::ShardEncoder;
use crate::storage::audit::AuditLoop;
use crate::storage::StorageManager;
use crate::tokens::TokenManager;
use crate::types::{NodeIdentity, NodeRole};
use atomvault_pqc::{InMemoryKeyProvider, KeyId, KeyKind, KeyProvider};
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

/// Node identity keypairs persisted across restarts (local provider only).
#[derive(Serialize, Deserialize)]
struct NodeKeysFile {
    signing_public: String,
    signing_secret: String,
    kem_public: String,
    kem_secret: String,
}

/// A fully wired node.
pub struct NodeRuntime {
    pub config: NodeConfig,
    pub provider: Arc<dyn KeyProvider>,
    pub signing_key: KeyId,
    pub kem_key: KeyId,
    pub ledger: Arc<LedgerManager>,
    pub tokens: Arc<TokenManager>,
    pub storage: Arc<StorageManager>,
    pub encoder: Arc<ShardEncoder>,
    pub fission: FissionPipeline,
    pub fusion: FusionPipeline,
    pub overlay: Option<Arc<PeerOverlay>>,
    cancel_tx: watch::Sender<bool>,
    cancel_rx: watch::Receiver<bool>,
}

impl NodeRuntime {
    /// Build a single-node runtime: solo consensus, local placement.
    pub async fn initialize(config: NodeConfig) -> Result<Self, EngineError> {
        config.validate()?;
        std::fs::create_dir_all(config.root.join("config"))
            .map_err(|e| EngineError::Internal(e.to_string()))?;
        std::fs::create_dir_all(config.recovery_dir())
            .map_err(|e| EngineError::Internal(e.to_string()))?;

        let (provider, signing_key, kem_key) = Self::load_keys(&config).await?;

        let ledger = Arc::new(
            LedgerManager::new(&config, provider.clone(), signing_key.clone())
                .await
                .map_err(EngineError::from)?,
        );
        let tokens = Arc::new(
            TokenManager::new(&config, provider.clone(), kem_key.clone(), ledger.clone())
                .await
                .map_err(EngineError::from)?,
        );
        let storage = Arc::new(
            StorageManager::new(&config, provider.clone(), kem_key.clone(), ledger.clone())
                .map_err(EngineError::from)?,
        );

        let validator = BlockValidator::new(
            ledger.clone(),
            tokens.clone(),
            storage.clone(),
            config.pow_difficulty,
            config.pow_kinds.clone(),
        );
        ledger
            .attach_consensus(Arc::new(SoloConsensus::new(validator)))
            .await;

        let encoder = Arc::new(
            ShardEncoder::new(provider.clone(), signing_key.clone(), kem_key.clone())
                .await
                .map_err(|e| EngineError::Internal(e.to_string()))?,
        );

        let fission = FissionPipeline::new(
            FissionConfig::from_node_config(&config),
            tokens.clone(),
            encoder.clone(),
            Arc::new(StaticPlacement::local_only(config.node_id.clone())),
            storage.clone(),
            ledger.clone(),
            None,
        );
        let fusion = FusionPipeline::new(
            FusionConfig::from_node_config(&config),
            tokens.clone(),
            ledger.clone(),
            ledger.clone(),
            storage.clone(),
        );

        let (cancel_tx, cancel_rx) = watch::channel(false);
        info!(node_id = %config.node_id, root = %config.root.display(), "node runtime ready");
        Ok(Self {
            config,
            provider,
            signing_key,
            kem_key,
            ledger,
            tokens,
            storage,
            encoder,
            fission,
            fusion,
            overlay: None,
            cancel_tx,
            cancel_rx,
        })
    }

    /// Local key provider with identity keys persisted under
    /// `<root>/config/node_keys.json`.
    async fn load_keys(
        config: &NodeConfig,
    ) -> Result<(Arc<dyn KeyProvider>, KeyId, KeyId), EngineError> {
        if config.key_provider == "hsm" {
            // Vendor adapter supplies key handles; without it the provider
            // surfaces Unavailable on first use
            let provider = atomvault_pqc::provider::from_env();
            let signing = provider
                .generate_keypair(KeyKind::Signing)
                .await
                .map_err(|e| EngineError::Unavailable(e.to_string()))?;
            let kem = provider
                .generate_keypair(KeyKind::Kem)
                .await
                .map_err(|e| EngineError::Unavailable(e.to_string()))?;
            return Ok((provider, signing, kem));
        }

        let provider = Arc::new(InMemoryKeyProvider::new());
        let keys_path = config.root.join("config").join("node_keys.json");
        let b64 = base64::engine::general_purpose::STANDARD;

        if keys_path.exists() {
            let text = std::fs::read_to_string(&keys_path)
                .map_err(|e| EngineError::Internal(e.to_string()))?;
            let file: NodeKeysFile = serde_json::from_str(&text)
                .map_err(|e| EngineError::Configuration(crate::config::ConfigError::Invalid(
                    format!("node_keys.json malformed: {e}"),
                )))?;
            let decode = |s: &str| {
                b64.decode(s).map_err(|e| {
                    EngineError::Configuration(crate::config::ConfigError::Invalid(format!(
                        "node_keys.json corrupt: {e}"
                    )))
                })
            };
            let signing = provider
                .import(
                    KeyKind::Signing,
                    decode(&file.signing_public)?,
                    decode(&file.signing_secret)?,
                )
                .await
                .map_err(|e| EngineError::Internal(e.to_string()))?;
            let kem = provider
                .import(KeyKind::Kem, decode(&file.kem_public)?, decode(&file.kem_secret)?)
                .await
                .map_err(|e| EngineError::Internal(e.to_string()))?;
            return Ok((provider, signing, kem));
        }

        let (signing_public, signing_secret) = atomvault_pqc::dilithium_keypair();
        let (kem_public, kem_secret) = atomvault_pqc::kyber_keypair();
        let file = NodeKeysFile {
            signing_public: b64.encode(&signing_public),
            signing_secret: b64.encode(&signing_secret),
            kem_public: b64.encode(&kem_public),
            kem_secret: b64.encode(&kem_secret),
        };
        std::fs::write(
            &keys_path,
            serde_json::to_vec_pretty(&file).map_err(|e| EngineError::Internal(e.to_string()))?,
        )
        .map_err(|e| EngineError::Internal(e.to_string()))?;

        let signing = provider
            .import(KeyKind::Signing, signing_public, signing_secret)
            .await
            .map_err(|e| EngineError::Internal(e.to_string()))?;
        let kem = provider
            .import(KeyKind::Kem, kem_public, kem_secret)
            .await
            .map_err(|e| EngineError::Internal(e.to_string()))?;
        info!("node identity keys generated");
        Ok((provider, signing, kem))
    }

    /// Switch to federated mode: start the overlay, attach quorum consensus
    /// and round-robin placement. `attested_token_id` must be a valid PoA
    /// for this node's id.
    pub async fn enable_federation(
        &mut self,
        role: NodeRole,
        attested_token_id: String,
    ) -> Result<Arc<PeerOverlay>, EngineError> {
        let signing_public = self
            .provider
            .public_key(&self.signing_key)
            .await
            .map_err(|e| EngineError::Internal(e.to_string()))?;
        let identity = NodeIdentity {
            node_id: self.config.node_id.clone(),
            role,
            public_key: signing_public,
            endpoints: vec![self.config.listen_addr.clone()],
            attested_token_id,
        };

        let overlay = Arc::new(
            PeerOverlay::new(
                OverlayConfig::from_node_config(&self.config),
                identity,
                self.provider.clone(),
                self.kem_key.clone(),
                self.tokens.clone(),
                self.storage.clone(),
                self.ledger.clone(),
            )
            .await
            .map_err(|e| EngineError::Unavailable(e.to_string()))?,
        );
        overlay
            .start()
            .await
            .map_err(|e| EngineError::Unavailable(e.to_string()))?;
        self.storage.attach_replicas(overlay.clone()).await;

        let validator = BlockValidator::new(
            self.ledger.clone(),
            self.tokens.clone(),
            self.storage.clone(),
            self.config.pow_difficulty,
            self.config.pow_kinds.clone(),
        );
        let engine = Arc::new(
            ConsensusEngine::new(
                validator,
                overlay.clone(),
                self.tokens.clone(),
                self.ledger.clone(),
                self.ledger.clone(),
                self.provider.clone(),
                self.signing_key.clone(),
                self.config.node_id.clone(),
                (self.config.quorum_numerator, self.config.quorum_denominator),
                Duration::from_millis(self.config.consensus_round_timeout_ms),
            )
            .await
            .map_err(|e| EngineError::Internal(e.to_string()))?,
        );
        engine.start();
        self.ledger.attach_consensus(engine).await;

        let oracle = Arc::new(RoundRobinPlacement::new(
            self.config.node_id.clone(),
            overlay.clone(),
        ));
        self.fission = FissionPipeline::new(
            FissionConfig::from_node_config(&self.config),
            self.tokens.clone(),
            self.encoder.clone(),
            oracle,
            self.storage.clone(),
            self.ledger.clone(),
            Some(overlay.clone()),
        );

        self.overlay = Some(overlay.clone());
        info!("federation enabled");
        Ok(overlay)
    }

    /// Spawn the background audit loop with the configured cadence.
    pub fn spawn_audit(&self) -> (tokio::task::JoinHandle<()>, watch::Sender<bool>) {
        AuditLoop::new(
            self.storage.clone(),
            self.ledger.clone(),
            Duration::from_secs(self.config.audit_interval_secs),
            Duration::from_millis(self.config.audit_shard_timeout_ms),
        )
        .spawn()
    }

    /// One immediate audit sweep (the CLI `audit` command).
    pub async fn audit_once(&self) -> crate::storage::audit::SweepReport {
        AuditLoop::new(
            self.storage.clone(),
            self.ledger.clone(),
            Duration::from_secs(self.config.audit_interval_secs),
            Duration::from_millis(self.config.audit_shard_timeout_ms),
        )
        .sweep()
        .await
    }

    /// Cancellation receiver handed to pipeline calls.
    pub fn cancel_signal(&self) -> watch::Receiver<bool> {
        self.cancel_rx.clone()
    }

    /// Cancel all in-flight pipeline work.
    pub fn cancel_all(&self) {
        let _ = self.cancel_tx.send(true);
    }
}
