//! Node configuration
//!
//! Defaults, then `<root>/config/node.toml`, then environment variables;
//! later layers override earlier ones. Malformed configuration is fatal at
//! startup.

use crate::types::RecordKind;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Config file unreadable: {0}")]
    Io(#[from] std::io::Error),
    #[error("Config file malformed: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Node configuration loaded from file and environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Data root; every on-disk artifact lives under it
    pub root: PathBuf,
    pub node_id: String,
    /// `local` or `hsm`
    pub key_provider: String,

    // Overlay configuration
    pub listen_addr: String,
    pub dns_seed: Option<String>,
    pub max_peers: usize,
    pub fallback_peers: Vec<String>,
    pub heartbeat_interval_secs: u64,

    // Ledger configuration
    /// Leading zero hex nibbles required of mined record hashes; 0 disables
    pub pow_difficulty: usize,
    /// Record kinds that must be mined
    pub pow_kinds: Vec<RecordKind>,

    // Consensus configuration
    pub quorum_numerator: u32,
    pub quorum_denominator: u32,
    pub consensus_round_timeout_ms: u64,

    // Pipeline configuration
    pub max_inflight_shards: usize,
    pub retry_max_attempts: u32,
    pub retry_backoff_ms: u64,

    // Timeouts
    pub token_validate_timeout_ms: u64,
    pub shard_request_timeout_ms: u64,
    pub audit_shard_timeout_ms: u64,
    pub audit_interval_secs: u64,

    // Logging
    pub log_level: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./data"),
            node_id: "node-local".to_string(),
            key_provider: "local".to_string(),
            listen_addr: "127.0.0.1:7600".to_string(),
            dns_seed: None,
            max_peers: 64,
            fallback_peers: Vec::new(),
            heartbeat_interval_secs: 30,
            pow_difficulty: 2,
            pow_kinds: vec![RecordKind::TokenMint, RecordKind::ShardCreate],
            quorum_numerator: 2,
            quorum_denominator: 3,
            consensus_round_timeout_ms: 5_000,
            max_inflight_shards: 1024,
            retry_max_attempts: 3,
            retry_backoff_ms: 200,
            token_validate_timeout_ms: 2_000,
            shard_request_timeout_ms: 5_000,
            audit_shard_timeout_ms: 30_000,
            audit_interval_secs: 3_600,
            log_level: "info".to_string(),
        }
    }
}

impl NodeConfig {
    /// Load configuration: defaults, node.toml under the resolved root, then
    /// environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let root = std::env::var("NODE_ROOT").unwrap_or_else(|_| "./data".to_string());
        let mut config = Self::from_file(Path::new(&root).join("config").join("node.toml"))?;
        config.root = PathBuf::from(root);
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Read the toml layer; a missing file yields defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }

    fn apply_env(&mut self) {
        if let Ok(node_id) = std::env::var("NODE_ID") {
            self.node_id = node_id;
        }
        if let Ok(provider) = std::env::var("KEY_PROVIDER") {
            self.key_provider = provider;
        }
        if let Ok(seed) = std::env::var("DNS_SEED") {
            if !seed.is_empty() {
                self.dns_seed = Some(seed);
            }
        }
        if let Ok(max_peers) = std::env::var("MAX_PEERS") {
            match max_peers.parse::<usize>() {
                Ok(n) => self.max_peers = n,
                Err(_) => warn!("invalid MAX_PEERS value: {max_peers}"),
            }
        }
        if let Ok(level) = std::env::var("LOG_LEVEL") {
            self.log_level = level;
        }
        if let Ok(difficulty) = std::env::var("POW_DIFFICULTY") {
            match difficulty.parse::<usize>() {
                Ok(n) => self.pow_difficulty = n,
                Err(_) => warn!("invalid POW_DIFFICULTY value: {difficulty}"),
            }
        }
    }

    /// Validate the configuration. Called once at startup; failures are fatal.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_id.is_empty() {
            return Err(ConfigError::Invalid("node_id cannot be empty".into()));
        }
        match self.key_provider.as_str() {
            "local" | "hsm" => {}
            other => {
                return Err(ConfigError::Invalid(format!(
                    "key_provider must be 'local' or 'hsm', got '{other}'"
                )))
            }
        }
        if self.quorum_denominator == 0 || self.quorum_numerator > self.quorum_denominator {
            return Err(ConfigError::Invalid(format!(
                "quorum {}/{} is not a valid fraction",
                self.quorum_numerator, self.quorum_denominator
            )));
        }
        if self.max_inflight_shards == 0 {
            return Err(ConfigError::Invalid(
                "max_inflight_shards must be positive".into(),
            ));
        }
        if self.pow_difficulty > 64 {
            return Err(ConfigError::Invalid(
                "pow_difficulty exceeds hash length".into(),
            ));
        }
        Ok(())
    }

    /// Whether records of `kind` must carry proof-of-work.
    pub fn pow_required(&self, kind: RecordKind) -> bool {
        self.pow_difficulty > 0 && self.pow_kinds.contains(&kind)
    }

    // --- on-disk layout ----------------------------------------------------

    pub fn shards_dir(&self, kind: crate::types::Particle) -> PathBuf {
        self.root.join("shards").join(kind.as_str())
    }

    pub fn shard_backup_dir(&self, kind: crate::types::Particle) -> PathBuf {
        self.shards_dir(kind).join("backups")
    }

    pub fn ledger_dir(&self) -> PathBuf {
        self.root.join("ledger")
    }

    pub fn tokens_file(&self) -> PathBuf {
        self.root.join("tokens").join("tokens.json")
    }

    pub fn usage_log_file(&self) -> PathBuf {
        self.root.join("tokens").join("usage.log")
    }

    pub fn recovery_dir(&self) -> PathBuf {
        self.root.join("recovery")
    }
}
