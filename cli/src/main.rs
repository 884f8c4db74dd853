//! avctl, the AtomVault node CLI.
//!
//! Exit codes: 0 success, 2 unauthorized, 3 tamper/integrity,
//! 4 under-replicated, 5 consensus failure, 1 anything else.

use anyhow::{Context, Result};
use atomvault_node::config::NodeConfig;
use atomvault_node::pipeline::{FissionRequest, PipelineError};
use atomvault_node::tokens::{SealedEnvelope, TokenMetadata, TokenValidate};
use atomvault_node::{EngineError, NodeRuntime};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "avctl", version, about = "AtomVault secure-storage node CLI")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Decompose a payload into distributed shards
    Fission {
        /// Payload file, or `-` for stdin
        #[arg(long)]
        payload: String,
        /// Proof-of-Access file (JSON with token_id and envelope)
        #[arg(long)]
        poa: PathBuf,
    },
    /// Reconstruct a payload from its shards
    Fusion {
        #[arg(long)]
        address: String,
        #[arg(long)]
        poa: PathBuf,
        /// Output file for the reconstructed payload
        #[arg(long)]
        out: PathBuf,
    },
    /// Mint a Proof-of-Access token
    Mint {
        /// Owner node id
        #[arg(long)]
        owner: String,
        /// Where to write the PoA file (stdout when omitted)
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Validate a token against its sealed envelope
    Validate {
        #[arg(long)]
        token: String,
        /// PoA file carrying the envelope
        #[arg(long)]
        envelope: PathBuf,
    },
    /// Run one audit sweep over the local shard stores
    Audit,
}

/// On-disk Proof-of-Access credential.
#[derive(Serialize, Deserialize)]
struct PoaFile {
    token_id: String,
    envelope: SealedEnvelope,
}

fn exit_code(err: &EngineError) -> i32 {
    match err {
        EngineError::Unauthorized(_) => 2,
        EngineError::Integrity(_) => 3,
        EngineError::UnderReplicated { .. } => 4,
        EngineError::ConsensusRejected(_) => 5,
        _ => 1,
    }
}

fn load_poa(path: &PathBuf) -> Result<PoaFile> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read PoA file {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("PoA file {} malformed", path.display()))
}

async fn run(runtime: &NodeRuntime, command: Command) -> Result<(), EngineError> {
    match command {
        Command::Fission { payload, poa } => {
            let poa = load_poa(&poa).map_err(|e| EngineError::Internal(e.to_string()))?;
            let bytes = if payload == "-" {
                let mut buf = Vec::new();
                std::io::stdin()
                    .read_to_end(&mut buf)
                    .map_err(|e| EngineError::Internal(e.to_string()))?;
                buf
            } else {
                std::fs::read(&payload).map_err(|e| EngineError::Internal(e.to_string()))?
            };

            let request = FissionRequest::from_bytes(bytes, poa.token_id, poa.envelope);
            let cancel = runtime.cancel_signal();
            match runtime.fission.run(request, &cancel).await {
                Ok(outcome) => {
                    println!(
                        "{}",
                        serde_json::to_string_pretty(&outcome)
                            .map_err(|e| EngineError::Internal(e.to_string()))?
                    );
                    Ok(())
                }
                Err(PipelineError::UnderReplicated {
                    achieved,
                    required,
                    outcome,
                }) => {
                    println!(
                        "{}",
                        serde_json::to_string_pretty(&*outcome)
                            .map_err(|e| EngineError::Internal(e.to_string()))?
                    );
                    Err(EngineError::UnderReplicated { achieved, required })
                }
                Err(e) => Err(e.into()),
            }
        }
        Command::Fusion { address, poa, out } => {
            let poa = load_poa(&poa).map_err(|e| EngineError::Internal(e.to_string()))?;
            let cancel = runtime.cancel_signal();
            let outcome = runtime
                .fusion
                .run(&address, &poa.token_id, &poa.envelope, &cancel)
                .await?;
            std::fs::write(&out, &outcome.payload)
                .map_err(|e| EngineError::Internal(e.to_string()))?;
            eprintln!(
                "recovered {} bytes from {} shards to {}",
                outcome.payload.len(),
                outcome.shard_count,
                out.display()
            );
            Ok(())
        }
        Command::Mint { owner, out } => {
            let (token_id, envelope) = runtime
                .tokens
                .mint(&owner, TokenMetadata::default())
                .await?;
            let file = PoaFile {
                token_id: token_id.to_string(),
                envelope,
            };
            let text = serde_json::to_string_pretty(&file)
                .map_err(|e| EngineError::Internal(e.to_string()))?;
            match out {
                Some(path) => {
                    std::fs::write(&path, text)
                        .map_err(|e| EngineError::Internal(e.to_string()))?;
                    eprintln!("token {token_id} written to {}", path.display());
                }
                None => println!("{text}"),
            }
            Ok(())
        }
        Command::Validate { token, envelope } => {
            let poa = load_poa(&envelope).map_err(|e| EngineError::Internal(e.to_string()))?;
            let outcome = runtime.tokens.validate(&token, &poa.envelope).await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&outcome)
                    .map_err(|e| EngineError::Internal(e.to_string()))?
            );
            Ok(())
        }
        Command::Audit => {
            let report = runtime.audit_once().await;
            println!(
                "scanned {} corrupted {} repaired {} unrecoverable {}",
                report.scanned, report.corrupted, report.repaired, report.unrecoverable
            );
            if report.unrecoverable > 0 {
                return Err(EngineError::Integrity(format!(
                    "{} shards unrecoverable",
                    report.unrecoverable
                )));
            }
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match NodeConfig::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.log_level.clone())),
        )
        .with_writer(std::io::stderr)
        .init();

    let runtime = match NodeRuntime::initialize(config).await {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("startup failed: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = run(&runtime, cli.command).await {
        eprintln!("error: {e}");
        std::process::exit(exit_code(&e));
    }
}
