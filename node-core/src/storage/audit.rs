//! Background audit loop
//!
//! Scans every local shard on a fixed cadence, repairs corrupted copies and
//! writes one audit record per sweep. The loop is cancellable and never
//! blocks store/retrieve: each check takes the same per-shard lock any other
//! caller would.

use crate::ledger::{AuditBody, LedgerAppend, RecordBody};
use crate::storage::{RepairOutcome, StorageManager};
use crate::types::{NodeId, Particle};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Summary of one audit sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub scanned: u64,
    pub corrupted: u64,
    pub repaired: u64,
    pub unrecoverable: u64,
}

pub struct AuditLoop {
    storage: Arc<StorageManager>,
    ledger: Arc<dyn LedgerAppend>,
    node_id: NodeId,
    interval: Duration,
    per_shard_timeout: Duration,
}

impl AuditLoop {
    pub fn new(
        storage: Arc<StorageManager>,
        ledger: Arc<dyn LedgerAppend>,
        interval: Duration,
        per_shard_timeout: Duration,
    ) -> Self {
        let node_id = storage.node_id().to_string();
        Self {
            storage,
            ledger,
            node_id,
            interval,
            per_shard_timeout,
        }
    }

    /// Run one full scan over all three stores.
    pub async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();
        for kind in Particle::ALL {
            let ids = match self.storage.list(kind) {
                Ok(ids) => ids,
                Err(e) => {
                    warn!(%kind, error = %e, "audit cannot list store");
                    continue;
                }
            };
            for id in ids {
                report.scanned += 1;
                let healthy = tokio::time::timeout(
                    self.per_shard_timeout,
                    self.storage.verify_integrity(kind, &id),
                )
                .await;
                let healthy = match healthy {
                    Ok(Ok(ok)) => ok,
                    Ok(Err(e)) => {
                        warn!(shard_id = %id, error = %e, "integrity check failed");
                        false
                    }
                    Err(_) => {
                        warn!(shard_id = %id, "integrity check timed out");
                        continue;
                    }
                };
                if healthy {
                    continue;
                }

                report.corrupted += 1;
                match self.storage.repair(kind, &id).await {
                    Ok(RepairOutcome::Repaired(source)) => {
                        report.repaired += 1;
                        info!(shard_id = %id, %source, "audit repaired shard");
                    }
                    Ok(RepairOutcome::Unrecoverable) => {
                        report.unrecoverable += 1;
                        warn!(shard_id = %id, "audit found unrecoverable shard");
                    }
                    Err(e) => {
                        report.unrecoverable += 1;
                        warn!(shard_id = %id, error = %e, "repair failed");
                    }
                }
            }
        }

        let body = RecordBody::Audit(AuditBody {
            node_id: self.node_id.clone(),
            scanned: report.scanned,
            corrupted: report.corrupted,
            repaired: report.repaired,
            unrecoverable: report.unrecoverable,
        });
        if let Err(e) = self.ledger.append_blocking(body).await {
            warn!(error = %e, "audit record append failed");
        }
        report
    }

    /// Spawn the cadenced loop. Dropping the returned sender (or sending
    /// `true`) stops it at the next checkpoint.
    pub fn spawn(self) -> (JoinHandle<()>, watch::Sender<bool>) {
        let (tx, mut rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            loop {
                let sleep = tokio::time::sleep(self.interval);
                tokio::pin!(sleep);
                tokio::select! {
                    _ = &mut sleep => {}
                    changed = rx.changed() => {
                        if changed.is_err() || *rx.borrow() {
                            info!("audit loop stopping");
                            return;
                        }
                        continue;
                    }
                }
                let report = self.sweep().await;
                info!(
                    scanned = report.scanned,
                    corrupted = report.corrupted,
                    repaired = report.repaired,
                    "audit sweep complete"
                );
            }
        });
        (handle, tx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::BitAtom;
    use crate::config::NodeConfig;
    use crate::ledger::LedgerError;
    use crate::shard::ShardEncoder;
    use async_trait::async_trait;
    use atomvault_pqc::{InMemoryKeyProvider, KeyKind, KeyProvider};
    use std::sync::atomic::{AtomicU64, Ordering};

    struct CountingLedger {
        appended: AtomicU64,
    }

    #[async_trait]
    impl LedgerAppend for CountingLedger {
        async fn append_blocking(
            &self,
            body: RecordBody,
        ) -> Result<crate::ledger::LedgerRecord, LedgerError> {
            self.appended.fetch_add(1, Ordering::SeqCst);
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

    #[tokio::test]
    async fn test_sweep_repairs_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = NodeConfig::default();
        config.root = dir.path().to_path_buf();

        let provider = Arc::new(InMemoryKeyProvider::new());
        let signing = provider.generate_keypair(KeyKind::Signing).await.unwrap();
        let kem = provider.generate_keypair(KeyKind::Kem).await.unwrap();
        let ledger = Arc::new(CountingLedger {
            appended: AtomicU64::new(0),
        });

        let storage = Arc::new(
            StorageManager::new(&config, provider.clone(), kem.clone(), ledger.clone()).unwrap(),
        );
        let encoder = ShardEncoder::new(provider, signing, kem).await.unwrap();

        let atom = BitAtom::new(1, Particle::Proton, 0, 0, 100.0);
        let shard = encoder.encode(&atom, &"atm1bb".to_string()).await.unwrap();
        storage.store(&shard, serde_json::json!({})).await.unwrap();

        // XOR one byte of the ciphertext file
        let dat = dir
            .path()
            .join("shards")
            .join("proton")
            .join(format!("{}.dat", shard.shard_id));
        let mut data = std::fs::read(&dat).unwrap();
        data[0] ^= 0x01;
        std::fs::write(&dat, &data).unwrap();

        let audit = AuditLoop::new(
            storage.clone(),
            ledger.clone(),
            Duration::from_secs(3600),
            Duration::from_secs(30),
        );
        let report = audit.sweep().await;
        assert_eq!(report.scanned, 1);
        assert_eq!(report.corrupted, 1);
        assert_eq!(report.repaired, 1);

        // Retrieval works again after the sweep
        let plain = storage
            .retrieve(Particle::Proton, &shard.shard_id)
            .await
            .unwrap();
        assert_eq!(plain, vec![1]);
        // Repair record plus the sweep summary
        assert!(ledger.appended.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_spawned_loop_stops_on_signal() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = NodeConfig::default();
        config.root = dir.path().to_path_buf();

        let provider = Arc::new(InMemoryKeyProvider::new());
        let kem = provider.generate_keypair(KeyKind::Kem).await.unwrap();
        let ledger = Arc::new(CountingLedger {
            appended: AtomicU64::new(0),
        });
        let storage =
            Arc::new(StorageManager::new(&config, provider, kem, ledger.clone()).unwrap());

        let audit = AuditLoop::new(
            storage,
            ledger,
            Duration::from_secs(3600),
            Duration::from_secs(30),
        );
        let (handle, stop) = audit.spawn();
        stop.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("loop exits promptly")
            .unwrap();
    }
}
