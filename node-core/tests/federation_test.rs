//! Two-node federation: admission over the Kyber handshake, replica
//! placement over the overlay, quorum consensus on appends, and repair
//! from a peer replica.

use atomvault_node::config::NodeConfig;
use atomvault_node::ledger::LedgerView;
use atomvault_node::overlay::MessageBus;
use atomvault_node::pipeline::{FissionRequest, PipelineError};
use atomvault_node::tokens::TokenMetadata;
use atomvault_node::types::{NodeRole, Particle};
use atomvault_node::NodeRuntime;
use std::time::Duration;

async fn runtime_in(dir: &tempfile::TempDir, node_id: &str) -> NodeRuntime {
    let mut config = NodeConfig::default();
    config.root = dir.path().to_path_buf();
    config.node_id = node_id.to_string();
    config.listen_addr = "127.0.0.1:0".to_string();
    NodeRuntime::initialize(config).await.unwrap()
}

/// Build two federated runtimes with cross-minted attestation tokens.
async fn federated_pair(
    dir_a: &tempfile::TempDir,
    dir_b: &tempfile::TempDir,
) -> (NodeRuntime, NodeRuntime) {
    let mut a = runtime_in(dir_a, "node-A").await;
    let mut b = runtime_in(dir_b, "node-B").await;

    // Each node's attestation is minted on the peer that will admit it
    let (token_for_b, _) = a
        .tokens
        .mint("node-B", TokenMetadata::default())
        .await
        .unwrap();
    let (token_for_a, _) = b
        .tokens
        .mint("node-A", TokenMetadata::default())
        .await
        .unwrap();

    let overlay_a = a
        .enable_federation(NodeRole::Branch, token_for_a.to_string())
        .await
        .unwrap();
    let overlay_b = b
        .enable_federation(NodeRole::Branch, token_for_b.to_string())
        .await
        .unwrap();

    let b_addr = overlay_b.local_addr().await.expect("b bound");
    overlay_a.connect(&b_addr.to_string()).await.unwrap();

    // Let the responder finish its half of the admission
    for _ in 0..50 {
        if overlay_b.peer_count().await == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(overlay_a.peer_count().await, 1);
    assert_eq!(overlay_b.peer_count().await, 1);
    (a, b)
}

#[tokio::test]
async fn test_federated_fission_places_replicas_on_peer() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let (a, b) = federated_pair(&dir_a, &dir_b).await;

    let (token_id, envelope) = a
        .tokens
        .mint("node-A", TokenMetadata::default())
        .await
        .unwrap();
    let token = token_id.to_string();

    let request = FissionRequest::from_bytes(b"hi".to_vec(), token.clone(), envelope.clone());
    let cancel = a.cancel_signal();
    let outcome = match a.fission.run(request, &cancel).await {
        Ok(outcome) => outcome,
        // Two nodes still cannot satisfy the neutron floor of five
        Err(PipelineError::UnderReplicated {
            achieved, outcome, ..
        }) => {
            assert_eq!(achieved, 2);
            *outcome
        }
        Err(e) => panic!("fission failed: {e}"),
    };

    // Neutron and proton replicas bounced to node B
    assert!(!b.storage.list(Particle::Neutron).unwrap().is_empty());
    assert!(!b.storage.list(Particle::Proton).unwrap().is_empty());

    // The consensus-finalized record is on A's ledger
    let records = a.ledger.records(&outcome.address).await.unwrap();
    assert_eq!(records.len(), 1);

    // Round trip still works on the writing node
    let fused = a
        .fusion
        .run(&outcome.address, &token, &envelope, &cancel)
        .await
        .unwrap();
    assert_eq!(fused.payload, b"hi");
}

#[tokio::test]
async fn test_repair_pulls_replica_from_peer() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let (a, b) = federated_pair(&dir_a, &dir_b).await;

    let (token_id, envelope) = a
        .tokens
        .mint("node-A", TokenMetadata::default())
        .await
        .unwrap();
    let token = token_id.to_string();

    let request = FissionRequest::from_bytes(b"hi".to_vec(), token.clone(), envelope.clone());
    let cancel = a.cancel_signal();
    let outcome = match a.fission.run(request, &cancel).await {
        Ok(outcome) => outcome,
        Err(PipelineError::UnderReplicated { outcome, .. }) => *outcome,
        Err(e) => panic!("fission failed: {e}"),
    };

    // Pick a neutron shard B also holds, then destroy A's copy and backup
    let shared_id = b
        .storage
        .list(Particle::Neutron)
        .unwrap()
        .into_iter()
        .next()
        .expect("replica on b");
    for sub in ["", "backups"] {
        let path = dir_a
            .path()
            .join("shards")
            .join("neutron")
            .join(sub)
            .join(format!("{shared_id}.dat"));
        std::fs::write(path, b"garbage").unwrap();
    }

    let repaired = a
        .storage
        .repair(Particle::Neutron, &shared_id)
        .await
        .unwrap();
    assert_eq!(
        repaired,
        atomvault_node::storage::RepairOutcome::Repaired("node-B".into())
    );

    let fused = a
        .fusion
        .run(&outcome.address, &token, &envelope, &cancel)
        .await
        .unwrap();
    assert_eq!(fused.payload, b"hi");
}
