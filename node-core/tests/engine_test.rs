//! End-to-end scenarios on a single node: mint/validate, fission/fusion
//! round-trips, tamper + repair, authorization failures and cancellation.

use atomvault_node::config::NodeConfig;
use atomvault_node::ledger::LedgerView;
use atomvault_node::pipeline::{FissionRequest, PipelineError};
use atomvault_node::tokens::{TokenMetadata, TokenValidate};
use atomvault_node::types::Particle;
use atomvault_node::NodeRuntime;

async fn runtime_in(dir: &tempfile::TempDir) -> NodeRuntime {
    let mut config = NodeConfig::default();
    config.root = dir.path().to_path_buf();
    config.node_id = "node-A".to_string();
    NodeRuntime::initialize(config).await.unwrap()
}

/// Single-node fission is legitimately under-replicated for neutron and
/// proton shards; unwrap the degraded outcome.
async fn fission_degraded(
    runtime: &NodeRuntime,
    payload: &[u8],
    token_id: &str,
    envelope: &atomvault_node::tokens::SealedEnvelope,
) -> atomvault_node::pipeline::FissionOutcome {
    let request = FissionRequest::from_bytes(
        payload.to_vec(),
        token_id.to_string(),
        envelope.clone(),
    );
    let cancel = runtime.cancel_signal();
    match runtime.fission.run(request, &cancel).await {
        Ok(outcome) => outcome,
        Err(PipelineError::UnderReplicated { outcome, .. }) => *outcome,
        Err(e) => panic!("fission failed: {e}"),
    }
}

#[tokio::test]
async fn test_mint_and_validate() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = runtime_in(&dir).await;

    let (token_id, envelope) = runtime
        .tokens
        .mint("node-A", TokenMetadata::default())
        .await
        .unwrap();
    let outcome = runtime
        .tokens
        .validate(&token_id.to_string(), &envelope)
        .await
        .unwrap();
    assert!(outcome.valid);
    assert_eq!(outcome.owner_node_id, "node-A");

    // The mint is on the token ledger and the chain verifies
    let records = runtime
        .ledger
        .verify_chain(&atomvault_node::ledger::token_ledger_address("node-A"), None)
        .await;
    assert!(records.is_ok());
}

#[tokio::test]
async fn test_round_trip_tiny_payload() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = runtime_in(&dir).await;

    let (token_id, envelope) = runtime
        .tokens
        .mint("node-A", TokenMetadata::default())
        .await
        .unwrap();
    let token = token_id.to_string();

    let outcome = fission_degraded(&runtime, b"hi", &token, &envelope).await;
    assert!(outcome.address.starts_with("atm1"));
    assert_eq!(outcome.shard_ids.len(), 16);

    // Same payload, same node: the address is deterministic
    let again = fission_degraded(&runtime, b"hi", &token, &envelope).await;
    assert_eq!(again.address, outcome.address);

    let cancel = runtime.cancel_signal();
    let fused = runtime
        .fusion
        .run(&outcome.address, &token, &envelope, &cancel)
        .await
        .unwrap();
    assert_eq!(fused.payload, b"hi");
    assert!(fused.recovery_path.exists());
}

#[tokio::test]
async fn test_tamper_then_audit_then_fusion() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = runtime_in(&dir).await;

    let (token_id, envelope) = runtime
        .tokens
        .mint("node-A", TokenMetadata::default())
        .await
        .unwrap();
    let token = token_id.to_string();

    let payload: Vec<u8> = (0u8..=255).collect();
    let outcome = fission_degraded(&runtime, &payload, &token, &envelope).await;

    // XOR one byte of one neutron shard ciphertext on disk
    let neutron_ids = runtime.storage.list(Particle::Neutron).unwrap();
    assert!(!neutron_ids.is_empty());
    let victim = dir
        .path()
        .join("shards")
        .join("neutron")
        .join(format!("{}.dat", neutron_ids[0]));
    let mut data = std::fs::read(&victim).unwrap();
    data[0] ^= 0x55;
    std::fs::write(&victim, &data).unwrap();

    assert!(!runtime
        .storage
        .verify_integrity(Particle::Neutron, &neutron_ids[0])
        .await
        .unwrap());

    let report = runtime.audit_once().await;
    assert_eq!(report.corrupted, 1);
    assert_eq!(report.repaired, 1);
    assert_eq!(report.unrecoverable, 0);

    let cancel = runtime.cancel_signal();
    let fused = runtime
        .fusion
        .run(&outcome.address, &token, &envelope, &cancel)
        .await
        .unwrap();
    assert_eq!(fused.payload, payload);
}

#[tokio::test]
async fn test_unauthorized_fission_leaves_no_side_effects() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = runtime_in(&dir).await;

    let (token_id, envelope) = runtime
        .tokens
        .mint("node-A", TokenMetadata::default())
        .await
        .unwrap();

    // Corrupt the sealed envelope so it cannot open to the token id
    let mut bad_envelope = envelope.clone();
    bad_envelope.kem_ciphertext[0] ^= 0xff;

    let ledger_files_before: Vec<_> = std::fs::read_dir(dir.path().join("ledger"))
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name())
        .collect();

    let request = FissionRequest::from_bytes(
        b"secret".to_vec(),
        token_id.to_string(),
        bad_envelope,
    );
    let cancel = runtime.cancel_signal();
    let err = runtime.fission.run(request, &cancel).await.unwrap_err();
    assert!(matches!(err, PipelineError::Unauthorized(_)), "got {err}");

    // No shard landed on disk
    for kind in Particle::ALL {
        assert!(runtime.storage.list(kind).unwrap().is_empty());
    }
    // No new ledger file appeared (the mint record predates the attempt)
    let ledger_files_after: Vec<_> = std::fs::read_dir(dir.path().join("ledger"))
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name())
        .collect();
    assert_eq!(ledger_files_before.len(), ledger_files_after.len());
}

#[tokio::test]
async fn test_revoked_token_rejected_for_fusion() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = runtime_in(&dir).await;

    let (token_id, envelope) = runtime
        .tokens
        .mint("node-A", TokenMetadata::default())
        .await
        .unwrap();
    let token = token_id.to_string();
    let outcome = fission_degraded(&runtime, b"data", &token, &envelope).await;

    runtime.tokens.revoke(&token).await.unwrap();

    let cancel = runtime.cancel_signal();
    let err = runtime
        .fusion
        .run(&outcome.address, &token, &envelope, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Unauthorized(_)));
}

#[tokio::test]
async fn test_under_replication_is_reported_and_logged() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = runtime_in(&dir).await;

    let (token_id, envelope) = runtime
        .tokens
        .mint("node-A", TokenMetadata::default())
        .await
        .unwrap();

    let request = FissionRequest::from_bytes(
        b"x".to_vec(),
        token_id.to_string(),
        envelope.clone(),
    );
    let cancel = runtime.cancel_signal();
    let err = runtime.fission.run(request, &cancel).await.unwrap_err();
    let outcome = match err {
        PipelineError::UnderReplicated {
            achieved,
            required,
            outcome,
        } => {
            assert_eq!(achieved, 1);
            assert_eq!(required, 5);
            outcome
        }
        other => panic!("expected under-replication, got {other}"),
    };

    // The shard_create record still landed, carrying achieved counts
    let records = runtime.ledger.records(&outcome.address).await.unwrap();
    assert_eq!(records.len(), 1);
    match &records[0].body {
        atomvault_node::ledger::RecordBody::ShardCreate(body) => {
            assert!(body.shards.iter().all(|s| s.achieved == 1));
            assert!(body
                .shards
                .iter()
                .any(|s| s.kind == Particle::Neutron && s.required == 5));
        }
        other => panic!("unexpected body {other:?}"),
    }
}

#[tokio::test]
async fn test_cancelled_fission_rolls_back() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = runtime_in(&dir).await;

    let (token_id, envelope) = runtime
        .tokens
        .mint("node-A", TokenMetadata::default())
        .await
        .unwrap();

    runtime.cancel_all();
    let request = FissionRequest::from_bytes(
        b"never stored".to_vec(),
        token_id.to_string(),
        envelope,
    );
    let cancel = runtime.cancel_signal();
    let err = runtime.fission.run(request, &cancel).await.unwrap_err();
    assert!(matches!(err, PipelineError::Cancelled));

    for kind in Particle::ALL {
        assert!(runtime.storage.list(kind).unwrap().is_empty());
    }
}

#[tokio::test]
async fn test_ledger_linkage_across_operations() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = runtime_in(&dir).await;

    let (token_id, envelope) = runtime
        .tokens
        .mint("node-A", TokenMetadata::default())
        .await
        .unwrap();
    let token = token_id.to_string();
    let outcome = fission_degraded(&runtime, b"linked", &token, &envelope).await;

    let cancel = runtime.cancel_signal();
    runtime
        .fusion
        .run(&outcome.address, &token, &envelope, &cancel)
        .await
        .unwrap();

    // shard_create + fusion on the address ledger, all links intact
    let records = runtime.ledger.records(&outcome.address).await.unwrap();
    assert_eq!(records.len(), 2);
    for pair in records.windows(2) {
        assert_eq!(pair[1].previous_hash, pair[0].hash);
        assert_eq!(pair[1].index, pair[0].index + 1);
    }
    runtime
        .ledger
        .verify_chain(&outcome.address, None)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_bounce_metadata_in_sidecars() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = runtime_in(&dir).await;

    let (token_id, envelope) = runtime
        .tokens
        .mint("node-A", TokenMetadata::default())
        .await
        .unwrap();
    let token = token_id.to_string();
    fission_degraded(&runtime, b"z", &token, &envelope).await;

    // Every sidecar carries the bounce entry for audit reconciliation
    for kind in Particle::ALL {
        for id in runtime.storage.list(kind).unwrap() {
            let meta_path = dir
                .path()
                .join("shards")
                .join(kind.as_str())
                .join(format!("{id}.dat.meta"));
            let sidecar: serde_json::Value =
                serde_json::from_str(&std::fs::read_to_string(meta_path).unwrap()).unwrap();
            let bounce = &sidecar["custom"];
            assert_eq!(bounce["token_id"], token.as_str());
            let frequency = bounce["frequency"].as_f64().unwrap();
            let bounce_rate = bounce["bounce_rate"].as_f64().unwrap();
            assert!((bounce_rate - 1000.0 / frequency).abs() < 1e-9);
        }
    }
}
