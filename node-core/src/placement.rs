//! Shard placement
//!
//! The placement oracle is pluggable; the default walks capable peers
//! round-robin, always placing the first replica locally. An external
//! predictor can be dropped in behind the same trait.

use crate::types::{NodeId, Particle};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Source of peers that advertise storage capability for a particle kind.
#[async_trait]
pub trait CapabilityDirectory: Send + Sync {
    async fn peers_with_capability(&self, kind: Particle) -> Vec<NodeId>;
}

/// Chooses target nodes for shard replicas.
#[async_trait]
pub trait PlacementOracle: Send + Sync {
    /// Target nodes for one shard. May return fewer than `replicas` when
    /// capacity is short; the caller surfaces that as under-replication.
    async fn plan(&self, kind: Particle, shard_id: &str, replicas: u32) -> Vec<NodeId>;
}

/// Default oracle: self first, then capable peers in round-robin order.
pub struct RoundRobinPlacement {
    self_node: NodeId,
    directory: Arc<dyn CapabilityDirectory>,
    cursor: AtomicUsize,
}

impl RoundRobinPlacement {
    pub fn new(self_node: NodeId, directory: Arc<dyn CapabilityDirectory>) -> Self {
        Self {
            self_node,
            directory,
            cursor: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl PlacementOracle for RoundRobinPlacement {
    async fn plan(&self, kind: Particle, _shard_id: &str, replicas: u32) -> Vec<NodeId> {
        let mut targets = vec![self.self_node.clone()];
        if replicas <= 1 {
            return targets;
        }

        let peers = self.directory.peers_with_capability(kind).await;
        if peers.is_empty() {
            return targets;
        }

        let start = self.cursor.fetch_add(1, Ordering::Relaxed);
        for offset in 0..peers.len() {
            if targets.len() >= replicas as usize {
                break;
            }
            let peer = &peers[(start + offset) % peers.len()];
            if *peer != self.self_node && !targets.contains(peer) {
                targets.push(peer.clone());
            }
        }
        targets
    }
}

/// Fixed-plan oracle for tests and single-node deployments.
pub struct StaticPlacement {
    targets: Vec<NodeId>,
}

impl StaticPlacement {
    pub fn new(targets: Vec<NodeId>) -> Self {
        Self { targets }
    }

    /// Place everything on the local node only.
    pub fn local_only(node_id: impl Into<NodeId>) -> Self {
        Self {
            targets: vec![node_id.into()],
        }
    }
}

#[async_trait]
impl PlacementOracle for StaticPlacement {
    async fn plan(&self, _kind: Particle, _shard_id: &str, replicas: u32) -> Vec<NodeId> {
        self.targets
            .iter()
            .take(replicas as usize)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedDirectory(Vec<NodeId>);

    #[async_trait]
    impl CapabilityDirectory for FixedDirectory {
        async fn peers_with_capability(&self, _kind: Particle) -> Vec<NodeId> {
            self.0.clone()
        }
    }

    #[tokio::test]
    async fn test_round_robin_places_self_first() {
        let oracle = RoundRobinPlacement::new(
            "node-A".into(),
            Arc::new(FixedDirectory(vec!["node-B".into(), "node-C".into()])),
        );
        let plan = oracle.plan(Particle::Proton, "s1", 3).await;
        assert_eq!(plan.len(), 3);
        assert_eq!(plan[0], "node-A");
        assert!(plan.contains(&"node-B".to_string()));
        assert!(plan.contains(&"node-C".to_string()));
    }

    #[tokio::test]
    async fn test_round_robin_rotates_start() {
        let oracle = RoundRobinPlacement::new(
            "node-A".into(),
            Arc::new(FixedDirectory(vec![
                "node-B".into(),
                "node-C".into(),
                "node-D".into(),
            ])),
        );
        let first = oracle.plan(Particle::Neutron, "s1", 2).await;
        let second = oracle.plan(Particle::Neutron, "s2", 2).await;
        assert_ne!(first[1], second[1]);
    }

    #[tokio::test]
    async fn test_shortfall_returns_fewer() {
        let oracle = RoundRobinPlacement::new(
            "node-A".into(),
            Arc::new(FixedDirectory(vec!["node-B".into()])),
        );
        let plan = oracle.plan(Particle::Neutron, "s1", 5).await;
        assert_eq!(plan, vec!["node-A".to_string(), "node-B".to_string()]);
    }
}
