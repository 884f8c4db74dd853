//! Peer overlay
//!
//! Authenticated discovery, lifecycle management and message delivery.
//! Peers are admitted only after a Kyber1024 handshake, a PoA attestation
//! check and a capability check covering all three particle stores. All
//! traffic is encrypted and HMAC-authenticated with replay protection via a
//! monotonic per-peer timestamp window.

pub mod messages;

use crate::ledger::LedgerView;
use crate::storage::{ReplicaFetch, StorageManager};
use crate::tokens::TokenValidate;
use crate::types::{NodeId, NodeIdentity, NodeRole, Particle, ShardId};
use async_trait::async_trait;
use atomvault_pqc::{KeyId, KeyProvider};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, oneshot, Mutex, RwLock};
use tracing::{debug, info, warn};

pub use messages::{BlockVote, HandshakeFrame, PeerMessage, SecureFrame, SessionKeys};

const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;
const OUTBOUND_QUEUE: usize = 256;
/// Missed heartbeats before eviction.
const EVICT_AFTER_MISSES: u64 = 3;

#[derive(Debug, thiserror::Error)]
pub enum OverlayError {
    #[error("Overlay I/O failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("Handshake failed: {0}")]
    Handshake(String),
    #[error("Peer unauthorized: {0}")]
    Unauthorized(String),
    #[error("Peer {0} does not cover the required shard kinds")]
    CapabilityMissing(NodeId),
    #[error("Peer not connected: {0}")]
    PeerNotFound(NodeId),
    #[error("Operation timed out: {0}")]
    Timeout(String),
    #[error("Crypto failure: {0}")]
    Crypto(#[from] atomvault_pqc::PqcError),
    #[error("Key provider failure: {0}")]
    KeyProvider(#[from] atomvault_pqc::KeyProviderError),
    #[error("Peer table full")]
    PeerTableFull,
}

/// Transport capability the consensus engine depends on.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Send to every admitted peer; returns how many were reached.
    async fn broadcast(&self, message: PeerMessage) -> usize;
    async fn send_to(&self, node_id: &str, message: PeerMessage) -> Result<(), OverlayError>;
    async fn peer_count(&self) -> usize;
    /// Stream of block proposals, votes and sync traffic.
    fn subscribe_consensus(&self) -> broadcast::Receiver<(NodeId, PeerMessage)>;
}

struct PeerHandle {
    identity: NodeIdentity,
    capabilities: Vec<Particle>,
    priority: u8,
    endpoint: Option<String>,
    outbound: mpsc::Sender<PeerMessage>,
    last_seen_ms: Arc<AtomicU64>,
    last_inbound_ms: Arc<AtomicU64>,
}

/// Overlay tuning knobs extracted from node configuration.
#[derive(Debug, Clone)]
pub struct OverlayConfig {
    pub listen_addr: String,
    pub role: NodeRole,
    pub dns_seed: Option<String>,
    pub max_peers: usize,
    pub fallback_peers: Vec<String>,
    pub heartbeat_interval: Duration,
    pub request_timeout: Duration,
}

impl OverlayConfig {
    pub fn from_node_config(config: &crate::config::NodeConfig) -> Self {
        Self {
            listen_addr: config.listen_addr.clone(),
            role: NodeRole::Branch,
            dns_seed: config.dns_seed.clone(),
            max_peers: config.max_peers,
            fallback_peers: config.fallback_peers.clone(),
            heartbeat_interval: Duration::from_secs(config.heartbeat_interval_secs),
            request_timeout: Duration::from_millis(config.shard_request_timeout_ms),
        }
    }
}

/// The authenticated peer-to-peer overlay of one node.
pub struct PeerOverlay {
    config: OverlayConfig,
    identity: NodeIdentity,
    capabilities: Vec<Particle>,
    provider: Arc<dyn KeyProvider>,
    kem_key: KeyId,
    kem_public: Vec<u8>,
    tokens: Arc<dyn TokenValidate>,
    storage: Arc<StorageManager>,
    ledger: Arc<dyn LedgerView>,
    peers: RwLock<HashMap<NodeId, Arc<PeerHandle>>>,
    /// Exclusive insertion latch; reads of the peer table stay concurrent
    admission: Mutex<()>,
    pending_shards: Mutex<HashMap<ShardId, oneshot::Sender<PeerMessage>>>,
    pending_bounces: Mutex<HashMap<ShardId, oneshot::Sender<bool>>>,
    consensus_tx: broadcast::Sender<(NodeId, PeerMessage)>,
    send_clock: AtomicU64,
    bound_addr: RwLock<Option<SocketAddr>>,
}

impl PeerOverlay {
    pub async fn new(
        config: OverlayConfig,
        identity: NodeIdentity,
        provider: Arc<dyn KeyProvider>,
        kem_key: KeyId,
        tokens: Arc<dyn TokenValidate>,
        storage: Arc<StorageManager>,
        ledger: Arc<dyn LedgerView>,
    ) -> Result<Self, OverlayError> {
        let kem_public = provider.public_key(&kem_key).await?;
        let (consensus_tx, _) = broadcast::channel(1024);
        Ok(Self {
            config,
            identity,
            capabilities: Particle::ALL.to_vec(),
            provider,
            kem_key,
            kem_public,
            tokens,
            storage,
            ledger,
            peers: RwLock::new(HashMap::new()),
            admission: Mutex::new(()),
            pending_shards: Mutex::new(HashMap::new()),
            pending_bounces: Mutex::new(HashMap::new()),
            consensus_tx,
            send_clock: AtomicU64::new(0),
            bound_addr: RwLock::new(None),
        })
    }

    pub fn node_id(&self) -> &str {
        &self.identity.node_id
    }

    /// Address the listener is bound to once [`PeerOverlay::start`] ran.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.bound_addr.read().await
    }

    fn next_timestamp(&self) -> u64 {
        let now = chrono::Utc::now().timestamp_millis() as u64;
        let mut last = self.send_clock.load(Ordering::Relaxed);
        loop {
            let next = now.max(last + 1);
            match self.send_clock.compare_exchange_weak(
                last,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return next,
                Err(observed) => last = observed,
            }
        }
    }

    /// Bind the listener, start the accept and heartbeat loops, then run
    /// discovery. Returns the bound address.
    pub async fn start(self: &Arc<Self>) -> Result<SocketAddr, OverlayError> {
        let listener = TcpListener::bind(&self.config.listen_addr).await?;
        let addr = listener.local_addr()?;
        *self.bound_addr.write().await = Some(addr);
        info!(%addr, "overlay listening");

        let overlay = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer_addr)) => {
                        debug!(%peer_addr, "inbound connection");
                        let overlay = Arc::clone(&overlay);
                        tokio::spawn(async move {
                            if let Err(e) = overlay.accept_peer(stream).await {
                                warn!(%peer_addr, error = %e, "inbound admission failed");
                            }
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                    }
                }
            }
        });

        let overlay = Arc::clone(self);
        tokio::spawn(async move {
            overlay.heartbeat_loop().await;
        });

        let overlay = Arc::clone(self);
        tokio::spawn(async move {
            overlay.discover().await;
        });

        Ok(addr)
    }

    /// DNS-seed discovery with hardcoded fallbacks at low priority.
    async fn discover(self: &Arc<Self>) {
        let mut admitted = 0usize;
        if let Some(seed) = self.config.dns_seed.clone() {
            match tokio::net::lookup_host(seed.as_str()).await {
                Ok(candidates) => {
                    for candidate in candidates {
                        match self.connect(&candidate.to_string()).await {
                            Ok(node_id) => {
                                admitted += 1;
                                info!(%node_id, "seed peer admitted");
                            }
                            Err(e) => debug!(%candidate, error = %e, "seed probe failed"),
                        }
                    }
                }
                Err(e) => warn!(%seed, error = %e, "dns seed resolution failed"),
            }
        }
        if admitted == 0 {
            for endpoint in self.config.fallback_peers.clone() {
                match self.connect_with_priority(&endpoint, Some(u8::MAX)).await {
                    Ok(node_id) => info!(%node_id, "fallback peer admitted"),
                    Err(e) => debug!(%endpoint, error = %e, "fallback probe failed"),
                }
            }
        }
    }

    /// Initiate a connection and run the admission handshake.
    pub async fn connect(self: &Arc<Self>, endpoint: &str) -> Result<NodeId, OverlayError> {
        self.connect_with_priority(endpoint, None).await
    }

    async fn connect_with_priority(
        self: &Arc<Self>,
        endpoint: &str,
        priority_override: Option<u8>,
    ) -> Result<NodeId, OverlayError> {
        let mut stream = TcpStream::connect(endpoint).await?;

        // Quantum-secure channel: responder offers, we encapsulate
        let offer: HandshakeFrame = read_frame(&mut stream).await?;
        let (responder_id, kem_public) = match offer {
            HandshakeFrame::Offer { node_id, kem_public } => (node_id, kem_public),
            _ => return Err(OverlayError::Handshake("expected offer".into())),
        };
        let (shared, kem_ciphertext) = self.provider.encapsulate(&kem_public).await?;
        write_frame(
            &mut stream,
            &HandshakeFrame::Reply {
                node_id: self.identity.node_id.clone(),
                kem_ciphertext,
            },
        )
        .await?;
        let session = SessionKeys::derive(&shared);

        // Secure hello exchange: we introduce ourselves first
        self.send_hello(&mut stream, &session).await?;
        let (identity, capabilities) = self.read_hello(&mut stream, &session).await?;
        if identity.node_id != responder_id {
            return Err(OverlayError::Handshake("identity mismatch".into()));
        }

        self.admit(
            identity,
            capabilities,
            session,
            stream,
            Some(endpoint.to_string()),
            priority_override,
        )
        .await
    }

    /// Responder half of the admission handshake.
    async fn accept_peer(self: &Arc<Self>, mut stream: TcpStream) -> Result<NodeId, OverlayError> {
        write_frame(
            &mut stream,
            &HandshakeFrame::Offer {
                node_id: self.identity.node_id.clone(),
                kem_public: self.kem_public.clone(),
            },
        )
        .await?;

        let reply: HandshakeFrame = read_frame(&mut stream).await?;
        let (initiator_id, kem_ciphertext) = match reply {
            HandshakeFrame::Reply { node_id, kem_ciphertext } => (node_id, kem_ciphertext),
            _ => return Err(OverlayError::Handshake("expected reply".into())),
        };
        let shared = self.provider.decapsulate(&self.kem_key, &kem_ciphertext).await?;
        let session = SessionKeys::derive(&shared);

        let (identity, capabilities) = self.read_hello(&mut stream, &session).await?;
        if identity.node_id != initiator_id {
            return Err(OverlayError::Handshake("identity mismatch".into()));
        }
        self.send_hello(&mut stream, &session).await?;

        self.admit(identity, capabilities, session, stream, None, None)
            .await
    }

    async fn send_hello(
        &self,
        stream: &mut TcpStream,
        session: &SessionKeys,
    ) -> Result<(), OverlayError> {
        let hello = PeerMessage::Hello {
            identity: self.identity.clone(),
            capabilities: self.capabilities.clone(),
        };
        let frame = session.seal(&self.identity.node_id, self.next_timestamp(), &hello)?;
        write_frame(stream, &frame).await?;
        Ok(())
    }

    async fn read_hello(
        &self,
        stream: &mut TcpStream,
        session: &SessionKeys,
    ) -> Result<(NodeIdentity, Vec<Particle>), OverlayError> {
        let frame: SecureFrame = read_frame(stream).await?;
        match session.open(&frame)? {
            PeerMessage::Hello {
                identity,
                capabilities,
            } => Ok((identity, capabilities)),
            other => Err(OverlayError::Handshake(format!(
                "expected hello, got {}",
                other.kind_name()
            ))),
        }
    }

    /// Final admission checks, then insert the peer and start its I/O tasks.
    async fn admit(
        self: &Arc<Self>,
        identity: NodeIdentity,
        capabilities: Vec<Particle>,
        session: SessionKeys,
        stream: TcpStream,
        endpoint: Option<String>,
        priority_override: Option<u8>,
    ) -> Result<NodeId, OverlayError> {
        // Capability must cover the full particle set
        for kind in Particle::ALL {
            if !capabilities.contains(&kind) {
                return Err(OverlayError::CapabilityMissing(identity.node_id.clone()));
            }
        }
        // PoA attestation for the claimed node id
        let outcome = self
            .tokens
            .validate_record(&identity.attested_token_id)
            .await
            .map_err(|e| OverlayError::Unauthorized(e.to_string()))?;
        if outcome.owner_node_id != identity.node_id {
            return Err(OverlayError::Unauthorized(format!(
                "token owner {} does not match claimed id {}",
                outcome.owner_node_id, identity.node_id
            )));
        }

        let node_id = identity.node_id.clone();
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let last_seen_ms = Arc::new(AtomicU64::new(
            chrono::Utc::now().timestamp_millis() as u64,
        ));
        let handle = Arc::new(PeerHandle {
            priority: priority_override.unwrap_or_else(|| identity.role.priority()),
            identity,
            capabilities,
            endpoint,
            outbound: outbound_tx,
            last_seen_ms: last_seen_ms.clone(),
            last_inbound_ms: Arc::new(AtomicU64::new(0)),
        });

        {
            let _latch = self.admission.lock().await;
            let mut peers = self.peers.write().await;
            if peers.len() >= self.config.max_peers && !peers.contains_key(&node_id) {
                return Err(OverlayError::PeerTableFull);
            }
            peers.insert(node_id.clone(), handle.clone());
        }
        info!(%node_id, role = ?handle.identity.role, "peer admitted");

        let (read_half, write_half) = stream.into_split();
        self.spawn_writer(node_id.clone(), write_half, session.clone(), outbound_rx);
        self.spawn_reader(node_id.clone(), read_half, session, handle);
        Ok(node_id)
    }

    fn spawn_writer(
        self: &Arc<Self>,
        node_id: NodeId,
        mut write_half: tokio::net::tcp::OwnedWriteHalf,
        session: SessionKeys,
        mut outbound_rx: mpsc::Receiver<PeerMessage>,
    ) {
        let overlay = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                let frame = match session.seal(
                    &overlay.identity.node_id,
                    overlay.next_timestamp(),
                    &message,
                ) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(%node_id, error = %e, "frame seal failed");
                        continue;
                    }
                };
                if let Err(e) = write_frame(&mut write_half, &frame).await {
                    debug!(%node_id, error = %e, "peer write failed");
                    break;
                }
            }
        });
    }

    fn spawn_reader(
        self: &Arc<Self>,
        node_id: NodeId,
        mut read_half: tokio::net::tcp::OwnedReadHalf,
        session: SessionKeys,
        handle: Arc<PeerHandle>,
    ) {
        let overlay = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let frame: SecureFrame = match read_frame(&mut read_half).await {
                    Ok(frame) => frame,
                    Err(e) => {
                        debug!(%node_id, error = %e, "peer read closed");
                        overlay.drop_peer(&node_id).await;
                        return;
                    }
                };
                let message = match session.open(&frame) {
                    Ok(message) => message,
                    Err(e) => {
                        warn!(%node_id, error = %e, "frame rejected");
                        continue;
                    }
                };
                // Monotonic per-peer timestamp window defeats replay
                let last = handle.last_inbound_ms.load(Ordering::Relaxed);
                if frame.timestamp_ms <= last {
                    warn!(%node_id, ts = frame.timestamp_ms, "replayed frame dropped");
                    continue;
                }
                handle.last_inbound_ms.store(frame.timestamp_ms, Ordering::Relaxed);
                handle.last_seen_ms.store(
                    chrono::Utc::now().timestamp_millis() as u64,
                    Ordering::Relaxed,
                );

                overlay.handle_message(&node_id, message).await;
            }
        });
    }

    async fn handle_message(self: &Arc<Self>, from: &str, message: PeerMessage) {
        match message {
            PeerMessage::ShardRequest { shard_id, kind } => {
                let response = match self.storage.raw_parts(kind, &shard_id).await {
                    Ok((ciphertext, iv, auth_tag)) => PeerMessage::ShardResponse {
                        shard_id,
                        found: true,
                        ciphertext,
                        iv,
                        auth_tag,
                    },
                    Err(_) => PeerMessage::ShardResponse {
                        shard_id,
                        found: false,
                        ciphertext: Vec::new(),
                        iv: Vec::new(),
                        auth_tag: Vec::new(),
                    },
                };
                let _ = self.send_to(from, response).await;
            }
            PeerMessage::ShardResponse { ref shard_id, .. } => {
                let waiter = self.pending_shards.lock().await.remove(shard_id);
                if let Some(tx) = waiter {
                    let _ = tx.send(message);
                }
            }
            PeerMessage::ShardBounce { shard, metadata, .. } => {
                let custom = serde_json::to_value(&metadata).unwrap_or_default();
                let stored = match self.storage.store(&shard, custom).await {
                    Ok(()) => true,
                    Err(crate::storage::StorageError::DuplicateShard(_)) => false,
                    Err(e) => {
                        warn!(shard_id = %shard.shard_id, error = %e, "bounce store failed");
                        false
                    }
                };
                let _ = self
                    .send_to(
                        from,
                        PeerMessage::ShardBounceAck {
                            shard_id: shard.shard_id.clone(),
                            stored,
                        },
                    )
                    .await;
            }
            PeerMessage::ShardBounceAck { ref shard_id, stored } => {
                let waiter = self.pending_bounces.lock().await.remove(shard_id);
                if let Some(tx) = waiter {
                    let _ = tx.send(stored);
                }
            }
            PeerMessage::SyncRequest {
                ref address,
                from_index,
            } => {
                if let Ok(records) = self.ledger.records(address).await {
                    let records = records
                        .into_iter()
                        .filter(|r| r.index >= from_index)
                        .collect();
                    let _ = self
                        .send_to(
                            from,
                            PeerMessage::SyncResponse {
                                address: address.clone(),
                                records,
                            },
                        )
                        .await;
                }
            }
            PeerMessage::BlockPropose { .. }
            | PeerMessage::BlockVote(_)
            | PeerMessage::SyncResponse { .. } => {
                let _ = self.consensus_tx.send((from.to_string(), message));
            }
            PeerMessage::Heartbeat { .. } | PeerMessage::Hello { .. } => {}
        }
    }

    /// Remove a peer. HQ peers are re-connected on any drop.
    async fn drop_peer(self: &Arc<Self>, node_id: &str) {
        let removed = self.peers.write().await.remove(node_id);
        if let Some(handle) = removed {
            info!(node_id, "peer dropped");
            if handle.identity.role == NodeRole::Hq {
                if let Some(endpoint) = handle.endpoint.clone() {
                    let overlay = Arc::clone(self);
                    tokio::spawn(async move {
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        if let Err(e) = overlay.connect(&endpoint).await {
                            warn!(%endpoint, error = %e, "hq reconnect failed");
                        }
                    });
                }
            }
        }
    }

    async fn heartbeat_loop(self: &Arc<Self>) {
        let interval = self.config.heartbeat_interval;
        loop {
            tokio::time::sleep(interval).await;
            let ts = self.next_timestamp();
            self.broadcast(PeerMessage::Heartbeat { ts }).await;

            // Evict non-responders
            let deadline = (chrono::Utc::now().timestamp_millis() as u64)
                .saturating_sub(interval.as_millis() as u64 * EVICT_AFTER_MISSES);
            let stale: Vec<NodeId> = {
                let peers = self.peers.read().await;
                peers
                    .iter()
                    .filter(|(_, h)| h.last_seen_ms.load(Ordering::Relaxed) < deadline)
                    .map(|(id, _)| id.clone())
                    .collect()
            };
            for node_id in stale {
                warn!(%node_id, "peer evicted after missed heartbeats");
                self.drop_peer(&node_id).await;
            }
        }
    }

    /// Fetch a shard replica from one specific peer.
    pub async fn request_shard(
        &self,
        node_id: &str,
        kind: Particle,
        shard_id: &str,
    ) -> Result<Option<(Vec<u8>, Vec<u8>, Vec<u8>)>, OverlayError> {
        let (tx, rx) = oneshot::channel();
        self.pending_shards
            .lock()
            .await
            .insert(shard_id.to_string(), tx);
        self.send_to(
            node_id,
            PeerMessage::ShardRequest {
                shard_id: shard_id.to_string(),
                kind,
            },
        )
        .await?;

        match tokio::time::timeout(self.config.request_timeout, rx).await {
            Ok(Ok(PeerMessage::ShardResponse {
                found,
                ciphertext,
                iv,
                auth_tag,
                ..
            })) => Ok(found.then_some((ciphertext, iv, auth_tag))),
            Ok(_) => Ok(None),
            Err(_) => {
                self.pending_shards.lock().await.remove(shard_id);
                Err(OverlayError::Timeout(format!("shard request {shard_id}")))
            }
        }
    }

    /// Push a replica to a peer and wait for its ack. The store on the far
    /// side is idempotent, so retries are safe.
    pub async fn place_shard(
        &self,
        node_id: &str,
        shard: crate::shard::Shard,
        metadata: crate::shard::ShardMetadataRecord,
    ) -> Result<bool, OverlayError> {
        let shard_id = shard.shard_id.clone();
        let (tx, rx) = oneshot::channel();
        self.pending_bounces
            .lock()
            .await
            .insert(shard_id.clone(), tx);
        self.send_to(
            node_id,
            PeerMessage::ShardBounce {
                from: self.identity.node_id.clone(),
                to: node_id.to_string(),
                shard,
                metadata,
            },
        )
        .await?;

        match tokio::time::timeout(self.config.request_timeout, rx).await {
            Ok(Ok(stored)) => Ok(stored),
            Ok(Err(_)) => Ok(false),
            Err(_) => {
                self.pending_bounces.lock().await.remove(&shard_id);
                Err(OverlayError::Timeout(format!("shard bounce {shard_id}")))
            }
        }
    }

    /// Peers ordered by admission priority, best first.
    pub async fn peers_by_priority(&self) -> Vec<NodeId> {
        let peers = self.peers.read().await;
        let mut list: Vec<(&NodeId, u8)> =
            peers.iter().map(|(id, h)| (id, h.priority)).collect();
        list.sort_by_key(|(id, priority)| (*priority, (*id).clone()));
        list.into_iter().map(|(id, _)| id.clone()).collect()
    }
}

#[async_trait]
impl MessageBus for PeerOverlay {
    async fn broadcast(&self, message: PeerMessage) -> usize {
        let peers = self.peers.read().await;
        let mut sent = 0;
        for handle in peers.values() {
            if handle.outbound.send(message.clone()).await.is_ok() {
                sent += 1;
            }
        }
        sent
    }

    async fn send_to(&self, node_id: &str, message: PeerMessage) -> Result<(), OverlayError> {
        let handle = {
            let peers = self.peers.read().await;
            peers
                .get(node_id)
                .cloned()
                .ok_or_else(|| OverlayError::PeerNotFound(node_id.to_string()))?
        };
        handle
            .outbound
            .send(message)
            .await
            .map_err(|_| OverlayError::PeerNotFound(node_id.to_string()))
    }

    async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    fn subscribe_consensus(&self) -> broadcast::Receiver<(NodeId, PeerMessage)> {
        self.consensus_tx.subscribe()
    }
}

#[async_trait]
impl crate::placement::CapabilityDirectory for PeerOverlay {
    async fn peers_with_capability(&self, kind: Particle) -> Vec<NodeId> {
        let peers = self.peers.read().await;
        let mut list: Vec<(&NodeId, u8)> = peers
            .iter()
            .filter(|(_, h)| h.capabilities.contains(&kind))
            .map(|(id, h)| (id, h.priority))
            .collect();
        list.sort_by_key(|(id, priority)| (*priority, (*id).clone()));
        list.into_iter().map(|(id, _)| id.clone()).collect()
    }
}

#[async_trait]
impl ReplicaFetch for PeerOverlay {
    async fn fetch_replica(
        &self,
        kind: Particle,
        shard_id: &str,
    ) -> Option<(Vec<u8>, Vec<u8>, Vec<u8>, NodeId)> {
        for node_id in self.peers_by_priority().await {
            match self.request_shard(&node_id, kind, shard_id).await {
                Ok(Some((ciphertext, iv, auth_tag))) => {
                    return Some((ciphertext, iv, auth_tag, node_id))
                }
                Ok(None) => continue,
                Err(e) => {
                    debug!(%node_id, error = %e, "replica fetch attempt failed");
                    continue;
                }
            }
        }
        None
    }
}

async fn write_frame<S, T>(stream: &mut S, value: &T) -> Result<(), OverlayError>
where
    S: AsyncWriteExt + Unpin,
    T: serde::Serialize,
{
    let data = bincode::serialize(value)
        .map_err(|e| OverlayError::Handshake(format!("encode: {e}")))?;
    stream.write_u32(data.len() as u32).await?;
    stream.write_all(&data).await?;
    stream.flush().await?;
    Ok(())
}

async fn read_frame<S, T>(stream: &mut S) -> Result<T, OverlayError>
where
    S: AsyncReadExt + Unpin,
    T: serde::de::DeserializeOwned,
{
    let len = stream.read_u32().await?;
    if len > MAX_FRAME_LEN {
        return Err(OverlayError::Handshake(format!("frame too large: {len}")));
    }
    let mut buf = vec![0u8; len as usize];
    stream.read_exact(&mut buf).await?;
    bincode::deserialize(&buf).map_err(|e| OverlayError::Handshake(format!("decode: {e}")))
}
