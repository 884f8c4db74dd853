//! Proof-of-Access consensus
//!
//! Agreement over ledger extensions across authenticated peers. Peers
//! validate a proposed block (record hashes and signatures, linkage against
//! the local head, PoA revalidation, shard integrity), emit signed votes,
//! and the proposer finalizes once a two-thirds quorum accepts. Competing
//! proposals for the same height are scored; forks rewind to the last common
//! record and replay, aborting on any token-state violation.

use crate::ledger::{
    Block, ConsensusDecision, ConsensusSubmit, LedgerRecord, LedgerReplace, LedgerView,
    RecordBody,
};
use crate::overlay::{BlockVote, MessageBus, PeerMessage};
use crate::storage::ShardIntegrity;
use crate::tokens::{TokenState, TokenStore, TokenValidate};
use crate::types::{Hash, NodeId, NodeSignature, RecordKind};
use async_trait::async_trait;
use atomvault_pqc::{KeyId, KeyProvider};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum ConsensusError {
    #[error("Consensus round timed out")]
    RoundTimeout,
    #[error("Quorum not reached: {accepts} of {needed} needed")]
    QuorumNotReached { accepts: usize, needed: usize },
    #[error("Block validation failed: {0}")]
    ValidationFailed(String),
    #[error("Token state violation: {0}")]
    TokenViolation(String),
    #[error("Key provider failure: {0}")]
    KeyProvider(#[from] atomvault_pqc::KeyProviderError),
}

/// Outcome of replaying a competing chain.
#[derive(Debug, Clone, PartialEq)]
pub enum ForkOutcome {
    Adopted { new_head: u64 },
    Refused(String),
}

/// Shared block validation: everything a peer checks before voting.
pub struct BlockValidator {
    ledger: Arc<dyn LedgerView>,
    tokens: Arc<dyn TokenValidate>,
    shards: Arc<dyn ShardIntegrity>,
    pow_difficulty: usize,
    pow_kinds: Vec<RecordKind>,
}

impl BlockValidator {
    pub fn new(
        ledger: Arc<dyn LedgerView>,
        tokens: Arc<dyn TokenValidate>,
        shards: Arc<dyn ShardIntegrity>,
        pow_difficulty: usize,
        pow_kinds: Vec<RecordKind>,
    ) -> Self {
        Self {
            ledger,
            tokens,
            shards,
            pow_difficulty,
            pow_kinds,
        }
    }

    fn pow_required(&self, kind: RecordKind) -> bool {
        self.pow_difficulty > 0 && self.pow_kinds.contains(&kind)
    }

    /// Validate one record structurally: hash, proof-of-work, signature.
    pub fn validate_record(&self, record: &LedgerRecord) -> Result<(), String> {
        if !record.hash_matches() {
            return Err(format!("record {} hash mismatch", record.index));
        }
        if self.pow_required(record.kind) && !record.satisfies_pow(self.pow_difficulty) {
            return Err(format!("record {} misses proof-of-work", record.index));
        }
        if !atomvault_pqc::dilithium_verify(
            record.hash.as_bytes(),
            &record.signature.signature,
            &record.signature.public_key,
        ) {
            return Err(format!("record {} signature invalid", record.index));
        }
        Ok(())
    }

    /// Full peer-side validation of a proposed block.
    pub async fn validate(&self, block: &Block) -> Result<(), String> {
        if block.records.is_empty() {
            return Err("empty block".into());
        }
        if !block.hash_matches() {
            return Err("block hash mismatch".into());
        }

        let address = block.records[0].body.ledger_address();
        for record in &block.records {
            if record.body.ledger_address() != address {
                return Err("block mixes ledger addresses".into());
            }
            self.validate_record(record)?;
        }

        // Linkage against the local head. A chain this peer does not track
        // cannot be disconfirmed; a tracked chain must be extended exactly.
        let head = self
            .ledger
            .head(&address)
            .await
            .map_err(|e| format!("head lookup failed: {e}"))?;
        let first = &block.records[0];
        match head {
            Some((head_index, head_hash)) => {
                if first.index != head_index + 1 || first.previous_hash != head_hash {
                    return Err(format!(
                        "previous hash does not extend head {head_index} of {address}"
                    ));
                }
            }
            None => {
                if first.index == 0 && first.previous_hash.bytes().any(|b| b != b'0') {
                    return Err(format!("genesis record of {address} has nonzero previous hash"));
                }
            }
        }
        // Intra-block linkage
        for pair in block.records.windows(2) {
            if pair[1].index != pair[0].index + 1 || pair[1].previous_hash != pair[0].hash {
                return Err(format!("broken intra-block link at {}", pair[1].index));
            }
        }

        for record in &block.records {
            // PoA revalidation; a mint introduces its token, nothing to
            // recheck, and a token this peer has not yet synced cannot be
            // disconfirmed
            if record.kind != RecordKind::TokenMint {
                if let Some(token_id) = record.body.token_id() {
                    match self.tokens.validate_record(token_id).await {
                        Ok(_) => {}
                        Err(crate::tokens::TokenError::TokenNotFound(_)) => {
                            debug!(token_id, "token unknown locally, not disconfirmed");
                        }
                        Err(e) => return Err(format!("token {token_id} rejected: {e}")),
                    }
                }
            }

            // Shard integrity for records that claim stored bytes
            match &record.body {
                RecordBody::ShardCreate(body) => {
                    for shard in &body.shards {
                        if !self.shards.confirm(shard.kind, &shard.shard_id).await {
                            return Err(format!("shard {} integrity denied", shard.shard_id));
                        }
                    }
                }
                RecordBody::ShardMove(body) => {
                    if !self.shards.confirm(body.kind, &body.shard_id).await {
                        return Err(format!("shard {} integrity denied", body.shard_id));
                    }
                }
                RecordBody::ShardRepair(body) => {
                    if !self.shards.confirm(body.kind, &body.shard_id).await {
                        return Err(format!("shard {} integrity denied", body.shard_id));
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }
}

/// Single-node consensus: the proposer validates its own block and accepts.
pub struct SoloConsensus {
    validator: BlockValidator,
}

impl SoloConsensus {
    pub fn new(validator: BlockValidator) -> Self {
        Self { validator }
    }
}

#[async_trait]
impl ConsensusSubmit for SoloConsensus {
    async fn submit(&self, block: Block) -> ConsensusDecision {
        match self.validator.validate(&block).await {
            Ok(()) => ConsensusDecision::Accepted,
            Err(reason) => ConsensusDecision::Rejected(reason),
        }
    }
}

/// Quorum consensus engine over the peer overlay.
pub struct ConsensusEngine {
    validator: BlockValidator,
    bus: Arc<dyn MessageBus>,
    token_store: Arc<dyn TokenStore>,
    ledger_view: Arc<dyn LedgerView>,
    ledger_replace: Arc<dyn LedgerReplace>,
    provider: Arc<dyn KeyProvider>,
    signing_key: KeyId,
    signing_public: Vec<u8>,
    node_id: NodeId,
    quorum_numerator: u32,
    quorum_denominator: u32,
    round_timeout: Duration,
    /// One in-flight proposal per node per round
    proposal_slot: Mutex<()>,
    /// Best proposal seen per (address, height) for the proposer race
    seen_proposals: Mutex<HashMap<(String, u64), (Hash, f64)>>,
}

impl ConsensusEngine {
    #[allow(clippy::too_many_arguments)]
    pub async fn new(
        validator: BlockValidator,
        bus: Arc<dyn MessageBus>,
        token_store: Arc<dyn TokenStore>,
        ledger_view: Arc<dyn LedgerView>,
        ledger_replace: Arc<dyn LedgerReplace>,
        provider: Arc<dyn KeyProvider>,
        signing_key: KeyId,
        node_id: NodeId,
        quorum: (u32, u32),
        round_timeout: Duration,
    ) -> Result<Self, ConsensusError> {
        let signing_public = provider.public_key(&signing_key).await?;
        Ok(Self {
            validator,
            bus,
            token_store,
            ledger_view,
            ledger_replace,
            provider,
            signing_key,
            signing_public,
            node_id,
            quorum_numerator: quorum.0,
            quorum_denominator: quorum.1,
            round_timeout,
            proposal_slot: Mutex::new(()),
            seen_proposals: Mutex::new(HashMap::new()),
        })
    }

    /// Votes needed out of `voters` total participants (the proposer is one
    /// of them and counts itself).
    fn quorum_needed(&self, voters: usize) -> usize {
        let num = self.quorum_numerator as usize;
        let den = self.quorum_denominator as usize;
        (voters * num).div_ceil(den)
    }

    async fn sign_vote(
        &self,
        block_hash: &str,
        accept: bool,
        reason: Option<String>,
    ) -> Result<BlockVote, ConsensusError> {
        let bytes = BlockVote::signing_bytes(block_hash, &self.node_id, accept);
        let signature = self.provider.sign(&self.signing_key, &bytes).await?;
        Ok(BlockVote {
            block_hash: block_hash.to_string(),
            voter_id: self.node_id.clone(),
            accept,
            reason,
            signature: NodeSignature {
                signature,
                public_key: self.signing_public.clone(),
            },
        })
    }

    fn vote_signature_valid(vote: &BlockVote) -> bool {
        atomvault_pqc::dilithium_verify(
            &BlockVote::signing_bytes(&vote.block_hash, &vote.voter_id, vote.accept),
            &vote.signature.signature,
            &vote.signature.public_key,
        )
    }

    /// Start the voter loop answering peer proposals and sync traffic.
    pub fn start(self: &Arc<Self>) {
        let engine = Arc::clone(self);
        let mut rx = self.bus.subscribe_consensus();
        tokio::spawn(async move {
            loop {
                let (from, message) = match rx.recv().await {
                    Ok(item) => item,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "consensus receiver lagged");
                        continue;
                    }
                    Err(_) => return,
                };
                match message {
                    PeerMessage::BlockPropose { block, proposer } => {
                        engine.handle_proposal(&from, &proposer, block).await;
                    }
                    PeerMessage::SyncResponse { address, records } => {
                        let outcome = engine.resolve_fork(&address, records).await;
                        debug!(%address, ?outcome, "sync response processed");
                    }
                    _ => {}
                }
            }
        });
    }

    /// Validate a peer proposal, apply the proposer-race rule, and vote.
    async fn handle_proposal(self: &Arc<Self>, from: &str, proposer: &str, block: Block) {
        let address = block
            .records
            .first()
            .map(|r| r.body.ledger_address())
            .unwrap_or_default();
        let height = block.index;

        let vote = match self.validator.validate(&block).await {
            Err(reason) => {
                debug!(proposer, %reason, "voting reject");
                // A stale head means this node is behind; ask the proposer
                // for the chain so fork resolution can catch up
                if reason.contains("does not extend head") {
                    let _ = self
                        .bus
                        .send_to(
                            from,
                            PeerMessage::SyncRequest {
                                address: address.clone(),
                                from_index: 0,
                            },
                        )
                        .await;
                }
                self.sign_vote(&block.hash, false, Some(reason)).await
            }
            Ok(()) => {
                // Proposer race: the higher score wins, ties break on the
                // lexicographically lower hash
                let score = block.score();
                let mut seen = self.seen_proposals.lock().await;
                let key = (address.clone(), height);
                let wins = match seen.get(&key) {
                    Some((best_hash, best_score)) => {
                        score > *best_score
                            || (score == *best_score && block.hash < *best_hash)
                    }
                    None => true,
                };
                if wins {
                    seen.insert(key, (block.hash.clone(), score));
                    self.sign_vote(&block.hash, true, None).await
                } else {
                    self.sign_vote(&block.hash, false, Some("lost proposer race".into()))
                        .await
                }
            }
        };

        match vote {
            Ok(vote) => {
                let _ = self.bus.send_to(from, PeerMessage::BlockVote(vote)).await;
            }
            Err(e) => warn!(error = %e, "vote signing failed"),
        }

        // Accepted blocks from peers are persisted once the proposer
        // finalizes; this node mirrors via sync on its next read.
    }

    /// Rewind to the last common record and replay a longer chain. Any
    /// record that would violate a token's state aborts the replay.
    pub async fn resolve_fork(
        &self,
        address: &str,
        incoming: Vec<LedgerRecord>,
    ) -> ForkOutcome {
        let local = match self.ledger_view.records(address).await {
            Ok(records) => records,
            Err(e) => return ForkOutcome::Refused(format!("local read failed: {e}")),
        };
        if incoming.len() <= local.len() {
            return ForkOutcome::Refused("incoming chain is not longer".into());
        }

        // Structural validation of the incoming chain
        for record in &incoming {
            if let Err(reason) = self.validator.validate_record(record) {
                return ForkOutcome::Refused(reason);
            }
        }
        for pair in incoming.windows(2) {
            if pair[1].index != pair[0].index + 1 || pair[1].previous_hash != pair[0].hash {
                return ForkOutcome::Refused(format!(
                    "incoming chain broken at {}",
                    pair[1].index
                ));
            }
        }

        // Last common record
        let mut common = 0usize;
        for (a, b) in local.iter().zip(incoming.iter()) {
            if a.hash == b.hash {
                common += 1;
            } else {
                break;
            }
        }

        // Replay the divergent suffix against token state
        let mut sim_state: HashMap<String, TokenState> = HashMap::new();
        for record in &incoming[common..] {
            let violation = match &record.body {
                RecordBody::TokenRedeem(body) => {
                    let state = self.effective_state(&mut sim_state, &body.token_id).await;
                    match state {
                        Some(TokenState::Active) | None => {
                            sim_state.insert(body.token_id.clone(), TokenState::Redeemed);
                            None
                        }
                        Some(TokenState::Redeemed) => {
                            Some(format!("double redeem of {}", body.token_id))
                        }
                        Some(TokenState::Revoked) => {
                            Some(format!("redeem of revoked {}", body.token_id))
                        }
                    }
                }
                RecordBody::TokenRevoke(body) => {
                    sim_state.insert(body.token_id.clone(), TokenState::Revoked);
                    None
                }
                other => {
                    if let Some(token_id) = other.token_id() {
                        let state = self.effective_state(&mut sim_state, token_id).await;
                        match state {
                            Some(TokenState::Revoked) => {
                                Some(format!("post-revoke usage of {token_id}"))
                            }
                            _ => None,
                        }
                    } else {
                        None
                    }
                }
            };
            if let Some(reason) = violation {
                // Stay on the current head; HQ arbitration is requested by
                // the operator when configured
                warn!(address, %reason, "fork replay aborted");
                return ForkOutcome::Refused(reason);
            }
        }

        let new_head = incoming.last().map(|r| r.index).unwrap_or(0);
        match self.ledger_replace.replace_chain(address, incoming).await {
            Ok(()) => {
                info!(address, new_head, "fork resolved, longer chain adopted");
                ForkOutcome::Adopted { new_head }
            }
            Err(e) => ForkOutcome::Refused(format!("chain replace failed: {e}")),
        }
    }

    async fn effective_state(
        &self,
        sim: &mut HashMap<String, TokenState>,
        token_id: &str,
    ) -> Option<TokenState> {
        if let Some(state) = sim.get(token_id) {
            return Some(*state);
        }
        self.token_store.state_of(token_id).await
    }
}

#[async_trait]
impl ConsensusSubmit for ConsensusEngine {
    async fn submit(&self, block: Block) -> ConsensusDecision {
        // One proposal in flight per round
        let _slot = self.proposal_slot.lock().await;

        if let Err(reason) = self.validator.validate(&block).await {
            return ConsensusDecision::Rejected(reason);
        }

        let peers = self.bus.peer_count().await;
        // The proposer counts itself: quorum is over peers plus this node,
        // and a validated own proposal is an automatic self-accept
        let voters = peers + 1;
        let needed = self.quorum_needed(voters);
        let mut accepts = 1usize;
        if accepts >= needed {
            return ConsensusDecision::Accepted;
        }

        let mut rx = self.bus.subscribe_consensus();
        let reached = self
            .bus
            .broadcast(PeerMessage::BlockPropose {
                block: block.clone(),
                proposer: self.node_id.clone(),
            })
            .await;
        if accepts + reached < needed {
            return ConsensusDecision::Rejected(format!(
                "only {reached} of {needed} voters reachable"
            ));
        }

        let mut rejects = 0usize;
        let mut first_reason: Option<String> = None;
        let deadline = tokio::time::Instant::now() + self.round_timeout;

        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return ConsensusDecision::Rejected("consensus round timed out".into());
            }
            let next = tokio::time::timeout(remaining, rx.recv()).await;
            let (_, message) = match next {
                Ok(Ok(item)) => item,
                Ok(Err(tokio::sync::broadcast::error::RecvError::Lagged(_))) => continue,
                Ok(Err(_)) => {
                    return ConsensusDecision::Rejected("vote channel closed".into())
                }
                Err(_) => {
                    return ConsensusDecision::Rejected("consensus round timed out".into())
                }
            };
            let vote = match message {
                PeerMessage::BlockVote(vote) if vote.block_hash == block.hash => vote,
                _ => continue,
            };
            if !Self::vote_signature_valid(&vote) {
                warn!(voter = %vote.voter_id, "vote signature invalid, ignored");
                continue;
            }

            if vote.accept {
                accepts += 1;
                if accepts >= needed {
                    debug!(accepts, needed, "quorum reached");
                    return ConsensusDecision::Accepted;
                }
            } else {
                rejects += 1;
                if first_reason.is_none() {
                    first_reason = vote.reason.clone();
                }
                // Quorum unreachable once too many voters said no
                if rejects > voters.saturating_sub(needed) {
                    return ConsensusDecision::Rejected(
                        first_reason.unwrap_or_else(|| "rejected by quorum".into()),
                    );
                }
            }
        }
    }
}
