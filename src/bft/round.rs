// src/bft/round.rs
// C7 BFT Round: pure propose -> prepare -> commit -> finalized/failed state
// machine. No I/O — the coordinator (C8) owns timers and broadcasting.

use crate::bft::messages::{BftMessage, VotePhase};
use crate::signer::Address;
use crate::validators::ValidatorSet;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Propose,
    Prepare,
    Commit,
    Finalized,
    Failed,
}

#[derive(Debug, Clone)]
pub struct ProposedBlock {
    pub number: u64,
    pub hash: String,
}

/// Outcome of handling a vote, so the coordinator knows what I/O to perform
/// without the round itself doing any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VoteOutcome {
    /// Vote recorded, no phase change.
    Accepted,
    /// Vote belongs to an unknown validator or a different block hash.
    Dropped,
    /// Same validator, same phase, different hash — equivocation.
    Equivocation,
    /// Entered prepare: emit our own prepare vote/message.
    EnteredPrepare(BftMessage),
    /// Entered commit: emit our own commit vote/message.
    EnteredCommit(BftMessage),
    /// Reached quorum on commit votes: round is finalized.
    Finalized,
}

pub struct BftRoundState {
    pub height: u64,
    pub phase: Phase,
    pub proposed_block: Option<ProposedBlock>,
    pub prepare_votes: HashMap<Address, String>,
    pub commit_votes: HashMap<Address, String>,
    pub started_at_ms: u64,
    local_id: Address,
    is_validator: bool,
}

impl BftRoundState {
    pub fn new(height: u64, local_id: Address, is_validator: bool, started_at_ms: u64) -> Self {
        BftRoundState {
            height,
            phase: Phase::Propose,
            proposed_block: None,
            prepare_votes: HashMap::new(),
            commit_votes: HashMap::new(),
            started_at_ms,
            local_id,
            is_validator,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.phase, Phase::Finalized | Phase::Failed)
    }

    pub fn local_id(&self) -> Address {
        self.local_id
    }

    /// propose -> prepare: block number must equal the round height.
    pub fn propose(&mut self, block_number: u64, block_hash: String, signer: &crate::signer::NodeSigner) -> Option<BftMessage> {
        if self.phase != Phase::Propose || block_number != self.height {
            return None;
        }
        self.proposed_block = Some(ProposedBlock {
            number: block_number,
            hash: block_hash.clone(),
        });
        self.phase = Phase::Prepare;

        if self.is_validator {
            let msg = BftMessage::sign(VotePhase::Prepare, self.height, block_hash.clone(), signer);
            self.prepare_votes.insert(self.local_id, block_hash);
            Some(msg)
        } else {
            None
        }
    }

    /// Offers a vote to the round. `known_validator` gates unknown-sender
    /// drops; equivocation detection itself lives in C9 and is expected to
    /// run *before* this call — if it returns true here the caller should
    /// already have surfaced evidence.
    pub fn handle_vote(
        &mut self,
        msg: &BftMessage,
        validators: &ValidatorSet,
        signer: &crate::signer::NodeSigner,
    ) -> VoteOutcome {
        if validators.get(&msg.sender_id).is_none() {
            return VoteOutcome::Dropped;
        }
        let proposed_hash = match &self.proposed_block {
            Some(b) => b.hash.clone(),
            None => return VoteOutcome::Dropped,
        };
        if msg.block_hash != proposed_hash {
            return VoteOutcome::Dropped;
        }

        match msg.phase {
            VotePhase::Prepare => {
                if self.phase as u8 > Phase::Prepare as u8 && self.phase != Phase::Prepare {
                    // votes for a phase we've already left are still counted
                    // towards history but cannot re-trigger a transition.
                }
                match self.prepare_votes.get(&msg.sender_id) {
                    Some(existing) if existing == &msg.block_hash => return VoteOutcome::Accepted,
                    Some(_) => return VoteOutcome::Equivocation,
                    None => {
                        self.prepare_votes.insert(msg.sender_id, msg.block_hash.clone());
                    }
                }
                if self.phase == Phase::Prepare {
                    let voters: Vec<Address> = self.prepare_votes.keys().copied().collect();
                    if validators.has_quorum(&voters) {
                        self.phase = Phase::Commit;
                        if self.is_validator {
                            let out = BftMessage::sign(VotePhase::Commit, self.height, proposed_hash.clone(), signer);
                            self.commit_votes.insert(self.local_id, proposed_hash);
                            return VoteOutcome::EnteredCommit(out);
                        }
                    }
                }
                VoteOutcome::Accepted
            }
            VotePhase::Commit => {
                match self.commit_votes.get(&msg.sender_id) {
                    Some(existing) if existing == &msg.block_hash => return VoteOutcome::Accepted,
                    Some(_) => return VoteOutcome::Equivocation,
                    None => {
                        self.commit_votes.insert(msg.sender_id, msg.block_hash.clone());
                    }
                }
                if matches!(self.phase, Phase::Prepare | Phase::Commit) {
                    let voters: Vec<Address> = self.commit_votes.keys().copied().collect();
                    if validators.has_quorum(&voters) {
                        self.phase = Phase::Finalized;
                        return VoteOutcome::Finalized;
                    }
                }
                VoteOutcome::Accepted
            }
        }
    }

    pub fn timeout(&mut self) {
        if !self.is_terminal() {
            self.phase = Phase::Failed;
        }
    }
}
