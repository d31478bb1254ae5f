// src/bft/messages.rs
// BftMessage data model (spec §3, §6): the canonical, signer-agnostic shape
// BftRound and BftCoordinator operate on, distinct from the wire JSON
// encoding in network::messages.

use crate::signer::{self, Address};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VotePhase {
    Prepare,
    Commit,
}

impl VotePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            VotePhase::Prepare => "prepare",
            VotePhase::Commit => "commit",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BftMessage {
    pub phase: VotePhase,
    pub height: u64,
    pub block_hash: String,
    pub sender_id: Address,
    pub signature: [u8; 65],
}

impl BftMessage {
    /// Canonical signing string: `"bft:" type ":" height ":" blockHash`.
    pub fn canonical_string(phase: VotePhase, height: u64, block_hash: &str) -> String {
        format!("bft:{}:{}:{}", phase.as_str(), height, block_hash)
    }

    pub fn sign(phase: VotePhase, height: u64, block_hash: String, signer: &signer::NodeSigner) -> Self {
        let msg = Self::canonical_string(phase, height, &block_hash);
        let signature = signer.sign(&msg);
        BftMessage {
            phase,
            height,
            block_hash,
            sender_id: signer.node_id(),
            signature,
        }
    }

    /// Verifies the signature was produced by `sender_id` over this message's
    /// canonical string.
    pub fn verify(&self) -> bool {
        let msg = Self::canonical_string(self.phase, self.height, &self.block_hash);
        signer::verify(&msg, &self.signature, &self.sender_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signed_message_verifies() {
        let signer = signer::NodeSigner::generate();
        let msg = BftMessage::sign(VotePhase::Prepare, 1, "0xblock".into(), &signer);
        assert!(msg.verify());
    }

    #[test]
    fn tampering_with_height_breaks_verification() {
        let signer = signer::NodeSigner::generate();
        let mut msg = BftMessage::sign(VotePhase::Prepare, 1, "0xblock".into(), &signer);
        msg.height = 2;
        assert!(!msg.verify());
    }
}
