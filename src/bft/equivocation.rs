// src/bft/equivocation.rs
// C9 part 1: equivocation detection. Tracks (height -> phase -> validatorId
// -> blockHash) over a sliding window of the most recent `max_tracked_heights`
// heights; a second distinct hash for the same tuple is evidence. Grounded in
// the teacher's bft/state.rs vote-tracking map, generalized from HotStuff
// view numbers to BFT round heights and phases.

use crate::bft::messages::VotePhase;
use crate::signer::{address_to_hex, Address};
use std::collections::{HashMap, VecDeque};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EquivocationEvidence {
    pub height: u64,
    pub phase: VotePhase,
    pub validator: Address,
    pub first_hash: String,
    pub second_hash: String,
}

pub struct EquivocationDetector {
    max_tracked_heights: usize,
    seen: HashMap<u64, HashMap<(VotePhase, Address), String>>,
    height_order: VecDeque<u64>,
}

impl EquivocationDetector {
    pub fn new(max_tracked_heights: usize) -> Self {
        EquivocationDetector {
            max_tracked_heights,
            seen: HashMap::new(),
            height_order: VecDeque::new(),
        }
    }

    /// Offers a vote to the detector. Returns `Some(evidence)` on a second
    /// distinct hash for the same (height, phase, validator) tuple; the
    /// caller is expected to drop the vote and surface the evidence.
    pub fn observe(
        &mut self,
        height: u64,
        phase: VotePhase,
        validator: Address,
        block_hash: &str,
    ) -> Option<EquivocationEvidence> {
        if let std::collections::hash_map::Entry::Vacant(e) = self.seen.entry(height) {
            e.insert(HashMap::new());
            self.height_order.push_back(height);
            self.evict_oldest_past_window();
        }
        let per_height = self.seen.get_mut(&height).unwrap();
        match per_height.get(&(phase, validator)) {
            Some(existing) if existing != block_hash => Some(EquivocationEvidence {
                height,
                phase,
                validator,
                first_hash: existing.clone(),
                second_hash: block_hash.to_string(),
            }),
            Some(_) => None,
            None => {
                per_height.insert((phase, validator), block_hash.to_string());
                None
            }
        }
    }

    fn evict_oldest_past_window(&mut self) {
        while self.height_order.len() > self.max_tracked_heights {
            if let Some(oldest) = self.height_order.pop_front() {
                self.seen.remove(&oldest);
            } else {
                break;
            }
        }
    }

    pub fn tracked_heights(&self) -> usize {
        self.seen.len()
    }
}

impl std::fmt::Display for EquivocationEvidence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "validator {} equivocated at height {} phase {:?}: {} vs {}",
            address_to_hex(&self.validator),
            self.height,
            self.phase,
            self.first_hash,
            self.second_hash
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(byte: u8) -> Address {
        let mut a = [0u8; 20];
        a[19] = byte;
        a
    }

    #[test]
    fn first_vote_for_a_height_is_never_evidence() {
        let mut det = EquivocationDetector::new(100);
        assert!(det.observe(1, VotePhase::Prepare, addr(1), "0xa").is_none());
    }

    #[test]
    fn same_hash_twice_is_not_evidence() {
        let mut det = EquivocationDetector::new(100);
        det.observe(1, VotePhase::Prepare, addr(1), "0xa");
        assert!(det.observe(1, VotePhase::Prepare, addr(1), "0xa").is_none());
    }

    #[test]
    fn distinct_hash_same_tuple_is_evidence() {
        let mut det = EquivocationDetector::new(100);
        det.observe(1, VotePhase::Prepare, addr(1), "0xa");
        let evidence = det.observe(1, VotePhase::Prepare, addr(1), "0xb").unwrap();
        assert_eq!(evidence.first_hash, "0xa");
        assert_eq!(evidence.second_hash, "0xb");
    }

    #[test]
    fn distinct_phases_do_not_collide() {
        let mut det = EquivocationDetector::new(100);
        det.observe(1, VotePhase::Prepare, addr(1), "0xa");
        assert!(det.observe(1, VotePhase::Commit, addr(1), "0xb").is_none());
    }

    #[test]
    fn old_heights_are_evicted_past_the_window() {
        let mut det = EquivocationDetector::new(3);
        det.observe(1, VotePhase::Prepare, addr(1), "0xa");
        det.observe(2, VotePhase::Prepare, addr(1), "0xa");
        det.observe(3, VotePhase::Prepare, addr(1), "0xa");
        det.observe(4, VotePhase::Prepare, addr(1), "0xa");
        // height 1 should have been evicted; a "different" hash there no longer triggers.
        assert!(det.observe(1, VotePhase::Prepare, addr(1), "0xZZZ").is_none());
    }
}
