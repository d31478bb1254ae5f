// src/validators.rs
// Validator set shared by the BFT round (stake-weighted quorum) and the
// chain engine (round-robin proposer election). Grounded in the teacher's
// validator_registry.rs, generalized from a pubkey-only registry to the
// spec's {id, stake, active} model.

use crate::signer::{address_to_hex, Address};
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct Validator {
    pub id: Address,
    pub stake: u128,
    pub active: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ValidatorSet {
    validators: HashMap<Address, Validator>,
}

impl ValidatorSet {
    pub fn new(validators: Vec<Validator>) -> Self {
        ValidatorSet {
            validators: validators.into_iter().map(|v| (v.id, v)).collect(),
        }
    }

    pub fn get(&self, id: &Address) -> Option<&Validator> {
        self.validators.get(id)
    }

    pub fn get_mut(&mut self, id: &Address) -> Option<&mut Validator> {
        self.validators.get_mut(id)
    }

    pub fn total_active_stake(&self) -> u128 {
        self.validators.values().filter(|v| v.active).map(|v| v.stake).sum()
    }

    /// Quorum threshold = floor(2 * total_active_stake / 3) + 1.
    pub fn quorum_threshold(&self) -> u128 {
        let total = self.total_active_stake();
        (2 * total) / 3 + 1
    }

    pub fn has_quorum(&self, voters: &[Address]) -> bool {
        let accumulated: u128 = voters
            .iter()
            .filter_map(|id| self.validators.get(id))
            .filter(|v| v.active)
            .map(|v| v.stake)
            .sum();
        accumulated >= self.quorum_threshold()
    }

    /// Round-robin election as `validators_sorted_by_id[height mod |V|]`
    /// (spec §9 redesign flag — stable under validator departures, unlike
    /// insertion-order election).
    pub fn expected_proposer(&self, height: u64) -> Option<Address> {
        let mut active: Vec<&Address> = self
            .validators
            .values()
            .filter(|v| v.active)
            .map(|v| &v.id)
            .collect();
        if active.is_empty() {
            return None;
        }
        active.sort_by_key(|id| address_to_hex(id));
        let idx = (height as usize) % active.len();
        Some(*active[idx])
    }

    pub fn iter(&self) -> impl Iterator<Item = &Validator> {
        self.validators.values()
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
    fn three_way_equal_stake_quorum_is_201() {
        let set = ValidatorSet::new(vec![
            Validator { id: addr(1), stake: 100, active: true },
            Validator { id: addr(2), stake: 100, active: true },
            Validator { id: addr(3), stake: 100, active: true },
        ]);
        assert_eq!(set.quorum_threshold(), 201);
        assert!(!set.has_quorum(&[addr(1), addr(2)]));
        assert!(set.has_quorum(&[addr(1), addr(2), addr(3)]));
    }

    #[test]
    fn proposer_election_is_stable_sorted_round_robin() {
        let set = ValidatorSet::new(vec![
            Validator { id: addr(3), stake: 1, active: true },
            Validator { id: addr(1), stake: 1, active: true },
            Validator { id: addr(2), stake: 1, active: true },
        ]);
        let p0 = set.expected_proposer(0).unwrap();
        let p1 = set.expected_proposer(1).unwrap();
        let p2 = set.expected_proposer(2).unwrap();
        assert_eq!(p0, addr(1));
        assert_eq!(p1, addr(2));
        assert_eq!(p2, addr(3));
    }

    #[test]
    fn inactive_validators_do_not_count_towards_quorum_or_election() {
        let set = ValidatorSet::new(vec![
            Validator { id: addr(1), stake: 100, active: true },
            Validator { id: addr(2), stake: 100, active: false },
        ]);
        assert_eq!(set.quorum_threshold(), 67);
        assert_eq!(set.expected_proposer(1), Some(addr(1)));
    }
}
