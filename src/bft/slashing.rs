// src/bft/slashing.rs
// C9 part 2: slashing handler. Consumes equivocation evidence, reduces a
// validator's stake, deposits the slashed amount into the treasury, and
// auto-deactivates validators that fall below the minimum stake. Grounded in
// the teacher's SlashingReason/SlashingSeverity enums and chrono timestamps,
// replaced with the spec's single-reason (equivocation) percentage model and
// a line-delimited JSON evidence log instead of RocksDB.

use crate::bft::equivocation::EquivocationEvidence;
use crate::signer::address_to_hex;
use crate::validators::ValidatorSet;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::io::Write;
use std::path::PathBuf;

pub const MIN_HISTORY_CAPACITY: usize = 10_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlashingEvent {
    pub validator: String,
    pub height: u64,
    pub slashed_amount: u128,
    pub remaining_stake: u128,
    pub deactivated: bool,
    pub occurred_at: DateTime<Utc>,
}

pub struct SlashingConfig {
    /// Percentage of stake slashed per equivocation, bounds-checked 0-100.
    pub slash_percent: u8,
    pub min_stake: u128,
    pub auto_remove: bool,
    pub evidence_log_path: Option<PathBuf>,
}

impl Default for SlashingConfig {
    fn default() -> Self {
        SlashingConfig {
            slash_percent: 10,
            min_stake: 0,
            auto_remove: true,
            evidence_log_path: None,
        }
    }
}

impl SlashingConfig {
    pub fn with_slash_percent(mut self, percent: u8) -> Self {
        self.slash_percent = percent.min(100);
        self
    }
}

pub struct SlashingHandler {
    config: SlashingConfig,
    treasury: u128,
    history: VecDeque<SlashingEvent>,
    history_capacity: usize,
}

impl SlashingHandler {
    pub fn new(config: SlashingConfig) -> Self {
        SlashingHandler {
            config,
            treasury: 0,
            history: VecDeque::new(),
            history_capacity: MIN_HISTORY_CAPACITY,
        }
    }

    pub fn treasury_balance(&self) -> u128 {
        self.treasury
    }

    pub fn history(&self) -> impl Iterator<Item = &SlashingEvent> {
        self.history.iter()
    }

    /// Applies slashing for `evidence` against `validators`. Unknown or
    /// already-inactive validators are logged and ignored.
    pub fn handle(&mut self, evidence: &EquivocationEvidence, validators: &mut ValidatorSet) -> Option<SlashingEvent> {
        let validator = validators.get_mut(&evidence.validator)?;
        if !validator.active {
            tracing::info!(
                validator = %address_to_hex(&evidence.validator),
                "ignoring equivocation evidence for already-inactive validator"
            );
            return None;
        }

        let percent = self.config.slash_percent.min(100) as u128;
        let slash_amount = validator.stake * percent / 100;
        validator.stake = validator.stake.saturating_sub(slash_amount);
        self.treasury += slash_amount;

        let deactivated = if validator.stake < self.config.min_stake && self.config.auto_remove {
            validator.active = false;
            true
        } else {
            false
        };

        let event = SlashingEvent {
            validator: address_to_hex(&evidence.validator),
            height: evidence.height,
            slashed_amount: slash_amount,
            remaining_stake: validator.stake,
            deactivated,
            occurred_at: Utc::now(),
        };

        self.history.push_back(event.clone());
        while self.history.len() > self.history_capacity {
            self.history.pop_front();
        }

        if let Some(path) = &self.config.evidence_log_path {
            if let Err(e) = append_evidence_log(path, &event) {
                tracing::warn!(error = %e, "failed to append slashing evidence log");
            }
        }

        Some(event)
    }
}

fn append_evidence_log(path: &PathBuf, event: &SlashingEvent) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
    let line = serde_json::to_string(event)?;
    writeln!(file, "{line}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signer::Address;
    use crate::validators::Validator;

    fn addr(byte: u8) -> Address {
        let mut a = [0u8; 20];
        a[19] = byte;
        a
    }

    fn evidence(validator: Address) -> EquivocationEvidence {
        EquivocationEvidence {
            height: 5,
            phase: crate::bft::messages::VotePhase::Prepare,
            validator,
            first_hash: "0xa".into(),
            second_hash: "0xb".into(),
        }
    }

    #[test]
    fn default_ten_percent_slash_moves_stake_to_treasury() {
        let mut validators = ValidatorSet::new(vec![Validator { id: addr(1), stake: 1000, active: true }]);
        let mut handler = SlashingHandler::new(SlashingConfig::default());
        let event = handler.handle(&evidence(addr(1)), &mut validators).unwrap();
        assert_eq!(event.slashed_amount, 100);
        assert_eq!(event.remaining_stake, 900);
        assert_eq!(handler.treasury_balance(), 100);
        assert_eq!(validators.get(&addr(1)).unwrap().stake, 900);
    }

    #[test]
    fn falling_below_min_stake_deactivates_when_auto_remove_set() {
        let mut validators = ValidatorSet::new(vec![Validator { id: addr(1), stake: 100, active: true }]);
        let config = SlashingConfig::default().with_slash_percent(50);
        let mut config = config;
        config.min_stake = 60;
        let mut handler = SlashingHandler::new(config);
        let event = handler.handle(&evidence(addr(1)), &mut validators).unwrap();
        assert!(event.deactivated);
        assert!(!validators.get(&addr(1)).unwrap().active);
    }

    #[test]
    fn inactive_validator_is_ignored() {
        let mut validators = ValidatorSet::new(vec![Validator { id: addr(1), stake: 100, active: false }]);
        let mut handler = SlashingHandler::new(SlashingConfig::default());
        assert!(handler.handle(&evidence(addr(1)), &mut validators).is_none());
        assert_eq!(handler.treasury_balance(), 0);
    }

    #[test]
    fn unknown_validator_is_ignored() {
        let mut validators = ValidatorSet::new(vec![]);
        let mut handler = SlashingHandler::new(SlashingConfig::default());
        assert!(handler.handle(&evidence(addr(1)), &mut validators).is_none());
    }

    #[test]
    fn evidence_log_is_appended_as_line_delimited_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("evidence.log");
        let config = SlashingConfig { evidence_log_path: Some(path.clone()), ..Default::default() };
        let mut validators = ValidatorSet::new(vec![Validator { id: addr(1), stake: 1000, active: true }]);
        let mut handler = SlashingHandler::new(config);
        handler.handle(&evidence(addr(1)), &mut validators);
        handler.handle(&evidence(addr(1)), &mut validators);
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 2);
    }
}
