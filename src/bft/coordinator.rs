// src/bft/coordinator.rs
// C8 BFT Coordinator: owns the sole active BftRound, a bounded pending-
// message buffer, and one deferred block slot. Drives the timers the pure
// round state machine (C7) cannot own itself. Grounded in the teacher's
// bft/consensus.rs round-lifecycle/timer management, rebuilt around the
// propose/prepare/commit phases instead of HotStuff's QC chain.

use crate::bft::equivocation::{EquivocationDetector, EquivocationEvidence};
use crate::bft::messages::{BftMessage, VotePhase};
use crate::bft::round::{BftRoundState, Phase, VoteOutcome};
use crate::signer::{Address, NodeSigner};
use crate::validators::ValidatorSet;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::warn;

pub const PENDING_BUFFER_CAPACITY: usize = 50;
pub const HEIGHT_GAP_TOLERANCE: u64 = 10;
pub const LINGER_INTERVAL: Duration = Duration::from_millis(500);
pub const LINGER_DURATION: Duration = Duration::from_secs(3);
pub const COMMIT_RETRY_INTERVAL: Duration = Duration::from_secs(1);

struct DeferredBlock {
    number: u64,
    hash: String,
}

struct Inner {
    round: Option<BftRoundState>,
    pending: VecDeque<BftMessage>,
    deferred: Option<DeferredBlock>,
    detector: EquivocationDetector,
}

/// Callbacks the coordinator invokes; implemented by the chain engine (C10)
/// and the broadcast layer (C6/C5), kept as plain closures so the
/// coordinator itself stays free of wire/chain dependencies.
pub struct CoordinatorCallbacks {
    pub broadcast: Box<dyn Fn(BftMessage) + Send + Sync>,
    pub on_finalized: Box<dyn Fn(u64, String) + Send + Sync>,
    pub on_equivocation: Box<dyn Fn(EquivocationEvidence) + Send + Sync>,
}

pub struct BftCoordinator {
    signer: NodeSigner,
    prepare_timeout: Duration,
    commit_timeout: Duration,
    inner: Mutex<Inner>,
    callbacks: CoordinatorCallbacks,
    stop_notify: Arc<Notify>,
    timers: Mutex<Vec<JoinHandle<()>>>,
}

impl BftCoordinator {
    pub fn new(
        signer: NodeSigner,
        prepare_timeout: Duration,
        commit_timeout: Duration,
        max_tracked_heights: usize,
        callbacks: CoordinatorCallbacks,
    ) -> Arc<Self> {
        Arc::new(BftCoordinator {
            signer,
            prepare_timeout,
            commit_timeout,
            inner: Mutex::new(Inner {
                round: None,
                pending: VecDeque::new(),
                deferred: None,
                detector: EquivocationDetector::new(max_tracked_heights),
            }),
            callbacks,
            stop_notify: Arc::new(Notify::new()),
            timers: Mutex::new(Vec::new()),
        })
    }

    pub fn current_phase(&self) -> Option<Phase> {
        self.inner.lock().round.as_ref().map(|r| r.phase)
    }

    pub fn local_id(&self) -> Address {
        self.signer.node_id()
    }

    /// Starts a round for `block_number`/`block_hash`, deferring instead of
    /// preempting if the active round already has voting progress.
    pub fn start_round(self: &Arc<Self>, height: u64, block_number: u64, block_hash: String, is_validator: bool, validators: &ValidatorSet) {
        let mut inner = self.inner.lock();
        if let Some(active) = &inner.round {
            if !active.prepare_votes.is_empty() || !active.commit_votes.is_empty() {
                inner.deferred = Some(DeferredBlock { number: block_number, hash: block_hash });
                return;
            }
        }
        self.begin_round_locked(&mut inner, height, block_number, block_hash, is_validator, validators);
    }

    /// Shared by `start_round` (fresh lock) and `finalize_locked` (lock
    /// already held, re-entering for a previously deferred block). Must
    /// never call back into `start_round` or otherwise re-lock `self.inner`.
    fn begin_round_locked(
        self: &Arc<Self>,
        inner: &mut Inner,
        height: u64,
        block_number: u64,
        block_hash: String,
        is_validator: bool,
        validators: &ValidatorSet,
    ) {
        let local_id = self.signer.node_id();
        inner.round = None;

        let mut round = BftRoundState::new(height, local_id, is_validator, 0);
        if let Some(msg) = round.propose(block_number, block_hash, &self.signer) {
            (self.callbacks.broadcast)(msg);
        }
        inner.round = Some(round);

        self.drain_pending_locked(inner, height, validators);
        self.spawn_round_timers(height);
    }

    fn drain_pending_locked(self: &Arc<Self>, inner: &mut Inner, height: u64, validators: &ValidatorSet) {
        let mut prepares = Vec::new();
        let mut commits = Vec::new();
        inner.pending.retain(|m| {
            if m.height != height {
                return true;
            }
            match m.phase {
                VotePhase::Prepare => prepares.push(m.clone()),
                VotePhase::Commit => commits.push(m.clone()),
            }
            false
        });
        for msg in prepares.into_iter().chain(commits) {
            self.apply_vote_locked(inner, msg, validators);
        }
    }

    /// Verifies the signature, then either buffers the message (future
    /// height within the gap tolerance) or offers it to the active round.
    pub fn handle_message(self: &Arc<Self>, msg: BftMessage, validators: &ValidatorSet) {
        if !msg.verify() {
            warn!("dropping bft message with invalid signature");
            return;
        }
        let mut inner = self.inner.lock();
        let current_height = inner.round.as_ref().map(|r| r.height);

        match current_height {
            Some(h) if msg.height == h => self.apply_vote_locked(&mut inner, msg, validators),
            Some(h) if msg.height > h && msg.height - h <= HEIGHT_GAP_TOLERANCE => {
                if inner.pending.len() >= PENDING_BUFFER_CAPACITY {
                    inner.pending.pop_front();
                }
                inner.pending.push_back(msg);
            }
            _ => {}
        }
    }

    /// Every prepare/commit is offered to the equivocation detector before
    /// counting; on detection, the vote is dropped and `onEquivocation` fires.
    fn apply_vote_locked(self: &Arc<Self>, inner: &mut Inner, msg: BftMessage, validators: &ValidatorSet) {
        if let Some(evidence) = inner.detector.observe(msg.height, msg.phase, msg.sender_id, &msg.block_hash) {
            (self.callbacks.on_equivocation)(evidence);
            return;
        }

        let outcome = match &mut inner.round {
            Some(round) if round.height == msg.height => round.handle_vote(&msg, validators, &self.signer),
            _ => return,
        };

        match outcome {
            VoteOutcome::EnteredCommit(own_commit) => {
                (self.callbacks.broadcast)(own_commit);
            }
            VoteOutcome::Finalized => {
                let (number, hash) = match &inner.round {
                    Some(round) => match &round.proposed_block {
                        Some(block) => (block.number, block.hash.clone()),
                        None => return,
                    },
                    None => return,
                };
                self.finalize_locked(inner, number, hash, validators);
            }
            VoteOutcome::Accepted | VoteOutcome::Dropped | VoteOutcome::Equivocation | VoteOutcome::EnteredPrepare(_) => {}
        }
    }

    fn finalize_locked(self: &Arc<Self>, inner: &mut Inner, number: u64, hash: String, validators: &ValidatorSet) {
        (self.callbacks.on_finalized)(number, hash.clone());
        inner.round = None;
        self.spawn_linger_broadcast(number, hash);

        if let Some(deferred) = inner.deferred.take() {
            let is_validator = validators.get(&self.signer.node_id()).is_some();
            self.begin_round_locked(inner, deferred.number, deferred.number, deferred.hash, is_validator, validators);
        }
    }

    fn spawn_linger_broadcast(self: &Arc<Self>, height: u64, hash: String) {
        let coordinator = self.clone();
        let stop = self.stop_notify.clone();
        let handle = tokio::spawn(async move {
            let ticks = (LINGER_DURATION.as_millis() / LINGER_INTERVAL.as_millis()) as u32;
            for _ in 0..ticks {
                tokio::select! {
                    _ = tokio::time::sleep(LINGER_INTERVAL) => {
                        let msg = BftMessage::sign(VotePhase::Commit, height, hash.clone(), &coordinator.signer);
                        (coordinator.callbacks.broadcast)(msg);
                    }
                    _ = stop.notified() => break,
                }
            }
        });
        self.timers.lock().push(handle);
    }

    pub fn stop(&self) {
        self.stop_notify.notify_waiters();
        let mut timers = self.timers.lock();
        for t in timers.drain(..) {
            t.abort();
        }
    }

    fn spawn_round_timers(self: &Arc<Self>, height: u64) {
        let total_timeout = self.prepare_timeout + self.commit_timeout;
        let coordinator = self.clone();
        let stop = self.stop_notify.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(total_timeout) => {
                    coordinator.on_round_timeout(height);
                }
                _ = stop.notified() => {}
            }
        });
        self.timers.lock().push(handle);

        let coordinator = self.clone();
        let stop = self.stop_notify.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(COMMIT_RETRY_INTERVAL) => {
                        if !coordinator.retry_commit_if_in_commit_phase(height) {
                            break;
                        }
                    }
                    _ = stop.notified() => break,
                }
            }
        });
        self.timers.lock().push(handle);
    }

    fn retry_commit_if_in_commit_phase(&self, height: u64) -> bool {
        let inner = self.inner.lock();
        match &inner.round {
            Some(round) if round.height == height && round.phase == Phase::Commit => {
                if let Some(hash) = round.commit_votes.get(&round.local_id()) {
                    let msg = BftMessage::sign(VotePhase::Commit, height, hash.clone(), &self.signer);
                    (self.callbacks.broadcast)(msg);
                }
                true
            }
            Some(round) if round.height == height => round.phase == Phase::Prepare,
            _ => false,
        }
    }

    fn on_round_timeout(self: &Arc<Self>, height: u64) {
        let mut inner = self.inner.lock();
        if let Some(round) = &mut inner.round {
            if round.height == height && !round.is_terminal() {
                round.timeout();
                inner.round = None;
                let _ = inner.deferred.take();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signer::NodeSigner;
    use crate::validators::Validator;
    use std::sync::Mutex as StdMutex;

    fn three_validators() -> (Vec<NodeSigner>, ValidatorSet) {
        let signers: Vec<NodeSigner> = (0..3).map(|_| NodeSigner::generate()).collect();
        let set = ValidatorSet::new(
            signers
                .iter()
                .map(|s| Validator { id: s.node_id(), stake: 100, active: true })
                .collect(),
        );
        (signers, set)
    }

    struct Recorder {
        broadcasts: Arc<StdMutex<Vec<BftMessage>>>,
        finalized: Arc<StdMutex<Vec<(u64, String)>>>,
        equivocations: Arc<StdMutex<Vec<EquivocationEvidence>>>,
    }

    fn recording_coordinator(signer: NodeSigner) -> (Arc<BftCoordinator>, Recorder) {
        let broadcasts = Arc::new(StdMutex::new(Vec::new()));
        let finalized = Arc::new(StdMutex::new(Vec::new()));
        let equivocations = Arc::new(StdMutex::new(Vec::new()));

        let cb_broadcasts = broadcasts.clone();
        let cb_finalized = finalized.clone();
        let cb_equivocations = equivocations.clone();
        let callbacks = CoordinatorCallbacks {
            broadcast: Box::new(move |msg| cb_broadcasts.lock().unwrap().push(msg)),
            on_finalized: Box::new(move |number, hash| cb_finalized.lock().unwrap().push((number, hash))),
            on_equivocation: Box::new(move |evidence| cb_equivocations.lock().unwrap().push(evidence)),
        };
        let coordinator = BftCoordinator::new(signer, Duration::from_secs(30), Duration::from_secs(30), 10, callbacks);
        (coordinator, Recorder { broadcasts, finalized, equivocations })
    }

    #[tokio::test]
    async fn full_round_reaches_finalized_on_commit_quorum() {
        let (signers, validators) = three_validators();
        let (coordinator, rec) = recording_coordinator(signers[0].clone());

        coordinator.start_round(1, 1, "0xblock1".into(), true, &validators);
        assert_eq!(coordinator.current_phase(), Some(Phase::Prepare));

        let p1 = BftMessage::sign(VotePhase::Prepare, 1, "0xblock1".into(), &signers[1]);
        let p2 = BftMessage::sign(VotePhase::Prepare, 1, "0xblock1".into(), &signers[2]);
        coordinator.handle_message(p1, &validators);
        coordinator.handle_message(p2, &validators);
        assert_eq!(coordinator.current_phase(), Some(Phase::Commit));

        let c1 = BftMessage::sign(VotePhase::Commit, 1, "0xblock1".into(), &signers[1]);
        let c2 = BftMessage::sign(VotePhase::Commit, 1, "0xblock1".into(), &signers[2]);
        coordinator.handle_message(c1, &validators);
        coordinator.handle_message(c2, &validators);

        assert_eq!(rec.finalized.lock().unwrap().as_slice(), &[(1, "0xblock1".to_string())]);
        coordinator.stop();
    }

    #[tokio::test]
    async fn finalization_starts_the_deferred_block() {
        let (signers, validators) = three_validators();
        let (coordinator, rec) = recording_coordinator(signers[0].clone());

        coordinator.start_round(1, 1, "0xblock1".into(), true, &validators);
        // Local's own propose-derived prepare vote is already recorded, so this
        // second block is deferred rather than preempting round 1.
        coordinator.start_round(2, 2, "0xblock2".into(), true, &validators);
        assert_eq!(coordinator.current_phase(), Some(Phase::Prepare));

        let p1 = BftMessage::sign(VotePhase::Prepare, 1, "0xblock1".into(), &signers[1]);
        let p2 = BftMessage::sign(VotePhase::Prepare, 1, "0xblock1".into(), &signers[2]);
        coordinator.handle_message(p1, &validators);
        coordinator.handle_message(p2, &validators);

        let c1 = BftMessage::sign(VotePhase::Commit, 1, "0xblock1".into(), &signers[1]);
        let c2 = BftMessage::sign(VotePhase::Commit, 1, "0xblock1".into(), &signers[2]);
        coordinator.handle_message(c1, &validators);
        coordinator.handle_message(c2, &validators);

        assert_eq!(rec.finalized.lock().unwrap().as_slice(), &[(1, "0xblock1".to_string())]);
        // Round 2 should already be live, proposed off the deferred slot.
        assert_eq!(coordinator.current_phase(), Some(Phase::Prepare));
        let broadcasts = rec.broadcasts.lock().unwrap();
        assert!(broadcasts
            .iter()
            .any(|m| m.height == 2 && m.block_hash == "0xblock2" && m.phase == VotePhase::Prepare));
        drop(broadcasts);
        coordinator.stop();
    }

    #[tokio::test]
    async fn buffered_future_height_votes_drain_prepare_then_commit() {
        let (signers, validators) = three_validators();
        let (coordinator, rec) = recording_coordinator(signers[0].clone());

        coordinator.start_round(1, 1, "0xblock1".into(), true, &validators);
        let p1 = BftMessage::sign(VotePhase::Prepare, 1, "0xblock1".into(), &signers[1]);
        let p2 = BftMessage::sign(VotePhase::Prepare, 1, "0xblock1".into(), &signers[2]);
        let c1 = BftMessage::sign(VotePhase::Commit, 1, "0xblock1".into(), &signers[1]);
        let c2 = BftMessage::sign(VotePhase::Commit, 1, "0xblock1".into(), &signers[2]);

        // Votes for height 2 arrive before round 2 starts; buffered within gap tolerance.
        let p1_h2 = BftMessage::sign(VotePhase::Prepare, 2, "0xblock2".into(), &signers[1]);
        let p2_h2 = BftMessage::sign(VotePhase::Prepare, 2, "0xblock2".into(), &signers[2]);
        let c1_h2 = BftMessage::sign(VotePhase::Commit, 2, "0xblock2".into(), &signers[1]);
        let c2_h2 = BftMessage::sign(VotePhase::Commit, 2, "0xblock2".into(), &signers[2]);
        coordinator.handle_message(c2_h2, &validators);
        coordinator.handle_message(c1_h2, &validators);
        coordinator.handle_message(p2_h2, &validators);
        coordinator.handle_message(p1_h2, &validators);

        coordinator.handle_message(p1, &validators);
        coordinator.handle_message(p2, &validators);
        coordinator.handle_message(c1, &validators);
        coordinator.handle_message(c2, &validators);
        assert_eq!(rec.finalized.lock().unwrap().as_slice(), &[(1, "0xblock1".to_string())]);

        // Round 1 is finalized and cleared; starting round 2 now drains the
        // buffered height-2 votes in prepare-then-commit order.
        coordinator.start_round(2, 2, "0xblock2".into(), true, &validators);
        assert_eq!(
            rec.finalized.lock().unwrap().as_slice(),
            &[(1, "0xblock1".to_string()), (2, "0xblock2".to_string())]
        );
        coordinator.stop();
    }

    #[tokio::test]
    async fn equivocating_vote_is_surfaced_and_not_counted() {
        let (signers, validators) = three_validators();
        let (coordinator, rec) = recording_coordinator(signers[0].clone());

        coordinator.start_round(1, 1, "0xblock1".into(), true, &validators);
        let p1 = BftMessage::sign(VotePhase::Prepare, 1, "0xblock1".into(), &signers[1]);
        let p1_again = BftMessage::sign(VotePhase::Prepare, 1, "0xOTHER".into(), &signers[1]);
        coordinator.handle_message(p1, &validators);
        coordinator.handle_message(p1_again, &validators);

        let evidence = rec.equivocations.lock().unwrap();
        assert_eq!(evidence.len(), 1);
        assert_eq!(evidence[0].validator, signers[1].node_id());
        coordinator.stop();
    }

    #[tokio::test]
    async fn message_with_invalid_signature_is_dropped() {
        let (signers, validators) = three_validators();
        let (coordinator, rec) = recording_coordinator(signers[0].clone());

        coordinator.start_round(1, 1, "0xblock1".into(), true, &validators);
        let mut forged = BftMessage::sign(VotePhase::Prepare, 1, "0xblock1".into(), &signers[1]);
        forged.block_hash = "0xblock1_tampered".into();
        coordinator.handle_message(forged, &validators);

        assert!(rec.finalized.lock().unwrap().is_empty());
        coordinator.stop();
    }

    #[tokio::test]
    async fn stop_cancels_timers_without_panicking() {
        let (signers, validators) = three_validators();
        let (coordinator, _rec) = recording_coordinator(signers[0].clone());
        coordinator.start_round(1, 1, "0xblock1".into(), true, &validators);
        coordinator.stop();
        coordinator.stop();
    }
}
