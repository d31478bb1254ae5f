// src/chain.rs
// C10 Chain Engine: validates and applies blocks, proposes the next block
// when this node is the round-robin proposer, and adopts contiguous
// snapshot ranges atomically. EVM execution and persistence are external
// collaborators (`TxExecutor`, `ChainStore`) — storage is file-based JSON
// per the spec's non-goal on a full state database, grounded in the
// teacher's reconciliation.rs finalize-on-quorum flow and dag/validation.rs
// field-by-field block checks.

use crate::error::{CoreError, CoreResult};
use crate::signer::{self, Address};
use crate::validators::ValidatorSet;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use tiny_keccak::{Hasher, Keccak};

pub const MAX_CLOCK_DRIFT_MS: u64 = 60_000;

fn now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

fn keccak256_hex(data: &[u8]) -> String {
    let mut hasher = Keccak::v256();
    hasher.update(data);
    let mut out = [0u8; 32];
    hasher.finalize(&mut out);
    format!("0x{}", hex::encode(out))
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChainBlock {
    pub number: u64,
    pub hash: String,
    pub parent_hash: String,
    pub proposer: String,
    pub timestamp_ms: u64,
    pub txs: Vec<String>,
    pub finalized: bool,
    pub bft_finalized: bool,
    pub base_fee: u128,
    pub cumulative_weight: u128,
    pub signature: String,
}

impl ChainBlock {
    /// Canonical payload hashed for `hash` and signed for `signature`; does
    /// not include `hash`, `finalized`, `bftFinalized`, or `signature`
    /// themselves, so the hash commits to exactly the fields a peer can
    /// independently recompute.
    pub fn canonical_payload(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}|{}|{}",
            self.number,
            self.parent_hash,
            self.proposer,
            self.timestamp_ms,
            self.txs.join(","),
            self.base_fee,
            self.cumulative_weight,
        )
    }

    pub fn recompute_hash(&self) -> String {
        keccak256_hex(self.canonical_payload().as_bytes())
    }

    pub fn signing_message(hash: &str) -> String {
        format!("block:{hash}")
    }
}

pub const ZERO_HASH: &str = "0x0000000000000000000000000000000000000000000000000000000000000000";

/// External EVM/state-transition collaborator; out of scope for this crate
/// beyond the call boundary (spec non-goal on execution semantics).
#[async_trait]
pub trait TxExecutor: Send + Sync {
    async fn apply_txs(&self, block_number: u64, txs: &[String]) -> CoreResult<()>;
}

/// External persistence collaborator — JSON-file backed in this crate
/// rather than a full database, per the spec's storage non-goal.
#[async_trait]
pub trait ChainStore: Send + Sync {
    async fn tip(&self) -> Option<ChainBlock>;
    async fn get(&self, number: u64) -> Option<ChainBlock>;
    async fn put(&self, block: ChainBlock) -> CoreResult<()>;
    async fn mark_bft_finalized(&self, number: u64) -> CoreResult<()>;
}

pub struct ChainEngine<S: ChainStore, E: TxExecutor> {
    pub store: S,
    pub executor: E,
    pub require_signature: bool,
    pub finality_depth: u64,
}

impl<S: ChainStore, E: TxExecutor> ChainEngine<S, E> {
    pub fn new(store: S, executor: E, require_signature: bool, finality_depth: u64) -> Self {
        ChainEngine { store, executor, require_signature, finality_depth }
    }

    /// §4.10 applyBlock contract. `trusted_local` gates whether the caller's
    /// `bftFinalized` flag is honored (only C8's `onFinalized` path is
    /// trusted) and whether depth-finality is recomputed on import.
    pub async fn apply_block(&self, mut block: ChainBlock, trusted_local: bool) -> CoreResult<ChainBlock> {
        if block.recompute_hash() != block.hash {
            return Err(CoreError::BlockInvalid("hash does not match recomputed canonical payload".into()));
        }

        let parent = if block.number == 1 {
            if block.parent_hash != ZERO_HASH {
                return Err(CoreError::BlockInvalid("height-1 block must reference the zero hash".into()));
            }
            None
        } else {
            let tip = self.store.tip().await.ok_or_else(|| CoreError::BlockInvalid("no local tip to extend".into()))?;
            if block.parent_hash != tip.hash {
                return Err(CoreError::BlockInvalid("parentHash does not match local tip".into()));
            }
            Some(tip)
        };

        if let Some(parent) = &parent {
            if block.timestamp_ms <= parent.timestamp_ms {
                return Err(CoreError::BlockInvalid("timestamp does not advance past parent".into()));
            }
            if block.cumulative_weight != parent.cumulative_weight + 1 {
                return Err(CoreError::BlockInvalid("cumulativeWeight is not parent + 1".into()));
            }
        } else if block.cumulative_weight != 1 {
            return Err(CoreError::BlockInvalid("height-1 block must have cumulativeWeight 1".into()));
        }
        if block.timestamp_ms > now_ms() + MAX_CLOCK_DRIFT_MS {
            return Err(CoreError::BlockInvalid("timestamp too far in the future".into()));
        }

        if self.require_signature {
            let proposer = signer::address_from_hex(&block.proposer)
                .ok_or_else(|| CoreError::BlockInvalid("malformed proposer address".into()))?;
            let sig = hex::decode(&block.signature).map_err(|_| CoreError::BlockInvalid("malformed signature hex".into()))?;
            let msg = ChainBlock::signing_message(&block.hash);
            if !signer::verify(&msg, &sig, &proposer) {
                return Err(CoreError::BlockInvalid("proposer signature does not verify".into()));
            }
        }

        if !trusted_local {
            block.bft_finalized = false;
        }

        self.executor.apply_txs(block.number, &block.txs).await?;
        self.store.put(block.clone()).await?;
        self.recompute_depth_finality(block.number).await?;

        Ok(block)
    }

    async fn recompute_depth_finality(&self, new_tip: u64) -> CoreResult<()> {
        if new_tip < self.finality_depth {
            return Ok(());
        }
        let boundary = new_tip - self.finality_depth;
        let mut n = boundary;
        loop {
            match self.store.get(n).await {
                Some(b) if !b.finalized => {
                    let mut finalized = b;
                    finalized.finalized = true;
                    self.store.put(finalized).await?;
                }
                Some(_) => break,
                None => break,
            }
            if n == 0 {
                break;
            }
            n -= 1;
        }
        Ok(())
    }

    /// Called by C8's `onFinalized` — the only trusted path allowed to set
    /// `bftFinalized`.
    pub async fn mark_bft_finalized(&self, number: u64) -> CoreResult<()> {
        self.store.mark_bft_finalized(number).await
    }

    /// §4.10 proposeNextBlock — only the expected round-robin proposer
    /// produces a block for this height.
    pub async fn propose_next_block(&self, local_id: Address, validators: &ValidatorSet, txs: Vec<String>, base_fee: u128) -> Option<ChainBlock> {
        let tip = self.store.tip().await;
        let next_number = tip.as_ref().map(|t| t.number + 1).unwrap_or(1);
        if validators.expected_proposer(next_number) != Some(local_id) {
            return None;
        }
        let parent_hash = tip.as_ref().map(|t| t.hash.clone()).unwrap_or_else(|| ZERO_HASH.to_string());
        let cumulative_weight = tip.as_ref().map(|t| t.cumulative_weight + 1).unwrap_or(1);

        let mut block = ChainBlock {
            number: next_number,
            hash: String::new(),
            parent_hash,
            proposer: signer::address_to_hex(&local_id),
            timestamp_ms: now_ms(),
            txs,
            finalized: false,
            bft_finalized: false,
            base_fee,
            cumulative_weight,
            signature: String::new(),
        };
        block.hash = block.recompute_hash();
        Some(block)
    }

    /// §4.10 maybeAdoptSnapshot — imports a contiguous range atomically,
    /// rejecting ranges that overlap or leave a gap with the local tip.
    pub async fn maybe_adopt_snapshot(&self, blocks: Vec<ChainBlock>) -> CoreResult<usize> {
        if blocks.is_empty() {
            return Ok(0);
        }
        let tip_number = self.store.tip().await.map(|t| t.number).unwrap_or(0);
        let mut sorted = blocks;
        sorted.sort_by_key(|b| b.number);
        for w in sorted.windows(2) {
            if w[1].number != w[0].number + 1 {
                return Err(CoreError::BlockInvalid("snapshot range is not contiguous".into()));
            }
        }
        if sorted[0].number != tip_number + 1 {
            return Err(CoreError::BlockInvalid("snapshot range does not extend the local tip without gap or overlap".into()));
        }

        let mut applied = 0;
        for block in sorted {
            self.apply_block(block, false).await?;
            applied += 1;
        }
        Ok(applied)
    }
}

/// Reference in-memory `ChainStore`/`TxExecutor` used by tests and as a
/// template for a persistence-backed implementation.
pub mod memory {
    use super::*;
    use std::collections::HashMap;
    use tokio::sync::RwLock;

    #[derive(Default)]
    pub struct InMemoryChainStore {
        blocks: RwLock<HashMap<u64, ChainBlock>>,
        tip_number: RwLock<Option<u64>>,
    }

    #[async_trait]
    impl ChainStore for InMemoryChainStore {
        async fn tip(&self) -> Option<ChainBlock> {
            let tip = (*self.tip_number.read().await)?;
            self.blocks.read().await.get(&tip).cloned()
        }

        async fn get(&self, number: u64) -> Option<ChainBlock> {
            self.blocks.read().await.get(&number).cloned()
        }

        async fn put(&self, block: ChainBlock) -> CoreResult<()> {
            let mut tip = self.tip_number.write().await;
            if tip.map(|t| block.number > t).unwrap_or(true) {
                *tip = Some(block.number);
            }
            self.blocks.write().await.insert(block.number, block);
            Ok(())
        }

        async fn mark_bft_finalized(&self, number: u64) -> CoreResult<()> {
            if let Some(block) = self.blocks.write().await.get_mut(&number) {
                block.bft_finalized = true;
            }
            Ok(())
        }
    }

    #[derive(Default)]
    pub struct NoopExecutor;

    #[async_trait]
    impl TxExecutor for NoopExecutor {
        async fn apply_txs(&self, _block_number: u64, _txs: &[String]) -> CoreResult<()> {
            Ok(())
        }
    }
}

/// File-backed `ChainStore`: an in-memory cache for fast reads, mirrored to
/// an append-only line-delimited JSON log on every `put`/`mark_bft_finalized`
/// so a restart can replay chain state, in the spirit of the evidence log in
/// bft::slashing rather than a full account-state database (storage layout
/// is an explicit non-goal).
pub mod file {
    use super::memory::InMemoryChainStore;
    use super::*;
    use std::io::{BufRead, Write};
    use std::path::PathBuf;

    pub struct FileChainStore {
        cache: InMemoryChainStore,
        path: PathBuf,
    }

    impl FileChainStore {
        pub async fn open(path: PathBuf) -> CoreResult<Self> {
            let cache = InMemoryChainStore::default();
            if path.exists() {
                let file = std::fs::File::open(&path).map_err(|e| CoreError::TransientIo(e.to_string()))?;
                for line in std::io::BufReader::new(file).lines() {
                    let line = line.map_err(|e| CoreError::TransientIo(e.to_string()))?;
                    if line.trim().is_empty() {
                        continue;
                    }
                    let block: ChainBlock = serde_json::from_str(&line).map_err(|e| CoreError::TransientIo(e.to_string()))?;
                    cache.put(block).await?;
                }
            }
            Ok(FileChainStore { cache, path })
        }

        fn append_line(&self, value: &impl Serialize) -> CoreResult<()> {
            if let Some(parent) = self.path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| CoreError::TransientIo(e.to_string()))?;
            }
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .map_err(|e| CoreError::TransientIo(e.to_string()))?;
            let line = serde_json::to_string(value).map_err(|e| CoreError::TransientIo(e.to_string()))?;
            writeln!(file, "{line}").map_err(|e| CoreError::TransientIo(e.to_string()))
        }
    }

    #[async_trait]
    impl ChainStore for FileChainStore {
        async fn tip(&self) -> Option<ChainBlock> {
            self.cache.tip().await
        }

        async fn get(&self, number: u64) -> Option<ChainBlock> {
            self.cache.get(number).await
        }

        async fn put(&self, block: ChainBlock) -> CoreResult<()> {
            self.append_line(&block)?;
            self.cache.put(block).await
        }

        async fn mark_bft_finalized(&self, number: u64) -> CoreResult<()> {
            self.cache.mark_bft_finalized(number).await?;
            if let Some(block) = self.cache.get(number).await {
                self.append_line(&block)?;
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory::{InMemoryChainStore, NoopExecutor};
    use super::*;
    use crate::signer::NodeSigner;
    use crate::validators::Validator;

    fn engine() -> ChainEngine<InMemoryChainStore, NoopExecutor> {
        ChainEngine::new(InMemoryChainStore::default(), NoopExecutor, true, 6)
    }

    fn signed_genesis(signer: &NodeSigner) -> ChainBlock {
        let mut block = ChainBlock {
            number: 1,
            hash: String::new(),
            parent_hash: ZERO_HASH.to_string(),
            proposer: signer::address_to_hex(&signer.node_id()),
            timestamp_ms: now_ms(),
            txs: vec![],
            finalized: false,
            bft_finalized: false,
            base_fee: 0,
            cumulative_weight: 1,
            signature: String::new(),
        };
        block.hash = block.recompute_hash();
        block.signature = hex::encode(signer.sign(&ChainBlock::signing_message(&block.hash)));
        block
    }

    #[tokio::test]
    async fn applies_a_valid_genesis_block() {
        let engine = engine();
        let signer = NodeSigner::generate();
        let block = signed_genesis(&signer);
        let applied = engine.apply_block(block.clone(), false).await.unwrap();
        assert_eq!(applied.number, 1);
        assert_eq!(engine.store.tip().await.unwrap().hash, block.hash);
    }

    #[tokio::test]
    async fn rejects_tampered_hash() {
        let engine = engine();
        let signer = NodeSigner::generate();
        let mut block = signed_genesis(&signer);
        block.hash = "0xdeadbeef".into();
        assert!(engine.apply_block(block, false).await.is_err());
    }

    #[tokio::test]
    async fn rejects_bad_signature() {
        let engine = engine();
        let signer = NodeSigner::generate();
        let other = NodeSigner::generate();
        let mut block = signed_genesis(&signer);
        block.proposer = signer::address_to_hex(&other.node_id());
        assert!(engine.apply_block(block, false).await.is_err());
    }

    #[tokio::test]
    async fn bft_finalized_flag_is_ignored_on_untrusted_input() {
        let engine = engine();
        let signer = NodeSigner::generate();
        let mut block = signed_genesis(&signer);
        block.bft_finalized = true;
        let applied = engine.apply_block(block, false).await.unwrap();
        assert!(!applied.bft_finalized);
    }

    #[tokio::test]
    async fn propose_next_block_only_for_expected_proposer() {
        let engine = engine();
        let signer = NodeSigner::generate();
        let other = NodeSigner::generate();
        let validators = ValidatorSet::new(vec![
            Validator { id: signer.node_id(), stake: 100, active: true },
            Validator { id: other.node_id(), stake: 100, active: true },
        ]);
        let expected = validators.expected_proposer(1).unwrap();
        let proposer_signer = if expected == signer.node_id() { &signer } else { &other };
        let non_proposer_signer = if expected == signer.node_id() { &other } else { &signer };

        assert!(engine.propose_next_block(non_proposer_signer.node_id(), &validators, vec![], 0).await.is_none());
        let block = engine.propose_next_block(proposer_signer.node_id(), &validators, vec![], 0).await.unwrap();
        assert_eq!(block.number, 1);
    }

    #[tokio::test]
    async fn maybe_adopt_snapshot_rejects_gap_from_tip() {
        let engine = engine();
        let signer = NodeSigner::generate();
        let genesis = signed_genesis(&signer);
        engine.apply_block(genesis, false).await.unwrap();

        let mut gapped = ChainBlock {
            number: 3,
            hash: String::new(),
            parent_hash: "0xsomething".into(),
            proposer: signer::address_to_hex(&signer.node_id()),
            timestamp_ms: now_ms() + 1,
            txs: vec![],
            finalized: false,
            bft_finalized: false,
            base_fee: 0,
            cumulative_weight: 2,
            signature: String::new(),
        };
        gapped.hash = gapped.recompute_hash();
        assert!(engine.maybe_adopt_snapshot(vec![gapped]).await.is_err());
    }
}
