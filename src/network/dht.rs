// src/network/dht.rs
// C4 DHT Network: iterative alpha-parallel FIND_NODE lookup, peer
// verification, and refresh/announce scheduling on top of the routing table
// (C3). Grounded in the teacher's network/dht.rs Kademlia skeleton, replacing
// its SHA-256 32-byte NodeId with the 20-byte address space from C1/C3 and
// its fixed bucket scan with the spec's bounded iterative lookup.

use crate::routing::{DhtPeer, LivenessProbe, RoutingTable};
use crate::signer::{Address, NodeSigner};
use async_trait::async_trait;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tracing::{debug, warn};

pub const ALPHA: usize = 3;
pub const LOOKUP_MAX_ITERATIONS: usize = 20;
pub const LOOKUP_MAX_QUERIES: usize = 60;
pub const LOOKUP_GLOBAL_TIMEOUT_MS: u64 = 30_000;
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(5 * 60);
pub const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(3 * 60);
const PERSIST_MAX_AGE_MS: u64 = 24 * 60 * 60 * 1000;

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Issues FIND_NODE to a peer over C5 and returns the peers it reports.
/// `None` signals the query failed (timeout, refused, unreachable).
#[async_trait]
pub trait NodeQuerier: Send + Sync {
    async fn find_node(&self, peer: &DhtPeer, target: Address) -> Option<Vec<DhtPeer>>;
}

/// Bridges to C5's connection table (`verifyPeer`'s "already authenticated"
/// fast path) and its outbound handshake probe (the slow path).
#[async_trait]
pub trait SessionAuthority: Send + Sync {
    fn is_authenticated(&self, id: &Address) -> bool;
    async fn probe_handshake(&self, peer: &DhtPeer, signer: &NodeSigner, chain_id: u64) -> Option<Address>;
}

#[derive(Debug, Default)]
pub struct VerifyStats {
    pub attempts: AtomicU64,
    pub successes: AtomicU64,
    pub failures: AtomicU64,
    pub fallback_attempts: AtomicU64,
    pub fallback_failures: AtomicU64,
}

pub struct DhtNetwork {
    pub table: Mutex<RoutingTable>,
    pub signer: NodeSigner,
    pub chain_id: u64,
    pub require_authenticated_verify: bool,
    pub stats: VerifyStats,
}

impl DhtNetwork {
    pub fn new(signer: NodeSigner, chain_id: u64, require_authenticated_verify: bool) -> Self {
        let local_id = signer.node_id();
        DhtNetwork {
            table: Mutex::new(RoutingTable::new(local_id)),
            signer,
            chain_id,
            require_authenticated_verify,
            stats: VerifyStats::default(),
        }
    }

    pub fn local_id(&self) -> Address {
        self.signer.node_id()
    }

    /// §4.4 verifyPeer: trust an already-authenticated session outright;
    /// otherwise attempt a short-lived handshake probe. `requireAuthenticatedVerify`
    /// only forbids an unauthenticated TCP-only fallback — the probe path
    /// itself always authenticates via a signed handshake.
    pub async fn verify_peer(&self, peer: &DhtPeer, sessions: &dyn SessionAuthority) -> bool {
        if sessions.is_authenticated(&peer.id) {
            return true;
        }
        self.stats.attempts.fetch_add(1, Ordering::Relaxed);
        self.stats.fallback_attempts.fetch_add(1, Ordering::Relaxed);

        match sessions.probe_handshake(peer, &self.signer, self.chain_id).await {
            Some(recovered) if recovered == peer.id => {
                self.stats.successes.fetch_add(1, Ordering::Relaxed);
                true
            }
            _ => {
                self.stats.failures.fetch_add(1, Ordering::Relaxed);
                self.stats.fallback_failures.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// §4.4 iterative lookup, bounded by iteration/query/wall-clock budgets.
    pub async fn lookup_node(
        &self,
        target: Address,
        querier: &dyn NodeQuerier,
        sessions: &dyn SessionAuthority,
        on_discovered: impl Fn(&DhtPeer) + Send + Sync,
    ) -> Vec<DhtPeer> {
        let deadline = Instant::now() + Duration::from_millis(LOOKUP_GLOBAL_TIMEOUT_MS);

        let mut found: Vec<DhtPeer> = {
            let table = self.table.lock().await;
            table.find_closest(&target, crate::routing::K)
        };
        if found.is_empty() {
            return Vec::new();
        }

        let mut queried: HashSet<Address> = HashSet::new();
        let mut total_queries = 0usize;

        for _ in 0..LOOKUP_MAX_ITERATIONS {
            if Instant::now() >= deadline || total_queries >= LOOKUP_MAX_QUERIES {
                break;
            }

            let mut candidates: Vec<DhtPeer> = found
                .iter()
                .filter(|p| !queried.contains(&p.id))
                .cloned()
                .collect();
            candidates.sort_by_key(|p| crate::routing::xor_distance(&p.id, &target));
            candidates.truncate(ALPHA);
            if candidates.is_empty() {
                break;
            }

            let mut improved = false;
            for peer in &candidates {
                if total_queries >= LOOKUP_MAX_QUERIES || Instant::now() >= deadline {
                    break;
                }
                queried.insert(peer.id);
                total_queries += 1;

                let response = match querier.find_node(peer, target).await {
                    Some(peers) => peers,
                    None => continue,
                };

                for candidate in response {
                    if candidate.id == self.local_id() || found.iter().any(|p| p.id == candidate.id) {
                        continue;
                    }
                    if self.verify_peer(&candidate, sessions).await {
                        let mut table = self.table.lock().await;
                        if table.add_peer(candidate.clone(), None).await {
                            on_discovered(&candidate);
                        }
                        drop(table);
                        found.push(candidate);
                        improved = true;
                    }
                }
            }

            if !improved {
                break;
            }
        }

        found.sort_by_key(|p| crate::routing::xor_distance(&p.id, &target));
        found.truncate(crate::routing::K);
        found
    }

    /// Drawn from a CSPRNG — a predictable refresh target lets an attacker
    /// pre-position peers at the bucket that will be refreshed next.
    pub fn random_refresh_target() -> Address {
        let mut out = [0u8; 20];
        rand::rngs::OsRng.fill_bytes(&mut out);
        out
    }

    pub async fn save_to_file(&self, path: &Path) -> anyhow::Result<()> {
        let peers = self.table.lock().await.all_peers();
        let wire: Vec<PersistedPeer> = peers
            .into_iter()
            .map(|p| PersistedPeer {
                id: crate::signer::address_to_hex(&p.id),
                address: p.address,
                last_seen_ms: p.last_seen_ms,
            })
            .collect();
        let json = serde_json::to_vec_pretty(&wire)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, json).await?;
        Ok(())
    }

    /// Entries older than 24h are discarded; survivors re-enter through
    /// `add_peer` so Sybil and id-format checks apply exactly as on the wire.
    pub async fn load_from_file(&self, path: &Path) -> anyhow::Result<usize> {
        let bytes = match tokio::fs::read(path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        let entries: Vec<PersistedPeer> = serde_json::from_slice(&bytes)?;
        let cutoff = now_ms().saturating_sub(PERSIST_MAX_AGE_MS);
        let mut restored = 0usize;
        let mut table = self.table.lock().await;
        for entry in entries {
            if entry.last_seen_ms < cutoff {
                continue;
            }
            if let Some(peer) = RoutingTable::validate_imported_peer(&entry.id, &entry.address, entry.last_seen_ms) {
                if table.add_peer(peer, None).await {
                    restored += 1;
                }
            }
        }
        Ok(restored)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedPeer {
    id: String,
    address: String,
    last_seen_ms: u64,
}

/// Default liveness probe used by the routing table when evicting a full
/// bucket's head: delegates to an existing or freshly-opened handshake.
pub struct HandshakeLivenessProbe<'a> {
    pub sessions: &'a dyn SessionAuthority,
    pub signer: &'a NodeSigner,
    pub chain_id: u64,
}

#[async_trait]
impl<'a> LivenessProbe for HandshakeLivenessProbe<'a> {
    async fn is_alive(&self, peer: &DhtPeer) -> bool {
        if self.sessions.is_authenticated(&peer.id) {
            return true;
        }
        matches!(
            self.sessions.probe_handshake(peer, self.signer, self.chain_id).await,
            Some(addr) if addr == peer.id
        )
    }
}

pub fn log_refresh_tick(target: &Address) {
    debug!(target = %crate::signer::address_to_hex(target), "dht refresh tick");
}

pub fn warn_announce_failed(peer: &str) {
    warn!(peer, "dht announce failed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    fn addr(byte: u8) -> Address {
        let mut a = [0u8; 20];
        a[19] = byte;
        a
    }

    fn peer(id: u8) -> DhtPeer {
        DhtPeer {
            id: addr(id),
            address: format!("203.0.113.{id}:3000"),
            last_seen_ms: now_ms(),
        }
    }

    struct AlwaysAuthenticated;
    #[async_trait]
    impl SessionAuthority for AlwaysAuthenticated {
        fn is_authenticated(&self, _id: &Address) -> bool {
            true
        }
        async fn probe_handshake(&self, peer: &DhtPeer, _signer: &NodeSigner, _chain_id: u64) -> Option<Address> {
            Some(peer.id)
        }
    }

    /// A fixed graph: local -> {1,2} -> {1,2} know about {3,4} -> {3,4} know nothing new.
    struct GraphQuerier {
        edges: StdMutex<HashMap<u8, Vec<DhtPeer>>>,
    }

    #[async_trait]
    impl NodeQuerier for GraphQuerier {
        async fn find_node(&self, peer: &DhtPeer, _target: Address) -> Option<Vec<DhtPeer>> {
            let key = peer.id[19];
            self.edges.lock().unwrap().get(&key).cloned()
        }
    }

    #[tokio::test]
    async fn lookup_terminates_and_discovers_new_peers() {
        let signer = NodeSigner::generate();
        let dht = DhtNetwork::new(signer, 1, true);
        {
            let mut table = dht.table.lock().await;
            table.add_peer(peer(1), None).await;
            table.add_peer(peer(2), None).await;
        }

        let mut edges = HashMap::new();
        edges.insert(1u8, vec![peer(3), peer(4)]);
        edges.insert(2u8, vec![peer(3), peer(4)]);
        let querier = GraphQuerier { edges: StdMutex::new(edges) };
        let sessions = AlwaysAuthenticated;

        let discovered = StdMutex::new(Vec::new());
        let result = dht
            .lookup_node(addr(99), &querier, &sessions, |p| discovered.lock().unwrap().push(p.id))
            .await;

        assert!(result.iter().any(|p| p.id == addr(3)));
        assert!(result.iter().any(|p| p.id == addr(4)));
        assert!(!discovered.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn lookup_on_empty_table_returns_empty() {
        let signer = NodeSigner::generate();
        let dht = DhtNetwork::new(signer, 1, true);
        let querier = GraphQuerier { edges: StdMutex::new(HashMap::new()) };
        let sessions = AlwaysAuthenticated;
        let result = dht.lookup_node(addr(1), &querier, &sessions, |_| {}).await;
        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn persistence_round_trip_drops_stale_entries() {
        let signer = NodeSigner::generate();
        let dht = DhtNetwork::new(signer, 1, true);
        {
            let mut table = dht.table.lock().await;
            table.add_peer(peer(1), None).await;
        }
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peers.json");
        dht.save_to_file(&path).await.unwrap();

        let stale_ms = now_ms() - PERSIST_MAX_AGE_MS - 1000;
        let fresh = PersistedPeer {
            id: crate::signer::address_to_hex(&addr(2)),
            address: "203.0.113.2:3000".into(),
            last_seen_ms: now_ms(),
        };
        let stale = PersistedPeer {
            id: crate::signer::address_to_hex(&addr(3)),
            address: "203.0.113.3:3000".into(),
            last_seen_ms: stale_ms,
        };
        let json = serde_json::to_vec(&vec![fresh, stale]).unwrap();
        tokio::fs::write(&path, json).await.unwrap();

        let signer2 = NodeSigner::generate();
        let dht2 = DhtNetwork::new(signer2, 1, true);
        let restored = dht2.load_from_file(&path).await.unwrap();
        assert_eq!(restored, 1);
        let table = dht2.table.lock().await;
        assert!(table.all_peers().iter().any(|p| p.id == addr(2)));
        assert!(!table.all_peers().iter().any(|p| p.id == addr(3)));
    }
}

