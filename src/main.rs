// src/main.rs
// Node entrypoint: wires the signer, routing table, DHT, wire transport,
// gossip hub, BFT coordinator, chain engine, and consensus driver together.
// Grounded in the teacher's tracing-subscriber init and env-driven startup
// (main.rs pattern carried across the example pack), rebuilt around this
// crate's own component set.

use clap::Parser;
use l2_consensus_core::bft::coordinator::{BftCoordinator, CoordinatorCallbacks};
use l2_consensus_core::bft::messages::{BftMessage, VotePhase};
use l2_consensus_core::bft::slashing::{SlashingConfig, SlashingHandler};
use l2_consensus_core::chain::file::FileChainStore;
use l2_consensus_core::chain::memory::NoopExecutor;
use l2_consensus_core::chain::{ChainEngine, ChainStore};
use l2_consensus_core::config::Config;
use l2_consensus_core::driver::{BroadcastSink, ConsensusDriver, DriverConfig, SnapshotSource};
use l2_consensus_core::gossip::{ChainSnapshotRequest, GossipHandlers, GossipHub, PeerInfo};
use l2_consensus_core::mempool::Mempool;
use l2_consensus_core::network::client::maintain_connection;
use l2_consensus_core::network::codec::{encode, FrameType};
use l2_consensus_core::network::dht::{DhtNetwork, NodeQuerier};
use l2_consensus_core::network::messages::{ChainBlockWire, DhtPeerWire, FindNodeResponseWire};
use l2_consensus_core::network::server::{WireEvent, WireServer};
use l2_consensus_core::network::shared::BoundedFifoSet;
use l2_consensus_core::routing::DhtPeer;
use l2_consensus_core::signer::{address_to_hex, NodeSigner};
use l2_consensus_core::validators::{Validator, ValidatorSet};
use parking_lot::RwLock;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

fn now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

fn dht_peer_to_wire(peer: &DhtPeer) -> DhtPeerWire {
    DhtPeerWire { id: address_to_hex(&peer.id), address: peer.address.clone(), last_seen_ms: peer.last_seen_ms }
}

fn wire_to_dht_peer(wire: DhtPeerWire) -> Option<DhtPeer> {
    Some(DhtPeer { id: l2_consensus_core::signer::address_from_hex(&wire.id)?, address: wire.address, last_seen_ms: wire.last_seen_ms })
}

/// Bridges the DHT's iterative lookup to C5: issues FIND_NODE over an
/// existing wire connection and correlates the reply by request id.
struct WireNodeQuerier {
    wire: Arc<WireServer>,
}

#[async_trait::async_trait]
impl NodeQuerier for WireNodeQuerier {
    async fn find_node(&self, peer: &DhtPeer, target: l2_consensus_core::signer::Address) -> Option<Vec<DhtPeer>> {
        let peers = self.wire.send_find_node(peer.id, target).await?;
        Some(peers.into_iter().filter_map(wire_to_dht_peer).collect())
    }
}

#[derive(Parser, Debug)]
#[command(name = "l2node", about = "L2 consensus/P2P node")]
struct Cli {
    /// Additional validator id=stake pairs to seed the local validator set with.
    #[arg(long, value_delimiter = ',')]
    validator: Vec<String>,
}

fn chain_to_wire(block: &l2_consensus_core::chain::ChainBlock) -> ChainBlockWire {
    ChainBlockWire {
        number: block.number,
        hash: block.hash.clone(),
        parent_hash: block.parent_hash.clone(),
        proposer: block.proposer.clone(),
        timestamp_ms: block.timestamp_ms,
        txs: block.txs.clone(),
        finalized: block.finalized,
        bft_finalized: block.bft_finalized,
        base_fee: block.base_fee,
        cumulative_weight: block.cumulative_weight,
        signature: block.signature.clone(),
    }
}

fn wire_to_chain(wire: ChainBlockWire) -> l2_consensus_core::chain::ChainBlock {
    l2_consensus_core::chain::ChainBlock {
        number: wire.number,
        hash: wire.hash,
        parent_hash: wire.parent_hash,
        proposer: wire.proposer,
        timestamp_ms: wire.timestamp_ms,
        txs: wire.txs,
        finalized: wire.finalized,
        bft_finalized: wire.bft_finalized,
        base_fee: wire.base_fee,
        cumulative_weight: wire.cumulative_weight,
        signature: wire.signature,
    }
}

struct WireBroadcastSink {
    wire: Arc<WireServer>,
    coordinator: Arc<BftCoordinator>,
    validators: Arc<RwLock<ValidatorSet>>,
    local_id: l2_consensus_core::signer::Address,
    bft_enabled: bool,
}

impl BroadcastSink for WireBroadcastSink {
    fn broadcast_block(&self, block: &l2_consensus_core::chain::ChainBlock) {
        let wire = self.wire.clone();
        let wire_block = chain_to_wire(block);
        tokio::spawn(async move {
            if let Err(e) = wire.broadcast_block(&wire_block).await {
                warn!(error = %e, "failed to broadcast locally proposed block");
            }
        });

        if self.bft_enabled {
            let validators = self.validators.read().clone();
            let is_validator = validators.get(&self.local_id).map(|v| v.active).unwrap_or(false);
            self.coordinator.start_round(block.number, block.number, block.hash.clone(), is_validator, &validators);
        }
    }
}

/// Fetches chain/state snapshots from known wire peers over their gossip
/// HTTP surface. Peers are assumed to run their gossip hub on their own
/// wire port + 1000, the same convention this node uses (see `main`).
struct PeerSnapshotSource {
    wire: Arc<WireServer>,
    gossip_port: u16,
    client: reqwest::Client,
}

impl PeerSnapshotSource {
    fn peer_gossip_urls(&self) -> Vec<String> {
        self.wire
            .connections
            .peer_addresses()
            .into_iter()
            .map(|(_, ip)| format!("http://{ip}:{}", self.gossip_port))
            .collect()
    }
}

#[async_trait::async_trait]
impl SnapshotSource for PeerSnapshotSource {
    async fn best_known_height(&self) -> Option<u64> {
        for url in self.peer_gossip_urls() {
            let Ok(resp) = self.client.get(format!("{url}/p2p/state-snapshot")).send().await else { continue };
            let Ok(value) = resp.json::<serde_json::Value>().await else { continue };
            if let Some(height) = value.get("height").and_then(|v| v.as_u64()) {
                return Some(height);
            }
        }
        None
    }

    async fn fetch_chain_snapshot(&self, from_height: u64) -> Option<Vec<l2_consensus_core::chain::ChainBlock>> {
        for url in self.peer_gossip_urls() {
            let req = ChainSnapshotRequest { from_height };
            let Ok(resp) = self.client.post(format!("{url}/p2p/chain-snapshot")).json(&req).send().await else { continue };
            let Ok(blocks) = resp.json::<Vec<ChainBlockWire>>().await else { continue };
            if !blocks.is_empty() {
                return Some(blocks.into_iter().map(wire_to_chain).collect());
            }
        }
        None
    }

    async fn fetch_state_snapshot(&self, from_height: u64) -> Option<Vec<l2_consensus_core::chain::ChainBlock>> {
        self.fetch_chain_snapshot(from_height).await
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_target(false).compact().try_init().ok();
    let cli = Cli::parse();

    let cfg = Config::from_env();
    let validation = cfg.validate();
    validation.print_summary();
    if !validation.valid {
        anyhow::bail!("invalid configuration, refusing to start");
    }

    let signer = NodeSigner::load_or_create("NODE_SIGNING_KEY", &PathBuf::from(&cfg.node_key_path))?;
    let local_id = signer.node_id();
    info!(node_id = %address_to_hex(&local_id), "node identity loaded");

    let mut validators = vec![Validator { id: local_id, stake: 100, active: true }];
    for entry in &cli.validator {
        if let Some((id_hex, stake_str)) = entry.split_once('=') {
            if let (Some(id), Ok(stake)) = (l2_consensus_core::signer::address_from_hex(id_hex), stake_str.parse()) {
                validators.push(Validator { id, stake, active: true });
            }
        }
    }
    let validators = Arc::new(RwLock::new(ValidatorSet::new(validators)));

    let dht = Arc::new(DhtNetwork::new(signer.clone(), cfg.chain_id, cfg.require_authenticated_verify));
    let peer_store_path = PathBuf::from("./data/peers.json");
    match dht.load_from_file(&peer_store_path).await {
        Ok(n) => info!(restored = n, "loaded persisted routing table"),
        Err(e) => warn!(error = %e, "failed to load persisted routing table"),
    }

    let (wire, mut wire_events) = WireServer::new(signer.clone(), cfg.chain_id, cfg.max_connections);
    let wire = Arc::new(wire);

    {
        let wire = wire.clone();
        let port = cfg.wire_port;
        tokio::spawn(async move {
            if let Err(e) = wire.listen(port).await {
                warn!(error = %e, "wire transport listener exited");
            }
        });
    }

    for bootstrap in &cfg.dht_bootstrap {
        let wire = wire.clone();
        let addr = bootstrap.to_string();
        tokio::spawn(async move {
            maintain_connection(wire, addr, None).await;
        });
    }

    let chain_store = FileChainStore::open(PathBuf::from("./data/chain.jsonl")).await?;
    let chain_engine = Arc::new(ChainEngine::new(chain_store, NoopExecutor, true, cfg.finality_depth));
    let mempool = Arc::new(Mempool::default());

    let slashing = Arc::new(std::sync::Mutex::new(SlashingHandler::new(
        SlashingConfig::default().with_slash_percent(10),
    )));

    let coordinator_wire = wire.clone();
    let coordinator_chain = chain_engine.clone();
    let callbacks = CoordinatorCallbacks {
        broadcast: Box::new(move |msg: BftMessage| {
            let wire = coordinator_wire.clone();
            tokio::spawn(async move {
                let vote = l2_consensus_core::network::messages::BftVoteWire {
                    kind: match msg.phase {
                        VotePhase::Prepare => "prepare".to_string(),
                        VotePhase::Commit => "commit".to_string(),
                    },
                    height: msg.height,
                    block_hash: msg.block_hash,
                    sender_id: address_to_hex(&msg.sender_id),
                    signature: hex::encode(msg.signature),
                };
                let frame_type = match msg.phase {
                    VotePhase::Prepare => l2_consensus_core::network::codec::FrameType::BftPrepare,
                    VotePhase::Commit => l2_consensus_core::network::codec::FrameType::BftCommit,
                };
                if let Err(e) = wire.broadcast_vote(frame_type, &vote).await {
                    warn!(error = %e, "failed to broadcast bft vote");
                }
            });
        }),
        on_finalized: Box::new(move |number, hash| {
            let chain = coordinator_chain.clone();
            tokio::spawn(async move {
                if let Err(e) = chain.mark_bft_finalized(number).await {
                    warn!(error = %e, height = number, %hash, "failed to mark block bft-finalized");
                }
            });
        }),
        on_equivocation: {
            let slashing = slashing.clone();
            let validators = validators.clone();
            Box::new(move |evidence| {
                warn!(validator = %address_to_hex(&evidence.validator), height = evidence.height, "equivocation detected");
                let mut validators = validators.write();
                if let Ok(mut slashing) = slashing.lock() {
                    slashing.handle(&evidence, &mut validators);
                }
                drop(validators);
            })
        },
    };

    let coordinator = BftCoordinator::new(
        signer.clone(),
        Duration::from_millis(cfg.prepare_timeout_ms),
        Duration::from_millis(cfg.commit_timeout_ms),
        100,
        callbacks,
    );

    {
        let coordinator = coordinator.clone();
        let validators = validators.clone();
        let event_dht = dht.clone();
        let event_wire = wire.clone();
        let event_chain = chain_engine.clone();
        let event_mempool = mempool.clone();
        let bft_enabled = cfg.bft_enabled;
        tokio::spawn(async move {
            while let Some(event) = wire_events.recv().await {
                match event {
                    WireEvent::Block { block, .. } => {
                        let chain = event_chain.clone();
                        let coordinator = coordinator.clone();
                        let validators = validators.clone();
                        tokio::spawn(async move {
                            match chain.apply_block(wire_to_chain(block), false).await {
                                Ok(applied) => {
                                    if bft_enabled {
                                        let validators = validators.read().clone();
                                        let is_validator = validators.get(&local_id).map(|v| v.active).unwrap_or(false);
                                        coordinator.start_round(applied.number, applied.number, applied.hash.clone(), is_validator, &validators);
                                    }
                                }
                                Err(e) => warn!(error = %e, "rejected block received over wire transport"),
                            }
                        });
                    }
                    WireEvent::Transaction { tx, .. } => {
                        event_mempool.submit(tx.raw_tx);
                    }
                    WireEvent::BftVote { vote, .. } => {
                        let phase = if vote.kind == "prepare" { VotePhase::Prepare } else { VotePhase::Commit };
                        let Some(sender_id) = l2_consensus_core::signer::address_from_hex(&vote.sender_id) else { continue };
                        let Ok(sig_bytes) = hex::decode(&vote.signature) else { continue };
                        let Ok(signature) = sig_bytes.try_into() else { continue };
                        let msg = BftMessage { phase, height: vote.height, block_hash: vote.block_hash, sender_id, signature };
                        let validators = validators.read().clone();
                        coordinator.handle_message(msg, &validators);
                    }
                    WireEvent::PeerConnected { peer_id, address } => {
                        info!(peer = %address_to_hex(&peer_id), %address, "peer connected");
                        let peer = DhtPeer { id: peer_id, address, last_seen_ms: now_ms() };
                        event_dht.table.lock().await.add_peer(peer, None).await;
                    }
                    WireEvent::PeerDisconnected { peer_id } => {
                        info!(peer = %address_to_hex(&peer_id), "peer disconnected");
                    }
                    WireEvent::FindNode { from, request_id, target } => {
                        let closest = event_dht.table.lock().await.find_closest(&target, l2_consensus_core::routing::K);
                        let resp = FindNodeResponseWire {
                            request_id,
                            peers: closest.iter().map(dht_peer_to_wire).collect(),
                        };
                        if let Ok(payload) = serde_json::to_vec(&resp) {
                            if let Ok(frame) = encode(FrameType::FindNodeResponse, &payload) {
                                event_wire.connections.send_to(&from, frame).await;
                            }
                        }
                    }
                }
            }
        });
    }

    {
        let dht = dht.clone();
        let wire = wire.clone();
        tokio::spawn(async move {
            let querier = WireNodeQuerier { wire: wire.clone() };
            let mut ticker = tokio::time::interval(l2_consensus_core::network::dht::REFRESH_INTERVAL);
            loop {
                ticker.tick().await;
                let target = DhtNetwork::random_refresh_target();
                l2_consensus_core::network::dht::log_refresh_tick(&target);
                dht.lookup_node(target, &querier, &*wire, |_| {}).await;
            }
        });
    }

    {
        let dht = dht.clone();
        let wire = wire.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(l2_consensus_core::network::dht::ANNOUNCE_INTERVAL);
            loop {
                ticker.tick().await;
                for (peer_id, address) in wire.connections.peer_addresses() {
                    if wire.send_find_node(peer_id, dht.local_id()).await.is_none() {
                        l2_consensus_core::network::dht::warn_announce_failed(&address);
                    }
                }
            }
        });
    }

    let gossip_wire = wire.clone();
    let gossip_mempool = mempool.clone();
    let gossip_chain = chain_engine.clone();
    let snapshot_chain = chain_engine.clone();
    let state_chain = chain_engine.clone();
    let gossip_coordinator = coordinator.clone();
    let gossip_validators = validators.clone();
    let block_coordinator = coordinator.clone();
    let block_validators = validators.clone();
    let block_bft_enabled = cfg.bft_enabled;
    let gossip_handlers = GossipHandlers {
        on_tx: Box::new(move |tx| gossip_mempool.submit(tx.raw_tx)),
        on_block: Box::new(move |block| {
            let chain = gossip_chain.clone();
            let coordinator = block_coordinator.clone();
            let validators = block_validators.clone();
            tokio::spawn(async move {
                match chain.apply_block(wire_to_chain(block), false).await {
                    Ok(applied) => {
                        if block_bft_enabled {
                            let validators = validators.read().clone();
                            let is_validator = validators.get(&local_id).map(|v| v.active).unwrap_or(false);
                            coordinator.start_round(applied.number, applied.number, applied.hash.clone(), is_validator, &validators);
                        }
                    }
                    Err(e) => warn!(error = %e, "rejected gossiped block"),
                }
            });
        }),
        on_bft_message: Box::new(move |vote| {
            let phase = if vote.kind == "prepare" { VotePhase::Prepare } else { VotePhase::Commit };
            let Some(sender_id) = l2_consensus_core::signer::address_from_hex(&vote.sender_id) else { return };
            let Ok(sig_bytes) = hex::decode(&vote.signature) else { return };
            let Ok(signature) = sig_bytes.try_into() else { return };
            let msg = BftMessage { phase, height: vote.height, block_hash: vote.block_hash, sender_id, signature };
            let validators = gossip_validators.read().clone();
            gossip_coordinator.handle_message(msg, &validators);
        }),
        on_chain_snapshot_request: Box::new(move |from_height| {
            let chain = snapshot_chain.clone();
            Box::pin(async move {
                let Some(tip) = chain.store.tip().await else { return Vec::new() };
                let mut blocks = Vec::new();
                let mut n = from_height;
                while n <= tip.number {
                    if let Some(block) = chain.store.get(n).await {
                        blocks.push(chain_to_wire(&block));
                    }
                    n += 1;
                }
                blocks
            })
        }),
        on_state_snapshot_request: Box::new(move || {
            let chain = state_chain.clone();
            Box::pin(async move {
                let height = chain.store.tip().await.map(|t| t.number).unwrap_or(0);
                serde_json::json!({ "height": height })
            })
        }),
        peers: Box::new(move || {
            gossip_wire
                .connections
                .peer_addresses()
                .into_iter()
                .map(|(id, address)| PeerInfo { id: address_to_hex(&id), address })
                .collect()
        }),
    };
    let gossip_hub = GossipHub::new(
        gossip_handlers,
        Arc::new(BoundedFifoSet::new(50_000)),
        Arc::new(BoundedFifoSet::new(10_000)),
        Arc::new(BoundedFifoSet::new(10_000)),
        Arc::new(BoundedFifoSet::new(10_000)),
    );

    let gossip_addr: SocketAddr = ([0, 0, 0, 0], cfg.wire_port + 1000).into();
    {
        let router = gossip_hub.router();
        tokio::spawn(async move {
            if let Err(e) = axum::Server::bind(&gossip_addr).serve(router.into_make_service()).await {
                warn!(error = %e, "gossip hub server exited");
            }
        });
    }

    let driver = ConsensusDriver::new(
        chain_engine.clone(),
        signer.clone(),
        validators.clone(),
        Arc::new(PeerSnapshotSource { wire: wire.clone(), gossip_port: cfg.wire_port + 1000, client: reqwest::Client::new() }),
        Arc::new(WireBroadcastSink {
            wire: wire.clone(),
            coordinator: coordinator.clone(),
            validators: validators.clone(),
            local_id,
            bft_enabled: cfg.bft_enabled,
        }),
        mempool.clone(),
        DriverConfig {
            block_time: Duration::from_millis(cfg.block_time_ms),
            sync_interval: Duration::from_millis(cfg.sync_interval_ms),
            snap_sync_enabled: true,
            base_fee: 0,
        },
    );
    if cfg.bft_enabled {
        driver.start();
    }

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    coordinator.stop();
    driver.stop();
    if let Err(e) = dht.save_to_file(&peer_store_path).await {
        warn!(error = %e, "failed to persist routing table");
    }
    Ok(())
}
