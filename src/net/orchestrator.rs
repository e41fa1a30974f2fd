// Network-consensus orchestrator: binds the transport to the consensus
// rules and sync manager, dispatches incoming messages, and runs the
// periodic auto-sync sweep. This is the one place that knows about all of
// C1 (via Chain), C5 (Server), C6 (PeerTable), C7 (SyncManager), C8
// (consensus::rules), and C9 (PartitionManager) at once.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, Mutex, RwLock};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::config::NodeConfig;
use crate::consensus::chain::Chain;
use crate::consensus::rules::validate_block;
use crate::net::discovery::{self, PeerTable};
use crate::net::partition::PartitionManager;
use crate::net::protocol::{Message, MessageType};
use crate::net::sync::{decode_get_blocks, encode_get_blocks, PeerQuery, SyncConfig, SyncManager, SyncProgress};
use crate::net::transport::Server;
use crate::node::persistence::ChainStorage;
use crate::primitives::block::Block;

#[derive(Debug, Default, Clone)]
pub struct OrchestratorStats {
    pub chain_height: u64,
    pub peer_count: usize,
    pub syncing: bool,
    pub last_error: Option<String>,
}

pub struct Orchestrator {
    chain: Arc<RwLock<Chain>>,
    storage: Arc<dyn ChainStorage>,
    server: Arc<Server>,
    peer_table: Arc<PeerTable>,
    sync_manager: Arc<SyncManager>,
    partition: Arc<PartitionManager>,
    config: Arc<NodeConfig>,
    peer_heights: RwLock<HashMap<SocketAddr, u64>>,
    pending_block_replies: Mutex<HashMap<SocketAddr, oneshot::Sender<Vec<Block>>>>,
    last_error: RwLock<Option<String>>,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        chain: Arc<RwLock<Chain>>,
        storage: Arc<dyn ChainStorage>,
        server: Arc<Server>,
        peer_table: Arc<PeerTable>,
        config: Arc<NodeConfig>,
    ) -> Arc<Self> {
        Arc::new(Orchestrator {
            chain,
            storage,
            server,
            peer_table,
            sync_manager: Arc::new(SyncManager::new()),
            partition: Arc::new(PartitionManager::new(crate::config::PartitionConfig {
                sweep_interval: config.partition.sweep_interval,
                max_isolation_time: config.partition.max_isolation_time,
            })),
            config,
            peer_heights: RwLock::new(HashMap::new()),
            pending_block_replies: Mutex::new(HashMap::new()),
            last_error: RwLock::new(None),
            cancel: CancellationToken::new(),
        })
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// A new block arrived unsolicited from `from`. If it extends our tip,
    /// append and rebroadcast; otherwise treat it as a possible fork and
    /// start a sync with the sender.
    pub async fn handle_new_block(self: &Arc<Self>, block: Block, from: SocketAddr) {
        let extends_tip = {
            let guard = self.chain.read().await;
            match guard.latest() {
                Ok(tip) => block.prev_hash.as_slice() == tip.hash.as_bytes(),
                Err(_) => false,
            }
        };

        if extends_tip {
            let valid = {
                let guard = self.chain.read().await;
                let tip = guard.latest().expect("checked above");
                validate_block(&block, tip, &self.config.consensus)
            };
            if !valid {
                self.record_error("rejected new block: failed validation").await;
                return;
            }
            {
                let mut guard = self.chain.write().await;
                guard.push_verified(block.clone());
            }
            let _ = self.storage.save(&*self.chain.read().await);
            self.broadcast(block).await;
        } else {
            eprintln!("[orchestrator] new block from {from} doesn't extend tip, treating as fork signal");
            self.force_sync(from).await;
        }
    }

    pub async fn handle_get_blocks(&self, start_index: u32, count: u32) -> Vec<Block> {
        let guard = self.chain.read().await;
        let length = guard.length();
        let start = start_index as usize;
        if start >= length {
            return Vec::new();
        }
        let end = (start + count as usize).min(length);
        (start..end).filter_map(|i| guard.by_index(i).ok().cloned()).collect()
    }

    pub async fn handle_get_chain_height(&self) -> u64 {
        self.chain.read().await.length().saturating_sub(1) as u64
    }

    pub async fn broadcast(&self, block: Block) {
        let payload = serde_json::to_vec(&block.to_json()).unwrap_or_default();
        self.server.broadcast(Message::new(MessageType::NewBlock, payload)).await;
    }

    /// Dispatch a decoded, non-fragment message from `from`. Called by the
    /// transport's per-peer receive task.
    pub async fn dispatch(self: &Arc<Self>, from: SocketAddr, message: Message) {
        match message.message_type {
            MessageType::Ping => {
                let _ = self.server.send_to(from, Message::new(MessageType::Pong, Vec::new()), self.config.transport.send_deadline).await;
            }
            MessageType::Pong => {
                self.peer_table.notify_pong(from).await;
            }
            MessageType::GetBlocks => {
                if let Some((start, count)) = decode_get_blocks(&message.payload) {
                    let blocks = self.handle_get_blocks(start, count).await;
                    let payload = serde_json::to_vec(&blocks.iter().map(|b| b.to_json()).collect::<Vec<_>>()).unwrap_or_default();
                    let _ = self.server.send_to(from, Message::new(MessageType::Blocks, payload), self.config.transport.send_deadline).await;
                }
            }
            MessageType::Blocks => {
                if let Ok(values) = serde_json::from_slice::<Vec<serde_json::Value>>(&message.payload) {
                    let blocks: Vec<Block> = values.iter().filter_map(|v| Block::from_json(v).ok()).collect();
                    if let Some(tx) = self.pending_block_replies.lock().await.remove(&from) {
                        let _ = tx.send(blocks);
                    }
                }
            }
            MessageType::NewBlock => {
                if let Ok(value) = serde_json::from_slice::<serde_json::Value>(&message.payload) {
                    if let Ok(block) = Block::from_json(&value) {
                        self.handle_new_block(block, from).await;
                    }
                }
            }
            MessageType::GetBlockchain => {
                let height = self.handle_get_chain_height().await;
                let payload = serde_json::to_vec(&serde_json::json!({ "height": height })).unwrap_or_default();
                let _ = self
                    .server
                    .send_to(from, Message::new(MessageType::Blockchain, payload), self.config.transport.send_deadline)
                    .await;
            }
            MessageType::Blockchain => {
                if let Ok(value) = serde_json::from_slice::<serde_json::Value>(&message.payload) {
                    if let Some(height) = value.get("height").and_then(|h| h.as_u64()) {
                        self.peer_heights.write().await.insert(from, height);
                    }
                }
            }
            MessageType::GetPeers => {
                let peers: Vec<_> = self
                    .peer_table
                    .peers()
                    .await
                    .into_iter()
                    .map(|addr| serde_json::json!({"id": addr.to_string(), "address": addr.ip().to_string(), "port": addr.port(), "last_seen": 0, "connected": true}))
                    .collect();
                let payload = serde_json::to_vec(&peers).unwrap_or_default();
                let _ = self.server.send_to(from, Message::new(MessageType::Peers, payload), self.config.transport.send_deadline).await;
            }
            MessageType::Peers => {
                if let Ok(entries) = serde_json::from_slice::<Vec<serde_json::Value>>(&message.payload) {
                    let addresses: Vec<SocketAddr> = entries
                        .iter()
                        .filter_map(|e| e.get("address")?.as_str()?.parse().ok())
                        .collect();
                    self.peer_table.process_new_peers(addresses, self.config.transport.max_peers).await;
                }
            }
            MessageType::Transaction | MessageType::Unknown => {}
        }
    }

    async fn record_error(&self, message: &str) {
        eprintln!("[orchestrator] {message}");
        *self.last_error.write().await = Some(message.to_string());
    }

    pub async fn force_sync(self: &Arc<Self>, peer: SocketAddr) -> Result<SyncProgress, String> {
        let query = OrchestratorPeerQuery { orchestrator: self.clone() };
        let sync_cfg = SyncConfig::from(&self.config.sync);
        let cancel = AtomicBool::new(false);
        self.sync_manager
            .sync_with(self.chain.clone(), peer, &query, &sync_cfg, &self.config.consensus, &cancel)
            .await
            .map_err(|e| e.to_string())
    }

    pub fn cancel_sync(&self, cancel_flag: &AtomicBool) {
        self.sync_manager.cancel(cancel_flag);
    }

    /// Every `auto_sync_interval`, pick the peer with the greatest known
    /// height and sync with it. Failures are logged, not fatal.
    pub async fn run_periodic_sync(self: Arc<Self>) {
        let interval = self.config.sync.auto_sync_interval;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            let best_peer = {
                let heights = self.peer_heights.read().await;
                heights.iter().max_by_key(|(_, h)| **h).map(|(addr, _)| *addr)
            };
            if let Some(peer) = best_peer {
                if let Err(e) = self.force_sync(peer).await {
                    self.record_error(&format!("periodic sync with {peer} failed: {e}")).await;
                }
            }
        }
    }

    /// Query every known peer for its chain height, to keep `peer_heights`
    /// current between `NEW_BLOCK`/`BLOCKCHAIN` exchanges.
    pub async fn run_height_polling(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(Duration::from_secs(60)) => {}
            }
            for peer in self.peer_table.peers().await {
                let request = Message::new(MessageType::GetBlockchain, Vec::new());
                let _ = self.server.send_to(peer, request, self.config.transport.send_deadline).await;
            }
        }
    }

    /// Every `discovery.health_interval`, ping each known peer and adjust its
    /// reputation based on whether a pong arrived in time.
    pub async fn run_discovery_health_sweep(self: Arc<Self>) {
        let interval = self.config.discovery.health_interval;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            discovery::health_sweep(&self.peer_table, &self.server, &self.config.discovery).await;
        }
    }

    /// Every `discovery.discovery_interval`, ask each known peer for its peer
    /// list; responses are folded in by `dispatch`'s `Peers` handler.
    pub async fn run_discovery_propagation_sweep(self: Arc<Self>) {
        let interval = self.config.discovery.discovery_interval;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            discovery::discovery_sweep(&self.peer_table, &self.server, self.config.transport.send_deadline).await;
        }
    }

    pub async fn run_partition_sweep(self: Arc<Self>) {
        let interval = self.partition.sweep_interval();
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            let local_height = self.handle_get_chain_height().await;
            let max_peer_height = self.peer_heights.read().await.values().max().copied();
            self.partition
                .sweep(&self.peer_table, &self.server, local_height, max_peer_height, self.config.consensus.fork_tolerance)
                .await;

            if self.partition.is_recovery_mode() {
                let query = OrchestratorPeerQuery { orchestrator: self.clone() };
                let sync_cfg = SyncConfig::from(&self.config.sync);
                let cancel = AtomicBool::new(false);
                let report = self
                    .partition
                    .reconcile(self.chain.clone(), &query, &self.sync_manager, &sync_cfg, &self.config.consensus, &cancel)
                    .await;
                eprintln!("[partition] reconciliation: {}", report.note);
            }
        }
    }

    pub async fn stats(&self) -> OrchestratorStats {
        OrchestratorStats {
            chain_height: self.handle_get_chain_height().await,
            peer_count: self.server.peer_count().await,
            syncing: self.sync_manager.is_syncing(),
            last_error: self.last_error.read().await.clone(),
        }
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

struct OrchestratorPeerQuery {
    orchestrator: Arc<Orchestrator>,
}

#[async_trait::async_trait]
impl PeerQuery for OrchestratorPeerQuery {
    async fn get_blockchain_height(&self, peer: SocketAddr, deadline: Duration) -> Option<u64> {
        let request = Message::new(MessageType::GetBlockchain, Vec::new());
        self.orchestrator.server.send_to(peer, request, deadline).await.ok()?;
        timeout(deadline, async {
            loop {
                if let Some(height) = self.orchestrator.peer_heights.read().await.get(&peer).copied() {
                    return height;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .ok()
    }

    async fn get_blocks(&self, peer: SocketAddr, start_index: u32, count: u32, deadline: Duration) -> Option<Vec<Block>> {
        let (tx, rx) = oneshot::channel();
        self.orchestrator.pending_block_replies.lock().await.insert(peer, tx);

        let request = encode_get_blocks(start_index, count);
        if self.orchestrator.server.send_to(peer, request, deadline).await.is_err() {
            self.orchestrator.pending_block_replies.lock().await.remove(&peer);
            return None;
        }

        match timeout(deadline, rx).await {
            Ok(Ok(blocks)) => Some(blocks),
            _ => {
                self.orchestrator.pending_block_replies.lock().await.remove(&peer);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::file_store::FileStorage;

    fn test_orchestrator(dir: &std::path::Path) -> Arc<Orchestrator> {
        let chain = Arc::new(RwLock::new(Chain::new_chain()));
        let storage: Arc<dyn ChainStorage> = Arc::new(FileStorage::new(dir, 5));
        let server = Server::new(crate::config::TransportConfig::default());
        let peer_table = Arc::new(PeerTable::new(crate::config::DiscoveryConfig::default()));
        let config = Arc::new(NodeConfig::new(dir));
        Orchestrator::new(chain, storage, server, peer_table, config)
    }

    #[tokio::test]
    async fn test_handle_get_blocks_clips_to_chain_length() {
        let dir = std::env::temp_dir().join(format!("ledgerchain_orch_{}", std::process::id()));
        let orchestrator = test_orchestrator(&dir);
        let blocks = orchestrator.handle_get_blocks(0, 100).await;
        assert_eq!(blocks.len(), 1); // only genesis exists
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_dispatch_blocks_fulfills_pending_reply() {
        let dir = std::env::temp_dir().join(format!("ledgerchain_orch2_{}", std::process::id()));
        let orchestrator = test_orchestrator(&dir);
        let from: SocketAddr = "127.0.0.1:40000".parse().unwrap();

        let (tx, rx) = oneshot::channel();
        orchestrator.pending_block_replies.lock().await.insert(from, tx);

        let genesis = orchestrator.chain.read().await.latest().unwrap().clone();
        let payload = serde_json::to_vec(&vec![genesis.to_json()]).unwrap();
        let message = Message::new(MessageType::Blocks, payload);

        orchestrator.dispatch(from, message).await;

        let blocks = rx.await.expect("pending reply fulfilled");
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].hash, genesis.hash);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_dispatch_blockchain_records_peer_height() {
        let dir = std::env::temp_dir().join(format!("ledgerchain_orch3_{}", std::process::id()));
        let orchestrator = test_orchestrator(&dir);
        let from: SocketAddr = "127.0.0.1:40001".parse().unwrap();

        let payload = serde_json::to_vec(&serde_json::json!({"height": 7u64})).unwrap();
        let message = Message::new(MessageType::Blockchain, payload);
        orchestrator.dispatch(from, message).await;

        assert_eq!(orchestrator.peer_heights.read().await.get(&from).copied(), Some(7));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
