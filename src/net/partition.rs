// Partition detection and reconciliation: tracks whether this node believes
// itself cut off from the majority of its known peers, and runs a lenient
// validation mode plus a forced reconciliation path while isolated.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use crate::config::PartitionConfig;
use crate::consensus::chain::Chain;
use crate::consensus::rules::validate_chain;
use crate::net::discovery::PeerTable;
use crate::net::sync::{PeerQuery, SyncConfig, SyncError, SyncManager};
use crate::net::transport::Server;
use crate::primitives::block::Block;

#[derive(Debug, Clone)]
pub struct ReconciliationReport {
    pub local_chain_was_invalid: bool,
    pub synced_with: Option<SocketAddr>,
    pub note: String,
}

pub struct PartitionManager {
    partitioned: AtomicBool,
    recovery_mode: AtomicBool,
    isolated_peers: RwLock<Vec<SocketAddr>>,
    partition_start: RwLock<Option<Instant>>,
    cfg: PartitionConfig,
}

impl PartitionManager {
    pub fn new(cfg: PartitionConfig) -> Self {
        PartitionManager {
            partitioned: AtomicBool::new(false),
            recovery_mode: AtomicBool::new(false),
            isolated_peers: RwLock::new(Vec::new()),
            partition_start: RwLock::new(None),
            cfg,
        }
    }

    pub fn is_partitioned(&self) -> bool {
        self.partitioned.load(Ordering::SeqCst)
    }

    pub fn is_recovery_mode(&self) -> bool {
        self.recovery_mode.load(Ordering::SeqCst)
    }

    /// `validate_block`, minus the transaction-content check, with the
    /// timestamp requirement tightened to strictly-greater (normal validation
    /// allows equality). Used only while partitioned.
    pub fn validate_during_partition(block: &Block, prev: &Block, cfg: &crate::config::ConsensusConfig) -> bool {
        if block.timestamp <= prev.timestamp {
            return false;
        }
        if block.data.len() > cfg.max_block_size {
            return false;
        }
        if block.difficulty < crate::config::MIN_DIFFICULTY || block.difficulty > crate::config::MAX_DIFFICULTY {
            return false;
        }
        if !block.proof_of_work_is_valid() {
            return false;
        }
        block.prev_hash.as_slice() == prev.hash.as_bytes()
    }

    /// One iteration of the periodic partition sweep: decide whether the
    /// connected/partitioned state should transition. `max_peer_height` is
    /// the tallest height this node has heard any peer claim, from the
    /// orchestrator's height table.
    pub async fn sweep(
        &self,
        table: &PeerTable,
        server: &Server,
        local_height: u64,
        max_peer_height: Option<u64>,
        fork_tolerance: u64,
    ) {
        let known = table.peers().await;
        let live = server.peers().await;
        let majority_unreachable = !known.is_empty() && live.len() * 2 < known.len();

        if !self.is_partitioned() && majority_unreachable {
            self.partitioned.store(true, Ordering::SeqCst);
            *self.partition_start.write().await = Some(Instant::now());
            eprintln!("[partition] majority of known peers unreachable, entering partitioned state");
            return;
        }

        if !self.is_partitioned() {
            return;
        }

        if !majority_unreachable {
            eprintln!("[partition] network restored");
            self.recovery_mode.store(true, Ordering::SeqCst);
            return;
        }

        let isolation_time = self
            .partition_start
            .read()
            .await
            .map(|start| start.elapsed())
            .unwrap_or_default();
        let remote_ahead = max_peer_height.is_some_and(|h| h > local_height + fork_tolerance);

        if isolation_time > self.cfg.max_isolation_time || remote_ahead {
            eprintln!("[partition] forcing reconciliation after prolonged isolation or peer height lead");
            self.recovery_mode.store(true, Ordering::SeqCst);
        }
    }

    pub async fn mark_isolated(&self, peer: SocketAddr) {
        let mut isolated = self.isolated_peers.write().await;
        if !isolated.contains(&peer) {
            isolated.push(peer);
        }
    }

    /// Validate the local chain, sync with the best isolated peer, fold in
    /// its chain if heavier, and clear isolation state regardless of outcome.
    pub async fn reconcile(
        &self,
        chain: Arc<RwLock<Chain>>,
        query: &dyn PeerQuery,
        sync_manager: &SyncManager,
        sync_cfg: &SyncConfig,
        consensus: &crate::config::ConsensusConfig,
        cancel: &AtomicBool,
    ) -> ReconciliationReport {
        let isolated = self.isolated_peers.read().await.clone();

        let locally_valid = validate_chain(&*chain.read().await, consensus);
        if !locally_valid {
            self.finish_reconciliation().await;
            return ReconciliationReport {
                local_chain_was_invalid: true,
                synced_with: None,
                note: "local chain failed validation, aborting reconciliation".to_string(),
            };
        }

        let mut synced_with = None;
        for peer in isolated {
            match sync_manager
                .sync_with(chain.clone(), peer, query, sync_cfg, consensus, cancel)
                .await
            {
                Ok(_) => {
                    synced_with = Some(peer);
                    break;
                }
                Err(SyncError::AlreadySyncing) => break,
                Err(_) => continue,
            }
        }

        self.finish_reconciliation().await;
        ReconciliationReport {
            local_chain_was_invalid: false,
            synced_with,
            note: if synced_with.is_some() {
                "reconciled with isolated peer".to_string()
            } else {
                "no isolated peer reachable for reconciliation".to_string()
            },
        }
    }

    async fn finish_reconciliation(&self) {
        self.partitioned.store(false, Ordering::SeqCst);
        self.recovery_mode.store(false, Ordering::SeqCst);
        *self.partition_start.write().await = None;
        self.isolated_peers.write().await.clear();
    }

    pub fn sweep_interval(&self) -> Duration {
        self.cfg.sweep_interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::block::Block;

    #[test]
    fn test_validate_during_partition_rejects_equal_timestamp() {
        let prev = Block::new(100, b"p".to_vec(), vec![], 0, 1);
        let block = Block::new(100, b"c".to_vec(), prev.hash.as_bytes().to_vec(), 0, 1);
        let cfg = crate::config::ConsensusConfig::default();
        assert!(!PartitionManager::validate_during_partition(&block, &prev, &cfg));
    }

    #[test]
    fn test_validate_during_partition_accepts_strictly_later_timestamp() {
        let prev = Block::new(100, b"p".to_vec(), vec![], 0, 1);
        let block = Block::new(101, b"c".to_vec(), prev.hash.as_bytes().to_vec(), 0, 1);
        let cfg = crate::config::ConsensusConfig::default();
        assert!(PartitionManager::validate_during_partition(&block, &prev, &cfg));
    }

    #[tokio::test]
    async fn test_mark_isolated_is_idempotent() {
        let manager = PartitionManager::new(PartitionConfig::default());
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        manager.mark_isolated(addr).await;
        manager.mark_isolated(addr).await;
        assert_eq!(manager.isolated_peers.read().await.len(), 1);
    }
}
