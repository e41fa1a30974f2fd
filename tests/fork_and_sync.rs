// Integration test: consensus fork resolution and the sync manager working
// over a fake peer, exercising net::sync against consensus::chain and
// consensus::rules the way the orchestrator does in production, minus the
// real transport.

use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;

use ledgerchaind::config::{ConsensusConfig, PowConfig};
use ledgerchaind::consensus::chain::Chain;
use ledgerchaind::consensus::rules::select_best_chain;
use ledgerchaind::net::sync::{PeerQuery, SyncConfig, SyncManager};
use ledgerchaind::primitives::block::Block;

fn peer_addr() -> SocketAddr {
    "127.0.0.1:9999".parse().unwrap()
}

struct FakePeer {
    height: u64,
    blocks: Vec<Block>,
}

#[async_trait]
impl PeerQuery for FakePeer {
    async fn get_blockchain_height(&self, _peer: SocketAddr, _timeout: Duration) -> Option<u64> {
        Some(self.height)
    }

    async fn get_blocks(&self, _peer: SocketAddr, start_index: u32, count: u32, _timeout: Duration) -> Option<Vec<Block>> {
        let start = start_index as usize;
        if start >= self.blocks.len() {
            return Some(Vec::new());
        }
        let end = (start + count as usize).min(self.blocks.len());
        Some(self.blocks[start..end].to_vec())
    }
}

#[test]
fn heavier_fork_replaces_local_tail_and_carries_its_rewards() {
    let pow = PowConfig::default();
    let cancel = AtomicBool::new(false);

    let mut shared = Chain::new_chain();
    shared.append_mined(b"1".to_vec(), "alice", 1, &pow, &cancel).unwrap();
    shared.append_mined(b"2".to_vec(), "alice", 1, &pow, &cancel).unwrap();

    let mut light = shared.clone();
    light.append_mined(b"light".to_vec(), "alice", 1, &pow, &cancel).unwrap();

    let mut heavy = shared.clone();
    heavy.append_mined(b"heavy".to_vec(), "bob", 5, &pow, &cancel).unwrap();

    let cfg = ConsensusConfig::default();
    let best = select_best_chain(&light, std::slice::from_ref(&heavy), &cfg);
    assert_eq!(best.latest().unwrap().hash, heavy.latest().unwrap().hash);

    light.resolve_fork(&heavy).unwrap();
    assert_eq!(light.length(), heavy.length());
    assert_eq!(light.latest().unwrap().hash, heavy.latest().unwrap().hash);
    assert!(light.rewards().iter().any(|r| r.miner_id == "bob"));
    assert!(!light.rewards().iter().any(|r| r.block_index == 3 && r.miner_id == "alice"));
}

#[tokio::test]
async fn sync_manager_backfills_from_common_ancestor_over_a_fake_peer() {
    let pow = PowConfig::default();
    let cancel = AtomicBool::new(false);

    let mut local = Chain::new_chain();
    local.append_mined(b"1".to_vec(), "alice", 1, &pow, &cancel).unwrap();

    let mut remote = local.clone();
    remote.append_mined(b"2".to_vec(), "alice", 1, &pow, &cancel).unwrap();
    remote.append_mined(b"3".to_vec(), "alice", 1, &pow, &cancel).unwrap();
    remote.append_mined(b"4".to_vec(), "alice", 1, &pow, &cancel).unwrap();

    let peer = FakePeer {
        height: remote.length() as u64 - 1,
        blocks: remote.blocks().to_vec(),
    };

    let chain = Arc::new(RwLock::new(local));
    let manager = SyncManager::new();
    let sync_cfg = SyncConfig {
        max_concurrent_requests: 2,
        block_size: 2,
        timeout: Duration::from_secs(1),
        retry_attempts: 1,
        verify_blocks: true,
    };
    let consensus = ConsensusConfig::default();

    let progress = manager
        .sync_with(chain.clone(), peer_addr(), &peer, &sync_cfg, &consensus, &AtomicBool::new(false))
        .await
        .expect("sync should succeed against a consistent peer");

    assert_eq!(progress.received_blocks, 3);
    assert!(progress.errors.is_empty());

    let synced = chain.read().await;
    assert_eq!(synced.length(), remote.length());
    assert!(synced.is_valid());
    assert_eq!(synced.latest().unwrap().hash, remote.latest().unwrap().hash);
}

#[tokio::test]
async fn sync_rejects_a_second_concurrent_attempt() {
    let manager = Arc::new(SyncManager::new());
    let chain = Arc::new(RwLock::new(Chain::new_chain()));
    let peer = FakePeer { height: 0, blocks: vec![] };
    let sync_cfg = SyncConfig {
        max_concurrent_requests: 1,
        block_size: 1,
        timeout: Duration::from_secs(1),
        retry_attempts: 1,
        verify_blocks: true,
    };

    let first = {
        let manager = manager.clone();
        let chain = chain.clone();
        tokio::spawn(async move {
            manager
                .sync_with(chain, peer_addr(), &peer, &sync_cfg, &ConsensusConfig::default(), &AtomicBool::new(false))
                .await
        })
    };

    // Give the first sync a head start so `in_progress` is set before the race.
    tokio::time::sleep(Duration::from_millis(5)).await;
    let second_peer = FakePeer { height: 0, blocks: vec![] };
    let second = manager
        .sync_with(
            chain.clone(),
            peer_addr(),
            &second_peer,
            &sync_cfg,
            &ConsensusConfig::default(),
            &AtomicBool::new(false),
        )
        .await;

    first.await.unwrap().ok();
    assert!(second.is_err());
}
