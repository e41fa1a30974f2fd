// Peer discovery: a reputation-scored address table plus the health and
// discovery sweep loops that keep it current. Both loops are cancellable
// tasks; neither holds the table lock across an await.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::sync::{oneshot, Mutex, RwLock};
use tokio::time::timeout;

use crate::config::DiscoveryConfig;
use crate::net::protocol::{Message, MessageType};
use crate::net::transport::Server;

const STARTING_SCORE: i64 = 100;

#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub address: SocketAddr,
    pub score: i64,
    pub fail_count: u32,
    pub last_contact: Instant,
    pub banned: bool,
    pub ban_until: Option<Instant>,
}

impl PeerRecord {
    fn new(address: SocketAddr) -> Self {
        PeerRecord {
            address,
            score: STARTING_SCORE,
            fail_count: 0,
            last_contact: Instant::now(),
            banned: false,
            ban_until: None,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct DiscoveryStats {
    pub known_peers: usize,
    pub banned_peers: usize,
}

/// The known-peer table. Address-keyed, reputation-scored, with bans that
/// expire rather than delete the record outright.
pub struct PeerTable {
    peers: RwLock<HashMap<SocketAddr, PeerRecord>>,
    cfg: DiscoveryConfig,
    pending_pongs: Mutex<HashMap<SocketAddr, oneshot::Sender<()>>>,
}

impl PeerTable {
    pub fn new(cfg: DiscoveryConfig) -> Self {
        PeerTable {
            peers: RwLock::new(HashMap::new()),
            cfg,
            pending_pongs: Mutex::new(HashMap::new()),
        }
    }

    /// Register interest in the next pong from `address` and wait up to
    /// `deadline` for it. Called by the health sweep right after sending a ping.
    pub async fn await_pong(&self, address: SocketAddr, deadline: Duration) -> bool {
        let (tx, rx) = oneshot::channel();
        self.pending_pongs.lock().await.insert(address, tx);
        let result = timeout(deadline, rx).await;
        self.pending_pongs.lock().await.remove(&address);
        matches!(result, Ok(Ok(())))
    }

    /// Fulfil any pending `await_pong` for `address`. Called from the
    /// orchestrator's message dispatch when a PONG arrives.
    pub async fn notify_pong(&self, address: SocketAddr) {
        if let Some(tx) = self.pending_pongs.lock().await.remove(&address) {
            let _ = tx.send(());
        }
    }

    /// Idempotent: re-adding a known address is a no-op.
    pub async fn add(&self, address: SocketAddr) {
        let mut peers = self.peers.write().await;
        peers.entry(address).or_insert_with(|| PeerRecord::new(address));
    }

    pub async fn peers(&self) -> Vec<SocketAddr> {
        self.peers.read().await.keys().copied().collect()
    }

    /// Addresses eligible to be contacted right now: known and not currently banned.
    pub async fn contactable(&self) -> Vec<SocketAddr> {
        let now = Instant::now();
        self.peers
            .read()
            .await
            .values()
            .filter(|record| !record.banned || record.ban_until.is_none_or(|until| now >= until))
            .map(|record| record.address)
            .collect()
    }

    pub async fn idle_duration(&self, address: SocketAddr) -> Option<Duration> {
        self.peers.read().await.get(&address).map(|r| r.last_contact.elapsed())
    }

    pub async fn stats(&self) -> DiscoveryStats {
        let peers = self.peers.read().await;
        DiscoveryStats {
            known_peers: peers.len(),
            banned_peers: peers.values().filter(|r| r.banned).count(),
        }
    }

    /// Apply a reputation delta, clamped to `[0, STARTING_SCORE]`. Positive
    /// deltas clear `fail_count`; negative deltas accumulate it, banning once
    /// it reaches `max_fail_count`.
    pub async fn update_reputation(&self, address: SocketAddr, delta: i64) {
        let mut peers = self.peers.write().await;
        let Some(record) = peers.get_mut(&address) else { return };
        record.score = (record.score + delta).clamp(0, STARTING_SCORE);
        record.last_contact = Instant::now();

        if delta > 0 {
            record.fail_count = 0;
        } else if delta < 0 {
            record.fail_count += 1;
            if record.fail_count >= self.cfg.max_fail_count {
                record.banned = true;
                record.ban_until = Some(Instant::now() + self.cfg.ban_window);
            }
        }
    }

    /// Clear expired bans. Run from the health sweep.
    pub async fn clear_expired_bans(&self) {
        let now = Instant::now();
        let mut peers = self.peers.write().await;
        for record in peers.values_mut() {
            if record.banned {
                if let Some(until) = record.ban_until {
                    if now >= until {
                        record.banned = false;
                        record.ban_until = None;
                        record.fail_count = 0;
                    }
                }
            }
        }
    }

    /// Integrate peer addresses learned from a GET_PEERS response, up to `max_peers`.
    pub async fn process_new_peers(&self, addresses: Vec<SocketAddr>, max_peers: usize) {
        let mut peers = self.peers.write().await;
        for address in addresses {
            if peers.len() >= max_peers {
                break;
            }
            peers.entry(address).or_insert_with(|| PeerRecord::new(address));
        }
    }
}

/// Periodic liveness check: ping every known, live peer, await a pong within
/// the configured deadline, and adjust reputation accordingly. A peer idle
/// longer than `peer_timeout` takes a harsher penalty than a single missed pong.
pub async fn health_sweep(table: &PeerTable, server: &Server, cfg: &DiscoveryConfig) {
    table.clear_expired_bans().await;
    let known = table.peers().await;
    let live = server.peers().await;

    for address in known {
        if !live.contains(&address) {
            continue;
        }
        let idle = table.idle_duration(address).await;
        if idle.is_some_and(|d| d >= cfg.peer_timeout) {
            table.update_reputation(address, -10).await;
            continue;
        }

        let ping = Message::new(MessageType::Ping, Vec::new());
        if server.send_to(address, ping, cfg.pong_deadline).await.is_err() {
            table.update_reputation(address, -1).await;
            continue;
        }
        if table.await_pong(address, cfg.pong_deadline).await {
            table.update_reputation(address, 1).await;
        } else {
            table.update_reputation(address, -1).await;
        }
    }
}

/// Periodic discovery: ask each known peer for its peer list. Responses are
/// folded in by the orchestrator's message dispatch via `process_new_peers`;
/// this loop only issues the requests.
pub async fn discovery_sweep(table: &PeerTable, server: &Server, request_timeout: Duration) {
    let known = table.peers().await;
    for address in known {
        let request = Message::new(MessageType::GetPeers, Vec::new());
        let _ = server.send_to(address, request, request_timeout).await;
    }
}

/// Contact each bootstrap address once at startup.
pub async fn bootstrap(table: &PeerTable, addresses: &[SocketAddr]) {
    for address in addresses {
        table.add(*address).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[tokio::test]
    async fn test_add_is_idempotent_and_starts_at_100() {
        let table = PeerTable::new(DiscoveryConfig::default());
        table.add(addr(1)).await;
        table.add(addr(1)).await;
        assert_eq!(table.peers().await.len(), 1);
    }

    #[tokio::test]
    async fn test_fail_count_bans_after_threshold() {
        let cfg = DiscoveryConfig {
            max_fail_count: 3,
            ..DiscoveryConfig::default()
        };
        let table = PeerTable::new(cfg);
        table.add(addr(2)).await;
        for _ in 0..3 {
            table.update_reputation(addr(2), -1).await;
        }
        let contactable = table.contactable().await;
        assert!(!contactable.contains(&addr(2)));
    }

    #[tokio::test]
    async fn test_positive_delta_resets_fail_count() {
        let table = PeerTable::new(DiscoveryConfig::default());
        table.add(addr(3)).await;
        table.update_reputation(addr(3), -1).await;
        table.update_reputation(addr(3), 1).await;
        let stats = table.stats().await;
        assert_eq!(stats.banned_peers, 0);
    }

    #[tokio::test]
    async fn test_process_new_peers_respects_cap() {
        let table = PeerTable::new(DiscoveryConfig::default());
        let addrs: Vec<_> = (10..20).map(addr).collect();
        table.process_new_peers(addrs, 5).await;
        assert_eq!(table.peers().await.len(), 5);
    }
}
