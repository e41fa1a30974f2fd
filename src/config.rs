//! Tunables for the whole node, constructed once at startup. Nothing here is a
//! hidden global: every component that needs a bound, interval, or size limit
//! takes a reference to (a piece of) `NodeConfig` explicitly.

use std::path::PathBuf;
use std::time::Duration;

/// Difficulty bounds shared by mining, validation, and retargeting.
pub const MIN_DIFFICULTY: u8 = 1;
pub const MAX_DIFFICULTY: u8 = 32;
pub const DEFAULT_DIFFICULTY: u8 = 4;

pub const GENESIS_DATA: &str = "Genesis Block";

/// Wire-protocol frame limits; see net::protocol.
pub const MAX_SIGNATURE_LEN: usize = 512;
pub const MAX_NODE_ID_LEN: usize = 256;
pub const MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024; // 10 MiB
pub const FRAGMENT_THRESHOLD: usize = 64 * 1024; // 64 KiB

pub struct PowConfig {
    pub max_attempts: u64,
    pub timeout: Duration,
}

impl Default for PowConfig {
    fn default() -> Self {
        PowConfig {
            max_attempts: 10_000_000,
            timeout: Duration::from_secs(5),
        }
    }
}

pub struct ChainConfig {
    pub target_block_time: Duration,
    pub adjustment_interval: u64,
    pub min_difficulty: u8,
    pub max_difficulty: u8,
}

impl Default for ChainConfig {
    fn default() -> Self {
        ChainConfig {
            target_block_time: Duration::from_secs(120),
            adjustment_interval: 10,
            min_difficulty: MIN_DIFFICULTY,
            max_difficulty: MAX_DIFFICULTY,
        }
    }
}

pub struct ConsensusConfig {
    pub max_block_size: usize,
    pub max_tx_count: usize,
    pub coinbase_maturity: u64,
    pub fork_tolerance: u64,
    pub min_confirmations: u64,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        ConsensusConfig {
            max_block_size: 1_048_576,
            max_tx_count: 10_000,
            coinbase_maturity: 100,
            fork_tolerance: 6,
            min_confirmations: 6,
        }
    }
}

#[derive(Clone)]
pub struct TransportConfig {
    pub max_peers: usize,
    pub outbound_queue_capacity: usize,
    pub send_deadline: Duration,
    pub idle_deadline: Duration,
    pub close_deadline: Duration,
    pub connect_rate_limit: Duration,
    pub keepalive_interval: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            max_peers: 100,
            outbound_queue_capacity: 100,
            send_deadline: Duration::from_secs(5),
            idle_deadline: Duration::from_secs(30),
            close_deadline: Duration::from_secs(5),
            connect_rate_limit: Duration::from_secs(1),
            keepalive_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Clone)]
pub struct DiscoveryConfig {
    pub health_interval: Duration,
    pub discovery_interval: Duration,
    pub peer_timeout: Duration,
    pub max_fail_count: u32,
    pub ban_window: Duration,
    pub pong_deadline: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        DiscoveryConfig {
            health_interval: Duration::from_secs(30),
            discovery_interval: Duration::from_secs(60),
            peer_timeout: Duration::from_secs(300),
            max_fail_count: 5,
            ban_window: Duration::from_secs(600),
            pong_deadline: Duration::from_secs(5),
        }
    }
}

pub struct SyncDefaults {
    pub max_concurrent_requests: usize,
    pub block_size: u32,
    pub timeout: Duration,
    pub retry_attempts: u32,
    pub verify_blocks: bool,
    pub auto_sync_interval: Duration,
}

impl Default for SyncDefaults {
    fn default() -> Self {
        SyncDefaults {
            max_concurrent_requests: 4,
            block_size: 64,
            timeout: Duration::from_secs(30),
            retry_attempts: 3,
            verify_blocks: true,
            auto_sync_interval: Duration::from_secs(300),
        }
    }
}

pub struct PartitionConfig {
    pub sweep_interval: Duration,
    pub max_isolation_time: Duration,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        PartitionConfig {
            sweep_interval: Duration::from_secs(30),
            max_isolation_time: Duration::from_secs(3600),
        }
    }
}

pub struct PersistenceConfig {
    pub data_dir: PathBuf,
    pub max_backup_files: usize,
}

impl PersistenceConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        PersistenceConfig {
            data_dir: data_dir.into(),
            max_backup_files: 5,
        }
    }
}

/// Top-level config: one instance built at process start, handed by reference
/// (or cloned piecewise) to every component that needs it.
pub struct NodeConfig {
    pub pow: PowConfig,
    pub chain: ChainConfig,
    pub consensus: ConsensusConfig,
    pub transport: TransportConfig,
    pub discovery: DiscoveryConfig,
    pub sync: SyncDefaults,
    pub partition: PartitionConfig,
    pub persistence: PersistenceConfig,
}

impl NodeConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        NodeConfig {
            pow: PowConfig::default(),
            chain: ChainConfig::default(),
            consensus: ConsensusConfig::default(),
            transport: TransportConfig::default(),
            discovery: DiscoveryConfig::default(),
            sync: SyncDefaults::default(),
            partition: PartitionConfig::default(),
            persistence: PersistenceConfig::new(data_dir),
        }
    }
}

pub fn default_data_dir() -> PathBuf {
    let home = resolve_home_dir();
    PathBuf::from(home).join(".ledgerchain/mainnet")
}

fn resolve_home_dir() -> String {
    if let Ok(home) = std::env::var("HOME") {
        if !home.trim().is_empty() {
            return home;
        }
    }
    #[cfg(windows)]
    {
        if let Ok(home) = std::env::var("USERPROFILE") {
            if !home.trim().is_empty() {
                return home;
            }
        }
        let drive = std::env::var("HOMEDRIVE").unwrap_or_default();
        let path = std::env::var("HOMEPATH").unwrap_or_default();
        if !drive.is_empty() || !path.is_empty() {
            return format!("{drive}{path}");
        }
    }
    ".".to_string()
}
