// Mining loop: repeatedly extend the chain with a freshly-mined block until
// cancelled or a requested block count is reached. One `append_mined` call
// per block; no scratchpad or template state carries over between blocks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;

use crate::config::PowConfig;
use crate::consensus::chain::{Chain, ChainError};

#[derive(Debug, Clone, Default)]
pub struct MiningStats {
    pub blocks_mined: u64,
    pub total_elapsed: Duration,
}

/// Mine `count` blocks onto `chain`, stopping early if `cancel` is set or a
/// block fails to mine (timeout/exhausted ceiling). `count == 0` mines until
/// cancelled.
pub async fn generate_blocks(
    chain: Arc<RwLock<Chain>>,
    data_for_block: impl Fn(u64) -> Vec<u8>,
    miner_id: &str,
    difficulty: u8,
    pow: &PowConfig,
    count: u64,
    cancel: &AtomicBool,
) -> MiningStats {
    let mut stats = MiningStats::default();
    loop {
        if cancel.load(Ordering::Relaxed) {
            break;
        }
        if count != 0 && stats.blocks_mined >= count {
            break;
        }

        let data = data_for_block(stats.blocks_mined);
        let elapsed = {
            let mut guard = chain.write().await;
            guard.append_mined(data, miner_id, difficulty, pow, cancel)
        };
        match elapsed {
            Ok(elapsed) => {
                stats.blocks_mined += 1;
                stats.total_elapsed += elapsed;
            }
            Err(ChainError::Mining(_)) => break,
            Err(_) => break,
        }
    }
    stats
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_generate_blocks_mines_requested_count() {
        let chain = Arc::new(RwLock::new(Chain::new_chain()));
        let pow = PowConfig::default();
        let cancel = AtomicBool::new(false);

        let stats = generate_blocks(chain.clone(), |i| format!("block {i}").into_bytes(), "alice", 1, &pow, 3, &cancel).await;

        assert_eq!(stats.blocks_mined, 3);
        assert_eq!(chain.read().await.length(), 4);
    }

    #[tokio::test]
    async fn test_generate_blocks_stops_on_cancel() {
        let chain = Arc::new(RwLock::new(Chain::new_chain()));
        let pow = PowConfig::default();
        let cancel = AtomicBool::new(true);

        let stats = generate_blocks(chain.clone(), |_| b"x".to_vec(), "alice", 1, &pow, 5, &cancel).await;

        assert_eq!(stats.blocks_mined, 0);
        assert_eq!(chain.read().await.length(), 1);
    }
}
