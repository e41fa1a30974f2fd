// Row-oriented storage backend, realized as a small set of RocksDB column
// families rather than a SQL engine: one CF per logical table, a secondary
// index CF for hash lookups, and a single write batch standing in for the
// "delete-all, bulk-insert, commit" transaction the row model calls for.

use std::path::Path;
use std::sync::Arc;

use rocksdb::{ColumnFamilyDescriptor, IteratorMode, Options, WriteBatch, DB};
use thiserror::Error;

use crate::consensus::chain::Chain;
use crate::consensus::reward::MiningReward;
use crate::consensus::rules::validate_chain;
use crate::node::persistence::{ChainStorage, StorageError};
use crate::primitives::block::Block;

const CF_BLOCKS: &str = "blocks";
const CF_BLOCKS_BY_HASH: &str = "blocks_by_hash";
const CF_REWARDS: &str = "rewards";

#[derive(Debug, Error)]
pub enum DbStoreError {
    #[error(transparent)]
    RocksDb(#[from] rocksdb::Error),
    #[error("missing column family {0}")]
    MissingColumnFamily(&'static str),
    #[error("corrupt row at index {0}")]
    CorruptRow(u64),
}

impl From<DbStoreError> for StorageError {
    fn from(e: DbStoreError) -> Self {
        StorageError::Backend(e.to_string())
    }
}

pub struct DbStorage {
    db: Arc<DB>,
    consensus: crate::config::ConsensusConfig,
}

fn index_key(index: u64) -> [u8; 8] {
    index.to_be_bytes()
}

impl DbStorage {
    pub fn open(path: &Path) -> Result<Self, DbStoreError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cfs = vec![
            ColumnFamilyDescriptor::new(CF_BLOCKS, Options::default()),
            ColumnFamilyDescriptor::new(CF_BLOCKS_BY_HASH, Options::default()),
            ColumnFamilyDescriptor::new(CF_REWARDS, Options::default()),
        ];
        let db = DB::open_cf_descriptors(&opts, path, cfs)?;
        Ok(DbStorage {
            db: Arc::new(db),
            consensus: crate::config::ConsensusConfig::default(),
        })
    }

    fn cf(&self, name: &'static str) -> Result<&rocksdb::ColumnFamily, DbStoreError> {
        self.db.cf_handle(name).ok_or(DbStoreError::MissingColumnFamily(name))
    }

    fn clear_cf(&self, batch: &mut WriteBatch, name: &'static str) -> Result<(), DbStoreError> {
        let cf = self.cf(name)?;
        let keys: Vec<Box<[u8]>> = self
            .db
            .iterator_cf(cf, IteratorMode::Start)
            .filter_map(|row| row.ok())
            .map(|(k, _)| k)
            .collect();
        for key in keys {
            batch.delete_cf(cf, key);
        }
        Ok(())
    }
}

unsafe impl Send for DbStorage {}
unsafe impl Sync for DbStorage {}

impl ChainStorage for DbStorage {
    fn save(&self, chain: &Chain) -> Result<(), StorageError> {
        let cf_blocks = self.cf(CF_BLOCKS)?;
        let cf_hash = self.cf(CF_BLOCKS_BY_HASH)?;
        let cf_rewards = self.cf(CF_REWARDS)?;

        let mut batch = WriteBatch::default();
        self.clear_cf(&mut batch, CF_BLOCKS)?;
        self.clear_cf(&mut batch, CF_BLOCKS_BY_HASH)?;
        self.clear_cf(&mut batch, CF_REWARDS)?;

        for (index, block) in chain.blocks().iter().enumerate() {
            let key = index_key(index as u64);
            let bytes = serde_json::to_vec(&block.to_json()).map_err(|e| StorageError::Backend(e.to_string()))?;
            batch.put_cf(cf_blocks, key, bytes);
            batch.put_cf(cf_hash, block.hash.as_bytes(), key);
        }
        for reward in chain.rewards() {
            let key = index_key(reward.block_index as u64);
            let bytes = serde_json::to_vec(reward).map_err(|e| StorageError::Backend(e.to_string()))?;
            batch.put_cf(cf_rewards, key, bytes);
        }

        let mut write_opts = rocksdb::WriteOptions::default();
        write_opts.set_sync(true);
        self.db
            .write_opt(batch, &write_opts)
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(())
    }

    fn load(&self) -> Result<Chain, StorageError> {
        let cf_blocks = self.cf(CF_BLOCKS)?;
        let cf_rewards = self.cf(CF_REWARDS)?;

        let mut blocks = Vec::new();
        for row in self.db.iterator_cf(cf_blocks, IteratorMode::Start) {
            let (key, value) = row.map_err(|e| StorageError::Backend(e.to_string()))?;
            let index = u64::from_be_bytes(key.as_ref().try_into().map_err(|_| StorageError::Corrupt)?);
            let value: serde_json::Value = serde_json::from_slice(&value).map_err(|_| StorageError::Corrupt)?;
            let block = Block::from_json(&value).map_err(|_| StorageError::Corrupt)?;
            blocks.push((index, block));
        }
        blocks.sort_by_key(|(index, _)| *index);
        let blocks: Vec<Block> = blocks.into_iter().map(|(_, b)| b).collect();

        if blocks.is_empty() {
            return Err(StorageError::NotFound);
        }

        let mut rewards = Vec::new();
        for row in self.db.iterator_cf(cf_rewards, IteratorMode::Start) {
            let (_, value) = row.map_err(|e| StorageError::Backend(e.to_string()))?;
            let reward: MiningReward = serde_json::from_slice(&value).map_err(|_| StorageError::Corrupt)?;
            rewards.push(reward);
        }

        let chain = Chain::from_parts(blocks, rewards);
        if !validate_chain(&chain, &self.consensus) {
            return Err(StorageError::InvalidChain);
        }
        Ok(chain)
    }

    fn exists(&self) -> bool {
        let Ok(cf) = self.cf(CF_BLOCKS) else { return false };
        self.db.iterator_cf(cf, IteratorMode::Start).next().is_some()
    }

    fn delete(&self) -> Result<(), StorageError> {
        let mut batch = WriteBatch::default();
        self.clear_cf(&mut batch, CF_BLOCKS)?;
        self.clear_cf(&mut batch, CF_BLOCKS_BY_HASH)?;
        self.clear_cf(&mut batch, CF_REWARDS)?;
        self.db.write(batch).map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(())
    }

    /// Row-oriented storage has no file-level backup rotation of its own —
    /// durability comes from RocksDB's WAL instead.
    fn backups(&self) -> Result<Vec<String>, StorageError> {
        Ok(Vec::new())
    }
}
