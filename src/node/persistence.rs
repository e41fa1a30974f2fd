// Storage is a capability set, not a concrete backend: the chain engine and
// orchestrator hold a `Box<dyn ChainStorage>` and never know whether blocks
// land in a flat JSON file or a column-family database.

use thiserror::Error;

use crate::consensus::chain::Chain;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("no saved chain at this location")]
    NotFound,
    #[error("checksum mismatch, and no valid backup to recover from")]
    Corrupt,
    #[error("saved chain failed validation on load")]
    InvalidChain,
    #[error("another writer holds the storage lock")]
    Busy,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Backend(String),
}

pub trait ChainStorage: Send + Sync {
    fn save(&self, chain: &Chain) -> Result<(), StorageError>;
    fn load(&self) -> Result<Chain, StorageError>;
    fn exists(&self) -> bool;
    fn delete(&self) -> Result<(), StorageError>;
    /// Paths or identifiers of retained backups, most recent first.
    fn backups(&self) -> Result<Vec<String>, StorageError>;
}
