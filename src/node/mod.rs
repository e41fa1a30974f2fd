pub mod db_store;
pub mod file_store;
pub mod persistence;

pub use persistence::{ChainStorage, StorageError};
