// Integration test: chain engine + file persistence working together,
// exercising the path a real node takes across restarts — mine a few
// blocks, save, reload into a fresh process-like handle, corrupt the live
// file, and confirm backup recovery still yields a valid chain.

use std::sync::atomic::AtomicBool;

use ledgerchaind::config::PowConfig;
use ledgerchaind::consensus::chain::Chain;
use ledgerchaind::node::file_store::FileStorage;
use ledgerchaind::node::persistence::{ChainStorage, StorageError};

fn mine_chain(blocks: usize) -> Chain {
    let mut chain = Chain::new_chain();
    let cancel = AtomicBool::new(false);
    let pow = PowConfig::default();
    for i in 0..blocks {
        chain
            .append_mined(format!("payload {i}").into_bytes(), "alice", 1, &pow, &cancel)
            .expect("mining should succeed at difficulty 1");
    }
    chain
}

#[test]
fn save_then_reload_preserves_chain_and_rewards() {
    let dir = tempfile::tempdir().expect("tempdir");
    let storage = FileStorage::new(dir.path(), 5);

    let chain = mine_chain(3);
    storage.save(&chain).expect("save");

    let reloaded = storage.load().expect("load");
    assert_eq!(reloaded.length(), chain.length());
    assert_eq!(reloaded.total_rewards(), chain.total_rewards());
    assert_eq!(reloaded.latest().unwrap().hash, chain.latest().unwrap().hash);
    assert!(reloaded.is_valid());
}

#[test]
fn repeated_saves_rotate_backups_under_the_cap() {
    let dir = tempfile::tempdir().expect("tempdir");
    let storage = FileStorage::new(dir.path(), 3);

    let mut chain = Chain::new_chain();
    for _ in 0..8 {
        storage.save(&chain).expect("save");
        chain.append_data(b"entry".to_vec()).expect("append");
    }

    let backups = storage.backups().expect("list backups");
    assert!(backups.len() <= 3, "expected at most 3 backups, got {}", backups.len());
}

#[test]
fn tampered_chain_file_recovers_from_backup() {
    let dir = tempfile::tempdir().expect("tempdir");
    let storage = FileStorage::new(dir.path(), 5);

    let chain = mine_chain(2);
    storage.save(&chain).expect("first save");
    storage.save(&chain).expect("second save creates a backup of the first");

    std::fs::write(dir.path().join("blockchain.json"), b"not a valid chain document").expect("corrupt file");

    let recovered = storage.load().expect("recovery from backup");
    assert!(recovered.is_valid());
    assert_eq!(recovered.length(), chain.length());
}

#[test]
fn missing_chain_and_no_backups_is_not_found() {
    let dir = tempfile::tempdir().expect("tempdir");
    let storage = FileStorage::new(dir.path(), 5);
    assert!(!storage.exists());
    assert!(matches!(storage.load(), Err(StorageError::NotFound)));
}
