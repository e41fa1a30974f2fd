// File-backed storage: a single JSON document plus a SHA-256 checksum
// sidecar and a rotating set of timestamped backups. Single-writer,
// single-reader per handle; concurrent processes are kept out by an
// exclusive lock file rather than any in-process mutex.

use std::fs;
use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::consensus::chain::Chain;
use crate::consensus::rules::validate_chain;
use crate::node::persistence::{ChainStorage, StorageError};

const FILE_MODE: u32 = 0o600;

pub struct FileStorage {
    data_dir: PathBuf,
    max_backup_files: usize,
    consensus: crate::config::ConsensusConfig,
}

impl FileStorage {
    pub fn new(data_dir: impl Into<PathBuf>, max_backup_files: usize) -> Self {
        FileStorage {
            data_dir: data_dir.into(),
            max_backup_files,
            consensus: crate::config::ConsensusConfig::default(),
        }
    }

    fn chain_path(&self) -> PathBuf {
        self.data_dir.join("blockchain.json")
    }

    fn tmp_path(&self) -> PathBuf {
        self.data_dir.join("blockchain.json.tmp")
    }

    fn lock_path(&self) -> PathBuf {
        self.data_dir.join("blockchain.json.lock")
    }

    fn checksum_path(&self) -> PathBuf {
        self.data_dir.join("checksum.sha256")
    }

    fn backups_dir(&self) -> PathBuf {
        self.data_dir.join("backups")
    }

    fn acquire_lock(&self) -> Result<LockGuard, StorageError> {
        let lock_path = self.lock_path();
        match fs::OpenOptions::new().write(true).create_new(true).open(&lock_path) {
            Ok(_) => Ok(LockGuard { path: lock_path }),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Err(StorageError::Busy),
            Err(e) => Err(e.into()),
        }
    }

    fn write_checksum(&self, bytes: &[u8]) -> Result<(), StorageError> {
        let digest = crate::crypto::hash::sha256_hex(bytes);
        let path = self.checksum_path();
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(FILE_MODE)
            .open(&path)?;
        file.write_all(digest.as_bytes())?;
        file.sync_all()?;
        Ok(())
    }

    fn read_checksum(&self) -> Result<String, StorageError> {
        Ok(fs::read_to_string(self.checksum_path())?.trim().to_string())
    }

    fn rotate_backup(&self) -> Result<(), StorageError> {
        let chain_path = self.chain_path();
        if !chain_path.exists() {
            return Ok(());
        }
        let backups_dir = self.backups_dir();
        fs::create_dir_all(&backups_dir)?;

        let micros = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_micros();
        let secs = micros / 1_000_000;
        let frac = micros % 1_000_000;
        let datetime = format_timestamp(secs as i64);
        let name = format!("blockchain-{datetime}.{frac:06}.json");
        let backup_path = backups_dir.join(name);

        fs::copy(&chain_path, &backup_path)?;
        fs::set_permissions(&backup_path, fs::Permissions::from_mode(FILE_MODE))?;

        self.prune_backups(&backups_dir)?;
        Ok(())
    }

    fn prune_backups(&self, backups_dir: &Path) -> Result<(), StorageError> {
        let mut entries: Vec<_> = fs::read_dir(backups_dir)?
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_file())
            .collect();
        entries.sort_by_key(|e| e.metadata().and_then(|m| m.modified()).ok());
        while entries.len() > self.max_backup_files {
            let oldest = entries.remove(0);
            let _ = fs::remove_file(oldest.path());
        }
        Ok(())
    }

    fn newest_backup(&self) -> Option<PathBuf> {
        let backups_dir = self.backups_dir();
        let entries = fs::read_dir(&backups_dir).ok()?;
        entries
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_file())
            .max_by_key(|e| e.metadata().and_then(|m| m.modified()).ok())
            .map(|e| e.path())
    }

    fn recover_from_latest_backup(&self) -> Result<Chain, StorageError> {
        let backup = self.newest_backup().ok_or(StorageError::Corrupt)?;
        let bytes = fs::read(&backup)?;
        let value: serde_json::Value =
            serde_json::from_slice(&bytes).map_err(|_| StorageError::Corrupt)?;
        let chain = Chain::from_json(&value).map_err(|_| StorageError::Corrupt)?;
        if !validate_chain(&chain, &self.consensus) {
            return Err(StorageError::Corrupt);
        }
        fs::copy(&backup, self.chain_path())?;
        self.write_checksum(&bytes)?;
        Ok(chain)
    }
}

struct LockGuard {
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn format_timestamp(unix_secs: i64) -> String {
    // Minimal civil-from-days conversion; avoids pulling in a datetime crate
    // for a filename component.
    let days = unix_secs.div_euclid(86_400);
    let secs_of_day = unix_secs.rem_euclid(86_400);
    let (hour, minute, second) = (secs_of_day / 3600, (secs_of_day / 60) % 60, secs_of_day % 60);

    let z = days + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = (z - era * 146_097) as i64;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146_096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = doy - (153 * mp + 2) / 5 + 1;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = if month <= 2 { y + 1 } else { y };

    format!("{year:04}{month:02}{day:02}-{hour:02}{minute:02}{second:02}")
}

impl ChainStorage for FileStorage {
    fn save(&self, chain: &Chain) -> Result<(), StorageError> {
        fs::create_dir_all(&self.data_dir)?;
        self.rotate_backup()?;

        let bytes = serde_json::to_vec_pretty(&chain.to_json()).map_err(|e| StorageError::Backend(e.to_string()))?;
        self.write_checksum(&bytes)?;

        let lock = self.acquire_lock()?;
        let tmp = self.tmp_path();
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(FILE_MODE)
            .open(&tmp)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, self.chain_path())?;
        drop(lock);
        Ok(())
    }

    fn load(&self) -> Result<Chain, StorageError> {
        if !self.exists() {
            return Err(StorageError::NotFound);
        }
        let bytes = fs::read(self.chain_path())?;
        let expected = self.read_checksum().unwrap_or_default();
        let actual = crate::crypto::hash::sha256_hex(&bytes);

        let chain = if actual == expected {
            let value: serde_json::Value =
                serde_json::from_slice(&bytes).map_err(|e| StorageError::Backend(e.to_string()))?;
            Chain::from_json(&value).map_err(|e| StorageError::Backend(e.to_string()))?
        } else {
            self.recover_from_latest_backup()?
        };

        if !validate_chain(&chain, &self.consensus) {
            return Err(StorageError::InvalidChain);
        }
        Ok(chain)
    }

    fn exists(&self) -> bool {
        self.chain_path().exists()
    }

    fn delete(&self) -> Result<(), StorageError> {
        if self.exists() {
            fs::remove_file(self.chain_path())?;
        }
        let _ = fs::remove_file(self.checksum_path());
        Ok(())
    }

    fn backups(&self) -> Result<Vec<String>, StorageError> {
        let backups_dir = self.backups_dir();
        if !backups_dir.exists() {
            return Ok(Vec::new());
        }
        let mut entries: Vec<_> = fs::read_dir(&backups_dir)?
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_file())
            .collect();
        entries.sort_by_key(|e| e.metadata().and_then(|m| m.modified()).ok());
        entries.reverse();
        Ok(entries.into_iter().map(|e| e.path().display().to_string()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

    static CTR: AtomicU64 = AtomicU64::new(0);

    fn tmp_dir() -> PathBuf {
        let id = CTR.fetch_add(1, Ordering::SeqCst);
        PathBuf::from(format!("/tmp/ledgerchain_filestore_{}_{}", std::process::id(), id))
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tmp_dir();
        let storage = FileStorage::new(&dir, 5);
        let mut chain = Chain::new_chain();
        let cancel = AtomicBool::new(false);
        chain
            .append_mined(b"x".to_vec(), "alice", 1, &crate::config::PowConfig::default(), &cancel)
            .unwrap();

        storage.save(&chain).unwrap();
        let loaded = storage.load().unwrap();
        assert_eq!(loaded.length(), chain.length());
        assert_eq!(loaded.latest().unwrap().hash, chain.latest().unwrap().hash);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_backup_rotation_respects_cap() {
        let dir = tmp_dir();
        let storage = FileStorage::new(&dir, 2);
        let mut chain = Chain::new_chain();
        for _ in 0..5 {
            storage.save(&chain).unwrap();
            chain.append_data(b"x".to_vec()).unwrap();
        }
        let backups = storage.backups().unwrap();
        assert!(backups.len() <= 2);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_corruption_recovers_from_backup() {
        let dir = tmp_dir();
        let storage = FileStorage::new(&dir, 5);
        let chain = Chain::new_chain();
        storage.save(&chain).unwrap();
        storage.save(&chain).unwrap(); // second save creates a backup of the first

        // Corrupt the live file without touching the checksum.
        fs::write(storage.chain_path(), b"not json at all").unwrap();

        let loaded = storage.load().unwrap();
        assert!(loaded.is_valid());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_exclusive_lock_rejects_concurrent_writer() {
        let dir = tmp_dir();
        fs::create_dir_all(&dir).unwrap();
        let storage = FileStorage::new(&dir, 5);
        let _held = storage.acquire_lock().unwrap();
        assert!(matches!(storage.acquire_lock(), Err(StorageError::Busy)));
        let _ = fs::remove_dir_all(&dir);
    }
}
