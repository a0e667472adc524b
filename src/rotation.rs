//! Shared round-robin index over the key pool.
//!
//! The file-backed counter is the one worker processes share: the value lives
//! in a plain-text file and every read-advance-write happens under an
//! exclusive advisory lock on a sibling `.lock` file. The lock is held only
//! for that short critical section, never across upstream I/O.

use std::ffi::OsString;
use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{debug, info, warn};

use crate::{RelayError, Result};

/// Atomic increment-and-fetch over `0..pool_size`.
pub trait RotationCounter: Send + Sync {
    /// Returns the current index and persists `(current + 1) % pool_size`.
    ///
    /// A missing or unparsable stored value counts as `0`, as does a value
    /// that is out of range for `pool_size`.
    fn acquire_and_advance(&self, pool_size: usize) -> Result<usize>;
}

#[derive(Debug, Clone)]
pub struct FileRotationCounter {
    counter_path: PathBuf,
    lock_path: PathBuf,
}

impl FileRotationCounter {
    /// Uses `counter_path` for the value and `<counter_path>.lock` for the lock.
    /// Nothing is touched on disk until the first acquisition.
    pub fn new(counter_path: impl Into<PathBuf>) -> Self {
        let counter_path = counter_path.into();
        let mut lock_name = OsString::from(counter_path.as_os_str());
        lock_name.push(".lock");
        Self {
            counter_path,
            lock_path: PathBuf::from(lock_name),
        }
    }

    /// Creates `dir` if needed and seeds the counter with `0` when no file
    /// exists yet. Safe to call from every worker at startup.
    pub fn open(dir: impl AsRef<Path>, file_name: &str) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir).map_err(|err| RelayError::storage(dir, err))?;
        let counter = Self::new(dir.join(file_name));
        counter.with_lock(|| {
            if counter.counter_path.exists() {
                return Ok(());
            }
            write_index(&counter.counter_path, 0)?;
            info!(path = %counter.counter_path.display(), "initialized key rotation counter");
            Ok(())
        })?;
        Ok(counter)
    }

    pub fn counter_path(&self) -> &Path {
        &self.counter_path
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    /// Runs `f` while holding a blocking exclusive lock on the lock file.
    fn with_lock<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.lock_path)
            .map_err(|err| RelayError::storage(&self.lock_path, err))?;

        let mut lock = fd_lock::RwLock::new(file);
        let _guard = lock
            .write()
            .map_err(|err| RelayError::storage(&self.lock_path, err))?;
        f()
    }
}

impl RotationCounter for FileRotationCounter {
    fn acquire_and_advance(&self, pool_size: usize) -> Result<usize> {
        if pool_size == 0 {
            return Err(RelayError::Config("key pool is empty".to_string()));
        }

        self.with_lock(|| {
            let current = read_index(&self.counter_path, pool_size)?;
            let next = (current + 1) % pool_size;
            write_index(&self.counter_path, next)?;
            debug!(current, next, pool_size, "advanced key rotation counter");
            Ok(current)
        })
    }
}

fn read_index(path: &Path, pool_size: usize) -> Result<usize> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(0),
        Err(err) => return Err(RelayError::storage(path, err)),
    };

    match raw.trim().parse::<usize>() {
        Ok(value) if value < pool_size => Ok(value),
        Ok(value) => {
            warn!(value, pool_size, "rotation counter out of range; restarting at 0");
            Ok(0)
        }
        Err(_) => {
            warn!(path = %path.display(), "rotation counter unreadable; restarting at 0");
            Ok(0)
        }
    }
}

fn write_index(path: &Path, value: usize) -> Result<()> {
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, value.to_string()).map_err(|err| RelayError::storage(&tmp_path, err))?;
    fs::rename(&tmp_path, path).map_err(|err| RelayError::storage(path, err))
}

/// Single-process counter for deployments that run exactly one worker.
#[derive(Debug, Default)]
pub struct MemoryRotationCounter {
    value: Mutex<usize>,
}

impl MemoryRotationCounter {
    pub fn new(initial: usize) -> Self {
        Self {
            value: Mutex::new(initial),
        }
    }
}

impl RotationCounter for MemoryRotationCounter {
    fn acquire_and_advance(&self, pool_size: usize) -> Result<usize> {
        if pool_size == 0 {
            return Err(RelayError::Config("key pool is empty".to_string()));
        }
        let mut value = self
            .value
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let current = if *value < pool_size { *value } else { 0 };
        *value = (current + 1) % pool_size;
        Ok(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn open_seeds_counter_with_zero() -> Result<()> {
        let dir = tempdir()?;
        let counter = FileRotationCounter::open(dir.path().join("state"), "counter.txt")?;
        assert_eq!(fs::read_to_string(counter.counter_path())?, "0");
        assert!(counter.lock_path().ends_with("counter.txt.lock"));
        Ok(())
    }

    #[test]
    fn open_keeps_existing_value() -> Result<()> {
        let dir = tempdir()?;
        fs::write(dir.path().join("counter.txt"), "2")?;
        let counter = FileRotationCounter::open(dir.path(), "counter.txt")?;
        assert_eq!(counter.acquire_and_advance(4)?, 2);
        Ok(())
    }

    #[test]
    fn advances_round_robin_with_wraparound() -> Result<()> {
        let dir = tempdir()?;
        let counter = FileRotationCounter::open(dir.path(), "counter.txt")?;
        let seen: Vec<usize> = (0..7)
            .map(|_| counter.acquire_and_advance(3))
            .collect::<Result<_>>()?;
        assert_eq!(seen, vec![0, 1, 2, 0, 1, 2, 0]);
        assert_eq!(fs::read_to_string(counter.counter_path())?, "1");
        Ok(())
    }

    #[test]
    fn missing_file_counts_as_zero_and_is_persisted() -> Result<()> {
        let dir = tempdir()?;
        let counter = FileRotationCounter::new(dir.path().join("counter.txt"));
        assert!(!counter.counter_path().exists());
        assert_eq!(counter.acquire_and_advance(3)?, 0);
        assert_eq!(fs::read_to_string(counter.counter_path())?, "1");
        Ok(())
    }

    #[test]
    fn corrupt_file_counts_as_zero_and_is_repaired() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("counter.txt");
        fs::write(&path, "not-a-number")?;
        let counter = FileRotationCounter::new(&path);
        assert_eq!(counter.acquire_and_advance(3)?, 0);
        assert_eq!(fs::read_to_string(&path)?, "1");
        Ok(())
    }

    #[test]
    fn out_of_range_value_counts_as_zero() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("counter.txt");
        fs::write(&path, "9\n")?;
        let counter = FileRotationCounter::new(&path);
        assert_eq!(counter.acquire_and_advance(2)?, 0);
        assert_eq!(counter.acquire_and_advance(2)?, 1);
        Ok(())
    }

    #[test]
    fn unusable_counter_path_is_a_storage_error() -> Result<()> {
        let dir = tempdir()?;
        // A directory in place of the counter file can be neither read nor replaced.
        let path = dir.path().join("counter.txt");
        fs::create_dir(&path)?;
        fs::write(path.join("occupied"), "x")?;
        let counter = FileRotationCounter::new(&path);
        let err = counter.acquire_and_advance(3).unwrap_err();
        assert!(matches!(err, RelayError::Storage { .. }), "{err}");
        Ok(())
    }

    #[test]
    fn zero_pool_size_is_rejected() {
        let counter = MemoryRotationCounter::default();
        assert!(counter.acquire_and_advance(0).is_err());
    }

    #[test]
    fn memory_counter_matches_file_semantics() -> Result<()> {
        let counter = MemoryRotationCounter::new(5);
        assert_eq!(counter.acquire_and_advance(3)?, 0);
        assert_eq!(counter.acquire_and_advance(3)?, 1);
        assert_eq!(counter.acquire_and_advance(3)?, 2);
        assert_eq!(counter.acquire_and_advance(3)?, 0);
        Ok(())
    }
}
