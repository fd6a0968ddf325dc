//! Key/value backends for the transaction log.
//!
//! [`FileLogStore`] keeps an append-only file of framed records:
//!
//! ```text
//! header : [magic "SGXA"][version:u32 LE]
//! record : [len:u32 LE][crc32:u32 LE][bincode(StoreEntry)]
//! ```
//!
//! Replay stops at the first truncated or corrupt record. The live key set
//! is mirrored in memory; once enough records are superseded the file is
//! rewritten to a temp file and renamed over the original.
//!
//! A writable store holds an exclusive advisory lock on `xa_state.lock` in
//! the log directory for its whole lifetime. [`FileLogStore::open_read_only`]
//! takes no lock and never touches the directory.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use fs4::fs_std::FileExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use shardgate_common::config::{SyncMode, TxnLogConfig};
use shardgate_common::error::StorageError;

/// Durable key/value storage used by [`crate::TransactionLog`].
///
/// `put` and `delete` must be durable when they return `Ok`.
pub trait LogStore: Send + Sync {
    fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError>;
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;
    fn delete(&self, key: &str) -> Result<(), StorageError>;
    /// Every live entry, for the recovery scan on startup.
    fn scan(&self) -> Result<Vec<(String, Vec<u8>)>, StorageError>;
}

// ── In-memory store ──

/// Volatile store for tests and single-process setups.
#[derive(Default)]
pub struct MemLogStore {
    map: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }
}

impl LogStore for MemLogStore {
    fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        self.map.write().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.map.read().get(key).cloned())
    }

    fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.map.write().remove(key);
        Ok(())
    }

    fn scan(&self) -> Result<Vec<(String, Vec<u8>)>, StorageError> {
        Ok(self
            .map
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

// ── File store ──

const LOG_MAGIC: &[u8; 4] = b"SGXA";
const LOG_FORMAT_VERSION: u32 = 1;
const LOG_HEADER_SIZE: usize = 8;
const LOG_FILENAME: &str = "xa_state.log";
const LOG_TMP_FILENAME: &str = "xa_state.log.tmp";
const LOCK_FILENAME: &str = "xa_state.lock";

#[derive(Debug, Serialize, Deserialize)]
enum StoreEntry {
    Put { key: String, value: Vec<u8> },
    Delete { key: String },
}

struct FileInner {
    /// `None` when opened read-only.
    writer: Option<BufWriter<File>>,
    index: BTreeMap<String, Vec<u8>>,
    /// Records in the file that no longer describe a live key.
    superseded: usize,
}

/// Point-in-time counters for a [`FileLogStore`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileLogStoreStats {
    pub live_keys: usize,
    pub superseded_records: usize,
    pub appends: u64,
    pub compactions: u64,
}

pub struct FileLogStore {
    dir: PathBuf,
    sync_mode: SyncMode,
    compact_threshold: usize,
    inner: Mutex<FileInner>,
    appends: AtomicU64,
    compactions: AtomicU64,
    /// Held open so the advisory lock lives as long as the store.
    lock_file: Option<File>,
}

impl FileLogStore {
    pub fn open(config: &TxnLogConfig) -> Result<Self, StorageError> {
        Self::open_dir(Path::new(&config.dir), config.sync_mode, config.compact_threshold_records)
    }

    pub fn open_dir(dir: &Path, sync_mode: SyncMode, compact_threshold: usize) -> Result<Self, StorageError> {
        fs::create_dir_all(dir)?;
        let lock = lock_dir(dir)?;
        let path = dir.join(LOG_FILENAME);
        let data = read_log(&path)?;

        let replay = replay(&data)?;
        let live = replay.index.len();
        let superseded = replay.records - live;

        let writer = if data.is_empty() {
            let file = OpenOptions::new().create(true).append(true).open(&path)?;
            let mut writer = BufWriter::new(file);
            writer.write_all(LOG_MAGIC)?;
            writer.write_all(&LOG_FORMAT_VERSION.to_le_bytes())?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
            writer
        } else if replay.clean_len < data.len() {
            // Torn tail from a crash mid-append: rewrite without it so new
            // records are not appended after garbage.
            tracing::warn!(
                path = %path.display(),
                valid = replay.clean_len,
                total = data.len(),
                "transaction log has a torn tail, rewriting"
            );
            write_compacted(dir, &replay.index)?
        } else {
            BufWriter::new(OpenOptions::new().append(true).open(&path)?)
        };

        tracing::info!(path = %path.display(), live, superseded, "transaction log opened");
        Ok(Self {
            dir: dir.to_path_buf(),
            sync_mode,
            compact_threshold: compact_threshold.max(1),
            inner: Mutex::new(FileInner {
                writer: Some(writer),
                index: replay.index,
                superseded: if replay.clean_len < data.len() { 0 } else { superseded },
            }),
            appends: AtomicU64::new(0),
            compactions: AtomicU64::new(0),
            lock_file: Some(lock),
        })
    }

    /// Open for inspection. Replays what is on disk without repairing a torn
    /// tail or creating anything, and works while a coordinator holds the
    /// directory lock. Writes fail with [`StorageError::Unavailable`].
    pub fn open_read_only(dir: &Path) -> Result<Self, StorageError> {
        let path = dir.join(LOG_FILENAME);
        let data = read_log(&path)?;
        let replay = replay(&data)?;
        if replay.clean_len < data.len() {
            tracing::warn!(
                path = %path.display(),
                valid = replay.clean_len,
                total = data.len(),
                "transaction log has a torn tail, left as is"
            );
        }
        Ok(Self {
            dir: dir.to_path_buf(),
            sync_mode: SyncMode::None,
            compact_threshold: usize::MAX,
            inner: Mutex::new(FileInner {
                writer: None,
                superseded: replay.records.saturating_sub(replay.index.len()),
                index: replay.index,
            }),
            appends: AtomicU64::new(0),
            compactions: AtomicU64::new(0),
            lock_file: None,
        })
    }

    pub fn is_read_only(&self) -> bool {
        self.lock_file.is_none()
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(LOG_FILENAME)
    }

    fn append(&self, inner: &mut FileInner, entry: &StoreEntry) -> Result<(), StorageError> {
        let data = bincode::serialize(entry).map_err(|e| StorageError::Serialization(e.to_string()))?;
        let checksum = crc32fast::hash(&data);
        let len = data.len() as u32;
        let writer = inner
            .writer
            .as_mut()
            .ok_or_else(|| StorageError::Unavailable("transaction log opened read-only".into()))?;

        writer.write_all(&len.to_le_bytes())?;
        writer.write_all(&checksum.to_le_bytes())?;
        writer.write_all(&data)?;
        writer.flush()?;
        match self.sync_mode {
            SyncMode::None => {}
            SyncMode::Fsync => writer.get_ref().sync_all()?,
            SyncMode::Fdatasync => writer.get_ref().sync_data()?,
        }
        self.appends.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Compaction runs after the triggering record is durable, so a failure
    /// here only costs disk space. The old file and handle stay in use.
    fn maybe_compact(&self, inner: &mut FileInner) {
        if inner.superseded < self.compact_threshold {
            return;
        }
        match write_compacted(&self.dir, &inner.index) {
            Ok(writer) => inner.writer = Some(writer),
            Err(e) => {
                tracing::warn!(dir = %self.dir.display(), error = %e, "transaction log compaction failed");
                return;
            }
        }
        tracing::debug!(live = inner.index.len(), dropped = inner.superseded, "transaction log compacted");
        inner.superseded = 0;
        self.compactions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> FileLogStoreStats {
        let inner = self.inner.lock();
        FileLogStoreStats {
            live_keys: inner.index.len(),
            superseded_records: inner.superseded,
            appends: self.appends.load(Ordering::Relaxed),
            compactions: self.compactions.load(Ordering::Relaxed),
        }
    }
}

impl LogStore for FileLogStore {
    fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        let mut inner = self.inner.lock();
        let entry = StoreEntry::Put {
            key: key.to_string(),
            value: value.to_vec(),
        };
        self.append(&mut inner, &entry)?;
        if inner.index.insert(key.to_string(), value.to_vec()).is_some() {
            inner.superseded += 1;
        }
        self.maybe_compact(&mut inner);
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.inner.lock().index.get(key).cloned())
    }

    fn delete(&self, key: &str) -> Result<(), StorageError> {
        let mut inner = self.inner.lock();
        if !inner.index.contains_key(key) {
            return Ok(());
        }
        self.append(&mut inner, &StoreEntry::Delete { key: key.to_string() })?;
        inner.index.remove(key);
        // Both the old put and the tombstone are now dead weight.
        inner.superseded += 2;
        self.maybe_compact(&mut inner);
        Ok(())
    }

    fn scan(&self) -> Result<Vec<(String, Vec<u8>)>, StorageError> {
        Ok(self
            .inner
            .lock()
            .index
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

fn read_log(path: &Path) -> Result<Vec<u8>, StorageError> {
    match fs::read(path) {
        Ok(data) => Ok(data),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

/// Take the directory's exclusive advisory lock, failing fast if another
/// store (in this or any other process) holds it.
fn lock_dir(dir: &Path) -> Result<File, StorageError> {
    let path = dir.join(LOCK_FILENAME);
    let file = OpenOptions::new().create(true).truncate(false).write(true).open(&path)?;
    match file.try_lock_exclusive() {
        Ok(true) => Ok(file),
        Ok(false) => Err(StorageError::Unavailable(format!(
            "{} is locked by another process",
            path.display()
        ))),
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Err(StorageError::Unavailable(format!(
            "{} is locked by another process",
            path.display()
        ))),
        Err(e) => Err(e.into()),
    }
}

struct Replay {
    index: BTreeMap<String, Vec<u8>>,
    records: usize,
    /// Length of the prefix made of the header and intact records.
    clean_len: usize,
}

fn replay(data: &[u8]) -> Result<Replay, StorageError> {
    let mut index = BTreeMap::new();
    let mut records = 0;
    if data.is_empty() {
        return Ok(Replay {
            index,
            records,
            clean_len: 0,
        });
    }
    if data.len() < LOG_HEADER_SIZE || &data[0..4] != LOG_MAGIC.as_slice() {
        return Err(StorageError::Corrupted {
            offset: 0,
            reason: "bad transaction log header".into(),
        });
    }
    let version = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
    if version != LOG_FORMAT_VERSION {
        return Err(StorageError::Corrupted {
            offset: 4,
            reason: format!("unsupported transaction log version {version}"),
        });
    }

    let mut pos = LOG_HEADER_SIZE;
    while pos + 8 <= data.len() {
        let len = u32::from_le_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]]) as usize;
        let checksum = u32::from_le_bytes([data[pos + 4], data[pos + 5], data[pos + 6], data[pos + 7]]);
        let body = pos + 8;
        if body + len > data.len() {
            tracing::warn!("transaction log truncated at position {}, stopping replay", pos);
            break;
        }
        let record = &data[body..body + len];
        if crc32fast::hash(record) != checksum {
            tracing::warn!("transaction log checksum mismatch at position {}, stopping replay", pos);
            break;
        }
        match bincode::deserialize::<StoreEntry>(record) {
            Ok(StoreEntry::Put { key, value }) => {
                index.insert(key, value);
            }
            Ok(StoreEntry::Delete { key }) => {
                index.remove(&key);
            }
            Err(e) => {
                tracing::warn!("transaction log decode error at position {}: {}", pos, e);
                break;
            }
        }
        records += 1;
        pos = body + len;
    }
    Ok(Replay {
        index,
        records,
        clean_len: pos,
    })
}

/// Write `index` as a fresh log next to the current one and rename it into
/// place. Returns an append handle on the new file, opened before the
/// rename so nothing can fail once the new file is live.
fn write_compacted(dir: &Path, index: &BTreeMap<String, Vec<u8>>) -> Result<BufWriter<File>, StorageError> {
    let tmp_path = dir.join(LOG_TMP_FILENAME);
    let path = dir.join(LOG_FILENAME);
    {
        let mut tmp = BufWriter::new(File::create(&tmp_path)?);
        tmp.write_all(LOG_MAGIC)?;
        tmp.write_all(&LOG_FORMAT_VERSION.to_le_bytes())?;
        for (key, value) in index {
            let entry = StoreEntry::Put {
                key: key.clone(),
                value: value.clone(),
            };
            let data = bincode::serialize(&entry).map_err(|e| StorageError::Serialization(e.to_string()))?;
            tmp.write_all(&(data.len() as u32).to_le_bytes())?;
            tmp.write_all(&crc32fast::hash(&data).to_le_bytes())?;
            tmp.write_all(&data)?;
        }
        tmp.flush()?;
        tmp.get_ref().sync_all()?;
    }
    let writer = BufWriter::new(OpenOptions::new().append(true).open(&tmp_path)?);
    fs::rename(&tmp_path, &path)?;
    Ok(writer)
}
