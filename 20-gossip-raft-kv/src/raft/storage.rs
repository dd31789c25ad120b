//! Durable log, hard state and snapshots behind [`raft::Storage`].
//!
//! [`RocksLogStore`] keeps one RocksDB database per node under
//! `{data_dir}/raft-{node_id}` with three column families:
//!
//! - `entries`: big-endian index to protobuf [`Entry`]
//! - `metadata`: node id, hard state, conf state, first and last index
//! - `snapshots`: big-endian index to protobuf [`Snapshot`], newest two kept
//!
//! Every mutation is one synced write batch. The whole log is decoded once on
//! open; anything that does not decode, or a gap in the indexes, fails the
//! open with [`StorageError::Corrupt`] and the node refuses to start.
//!
//! [`MemoryLogStore`] wraps raft-rs's own `MemStorage` for tests.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use prost::Message as ProstMessage;
use raft::prelude::{ConfState, Entry, HardState, Snapshot};
use raft::storage::MemStorage;
use raft::{Error as RaftError, GetEntriesContext, RaftState, Storage, StorageError as RaftStorageError};
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, IteratorMode, Options, WriteBatch, WriteOptions, DB};
use tracing::debug;

use super::types::raft_id;
use crate::error::StorageError;

/// Snapshots kept on disk; older ones are deleted in the batch that writes a
/// new one.
pub const RETAINED_SNAPSHOTS: usize = 2;

const CF_ENTRIES: &str = "entries";
const CF_METADATA: &str = "metadata";
const CF_SNAPSHOTS: &str = "snapshots";

const KEY_NODE_ID: &[u8] = b"node_id";
const KEY_HARD_STATE: &[u8] = b"hard_state";
const KEY_CONF_STATE: &[u8] = b"conf_state";
const KEY_FIRST_INDEX: &[u8] = b"first_index";
const KEY_LAST_INDEX: &[u8] = b"last_index";

/// Write side of the log, driven by the consensus worker thread.
///
/// Reads go through [`raft::Storage`]. Clones share one underlying store.
pub trait LogStore: Storage + Clone + Send + 'static {
    /// True until anything was written: no entries, no hard state, no voters.
    fn is_pristine(&self) -> Result<bool, StorageError>;

    /// Appends entries, dropping any existing suffix they overwrite.
    fn append(&self, entries: &[Entry]) -> Result<(), StorageError>;

    fn set_hard_state(&self, hard_state: &HardState) -> Result<(), StorageError>;

    fn set_commit(&self, commit: u64) -> Result<(), StorageError>;

    fn set_conf_state(&self, conf_state: &ConfState) -> Result<(), StorageError>;

    /// Replaces the whole log with a snapshot received from the leader.
    fn apply_snapshot(&self, snapshot: &Snapshot) -> Result<(), StorageError>;

    /// Stores a snapshot taken locally and drops the entries it covers.
    fn compact(&self, snapshot: Snapshot) -> Result<(), StorageError>;

    fn latest_snapshot(&self) -> Result<Option<Snapshot>, StorageError>;
}

fn unavailable_snapshot() -> RaftError {
    RaftError::Store(RaftStorageError::SnapshotTemporarilyUnavailable)
}

/// Volatile store. Clones share state, so a test can "restart" a node by
/// handing a clone to the new instance.
#[derive(Clone)]
pub struct MemoryLogStore {
    log: MemStorage,
    snapshot: Arc<RwLock<Option<Snapshot>>>,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self {
            log: MemStorage::new(),
            snapshot: Arc::new(RwLock::new(None)),
        }
    }

    fn stored_snapshot(&self) -> Option<Snapshot> {
        self.snapshot.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn keep_snapshot(&self, snapshot: Snapshot) {
        *self.snapshot.write().unwrap_or_else(|p| p.into_inner()) = Some(snapshot);
    }
}

impl Default for MemoryLogStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Storage for MemoryLogStore {
    fn initial_state(&self) -> raft::Result<RaftState> {
        self.log.initial_state()
    }

    fn entries(
        &self,
        low: u64,
        high: u64,
        max_size: impl Into<Option<u64>>,
        context: GetEntriesContext,
    ) -> raft::Result<Vec<Entry>> {
        self.log.entries(low, high, max_size, context)
    }

    fn term(&self, idx: u64) -> raft::Result<u64> {
        self.log.term(idx)
    }

    fn first_index(&self) -> raft::Result<u64> {
        self.log.first_index()
    }

    fn last_index(&self) -> raft::Result<u64> {
        self.log.last_index()
    }

    fn snapshot(&self, request_index: u64, _to: u64) -> raft::Result<Snapshot> {
        match self.stored_snapshot() {
            Some(snapshot) if snapshot.get_metadata().index >= request_index => Ok(snapshot),
            _ => Err(unavailable_snapshot()),
        }
    }
}

impl LogStore for MemoryLogStore {
    fn is_pristine(&self) -> Result<bool, StorageError> {
        let state = self.log.initial_state()?;
        Ok(state.hard_state.term == 0
            && state.hard_state.commit == 0
            && state.conf_state.voters.is_empty()
            && self.log.last_index()? == 0)
    }

    fn append(&self, entries: &[Entry]) -> Result<(), StorageError> {
        self.log.wl().append(entries)?;
        Ok(())
    }

    fn set_hard_state(&self, hard_state: &HardState) -> Result<(), StorageError> {
        self.log.wl().set_hardstate(hard_state.clone());
        Ok(())
    }

    fn set_commit(&self, commit: u64) -> Result<(), StorageError> {
        self.log.wl().mut_hard_state().commit = commit;
        Ok(())
    }

    fn set_conf_state(&self, conf_state: &ConfState) -> Result<(), StorageError> {
        self.log.wl().set_conf_state(conf_state.clone());
        Ok(())
    }

    fn apply_snapshot(&self, snapshot: &Snapshot) -> Result<(), StorageError> {
        self.log.wl().apply_snapshot(snapshot.clone())?;
        self.keep_snapshot(snapshot.clone());
        Ok(())
    }

    fn compact(&self, snapshot: Snapshot) -> Result<(), StorageError> {
        // MemStorage keeps the entry at the compaction index as its offset.
        self.log.wl().compact(snapshot.get_metadata().index)?;
        self.keep_snapshot(snapshot);
        Ok(())
    }

    fn latest_snapshot(&self) -> Result<Option<Snapshot>, StorageError> {
        Ok(self.stored_snapshot())
    }
}

/// RocksDB-backed store used by real nodes.
#[derive(Clone)]
pub struct RocksLogStore {
    inner: Arc<RocksInner>,
}

struct RocksInner {
    db: DB,
    path: PathBuf,
    first_index: AtomicU64,
    last_index: AtomicU64,
    snapshot_index: AtomicU64,
    snapshot_term: AtomicU64,
    hard_state: Mutex<HardState>,
}

impl fmt::Debug for RocksLogStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RocksLogStore")
            .field("path", &self.inner.path)
            .field("first_index", &self.inner.first_index.load(Ordering::SeqCst))
            .field("last_index", &self.inner.last_index.load(Ordering::SeqCst))
            .finish()
    }
}

impl RocksLogStore {
    /// Opens (or creates) `{data_dir}/raft-{node}` and checks every persisted
    /// record before returning.
    pub fn open(data_dir: &Path, node: &str) -> Result<Self, StorageError> {
        fs::create_dir_all(data_dir).map_err(|e| StorageError::io(data_dir, e))?;
        let path = data_dir.join(format!("raft-{node}"));

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        let families = [CF_ENTRIES, CF_METADATA, CF_SNAPSHOTS]
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()));
        let db = DB::open_cf_descriptors(&opts, &path, families)?;

        let inner = RocksInner {
            db,
            path,
            first_index: AtomicU64::new(1),
            last_index: AtomicU64::new(0),
            snapshot_index: AtomicU64::new(0),
            snapshot_term: AtomicU64::new(0),
            hard_state: Mutex::new(HardState::default()),
        };
        inner.claim(raft_id(node))?;
        inner.load()?;
        debug!(
            path = %inner.path.display(),
            first = inner.first_index.load(Ordering::SeqCst),
            last = inner.last_index.load(Ordering::SeqCst),
            snapshot = inner.snapshot_index.load(Ordering::SeqCst),
            "opened log store"
        );
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }
}

fn index_key(index: u64) -> [u8; 8] {
    index.to_be_bytes()
}

fn decode_index(bytes: &[u8]) -> Option<u64> {
    bytes.try_into().ok().map(u64::from_be_bytes)
}

fn store_error(err: impl Into<StorageError>) -> RaftError {
    RaftError::Store(RaftStorageError::Other(Box::new(err.into())))
}

impl RocksInner {
    fn cf(&self, name: &str) -> Result<&ColumnFamily, StorageError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StorageError::corrupt(&self.path, format!("missing column family {name}")))
    }

    fn write(&self, batch: WriteBatch) -> Result<(), StorageError> {
        let mut opts = WriteOptions::default();
        opts.set_sync(true);
        self.db.write_opt(batch, &opts)?;
        Ok(())
    }

    fn hard_state(&self) -> MutexGuard<'_, HardState> {
        self.hard_state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn get_record<M: ProstMessage + Default>(&self, family: &str, key: &[u8]) -> Result<Option<M>, StorageError> {
        let Some(bytes) = self.db.get_cf(self.cf(family)?, key)? else {
            return Ok(None);
        };
        M::decode(bytes.as_slice()).map(Some).map_err(|e| {
            StorageError::corrupt(&self.path, format!("{family}/{}: {e}", String::from_utf8_lossy(key)))
        })
    }

    fn get_index(&self, key: &[u8]) -> Result<Option<u64>, StorageError> {
        let Some(bytes) = self.db.get_cf(self.cf(CF_METADATA)?, key)? else {
            return Ok(None);
        };
        decode_index(&bytes).map(Some).ok_or_else(|| {
            StorageError::corrupt(&self.path, format!("{} is not a u64", String::from_utf8_lossy(key)))
        })
    }

    /// Binds the database to a node, or checks it already belongs to it.
    fn claim(&self, node_id: u64) -> Result<(), StorageError> {
        match self.get_index(KEY_NODE_ID)? {
            Some(stored) if stored != node_id => Err(StorageError::NodeMismatch {
                path: self.path.clone(),
                stored,
                requested: node_id,
            }),
            Some(_) => Ok(()),
            None => {
                let mut batch = WriteBatch::default();
                batch.put_cf(self.cf(CF_METADATA)?, KEY_NODE_ID, index_key(node_id));
                self.write(batch)
            }
        }
    }

    fn load(&self) -> Result<(), StorageError> {
        let hard_state: HardState = self.get_record(CF_METADATA, KEY_HARD_STATE)?.unwrap_or_default();
        self.get_record::<ConfState>(CF_METADATA, KEY_CONF_STATE)?;
        let first = self.get_index(KEY_FIRST_INDEX)?.unwrap_or(1);
        let last = self.get_index(KEY_LAST_INDEX)?.unwrap_or(0);
        if last + 1 < first {
            return Err(StorageError::corrupt(&self.path, format!("first index {first} is past last index {last}")));
        }

        match self.newest_snapshot()? {
            Some(snapshot) => {
                let meta = snapshot.get_metadata();
                if meta.index + 1 != first {
                    return Err(StorageError::corrupt(
                        &self.path,
                        format!("snapshot at {} does not precede first index {first}", meta.index),
                    ));
                }
                self.snapshot_index.store(meta.index, Ordering::SeqCst);
                self.snapshot_term.store(meta.term, Ordering::SeqCst);
            }
            None if first > 1 => {
                return Err(StorageError::corrupt(&self.path, format!("log starts at {first} without a snapshot")));
            }
            None => {}
        }

        let mut expected = first;
        for item in self.db.iterator_cf(self.cf(CF_ENTRIES)?, IteratorMode::Start) {
            let (key, value) = item?;
            let index = decode_index(&key)
                .ok_or_else(|| StorageError::corrupt(&self.path, "entry key is not a u64"))?;
            if index != expected || index > last {
                return Err(StorageError::corrupt(
                    &self.path,
                    format!("found entry {index} where {expected} was expected (last {last})"),
                ));
            }
            let entry = Entry::decode(&value[..])
                .map_err(|e| StorageError::corrupt(&self.path, format!("entry {index}: {e}")))?;
            if entry.index != index {
                return Err(StorageError::corrupt(
                    &self.path,
                    format!("entry stored at {index} claims index {}", entry.index),
                ));
            }
            expected += 1;
        }
        if expected != last + 1 {
            return Err(StorageError::corrupt(
                &self.path,
                format!("log ends at {} but last index is {last}", expected - 1),
            ));
        }

        *self.hard_state() = hard_state;
        self.first_index.store(first, Ordering::SeqCst);
        self.last_index.store(last, Ordering::SeqCst);
        Ok(())
    }

    fn newest_snapshot(&self) -> Result<Option<Snapshot>, StorageError> {
        let Some(item) = self.db.iterator_cf(self.cf(CF_SNAPSHOTS)?, IteratorMode::End).next() else {
            return Ok(None);
        };
        let (key, value) = item?;
        Snapshot::decode(&value[..]).map(Some).map_err(|e| {
            StorageError::corrupt(&self.path, format!("snapshot {:?}: {e}", decode_index(&key)))
        })
    }

    /// Queues the new snapshot and the deletion of all but the newest
    /// `RETAINED_SNAPSHOTS - 1` existing ones.
    fn put_snapshot(&self, batch: &mut WriteBatch, snapshot: &Snapshot) -> Result<(), StorageError> {
        let snapshots = self.cf(CF_SNAPSHOTS)?;
        for item in self
            .db
            .iterator_cf(snapshots, IteratorMode::End)
            .skip(RETAINED_SNAPSHOTS - 1)
        {
            let (key, _) = item?;
            batch.delete_cf(snapshots, key);
        }
        batch.put_cf(snapshots, index_key(snapshot.get_metadata().index), snapshot.encode_to_vec());
        Ok(())
    }

    fn load_entry(&self, index: u64) -> raft::Result<Option<Entry>> {
        let entries = self.cf(CF_ENTRIES).map_err(store_error)?;
        let Some(bytes) = self.db.get_cf(entries, index_key(index)).map_err(store_error)? else {
            return Ok(None);
        };
        Entry::decode(bytes.as_slice())
            .map(Some)
            .map_err(|e| store_error(StorageError::corrupt(&self.path, format!("entry {index}: {e}"))))
    }
}

impl Storage for RocksLogStore {
    fn initial_state(&self) -> raft::Result<RaftState> {
        let conf_state = self
            .inner
            .get_record(CF_METADATA, KEY_CONF_STATE)
            .map_err(store_error)?
            .unwrap_or_default();
        Ok(RaftState {
            hard_state: self.inner.hard_state().clone(),
            conf_state,
        })
    }

    fn entries(
        &self,
        low: u64,
        high: u64,
        max_size: impl Into<Option<u64>>,
        _context: GetEntriesContext,
    ) -> raft::Result<Vec<Entry>> {
        let max_size = max_size.into();
        if low < self.inner.first_index.load(Ordering::SeqCst) {
            return Err(RaftError::Store(RaftStorageError::Compacted));
        }
        if high > self.inner.last_index.load(Ordering::SeqCst) + 1 {
            return Err(RaftError::Store(RaftStorageError::Unavailable));
        }

        let mut entries = Vec::new();
        let mut total = 0u64;
        for index in low..high {
            let Some(entry) = self.inner.load_entry(index)? else {
                return Err(RaftError::Store(RaftStorageError::Unavailable));
            };
            let size = entry.encoded_len() as u64;
            // The first entry is returned even when it alone exceeds the limit.
            if matches!(max_size, Some(max) if !entries.is_empty() && total + size > max) {
                break;
            }
            total += size;
            entries.push(entry);
        }
        Ok(entries)
    }

    fn term(&self, idx: u64) -> raft::Result<u64> {
        if idx == self.inner.snapshot_index.load(Ordering::SeqCst) {
            return Ok(self.inner.snapshot_term.load(Ordering::SeqCst));
        }
        if idx < self.inner.first_index.load(Ordering::SeqCst) {
            return Err(RaftError::Store(RaftStorageError::Compacted));
        }
        if idx > self.inner.last_index.load(Ordering::SeqCst) {
            return Err(RaftError::Store(RaftStorageError::Unavailable));
        }
        match self.inner.load_entry(idx)? {
            Some(entry) => Ok(entry.term),
            None => Err(RaftError::Store(RaftStorageError::Unavailable)),
        }
    }

    fn first_index(&self) -> raft::Result<u64> {
        Ok(self.inner.first_index.load(Ordering::SeqCst))
    }

    fn last_index(&self) -> raft::Result<u64> {
        Ok(self.inner.last_index.load(Ordering::SeqCst))
    }

    fn snapshot(&self, request_index: u64, _to: u64) -> raft::Result<Snapshot> {
        match self.inner.newest_snapshot().map_err(store_error)? {
            Some(snapshot) if snapshot.get_metadata().index >= request_index => Ok(snapshot),
            _ => Err(unavailable_snapshot()),
        }
    }
}

impl LogStore for RocksLogStore {
    fn is_pristine(&self) -> Result<bool, StorageError> {
        let hard_state = self.inner.hard_state().clone();
        let conf_state: Option<ConfState> = self.inner.get_record(CF_METADATA, KEY_CONF_STATE)?;
        Ok(hard_state == HardState::default()
            && conf_state.map_or(true, |cs| cs.voters.is_empty())
            && self.inner.last_index.load(Ordering::SeqCst) == 0)
    }

    fn append(&self, entries: &[Entry]) -> Result<(), StorageError> {
        let (Some(head), Some(tail)) = (entries.first(), entries.last()) else {
            return Ok(());
        };
        let inner = &self.inner;
        let first = inner.first_index.load(Ordering::SeqCst);
        let last = inner.last_index.load(Ordering::SeqCst);
        if head.index < first {
            return Err(RaftError::Store(RaftStorageError::Compacted).into());
        }
        if head.index > last + 1 {
            return Err(StorageError::corrupt(
                &inner.path,
                format!("append at {} leaves a gap after {last}", head.index),
            ));
        }

        let entries_cf = inner.cf(CF_ENTRIES)?;
        let mut batch = WriteBatch::default();
        for entry in entries {
            batch.put_cf(entries_cf, index_key(entry.index), entry.encode_to_vec());
        }
        if last > tail.index {
            batch.delete_range_cf(entries_cf, index_key(tail.index + 1), index_key(last + 1));
        }
        batch.put_cf(inner.cf(CF_METADATA)?, KEY_LAST_INDEX, index_key(tail.index));
        inner.write(batch)?;
        inner.last_index.store(tail.index, Ordering::SeqCst);
        Ok(())
    }

    fn set_hard_state(&self, hard_state: &HardState) -> Result<(), StorageError> {
        let mut batch = WriteBatch::default();
        batch.put_cf(self.inner.cf(CF_METADATA)?, KEY_HARD_STATE, hard_state.encode_to_vec());
        self.inner.write(batch)?;
        *self.inner.hard_state() = hard_state.clone();
        Ok(())
    }

    fn set_commit(&self, commit: u64) -> Result<(), StorageError> {
        let mut hard_state = self.inner.hard_state().clone();
        hard_state.commit = commit;
        self.set_hard_state(&hard_state)
    }

    fn set_conf_state(&self, conf_state: &ConfState) -> Result<(), StorageError> {
        let mut batch = WriteBatch::default();
        batch.put_cf(self.inner.cf(CF_METADATA)?, KEY_CONF_STATE, conf_state.encode_to_vec());
        self.inner.write(batch)
    }

    fn apply_snapshot(&self, snapshot: &Snapshot) -> Result<(), StorageError> {
        let inner = &self.inner;
        let meta = snapshot.get_metadata();
        let first = inner.first_index.load(Ordering::SeqCst);
        let last = inner.last_index.load(Ordering::SeqCst);

        let mut hard_state = inner.hard_state().clone();
        hard_state.term = hard_state.term.max(meta.term);
        hard_state.commit = hard_state.commit.max(meta.index);

        let metadata = inner.cf(CF_METADATA)?;
        let mut batch = WriteBatch::default();
        if last >= first {
            batch.delete_range_cf(inner.cf(CF_ENTRIES)?, index_key(first), index_key(last + 1));
        }
        inner.put_snapshot(&mut batch, snapshot)?;
        batch.put_cf(metadata, KEY_FIRST_INDEX, index_key(meta.index + 1));
        batch.put_cf(metadata, KEY_LAST_INDEX, index_key(meta.index));
        batch.put_cf(metadata, KEY_CONF_STATE, meta.get_conf_state().encode_to_vec());
        batch.put_cf(metadata, KEY_HARD_STATE, hard_state.encode_to_vec());
        inner.write(batch)?;

        *inner.hard_state() = hard_state;
        inner.first_index.store(meta.index + 1, Ordering::SeqCst);
        inner.last_index.store(meta.index, Ordering::SeqCst);
        inner.snapshot_index.store(meta.index, Ordering::SeqCst);
        inner.snapshot_term.store(meta.term, Ordering::SeqCst);
        Ok(())
    }

    fn compact(&self, snapshot: Snapshot) -> Result<(), StorageError> {
        let inner = &self.inner;
        let meta = snapshot.get_metadata();
        let first = inner.first_index.load(Ordering::SeqCst);
        let last = inner.last_index.load(Ordering::SeqCst);
        if meta.index > last {
            return Err(RaftError::Store(RaftStorageError::Unavailable).into());
        }

        let mut batch = WriteBatch::default();
        if meta.index >= first {
            batch.delete_range_cf(inner.cf(CF_ENTRIES)?, index_key(first), index_key(meta.index + 1));
        }
        inner.put_snapshot(&mut batch, &snapshot)?;
        batch.put_cf(inner.cf(CF_METADATA)?, KEY_FIRST_INDEX, index_key(meta.index + 1));
        inner.write(batch)?;

        inner.first_index.store(meta.index + 1, Ordering::SeqCst);
        inner.snapshot_index.store(meta.index, Ordering::SeqCst);
        inner.snapshot_term.store(meta.term, Ordering::SeqCst);
        Ok(())
    }

    fn latest_snapshot(&self) -> Result<Option<Snapshot>, StorageError> {
        self.inner.newest_snapshot()
    }
}

impl RocksLogStore {
    /// Indexes of the snapshots currently on disk, oldest first.
    pub fn snapshot_indexes(&self) -> Result<Vec<u64>, StorageError> {
        let mut indexes = Vec::new();
        let snapshots = self.inner.cf(CF_SNAPSHOTS)?;
        for item in self.inner.db.iterator_cf(snapshots, IteratorMode::Start) {
            let (key, _) = item?;
            indexes.extend(decode_index(&key));
        }
        Ok(indexes)
    }
}
