//! RocksDB-backed raft log

use std::fmt::Debug;
use std::io;
use std::ops::{Bound, RangeBounds};
use std::path::Path;
use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder};
use openraft::entry::RaftEntry;
use openraft::storage::{IOFlushed, LogState, RaftLogStorage};
use openraft::{Entry, LogId, RaftLogReader, StorageError, Vote};
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, DB, Direction, IteratorMode, Options};
use tracing::debug;

use crate::{ControllerResult, TypeConfig};

const CF_META: &str = "meta";
const CF_LOGS: &str = "logs";

/// Durable raft log and vote
#[derive(Debug, Clone)]
pub struct LogStore {
    db: Arc<DB>,
}

impl LogStore {
    /// Open (or create) the log store at `path`
    pub fn open(path: impl AsRef<Path>) -> ControllerResult<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cfs = vec![
            ColumnFamilyDescriptor::new(CF_META, Options::default()),
            ColumnFamilyDescriptor::new(CF_LOGS, Options::default()),
        ];

        let db = DB::open_cf_descriptors(&opts, path.as_ref(), cfs)
            .map_err(|e| crate::Error::Raft(format!("failed to open log store: {e}")))?;

        Ok(Self { db: Arc::new(db) })
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily, StorageError<TypeConfig>> {
        self.db.cf_handle(name).ok_or_else(|| {
            StorageError::read_logs(&io::Error::new(
                io::ErrorKind::NotFound,
                format!("column family `{name}` not found"),
            ))
        })
    }

    /// Get a store metadata.
    fn get_meta<M: meta::StoreMeta>(&self) -> Result<Option<M::Value>, StorageError<TypeConfig>> {
        let bytes = self
            .db
            .get_cf(self.cf(CF_META)?, M::KEY)
            .map_err(|e| M::read_err(e))?;

        let Some(bytes) = bytes else {
            return Ok(None);
        };

        let t = serde_json::from_slice(&bytes).map_err(|e| M::read_err(e))?;
        Ok(Some(t))
    }

    /// Save a store metadata.
    fn put_meta<M: meta::StoreMeta>(&self, value: &M::Value) -> Result<(), StorageError<TypeConfig>> {
        let json_value = serde_json::to_vec(value).map_err(|e| M::write_err(value, e))?;

        self.db
            .put_cf(self.cf(CF_META)?, M::KEY, json_value)
            .map_err(|e| M::write_err(value, e))?;

        Ok(())
    }

    fn decode_entry(bytes: &[u8]) -> Result<Entry<TypeConfig>, StorageError<TypeConfig>> {
        ciborium::from_reader(bytes).map_err(|e| StorageError::read_logs(&e))
    }
}

impl RaftLogReader<TypeConfig> for LogStore {
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + Debug + Send>(
        &mut self,
        range: RB,
    ) -> Result<Vec<Entry<TypeConfig>>, StorageError<TypeConfig>> {
        let start = match range.start_bound() {
            Bound::Included(x) => id_to_bin(*x),
            Bound::Excluded(x) => id_to_bin(*x + 1),
            Bound::Unbounded => id_to_bin(0),
        };

        let mut res = Vec::new();

        let it = self.db.iterator_cf(
            self.cf(CF_LOGS)?,
            IteratorMode::From(&start, Direction::Forward),
        );
        for item in it {
            let (id, val) = item.map_err(|e| StorageError::read_logs(&e))?;

            let id = bin_to_id(&id)?;
            if !range.contains(&id) {
                break;
            }

            res.push(Self::decode_entry(&val)?);
        }
        Ok(res)
    }

    async fn read_vote(&mut self) -> Result<Option<Vote<TypeConfig>>, StorageError<TypeConfig>> {
        self.get_meta::<meta::Vote>()
    }
}

impl RaftLogStorage<TypeConfig> for LogStore {
    type LogReader = Self;

    async fn get_log_state(&mut self) -> Result<LogState<TypeConfig>, StorageError<TypeConfig>> {
        let last = self
            .db
            .iterator_cf(self.cf(CF_LOGS)?, IteratorMode::End)
            .next();

        let last_log_id = match last {
            Some(res) => {
                let (_index, entry_bytes) = res.map_err(|e| StorageError::read_logs(&e))?;
                Some(Self::decode_entry(&entry_bytes)?.log_id())
            }
            None => None,
        };

        let last_purged_log_id = self.get_meta::<meta::LastPurged>()?;
        let last_log_id = last_log_id.or_else(|| last_purged_log_id.clone());

        Ok(LogState {
            last_purged_log_id,
            last_log_id,
        })
    }

    async fn get_log_reader(&mut self) -> Self::LogReader {
        self.clone()
    }

    async fn save_vote(&mut self, vote: &Vote<TypeConfig>) -> Result<(), StorageError<TypeConfig>> {
        self.put_meta::<meta::Vote>(vote)?;
        self.db
            .flush_wal(true)
            .map_err(|e| StorageError::write_vote(&e))?;
        Ok(())
    }

    async fn append<I>(
        &mut self,
        entries: I,
        callback: IOFlushed<TypeConfig>,
    ) -> Result<(), StorageError<TypeConfig>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + Send,
    {
        let cf = self.cf(CF_LOGS)?;
        for entry in entries {
            let mut buf = Vec::new();
            ciborium::into_writer(&entry, &mut buf).map_err(|e| StorageError::write_logs(&e))?;
            self.db
                .put_cf(cf, id_to_bin(entry.index()), buf)
                .map_err(|e| StorageError::write_logs(&e))?;
        }

        self.db
            .flush_wal(true)
            .map_err(|e| StorageError::write_logs(&e))?;

        // on error the callback is dropped, which openraft treats as a failure
        callback.io_completed(Ok(()));
        Ok(())
    }

    async fn truncate(&mut self, log_id: LogId<TypeConfig>) -> Result<(), StorageError<TypeConfig>> {
        debug!("truncate: [{:?}, +oo)", log_id);

        let from = id_to_bin(log_id.index);
        let to = id_to_bin(u64::MAX);
        self.db
            .delete_range_cf(self.cf(CF_LOGS)?, from, to)
            .map_err(|e| StorageError::write_logs(&e))?;

        self.db
            .flush_wal(true)
            .map_err(|e| StorageError::write_logs(&e))?;
        Ok(())
    }

    async fn purge(&mut self, log_id: LogId<TypeConfig>) -> Result<(), StorageError<TypeConfig>> {
        debug!("purge: [0, {:?}]", log_id);

        // record the purge point before dropping entries
        self.put_meta::<meta::LastPurged>(&log_id)?;

        let from = id_to_bin(0);
        let to = id_to_bin(log_id.index + 1);
        self.db
            .delete_range_cf(self.cf(CF_LOGS)?, from, to)
            .map_err(|e| StorageError::write_logs(&e))?;

        Ok(())
    }
}

/// Metadata storage definitions
mod meta {
    use openraft::{AnyError, ErrorSubject, ErrorVerb, StorageError};

    use crate::TypeConfig;

    /// Defines metadata key and value
    pub(super) trait StoreMeta {
        /// The key used to store in rocksdb
        const KEY: &'static str;

        /// The type of the value to store
        type Value: serde::Serialize + serde::de::DeserializeOwned;

        /// The subject this meta belongs to
        fn subject(v: Option<&Self::Value>) -> ErrorSubject<TypeConfig>;

        fn read_err(e: impl std::error::Error + 'static) -> StorageError<TypeConfig> {
            StorageError::new(Self::subject(None), ErrorVerb::Read, AnyError::new(&e))
        }

        fn write_err(v: &Self::Value, e: impl std::error::Error + 'static) -> StorageError<TypeConfig> {
            StorageError::new(Self::subject(Some(v)), ErrorVerb::Write, AnyError::new(&e))
        }
    }

    pub(super) struct LastPurged;
    pub(super) struct Vote;

    impl StoreMeta for LastPurged {
        const KEY: &'static str = "last_purged_log_id";
        type Value = openraft::LogId<TypeConfig>;

        fn subject(_v: Option<&Self::Value>) -> ErrorSubject<TypeConfig> {
            ErrorSubject::Store
        }
    }

    impl StoreMeta for Vote {
        const KEY: &'static str = "vote";
        type Value = openraft::Vote<TypeConfig>;

        fn subject(_v: Option<&Self::Value>) -> ErrorSubject<TypeConfig> {
            ErrorSubject::Vote
        }
    }
}

/// Big endian keys keep rocksdb's byte order equal to log order
fn id_to_bin(id: u64) -> [u8; 8] {
    let mut buf = [0u8; 8];
    BigEndian::write_u64(&mut buf, id);
    buf
}

fn bin_to_id(buf: &[u8]) -> Result<u64, StorageError<TypeConfig>> {
    if buf.len() != 8 {
        return Err(StorageError::read_logs(&io::Error::new(
            io::ErrorKind::InvalidData,
            format!("log key has {} bytes, expected 8", buf.len()),
        )));
    }
    Ok(BigEndian::read_u64(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use openraft::EntryPayload;
    use tempfile::TempDir;

    use crate::CommandPayload;
    use crate::types::test_log_id;

    fn entry(term: u64, index: u64) -> Entry<TypeConfig> {
        Entry {
            log_id: test_log_id(term, index),
            payload: EntryPayload::Normal(CommandPayload::new(vec![index as u8])),
        }
    }

    async fn append(store: &mut LogStore, entries: Vec<Entry<TypeConfig>>) {
        for e in entries {
            let key = id_to_bin(e.index());
            let mut buf = Vec::new();
            ciborium::into_writer(&e, &mut buf).unwrap();
            store
                .db
                .put_cf(store.cf(CF_LOGS).unwrap(), key, buf)
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_read_truncate_purge() {
        let dir = TempDir::new().unwrap();
        let mut store = LogStore::open(dir.path().join("raft-log")).unwrap();

        append(&mut store, (1..=5).map(|i| entry(1, i)).collect()).await;

        let read = store.try_get_log_entries(2..4).await.unwrap();
        assert_eq!(read.iter().map(|e| e.index()).collect::<Vec<_>>(), vec![2, 3]);

        let state = store.get_log_state().await.unwrap();
        assert_eq!(state.last_log_id.map(|l| l.index), Some(5));
        assert_eq!(state.last_purged_log_id, None);

        store.truncate(entry(1, 4).log_id()).await.unwrap();
        let state = store.get_log_state().await.unwrap();
        assert_eq!(state.last_log_id.map(|l| l.index), Some(3));

        store.purge(entry(1, 3).log_id()).await.unwrap();
        let state = store.get_log_state().await.unwrap();
        assert_eq!(state.last_purged_log_id.map(|l| l.index), Some(3));
        // nothing left in the log, so the purge point is the last log id
        assert_eq!(state.last_log_id.map(|l| l.index), Some(3));
        assert!(store.try_get_log_entries(..).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_vote_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("raft-log");
        let vote = Vote::new(3, "ctrl-b".to_string());

        {
            let mut store = LogStore::open(&path).unwrap();
            assert_eq!(store.read_vote().await.unwrap(), None);
            store.save_vote(&vote).await.unwrap();
        }

        let mut store = LogStore::open(&path).unwrap();
        assert_eq!(store.read_vote().await.unwrap(), Some(vote));
    }
}
