//! Store transactions

use byteorder::{BigEndian, ByteOrder};
use rocksdb::{Direction, IteratorMode, OptimisticTransactionDB, Transaction};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::{Bucket, Db, DbError, DbResult};

/// Hook run against a transaction right before it commits
pub type PreCommitHook<'a> = Box<dyn FnOnce(&mut Tx<'a>) -> DbResult<()> + 'a>;

/// Typed metadata value stored under a fixed key in [`Bucket::Meta`]
pub trait MetaKey {
    /// The key used to store the value
    const KEY: &'static str;

    /// The type of the value to store
    type Value: Serialize + DeserializeOwned;
}

/// A store transaction.
///
/// Obtained from [`Db::view`] or [`Db::update`]; writes become visible to
/// other transactions only once an `update` commits.
pub struct Tx<'a> {
    db: &'a Db,
    txn: Transaction<'a, OptimisticTransactionDB>,
    hooks: Vec<PreCommitHook<'a>>,
}

impl<'a> Tx<'a> {
    pub(crate) fn new(db: &'a Db, txn: Transaction<'a, OptimisticTransactionDB>) -> Self {
        Self {
            db,
            txn,
            hooks: Vec::new(),
        }
    }

    /// Read a raw value
    pub fn get(&self, bucket: Bucket, key: impl AsRef<[u8]>) -> DbResult<Option<Vec<u8>>> {
        Ok(self.txn.get_cf(self.db.cf(bucket)?, key)?)
    }

    /// Whether `key` holds a value
    pub fn contains(&self, bucket: Bucket, key: impl AsRef<[u8]>) -> DbResult<bool> {
        Ok(self.get(bucket, key)?.is_some())
    }

    /// Write a raw value
    pub fn put(
        &self,
        bucket: Bucket,
        key: impl AsRef<[u8]>,
        value: impl AsRef<[u8]>,
    ) -> DbResult<()> {
        Ok(self.txn.put_cf(self.db.cf(bucket)?, key, value)?)
    }

    /// Remove a value; removing an absent key is not an error
    pub fn delete(&self, bucket: Bucket, key: impl AsRef<[u8]>) -> DbResult<()> {
        Ok(self.txn.delete_cf(self.db.cf(bucket)?, key)?)
    }

    /// All entries whose key starts with `prefix`, in key order
    pub fn scan_prefix(
        &self,
        bucket: Bucket,
        prefix: impl AsRef<[u8]>,
    ) -> DbResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let prefix = prefix.as_ref();
        let mut entries = Vec::new();

        let iter = self.txn.iterator_cf(
            self.db.cf(bucket)?,
            IteratorMode::From(prefix, Direction::Forward),
        );
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            entries.push((key.into_vec(), value.into_vec()));
        }

        Ok(entries)
    }

    /// Read a JSON encoded value
    pub fn get_json<T: DeserializeOwned>(&self, bucket: Bucket, key: &str) -> DbResult<Option<T>> {
        let Some(bytes) = self.get(bucket, key)? else {
            return Ok(None);
        };

        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| DbError::Metadata {
                key: key.to_string(),
                source,
            })
    }

    /// Write a JSON encoded value
    pub fn put_json<T: Serialize>(&self, bucket: Bucket, key: &str, value: &T) -> DbResult<()> {
        let bytes = serde_json::to_vec(value).map_err(|source| DbError::Metadata {
            key: key.to_string(),
            source,
        })?;
        self.put(bucket, key, bytes)
    }

    /// Read a big-endian `u64`
    pub fn get_u64(&self, bucket: Bucket, key: &str) -> DbResult<Option<u64>> {
        match self.get(bucket, key)? {
            Some(bytes) if bytes.len() == 8 => Ok(Some(BigEndian::read_u64(&bytes))),
            Some(_) => Err(DbError::BadInteger(key.to_string())),
            None => Ok(None),
        }
    }

    /// Write a big-endian `u64`
    pub fn put_u64(&self, bucket: Bucket, key: &str, value: u64) -> DbResult<()> {
        let mut buf = [0u8; 8];
        BigEndian::write_u64(&mut buf, value);
        self.put(bucket, key, buf)
    }

    /// Read a typed metadata value
    pub fn get_meta<M: MetaKey>(&self) -> DbResult<Option<M::Value>> {
        self.get_json(Bucket::Meta, M::KEY)
    }

    /// Write a typed metadata value
    pub fn put_meta<M: MetaKey>(&self, value: &M::Value) -> DbResult<()> {
        self.put_json(Bucket::Meta, M::KEY, value)
    }

    /// Register a hook to run after the transaction body succeeds and before
    /// the commit. Hooks run in registration order.
    pub fn on_pre_commit(&mut self, hook: impl FnOnce(&mut Tx<'a>) -> DbResult<()> + 'a) {
        self.hooks.push(Box::new(hook));
    }

    pub(crate) fn commit(mut self) -> DbResult<()> {
        while !self.hooks.is_empty() {
            let hooks = std::mem::take(&mut self.hooks);
            for hook in hooks {
                hook(&mut self)?;
            }
        }

        self.txn.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::{Bucket, Db, MetaKey};
    use tempfile::TempDir;

    struct ClusterName;

    impl MetaKey for ClusterName {
        const KEY: &'static str = "cluster_name";
        type Value = String;
    }

    #[test]
    fn test_scan_prefix_stops_at_prefix_boundary() {
        let dir = TempDir::new().unwrap();
        let db = Db::open(dir.path().join("ctrl.db")).unwrap();

        db.update(|tx| {
            tx.put(Bucket::Meta, "servers/a", b"1")?;
            tx.put(Bucket::Meta, "servers/b", b"2")?;
            tx.put(Bucket::Meta, "serverz", b"3")?;
            tx.put(Bucket::Meta, "alpha", b"4")
        })
        .unwrap();

        let entries = db.view(|tx| tx.scan_prefix(Bucket::Meta, "servers/")).unwrap();
        let keys: Vec<_> = entries
            .iter()
            .map(|(k, _)| String::from_utf8(k.clone()).unwrap())
            .collect();
        assert_eq!(keys, vec!["servers/a", "servers/b"]);
    }

    #[test]
    fn test_typed_metadata() {
        let dir = TempDir::new().unwrap();
        let db = Db::open(dir.path().join("ctrl.db")).unwrap();

        assert_eq!(db.view(|tx| tx.get_meta::<ClusterName>()).unwrap(), None);

        db.update(|tx| tx.put_meta::<ClusterName>(&"east".to_string()))
            .unwrap();
        assert_eq!(
            db.view(|tx| tx.get_meta::<ClusterName>()).unwrap(),
            Some("east".to_string())
        );
    }

    #[test]
    fn test_u64_width_is_checked() {
        let dir = TempDir::new().unwrap();
        let db = Db::open(dir.path().join("ctrl.db")).unwrap();

        db.update(|tx| {
            tx.put_u64(Bucket::Meta, "good", 42)?;
            tx.put(Bucket::Meta, "bad", b"abc")
        })
        .unwrap();

        assert_eq!(db.view(|tx| tx.get_u64(Bucket::Meta, "good")).unwrap(), Some(42));
        assert!(db.view(|tx| tx.get_u64(Bucket::Meta, "bad")).is_err());
    }
}
