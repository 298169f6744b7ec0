//! Transactional embedded store backing the replicated state machine.
//!
//! The store is a rocksdb `OptimisticTransactionDB` with two buckets (column
//! families): [`Bucket::Root`] for application entities and [`Bucket::Meta`]
//! for replication metadata. All mutation happens inside [`Db::update`]
//! transactions; whole-store snapshots are exported as gzip'd tar streams of a
//! rocksdb checkpoint.
#![warn(missing_docs)]
#![warn(clippy::all)]

mod error;
mod snapshot;
mod tx;

use std::path::{Path, PathBuf};

use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, OptimisticTransactionDB, Options};
use tracing::{debug, error};

pub use error::{DbError, DbResult};
pub use snapshot::{ReadOnlyDb, SNAPSHOT_ID_KEY};
pub use tx::{MetaKey, PreCommitHook, Tx};

/// Logical buckets inside the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Bucket {
    /// Application entities
    Root,
    /// Replication metadata (applied index, membership, cluster id)
    Meta,
}

impl Bucket {
    /// Every bucket the store creates on open
    pub const ALL: [Self; 2] = [Self::Root, Self::Meta];

    /// Column family name backing this bucket
    pub const fn name(self) -> &'static str {
        match self {
            Self::Root => "root",
            Self::Meta => "meta",
        }
    }
}

/// Durable transactional store
pub struct Db {
    db: OptimisticTransactionDB,
    path: PathBuf,
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db").field("path", &self.path).finish()
    }
}

impl Db {
    /// Open (or create) the store at `path`
    pub fn open(path: impl AsRef<Path>) -> DbResult<Self> {
        let path = path.as_ref().to_path_buf();

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cfs = Bucket::ALL
            .iter()
            .map(|b| ColumnFamilyDescriptor::new(b.name(), Options::default()));

        let db = OptimisticTransactionDB::open_cf_descriptors(&opts, &path, cfs)?;
        debug!("opened store at {}", path.display());

        Ok(Self { db, path })
    }

    /// Filesystem location of the store
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn cf(&self, bucket: Bucket) -> DbResult<&ColumnFamily> {
        self.db
            .cf_handle(bucket.name())
            .ok_or(DbError::MissingBucket(bucket))
    }

    /// Run a read-only transaction. Nothing written through `tx` is committed.
    pub fn view<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&Tx<'_>) -> Result<T, E>,
        E: From<DbError>,
    {
        let tx = Tx::new(self, self.db.transaction());
        f(&tx)
    }

    /// Run a read/write transaction.
    ///
    /// The closure runs first, then every hook registered with
    /// [`Tx::on_pre_commit`] in registration order, then the commit. Any
    /// error drops the transaction without committing.
    pub fn update<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut Tx<'_>) -> Result<T, E>,
        E: From<DbError>,
    {
        let mut tx = Tx::new(self, self.db.transaction());
        let value = f(&mut tx)?;
        tx.commit()?;
        Ok(value)
    }

    /// Replace the store directory at `live` with `staging`.
    ///
    /// The previous contents are kept at `<live>.backup` for operator
    /// recovery; an older backup is discarded. Both paths must be closed.
    /// If the staging copy cannot be moved into place, the previous contents
    /// are moved back to `live` before the error is returned.
    pub fn install(live: &Path, staging: &Path) -> DbResult<PathBuf> {
        if !staging.is_dir() {
            return Err(DbError::InvalidSnapshot {
                path: staging.to_path_buf(),
                reason: "staging copy does not exist".to_string(),
            });
        }

        let backup = backup_path(live);
        if backup.exists() {
            std::fs::remove_dir_all(&backup)?;
        }
        let had_live = live.exists();
        if had_live {
            std::fs::rename(live, &backup)?;
        }

        if let Err(e) = std::fs::rename(staging, live) {
            if had_live {
                if let Err(restore) = std::fs::rename(&backup, live) {
                    error!(
                        "failed to move {} back to {}: {}",
                        backup.display(),
                        live.display(),
                        restore
                    );
                }
            }
            return Err(e.into());
        }

        Ok(backup)
    }

    /// Open the store at `path`, failing if it does not exist
    pub fn open_existing(path: impl AsRef<Path>) -> DbResult<Self> {
        let path = path.as_ref().to_path_buf();
        if !path.is_dir() {
            return Err(DbError::Missing(path));
        }

        let mut opts = Options::default();
        opts.create_if_missing(false);
        opts.create_missing_column_families(true);

        let cfs = Bucket::ALL
            .iter()
            .map(|b| ColumnFamilyDescriptor::new(b.name(), Options::default()));

        let db = OptimisticTransactionDB::open_cf_descriptors(&opts, &path, cfs)?;
        debug!("reopened store at {}", path.display());

        Ok(Self { db, path })
    }
}

/// Path of the pre-restore copy for the store at `live`
pub fn backup_path(live: &Path) -> PathBuf {
    sibling(live, "backup")
}

/// Path of the staging copy used while restoring the store at `live`
pub fn staging_path(live: &Path) -> PathBuf {
    sibling(live, "staging")
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}
