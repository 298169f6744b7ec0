//! Whole-store snapshot export and inspection

use std::io::{Read, Write};
use std::path::Path;

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use rocksdb::checkpoint::Checkpoint;
use rocksdb::{DB, Options};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::tx::{MetaKey, Tx};
use crate::{Bucket, Db, DbError, DbResult, sibling};

/// Metadata key holding the id of the snapshot a store copy was exported as
pub const SNAPSHOT_ID_KEY: &str = "snapshot_id";

impl Db {
    /// Write the entire store to `writer` as a gzip'd tar archive.
    ///
    /// The archive is built from a rocksdb checkpoint, so concurrent writers
    /// are only held up for the duration of the checkpoint itself. `describe`
    /// runs against the checkpoint copy and returns the snapshot id to stamp
    /// under [`SNAPSHOT_ID_KEY`] together with anything else the caller wants
    /// to know about the exact state that was captured.
    pub fn export<W, T, F>(&self, writer: W, describe: F) -> DbResult<(W, T)>
    where
        W: Write,
        F: FnOnce(&Tx<'_>) -> DbResult<(String, T)>,
    {
        let checkpoint_dir = sibling(
            &self.path,
            &format!("checkpoint-{}", Uuid::new_v4().simple()),
        );

        let result = self.export_checkpoint(&checkpoint_dir, writer, describe);

        if checkpoint_dir.exists() {
            if let Err(e) = std::fs::remove_dir_all(&checkpoint_dir) {
                warn!(
                    "failed to remove checkpoint {}: {}",
                    checkpoint_dir.display(),
                    e
                );
            }
        }

        result
    }

    fn export_checkpoint<W, T, F>(
        &self,
        checkpoint_dir: &Path,
        writer: W,
        describe: F,
    ) -> DbResult<(W, T)>
    where
        W: Write,
        F: FnOnce(&Tx<'_>) -> DbResult<(String, T)>,
    {
        Checkpoint::new(&self.db)?.create_checkpoint(checkpoint_dir)?;

        let (snapshot_id, described) = {
            let copy = Db::open(checkpoint_dir)?;
            copy.update(|tx| {
                let (snapshot_id, described) = describe(tx)?;
                tx.put(Bucket::Meta, SNAPSHOT_ID_KEY, &snapshot_id)?;
                Ok::<_, DbError>((snapshot_id, described))
            })?
        };

        let mut archive = tar::Builder::new(GzEncoder::new(writer, Compression::default()));
        archive.append_dir_all(".", checkpoint_dir)?;
        let writer = archive.into_inner()?.finish()?;

        debug!("exported store {} as {}", self.path.display(), snapshot_id);
        Ok((writer, described))
    }

    /// Unpack an archive produced by [`Db::export`] into `dir`, replacing
    /// anything already there.
    pub fn unpack<R: Read>(reader: R, dir: &Path) -> DbResult<()> {
        if dir.exists() {
            std::fs::remove_dir_all(dir)?;
        }
        std::fs::create_dir_all(dir)?;

        tar::Archive::new(GzDecoder::new(reader)).unpack(dir)?;
        Ok(())
    }
}

/// Read-only handle on an unpacked store copy
pub struct ReadOnlyDb {
    db: DB,
}

impl ReadOnlyDb {
    /// Open the store copy at `path` without the ability to write to it
    pub fn open(path: &Path) -> DbResult<Self> {
        if !path.is_dir() {
            return Err(DbError::InvalidSnapshot {
                path: path.to_path_buf(),
                reason: "not a directory".to_string(),
            });
        }

        let db = DB::open_cf_for_read_only(
            &Options::default(),
            path,
            Bucket::ALL.iter().map(|b| b.name()),
            false,
        )?;
        Ok(Self { db })
    }

    fn get(&self, key: &str) -> DbResult<Option<Vec<u8>>> {
        let cf = self
            .db
            .cf_handle(Bucket::Meta.name())
            .ok_or(DbError::MissingBucket(Bucket::Meta))?;
        Ok(self.db.get_cf(cf, key)?)
    }

    /// Id stamped into the copy when it was exported
    pub fn snapshot_id(&self) -> DbResult<Option<String>> {
        Ok(self
            .get(SNAPSHOT_ID_KEY)?
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
    }

    /// Read a typed metadata value
    pub fn get_meta<M: MetaKey>(&self) -> DbResult<Option<M::Value>> {
        let Some(bytes) = self.get(M::KEY)? else {
            return Ok(None);
        };

        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| DbError::Metadata {
                key: M::KEY.to_string(),
                source,
            })
    }
}
