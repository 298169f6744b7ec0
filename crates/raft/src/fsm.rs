//! Replicated state machine over the durable store.
//!
//! Every committed entry is applied in one store transaction that also stamps
//! the applied index, so side effects and the watermark never diverge. An
//! entry whose command rejects its input still consumes its index through a
//! separate transaction; the rejection travels back to the origin in the
//! [`ApplyResult`] instead of wedging replication.
//!
//! Snapshots are gzip'd tar exports of the whole store. Installing one goes
//! through a staging copy and only replaces the live store when the copy is
//! strictly newer than what has already been applied.

use std::fmt::Debug;
use std::io::{self, Cursor};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::{ArcSwap, ArcSwapOption};
use chrono::Utc;
use fabric_command::{ApiError, ChangeContext, CommandRegistry, MutationContext};
use fabric_db::{Bucket, Db, DbError, DbResult, ReadOnlyDb, Tx, staging_path};
use openraft::entry::RaftEntry;
use openraft::storage::{RaftStateMachine, Snapshot};
use openraft::{
    AnyError, Entry, EntryPayload, ErrorSubject, ErrorVerb, LogId, Membership, RaftSnapshotBuilder,
    SnapshotMeta, StorageError, StoredMembership,
};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::events::{ClusterEvent, EventHub};
use crate::types::{
    APPLIED_INDEX_KEY, AppliedLog, ClusterId, LastMembership, SERVERS_INDEX_KEY, SERVERS_PREFIX,
    Server, ServerRecord, ServersWithIndex,
};
use crate::{ApplyResult, CommandPayload, ControllerResult, Error, IndexTracker, TypeConfig};

#[derive(Debug, Clone)]
struct StoredSnapshot {
    meta: SnapshotMeta<TypeConfig>,
    data: Vec<u8>,
}

enum ApplyFailure {
    Rejected(ApiError),
    Store(DbError),
}

impl From<DbError> for ApplyFailure {
    fn from(e: DbError) -> Self {
        Self::Store(e)
    }
}

/// The controller's replicated state machine
pub struct Fsm {
    path: PathBuf,
    db: RwLock<Option<Db>>,
    commands: Arc<CommandRegistry>,
    applied: ArcSwapOption<LogId<TypeConfig>>,
    membership: ArcSwap<StoredMembership<TypeConfig>>,
    servers: ArcSwap<ServersWithIndex>,
    cluster_id: ArcSwapOption<String>,
    tracker: IndexTracker,
    events: Arc<EventHub>,
    current_snapshot: Mutex<Option<StoredSnapshot>>,
}

impl Debug for Fsm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fsm")
            .field("path", &self.path)
            .field("applied", &self.applied_index())
            .finish()
    }
}

impl Fsm {
    /// Open the store at `path` and prime the caches from its metadata
    pub(crate) fn open(
        path: impl AsRef<Path>,
        commands: Arc<CommandRegistry>,
        events: Arc<EventHub>,
    ) -> ControllerResult<Arc<Self>> {
        let path = path.as_ref().to_path_buf();

        let staging = staging_path(&path);
        if staging.exists() {
            warn!("removing leftover staging copy {}", staging.display());
            std::fs::remove_dir_all(&staging).map_err(DbError::from)?;
        }

        let db = Db::open(&path)?;
        let fsm = Arc::new(Self {
            path,
            db: RwLock::new(None),
            commands,
            applied: ArcSwapOption::empty(),
            membership: ArcSwap::from_pointee(StoredMembership::default()),
            servers: ArcSwap::from_pointee(ServersWithIndex::default()),
            cluster_id: ArcSwapOption::empty(),
            tracker: IndexTracker::default(),
            events,
            current_snapshot: Mutex::new(None),
        });

        fsm.reload(&db)?;
        *fsm.db.write() = Some(db);

        info!(
            "state machine opened at {} with applied index {:?}",
            fsm.path.display(),
            fsm.applied_index()
        );
        Ok(fsm)
    }

    /// Index of the last applied entry
    pub fn applied_index(&self) -> Option<u64> {
        self.applied.load_full().map(|log_id| log_id.index)
    }

    /// Cluster configuration as of the last applied configuration entry
    pub fn servers(&self) -> Arc<ServersWithIndex> {
        self.servers.load_full()
    }

    /// Id of the logical cluster, once assigned
    pub fn cluster_id(&self) -> Option<String> {
        self.cluster_id.load_full().map(|id| id.as_ref().clone())
    }

    /// Applied index watermark
    pub fn tracker(&self) -> &IndexTracker {
        &self.tracker
    }

    /// Run a read transaction against the current store
    pub fn view<T>(&self, f: impl FnOnce(&Tx<'_>) -> ControllerResult<T>) -> ControllerResult<T> {
        let guard = self.db.read();
        let db = guard.as_ref().ok_or(Error::Shutdown)?;
        db.view(f)
    }

    fn reload(&self, db: &Db) -> ControllerResult<()> {
        let (applied, membership, cluster_id, servers) = db.view(|tx| {
            Ok::<_, DbError>((
                tx.get_meta::<AppliedLog>()?,
                tx.get_meta::<LastMembership>()?.unwrap_or_default(),
                tx.get_meta::<ClusterId>()?,
                load_servers(tx)?,
            ))
        })?;

        if let Some(log_id) = &applied {
            self.tracker.advance(log_id.index);
        }
        self.applied.store(applied.map(Arc::new));
        self.membership.store(Arc::new(membership));
        self.cluster_id.store(cluster_id.map(Arc::new));
        self.servers.store(Arc::new(servers));
        Ok(())
    }

    /// Reopen the live store after a failed install. The caches are reloaded
    /// from whatever is on disk; if nothing usable is there the store stays
    /// closed.
    fn recover_store(&self, guard: &mut Option<Db>) {
        let reopened = Db::open_existing(&self.path)
            .map_err(Error::from)
            .and_then(|db| {
                self.reload(&db)?;
                Ok(db)
            });

        match reopened {
            Ok(db) => {
                info!("reopened store at {} after failed restore", self.path.display());
                *guard = Some(db);
            }
            Err(e) => self.store_lost(&e),
        }
    }

    fn store_lost(&self, e: &impl std::fmt::Display) {
        error!(
            "store at {} cannot be reopened, restart required: {}",
            self.path.display(),
            e
        );
        self.events.emit(ClusterEvent::RestartRequired {
            reason: format!("store unavailable after failed restore: {e}"),
        });
    }

    fn is_applied(&self, index: u64) -> bool {
        self.applied
            .load_full()
            .is_some_and(|applied| index <= applied.index)
    }

    fn apply_entries<I>(&self, entries: I) -> Result<Vec<ApplyResult>, StorageError<TypeConfig>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>>,
    {
        let guard = self.db.read();
        let db = guard.as_ref().ok_or_else(store_closed)?;

        let mut results = Vec::new();
        for entry in entries {
            results.push(self.apply_entry(db, entry)?);
        }

        if self.cluster_id.load().is_none() {
            let cluster_id = db
                .view(|tx| tx.get_meta::<ClusterId>())
                .map_err(|e| StorageError::new(ErrorSubject::StateMachine, ErrorVerb::Read, AnyError::new(&e)))?;
            if let Some(cluster_id) = cluster_id {
                info!("cluster id is {}", cluster_id);
                self.cluster_id.store(Some(Arc::new(cluster_id)));
            }
        }

        Ok(results)
    }

    fn apply_entry(
        &self,
        db: &Db,
        entry: Entry<TypeConfig>,
    ) -> Result<ApplyResult, StorageError<TypeConfig>> {
        let log_id = entry.log_id();
        let index = log_id.index;

        if self.is_applied(index) {
            debug!("skipping already applied entry {}", index);
            return Ok(ApplyResult::applied(index));
        }

        let result = match entry.payload {
            EntryPayload::Blank => {
                db.update(|tx| stamp(tx, &log_id))
                    .map_err(|e| apply_err(&log_id, e))?;
                ApplyResult::applied(index)
            }
            EntryPayload::Normal(payload) => self.apply_command(db, &log_id, &payload)?,
            EntryPayload::Membership(membership) => {
                self.store_configuration(db, &log_id, membership)?;
                ApplyResult::applied(index)
            }
        };

        self.applied.store(Some(Arc::new(log_id)));
        self.tracker.advance(index);
        Ok(result)
    }

    fn apply_command(
        &self,
        db: &Db,
        log_id: &LogId<TypeConfig>,
        payload: &CommandPayload,
    ) -> Result<ApplyResult, StorageError<TypeConfig>> {
        let index = log_id.index;

        let command = match self.commands.decode(&payload.data) {
            Ok(command) => command,
            Err(e) => {
                warn!("skipping undecodable command at index {}: {}", index, e);
                db.update(|tx| stamp(tx, log_id))
                    .map_err(|e| apply_err(log_id, e))?;
                let error = ApiError::internal(format!("failed to decode command: {e}"));
                return Ok(ApplyResult::rejected(index, error.to_payload()));
            }
        };

        let change = ChangeContext::new(index, command.attribution());
        let outcome = db.update(|tx| {
            let stamped = log_id.clone();
            tx.on_pre_commit(move |tx| stamp(tx, &stamped));

            let mut ctx = MutationContext::new(tx, change);
            command.apply(&mut ctx).map_err(ApplyFailure::Rejected)
        });

        match outcome {
            Ok(()) => Ok(ApplyResult::applied(index)),
            Err(ApplyFailure::Rejected(error)) => {
                debug!("command at index {} rejected: {}", index, error);
                // the index is consumed even though the command had no effect
                db.update(|tx| stamp(tx, log_id))
                    .map_err(|e| apply_err(log_id, e))?;
                Ok(ApplyResult::rejected(index, error.to_payload()))
            }
            Err(ApplyFailure::Store(e)) => Err(apply_err(log_id, e)),
        }
    }

    fn store_configuration(
        &self,
        db: &Db,
        log_id: &LogId<TypeConfig>,
        membership: Membership<TypeConfig>,
    ) -> Result<(), StorageError<TypeConfig>> {
        let stored = StoredMembership::new(Some(log_id.clone()), membership);
        let servers = ServersWithIndex::from_membership(&stored);

        let changed = db
            .update(|tx| {
                stamp(tx, log_id)?;
                tx.put_meta::<LastMembership>(&stored)?;

                let current = tx.get_u64(Bucket::Meta, SERVERS_INDEX_KEY)?;
                if current.is_some_and(|current| current >= servers.index) {
                    return Ok(false);
                }
                store_servers(tx, &servers)?;
                Ok::<_, DbError>(true)
            })
            .map_err(|e| apply_err(log_id, e))?;

        self.membership.store(Arc::new(stored));
        if changed {
            info!(
                "cluster configuration at index {}: {:?}",
                servers.index, servers.servers
            );
            self.servers.store(Arc::new(servers.clone()));
            self.events.emit(ClusterEvent::MembersChanged {
                index: servers.index,
                servers,
            });
        }
        Ok(())
    }

    fn build(&self) -> Result<Snapshot<TypeConfig>, StorageError<TypeConfig>> {
        let guard = self.db.read();
        let db = guard.as_ref().ok_or_else(store_closed)?;

        let (data, (last_log_id, last_membership, snapshot_id)) = db
            .export(Vec::new(), |tx| {
                let last_log_id = tx.get_meta::<AppliedLog>()?;
                let last_membership = tx.get_meta::<LastMembership>()?.unwrap_or_default();
                let snapshot_id = format!(
                    "snapshot-{}-{}",
                    last_log_id.as_ref().map_or(0, |id| id.index),
                    Utc::now().timestamp_millis()
                );
                Ok((snapshot_id.clone(), (last_log_id, last_membership, snapshot_id)))
            })
            .map_err(|e| StorageError::write_snapshot(None, &e))?;
        drop(guard);

        let meta = SnapshotMeta {
            last_log_id,
            last_membership,
            snapshot_id,
        };

        info!(
            "built snapshot {} at {:?} ({} bytes)",
            meta.snapshot_id,
            meta.last_log_id.as_ref().map(|id| id.index),
            data.len()
        );

        *self.current_snapshot.lock() = Some(StoredSnapshot {
            meta: meta.clone(),
            data: data.clone(),
        });

        Ok(Snapshot {
            meta,
            snapshot: Cursor::new(data),
        })
    }

    fn install(
        &self,
        meta: &SnapshotMeta<TypeConfig>,
        data: Vec<u8>,
    ) -> Result<(), StorageError<TypeConfig>> {
        let staging = staging_path(&self.path);
        Db::unpack(Cursor::new(&data), &staging)
            .map_err(|e| StorageError::read_snapshot(None, &e))?;

        let (candidate, snapshot_id) = {
            let copy = ReadOnlyDb::open(&staging).map_err(|e| StorageError::read_snapshot(None, &e))?;
            let candidate = copy
                .get_meta::<AppliedLog>()
                .map_err(|e| StorageError::read_snapshot(None, &e))?;
            let snapshot_id = copy
                .snapshot_id()
                .map_err(|e| StorageError::read_snapshot(None, &e))?
                .unwrap_or_else(|| meta.snapshot_id.clone());
            (candidate, snapshot_id)
        };

        let current = self.applied_index();
        let newer = match (candidate.as_ref(), current) {
            (Some(candidate), Some(current)) => candidate.index > current,
            (Some(_), None) => true,
            (None, _) => false,
        };

        if !newer {
            info!(
                "ignoring snapshot {} at {:?}, already applied {:?}",
                snapshot_id,
                candidate.as_ref().map(|id| id.index),
                current
            );
            if let Err(e) = std::fs::remove_dir_all(&staging) {
                warn!("failed to remove staging copy {}: {}", staging.display(), e);
            }
            return Ok(());
        }

        let previous_servers = self.servers().index;
        {
            let mut guard = self.db.write();
            // close the live store before its directory moves
            guard.take();

            let db = match Db::install(&self.path, &staging) {
                Ok(backup) => {
                    debug!("previous store kept at {}", backup.display());
                    Db::open_existing(&self.path)
                }
                Err(e) => {
                    warn!("failed to install snapshot {}: {}", snapshot_id, e);
                    self.recover_store(&mut guard);
                    return Err(StorageError::write_snapshot(None, &e));
                }
            };
            let db = match db {
                Ok(db) => db,
                Err(e) => {
                    self.store_lost(&e);
                    return Err(StorageError::write_snapshot(None, &e));
                }
            };

            if let Err(e) = self.reload(&db) {
                self.store_lost(&e);
                return Err(StorageError::new(
                    ErrorSubject::StateMachine,
                    ErrorVerb::Read,
                    AnyError::new(&e),
                ));
            }
            *guard = Some(db);
        }

        *self.current_snapshot.lock() = Some(StoredSnapshot {
            meta: meta.clone(),
            data,
        });

        let index = self.applied_index().unwrap_or_default();
        info!("restored snapshot {} at index {}", snapshot_id, index);
        self.events.emit(ClusterEvent::StateRestored {
            index,
            snapshot_id: snapshot_id.clone(),
        });

        let servers = self.servers();
        if servers.index != previous_servers {
            self.events.emit(ClusterEvent::MembersChanged {
                index: servers.index,
                servers: servers.as_ref().clone(),
            });
        }

        if current.is_some() {
            warn!(
                "snapshot {} replaced state that was already applied, restart required",
                snapshot_id
            );
            self.events.emit(ClusterEvent::RestartRequired {
                reason: format!("state restored from snapshot {snapshot_id}"),
            });
        }
        Ok(())
    }
}

impl RaftStateMachine<TypeConfig> for Arc<Fsm> {
    type SnapshotBuilder = Self;

    async fn applied_state(
        &mut self,
    ) -> Result<(Option<LogId<TypeConfig>>, StoredMembership<TypeConfig>), StorageError<TypeConfig>>
    {
        let applied = self.applied.load_full().map(|log_id| (*log_id).clone());
        let membership = self.membership.load_full().as_ref().clone();
        Ok((applied, membership))
    }

    async fn apply<I>(&mut self, entries: I) -> Result<Vec<ApplyResult>, StorageError<TypeConfig>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + Send,
        I::IntoIter: Send,
    {
        self.apply_entries(entries)
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        self.clone()
    }

    async fn begin_receiving_snapshot(
        &mut self,
    ) -> Result<Cursor<Vec<u8>>, StorageError<TypeConfig>> {
        Ok(Cursor::new(Vec::new()))
    }

    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta<TypeConfig>,
        snapshot: Cursor<Vec<u8>>,
    ) -> Result<(), StorageError<TypeConfig>> {
        self.install(meta, snapshot.into_inner())
    }

    async fn get_current_snapshot(
        &mut self,
    ) -> Result<Option<Snapshot<TypeConfig>>, StorageError<TypeConfig>> {
        let cached = self.current_snapshot.lock().clone();
        match cached {
            Some(stored) => Ok(Some(Snapshot {
                meta: stored.meta,
                snapshot: Cursor::new(stored.data),
            })),
            None if self.applied_index().is_some() => self.build().map(Some),
            None => Ok(None),
        }
    }
}

impl RaftSnapshotBuilder<TypeConfig> for Arc<Fsm> {
    async fn build_snapshot(&mut self) -> Result<Snapshot<TypeConfig>, StorageError<TypeConfig>> {
        self.build()
    }
}

fn stamp(tx: &Tx<'_>, log_id: &LogId<TypeConfig>) -> DbResult<()> {
    tx.put_u64(Bucket::Meta, APPLIED_INDEX_KEY, log_id.index)?;
    tx.put_meta::<AppliedLog>(log_id)
}

fn store_servers(tx: &Tx<'_>, servers: &ServersWithIndex) -> DbResult<()> {
    for (key, _) in tx.scan_prefix(Bucket::Meta, SERVERS_PREFIX)? {
        tx.delete(Bucket::Meta, key)?;
    }
    for server in &servers.servers {
        let record = ServerRecord {
            address: server.address.clone(),
            is_voter: server.is_voter,
        };
        tx.put_json(Bucket::Meta, &format!("{SERVERS_PREFIX}{}", server.id), &record)?;
    }
    tx.put_u64(Bucket::Meta, SERVERS_INDEX_KEY, servers.index)
}

fn load_servers(tx: &Tx<'_>) -> DbResult<ServersWithIndex> {
    let Some(index) = tx.get_u64(Bucket::Meta, SERVERS_INDEX_KEY)? else {
        return Ok(ServersWithIndex::default());
    };

    let mut servers = Vec::new();
    for (key, value) in tx.scan_prefix(Bucket::Meta, SERVERS_PREFIX)? {
        let key = String::from_utf8_lossy(&key).into_owned();
        let record: ServerRecord =
            serde_json::from_slice(&value).map_err(|source| DbError::Metadata {
                key: key.clone(),
                source,
            })?;
        servers.push(Server {
            id: key[SERVERS_PREFIX.len()..].to_string(),
            address: record.address,
            is_voter: record.is_voter,
        });
    }

    Ok(ServersWithIndex { servers, index })
}

fn apply_err(log_id: &LogId<TypeConfig>, e: DbError) -> StorageError<TypeConfig> {
    StorageError::new(
        ErrorSubject::Apply(log_id.clone()),
        ErrorVerb::Write,
        AnyError::new(&e),
    )
}

fn store_closed() -> StorageError<TypeConfig> {
    StorageError::new(
        ErrorSubject::StateMachine,
        ErrorVerb::Read,
        AnyError::new(&io::Error::other("state machine store is closed")),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use fabric_command::{Command, CommandType, CodecResult, TypedCommand, cbor_body};
    use fabric_db::backup_path;
    use serde::{Deserialize, Serialize};
    use tempfile::TempDir;
    use tokio::sync::broadcast::error::TryRecvError;

    use crate::types::test_log_id;

    #[derive(Debug, Serialize, Deserialize)]
    struct PutValue {
        key: String,
        value: String,
    }

    impl Command for PutValue {
        fn command_type(&self) -> CommandType {
            Self::TYPE
        }

        fn encode_body(&self) -> CodecResult<Vec<u8>> {
            cbor_body(self)
        }

        fn apply(&self, ctx: &mut MutationContext<'_, '_>) -> Result<(), ApiError> {
            if self.value.is_empty() {
                return Err(ApiError::field("value", "", "must not be empty"));
            }
            let index = ctx.change().raft_index;
            ctx.tx().put(Bucket::Root, &self.key, &self.value)?;
            ctx.tx().put_u64(Bucket::Root, &format!("{}.index", self.key), index)?;
            Ok(())
        }
    }

    impl TypedCommand for PutValue {
        const TYPE: CommandType = 100;
    }

    fn open(dir: &Path) -> (Arc<Fsm>, Arc<EventHub>) {
        let mut commands = CommandRegistry::new();
        commands.register::<PutValue>().unwrap();

        let events = Arc::new(EventHub::new());
        let fsm = Fsm::open(dir.join("ctrl.db"), Arc::new(commands), events.clone()).unwrap();
        (fsm, events)
    }

    fn put(index: u64, key: &str, value: &str) -> Entry<TypeConfig> {
        let command = PutValue {
            key: key.to_string(),
            value: value.to_string(),
        };
        Entry {
            log_id: test_log_id(1, index),
            payload: EntryPayload::Normal(CommandPayload::new(command.encode().unwrap())),
        }
    }

    fn read(fsm: &Fsm, key: &str) -> Option<String> {
        fsm.view(|tx| {
            Ok(tx
                .get(Bucket::Root, key)?
                .map(|v| String::from_utf8(v).unwrap()))
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_replay_after_restart_is_ignored() {
        let dir = TempDir::new().unwrap();

        {
            let (mut fsm, _events) = open(dir.path());
            let results = fsm
                .apply(vec![put(1, "a", "one"), put(2, "b", "two"), put(3, "a", "three")])
                .await
                .unwrap();
            assert!(results.iter().all(|r| r.error.is_none()));
            assert_eq!(fsm.applied_index(), Some(3));
            assert_eq!(fsm.tracker().current(), Some(3));
        }

        let (mut fsm, _events) = open(dir.path());
        assert_eq!(fsm.applied_index(), Some(3));
        assert_eq!(fsm.tracker().current(), Some(3));

        // redelivered entries must not overwrite later writes
        fsm.apply(vec![put(1, "a", "stale"), put(2, "b", "stale")])
            .await
            .unwrap();
        assert_eq!(read(&fsm, "a").as_deref(), Some("three"));
        assert_eq!(read(&fsm, "b").as_deref(), Some("two"));

        fsm.apply(vec![put(4, "b", "four")]).await.unwrap();
        assert_eq!(read(&fsm, "b").as_deref(), Some("four"));
        let index = fsm
            .view(|tx| Ok(tx.get_u64(Bucket::Root, "b.index")?))
            .unwrap();
        assert_eq!(index, Some(4));
    }

    #[tokio::test]
    async fn test_rejected_command_consumes_index() {
        let dir = TempDir::new().unwrap();
        let (mut fsm, _events) = open(dir.path());

        let results = fsm
            .apply(vec![put(1, "a", ""), put(2, "b", "two")])
            .await
            .unwrap();

        let error = results[0].error.as_ref().unwrap();
        assert_eq!(error.status, 400);
        assert_eq!(error.cause_type.as_deref(), Some("FieldError"));
        assert_eq!(results[1].error, None);

        assert_eq!(read(&fsm, "a"), None);
        assert_eq!(read(&fsm, "b").as_deref(), Some("two"));
        assert_eq!(fsm.applied_index(), Some(2));
    }

    #[tokio::test]
    async fn test_undecodable_command_is_skipped() {
        let dir = TempDir::new().unwrap();
        let (mut fsm, _events) = open(dir.path());

        let garbage = Entry {
            log_id: test_log_id(1, 1),
            payload: EntryPayload::Normal(CommandPayload::new(vec![0, 0, 0xff, 0xff, 1])),
        };
        let results = fsm.apply(vec![garbage, put(2, "a", "one")]).await.unwrap();

        assert_eq!(results[0].error.as_ref().map(|e| e.status), Some(500));
        assert_eq!(results[1].error, None);
        assert_eq!(fsm.applied_index(), Some(2));
    }

    #[tokio::test]
    async fn test_restore_only_moves_forward() {
        let source_dir = TempDir::new().unwrap();
        let (mut source, _source_events) = open(source_dir.path());

        source.apply(vec![put(1, "a", "one"), put(2, "b", "two")]).await.unwrap();
        let older = source.build_snapshot().await.unwrap();
        source.apply(vec![put(3, "c", "three"), put(4, "a", "four")]).await.unwrap();
        let newer = source.build_snapshot().await.unwrap();
        assert_eq!(newer.meta.last_log_id.as_ref().map(|id| id.index), Some(4));

        let dir = TempDir::new().unwrap();
        let (mut fsm, events) = open(dir.path());
        let mut rx = events.subscribe();

        fsm.install_snapshot(&newer.meta, newer.snapshot).await.unwrap();
        assert_eq!(fsm.applied_index(), Some(4));
        assert_eq!(fsm.tracker().current(), Some(4));
        assert_eq!(read(&fsm, "a").as_deref(), Some("four"));

        match rx.try_recv().unwrap() {
            ClusterEvent::StateRestored { index, snapshot_id } => {
                assert_eq!(index, 4);
                assert_eq!(snapshot_id, newer.meta.snapshot_id);
            }
            other => panic!("unexpected event {other:?}"),
        }
        // the member was empty, so no restart is needed
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));

        fsm.install_snapshot(&older.meta, older.snapshot).await.unwrap();
        assert_eq!(fsm.applied_index(), Some(4));
        assert_eq!(read(&fsm, "a").as_deref(), Some("four"));
        assert_eq!(read(&fsm, "c").as_deref(), Some("three"));
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));

        let current = fsm.get_current_snapshot().await.unwrap().unwrap();
        assert_eq!(current.meta.snapshot_id, newer.meta.snapshot_id);
    }

    #[tokio::test]
    async fn test_restore_over_applied_state_requires_restart() {
        let source_dir = TempDir::new().unwrap();
        let (mut source, _source_events) = open(source_dir.path());
        source.apply(vec![put(1, "a", "one"), put(2, "b", "two")]).await.unwrap();
        let snapshot = source.build_snapshot().await.unwrap();

        let dir = TempDir::new().unwrap();
        let (mut fsm, events) = open(dir.path());
        fsm.apply(vec![put(1, "local", "only")]).await.unwrap();

        let mut rx = events.subscribe();
        fsm.install_snapshot(&snapshot.meta, snapshot.snapshot).await.unwrap();

        assert_eq!(fsm.applied_index(), Some(2));
        assert_eq!(read(&fsm, "local"), None);
        assert!(backup_path(&dir.path().join("ctrl.db")).is_dir());

        assert!(matches!(rx.try_recv().unwrap(), ClusterEvent::StateRestored { index: 2, .. }));
        assert!(matches!(rx.try_recv().unwrap(), ClusterEvent::RestartRequired { .. }));
    }

    #[tokio::test]
    async fn test_restore_reports_new_members() {
        let source_dir = TempDir::new().unwrap();
        let (mut source, _source_events) = open(source_dir.path());
        source.apply(vec![put(1, "a", "one")]).await.unwrap();
        let servers = ServersWithIndex {
            servers: vec![Server {
                id: "ctrl-a".to_string(),
                address: "ctrl-a:6262".to_string(),
                is_voter: true,
            }],
            index: 1,
        };
        source
            .db
            .read()
            .as_ref()
            .unwrap()
            .update(|tx| store_servers(tx, &servers))
            .unwrap();
        let snapshot = source.build_snapshot().await.unwrap();

        let dir = TempDir::new().unwrap();
        let (mut fsm, events) = open(dir.path());
        let mut rx = events.subscribe();
        fsm.install_snapshot(&snapshot.meta, snapshot.snapshot).await.unwrap();

        assert!(matches!(rx.try_recv().unwrap(), ClusterEvent::StateRestored { index: 1, .. }));
        match rx.try_recv().unwrap() {
            ClusterEvent::MembersChanged { index, servers } => {
                assert_eq!(index, 1);
                assert_eq!(servers.get("ctrl-a").map(|s| s.address.as_str()), Some("ctrl-a:6262"));
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(fsm.servers().servers.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_install_reopens_previous_store() {
        let dir = TempDir::new().unwrap();
        let (mut fsm, events) = open(dir.path());
        fsm.apply(vec![put(1, "a", "one")]).await.unwrap();
        let mut rx = events.subscribe();

        {
            let mut guard = fsm.db.write();
            guard.take();
            fsm.recover_store(&mut guard);
            assert!(guard.is_some());
        }

        assert_eq!(read(&fsm, "a").as_deref(), Some("one"));
        assert_eq!(fsm.applied_index(), Some(1));
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn test_missing_store_is_not_recreated() {
        let dir = TempDir::new().unwrap();
        let (mut fsm, events) = open(dir.path());
        fsm.apply(vec![put(1, "a", "one")]).await.unwrap();
        let mut rx = events.subscribe();

        let live = dir.path().join("ctrl.db");
        {
            let mut guard = fsm.db.write();
            guard.take();
            std::fs::remove_dir_all(&live).unwrap();
            fsm.recover_store(&mut guard);
            assert!(guard.is_none());
        }

        assert!(!live.exists());
        assert!(matches!(fsm.view(|_| Ok(())), Err(Error::Shutdown)));
        assert!(matches!(rx.try_recv().unwrap(), ClusterEvent::RestartRequired { .. }));
    }
}
