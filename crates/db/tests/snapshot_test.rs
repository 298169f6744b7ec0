use std::io::Cursor;

use fabric_db::{Bucket, Db, MetaKey, ReadOnlyDb, backup_path, staging_path};
use tempfile::TempDir;
use tracing_test::traced_test;

struct AppliedIndex;

impl MetaKey for AppliedIndex {
    const KEY: &'static str = "applied";
    type Value = u64;
}

#[test]
#[traced_test]
fn test_export_unpack_and_inspect() {
    let dir = TempDir::new().unwrap();
    let db = Db::open(dir.path().join("ctrl.db")).unwrap();

    db.update(|tx| {
        tx.put(Bucket::Root, "services/web", b"{\"name\":\"web\"}")?;
        tx.put_meta::<AppliedIndex>(&7)
    })
    .unwrap();

    let (archive, applied) = db
        .export(Cursor::new(Vec::new()), |tx| {
            let applied = tx.get_meta::<AppliedIndex>()?.unwrap_or_default();
            Ok((format!("1-{applied}-snap"), applied))
        })
        .unwrap();
    assert_eq!(applied, 7);
    assert!(!archive.get_ref().is_empty());

    let staging = dir.path().join("incoming");
    Db::unpack(Cursor::new(archive.into_inner()), &staging).unwrap();

    let copy = ReadOnlyDb::open(&staging).unwrap();
    assert_eq!(copy.snapshot_id().unwrap().as_deref(), Some("1-7-snap"));
    assert_eq!(copy.get_meta::<AppliedIndex>().unwrap(), Some(7));

    // the live store is not stamped by an export
    let live_id = db
        .view(|tx| tx.get(Bucket::Meta, fabric_db::SNAPSHOT_ID_KEY))
        .unwrap();
    assert_eq!(live_id, None);
}

#[test]
fn test_install_keeps_backup() {
    let dir = TempDir::new().unwrap();
    let live = dir.path().join("ctrl.db");

    let archive = {
        let source = Db::open(dir.path().join("source.db")).unwrap();
        source
            .update(|tx| tx.put(Bucket::Root, "k", b"from-snapshot"))
            .unwrap();
        let (archive, ()) = source
            .export(Vec::new(), |_| Ok(("snap".to_string(), ())))
            .unwrap();
        archive
    };

    {
        let db = Db::open(&live).unwrap();
        db.update(|tx| tx.put(Bucket::Root, "k", b"original"))
            .unwrap();
    }

    let staging = staging_path(&live);
    Db::unpack(archive.as_slice(), &staging).unwrap();
    let backup = Db::install(&live, &staging).unwrap();
    assert_eq!(backup, backup_path(&live));
    assert!(!staging.exists());

    let db = Db::open(&live).unwrap();
    let value = db.view(|tx| tx.get(Bucket::Root, "k")).unwrap();
    assert_eq!(value.as_deref(), Some(&b"from-snapshot"[..]));

    let old = Db::open(&backup).unwrap();
    let value = old.view(|tx| tx.get(Bucket::Root, "k")).unwrap();
    assert_eq!(value.as_deref(), Some(&b"original"[..]));
}

#[test]
fn test_install_requires_staging_copy() {
    let dir = TempDir::new().unwrap();
    let live = dir.path().join("ctrl.db");
    assert!(Db::install(&live, &staging_path(&live)).is_err());
}

#[test]
#[traced_test]
fn test_failed_install_puts_previous_store_back() {
    let dir = TempDir::new().unwrap();

    // a directory cannot be moved inside itself, so the second rename fails
    let staging = dir.path().join("incoming");
    let live = staging.join("nested").join("ctrl.db");
    std::fs::create_dir_all(live.parent().unwrap()).unwrap();
    {
        let db = Db::open(&live).unwrap();
        db.update(|tx| tx.put(Bucket::Root, "k", b"original"))
            .unwrap();
    }

    assert!(Db::install(&live, &staging).is_err());
    assert!(!backup_path(&live).exists());

    let db = Db::open_existing(&live).unwrap();
    let value = db.view(|tx| tx.get(Bucket::Root, "k")).unwrap();
    assert_eq!(value.as_deref(), Some(&b"original"[..]));
}

#[test]
fn test_open_existing_does_not_create() {
    let dir = TempDir::new().unwrap();
    let live = dir.path().join("ctrl.db");

    assert!(matches!(
        Db::open_existing(&live),
        Err(fabric_db::DbError::Missing(_))
    ));
    assert!(!live.exists());
}
