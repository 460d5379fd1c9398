//! Universal invariant 6 (migration round-trip) and scenario S6: every
//! registered migration's `up -> verify -> down -> verify` succeeds,
//! checksums are stable, and tampering with a migration's recorded source
//! is detected on the next `up()`.

use engram::storage::migrations::MigrationEngine;
use engram::storage::Storage;
use engram::types::{StorageConfig, StorageMode};

fn fresh_storage() -> Storage {
    Storage::open(StorageConfig { db_path: ":memory:".into(), storage_mode: StorageMode::Local }).unwrap()
}

#[test]
fn every_migration_round_trips() {
    // `Storage::open` already runs migrations to latest; roll everything
    // back to 0 first so this test drives the ladder itself.
    let storage = fresh_storage();
    let engine = MigrationEngine::new();
    let conn = storage.connection();

    engine.down(&conn, 0, false).unwrap();
    let status = engine.status(&conn).unwrap();
    assert_eq!(status.current_version, 0);

    engine.up(&conn, None, false).unwrap();
    let status = engine.status(&conn).unwrap();
    assert!(status.pending.is_empty());
    let top_version = status.current_version;
    assert!(top_version >= 1);

    engine.down(&conn, top_version - 1, false).unwrap();
    engine.up(&conn, None, false).unwrap();
    let status_again = engine.status(&conn).unwrap();
    assert_eq!(status_again.current_version, top_version);
}

#[test]
fn dry_run_up_does_not_change_status() {
    let storage = fresh_storage();
    let engine = MigrationEngine::new();
    let conn = storage.connection();

    engine.down(&conn, 0, false).unwrap();
    let before = engine.status(&conn).unwrap();

    engine.up(&conn, None, true).unwrap();
    let after = engine.status(&conn).unwrap();
    assert_eq!(before.current_version, after.current_version);
    assert_eq!(before.applied.len(), after.applied.len());
}

/// Scenario S6: start at version 1, apply migration 2, verify, roll back to
/// 1, verify, then refuse a hand-edited migration 2 with a checksum error.
#[test]
fn s6_version_2_round_trip_and_tamper_refusal() {
    let storage = fresh_storage();
    let engine = MigrationEngine::new();
    let conn = storage.connection();

    engine.down(&conn, 1, false).unwrap();
    assert_eq!(engine.status(&conn).unwrap().current_version, 1);

    engine.up(&conn, Some(2), false).unwrap();
    assert_eq!(engine.status(&conn).unwrap().current_version, 2);

    engine.down(&conn, 1, false).unwrap();
    assert_eq!(engine.status(&conn).unwrap().current_version, 1);

    engine.up(&conn, Some(2), false).unwrap();
    conn.execute("UPDATE schema_migrations SET checksum = 'tampered' WHERE version = 2", []).unwrap();

    let err = engine.up(&conn, None, false).unwrap_err();
    let message = err.to_string();
    assert!(message.contains("checksum mismatch"), "unexpected error: {message}");
}

#[test]
fn checksum_is_stable_across_calls() {
    // Public behavior proxy for checksum stability: applying the same
    // migration twice in a row (second one a no-op) never re-triggers a
    // mismatch, since the recorded checksum must equal the freshly computed
    // one both times.
    let storage = fresh_storage();
    let engine = MigrationEngine::new();
    let conn = storage.connection();
    engine.up(&conn, None, false).unwrap();
    engine.up(&conn, None, false).unwrap();
    assert!(engine.status(&conn).unwrap().pending.is_empty());
}
