//! The Migration Engine (C2): versioned, transactional, checksummed,
//! reversible schema changes with a tamper-evident history.
//!
//! Restructured from the teacher's flat `migrate_v1()..migrate_v11()` ladder
//! (gated by reading a `schema_version` table) into a `Migration` trait-object
//! list, per SPEC_FULL.md 4.2. The teacher's own pattern of computing a
//! SHA-256 in Rust rather than in SQL (its `migrate_v6` backfill) is the
//! grounding for `checksum()` below.

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::types::{MigrationRecord, MigrationStatus};

/// A single versioned schema change.
pub trait Migration: Send + Sync {
    fn version(&self) -> i32;
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
    fn up(&self, conn: &Connection) -> Result<()>;
    fn down(&self, conn: &Connection) -> Result<()>;
    /// Checks observable schema state (tables/columns/indices). Returning
    /// `Ok(false)` (not an error) means "ran, but verification failed".
    fn verify(&self, conn: &Connection) -> Result<bool>;
}

fn checksum(version: i32, name: &str, description: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{version}:{name}:{description}"));
    hex::encode(hasher.finalize())
}

fn table_exists(conn: &Connection, name: &str) -> Result<bool> {
    Ok(conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type IN ('table','view') AND name = ?",
            [name],
            |r| r.get::<_, i64>(0),
        )
        .optional()?
        .is_some())
}

fn index_exists(conn: &Connection, name: &str) -> Result<bool> {
    Ok(conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'index' AND name = ?",
            [name],
            |r| r.get::<_, i64>(0),
        )
        .optional()?
        .is_some())
}

// ---------------------------------------------------------------------
// Migration 1: base schema
// ---------------------------------------------------------------------

struct InitialSchema;

impl Migration for InitialSchema {
    fn version(&self) -> i32 {
        1
    }
    fn name(&self) -> &'static str {
        "initial_schema"
    }
    fn description(&self) -> &'static str {
        "users, memories, entities, interactions, api_usage_tracking, oauth tables and FTS indices"
    }

    fn up(&self, conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                email TEXT NOT NULL UNIQUE COLLATE NOCASE,
                metadata TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1
            );

            CREATE TABLE IF NOT EXISTS memories (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                title TEXT NOT NULL,
                content TEXT NOT NULL,
                memory_type TEXT NOT NULL,
                importance REAL NOT NULL DEFAULT 0.5,
                tags TEXT NOT NULL DEFAULT '[]',
                entity_ids TEXT NOT NULL DEFAULT '[]',
                embedding BLOB,
                metadata TEXT NOT NULL DEFAULT '{}',
                is_archived INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS entities (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                name TEXT NOT NULL,
                entity_type TEXT NOT NULL,
                person_type TEXT,
                email TEXT,
                phone TEXT,
                company TEXT,
                title TEXT,
                website TEXT,
                notes TEXT,
                importance REAL NOT NULL DEFAULT 0.5,
                tags TEXT NOT NULL DEFAULT '[]',
                interaction_count INTEGER NOT NULL DEFAULT 0,
                is_archived INTEGER NOT NULL DEFAULT 0,
                metadata TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS interactions (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                entity_id TEXT NOT NULL REFERENCES entities(id) ON DELETE CASCADE,
                kind TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                metadata TEXT NOT NULL DEFAULT '{}'
            );

            CREATE TABLE IF NOT EXISTS api_usage_tracking (
                user_id TEXT NOT NULL,
                provider TEXT NOT NULL,
                date TEXT NOT NULL,
                token_count INTEGER NOT NULL DEFAULT 0,
                cost REAL NOT NULL DEFAULT 0,
                PRIMARY KEY (user_id, provider, date)
            );

            CREATE TABLE IF NOT EXISTS oauth_clients (
                client_id TEXT PRIMARY KEY,
                client_secret_hash TEXT NOT NULL,
                name TEXT NOT NULL,
                redirect_uris TEXT NOT NULL,
                allowed_scopes TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS oauth_authorization_codes (
                code TEXT PRIMARY KEY,
                client_id TEXT NOT NULL REFERENCES oauth_clients(client_id) ON DELETE CASCADE,
                user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                redirect_uri TEXT NOT NULL,
                scope TEXT NOT NULL,
                state TEXT,
                expires_at TEXT NOT NULL,
                used INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS oauth_tokens (
                token TEXT PRIMARY KEY,
                client_id TEXT NOT NULL REFERENCES oauth_clients(client_id) ON DELETE CASCADE,
                user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                scope TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                revoked INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );

            CREATE VIRTUAL TABLE IF NOT EXISTS memories_fts USING fts5(
                memory_id UNINDEXED, title, content, tags,
                tokenize='porter unicode61'
            );

            CREATE TRIGGER IF NOT EXISTS memories_ai AFTER INSERT ON memories BEGIN
                INSERT INTO memories_fts(memory_id, title, content, tags)
                VALUES (new.id, new.title, new.content, new.tags);
            END;

            CREATE TRIGGER IF NOT EXISTS memories_ad AFTER DELETE ON memories BEGIN
                DELETE FROM memories_fts WHERE memory_id = old.id;
            END;

            CREATE TRIGGER IF NOT EXISTS memories_au AFTER UPDATE ON memories BEGIN
                DELETE FROM memories_fts WHERE memory_id = old.id;
                INSERT INTO memories_fts(memory_id, title, content, tags)
                VALUES (new.id, new.title, new.content, new.tags);
            END;

            CREATE VIRTUAL TABLE IF NOT EXISTS entities_fts USING fts5(
                entity_id UNINDEXED, name, notes, tags,
                tokenize='porter unicode61'
            );

            CREATE TRIGGER IF NOT EXISTS entities_ai AFTER INSERT ON entities BEGIN
                INSERT INTO entities_fts(entity_id, name, notes, tags)
                VALUES (new.id, new.name, COALESCE(new.notes, ''), new.tags);
            END;

            CREATE TRIGGER IF NOT EXISTS entities_ad AFTER DELETE ON entities BEGIN
                DELETE FROM entities_fts WHERE entity_id = old.id;
            END;

            CREATE TRIGGER IF NOT EXISTS entities_au AFTER UPDATE ON entities BEGIN
                DELETE FROM entities_fts WHERE entity_id = old.id;
                INSERT INTO entities_fts(entity_id, name, notes, tags)
                VALUES (new.id, new.name, COALESCE(new.notes, ''), new.tags);
            END;
            "#,
        )?;
        Ok(())
    }

    fn down(&self, conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            DROP TRIGGER IF EXISTS entities_au;
            DROP TRIGGER IF EXISTS entities_ad;
            DROP TRIGGER IF EXISTS entities_ai;
            DROP TABLE IF EXISTS entities_fts;
            DROP TRIGGER IF EXISTS memories_au;
            DROP TRIGGER IF EXISTS memories_ad;
            DROP TRIGGER IF EXISTS memories_ai;
            DROP TABLE IF EXISTS memories_fts;
            DROP TABLE IF EXISTS oauth_tokens;
            DROP TABLE IF EXISTS oauth_authorization_codes;
            DROP TABLE IF EXISTS oauth_clients;
            DROP TABLE IF EXISTS api_usage_tracking;
            DROP TABLE IF EXISTS interactions;
            DROP TABLE IF EXISTS entities;
            DROP TABLE IF EXISTS memories;
            DROP TABLE IF EXISTS users;
            "#,
        )?;
        Ok(())
    }

    fn verify(&self, conn: &Connection) -> Result<bool> {
        for t in [
            "users",
            "memories",
            "entities",
            "interactions",
            "api_usage_tracking",
            "oauth_clients",
            "oauth_authorization_codes",
            "oauth_tokens",
            "memories_fts",
            "entities_fts",
        ] {
            if !table_exists(conn, t)? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

// ---------------------------------------------------------------------
// Migration 2: user-scoped indices (spec.md 4.1's mandated index list)
// ---------------------------------------------------------------------

struct UserScopedIndices;

const INDEX_NAMES: &[&str] = &[
    "idx_entities_user_type",
    "idx_memories_user_type",
    "idx_memories_user_archived",
    "idx_memories_user_updated",
    "idx_entities_user_created",
    "idx_api_usage_user_provider_date",
];

impl Migration for UserScopedIndices {
    fn version(&self) -> i32 {
        2
    }
    fn name(&self) -> &'static str {
        "user_scoped_indices"
    }
    fn description(&self) -> &'static str {
        "indices mandated by the store contract for every user-scoped query path"
    }

    fn up(&self, conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE INDEX IF NOT EXISTS idx_entities_user_type ON entities(user_id, entity_type);
            CREATE INDEX IF NOT EXISTS idx_memories_user_type ON memories(user_id, memory_type);
            CREATE INDEX IF NOT EXISTS idx_memories_user_archived ON memories(user_id, is_archived);
            CREATE INDEX IF NOT EXISTS idx_memories_user_updated ON memories(user_id, updated_at DESC);
            CREATE INDEX IF NOT EXISTS idx_entities_user_created ON entities(user_id, created_at DESC);
            CREATE INDEX IF NOT EXISTS idx_api_usage_user_provider_date
                ON api_usage_tracking(user_id, provider, date);
            "#,
        )?;
        Ok(())
    }

    fn down(&self, conn: &Connection) -> Result<()> {
        for idx in INDEX_NAMES {
            conn.execute(&format!("DROP INDEX IF EXISTS {idx}"), [])?;
        }
        Ok(())
    }

    fn verify(&self, conn: &Connection) -> Result<bool> {
        for idx in INDEX_NAMES {
            if !index_exists(conn, idx)? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

fn all_migrations() -> Vec<Box<dyn Migration>> {
    vec![Box::new(InitialSchema), Box::new(UserScopedIndices)]
}

/// Report shape for `status()`.
#[derive(Debug, Clone)]
pub struct MigrationStatusReport {
    pub current_version: i32,
    pub applied: Vec<MigrationRecord>,
    pub pending: Vec<i32>,
}

/// Drives the migration ladder. Constructed fresh per call; cheap (holds no
/// connection, only the static migration list).
pub struct MigrationEngine {
    migrations: Vec<Box<dyn Migration>>,
}

impl Default for MigrationEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MigrationEngine {
    pub fn new() -> Self {
        let mut migrations = all_migrations();
        migrations.sort_by_key(|m| m.version());
        Self { migrations }
    }

    fn ensure_ledger(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                description TEXT NOT NULL,
                applied_at TEXT NOT NULL,
                duration_ms INTEGER NOT NULL,
                checksum TEXT NOT NULL,
                status TEXT NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    fn record_for(conn: &Connection, version: i32) -> Result<Option<MigrationRecord>> {
        conn.query_row(
            "SELECT version, name, description, applied_at, duration_ms, checksum, status
             FROM schema_migrations WHERE version = ?",
            [version],
            |row| {
                let status: String = row.get(6)?;
                let applied_at: String = row.get(3)?;
                Ok(MigrationRecord {
                    version: row.get(0)?,
                    name: row.get(1)?,
                    description: row.get(2)?,
                    applied_at: chrono::DateTime::parse_from_rfc3339(&applied_at)
                        .map(|d| d.with_timezone(&Utc))
                        .unwrap_or_else(|_| Utc::now()),
                    duration_ms: row.get(4)?,
                    checksum: row.get(5)?,
                    status: match status.as_str() {
                        "applied" => MigrationStatus::Applied,
                        "rolled_back" => MigrationStatus::RolledBack,
                        _ => MigrationStatus::Failed,
                    },
                })
            },
        )
        .optional()
        .map_err(Error::from)
    }

    /// Refuses to proceed if any `applied` migration's current source no
    /// longer matches the checksum recorded when it ran — tamper detection
    /// (spec.md 4.2, S6).
    fn check_tamper(&self, conn: &Connection) -> Result<()> {
        for m in &self.migrations {
            if let Some(record) = Self::record_for(conn, m.version())? {
                if record.status == MigrationStatus::Applied {
                    let current = checksum(m.version(), m.name(), m.description());
                    if current != record.checksum {
                        return Err(Error::Conflict(format!(
                            "migration {} checksum mismatch: recorded source has changed since it was applied",
                            m.version()
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    pub fn status(&self, conn: &Connection) -> Result<MigrationStatusReport> {
        Self::ensure_ledger(conn)?;
        let mut applied = Vec::new();
        let mut pending = Vec::new();
        let mut current_version = 0;
        for m in &self.migrations {
            match Self::record_for(conn, m.version())? {
                Some(record) if record.status == MigrationStatus::Applied => {
                    current_version = current_version.max(record.version);
                    applied.push(record);
                }
                _ => pending.push(m.version()),
            }
        }
        Ok(MigrationStatusReport {
            current_version,
            applied,
            pending,
        })
    }

    /// Applies pending migrations in ascending order up to (and including)
    /// `target`, or all pending migrations if `target` is `None`.
    pub fn up(&self, conn: &Connection, target: Option<i32>, dry_run: bool) -> Result<()> {
        Self::ensure_ledger(conn)?;
        self.check_tamper(conn)?;

        let mut last_applied = self.status(conn)?.current_version;
        for m in &self.migrations {
            if let Some(t) = target {
                if m.version() > t {
                    break;
                }
            }
            let already = Self::record_for(conn, m.version())?
                .map(|r| r.status == MigrationStatus::Applied)
                .unwrap_or(false);
            if already {
                continue;
            }

            // No-gap rule: refuse to apply version V if V-1 is not applied.
            if m.version() != last_applied + 1 {
                return Err(Error::Conflict(format!(
                    "cannot apply migration {}: migration {} has not been applied (no-gap rule)",
                    m.version(),
                    m.version() - 1
                )));
            }

            if dry_run {
                tracing::info!(version = m.version(), name = m.name(), "dry-run: would apply");
                last_applied = m.version();
                continue;
            }

            let started = std::time::Instant::now();
            let outcome = (|| -> Result<()> {
                m.up(conn)?;
                if !m.verify(conn)? {
                    return Err(Error::Internal(format!(
                        "migration {} verify() failed after up()",
                        m.version()
                    )));
                }
                Ok(())
            })();

            let duration_ms = started.elapsed().as_millis() as i64;
            let sum = checksum(m.version(), m.name(), m.description());
            let status = if outcome.is_ok() { "applied" } else { "failed" };
            conn.execute(
                "INSERT INTO schema_migrations (version, name, description, applied_at, duration_ms, checksum, status)
                 VALUES (?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(version) DO UPDATE SET
                   applied_at=excluded.applied_at, duration_ms=excluded.duration_ms,
                   checksum=excluded.checksum, status=excluded.status",
                rusqlite::params![
                    m.version(),
                    m.name(),
                    m.description(),
                    Utc::now().to_rfc3339(),
                    duration_ms,
                    sum,
                    status,
                ],
            )?;

            outcome?;
            tracing::info!(from = last_applied, to = m.version(), "migration applied");
            last_applied = m.version();
        }
        Ok(())
    }

    /// Rolls back applied migrations in descending order down to (but not
    /// including) `target`.
    pub fn down(&self, conn: &Connection, target: i32, dry_run: bool) -> Result<()> {
        Self::ensure_ledger(conn)?;
        let mut reversed: Vec<&Box<dyn Migration>> = self.migrations.iter().collect();
        reversed.sort_by_key(|m| std::cmp::Reverse(m.version()));

        for m in reversed {
            if m.version() <= target {
                continue;
            }
            let applied = Self::record_for(conn, m.version())?
                .map(|r| r.status == MigrationStatus::Applied)
                .unwrap_or(false);
            if !applied {
                continue;
            }
            if dry_run {
                tracing::info!(version = m.version(), "dry-run: would roll back");
                continue;
            }

            m.down(conn)?;
            conn.execute(
                "UPDATE schema_migrations SET status = 'rolled_back' WHERE version = ?",
                [m.version()],
            )?;
            tracing::info!(from = m.version(), to = target, "migration rolled back");
        }
        Ok(())
    }
}

/// Bootstraps a freshly opened connection to the latest schema. Called once
/// by `Storage::open`.
pub fn run_migrations(conn: &Connection) -> Result<()> {
    MigrationEngine::new().up(conn, None, false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn() -> Connection {
        Connection::open_in_memory().unwrap()
    }

    #[test]
    fn bootstraps_to_latest() {
        let c = conn();
        run_migrations(&c).unwrap();
        let status = MigrationEngine::new().status(&c).unwrap();
        assert_eq!(status.current_version, 2);
        assert!(status.pending.is_empty());
    }

    #[test]
    fn round_trip_up_verify_down_verify() {
        let c = conn();
        let engine = MigrationEngine::new();
        engine.up(&c, None, false).unwrap();
        assert!(UserScopedIndices.verify(&c).unwrap());
        engine.down(&c, 1, false).unwrap();
        for idx in INDEX_NAMES {
            assert!(!index_exists(&c, idx).unwrap());
        }
        assert!(InitialSchema.verify(&c).unwrap());
    }

    #[test]
    fn refuses_gap() {
        let c = conn();
        let engine = MigrationEngine::new();
        engine.up(&c, Some(1), false).unwrap();
        c.execute(
            "UPDATE schema_migrations SET status = 'failed' WHERE version = 1",
            [],
        )
        .unwrap();
        let err = engine.up(&c, None, false).unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[test]
    fn checksum_is_stable() {
        let a = checksum(2, "user_scoped_indices", "x");
        let b = checksum(2, "user_scoped_indices", "x");
        assert_eq!(a, b);
    }

    #[test]
    fn tamper_detected_on_recorded_checksum_mismatch() {
        let c = conn();
        let engine = MigrationEngine::new();
        engine.up(&c, None, false).unwrap();
        c.execute(
            "UPDATE schema_migrations SET checksum = 'deadbeef' WHERE version = 2",
            [],
        )
        .unwrap();
        let err = engine.up(&c, None, false).unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }
}
