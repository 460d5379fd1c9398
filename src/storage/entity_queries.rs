//! Entity CRUD and lexical search — the Store's (C1) Entity half, mirroring
//! `storage::queries` with the same user-isolation and immutable-id rules
//! (spec.md 3: "Same user-isolation and immutability-of-id rules as Memory").

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::{Error, Result};
use crate::types::{CreateEntityInput, Entity, EntityType, UpdateEntityInput};

fn parse_dt(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn entity_from_row(row: &Row) -> rusqlite::Result<Entity> {
    let tags: String = row.get("tags")?;
    let metadata: String = row.get("metadata")?;
    let entity_type: String = row.get("entity_type")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;

    Ok(Entity {
        id: row.get("id")?,
        user_id: row.get("user_id")?,
        name: row.get("name")?,
        entity_type: entity_type.parse().unwrap_or(EntityType::Person),
        person_type: row.get("person_type")?,
        email: row.get("email")?,
        phone: row.get("phone")?,
        company: row.get("company")?,
        title: row.get("title")?,
        website: row.get("website")?,
        notes: row.get("notes")?,
        importance: row.get("importance")?,
        tags: serde_json::from_str(&tags).unwrap_or_default(),
        interaction_count: row.get("interaction_count")?,
        is_archived: row.get::<_, i64>("is_archived")? != 0,
        metadata: serde_json::from_str(&metadata).unwrap_or(serde_json::json!({})),
        created_at: parse_dt(&created_at),
        updated_at: parse_dt(&updated_at),
    })
}

pub fn create_entity(conn: &Connection, user_id: &str, input: CreateEntityInput) -> Result<Entity> {
    if user_id.trim().is_empty() {
        return Err(Error::Validation("user_id must not be empty".into()));
    }
    if input.name.trim().is_empty() {
        return Err(Error::Validation("name must not be empty".into()));
    }

    let id = uuid::Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339();
    let mut tags = input.tags;
    tags.sort();
    tags.dedup();

    conn.execute(
        "INSERT INTO entities (id, user_id, name, entity_type, person_type, email, phone,
                                company, title, website, notes, importance, tags,
                                interaction_count, is_archived, metadata, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, 0, ?, ?, ?)",
        params![
            id,
            user_id,
            input.name,
            input.entity_type.as_str(),
            input.person_type,
            input.email,
            input.phone,
            input.company,
            input.title,
            input.website,
            input.notes,
            input.importance.clamp(0.0, 1.0),
            serde_json::to_string(&tags)?,
            serde_json::to_string(&input.metadata)?,
            now,
            now,
        ],
    )?;

    get_entity_by_id(conn, &id, user_id)?.ok_or_else(|| Error::Internal("insert did not persist".into()))
}

pub fn get_entity_by_id(conn: &Connection, id: &str, user_id: &str) -> Result<Option<Entity>> {
    conn.query_row(
        "SELECT * FROM entities WHERE id = ? AND user_id = ?",
        params![id, user_id],
        entity_from_row,
    )
    .optional()
    .map_err(Error::from)
}

/// `updateEntity` MUST refuse to change `user_id` or `id` — enforced by
/// `UpdateEntityInput` never carrying either field.
pub fn update_entity(
    conn: &Connection,
    id: &str,
    user_id: &str,
    patch: UpdateEntityInput,
) -> Result<Option<Entity>> {
    let Some(existing) = get_entity_by_id(conn, id, user_id)? else {
        return Ok(None);
    };

    let name = patch.name.unwrap_or(existing.name);
    let importance = patch
        .importance
        .map(|i| i.clamp(0.0, 1.0))
        .unwrap_or(existing.importance);
    let tags = patch.tags.unwrap_or(existing.tags);
    let metadata = patch.metadata.unwrap_or(existing.metadata);
    let is_archived = patch.is_archived.unwrap_or(existing.is_archived);

    conn.execute(
        "UPDATE entities SET name=?, person_type=?, email=?, phone=?, company=?, title=?,
                website=?, notes=?, importance=?, tags=?, is_archived=?, metadata=?, updated_at=?
         WHERE id=? AND user_id=?",
        params![
            name,
            patch.person_type.or(existing.person_type),
            patch.email.or(existing.email),
            patch.phone.or(existing.phone),
            patch.company.or(existing.company),
            patch.title.or(existing.title),
            patch.website.or(existing.website),
            patch.notes.or(existing.notes),
            importance,
            serde_json::to_string(&tags)?,
            is_archived as i64,
            serde_json::to_string(&metadata)?,
            Utc::now().to_rfc3339(),
            id,
            user_id,
        ],
    )?;

    get_entity_by_id(conn, id, user_id)
}

pub fn delete_entity(conn: &Connection, id: &str, user_id: &str) -> Result<bool> {
    let affected = conn.execute(
        "DELETE FROM entities WHERE id = ? AND user_id = ?",
        params![id, user_id],
    )?;
    Ok(affected > 0)
}

pub fn list_entities(conn: &Connection, user_id: &str, limit: i64) -> Result<Vec<Entity>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM entities WHERE user_id = ? ORDER BY created_at DESC LIMIT ?",
    )?;
    let rows = stmt.query_map(params![user_id, limit], entity_from_row)?;
    rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
}

pub fn fts_search_entities(
    conn: &Connection,
    user_id: &str,
    query_text: &str,
    limit: i64,
) -> Result<Vec<Entity>> {
    if query_text.trim().is_empty() {
        return Ok(Vec::new());
    }
    let sanitized = format!("\"{}\"", query_text.replace('"', "\"\""));
    let mut stmt = conn.prepare(
        "SELECT e.* FROM entities_fts
         JOIN entities e ON e.id = entities_fts.entity_id
         WHERE entities_fts MATCH ?1 AND e.user_id = ?2
         ORDER BY rank LIMIT ?3",
    )?;
    let rows = stmt.query_map(params![sanitized, user_id, limit], entity_from_row)?;
    rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
}

/// Drops ids that do not exist under `user_id`, per spec.md 4.6 ("unknown
/// ids dropped with a warning in response metadata") — the warning itself is
/// assembled by the caller (`memory_core`) from the delta of input vs result.
pub fn filter_existing_entity_ids(conn: &Connection, user_id: &str, ids: &[String]) -> Result<Vec<String>> {
    let mut kept = Vec::with_capacity(ids.len());
    for id in ids {
        if get_entity_by_id(conn, id, user_id)?.is_some() {
            kept.push(id.clone());
        }
    }
    Ok(kept)
}

/// Increments `interaction_count` and records a row in `interactions`; not
/// required by the CORE's search path (spec.md 3).
pub fn record_interaction(
    conn: &Connection,
    user_id: &str,
    entity_id: &str,
    kind: &str,
    metadata: serde_json::Value,
) -> Result<bool> {
    if get_entity_by_id(conn, entity_id, user_id)?.is_none() {
        return Ok(false);
    }
    let id = uuid::Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO interactions (id, user_id, entity_id, kind, timestamp, metadata)
         VALUES (?, ?, ?, ?, ?, ?)",
        params![id, user_id, entity_id, kind, now, serde_json::to_string(&metadata)?],
    )?;
    conn.execute(
        "UPDATE entities SET interaction_count = interaction_count + 1, updated_at = ?1 WHERE id = ?2 AND user_id = ?3",
        params![now, entity_id, user_id],
    )?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::migrations::run_migrations;
    use crate::types::EntityType;

    fn conn() -> Connection {
        let c = Connection::open_in_memory().unwrap();
        run_migrations(&c).unwrap();
        c
    }

    fn input(name: &str) -> CreateEntityInput {
        CreateEntityInput {
            name: name.to_string(),
            entity_type: EntityType::Person,
            importance: 0.5,
            ..Default::default()
        }
    }

    #[test]
    fn get_by_id_is_user_scoped() {
        let c = conn();
        let e = create_entity(&c, "alice", input("Ada")).unwrap();
        assert!(get_entity_by_id(&c, &e.id, "bob").unwrap().is_none());
        assert!(get_entity_by_id(&c, &e.id, "alice").unwrap().is_some());
    }

    #[test]
    fn update_cannot_change_identity_fields() {
        let c = conn();
        let e = create_entity(&c, "alice", input("Ada")).unwrap();
        let updated = update_entity(
            &c,
            &e.id,
            "alice",
            UpdateEntityInput {
                name: Some("Ada Lovelace".into()),
                ..Default::default()
            },
        )
        .unwrap()
        .unwrap();
        assert_eq!(updated.id, e.id);
        assert_eq!(updated.user_id, "alice");
        assert_eq!(updated.name, "Ada Lovelace");
    }

    #[test]
    fn unknown_entity_ids_are_filtered_not_erroring() {
        let c = conn();
        let e = create_entity(&c, "alice", input("Ada")).unwrap();
        let kept = filter_existing_entity_ids(&c, "alice", &[e.id.clone(), "ghost".into()]).unwrap();
        assert_eq!(kept, vec![e.id]);
    }

    #[test]
    fn record_interaction_increments_count() {
        let c = conn();
        let e = create_entity(&c, "alice", input("Ada")).unwrap();
        record_interaction(&c, "alice", &e.id, "email", serde_json::json!({})).unwrap();
        let refetched = get_entity_by_id(&c, &e.id, "alice").unwrap().unwrap();
        assert_eq!(refetched.interaction_count, 1);
    }

    #[test]
    fn record_interaction_does_not_touch_another_users_entity() {
        let c = conn();
        let e = create_entity(&c, "alice", input("Ada")).unwrap();
        assert!(!record_interaction(&c, "bob", &e.id, "email", serde_json::json!({})).unwrap());
        let refetched = get_entity_by_id(&c, &e.id, "alice").unwrap().unwrap();
        assert_eq!(refetched.interaction_count, 0);
    }
}
