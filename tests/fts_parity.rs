//! Universal invariant 2 (FTS parity): a lexical search for a unique token
//! always returns exactly the live set of memories containing it, across
//! insert/update/delete.

use engram::storage::queries::{create_memory, delete_memory, fts_search_memories, update_memory};
use engram::storage::Storage;
use engram::types::{CreateMemoryInput, MemoryType, UpdateMemoryInput};
use proptest::prelude::*;

const USER: &str = "fts-user";

fn memory_input(content: &str) -> CreateMemoryInput {
    CreateMemoryInput {
        title: String::new(),
        content: content.to_string(),
        memory_type: MemoryType::Note,
        importance: 0.5,
        tags: vec![],
        entity_ids: vec![],
        metadata: serde_json::json!({}),
    }
}

fn matches(storage: &Storage, token: &str) -> Vec<String> {
    storage
        .with_connection(|conn| fts_search_memories(conn, USER, token, 100))
        .unwrap()
        .into_iter()
        .map(|(m, _)| m.id)
        .collect()
}

#[test]
fn insert_makes_memory_searchable() {
    let storage = Storage::open_in_memory().unwrap();
    let memory = storage.with_transaction(|conn| create_memory(conn, USER, memory_input("zanzibar expedition notes"))).unwrap();

    assert_eq!(matches(&storage, "zanzibar"), vec![memory.id]);
}

#[test]
fn update_moves_the_match() {
    let storage = Storage::open_in_memory().unwrap();
    let memory = storage.with_transaction(|conn| create_memory(conn, USER, memory_input("original wombat content"))).unwrap();
    assert_eq!(matches(&storage, "wombat"), vec![memory.id.clone()]);

    let patch = UpdateMemoryInput { content: Some("now about platypus instead".into()), ..Default::default() };
    storage.with_transaction(|conn| update_memory(conn, &memory.id, USER, patch)).unwrap();

    assert!(matches(&storage, "wombat").is_empty());
    assert_eq!(matches(&storage, "platypus"), vec![memory.id]);
}

#[test]
fn delete_removes_the_match() {
    let storage = Storage::open_in_memory().unwrap();
    let memory = storage.with_transaction(|conn| create_memory(conn, USER, memory_input("ephemeral quokka sighting"))).unwrap();
    assert_eq!(matches(&storage, "quokka"), vec![memory.id.clone()]);

    storage.with_transaction(|conn| delete_memory(conn, &memory.id, USER)).unwrap();
    assert!(matches(&storage, "quokka").is_empty());
}

proptest! {
    /// Fuzz: after a random sequence of inserts/edits on distinct unique
    /// tokens, the live set returned by FTS for each still-live token is
    /// exactly the memory that currently holds it.
    #[test]
    fn fuzz_inserts_and_edits_keep_fts_in_sync(tokens in prop::collection::vec("[a-z]{6,12}", 3..8)) {
        let storage = Storage::open_in_memory().unwrap();
        let mut ids = Vec::new();
        for token in &tokens {
            let memory = storage
                .with_transaction(|conn| create_memory(conn, USER, memory_input(&format!("content about {token}"))))
                .unwrap();
            ids.push((memory.id, token.clone()));
        }

        for (id, token) in &ids {
            prop_assert_eq!(matches(&storage, token), vec![id.clone()]);
        }

        // re-tag the first memory with a fresh unique token and check both directions
        if let Some((id, old_token)) = ids.first().cloned() {
            let fresh = format!("{old_token}revised");
            let patch = UpdateMemoryInput { content: Some(format!("content about {fresh}")), ..Default::default() };
            storage.with_transaction(|conn| update_memory(conn, &id, USER, patch)).unwrap();
            prop_assert!(matches(&storage, &old_token).is_empty());
            prop_assert_eq!(matches(&storage, &fresh), vec![id]);
        }
    }
}
