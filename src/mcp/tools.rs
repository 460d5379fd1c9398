//! MCP tool definitions: the JSON-RPC `tools/call` surface over the Memory
//! Core. Tool count is deliberately small — spec.md 4.8 lists this as the
//! minimum set and the teacher's sprawling tool catalog (entity extraction,
//! sessions, salience, quality, sync, sharing, ...) has no counterpart in
//! this design, see DESIGN.md.

use super::protocol::ToolDefinition;

/// All tool definitions, as `(name, description, input_schema_json)`.
pub const TOOL_DEFINITIONS: &[(&str, &str, &str)] = &[
    (
        "store_memory",
        "Store a new memory for the authenticated user.",
        r#"{
            "type": "object",
            "properties": {
                "title": {"type": "string", "description": "Short title (may be empty)"},
                "content": {"type": "string", "description": "The content to remember"},
                "memory_type": {"type": "string", "enum": ["system", "learned", "memory", "note", "decision", "preference"], "default": "memory"},
                "importance": {"type": "number", "minimum": 0, "maximum": 1, "description": "Importance score (0-1); ordinals 1-5 also accepted and linearly mapped"},
                "tags": {"type": "array", "items": {"type": "string"}, "description": "Tags for categorization (deduplicated)"},
                "entity_ids": {"type": "array", "items": {"type": "string"}, "description": "Entity IDs this memory references (unknown ids are dropped with a warning)"},
                "metadata": {"type": "object", "description": "Additional metadata as key-value pairs"},
                "mode": {"type": "string", "enum": ["sync", "async", "disabled"], "description": "Embedding mode override for this write"}
            },
            "required": ["content"]
        }"#,
    ),
    (
        "recall_memories",
        "Search memories using the configured recall strategy (similarity, composite hybrid, recency, frequency, or importance).",
        r#"{
            "type": "object",
            "properties": {
                "query": {"type": "string", "description": "Search query (empty query returns most recently updated memories)"},
                "strategy": {"type": "string", "enum": ["similarity", "composite", "recency", "frequency", "importance"], "default": "composite"},
                "limit": {"type": "integer", "default": 10, "description": "Maximum results (<=0 returns no results)"},
                "threshold": {"type": "number", "description": "Minimum score (>1 yields an empty result)"},
                "tags": {"type": "array", "items": {"type": "string"}, "description": "Filter by tags"},
                "memory_type": {"type": "string", "description": "Filter by memory type"}
            },
            "required": ["query"]
        }"#,
    ),
    (
        "get_memory",
        "Retrieve a single memory by id for the authenticated user.",
        r#"{
            "type": "object",
            "properties": {
                "id": {"type": "string", "description": "Memory id"}
            },
            "required": ["id"]
        }"#,
    ),
    (
        "update_memory",
        "Update an existing memory owned by the authenticated user. `id` and `user_id` in the patch are ignored.",
        r#"{
            "type": "object",
            "properties": {
                "id": {"type": "string", "description": "Memory id"},
                "title": {"type": "string"},
                "content": {"type": "string"},
                "memory_type": {"type": "string"},
                "importance": {"type": "number", "minimum": 0, "maximum": 1},
                "tags": {"type": "array", "items": {"type": "string"}},
                "entity_ids": {"type": "array", "items": {"type": "string"}},
                "metadata": {"type": "object"},
                "is_archived": {"type": "boolean"}
            },
            "required": ["id"]
        }"#,
    ),
    (
        "delete_memory",
        "Delete a memory owned by the authenticated user.",
        r#"{
            "type": "object",
            "properties": {
                "id": {"type": "string", "description": "Memory id"}
            },
            "required": ["id"]
        }"#,
    ),
    (
        "get_memory_stats",
        "Get memory statistics for the authenticated user only (counts, per-type breakdown, embedding coverage).",
        r#"{
            "type": "object",
            "properties": {}
        }"#,
    ),
    (
        "update_missing_embeddings",
        "Trigger the embedding worker to backfill missing embeddings, scoped to the authenticated user.",
        r#"{
            "type": "object",
            "properties": {}
        }"#,
    ),
    (
        "store_entity",
        "Store a new entity (person, organization, project, ...) for the authenticated user.",
        r#"{
            "type": "object",
            "properties": {
                "name": {"type": "string"},
                "entity_type": {"type": "string", "enum": ["person", "organization", "project"], "default": "person"},
                "person_type": {"type": "string", "description": "Free-form subtype, e.g. colleague, family, client"},
                "email": {"type": "string"},
                "phone": {"type": "string"},
                "company": {"type": "string"},
                "title": {"type": "string"},
                "website": {"type": "string"},
                "notes": {"type": "string"},
                "importance": {"type": "number", "minimum": 0, "maximum": 1},
                "tags": {"type": "array", "items": {"type": "string"}},
                "metadata": {"type": "object"}
            },
            "required": ["name"]
        }"#,
    ),
    (
        "get_entity",
        "Retrieve a single entity by id for the authenticated user.",
        r#"{
            "type": "object",
            "properties": {
                "id": {"type": "string", "description": "Entity id"}
            },
            "required": ["id"]
        }"#,
    ),
    (
        "update_entity",
        "Update an existing entity owned by the authenticated user. `id`, `user_id`, and `entity_type` cannot be changed once set.",
        r#"{
            "type": "object",
            "properties": {
                "id": {"type": "string"},
                "name": {"type": "string"},
                "person_type": {"type": "string"},
                "email": {"type": "string"},
                "phone": {"type": "string"},
                "company": {"type": "string"},
                "title": {"type": "string"},
                "website": {"type": "string"},
                "notes": {"type": "string"},
                "importance": {"type": "number", "minimum": 0, "maximum": 1},
                "tags": {"type": "array", "items": {"type": "string"}},
                "metadata": {"type": "object"},
                "is_archived": {"type": "boolean"}
            },
            "required": ["id"]
        }"#,
    ),
    (
        "delete_entity",
        "Delete an entity owned by the authenticated user. Memories that reference it are left intact.",
        r#"{
            "type": "object",
            "properties": {
                "id": {"type": "string", "description": "Entity id"}
            },
            "required": ["id"]
        }"#,
    ),
    (
        "search_entities",
        "Search the authenticated user's entities by name (full-text).",
        r#"{
            "type": "object",
            "properties": {
                "query": {"type": "string"},
                "entity_type": {"type": "string", "description": "Filter by entity type"},
                "limit": {"type": "integer", "default": 20}
            },
            "required": ["query"]
        }"#,
    ),
];

/// Get all tool definitions as `ToolDefinition` structs
pub fn get_tool_definitions() -> Vec<ToolDefinition> {
    TOOL_DEFINITIONS
        .iter()
        .map(|(name, description, schema)| ToolDefinition {
            name: name.to_string(),
            description: description.to_string(),
            input_schema: serde_json::from_str(schema).expect("tool schema is valid JSON"),
        })
        .collect()
}
