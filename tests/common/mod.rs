//! Common test utilities for engine tests
//!
//! Provides shared helper functions for:
//! - Building the blog fixture schema
//! - Opening in-memory storages
//! - Summarising mutation events

#![allow(dead_code)]

use erstore::{
    Condition, EngineConfig, Entity, MatchExp, MutationType, Property, Record, RecordMutationEvent,
    Relation, RelationType, Schema, SqliteDatabase, Storage,
};
use serde_json::{json, Value};

/// Users with profiles (combined), teams (n:1), posts (1:n), symmetric
/// friends carrying a `since` value and directed follows.
pub fn blog_schema() -> Schema {
    Schema::new()
        .with_entity(
            Entity::new("User")
                .property(Property::string("name"))
                .property(Property::number("age"))
                .property(Property::boolean("isActive")),
        )
        .with_entity(Entity::filtered(
            "Active",
            "User",
            MatchExp::equals("isActive", json!(true)),
        ))
        .with_entity(Entity::filtered(
            "YoungActive",
            "Active",
            MatchExp::with("age", Condition::Lt(json!(30))),
        ))
        .with_entity(Entity::new("Profile").property(Property::string("title")))
        .with_entity(Entity::new("Team").property(Property::string("name")))
        .with_entity(
            Entity::new("Post")
                .property(Property::string("title"))
                .property(Property::string("tags").collection()),
        )
        .with_relation(
            Relation::new("User", "profile", "Profile", "owner", RelationType::OneToOne)
                .reliance()
                .with_name("HasProfile"),
        )
        .with_relation(
            Relation::new("User", "team", "Team", "members", RelationType::ManyToOne)
                .with_name("InTeam"),
        )
        .with_relation(
            Relation::new("User", "posts", "Post", "author", RelationType::OneToMany)
                .with_name("Wrote"),
        )
        .with_relation(
            Relation::new("User", "friends", "User", "friends", RelationType::ManyToMany)
                .with_name("Friends")
                .property(Property::number("since")),
        )
        .with_relation(
            Relation::new("User", "follows", "User", "followers", RelationType::ManyToMany)
                .with_name("Follows"),
        )
}

pub fn open_storage(schema: Schema) -> Storage<SqliteDatabase> {
    Storage::open(schema, EngineConfig::in_memory()).expect("Failed to open storage")
}

pub fn blog_storage() -> Storage<SqliteDatabase> {
    open_storage(blog_schema())
}

/// JSON object literal as a record
pub fn record(value: Value) -> Record {
    match value {
        Value::Object(map) => map,
        other => panic!("expected a JSON object, got {}", other),
    }
}

pub fn by_id(id: i64) -> Option<MatchExp> {
    Some(MatchExp::equals("id", json!(id)))
}

/// Create `data` as `record_name`, returning the record and its events
pub fn create(
    storage: &Storage<SqliteDatabase>,
    record_name: &str,
    data: Value,
) -> (Record, Vec<RecordMutationEvent>) {
    let mut events = Vec::new();
    let created = storage
        .create(record_name, &record(data), &mut events)
        .expect("create failed");
    (created, events)
}

/// Create a user and return its id
pub fn create_user(storage: &Storage<SqliteDatabase>, data: Value) -> i64 {
    let (user, _) = create(storage, "User", data);
    user["id"].as_i64().expect("user id")
}

/// (type, record name) of every event, in order
pub fn summary(events: &[RecordMutationEvent]) -> Vec<(MutationType, String)> {
    events
        .iter()
        .map(|e| (e.event_type, e.record_name.clone()))
        .collect()
}

pub fn ids(records: &[Value]) -> Vec<i64> {
    records.iter().filter_map(|r| r["id"].as_i64()).collect()
}

pub fn sorted(mut values: Vec<i64>) -> Vec<i64> {
    values.sort_unstable();
    values
}
