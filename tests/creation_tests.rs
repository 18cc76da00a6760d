//! Creation Tests
//! Row placement, combined rows and flash-out, relinking of exclusive sides,
//! duplicate links and derived record events

mod common;

use common::*;
use erstore::{
    AttributeQueryItem, Condition, Database, DbError, DefaultValue, Entity, MatchExp,
    MutationType, Property, Relation, RelationType, Schema,
};
use serde_json::json;

fn names(events: &[erstore::RecordMutationEvent], event_type: MutationType) -> Vec<String> {
    events
        .iter()
        .filter(|e| e.event_type == event_type)
        .map(|e| e.record_name.clone())
        .collect()
}

// ============================================================================
// Plain and nested creation
// ============================================================================

#[test]
fn test_create_returns_ids() {
    let storage = blog_storage();
    let (first, events) = create(&storage, "User", json!({"name": "Ann", "age": 31}));
    let (second, _) = create(&storage, "User", json!({"name": "Ben"}));

    assert_eq!(first["id"], json!(1));
    assert_eq!(first["name"], json!("Ann"));
    assert_eq!(second["id"], json!(2));
    assert_eq!(summary(&events), vec![(MutationType::Create, "User".to_string())]);
    assert_eq!(events[0].record["age"], json!(31));
}

#[test]
fn test_create_with_supplied_id() {
    let storage = blog_storage();
    let (user, _) = create(&storage, "User", json!({"id": 42, "name": "Ann"}));
    assert_eq!(user["id"], json!(42));
    let found = storage.find_one("User", by_id(42), &[]).unwrap();
    assert!(found.is_some());
}

#[test]
fn test_supplied_id_reserves_sequence() {
    let storage = blog_storage();
    let (first, _) = create(&storage, "User", json!({"id": 1, "name": "Ann"}));
    let (second, _) = create(&storage, "User", json!({"name": "Ben"}));
    assert_eq!(first["id"], json!(1));
    assert_eq!(second["id"], json!(2));

    let mut events = Vec::new();
    let err = storage
        .create("User", &record(json!({"id": 1, "name": "Cid"})), &mut events)
        .unwrap_err();
    assert!(matches!(err, DbError::DuplicateRecord(_)));
    assert!(events.is_empty());

    let found = storage.find("User", by_id(1), None, &[AttributeQueryItem::name("name")]).unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0]["name"], json!("Ann"));
}

#[test]
fn test_create_nested_records() {
    let storage = blog_storage();
    let (user, events) = create(
        &storage,
        "User",
        json!({
            "name": "Bob",
            "team": {"name": "Core"},
            "profile": {"title": "Engineer"},
            "posts": [{"title": "a"}, {"title": "b"}]
        }),
    );

    assert_eq!(user["team"]["name"], json!("Core"));
    assert_eq!(user["profile"]["title"], json!("Engineer"));
    assert_eq!(user["posts"].as_array().unwrap().len(), 2);

    let created = names(&events, MutationType::Create);
    for expected in ["User", "Team", "Profile", "Post", "HasProfile", "InTeam", "Wrote"] {
        assert!(created.contains(&expected.to_string()), "missing {}", expected);
    }
    assert_eq!(created.iter().filter(|n| *n == "Wrote").count(), 2);
    // the team exists before the user row pointing at it
    let team = created.iter().position(|n| n == "Team").unwrap();
    let owner = created.iter().position(|n| n == "User").unwrap();
    assert!(team < owner);
}

#[test]
fn test_combined_records_share_one_row() {
    let storage = blog_storage();
    create(
        &storage,
        "User",
        json!({"name": "Bob", "profile": {"title": "Engineer"}}),
    );

    let table = storage.map().record("User").unwrap().table.clone();
    assert_eq!(storage.map().record("Profile").unwrap().table, table);
    let rows = storage
        .db()
        .query(&format!("SELECT * FROM \"{}\"", table), &[], "test")
        .unwrap()
        .len();
    assert_eq!(rows, 1);
}

#[test]
fn test_create_links_existing_records() {
    let storage = blog_storage();
    let (team, _) = create(&storage, "Team", json!({"name": "Core"}));
    let (post, _) = create(&storage, "Post", json!({"title": "draft"}));

    let (user, events) = create(
        &storage,
        "User",
        json!({"name": "Ann", "team": {"id": team["id"]}, "posts": [post["id"]]}),
    );
    assert_eq!(
        names(&events, MutationType::Create),
        vec!["User", "InTeam", "Wrote"]
    );

    let found = storage
        .find_one(
            "User",
            by_id(user["id"].as_i64().unwrap()),
            &AttributeQueryItem::list_from_json(json!(["team", "posts"])).unwrap(),
        )
        .unwrap()
        .unwrap();
    assert_eq!(found["team"]["id"], team["id"]);
    assert_eq!(found["posts"], json!([{"id": post["id"]}]));
}

#[test]
fn test_reference_cannot_carry_values() {
    let storage = blog_storage();
    let (team, _) = create(&storage, "Team", json!({"name": "Core"}));
    let mut events = Vec::new();
    let err = storage
        .create(
            "User",
            &record(json!({"name": "Ann", "team": {"id": team["id"], "name": "Other"}})),
            &mut events,
        )
        .unwrap_err();
    assert!(matches!(err, DbError::InvalidData(_)));
    assert!(events.is_empty());
}

#[test]
fn test_failed_create_rolls_back() {
    let storage = blog_storage();
    let mut events = Vec::new();
    let err = storage
        .create(
            "User",
            &record(json!({"name": "Ann", "team": {"name": "Core"}, "posts": [{"title": "x", "nope": 1}]})),
            &mut events,
        )
        .unwrap_err();
    assert!(matches!(err, DbError::AttributeNotFound { .. }));
    assert!(events.is_empty());
    assert!(storage.find("Team", None, None, &[]).unwrap().is_empty());
}

// ============================================================================
// Defaults
// ============================================================================

#[test]
fn test_default_values() {
    let schema = Schema::new().with_entity(
        Entity::new("Task")
            .property(Property::string("title"))
            .property(Property::string("state").with_default(DefaultValue::constant(json!("open"))))
            .property(Property::string("key").with_default(DefaultValue::Uuid))
            .property(Property::number("createdAt").with_default(DefaultValue::Now))
            .property(Property::string("label").with_default(DefaultValue::CopyFrom {
                attribute: "title".to_string(),
            })),
    );
    let storage = open_storage(schema);
    let (task, _) = create(&storage, "Task", json!({"title": "write tests", "state": "doing"}));

    assert_eq!(task["state"], json!("doing"));
    assert_eq!(task["label"], json!("write tests"));
    assert_eq!(task["key"].as_str().unwrap().len(), 36);
    assert!(task["createdAt"].as_i64().unwrap() > 0);

    let stored = storage
        .find_one("Task", by_id(1), &[AttributeQueryItem::name("*")])
        .unwrap()
        .unwrap();
    assert_eq!(stored["key"], task["key"]);
}

// ============================================================================
// Exclusive sides and duplicates
// ============================================================================

#[test]
fn test_add_link_replaces_exclusive_occupant() {
    let storage = blog_storage();
    let (core, _) = create(&storage, "Team", json!({"name": "Core"}));
    let (infra, _) = create(&storage, "Team", json!({"name": "Infra"}));
    let user = create_user(&storage, json!({"name": "Ann", "team": {"id": core["id"]}}));

    let mut events = Vec::new();
    storage
        .add_link("InTeam", &json!(user), &infra["id"], None, &mut events)
        .unwrap();
    assert_eq!(
        summary(&events),
        vec![
            (MutationType::Delete, "InTeam".to_string()),
            (MutationType::Create, "InTeam".to_string()),
        ]
    );
    assert_eq!(events[0].record["target"]["id"], core["id"]);

    let found = storage
        .find_one("User", by_id(user), &[AttributeQueryItem::name("team")])
        .unwrap()
        .unwrap();
    assert_eq!(found["team"]["id"], infra["id"]);
}

#[test]
fn test_one_to_many_moves_target() {
    let storage = blog_storage();
    let ann = create_user(&storage, json!({"name": "Ann", "posts": [{"title": "moved"}]}));
    let ben = create_user(&storage, json!({"name": "Ben"}));

    let mut events = Vec::new();
    storage
        .add_link("Wrote", &json!(ben), &json!(1), None, &mut events)
        .unwrap();

    let posts_of = |id: i64| {
        storage
            .find_one("User", by_id(id), &[AttributeQueryItem::name("posts")])
            .unwrap()
            .unwrap()["posts"]
            .clone()
    };
    assert_eq!(posts_of(ann), json!([]));
    assert_eq!(posts_of(ben), json!([{"id": 1}]));
}

#[test]
fn test_duplicate_link_is_rejected() {
    let storage = blog_storage();
    let ann = create_user(&storage, json!({"name": "Ann"}));
    let ben = create_user(&storage, json!({"name": "Ben"}));

    let mut events = Vec::new();
    storage
        .add_link("Follows", &json!(ann), &json!(ben), None, &mut events)
        .unwrap();
    let err = storage
        .add_link("Follows", &json!(ann), &json!(ben), None, &mut events)
        .unwrap_err();
    assert!(matches!(err, DbError::DuplicateLink(_)));
    // the other direction is a different link
    storage
        .add_link("Follows", &json!(ben), &json!(ann), None, &mut events)
        .unwrap();

    storage
        .add_link("Friends", &json!(ann), &json!(ben), None, &mut events)
        .unwrap();
    let err = storage
        .add_link("Friends", &json!(ben), &json!(ann), None, &mut events)
        .unwrap_err();
    assert!(matches!(err, DbError::DuplicateLink(_)));
}

#[test]
fn test_add_link_requires_both_records() {
    let storage = blog_storage();
    let ann = create_user(&storage, json!({"name": "Ann"}));
    let mut events = Vec::new();
    let err = storage
        .add_link("Follows", &json!(ann), &json!(99), None, &mut events)
        .unwrap_err();
    assert!(matches!(err, DbError::RowNotFound(_)));
}

#[test]
fn test_create_relation_record_links_endpoints() {
    let storage = blog_storage();
    let ann = create_user(&storage, json!({"name": "Ann"}));

    let (link, events) = create(
        &storage,
        "Friends",
        json!({"source": ann, "target": {"name": "Ben"}, "since": 2001}),
    );
    assert_eq!(link["since"], json!(2001));
    assert_eq!(link["source"]["id"], json!(ann));
    assert!(link["target"]["id"].is_i64());
    assert_eq!(
        summary(&events),
        vec![
            (MutationType::Create, "User".to_string()),
            (MutationType::Create, "Friends".to_string()),
        ]
    );

    let friends = storage
        .find_one("User", by_id(ann), &[AttributeQueryItem::name("friends")])
        .unwrap()
        .unwrap();
    assert_eq!(friends["friends"], json!([{"id": link["target"]["id"]}]));
}

// ============================================================================
// Combined rows
// ============================================================================

#[test]
fn test_flash_out_moves_profile_to_new_owner() {
    let storage = blog_storage();
    let ann = create_user(
        &storage,
        json!({"name": "Ann", "team": {"name": "Core"}, "profile": {"title": "Lead"}}),
    );
    let (ben, events) = create(&storage, "User", json!({"name": "Ben", "profile": {"id": 1}}));
    let ben = ben["id"].as_i64().unwrap();

    assert_eq!(
        summary(&events),
        vec![
            (MutationType::Create, "User".to_string()),
            (MutationType::Delete, "HasProfile".to_string()),
            (MutationType::Create, "HasProfile".to_string()),
        ]
    );

    let query = AttributeQueryItem::list_from_json(json!([
        "name",
        ["profile", {"attributeQuery": ["title"]}],
        ["team", {"attributeQuery": ["name"]}]
    ]))
    .unwrap();
    let ann_record = storage.find_one("User", by_id(ann), &query).unwrap().unwrap();
    assert!(!ann_record.contains_key("profile"));
    assert_eq!(ann_record["team"]["name"], json!("Core"));

    let ben_record = storage.find_one("User", by_id(ben), &query).unwrap().unwrap();
    assert_eq!(ben_record["profile"], json!({"id": 1, "title": "Lead"}));

    // exactly one row still holds the profile
    let profiles = storage
        .find("Profile", None, None, &[AttributeQueryItem::name("owner")])
        .unwrap();
    assert_eq!(profiles.len(), 1);
    assert_eq!(profiles[0]["owner"]["id"], json!(ben));
}

#[test]
fn test_unlinking_combined_relation_splits_row() {
    let storage = blog_storage();
    let ann = create_user(&storage, json!({"name": "Ann", "profile": {"title": "Lead"}}));

    let mut events = Vec::new();
    storage
        .delete("HasProfile", Some(MatchExp::equals("source.id", json!(ann))), &mut events)
        .unwrap();
    assert_eq!(summary(&events), vec![(MutationType::Delete, "HasProfile".to_string())]);

    let user = storage
        .find_one("User", by_id(ann), &[AttributeQueryItem::name("profile")])
        .unwrap()
        .unwrap();
    assert!(!user.contains_key("profile"));

    let profile = storage
        .find_one("Profile", by_id(1), &[AttributeQueryItem::name("*")])
        .unwrap()
        .unwrap();
    assert_eq!(profile["title"], json!("Lead"));
}

// ============================================================================
// Derived record events
// ============================================================================

fn chain_schema() -> Schema {
    Schema::new()
        .with_entity(
            Entity::new("Item")
                .property(Property::number("level"))
                .property(Property::boolean("enabled")),
        )
        .with_entity(Entity::filtered(
            "Enabled",
            "Item",
            MatchExp::equals("enabled", json!(true)),
        ))
        .with_entity(Entity::filtered(
            "Raised",
            "Enabled",
            MatchExp::with("level", Condition::Gte(json!(1))),
        ))
        .with_entity(Entity::filtered(
            "High",
            "Raised",
            MatchExp::with("level", Condition::Gte(json!(5))),
        ))
}

#[test]
fn test_three_level_filter_chain_events() {
    let storage = open_storage(chain_schema());
    let (_, events) = create(&storage, "Item", json!({"level": 7, "enabled": true}));
    assert_eq!(
        summary(&events),
        vec![
            (MutationType::Create, "Item".to_string()),
            (MutationType::Create, "Enabled".to_string()),
            (MutationType::Create, "Raised".to_string()),
            (MutationType::Create, "High".to_string()),
        ]
    );

    let mut events = Vec::new();
    storage
        .update("Item", by_id(1), &record(json!({"enabled": false})), &mut events)
        .unwrap();
    assert_eq!(
        summary(&events),
        vec![
            (MutationType::Update, "Item".to_string()),
            (MutationType::Delete, "High".to_string()),
            (MutationType::Delete, "Raised".to_string()),
            (MutationType::Delete, "Enabled".to_string()),
        ]
    );
}

#[test]
fn test_partial_filter_chain_events() {
    let storage = open_storage(chain_schema());
    let (_, events) = create(&storage, "Item", json!({"level": 2, "enabled": true}));
    assert_eq!(
        names(&events, MutationType::Create),
        vec!["Item", "Enabled", "Raised"]
    );

    let (_, events) = create(&storage, "Item", json!({"level": 9, "enabled": false}));
    assert_eq!(names(&events, MutationType::Create), vec!["Item"]);
}

// ============================================================================
// Merged entities
// ============================================================================

fn pet_schema() -> Schema {
    Schema::new()
        .with_entity(
            Entity::new("Dog")
                .property(Property::string("name"))
                .property(Property::string("sound").with_default(DefaultValue::constant(json!("woof")))),
        )
        .with_entity(
            Entity::new("Cat")
                .property(Property::string("name"))
                .property(Property::string("sound").with_default(DefaultValue::constant(json!("meow")))),
        )
        .with_entity(Entity::merged("Pet", &["Dog", "Cat"]))
        .with_entity(Entity::new("Person").property(Property::string("name")))
        .with_relation(
            Relation::new("Person", "pets", "Pet", "owner", RelationType::OneToMany)
                .with_name("Owns"),
        )
}

#[test]
fn test_merged_entity_inputs() {
    let storage = open_storage(pet_schema());
    let (dog, events) = create(&storage, "Dog", json!({"name": "Rex"}));
    create(&storage, "Cat", json!({"name": "Tom"}));

    assert_eq!(dog["sound"], json!("woof"));
    assert_eq!(dog["__Pet_input_entity"], json!(["Dog"]));
    assert_eq!(names(&events, MutationType::Create), vec!["Pet", "Dog"]);

    let count = |record: &str| storage.find(record, None, None, &[]).unwrap().len();
    assert_eq!(count("Pet"), 2);
    assert_eq!(count("Dog"), 1);
    assert_eq!(count("Cat"), 1);

    let cat = storage
        .find_one("Cat", None, &[AttributeQueryItem::name("*")])
        .unwrap()
        .unwrap();
    assert_eq!(cat["name"], json!("Tom"));
    assert_eq!(cat["sound"], json!("meow"));
}

#[test]
fn test_discriminator_is_engine_maintained() {
    let storage = open_storage(pet_schema());
    let mut events = Vec::new();
    let err = storage
        .create(
            "Dog",
            &record(json!({"name": "Rex", "__Pet_input_entity": ["Cat"]})),
            &mut events,
        )
        .unwrap_err();
    assert!(matches!(err, DbError::InvalidData(_)));
}

#[test]
fn test_relation_to_merged_entity() {
    let storage = open_storage(pet_schema());
    let (person, _) = create(
        &storage,
        "Person",
        json!({"name": "Liz", "pets": [{"name": "Rex"}]}),
    );
    create(&storage, "Dog", json!({"name": "Fido"}));

    let found = storage
        .find_one(
            "Person",
            by_id(person["id"].as_i64().unwrap()),
            &AttributeQueryItem::list_from_json(json!([["pets", {"attributeQuery": ["name"]}]]))
                .unwrap(),
        )
        .unwrap()
        .unwrap();
    assert_eq!(found["pets"], json!([{"id": 1, "name": "Rex"}]));
}

// ============================================================================
// Nested merged entities
// ============================================================================

fn party_schema() -> Schema {
    Schema::new()
        .with_entity(
            Entity::new("Customer")
                .property(Property::string("name"))
                .property(Property::string("tier").with_default(DefaultValue::constant(json!("basic")))),
        )
        .with_entity(
            Entity::new("Employee")
                .property(Property::string("name"))
                .property(Property::string("tier").with_default(DefaultValue::constant(json!("staff")))),
        )
        .with_entity(Entity::merged("Person", &["Customer", "Employee"]))
        .with_entity(Entity::new("Vendor").property(Property::string("name")))
        .with_entity(Entity::merged("Party", &["Person", "Vendor"]))
}

#[test]
fn test_nested_merged_entity_inputs() {
    let storage = open_storage(party_schema());
    let (customer, events) = create(&storage, "Customer", json!({"name": "Ann"}));
    create(&storage, "Employee", json!({"name": "Bo"}));
    create(&storage, "Vendor", json!({"name": "Acme"}));

    assert_eq!(names(&events, MutationType::Create), vec!["Party", "Person", "Customer"]);
    assert_eq!(customer["tier"], json!("basic"));
    assert_eq!(customer["__Person_input_entity"], json!(["Customer"]));
    assert_eq!(customer["__Party_input_entity"], json!(["Customer", "Person"]));

    let count = |record: &str| storage.find(record, None, None, &[]).unwrap().len();
    assert_eq!(count("Party"), 3);
    assert_eq!(count("Person"), 2);
    assert_eq!(count("Customer"), 1);
    assert_eq!(count("Employee"), 1);
    assert_eq!(count("Vendor"), 1);

    let employee = storage
        .find_one(
            "Person",
            Some(MatchExp::equals("name", json!("Bo"))),
            &[AttributeQueryItem::name("*")],
        )
        .unwrap()
        .unwrap();
    assert_eq!(employee["tier"], json!("staff"));
}

// ============================================================================
// Merged relations
// ============================================================================

fn repo_schema() -> Schema {
    Schema::new()
        .with_entity(Entity::new("User").property(Property::string("name")))
        .with_entity(Entity::new("Repo").property(Property::string("name")))
        .with_relation(
            Relation::new("User", "owns", "Repo", "owners", RelationType::OneToMany)
                .with_name("Owns")
                .property(Property::number("since")),
        )
        .with_relation(
            Relation::new("User", "watches", "Repo", "watchers", RelationType::ManyToMany)
                .with_name("Watches"),
        )
        .with_relation(Relation::merged("Touches", "touched", "touchedBy", &["Owns", "Watches"]))
}

#[test]
fn test_merged_relation_inputs_keep_own_duplicates() {
    let storage = open_storage(repo_schema());
    let (ann, _) = create(&storage, "User", json!({"name": "Ann"}));
    let (repo, _) = create(&storage, "Repo", json!({"name": "core"}));

    let mut events = Vec::new();
    storage
        .add_link("Watches", &ann["id"], &repo["id"], None, &mut events)
        .unwrap();
    // watching does not count as owning
    storage
        .add_link("Owns", &ann["id"], &repo["id"], None, &mut events)
        .unwrap();
    let err = storage
        .add_link("Owns", &ann["id"], &repo["id"], None, &mut events)
        .unwrap_err();
    assert!(matches!(err, DbError::DuplicateLink(_)));

    let count = |record: &str| storage.find(record, None, None, &[]).unwrap().len();
    assert_eq!(count("Touches"), 2);
    assert_eq!(count("Owns"), 1);
    assert_eq!(count("Watches"), 1);
}

#[test]
fn test_merged_relation_inputs_keep_own_cardinality() {
    let storage = open_storage(repo_schema());
    let (ann, _) = create(&storage, "User", json!({"name": "Ann"}));
    let (ben, _) = create(&storage, "User", json!({"name": "Ben"}));
    let (repo, _) = create(&storage, "Repo", json!({"name": "core"}));

    let mut events = Vec::new();
    storage
        .add_link("Owns", &ann["id"], &repo["id"], None, &mut events)
        .unwrap();
    storage
        .add_link("Watches", &ann["id"], &repo["id"], None, &mut events)
        .unwrap();
    storage
        .add_link("Watches", &ben["id"], &repo["id"], None, &mut events)
        .unwrap();

    // a repo has one owner, so the new owner replaces Ann
    let mut events = Vec::new();
    storage
        .add_link("Owns", &ben["id"], &repo["id"], None, &mut events)
        .unwrap();
    assert_eq!(names(&events, MutationType::Delete), vec!["Touches", "Owns"]);
    assert_eq!(names(&events, MutationType::Create), vec!["Touches", "Owns"]);
    assert_eq!(events[0].event_type, MutationType::Delete);

    let owners = storage
        .find(
            "Owns",
            Some(MatchExp::equals("target.id", repo["id"].clone())),
            None,
            &AttributeQueryItem::list_from_json(json!(["source"])).unwrap(),
        )
        .unwrap();
    assert_eq!(owners.len(), 1);
    assert_eq!(owners[0]["source"]["id"], ben["id"]);

    // watchers are many-to-many and survive the ownership change
    let watchers = storage
        .find(
            "Watches",
            Some(MatchExp::equals("target.id", repo["id"].clone())),
            None,
            &[],
        )
        .unwrap();
    assert_eq!(watchers.len(), 2);
}
