//! Table placement
//!
//! Decides where every relation is stored, groups records sharing rows into
//! tables and names the columns. The result is the immutable
//! [`EntityToTableMap`].
//!
//! | relation | placement |
//! |---|---|
//! | `1:1` with target reliance | combined (falls back to merged-to-source inside one table) |
//! | `1:1`, `n:1` | merged-to-source |
//! | `1:n` | merged-to-target |
//! | `n:n`, symmetric, merged | isolated |

use std::collections::{BTreeMap, HashMap};

use tracing::{debug, info};

use super::alias::shorten_identifier;
use super::map::{
    AttributeInfo, ColumnInfo, Direction, EntityToTableMap, JoinKind, LinkMapItem, LinkPlacement,
    RecordAttribute, RecordMapItem, TableInfo, ValueAttribute, ID_ATTRIBUTE,
};
use crate::driver::Database;
use crate::error::{DbError, DbResult};
use crate::schema::{Property, PropertyType, Relation, RelationType, Schema};

/// Builds the table map from a processed schema
pub struct DbSetup<'a> {
    schema: &'a Schema,
    identifier_limit: usize,
    /// Record -> chain of itself and its bases up to the stored root
    chains: HashMap<String, Vec<String>>,
    /// Union-find parent over stored roots
    parent: HashMap<String, String>,
    placements: HashMap<String, LinkPlacement>,
    /// Stored root -> table name
    table_of: HashMap<String, String>,
}

impl<'a> DbSetup<'a> {
    /// Map `schema` onto tables. The schema must already be processed by the
    /// merged item processor.
    pub fn build(schema: &'a Schema, identifier_limit: usize) -> DbResult<EntityToTableMap> {
        let mut setup = Self {
            schema,
            identifier_limit,
            chains: HashMap::new(),
            parent: HashMap::new(),
            placements: HashMap::new(),
            table_of: HashMap::new(),
        };

        setup.resolve_chains()?;
        setup.place_relations()?;
        let tables = setup.build_tables();
        let links = setup.build_links()?;
        let records = setup.build_records(&links)?;

        info!(
            "Mapped {} records onto {} tables",
            records.len(),
            tables.len()
        );
        Ok(EntityToTableMap::new(records, links, tables))
    }

    /// Execute the DDL of every table
    pub fn create_tables(map: &EntityToTableMap, db: &dyn Database) -> DbResult<()> {
        for table in map.tables() {
            db.execute(&table.create_sql(), &[], "create table")?;
            info!(
                "Table {} ready ({} records, {} columns)",
                table.name,
                table.records.len(),
                table.columns.len()
            );
        }
        Ok(())
    }

    fn field(&self, owner: &str, attribute: &str) -> String {
        shorten_identifier(&format!("{}_{}", owner, attribute), self.identifier_limit)
    }

    fn root(&self, record: &str) -> DbResult<&str> {
        self.chains
            .get(record)
            .and_then(|chain| chain.last())
            .map(String::as_str)
            .ok_or_else(|| DbError::RecordNotFound(record.to_string()))
    }

    fn resolve_chains(&mut self) -> DbResult<()> {
        let entity_bases: HashMap<&str, Option<&str>> = self
            .schema
            .entities
            .iter()
            .map(|e| (e.name.as_str(), e.base_entity.as_deref()))
            .collect();
        let names: Vec<String> = self.schema.relations.iter().map(Relation::name).collect();
        let relation_bases: HashMap<&str, Option<&str>> = names
            .iter()
            .zip(&self.schema.relations)
            .map(|(name, r)| (name.as_str(), r.base_relation.as_deref()))
            .collect();

        for bases in [&entity_bases, &relation_bases] {
            for name in bases.keys() {
                let mut chain = vec![name.to_string()];
                let mut current = *name;
                while let Some(Some(base)) = bases.get(current) {
                    if chain.len() > bases.len() {
                        return Err(DbError::InvalidSchema(format!(
                            "base chain of '{}' is cyclic",
                            name
                        )));
                    }
                    chain.push(base.to_string());
                    current = *base;
                }
                self.chains.insert(name.to_string(), chain);
            }
        }
        Ok(())
    }

    fn find(&self, name: &str) -> String {
        let mut current = name;
        while let Some(parent) = self.parent.get(current) {
            if parent == current {
                break;
            }
            current = parent;
        }
        current.to_string()
    }

    fn union(&mut self, a: &str, b: &str) {
        let (root_a, root_b) = (self.find(a), self.find(b));
        if root_a != root_b {
            self.parent.insert(root_b, root_a);
        }
    }

    fn stored_roots(&self) -> Vec<String> {
        self.schema
            .entities
            .iter()
            .filter(|e| !e.is_filtered())
            .map(|e| e.name.clone())
            .chain(
                self.schema
                    .relations
                    .iter()
                    .filter(|r| !r.is_filtered())
                    .map(Relation::name),
            )
            .collect()
    }

    fn place_relations(&mut self) -> DbResult<()> {
        for root in self.stored_roots() {
            self.parent.insert(root.clone(), root);
        }

        for relation in self.schema.relations.iter().filter(|r| !r.is_filtered()) {
            let name = relation.name();
            let source_root = self.root(&relation.source)?.to_string();
            let target_root = self.root(&relation.target)?.to_string();
            let is_merged = relation
                .properties
                .iter()
                .any(|p| p.discriminator_of.is_some());

            let placement = if relation.is_symmetric() || is_merged {
                LinkPlacement::Isolated
            } else {
                match relation.kind() {
                    RelationType::OneToOne if relation.is_target_reliance => {
                        if self.find(&source_root) == self.find(&target_root) {
                            LinkPlacement::MergedToSource
                        } else {
                            LinkPlacement::Combined
                        }
                    }
                    RelationType::OneToOne | RelationType::ManyToOne => {
                        LinkPlacement::MergedToSource
                    }
                    RelationType::OneToMany => LinkPlacement::MergedToTarget,
                    RelationType::ManyToMany => LinkPlacement::Isolated,
                }
            };

            match placement {
                LinkPlacement::Combined => {
                    self.union(&source_root, &target_root);
                    self.union(&source_root, &name);
                }
                LinkPlacement::MergedToSource => self.union(&source_root, &name),
                LinkPlacement::MergedToTarget => self.union(&target_root, &name),
                LinkPlacement::Isolated => {}
            }
            debug!("Relation {} placed {:?}", name, placement);
            self.placements.insert(name, placement);
        }
        Ok(())
    }

    fn properties_of(&self, root: &str) -> Vec<Property> {
        if let Some(entity) = self.schema.entity(root) {
            return entity.properties.clone();
        }
        self.schema
            .relations
            .iter()
            .find(|r| r.name() == root)
            .map(|r| r.properties.clone())
            .unwrap_or_default()
    }

    fn build_tables(&mut self) -> Vec<TableInfo> {
        let mut groups: Vec<(String, Vec<String>)> = Vec::new();
        for root in self.stored_roots() {
            let set = self.find(&root);
            match groups.iter_mut().find(|(s, _)| *s == set) {
                Some((_, members)) => members.push(root),
                None => groups.push((set, vec![root])),
            }
        }

        let mut tables = Vec::new();
        for (_, members) in groups {
            let name = shorten_identifier(&members[0], self.identifier_limit);
            let mut columns = Vec::new();
            let mut combined_links = Vec::new();

            for member in &members {
                columns.push(ColumnInfo {
                    name: self.field(member, ID_ATTRIBUTE),
                    owner: member.clone(),
                    sql_type: "INTEGER".to_string(),
                    is_id: true,
                });
                match self.placements.get(member) {
                    Some(LinkPlacement::Combined) => combined_links.push(member.clone()),
                    Some(placement) => {
                        for (side, needed) in [
                            ("source", *placement != LinkPlacement::MergedToSource),
                            ("target", *placement != LinkPlacement::MergedToTarget),
                        ] {
                            if needed {
                                columns.push(ColumnInfo {
                                    name: self.field(member, side),
                                    owner: member.clone(),
                                    sql_type: "INTEGER".to_string(),
                                    is_id: false,
                                });
                            }
                        }
                    }
                    None => {}
                }
                for property in self.properties_of(member) {
                    let sql_type = if property.is_json() {
                        "TEXT"
                    } else {
                        property.property_type.sql_type()
                    };
                    columns.push(ColumnInfo {
                        name: self.field(member, &property.name),
                        owner: member.clone(),
                        sql_type: sql_type.to_string(),
                        is_id: false,
                    });
                }
                self.table_of.insert(member.clone(), name.clone());
            }

            debug!("Table {} holds {:?}", name, members);
            tables.push(TableInfo {
                name,
                records: members,
                columns,
                combined_links,
            });
        }
        tables
    }

    fn table(&self, root: &str) -> DbResult<String> {
        self.table_of
            .get(root)
            .cloned()
            .ok_or_else(|| DbError::InvalidSchema(format!("record '{}' has no table", root)))
    }

    fn build_links(&self) -> DbResult<HashMap<String, LinkMapItem>> {
        let mut links = HashMap::new();
        for relation in &self.schema.relations {
            let name = relation.name();
            let root = self.root(&name)?.to_string();
            let placement = *self.placements.get(&root).ok_or_else(|| {
                DbError::InvalidSchema(format!("relation '{}' has no placement", root))
            })?;
            let source_field = match placement {
                LinkPlacement::MergedToTarget | LinkPlacement::Isolated => {
                    Some(self.field(&root, "source"))
                }
                _ => None,
            };
            let target_field = match placement {
                LinkPlacement::MergedToSource | LinkPlacement::Isolated => {
                    Some(self.field(&root, "target"))
                }
                _ => None,
            };
            links.insert(
                name.clone(),
                LinkMapItem {
                    name: name.clone(),
                    table: self.table(&root)?,
                    root,
                    source_record: relation.source.clone(),
                    target_record: relation.target.clone(),
                    source_property: relation.source_property.clone(),
                    target_property: relation.reverse_property(),
                    relation_type: relation.kind(),
                    placement,
                    is_symmetric: relation.is_symmetric(),
                    is_target_reliance: relation.is_target_reliance,
                    source_field,
                    target_field,
                },
            );
        }
        Ok(links)
    }

    /// How the record on the far side of `link` is reached from the `side` record
    fn entity_join(link: &LinkMapItem, side: Direction) -> JoinKind {
        let source = link.source_field.clone().unwrap_or_default();
        let target = link.target_field.clone().unwrap_or_default();
        match (link.placement, side) {
            (LinkPlacement::Combined, _) => JoinKind::SameRow,
            (LinkPlacement::MergedToSource, Direction::Source) => {
                JoinKind::ForeignKeyInParent { field: target }
            }
            (LinkPlacement::MergedToSource, Direction::Target) => {
                JoinKind::ForeignKeyInTarget { field: target }
            }
            (LinkPlacement::MergedToTarget, Direction::Source) => {
                JoinKind::ForeignKeyInTarget { field: source }
            }
            (LinkPlacement::MergedToTarget, Direction::Target) => {
                JoinKind::ForeignKeyInParent { field: source }
            }
            (LinkPlacement::Isolated, Direction::Source) => JoinKind::ThroughLinkTable {
                table: link.table.clone(),
                near_field: source,
                far_field: target,
            },
            (LinkPlacement::Isolated, Direction::Target) => JoinKind::ThroughLinkTable {
                table: link.table.clone(),
                near_field: target,
                far_field: source,
            },
        }
    }

    /// How the `endpoint` record is reached from the relation record's row
    fn endpoint_join(link: &LinkMapItem, endpoint: Direction) -> JoinKind {
        let field = match endpoint {
            Direction::Source => &link.source_field,
            Direction::Target => &link.target_field,
        };
        match field {
            Some(field) => JoinKind::ForeignKeyInParent {
                field: field.clone(),
            },
            None => JoinKind::SameRow,
        }
    }

    fn value_attributes(&self, root: &str) -> BTreeMap<String, AttributeInfo> {
        let mut attributes = BTreeMap::new();
        attributes.insert(
            ID_ATTRIBUTE.to_string(),
            AttributeInfo::Value(ValueAttribute {
                name: ID_ATTRIBUTE.to_string(),
                field: self.field(root, ID_ATTRIBUTE),
                property_type: PropertyType::Number,
                collection: false,
                is_json: false,
                default_value: None,
                discriminator_of: None,
            }),
        );
        for property in self.properties_of(root) {
            attributes.insert(
                property.name.clone(),
                AttributeInfo::Value(ValueAttribute {
                    field: self.field(root, &property.name),
                    name: property.name.clone(),
                    property_type: property.property_type,
                    collection: property.collection,
                    is_json: property.is_json(),
                    default_value: property.default_value.clone(),
                    discriminator_of: property.discriminator_of.clone(),
                }),
            );
        }
        attributes
    }

    fn build_records(
        &self,
        links: &HashMap<String, LinkMapItem>,
    ) -> DbResult<HashMap<String, RecordMapItem>> {
        let mut ordered: Vec<(String, bool)> = self
            .schema
            .entities
            .iter()
            .map(|e| (e.name.clone(), false))
            .chain(self.schema.relations.iter().map(|r| (r.name(), true)))
            .collect();
        // bases before the records filtering them
        ordered.sort_by_key(|(name, _)| self.chains.get(name).map(Vec::len).unwrap_or(0));

        let mut records: HashMap<String, RecordMapItem> = HashMap::new();
        for (name, is_relation) in ordered {
            let chain = self
                .chains
                .get(&name)
                .cloned()
                .ok_or_else(|| DbError::RecordNotFound(name.clone()))?;
            let root = chain.last().cloned().unwrap_or_else(|| name.clone());
            let base = chain.get(1).cloned();

            let (mut attributes, match_expression) = match &base {
                Some(base_name) => {
                    let base_item = records.get(base_name).ok_or_else(|| {
                        DbError::InvalidSchema(format!("base '{}' of '{}' is unknown", base_name, name))
                    })?;
                    let filter = if is_relation {
                        self.schema.relation(&name).and_then(|r| r.match_expression.clone())
                    } else {
                        self.schema.entity(&name).and_then(|e| e.match_expression.clone())
                    };
                    (base_item.attributes.clone(), filter)
                }
                None => (self.value_attributes(&root), None),
            };

            if is_relation && base.is_none() {
                let link = links
                    .get(&name)
                    .ok_or_else(|| DbError::RecordNotFound(name.clone()))?;
                for (endpoint, record) in [
                    (Direction::Source, &link.source_record),
                    (Direction::Target, &link.target_record),
                ] {
                    attributes.insert(
                        endpoint.as_str().to_string(),
                        AttributeInfo::Record(RecordAttribute {
                            name: endpoint.as_str().to_string(),
                            owner: name.clone(),
                            record: record.clone(),
                            relation: name.clone(),
                            relation_root: name.clone(),
                            is_source: endpoint == Direction::Source,
                            reverse: None,
                            is_collection: false,
                            is_symmetric: false,
                            direction: None,
                            is_reliance: false,
                            is_filtered_relation: false,
                            is_filtered_target: false,
                            is_endpoint: true,
                            join: Self::endpoint_join(link, endpoint),
                        }),
                    );
                }
            }

            if !is_relation {
                self.add_relation_attributes(&name, &mut attributes, links)?;
            }

            let filtered_by = if is_relation {
                self.schema
                    .relations
                    .iter()
                    .filter(|r| r.base_relation.as_deref() == Some(name.as_str()))
                    .map(Relation::name)
                    .collect()
            } else {
                self.schema
                    .entities
                    .iter()
                    .filter(|e| e.base_entity.as_deref() == Some(name.as_str()))
                    .map(|e| e.name.clone())
                    .collect()
            };

            records.insert(
                name.clone(),
                RecordMapItem {
                    name: name.clone(),
                    is_relation,
                    table: self.table(&root)?,
                    id_field: self.field(&root, ID_ATTRIBUTE),
                    root,
                    base,
                    match_expression,
                    filtered_by,
                    chain,
                    attributes,
                },
            );
        }
        Ok(records)
    }

    fn add_relation_attributes(
        &self,
        entity: &str,
        attributes: &mut BTreeMap<String, AttributeInfo>,
        links: &HashMap<String, LinkMapItem>,
    ) -> DbResult<()> {
        for relation in &self.schema.relations {
            let name = relation.name();
            let link = links
                .get(&name)
                .ok_or_else(|| DbError::RecordNotFound(name.clone()))?;
            let root_link = links
                .get(&link.root)
                .ok_or_else(|| DbError::RecordNotFound(link.root.clone()))?;

            let mut sides = Vec::new();
            if relation.source == entity {
                sides.push(Direction::Source);
            }
            if relation.target == entity && !relation.is_symmetric() {
                sides.push(Direction::Target);
            }

            for side in sides {
                let (attribute, record, reverse, is_collection) = match side {
                    Direction::Source => (
                        relation.source_property.clone(),
                        relation.target.clone(),
                        relation.reverse_property(),
                        !relation.kind().target_is_one(),
                    ),
                    Direction::Target => (
                        relation.reverse_property(),
                        relation.source.clone(),
                        relation.source_property.clone(),
                        !relation.kind().source_is_one(),
                    ),
                };
                let is_filtered_target = self
                    .schema
                    .entity(&record)
                    .is_some_and(|e| e.is_filtered());
                if attributes.contains_key(&attribute) {
                    return Err(DbError::InvalidSchema(format!(
                        "attribute '{}' of '{}' is declared twice",
                        attribute, entity
                    )));
                }
                attributes.insert(
                    attribute.clone(),
                    AttributeInfo::Record(RecordAttribute {
                        name: attribute,
                        owner: entity.to_string(),
                        record,
                        relation: name.clone(),
                        relation_root: link.root.clone(),
                        is_source: side == Direction::Source,
                        reverse: Some(reverse),
                        is_collection,
                        is_symmetric: relation.is_symmetric(),
                        direction: None,
                        is_reliance: side == Direction::Source && relation.is_target_reliance,
                        is_filtered_relation: relation.is_filtered(),
                        is_filtered_target,
                        is_endpoint: false,
                        join: Self::entity_join(root_link, side),
                    }),
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::merged::MergedItemProcessor;
    use crate::schema::{Entity, Property};

    fn build(schema: Schema) -> EntityToTableMap {
        let schema = MergedItemProcessor::process(schema).unwrap();
        DbSetup::build(&schema, 63).unwrap()
    }

    #[test]
    fn test_placements() {
        let map = build(
            Schema::new()
                .with_entity(Entity::new("User").property(Property::string("name")))
                .with_entity(Entity::new("Profile").property(Property::string("title")))
                .with_entity(Entity::new("Team"))
                .with_entity(Entity::new("Post"))
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
                        .with_name("Friends"),
                ),
        );

        assert_eq!(map.link("HasProfile").unwrap().placement, LinkPlacement::Combined);
        assert_eq!(map.link("InTeam").unwrap().placement, LinkPlacement::MergedToSource);
        assert_eq!(map.link("Wrote").unwrap().placement, LinkPlacement::MergedToTarget);
        assert_eq!(map.link("Friends").unwrap().placement, LinkPlacement::Isolated);

        let user_table = map.table(&map.record("User").unwrap().table).unwrap();
        assert_eq!(user_table.records, vec!["User", "Profile", "HasProfile", "InTeam"]);
        assert_eq!(user_table.combined_links, vec!["HasProfile".to_string()]);
        assert!(user_table.columns.iter().any(|c| c.name == "InTeam_target"));
        assert!(!user_table.columns.iter().any(|c| c.name == "InTeam_source"));

        let post_table = map.table(&map.record("Post").unwrap().table).unwrap();
        assert!(post_table.columns.iter().any(|c| c.name == "Wrote_source"));

        let friends = map.table("Friends").unwrap();
        let names: Vec<&str> = friends.columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["Friends_id", "Friends_source", "Friends_target"]);
    }

    #[test]
    fn test_reliant_self_relation_falls_back_to_merged() {
        let map = build(
            Schema::new()
                .with_entity(Entity::new("Node"))
                .with_relation(
                    Relation::new("Node", "next", "Node", "prev", RelationType::OneToOne)
                        .reliance()
                        .with_name("Next"),
                ),
        );
        assert_eq!(map.link("Next").unwrap().placement, LinkPlacement::MergedToSource);
    }

    #[test]
    fn test_long_names_are_shortened() {
        let long = "AnEntityWithAnExtremelyLongNameThatKeepsGoing";
        let schema = Schema::new().with_entity(
            Entity::new(long).property(Property::string("andAnAttributeNameJustAsLong")),
        );
        let schema = MergedItemProcessor::process(schema).unwrap();
        let map = DbSetup::build(&schema, 32).unwrap();
        let table = &map.tables()[0];
        assert!(table.name.chars().count() <= 32);
        assert!(table.columns.iter().all(|c| c.name.chars().count() <= 32));
        let sql = table.create_sql();
        assert!(sql.starts_with("CREATE TABLE IF NOT EXISTS"));
        // id columns reject a second row with the same id
        assert_eq!(sql.matches(" UNIQUE").count(), 1);
    }

    #[test]
    fn test_entity_join_for_each_placement() {
        let map = build(
            Schema::new()
                .with_entity(Entity::new("User"))
                .with_entity(Entity::new("Post"))
                .with_relation(
                    Relation::new("User", "posts", "Post", "author", RelationType::OneToMany)
                        .with_name("Wrote"),
                ),
        );
        let posts = map.get_attribute("User", "posts").unwrap();
        assert_eq!(
            posts.as_record().unwrap().join,
            JoinKind::ForeignKeyInTarget {
                field: "Wrote_source".to_string()
            }
        );
        let author = map.get_attribute("Post", "author").unwrap();
        assert_eq!(
            author.as_record().unwrap().join,
            JoinKind::ForeignKeyInParent {
                field: "Wrote_source".to_string()
            }
        );
        let source = map.get_attribute("Wrote", "source").unwrap();
        assert_eq!(
            source.as_record().unwrap().join,
            JoinKind::ForeignKeyInParent {
                field: "Wrote_source".to_string()
            }
        );
        let target = map.get_attribute("Wrote", "target").unwrap();
        assert_eq!(target.as_record().unwrap().join, JoinKind::SameRow);
    }
}
