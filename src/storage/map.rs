//! Entity to table map
//!
//! Immutable catalog built once by [`super::setup::DbSetup`]. It answers every
//! structural question the query and mutation layers ask: which table and
//! column hold an attribute, how a related record is reached from its owner's
//! row, which filters a derived record carries and which stored root it
//! resolves to.
//!
//! Attribute paths are dotted attribute names walked from a record. A segment
//! may carry a direction suffix (`friends:source`) selecting one side of a
//! symmetric relation, and the link symbol `&` steps from a record attribute
//! to its relation record.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

use crate::error::{DbError, DbResult};
use crate::query::match_exp::MatchExp;
use crate::schema::{DefaultValue, PropertyType, RelationType};

/// Path segment addressing the relation record of the preceding attribute
pub const LINK_SYMBOL: &str = "&";

/// Attribute every record exposes
pub const ID_ATTRIBUTE: &str = "id";

/// Table placement of a relation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum LinkPlacement {
    /// Source, target and relation share one row
    Combined,
    /// Relation fields live in the source row
    MergedToSource,
    /// Relation fields live in the target row
    MergedToTarget,
    /// Relation has its own table
    Isolated,
}

/// Side of a relation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Source,
    Target,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Source => "source",
            Direction::Target => "target",
        }
    }

    pub fn reverse(&self) -> Self {
        match self {
            Direction::Source => Direction::Target,
            Direction::Target => Direction::Source,
        }
    }
}

/// Split `friends:source` into the attribute name and its direction
pub fn split_direction(segment: &str) -> DbResult<(&str, Option<Direction>)> {
    match segment.split_once(':') {
        None => Ok((segment, None)),
        Some((name, "source")) => Ok((name, Some(Direction::Source))),
        Some((name, "target")) => Ok((name, Some(Direction::Target))),
        Some(_) => Err(DbError::invalid_path(
            segment,
            "direction must be ':source' or ':target'",
        )),
    }
}

/// How a related record is reached from its owner's row
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum JoinKind {
    /// Stored in the owner's row
    SameRow,
    /// Owner's row holds the related record's id in `field`
    ForeignKeyInParent { field: String },
    /// Related row holds the owner's id in `field`
    ForeignKeyInTarget { field: String },
    /// A relation table row links both ids
    ThroughLinkTable {
        table: String,
        near_field: String,
        far_field: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValueAttribute {
    pub name: String,
    pub field: String,
    pub property_type: PropertyType,
    pub collection: bool,
    pub is_json: bool,
    pub default_value: Option<DefaultValue>,
    /// Merged record whose direct inputs this column lists
    pub discriminator_of: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordAttribute {
    pub name: String,
    /// Record declaring the attribute
    pub owner: String,
    /// Record the attribute points at
    pub record: String,
    /// Relation record connecting both, possibly a filtered relation
    pub relation: String,
    /// Stored root of `relation`
    pub relation_root: String,
    /// Owner plays the relation's source side
    pub is_source: bool,
    /// Attribute on `record` pointing back, absent for relation endpoints
    pub reverse: Option<String>,
    pub is_collection: bool,
    pub is_symmetric: bool,
    /// Set when a symmetric attribute was addressed with a suffix
    pub direction: Option<Direction>,
    /// `record` relies on the owner
    pub is_reliance: bool,
    pub is_filtered_relation: bool,
    /// `record` is a filtered record, so reaching it must apply its filter
    pub is_filtered_target: bool,
    /// `source` / `target` of a relation record
    pub is_endpoint: bool,
    pub join: JoinKind,
}

impl RecordAttribute {
    /// Relation endpoint names (near, far) as seen from the owner
    pub fn near_far(&self) -> (&'static str, &'static str) {
        if self.is_source {
            ("source", "target")
        } else {
            ("target", "source")
        }
    }

    /// Symmetric attribute used without a direction suffix
    pub fn is_undirected_symmetric(&self) -> bool {
        self.is_symmetric && self.direction.is_none()
    }

    /// Can be fetched with a LEFT JOIN in the owner's statement
    pub fn is_joinable(&self) -> bool {
        !self.is_collection
            && !self.is_symmetric
            && !self.is_filtered_relation
            && !self.is_filtered_target
    }
}

/// Resolved attribute metadata
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum AttributeInfo {
    Value(ValueAttribute),
    Record(RecordAttribute),
    /// The relation record reached through `&`
    Link { relation: String },
}

impl AttributeInfo {
    pub fn as_value(&self) -> Option<&ValueAttribute> {
        match self {
            AttributeInfo::Value(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_record(&self) -> Option<&RecordAttribute> {
        match self {
            AttributeInfo::Record(record) => Some(record),
            _ => None,
        }
    }

    pub fn is_x_to_many(&self) -> bool {
        matches!(self, AttributeInfo::Record(r) if r.is_collection)
    }
}

/// One logical record (entity or relation, stored or derived)
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordMapItem {
    pub name: String,
    pub is_relation: bool,
    /// Stored root this record resolves to
    pub root: String,
    pub base: Option<String>,
    /// Filter relative to `base`
    pub match_expression: Option<MatchExp>,
    /// Direct filtered children
    pub filtered_by: Vec<String>,
    /// This record, its bases, up to the root
    pub chain: Vec<String>,
    pub table: String,
    pub id_field: String,
    pub attributes: BTreeMap<String, AttributeInfo>,
}

impl RecordMapItem {
    pub fn is_derived(&self) -> bool {
        self.base.is_some()
    }

    pub fn value_attributes(&self) -> impl Iterator<Item = &ValueAttribute> {
        self.attributes.values().filter_map(AttributeInfo::as_value)
    }

    pub fn record_attributes(&self) -> impl Iterator<Item = &RecordAttribute> {
        self.attributes.values().filter_map(AttributeInfo::as_record)
    }
}

/// Storage facts about a relation record
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkMapItem {
    pub name: String,
    /// Stored root relation
    pub root: String,
    pub source_record: String,
    pub target_record: String,
    pub source_property: String,
    pub target_property: String,
    pub relation_type: RelationType,
    pub placement: LinkPlacement,
    pub is_symmetric: bool,
    pub is_target_reliance: bool,
    pub table: String,
    /// Source id column, absent when the relation lives in the source row
    pub source_field: Option<String>,
    /// Target id column, absent when the relation lives in the target row
    pub target_field: Option<String>,
}

/// A physical column
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnInfo {
    pub name: String,
    /// Stored root record owning the column
    pub owner: String,
    pub sql_type: String,
    pub is_id: bool,
}

/// A physical table and the stored records sharing it
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TableInfo {
    pub name: String,
    pub records: Vec<String>,
    pub columns: Vec<ColumnInfo>,
    /// Combined relations linking records inside one row
    pub combined_links: Vec<String>,
}

impl TableInfo {
    pub fn id_columns(&self) -> impl Iterator<Item = &ColumnInfo> {
        self.columns.iter().filter(|c| c.is_id)
    }

    pub fn columns_of<'a>(&'a self, owner: &'a str) -> impl Iterator<Item = &'a ColumnInfo> {
        self.columns.iter().filter(move |c| c.owner == owner)
    }

    pub fn create_sql(&self) -> String {
        let columns: Vec<String> = self
            .columns
            .iter()
            .map(|c| {
                if c.is_id {
                    format!("\"{}\" {} UNIQUE", c.name, c.sql_type)
                } else {
                    format!("\"{}\" {}", c.name, c.sql_type)
                }
            })
            .collect();
        format!(
            "CREATE TABLE IF NOT EXISTS \"{}\" ({})",
            self.name,
            columns.join(", ")
        )
    }
}

/// One step of an attribute path with the table alias it is read from
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TableAliasEntry {
    pub record: String,
    pub table: String,
    pub alias: String,
    pub is_link_record: bool,
    pub parent_alias: String,
    pub parent_record: String,
    /// Join from the parent, `None` for `&` entries
    pub join: Option<JoinKind>,
    /// Relation table alias of a link-table hop
    pub link_alias: Option<String>,
}

/// Attribute names partitioned by storage
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttributeGroups {
    pub values: Vec<String>,
    /// Related records sharing the owner's row
    pub same_row: Vec<String>,
    /// Related records referenced from the owner's row
    pub foreign_key: Vec<String>,
    /// Related records needing their own statement
    pub separate: Vec<String>,
}

/// The catalog
#[derive(Debug, Clone, Serialize)]
pub struct EntityToTableMap {
    records: HashMap<String, RecordMapItem>,
    links: HashMap<String, LinkMapItem>,
    tables: Vec<TableInfo>,
}

impl EntityToTableMap {
    pub fn new(
        records: HashMap<String, RecordMapItem>,
        links: HashMap<String, LinkMapItem>,
        tables: Vec<TableInfo>,
    ) -> Self {
        Self {
            records,
            links,
            tables,
        }
    }

    pub fn record(&self, name: &str) -> DbResult<&RecordMapItem> {
        self.records
            .get(name)
            .ok_or_else(|| DbError::RecordNotFound(name.to_string()))
    }

    pub fn link(&self, name: &str) -> DbResult<&LinkMapItem> {
        self.links
            .get(name)
            .ok_or_else(|| DbError::RecordNotFound(name.to_string()))
    }

    pub fn table(&self, name: &str) -> DbResult<&TableInfo> {
        self.tables
            .iter()
            .find(|t| t.name == name)
            .ok_or_else(|| DbError::DatabaseError(format!("unknown table '{}'", name)))
    }

    pub fn tables(&self) -> &[TableInfo] {
        &self.tables
    }

    pub fn record_names(&self) -> impl Iterator<Item = &String> {
        self.records.keys()
    }

    /// DDL for every table
    pub fn create_table_statements(&self) -> Vec<String> {
        self.tables.iter().map(TableInfo::create_sql).collect()
    }

    /// Stored relations with `root` on either side
    pub fn links_of_root(&self, root: &str) -> Vec<&LinkMapItem> {
        let mut links: Vec<&LinkMapItem> = self
            .links
            .values()
            .filter(|link| link.name == link.root)
            .filter(|link| {
                self.root_of(&link.source_record) == Some(root)
                    || self.root_of(&link.target_record) == Some(root)
            })
            .collect();
        links.sort_by(|a, b| a.name.cmp(&b.name));
        links
    }

    fn root_of(&self, name: &str) -> Option<&str> {
        self.records.get(name).map(|r| r.root.as_str())
    }

    /// AND of every filter between `name` and its stored root
    pub fn record_filter(&self, name: &str) -> DbResult<Option<MatchExp>> {
        let item = self.record(name)?;
        let mut filters = Vec::new();
        for record in &item.chain {
            filters.extend(self.record(record)?.match_expression.clone());
        }
        Ok(MatchExp::all(filters))
    }

    /// Discriminator values to write when a record is created as `name`.
    ///
    /// A discriminator column lists every record on the chain from `name` up to
    /// the direct input of the merged record owning the column.
    pub fn stamps(&self, name: &str) -> DbResult<Vec<(String, Vec<String>)>> {
        let item = self.record(name)?;
        let root = self.record(&item.root)?;
        let mut stamps = Vec::new();
        for attribute in root.value_attributes() {
            let Some(owner) = &attribute.discriminator_of else {
                continue;
            };
            if let Some(position) = item.chain.iter().position(|r| r == owner) {
                if position > 0 {
                    stamps.push((attribute.name.clone(), item.chain[..position].to_vec()));
                }
            }
        }
        Ok(stamps)
    }

    /// Every filtered descendant of `name`, parents before children
    pub fn descendants(&self, name: &str) -> DbResult<Vec<String>> {
        let mut out = Vec::new();
        for child in &self.record(name)?.filtered_by {
            out.push(child.clone());
            out.extend(self.descendants(child)?);
        }
        Ok(out)
    }

    /// Resolve one attribute of `record`, honouring a direction suffix
    pub fn get_attribute(&self, record: &str, segment: &str) -> DbResult<AttributeInfo> {
        let (name, direction) = split_direction(segment)?;
        let item = self.record(record)?;
        let info = item
            .attributes
            .get(name)
            .ok_or_else(|| DbError::attribute_not_found(record, name))?;

        match (info, direction) {
            (info, None) => Ok(info.clone()),
            (AttributeInfo::Record(attribute), Some(direction)) if attribute.is_symmetric => {
                let link = self.link(&attribute.relation_root)?;
                let mut attribute = attribute.clone();
                let (near, far) = match direction {
                    Direction::Source => (&link.source_field, &link.target_field),
                    Direction::Target => (&link.target_field, &link.source_field),
                };
                attribute.direction = Some(direction);
                attribute.is_source = direction == Direction::Source;
                attribute.reverse = Some(format!("{}:{}", name, direction.reverse().as_str()));
                attribute.join = JoinKind::ThroughLinkTable {
                    table: link.table.clone(),
                    near_field: near.clone().unwrap_or_default(),
                    far_field: far.clone().unwrap_or_default(),
                };
                Ok(AttributeInfo::Record(attribute))
            }
            (_, Some(_)) => Err(DbError::invalid_path(
                segment,
                "direction suffix is only valid on symmetric relations",
            )),
        }
    }

    /// Metadata of the attribute a path ends at
    pub fn get_info(&self, record: &str, path: &[String]) -> DbResult<AttributeInfo> {
        let mut current = record.to_string();
        let mut last: Option<AttributeInfo> = None;

        for (index, segment) in path.iter().enumerate() {
            let info = if segment == LINK_SYMBOL {
                match &last {
                    Some(AttributeInfo::Record(attribute)) => AttributeInfo::Link {
                        relation: attribute.relation.clone(),
                    },
                    _ => {
                        return Err(DbError::invalid_path(
                            path.join("."),
                            "link symbol must follow a record attribute",
                        ))
                    }
                }
            } else {
                self.get_attribute(&current, segment)?
            };

            if index + 1 < path.len() {
                current = match &info {
                    AttributeInfo::Record(attribute) => attribute.record.clone(),
                    AttributeInfo::Link { relation } => relation.clone(),
                    AttributeInfo::Value(_) => {
                        return Err(DbError::invalid_path(
                            path.join("."),
                            format!("'{}' is a value attribute", segment),
                        ))
                    }
                };
            }
            last = Some(info);
        }

        last.ok_or_else(|| DbError::invalid_path(record, "empty attribute path"))
    }

    /// Record reached at the end of `path`
    pub fn get_record_by_path(&self, record: &str, path: &[String]) -> DbResult<String> {
        if path.is_empty() {
            return Ok(record.to_string());
        }
        match self.get_info(record, path)? {
            AttributeInfo::Record(attribute) => Ok(attribute.record),
            AttributeInfo::Link { relation } => Ok(relation),
            AttributeInfo::Value(_) => Err(DbError::invalid_path(
                path.join("."),
                "path ends at a value attribute",
            )),
        }
    }

    /// Aliases of every step of `path`, starting at `root_alias`.
    ///
    /// Records merged into their parent's row reuse the parent alias, other
    /// steps get an alias derived from the path.
    pub fn get_table_and_alias_stack(
        &self,
        record: &str,
        path: &[String],
        root_alias: &str,
    ) -> DbResult<Vec<TableAliasEntry>> {
        let mut stack: Vec<TableAliasEntry> = Vec::new();
        let mut current = self.record(record)?.clone();
        let mut alias = root_alias.to_string();
        let mut prefix = root_alias.to_string();

        for (index, segment) in path.iter().enumerate() {
            if segment == LINK_SYMBOL {
                let hop = stack
                    .last()
                    .filter(|e| !e.is_link_record)
                    .cloned()
                    .ok_or_else(|| {
                        DbError::invalid_path(
                            path.join("."),
                            "link symbol must follow a record attribute",
                        )
                    })?;
                let attribute = self.get_info(record, &path[..index])?;
                let relation = match attribute {
                    AttributeInfo::Record(attribute) => attribute.relation_root,
                    _ => {
                        return Err(DbError::invalid_path(
                            path.join("."),
                            "link symbol must follow a record attribute",
                        ))
                    }
                };
                let link_alias = match &hop.join {
                    Some(JoinKind::SameRow) | Some(JoinKind::ForeignKeyInParent { .. }) => {
                        hop.parent_alias.clone()
                    }
                    Some(JoinKind::ForeignKeyInTarget { .. }) => hop.alias.clone(),
                    Some(JoinKind::ThroughLinkTable { .. }) => {
                        hop.link_alias.clone().unwrap_or_default()
                    }
                    None => hop.alias.clone(),
                };
                let relation_item = self.record(&relation)?.clone();
                stack.push(TableAliasEntry {
                    record: relation.clone(),
                    table: relation_item.table.clone(),
                    alias: link_alias.clone(),
                    is_link_record: true,
                    parent_alias: hop.alias.clone(),
                    parent_record: hop.record.clone(),
                    join: None,
                    link_alias: None,
                });
                alias = link_alias;
                prefix = format!("{}_REL", prefix);
                current = relation_item;
                continue;
            }

            let attribute = match self.get_attribute(&current.name, segment)? {
                AttributeInfo::Record(attribute) => attribute,
                _ => {
                    return Err(DbError::invalid_path(
                        path.join("."),
                        format!("'{}' is not a record attribute", segment),
                    ))
                }
            };
            let target = self.record(&attribute.record)?.clone();
            prefix = format!("{}_{}", prefix, segment.replace(':', "_"));
            let next_alias = if attribute.join == JoinKind::SameRow {
                alias.clone()
            } else {
                prefix.clone()
            };
            let link_alias = match attribute.join {
                JoinKind::ThroughLinkTable { .. } => Some(format!("{}_LINK", prefix)),
                _ => None,
            };
            stack.push(TableAliasEntry {
                record: target.name.clone(),
                table: target.table.clone(),
                alias: next_alias.clone(),
                is_link_record: false,
                parent_alias: alias.clone(),
                parent_record: current.name.clone(),
                join: Some(attribute.join.clone()),
                link_alias,
            });
            alias = next_alias;
            current = target;
        }

        Ok(stack)
    }

    /// Column holding `attribute` of the record at the end of `path`.
    ///
    /// Reading only the `id` of a record referenced by a foreign key or link
    /// row reads that column instead, unless `dont_shrink` is set.
    pub fn get_table_alias_and_field_name(
        &self,
        record: &str,
        path: &[String],
        attribute: &str,
        dont_shrink: bool,
        root_alias: &str,
    ) -> DbResult<(String, String, String)> {
        let stack = self.get_table_and_alias_stack(record, path, root_alias)?;
        let (alias, record_name, table) = match stack.last() {
            None => {
                let item = self.record(record)?;
                (root_alias.to_string(), item.name.clone(), item.table.clone())
            }
            Some(last) => {
                if attribute == ID_ATTRIBUTE && !dont_shrink && !last.is_link_record {
                    match &last.join {
                        Some(JoinKind::ForeignKeyInParent { field }) => {
                            let parent = self.record(&last.parent_record)?;
                            return Ok((last.parent_alias.clone(), field.clone(), parent.table.clone()));
                        }
                        Some(JoinKind::ThroughLinkTable {
                            table, far_field, ..
                        }) => {
                            return Ok((
                                last.link_alias.clone().unwrap_or_default(),
                                far_field.clone(),
                                table.clone(),
                            ))
                        }
                        _ => {}
                    }
                }
                (last.alias.clone(), last.record.clone(), last.table.clone())
            }
        };

        let field = match self.get_attribute(&record_name, attribute)? {
            AttributeInfo::Value(value) => value.field,
            _ => {
                return Err(DbError::invalid_path(
                    format!("{}.{}", path.join("."), attribute),
                    "not a value attribute",
                ))
            }
        };
        Ok((alias, field, table))
    }

    /// Name of the attribute on the related record pointing back
    pub fn get_reverse_attribute(&self, record: &str, attribute: &str) -> DbResult<String> {
        match self.get_attribute(record, attribute)? {
            AttributeInfo::Record(RecordAttribute {
                reverse: Some(reverse),
                ..
            }) => Ok(reverse),
            _ => Err(DbError::invalid_path(
                attribute,
                "attribute has no reverse",
            )),
        }
    }

    /// Inverse traversal of `path`: the record it ends at and the path back
    pub fn get_reverse_path(&self, record: &str, path: &[String]) -> DbResult<(String, Vec<String>)> {
        let mut current = record.to_string();
        let mut reversed = Vec::with_capacity(path.len());
        for segment in path {
            if segment == LINK_SYMBOL {
                return Err(DbError::invalid_path(
                    path.join("."),
                    "paths through a relation record cannot be reversed",
                ));
            }
            let reverse = self.get_reverse_attribute(&current, segment)?;
            current = self.get_record_by_path(&current, std::slice::from_ref(segment))?;
            reversed.push(reverse);
        }
        reversed.reverse();
        Ok((current, reversed))
    }

    /// Index of the first undirected symmetric attribute in `path`
    pub fn find_many_to_many_symmetric_path(
        &self,
        record: &str,
        path: &[String],
    ) -> DbResult<Option<usize>> {
        let mut current = record.to_string();
        for (index, segment) in path.iter().enumerate() {
            if segment == LINK_SYMBOL {
                current = self.get_record_by_path(record, &path[..=index])?;
                continue;
            }
            match self.get_attribute(&current, segment)? {
                AttributeInfo::Record(attribute) => {
                    if attribute.is_undirected_symmetric() {
                        return Ok(Some(index));
                    }
                    current = attribute.record;
                }
                _ => return Ok(None),
            }
        }
        Ok(None)
    }

    /// Split a path at its first undirected symmetric attribute into the
    /// `:source` and `:target` variants
    pub fn spawn_many_to_many_symmetric_path(
        &self,
        record: &str,
        path: &[String],
    ) -> DbResult<Option<(Vec<String>, Vec<String>)>> {
        let Some(index) = self.find_many_to_many_symmetric_path(record, path)? else {
            return Ok(None);
        };
        let mut source = path.to_vec();
        let mut target = path.to_vec();
        source[index] = format!("{}:source", path[index]);
        target[index] = format!("{}:target", path[index]);
        Ok(Some((source, target)))
    }

    /// Partition attribute names of `record` by how they are stored
    pub fn group_attributes(&self, record: &str, names: &[String]) -> DbResult<AttributeGroups> {
        let mut groups = AttributeGroups::default();
        for name in names {
            match self.get_attribute(record, name)? {
                AttributeInfo::Value(_) => groups.values.push(name.clone()),
                AttributeInfo::Record(attribute) if attribute.is_filtered_relation => {
                    groups.separate.push(name.clone())
                }
                AttributeInfo::Record(attribute) => match attribute.join {
                    JoinKind::SameRow => groups.same_row.push(name.clone()),
                    JoinKind::ForeignKeyInParent { .. } => groups.foreign_key.push(name.clone()),
                    _ => groups.separate.push(name.clone()),
                },
                AttributeInfo::Link { .. } => {
                    return Err(DbError::invalid_path(name, "link symbol is not an attribute"))
                }
            }
        }
        Ok(groups)
    }
}
