//! Record creation and linking
//!
//! Creating a record fills one physical row. Records that share the row
//! (combined 1:1 relations) are placed into it recursively, records the row
//! points at through a foreign key are created first, and everything stored
//! elsewhere is created and linked once the row exists. Linking enforces the
//! exclusive side of x:1 relations by unlinking the previous occupant, and a
//! combined link moves the target's part of its row into the source row.

use serde_json::{json, Value};
use std::collections::HashMap;
use tracing::debug;

use super::filtered::FilteredEntityManager;
use super::{NewRecordData, RecordMutationEvent, RelatedItem};
use crate::config::EngineConfig;
use crate::driver::{Database, Row};
use crate::error::{DbError, DbResult};
use crate::query::builder::{ColumnValue, SqlBuilder, Statement};
use crate::query::match_exp::MatchExp;
use crate::query::record_query::{AttributeQueryItem, ALL_ATTRIBUTES};
use crate::query::{QueryExecutor, Record};
use crate::storage::map::{
    AttributeInfo, EntityToTableMap, JoinKind, LinkMapItem, LinkPlacement, RecordAttribute,
    RecordMapItem, TableInfo, ID_ATTRIBUTE,
};

/// A stored link between two records
#[derive(Debug, Clone, PartialEq)]
pub struct LinkRecord {
    /// Stored root relation
    pub relation: String,
    pub id: Value,
    pub source: Value,
    pub target: Value,
    /// Value attributes, as reported in events
    pub record: Record,
}

/// Columns of one row being inserted and the records it holds
#[derive(Debug, Default)]
struct RowBuilder {
    columns: Vec<ColumnValue>,
    records: Vec<(String, Record)>,
}

impl RowBuilder {
    fn set(&mut self, column: ColumnValue) {
        match self.columns.iter_mut().find(|c| c.field == column.field) {
            Some(existing) => *existing = column,
            None => self.columns.push(column),
        }
    }
}

/// Related record to create or link once the owner's row exists
struct PendingLink {
    owner_id: Value,
    attribute: RecordAttribute,
    item: RelatedItem,
    /// Attach the result to the returned record
    top_level: bool,
}

pub struct CreationExecutor<'a> {
    map: &'a EntityToTableMap,
    db: &'a dyn Database,
    config: &'a EngineConfig,
    queries: QueryExecutor<'a>,
}

impl<'a> CreationExecutor<'a> {
    pub fn new(map: &'a EntityToTableMap, db: &'a dyn Database, config: &'a EngineConfig) -> Self {
        Self {
            map,
            db,
            config,
            queries: QueryExecutor::new(map, db, config),
        }
    }

    pub fn queries(&self) -> QueryExecutor<'a> {
        self.queries
    }

    pub fn filtered(&self) -> FilteredEntityManager<'a> {
        FilteredEntityManager::new(self.map, self.queries)
    }

    pub(crate) fn builder(&self) -> SqlBuilder<'a> {
        SqlBuilder::new(self.map, self.db.placeholder(), self.config.identifier_limit)
    }

    pub(crate) fn execute(&self, statement: Statement, name: &str) -> DbResult<usize> {
        self.db.execute(&statement.sql, &statement.params, name)
    }

    /// Raw row of `table` whose `key_field` is `key`
    pub(crate) fn read_row(&self, table: &str, key_field: &str, key: &Value) -> DbResult<Option<Row>> {
        let statement = self.builder().select_row(table, key_field, key);
        Ok(self
            .db
            .query(&statement.sql, &statement.params, table)?
            .into_iter()
            .next())
    }

    // ==================== Create ====================

    /// Create a record of `record_name` from `data`, returning it with its id
    /// and the ids of the related records created or linked with it
    pub fn create_record(
        &self,
        record_name: &str,
        data: &Record,
        events: &mut Vec<RecordMutationEvent>,
    ) -> DbResult<Record> {
        if self.map.record(record_name)?.is_relation {
            return self.create_link_record(record_name, data, events);
        }
        let new = NewRecordData::parse(self.map, record_name, data)?;
        self.create(&new, events)
    }

    /// Relation records are created by linking their endpoints
    fn create_link_record(
        &self,
        relation: &str,
        data: &Record,
        events: &mut Vec<RecordMutationEvent>,
    ) -> DbResult<Record> {
        let link = self.map.link(relation)?;
        let mut values = data.clone();
        values.remove(ID_ATTRIBUTE);
        let source = values
            .remove("source")
            .ok_or_else(|| DbError::InvalidData(format!("{} needs a source", relation)))?;
        let target = values
            .remove("target")
            .ok_or_else(|| DbError::InvalidData(format!("{} needs a target", relation)))?;
        let source = self.resolve_endpoint(&link.source_record, source, events)?;
        let target = self.resolve_endpoint(&link.target_record, target, events)?;
        self.add_link(relation, &source, &target, &values, events)
    }

    fn resolve_endpoint(
        &self,
        record_name: &str,
        value: Value,
        events: &mut Vec<RecordMutationEvent>,
    ) -> DbResult<Value> {
        match RelatedItem::parse(self.map, record_name, &value)? {
            RelatedItem::Existing { id, .. } => Ok(id),
            RelatedItem::New(data) => {
                let record = self.create(&data, events)?;
                record_id(&record)
            }
        }
    }

    pub(crate) fn create(&self, new: &NewRecordData, events: &mut Vec<RecordMutationEvent>) -> DbResult<Record> {
        let item = self.map.record(&new.record_name)?;
        let mut row = RowBuilder::default();
        let mut pending = Vec::new();
        let mut record = self.place(new, &mut row, &mut pending, true, events)?;

        let statement = self.builder().insert(&item.table, &row.columns);
        self.db.insert(&statement.sql, &statement.params, &item.root)?;
        debug!(
            "Inserted {} row holding {} records",
            item.table,
            row.records.len()
        );
        for (name, placed) in &row.records {
            events.push(RecordMutationEvent::create(name.clone(), placed.clone()));
        }

        for link in pending {
            let target = self.resolve_pending(&link, events)?;
            if link.top_level {
                attach(&mut record, &link.attribute, target);
            }
        }

        for (name, placed) in &row.records {
            events.extend(self.filtered().creation_events(name, &record_id(placed)?)?);
        }
        Ok(record)
    }

    /// Put `new` into `row`, creating foreign-key dependencies first
    fn place(
        &self,
        new: &NewRecordData,
        row: &mut RowBuilder,
        pending: &mut Vec<PendingLink>,
        top_level: bool,
        events: &mut Vec<RecordMutationEvent>,
    ) -> DbResult<Record> {
        let item = self.map.record(&new.record_name)?;
        let root = self.map.record(&item.root)?;
        let id = match &new.id {
            Some(id) => {
                self.claim_id(root, id)?;
                id.clone()
            }
            None => Value::from(self.db.get_auto_id(&item.root)?),
        };

        let mut record = Record::new();
        record.insert(ID_ATTRIBUTE.to_string(), id.clone());
        row.set(ColumnValue::new(&root.id_field, id.clone()));
        for (attribute, value) in &new.values {
            row.set(ColumnValue::for_attribute(attribute, value.clone()));
            record.insert(attribute.name.clone(), value.clone());
        }
        self.apply_defaults(item, &mut record, row)?;
        row.records.push((item.root.clone(), record.clone()));

        for related in &new.related {
            let attribute = &related.attribute;
            for target in &related.items {
                let in_row = !attribute.is_filtered_relation
                    && match (&attribute.join, target) {
                        (JoinKind::SameRow, RelatedItem::New(_)) => true,
                        (JoinKind::ForeignKeyInParent { .. }, _) => true,
                        _ => false,
                    };
                if !in_row {
                    pending.push(PendingLink {
                        owner_id: id.clone(),
                        attribute: attribute.clone(),
                        item: target.clone(),
                        top_level,
                    });
                    continue;
                }

                let placed = match target {
                    RelatedItem::New(data) if attribute.join == JoinKind::SameRow => {
                        self.place(data, row, pending, false, events)?
                    }
                    RelatedItem::New(data) => self.create(data, events)?,
                    RelatedItem::Existing { id: target_id, .. } => {
                        self.release_far_side(attribute, target_id, events)?;
                        single(ID_ATTRIBUTE, target_id.clone())
                    }
                };
                let (source, target_id) = orient(attribute, &id, &record_id(&placed)?);
                self.place_link(&attribute.relation, &source, &target_id, target.link(), row)?;
                record.insert(attribute.name.clone(), Value::Object(placed));
            }
        }
        Ok(record)
    }

    /// Take a caller-supplied id: it must be free, and later auto ids skip it
    fn claim_id(&self, root: &RecordMapItem, id: &Value) -> DbResult<()> {
        if self.read_row(&root.table, &root.id_field, id)?.is_some() {
            return Err(DbError::DuplicateRecord(format!("{} {}", root.name, id)));
        }
        if let Some(id) = id.as_i64() {
            self.db.reserve_id(&root.name, id)?;
        }
        Ok(())
    }

    /// Write the relation columns of a link stored in the row being built
    fn place_link(
        &self,
        relation: &str,
        source: &Value,
        target: &Value,
        values: &Record,
        row: &mut RowBuilder,
    ) -> DbResult<()> {
        let relation_item = self.map.record(relation)?;
        let link = self.map.link(&relation_item.root)?;
        let id = Value::from(self.db.get_auto_id(&link.root)?);
        let record = self.link_columns(relation_item, link, &id, source, target, values, row)?;
        row.records.push((link.root.clone(), record));
        Ok(())
    }

    /// Relation id, values, defaults and present foreign keys of one link
    #[allow(clippy::too_many_arguments)]
    fn link_columns(
        &self,
        relation_item: &RecordMapItem,
        link: &LinkMapItem,
        id: &Value,
        source: &Value,
        target: &Value,
        values: &Record,
        row: &mut RowBuilder,
    ) -> DbResult<Record> {
        let root = self.map.record(&link.root)?;
        let mut record = Record::new();
        record.insert(ID_ATTRIBUTE.to_string(), id.clone());
        row.set(ColumnValue::new(&root.id_field, id.clone()));

        for (key, value) in values {
            if key == ID_ATTRIBUTE {
                continue;
            }
            match self.map.get_attribute(&relation_item.name, key)? {
                AttributeInfo::Value(attribute) if attribute.discriminator_of.is_none() => {
                    row.set(ColumnValue::for_attribute(&attribute, value.clone()));
                    record.insert(key.clone(), value.clone());
                }
                _ => {
                    return Err(DbError::InvalidData(format!(
                        "'{}' is not a value attribute of {}",
                        key, relation_item.name
                    )))
                }
            }
        }
        self.apply_defaults(relation_item, &mut record, row)?;

        if let Some(field) = &link.source_field {
            row.set(ColumnValue::new(field, source.clone()));
        }
        if let Some(field) = &link.target_field {
            row.set(ColumnValue::new(field, target.clone()));
        }
        record.insert("source".to_string(), Value::Object(single(ID_ATTRIBUTE, source.clone())));
        record.insert("target".to_string(), Value::Object(single(ID_ATTRIBUTE, target.clone())));
        Ok(record)
    }

    /// Defaults for missing values, then discriminator stamps
    fn apply_defaults(&self, item: &RecordMapItem, record: &mut Record, row: &mut RowBuilder) -> DbResult<()> {
        let root = self.map.record(&item.root)?;
        for attribute in root.value_attributes() {
            if attribute.name == ID_ATTRIBUTE
                || attribute.discriminator_of.is_some()
                || record.contains_key(&attribute.name)
            {
                continue;
            }
            let Some(default) = &attribute.default_value else {
                continue;
            };
            // the concrete type decides a by-type default, falling back along the chain
            if let Some(value) = item.chain.iter().find_map(|name| default.resolve(record, name)) {
                row.set(ColumnValue::for_attribute(attribute, value.clone()));
                record.insert(attribute.name.clone(), value);
            }
        }

        for (name, stamp) in self.map.stamps(&item.name)? {
            let attribute = root
                .value_attributes()
                .find(|a| a.name == name)
                .ok_or_else(|| DbError::attribute_not_found(&root.name, &name))?;
            let value = json!(stamp);
            row.set(ColumnValue::for_attribute(attribute, value.clone()));
            record.insert(name, value);
        }
        Ok(())
    }

    fn resolve_pending(&self, link: &PendingLink, events: &mut Vec<RecordMutationEvent>) -> DbResult<Record> {
        self.attach_item(&link.owner_id, &link.attribute, &link.item, events)
    }

    /// Create `item` if needed and link it to `owner_id` through `attribute`
    pub(crate) fn attach_item(
        &self,
        owner_id: &Value,
        attribute: &RecordAttribute,
        item: &RelatedItem,
        events: &mut Vec<RecordMutationEvent>,
    ) -> DbResult<Record> {
        let target = match item {
            RelatedItem::Existing { id, .. } => single(ID_ATTRIBUTE, id.clone()),
            RelatedItem::New(data) => self.create(data, events)?,
        };
        let (source, target_id) = orient(attribute, owner_id, &record_id(&target)?);
        self.link(&attribute.relation, &source, &target_id, item.link(), events)?;
        Ok(target)
    }

    // ==================== Links ====================

    /// Link two stored records, failing when either does not exist
    pub fn add_link(
        &self,
        relation: &str,
        source: &Value,
        target: &Value,
        values: &Record,
        events: &mut Vec<RecordMutationEvent>,
    ) -> DbResult<Record> {
        let link = self.map.link(relation)?;
        for (record_name, id) in [(&link.source_record, source), (&link.target_record, target)] {
            let found = self.queries.find_one(
                record_name,
                Some(MatchExp::equals(ID_ATTRIBUTE, id.clone())),
                &[],
            )?;
            if found.is_none() {
                return Err(DbError::RowNotFound(format!("{} {}", record_name, id)));
            }
        }
        self.link(relation, source, target, values, events)
    }

    /// Store the link `source -> target` of `relation`
    pub fn link(
        &self,
        relation: &str,
        source: &Value,
        target: &Value,
        values: &Record,
        events: &mut Vec<RecordMutationEvent>,
    ) -> DbResult<Record> {
        let relation_item = self.map.record(relation)?;
        let link = self.map.link(&relation_item.root)?;
        let rules = self.governing_link(relation)?;

        let exists = self.find_link(&rules.name, source, target)?.is_some()
            || (rules.is_symmetric && self.find_link(&rules.name, target, source)?.is_some());
        if exists {
            return Err(DbError::DuplicateLink(format!("{}({}, {})", relation, source, target)));
        }
        if rules.relation_type.target_is_one() {
            self.unlink_where(&rules.name, "source", source, events)?;
        }
        if rules.relation_type.source_is_one() {
            self.unlink_where(&rules.name, "target", target, events)?;
        }

        let id = Value::from(self.db.get_auto_id(&link.root)?);
        let mut row = RowBuilder::default();
        let record = self.link_columns(relation_item, link, &id, source, target, values, &mut row)?;

        match link.placement {
            LinkPlacement::Isolated => {
                let statement = self.builder().insert(&link.table, &row.columns);
                self.db.insert(&statement.sql, &statement.params, &link.root)?;
            }
            LinkPlacement::MergedToSource => {
                let owner = self.map.record(&self.map.record(&link.source_record)?.root)?;
                self.update_row(&link.table, &row.columns, &owner.id_field, source, &link.root)?;
            }
            LinkPlacement::MergedToTarget => {
                let owner = self.map.record(&self.map.record(&link.target_record)?.root)?;
                self.update_row(&link.table, &row.columns, &owner.id_field, target, &link.root)?;
            }
            LinkPlacement::Combined => self.join_combined(link, source, target, row.columns)?,
        }
        debug!("Linked {} {} -> {} ({:?})", link.root, source, target, link.placement);

        events.push(RecordMutationEvent::create(link.root.clone(), record.clone()));
        events.extend(self.filtered().creation_events(&link.root, &id)?);
        Ok(record)
    }

    fn update_row(&self, table: &str, columns: &[ColumnValue], key_field: &str, key: &Value, name: &str) -> DbResult<()> {
        let statement = self.builder().update(table, columns, key_field, key);
        if self.execute(statement, name)? == 0 {
            return Err(DbError::RowNotFound(format!("{} {}", name, key)));
        }
        Ok(())
    }

    /// Relation whose cardinality and existing links a new link of
    /// `relation` is checked against. An input of a merged relation keeps
    /// its own; any other relation answers to its stored root.
    fn governing_link(&self, relation: &str) -> DbResult<&'a LinkMapItem> {
        let map = self.map;
        if map.stamps(relation)?.is_empty() {
            map.link(&map.record(relation)?.root)
        } else {
            map.link(relation)
        }
    }

    fn find_link(&self, relation: &str, source: &Value, target: &Value) -> DbResult<Option<LinkRecord>> {
        let matches = MatchExp::equals("source.id", source.clone())
            .and(MatchExp::equals("target.id", target.clone()));
        Ok(self.link_records(relation, Some(matches))?.into_iter().next())
    }

    /// Links of `relation` (stored or filtered) matching `match_expression`
    pub fn link_records(&self, relation: &str, match_expression: Option<MatchExp>) -> DbResult<Vec<LinkRecord>> {
        let root = self.map.record(relation)?.root.clone();
        let records = self.queries.find(
            relation,
            match_expression,
            None,
            &[
                AttributeQueryItem::name(ALL_ATTRIBUTES),
                AttributeQueryItem::name("source"),
                AttributeQueryItem::name("target"),
            ],
        )?;
        records
            .into_iter()
            .map(|record| {
                let endpoint = |name: &str| {
                    record
                        .get(name)
                        .and_then(|v| v.get(ID_ATTRIBUTE))
                        .cloned()
                        .ok_or_else(|| DbError::InvalidData(format!("{} link without {}", root, name)))
                };
                Ok(LinkRecord {
                    relation: root.clone(),
                    id: record_id(&record)?,
                    source: endpoint("source")?,
                    target: endpoint("target")?,
                    record: record.clone(),
                })
            })
            .collect()
    }

    /// Unlink every link of `relation` whose `endpoint` is `id`
    pub fn unlink_where(
        &self,
        relation: &str,
        endpoint: &str,
        id: &Value,
        events: &mut Vec<RecordMutationEvent>,
    ) -> DbResult<()> {
        let matches = MatchExp::equals(format!("{}.{}", endpoint, ID_ATTRIBUTE), id.clone());
        for link in self.link_records(relation, Some(matches))? {
            debug!("Unlinking previous occupant {} {}", link.relation, link.id);
            self.unlink(&link, events)?;
        }
        Ok(())
    }

    /// When linking an existing record as the far side of `attribute`, free
    /// it from the exclusive side of the relation
    fn release_far_side(
        &self,
        attribute: &RecordAttribute,
        far_id: &Value,
        events: &mut Vec<RecordMutationEvent>,
    ) -> DbResult<()> {
        let rules = self.governing_link(&attribute.relation)?;
        if attribute.is_source && rules.relation_type.source_is_one() {
            self.unlink_where(&rules.name, "target", far_id, events)?;
        }
        if !attribute.is_source && rules.relation_type.target_is_one() {
            self.unlink_where(&rules.name, "source", far_id, events)?;
        }
        Ok(())
    }

    pub fn unlink(&self, link_record: &LinkRecord, events: &mut Vec<RecordMutationEvent>) -> DbResult<()> {
        let link = self.map.link(&link_record.relation)?;
        let root = self.map.record(&link.root)?;
        let before = self.filtered().memberships(&link.root, &link_record.id)?;

        match link.placement {
            LinkPlacement::Isolated => {
                let statement = self.builder().delete(&link.table, &root.id_field, &link_record.id);
                self.execute(statement, &link.root)?;
            }
            LinkPlacement::MergedToSource | LinkPlacement::MergedToTarget => {
                let table = self.map.table(&link.table)?;
                let cleared = null_columns(table, &link.root);
                self.update_row(&link.table, &cleared, &root.id_field, &link_record.id, &link.root)?;
            }
            LinkPlacement::Combined => self.split_combined(link, &link_record.id)?,
        }
        debug!(
            "Unlinked {} {} -> {}",
            link.root, link_record.source, link_record.target
        );

        events.push(RecordMutationEvent::delete(link.root.clone(), link_record.record.clone()));
        events.extend(FilteredEntityManager::deletion_events(&before));
        Ok(())
    }

    // ==================== Combined rows ====================

    /// Move the target's component of its row into the source's row
    fn join_combined(
        &self,
        link: &LinkMapItem,
        source: &Value,
        target: &Value,
        link_columns: Vec<ColumnValue>,
    ) -> DbResult<()> {
        let table = self.map.table(&link.table)?;
        let target_root = self.map.record(&self.map.record(&link.target_record)?.root)?;
        let source_root = self.map.record(&self.map.record(&link.source_record)?.root)?;
        let target_row = self
            .read_row(&table.name, &target_root.id_field, target)?
            .ok_or_else(|| DbError::RowNotFound(format!("{} {}", target_root.name, target)))?;

        let groups = self.row_components(table, &target_row)?;
        let group = groups
            .iter()
            .find(|g| g.contains(&target_root.name))
            .cloned()
            .unwrap_or_default();

        let mut moved = link_columns;
        let mut cleared = Vec::new();
        for record in &group {
            for column in table.columns_of(record) {
                let value = target_row.get(&column.name).cloned().unwrap_or(Value::Null);
                moved.push(ColumnValue::new(&column.name, value));
                cleared.push(ColumnValue::new(&column.name, Value::Null));
            }
        }

        // free the old row first, it is found by the target id the source row is about to take
        if group.len() == present_records(table, &target_row).len() {
            let statement = self.builder().delete(&table.name, &target_root.id_field, target);
            self.execute(statement, &link.root)?;
        } else {
            self.update_row(&table.name, &cleared, &target_root.id_field, target, &link.root)?;
            debug!("Flashed {:?} out of a shared {} row", group, table.name);
        }
        self.update_row(&table.name, &moved, &source_root.id_field, source, &link.root)
    }

    /// Drop a combined link and move everything no longer connected to the
    /// source into a row of its own
    fn split_combined(&self, link: &LinkMapItem, link_id: &Value) -> DbResult<()> {
        let table = self.map.table(&link.table)?;
        let root = self.map.record(&link.root)?;
        let source_root = self.map.record(&link.source_record)?.root.clone();
        let mut row = self
            .read_row(&table.name, &root.id_field, link_id)?
            .ok_or_else(|| DbError::RowNotFound(format!("{} {}", link.root, link_id)))?;

        let mut cleared = null_columns(table, &link.root);
        for column in table.columns_of(&link.root) {
            row.insert(column.name.clone(), Value::Null);
        }

        let mut moved_rows = Vec::new();
        for group in self.row_components(table, &row)? {
            if group.contains(&source_root) {
                continue;
            }
            let mut columns = Vec::new();
            for record in &group {
                for column in table.columns_of(record) {
                    let value = row.get(&column.name).cloned().unwrap_or(Value::Null);
                    columns.push(ColumnValue::new(&column.name, value));
                    cleared.push(ColumnValue::new(&column.name, Value::Null));
                }
            }
            moved_rows.push(columns);
        }

        self.update_row(&table.name, &cleared, &root.id_field, link_id, &link.root)?;
        for columns in moved_rows {
            let statement = self.builder().insert(&table.name, &columns);
            self.db.insert(&statement.sql, &statement.params, &link.root)?;
            debug!("Split {} row after unlinking {}", table.name, link.root);
        }
        Ok(())
    }

    /// Records present in `row`, grouped by what keeps them together
    pub(crate) fn row_components(&self, table: &TableInfo, row: &Row) -> DbResult<Vec<Vec<String>>> {
        let present = present_records(table, row);
        let mut parent: HashMap<String, String> =
            present.iter().map(|r| (r.clone(), r.clone())).collect();

        for record in &present {
            let Ok(link) = self.map.link(record) else {
                continue;
            };
            let source = self.map.record(&link.source_record)?.root.clone();
            let target = self.map.record(&link.target_record)?.root.clone();
            match link.placement {
                LinkPlacement::Combined => {
                    union(&mut parent, record, &source);
                    union(&mut parent, record, &target);
                }
                LinkPlacement::MergedToSource => union(&mut parent, record, &source),
                LinkPlacement::MergedToTarget => union(&mut parent, record, &target),
                LinkPlacement::Isolated => {}
            }
        }

        let mut groups: Vec<(String, Vec<String>)> = Vec::new();
        for record in &present {
            let root = find(&parent, record);
            match groups.iter_mut().find(|(r, _)| *r == root) {
                Some((_, members)) => members.push(record.clone()),
                None => groups.push((root, vec![record.clone()])),
            }
        }
        Ok(groups.into_iter().map(|(_, members)| members).collect())
    }
}

/// Stored records whose id column is set in `row`
pub(crate) fn present_records(table: &TableInfo, row: &Row) -> Vec<String> {
    table
        .id_columns()
        .filter(|c| row.get(&c.name).is_some_and(|v| !v.is_null()))
        .map(|c| c.owner.clone())
        .collect()
}

/// Every column of `owner` set to NULL
pub(crate) fn null_columns(table: &TableInfo, owner: &str) -> Vec<ColumnValue> {
    table
        .columns_of(owner)
        .map(|c| ColumnValue::new(&c.name, Value::Null))
        .collect()
}

fn find(parent: &HashMap<String, String>, name: &str) -> String {
    let mut current = name;
    while let Some(next) = parent.get(current) {
        if next == current {
            break;
        }
        current = next;
    }
    current.to_string()
}

fn union(parent: &mut HashMap<String, String>, a: &str, b: &str) {
    if !parent.contains_key(b) {
        return;
    }
    let (root_a, root_b) = (find(parent, a), find(parent, b));
    if root_a != root_b {
        parent.insert(root_b, root_a);
    }
}

/// (source, target) of a link made through `attribute` from `owner`
fn orient(attribute: &RecordAttribute, owner: &Value, other: &Value) -> (Value, Value) {
    if attribute.is_source {
        (owner.clone(), other.clone())
    } else {
        (other.clone(), owner.clone())
    }
}

fn attach(record: &mut Record, attribute: &RecordAttribute, target: Record) {
    if attribute.is_collection {
        let entry = record
            .entry(attribute.name.clone())
            .or_insert_with(|| Value::Array(Vec::new()));
        if let Value::Array(items) = entry {
            items.push(Value::Object(target));
        }
    } else {
        record.insert(attribute.name.clone(), Value::Object(target));
    }
}

fn single(key: &str, value: Value) -> Record {
    let mut record = Record::new();
    record.insert(key.to_string(), value);
    record
}

pub(crate) fn record_id(record: &Record) -> DbResult<Value> {
    record
        .get(ID_ATTRIBUTE)
        .cloned()
        .ok_or_else(|| DbError::InvalidData("record without id".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::map::ColumnInfo;
    use serde_json::json;

    fn table() -> TableInfo {
        let column = |name: &str, owner: &str, is_id: bool| ColumnInfo {
            name: name.to_string(),
            owner: owner.to_string(),
            sql_type: "INTEGER".to_string(),
            is_id,
        };
        TableInfo {
            name: "User".to_string(),
            records: vec!["User".to_string(), "Profile".to_string()],
            columns: vec![
                column("User_id", "User", true),
                column("User_name", "User", false),
                column("Profile_id", "Profile", true),
            ],
            combined_links: Vec::new(),
        }
    }

    #[test]
    fn test_present_records() {
        let mut row = Row::new();
        row.insert("User_id".into(), json!(1));
        row.insert("Profile_id".into(), Value::Null);
        assert_eq!(present_records(&table(), &row), vec!["User".to_string()]);
        assert_eq!(null_columns(&table(), "User").len(), 2);
    }

    #[test]
    fn test_union_find_groups() {
        let mut parent: HashMap<String, String> = ["A", "B", "C"]
            .iter()
            .map(|n| (n.to_string(), n.to_string()))
            .collect();
        union(&mut parent, "A", "B");
        union(&mut parent, "A", "Missing");
        assert_eq!(find(&parent, "B"), "A");
        assert_eq!(find(&parent, "C"), "C");
        assert!(!parent.contains_key("Missing"));
    }

    #[test]
    fn test_attach_collects_collections() {
        let attribute = RecordAttribute {
            name: "posts".into(),
            owner: "User".into(),
            record: "Post".into(),
            relation: "R".into(),
            relation_root: "R".into(),
            is_source: true,
            reverse: Some("author".into()),
            is_collection: true,
            is_symmetric: false,
            direction: None,
            is_reliance: false,
            is_filtered_relation: false,
            is_filtered_target: false,
            is_endpoint: false,
            join: JoinKind::ForeignKeyInTarget { field: "R_source".into() },
        };
        let mut record = Record::new();
        attach(&mut record, &attribute, single("id", json!(1)));
        attach(&mut record, &attribute, single("id", json!(2)));
        assert_eq!(Value::Object(record), json!({"posts": [{"id": 1}, {"id": 2}]}));
    }
}
