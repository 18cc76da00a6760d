//! Record updates
//!
//! Value attributes are written in place on the root row. A record attribute
//! given for an x:1 relation replaces the current link; for an x:n relation
//! the given records are linked in addition to the existing ones.

use serde_json::Value;
use tracing::debug;

use super::creation::{record_id, CreationExecutor};
use super::filtered::FilteredEntityManager;
use super::{NewRecordData, RecordMutationEvent};
use crate::error::{DbError, DbResult};
use crate::query::builder::ColumnValue;
use crate::query::match_exp::MatchExp;
use crate::query::record_query::{AttributeQueryItem, ALL_ATTRIBUTES};
use crate::query::Record;
use crate::storage::map::{EntityToTableMap, ID_ATTRIBUTE};

pub struct UpdateExecutor<'a> {
    map: &'a EntityToTableMap,
    creation: &'a CreationExecutor<'a>,
}

impl<'a> UpdateExecutor<'a> {
    pub fn new(map: &'a EntityToTableMap, creation: &'a CreationExecutor<'a>) -> Self {
        Self { map, creation }
    }

    /// Apply `data` to every `record_name` matching `match_expression`,
    /// returning the updated records
    pub fn update(
        &self,
        record_name: &str,
        match_expression: Option<MatchExp>,
        data: &Record,
        events: &mut Vec<RecordMutationEvent>,
    ) -> DbResult<Vec<Record>> {
        if data.contains_key(ID_ATTRIBUTE) {
            return Err(DbError::InvalidData(format!("id of {} cannot be updated", record_name)));
        }
        let item = self.map.record(record_name)?;
        if item.is_relation && (data.contains_key("source") || data.contains_key("target")) {
            return Err(DbError::InvalidData(format!(
                "endpoints of {} cannot be updated, unlink and link again",
                record_name
            )));
        }
        let changes = NewRecordData::parse(self.map, record_name, data)?;

        let queries = self.creation.queries();
        let matched = queries.find(
            record_name,
            match_expression,
            None,
            &[AttributeQueryItem::name(ALL_ATTRIBUTES)],
        )?;
        debug!("Updating {} {} records", matched.len(), record_name);

        let mut updated = Vec::with_capacity(matched.len());
        for record in matched {
            let id = record_id(&record)?;
            updated.push(self.update_one(&item.root, &id, &changes, events)?);
        }
        Ok(updated)
    }

    fn update_one(
        &self,
        root_name: &str,
        id: &Value,
        changes: &NewRecordData,
        events: &mut Vec<RecordMutationEvent>,
    ) -> DbResult<Record> {
        let queries = self.creation.queries();
        let filtered = self.creation.filtered();
        let by_id = || Some(MatchExp::equals(ID_ATTRIBUTE, id.clone()));
        let all = [AttributeQueryItem::name(ALL_ATTRIBUTES)];

        let old_record = queries
            .find_one(root_name, by_id(), &all)?
            .ok_or_else(|| DbError::RowNotFound(format!("{} {}", root_name, id)))?;
        let before = filtered.memberships(root_name, id)?;

        if !changes.values.is_empty() {
            let root = self.map.record(root_name)?;
            let columns: Vec<ColumnValue> = changes
                .values
                .iter()
                .map(|(attribute, value)| ColumnValue::for_attribute(attribute, value.clone()))
                .collect();
            let statement = self
                .creation
                .builder()
                .update(&root.table, &columns, &root.id_field, id);
            self.creation.execute(statement, root_name)?;
        }

        for related in &changes.related {
            let attribute = &related.attribute;
            if !attribute.is_collection {
                let near = attribute.near_far().0;
                self.creation.unlink_where(&attribute.relation, near, id, events)?;
            }
            for item in &related.items {
                self.creation.attach_item(id, attribute, item, events)?;
            }
        }

        let new_record = queries
            .find_one(root_name, by_id(), &all)?
            .ok_or_else(|| DbError::RowNotFound(format!("{} {}", root_name, id)))?;
        let after = filtered.memberships(root_name, id)?;

        events.push(RecordMutationEvent::update(root_name, new_record.clone(), old_record));
        events.extend(FilteredEntityManager::diff(&before, &after));
        Ok(new_record)
    }
}
