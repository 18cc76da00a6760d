//! Record deletion
//!
//! Deleting an entity unlinks every relation it takes part in, then deletes
//! the records that rely on it, and finally removes its columns. A row that
//! still holds other records keeps them: only the deleted record's columns
//! are cleared.

use serde_json::Value;
use std::collections::HashSet;
use tracing::{debug, info};

use super::creation::{null_columns, present_records, record_id, CreationExecutor};
use super::filtered::FilteredEntityManager;
use super::RecordMutationEvent;
use crate::error::DbResult;
use crate::query::match_exp::MatchExp;
use crate::query::record_query::{AttributeQueryItem, ALL_ATTRIBUTES};
use crate::query::Record;
use crate::storage::map::{EntityToTableMap, ID_ATTRIBUTE};

pub struct DeletionExecutor<'a> {
    map: &'a EntityToTableMap,
    creation: &'a CreationExecutor<'a>,
}

impl<'a> DeletionExecutor<'a> {
    pub fn new(map: &'a EntityToTableMap, creation: &'a CreationExecutor<'a>) -> Self {
        Self { map, creation }
    }

    /// Delete every `record_name` matching `match_expression`, returning the
    /// deleted records
    pub fn delete(
        &self,
        record_name: &str,
        match_expression: Option<MatchExp>,
        events: &mut Vec<RecordMutationEvent>,
    ) -> DbResult<Vec<Record>> {
        let item = self.map.record(record_name)?;

        if item.is_relation {
            let links = self.creation.link_records(record_name, match_expression)?;
            for link in &links {
                self.creation.unlink(link, events)?;
            }
            return Ok(links.into_iter().map(|link| link.record).collect());
        }

        let matched = self.creation.queries().find(
            record_name,
            match_expression,
            None,
            &[AttributeQueryItem::name(ALL_ATTRIBUTES)],
        )?;
        for record in &matched {
            self.delete_entity(&item.root, &record_id(record)?, events)?;
        }
        info!("Deleted {} {} records", matched.len(), record_name);
        Ok(matched)
    }

    fn delete_entity(&self, root_name: &str, id: &Value, events: &mut Vec<RecordMutationEvent>) -> DbResult<()> {
        let queries = self.creation.queries();
        let Some(record) = queries.find_one(
            root_name,
            Some(MatchExp::equals(ID_ATTRIBUTE, id.clone())),
            &[AttributeQueryItem::name(ALL_ATTRIBUTES)],
        )?
        else {
            // already removed by a reliance cascade
            return Ok(());
        };
        let before = self.creation.filtered().memberships(root_name, id)?;

        let mut reliant = Vec::new();
        for link in self.map.links_of_root(root_name) {
            let mut seen: HashSet<String> = HashSet::new();
            for endpoint in ["source", "target"] {
                let side = if endpoint == "source" {
                    &link.source_record
                } else {
                    &link.target_record
                };
                if self.map.record(side)?.root != root_name {
                    continue;
                }
                let matches = MatchExp::equals(format!("{}.{}", endpoint, ID_ATTRIBUTE), id.clone());
                for link_record in self.creation.link_records(&link.root, Some(matches))? {
                    if !seen.insert(link_record.id.to_string()) {
                        continue;
                    }
                    if link.is_target_reliance && endpoint == "source" {
                        let target_root = self.map.record(&link.target_record)?.root.clone();
                        reliant.push((target_root, link_record.target.clone()));
                    }
                    self.creation.unlink(&link_record, events)?;
                }
            }
        }

        for (reliant_root, reliant_id) in reliant {
            debug!(
                "Cascading delete of {} {} relying on {} {}",
                reliant_root, reliant_id, root_name, id
            );
            self.delete_entity(&reliant_root, &reliant_id, events)?;
        }

        let root = self.map.record(root_name)?;
        let table = self.map.table(&root.table)?;
        if let Some(row) = self.creation.read_row(&table.name, &root.id_field, id)? {
            let shared = present_records(table, &row).iter().any(|r| r != root_name);
            let statement = if shared {
                let cleared = null_columns(table, root_name);
                self.creation.builder().update(&table.name, &cleared, &root.id_field, id)
            } else {
                self.creation.builder().delete(&table.name, &root.id_field, id)
            };
            self.creation.execute(statement, root_name)?;
        }

        events.push(RecordMutationEvent::delete(root_name, record));
        events.extend(FilteredEntityManager::deletion_events(&before));
        Ok(())
    }
}
