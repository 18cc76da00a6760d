//! Filtered record membership
//!
//! A stored row can belong to any number of filtered records below its root.
//! Membership is evaluated top-down: a child is only checked while its parent
//! holds, so the result lists memberships outermost first.

use serde_json::Value;

use super::RecordMutationEvent;
use crate::error::DbResult;
use crate::query::match_exp::MatchExp;
use crate::query::record_query::{AttributeQueryItem, ALL_ATTRIBUTES};
use crate::query::{QueryExecutor, Record};
use crate::storage::map::{EntityToTableMap, ID_ATTRIBUTE};

pub struct FilteredEntityManager<'a> {
    map: &'a EntityToTableMap,
    queries: QueryExecutor<'a>,
}

impl<'a> FilteredEntityManager<'a> {
    pub fn new(map: &'a EntityToTableMap, queries: QueryExecutor<'a>) -> Self {
        Self { map, queries }
    }

    /// Filtered records below `record_name` that currently contain `id`
    pub fn memberships(&self, record_name: &str, id: &Value) -> DbResult<Vec<(String, Record)>> {
        let mut out = Vec::new();
        self.collect(record_name, id, &mut out)?;
        Ok(out)
    }

    fn collect(&self, record_name: &str, id: &Value, out: &mut Vec<(String, Record)>) -> DbResult<()> {
        for child in &self.map.record(record_name)?.filtered_by {
            let found = self.queries.find_one(
                child,
                Some(MatchExp::equals(ID_ATTRIBUTE, id.clone())),
                &[AttributeQueryItem::name(ALL_ATTRIBUTES)],
            )?;
            if let Some(record) = found {
                out.push((child.clone(), record));
                self.collect(child, id, out)?;
            }
        }
        Ok(())
    }

    /// One create event per filtered record `id` entered, outermost first
    pub fn creation_events(&self, record_name: &str, id: &Value) -> DbResult<Vec<RecordMutationEvent>> {
        Ok(self
            .memberships(record_name, id)?
            .into_iter()
            .map(|(name, record)| RecordMutationEvent::create(name, record))
            .collect())
    }

    /// Events for memberships lost (innermost first) and gained (outermost first)
    pub fn diff(before: &[(String, Record)], after: &[(String, Record)]) -> Vec<RecordMutationEvent> {
        let mut events: Vec<RecordMutationEvent> = before
            .iter()
            .rev()
            .filter(|(name, _)| !after.iter().any(|(n, _)| n == name))
            .map(|(name, record)| RecordMutationEvent::delete(name.clone(), record.clone()))
            .collect();
        events.extend(
            after
                .iter()
                .filter(|(name, _)| !before.iter().any(|(n, _)| n == name))
                .map(|(name, record)| RecordMutationEvent::create(name.clone(), record.clone())),
        );
        events
    }

    /// Delete events for every membership in `before`, innermost first
    pub fn deletion_events(before: &[(String, Record)]) -> Vec<RecordMutationEvent> {
        Self::diff(before, &[])
    }
}
