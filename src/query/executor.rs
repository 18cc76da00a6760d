//! Query execution
//!
//! A [`RecordQuery`] runs as one SELECT for the requested record and its x:1
//! relations. Every deferred attribute (x:n, symmetric, filtered relation,
//! x:1 to a filtered record or x:1 with its own sub-query options) is then
//! fetched per owner row through the relation record, and the fetched records
//! are completed the same way.
//!
//! Recursive queries name a sub-query with `label` and re-enter it with
//! `goto`. The ids visited under each label are tracked in a [`QueryContext`]
//! passed down by value, so sibling branches never see each other's stacks.

use serde_json::{Map, Value};
use std::collections::HashMap;
use tracing::{debug, warn};

use super::builder::SqlBuilder;
use super::match_exp::MatchExp;
use super::record_query::{
    same_id, AttributeQuery, AttributeQueryItem, ExitCondition, Modifier, RecordQuery,
    RecordQueryData, RelatedQuery, ALL_ATTRIBUTES,
};
use crate::config::EngineConfig;
use crate::driver::Database;
use crate::error::{DbError, DbResult};
use crate::storage::map::{EntityToTableMap, ID_ATTRIBUTE, LINK_SYMBOL};

/// A structured result record
pub type Record = Map<String, Value>;

const PATH_LABEL: &str = "__path";

/// Labeled sub-query and the ids visited under it
#[derive(Debug, Clone)]
struct LabelFrame {
    query: RecordQuery,
    stack: Vec<Value>,
}

/// Recursion state of one branch of a query tree
#[derive(Debug, Clone, Default)]
pub struct QueryContext {
    labels: HashMap<String, LabelFrame>,
}

impl QueryContext {
    /// Context with `query` registered under its label
    fn enter(&self, query: &RecordQuery) -> Self {
        let mut context = self.clone();
        if let Some(label) = &query.label {
            if !query.recursive {
                context.labels.insert(
                    label.clone(),
                    LabelFrame {
                        query: query.clone(),
                        stack: Vec::new(),
                    },
                );
            }
        }
        context
    }

    /// Ids visited under `label`, innermost last
    pub fn stack(&self, label: &str) -> Option<&[Value]> {
        self.labels.get(label).map(|frame| frame.stack.as_slice())
    }
}

#[derive(Clone, Copy)]
pub struct QueryExecutor<'a> {
    map: &'a EntityToTableMap,
    db: &'a dyn Database,
    config: &'a EngineConfig,
}

impl<'a> QueryExecutor<'a> {
    pub fn new(map: &'a EntityToTableMap, db: &'a dyn Database, config: &'a EngineConfig) -> Self {
        Self { map, db, config }
    }

    /// Records of `record_name` matching `match_expression`
    pub fn find(
        &self,
        record_name: &str,
        match_expression: Option<MatchExp>,
        modifier: Option<Modifier>,
        attribute_query: &[AttributeQueryItem],
    ) -> DbResult<Vec<Record>> {
        let data = RecordQueryData {
            match_expression,
            modifier,
            attribute_query: attribute_query.to_vec(),
            ..RecordQueryData::default()
        };
        self.find_data(record_name, &data)
    }

    pub fn find_data(&self, record_name: &str, data: &RecordQueryData) -> DbResult<Vec<Record>> {
        let query = RecordQuery::compile(self.map, record_name, data)?;
        self.find_records(&query, &QueryContext::default())
    }

    pub fn find_one(
        &self,
        record_name: &str,
        match_expression: Option<MatchExp>,
        attribute_query: &[AttributeQueryItem],
    ) -> DbResult<Option<Record>> {
        let records = self.find(
            record_name,
            match_expression,
            Some(Modifier::limit(1)),
            attribute_query,
        )?;
        Ok(records.into_iter().next())
    }

    pub fn find_records(&self, query: &RecordQuery, context: &QueryContext) -> DbResult<Vec<Record>> {
        let context = context.enter(query);
        let mut records = self.select(query)?;
        for record in &mut records {
            self.complete_row(query, record, &context)?;
        }
        debug!("find {} -> {} records", query.record_name, records.len());
        Ok(records)
    }

    /// Run the single statement of `query`
    fn select(&self, query: &RecordQuery) -> DbResult<Vec<Record>> {
        let statement = SqlBuilder::new(self.map, self.db.placeholder(), self.config.identifier_limit)
            .select(query)?;
        let rows = self
            .db
            .query(&statement.sql, &statement.params, &query.record_name)?;
        statement.structure(&rows)
    }

    /// Record the row on its label stack and fetch its deferred attributes
    fn complete_row(&self, query: &RecordQuery, record: &mut Record, context: &QueryContext) -> DbResult<()> {
        let mut context = context.clone();
        if let Some(label) = &query.label {
            if let Some(frame) = context.labels.get_mut(label) {
                let id = record.get(ID_ATTRIBUTE).cloned().unwrap_or(Value::Null);
                frame.stack.push(id);
            }
        }
        self.fill_attributes(&query.attribute_query, record, &context)
    }

    fn fill_attributes(&self, query: &AttributeQuery, record: &mut Record, context: &QueryContext) -> DbResult<()> {
        for related in &query.x_to_one {
            if let Some(Value::Object(child)) = record.get_mut(&related.attribute) {
                self.fill_attributes(&related.query.attribute_query, child, context)?;
            }
        }
        if query.deferred.is_empty() {
            return Ok(());
        }

        let owner_id = record
            .get(ID_ATTRIBUTE)
            .cloned()
            .ok_or_else(|| DbError::InvalidData(format!("{} row without id", query.record_name)))?;
        for related in &query.deferred {
            if let Some(label) = &related.query.goto {
                if self.should_stop(label, context)? {
                    continue;
                }
            }
            let items = self.find_x_to_many_related_records(&owner_id, related, context)?;
            if related.single {
                if let Some(item) = items.into_iter().next() {
                    record.insert(related.attribute.clone(), Value::Object(item));
                }
            } else {
                record.insert(
                    related.attribute.clone(),
                    Value::Array(items.into_iter().map(Value::Object).collect()),
                );
            }
        }
        Ok(())
    }

    /// Whether a `goto` below the current row must not descend
    fn should_stop(&self, label: &str, context: &QueryContext) -> DbResult<bool> {
        let frame = context
            .labels
            .get(label)
            .ok_or_else(|| DbError::InvalidData(format!("goto to unknown label '{}'", label)))?;
        let Some(current) = frame.stack.last() else {
            return Ok(false);
        };
        // back at the first record of this labeled traversal
        if frame.stack.len() > 1 && same_id(&frame.stack[0], current) {
            return Ok(true);
        }
        if frame
            .query
            .exit
            .as_ref()
            .is_some_and(|exit| exit.is_met(frame.stack.len(), current))
        {
            return Ok(true);
        }
        if frame.stack.len() >= self.config.max_recursion_depth {
            warn!(
                "Recursive query '{}' stopped at depth {}",
                label,
                frame.stack.len()
            );
            return Ok(true);
        }
        Ok(false)
    }

    /// Query reached by `related`, resolving a `goto` to its labeled query
    fn target_query(&self, related: &RelatedQuery, context: &QueryContext) -> DbResult<RecordQuery> {
        let Some(label) = &related.query.goto else {
            return Ok(related.query.clone());
        };
        let frame = context
            .labels
            .get(label)
            .ok_or_else(|| DbError::InvalidData(format!("goto to unknown label '{}'", label)))?;
        Ok(RecordQuery {
            match_expression: MatchExp::and_option(
                frame.query.match_expression.clone(),
                related.query.match_expression.clone(),
            ),
            recursive: true,
            ..frame.query.clone()
        })
    }

    /// Records related to `owner_id` through `related`, fetched via the
    /// relation record
    pub fn find_x_to_many_related_records(
        &self,
        owner_id: &Value,
        related: &RelatedQuery,
        context: &QueryContext,
    ) -> DbResult<Vec<Record>> {
        let target = self.target_query(related, context)?;
        let context = context.enter(&target);
        let info = &related.info;
        let directions = if info.is_undirected_symmetric() {
            vec![("source", "target"), ("target", "source")]
        } else {
            vec![info.near_far()]
        };
        let target_filter = self.map.record_filter(&target.record_name)?;

        let mut items = Vec::new();
        for (near, far) in directions {
            let far_attribute = self
                .map
                .get_attribute(&info.relation, far)?
                .as_record()
                .cloned()
                .ok_or_else(|| DbError::attribute_not_found(&info.relation, far))?;

            let link = target.attribute_query.link.as_deref();
            let mut attribute_query = match link {
                Some(link) => link.without_deferred(),
                None => AttributeQuery {
                    record_name: info.relation.clone(),
                    values: vec![ID_ATTRIBUTE.to_string()],
                    x_to_one: Vec::new(),
                    deferred: Vec::new(),
                    link: None,
                },
            };
            // the link attributes are read from the relation row itself
            let mut far_query = target.attribute_query.without_deferred();
            far_query.link = None;
            attribute_query.x_to_one.push(RelatedQuery {
                attribute: far.to_string(),
                info: far_attribute,
                query: RecordQuery {
                    attribute_query: far_query,
                    ..target.clone()
                },
                single: true,
            });

            let match_expression = MatchExp::all(
                std::iter::once(MatchExp::equals(
                    format!("{}.{}", near, ID_ATTRIBUTE),
                    owner_id.clone(),
                ))
                .chain(target.match_expression.as_ref().map(|m| m.prefixed(far)))
                .chain(target_filter.as_ref().map(|f| f.prefixed(far))),
            );
            let relation_query = RecordQuery {
                record_name: info.relation.clone(),
                match_expression,
                modifier: target.modifier.prefixed(far),
                attribute_query,
                label: None,
                goto: None,
                exit: None,
                recursive: false,
            };

            for mut row in self.select(&relation_query)? {
                let Some(Value::Object(mut item)) = row.remove(far) else {
                    continue;
                };
                if link.is_some() {
                    item.insert(LINK_SYMBOL.to_string(), Value::Object(row));
                }
                self.complete_row(&target, &mut item, &context)?;
                items.push(item);
            }
        }
        Ok(items)
    }

    /// Chain of records from `start_id` to `end_id` following `attribute`.
    ///
    /// Each record carries its value attributes. Empty when `end_id` is not
    /// reachable within `max_depth` hops.
    pub fn find_path(
        &self,
        record_name: &str,
        attribute: &str,
        start_id: &Value,
        end_id: &Value,
        max_depth: Option<usize>,
    ) -> DbResult<Vec<Record>> {
        let depth = max_depth.unwrap_or(self.config.find_path_max_depth);
        let start = MatchExp::equals(ID_ATTRIBUTE, start_id.clone());

        if same_id(start_id, end_id) {
            let records = self.find(
                record_name,
                Some(start),
                Some(Modifier::limit(1)),
                &[AttributeQueryItem::name(ALL_ATTRIBUTES)],
            )?;
            return Ok(records.into_iter().take(1).collect());
        }

        let step = RecordQueryData {
            attribute_query: vec![
                AttributeQueryItem::name(ALL_ATTRIBUTES),
                AttributeQueryItem::nested(
                    attribute,
                    RecordQueryData {
                        goto: Some(PATH_LABEL.to_string()),
                        ..RecordQueryData::default()
                    },
                ),
            ],
            label: Some(PATH_LABEL.to_string()),
            exit: Some(ExitCondition::Any {
                conditions: vec![
                    ExitCondition::ReachedId { id: end_id.clone() },
                    ExitCondition::MaxDepth { depth },
                ],
            }),
            ..RecordQueryData::default()
        };
        let data = RecordQueryData {
            match_expression: Some(start),
            attribute_query: vec![
                AttributeQueryItem::name(ALL_ATTRIBUTES),
                AttributeQueryItem::nested(attribute, step),
            ],
            ..RecordQueryData::default()
        };

        let Some(root) = self.find_data(record_name, &data)?.into_iter().next() else {
            return Ok(Vec::new());
        };
        let mut path = Vec::new();
        if search_path(&root, attribute, end_id, &mut path) {
            Ok(path)
        } else {
            Ok(Vec::new())
        }
    }
}

/// Depth-first search for `end_id`, collecting the records on the way
fn search_path(node: &Record, attribute: &str, end_id: &Value, path: &mut Vec<Record>) -> bool {
    let mut stripped = node.clone();
    let children = stripped.remove(attribute);
    path.push(stripped);

    if node.get(ID_ATTRIBUTE).is_some_and(|id| same_id(id, end_id)) {
        return true;
    }
    let children: Vec<Value> = match children {
        Some(Value::Array(items)) => items,
        Some(item @ Value::Object(_)) => vec![item],
        _ => Vec::new(),
    };
    for child in &children {
        if let Value::Object(child) = child {
            if search_path(child, attribute, end_id, path) {
                return true;
            }
        }
    }
    path.pop();
    false
}
