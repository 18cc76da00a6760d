//! Declarative record queries
//!
//! [`RecordQueryData`] is the serde input form:
//!
//! ```json
//! {
//!   "matchExpression": {...},
//!   "modifier": {"orderBy": [{"attribute": "name"}], "limit": 10},
//!   "attributeQuery": ["name", ["team", {"attributeQuery": ["name"]}], ["posts", {}]],
//!   "label": "tree",
//!   "goto": "tree",
//!   "exit": {"type": "maxDepth", "depth": 3}
//! }
//! ```
//!
//! [`RecordQuery`] is the compiled form, with every requested relation already
//! classified as joinable (fetched in the owner's statement) or deferred
//! (fetched with one extra query per owner row).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::match_exp::MatchExp;
use crate::error::{DbError, DbResult};
use crate::storage::map::{AttributeInfo, EntityToTableMap, RecordAttribute, ID_ATTRIBUTE, LINK_SYMBOL};

/// Requests every value attribute
pub const ALL_ATTRIBUTES: &str = "*";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderDirection {
    #[default]
    Asc,
    Desc,
}

impl OrderDirection {
    pub fn as_sql(&self) -> &'static str {
        match self {
            OrderDirection::Asc => "ASC",
            OrderDirection::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBy {
    /// Dotted path of an x:1 value attribute
    pub attribute: String,
    #[serde(default)]
    pub direction: OrderDirection,
}

/// Ordering and paging
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Modifier {
    #[serde(default)]
    pub order_by: Vec<OrderBy>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: Option<usize>,
}

impl Modifier {
    pub fn limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Self::default()
        }
    }

    pub fn order(mut self, attribute: impl Into<String>, direction: OrderDirection) -> Self {
        self.order_by.push(OrderBy {
            attribute: attribute.into(),
            direction,
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.order_by.is_empty() && self.limit.is_none() && self.offset.is_none()
    }

    /// Same modifier with every order key moved under `prefix`
    pub fn prefixed(&self, prefix: &str) -> Self {
        Self {
            order_by: self
                .order_by
                .iter()
                .map(|o| OrderBy {
                    attribute: format!("{}.{}", prefix, o.attribute),
                    direction: o.direction,
                })
                .collect(),
            ..self.clone()
        }
    }
}

/// Stops a recursive traversal below the current record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ExitCondition {
    ReachedId { id: Value },
    MaxDepth { depth: usize },
    Any { conditions: Vec<ExitCondition> },
}

impl ExitCondition {
    /// `depth` counts the records on the current label's stack
    pub fn is_met(&self, depth: usize, current_id: &Value) -> bool {
        match self {
            ExitCondition::ReachedId { id } => same_id(id, current_id),
            ExitCondition::MaxDepth { depth: max } => depth >= *max,
            ExitCondition::Any { conditions } => {
                conditions.iter().any(|c| c.is_met(depth, current_id))
            }
        }
    }
}

/// Id equality tolerant of integer/float representations
pub fn same_id(a: &Value, b: &Value) -> bool {
    match (a.as_i64(), b.as_i64()) {
        (Some(a), Some(b)) => a == b,
        _ => a == b,
    }
}

/// Serde form of a record query
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordQueryData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_expression: Option<MatchExp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modifier: Option<Modifier>,
    #[serde(default)]
    pub attribute_query: Vec<AttributeQueryItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goto: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit: Option<ExitCondition>,
}

impl RecordQueryData {
    pub fn attributes(attribute_query: Vec<AttributeQueryItem>) -> Self {
        Self {
            attribute_query,
            ..Self::default()
        }
    }

    /// Sub-query options that prevent fetching with a join
    fn needs_own_statement(&self) -> bool {
        self.match_expression.is_some()
            || self.modifier.as_ref().is_some_and(|m| !m.is_empty())
            || self.label.is_some()
            || self.goto.is_some()
            || self.exit.is_some()
    }
}

/// `"name"` or `["name", {sub-query}]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeQueryItem {
    Name(String),
    Nested(String, RecordQueryData),
}

impl AttributeQueryItem {
    pub fn name(name: impl Into<String>) -> Self {
        AttributeQueryItem::Name(name.into())
    }

    pub fn nested(name: impl Into<String>, data: RecordQueryData) -> Self {
        AttributeQueryItem::Nested(name.into(), data)
    }

    /// Parse a JSON attribute query array
    pub fn list_from_json(value: Value) -> DbResult<Vec<Self>> {
        Ok(serde_json::from_value(value)?)
    }
}

/// Compiled record query
#[derive(Debug, Clone)]
pub struct RecordQuery {
    pub record_name: String,
    pub match_expression: Option<MatchExp>,
    pub modifier: Modifier,
    pub attribute_query: AttributeQuery,
    pub label: Option<String>,
    pub goto: Option<String>,
    pub exit: Option<ExitCondition>,
    /// Derived from a `goto`: continues the labeled traversal stack
    pub recursive: bool,
}

/// Attributes requested from one record
#[derive(Debug, Clone)]
pub struct AttributeQuery {
    pub record_name: String,
    /// Value attributes, always starting with `id`
    pub values: Vec<String>,
    /// Related records fetched in the same statement
    pub x_to_one: Vec<RelatedQuery>,
    /// Related records fetched separately
    pub deferred: Vec<RelatedQuery>,
    /// Relation record attributes requested with `&`
    pub link: Option<Box<AttributeQuery>>,
}

/// One requested record attribute
#[derive(Debug, Clone)]
pub struct RelatedQuery {
    /// Attribute as requested, including a direction suffix
    pub attribute: String,
    pub info: RecordAttribute,
    pub query: RecordQuery,
    /// Result is a single object rather than a list
    pub single: bool,
}

impl RecordQuery {
    pub fn compile(map: &EntityToTableMap, record: &str, data: &RecordQueryData) -> DbResult<Self> {
        Self::compile_with_link(map, record, data, None)
    }

    fn compile_with_link(
        map: &EntityToTableMap,
        record: &str,
        data: &RecordQueryData,
        link_relation: Option<&str>,
    ) -> DbResult<Self> {
        Ok(Self {
            record_name: record.to_string(),
            match_expression: data.match_expression.clone(),
            modifier: data.modifier.clone().unwrap_or_default(),
            attribute_query: AttributeQuery::compile(
                map,
                record,
                &data.attribute_query,
                link_relation,
            )?,
            label: data.label.clone(),
            goto: data.goto.clone(),
            exit: data.exit.clone(),
            recursive: false,
        })
    }

    /// Query for `record` matching `match_expression`
    pub fn simple(
        map: &EntityToTableMap,
        record: &str,
        match_expression: Option<MatchExp>,
        attribute_query: &[AttributeQueryItem],
    ) -> DbResult<Self> {
        Self::compile(
            map,
            record,
            &RecordQueryData {
                match_expression,
                attribute_query: attribute_query.to_vec(),
                ..RecordQueryData::default()
            },
        )
    }
}

impl AttributeQuery {
    pub fn compile(
        map: &EntityToTableMap,
        record: &str,
        items: &[AttributeQueryItem],
        link_relation: Option<&str>,
    ) -> DbResult<Self> {
        let item = map.record(record)?;
        let mut query = Self {
            record_name: record.to_string(),
            values: vec![ID_ATTRIBUTE.to_string()],
            x_to_one: Vec::new(),
            deferred: Vec::new(),
            link: None,
        };

        for entry in items {
            let (name, data) = match entry {
                AttributeQueryItem::Name(name) => (name.as_str(), None),
                AttributeQueryItem::Nested(name, data) => (name.as_str(), Some(data)),
            };

            if name == ALL_ATTRIBUTES {
                for value in item.value_attributes() {
                    query.push_value(&value.name);
                }
                continue;
            }

            if name == LINK_SYMBOL {
                let relation = link_relation.ok_or_else(|| {
                    DbError::invalid_path(
                        format!("{}.{}", record, LINK_SYMBOL),
                        "link symbol must follow a record attribute",
                    )
                })?;
                let link_items = match data {
                    Some(data) => data.attribute_query.clone(),
                    None => vec![AttributeQueryItem::name(ALL_ATTRIBUTES)],
                };
                query.link = Some(Box::new(Self::compile(map, relation, &link_items, None)?));
                continue;
            }

            match map.get_attribute(record, name)? {
                AttributeInfo::Value(value) => {
                    if data.is_some() {
                        return Err(DbError::invalid_path(
                            name,
                            "value attributes take no sub-query",
                        ));
                    }
                    query.push_value(&value.name);
                }
                AttributeInfo::Record(attribute) => {
                    let default_data = RecordQueryData::default();
                    let data = data.unwrap_or(&default_data);
                    let joinable = attribute.is_joinable() && !data.needs_own_statement();
                    if attribute.is_endpoint && !joinable {
                        return Err(DbError::UnsupportedCondition(format!(
                            "sub-query options on relation endpoint '{}'",
                            name
                        )));
                    }
                    let related = RelatedQuery {
                        attribute: name.to_string(),
                        query: RecordQuery::compile_with_link(
                            map,
                            &attribute.record,
                            data,
                            Some(&attribute.relation),
                        )?,
                        single: !attribute.is_collection,
                        info: attribute,
                    };
                    if joinable {
                        query.x_to_one.push(related);
                    } else {
                        query.deferred.push(related);
                    }
                }
                AttributeInfo::Link { .. } => {
                    return Err(DbError::invalid_path(name, "unexpected link symbol"))
                }
            }
        }

        Ok(query)
    }

    fn push_value(&mut self, name: &str) {
        if !self.values.iter().any(|v| v == name) {
            self.values.push(name.to_string());
        }
    }

    /// Only the id is requested
    pub fn is_id_only(&self) -> bool {
        self.values.len() == 1
            && self.x_to_one.is_empty()
            && self.deferred.is_empty()
            && self.link.is_none()
    }

    /// Copy keeping only what one statement can fetch
    pub fn without_deferred(&self) -> Self {
        Self {
            record_name: self.record_name.clone(),
            values: self.values.clone(),
            x_to_one: self
                .x_to_one
                .iter()
                .map(|related| RelatedQuery {
                    query: RecordQuery {
                        attribute_query: related.query.attribute_query.without_deferred(),
                        ..related.query.clone()
                    },
                    ..related.clone()
                })
                .collect(),
            deferred: Vec::new(),
            link: self
                .link
                .as_ref()
                .map(|link| Box::new(link.without_deferred())),
        }
    }

    /// Any deferred fetch anywhere below this query
    pub fn has_deferred(&self) -> bool {
        !self.deferred.is_empty()
            || self
                .x_to_one
                .iter()
                .any(|r| r.query.attribute_query.has_deferred())
            || self.link.as_ref().is_some_and(|l| l.has_deferred())
    }
}
