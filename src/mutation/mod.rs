//! Writes
//!
//! Every write reports what it did as a list of [`RecordMutationEvent`]s,
//! one per record that appeared, changed or disappeared, including relation
//! records and the filtered records a row entered or left. The list is an
//! explicit output argument threaded through the call tree.

pub mod creation;
pub mod deletion;
pub mod filtered;
pub mod update;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{DbError, DbResult};
use crate::query::Record;
use crate::storage::map::{
    AttributeInfo, EntityToTableMap, RecordAttribute, ValueAttribute, ID_ATTRIBUTE, LINK_SYMBOL,
};

pub use creation::CreationExecutor;
pub use deletion::DeletionExecutor;
pub use filtered::FilteredEntityManager;
pub use update::UpdateExecutor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationType {
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordMutationEvent {
    #[serde(rename = "type")]
    pub event_type: MutationType,
    pub record_name: String,
    pub record: Record,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_record: Option<Record>,
}

impl RecordMutationEvent {
    pub fn create(record_name: impl Into<String>, record: Record) -> Self {
        Self {
            event_type: MutationType::Create,
            record_name: record_name.into(),
            record,
            old_record: None,
        }
    }

    pub fn update(record_name: impl Into<String>, record: Record, old_record: Record) -> Self {
        Self {
            event_type: MutationType::Update,
            record_name: record_name.into(),
            record,
            old_record: Some(old_record),
        }
    }

    pub fn delete(record_name: impl Into<String>, record: Record) -> Self {
        Self {
            event_type: MutationType::Delete,
            record_name: record_name.into(),
            record,
            old_record: None,
        }
    }
}

/// Record data of a write, split by attribute kind
#[derive(Debug, Clone)]
pub struct NewRecordData {
    pub record_name: String,
    /// Externally supplied id
    pub id: Option<Value>,
    pub values: Vec<(ValueAttribute, Value)>,
    pub related: Vec<RelatedData>,
    /// Relation record values given under `&`
    pub link: Record,
}

/// Related records given for one record attribute
#[derive(Debug, Clone)]
pub struct RelatedData {
    pub attribute: RecordAttribute,
    /// Empty when the attribute was given as `null`
    pub items: Vec<RelatedItem>,
}

#[derive(Debug, Clone)]
pub enum RelatedItem {
    /// Reference to a stored record, by id
    Existing { id: Value, link: Record },
    New(NewRecordData),
}

impl RelatedItem {
    /// Relation record values to write with the link
    pub fn link(&self) -> &Record {
        match self {
            RelatedItem::Existing { link, .. } => link,
            RelatedItem::New(data) => &data.link,
        }
    }
}

impl NewRecordData {
    pub fn parse(map: &EntityToTableMap, record_name: &str, data: &Record) -> DbResult<Self> {
        map.record(record_name)?;
        let mut parsed = Self {
            record_name: record_name.to_string(),
            id: None,
            values: Vec::new(),
            related: Vec::new(),
            link: Record::new(),
        };

        for (key, value) in data {
            if key == ID_ATTRIBUTE {
                if !value.is_null() {
                    parsed.id = Some(value.clone());
                }
                continue;
            }
            if key == LINK_SYMBOL {
                parsed.link = value.as_object().cloned().ok_or_else(|| {
                    DbError::InvalidData(format!("'{}' of {} must be an object", LINK_SYMBOL, record_name))
                })?;
                continue;
            }

            match map.get_attribute(record_name, key)? {
                AttributeInfo::Value(attribute) => {
                    if attribute.discriminator_of.is_some() {
                        return Err(DbError::InvalidData(format!(
                            "'{}' of {} is maintained by the engine",
                            key, record_name
                        )));
                    }
                    parsed.values.push((attribute, value.clone()));
                }
                AttributeInfo::Record(attribute) => {
                    if attribute.is_endpoint {
                        return Err(DbError::InvalidData(format!(
                            "'{}' of {} is set when the link is created",
                            key, record_name
                        )));
                    }
                    let items: Vec<&Value> = match value {
                        Value::Null => Vec::new(),
                        Value::Array(items) if attribute.is_collection => items.iter().collect(),
                        Value::Array(_) => {
                            return Err(DbError::InvalidData(format!(
                                "'{}' of {} takes a single record",
                                key, record_name
                            )))
                        }
                        other => vec![other],
                    };
                    let items = items
                        .into_iter()
                        .map(|item| RelatedItem::parse(map, &attribute.record, item))
                        .collect::<DbResult<Vec<_>>>()?;
                    parsed.related.push(RelatedData { attribute, items });
                }
                AttributeInfo::Link { .. } => {
                    return Err(DbError::invalid_path(key, "unexpected link symbol"))
                }
            }
        }
        Ok(parsed)
    }
}

impl RelatedItem {
    /// An object carrying an `id` (or a bare id) references a stored record
    fn parse(map: &EntityToTableMap, record_name: &str, value: &Value) -> DbResult<Self> {
        let object = match value {
            Value::Object(object) => object,
            Value::Number(_) | Value::String(_) => {
                return Ok(RelatedItem::Existing {
                    id: value.clone(),
                    link: Record::new(),
                })
            }
            other => {
                return Err(DbError::InvalidData(format!(
                    "expected a {} record, got {}",
                    record_name, other
                )))
            }
        };

        match object.get(ID_ATTRIBUTE) {
            Some(id) if !id.is_null() => {
                if let Some(key) = object.keys().find(|k| *k != ID_ATTRIBUTE && *k != LINK_SYMBOL) {
                    return Err(DbError::InvalidData(format!(
                        "reference to {} {} cannot carry '{}'",
                        record_name, id, key
                    )));
                }
                let link = match object.get(LINK_SYMBOL) {
                    Some(Value::Object(link)) => link.clone(),
                    _ => Record::new(),
                };
                Ok(RelatedItem::Existing {
                    id: id.clone(),
                    link,
                })
            }
            _ => Ok(RelatedItem::New(NewRecordData::parse(map, record_name, object)?)),
        }
    }
}
