//! Schema declaration model
//!
//! Entities, relations and their properties as declared by the application.
//! Derived declarations come in two forms: *filtered* records (a base record
//! narrowed by a match expression) and *merged* records (the union of several
//! inputs). Merged declarations are rewritten into stored roots plus filtered
//! children by [`merged::MergedItemProcessor`] before the table map is built.

pub mod merged;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};

use crate::error::{DbError, DbResult};
use crate::query::match_exp::MatchExp;

/// Scalar type of a value property
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PropertyType {
    String,
    Number,
    Boolean,
    Timestamp,
    Object,
}

impl PropertyType {
    /// SQLite column type
    pub fn sql_type(&self) -> &'static str {
        match self {
            PropertyType::String => "TEXT",
            PropertyType::Number | PropertyType::Timestamp => "NUMERIC",
            PropertyType::Boolean => "INTEGER",
            PropertyType::Object => "TEXT",
        }
    }
}

/// Default value strategy.
///
/// Every strategy is evaluated with the same inputs: the row being created
/// and the name of the concrete record the creation goes through.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum DefaultValue {
    Constant { value: Value },
    Uuid,
    /// Epoch milliseconds
    Now,
    CopyFrom { attribute: String },
    /// Dispatch on the concrete record name
    ByType { cases: BTreeMap<String, DefaultValue> },
}

impl DefaultValue {
    pub fn constant(value: Value) -> Self {
        DefaultValue::Constant { value }
    }

    /// Compute the default for `row` created as `concrete`
    pub fn resolve(&self, row: &Map<String, Value>, concrete: &str) -> Option<Value> {
        match self {
            DefaultValue::Constant { value } => Some(value.clone()),
            DefaultValue::Uuid => Some(Value::String(uuid::Uuid::new_v4().to_string())),
            DefaultValue::Now => Some(Value::from(chrono::Utc::now().timestamp_millis())),
            DefaultValue::CopyFrom { attribute } => {
                row.get(attribute).filter(|v| !v.is_null()).cloned()
            }
            DefaultValue::ByType { cases } => cases
                .get(concrete)
                .and_then(|case| case.resolve(row, concrete)),
        }
    }
}

/// A value property
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Property {
    pub name: String,
    #[serde(rename = "type")]
    pub property_type: PropertyType,
    #[serde(default)]
    pub collection: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<DefaultValue>,
    /// Set on generated discriminator properties: the merged record whose
    /// inputs this column lists
    #[serde(skip)]
    pub discriminator_of: Option<String>,
}

impl Property {
    pub fn new(name: impl Into<String>, property_type: PropertyType) -> Self {
        Self {
            name: name.into(),
            property_type,
            collection: false,
            default_value: None,
            discriminator_of: None,
        }
    }

    pub fn string(name: impl Into<String>) -> Self {
        Self::new(name, PropertyType::String)
    }

    pub fn number(name: impl Into<String>) -> Self {
        Self::new(name, PropertyType::Number)
    }

    pub fn boolean(name: impl Into<String>) -> Self {
        Self::new(name, PropertyType::Boolean)
    }

    pub fn collection(mut self) -> Self {
        self.collection = true;
        self
    }

    pub fn with_default(mut self, default_value: DefaultValue) -> Self {
        self.default_value = Some(default_value);
        self
    }

    /// Stored as JSON text
    pub fn is_json(&self) -> bool {
        self.collection || self.property_type == PropertyType::Object
    }
}

/// An entity declaration: plain, filtered (`base_entity` + `match_expression`)
/// or merged (`input_entities`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    pub name: String,
    #[serde(default)]
    pub properties: Vec<Property>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_entity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_expression: Option<MatchExp>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub input_entities: Vec<String>,
}

impl Entity {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            properties: Vec::new(),
            base_entity: None,
            match_expression: None,
            input_entities: Vec::new(),
        }
    }

    /// A subset of `base` holding the records that match `match_expression`
    pub fn filtered(
        name: impl Into<String>,
        base: impl Into<String>,
        match_expression: MatchExp,
    ) -> Self {
        Self {
            base_entity: Some(base.into()),
            match_expression: Some(match_expression),
            ..Self::new(name)
        }
    }

    /// The union of `inputs`
    pub fn merged(name: impl Into<String>, inputs: &[&str]) -> Self {
        Self {
            input_entities: inputs.iter().map(|s| s.to_string()).collect(),
            ..Self::new(name)
        }
    }

    pub fn property(mut self, property: Property) -> Self {
        self.properties.push(property);
        self
    }

    pub fn is_filtered(&self) -> bool {
        self.base_entity.is_some()
    }

    pub fn is_merged(&self) -> bool {
        !self.input_entities.is_empty()
    }
}

/// Cardinality of a relation, `source:target`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RelationType {
    #[serde(rename = "1:1")]
    OneToOne,
    #[serde(rename = "1:n")]
    OneToMany,
    #[serde(rename = "n:1")]
    ManyToOne,
    #[serde(rename = "n:n")]
    ManyToMany,
}

impl RelationType {
    /// A target is linked to at most one source
    pub fn source_is_one(&self) -> bool {
        matches!(self, RelationType::OneToOne | RelationType::OneToMany)
    }

    /// A source is linked to at most one target
    pub fn target_is_one(&self) -> bool {
        matches!(self, RelationType::OneToOne | RelationType::ManyToOne)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RelationType::OneToOne => "1:1",
            RelationType::OneToMany => "1:n",
            RelationType::ManyToOne => "n:1",
            RelationType::ManyToMany => "n:n",
        }
    }
}

/// A relation declaration: plain, filtered (`base_relation` +
/// `match_expression`) or merged (`input_relations`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Relation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub source: String,
    pub source_property: String,
    #[serde(default)]
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_property: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub relation_type: Option<RelationType>,
    #[serde(default)]
    pub properties: Vec<Property>,
    #[serde(default)]
    pub is_target_reliance: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_relation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_expression: Option<MatchExp>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub input_relations: Vec<String>,
}

impl Relation {
    pub fn new(
        source: impl Into<String>,
        source_property: impl Into<String>,
        target: impl Into<String>,
        target_property: impl Into<String>,
        relation_type: RelationType,
    ) -> Self {
        Self {
            name: None,
            source: source.into(),
            source_property: source_property.into(),
            target: target.into(),
            target_property: Some(target_property.into()),
            relation_type: Some(relation_type),
            properties: Vec::new(),
            is_target_reliance: false,
            base_relation: None,
            match_expression: None,
            input_relations: Vec::new(),
        }
    }

    /// A relation without a reverse attribute on the target
    pub fn one_way(
        source: impl Into<String>,
        source_property: impl Into<String>,
        target: impl Into<String>,
        relation_type: RelationType,
    ) -> Self {
        Self {
            target_property: None,
            ..Self::new(source, source_property, target, "", relation_type)
        }
    }

    /// A subset of the `base` relation. Endpoints are inherited from the base.
    pub fn filtered(
        name: impl Into<String>,
        base: impl Into<String>,
        source_property: impl Into<String>,
        target_property: impl Into<String>,
        match_expression: MatchExp,
    ) -> Self {
        Self {
            name: Some(name.into()),
            source: String::new(),
            source_property: source_property.into(),
            target: String::new(),
            target_property: Some(target_property.into()),
            relation_type: None,
            properties: Vec::new(),
            is_target_reliance: false,
            base_relation: Some(base.into()),
            match_expression: Some(match_expression),
            input_relations: Vec::new(),
        }
    }

    /// The union of `inputs`, which must connect the same records
    pub fn merged(
        name: impl Into<String>,
        source_property: impl Into<String>,
        target_property: impl Into<String>,
        inputs: &[&str],
    ) -> Self {
        Self {
            name: Some(name.into()),
            source: String::new(),
            source_property: source_property.into(),
            target: String::new(),
            target_property: Some(target_property.into()),
            relation_type: Some(RelationType::ManyToMany),
            properties: Vec::new(),
            is_target_reliance: false,
            base_relation: None,
            match_expression: None,
            input_relations: inputs.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn property(mut self, property: Property) -> Self {
        self.properties.push(property);
        self
    }

    /// The target's lifecycle depends on the source
    pub fn reliance(mut self) -> Self {
        self.is_target_reliance = true;
        self
    }

    /// Declared name or `{source}_{sourceProperty}_{targetProperty}_{target}`
    pub fn name(&self) -> String {
        self.name.clone().unwrap_or_else(|| {
            format!(
                "{}_{}_{}_{}",
                self.source,
                self.source_property,
                self.target_property.as_deref().unwrap_or(""),
                self.target
            )
        })
    }

    pub fn kind(&self) -> RelationType {
        self.relation_type.unwrap_or(RelationType::ManyToMany)
    }

    pub fn is_symmetric(&self) -> bool {
        self.source == self.target
            && self.target_property.as_deref() == Some(self.source_property.as_str())
    }

    pub fn is_filtered(&self) -> bool {
        self.base_relation.is_some()
    }

    pub fn is_merged(&self) -> bool {
        !self.input_relations.is_empty()
    }

    /// Attribute name on the target pointing back at the source
    pub fn reverse_property(&self) -> String {
        match self.target_property.as_deref() {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => format!("__{}_source", self.name()),
        }
    }
}

/// The complete declaration set an engine is built from
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    #[serde(default)]
    pub entities: Vec<Entity>,
    #[serde(default)]
    pub relations: Vec<Relation>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a JSON schema document
    pub fn from_json(content: &str) -> DbResult<Self> {
        Ok(serde_json::from_str(content)?)
    }

    pub fn with_entity(mut self, entity: Entity) -> Self {
        self.entities.push(entity);
        self
    }

    pub fn with_relation(mut self, relation: Relation) -> Self {
        self.relations.push(relation);
        self
    }

    pub fn entity(&self, name: &str) -> Option<&Entity> {
        self.entities.iter().find(|e| e.name == name)
    }

    pub fn entity_mut(&mut self, name: &str) -> Option<&mut Entity> {
        self.entities.iter_mut().find(|e| e.name == name)
    }

    pub fn relation(&self, name: &str) -> Option<&Relation> {
        self.relations
            .iter()
            .find(|r| r.name.as_deref() == Some(name))
    }

    pub fn relation_mut(&mut self, name: &str) -> Option<&mut Relation> {
        self.relations
            .iter_mut()
            .find(|r| r.name.as_deref() == Some(name))
    }

    /// Fix relation names and copy endpoints of filtered relations from
    /// their base.
    pub fn normalize(&mut self) {
        for relation in &mut self.relations {
            if relation.name.is_none() {
                relation.name = Some(relation.name());
            }
        }

        // bases may be declared after the relations filtering them
        loop {
            let resolved: HashMap<String, (String, String, Option<RelationType>)> = self
                .relations
                .iter()
                .filter(|r| !r.source.is_empty() && !r.target.is_empty())
                .map(|r| (r.name(), (r.source.clone(), r.target.clone(), r.relation_type)))
                .collect();

            let mut changed = false;
            for relation in &mut self.relations {
                if !relation.source.is_empty() {
                    continue;
                }
                let Some(base) = relation.base_relation.as_deref() else {
                    continue;
                };
                if let Some((source, target, kind)) = resolved.get(base) {
                    relation.source = source.clone();
                    relation.target = target.clone();
                    if relation.relation_type.is_none() {
                        relation.relation_type = *kind;
                    }
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
    }

    /// Structural checks on a normalized schema without merged declarations
    pub fn validate(&self) -> DbResult<()> {
        let mut names = HashSet::new();
        for name in self
            .entities
            .iter()
            .map(|e| e.name.clone())
            .chain(self.relations.iter().map(|r| r.name()))
        {
            if !names.insert(name.clone()) {
                return Err(DbError::InvalidSchema(format!(
                    "record name '{}' is declared twice",
                    name
                )));
            }
        }

        for entity in &self.entities {
            if entity.is_merged() {
                return Err(DbError::InvalidSchema(format!(
                    "merged entity '{}' was not expanded",
                    entity.name
                )));
            }
            if let Some(base) = &entity.base_entity {
                if self.entity(base).is_none() {
                    return Err(DbError::InvalidSchema(format!(
                        "base entity '{}' of '{}' does not exist",
                        base, entity.name
                    )));
                }
                if entity.match_expression.is_none() {
                    return Err(DbError::InvalidSchema(format!(
                        "filtered entity '{}' has no match expression",
                        entity.name
                    )));
                }
            }
            let mut seen = HashSet::new();
            for property in &entity.properties {
                if property.name == "id" || !seen.insert(property.name.as_str()) {
                    return Err(DbError::InvalidSchema(format!(
                        "property '{}' of '{}' is reserved or duplicated",
                        property.name, entity.name
                    )));
                }
            }
        }

        for relation in &self.relations {
            let name = relation.name();
            if relation.is_merged() {
                return Err(DbError::InvalidSchema(format!(
                    "merged relation '{}' was not expanded",
                    name
                )));
            }
            if let Some(base) = &relation.base_relation {
                if self.relation(base).is_none() {
                    return Err(DbError::InvalidSchema(format!(
                        "base relation '{}' of '{}' does not exist",
                        base, name
                    )));
                }
            }
            for endpoint in [&relation.source, &relation.target] {
                if self.entity(endpoint).is_none() {
                    return Err(DbError::InvalidSchema(format!(
                        "relation '{}' points at unknown entity '{}'",
                        name, endpoint
                    )));
                }
            }
            if relation.is_symmetric() && relation.kind() != RelationType::ManyToMany {
                return Err(DbError::InvalidSchema(format!(
                    "symmetric relation '{}' must be n:n",
                    name
                )));
            }
            if relation.source_property == "id" || relation.reverse_property() == "id" {
                return Err(DbError::InvalidSchema(format!(
                    "relation '{}' uses the reserved attribute name 'id'",
                    name
                )));
            }
        }

        Ok(())
    }
}
