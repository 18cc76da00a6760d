//! Merged entity and relation expansion
//!
//! A merged record is the union of its inputs. Storage-wise the inputs are
//! folded into one stored root that owns every input's properties plus a
//! list-valued discriminator column. Each input becomes a filtered record of
//! that root, selected by the discriminator:
//!
//! ```text
//! Person = merge(Customer, Employee)
//!
//!   Person   { name, email, ..., __Person_input_entity }
//!   Customer = Person where __Person_input_entity contains "Customer"
//!   Employee = Person where __Person_input_entity contains "Employee"
//! ```
//!
//! When an input is itself a filtered record, its storage root is folded into
//! a generated virtual base instead and the merged record becomes a filtered
//! record of that base, matching the OR of every input's membership.

use std::collections::{BTreeMap, HashMap, HashSet};

use tracing::debug;

use super::{DefaultValue, Entity, Property, PropertyType, Relation, Schema};
use crate::error::{DbError, DbResult};
use crate::query::match_exp::{Condition, MatchExp};

/// Schema-build-time transform of merged declarations
pub struct MergedItemProcessor {
    schema: Schema,
    /// Root record -> merged record it was folded into
    folded: HashMap<String, String>,
}

impl MergedItemProcessor {
    /// Expand every merged entity and relation of `schema`
    pub fn process(schema: Schema) -> DbResult<Schema> {
        let mut processor = Self {
            schema,
            folded: HashMap::new(),
        };
        processor.schema.normalize();

        for name in processor.merged_entity_order()? {
            processor.expand_entity(&name)?;
        }

        let merged_relations: Vec<String> = processor
            .schema
            .relations
            .iter()
            .filter(|r| r.is_merged())
            .map(|r| r.name())
            .collect();
        for name in merged_relations {
            processor.expand_relation(&name)?;
        }

        processor.schema.normalize();
        processor.schema.validate()?;
        Ok(processor.schema)
    }

    /// Merged entities ordered so that inner merges come first
    fn merged_entity_order(&self) -> DbResult<Vec<String>> {
        fn visit(
            schema: &Schema,
            name: &str,
            visiting: &mut HashSet<String>,
            done: &mut HashSet<String>,
            order: &mut Vec<String>,
        ) -> DbResult<()> {
            if done.contains(name) {
                return Ok(());
            }
            if !visiting.insert(name.to_string()) {
                return Err(DbError::InvalidSchema(format!(
                    "merged entity '{}' includes itself",
                    name
                )));
            }
            let entity = schema
                .entity(name)
                .ok_or_else(|| DbError::InvalidSchema(format!("unknown entity '{}'", name)))?;

            let mut dependencies = entity.input_entities.clone();
            dependencies.extend(entity.base_entity.clone());
            for dependency in dependencies {
                let is_derived = schema
                    .entity(&dependency)
                    .map(|e| e.is_merged() || e.is_filtered())
                    .ok_or_else(|| {
                        DbError::InvalidSchema(format!(
                            "'{}' refers to unknown entity '{}'",
                            name, dependency
                        ))
                    })?;
                if is_derived {
                    visit(schema, &dependency, visiting, done, order)?;
                }
            }

            visiting.remove(name);
            done.insert(name.to_string());
            if entity.is_merged() {
                order.push(name.to_string());
            }
            Ok(())
        }

        let mut order = Vec::new();
        let mut visiting = HashSet::new();
        let mut done = HashSet::new();
        for entity in &self.schema.entities {
            visit(&self.schema, &entity.name, &mut visiting, &mut done, &mut order)?;
        }
        Ok(order)
    }

    fn get_entity(&self, name: &str) -> DbResult<&Entity> {
        self.schema
            .entity(name)
            .ok_or_else(|| DbError::InvalidSchema(format!("unknown entity '{}'", name)))
    }

    /// Filter chain of `name` up to its storage root: (root, matches)
    fn entity_chain(&self, name: &str) -> DbResult<(String, Vec<MatchExp>)> {
        let mut current = self.get_entity(name)?;
        let mut matches = Vec::new();
        let mut seen = HashSet::new();
        while let Some(base) = &current.base_entity {
            if !seen.insert(current.name.clone()) {
                return Err(DbError::InvalidSchema(format!(
                    "base chain of '{}' is cyclic",
                    name
                )));
            }
            matches.extend(current.match_expression.clone());
            current = self.get_entity(base)?;
        }
        Ok((current.name.clone(), matches))
    }

    fn expand_entity(&mut self, name: &str) -> DbResult<()> {
        let merged = self.get_entity(name)?.clone();
        let discriminator = format!("__{}_input_entity", name);

        let mut roots: Vec<String> = Vec::new();
        let mut memberships = Vec::new();
        let mut any_filtered = false;
        for input in &merged.input_entities {
            if let Some(owner) = self.folded.get(input) {
                return Err(DbError::InvalidSchema(format!(
                    "entity '{}' is already merged into '{}'",
                    input, owner
                )));
            }
            let (root, matches) = self.entity_chain(input)?;
            any_filtered |= !matches.is_empty();
            if !roots.contains(&root) {
                roots.push(root.clone());
            }
            memberships.push((root, matches));
        }

        let storage_root = if any_filtered {
            format!("__{}_base", name)
        } else {
            name.to_string()
        };

        let mut properties = unify_properties(
            std::iter::once((name.to_string(), merged.properties.clone())).chain(
                roots
                    .iter()
                    .map(|root| {
                        self.get_entity(root)
                            .map(|entity| (root.clone(), entity.properties.clone()))
                    })
                    .collect::<DbResult<Vec<_>>>()?,
            ),
        )?;
        let mut marker = Property::new(discriminator.clone(), PropertyType::String).collection();
        marker.discriminator_of = Some(storage_root.clone());
        properties.push(marker);

        for root in &roots {
            let entity = self
                .schema
                .entity_mut(root)
                .ok_or_else(|| DbError::InvalidSchema(format!("unknown entity '{}'", root)))?;
            entity.base_entity = Some(storage_root.clone());
            entity.match_expression = Some(contains(&discriminator, root));
            entity.properties.clear();
            self.folded.insert(root.clone(), name.to_string());
        }

        if any_filtered {
            let condition = MatchExp::any(memberships.into_iter().map(|(root, matches)| {
                let membership = contains(&discriminator, &root);
                MatchExp::all(matches)
                    .map(|chain| membership.clone().and(chain))
                    .unwrap_or(membership)
            }));
            let position = self
                .schema
                .entities
                .iter()
                .position(|e| e.name == name)
                .unwrap_or(0);
            let mut base = Entity::new(storage_root.clone());
            base.properties = properties;
            self.schema.entities.insert(position, base);

            let entity = self
                .schema
                .entity_mut(name)
                .ok_or_else(|| DbError::InvalidSchema(format!("unknown entity '{}'", name)))?;
            entity.base_entity = Some(storage_root.clone());
            entity.match_expression = condition;
            entity.input_entities.clear();
            entity.properties.clear();
        } else {
            let entity = self
                .schema
                .entity_mut(name)
                .ok_or_else(|| DbError::InvalidSchema(format!("unknown entity '{}'", name)))?;
            entity.input_entities.clear();
            entity.properties = properties;
        }

        debug!(
            "Merged entity {} stored as {} over {:?}",
            name, storage_root, roots
        );
        Ok(())
    }

    fn expand_relation(&mut self, name: &str) -> DbResult<()> {
        let merged = self
            .schema
            .relation(name)
            .cloned()
            .ok_or_else(|| DbError::InvalidSchema(format!("unknown relation '{}'", name)))?;
        let discriminator = format!("__{}_input_relation", name);

        let mut inputs: Vec<Relation> = Vec::new();
        for input in &merged.input_relations {
            let relation = self.schema.relation(input).cloned().ok_or_else(|| {
                DbError::InvalidSchema(format!("unknown input relation '{}'", input))
            })?;
            if relation.is_filtered() || relation.is_merged() {
                return Err(DbError::InvalidSchema(format!(
                    "input relation '{}' of '{}' must be a stored relation",
                    input, name
                )));
            }
            inputs.push(relation);
        }
        let first = inputs.first().ok_or_else(|| {
            DbError::InvalidSchema(format!("merged relation '{}' has no inputs", name))
        })?;
        let (source, target) = (first.source.clone(), first.target.clone());
        if inputs
            .iter()
            .any(|r| r.source != source || r.target != target)
        {
            return Err(DbError::InvalidSchema(format!(
                "inputs of merged relation '{}' must connect the same records",
                name
            )));
        }

        let mut properties = unify_properties(
            std::iter::once((name.to_string(), merged.properties.clone()))
                .chain(inputs.iter().map(|r| (r.name(), r.properties.clone()))),
        )?;
        let mut marker = Property::new(discriminator.clone(), PropertyType::String).collection();
        marker.discriminator_of = Some(name.to_string());
        properties.push(marker);

        for input in &inputs {
            let input_name = input.name();
            if let Some(relation) = self.schema.relation_mut(&input_name) {
                relation.base_relation = Some(name.to_string());
                relation.match_expression = Some(contains(&discriminator, &input_name));
                relation.properties.clear();
                relation.is_target_reliance = false;
            }
        }

        if let Some(relation) = self.schema.relation_mut(name) {
            relation.source = source;
            relation.target = target;
            relation.properties = properties;
            relation.input_relations.clear();
        }

        debug!("Merged relation {} over {:?}", name, merged.input_relations);
        Ok(())
    }
}

fn contains(discriminator: &str, name: &str) -> MatchExp {
    MatchExp::with(
        discriminator,
        Condition::Contains(serde_json::Value::String(name.to_string())),
    )
}

/// Union of property lists. Same-named properties must agree on type;
/// differing defaults become a dispatch on the owning record's name.
fn unify_properties(
    sources: impl IntoIterator<Item = (String, Vec<Property>)>,
) -> DbResult<Vec<Property>> {
    let mut unified: Vec<Property> = Vec::new();
    let mut defaults: Vec<BTreeMap<String, DefaultValue>> = Vec::new();

    for (owner, properties) in sources {
        for property in properties {
            match unified.iter().position(|p| p.name == property.name) {
                Some(index) => {
                    let existing = &unified[index];
                    if existing.property_type != property.property_type
                        || existing.collection != property.collection
                    {
                        return Err(DbError::InvalidSchema(format!(
                            "property '{}' has conflicting types across merged inputs",
                            property.name
                        )));
                    }
                    if let Some(default_value) = property.default_value {
                        defaults[index].insert(owner.clone(), default_value);
                    }
                }
                None => {
                    let mut cases = BTreeMap::new();
                    if let Some(default_value) = property.default_value.clone() {
                        cases.insert(owner.clone(), default_value);
                    }
                    defaults.push(cases);
                    unified.push(property);
                }
            }
        }
    }

    for (property, cases) in unified.iter_mut().zip(defaults) {
        let mut distinct = cases.values();
        let first = distinct.next();
        let all_equal = first.is_some() && distinct.all(|d| Some(d) == first);
        property.default_value = if cases.is_empty() {
            None
        } else if all_equal {
            first.cloned()
        } else {
            Some(DefaultValue::ByType { cases })
        };
    }

    Ok(unified)
}
