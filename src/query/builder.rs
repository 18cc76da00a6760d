//! SQL generation
//!
//! [`SqlBuilder`] turns a compiled [`RecordQuery`] into one SELECT statement:
//! x:1 relations become LEFT JOINs along the aliases the map derives from
//! attribute paths, match expressions become a WHERE clause, and conditions
//! crossing x:n or symmetric relations become correlated `EXISTS` subqueries
//! over the relation record. It also builds the single-row INSERT, UPDATE and
//! DELETE statements the mutation executors issue.
//!
//! A builder is consumed by the statement it builds, so placeholders and
//! parameters always line up.

use serde_json::{Map, Value};
use std::collections::HashSet;

use super::match_exp::{ColumnRef, Condition, MatchAtom, MatchExp};
use super::record_query::{AttributeQuery, Modifier, RecordQuery};
use crate::driver::{Placeholder, Row};
use crate::error::{DbError, DbResult};
use crate::schema::PropertyType;
use crate::storage::alias::AliasManager;
use crate::storage::map::{
    AttributeInfo, EntityToTableMap, JoinKind, RecordAttribute, TableAliasEntry, ValueAttribute,
    ID_ATTRIBUTE, LINK_SYMBOL,
};

/// Quote an identifier
pub fn quote(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

/// A selected column and where its value goes in the result record
#[derive(Debug, Clone, PartialEq)]
pub struct FieldAlias {
    pub alias: String,
    /// Record attributes leading to the owning record
    pub path: Vec<String>,
    pub attribute: String,
    pub property_type: PropertyType,
    pub is_json: bool,
}

/// A SELECT with its parameters and column mapping
#[derive(Debug, Clone)]
pub struct SelectStatement {
    pub sql: String,
    pub params: Vec<Value>,
    pub field_aliases: Vec<FieldAlias>,
}

impl SelectStatement {
    /// Nest one flat result row into a record
    pub fn structure_row(&self, row: &Row) -> DbResult<Map<String, Value>> {
        let mut record = Map::new();
        for field in &self.field_aliases {
            let raw = match row.get(&field.alias) {
                None | Some(Value::Null) => continue,
                Some(raw) => raw.clone(),
            };
            let value = decode(field, raw)?;

            let mut target = &mut record;
            for segment in &field.path {
                let entry = target
                    .entry(segment.clone())
                    .or_insert_with(|| Value::Object(Map::new()));
                target = match entry {
                    Value::Object(map) => map,
                    _ => {
                        return Err(DbError::InvalidData(format!(
                            "column '{}' nests under the value '{}'",
                            field.alias, segment
                        )))
                    }
                };
            }
            target.insert(field.attribute.clone(), value);
        }
        Ok(record)
    }

    pub fn structure(&self, rows: &[Row]) -> DbResult<Vec<Map<String, Value>>> {
        rows.iter().map(|row| self.structure_row(row)).collect()
    }
}

fn decode(field: &FieldAlias, raw: Value) -> DbResult<Value> {
    if field.is_json {
        if let Value::String(text) = &raw {
            return Ok(serde_json::from_str(text)?);
        }
        return Ok(raw);
    }
    if field.property_type == PropertyType::Boolean {
        if let Some(n) = raw.as_i64() {
            return Ok(Value::Bool(n != 0));
        }
    }
    Ok(raw)
}

/// A column and the value written to it
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnValue {
    pub field: String,
    pub value: Value,
    /// Encode the value as JSON text
    pub is_json: bool,
}

impl ColumnValue {
    pub fn new(field: impl Into<String>, value: Value) -> Self {
        Self {
            field: field.into(),
            value,
            is_json: false,
        }
    }

    pub fn for_attribute(attribute: &ValueAttribute, value: Value) -> Self {
        Self {
            field: attribute.field.clone(),
            value,
            is_json: attribute.is_json,
        }
    }

    fn encoded(&self) -> Value {
        match &self.value {
            Value::Null => Value::Null,
            value if self.is_json => Value::String(value.to_string()),
            value => value.clone(),
        }
    }
}

/// A write statement
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<Value>,
}

/// Join bookkeeping for one FROM clause
struct Scope {
    record: String,
    root_alias: String,
    joins: Vec<String>,
    joined: HashSet<String>,
}

impl Scope {
    fn new(record: &str, root_alias: String) -> Self {
        let mut joined = HashSet::new();
        joined.insert(root_alias.clone());
        Self {
            record: record.to_string(),
            root_alias,
            joins: Vec::new(),
            joined,
        }
    }
}

pub struct SqlBuilder<'a> {
    map: &'a EntityToTableMap,
    aliases: AliasManager,
    placeholder: Placeholder,
    params: Vec<Value>,
    subqueries: usize,
}

impl<'a> SqlBuilder<'a> {
    pub fn new(map: &'a EntityToTableMap, placeholder: Placeholder, identifier_limit: usize) -> Self {
        Self {
            map,
            aliases: AliasManager::new(identifier_limit),
            placeholder,
            params: Vec::new(),
            subqueries: 0,
        }
    }

    // ==================== Select ====================

    pub fn select(mut self, query: &RecordQuery) -> DbResult<SelectStatement> {
        let item = self.map.record(&query.record_name)?;
        let mut scope = Scope::new(&item.name, item.name.clone());

        let mut fields = Vec::new();
        self.select_attributes(&mut scope, &query.attribute_query, &[], &mut fields)?;

        let conditions = self.conditions(&mut scope, query.match_expression.as_ref())?;
        let order = self.order_by(&mut scope, &query.modifier)?;

        let columns: Vec<String> = fields
            .iter()
            .map(|(column, field): &(String, FieldAlias)| {
                format!("{} AS {}", column, quote(&field.alias))
            })
            .collect();
        let root_alias = self.aliases.table_alias(&scope.root_alias);
        let sql = format!(
            "SELECT {} FROM {} AS {}{} WHERE {}{}{}",
            columns.join(", "),
            quote(&item.table),
            quote(&root_alias),
            scope.joins.concat(),
            conditions,
            order,
            paging(&query.modifier),
        );

        Ok(SelectStatement {
            sql,
            params: self.params,
            field_aliases: fields.into_iter().map(|(_, field)| field).collect(),
        })
    }

    fn select_attributes(
        &mut self,
        scope: &mut Scope,
        query: &AttributeQuery,
        path: &[String],
        fields: &mut Vec<(String, FieldAlias)>,
    ) -> DbResult<()> {
        for value in &query.values {
            self.select_value(scope, path, value, fields)?;
        }
        for related in &query.x_to_one {
            let mut child = path.to_vec();
            child.push(related.attribute.clone());
            let target = &related.query.attribute_query;
            if target.is_id_only() {
                self.select_value(scope, &child, ID_ATTRIBUTE, fields)?;
            } else {
                self.select_attributes(scope, target, &child, fields)?;
            }
            if let Some(link) = &target.link {
                child.push(LINK_SYMBOL.to_string());
                self.select_attributes(scope, link, &child, fields)?;
            }
        }
        Ok(())
    }

    fn select_value(
        &mut self,
        scope: &mut Scope,
        path: &[String],
        attribute: &str,
        fields: &mut Vec<(String, FieldAlias)>,
    ) -> DbResult<()> {
        let (column, info) = self.column(scope, path, attribute, false)?;
        let alias = self.aliases.field_alias(path, attribute);
        fields.push((
            column,
            FieldAlias {
                alias,
                path: path.to_vec(),
                attribute: attribute.to_string(),
                property_type: info.property_type,
                is_json: info.is_json,
            },
        ));
        Ok(())
    }

    /// Presence, record filter and match of the scope's record
    fn conditions(&mut self, scope: &mut Scope, match_expression: Option<&MatchExp>) -> DbResult<String> {
        let item = self.map.record(&scope.record)?;
        let root_alias = scope.root_alias.clone();
        let mut conditions = vec![format!("{} IS NOT NULL", self.col(&root_alias, &item.id_field))];
        if let Some(filter) = self.map.record_filter(&scope.record)? {
            conditions.push(self.where_clause(scope, &filter)?);
        }
        if let Some(expression) = match_expression {
            conditions.push(self.where_clause(scope, expression)?);
        }
        Ok(conditions.join(" AND "))
    }

    fn order_by(&mut self, scope: &mut Scope, modifier: &Modifier) -> DbResult<String> {
        let mut keys = Vec::new();
        for order in &modifier.order_by {
            let segments: Vec<String> = order.attribute.split('.').map(str::to_string).collect();
            let (attribute, path) = segments
                .split_last()
                .ok_or_else(|| DbError::invalid_path(&order.attribute, "empty order key"))?;
            self.ensure_single_valued(&scope.record, path, &order.attribute)?;
            let (column, _) = self.column(scope, path, attribute, false)?;
            keys.push(format!("{} {}", column, order.direction.as_sql()));
        }
        if keys.is_empty() {
            return Ok(String::new());
        }
        Ok(format!(" ORDER BY {}", keys.join(", ")))
    }

    fn ensure_single_valued(&self, record: &str, path: &[String], key: &str) -> DbResult<()> {
        let mut current = record.to_string();
        for (index, segment) in path.iter().enumerate() {
            if segment == LINK_SYMBOL {
                current = self.map.get_record_by_path(record, &path[..=index])?;
                continue;
            }
            match self.map.get_attribute(&current, segment)? {
                AttributeInfo::Record(attribute) if attribute.is_joinable() => {
                    current = attribute.record;
                }
                _ => return Err(DbError::invalid_path(key, "order keys must follow x:1 attributes")),
            }
        }
        Ok(())
    }

    // ==================== Columns and joins ====================

    fn col(&mut self, raw_alias: &str, field: &str) -> String {
        format!("{}.{}", quote(&self.aliases.table_alias(raw_alias)), quote(field))
    }

    fn column(
        &mut self,
        scope: &mut Scope,
        path: &[String],
        attribute: &str,
        dont_shrink: bool,
    ) -> DbResult<(String, ValueAttribute)> {
        let (column, info) = self.column_ref(scope, path, attribute, dont_shrink)?;
        Ok((column_sql(&column), info))
    }

    /// Column reading `attribute` of the record at `path`, joining what it needs
    fn column_ref(
        &mut self,
        scope: &mut Scope,
        path: &[String],
        attribute: &str,
        dont_shrink: bool,
    ) -> DbResult<(ColumnRef, ValueAttribute)> {
        let (alias, field, _) = self.map.get_table_alias_and_field_name(
            &scope.record,
            path,
            attribute,
            dont_shrink,
            &scope.root_alias,
        )?;
        let stack = self
            .map
            .get_table_and_alias_stack(&scope.record, path, &scope.root_alias)?;
        if let Some((last, init)) = stack.split_last() {
            for entry in init {
                self.join_entry(scope, entry, false)?;
            }
            if alias == last.alias {
                self.join_entry(scope, last, false)?;
            } else if last.link_alias.as_deref() == Some(alias.as_str()) {
                self.join_entry(scope, last, true)?;
            }
        }

        let mut full = path.to_vec();
        full.push(attribute.to_string());
        let info = match self.map.get_info(&scope.record, &full)? {
            AttributeInfo::Value(value) => value,
            _ => return Err(DbError::invalid_path(full.join("."), "not a value attribute")),
        };
        let column = ColumnRef {
            table_alias: self.aliases.table_alias(&alias),
            field,
        };
        Ok((column, info))
    }

    fn join(&mut self, scope: &mut Scope, raw_alias: &str, table: &str, on: String) {
        if scope.joined.insert(raw_alias.to_string()) {
            let alias = self.aliases.table_alias(raw_alias);
            scope
                .joins
                .push(format!(" LEFT JOIN {} AS {} ON {}", quote(table), quote(&alias), on));
        }
    }

    /// Join one path step; `link_only` stops at the relation table
    fn join_entry(&mut self, scope: &mut Scope, entry: &TableAliasEntry, link_only: bool) -> DbResult<()> {
        // `&` steps reuse an alias the previous step joined
        let Some(join) = &entry.join else {
            return Ok(());
        };
        let target_id = self.map.record(&entry.record)?.id_field.clone();
        let parent_id = self.map.record(&entry.parent_record)?.id_field.clone();

        match join {
            JoinKind::SameRow => {}
            JoinKind::ForeignKeyInParent { field } => {
                let left = self.col(&entry.alias, &target_id);
                let right = self.col(&entry.parent_alias, field);
                self.join(scope, &entry.alias, &entry.table, format!("{} = {}", left, right));
            }
            JoinKind::ForeignKeyInTarget { field } => {
                let left = self.col(&entry.alias, field);
                let right = self.col(&entry.parent_alias, &parent_id);
                self.join(scope, &entry.alias, &entry.table, format!("{} = {}", left, right));
            }
            JoinKind::ThroughLinkTable {
                table,
                near_field,
                far_field,
            } => {
                let link_alias = entry.link_alias.clone().unwrap_or_default();
                let left = self.col(&link_alias, near_field);
                let right = self.col(&entry.parent_alias, &parent_id);
                self.join(scope, &link_alias, table, format!("{} = {}", left, right));
                if !link_only {
                    let left = self.col(&entry.alias, &target_id);
                    let right = self.col(&link_alias, far_field);
                    self.join(scope, &entry.alias, &entry.table, format!("{} = {}", left, right));
                }
            }
        }
        Ok(())
    }

    // ==================== Where ====================

    fn where_clause(&mut self, scope: &mut Scope, expression: &MatchExp) -> DbResult<String> {
        Ok(match expression {
            MatchExp::Atom { data } => self.atom(scope, data)?,
            MatchExp::And { left, right } => {
                let left = self.where_clause(scope, left)?;
                let right = self.where_clause(scope, right)?;
                format!("({} AND {})", left, right)
            }
            MatchExp::Or { left, right } => {
                let left = self.where_clause(scope, left)?;
                let right = self.where_clause(scope, right)?;
                format!("({} OR {})", left, right)
            }
            MatchExp::Not { body } => format!("NOT ({})", self.where_clause(scope, body)?),
        })
    }

    fn atom(&mut self, scope: &mut Scope, atom: &MatchAtom) -> DbResult<String> {
        let segments = atom.segments();
        if segments.last().map(String::as_str) == Some(LINK_SYMBOL) {
            return Err(DbError::invalid_path(&atom.key, "key ends at a link symbol"));
        }

        let mut record = scope.record.clone();
        for (index, segment) in segments.iter().enumerate() {
            if segment == LINK_SYMBOL {
                record = self.map.get_record_by_path(&scope.record, &segments[..=index])?;
                continue;
            }
            let is_last = index + 1 == segments.len();
            match self.map.get_attribute(&record, segment)? {
                AttributeInfo::Value(_) if is_last => break,
                AttributeInfo::Value(_) => {
                    return Err(DbError::invalid_path(
                        &atom.key,
                        format!("'{}' is a value attribute", segment),
                    ))
                }
                AttributeInfo::Record(attribute) => {
                    let exist = is_last && matches!(atom.condition, Condition::Exist(_));
                    if attribute.is_endpoint && exist {
                        return self.endpoint_exists(scope, &segments, &atom.condition);
                    }
                    if !attribute.is_joinable() || exist {
                        return self.exists(
                            scope,
                            &segments[..index],
                            &attribute,
                            &segments[index + 1..],
                            &atom.condition,
                        );
                    }
                    if is_last {
                        return self.comparison(scope, &segments, ID_ATTRIBUTE, &atom.condition);
                    }
                    record = attribute.record;
                }
                AttributeInfo::Link { .. } => {
                    return Err(DbError::invalid_path(&atom.key, "unexpected link symbol"))
                }
            }
        }

        let (attribute, path) = segments
            .split_last()
            .ok_or_else(|| DbError::invalid_path(&atom.key, "empty key"))?;
        self.comparison(scope, path, attribute, &atom.condition)
    }

    fn comparison(
        &mut self,
        scope: &mut Scope,
        path: &[String],
        attribute: &str,
        condition: &Condition,
    ) -> DbResult<String> {
        let (column, info) = self.column(scope, path, attribute, false)?;
        let sql = match condition {
            Condition::Eq(Value::Null) => format!("{} IS NULL", column),
            Condition::Ne(Value::Null) => format!("{} IS NOT NULL", column),
            Condition::Eq(value) => format!("{} = {}", column, self.param(&info, value)),
            Condition::Ne(value) => format!("{} != {}", column, self.param(&info, value)),
            Condition::Lt(value) => format!("{} < {}", column, self.param(&info, value)),
            Condition::Lte(value) => format!("{} <= {}", column, self.param(&info, value)),
            Condition::Gt(value) => format!("{} > {}", column, self.param(&info, value)),
            Condition::Gte(value) => format!("{} >= {}", column, self.param(&info, value)),
            Condition::Like(pattern) => {
                format!("{} LIKE {}", column, self.bind(Value::String(pattern.clone())))
            }
            Condition::In(values) if values.is_empty() => "1 = 0".to_string(),
            Condition::In(values) => {
                let tokens: Vec<String> = values.iter().map(|v| self.param(&info, v)).collect();
                format!("{} IN ({})", column, tokens.join(", "))
            }
            Condition::Between(low, high) => {
                let low = self.param(&info, low);
                let high = self.param(&info, high);
                format!("{} BETWEEN {} AND {}", column, low, high)
            }
            Condition::Contains(value) => {
                if !info.is_json {
                    return Err(DbError::UnsupportedCondition(format!(
                        "contains on non-collection attribute '{}'",
                        attribute
                    )));
                }
                format!(
                    "EXISTS (SELECT 1 FROM json_each({}) WHERE json_each.value = {})",
                    column,
                    self.bind(value.clone())
                )
            }
            Condition::Exist(_) => {
                return Err(DbError::UnsupportedCondition(format!(
                    "exist on value attribute '{}'",
                    attribute
                )))
            }
            Condition::RefEq(reference) => format!("{} = {}", column, column_sql(reference)),
        };
        Ok(sql)
    }

    fn param(&mut self, attribute: &ValueAttribute, value: &Value) -> String {
        let value = ColumnValue::for_attribute(attribute, value.clone()).encoded();
        self.bind(value)
    }

    fn bind(&mut self, value: Value) -> String {
        self.params.push(value);
        self.placeholder.next()
    }

    /// `exist` on a relation record's endpoint, which is always one row away
    fn endpoint_exists(&mut self, scope: &mut Scope, segments: &[String], condition: &Condition) -> DbResult<String> {
        let (id, _) = self.column(scope, segments, ID_ATTRIBUTE, false)?;
        let Condition::Exist(sub) = condition else {
            return Err(DbError::UnsupportedCondition("expected exist".to_string()));
        };
        let sub = sub.prefixed(&segments.join("."));
        Ok(format!("({} IS NOT NULL AND {})", id, self.where_clause(scope, &sub)?))
    }

    /// Correlated subquery over the relation record of `attribute`.
    ///
    /// `owner_path` leads from the scope to the attribute's owner and `rest`
    /// is the remainder of the key after the attribute.
    fn exists(
        &mut self,
        scope: &mut Scope,
        owner_path: &[String],
        attribute: &RecordAttribute,
        rest: &[String],
        condition: &Condition,
    ) -> DbResult<String> {
        let (owner_id, _) = self.column_ref(scope, owner_path, ID_ATTRIBUTE, false)?;
        let directions = if attribute.is_undirected_symmetric() {
            vec![("source", "target"), ("target", "source")]
        } else {
            vec![attribute.near_far()]
        };
        let target_filter = self.map.record_filter(&attribute.record)?;

        let mut variants = Vec::new();
        for (near, far) in directions {
            let sub = match (rest.split_first(), condition) {
                (None, Condition::Exist(sub)) => Some(sub.prefixed(far)),
                (None, other) => Some(MatchExp::with(format!("{}.{}", far, ID_ATTRIBUTE), other.clone())),
                (Some((first, link_rest)), _) if first == LINK_SYMBOL => {
                    if link_rest.is_empty() {
                        return Err(DbError::invalid_path(LINK_SYMBOL, "key ends at a link symbol"));
                    }
                    Some(MatchExp::with(link_rest.join("."), condition.clone()))
                }
                (Some(_), _) => Some(MatchExp::with(format!("{}.{}", far, rest.join(".")), condition.clone())),
            };
            let correlation = MatchExp::with(
                format!("{}.{}", near, ID_ATTRIBUTE),
                Condition::RefEq(owner_id.clone()),
            );
            let expression = MatchExp::all(
                std::iter::once(correlation)
                    .chain(sub)
                    .chain(target_filter.as_ref().map(|f| f.prefixed(far))),
            );
            variants.push(self.subquery(&attribute.relation, expression.as_ref())?);
        }

        Ok(match variants.len() {
            1 => variants.remove(0),
            _ => format!("({})", variants.join(" OR ")),
        })
    }

    fn subquery(&mut self, record: &str, expression: Option<&MatchExp>) -> DbResult<String> {
        self.subqueries += 1;
        let item = self.map.record(record)?;
        let mut scope = Scope::new(&item.name, format!("sq{}_{}", self.subqueries, item.name));
        let conditions = self.conditions(&mut scope, expression)?;
        let alias = self.aliases.table_alias(&scope.root_alias);
        Ok(format!(
            "EXISTS (SELECT 1 FROM {} AS {}{} WHERE {})",
            quote(&item.table),
            quote(&alias),
            scope.joins.concat(),
            conditions
        ))
    }

    // ==================== Writes ====================

    pub fn insert(mut self, table: &str, values: &[ColumnValue]) -> Statement {
        let columns: Vec<String> = values.iter().map(|v| quote(&v.field)).collect();
        let tokens: Vec<String> = values.iter().map(|v| self.bind(v.encoded())).collect();
        Statement {
            sql: format!(
                "INSERT INTO {} ({}) VALUES ({})",
                quote(table),
                columns.join(", "),
                tokens.join(", ")
            ),
            params: self.params,
        }
    }

    pub fn update(mut self, table: &str, values: &[ColumnValue], key_field: &str, key: &Value) -> Statement {
        let assignments: Vec<String> = values
            .iter()
            .map(|v| format!("{} = {}", quote(&v.field), self.bind(v.encoded())))
            .collect();
        let key = self.bind(key.clone());
        Statement {
            sql: format!(
                "UPDATE {} SET {} WHERE {} = {}",
                quote(table),
                assignments.join(", "),
                quote(key_field),
                key
            ),
            params: self.params,
        }
    }

    pub fn delete(mut self, table: &str, key_field: &str, key: &Value) -> Statement {
        let key = self.bind(key.clone());
        Statement {
            sql: format!("DELETE FROM {} WHERE {} = {}", quote(table), quote(key_field), key),
            params: self.params,
        }
    }

    /// Every raw column of the row whose `key_field` is `key`
    pub fn select_row(mut self, table: &str, key_field: &str, key: &Value) -> Statement {
        let key = self.bind(key.clone());
        Statement {
            sql: format!("SELECT * FROM {} WHERE {} = {}", quote(table), quote(key_field), key),
            params: self.params,
        }
    }
}

fn column_sql(column: &ColumnRef) -> String {
    format!("{}.{}", quote(&column.table_alias), quote(&column.field))
}

fn paging(modifier: &Modifier) -> String {
    match (modifier.limit, modifier.offset) {
        (Some(limit), Some(offset)) => format!(" LIMIT {} OFFSET {}", limit, offset),
        (Some(limit), None) => format!(" LIMIT {}", limit),
        (None, Some(offset)) => format!(" LIMIT -1 OFFSET {}", offset),
        (None, None) => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::PlaceholderStyle;
    use crate::query::record_query::{AttributeQueryItem, OrderDirection, RecordQueryData};
    use crate::schema::merged::MergedItemProcessor;
    use crate::schema::{Entity, Property, Relation, RelationType, Schema};
    use crate::storage::setup::DbSetup;
    use serde_json::json;

    fn fixture() -> EntityToTableMap {
        let schema = Schema::new()
            .with_entity(
                Entity::new("User")
                    .property(Property::string("name"))
                    .property(Property::number("age"))
                    .property(Property::boolean("active"))
                    .property(Property::string("tags").collection()),
            )
            .with_entity(Entity::new("Team").property(Property::string("name")))
            .with_entity(Entity::new("Post").property(Property::string("title")))
            .with_relation(
                Relation::new("User", "team", "Team", "members", RelationType::ManyToOne)
                    .property(Property::string("role")),
            )
            .with_relation(Relation::new("User", "posts", "Post", "author", RelationType::OneToMany))
            .with_relation(Relation::new("User", "friends", "User", "friends", RelationType::ManyToMany));
        DbSetup::build(&MergedItemProcessor::process(schema).unwrap(), 63).unwrap()
    }

    fn select(map: &EntityToTableMap, data: RecordQueryData) -> SelectStatement {
        let query = RecordQuery::compile(map, "User", &data).unwrap();
        SqlBuilder::new(map, Placeholder::new(PlaceholderStyle::Question), 63)
            .select(&query)
            .unwrap()
    }

    fn items(names: &[&str]) -> Vec<AttributeQueryItem> {
        names.iter().map(|n| AttributeQueryItem::name(*n)).collect()
    }

    #[test]
    fn test_select_values() {
        let map = fixture();
        let statement = select(&map, RecordQueryData::attributes(items(&["name"])));
        assert_eq!(
            statement.sql,
            "SELECT \"User\".\"User_id\" AS \"id\", \"User\".\"User_name\" AS \"name\" \
             FROM \"User\" AS \"User\" WHERE \"User\".\"User_id\" IS NOT NULL"
        );
        assert!(statement.params.is_empty());
    }

    #[test]
    fn test_x_to_one_joins_and_shrinks() {
        let map = fixture();
        let statement = select(
            &map,
            RecordQueryData::attributes(vec![AttributeQueryItem::name("team")]),
        );
        // only the id is requested, so the foreign key is read without a join
        assert!(!statement.sql.contains("LEFT JOIN"));
        assert!(statement.sql.contains("\"User_team_members_Team_target\" AS \"team.id\""));

        let statement = select(
            &map,
            RecordQueryData::attributes(vec![AttributeQueryItem::nested(
                "team",
                RecordQueryData::attributes(vec![
                    AttributeQueryItem::name("name"),
                    AttributeQueryItem::nested("&", RecordQueryData::attributes(items(&["role"]))),
                ]),
            )]),
        );
        assert!(statement
            .sql
            .contains("LEFT JOIN \"Team\" AS \"User_team\" ON \"User_team\".\"Team_id\" = \"User\".\"User_team_members_Team_target\""));
        assert!(statement.sql.contains("AS \"team.&.role\""));
        assert_eq!(statement.field_aliases.len(), 5);
    }

    #[test]
    fn test_where_lowering() {
        let map = fixture();
        let statement = select(
            &map,
            RecordQueryData {
                match_expression: Some(
                    MatchExp::equals("name", json!("a"))
                        .and(MatchExp::with("age", Condition::Between(json!(1), json!(9))))
                        .or(MatchExp::with("team.name", Condition::Eq(Value::Null))),
                ),
                ..RecordQueryData::default()
            },
        );
        assert!(statement.sql.contains(
            "((\"User\".\"User_name\" = ? AND \"User\".\"User_age\" BETWEEN ? AND ?) OR \"User_team\".\"Team_name\" IS NULL)"
        ));
        assert_eq!(statement.params, vec![json!("a"), json!(1), json!(9)]);
    }

    #[test]
    fn test_collection_conditions() {
        let map = fixture();
        let statement = select(
            &map,
            RecordQueryData {
                match_expression: Some(
                    MatchExp::with("tags", Condition::Contains(json!("x")))
                        .and(MatchExp::with("id", Condition::In(vec![]))),
                ),
                ..RecordQueryData::default()
            },
        );
        assert!(statement
            .sql
            .contains("EXISTS (SELECT 1 FROM json_each(\"User\".\"User_tags\") WHERE json_each.value = ?)"));
        assert!(statement.sql.contains("1 = 0"));
    }

    #[test]
    fn test_x_to_many_match_uses_exists() {
        let map = fixture();
        let statement = select(
            &map,
            RecordQueryData {
                match_expression: Some(MatchExp::equals("posts.title", json!("hello"))),
                ..RecordQueryData::default()
            },
        );
        assert!(statement.sql.contains("EXISTS (SELECT 1 FROM \"Post\" AS \"sq1_User_posts_author_Post\""));
        assert!(statement.sql.contains("= \"User\".\"User_id\""));
        assert_eq!(statement.params, vec![json!("hello")]);
    }

    #[test]
    fn test_symmetric_match_checks_both_directions() {
        let map = fixture();
        let statement = select(
            &map,
            RecordQueryData {
                match_expression: Some(MatchExp::equals("friends.name", json!("b"))),
                ..RecordQueryData::default()
            },
        );
        assert!(statement.sql.contains("sq1_"));
        assert!(statement.sql.contains("sq2_"));
        assert!(statement.sql.contains(" OR "));
        assert_eq!(statement.params.len(), 2);
    }

    #[test]
    fn test_exist_on_value_is_unsupported() {
        let map = fixture();
        let query = RecordQuery::compile(
            &map,
            "User",
            &RecordQueryData {
                match_expression: Some(MatchExp::with(
                    "name",
                    Condition::Exist(Box::new(MatchExp::equals("x", json!(1)))),
                )),
                ..RecordQueryData::default()
            },
        )
        .unwrap();
        let err = SqlBuilder::new(&map, Placeholder::new(PlaceholderStyle::Question), 63)
            .select(&query)
            .unwrap_err();
        assert!(matches!(err, DbError::UnsupportedCondition(_)));
    }

    #[test]
    fn test_order_and_paging() {
        let map = fixture();
        let statement = select(
            &map,
            RecordQueryData {
                modifier: Some(Modifier {
                    offset: Some(5),
                    ..Modifier::default().order("team.name", OrderDirection::Desc)
                }),
                ..RecordQueryData::default()
            },
        );
        assert!(statement.sql.ends_with(" ORDER BY \"User_team\".\"Team_name\" DESC LIMIT -1 OFFSET 5"));

        let query = RecordQuery::compile(
            &map,
            "User",
            &RecordQueryData {
                modifier: Some(Modifier::default().order("posts.title", OrderDirection::Asc)),
                ..RecordQueryData::default()
            },
        )
        .unwrap();
        assert!(SqlBuilder::new(&map, Placeholder::new(PlaceholderStyle::Question), 63)
            .select(&query)
            .is_err());
    }

    #[test]
    fn test_structure_row() {
        let map = fixture();
        let statement = select(
            &map,
            RecordQueryData::attributes(vec![
                AttributeQueryItem::name("active"),
                AttributeQueryItem::name("tags"),
                AttributeQueryItem::nested("team", RecordQueryData::attributes(items(&["name"]))),
            ]),
        );
        let mut row = Row::new();
        row.insert("id".into(), json!(1));
        row.insert("active".into(), json!(1));
        row.insert("tags".into(), json!("[\"a\"]"));
        row.insert("team.id".into(), json!(3));
        row.insert("team.name".into(), Value::Null);

        let record = statement.structure_row(&row).unwrap();
        assert_eq!(
            Value::Object(record),
            json!({"id": 1, "active": true, "tags": ["a"], "team": {"id": 3}})
        );
    }

    #[test]
    fn test_structure_row_rejects_nesting_under_value() {
        let field = |alias: &str, path: &[&str], attribute: &str| FieldAlias {
            alias: alias.to_string(),
            path: path.iter().map(|p| p.to_string()).collect(),
            attribute: attribute.to_string(),
            property_type: PropertyType::String,
            is_json: false,
        };
        let statement = SelectStatement {
            sql: String::new(),
            params: Vec::new(),
            field_aliases: vec![field("name", &[], "name"), field("name.first", &["name"], "first")],
        };
        let mut row = Row::new();
        row.insert("name".into(), json!("a"));
        row.insert("name.first".into(), json!("b"));
        assert!(matches!(statement.structure_row(&row), Err(DbError::InvalidData(_))));
    }

    #[test]
    fn test_write_statements() {
        let map = fixture();
        let placeholder = || Placeholder::new(PlaceholderStyle::Numbered);
        let insert = SqlBuilder::new(&map, placeholder(), 63).insert(
            "User",
            &[
                ColumnValue::new("User_id", json!(1)),
                ColumnValue {
                    field: "User_tags".into(),
                    value: json!(["a"]),
                    is_json: true,
                },
            ],
        );
        assert_eq!(insert.sql, "INSERT INTO \"User\" (\"User_id\", \"User_tags\") VALUES ($1, $2)");
        assert_eq!(insert.params, vec![json!(1), json!("[\"a\"]")]);

        let update = SqlBuilder::new(&map, placeholder(), 63).update(
            "User",
            &[ColumnValue::new("User_name", json!("b"))],
            "User_id",
            &json!(1),
        );
        assert_eq!(update.sql, "UPDATE \"User\" SET \"User_name\" = $1 WHERE \"User_id\" = $2");

        let delete = SqlBuilder::new(&map, placeholder(), 63).delete("User", "User_id", &json!(1));
        assert_eq!(delete.sql, "DELETE FROM \"User\" WHERE \"User_id\" = $1");
    }
}
