//! Identifier aliasing
//!
//! Table aliases are derived from attribute paths and field aliases from the
//! path plus the attribute, so nested queries quickly outgrow the identifier
//! length a database accepts. Every identifier handed to SQL goes through
//! [`AliasManager`], which keeps short names and remembers the path each one
//! stands for.

use std::collections::HashMap;

/// Shorten `name` to at most `limit` characters, keeping it stable and unique
/// with a seahash suffix.
pub fn shorten_identifier(name: &str, limit: usize) -> String {
    if name.chars().count() <= limit {
        return name.to_string();
    }
    let suffix = format!("{:x}", seahash::hash(name.as_bytes()));
    let keep = limit.saturating_sub(suffix.len() + 1);
    let prefix: String = name.chars().take(keep).collect();
    format!("{}_{}", prefix, suffix)
}

/// Path <-> alias indirection for one SQL statement tree
#[derive(Debug, Clone)]
pub struct AliasManager {
    limit: usize,
    tables: HashMap<String, String>,
    fields: HashMap<String, (Vec<String>, String)>,
    table_count: usize,
    field_count: usize,
}

impl AliasManager {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            tables: HashMap::new(),
            fields: HashMap::new(),
            table_count: 0,
            field_count: 0,
        }
    }

    /// Alias for a raw table alias derived from a path
    pub fn table_alias(&mut self, raw: &str) -> String {
        if raw.chars().count() <= self.limit {
            return raw.to_string();
        }
        if let Some(alias) = self.tables.get(raw) {
            return alias.clone();
        }
        self.table_count += 1;
        let alias = format!("T{}", self.table_count);
        self.tables.insert(raw.to_string(), alias.clone());
        alias
    }

    /// Column alias for `attribute` read at `path`
    pub fn field_alias(&mut self, path: &[String], attribute: &str) -> String {
        let mut raw = path.join(".");
        if !raw.is_empty() {
            raw.push('.');
        }
        raw.push_str(attribute);

        let alias = if raw.chars().count() <= self.limit {
            raw
        } else {
            self.field_count += 1;
            format!("F{}", self.field_count)
        };
        self.fields
            .insert(alias.clone(), (path.to_vec(), attribute.to_string()));
        alias
    }

    /// Path and attribute a field alias stands for
    pub fn field_path(&self, alias: &str) -> Option<&(Vec<String>, String)> {
        self.fields.get(alias)
    }
}
