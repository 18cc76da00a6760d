//! Boolean match expressions
//!
//! A match expression is a boolean tree of atoms. Each atom compares the value
//! found at a dotted attribute path (`profile.title`, `posts.tags.name`) with a
//! [`Condition`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Boolean expression tree over arbitrary atoms
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BoolExp<T> {
    Atom {
        data: T,
    },
    And {
        left: Box<BoolExp<T>>,
        right: Box<BoolExp<T>>,
    },
    Or {
        left: Box<BoolExp<T>>,
        right: Box<BoolExp<T>>,
    },
    Not {
        body: Box<BoolExp<T>>,
    },
}

impl<T: Clone> BoolExp<T> {
    pub fn atom(data: T) -> Self {
        BoolExp::Atom { data }
    }

    pub fn and(self, other: BoolExp<T>) -> Self {
        BoolExp::And {
            left: Box::new(self),
            right: Box::new(other),
        }
    }

    pub fn or(self, other: BoolExp<T>) -> Self {
        BoolExp::Or {
            left: Box::new(self),
            right: Box::new(other),
        }
    }

    pub fn negate(self) -> Self {
        BoolExp::Not {
            body: Box::new(self),
        }
    }

    /// AND two optional expressions together
    pub fn and_option(left: Option<BoolExp<T>>, right: Option<BoolExp<T>>) -> Option<BoolExp<T>> {
        match (left, right) {
            (Some(l), Some(r)) => Some(l.and(r)),
            (Some(l), None) => Some(l),
            (None, r) => r,
        }
    }

    /// AND a list of expressions, `None` when the list is empty
    pub fn all(items: impl IntoIterator<Item = BoolExp<T>>) -> Option<BoolExp<T>> {
        items.into_iter().fold(None, |acc, item| Self::and_option(acc, Some(item)))
    }

    /// OR a list of expressions, `None` when the list is empty
    pub fn any(items: impl IntoIterator<Item = BoolExp<T>>) -> Option<BoolExp<T>> {
        items.into_iter().fold(None, |acc, item| match acc {
            Some(acc) => Some(acc.or(item)),
            None => Some(item),
        })
    }

    /// Rebuild the tree with every atom transformed
    pub fn try_map<U, E>(&self, f: &mut impl FnMut(&T) -> Result<U, E>) -> Result<BoolExp<U>, E> {
        Ok(match self {
            BoolExp::Atom { data } => BoolExp::Atom { data: f(data)? },
            BoolExp::And { left, right } => BoolExp::And {
                left: Box::new(left.try_map(f)?),
                right: Box::new(right.try_map(f)?),
            },
            BoolExp::Or { left, right } => BoolExp::Or {
                left: Box::new(left.try_map(f)?),
                right: Box::new(right.try_map(f)?),
            },
            BoolExp::Not { body } => BoolExp::Not {
                body: Box::new(body.try_map(f)?),
            },
        })
    }

    pub fn map<U>(&self, f: &mut impl FnMut(&T) -> U) -> BoolExp<U> {
        match self.try_map::<U, std::convert::Infallible>(&mut |atom| Ok(f(atom))) {
            Ok(mapped) => mapped,
            Err(never) => match never {},
        }
    }

    /// All atoms, left to right
    pub fn atoms(&self) -> Vec<&T> {
        let mut out = Vec::new();
        self.collect_atoms(&mut out);
        out
    }

    fn collect_atoms<'a>(&'a self, out: &mut Vec<&'a T>) {
        match self {
            BoolExp::Atom { data } => out.push(data),
            BoolExp::And { left, right } | BoolExp::Or { left, right } => {
                left.collect_atoms(out);
                right.collect_atoms(out);
            }
            BoolExp::Not { body } => body.collect_atoms(out),
        }
    }
}

/// Comparison applied to the value at an atom's key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "value")]
pub enum Condition {
    #[serde(rename = "=")]
    Eq(Value),
    #[serde(rename = "!=")]
    Ne(Value),
    #[serde(rename = "<")]
    Lt(Value),
    #[serde(rename = "<=")]
    Lte(Value),
    #[serde(rename = ">")]
    Gt(Value),
    #[serde(rename = ">=")]
    Gte(Value),
    #[serde(rename = "like")]
    Like(String),
    #[serde(rename = "in")]
    In(Vec<Value>),
    #[serde(rename = "between")]
    Between(Value, Value),
    /// JSON array column contains the value
    #[serde(rename = "contains")]
    Contains(Value),
    /// A related record matching the sub-expression exists
    #[serde(rename = "exist")]
    Exist(Box<MatchExp>),
    /// Equality with a column of an enclosing statement. Only the SQL
    /// builder creates it, when correlating a subquery.
    #[serde(skip)]
    RefEq(ColumnRef),
}

/// A column of an enclosing statement: table alias and field name
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnRef {
    pub(crate) table_alias: String,
    pub(crate) field: String,
}

/// One comparison in a match expression
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchAtom {
    pub key: String,
    pub condition: Condition,
}

impl MatchAtom {
    pub fn new(key: impl Into<String>, condition: Condition) -> Self {
        Self {
            key: key.into(),
            condition,
        }
    }

    /// Key split into attribute segments
    pub fn segments(&self) -> Vec<String> {
        self.key.split('.').map(str::to_string).collect()
    }
}

pub type MatchExp = BoolExp<MatchAtom>;

impl BoolExp<MatchAtom> {
    /// Single-atom expression
    pub fn with(key: impl Into<String>, condition: Condition) -> Self {
        BoolExp::atom(MatchAtom::new(key, condition))
    }

    /// `key = value`
    pub fn equals(key: impl Into<String>, value: Value) -> Self {
        Self::with(key, Condition::Eq(value))
    }

    /// Rewrite every key as `{prefix}.{key}`.
    ///
    /// Sub-expressions of `exist` stay relative to their own key.
    pub fn prefixed(&self, prefix: &str) -> Self {
        if prefix.is_empty() {
            return self.clone();
        }
        self.map(&mut |atom: &MatchAtom| MatchAtom {
            key: format!("{}.{}", prefix, atom.key),
            condition: atom.condition.clone(),
        })
    }
}
