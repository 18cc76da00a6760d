pub mod builder;
pub mod executor;
pub mod match_exp;
pub mod record_query;

pub use builder::{ColumnValue, FieldAlias, SelectStatement, SqlBuilder, Statement};
pub use executor::{QueryContext, QueryExecutor, Record};
pub use match_exp::{BoolExp, Condition, MatchAtom, MatchExp};
pub use record_query::{
    AttributeQuery, AttributeQueryItem, ExitCondition, Modifier, OrderBy, OrderDirection,
    RecordQuery, RecordQueryData, RelatedQuery,
};
