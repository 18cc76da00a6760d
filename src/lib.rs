pub mod config;
pub mod driver;
pub mod engine;
pub mod error;
pub mod mutation;
pub mod query;
pub mod schema;
pub mod storage;

pub use config::EngineConfig;
pub use driver::{Database, SqliteDatabase};
pub use engine::Storage;
pub use error::{DbError, DbResult};
pub use mutation::{MutationType, RecordMutationEvent};
pub use query::{
    AttributeQueryItem, Condition, ExitCondition, MatchExp, Modifier, OrderDirection, Record,
    RecordQueryData,
};
pub use schema::{DefaultValue, Entity, Property, PropertyType, Relation, RelationType, Schema};
pub use storage::EntityToTableMap;
