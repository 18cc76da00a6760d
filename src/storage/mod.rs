pub mod alias;
pub mod map;
pub mod setup;

pub use alias::{shorten_identifier, AliasManager};
pub use map::{
    AttributeInfo, ColumnInfo, Direction, EntityToTableMap, JoinKind, LinkMapItem, LinkPlacement,
    RecordAttribute, RecordMapItem, TableAliasEntry, TableInfo, ValueAttribute,
};
pub use setup::DbSetup;
