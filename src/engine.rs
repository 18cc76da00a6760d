use serde_json::Value;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::driver::{Database, SqliteDatabase};
use crate::error::DbResult;
use crate::mutation::{
    CreationExecutor, DeletionExecutor, RecordMutationEvent, UpdateExecutor,
};
use crate::query::{AttributeQueryItem, MatchExp, Modifier, QueryExecutor, Record, RecordQueryData};
use crate::schema::merged::MergedItemProcessor;
use crate::schema::Schema;
use crate::storage::map::EntityToTableMap;
use crate::storage::setup::DbSetup;

/// An entity-relation store over one database.
///
/// Owns the database adapter, the table map built from the schema and the
/// engine configuration. Every write runs in its own transaction and reports
/// the records it touched as mutation events.
pub struct Storage<D: Database> {
    db: D,
    map: EntityToTableMap,
    config: EngineConfig,
}

impl Storage<SqliteDatabase> {
    /// Open the SQLite database named by `config`
    pub fn open(schema: Schema, config: EngineConfig) -> DbResult<Self> {
        let db = SqliteDatabase::new(config.database.clone());
        Self::new(db, schema, config)
    }
}

impl<D: Database> Storage<D> {
    /// Process `schema`, map it onto tables and create them in `db`
    pub fn new(db: D, schema: Schema, config: EngineConfig) -> DbResult<Self> {
        config.validate()?;
        let schema = MergedItemProcessor::process(schema)?;
        let map = DbSetup::build(&schema, config.identifier_limit)?;

        db.open()?;
        DbSetup::create_tables(&map, &db)?;
        info!("Storage ready with {} tables", map.tables().len());

        Ok(Self { db, map, config })
    }

    pub fn map(&self) -> &EntityToTableMap {
        &self.map
    }

    pub fn db(&self) -> &D {
        &self.db
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn queries(&self) -> QueryExecutor<'_> {
        QueryExecutor::new(&self.map, &self.db, &self.config)
    }

    fn creation(&self) -> CreationExecutor<'_> {
        CreationExecutor::new(&self.map, &self.db, &self.config)
    }

    // ==================== Queries ====================

    pub fn find(
        &self,
        record_name: &str,
        match_expression: Option<MatchExp>,
        modifier: Option<Modifier>,
        attribute_query: &[AttributeQueryItem],
    ) -> DbResult<Vec<Record>> {
        self.queries()
            .find(record_name, match_expression, modifier, attribute_query)
    }

    pub fn find_one(
        &self,
        record_name: &str,
        match_expression: Option<MatchExp>,
        attribute_query: &[AttributeQueryItem],
    ) -> DbResult<Option<Record>> {
        self.queries()
            .find_one(record_name, match_expression, attribute_query)
    }

    /// Run a query given as data, including `label`/`goto` recursion
    pub fn find_data(&self, record_name: &str, data: &RecordQueryData) -> DbResult<Vec<Record>> {
        self.queries().find_data(record_name, data)
    }

    /// Records on the way from `start_id` to `end_id` along `attribute`
    pub fn find_path(
        &self,
        record_name: &str,
        attribute: &str,
        start_id: &Value,
        end_id: &Value,
    ) -> DbResult<Vec<Record>> {
        self.queries()
            .find_path(record_name, attribute, start_id, end_id, None)
    }

    // ==================== Writes ====================

    pub fn create(
        &self,
        record_name: &str,
        data: &Record,
        events: &mut Vec<RecordMutationEvent>,
    ) -> DbResult<Record> {
        self.in_transaction(events, |events| {
            self.creation().create_record(record_name, data, events)
        })
    }

    pub fn update(
        &self,
        record_name: &str,
        match_expression: Option<MatchExp>,
        data: &Record,
        events: &mut Vec<RecordMutationEvent>,
    ) -> DbResult<Vec<Record>> {
        self.in_transaction(events, |events| {
            let creation = self.creation();
            UpdateExecutor::new(&self.map, &creation).update(record_name, match_expression, data, events)
        })
    }

    pub fn delete(
        &self,
        record_name: &str,
        match_expression: Option<MatchExp>,
        events: &mut Vec<RecordMutationEvent>,
    ) -> DbResult<Vec<Record>> {
        self.in_transaction(events, |events| {
            let creation = self.creation();
            DeletionExecutor::new(&self.map, &creation).delete(record_name, match_expression, events)
        })
    }

    /// Link two stored records through `relation`
    pub fn add_link(
        &self,
        relation: &str,
        source_id: &Value,
        target_id: &Value,
        attributes: Option<&Record>,
        events: &mut Vec<RecordMutationEvent>,
    ) -> DbResult<Record> {
        let empty = Record::new();
        let attributes = attributes.unwrap_or(&empty);
        self.in_transaction(events, |events| {
            self.creation()
                .add_link(relation, source_id, target_id, attributes, events)
        })
    }

    pub fn close(&self) -> DbResult<()> {
        self.db.close()
    }

    /// Run `write` in a transaction. Its events reach `events` only once the
    /// transaction committed.
    fn in_transaction<T>(
        &self,
        events: &mut Vec<RecordMutationEvent>,
        write: impl FnOnce(&mut Vec<RecordMutationEvent>) -> DbResult<T>,
    ) -> DbResult<T> {
        self.db.begin()?;
        let mut pending = Vec::new();
        match write(&mut pending) {
            Ok(result) => {
                self.db.commit()?;
                events.append(&mut pending);
                Ok(result)
            }
            Err(e) => {
                if let Err(rollback) = self.db.rollback() {
                    warn!("Rollback failed after {}: {}", e, rollback);
                }
                Err(e)
            }
        }
    }
}
