use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Record '{0}' not found")]
    RecordNotFound(String),

    #[error("Attribute '{attribute}' is not defined on record '{record}'")]
    AttributeNotFound { record: String, attribute: String },

    #[error("Invalid attribute path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("Link '{0}' already exists")]
    DuplicateLink(String),

    #[error("Record '{0}' already exists")]
    DuplicateRecord(String),

    #[error("Unsupported match condition: {0}")]
    UnsupportedCondition(String),

    #[error("Invalid schema: {0}")]
    InvalidSchema(String),

    #[error("Invalid record data: {0}")]
    InvalidData(String),

    #[error("Row not found: {0}")]
    RowNotFound(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("SQLite error: {0}")]
    SqliteError(#[from] rusqlite::Error),
}

pub type DbResult<T> = Result<T, DbError>;

impl DbError {
    pub fn attribute_not_found(record: impl Into<String>, attribute: impl Into<String>) -> Self {
        DbError::AttributeNotFound {
            record: record.into(),
            attribute: attribute.into(),
        }
    }

    pub fn invalid_path(path: impl Into<String>, reason: impl Into<String>) -> Self {
        DbError::InvalidPath {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

impl serde::Serialize for DbError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = DbError::RecordNotFound("User".to_string());
        assert_eq!(err.to_string(), "Record 'User' not found");

        let err = DbError::attribute_not_found("User", "nickname");
        assert_eq!(
            err.to_string(),
            "Attribute 'nickname' is not defined on record 'User'"
        );

        let err = DbError::invalid_path("User.profile.&", "link symbol must follow a relation");
        assert_eq!(
            err.to_string(),
            "Invalid attribute path 'User.profile.&': link symbol must follow a relation"
        );

        let err = DbError::DuplicateLink("User_friends_friends_User(1, 2)".to_string());
        assert_eq!(
            err.to_string(),
            "Link 'User_friends_friends_User(1, 2)' already exists"
        );

        let err = DbError::DuplicateRecord("User 1".to_string());
        assert_eq!(err.to_string(), "Record 'User 1' already exists");

        let err = DbError::UnsupportedCondition("exist on value attribute".to_string());
        assert_eq!(
            err.to_string(),
            "Unsupported match condition: exist on value attribute"
        );
    }

    #[test]
    fn test_error_debug() {
        let err = DbError::RecordNotFound("test".to_string());
        let debug = format!("{:?}", err);
        assert!(debug.contains("RecordNotFound"));
    }

    #[test]
    fn test_error_serializes_as_message() {
        let err = DbError::InvalidData("missing source".to_string());
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json, serde_json::json!("Invalid record data: missing source"));
    }

    #[test]
    fn test_db_result_type() {
        let ok_result: DbResult<i32> = Ok(42);
        assert_eq!(ok_result.unwrap(), 42);

        let err_result: DbResult<i32> = Err(DbError::DatabaseError("locked".to_string()));
        assert!(err_result.is_err());
    }
}
