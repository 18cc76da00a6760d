//! Engine configuration
//!
//! Loaded from an `erstore.toml` file. Missing keys fall back to defaults.
//!
//! ## Environment Variables
//!
//! - `ERSTORE_DATABASE` - SQLite database path (overrides `database`)
//! - `ERSTORE_IDENTIFIER_LIMIT` - maximum identifier length

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{DbError, DbResult};

/// Configuration file name
pub const CONFIG_FILE_NAME: &str = "erstore.toml";

/// Environment variable names
pub const ENV_DATABASE: &str = "ERSTORE_DATABASE";
pub const ENV_IDENTIFIER_LIMIT: &str = "ERSTORE_IDENTIFIER_LIMIT";

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// SQLite database path, or `:memory:`
    #[serde(default = "default_database")]
    pub database: String,
    /// Longest table, column or alias name handed to the database
    #[serde(default = "default_identifier_limit")]
    pub identifier_limit: usize,
    /// Guard against runaway `goto` recursion
    #[serde(default = "default_max_recursion_depth")]
    pub max_recursion_depth: usize,
    /// Default depth bound used by `find_path`
    #[serde(default = "default_find_path_max_depth")]
    pub find_path_max_depth: usize,
}

fn default_database() -> String {
    ":memory:".to_string()
}

fn default_identifier_limit() -> usize {
    63
}

fn default_max_recursion_depth() -> usize {
    64
}

fn default_find_path_max_depth() -> usize {
    16
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database: default_database(),
            identifier_limit: default_identifier_limit(),
            max_recursion_depth: default_max_recursion_depth(),
            find_path_max_depth: default_find_path_max_depth(),
        }
    }
}

impl EngineConfig {
    /// In-memory configuration, used by tests and the CLI default
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Parse a TOML document
    pub fn from_toml(content: &str) -> DbResult<Self> {
        toml::from_str(content).map_err(|e| DbError::ConfigError(e.to_string()))
    }

    /// Load configuration from a file and apply environment overrides.
    ///
    /// A missing file yields the defaults.
    pub fn load(path: &Path) -> DbResult<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            Self::from_toml(&content)?
        } else {
            tracing::debug!("Config file {} not found, using defaults", path.display());
            Self::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Save configuration as TOML
    pub fn save(&self, path: &Path) -> DbResult<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| DbError::ConfigError(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(database) = std::env::var(ENV_DATABASE) {
            if !database.is_empty() {
                self.database = database;
            }
        }

        if let Ok(limit) = std::env::var(ENV_IDENTIFIER_LIMIT) {
            if let Ok(limit) = limit.parse::<usize>() {
                self.identifier_limit = limit;
            }
        }
    }

    /// Reject settings the engine cannot work with
    pub fn validate(&self) -> DbResult<()> {
        // room for a hash suffix plus a readable prefix
        if self.identifier_limit < 16 {
            return Err(DbError::ConfigError(format!(
                "identifier_limit must be at least 16, got {}",
                self.identifier_limit
            )));
        }
        if self.max_recursion_depth == 0 {
            return Err(DbError::ConfigError(
                "max_recursion_depth must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_from_empty_toml() {
        let config = EngineConfig::from_toml("").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.database, ":memory:");
        assert_eq!(config.identifier_limit, 63);
    }

    #[test]
    fn test_partial_toml() {
        let config = EngineConfig::from_toml("database = \"app.db\"\nfind_path_max_depth = 4\n")
            .unwrap();
        assert_eq!(config.database, "app.db");
        assert_eq!(config.find_path_max_depth, 4);
        assert_eq!(config.max_recursion_depth, 64);
    }

    #[test]
    fn test_invalid_toml() {
        let err = EngineConfig::from_toml("identifier_limit = \"long\"").unwrap_err();
        assert!(matches!(err, DbError::ConfigError(_)));
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        let config = EngineConfig {
            identifier_limit: 30,
            ..EngineConfig::default()
        };
        config.save(&path).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("identifier_limit = 30"));
        let loaded = EngineConfig::from_toml(&content).unwrap();
        assert_eq!(loaded.identifier_limit, 30);
    }

    #[test]
    fn test_validate_rejects_tiny_limit() {
        let config = EngineConfig {
            identifier_limit: 8,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
