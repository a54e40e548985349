use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use persona_core::{PersonaError, PersonaResult};

const DEFAULT_CONFIG_NAME: &str = "persona.json";
const DEFAULT_DB_NAME: &str = "persona.sqlite";

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum DatabaseConfig {
    Sqlite { path: Option<String> },
    Postgres { url: String },
    Mysql { url: String },
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PoolConfig {
    pub max_connections: Option<u32>,
    pub min_connections: Option<u32>,
    pub connect_timeout_ms: Option<u64>,
    pub acquire_timeout_ms: Option<u64>,
    pub idle_timeout_ms: Option<u64>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LimitsConfig {
    /// Records accepted by a single timeline migration.
    pub max_migration_records: Option<usize>,
    /// Codes accepted in one coded-reference list value.
    pub max_list_values: Option<usize>,
}

impl LimitsConfig {
    pub fn with_defaults() -> Self {
        Self {
            max_migration_records: Some(5_000),
            max_list_values: Some(32),
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ValidationMode {
    Off,
    Warn,
    Error,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PersonaConfig {
    pub database: DatabaseConfig,
    pub pool: Option<PoolConfig>,
    pub limits: Option<LimitsConfig>,
    pub validation_mode: Option<ValidationMode>,
    pub failpoints: Option<Vec<String>>,
}

impl PersonaConfig {
    pub fn default_sqlite(path: impl Into<String>) -> Self {
        Self {
            database: DatabaseConfig::Sqlite {
                path: Some(path.into()),
            },
            pool: None,
            limits: Some(LimitsConfig::with_defaults()),
            validation_mode: Some(ValidationMode::Error),
            failpoints: None,
        }
    }

    /// Reads `persona.json` from `base_dir`, writing a SQLite default there
    /// on first use. The default database path is stored relative to the
    /// directory so a datastore can be moved as a whole.
    pub fn load_or_init(base_dir: &Path) -> PersonaResult<Self> {
        fs::create_dir_all(base_dir)
            .map_err(|err| PersonaError::storage(format!("create config dir: {err}")))?;
        let config_path = base_dir.join(DEFAULT_CONFIG_NAME);
        if config_path.exists() {
            let raw = fs::read_to_string(&config_path)
                .map_err(|err| PersonaError::storage(format!("read config: {err}")))?;
            let config: PersonaConfig = serde_json::from_str(&raw)
                .map_err(|err| PersonaError::validation(format!("parse config: {err}")))?;
            return Ok(config);
        }
        let default = PersonaConfig::default_sqlite(DEFAULT_DB_NAME);
        let payload = serde_json::to_string_pretty(&default)
            .map_err(|err| PersonaError::storage(format!("serialize config: {err}")))?;
        fs::write(&config_path, payload)
            .map_err(|err| PersonaError::storage(format!("write config: {err}")))?;
        Ok(default)
    }

    pub fn sqlite_path(&self, base_dir: &Path) -> PersonaResult<PathBuf> {
        match &self.database {
            DatabaseConfig::Sqlite { path } => {
                let candidate =
                    PathBuf::from(path.clone().unwrap_or_else(|| DEFAULT_DB_NAME.to_string()));
                if candidate.is_absolute() {
                    Ok(candidate)
                } else {
                    Ok(base_dir.join(candidate))
                }
            }
            _ => Err(PersonaError::validation("config is not sqlite backend")),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        match self.database {
            DatabaseConfig::Sqlite { .. } => "sqlite",
            DatabaseConfig::Postgres { .. } => "postgres",
            DatabaseConfig::Mysql { .. } => "mysql",
        }
    }

    pub fn connection_url(&self, base_dir: &Path) -> PersonaResult<String> {
        match &self.database {
            DatabaseConfig::Sqlite { .. } => {
                let path = self.sqlite_path(base_dir)?;
                Ok(format!("sqlite://{}?mode=rwc", path.display()))
            }
            DatabaseConfig::Postgres { url } | DatabaseConfig::Mysql { url } => Ok(url.clone()),
        }
    }
}
