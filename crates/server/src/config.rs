//! Startup configuration
//!
//! tabcal reads a small JSON file naming the target calendar. A missing or
//! malformed file is fatal at startup and reported to the operator, never a
//! runtime error.

use std::path::{Path, PathBuf};

use serde_json::Value;
use thiserror::Error;

const CONFIG_PATH_ENV: &str = "TABCAL_CONFIG";
const TOKEN_PATH_ENV: &str = "TABCAL_TOKEN_FILE";
const DEFAULT_CONFIG_PATH: &str = "calendar.json";
const DEFAULT_TOKEN_PATH: &str = "token.json";
const CALENDAR_ID_KEY: &str = "CALENDAR_ID";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file {0:?} is not a .json file")]
    WrongFileType(PathBuf),
    #[error("failed to read config file {path:?}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("config file {path:?} is not valid JSON")]
    InvalidJson {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("config file {0:?} does not contain the required key \"CALENDAR_ID\"")]
    MissingCalendarId(PathBuf),
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Target calendar, as the calendar API identifies it.
    pub calendar_id: String,
    /// Stored OAuth token file consumed by the calendar sink.
    pub token_path: PathBuf,
}

impl Config {
    /// Load from `TABCAL_CONFIG`, defaulting to `calendar.json` in the
    /// working directory. The token path comes from `TABCAL_TOKEN_FILE`.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path =
            std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into());
        let token_path =
            std::env::var(TOKEN_PATH_ENV).unwrap_or_else(|_| DEFAULT_TOKEN_PATH.into());
        Self::from_file(Path::new(&config_path), PathBuf::from(token_path))
    }

    pub fn from_file(path: &Path, token_path: PathBuf) -> Result<Self, ConfigError> {
        if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
            return Err(ConfigError::WrongFileType(path.to_path_buf()));
        }

        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Unreadable {
            path: path.to_path_buf(),
            source,
        })?;
        let value: Value =
            serde_json::from_str(&raw).map_err(|source| ConfigError::InvalidJson {
                path: path.to_path_buf(),
                source,
            })?;

        let calendar_id = value
            .get(CALENDAR_ID_KEY)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ConfigError::MissingCalendarId(path.to_path_buf()))?;

        Ok(Self {
            calendar_id,
            token_path,
        })
    }
}
