//! Application settings, read from the environment (and `.env`).

use di::{inject, injectable};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Mutex;
use thiserror::Error;

const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_CHAT_MODEL: &str = "gpt-3.5-turbo-0613";
const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-ada-002";
const DEFAULT_CORS_ORIGINS: &str = "http://localhost:3000,http://localhost:5173";

/// Settings installed by tests instead of reading the environment.
static TEST_SETTINGS: Mutex<Option<Settings>> = Mutex::new(None);

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{key} has an invalid value: {value}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub database_url: String,
    pub openai_api_key: String,
    pub openai_base_url: String,
    /// Model used for tool selection, sub-question generation and the chat itself.
    pub chat_model: String,
    pub embedding_model: String,
    /// Directory uploaded documents are stored in, keyed by file name.
    pub upload_dir: PathBuf,
    /// Directory the vector index storage is persisted to.
    pub persist_dir: PathBuf,
    /// Chunk size for the node parser, in words.
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub bind_address: String,
    pub cors_origins: Vec<String>,
    pub run_migrations: bool,
}

#[injectable]
impl Settings {
    #[inject]
    pub fn create() -> Settings {
        if let Some(settings) = Self::test_settings() {
            return settings;
        }

        Settings::from_env().expect("invalid configuration")
    }
}

impl Settings {
    pub fn from_env() -> Result<Settings, SettingsError> {
        dotenvy::dotenv().ok();

        let database_url =
            env::var("DATABASE_URL").map_err(|_| SettingsError::Missing("DATABASE_URL"))?;

        Ok(Settings {
            database_url,
            openai_api_key: env::var("OPENAI_API_KEY").unwrap_or_default(),
            openai_base_url: var_or("OPENAI_BASE_URL", DEFAULT_OPENAI_BASE_URL),
            chat_model: var_or("CHAT_MODEL", DEFAULT_CHAT_MODEL),
            embedding_model: var_or("EMBEDDING_MODEL", DEFAULT_EMBEDDING_MODEL),
            upload_dir: PathBuf::from(var_or("UPLOAD_DIR", "uploads")),
            persist_dir: PathBuf::from(var_or("PERSIST_DIR", "persist")),
            chunk_size: parse_var("CHUNK_SIZE", 512)?,
            chunk_overlap: parse_var("CHUNK_OVERLAP", 10)?,
            bind_address: var_or("BIND_ADDRESS", "0.0.0.0:3000"),
            cors_origins: var_or("CORS_ORIGINS", DEFAULT_CORS_ORIGINS)
                .split(',')
                .map(str::trim)
                .filter(|origin| !origin.is_empty())
                .map(str::to_owned)
                .collect(),
            run_migrations: parse_var("RUN_MIGRATIONS", true)?,
        })
    }

    /// Settings rooted at the given directories, with defaults for everything else.
    pub fn for_directories(upload_dir: impl Into<PathBuf>, persist_dir: impl Into<PathBuf>) -> Self {
        Settings {
            database_url: "sqlite::memory:".to_owned(),
            openai_api_key: String::new(),
            openai_base_url: DEFAULT_OPENAI_BASE_URL.to_owned(),
            chat_model: DEFAULT_CHAT_MODEL.to_owned(),
            embedding_model: DEFAULT_EMBEDDING_MODEL.to_owned(),
            upload_dir: upload_dir.into(),
            persist_dir: persist_dir.into(),
            chunk_size: 512,
            chunk_overlap: 10,
            bind_address: "127.0.0.1:0".to_owned(),
            cors_origins: Vec::new(),
            run_migrations: false,
        }
    }

    pub fn set_test_settings(settings: Settings) {
        if let Ok(mut slot) = TEST_SETTINGS.lock() {
            *slot = Some(settings);
        }
    }

    pub fn clear_test_settings() {
        if let Ok(mut slot) = TEST_SETTINGS.lock() {
            *slot = None;
        }
    }

    fn test_settings() -> Option<Settings> {
        TEST_SETTINGS.lock().ok().and_then(|slot| slot.clone())
    }
}

fn var_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_owned())
}

fn parse_var<T: FromStr>(key: &'static str, default: T) -> Result<T, SettingsError> {
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| SettingsError::Invalid { key, value }),
        Err(_) => Ok(default),
    }
}
