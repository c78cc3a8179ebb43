//! Environment configuration.

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chat_provider_api::CHAT_API_BACKEND_ID;
use chat_provider_mock::MOCK_BACKEND_ID;
use serde::Deserialize;
use thiserror::Error;

use crate::budget::DEFAULT_RESULT_BUDGET;
use crate::exec::DEFAULT_COMMAND_TIMEOUT;

pub const ENV_BACKEND: &str = "SHELLMATE_BACKEND";
pub const ENV_CONFIG_PATH: &str = "SHELLMATE_CONFIG_PATH";
pub const ENV_WORKDIR: &str = "SHELLMATE_WORKDIR";
pub const ENV_COMMAND_TIMEOUT_SEC: &str = "SHELLMATE_COMMAND_TIMEOUT_SEC";
pub const ENV_RESULT_BUDGET: &str = "SHELLMATE_RESULT_BUDGET";
pub const ENV_HINTS_PATH: &str = "SHELLMATE_HINTS_PATH";
pub const ENV_COMMAND_TOKEN: &str = "SHELLMATE_COMMAND_TOKEN";

/// Hints file looked up in the working directory when none is configured.
pub const DEFAULT_HINTS_FILE: &str = ".hints.txt";

const RANDOM_TOKEN: &str = "random";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var}: invalid value '{value}': {reason}")]
    InvalidValue {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error("{var} must be set when {requirement}")]
    Missing {
        var: &'static str,
        requirement: &'static str,
    },

    #[error("failed to read {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config file {path}: {source}")]
    ParseFile {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid config file {path}: {reason}")]
    InvalidFile { path: PathBuf, reason: &'static str },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Mock,
    ChatApi,
}

impl BackendKind {
    fn parse(value: &str) -> Result<Self, ConfigError> {
        match value.trim() {
            MOCK_BACKEND_ID => Ok(Self::Mock),
            CHAT_API_BACKEND_ID => Ok(Self::ChatApi),
            other => Err(ConfigError::InvalidValue {
                var: ENV_BACKEND,
                value: other.to_string(),
                reason: format!("expected '{MOCK_BACKEND_ID}' or '{CHAT_API_BACKEND_ID}'"),
            }),
        }
    }
}

/// Contents of the chat-api config file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChatApiSettings {
    pub api_key: Option<String>,
    pub api_key_path: Option<PathBuf>,
    pub model: Option<String>,
    pub base_url: Option<String>,
    pub timeout_sec: Option<u64>,
    /// Thread turns with server-side conversation ids. Leave off for
    /// standard completions endpoints.
    #[serde(default)]
    pub thread_turns: bool,
}

impl ChatApiSettings {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;
        let settings: Self =
            serde_json::from_str(&raw).map_err(|source| ConfigError::ParseFile {
                path: path.to_path_buf(),
                source,
            })?;

        let has_key = settings
            .api_key
            .as_deref()
            .is_some_and(|key| !key.trim().is_empty());
        if has_key == settings.api_key_path.is_some() {
            return Err(ConfigError::InvalidFile {
                path: path.to_path_buf(),
                reason: "exactly one of api_key or api_key_path is required",
            });
        }
        Ok(settings)
    }
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub backend: BackendKind,
    pub chat_api: Option<ChatApiSettings>,
    pub workdir: PathBuf,
    /// `None` lets commands run without a deadline.
    pub command_timeout: Option<Duration>,
    pub result_budget: usize,
    pub hints_path: Option<PathBuf>,
    pub command_token: Option<String>,
}

impl AgentConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let backend = match env_string_opt(ENV_BACKEND) {
            Some(value) => BackendKind::parse(&value)?,
            None => BackendKind::Mock,
        };

        let chat_api = match (backend, env_string_opt(ENV_CONFIG_PATH)) {
            (BackendKind::ChatApi, Some(path)) => Some(ChatApiSettings::load(Path::new(&path))?),
            (BackendKind::ChatApi, None) => {
                return Err(ConfigError::Missing {
                    var: ENV_CONFIG_PATH,
                    requirement: "the chat-api backend is selected",
                })
            }
            (BackendKind::Mock, _) => None,
        };

        let workdir = match env_string_opt(ENV_WORKDIR) {
            Some(value) => PathBuf::from(value),
            None => env::current_dir().map_err(|source| ConfigError::ReadFile {
                path: PathBuf::from("."),
                source,
            })?,
        };
        if !workdir.is_dir() {
            return Err(ConfigError::InvalidValue {
                var: ENV_WORKDIR,
                value: workdir.display().to_string(),
                reason: "not a directory".to_string(),
            });
        }

        let command_timeout = match env_parse::<u64>(ENV_COMMAND_TIMEOUT_SEC)? {
            Some(0) => None,
            Some(seconds) => Some(Duration::from_secs(seconds)),
            None => Some(DEFAULT_COMMAND_TIMEOUT),
        };
        let result_budget = env_parse::<usize>(ENV_RESULT_BUDGET)?.unwrap_or(DEFAULT_RESULT_BUDGET);

        let hints_path = env_string_opt(ENV_HINTS_PATH)
            .map(PathBuf::from)
            .or_else(|| {
                let default = workdir.join(DEFAULT_HINTS_FILE);
                default.is_file().then_some(default)
            });

        let command_token = env_string_opt(ENV_COMMAND_TOKEN).map(|value| {
            if value.trim() == RANDOM_TOKEN {
                uuid::Uuid::new_v4().simple().to_string()
            } else {
                value.trim().to_string()
            }
        });

        Ok(Self {
            backend,
            chat_api,
            workdir,
            command_timeout,
            result_budget,
            hints_path,
            command_token,
        })
    }
}

fn env_string_opt(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        if value.trim().is_empty() {
            None
        } else {
            Some(value)
        }
    })
}

fn env_parse<T>(key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let Some(value) = env_string_opt(key) else {
        return Ok(None);
    };
    value
        .trim()
        .parse()
        .map(Some)
        .map_err(|error: T::Err| ConfigError::InvalidValue {
            var: key,
            value,
            reason: error.to_string(),
        })
}
