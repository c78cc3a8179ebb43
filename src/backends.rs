use std::sync::Arc;
use std::time::Duration;

use chat_provider::{BackendInitError, ChatBackend};
use chat_provider_api::{ChatApiBackend, ChatApiBackendConfig, Credentials};
use chat_provider_mock::MockBackend;

use crate::config::{AgentConfig, BackendKind, ChatApiSettings};

/// Pause between mock reply parts so local runs read like a stream.
const MOCK_PART_DELAY: Duration = Duration::from_millis(30);

pub const MOCK_BACKEND_NOTICE: &str = "using the scripted demo backend; \
set SHELLMATE_BACKEND=chat-api and SHELLMATE_CONFIG_PATH to talk to a real model";

/// Line to print at startup when the selected backend is not a real model.
pub fn startup_notice(config: &AgentConfig) -> Option<&'static str> {
    match config.backend {
        BackendKind::Mock => Some(MOCK_BACKEND_NOTICE),
        BackendKind::ChatApi => None,
    }
}

pub fn backend_from_config(config: &AgentConfig) -> Result<Arc<dyn ChatBackend>, BackendInitError> {
    match config.backend {
        BackendKind::Mock => Ok(Arc::new(
            MockBackend::default().with_part_delay(MOCK_PART_DELAY),
        )),
        BackendKind::ChatApi => {
            let settings = config.chat_api.as_ref().ok_or_else(|| {
                BackendInitError::new("chat-api backend selected without a config file")
            })?;
            Ok(Arc::new(ChatApiBackend::new(chat_api_config(settings)?)?))
        }
    }
}

fn chat_api_config(settings: &ChatApiSettings) -> Result<ChatApiBackendConfig, BackendInitError> {
    let credentials = match (&settings.api_key, &settings.api_key_path) {
        (Some(key), None) => Credentials::ApiKey(key.clone()),
        (None, Some(path)) => Credentials::TokenFile(path.clone()),
        _ => {
            return Err(BackendInitError::new(
                "exactly one of api_key or api_key_path is required",
            ))
        }
    };

    let mut config =
        ChatApiBackendConfig::new(credentials, settings.model.clone().unwrap_or_default());
    if let Some(base_url) = &settings.base_url {
        config = config.with_base_url(base_url.clone());
    }
    if let Some(seconds) = settings.timeout_sec {
        config = config.with_timeout(Duration::from_secs(seconds));
    }
    Ok(config.with_turn_threading(settings.thread_turns))
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::Duration;

    use chat_provider_api::{Credentials, CHAT_API_BACKEND_ID};
    use pretty_assertions::assert_eq;

    use super::{backend_from_config, chat_api_config, startup_notice, MOCK_BACKEND_NOTICE};
    use crate::config::{AgentConfig, BackendKind, ChatApiSettings};

    fn agent_config(backend: BackendKind, chat_api: Option<ChatApiSettings>) -> AgentConfig {
        AgentConfig {
            backend,
            chat_api,
            workdir: PathBuf::from("."),
            command_timeout: None,
            result_budget: 1000,
            hints_path: None,
            command_token: None,
        }
    }

    #[test]
    fn mock_backend_is_the_default_kind() {
        let backend = backend_from_config(&agent_config(BackendKind::Mock, None))
            .expect("mock backend");
        assert_eq!(backend.profile().backend_id, "mock");
    }

    #[test]
    fn mock_backend_announces_itself_at_startup() {
        assert_eq!(
            startup_notice(&agent_config(BackendKind::Mock, None)),
            Some(MOCK_BACKEND_NOTICE)
        );
        assert!(MOCK_BACKEND_NOTICE.contains("SHELLMATE_BACKEND=chat-api"));
        assert_eq!(
            startup_notice(&agent_config(BackendKind::ChatApi, None)),
            None
        );
    }

    #[test]
    fn chat_api_backend_is_built_from_settings() {
        let settings = ChatApiSettings {
            api_key: Some("sk-test".to_owned()),
            base_url: Some("http://127.0.0.1:9/v1".to_owned()),
            timeout_sec: Some(5),
            ..ChatApiSettings::default()
        };
        let backend = backend_from_config(&agent_config(BackendKind::ChatApi, Some(settings)))
            .expect("chat-api backend");
        assert_eq!(backend.profile().backend_id, CHAT_API_BACKEND_ID);
    }

    #[test]
    fn token_file_settings_map_to_token_file_credentials() {
        let settings = ChatApiSettings {
            api_key_path: Some(PathBuf::from("/run/secrets/key")),
            model: Some("gpt-4o".to_owned()),
            timeout_sec: Some(9),
            ..ChatApiSettings::default()
        };
        let config = chat_api_config(&settings).expect("config");
        assert_eq!(
            config.credentials,
            Credentials::TokenFile(PathBuf::from("/run/secrets/key"))
        );
        assert_eq!(config.model, "gpt-4o");
        assert_eq!(config.timeout, Some(Duration::from_secs(9)));
        assert!(!config.thread_turns);
    }

    #[test]
    fn turn_threading_is_opt_in() {
        let settings = ChatApiSettings {
            api_key: Some("sk-test".to_owned()),
            thread_turns: true,
            ..ChatApiSettings::default()
        };
        assert!(chat_api_config(&settings).expect("config").thread_turns);
    }

    #[test]
    fn missing_settings_are_an_init_error() {
        let error = match backend_from_config(&agent_config(BackendKind::ChatApi, None)) {
            Ok(_) => panic!("chat-api without settings should fail"),
            Err(error) => error,
        };
        assert!(error.message().contains("config file"));
    }
}
