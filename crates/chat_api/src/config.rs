use std::time::Duration;

use crate::url::DEFAULT_CHAT_BASE_URL;

/// Default model used when the caller does not pick one.
pub const DEFAULT_CHAT_MODEL: &str = "gpt-3.5-turbo";

/// Transport configuration for chat completion requests.
#[derive(Debug, Clone)]
pub struct ChatApiConfig {
    /// Base URL for the completions endpoint.
    pub base_url: String,
    /// Model identifier sent with every request.
    pub model: String,
    /// Optional request timeout.
    pub timeout: Option<Duration>,
}

impl Default for ChatApiConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_CHAT_BASE_URL.to_string(),
            model: DEFAULT_CHAT_MODEL.to_string(),
            timeout: None,
        }
    }
}

impl ChatApiConfig {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Self::default()
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}
