use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use crate::error::ChatApiError;

/// Credentials attached to one outgoing request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthHeaders {
    pub bearer_token: Option<String>,
}

impl AuthHeaders {
    pub fn bearer(token: impl Into<String>) -> Self {
        Self {
            bearer_token: Some(token.into()),
        }
    }
}

/// Source of request credentials.
///
/// `refresh = true` is passed after the service rejected a request; providers
/// should drop cached state and fetch credentials again.
pub trait AuthProvider: Send + Sync {
    fn auth_headers(&self, refresh: bool) -> Result<AuthHeaders, ChatApiError>;
}

/// Fixed API key; a refresh returns the same key.
#[derive(Debug, Clone)]
pub struct StaticBearerAuth {
    token: String,
}

impl StaticBearerAuth {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl AuthProvider for StaticBearerAuth {
    fn auth_headers(&self, _refresh: bool) -> Result<AuthHeaders, ChatApiError> {
        if self.token.trim().is_empty() {
            return Err(ChatApiError::MissingCredentials);
        }
        Ok(AuthHeaders::bearer(self.token.trim()))
    }
}

/// Bearer token read from a file, cached until the service rejects it.
#[derive(Debug)]
pub struct TokenFileAuth {
    path: PathBuf,
    cached: Mutex<Option<String>>,
}

impl TokenFileAuth {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cached: Mutex::new(None),
        }
    }

    fn read_token(&self) -> Result<String, ChatApiError> {
        let raw = std::fs::read_to_string(&self.path)
            .map_err(|error| ChatApiError::io("reading token file", &self.path, error))?;
        let token = raw.trim();
        if token.is_empty() {
            return Err(ChatApiError::MissingCredentials);
        }
        Ok(token.to_string())
    }
}

impl AuthProvider for TokenFileAuth {
    fn auth_headers(&self, refresh: bool) -> Result<AuthHeaders, ChatApiError> {
        let mut cached = lock_unpoisoned(&self.cached);
        if refresh {
            tracing::debug!(path = %self.path.display(), "re-reading token file");
            *cached = None;
        }

        let token = match cached.as_ref() {
            Some(token) => token.clone(),
            None => {
                let token = self.read_token()?;
                *cached = Some(token.clone());
                token
            }
        };

        Ok(AuthHeaders::bearer(token))
    }
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::{AuthProvider, StaticBearerAuth, TokenFileAuth};
    use crate::error::ChatApiError;

    #[test]
    fn static_bearer_rejects_blank_key() {
        let error = StaticBearerAuth::new("  ")
            .auth_headers(false)
            .expect_err("blank key should fail");
        assert!(matches!(error, ChatApiError::MissingCredentials));
    }

    #[test]
    fn token_file_is_cached_until_refresh() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("token");
        fs::write(&path, "first\n").expect("write token");

        let auth = TokenFileAuth::new(&path);
        let first = auth.auth_headers(false).expect("first read");
        assert_eq!(first.bearer_token.as_deref(), Some("first"));

        fs::write(&path, "second").expect("rewrite token");
        let cached = auth.auth_headers(false).expect("cached read");
        assert_eq!(cached.bearer_token.as_deref(), Some("first"));

        let refreshed = auth.auth_headers(true).expect("refreshed read");
        assert_eq!(refreshed.bearer_token.as_deref(), Some("second"));
    }
}
