use std::collections::BTreeMap;

use crate::auth::AuthHeaders;
use crate::error::ChatApiError;

pub const HEADER_ACCEPT: &str = "accept";
pub const HEADER_CONTENT_TYPE: &str = "content-type";
pub const HEADER_AUTHORIZATION: &str = "authorization";
pub const HEADER_USER_AGENT: &str = "user-agent";

/// Build a deterministic header map for completion requests.
pub fn build_headers(auth: &AuthHeaders) -> Result<BTreeMap<String, String>, ChatApiError> {
    let token = auth
        .bearer_token
        .as_deref()
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .ok_or(ChatApiError::MissingCredentials)?;

    let mut headers = BTreeMap::new();
    headers.insert(HEADER_AUTHORIZATION.to_owned(), format!("Bearer {token}"));
    headers.insert(HEADER_ACCEPT.to_owned(), "text/event-stream".to_owned());
    headers.insert(
        HEADER_CONTENT_TYPE.to_owned(),
        "application/json".to_owned(),
    );
    headers.insert(HEADER_USER_AGENT.to_owned(), default_user_agent());
    Ok(headers)
}

fn default_user_agent() -> String {
    format!(
        "shellmate/{} ({}; {})",
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS,
        std::env::consts::ARCH
    )
}
