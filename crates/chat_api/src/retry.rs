use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;

/// Retries allowed after an initial rejected request. The retry always
/// re-authenticates first.
pub const MAX_RETRIES: u32 = 1;
/// Delay before retrying a request that failed for a transient reason.
pub const TRANSIENT_DELAY_MS: u64 = 1000;

fn transient_error_regex() -> &'static Regex {
    static CACHED: OnceLock<Regex> = OnceLock::new();
    CACHED.get_or_init(|| {
        Regex::new(r"(?i)rate.?limit|overloaded|service.?unavailable|upstream.?connect|connection.?refused")
            .expect("retry regex must compile")
    })
}

/// Error text and status policy for failures worth a short pause before retrying.
pub fn is_transient_http_error(status: u16, error_text: &str) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504) || transient_error_regex().is_match(error_text)
}

/// Delay to wait before the re-authenticated retry of a rejected request.
pub fn retry_delay(status: u16, error_text: &str) -> Duration {
    if is_transient_http_error(status, error_text) {
        Duration::from_millis(TRANSIENT_DELAY_MS)
    } else {
        Duration::ZERO
    }
}
