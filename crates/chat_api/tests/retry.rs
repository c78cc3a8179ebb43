use std::time::Duration;

use chat_api::retry::*;

#[test]
fn retry_http_status_is_transient() {
    assert!(is_transient_http_error(429, ""));
    assert!(is_transient_http_error(500, ""));
    assert!(is_transient_http_error(502, ""));
    assert!(is_transient_http_error(503, ""));
    assert!(is_transient_http_error(504, ""));
    assert!(!is_transient_http_error(401, "invalid api key"));
}

#[test]
fn retry_http_error_pattern_is_transient() {
    assert!(is_transient_http_error(400, "rate limit exceeded"));
    assert!(is_transient_http_error(400, "Service Unavailable"));
}

#[test]
fn retry_delay_only_pauses_for_transient_failures() {
    assert_eq!(retry_delay(503, ""), Duration::from_millis(TRANSIENT_DELAY_MS));
    assert_eq!(retry_delay(401, "expired token"), Duration::ZERO);
    assert_eq!(MAX_RETRIES, 1);
}
