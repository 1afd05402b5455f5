//! HTTP retry policy for the Census API.
//!
//! Every request goes through [`send_json`]. Transient failures
//! (connection errors, timeouts, HTTP 5xx, truncated bodies) are retried
//! with exponential backoff. HTTP 429 is *not* retried: the upstream
//! cooldown is surfaced to the caller as [`CensusError::RateLimited`].
//! Other 4xx responses are permanent and mapped onto the error taxonomy.
//!
//! # Usage
//!
//! ```ignore
//! let body = retry::send_json(|| client.get(&url).query(&params), 3).await?;
//! ```

use std::time::Duration;

use reqwest::StatusCode;

use crate::CensusError;

/// Maximum length of the response body preview included in errors and logs.
const BODY_PREVIEW_LEN: usize = 300;

/// Outcome of a single attempt.
#[derive(Debug)]
enum Attempt {
    Done(serde_json::Value),
    Retry(CensusError),
    Fail(CensusError),
}

/// Sends an HTTP request and parses the response body as JSON.
///
/// The `build_request` closure is called on each attempt to construct a
/// fresh [`reqwest::RequestBuilder`], since builders are consumed by
/// `.send()`.
///
/// Retries up to `max_retries` times with exponential backoff (2s, 4s,
/// 8s, ...) on transient failures, then returns
/// [`CensusError::UpstreamUnavailable`].
///
/// # Errors
///
/// Returns [`CensusError`] if the request fails after all retries or the
/// upstream returns a non-retryable status.
#[allow(clippy::future_not_send)]
pub async fn send_json<F>(
    build_request: F,
    max_retries: u32,
) -> Result<serde_json::Value, CensusError>
where
    F: Fn() -> reqwest::RequestBuilder,
{
    let mut last_error: Option<CensusError> = None;

    for attempt in 0..=max_retries {
        if attempt > 0 {
            let delay = backoff_delay(attempt);
            log::warn!("  retry {attempt}/{max_retries} in {delay:?}...");
            tokio::time::sleep(delay).await;
        }

        let outcome = match build_request().send().await {
            Err(e) => classify_transport_error(&e),
            Ok(response) => {
                let status = response.status();
                let retry_after = response
                    .headers()
                    .get(reqwest::header::RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(parse_retry_after);

                match response.text().await {
                    Ok(body) => classify_response(status, retry_after, &body),
                    Err(e) => Attempt::Retry(CensusError::UpstreamUnavailable {
                        message: format!("Failed to read response body (HTTP {status}): {e}"),
                    }),
                }
            }
        };

        match outcome {
            Attempt::Done(value) => return Ok(value),
            Attempt::Fail(e) => return Err(e),
            Attempt::Retry(e) => {
                log::warn!("  transient error: {e}");
                last_error = Some(e);
            }
        }
    }

    let message = last_error.map_or_else(
        || "request failed after all retries".to_string(),
        |e| format!("{e} (after {max_retries} retries)"),
    );
    Err(CensusError::UpstreamUnavailable { message })
}

/// Largest exponent used by [`backoff_delay`]; later attempts wait as long
/// as this one.
pub const MAX_BACKOFF_EXP: u32 = 6;

/// Exponential backoff: `2^attempt` seconds, capped at
/// `2^MAX_BACKOFF_EXP` seconds.
#[must_use]
pub const fn backoff_delay(attempt: u32) -> Duration {
    let exp = if attempt > MAX_BACKOFF_EXP {
        MAX_BACKOFF_EXP
    } else {
        attempt
    };
    Duration::from_secs(1u64 << exp)
}

fn classify_transport_error(e: &reqwest::Error) -> Attempt {
    if e.is_builder() {
        return Attempt::Fail(CensusError::BadRequest {
            message: format!("Invalid request: {e}"),
        });
    }

    let message = if e.is_timeout() {
        format!("request timed out: {e}")
    } else {
        format!("HTTP request error: {e}")
    };

    if is_transient(e) {
        Attempt::Retry(CensusError::UpstreamUnavailable { message })
    } else {
        Attempt::Fail(CensusError::UpstreamUnavailable { message })
    }
}

/// Returns `true` if the error is likely transient and worth retrying.
fn is_transient(e: &reqwest::Error) -> bool {
    e.is_timeout() || e.is_connect() || e.is_body() || e.is_decode() || e.is_request()
}

/// Maps a completed response onto the error taxonomy.
fn classify_response(status: StatusCode, retry_after: Option<Duration>, body: &str) -> Attempt {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Attempt::Fail(CensusError::RateLimited { retry_after });
    }

    if status.is_server_error() {
        return Attempt::Retry(CensusError::UpstreamUnavailable {
            message: format!("HTTP {status}: {}", preview(body)),
        });
    }

    if status == StatusCode::NOT_FOUND {
        return Attempt::Fail(CensusError::NotFound {
            message: format!("HTTP {status}: {}", preview(body)),
        });
    }

    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Attempt::Fail(CensusError::Configuration {
            message: format!("API key rejected (HTTP {status}): {}", preview(body)),
        });
    }

    if status.is_client_error() {
        // The upstream explains rejections in plain text, e.g.
        // "error: unknown/unsupported geography heirarchy".
        return Attempt::Fail(CensusError::BadRequest {
            message: format!("HTTP {status}: {}", preview(body)),
        });
    }

    // 204: the query was valid but matched no rows.
    if status == StatusCode::NO_CONTENT || body.trim().is_empty() {
        return Attempt::Fail(CensusError::NotFound {
            message: format!("HTTP {status}: no data for this query"),
        });
    }

    if looks_like_key_rejection(body) {
        return Attempt::Fail(CensusError::Configuration {
            message: "Census API key was rejected (invalid or not activated)".to_string(),
        });
    }

    match serde_json::from_str(body) {
        Ok(value) => Attempt::Done(value),
        Err(e) => Attempt::Retry(CensusError::UpstreamUnavailable {
            message: format!(
                "JSON parse failed: {e} (status={status}, received {} bytes): {}",
                body.len(),
                preview(body)
            ),
        }),
    }
}

/// An invalid key is answered with a 200 HTML page rather than a 4xx.
fn looks_like_key_rejection(body: &str) -> bool {
    body.trim_start().starts_with('<')
        && (body.contains("Invalid Key") || body.contains("Missing Key"))
}

/// Parses `Retry-After` given as delay seconds. HTTP-date values are not
/// interpreted.
fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

fn preview(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.len() <= BODY_PREVIEW_LEN {
        return trimmed.to_string();
    }
    let mut end = BODY_PREVIEW_LEN;
    while !trimmed.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &trimmed[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_parses_tabular_json() {
        let body = r#"[["NAME","B01001_001E","state"],["Texas","29243342","48"]]"#;
        let Attempt::Done(value) = classify_response(StatusCode::OK, None, body) else {
            panic!("expected success");
        };
        assert_eq!(value[1][0], "Texas");
    }

    #[test]
    fn rate_limit_is_not_retried() {
        let outcome = classify_response(
            StatusCode::TOO_MANY_REQUESTS,
            Some(Duration::from_secs(60)),
            "",
        );
        assert!(matches!(
            outcome,
            Attempt::Fail(CensusError::RateLimited { retry_after: Some(d) }) if d == Duration::from_secs(60)
        ));
    }

    #[test]
    fn server_errors_are_retried() {
        let outcome = classify_response(StatusCode::BAD_GATEWAY, None, "upstream down");
        assert!(matches!(
            outcome,
            Attempt::Retry(CensusError::UpstreamUnavailable { .. })
        ));
    }

    #[test]
    fn unknown_variable_is_bad_request() {
        let outcome = classify_response(
            StatusCode::BAD_REQUEST,
            None,
            "error: error: unknown variable 'B99999_999E'",
        );
        let Attempt::Fail(CensusError::BadRequest { message }) = outcome else {
            panic!("expected bad request");
        };
        assert!(message.contains("B99999_999E"));
    }

    #[test]
    fn missing_dataset_is_not_found() {
        assert!(matches!(
            classify_response(StatusCode::NOT_FOUND, None, "<html>404</html>"),
            Attempt::Fail(CensusError::NotFound { .. })
        ));
        assert!(matches!(
            classify_response(StatusCode::NO_CONTENT, None, ""),
            Attempt::Fail(CensusError::NotFound { .. })
        ));
    }

    #[test]
    fn html_key_page_is_configuration_error() {
        let body = "<html><head><title>Invalid Key</title></head><body>Invalid Key</body></html>";
        assert!(matches!(
            classify_response(StatusCode::OK, None, body),
            Attempt::Fail(CensusError::Configuration { .. })
        ));
    }

    #[test]
    fn truncated_body_is_retried() {
        assert!(matches!(
            classify_response(StatusCode::OK, None, r#"[["NAME","B01001_"#),
            Attempt::Retry(_)
        ));
    }

    #[test]
    fn retry_after_seconds() {
        assert_eq!(parse_retry_after(" 120 "), Some(Duration::from_secs(120)));
        assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"), None);
    }

    #[test]
    fn backoff_doubles() {
        assert_eq!(backoff_delay(1), Duration::from_secs(2));
        assert_eq!(backoff_delay(3), Duration::from_secs(8));
    }

    #[test]
    fn backoff_is_capped_for_large_attempts() {
        let cap = Duration::from_secs(1 << MAX_BACKOFF_EXP);
        assert_eq!(backoff_delay(MAX_BACKOFF_EXP), cap);
        assert_eq!(backoff_delay(64), cap);
        assert_eq!(backoff_delay(u32::MAX), cap);
    }

    #[test]
    fn preview_truncates_long_bodies() {
        let long = "x".repeat(1000);
        let p = preview(&long);
        assert_eq!(p.len(), BODY_PREVIEW_LEN + 3);
        assert!(p.ends_with("..."));
    }
}
