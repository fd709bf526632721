//! HTTP utilities for model providers
//!
//! Shared request/response handling: client construction, JSON POST with
//! status mapping, and error-body cleanup.

use crate::config::get_llm_http_timeout_secs;
use crate::llm::LlmError;
use crate::utils::truncate_str;
use reqwest::header::RETRY_AFTER;
use reqwest::{Client as HttpClient, StatusCode};
use serde_json::Value;
use std::time::Duration;

/// Longest error body kept in an error message
const MAX_ERROR_BODY_CHARS: usize = 500;

/// Creates an HTTP client configured with the standard model timeout.
///
/// Uses `LLM_HTTP_TIMEOUT_SECS` or the 60s default so a stalled API call
/// cannot hang a chat forever.
#[must_use]
pub fn create_http_client() -> HttpClient {
    let timeout = Duration::from_secs(get_llm_http_timeout_secs());
    HttpClient::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_else(|_| HttpClient::new())
}

/// Sends an HTTP POST request with JSON body and returns parsed JSON response.
///
/// # Errors
///
/// Returns `LlmError::NetworkError` on connectivity issues, `LlmError::RateLimit`
/// on 429, `LlmError::ApiError` on other non-success status codes, or
/// `LlmError::JsonError` if parsing fails.
pub async fn send_json_request(
    client: &HttpClient,
    url: &str,
    body: &Value,
    headers: &[(&str, &str)],
) -> Result<Value, LlmError> {
    let mut request = client.post(url).json(body);
    for (key, value) in headers {
        request = request.header(*key, *value);
    }

    let response = request
        .send()
        .await
        .map_err(|e| LlmError::NetworkError(e.without_url().to_string()))?;

    let status = response.status();
    if status == StatusCode::TOO_MANY_REQUESTS {
        let wait_secs = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        let body = response.text().await.unwrap_or_default();
        return Err(LlmError::RateLimit {
            wait_secs,
            message: clean_error_body(&body),
        });
    }

    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(LlmError::ApiError(format!(
            "{status} - {}",
            clean_error_body(&body)
        )));
    }

    response
        .json()
        .await
        .map_err(|e| LlmError::JsonError(e.to_string()))
}

/// Shortens an error body for logs and user-facing errors.
///
/// HTML pages from proxies are summarized instead of quoted.
#[must_use]
pub fn clean_error_body(body: &str) -> String {
    let trimmed = body.trim_start();
    let is_html = ["<!DOCTYPE", "<html", "<HTML"]
        .iter()
        .any(|prefix| trimmed.starts_with(prefix));
    if is_html {
        return "(server returned an HTML error page)".to_string();
    }
    if body.chars().count() > MAX_ERROR_BODY_CHARS {
        format!("{}... (truncated)", truncate_str(body, MAX_ERROR_BODY_CHARS))
    } else {
        body.to_string()
    }
}
