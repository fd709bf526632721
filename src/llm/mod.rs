//! Generative model interface and the Gemini client
//!
//! Handlers only see the [`GenerativeModel`] trait; [`GeminiClient`] is the
//! production implementation talking to the Gemini REST API.

pub mod http_utils;
/// Implementations of specific model providers
pub mod providers;

pub use providers::gemini::GeminiClient;

use crate::config::{LLM_INITIAL_BACKOFF_MS, LLM_MAX_BACKOFF_MS, LLM_MAX_RETRIES};
use crate::utils::RetryPolicy;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio_retry::RetryIf;
use tracing::warn;

/// Errors that can occur during model calls
#[derive(Debug, Error)]
pub enum LlmError {
    /// Error returned by the provider's API
    #[error("API error: {0}")]
    ApiError(String),
    /// Error during network communication
    #[error("Network error: {0}")]
    NetworkError(String),
    /// Error during JSON serialization or deserialization
    #[error("JSON error: {0}")]
    JsonError(String),
    /// Missing provider configuration or API key
    #[error("Missing client/API key: {0}")]
    MissingConfig(String),
    /// Rate limit exceeded (429), optionally with a wait time
    #[error("Rate limit exceeded: {message} (wait: {wait_secs:?}s)")]
    RateLimit {
        /// Retry-After duration in seconds, if provided by the server
        wait_secs: Option<u64>,
        /// Error message from the server
        message: String,
    },
    /// The prompt or the answer was withheld by safety filters
    #[error("Response blocked: {0}")]
    Blocked(String),
    /// Any other unexpected error
    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl LlmError {
    /// Whether another attempt may succeed
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::NetworkError(_) | Self::RateLimit { .. } => true,
            Self::ApiError(message) => message.starts_with('5'),
            _ => false,
        }
    }
}

/// Interface for generative model backends
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait GenerativeModel: Send + Sync {
    /// Generate a reply to a single text prompt
    async fn generate_text(&self, prompt: &str) -> Result<String, LlmError>;

    /// Describe an image, guided by a text prompt
    async fn analyze_image(
        &self,
        image: Vec<u8>,
        mime_type: &str,
        prompt: &str,
    ) -> Result<String, LlmError>;

    /// Check the API with a tiny request
    async fn check_connection(&self) -> Result<(), LlmError>;
}

impl RetryPolicy {
    /// Policy for model API calls
    #[must_use]
    pub const fn llm() -> Self {
        Self {
            max_retries: LLM_MAX_RETRIES,
            initial_backoff_ms: LLM_INITIAL_BACKOFF_MS,
            max_backoff_ms: LLM_MAX_BACKOFF_MS,
        }
    }
}

/// Runs a model request, retrying transient failures per `policy`.
///
/// A rate limit with a `Retry-After` is waited out before the next attempt,
/// unless the server asks for longer than `policy.max_backoff_ms`. Such a
/// rate limit is returned at once.
///
/// # Errors
///
/// Returns the first permanent error, or the last transient one once the
/// retries are spent.
pub async fn with_llm_retry<F, Fut, T>(
    policy: RetryPolicy,
    mut operation: F,
) -> Result<T, LlmError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, LlmError>>,
{
    let retry_after_ms = AtomicU64::new(0);
    let pending_wait = &retry_after_ms;

    RetryIf::spawn(
        policy.strategy(),
        || {
            let wait_ms = pending_wait.swap(0, Ordering::SeqCst);
            let attempt = operation();
            async move {
                if wait_ms > 0 {
                    tokio::time::sleep(Duration::from_millis(wait_ms)).await;
                }
                attempt.await
            }
        },
        |e: &LlmError| {
            if let LlmError::RateLimit {
                wait_secs: Some(secs),
                ..
            } = e
            {
                let wait_ms = secs.saturating_mul(1000);
                if wait_ms > policy.max_backoff_ms {
                    warn!("Rate limited for {secs}s, not retrying");
                    return false;
                }
                pending_wait.store(wait_ms, Ordering::SeqCst);
            }
            let retry = e.is_transient();
            if retry {
                warn!("Transient model error, retrying: {e}");
            }
            retry
        },
    )
    .await
}

/// Guesses an image MIME type from its magic bytes.
///
/// Telegram re-encodes photos as JPEG, so that is the fallback.
#[must_use]
pub fn detect_image_mime(bytes: &[u8]) -> &'static str {
    match bytes {
        [0x89, b'P', b'N', b'G', ..] => "image/png",
        [b'G', b'I', b'F', b'8', ..] => "image/gif",
        [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'E', b'B', b'P', ..] => "image/webp",
        _ => "image/jpeg",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    #[test]
    fn test_detect_image_mime() {
        assert_eq!(detect_image_mime(&[0xFF, 0xD8, 0xFF, 0xE0]), "image/jpeg");
        assert_eq!(
            detect_image_mime(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A]),
            "image/png"
        );
        assert_eq!(detect_image_mime(b"GIF89a...."), "image/gif");
        assert_eq!(detect_image_mime(b"RIFF\x10\x00\x00\x00WEBPVP8 "), "image/webp");
        assert_eq!(detect_image_mime(&[]), "image/jpeg");
    }

    #[test]
    fn test_transient_classification() {
        assert!(LlmError::NetworkError("reset".into()).is_transient());
        assert!(LlmError::RateLimit {
            wait_secs: Some(3),
            message: "slow down".into()
        }
        .is_transient());
        assert!(LlmError::ApiError("503 Service Unavailable - overloaded".into())
            .is_transient());
        assert!(!LlmError::ApiError("400 Bad Request - bad".into()).is_transient());
        assert!(!LlmError::Blocked("SAFETY".into()).is_transient());
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 2,
            initial_backoff_ms: 2,
            max_backoff_ms: 4,
        }
    }

    #[tokio::test]
    async fn test_retry_recovers_from_transient_error() {
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let result = with_llm_retry(fast_policy(), || async move {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(LlmError::NetworkError("connection reset".into()))
            } else {
                Ok("hello".to_string())
            }
        })
        .await;

        assert!(matches!(result.as_deref(), Ok("hello")));
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_retry_gives_up_on_permanent_error() {
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let result: Result<String, LlmError> = with_llm_retry(fast_policy(), || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(LlmError::MissingConfig("GEMINI_API_KEY".into()))
        })
        .await;

        assert!(matches!(result, Err(LlmError::MissingConfig(_))));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_long_retry_after_is_not_retried() {
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let result: Result<String, LlmError> = with_llm_retry(fast_policy(), || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(LlmError::RateLimit {
                wait_secs: Some(30),
                message: "quota exhausted".into(),
            })
        })
        .await;

        assert!(matches!(
            result,
            Err(LlmError::RateLimit {
                wait_secs: Some(30),
                ..
            })
        ));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_short_retry_after_is_waited_out() {
        let policy = RetryPolicy {
            max_retries: 2,
            initial_backoff_ms: 2,
            max_backoff_ms: 2000,
        };
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let started = Instant::now();
        let result = with_llm_retry(policy, || async move {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(LlmError::RateLimit {
                    wait_secs: Some(1),
                    message: "slow down".into(),
                })
            } else {
                Ok("hello".to_string())
            }
        })
        .await;

        assert!(matches!(result.as_deref(), Ok("hello")));
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert!(started.elapsed() >= Duration::from_secs(1));
    }
}
