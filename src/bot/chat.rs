//! Text and photo relay to the generative model.

use crate::config::DEFAULT_IMAGE_PROMPT;
use crate::llm::{detect_image_mime, GenerativeModel, LlmError};
use crate::storage::{ChatExchangeRecord, ImageAnalysisRecord, StorageError, UserStore};
use mongodb::bson::DateTime;
use thiserror::Error;
use tracing::{debug, warn};

/// Sent when the model returns only whitespace
pub const EMPTY_REPLY_FALLBACK: &str = "(empty response)";

/// Errors from the relay flows
#[derive(Debug, Error)]
pub enum ChatError {
    /// The sender has not completed registration
    #[error("user is not registered")]
    NotRegistered,
    /// The model call failed
    #[error(transparent)]
    Model(#[from] LlmError),
    /// The registration check failed
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// A downloaded photo waiting for analysis
#[derive(Debug, Clone)]
pub struct PhotoRequest {
    /// Chat the photo came from
    pub chat_id: i64,
    /// Telegram file id of the downloaded size
    pub file_id: String,
    /// Raw image bytes
    pub image: Vec<u8>,
    /// Photo caption, used as the prompt when present
    pub caption: Option<String>,
}

async fn gate(store: &dyn UserStore, chat_id: i64) -> Result<(), ChatError> {
    if store.is_registered(chat_id).await? {
        Ok(())
    } else {
        Err(ChatError::NotRegistered)
    }
}

fn non_empty(reply: String) -> String {
    if reply.trim().is_empty() {
        EMPTY_REPLY_FALLBACK.to_string()
    } else {
        reply
    }
}

async fn touch(store: &dyn UserStore, chat_id: i64) {
    if let Err(e) = store.touch_interaction(chat_id).await {
        warn!(chat_id, "Failed to update last interaction: {e}");
    }
}

/// Answers a text message from a registered user.
///
/// # Errors
///
/// Returns `ChatError::NotRegistered` for unregistered senders, or the model
/// or store error that prevented an answer.
pub async fn answer_text(
    model: &dyn GenerativeModel,
    store: &dyn UserStore,
    chat_id: i64,
    text: &str,
) -> Result<String, ChatError> {
    gate(store, chat_id).await?;

    let reply = non_empty(model.generate_text(text).await?);

    let record = ChatExchangeRecord {
        chat_id,
        prompt: text.to_string(),
        response: reply.clone(),
        timestamp: DateTime::now(),
    };
    if let Err(e) = store.save_chat_exchange(&record).await {
        warn!(chat_id, "Failed to log chat exchange: {e}");
    }
    touch(store, chat_id).await;

    Ok(reply)
}

/// Describes a photo from a registered user and records the analysis.
///
/// # Errors
///
/// Returns `ChatError::NotRegistered` for unregistered senders, or the model
/// or store error that prevented an answer.
pub async fn analyze_photo(
    model: &dyn GenerativeModel,
    store: &dyn UserStore,
    request: PhotoRequest,
) -> Result<String, ChatError> {
    let PhotoRequest {
        chat_id,
        file_id,
        image,
        caption,
    } = request;
    gate(store, chat_id).await?;

    let mime_type = detect_image_mime(&image);
    let prompt = caption
        .as_deref()
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .unwrap_or(DEFAULT_IMAGE_PROMPT);
    debug!(chat_id, mime_type, bytes = image.len(), "Analyzing photo");

    let analysis = non_empty(model.analyze_image(image, mime_type, prompt).await?);

    let record = ImageAnalysisRecord {
        user_id: chat_id,
        file_id,
        analysis: analysis.clone(),
        timestamp: DateTime::now(),
    };
    if let Err(e) = store.save_image_analysis(&record).await {
        warn!(chat_id, "Failed to store image analysis: {e}");
    }
    touch(store, chat_id).await;

    Ok(analysis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MockUserStore;
    use crate::testing::{mock_model_replying, mock_model_untouched, mock_store_gate};

    const JPEG_HEADER: [u8; 4] = [0xFF, 0xD8, 0xFF, 0xE0];

    fn photo(caption: Option<&str>) -> PhotoRequest {
        PhotoRequest {
            chat_id: 42,
            file_id: "AgACAgIAAxkBAAIB".to_string(),
            image: JPEG_HEADER.to_vec(),
            caption: caption.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn test_unregistered_user_never_reaches_model() {
        let model = mock_model_untouched();
        let store = mock_store_gate(false);

        assert!(matches!(
            answer_text(&model, &store, 42, "hello").await,
            Err(ChatError::NotRegistered)
        ));
        assert!(matches!(
            analyze_photo(&model, &store, photo(None)).await,
            Err(ChatError::NotRegistered)
        ));
    }

    #[tokio::test]
    async fn test_answer_text_logs_exchange() -> Result<(), Box<dyn std::error::Error>> {
        let model = mock_model_replying("Hi there");
        let mut store = MockUserStore::new();
        store.expect_is_registered().returning(|_| Ok(true));
        store
            .expect_save_chat_exchange()
            .withf(|r| r.chat_id == 42 && r.prompt == "hello" && r.response == "Hi there")
            .times(1)
            .returning(|_| Ok(()));
        store.expect_touch_interaction().times(1).returning(|_| Ok(()));

        assert_eq!(answer_text(&model, &store, 42, "hello").await?, "Hi there");
        Ok(())
    }

    #[tokio::test]
    async fn test_logging_failures_do_not_fail_reply() -> Result<(), Box<dyn std::error::Error>> {
        let model = mock_model_replying("Hi there");
        let mut store = MockUserStore::new();
        store.expect_is_registered().returning(|_| Ok(true));
        store
            .expect_save_chat_exchange()
            .returning(|_| Err(StorageError::Config("down".into())));
        store
            .expect_touch_interaction()
            .returning(|_| Err(StorageError::Config("down".into())));

        assert_eq!(answer_text(&model, &store, 42, "hello").await?, "Hi there");
        Ok(())
    }

    #[tokio::test]
    async fn test_blank_reply_gets_fallback() -> Result<(), Box<dyn std::error::Error>> {
        let model = mock_model_replying("  \n");
        let store = mock_store_gate(true);

        assert_eq!(
            answer_text(&model, &store, 42, "hello").await?,
            EMPTY_REPLY_FALLBACK
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_model_error_is_reported() {
        let mut model = crate::llm::MockGenerativeModel::new();
        model
            .expect_generate_text()
            .returning(|_| Err(LlmError::Blocked("SAFETY".into())));
        let store = mock_store_gate(true);

        assert!(matches!(
            answer_text(&model, &store, 42, "hello").await,
            Err(ChatError::Model(LlmError::Blocked(_)))
        ));
    }

    #[tokio::test]
    async fn test_photo_analysis_is_stored_once() -> Result<(), Box<dyn std::error::Error>> {
        let mut model = crate::llm::MockGenerativeModel::new();
        model
            .expect_analyze_image()
            .withf(|image, mime, prompt| {
                image.as_slice() == JPEG_HEADER && mime == "image/jpeg" && prompt == "What breed?"
            })
            .times(1)
            .returning(|_, _, _| Ok("A corgi.".to_string()));

        let mut store = MockUserStore::new();
        store.expect_is_registered().returning(|_| Ok(true));
        store
            .expect_save_image_analysis()
            .withf(|r| r.user_id == 42 && r.file_id == "AgACAgIAAxkBAAIB" && r.analysis == "A corgi.")
            .times(1)
            .returning(|_| Ok(()));
        store.expect_touch_interaction().returning(|_| Ok(()));

        let analysis = analyze_photo(&model, &store, photo(Some(" What breed? "))).await?;
        assert_eq!(analysis, "A corgi.");
        Ok(())
    }

    #[tokio::test]
    async fn test_photo_without_caption_uses_default_prompt(
    ) -> Result<(), Box<dyn std::error::Error>> {
        let mut model = crate::llm::MockGenerativeModel::new();
        model
            .expect_analyze_image()
            .withf(|_, _, prompt| prompt == DEFAULT_IMAGE_PROMPT)
            .times(1)
            .returning(|_, _, _| Ok("A cat.".to_string()));
        let store = mock_store_gate(true);

        assert_eq!(analyze_photo(&model, &store, photo(Some("  "))).await?, "A cat.");
        Ok(())
    }

    #[tokio::test]
    async fn test_empty_gemini_answer_reaches_user_as_fallback(
    ) -> Result<(), Box<dyn std::error::Error>> {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1beta/models/gemini-test:generateContent")
            .with_status(200)
            .with_body(
                serde_json::json!({
                    "candidates": [{
                        "content": { "role": "model", "parts": [{ "text": "  " }] },
                        "finishReason": "STOP"
                    }]
                })
                .to_string(),
            )
            .create_async()
            .await;
        let model = crate::llm::GeminiClient::new("test-key", "gemini-test")
            .with_base_url(server.url())
            .with_retry_policy(crate::utils::RetryPolicy {
                max_retries: 0,
                initial_backoff_ms: 2,
                max_backoff_ms: 4,
            });
        let store = mock_store_gate(true);

        assert_eq!(
            answer_text(&model, &store, 42, "hello").await?,
            EMPTY_REPLY_FALLBACK
        );
        mock.assert_async().await;
        Ok(())
    }
}
