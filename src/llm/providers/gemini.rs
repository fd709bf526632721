use crate::config::{
    Settings, GEMINI_CHAT_TEMPERATURE, GEMINI_CONNECTION_CHECK_PROMPT, GEMINI_IMAGE_TEMPERATURE,
    GEMINI_MAX_OUTPUT_TOKENS,
};
use crate::llm::http_utils::{create_http_client, send_json_request};
use crate::llm::{with_llm_retry, GenerativeModel, LlmError};
use crate::utils::RetryPolicy;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use reqwest::Client as HttpClient;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, instrument};

/// Public Gemini API endpoint
pub const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com";

/// `finishReason` of a candidate that completed normally
const FINISH_REASON_STOP: &str = "STOP";

/// Output cap for the startup connection check
const CONNECTION_CHECK_MAX_TOKENS: u32 = 64;

/// Client for the Gemini `generateContent` REST method
pub struct GeminiClient {
    http_client: HttpClient,
    api_key: String,
    model_id: String,
    base_url: String,
    system_instruction: Option<String>,
    retry: RetryPolicy,
}

impl GeminiClient {
    /// Create a new Gemini client for `model_id`
    #[must_use]
    pub fn new(api_key: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            http_client: create_http_client(),
            api_key: api_key.into(),
            model_id: model_id.into(),
            base_url: GEMINI_API_BASE.to_string(),
            system_instruction: None,
            retry: RetryPolicy::llm(),
        }
    }

    /// Build the client from loaded settings
    ///
    /// # Errors
    ///
    /// Returns `LlmError::MissingConfig` if no API key is configured.
    pub fn from_settings(settings: &Settings) -> Result<Self, LlmError> {
        let api_key = settings
            .gemini_api_key
            .clone()
            .ok_or_else(|| LlmError::MissingConfig("GEMINI_API_KEY".to_string()))?;

        let mut client = Self::new(api_key, settings.gemini_model.clone())
            .with_system_instruction(settings.system_message.clone());
        if let Some(base_url) = &settings.gemini_base_url {
            client = client.with_base_url(base_url.clone());
        }
        Ok(client)
    }

    /// Point the client at a different API host
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Set the system instruction sent with every request
    #[must_use]
    pub fn with_system_instruction(mut self, instruction: Option<String>) -> Self {
        self.system_instruction = instruction.filter(|s| !s.trim().is_empty());
        self
    }

    /// Override the retry policy for transient failures
    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Model this client talks to
    #[must_use]
    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/v1beta/models/{}:generateContent",
            self.base_url, self.model_id
        )
    }

    fn request_body(&self, parts: Vec<Value>, temperature: f32, max_tokens: u32) -> Value {
        let mut body = json!({
            "contents": [{
                "role": "user",
                "parts": parts
            }],
            "generationConfig": {
                "temperature": temperature,
                "maxOutputTokens": max_tokens
            }
        });
        if let Some(instruction) = &self.system_instruction {
            body["system_instruction"] = json!({ "parts": [{ "text": instruction }] });
        }
        body
    }

    async fn generate(
        &self,
        parts: Vec<Value>,
        temperature: f32,
        max_tokens: u32,
    ) -> Result<String, LlmError> {
        let url = self.endpoint();
        let body = self.request_body(parts, temperature, max_tokens);
        let headers = [("x-goog-api-key", self.api_key.as_str())];

        let response = with_llm_retry(self.retry, || {
            send_json_request(&self.http_client, &url, &body, &headers)
        })
        .await?;
        extract_response_text(response)
    }
}

#[async_trait]
impl GenerativeModel for GeminiClient {
    #[instrument(skip_all, fields(model = %self.model_id, prompt_len = prompt.len()))]
    async fn generate_text(&self, prompt: &str) -> Result<String, LlmError> {
        let parts = vec![json!({ "text": prompt })];
        let text = self
            .generate(parts, GEMINI_CHAT_TEMPERATURE, GEMINI_MAX_OUTPUT_TOKENS)
            .await?;
        debug!(reply_len = text.len(), "Gemini text reply received");
        Ok(text)
    }

    #[instrument(skip_all, fields(model = %self.model_id, mime_type = %mime_type, image_len = image.len()))]
    async fn analyze_image(
        &self,
        image: Vec<u8>,
        mime_type: &str,
        prompt: &str,
    ) -> Result<String, LlmError> {
        let parts = vec![
            json!({ "text": prompt }),
            json!({
                "inline_data": {
                    "mime_type": mime_type,
                    "data": BASE64.encode(&image)
                }
            }),
        ];
        self.generate(parts, GEMINI_IMAGE_TEMPERATURE, GEMINI_MAX_OUTPUT_TOKENS)
            .await
    }

    async fn check_connection(&self) -> Result<(), LlmError> {
        let parts = vec![json!({ "text": GEMINI_CONNECTION_CHECK_PROMPT })];
        match self
            .generate(parts, GEMINI_CHAT_TEMPERATURE, CONNECTION_CHECK_MAX_TOKENS)
            .await
        {
            // A withheld answer still proves the key and model are accepted.
            Ok(_) | Err(LlmError::Blocked(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<Content>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    text: Option<String>,
    #[serde(default)]
    thought: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    block_reason: Option<String>,
}

/// Joins the text parts of the first candidate.
///
/// # Errors
///
/// Returns `LlmError::Blocked` when the prompt was blocked, no candidate came
/// back, or the candidate stopped for any reason other than `STOP` without
/// text; `LlmError::JsonError` when the body is not a `generateContent`
/// response.
pub fn extract_response_text(response: Value) -> Result<String, LlmError> {
    let parsed: GenerateContentResponse =
        serde_json::from_value(response).map_err(|e| LlmError::JsonError(e.to_string()))?;

    if let Some(reason) = parsed.prompt_feedback.and_then(|f| f.block_reason) {
        return Err(LlmError::Blocked(format!("prompt blocked ({reason})")));
    }

    let candidate = parsed
        .candidates
        .into_iter()
        .next()
        .ok_or_else(|| LlmError::Blocked("no candidates returned".to_string()))?;

    let text: String = candidate
        .content
        .map(|c| c.parts)
        .unwrap_or_default()
        .into_iter()
        .filter(|p| !p.thought)
        .filter_map(|p| p.text)
        .collect();

    // A normal stop with no text is an empty answer, not a refusal.
    let reason = candidate.finish_reason.as_deref().unwrap_or("UNKNOWN");
    if text.trim().is_empty() && reason != FINISH_REASON_STOP {
        return Err(LlmError::Blocked(format!(
            "no text in response (finish reason: {reason})"
        )));
    }
    Ok(text)
}
