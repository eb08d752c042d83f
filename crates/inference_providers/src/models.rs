use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// Chat completion wire types (OpenAI-compatible), used by the LLM client
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatDelta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<MessageRole>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

/// Streaming options (matches OpenAI's `stream_options`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub include_usage: Option<bool>,
}

/// Parameters for a chat completion request against the LLM provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionParams {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_options: Option<StreamOptions>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ContentFilter,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: i32,
    pub completion_tokens: i32,
    pub total_tokens: i32,
}

impl TokenUsage {
    pub fn new(prompt_tokens: i32, completion_tokens: i32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatChoice {
    pub index: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delta: Option<ChatDelta>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<FinishReason>,
}

/// A single streaming chunk from the LLM provider (matches OpenAI's
/// `chat.completion.chunk` object).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionChunk {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChatChoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
}

#[derive(Debug, Error, Clone, Serialize, Deserialize)]
pub enum CompletionError {
    #[error("request to LLM provider failed: {0}")]
    RequestFailed(String),
    #[error("HTTP error {status_code}: {message}")]
    HttpError { status_code: u16, message: String },
    #[error("invalid response from LLM provider: {0}")]
    InvalidResponse(String),
}

// ============================================================================
// ASR (speech-to-text)
// ============================================================================

#[derive(Debug, Clone)]
pub struct AsrRequest {
    pub audio: Vec<u8>,
    pub sample_rate_hz: u32,
    pub language_hint: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsrResponse {
    pub transcript: String,
    pub confidence: f32,
    pub is_final: bool,
}

#[derive(Debug, Error, Clone, Serialize, Deserialize)]
pub enum AsrError {
    #[error("transcription request failed: {0}")]
    RequestFailed(String),
    #[error("HTTP error {status_code}: {message}")]
    HttpError { status_code: u16, message: String },
    #[error("audio could not be decoded: {0}")]
    InvalidAudio(String),
}

// ============================================================================
// RAG (retrieval)
// ============================================================================

#[derive(Debug, Clone)]
pub struct RagQuery {
    pub query_text: String,
    pub history: Vec<String>,
    pub top_k: usize,
    pub similarity_threshold: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievedChunk {
    pub text: String,
    pub score: f32,
    pub source: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RagResponse {
    pub chunks: Vec<RetrievedChunk>,
}

#[derive(Debug, Error, Clone, Serialize, Deserialize)]
pub enum RagError {
    #[error("retrieval request failed: {0}")]
    RequestFailed(String),
    #[error("HTTP error {status_code}: {message}")]
    HttpError { status_code: u16, message: String },
}

// ============================================================================
// TTS (text-to-speech)
// ============================================================================

#[derive(Debug, Clone)]
pub struct TtsRequest {
    pub text: String,
    pub voice: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TtsAudioChunk {
    pub audio: Vec<u8>,
    pub is_final: bool,
}

#[derive(Debug, Error, Clone, Serialize, Deserialize)]
pub enum TtsError {
    #[error("speech synthesis request failed: {0}")]
    RequestFailed(String),
    #[error("HTTP error {status_code}: {message}")]
    HttpError { status_code: u16, message: String },
}

// ============================================================================
// LIPSYNC (viseme/animation generation)
// ============================================================================

#[derive(Debug, Clone)]
pub struct LipsyncRequest {
    pub audio: Vec<u8>,
    pub text: Option<String>,
}

/// Wire format of a generated video frame (spec §6: `response_video.format`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LipsyncFrameFormat {
    Jpeg,
    H264,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LipsyncFrame {
    pub frame_data: Vec<u8>,
    pub format: LipsyncFrameFormat,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LipsyncResponse {
    pub frames: Vec<LipsyncFrame>,
}

#[derive(Debug, Error, Clone, Serialize, Deserialize)]
pub enum LipsyncError {
    #[error("lipsync request failed: {0}")]
    RequestFailed(String),
    #[error("HTTP error {status_code}: {message}")]
    HttpError { status_code: u16, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_usage_totals_prompt_and_completion() {
        let usage = TokenUsage::new(10, 5);
        assert_eq!(usage.total_tokens, 15);
    }

    #[test]
    fn chat_completion_chunk_round_trips_through_json() {
        let chunk = ChatCompletionChunk {
            id: "chatcmpl-1".to_string(),
            object: "chat.completion.chunk".to_string(),
            created: 1_700_000_000,
            model: "test-model".to_string(),
            choices: vec![ChatChoice {
                index: 0,
                delta: Some(ChatDelta {
                    role: None,
                    content: Some("hi".to_string()),
                }),
                finish_reason: None,
            }],
            usage: None,
        };

        let json = serde_json::to_string(&chunk).unwrap();
        let parsed: ChatCompletionChunk = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.choices[0].delta.as_ref().unwrap().content.as_deref(), Some("hi"));
    }
}
