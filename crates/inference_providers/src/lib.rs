//! HTTP clients for the voice pipeline's external inference backends.
//!
//! Each capability (ASR, RAG, LLM, TTS, LIPSYNC) gets one narrow trait and one
//! real HTTP-backed implementation, plus a mock for tests. The LLM client is
//! streaming-first: chunks are forwarded to the orchestrator as they arrive
//! rather than buffered into a single response.

pub mod asr;
pub mod lipsync;
pub mod llm;
pub mod mock;
pub mod models;
pub mod rag;
pub mod sse_parser;
pub mod tts;

use std::pin::Pin;

use futures_core::Stream;

pub use models::*;
pub use sse_parser::{new_sse_parser, BufferedSSEParser, SSEEvent, SSEEventParser, SSEParser};

pub use asr::{AsrClient, HttpAsrClient};
pub use lipsync::{HttpLipsyncClient, LipsyncClient};
pub use llm::{HttpLlmClient, LlmClient};
pub use rag::{HttpRagClient, RagClient};
pub use tts::{HttpTtsClient, TtsClient};

pub use mock::{MockAsrClient, MockLipsyncClient, MockLlmClient, MockRagClient, MockTtsClient};

/// Extract a human-readable error message from a JSON error response body.
///
/// Supports the common `{"error": {"message": "..."}}` shape used by
/// OpenAI-compatible APIs and the `{"detail": "..."}` shape used by
/// FastAPI-backed services, falling back to the raw body otherwise.
pub fn extract_error_message(body: &str) -> String {
    if let Ok(json) = serde_json::from_str::<serde_json::Value>(body) {
        if let Some(msg) = json
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(|m| m.as_str())
        {
            return msg.to_string();
        }
        if let Some(detail) = json.get("detail").and_then(|d| d.as_str()) {
            return detail.to_string();
        }
    }
    body.to_string()
}

/// Stream of raw SSE events from the LLM provider, carrying both the parsed
/// chunk and the original bytes for archival.
pub type LlmStream = Pin<Box<dyn Stream<Item = Result<SSEEvent, CompletionError>> + Send>>;

/// Stream of decoded audio chunks from the TTS provider.
pub type TtsStream = Pin<Box<dyn Stream<Item = Result<TtsAudioChunk, TtsError>> + Send>>;
