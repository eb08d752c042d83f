//! In-process mocks for the five capability clients, used by orchestrator
//! and gateway tests that need deterministic provider behavior without a
//! network dependency.

use async_trait::async_trait;
use tokio_stream::StreamExt;

use crate::asr::AsrClient;
use crate::lipsync::LipsyncClient;
use crate::llm::LlmClient;
use crate::models::{
    AsrError, AsrRequest, AsrResponse, ChatChoice, ChatCompletionChunk, ChatCompletionParams,
    ChatDelta, CompletionError, LipsyncError, LipsyncFrame, LipsyncFrameFormat, LipsyncRequest,
    LipsyncResponse, MessageRole, RagError, RagQuery, RagResponse, RetrievedChunk, TokenUsage,
    TtsAudioChunk, TtsError, TtsRequest,
};
use crate::rag::RagClient;
use crate::sse_parser::SSEEvent;
use crate::tts::TtsClient;
use crate::{LlmStream, TtsStream};

/// Streams `response` back word-by-word as `ChatCompletionChunk`s, mirroring
/// how a real token-by-token provider paces its output.
pub struct MockLlmClient {
    pub response: String,
}

impl MockLlmClient {
    pub fn new(response: impl Into<String>) -> Self {
        Self {
            response: response.into(),
        }
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn chat_completion_stream(
        &self,
        params: ChatCompletionParams,
    ) -> Result<LlmStream, CompletionError> {
        let words: Vec<String> = self
            .response
            .split_whitespace()
            .map(|w| format!("{w} "))
            .collect();
        let model = params.model.clone();

        let events: Vec<Result<SSEEvent, CompletionError>> = words
            .iter()
            .enumerate()
            .map(|(i, word)| {
                let chunk = ChatCompletionChunk {
                    id: "mock-chatcmpl".to_string(),
                    object: "chat.completion.chunk".to_string(),
                    created: 0,
                    model: model.clone(),
                    choices: vec![ChatChoice {
                        index: 0,
                        delta: Some(ChatDelta {
                            role: if i == 0 { Some(MessageRole::Assistant) } else { None },
                            content: Some(word.clone()),
                        }),
                        finish_reason: None,
                    }],
                    usage: None,
                };
                Ok(SSEEvent {
                    raw_bytes: bytes::Bytes::new(),
                    chunk,
                })
            })
            .chain(std::iter::once(Ok(SSEEvent {
                raw_bytes: bytes::Bytes::new(),
                chunk: ChatCompletionChunk {
                    id: "mock-chatcmpl".to_string(),
                    object: "chat.completion.chunk".to_string(),
                    created: 0,
                    model,
                    choices: vec![ChatChoice {
                        index: 0,
                        delta: Some(ChatDelta { role: None, content: None }),
                        finish_reason: Some(crate::models::FinishReason::Stop),
                    }],
                    usage: Some(TokenUsage::new(words.len() as i32, words.len() as i32)),
                },
            })))
            .collect();

        Ok(Box::pin(tokio_stream::iter(events)))
    }
}

/// Always returns the same transcript, regardless of the audio provided.
pub struct MockAsrClient {
    pub transcript: String,
}

impl MockAsrClient {
    pub fn new(transcript: impl Into<String>) -> Self {
        Self {
            transcript: transcript.into(),
        }
    }
}

#[async_trait]
impl AsrClient for MockAsrClient {
    async fn transcribe(&self, _request: AsrRequest) -> Result<AsrResponse, AsrError> {
        Ok(AsrResponse {
            transcript: self.transcript.clone(),
            confidence: 0.99,
            is_final: true,
        })
    }
}

/// Returns a fixed set of retrieved chunks regardless of the query.
pub struct MockRagClient {
    pub chunks: Vec<RetrievedChunk>,
}

impl MockRagClient {
    pub fn empty() -> Self {
        Self { chunks: Vec::new() }
    }
}

#[async_trait]
impl RagClient for MockRagClient {
    async fn retrieve(&self, _query: RagQuery) -> Result<RagResponse, RagError> {
        Ok(RagResponse {
            chunks: self.chunks.clone(),
        })
    }
}

/// Emits `chunks_per_call` fixed audio payloads per synthesis request
/// (default 1; spec §8 scenario S6 exercises 2-per-sentence).
pub struct MockTtsClient {
    pub audio: Vec<u8>,
    pub chunks_per_call: usize,
}

impl MockTtsClient {
    pub fn new(audio: Vec<u8>) -> Self {
        Self {
            audio,
            chunks_per_call: 1,
        }
    }

    pub fn with_chunks_per_call(audio: Vec<u8>, chunks_per_call: usize) -> Self {
        Self {
            audio,
            chunks_per_call,
        }
    }
}

#[async_trait]
impl TtsClient for MockTtsClient {
    async fn synthesize_stream(&self, _request: TtsRequest) -> Result<TtsStream, TtsError> {
        let total = self.chunks_per_call.max(1);
        let chunks: Vec<Result<TtsAudioChunk, TtsError>> = (0..total)
            .map(|i| {
                Ok(TtsAudioChunk {
                    audio: self.audio.clone(),
                    is_final: i + 1 == total,
                })
            })
            .collect();
        Ok(Box::pin(tokio_stream::iter(chunks)))
    }
}

/// Returns a fixed number of frames per call regardless of the audio
/// provided (default 3, matching spec §8 scenario S6).
pub struct MockLipsyncClient {
    pub frames_per_call: usize,
}

impl Default for MockLipsyncClient {
    fn default() -> Self {
        Self { frames_per_call: 3 }
    }
}

#[async_trait]
impl LipsyncClient for MockLipsyncClient {
    async fn generate(&self, _request: LipsyncRequest) -> Result<LipsyncResponse, LipsyncError> {
        Ok(LipsyncResponse {
            frames: (0..self.frames_per_call)
                .map(|_| LipsyncFrame {
                    frame_data: vec![0u8; 4],
                    format: LipsyncFrameFormat::Jpeg,
                })
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_llm_streams_one_chunk_per_word_plus_a_final_usage_chunk() {
        let client = MockLlmClient::new("hello world");
        let params = ChatCompletionParams {
            model: "mock-model".to_string(),
            messages: vec![],
            max_tokens: None,
            temperature: None,
            stream: None,
            stream_options: None,
        };

        let mut stream = client.chat_completion_stream(params).await.unwrap();
        let mut contents = Vec::new();
        let mut saw_usage = false;
        while let Some(event) = stream.next().await {
            let event = event.unwrap();
            if let Some(usage) = event.chunk.usage {
                saw_usage = true;
                assert_eq!(usage.completion_tokens, 2);
            }
            if let Some(content) = event
                .chunk
                .choices
                .first()
                .and_then(|c| c.delta.as_ref())
                .and_then(|d| d.content.clone())
            {
                contents.push(content);
            }
        }

        assert!(saw_usage);
        assert_eq!(contents, vec!["hello ", "world "]);
    }

    #[tokio::test]
    async fn mock_asr_returns_configured_transcript() {
        let client = MockAsrClient::new("turn the lights on");
        let response = client
            .transcribe(AsrRequest {
                audio: vec![0u8; 16],
                sample_rate_hz: 16_000,
                language_hint: None,
            })
            .await
            .unwrap();
        assert_eq!(response.transcript, "turn the lights on");
        assert!(response.is_final);
    }
}
