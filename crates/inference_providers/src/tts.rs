use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Serialize;

use crate::models::{TtsAudioChunk, TtsError, TtsRequest};
use crate::TtsStream;

/// Synthesizes speech for a turn's reply text, streaming encoded audio
/// chunks back as they're produced rather than waiting for the full clip.
#[async_trait]
pub trait TtsClient: Send + Sync {
    async fn synthesize_stream(&self, request: TtsRequest) -> Result<TtsStream, TtsError>;
}

#[derive(Debug, Clone)]
pub struct TtsClientConfig {
    pub base_url: String,
    pub api_key: String,
    pub timeout_seconds: u64,
}

pub struct HttpTtsClient {
    config: TtsClientConfig,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct TtsWireRequest<'a> {
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    voice: Option<&'a str>,
}

impl HttpTtsClient {
    pub fn new(config: TtsClientConfig) -> Result<Self, TtsError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| TtsError::RequestFailed(e.to_string()))?;
        Ok(Self { config, client })
    }

    fn endpoint(&self) -> String {
        format!("{}/synthesize", self.config.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl TtsClient for HttpTtsClient {
    async fn synthesize_stream(&self, request: TtsRequest) -> Result<TtsStream, TtsError> {
        let wire = TtsWireRequest {
            text: &request.text,
            voice: request.voice.as_deref(),
        };

        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.config.api_key)
            .json(&wire)
            .send()
            .await
            .map_err(|e| TtsError::RequestFailed(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(TtsError::HttpError {
                status_code: status,
                message: crate::extract_error_message(&body),
            });
        }

        let stream = response.bytes_stream().map(|chunk| {
            chunk
                .map(|bytes| TtsAudioChunk {
                    audio: bytes.to_vec(),
                    is_final: false,
                })
                .map_err(|e| TtsError::RequestFailed(e.to_string()))
        });

        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_strips_trailing_slash_from_base_url() {
        let client = HttpTtsClient::new(TtsClientConfig {
            base_url: "https://tts.internal/".to_string(),
            api_key: "key".to_string(),
            timeout_seconds: 10,
        })
        .unwrap();
        assert_eq!(client.endpoint(), "https://tts.internal/synthesize");
    }
}
