use async_trait::async_trait;
use serde::Serialize;

use crate::models::{AsrError, AsrRequest, AsrResponse};

/// Sends a single utterance buffer to the speech-to-text provider and
/// returns a transcript.
#[async_trait]
pub trait AsrClient: Send + Sync {
    async fn transcribe(&self, request: AsrRequest) -> Result<AsrResponse, AsrError>;
}

#[derive(Debug, Clone)]
pub struct AsrClientConfig {
    pub base_url: String,
    pub api_key: String,
    pub timeout_seconds: u64,
}

pub struct HttpAsrClient {
    config: AsrClientConfig,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct AsrWireRequest<'a> {
    audio_base64: String,
    sample_rate_hz: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    language_hint: Option<&'a str>,
}

impl HttpAsrClient {
    pub fn new(config: AsrClientConfig) -> Result<Self, AsrError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| AsrError::RequestFailed(e.to_string()))?;
        Ok(Self { config, client })
    }

    fn endpoint(&self) -> String {
        format!("{}/transcribe", self.config.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl AsrClient for HttpAsrClient {
    async fn transcribe(&self, request: AsrRequest) -> Result<AsrResponse, AsrError> {
        use base64::Engine;

        let wire = AsrWireRequest {
            audio_base64: base64::engine::general_purpose::STANDARD.encode(&request.audio),
            sample_rate_hz: request.sample_rate_hz,
            language_hint: request.language_hint.as_deref(),
        };

        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.config.api_key)
            .json(&wire)
            .send()
            .await
            .map_err(|e| AsrError::RequestFailed(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(AsrError::HttpError {
                status_code: status,
                message: crate::extract_error_message(&body),
            });
        }

        response
            .json::<AsrResponse>()
            .await
            .map_err(|e| AsrError::InvalidAudio(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_strips_trailing_slash_from_base_url() {
        let client = HttpAsrClient::new(AsrClientConfig {
            base_url: "https://asr.internal/".to_string(),
            api_key: "key".to_string(),
            timeout_seconds: 10,
        })
        .unwrap();
        assert_eq!(client.endpoint(), "https://asr.internal/transcribe");
    }
}
