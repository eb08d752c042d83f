use async_trait::async_trait;
use base64::Engine;
use serde::Serialize;

use crate::models::{LipsyncError, LipsyncRequest, LipsyncResponse};

/// Derives viseme/animation frames from synthesized audio (and optionally
/// the text that produced it) for driving an avatar's mouth movement.
#[async_trait]
pub trait LipsyncClient: Send + Sync {
    async fn generate(&self, request: LipsyncRequest) -> Result<LipsyncResponse, LipsyncError>;
}

#[derive(Debug, Clone)]
pub struct LipsyncClientConfig {
    pub base_url: String,
    pub api_key: String,
    pub timeout_seconds: u64,
}

pub struct HttpLipsyncClient {
    config: LipsyncClientConfig,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct LipsyncWireRequest<'a> {
    audio_base64: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<&'a str>,
}

impl HttpLipsyncClient {
    pub fn new(config: LipsyncClientConfig) -> Result<Self, LipsyncError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| LipsyncError::RequestFailed(e.to_string()))?;
        Ok(Self { config, client })
    }

    fn endpoint(&self) -> String {
        format!("{}/lipsync", self.config.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl LipsyncClient for HttpLipsyncClient {
    async fn generate(&self, request: LipsyncRequest) -> Result<LipsyncResponse, LipsyncError> {
        let wire = LipsyncWireRequest {
            audio_base64: base64::engine::general_purpose::STANDARD.encode(&request.audio),
            text: request.text.as_deref(),
        };

        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.config.api_key)
            .json(&wire)
            .send()
            .await
            .map_err(|e| LipsyncError::RequestFailed(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(LipsyncError::HttpError {
                status_code: status,
                message: crate::extract_error_message(&body),
            });
        }

        response
            .json::<LipsyncResponse>()
            .await
            .map_err(|e| LipsyncError::RequestFailed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_strips_trailing_slash_from_base_url() {
        let client = HttpLipsyncClient::new(LipsyncClientConfig {
            base_url: "https://lipsync.internal/".to_string(),
            api_key: "key".to_string(),
            timeout_seconds: 10,
        })
        .unwrap();
        assert_eq!(client.endpoint(), "https://lipsync.internal/lipsync");
    }
}
