use async_trait::async_trait;
use serde::Serialize;

use crate::models::{RagError, RagQuery, RagResponse};

/// Retrieves context chunks relevant to the current turn from a retrieval
/// backend, given the user's query text and recent conversation history.
#[async_trait]
pub trait RagClient: Send + Sync {
    async fn retrieve(&self, query: RagQuery) -> Result<RagResponse, RagError>;
}

#[derive(Debug, Clone)]
pub struct RagClientConfig {
    pub base_url: String,
    pub api_key: String,
    pub timeout_seconds: u64,
}

pub struct HttpRagClient {
    config: RagClientConfig,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct RagWireQuery<'a> {
    query: &'a str,
    history: &'a [String],
    top_k: usize,
    similarity_threshold: f32,
}

impl HttpRagClient {
    pub fn new(config: RagClientConfig) -> Result<Self, RagError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| RagError::RequestFailed(e.to_string()))?;
        Ok(Self { config, client })
    }

    fn endpoint(&self) -> String {
        format!("{}/retrieve", self.config.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl RagClient for HttpRagClient {
    async fn retrieve(&self, query: RagQuery) -> Result<RagResponse, RagError> {
        let wire = RagWireQuery {
            query: &query.query_text,
            history: &query.history,
            top_k: query.top_k,
            similarity_threshold: query.similarity_threshold,
        };

        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.config.api_key)
            .json(&wire)
            .send()
            .await
            .map_err(|e| RagError::RequestFailed(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(RagError::HttpError {
                status_code: status,
                message: crate::extract_error_message(&body),
            });
        }

        response
            .json::<RagResponse>()
            .await
            .map_err(|e| RagError::RequestFailed(e.to_string()))
    }
}
