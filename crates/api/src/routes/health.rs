//! Health and readiness endpoints (spec §9.5 ambient stack). `/health` is a
//! pure liveness probe; `/health/ready` additionally reports the live
//! connection count so an orchestrator can distinguish "process is up" from
//! "process is accepting traffic".

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Json as ResponseJson;
use serde::{Deserialize, Serialize};

use crate::AppState;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Health check endpoint. Requires no authentication, touches no shared
/// state, useful for load balancers.
pub async fn health_check() -> (StatusCode, ResponseJson<HealthResponse>) {
    (
        StatusCode::OK,
        ResponseJson(HealthResponse {
            status: "ok".to_string(),
            version: option_env!("CARGO_PKG_VERSION").map(|v| v.to_string()),
        }),
    )
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub status: String,
    pub active_connections: usize,
}

/// Readiness probe: reports the live connection count.
pub async fn readiness_check(State(state): State<AppState>) -> (StatusCode, ResponseJson<ReadinessResponse>) {
    let active_connections = state.registry.count().await;
    (
        StatusCode::OK,
        ResponseJson(ReadinessResponse {
            status: "ready".to_string(),
            active_connections,
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_health_check() {
        let (status, ResponseJson(response)) = health_check().await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(response.status, "ok");
    }
}
