//! Heartbeat ticker (spec §4.G): every `HEARTBEAT_INTERVAL`, every live
//! connection either gets a `ping` or, if its last `pong` is older than
//! `CONNECTION_TIMEOUT`, gets closed with code 4002.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use config::GatewayConfig;
use domain::MessageEnvelope;
use serde_json::json;
use services::gateway::{ConnectionRegistry, DisconnectReason, MetricsCollector, SessionStore};
use tokio::task::JoinHandle;

pub fn spawn_heartbeat(
    registry: Arc<ConnectionRegistry>,
    session_store: Arc<SessionStore>,
    metrics: Arc<MetricsCollector>,
    config: Arc<GatewayConfig>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(config.heartbeat_interval_secs));
        let timeout = chrono::Duration::seconds(config.connection_timeout_secs as i64);
        loop {
            ticker.tick().await;
            let now = Utc::now();
            for connection in registry.enumerate().await {
                if connection.last_pong_age(now).await > timeout {
                    connection.close(4002, "Connection timeout").await;
                    registry.unregister(&connection.id).await;
                    if let Some(session_id) = &connection.session_id {
                        session_store.delete(session_id).await;
                    }
                    metrics.record_disconnection(DisconnectReason::Timeout);
                    metrics.set_active(registry.count().await as u64);
                    continue;
                }

                let ts = now.timestamp_millis();
                if let Ok(envelope) = MessageEnvelope::new(
                    "ping",
                    connection.session_id.clone(),
                    Some(json!({"timestamp": ts})),
                    ts,
                ) {
                    connection.emit(&envelope).await;
                }
            }
        }
    })
}
