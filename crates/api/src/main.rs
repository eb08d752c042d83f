use std::sync::Arc;

use api::{archiver::DatabaseArchiver, build_router, heartbeat::spawn_heartbeat, AppState};
use config::{ApiConfig, GatewayConfig, LoggingConfig, ProviderEndpoint};
use database::{Database, ShutdownCoordinator, ShutdownStage};
use domain::TokenVerifier;
use inference_providers::{
    AsrClient, AsrClientConfig, HttpAsrClient, HttpLipsyncClient, HttpLlmClient, HttpRagClient,
    HttpTtsClient, LipsyncClient, LipsyncClientConfig, LlmClient, LlmClientConfig, MockAsrClient,
    MockLipsyncClient, MockLlmClient, MockRagClient, MockTtsClient, RagClient, RagClientConfig,
    TtsClient, TtsClientConfig,
};
use services::gateway::{
    spawn_expiry_sweep, AlertThresholds, ConnectionRegistry, DisconnectReason, MessageRouter,
    MetricsCollector, SessionStore, TurnOrchestrator,
};
use tokio::signal;

#[tokio::main]
async fn main() {
    let config = ApiConfig::load().unwrap_or_else(|e| {
        eprintln!("Failed to load configuration: {}", e);
        eprintln!("Application cannot start without a valid configuration file.");
        std::process::exit(1);
    });

    init_tracing(&config.logging);
    tracing::debug!(?config, "loaded configuration");

    let bind_address = format!("{}:{}", config.server.host, config.server.port);
    let gateway_config = Arc::new(config.gateway.clone());

    let database = Arc::new(build_database().await);

    let asr: Arc<dyn AsrClient> = build_asr_client(&config.providers.asr);
    let rag: Arc<dyn RagClient> = build_rag_client(&config.providers.rag);
    let llm: Arc<dyn LlmClient> = build_llm_client(&config.providers.llm);
    let tts: Arc<dyn TtsClient> = build_tts_client(&config.providers.tts);
    let lipsync: Arc<dyn LipsyncClient> = build_lipsync_client(&config.providers.lipsync);

    let token_verifier = Arc::new(TokenVerifier::new(gateway_config.hmac_secret.clone()));
    let session_store = Arc::new(SessionStore::new(gateway_config.session_ttl_secs));
    let registry = Arc::new(ConnectionRegistry::new());
    let thresholds = AlertThresholds {
        min_success_rate: gateway_config.min_success_rate,
        max_avg_connection_time_ms: gateway_config.max_avg_connection_time_ms,
        max_timeout_rate: gateway_config.max_timeout_rate,
        alert_min_samples: gateway_config.alert_min_samples,
    };
    let metrics = Arc::new(MetricsCollector::new(thresholds));
    let archiver = Arc::new(DatabaseArchiver::new(database.clone()));

    let orchestrator = TurnOrchestrator::new(
        session_store.clone(),
        registry.clone(),
        asr,
        rag,
        llm,
        tts,
        lipsync,
        Some(archiver),
        gateway_config.clone(),
    );
    let router = Arc::new(MessageRouter::new(
        session_store.clone(),
        registry.clone(),
        orchestrator,
        gateway_config.clone(),
    ));

    let heartbeat = spawn_heartbeat(
        registry.clone(),
        session_store.clone(),
        metrics.clone(),
        gateway_config.clone(),
    );
    let expiry_sweep = spawn_expiry_sweep(
        session_store.clone(),
        std::time::Duration::from_secs(gateway_config.expiry_sweep_interval_secs),
    );

    let state = AppState {
        token_verifier,
        session_store,
        registry: registry.clone(),
        metrics: metrics.clone(),
        router,
        config: gateway_config,
    };
    let app = build_router(state);

    tracing::info!(%bind_address, "starting realtime voice gateway");
    let listener = tokio::net::TcpListener::bind(&bind_address)
        .await
        .unwrap_or_else(|e| {
            eprintln!("Failed to bind {}: {}", bind_address, e);
            std::process::exit(1);
        });

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .unwrap_or_else(|e| {
            eprintln!("Server error: {}", e);
            std::process::exit(1);
        });

    run_shutdown_sequence(registry, metrics, heartbeat, expiry_sweep).await;
}

/// Spec §4.G shutdown sequence, staged with bounded per-stage timeouts
/// (spec §5: background tasks and live connections both have a bounded
/// window to close before the process exits regardless).
async fn run_shutdown_sequence(
    registry: Arc<ConnectionRegistry>,
    metrics: Arc<MetricsCollector>,
    heartbeat: tokio::task::JoinHandle<()>,
    expiry_sweep: tokio::task::JoinHandle<()>,
) {
    let mut coordinator = ShutdownCoordinator::new(std::time::Duration::from_secs(30));
    coordinator.start();

    coordinator
        .execute_stage(
            ShutdownStage { name: "stop_background_tasks", timeout: std::time::Duration::from_secs(5) },
            || async move {
                heartbeat.abort();
                expiry_sweep.abort();
            },
        )
        .await;

    coordinator
        .execute_stage(
            ShutdownStage { name: "close_connections", timeout: std::time::Duration::from_secs(15) },
            || async move {
                for connection in registry.enumerate().await {
                    connection.close(1001, "Server shutting down".to_string()).await;
                    metrics.record_disconnection(DisconnectReason::ServerShutdown);
                }
            },
        )
        .await;

    coordinator.finish();
}

/// Connects to Postgres when the archive is configured via environment
/// variables, otherwise falls back to the in-memory archive (spec Non-goals:
/// the archive's internals are out of scope for this core).
async fn build_database() -> Database {
    let Ok(host) = std::env::var("GATEWAY_DB_HOST") else {
        tracing::info!("no GATEWAY_DB_HOST set, using in-memory turn archive");
        return Database::in_memory();
    };

    let db_config = database::DatabaseConfig {
        host,
        port: std::env::var("GATEWAY_DB_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(5432),
        database: std::env::var("GATEWAY_DB_NAME").unwrap_or_else(|_| "voicegw".to_string()),
        username: std::env::var("GATEWAY_DB_USER").unwrap_or_else(|_| "postgres".to_string()),
        password: std::env::var("GATEWAY_DB_PASSWORD").unwrap_or_default(),
    };

    match Database::from_config(&db_config).await {
        Ok(database) => database,
        Err(err) => {
            tracing::error!(%err, "failed to connect to turn archive database, falling back to in-memory");
            Database::in_memory()
        }
    }
}

fn build_asr_client(endpoint: &ProviderEndpoint) -> Arc<dyn AsrClient> {
    if endpoint.use_mock {
        return Arc::new(MockAsrClient::new("hello there"));
    }
    Arc::new(
        HttpAsrClient::new(AsrClientConfig {
            base_url: endpoint.base_url.clone(),
            api_key: endpoint.api_key.clone().unwrap_or_default(),
            timeout_seconds: 30,
        })
        .expect("failed to build ASR client"),
    )
}

fn build_rag_client(endpoint: &ProviderEndpoint) -> Arc<dyn RagClient> {
    if endpoint.use_mock {
        return Arc::new(MockRagClient::empty());
    }
    Arc::new(
        HttpRagClient::new(RagClientConfig {
            base_url: endpoint.base_url.clone(),
            api_key: endpoint.api_key.clone().unwrap_or_default(),
            timeout_seconds: 10,
        })
        .expect("failed to build RAG client"),
    )
}

fn build_llm_client(endpoint: &ProviderEndpoint) -> Arc<dyn LlmClient> {
    if endpoint.use_mock {
        return Arc::new(MockLlmClient::new(
            "I hear you. Let me help with that.",
        ));
    }
    Arc::new(
        HttpLlmClient::new(LlmClientConfig {
            base_url: endpoint.base_url.clone(),
            api_key: endpoint.api_key.clone().unwrap_or_default(),
            timeout_seconds: 60,
        })
        .expect("failed to build LLM client"),
    )
}

fn build_tts_client(endpoint: &ProviderEndpoint) -> Arc<dyn TtsClient> {
    if endpoint.use_mock {
        return Arc::new(MockTtsClient::new(vec![0u8; 32]));
    }
    Arc::new(
        HttpTtsClient::new(TtsClientConfig {
            base_url: endpoint.base_url.clone(),
            api_key: endpoint.api_key.clone().unwrap_or_default(),
            timeout_seconds: 30,
        })
        .expect("failed to build TTS client"),
    )
}

fn build_lipsync_client(endpoint: &ProviderEndpoint) -> Arc<dyn LipsyncClient> {
    if endpoint.use_mock {
        return Arc::new(MockLipsyncClient::default());
    }
    Arc::new(
        HttpLipsyncClient::new(LipsyncClientConfig {
            base_url: endpoint.base_url.clone(),
            api_key: endpoint.api_key.clone().unwrap_or_default(),
            timeout_seconds: 30,
        })
        .expect("failed to build lipsync client"),
    )
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

fn init_tracing(logging_config: &LoggingConfig) {
    let mut filter = logging_config.level.clone();
    for (module, level) in &logging_config.modules {
        filter.push_str(&format!(",{}={}", module, level));
    }

    match logging_config.format.as_str() {
        "json" => {
            tracing_subscriber::fmt().json().with_env_filter(filter).init();
        }
        "compact" => {
            tracing_subscriber::fmt().compact().with_env_filter(filter).init();
        }
        _ => {
            tracing_subscriber::fmt().pretty().with_env_filter(filter).init();
        }
    }
}
