use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub server: ServerConfig,
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Every tunable named in spec §5 (timeouts, intervals, TTLs) plus the RAG
/// query shape from §4.H and the alert thresholds from §4.F. Defaults match
/// the values the spec names explicitly.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub session_ttl_secs: i64,
    pub session_create_timeout_ms: u64,
    pub heartbeat_interval_secs: u64,
    pub connection_timeout_secs: u64,
    pub expiry_sweep_interval_secs: u64,
    pub guest_ttl_secs: i64,

    pub asr_timeout_secs: u64,
    pub rag_timeout_secs: u64,
    pub llm_timeout_secs: u64,
    pub tts_timeout_secs: u64,
    pub lipsync_timeout_secs: u64,

    pub rag_history_turns: usize,
    pub rag_top_k: usize,
    pub rag_similarity_threshold: f32,

    pub interruption_settle_ms: u64,

    pub min_success_rate: f64,
    pub max_avg_connection_time_ms: f64,
    pub max_timeout_rate: f64,
    pub alert_min_samples: u64,

    /// Priced against the LLM provider's reported token usage (spec §3:
    /// Turn carries "per-stage costs"; only the LLM stage's external
    /// interface exposes a usage payload to price against).
    pub llm_cost_per_1k_tokens_usd: f64,

    pub hmac_secret: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            session_ttl_secs: 30 * 60,
            session_create_timeout_ms: 2_000,
            heartbeat_interval_secs: 25,
            connection_timeout_secs: 60,
            expiry_sweep_interval_secs: 5 * 60,
            guest_ttl_secs: 24 * 60 * 60,

            asr_timeout_secs: 30,
            rag_timeout_secs: 10,
            llm_timeout_secs: 60,
            tts_timeout_secs: 30,
            lipsync_timeout_secs: 30,

            rag_history_turns: 5,
            rag_top_k: 5,
            rag_similarity_threshold: 0.7,

            interruption_settle_ms: 200,

            min_success_rate: 0.95,
            max_avg_connection_time_ms: 3_000.0,
            max_timeout_rate: 0.05,
            alert_min_samples: 10,

            llm_cost_per_1k_tokens_usd: 0.002,

            hmac_secret: "dev-only-insecure-secret".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProvidersConfig {
    pub asr: ProviderEndpoint,
    pub rag: ProviderEndpoint,
    pub llm: ProviderEndpoint,
    pub tts: ProviderEndpoint,
    pub lipsync: ProviderEndpoint,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderEndpoint {
    pub base_url: String,
    pub api_key: Option<String>,
    #[serde(default)]
    pub use_mock: bool,
}

impl Default for ProviderEndpoint {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_key: None,
            use_mock: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub modules: HashMap<String, String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        let mut modules = HashMap::new();
        modules.insert("api".to_string(), "debug".to_string());
        modules.insert("services".to_string(), "debug".to_string());

        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            modules,
        }
    }
}
