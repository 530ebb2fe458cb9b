use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Soft timeout for fire-and-forget conversation log writes.
pub const STORE_WRITE_TIMEOUT_MS: u64 = 1_500;
/// Hard timeout for a single LLM generation call.
pub const LLM_TIMEOUT_SECS: u64 = 20;
/// Maximum tool-execution turns inside one LLM generation.
pub const MAX_TOOL_TURNS: usize = 5;
/// Conversation turns sent to the LLM alongside the current message.
pub const LLM_HISTORY_TURNS: usize = 12;
/// Session cache TTL (phone+clinic+channel → session).
pub const SESSION_CACHE_TTL_SECS: u64 = 300;
/// Clinic warmup TTL — a clinic is re-warmed at most this often.
pub const CLINIC_WARM_TTL_SECS: u64 = 900;

/// Top-level config (concierge.toml + CONCIERGE_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConciergeConfig {
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub clinic: ClinicConfig,
    #[serde(default)]
    pub escalation: EscalationConfig,
}

impl Default for ConciergeConfig {
    fn default() -> Self {
        Self {
            redis: RedisConfig::default(),
            database: DatabaseConfig::default(),
            provider: ProviderConfig::default(),
            clinic: ClinicConfig::default(),
            escalation: EscalationConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Evolution-like WhatsApp gateway endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default = "default_provider_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    /// Hard timeout for provider HTTP calls, seconds.
    #[serde(default = "default_provider_timeout")]
    pub http_timeout_secs: f64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: default_provider_url(),
            api_key: String::new(),
            http_timeout_secs: default_provider_timeout(),
        }
    }
}

impl ProviderConfig {
    /// Resolve from the environment, honouring the legacy variable names.
    /// `EVOLUTION_API_URL` wins over `EVOLUTION_SERVER_URL`.
    pub fn from_env() -> Self {
        let base_url = std::env::var("EVOLUTION_API_URL")
            .or_else(|_| std::env::var("EVOLUTION_SERVER_URL"))
            .unwrap_or_else(|_| default_provider_url());
        let api_key = std::env::var("EVOLUTION_API_KEY").unwrap_or_default();
        let http_timeout_secs = env_f64("WA_EVOLUTION_HTTP_TIMEOUT", default_provider_timeout());
        Self {
            base_url,
            api_key,
            http_timeout_secs,
        }
    }
}

/// Per-deployment clinic defaults the pipeline falls back to.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ClinicConfig {
    /// "service_first" or "doctor_first" narrowing strategy.
    #[serde(default = "default_strategy")]
    pub strategy: String,
    /// IANA timezone used for time-window normalization.
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EscalationConfig {
    /// Operator phone numbers notified on human handoff (one enqueue each).
    #[serde(default)]
    pub operator_phones: Vec<String>,
}

impl ConciergeConfig {
    /// Load config from a TOML file with CONCIERGE_* env var overrides.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: ConciergeConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("CONCIERGE_").split("_"))
            .extract()
            .map_err(|e| crate::error::ConciergeError::Config(e.to_string()))?;

        Ok(config)
    }
}

/// Parse a float from the environment, falling back on absence or junk.
pub fn env_f64(name: &str, default: f64) -> f64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Parse an integer from the environment, falling back on absence or junk.
pub fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn default_redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
}

fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.concierge/concierge.db", home)
}

fn default_provider_url() -> String {
    "https://evolution-api.example.com".to_string()
}

fn default_provider_timeout() -> f64 {
    15.0
}

fn default_strategy() -> String {
    "service_first".to_string()
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.concierge/concierge.toml", home)
}
