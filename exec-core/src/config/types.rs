use serde::{Deserialize, Serialize};

/// Top-level configuration, one field per namespace named in the
/// external-interfaces configuration table plus the ambient sections
/// (database/redis/metrics/exchange) a runnable system also needs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub rate_limiter: RateLimiterConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub stream: StreamConfig,
    pub reconciliation: ReconciliationConfig,
    pub risk: RiskConfig,
    pub portfolio: PortfolioConfig,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub metrics: MetricsConfig,
    pub exchange: ExchangeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimiterConfig {
    pub capacity: u32,
    pub refill_per_sec: u32,
    pub max_queue_size: usize,
    pub max_wait_ms: u64,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            capacity: 50,
            refill_per_sec: 5,
            max_queue_size: 100,
            max_wait_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: usize,
    pub success_threshold: usize,
    pub timeout_ms: u64,
    pub window_size: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 3,
            timeout_ms: 30_000,
            window_size: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub ping_ms: u64,
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,
    pub connect_timeout_ms: u64,
    pub listen_key_refresh_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            ping_ms: 10_000,
            reconnect_base_ms: 1_000,
            reconnect_max_ms: 32_000,
            connect_timeout_ms: 30_000,
            listen_key_refresh_ms: 1_800_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconciliationConfig {
    pub interval_ms: u64,
    pub lookback_hours: i64,
    pub submission_timeout_ms: i64,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            interval_ms: 60_000,
            lookback_hours: 24,
            submission_timeout_ms: 300_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    pub approval_ttl_sec: u64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self { approval_ttl_sec: 10 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortfolioConfig {
    pub staleness_sec: i64,
    pub batch_size: i64,
}

impl Default for PortfolioConfig {
    fn default() -> Self {
        Self {
            staleness_sec: 5,
            batch_size: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "exec-core.sqlite3".to_string(),
            busy_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
        }
    }
}

/// Logging configuration, kept separate from the other namespaces since
/// it's read once at startup before anything else is constructed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub log_level: String,
    pub json_logs: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    pub rest_base_url: String,
    pub ws_base_url: String,
    pub api_key: String,
    pub api_secret: String,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            rest_base_url: "https://api.exchange.example".to_string(),
            ws_base_url: "wss://stream.exchange.example".to_string(),
            api_key: String::new(),
            api_secret: String::new(),
        }
    }
}
