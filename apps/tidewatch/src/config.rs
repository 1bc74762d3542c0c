use std::env;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    /// Gateway endpoint the upstream shard dials.
    pub gateway_url: String,
    /// Token presented in identify/resume requests upstream.
    pub gateway_token: String,
    /// Origins allowed through admission. Empty list admits any origin.
    pub allowed_origins: Vec<String>,
    pub max_connections: usize,
    pub admissions_per_second: u32,
    pub viewer_heartbeat_interval_ms: u64,
    pub max_missed_pings: u32,
    pub session_ttl_seconds: u64,
    pub coalesce_quiet_ms: u64,
    pub coalesce_idle_evict_seconds: u64,
    pub connect_attempts: u32,
    pub connect_base_delay_ms: u64,
    pub connect_max_delay_ms: u64,
    pub send_budget_per_window: u32,
    pub send_window_seconds: u64,
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            port: env::var("TIDEWATCH_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(defaults.port),
            gateway_url: env::var("GATEWAY_URL").unwrap_or(defaults.gateway_url),
            gateway_token: env::var("GATEWAY_TOKEN").unwrap_or(defaults.gateway_token),
            allowed_origins: env::var("ALLOWED_ORIGINS")
                .map(|list| {
                    list.split(',')
                        .map(|origin| origin.trim().to_string())
                        .filter(|origin| !origin.is_empty())
                        .collect()
                })
                .unwrap_or(defaults.allowed_origins),
            max_connections: env::var("MAX_CONNECTIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_connections),
            admissions_per_second: env::var("ADMISSIONS_PER_SECOND")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.admissions_per_second),
            viewer_heartbeat_interval_ms: env::var("VIEWER_HEARTBEAT_INTERVAL_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.viewer_heartbeat_interval_ms),
            max_missed_pings: env::var("MAX_MISSED_PINGS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_missed_pings),
            session_ttl_seconds: env::var("SESSION_TTL")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.session_ttl_seconds),
            coalesce_quiet_ms: env::var("COALESCE_QUIET_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.coalesce_quiet_ms),
            coalesce_idle_evict_seconds: env::var("COALESCE_IDLE_EVICT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.coalesce_idle_evict_seconds),
            connect_attempts: env::var("CONNECT_ATTEMPTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.connect_attempts),
            connect_base_delay_ms: env::var("CONNECT_BASE_DELAY_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.connect_base_delay_ms),
            connect_max_delay_ms: env::var("CONNECT_MAX_DELAY_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.connect_max_delay_ms),
            send_budget_per_window: env::var("SEND_BUDGET")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.send_budget_per_window),
            send_window_seconds: env::var("SEND_WINDOW_SECONDS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.send_window_seconds),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8081,
            gateway_url: "wss://gateway.example".to_string(),
            gateway_token: String::new(),
            allowed_origins: Vec::new(),
            max_connections: 100,
            admissions_per_second: 5,
            viewer_heartbeat_interval_ms: 30_000,
            max_missed_pings: 3,
            session_ttl_seconds: 1800, // 30 minutes
            coalesce_quiet_ms: 5000,
            coalesce_idle_evict_seconds: 60,
            connect_attempts: 10,
            connect_base_delay_ms: 1000,
            connect_max_delay_ms: 30_000,
            send_budget_per_window: 115,
            send_window_seconds: 60,
        }
    }
}
