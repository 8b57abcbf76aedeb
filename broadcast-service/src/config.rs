/// Configuration management for the broadcast service
///
/// Loads configuration from environment variables with sensible defaults.
/// Everything is plain data handed into constructors; nothing reads the
/// environment after startup.
use serde::Deserialize;

use crate::models::MembershipTier;

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    pub app: AppConfig,
    pub database: DatabaseConfig,
    pub provider: ProviderConfig,
    pub lifecycle: LifecycleConfig,
    pub viewers: ViewerConfig,
    pub access: AccessConfig,
}

#[derive(Clone, Debug, Deserialize)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub env: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct DatabaseConfig {
    /// Absent means the in-memory store (local development).
    pub url: Option<String>,
    pub max_connections: u32,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ProviderConfig {
    pub api_base: String,
    pub api_token: String,
    /// Shared secret for webhook signature verification.
    pub webhook_secret: String,
    /// CDN base from which playback URLs are derived.
    pub playback_base: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct LifecycleConfig {
    /// Streams live for less than this produce no recording.
    pub min_recording_secs: i64,
    /// How long webhook event ids are remembered for dedup.
    pub dedup_window_secs: u64,
    /// Hard per-event processing budget.
    pub event_timeout_ms: u64,
    /// Bounded retries for transient store failures, with backoff.
    pub store_retry_attempts: u32,
    pub store_retry_base_ms: u64,
    /// Bounds of the title-match fallback scan.
    pub match_window_secs: i64,
    pub match_scan_limit: i64,
    pub orphan_sweep_interval_secs: u64,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ViewerConfig {
    /// Sessions with no heartbeat for this long are reaped as leaves.
    pub session_ttl_secs: i64,
    pub sweep_interval_secs: u64,
}

#[derive(Clone, Debug, Deserialize)]
pub struct AccessConfig {
    /// Minimum tier admitted to members-only content.
    pub min_member_tier: MembershipTier,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        Ok(Config {
            app: AppConfig {
                host: std::env::var("BROADCAST_SERVICE_HOST")
                    .unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: env_parsed("BROADCAST_SERVICE_PORT", 8085),
                env: std::env::var("APP_ENV").unwrap_or_else(|_| "development".to_string()),
            },
            database: DatabaseConfig {
                url: std::env::var("DATABASE_URL").ok().filter(|s| !s.is_empty()),
                max_connections: env_parsed("DATABASE_MAX_CONNECTIONS", 10),
            },
            provider: ProviderConfig {
                api_base: std::env::var("PROVIDER_API_BASE")
                    .unwrap_or_else(|_| "https://api.provider.example".to_string()),
                api_token: std::env::var("PROVIDER_API_TOKEN").unwrap_or_default(),
                webhook_secret: std::env::var("PROVIDER_WEBHOOK_SECRET")
                    .map_err(|_| "PROVIDER_WEBHOOK_SECRET must be set")?,
                playback_base: std::env::var("PLAYBACK_CDN_BASE")
                    .unwrap_or_else(|_| "https://cdn.pulse.dev/hls".to_string()),
            },
            lifecycle: LifecycleConfig {
                min_recording_secs: env_parsed("MIN_RECORDING_SECS", 60),
                dedup_window_secs: env_parsed("WEBHOOK_DEDUP_WINDOW_SECS", 300),
                event_timeout_ms: env_parsed("EVENT_TIMEOUT_MS", 10_000),
                store_retry_attempts: env_parsed("STORE_RETRY_ATTEMPTS", 3),
                store_retry_base_ms: env_parsed("STORE_RETRY_BASE_MS", 50),
                match_window_secs: env_parsed("MATCH_WINDOW_SECS", 86_400),
                match_scan_limit: env_parsed("MATCH_SCAN_LIMIT", 50),
                orphan_sweep_interval_secs: env_parsed("ORPHAN_SWEEP_INTERVAL_SECS", 300),
            },
            viewers: ViewerConfig {
                session_ttl_secs: env_parsed("VIEWER_SESSION_TTL_SECS", 120),
                sweep_interval_secs: env_parsed("VIEWER_SWEEP_INTERVAL_SECS", 30),
            },
            access: AccessConfig {
                min_member_tier: std::env::var("MIN_MEMBER_TIER")
                    .ok()
                    .and_then(|s| MembershipTier::from_str(&s))
                    .unwrap_or(MembershipTier::Member),
            },
        })
    }
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[serial_test::serial]
    fn env_parsed_falls_back_on_missing_or_garbage() {
        std::env::remove_var("DEFINITELY_UNSET_KEY");
        assert_eq!(env_parsed("DEFINITELY_UNSET_KEY", 42u32), 42);
    }
}
