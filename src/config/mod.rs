use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub server_host: String,
    pub server_port: u16,
    pub api_base_uri: String,
    pub jwt_secret: String,
    pub jwt_expiration_secs: u64,
    pub data_file: PathBuf,
    pub save_debounce_ms: u64,
    pub batch_flush_interval_ms: u64,
    pub batch_queue_limit: usize,
    pub history_cap: usize,
    pub geofence_cooldown_secs: u64,
    pub ws_heartbeat_secs: u64,
    pub ws_idle_timeout_secs: u64,
    pub push_webhook_url: Option<String>,
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, "Unparsable config value, using default");
            default
        }),
        Err(_) => default,
    }
}

/// Like [`env_or`], but values below `min` are raised to it.
fn env_at_least<T>(key: &str, default: T, min: T) -> T
where
    T: FromStr + PartialOrd + Copy + std::fmt::Display,
{
    let value = env_or(key, default);
    if value < min {
        tracing::warn!(key, %value, %min, "Config value below minimum, clamping");
        return min;
    }
    value
}

impl Config {
    /// Defaults for everything except the signing secret and the data file.
    pub fn new(jwt_secret: impl Into<String>, data_file: impl Into<PathBuf>) -> Self {
        Self {
            server_host: "::".into(),
            server_port: 3000,
            api_base_uri: "/api".into(),
            jwt_secret: jwt_secret.into(),
            jwt_expiration_secs: 24 * 3600,
            data_file: data_file.into(),
            save_debounce_ms: 1000,
            batch_flush_interval_ms: 500,
            batch_queue_limit: 100,
            history_cap: 5000,
            geofence_cooldown_secs: 300,
            ws_heartbeat_secs: 25,
            ws_idle_timeout_secs: 60,
            push_webhook_url: None,
        }
    }

    pub fn from_env() -> Result<Self, env::VarError> {
        dotenv::dotenv().ok();

        let defaults = Self::new(env::var("JWT_SECRET")?, "data.json");

        Ok(Config {
            server_host: env::var("SERVER_HOST").unwrap_or(defaults.server_host),
            server_port: env_or("SERVER_PORT", defaults.server_port),
            api_base_uri: env::var("API_BASE_URI").unwrap_or(defaults.api_base_uri),
            jwt_expiration_secs: env::var("JWT_EXPIRATION")
                .ok()
                .and_then(|v| v.trim_end_matches('h').parse::<u64>().ok())
                .map(|hours| hours * 3600)
                .unwrap_or(defaults.jwt_expiration_secs),
            data_file: env::var("DATA_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_file),
            save_debounce_ms: env_or("SAVE_DEBOUNCE_MS", defaults.save_debounce_ms),
            batch_flush_interval_ms: env_at_least(
                "BATCH_FLUSH_INTERVAL_MS",
                defaults.batch_flush_interval_ms,
                1,
            ),
            batch_queue_limit: env_or("BATCH_QUEUE_LIMIT", defaults.batch_queue_limit),
            history_cap: env_or("HISTORY_CAP", defaults.history_cap),
            geofence_cooldown_secs: env_or(
                "GEOFENCE_COOLDOWN_SECS",
                defaults.geofence_cooldown_secs,
            ),
            ws_heartbeat_secs: env_at_least("WS_HEARTBEAT_SECS", defaults.ws_heartbeat_secs, 1),
            ws_idle_timeout_secs: env_or("WS_IDLE_TIMEOUT_SECS", defaults.ws_idle_timeout_secs),
            push_webhook_url: env::var("PUSH_WEBHOOK_URL")
                .ok()
                .filter(|url| !url.trim().is_empty()),
            jwt_secret: defaults.jwt_secret,
        })
    }

    pub fn save_debounce(&self) -> Duration {
        Duration::from_millis(self.save_debounce_ms)
    }

    /// Never zero; timers reject a zero period.
    pub fn batch_flush_interval(&self) -> Duration {
        Duration::from_millis(self.batch_flush_interval_ms.max(1))
    }

    pub fn geofence_cooldown(&self) -> Duration {
        Duration::from_secs(self.geofence_cooldown_secs)
    }

    pub fn ws_heartbeat(&self) -> Duration {
        Duration::from_secs(self.ws_heartbeat_secs.max(1))
    }

    pub fn ws_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.ws_idle_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_periods_are_raised_to_the_minimum() {
        let mut config = Config::new("secret", "data.json");
        config.batch_flush_interval_ms = 0;
        config.ws_heartbeat_secs = 0;

        assert_eq!(config.batch_flush_interval(), Duration::from_millis(1));
        assert_eq!(config.ws_heartbeat(), Duration::from_secs(1));
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::new("secret", "data.json");
        assert_eq!(config.save_debounce(), Duration::from_secs(1));
        assert_eq!(config.batch_flush_interval(), Duration::from_millis(500));
        assert_eq!(config.geofence_cooldown(), Duration::from_secs(300));
    }
}
