use std::env;
use std::time::Duration;

/// Runtime configuration, read from the environment with defaults suitable
/// for a single-node deployment.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,

    /// Jobs leased per drain cycle. Kept small: each generation call can take
    /// tens of seconds and upstream rate limits punish wide fan-out.
    pub drain_batch_size: i64,
    pub drain_interval: Duration,
    pub check_interval: Duration,
    pub retention_interval: Duration,

    /// In-flight jobs older than this are assumed orphaned and re-queued.
    pub lease_timeout: Duration,

    /// Retention horizons, in days.
    pub job_retention_days: i64,
    pub processed_retention_days: i64,
    pub daily_post_retention_days: i64,

    pub gateway_endpoint: String,
    pub gateway_api_key: String,
    pub gateway_model: String,
    pub gateway_timeout: Duration,

    pub store_endpoint: String,
    pub store_token: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: "sqlite:feedpress.db".to_string(),
            drain_batch_size: 2,
            drain_interval: Duration::from_secs(300),
            check_interval: Duration::from_secs(3600),
            retention_interval: Duration::from_secs(6 * 3600),
            lease_timeout: Duration::from_secs(1800),
            job_retention_days: 30,
            processed_retention_days: 90,
            daily_post_retention_days: 180,
            gateway_endpoint: "https://api.openai.com/v1".to_string(),
            gateway_api_key: String::new(),
            gateway_model: "gpt-4o".to_string(),
            gateway_timeout: Duration::from_secs(120),
            store_endpoint: String::new(),
            store_token: String::new(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            database_url: env_string("FEEDPRESS_DATABASE_URL", defaults.database_url),
            drain_batch_size: env_i64("FEEDPRESS_BATCH_SIZE", defaults.drain_batch_size),
            drain_interval: env_secs("FEEDPRESS_DRAIN_INTERVAL_SECS", defaults.drain_interval),
            check_interval: env_secs("FEEDPRESS_CHECK_INTERVAL_SECS", defaults.check_interval),
            retention_interval: env_secs(
                "FEEDPRESS_RETENTION_INTERVAL_SECS",
                defaults.retention_interval,
            ),
            lease_timeout: env_secs("FEEDPRESS_LEASE_TIMEOUT_SECS", defaults.lease_timeout),
            job_retention_days: env_i64("FEEDPRESS_JOB_RETENTION_DAYS", defaults.job_retention_days),
            processed_retention_days: env_i64(
                "FEEDPRESS_PROCESSED_RETENTION_DAYS",
                defaults.processed_retention_days,
            ),
            daily_post_retention_days: env_i64(
                "FEEDPRESS_DAILY_POST_RETENTION_DAYS",
                defaults.daily_post_retention_days,
            ),
            gateway_endpoint: env_string("FEEDPRESS_GATEWAY_ENDPOINT", defaults.gateway_endpoint),
            gateway_api_key: env_string("FEEDPRESS_GATEWAY_API_KEY", defaults.gateway_api_key),
            gateway_model: env_string("FEEDPRESS_GATEWAY_MODEL", defaults.gateway_model),
            gateway_timeout: env_secs("FEEDPRESS_GATEWAY_TIMEOUT_SECS", defaults.gateway_timeout),
            store_endpoint: env_string("FEEDPRESS_STORE_ENDPOINT", defaults.store_endpoint),
            store_token: env_string("FEEDPRESS_STORE_TOKEN", defaults.store_token),
        }
    }
}

fn env_string(key: &str, default: String) -> String {
    env::var(key).unwrap_or(default)
}

fn env_i64(key: &str, default: i64) -> i64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_secs(key: &str, default: Duration) -> Duration {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.drain_batch_size, 2);
        assert!(config.drain_interval < config.check_interval);
        assert!(config.job_retention_days > 0);
    }
}
