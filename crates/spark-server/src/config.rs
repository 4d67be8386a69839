//! Server configuration loaded from environment variables.
//!
//! Every setting has a default so the server starts with zero configuration
//! for local development: SQLite in the working directory, the in-memory
//! buffer and the in-process flush scheduler.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use spark_buffer::SubscriptionOptions;
use spark_shared::constants::{
    DEFAULT_NAMESPACE, FLUSH_BATCH_SIZE, FLUSH_IDLE_SECS, SUBSCRIPTION_HEALTH_CHECK_SECS,
    SUBSCRIPTION_SEND_TIMEOUT_SECS,
};

/// Server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// Env: `HTTP_ADDR`. Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// SQLite database file.
    /// Env: `DATABASE_PATH`. Default: `./spark.db`
    pub database_path: PathBuf,

    /// Redis connection URL. Unset selects the in-memory buffer.
    /// Env: `REDIS_URL`
    pub redis_url: Option<String>,

    /// Prefix of every fast-store key.
    /// Env: `KEY_NAMESPACE`. Default: `spark`
    pub key_namespace: String,

    /// Env: `FLUSH_BATCH_SIZE`. Default: `50`
    pub flush_batch_size: usize,

    /// Delay before draining a chat that is below the batch size.
    /// Env: `FLUSH_IDLE_SECS`. Default: `60`
    pub flush_idle: Duration,

    /// QStash API base URL.
    /// Env: `QSTASH_URL`. Default: `https://qstash.upstash.io`
    pub qstash_url: String,

    /// QStash bearer token. Unset selects the in-process scheduler.
    /// Env: `QSTASH_TOKEN`
    pub qstash_token: Option<String>,

    /// Env: `QSTASH_CURRENT_SIGNING_KEY`
    pub qstash_current_signing_key: Option<String>,

    /// Env: `QSTASH_NEXT_SIGNING_KEY`
    pub qstash_next_signing_key: Option<String>,

    /// Public base URL of this server, the target of flush webhooks.
    /// Env: `BACKEND_URL`. Default: `http://localhost:8080`
    pub backend_url: String,

    /// HS256 secret for WebSocket bearer tokens. Unset rejects every upgrade.
    /// Env: `JWT_SECRET`
    pub jwt_secret: Option<String>,

    /// Env: `PING_INTERVAL_SECS`. Default: `30`
    pub ping_interval: Duration,

    /// Read deadline, refreshed by every received frame.
    /// Env: `PONG_WAIT_SECS`. Default: `90`
    pub pong_wait: Duration,

    /// Env: `WRITE_WAIT_SECS`. Default: `30`
    pub write_wait: Duration,

    /// Env: `MAX_PING_RETRIES`. Default: `3`
    pub max_ping_retries: u32,

    /// Env: `SWEEP_INTERVAL_SECS`. Default: `60`
    pub sweep_interval: Duration,

    /// How often an idle subscription checks its socket is still there.
    /// Env: `SUBSCRIPTION_HEALTH_CHECK_SECS`. Default: `30`
    pub subscription_health_check: Duration,

    /// How long an event waits for a slow socket before it is dropped.
    /// Env: `SUBSCRIPTION_SEND_TIMEOUT_SECS`. Default: `10`
    pub subscription_send_timeout: Duration,

    /// Env: `SUBSCRIPTION_CAPACITY`. Default: `256`
    pub subscription_capacity: usize,
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("http_addr", &self.http_addr)
            .field("database_path", &self.database_path)
            .field("redis", &self.redis_url.is_some())
            .field("key_namespace", &self.key_namespace)
            .field("flush_batch_size", &self.flush_batch_size)
            .field("flush_idle", &self.flush_idle)
            .field("qstash_url", &self.qstash_url)
            .field("qstash", &self.qstash_token.is_some())
            .field("backend_url", &self.backend_url)
            .field("ping_interval", &self.ping_interval)
            .field("pong_wait", &self.pong_wait)
            .field("write_wait", &self.write_wait)
            .field("max_ping_retries", &self.max_ping_retries)
            .field("sweep_interval", &self.sweep_interval)
            .field("subscription", &self.subscription_options())
            .finish_non_exhaustive()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], 8080).into(),
            database_path: PathBuf::from("./spark.db"),
            redis_url: None,
            key_namespace: DEFAULT_NAMESPACE.to_string(),
            flush_batch_size: FLUSH_BATCH_SIZE,
            flush_idle: Duration::from_secs(FLUSH_IDLE_SECS),
            qstash_url: "https://qstash.upstash.io".to_string(),
            qstash_token: None,
            qstash_current_signing_key: None,
            qstash_next_signing_key: None,
            backend_url: "http://localhost:8080".to_string(),
            jwt_secret: None,
            ping_interval: Duration::from_secs(30),
            pong_wait: Duration::from_secs(90),
            write_wait: Duration::from_secs(30),
            max_ping_retries: 3,
            sweep_interval: Duration::from_secs(60),
            subscription_health_check: Duration::from_secs(SUBSCRIPTION_HEALTH_CHECK_SECS),
            subscription_send_timeout: Duration::from_secs(SUBSCRIPTION_SEND_TIMEOUT_SECS),
            subscription_capacity: SubscriptionOptions::default().capacity,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        parse_into(&lookup, "HTTP_ADDR", &mut config.http_addr);

        if let Some(path) = non_empty("DATABASE_PATH") {
            config.database_path = PathBuf::from(path);
        }

        config.redis_url = non_empty("REDIS_URL");

        if let Some(ns) = non_empty("KEY_NAMESPACE") {
            config.key_namespace = ns;
        }

        parse_into(&lookup, "FLUSH_BATCH_SIZE", &mut config.flush_batch_size);
        if config.flush_batch_size == 0 {
            tracing::warn!("FLUSH_BATCH_SIZE must be positive, using default");
            config.flush_batch_size = FLUSH_BATCH_SIZE;
        }
        parse_secs_into(&lookup, "FLUSH_IDLE_SECS", &mut config.flush_idle);

        if let Some(url) = non_empty("QSTASH_URL") {
            config.qstash_url = url.trim_end_matches('/').to_string();
        }
        config.qstash_token = non_empty("QSTASH_TOKEN");
        config.qstash_current_signing_key = non_empty("QSTASH_CURRENT_SIGNING_KEY");
        config.qstash_next_signing_key = non_empty("QSTASH_NEXT_SIGNING_KEY");

        if let Some(url) = non_empty("BACKEND_URL") {
            config.backend_url = url.trim_end_matches('/').to_string();
        }

        config.jwt_secret = non_empty("JWT_SECRET");

        parse_secs_into(&lookup, "PING_INTERVAL_SECS", &mut config.ping_interval);
        parse_secs_into(&lookup, "PONG_WAIT_SECS", &mut config.pong_wait);
        parse_secs_into(&lookup, "WRITE_WAIT_SECS", &mut config.write_wait);
        parse_into(&lookup, "MAX_PING_RETRIES", &mut config.max_ping_retries);
        parse_secs_into(&lookup, "SWEEP_INTERVAL_SECS", &mut config.sweep_interval);

        parse_secs_into(
            &lookup,
            "SUBSCRIPTION_HEALTH_CHECK_SECS",
            &mut config.subscription_health_check,
        );
        if config.subscription_health_check.is_zero() {
            tracing::warn!("SUBSCRIPTION_HEALTH_CHECK_SECS must be positive, using default");
            config.subscription_health_check = Duration::from_secs(SUBSCRIPTION_HEALTH_CHECK_SECS);
        }
        parse_secs_into(
            &lookup,
            "SUBSCRIPTION_SEND_TIMEOUT_SECS",
            &mut config.subscription_send_timeout,
        );
        parse_into(&lookup, "SUBSCRIPTION_CAPACITY", &mut config.subscription_capacity);

        // RUST_LOG is read by tracing-subscriber's EnvFilter directly.

        config
    }

    pub fn subscription_options(&self) -> SubscriptionOptions {
        SubscriptionOptions {
            health_check_interval: self.subscription_health_check,
            send_timeout: self.subscription_send_timeout,
            capacity: self.subscription_capacity.max(1),
        }
    }

    /// URL QStash delivers flush webhooks to; also the signed `sub` claim.
    pub fn flush_webhook_url(&self) -> String {
        format!("{}/v1/chat/flush", self.backend_url)
    }
}

fn parse_into<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) {
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(value) => *slot = value,
        Err(_) => tracing::warn!(key, value = %raw, "Invalid value, using default"),
    }
}

fn parse_secs_into(lookup: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut Duration) {
    let mut secs = slot.as_secs();
    parse_into(lookup, key, &mut secs);
    *slot = Duration::from_secs(secs);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_pairs(pairs: &[(&str, &str)]) -> ServerConfig {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServerConfig::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.http_addr, ([0, 0, 0, 0], 8080).into());
        assert_eq!(config.flush_batch_size, 50);
        assert_eq!(config.flush_idle, Duration::from_secs(60));
        assert!(config.redis_url.is_none());
        assert!(config.qstash_token.is_none());
    }

    #[test]
    fn test_overrides_and_trailing_slashes() {
        let config = from_pairs(&[
            ("HTTP_ADDR", "127.0.0.1:9000"),
            ("REDIS_URL", "redis://cache:6379"),
            ("FLUSH_BATCH_SIZE", "10"),
            ("FLUSH_IDLE_SECS", "5"),
            ("BACKEND_URL", "https://api.example.com/"),
            ("MAX_PING_RETRIES", "5"),
        ]);
        assert_eq!(config.http_addr, ([127, 0, 0, 1], 9000).into());
        assert_eq!(config.redis_url.as_deref(), Some("redis://cache:6379"));
        assert_eq!(config.flush_batch_size, 10);
        assert_eq!(config.flush_idle, Duration::from_secs(5));
        assert_eq!(
            config.flush_webhook_url(),
            "https://api.example.com/v1/chat/flush"
        );
        assert_eq!(config.max_ping_retries, 5);
    }

    #[test]
    fn test_invalid_values_keep_defaults() {
        let config = from_pairs(&[
            ("HTTP_ADDR", "not-an-addr"),
            ("FLUSH_BATCH_SIZE", "0"),
            ("PONG_WAIT_SECS", "soon"),
            ("QSTASH_TOKEN", "  "),
        ]);
        assert_eq!(config.http_addr, ([0, 0, 0, 0], 8080).into());
        assert_eq!(config.flush_batch_size, 50);
        assert_eq!(config.pong_wait, Duration::from_secs(90));
        assert!(config.qstash_token.is_none());
    }

    #[test]
    fn test_subscription_options_from_env() {
        let defaults = ServerConfig::default().subscription_options();
        assert_eq!(defaults.health_check_interval, Duration::from_secs(30));
        assert_eq!(defaults.send_timeout, Duration::from_secs(10));
        assert_eq!(defaults.capacity, 256);

        let options = from_pairs(&[
            ("SUBSCRIPTION_HEALTH_CHECK_SECS", "0"),
            ("SUBSCRIPTION_SEND_TIMEOUT_SECS", "2"),
            ("SUBSCRIPTION_CAPACITY", "0"),
        ])
        .subscription_options();
        assert_eq!(options.health_check_interval, Duration::from_secs(30));
        assert_eq!(options.send_timeout, Duration::from_secs(2));
        assert_eq!(options.capacity, 1);
    }
}
