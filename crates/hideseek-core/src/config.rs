// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use hideseek_protocol::SimServerConfig;

use crate::checkpoint::CheckpointConfig;
use crate::episode::EpisodeConfig;
use crate::runner::RunnerConfig;

/// Hideseek trainer configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// WebSocket listener host, an IP literal or a resolvable name
    pub ws_host: String,
    /// WebSocket listener port
    pub ws_port: u16,
    /// Deadline for every reset/step call
    pub call_timeout: Duration,
    /// Keep-alive ping interval in milliseconds (0 disables)
    pub ping_interval_ms: u64,
    /// Keep-alive pong deadline in milliseconds
    pub ping_timeout_ms: u64,
    /// Steps after which an episode is truncated
    pub max_steps: u64,
    /// Expected observation vector length
    pub observation_size: usize,
    /// Checkpoint root directory
    pub checkpoint_dir: PathBuf,
    /// Checkpoints to retain (0 = unbounded)
    pub keep_last_n: usize,
    /// Save a checkpoint every N iterations (0 = final only)
    pub checkpoint_freq: u64,
    /// Last training iteration; resumed runs stop here too
    pub total_iterations: u64,
    /// Environment steps collected per iteration
    pub steps_per_iteration: u64,
    /// Log an iteration summary every N iterations
    pub log_frequency: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ws_host: "127.0.0.1".to_string(),
            ws_port: 8765,
            call_timeout: Duration::from_secs(10),
            ping_interval_ms: 20_000,
            ping_timeout_ms: 20_000,
            max_steps: 500,
            observation_size: 91,
            checkpoint_dir: PathBuf::from("./checkpoints"),
            keep_last_n: 5,
            checkpoint_freq: 50,
            total_iterations: 1000,
            steps_per_iteration: 4000,
            log_frequency: 1,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// All variables are optional:
    /// - `HIDESEEK_WS_HOST`: listener host name or IP (default: 127.0.0.1)
    /// - `HIDESEEK_WS_PORT`: listener port (default: 8765)
    /// - `HIDESEEK_CALL_TIMEOUT_MS`: reset/step deadline (default: 10000)
    /// - `HIDESEEK_PING_INTERVAL_MS`: keep-alive interval (default: 20000)
    /// - `HIDESEEK_PING_TIMEOUT_MS`: pong deadline (default: 20000)
    /// - `HIDESEEK_MAX_STEPS`: truncation limit (default: 500)
    /// - `HIDESEEK_OBSERVATION_SIZE`: observation length (default: 91)
    /// - `HIDESEEK_CHECKPOINT_DIR`: checkpoint root (default: ./checkpoints)
    /// - `HIDESEEK_KEEP_LAST_N`: retention, 0 keeps all (default: 5)
    /// - `HIDESEEK_CHECKPOINT_FREQ`: save cadence (default: 50)
    /// - `HIDESEEK_TOTAL_ITERATIONS`: run length (default: 1000)
    /// - `HIDESEEK_STEPS_PER_ITERATION`: batch size (default: 4000)
    /// - `HIDESEEK_LOG_FREQUENCY`: summary cadence (default: 1)
    pub fn from_env() -> Result<Self, ConfigError> {
        let host = std::env::var("HIDESEEK_WS_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let host = host.trim();
        if host.is_empty() || host.contains(char::is_whitespace) {
            return Err(ConfigError::Invalid(
                "HIDESEEK_WS_HOST",
                "must be a host name or IP address",
            ));
        }
        let port: u16 = parse_var("HIDESEEK_WS_PORT", "8765", "must be a valid port number")?;

        let call_timeout_ms: u64 = parse_var(
            "HIDESEEK_CALL_TIMEOUT_MS",
            "10000",
            "must be a positive integer",
        )?;
        if call_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "HIDESEEK_CALL_TIMEOUT_MS",
                "must be greater than zero",
            ));
        }

        let max_steps: u64 = parse_var("HIDESEEK_MAX_STEPS", "500", "must be a positive integer")?;
        if max_steps == 0 {
            return Err(ConfigError::Invalid(
                "HIDESEEK_MAX_STEPS",
                "must be greater than zero",
            ));
        }

        let checkpoint_dir =
            std::env::var("HIDESEEK_CHECKPOINT_DIR").unwrap_or_else(|_| "./checkpoints".to_string());
        if checkpoint_dir.trim().is_empty() {
            return Err(ConfigError::Missing("HIDESEEK_CHECKPOINT_DIR"));
        }

        let log_frequency: u64 =
            parse_var("HIDESEEK_LOG_FREQUENCY", "1", "must be a positive integer")?;

        Ok(Self {
            ws_host: host.to_string(),
            ws_port: port,
            call_timeout: Duration::from_millis(call_timeout_ms),
            ping_interval_ms: parse_var(
                "HIDESEEK_PING_INTERVAL_MS",
                "20000",
                "must be a non-negative integer",
            )?,
            ping_timeout_ms: parse_var(
                "HIDESEEK_PING_TIMEOUT_MS",
                "20000",
                "must be a non-negative integer",
            )?,
            max_steps,
            observation_size: parse_var(
                "HIDESEEK_OBSERVATION_SIZE",
                "91",
                "must be a positive integer",
            )?,
            checkpoint_dir: PathBuf::from(checkpoint_dir),
            keep_last_n: parse_var(
                "HIDESEEK_KEEP_LAST_N",
                "5",
                "must be a non-negative integer",
            )?,
            checkpoint_freq: parse_var(
                "HIDESEEK_CHECKPOINT_FREQ",
                "50",
                "must be a non-negative integer",
            )?,
            total_iterations: parse_var(
                "HIDESEEK_TOTAL_ITERATIONS",
                "1000",
                "must be a non-negative integer",
            )?,
            steps_per_iteration: parse_var(
                "HIDESEEK_STEPS_PER_ITERATION",
                "4000",
                "must be a positive integer",
            )?,
            log_frequency: log_frequency.max(1),
        })
    }

    /// `host:port` as configured, before resolution.
    pub fn ws_endpoint(&self) -> String {
        format!("{}:{}", self.ws_host, self.ws_port)
    }

    /// Resolve the listener host; the first address returned is used.
    pub async fn ws_addr(&self) -> Result<SocketAddr, ConfigError> {
        tokio::net::lookup_host((self.ws_host.as_str(), self.ws_port))
            .await
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or(ConfigError::Invalid(
                "HIDESEEK_WS_HOST",
                "does not resolve to an address",
            ))
    }

    pub async fn server_config(&self) -> Result<SimServerConfig, ConfigError> {
        let addr = self.ws_addr().await?;
        Ok(SimServerConfig::new(addr).with_keep_alive(self.ping_interval_ms, self.ping_timeout_ms))
    }

    pub fn episode_config(&self) -> EpisodeConfig {
        EpisodeConfig::new(self.max_steps).with_call_timeout(self.call_timeout)
    }

    pub fn checkpoint_config(&self) -> CheckpointConfig {
        CheckpointConfig::new(&self.checkpoint_dir)
            .with_keep_last_n(self.keep_last_n)
            .with_checkpoint_freq(self.checkpoint_freq)
    }

    pub fn runner_config(&self) -> RunnerConfig {
        RunnerConfig::default()
            .with_total_iterations(self.total_iterations)
            .with_steps_per_iteration(self.steps_per_iteration)
            .with_log_frequency(self.log_frequency)
            .with_observation_size(self.observation_size)
    }
}

fn parse_var<T: FromStr>(
    key: &'static str,
    default: &str,
    reason: &'static str,
) -> Result<T, ConfigError> {
    std::env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .trim()
        .parse()
        .map_err(|_| ConfigError::Invalid(key, reason))
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing or empty.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Mutex to serialize tests that modify environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const ALL_VARS: &[&str] = &[
        "HIDESEEK_WS_HOST",
        "HIDESEEK_WS_PORT",
        "HIDESEEK_CALL_TIMEOUT_MS",
        "HIDESEEK_PING_INTERVAL_MS",
        "HIDESEEK_PING_TIMEOUT_MS",
        "HIDESEEK_MAX_STEPS",
        "HIDESEEK_OBSERVATION_SIZE",
        "HIDESEEK_CHECKPOINT_DIR",
        "HIDESEEK_KEEP_LAST_N",
        "HIDESEEK_CHECKPOINT_FREQ",
        "HIDESEEK_TOTAL_ITERATIONS",
        "HIDESEEK_STEPS_PER_ITERATION",
        "HIDESEEK_LOG_FREQUENCY",
    ];

    /// Helper to set env vars for a test and restore them after
    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        /// Start from a clean slate: every hideseek variable unset.
        fn clean() -> Self {
            let mut guard = Self { vars: Vec::new() };
            for key in ALL_VARS {
                guard.remove(key);
            }
            guard
        }

        fn set(&mut self, key: &str, value: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::set_var(key, value) };
        }

        fn remove(&mut self, key: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::remove_var(key) };
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.vars.drain(..).rev() {
                // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
                unsafe {
                    match value {
                        Some(v) => env::set_var(&key, v),
                        None => env::remove_var(&key),
                    }
                }
            }
        }
    }

    #[test]
    fn test_config_from_env_with_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let _guard = EnvGuard::clean();

        let config = Config::from_env().unwrap();
        let defaults = Config::default();

        assert_eq!(config.ws_host, "127.0.0.1");
        assert_eq!(config.ws_port, 8765);
        assert_eq!(config.ws_host, defaults.ws_host);
        assert_eq!(config.call_timeout, Duration::from_secs(10));
        assert_eq!(config.ping_interval_ms, 20_000);
        assert_eq!(config.ping_timeout_ms, 20_000);
        assert_eq!(config.max_steps, 500);
        assert_eq!(config.observation_size, 91);
        assert_eq!(config.checkpoint_dir, PathBuf::from("./checkpoints"));
        assert_eq!(config.keep_last_n, 5);
        assert_eq!(config.checkpoint_freq, 50);
        assert_eq!(config.total_iterations, 1000);
        assert_eq!(config.steps_per_iteration, 4000);
        assert_eq!(config.log_frequency, 1);
    }

    #[test]
    fn test_config_from_env_all_custom() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();

        guard.set("HIDESEEK_WS_HOST", "0.0.0.0");
        guard.set("HIDESEEK_WS_PORT", "9001");
        guard.set("HIDESEEK_CALL_TIMEOUT_MS", "2500");
        guard.set("HIDESEEK_PING_INTERVAL_MS", "0");
        guard.set("HIDESEEK_MAX_STEPS", "64");
        guard.set("HIDESEEK_CHECKPOINT_DIR", "/tmp/hideseek");
        guard.set("HIDESEEK_KEEP_LAST_N", "0");
        guard.set("HIDESEEK_CHECKPOINT_FREQ", "10");
        guard.set("HIDESEEK_TOTAL_ITERATIONS", "20");
        guard.set("HIDESEEK_STEPS_PER_ITERATION", "128");

        let config = Config::from_env().unwrap();

        assert_eq!(config.ws_endpoint(), "0.0.0.0:9001");
        assert_eq!(config.call_timeout, Duration::from_millis(2500));
        assert_eq!(config.ping_interval_ms, 0);
        assert_eq!(config.max_steps, 64);
        assert_eq!(config.checkpoint_dir, PathBuf::from("/tmp/hideseek"));
        assert_eq!(config.keep_last_n, 0);
        assert_eq!(config.checkpoint_freq, 10);
        assert_eq!(config.total_iterations, 20);
        assert_eq!(config.steps_per_iteration, 128);
    }

    #[test]
    fn test_config_invalid_port() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();

        guard.set("HIDESEEK_WS_PORT", "99999"); // > 65535

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid("HIDESEEK_WS_PORT", _)));
    }

    #[test]
    fn test_config_invalid_host() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();

        guard.set("HIDESEEK_WS_HOST", "not an ip");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid("HIDESEEK_WS_HOST", _)));
    }

    #[test]
    fn test_config_accepts_host_name() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();

        guard.set("HIDESEEK_WS_HOST", "localhost");

        let config = Config::from_env().unwrap();
        assert_eq!(config.ws_host, "localhost");
        assert_eq!(config.ws_endpoint(), "localhost:8765");
    }

    #[tokio::test]
    async fn test_localhost_resolves_to_loopback() {
        let config = Config {
            ws_host: "localhost".to_string(),
            ws_port: 9100,
            ..Config::default()
        };

        let server = config.server_config().await.unwrap();
        assert!(server.bind_addr.ip().is_loopback());
        assert_eq!(server.bind_addr.port(), 9100);
    }

    #[test]
    fn test_config_zero_timeout_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();

        guard.set("HIDESEEK_CALL_TIMEOUT_MS", "0");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid("HIDESEEK_CALL_TIMEOUT_MS", _)
        ));
    }

    #[test]
    fn test_config_zero_max_steps_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();

        guard.set("HIDESEEK_MAX_STEPS", "0");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid("HIDESEEK_MAX_STEPS", _)));
    }

    #[test]
    fn test_config_negative_keep_last_n() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();

        guard.set("HIDESEEK_KEEP_LAST_N", "-1");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid("HIDESEEK_KEEP_LAST_N", _)));
    }

    #[test]
    fn test_config_empty_checkpoint_dir() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();

        guard.set("HIDESEEK_CHECKPOINT_DIR", "  ");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Missing("HIDESEEK_CHECKPOINT_DIR")));
        assert!(err.to_string().contains("HIDESEEK_CHECKPOINT_DIR"));
    }

    #[tokio::test]
    async fn test_component_configs() {
        let config = Config {
            keep_last_n: 2,
            checkpoint_freq: 7,
            max_steps: 33,
            ..Config::default()
        };

        let server = config.server_config().await.unwrap();
        assert_eq!(server.bind_addr, "127.0.0.1:8765".parse().unwrap());
        assert_eq!(server.bind_addr.port(), 8765);
        assert_eq!(server.ping_timeout_ms, 20_000);

        let episode = config.episode_config();
        assert_eq!(episode.max_steps, 33);
        assert_eq!(episode.call_timeout, Duration::from_secs(10));

        let checkpoint = config.checkpoint_config();
        assert_eq!(checkpoint.keep_last_n, 2);
        assert_eq!(checkpoint.checkpoint_freq, 7);

        let runner = config.runner_config();
        assert_eq!(runner.total_iterations, 1000);
        assert_eq!(runner.observation_size, 91);
    }

    #[test]
    fn test_config_error_display() {
        let missing = ConfigError::Missing("MY_VAR");
        assert_eq!(
            missing.to_string(),
            "missing required environment variable: MY_VAR"
        );

        let invalid = ConfigError::Invalid("MY_VAR", "must be a number");
        assert_eq!(
            invalid.to_string(),
            "invalid value for MY_VAR: must be a number"
        );
    }
}
