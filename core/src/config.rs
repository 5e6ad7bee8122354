/// Configuration management
use crate::error::{Result, SyncError};
use crate::types::UserId;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

const DEFAULT_BACKEND_URL: &str = "http://127.0.0.1:8080";

/// Sync core configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Base URL of the REST backend
    pub backend_url: String,

    /// WebSocket URL of the push channel (push disabled when absent)
    pub push_url: Option<String>,

    /// Bearer token sent to the backend and the push channel
    pub auth_token: Option<String>,

    /// Current user, needed for push subscriptions and mark-all-read
    pub user_id: Option<UserId>,

    /// Base interval between polls
    pub poll_interval: Duration,

    /// Consecutive failures tolerated before a cooldown beat
    pub max_retries: u32,

    /// Multiplier applied to the interval after each failure
    pub backoff_factor: f64,

    /// Timeout for one backend fetch
    pub fetch_timeout: Duration,

    /// Window after stop-all during which new sessions are refused
    pub shutdown_cooldown: Duration,

    /// Delay before the push channel reconnects
    pub push_reconnect_delay: Duration,

    /// Delay between a successful send and the reconciling poll
    pub reconcile_delay: Duration,

    /// Page size requested from the backend
    pub page_size: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend_url: DEFAULT_BACKEND_URL.to_string(),
            push_url: None,
            auth_token: None,
            user_id: None,
            poll_interval: Duration::from_secs(5),
            max_retries: 3,
            backoff_factor: 1.5,
            fetch_timeout: Duration::from_secs(15),
            shutdown_cooldown: Duration::from_secs(1),
            push_reconnect_delay: Duration::from_secs(5),
            reconcile_delay: Duration::from_millis(500),
            page_size: 100,
        }
    }
}

impl Config {
    /// Create config from command line arguments.
    ///
    /// Positional arguments that are not flags are returned untouched so the
    /// binaries can interpret them as commands.
    pub fn from_args(args: &[String]) -> Result<(Self, Vec<String>)> {
        if args.len() < 2 {
            return Err(SyncError::Config(format!(
                "Usage: {} <backend_url> [--push-url <url>] [--token <token>] [--user <id>] [--interval <secs>] [--page-size <n>] [args...]",
                args.first().map(String::as_str).unwrap_or("chatsync")
            )));
        }

        let mut config = Config {
            backend_url: args[1].clone(),
            ..Default::default()
        };
        let mut rest = Vec::new();

        let mut i = 2;
        while i < args.len() {
            match args[i].as_str() {
                "--push-url" => {
                    config.push_url = Some(flag_value(args, i, "--push-url")?.to_string());
                    i += 2;
                }
                "--token" => {
                    config.auth_token = Some(flag_value(args, i, "--token")?.to_string());
                    i += 2;
                }
                "--user" => {
                    let v = flag_value(args, i, "--user")?;
                    config.user_id = Some(v.parse::<UserId>().map_err(|_| {
                        SyncError::Config("--user must be a numeric user id".to_string())
                    })?);
                    i += 2;
                }
                "--interval" => {
                    let v = flag_value(args, i, "--interval")?;
                    let secs = v.parse::<f64>().map_err(|_| {
                        SyncError::Config("--interval must be a number of seconds".to_string())
                    })?;
                    if !secs.is_finite() || secs <= 0.0 {
                        return Err(SyncError::Config(
                            "--interval must be positive".to_string(),
                        ));
                    }
                    config.poll_interval = Duration::from_secs_f64(secs);
                    i += 2;
                }
                "--page-size" => {
                    let v = flag_value(args, i, "--page-size")?;
                    config.page_size = v.parse::<u32>().map_err(|_| {
                        SyncError::Config("--page-size must be a valid number".to_string())
                    })?;
                    i += 2;
                }
                other => {
                    rest.push(other.to_string());
                    i += 1;
                }
            }
        }

        config.apply_env();
        config.validate()?;
        Ok((config, rest))
    }

    /// Env overrides (nice for scripts)
    pub fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("CHATSYNC_BACKEND_URL") {
            self.backend_url = url;
        }
        if let Ok(url) = std::env::var("CHATSYNC_PUSH_URL") {
            self.push_url = Some(url);
        }
        if let Ok(token) = std::env::var("CHATSYNC_TOKEN") {
            self.auth_token = Some(token);
        }
        if let Some(id) = std::env::var("CHATSYNC_USER_ID")
            .ok()
            .and_then(|s| s.parse::<UserId>().ok())
        {
            self.user_id = Some(id);
        }
    }

    /// Reject settings that would busy-loop or can never connect
    pub fn validate(&self) -> Result<()> {
        Url::parse(&self.backend_url)
            .map_err(|e| SyncError::Config(format!("Invalid backend URL: {}", e)))?;
        if let Some(push) = &self.push_url {
            let url = Url::parse(push)
                .map_err(|e| SyncError::Config(format!("Invalid push URL: {}", e)))?;
            if url.scheme() != "ws" && url.scheme() != "wss" {
                return Err(SyncError::Config(format!(
                    "Push URL must use ws:// or wss://, got {}",
                    url.scheme()
                )));
            }
        }
        if self.poll_interval.is_zero() {
            return Err(SyncError::Config("Poll interval must be non-zero".to_string()));
        }
        if !(self.backoff_factor >= 1.0) {
            return Err(SyncError::Config(
                "Backoff factor must be at least 1.0".to_string(),
            ));
        }
        if self.fetch_timeout.is_zero() {
            return Err(SyncError::Config("Fetch timeout must be non-zero".to_string()));
        }
        if self.page_size == 0 {
            return Err(SyncError::Config("Page size must be non-zero".to_string()));
        }
        Ok(())
    }
}

fn flag_value<'a>(args: &'a [String], i: usize, flag: &str) -> Result<&'a str> {
    args.get(i + 1)
        .map(String::as_str)
        .ok_or_else(|| SyncError::Config(format!("{} requires an argument", flag)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_defaults_match_reference_constants() {
        let config = Config::default();
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.backoff_factor, 1.5);
        assert_eq!(config.fetch_timeout, Duration::from_secs(15));
        assert_eq!(config.shutdown_cooldown, Duration::from_secs(1));
        assert_eq!(config.push_reconnect_delay, Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_args_flags_and_positionals() {
        let (config, rest) = Config::from_args(&args(&[
            "core",
            "http://localhost:9000",
            "--push-url",
            "ws://localhost:9000/ws",
            "--user",
            "7",
            "--interval",
            "2.5",
            "conv-1",
        ]))
        .unwrap();

        assert_eq!(config.backend_url, "http://localhost:9000");
        assert_eq!(config.push_url.as_deref(), Some("ws://localhost:9000/ws"));
        assert_eq!(config.user_id, Some(7));
        assert_eq!(config.poll_interval, Duration::from_millis(2500));
        assert_eq!(rest, vec!["conv-1".to_string()]);
    }

    #[test]
    fn test_from_args_rejects_bad_values() {
        assert!(Config::from_args(&args(&["core"])).is_err());
        assert!(Config::from_args(&args(&["core", "http://x", "--user", "abc"])).is_err());
        assert!(Config::from_args(&args(&["core", "http://x", "--interval", "0"])).is_err());
        assert!(Config::from_args(&args(&["core", "http://x", "--token"])).is_err());
    }

    #[test]
    fn test_validate_push_scheme() {
        let config = Config {
            push_url: Some("http://localhost/ws".to_string()),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(SyncError::Config(_))));
    }
}
