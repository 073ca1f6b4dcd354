//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! Tokens never live in the TOML: they are read from the session file named
//! by `agent.credentials_path`.

use pipeline::{EndpointPolicy, PipelineConfig};
use realtime::ReconnectPolicy;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub api: ApiConfig,
    pub realtime: RealtimeConfig,
    pub agent: AgentConfig,
}

/// Marketplace REST API settings
#[derive(Debug, Deserialize)]
pub struct ApiConfig {
    pub base_url: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_timeout")]
    pub refresh_timeout_secs: u64,
    #[serde(default = "default_refresh_path")]
    pub refresh_path: String,
    /// Extra paths that never trigger a refresh on 401
    #[serde(default)]
    pub public_paths: Vec<String>,
}

/// Realtime broker settings
#[derive(Debug, Deserialize)]
pub struct RealtimeConfig {
    pub url: String,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_timeout")]
    pub handshake_timeout_secs: u64,
}

/// Local process settings
#[derive(Debug, Deserialize)]
pub struct AgentConfig {
    pub listen_addr: SocketAddr,
    pub credentials_path: PathBuf,
    /// Subscribe to this user's notification queue when set
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Authenticated GET run at start-up and before any CONNECT whose token
    /// is about to expire; a 401 there refreshes the session
    #[serde(default = "default_session_check_path")]
    pub session_check_path: String,
}

fn default_timeout() -> u64 {
    10
}

fn default_refresh_path() -> String {
    session::REFRESH_PATH.to_string()
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_max_connections() -> usize {
    64
}

fn default_session_check_path() -> String {
    "/users/me".to_string()
}

impl Config {
    /// Load configuration from a TOML file, overlay environment variables,
    /// then validate.
    ///
    /// `API_BASE_URL` and `REALTIME_URL` replace the file values when set.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        if let Ok(url) = std::env::var("API_BASE_URL") {
            config.api.base_url = url;
        }
        if let Ok(url) = std::env::var("REALTIME_URL") {
            config.realtime.url = url;
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        if !self.api.base_url.starts_with("http://") && !self.api.base_url.starts_with("https://")
        {
            return Err(common::Error::InvalidUrl {
                field: "api.base_url",
                value: self.api.base_url.clone(),
            });
        }

        if !self.realtime.url.starts_with("ws://") && !self.realtime.url.starts_with("wss://") {
            return Err(common::Error::InvalidUrl {
                field: "realtime.url",
                value: self.realtime.url.clone(),
            });
        }

        if !self.api.refresh_path.starts_with('/') {
            return Err(common::Error::Config(format!(
                "refresh_path must start with /, got: {}",
                self.api.refresh_path
            )));
        }

        for (name, value) in [
            ("timeout_secs", self.api.timeout_secs),
            ("refresh_timeout_secs", self.api.refresh_timeout_secs),
            ("handshake_timeout_secs", self.realtime.handshake_timeout_secs),
            ("base_delay_ms", self.realtime.base_delay_ms),
        ] {
            if value == 0 {
                return Err(common::Error::Config(format!(
                    "{name} must be greater than 0"
                )));
            }
        }

        if self.realtime.max_attempts == 0 {
            return Err(common::Error::Config(
                "max_attempts must be greater than 0".into(),
            ));
        }

        if self.realtime.max_delay_ms < self.realtime.base_delay_ms {
            return Err(common::Error::Config(format!(
                "max_delay_ms ({}) must not be below base_delay_ms ({})",
                self.realtime.max_delay_ms, self.realtime.base_delay_ms
            )));
        }

        let policy = EndpointPolicy::new(&self.api.refresh_path, &self.api.public_paths);
        if !self.agent.session_check_path.starts_with('/')
            || !policy.may_refresh(&self.agent.session_check_path)
        {
            return Err(common::Error::Config(format!(
                "session_check_path must be a refreshable API path, got: {}",
                self.agent.session_check_path
            )));
        }

        if self.agent.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            base_url: self.api.base_url.clone(),
            timeout: Duration::from_secs(self.api.timeout_secs),
            refresh_timeout: Duration::from_secs(self.api.refresh_timeout_secs),
            refresh_path: self.api.refresh_path.clone(),
            public_paths: self.api.public_paths.clone(),
        }
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: self.realtime.max_attempts,
            base_delay: Duration::from_millis(self.realtime.base_delay_ms),
            max_delay: Duration::from_millis(self.realtime.max_delay_ms),
        }
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.realtime.handshake_timeout_secs)
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("realtime-agent.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Serializes tests that touch process environment variables.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// SAFETY: Callers must hold ENV_MUTEX to prevent concurrent env mutation.
    unsafe fn set_env(key: &str, val: &str) {
        unsafe { std::env::set_var(key, val) };
    }

    unsafe fn remove_env(key: &str) {
        unsafe { std::env::remove_var(key) };
    }

    fn clear_overlays() {
        unsafe {
            remove_env("API_BASE_URL");
            remove_env("REALTIME_URL");
        }
    }

    fn valid_toml() -> &'static str {
        r#"
[api]
base_url = "https://api.example.com"

[realtime]
url = "wss://api.example.com/ws"

[agent]
listen_addr = "127.0.0.1:9090"
credentials_path = "/var/lib/realtime-agent/session.json"
user_id = "42"
"#
    }

    fn write_config(contents: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, contents).unwrap();
        (dir, path)
    }

    #[test]
    fn test_load_valid_config_with_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_overlays();
        let (_dir, path) = write_config(valid_toml());

        let config = Config::load(&path).unwrap();
        assert_eq!(config.api.base_url, "https://api.example.com");
        assert_eq!(config.api.timeout_secs, 10);
        assert_eq!(config.api.refresh_path, "/auth/refresh");
        assert!(config.api.public_paths.is_empty());
        assert_eq!(config.realtime.max_attempts, 5);
        assert_eq!(config.agent.user_id.as_deref(), Some("42"));
        assert_eq!(config.agent.max_connections, 64);
        assert_eq!(config.agent.session_check_path, "/users/me");

        let policy = config.reconnect_policy();
        assert_eq!(policy.base_delay, Duration::from_secs(1));
        assert_eq!(policy.max_delay, Duration::from_secs(30));
        assert_eq!(config.pipeline_config().timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_load_missing_file() {
        let result = Config::load(Path::new("/nonexistent/path/config.toml"));
        assert!(matches!(result, Err(common::Error::Io(_))));
    }

    #[test]
    fn test_load_invalid_toml() {
        let (_dir, path) = write_config("not valid {{{{ toml");
        let result = Config::load(&path);
        assert!(matches!(result, Err(common::Error::Toml(_))));
    }

    #[test]
    fn test_rejects_non_http_base_url() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_overlays();
        let (_dir, path) = write_config(
            &valid_toml().replace("https://api.example.com\"", "ftp://api.example.com\""),
        );

        match Config::load(&path) {
            Err(common::Error::InvalidUrl { field, .. }) => assert_eq!(field, "api.base_url"),
            other => panic!("expected InvalidUrl, got {other:?}"),
        }
    }

    #[test]
    fn test_rejects_non_ws_realtime_url() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_overlays();
        let (_dir, path) = write_config(
            &valid_toml().replace("wss://api.example.com/ws", "https://api.example.com/ws"),
        );

        match Config::load(&path) {
            Err(common::Error::InvalidUrl { field, .. }) => assert_eq!(field, "realtime.url"),
            other => panic!("expected InvalidUrl, got {other:?}"),
        }
    }

    #[test]
    fn test_rejects_zero_values() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_overlays();
        for (section, line) in [
            ("[api]", "timeout_secs = 0"),
            ("[realtime]", "max_attempts = 0"),
            ("[realtime]", "base_delay_ms = 0"),
            ("[agent]", "max_connections = 0"),
        ] {
            let toml = valid_toml().replace(section, &format!("{section}\n{line}"));
            let (_dir, path) = write_config(&toml);
            let err = Config::load(&path).unwrap_err();
            assert!(
                matches!(err, common::Error::Config(ref msg) if msg.contains("greater than 0")),
                "{line}: got {err}"
            );
        }
    }

    #[test]
    fn test_rejects_session_check_that_cannot_refresh() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_overlays();
        for path in ["/auth/validate", "/auth/refresh", "users/me"] {
            let toml = valid_toml().replace(
                "[agent]",
                &format!("[agent]\nsession_check_path = \"{path}\""),
            );
            let (_dir, path_buf) = write_config(&toml);
            let err = Config::load(&path_buf).unwrap_err();
            assert!(err.to_string().contains("session_check_path"), "{path}: got {err}");
        }
    }

    #[test]
    fn test_rejects_max_delay_below_base() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_overlays();
        let toml = valid_toml().replace(
            "[realtime]",
            "[realtime]\nbase_delay_ms = 5000\nmax_delay_ms = 1000",
        );
        let (_dir, path) = write_config(&toml);
        let err = Config::load(&path).unwrap_err();
        assert!(err.to_string().contains("max_delay_ms"), "got {err}");
    }

    #[test]
    fn test_env_overlays_urls() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let (_dir, path) = write_config(valid_toml());

        unsafe {
            set_env("API_BASE_URL", "http://127.0.0.1:8080");
            set_env("REALTIME_URL", "ws://127.0.0.1:8080/ws");
        }
        let config = Config::load(&path);
        clear_overlays();

        let config = config.unwrap();
        assert_eq!(config.api.base_url, "http://127.0.0.1:8080");
        assert_eq!(config.realtime.url, "ws://127.0.0.1:8080/ws");
    }

    #[test]
    fn test_env_overlay_is_validated() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let (_dir, path) = write_config(valid_toml());

        unsafe { set_env("REALTIME_URL", "not-a-url") };
        let result = Config::load(&path);
        clear_overlays();

        assert!(matches!(result, Err(common::Error::InvalidUrl { .. })));
    }

    #[test]
    fn test_resolve_path_precedence() {
        let _lock = ENV_MUTEX.lock().unwrap();

        unsafe { set_env("CONFIG_PATH", "/etc/agent/from-env.toml") };
        assert_eq!(
            Config::resolve_path(Some("/tmp/cli.toml")),
            PathBuf::from("/tmp/cli.toml")
        );
        assert_eq!(
            Config::resolve_path(None),
            PathBuf::from("/etc/agent/from-env.toml")
        );

        unsafe { remove_env("CONFIG_PATH") };
        assert_eq!(
            Config::resolve_path(None),
            PathBuf::from("realtime-agent.toml")
        );
    }
}
