//! Configuration types and loading

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use common::Secret;
use serde::Deserialize;

/// Root configuration.
#[derive(Debug, Deserialize)]
pub struct Config {
    pub proxy: ProxyConfig,
}

/// HTTP proxy and pool settings.
#[derive(Debug, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
    pub upstream_url: String,
    /// Inbound API key. Empty/absent disables authentication.
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub enable_logging: bool,
    #[serde(default = "default_max_logs")]
    pub max_logs: usize,
    /// Directory containing `.codex/`, owned by the Token Store.
    pub home: PathBuf,
    #[serde(default = "default_refresh_skew_secs")]
    pub refresh_skew_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_refresh_timeout_secs")]
    pub refresh_timeout_secs: u64,
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,
}

impl ProxyConfig {
    pub fn api_key_secret(&self) -> Option<Secret<String>> {
        self.api_key
            .as_ref()
            .filter(|k| !k.is_empty())
            .map(|k| Secret::new(k.clone()))
    }

    pub fn refresh_skew(&self) -> Duration {
        Duration::from_secs(self.refresh_skew_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn refresh_timeout(&self) -> Duration {
        Duration::from_secs(self.refresh_timeout_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

fn default_listen_addr() -> SocketAddr {
    "127.0.0.1:8080".parse().unwrap()
}

fn default_max_logs() -> usize {
    1000
}

fn default_refresh_skew_secs() -> u64 {
    60
}

fn default_request_timeout_secs() -> u64 {
    600
}

fn default_refresh_timeout_secs() -> u64 {
    30
}

fn default_drain_timeout_secs() -> u64 {
    5
}

impl Config {
    /// Resolve the config file path: explicit `--config` flag wins, then
    /// `CODEX_POOL_CONFIG`, then `./config.toml`.
    pub fn resolve_path(cli_arg: Option<&str>) -> PathBuf {
        if let Some(path) = cli_arg {
            return PathBuf::from(path);
        }
        if let Ok(path) = std::env::var("CODEX_POOL_CONFIG") {
            return PathBuf::from(path);
        }
        PathBuf::from("config.toml")
    }

    /// Load configuration from a TOML file. `CODEX_POOL_HOME`, when set,
    /// overrides the `proxy.home` value read from the file.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)
            .map_err(|e| common::Error::Config(format!("parsing {}: {e}", path.display())))?;

        if let Ok(home) = std::env::var("CODEX_POOL_HOME") {
            config.proxy.home = PathBuf::from(home);
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_minimal_config_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
            [proxy]
            upstream_url = "https://api.example.com"
            home = "/tmp/codex-home"
            "#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.proxy.listen_addr, default_listen_addr());
        assert_eq!(config.proxy.max_logs, 1000);
        assert!(!config.proxy.enable_logging);
        assert_eq!(config.proxy.refresh_skew_secs, 60);
    }

    #[test]
    fn codex_pool_home_env_overrides_file_value() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
            [proxy]
            upstream_url = "https://api.example.com"
            home = "/from/file"
            "#,
        )
        .unwrap();

        unsafe {
            std::env::set_var("CODEX_POOL_HOME", "/from/env");
        }
        let config = Config::load(&path).unwrap();
        unsafe {
            std::env::remove_var("CODEX_POOL_HOME");
        }
        assert_eq!(config.proxy.home, PathBuf::from("/from/env"));
    }

    #[test]
    fn empty_api_key_disables_authentication() {
        let proxy = ProxyConfig {
            listen_addr: default_listen_addr(),
            upstream_url: "https://api.example.com".into(),
            api_key: Some(String::new()),
            enable_logging: false,
            max_logs: 10,
            home: PathBuf::from("/tmp"),
            refresh_skew_secs: 60,
            request_timeout_secs: 600,
            refresh_timeout_secs: 30,
            drain_timeout_secs: 5,
        };
        assert!(proxy.api_key_secret().is_none());
    }

    #[test]
    fn resolve_path_prefers_cli_arg_over_env() {
        unsafe {
            std::env::set_var("CODEX_POOL_CONFIG", "/from/env.toml");
        }
        let path = Config::resolve_path(Some("/from/cli.toml"));
        unsafe {
            std::env::remove_var("CODEX_POOL_CONFIG");
        }
        assert_eq!(path, PathBuf::from("/from/cli.toml"));
    }
}
