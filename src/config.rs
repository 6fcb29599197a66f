use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::peer::parse_ipv4;

pub const DEFAULT_DISCOVERY_PORT: u16 = 12345;
pub const DEFAULT_LISTEN_PORT: u16 = 8080;
pub const DEFAULT_FALLBACK_PORT: u16 = 8081;
pub const DEFAULT_DEBOUNCE_MS: u64 = 500;
pub const DEFAULT_WRITE_TIMEOUT_MS: u64 = 5000;
pub const DEFAULT_PROBE_TOKEN: &str = "ESP-ACK";
pub const DEFAULT_CLIENT_URL: &str = "http://127.0.0.1:7938";

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broadcast_ip: Option<String>,
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    #[serde(default = "default_probe_token")]
    pub probe_token: String,
    #[serde(default = "default_noise_tokens")]
    pub noise_tokens: Vec<String>,
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    #[serde(default = "default_fallback_port")]
    pub fallback_port: u16,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    #[serde(default = "default_true")]
    pub stop_on_background: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_token: Option<String>,
    #[serde(skip)]
    pub config_path: Option<PathBuf>,
}

/// Command-line values that win over the config file.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub bind_ip: Option<String>,
    pub broadcast_ip: Option<String>,
    pub client_url: Option<String>,
}

fn default_discovery_port() -> u16 {
    DEFAULT_DISCOVERY_PORT
}

fn default_probe_token() -> String {
    DEFAULT_PROBE_TOKEN.to_string()
}

fn default_noise_tokens() -> Vec<String> {
    vec!["FAKE-DEVICE".to_string()]
}

fn default_listen_port() -> u16 {
    DEFAULT_LISTEN_PORT
}

fn default_fallback_port() -> u16 {
    DEFAULT_FALLBACK_PORT
}

fn default_debounce_ms() -> u64 {
    DEFAULT_DEBOUNCE_MS
}

fn default_write_timeout_ms() -> u64 {
    DEFAULT_WRITE_TIMEOUT_MS
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Defaults for everything but the data directory.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            bind_ip: None,
            broadcast_ip: None,
            discovery_port: DEFAULT_DISCOVERY_PORT,
            probe_token: default_probe_token(),
            noise_tokens: default_noise_tokens(),
            listen_port: DEFAULT_LISTEN_PORT,
            fallback_port: DEFAULT_FALLBACK_PORT,
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            write_timeout_ms: DEFAULT_WRITE_TIMEOUT_MS,
            stop_on_background: true,
            client_url: None,
            client_token: None,
            config_path: None,
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        Self::load_with_overrides(path, ConfigOverrides::default())
    }

    pub fn load_with_overrides(path: &Path, overrides: ConfigOverrides) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let mut cfg: Config = serde_json::from_str(&data).context("parse config json")?;
        cfg.config_path = Some(path.to_path_buf());
        cfg.apply_overrides(overrides);
        cfg.normalize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn save(&self) -> Result<()> {
        let Some(path) = self.config_path.as_ref() else {
            anyhow::bail!("config has no path to save to");
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        let data = serde_json::to_string_pretty(self).context("encode config json")?;
        std::fs::write(path, data).with_context(|| format!("write config {}", path.display()))?;
        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(ip) = overrides.bind_ip.filter(|s| !s.trim().is_empty()) {
            self.bind_ip = Some(ip);
        }
        if let Some(ip) = overrides.broadcast_ip.filter(|s| !s.trim().is_empty()) {
            self.broadcast_ip = Some(ip);
        }
        if let Some(url) = overrides.client_url.filter(|s| !s.trim().is_empty()) {
            self.client_url = Some(url);
        }
    }

    fn normalize(&mut self) -> Result<()> {
        self.bind_ip = self.bind_ip.take().map(|s| s.trim().to_string());
        self.broadcast_ip = self.broadcast_ip.take().map(|s| s.trim().to_string());
        self.noise_tokens.retain(|t| !t.is_empty());
        if self.data_dir.is_relative() {
            if let Ok(abs) = std::fs::canonicalize(&self.data_dir) {
                self.data_dir = abs;
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if let Some(ip) = &self.bind_ip {
            parse_ipv4(ip).context("bind_ip")?;
        }
        if let Some(ip) = &self.broadcast_ip {
            parse_ipv4(ip).context("broadcast_ip")?;
        }
        if let Some(url) = &self.client_url {
            validate_url(url).context("client_url")?;
        }
        if self.probe_token.is_empty() {
            anyhow::bail!("probe_token must not be empty");
        }
        if self.discovery_port == 0 {
            anyhow::bail!("discovery_port must not be 0");
        }
        if self.listen_port == 0 {
            anyhow::bail!("listen_port must not be 0");
        }
        if self.write_timeout_ms == 0 {
            anyhow::bail!("write_timeout_ms must not be 0");
        }
        Ok(())
    }

    pub fn bind_ipv4(&self) -> Option<Ipv4Addr> {
        self.bind_ip.as_deref().and_then(|ip| parse_ipv4(ip).ok())
    }

    pub fn broadcast_ipv4(&self) -> Option<Ipv4Addr> {
        self.broadcast_ip.as_deref().and_then(|ip| parse_ipv4(ip).ok())
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn state_path(&self) -> PathBuf {
        self.data_dir.join(".data").join("state.json")
    }

    pub fn log_path(&self) -> PathBuf {
        if let Some(p) = self.config_path.as_ref().and_then(|p| p.parent()) {
            return p.join("logs").join("espwizard.log");
        }
        self.data_dir.join("logs").join("espwizard.log")
    }
}

fn validate_url(raw: &str) -> Result<()> {
    let url = Url::parse(raw)?;
    if url.scheme() != "http" && url.scheme() != "https" {
        anyhow::bail!("url must be http or https");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{env, fs};

    fn write_cfg(dir: &str, json: &str) -> PathBuf {
        let tmp = env::temp_dir().join(dir);
        let _ = fs::remove_dir_all(&tmp);
        fs::create_dir_all(&tmp).unwrap();
        let cfg_path = tmp.join("config.json");
        fs::write(&cfg_path, json).unwrap();
        cfg_path
    }

    #[test]
    fn load_config_applies_defaults() {
        let tmp = env::temp_dir().join("espwizard-rs-config-test");
        let _ = fs::remove_dir_all(&tmp);
        fs::create_dir_all(&tmp).unwrap();
        let cfg_path = tmp.join("config.json");
        let data_dir = tmp.join("data");
        let json = format!(
            r#"{{
                "data_dir": "{}",
                "bind_ip": " 192.168.1.20 ",
                "client_url": "http://127.0.0.1:7938"
            }}"#,
            data_dir.display().to_string().replace('\\', "/")
        );
        fs::write(&cfg_path, json).unwrap();

        let cfg = Config::load(&cfg_path).unwrap();
        assert_eq!(cfg.bind_ip.as_deref(), Some("192.168.1.20"));
        assert_eq!(cfg.bind_ipv4(), Some(Ipv4Addr::new(192, 168, 1, 20)));
        assert_eq!(cfg.discovery_port, 12345);
        assert_eq!(cfg.listen_port, 8080);
        assert_eq!(cfg.fallback_port, 8081);
        assert_eq!(cfg.probe_token, "ESP-ACK");
        assert_eq!(cfg.noise_tokens, vec!["FAKE-DEVICE".to_string()]);
        assert_eq!(cfg.debounce(), Duration::from_millis(500));
        assert_eq!(cfg.write_timeout(), Duration::from_secs(5));
        assert!(cfg.stop_on_background);
        assert_eq!(cfg.config_path.as_ref().unwrap(), &cfg_path);
    }

    #[test]
    fn overrides_win_over_file() {
        let cfg_path = write_cfg(
            "espwizard-rs-config-test-overrides",
            r#"{ "data_dir": "/tmp/esp", "bind_ip": "10.0.0.2" }"#,
        );
        let cfg = Config::load_with_overrides(
            &cfg_path,
            ConfigOverrides {
                bind_ip: Some("10.0.0.9".into()),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(cfg.bind_ip.as_deref(), Some("10.0.0.9"));
    }

    #[test]
    fn reject_invalid_bind_ip() {
        let cfg_path = write_cfg(
            "espwizard-rs-config-test-bad-ip",
            r#"{ "data_dir": "/tmp/esp", "bind_ip": "esp.local" }"#,
        );
        let err = Config::load(&cfg_path).unwrap_err();
        assert!(format!("{err:#}").contains("bind_ip"));
    }

    #[test]
    fn reject_invalid_url_scheme() {
        let cfg_path = write_cfg(
            "espwizard-rs-config-test-bad-url",
            r#"{ "data_dir": "/tmp/esp", "client_url": "ftp://127.0.0.1:7938" }"#,
        );
        let err = Config::load(&cfg_path).unwrap_err();
        assert!(err.to_string().contains("client_url"));
    }

    #[test]
    fn save_round_trips_through_load() {
        let cfg_path = write_cfg(
            "espwizard-rs-config-test-save",
            r#"{ "data_dir": "/tmp/esp" }"#,
        );
        let mut cfg = Config::load(&cfg_path).unwrap();
        cfg.client_token = Some("tok".into());
        cfg.save().unwrap();
        let again = Config::load(&cfg_path).unwrap();
        assert_eq!(again.client_token.as_deref(), Some("tok"));
    }
}
