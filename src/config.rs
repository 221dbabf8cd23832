use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::proto::Level;

/// Header carrying the API key on every request and websocket upgrade.
pub const API_KEY_HEADER: &str = "x-percona-api-key";

/// Agent configuration, persisted as `config/agent.conf`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// UUID assigned to this agent by the management service.
    pub agent_uuid: String,

    /// API host, optionally with scheme (`https://` is assumed).
    pub api_hostname: String,

    /// API key sent with every request.
    pub api_key: String,

    /// PID file, relative to the basedir unless absolute.
    #[serde(default = "default_pid_file")]
    pub pid_file: String,

    /// Listen address of the self-metrics server, empty to disable.
    #[serde(default)]
    pub health_addr: String,

    /// How often the control link is pinged while idle. Default: 76s.
    #[serde(default = "default_keepalive", with = "humantime_serde")]
    pub keepalive: Duration,

    /// Explicit link URLs (`cmd`, `log`, `data`) overriding the derived ones.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub links: HashMap<String, String>,
}

/// Log relay configuration, persisted as `config/log.conf`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogConfig {
    /// Minimum level forwarded and written. Default: info.
    #[serde(default = "default_log_level")]
    pub level: Level,

    /// Optional local log file. Empty disables file output.
    #[serde(default)]
    pub file: String,

    /// Keep everything local; nothing is sent to the remote log link.
    #[serde(default)]
    pub offline: bool,
}

/// Data spool and shipper configuration, persisted as `config/data.conf`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataConfig {
    /// Spool entry encoding: "gzip" or "" for plain JSON. Default: gzip.
    #[serde(default = "default_encoding")]
    pub encoding: String,

    /// How often the shipper drains the spool. Default: 63s.
    #[serde(default = "default_send_interval", with = "humantime_serde")]
    pub send_interval: Duration,

    /// Window of the sent-report statistics. Default: 1h.
    #[serde(default = "default_stats_window", with = "humantime_serde")]
    pub stats_window: Duration,

    /// If set, shipped entries are appended to this file instead of being
    /// posted to the API.
    #[serde(default)]
    pub blackhole: String,
}

fn default_pid_file() -> String {
    crate::basedir::DEFAULT_PID_FILE.to_string()
}

fn default_keepalive() -> Duration {
    Duration::from_secs(76)
}

fn default_log_level() -> Level {
    Level::Info
}

fn default_encoding() -> String {
    "gzip".to_string()
}

fn default_send_interval() -> Duration {
    Duration::from_secs(63)
}

fn default_stats_window() -> Duration {
    Duration::from_secs(3600)
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: String::new(),
            offline: false,
        }
    }
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            encoding: default_encoding(),
            send_interval: default_send_interval(),
            stats_window: default_stats_window(),
            blackhole: String::new(),
        }
    }
}

impl AgentConfig {
    /// Load and validate `agent.conf`.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Self = serde_json::from_slice(&raw)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.agent_uuid.is_empty() {
            bail!("agent_uuid is required");
        }

        if self.api_hostname.is_empty() {
            bail!("api_hostname is required");
        }

        if self.api_key.is_empty() {
            bail!("api_key is required");
        }

        if self.keepalive.is_zero() {
            bail!("keepalive must be positive");
        }

        for (name, link) in &self.links {
            Url::parse(link).with_context(|| format!("invalid {name} link: {link}"))?;
        }

        Ok(())
    }

    /// Base URL of the API (`https://host`).
    pub fn api_url(&self) -> Result<Url> {
        let raw = if self.api_hostname.contains("://") {
            self.api_hostname.clone()
        } else {
            format!("https://{}", self.api_hostname)
        };

        Url::parse(&raw).with_context(|| format!("invalid api_hostname: {}", self.api_hostname))
    }

    /// URL of an agent link: `cmd` and `log` are websockets, `data` is HTTP.
    pub fn link(&self, name: &str) -> Result<Url> {
        if let Some(link) = self.links.get(name) {
            return Url::parse(link).with_context(|| format!("invalid {name} link: {link}"));
        }

        let mut url = self
            .api_url()?
            .join(&format!("agents/{}/{}", self.agent_uuid, name))
            .with_context(|| format!("building {name} link"))?;

        if name != "data" {
            let scheme = if url.scheme() == "http" { "ws" } else { "wss" };
            if url.set_scheme(scheme).is_err() {
                bail!("cannot use scheme {scheme} for {url}");
            }
        }

        Ok(url)
    }
}

impl DataConfig {
    pub fn validate(&self) -> Result<()> {
        match self.encoding.as_str() {
            "" | "gzip" => {}
            other => bail!("invalid data encoding: {other}"),
        }

        if self.send_interval.is_zero() {
            bail!("send_interval must be positive");
        }

        if self.stats_window.is_zero() {
            bail!("stats_window must be positive");
        }

        Ok(())
    }

    pub fn gzip(&self) -> bool {
        self.encoding == "gzip"
    }
}
