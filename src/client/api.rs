use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use tracing::debug;
use url::Url;

use crate::config::{AgentConfig, API_KEY_HEADER};

/// Plain HTTP client for the management API, used by `--ping` and
/// `--status`.
pub struct ApiClient {
    http: reqwest::Client,
    base: Url,
    api_key: String,
}

impl ApiClient {
    pub fn new(cfg: &AgentConfig, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building HTTP client")?;

        Ok(Self {
            http,
            base: cfg.api_url()?,
            api_key: cfg.api_key.clone(),
        })
    }

    fn url(&self, path: &str) -> Result<Url> {
        self.base
            .join(path)
            .with_context(|| format!("building URL for {path}"))
    }

    /// Round trip to the API; returns the latency.
    pub async fn ping(&self) -> Result<Duration> {
        let url = self.url("ping")?;
        let start = Instant::now();

        let resp = self
            .http
            .get(url.clone())
            .header(API_KEY_HEADER, &self.api_key)
            .send()
            .await
            .with_context(|| format!("GET {url}"))?;

        let status = resp.status();
        if !status.is_success() {
            bail!("GET {url} returned {status}");
        }

        let elapsed = start.elapsed();
        debug!(url = %url, ?elapsed, "ping ok");
        Ok(elapsed)
    }

    /// Agent status as last reported to the API.
    pub async fn agent_status(&self, agent_uuid: &str) -> Result<serde_json::Value> {
        let url = self.url(&format!("agents/{agent_uuid}/status"))?;

        let resp = self
            .http
            .get(url.clone())
            .header(API_KEY_HEADER, &self.api_key)
            .send()
            .await
            .with_context(|| format!("GET {url}"))?;

        let status = resp.status();
        if !status.is_success() {
            bail!("GET {url} returned {status}");
        }

        resp.json().await.with_context(|| format!("decoding {url}"))
    }
}
