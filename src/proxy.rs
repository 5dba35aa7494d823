//! Serialized acquisition of upstream proxy credentials
//!
//! One acquire at a time process-wide, so a fleet of workers coming up
//! together doesn't stampede the proxy API. Retries are bounded with
//! jittered exponential backoff; when attempts run out the error
//! surfaces and the worker exits. The HTTP client is built once and
//! reused across every attempt.

use anyhow::{Context, Result, anyhow};
use log::{debug, warn};
use rand::Rng;
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::utils::constants::PROXY_BACKOFF_BASE_MS;

/// Credentials returned by the acquisition API.
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

impl ProxyConfig {
    /// Value for Chromium's `--proxy-server` switch (credentials are
    /// supplied separately through the Fetch auth handler).
    #[must_use]
    pub fn server_arg(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

/// Process-wide proxy acquisition handle.
pub struct ProxyManager {
    client: reqwest::Client,
    api_url: String,
    token: String,
    max_attempts: u32,
    backoff_base: Duration,
    acquire_lock: Mutex<()>,
}

impl ProxyManager {
    pub fn new(api_url: impl Into<String>, token: impl Into<String>, max_attempts: u32) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(20))
            .build()
            .context("building proxy acquisition client")?;
        Ok(Self {
            client,
            api_url: api_url.into(),
            token: token.into(),
            max_attempts,
            backoff_base: Duration::from_millis(PROXY_BACKOFF_BASE_MS),
            acquire_lock: Mutex::new(()),
        })
    }

    /// Override the backoff base (tests use a short one).
    #[must_use]
    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    /// Acquire one proxy, serialized across the process.
    ///
    /// # Errors
    ///
    /// Fails after `max_attempts` transient responses (401/429/5xx or
    /// transport errors), or immediately on any other non-200 status.
    pub async fn acquire(&self) -> Result<ProxyConfig> {
        let _serialized = self.acquire_lock.lock().await;

        let url = format!("{}/acquire", self.api_url.trim_end_matches('/'));
        let mut last_error = None;

        for attempt in 0..self.max_attempts {
            if attempt > 0 {
                let backoff = self.backoff_base * 2u32.saturating_pow(attempt - 1);
                let jitter = Duration::from_millis(rand::rng().random_range(0..250));
                debug!("proxy acquire backoff {:?} (attempt {})", backoff + jitter, attempt + 1);
                tokio::time::sleep(backoff + jitter).await;
            }

            let response = match self
                .client
                .get(&url)
                .bearer_auth(&self.token)
                .send()
                .await
            {
                Ok(response) => response,
                Err(e) => {
                    warn!("proxy acquire transport error (attempt {}): {e}", attempt + 1);
                    last_error = Some(anyhow!(e).context("proxy acquisition transport"));
                    continue;
                }
            };

            let status = response.status();
            if status.is_success() {
                let proxy: ProxyConfig = response
                    .json()
                    .await
                    .context("parsing proxy acquisition response")?;
                debug!("acquired proxy {}:{}", proxy.host, proxy.port);
                return Ok(proxy);
            }

            let retryable = status.as_u16() == 401
                || status.as_u16() == 429
                || status.is_server_error();
            if !retryable {
                return Err(anyhow!("proxy API rejected acquisition: HTTP {status}"));
            }
            warn!("proxy acquire got HTTP {status} (attempt {})", attempt + 1);
            last_error = Some(anyhow!("proxy API returned HTTP {status}"));
        }

        Err(last_error
            .unwrap_or_else(|| anyhow!("proxy acquisition failed"))
            .context(format!(
                "proxy acquisition exhausted {} attempts",
                self.max_attempts
            )))
    }
}
