//! Cookie-authenticated Ops API client

use crate::models::{
    is_already_exists, Alert, GeneratedFile, MonitorRef, MonitoringSnapshot, Package,
    ServerUpdateStatus,
};
use anyhow::{bail, Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

/// Configuration for the Ops client
#[derive(Debug, Clone, Deserialize)]
pub struct OpsConfig {
    /// Base URL, e.g. "https://ops.cdn.example"
    pub url: String,
    pub user: String,
    pub password: String,
    /// API version segment, e.g. "4.0"
    #[serde(default = "default_api_version")]
    pub api_version: String,
    /// Per-request timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Initial backoff for login retries
    #[serde(default = "default_initial_backoff_secs")]
    pub initial_backoff_secs: u64,
    /// Backoff cap for login retries
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,
}

fn default_api_version() -> String {
    "4.0".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_initial_backoff_secs() -> u64 {
    1
}

fn default_max_backoff_secs() -> u64 {
    300
}

/// Every Ops response wraps its payload in this envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub response: T,
    #[serde(default)]
    pub alerts: Vec<Alert>,
}

/// Alerts-only envelope, for endpoints whose payload we discard.
#[derive(Debug, Clone, Default, Deserialize)]
struct AlertsOnly {
    #[serde(default)]
    alerts: Vec<Alert>,
}

/// Result of a create call against Ops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    /// Ops reported the entity already exists; treated as success-with-skip.
    AlreadyExists,
}

/// Shared Ops session. Clone freely; all clones share one cookie jar.
#[derive(Clone)]
pub struct OpsClient {
    inner: Arc<Inner>,
}

struct Inner {
    http: reqwest::Client,
    base: Url,
    cfg: OpsConfig,
}

impl OpsClient {
    /// Build a client without logging in. Most callers want `connect`.
    pub fn new(cfg: OpsConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .cookie_store(true)
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()
            .context("building HTTP client")?;
        let base = Url::parse(&cfg.url).with_context(|| format!("invalid Ops URL {}", cfg.url))?;
        Ok(Self { inner: Arc::new(Inner { http, base, cfg }) })
    }

    /// Build a client and log in, retrying with exponential backoff up to
    /// `attempts` tries before giving up.
    pub async fn connect(cfg: OpsConfig, attempts: u32) -> Result<Self> {
        let client = Self::new(cfg)?;
        let mut backoff = Duration::from_secs(client.inner.cfg.initial_backoff_secs);
        let cap = Duration::from_secs(client.inner.cfg.max_backoff_secs);
        for attempt in 1..=attempts {
            match client.login().await {
                Ok(()) => {
                    info!(url = %client.inner.cfg.url, "Ops session established");
                    return Ok(client);
                }
                Err(e) if attempt < attempts => {
                    warn!(
                        attempt,
                        backoff_secs = backoff.as_secs(),
                        error = %e,
                        "Ops login failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = std::cmp::min(backoff * 2, cap);
                }
                Err(e) => return Err(e.context("Ops login failed, giving up")),
            }
        }
        bail!("no login attempts configured")
    }

    fn api_url(&self, path: &str) -> Result<Url> {
        let full = format!("api/{}/{}", self.inner.cfg.api_version, path.trim_start_matches('/'));
        self.inner.base.join(&full).with_context(|| format!("invalid path {path}"))
    }

    /// POST /user/login; refreshes the shared cookie jar on success.
    pub async fn login(&self) -> Result<()> {
        let url = self.api_url("user/login")?;
        let body = serde_json::json!({
            "u": self.inner.cfg.user,
            "p": self.inner.cfg.password,
        });
        let resp = self
            .inner
            .http
            .post(url)
            .json(&body)
            .send()
            .await
            .context("sending login request")?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("login failed ({status}): {text}");
        }
        debug!(user = %self.inner.cfg.user, "logged in to Ops");
        Ok(())
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let cloned = req.try_clone();
        let resp = req.send().await.context("sending Ops request")?;
        // one relogin + retry on an expired session
        if resp.status() == reqwest::StatusCode::UNAUTHORIZED {
            if let Some(retry) = cloned {
                debug!("Ops session expired, logging in again");
                self.login().await?;
                return retry.send().await.context("resending Ops request");
            }
        }
        Ok(resp)
    }

    /// GET an enveloped response.
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.api_url(path)?;
        let resp = self.send(self.inner.http.get(url)).await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("Ops GET {path} failed ({status}): {text}");
        }
        let envelope: Envelope<T> =
            resp.json().await.with_context(|| format!("decoding Ops response for {path}"))?;
        Ok(envelope.response)
    }

    /// POST a JSON document to a create endpoint. A rejection whose error
    /// alert contains "already exists" is reported as `AlreadyExists`.
    pub async fn create(&self, path: &str, body: &Value) -> Result<CreateOutcome> {
        let url = self.api_url(path)?;
        let resp = self.send(self.inner.http.post(url).json(body)).await?;
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        let alerts: AlertsOnly = serde_json::from_str(&text).unwrap_or_default();
        if status.is_success() {
            return Ok(CreateOutcome::Created);
        }
        if is_already_exists(&alerts.alerts) {
            return Ok(CreateOutcome::AlreadyExists);
        }
        bail!("Ops POST {path} failed ({status}): {text}");
    }

    /// PUT a JSON document, returning the enveloped response.
    pub async fn put<T: DeserializeOwned>(&self, path: &str, body: &Value) -> Result<T> {
        let url = self.api_url(path)?;
        let resp = self.send(self.inner.http.put(url).json(body)).await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("Ops PUT {path} failed ({status}): {text}");
        }
        let envelope: Envelope<T> =
            resp.json().await.with_context(|| format!("decoding Ops response for {path}"))?;
        Ok(envelope.response)
    }

    // Typed endpoints

    /// The monitoring document for a CDN.
    pub async fn monitoring_config(&self, cdn: &str) -> Result<MonitoringSnapshot> {
        self.get(&format!("cdns/{cdn}/configs/monitoring")).await
    }

    /// The routing snapshot for a CDN. Fetched alongside the monitoring
    /// config so the two stay synchronized; the content is opaque here.
    pub async fn routing_config(&self, cdn: &str) -> Result<Value> {
        self.get(&format!("cdns/{cdn}/snapshot")).await
    }

    /// The node's pending-update record.
    pub async fn update_status(&self, host: &str) -> Result<ServerUpdateStatus> {
        let statuses: Vec<ServerUpdateStatus> =
            self.get(&format!("servers/{host}/update_status")).await?;
        statuses
            .into_iter()
            .next()
            .with_context(|| format!("Ops returned no update status for {host}"))
    }

    /// Clear the config-update-pending flag, carrying the update time
    /// observed before this run so Ops can detect concurrent queues.
    pub async fn clear_update_pending(
        &self,
        host: &str,
        config_update_time: Option<chrono::DateTime<chrono::Utc>>,
    ) -> Result<()> {
        let mut path = format!("servers/{host}/update");
        if let Some(t) = config_update_time {
            path = format!("{path}?config_apply_time={}", urlencode_time(t));
        }
        let _: AlertsOnly = {
            let url = self.api_url(&path)?;
            let resp = self.send(self.inner.http.post(url)).await?;
            if !resp.status().is_success() {
                let status = resp.status();
                bail!("clearing update flag for {host} failed ({status})");
            }
            resp.json().await.unwrap_or_default()
        };
        Ok(())
    }

    /// Clear the revalidate-pending flag, carrying the observed reval time.
    pub async fn clear_reval_pending(
        &self,
        host: &str,
        revalidate_update_time: Option<chrono::DateTime<chrono::Utc>>,
    ) -> Result<()> {
        let mut path = format!("servers/{host}/update");
        if let Some(t) = revalidate_update_time {
            path = format!("{path}?revalidate_apply_time={}", urlencode_time(t));
        }
        let url = self.api_url(&path)?;
        let resp = self.send(self.inner.http.post(url)).await?;
        if !resp.status().is_success() {
            let status = resp.status();
            bail!("clearing reval flag for {host} failed ({status})");
        }
        Ok(())
    }

    /// The package list the node is expected to carry.
    pub async fn packages(&self, host: &str) -> Result<Vec<Package>> {
        self.get(&format!("servers/{host}/packages")).await
    }

    /// All known server statuses (REPORTED, OFFLINE, ...), by name.
    pub async fn statuses(&self) -> Result<Vec<String>> {
        #[derive(Deserialize)]
        struct Status {
            name: String,
        }
        let statuses: Vec<Status> = self.get("statuses").await?;
        Ok(statuses.into_iter().map(|s| s.name).collect())
    }

    /// The config files generated for this node. With `reval_only` the
    /// generator restricts itself to revalidation-affecting files.
    pub async fn config_files(&self, host: &str, reval_only: bool) -> Result<Vec<GeneratedFile>> {
        let path = if reval_only {
            format!("servers/{host}/configfiles?revalOnly=true")
        } else {
            format!("servers/{host}/configfiles")
        };
        self.get(&path).await
    }

    /// Monitors serving a CDN, with their statuses.
    pub async fn monitors(&self, cdn: &str) -> Result<Vec<MonitorRef>> {
        self.get(&format!("cdns/{cdn}/monitors")).await
    }

    /// Numeric server id by hostname, if the server exists yet.
    pub async fn server_id(&self, host_name: &str) -> Result<Option<i64>> {
        #[derive(Deserialize)]
        struct ServerRef {
            id: i64,
        }
        let servers: Vec<ServerRef> =
            self.get(&format!("servers?hostName={host_name}")).await?;
        Ok(servers.first().map(|s| s.id))
    }

    /// Numeric delivery service id by XMLID, if it exists yet.
    pub async fn delivery_service_id(&self, xml_id: &str) -> Result<Option<i64>> {
        #[derive(Deserialize)]
        struct DsRef {
            id: i64,
        }
        let dses: Vec<DsRef> =
            self.get(&format!("deliveryservices?xmlId={xml_id}")).await?;
        Ok(dses.first().map(|d| d.id))
    }

    /// Numeric profile id by name, if it exists yet.
    pub async fn profile_id(&self, name: &str) -> Result<Option<i64>> {
        #[derive(Deserialize)]
        struct ProfileRef {
            id: i64,
        }
        let profiles: Vec<ProfileRef> = self.get(&format!("profiles?name={name}")).await?;
        Ok(profiles.first().map(|p| p.id))
    }
}

fn urlencode_time(t: chrono::DateTime<chrono::Utc>) -> String {
    t.to_rfc3339().replace('+', "%2B").replace(':', "%3A")
}
