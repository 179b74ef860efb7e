//! HTTP probing

use super::ProbeKind;
use anyhow::{Context, Result};
use reqwest::header::{HeaderValue, ACCEPT, CONNECTION, HOST, USER_AGENT};
use std::time::{Duration, Instant};

/// Outcome of one poll attempt.
#[derive(Debug)]
pub struct PollOutcome {
    pub body: Option<Vec<u8>>,
    pub error: Option<String>,
    pub req_end: chrono::DateTime<chrono::Utc>,
    pub req_time: Duration,
}

/// Issues probe requests. One prober is shared by every probe task; probes
/// that disable keep-alive use a second connectionless client so the pooled
/// client stays warm for everyone else.
pub struct HttpProber {
    pooled: reqwest::Client,
    connectionless: reqwest::Client,
    user_agent: String,
    default_timeout: Duration,
}

impl HttpProber {
    pub fn new(user_agent: impl Into<String>, default_timeout: Duration) -> Result<Self> {
        let pooled = reqwest::Client::builder()
            .build()
            .context("building pooled probe client")?;
        let connectionless = reqwest::Client::builder()
            .pool_max_idle_per_host(0)
            .build()
            .context("building connectionless probe client")?;
        Ok(Self {
            pooled,
            connectionless,
            user_agent: user_agent.into(),
            default_timeout,
        })
    }

    /// Issue one probe. Transport failures and non-2xx statuses both come
    /// back as an error outcome carrying the elapsed time; the caller keeps
    /// ticking regardless.
    pub async fn probe(
        &self,
        kind: ProbeKind,
        url: &str,
        host: &str,
        timeout: Option<Duration>,
        no_keep_alive: bool,
        format: &str,
    ) -> PollOutcome {
        if kind == ProbeKind::Noop {
            return PollOutcome {
                body: Some(Vec::new()),
                error: None,
                req_end: chrono::Utc::now(),
                req_time: Duration::ZERO,
            };
        }

        let client = if no_keep_alive { &self.connectionless } else { &self.pooled };
        let start = Instant::now();

        let mut req = client
            .get(url)
            .timeout(timeout.unwrap_or(self.default_timeout))
            .header(USER_AGENT, &self.user_agent)
            .header(ACCEPT, format);
        if !no_keep_alive {
            req = req.header(CONNECTION, "keep-alive");
        }
        if !host.is_empty() {
            if let Ok(v) = HeaderValue::from_str(host) {
                req = req.header(HOST, v);
            }
        }

        let finish = |body: Option<Vec<u8>>, error: Option<String>, start: Instant| PollOutcome {
            body,
            error,
            req_end: chrono::Utc::now(),
            req_time: start.elapsed(),
        };

        let resp = match req.send().await {
            Ok(r) => r,
            Err(e) => return finish(None, Some(format!("url {url} fetch error: {e}")), start),
        };

        let status = resp.status();
        if !status.is_success() {
            return finish(
                None,
                Some(format!("url {url} fetch error: bad HTTP status: {status}")),
                start,
            );
        }

        match resp.bytes().await {
            Ok(b) => finish(Some(b.to_vec()), None, start),
            Err(e) => finish(None, Some(format!("url {url} fetch error: reading body: {e}")), start),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::{Method::GET, MockServer};

    #[tokio::test]
    async fn test_probe_success_carries_body() {
        let server = MockServer::start_async().await;
        let m = server.mock(|when, then| {
            when.method(GET)
                .path("/_stats")
                .header("accept", "application/json")
                .header("connection", "keep-alive")
                .header("host", "cache.example");
            then.status(200).body("{\"ats\":{}}");
        });

        let prober = HttpProber::new("cache-monitor/0.3", Duration::from_secs(2)).unwrap();
        let out = prober
            .probe(
                ProbeKind::Http,
                &server.url("/_stats"),
                "cache.example",
                None,
                false,
                "application/json",
            )
            .await;

        m.assert();
        assert!(out.error.is_none());
        assert_eq!(out.body.unwrap(), b"{\"ats\":{}}");
    }

    #[tokio::test]
    async fn test_probe_non_2xx_is_failure_with_elapsed() {
        let server = MockServer::start_async().await;
        server.mock(|when, then| {
            when.method(GET).path("/_stats");
            then.status(503);
        });

        let prober = HttpProber::new("cache-monitor/0.3", Duration::from_secs(2)).unwrap();
        let out = prober
            .probe(ProbeKind::Http, &server.url("/_stats"), "", None, true, "text/json")
            .await;

        assert!(out.body.is_none());
        let err = out.error.unwrap();
        assert!(err.contains("503"), "unexpected error text: {err}");
    }

    #[tokio::test]
    async fn test_probe_connection_refused_is_failure() {
        let prober = HttpProber::new("cache-monitor/0.3", Duration::from_millis(500)).unwrap();
        let out = prober
            .probe(ProbeKind::Http, "http://127.0.0.1:1/_stats", "", None, false, "text/json")
            .await;
        assert!(out.error.is_some());
    }

    #[tokio::test]
    async fn test_noop_probe_is_instant_success() {
        let prober = HttpProber::new("cache-monitor/0.3", Duration::from_secs(2)).unwrap();
        let out = prober
            .probe(ProbeKind::Noop, "http://unused/", "", None, false, "text/json")
            .await;
        assert!(out.error.is_none());
        assert_eq!(out.body.unwrap(), Vec::<u8>::new());
    }
}
