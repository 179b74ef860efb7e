//! Desired-state enrollment
//!
//! Converts queued JSON documents into Ops API calls. Documents arrive
//! from a directory watcher or the HTTP ingest endpoint; both feed the
//! same dispatcher. Creates are idempotent: a collision Ops reports as
//! "already exists" is success-with-skip.

mod watcher;

pub use watcher::{DirWatcher, WatchConfig, WatcherHandle};

use crate::ops::{CreateOutcome, OpsClient};
use anyhow::{bail, Context, Result};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info};

/// Submission order for the initial load; each type may reference entities
/// of the types before it.
pub const ENROLLMENT_ORDER: &[&str] = &[
    "cdns",
    "types",
    "divisions",
    "regions",
    "phys_locations",
    "tenants",
    "users",
    "cachegroups",
    "profiles",
    "parameters",
    "server_capabilities",
    "servers",
    "topologies",
    "deliveryservices",
    "federations",
    "server_server_capabilities",
    "deliveryservice_servers",
    "deliveryservices_required_capabilities",
];

/// What happened to one document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Created,
    /// The entity already exists upstream.
    Skipped,
    /// The document parsed as empty; the caller should retry it later.
    Empty,
}

/// A document with no content at all: whitespace, null, or an empty
/// object. These show up when a writer has created the file but not yet
/// written it.
pub fn is_empty_document(body: &[u8]) -> bool {
    let text = String::from_utf8_lossy(body);
    if text.trim().is_empty() {
        return true;
    }
    match serde_json::from_str::<Value>(&text) {
        Ok(Value::Null) => true,
        Ok(Value::Object(map)) => map.is_empty(),
        _ => false,
    }
}

/// Routes typed documents to their Ops endpoints, resolving indirect
/// references first. The supported types are an explicit registry fixed at
/// construction.
pub struct Dispatcher {
    ops: OpsClient,
    types: Vec<String>,
    reference_retry_interval: Duration,
    reference_retry_attempts: u32,
}

impl Dispatcher {
    pub fn new(ops: OpsClient) -> Self {
        Self {
            ops,
            types: ENROLLMENT_ORDER.iter().map(|s| s.to_string()).collect(),
            reference_retry_interval: Duration::from_secs(2),
            reference_retry_attempts: 30,
        }
    }

    pub fn with_reference_retry(mut self, interval: Duration, attempts: u32) -> Self {
        self.reference_retry_interval = interval;
        self.reference_retry_attempts = attempts;
        self
    }

    pub fn types(&self) -> &[String] {
        &self.types
    }

    pub fn supported(&self, ty: &str) -> bool {
        self.types.iter().any(|t| t == ty)
    }

    /// Decode and submit one document of the given type.
    pub async fn dispatch(&self, ty: &str, body: &[u8]) -> Result<Outcome> {
        if is_empty_document(body) {
            return Ok(Outcome::Empty);
        }
        if !self.supported(ty) {
            bail!("no handler for creating {ty}");
        }
        let doc: Value =
            serde_json::from_slice(body).with_context(|| format!("decoding {ty} document"))?;

        match ty {
            "parameters" => self.enroll_parameters(doc).await,
            "server_server_capabilities" => self.enroll_server_capability_link(doc).await,
            "deliveryservice_servers" => self.enroll_ds_servers(doc).await,
            "deliveryservices_required_capabilities" => {
                self.enroll_ds_required_capability(doc).await
            }
            _ => self.enroll_plain(ty, &doc).await,
        }
    }

    async fn enroll_plain(&self, ty: &str, doc: &Value) -> Result<Outcome> {
        match self.ops.create(ty, doc).await? {
            CreateOutcome::Created => {
                info!(r#type = ty, "created");
                Ok(Outcome::Created)
            }
            CreateOutcome::AlreadyExists => {
                info!(r#type = ty, "already exists");
                Ok(Outcome::Skipped)
            }
        }
    }

    /// Parameters arrive as an array; each element is created on its own,
    /// with collisions skipped individually.
    async fn enroll_parameters(&self, doc: Value) -> Result<Outcome> {
        let params = match doc {
            Value::Array(items) => items,
            single => vec![single],
        };
        let mut any_created = false;
        for param in &params {
            match self.ops.create("parameters", param).await? {
                CreateOutcome::Created => any_created = true,
                CreateOutcome::AlreadyExists => {
                    debug!("parameter already exists");
                }
            }
        }
        Ok(if any_created { Outcome::Created } else { Outcome::Skipped })
    }

    /// A server/capability link references the server by hostname; the
    /// numeric id must be resolved (and may not exist yet).
    async fn enroll_server_capability_link(&self, mut doc: Value) -> Result<Outcome> {
        let host = doc
            .get("server")
            .and_then(Value::as_str)
            .context("server/capability link did not specify a server")?
            .to_string();

        let id = self
            .resolve_reference(&format!("server {host}"), || self.ops.server_id(&host))
            .await?;
        doc["serverId"] = Value::from(id);

        self.enroll_plain("server_server_capabilities", &doc).await
    }

    /// Assigns servers to a delivery service; both sides must already be
    /// enrolled.
    async fn enroll_ds_servers(&self, doc: Value) -> Result<Outcome> {
        let xml_id = doc
            .get("xmlId")
            .and_then(Value::as_str)
            .context("deliveryservice/server assignment has no xmlId")?
            .to_string();
        let server_names: Vec<String> = doc
            .get("serverNames")
            .and_then(Value::as_array)
            .context("deliveryservice/server assignment has no serverNames")?
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect();

        let ds_id = self
            .resolve_reference(&format!("delivery service {xml_id}"), || {
                self.ops.delivery_service_id(&xml_id)
            })
            .await?;

        let mut server_ids = Vec::with_capacity(server_names.len());
        for name in &server_names {
            let id = self
                .resolve_reference(&format!("server {name}"), || self.ops.server_id(name))
                .await?;
            server_ids.push(id);
        }

        let body = serde_json::json!({
            "dsId": ds_id,
            "servers": server_ids,
            "replace": true,
        });
        match self.ops.create("deliveryserviceserver", &body).await? {
            CreateOutcome::Created => Ok(Outcome::Created),
            CreateOutcome::AlreadyExists => Ok(Outcome::Skipped),
        }
    }

    async fn enroll_ds_required_capability(&self, mut doc: Value) -> Result<Outcome> {
        let xml_id = doc
            .get("xmlId")
            .and_then(Value::as_str)
            .context("required capability has no xmlId")?
            .to_string();
        let id = self
            .resolve_reference(&format!("delivery service {xml_id}"), || {
                self.ops.delivery_service_id(&xml_id)
            })
            .await?;
        doc["deliveryServiceId"] = Value::from(id);
        self.enroll_plain("deliveryservices_required_capabilities", &doc).await
    }

    /// Poll Ops until a referenced entity resolves. Documents routinely
    /// arrive before their references, so absence is retried, not fatal,
    /// until the attempt budget runs out.
    async fn resolve_reference<F, Fut>(&self, what: &str, lookup: F) -> Result<i64>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<Option<i64>>>,
    {
        for attempt in 1..=self.reference_retry_attempts {
            if let Some(id) = lookup().await? {
                return Ok(id);
            }
            debug!(what, attempt, "reference not resolvable yet, waiting");
            tokio::time::sleep(self.reference_retry_interval).await;
        }
        bail!("could not resolve {what} after {} attempts", self.reference_retry_attempts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::OpsConfig;
    use httpmock::{Method::GET, Method::POST, MockServer};

    fn dispatcher(server: &MockServer) -> Dispatcher {
        let ops = OpsClient::new(OpsConfig {
            url: server.base_url(),
            user: "admin".into(),
            password: "pw".into(),
            api_version: "4.0".into(),
            timeout_secs: 5,
            initial_backoff_secs: 1,
            max_backoff_secs: 2,
        })
        .unwrap();
        Dispatcher::new(ops).with_reference_retry(Duration::from_millis(10), 3)
    }

    #[test]
    fn test_enrollment_order_respects_dependencies() {
        let position = |ty: &str| {
            ENROLLMENT_ORDER.iter().position(|t| *t == ty).unwrap_or_else(|| panic!("{ty}"))
        };
        assert_eq!(position("cdns"), 0);
        assert!(position("types") < position("cachegroups"));
        assert!(position("servers") > position("profiles"));
        assert!(position("deliveryservice_servers") > position("deliveryservices"));
        assert!(position("deliveryservice_servers") > position("servers"));
        assert!(position("server_server_capabilities") > position("server_capabilities"));
        assert_eq!(
            *ENROLLMENT_ORDER.last().unwrap(),
            "deliveryservices_required_capabilities"
        );
    }

    #[test]
    fn test_empty_document_detection() {
        assert!(is_empty_document(b""));
        assert!(is_empty_document(b"   \n"));
        assert!(is_empty_document(b"{}"));
        assert!(is_empty_document(b"null"));
        assert!(!is_empty_document(b"{\"name\": \"cdn-a\"}"));
        assert!(!is_empty_document(b"[]"));
    }

    #[tokio::test]
    async fn test_plain_create() {
        let server = MockServer::start_async().await;
        let mock = server.mock(|when, then| {
            when.method(POST).path("/api/4.0/cdns");
            then.status(200).json_body(serde_json::json!({"alerts": []}));
        });

        let outcome = dispatcher(&server)
            .dispatch("cdns", br#"{"name": "cdn-a", "domainName": "cdn-a.example"}"#)
            .await
            .unwrap();
        mock.assert();
        assert_eq!(outcome, Outcome::Created);
    }

    #[tokio::test]
    async fn test_duplicate_create_is_skip() {
        let server = MockServer::start_async().await;
        server.mock(|when, then| {
            when.method(POST).path("/api/4.0/cdns");
            then.status(400).json_body(serde_json::json!({
                "alerts": [{"text": "cdn already exists.", "level": "error"}]
            }));
        });

        let outcome = dispatcher(&server)
            .dispatch("cdns", br#"{"name": "cdn-a"}"#)
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Skipped);
    }

    #[tokio::test]
    async fn test_empty_object_is_reported_for_retry() {
        let server = MockServer::start_async().await;
        let outcome = dispatcher(&server).dispatch("servers", b"{}").await.unwrap();
        assert_eq!(outcome, Outcome::Empty);
    }

    #[tokio::test]
    async fn test_unsupported_type_is_an_error() {
        let server = MockServer::start_async().await;
        assert!(dispatcher(&server).dispatch("gadgets", b"{\"a\":1}").await.is_err());
    }

    #[tokio::test]
    async fn test_server_capability_link_resolves_server_id() {
        let server = MockServer::start_async().await;
        server.mock(|when, then| {
            when.method(GET).path("/api/4.0/servers").query_param("hostName", "edge-01");
            then.status(200)
                .json_body(serde_json::json!({"response": [{"id": 42, "hostName": "edge-01"}]}));
        });
        let create = server.mock(|when, then| {
            when.method(POST)
                .path("/api/4.0/server_server_capabilities")
                .json_body_partial(r#"{"serverId": 42}"#);
            then.status(200).json_body(serde_json::json!({"alerts": []}));
        });

        let body = br#"{"server": "edge-01", "serverCapability": "RAM"}"#;
        let outcome = dispatcher(&server)
            .dispatch("server_server_capabilities", body)
            .await
            .unwrap();
        create.assert();
        assert_eq!(outcome, Outcome::Created);
    }

    #[tokio::test]
    async fn test_unresolvable_reference_exhausts_retries() {
        let server = MockServer::start_async().await;
        let lookups = server.mock(|when, then| {
            when.method(GET).path("/api/4.0/servers");
            then.status(200).json_body(serde_json::json!({"response": []}));
        });

        let body = br#"{"server": "ghost", "serverCapability": "RAM"}"#;
        let err = dispatcher(&server)
            .dispatch("server_server_capabilities", body)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("ghost"));
        lookups.assert_hits(3);
    }

    #[tokio::test]
    async fn test_ds_server_assignment_resolves_both_sides() {
        let server = MockServer::start_async().await;
        server.mock(|when, then| {
            when.method(GET)
                .path("/api/4.0/deliveryservices")
                .query_param("xmlId", "demo-ds");
            then.status(200).json_body(serde_json::json!({"response": [{"id": 7}]}));
        });
        server.mock(|when, then| {
            when.method(GET).path("/api/4.0/servers").query_param("hostName", "edge-01");
            then.status(200).json_body(serde_json::json!({"response": [{"id": 42}]}));
        });
        let assign = server.mock(|when, then| {
            when.method(POST)
                .path("/api/4.0/deliveryserviceserver")
                .json_body_partial(r#"{"dsId": 7, "servers": [42]}"#);
            then.status(200).json_body(serde_json::json!({"alerts": []}));
        });

        let body = br#"{"xmlId": "demo-ds", "serverNames": ["edge-01"]}"#;
        let outcome =
            dispatcher(&server).dispatch("deliveryservice_servers", body).await.unwrap();
        assign.assert();
        assert_eq!(outcome, Outcome::Created);
    }

    #[tokio::test]
    async fn test_parameters_array_mixed_outcomes() {
        let server = MockServer::start_async().await;
        server.mock(|when, then| {
            when.method(POST)
                .path("/api/4.0/parameters")
                .json_body_partial(r#"{"name": "existing"}"#);
            then.status(400).json_body(serde_json::json!({
                "alerts": [{"text": "parameter already exists", "level": "error"}]
            }));
        });
        server.mock(|when, then| {
            when.method(POST).path("/api/4.0/parameters").json_body_partial(r#"{"name": "new"}"#);
            then.status(200).json_body(serde_json::json!({"alerts": []}));
        });

        let body = br#"[{"name": "existing", "configFile": "records.config", "value": "1"},
                        {"name": "new", "configFile": "records.config", "value": "2"}]"#;
        let outcome = dispatcher(&server).dispatch("parameters", body).await.unwrap();
        assert_eq!(outcome, Outcome::Created);
    }
}
