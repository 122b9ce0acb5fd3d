//! Typed client for the control-plane API.
//!
//! All requests carry the bearer token and a `rec/<version>` user agent.
//! Non-2xx responses map to [`Error::Api`]; callers decide whether that is
//! retriable (the poller) or merely logged (registration).

use chrono::{DateTime, Utc};
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use rec_common::config::RootlyConfig;

use crate::error::{Error, Result};
use crate::model::catalog::ActionCatalog;

/// User agent sent on every control-plane request.
pub const USER_AGENT: &str = concat!("rec/", env!("CARGO_PKG_VERSION"));

/// Ceiling on any single control-plane request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Deadline for status patches; short so shutdown-time reports stay bounded.
const REPORT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(config: &RootlyConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        let mut auth = HeaderValue::from_str(&format!("Bearer {}", config.api_key))
            .map_err(|_| Error::Api {
                status: 0,
                message: "api key contains invalid header characters".into(),
            })?;
        auth.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth);

        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .default_headers(headers)
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            http,
            base_url: config.base_url(),
        })
    }

    /// Claim up to `max` pending deliveries. An empty list means idle.
    pub async fn fetch_deliveries(&self, max: u32) -> Result<Vec<Value>> {
        let url = format!("{}/deliveries", self.base_url);
        let response = self
            .http
            .get(&url)
            .query(&[("max", max)])
            .send()
            .await?;
        let response = check_status(response).await?;

        let body: DeliveriesResponse = response.json().await?;
        Ok(body.events)
    }

    /// Patch one delivery's execution status.
    pub async fn patch_delivery(&self, delivery_id: &str, patch: &DeliveryPatch) -> Result<()> {
        let url = format!("{}/deliveries/{}", self.base_url, delivery_id);
        let response = self
            .http
            .patch(&url)
            .timeout(REPORT_TIMEOUT)
            .json(patch)
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }

    /// Register the agent's action catalog. Called once at startup; failure
    /// is non-fatal and handled by the caller.
    pub async fn register_actions(&self, catalog: &ActionCatalog) -> Result<RegistrationOutcome> {
        let request = RegisterRequest {
            automatic: catalog.automatic().map(|a| RegisteredAction::from_action(a)).collect(),
            callable: catalog.callable().map(|a| RegisteredAction::from_action(a)).collect(),
        };

        let url = format!("{}/actions", self.base_url);
        let response = self.http.post(&url).json(&request).send().await?;
        let response = check_status(response).await?;
        Ok(response.json().await?)
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    Err(Error::Api {
        status: status.as_u16(),
        message,
    })
}

#[derive(Debug, Deserialize)]
struct DeliveriesResponse {
    #[serde(default)]
    events: Vec<Value>,
}

/// Body of `PATCH /deliveries/<id>`. Fields not applicable to the reported
/// status stay empty and are omitted from the wire.
#[derive(Debug, Default, Serialize)]
pub struct DeliveryPatch {
    pub execution_status: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub execution_action_name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub execution_action_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_exit_code: Option<i32>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub execution_stdout: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub execution_stderr: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
struct RegisterRequest {
    automatic: Vec<RegisteredAction>,
    callable: Vec<RegisteredAction>,
}

#[derive(Debug, Serialize)]
struct RegisteredAction {
    slug: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    event_type: String,
    kind: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    parameter_definitions: Vec<crate::model::action::ParameterDefinition>,
}

impl RegisteredAction {
    fn from_action(action: &crate::model::action::Action) -> Self {
        Self {
            slug: action.id.clone(),
            name: action.name.clone(),
            event_type: action.trigger_event_type.clone(),
            kind: action.kind.as_str().to_string(),
            parameter_definitions: action.parameter_definitions.clone(),
        }
    }
}

/// Response of `POST /actions`.
#[derive(Debug, Deserialize)]
pub struct RegistrationOutcome {
    pub registered: RegisteredCounts,
    #[serde(default)]
    pub failed: u32,
    #[serde(default)]
    pub failures: Vec<RegistrationFailure>,
}

#[derive(Debug, Deserialize)]
pub struct RegisteredCounts {
    pub automatic: u32,
    pub callable: u32,
    pub total: u32,
}

#[derive(Debug, Deserialize)]
pub struct RegistrationFailure {
    pub slug: String,
    pub reason: String,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> ApiClient {
        ApiClient::new(&RootlyConfig {
            api_url: server.uri(),
            api_path: "/v1".into(),
            api_key: "test-key".into(),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn fetch_deliveries_sends_auth_and_parses_events() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/deliveries"))
            .and(query_param("max", "10"))
            .and(header("authorization", "Bearer test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "events": [
                    {"delivery_id": "queue-1", "event_type": "alert.created"},
                    {"delivery_id": "queue-2", "event_type": "incident.created"}
                ]
            })))
            .mount(&server)
            .await;

        let events = client_for(&server).fetch_deliveries(10).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0]["delivery_id"], "queue-1");
    }

    #[tokio::test]
    async fn fetch_deliveries_maps_5xx_to_api_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/deliveries"))
            .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
            .mount(&server)
            .await;

        let err = client_for(&server).fetch_deliveries(5).await.unwrap_err();
        match err {
            Error::Api { status, message } => {
                assert_eq!(status, 503);
                assert_eq!(message, "maintenance");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn patch_omits_inapplicable_fields() {
        let patch = DeliveryPatch {
            execution_status: "running".into(),
            started_at: Some(Utc::now()),
            ..Default::default()
        };
        let body = serde_json::to_value(&patch).unwrap();
        assert!(body.get("completed_at").is_none());
        assert!(body.get("failed_at").is_none());
        assert!(body.get("execution_stdout").is_none());
        assert_eq!(body["execution_status"], "running");
    }

    #[tokio::test]
    async fn register_actions_round_trips() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/actions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "registered": {"automatic": 1, "callable": 1, "total": 2},
                "failed": 0,
                "failures": []
            })))
            .mount(&server)
            .await;

        let catalog = ActionCatalog::from_yaml(
            r#"
on:
  alert.created:
    script: ./handle.sh
callable:
  restart_service:
    script: ./restart.sh
"#,
        )
        .unwrap();

        let outcome = client_for(&server)
            .register_actions(&catalog)
            .await
            .unwrap();
        assert_eq!(outcome.registered.total, 2);
        assert_eq!(outcome.failed, 0);
    }
}
