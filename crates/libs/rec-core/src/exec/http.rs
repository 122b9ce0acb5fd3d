//! Outbound HTTP execution for http-kind actions.
//!
//! One request per execution. The HTTP status becomes the result's exit
//! code; 2xx is success. Transport failures (DNS, connect, TLS, timeout)
//! keep exit code 0 with the error description in stderr, so the control
//! plane can tell "the webhook answered 500" from "we never reached it".

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::str::FromStr;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::model::action::{Action, HttpSpec};
use crate::model::execution::{ExecutionResult, OUTPUT_CAP, TRUNCATION_SENTINEL};

pub struct HttpRunner {
    client: reqwest::Client,
}

impl Default for HttpRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpRunner {
    pub fn new() -> Self {
        // Per-request deadlines come from the action; the client itself only
        // bounds connect time.
        let client = reqwest::Client::builder()
            .user_agent(crate::api::client::USER_AGENT)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self { client }
    }

    /// Issue the action's request with the already-rendered body.
    pub async fn run(
        &self,
        delivery_id: &str,
        action: &Action,
        spec: &HttpSpec,
        rendered_body: Option<String>,
        token: &CancellationToken,
    ) -> ExecutionResult {
        let result = ExecutionResult::started(delivery_id, &action.id, action.display_name());

        let method = match reqwest::Method::from_str(&spec.method.to_uppercase()) {
            Ok(method) => method,
            Err(_) => {
                return result.fail_with(0, format!("invalid HTTP method '{}'", spec.method));
            }
        };

        let headers = match build_headers(spec) {
            Ok(headers) => headers,
            Err(message) => return result.fail_with(0, message),
        };

        let mut request = self
            .client
            .request(method, &spec.url)
            .headers(headers)
            .timeout(action.timeout());
        if let Some(body) = rendered_body {
            request = request.body(body);
        }

        debug!(url = %spec.url, action = %action.id, "HTTP action request");
        let response = tokio::select! {
            response = request.send() => response,
            _ = token.cancelled() => {
                return result.fail_with(0, "execution cancelled during shutdown");
            }
        };

        match response {
            Ok(response) => {
                let status = response.status();
                let exit_code = i32::from(status.as_u16());
                let body = read_capped(response).await;
                if status.is_success() {
                    result.finish(true, exit_code, body, String::new())
                } else {
                    let stderr = format!("request failed with status {status}");
                    result.finish(false, exit_code, body, stderr)
                }
            }
            // Transport failure: never reached the peer (or timed out).
            Err(err) => result.fail_with(0, format!("request error: {err}")),
        }
    }
}

fn build_headers(spec: &HttpSpec) -> Result<HeaderMap, String> {
    let mut headers = HeaderMap::new();
    for (name, value) in &spec.headers {
        let name = HeaderName::from_str(name).map_err(|_| format!("invalid header name '{name}'"))?;
        let value =
            HeaderValue::from_str(value).map_err(|_| format!("invalid value for header '{name}'"))?;
        headers.insert(name, value);
    }
    Ok(headers)
}

/// Stream the response body, keeping at most [`OUTPUT_CAP`] bytes.
async fn read_capped(mut response: reqwest::Response) -> String {
    let mut buf: Vec<u8> = Vec::new();
    let mut truncated = false;
    while let Ok(Some(chunk)) = response.chunk().await {
        if buf.len() < OUTPUT_CAP {
            let take = chunk.len().min(OUTPUT_CAP - buf.len());
            buf.extend_from_slice(&chunk[..take]);
            if take < chunk.len() {
                truncated = true;
            }
        } else {
            truncated = true;
        }
    }
    let mut body = String::from_utf8_lossy(&buf).into_owned();
    if truncated {
        body.push_str(TRUNCATION_SENTINEL);
    }
    body
}
