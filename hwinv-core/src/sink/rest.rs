/*!
REST transport for the collection service.

Each table is a resource under the configured base URL. A row set is
`POST`ed as `{"resource": [...]}` and the service answers with the ids of
the inserted rows in the same envelope, of which the first is the
correlation id:

```json
{"resource": [{"id": 7}]}
```

Connection failures, timeouts, `429` and `5xx` answers are retried with
backoff inside a single `send`; other client errors fail immediately.
*/

use super::Transport;
use crate::config::EndpointConfig;
use crate::record::RecordId;
use crate::{InventoryError, Result};
use async_trait::async_trait;
use hwinv_retry::{
    classify, permanent_error, transport_backoff_policy, with_custom_backoff, ExponentialBackoff,
    RetryableError,
};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
enum HttpFailure {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },
}

impl RetryableError for HttpFailure {
    fn is_transient(&self) -> bool {
        match self {
            HttpFailure::Request(e) => e.is_connect() || e.is_timeout(),
            HttpFailure::Status { status, .. } => *status >= 500 || *status == 429,
        }
    }
}

#[derive(Clone)]
struct Credentials {
    username: String,
    password: Option<String>,
}

/// Transport posting payloads to a REST collection service
pub struct RestTransport {
    client: reqwest::Client,
    base_url: String,
    credentials: Option<Credentials>,
    policy: ExponentialBackoff,
}

impl RestTransport {
    /// Create a transport for the configured endpoint
    ///
    /// # Arguments
    /// * `endpoint` - Base URL and optional basic-auth credentials
    /// * `timeout` - Per-request timeout, applied to every retry attempt
    pub fn new(endpoint: &EndpointConfig, timeout: Duration) -> Result<Self> {
        let base_url = endpoint
            .url
            .as_deref()
            .ok_or_else(|| InventoryError::validation("endpoint url is required"))?
            .trim_end_matches('/')
            .to_string();

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("hwinv/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| InventoryError::validation(format!("cannot build HTTP client: {e}")))?;

        let credentials = endpoint.username.as_ref().map(|username| Credentials {
            username: username.clone(),
            password: endpoint.password.clone(),
        });

        Ok(Self {
            client,
            base_url,
            credentials,
            policy: transport_backoff_policy(),
        })
    }

    /// Replace the retry policy
    pub fn with_backoff_policy(mut self, policy: ExponentialBackoff) -> Self {
        self.policy = policy;
        self
    }

    pub fn table_url(&self, table: &str) -> String {
        format!("{}/{}", self.base_url, table)
    }
}

#[async_trait]
impl Transport for RestTransport {
    async fn send(&self, table: &str, body: String) -> Result<RecordId> {
        let url = self.table_url(table);
        let client = self.client.clone();
        let credentials = self.credentials.clone();

        debug!(%url, "posting payload");
        let response = with_custom_backoff("upload", self.policy.clone(), move |_attempt| {
            let client = client.clone();
            let url = url.clone();
            let body = body.clone();
            let credentials = credentials.clone();
            Box::pin(async move {
                let mut request = client
                    .post(&url)
                    .header(CONTENT_TYPE, "application/json")
                    .header(ACCEPT, "application/json")
                    .body(body);
                if let Some(creds) = credentials {
                    request = request.basic_auth(creds.username, creds.password);
                }

                let response = request
                    .send()
                    .await
                    .map_err(|e| classify("upload", HttpFailure::from(e)))?;

                let status = response.status();
                if !status.is_success() {
                    let body = response.text().await.unwrap_or_default();
                    return Err(classify(
                        "upload",
                        HttpFailure::Status {
                            status: status.as_u16(),
                            body,
                        },
                    ));
                }

                response
                    .json::<serde_json::Value>()
                    .await
                    .map_err(|e| permanent_error!("upload", e))
            })
        })
        .await
        .map_err(|e| InventoryError::upload(table, e.to_string()))?;

        assigned_id(&response)
    }
}

/// First id in a `{"resource": [{"id": ...}]}` response
///
/// Numeric strings are accepted as well as numbers.
pub fn assigned_id(response: &serde_json::Value) -> Result<RecordId> {
    response
        .get("resource")
        .and_then(|rows| rows.as_array())
        .and_then(|rows| rows.first())
        .and_then(|row| row.get("id"))
        .and_then(|id| id.as_i64().or_else(|| id.as_str().and_then(|s| s.parse().ok())))
        .map(RecordId)
        .ok_or_else(|| InventoryError::invalid_response(format!("no id in response: {response}")))
}
