//! Client for confirming state with the payment processor's API.
//!
//! Some handlers cross-check the notification against the processor's
//! current view before mutating domain state. The client classifies its
//! failures the way the rest of the pipeline expects: timeouts, 5xx, and
//! 429 are transient; other 4xx responses are permanent.

use std::{future::Future, pin::Pin, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::HandlerError;

/// Boxed future returned by processor lookups.
pub type LookupFuture<'a> =
    Pin<Box<dyn Future<Output = Result<ProcessorObject, HandlerError>> + Send + 'a>>;

/// A processor-side object fetched for confirmation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorObject {
    /// Processor-assigned object id.
    pub id: String,
    /// Current status as reported by the processor.
    pub status: String,
    /// Remaining fields, uninterpreted.
    #[serde(flatten)]
    pub attributes: serde_json::Value,
}

/// Read-only access to the processor's API.
///
/// Trait seam so handler tests can stub the processor without a network.
pub trait ProcessorApi: Send + Sync {
    /// Fetches the current state of a processor object by id.
    fn fetch_object<'a>(&'a self, object_id: &'a str) -> LookupFuture<'a>;
}

/// Configuration for the HTTP processor client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorClientConfig {
    /// Base URL of the processor API.
    pub base_url: String,
    /// API key sent as a bearer token.
    pub api_key: String,
    /// Per-request timeout.
    pub timeout: Duration,
}

/// HTTP implementation of [`ProcessorApi`] backed by reqwest.
#[derive(Debug, Clone)]
pub struct HttpProcessorClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpProcessorClient {
    /// Creates a client from configuration.
    ///
    /// # Errors
    ///
    /// Returns a permanent error if the HTTP client cannot be built; that is
    /// a configuration problem, not a delivery problem.
    pub fn new(config: ProcessorClientConfig) -> Result<Self, HandlerError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| HandlerError::permanent(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key,
        })
    }

    async fn fetch_object_inner(&self, object_id: &str) -> Result<ProcessorObject, HandlerError> {
        let url = format!("{}/v1/objects/{object_id}", self.base_url);

        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    HandlerError::transient(format!("processor API timeout: {e}"))
                } else {
                    HandlerError::transient(format!("processor API unreachable: {e}"))
                }
            })?;

        let status = response.status();
        if status.is_server_error() || status.as_u16() == 429 {
            return Err(HandlerError::transient(format!("processor API returned {status}")));
        }
        if !status.is_success() {
            return Err(HandlerError::permanent(format!("processor API returned {status}")));
        }

        response
            .json::<ProcessorObject>()
            .await
            .map_err(|e| HandlerError::permanent(format!("unparseable processor response: {e}")))
    }
}

impl ProcessorApi for HttpProcessorClient {
    fn fetch_object<'a>(&'a self, object_id: &'a str) -> LookupFuture<'a> {
        Box::pin(self.fetch_object_inner(object_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_builds_from_config() {
        let client = HttpProcessorClient::new(ProcessorClientConfig {
            base_url: "https://api.processor.test/".to_string(),
            api_key: "sk_test".to_string(),
            timeout: Duration::from_secs(10),
        })
        .unwrap();

        assert_eq!(client.base_url, "https://api.processor.test");
    }

    #[test]
    fn processor_object_deserializes_extra_fields() {
        let object: ProcessorObject = serde_json::from_value(serde_json::json!({
            "id": "ch_1",
            "status": "succeeded",
            "amount": 4200,
            "currency": "usd",
        }))
        .unwrap();

        assert_eq!(object.id, "ch_1");
        assert_eq!(object.attributes["amount"], 4200);
    }
}
