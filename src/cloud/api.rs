//! Raw provider transport
//!
//! [`ClbApi`] is the seam between the retrying [`super::CloudClient`] and the
//! wire. [`HttpClbApi`] speaks the provider's JSON action envelope over HTTPS.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tracing::debug;

use super::error::ApiError;
use super::types::Action;
use crate::config::Credentials;

/// One provider round trip: send an action payload, get the `Response` body
#[async_trait]
pub trait ClbApi: Send + Sync {
    async fn invoke(&self, region: &str, action: Action, payload: Value) -> Result<Value, ApiError>;
}

/// HTTPS implementation of [`ClbApi`]
#[derive(Clone)]
pub struct HttpClbApi {
    http_client: Client,
    base_url: String,
    credentials: Credentials,
}

impl HttpClbApi {
    /// `endpoint` is either a bare domain (`clb.example.com`) or a full URL
    pub fn new(endpoint: &str, credentials: Credentials, timeout: Duration) -> Result<Self, ApiError> {
        let base_url = if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            endpoint.trim_end_matches('/').to_string()
        } else {
            format!("https://{}", endpoint.trim_end_matches('/'))
        };

        let http_client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("clb-controller/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            http_client,
            base_url,
            credentials,
        })
    }

    fn envelope(region: &str, action: Action, payload: Value) -> Result<Value, ApiError> {
        let mut body = match payload {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                return Err(ApiError::Malformed(format!(
                    "{action} payload must be an object, got {other}"
                )))
            }
        };
        body.insert("Action".to_string(), Value::String(action.to_string()));
        body.insert("Region".to_string(), Value::String(region.to_string()));
        Ok(Value::Object(body))
    }
}

/// Hex SHA-256 of a request body, sent so the provider can verify integrity
pub fn content_digest(body: &[u8]) -> String {
    hex::encode(Sha256::digest(body))
}

/// Unwrap `{"Response": {...}}`, turning an `Error` object into [`ApiError::Provider`]
pub fn parse_response(body: Value) -> Result<Value, ApiError> {
    let mut response = match body {
        Value::Object(mut map) => map
            .remove("Response")
            .ok_or_else(|| ApiError::Malformed("missing Response object".to_string()))?,
        other => {
            return Err(ApiError::Malformed(format!(
                "expected a JSON object, got {other}"
            )))
        }
    };

    if let Some(error) = response.get("Error") {
        let code = error["Code"].as_str().unwrap_or("Unknown").to_string();
        let message = error["Message"].as_str().unwrap_or("").to_string();
        let request_id = response["RequestId"].as_str().unwrap_or("").to_string();
        return Err(ApiError::Provider {
            code,
            message,
            request_id,
        });
    }

    if let Value::Object(map) = &mut response {
        map.remove("Error");
    }
    Ok(response)
}

#[async_trait]
impl ClbApi for HttpClbApi {
    async fn invoke(&self, region: &str, action: Action, payload: Value) -> Result<Value, ApiError> {
        let body = serde_json::to_vec(&Self::envelope(region, action, payload)?)
            .map_err(|e| ApiError::Malformed(e.to_string()))?;

        debug!("POST {} action={} region={}", self.base_url, action, region);

        let response = self
            .http_client
            .post(format!("{}/", self.base_url))
            .header("Content-Type", "application/json")
            .header("X-Clb-SecretId", &self.credentials.secret_id)
            .header("X-Clb-Timestamp", chrono::Utc::now().timestamp().to_string())
            .header("X-Clb-Content-Sha256", content_digest(&body))
            .body(body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;

        match serde_json::from_str::<Value>(&text) {
            Ok(json) if json.get("Response").is_some() => parse_response(json),
            _ if !status.is_success() => Err(ApiError::Status {
                status: status.as_u16(),
                body: text,
            }),
            Ok(_) => Err(ApiError::Malformed("missing Response object".to_string())),
            Err(e) => Err(ApiError::Malformed(format!("invalid JSON: {e}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_adds_action_and_region() {
        let body = HttpClbApi::envelope(
            "ap-guangzhou",
            Action::DescribeListeners,
            json!({"LoadBalancerId": "lb-1"}),
        )
        .unwrap();
        assert_eq!(body["Action"], "DescribeListeners");
        assert_eq!(body["Region"], "ap-guangzhou");
        assert_eq!(body["LoadBalancerId"], "lb-1");
    }

    #[test]
    fn test_envelope_rejects_non_object_payload() {
        let err = HttpClbApi::envelope("r", Action::DescribeListeners, json!([1, 2])).unwrap_err();
        assert!(matches!(err, ApiError::Malformed(_)));
    }

    #[test]
    fn test_parse_response_error_envelope() {
        let err = parse_response(json!({
            "Response": {
                "Error": {"Code": "RequestLimitExceeded", "Message": "slow down"},
                "RequestId": "req-9"
            }
        }))
        .unwrap_err();
        match err {
            ApiError::Provider {
                code, request_id, ..
            } => {
                assert_eq!(code, "RequestLimitExceeded");
                assert_eq!(request_id, "req-9");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_parse_response_success() {
        let body = parse_response(json!({"Response": {"RequestId": "req-1", "ListenerIds": ["lbl-1"]}}))
            .unwrap();
        assert_eq!(body["ListenerIds"][0], "lbl-1");
    }

    #[test]
    fn test_content_digest_is_hex_sha256() {
        assert_eq!(
            content_digest(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_endpoint_normalisation() {
        let creds = Credentials::new("id", "key");
        let api = HttpClbApi::new("clb.example.com/", creds.clone(), Duration::from_secs(1)).unwrap();
        assert_eq!(api.base_url, "https://clb.example.com");
        let api = HttpClbApi::new("http://127.0.0.1:9000", creds, Duration::from_secs(1)).unwrap();
        assert_eq!(api.base_url, "http://127.0.0.1:9000");
    }
}
