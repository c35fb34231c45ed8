use crate::transport::{AgentEndpoint, Delivery, DeliveryStrategy, Envelope};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying `sha256=<hex>` of the request body.
pub const SIGNATURE_HEADER: &str = "X-Fleet-Signature";

/// JSON body posted to an agent's callback URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackBody {
    /// Unique per delivery; lets agents drop duplicates.
    pub delivery_id: Uuid,
    /// Recipient.
    pub agent_id: String,
    /// Task instructions.
    pub payload: String,
    /// Send time.
    pub sent_at: DateTime<Utc>,
}

/// Compute the signature header value for `body` under `secret`.
pub fn sign_payload(secret: &str, body: &[u8]) -> String {
    // HMAC accepts keys of any length.
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// Check a `sha256=<hex>` signature in constant time.
pub fn verify_signature(secret: &str, body: &[u8], signature: &str) -> bool {
    let Some(hex_sig) = signature.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_sig) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// POSTs the envelope to the agent's registered callback URL.
pub struct HttpCallbackDelivery {
    client: reqwest::Client,
}

impl HttpCallbackDelivery {
    /// Client with a per-request `timeout`.
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("fleet-dispatch/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, "Falling back to default HTTP client");
                reqwest::Client::new()
            });
        Self { client }
    }
}

#[async_trait]
impl DeliveryStrategy for HttpCallbackDelivery {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn deliver(&self, endpoint: &AgentEndpoint, envelope: &Envelope) -> Delivery {
        let Some(url) = endpoint.address.as_deref() else {
            return Delivery::Failed(format!(
                "agent '{}' has no callback URL",
                endpoint.agent_id
            ));
        };

        let body = CallbackBody {
            delivery_id: envelope.id,
            agent_id: envelope.agent_id.clone(),
            payload: envelope.payload.clone(),
            sent_at: Utc::now(),
        };
        let bytes = match serde_json::to_vec(&body) {
            Ok(b) => b,
            Err(e) => return Delivery::Failed(format!("encode callback body: {e}")),
        };

        let mut request = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json");
        if let Some(secret) = endpoint.callback_secret.as_deref() {
            request = request.header(SIGNATURE_HEADER, sign_payload(secret, &bytes));
        }

        match request.body(bytes).send().await {
            Ok(resp) if resp.status().is_success() => {
                info!(agent_id = %endpoint.agent_id, url, "Callback delivered");
                Delivery::Delivered("http")
            }
            Ok(resp) => Delivery::Failed(format!("callback returned {}", resp.status())),
            Err(e) => Delivery::Failed(format!("callback request failed: {e}")),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use fleet_core::{AgentStatus, TransportKind};
    use wiremock::matchers::{header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn endpoint(url: Option<String>, secret: Option<&str>) -> AgentEndpoint {
        AgentEndpoint {
            agent_id: "a1".into(),
            transport: TransportKind::HttpCallback,
            address: url,
            callback_secret: secret.map(String::from),
            status: AgentStatus::Available,
            last_heartbeat: Utc::now(),
        }
    }

    #[test]
    fn test_sign_and_verify() {
        let sig = sign_payload("k", b"{\"a\":1}");
        assert!(sig.starts_with("sha256="));
        assert!(verify_signature("k", b"{\"a\":1}", &sig));
        assert!(!verify_signature("other", b"{\"a\":1}", &sig));
        assert!(!verify_signature("k", b"{\"a\":2}", &sig));
        assert!(!verify_signature("k", b"x", "md5=abc"));
    }

    #[tokio::test]
    async fn test_signed_post_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(header_exists(SIGNATURE_HEADER))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        let http = HttpCallbackDelivery::new(Duration::from_secs(2));
        let out = http
            .deliver(
                &endpoint(Some(format!("{}/hook", server.uri())), Some("s3cret")),
                &Envelope::new("a1", "TASK_ID: t1"),
            )
            .await;
        assert_eq!(out, Delivery::Delivered("http"));

        let received = &server.received_requests().await.unwrap()[0];
        let sig = received
            .headers
            .get(SIGNATURE_HEADER)
            .unwrap()
            .to_str()
            .unwrap();
        assert!(verify_signature("s3cret", &received.body, sig));
        let body: CallbackBody = serde_json::from_slice(&received.body).unwrap();
        assert_eq!(body.payload, "TASK_ID: t1");
    }

    #[tokio::test]
    async fn test_server_error_is_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let http = HttpCallbackDelivery::new(Duration::from_secs(2));
        let out = http
            .deliver(
                &endpoint(Some(server.uri()), None),
                &Envelope::new("a1", "x"),
            )
            .await;
        assert!(matches!(out, Delivery::Failed(ref r) if r.contains("500")));
    }

    #[tokio::test]
    async fn test_missing_url_is_failure() {
        let http = HttpCallbackDelivery::new(Duration::from_secs(1));
        let out = http
            .deliver(&endpoint(None, None), &Envelope::new("a1", "x"))
            .await;
        assert!(!out.is_success());
    }
}
