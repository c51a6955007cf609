//! HTTP transport to partner AS2 endpoints

use std::time::Duration;

use async_trait::async_trait;

#[cfg(test)]
use mockall::automock;

use super::headers::As2Headers;

/// A fully prepared outbound AS2 POST
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub url: String,
    pub headers: As2Headers,
    pub body: Vec<u8>,
}

impl OutboundRequest {
    /// Whether the MDN will arrive on a separate connection
    pub fn expects_async_mdn(&self) -> bool {
        self.headers.receipt_delivery_option.is_some()
    }
}

/// Outcome of a successful POST
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportResult {
    /// MDN returned inline on the response
    SyncMdn { status: u16, body: Vec<u8> },
    /// Accepted; the MDN will be delivered later
    PendingAsync { status: u16 },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error("connection error: {0}")]
    Connection(String),
}

/// Classify a 2xx response body
pub fn classify_response(status: u16, body: Vec<u8>, expects_async: bool) -> TransportResult {
    if expects_async || body.iter().all(u8::is_ascii_whitespace) {
        TransportResult::PendingAsync { status }
    } else {
        TransportResult::SyncMdn { status, body }
    }
}

/// Sends AS2 requests and async MDNs over HTTP
#[cfg_attr(test, automock)]
#[async_trait]
pub trait As2Transport: Send + Sync {
    /// POST an AS2 message, waiting at most `deadline` for the response
    async fn send(
        &self,
        request: OutboundRequest,
        deadline: Duration,
    ) -> Result<TransportResult, TransportError>;

    /// POST an MDN to a `Receipt-Delivery-Option` URL; returns the HTTP status
    async fn deliver_mdn(
        &self,
        url: String,
        headers: Vec<(String, String)>,
        body: Vec<u8>,
        deadline: Duration,
    ) -> Result<u16, TransportError>;
}

/// `reqwest`-backed transport
#[derive(Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("as2-gateway/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| TransportError::Connection(e.to_string()))?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn post(
        &self,
        url: &str,
        headers: impl IntoIterator<Item = (String, String)>,
        body: Vec<u8>,
        deadline: Duration,
    ) -> Result<(u16, Vec<u8>), TransportError> {
        let mut request = self.client.post(url).body(body);
        for (name, value) in headers {
            request = request.header(name, value);
        }

        let exchange = async {
            let response = request.send().await.map_err(map_reqwest_error)?;
            let status = response.status().as_u16();
            let bytes = response.bytes().await.map_err(map_reqwest_error)?;
            Ok::<_, TransportError>((status, bytes.to_vec()))
        };

        tokio::time::timeout(deadline, exchange)
            .await
            .map_err(|_| TransportError::Timeout(deadline))?
    }
}

fn map_reqwest_error(err: reqwest::Error) -> TransportError {
    TransportError::Connection(err.to_string())
}

fn is_success(status: u16) -> bool {
    (200..300).contains(&status)
}

#[async_trait]
impl As2Transport for ReqwestTransport {
    async fn send(
        &self,
        request: OutboundRequest,
        deadline: Duration,
    ) -> Result<TransportResult, TransportError> {
        let expects_async = request.expects_async_mdn();
        let headers = request
            .headers
            .to_pairs()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v));

        tracing::debug!(
            url = %request.url,
            message_id = %request.headers.message_id,
            bytes = request.body.len(),
            "Posting AS2 message"
        );

        let (status, body) = self.post(&request.url, headers, request.body, deadline).await?;
        if !is_success(status) {
            return Err(TransportError::Http {
                status,
                body: String::from_utf8_lossy(&body).chars().take(512).collect(),
            });
        }

        Ok(classify_response(status, body, expects_async))
    }

    async fn deliver_mdn(
        &self,
        url: String,
        headers: Vec<(String, String)>,
        body: Vec<u8>,
        deadline: Duration,
    ) -> Result<u16, TransportError> {
        let (status, response) = self.post(&url, headers, body, deadline).await?;
        if !is_success(status) {
            return Err(TransportError::Http {
                status,
                body: String::from_utf8_lossy(&response).chars().take(512).collect(),
            });
        }
        Ok(status)
    }
}
