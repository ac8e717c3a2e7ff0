//! HTTP implementation of [`PeerTransport`].

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde_json::Value;

use super::transport::{PeerTransport, PullPage, PullQuery, PushAck};
use crate::error::{Error, Result};
use crate::report::{LocationReport, ReportDraft};

/// Talks to peers over their HTTP API.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
}

#[derive(Debug, Deserialize)]
struct NodeIdResponse {
    node_id: String,
}

#[derive(Debug, Deserialize)]
struct PullResponse {
    #[serde(default)]
    data: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    message: String,
}

impl HttpTransport {
    /// Build a transport whose every request is bounded by `request_timeout`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(request_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(request_timeout)
            .connect_timeout(request_timeout)
            .user_agent(concat!("meshtrack/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::internal(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }

    /// Build a transport around an existing client.
    #[must_use]
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

/// Turn a peer address into a base URL.
///
/// Bare `host:port` addresses are assumed to speak plain HTTP.
#[must_use]
pub fn base_url(address: &str) -> String {
    let address = address.trim_end_matches('/');
    if address.starts_with("http://") || address.starts_with("https://") {
        address.to_string()
    } else {
        format!("http://{address}")
    }
}

fn request_error(address: &str, err: &reqwest::Error) -> Error {
    if err.is_timeout() {
        Error::Timeout {
            operation: format!("request to {address}"),
        }
    } else {
        Error::network(address, err.to_string())
    }
}

/// Fail on any non-2xx status, surfacing the peer's error message if it sent one.
async fn check_status(address: &str, response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let detail = serde_json::from_str::<ErrorResponse>(&body)
        .map(|e| e.message)
        .unwrap_or(body);
    Err(Error::network(
        address,
        format!("peer answered {status}: {detail}"),
    ))
}

#[async_trait]
impl PeerTransport for HttpTransport {
    async fn node_id(&self, address: &str) -> Result<String> {
        let url = format!("{}/api/locations/node-id", base_url(address));
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| request_error(address, &e))?;
        let body: NodeIdResponse = check_status(address, response)
            .await?
            .json()
            .await
            .map_err(|e| request_error(address, &e))?;
        Ok(body.node_id)
    }

    async fn fetch_since(&self, address: &str, query: &PullQuery) -> Result<PullPage> {
        let url = format!("{}/api/sync", base_url(address));
        let response = self
            .client
            .get(url)
            .query(query)
            .send()
            .await
            .map_err(|e| request_error(address, &e))?;
        let body: PullResponse = check_status(address, response)
            .await?
            .json()
            .await
            .map_err(|e| request_error(address, &e))?;
        Ok(PullPage::from_rows(body.data))
    }

    async fn push(&self, address: &str, report: &LocationReport) -> Result<PushAck> {
        let url = format!("{}/api/locations/", base_url(address));
        let response = self
            .client
            .post(url)
            .json(&ReportDraft::from(report))
            .send()
            .await
            .map_err(|e| request_error(address, &e))?;
        let response = check_status(address, response).await?;
        Ok(if response.status() == StatusCode::CREATED {
            PushAck::Stored
        } else {
            PushAck::Duplicate
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_bare_address() {
        assert_eq!(base_url("169.254.3.4:5000"), "http://169.254.3.4:5000");
    }

    #[test]
    fn test_base_url_keeps_scheme_and_trims_slash() {
        assert_eq!(base_url("http://10.0.0.1:8080/"), "http://10.0.0.1:8080");
        assert_eq!(base_url("https://node.example"), "https://node.example");
    }

    #[test]
    fn test_new_builds_client() {
        assert!(HttpTransport::new(Duration::from_secs(1)).is_ok());
    }

    #[tokio::test]
    async fn test_unreachable_peer_is_retryable_error() {
        let transport = HttpTransport::new(Duration::from_millis(500)).unwrap();
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let err = transport
            .node_id(&format!("127.0.0.1:{port}"))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }
}
