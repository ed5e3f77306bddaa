//! Vendor HTTP API client: identity lookup and recovery requests.

use std::time::Duration;

use async_trait::async_trait;

use crate::connector::{BookmakerIdentity, IdentityResolver};
use crate::envelope::scan_root;
use crate::error::{ApiError, FeedError};
use crate::recovery::{ApiReply, RecoveryApi, RecoveryCall};

const TOKEN_HEADER: &str = "x-access-token";

/// Authenticated client for the vendor REST API.
#[derive(Clone)]
pub struct VendorApiClient {
    client: reqwest::Client,
    base_url: String,
    access_token: String,
}

impl VendorApiClient {
    pub fn new(
        base_url: impl Into<String>,
        access_token: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ApiError> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ApiError::Request {
                url: base_url.clone(),
                message: e.to_string(),
            })?;
        Ok(Self {
            client,
            base_url,
            access_token: access_token.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn transport_error(url: &str, e: reqwest::Error) -> ApiError {
        if e.is_timeout() {
            ApiError::Timeout {
                url: url.to_string(),
            }
        } else {
            ApiError::Request {
                url: url.to_string(),
                message: e.to_string(),
            }
        }
    }

    /// `GET /users/whoami.xml`
    pub async fn fetch_identity(&self) -> Result<BookmakerIdentity, ApiError> {
        let url = self.url("/users/whoami.xml");
        let resp = self
            .client
            .get(&url)
            .header(TOKEN_HEADER, &self.access_token)
            .send()
            .await
            .map_err(|e| Self::transport_error(&url, e))?;

        let status = resp.status().as_u16();
        let body = resp
            .text()
            .await
            .map_err(|e| Self::transport_error(&url, e))?;
        if status != 200 {
            return Err(ApiError::Status { url, status, body });
        }

        parse_identity(&body).ok_or_else(|| ApiError::Malformed {
            url,
            message: "expected <bookmaker_details bookmaker_id=.. virtual_host=..>".to_string(),
        })
    }
}

/// Read `bookmaker_id` and `virtual_host` off the `bookmaker_details` root.
pub fn parse_identity(body: &str) -> Option<BookmakerIdentity> {
    let root = scan_root(body.as_bytes())?;
    if root.name != "bookmaker_details" {
        return None;
    }
    let bookmaker_id = root.attr("bookmaker_id")?.to_string();
    let virtual_host = root.attr("virtual_host")?.to_string();
    if virtual_host.is_empty() {
        return None;
    }
    Some(BookmakerIdentity {
        bookmaker_id,
        virtual_host,
    })
}

#[async_trait]
impl IdentityResolver for VendorApiClient {
    async fn whoami(&self) -> Result<BookmakerIdentity, FeedError> {
        self.fetch_identity()
            .await
            .map_err(|e| FeedError::Identity(e.to_string()))
    }
}

#[async_trait]
impl RecoveryApi for VendorApiClient {
    async fn initiate(&self, call: &RecoveryCall) -> Result<ApiReply, ApiError> {
        let url = self.url(&call.path());
        let resp = self
            .client
            .post(&url)
            .header(TOKEN_HEADER, &self.access_token)
            .query(&call.query())
            .send()
            .await
            .map_err(|e| Self::transport_error(&url, e))?;

        let status = resp.status().as_u16();
        let body = resp
            .text()
            .await
            .map_err(|e| Self::transport_error(&url, e))?;
        tracing::debug!(url = %url, status, body = %body, "recovery response");
        Ok(ApiReply { status, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recovery::RecoveryScope;
    use httpmock::prelude::*;

    #[test]
    fn test_parse_identity() {
        let body = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<bookmaker_details response_code="OK" expire_at="2030-01-01T00:00:00Z" bookmaker_id="12345" virtual_host="/unifiedfeed/12345"/>"#;

        let identity = parse_identity(body).unwrap();

        assert_eq!(identity.bookmaker_id, "12345");
        assert_eq!(identity.virtual_host, "/unifiedfeed/12345");
    }

    #[test]
    fn test_parse_identity_rejects_other_documents() {
        assert!(parse_identity(r#"<error message="unauthorized"/>"#).is_none());
        assert!(parse_identity("not xml").is_none());
    }

    #[tokio::test]
    async fn test_whoami_sends_token() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/users/whoami.xml")
                    .header("x-access-token", "tok");
                then.status(200)
                    .body(r#"<bookmaker_details bookmaker_id="7" virtual_host="/unifiedfeed/7"/>"#);
            })
            .await;

        let client = VendorApiClient::new(server.base_url(), "tok", Duration::from_secs(5)).unwrap();
        let identity = client.whoami().await.unwrap();

        mock.assert_async().await;
        assert_eq!(identity.virtual_host, "/unifiedfeed/7");
    }

    #[tokio::test]
    async fn test_whoami_unauthorized_is_identity_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/users/whoami.xml");
                then.status(401).body("<error/>");
            })
            .await;

        let client = VendorApiClient::new(server.base_url(), "bad", Duration::from_secs(5)).unwrap();
        let err = client.whoami().await.unwrap_err();

        assert!(err.is_identity());
    }

    #[tokio::test]
    async fn test_recovery_post_carries_query() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/pre/recovery/initiate_request")
                    .query_param("after", "1000")
                    .query_param("request_id", "5")
                    .query_param("node_id", "1")
                    .header("x-access-token", "tok");
                then.status(202).body("<response response_code=\"ACCEPTED\"/>");
            })
            .await;

        let client = VendorApiClient::new(server.base_url(), "tok", Duration::from_secs(5)).unwrap();
        let reply = client
            .initiate(&RecoveryCall {
                product: "pre".into(),
                scope: RecoveryScope::Product,
                request_id: 5,
                node_id: 1,
                after: Some(1000),
            })
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(reply.status, 202);
    }
}
