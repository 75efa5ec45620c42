//! HTTP transport to a timestamp authority

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{Client, Url};
use tracing::{debug, info, warn};

use super::messages::{TimeStampReq, TimeStampResp};
use super::token::TimestampToken;
use super::{Result, TsaError};
use crate::digest::HashAlgorithm;

pub const QUERY_CONTENT_TYPE: &str = "application/timestamp-query";
pub const REPLY_CONTENT_TYPE: &str = "application/timestamp-reply";

pub const DEFAULT_TSA_URL: &str = "http://timestamp.digicert.com";
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_ATTEMPTS: u32 = 1;
pub const DEFAULT_USER_AGENT: &str = concat!("timeseal/", env!("CARGO_PKG_VERSION"));

/// Anything that can turn a digest into a timestamp token.
#[async_trait]
pub trait TimestampAuthority: Send + Sync {
    async fn request_timestamp(
        &self,
        digest: &[u8],
        algorithm: HashAlgorithm,
    ) -> Result<TimestampToken>;

    /// Where requests go, for logs.
    fn endpoint(&self) -> &str;
}

/// Transport settings for [`HttpTimestampClient`]
#[derive(Debug, Clone)]
pub struct TsaClientConfig {
    pub url: String,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    /// Total attempts for transport failures; 1 disables retries
    pub max_attempts: u32,
    pub user_agent: String,
    pub policy_oid: Option<String>,
    /// Send one request at construction to confirm the endpoint answers
    pub probe: bool,
}

impl Default for TsaClientConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_TSA_URL.to_string(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            policy_oid: None,
            probe: true,
        }
    }
}

/// RFC 3161 client over HTTP(S)
pub struct HttpTimestampClient {
    client: Client,
    url: Url,
    config: TsaClientConfig,
}

impl std::fmt::Debug for HttpTimestampClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTimestampClient")
            .field("url", &self.url.as_str())
            .field("max_attempts", &self.config.max_attempts)
            .finish()
    }
}

/// Parse and check an authority URL: absolute, http or https, with a host.
pub fn validate_url(raw: &str) -> Result<Url> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(TsaError::InvalidUrl("URL is empty".into()));
    }
    let url = Url::parse(trimmed).map_err(|e| TsaError::InvalidUrl(format!("{}: {}", trimmed, e)))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(TsaError::InvalidUrl(format!(
            "{}: scheme must be http or https",
            trimmed
        )));
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(TsaError::InvalidUrl(format!("{}: missing host", trimmed)));
    }
    Ok(url)
}

impl HttpTimestampClient {
    /// Build the client without touching the network.
    pub fn new(config: TsaClientConfig) -> Result<Self> {
        let url = validate_url(&config.url)?;
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .user_agent(&config.user_agent)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .map_err(|e| TsaError::Network(e.to_string()))?;

        Ok(Self {
            client,
            url,
            config,
        })
    }

    /// Build the client and, when configured, confirm the endpoint answers.
    pub async fn connect(config: TsaClientConfig) -> Result<Self> {
        let client = Self::new(config)?;
        if client.config.probe {
            client.probe().await?;
        }
        info!(url = %client.url, "Timestamp authority ready");
        Ok(client)
    }

    /// One GET to the endpoint. Any HTTP response, whatever its status,
    /// shows the server is reachable.
    pub async fn probe(&self) -> Result<()> {
        let response = self
            .client
            .get(self.url.clone())
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        debug!(url = %self.url, status = response.status().as_u16(), "TSA probe answered");
        Ok(())
    }

    /// POST with retry on transport failures
    async fn post(&self, body: &[u8]) -> Result<Bytes> {
        let attempts_allowed = self.config.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;

            match self.post_once(body).await {
                Ok(bytes) => {
                    if attempt > 1 {
                        debug!(url = %self.url, attempt, "TSA request succeeded after retry");
                    }
                    return Ok(bytes);
                }
                Err(e) if e.is_network() && attempt < attempts_allowed => {
                    warn!(url = %self.url, attempt, error = %e, "TSA request failed, retrying");

                    // Exponential backoff: 1s, 2s, 4s
                    let backoff = Duration::from_secs(2u64.pow(attempt - 1));
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn post_once(&self, body: &[u8]) -> Result<Bytes> {
        debug!(url = %self.url, size = body.len(), "Sending timestamp query");

        let response = self
            .client
            .post(self.url.clone())
            .header(CONTENT_TYPE, QUERY_CONTENT_TYPE)
            .header(ACCEPT, REPLY_CONTENT_TYPE)
            .body(body.to_vec())
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TsaError::Network(format!(
                "HTTP {}: {}",
                status.as_u16(),
                status.canonical_reason().unwrap_or("Unknown")
            )));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        if !is_reply_content_type(content_type.as_deref()) {
            warn!(
                url = %self.url,
                content_type = content_type.as_deref().unwrap_or("<none>"),
                "Unexpected TSA response content type, decoding anyway"
            );
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| self.transport_error(e))?;

        debug!(url = %self.url, size = bytes.len(), "Timestamp reply received");
        Ok(bytes)
    }

    fn transport_error(&self, e: reqwest::Error) -> TsaError {
        if e.is_timeout() {
            TsaError::Timeout(self.config.request_timeout)
        } else {
            TsaError::Network(e.to_string())
        }
    }
}

fn is_reply_content_type(value: Option<&str>) -> bool {
    value
        .and_then(|v| v.parse::<mime::Mime>().ok())
        .is_some_and(|m| m.essence_str() == REPLY_CONTENT_TYPE)
}

#[async_trait]
impl TimestampAuthority for HttpTimestampClient {
    async fn request_timestamp(
        &self,
        digest: &[u8],
        algorithm: HashAlgorithm,
    ) -> Result<TimestampToken> {
        if digest.len() != algorithm.output_len() {
            return Err(TsaError::Protocol(format!(
                "{} digest must be {} bytes, got {}",
                algorithm,
                algorithm.output_len(),
                digest.len()
            )));
        }

        let request = TimeStampReq::new(algorithm, digest.to_vec(), self.config.policy_oid.clone());
        let body = request
            .to_der()
            .map_err(|e| TsaError::Protocol(format!("cannot encode request: {}", e)))?;

        let reply = self.post(&body).await?;
        let response = TimeStampResp::from_der(&reply)?;

        if !response.status.status.is_granted() {
            return Err(TsaError::Protocol(format!(
                "request not granted: {}",
                response.status.describe()
            )));
        }
        let token_der = response
            .token
            .ok_or_else(|| TsaError::Protocol("granted response carries no token".into()))?;
        let token = TimestampToken::from_der(token_der)?;
        token.verify_matches(&request)?;

        info!(
            url = %self.url,
            serial = %token.serial_hex(),
            gen_time = %token.gen_time(),
            certificates = token.has_certificates(),
            "Timestamp token granted"
        );
        Ok(token)
    }

    fn endpoint(&self) -> &str {
        self.url.as_str()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_config_defaults() {
        let config = TsaClientConfig::default();
        assert_eq!(config.url, "http://timestamp.digicert.com");
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.max_attempts, 1);
        assert!(config.user_agent.starts_with("timeseal/"));
        assert!(config.probe);
    }

    #[test]
    fn test_url_validation() {
        assert!(validate_url("https://freetsa.org/tsr").is_ok());
        assert!(matches!(validate_url(""), Err(TsaError::InvalidUrl(_))));
        assert!(matches!(validate_url("ftp://example.com"), Err(TsaError::InvalidUrl(_))));
        assert!(matches!(validate_url("not a url"), Err(TsaError::InvalidUrl(_))));
    }

    #[test]
    fn test_reply_content_type_matching() {
        assert!(is_reply_content_type(Some("application/timestamp-reply")));
        assert!(is_reply_content_type(Some("application/timestamp-reply; charset=binary")));
        assert!(!is_reply_content_type(Some("text/html")));
        assert!(!is_reply_content_type(None));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_network_error() {
        let config = TsaClientConfig {
            // Port 9 (discard) on localhost is closed in test environments
            url: "http://127.0.0.1:9/".into(),
            connect_timeout: Duration::from_millis(500),
            request_timeout: Duration::from_secs(1),
            ..TsaClientConfig::default()
        };
        let err = HttpTimestampClient::connect(config).await.unwrap_err();
        assert!(err.is_network(), "unexpected error: {err}");
    }

    #[tokio::test]
    async fn test_wrong_digest_length_fails_before_sending() {
        let client = HttpTimestampClient::new(TsaClientConfig {
            url: "http://127.0.0.1:9/".into(),
            probe: false,
            ..TsaClientConfig::default()
        })
        .unwrap();
        let err = client
            .request_timestamp(&[0u8; 20], HashAlgorithm::Sha256)
            .await
            .unwrap_err();
        assert!(matches!(err, TsaError::Protocol(_)));
    }
}
