//! HTTP client for webhook delivery.
//!
//! Builds the POST for one push attempt and reports whatever the endpoint
//! answered. Deciding whether a response counts as delivered belongs to
//! [`PushResponse::into_result`], so tests can inspect raw responses.

use std::{collections::HashMap, time::Duration};

use pgbus_core::models::{ClientId, MessageEnvelope, MessageId};
use reqwest::{header::HeaderMap, Response, Url};
use serde::{Deserialize, Serialize};
use tracing::{debug, info_span, warn, Instrument};

use crate::error::{DeliveryError, Result};

/// Header carrying the message id.
pub const MESSAGE_ID_HEADER: &str = "X-Pgbus-Message-Id";

/// Header carrying the receiving client id.
pub const CLIENT_ID_HEADER: &str = "X-Pgbus-Client-Id";

/// Header carrying the 1-based attempt number.
pub const ATTEMPT_HEADER: &str = "X-Pgbus-Attempt";

/// Response bodies are kept up to this many bytes for `last_error`.
const MAX_BODY_EXCERPT: usize = 1024;

const DEFAULT_RETRY_AFTER: u64 = 60;

/// Configuration for the webhook client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Timeout for one HTTP request.
    pub timeout: Duration,
    /// User agent string for requests.
    pub user_agent: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(crate::DEFAULT_TIMEOUT_SECONDS),
            user_agent: concat!("pgbus/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// Pooled HTTP client shared by all push workers.
#[derive(Debug, Clone)]
pub struct PushClient {
    client: reqwest::Client,
    config: ClientConfig,
}

/// One webhook attempt.
#[derive(Debug, Clone)]
pub struct PushRequest {
    /// Destination from the subscription.
    pub url: String,
    /// Receiving client.
    pub client_id: ClientId,
    /// Attempt number (1-based).
    pub attempt_number: u32,
    /// JSON body.
    pub envelope: MessageEnvelope,
}

impl PushRequest {
    /// Message being delivered.
    pub fn message_id(&self) -> MessageId {
        self.envelope.id
    }
}

/// What the endpoint answered.
#[derive(Debug, Clone)]
pub struct PushResponse {
    /// HTTP status code.
    pub status_code: u16,
    /// Response headers, lowercase names.
    pub headers: HashMap<String, String>,
    /// Response body excerpt.
    pub body: String,
    /// Round trip time.
    pub duration: Duration,
}

impl PushResponse {
    /// True for 2xx.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    /// Maps a non-2xx answer to a [`DeliveryError`].
    ///
    /// # Errors
    ///
    /// `RateLimited` for 429, `ClientError` for other 4xx and `ServerError`
    /// for everything else outside 2xx.
    pub fn into_result(self) -> Result<Self> {
        if self.is_success() {
            return Ok(self);
        }
        if self.status_code == 429 {
            let retry_after =
                extract_retry_after_seconds(&self.headers).unwrap_or(DEFAULT_RETRY_AFTER);
            return Err(DeliveryError::rate_limited(retry_after));
        }
        Err(DeliveryError::from_status(self.status_code, self.body))
    }
}

impl PushClient {
    /// Creates a client with the given configuration.
    ///
    /// Redirects are not followed: a 3xx answer is a failed attempt, so a
    /// redirect to a page that answers `GET` never counts as delivered.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` if the HTTP client cannot
    /// be built.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| {
                DeliveryError::configuration(format!("failed to build HTTP client: {e}"))
            })?;

        Ok(Self { client, config })
    }

    /// Creates a client with default configuration.
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be built.
    pub fn with_defaults() -> Result<Self> {
        Self::new(ClientConfig::default())
    }

    /// Client configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// POSTs the envelope to the webhook.
    ///
    /// Any HTTP response, including non-2xx, is `Ok`.
    ///
    /// # Errors
    ///
    /// - `ConfigurationError` when the URL is not an absolute http(s) URL
    /// - `Timeout` when the request exceeds the configured timeout
    /// - `NetworkError` for connection and transport failures
    pub async fn deliver(&self, request: &PushRequest) -> Result<PushResponse> {
        let url = parse_webhook_url(&request.url)?;
        let start_time = std::time::Instant::now();

        let span = info_span!(
            "webhook_delivery",
            message_id = %request.message_id(),
            client_id = %request.client_id,
            url = %url,
            attempt = request.attempt_number
        );

        async move {
            debug!("starting webhook delivery");

            let result = self
                .client
                .post(url)
                .header(MESSAGE_ID_HEADER, request.message_id().to_string())
                .header(CLIENT_ID_HEADER, request.client_id.as_str())
                .header(ATTEMPT_HEADER, request.attempt_number.to_string())
                .json(&request.envelope)
                .send()
                .await;

            let response = match result {
                Ok(response) => response,
                Err(e) => {
                    let duration = start_time.elapsed();
                    warn!(duration_ms = duration.as_millis(), error = %e, "webhook request failed");

                    if e.is_timeout() {
                        return Err(DeliveryError::timeout(self.config.timeout));
                    }
                    if e.is_connect() {
                        return Err(DeliveryError::network(format!("connection failed: {e}")));
                    }
                    return Err(DeliveryError::network(e.to_string()));
                },
            };

            let push_response = parse_response(response, start_time.elapsed()).await;

            if push_response.is_success() {
                debug!(
                    status = push_response.status_code,
                    duration_ms = push_response.duration.as_millis(),
                    "webhook accepted"
                );
            } else {
                warn!(
                    status = push_response.status_code,
                    duration_ms = push_response.duration.as_millis(),
                    "webhook rejected"
                );
            }

            Ok(push_response)
        }
        .instrument(span)
        .await
    }
}

/// Accepts absolute `http` and `https` URLs only.
fn parse_webhook_url(raw: &str) -> Result<Url> {
    let url = Url::parse(raw.trim())
        .map_err(|e| DeliveryError::configuration(format!("invalid webhook URL {raw:?}: {e}")))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        scheme => Err(DeliveryError::configuration(format!(
            "unsupported webhook URL scheme {scheme:?}"
        ))),
    }
}

async fn parse_response(response: Response, duration: Duration) -> PushResponse {
    let status_code = response.status().as_u16();
    let headers = extract_headers(response.headers());

    let body = match response.bytes().await {
        Ok(bytes) if bytes.len() > MAX_BODY_EXCERPT => {
            let truncated = String::from_utf8_lossy(&bytes[..MAX_BODY_EXCERPT]);
            format!("{truncated}... (truncated)")
        },
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) => {
            warn!(error = %e, "failed to read response body");
            format!("[failed to read response body: {e}]")
        },
    };

    PushResponse { status_code, headers, body, duration }
}

fn extract_headers(header_map: &HeaderMap) -> HashMap<String, String> {
    header_map
        .iter()
        .filter_map(|(key, value)| {
            value.to_str().ok().map(|v| (key.as_str().to_ascii_lowercase(), v.to_string()))
        })
        .collect()
}

/// Parses `Retry-After` as seconds or an HTTP date.
///
/// Returns `None` without the header; an unparseable value yields a 60s
/// default.
pub fn extract_retry_after_seconds<S: std::hash::BuildHasher>(
    headers: &HashMap<String, String, S>,
) -> Option<u64> {
    let retry_after = headers.get("retry-after")?;

    if let Ok(seconds) = retry_after.trim().parse::<u64>() {
        return Some(seconds);
    }

    if let Ok(date_time) = chrono::DateTime::parse_from_rfc2822(retry_after) {
        let now = chrono::Utc::now();
        let retry_time = date_time.with_timezone(&chrono::Utc);
        if let Ok(delay) = retry_time.signed_duration_since(now).to_std() {
            return Some(delay.as_secs());
        }
        return Some(0);
    }

    Some(DEFAULT_RETRY_AFTER)
}
